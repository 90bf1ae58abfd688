// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Error model of the runtime.
//!
//! A failure in a callee never crosses the wire as its concrete type. It is
//! packed into `(kind, message, traceback, src-uid)` and re-raised at the
//! caller as a single wrapper - [`RemoteActorError`] - whose `kind` field
//! equals the original class. The original type is never impersonated.

use std::fmt::{Display, Formatter};

use crate::{CodecError, PackedError, TransportError, Uid};

/// Well-known error kinds. User code may ship any kind string it likes;
/// these are the ones the runtime itself produces or gives meaning to.
pub mod kind {
    /// RPC target module/function not in the allow-list.
    pub const MODULE_NOT_EXPOSED: &str = "module-not-exposed";
    /// kwargs failed to bind to the target's parameters.
    pub const ARGUMENT_ERROR: &str = "argument-error";
    /// A `context` invocation was cancelled (carries the originator).
    pub const CONTEXT_CANCELLED: &str = "context-cancelled";
    /// Channel reset / clean close mid-exchange.
    pub const TRANSPORT_CLOSED: &str = "transport-closed";
    /// Multiple children failed concurrently.
    pub const COMPOSITE_CANCEL: &str = "composite-cancel";
    /// Cancellation originating in the scheduler bridge.
    pub const BRIDGE_CANCELLED: &str = "bridge-cancelled";
    /// Plain cooperative cancellation.
    pub const CANCELLED: &str = "cancelled";
    /// The invocation task panicked.
    pub const PANIC: &str = "panic";
    /// Target was not an async callable of the announced shape.
    pub const TYPE_ERROR: &str = "type-error";
    /// Fallback for error classes the caller cannot classify.
    pub const UNKNOWN: &str = "unknown";
}

/// The error type user handler code returns: a kind string plus a message.
/// The kind survives the wire verbatim.
#[derive(Debug, Clone, thiserror::Error)]
#[error("[{kind}] {message}")]
pub struct UserError {
    pub kind: String,
    pub message: String,
}

impl UserError {
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<CodecError> for UserError {
    fn from(err: CodecError) -> Self {
        Self::new(kind::TYPE_ERROR, err.to_string())
    }
}

/// The caller-side wrapper for any failure shipped back from a callee. The
/// `kind` field carries the original error class.
#[derive(Debug, Clone, thiserror::Error)]
#[error("remote actor {src} failed: [{kind}] {message}")]
pub struct RemoteActorError {
    pub kind: String,
    pub message: String,
    /// Remote traceback text, for diagnostics only.
    pub traceback: String,
    /// The actor the failure came from.
    pub src: Uid,
}

/// Pack a failure for the return trip.
#[must_use]
pub fn pack_error(
    error_kind: &str,
    message: impl Into<String>,
    traceback: impl Into<String>,
    src: &Uid,
) -> PackedError {
    let packed_kind = if error_kind.is_empty() {
        kind::UNKNOWN.to_string()
    } else {
        error_kind.to_string()
    };
    PackedError {
        kind: packed_kind,
        message: message.into(),
        traceback: traceback.into(),
        src: src.clone(),
    }
}

/// Pack a [`UserError`] raised by handler code.
#[must_use]
pub fn pack_user_error(err: &UserError, src: &Uid) -> PackedError {
    pack_error(&err.kind, err.message.clone(), format!("{err:?}"), src)
}

/// Reconstruct the wrapper on the caller side.
#[must_use]
pub fn unpack_error(packed: PackedError) -> RemoteActorError {
    RemoteActorError {
        kind: if packed.kind.is_empty() {
            kind::UNKNOWN.to_string()
        } else {
            packed.kind
        },
        message: packed.message,
        traceback: packed.traceback,
        src: packed.src,
    }
}

/// What a caller-side operation (portal call, stream step, context step) can
/// fail with.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The callee shipped a failure; original kind preserved.
    #[error(transparent)]
    Remote(#[from] RemoteActorError),

    /// The channel died mid-exchange; every in-flight call bound to it gets
    /// this.
    #[error("transport closed mid-exchange")]
    TransportClosed,

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The peer violated the reply protocol (e.g. a `yield` for an
    /// `asyncfunc` call).
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Codec(codec) => Self::Codec(codec),
            err if err.is_peer_gone() => Self::TransportClosed,
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl RpcError {
    /// The logical error class, uniform across local and remote failures.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Remote(err) => &err.kind,
            Self::TransportClosed => kind::TRANSPORT_CLOSED,
            Self::Codec(_) => kind::TYPE_ERROR,
            Self::Protocol(_) => kind::UNKNOWN,
        }
    }

    #[must_use]
    pub fn is_cancel_like(&self) -> bool {
        matches!(
            self.kind(),
            kind::CANCELLED | kind::CONTEXT_CANCELLED | kind::BRIDGE_CANCELLED
        )
    }
}

/// Aggregated child failures raised from a nursery scope.
#[derive(Debug)]
pub struct CompositeError {
    pub errors: Vec<RpcError>,
}

impl std::error::Error for CompositeError {}

impl Display for CompositeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} child failure(s):", self.errors.len())?;
        for err in &self.errors {
            write!(f, " [{}] {err};", err.kind())?;
        }
        Ok(())
    }
}

impl CompositeError {
    /// A composite of only cancellations is a cancellation, not an error.
    #[must_use]
    pub fn is_only_cancels(&self) -> bool {
        !self.errors.is_empty() && self.errors.iter().all(RpcError::is_cancel_like)
    }
}

impl From<CompositeError> for UserError {
    /// Lets a handler that runs its own nursery propagate the aggregate; the
    /// caller sees the dedicated composite kind.
    fn from(err: CompositeError) -> Self {
        Self::new(kind::COMPOSITE_CANCEL, err.to_string())
    }
}

/// Internal (non-RPC) failures of the actor machinery itself.
#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The peer reported a channel-level failure (an `error` frame without a
    /// call-id).
    #[error("peer reported channel-level failure: {0}")]
    PeerInternal(RemoteActorError),

    /// Fatal startup problem (parent unreachable, listener bind failure,
    /// missing module table).
    #[error("actor startup failed: {0}")]
    Startup(String),

    /// The arbiter could not be reached / the call failed.
    #[error("registry unavailable: {0}")]
    Registry(String),
}

#[cfg(test)]
mod tests_errors {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_kind_survives_pack_unpack() {
        let src = Uid::generate("callee");
        let packed = pack_user_error(
            &UserError::new("assertion-error", "assert failed"),
            &src,
        );
        let unpacked = unpack_error(packed);
        assert_eq!(unpacked.kind, "assertion-error");
        assert_eq!(unpacked.src, src);
    }

    #[test]
    fn test_unknown_kind_fallback() {
        let src = Uid::generate("callee");
        let unpacked = unpack_error(pack_error("", "mystery", "", &src));
        assert_eq!(unpacked.kind, kind::UNKNOWN);
        assert_eq!(unpacked.message, "mystery");
    }

    #[test]
    fn test_composite_of_only_cancels() {
        let src = Uid::generate("callee");
        let cancelled = || {
            RpcError::Remote(unpack_error(pack_error(
                kind::CANCELLED,
                "c",
                "",
                &src,
            )))
        };
        let composite = CompositeError {
            errors: vec![cancelled(), cancelled()],
        };
        assert!(composite.is_only_cancels());

        let mixed = CompositeError {
            errors: vec![
                cancelled(),
                RpcError::Remote(unpack_error(pack_error(
                    "assertion-error",
                    "a",
                    "",
                    &src,
                ))),
            ],
        };
        assert!(!mixed.is_only_cancels());
    }
}
