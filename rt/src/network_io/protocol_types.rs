// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Wire types for the actor protocol.
//!
//! Everything that crosses a socket is defined here: the actor identity
//! exchanged during the handshake, the tagged [`Packet`] record, the packed
//! error payload, and the runtime-variables record a parent sends a freshly
//! spawned child. The wire unit is `Option<Packet>` - `None` (msgpack nil) is
//! the message-loop terminate sentinel.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use uuid::Uuid;

/// Type alias for type to read from the stream to get the length prefix.
pub type LengthPrefixType = u32;
/// Type aliases for the payload buffer type.
pub type Buffer = Vec<BufferAtom>;
pub type BufferAtom = u8;

/// A `(host, port)` pair naming an actor's inbound listener.
pub type NetAddr = (String, u16);

/// Actor identity: `(name, instance-id)`.
///
/// `name` is the human label; `instance-id` is a fresh random identifier per
/// process, so two actors sharing a name are still distinct peers. Serializes
/// as a 2-tuple of text, which is exactly the first frame each side sends
/// after TCP connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uid(pub String, pub String);

impl Uid {
    /// Mint an identity for `name` with a fresh random instance-id.
    #[must_use]
    pub fn generate(name: impl Into<String>) -> Self {
        Self(name.into(), Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn name(&self) -> &str { &self.0 }

    #[must_use]
    pub fn instance(&self) -> &str { &self.1 }
}

impl Display for Uid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // Keep log lines short: 8 chars of the instance-id is plenty.
        let short = self.1.get(..8).unwrap_or(&self.1);
        write!(f, "{}[{}]", self.0, short)
    }
}

/// Per-invocation identifier, fresh per outbound call. Only `(peer-uid,
/// call-id)` is globally unique; the id alone is scoped to the issuing actor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    #[must_use]
    pub fn fresh() -> Self { Self(Uuid::new_v4().to_string()) }
}

impl Display for CallId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let short = self.0.get(..8).unwrap_or(&self.0);
        write!(f, "{short}")
    }
}

/// Reply shape announced by the callee once an invocation has started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FuncType {
    #[serde(rename = "asyncfunc")]
    AsyncFunc,
    #[serde(rename = "asyncgen")]
    AsyncGen,
    #[serde(rename = "context")]
    Context,
}

impl Display for FuncType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AsyncFunc => write!(f, "asyncfunc"),
            Self::AsyncGen => write!(f, "asyncgen"),
            Self::Context => write!(f, "context"),
        }
    }
}

/// A failure packed for the return trip: the logical error class survives the
/// hop while the concrete type does not. The caller reconstructs it as a
/// single wrapper error whose `kind` field equals the original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedError {
    /// Logical error class, e.g. `assertion-error`, `module-not-exposed`.
    pub kind: String,
    /// Human readable message.
    pub message: String,
    /// Remote traceback text (the callee-side error chain, for diagnostics).
    pub traceback: String,
    /// Which actor the failure came from.
    pub src: Uid,
}

/// One wire message. Exactly one of these shapes per frame; the `Option`
/// wrapper around it makes msgpack nil the connection sentinel.
///
/// `kwargs` and `value` are nested msgpack documents ([`ByteBuf`]), typed at
/// the portal / dispatcher layers rather than here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Packet {
    /// Request to invoke `ns.func` with `kwargs`; replies flow back tagged
    /// with `cid`.
    Cmd {
        ns: String,
        func: String,
        kwargs: ByteBuf,
        caller: Uid,
        cid: CallId,
    },
    /// Invocation started; announces the reply shape.
    Functype { kind: FuncType, cid: CallId },
    /// One element of a stream.
    Yield { value: ByteBuf, cid: CallId },
    /// Stream terminator.
    Stop { cid: CallId },
    /// Single value reply.
    Return { value: ByteBuf, cid: CallId },
    /// Failure reply. A missing `cid` marks a channel-level (internal)
    /// failure that affects every call routed through the channel.
    Error {
        error: PackedError,
        cid: Option<CallId>,
    },
}

impl Packet {
    /// The call-id this packet is routed by, if any.
    #[must_use]
    pub fn cid(&self) -> Option<&CallId> {
        match self {
            Self::Cmd { cid, .. }
            | Self::Functype { cid, .. }
            | Self::Yield { cid, .. }
            | Self::Stop { cid }
            | Self::Return { cid, .. } => Some(cid),
            Self::Error { cid, .. } => cid.as_ref(),
        }
    }
}

/// Runtime variables applied by a child before it starts its listener.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeVars {
    pub is_root: bool,
    pub loglevel: Option<String>,
    /// Listener address of the root-most actor in the tree.
    pub root_mailbox: Option<NetAddr>,
}

/// The record a parent sends its child immediately after the uid handshake.
/// The child applies it before binding its listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentHello {
    pub bind_host: String,
    pub bind_port: u16,
    pub arbiter_addr: Option<NetAddr>,
    pub runtime_vars: RuntimeVars,
}

#[cfg(test)]
mod tests_protocol_types {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::msgpack_serde;

    #[test]
    fn test_uid_is_a_two_tuple_of_text() {
        let uid = Uid::generate("echo");
        let bytes = msgpack_serde::try_serialize(&uid).unwrap();
        // A peer that knows nothing of `Uid` can still read the pair.
        let raw: (String, String) = msgpack_serde::try_deserialize(&bytes).unwrap();
        assert_eq!(raw.0, "echo");
        assert_eq!(raw.1, uid.instance());
    }

    #[test]
    fn test_same_name_distinct_instance() {
        let a = Uid::generate("worker");
        let b = Uid::generate("worker");
        assert_eq!(a.name(), b.name());
        assert_ne!(a.instance(), b.instance());
        assert_ne!(a, b);
    }

    #[test]
    fn test_packet_round_trip() {
        let pkt = Packet::Cmd {
            ns: "mod".into(),
            func: "frob".into(),
            kwargs: serde_bytes::ByteBuf::from(
                msgpack_serde::try_serialize(&42u8).unwrap(),
            ),
            caller: Uid::generate("caller"),
            cid: CallId::fresh(),
        };
        let bytes = msgpack_serde::try_serialize(&Some(pkt.clone())).unwrap();
        let back: Option<Packet> = msgpack_serde::try_deserialize(&bytes).unwrap();
        match back {
            Some(Packet::Cmd { ns, func, cid, .. }) => {
                assert_eq!(ns, "mod");
                assert_eq!(func, "frob");
                assert_eq!(Some(&cid), pkt.cid());
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn test_sentinel_round_trip() {
        let bytes = msgpack_serde::try_serialize(&Option::<Packet>::None).unwrap();
        let back: Option<Packet> = msgpack_serde::try_deserialize(&bytes).unwrap();
        assert!(back.is_none());
    }
}
