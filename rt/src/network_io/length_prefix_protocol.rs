// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! This module is standalone, you can use it in any project that needs to
//! communicate between two peers using a length-prefix, binary payload,
//! protocol.
//!
//! Each frame is a [`LengthPrefixType`] (u32, little-endian) length followed
//! by that many payload bytes. A zero-length read on the prefix is
//! end-of-stream and surfaces as [`TransportError::Closed`]; a connection
//! reset surfaces as [`TransportError::Broken`]. Both count as the transport
//! being gone - message loops exit cleanly on either - but callers that care
//! can tell them apart.

use std::time::Duration;

use tokio::{io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
            time::timeout};

use crate::{CodecError, LengthPrefixType, Uid, msgpack_serde};

pub mod protocol_constants {
    use super::Duration;

    /// Upper bound on a single frame's payload.
    pub const MAX_PAYLOAD_SIZE: u32 = 10_000_000;
    /// Budget for the uid handshake after TCP connect.
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);
    /// Fixed poll interval between reconnect attempts.
    pub const RECONNECT_POLL: Duration = Duration::from_secs(1);
    /// Per-attempt budget for one reconnect `connect()`.
    pub const RECONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);
}

/// Transport-level failures, split so the message loop can treat peer-gone
/// conditions (clean close, reset) differently from real I/O trouble.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer closed the stream cleanly (EOF before/inside a frame).
    #[error("transport was closed by the peer")]
    Closed,

    /// The connection was reset / broke mid-frame.
    #[error("transport was broken: {0}")]
    Broken(#[source] std::io::Error),

    /// `connect()` was refused or failed outright.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A frame announced a payload larger than
    /// [`protocol_constants::MAX_PAYLOAD_SIZE`].
    #[error("frame payload of {0} bytes exceeds the protocol limit")]
    FrameTooLarge(u32),

    /// The peer's handshake reply was not a `(name, instance-id)` pair, or it
    /// never arrived.
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Any other I/O failure on the stream.
    #[error("i/o failure on transport: {0}")]
    Io(std::io::Error),
}

impl TransportError {
    /// True when the peer is simply gone (clean close or reset) - the
    /// conditions a message loop exits cleanly on, never treating them as an
    /// RPC error.
    #[must_use]
    pub fn is_peer_gone(&self) -> bool {
        matches!(self, Self::Closed | Self::Broken(_))
    }

    /// True only for the reset/broken flavor - the condition auto-reconnect
    /// reacts to while receiving.
    #[must_use]
    pub fn is_broken(&self) -> bool { matches!(self, Self::Broken(_)) }
}

fn map_stream_err(err: std::io::Error) -> TransportError {
    use std::io::ErrorKind;
    match err.kind() {
        // `read_exact` reports EOF as UnexpectedEof; a zero-length read on
        // the prefix means the peer closed between frames.
        ErrorKind::UnexpectedEof => TransportError::Closed,
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected => TransportError::Broken(err),
        _ => TransportError::Io(err),
    }
}

pub mod byte_io {
    #[allow(clippy::wildcard_imports)]
    use super::*;

    /// Write one frame. The caller is responsible for serializing payload
    /// ordering (the [`Channel`](crate::Channel) send path holds a strict
    /// FIFO lock around this call so concurrent senders never interleave
    /// frames).
    ///
    /// # Errors
    ///
    /// Returns an error if the payload exceeds the protocol limit or the
    /// write/flush fails.
    pub async fn try_write_frame<W: AsyncWrite + Unpin>(
        writer: &mut W,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let payload_size = LengthPrefixType::try_from(payload.len())
            .map_err(|_| TransportError::FrameTooLarge(LengthPrefixType::MAX))?;
        if payload_size > protocol_constants::MAX_PAYLOAD_SIZE {
            return Err(TransportError::FrameTooLarge(payload_size));
        }

        // Write the length prefix number of bytes.
        writer
            .write_u32_le(payload_size)
            .await
            .map_err(map_stream_err)?;

        // Write the payload.
        writer.write_all(payload).await.map_err(map_stream_err)?;

        // Flush the buffer.
        writer.flush().await.map_err(map_stream_err)?;

        Ok(())
    }

    /// Read one frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] on a clean end-of-stream,
    /// [`TransportError::Broken`] on a reset, and
    /// [`TransportError::FrameTooLarge`] when the prefix exceeds the payload
    /// limit.
    pub async fn try_read_frame<R: AsyncRead + Unpin>(
        reader: &mut R,
    ) -> Result<Vec<u8>, TransportError> {
        // Read the length prefix number of bytes.
        let payload_size = reader.read_u32_le().await.map_err(map_stream_err)?;

        // Ensure that the payload size is within the expected range.
        if payload_size > protocol_constants::MAX_PAYLOAD_SIZE {
            return Err(TransportError::FrameTooLarge(payload_size));
        }

        // Read the payload.
        let mut payload_buffer = vec![0; payload_size as usize];
        reader
            .read_exact(&mut payload_buffer)
            .await
            .map_err(map_stream_err)?;

        Ok(payload_buffer)
    }
}

/// Identity exchange - the first frame each way after TCP connect.
///
/// 1. Each side **writes** its own `(name, instance-id)` pair.
/// 2. Each side then **reads** the peer's pair.
///
/// A reply that is not a 2-tuple of text is fatal: the channel is discarded
/// without registration. Either side closing the stream mid-handshake is a
/// non-event for the listener (the channel is dropped silently).
pub mod handshake {
    #[allow(clippy::wildcard_imports)]
    use super::*;

    /// Run the exchange with the [`protocol_constants::HANDSHAKE_TIMEOUT`]
    /// budget applied to the whole round trip.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Handshake`] on timeout or a malformed reply,
    /// and transport errors if the stream dies mid-exchange.
    pub async fn try_exchange_or_timeout<
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    >(
        read_half: &mut R,
        write_half: &mut W,
        own_uid: &Uid,
    ) -> Result<Uid, TransportError> {
        match timeout(
            protocol_constants::HANDSHAKE_TIMEOUT,
            try_exchange(read_half, write_half, own_uid),
        )
        .await
        {
            Ok(result) => result,
            Err(_elapsed) => {
                Err(TransportError::Handshake("handshake timed out".into()))
            }
        }
    }

    async fn try_exchange<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
        read_half: &mut R,
        write_half: &mut W,
        own_uid: &Uid,
    ) -> Result<Uid, TransportError> {
        // Send our own identity.
        let bytes = msgpack_serde::try_serialize(own_uid)?;
        byte_io::try_write_frame(write_half, &bytes).await?;

        // Read the peer's identity.
        let reply = byte_io::try_read_frame(read_half).await?;
        let (name, instance): (String, String) =
            msgpack_serde::try_deserialize(&reply).map_err(|_| {
                TransportError::Handshake(
                    "peer identity is not a (name, instance-id) pair of text"
                        .into(),
                )
            })?;

        Ok(Uid(name, instance))
    }
}

#[cfg(test)]
mod tests_byte_io {
    use super::*;
    use crate::test_fixtures::{WirePair, wire_pair};

    pub fn get_all_dialer_payloads<'a>() -> Vec<&'a str> { vec!["one", "two", "three"] }

    #[tokio::test]
    async fn test_byte_io() {
        let WirePair {
            mut dialer,
            mut listener,
        } = wire_pair();

        for sent_payload in get_all_dialer_payloads() {
            let bytes = msgpack_serde::try_serialize(&sent_payload).unwrap();
            byte_io::try_write_frame(&mut dialer.write, &bytes)
                .await
                .unwrap();

            let frame = byte_io::try_read_frame(&mut listener.read).await.unwrap();
            let received_payload: String =
                msgpack_serde::try_deserialize(&frame).unwrap();

            assert_eq!(received_payload, sent_payload);
        }
    }

    #[tokio::test]
    async fn test_closed_stream_is_end_of_stream() {
        let WirePair {
            dialer,
            mut listener,
        } = wire_pair();

        // The dialer going away entirely reads as a clean close.
        drop(dialer);

        let result = byte_io::try_read_frame(&mut listener.read).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_oversize_frame_is_rejected() {
        let WirePair {
            mut dialer,
            mut listener,
        } = wire_pair();

        // Hand-write a prefix that lies about an enormous payload.
        dialer
            .write
            .write_u32_le(protocol_constants::MAX_PAYLOAD_SIZE + 1)
            .await
            .unwrap();
        dialer.write.flush().await.unwrap();

        let result = byte_io::try_read_frame(&mut listener.read).await;
        assert!(matches!(result, Err(TransportError::FrameTooLarge(_))));
    }
}

#[cfg(test)]
mod tests_handshake {
    use super::*;
    use crate::test_fixtures::{WirePair, wire_pair};

    #[tokio::test]
    async fn test_handshake() {
        let WirePair {
            mut dialer,
            mut listener,
        } = wire_pair();

        let dialer_uid = Uid::generate("dialer");
        let listener_uid = Uid::generate("listener");

        // Both ends exchange identities concurrently, like two freshly
        // connected actors.
        let (dialer_result, listener_result) = tokio::join!(
            dialer.try_handshake(&dialer_uid),
            listener.try_handshake(&listener_uid)
        );

        assert_eq!(dialer_result.unwrap(), listener_uid);
        assert_eq!(listener_result.unwrap(), dialer_uid);
    }

    #[tokio::test]
    async fn test_handshake_rejects_malformed_identity() {
        let WirePair {
            mut dialer,
            mut listener,
        } = wire_pair();

        // Send a frame that is not a 2-tuple of text.
        let junk = msgpack_serde::try_serialize(&42u64).unwrap();
        byte_io::try_write_frame(&mut dialer.write, &junk)
            .await
            .unwrap();

        let listener_uid = Uid::generate("listener");
        let result = listener.try_handshake(&listener_uid).await;

        assert!(matches!(result, Err(TransportError::Handshake(_))));
    }
}
