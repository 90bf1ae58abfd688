// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! In-memory wire fixtures for protocol tests.
//!
//! A [`WirePair`] stands in for one actor-to-actor TCP link without a real
//! socket: two [`WireEnd`]s joined by [`tokio::io::duplex`], each split into
//! the read/write halves the frame codec operates on. Frames written by the
//! dialer come out of the listener and vice versa. The per-direction buffer
//! is kept small so frame-level backpressure is observable in tests too.

use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex, split};

use crate::{TransportError, Uid, handshake};

/// In-memory buffer per direction: room for a handful of protocol frames,
/// not more.
const WIRE_BUFFER_BYTES: usize = 1024;

/// One side of an in-memory actor link.
#[derive(Debug)]
pub struct WireEnd {
    pub read: ReadHalf<DuplexStream>,
    pub write: WriteHalf<DuplexStream>,
}

impl WireEnd {
    /// Run the `(name, instance-id)` exchange from this side. Both ends
    /// must run it (concurrently) for the round trip to complete, exactly
    /// like two freshly connected actors.
    ///
    /// # Errors
    ///
    /// See [`handshake::try_exchange_or_timeout`].
    pub async fn try_handshake(&mut self, own_uid: &Uid) -> Result<Uid, TransportError> {
        handshake::try_exchange_or_timeout(&mut self.read, &mut self.write, own_uid)
            .await
    }
}

/// Both sides of an in-memory link: what the dialing actor holds and what
/// the accepting actor holds.
#[derive(Debug)]
pub struct WirePair {
    pub dialer: WireEnd,
    pub listener: WireEnd,
}

/// Build an in-memory actor-to-actor link for codec and handshake tests.
#[must_use]
pub fn wire_pair() -> WirePair {
    let (dialer_stream, listener_stream) = duplex(WIRE_BUFFER_BYTES);

    let (read, write) = split(dialer_stream);
    let dialer = WireEnd { read, write };

    let (read, write) = split(listener_stream);
    let listener = WireEnd { read, write };

    WirePair { dialer, listener }
}
