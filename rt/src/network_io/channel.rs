// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! An inter-process channel for communication between (remote) actors.
//!
//! One [`Channel`] owns one TCP stream wrapped in the length-prefix codec.
//! After the uid handshake the connection is symmetric: either side can issue
//! commands and either side can reply. The send path is serialized by a
//! strict FIFO lock ([`tokio::sync::Mutex`] wakes waiters in FIFO order) so
//! concurrent senders never interleave frames.
//!
//! Optional auto-reconnect: when the transport *breaks* while receiving (not
//! on a clean close), the channel re-dials the original destination on a
//! fixed 1 s poll with a 3 s per-attempt budget, re-runs the uid handshake,
//! and then invokes a user-supplied hook before resuming. Reconnection never
//! replays frames - outstanding call-ids on the channel are invalidated by
//! the hook and their callers observe `transport-closed`.

use std::{net::SocketAddr,
          sync::{Mutex as StdMutex,
                 atomic::{AtomicBool, Ordering}}};

use futures_util::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};
use tokio::{io::{AsyncWriteExt, BufReader, BufWriter},
            net::{TcpStream,
                  tcp::{OwnedReadHalf, OwnedWriteHalf}},
            time::{sleep, timeout}};

use crate::{NetAddr, Packet, TransportError, Uid, byte_io, handshake,
            msgpack_serde, protocol_constants};

/// Invoked after a successful reconnect, before the channel resumes
/// receiving. This is where the owner fails outstanding call-ids.
pub type ReconnectHook =
    std::sync::Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub struct Channel {
    read_half: tokio::sync::Mutex<BufReader<OwnedReadHalf>>,
    write_half: tokio::sync::Mutex<BufWriter<OwnedWriteHalf>>,
    /// `(laddr, raddr)` of the current underlying stream.
    addrs: StdMutex<(SocketAddr, SocketAddr)>,
    /// Set after handshake - always the uid of the far end.
    peer_uid: StdMutex<Option<Uid>>,
    /// Our own uid, kept so a reconnect can redo the handshake.
    own_uid: StdMutex<Option<Uid>>,
    /// Original destination; `None` for accepted (inbound) channels.
    dest_addr: Option<NetAddr>,
    auto_reconnect: bool,
    on_reconnect: StdMutex<Option<ReconnectHook>>,
    /// Set if the far end reported an internal (channel-level) error.
    errored: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (laddr, raddr) = *self.addrs.lock().unwrap();
        f.debug_struct("Channel")
            .field("laddr", &laddr)
            .field("raddr", &raddr)
            .field("peer_uid", &self.peer_uid())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Channel {
    fn from_parts(
        stream: TcpStream,
        dest_addr: Option<NetAddr>,
        auto_reconnect: bool,
    ) -> Result<Self, TransportError> {
        stream.set_nodelay(true).ok();
        let laddr = stream.local_addr().map_err(TransportError::Io)?;
        let raddr = stream.peer_addr().map_err(TransportError::Io)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            read_half: tokio::sync::Mutex::new(BufReader::new(read_half)),
            write_half: tokio::sync::Mutex::new(BufWriter::new(write_half)),
            addrs: StdMutex::new((laddr, raddr)),
            peer_uid: StdMutex::new(None),
            own_uid: StdMutex::new(None),
            dest_addr,
            auto_reconnect,
            on_reconnect: StdMutex::new(None),
            errored: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Open a TCP connection to `addr` and wrap it in the codec.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] on refusal / failure to dial.
    pub async fn connect(addr: &NetAddr) -> Result<Self, TransportError> {
        let stream = TcpStream::connect((addr.0.as_str(), addr.1))
            .await
            .map_err(|source| TransportError::Connect {
                addr: format!("{}:{}", addr.0, addr.1),
                source,
            })?;
        tracing::trace!(host = %addr.0, port = addr.1, "opened channel");
        Self::from_parts(stream, Some(addr.clone()), false)
    }

    /// Like [`Channel::connect`] but with auto-reconnect enabled.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] on refusal / failure to dial.
    pub async fn connect_with_reconnect(
        addr: &NetAddr,
        hook: ReconnectHook,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect((addr.0.as_str(), addr.1))
            .await
            .map_err(|source| TransportError::Connect {
                addr: format!("{}:{}", addr.0, addr.1),
                source,
            })?;
        let channel = Self::from_parts(stream, Some(addr.clone()), true)?;
        *channel.on_reconnect.lock().unwrap() = Some(hook);
        Ok(channel)
    }

    /// Wrap an already-accepted stream (inbound side).
    ///
    /// # Errors
    ///
    /// Returns an error if the socket addresses cannot be read.
    pub fn from_stream(stream: TcpStream) -> Result<Self, TransportError> {
        Self::from_parts(stream, None, false)
    }

    #[must_use]
    pub fn laddr(&self) -> SocketAddr { self.addrs.lock().unwrap().0 }

    #[must_use]
    pub fn raddr(&self) -> SocketAddr { self.addrs.lock().unwrap().1 }

    /// The far end's uid; `None` before the handshake completes.
    #[must_use]
    pub fn peer_uid(&self) -> Option<Uid> { self.peer_uid.lock().unwrap().clone() }

    #[must_use]
    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Relaxed) }

    #[must_use]
    pub fn is_errored(&self) -> bool { self.errored.load(Ordering::Relaxed) }

    pub fn set_errored(&self) { self.errored.store(true, Ordering::Relaxed); }

    /// Exchange `(name, instance-id)` identifiers as the first communication
    /// step. Stores the peer's uid on success.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Handshake`] when the reply is malformed or
    /// the exchange times out.
    pub async fn try_handshake(&self, own_uid: &Uid) -> Result<Uid, TransportError> {
        let mut read_guard = self.read_half.lock().await;
        let mut write_guard = self.write_half.lock().await;
        let peer = handshake::try_exchange_or_timeout(
            &mut *read_guard,
            &mut *write_guard,
            own_uid,
        )
        .await?;
        *self.own_uid.lock().unwrap() = Some(own_uid.clone());
        *self.peer_uid.lock().unwrap() = Some(peer.clone());
        tracing::debug!(peer = %peer, raddr = %self.raddr(), "handshake complete");
        Ok(peer)
    }

    async fn send_frame(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        // Strict FIFO: tokio's async Mutex queues waiters fairly.
        let mut write_guard = self.write_half.lock().await;
        byte_io::try_write_frame(&mut *write_guard, bytes).await
    }

    /// Push one packet.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the stream is closed or broken.
    pub async fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        // `&Packet` and `Some(packet)` share an encoding: serde's `Option`
        // is transparent for `Some`.
        let bytes = msgpack_serde::try_serialize(packet)?;
        self.send_frame(&bytes).await
    }

    /// Send the message-loop terminate sentinel (msgpack nil).
    ///
    /// # Errors
    ///
    /// Returns a transport error when the stream is closed or broken.
    pub async fn send_sentinel(&self) -> Result<(), TransportError> {
        let bytes = msgpack_serde::try_serialize(&Option::<Packet>::None)?;
        self.send_frame(&bytes).await
    }

    /// Send an arbitrary serializable record as one frame (used for the
    /// parent→child runtime-variables hello, which precedes packet traffic).
    ///
    /// # Errors
    ///
    /// Returns a transport error when the stream is closed or broken.
    pub async fn send_value<T: Serialize>(&self, value: &T) -> Result<(), TransportError> {
        let bytes = msgpack_serde::try_serialize(value)?;
        self.send_frame(&bytes).await
    }

    /// Receive one frame and decode it as `T`.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the stream is closed or broken, or a
    /// codec error for undecodable payloads.
    pub async fn recv_value<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        let mut read_guard = self.read_half.lock().await;
        let frame = byte_io::try_read_frame(&mut *read_guard).await?;
        Ok(msgpack_serde::try_deserialize(&frame)?)
    }

    /// Receive the next wire unit: `Some(packet)`, or `None` when the peer
    /// sent the terminate sentinel.
    ///
    /// With auto-reconnect enabled, a *broken* transport is repaired in place
    /// (poll + handshake + hook) and receiving resumes; a clean close is
    /// always surfaced.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] / [`TransportError::Broken`] when the peer
    /// is gone (and reconnect is off or impossible).
    pub async fn recv(&self) -> Result<Option<Packet>, TransportError> {
        let mut read_guard = self.read_half.lock().await;
        loop {
            match byte_io::try_read_frame(&mut *read_guard).await {
                Ok(frame) => {
                    return Ok(msgpack_serde::try_deserialize::<Option<Packet>>(
                        &frame,
                    )?);
                }
                Err(err)
                    if err.is_broken()
                        && self.auto_reconnect
                        && !self.is_closed() =>
                {
                    self.try_reconnect(&mut read_guard).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Handle connection failures by polling until a reconnect can be
    /// established, then redo the handshake and run the reconnect hook.
    async fn try_reconnect(
        &self,
        read_guard: &mut tokio::sync::MutexGuard<'_, BufReader<OwnedReadHalf>>,
    ) -> Result<(), TransportError> {
        let Some(dest) = self.dest_addr.clone() else {
            return Err(TransportError::Closed);
        };
        let mut reported_down = false;

        loop {
            match timeout(
                protocol_constants::RECONNECT_ATTEMPT_TIMEOUT,
                TcpStream::connect((dest.0.as_str(), dest.1)),
            )
            .await
            {
                Err(_elapsed) => {
                    tracing::debug!(
                        "reconnect timed out after {:?}, retrying",
                        protocol_constants::RECONNECT_ATTEMPT_TIMEOUT
                    );
                }
                Ok(Err(_refused)) => {
                    if !reported_down {
                        reported_down = true;
                        tracing::debug!(
                            "connection to {}:{} went down, waiting for re-establishment",
                            dest.0,
                            dest.1
                        );
                    }
                    sleep(protocol_constants::RECONNECT_POLL).await;
                }
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true).ok();
                    let laddr = stream.local_addr().map_err(TransportError::Io)?;
                    let raddr = stream.peer_addr().map_err(TransportError::Io)?;
                    let (new_read, new_write) = stream.into_split();

                    let mut write_guard = self.write_half.lock().await;
                    **read_guard = BufReader::new(new_read);
                    *write_guard = BufWriter::new(new_write);
                    *self.addrs.lock().unwrap() = (laddr, raddr);

                    // The accepting side handshakes every fresh connection.
                    let own = self.own_uid.lock().unwrap().clone();
                    if let Some(own) = own {
                        let peer = handshake::try_exchange_or_timeout(
                            &mut **read_guard,
                            &mut *write_guard,
                            &own,
                        )
                        .await?;
                        *self.peer_uid.lock().unwrap() = Some(peer);
                    }
                    drop(write_guard);

                    tracing::info!("stream connection re-established");

                    // Outstanding call-ids are invalidated here, never
                    // replayed.
                    let hook = self.on_reconnect.lock().unwrap().clone();
                    if let Some(hook) = hook {
                        hook().await;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Half-close politely: send the terminate sentinel, then shut down the
    /// write side. Receiving stays possible until the peer closes.
    pub async fn aclose(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        tracing::debug!(peer = ?self.peer_uid(), "closing channel");
        // Best effort: the peer may already be gone.
        let sentinel = msgpack_serde::try_serialize(&Option::<Packet>::None);
        if let Ok(bytes) = sentinel {
            let mut write_guard = self.write_half.lock().await;
            if byte_io::try_write_frame(&mut *write_guard, &bytes)
                .await
                .is_ok()
            {
                write_guard.get_mut().shutdown().await.ok();
            }
        }
    }
}

#[cfg(test)]
mod tests_channel {
    use tokio::net::TcpListener;

    use super::*;
    use crate::CallId;

    async fn tcp_pair() -> (Channel, Channel) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dial_addr = ("127.0.0.1".to_string(), addr.port());
        let dial = Channel::connect(&dial_addr);
        let accept = async {
            let (stream, _) = listener.accept().await.unwrap();
            Channel::from_stream(stream).unwrap()
        };
        let (dialed, accepted) = tokio::join!(dial, accept);
        (dialed.unwrap(), accepted)
    }

    #[tokio::test]
    async fn test_send_recv_round_trip() {
        let (client, server) = tcp_pair().await;

        let client_uid = Uid::generate("client");
        let server_uid = Uid::generate("server");
        let (c, s) = tokio::join!(
            client.try_handshake(&client_uid),
            server.try_handshake(&server_uid)
        );
        assert_eq!(c.unwrap(), server_uid);
        assert_eq!(s.unwrap(), client_uid);

        let cid = CallId::fresh();
        client
            .send(&Packet::Stop { cid: cid.clone() })
            .await
            .unwrap();
        match server.recv().await.unwrap() {
            Some(Packet::Stop { cid: got }) => assert_eq!(got, cid),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sentinel_terminates_iteration() {
        let (client, server) = tcp_pair().await;
        client.aclose().await;
        // The sentinel arrives as `None`, then the half-closed stream reads
        // as a clean close.
        assert!(server.recv().await.unwrap().is_none());
        assert!(matches!(server.recv().await, Err(TransportError::Closed)));
    }
}
