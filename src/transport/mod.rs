// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Transport session (spec §4.2): per-socket send/receive with retry
//! counters and graceful-close detection. The session never interprets
//! payloads — it only moves [`NetPackage`] frames on and off a
//! [`TcpStream`].

use crate::codec::NetPackage;
use crate::error::{Fail, Result};
use log::{debug, warn};
use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

//==============================================================================
// Constants & Structures
//==============================================================================

/// Outcome of one [Session::receive] call (spec §4.2).
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// A frame was read successfully.
    Message(NetPackage),
    /// The poll window elapsed with nothing to read. Only returned when a
    /// timeout was supplied.
    Timeout,
    /// The frame failed to decode (bad header, oversized payload, ...).
    /// The caller should reply `CORRUPT_MESG` or drop the session,
    /// depending on which side it is.
    Corrupt(Fail),
    /// The peer closed the connection, or a fatal transport error occurred.
    Lost,
}

/// A blocking per-socket session with bounded-retry send/receive.
pub struct Session {
    stream: TcpStream,
    remote: SocketAddr,
    max_recv_fails: u32,
    max_send_fails: u32,
    max_payload_bytes: usize,
    recv_fail_streak: u32,
    send_fail_streak: u32,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Session].
impl Session {
    pub fn new(stream: TcpStream, max_recv_fails: u32, max_send_fails: u32, max_payload_bytes: usize) -> Result<Self> {
        stream.set_nodelay(true)?;
        let remote = stream.peer_addr()?;
        Ok(Self {
            stream,
            remote,
            max_recv_fails,
            max_send_fails,
            max_payload_bytes,
            recv_fail_streak: 0,
            send_fail_streak: 0,
        })
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.remote
    }

    /// Sends one frame, retrying soft (`WouldBlock`/`Interrupted`) write
    /// failures up to `max_send_fails` times before declaring the peer lost.
    pub fn send(&mut self, frame: &NetPackage) -> Result<()> {
        let bytes = frame.encode()?;
        loop {
            match self.stream.write_all(&bytes) {
                Ok(()) => {
                    self.send_fail_streak = 0;
                    return Ok(());
                }
                Err(e) if is_soft_error(&e) => {
                    self.send_fail_streak += 1;
                    if self.send_fail_streak > self.max_send_fails {
                        warn!("{}: exceeded max_send_fails, declaring lost", self.remote);
                        return Err(Fail::ConnectionClosed);
                    }
                }
                Err(e) => return Err(Fail::Io { source: e }),
            }
        }
    }

    /// Waits up to `timeout` (if any) for one frame to become available,
    /// then reads it. A `timeout` of `None` blocks indefinitely.
    ///
    /// Soft read failures (a platform hiccup short of a real disconnect) are
    /// retried up to `max_recv_fails` times before the session is declared
    /// [`ReceiveOutcome::Lost`]; a clean zero-byte read after the socket
    /// reported readable is always treated as an orderly peer close.
    pub fn receive(&mut self, timeout: Option<Duration>) -> ReceiveOutcome {
        if let Err(e) = self.stream.set_read_timeout(timeout) {
            warn!("{}: set_read_timeout failed: {}", self.remote, e);
            return ReceiveOutcome::Lost;
        }
        loop {
            match NetPackage::decode(&mut self.stream, self.max_payload_bytes) {
                Ok(frame) => {
                    self.recv_fail_streak = 0;
                    return ReceiveOutcome::Message(frame);
                }
                Err(Fail::Io { source }) if source.kind() == ErrorKind::WouldBlock || source.kind() == ErrorKind::TimedOut => {
                    return ReceiveOutcome::Timeout;
                }
                Err(Fail::Io { source }) if source.kind() == ErrorKind::UnexpectedEof => {
                    debug!("{}: orderly close", self.remote);
                    return ReceiveOutcome::Lost;
                }
                Err(Fail::Io { source }) if is_soft_error(&source) => {
                    self.recv_fail_streak += 1;
                    if self.recv_fail_streak > self.max_recv_fails {
                        warn!("{}: exceeded max_recv_fails, declaring lost", self.remote);
                        return ReceiveOutcome::Lost;
                    }
                }
                Err(Fail::Io { source }) => {
                    warn!("{}: fatal transport error: {}", self.remote, source);
                    return ReceiveOutcome::Lost;
                }
                Err(corrupt) => return ReceiveOutcome::Corrupt(corrupt),
            }
        }
    }

    /// Raw handle for registering with the master's readiness poller.
    pub fn raw_stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn shutdown(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

fn is_soft_error(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut)
}
