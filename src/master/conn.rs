// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Non-blocking per-connection buffering for the master's single-threaded
//! event loop (spec §5). Each [Conn] accumulates bytes off a non-blocking
//! socket until full frames can be decoded, and queues outgoing frames
//! until the socket reports writable again.

use crate::codec::{peek_frame_len, NetPackage};
use crate::error::{Fail, Result};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};

//==============================================================================
// Constants & Structures
//==============================================================================

pub enum PumpResult {
    Frames(Vec<NetPackage>),
    Closed,
}

pub struct Conn {
    pub stream: mio::net::TcpStream,
    read_buf: Vec<u8>,
    write_buf: VecDeque<u8>,
    max_payload_bytes: usize,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Conn].
impl Conn {
    pub fn new(stream: mio::net::TcpStream, max_payload_bytes: usize) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
            write_buf: VecDeque::new(),
            max_payload_bytes,
        }
    }

    /// Drains whatever the kernel has buffered for this socket and returns
    /// every complete frame that can now be decoded. A zero-byte read after
    /// a readable event is an orderly peer close (spec §4.2).
    pub fn pump_read(&mut self) -> Result<PumpResult> {
        let mut tmp = [0u8; 64 * 1024];
        loop {
            match self.stream.read(&mut tmp) {
                Ok(0) => return Ok(PumpResult::Closed),
                Ok(n) => self.read_buf.extend_from_slice(&tmp[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Fail::Io { source: e }),
            }
        }
        let mut frames = Vec::new();
        loop {
            match peek_frame_len(&self.read_buf, self.max_payload_bytes)? {
                Some(total) if self.read_buf.len() >= total => {
                    let rest = self.read_buf.split_off(total);
                    let frame_bytes = std::mem::replace(&mut self.read_buf, rest);
                    let mut cursor = std::io::Cursor::new(frame_bytes);
                    frames.push(NetPackage::decode(&mut cursor, self.max_payload_bytes)?);
                }
                _ => break,
            }
        }
        Ok(PumpResult::Frames(frames))
    }

    /// Encodes and enqueues a frame for sending, then makes as much
    /// progress writing it as the socket currently allows.
    pub fn queue_send(&mut self, frame: &NetPackage) -> Result<()> {
        let bytes = frame.encode()?;
        self.write_buf.extend(bytes);
        self.flush_write()
    }

    /// Makes non-blocking progress writing whatever is queued. Call again
    /// once a writable-readiness event arrives for connections that had
    /// backlog left over from [queue_send](Self::queue_send).
    pub fn flush_write(&mut self) -> Result<()> {
        while !self.write_buf.is_empty() {
            let write_result = self.stream.write(self.write_buf.make_contiguous());
            match write_result {
                Ok(0) => return Err(Fail::ConnectionClosed),
                Ok(n) => {
                    self.write_buf.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Fail::Io { source: e }),
            }
        }
        Ok(())
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.write_buf.is_empty()
    }
}
