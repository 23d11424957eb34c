// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::error::{Fail, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use std::io::{Read, Write};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Width of the fixed `desc` header field, in bytes.
pub const DESC_LEN: usize = 256;

/// Header size: type(1) + group_id(4) + run_id(4) + desc(256) + payload_len(8).
pub const HEADER_LEN: usize = 1 + 4 + 4 + DESC_LEN + 8;

/// Byte offset of the `payload_len` field within the header.
const PAYLOAD_LEN_OFFSET: usize = 1 + 4 + 4 + DESC_LEN;

/// Closed set of frame types (spec §4.1).
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum FrameType {
    ReqRunDir = 0,
    RunDir = 1,
    ParNames = 2,
    ObsNames = 3,
    ReqLinpack = 4,
    Linpack = 5,
    StartRun = 6,
    RunFinished = 7,
    RunFailed = 8,
    RunKilled = 9,
    ReqKill = 10,
    Terminate = 11,
    Ping = 12,
    Ready = 13,
    CorruptMesg = 14,
}

/// One frame on the wire: header plus a variable-length payload. Mirrors
/// the original `NetPackage` record (spec §3).
#[derive(Clone, Debug)]
pub struct NetPackage {
    pub kind: FrameType,
    pub group_id: i32,
    pub run_id: i32,
    pub desc: String,
    pub payload: Vec<u8>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [NetPackage].
impl NetPackage {
    /// Builds a frame with an empty description and payload. Most control
    /// frames (`PING`, `READY`, `REQ_KILL`, ...) look like this.
    pub fn new(kind: FrameType, group_id: i32, run_id: i32) -> Self {
        Self {
            kind,
            group_id,
            run_id,
            desc: String::new(),
            payload: Vec::new(),
        }
    }

    pub fn with_payload(kind: FrameType, group_id: i32, run_id: i32, payload: Vec<u8>) -> Self {
        Self {
            kind,
            group_id,
            run_id,
            desc: String::new(),
            payload,
        }
    }

    pub fn with_desc(mut self, desc: impl Into<String>) -> Result<Self> {
        let desc = desc.into();
        if !desc.is_ascii() {
            return Err(Fail::Corrupt {
                detail: "desc field must be ASCII".into(),
            });
        }
        if desc.len() > DESC_LEN {
            return Err(Fail::SlotExhausted {
                field: "desc",
                limit: DESC_LEN,
            });
        }
        self.desc = desc;
        Ok(self)
    }

    /// Encodes the frame into a single contiguous buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.desc.len() > DESC_LEN || !self.desc.is_ascii() {
            return Err(Fail::SlotExhausted {
                field: "desc",
                limit: DESC_LEN,
            });
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.write_u8(self.kind.to_u8().expect("FrameType always fits in u8"))?;
        buf.write_i32::<LittleEndian>(self.group_id)?;
        buf.write_i32::<LittleEndian>(self.run_id)?;
        let mut desc_field = [0u8; DESC_LEN];
        desc_field[..self.desc.len()].copy_from_slice(self.desc.as_bytes());
        buf.write_all(&desc_field)?;
        buf.write_i64::<LittleEndian>(self.payload.len() as i64)?;
        buf.write_all(&self.payload)?;
        Ok(buf)
    }

    /// Reads exactly one frame from `reader`: the fixed header, then exactly
    /// `payload_len` bytes. Rejects any frame whose declared payload length
    /// exceeds `max_payload_bytes` without reading the payload at all — this
    /// is the ceiling called for in spec §4.1 and DESIGN NOTES (no upper
    /// bound was a denial-of-service vector in the original protocol).
    pub fn decode<R: Read>(reader: &mut R, max_payload_bytes: usize) -> Result<Self> {
        let kind_byte = reader.read_u8()?;
        let kind = FrameType::from_u8(kind_byte).ok_or_else(|| Fail::Corrupt {
            detail: format!("unknown frame type byte {}", kind_byte),
        })?;
        let group_id = reader.read_i32::<LittleEndian>()?;
        let run_id = reader.read_i32::<LittleEndian>()?;
        let mut desc_field = [0u8; DESC_LEN];
        reader.read_exact(&mut desc_field)?;
        let desc_end = desc_field.iter().position(|&b| b == 0).unwrap_or(DESC_LEN);
        let desc = String::from_utf8(desc_field[..desc_end].to_vec()).map_err(|_| Fail::Corrupt {
            detail: "desc field is not valid UTF-8".into(),
        })?;
        let payload_len = reader.read_i64::<LittleEndian>()?;
        if payload_len < 0 {
            return Err(Fail::Corrupt {
                detail: format!("negative payload_len {}", payload_len),
            });
        }
        if payload_len as usize > max_payload_bytes {
            return Err(Fail::Corrupt {
                detail: format!(
                    "payload_len {} exceeds ceiling of {} bytes",
                    payload_len, max_payload_bytes
                ),
            });
        }
        let mut payload = vec![0u8; payload_len as usize];
        reader.read_exact(&mut payload)?;
        Ok(Self {
            kind,
            group_id,
            run_id,
            desc,
            payload,
        })
    }
}

/// Given a prefix of bytes accumulated from a non-blocking socket, reports
/// the total frame length (header + payload) once enough of the header has
/// arrived to read `payload_len`, so a buffering reader knows how much more
/// to wait for before calling [`NetPackage::decode`]. Returns `Err` if the
/// declared payload length exceeds `max_payload_bytes`, so an oversized
/// frame is rejected before the reader buffers the whole thing.
pub fn peek_frame_len(buf: &[u8], max_payload_bytes: usize) -> Result<Option<usize>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&buf[PAYLOAD_LEN_OFFSET..PAYLOAD_LEN_OFFSET + 8]);
    let payload_len = i64::from_le_bytes(len_bytes);
    if payload_len < 0 || payload_len as usize > max_payload_bytes {
        return Err(Fail::Corrupt {
            detail: format!("payload_len {} out of range", payload_len),
        });
    }
    Ok(Some(HEADER_LEN + payload_len as usize))
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl PartialEq for NetPackage {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.group_id == other.group_id
            && self.run_id == other.run_id
            && self.desc == other.desc
            && self.payload == other.payload
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_every_frame_type() {
        let kinds = [
            FrameType::ReqRunDir,
            FrameType::RunDir,
            FrameType::ParNames,
            FrameType::ObsNames,
            FrameType::ReqLinpack,
            FrameType::Linpack,
            FrameType::StartRun,
            FrameType::RunFinished,
            FrameType::RunFailed,
            FrameType::RunKilled,
            FrameType::ReqKill,
            FrameType::Terminate,
            FrameType::Ping,
            FrameType::Ready,
            FrameType::CorruptMesg,
        ];
        for kind in kinds {
            let frame = NetPackage::with_payload(kind, 7, 42, vec![1, 2, 3, 4])
                .with_desc("hello")
                .unwrap();
            let encoded = frame.encode().unwrap();
            let mut cursor = std::io::Cursor::new(encoded);
            let decoded = NetPackage::decode(&mut cursor, 1 << 20).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn desc_padding_is_256_bytes_and_zero_filled() {
        let frame = NetPackage::new(FrameType::Ping, 0, 0).with_desc("x").unwrap();
        let encoded = frame.encode().unwrap();
        assert_eq!(&encoded[9..9 + DESC_LEN].len(), &DESC_LEN);
        assert_eq!(encoded[9], b'x');
        assert_eq!(encoded[9 + 1], 0);
        assert_eq!(encoded[9 + DESC_LEN - 1], 0);
    }

    #[test]
    fn oversized_payload_len_is_rejected_without_reading() {
        let frame = NetPackage::with_payload(FrameType::StartRun, 0, 0, vec![0u8; 10]);
        let encoded = frame.encode().unwrap();
        let mut cursor = std::io::Cursor::new(encoded);
        let err = NetPackage::decode(&mut cursor, 4).unwrap_err();
        assert!(matches!(err, Fail::Corrupt { .. }));
    }

    #[test]
    fn non_ascii_desc_is_rejected() {
        let err = NetPackage::new(FrameType::Ping, 0, 0).with_desc("café").unwrap_err();
        assert!(matches!(err, Fail::Corrupt { .. }));
    }
}
