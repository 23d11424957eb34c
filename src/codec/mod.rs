// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Wire codec (spec §4.1): fixed-layout frames on a byte stream. One frame
//! type enum, one header, one length-prefixed payload. All integers are
//! little-endian; the description field is a fixed 256-byte zero-padded
//! ASCII buffer kept for wire compatibility with the original protocol.

mod frame;
mod payload;

pub use frame::{peek_frame_len, FrameType, NetPackage, DESC_LEN, HEADER_LEN};
pub use payload::{decode_name_list, decode_vector, encode_name_list, encode_vector};
