// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Constants & Structures
//==============================================================================

// `custom_error!` gives every single-field variant an automatic `From` impl,
// so `?` on a `std::io::Error` anywhere in the crate lifts straight into
// `Fail::Io` without a `derive_more` shim.
custom_error::custom_error! {
    pub Fail

    Io{source: std::io::Error} = "i/o error: {source}",
    Corrupt{detail: String} = "corrupt frame: {detail}",
    ProtocolViolation{detail: String} = "protocol violation: {detail}",
    ConnectionClosed = "connection closed by peer",
    RenderError{detail: String} = "template render failed: {detail}",
    ParseError{detail: String} = "instruction parse failed: {detail}",
    Cancelled = "operation cancelled",
    SchemaError{detail: String} = "control file schema error: {detail}",
    SlotExhausted{field: &'static str, limit: usize} = "{field} exceeds {limit} bytes",
}

pub type Result<T> = std::result::Result<T, Fail>;
