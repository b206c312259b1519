//! Protocol module - handshake record, headers and part framing.
//!
//! This module implements the connection-level protocol:
//! - One [`Options`] handshake frame, always JSON
//! - Then zero or more frames of `[len][header][len][body]`

mod options;
mod wire_format;

pub use options::{read_options, write_options, Options, DEFAULT_CONNECT_TIMEOUT};
pub use wire_format::{
    encode_frame, encode_part, read_part, Header, InvalidRequest, DEFAULT_MAX_PART_SIZE,
    INVALID_SEQ, LENGTH_PREFIX_SIZE, MAGIC_NUMBER,
};
