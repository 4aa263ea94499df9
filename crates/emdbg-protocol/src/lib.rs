//! # emdbg-protocol
//!
//! Packet framing for the GDB remote serial protocol, as spoken by debug
//! probes with a built-in GDB server (Black Magic Probe and friends).
//!
//! This crate is transport free: it turns requests into framed packets and
//! framed replies back into data. Reading and writing the serial port is up
//! to the caller.
//!
//! ## Packets
//!
//! A packet is `$<payload>#<checksum>`, the checksum being the modulo-256
//! sum of the (escaped) payload bytes as two lowercase hex digits:
//!
//! ```rust
//! use emdbg_protocol::{is_valid_packet, make_packet};
//!
//! assert_eq!(make_packet(b"g"), b"$g#67");
//! assert!(is_valid_packet(b"$g#67"));
//! assert!(!is_valid_packet(b"$g#66"));
//! ```
//!
//! ## Modules
//!
//! - [`packet`]: checksums, escaping, framing and reply classification
//! - [`request`]: request builders and reply decoders

pub mod packet;
pub mod request;

pub use packet::{
    checksum, error_code, escape, extract_packet, is_empty_response, is_error_response, is_ok_response,
    is_valid_packet, make_packet, packet_data, unescape,
};

/// Errors decoding replies from the remote
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError
{
    /// Missing framing characters or a checksum mismatch
    #[error("Invalid packet {0:?}")]
    InvalidPacket(String),

    /// The remote answered `Exx`
    #[error("Remote reported error 0x{0:02x}")]
    ErrorReply(u8),

    /// A well-formed reply that does not fit the request
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    /// Payload that should be hex digits is not
    #[error("Invalid hex data: {0}")]
    InvalidHex(String),
}

/// Result type for packet decoding
pub type PacketResult<T> = std::result::Result<T, PacketError>;
