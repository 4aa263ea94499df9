//! # Packet Framing
//!
//! Checksums, escaping and extraction of `$...#xx` frames from a receive
//! buffer.
//!
//! Within a payload, `}` `#` and `$` are escaped as `}` followed by the
//! character XOR 0x20. The checksum covers the escaped payload.

use crate::{PacketError, PacketResult};

const ESCAPE: u8 = b'}';

/// Modulo-256 sum of `data`
pub fn checksum(data: &[u8]) -> u8
{
    data.iter().fold(0u8, |sum, &byte| sum.wrapping_add(byte))
}

pub fn escape(data: &[u8]) -> Vec<u8>
{
    let mut escaped = Vec::with_capacity(data.len());
    for &byte in data {
        if matches!(byte, b'}' | b'#' | b'$') {
            escaped.push(ESCAPE);
            escaped.push(byte ^ 0x20);
        } else {
            escaped.push(byte);
        }
    }
    escaped
}

pub fn unescape(data: &[u8]) -> Vec<u8>
{
    let mut unescaped = Vec::with_capacity(data.len());
    let mut bytes = data.iter();
    while let Some(&byte) = bytes.next() {
        if byte == ESCAPE {
            if let Some(&next) = bytes.next() {
                unescaped.push(next ^ 0x20);
            }
        } else {
            unescaped.push(byte);
        }
    }
    unescaped
}

/// Frame `payload` as `$<escaped payload>#<checksum>`
pub fn make_packet(payload: &[u8]) -> Vec<u8>
{
    let escaped = escape(payload);
    let mut packet = Vec::with_capacity(escaped.len() + 4);
    packet.push(b'$');
    packet.extend_from_slice(&escaped);
    packet.extend_from_slice(format!("#{:02x}", checksum(&escaped)).as_bytes());
    packet
}

/// Whether `packet` is framed and its checksum matches
pub fn is_valid_packet(packet: &[u8]) -> bool
{
    let length = packet.len();
    if length < 4 || packet[0] != b'$' || packet[length - 3] != b'#' {
        return false;
    }
    let Some(expected) = std::str::from_utf8(&packet[length - 2..])
        .ok()
        .and_then(|digits| u8::from_str_radix(digits, 16).ok())
    else {
        return false;
    };
    expected == checksum(&packet[1..length - 3])
}

/// Unescaped payload of a valid packet
///
/// ## Errors
///
/// `InvalidPacket` if framing or checksum are wrong.
pub fn packet_data(packet: &[u8]) -> PacketResult<Vec<u8>>
{
    if !is_valid_packet(packet) {
        return Err(PacketError::InvalidPacket(String::from_utf8_lossy(packet).into_owned()));
    }
    Ok(unescape(&packet[1..packet.len() - 3]))
}

/// Remove and return the first complete packet in `buffer`
///
/// Bytes before the packet (acknowledgements, console noise) are dropped
/// with it. Returns `None`, leaving `buffer` untouched, while no complete
/// packet has arrived.
pub fn extract_packet(buffer: &mut Vec<u8>) -> Option<Vec<u8>>
{
    let start = buffer.iter().position(|&byte| byte == b'$')?;
    let hash = start + buffer[start..].iter().position(|&byte| byte == b'#')?;
    let end = hash + 3;
    if buffer.len() < end {
        return None;
    }
    let packet = buffer[start..end].to_vec();
    buffer.drain(..end);
    tracing::trace!(packet = %String::from_utf8_lossy(&packet), skipped = start, "Extracted packet");
    Some(packet)
}

/// Error number of an `$Exx#cc` reply
pub fn error_code(reply: &[u8]) -> Option<u8>
{
    if !is_valid_packet(reply) || reply.len() != 7 || reply[1] != b'E' {
        return None;
    }
    std::str::from_utf8(&reply[2..4])
        .ok()
        .and_then(|digits| u8::from_str_radix(digits, 16).ok())
}

pub fn is_error_response(reply: &[u8]) -> bool
{
    error_code(reply).is_some()
}

/// Valid packet carrying exactly `OK`; only the checksum digits ignore case
pub fn is_ok_response(reply: &[u8]) -> bool
{
    packet_data(reply).is_ok_and(|payload| payload == b"OK")
}

/// Valid packet with an empty payload
pub fn is_empty_response(reply: &[u8]) -> bool
{
    packet_data(reply).is_ok_and(|payload| payload.is_empty())
}
