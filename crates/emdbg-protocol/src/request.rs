//! # Requests and Replies
//!
//! Builders for the requests the debugger sends to a probe, and decoders
//! for the replies it gets back.
//!
//! ## Example
//!
//! ```rust
//! use emdbg_protocol::request::{decode_memory, read_memory};
//!
//! let requests = read_memory(0x2000_0000, 6, 4);
//! assert_eq!(requests, vec![b"$m20000000,4#4f".to_vec(), b"$m20000004,2#51".to_vec()]);
//!
//! let replies = vec![b"$01020304#8a".to_vec(), b"$0506#cb".to_vec()];
//! assert_eq!(decode_memory(&replies).unwrap(), vec![1, 2, 3, 4, 5, 6]);
//! ```

use crate::packet::{error_code, make_packet, packet_data};
use crate::{PacketError, PacketResult};

/// Default payload size of one memory read request
pub const DEFAULT_MEMORY_CHUNK: u32 = 1000;

/// Length requested from the memory map object
const MEMORY_MAP_LENGTH: u32 = 0x400;

fn to_hex(data: &[u8]) -> String
{
    data.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn from_hex(digits: &[u8]) -> PacketResult<Vec<u8>>
{
    let invalid = || PacketError::InvalidHex(String::from_utf8_lossy(digits).into_owned());
    if digits.len() % 2 != 0 {
        return Err(invalid());
    }
    digits
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(invalid)
        })
        .collect()
}

/// Payload of `reply`, with `Exx` replies turned into errors
fn reply_payload(reply: &[u8]) -> PacketResult<Vec<u8>>
{
    if let Some(code) = error_code(reply) {
        return Err(PacketError::ErrorReply(code));
    }
    packet_data(reply)
}

/// `g`: read all core registers
pub fn read_registers() -> Vec<u8>
{
    make_packet(b"g")
}

/// `vAttach;1`: attach to the first target the probe found
pub fn attach() -> Vec<u8>
{
    make_packet(b"vAttach;1")
}

/// `qXfer:memory-map:read`: request the target's memory map XML
pub fn memory_map_read() -> Vec<u8>
{
    make_packet(format!("qXfer:memory-map:read::0,{MEMORY_MAP_LENGTH:x}").as_bytes())
}

/// `s`: execute one instruction
pub fn single_step() -> Vec<u8>
{
    make_packet(b"s")
}

/// `c`: resume execution
pub fn resume() -> Vec<u8>
{
    make_packet(b"c")
}

/// `Z1`: insert a hardware breakpoint
pub fn set_hardware_breakpoint(address: u32, length: u32) -> Vec<u8>
{
    make_packet(format!("Z1,{address:x},{length}").as_bytes())
}

/// `z1`: remove a hardware breakpoint
pub fn remove_hardware_breakpoint(address: u32, length: u32) -> Vec<u8>
{
    make_packet(format!("z1,{address:x},{length}").as_bytes())
}

/// `qRcmd`: run a probe monitor command
pub fn monitor(command: &str) -> Vec<u8>
{
    make_packet(format!("qRcmd,{}", to_hex(command.as_bytes())).as_bytes())
}

/// `m` requests covering `length` bytes at `address`, at most `chunk_size`
/// bytes each
pub fn read_memory(mut address: u32, mut length: u32, chunk_size: u32) -> Vec<Vec<u8>>
{
    let chunk_size = chunk_size.max(1);
    let mut packets = Vec::new();
    while length > 0 {
        let chunk = length.min(chunk_size);
        packets.push(make_packet(format!("m{address:x},{chunk:x}").as_bytes()));
        length -= chunk;
        address = address.wrapping_add(chunk);
    }
    packets
}

/// Register values of a `g` reply
///
/// The remote sends each register as 8 hex digits of target (little-endian)
/// byte order.
///
/// ## Errors
///
/// `ErrorReply` for `Exx`, `InvalidPacket` for bad framing, `InvalidHex`
/// when the payload is not a whole number of registers.
pub fn decode_registers(reply: &[u8]) -> PacketResult<Vec<u32>>
{
    let payload = reply_payload(reply)?;
    if payload.len() % 8 != 0 {
        return Err(PacketError::InvalidHex(String::from_utf8_lossy(&payload).into_owned()));
    }
    let bytes = from_hex(&payload)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .collect())
}

/// Bytes of the replies to [`read_memory`] requests, concatenated
///
/// ## Errors
///
/// The first `Exx` reply aborts the read with `ErrorReply`.
pub fn decode_memory(replies: &[Vec<u8>]) -> PacketResult<Vec<u8>>
{
    let mut data = Vec::new();
    for reply in replies {
        data.extend(from_hex(&reply_payload(reply)?)?);
    }
    Ok(data)
}

/// XML text of a memory map reply (`m` or `l` followed by the data)
///
/// ## Errors
///
/// `UnexpectedReply` when the payload does not start with `m` or `l`.
pub fn decode_memory_map(reply: &[u8]) -> PacketResult<String>
{
    let payload = reply_payload(reply)?;
    match payload.split_first() {
        Some((b'm' | b'l', xml)) => Ok(String::from_utf8_lossy(xml).into_owned()),
        _ => Err(PacketError::UnexpectedReply(String::from_utf8_lossy(&payload).into_owned())),
    }
}

/// Console output of a monitor command: the hex payload of an `O` packet
pub fn decode_console_output(reply: &[u8]) -> PacketResult<Option<String>>
{
    let payload = reply_payload(reply)?;
    match payload.split_first() {
        Some((b'O', hex)) if !hex.is_empty() && payload != b"OK" => {
            let text = from_hex(hex)?;
            Ok(Some(String::from_utf8_lossy(&text).into_owned()))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::packet::is_valid_packet;

    #[test]
    fn test_fixed_requests()
    {
        assert_eq!(read_registers(), b"$g#67");
        assert_eq!(single_step(), b"$s#73");
        assert_eq!(resume(), b"$c#63");
        assert!(attach().starts_with(b"$vAttach;1#"));
        assert!(memory_map_read().starts_with(b"$qXfer:memory-map:read::0,400#"));
        assert!(is_valid_packet(&memory_map_read()));
    }

    #[test]
    fn test_breakpoint_requests()
    {
        let set = set_hardware_breakpoint(0x0800_01a4, 2);
        assert!(set.starts_with(b"$Z1,80001a4,2#"));
        assert!(is_valid_packet(&set));
        assert!(remove_hardware_breakpoint(0x0800_01a4, 2).starts_with(b"$z1,80001a4,2#"));
    }

    #[test]
    fn test_monitor_request_is_hex_encoded()
    {
        let request = monitor("swdp_scan");
        assert!(request.starts_with(b"$qRcmd,737764705f7363616e#"));
    }

    #[test]
    fn test_read_memory_chunks()
    {
        let requests = read_memory(0x2000_0000, 2500, DEFAULT_MEMORY_CHUNK);
        assert_eq!(requests.len(), 3);
        assert!(requests[0].starts_with(b"$m20000000,3e8#"));
        assert!(requests[1].starts_with(b"$m200003e8,3e8#"));
        assert!(requests[2].starts_with(b"$m200007d0,1f4#"));
        assert!(read_memory(0x2000_0000, 0, 16).is_empty());
    }

    #[test]
    fn test_decode_registers_fixes_byte_order()
    {
        let reply = make_packet(b"0010002078563412");
        assert_eq!(decode_registers(&reply).unwrap(), vec![0x2000_1000, 0x1234_5678]);
        assert!(matches!(
            decode_registers(&make_packet(b"001000")),
            Err(PacketError::InvalidHex(_))
        ));
        assert_eq!(decode_registers(b"$E01#a6"), Err(PacketError::ErrorReply(1)));
    }

    #[test]
    fn test_decode_memory_stops_at_error()
    {
        let replies = vec![make_packet(b"0102"), b"$E0e#da".to_vec()];
        assert_eq!(decode_memory(&replies), Err(PacketError::ErrorReply(0x0e)));
        assert!(matches!(
            decode_memory(&[make_packet(b"0g")]),
            Err(PacketError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_decode_memory_map()
    {
        let reply = make_packet(b"l<memory-map/>");
        assert_eq!(decode_memory_map(&reply).unwrap(), "<memory-map/>");
        assert!(matches!(
            decode_memory_map(&make_packet(b"x")),
            Err(PacketError::UnexpectedReply(_))
        ));
    }

    #[test]
    fn test_decode_console_output()
    {
        let reply = make_packet(b"O48690a");
        assert_eq!(decode_console_output(&reply).unwrap().as_deref(), Some("Hi\n"));
        assert_eq!(decode_console_output(&make_packet(b"OK")).unwrap(), None);
    }
}
