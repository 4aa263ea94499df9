//! A probe conversation replayed from a captured receive stream.

use emdbg_protocol::request::{decode_memory, decode_registers, read_memory, read_registers};
use emdbg_protocol::{extract_packet, is_ok_response, is_valid_packet, make_packet, PacketError};

#[test]
fn test_checksum_scenario()
{
    assert!(is_valid_packet(b"$g#67"));
    assert!(!is_valid_packet(b"$g#66"));
    assert_eq!(read_registers(), b"$g#67");
}

#[test]
fn test_replies_split_across_reads()
{
    let registers = make_packet(b"0000000001000000efbeadde");
    let mut stream = b"+".to_vec();
    stream.extend_from_slice(&registers);
    stream.extend_from_slice(b"+$OK#9a");

    // The first read stops in the middle of the checksum
    let split = stream.len() - 9;
    let mut buffer = stream[..split].to_vec();
    assert_eq!(extract_packet(&mut buffer), None);

    buffer.extend_from_slice(&stream[split..]);
    let reply = extract_packet(&mut buffer).unwrap();
    assert_eq!(decode_registers(&reply).unwrap(), vec![0, 1, 0xdead_beef]);

    let reply = extract_packet(&mut buffer).unwrap();
    assert!(is_ok_response(&reply));
    assert!(buffer.is_empty());
}

#[test]
fn test_chunked_memory_read()
{
    let requests = read_memory(0x0800_0000, 6, 4);
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|request| is_valid_packet(request)));

    let replies = vec![make_packet(b"00500020"), make_packet(b"c100")];
    assert_eq!(decode_memory(&replies).unwrap(), vec![0x00, 0x50, 0x00, 0x20, 0xc1, 0x00]);

    let corrupted = vec![b"$00500020#00".to_vec()];
    assert!(matches!(decode_memory(&corrupted), Err(PacketError::InvalidPacket(_))));
}
