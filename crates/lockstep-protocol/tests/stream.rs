//! A server-to-client packet stream cut into arbitrary reads, reassembled
//! and decoded the way a receiving peer does it.

use bytes::{Bytes, BytesMut};
use lockstep_protocol::{
    ClientId, CommandPacket, CompanyId, ErrorCode, Message, PacketKind, ProtocolError, RawPacket,
    Role, SEND_MTU, SyncSeeds, split_packet,
};

fn conversation() -> Vec<Message> {
    let mut cmd = CommandPacket::new(CompanyId(3), 42, Bytes::from_static(b"build"), 9);
    cmd.client_id = ClientId(4);
    cmd.frame = 120;
    vec![
        Message::ServerWelcome {
            client_id: ClientId(4),
        },
        Message::ServerMapBegin { frame: 117 },
        Message::ServerMapSize { bytes: 5000 },
        Message::ServerMapData {
            chunk: Bytes::from(vec![0xab; 5000]),
        },
        Message::ServerMapDone,
        Message::ServerCommand(cmd),
        Message::ServerFrame {
            frame: 118,
            frame_max: 118,
            seeds: Some(SyncSeeds {
                seed1: 1,
                seed2: 2,
            }),
            token: Some(77),
        },
        Message::ServerErrorQuit {
            client_id: ClientId(6),
            code: ErrorCode::Desync,
        },
    ]
}

fn receive(stream: &mut BytesMut, role: Role) -> Result<Vec<Message>, ProtocolError> {
    let mut out = Vec::new();
    while let Some(packet) = split_packet(stream, SEND_MTU)? {
        let raw = RawPacket::parse(&packet)?;
        let kind = PacketKind::for_receiver(raw.kind, role)?;
        out.push(Message::from_raw(kind, &raw)?);
    }
    Ok(out)
}

#[test]
fn test_stream_split_at_odd_boundaries_decodes_every_message() {
    let sent = conversation();
    let wire: Vec<u8> = sent
        .iter()
        .flat_map(|m| m.encode().unwrap().to_vec())
        .collect();

    let mut stream = BytesMut::new();
    let mut received = Vec::new();
    for read in wire.chunks(7) {
        stream.extend_from_slice(read);
        received.extend(receive(&mut stream, Role::Client).unwrap());
    }

    assert!(stream.is_empty());
    assert_eq!(received, sent);
}

#[test]
fn test_stream_server_kind_arriving_at_server_is_rejected() {
    let mut stream = BytesMut::from(&Message::ServerMapDone.encode().unwrap()[..]);
    let err = receive(&mut stream, Role::Server).unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidPacketKind(_)));
}

#[test]
fn test_stream_partial_header_waits_for_more_bytes() {
    let packet = Message::ClientQuit.encode().unwrap();
    let mut stream = BytesMut::from(&packet[..1]);
    assert!(receive(&mut stream, Role::Server).unwrap().is_empty());
    stream.extend_from_slice(&packet[1..]);
    assert_eq!(receive(&mut stream, Role::Server).unwrap(), vec![Message::ClientQuit]);
}
