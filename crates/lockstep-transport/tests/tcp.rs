//! Integration tests for the TCP transport.
//!
//! These spin up a real listener on an OS-assigned port and check that
//! packets survive the trip whole, however the stream happens to chunk
//! them.

use std::time::Duration;

use lockstep_protocol::{Message, PacketKind, RawPacket};
use lockstep_transport::{Connection, TcpConnection, TcpTransport, Transport, TransportError};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

async fn listener() -> (TcpTransport, String) {
    let transport = TcpTransport::bind("127.0.0.1:0").await.expect("should bind");
    let addr = transport.local_addr().expect("bound address").to_string();
    (transport, addr)
}

#[tokio::test]
async fn test_tcp_accept_and_send_receive() {
    let (mut transport, addr) = listener().await;
    let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });
    let client = TcpConnection::connect(&addr).await.expect("should connect");
    let server_conn = server.await.expect("task should complete");
    assert_eq!(server_conn.peer_addr(), client.local_addr());
    assert_eq!(client.peer_addr(), server_conn.local_addr());

    let join = Message::ClientJoin {
        revision: "v1".into(),
        company: lockstep_protocol::CompanyId(1),
    };
    client.send(&join.encode().unwrap()).await.expect("send");

    let packet = server_conn.recv().await.expect("recv").expect("packet");
    let raw = RawPacket::parse(&packet).unwrap();
    assert_eq!(raw.kind, PacketKind::ClientJoin as u8);
    assert_eq!(Message::decode(PacketKind::ClientJoin, &raw.payload).unwrap(), join);
}

#[tokio::test]
async fn test_tcp_recv_reassembles_split_and_coalesced_packets() {
    let (mut transport, addr) = listener().await;
    let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });
    let mut raw_client = TcpStream::connect(&addr).await.expect("should connect");
    let server_conn = server.await.expect("task should complete");

    let first = Message::ClientAck { frame: 1, token: 0 }.encode().unwrap();
    let second = Message::ClientAck { frame: 2, token: 0 }.encode().unwrap();

    // Both packets in one write, then the second half of a third one later.
    let mut both = first.to_vec();
    both.extend_from_slice(&second);
    let third = Message::ClientAck { frame: 3, token: 9 }.encode().unwrap();
    both.extend_from_slice(&third[..4]);
    raw_client.write_all(&both).await.unwrap();

    assert_eq!(server_conn.recv().await.unwrap().unwrap(), first);
    assert_eq!(server_conn.recv().await.unwrap().unwrap(), second);

    tokio::time::sleep(Duration::from_millis(20)).await;
    raw_client.write_all(&third[4..]).await.unwrap();
    assert_eq!(server_conn.recv().await.unwrap().unwrap(), third);
}

#[tokio::test]
async fn test_tcp_recv_clean_close_returns_none() {
    let (mut transport, addr) = listener().await;
    let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });
    let client = TcpConnection::connect(&addr).await.expect("should connect");
    let server_conn = server.await.expect("task should complete");

    client.close().await.expect("close");
    assert!(server_conn.recv().await.expect("recv").is_none());
}

#[tokio::test]
async fn test_tcp_recv_close_mid_packet_returns_error() {
    let (mut transport, addr) = listener().await;
    let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });
    let mut raw_client = TcpStream::connect(&addr).await.expect("should connect");
    let server_conn = server.await.expect("task should complete");

    let packet = Message::ClientAck { frame: 1, token: 0 }.encode().unwrap();
    raw_client.write_all(&packet[..3]).await.unwrap();
    raw_client.shutdown().await.unwrap();

    let result = server_conn.recv().await;
    assert!(matches!(result, Err(TransportError::PartialPacket { pending: 3 })));
}

#[tokio::test]
async fn test_tcp_accept_after_shutdown_returns_shutdown() {
    let (mut transport, _addr) = listener().await;
    transport.shutdown().await.unwrap();
    assert!(matches!(transport.accept().await, Err(TransportError::Shutdown)));
}
