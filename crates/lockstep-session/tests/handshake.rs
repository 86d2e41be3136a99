//! Drives a server-side and a client-side `PeerConnection` through the
//! authentication steps of the handshake, passing packets by hand.

use std::time::Instant;

use lockstep_protocol::{ClientId, CompanyId, ErrorCode, Message, Role};
use lockstep_session::{
    ClientAuthHandshake, CloseReason, ConnectionRegistry, ConnectionState, PacketCipher,
    PeerConnection, PendingDeletion, ServerAuthHandshake, SessionError, SessionKeys, stream_nonce,
};

/// Moves every queued packet from `from` into `to`, returning the decoded
/// messages in order.
fn deliver(from: &mut PeerConnection, to: &mut PeerConnection) -> Vec<Message> {
    from.drain_outbound()
        .iter()
        .map(|p| to.receive(p, Instant::now()).expect("packet should be accepted"))
        .collect()
}

#[test]
fn test_handshake_switches_both_sides_to_encryption() {
    let now = Instant::now();
    let mut server = PeerConnection::new(Role::Server, now);
    let mut client = PeerConnection::new(Role::Client, now);

    client
        .send(&Message::ClientJoin {
            revision: "v1".into(),
            company: CompanyId(1),
        })
        .unwrap();
    let msgs = deliver(&mut client, &mut server);
    assert!(matches!(msgs[0], Message::ClientJoin { .. }));

    // Server: join accepted, ask for authentication.
    let auth = ServerAuthHandshake::new(Some("secret"));
    server.send(&auth.request()).unwrap();
    server.advance(now).unwrap();

    let msgs = deliver(&mut server, &mut client);
    let Message::ServerAuthRequest { method, public_key, nonce } = msgs[0].clone() else {
        panic!("expected auth request, got {:?}", msgs[0]);
    };
    let (response, client_keys) = ClientAuthHandshake::new(Some("secret"))
        .respond(method, &public_key, &nonce)
        .unwrap();
    client.send(&response).unwrap();
    client.advance(now).unwrap();

    let msgs = deliver(&mut client, &mut server);
    let Message::ClientAuthResponse { public_key, mac, challenge } = msgs[0].clone() else {
        panic!("expected auth response");
    };
    let server_keys = auth.verify(&public_key, &mac, &challenge).unwrap();

    // Enable-encryption itself travels in the clear.
    let stream = stream_nonce();
    server.send(&Message::ServerEnableEncryption { nonce: stream }).unwrap();
    server.enable_encryption(PacketCipher::new(&server_keys, stream, Role::Server));
    server.advance(now).unwrap();

    let msgs = deliver(&mut server, &mut client);
    let Message::ServerEnableEncryption { nonce } = msgs[0] else {
        panic!("expected enable-encryption");
    };
    client.enable_encryption(PacketCipher::new(&client_keys, nonce, Role::Client));
    client.advance(now).unwrap();
    assert_eq!(client.state(), ConnectionState::Identifying);

    // From here on both directions are sealed.
    client
        .send(&Message::ClientIdentify {
            name: "alice".into(),
            company: CompanyId::SPECTATOR,
        })
        .unwrap();
    let msgs = deliver(&mut client, &mut server);
    assert_eq!(
        msgs[0],
        Message::ClientIdentify {
            name: "alice".into(),
            company: CompanyId::SPECTATOR
        }
    );
    assert!(server.is_encrypted() && client.is_encrypted());
}

/// Runs the key exchange without peers and returns (server, client) keys.
fn exchange_keys() -> (SessionKeys, SessionKeys) {
    let auth = ServerAuthHandshake::new(None);
    let Message::ServerAuthRequest { method, public_key, nonce } = auth.request() else {
        unreachable!()
    };
    let (resp, client_keys) = ClientAuthHandshake::default()
        .respond(method, &public_key, &nonce)
        .unwrap();
    let Message::ClientAuthResponse { public_key, mac, challenge } = resp else {
        unreachable!()
    };
    (auth.verify(&public_key, &mac, &challenge).unwrap(), client_keys)
}

#[test]
fn test_plaintext_after_encryption_is_rejected() {
    let now = Instant::now();
    let (keys, _) = exchange_keys();
    let mut server = PeerConnection::new(Role::Server, now);
    server.enable_encryption(PacketCipher::new(&keys, stream_nonce(), Role::Server));

    let plain = Message::ClientQuit.encode().unwrap();
    let err = server.receive(&plain, now).unwrap_err();
    assert!(matches!(err, SessionError::DecryptionFailed));
    assert_eq!(err.close_reason(), CloseReason::ProtocolViolation);
}

#[test]
fn test_quit_handler_closing_own_connection_survives_until_sweep() {
    let now = Instant::now();
    let mut registry = ConnectionRegistry::new();
    let handle = registry.insert(PeerConnection::new(Role::Server, now));
    let other = registry.insert(PeerConnection::new(Role::Server, now));

    // Inside the "handler": the connection closes itself and is still usable.
    {
        let peer = registry.get_mut(handle).unwrap();
        let quit = Message::ClientQuit.encode().unwrap();
        let msg = peer.receive(&quit, now).unwrap();
        assert_eq!(msg, Message::ClientQuit);
        peer.close(CloseReason::RemoteQuit, None, now);
        assert!(peer.is_pending_deletion());
        assert_eq!(peer.close_reason(), Some(CloseReason::RemoteQuit));
    }
    assert!(registry.contains(handle));

    let removed = registry.sweep();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].1.close_reason(), Some(CloseReason::RemoteQuit));
    assert!(registry.get(handle).is_none());
    assert!(registry.contains(other));
}

#[test]
fn test_error_close_after_queued_packets_still_opens_on_client() {
    let now = Instant::now();
    let (server_keys, client_keys) = exchange_keys();
    let stream = stream_nonce();
    let mut server = PeerConnection::new(Role::Server, now);
    let mut client = PeerConnection::new(Role::Client, now);
    server.enable_encryption(PacketCipher::new(&server_keys, stream, Role::Server));
    client.enable_encryption(PacketCipher::new(&client_keys, stream, Role::Client));

    // Delivered normally first, so both counters have moved.
    server.send(&Message::ServerShutdown).unwrap();
    assert_eq!(deliver(&mut server, &mut client), vec![Message::ServerShutdown]);

    // Queued but never sent: the error close throws these away.
    server.send(&Message::ServerJoin { client_id: ClientId(3) }).unwrap();
    server.send(&Message::ServerNewGame).unwrap();
    server.close(
        CloseReason::Timeout,
        Some(Message::ServerError { code: ErrorCode::TimeoutComputer }),
        now,
    );

    let msgs = deliver(&mut server, &mut client);
    assert_eq!(msgs, vec![Message::ServerError { code: ErrorCode::TimeoutComputer }]);
}
