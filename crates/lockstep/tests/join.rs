//! Join handshake, refusals, and map transfer between in-memory nodes.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{Counter, Net, client_config, client_sim, server_config};
use lockstep::prelude::*;
use lockstep_protocol::Message;
use lockstep_session::ConnectionState;
use lockstep_sync::TransferConfig;

#[test]
fn test_join_reaches_synchronized_on_both_sides() {
    let mut net = Net::new(server_config());
    let a = net.join_new("alice");

    let client = net.client(a);
    assert_eq!(client.client_id(), ClientId::FIRST_REMOTE);
    let handle = net.remotes[a].handle;
    let peer = net.server.peer(handle).unwrap();
    assert_eq!(peer.state(), ConnectionState::Synchronized);
    assert_eq!(peer.name, "alice");

    let events = net.server.drain_events();
    assert!(events.contains(&ServerEvent::ClientJoined {
        client_id: ClientId::FIRST_REMOTE,
        name: "alice".to_string(),
    }));

    let events = net.client_events(a);
    assert!(matches!(events[0], ClientEvent::Welcomed { .. }));
    assert!(events.iter().any(|e| matches!(e, ClientEvent::Synchronized { .. })));
}

#[test]
fn test_join_fourth_client_walks_full_handshake() {
    let sim = Counter {
        required: vec![common::base_content()],
        snapshot_len: 1024,
        ..Counter::default()
    };
    let mut net = Net::with_sim(
        ServerConfig {
            revision: "v1".to_string(),
            transfer: TransferConfig {
                chunk_size: 512,
                chunks_per_tick: 2,
                ..TransferConfig::default()
            },
            ..server_config()
        },
        sim,
    );
    let joiner = |name: &str, company: u8| ClientConfig {
        revision: "v1".to_string(),
        company: CompanyId(company),
        ..client_config(name)
    };
    for name in ["a", "b", "c"] {
        let index = net.connect(joiner(name, 0));
        net.join(index);
    }

    let d = net.connect(joiner("d", 1));
    net.join(d);

    let events = net.client_events(d);
    assert_eq!(events[0], ClientEvent::Welcomed { client_id: ClientId(5) });
    let progress: Vec<(usize, u32)> = events
        .iter()
        .filter_map(|e| match e {
            ClientEvent::MapProgress { received, total } => Some((*received, *total)),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![(0, 1024), (512, 1024), (1024, 1024)]);
    assert_eq!(net.client(d).company(), CompanyId(1));
    assert_eq!(net.client(d).state(), ConnectionState::Synchronized);
}

#[test]
fn test_join_assigns_increasing_client_ids() {
    let mut net = Net::new(server_config());
    let ids: Vec<ClientId> = ["a", "b", "c", "d"]
        .into_iter()
        .map(|name| {
            let index = net.join_new(name);
            net.client(index).client_id()
        })
        .collect();
    assert_eq!(ids, vec![ClientId(2), ClientId(3), ClientId(4), ClientId(5)]);
}

#[test]
fn test_join_existing_clients_learn_about_newcomer() {
    let mut net = Net::new(server_config());
    let a = net.join_new("alice");
    net.client_events(a);

    let b = net.join_new("bob");
    let bob = net.client(b).client_id();
    let events = net.client_events(a);
    assert!(events.contains(&ClientEvent::ClientInfo {
        client_id: bob,
        company: CompanyId::SPECTATOR,
        name: "bob".to_string(),
    }));
    assert!(events.contains(&ClientEvent::ClientJoined { client_id: bob }));

    // The newcomer knows about alice too.
    assert!(net.client(b).clients().contains_key(&net.client(a).client_id()));
}

#[test]
fn test_join_map_snapshot_matches_server_state() {
    let mut net = Net::new(server_config());
    net.server
        .submit_command(CommandPacket::new(CompanyId::SPECTATOR, 3, Bytes::new(), 0))
        .unwrap();
    net.steps(5);
    let before = net.server.simulation().total;
    assert!(before > 0);

    let a = net.join_new("alice");
    net.steps(3);
    assert_eq!(net.client(a).simulation().total, net.server.simulation().total);
    assert_eq!(net.client(a).frame(), Some(net.server.frame()));
}

#[test]
fn test_join_wrong_password_is_refused() {
    let mut net = Net::new(ServerConfig {
        password: Some("secret".to_string()),
        ..server_config()
    });
    let a = net.connect(ClientConfig {
        password: Some("guess".to_string()),
        ..client_config("alice")
    });
    net.pump();

    assert_eq!(
        net.closed_with(a),
        Some(CloseReason::RemoteError(ErrorCode::WrongPassword))
    );
    assert_eq!(net.disconnected.len(), 1);
    assert_eq!(net.disconnected[0].reason, CloseReason::AuthenticationFailed);
    assert_eq!(net.server.connection_count(), 0);
}

#[test]
fn test_join_correct_password_is_admitted() {
    let mut net = Net::new(ServerConfig {
        password: Some("secret".to_string()),
        ..server_config()
    });
    let a = net.connect(ClientConfig {
        password: Some("secret".to_string()),
        ..client_config("alice")
    });
    net.join(a);
    assert!(net.client(a).client_id().is_valid());
}

#[test]
fn test_join_wrong_revision_is_refused() {
    let mut net = Net::new(server_config());
    let a = net.connect(ClientConfig {
        revision: "something-else".to_string(),
        ..client_config("alice")
    });
    assert_eq!(
        net.closed_with(a),
        Some(CloseReason::RemoteError(ErrorCode::WrongRevision))
    );
}

#[test]
fn test_join_duplicate_name_is_refused() {
    let mut net = Net::new(server_config());
    net.join_new("alice");
    let b = net.connect(client_config("alice"));
    net.pump();
    assert_eq!(
        net.closed_with(b),
        Some(CloseReason::RemoteError(ErrorCode::NameInUse))
    );
}

#[test]
fn test_join_full_server_sends_full_notice() {
    let mut net = Net::new(ServerConfig {
        max_clients: 1,
        ..server_config()
    });
    net.join_new("alice");
    let b = net.connect(client_config("bob"));
    assert_eq!(net.closed_with(b), Some(CloseReason::ServerFull));
    let events = net.client_events(b);
    assert!(events.contains(&ClientEvent::Closed {
        reason: CloseReason::ServerFull,
        code: Some(ErrorCode::Full),
    }));
}

#[test]
fn test_join_full_server_refuses_at_accept_before_any_packet() {
    let mut net = Net::new(ServerConfig {
        max_clients: 1,
        ..server_config()
    });
    net.join_new("alice");
    let now = net.now;
    let handle = net.server.accept(now);

    let mut sent: Vec<Bytes> = net
        .server
        .drain_outgoing()
        .into_iter()
        .filter(|(h, _)| *h == handle)
        .flat_map(|(_, packets)| packets)
        .collect();
    let gone = net.server.sweep(now);
    assert_eq!(gone.len(), 1);
    assert_eq!(gone[0].handle, handle);
    assert_eq!(gone[0].reason, CloseReason::ServerFull);
    sent.extend(gone[0].final_packets.iter().cloned());

    assert_eq!(sent, vec![Message::ServerFull.encode().unwrap()]);
    assert!(net.server.peer(handle).is_none());
}

#[test]
fn test_join_missing_content_reports_mismatch() {
    let mut net = Net::new(server_config());
    let a = net.connect_with(client_config("alice"), Counter::default());
    net.pump();

    assert_eq!(net.closed_with(a), Some(CloseReason::ProtocolViolation));
    let gone = net.disconnected.last().unwrap();
    assert_eq!(gone.reason, CloseReason::RemoteError(ErrorCode::ContentMismatch));
}

#[test]
fn test_query_game_info_answers_and_closes() {
    let mut net = Net::new(server_config());
    net.join_new("alice");
    let q = net.query();

    let events = net.client_events(q);
    let info = events
        .iter()
        .find_map(|e| match e {
            ClientEvent::GameInfo(info) => Some(info.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(info.server_name, "test server");
    assert_eq!(info.clients_on, 1);
    assert_eq!(net.closed_with(q), Some(CloseReason::QueryAnswered));
    assert_eq!(net.disconnected.last().unwrap().reason, CloseReason::QueryAnswered);
}

#[test]
fn test_join_second_download_waits_for_free_slot() {
    let mut net = Net::new(ServerConfig {
        transfer: TransferConfig {
            max_concurrent: 1,
            chunk_size: 4,
            chunks_per_tick: 1,
            ..TransferConfig::default()
        },
        ..server_config()
    });
    let a = net.connect(client_config("alice"));
    let b = net.connect(client_config("bob"));
    net.pump();

    let events = net.client_events(b);
    assert!(events.contains(&ClientEvent::Waiting { position: 1 }));
    assert_eq!(net.server.transfers().position(net.remotes[b].handle), Some(1));

    net.join(a);
    net.join(b);
    assert_eq!(net.client(b).state(), ConnectionState::Synchronized);
    assert_eq!(net.server.transfers().active_len(), 0);
}

#[test]
fn test_join_waiting_client_hears_position_again_and_stays_connected() {
    let mut net = Net::new(ServerConfig {
        transfer: TransferConfig {
            max_concurrent: 1,
            ..TransferConfig::default()
        },
        timeouts: TimeoutConfig {
            download_secs: 0,
            ..TimeoutConfig::default()
        },
        ..server_config()
    });
    let a = net.connect(client_config("alice"));
    // Alice never confirms her map, so her slot stays taken.
    net.remotes[a].muted = true;
    let b = net.connect(client_config("bob"));
    net.pump();
    net.client_events(b);

    for _ in 0..40 {
        net.now += Duration::from_secs(2);
        net.step();
    }

    let repeats = net
        .client_events(b)
        .iter()
        .filter(|e| **e == ClientEvent::Waiting { position: 1 })
        .count();
    assert!(repeats >= 40, "only {repeats} wait notices");
    assert_eq!(net.closed_with(b), None);
    assert_eq!(net.server.transfers().position(net.remotes[b].handle), Some(1));
}

#[test]
fn test_join_map_arrives_in_configured_chunks() {
    let mut net = Net::new(ServerConfig {
        transfer: TransferConfig {
            chunk_size: 4,
            chunks_per_tick: 1,
            ..TransferConfig::default()
        },
        ..server_config()
    });
    let a = net.connect(client_config("alice"));
    net.join(a);

    // An unpadded counter snapshot is 8 bytes: two chunks of 4.
    let progress: Vec<usize> = net
        .client_events(a)
        .into_iter()
        .filter_map(|e| match e {
            ClientEvent::MapProgress { received, total } => {
                assert_eq!(total, 8);
                Some(received)
            }
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![0, 4, 8]);
}

#[test]
fn test_join_auth_timeout_drops_silent_connection() {
    let mut net = Net::new(ServerConfig {
        timeouts: TimeoutConfig {
            auth_secs: 1,
            ..TimeoutConfig::default()
        },
        ..server_config()
    });
    let handle = net.server.accept(net.now);
    net.now += std::time::Duration::from_secs(2);
    net.server.tick(net.now);
    let gone = net.server.sweep(net.now);
    assert_eq!(gone.len(), 1);
    assert_eq!(gone[0].handle, handle);
    assert_eq!(gone[0].reason, CloseReason::Timeout);
}

#[test]
fn test_join_client_sim_is_unused_before_snapshot() {
    let mut net = Net::new(server_config());
    let sim = Counter {
        total: 999,
        ..client_sim()
    };
    let a = net.connect_with(client_config("alice"), sim);
    net.join(a);
    assert_eq!(net.client(a).simulation().total, net.server.simulation().total);
}

