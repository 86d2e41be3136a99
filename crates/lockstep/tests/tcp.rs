//! The tokio drivers over real TCP sockets on localhost.

mod common;

use std::time::{Duration, Instant};

use bytes::Bytes;
use common::{Counter, base_content, client_config, client_sim, server_config};
use lockstep::prelude::*;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn fast_clock() -> FrameClockConfig {
    FrameClockConfig::with_interval_ms(10)
}

async fn wait_for<E, F>(rx: &mut mpsc::UnboundedReceiver<E>, mut pred: F) -> E
where
    F: FnMut(&E) -> bool,
{
    timeout(WAIT, async {
        while let Some(event) = rx.recv().await {
            if pred(&event) {
                return event;
            }
        }
        panic!("event channel closed");
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_tcp_client_joins_and_commands_replicate() {
    let config = ServerConfig {
        clock: fast_clock(),
        ..server_config()
    };
    let sim = Counter {
        required: vec![base_content()],
        ..Counter::default()
    };
    let (server_events_tx, mut server_events) = mpsc::unbounded_channel();
    let runtime = ServerRuntime::bind("127.0.0.1:0", GameServer::new(config, sim))
        .await
        .unwrap()
        .with_events(server_events_tx);
    let addr = runtime.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(runtime.run(async {
        let _ = stop_rx.await;
    }));

    let conn = TcpConnection::connect(addr).await.unwrap();
    let client = GameClient::new(client_config("alice"), client_sim(), Instant::now());
    let (requests, requests_rx) = mpsc::unbounded_channel();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let client_task = tokio::spawn(run_client(
        client,
        conn,
        fast_clock(),
        requests_rx,
        Some(events_tx),
    ));

    wait_for(&mut events, |e| matches!(e, ClientEvent::Synchronized { .. })).await;
    wait_for(&mut server_events, |e| matches!(e, ServerEvent::ClientJoined { .. })).await;

    requests
        .send(ClientRequest::Command(CommandPacket::new(
            CompanyId::SPECTATOR,
            4,
            Bytes::new(),
            0,
        )))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    requests.send(ClientRequest::Quit).unwrap();

    let client = timeout(WAIT, client_task).await.unwrap().unwrap().unwrap();
    assert_eq!(client.close_reason(), Some(CloseReason::Shutdown));
    wait_for(&mut server_events, |e| {
        matches!(e, ServerEvent::ClientLeft { reason: CloseReason::RemoteQuit, .. })
    })
    .await;

    stop_tx.send(()).unwrap();
    let server = timeout(WAIT, server_task).await.unwrap().unwrap().unwrap();
    assert!(client.simulation().total > 0);
    assert_eq!(client.simulation().total, server.simulation().total);
}

#[tokio::test]
async fn test_tcp_server_shutdown_disconnects_client() {
    let config = ServerConfig {
        clock: fast_clock(),
        ..server_config()
    };
    let runtime = ServerRuntime::bind("127.0.0.1:0", GameServer::new(config, Counter::default()))
        .await
        .unwrap();
    let addr = runtime.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(runtime.run(async {
        let _ = stop_rx.await;
    }));

    let conn = TcpConnection::connect(addr).await.unwrap();
    let client = GameClient::new(client_config("bob"), client_sim(), Instant::now());
    let (_requests, requests_rx) = mpsc::unbounded_channel();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let client_task = tokio::spawn(run_client(
        client,
        conn,
        fast_clock(),
        requests_rx,
        Some(events_tx),
    ));
    wait_for(&mut events, |e| matches!(e, ClientEvent::Synchronized { .. })).await;

    stop_tx.send(()).unwrap();
    timeout(WAIT, server_task).await.unwrap().unwrap().unwrap();
    let client = timeout(WAIT, client_task).await.unwrap().unwrap().unwrap();
    assert_eq!(client.close_reason(), Some(CloseReason::Shutdown));
}
