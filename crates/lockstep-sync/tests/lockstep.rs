//! Runs one `FrameServer` against several `FrameClient`s, moving packets
//! by hand, and checks that every simulation ends up identical.

use std::time::Instant;

use bytes::Bytes;
use lockstep_protocol::{
    ClientId, CommandPacket, CompanyId, Message, PacketKind, RawPacket, Role, SyncSeeds,
};
use lockstep_session::{ConnectionRegistry, ConnectionState, PeerConnection, PeerHandle};
use lockstep_sync::{FrameClient, FrameServer, Simulation, SyncConfig, SyncError};

/// Sums command ids into a running total; optionally drifts to fake a
/// non-deterministic peer.
#[derive(Default)]
struct Counter {
    total: u64,
    drift: bool,
}

impl Simulation for Counter {
    fn execute(&mut self, frame: u32, cmd: &CommandPacket) {
        self.total += u64::from(cmd.cmd) * u64::from(frame);
    }

    fn advance(&mut self, frame: u32) {
        if self.drift && frame == 7 {
            self.total += 1;
        }
    }

    fn sync_seeds(&self) -> SyncSeeds {
        SyncSeeds {
            seed1: self.total as u32,
            seed2: (self.total >> 32) as u32,
        }
    }

    fn snapshot(&self) -> Result<Bytes, String> {
        Ok(Bytes::copy_from_slice(&self.total.to_le_bytes()))
    }

    fn load_snapshot(&mut self, data: &[u8]) -> Result<(), String> {
        let bytes: [u8; 8] = data.try_into().map_err(|_| "bad snapshot".to_string())?;
        self.total = u64::from_le_bytes(bytes);
        Ok(())
    }
}

struct Remote {
    handle: PeerHandle,
    sync: FrameClient,
    sim: Counter,
}

fn synchronized(id: u32) -> PeerConnection {
    let now = Instant::now();
    let mut peer = PeerConnection::new(Role::Server, now);
    while peer.state() != ConnectionState::Synchronized {
        peer.advance(now).unwrap();
    }
    peer.client_id = ClientId(id);
    peer
}

fn decode(packet: &[u8]) -> Message {
    let raw = RawPacket::parse(packet).unwrap();
    let kind = PacketKind::for_receiver(raw.kind, Role::Client).unwrap();
    Message::from_raw(kind, &raw).unwrap()
}

/// Delivers everything queued for `remote` and runs its frames. Acks go
/// straight back into the server.
fn pump(
    server: &FrameServer,
    peers: &mut ConnectionRegistry<PeerConnection>,
    remote: &mut Remote,
) -> Result<(), SyncError> {
    let peer = peers.get_mut(remote.handle).unwrap();
    let mut acks = Vec::new();
    for packet in peer.drain_outbound() {
        match decode(&packet) {
            Message::ServerCommand(cmd) => remote.sync.on_command(cmd)?,
            Message::ServerFrame { frame, frame_max, seeds, token } => {
                acks.extend(remote.sync.on_frame(frame, frame_max, seeds, token)?);
            }
            Message::ServerSync { frame, seeds } => remote.sync.on_sync(frame, seeds)?,
            other => panic!("unexpected {other:?}"),
        }
        acks.extend(remote.sync.catch_up(&mut remote.sim)?);
    }
    for ack in acks {
        let Message::ClientAck { frame, token } = ack else { unreachable!() };
        server.handle_ack(peer, frame, token)?;
    }
    Ok(())
}

fn tick(
    server: &mut FrameServer,
    peers: &mut ConnectionRegistry<PeerConnection>,
    sim: &mut Counter,
) {
    let distributed = server.distribute(peers, &*sim);
    assert!(distributed.failed.is_empty());
    server.advance(sim);
    server.announce(peers).unwrap();
}

fn config() -> SyncConfig {
    SyncConfig {
        frame_freq: 1,
        command_delay: 3,
        sync_freq: 5,
        token_interval: 4,
        ack_interval: 3,
        ..SyncConfig::default()
    }
}

#[test]
fn test_all_peers_apply_same_commands_at_same_frames() {
    let mut server = FrameServer::new(config(), 0);
    let mut host = Counter::default();
    let mut peers = ConnectionRegistry::new();
    let mut remotes: Vec<Remote> = (2..4)
        .map(|id| Remote {
            handle: peers.insert(synchronized(id)),
            sync: FrameClient::new(0, config().ack_interval),
            sim: Counter::default(),
        })
        .collect();

    for round in 0..30u32 {
        if round % 4 == 0 {
            server
                .submit(CommandPacket::new(CompanyId(0), round + 1, Vec::new(), 0))
                .unwrap();
        }
        if round % 3 == 0 {
            let peer = peers.get_mut(remotes[0].handle).unwrap();
            let cmd = CommandPacket::new(CompanyId(1), 100 + round, Vec::new(), 0);
            server.queue_command(peer, cmd, &host).unwrap();
        }
        tick(&mut server, &mut peers, &mut host);
        for remote in &mut remotes {
            pump(&server, &mut peers, remote).unwrap();
        }
    }

    for remote in &remotes {
        assert!(remote.sync.frame() >= server.frame());
        assert!(remote.sync.frame() <= server.frame_max());
        let peer = peers.get(remote.handle).unwrap();
        assert!(peer.last_frame <= peer.last_frame_server);
    }
    // Clients run one frame past the server and have executed the same
    // commands there.
    let frame = server.frame();
    for remote in &remotes {
        assert_eq!(remote.sync.frame(), frame + 1);
    }
    assert_eq!(remotes[0].sim.total, remotes[1].sim.total);
    assert_ne!(remotes[0].sim.total, 0);
}

#[test]
fn test_drifting_client_detects_checksum_mismatch() {
    let mut server = FrameServer::new(config(), 0);
    let mut host = Counter::default();
    let mut peers = ConnectionRegistry::new();
    let mut remote = Remote {
        handle: peers.insert(synchronized(2)),
        sync: FrameClient::new(0, config().ack_interval),
        sim: Counter {
            drift: true,
            ..Counter::default()
        },
    };

    let mut result = Ok(());
    for _ in 0..20 {
        tick(&mut server, &mut peers, &mut host);
        result = pump(&server, &mut peers, &mut remote);
        if result.is_err() {
            break;
        }
    }
    let err = result.unwrap_err();
    assert!(matches!(err, SyncError::ChecksumMismatch { frame: 10, .. }), "{err}");
}

#[test]
fn test_silent_client_times_out() {
    let config = SyncConfig {
        max_lag_frames: 40,
        ..config()
    };
    let mut server = FrameServer::new(config, 0);
    let mut host = Counter::default();
    let mut peers = ConnectionRegistry::new();
    let handle = peers.insert(synchronized(2));

    let mut timed_out_at = None;
    for _ in 0..60 {
        tick(&mut server, &mut peers, &mut host);
        peers.get_mut(handle).unwrap().drain_outbound();
        if let Err(err) = server.check_lag(peers.get(handle).unwrap()) {
            assert!(matches!(err, SyncError::Timeout { .. }));
            timed_out_at = Some(server.frame());
            break;
        }
    }
    assert_eq!(timed_out_at, Some(41));
}
