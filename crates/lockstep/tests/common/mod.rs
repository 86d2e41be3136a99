//! In-memory network shared by the node tests: one [`GameServer`] and any
//! number of [`GameClient`]s, with packets moved by hand.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use bytes::Bytes;
use lockstep::prelude::*;
use lockstep_session::{ConnectionState, PeerHandle};

/// Frame length the tests pretend to run at.
pub const FRAME: Duration = Duration::from_millis(30);

/// Sums `cmd * frame` over every executed command. Optionally drifts by
/// one every frame to fake a broken peer.
#[derive(Debug, Default)]
pub struct Counter {
    pub total: u64,
    pub drift: bool,
    pub required: Vec<ContentId>,
    pub installed: Vec<ContentId>,
    /// Pads the snapshot to this many bytes.
    pub snapshot_len: usize,
}

impl Simulation for Counter {
    fn execute(&mut self, frame: u32, cmd: &CommandPacket) {
        self.total += u64::from(cmd.cmd) * u64::from(frame);
    }

    fn advance(&mut self, _frame: u32) {
        if self.drift {
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
        let mut data = self.total.to_le_bytes().to_vec();
        data.resize(self.snapshot_len.max(8), 0);
        Ok(Bytes::from(data))
    }

    fn load_snapshot(&mut self, data: &[u8]) -> Result<(), String> {
        let bytes: [u8; 8] = data
            .get(..8)
            .and_then(|head| head.try_into().ok())
            .ok_or_else(|| "bad snapshot".to_string())?;
        self.total = u64::from_le_bytes(bytes);
        Ok(())
    }

    fn required_content(&self) -> Vec<ContentId> {
        self.required.clone()
    }

    fn has_content(&self, content: &ContentId) -> bool {
        self.installed.contains(content)
    }
}

/// Content every test client has installed.
pub fn base_content() -> ContentId {
    ContentId {
        id: 1,
        checksum: [7; 16],
    }
}

pub fn client_sim() -> Counter {
    Counter {
        installed: vec![base_content()],
        ..Counter::default()
    }
}

pub fn server_config() -> ServerConfig {
    ServerConfig {
        server_name: "test server".to_string(),
        ..ServerConfig::default()
    }
}

pub fn client_config(name: &str) -> ClientConfig {
    ClientConfig {
        name: name.to_string(),
        ..ClientConfig::default()
    }
}

pub struct Remote {
    pub handle: PeerHandle,
    pub client: GameClient<Counter>,
    /// Drops everything this client sends, as if its uplink died.
    pub muted: bool,
}

pub struct Net {
    pub server: GameServer<Counter>,
    pub remotes: Vec<Remote>,
    pub now: Instant,
    pub disconnected: Vec<Disconnected>,
}

impl Net {
    pub fn new(config: ServerConfig) -> Self {
        let sim = Counter {
            required: vec![base_content()],
            ..Counter::default()
        };
        Self::with_sim(config, sim)
    }

    pub fn with_sim(config: ServerConfig, sim: Counter) -> Self {
        Self {
            server: GameServer::new(config, sim),
            remotes: Vec::new(),
            now: Instant::now(),
            disconnected: Vec::new(),
        }
    }

    /// Opens a connection and sends the join. Returns the client's index.
    pub fn connect(&mut self, config: ClientConfig) -> usize {
        self.connect_with(config, client_sim())
    }

    pub fn connect_with(&mut self, config: ClientConfig, sim: Counter) -> usize {
        let handle = self.server.accept(self.now);
        let mut client = GameClient::new(config, sim, self.now);
        client.start().unwrap();
        self.remotes.push(Remote {
            handle,
            client,
            muted: false,
        });
        self.pump();
        self.remotes.len() - 1
    }

    /// Opens a connection that only asks for the game info.
    pub fn query(&mut self) -> usize {
        let handle = self.server.accept(self.now);
        let mut client = GameClient::new(ClientConfig::default(), client_sim(), self.now);
        client.query_game_info().unwrap();
        self.remotes.push(Remote {
            handle,
            client,
            muted: false,
        });
        self.pump();
        self.remotes.len() - 1
    }

    pub fn client(&self, index: usize) -> &GameClient<Counter> {
        &self.remotes[index].client
    }

    pub fn client_mut(&mut self, index: usize) -> &mut GameClient<Counter> {
        &mut self.remotes[index].client
    }

    /// Moves packets both ways and sweeps until nothing moves.
    pub fn pump(&mut self) {
        loop {
            let mut moved = false;
            for (handle, packets) in self.server.drain_outgoing() {
                if let Some(remote) = self.remotes.iter_mut().find(|r| r.handle == handle) {
                    for packet in packets {
                        remote.client.receive(&packet, self.now);
                        moved = true;
                    }
                }
            }
            for remote in &mut self.remotes {
                for packet in remote.client.drain_outbound() {
                    if !remote.muted {
                        self.server.receive(remote.handle, &packet, self.now);
                        moved = true;
                    }
                }
            }
            for gone in self.server.sweep(self.now) {
                if let Some(remote) = self.remotes.iter_mut().find(|r| r.handle == gone.handle) {
                    for packet in &gone.final_packets {
                        remote.client.receive(packet, self.now);
                    }
                    remote.client.connection_lost(self.now);
                }
                self.disconnected.push(gone);
                moved = true;
            }
            if !moved {
                break;
            }
        }
    }

    /// One frame on every node.
    pub fn step(&mut self) {
        self.now += FRAME;
        self.server.tick(self.now);
        self.pump();
        for remote in &mut self.remotes {
            remote.client.tick(self.now);
        }
        self.pump();
    }

    pub fn steps(&mut self, n: usize) {
        for _ in 0..n {
            self.step();
        }
    }

    /// Steps until client `index` is synchronized, or panics.
    pub fn join(&mut self, index: usize) {
        for _ in 0..200 {
            if self.client(index).state() == ConnectionState::Synchronized {
                return;
            }
            self.step();
        }
        panic!("client {index} never synchronized: {:?}", self.client(index).state());
    }

    /// Connects and steps until synchronized.
    pub fn join_new(&mut self, name: &str) -> usize {
        let index = self.connect(client_config(name));
        self.join(index);
        index
    }

    pub fn client_events(&mut self, index: usize) -> Vec<ClientEvent> {
        self.remotes[index].client.drain_events()
    }

    pub fn closed_with(&self, index: usize) -> Option<CloseReason> {
        self.client(index).close_reason()
    }
}
