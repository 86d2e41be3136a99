//! A tally game on Lockstep.
//!
//! Every company has a counter; the only command adds to one. It is just
//! enough of a game to watch joins, map transfers and checksums work.
//!
//! ```text
//! counter-server [config.json]          host on 0.0.0.0:3979
//! counter-server join <addr> <name>     join and add 1 every second
//! ```

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lockstep::prelude::*;
use lockstep::{RCON_COLOUR_DEFAULT, RCON_COLOUR_ERROR};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

const BIND_ADDR: &str = "0.0.0.0:3979";
const CMD_ADD: u32 = 1;

// ---------------------------------------------------------------------------
// Game
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tally {
    counters: BTreeMap<u8, u64>,
    frame: u32,
}

impl Simulation for Tally {
    fn execute(&mut self, _frame: u32, cmd: &CommandPacket) {
        if cmd.cmd == CMD_ADD {
            let amount = cmd.data.first().copied().unwrap_or(1);
            *self.counters.entry(cmd.company.0).or_default() += u64::from(amount);
        }
    }

    fn advance(&mut self, frame: u32) {
        self.frame = frame;
    }

    fn sync_seeds(&self) -> SyncSeeds {
        let mut seed1 = 0x9e37_79b9u32;
        let mut seed2 = self.frame;
        for (company, value) in &self.counters {
            seed1 = seed1.rotate_left(5) ^ u32::from(*company) ^ (*value as u32);
            seed2 = seed2.wrapping_mul(31).wrapping_add((*value >> 32) as u32);
        }
        SyncSeeds { seed1, seed2 }
    }

    fn snapshot(&self) -> Result<Bytes, String> {
        serde_json::to_vec(self).map(Bytes::from).map_err(|e| e.to_string())
    }

    fn load_snapshot(&mut self, data: &[u8]) -> Result<(), String> {
        *self = serde_json::from_slice(data).map_err(|e| e.to_string())?;
        Ok(())
    }

    fn validate_command(&self, _client: ClientId, cmd: &CommandPacket) -> Result<(), String> {
        if cmd.cmd != CMD_ADD {
            return Err(format!("unknown command {}", cmd.cmd));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

async fn host(config: ServerConfig) -> Result<(), LockstepError> {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (requests, requests_rx) = mpsc::unbounded_channel();
    let runtime = ServerRuntime::bind(BIND_ADDR, GameServer::new(config, Tally::default()))
        .await?
        .with_events(events_tx)
        .with_requests(requests_rx);

    // Answers rcon commands with what the server knows from its events.
    tokio::spawn(async move {
        let mut players = BTreeMap::new();
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::ClientJoined { client_id, name } => {
                    players.insert(client_id, name);
                }
                ServerEvent::ClientLeft { client_id, .. } => {
                    players.remove(&client_id);
                }
                ServerEvent::Rcon { client_id, command } => {
                    let (colour, output) = match command.trim() {
                        "clients" => (
                            RCON_COLOUR_DEFAULT,
                            players
                                .iter()
                                .map(|(id, name)| format!("{id}: {name}"))
                                .collect::<Vec<_>>()
                                .join("\n"),
                        ),
                        other => (RCON_COLOUR_ERROR, format!("unknown command '{other}'")),
                    };
                    let _ = requests.send(ServerRequest::RconReply {
                        client_id,
                        colour,
                        output,
                    });
                }
                other => info!(?other, "server event"),
            }
        }
    });

    let server = runtime
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    info!(frame = server.frame(), counters = ?server.simulation().counters, "final state");
    Ok(())
}

// ---------------------------------------------------------------------------
// Player
// ---------------------------------------------------------------------------

async fn join(addr: &str, name: &str) -> Result<(), LockstepError> {
    let conn = TcpConnection::connect(addr).await?;
    let config = ClientConfig {
        name: name.to_string(),
        company: CompanyId(0),
        ..ClientConfig::default()
    };
    let client = GameClient::new(config, Tally::default(), Instant::now());
    let (requests, requests_rx) = mpsc::unbounded_channel();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let driver = tokio::spawn(run_client(
        client,
        conn,
        FrameClockConfig::default(),
        requests_rx,
        Some(events_tx),
    ));

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut synchronized = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ClientEvent::Synchronized { frame }) => {
                    info!(frame, "in game");
                    synchronized = true;
                }
                Some(ClientEvent::Closed { reason, code }) => {
                    warn!(%reason, ?code, "left the game");
                    break;
                }
                Some(other) => info!(?other, "client event"),
                None => break,
            },
            _ = ticker.tick(), if synchronized => {
                let cmd = CommandPacket::new(CompanyId(0), CMD_ADD, Bytes::from_static(&[1]), 0);
                if requests.send(ClientRequest::Command(cmd)).is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                let _ = requests.send(ClientRequest::Quit);
            }
        }
    }

    match driver.await {
        Ok(result) => {
            let client = result?;
            info!(counters = ?client.simulation().counters, "final state");
        }
        Err(e) => warn!(error = %e, "client task failed"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging("info,lockstep=debug");

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [mode, addr, name] if mode == "join" => join(addr, name).await?,
        [path] => host(ServerConfig::load(path)?).await?,
        [] => host(ServerConfig::default()).await?,
        _ => {
            eprintln!("usage: counter-server [config.json] | counter-server join <addr> <name>");
            std::process::exit(2);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(company: u8, amount: u8) -> CommandPacket {
        CommandPacket::new(CompanyId(company), CMD_ADD, Bytes::copy_from_slice(&[amount]), 0)
    }

    #[test]
    fn test_tally_snapshot_restores_counters_and_seeds() {
        let mut tally = Tally::default();
        tally.execute(1, &add(0, 3));
        tally.execute(1, &add(2, 5));
        tally.advance(1);

        let mut copy = Tally::default();
        copy.load_snapshot(&tally.snapshot().unwrap()).unwrap();
        assert_eq!(copy.counters, tally.counters);
        assert_eq!(copy.sync_seeds(), tally.sync_seeds());
    }

    #[test]
    fn test_tally_seeds_differ_after_different_commands() {
        let mut a = Tally::default();
        let mut b = Tally::default();
        a.execute(1, &add(0, 1));
        b.execute(1, &add(0, 2));
        assert_ne!(a.sync_seeds(), b.sync_seeds());
    }

    #[test]
    fn test_tally_rejects_unknown_command() {
        let tally = Tally::default();
        let cmd = CommandPacket::new(CompanyId(0), 99, Bytes::new(), 0);
        assert!(tally.validate_command(ClientId(2), &cmd).is_err());
    }
}
