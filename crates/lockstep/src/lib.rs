//! # Lockstep
//!
//! Deterministic lockstep multiplayer over TCP.
//!
//! Every participant runs the same [`Simulation`](lockstep_sync::Simulation).
//! Only player commands travel the wire: the server stamps each with the
//! frame it must execute at and tells clients how far they may run, so all
//! copies of the game stay identical. Checksums catch the copies that
//! drift anyway.
//!
//! The crate puts the lower layers together into two nodes:
//!
//! - [`GameServer`]: accepts connections, walks them through the join,
//!   streams them the map, and runs the authoritative frame loop
//! - [`GameClient`]: joins a server, loads the map, and follows the frames
//!
//! Both are sans-IO. [`ServerRuntime`] and [`run_client`] drive them on
//! tokio with a TCP transport and a [`FrameClock`](lockstep_tick::FrameClock).
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lockstep::prelude::*;
//!
//! init_logging("info");
//! let config = ServerConfig::load("server.json")?;
//! let server = GameServer::new(config, MyGame::default());
//! let runtime = ServerRuntime::bind("0.0.0.0:3979", server).await?;
//! runtime.run(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! ```

mod client;
mod config;
mod error;
mod handler;
mod logging;
mod net;
mod server;

pub use client::{ClientEvent, ClientInfo, GameClient};
pub use config::{ClientConfig, DEFAULT_REVISION, ServerConfig, TimeoutConfig};
pub use error::LockstepError;
pub use logging::init_logging;
pub use net::{ClientRequest, ServerRequest, ServerRuntime, run_client};
pub use server::{
    Disconnected, GameServer, RCON_COLOUR_DEFAULT, RCON_COLOUR_ERROR, ServerEvent,
};

/// Everything a game needs to host or join.
pub mod prelude {
    pub use crate::{
        ClientConfig, ClientEvent, ClientRequest, Disconnected, GameClient, GameServer,
        LockstepError, ServerConfig, ServerEvent, ServerRequest, ServerRuntime, TimeoutConfig,
        init_logging, run_client,
    };
    pub use lockstep_protocol::{
        ClientId, CommandPacket, CompanyId, ContentId, DestType, ErrorCode, NetworkAction,
        SyncSeeds,
    };
    pub use lockstep_session::CloseReason;
    pub use lockstep_sync::{PauseReason, Simulation};
    pub use lockstep_tick::FrameClockConfig;
    pub use lockstep_transport::TcpConnection;
}
