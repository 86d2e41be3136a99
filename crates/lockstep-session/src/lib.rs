//! Connection lifecycle for Lockstep.
//!
//! This crate handles everything about one connection that is not the
//! simulation itself:
//!
//! 1. **State machine** ([`ConnectionState`]): which handshake step a
//!    connection is in and which packet kinds are legal there
//! 2. **Peer connection** ([`PeerConnection`]): frame cursors, command
//!    queue, outbound queue, and the receive pipeline
//! 3. **Authentication** ([`ServerAuthHandshake`], [`ClientAuthHandshake`],
//!    [`PacketCipher`]): X25519 key exchange and per-packet encryption
//! 4. **Registry** ([`ConnectionRegistry`]): owns all connections and
//!    removes closed ones only at a safe point
//!
//! # How it fits in the stack
//!
//! ```text
//! Sync Layer (above)  ← frames and map transfer, driven per connection
//!     ↕
//! Session Layer (this crate)  ← connection state and legality
//!     ↕
//! Protocol Layer (below)  ← packets, kinds, messages
//! ```

mod auth;
mod error;
mod peer;
mod registry;
mod state;

pub use auth::{ClientAuthHandshake, PacketCipher, ServerAuthHandshake, SessionKeys, stream_nonce};
pub use error::SessionError;
pub use peer::{CloseReason, PeerConnection};
pub use registry::{ConnectionRegistry, PeerHandle, PendingDeletion};
pub use state::ConnectionState;
