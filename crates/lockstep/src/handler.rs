//! Server-side packet handlers.
//!
//! By the time a message reaches [`GameServer::dispatch`] the session
//! layer has already decrypted it, checked that a client may send this
//! kind, and that the kind is legal in the connection's current state.
//! What is left is the meaning of each packet:
//!
//!   1. `join` → revision and capacity checks → auth request
//!   2. `auth-response` → verify, ban check → enable encryption
//!   3. `identify` → name checks, client id → content list
//!   4. `content-checked` → welcome + client infos
//!   5. `get-map` → transfer (or a place in line)
//!   6. `map-ok` → synchronized, join notice
//!   7. in game: acks, commands, chat, rcon, moves, renames
//!
//! Every handler returns a `Result`; the caller turns an error into a
//! close with the matching notice.

use std::time::Instant;

use lockstep_protocol::{
    CHALLENGE_LEN, ClientId, CommandPacket, CompanyId, DestType, ErrorCode, MAC_LEN,
    MAX_CLIENT_NAME_LEN, Message, NetworkAction, PUBLIC_KEY_LEN, Role,
};
use lockstep_session::{
    CloseReason, PacketCipher, PeerConnection, PeerHandle, ServerAuthHandshake,
    stream_nonce,
};
use lockstep_sync::{Simulation, SyncError};
use tracing::{debug, info, warn};

use crate::server::{RCON_COLOUR_ERROR, ServerEvent, broadcast, hex, is_joined};
use crate::{GameServer, LockstepError};

impl<S: Simulation> GameServer<S> {
    pub(crate) fn dispatch(
        &mut self,
        handle: PeerHandle,
        msg: Message,
        now: Instant,
    ) -> Result<(), LockstepError> {
        use Message as M;
        match msg {
            M::ClientGameInfo => self.on_game_info(handle, now),
            M::ClientJoin { revision, company } => self.on_join(handle, &revision, company, now),
            M::ClientAuthResponse {
                public_key,
                mac,
                challenge,
            } => self.on_auth_response(handle, &public_key, &mac, &challenge, now),
            M::ClientIdentify { name, company } => self.on_identify(handle, &name, company, now),
            M::ClientContentChecked => self.on_content_checked(handle, now),
            M::ClientGetMap => self.on_get_map(handle, now),
            M::ClientMapOk => self.on_map_ok(handle, now),
            M::ClientAck { frame, token } => {
                let peer = self
                    .peers
                    .get_mut(handle)
                    .ok_or(LockstepError::UnknownPeer(handle))?;
                self.sync.handle_ack(peer, frame, token)?;
                Ok(())
            }
            M::ClientCommand(cmd) => self.on_command(handle, cmd),
            M::ClientChat {
                action,
                dest_type,
                dest,
                message,
                data,
            } => self.on_chat(handle, action, dest_type, dest, message, data),
            M::ClientRcon { password, command } => self.on_rcon(handle, &password, command),
            M::ClientMove { company } => self.on_move(handle, company),
            M::ClientSetName { name } => self.on_set_name(handle, &name),
            M::ClientQuit => {
                if let Some(peer) = self.peers.get_mut(handle) {
                    peer.close(CloseReason::RemoteQuit, None, now);
                }
                Ok(())
            }
            M::ClientError { code } => {
                if let Some(peer) = self.peers.get_mut(handle) {
                    let reason = LockstepError::Remote(code).close_reason();
                    warn!(client_id = %peer.client_id, %code, "client reported an error");
                    peer.close(reason, None, now);
                }
                Ok(())
            }
            other => {
                debug!(%handle, kind = %other.kind(), "server-bound packet with no handler");
                Err(LockstepError::refused(ErrorCode::IllegalPacket))
            }
        }
    }

    fn peer_mut(
        &mut self,
        handle: PeerHandle,
    ) -> Result<&mut PeerConnection, LockstepError> {
        self.peers
            .get_mut(handle)
            .ok_or(LockstepError::UnknownPeer(handle))
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    fn on_game_info(
        &mut self,
        handle: PeerHandle,
        now: Instant,
    ) -> Result<(), LockstepError> {
        let info = self.game_info();
        let peer = self.peer_mut(handle)?;
        peer.send(&Message::ServerGameInfo(info))?;
        peer.close(CloseReason::QueryAnswered, None, now);
        Ok(())
    }

    fn on_join(
        &mut self,
        handle: PeerHandle,
        revision: &str,
        company: CompanyId,
        now: Instant,
    ) -> Result<(), LockstepError> {
        if revision != self.config.revision {
            info!(%handle, revision, expected = %self.config.revision, "wrong revision");
            return Err(LockstepError::refused(ErrorCode::WrongRevision));
        }
        // Several sockets may be accepted before any of them joins.
        if self.admitted_count(Some(handle)) >= usize::from(self.config.max_clients) {
            return Err(LockstepError::full());
        }

        let auth = ServerAuthHandshake::new(self.config.password.as_deref());
        let peer = self.peer_mut(handle)?;
        peer.company = company;
        peer.send(&auth.request())?;
        peer.advance(now)?;
        debug!(%handle, method = ?auth.method(), "join accepted, authenticating");
        if let Some(extras) = self.extras.get_mut(&handle) {
            extras.auth = Some(auth);
        }
        Ok(())
    }

    fn on_auth_response(
        &mut self,
        handle: PeerHandle,
        public_key: &[u8; PUBLIC_KEY_LEN],
        mac: &[u8; MAC_LEN],
        challenge: &[u8; CHALLENGE_LEN],
        now: Instant,
    ) -> Result<(), LockstepError> {
        let auth = self
            .extras
            .get_mut(&handle)
            .and_then(|e| e.auth.take())
            .ok_or(LockstepError::refused(ErrorCode::NotExpected))?;
        let keys = match auth.verify(public_key, mac, challenge) {
            Ok(keys) => keys,
            Err(e) => {
                let code = if self.config.password.is_some() {
                    ErrorCode::WrongPassword
                } else {
                    ErrorCode::NotAuthorized
                };
                info!(%handle, error = %e, "authentication failed");
                return Err(LockstepError::Refused {
                    code,
                    reason: CloseReason::AuthenticationFailed,
                });
            }
        };

        let key_text = hex(public_key);
        if self.config.banned.iter().any(|banned| *banned == key_text) {
            info!(%handle, public_key = %key_text, "banned key refused");
            return Err(LockstepError::Refused {
                code: ErrorCode::NotAuthorized,
                reason: CloseReason::Banned,
            });
        }

        let nonce = stream_nonce();
        let peer = self.peer_mut(handle)?;
        // Enable-encryption itself still goes out in the clear.
        peer.send(&Message::ServerEnableEncryption { nonce })?;
        peer.enable_encryption(PacketCipher::new(&keys, nonce, Role::Server));
        peer.advance(now)?;
        if let Some(extras) = self.extras.get_mut(&handle) {
            extras.public_key = key_text;
        }
        Ok(())
    }

    fn on_identify(
        &mut self,
        handle: PeerHandle,
        name: &str,
        company: CompanyId,
        now: Instant,
    ) -> Result<(), LockstepError> {
        let name = name.trim();
        if !is_valid_name(name) {
            return Err(LockstepError::refused(ErrorCode::InvalidClientName));
        }
        if self.name_in_use(name, handle) {
            return Err(LockstepError::refused(ErrorCode::NameInUse));
        }
        let company = if company.is_spectator()
            || company == CompanyId::NEW_COMPANY
            || company.0 < self.config.max_companies
        {
            company
        } else {
            CompanyId::SPECTATOR
        };

        let client_id = self.allocate_client_id();
        let content = self.sim.required_content();
        let peer = self.peer_mut(handle)?;
        peer.client_id = client_id;
        peer.name = name.to_string();
        peer.company = company;
        peer.send(&Message::ServerCheckContent { content })?;
        peer.advance(now)?;
        info!(%handle, %client_id, name, %company, "client identified");
        Ok(())
    }

    fn on_content_checked(
        &mut self,
        handle: PeerHandle,
        now: Instant,
    ) -> Result<(), LockstepError> {
        let peer = self.peer_mut(handle)?;
        peer.advance(now)?;
        let client_id = peer.client_id;
        peer.send(&Message::ServerWelcome { client_id })?;

        let others: Vec<Message> = self
            .peers
            .iter()
            .filter(|(h, p)| *h != handle && is_joined(p))
            .filter_map(|(h, _)| self.client_info(h))
            .collect();
        let own = self
            .client_info(handle)
            .ok_or(LockstepError::UnknownPeer(handle))?;

        let peer = self.peer_mut(handle)?;
        for info in &others {
            peer.send(info)?;
        }
        broadcast(&mut self.peers, &own, is_joined)?;
        debug!(%client_id, known = others.len(), "client welcomed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Map transfer
    // -----------------------------------------------------------------------

    fn on_get_map(
        &mut self,
        handle: PeerHandle,
        now: Instant,
    ) -> Result<(), LockstepError> {
        self.peer_mut(handle)?.advance(now)?;
        match self.transfers.request(handle, self.sync.frame(), &self.sim) {
            Ok(packets) => self.begin_download(handle, packets, now),
            Err(SyncError::TransferQueueFull { position }) => {
                info!(%handle, position, "map transfer queued");
                let waiting = u8::try_from(position).unwrap_or(u8::MAX);
                self.peer_mut(handle)?
                    .send(&Message::ServerWait { waiting })?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn on_map_ok(
        &mut self,
        handle: PeerHandle,
        now: Instant,
    ) -> Result<(), LockstepError> {
        let complete = self
            .transfers
            .progress(handle)
            .is_some_and(|(sent, total)| sent >= total);
        if !complete || !self.transfers.finish(handle) {
            return Err(SyncError::UnexpectedMapPacket("map-ok before the map was sent").into());
        }

        let peer = self
            .peers
            .get_mut(handle)
            .ok_or(LockstepError::UnknownPeer(handle))?;
        peer.advance(now)?;
        self.sync.admit(peer);
        let client_id = peer.client_id;
        let name = peer.name.clone();
        if let Some(extras) = self.extras.get_mut(&handle) {
            extras.download_started = None;
        }

        broadcast(&mut self.peers, &Message::ServerJoin { client_id }, is_joined)?;
        info!(%client_id, name = %name, frame = self.sync.frame(), "client joined");
        self.events
            .push_back(ServerEvent::ClientJoined { client_id, name });
        self.promote_waiters(now);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // In game
    // -----------------------------------------------------------------------

    fn on_command(
        &mut self,
        handle: PeerHandle,
        cmd: CommandPacket,
    ) -> Result<(), LockstepError> {
        let peer = self
            .peers
            .get_mut(handle)
            .ok_or(LockstepError::UnknownPeer(handle))?;
        if cmd.company != peer.company {
            warn!(
                client_id = %peer.client_id,
                playing_as = %peer.company,
                claimed = %cmd.company,
                "command for another company"
            );
            return Err(LockstepError::refused(ErrorCode::CompanyMismatch));
        }
        self.sync.queue_command(peer, cmd, &self.sim)?;
        Ok(())
    }

    fn on_chat(
        &mut self,
        handle: PeerHandle,
        action: NetworkAction,
        dest_type: DestType,
        dest: u32,
        message: String,
        data: u64,
    ) -> Result<(), LockstepError> {
        if !matches!(
            action,
            NetworkAction::Chat
                | NetworkAction::ChatCompany
                | NetworkAction::ChatClient
                | NetworkAction::GiveMoney
        ) {
            return Err(LockstepError::refused(ErrorCode::NotExpected));
        }
        let from = self.peer_mut(handle)?.client_id;
        self.relay_chat(from, action, dest_type, dest, message, data)
    }

    /// Delivers a chat line to its destination and echoes it to the
    /// sender when the sender is not among the recipients.
    pub(crate) fn relay_chat(
        &mut self,
        from: ClientId,
        action: NetworkAction,
        dest_type: DestType,
        dest: u32,
        message: String,
        data: u64,
    ) -> Result<(), LockstepError> {
        let chat = |client_id: ClientId, self_send: bool| Message::ServerChat {
            action,
            client_id,
            self_send,
            message: message.clone(),
            data,
        };

        let mut echo_to_sender = false;
        match dest_type {
            DestType::Broadcast => {
                broadcast(&mut self.peers, &chat(from, false), is_joined)?;
            }
            DestType::Team => {
                let Ok(team) = u8::try_from(dest).map(CompanyId) else {
                    debug!(%from, dest, "chat to a company that cannot exist");
                    return Ok(());
                };
                let mut sender_in_team = false;
                for (_, peer) in self.peers.iter_mut() {
                    if is_joined(peer) && peer.company == team {
                        sender_in_team |= peer.client_id == from;
                        peer.send(&chat(from, false))?;
                    }
                }
                echo_to_sender = !sender_in_team;
            }
            DestType::Client => {
                let target = ClientId(dest);
                if target != ClientId::SERVER {
                    match self.find_client(target) {
                        Some(h) => {
                            if let Some(peer) = self.peers.get_mut(h).filter(|p| is_joined(p)) {
                                peer.send(&chat(from, false))?;
                            }
                        }
                        None => {
                            debug!(%from, %target, "chat to an unknown client dropped");
                            return Ok(());
                        }
                    }
                }
                echo_to_sender = target != from;
            }
        }

        if echo_to_sender && from != ClientId::SERVER {
            if let Some(h) = self.find_client(from) {
                if let Some(peer) = self.peers.get_mut(h) {
                    peer.send(&chat(ClientId(dest), true))?;
                }
            }
        }

        self.events.push_back(ServerEvent::Chat {
            from,
            action,
            dest_type,
            dest,
            message,
            data,
        });
        Ok(())
    }

    fn on_rcon(
        &mut self,
        handle: PeerHandle,
        password: &str,
        command: String,
    ) -> Result<(), LockstepError> {
        let authorized = self
            .config
            .rcon_password
            .as_deref()
            .is_some_and(|expected| expected == password);
        let peer = self.peer_mut(handle)?;
        let client_id = peer.client_id;
        if !authorized {
            warn!(%client_id, "rcon with a wrong password");
            peer.send(&Message::ServerRcon {
                colour: RCON_COLOUR_ERROR,
                output: "Access Denied".to_string(),
            })?;
            return Ok(());
        }
        info!(%client_id, command = %command, "rcon command");
        self.events.push_back(ServerEvent::Rcon { client_id, command });
        Ok(())
    }

    fn on_move(
        &mut self,
        handle: PeerHandle,
        company: CompanyId,
    ) -> Result<(), LockstepError> {
        if !company.is_spectator() && company.0 >= self.config.max_companies {
            debug!(%handle, %company, "move to a company that does not exist ignored");
            return Ok(());
        }
        let peer = self.peer_mut(handle)?;
        if peer.company == company {
            return Ok(());
        }
        peer.company = company;
        let client_id = peer.client_id;
        broadcast(&mut self.peers, &Message::ServerMove { client_id, company }, is_joined)?;
        info!(%client_id, %company, "client moved");
        self.events
            .push_back(ServerEvent::ClientMoved { client_id, company });
        Ok(())
    }

    fn on_set_name(
        &mut self,
        handle: PeerHandle,
        name: &str,
    ) -> Result<(), LockstepError> {
        let name = name.trim();
        if !is_valid_name(name) {
            return Err(LockstepError::refused(ErrorCode::InvalidClientName));
        }
        let name = self.unique_name(name, handle);
        let peer = self.peer_mut(handle)?;
        if peer.name == name {
            return Ok(());
        }
        let old = std::mem::replace(&mut peer.name, name.clone());
        let client_id = peer.client_id;
        let info = self
            .client_info(handle)
            .ok_or(LockstepError::UnknownPeer(handle))?;
        broadcast(&mut self.peers, &info, is_joined)?;
        info!(%client_id, old = %old, new = %name, "client renamed");
        self.events.push_back(ServerEvent::NameChanged {
            client_id,
            old,
            new: name,
        });
        Ok(())
    }
}

/// Non-empty, fits the wire limit, and no control characters.
pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_CLIENT_NAME_LEN && !name.chars().any(char::is_control)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_name_rejects_empty_and_control_characters() {
        assert!(is_valid_name("alice"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("bad\u{7}bell"));
        assert!(!is_valid_name(&"x".repeat(MAX_CLIENT_NAME_LEN + 1)));
    }
}
