//! Key-exchange authentication and packet encryption.
//!
//! The handshake is a single challenge/response round on top of X25519:
//!
//! ```text
//! server                                   client
//!   │ auth-request(method, server_pk, nonce) │
//!   │ ──────────────────────────────────────▶│  derive keys
//!   │                                        │  seal 8 random bytes
//!   │ auth-response(client_pk, mac, message) │
//!   │◀────────────────────────────────────── │
//!   │ derive keys, open message              │
//!   │ enable-encryption(stream_nonce)        │
//!   │ ──────────────────────────────────────▶│
//!   │        everything after this is sealed │
//! ```
//!
//! Both sides hash the shared secret, both public keys, and (for
//! [`AuthMethod::Password`]) the server password into two directional
//! keys. A client that knows the wrong password derives different keys,
//! so the server cannot open its message and the MAC check fails.

use bytes::Bytes;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, Tag, XChaCha20Poly1305, XNonce};
use lockstep_protocol::{
    AuthMethod, CHALLENGE_LEN, ENCRYPTION_OVERHEAD, MAC_LEN, Message, NONCE_LEN,
    PUBLIC_KEY_LEN, RawPacket, Role,
};
use rand::Rng;
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::SessionError;

/// The two directional keys derived from one key exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    client_to_server: [u8; 32],
    server_to_client: [u8; 32],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys { .. }")
    }
}

impl SessionKeys {
    fn derive(
        shared: &[u8; 32],
        client_public: &[u8; PUBLIC_KEY_LEN],
        server_public: &[u8; PUBLIC_KEY_LEN],
        password: &str,
    ) -> Self {
        let mut hasher = Sha512::new();
        hasher.update(shared);
        hasher.update(client_public);
        hasher.update(server_public);
        hasher.update(password.as_bytes());
        let digest = hasher.finalize();

        let mut client_to_server = [0u8; 32];
        let mut server_to_client = [0u8; 32];
        client_to_server.copy_from_slice(&digest[..32]);
        server_to_client.copy_from_slice(&digest[32..64]);
        Self {
            client_to_server,
            server_to_client,
        }
    }
}

fn random_secret() -> StaticSecret {
    let bytes: [u8; 32] = rand::rng().random();
    StaticSecret::from(bytes)
}

fn aead(key: &[u8; 32]) -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new(Key::from_slice(key))
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// The server's half of one authentication round.
///
/// Created when a client's join is accepted, consumed by
/// [`verify`](Self::verify) when the response arrives.
pub struct ServerAuthHandshake {
    method: AuthMethod,
    password: String,
    secret: StaticSecret,
    public: PublicKey,
    nonce: [u8; NONCE_LEN],
}

impl std::fmt::Debug for ServerAuthHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerAuthHandshake")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

impl ServerAuthHandshake {
    /// Starts a handshake. A password selects [`AuthMethod::Password`].
    pub fn new(password: Option<&str>) -> Self {
        let secret = random_secret();
        let public = PublicKey::from(&secret);
        let method = match password {
            Some(_) => AuthMethod::Password,
            None => AuthMethod::KeyExchangeOnly,
        };
        Self {
            method,
            password: password.unwrap_or_default().to_owned(),
            secret,
            public,
            nonce: rand::rng().random(),
        }
    }

    pub fn method(&self) -> AuthMethod {
        self.method
    }

    /// The auth-request packet to send to the client.
    pub fn request(&self) -> Message {
        Message::ServerAuthRequest {
            method: self.method,
            public_key: *self.public.as_bytes(),
            nonce: self.nonce,
        }
    }

    /// Checks the client's response and derives the session keys.
    ///
    /// # Errors
    /// [`SessionError::AuthenticationFailed`] if the MAC does not verify.
    pub fn verify(
        self,
        client_public: &[u8; PUBLIC_KEY_LEN],
        mac: &[u8; MAC_LEN],
        challenge: &[u8; CHALLENGE_LEN],
    ) -> Result<SessionKeys, SessionError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*client_public));
        let keys = SessionKeys::derive(
            shared.as_bytes(),
            client_public,
            self.public.as_bytes(),
            &self.password,
        );

        let mut message = *challenge;
        aead(&keys.client_to_server)
            .decrypt_in_place_detached(
                XNonce::from_slice(&self.nonce),
                client_public,
                &mut message,
                Tag::from_slice(mac),
            )
            .map_err(|_| SessionError::AuthenticationFailed("MAC did not verify"))?;
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// The client's half: answers an auth request.
#[derive(Debug, Clone, Default)]
pub struct ClientAuthHandshake {
    password: String,
}

impl ClientAuthHandshake {
    pub fn new(password: Option<&str>) -> Self {
        Self {
            password: password.unwrap_or_default().to_owned(),
        }
    }

    /// Derives keys from the server's request and builds the response.
    ///
    /// The password is only mixed in when the server asked for
    /// [`AuthMethod::Password`].
    pub fn respond(
        &self,
        method: AuthMethod,
        server_public: &[u8; PUBLIC_KEY_LEN],
        nonce: &[u8; NONCE_LEN],
    ) -> Result<(Message, SessionKeys), SessionError> {
        let secret = random_secret();
        let public = PublicKey::from(&secret);
        let shared = secret.diffie_hellman(&PublicKey::from(*server_public));
        let password = match method {
            AuthMethod::Password => self.password.as_str(),
            AuthMethod::KeyExchangeOnly => "",
        };
        let keys = SessionKeys::derive(shared.as_bytes(), public.as_bytes(), server_public, password);

        let mut message: [u8; CHALLENGE_LEN] = rand::rng().random();
        let tag = aead(&keys.client_to_server)
            .encrypt_in_place_detached(XNonce::from_slice(nonce), public.as_bytes(), &mut message)
            .map_err(|_| SessionError::AuthenticationFailed("could not seal challenge"))?;
        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(&tag);

        let response = Message::ClientAuthResponse {
            public_key: *public.as_bytes(),
            mac,
            challenge: message,
        };
        Ok((response, keys))
    }
}

// ---------------------------------------------------------------------------
// PacketCipher
// ---------------------------------------------------------------------------

/// Seals outgoing and opens incoming packets once encryption is enabled.
///
/// The packet header stays in the clear; the payload is encrypted and a
/// 16-byte tag is appended. The kind byte is bound as associated data, so
/// a peer that rewrites it is caught. Every packet uses a fresh nonce:
/// the stream nonce with a per-direction packet counter folded in.
pub struct PacketCipher {
    send: XChaCha20Poly1305,
    recv: XChaCha20Poly1305,
    nonce: [u8; NONCE_LEN],
    sent: u64,
    received: u64,
}

impl std::fmt::Debug for PacketCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCipher")
            .field("sent", &self.sent)
            .field("received", &self.received)
            .finish_non_exhaustive()
    }
}

impl PacketCipher {
    /// Builds the cipher for the `role` end of the connection.
    pub fn new(keys: &SessionKeys, nonce: [u8; NONCE_LEN], role: Role) -> Self {
        let (send, recv) = match role {
            Role::Client => (&keys.client_to_server, &keys.server_to_client),
            Role::Server => (&keys.server_to_client, &keys.client_to_server),
        };
        Self {
            send: aead(send),
            recv: aead(recv),
            nonce,
            sent: 0,
            received: 0,
        }
    }

    fn packet_nonce(&self, counter: u64) -> XNonce {
        let mut nonce = self.nonce;
        for (b, c) in nonce.iter_mut().zip(counter.to_le_bytes()) {
            *b ^= c;
        }
        XNonce::clone_from_slice(&nonce)
    }

    /// Encrypts a complete packet, returning the sealed packet.
    pub fn seal(&mut self, packet: &[u8]) -> Result<Bytes, SessionError> {
        let raw = RawPacket::parse(packet)?;
        let nonce = self.packet_nonce(self.sent);
        let mut payload = raw.payload.to_vec();
        let tag = self
            .send
            .encrypt_in_place_detached(&nonce, &[raw.kind], &mut payload)
            .map_err(|_| SessionError::DecryptionFailed)?;
        payload.extend_from_slice(&tag);
        self.sent += 1;
        let sealed = RawPacket {
            kind: raw.kind,
            payload: payload.into(),
        };
        Ok(sealed.encode()?)
    }

    /// Verifies and decrypts a sealed packet.
    ///
    /// # Errors
    /// [`SessionError::DecryptionFailed`] if the tag is missing or wrong.
    pub fn open(&mut self, packet: &[u8]) -> Result<RawPacket, SessionError> {
        let raw = RawPacket::parse(packet)?;
        if raw.payload.len() < ENCRYPTION_OVERHEAD {
            return Err(SessionError::DecryptionFailed);
        }
        let split = raw.payload.len() - ENCRYPTION_OVERHEAD;
        let mut payload = raw.payload[..split].to_vec();
        let tag = Tag::from_slice(&raw.payload[split..]);
        let nonce = self.packet_nonce(self.received);
        self.recv
            .decrypt_in_place_detached(&nonce, &[raw.kind], &mut payload, tag)
            .map_err(|_| SessionError::DecryptionFailed)?;
        self.received += 1;
        Ok(RawPacket {
            kind: raw.kind,
            payload: payload.into(),
        })
    }
}

/// Fresh random nonce for the encrypted stream (sent in enable-encryption).
pub fn stream_nonce() -> [u8; NONCE_LEN] {
    rand::rng().random()
}
