//! Forward protocol authentication.
//!
//! With a shared key or username configured, the server opens with
//! `["HELO", {nonce, auth, keepalive}]`. The client answers with a `PING`
//! carrying salted SHA-512 digests and the server proves knowledge of the
//! shared key in its `PONG`. Connections stay open regardless of
//! `keepalive`.

use rmpv::Value;
use sha2::{Digest, Sha512};

use crate::{codec::map_get, error::SenderError};

/// Secrets and identity presented during the handshake.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub hostname: String,
    pub shared_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    /// Whether the server is expected to start with `HELO`.
    pub fn requires_handshake(&self) -> bool {
        self.shared_key.is_some() || self.username.is_some()
    }
}

/// Where a connection is in the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingHelo,
    AwaitingPong,
    Ready,
}

/// A message read from the collector.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    /// Keepalive byte.
    Heartbeat,
    Helo(Value),
    Pong(Value),
    /// Acknowledgement for a chunk id.
    Ack(String),
}

impl ServerMessage {
    /// Classify a decoded value.
    pub fn from_value(value: Value) -> Result<Self, SenderError> {
        if value.as_u64() == Some(0) {
            return Ok(ServerMessage::Heartbeat);
        }
        if value.is_map() {
            return map_get(&value, "ack")
                .and_then(bytes_of)
                .and_then(|chunk| String::from_utf8(chunk.to_vec()).ok())
                .filter(|chunk| !chunk.is_empty())
                .map(ServerMessage::Ack)
                .ok_or_else(|| protocol(format!("response without ack {value}")));
        }
        let kind = value
            .as_array()
            .and_then(|items| items.first())
            .and_then(Value::as_str)
            .map(str::to_owned);
        match kind.as_deref() {
            Some("HELO") => Ok(ServerMessage::Helo(value)),
            Some("PONG") => Ok(ServerMessage::Pong(value)),
            _ => Err(protocol(format!("unexpected message {value}"))),
        }
    }
}

/// Handshake state machine for one connection.
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    salt: Option<[u8; 16]>,
    nonce: Vec<u8>,
}

impl Handshake {
    pub fn new(credentials: &Credentials) -> Self {
        let state = if credentials.requires_handshake() {
            HandshakeState::AwaitingHelo
        } else {
            HandshakeState::Ready
        };
        Self {
            state,
            salt: None,
            nonce: Vec::new(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == HandshakeState::Ready
    }

    /// Answer a `HELO` with a freshly salted `PING`.
    pub fn on_helo(&mut self, helo: &Value, credentials: &Credentials) -> Result<Vec<u8>, SenderError> {
        self.on_helo_with_salt(helo, credentials, rand::random())
    }

    /// Answer a `HELO` using `salt`.
    pub fn on_helo_with_salt(
        &mut self,
        helo: &Value,
        credentials: &Credentials,
        salt: [u8; 16],
    ) -> Result<Vec<u8>, SenderError> {
        if self.state != HandshakeState::AwaitingHelo {
            return Err(protocol(format!("unexpected HELO in state {:?}", self.state)));
        }
        let options = helo
            .as_array()
            .and_then(|items| items.get(1))
            .filter(|options| options.is_map())
            .ok_or_else(|| protocol("HELO without options map".into()))?;
        let mut shared_key_salt = Value::Nil;
        let mut shared_key_digest = Value::Nil;
        if let Some(key) = &credentials.shared_key {
            let nonce = map_get(options, "nonce")
                .and_then(bytes_of)
                .ok_or_else(|| protocol("HELO without nonce".into()))?;
            self.nonce = nonce.to_vec();
            self.salt = Some(salt);
            shared_key_salt = Value::Binary(salt.to_vec());
            shared_key_digest = Value::from(hex_sha512(&[
                salt.as_slice(),
                credentials.hostname.as_bytes(),
                nonce,
                key.as_bytes(),
            ]));
        }

        let mut password_digest = String::new();
        if let Some(username) = &credentials.username {
            let auth = map_get(options, "auth").and_then(bytes_of).unwrap_or_default();
            let password = credentials.password.as_deref().unwrap_or_default();
            password_digest = hex_sha512(&[auth, username.as_bytes(), password.as_bytes()]);
        }

        let ping = Value::Array(vec![
            Value::from("PING"),
            Value::from(credentials.hostname.as_str()),
            shared_key_salt,
            shared_key_digest,
            Value::from(credentials.username.as_deref().unwrap_or_default()),
            Value::from(password_digest),
        ]);
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &ping)
            .map_err(|err| protocol(format!("failed to encode PING: {err}")))?;
        self.state = HandshakeState::AwaitingPong;
        Ok(bytes)
    }

    /// Check a `PONG`; on success the connection becomes ready.
    pub fn on_pong(&mut self, pong: &Value, credentials: &Credentials) -> Result<(), SenderError> {
        if self.state != HandshakeState::AwaitingPong {
            return Err(protocol(format!("unexpected PONG in state {:?}", self.state)));
        }
        let items = pong
            .as_array()
            .ok_or_else(|| protocol("PONG is not an array".into()))?;
        if items.get(1).and_then(Value::as_bool) != Some(true) {
            let reason = items.get(2).and_then(Value::as_str).unwrap_or("no reason given");
            return Err(protocol(format!("authentication failed: {reason}")));
        }
        if let (Some(key), Some(salt)) = (&credentials.shared_key, &self.salt) {
            let server_hostname = items
                .get(3)
                .and_then(bytes_of)
                .ok_or_else(|| protocol("PONG without server hostname".into()))?;
            let expected = hex_sha512(&[
                salt.as_slice(),
                server_hostname,
                self.nonce.as_slice(),
                key.as_bytes(),
            ]);
            let received = items.get(4).and_then(Value::as_str);
            if received != Some(expected.as_str()) {
                return Err(protocol("server digest mismatch".into()));
            }
        }
        self.state = HandshakeState::Ready;
        Ok(())
    }
}

/// Lowercase hex SHA-512 of the concatenated `parts`.
pub fn hex_sha512(parts: &[&[u8]]) -> String {
    let mut digest = Sha512::new();
    for part in parts {
        digest.update(part);
    }
    hex::encode(digest.finalize())
}

fn bytes_of(value: &Value) -> Option<&[u8]> {
    match value {
        Value::Binary(bytes) => Some(bytes),
        Value::String(s) => Some(s.as_bytes()),
        _ => None,
    }
}

fn protocol(message: String) -> SenderError {
    SenderError::Protocol(message)
}
