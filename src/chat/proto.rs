use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{parse_hex_biguint, PublicKey};

const GET_PUBLIC_KEY: &str = "get-public-key:";
const PUBLIC_KEY: &str = "public-key:";
const PUBLIC_KEY_NOT_FOUND: &str = "public-key-not-found:";
const AUTH_CHALLENGE: &str = "auth-challenge:";
const AUTH_RESPONSE: &str = "auth-response:";

const CHECK_USERNAME: &str = "check-username:";
const REGISTER: &str = "register:";
const USERNAME_EXISTS: &str = "username-exists";
const REGISTER_SUCCESS: &str = "register-success";
const ERROR_PREFIX: &str = "error:";

/// Chat message exchanged with the server as a JSON text frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChatMessage {
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// Milliseconds since the Unix epoch, `0` when the sender did not stamp it.
    #[serde(default)]
    pub timestamp: u64,
}

impl ChatMessage {
    pub fn new(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            content: content.into(),
            recipient: None,
            timestamp: 0,
        }
    }

    pub fn with_timestamp(
        sender: impl Into<String>,
        content: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            timestamp,
            ..Self::new(sender, content)
        }
    }

    /// Message addressed to a single user, stamped with the current time.
    pub fn direct(
        sender: impl Into<String>,
        content: impl Into<String>,
        recipient: impl Into<String>,
    ) -> Self {
        Self {
            recipient: Some(recipient.into()),
            timestamp: now_ms(),
            ..Self::new(sender, content)
        }
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses the content as a control command, if it is one.
    pub fn control(&self) -> Option<Result<ControlMessage, ProtoError>> {
        ControlMessage::parse(&self.content)
    }
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message{{sender='{}', content='{}', timestamp={}",
            self.sender, self.content, self.timestamp
        )?;
        if let Some(recipient) = &self.recipient {
            write!(f, ", recipient='{recipient}'")?;
        }
        f.write_str("}")
    }
}

/// Errors produced while parsing control commands and registration frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("malformed {kind} command: {detail}")]
    Malformed { kind: &'static str, detail: String },

    #[error("invalid hex in {field}: {value:?}")]
    InvalidHex { field: &'static str, value: String },
}

/// Colon-delimited command carried in a chat message's `content`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    GetPublicKey { username: String },
    PublicKey { username: String, key: PublicKey },
    PublicKeyNotFound { username: String },
    AuthChallenge { challenge: String },
    AuthResponse { signature_hex: String, username: String },
}

impl ControlMessage {
    /// Returns `None` for plain chat text.
    pub fn parse(content: &str) -> Option<Result<Self, ProtoError>> {
        // `public-key-not-found:` must be checked before `public-key:`.
        if let Some(username) = content.strip_prefix(PUBLIC_KEY_NOT_FOUND) {
            return Some(Ok(Self::PublicKeyNotFound {
                username: username.to_string(),
            }));
        }
        if content.starts_with(PUBLIC_KEY) {
            return Some(parse_public_key(content));
        }
        if let Some(username) = content.strip_prefix(GET_PUBLIC_KEY) {
            return Some(Ok(Self::GetPublicKey {
                username: username.to_string(),
            }));
        }
        if let Some(challenge) = content.strip_prefix(AUTH_CHALLENGE) {
            return Some(parse_challenge(challenge));
        }
        if let Some(rest) = content.strip_prefix(AUTH_RESPONSE) {
            return Some(parse_auth_response(rest));
        }
        None
    }

    pub fn to_content(&self) -> String {
        match self {
            Self::GetPublicKey { username } => format!("{GET_PUBLIC_KEY}{username}"),
            Self::PublicKey { username, key } => {
                format!("{PUBLIC_KEY}{username}:{}:{}", key.n_hex(), key.e_hex())
            }
            Self::PublicKeyNotFound { username } => format!("{PUBLIC_KEY_NOT_FOUND}{username}"),
            Self::AuthChallenge { challenge } => format!("{AUTH_CHALLENGE}{challenge}"),
            Self::AuthResponse {
                signature_hex,
                username,
            } => format!("{AUTH_RESPONSE}{signature_hex}:{username}"),
        }
    }
}

fn parse_public_key(content: &str) -> Result<ControlMessage, ProtoError> {
    let parts: Vec<&str> = content.split(':').collect();
    let [_, username, n, e] = parts.as_slice() else {
        return Err(ProtoError::Malformed {
            kind: "public-key",
            detail: format!("expected 4 parts, got {}", parts.len()),
        });
    };
    if username.is_empty() {
        return Err(ProtoError::Malformed {
            kind: "public-key",
            detail: "empty username".to_string(),
        });
    }
    let n = parse_hex_biguint(n).map_err(|_| ProtoError::InvalidHex {
        field: "n",
        value: n.to_string(),
    })?;
    let e = parse_hex_biguint(e).map_err(|_| ProtoError::InvalidHex {
        field: "e",
        value: e.to_string(),
    })?;
    Ok(ControlMessage::PublicKey {
        username: username.to_string(),
        key: PublicKey::new(n, e),
    })
}

fn parse_challenge(challenge: &str) -> Result<ControlMessage, ProtoError> {
    if challenge.is_empty() || !challenge.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ProtoError::InvalidHex {
            field: "challenge",
            value: challenge.to_string(),
        });
    }
    Ok(ControlMessage::AuthChallenge {
        challenge: challenge.to_string(),
    })
}

fn parse_auth_response(rest: &str) -> Result<ControlMessage, ProtoError> {
    let Some((signature_hex, username)) = rest.split_once(':') else {
        return Err(ProtoError::Malformed {
            kind: "auth-response",
            detail: "missing username".to_string(),
        });
    };
    Ok(ControlMessage::AuthResponse {
        signature_hex: signature_hex.to_string(),
        username: username.to_string(),
    })
}

/// Plain-text request sent on the registration socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationRequest {
    CheckUsername { username: String },
    Register { username: String, key: PublicKey },
}

impl RegistrationRequest {
    pub fn to_text(&self) -> String {
        match self {
            Self::CheckUsername { username } => format!("{CHECK_USERNAME}{username}"),
            Self::Register { username, key } => {
                format!("{REGISTER}{username}:{}:{}", key.n_hex(), key.e_hex())
            }
        }
    }

    pub fn from_text(text: &str) -> Result<Self, ProtoError> {
        if let Some(username) = text.strip_prefix(CHECK_USERNAME) {
            return Ok(Self::CheckUsername {
                username: username.to_string(),
            });
        }
        let Some(rest) = text.strip_prefix(REGISTER) else {
            return Err(ProtoError::Malformed {
                kind: "registration",
                detail: format!("unknown request {text:?}"),
            });
        };
        let parts: Vec<&str> = rest.split(':').collect();
        let [username, n, e] = parts.as_slice() else {
            return Err(ProtoError::Malformed {
                kind: "register",
                detail: format!("expected 3 fields, got {}", parts.len()),
            });
        };
        let n = parse_hex_biguint(n).map_err(|_| ProtoError::InvalidHex {
            field: "n",
            value: n.to_string(),
        })?;
        let e = parse_hex_biguint(e).map_err(|_| ProtoError::InvalidHex {
            field: "e",
            value: e.to_string(),
        })?;
        Ok(Self::Register {
            username: username.to_string(),
            key: PublicKey::new(n, e),
        })
    }
}

/// Server reply on the registration socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationReply {
    UsernameExists,
    RegisterSuccess,
    Error(String),
    Other(String),
}

impl RegistrationReply {
    pub fn parse(text: &str) -> Self {
        match text {
            USERNAME_EXISTS => Self::UsernameExists,
            REGISTER_SUCCESS => Self::RegisterSuccess,
            _ => match text.strip_prefix(ERROR_PREFIX) {
                Some(detail) => Self::Error(detail.to_string()),
                None => Self::Other(text.to_string()),
            },
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            Self::UsernameExists => USERNAME_EXISTS.to_string(),
            Self::RegisterSuccess => REGISTER_SUCCESS.to_string(),
            Self::Error(detail) => format!("{ERROR_PREFIX}{detail}"),
            Self::Other(text) => text.clone(),
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
