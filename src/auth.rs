//! Client side of the challenge/response login.
//!
//! The server sends a random hex challenge. The client proves it owns the
//! registered key by hashing the challenge bytes with SHA-256, signing the
//! digest, and answering with `auth-response:<signature>:<username>`.

use rsa::BigUint;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::chat::proto::ControlMessage;
use crate::crypto::{parse_hex_biguint, to_hex, CryptoError, PublicKey, RsaKey};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no challenge set")]
    NoChallenge,

    #[error("challenge is not valid hex: {0}")]
    InvalidChallenge(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Local user: a username bound to a key pair.
#[derive(Clone, Debug)]
pub struct Identity {
    pub username: String,
    pub key: RsaKey,
}

impl Identity {
    pub fn new(username: impl Into<String>, key: RsaKey) -> Self {
        Self {
            username: username.into(),
            key,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        self.key.public_key()
    }
}

/// Holds the current server challenge and signs it for an [`Identity`].
#[derive(Clone, Debug)]
pub struct Authenticator {
    identity: Identity,
    current_challenge: Option<String>,
}

impl Authenticator {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            current_challenge: None,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn set_challenge(&mut self, challenge: impl Into<String>) {
        self.current_challenge = Some(challenge.into());
    }

    pub fn current_challenge(&self) -> Option<&str> {
        self.current_challenge.as_deref()
    }

    /// Signs the current challenge read directly as a big integer.
    pub fn sign_challenge(&self) -> Result<BigUint, AuthError> {
        let challenge = self.current_challenge.as_deref().ok_or(AuthError::NoChallenge)?;
        let value = parse_hex_biguint(challenge)
            .map_err(|_| AuthError::InvalidChallenge(challenge.to_string()))?;
        Ok(self.identity.key.sign(&value)?)
    }

    /// Hashes the challenge bytes with SHA-256 and signs the digest.
    ///
    /// Returns the signature as lowercase hex.
    pub fn handle_challenge(&self, challenge: &str) -> Result<String, AuthError> {
        let digest = challenge_digest(challenge)?;
        debug!(
            event = "auth_challenge_hashed",
            challenge_len = challenge.len(),
            digest = %to_hex(&digest)
        );
        let signature = self.identity.key.sign(&digest)?;
        Ok(to_hex(&signature))
    }

    /// Builds the `auth-response:<signature>:<username>` reply for the
    /// current challenge.
    pub fn build_auth_response(&self) -> Result<String, AuthError> {
        let challenge = self.current_challenge.as_deref().ok_or(AuthError::NoChallenge)?;
        let signature_hex = self.handle_challenge(challenge)?;
        Ok(ControlMessage::AuthResponse {
            signature_hex,
            username: self.identity.username.clone(),
        }
        .to_content())
    }

    /// Verifies a signature produced by [`Authenticator::sign_challenge`].
    pub fn verify(&self, challenge: &str, signature: &BigUint) -> bool {
        parse_hex_biguint(challenge)
            .map(|value| self.identity.key.verify(&value, signature))
            .unwrap_or(false)
    }

    /// Verifies a signature produced by [`Authenticator::handle_challenge`].
    pub fn verify_response(&self, challenge: &str, signature: &BigUint) -> bool {
        verify_hashed(self.identity.public_key(), challenge, signature)
    }
}

/// Verifies a hashed challenge signature against any public key.
pub fn verify_hashed(key: &PublicKey, challenge: &str, signature: &BigUint) -> bool {
    challenge_digest(challenge)
        .map(|digest| key.verify(&digest, signature))
        .unwrap_or(false)
}

fn challenge_digest(challenge: &str) -> Result<BigUint, AuthError> {
    let bytes =
        hex::decode(challenge).map_err(|_| AuthError::InvalidChallenge(challenge.to_string()))?;
    let digest = Sha256::digest(&bytes);
    Ok(BigUint::from_bytes_be(&digest))
}
