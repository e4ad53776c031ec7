//! RSA key material and textbook signatures.
//!
//! The chat server verifies `signature^e mod n == challenge` directly, without
//! padding, so signing here is a plain modular exponentiation over big
//! integers. Key generation is delegated to the `rsa` crate.

use std::fmt;

use rsa::rand_core::OsRng;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

/// Smallest modulus size accepted for generated keys.
pub const MIN_KEY_BITS: usize = 512;
/// Modulus size used when nothing else is configured.
pub const DEFAULT_KEY_BITS: usize = 2048;
/// Public exponent used for generated keys.
pub const DEFAULT_PUBLIC_EXPONENT: u32 = 65537;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key size {0} is below the minimum of 512 bits")]
    KeyTooSmall(usize),

    #[error("key generation failed: {0}")]
    KeyGeneration(#[from] rsa::Error),

    #[error("invalid hex value {0:?}")]
    InvalidHex(String),

    #[error("key component {0} must be non-zero")]
    ZeroComponent(&'static str),

    #[error("message is not smaller than the modulus")]
    MessageTooLarge,
}

/// Parses a big-endian hexadecimal integer, as rendered by `to_str_radix(16)`.
pub fn parse_hex_biguint(value: &str) -> Result<BigUint, CryptoError> {
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CryptoError::InvalidHex(value.to_string()));
    }
    BigUint::parse_bytes(value.as_bytes(), 16)
        .ok_or_else(|| CryptoError::InvalidHex(value.to_string()))
}

/// Renders a big integer as lowercase hex without leading zeros.
pub fn to_hex(value: &BigUint) -> String {
    value.to_str_radix(16)
}

/// Public half of a key pair: modulus `n` and exponent `e`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    n: BigUint,
    e: BigUint,
}

impl PublicKey {
    pub fn new(n: BigUint, e: BigUint) -> Self {
        Self { n, e }
    }

    pub fn from_hex(n: &str, e: &str) -> Result<Self, CryptoError> {
        Ok(Self::new(parse_hex_biguint(n)?, parse_hex_biguint(e)?))
    }

    pub fn n(&self) -> &BigUint {
        &self.n
    }

    pub fn e(&self) -> &BigUint {
        &self.e
    }

    pub fn n_hex(&self) -> String {
        to_hex(&self.n)
    }

    pub fn e_hex(&self) -> String {
        to_hex(&self.e)
    }

    /// Checks `signature^e mod n == message`.
    pub fn verify(&self, message: &BigUint, signature: &BigUint) -> bool {
        if self.n.bits() == 0 || message >= &self.n || signature >= &self.n {
            return false;
        }
        &signature.modpow(&self.e, &self.n) == message
    }
}

/// Full key pair used to sign server challenges.
///
/// The private exponent is kept as secret hex and only turned into a number
/// while signing.
pub struct RsaKey {
    public: PublicKey,
    d: SecretString,
}

impl RsaKey {
    /// Generates a fresh key pair with a `bits`-sized modulus.
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        if bits < MIN_KEY_BITS {
            return Err(CryptoError::KeyTooSmall(bits));
        }
        let private = RsaPrivateKey::new(&mut OsRng, bits)?;
        Ok(Self {
            public: PublicKey::new(private.n().clone(), private.e().clone()),
            d: SecretString::new(to_hex(private.d())),
        })
    }

    pub fn from_parts(n: BigUint, e: BigUint, d: BigUint) -> Result<Self, CryptoError> {
        for (name, value) in [("n", &n), ("e", &e), ("d", &d)] {
            if value.bits() == 0 {
                return Err(CryptoError::ZeroComponent(name));
            }
        }
        Ok(Self {
            public: PublicKey::new(n, e),
            d: SecretString::new(to_hex(&d)),
        })
    }

    pub fn from_hex_parts(n: &str, e: &str, d: &str) -> Result<Self, CryptoError> {
        Self::from_parts(
            parse_hex_biguint(n)?,
            parse_hex_biguint(e)?,
            parse_hex_biguint(d)?,
        )
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn n(&self) -> &BigUint {
        self.public.n()
    }

    pub fn e(&self) -> &BigUint {
        self.public.e()
    }

    /// Private exponent as lowercase hex.
    pub(crate) fn private_exponent(&self) -> &SecretString {
        &self.d
    }

    /// Computes `message^d mod n`.
    pub fn sign(&self, message: &BigUint) -> Result<BigUint, CryptoError> {
        if message >= self.n() {
            return Err(CryptoError::MessageTooLarge);
        }
        let d = parse_hex_biguint(self.d.expose_secret())?;
        Ok(message.modpow(&d, self.n()))
    }

    pub fn verify(&self, message: &BigUint, signature: &BigUint) -> bool {
        self.public.verify(message, signature)
    }
}

impl Clone for RsaKey {
    fn clone(&self) -> Self {
        Self {
            public: self.public.clone(),
            d: SecretString::new(self.d.expose_secret().clone()),
        }
    }
}

impl PartialEq for RsaKey {
    fn eq(&self, other: &Self) -> bool {
        self.public == other.public && self.d.expose_secret() == other.d.expose_secret()
    }
}

impl Eq for RsaKey {}

impl fmt::Debug for RsaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaKey")
            .field("n", &self.public.n_hex())
            .field("e", &self.public.e_hex())
            .field("d", &"<redacted>")
            .finish()
    }
}
