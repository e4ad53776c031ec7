//! On-disk storage of the local user's key pair.
//!
//! Credentials live in `<dir>/credentials.toml`. The private exponent is
//! only readable by the owner on Unix.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::auth::Identity;
use crate::chat::proto::now_ms;
use crate::crypto::{CryptoError, RsaKey};

pub const DEFAULT_CREDENTIALS_DIR: &str = "UserData";
pub const CREDENTIALS_FILE_NAME: &str = "credentials.toml";

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("credentials io error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode credentials: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to parse credentials: {0}")]
    Deserialize(#[from] toml::de::Error),

    #[error("invalid key in credentials: {0}")]
    Crypto(#[from] CryptoError),

    #[error("invalid credentials: {0}")]
    Invalid(String),
}

/// Username and key pair of the local user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub key: RsaKey,
    /// When the key pair was created, in milliseconds since the Unix epoch.
    pub generated_at_ms: u64,
}

impl Credentials {
    /// Wraps a freshly generated key, stamped with the current time.
    pub fn new(username: impl Into<String>, key: RsaKey) -> Self {
        Self {
            username: username.into(),
            key,
            generated_at_ms: now_ms(),
        }
    }

    pub fn into_identity(self) -> Identity {
        Identity::new(self.username, self.key)
    }
}

impl From<Credentials> for Identity {
    fn from(credentials: Credentials) -> Self {
        credentials.into_identity()
    }
}

#[derive(Serialize)]
struct CredentialsFile<'a> {
    username: &'a str,
    generated_at_ms: u64,
    public: PublicSection,
    private: PrivateSection<'a>,
}

#[derive(Serialize)]
struct PrivateSection<'a> {
    d: &'a str,
}

#[derive(Deserialize)]
struct StoredCredentials {
    username: String,
    #[serde(default)]
    generated_at_ms: u64,
    public: PublicSection,
    private: StoredPrivateSection,
}

#[derive(Serialize, Deserialize)]
struct PublicSection {
    n: String,
    e: String,
}

#[derive(Deserialize)]
struct StoredPrivateSection {
    d: SecretString,
}

#[derive(Clone, Debug)]
pub struct CredentialsStore {
    dir: PathBuf,
}

impl CredentialsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE_NAME)
    }

    pub fn exists(&self) -> bool {
        self.path().is_file()
    }

    /// Writes the credentials, replacing any existing file.
    pub fn save(&self, credentials: &Credentials) -> Result<(), CredentialsError> {
        if credentials.username.trim().is_empty() {
            return Err(CredentialsError::Invalid("username is empty".to_string()));
        }
        fs::create_dir_all(&self.dir)?;

        let file = CredentialsFile {
            username: &credentials.username,
            generated_at_ms: credentials.generated_at_ms,
            public: PublicSection {
                n: credentials.key.public_key().n_hex(),
                e: credentials.key.public_key().e_hex(),
            },
            private: PrivateSection {
                d: credentials.key.private_exponent().expose_secret(),
            },
        };
        let encoded = toml::to_string_pretty(&file)?;

        let path = self.path();
        write_private(&path, encoded.as_bytes())?;
        info!(
            event = "credentials_saved",
            path = %path.display(),
            username = %credentials.username
        );
        Ok(())
    }

    /// Returns `None` when no credentials have been saved yet.
    pub fn load(&self) -> Result<Option<Credentials>, CredentialsError> {
        let path = self.path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(event = "credentials_missing", path = %path.display());
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let file: StoredCredentials = toml::from_str(&raw)?;
        if file.username.trim().is_empty() {
            return Err(CredentialsError::Invalid("username is empty".to_string()));
        }
        let key = RsaKey::from_hex_parts(
            &file.public.n,
            &file.public.e,
            file.private.d.expose_secret(),
        )?;

        info!(event = "credentials_loaded", path = %path.display(), username = %file.username);
        Ok(Some(Credentials {
            username: file.username,
            key,
            generated_at_ms: file.generated_at_ms,
        }))
    }

    /// Removes the credentials file. Returns `false` when there was none.
    pub fn delete(&self) -> Result<bool, CredentialsError> {
        match fs::remove_file(self.path()) {
            Ok(()) => {
                info!(event = "credentials_deleted", path = %self.path().display());
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

impl Default for CredentialsStore {
    fn default() -> Self {
        Self::new(DEFAULT_CREDENTIALS_DIR)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies when the file is created.
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MIN_KEY_BITS;

    fn toy_key() -> RsaKey {
        RsaKey::from_hex_parts("ca1", "11", "ac1").expect("toy key")
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CredentialsStore::new(dir.path().join("nested"));
        assert!(!store.exists());
        assert!(store.load().expect("load").is_none());
        assert!(!store.delete().expect("delete"));
    }

    #[test]
    fn saved_credentials_load_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CredentialsStore::new(dir.path().join("UserData"));
        let key = RsaKey::generate(MIN_KEY_BITS).expect("generate");
        let credentials = Credentials::new("alice", key);

        store.save(&credentials).expect("save");
        assert!(store.exists());
        let loaded = store.load().expect("load").expect("present");

        assert_eq!(loaded, credentials);
        let identity: Identity = loaded.into();
        assert_eq!(identity.username, "alice");
    }

    #[test]
    fn file_layout_has_public_and_private_sections() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CredentialsStore::new(dir.path());
        let credentials = Credentials {
            username: "bob".to_string(),
            key: toy_key(),
            generated_at_ms: 42,
        };
        store.save(&credentials).expect("save");

        let raw = fs::read_to_string(store.path()).expect("read");
        let value: toml::Value = toml::from_str(&raw).expect("toml");
        assert_eq!(value["username"].as_str(), Some("bob"));
        assert_eq!(value["generated_at_ms"].as_integer(), Some(42));
        assert_eq!(value["public"]["n"].as_str(), Some("ca1"));
        assert_eq!(value["public"]["e"].as_str(), Some("11"));
        assert_eq!(value["private"]["d"].as_str(), Some("ac1"));
    }

    #[cfg(unix)]
    #[test]
    fn file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let store = CredentialsStore::new(dir.path());
        store
            .save(&Credentials::new("carol", toy_key()))
            .expect("save");
        let mode = fs::metadata(store.path()).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn delete_removes_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CredentialsStore::new(dir.path());
        store.save(&Credentials::new("dave", toy_key())).expect("save");
        assert!(store.delete().expect("delete"));
        assert!(!store.exists());
    }

    #[test]
    fn corrupt_key_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CredentialsStore::new(dir.path());
        fs::write(
            store.path(),
            "username = \"eve\"\n[public]\nn = \"zz\"\ne = \"11\"\n[private]\nd = \"ac1\"\n",
        )
        .expect("write");
        assert!(matches!(store.load(), Err(CredentialsError::Crypto(_))));
    }

    #[test]
    fn blank_username_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CredentialsStore::new(dir.path());
        assert!(matches!(
            store.save(&Credentials::new("  ", toy_key())),
            Err(CredentialsError::Invalid(_))
        ));
    }
}
