//! The key pair of a node and the secret file it is kept in.
//!
//! The file is JSON:
//!
//! ```json
//! {
//!   "curve": "ed25519",
//!   "id": "@<public>.ed25519",
//!   "public": "<public>.ed25519",
//!   "private": "<secret and public>.ed25519"
//! }
//! ```
//!
//! with base64 encoded keys. It is only readable by its owner, and loading refuses files that
//! are readable by anyone else.

use std::{
    fmt,
    io::Write,
    path::{Path, PathBuf},
};

use data_encoding::BASE64;
use ed25519_dalek::{SignatureError, SigningKey};
use nested_enum_utils::common_fields;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tracing::info;

use crate::refs::{FeedAlgo, FeedRef};

const CURVE: &str = "ed25519";
const KEY_SUFFIX: &str = ".ed25519";

/// Errors when reading or writing a secret file.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum KeyError {
    #[snafu(display("failed to access {}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to write {}", path.display()))]
    Persist {
        path: PathBuf,
        source: tempfile::PersistError,
    },
    #[snafu(display("key writer task failed"))]
    Join { source: tokio::task::JoinError },
    /// The secret file can be read by other users.
    #[snafu(display("{} has mode {mode:o}, expected 600", path.display()))]
    InsecurePermissions { path: PathBuf, mode: u32 },
    #[snafu(display("malformed secret file"))]
    Malformed { source: serde_json::Error },
    #[snafu(display("unsupported curve {curve}"))]
    UnsupportedCurve { curve: String },
    #[snafu(display("invalid private key encoding"))]
    InvalidEncoding {},
    /// The public key does not belong to the private key.
    #[snafu(display("inconsistent key pair"))]
    Inconsistent { source: SignatureError },
}

#[derive(Debug, Serialize, Deserialize)]
struct SecretFile {
    curve: String,
    id: FeedRef,
    public: String,
    private: String,
}

/// An ed25519 key pair identifying a node and its feed.
#[derive(Clone)]
pub struct KeyPair {
    secret: SigningKey,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyPair").field(&self.id()).finish()
    }
}

impl KeyPair {
    /// Generates a new key pair.
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::rngs::OsRng)
    }

    /// Generates a new key pair from `rng`.
    pub fn generate_with<R: CryptoRng + RngCore>(rng: &mut R) -> Self {
        Self {
            secret: SigningKey::generate(rng),
        }
    }

    /// The key pair of a 32 byte secret key.
    pub fn from_secret(secret: &[u8; 32]) -> Self {
        Self {
            secret: SigningKey::from_bytes(secret),
        }
    }

    /// The feed of this key pair.
    pub fn id(&self) -> FeedRef {
        FeedRef::new(FeedAlgo::Ed25519, self.secret.verifying_key().into())
    }

    /// The secret key.
    pub fn secret(&self) -> &SigningKey {
        &self.secret
    }

    /// Encodes the key pair as a secret file.
    pub fn to_json(&self) -> String {
        let public = BASE64.encode(self.secret.verifying_key().as_bytes());
        let file = SecretFile {
            curve: CURVE.to_string(),
            id: self.id(),
            public: format!("{public}{KEY_SUFFIX}"),
            private: format!(
                "{}{KEY_SUFFIX}",
                BASE64.encode(&self.secret.to_keypair_bytes())
            ),
        };
        serde_json::to_string_pretty(&file).expect("secret files always encode to json")
    }

    /// Decodes a secret file.
    pub fn from_json(s: &str) -> Result<Self, KeyError> {
        let file: SecretFile = serde_json::from_str(s).context(MalformedSnafu)?;
        snafu::ensure!(
            file.curve == CURVE,
            UnsupportedCurveSnafu { curve: file.curve }
        );
        let private = file
            .private
            .strip_suffix(KEY_SUFFIX)
            .context(InvalidEncodingSnafu)?;
        let bytes: [u8; 64] = BASE64
            .decode(private.as_bytes())
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .context(InvalidEncodingSnafu)?;
        let secret = SigningKey::from_keypair_bytes(&bytes).context(InconsistentSnafu)?;
        let keys = Self { secret };
        if keys.id() != file.id {
            return Err(SignatureError::new()).context(InconsistentSnafu);
        }
        Ok(keys)
    }

    /// Writes the secret file, readable only by the current user.
    ///
    /// The file is written to a temporary file first and then moved into place.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), KeyError> {
        let path = path.as_ref().to_path_buf();
        let json = self.to_json();
        tokio::task::spawn_blocking(move || write_secret(&path, json.as_bytes()))
            .await
            .context(JoinSnafu)?
    }

    /// Reads a secret file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, KeyError> {
        let path = path.as_ref();
        check_permissions(path).await?;
        let s = tokio::fs::read_to_string(path)
            .await
            .context(IoSnafu { path })?;
        Self::from_json(&s)
    }

    /// Reads the secret file, creating it with a new key pair if it does not exist.
    pub async fn load_or_generate(path: impl AsRef<Path>) -> Result<Self, KeyError> {
        let path = path.as_ref();
        if tokio::fs::try_exists(path)
            .await
            .context(IoSnafu { path })?
        {
            return Self::load(path).await;
        }
        let keys = Self::generate();
        keys.save(path).await?;
        info!(id = %keys.id(), path = %path.display(), "generated new key pair");
        Ok(keys)
    }
}

fn write_secret(path: &Path, content: &[u8]) -> Result<(), KeyError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).context(IoSnafu { path: dir })?;
    let mut file = tempfile::Builder::new()
        .prefix(".secret-")
        .tempfile_in(dir)
        .context(IoSnafu { path: dir })?;
    file.write_all(content)
        .and_then(|()| file.as_file().sync_all())
        .context(IoSnafu { path: file.path() })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))
            .context(IoSnafu { path: file.path() })?;
    }
    file.persist(path).context(PersistSnafu { path })?;
    Ok(())
}

#[cfg(unix)]
async fn check_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;
    let meta = tokio::fs::metadata(path)
        .await
        .context(IoSnafu { path })?;
    let mode = meta.permissions().mode() & 0o777;
    snafu::ensure!(mode & 0o077 == 0, InsecurePermissionsSnafu { path, mode });
    Ok(())
}

#[cfg(not(unix))]
async fn check_permissions(_path: &Path) -> Result<(), KeyError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use n0_snafu::ResultExt;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    #[test]
    fn json_round_trip() {
        let keys = KeyPair::generate_with(&mut ChaCha8Rng::seed_from_u64(0));
        let json = keys.to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["curve"], "ed25519");
        assert_eq!(value["id"], keys.id().to_string());
        assert!(value["private"].as_str().unwrap().ends_with(".ed25519"));

        let decoded = KeyPair::from_json(&json).unwrap();
        assert_eq!(decoded.id(), keys.id());
    }

    #[test]
    fn rejects_foreign_id() {
        let keys = KeyPair::from_secret(&[1; 32]);
        let other = KeyPair::from_secret(&[2; 32]);
        let mut value: serde_json::Value = serde_json::from_str(&keys.to_json()).unwrap();
        value["id"] = other.id().to_string().into();
        assert!(matches!(
            KeyPair::from_json(&value.to_string()),
            Err(KeyError::Inconsistent { .. })
        ));

        value["curve"] = "secp256k1".into();
        assert!(matches!(
            KeyPair::from_json(&value.to_string()),
            Err(KeyError::UnsupportedCurve { .. })
        ));
    }

    #[tokio::test]
    async fn load_or_generate_persists() -> n0_snafu::Result {
        let dir = tempfile::tempdir().e()?;
        let path = dir.path().join("ssb").join("secret");
        let keys = KeyPair::load_or_generate(&path).await?;
        let again = KeyPair::load_or_generate(&path).await?;
        assert_eq!(keys.id(), again.id());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).e()?.permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn refuses_readable_secret() -> n0_snafu::Result {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().e()?;
        let path = dir.path().join("secret");
        KeyPair::from_secret(&[3; 32]).save(&path).await?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).e()?;
        assert!(matches!(
            KeyPair::load(&path).await,
            Err(KeyError::InsecurePermissions { mode: 0o644, .. })
        ));
        Ok(())
    }
}
