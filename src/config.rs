//! Configuration of a node.
//!
//! Everything has a default, so an empty file is a valid configuration:
//!
//! ```toml
//! [blobs]
//! max_size = 5242880
//! max_verify_failures = 3
//!
//! [gossip.ping]
//! pulses = 2
//! interval = "1s"
//!
//! [gossip.cascade]
//! max_steps = 100
//! step_timeout = "5m"
//! ```

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};
use tracing::info;

use crate::want::{DEFAULT_MAX_SIZE, DEFAULT_MAX_VERIFY_FAILURES};

/// Errors when loading a configuration.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to read {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("invalid configuration"))]
    Parse { source: toml::de::Error },
}

/// Node configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Blob replication.
    pub blobs: BlobsConfig,
    /// Feed replication and the gossip calls.
    pub gossip: GossipConfig,
}

impl Config {
    /// Parses a TOML configuration.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).context(ParseSnafu)
    }

    /// Reads the configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(
            "loading config file from {}",
            path.canonicalize().unwrap_or_else(|_| path.to_path_buf()).display()
        );
        let s = tokio::fs::read_to_string(path)
            .await
            .context(ReadSnafu { path })?;
        Self::from_toml(&s)
    }
}

/// Configuration of the want manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobsConfig {
    /// Blobs larger than this are never fetched.
    pub max_size: u64,
    /// Content that fails verification this often makes the want expire.
    pub max_verify_failures: u32,
}

impl Default for BlobsConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            max_verify_failures: DEFAULT_MAX_VERIFY_FAILURES,
        }
    }
}

/// Configuration of the gossip handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// The `gossip.ping` liveness probe.
    pub ping: PingConfig,
    /// The replication cascade run on every connection.
    pub cascade: CascadeConfig,
}

/// Configuration of `gossip.ping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    /// Number of timestamps sent.
    pub pulses: usize,
    /// Delay after each timestamp.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            pulses: 2,
            interval: Duration::from_secs(1),
        }
    }
}

/// Configuration of the replication cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// Upper bound on feeds fetched per connection, unbounded if unset.
    pub max_steps: Option<usize>,
    /// Time limit for fetching a single feed.
    #[serde(with = "humantime_serde")]
    pub step_timeout: Duration,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            max_steps: None,
            step_timeout: Duration::from_secs(5 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_default() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn parse_full() {
        let config = Config::from_toml(
            r#"
            [blobs]
            max_size = 1024

            [gossip.ping]
            pulses = 3
            interval = "250ms"

            [gossip.cascade]
            max_steps = 4
            step_timeout = "30s"
            "#,
        )
        .unwrap();
        assert_eq!(config.blobs.max_size, 1024);
        assert_eq!(config.blobs.max_verify_failures, DEFAULT_MAX_VERIFY_FAILURES);
        assert_eq!(config.gossip.ping.pulses, 3);
        assert_eq!(config.gossip.ping.interval, Duration::from_millis(250));
        assert_eq!(config.gossip.cascade.max_steps, Some(4));
        assert_eq!(config.gossip.cascade.step_timeout, Duration::from_secs(30));
    }

    #[test]
    fn rejects_bad_duration() {
        let err = Config::from_toml("[gossip.ping]\ninterval = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[tokio::test]
    async fn load_from_file() -> n0_snafu::Result {
        use n0_snafu::ResultExt;

        let dir = tempfile::tempdir().e()?;
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "[blobs]\nmax_size = 10\n").await.e()?;
        let config = Config::load(&path).await?;
        assert_eq!(config.blobs.max_size, 10);

        let missing = Config::load(dir.path().join("missing.toml")).await;
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
        Ok(())
    }
}
