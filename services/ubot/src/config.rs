//! Node configuration.
//!
//! Everything is read from environment variables; each falls back to the
//! default documented on its field.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use ubot_cache::CacheConfig;
use ubot_id::NodeNumber;

use crate::pool::{SizeLimits, SizePolicy};
use crate::storage::DbConfig;

/// Node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// This node's number (`UBOT_NODE_NUMBER`, required).
    pub node_number: NodeNumber,

    /// Network config file (`UBOT_NETCONFIG`, default `netconfig.json`).
    pub netconfig_path: PathBuf,

    /// HTTP listen address (`UBOT_HTTP_ADDR`, default `127.0.0.1:8080`).
    pub http_addr: SocketAddr,

    /// UDP listen address (`UBOT_UDP_ADDR`, default: from the network config).
    pub udp_addr: Option<SocketAddr>,

    /// Log level fallback when `RUST_LOG` is unset (`UBOT_LOG_LEVEL`, default `info`).
    pub log_level: String,

    /// Postgres ledger; the in-memory ledger is used when `DATABASE_URL` is unset.
    pub database: Option<DbConfig>,

    pub processor: ProcessorConfig,
    pub storage: StorageConfig,
    pub caches: CacheSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let node_number = std::env::var("UBOT_NODE_NUMBER")
            .context("UBOT_NODE_NUMBER is required")?
            .parse()
            .context("UBOT_NODE_NUMBER must be an unsigned integer")?;

        let netconfig_path = std::env::var("UBOT_NETCONFIG")
            .unwrap_or_else(|_| "netconfig.json".to_string())
            .into();

        let http_addr = std::env::var("UBOT_HTTP_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid UBOT_HTTP_ADDR")?;

        let udp_addr = std::env::var("UBOT_UDP_ADDR")
            .ok()
            .map(|s| s.parse())
            .transpose()
            .context("invalid UBOT_UDP_ADDR")?;

        let log_level = std::env::var("UBOT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let database = std::env::var("DATABASE_URL")
            .ok()
            .map(|_| DbConfig::from_env());

        Ok(Self {
            node_number,
            netconfig_path,
            http_addr,
            udp_addr,
            log_level,
            database,
            processor: ProcessorConfig::from_env(),
            storage: StorageConfig::from_env(),
            caches: CacheSettings::from_env(),
        })
    }
}

/// Phase timing and pool sizing.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    /// Pool policy for methods that set none.
    pub default_pool: SizePolicy,
    /// Quorum policy for methods that set none.
    pub default_quorum: SizePolicy,
    /// `UBOT_MAX_POOL_SIZE`, default 20.
    pub max_pool_size: usize,
    /// `UBOT_MAX_QUORUM_SIZE`, default 20.
    pub max_quorum_size: usize,
    /// How long a responder waits in INIT for the download invite (default 10s).
    pub init_timeout: Duration,
    /// Invite re-send period (default 1s).
    pub send_period: Duration,
    /// `UBOT_SEND_TIMEOUT_MS`, default 40s.
    pub send_timeout: Duration,
    /// Starting-contract fetch retry period (default 1s).
    pub download_period: Duration,
    /// `UBOT_DOWNLOAD_TIMEOUT_MS`, default 40s.
    pub download_timeout: Duration,
    /// Result vote re-send period (default 1s).
    pub exec_period: Duration,
    /// `UBOT_EXEC_TIMEOUT_MS`, default 60s.
    pub exec_timeout: Duration,
    /// Timeout of a single peer HTTP request (default 5s).
    pub http_client_timeout: Duration,
    /// Processor mailbox capacity (default 256).
    pub mailbox_size: usize,
    /// Notifications held for a later phase (default 1024).
    pub deferred_limit: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            default_pool: SizePolicy::Size(5),
            default_quorum: SizePolicy::Percentage(60.0),
            max_pool_size: 20,
            max_quorum_size: 20,
            init_timeout: Duration::from_secs(10),
            send_period: Duration::from_secs(1),
            send_timeout: Duration::from_secs(40),
            download_period: Duration::from_secs(1),
            download_timeout: Duration::from_secs(40),
            exec_period: Duration::from_secs(1),
            exec_timeout: Duration::from_secs(60),
            http_client_timeout: Duration::from_secs(5),
            mailbox_size: 256,
            deferred_limit: 1024,
        }
    }
}

impl ProcessorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_pool_size: env_parse("UBOT_MAX_POOL_SIZE", defaults.max_pool_size),
            max_quorum_size: env_parse("UBOT_MAX_QUORUM_SIZE", defaults.max_quorum_size),
            send_timeout: env_millis("UBOT_SEND_TIMEOUT_MS", defaults.send_timeout),
            download_timeout: env_millis("UBOT_DOWNLOAD_TIMEOUT_MS", defaults.download_timeout),
            exec_timeout: env_millis("UBOT_EXEC_TIMEOUT_MS", defaults.exec_timeout),
            ..defaults
        }
    }

    pub fn limits(&self) -> SizeLimits {
        SizeLimits {
            max_pool_size: self.max_pool_size,
            max_quorum_size: self.max_quorum_size,
        }
    }
}

/// Storage consensus timing.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// Vote re-send period, also the first multi read re-poll delay (default 500ms).
    pub storage_vote_period: Duration,
    /// `UBOT_STORAGE_WRITE_TIMEOUT_MS`, default 20s.
    pub storage_write_timeout: Duration,
    /// Fraction of the pool a multi read waits for (default 0.5).
    pub storage_read_trust_level: f64,
    /// Multi read polls before giving up (default 8).
    pub max_download_attempts: u32,
    /// Upper bound of the re-poll backoff (default 5s).
    pub backoff_max: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_vote_period: Duration::from_millis(500),
            storage_write_timeout: Duration::from_secs(20),
            storage_read_trust_level: 0.5,
            max_download_attempts: 8,
            backoff_max: Duration::from_secs(5),
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            storage_write_timeout: env_millis(
                "UBOT_STORAGE_WRITE_TIMEOUT_MS",
                defaults.storage_write_timeout,
            ),
            storage_read_trust_level: env_parse(
                "UBOT_STORAGE_READ_TRUST_LEVEL",
                defaults.storage_read_trust_level,
            ),
            max_download_attempts: env_parse(
                "UBOT_MAX_DOWNLOAD_ATTEMPTS",
                defaults.max_download_attempts,
            ),
            ..defaults
        }
    }
}

/// Lifetimes of the node's caches.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    /// How long finished processors keep answering (default 5m).
    pub processor_max_age: Duration,
    /// Method and storage results served to peers (default 5m).
    pub result_max_age: Duration,
    /// Starting-contract download sessions (default 5m).
    pub session_max_age: Duration,
    /// Sweep period shared by all caches (default 10s).
    pub sweep_period: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            processor_max_age: Duration::from_secs(300),
            result_max_age: Duration::from_secs(300),
            session_max_age: Duration::from_secs(300),
            sweep_period: Duration::from_secs(10),
        }
    }
}

impl CacheSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            processor_max_age: env_millis("UBOT_PROCESSOR_MAX_AGE_MS", defaults.processor_max_age),
            ..defaults
        }
    }

    pub fn processors(&self) -> CacheConfig {
        self.cache(self.processor_max_age)
    }

    pub fn results(&self) -> CacheConfig {
        self.cache(self.result_max_age)
    }

    pub fn sessions(&self) -> CacheConfig {
        self.cache(self.session_max_age)
    }

    fn cache(&self, max_age: Duration) -> CacheConfig {
        CacheConfig {
            max_age,
            sweep_period: self.sweep_period,
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_millis(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let processor = ProcessorConfig::default();
        assert!(processor.send_period < processor.send_timeout);
        assert!(processor.download_period < processor.download_timeout);
        assert_eq!(processor.deferred_limit, 1024);

        let storage = StorageConfig::default();
        assert!(storage.storage_vote_period < storage.storage_write_timeout);
        assert!(storage.storage_read_trust_level > 0.0 && storage.storage_read_trust_level <= 1.0);
    }

    #[test]
    fn test_cache_settings_share_sweep_period() {
        let settings = CacheSettings::default();
        assert_eq!(settings.results().sweep_period, settings.sweep_period);
        assert_eq!(settings.processors().max_age, settings.processor_max_age);
    }

    #[test]
    fn test_env_parse_falls_back() {
        assert_eq!(env_parse("UBOT_TEST_UNSET_VARIABLE", 7usize), 7);
        assert_eq!(
            env_millis("UBOT_TEST_UNSET_VARIABLE", Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }
}
