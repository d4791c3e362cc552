//! Configuration for the packet engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Longest packet lifetime or funding window accepted (one year)
pub const MAX_WINDOW_SECS: u64 = 366 * 24 * 60 * 60;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// HTTP listen address
    pub http_listen_addr: String,

    /// Log output: "json" or "pretty"
    pub log_format: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Packet creation limits
    pub packets: PacketConfig,

    /// Claim coordination
    pub claims: ClaimConfig,

    /// Transient error retries
    pub retry: RetryConfig,

    /// Payment reconciliation
    pub reconciler: ReconcilerConfig,

    /// Expiry sweeper
    pub sweeper: SweeperConfig,

    /// Coupon and invitation side ledgers
    pub rewards: RewardsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/packets"),
            service_name: "packet-engine".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            http_listen_addr: "0.0.0.0:8080".to_string(),
            log_format: "json".to_string(),
            rocksdb: RocksDBConfig::default(),
            packets: PacketConfig::default(),
            claims: ClaimConfig::default(),
            retry: RetryConfig::default(),
            reconciler: ReconcilerConfig::default(),
            sweeper: SweeperConfig::default(),
            rewards: RewardsConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// fsync every commit
    pub sync_writes: bool,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            sync_writes: true,
            enable_statistics: false,
        }
    }
}

/// Packet creation limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketConfig {
    /// Claim window after creation (seconds)
    pub ttl_secs: u64,

    /// Upper bound on shares per packet
    pub max_share_count: u32,

    /// Upper bound on a packet total (minor units)
    pub max_total_amount: u64,

    /// Greeting length limit (characters)
    pub max_greeting_chars: usize,
}

impl Default for PacketConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            max_share_count: 1_000,
            max_total_amount: 100_000_000,
            max_greeting_chars: 36,
        }
    }
}

/// Claim coordination
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimConfig {
    /// How long a request waits for a packet lock before it counts as contention
    pub lock_timeout_ms: u64,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 2_000,
        }
    }
}

/// Retry policy for transient store errors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 10,
            max_delay_ms: 200,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1, // 10% jitter
        }
    }
}

/// Payment reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Pending packets without a callback are refunded after this (seconds)
    pub funding_timeout_secs: u64,

    /// Funding watchdog period (seconds)
    pub watchdog_interval_secs: u64,

    /// Packets examined per watchdog pass
    pub batch_limit: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            funding_timeout_secs: 15 * 60,
            watchdog_interval_secs: 30,
            batch_limit: 500,
        }
    }
}

/// Expiry sweeper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// Run the background sweeper
    pub enabled: bool,

    /// Sweep period (seconds)
    pub interval_secs: u64,

    /// Packets examined per status per pass
    pub batch_limit: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            batch_limit: 500,
        }
    }
}

/// Coupon and invitation side ledgers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardsConfig {
    /// Issue coupons on claims
    pub coupons_enabled: bool,

    /// Smallest share that earns a coupon
    pub coupon_min_share_amount: u64,

    /// Coupon face value
    pub coupon_value: u64,

    /// Credit inviters when their invitees claim
    pub invitations_enabled: bool,

    /// Points per invitee claim
    pub invitation_points_per_claim: u64,
}

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            coupons_enabled: true,
            coupon_min_share_amount: 100,
            coupon_value: 10,
            invitations_enabled: true,
            invitation_points_per_claim: 1,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `PACKET_*` environment variables
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(data_dir) = std::env::var("PACKET_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(addr) = std::env::var("PACKET_HTTP_ADDR") {
            self.http_listen_addr = addr;
        }

        if let Ok(format) = std::env::var("PACKET_LOG_FORMAT") {
            self.log_format = format;
        }

        if let Ok(ttl) = std::env::var("PACKET_TTL_SECS") {
            self.packets.ttl_secs = parse_env("PACKET_TTL_SECS", &ttl)?;
        }

        if let Ok(timeout) = std::env::var("PACKET_FUNDING_TIMEOUT_SECS") {
            self.reconciler.funding_timeout_secs =
                parse_env("PACKET_FUNDING_TIMEOUT_SECS", &timeout)?;
        }

        if let Ok(interval) = std::env::var("PACKET_SWEEP_INTERVAL_SECS") {
            self.sweeper.interval_secs = parse_env("PACKET_SWEEP_INTERVAL_SECS", &interval)?;
        }

        Ok(())
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.packets.ttl_secs == 0 || self.packets.ttl_secs > MAX_WINDOW_SECS {
            return Err(crate::Error::Config(format!(
                "packets.ttl_secs must be 1..={}",
                MAX_WINDOW_SECS
            )));
        }
        if self.packets.max_share_count == 0 {
            return Err(crate::Error::Config(
                "packets.max_share_count must be > 0".into(),
            ));
        }
        if self.packets.max_total_amount < u64::from(self.packets.max_share_count) {
            return Err(crate::Error::Config(
                "packets.max_total_amount must cover one unit per share".into(),
            ));
        }
        if self.reconciler.funding_timeout_secs == 0
            || self.reconciler.funding_timeout_secs > MAX_WINDOW_SECS
        {
            return Err(crate::Error::Config(format!(
                "reconciler.funding_timeout_secs must be 1..={}",
                MAX_WINDOW_SECS
            )));
        }
        if self.sweeper.interval_secs == 0 || self.reconciler.watchdog_interval_secs == 0 {
            return Err(crate::Error::Config(
                "background intervals must be > 0".into(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 || !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(crate::Error::Config(
                "retry.backoff_multiplier must be >= 1 and retry.jitter_factor in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T> {
    value
        .parse()
        .map_err(|_| crate::Error::Config(format!("{} has invalid value {:?}", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "packet-engine");
        assert_eq!(config.packets.ttl_secs, 86_400);
        assert_eq!(config.packets.max_greeting_chars, 36);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            http_listen_addr = "127.0.0.1:9000"

            [packets]
            ttl_secs = 600

            [rewards]
            coupons_enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.http_listen_addr, "127.0.0.1:9000");
        assert_eq!(config.packets.ttl_secs, 600);
        assert_eq!(config.packets.max_share_count, 1_000);
        assert!(!config.rewards.coupons_enabled);
        assert!(config.rewards.invitations_enabled);
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let mut config = Config::default();
        config.packets.ttl_secs = 0;
        assert!(config.validate().is_err());
    }
}
