//! Configuration for the re-encryption subsystem
//!
//! This module defines:
//! - CLI argument parsing for the simulate binary using clap derive macros
//! - Runtime configuration with validation

use crate::error::ConfigError;
use clap::Parser;
use std::time::Duration;
use tracing::warn;

/// Batch sizes above this flood the edit-log buffer with xattr updates made
/// under the write lock, hurting namespace throughput
pub const MAX_BATCH_SIZE_WITHOUT_FLOODING: usize = 2000;

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct ReencryptConfig {
    /// Inter-zone wait when the coordinator is idle
    pub sleep_interval: Duration,

    /// EDEK records per batch
    pub batch_size: usize,

    /// Maximum share of wall time the coordinator may hold the read lock,
    /// in (0, 1]
    pub throttle_ratio: f64,

    /// Worker pool size for KMS calls
    pub edek_threads: usize,

    /// Applied records per durable checkpoint
    pub updater_checkpoint_every: usize,
}

impl Default for ReencryptConfig {
    fn default() -> Self {
        Self {
            sleep_interval: Duration::from_millis(1000),
            batch_size: 1000,
            throttle_ratio: 1.0,
            edek_threads: 10,
            updater_checkpoint_every: 1000,
        }
    }
}

impl ReencryptConfig {
    /// Validate all options, warning about legal-but-risky values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sleep_interval.is_zero() {
            return Err(ConfigError::InvalidSleepInterval { ms: 0 });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize { size: 0 });
        }
        if self.batch_size > MAX_BATCH_SIZE_WITHOUT_FLOODING {
            warn!(
                batch_size = self.batch_size,
                limit = MAX_BATCH_SIZE_WITHOUT_FLOODING,
                "re-encryption batch size may flood the edit log buffer and \
                 trigger a sync within the write lock"
            );
        }
        if !(self.throttle_ratio > 0.0 && self.throttle_ratio <= 1.0) {
            return Err(ConfigError::InvalidThrottleRatio {
                ratio: self.throttle_ratio,
            });
        }
        if self.edek_threads == 0 {
            return Err(ConfigError::InvalidEdekThreads { count: 0 });
        }
        if self.updater_checkpoint_every == 0 {
            return Err(ConfigError::InvalidCheckpointInterval { every: 0 });
        }
        Ok(())
    }
}

/// Zone re-encryption simulator: builds a synthetic encrypted namespace,
/// rolls the zone key, and drives a full re-encryption through the real
/// coordinator/updater pipeline.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "ez-rewrap",
    version,
    about = "Simulate a zone key rotation over a synthetic encrypted namespace",
    after_help = "EXAMPLES:\n    \
        ez-rewrap --files 100000 -t 16\n    \
        ez-rewrap --files 5000 --batch-size 100 --fail-every 7\n    \
        ez-rewrap --files 20000 --throttle-ratio 0.2 -v"
)]
pub struct CliArgs {
    /// Number of encrypted files to create in the zone
    #[arg(long, default_value = "10000", value_name = "NUM")]
    pub files: u64,

    /// Number of subdirectories the files are spread across
    #[arg(long, default_value = "16", value_name = "NUM")]
    pub dirs: u64,

    /// EDEK records per batch
    #[arg(short = 'b', long, default_value = "1000", value_name = "NUM")]
    pub batch_size: usize,

    /// Worker threads for KMS calls
    #[arg(short = 't', long, default_value = "10", value_name = "NUM")]
    pub threads: usize,

    /// Applied records per durable checkpoint
    #[arg(long, default_value = "1000", value_name = "NUM")]
    pub checkpoint_every: usize,

    /// Maximum share of wall time the coordinator may hold the read lock
    #[arg(long, default_value = "1.0", value_name = "RATIO")]
    pub throttle_ratio: f64,

    /// Coordinator inter-zone wait in milliseconds
    #[arg(long, default_value = "100", value_name = "MS")]
    pub sleep_interval_ms: u64,

    /// Inject a KMS failure on every Nth batch (0 = never)
    #[arg(long, default_value = "0", value_name = "N")]
    pub fail_every: u64,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Verbose output
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

impl CliArgs {
    /// Build the validated runtime configuration
    pub fn to_config(&self) -> Result<ReencryptConfig, ConfigError> {
        let config = ReencryptConfig {
            sleep_interval: Duration::from_millis(self.sleep_interval_ms),
            batch_size: self.batch_size,
            throttle_ratio: self.throttle_ratio,
            edek_threads: self.threads,
            updater_checkpoint_every: self.checkpoint_every,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ReencryptConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_values() {
        let mut config = ReencryptConfig::default();
        config.batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBatchSize { .. })
        ));

        let mut config = ReencryptConfig::default();
        config.sleep_interval = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSleepInterval { .. })
        ));

        let mut config = ReencryptConfig::default();
        config.edek_threads = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEdekThreads { .. })
        ));

        let mut config = ReencryptConfig::default();
        config.updater_checkpoint_every = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCheckpointInterval { .. })
        ));
    }

    #[test]
    fn test_throttle_ratio_bounds() {
        let mut config = ReencryptConfig::default();
        config.throttle_ratio = 0.0;
        assert!(config.validate().is_err());

        config.throttle_ratio = 1.5;
        assert!(config.validate().is_err());

        config.throttle_ratio = 0.1;
        assert!(config.validate().is_ok());

        config.throttle_ratio = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_args_to_config() {
        let args = CliArgs::parse_from(["ez-rewrap", "--files", "100", "-b", "50"]);
        let config = args.to_config().unwrap();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.edek_threads, 10);
    }
}
