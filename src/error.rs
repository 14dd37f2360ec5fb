//! Error types for ez-rewrap
//!
//! This module defines the error hierarchy covering:
//! - Zone readiness and lifecycle errors
//! - Namespace (inode tree) errors
//! - KMS client errors
//! - Configuration errors
//!
//! Design philosophy:
//! - Use thiserror for structured error types in library code
//! - Errors should be actionable - include context about what to do
//! - Severity predicates drive the coordinator's per-zone recovery policy

use crate::namespace::inode::{InodeId, ZoneId};
use thiserror::Error;

/// Top-level error type for the re-encryption subsystem
#[derive(Error, Debug)]
pub enum ReencryptError {
    /// Zone readiness and lifecycle errors
    #[error("Zone error: {0}")]
    Zone(#[from] ZoneError),

    /// Namespace (inode tree) errors
    #[error("Namespace error: {0}")]
    Namespace(#[from] NamespaceError),

    /// KMS client errors
    #[error("KMS error: {0}")]
    Kms(#[from] KmsError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors (thread spawn, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Shutdown observed during a wait or sleep
    #[error("Operation interrupted by shutdown")]
    Interrupted,

    /// Channel closed unexpectedly
    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

impl ReencryptError {
    /// Check if this error is transient: the zone should be requeued and
    /// retried on a later scan rather than dropped.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReencryptError::Zone(ZoneError::SafeMode)
                | ReencryptError::Zone(ZoneError::RetryLater(_))
        )
    }

    /// Check if this error is a cooperative cancellation rather than a
    /// failure. Canceled zones abort cleanly and keep their counters.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ReencryptError::Zone(ZoneError::Canceled(_)))
    }

    /// Check if this error aborts only the current zone. The coordinator
    /// logs it and moves on to the next scan.
    pub fn is_zone_local(&self) -> bool {
        self.is_transient()
            || self.is_cancellation()
            || matches!(
                self,
                ReencryptError::Zone(_) | ReencryptError::Namespace(_) | ReencryptError::Kms(_)
            )
    }
}

/// Zone readiness and lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ZoneError {
    /// No re-encryption status recorded for the zone
    #[error("Status for zone {0} cannot be found")]
    StatusNotFound(ZoneId),

    /// Re-encryption was canceled for the zone
    #[error("Re-encryption is canceled for zone {0}")]
    Canceled(ZoneId),

    /// Cancel/remove issued against a zone with no active re-encryption
    #[error("Zone {0} is not under re-encryption")]
    NotUnderReencryption(ZoneId),

    /// The zone root was deleted while re-encryption was in progress
    #[error("Zone {0} is deleted")]
    Deleted(ZoneId),

    /// The inode is not an encryption zone root
    #[error("Inode {0} is not the root of an encryption zone")]
    NotZoneRoot(InodeId),

    /// The namespace is in safe mode and cannot be written
    #[error("Namespace is in safe mode, cannot re-encrypt")]
    SafeMode,

    /// The namespace is temporarily not writeable
    #[error("Namespace not ready for write ({0}), retry later")]
    RetryLater(String),
}

/// Namespace (inode tree) errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NamespaceError {
    /// Path does not resolve to an inode
    #[error("Path not found: '{0}'")]
    NotFound(String),

    /// Inode id does not resolve
    #[error("Inode {0} not found")]
    InodeNotFound(InodeId),

    /// Operation requires a directory
    #[error("Not a directory: '{0}'")]
    NotADirectory(String),

    /// Operation requires a file
    #[error("Not a file: '{0}'")]
    NotAFile(String),

    /// Create collided with an existing entry
    #[error("Already exists: '{0}'")]
    AlreadyExists(String),

    /// EDEK update attempted on a file without encryption metadata
    #[error("File '{0}' has no encryption info")]
    NotEncrypted(String),

    /// Zone status extended attribute failed to round-trip
    #[error("Corrupt re-encryption status on zone {zone_id}: {reason}")]
    CorruptStatus { zone_id: ZoneId, reason: String },
}

/// KMS client errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KmsError {
    /// Key does not exist at the KMS
    #[error("Key '{0}' not found")]
    KeyNotFound(String),

    /// Authentication/authorization failure at the KMS
    #[error("KMS security failure: {0}")]
    Security(String),

    /// Transport or server-side failure at the KMS
    #[error("KMS I/O failure: {0}")]
    Io(String),
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Sleep interval must be positive
    #[error("Invalid sleep interval {ms}ms: must be positive")]
    InvalidSleepInterval { ms: u64 },

    /// Batch size must be positive
    #[error("Invalid batch size {size}: must be positive")]
    InvalidBatchSize { size: usize },

    /// Throttle ratio must be in (0, 1]
    #[error("Invalid throttle ratio {ratio}: must be in (0, 1]")]
    InvalidThrottleRatio { ratio: f64 },

    /// Worker pool must have at least one thread
    #[error("Invalid EDEK thread count {count}: must be positive")]
    InvalidEdekThreads { count: usize },

    /// Checkpoint interval must be positive
    #[error("Invalid updater checkpoint interval {every}: must be positive")]
    InvalidCheckpointInterval { every: usize },
}

/// Result type alias for ReencryptError
pub type Result<T> = std::result::Result<T, ReencryptError>;

/// Result type alias for NamespaceError
pub type NamespaceResult<T> = std::result::Result<T, NamespaceError>;

/// Result type alias for KmsError
pub type KmsResult<T> = std::result::Result<T, KmsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let safe_mode: ReencryptError = ZoneError::SafeMode.into();
        assert!(safe_mode.is_transient());
        assert!(!safe_mode.is_cancellation());

        let retry: ReencryptError = ZoneError::RetryLater("standby".into()).into();
        assert!(retry.is_transient());

        let canceled: ReencryptError = ZoneError::Canceled(17).into();
        assert!(!canceled.is_transient());
        assert!(canceled.is_cancellation());
    }

    #[test]
    fn test_zone_local_classification() {
        let deleted: ReencryptError = ZoneError::Deleted(3).into();
        assert!(deleted.is_zone_local());

        let kms: ReencryptError = KmsError::Io("connection refused".into()).into();
        assert!(kms.is_zone_local());

        assert!(!ReencryptError::Interrupted.is_zone_local());
        assert!(!ReencryptError::ChannelClosed.is_zone_local());
    }

    #[test]
    fn test_error_conversion() {
        let ns_err = NamespaceError::NotFound("/zone/missing".into());
        let err: ReencryptError = ns_err.into();
        assert!(matches!(err, ReencryptError::Namespace(_)));
    }
}
