//! ez-rewrap - Re-encryption Coordinator for Encrypted Namespaces
//!
//! When the key of an encryption zone (an encrypted subtree of a
//! hierarchical namespace) is rotated, every file under the zone still
//! carries a data encryption key wrapped by the old zone key version. This
//! crate re-wraps them all: it walks the zone, batches the encrypted keys,
//! sends each batch to the Key Management Service, and applies the rewrapped
//! keys back to the namespace, checkpointing as it goes so an interrupted
//! run resumes where it stopped.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Namespace                                │
//! │              (inode tree, reader/writer lock)                    │
//! └───────┬─────────────────────────────────────────────▲───────────┘
//!         │ read lock                        write lock │
//!         ▼                                             │
//! ┌──────────────────┐                        ┌─────────┴─────────┐
//! │   Coordinator    │                        │      Updater      │
//! │ - depth-first    │                        │ - apply new EDEKs │
//! │   zone walk      │                        │ - submission-order│
//! │ - batch EDEKs    │                        │   drain per zone  │
//! │ - 3-axis         │                        │ - durable         │
//! │   throttling     │                        │   checkpoints     │
//! └────────┬─────────┘                        └─────────▲─────────┘
//!          │ batches                      completions   │
//!          ▼                                            │
//! ┌─────────────────────────────────────────────────────┴───────────┐
//! │                        Worker Pool                               │
//! │  ┌─────────┐  ┌─────────┐         ┌─────────┐                   │
//! │  │Worker 1 │  │Worker 2 │  ...    │Worker N │   ──► KMS         │
//! │  └─────────┘  └─────────┘         └─────────┘   (no locks held) │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - The coordinator holds only the read lock and releases it around every
//!   batch submission; no KMS call ever happens under a namespace lock.
//! - Batches of one zone are applied in strict submission order.
//! - Checkpoints advance monotonically in the tree's lexicographic order
//!   and are durable before the write lock is released.
//! - Nested encryption zones are skipped whole; they have their own
//!   re-encryption lifecycle.
//! - Cancellation is cooperative at zone granularity: queued batches never
//!   run, in-flight ones complete and are discarded.
//!
//! # Example
//!
//! ```no_run
//! use ez_rewrap::config::ReencryptConfig;
//! use ez_rewrap::kms::{KmsClient, LocalKeyProvider};
//! use ez_rewrap::namespace::Namespace;
//! use ez_rewrap::reencrypt::ReencryptionHandler;
//! use std::sync::Arc;
//!
//! # fn main() -> ez_rewrap::error::Result<()> {
//! let namespace = Arc::new(Namespace::empty());
//! let kms = Arc::new(LocalKeyProvider::new());
//! let handler = Arc::new(ReencryptionHandler::new(
//!     namespace,
//!     kms.clone() as Arc<dyn KmsClient>,
//!     ReencryptConfig::default(),
//! )?);
//! let threads = handler.start()?;
//!
//! // roll the key, then: handler.submit_zone(zone_id, &new_version)?;
//!
//! handler.stop_threads();
//! threads.join();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod kms;
pub mod namespace;
pub mod progress;
pub mod reencrypt;

pub use config::{CliArgs, ReencryptConfig};
pub use error::{ReencryptError, Result};
pub use kms::{EncryptedKeyVersion, KmsClient, LocalKeyProvider};
pub use namespace::Namespace;
pub use reencrypt::{ReencryptionHandler, ReencryptionThreads, ZoneReencryptionStatus, ZoneState};
