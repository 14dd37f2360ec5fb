//! The re-encryption pipeline
//!
//! ```text
//!  status store ──► coordinator ──► worker pool ──► updater
//!   (next zone)      (read lock,     (KMS calls,     (write lock,
//!                     tree walk,      no locks)       apply + checkpoint,
//!                     batches)                        finalize)
//! ```
//!
//! The coordinator walks one zone at a time under the namespace read lock
//! and emits bounded batches; the pool rewraps each batch's EDEKs at the
//! KMS; the updater applies results in per-zone submission order under the
//! write lock and records durable checkpoints so an interrupted operation
//! resumes where it left off.

pub mod batch;
pub mod handler;
pub mod pool;
pub mod status;
pub mod stopwatch;
pub mod tracker;
mod updater;

pub use batch::{FileEdekInfo, ReencryptionBatch, ReencryptionTask};
pub use handler::{CoordinatorProgress, ReencryptionHandler, ReencryptionThreads};
pub use status::{ReencryptionStatus, ZoneReencryptionStatus, ZoneState};
pub use tracker::{TaskHandle, ZoneSubmissionTracker};
