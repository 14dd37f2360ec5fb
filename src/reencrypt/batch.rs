//! EDEK batches and the task result delivered to the updater
//!
//! A [`ReencryptionBatch`] is the unit of work sent to the worker pool: an
//! ordered run of files discovered under the read lock, each carrying its
//! existing EDEK. Once submitted a batch is immutable to the coordinator;
//! the pool fills in the new EDEKs, and the updater consumes the finished
//! [`ReencryptionTask`].

use crate::kms::EncryptedKeyVersion;
use crate::namespace::inode::{InodeId, ZoneId};

/// Per-file record in a batch.
///
/// Mutated exactly twice: the existing EDEK is captured at creation (under
/// the read lock) and the new EDEK is set once after the KMS call, before
/// the updater consumes the record.
#[derive(Debug, Clone)]
pub struct FileEdekInfo {
    /// Inode of the file
    pub inode_id: InodeId,

    /// Full path at discovery time; checkpoints record this path
    pub file_path: String,

    /// EDEK as found under the read lock
    pub existing_edek: EncryptedKeyVersion,

    /// EDEK rewrapped by the KMS; None until the pool task succeeds
    pub new_edek: Option<EncryptedKeyVersion>,
}

impl FileEdekInfo {
    /// Record a file for re-encryption
    pub fn new(inode_id: InodeId, file_path: String, existing_edek: EncryptedKeyVersion) -> Self {
        Self {
            inode_id,
            file_path,
            existing_edek,
            new_edek: None,
        }
    }
}

/// An ordered run of EDEK records submitted as one KMS call and one apply
/// step
#[derive(Debug, Default)]
pub struct ReencryptionBatch {
    /// First file's path, for logging
    first_file_path: Option<String>,

    edeks: Vec<FileEdekInfo>,
}

impl ReencryptionBatch {
    /// Create an empty batch with capacity for `batch_size` records
    pub fn new(batch_size: usize) -> Self {
        Self {
            first_file_path: None,
            edeks: Vec::with_capacity(batch_size),
        }
    }

    /// Create an empty batch (used for the zero-file finalization task)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Append a record
    pub fn add(&mut self, info: FileEdekInfo) {
        if self.edeks.is_empty() {
            self.first_file_path = Some(info.file_path.clone());
        }
        self.edeks.push(info);
    }

    /// Path of the first file in the batch, for logging
    pub fn first_file_path(&self) -> &str {
        self.first_file_path.as_deref().unwrap_or("")
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.edeks.len()
    }

    /// True if no records have been added
    pub fn is_empty(&self) -> bool {
        self.edeks.is_empty()
    }

    /// The records, in discovery order
    pub fn records(&self) -> &[FileEdekInfo] {
        &self.edeks
    }

    /// Mutable access for the pool worker writing back new EDEKs
    pub fn records_mut(&mut self) -> &mut [FileEdekInfo] {
        &mut self.edeks
    }

    /// Path of the last record, used to advance the checkpoint past the
    /// batch
    pub fn last_file_path(&self) -> Option<&str> {
        self.edeks.last().map(|r| r.file_path.as_str())
    }
}

/// Outcome of one pool task, consumed by the updater
#[derive(Debug)]
pub struct ReencryptionTask {
    /// Zone the batch belongs to
    pub zone_id: ZoneId,

    /// Whole-batch failure count: 0 on success, batch size on KMS failure
    pub num_failures: u64,

    /// The batch, with new EDEKs filled in on success
    pub batch: ReencryptionBatch,
}
