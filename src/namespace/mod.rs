//! The namespace collaborator: an inode tree behind a reader/writer lock
//!
//! The re-encryption core is a *client* of the namespace. The coordinator
//! only ever takes the read lock; the updater only ever takes the write
//! lock; neither performs blocking I/O (in particular, KMS calls) while a
//! lock is held.
//!
//! Alongside the tree, the namespace owns the process-wide re-encryption
//! status store and the operational flags (safe mode, writability, edit-log
//! pressure) the core consults for readiness and back-pressure.
//!
//! Lock ordering: when both are needed, the tree lock is acquired before the
//! status store mutex, never the other way around.

pub mod inode;

use crate::error::{NamespaceResult, ZoneError};
use crate::reencrypt::status::{ReencryptionStatus, ZoneReencryptionStatus, ZoneState};
use inode::{FsTree, ZoneId};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// The namespace: inode tree, its lock, and the re-encryption status store
pub struct Namespace {
    tree: RwLock<FsTree>,

    /// Process-wide map of zone id to re-encryption status
    status: Mutex<ReencryptionStatus>,

    /// Safe mode blocks all re-encryption work
    safe_mode: AtomicBool,

    /// Cleared when the node cannot serve writes (e.g. standby)
    writable: AtomicBool,

    /// Edit-log back-pressure hint observed by the updater
    edit_log_pressure: AtomicBool,
}

impl Namespace {
    /// Create a namespace around an existing tree
    pub fn new(tree: FsTree) -> Self {
        Self {
            tree: RwLock::new(tree),
            status: Mutex::new(ReencryptionStatus::new()),
            safe_mode: AtomicBool::new(false),
            writable: AtomicBool::new(true),
            edit_log_pressure: AtomicBool::new(false),
        }
    }

    /// Create an empty namespace (root directory only)
    pub fn empty() -> Self {
        Self::new(FsTree::new())
    }

    /// Acquire the shared read lock on the tree
    pub fn read(&self) -> RwLockReadGuard<'_, FsTree> {
        self.tree.read()
    }

    /// Acquire the exclusive write lock on the tree
    pub fn write(&self) -> RwLockWriteGuard<'_, FsTree> {
        self.tree.write()
    }

    /// Lock the re-encryption status store
    pub fn status_store(&self) -> MutexGuard<'_, ReencryptionStatus> {
        self.status.lock()
    }

    /// Fail if the namespace is in safe mode
    pub fn check_safe_mode(&self) -> Result<(), ZoneError> {
        if self.safe_mode.load(Ordering::SeqCst) {
            Err(ZoneError::SafeMode)
        } else {
            Ok(())
        }
    }

    /// Fail if the namespace cannot currently serve writes
    pub fn check_operation_write(&self) -> Result<(), ZoneError> {
        if self.writable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ZoneError::RetryLater("namespace is not writable".into()))
        }
    }

    /// True when the updater should back off before taking the write lock
    pub fn has_edit_log_pressure(&self) -> bool {
        self.edit_log_pressure.load(Ordering::SeqCst)
    }

    /// Toggle safe mode
    pub fn set_safe_mode(&self, on: bool) {
        self.safe_mode.store(on, Ordering::SeqCst);
    }

    /// Toggle write availability
    pub fn set_writable(&self, on: bool) {
        self.writable.store(on, Ordering::SeqCst);
    }

    /// Toggle the edit-log pressure hint
    pub fn set_edit_log_pressure(&self, on: bool) {
        self.edit_log_pressure.store(on, Ordering::SeqCst);
    }

    /// Persist a zone's status into its root inode's extended attribute.
    ///
    /// The caller must hold the write lock; the guard is taken by reference
    /// so the update is durable before the lock is released.
    pub fn persist_zone_status(
        tree: &mut FsTree,
        status: &ZoneReencryptionStatus,
    ) -> NamespaceResult<()> {
        let xattr = status.to_xattr()?;
        tree.set_zone_status_xattr(status.zone_id, Some(xattr))
    }

    /// Remove the persisted status attribute from a zone root
    pub fn clear_zone_status(tree: &mut FsTree, zone_id: ZoneId) -> NamespaceResult<()> {
        tree.set_zone_status_xattr(zone_id, None)
    }

    /// Rebuild the in-memory status store from persisted zone attributes.
    ///
    /// Called at startup. Zones that were mid-flight (`Processing`) are
    /// requeued as `Submitted` so the coordinator replays them from their
    /// last checkpoint. Corrupt attributes are logged and skipped.
    pub fn load_zone_statuses(&self) -> usize {
        let tree = self.tree.read();
        let mut store = self.status.lock();
        let mut loaded = 0;
        for zone_id in tree.zone_roots() {
            let Some(xattr) = tree.zone_status_xattr(zone_id) else {
                continue;
            };
            match ZoneReencryptionStatus::from_xattr(zone_id, xattr) {
                Ok(mut zs) => {
                    if zs.state == ZoneState::Processing {
                        info!(
                            zone = zone_id,
                            checkpoint = zs.last_checkpoint_file.as_deref().unwrap_or(""),
                            "requeueing zone left mid-flight by previous run"
                        );
                        zs.state = ZoneState::Submitted;
                    }
                    store.insert(zs);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(zone = zone_id, error = %e, "skipping corrupt zone status attribute");
                }
            }
        }
        loaded
    }
}
