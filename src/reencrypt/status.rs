//! Zone re-encryption status and the process-wide status store
//!
//! Each zone under re-encryption carries a [`ZoneReencryptionStatus`]:
//! its phase, the target key version fixed at submission, the resume
//! checkpoint, and monotone counters. The status is the unit persisted to
//! the zone root's extended attribute, so a restarted process can rebuild
//! the store and replay interrupted zones.
//!
//! Phase transitions:
//!
//! ```text
//! Submitted -> Processing -> Completed
//!     \            \
//!     Canceled    Failed
//! ```

use crate::error::{NamespaceError, NamespaceResult};
use crate::namespace::inode::ZoneId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Phase of a zone's re-encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneState {
    /// Queued, waiting for the coordinator to pick it up
    Submitted,

    /// The coordinator is walking the zone or batches are in flight
    Processing,

    /// All eligible files were visited and applied
    Completed,

    /// Canceled by request; counters reflect work done before the cancel
    Canceled,

    /// A fatal error occurred while applying updates
    Failed,
}

/// Per-zone status, persisted through the zone root's extended attribute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneReencryptionStatus {
    /// Id of the zone root inode
    pub zone_id: ZoneId,

    /// Full path of the zone root at submission time
    pub zone_path: String,

    /// Current phase
    pub state: ZoneState,

    /// Target zone key version, fixed at submission
    pub ez_key_version_name: String,

    /// Full path of the last file whose update was durably recorded;
    /// None at a fresh start
    pub last_checkpoint_file: Option<String>,

    /// Files whose EDEK was rewritten (monotone)
    pub files_reencrypted: u64,

    /// Files that failed re-encryption (monotone)
    pub num_failures: u64,

    /// Sticky cancellation flag observed by the coordinator between batches
    pub canceled: bool,

    /// When the zone was submitted
    pub submission_time: DateTime<Utc>,

    /// When the zone reached a terminal phase
    pub completion_time: Option<DateTime<Utc>>,
}

impl ZoneReencryptionStatus {
    /// Fresh status for a newly submitted zone
    pub fn new(
        zone_id: ZoneId,
        zone_path: String,
        ez_key_version_name: String,
        submission_time: DateTime<Utc>,
    ) -> Self {
        Self {
            zone_id,
            zone_path,
            state: ZoneState::Submitted,
            ez_key_version_name,
            last_checkpoint_file: None,
            files_reencrypted: 0,
            num_failures: 0,
            canceled: false,
            submission_time,
            completion_time: None,
        }
    }

    /// Request cancellation: sticky flag plus terminal phase
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.canceled = true;
        self.state = ZoneState::Canceled;
        self.completion_time = Some(now);
    }

    /// Mark the zone completed and clear the resume checkpoint
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.state = ZoneState::Completed;
        self.last_checkpoint_file = None;
        self.completion_time = Some(now);
    }

    /// Mark the zone failed
    pub fn mark_failed(&mut self, now: DateTime<Utc>) {
        self.state = ZoneState::Failed;
        self.completion_time = Some(now);
    }

    /// True while the zone still belongs to the active working set
    pub fn is_active(&self) -> bool {
        matches!(self.state, ZoneState::Submitted | ZoneState::Processing)
    }

    /// Serialize for storage in the zone root's extended attribute
    pub fn to_xattr(&self) -> NamespaceResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| NamespaceError::CorruptStatus {
            zone_id: self.zone_id,
            reason: e.to_string(),
        })
    }

    /// Deserialize from a zone root's extended attribute. The zone id is
    /// taken from the inode the attribute was read from, not the payload.
    pub fn from_xattr(zone_id: ZoneId, xattr: &[u8]) -> NamespaceResult<Self> {
        let mut status: Self =
            serde_json::from_slice(xattr).map_err(|e| NamespaceError::CorruptStatus {
                zone_id,
                reason: e.to_string(),
            })?;
        status.zone_id = zone_id;
        Ok(status)
    }
}

/// Process-wide map of zone id to re-encryption status.
///
/// Iteration order is zone id order, which makes `next_unprocessed_zone`
/// deterministic.
#[derive(Debug, Default)]
pub struct ReencryptionStatus {
    zones: BTreeMap<ZoneId, ZoneReencryptionStatus>,
}

impl ReencryptionStatus {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a zone's status
    pub fn insert(&mut self, status: ZoneReencryptionStatus) {
        self.zones.insert(status.zone_id, status);
    }

    /// Look up a zone's status
    pub fn get(&self, zone_id: ZoneId) -> Option<&ZoneReencryptionStatus> {
        self.zones.get(&zone_id)
    }

    /// Look up a zone's status for mutation
    pub fn get_mut(&mut self, zone_id: ZoneId) -> Option<&mut ZoneReencryptionStatus> {
        self.zones.get_mut(&zone_id)
    }

    /// Remove a zone from the store
    pub fn remove(&mut self, zone_id: ZoneId) -> Option<ZoneReencryptionStatus> {
        self.zones.remove(&zone_id)
    }

    /// First zone still waiting to be processed, in zone id order
    pub fn next_unprocessed_zone(&self) -> Option<ZoneId> {
        self.zones
            .values()
            .find(|z| z.state == ZoneState::Submitted)
            .map(|z| z.zone_id)
    }

    /// Transition a zone to `Processing` when the coordinator picks it
    pub fn mark_zone_started(&mut self, zone_id: ZoneId) {
        if let Some(z) = self.zones.get_mut(&zone_id) {
            z.state = ZoneState::Processing;
        }
    }

    /// Requeue a zone after a transient failure
    pub fn mark_zone_for_retry(&mut self, zone_id: ZoneId) {
        if let Some(z) = self.zones.get_mut(&zone_id) {
            z.state = ZoneState::Submitted;
        }
    }

    /// Snapshot of every zone's status, in zone id order
    pub fn list(&self) -> Vec<ZoneReencryptionStatus> {
        self.zones.values().cloned().collect()
    }

    /// Number of zones tracked
    pub fn len(&self) -> usize {
        self.zones.len()
    }

    /// True if no zones are tracked
    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(zone_id: ZoneId) -> ZoneReencryptionStatus {
        ZoneReencryptionStatus::new(zone_id, format!("/z{}", zone_id), "zk@1".into(), Utc::now())
    }

    #[test]
    fn test_next_unprocessed_zone_in_id_order() {
        let mut store = ReencryptionStatus::new();
        store.insert(status(9));
        store.insert(status(3));
        store.insert(status(5));

        assert_eq!(store.next_unprocessed_zone(), Some(3));
        store.mark_zone_started(3);
        assert_eq!(store.next_unprocessed_zone(), Some(5));
        store.mark_zone_started(5);
        store.mark_zone_started(9);
        assert_eq!(store.next_unprocessed_zone(), None);

        store.mark_zone_for_retry(9);
        assert_eq!(store.next_unprocessed_zone(), Some(9));
    }

    #[test]
    fn test_state_transitions() {
        let mut zs = status(1);
        assert!(zs.is_active());

        zs.state = ZoneState::Processing;
        assert!(zs.is_active());

        zs.mark_completed(Utc::now());
        assert_eq!(zs.state, ZoneState::Completed);
        assert!(zs.last_checkpoint_file.is_none());
        assert!(!zs.is_active());
        assert!(zs.completion_time.is_some());
    }

    #[test]
    fn test_cancel_is_sticky() {
        let mut zs = status(1);
        zs.state = ZoneState::Processing;
        zs.cancel(Utc::now());
        assert!(zs.canceled);
        assert_eq!(zs.state, ZoneState::Canceled);
    }

    #[test]
    fn test_xattr_roundtrip() {
        let mut zs = status(4);
        zs.files_reencrypted = 7;
        zs.last_checkpoint_file = Some("/z4/f".into());

        let bytes = zs.to_xattr().unwrap();
        let back = ZoneReencryptionStatus::from_xattr(4, &bytes).unwrap();
        assert_eq!(back.files_reencrypted, 7);
        assert_eq!(back.last_checkpoint_file.as_deref(), Some("/z4/f"));
        assert_eq!(back.ez_key_version_name, "zk@1");

        assert!(ZoneReencryptionStatus::from_xattr(4, b"garbage").is_err());
    }
}
