//! The re-encryption updater
//!
//! A single long-running worker that consumes pool completions and applies
//! new EDEKs back to the namespace under the write lock. Completions arrive
//! in completion order across zones; the updater recovers per-zone
//! submission order by draining each zone tracker strictly from the head,
//! only past tasks whose outcome is already filled.
//!
//! Checkpoints are recorded into the zone root's extended attribute while
//! the write lock is held, so a checkpoint is durable before any later
//! namespace change can be observed.

use crate::config::ReencryptConfig;
use crate::error::{ReencryptError, Result};
use crate::namespace::inode::{FsTree, ZoneId};
use crate::namespace::Namespace;
use crate::reencrypt::batch::ReencryptionTask;
use crate::reencrypt::handler::HandlerShared;
use crate::reencrypt::tracker::TaskOutcome;
use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Applies completed re-encryption tasks to the namespace
pub(crate) struct ReencryptionUpdater {
    namespace: Arc<Namespace>,
    shared: Arc<HandlerShared>,
    completions: Receiver<ZoneId>,
    config: ReencryptConfig,
    pause: Arc<AtomicBool>,
}

impl ReencryptionUpdater {
    pub(crate) fn new(
        namespace: Arc<Namespace>,
        shared: Arc<HandlerShared>,
        completions: Receiver<ZoneId>,
        config: ReencryptConfig,
        pause: Arc<AtomicBool>,
    ) -> Self {
        Self {
            namespace,
            shared,
            completions,
            config,
            pause,
        }
    }

    /// Main loop: block on the completion stream, drain the zone tracker
    /// the completion belongs to, and finalize the zone when its submission
    /// is done and fully drained.
    pub(crate) fn run(self) {
        info!("starting re-encryption updater");
        loop {
            match self.completions.recv_timeout(Duration::from_millis(100)) {
                Ok(zone_id) => {
                    if let Err(e) = self.process_zone_completions(zone_id) {
                        if matches!(e, ReencryptError::Interrupted) {
                            info!("re-encryption updater interrupted");
                            return;
                        }
                        error!(zone = zone_id, error = %e, "failed applying re-encryption results");
                        self.mark_zone_failed(zone_id);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.shared.is_shutdown() {
                        info!("re-encryption updater exiting");
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    info!("completion stream closed, re-encryption updater exiting");
                    return;
                }
            }
        }
    }

    /// Drain finished tasks from the head of the zone's tracker, in
    /// submission order, then finalize the zone if nothing is outstanding.
    fn process_zone_completions(&self, zone_id: ZoneId) -> Result<()> {
        loop {
            let outcome = {
                // take the handler mutex only long enough to pop; the
                // namespace write lock is never acquired under it
                let mut inner = self.shared.inner.lock();
                let Some(zst) = inner.submissions.get_mut(&zone_id) else {
                    // tracker removed by cancel/remove; nothing to apply
                    return Ok(());
                };
                match zst.front() {
                    Some(head) if head.is_done() => {
                        zst.pop_front().and_then(|handle| handle.take_outcome())
                    }
                    _ => None,
                }
            };
            let Some(outcome) = outcome else {
                break;
            };
            match outcome {
                TaskOutcome::Completed(task) => self.process_task(task)?,
                TaskOutcome::Canceled { zone_id, records } => {
                    debug!(zone = zone_id, records, "discarding batch canceled before execution");
                    let mut store = self.namespace.status_store();
                    if let Some(zs) = store.get_mut(zone_id) {
                        zs.num_failures += records;
                    }
                }
            }
        }
        self.finalize_if_complete(zone_id)
    }

    /// Apply one completed task under the write lock: rewrite each file's
    /// EDEK, count skips and failures, and checkpoint every N applied
    /// records plus once past the whole batch.
    fn process_task(&self, task: ReencryptionTask) -> Result<()> {
        // back off while the namespace reports edit-log pressure
        while self.namespace.has_edit_log_pressure() {
            if self.shared.is_shutdown() {
                return Err(ReencryptError::Interrupted);
            }
            debug!(zone = task.zone_id, "updater backing off on edit log pressure");
            thread::sleep(Duration::from_millis(100));
        }
        self.check_pause_for_testing()?;

        let zone_id = task.zone_id;
        let mut tree = self.namespace.write();
        if tree.get(zone_id).is_none() {
            warn!(zone = zone_id, "zone deleted, discarding completed batch");
            return Ok(());
        }
        let canceled = {
            let store = self.namespace.status_store();
            match store.get(zone_id) {
                Some(zs) => zs.canceled,
                None => {
                    warn!(zone = zone_id, "zone status removed, discarding completed batch");
                    return Ok(());
                }
            }
        };
        if canceled {
            debug!(
                zone = zone_id,
                size = task.batch.len(),
                "zone canceled, discarding completed batch"
            );
            let mut store = self.namespace.status_store();
            if let Some(zs) = store.get_mut(zone_id) {
                zs.num_failures += task.batch.len() as u64;
            }
            return Ok(());
        }

        let mut applied_since_flush: u64 = 0;
        let mut skipped: u64 = 0;
        for record in task.batch.records() {
            // a task that failed at the KMS carries no new EDEKs; its
            // records are accounted through task.num_failures below
            let Some(new_edek) = &record.new_edek else {
                continue;
            };
            let up_to_date = tree
                .get(record.inode_id)
                .filter(|inode| inode.is_file())
                .and_then(|inode| inode.encryption_info())
                .map(|info| info.ez_key_version_name() == new_edek.version_name);
            match up_to_date {
                None => {
                    // deleted, replaced, or stripped of encryption since the
                    // batch was built under the read lock
                    debug!(file = %record.file_path, "file gone since batch creation, skipping");
                    skipped += 1;
                }
                Some(true) => {
                    // already at the target version; applying again is a no-op
                    skipped += 1;
                }
                Some(false) => {
                    tree.set_file_encryption_info(record.inode_id, new_edek.clone())?;
                    applied_since_flush += 1;
                    if applied_since_flush >= self.config.updater_checkpoint_every as u64 {
                        self.checkpoint(&mut tree, zone_id, &record.file_path, applied_since_flush, 0)?;
                        applied_since_flush = 0;
                    }
                }
            }
        }

        if skipped > 0 {
            debug!(zone = zone_id, skipped, "records skipped during apply");
        }

        // advance the checkpoint past the batch even when the KMS call
        // failed, so later batches keep making progress
        if let Some(last) = task.batch.last_file_path() {
            self.checkpoint(&mut tree, zone_id, last, applied_since_flush, task.num_failures)?;
        }
        Ok(())
    }

    /// Fold counter deltas into the zone status and persist it into the
    /// zone root's attribute while the write lock is still held.
    fn checkpoint(
        &self,
        tree: &mut FsTree,
        zone_id: ZoneId,
        last_file: &str,
        newly_applied: u64,
        newly_failed: u64,
    ) -> Result<()> {
        let snapshot = {
            let mut store = self.namespace.status_store();
            let Some(zs) = store.get_mut(zone_id) else {
                return Ok(());
            };
            zs.files_reencrypted += newly_applied;
            zs.num_failures += newly_failed;
            zs.last_checkpoint_file = Some(last_file.to_string());
            zs.clone()
        };
        Namespace::persist_zone_status(tree, &snapshot)?;
        debug!(
            zone = zone_id,
            checkpoint = last_file,
            files = snapshot.files_reencrypted,
            failures = snapshot.num_failures,
            "recorded re-encryption checkpoint"
        );
        Ok(())
    }

    /// If the zone's submission is done and its tracker fully drained,
    /// publish the terminal state and drop the tracker.
    fn finalize_if_complete(&self, zone_id: ZoneId) -> Result<()> {
        let done = {
            let inner = self.shared.inner.lock();
            inner
                .submissions
                .get(&zone_id)
                .map(|zst| zst.is_submission_done() && zst.is_empty())
                .unwrap_or(false)
        };
        if !done {
            return Ok(());
        }

        let snapshot = {
            let mut tree = self.namespace.write();
            let snapshot = {
                let mut store = self.namespace.status_store();
                match store.get_mut(zone_id) {
                    Some(zs) => {
                        if !zs.canceled {
                            zs.mark_completed(Utc::now());
                        }
                        Some(zs.clone())
                    }
                    None => None,
                }
            };
            if let Some(zs) = &snapshot {
                if tree.get(zone_id).is_some() {
                    Namespace::persist_zone_status(&mut tree, zs)?;
                }
            }
            snapshot
        };

        if let Some(zs) = snapshot {
            info!(
                zone = %zs.zone_path,
                id = zone_id,
                files = zs.files_reencrypted,
                failures = zs.num_failures,
                "re-encryption completed on zone"
            );
        }
        let mut inner = self.shared.inner.lock();
        inner.submissions.remove(&zone_id);
        Ok(())
    }

    /// Publish `Failed` for a zone whose apply hit a fatal error, and stop
    /// tracking it.
    fn mark_zone_failed(&self, zone_id: ZoneId) {
        let mut tree = self.namespace.write();
        let snapshot = {
            let mut store = self.namespace.status_store();
            store.get_mut(zone_id).map(|zs| {
                zs.mark_failed(Utc::now());
                zs.clone()
            })
        };
        if let Some(zs) = snapshot {
            if tree.get(zone_id).is_some() {
                if let Err(e) = Namespace::persist_zone_status(&mut tree, &zs) {
                    warn!(zone = zone_id, error = %e, "could not persist failed state");
                }
            }
        }
        drop(tree);
        let mut inner = self.shared.inner.lock();
        if let Some(mut zst) = inner.submissions.remove(&zone_id) {
            zst.cancel_all_tasks();
        }
    }

    fn check_pause_for_testing(&self) -> Result<()> {
        while self.pause.load(Ordering::SeqCst) {
            if self.shared.is_shutdown() {
                return Err(ReencryptError::Interrupted);
            }
            thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::{KmsClient, LocalKeyProvider};
    use crate::namespace::inode::FileEncryptionInfo;
    use crate::reencrypt::batch::{FileEdekInfo, ReencryptionBatch};
    use crate::reencrypt::handler::HandlerInner;
    use crate::reencrypt::status::{ZoneReencryptionStatus, ZoneState};
    use crate::reencrypt::tracker::{Submissions, TaskHandle, ZoneSubmissionTracker};
    use crossbeam_channel::unbounded;
    use parking_lot::{Condvar, Mutex};

    struct Fixture {
        namespace: Arc<Namespace>,
        kms: Arc<LocalKeyProvider>,
        updater: ReencryptionUpdater,
        zone_id: ZoneId,
        file_ids: Vec<crate::namespace::inode::InodeId>,
    }

    fn fixture(paths: &[&str], checkpoint_every: usize) -> Fixture {
        let kms = Arc::new(LocalKeyProvider::new());
        kms.create_key("zk");
        let mut tree = FsTree::new();
        let zone_id = tree.create_zone("/z", "zk").unwrap();
        let mut file_ids = Vec::new();
        for path in paths {
            let edek = kms.generate_encrypted_key("zk").unwrap();
            file_ids.push(
                tree.create_file(path, Some(FileEncryptionInfo::new(edek)))
                    .unwrap(),
            );
        }
        let namespace = Arc::new(Namespace::new(tree));

        let target = kms.roll_new_version("zk").unwrap();
        {
            let mut store = namespace.status_store();
            let mut zs =
                ZoneReencryptionStatus::new(zone_id, "/z".into(), target, Utc::now());
            zs.state = ZoneState::Processing;
            store.insert(zs);
        }

        let shared = Arc::new(HandlerShared {
            inner: Mutex::new(HandlerInner {
                submissions: Submissions::new(),
                should_pause: false,
                pause_after_nth_submission: 0,
            }),
            cv: Condvar::new(),
            shutdown: std::sync::atomic::AtomicBool::new(false),
        });
        let (_tx, rx) = unbounded();
        let updater = ReencryptionUpdater::new(
            Arc::clone(&namespace),
            shared,
            rx,
            ReencryptConfig {
                updater_checkpoint_every: checkpoint_every,
                ..ReencryptConfig::default()
            },
            Arc::new(AtomicBool::new(false)),
        );
        Fixture {
            namespace,
            kms,
            updater,
            zone_id,
            file_ids,
        }
    }

    /// Build a completed task the way the pool would: existing EDEKs
    /// captured, then rewrapped through the KMS.
    fn completed_task(fx: &Fixture, paths: &[&str], ids: &[crate::namespace::inode::InodeId]) -> ReencryptionTask {
        let mut batch = ReencryptionBatch::new(paths.len());
        {
            let tree = fx.namespace.read();
            for (path, id) in paths.iter().zip(ids) {
                let edek = tree.file_encryption_info(*id).unwrap().edek.clone();
                batch.add(FileEdekInfo::new(*id, (*path).to_string(), edek));
            }
        }
        let mut edeks: Vec<_> = batch.records().iter().map(|r| r.existing_edek.clone()).collect();
        fx.kms.reencrypt_encrypted_keys(&mut edeks).unwrap();
        for (record, new_edek) in batch.records_mut().iter_mut().zip(edeks) {
            record.new_edek = Some(new_edek);
        }
        ReencryptionTask {
            zone_id: fx.zone_id,
            num_failures: 0,
            batch,
        }
    }

    #[test]
    fn test_apply_updates_edeks_and_checkpoints() {
        let fx = fixture(&["/z/a", "/z/b"], 1000);
        let task = completed_task(&fx, &["/z/a", "/z/b"], &fx.file_ids);

        fx.updater.process_task(task).unwrap();

        let tree = fx.namespace.read();
        for id in &fx.file_ids {
            assert_eq!(
                tree.file_encryption_info(*id).unwrap().ez_key_version_name(),
                "zk@1"
            );
        }
        let store = fx.namespace.status_store();
        let zs = store.get(fx.zone_id).unwrap();
        assert_eq!(zs.files_reencrypted, 2);
        assert_eq!(zs.num_failures, 0);
        assert_eq!(zs.last_checkpoint_file.as_deref(), Some("/z/b"));

        // checkpoint was durable: the xattr round-trips the same state
        let persisted =
            ZoneReencryptionStatus::from_xattr(fx.zone_id, tree.zone_status_xattr(fx.zone_id).unwrap())
                .unwrap();
        assert_eq!(persisted.files_reencrypted, 2);
        assert_eq!(persisted.last_checkpoint_file.as_deref(), Some("/z/b"));
    }

    #[test]
    fn test_applying_same_batch_twice_is_noop() {
        let fx = fixture(&["/z/a"], 1000);
        let task = completed_task(&fx, &["/z/a"], &fx.file_ids);
        let replay = completed_task(&fx, &["/z/a"], &fx.file_ids);

        fx.updater.process_task(task).unwrap();
        fx.updater.process_task(replay).unwrap();

        // the replay's records are already at the target version and are
        // skipped, so the counter does not move again
        let store = fx.namespace.status_store();
        let zs = store.get(fx.zone_id).unwrap();
        assert_eq!(zs.files_reencrypted, 1);
    }

    #[test]
    fn test_deleted_file_counts_as_skip_not_failure() {
        let fx = fixture(&["/z/a", "/z/b"], 1000);
        let task = completed_task(&fx, &["/z/a", "/z/b"], &fx.file_ids);

        fx.namespace.write().delete("/z/a").unwrap();
        fx.updater.process_task(task).unwrap();

        let store = fx.namespace.status_store();
        let zs = store.get(fx.zone_id).unwrap();
        assert_eq!(zs.files_reencrypted, 1);
        assert_eq!(zs.num_failures, 0);
    }

    #[test]
    fn test_kms_failed_batch_advances_progress() {
        let fx = fixture(&["/z/a", "/z/b", "/z/c"], 1000);
        // build a task whose KMS call failed: no new edeks, all failures
        let mut batch = ReencryptionBatch::new(3);
        {
            let tree = fx.namespace.read();
            for (path, id) in ["/z/a", "/z/b", "/z/c"].iter().zip(&fx.file_ids) {
                let edek = tree.file_encryption_info(*id).unwrap().edek.clone();
                batch.add(FileEdekInfo::new(*id, (*path).to_string(), edek));
            }
        }
        let task = ReencryptionTask {
            zone_id: fx.zone_id,
            num_failures: 3,
            batch,
        };

        fx.updater.process_task(task).unwrap();

        let store = fx.namespace.status_store();
        let zs = store.get(fx.zone_id).unwrap();
        assert_eq!(zs.files_reencrypted, 0);
        assert_eq!(zs.num_failures, 3);
        // checkpoint still advanced past the failed batch
        assert_eq!(zs.last_checkpoint_file.as_deref(), Some("/z/c"));
    }

    #[test]
    fn test_canceled_zone_discards_batch() {
        let fx = fixture(&["/z/a", "/z/b"], 1000);
        let task = completed_task(&fx, &["/z/a", "/z/b"], &fx.file_ids);

        {
            let mut store = fx.namespace.status_store();
            store.get_mut(fx.zone_id).unwrap().cancel(Utc::now());
        }
        fx.updater.process_task(task).unwrap();

        let tree = fx.namespace.read();
        // no edek was touched
        for id in &fx.file_ids {
            assert_eq!(
                tree.file_encryption_info(*id).unwrap().ez_key_version_name(),
                "zk@0"
            );
        }
        let store = fx.namespace.status_store();
        let zs = store.get(fx.zone_id).unwrap();
        assert_eq!(zs.files_reencrypted, 0);
        assert_eq!(zs.num_failures, 2);
    }

    #[test]
    fn test_drain_respects_submission_order() {
        let fx = fixture(&["/z/a", "/z/b"], 1000);
        let first = TaskHandle::new();
        let second = TaskHandle::new();
        {
            let mut inner = fx.updater.shared.inner.lock();
            let mut zst = ZoneSubmissionTracker::new();
            zst.add_task(first.clone());
            zst.add_task(second.clone());
            inner.submissions.insert(fx.zone_id, zst);
        }

        // only the second task has completed: nothing can drain yet
        second.complete(TaskOutcome::Completed(completed_task(
            &fx,
            &["/z/b"],
            &fx.file_ids[1..],
        )));
        fx.updater.process_zone_completions(fx.zone_id).unwrap();
        {
            let store = fx.namespace.status_store();
            assert_eq!(store.get(fx.zone_id).unwrap().files_reencrypted, 0);
        }

        // head completes: both drain, in submission order
        first.complete(TaskOutcome::Completed(completed_task(
            &fx,
            &["/z/a"],
            &fx.file_ids[..1],
        )));
        fx.updater.process_zone_completions(fx.zone_id).unwrap();
        let store = fx.namespace.status_store();
        let zs = store.get(fx.zone_id).unwrap();
        assert_eq!(zs.files_reencrypted, 2);
        assert_eq!(zs.last_checkpoint_file.as_deref(), Some("/z/b"));
    }

    #[test]
    fn test_finalize_on_submission_done_and_drained() {
        let fx = fixture(&[], 1000);
        {
            let mut inner = fx.updater.shared.inner.lock();
            let mut zst = ZoneSubmissionTracker::new();
            zst.set_submission_done();
            let handle = TaskHandle::new();
            handle.complete(TaskOutcome::Completed(ReencryptionTask {
                zone_id: fx.zone_id,
                num_failures: 0,
                batch: ReencryptionBatch::empty(),
            }));
            zst.add_task(handle);
            inner.submissions.insert(fx.zone_id, zst);
        }

        fx.updater.process_zone_completions(fx.zone_id).unwrap();

        let store = fx.namespace.status_store();
        let zs = store.get(fx.zone_id).unwrap();
        assert_eq!(zs.state, ZoneState::Completed);
        assert_eq!(zs.files_reencrypted, 0);
        assert!(zs.completion_time.is_some());
        drop(store);
        assert!(fx
            .updater
            .shared
            .inner
            .lock()
            .submissions
            .get(&fx.zone_id)
            .is_none());
    }
}
