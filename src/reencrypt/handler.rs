//! The re-encryption coordinator
//!
//! The coordinator is a single long-running worker. Per scan it takes at
//! most one zone and executes until that zone's submission is finished:
//! walk the zone depth-first in lexicographic order, batch files whose EDEK
//! is wrapped by an outdated key version, and hand batches to the worker
//! pool. The updater applies completed batches back to the namespace.
//!
//! The coordinator is a well-behaved reader: it only ever holds the
//! namespace read lock, releases it around every batch submission, and
//! throttles itself on three axes (pool saturation, updater backlog, and
//! read-lock share of wall time).
//!
//! Only one coordinator runs per process. The bottleneck of re-encryption
//! is the KMS, and the updater is single-threaded behind the write lock, so
//! additional coordinators would buy nothing.

use crate::config::ReencryptConfig;
use crate::error::{ReencryptError, Result, ZoneError};
use crate::kms::KmsClient;
use crate::namespace::inode::{FsTree, InodeId, ZoneId, EMPTY_NAME};
use crate::namespace::Namespace;
use crate::reencrypt::batch::{FileEdekInfo, ReencryptionBatch};
use crate::reencrypt::pool::{EdekTask, EdekWorkerPool};
use crate::reencrypt::status::ZoneReencryptionStatus;
use crate::reencrypt::stopwatch::StopWatch;
use crate::reencrypt::tracker::{Submissions, TaskHandle};
use crate::reencrypt::updater::ReencryptionUpdater;
use chrono::Utc;
use parking_lot::{Condvar, Mutex, RwLockReadGuard};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// State behind the handler mutex: the per-zone trackers and the test
/// pause flags. The condition variable doubles as the inter-zone wake and
/// the pause/resume signal.
pub(crate) struct HandlerInner {
    pub(crate) submissions: Submissions,
    pub(crate) should_pause: bool,
    pub(crate) pause_after_nth_submission: u32,
}

/// Shared between the coordinator, the updater, and the control surface
pub(crate) struct HandlerShared {
    pub(crate) inner: Mutex<HandlerInner>,
    pub(crate) cv: Condvar,
    pub(crate) shutdown: AtomicBool,
}

impl HandlerShared {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Read-lock guard that charges held time to the coordinator's locked-time
/// stopwatch
pub(crate) struct LockedTree<'a> {
    guard: RwLockReadGuard<'a, FsTree>,
    timer: &'a StopWatch,
}

impl Deref for LockedTree<'_> {
    type Target = FsTree;

    fn deref(&self) -> &FsTree {
        &self.guard
    }
}

impl Drop for LockedTree<'_> {
    fn drop(&mut self) {
        self.timer.stop();
    }
}

/// Join handles for the coordinator and updater threads
pub struct ReencryptionThreads {
    handler: Option<JoinHandle<()>>,
    updater: Option<JoinHandle<()>>,
}

impl ReencryptionThreads {
    /// Wait for both threads to exit
    pub fn join(mut self) {
        for (name, handle) in [
            ("handler", self.handler.take()),
            ("updater", self.updater.take()),
        ] {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    warn!(thread = name, "re-encryption thread panicked");
                }
            }
        }
    }
}

/// The re-encryption coordinator and its control surface
pub struct ReencryptionHandler {
    namespace: Arc<Namespace>,
    kms: Arc<dyn KmsClient>,
    config: ReencryptConfig,
    pool: Mutex<EdekWorkerPool>,
    shared: Arc<HandlerShared>,

    /// Updater, parked here until start() moves it onto its thread
    updater: Mutex<Option<ReencryptionUpdater>>,
    updater_pause: Arc<AtomicBool>,

    // stopwatches for throttling
    throttle_timer_all: StopWatch,
    throttle_timer_locked: StopWatch,
}

impl ReencryptionHandler {
    /// Build the coordinator, its worker pool, and its updater. Threads are
    /// not started until [`start`](Self::start).
    pub fn new(
        namespace: Arc<Namespace>,
        kms: Arc<dyn KmsClient>,
        config: ReencryptConfig,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            threads = config.edek_threads,
            batch_size = config.batch_size,
            throttle_ratio = config.throttle_ratio,
            "configured re-encryption"
        );

        let (pool, completions) = EdekWorkerPool::new(config.edek_threads, Arc::clone(&kms))?;
        let shared = Arc::new(HandlerShared {
            inner: Mutex::new(HandlerInner {
                submissions: Submissions::new(),
                should_pause: false,
                pause_after_nth_submission: 0,
            }),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let updater_pause = Arc::new(AtomicBool::new(false));
        let updater = ReencryptionUpdater::new(
            Arc::clone(&namespace),
            Arc::clone(&shared),
            completions,
            config.clone(),
            Arc::clone(&updater_pause),
        );

        Ok(Self {
            namespace,
            kms,
            config,
            pool: Mutex::new(pool),
            shared,
            updater: Mutex::new(Some(updater)),
            updater_pause,
            throttle_timer_all: StopWatch::new(),
            throttle_timer_locked: StopWatch::new(),
        })
    }

    /// Spawn the coordinator and updater threads
    pub fn start(self: &Arc<Self>) -> Result<ReencryptionThreads> {
        let updater = self
            .updater
            .lock()
            .take()
            .ok_or(ReencryptError::ChannelClosed)?;
        let updater_handle = thread::Builder::new()
            .name("reencrypt-updater".into())
            .spawn(move || updater.run())?;

        let handler = Arc::clone(self);
        let handler_handle = thread::Builder::new()
            .name("reencrypt-handler".into())
            .spawn(move || handler.run())?;

        Ok(ReencryptionThreads {
            handler: Some(handler_handle),
            updater: Some(updater_handle),
        })
    }

    /// Stop the updater thread as well as all EDEK re-encryption tasks
    /// submitted, then shut the worker pool down.
    pub fn stop_threads(&self) {
        {
            let mut inner = self.shared.inner.lock();
            for zst in inner.submissions.values_mut() {
                zst.cancel_all_tasks();
            }
        }
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.cv.notify_all();
        self.pool.lock().shutdown();
    }

    /// Enqueue a zone for re-encryption under the given target key version.
    ///
    /// Sets status to `Submitted`, drains the KMS client's EDEK cache for
    /// the zone key (so new files get new-version keys), and wakes the
    /// coordinator. Resubmitting a zone that is already under re-encryption
    /// is an idempotent no-op.
    pub fn submit_zone(&self, zone_id: ZoneId, key_version: &str) -> Result<()> {
        let key_name;
        let zone_path;
        {
            let mut tree = self.namespace.write();
            if !tree.is_encryption_zone_root(zone_id) {
                return Err(ZoneError::NotZoneRoot(zone_id).into());
            }
            zone_path = tree.full_path(zone_id)?;
            key_name = tree.zone_key_name(zone_id)?;

            let mut store = self.namespace.status_store();
            if store.get(zone_id).is_some_and(|zs| zs.is_active()) {
                info!(zone = %zone_path, "zone already under re-encryption, ignoring resubmission");
                return Ok(());
            }
            let zs = ZoneReencryptionStatus::new(
                zone_id,
                zone_path.clone(),
                key_version.to_string(),
                Utc::now(),
            );
            Namespace::persist_zone_status(&mut tree, &zs)?;
            store.insert(zs);
        }

        self.kms.drain_encrypted_keys(&key_name);
        self.notify_new_submission();
        info!(zone = %zone_path, id = zone_id, key_version, "queued zone for re-encryption");
        Ok(())
    }

    /// Cancel re-encryption of a zone. In-flight batches either never run
    /// (still queued) or complete and are discarded by the updater.
    pub fn cancel_zone(&self, zone_id: ZoneId) -> Result<()> {
        let snapshot = {
            let mut tree = self.namespace.write();
            let snapshot = {
                let mut store = self.namespace.status_store();
                match store.get_mut(zone_id) {
                    Some(zs) if zs.is_active() => {
                        zs.cancel(Utc::now());
                        zs.clone()
                    }
                    _ => return Err(ZoneError::NotUnderReencryption(zone_id).into()),
                }
            };
            if tree.get(zone_id).is_some() {
                Namespace::persist_zone_status(&mut tree, &snapshot)?;
            }
            snapshot
        };
        self.remove_zone_tracker_stop_tasks(zone_id);
        info!(zone = %snapshot.zone_path, id = zone_id, "canceled re-encryption");
        Ok(())
    }

    /// Cancel any in-flight work for a zone and remove its status
    pub fn remove_zone(&self, zone_id: ZoneId) -> Result<()> {
        {
            let mut tree = self.namespace.write();
            let removed = self.namespace.status_store().remove(zone_id);
            if removed.is_some() && tree.get(zone_id).is_some() {
                Namespace::clear_zone_status(&mut tree, zone_id)?;
            }
        }
        self.remove_zone_tracker_stop_tasks(zone_id);
        info!(zone = zone_id, "removed re-encryption status");
        Ok(())
    }

    /// Snapshot of every tracked zone's status
    pub fn list_status(&self) -> Vec<ZoneReencryptionStatus> {
        self.namespace.status_store().list()
    }

    /// Wake the coordinator from its inter-zone wait
    pub fn notify_new_submission(&self) {
        self.shared.cv.notify_all();
    }

    /// Submit a zero-file task for the zone so that a zone with no eligible
    /// files still reaches the updater and is finalized. Setting zone
    /// status requires the write lock, which the coordinator never takes;
    /// pushing an empty batch through the pipeline lets the updater do it.
    pub fn add_dummy_tracker(&self, zone_id: ZoneId) {
        let handle = TaskHandle::new();
        {
            let mut inner = self.shared.inner.lock();
            let zst = inner.submissions.entry(zone_id).or_default();
            zst.set_submission_done();
            zst.add_task(handle.clone());
        }
        debug!(zone = zone_id, "submitted zero-file task to finalize zone");
        self.pool.lock().submit(EdekTask {
            zone_id,
            batch: ReencryptionBatch::empty(),
            handle,
        });
    }

    /// Pause the coordinator at its next safe point (testing hook)
    pub fn pause_for_testing(&self) {
        let mut inner = self.shared.inner.lock();
        inner.should_pause = true;
        self.shared.cv.notify_all();
    }

    /// Resume a paused coordinator (testing hook)
    pub fn resume_for_testing(&self) {
        let mut inner = self.shared.inner.lock();
        inner.should_pause = false;
        self.shared.cv.notify_all();
    }

    /// Arm the pause flag to flip after `count` more batch submissions.
    /// The pause itself is evaluated after the post-submission throttle,
    /// outside the namespace lock.
    pub fn pause_after_nth_submission(&self, count: u32) {
        let mut inner = self.shared.inner.lock();
        inner.pause_after_nth_submission = count;
    }

    /// Pause the updater before its next batch apply (testing hook)
    pub fn pause_updater_for_testing(&self) {
        self.updater_pause.store(true, Ordering::SeqCst);
    }

    /// Resume a paused updater (testing hook)
    pub fn resume_updater_for_testing(&self) {
        self.updater_pause.store(false, Ordering::SeqCst);
    }

    /// Main loop. Takes at most one zone per scan and executes until the
    /// zone's submission is finished.
    pub fn run(&self) {
        info!(
            interval_ms = self.config.sleep_interval.as_millis() as u64,
            "starting re-encryption coordinator"
        );
        loop {
            {
                let mut inner = self.shared.inner.lock();
                let _ = self
                    .shared
                    .cv
                    .wait_for(&mut inner, self.config.sleep_interval);
            }
            if self.shared.is_shutdown() {
                info!("re-encryption coordinator exiting");
                return;
            }
            if self.check_pause_for_testing().is_err() {
                return;
            }

            let zone_id = {
                let _tree = self.read_lock();
                let mut store = self.namespace.status_store();
                let Some(zone_id) = store.next_unprocessed_zone() else {
                    continue;
                };
                info!(zone = zone_id, zones = store.len(), "executing re-encryption on zone");
                store.mark_zone_started(zone_id);
                drop(store);
                self.reset_submission_tracker(zone_id);
                zone_id
            };

            match self.reencrypt_encryption_zone(zone_id) {
                Ok(()) => {}
                Err(e) if e.is_cancellation() => {
                    info!(zone = zone_id, "re-encryption canceled on zone");
                }
                Err(e) if e.is_transient() => {
                    info!(zone = zone_id, error = %e, "requeueing zone for a later retry");
                    self.namespace.status_store().mark_zone_for_retry(zone_id);
                }
                Err(ReencryptError::Interrupted) => {
                    info!("re-encryption coordinator interrupted");
                    return;
                }
                Err(e) if e.is_zone_local() => {
                    warn!(zone = zone_id, error = %e, "re-encryption failed on zone");
                }
                Err(e) => {
                    error!(zone = zone_id, error = %e, "re-encryption coordinator exiting");
                    return;
                }
            }
        }
    }

    /// Re-encrypt a zone by iterating all paths inside it in lexicographic
    /// order, resuming from the last checkpoint if one is recorded.
    pub(crate) fn reencrypt_encryption_zone(&self, zone_id: ZoneId) -> Result<()> {
        self.throttle_timer_all.reset();
        self.throttle_timer_all.start();
        self.throttle_timer_locked.reset();

        let (zone_path, key_version, checkpoint) = {
            let tree = self.read_lock();
            let Some(zone) = tree.get(zone_id) else {
                info!(zone = zone_id, "zone removed during re-encryption, skipping");
                return Ok(());
            };
            if !zone.is_directory() {
                info!(zone = zone_id, "cannot re-encrypt: inode is not a directory");
                return Ok(());
            }
            let zone_path = tree.full_path(zone_id)?;
            let store = self.namespace.status_store();
            let zs = store
                .get(zone_id)
                .ok_or(ZoneError::StatusNotFound(zone_id))?;
            (
                zone_path,
                zs.ez_key_version_name.clone(),
                zs.last_checkpoint_file.clone(),
            )
        };
        info!(zone = %zone_path, id = zone_id, key_version = %key_version, "re-encrypting zone");

        let mut scanner = ZoneScanner::new(self, zone_id, key_version);
        match &checkpoint {
            None => scanner.scan_from_root()?,
            Some(file) => {
                info!(zone = %zone_path, checkpoint = %file, "resuming re-encryption after checkpoint");
                scanner.scan_from_checkpoint(file)?;
            }
        }

        // save the last batch and mark the zone's submission complete
        scanner.submit_residual()?;
        self.mark_zone_submission_done(zone_id);
        Ok(())
    }

    /// Acquire the namespace read lock, charging held time to the
    /// locked-time stopwatch
    pub(crate) fn read_lock(&self) -> LockedTree<'_> {
        let guard = self.namespace.read();
        self.throttle_timer_locked.start();
        LockedTree {
            guard,
            timer: &self.throttle_timer_locked,
        }
    }

    /// Check whether the zone is ready for re-encryption:
    /// status present, not canceled, not in safe mode, writable.
    pub(crate) fn check_zone_ready(&self, zone_id: ZoneId) -> Result<()> {
        {
            let store = self.namespace.status_store();
            let zs = store
                .get(zone_id)
                .ok_or(ZoneError::StatusNotFound(zone_id))?;
            if zs.canceled {
                return Err(ZoneError::Canceled(zone_id).into());
            }
        }
        self.namespace.check_safe_mode()?;
        self.namespace.check_operation_write()?;
        Ok(())
    }

    /// Push a non-empty batch to the worker pool, recording its handle on
    /// the zone tracker first so the updater always sees submission order.
    fn submit_batch(&self, zone_id: ZoneId, batch: ReencryptionBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        info!(
            zone = zone_id,
            size = batch.len(),
            start = batch.first_file_path(),
            "submitted batch of zone to re-encrypt"
        );
        let handle = TaskHandle::new();
        {
            let mut inner = self.shared.inner.lock();
            inner
                .submissions
                .entry(zone_id)
                .or_default()
                .add_task(handle.clone());
            // flip the pause flag if this is the nth submission; the actual
            // pause happens outside the lock, after the throttle
            if inner.pause_after_nth_submission > 0 {
                inner.pause_after_nth_submission -= 1;
                if inner.pause_after_nth_submission == 0 {
                    inner.should_pause = true;
                }
            }
        }
        self.pool.lock().submit(EdekTask {
            zone_id,
            batch,
            handle,
        });
        Ok(())
    }

    /// Mark that the last batch for the zone has been submitted. A zone
    /// that never produced a batch gets a zero-file task instead so the
    /// updater still finalizes it.
    fn mark_zone_submission_done(&self, zone_id: ZoneId) {
        let needs_dummy = {
            let mut inner = self.shared.inner.lock();
            match inner.submissions.get_mut(&zone_id) {
                Some(zst) if !zst.is_empty() => {
                    zst.set_submission_done();
                    false
                }
                _ => true,
            }
        };
        if needs_dummy {
            self.add_dummy_tracker(zone_id);
        }
    }

    fn reset_submission_tracker(&self, zone_id: ZoneId) {
        let mut inner = self.shared.inner.lock();
        inner.submissions.entry(zone_id).or_default().reset();
    }

    fn remove_zone_tracker_stop_tasks(&self, zone_id: ZoneId) {
        let mut inner = self.shared.inner.lock();
        if let Some(mut zst) = inner.submissions.remove(&zone_id) {
            zst.cancel_all_tasks();
        }
    }

    /// Total outstanding tasks across all zones
    fn num_tasks_submitted(&self) -> usize {
        let inner = self.shared.inner.lock();
        inner.submissions.values().map(|zst| zst.len()).sum()
    }

    /// Throttle the coordinator on three axes:
    /// 1. don't queue more pool tasks than the CPU could possibly handle;
    /// 2. don't outrun the updater's backlog;
    /// 3. keep read-lock held time under `throttle_ratio` of wall time.
    pub(crate) fn throttle(&self) -> Result<()> {
        let cores = num_cpus::get().max(1);

        if self.pool.lock().queued_tasks() >= cores {
            debug!(cores, "throttling: pool queue at core count");
            while self.pool.lock().queued_tasks() >= cores {
                self.sleep_interruptibly(Duration::from_millis(100))?;
            }
        }

        let max_tasks_piled = cores * 2;
        if self.num_tasks_submitted() >= max_tasks_piled {
            debug!(max_tasks_piled, "throttling: tasks piling up on updater");
            while self.num_tasks_submitted() >= max_tasks_piled {
                self.sleep_interruptibly(Duration::from_millis(500))?;
            }
        }

        if self.config.throttle_ratio >= 1.0 {
            return Ok(());
        }
        let all_ms = self.throttle_timer_all.now().as_millis() as f64;
        let locked_ms = self.throttle_timer_locked.now().as_millis() as f64;
        let expect_ms = all_ms * self.config.throttle_ratio;
        trace!(expect_ms, locked_ms, "read-lock share check");
        if expect_ms < locked_ms {
            // when the ratio is very small, expect may round to 0; derive
            // the sleep from the locked time so the ratio is actually met
            let sleep_ms = (locked_ms / self.config.throttle_ratio - all_ms).max(0.0) as u64;
            debug!(sleep_ms, "throttling: read-lock share exceeded");
            self.sleep_interruptibly(Duration::from_millis(sleep_ms))?;
        }
        self.throttle_timer_all.reset();
        self.throttle_timer_all.start();
        self.throttle_timer_locked.reset();
        Ok(())
    }

    /// Block while the pause flag is up. Must not hold any namespace lock.
    pub(crate) fn check_pause_for_testing(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        while inner.should_pause {
            if self.shared.is_shutdown() {
                return Err(ReencryptError::Interrupted);
            }
            let _ = self
                .shared
                .cv
                .wait_for(&mut inner, Duration::from_millis(100));
        }
        Ok(())
    }

    /// Sleep in slices, waking early on shutdown
    fn sleep_interruptibly(&self, duration: Duration) -> Result<()> {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.shared.is_shutdown() {
                return Err(ReencryptError::Interrupted);
            }
            let slice = remaining.min(Duration::from_millis(100));
            thread::sleep(slice);
            remaining -= slice;
        }
        Ok(())
    }

    /// Point-in-time counters for progress reporting
    pub fn progress(&self) -> CoordinatorProgress {
        let statuses = self.namespace.status_store().list();
        let active_zones = statuses.iter().filter(|z| z.is_active()).count();
        let files_reencrypted: u64 = statuses.iter().map(|z| z.files_reencrypted).sum();
        let num_failures: u64 = statuses.iter().map(|z| z.num_failures).sum();
        CoordinatorProgress {
            zones: statuses.len(),
            active_zones,
            files_reencrypted,
            num_failures,
            queued_batches: self.pool.lock().queued_tasks(),
            outstanding_tasks: self.num_tasks_submitted(),
        }
    }
}

/// Point-in-time view of the coordinator's work
#[derive(Debug, Clone)]
pub struct CoordinatorProgress {
    /// Zones tracked by the status store
    pub zones: usize,

    /// Zones still submitted or processing
    pub active_zones: usize,

    /// Files re-encrypted across all zones
    pub files_reencrypted: u64,

    /// Failures across all zones
    pub num_failures: u64,

    /// Batches waiting in the pool queue
    pub queued_batches: usize,

    /// Tasks not yet drained by the updater
    pub outstanding_tasks: usize,
}

/// Per-zone walk state: the path stack of byte-string cursors and the
/// batch being accumulated.
///
/// The stack holds one cursor per depth from the zone root to the current
/// directory; the bottom element is the start-after within the current
/// directory. Holding only the cursors (never directory snapshots) keeps
/// memory bounded on arbitrarily wide trees.
struct ZoneScanner<'a> {
    handler: &'a ReencryptionHandler,
    zone_id: ZoneId,
    key_version: String,
    batch: ReencryptionBatch,
}

impl<'a> ZoneScanner<'a> {
    fn new(handler: &'a ReencryptionHandler, zone_id: ZoneId, key_version: String) -> Self {
        let batch = ReencryptionBatch::new(handler.config.batch_size);
        Self {
            handler,
            zone_id,
            key_version,
            batch,
        }
    }

    /// Walk the whole zone from its root
    fn scan_from_root(&mut self) -> Result<()> {
        let mut start_afters = vec![EMPTY_NAME.to_vec()];
        self.drive(Some(self.zone_id), &mut start_afters)
    }

    /// Walk the zone starting strictly after the checkpoint file,
    /// reconstructing the cursor stack from its path
    fn scan_from_checkpoint(&mut self, checkpoint: &str) -> Result<()> {
        let mut start_afters = Vec::new();
        let parent = {
            let tree = self.handler.read_lock();
            self.restore_cursor(&tree, checkpoint, &mut start_afters)?
        };
        self.drive(Some(parent), &mut start_afters)
    }

    /// Outer driver: scan directories until the cursor stack is exhausted,
    /// re-resolving the current parent whenever a lock gap invalidated it
    fn drive(&mut self, mut curr: Option<InodeId>, start_afters: &mut Vec<Vec<u8>>) -> Result<()> {
        while !start_afters.is_empty() {
            let parent = match curr {
                Some(id) => id,
                None => self.resolve_cursor(start_afters)?,
            };
            curr = self.scan_dir(parent, start_afters)?;
        }
        Ok(())
    }

    /// Rebuild the cursor stack from a checkpoint file path. Missing
    /// intermediate components truncate the stack at that depth, so the
    /// walk continues from the next sibling at the lowest surviving
    /// ancestor.
    fn restore_cursor(
        &self,
        tree: &FsTree,
        checkpoint: &str,
        start_afters: &mut Vec<Vec<u8>>,
    ) -> Result<InodeId> {
        if tree.get(self.zone_id).is_none() {
            return Err(ZoneError::Deleted(self.zone_id).into());
        }
        let zone_path = tree.full_path(self.zone_id)?;
        let relative = checkpoint.strip_prefix(&zone_path).unwrap_or(checkpoint);
        let components: Vec<&str> = relative.split('/').filter(|c| !c.is_empty()).collect();
        if components.is_empty() {
            start_afters.push(EMPTY_NAME.to_vec());
            return Ok(self.zone_id);
        }

        let mut parent = self.zone_id;
        for (i, component) in components.iter().enumerate() {
            let name = component.as_bytes().to_vec();
            if i == components.len() - 1 {
                // the checkpoint file itself is the bottom cursor; the
                // next-child seek covers it whether or not it still exists
                start_afters.push(name);
                break;
            }
            match tree
                .child(parent, &name)
                .filter(|c| tree.get(*c).map_or(false, |n| n.is_directory()))
            {
                Some(child) => {
                    start_afters.push(name);
                    parent = child;
                }
                None => {
                    start_afters.push(name);
                    break;
                }
            }
        }
        Ok(parent)
    }

    /// Re-resolve the cursor stack to a directory after a lock gap. Returns
    /// the deepest directory the stack still resolves to, truncating the
    /// stack past any component that disappeared.
    fn resolve_cursor(&self, start_afters: &mut Vec<Vec<u8>>) -> Result<InodeId> {
        let tree = self.handler.read_lock();
        if tree.get(self.zone_id).is_none() {
            return Err(ZoneError::Deleted(self.zone_id).into());
        }
        let mut parent = self.zone_id;
        for i in 0..start_afters.len().saturating_sub(1) {
            match tree
                .child(parent, &start_afters[i])
                .filter(|c| tree.get(*c).map_or(false, |n| n.is_directory()))
            {
                Some(child) => parent = child,
                None => {
                    start_afters.truncate(i + 1);
                    break;
                }
            }
        }
        Ok(parent)
    }

    /// Scan one directory: batch eligible files in lexicographic order,
    /// descend into plain subdirectories, skip nested zones. Returns the
    /// directory to continue with, or None if a lock gap requires the
    /// driver to re-resolve the cursor.
    fn scan_dir(
        &mut self,
        curr_id: InodeId,
        start_afters: &mut Vec<Vec<u8>>,
    ) -> Result<Option<InodeId>> {
        let mut tree = self.handler.read_lock();
        self.handler.check_zone_ready(self.zone_id)?;

        let Some(curr) = tree.get(curr_id) else {
            return Ok(None);
        };
        let parent_id = if curr.is_directory() {
            curr_id
        } else {
            match curr.parent {
                Some(p) => p,
                None => return Ok(None),
            }
        };
        let parent_path = tree.full_path(parent_id)?;
        let mut cursor: Vec<u8> = start_afters.last().cloned().unwrap_or_default();
        let mut lock_released = false;

        while let Some((name, child_id)) = tree.next_child(parent_id, &cursor)? {
            cursor = name;
            if !self.visit_file(&tree, child_id)? {
                // not batched: recurse down if it's a plain directory,
                // skip otherwise
                let Some(child) = tree.get(child_id) else {
                    continue;
                };
                if !child.is_directory() {
                    continue;
                }
                if tree.is_encryption_zone_root(child_id) {
                    let nested_path = tree.full_path(child_id)?;
                    info!(
                        path = %nested_path,
                        id = child_id,
                        "nested encryption zone, skipping for re-encryption"
                    );
                    continue;
                }
                // add one level to the depth-first search
                if let Some(bottom) = start_afters.last_mut() {
                    *bottom = tree.name_of(child_id)?;
                }
                start_afters.push(EMPTY_NAME.to_vec());
                return Ok(if lock_released { None } else { Some(child_id) });
            }

            if self.batch.len() >= self.handler.config.batch_size {
                self.submit_current_batch()?;
                lock_released = true;
                drop(tree);
                self.handler.throttle()?;
                self.handler.check_pause_for_testing()?;
                tree = self.handler.read_lock();
                self.handler.check_zone_ready(self.zone_id)?;

                // things may have changed during the lock gap; if the
                // parent is gone or replaced, end this subtree gracefully
                match tree.resolve_path(&parent_path) {
                    Some(id) if id == parent_id => {}
                    _ => {
                        debug!(parent = %parent_path, "parent changed during lock gap, ending subtree");
                        return Ok(None);
                    }
                }
            }
        }

        // finished this directory: pop the cursor and carry this
        // directory's name upward as the start-after at the parent level
        start_afters.pop();
        if !start_afters.is_empty() {
            if let Some(bottom) = start_afters.last_mut() {
                *bottom = tree.name_of(parent_id)?;
            }
        }
        let up = tree.parent_of(parent_id)?;
        Ok(if lock_released { None } else { up })
    }

    /// Batch a file if its EDEK is wrapped by an outdated key version.
    /// Returns true only when the file was added to the current batch.
    fn visit_file(&mut self, tree: &FsTree, id: InodeId) -> Result<bool> {
        let Some(inode) = tree.get(id) else {
            return Ok(false);
        };
        if !inode.is_file() {
            return Ok(false);
        }
        let path = tree.full_path(id)?;
        let Some(enc) = inode.encryption_info() else {
            warn!(file = %path, "file skipped re-encryption because it is not encrypted");
            return Ok(false);
        };
        if enc.ez_key_version_name() == self.key_version {
            trace!(file = %path, "file skipped, edek already wrapped by target key version");
            return Ok(false);
        }
        self.batch.add(FileEdekInfo::new(id, path, enc.edek.clone()));
        Ok(true)
    }

    fn submit_current_batch(&mut self) -> Result<()> {
        let batch = std::mem::replace(
            &mut self.batch,
            ReencryptionBatch::new(self.handler.config.batch_size),
        );
        self.handler.submit_batch(self.zone_id, batch)
    }

    /// Submit whatever is left in the accumulating batch
    fn submit_residual(&mut self) -> Result<()> {
        self.submit_current_batch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::LocalKeyProvider;
    use crate::namespace::inode::FileEncryptionInfo;

    fn build_zone(files: &[&str]) -> (Arc<Namespace>, Arc<LocalKeyProvider>, ZoneId) {
        let kms = Arc::new(LocalKeyProvider::new());
        kms.create_key("zk");
        let mut tree = FsTree::new();
        let zone_id = tree.create_zone("/z", "zk").unwrap();
        for path in files {
            let edek = kms.generate_encrypted_key("zk").unwrap();
            tree.create_file(path, Some(FileEncryptionInfo::new(edek)))
                .unwrap();
        }
        (Arc::new(Namespace::new(tree)), kms, zone_id)
    }

    fn handler_for(
        namespace: &Arc<Namespace>,
        kms: &Arc<LocalKeyProvider>,
        batch_size: usize,
    ) -> ReencryptionHandler {
        let config = ReencryptConfig {
            batch_size,
            edek_threads: 2,
            ..ReencryptConfig::default()
        };
        ReencryptionHandler::new(
            Arc::clone(namespace),
            Arc::clone(kms) as Arc<dyn KmsClient>,
            config,
        )
        .unwrap()
    }

    fn submit_and_scan(handler: &ReencryptionHandler, zone_id: ZoneId, key_version: &str) {
        handler.submit_zone(zone_id, key_version).unwrap();
        handler.namespace.status_store().mark_zone_started(zone_id);
        handler.reencrypt_encryption_zone(zone_id).unwrap();
    }

    #[test]
    fn test_scan_submits_expected_batches() {
        let (namespace, kms, zone_id) = build_zone(&["/z/a", "/z/b", "/z/c"]);
        let target = kms.roll_new_version("zk").unwrap();
        let handler = handler_for(&namespace, &kms, 2);

        submit_and_scan(&handler, zone_id, &target);

        let inner = handler.shared.inner.lock();
        let zst = inner.submissions.get(&zone_id).unwrap();
        // [a,b] and [c]
        assert_eq!(zst.len(), 2);
        assert!(zst.is_submission_done());
    }

    #[test]
    fn test_zone_with_no_eligible_files_gets_dummy_task() {
        let (namespace, kms, zone_id) = build_zone(&[]);
        let target = kms.roll_new_version("zk").unwrap();
        let handler = handler_for(&namespace, &kms, 10);

        submit_and_scan(&handler, zone_id, &target);

        let inner = handler.shared.inner.lock();
        let zst = inner.submissions.get(&zone_id).unwrap();
        assert_eq!(zst.len(), 1);
        assert!(zst.is_submission_done());
    }

    #[test]
    fn test_nested_zone_subtree_is_skipped() {
        let kms = Arc::new(LocalKeyProvider::new());
        kms.create_key("zk");
        kms.create_key("nested");
        let mut tree = FsTree::new();
        let zone_id = tree.create_zone("/z", "zk").unwrap();
        tree.create_file(
            "/z/a",
            Some(FileEncryptionInfo::new(
                kms.generate_encrypted_key("zk").unwrap(),
            )),
        )
        .unwrap();
        tree.create_zone("/z/n", "nested").unwrap();
        tree.create_file(
            "/z/n/b",
            Some(FileEncryptionInfo::new(
                kms.generate_encrypted_key("nested").unwrap(),
            )),
        )
        .unwrap();
        let namespace = Arc::new(Namespace::new(tree));

        let target = kms.roll_new_version("zk").unwrap();
        let handler = handler_for(&namespace, &kms, 10);
        submit_and_scan(&handler, zone_id, &target);

        let inner = handler.shared.inner.lock();
        let zst = inner.submissions.get(&zone_id).unwrap();
        // only /z/a batched; /z/n/b untouched
        assert_eq!(zst.len(), 1);
    }

    #[test]
    fn test_files_at_target_version_are_not_batched() {
        let (namespace, kms, zone_id) = build_zone(&["/z/a", "/z/b"]);
        // no roll: every file is already at the target version
        let target = kms.current_key_version("zk").unwrap();
        let handler = handler_for(&namespace, &kms, 10);

        submit_and_scan(&handler, zone_id, &target);

        let inner = handler.shared.inner.lock();
        let zst = inner.submissions.get(&zone_id).unwrap();
        // only the zero-file finalization task
        assert_eq!(zst.len(), 1);
        assert!(zst.is_submission_done());
        assert_eq!(kms.reencrypt_call_count(), 0);
    }

    #[test]
    fn test_resubmission_is_idempotent() {
        let (namespace, kms, zone_id) = build_zone(&["/z/a"]);
        let target = kms.roll_new_version("zk").unwrap();
        let handler = handler_for(&namespace, &kms, 10);

        handler.submit_zone(zone_id, &target).unwrap();
        handler.submit_zone(zone_id, &target).unwrap();
        assert_eq!(handler.list_status().len(), 1);
    }

    #[test]
    fn test_submit_rejects_non_zone_inode() {
        let (namespace, kms, _) = build_zone(&[]);
        let plain = namespace.write().mkdir("/plain").unwrap();
        let handler = handler_for(&namespace, &kms, 10);

        assert!(matches!(
            handler.submit_zone(plain, "zk@1"),
            Err(ReencryptError::Zone(ZoneError::NotZoneRoot(_)))
        ));
    }

    #[test]
    fn test_cancel_requires_active_zone() {
        let (namespace, kms, zone_id) = build_zone(&[]);
        let handler = handler_for(&namespace, &kms, 10);

        assert!(matches!(
            handler.cancel_zone(zone_id),
            Err(ReencryptError::Zone(ZoneError::NotUnderReencryption(_)))
        ));
    }

    #[test]
    fn test_canceled_zone_fails_readiness() {
        let (namespace, kms, zone_id) = build_zone(&["/z/a"]);
        let target = kms.roll_new_version("zk").unwrap();
        let handler = handler_for(&namespace, &kms, 10);

        handler.submit_zone(zone_id, &target).unwrap();
        handler.cancel_zone(zone_id).unwrap();

        assert!(matches!(
            handler.check_zone_ready(zone_id),
            Err(ReencryptError::Zone(ZoneError::Canceled(_)))
        ));
    }

    #[test]
    fn test_safe_mode_blocks_readiness() {
        let (namespace, kms, zone_id) = build_zone(&[]);
        let target = kms.roll_new_version("zk").unwrap();
        let handler = handler_for(&namespace, &kms, 10);
        handler.submit_zone(zone_id, &target).unwrap();

        namespace.set_safe_mode(true);
        let err = handler.check_zone_ready(zone_id).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_pause_after_nth_submission_flips_flag() {
        let (namespace, kms, zone_id) = build_zone(&["/z/a", "/z/b", "/z/c", "/z/d"]);
        let target = kms.roll_new_version("zk").unwrap();
        let handler = handler_for(&namespace, &kms, 2);
        handler.submit_zone(zone_id, &target).unwrap();
        handler.pause_after_nth_submission(2);

        let mut batch = ReencryptionBatch::new(2);
        batch.add(FileEdekInfo::new(
            99,
            "/z/a".into(),
            kms.generate_encrypted_key("zk").unwrap(),
        ));
        handler.submit_batch(zone_id, batch).unwrap();
        assert!(!handler.shared.inner.lock().should_pause);

        let mut batch = ReencryptionBatch::new(2);
        batch.add(FileEdekInfo::new(
            100,
            "/z/b".into(),
            kms.generate_encrypted_key("zk").unwrap(),
        ));
        handler.submit_batch(zone_id, batch).unwrap();
        assert!(handler.shared.inner.lock().should_pause);
    }

    #[test]
    fn test_restore_cursor_truncates_at_missing_ancestor() {
        let kms = Arc::new(LocalKeyProvider::new());
        kms.create_key("zk");
        let mut tree = FsTree::new();
        let zone_id = tree.create_zone("/z", "zk").unwrap();
        tree.mkdir("/z/d1").unwrap();
        tree.mkdir("/z/d1/d2").unwrap();
        let namespace = Arc::new(Namespace::new(tree));
        let handler = handler_for(&namespace, &kms, 10);
        let scanner = ZoneScanner::new(&handler, zone_id, "zk@1".into());

        // full path still resolves
        {
            let tree = handler.read_lock();
            let mut stack = Vec::new();
            let parent = scanner
                .restore_cursor(&tree, "/z/d1/d2/f", &mut stack)
                .unwrap();
            assert_eq!(tree.full_path(parent).unwrap(), "/z/d1/d2");
            assert_eq!(stack, vec![b"d1".to_vec(), b"d2".to_vec(), b"f".to_vec()]);
        }

        // middle component deleted: truncate at that depth
        namespace.write().delete("/z/d1/d2").unwrap();
        {
            let tree = handler.read_lock();
            let mut stack = Vec::new();
            let parent = scanner
                .restore_cursor(&tree, "/z/d1/d2/f", &mut stack)
                .unwrap();
            assert_eq!(tree.full_path(parent).unwrap(), "/z/d1");
            assert_eq!(stack, vec![b"d1".to_vec(), b"d2".to_vec()]);
        }
    }
}
