//! Fixed-size worker pool for KMS re-encryption calls
//!
//! Tasks land in an unbounded FIFO queue and are executed by a fixed number
//! of worker threads. No namespace lock is ever held inside a task; the KMS
//! call is the only blocking work. Completions are delivered on a channel in
//! completion order; per-zone submission order is recovered by the zone
//! trackers, not here.
//!
//! If the queue is unusable (pool shut down mid-submit), the task runs
//! synchronously on the caller so work is never silently dropped.

use crate::error::Result;
use crate::kms::{EncryptedKeyVersion, KmsClient};
use crate::namespace::inode::ZoneId;
use crate::reencrypt::batch::{ReencryptionBatch, ReencryptionTask};
use crate::reencrypt::tracker::{TaskHandle, TaskOutcome};
use crossbeam_channel::{unbounded, Receiver, Sender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

/// One queued unit of work: a batch plus its tracker handle
pub struct EdekTask {
    pub zone_id: ZoneId,
    pub batch: ReencryptionBatch,
    pub handle: TaskHandle,
}

impl EdekTask {
    /// Execute the task: contact the KMS (no namespace locks held), fill
    /// the handle's outcome, and return the zone id for the completion
    /// stream.
    ///
    /// An empty batch produces a zero-file result immediately; this is how
    /// zones with nothing to re-encrypt reach the updater and finalize. A
    /// KMS failure still produces a result (with `num_failures` set to the
    /// batch size) so progress advances past the batch.
    pub fn run(mut self, kms: &dyn KmsClient) -> ZoneId {
        let zone_id = self.zone_id;
        if self.handle.is_canceled() {
            debug!(zone = zone_id, size = self.batch.len(), "skipping canceled batch");
            let records = self.batch.len() as u64;
            self.handle
                .complete(TaskOutcome::Canceled { zone_id, records });
            return zone_id;
        }

        if self.batch.is_empty() {
            self.handle.complete(TaskOutcome::Completed(ReencryptionTask {
                zone_id,
                num_failures: 0,
                batch: self.batch,
            }));
            return zone_id;
        }

        info!(
            zone = zone_id,
            size = self.batch.len(),
            start = self.batch.first_file_path(),
            "processing batched re-encryption"
        );
        let kms_timer = Instant::now();

        let mut edeks: Vec<EncryptedKeyVersion> = self
            .batch
            .records()
            .iter()
            .map(|r| r.existing_edek.clone())
            .collect();

        // The KMS client carries its own retries; a failure here fails the
        // whole batch.
        let num_failures = match kms.reencrypt_encrypted_keys(&mut edeks) {
            Ok(()) => {
                for (record, new_edek) in self.batch.records_mut().iter_mut().zip(edeks) {
                    record.new_edek = Some(new_edek);
                }
                0
            }
            Err(e) => {
                warn!(
                    zone = zone_id,
                    size = self.batch.len(),
                    start = self.batch.first_file_path(),
                    error = %e,
                    "failed to re-encrypt one batch of edeks"
                );
                self.batch.len() as u64
            }
        };

        info!(
            zone = zone_id,
            size = self.batch.len(),
            failures = num_failures,
            elapsed_ms = kms_timer.elapsed().as_millis() as u64,
            "finished re-encrypting one batch of edeks"
        );

        self.handle.complete(TaskOutcome::Completed(ReencryptionTask {
            zone_id,
            num_failures,
            batch: self.batch,
        }));
        zone_id
    }
}

/// Fixed-size pool executing [`EdekTask`]s
pub struct EdekWorkerPool {
    task_tx: Option<Sender<EdekTask>>,
    completion_tx: Option<Sender<ZoneId>>,
    kms: Arc<dyn KmsClient>,
    workers: Vec<JoinHandle<()>>,
}

impl EdekWorkerPool {
    /// Spawn `size` workers. Returns the pool and the completion stream the
    /// updater consumes.
    pub fn new(size: usize, kms: Arc<dyn KmsClient>) -> Result<(Self, Receiver<ZoneId>)> {
        let (task_tx, task_rx) = unbounded::<EdekTask>();
        let (completion_tx, completion_rx) = unbounded::<ZoneId>();

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let task_rx = task_rx.clone();
            let completion_tx = completion_tx.clone();
            let kms = Arc::clone(&kms);
            let handle = thread::Builder::new()
                .name(format!("edek-rewrap-{}", id))
                .spawn(move || worker_loop(task_rx, completion_tx, kms))?;
            workers.push(handle);
        }

        let pool = Self {
            task_tx: Some(task_tx),
            completion_tx: Some(completion_tx),
            kms,
            workers,
        };
        Ok((pool, completion_rx))
    }

    /// Enqueue a task. Falls back to running it on the caller if the queue
    /// is unusable, so submission never loses work.
    pub fn submit(&self, task: EdekTask) {
        let task = match &self.task_tx {
            Some(tx) => match tx.try_send(task) {
                Ok(()) => return,
                Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => task,
            },
            None => task,
        };
        warn!(zone = task.zone_id, "worker pool rejected batch, running on caller");
        let zone_id = task.run(self.kms.as_ref());
        if let Some(tx) = &self.completion_tx {
            let _ = tx.send(zone_id);
        }
    }

    /// Tasks currently queued (not yet picked up by a worker)
    pub fn queued_tasks(&self) -> usize {
        self.task_tx.as_ref().map(|tx| tx.len()).unwrap_or(0)
    }

    /// Stop accepting work, drain the queue, and join the workers. The
    /// completion stream disconnects once every in-flight task has been
    /// delivered.
    pub fn shutdown(&mut self) {
        self.task_tx.take();
        let workers = std::mem::take(&mut self.workers);
        for worker in workers {
            if worker.join().is_err() {
                warn!("edek worker panicked during shutdown");
            }
        }
        self.completion_tx.take();
    }
}

impl Drop for EdekWorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    task_rx: Receiver<EdekTask>,
    completion_tx: Sender<ZoneId>,
    kms: Arc<dyn KmsClient>,
) {
    while let Ok(task) = task_rx.recv() {
        let zone_id = task.run(kms.as_ref());
        if completion_tx.send(zone_id).is_err() {
            // updater is gone; keep draining so canceled handles resolve
            debug!("completion stream closed, discarding completion");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::LocalKeyProvider;
    use crate::reencrypt::batch::FileEdekInfo;
    use std::time::Duration;

    fn provider_with_key() -> Arc<LocalKeyProvider> {
        let kms = Arc::new(LocalKeyProvider::new());
        kms.create_key("zk");
        kms
    }

    fn batch_of(kms: &LocalKeyProvider, n: usize) -> ReencryptionBatch {
        let mut batch = ReencryptionBatch::new(n);
        for i in 0..n {
            batch.add(FileEdekInfo::new(
                i as u64 + 10,
                format!("/z/f{}", i),
                kms.generate_encrypted_key("zk").unwrap(),
            ));
        }
        batch
    }

    #[test]
    fn test_pool_runs_task_and_reports_completion() {
        let kms = provider_with_key();
        let batch = batch_of(&kms, 3);
        kms.roll_new_version("zk").unwrap();

        let (pool, completions) = EdekWorkerPool::new(2, kms.clone()).unwrap();
        let handle = TaskHandle::new();
        pool.submit(EdekTask {
            zone_id: 7,
            batch,
            handle: handle.clone(),
        });

        let zone = completions.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(zone, 7);
        match handle.take_outcome().unwrap() {
            TaskOutcome::Completed(task) => {
                assert_eq!(task.num_failures, 0);
                for record in task.batch.records() {
                    assert_eq!(record.new_edek.as_ref().unwrap().version_name, "zk@1");
                }
            }
            TaskOutcome::Canceled { .. } => panic!("task was not canceled"),
        }
    }

    #[test]
    fn test_empty_batch_completes_with_zero_files() {
        let kms = provider_with_key();
        let (pool, completions) = EdekWorkerPool::new(1, kms.clone()).unwrap();
        let handle = TaskHandle::new();
        pool.submit(EdekTask {
            zone_id: 3,
            batch: ReencryptionBatch::empty(),
            handle: handle.clone(),
        });

        completions.recv_timeout(Duration::from_secs(5)).unwrap();
        match handle.take_outcome().unwrap() {
            TaskOutcome::Completed(task) => {
                assert_eq!(task.num_failures, 0);
                assert!(task.batch.is_empty());
            }
            TaskOutcome::Canceled { .. } => panic!("task was not canceled"),
        }
        assert_eq!(kms.reencrypt_call_count(), 0);
    }

    #[test]
    fn test_kms_failure_fails_whole_batch() {
        let kms = provider_with_key();
        let batch = batch_of(&kms, 5);
        kms.fail_every_nth_call(1);

        let (pool, completions) = EdekWorkerPool::new(1, kms.clone()).unwrap();
        let handle = TaskHandle::new();
        pool.submit(EdekTask {
            zone_id: 1,
            batch,
            handle: handle.clone(),
        });

        completions.recv_timeout(Duration::from_secs(5)).unwrap();
        match handle.take_outcome().unwrap() {
            TaskOutcome::Completed(task) => {
                assert_eq!(task.num_failures, 5);
                assert!(task.batch.records().iter().all(|r| r.new_edek.is_none()));
            }
            TaskOutcome::Canceled { .. } => panic!("task was not canceled"),
        }
    }

    #[test]
    fn test_canceled_task_skips_kms() {
        let kms = provider_with_key();
        let batch = batch_of(&kms, 2);

        let (pool, completions) = EdekWorkerPool::new(1, kms.clone()).unwrap();
        let handle = TaskHandle::new();
        handle.cancel();
        pool.submit(EdekTask {
            zone_id: 9,
            batch,
            handle: handle.clone(),
        });

        completions.recv_timeout(Duration::from_secs(5)).unwrap();
        match handle.take_outcome().unwrap() {
            TaskOutcome::Canceled { zone_id, records } => {
                assert_eq!(zone_id, 9);
                assert_eq!(records, 2);
            }
            TaskOutcome::Completed(_) => panic!("canceled task must not complete"),
        }
        assert_eq!(kms.reencrypt_call_count(), 0);
    }

    #[test]
    fn test_caller_runs_after_shutdown() {
        let kms = provider_with_key();
        let batch = batch_of(&kms, 1);
        kms.roll_new_version("zk").unwrap();

        let (mut pool, _completions) = EdekWorkerPool::new(1, kms.clone()).unwrap();
        pool.shutdown();

        let handle = TaskHandle::new();
        pool.submit(EdekTask {
            zone_id: 4,
            batch,
            handle: handle.clone(),
        });
        // ran synchronously on this thread
        assert!(handle.is_done());
    }
}
