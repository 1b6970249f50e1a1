//! Single-consumer job queue
//!
//! Backups must never overlap: they quiesce the same host and write into the
//! same backup root. [`BackupQueue`] owns one worker thread that runs jobs
//! strictly one at a time in submission order. Every job's result is logged
//! on failure and handed back through its [`JobHandle`].

use crate::backup::{BackupJob, BackupOutcome};
use crate::error::{ArchiveError, Result};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};
use uuid::Uuid;

type Task = Box<dyn FnOnce() + Send>;

/// Result of a queued job, delivered once it has run
#[derive(Debug)]
pub struct JobHandle<T> {
    id: Uuid,
    rx: Receiver<Result<T>>,
}

impl<T> JobHandle<T> {
    /// Job identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Block until the job has run and return its result
    ///
    /// # Errors
    ///
    /// Returns the job's own error, or [`ArchiveError::Execution`] if the
    /// queue shut down before the job ran.
    pub fn wait(self) -> Result<T> {
        self.rx
            .recv()
            .map_err(|_| ArchiveError::execution(format!("job {} was dropped before it ran", self.id)))?
    }

    /// Return the result if the job has already run
    pub fn try_result(&self) -> Option<Result<T>> {
        self.rx.try_recv().ok()
    }
}

/// Runs jobs one at a time on a dedicated thread
pub struct BackupQueue {
    sender: Mutex<Option<Sender<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl BackupQueue {
    /// Start the worker thread
    pub fn new() -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Task>();
        let worker = thread::Builder::new()
            .name("backup-queue".to_string())
            .spawn(move || {
                for task in receiver {
                    task();
                }
                debug!("Backup queue worker exiting");
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Queue a backup job
    pub fn submit(&self, job: BackupJob) -> Result<JobHandle<BackupOutcome>> {
        let id = job.context().id();
        self.enqueue(id, "Backup", move || job.run())
    }

    /// Queue arbitrary work behind the backups already waiting
    pub fn execute<T, F>(&self, name: &'static str, work: F) -> Result<JobHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.enqueue(Uuid::new_v4(), name, work)
    }

    fn enqueue<T, F>(&self, id: Uuid, name: &'static str, work: F) -> Result<JobHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let pending = Arc::clone(&self.pending);

        let task: Task = Box::new(move || {
            debug!(job = %id, "{} job started", name);
            let result = panic::catch_unwind(AssertUnwindSafe(work))
                .unwrap_or_else(|_| Err(ArchiveError::execution(format!("{} job {} panicked", name, id))));

            match &result {
                Ok(_) => info!(job = %id, "{} job finished", name),
                Err(e) => error!(job = %id, "{} job failed: {}", name, e),
            }
            pending.fetch_sub(1, Ordering::SeqCst);
            // The submitter may have dropped its handle
            let _ = tx.send(result);
        });

        let guard = self.sender.lock();
        let sender = guard
            .as_ref()
            .ok_or_else(|| ArchiveError::execution("backup queue is shut down"))?;

        self.pending.fetch_add(1, Ordering::SeqCst);
        if sender.send(task).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(ArchiveError::execution("backup queue worker is gone"));
        }
        debug!(job = %id, "{} job queued", name);
        Ok(JobHandle { id, rx })
    }

    /// Jobs submitted but not finished yet
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Whether the queue stopped accepting jobs
    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stop accepting jobs, run everything already queued and join the worker
    pub fn shutdown(&self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("Backup queue worker panicked");
            }
        }
    }
}

impl Drop for BackupQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
