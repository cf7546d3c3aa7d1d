//! Background embedding generation.
//!
//! A priority queue of photos waiting for embeddings, drained by a small
//! fixed pool of workers. Failures retry with jittered backoff up to a
//! cap, then land in a terminal failed list for manual retry. Cancellation
//! is cooperative: in-flight tasks finish, queued ones stay queued.
//!
//! Only terminal history is persisted (`queue.json`: the completed counter
//! and the failed list), so stats and `retry_failed` survive a restart.
//! The pending set is never restored from disk. After a crash,
//! [`VectorPipeline::recover`] rebuilds it from the photo store by asking
//! which photos lack an up-to-date embedding for the current model.

use std::collections::{BinaryHeap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::photos::PhotoStore;
use crate::semantic::SemanticService;
use crate::storage::{BackendLocal, StorageManager};

const RETRY_BACKOFF_MS: u64 = 25;
const JOURNAL_FILE: &str = "queue.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// One unit of work: generate and index an embedding for a photo.
#[derive(Debug, Clone)]
pub struct VectorTask {
    pub photo_id: u64,
    pub path: String,
    pub priority: Priority,
}

impl VectorTask {
    pub fn new(photo_id: u64, path: impl Into<String>, priority: Priority) -> VectorTask {
        VectorTask {
            photo_id,
            path: path.into(),
            priority,
        }
    }
}

/// A task that exhausted its retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedTask {
    pub photo_id: u64,
    pub path: String,
    pub attempts: u32,
    pub error: String,
}

/// On-disk terminal history. Pending tasks are deliberately absent;
/// recovery re-derives them from the photo store.
#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueJournal {
    completed: u64,
    #[serde(default)]
    failed: Vec<FailedTask>,
}

/// Point-in-time queue counters, for polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: u64,
    pub failed: usize,
}

struct QueueEntry {
    task: VectorTask,
    /// Failed tries so far.
    attempts: u32,
    seq: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.task.priority == other.task.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Highest priority first, FIFO within a priority
        self.task
            .priority
            .cmp(&other.task.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Inner {
    pending: BinaryHeap<QueueEntry>,
    /// Photo ids currently pending or processing, to drop duplicate
    /// enqueues.
    queued_ids: HashSet<u64>,
    processing: usize,
    completed: u64,
    failed: Vec<FailedTask>,
    seq: u64,
}

pub struct VectorPipeline {
    service: Arc<SemanticService>,
    photos: Arc<dyn PhotoStore>,
    inner: Mutex<Inner>,
    work_ready: Condvar,
    cancelled: AtomicBool,
    max_concurrent: usize,
    max_retries: u32,
    journal: Option<BackendLocal>,
}

impl VectorPipeline {
    pub fn new(
        service: Arc<SemanticService>,
        photos: Arc<dyn PhotoStore>,
        base_path: impl AsRef<Path>,
        config: &PipelineConfig,
    ) -> VectorPipeline {
        let journal = match BackendLocal::new(base_path.as_ref()) {
            Ok(backend) => Some(backend),
            Err(err) => {
                log::warn!("Queue journal unavailable, history will not persist: {err}");
                None
            }
        };

        let mut inner = Inner::default();
        if let Some(dump) = journal.as_ref().and_then(read_journal) {
            log::debug!(
                "Restored queue history: {} completed, {} failed",
                dump.completed,
                dump.failed.len()
            );
            inner.completed = dump.completed;
            inner.failed = dump.failed;
        }

        VectorPipeline {
            service,
            photos,
            inner: Mutex::new(inner),
            work_ready: Condvar::new(),
            cancelled: AtomicBool::new(false),
            max_concurrent: (config.max_concurrent as usize).max(1),
            max_retries: config.max_retries as u32,
            journal,
        }
    }

    /// Queue one photo. Returns false when it is already queued.
    pub fn enqueue(&self, photo_id: u64, path: impl Into<String>, priority: Priority) -> bool {
        self.enqueue_task(VectorTask::new(photo_id, path, priority))
    }

    /// Queue a batch, skipping photos already queued. Returns the number
    /// actually added.
    pub fn enqueue_batch<I>(&self, tasks: I) -> usize
    where
        I: IntoIterator<Item = VectorTask>,
    {
        tasks
            .into_iter()
            .filter(|task| self.enqueue_task(task.clone()))
            .count()
    }

    fn enqueue_task(&self, task: VectorTask) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.queued_ids.insert(task.photo_id) {
            return false;
        }
        let seq = inner.seq;
        inner.seq += 1;
        inner.pending.push(QueueEntry {
            task,
            attempts: 0,
            seq,
        });
        self.work_ready.notify_one();
        true
    }

    /// Queue every photo missing a current embedding. This is the crash
    /// recovery path: the queue is rebuilt from the stores instead of a
    /// journal. Terminally failed photos stay out until
    /// [`retry_failed`](Self::retry_failed) clears them.
    pub fn recover(&self) -> anyhow::Result<usize> {
        let model_id = self.service.model_id()?;
        let photos = self.photos.unprocessed(&model_id)?;
        let failed: HashSet<u64> = {
            let inner = self.inner.lock().unwrap();
            inner.failed.iter().map(|f| f.photo_id).collect()
        };
        // Backfill runs below interactive adds and retries
        let tasks: Vec<VectorTask> = photos
            .iter()
            .filter(|p| !failed.contains(&p.id))
            .map(|p| VectorTask::new(p.id, &p.path, Priority::Low))
            .collect();

        let queued = self.enqueue_batch(tasks);
        if queued > 0 {
            log::info!("Recovered {queued} photos without embeddings");
        }
        Ok(queued)
    }

    /// Drain the queue with the configured number of workers, blocking
    /// until it is empty or [`cancel`](Self::cancel) is called.
    pub fn process(&self) -> QueueStats {
        log::info!("Draining embedding queue with {} workers", self.max_concurrent);
        thread::scope(|scope| {
            for _ in 0..self.max_concurrent {
                scope.spawn(|| self.worker_loop());
            }
        });

        let stats = self.stats();
        if stats.completed > 0 {
            if let Err(err) = self.service.save_index() {
                log::error!("Failed to persist vector index: {err}");
            }
        }
        log::info!(
            "Queue drained: {} completed, {} failed, {} still pending",
            stats.completed,
            stats.failed,
            stats.pending
        );
        stats
    }

    /// Ask workers to stop between tasks. In-flight tasks run to
    /// completion; pending ones stay in the queue.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.work_ready.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().unwrap();
        QueueStats {
            pending: inner.pending.len(),
            processing: inner.processing,
            completed: inner.completed,
            failed: inner.failed.len(),
        }
    }

    /// Tasks that exhausted their retries.
    pub fn failures(&self) -> Vec<FailedTask> {
        self.inner.lock().unwrap().failed.clone()
    }

    /// Put every terminally failed task back in the queue with a fresh
    /// retry budget. Returns the number requeued.
    pub fn retry_failed(&self) -> usize {
        let failed = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.failed)
        };
        let count = failed.len();
        for task in failed {
            self.enqueue(task.photo_id, task.path, Priority::Normal);
        }
        if count > 0 {
            self.persist_history();
        }
        count
    }

    /// Dump terminal history to `queue.json`. Best effort: failures are
    /// logged and absorbed.
    fn persist_history(&self) {
        let Some(backend) = &self.journal else { return };
        let dump = {
            let inner = self.inner.lock().unwrap();
            QueueJournal {
                completed: inner.completed,
                failed: inner.failed.clone(),
            }
        };
        match serde_json::to_string_pretty(&dump) {
            Ok(json) => {
                if let Err(err) = backend.write(JOURNAL_FILE, json.as_bytes()) {
                    log::error!("Failed to write queue journal: {err}");
                }
            }
            Err(err) => log::error!("Failed to serialize queue journal: {err}"),
        }
    }

    fn worker_loop(&self) {
        loop {
            let entry = {
                let mut inner = self.inner.lock().unwrap();
                loop {
                    if self.is_cancelled() {
                        return;
                    }
                    if let Some(entry) = inner.pending.pop() {
                        inner.processing += 1;
                        break entry;
                    }
                    if inner.processing == 0 {
                        // Nothing queued and nobody can queue more
                        return;
                    }
                    inner = self.work_ready.wait(inner).unwrap();
                }
            };

            let result = self.run_task(&entry.task);

            let mut inner = self.inner.lock().unwrap();
            inner.processing -= 1;
            match result {
                Ok(()) => {
                    inner.completed += 1;
                    inner.queued_ids.remove(&entry.task.photo_id);
                }
                Err(err) if entry.attempts >= self.max_retries => {
                    log::error!(
                        "Giving up on photo {} after {} attempts: {err}",
                        entry.task.photo_id,
                        entry.attempts + 1
                    );
                    // Keep one terminal entry per photo
                    inner.failed.retain(|f| f.photo_id != entry.task.photo_id);
                    inner.failed.push(FailedTask {
                        photo_id: entry.task.photo_id,
                        path: entry.task.path.clone(),
                        attempts: entry.attempts + 1,
                        error: err.to_string(),
                    });
                    inner.queued_ids.remove(&entry.task.photo_id);
                }
                Err(err) => {
                    log::warn!(
                        "Embedding photo {} failed (attempt {}): {err}",
                        entry.task.photo_id,
                        entry.attempts + 1
                    );
                    drop(inner);
                    backoff(entry.attempts);

                    let mut inner = self.inner.lock().unwrap();
                    let seq = inner.seq;
                    inner.seq += 1;
                    inner.pending.push(QueueEntry {
                        task: entry.task,
                        attempts: entry.attempts + 1,
                        seq,
                    });
                    self.work_ready.notify_all();
                    continue;
                }
            }
            drop(inner);
            self.persist_history();
            // Wake waiters so they can re-check for drain
            self.work_ready.notify_all();
        }
    }

    fn run_task(&self, task: &VectorTask) -> anyhow::Result<()> {
        let Some(photo) = self.photos.get(task.photo_id)? else {
            // Deleted while queued; nothing to embed
            log::warn!("Photo {} vanished before embedding, skipping", task.photo_id);
            return Ok(());
        };

        // Caption text when available, pixels otherwise. Text-only
        // providers reject the image path and the task fails over to
        // the retry ladder.
        let embedding = match photo.caption() {
            Some(caption) => self.service.embed_text(&caption)?,
            None => self.service.embed_image(Path::new(&task.path))?,
        };

        if embedding.is_empty() {
            return Err(anyhow!("provider returned an empty embedding"));
        }

        self.service
            .insert_embedding(photo.id, photo.caption_hash(), embedding)?;
        log::debug!("Embedded photo {}", photo.id);
        Ok(())
    }
}

fn backoff(prior_failures: u32) {
    let base = RETRY_BACKOFF_MS * (prior_failures as u64 + 1);
    let jitter = rand::rng().random_range(0..RETRY_BACKOFF_MS);
    thread::sleep(Duration::from_millis(base + jitter));
}

fn read_journal(backend: &BackendLocal) -> Option<QueueJournal> {
    if !backend.exists(JOURNAL_FILE) {
        return None;
    }
    let data = match backend.read(JOURNAL_FILE) {
        Ok(data) => data,
        Err(err) => {
            log::warn!("Failed to read queue journal: {err}");
            return None;
        }
    };
    match serde_json::from_slice(&data) {
        Ok(dump) => Some(dump),
        Err(err) => {
            log::warn!("Ignoring malformed queue journal: {err}");
            None
        }
    }
}
