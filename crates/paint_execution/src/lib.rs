//! Paint worker pool.
//!
//! Jobs handed over by tiled textures travel through a bounded channel to a
//! fixed set of worker threads. A worker rasterizes the job, records the
//! hand-off in the texture pool and pushes the payload into the transfer
//! queue, blocking while the ring is full. Cancellation is cooperative: each
//! (painter, scale) pair carries an epoch, and jobs queued under an older
//! epoch are dropped before they are painted.

mod rasterizer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use render_protocol::PainterId;
use tiles::{PaintJob, PaintScheduler, TexturePoolManager, TransferQueue, TransferRequest};

pub use rasterizer::{CpuRasterizer, Rasterizer, SurfaceRasterizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaintExecutionConfig {
    pub worker_count: usize,
    pub job_queue_capacity: usize,
}

impl Default for PaintExecutionConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            job_queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PaintExecutionStartError {
    #[error("paint worker count must be non-zero")]
    ZeroWorkers,
    #[error("paint job queue capacity must be non-zero")]
    ZeroQueueCapacity,
    #[error("failed to spawn paint worker thread")]
    Spawn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PaintExecutionStats {
    pub scheduled: u64,
    pub rejected: u64,
    pub enqueued: u64,
    pub cancelled: u64,
    pub failed: u64,
}

impl PaintExecutionStats {
    /// Jobs accepted but not yet finished one way or another.
    pub fn outstanding(&self) -> u64 {
        self.scheduled
            .saturating_sub(self.enqueued + self.cancelled + self.failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CancelKey {
    painter: PainterId,
    scale_bits: u32,
}

impl CancelKey {
    fn new(painter: PainterId, scale: f32) -> Self {
        Self {
            painter,
            scale_bits: scale.to_bits(),
        }
    }
}

struct QueuedJob {
    job: PaintJob,
    epoch: u64,
}

#[derive(Debug, Default)]
struct Counters {
    scheduled: AtomicU64,
    rejected: AtomicU64,
    enqueued: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
}

struct Shared<R: Rasterizer> {
    rasterizer: R,
    pool: Arc<TexturePoolManager>,
    queue: Arc<TransferQueue<R::Surface>>,
    epochs: Mutex<HashMap<CancelKey, u64>>,
    stop_requested: AtomicBool,
    counters: Counters,
}

impl<R: Rasterizer> Shared<R> {
    fn epoch(&self, key: CancelKey) -> u64 {
        self.epochs
            .lock()
            .expect("paint cancel epochs lock poisoned")
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    fn fail(&self, job: &PaintJob) {
        self.pool
            .mark_paint_failed(job.target.texture, job.target.ticket);
    }
}

/// Worker threads executing [`PaintJob`]s. Dropping the pool stops and joins
/// the workers.
pub struct PaintWorkerPool<R: Rasterizer> {
    shared: Arc<Shared<R>>,
    sender: Option<Sender<QueuedJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl<R: Rasterizer> PaintWorkerPool<R> {
    pub fn start(
        config: PaintExecutionConfig,
        rasterizer: R,
        pool: Arc<TexturePoolManager>,
        queue: Arc<TransferQueue<R::Surface>>,
    ) -> Result<Self, PaintExecutionStartError> {
        if config.worker_count == 0 {
            return Err(PaintExecutionStartError::ZeroWorkers);
        }
        if config.job_queue_capacity == 0 {
            return Err(PaintExecutionStartError::ZeroQueueCapacity);
        }
        let (sender, receiver) = bounded(config.job_queue_capacity);
        let mut workers = Self {
            shared: Arc::new(Shared {
                rasterizer,
                pool,
                queue,
                epochs: Mutex::new(HashMap::new()),
                stop_requested: AtomicBool::new(false),
                counters: Counters::default(),
            }),
            sender: Some(sender),
            workers: Vec::with_capacity(config.worker_count),
        };
        for index in 0..config.worker_count {
            let shared = Arc::clone(&workers.shared);
            let receiver: Receiver<QueuedJob> = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("paint_worker_{index}"))
                .spawn(move || paint_worker_loop(shared, receiver))
                .map_err(|error| {
                    log::error!("paint worker {} failed to start: {}", index, error);
                    PaintExecutionStartError::Spawn
                })?;
            workers.workers.push(handle);
        }
        log::debug!("paint worker pool started with {} threads", config.worker_count);
        Ok(workers)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> PaintExecutionStats {
        let counters = &self.shared.counters;
        PaintExecutionStats {
            scheduled: counters.scheduled.load(Ordering::Acquire),
            rejected: counters.rejected.load(Ordering::Acquire),
            enqueued: counters.enqueued.load(Ordering::Acquire),
            cancelled: counters.cancelled.load(Ordering::Acquire),
            failed: counters.failed.load(Ordering::Acquire),
        }
    }

    /// Stops accepting jobs, releases workers blocked on a full transfer ring
    /// and joins them. Queued jobs are returned to their tiles as failed.
    pub fn shutdown(&mut self) {
        if self.sender.is_none() {
            return;
        }
        self.shared.stop_requested.store(true, Ordering::Release);
        self.sender = None;
        self.shared.queue.set_pending_discard_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("paint worker panicked");
            }
        }
        log::debug!("paint worker pool stopped");
    }
}

impl<R: Rasterizer> PaintScheduler for PaintWorkerPool<R> {
    fn schedule(&self, job: PaintJob) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        let epoch = self.shared.epoch(CancelKey::new(job.painter_id(), job.scale));
        let counters = &self.shared.counters;
        counters.scheduled.fetch_add(1, Ordering::AcqRel);
        let rejected = match sender.try_send(QueuedJob { job, epoch }) {
            Ok(()) => return true,
            Err(TrySendError::Full(queued)) => queued,
            Err(TrySendError::Disconnected(queued)) => queued,
        };
        log::trace!(
            "paint job queue full, tile ({}, {}) deferred",
            rejected.job.target.key.x,
            rejected.job.target.key.y
        );
        counters.scheduled.fetch_sub(1, Ordering::AcqRel);
        counters.rejected.fetch_add(1, Ordering::AcqRel);
        false
    }

    fn cancel(&self, painter: PainterId, scale: f32) {
        let mut epochs = self
            .shared
            .epochs
            .lock()
            .expect("paint cancel epochs lock poisoned");
        *epochs.entry(CancelKey::new(painter, scale)).or_insert(0) += 1;
    }
}

impl<R: Rasterizer> Drop for PaintWorkerPool<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn paint_worker_loop<R: Rasterizer>(shared: Arc<Shared<R>>, receiver: Receiver<QueuedJob>) {
    while let Ok(QueuedJob { job, epoch }) = receiver.recv() {
        let counters = &shared.counters;
        if shared.stop_requested.load(Ordering::Acquire)
            || shared.epoch(CancelKey::new(job.painter_id(), job.scale)) != epoch
        {
            shared.fail(&job);
            counters.cancelled.fetch_add(1, Ordering::AcqRel);
            continue;
        }
        let Some(payload) = shared.rasterizer.rasterize(&job) else {
            log::trace!(
                "painter failed tile ({}, {}) at scale {}",
                job.target.key.x,
                job.target.key.y,
                job.scale
            );
            shared.fail(&job);
            counters.failed.fetch_add(1, Ordering::AcqRel);
            continue;
        };
        if !shared
            .pool
            .mark_enqueued(job.target.texture, job.target.ticket)
        {
            // Superseded while painting; drain would drop it anyway.
            counters.cancelled.fetch_add(1, Ordering::AcqRel);
            continue;
        }
        let request = TransferRequest {
            target: job.target,
            payload,
            dirty_rect: job.dirty_rect(),
            backfill_from: job.backfill_from,
        };
        match shared.queue.try_enqueue(request) {
            Ok(()) => {
                counters.enqueued.fetch_add(1, Ordering::AcqRel);
            }
            Err(error) => {
                log::debug!(
                    "tile ({}, {}) not enqueued: {}",
                    job.target.key.x,
                    job.target.key.y,
                    error
                );
                shared.fail(&job);
                counters.failed.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
}
