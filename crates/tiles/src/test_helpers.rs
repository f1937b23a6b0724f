//! Deterministic collaborators for tests of the tile pipeline and its users.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use render_protocol::{
    Color, ContentRect, DrawSink, PainterId, PixelBuffer, TexturedQuad, TilePainter,
};
use slotmap::SlotMap;

use crate::pool::{TexturePoolConfig, TexturePoolManager};
use crate::tier::{DeviceTier, TextureCapacity};
use crate::tiled_texture::{PaintJob, PaintScheduler};
use crate::transfer::{TransferQueue, TransferRequest, UploadPayload};

/// `count` distinct painter ids.
pub fn painter_ids(count: usize) -> Vec<PainterId> {
    let mut painters = SlotMap::<PainterId, ()>::with_key();
    (0..count).map(|_| painters.insert(())).collect()
}

pub fn test_pool(base: u32, layer: u32) -> TexturePoolManager {
    TexturePoolManager::with_capacity(
        TexturePoolConfig::with_tier(DeviceTier::High),
        TextureCapacity::new(base, layer),
    )
}

/// Fills every tile with one color.
#[derive(Debug)]
pub struct SolidPainter {
    color: Color,
    background: Option<Color>,
    opacity: f32,
    fail: AtomicBool,
    paints: AtomicUsize,
}

impl SolidPainter {
    pub fn new(color: Color) -> Self {
        Self {
            color,
            background: None,
            opacity: 1.0,
            fail: AtomicBool::new(false),
            paints: AtomicUsize::new(0),
        }
    }

    pub fn with_background(mut self, background: Color) -> Self {
        self.background = Some(background);
        self
    }

    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity;
        self
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    pub fn paint_count(&self) -> usize {
        self.paints.load(Ordering::Relaxed)
    }
}

impl TilePainter for SolidPainter {
    fn paint(&self, target: &mut PixelBuffer, _content_rect: ContentRect, _scale: f32) -> bool {
        self.paints.fetch_add(1, Ordering::Relaxed);
        if self.fail.load(Ordering::Relaxed) {
            return false;
        }
        target.fill(self.color);
        true
    }

    fn opacity(&self) -> f32 {
        self.opacity
    }

    fn background_color(&self) -> Option<Color> {
        self.background
    }
}

/// Collects jobs instead of running them.
#[derive(Debug)]
pub struct RecordingScheduler {
    jobs: Mutex<Vec<PaintJob>>,
    cancelled: Mutex<Vec<(PainterId, f32)>>,
    accepting: AtomicBool,
}

impl Default for RecordingScheduler {
    fn default() -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
        }
    }
}

impl RecordingScheduler {
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Relaxed);
    }

    pub fn take_jobs(&self) -> Vec<PaintJob> {
        std::mem::take(&mut *self.jobs.lock().expect("recorded jobs lock poisoned"))
    }

    pub fn cancelled(&self) -> Vec<(PainterId, f32)> {
        self.cancelled
            .lock()
            .expect("recorded cancels lock poisoned")
            .clone()
    }
}

impl PaintScheduler for RecordingScheduler {
    fn schedule(&self, job: PaintJob) -> bool {
        if !self.accepting.load(Ordering::Relaxed) {
            return false;
        }
        self.jobs
            .lock()
            .expect("recorded jobs lock poisoned")
            .push(job);
        true
    }

    fn cancel(&self, painter: PainterId, scale: f32) {
        self.cancelled
            .lock()
            .expect("recorded cancels lock poisoned")
            .push((painter, scale));
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    pub quads: Vec<TexturedQuad>,
    pub fills: Vec<(ContentRect, Color, f32)>,
}

impl DrawSink for RecordingSink {
    fn draw_textured_quad(&mut self, quad: TexturedQuad) {
        self.quads.push(quad);
    }

    fn fill_background(&mut self, rect: ContentRect, color: Color, opacity: f32) {
        self.fills.push((rect, color, opacity));
    }
}

/// Marks jobs as uploaded without a backend.
pub fn complete_jobs(pool: &TexturePoolManager, jobs: Vec<PaintJob>) {
    for job in jobs {
        pool.mark_enqueued(job.target.texture, job.target.ticket);
        pool.complete_upload(&job.target);
    }
}

/// Rasterizes jobs on the calling thread and pushes the results into `queue`.
pub fn run_jobs_inline<S>(pool: &TexturePoolManager, queue: &TransferQueue<S>, jobs: Vec<PaintJob>) {
    for job in jobs {
        let Some(pixels) = job.rasterize() else {
            pool.mark_paint_failed(job.target.texture, job.target.ticket);
            continue;
        };
        if !pool.mark_enqueued(job.target.texture, job.target.ticket) {
            continue;
        }
        let request = TransferRequest {
            target: job.target,
            payload: UploadPayload::Cpu(pixels),
            dirty_rect: job.dirty_rect(),
            backfill_from: job.backfill_from,
        };
        if queue.try_enqueue(request).is_err() {
            pool.mark_paint_failed(job.target.texture, job.target.ticket);
        }
    }
}
