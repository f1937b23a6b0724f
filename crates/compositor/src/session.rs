use std::sync::Arc;
use std::time::Instant;

use paint_execution::{PaintExecutionStats, PaintWorkerPool, Rasterizer};
use render_protocol::{
    ContentRect, DrawSink, IDENTITY_TRANSFORM, PainterId, TextureKind, TilePainter,
    TransformMatrix4x4,
};
use slotmap::SlotMap;
use tiles::{
    BackendError, DrainReport, DrawOutcome, DualTiledTexture, PainterRef, PaintScheduler,
    PrepareContext, TextureBackend, TextureCapacity, TexturePoolConfig, TexturePoolManager,
    TiledTexture, TransferQueue, plan_capacity,
};

use crate::config::{CompositorConfig, ConfigError};

slotmap::new_key_type! {
    pub struct SurfaceId;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompositorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    PaintExecution(#[from] paint_execution::PaintExecutionStartError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The GPU context was lost. Textures were dropped and the session was
    /// re-initialized; the next frame repaints from scratch.
    #[error("GPU context lost, textures will be repainted")]
    ContextLost,
    #[error("texture backend could not be re-initialized: {0}")]
    BackendUnavailable(BackendError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderMode {
    #[default]
    Accelerated,
    /// Uploads kept failing; surfaces are drawn as background fills.
    SoftwareFallback,
}

/// Where and how a surface is shown this frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceView {
    /// Visible content, in content units.
    pub area: ContentRect,
    pub scale: f32,
    pub transform: TransformMatrix4x4,
}

impl SurfaceView {
    pub fn new(area: ContentRect, scale: f32) -> Self {
        Self {
            area,
            scale,
            transform: IDENTITY_TRANSFORM,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameReport {
    pub frame: u64,
    pub mode: RenderMode,
    /// A base surface finished a zoom this frame.
    pub swapped: bool,
    pub needs_redraw: bool,
    pub drain: DrainReport,
    pub draw: DrawOutcome,
}

#[derive(Debug)]
enum SurfaceTextures {
    Base(DualTiledTexture),
    Layer(TiledTexture),
}

#[derive(Debug)]
struct Surface {
    painter: PainterId,
    view: Option<SurfaceView>,
    textures: SurfaceTextures,
}

impl Surface {
    fn kind(&self) -> TextureKind {
        match self.textures {
            SurfaceTextures::Base(_) => TextureKind::Base,
            SurfaceTextures::Layer(_) => TextureKind::Layer,
        }
    }

    fn is_ready(&self, pool: &TexturePoolManager) -> bool {
        match &self.textures {
            SurfaceTextures::Base(dual) => dual.is_ready(pool),
            SurfaceTextures::Layer(texture) => texture.is_ready(pool),
        }
    }

    fn is_zooming(&self) -> bool {
        matches!(&self.textures, SurfaceTextures::Base(dual) if dual.is_zooming())
    }

    fn scale(&self) -> Option<f32> {
        match &self.textures {
            SurfaceTextures::Base(dual) => dual.current_scale(),
            SurfaceTextures::Layer(texture) => texture.scale(),
        }
    }

    fn invalidate(&mut self, rect: ContentRect) {
        match &mut self.textures {
            SurfaceTextures::Base(dual) => dual.invalidate(rect),
            SurfaceTextures::Layer(texture) => texture.invalidate(rect),
        }
    }

    fn release(&mut self, pool: &TexturePoolManager, scheduler: &dyn PaintScheduler) {
        match &mut self.textures {
            SurfaceTextures::Base(dual) => {
                dual.cancel_paints(scheduler);
                dual.discard_textures(pool);
            }
            SurfaceTextures::Layer(texture) => {
                texture.cancel_paints(scheduler);
                texture.discard_textures(pool);
            }
        }
    }
}

/// One compositing session: the texture pool, the transfer queue, the
/// texture backend and the paint workers, plus every surface drawn with them.
///
/// [`Compositor::frame`] must be called on the thread owning the GPU context.
pub struct Compositor<B, R>
where
    B: TextureBackend,
    R: Rasterizer<Surface = B::Surface>,
{
    config: CompositorConfig,
    workers: PaintWorkerPool<R>,
    pool: Arc<TexturePoolManager>,
    queue: Arc<TransferQueue<B::Surface>>,
    backend: B,
    painters: SlotMap<PainterId, Arc<dyn TilePainter>>,
    surfaces: SlotMap<SurfaceId, Surface>,
    mode: RenderMode,
    failed_upload_frames: u32,
    context_losses: u32,
}

impl<B, R> Compositor<B, R>
where
    B: TextureBackend,
    R: Rasterizer<Surface = B::Surface>,
{
    /// The pool starts empty; call [`Compositor::set_viewport`] before the
    /// first frame.
    pub fn new(config: CompositorConfig, backend: B, rasterizer: R) -> Result<Self, CompositorError> {
        config.validate()?;
        let pool = Arc::new(TexturePoolManager::new(TexturePoolConfig::with_tier(
            config.device_tier(),
        )));
        let queue = Arc::new(TransferQueue::new(config.transfer_queue_size()));
        let workers = PaintWorkerPool::start(
            config.paint_execution(),
            rasterizer,
            Arc::clone(&pool),
            Arc::clone(&queue),
        )?;
        log::debug!(
            "compositor session created: tier {:?}, {} transfer slots",
            config.device_tier(),
            queue.capacity()
        );
        Ok(Self {
            config,
            workers,
            pool,
            queue,
            backend,
            painters: SlotMap::with_key(),
            surfaces: SlotMap::with_key(),
            mode: RenderMode::Accelerated,
            failed_upload_frames: 0,
            context_losses: 0,
        })
    }

    pub fn config(&self) -> &CompositorConfig {
        &self.config
    }

    pub fn pool(&self) -> &TexturePoolManager {
        &self.pool
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    pub fn context_losses(&self) -> u32 {
        self.context_losses
    }

    pub fn paint_stats(&self) -> PaintExecutionStats {
        self.workers.stats()
    }

    pub fn pending_uploads(&self) -> usize {
        self.queue.pending_count()
    }

    /// Re-plans pool capacity for a viewport of `width` × `height` device
    /// pixels. Returns the capacity actually applied.
    pub fn set_viewport(&mut self, width: u32, height: u32) -> TextureCapacity {
        let planned = plan_capacity(width, height, self.config.device_tier());
        self.pool.configure_capacity(planned)
    }

    pub fn register_painter(&mut self, painter: Arc<dyn TilePainter>) -> PainterId {
        self.painters.insert(painter)
    }

    /// Removes the painter and every surface it paints.
    pub fn unregister_painter(&mut self, painter: PainterId) -> bool {
        if self.painters.remove(painter).is_none() {
            return false;
        }
        let orphaned: Vec<SurfaceId> = self
            .surfaces
            .iter()
            .filter(|(_, surface)| surface.painter == painter)
            .map(|(id, _)| id)
            .collect();
        for id in orphaned {
            self.remove_surface(id);
        }
        true
    }

    /// Base surfaces zoom through a front/back pair; layer surfaces draw
    /// from the layer pool. `None` for an unknown painter.
    pub fn add_surface(&mut self, kind: TextureKind, painter: PainterId) -> Option<SurfaceId> {
        if !self.painters.contains_key(painter) {
            return None;
        }
        let textures = match kind {
            TextureKind::Base => SurfaceTextures::Base(DualTiledTexture::new(
                TextureKind::Base,
                self.config.zoom_debounce(),
            )),
            TextureKind::Layer => SurfaceTextures::Layer(TiledTexture::new(TextureKind::Layer)),
        };
        Some(self.surfaces.insert(Surface {
            painter,
            view: None,
            textures,
        }))
    }

    pub fn remove_surface(&mut self, id: SurfaceId) -> bool {
        let Some(mut surface) = self.surfaces.remove(id) else {
            return false;
        };
        surface.release(&self.pool, &self.workers);
        true
    }

    pub fn set_surface_view(&mut self, id: SurfaceId, view: SurfaceView) -> bool {
        let Some(surface) = self.surfaces.get_mut(id) else {
            return false;
        };
        surface.view = Some(view);
        true
    }

    pub fn invalidate_surface(&mut self, id: SurfaceId, rect: ContentRect) -> bool {
        let Some(surface) = self.surfaces.get_mut(id) else {
            return false;
        };
        surface.invalidate(rect);
        true
    }

    /// Invalidates `rect` on every surface painted by `painter`.
    pub fn invalidate_painter(&mut self, painter: PainterId, rect: ContentRect) {
        for surface in self.surfaces.values_mut() {
            if surface.painter == painter {
                surface.invalidate(rect);
            }
        }
    }

    pub fn surface_is_ready(&self, id: SurfaceId) -> bool {
        self.surfaces
            .get(id)
            .is_some_and(|surface| surface.is_ready(&self.pool))
    }

    /// Scale the surface is currently drawn at.
    pub fn surface_scale(&self, id: SurfaceId) -> Option<f32> {
        self.surfaces.get(id).and_then(Surface::scale)
    }

    /// Leaves software fallback and tries textures again.
    pub fn retry_accelerated(&mut self) {
        if self.mode == RenderMode::SoftwareFallback {
            log::info!("retrying accelerated compositing");
        }
        self.mode = RenderMode::Accelerated;
        self.failed_upload_frames = 0;
    }

    /// Runs one frame: gather, drain finished uploads, prepare every surface,
    /// then draw base surfaces followed by layers into `sink`.
    pub fn frame(&mut self, now: Instant, sink: &mut dyn DrawSink) -> Result<FrameReport, FrameError> {
        let frame = self.pool.begin_frame_gather();
        if self.backend.is_context_lost() {
            log::error!("GPU context lost before frame {}", frame);
            self.recover_context()?;
            return Err(FrameError::ContextLost);
        }
        let drain = match self.queue.drain_ready(&mut self.backend, &self.pool) {
            Ok(drain) => drain,
            Err(error) => {
                log::error!("frame {} aborted: {}", frame, error);
                self.recover_context()?;
                return Err(FrameError::ContextLost);
            }
        };
        let entered_fallback = self.track_upload_health(&drain);

        let mut report = FrameReport {
            frame,
            mode: self.mode,
            drain,
            ..FrameReport::default()
        };
        let ctx = PrepareContext {
            pool: &self.pool,
            scheduler: &self.workers,
            backfill: self.config.backfill_policy(),
            allow_paint: self.mode == RenderMode::Accelerated,
        };
        for surface in self.surfaces.values_mut() {
            let (Some(view), Some(painter)) = (surface.view, self.painters.get(surface.painter))
            else {
                continue;
            };
            let painter = PainterRef::new(surface.painter, Arc::clone(painter));
            match &mut surface.textures {
                SurfaceTextures::Base(dual) => {
                    report.swapped |= dual.prepare(&ctx, now, view.scale, view.area, &painter);
                }
                SurfaceTextures::Layer(texture) => {
                    texture.prepare(&ctx, view.scale, view.area, &painter);
                }
            }
        }

        for kind in TextureKind::ALL {
            for surface in self.surfaces.values_mut() {
                if surface.kind() != kind {
                    continue;
                }
                let (Some(view), Some(painter)) =
                    (surface.view, self.painters.get(surface.painter))
                else {
                    continue;
                };
                let opacity = painter.opacity();
                if self.mode == RenderMode::SoftwareFallback {
                    let filled = match &surface.textures {
                        SurfaceTextures::Base(dual) => {
                            dual.draw_background(sink, view.area, opacity)
                        }
                        SurfaceTextures::Layer(texture) => {
                            texture.draw_background(sink, view.area, opacity)
                        }
                    };
                    report.draw.filled += usize::from(filled);
                    continue;
                }
                let outcome = match &mut surface.textures {
                    SurfaceTextures::Base(dual) => {
                        dual.draw(&self.pool, sink, view.area, opacity, view.transform)
                    }
                    SurfaceTextures::Layer(texture) => {
                        texture.draw_all(&self.pool, sink, view.area, opacity, view.transform)
                    }
                };
                report.draw.merge(outcome);
            }
        }

        // Workers count a job as finished only after it is in the queue.
        report.needs_redraw = match self.mode {
            RenderMode::SoftwareFallback => entered_fallback,
            RenderMode::Accelerated => {
                report.swapped
                    || report.draw.needs_redraw()
                    || self.workers.stats().outstanding() > 0
                    || self.queue.pending_count() > 0
                    || self.surfaces.values().any(|surface| {
                        surface.view.is_some()
                            && (surface.is_zooming() || !surface.is_ready(&self.pool))
                    })
            }
        };
        if !report.drain.is_idle() || report.swapped {
            log::debug!(
                "frame {}: uploaded {} obsolete {} failed {} drawn {} missing {} starved {}",
                frame,
                report.drain.uploaded,
                report.drain.obsolete,
                report.drain.failed,
                report.draw.drawn,
                report.draw.missing,
                report.draw.starved
            );
        }
        Ok(report)
    }

    /// Counts frames whose uploads all failed. Returns true when this frame
    /// switched the session to software fallback.
    fn track_upload_health(&mut self, drain: &DrainReport) -> bool {
        if drain.uploaded > 0 {
            self.failed_upload_frames = 0;
            return false;
        }
        if drain.failed == 0 || self.mode == RenderMode::SoftwareFallback {
            return false;
        }
        self.failed_upload_frames += 1;
        if self.failed_upload_frames < self.config.max_consecutive_upload_failures {
            return false;
        }
        log::warn!(
            "{} consecutive frames without a successful upload, falling back to background fills",
            self.failed_upload_frames
        );
        self.mode = RenderMode::SoftwareFallback;
        for surface in self.surfaces.values_mut() {
            surface.release(&self.pool, &self.workers);
        }
        true
    }

    fn recover_context(&mut self) -> Result<(), FrameError> {
        self.context_losses += 1;
        self.queue.set_pending_discard_all();
        for surface in self.surfaces.values_mut() {
            surface.release(&self.pool, &self.workers);
        }
        self.pool.reset_all();
        self.backend.reinitialize().map_err(|error| {
            log::error!("texture backend re-initialization failed: {}", error);
            FrameError::BackendUnavailable(error)
        })?;
        let dropped = self.queue.reopen();
        log::warn!(
            "recovered from GPU context loss, {} pending uploads dropped",
            dropped
        );
        Ok(())
    }
}
