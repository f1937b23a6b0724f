use std::fmt;
use std::sync::Arc;

use render_protocol::{
    ContentRect, DrawSink, PainterId, PixelBuffer, PixelRect, TextureKind, TilePainter,
    TileGridRect, TransformMatrix4x4, multiply_transform, translate_scale_transform,
};

use crate::grid::{TileGrid, compute_coverage, dirty_pixels, region_content_rect, tile_content_rect};
use crate::pool::{TextureHandle, TexturePoolManager};
use crate::tile::{BackfillPolicy, TileRecord};
use crate::transfer::TransferTarget;

/// A content source together with the id its tiles are keyed by.
#[derive(Clone)]
pub struct PainterRef {
    id: PainterId,
    painter: Arc<dyn TilePainter>,
}

impl fmt::Debug for PainterRef {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("PainterRef")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl PainterRef {
    pub fn new(id: PainterId, painter: Arc<dyn TilePainter>) -> Self {
        Self { id, painter }
    }

    pub fn id(&self) -> PainterId {
        self.id
    }

    pub fn painter(&self) -> &Arc<dyn TilePainter> {
        &self.painter
    }
}

/// One unit of paint work handed to a [`PaintScheduler`].
#[derive(Debug, Clone)]
pub struct PaintJob {
    pub target: TransferTarget,
    pub painter: PainterRef,
    pub scale: f32,
    /// Tile-local pixels to produce; the payload has exactly this size.
    pub region: PixelRect,
    pub content_rect: ContentRect,
    pub backfill_from: Option<TextureHandle>,
    pub partial: bool,
}

impl PaintJob {
    pub fn painter_id(&self) -> PainterId {
        self.painter.id
    }

    /// Paints the job's region into a fresh buffer, background first.
    pub fn rasterize(&self) -> Option<PixelBuffer> {
        let mut buffer = PixelBuffer::new(self.region.width, self.region.height);
        if let Some(background) = self.painter.painter.background_color() {
            buffer.fill(background);
        }
        self.painter
            .painter
            .paint(&mut buffer, self.content_rect, self.scale)
            .then_some(buffer)
    }

    /// Sub-rectangle to upload, `None` for a whole-tile upload.
    pub fn dirty_rect(&self) -> Option<PixelRect> {
        self.partial.then_some(self.region)
    }
}

/// Accepts paint jobs for execution off the GPU thread.
pub trait PaintScheduler {
    /// Returns false when the job was not accepted; the caller retries later.
    fn schedule(&self, job: PaintJob) -> bool;

    /// Cooperative cancel of jobs not yet started for `painter` at `scale`.
    fn cancel(&self, painter: PainterId, scale: f32);
}

/// Per-frame services a tiled texture needs to prepare.
#[derive(Clone, Copy)]
pub struct PrepareContext<'a> {
    pub pool: &'a TexturePoolManager,
    pub scheduler: &'a dyn PaintScheduler,
    pub backfill: BackfillPolicy,
    /// False while the session draws without textures.
    pub allow_paint: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrawOutcome {
    pub swapped: usize,
    pub drawn: usize,
    /// Visible tiles waiting for content that is on its way.
    pub missing: usize,
    /// Visible tiles left without a texture by an exhausted pool.
    pub starved: usize,
    pub filled: usize,
}

impl DrawOutcome {
    /// A visible tile lacked a texture or content changed this frame.
    pub fn needs_redraw(&self) -> bool {
        self.missing > 0 || self.swapped > 0
    }

    pub fn merge(&mut self, other: DrawOutcome) {
        self.swapped += other.swapped;
        self.drawn += other.drawn;
        self.missing += other.missing;
        self.starved += other.starved;
        self.filled += other.filled;
    }
}

/// Grid of tiles covering a visible area at a single scale.
#[derive(Debug)]
pub struct TiledTexture {
    grid: TileGrid,
    scale: Option<f32>,
    painter: Option<PainterRef>,
    area: Option<ContentRect>,
    pending_invalidations: Vec<ContentRect>,
    starved: bool,
}

impl TiledTexture {
    pub fn new(kind: TextureKind) -> Self {
        Self {
            grid: TileGrid::new(kind),
            scale: None,
            painter: None,
            area: None,
            pending_invalidations: Vec::new(),
            starved: false,
        }
    }

    pub fn kind(&self) -> TextureKind {
        self.grid.kind()
    }

    pub fn scale(&self) -> Option<f32> {
        self.scale
    }

    pub fn area(&self) -> Option<ContentRect> {
        self.area
    }

    pub fn coverage(&self) -> TileGridRect {
        self.grid.rect()
    }

    pub fn tile(&self, x: i32, y: i32) -> Option<&TileRecord> {
        self.grid.get(x, y)
    }

    pub fn tiles(&self) -> impl Iterator<Item = ((i32, i32), &TileRecord)> + '_ {
        self.grid.records()
    }

    pub fn is_starved(&self) -> bool {
        self.starved
    }

    /// Brings the grid to `area` at `scale` and schedules paints for dirty
    /// tiles. Returns the number of jobs handed to the scheduler.
    pub fn prepare(
        &mut self,
        ctx: &PrepareContext<'_>,
        scale: f32,
        area: ContentRect,
        painter: &PainterRef,
    ) -> usize {
        let pool = ctx.pool;
        if let (Some(previous), Some(previous_scale)) = (&self.painter, self.scale)
            && (previous_scale != scale || previous.id != painter.id)
        {
            log::debug!(
                "tiled texture rescaled {} -> {}, cancelling stale paints",
                previous_scale,
                scale
            );
            ctx.scheduler.cancel(previous.id, previous_scale);
        }

        let coverage = compute_coverage(area, scale);
        let previous_rect = self.grid.rect();
        let moving_up = !previous_rect.is_empty() && coverage.y < previous_rect.y;
        for mut evicted in self.grid.retarget(coverage) {
            evicted.discard_textures(pool);
        }
        self.scale = Some(scale);
        self.painter = Some(painter.clone());
        self.area = Some(area);
        self.starved = false;
        let invalidations = std::mem::take(&mut self.pending_invalidations);

        let rows: Vec<i32> = if moving_up {
            (coverage.y..coverage.max_y()).rev().collect()
        } else {
            (coverage.y..coverage.max_y()).collect()
        };
        // Every covered tile claims its textures before any tile acquires, so
        // tiles of this grid never reclaim each other's textures.
        for (x, y) in coverage.cells() {
            let Some(record) = self.grid.get_or_create(x, y) else {
                continue;
            };
            record.sync_with_pool(pool);
            record.ensure_contents(pool, painter.id, x, y, scale);
            record.mark_used(pool);
            for rect in &invalidations {
                if let Some(pixels) = dirty_pixels(x, y, scale, *rect) {
                    record.mark_dirty(pixels);
                }
            }
        }

        let kind = self.grid.kind();
        let mut scheduled = 0;
        for y in rows {
            for x in coverage.x..coverage.max_x() {
                let Some(record) = self.grid.get_mut(x, y) else {
                    continue;
                };
                if !ctx.allow_paint {
                    continue;
                }
                if kind == TextureKind::Layer && !pool.layer_textures_remain() {
                    continue;
                }
                if !record.reserve_back_texture_if_needed(pool) {
                    self.starved = true;
                    continue;
                }
                let Some(request) = record.schedule_paint(pool, ctx.backfill) else {
                    continue;
                };
                let job = PaintJob {
                    target: request.target,
                    painter: painter.clone(),
                    scale,
                    region: request.region,
                    content_rect: region_content_rect(x, y, scale, request.region),
                    backfill_from: request.backfill_from,
                    partial: request.is_partial(),
                };
                if ctx.scheduler.schedule(job) {
                    scheduled += 1;
                } else {
                    pool.mark_paint_failed(request.target.texture, request.target.ticket);
                }
            }
        }
        if scheduled > 0 {
            log::trace!(
                "{:?} tiled texture scheduled {} paints over {:?}",
                kind,
                scheduled,
                coverage
            );
        }
        scheduled
    }

    /// True when every covered tile can be drawn, or when waiting cannot help:
    /// the pool has no layer textures left, or this grid was starved of base
    /// textures during the last prepare.
    pub fn is_ready(&self, pool: &TexturePoolManager) -> bool {
        if self.scale.is_none() {
            return false;
        }
        if self.starved_of_textures(pool) {
            return true;
        }
        self.grid.rect().cells().all(|(x, y)| {
            self.grid
                .get(x, y)
                .is_some_and(|record| record.is_ready(pool))
        })
    }

    fn starved_of_textures(&self, pool: &TexturePoolManager) -> bool {
        match self.grid.kind() {
            TextureKind::Layer => !pool.layer_textures_remain(),
            TextureKind::Base => self.starved,
        }
    }

    pub fn swap_tiles(&mut self, pool: &TexturePoolManager) -> usize {
        let mut swapped = 0;
        for (_, record) in self.grid.records_mut() {
            if record.swap_textures_if_needed(pool) {
                swapped += 1;
            }
        }
        swapped
    }

    /// Swaps finished tiles in, then draws every covered tile overlapping
    /// `visible_area`. Tiles without a texture get the painter's background;
    /// they only ask for another frame while a texture is on its way.
    pub fn draw_all(
        &mut self,
        pool: &TexturePoolManager,
        sink: &mut dyn DrawSink,
        visible_area: ContentRect,
        opacity: f32,
        transform: TransformMatrix4x4,
    ) -> DrawOutcome {
        let mut outcome = DrawOutcome {
            swapped: self.swap_tiles(pool),
            ..DrawOutcome::default()
        };
        let Some(scale) = self.scale else {
            return outcome;
        };
        let background = self
            .painter
            .as_ref()
            .and_then(|painter| painter.painter.background_color());
        let starved = self.starved_of_textures(pool);
        for (x, y) in self.grid.rect().cells() {
            let tile_rect = tile_content_rect(x, y, scale);
            let Some(visible) = tile_rect.intersection(&visible_area) else {
                continue;
            };
            let quad_transform = multiply_transform(
                &transform,
                &translate_scale_transform(
                    tile_rect.x,
                    tile_rect.y,
                    tile_rect.width,
                    tile_rect.height,
                ),
            );
            let record = self.grid.get(x, y);
            if record.is_some_and(|record| record.draw(pool, sink, quad_transform, opacity)) {
                outcome.drawn += 1;
                continue;
            }
            let waiting = record.is_some_and(|record| record.has_back_texture(pool));
            if starved && !waiting {
                outcome.starved += 1;
            } else {
                outcome.missing += 1;
            }
            if let Some(color) = background {
                sink.fill_background(visible, color, opacity);
                outcome.filled += 1;
            }
        }
        outcome
    }

    /// Background-only rendition of the visible area. Returns whether
    /// anything was filled.
    pub fn draw_background(
        &self,
        sink: &mut dyn DrawSink,
        visible_area: ContentRect,
        opacity: f32,
    ) -> bool {
        let Some(color) = self
            .painter
            .as_ref()
            .and_then(|painter| painter.painter.background_color())
        else {
            return false;
        };
        let area = match self.area {
            Some(area) => area.intersection(&visible_area),
            None => (!visible_area.is_empty()).then_some(visible_area),
        };
        let Some(area) = area else {
            return false;
        };
        sink.fill_background(area, color, opacity);
        true
    }

    /// Marks content dirty; applied to the covered tiles at the next prepare.
    pub fn invalidate(&mut self, content_rect: ContentRect) {
        if !content_rect.is_empty() {
            self.pending_invalidations.push(content_rect);
        }
    }

    pub fn cancel_paints(&self, scheduler: &dyn PaintScheduler) {
        if let (Some(painter), Some(scale)) = (&self.painter, self.scale) {
            scheduler.cancel(painter.id, scale);
        }
    }

    /// Returns every texture to the pool and forgets the covered area.
    pub fn discard_textures(&mut self, pool: &TexturePoolManager) {
        for mut record in self.grid.take_all() {
            record.discard_textures(pool);
        }
        self.scale = None;
        self.painter = None;
        self.area = None;
        self.starved = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{RecordingScheduler, RecordingSink, SolidPainter, painter_ids, test_pool};
    use render_protocol::{Color, IDENTITY_TRANSFORM};

    fn context<'a>(
        pool: &'a TexturePoolManager,
        scheduler: &'a RecordingScheduler,
    ) -> PrepareContext<'a> {
        PrepareContext {
            pool,
            scheduler,
            backfill: BackfillPolicy::OnPartialUpdate,
            allow_paint: true,
        }
    }

    fn painter_ref(id: PainterId) -> PainterRef {
        PainterRef::new(id, Arc::new(SolidPainter::new(Color::WHITE)))
    }

    #[test]
    fn prepare_schedules_one_job_per_covered_tile() {
        let pool = test_pool(8, 0);
        let scheduler = RecordingScheduler::default();
        let painter = painter_ref(painter_ids(1)[0]);
        let mut texture = TiledTexture::new(TextureKind::Base);
        pool.begin_frame_gather();
        let scheduled = texture.prepare(
            &context(&pool, &scheduler),
            1.0,
            ContentRect::new(0.0, 0.0, 512.0, 300.0),
            &painter,
        );
        assert_eq!(scheduled, 4);
        assert_eq!(texture.coverage(), TileGridRect::new(0, 0, 2, 2));
        assert!(!texture.is_ready(&pool));

        pool.begin_frame_gather();
        let again = texture.prepare(
            &context(&pool, &scheduler),
            1.0,
            ContentRect::new(0.0, 0.0, 512.0, 300.0),
            &painter,
        );
        assert_eq!(again, 0);
    }

    #[test]
    fn downward_scroll_sweeps_top_to_bottom_and_upward_bottom_to_top() {
        let pool = test_pool(32, 0);
        let scheduler = RecordingScheduler::default();
        let painter = painter_ref(painter_ids(1)[0]);
        let mut texture = TiledTexture::new(TextureKind::Base);
        pool.begin_frame_gather();
        texture.prepare(
            &context(&pool, &scheduler),
            1.0,
            ContentRect::new(0.0, 1024.0, 256.0, 768.0),
            &painter,
        );
        let rows: Vec<i32> = scheduler.take_jobs().iter().map(|job| job.target.key.y).collect();
        assert_eq!(rows, vec![4, 5, 6]);

        pool.begin_frame_gather();
        texture.prepare(
            &context(&pool, &scheduler),
            1.0,
            ContentRect::new(0.0, 256.0, 256.0, 768.0),
            &painter,
        );
        let rows: Vec<i32> = scheduler.take_jobs().iter().map(|job| job.target.key.y).collect();
        assert_eq!(rows, vec![3, 2, 1]);
    }

    #[test]
    fn rescale_cancels_paints_of_previous_scale() {
        let pool = test_pool(8, 0);
        let scheduler = RecordingScheduler::default();
        let id = painter_ids(1)[0];
        let painter = painter_ref(id);
        let mut texture = TiledTexture::new(TextureKind::Base);
        let area = ContentRect::new(0.0, 0.0, 256.0, 256.0);
        pool.begin_frame_gather();
        texture.prepare(&context(&pool, &scheduler), 1.0, area, &painter);
        pool.begin_frame_gather();
        texture.prepare(&context(&pool, &scheduler), 2.0, area, &painter);
        assert_eq!(scheduler.cancelled(), vec![(id, 1.0)]);
    }

    #[test]
    fn invalidate_marks_only_touched_tiles() {
        let pool = test_pool(8, 0);
        let scheduler = RecordingScheduler::default();
        let painter = painter_ref(painter_ids(1)[0]);
        let mut texture = TiledTexture::new(TextureKind::Base);
        let area = ContentRect::new(0.0, 0.0, 512.0, 256.0);
        pool.begin_frame_gather();
        texture.prepare(&context(&pool, &scheduler), 1.0, area, &painter);
        for job in scheduler.take_jobs() {
            assert!(pool.mark_enqueued(job.target.texture, job.target.ticket));
            assert!(pool.complete_upload(&job.target));
        }
        let mut sink = RecordingSink::default();
        texture.draw_all(&pool, &mut sink, area, 1.0, IDENTITY_TRANSFORM);
        assert_eq!(sink.quads.len(), 2);

        texture.invalidate(ContentRect::new(300.0, 10.0, 8.0, 8.0));
        pool.begin_frame_gather();
        texture.prepare(&context(&pool, &scheduler), 1.0, area, &painter);
        let jobs = scheduler.take_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].target.key.x, 1);
        assert_eq!(jobs[0].region, PixelRect::new(44, 10, 8, 8));
        assert!(jobs[0].backfill_from.is_some());
    }

    #[test]
    fn rejected_job_is_retried_next_frame() {
        let pool = test_pool(4, 0);
        let scheduler = RecordingScheduler::default();
        scheduler.set_accepting(false);
        let painter = painter_ref(painter_ids(1)[0]);
        let mut texture = TiledTexture::new(TextureKind::Base);
        let area = ContentRect::new(0.0, 0.0, 256.0, 256.0);
        pool.begin_frame_gather();
        assert_eq!(texture.prepare(&context(&pool, &scheduler), 1.0, area, &painter), 0);

        scheduler.set_accepting(true);
        pool.begin_frame_gather();
        assert_eq!(texture.prepare(&context(&pool, &scheduler), 1.0, area, &painter), 1);
    }

    #[test]
    fn layer_texture_stops_requesting_when_pool_is_dry() {
        let pool = test_pool(0, 1);
        let scheduler = RecordingScheduler::default();
        let painter = painter_ref(painter_ids(1)[0]);
        let mut texture = TiledTexture::new(TextureKind::Layer);
        pool.begin_frame_gather();
        let scheduled = texture.prepare(
            &context(&pool, &scheduler),
            1.0,
            ContentRect::new(0.0, 0.0, 768.0, 256.0),
            &painter,
        );
        assert_eq!(scheduled, 1);
        assert!(!pool.layer_textures_remain());
        assert_eq!(pool.stats().layer.failed_this_frame, 1);
        assert!(texture.is_ready(&pool));
    }

    #[test]
    fn starved_tiles_fall_back_to_background_without_redraw() {
        let pool = test_pool(0, 0);
        let scheduler = RecordingScheduler::default();
        let id = painter_ids(1)[0];
        let painter = PainterRef::new(
            id,
            Arc::new(SolidPainter::new(Color::WHITE).with_background(Color::rgba(0, 0, 255, 255))),
        );
        let mut texture = TiledTexture::new(TextureKind::Base);
        let area = ContentRect::new(0.0, 0.0, 300.0, 100.0);
        pool.begin_frame_gather();
        texture.prepare(&context(&pool, &scheduler), 1.0, area, &painter);
        assert!(texture.is_starved());

        let mut sink = RecordingSink::default();
        let outcome = texture.draw_all(&pool, &mut sink, area, 0.5, IDENTITY_TRANSFORM);
        assert_eq!(outcome.drawn, 0);
        assert_eq!(outcome.missing, 0);
        assert_eq!(outcome.starved, 2);
        assert_eq!(outcome.filled, 2);
        assert!(!outcome.needs_redraw());
        assert_eq!(sink.fills[1].0, ContentRect::new(256.0, 0.0, 44.0, 100.0));
    }

    #[test]
    fn discard_returns_all_textures() {
        let pool = test_pool(4, 0);
        let scheduler = RecordingScheduler::default();
        let painter = painter_ref(painter_ids(1)[0]);
        let mut texture = TiledTexture::new(TextureKind::Base);
        pool.begin_frame_gather();
        texture.prepare(
            &context(&pool, &scheduler),
            1.0,
            ContentRect::new(0.0, 0.0, 512.0, 512.0),
            &painter,
        );
        assert_eq!(pool.stats().base.owned, 4);
        texture.discard_textures(&pool);
        assert_eq!(pool.stats().base.owned, 0);
        assert_eq!(texture.coverage(), TileGridRect::EMPTY);
        assert!(!texture.is_ready(&pool));
    }
}
