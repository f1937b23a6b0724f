use render_protocol::{
    DrawSink, PainterId, PixelRect, TextureKind, TexturedQuad, TileKey, TransformMatrix4x4,
};

use crate::pool::{AcquireRequest, TextureContent, TextureHandle, TexturePoolManager, TileId};
use crate::transfer::TransferTarget;
use crate::{TILE_HEIGHT, TILE_WIDTH};

const FULL_TILE: PixelRect = PixelRect::full(TILE_WIDTH, TILE_HEIGHT);

/// When a partial repaint may reuse the pixels of the current front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackfillPolicy {
    /// Partial repaints copy the front into the back before the dirty
    /// sub-rectangle is uploaded.
    #[default]
    OnPartialUpdate,
    /// Every repaint covers the whole tile.
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    AwaitingTexture,
    PaintScheduled,
    AwaitingUpload,
    Ready,
    Dirty,
    Discarded,
}

/// Paint work produced by [`TileRecord::schedule_paint`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaintRequest {
    pub target: TransferTarget,
    /// Tile-local pixels to repaint.
    pub region: PixelRect,
    pub backfill_from: Option<TextureHandle>,
}

impl PaintRequest {
    pub fn is_partial(&self) -> bool {
        self.region != FULL_TILE
    }
}

/// One grid cell at one scale for one painter, double buffered.
#[derive(Debug)]
pub struct TileRecord {
    id: TileId,
    kind: TextureKind,
    key: Option<TileKey>,
    dirty: Option<PixelRect>,
    in_flight: Option<PixelRect>,
    front: Option<TextureHandle>,
    back: Option<TextureHandle>,
    repaint_pending: bool,
    discarded: bool,
}

impl TileRecord {
    pub fn new(kind: TextureKind) -> Self {
        Self {
            id: TileId::next(),
            kind,
            key: None,
            dirty: Some(FULL_TILE),
            in_flight: None,
            front: None,
            back: None,
            repaint_pending: false,
            discarded: false,
        }
    }

    pub fn id(&self) -> TileId {
        self.id
    }

    pub fn kind(&self) -> TextureKind {
        self.kind
    }

    pub fn key(&self) -> Option<TileKey> {
        self.key
    }

    pub fn front(&self) -> Option<TextureHandle> {
        self.front
    }

    pub fn back(&self) -> Option<TextureHandle> {
        self.back
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.is_some()
    }

    pub fn dirty_region(&self) -> Option<PixelRect> {
        self.dirty
    }

    pub fn is_repaint_pending(&self) -> bool {
        self.repaint_pending
    }

    /// Points the record at `(x, y, scale, painter)`. A changed key makes the
    /// tile fully dirty; the front is returned to the pool and the back is
    /// re-keyed, which turns any upload still queued for the old key obsolete.
    pub fn ensure_contents(
        &mut self,
        pool: &TexturePoolManager,
        painter: PainterId,
        x: i32,
        y: i32,
        scale: f32,
    ) -> bool {
        let key = TileKey::new(x, y, scale, painter);
        if self.key == Some(key) {
            return false;
        }
        self.key = Some(key);
        self.dirty = Some(FULL_TILE);
        self.in_flight = None;
        self.repaint_pending = false;
        self.discarded = false;
        if let Some(front) = self.front.take() {
            pool.release(front);
        }
        if let Some(back) = self.back
            && !pool.rekey(back, self.id, key)
        {
            self.back = None;
        }
        true
    }

    /// Stamps both textures as in use, so the pool does not hand them to
    /// another tile before this one is drawn.
    pub fn mark_used(&self, pool: &TexturePoolManager) {
        for handle in [self.front, self.back].into_iter().flatten() {
            pool.mark_used(handle);
        }
    }

    /// Holds a back texture the pool has not taken away.
    pub fn has_back_texture(&self, pool: &TexturePoolManager) -> bool {
        self.back.is_some_and(|back| pool.is_owned_by(back, self.id))
    }

    /// Accumulates a tile-local dirty rectangle.
    pub fn mark_dirty(&mut self, rect: PixelRect) {
        let clipped = clip_to_tile(rect);
        if clipped.is_empty() {
            return;
        }
        self.dirty = Some(match self.dirty {
            Some(dirty) => dirty.union(&clipped),
            None => clipped,
        });
    }

    /// Drops handles the pool has handed to another tile and turns failed or
    /// abandoned paints back into dirty state.
    pub fn sync_with_pool(&mut self, pool: &TexturePoolManager) {
        if let Some(front) = self.front
            && !pool.is_owned_by(front, self.id)
        {
            self.front = None;
            self.dirty = Some(FULL_TILE);
        }
        let Some(back) = self.back else {
            self.requeue_in_flight();
            return;
        };
        if !pool.is_owned_by(back, self.id) {
            self.back = None;
            self.requeue_in_flight();
            return;
        }
        if !self.repaint_pending {
            return;
        }
        match pool.content(back) {
            Some(TextureContent::PaintFailed { .. }) => {
                pool.demote_to_back(back);
                self.requeue_in_flight();
            }
            Some(TextureContent::Empty) | Some(TextureContent::Presented) | None => {
                self.requeue_in_flight();
            }
            Some(
                TextureContent::PaintScheduled { .. }
                | TextureContent::AwaitingUpload { .. }
                | TextureContent::UploadComplete { .. },
            ) => {}
        }
    }

    fn requeue_in_flight(&mut self) {
        if !self.repaint_pending {
            return;
        }
        self.repaint_pending = false;
        if let Some(region) = self.in_flight.take() {
            self.mark_dirty(region);
        }
    }

    /// Requests a back texture when the tile is dirty or has no front. Returns
    /// false only when a texture was needed and the pool had none.
    pub fn reserve_back_texture_if_needed(&mut self, pool: &TexturePoolManager) -> bool {
        let needed = self.dirty.is_some() || self.front.is_none();
        if !needed || self.repaint_pending {
            return true;
        }
        let Some(key) = self.key else {
            return true;
        };
        let acquired = pool.acquire(AcquireRequest {
            kind: self.kind,
            tile: self.id,
            key,
            current_back: self.back,
            current_front: self.front,
        });
        self.back = acquired;
        acquired.is_some()
    }

    /// Moves the dirty region into flight on the back texture. Without a
    /// presentable front, or under [`BackfillPolicy::Never`], the whole tile
    /// is repainted.
    pub fn schedule_paint(
        &mut self,
        pool: &TexturePoolManager,
        policy: BackfillPolicy,
    ) -> Option<PaintRequest> {
        if self.repaint_pending {
            return None;
        }
        let (dirty, back, key) = (self.dirty?, self.back?, self.key?);
        let ticket = pool.schedule_paint(back)?;
        let presentable_front = self.front.filter(|front| {
            pool.is_owned_by(*front, self.id)
                && pool.content(*front) == Some(TextureContent::Presented)
        });
        let (region, backfill_from) = match (policy, presentable_front) {
            (BackfillPolicy::OnPartialUpdate, Some(front)) if dirty != FULL_TILE => {
                (dirty, Some(front))
            }
            _ => (FULL_TILE, None),
        };
        self.dirty = None;
        self.in_flight = Some(region);
        self.repaint_pending = true;
        log::trace!(
            "tile ({}, {}) paint scheduled into {} region {:?}",
            key.x,
            key.y,
            back.id(),
            region
        );
        Some(PaintRequest {
            target: TransferTarget {
                tile: self.id,
                key,
                texture: back,
                ticket,
            },
            region,
            backfill_from,
        })
    }

    /// Promotes an uploaded back texture to front. The old front becomes the
    /// new back. Returns whether a swap happened; a second call without a new
    /// upload is a no-op.
    pub fn swap_textures_if_needed(&mut self, pool: &TexturePoolManager) -> bool {
        let Some(back) = self.back else {
            return false;
        };
        if !pool.is_owned_by(back, self.id) || !pool.mark_presented(back) {
            return false;
        }
        let old_front = self.front.replace(back);
        self.back = old_front.filter(|front| pool.demote_to_back(*front));
        self.repaint_pending = false;
        self.in_flight = None;
        true
    }

    /// Returns both textures to the pool.
    pub fn discard_textures(&mut self, pool: &TexturePoolManager) {
        for handle in [self.front.take(), self.back.take()].into_iter().flatten() {
            pool.release(handle);
        }
        self.key = None;
        self.dirty = Some(FULL_TILE);
        self.in_flight = None;
        self.repaint_pending = false;
        self.discarded = true;
    }

    /// Draws the front texture when the tile still owns a presentable one.
    pub fn draw(
        &self,
        pool: &TexturePoolManager,
        sink: &mut dyn DrawSink,
        transform: TransformMatrix4x4,
        opacity: f32,
    ) -> bool {
        let Some(front) = self.front else {
            return false;
        };
        if !pool.is_owned_by(front, self.id)
            || pool.content(front) != Some(TextureContent::Presented)
        {
            return false;
        }
        pool.mark_used(front);
        sink.draw_textured_quad(TexturedQuad {
            texture: front.id(),
            transform,
            opacity,
            kind: self.kind,
        });
        true
    }

    pub fn has_presentable_front(&self, pool: &TexturePoolManager) -> bool {
        self.front.is_some_and(|front| {
            pool.is_owned_by(front, self.id)
                && pool.content(front) == Some(TextureContent::Presented)
        })
    }

    /// Valid front with nothing left to queue, or an upload waiting to be
    /// swapped in.
    pub fn is_ready(&self, pool: &TexturePoolManager) -> bool {
        if self.discarded {
            return false;
        }
        if self.has_presentable_front(pool) && self.dirty.is_none() {
            return true;
        }
        self.back.is_some_and(|back| {
            pool.is_owned_by(back, self.id)
                && matches!(
                    pool.content(back),
                    Some(TextureContent::UploadComplete { .. })
                )
        })
    }

    pub fn state(&self, pool: &TexturePoolManager) -> TileState {
        if self.discarded {
            return TileState::Discarded;
        }
        let back_content = self
            .back
            .filter(|back| pool.is_owned_by(*back, self.id))
            .and_then(|back| pool.content(back));
        match back_content {
            Some(TextureContent::UploadComplete { .. }) => return TileState::Ready,
            Some(TextureContent::AwaitingUpload { .. }) => return TileState::AwaitingUpload,
            Some(TextureContent::PaintScheduled { .. }) => return TileState::PaintScheduled,
            _ => {}
        }
        if self.has_presentable_front(pool) {
            return if self.dirty.is_some() {
                TileState::Dirty
            } else {
                TileState::Ready
            };
        }
        if back_content.is_none() {
            TileState::AwaitingTexture
        } else {
            TileState::Dirty
        }
    }
}

fn clip_to_tile(rect: PixelRect) -> PixelRect {
    let x0 = rect.x.min(TILE_WIDTH);
    let y0 = rect.y.min(TILE_HEIGHT);
    let x1 = rect.max_x().min(TILE_WIDTH);
    let y1 = rect.max_y().min(TILE_HEIGHT);
    PixelRect::new(x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
}
