//! Two tiled textures for smooth zoom.
//!
//! The front keeps drawing the old scale while the back is painted at the
//! requested one. A scale request only takes effect after a debounce and once
//! the back reports ready; the swap is a flip of [`ActiveBuffer`].

use std::time::{Duration, Instant};

use render_protocol::{ContentRect, DrawSink, TextureKind, TransformMatrix4x4};

use crate::pool::TexturePoolManager;
use crate::tiled_texture::{
    DrawOutcome, PaintScheduler, PainterRef, PrepareContext, TiledTexture,
};

pub const DEFAULT_ZOOM_DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActiveBuffer {
    First,
    Second,
}

impl ActiveBuffer {
    const fn front_index(self) -> usize {
        match self {
            ActiveBuffer::First => 0,
            ActiveBuffer::Second => 1,
        }
    }

    const fn back_index(self) -> usize {
        1 - self.front_index()
    }

    const fn flipped(self) -> Self {
        match self {
            ActiveBuffer::First => ActiveBuffer::Second,
            ActiveBuffer::Second => ActiveBuffer::First,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ZoomState {
    Stable { scale: f32 },
    Debouncing { from: f32, target: f32, deadline: Instant },
    BackPreparing { from: f32, target: f32 },
}

#[derive(Debug)]
pub struct DualTiledTexture {
    textures: [TiledTexture; 2],
    active: ActiveBuffer,
    current_scale: Option<f32>,
    target_scale: Option<f32>,
    zoom_deadline: Option<Instant>,
    zooming: bool,
    pre_zoom_area: Option<ContentRect>,
    debounce: Duration,
}

impl DualTiledTexture {
    pub fn new(kind: TextureKind, debounce: Duration) -> Self {
        Self {
            textures: [TiledTexture::new(kind), TiledTexture::new(kind)],
            active: ActiveBuffer::First,
            current_scale: None,
            target_scale: None,
            zoom_deadline: None,
            zooming: false,
            pre_zoom_area: None,
            debounce,
        }
    }

    pub fn active(&self) -> ActiveBuffer {
        self.active
    }

    pub fn front(&self) -> &TiledTexture {
        &self.textures[self.active.front_index()]
    }

    pub fn back(&self) -> &TiledTexture {
        &self.textures[self.active.back_index()]
    }

    fn front_mut(&mut self) -> &mut TiledTexture {
        &mut self.textures[self.active.front_index()]
    }

    fn back_mut(&mut self) -> &mut TiledTexture {
        &mut self.textures[self.active.back_index()]
    }

    pub fn current_scale(&self) -> Option<f32> {
        self.current_scale
    }

    pub fn is_zooming(&self) -> bool {
        self.zooming
    }

    pub fn zoom_state(&self) -> Option<ZoomState> {
        let from = self.current_scale?;
        let state = match (self.zooming, self.target_scale, self.zoom_deadline) {
            (true, Some(target), Some(deadline)) => ZoomState::Debouncing {
                from,
                target,
                deadline,
            },
            (true, Some(target), None) => ZoomState::BackPreparing { from, target },
            _ => ZoomState::Stable { scale: from },
        };
        Some(state)
    }

    /// Prepares for a frame at `scale` over `area`. Returns true when the
    /// back buffer was swapped in.
    pub fn prepare(
        &mut self,
        ctx: &PrepareContext<'_>,
        now: Instant,
        scale: f32,
        area: ContentRect,
        painter: &PainterRef,
    ) -> bool {
        let Some(current) = self.current_scale else {
            self.current_scale = Some(scale);
            self.front_mut().prepare(ctx, scale, area, painter);
            return false;
        };

        if scale == current {
            if self.zooming {
                log::debug!("zoom back to {} abandoned before swap", current);
                self.end_zoom(ctx);
            }
        } else if self.target_scale != Some(scale) {
            if !self.zooming {
                self.pre_zoom_area = self.front().area();
            }
            log::debug!("zoom {} -> {} requested", current, scale);
            self.zooming = true;
            self.target_scale = Some(scale);
            self.zoom_deadline = Some(now + self.debounce);
        }

        let front_area = self.pre_zoom_area.unwrap_or(area);
        self.front_mut().prepare(ctx, current, front_area, painter);

        if !self.zooming {
            return false;
        }
        if let Some(deadline) = self.zoom_deadline {
            if now < deadline {
                return false;
            }
            self.zoom_deadline = None;
        }
        let Some(target) = self.target_scale else {
            return false;
        };
        self.back_mut().prepare(ctx, target, area, painter);
        if !self.back().is_ready(ctx.pool) {
            return false;
        }

        self.active = self.active.flipped();
        self.current_scale = Some(target);
        self.zooming = false;
        self.target_scale = None;
        self.pre_zoom_area = None;
        let retired = self.back_mut();
        retired.cancel_paints(ctx.scheduler);
        retired.discard_textures(ctx.pool);
        log::debug!("zoom swapped to scale {}", target);
        true
    }

    fn end_zoom(&mut self, ctx: &PrepareContext<'_>) {
        self.zooming = false;
        self.target_scale = None;
        self.zoom_deadline = None;
        self.pre_zoom_area = None;
        let back = self.back_mut();
        back.cancel_paints(ctx.scheduler);
        back.discard_textures(ctx.pool);
    }

    pub fn is_ready(&self, pool: &TexturePoolManager) -> bool {
        self.front().is_ready(pool)
    }

    pub fn draw(
        &mut self,
        pool: &TexturePoolManager,
        sink: &mut dyn DrawSink,
        visible_area: ContentRect,
        opacity: f32,
        transform: TransformMatrix4x4,
    ) -> DrawOutcome {
        self.front_mut()
            .draw_all(pool, sink, visible_area, opacity, transform)
    }

    pub fn draw_background(
        &self,
        sink: &mut dyn DrawSink,
        visible_area: ContentRect,
        opacity: f32,
    ) -> bool {
        self.front().draw_background(sink, visible_area, opacity)
    }

    pub fn invalidate(&mut self, content_rect: ContentRect) {
        for texture in &mut self.textures {
            texture.invalidate(content_rect);
        }
    }

    pub fn discard_textures(&mut self, pool: &TexturePoolManager) {
        for texture in &mut self.textures {
            texture.discard_textures(pool);
        }
        self.current_scale = None;
        self.target_scale = None;
        self.zoom_deadline = None;
        self.zooming = false;
        self.pre_zoom_area = None;
    }

    pub fn cancel_paints(&self, scheduler: &dyn PaintScheduler) {
        for texture in &self.textures {
            texture.cancel_paints(scheduler);
        }
    }
}
