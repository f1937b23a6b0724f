use render_protocol::{ContentRect, PixelRect, TextureKind, TileGridRect};

use crate::tile::TileRecord;
use crate::{TILE_HEIGHT, TILE_WIDTH};

/// Widest extent, in tiles, a single grid covers on either axis. Larger
/// requests keep their top-left corner.
pub const MAX_COVERAGE_EDGE: i32 = 64;

/// Tile indices stay far enough from `i32::MAX` that `origin + extent` cannot
/// overflow.
const MAX_TILE_INDEX: f64 = (1 << 24) as f64;

/// Tile indices covering `content_rect` at `scale`.
///
/// Origin is `floor(origin * scale / tile)`, extent is
/// `ceil((origin + size) * scale / tile) - origin`, capped at
/// [`MAX_COVERAGE_EDGE`]. Zero-area input, or a non-positive scale, covers
/// nothing.
pub fn compute_coverage(content_rect: ContentRect, scale: f32) -> TileGridRect {
    if content_rect.is_empty() || !(scale > 0.0) || !scale.is_finite() {
        return TileGridRect::EMPTY;
    }
    let tile_width = TILE_WIDTH as f64;
    let tile_height = TILE_HEIGHT as f64;
    let scale = scale as f64;
    let bound = |index: f64| index.clamp(-MAX_TILE_INDEX, MAX_TILE_INDEX);
    let x0 = bound((content_rect.x as f64 * scale / tile_width).floor());
    let y0 = bound((content_rect.y as f64 * scale / tile_height).floor());
    let x1 = bound((content_rect.max_x() as f64 * scale / tile_width).ceil());
    let y1 = bound((content_rect.max_y() as f64 * scale / tile_height).ceil());
    let width = ((x1 - x0) as i32).min(MAX_COVERAGE_EDGE);
    let height = ((y1 - y0) as i32).min(MAX_COVERAGE_EDGE);
    if width <= 0 || height <= 0 {
        return TileGridRect::EMPTY;
    }
    TileGridRect::new(x0 as i32, y0 as i32, width, height)
}

/// Content-space rectangle painted by tile `(x, y)` at `scale`.
pub fn tile_content_rect(x: i32, y: i32, scale: f32) -> ContentRect {
    let width = TILE_WIDTH as f32 / scale;
    let height = TILE_HEIGHT as f32 / scale;
    ContentRect::new(x as f32 * width, y as f32 * height, width, height)
}

/// Content-space rectangle of a tile-local pixel region.
pub fn region_content_rect(x: i32, y: i32, scale: f32, region: PixelRect) -> ContentRect {
    let tile = tile_content_rect(x, y, scale);
    ContentRect::new(
        tile.x + region.x as f32 / scale,
        tile.y + region.y as f32 / scale,
        region.width as f32 / scale,
        region.height as f32 / scale,
    )
}

/// Tile-local pixels of tile `(x, y)` touched by `content_rect`.
pub(crate) fn dirty_pixels(
    x: i32,
    y: i32,
    scale: f32,
    content_rect: ContentRect,
) -> Option<PixelRect> {
    let tile = tile_content_rect(x, y, scale);
    let overlap = tile.intersection(&content_rect)?;
    let left = ((overlap.x - tile.x) * scale).floor().max(0.0);
    let top = ((overlap.y - tile.y) * scale).floor().max(0.0);
    let right = ((overlap.max_x() - tile.x) * scale)
        .ceil()
        .min(TILE_WIDTH as f32);
    let bottom = ((overlap.max_y() - tile.y) * scale)
        .ceil()
        .min(TILE_HEIGHT as f32);
    if right <= left || bottom <= top {
        return None;
    }
    Some(PixelRect::new(
        left as u32,
        top as u32,
        (right - left) as u32,
        (bottom - top) as u32,
    ))
}

/// Dense tile storage over the covered grid rect, indexed row-major.
#[derive(Debug)]
pub struct TileGrid {
    kind: TextureKind,
    rect: TileGridRect,
    cells: Vec<Option<TileRecord>>,
}

impl TileGrid {
    pub fn new(kind: TextureKind) -> Self {
        Self {
            kind,
            rect: TileGridRect::EMPTY,
            cells: Vec::new(),
        }
    }

    pub fn rect(&self) -> TileGridRect {
        self.rect
    }

    pub fn kind(&self) -> TextureKind {
        self.kind
    }

    fn slot_index(&self, x: i32, y: i32) -> Option<usize> {
        if !self.rect.contains(x, y) {
            return None;
        }
        let column = (x - self.rect.x) as usize;
        let row = (y - self.rect.y) as usize;
        Some(row * self.rect.width as usize + column)
    }

    pub fn get(&self, x: i32, y: i32) -> Option<&TileRecord> {
        let index = self.slot_index(x, y)?;
        self.cells[index].as_ref()
    }

    pub fn get_mut(&mut self, x: i32, y: i32) -> Option<&mut TileRecord> {
        let index = self.slot_index(x, y)?;
        self.cells[index].as_mut()
    }

    /// Record for `(x, y)`, created on first use. `None` outside the rect.
    pub fn get_or_create(&mut self, x: i32, y: i32) -> Option<&mut TileRecord> {
        let index = self.slot_index(x, y)?;
        let kind = self.kind;
        Some(self.cells[index].get_or_insert_with(|| TileRecord::new(kind)))
    }

    /// Moves the grid onto `rect`. Records inside both rects keep their cell;
    /// the rest are handed back so their textures can be returned.
    pub fn retarget(&mut self, rect: TileGridRect) -> Vec<TileRecord> {
        if rect == self.rect {
            return Vec::new();
        }
        let old_rect = self.rect;
        let mut old_cells = std::mem::take(&mut self.cells);
        self.rect = if rect.is_empty() {
            TileGridRect::EMPTY
        } else {
            rect
        };
        self.cells = std::iter::repeat_with(|| None)
            .take(self.rect.tile_count())
            .collect();

        let mut evicted = Vec::new();
        for ((x, y), cell) in old_rect.cells().zip(old_cells.iter_mut()) {
            let Some(record) = cell.take() else {
                continue;
            };
            match self.slot_index(x, y) {
                Some(index) => self.cells[index] = Some(record),
                None => evicted.push(record),
            }
        }
        evicted
    }

    pub fn records(&self) -> impl Iterator<Item = ((i32, i32), &TileRecord)> + '_ {
        self.rect
            .cells()
            .zip(self.cells.iter())
            .filter_map(|(cell, record)| record.as_ref().map(|record| (cell, record)))
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = ((i32, i32), &mut TileRecord)> + '_ {
        self.rect
            .cells()
            .zip(self.cells.iter_mut())
            .filter_map(|(cell, record)| record.as_mut().map(|record| (cell, record)))
    }

    /// Empties the grid, returning every record.
    pub fn take_all(&mut self) -> Vec<TileRecord> {
        self.rect = TileGridRect::EMPTY;
        std::mem::take(&mut self.cells).into_iter().flatten().collect()
    }

    pub fn len(&self) -> usize {
        self.cells.iter().filter(|cell| cell.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
