//! Shared vocabulary between the scene graph, the tile pipeline and the draw layer.
//!
//! Nothing in here owns GPU resources. Texture identity crosses this boundary as a
//! plain [`TextureId`]; the generation-checked handle lives in the `tiles` crate.

use std::fmt;

slotmap::new_key_type! {
    /// Identity of a content source. Part of every tile key.
    pub struct PainterId;
}

pub type TransformMatrix4x4 = [f32; 16];

pub const IDENTITY_TRANSFORM: TransformMatrix4x4 = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Column-major translate * scale, the only transform tiles need to place a quad.
pub fn translate_scale_transform(
    translate_x: f32,
    translate_y: f32,
    scale_x: f32,
    scale_y: f32,
) -> TransformMatrix4x4 {
    [
        scale_x,
        0.0,
        0.0,
        0.0,
        0.0,
        scale_y,
        0.0,
        0.0,
        0.0,
        0.0,
        1.0,
        0.0,
        translate_x,
        translate_y,
        0.0,
        1.0,
    ]
}

pub fn multiply_transform(
    lhs: &TransformMatrix4x4,
    rhs: &TransformMatrix4x4,
) -> TransformMatrix4x4 {
    let mut out = [0.0f32; 16];
    for column in 0..4 {
        for row in 0..4 {
            let mut sum = 0.0;
            for k in 0..4 {
                sum += lhs[k * 4 + row] * rhs[column * 4 + k];
            }
            out[column * 4 + row] = sum;
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureKind {
    /// Tiles of the base page surface.
    Base,
    /// Tiles of composited layers.
    Layer,
}

impl TextureKind {
    pub const ALL: [TextureKind; 2] = [TextureKind::Base, TextureKind::Layer];

    pub const fn index(self) -> usize {
        match self {
            TextureKind::Base => 0,
            TextureKind::Layer => 1,
        }
    }
}

/// Backend-facing texture identity. Stable for the lifetime of the GPU context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId {
    pub kind: TextureKind,
    pub index: u32,
}

impl Ord for TextureKind {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index().cmp(&other.index())
    }
}

impl PartialOrd for TextureKind {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TextureId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TextureKind::Base => write!(formatter, "base#{}", self.index),
            TextureKind::Layer => write!(formatter, "layer#{}", self.index),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const TRANSPARENT: Color = Color::rgba(0, 0, 0, 0);
    pub const WHITE: Color = Color::rgba(255, 255, 255, 255);

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const fn to_bytes(self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

/// Rectangle in unscaled content (document) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ContentRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl ContentRect {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.width > 0.0 && self.height > 0.0)
    }

    pub fn max_x(&self) -> f32 {
        self.x + self.width
    }

    pub fn max_y(&self) -> f32 {
        self.y + self.height
    }

    pub fn intersection(&self, other: &ContentRect) -> Option<ContentRect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.max_x().min(other.max_x());
        let y1 = self.max_y().min(other.max_y());
        let rect = ContentRect::new(x0, y0, x1 - x0, y1 - y0);
        (!rect.is_empty()).then_some(rect)
    }

    pub fn intersects(&self, other: &ContentRect) -> bool {
        self.intersection(other).is_some()
    }

    pub fn union(&self, other: &ContentRect) -> ContentRect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x0 = self.x.min(other.x);
        let y0 = self.y.min(other.y);
        let x1 = self.max_x().max(other.max_x());
        let y1 = self.max_y().max(other.max_y());
        ContentRect::new(x0, y0, x1 - x0, y1 - y0)
    }
}

/// Rectangle in tile-index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TileGridRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl TileGridRect {
    pub const EMPTY: TileGridRect = TileGridRect {
        x: 0,
        y: 0,
        width: 0,
        height: 0,
    };

    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub const fn max_x(&self) -> i32 {
        self.x + self.width
    }

    pub const fn max_y(&self) -> i32 {
        self.y + self.height
    }

    pub const fn contains(&self, tile_x: i32, tile_y: i32) -> bool {
        tile_x >= self.x && tile_x < self.max_x() && tile_y >= self.y && tile_y < self.max_y()
    }

    pub fn tile_count(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        (self.width as usize) * (self.height as usize)
    }

    pub fn intersection(&self, other: &TileGridRect) -> TileGridRect {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.max_x().min(other.max_x());
        let y1 = self.max_y().min(other.max_y());
        if x1 <= x0 || y1 <= y0 {
            return TileGridRect::EMPTY;
        }
        TileGridRect::new(x0, y0, x1 - x0, y1 - y0)
    }

    /// Cells in row-major order, rows top to bottom.
    pub fn cells(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        let rect = *self;
        let rows = if rect.is_empty() { 0 } else { rect.height };
        (0..rows).flat_map(move |row| (0..rect.width).map(move |col| (rect.x + col, rect.y + row)))
    }
}

/// Rectangle in tile-local pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub const fn max_x(&self) -> u32 {
        self.x + self.width
    }

    pub const fn max_y(&self) -> u32 {
        self.y + self.height
    }

    pub fn union(&self, other: &PixelRect) -> PixelRect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x0 = self.x.min(other.x);
        let y0 = self.y.min(other.y);
        let x1 = self.max_x().max(other.max_x());
        let y1 = self.max_y().max(other.max_y());
        PixelRect::new(x0, y0, x1 - x0, y1 - y0)
    }

    pub fn contains_rect(&self, other: &PixelRect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.max_x() <= self.max_x()
            && other.max_y() <= self.max_y()
    }
}

/// Logical identity of a tile: grid cell, scale and content source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileKey {
    pub x: i32,
    pub y: i32,
    pub scale: f32,
    pub painter: PainterId,
}

impl TileKey {
    pub const fn new(x: i32, y: i32, scale: f32, painter: PainterId) -> Self {
        Self {
            x,
            y,
            scale,
            painter,
        }
    }
}

/// Tightly packed RGBA8 pixels.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    bytes: Vec<u8>,
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl PixelBuffer {
    pub const BYTES_PER_PIXEL: u32 = 4;

    pub fn new(width: u32, height: u32) -> Self {
        let len = (width as usize) * (height as usize) * Self::BYTES_PER_PIXEL as usize;
        Self {
            width,
            height,
            bytes: vec![0; len],
        }
    }

    pub fn from_bytes(width: u32, height: u32, bytes: Vec<u8>) -> Option<Self> {
        let expected = (width as usize) * (height as usize) * Self::BYTES_PER_PIXEL as usize;
        (bytes.len() == expected).then_some(Self {
            width,
            height,
            bytes,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bytes_per_row(&self) -> u32 {
        self.width * Self::BYTES_PER_PIXEL
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn fill(&mut self, color: Color) {
        let pixel = color.to_bytes();
        for chunk in self.bytes.chunks_exact_mut(4) {
            chunk.copy_from_slice(&pixel);
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = ((y as usize) * (self.width as usize) + x as usize) * 4;
        let mut pixel = [0u8; 4];
        pixel.copy_from_slice(&self.bytes[offset..offset + 4]);
        Some(pixel)
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, color: Color) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        let offset = ((y as usize) * (self.width as usize) + x as usize) * 4;
        self.bytes[offset..offset + 4].copy_from_slice(&color.to_bytes());
        true
    }
}

/// Content source capability handed to the tile pipeline by the scene graph.
///
/// `paint` runs on paint worker threads; it fills `target`, which covers
/// `content_rect` (content coordinates) rendered at `scale`.
pub trait TilePainter: Send + Sync {
    fn paint(&self, target: &mut PixelBuffer, content_rect: ContentRect, scale: f32) -> bool;

    fn opacity(&self) -> f32 {
        1.0
    }

    fn background_color(&self) -> Option<Color> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TexturedQuad {
    pub texture: TextureId,
    pub transform: TransformMatrix4x4,
    pub opacity: f32,
    pub kind: TextureKind,
}

/// Draw layer contract. Called on the thread owning the GPU context.
pub trait DrawSink {
    fn draw_textured_quad(&mut self, quad: TexturedQuad);

    /// Non-textured fill used when a surface runs without textures.
    fn fill_background(&mut self, rect: ContentRect, color: Color, opacity: f32);
}
