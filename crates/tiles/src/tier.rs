//! Device tiers and viewport-driven texture capacity.
//!
//! Every tier carries hard ceilings for both texture pools. The planner turns a
//! visible viewport into a requested capacity, which the pool manager then clamps:
//!
//! - base tiles: `(ceil(w / TILE_WIDTH) + 1) * (ceil(h / TILE_HEIGHT) + 1) * 2`
//!   (one extra row and column for partially visible tiles, times two for the
//!   front/back pair of every tile)
//! - layer tiles: the tier's layer budget
//!
//! Example ceilings (256×256 RGBA tiles, 256 KiB each):
//! - Low:      64 base / 32 layer   = 24 MiB
//! - Standard: 128 base / 96 layer  = 56 MiB
//! - High:     256 base / 192 layer = 112 MiB

use crate::{TILE_HEIGHT, TILE_WIDTH};

/// Device class, decided by the embedder from available GPU memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceTier {
    /// 64 base / 32 layer textures.
    Low,
    /// 128 base / 96 layer textures.
    #[default]
    Standard,
    /// 256 base / 192 layer textures.
    High,
}

impl DeviceTier {
    pub const fn max_base_textures(self) -> u32 {
        match self {
            DeviceTier::Low => 64,
            DeviceTier::Standard => 128,
            DeviceTier::High => 256,
        }
    }

    pub const fn max_layer_textures(self) -> u32 {
        match self {
            DeviceTier::Low => 32,
            DeviceTier::Standard => 96,
            DeviceTier::High => 192,
        }
    }

    /// Low-memory devices run the transfer ring at its minimal size.
    pub const fn transfer_queue_size(self) -> TransferQueueSize {
        match self {
            DeviceTier::Low => TransferQueueSize::Minimal,
            DeviceTier::Standard | DeviceTier::High => TransferQueueSize::Efficient,
        }
    }

    pub const fn ceilings(self) -> TextureCapacity {
        TextureCapacity {
            base: self.max_base_textures(),
            layer: self.max_layer_textures(),
        }
    }
}

/// Transfer ring size, fixed when the queue is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransferQueueSize {
    Minimal,
    #[default]
    Efficient,
    Custom(usize),
}

impl TransferQueueSize {
    pub const fn slots(self) -> usize {
        match self {
            TransferQueueSize::Minimal => 3,
            TransferQueueSize::Efficient => 6,
            TransferQueueSize::Custom(slots) => slots,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TextureCapacity {
    pub base: u32,
    pub layer: u32,
}

impl TextureCapacity {
    pub const fn new(base: u32, layer: u32) -> Self {
        Self { base, layer }
    }

    pub fn clamp_to(self, ceilings: TextureCapacity) -> Self {
        Self {
            base: self.base.min(ceilings.base),
            layer: self.layer.min(ceilings.layer),
        }
    }
}

/// Capacity request for a visible viewport of `width` × `height` device pixels.
pub fn plan_capacity(width: u32, height: u32, tier: DeviceTier) -> TextureCapacity {
    if width == 0 || height == 0 {
        return TextureCapacity::new(0, tier.max_layer_textures());
    }
    let columns = width.div_ceil(TILE_WIDTH).saturating_add(1);
    let rows = height.div_ceil(TILE_HEIGHT).saturating_add(1);
    let base = columns.saturating_mul(rows).saturating_mul(2);
    TextureCapacity::new(base, tier.max_layer_textures()).clamp_to(tier.ceilings())
}
