//! Tile texture lifecycle: the texture pool, per-tile double buffering, tiled
//! grids at one scale, dual grids for zoom and the transfer queue that moves
//! painted content onto the thread owning the GPU context.

mod backend;
mod dual_tiled_texture;
#[cfg(feature = "gpu")]
mod gpu;
mod grid;
mod pool;
mod tier;
mod tile;
mod tiled_texture;
mod transfer;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use backend::{
    BackendError, MemorySurfaceAllocator, MemoryTextureBackend, SurfaceAllocator, TextureBackend,
};
pub use dual_tiled_texture::{ActiveBuffer, DEFAULT_ZOOM_DEBOUNCE, DualTiledTexture, ZoomState};
#[cfg(feature = "gpu")]
pub use gpu::{WgpuSharedSurface, WgpuSurfaceAllocator, WgpuTextureBackend};
pub use grid::{
    MAX_COVERAGE_EDGE, TileGrid, compute_coverage, region_content_rect, tile_content_rect,
};
pub use pool::{
    AcquireRequest, KindStats, PaintTicket, PoolStats, TextureContent, TextureHandle,
    TexturePoolConfig, TexturePoolManager, TileId,
};
pub use tier::{DeviceTier, TextureCapacity, TransferQueueSize, plan_capacity};
pub use tile::{BackfillPolicy, PaintRequest, TileRecord, TileState};
pub use tiled_texture::{
    DrawOutcome, PaintJob, PaintScheduler, PainterRef, PrepareContext, TiledTexture,
};
pub use transfer::{
    DrainReport, SlotStatus, TransferError, TransferQueue, TransferRequest, TransferTarget,
    UploadPayload,
};

pub const TILE_WIDTH: u32 = 256;
pub const TILE_HEIGHT: u32 = 256;

static_assertions::const_assert!(TILE_WIDTH.is_power_of_two());
static_assertions::const_assert!(TILE_HEIGHT.is_power_of_two());

#[cfg(test)]
mod tests;
