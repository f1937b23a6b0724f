//! Compositing session driving the tiled texture pipeline once per frame.

mod config;
mod session;


use paint_execution::CpuRasterizer;
use render_protocol::PixelBuffer;
use tiles::MemoryTextureBackend;

pub use config::{BackfillSetting, CompositorConfig, ConfigError, TierSetting};
pub use session::{
    Compositor, CompositorError, FrameError, FrameReport, RenderMode, SurfaceId, SurfaceView,
};

/// Session keeping textures in memory and painting on the CPU.
pub type HeadlessCompositor = Compositor<MemoryTextureBackend, CpuRasterizer<PixelBuffer>>;

impl HeadlessCompositor {
    pub fn headless(config: CompositorConfig) -> Result<Self, CompositorError> {
        Compositor::new(config, MemoryTextureBackend::default(), CpuRasterizer::new())
    }
}

#[cfg(feature = "gpu")]
pub type WgpuCompositor = Compositor<
    tiles::WgpuTextureBackend,
    paint_execution::SurfaceRasterizer<tiles::WgpuSurfaceAllocator>,
>;

#[cfg(feature = "gpu")]
impl WgpuCompositor {
    /// Workers fill shared staging textures on `device`; the frame thread
    /// copies them into tile textures.
    pub fn with_wgpu(
        config: CompositorConfig,
        device: wgpu::Device,
        queue: wgpu::Queue,
    ) -> Result<Self, CompositorError> {
        let backend = tiles::WgpuTextureBackend::new(device.clone(), queue.clone());
        let rasterizer =
            paint_execution::SurfaceRasterizer::new(tiles::WgpuSurfaceAllocator::new(device, queue));
        Compositor::new(config, backend, rasterizer)
    }
}
