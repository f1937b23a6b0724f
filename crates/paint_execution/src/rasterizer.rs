use std::marker::PhantomData;
use std::sync::Arc;

use tiles::{PaintJob, SurfaceAllocator, UploadPayload};

/// Turns a paint job into an upload payload on a worker thread.
pub trait Rasterizer: Send + Sync + 'static {
    type Surface: Send + Sync + 'static;

    /// `None` when the painter failed; the tile is repainted later.
    fn rasterize(&self, job: &PaintJob) -> Option<UploadPayload<Self::Surface>>;
}

/// Paints into CPU pixel buffers uploaded by the GPU thread.
pub struct CpuRasterizer<S> {
    _surface: PhantomData<fn() -> S>,
}

impl<S> CpuRasterizer<S> {
    pub fn new() -> Self {
        Self {
            _surface: PhantomData,
        }
    }
}

impl<S> Default for CpuRasterizer<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> std::fmt::Debug for CpuRasterizer<S> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("CpuRasterizer")
    }
}

impl<S: Send + Sync + 'static> Rasterizer for CpuRasterizer<S> {
    type Surface = S;

    fn rasterize(&self, job: &PaintJob) -> Option<UploadPayload<S>> {
        job.rasterize().map(UploadPayload::Cpu)
    }
}

/// Paints on the CPU, then moves the pixels into a shared surface so the GPU
/// thread only records a texture-to-texture copy. Falls back to a CPU payload
/// when no surface can be filled.
#[derive(Debug)]
pub struct SurfaceRasterizer<A> {
    allocator: A,
}

impl<A> SurfaceRasterizer<A> {
    pub fn new(allocator: A) -> Self {
        Self { allocator }
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }
}

impl<A: SurfaceAllocator + 'static> Rasterizer for SurfaceRasterizer<A> {
    type Surface = A::Surface;

    fn rasterize(&self, job: &PaintJob) -> Option<UploadPayload<A::Surface>> {
        let pixels = job.rasterize()?;
        match self.allocator.fill_surface(&pixels) {
            Ok(surface) => Some(UploadPayload::Surface(Arc::new(surface))),
            Err(error) => {
                log::warn!(
                    "shared surface for tile ({}, {}) unavailable, uploading from memory: {}",
                    job.target.key.x,
                    job.target.key.y,
                    error
                );
                Some(UploadPayload::Cpu(pixels))
            }
        }
    }
}
