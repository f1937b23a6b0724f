//! Texture backend seam.
//!
//! The transfer queue drives a [`TextureBackend`] on the thread owning the GPU
//! context; paint workers only see a [`SurfaceAllocator`]. Storage is keyed by
//! the pool's [`TextureId`] and created lazily.

use std::collections::HashMap;

use render_protocol::{PixelBuffer, PixelRect, TextureId};

use crate::{TILE_HEIGHT, TILE_WIDTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("texture upload failed")]
    UploadFailed,
    #[error("payload does not fit the destination region")]
    SizeMismatch,
    #[error("texture {0} has no storage")]
    MissingStorage(TextureId),
    #[error("GPU context lost")]
    ContextLost,
}

pub trait TextureBackend {
    /// Shared surface type filled by paint workers.
    type Surface: Send + Sync + 'static;

    fn ensure_storage(&mut self, texture: TextureId) -> Result<(), BackendError>;

    /// Writes `pixels` into `region` of `texture`. The buffer has the
    /// region's size.
    fn upload_pixels(
        &mut self,
        texture: TextureId,
        region: PixelRect,
        pixels: &PixelBuffer,
    ) -> Result<(), BackendError>;

    fn copy_from_surface(
        &mut self,
        texture: TextureId,
        region: PixelRect,
        surface: &Self::Surface,
    ) -> Result<(), BackendError>;

    /// Whole-texture copy, used to backfill a back texture from its front.
    fn copy_texture(&mut self, source: TextureId, destination: TextureId)
    -> Result<(), BackendError>;

    fn release_storage(&mut self, texture: TextureId);

    /// Submits work recorded during a drain.
    fn flush(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Drops all storage and recreates the context after a loss.
    fn reinitialize(&mut self) -> Result<(), BackendError>;

    fn is_context_lost(&self) -> bool;
}

/// Worker-side factory for shared surfaces.
pub trait SurfaceAllocator: Send + Sync {
    type Surface: Send + Sync + 'static;

    fn fill_surface(&self, pixels: &PixelBuffer) -> Result<Self::Surface, BackendError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MemorySurfaceAllocator;

impl SurfaceAllocator for MemorySurfaceAllocator {
    type Surface = PixelBuffer;

    fn fill_surface(&self, pixels: &PixelBuffer) -> Result<PixelBuffer, BackendError> {
        Ok(pixels.clone())
    }
}

/// Backend keeping texture pixels in RAM. Deterministic; can simulate upload
/// failures and context loss.
#[derive(Debug)]
pub struct MemoryTextureBackend {
    width: u32,
    height: u32,
    textures: HashMap<TextureId, PixelBuffer>,
    failing_uploads: u32,
    context_lost: bool,
    uploads: usize,
    copies: usize,
    releases: usize,
    reinitializations: usize,
}

impl Default for MemoryTextureBackend {
    fn default() -> Self {
        Self::new(TILE_WIDTH, TILE_HEIGHT)
    }
}

impl MemoryTextureBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            textures: HashMap::new(),
            failing_uploads: 0,
            context_lost: false,
            uploads: 0,
            copies: 0,
            releases: 0,
            reinitializations: 0,
        }
    }

    pub fn texture_pixels(&self, texture: TextureId) -> Option<&PixelBuffer> {
        self.textures.get(&texture)
    }

    pub fn storage_count(&self) -> usize {
        self.textures.len()
    }

    /// The next `count` uploads fail with [`BackendError::UploadFailed`].
    pub fn fail_next_uploads(&mut self, count: u32) {
        self.failing_uploads = count;
    }

    pub fn lose_context(&mut self) {
        self.context_lost = true;
    }

    pub fn upload_count(&self) -> usize {
        self.uploads
    }

    pub fn copy_count(&self) -> usize {
        self.copies
    }

    pub fn release_count(&self) -> usize {
        self.releases
    }

    pub fn reinitialize_count(&self) -> usize {
        self.reinitializations
    }

    fn check_context(&self) -> Result<(), BackendError> {
        if self.context_lost {
            return Err(BackendError::ContextLost);
        }
        Ok(())
    }

    fn write_region(
        &mut self,
        texture: TextureId,
        region: PixelRect,
        pixels: &PixelBuffer,
    ) -> Result<(), BackendError> {
        self.check_context()?;
        if self.failing_uploads > 0 {
            self.failing_uploads -= 1;
            return Err(BackendError::UploadFailed);
        }
        let destination = self
            .textures
            .get_mut(&texture)
            .ok_or(BackendError::MissingStorage(texture))?;
        blit(destination, region, pixels)?;
        self.uploads += 1;
        Ok(())
    }
}

fn blit(
    destination: &mut PixelBuffer,
    region: PixelRect,
    source: &PixelBuffer,
) -> Result<(), BackendError> {
    let bounds = PixelRect::full(destination.width(), destination.height());
    if !bounds.contains_rect(&region)
        || source.width() != region.width
        || source.height() != region.height
    {
        return Err(BackendError::SizeMismatch);
    }
    let source_row = source.bytes_per_row() as usize;
    let destination_row = destination.bytes_per_row() as usize;
    let x_offset = region.x as usize * PixelBuffer::BYTES_PER_PIXEL as usize;
    let destination_bytes = destination.bytes_mut();
    for (row, source_bytes) in source.bytes().chunks_exact(source_row).enumerate() {
        let start = (region.y as usize + row) * destination_row + x_offset;
        destination_bytes[start..start + source_row].copy_from_slice(source_bytes);
    }
    Ok(())
}

impl TextureBackend for MemoryTextureBackend {
    type Surface = PixelBuffer;

    fn ensure_storage(&mut self, texture: TextureId) -> Result<(), BackendError> {
        self.check_context()?;
        let (width, height) = (self.width, self.height);
        self.textures
            .entry(texture)
            .or_insert_with(|| PixelBuffer::new(width, height));
        Ok(())
    }

    fn upload_pixels(
        &mut self,
        texture: TextureId,
        region: PixelRect,
        pixels: &PixelBuffer,
    ) -> Result<(), BackendError> {
        self.write_region(texture, region, pixels)
    }

    fn copy_from_surface(
        &mut self,
        texture: TextureId,
        region: PixelRect,
        surface: &PixelBuffer,
    ) -> Result<(), BackendError> {
        self.write_region(texture, region, surface)
    }

    fn copy_texture(
        &mut self,
        source: TextureId,
        destination: TextureId,
    ) -> Result<(), BackendError> {
        self.check_context()?;
        let pixels = self
            .textures
            .get(&source)
            .ok_or(BackendError::MissingStorage(source))?
            .clone();
        let target = self
            .textures
            .get_mut(&destination)
            .ok_or(BackendError::MissingStorage(destination))?;
        *target = pixels;
        self.copies += 1;
        Ok(())
    }

    fn release_storage(&mut self, texture: TextureId) {
        if self.textures.remove(&texture).is_some() {
            self.releases += 1;
        }
    }

    fn reinitialize(&mut self) -> Result<(), BackendError> {
        self.textures.clear();
        self.context_lost = false;
        self.failing_uploads = 0;
        self.reinitializations += 1;
        Ok(())
    }

    fn is_context_lost(&self) -> bool {
        self.context_lost
    }
}
