use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use render_protocol::{PixelBuffer, PixelRect, TextureId};

use crate::backend::{BackendError, SurfaceAllocator, TextureBackend};
use crate::{TILE_HEIGHT, TILE_WIDTH};

const TILE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

fn tile_extent(width: u32, height: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    }
}

fn create_tile_texture(
    device: &wgpu::Device,
    width: u32,
    height: u32,
    usage: wgpu::TextureUsages,
    label: &'static str,
) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: tile_extent(width, height),
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TILE_FORMAT,
        usage,
        view_formats: &[],
    })
}

fn write_pixels(queue: &wgpu::Queue, texture: &wgpu::Texture, region: PixelRect, pixels: &PixelBuffer) {
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d {
                x: region.x,
                y: region.y,
                z: 0,
            },
            aspect: wgpu::TextureAspect::All,
        },
        pixels.bytes(),
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(pixels.bytes_per_row()),
            rows_per_image: Some(region.height),
        },
        tile_extent(region.width, region.height),
    );
}

/// Staging texture a paint worker filled; copied into the tile on drain.
#[derive(Debug)]
pub struct WgpuSharedSurface {
    texture: wgpu::Texture,
    width: u32,
    height: u32,
}

impl WgpuSharedSurface {
    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }
}

#[derive(Debug, Clone)]
pub struct WgpuSurfaceAllocator {
    device: wgpu::Device,
    queue: wgpu::Queue,
}

impl WgpuSurfaceAllocator {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self { device, queue }
    }
}

impl SurfaceAllocator for WgpuSurfaceAllocator {
    type Surface = WgpuSharedSurface;

    fn fill_surface(&self, pixels: &PixelBuffer) -> Result<WgpuSharedSurface, BackendError> {
        let (width, height) = (pixels.width(), pixels.height());
        if width == 0 || height == 0 {
            return Err(BackendError::SizeMismatch);
        }
        let error_scope = self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let texture = create_tile_texture(
            &self.device,
            width,
            height,
            wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST,
            "tiles.shared_surface",
        );
        write_pixels(&self.queue, &texture, PixelRect::full(width, height), pixels);
        if pollster::block_on(error_scope.pop()).is_some() {
            return Err(BackendError::UploadFailed);
        }
        Ok(WgpuSharedSurface {
            texture,
            width,
            height,
        })
    }
}

/// One `wgpu` texture per pool slot, created on first upload.
#[derive(Debug)]
pub struct WgpuTextureBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    textures: HashMap<TextureId, wgpu::Texture>,
    device_lost: Arc<AtomicBool>,
}

impl WgpuTextureBackend {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let device_lost = watch_device(&device);
        Self {
            device,
            queue,
            textures: HashMap::new(),
            device_lost,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Texture backing a pool slot, for the draw layer to bind.
    pub fn texture(&self, texture: TextureId) -> Option<&wgpu::Texture> {
        self.textures.get(&texture)
    }

    /// Installs a freshly created device after a loss. Call
    /// [`TextureBackend::reinitialize`] afterwards.
    pub fn replace_device(&mut self, device: wgpu::Device, queue: wgpu::Queue) {
        self.device_lost = watch_device(&device);
        self.device = device;
        self.queue = queue;
        self.textures.clear();
    }

    /// Whether the device accepts the tile texture usages.
    pub fn supports_tile_textures(device: &wgpu::Device) -> bool {
        let error_scope = device.push_error_scope(wgpu::ErrorFilter::Validation);
        let _probe_texture = create_tile_texture(
            device,
            1,
            1,
            tile_usage(),
            "tiles.tile_usage_probe",
        );
        pollster::block_on(error_scope.pop()).is_none()
    }

    fn lost(&self) -> bool {
        self.device_lost.load(Ordering::Acquire)
    }

    fn check_device(&self) -> Result<(), BackendError> {
        if self.lost() {
            return Err(BackendError::ContextLost);
        }
        Ok(())
    }

    fn storage(&self, texture: TextureId) -> Result<&wgpu::Texture, BackendError> {
        self.textures
            .get(&texture)
            .ok_or(BackendError::MissingStorage(texture))
    }

    fn submit_copy(
        &self,
        source: &wgpu::Texture,
        destination: &wgpu::Texture,
        region: PixelRect,
        label: &'static str,
    ) -> Result<(), BackendError> {
        let error_scope = self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        encoder.copy_texture_to_texture(
            wgpu::TexelCopyTextureInfo {
                texture: source,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyTextureInfo {
                texture: destination,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: region.x,
                    y: region.y,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            tile_extent(region.width, region.height),
        );
        self.queue.submit(Some(encoder.finish()));
        if pollster::block_on(error_scope.pop()).is_some() {
            return Err(BackendError::UploadFailed);
        }
        self.check_device()
    }
}

fn tile_usage() -> wgpu::TextureUsages {
    wgpu::TextureUsages::TEXTURE_BINDING
        | wgpu::TextureUsages::COPY_DST
        | wgpu::TextureUsages::COPY_SRC
}

fn watch_device(device: &wgpu::Device) -> Arc<AtomicBool> {
    let device_lost = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&device_lost);
    device.set_device_lost_callback(move |reason, message| {
        log::error!("wgpu device lost ({:?}): {}", reason, message);
        flag.store(true, Ordering::Release);
    });
    device_lost
}

impl TextureBackend for WgpuTextureBackend {
    type Surface = WgpuSharedSurface;

    fn ensure_storage(&mut self, texture: TextureId) -> Result<(), BackendError> {
        self.check_device()?;
        if self.textures.contains_key(&texture) {
            return Ok(());
        }
        let created = create_tile_texture(
            &self.device,
            TILE_WIDTH,
            TILE_HEIGHT,
            tile_usage(),
            "tiles.tile_texture",
        );
        self.textures.insert(texture, created);
        Ok(())
    }

    fn upload_pixels(
        &mut self,
        texture: TextureId,
        region: PixelRect,
        pixels: &PixelBuffer,
    ) -> Result<(), BackendError> {
        self.check_device()?;
        if pixels.width() != region.width
            || pixels.height() != region.height
            || !PixelRect::full(TILE_WIDTH, TILE_HEIGHT).contains_rect(&region)
        {
            return Err(BackendError::SizeMismatch);
        }
        let destination = self.storage(texture)?;
        let error_scope = self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        write_pixels(&self.queue, destination, region, pixels);
        if pollster::block_on(error_scope.pop()).is_some() {
            return Err(BackendError::UploadFailed);
        }
        Ok(())
    }

    fn copy_from_surface(
        &mut self,
        texture: TextureId,
        region: PixelRect,
        surface: &WgpuSharedSurface,
    ) -> Result<(), BackendError> {
        self.check_device()?;
        if surface.width != region.width || surface.height != region.height {
            return Err(BackendError::SizeMismatch);
        }
        let destination = self.storage(texture)?;
        self.submit_copy(&surface.texture, destination, region, "tiles.surface_copy")
    }

    fn copy_texture(
        &mut self,
        source: TextureId,
        destination: TextureId,
    ) -> Result<(), BackendError> {
        self.check_device()?;
        let source_texture = self.storage(source)?;
        let destination_texture = self.storage(destination)?;
        self.submit_copy(
            source_texture,
            destination_texture,
            PixelRect::full(TILE_WIDTH, TILE_HEIGHT),
            "tiles.backfill_copy",
        )
    }

    fn release_storage(&mut self, texture: TextureId) {
        if let Some(released) = self.textures.remove(&texture) {
            released.destroy();
        }
    }

    fn flush(&mut self) -> Result<(), BackendError> {
        self.check_device()?;
        self.queue.submit(std::iter::empty());
        Ok(())
    }

    fn reinitialize(&mut self) -> Result<(), BackendError> {
        self.textures.clear();
        self.check_device()
    }

    fn is_context_lost(&self) -> bool {
        self.lost()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use render_protocol::{Color, TextureKind};

    fn create_device_queue() -> Option<(wgpu::Device, wgpu::Queue)> {
        pollster::block_on(async {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            });
            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
                .ok()?;
            adapter
                .request_device(&wgpu::DeviceDescriptor {
                    label: Some("tiles gpu tests"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults(),
                    experimental_features: wgpu::ExperimentalFeatures::disabled(),
                    memory_hints: wgpu::MemoryHints::Performance,
                    trace: wgpu::Trace::Off,
                })
                .await
                .ok()
        })
    }

    fn read_tile(device: &wgpu::Device, queue: &wgpu::Queue, texture: &wgpu::Texture) -> Vec<u8> {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tile readback"),
            size: (TILE_WIDTH as u64) * (TILE_HEIGHT as u64) * 4,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("tile readback"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(TILE_WIDTH * 4),
                    rows_per_image: Some(TILE_HEIGHT),
                },
            },
            tile_extent(TILE_WIDTH, TILE_HEIGHT),
        );
        queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            sender.send(result).expect("map callback send");
        });
        device
            .poll(wgpu::PollType::wait_indefinitely())
            .expect("device poll");
        receiver
            .recv()
            .expect("map callback recv")
            .expect("map tile readback");
        let bytes = slice.get_mapped_range().to_vec();
        buffer.unmap();
        bytes
    }

    fn texel(bytes: &[u8], x: u32, y: u32) -> [u8; 4] {
        let offset = ((y * TILE_WIDTH + x) * 4) as usize;
        [
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]
    }

    const BASE_0: TextureId = TextureId {
        kind: TextureKind::Base,
        index: 0,
    };
    const BASE_1: TextureId = TextureId {
        kind: TextureKind::Base,
        index: 1,
    };

    #[test]
    fn partial_upload_over_backfilled_texture() {
        let Some((device, queue)) = create_device_queue() else {
            return;
        };
        assert!(WgpuTextureBackend::supports_tile_textures(&device));
        let mut backend = WgpuTextureBackend::new(device.clone(), queue.clone());
        backend.ensure_storage(BASE_0).expect("storage");
        backend.ensure_storage(BASE_1).expect("storage");

        let mut full = PixelBuffer::new(TILE_WIDTH, TILE_HEIGHT);
        full.fill(Color::rgba(10, 20, 30, 255));
        backend
            .upload_pixels(BASE_0, PixelRect::full(TILE_WIDTH, TILE_HEIGHT), &full)
            .expect("full upload");
        backend.flush().expect("flush");
        backend.copy_texture(BASE_0, BASE_1).expect("backfill");

        let mut patch = PixelBuffer::new(8, 8);
        patch.fill(Color::WHITE);
        backend
            .upload_pixels(BASE_1, PixelRect::new(16, 16, 8, 8), &patch)
            .expect("patch upload");
        backend.flush().expect("flush");

        let bytes = read_tile(&device, &queue, backend.texture(BASE_1).expect("texture"));
        assert_eq!(texel(&bytes, 0, 0), [10, 20, 30, 255]);
        assert_eq!(texel(&bytes, 20, 20), [255; 4]);
    }

    #[test]
    fn shared_surface_is_copied_into_region() {
        let Some((device, queue)) = create_device_queue() else {
            return;
        };
        let allocator = WgpuSurfaceAllocator::new(device.clone(), queue.clone());
        let mut pixels = PixelBuffer::new(4, 4);
        pixels.fill(Color::rgba(0, 255, 0, 255));
        let surface = allocator.fill_surface(&pixels).expect("surface");

        let mut backend = WgpuTextureBackend::new(device.clone(), queue.clone());
        backend.ensure_storage(BASE_0).expect("storage");
        backend
            .copy_from_surface(BASE_0, PixelRect::new(100, 50, 4, 4), &surface)
            .expect("surface copy");
        backend.flush().expect("flush");

        let bytes = read_tile(&device, &queue, backend.texture(BASE_0).expect("texture"));
        assert_eq!(texel(&bytes, 101, 51), [0, 255, 0, 255]);
        assert_eq!(texel(&bytes, 99, 50), [0, 0, 0, 0]);
        assert_eq!(
            backend.copy_from_surface(BASE_0, PixelRect::new(0, 0, 8, 8), &surface),
            Err(BackendError::SizeMismatch)
        );
    }

    #[test]
    fn release_drops_storage() {
        let Some((device, queue)) = create_device_queue() else {
            return;
        };
        let mut backend = WgpuTextureBackend::new(device, queue);
        backend.ensure_storage(BASE_0).expect("storage");
        backend.release_storage(BASE_0);
        assert!(backend.texture(BASE_0).is_none());
        assert!(!backend.is_context_lost());
    }
}
