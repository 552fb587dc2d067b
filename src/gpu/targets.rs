// gpu/targets.rs — Source upload and the size-keyed target set.
//
// RESPONSIBILITIES
// ─────────────────
// 1. `SourceTexture::upload()` copies a caller's RGBA32F pixels into a
//    sampled texture. Created per call and dropped once the dispatch that
//    reads it has been submitted.
//
// 2. `TargetSet` holds everything whose size depends only on the block grid:
//
//      target       Rgba32Uint storage texture, blockW × blockH
//                   (one 128-bit BC6H block per texel)
//      staging      MAP_READ buffer the target is copied into
//      compressed   Bc6hRgbUfloat texture, 4·blockW × 4·blockH, only when
//                   the quality probe is enabled and the device can sample BC
//
//    The orchestrator keeps one TargetSet and rebuilds it when the block
//    grid changes.
//
//
// ROW ALIGNMENT
// ─────────────
// Buffer↔texture copies need `bytes_per_row` to be a multiple of
// COPY_BYTES_PER_ROW_ALIGNMENT (256). The source is tightly packed
// (width × 16 bytes per row), so upload compacts it into 256-aligned rows.
// On the way back the staging buffer keeps the padded pitch and
// `readback::extract_blocks` strips it.

use wgpu::util::DeviceExt;

use crate::gpu::device::{GpuDevice, GpuError};
use crate::image::{BlockExtent, ImageView, BLOCK_BYTES, RGBA32F_TEXEL_BYTES};
use crate::readback::{align_to, StagingLayout};

/// wgpu's row alignment for buffer↔texture copies.
pub const COPY_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

// ---------------------------------------------------------------------------
// SourceTexture
// ---------------------------------------------------------------------------

/// An RGBA32F source image resident on the GPU.
pub struct SourceTexture {
    pub texture: wgpu::Texture,
    pub view:    wgpu::TextureView,
    pub width:   u32,
    pub height:  u32,
}

impl SourceTexture {
    /// Upload `image` (RGBA32F, `width × 16` bytes per row).
    ///
    /// The copy is submitted before returning, so a dispatch submitted
    /// afterwards on the same queue sees the data.
    pub fn upload(gpu: &GpuDevice, image: &ImageView<'_>) -> Result<Self, GpuError> {
        let width = image.width;
        let height = image.height;
        gpu.check_texture_size("source texture", width, height)?;

        let row_bytes = width as usize * RGBA32F_TEXEL_BYTES;
        let aligned_bytes_per_row = align_to(row_bytes as u32, COPY_ALIGNMENT);
        let mut staging = vec![0u8; aligned_bytes_per_row as usize * height as usize];
        for (y, row) in image.data.chunks_exact(row_bytes).take(height as usize).enumerate() {
            let dst = y * aligned_bytes_per_row as usize;
            staging[dst..dst + row_bytes].copy_from_slice(row);
        }

        let (texture, staging_buf) = gpu.scoped("source texture", |device| {
            let texture = device.create_texture(&wgpu::TextureDescriptor {
                label: Some("bc6h source"),
                size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba32Float,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            });
            let staging_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label:    Some("bc6h source staging"),
                contents: &staging,
                usage:    wgpu::BufferUsages::COPY_SRC,
            });
            (texture, staging_buf)
        })?;

        let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("bc6h source upload"),
        });
        encoder.copy_buffer_to_texture(
            wgpu::ImageCopyBuffer {
                buffer: &staging_buf,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(aligned_bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::ImageCopyTexture {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
        );
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(SourceTexture { texture, view, width, height })
    }
}

// ---------------------------------------------------------------------------
// TargetSet
// ---------------------------------------------------------------------------

/// The BC6H texture the quality probe decodes through.
pub struct CompressedTexture {
    pub texture: wgpu::Texture,
    pub view:    wgpu::TextureView,
}

/// Size-dependent resources for one block grid.
pub struct TargetSet {
    pub extent:      BlockExtent,
    pub layout:      StagingLayout,
    pub target:      wgpu::Texture,
    pub target_view: wgpu::TextureView,
    pub staging:     wgpu::Buffer,
    pub compressed:  Option<CompressedTexture>,
}

impl TargetSet {
    /// Allocate target, staging and (optionally) compressed texture for `extent`.
    ///
    /// Nothing is returned unless every allocation succeeded.
    pub fn new(gpu: &GpuDevice, extent: BlockExtent, with_compressed: bool) -> Result<Self, GpuError> {
        gpu.check_texture_size("compression target", extent.width, extent.height)?;
        let (texel_w, texel_h) = extent.texel_extent();
        let with_compressed = with_compressed
            && gpu.has_feature(wgpu::Features::TEXTURE_COMPRESSION_BC)
            && gpu.check_texture_size("compressed texture", texel_w, texel_h).is_ok();
        let layout = StagingLayout::for_extent(extent, COPY_ALIGNMENT);

        let (target, staging, compressed) = gpu.scoped("target set", |device| {
            let target = device.create_texture(&wgpu::TextureDescriptor {
                label: Some("bc6h block target"),
                size: wgpu::Extent3d {
                    width: extent.width,
                    height: extent.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba32Uint,
                usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            });
            let staging = device.create_buffer(&wgpu::BufferDescriptor {
                label:              Some("bc6h block staging"),
                size:               layout.byte_len(),
                usage:              wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let compressed = with_compressed.then(|| {
                let texture = device.create_texture(&wgpu::TextureDescriptor {
                    label: Some("bc6h compressed"),
                    size: wgpu::Extent3d { width: texel_w, height: texel_h, depth_or_array_layers: 1 },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: wgpu::TextureFormat::Bc6hRgbUfloat,
                    usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                    view_formats: &[],
                });
                let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
                CompressedTexture { texture, view }
            });
            (target, staging, compressed)
        })?;

        let target_view = target.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(TargetSet { extent, layout, target, target_view, staging, compressed })
    }

    /// Record the target → staging copy into `encoder`.
    pub fn encode_copy_to_staging(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &self.target,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &self.staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(self.layout.row_pitch),
                    rows_per_image: Some(self.layout.rows),
                },
            },
            wgpu::Extent3d {
                width: self.extent.width,
                height: self.extent.height,
                depth_or_array_layers: 1,
            },
        );
    }

    /// Fill the BC6H texture from tightly packed blocks. Returns `false`
    /// when this set has no compressed texture.
    pub fn write_compressed(&self, gpu: &GpuDevice, blocks: &[u8]) -> bool {
        let Some(compressed) = &self.compressed else {
            return false;
        };
        let (texel_w, texel_h) = self.extent.texel_extent();
        gpu.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &compressed.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            blocks,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(self.extent.width * BLOCK_BYTES as u32),
                rows_per_image: Some(self.extent.height),
            },
            wgpu::Extent3d { width: texel_w, height: texel_h, depth_or_array_layers: 1 },
        );
        true
    }
}
