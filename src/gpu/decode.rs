// gpu/decode.rs — BC6H → RGBA32F decode for the quality probe.
//
// The freshly compressed blocks are written into a Bc6hRgbUfloat texture
// (see `TargetSet::write_compressed`); this kernel loads every texel through
// the hardware decoder into a flat storage buffer, which is then copied to
// a mappable buffer and read back. Requires TEXTURE_COMPRESSION_BC.

use wgpu::util::DeviceExt;

use crate::gpu::device::{GpuDevice, GpuError, WorkgroupSize};
use crate::gpu::targets::TargetSet;
use crate::gpu::wait_for_map;

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct DecodeParams {
    width:  u32,
    height: u32,
    _pad:   [u32; 2],
}

pub struct DecodeKernel {
    pipeline: wgpu::ComputePipeline,
    bgl:      wgpu::BindGroupLayout,
}

impl DecodeKernel {
    const WORKGROUP: WorkgroupSize = WorkgroupSize::BLOCKS_8X8;

    pub fn new(gpu: &GpuDevice) -> Result<Self, GpuError> {
        let shader_src = Self::WORKGROUP.specialise(include_str!("../shaders/decode_bc6h.wgsl"));

        gpu.scoped("decode kernel", |device| {
            let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label:  Some("decode_bc6h.wgsl"),
                source: wgpu::ShaderSource::Wgsl(shader_src.into()),
            });

            let bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("bc6h decode BGL"),
                entries: &[
                    // 0 — BC6H texture
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Texture {
                            multisampled: false,
                            view_dimension: wgpu::TextureViewDimension::D2,
                            sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        },
                        count: None,
                    },
                    // 1 — decoded texels (storage read_write)
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Storage { read_only: false },
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                    // 2 — dimensions uniform
                    wgpu::BindGroupLayoutEntry {
                        binding: 2,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                ],
            });

            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("bc6h decode pipeline layout"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });

            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label:               Some("decode"),
                layout:              Some(&pipeline_layout),
                module:              &shader,
                entry_point:         "decode",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache:               None,
            });

            DecodeKernel { pipeline, bgl }
        })
    }

    /// Decode the top-left `width`×`height` texels of `targets`' compressed
    /// texture. `None` when the set has no compressed texture.
    pub fn decode(
        &self,
        gpu: &GpuDevice,
        targets: &TargetSet,
        width: u32,
        height: u32,
    ) -> Result<Option<Vec<[f32; 4]>>, GpuError> {
        let Some(compressed) = &targets.compressed else {
            return Ok(None);
        };
        let texel_count = width as u64 * height as u64;
        let size = texel_count * std::mem::size_of::<[f32; 4]>() as u64;
        let params = DecodeParams { width, height, _pad: [0; 2] };

        let (output, readback, params_buf) = gpu.scoped("decode buffers", |device| {
            let output = device.create_buffer(&wgpu::BufferDescriptor {
                label:              Some("bc6h decoded"),
                size,
                usage:              wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            });
            let readback = device.create_buffer(&wgpu::BufferDescriptor {
                label:              Some("bc6h decoded readback"),
                size,
                usage:              wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let params_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label:    Some("bc6h decode params"),
                contents: bytemuck::bytes_of(&params),
                usage:    wgpu::BufferUsages::UNIFORM,
            });
            (output, readback, params_buf)
        })?;

        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label:  Some("bc6h decode BG"),
            layout: &self.bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(&compressed.view) },
                wgpu::BindGroupEntry { binding: 1, resource: output.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: params_buf.as_entire_binding() },
            ],
        });

        let (wg_x, wg_y) = Self::WORKGROUP.dispatch_size(width, height);
        let mut encoder = gpu.device.create_command_encoder(
            &wgpu::CommandEncoderDescriptor { label: Some("bc6h decode") },
        );
        {
            let mut pass = encoder.begin_compute_pass(
                &wgpu::ComputePassDescriptor { label: Some("decode"), timestamp_writes: None },
            );
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(wg_x, wg_y, 1);
        }
        encoder.copy_buffer_to_buffer(&output, 0, &readback, 0, size);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let slice = readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        wait_for_map(&gpu.device, &rx, false)?;

        let texels = {
            let mapped = slice.get_mapped_range();
            mapped
                .chunks_exact(16)
                .map(bytemuck::pod_read_unaligned::<[f32; 4]>)
                .collect::<Vec<_>>()
        };
        readback.unmap();
        Ok(Some(texels))
    }
}
