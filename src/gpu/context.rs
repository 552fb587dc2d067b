// gpu/context.rs — `ComputeContext` on a wgpu device.
//
// Long-lived objects created once at construction:
//   - the point sampler (nearest, clamp-to-edge, no filtering)
//   - the 48-byte uniform buffer holding `KernelParams`
//   - the decode kernel, only when the quality probe is wanted and the
//     device can sample BC textures
//
// Each dispatch builds its bind group from the caller's source texture and
// target set, records one compute pass (bracketed by timestamp writes when
// a query slot is given), resolves the slot, and submits.

use log::warn;

use crate::context::{ComputeContext, DispatchPass};
use crate::gpu::decode::DecodeKernel;
use crate::gpu::device::{GpuDevice, GpuError};
use crate::gpu::kernel::{CompressKernel, KernelParams, Preset};
use crate::gpu::queries::TimestampQueries;
use crate::gpu::targets::{SourceTexture, TargetSet, COPY_ALIGNMENT};
use crate::gpu::wait_for_map;
use crate::image::{BlockExtent, ImageView};
use crate::readback::StagingView;
use crate::timing::TimestampSample;

pub struct WgpuContext {
    decoder:        Option<DecodeKernel>,
    params_buffer:  wgpu::Buffer,
    sampler:        wgpu::Sampler,
    // Declared last: everything above must be dropped before the device.
    gpu:            GpuDevice,
}

impl WgpuContext {
    /// Wrap `gpu`, creating the sampler, parameter buffer and (when
    /// `with_decoder` is set and BC sampling is available) the decode kernel.
    pub fn new(gpu: GpuDevice, with_decoder: bool) -> Result<Self, GpuError> {
        let (sampler, params_buffer) = gpu.scoped("sampler and parameter buffer", |device| {
            let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
                label:          Some("bc6h point sampler"),
                address_mode_u: wgpu::AddressMode::ClampToEdge,
                address_mode_v: wgpu::AddressMode::ClampToEdge,
                address_mode_w: wgpu::AddressMode::ClampToEdge,
                mag_filter:     wgpu::FilterMode::Nearest,
                min_filter:     wgpu::FilterMode::Nearest,
                mipmap_filter:  wgpu::FilterMode::Nearest,
                ..Default::default()
            });
            let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label:              Some("bc6h params"),
                size:               std::mem::size_of::<KernelParams>() as u64,
                usage:              wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            (sampler, params_buffer)
        })?;

        let decoder = if !with_decoder {
            None
        } else if gpu.has_feature(wgpu::Features::TEXTURE_COMPRESSION_BC) {
            Some(DecodeKernel::new(&gpu)?)
        } else {
            warn!("quality measurement requested but {} cannot sample BC textures", gpu.adapter_info);
            None
        };

        Ok(WgpuContext { decoder, params_buffer, sampler, gpu })
    }
}

impl ComputeContext for WgpuContext {
    type Kernel = CompressKernel;
    type Source = SourceTexture;
    type Targets = TargetSet;
    type Queries = TimestampQueries;

    fn row_alignment(&self) -> u32 {
        COPY_ALIGNMENT
    }

    fn bind_kernel(&mut self, preset: Preset) -> Result<CompressKernel, GpuError> {
        CompressKernel::new(&self.gpu, preset)
    }

    fn create_queries(&mut self, depth: usize) -> Result<TimestampQueries, GpuError> {
        TimestampQueries::new(&self.gpu, depth)
    }

    fn upload_source(&mut self, image: &ImageView<'_>) -> Result<SourceTexture, GpuError> {
        SourceTexture::upload(&self.gpu, image)
    }

    fn create_targets(&mut self, extent: BlockExtent) -> Result<TargetSet, GpuError> {
        TargetSet::new(&self.gpu, extent, self.decoder.is_some())
    }

    fn write_params(&mut self, params: &KernelParams) -> Result<(), GpuError> {
        self.gpu.queue.write_buffer(&self.params_buffer, 0, bytemuck::bytes_of(params));
        Ok(())
    }

    fn dispatch(&mut self, pass: DispatchPass<'_, Self>) -> Result<(), GpuError> {
        let device = &self.gpu.device;
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label:  Some("bc6h compress BG"),
            layout: &pass.kernel.bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(&pass.source.view) },
                wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::Sampler(&self.sampler) },
                wgpu::BindGroupEntry { binding: 2, resource: wgpu::BindingResource::TextureView(&pass.targets.target_view) },
                wgpu::BindGroupEntry { binding: 3, resource: self.params_buffer.as_entire_binding() },
            ],
        });

        let mut encoder = device.create_command_encoder(
            &wgpu::CommandEncoderDescriptor { label: Some("bc6h compress") },
        );
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label:            Some(pass.kernel.preset.label()),
                timestamp_writes: pass.timing.map(|(queries, slot)| queries.pass_writes(slot)),
            });
            cpass.set_pipeline(&pass.kernel.pipeline);
            cpass.set_bind_group(0, &bind_group, &[]);
            let [x, y, z] = pass.workgroups;
            cpass.dispatch_workgroups(x, y, z);
        }
        if let Some((queries, slot)) = pass.timing {
            queries.encode_resolve(&mut encoder, slot);
        }
        self.gpu.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn read_back<R>(
        &mut self,
        targets: &TargetSet,
        read: impl FnOnce(StagingView<'_>) -> R,
    ) -> Result<R, GpuError> {
        let mut encoder = self.gpu.device.create_command_encoder(
            &wgpu::CommandEncoderDescriptor { label: Some("bc6h readback") },
        );
        targets.encode_copy_to_staging(&mut encoder);
        self.gpu.queue.submit(std::iter::once(encoder.finish()));

        let slice = targets.staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        wait_for_map(&self.gpu.device, &rx, false)?;

        let result = {
            let mapped = slice.get_mapped_range();
            read(StagingView {
                bytes:     &mapped,
                row_pitch: targets.layout.row_pitch,
                rows:      targets.layout.rows,
            })
        };
        targets.staging.unmap();
        Ok(result)
    }

    fn read_timestamps(
        &mut self,
        queries: &TimestampQueries,
        slot: usize,
    ) -> Result<TimestampSample, GpuError> {
        queries.read(&self.gpu, slot)
    }

    fn decode_blocks(
        &mut self,
        targets: &TargetSet,
        blocks: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<Vec<[f32; 4]>>, GpuError> {
        let Some(decoder) = &self.decoder else {
            return Ok(None);
        };
        if !targets.write_compressed(&self.gpu, blocks) {
            return Ok(None);
        }
        decoder.decode(&self.gpu, targets, width, height)
    }
}
