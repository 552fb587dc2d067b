// context.rs — The seam between the compression session and a GPU backend.
//
// `Compressor` drives a compression through these operations only; it never
// names a wgpu type. `gpu::WgpuContext` implements the trait on a real
// device, and tests implement it in memory to exercise the orchestration
// (resize tracking, timing ring, layout checks, failure paths) without one.
//
// Resources are associated types, so each backend decides what a kernel,
// a source upload, a target set or a query ring actually is. The session
// stores them and hands them back by reference.

use crate::gpu::device::GpuError;
use crate::gpu::kernel::{KernelParams, Preset};
use crate::image::{BlockExtent, ImageView};
use crate::readback::StagingView;
use crate::timing::TimestampSample;

/// One compression dispatch, fully described.
pub struct DispatchPass<'a, C: ComputeContext + ?Sized> {
    pub kernel:     &'a C::Kernel,
    pub source:     &'a C::Source,
    pub targets:    &'a C::Targets,
    /// Workgroup counts, see `WorkgroupSize::compress_grid`.
    pub workgroups: [u32; 3],
    /// Query ring and slot to bracket the dispatch with, when timing is on.
    pub timing:     Option<(&'a C::Queries, usize)>,
}

pub trait ComputeContext {
    type Kernel;
    type Source;
    type Targets;
    type Queries;

    /// Row pitch granularity of this backend's staging buffers.
    fn row_alignment(&self) -> u32;

    fn bind_kernel(&mut self, preset: Preset) -> Result<Self::Kernel, GpuError>;

    /// Query ring with `depth` begin/end pairs.
    fn create_queries(&mut self, depth: usize) -> Result<Self::Queries, GpuError>;

    /// Make an RGBA32F image readable by the kernel.
    fn upload_source(&mut self, image: &ImageView<'_>) -> Result<Self::Source, GpuError>;

    /// Allocate the target and staging resources for a block grid.
    fn create_targets(&mut self, extent: BlockExtent) -> Result<Self::Targets, GpuError>;

    /// Update the parameter block bound to the next dispatch.
    fn write_params(&mut self, params: &KernelParams) -> Result<(), GpuError>;

    fn dispatch(&mut self, pass: DispatchPass<'_, Self>) -> Result<(), GpuError>;

    /// Copy the targets into staging, wait, and hand the mapped bytes to `read`.
    fn read_back<R>(
        &mut self,
        targets: &Self::Targets,
        read: impl FnOnce(StagingView<'_>) -> R,
    ) -> Result<R, GpuError>;

    /// Wait for and return the timestamps recorded into `slot`.
    fn read_timestamps(
        &mut self,
        queries: &Self::Queries,
        slot: usize,
    ) -> Result<TimestampSample, GpuError>;

    /// Decode tightly packed BC6H `blocks` back to linear RGBA, cropped to
    /// `width`×`height`. Backends that cannot decode return `Ok(None)`.
    fn decode_blocks(
        &mut self,
        _targets: &Self::Targets,
        _blocks: &[u8],
        _width: u32,
        _height: u32,
    ) -> Result<Option<Vec<[f32; 4]>>, GpuError> {
        Ok(None)
    }
}
