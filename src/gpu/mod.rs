// gpu/mod.rs — wgpu backend for the compressor.
//
// Everything that touches wgpu lives under this module. The orchestrator in
// `compressor.rs` only sees the `ComputeContext` trait; `WgpuContext` is the
// implementation that maps each trait operation onto wgpu objects:
//
//   bind_kernel      → kernel::CompressKernel   (pipeline per preset)
//   upload_source    → targets::SourceTexture   (RGBA32F sampled texture)
//   create_targets   → targets::TargetSet       (storage target + staging)
//   create_queries   → queries::TimestampQueries
//   decode_blocks    → decode::DecodeKernel     (quality probe only)

pub mod context;
pub mod decode;
pub mod device;
pub mod kernel;
pub mod queries;
pub mod targets;

pub use context::WgpuContext;
pub use device::{DeviceProfile, FeatureRequest, GpuDevice, GpuError, WorkgroupSize};
pub use kernel::{CompressKernel, KernelParams, Preset};

/// Block until a `map_async` callback reports back through `rx`.
///
/// Bulk readbacks wait with `Maintain::Wait`. The timing ring passes
/// `spin = true` and busy-polls with `Maintain::Poll` instead.
pub(crate) fn wait_for_map(
    device: &wgpu::Device,
    rx: &std::sync::mpsc::Receiver<Result<(), wgpu::BufferAsyncError>>,
    spin: bool,
) -> Result<(), GpuError> {
    use std::sync::mpsc::TryRecvError;

    loop {
        device.poll(if spin { wgpu::Maintain::Poll } else { wgpu::Maintain::Wait });
        match rx.try_recv() {
            Ok(result) => return result.map_err(GpuError::from),
            Err(TryRecvError::Empty) => std::hint::spin_loop(),
            Err(TryRecvError::Disconnected) => return Err(GpuError::MapCallbackLost),
        }
    }
}
