// realtime-bc6h: GPU BC6H compressor for real-time HDR content
//
// Takes linear RGBA32F images and produces BC6H (mode 11, unsigned) blocks
// with a wgpu compute kernel, one image per call, reusing GPU targets across
// calls of the same size.

pub mod image;
pub mod timing;
pub mod readback;
pub mod context;
pub mod quality;
pub mod compressor;
pub mod ffi;

pub mod gpu;

pub use compressor::{CompressError, Compressor, CompressorConfig, GpuCompressor};
pub use context::{ComputeContext, DispatchPass};
pub use gpu::{DeviceProfile, GpuError, Preset};
pub use image::{BlockBc6h, BlockExtent, Image, ImageFormat, ImageView};
pub use quality::QualityReport;
