// gpu/kernel.rs — Kernel selector: one compute pipeline per preset.
//
// Both presets share `bc6h_common.wgsl` (bindings, parameter block, mode 11
// encoder) and differ only in their `compress` entry point:
//
//   Quality  tries several endpoint insets per block, keeps the best
//   Speed    single inset, roughly 5× less ALU per block
//
// BINDINGS (group 0):
//   0  source      texture_2d<f32>               RGBA32F, unfilterable
//   1  sampler     sampler                       point, clamp-to-edge
//   2  target      texture_storage_2d<rgba32uint, write>  one texel per block
//   3  params      uniform KernelParams          48 bytes

use crate::compressor::CompressorConfig;
use crate::gpu::device::{GpuDevice, GpuError, WorkgroupSize};
use crate::image::BlockExtent;

const COMMON_WGSL: &str = include_str!("../shaders/bc6h_common.wgsl");
const QUALITY_WGSL: &str = include_str!("../shaders/compress_quality.wgsl");
const SPEED_WGSL: &str = include_str!("../shaders/compress_speed.wgsl");

pub const ENTRY_POINT: &str = "compress";

/// Which compression kernel to bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Preset {
    #[default]
    Quality,
    Speed,
}

impl Preset {
    /// Full WGSL template (common code + entry point) for this preset.
    pub fn shader_template(self) -> String {
        let entry = match self {
            Preset::Quality => QUALITY_WGSL,
            Preset::Speed => SPEED_WGSL,
        };
        format!("{COMMON_WGSL}\n{entry}")
    }

    pub fn label(self) -> &'static str {
        match self {
            Preset::Quality => "bc6h compress (quality)",
            Preset::Speed => "bc6h compress (speed)",
        }
    }
}

impl TryFrom<u32> for Preset {
    type Error = u32;

    fn try_from(tag: u32) -> Result<Self, u32> {
        match tag {
            0 => Ok(Preset::Quality),
            1 => Ok(Preset::Speed),
            other => Err(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Parameter block (must match WGSL struct Params exactly)
// ---------------------------------------------------------------------------

/// Per-dispatch constants.
///
/// Layout (std140-compatible, 48 bytes):
///   offset  0  texture_size_in_blocks  vec2<u32>
///   offset  8  image_size_rcp          vec2<f32>
///   offset 16  texel_bias              vec2<f32>
///   offset 24  texel_scale             f32
///   offset 28  exposure                f32
///   offset 32  blit_mode               u32
///   offset 36  padding                 3 × u32
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct KernelParams {
    pub texture_size_in_blocks: [u32; 2],
    pub image_size_rcp:         [f32; 2],
    pub texel_bias:             [f32; 2],
    pub texel_scale:            f32,
    pub exposure:               f32,
    pub blit_mode:              u32,
    pub _pad:                   [u32; 3],
}

impl KernelParams {
    /// Parameters for compressing a `width`×`height` source.
    ///
    /// `exposure` is the exponential of the configured stored exposure.
    pub fn for_source(width: u32, height: u32, config: &CompressorConfig) -> Self {
        let extent = BlockExtent::for_texels(width, height);
        KernelParams {
            texture_size_in_blocks: [extent.width, extent.height],
            image_size_rcp:         [1.0 / width.max(1) as f32, 1.0 / height.max(1) as f32],
            texel_bias:             config.texel_bias,
            texel_scale:            config.texel_scale,
            exposure:               config.exposure.exp(),
            blit_mode:              config.blit_mode,
            _pad:                   [0; 3],
        }
    }
}

// ---------------------------------------------------------------------------
// CompressKernel
// ---------------------------------------------------------------------------

/// A compiled compression pipeline and its bind group layout.
pub struct CompressKernel {
    pub preset: Preset,
    pub(crate) pipeline: wgpu::ComputePipeline,
    pub(crate) bgl:      wgpu::BindGroupLayout,
}

impl CompressKernel {
    pub const WORKGROUP: WorkgroupSize = WorkgroupSize::BLOCKS_8X8;

    /// Compile the pipeline for `preset`. Shader or layout errors come back
    /// as `GpuError::Allocation`.
    pub fn new(gpu: &GpuDevice, preset: Preset) -> Result<Self, GpuError> {
        let shader_src = Self::WORKGROUP.specialise(&preset.shader_template());

        gpu.scoped("compression kernel", |device| {
            let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label:  Some(preset.label()),
                source: wgpu::ShaderSource::Wgsl(shader_src.into()),
            });

            let bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("bc6h compress BGL"),
                entries: &[
                    // 0 — source texture
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
                    // 1 — point sampler
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
                        count: None,
                    },
                    // 2 — block target (write-only storage)
                    wgpu::BindGroupLayoutEntry {
                        binding: 2,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::StorageTexture {
                            access: wgpu::StorageTextureAccess::WriteOnly,
                            format: wgpu::TextureFormat::Rgba32Uint,
                            view_dimension: wgpu::TextureViewDimension::D2,
                        },
                        count: None,
                    },
                    // 3 — params uniform
                    wgpu::BindGroupLayoutEntry {
                        binding: 3,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: wgpu::BufferSize::new(
                                std::mem::size_of::<KernelParams>() as u64,
                            ),
                        },
                        count: None,
                    },
                ],
            });

            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("bc6h compress pipeline layout"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });

            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label:               Some(preset.label()),
                layout:              Some(&pipeline_layout),
                module:              &shader,
                entry_point:         ENTRY_POINT,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache:               None,
            });

            CompressKernel { preset, pipeline, bgl }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::test_support::run_gpu_test_in_subprocess;

    #[test]
    fn test_params_layout_is_48_bytes() {
        assert_eq!(std::mem::size_of::<KernelParams>(), 48);
        assert_eq!(std::mem::align_of::<KernelParams>(), 4);
    }

    #[test]
    fn test_params_for_source() {
        let config = CompressorConfig::default();
        let params = KernelParams::for_source(17, 15, &config);
        assert_eq!(params.texture_size_in_blocks, [5, 4]);
        assert!((params.image_size_rcp[0] - 1.0 / 17.0).abs() < 1e-7);
        assert!((params.image_size_rcp[1] - 1.0 / 15.0).abs() < 1e-7);
        assert_eq!(params.texel_bias, [0.0, 0.0]);
        assert_eq!(params.texel_scale, 1.0);
        assert_eq!(params.exposure, 1.0);
        assert_eq!(params.blit_mode, 1);
    }

    #[test]
    fn test_params_forward_knobs() {
        let config = CompressorConfig {
            texel_bias: [0.5, -0.25],
            texel_scale: 2.0,
            exposure: 1.0,
            blit_mode: 3,
            ..CompressorConfig::default()
        };
        let params = KernelParams::for_source(16, 16, &config);
        assert_eq!(params.texel_bias, [0.5, -0.25]);
        assert_eq!(params.texel_scale, 2.0);
        assert!((params.exposure - std::f32::consts::E).abs() < 1e-6);
        assert_eq!(params.blit_mode, 3);
    }

    #[test]
    fn test_shader_templates() {
        for preset in [Preset::Quality, Preset::Speed] {
            let src = CompressKernel::WORKGROUP.specialise(&preset.shader_template());
            assert!(src.contains("fn encode_mode11"));
            assert!(src.contains("fn compress("));
            assert!(src.contains("@workgroup_size(8, 8, 1)"));
            assert!(!src.contains("{{WG_"));
        }
        assert!(Preset::Quality.shader_template().contains("INSETS"));
        assert!(!Preset::Speed.shader_template().contains("INSETS"));
    }

    #[test]
    fn test_preset_tags() {
        assert_eq!(Preset::try_from(0), Ok(Preset::Quality));
        assert_eq!(Preset::try_from(1), Ok(Preset::Speed));
        assert_eq!(Preset::try_from(2), Err(2));
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_both_presets_compile() {
        let gpu = GpuDevice::new().unwrap();
        for preset in [Preset::Quality, Preset::Speed] {
            let kernel = CompressKernel::new(&gpu, preset)
                .unwrap_or_else(|e| panic!("{preset:?} kernel failed to build: {e}"));
            assert_eq!(kernel.preset, preset);
        }
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_both_presets_compile() {
        let out = run_gpu_test_in_subprocess("gpu::kernel::tests::inner_both_presets_compile");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }
}
