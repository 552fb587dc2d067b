// gpu/device.rs — wgpu device bring-up for the BC6H compressor.
//
// Responsibilities:
//   - Enumerate adapters on the primary backends (Vulkan, Metal, DX12) and
//     pick one that supports the features the compressor was configured
//     for (timestamp queries, BC texture sampling).
//   - Expose a `DeviceProfile` that selects adapter preference and the
//     limits requested from the device.
//   - Provide `WorkgroupSize`, the fixed 8×8 block tile each compute
//     kernel is specialised for, and the dispatch arithmetic that goes
//     with it.
//   - Turn wgpu's out-of-band validation / OOM errors into `GpuError`
//     values via error scopes, so allocation failures during a resize
//     come back as a `Result` instead of hitting the uncaptured handler.
//
// ADAPTER SELECTION:
// `request_adapter` with a power preference can pick a software rasterizer
// when one is listed first. We enumerate explicitly, drop adapters missing
// a required feature, and rank the rest by device type for the profile:
//
//   rank  Native          LowPower
//   0     DiscreteGpu     IntegratedGpu
//   1     IntegratedGpu   DiscreteGpu
//   2     VirtualGpu / Other
//   3     Cpu  (software, last resort, logged)
//
// NEW RUST CONCEPTS:
// - `pollster::block_on`: runs wgpu's async adapter/device/error-scope
//   futures to completion on the calling thread.
// - `thiserror::Error` derive: Display + std::error::Error + `#[from]`
//   conversions generated from attributes.
// - Field drop order: `_instance` is declared last so it outlives the
//   device and queue.

use std::fmt;

use log::{info, warn};
use thiserror::Error;

use crate::image::{div_round_up, BC_BLOCK_SIZE};

/// Hardware profile controlling adapter preference and requested limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceProfile {
    /// Prefer a discrete GPU and request wgpu's default limits.
    #[default]
    Native,
    /// Prefer an integrated GPU and cap limits to what small mobile/embedded
    /// parts report, so oversize images are rejected at allocation time.
    LowPower,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::LowPower => write!(f, "LowPower (capped limits)"),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkgroupSize
// ---------------------------------------------------------------------------

/// A 2D compute workgroup, baked into WGSL through `{{WG_X}}`/`{{WG_Y}}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    /// One invocation per BC block, 8×8 blocks (32×32 texels) per group.
    pub const BLOCKS_8X8: WorkgroupSize = WorkgroupSize { x: 8, y: 8 };

    /// Total invocations per workgroup (x * y).
    pub fn total(&self) -> u32 {
        self.x * self.y
    }

    /// Substitute the workgroup placeholders in a WGSL template.
    pub fn specialise(&self, template: &str) -> String {
        template
            .replace("{{WG_X}}", &self.x.to_string())
            .replace("{{WG_Y}}", &self.y.to_string())
    }

    /// Workgroups needed to give every element of a `w`×`h` grid one invocation.
    pub fn dispatch_size(&self, w: u32, h: u32) -> (u32, u32) {
        (div_round_up(w, self.x), div_round_up(h, self.y))
    }

    /// Workgroup grid for compressing a `texel_w`×`texel_h` image, one
    /// invocation per 4×4 block: `ceil(texels / (4 × workgroup))` per axis.
    pub fn compress_grid(&self, texel_w: u32, texel_h: u32) -> [u32; 3] {
        [
            div_round_up(texel_w, BC_BLOCK_SIZE * self.x),
            div_round_up(texel_h, BC_BLOCK_SIZE * self.y),
            1,
        ]
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
    }
}

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

/// Device features to ask for: `required` ones fail init when missing,
/// `optional` ones are enabled only when the adapter has them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureRequest {
    pub required: wgpu::Features,
    pub optional: wgpu::Features,
}

impl Default for FeatureRequest {
    fn default() -> Self {
        FeatureRequest {
            required: wgpu::Features::empty(),
            optional: wgpu::Features::empty(),
        }
    }
}

impl FeatureRequest {
    /// Features to enable on an adapter offering `available`.
    pub fn resolve(&self, available: wgpu::Features) -> Result<wgpu::Features, GpuError> {
        let missing = self.required.difference(available);
        if !missing.is_empty() {
            return Err(GpuError::MissingFeatures(missing));
        }
        Ok(self.required | (self.optional & available))
    }
}

/// Cached adapter information for logging and debugging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
    pub driver: String,
}

impl From<&wgpu::AdapterInfo> for AdapterInfo {
    fn from(raw: &wgpu::AdapterInfo) -> Self {
        AdapterInfo {
            name: raw.name.clone(),
            device_type: raw.device_type,
            backend: raw.backend,
            driver: raw.driver.clone(),
        }
    }
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)?;
        if !self.driver.is_empty() {
            write!(f, " driver {}", self.driver)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GpuDevice
// ---------------------------------------------------------------------------

/// Adapter, device, queue and the features actually enabled on them.
///
/// # Field drop order
/// Fields drop top to bottom. `_instance` is last so the instance outlives
/// every device-level object created from it.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: DeviceProfile,
    pub adapter_info: AdapterInfo,
    pub features: wgpu::Features,
    pub limits: wgpu::Limits,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Native profile, no extra features.
    pub fn new() -> Result<Self, GpuError> {
        Self::new_with_profile(DeviceProfile::Native, FeatureRequest::default())
    }

    pub fn new_with_profile(
        profile: DeviceProfile,
        features: FeatureRequest,
    ) -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async(profile, features))
    }

    async fn init_async(profile: DeviceProfile, request: FeatureRequest) -> Result<Self, GpuError> {
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
        } else {
            wgpu::InstanceFlags::empty()
        };
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            flags,
            ..Default::default()
        });

        let mut adapters = instance.enumerate_adapters(wgpu::Backends::PRIMARY);
        if adapters.is_empty() {
            return Err(GpuError::NoSuitableAdapter);
        }
        for adapter in &adapters {
            info!("adapter: {}", AdapterInfo::from(&adapter.get_info()));
        }

        let best = adapters
            .iter()
            .enumerate()
            .filter(|(_, a)| request.resolve(a.features()).is_ok())
            .min_by_key(|(_, a)| adapter_rank(a.get_info().device_type, profile))
            .map(|(i, _)| i);

        let adapter = match best {
            Some(i) => adapters.swap_remove(i),
            None => {
                // Report what the most preferred adapter lacks.
                let missing = adapters
                    .iter()
                    .min_by_key(|a| adapter_rank(a.get_info().device_type, profile))
                    .map(|a| request.required.difference(a.features()))
                    .unwrap_or(request.required);
                return Err(GpuError::MissingFeatures(missing));
            }
        };

        let adapter_info = AdapterInfo::from(&adapter.get_info());
        if adapter_info.device_type == wgpu::DeviceType::Cpu {
            warn!("only a software adapter is usable: {adapter_info}");
        }
        info!("selected adapter: {adapter_info} [{profile}]");

        let features = request.resolve(adapter.features())?;
        let limits = limits_for_profile(profile);

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("realtime-bc6h"),
                    required_features: features,
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await?;

        Ok(GpuDevice {
            device,
            queue,
            profile,
            adapter_info,
            features,
            limits,
            _instance: instance,
        })
    }

    pub fn has_feature(&self, feature: wgpu::Features) -> bool {
        self.features.contains(feature)
    }

    /// Run `create` inside validation + out-of-memory error scopes.
    ///
    /// Whatever `create` returns is dropped if either scope caught an error.
    pub fn scoped<T>(
        &self,
        what: &'static str,
        create: impl FnOnce(&wgpu::Device) -> T,
    ) -> Result<T, GpuError> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = create(&self.device);
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        match validation.or(out_of_memory) {
            Some(err) => Err(GpuError::Allocation {
                what,
                message: err.to_string(),
            }),
            None => Ok(value),
        }
    }

    /// Reject 2D textures the device cannot hold before asking wgpu for them.
    pub fn check_texture_size(&self, what: &'static str, width: u32, height: u32) -> Result<(), GpuError> {
        let max = self.limits.max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(GpuError::TextureSize { what, width, height, max });
        }
        Ok(())
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice {{ adapter: {}, profile: {}, features: {:?} }}",
            self.adapter_info, self.profile, self.features
        )
    }
}

// ============================================================
// Selection and limits helpers
// ============================================================

/// Lower is better. Software adapters always rank last.
fn adapter_rank(device_type: wgpu::DeviceType, profile: DeviceProfile) -> u8 {
    use wgpu::DeviceType::*;
    match (device_type, profile) {
        (DiscreteGpu, DeviceProfile::Native) | (IntegratedGpu, DeviceProfile::LowPower) => 0,
        (IntegratedGpu, DeviceProfile::Native) | (DiscreteGpu, DeviceProfile::LowPower) => 1,
        (VirtualGpu | Other, _) => 2,
        (Cpu, _) => 3,
    }
}

fn limits_for_profile(profile: DeviceProfile) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default(),
        DeviceProfile::LowPower => wgpu::Limits {
            max_texture_dimension_2d: 4096,
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            max_storage_buffer_binding_size: 128 << 20,
            ..wgpu::Limits::default()
        },
    }
}

// ============================================================
// Error type
// ============================================================

/// Errors raised by the wgpu backend.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("no GPU adapter found on the primary backends")]
    NoSuitableAdapter,
    #[error("adapter lacks required feature(s) {0:?}")]
    MissingFeatures(wgpu::Features),
    #[error("device request failed: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),
    #[error("creating {what} failed: {message}")]
    Allocation { what: &'static str, message: String },
    #[error("{what} of {width}×{height} is outside the device limit of {max}")]
    TextureSize {
        what: &'static str,
        width: u32,
        height: u32,
        max: u32,
    },
    #[error("buffer mapping failed: {0}")]
    Map(#[from] wgpu::BufferAsyncError),
    #[error("buffer map callback was dropped before it completed")]
    MapCallbackLost,
}

// ============================================================
// Tests
// ============================================================
