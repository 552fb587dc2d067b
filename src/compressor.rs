// compressor.rs — The compression session.
//
// `Compressor` owns a compute context and everything built on it, and turns
// one RGBA32F image into BC6H blocks per `compress` call:
//
//   1. lock the session (one compression at a time)
//   2. check the source
//   3. upload the source and write the parameter block
//   4. rebuild targets if the block grid changed
//   5. [begin timestamp] dispatch [end timestamp]
//   6. copy back, validate the staging layout, strip padding
//   7. advance the frame id, read the timestamp slot written one lap ago,
//      drop the per-call source upload
//
// STATE
// ─────
// Everything mutable sits behind one Mutex in `Session`. The published GPU
// time is kept outside it in an AtomicU64 (f64 bits) so it can be read
// while a compression is running.
//
// RELEASE
// ───────
// `release` drops targets, queries, kernel and context, in that order, and
// leaves `None` behind, so a second call does nothing. A compression after
// release fails with `KernelMissing` before touching any GPU state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{info, warn};
use thiserror::Error;

use crate::context::{ComputeContext, DispatchPass};
use crate::gpu::context::WgpuContext;
use crate::gpu::device::{DeviceProfile, FeatureRequest, GpuDevice, GpuError};
use crate::gpu::kernel::{CompressKernel, KernelParams, Preset};
use crate::image::{BlockExtent, Image, ImageFormat, ImageView, UnknownFormatTag};
use crate::quality::{QualityMeter, QualityReport};
use crate::readback::{self, LayoutMismatch};
use crate::timing::{TimingRing, QUERY_RING_DEPTH};

/// Number of presentation blit modes the parameter block may select.
pub const BLIT_MODE_COUNT: u32 = 4;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Settings fixed for the lifetime of a `Compressor`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressorConfig {
    /// Kernel bound at init.
    pub preset: Preset,
    /// Adapter preference and device limits.
    pub device_profile: DeviceProfile,
    /// Forwarded to the kernel's parameter block.
    pub texel_bias: [f32; 2],
    pub texel_scale: f32,
    /// Natural-log exposure; the kernel receives `exp(exposure)`.
    pub exposure: f32,
    /// Must be below `BLIT_MODE_COUNT`.
    pub blit_mode: u32,
    /// Bracket each dispatch with timestamps and publish a running average.
    /// Requires `TIMESTAMP_QUERY`; init fails without it.
    pub gpu_timing: bool,
    /// Decode each result and compute RMSLE against the source.
    pub measure_quality: bool,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        CompressorConfig {
            preset:          Preset::Quality,
            device_profile:  DeviceProfile::Native,
            texel_bias:      [0.0, 0.0],
            texel_scale:     1.0,
            exposure:        0.0,
            blit_mode:       1,
            gpu_timing:      true,
            measure_quality: false,
        }
    }
}

impl CompressorConfig {
    pub fn validate(&self) -> Result<(), CompressError> {
        if self.blit_mode >= BLIT_MODE_COUNT {
            return Err(CompressError::InvalidConfig(format!(
                "blit_mode {} is out of range (0..{BLIT_MODE_COUNT})",
                self.blit_mode
            )));
        }
        let knobs = [self.texel_bias[0], self.texel_bias[1], self.texel_scale, self.exposure];
        if knobs.iter().any(|v| !v.is_finite()) {
            return Err(CompressError::InvalidConfig(
                "texel bias, texel scale and exposure must be finite".into(),
            ));
        }
        Ok(())
    }

    fn feature_request(&self) -> FeatureRequest {
        let mut request = FeatureRequest::default();
        if self.gpu_timing {
            request.required |= wgpu::Features::TIMESTAMP_QUERY;
        }
        if self.measure_quality {
            request.optional |= wgpu::Features::TEXTURE_COMPRESSION_BC;
        }
        request
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CompressError {
    #[error("initialization failed: {0}")]
    Init(#[source] GpuError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("unsupported source format {0}")]
    UnsupportedFormat(ImageFormat),
    #[error(transparent)]
    UnknownFormatTag(#[from] UnknownFormatTag),
    #[error("source {width}×{height} carries {actual} bytes, expected {expected}")]
    InvalidSource {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("allocating targets for {extent} failed: {source}")]
    Resize {
        extent: BlockExtent,
        #[source]
        source: GpuError,
    },
    #[error(transparent)]
    LayoutMismatch(#[from] LayoutMismatch),
    #[error("no compression kernel is bound")]
    KernelMissing,
    #[error("source upload failed: {0}")]
    Upload(#[source] GpuError),
    #[error("dispatch failed: {0}")]
    Dispatch(#[source] GpuError),
    #[error("readback failed: {0}")]
    Readback(#[source] GpuError),
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct CachedTargets<T> {
    extent: BlockExtent,
    resources: T,
}

// Field order is teardown order.
struct Session<C: ComputeContext> {
    targets: Option<CachedTargets<C::Targets>>,
    queries: Option<C::Queries>,
    kernel: Option<C::Kernel>,
    context: Option<C>,
    ring: TimingRing,
    quality: Option<QualityMeter>,
}

/// Reuse the cached targets when `extent` matches, otherwise build new ones.
///
/// The old set is dropped only after the new one exists; on failure it stays
/// cached and the error is returned.
fn ensure_targets<'a, C: ComputeContext>(
    context: &mut C,
    cache: &'a mut Option<CachedTargets<C::Targets>>,
    extent: BlockExtent,
) -> Result<&'a C::Targets, CompressError> {
    let cached = match cache.take() {
        Some(cached) if cached.extent == extent => cached,
        previous => match context.create_targets(extent) {
            Ok(resources) => {
                match &previous {
                    Some(old) => info!("resizing targets {} → {extent}", old.extent),
                    None => info!("allocating targets for {extent}"),
                }
                CachedTargets { extent, resources }
            }
            Err(source) => {
                *cache = previous;
                return Err(CompressError::Resize { extent, source });
            }
        },
    };
    Ok(&cache.insert(cached).resources)
}

// ---------------------------------------------------------------------------
// Compressor
// ---------------------------------------------------------------------------

/// A BC6H compressor bound to one compute context.
pub struct Compressor<C: ComputeContext> {
    config: CompressorConfig,
    session: Mutex<Session<C>>,
    compression_time_bits: AtomicU64,
    last_quality: Mutex<Option<QualityReport>>,
}

/// The compressor on a real wgpu device.
pub type GpuCompressor = Compressor<WgpuContext>;

impl Compressor<WgpuContext> {
    /// Create a device for `config.device_profile` and bind `config.preset`.
    pub fn init(config: CompressorConfig) -> Result<Self, CompressError> {
        config.validate()?;
        let gpu = GpuDevice::new_with_profile(config.device_profile, config.feature_request())
            .map_err(CompressError::Init)?;
        info!("{gpu}");
        let context = WgpuContext::new(gpu, config.measure_quality).map_err(CompressError::Init)?;
        Self::with_context(context, config)
    }
}

impl<C: ComputeContext> Compressor<C> {
    /// Bind the kernel (and the timing ring, when enabled) on `context`.
    pub fn with_context(mut context: C, config: CompressorConfig) -> Result<Self, CompressError> {
        config.validate()?;
        let kernel = context.bind_kernel(config.preset).map_err(CompressError::Init)?;
        let queries = if config.gpu_timing {
            Some(context.create_queries(QUERY_RING_DEPTH).map_err(CompressError::Init)?)
        } else {
            None
        };
        let quality = config.measure_quality.then(|| QualityMeter::new(config.preset));
        info!(
            "compressor ready: {:?} preset, timing {}, quality probe {}",
            config.preset,
            if config.gpu_timing { "on" } else { "off" },
            if config.measure_quality { "on" } else { "off" },
        );

        Ok(Compressor {
            config,
            session: Mutex::new(Session {
                targets: None,
                queries,
                kernel: Some(kernel),
                context: Some(context),
                ring: TimingRing::new(),
                quality,
            }),
            compression_time_bits: AtomicU64::new(0f64.to_bits()),
            last_quality: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &CompressorConfig {
        &self.config
    }

    fn lock_session(&self) -> MutexGuard<'_, Session<C>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Compress `source` into `destination`.
    ///
    /// On success `destination` holds `ceil(w/4) × ceil(h/4)` blocks of 16
    /// bytes, with its width and height set to the block grid. On a staging
    /// layout mismatch it holds the same amount of 0xFF bytes and the call
    /// fails. On any other failure `destination` is left untouched.
    pub fn compress(&self, source: ImageView<'_>, destination: &mut Image) -> Result<(), CompressError> {
        let mut guard = self.lock_session();
        let Session { targets, queries, kernel, context, ring, quality } = &mut *guard;
        let (Some(kernel), Some(context)) = (kernel.as_ref(), context.as_mut()) else {
            return Err(CompressError::KernelMissing);
        };

        if source.format != ImageFormat::Rgba32F {
            return Err(CompressError::UnsupportedFormat(source.format));
        }
        let expected = source.expected_data_size();
        if source.width == 0 || source.height == 0 || source.data.len() != expected {
            return Err(CompressError::InvalidSource {
                width: source.width,
                height: source.height,
                expected,
                actual: source.data.len(),
            });
        }

        // Upload before touching the target cache so a failed upload leaves
        // the cached targets as they were.
        let source_texture = context.upload_source(&source).map_err(CompressError::Upload)?;
        let params = KernelParams::for_source(source.width, source.height, &self.config);
        context.write_params(&params).map_err(CompressError::Dispatch)?;

        let extent = source.block_extent();
        let targets = ensure_targets(context, targets, extent)?;

        let timing = queries.as_ref().map(|q| (q, ring.begin()));
        let slot = timing.map(|(_, slot)| slot);
        let dispatched = context.dispatch(DispatchPass {
            kernel,
            source: &source_texture,
            targets,
            workgroups: CompressKernel::WORKGROUP.compress_grid(source.width, source.height),
            timing,
        });
        if let Err(err) = dispatched {
            if let Some(s) = slot {
                ring.abandon(s);
            }
            return Err(CompressError::Dispatch(err));
        }
        if let Some(s) = slot {
            ring.end(s);
        }

        let alignment = context.row_alignment();
        let extracted = context
            .read_back(targets, |view| readback::extract_blocks(&view, extent, alignment))
            .map_err(CompressError::Readback);
        let blocks = match extracted {
            Ok(Ok(blocks)) => blocks,
            Ok(Err(mismatch)) => {
                warn!("{mismatch}; filling destination with sentinel");
                *destination = Image::new(
                    ImageFormat::Bc6h,
                    extent.width,
                    extent.height,
                    readback::sentinel_blocks(extent),
                );
                if let Some(s) = slot {
                    ring.abandon(s);
                }
                return Err(mismatch.into());
            }
            Err(err) => {
                if let Some(s) = slot {
                    ring.abandon(s);
                }
                return Err(err);
            }
        };

        if let Some(meter) = quality {
            match meter.measure(context, targets, &source, &blocks) {
                Ok(Some(report)) => {
                    *self.last_quality.lock().unwrap_or_else(PoisonError::into_inner) = Some(report);
                }
                Ok(None) => {}
                Err(err) => warn!("quality measurement failed: {err}"),
            }
        }

        *destination = Image::new(ImageFormat::Bc6h, extent.width, extent.height, blocks);
        drop(source_texture);

        if let (Some(read_slot), Some(queries)) = (ring.advance(), queries.as_ref()) {
            match context.read_timestamps(queries, read_slot) {
                Ok(sample) => {
                    if let Some(ms) = ring.record(read_slot, sample) {
                        self.compression_time_bits.store(ms.to_bits(), Ordering::Relaxed);
                        info!("average GPU compression time {ms:.4} ms");
                    }
                }
                Err(err) => {
                    warn!("timestamp readback for slot {read_slot} failed: {err}");
                    ring.abandon(read_slot);
                }
            }
        }
        Ok(())
    }

    /// Release a buffer produced by `compress`.
    pub fn free_image(&self, image: &mut Image) {
        image.free();
    }

    /// Drop every GPU resource. Safe to call more than once.
    pub fn release(&self) {
        let mut session = self.lock_session();
        let was_live = session.context.is_some();
        session.targets = None;
        session.queries = None;
        session.kernel = None;
        session.context = None;
        if was_live {
            info!("compressor released after {} frames", session.ring.frame_id());
        }
    }

    pub fn is_released(&self) -> bool {
        self.lock_session().context.is_none()
    }

    /// Most recently published average GPU time per compression, in ms.
    /// Zero until the first average is published.
    pub fn compression_time_ms(&self) -> f64 {
        f64::from_bits(self.compression_time_bits.load(Ordering::Relaxed))
    }

    /// Completed compressions.
    pub fn frame_id(&self) -> u64 {
        self.lock_session().ring.frame_id()
    }

    /// Block grid the cached targets were built for.
    pub fn target_extent(&self) -> Option<BlockExtent> {
        self.lock_session().targets.as_ref().map(|t| t.extent)
    }

    /// Report from the most recent quality measurement.
    pub fn last_quality(&self) -> Option<QualityReport> {
        *self.last_quality.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
