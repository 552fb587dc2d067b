// quality.rs — Optional compression-error probe.
//
// After a successful compression the meter asks the backend to decode the
// new blocks back to linear RGB, then measures the error in log space,
// where HDR error is perceptually closer to uniform:
//
//   d_c   = ln(decoded_c + 1) − ln(source_c + 1)          per channel c
//   rgb   = sqrt((Σd_r² + Σd_g² + Σd_b²) / (3·w·h))
//   lum   = sqrt((0.299·Σd_r² + 0.587·Σd_g² + 0.114·Σd_b²) / (w·h))
//
// Negative source values clamp to 0 first; BC6H unsigned blocks cannot
// represent them.

use std::fmt;

use log::{info, warn};

use crate::context::ComputeContext;
use crate::gpu::device::GpuError;
use crate::gpu::kernel::Preset;
use crate::image::ImageView;

const LUMA_WEIGHTS: [f64; 3] = [0.299, 0.587, 0.114];

/// Log-space error of one compression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityReport {
    pub preset: Preset,
    pub width: u32,
    pub height: u32,
    pub rgb_rmsle: f32,
    pub lum_rmsle: f32,
}

impl fmt::Display for QualityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {}×{}: RGB RMSLE {:.5}, luminance RMSLE {:.5}",
            self.preset, self.width, self.height, self.rgb_rmsle, self.lum_rmsle
        )
    }
}

/// Root-mean-square log error between `source` (RGBA32F) and `decoded`.
///
/// Returns `(rgb, lum)`. `decoded` must hold at least `width × height`
/// texels in row-major order.
pub fn rmsle(source: &ImageView<'_>, decoded: &[[f32; 4]]) -> (f32, f32) {
    let texels = source.width as usize * source.height as usize;
    if texels == 0 {
        return (0.0, 0.0);
    }

    let mut sums = [0.0f64; 3];
    for y in 0..source.height {
        for x in 0..source.width {
            let src = source.texel_rgba32f(x, y);
            let dec = decoded[y as usize * source.width as usize + x as usize];
            for c in 0..3 {
                let d = log1p_clamped(dec[c]) - log1p_clamped(src[c]);
                sums[c] += d * d;
            }
        }
    }

    let n = texels as f64;
    let rgb = ((sums[0] + sums[1] + sums[2]) / (3.0 * n)).sqrt();
    let lum = (sums.iter().zip(LUMA_WEIGHTS).map(|(s, w)| s * w).sum::<f64>() / n).sqrt();
    (rgb as f32, lum as f32)
}

fn log1p_clamped(v: f32) -> f64 {
    (v.max(0.0) as f64).ln_1p()
}

// ---------------------------------------------------------------------------
// QualityMeter
// ---------------------------------------------------------------------------

/// Runs the decode-and-compare probe after each compression.
#[derive(Debug)]
pub struct QualityMeter {
    preset: Preset,
    unavailable_logged: bool,
}

impl QualityMeter {
    pub fn new(preset: Preset) -> Self {
        QualityMeter {
            preset,
            unavailable_logged: false,
        }
    }

    /// Measure the blocks just produced for `source`.
    ///
    /// `Ok(None)` when the backend cannot decode BC6H.
    pub fn measure<C: ComputeContext>(
        &mut self,
        context: &mut C,
        targets: &C::Targets,
        source: &ImageView<'_>,
        blocks: &[u8],
    ) -> Result<Option<QualityReport>, GpuError> {
        let decoded = context.decode_blocks(targets, blocks, source.width, source.height)?;
        let Some(decoded) = decoded else {
            if !self.unavailable_logged {
                warn!("backend cannot decode BC6H; quality measurement skipped");
                self.unavailable_logged = true;
            }
            return Ok(None);
        };

        let (rgb_rmsle, lum_rmsle) = rmsle(source, &decoded);
        let report = QualityReport {
            preset: self.preset,
            width: source.width,
            height: source.height,
            rgb_rmsle,
            lum_rmsle,
        };
        info!("{report}");
        Ok(Some(report))
    }
}
