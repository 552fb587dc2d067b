// tests/test_compressor.rs — Session behaviour against an in-memory backend.
//
// These run with `cargo test --test test_compressor` and need no GPU.
// `FakeContext` implements `ComputeContext` by logging every call and
// producing staging bytes on the CPU, so the tests can check what the
// compressor asks for (resizes, query slots, readbacks) and how it reacts
// when a step fails.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;

use realtime_bc6h::gpu::device::GpuError;
use realtime_bc6h::gpu::kernel::KernelParams;
use realtime_bc6h::image::{BlockExtent, ImageView, BLOCK_BYTES};
use realtime_bc6h::readback::{align_to, StagingView, SENTINEL_BYTE};
use realtime_bc6h::timing::TimestampSample;
use realtime_bc6h::{
    CompressError, Compressor, CompressorConfig, ComputeContext, DispatchPass, Image, ImageFormat,
    Preset,
};

// ===== Test double =====

#[derive(Debug, Clone, PartialEq)]
enum Call {
    BindKernel(Preset),
    CreateQueries(usize),
    Upload { width: u32, height: u32 },
    CreateTargets(BlockExtent),
    WriteParams { blit_mode: u32 },
    Dispatch { workgroups: [u32; 3], slot: Option<usize> },
    ReadBack,
    ReadTimestamps(usize),
    Decode,
}

const PADDING_BYTE: u8 = 0xEE;

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    row_alignment: u32,
    pitch_override: Option<u32>,
    fail_kernel: bool,
    fail_targets: bool,
    fail_upload: bool,
    fail_dispatch: bool,
    samples: VecDeque<TimestampSample>,
    last_source: Vec<[f32; 4]>,
}

#[derive(Clone)]
struct FakeContext {
    state: Arc<Mutex<FakeState>>,
}

struct FakeTargets {
    extent: BlockExtent,
}

fn alloc_error(what: &'static str) -> GpuError {
    GpuError::Allocation {
        what,
        message: "out of memory".into(),
    }
}

fn one_ms() -> TimestampSample {
    TimestampSample {
        begin: 5_000,
        end: 5_000 + 1_000_000,
        frequency: 1_000_000_000,
        disjoint: false,
    }
}

/// Byte `i` of block `(bx, by)` in the fake's output.
fn block_byte(bx: u32, by: u32, i: usize) -> u8 {
    (by * 31 + bx * 7 + i as u32) as u8 & 0x7F
}

impl FakeContext {
    fn new() -> Self {
        Self::with_alignment(1)
    }

    fn with_alignment(row_alignment: u32) -> Self {
        FakeContext {
            state: Arc::new(Mutex::new(FakeState {
                row_alignment,
                ..FakeState::default()
            })),
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    fn log(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

impl ComputeContext for FakeContext {
    type Kernel = Preset;
    type Source = (u32, u32);
    type Targets = FakeTargets;
    type Queries = usize;

    fn row_alignment(&self) -> u32 {
        self.state.lock().unwrap().row_alignment
    }

    fn bind_kernel(&mut self, preset: Preset) -> Result<Preset, GpuError> {
        self.log(Call::BindKernel(preset));
        if self.state.lock().unwrap().fail_kernel {
            return Err(alloc_error("compress pipeline"));
        }
        Ok(preset)
    }

    fn create_queries(&mut self, depth: usize) -> Result<usize, GpuError> {
        self.log(Call::CreateQueries(depth));
        Ok(depth)
    }

    fn upload_source(&mut self, image: &ImageView<'_>) -> Result<(u32, u32), GpuError> {
        self.log(Call::Upload { width: image.width, height: image.height });
        if self.state.lock().unwrap().fail_upload {
            return Err(alloc_error("source texture"));
        }
        let texels = (0..image.height)
            .flat_map(|y| (0..image.width).map(move |x| (x, y)))
            .map(|(x, y)| image.texel_rgba32f(x, y))
            .collect();
        self.state.lock().unwrap().last_source = texels;
        Ok((image.width, image.height))
    }

    fn create_targets(&mut self, extent: BlockExtent) -> Result<FakeTargets, GpuError> {
        self.log(Call::CreateTargets(extent));
        if self.state.lock().unwrap().fail_targets {
            return Err(alloc_error("target texture"));
        }
        Ok(FakeTargets { extent })
    }

    fn write_params(&mut self, params: &KernelParams) -> Result<(), GpuError> {
        self.log(Call::WriteParams { blit_mode: params.blit_mode });
        Ok(())
    }

    fn dispatch(&mut self, pass: DispatchPass<'_, Self>) -> Result<(), GpuError> {
        self.log(Call::Dispatch {
            workgroups: pass.workgroups,
            slot: pass.timing.map(|(_, slot)| slot),
        });
        if self.state.lock().unwrap().fail_dispatch {
            return Err(GpuError::MapCallbackLost);
        }
        Ok(())
    }

    fn read_back<R>(
        &mut self,
        targets: &FakeTargets,
        read: impl FnOnce(StagingView<'_>) -> R,
    ) -> Result<R, GpuError> {
        self.log(Call::ReadBack);
        let (alignment, pitch_override) = {
            let state = self.state.lock().unwrap();
            (state.row_alignment, state.pitch_override)
        };
        let extent = targets.extent;
        let row_bytes = extent.packed_row_bytes() as u32;
        let pitch = pitch_override.unwrap_or_else(|| align_to(row_bytes, alignment));

        let mut bytes = vec![PADDING_BYTE; pitch as usize * extent.height as usize];
        for by in 0..extent.height {
            for bx in 0..extent.width.min(pitch / BLOCK_BYTES as u32) {
                let start = by as usize * pitch as usize + bx as usize * BLOCK_BYTES;
                for i in 0..BLOCK_BYTES {
                    bytes[start + i] = block_byte(bx, by, i);
                }
            }
        }
        Ok(read(StagingView {
            bytes: &bytes,
            row_pitch: pitch,
            rows: extent.height,
        }))
    }

    fn read_timestamps(&mut self, _queries: &usize, slot: usize) -> Result<TimestampSample, GpuError> {
        self.log(Call::ReadTimestamps(slot));
        let sample = self.state.lock().unwrap().samples.pop_front();
        Ok(sample.unwrap_or_else(one_ms))
    }

    fn decode_blocks(
        &mut self,
        _targets: &FakeTargets,
        _blocks: &[u8],
        _width: u32,
        _height: u32,
    ) -> Result<Option<Vec<[f32; 4]>>, GpuError> {
        self.log(Call::Decode);
        Ok(Some(self.state.lock().unwrap().last_source.clone()))
    }
}

// ===== Helpers =====

fn untimed() -> CompressorConfig {
    CompressorConfig {
        gpu_timing: false,
        ..CompressorConfig::default()
    }
}

fn hdr_ramp(width: u32, height: u32) -> Image {
    let texels: Vec<[f32; 4]> = (0..width * height)
        .map(|i| {
            let v = i as f32 * 0.25;
            [v, v * 2.0, 100.0 - v, 1.0]
        })
        .collect();
    Image::from_rgba32f(width, height, &texels)
}

fn compressor(fake: &FakeContext, config: CompressorConfig) -> Compressor<FakeContext> {
    Compressor::with_context(fake.clone(), config).unwrap()
}

// ===== Output shape =====

#[test]
fn all_zero_16x16_compresses_to_sixteen_blocks() {
    let fake = FakeContext::new();
    let c = compressor(&fake, CompressorConfig {
        measure_quality: true,
        gpu_timing: false,
        ..CompressorConfig::default()
    });
    let src = Image::from_rgba32f(16, 16, &[[0.0; 4]; 256]);
    let mut dst = Image::default();
    c.compress(src.view(), &mut dst).unwrap();

    assert_eq!(dst.format, ImageFormat::Bc6h);
    assert_eq!((dst.width, dst.height), (4, 4));
    assert_eq!(dst.data_size(), 256);
    assert!(fake.calls().contains(&Call::Dispatch { workgroups: [1, 1, 1], slot: None }));
    let report = c.last_quality().unwrap();
    assert_eq!(report.rgb_rmsle, 0.0);
    assert_eq!(report.lum_rmsle, 0.0);
}

#[test]
fn aligned_source_yields_one_block_per_4x4() {
    let fake = FakeContext::new();
    let c = compressor(&fake, untimed());
    let mut dst = Image::default();
    c.compress(hdr_ramp(16, 16).view(), &mut dst).unwrap();

    assert_eq!(dst.format, ImageFormat::Bc6h);
    assert_eq!((dst.width, dst.height), (4, 4));
    assert_eq!(dst.data_size(), 256);
    assert_eq!(dst.data.len(), 256);
}

#[test]
fn ragged_source_rounds_up_to_whole_blocks() {
    let fake = FakeContext::new();
    let c = compressor(&fake, untimed());
    let mut dst = Image::default();
    c.compress(hdr_ramp(17, 15).view(), &mut dst).unwrap();

    assert_eq!((dst.width, dst.height), (5, 4));
    assert_eq!(dst.data.len(), 5 * 4 * BLOCK_BYTES);
}

#[test]
fn row_padding_is_stripped() {
    // 5 blocks = 80 bytes per row, padded to 256 in staging.
    let fake = FakeContext::with_alignment(256);
    let c = compressor(&fake, untimed());
    let mut dst = Image::default();
    c.compress(hdr_ramp(17, 15).view(), &mut dst).unwrap();

    assert_eq!(dst.data.len(), 320);
    assert!(!dst.data.contains(&PADDING_BYTE));
    for by in 0..4u32 {
        for bx in 0..5u32 {
            let offset = (by as usize * 5 + bx as usize) * BLOCK_BYTES;
            for i in 0..BLOCK_BYTES {
                assert_eq!(dst.data[offset + i], block_byte(bx, by, i), "block ({bx},{by}) byte {i}");
            }
        }
    }
}

#[test]
fn dispatch_covers_the_block_grid() {
    let fake = FakeContext::new();
    let c = compressor(&fake, untimed());
    let mut dst = Image::default();
    c.compress(hdr_ramp(256, 100).view(), &mut dst).unwrap();

    // 64×25 blocks over 8×8-block workgroups.
    assert!(fake.calls().contains(&Call::Dispatch { workgroups: [8, 4, 1], slot: None }));
    assert!(fake.calls().contains(&Call::WriteParams { blit_mode: 1 }));
}

// ===== Target cache =====

#[test]
fn targets_are_reused_until_the_grid_changes() {
    let fake = FakeContext::new();
    let c = compressor(&fake, untimed());
    let mut dst = Image::default();

    c.compress(hdr_ramp(16, 16).view(), &mut dst).unwrap();
    c.compress(hdr_ramp(16, 16).view(), &mut dst).unwrap();
    // Different texel size, same 4×4 block grid.
    c.compress(hdr_ramp(15, 13).view(), &mut dst).unwrap();
    assert_eq!(fake.count(|c| matches!(c, Call::CreateTargets(_))), 1);

    c.compress(hdr_ramp(32, 8).view(), &mut dst).unwrap();
    assert_eq!(fake.count(|c| matches!(c, Call::CreateTargets(_))), 2);
    assert_eq!(c.target_extent(), Some(BlockExtent::new(8, 2)));
    assert_eq!(fake.count(|c| matches!(c, Call::Upload { .. })), 4);
}

#[test]
fn failed_resize_keeps_previous_targets() {
    let fake = FakeContext::new();
    let c = compressor(&fake, untimed());
    let mut dst = Image::default();
    c.compress(hdr_ramp(16, 16).view(), &mut dst).unwrap();

    fake.state.lock().unwrap().fail_targets = true;
    let before = dst.clone();
    let err = c.compress(hdr_ramp(32, 32).view(), &mut dst).unwrap_err();
    match err {
        CompressError::Resize { extent, .. } => assert_eq!(extent, BlockExtent::new(8, 8)),
        other => panic!("expected Resize, got {other:?}"),
    }
    assert_eq!(dst, before);
    assert_eq!(c.target_extent(), Some(BlockExtent::new(4, 4)));

    // The old size still works without reallocating.
    c.compress(hdr_ramp(16, 16).view(), &mut dst).unwrap();
    assert_eq!(fake.count(|c| matches!(c, Call::CreateTargets(_))), 2);

    fake.state.lock().unwrap().fail_targets = false;
    c.compress(hdr_ramp(32, 32).view(), &mut dst).unwrap();
    assert_eq!(c.target_extent(), Some(BlockExtent::new(8, 8)));
    assert_eq!((dst.width, dst.height), (8, 8));
}

#[test]
fn failed_upload_keeps_previous_targets() {
    let fake = FakeContext::new();
    let c = compressor(&fake, untimed());
    let mut dst = Image::default();
    c.compress(hdr_ramp(16, 16).view(), &mut dst).unwrap();

    fake.state.lock().unwrap().fail_upload = true;
    let before = dst.clone();
    let err = c.compress(hdr_ramp(64, 64).view(), &mut dst).unwrap_err();
    assert!(matches!(err, CompressError::Upload(GpuError::Allocation { what: "source texture", .. })));
    assert_eq!(dst, before);
    assert_eq!(c.target_extent(), Some(BlockExtent::new(4, 4)));
    assert!(!fake.calls().contains(&Call::CreateTargets(BlockExtent::new(16, 16))));

    // Nothing was rebuilt, so the old size needs no allocation either.
    fake.state.lock().unwrap().fail_upload = false;
    c.compress(hdr_ramp(16, 16).view(), &mut dst).unwrap();
    assert_eq!(fake.count(|c| matches!(c, Call::CreateTargets(_))), 1);
}

// ===== Failure paths =====

#[test]
fn pitch_mismatch_fills_sentinel() {
    let fake = FakeContext::new();
    let c = compressor(&fake, untimed());
    fake.state.lock().unwrap().pitch_override = Some(48);

    let mut dst = Image::default();
    let err = c.compress(hdr_ramp(16, 16).view(), &mut dst).unwrap_err();
    match err {
        CompressError::LayoutMismatch(m) => {
            assert_eq!(m.expected_pitch, 64);
            assert_eq!(m.actual_pitch, 48);
        }
        other => panic!("expected LayoutMismatch, got {other:?}"),
    }
    assert_eq!((dst.width, dst.height), (4, 4));
    assert_eq!(dst.data.len(), 256);
    assert!(dst.data.iter().all(|&b| b == SENTINEL_BYTE));
}

#[test]
fn unsupported_format_leaves_destination_untouched() {
    let fake = FakeContext::new();
    let c = compressor(&fake, untimed());
    let mut dst = Image::new(ImageFormat::Bc6h, 1, 1, vec![7; 16]);
    let bytes = vec![0u8; 64];
    let src = ImageView::new(ImageFormat::Bc6h, 2, 2, &bytes);

    let err = c.compress(src, &mut dst).unwrap_err();
    assert!(matches!(err, CompressError::UnsupportedFormat(ImageFormat::Bc6h)));
    assert_eq!(dst.data, vec![7; 16]);
    assert_eq!(fake.count(|c| matches!(c, Call::Upload { .. })), 0);
}

#[test]
fn short_source_is_rejected() {
    let fake = FakeContext::new();
    let c = compressor(&fake, untimed());
    let bytes = vec![0u8; 100];
    let mut dst = Image::default();

    let err = c
        .compress(ImageView::new(ImageFormat::Rgba32F, 4, 4, &bytes), &mut dst)
        .unwrap_err();
    assert!(matches!(
        err,
        CompressError::InvalidSource { expected: 256, actual: 100, .. }
    ));

    let err = c
        .compress(ImageView::new(ImageFormat::Rgba32F, 0, 4, &[]), &mut dst)
        .unwrap_err();
    assert!(matches!(err, CompressError::InvalidSource { .. }));
    assert!(dst.data.is_empty());
}

#[test]
fn dispatch_failure_reports_and_recovers() {
    let fake = FakeContext::new();
    let c = compressor(&fake, CompressorConfig::default());
    let mut dst = Image::default();

    fake.state.lock().unwrap().fail_dispatch = true;
    assert!(matches!(
        c.compress(hdr_ramp(8, 8).view(), &mut dst),
        Err(CompressError::Dispatch(_))
    ));
    assert_eq!(c.frame_id(), 0);
    assert!(dst.data.is_empty());

    fake.state.lock().unwrap().fail_dispatch = false;
    c.compress(hdr_ramp(8, 8).view(), &mut dst).unwrap();
    assert_eq!(c.frame_id(), 1);
}

// ===== Lifecycle =====

#[test]
fn kernel_failure_fails_init() {
    let fake = FakeContext::new();
    fake.state.lock().unwrap().fail_kernel = true;
    let result = Compressor::with_context(fake.clone(), CompressorConfig::default());
    assert!(matches!(result, Err(CompressError::Init(_))));
}

#[test]
fn invalid_config_binds_nothing() {
    let fake = FakeContext::new();
    let config = CompressorConfig {
        blit_mode: 9,
        ..CompressorConfig::default()
    };
    let result = Compressor::with_context(fake.clone(), config);
    assert!(matches!(result, Err(CompressError::InvalidConfig(_))));
    assert!(fake.calls().is_empty());
}

#[test]
fn init_binds_preset_and_query_ring() {
    let fake = FakeContext::new();
    let c = compressor(&fake, CompressorConfig {
        preset: Preset::Speed,
        ..CompressorConfig::default()
    });
    assert_eq!(fake.calls(), vec![Call::BindKernel(Preset::Speed), Call::CreateQueries(5)]);
    assert_eq!(c.config().preset, Preset::Speed);
}

#[test]
fn release_is_idempotent_and_final() {
    let fake = FakeContext::new();
    let c = compressor(&fake, untimed());
    let mut dst = Image::default();
    c.compress(hdr_ramp(16, 16).view(), &mut dst).unwrap();

    c.release();
    c.release();
    assert!(c.is_released());
    assert_eq!(c.target_extent(), None);

    let calls_before = fake.calls().len();
    let err = c.compress(hdr_ramp(16, 16).view(), &mut dst).unwrap_err();
    assert!(matches!(err, CompressError::KernelMissing));
    assert_eq!(fake.calls().len(), calls_before);
    assert_eq!(dst.data.len(), 256);

    c.free_image(&mut dst);
    assert!(dst.data.is_empty());
}

// ===== GPU timing =====

#[test]
fn timing_publishes_average_after_warmup() {
    let fake = FakeContext::new();
    {
        let mut state = fake.state.lock().unwrap();
        state.samples.push_back(TimestampSample {
            disjoint: true,
            ..one_ms()
        });
    }
    let c = compressor(&fake, CompressorConfig::default());
    let src = hdr_ramp(8, 8);
    let mut dst = Image::default();

    for _ in 0..104 {
        c.compress(src.view(), &mut dst).unwrap();
    }
    // 100 reads so far, one of them disjoint: nothing published yet.
    assert_eq!(fake.count(|c| matches!(c, Call::ReadTimestamps(_))), 100);
    assert_eq!(c.compression_time_ms(), 0.0);

    for _ in 0..6 {
        c.compress(src.view(), &mut dst).unwrap();
    }
    assert_eq!(c.frame_id(), 110);
    assert!((c.compression_time_ms() - 1.0).abs() < 1e-9);
}

#[test]
fn timing_reads_the_slot_written_one_lap_ago() {
    let fake = FakeContext::new();
    let c = compressor(&fake, CompressorConfig::default());
    let src = hdr_ramp(4, 4);
    let mut dst = Image::default();
    for _ in 0..7 {
        c.compress(src.view(), &mut dst).unwrap();
    }

    let slots: Vec<Option<usize>> = fake
        .calls()
        .iter()
        .filter_map(|c| match c {
            Call::Dispatch { slot, .. } => Some(*slot),
            _ => None,
        })
        .collect();
    assert_eq!(slots, vec![Some(0), Some(1), Some(2), Some(3), Some(4), Some(0), Some(1)]);

    let reads: Vec<usize> = fake
        .calls()
        .iter()
        .filter_map(|c| match c {
            Call::ReadTimestamps(slot) => Some(*slot),
            _ => None,
        })
        .collect();
    assert_eq!(reads, vec![0, 1, 2]);
}

#[test]
fn timing_off_creates_no_queries() {
    let fake = FakeContext::new();
    let c = compressor(&fake, untimed());
    let mut dst = Image::default();
    for _ in 0..10 {
        c.compress(hdr_ramp(4, 4).view(), &mut dst).unwrap();
    }
    assert_eq!(c.frame_id(), 10);
    assert_eq!(fake.count(|c| matches!(c, Call::CreateQueries(_))), 0);
    assert_eq!(fake.count(|c| matches!(c, Call::ReadTimestamps(_))), 0);
    assert_eq!(fake.count(|c| matches!(c, Call::Dispatch { slot: Some(_), .. })), 0);
}

// ===== Quality probe =====

#[test]
fn quality_probe_reports_exact_decode_as_lossless() {
    let fake = FakeContext::new();
    let c = compressor(&fake, CompressorConfig {
        measure_quality: true,
        gpu_timing: false,
        ..CompressorConfig::default()
    });
    assert_eq!(c.last_quality(), None);

    let mut dst = Image::default();
    c.compress(hdr_ramp(12, 9).view(), &mut dst).unwrap();
    let report = c.last_quality().unwrap();
    assert_eq!((report.width, report.height), (12, 9));
    assert_eq!(report.rgb_rmsle, 0.0);
    assert_eq!(report.lum_rmsle, 0.0);
    assert_eq!(fake.count(|c| *c == Call::Decode), 1);
}

#[test]
fn quality_probe_is_off_by_default() {
    let fake = FakeContext::new();
    let c = compressor(&fake, untimed());
    let mut dst = Image::default();
    c.compress(hdr_ramp(8, 8).view(), &mut dst).unwrap();
    assert_eq!(c.last_quality(), None);
    assert_eq!(fake.count(|c| *c == Call::Decode), 0);
}

// ===== Concurrency =====

#[test]
fn concurrent_callers_are_serialised() {
    let fake = FakeContext::new();
    let c = Arc::new(compressor(&fake, untimed()));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let c = Arc::clone(&c);
            thread::spawn(move || {
                let src = hdr_ramp(8 + t * 4, 8);
                let mut dst = Image::default();
                for _ in 0..10 {
                    c.compress(src.view(), &mut dst).unwrap();
                    assert_eq!(dst.width, (8 + t * 4).div_ceil(4));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(c.frame_id(), 40);

    // Every dispatch is followed by its own readback before the next starts.
    let calls = fake.calls();
    let order: Vec<&Call> = calls
        .iter()
        .filter(|c| matches!(c, Call::Dispatch { .. } | Call::ReadBack))
        .collect();
    for pair in order.chunks(2) {
        assert!(matches!(pair[0], Call::Dispatch { .. }));
        assert_eq!(pair[1], &Call::ReadBack);
    }
}
