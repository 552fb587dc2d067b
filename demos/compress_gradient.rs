// demos/compress_gradient.rs — Compress a synthetic HDR image and report.
//
// Generates an HDR test card (horizontal exposure ramp, colour bands and a
// few very bright spots), compresses it repeatedly with the chosen preset,
// and prints block statistics, the decoded error when the device can sample
// BC6H, and the published average GPU time.
//
// USAGE
// ─────
//   cargo run --example compress_gradient --release
//   cargo run --example compress_gradient --release -- 1920 1080 speed
//   cargo run --example compress_gradient --release -- 1920 1080 quality 300

use std::time::Instant;

use realtime_bc6h::{CompressorConfig, GpuCompressor, Image, Preset};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let width: u32 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(1024);
    let height: u32 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(512);
    let preset = match args.get(3).map(String::as_str) {
        Some("speed") => Preset::Speed,
        Some("quality") | None => Preset::Quality,
        Some(other) => {
            eprintln!("Unknown preset '{other}' (expected 'quality' or 'speed')");
            std::process::exit(1);
        }
    };
    let iterations: u32 = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(200);

    eprintln!("[compress_gradient] source: {width}×{height}, {preset:?}, {iterations} iterations");
    let source = test_card(width, height);

    let config = CompressorConfig {
        preset,
        measure_quality: true,
        ..CompressorConfig::default()
    };
    // Timestamps are optional hardware; retry without them.
    let compressor = GpuCompressor::init(config.clone()).or_else(|err| {
        eprintln!("[compress_gradient] {err}; retrying without GPU timing");
        GpuCompressor::init(CompressorConfig { gpu_timing: false, ..config })
    });
    let compressor = match compressor {
        Ok(c) => c,
        Err(err) => {
            eprintln!("[compress_gradient] {err}");
            std::process::exit(1);
        }
    };

    let mut dst = Image::default();
    let start = Instant::now();
    for i in 0..iterations {
        if let Err(err) = compressor.compress(source.view(), &mut dst) {
            eprintln!("[compress_gradient] iteration {i} failed: {err}");
            std::process::exit(1);
        }
    }
    let wall_ms = start.elapsed().as_secs_f64() * 1000.0 / iterations.max(1) as f64;

    let blocks = dst.width as usize * dst.height as usize;
    let mode11 = (0..dst.height)
        .flat_map(|by| (0..dst.width).map(move |bx| (bx, by)))
        .filter_map(|(bx, by)| dst.block(bx, by))
        .filter(|b| b.mode_bits() == 0x03)
        .count();

    println!("blocks:          {}×{} ({} bytes)", dst.width, dst.height, dst.data_size());
    println!("mode 11 blocks:  {mode11}/{blocks}");
    println!("wall time:       {wall_ms:.3} ms per call");
    if compressor.config().gpu_timing {
        println!("GPU time:        {:.4} ms per call", compressor.compression_time_ms());
    }
    match compressor.last_quality() {
        Some(report) => println!("quality:         {report}"),
        None => println!("quality:         unavailable on this device"),
    }

    compressor.free_image(&mut dst);
    compressor.release();
}

/// Exposure ramp from 2^-4 to 2^8 left to right, tinted by row band, with
/// bright spots on a 64-pixel lattice.
fn test_card(width: u32, height: u32) -> Image {
    let bands = [[1.0, 1.0, 1.0], [1.0, 0.3, 0.1], [0.2, 1.0, 0.4], [0.1, 0.3, 1.0]];
    let texels: Vec<[f32; 4]> = (0..height)
        .flat_map(|y| (0..width).map(move |x| (x, y)))
        .map(|(x, y)| {
            let stops = -4.0 + 12.0 * x as f32 / width.max(1) as f32;
            let level = stops.exp2();
            let tint = bands[(y * 4 / height.max(1)) as usize % 4];
            let spot = if x % 64 == 32 && y % 64 == 32 { 20_000.0 } else { 0.0 };
            [level * tint[0] + spot, level * tint[1] + spot, level * tint[2] + spot, 1.0]
        })
        .collect();
    Image::from_rgba32f(width, height, &texels)
}
