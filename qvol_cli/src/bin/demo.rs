//! qvol demo
//!
//! Builds a synthetic turbulence-like f32 volume, compresses it under each
//! fidelity mode and two QoI constraints, decodes every bitstream again and
//! prints ratio, rate and the achieved error next to what was asked for.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use qvol_codecs::BackendKind;
use qvol_core::qoi::{QoiMeta, QOI_LINEAR, QOI_SQUARE};
use qvol_core::tuning::QoiParams;
use qvol_core::{CompressionMode, Compressor, Decompressor, ErrorStats};

// ── constants ──────────────────────────────────────────────────────────────

const DIMS: [usize; 3] = [160, 128, 96];
const CHUNKS: [usize; 3] = [64, 64, 48];

// ── data generator ─────────────────────────────────────────────────────────

/// Superposed plane waves, a Gaussian blob and a little LCG noise.
fn synthetic_field(dims: [usize; 3]) -> Vec<f32> {
    let mut rng: u64 = 0x5eed;
    let [nx, ny, nz] = dims;
    let mut out = Vec::with_capacity(nx * ny * nz);
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                rng = rng
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                let noise = (rng >> 40) as f64 / (1u64 << 24) as f64 - 0.5;
                let (fx, fy, fz) = (x as f64, y as f64, z as f64);
                let waves =
                    (fx * 0.11).sin() * (fy * 0.07).cos() + 0.5 * ((fx + fz) * 0.05).sin();
                let dx = fx - nx as f64 / 2.0;
                let dy = fy - ny as f64 / 2.0;
                let dz = fz - nz as f64 / 2.0;
                let blob = 4.0 * (-(dx * dx + dy * dy + dz * dz) / 600.0).exp();
                out.push((3.0 + waves + blob + 0.02 * noise) as f32);
            }
        }
    }
    out
}

// ── helpers ────────────────────────────────────────────────────────────────

fn human_bytes(n: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n} B")
    } else {
        format!("{v:.2} {}", UNITS[unit])
    }
}

fn fmt_duration(d: Duration) -> String {
    let ms = d.as_secs_f64() * 1000.0;
    if ms < 1000.0 {
        format!("{ms:.1} ms")
    } else {
        format!("{:.2} s", d.as_secs_f64())
    }
}

fn section(title: &str) {
    println!("━━━ {title} {}", "━".repeat(70usize.saturating_sub(title.len() + 5)));
}

/// Worst QoI error: point-wise for block size 1, block means otherwise.
fn qoi_error(orig: &[f32], recon: &[f32], f: impl Fn(f64) -> f64, block: usize) -> f64 {
    let [nx, ny, nz] = DIMS;
    let mut worst: f64 = 0.0;
    for bz in (0..nz).step_by(block) {
        for by in (0..ny).step_by(block) {
            for bx in (0..nx).step_by(block) {
                let mut sum = 0.0;
                let mut n = 0usize;
                for z in bz..(bz + block).min(nz) {
                    for y in by..(by + block).min(ny) {
                        for x in bx..(bx + block).min(nx) {
                            let i = (z * ny + y) * nx + x;
                            sum += f(recon[i] as f64) - f(orig[i] as f64);
                            n += 1;
                        }
                    }
                }
                worst = worst.max((sum / n as f64).abs());
            }
        }
    }
    worst
}

struct Outcome {
    stream_len: usize,
    recon: Vec<f32>,
    encode: Duration,
    decode: Duration,
}

fn roundtrip(
    data: &[f32],
    mode: CompressionMode,
    qoi: QoiParams,
    threads: usize,
) -> Result<Outcome> {
    let factory = BackendKind::Zstd.codec_factory();
    let mut comp = Compressor::new(factory);
    comp.set_num_threads(threads);
    comp.set_dims_and_chunks(DIMS, CHUNKS);
    comp.set_mode(mode);
    comp.set_qoi_params(qoi);

    let t0 = Instant::now();
    comp.compress(data).context("compressing")?;
    let encode = t0.elapsed();
    let stream = comp.get_encoded_bitstream();

    let mut dec = Decompressor::new(factory);
    dec.set_num_threads(threads);
    let t0 = Instant::now();
    dec.use_bitstream(&stream).context("parsing bitstream")?;
    dec.decompress().context("decoding")?;
    let decode = t0.elapsed();

    Ok(Outcome {
        stream_len: stream.len(),
        recon: dec.release_decoded_data(),
        encode,
        decode,
    })
}

// ── demo runner ────────────────────────────────────────────────────────────

fn run() -> Result<()> {
    println!();
    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║        qvol · chunked QoI-aware volume compression demo         ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();

    section("0 · DATA");
    let data = synthetic_field(DIMS);
    let raw = (data.len() * 4) as u64;
    println!("  volume dims : {:?} (f32)", DIMS);
    println!("  chunk dims  : {:?}", CHUNKS);
    println!("  raw size    : {}", human_bytes(raw));
    println!();

    section("1 · FIDELITY MODES");
    println!(
        "  {:<24} {:>10} {:>8} {:>7} {:>11} {:>11} {:>8} {:>9}",
        "mode", "size", "ratio", "bpp", "rmse", "max err", "psnr", "encode"
    );
    println!("  {}", "─".repeat(96));
    let modes = [
        ("rate 2 bpp", CompressionMode::Rate(2.0)),
        ("rate 6 bpp", CompressionMode::Rate(6.0)),
        ("psnr 60 dB", CompressionMode::Psnr(60.0)),
        ("psnr 90 dB", CompressionMode::Psnr(90.0)),
        ("pointwise 1e-3", CompressionMode::PointwiseTolerance(1e-3)),
        ("direct q 0.01", CompressionMode::DirectQuality(0.01)),
    ];
    for (label, mode) in modes {
        let out = roundtrip(&data, mode, QoiParams::default(), 0)?;
        let stats = ErrorStats::compare(&data, &out.recon)?;
        println!(
            "  {:<24} {:>10} {:>7.1}x {:>7.3} {:>11.3e} {:>11.3e} {:>8.2} {:>9}",
            label,
            human_bytes(out.stream_len as u64),
            raw as f64 / out.stream_len as f64,
            out.stream_len as f64 * 8.0 / data.len() as f64,
            stats.rmse,
            stats.linf,
            stats.psnr,
            fmt_duration(out.encode),
        );
    }
    println!();

    section("2 · QUANTITY-OF-INTEREST CONSTRAINTS");
    let cases = [
        (
            "x^2 point-wise, tol 1e-2",
            QoiParams {
                meta: QoiMeta::new(QOI_SQUARE),
                tolerance: 1e-2,
                ..QoiParams::default()
            },
            (|v: f64| v * v) as fn(f64) -> f64,
        ),
        (
            "3x block mean, B=8, 1e-3",
            QoiParams {
                meta: QoiMeta::new(QOI_LINEAR).with_scale(3.0),
                tolerance: 1e-3,
                block_size: 8,
                ..QoiParams::default()
            },
            (|v: f64| 3.0 * v) as fn(f64) -> f64,
        ),
    ];
    println!(
        "  {:<26} {:>8} {:>7} {:>12} {:>12}",
        "constraint", "ratio", "bpp", "qoi error", "tolerance"
    );
    println!("  {}", "─".repeat(70));
    for (label, params, f) in cases {
        let tol = params.tolerance;
        let block = params.block_size;
        let out = roundtrip(&data, CompressionMode::Psnr(50.0), params, 0)?;
        let err = qoi_error(&data, &out.recon, f, block);
        println!(
            "  {:<26} {:>7.1}x {:>7.3} {:>12.3e} {:>12.3e}",
            label,
            raw as f64 / out.stream_len as f64,
            out.stream_len as f64 * 8.0 / data.len() as f64,
            err,
            tol,
        );
    }
    println!();

    section("3 · THREAD SCALING (pointwise 1e-3)");
    println!("  {:<10} {:>12} {:>12}", "threads", "encode", "decode");
    println!("  {}", "─".repeat(36));
    let mut sizes = Vec::new();
    for threads in [1, 2, 4, 8] {
        let mode = CompressionMode::PointwiseTolerance(1e-3);
        let out = roundtrip(&data, mode, QoiParams::default(), threads)?;
        sizes.push(out.stream_len);
        println!(
            "  {:<10} {:>12} {:>12}",
            threads,
            fmt_duration(out.encode),
            fmt_duration(out.decode)
        );
    }
    let identical = sizes.windows(2).all(|w| w[0] == w[1]);
    println!();
    println!("  bitstream size independent of thread count: {identical}");
    println!();
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

// ── tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_bytes_picks_the_largest_unit() {
        assert_eq!(human_bytes(0), "0 B");
        assert_eq!(human_bytes(1023), "1023 B");
        assert_eq!(human_bytes(1024), "1.00 KB");
        assert_eq!(human_bytes(3 * 1024 * 1024 / 2), "1.50 MB");
        assert_eq!(human_bytes(5 << 40), "5120.00 GB");
    }
}
