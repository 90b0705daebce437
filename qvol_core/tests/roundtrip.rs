/// End-to-end: compress a volume, decode the bitstream, and check the
/// fidelity guarantee that was asked for.
use qvol_codecs::{BackendKind, QuantCodec};
use qvol_core::qoi::{QoiMeta, QOI_LINEAR, QOI_SQUARE, QOI_SYMBOLIC};
use qvol_core::tuning::QoiParams;
use qvol_core::{Compressor, Decompressor, ErrorStats, JobConfig, QvolError};

/// Generate a smooth field with deterministic LCG noise, x fastest.
fn volume(dims: [usize; 3], seed: u64) -> Vec<f64> {
    let mut rng = seed;
    let mut out = Vec::with_capacity(dims.iter().product());
    for z in 0..dims[2] {
        for y in 0..dims[1] {
            for x in 0..dims[0] {
                rng = rng
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                let noise = (rng >> 11) as f64 / (1u64 << 53) as f64;
                let r = ((x * x + y * y + z * z) as f64).sqrt();
                out.push(2.0 + (r / 6.0).sin() + 0.1 * noise);
            }
        }
    }
    out
}

fn decode(stream: &[u8], threads: usize) -> Vec<f64> {
    let mut d = Decompressor::new(QuantCodec::default);
    d.set_num_threads(threads);
    d.use_bitstream(stream).unwrap();
    d.decompress().unwrap();
    d.release_decoded_data::<f64>()
}

// ── tests ──────────────────────────────────────────────────────────────────

#[test]
fn test_roundtrip_honors_tolerance() {
    let dims = [40, 36, 30];
    let data = volume(dims, 1);
    let tol = 1e-3;

    let mut c = Compressor::new(QuantCodec::default);
    c.set_num_threads(4);
    c.set_dims_and_chunks(dims, [16, 16, 16]);
    c.set_tolerance(tol);
    c.compress(&data).unwrap();
    let stream = c.get_encoded_bitstream();
    assert!(stream.len() < data.len() * 8);

    let recon = decode(&stream, 3);
    let stats = ErrorStats::compare(&data, &recon).unwrap();
    assert!(stats.linf <= tol, "linf {}", stats.linf);
}

#[test]
fn test_thread_count_does_not_change_output() {
    let dims = [33, 17, 20];
    let data = volume(dims, 2);
    let mut streams = Vec::new();
    for threads in [1, 2, 5] {
        let mut c = Compressor::new(QuantCodec::default);
        c.set_num_threads(threads);
        c.set_dims_and_chunks(dims, [8, 8, 8]);
        c.set_psnr(80.0);
        c.compress(&data).unwrap();
        streams.push(c.get_encoded_bitstream());
    }
    assert_eq!(streams[0], streams[1]);
    assert_eq!(streams[0], streams[2]);
}

#[test]
fn test_f32_volume_roundtrip() {
    let dims = [24, 24, 24];
    let data: Vec<f32> = volume(dims, 3).into_iter().map(|v| v as f32).collect();
    let tol = 1e-2;

    let mut c = Compressor::new(BackendKind::Lz4.codec_factory());
    c.set_dims_and_chunks(dims, [12, 24, 7]);
    c.set_tolerance(tol);
    c.compress(&data).unwrap();
    assert!(c.orig_is_float());

    let mut d = Decompressor::new(BackendKind::Lz4.codec_factory());
    d.use_bitstream(&c.get_encoded_bitstream()).unwrap();
    assert!(d.orig_is_float());
    assert_eq!(d.dims(), dims);
    d.decompress().unwrap();
    let recon: Vec<f32> = d.release_decoded_data();
    for (a, b) in data.iter().zip(&recon) {
        // f32 rounding of the output adds at most half an ulp
        assert!((a - b).abs() <= tol as f32 * 1.001, "{a} vs {b}");
    }
}

#[test]
fn test_pointwise_qoi_roundtrip() {
    let dims = [32, 32, 32];
    let data = volume(dims, 4);
    let qoi_tol = 1e-2;

    let mut c = Compressor::new(QuantCodec::default);
    c.set_dims_and_chunks(dims, [32, 32, 16]);
    c.set_tolerance(0.05);
    c.set_qoi_params(QoiParams {
        meta: QoiMeta::new(QOI_SQUARE),
        tolerance: qoi_tol,
        ..QoiParams::default()
    });
    c.compress(&data).unwrap();

    let recon = decode(&c.get_encoded_bitstream(), 0);
    for (a, b) in data.iter().zip(&recon) {
        assert!((a - b).abs() <= 0.05);
        assert!((a * a - b * b).abs() <= qoi_tol, "x^2 error at {a}");
    }
}

#[test]
fn test_symbolic_qoi_roundtrip() {
    let dims = [32, 32, 32];
    let data = volume(dims, 5);
    let qoi_tol = 1e-3;

    let mut c = Compressor::new(QuantCodec::default);
    c.set_dims_and_chunks(dims, [32, 32, 32]);
    c.set_psnr(40.0);
    c.set_qoi_params(QoiParams {
        meta: QoiMeta::new(QOI_SYMBOLIC).with_expression("exp(x) - x^3"),
        tolerance: qoi_tol,
        ..QoiParams::default()
    });
    c.compress(&data).unwrap();

    let recon = decode(&c.get_encoded_bitstream(), 0);
    let f = |x: f64| x.exp() - x.powi(3);
    for (a, b) in data.iter().zip(&recon) {
        assert!((f(*a) - f(*b)).abs() <= qoi_tol, "qoi error at {a}: {b}");
    }
}

/// Worst absolute mean of `g(recon) - g(orig)` over the `b`-edged blocks.
fn worst_block_mean(
    dims: [usize; 3],
    orig: &[f64],
    recon: &[f64],
    b: usize,
    g: impl Fn(f64) -> f64,
) -> f64 {
    let mut worst: f64 = 0.0;
    for bz in 0..dims[2] / b {
        for by in 0..dims[1] / b {
            for bx in 0..dims[0] / b {
                let mut sum = 0.0;
                for z in bz * b..bz * b + b {
                    for y in by * b..by * b + b {
                        for x in bx * b..bx * b + b {
                            let i = (z * dims[1] + y) * dims[0] + x;
                            sum += g(recon[i]) - g(orig[i]);
                        }
                    }
                }
                worst = worst.max((sum / (b * b * b) as f64).abs());
            }
        }
    }
    worst
}

#[test]
fn test_regional_square_qoi_roundtrip() {
    // x^2 is not a fixed multiple of the value error, so the bound search runs
    let dims = [32, 32, 32];
    let data = volume(dims, 9);
    let qoi_tol = 1e-2;

    let mut c = Compressor::new(QuantCodec::default);
    c.set_num_threads(3);
    c.set_dims_and_chunks(dims, [16, 16, 16]);
    c.set_psnr(60.0);
    c.set_qoi_params(QoiParams {
        meta: QoiMeta::new(QOI_SQUARE),
        tolerance: qoi_tol,
        block_size: 4,
        ..QoiParams::default()
    });
    c.compress(&data).unwrap();
    assert_eq!(c.num_chunks(), 8);

    let recon = decode(&c.get_encoded_bitstream(), 2);
    let worst = worst_block_mean(dims, &data, &recon, 4, |v| v * v);
    assert!(worst <= qoi_tol * (1.0 + 1e-9), "worst block mean {worst}");
}

#[test]
fn test_regional_linear_qoi_roundtrip() {
    let dims = [32, 32, 32];
    let data = volume(dims, 6);
    let qoi_tol = 0.05;
    let b = 4;

    let mut c = Compressor::new(QuantCodec::default);
    c.set_dims_and_chunks(dims, [18, 18, 18]);
    c.set_bitrate(2.0);
    c.set_qoi_params(QoiParams {
        meta: QoiMeta::new(QOI_LINEAR).with_scale(2.0),
        tolerance: qoi_tol,
        block_size: b,
        ..QoiParams::default()
    });
    c.compress(&data).unwrap();
    assert_eq!(c.effective_chunk_dims(), [16, 16, 16]);

    let recon = decode(&c.get_encoded_bitstream(), 2);
    let worst = worst_block_mean(dims, &data, &recon, b, |v| 2.0 * v);
    assert!(worst <= qoi_tol * (1.0 + 1e-9), "worst block mean {worst}");
}

#[test]
fn test_job_config_drives_compressor() {
    let cfg: JobConfig = serde_json::from_str(
        r#"{
            "dims": [20, 20, 20],
            "chunk_dims": [10, 10, 10],
            "num_threads": 2,
            "mode": { "mode": "pointwise_tolerance", "quality": 0.01 }
        }"#,
    )
    .unwrap();
    let data = volume(cfg.dims, 7);
    let mut c = cfg.compressor(QuantCodec::default);
    c.compress(&data).unwrap();
    assert_eq!(c.num_chunks(), 8);

    let recon = decode(&c.get_encoded_bitstream(), 0);
    assert!(ErrorStats::compare(&data, &recon).unwrap().linf <= 0.01);
}

#[test]
fn test_decompressor_rejects_damaged_streams() {
    let dims = [16, 16, 16];
    let data = volume(dims, 8);
    let mut c = Compressor::new(QuantCodec::default);
    c.set_dims_and_chunks(dims, [8, 8, 8]);
    c.set_tolerance(1e-2);
    c.compress(&data).unwrap();
    let stream = c.get_encoded_bitstream();

    let mut d = Decompressor::new(QuantCodec::default);
    for cut in [0, 10, 19, 40, stream.len() - 1] {
        assert!(
            matches!(d.use_bitstream(&stream[..cut]), Err(QvolError::Bitstream(_))),
            "cut at {cut} accepted"
        );
    }

    let mut trailing = stream.clone();
    trailing.push(0);
    assert!(matches!(d.use_bitstream(&trailing), Err(QvolError::Bitstream(_))));

    let mut bad_version = stream.clone();
    bad_version[0] = 9;
    assert!(matches!(d.use_bitstream(&bad_version), Err(QvolError::Bitstream(_))));

    let mut partial = stream.clone();
    partial[1] |= 1;
    assert!(matches!(d.use_bitstream(&partial), Err(QvolError::Bitstream(_))));

    // corrupt the last chunk's payload: the codec's checksum catches it
    let mut flipped = stream.clone();
    let last = flipped.len() - 1;
    flipped[last] ^= 0xFF;
    d.use_bitstream(&flipped).unwrap();
    assert!(matches!(d.decompress(), Err(QvolError::Chunk { index: 7, .. })));

    assert!(decode(&stream, 1).len() == data.len());
}

#[test]
fn test_decompressor_rejects_oversized_partition() {
    // 65536^3 values in single-value chunks, with no length table
    let mut stream = vec![1u8, 0b1010];
    for _ in 0..3 {
        stream.extend_from_slice(&65_536u32.to_le_bytes());
    }
    for _ in 0..3 {
        stream.extend_from_slice(&1u16.to_le_bytes());
    }
    let mut d = Decompressor::new(QuantCodec::default);
    assert!(matches!(d.use_bitstream(&stream), Err(QvolError::Bitstream(_))));
    assert!(d.header().is_none());
}
