/// Engine properties that hold independently of the codec: partition
/// coverage, conditioning, header layout, QoI bound selection, and
/// fail-fast aggregation.
use qvol_codecs::QuantCodec;
use qvol_core::chunk::{chunk_volume, clamp_chunk_dims, ChunkBox};
use qvol_core::format::{header_len, Header};
use qvol_core::qoi::{QoiMeta, QOI_LINEAR, QOI_LOG, QOI_SYMBOLIC};
use qvol_core::tuning::quantile::{candidate_bounds, per_value_bounds};
use qvol_core::tuning::search::search_best_bound;
use qvol_core::tuning::{QoiParams, QoiTuner, TuningConstants};
use qvol_core::{Codec, CodecError, Compressor, Conditioner, Qoi, QvolError};

/// Deterministic LCG in [0, 1).
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> f64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() * n as f64) as usize
    }
}

fn smooth(dims: [usize; 3], offset: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(dims.iter().product());
    for z in 0..dims[2] {
        for y in 0..dims[1] {
            for x in 0..dims[0] {
                out.push(offset + (x as f64 * 0.21).sin() + (y as f64 * 0.13).cos() + z as f64 * 0.05);
            }
        }
    }
    out
}

// ── partition ──────────────────────────────────────────────────────────────

#[test]
fn test_partition_tiles_volume_exactly() {
    let mut rng = Lcg(0xC0FFEE);
    for _ in 0..200 {
        let vol = [1 + rng.below(40), 1 + rng.below(40), 1 + rng.below(40)];
        let pref = [rng.below(50), rng.below(50), rng.below(50)];
        let chunk = clamp_chunk_dims(vol, pref);
        let boxes = chunk_volume(vol, chunk);

        let mut hits = vec![0u8; vol.iter().product()];
        for b in &boxes {
            assert!(b.fits(vol), "{b:?} outside {vol:?}");
            for z in b.offset[2]..b.offset[2] + b.len[2] {
                for y in b.offset[1]..b.offset[1] + b.len[1] {
                    for x in b.offset[0]..b.offset[0] + b.len[0] {
                        hits[(z * vol[1] + y) * vol[0] + x] += 1;
                    }
                }
            }
        }
        assert!(hits.iter().all(|&h| h == 1), "vol {vol:?} chunk {chunk:?}");
    }
}

#[test]
fn test_partition_order_is_x_fastest() {
    let boxes = chunk_volume([4, 4, 4], [2, 2, 2]);
    assert_eq!(boxes[0], ChunkBox::new([0, 0, 0], [2, 2, 2]));
    assert_eq!(boxes[1], ChunkBox::new([2, 0, 0], [2, 2, 2]));
    assert_eq!(boxes[2], ChunkBox::new([0, 2, 0], [2, 2, 2]));
    assert_eq!(boxes[4], ChunkBox::new([0, 0, 2], [2, 2, 2]));
    assert_eq!(boxes[7].as_array(), [2, 2, 2, 2, 2, 2]);
}

// ── conditioner ────────────────────────────────────────────────────────────

#[test]
fn test_conditioning_roundtrip_all_toggles() {
    let mut rng = Lcg(42);
    for len in [2usize, 17, 4096, 9000, 31 * 31 * 31] {
        let orig: Vec<f64> = (0..len).map(|_| rng.next() * 200.0 - 50.0).collect();
        for (mean, rms) in [(false, false), (true, false), (false, true), (true, true)] {
            let c = Conditioner::new(mean, rms);
            let mut buf = orig.clone();
            let meta = c.condition(&mut buf).unwrap();
            assert_eq!(meta.len(), c.meta_size());
            c.inverse_condition(&mut buf, &meta).unwrap();
            for (a, b) in orig.iter().zip(&buf) {
                assert!((a - b).abs() <= 1e-12 * a.abs().max(1.0), "len {len} mean {mean} rms {rms}");
            }
        }
    }
}

#[test]
fn test_zero_rms_fails_and_leaves_buffer() {
    let mut c = Conditioner::default();
    c.toggle_divide_by_rms(true);
    let mut buf = vec![0.0; 1000];
    assert!(matches!(c.condition(&mut buf), Err(QvolError::ZeroRms)));
    assert!(buf.iter().all(|&v| v == 0.0));

    // constant non-zero input is zero after mean removal
    let mut buf = vec![3.5; 64];
    assert!(matches!(c.condition(&mut buf), Err(QvolError::ZeroRms)));
    assert!(buf.iter().all(|&v| v == 3.5));
}

#[test]
fn test_short_meta_is_rejected() {
    let c = Conditioner::default();
    let mut buf = vec![1.0; 4];
    assert!(matches!(
        c.inverse_condition(&mut buf, &[0u8; 10]),
        Err(QvolError::Bitstream(_))
    ));
}

// ── header ─────────────────────────────────────────────────────────────────

#[test]
fn test_header_roundtrip_eight_chunks() {
    let dims = [4, 4, 4];
    let data = smooth(dims, 0.0);
    let mut c = Compressor::new(QuantCodec::default);
    c.set_num_threads(2);
    c.set_dims_and_chunks(dims, [2, 2, 2]);
    c.set_tolerance(1e-3);
    c.compress(&data).unwrap();

    assert_eq!(c.num_chunks(), 8);
    assert_eq!(c.header().len(), 52);
    assert_eq!(header_len(8), 20 + 8 * 4);

    let stream = c.get_encoded_bitstream();
    let h = Header::from_bytes(&stream).unwrap();
    assert!(h.is_multi_chunk());
    assert!(!h.orig_is_float());
    assert_eq!(h.vol_dims, dims);
    assert_eq!(h.chunk_dims, [2, 2, 2]);
    assert_eq!(h.chunk_boxes(), chunk_volume(dims, [2, 2, 2]));
    let lens: Vec<u32> = c.chunk_streams().iter().map(|s| s.len() as u32).collect();
    assert_eq!(h.chunk_lens, lens);
    assert_eq!(stream.len(), 52 + h.payload_len());
}

#[test]
fn test_single_chunk_omits_chunk_dims() {
    let dims = [6, 5, 4];
    let data: Vec<f32> = smooth(dims, 1.0).into_iter().map(|v| v as f32).collect();
    let mut c = Compressor::new(QuantCodec::default);
    c.set_dims_and_chunks(dims, [64, 64, 64]);
    c.set_tolerance(1e-2);
    c.compress(&data).unwrap();

    assert_eq!(c.num_chunks(), 1);
    assert_eq!(c.header().len(), 14 + 4);
    let h = Header::from_bytes(c.header()).unwrap();
    assert!(!h.is_multi_chunk());
    assert!(h.orig_is_float());
    assert_eq!(h.chunk_boxes(), vec![ChunkBox::new([0, 0, 0], dims)]);
}

// ── QoI bound selection ────────────────────────────────────────────────────

/// Bound grows strictly with |v|.
#[derive(Debug, Clone)]
struct Widening {
    tolerance: f64,
    global_eb: f64,
}

impl Qoi for Widening {
    fn id(&self) -> u32 {
        900
    }
    fn eval(&self, v: f64) -> f64 {
        v.signum() * v.abs().ln_1p()
    }
    fn interpret_eb(&self, v: f64) -> f64 {
        (self.tolerance * (1.0 + v.abs())).min(self.global_eb)
    }
    fn set_global_eb(&mut self, eb: f64) {
        self.global_eb = eb;
    }
    fn global_eb(&self) -> f64 {
        self.global_eb
    }
    fn set_qoi_tolerance(&mut self, tolerance: f64) {
        self.tolerance = tolerance;
    }
    fn qoi_tolerance(&self) -> f64 {
        self.tolerance
    }
    fn expression(&self) -> String {
        "sgn(x)*ln(1+|x|)".into()
    }
    fn box_clone(&self) -> Box<dyn Qoi> {
        Box::new(self.clone())
    }
}

#[test]
fn test_search_never_exceeds_pointwise_cap() {
    let mut rng = Lcg(7);
    let chunk: Vec<f64> = (0..20_000).map(|_| rng.next() * 100.0 - 50.0).collect();
    for cap in [1e-4, 1e-2, 0.3, 10.0] {
        let qoi = Widening {
            tolerance: 0.01,
            global_eb: cap,
        };
        let mut ebs = per_value_bounds(&chunk, &qoi, cap);
        let cands = candidate_bounds(&mut ebs, 0.2, &TuningConstants::default().quantile_fractions);
        assert!(cands.iter().all(|&c| c <= cap));

        // a codec whose rate falls as the bound loosens
        let out = search_best_bound(&cands, cap, 1e-15, 1.02, |eb| {
            Ok::<_, CodecError>(1.0 / eb)
        })
        .unwrap();
        assert!(out.best_eb <= cap, "cap {cap}: chose {}", out.best_eb);
        assert_eq!(out.best_eb, cands[0]);
    }
}

#[test]
fn test_tuner_respects_user_tolerance() {
    let dims = [40, 40, 40];
    let chunk = smooth(dims, 5.0);
    let pwe = 1e-3;
    let params = QoiParams {
        meta: QoiMeta::new(QOI_LOG),
        tolerance: 1e-2,
        ..QoiParams::default()
    };
    let tuner = QoiTuner::new(&params, &TuningConstants::default(), dims, Some(pwe), false)
        .unwrap()
        .unwrap();
    let t = tuner.tune(&chunk, dims, &QuantCodec::default).unwrap();
    assert!(t.tolerance > 0.0 && t.tolerance <= pwe, "chose {}", t.tolerance);
    assert!(t.best_rate.is_some());
    assert_eq!(t.qoi.map(|q| q.global_eb()), Some(t.tolerance));
}

#[test]
fn test_global_regime_matches_closed_form() {
    let dims = [16, 16, 16];
    let chunk = smooth(dims, 0.0);
    let constants = TuningConstants::default();

    let linear = QoiParams {
        meta: QoiMeta::new(QOI_LINEAR).with_scale(-4.0),
        tolerance: 1.0,
        ..QoiParams::default()
    };
    for (pwe, expected) in [(None, 0.25), (Some(0.1), 0.1), (Some(1.0), 0.25)] {
        let tuner = QoiTuner::new(&linear, &constants, dims, pwe, false).unwrap().unwrap();
        let t = tuner.tune(&chunk, dims, &QuantCodec::default).unwrap();
        assert_eq!(t.tolerance, expected, "pwe {pwe:?}");
        assert!(t.qoi.is_none(), "point-wise QoI needs no model on the codec");
        assert!(t.best_rate.is_none());
    }

    // identity expression, regional: tolerance inflated by the capped rate
    let identity = QoiParams {
        meta: QoiMeta::new(QOI_SYMBOLIC),
        tolerance: 0.01,
        block_size: 4,
        ..QoiParams::default()
    };
    let tuner = QoiTuner::new(&identity, &constants, dims, Some(1.0), false).unwrap().unwrap();
    assert_eq!(tuner.plan().rate, 4.0);
    let t = tuner.tune(&chunk, dims, &QuantCodec::default).unwrap();
    assert!((t.tolerance - 0.04).abs() < 1e-15);
    assert_eq!(t.qoi.map(|q| q.global_eb()), Some(t.tolerance));
}

#[test]
fn test_unknown_qoi_id_is_a_config_error() {
    let params = QoiParams {
        meta: QoiMeta::new(77),
        tolerance: 0.1,
        ..QoiParams::default()
    };
    let r = QoiTuner::new(&params, &TuningConstants::default(), [8, 8, 8], None, false);
    assert!(matches!(r, Err(QvolError::InvalidQoi(_))));
}

#[test]
fn test_regional_qoi_aligns_chunks() {
    let mut c = Compressor::new(QuantCodec::default);
    c.set_dims_and_chunks([50, 50, 50], [30, 3, 64]);
    c.set_qoi_params(QoiParams {
        meta: QoiMeta::new(QOI_LOG),
        tolerance: 0.1,
        block_size: 8,
        ..QoiParams::default()
    });
    assert_eq!(c.plan_chunk_dims(), [24, 8, 48]);

    // inactive QoI leaves the clamped dims alone
    c.set_qoi_params(QoiParams {
        block_size: 8,
        ..QoiParams::default()
    });
    assert_eq!(c.plan_chunk_dims(), [30, 3, 50]);
}

// ── failures ───────────────────────────────────────────────────────────────

const SENTINEL: f64 = -999.0;

/// Quantizing codec that refuses any chunk holding the sentinel.
#[derive(Default)]
struct Refusing {
    inner: QuantCodec,
    poisoned: bool,
}

impl Codec for Refusing {
    fn name(&self) -> &'static str {
        "refusing"
    }
    fn set_dims(&mut self, dims: [usize; 3]) {
        self.inner.set_dims(dims);
    }
    fn take_data(&mut self, data: Vec<f64>) {
        self.poisoned = data.contains(&SENTINEL);
        self.inner.take_data(data);
    }
    fn set_bitrate(&mut self, bpp: f64) {
        self.inner.set_bitrate(bpp);
    }
    fn set_psnr(&mut self, psnr: f64) {
        self.inner.set_psnr(psnr);
    }
    fn set_tolerance(&mut self, tolerance: f64) {
        self.inner.set_tolerance(tolerance);
    }
    fn set_direct_quality(&mut self, q: f64) {
        self.inner.set_direct_quality(q);
    }
    fn set_qoi(&mut self, qoi: Box<dyn Qoi>) {
        self.inner.set_qoi(qoi);
    }
    fn clear_qoi(&mut self) {
        self.inner.clear_qoi();
    }
    fn set_qoi_tolerance(&mut self, tolerance: f64) {
        self.inner.set_qoi_tolerance(tolerance);
    }
    fn set_qoi_block_size(&mut self, block_size: usize) {
        self.inner.set_qoi_block_size(block_size);
    }
    fn compress(&mut self, high_prec: bool) -> Result<(), CodecError> {
        if self.poisoned {
            return Err(CodecError::Other("sentinel".into()));
        }
        self.inner.compress(high_prec)
    }
    fn append_encoded_bitstream(&self, out: &mut Vec<u8>) {
        self.inner.append_encoded_bitstream(out);
    }
    fn use_bitstream(&mut self, stream: &[u8]) -> Result<(), CodecError> {
        self.inner.use_bitstream(stream)
    }
    fn decompress(&mut self) -> Result<(), CodecError> {
        self.inner.decompress()
    }
    fn release_data(&mut self) -> Vec<f64> {
        self.inner.release_data()
    }
}

#[test]
fn test_one_failing_chunk_fails_the_job() {
    let dims = [8, 8, 8];
    let mut data = smooth(dims, 0.0);
    // (5, 1, 6) lies in chunk (1, 0, 1) -> index 1 + 0 * 2 + 1 * 4
    data[(6 * 8 + 1) * 8 + 5] = SENTINEL;

    for threads in [1, 3] {
        let mut c = Compressor::new(Refusing::default);
        c.set_num_threads(threads);
        c.set_dims_and_chunks(dims, [4, 4, 4]);
        c.set_tolerance(1e-3);
        let err = c.compress(&data).unwrap_err();
        match err {
            QvolError::Chunk { index, source } => {
                assert_eq!(index, 5);
                assert_eq!(source, CodecError::Other("sentinel".into()));
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(c.get_encoded_bitstream().is_empty());
        assert_eq!(c.num_chunks(), 0);
    }
}

#[test]
fn test_first_failure_in_chunk_order_wins() {
    let dims = [8, 8, 8];
    let mut data = smooth(dims, 0.0);
    data[(6 * 8 + 7) * 8 + 7] = SENTINEL; // chunk 7
    data[(0 * 8 + 5) * 8 + 1] = SENTINEL; // chunk 2

    let mut c = Compressor::new(Refusing::default);
    c.set_num_threads(4);
    c.set_dims_and_chunks(dims, [4, 4, 4]);
    c.set_psnr(60.0);
    assert!(matches!(c.compress(&data), Err(QvolError::Chunk { index: 2, .. })));
}

#[test]
fn test_mode_and_length_are_checked_first() {
    let data = vec![0.0f64; 27];
    let mut c = Compressor::new(QuantCodec::default);
    c.set_dims_and_chunks([3, 3, 3], [3, 3, 3]);
    assert!(matches!(c.compress(&data), Err(QvolError::CompModeUnknown)));

    c.set_tolerance(0.1);
    let short = vec![0.0f64; 26];
    assert!(matches!(
        c.compress(&short),
        Err(QvolError::WrongLength { expected: 27, actual: 26 })
    ));
}
