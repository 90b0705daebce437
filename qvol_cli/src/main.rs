use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use xxhash_rust::xxh3::xxh3_64;

use qvol_codecs::BackendKind;
use qvol_core::qoi::QoiMeta;
use qvol_core::tuning::QoiParams;
use qvol_core::{
    CompressionMode, Decompressor, Element, ErrorStats, Header, JobConfig, Precision,
};

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "qvol",
    about = "Chunked, parallel, QoI-aware lossy compression for 3D volumes",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress a raw little-endian volume (x fastest)
    Compress(CompressArgs),
    /// Decode a qvol bitstream back to a raw volume
    Decompress {
        /// qvol bitstream
        input: PathBuf,
        /// Destination raw file
        output: PathBuf,
        /// Worker threads (0 = all cores)
        #[arg(short, long, default_value_t = 0)]
        threads: usize,
        /// Write f64 even if the source volume was f32
        #[arg(long)]
        f64: bool,
    },
    /// Print header fields and the chunk length table
    Inspect {
        /// qvol bitstream
        file: PathBuf,
        /// Print per-chunk offsets, lengths, and xxh3 checksums
        #[arg(long)]
        chunks: bool,
    },
    /// Compare an original raw volume with its reconstruction
    Evaluate {
        orig: PathBuf,
        recon: PathBuf,
        /// Both files hold f64 values
        #[arg(long)]
        f64: bool,
    },
}

#[derive(Args)]
struct CompressArgs {
    /// Raw volume to compress
    input: PathBuf,
    /// Destination qvol bitstream
    output: PathBuf,
    /// Volume extent, x fastest
    #[arg(long, num_args = 3, value_names = ["X", "Y", "Z"])]
    dims: Option<Vec<usize>>,
    /// Requested chunk extent
    #[arg(long, num_args = 3, value_names = ["X", "Y", "Z"])]
    chunks: Option<Vec<usize>>,
    /// Worker threads (0 = all cores)
    #[arg(short, long)]
    threads: Option<usize>,
    #[command(flatten)]
    mode: ModeArgs,
    #[command(flatten)]
    qoi: QoiArgs,
    /// Input holds f64 values instead of f32
    #[arg(long)]
    f64: bool,
    /// Keep outlier corrections in double precision
    #[arg(long)]
    high_prec: bool,
    /// JSON job file; command-line flags override its fields
    #[arg(long)]
    config: Option<PathBuf>,
    /// Lossless back end: zstd | lz4 | none
    #[arg(short, long, default_value = "zstd")]
    backend: BackendKind,
}

#[derive(Args)]
#[group(multiple = false)]
struct ModeArgs {
    /// Target bits per value
    #[arg(long)]
    bpp: Option<f64>,
    /// Target PSNR in dB
    #[arg(long)]
    psnr: Option<f64>,
    /// Point-wise absolute error bound
    #[arg(long)]
    pwe: Option<f64>,
    /// Codec-native quality knob (quantizer step)
    #[arg(long)]
    direct_q: Option<f64>,
}

impl ModeArgs {
    fn mode(&self) -> Option<CompressionMode> {
        self.bpp
            .map(CompressionMode::Rate)
            .or(self.psnr.map(CompressionMode::Psnr))
            .or(self.pwe.map(CompressionMode::PointwiseTolerance))
            .or(self.direct_q.map(CompressionMode::DirectQuality))
    }
}

#[derive(Args)]
struct QoiArgs {
    /// QoI id: 1 symbolic, 2 x^2, 3 ln(x), 11 linear, 13 1/x
    #[arg(long)]
    qoi_id: Option<u32>,
    /// Expression for the symbolic QoI (variable `x`)
    #[arg(long)]
    qoi_expr: Option<String>,
    /// Coefficient of the linear QoI
    #[arg(long)]
    qoi_base: Option<f64>,
    /// Use closed-form bounds for the symbolic QoI (true | false)
    #[arg(long)]
    qoi_analytical: Option<bool>,
    /// Absolute tolerance on the QoI
    #[arg(long)]
    qoi_tol: Option<f64>,
    /// Edge of the cubic averaging region (1 = point-wise)
    #[arg(long)]
    qoi_block_size: Option<usize>,
    /// Tail-bound multiplier
    #[arg(long)]
    qoi_k: Option<f64>,
}

impl QoiArgs {
    fn apply(&self, params: &mut QoiParams) {
        if let Some(id) = self.qoi_id {
            params.meta = QoiMeta {
                id,
                ..params.meta.clone()
            };
        }
        if let Some(expr) = &self.qoi_expr {
            params.meta.expression = Some(expr.clone());
        }
        if let Some(base) = self.qoi_base {
            params.meta.scale = Some(base);
        }
        if let Some(analytical) = self.qoi_analytical {
            params.meta.analytical = analytical;
        }
        if let Some(tol) = self.qoi_tol {
            params.tolerance = tol;
        }
        if let Some(b) = self.qoi_block_size {
            params.block_size = b;
        }
        if let Some(k) = self.qoi_k {
            params.k = k;
        }
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn human_bytes(n: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.2} {}", v, UNITS[unit])
    }
}

fn dims3(v: &[usize], what: &str) -> anyhow::Result<[usize; 3]> {
    v.try_into()
        .map_err(|_| anyhow::anyhow!("{what} needs exactly three values, got {}", v.len()))
}

/// A raw volume as stored on disk.
enum Volume {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Volume {
    fn read(path: &Path, precision: Precision) -> anyhow::Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("reading volume {:?}", path))?;
        let width = precision.bytes_per_value();
        if bytes.len() % width != 0 {
            anyhow::bail!(
                "{:?} is {} bytes, not a whole number of {}-byte values",
                path,
                bytes.len(),
                width
            );
        }
        Ok(match precision {
            Precision::F32 => Volume::F32(
                bytes
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
            ),
            Precision::F64 => Volume::F64(
                bytes
                    .chunks_exact(8)
                    .map(|b| {
                        let mut w = [0u8; 8];
                        w.copy_from_slice(b);
                        f64::from_le_bytes(w)
                    })
                    .collect(),
            ),
        })
    }

    fn len(&self) -> usize {
        match self {
            Volume::F32(v) => v.len(),
            Volume::F64(v) => v.len(),
        }
    }

    fn write(&self, path: &Path) -> anyhow::Result<usize> {
        let bytes: Vec<u8> = match self {
            Volume::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Volume::F64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        };
        fs::write(path, &bytes).with_context(|| format!("writing volume {:?}", path))?;
        Ok(bytes.len())
    }
}

// ── Subcommand implementations ─────────────────────────────────────────────

fn run_compress(args: CompressArgs) -> anyhow::Result<()> {
    let mut job = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading job file {:?}", path))?;
            serde_json::from_str::<JobConfig>(&text)
                .with_context(|| format!("parsing job file {:?}", path))?
        }
        None => JobConfig::default(),
    };
    if let Some(d) = &args.dims {
        job.dims = dims3(d, "--dims")?;
    }
    if let Some(c) = &args.chunks {
        job.chunk_dims = dims3(c, "--chunks")?;
    }
    if let Some(t) = args.threads {
        job.num_threads = t;
    }
    if let Some(mode) = args.mode.mode() {
        job.mode = Some(mode);
    }
    args.qoi.apply(&mut job.qoi);
    if args.f64 {
        job.precision = Precision::F64;
    }
    job.high_prec |= args.high_prec;
    tracing::debug!(?job, "resolved job configuration");

    if job.dims.contains(&0) {
        anyhow::bail!("volume dims missing: pass --dims X Y Z or set them in the job file");
    }
    if job.mode.is_none() {
        anyhow::bail!("no fidelity mode: pass one of --bpp, --psnr, --pwe, --direct-q");
    }

    let volume = Volume::read(&args.input, job.precision)?;
    let expected: usize = job.dims.iter().product();
    if volume.len() != expected {
        anyhow::bail!(
            "{:?} holds {} values but dims {:?} need {}",
            args.input,
            volume.len(),
            job.dims,
            expected
        );
    }

    let mut comp = job.compressor(args.backend.codec_factory());
    let t0 = Instant::now();
    match &volume {
        Volume::F32(v) => comp.compress(v),
        Volume::F64(v) => comp.compress(v),
    }
    .with_context(|| format!("compressing {:?}", args.input))?;
    let elapsed = t0.elapsed();

    let stream = comp.get_encoded_bitstream();
    fs::write(&args.output, &stream)
        .with_context(|| format!("writing bitstream {:?}", args.output))?;

    let raw = (volume.len() * job.precision.bytes_per_value()) as u64;
    eprintln!("  back end    : {}", args.backend);
    eprintln!("  dims        : {:?}", job.dims);
    eprintln!("  chunk dims  : {:?}", comp.effective_chunk_dims());
    eprintln!("  chunks      : {}", comp.num_chunks());
    eprintln!("  raw size    : {}", human_bytes(raw));
    eprintln!("  compressed  : {}", human_bytes(stream.len() as u64));
    eprintln!("  ratio       : {:.2}x", raw as f64 / stream.len() as f64);
    eprintln!(
        "  bits/value  : {:.3}",
        stream.len() as f64 * 8.0 / volume.len() as f64
    );
    eprintln!(
        "  throughput  : {}/s",
        human_bytes((raw as f64 / elapsed.as_secs_f64()) as u64)
    );
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

fn run_decompress(
    input: PathBuf,
    output: PathBuf,
    threads: usize,
    as_f64: bool,
) -> anyhow::Result<()> {
    let stream = fs::read(&input).with_context(|| format!("reading bitstream {:?}", input))?;
    let mut dec = Decompressor::new(BackendKind::default().codec_factory());
    dec.set_num_threads(threads);
    dec.use_bitstream(&stream)
        .with_context(|| format!("parsing bitstream {:?}", input))?;

    let t0 = Instant::now();
    dec.decompress()
        .with_context(|| format!("decoding {:?}", input))?;
    let elapsed = t0.elapsed();

    let volume = if as_f64 || !dec.orig_is_float() {
        Volume::F64(dec.release_decoded_data())
    } else {
        Volume::F32(dec.release_decoded_data())
    };
    let written = volume.write(&output)?;

    eprintln!("  dims        : {:?}", dec.dims());
    eprintln!("  raw size    : {}", human_bytes(written as u64));
    eprintln!(
        "  throughput  : {}/s",
        human_bytes((written as f64 / elapsed.as_secs_f64()) as u64)
    );
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

fn run_inspect(file: PathBuf, show_chunks: bool) -> anyhow::Result<()> {
    let stream = fs::read(&file).with_context(|| format!("reading bitstream {:?}", file))?;
    let header = Header::from_bytes(&stream)
        .with_context(|| format!("parsing header of {:?}", file))?;
    let value_bytes: u64 = if header.orig_is_float() { 4 } else { 8 };
    let raw = (header.num_values() as u64).saturating_mul(value_bytes);

    println!("=== qvol bitstream: {:?} ===", file);
    println!();
    println!("  format version : {}", header.version);
    println!("  flags          : 0x{:02x}", header.flags);
    println!(
        "  source type    : {}",
        if header.orig_is_float() { "f32" } else { "f64" }
    );
    println!("  volume dims    : {:?}", header.vol_dims);
    println!("  chunk dims     : {:?}", header.chunk_dims);
    println!("  chunks         : {}", header.num_chunks());
    println!("  header         : {}", human_bytes(header.header_len() as u64));
    println!("  payload        : {}", human_bytes(header.payload_len() as u64));
    println!("  file on disk   : {}", human_bytes(stream.len() as u64));
    println!("  ratio          : {:.2}x", raw as f64 / stream.len() as f64);

    if show_chunks {
        let payload = &stream[header.header_len()..];
        println!();
        println!(
            "  {:>8}  {:>14}  {:>12}  {:>18}  {:>16}",
            "chunk", "file offset", "length", "box offset", "xxh3"
        );
        println!("  {}", "-".repeat(76));
        for (i, (range, cbox)) in header
            .chunk_ranges()
            .into_iter()
            .zip(header.chunk_boxes())
            .enumerate()
        {
            let checksum = payload
                .get(range.clone())
                .map(xxh3_64)
                .map_or_else(|| "truncated".to_string(), |h| format!("{:016x}", h));
            println!(
                "  {:>8}  {:>14}  {:>12}  {:>18}  {:>16}",
                i,
                header.header_len() + range.start,
                human_bytes(range.len() as u64),
                format!("{:?}", cbox.offset),
                checksum
            );
        }
    }
    Ok(())
}

fn evaluate<T: Element>(orig: &[T], recon: &[T]) -> anyhow::Result<ErrorStats> {
    Ok(ErrorStats::compare(orig, recon)?)
}

fn run_evaluate(orig: PathBuf, recon: PathBuf, as_f64: bool) -> anyhow::Result<()> {
    let precision = if as_f64 { Precision::F64 } else { Precision::F32 };
    let stats = match (
        Volume::read(&orig, precision)?,
        Volume::read(&recon, precision)?,
    ) {
        (Volume::F32(x), Volume::F32(y)) => evaluate(&x, &y),
        (Volume::F64(x), Volume::F64(y)) => evaluate(&x, &y),
        _ => anyhow::bail!("volumes were read with different precisions"),
    }
    .with_context(|| format!("comparing {:?} with {:?}", orig, recon))?;
    println!("{stats}");
    Ok(())
}

// ── Entry point ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Compress(args) => run_compress(args),
        Commands::Decompress {
            input,
            output,
            threads,
            f64: as_f64,
        } => run_decompress(input, output, threads, as_f64),
        Commands::Inspect { file, chunks } => run_inspect(file, chunks),
        Commands::Evaluate {
            orig,
            recon,
            f64: as_f64,
        } => run_evaluate(orig, recon, as_f64),
    }
}
