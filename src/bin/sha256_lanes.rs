//! sha256_lanes: batch SHA-256 over 33-byte records
//!
//! Usage:
//!   sha256_lanes [OPTIONS] selftest
//!   sha256_lanes [OPTIONS] bench --count 10000000 --runs 3 [--json]
//!   sha256_lanes [OPTIONS] hash < records.hex
//!
//! Options:
//!   --backend cpu|vulkan   Execution device (default: cpu)
//!   --kernel PATH          Compiled lane kernel (vulkan)
//!   --device N             GPU index (vulkan)
//!   --group-size N         Lanes per execution group (default: 128)
//!   --threads N            Worker threads (cpu)
//!   --verbose              Debug logging

use std::io::{self, BufRead, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};

use sha256_lanes::reference;
use sha256_lanes::{
    AnyDevice, BackendOptions, BatchHasher, CpuGridOptions, Device, DispatchConfig, EngineError,
    VulkanOptions, DEFAULT_GROUP_SIZE, DIGEST_LEN, RECORD_LEN,
};

/// Compressed secp256k1 generator point, the fixed self-test record.
const TEST_RECORD: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
const TEST_DIGEST: &str = "0f715baf5d4c2ed329785cef29e562f73488c8a2bb9dbc5700b361d54b9b0554";

#[derive(Parser)]
#[command(name = "sha256_lanes", version, about = "One-hash-per-lane SHA-256 over 33-byte records")]
struct Cli {
    /// Execution device
    #[arg(long, value_enum, default_value_t = Backend::Cpu, global = true)]
    backend: Backend,

    /// Compiled SPIR-V lane kernel (vulkan backend)
    #[arg(long, global = true)]
    kernel: Option<PathBuf>,

    /// GPU index (vulkan backend)
    #[arg(long, default_value_t = 0, global = true)]
    device: usize,

    /// Lanes per execution group
    #[arg(long, default_value_t = DEFAULT_GROUP_SIZE, global = true)]
    group_size: u32,

    /// Worker threads (cpu backend; default: all cores)
    #[arg(long, global = true)]
    threads: Option<usize>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Cpu,
    Vulkan,
}

#[derive(Subcommand)]
enum Command {
    /// Check the engine against the reference implementation
    Selftest,

    /// Measure throughput on a synthetic batch
    Bench {
        /// Records per batch
        #[arg(long, default_value_t = 10_000_000)]
        count: usize,

        /// Timed runs after one warm-up run
        #[arg(long, default_value_t = 3)]
        runs: usize,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Hash hex records from stdin, one per line
    Hash,
}

impl Cli {
    fn backend_options(&self) -> BackendOptions {
        match self.backend {
            Backend::Cpu => BackendOptions::Cpu(CpuGridOptions { threads: self.threads, memory_limit: None }),
            Backend::Vulkan => {
                let mut opts = VulkanOptions { device_index: self.device, ..Default::default() };
                if let Some(path) = &self.kernel {
                    opts.kernel_path = path.clone();
                }
                BackendOptions::Vulkan(opts)
            }
        }
    }
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let hasher = match BatchHasher::<AnyDevice>::open(
        &cli.backend_options(),
        DispatchConfig { group_size: cli.group_size },
    ) {
        Ok(hasher) => hasher,
        Err(e) => {
            eprintln!("Error: failed to initialize engine: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match &cli.command {
        Command::Selftest => selftest(&hasher),
        Command::Bench { count, runs, json } => bench(&hasher, *count, *runs, *json),
        Command::Hash => hash_stdin(&hasher),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn selftest(hasher: &BatchHasher<AnyDevice>) -> CliResult<()> {
    let device = hasher.device().map(|d| d.name().to_string()).unwrap_or_default();
    println!("Self-test on {}", device);

    // Single known vector
    let record = hex::decode(TEST_RECORD)?;
    let mut digest = [0u8; DIGEST_LEN];
    hasher.hash_batch(&record, &mut digest, 1)?;
    let got = hex::encode(digest);
    println!("  input:    {}", TEST_RECORD);
    println!("  expected: {}", TEST_DIGEST);
    println!("  got:      {}", got);
    if got != TEST_DIGEST {
        return Err("single vector mismatch".into());
    }
    println!("  single vector: PASS");

    // 1000 records, last byte varies
    let count = 1000;
    let mut input = Vec::with_capacity(count * RECORD_LEN);
    for i in 0..count {
        let mut r = record.clone();
        r[RECORD_LEN - 1] = i as u8;
        input.extend_from_slice(&r);
    }
    let mut output = vec![0u8; count * DIGEST_LEN];
    hasher.hash_batch(&input, &mut output, count)?;
    reference::verify_batch(&input, &output)?;
    println!("  batch of {}: PASS", count);

    Ok(())
}

fn bench(hasher: &BatchHasher<AnyDevice>, count: usize, runs: usize, json: bool) -> CliResult<()> {
    if runs == 0 {
        return Err(EngineError::PreconditionViolation("--runs must be at least 1".to_string()).into());
    }

    let (input, mut output) = synthetic_batch(count)?;

    log::info!("Benchmark: {} records, {} runs (+1 warm-up)", count, runs);
    hasher.hash_batch(&input, &mut output, count)?;

    let mut rates = Vec::with_capacity(runs);
    for run in 0..runs {
        let start = Instant::now();
        hasher.hash_batch(&input, &mut output, count)?;
        let secs = start.elapsed().as_secs_f64();
        let mhash = count as f64 / secs / 1e6;
        log::debug!("run {}: {:.3}s ({:.2} MH/s)", run, secs, mhash);
        rates.push((secs, mhash));
    }

    // Spot-check a few records against the reference
    for i in [0, count / 2, count.saturating_sub(1)] {
        if i >= count {
            continue;
        }
        let expected = reference::digest(&input[i * RECORD_LEN..(i + 1) * RECORD_LEN]);
        if output[i * DIGEST_LEN..(i + 1) * DIGEST_LEN] != expected {
            return Err(format!("digest mismatch at record {}", i).into());
        }
    }

    let best = rates.iter().map(|&(_, m)| m).fold(0.0, f64::max);
    let mean = rates.iter().map(|&(_, m)| m).sum::<f64>() / runs as f64;
    let device = hasher.device().map(|d| d.name().to_string()).unwrap_or_default();

    if json {
        let report = serde_json::json!({
            "device": device,
            "group_size": hasher.config().group_size,
            "count": count,
            "runs": rates.iter().map(|&(s, m)| serde_json::json!({ "seconds": s, "mhash_per_sec": m })).collect::<Vec<_>>(),
            "mean_mhash_per_sec": mean,
            "best_mhash_per_sec": best,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Device:     {}", device);
        println!("Records:    {}", count);
        for (run, (secs, mhash)) in rates.iter().enumerate() {
            println!("Run {:<3}     {:.3}s  {:.2} MH/s", run, secs, mhash);
        }
        println!("Mean:       {:.2} MH/s", mean);
        println!("Best:       {:.2} MH/s", best);
    }

    Ok(())
}

/// Packed records with a repeating byte pattern, plus zeroed digest slots.
fn synthetic_batch(count: usize) -> Result<(Vec<u8>, Vec<u8>), EngineError> {
    let overflow = || EngineError::PreconditionViolation(format!("--count {} is too large", count));
    let input_len = count.checked_mul(RECORD_LEN).ok_or_else(overflow)?;
    let output_len = count.checked_mul(DIGEST_LEN).ok_or_else(overflow)?;

    let mut input = Vec::new();
    input
        .try_reserve_exact(input_len)
        .map_err(|e| EngineError::AllocationFailed { bytes: input_len, reason: e.to_string() })?;
    input.extend((0..input_len).map(|i| (i % 256) as u8));

    let mut output = Vec::new();
    output
        .try_reserve_exact(output_len)
        .map_err(|e| EngineError::AllocationFailed { bytes: output_len, reason: e.to_string() })?;
    output.resize(output_len, 0);

    Ok((input, output))
}

fn hash_stdin(hasher: &BatchHasher<AnyDevice>) -> CliResult<()> {
    let mut input = Vec::new();
    let mut count = 0;

    for (lineno, line) in io::stdin().lock().lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record = hex::decode(line).map_err(|e| format!("line {}: {}", lineno + 1, e))?;
        if record.len() != RECORD_LEN {
            return Err(format!(
                "line {}: record is {} bytes, expected {}",
                lineno + 1,
                record.len(),
                RECORD_LEN
            )
            .into());
        }
        input.extend_from_slice(&record);
        count += 1;
    }

    let mut output = vec![0u8; count * DIGEST_LEN];
    hasher.hash_batch(&input, &mut output, count)?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for digest in output.chunks_exact(DIGEST_LEN) {
        writeln!(out, "{}", hex::encode(digest))?;
    }
    out.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha256_lanes::ErrorKind;

    #[test]
    fn test_synthetic_batch_sizes() {
        let (input, output) = synthetic_batch(10).unwrap();
        assert_eq!(input.len(), 10 * RECORD_LEN);
        assert_eq!(output.len(), 10 * DIGEST_LEN);
        assert_eq!(input[257], 1);
    }

    #[test]
    fn test_synthetic_batch_rejects_overflowing_count() {
        let err = synthetic_batch(usize::MAX / 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionViolation);
    }

    #[test]
    fn test_synthetic_batch_reports_unsatisfiable_allocation() {
        // Fits in usize but not in any address space.
        let err = synthetic_batch(usize::MAX / RECORD_LEN).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AllocationFailed);
    }

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["sha256_lanes", "bench", "--count", "5", "--backend", "vulkan"]).unwrap();
        assert!(matches!(cli.backend, Backend::Vulkan));
        assert!(matches!(cli.command, Command::Bench { count: 5, runs: 3, json: false }));
    }
}
