//! CLI entrypoint for the tieralloc workload harness.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Serialize;
use tieralloc_core::AllocMode;
use tieralloc_harness::{
    ChurnConfig, HarnessError, OomConfig, RunOutput, parse_log_level, run_churn,
    run_oom, run_reuse, write_jsonl,
};

/// Deterministic allocation workloads for tieralloc.
#[derive(Debug, Parser)]
#[command(name = "tieralloc-harness")]
#[command(about = "Workload harness for the tieralloc two-tier allocator")]
struct Cli {
    /// Write lifecycle records as JSON lines to this path.
    #[arg(long, global = true)]
    log: Option<PathBuf>,
    /// Minimum lifecycle level to record (`trace`..`error`, or `off`).
    #[arg(long, global = true, default_value = "debug")]
    log_level: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a seeded random allocate/free/realloc workload.
    Churn {
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0xDEAD_BEEF")]
        seed: String,
        /// Number of operations.
        #[arg(long, default_value_t = 10_000)]
        ops: usize,
        /// Largest request size in bytes.
        #[arg(long, default_value_t = 256)]
        max_size: usize,
        /// Deallocation mode (`strict` or `hardened`).
        #[arg(long, default_value = "strict")]
        mode: String,
    },
    /// Check LIFO reuse and refill contiguity.
    Reuse,
    /// Drive the OOM retry loop through a failing heap.
    Oom {
        /// System allocations that fail before the heap recovers.
        #[arg(long, default_value_t = 3)]
        fail_first: usize,
        /// Run without an OOM handler.
        #[arg(long)]
        no_handler: bool,
        /// Request size in bytes.
        #[arg(long, default_value_t = 4096)]
        size: usize,
    },
}

fn main() -> Result<(), HarnessError> {
    let cli = Cli::parse();
    // Records are only gathered when they have somewhere to go.
    let log_level = match cli.log {
        Some(_) => parse_log_level(&cli.log_level)?,
        None => None,
    };

    match cli.command {
        Command::Churn {
            seed,
            ops,
            max_size,
            mode,
        } => {
            let config = ChurnConfig {
                seed: parse_seed(&seed)?,
                ops,
                max_size,
                mode: parse_mode(&mode)?,
                log_level,
            };
            eprintln!(
                "Running churn: seed={:#x} ops={ops} max_size={max_size} mode={}",
                config.seed,
                config.mode.as_str()
            );
            emit(run_churn(&config)?, cli.log.as_deref())
        }
        Command::Reuse => {
            eprintln!("Running reuse checks");
            emit(run_reuse(log_level)?, cli.log.as_deref())
        }
        Command::Oom {
            fail_first,
            no_handler,
            size,
        } => {
            let config = OomConfig {
                fail_first,
                with_handler: !no_handler,
                size,
                log_level,
            };
            eprintln!(
                "Running oom drill: fail_first={fail_first} handler={} size={size}",
                config.with_handler
            );
            emit(run_oom(&config)?, cli.log.as_deref())
        }
    }
}

fn emit<R: Serialize>(output: RunOutput<R>, log: Option<&Path>) -> Result<(), HarnessError> {
    println!("{}", serde_json::to_string_pretty(&output.report)?);
    if let Some(path) = log {
        write_jsonl(path, &output.records)?;
        eprintln!(
            "Wrote {} lifecycle records to {}",
            output.records.len(),
            path.display()
        );
    }
    Ok(())
}

fn parse_seed(raw: &str) -> Result<u64, HarnessError> {
    let s = raw.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(&hex.replace('_', ""), 16)
    } else {
        s.replace('_', "").parse::<u64>()
    };
    parsed.map_err(|err| HarnessError::InvalidArgument(format!("seed '{raw}': {err}")))
}

fn parse_mode(raw: &str) -> Result<AllocMode, HarnessError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "strict" | "hardened" => Ok(AllocMode::from_str_loose(raw.trim())),
        _ => Err(HarnessError::InvalidArgument(format!(
            "mode '{raw}': expected strict or hardened"
        ))),
    }
}
