// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use memcheck::{
    ExpectedUsage, LogScanner, MemCheckConfig, MemoryVerifier, Verdict, check_keywords,
    env_toggle, parse_generated_output,
};

/// Command line arguments for memcheck.
#[derive(Debug, Parser)]
#[command(name = "memcheck")]
#[command(about = "Verify memory usage and generated output recorded in inference logs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check a log's memory envelope against expectations
    Verify(VerifyArgs),
    /// Print the metrics extracted from a log
    Scan(ScanArgs),
    /// Score generated text against expected keywords
    Keywords(KeywordArgs),
}

#[derive(Debug, Args)]
struct VerifyArgs {
    /// Log captured from the inference process
    #[arg(long)]
    log: PathBuf,

    /// Expected peak non-KV memory per rank, in GiB
    #[arg(long, required_unless_present = "model", conflicts_with = "model")]
    peak: Option<f64>,

    /// Look up the expected peak by model name in the configuration
    #[arg(long)]
    model: Option<String>,

    /// Number of ranks that wrote to the log [default: 1, or the model's ranks]
    #[arg(long)]
    ranks: Option<usize>,

    /// Expected model weight memory, in GiB
    #[arg(long)]
    model_size: Option<f64>,

    /// Expected memory outside the framework allocator, in GiB
    #[arg(long)]
    extra: Option<f64>,
}

#[derive(Debug, Args)]
struct ScanArgs {
    #[arg(long)]
    log: PathBuf,

    #[arg(long, default_value_t = 1)]
    ranks: usize,

    /// Emit JSON instead of text
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct KeywordArgs {
    /// Captured stdout of the generation run
    #[arg(long)]
    output: PathBuf,

    /// JSON file holding one keyword array per prompt
    #[arg(long)]
    expected: PathBuf,

    /// Minimum fraction of keywords each generation must contain
    #[arg(long, default_value_t = 0.8)]
    ratio: f64,
}

fn main() -> Result<()> {
    memcheck::logging::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Verify(args) => verify(args),
        Command::Scan(args) => scan(args),
        Command::Keywords(args) => keywords(args),
    }
}

fn open_log(path: &Path) -> Result<BufReader<File>> {
    let file =
        File::open(path).with_context(|| format!("failed to open log {}", path.display()))?;
    Ok(BufReader::new(file))
}

fn verify(args: VerifyArgs) -> Result<()> {
    let config = match MemCheckConfig::from_env() {
        Ok(config) => config,
        // An explicit disable holds even when the rest of the configuration is broken.
        Err(e) if env_toggle() == Some(false) => {
            tracing::warn!("ignoring invalid memcheck configuration: {e}");
            MemCheckConfig::disabled()
        }
        Err(e) => return Err(e).context("failed to load memcheck configuration"),
    };
    let verifier = MemoryVerifier::new(&config);
    if !verifier.is_enabled() {
        println!("memory usage verification skipped");
        return Ok(());
    }

    // --ranks, --model-size and --extra override the named expectation.
    let (peak, default_ranks) = match (&args.model, args.peak) {
        (Some(model), _) => match config.expectation(model) {
            Some(expectation) => (expectation.peak_gib, expectation.ranks),
            None => {
                println!("no memory expectation configured for {model}, verification skipped");
                return Ok(());
            }
        },
        (None, Some(peak)) => (peak, 1),
        (None, None) => bail!("either --peak or --model is required"),
    };
    let expected = ExpectedUsage {
        peak,
        model_size: args.model_size.unwrap_or_default(),
        kv_size: 0.0,
        extra: args.extra.unwrap_or_default(),
    };
    let ranks = args.ranks.unwrap_or(default_ranks);
    tracing::debug!(peak, ranks, "verifying memory usage");

    let log = open_log(&args.log)?;
    let verdict = verifier.verify(Some(log), &expected, ranks)?;

    match verdict {
        Verdict::Skipped => println!("memory usage verification skipped"),
        Verdict::Passed(report) => println!("{report}\nmemory usage within expectations"),
    }
    Ok(())
}

fn scan(args: ScanArgs) -> Result<()> {
    let config = MemCheckConfig::from_env().context("failed to load memcheck configuration")?;
    let stats = LogScanner::new()
        .with_default_fraction(config.default_fraction)
        .scan(open_log(&args.log)?, args.ranks)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    for (key, values) in stats.series.iter() {
        println!("{key}: {values:?}");
    }
    println!("fraction: {:.2}", stats.fraction);
    println!("kv_mem_size: {:.2}", stats.kv_mem_size);
    println!("tmp_kv: {:.2}", stats.tmp_kv);
    println!("start_time_mem: {:.2}", stats.start_time_mem);
    Ok(())
}

fn keywords(args: KeywordArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.output)
        .with_context(|| format!("failed to read {}", args.output.display()))?;
    let expected: Vec<Vec<String>> = serde_json::from_str(
        &std::fs::read_to_string(&args.expected)
            .with_context(|| format!("failed to read {}", args.expected.display()))?,
    )
    .context("expected keywords must be a JSON array of string arrays")?;

    let outputs = parse_generated_output(&text);
    tracing::debug!(generations = outputs.len(), "parsed generated output");

    let scores = check_keywords(&outputs, &expected, args.ratio)?;
    for score in scores {
        println!("{:.2} {:?}", score.ratio, score.generated);
    }
    Ok(())
}
