use clap::Parser;
use clap::builder::RangedU64ValueParser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use agent_runner::cases::parse_only_case_ids;
use agent_runner::config::*;
use agent_runner::harness::{HarnessConfig, HarnessReport, run_harness};
use agent_runner::sanitize::RedactionPreset;

/// Agent Runner - run evaluation cases against baseline and new agent deployments
#[derive(Parser, Debug)]
#[command(
    name = "agent-runner",
    version,
    about = "Run every case against the baseline and new variants of an agent endpoint",
    after_help = "Every option can also be set through its AGENT_RUNNER_* environment variable.\n\
        Per-request failures are recorded as artifacts and never change the exit code."
)]
struct Args {
    /// Agent endpoint base URL; requests go to {base}/run-case
    #[arg(long, env = ENV_BASE_URL, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Path to the cases JSON array
    #[arg(long, env = ENV_CASES, default_value = DEFAULT_CASES_PATH)]
    cases: PathBuf,

    /// Output root directory
    #[arg(long, env = ENV_OUT, default_value = DEFAULT_OUT_DIR)]
    out: PathBuf,

    /// Run identifier (default: generated from the current time)
    #[arg(long, env = ENV_RUN_ID)]
    run_id: Option<String>,

    /// Comma-separated case ids to run
    #[arg(long, env = ENV_ONLY)]
    only: Option<String>,

    /// Per-attempt deadline in milliseconds
    #[arg(long, env = ENV_TIMEOUT_MS, default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Retries after the first attempt for transient failures
    #[arg(long, env = ENV_RETRIES, default_value_t = DEFAULT_RETRIES)]
    retries: u32,

    /// Base of the exponential back-off in milliseconds
    #[arg(long, env = ENV_BACKOFF_MS, default_value_t = DEFAULT_BACKOFF_MS)]
    backoff_ms: u64,

    /// Number of concurrent workers
    #[arg(
        long,
        env = ENV_CONCURRENCY,
        default_value_t = DEFAULT_CONCURRENCY,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..)
    )]
    concurrency: usize,

    /// Bytes of a failing body kept in the failure artifact
    #[arg(long, env = ENV_BODY_SNIPPET_BYTES, default_value_t = DEFAULT_BODY_SNIPPET_BYTES)]
    body_snippet_bytes: usize,

    /// Maximum bytes read from any response body
    #[arg(long, env = ENV_MAX_BODY_BYTES, default_value_t = DEFAULT_MAX_BODY_BYTES)]
    max_body_bytes: u64,

    /// Write failing bodies and their metadata under failures/
    #[arg(long, env = ENV_SAVE_FULL_BODY_ON_FAILURE)]
    save_full_body_on_failure: bool,

    /// Redaction applied to persisted results and snippets
    #[arg(long, value_enum, env = ENV_REDACTION_PRESET, default_value_t = RedactionPreset::None)]
    redaction_preset: RedactionPreset,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    fn into_config(self) -> (HarnessConfig, bool) {
        let runner = RunnerConfig::new(self.base_url)
            .timeout_ms(self.timeout_ms)
            .retries(self.retries)
            .backoff_ms(self.backoff_ms)
            .concurrency(self.concurrency)
            .body_snippet_bytes(self.body_snippet_bytes)
            .max_body_bytes(self.max_body_bytes)
            .save_full_body_on_failure(self.save_full_body_on_failure)
            .redaction(self.redaction_preset);
        let config = HarnessConfig {
            cases_path: self.cases,
            output_dir: self.out,
            run_id: self.run_id,
            only: parse_only_case_ids(self.only.as_deref()),
            runner,
        };
        (config, self.json)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Exits 2 on usage errors, 0 on --help/--version
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,agent_runner=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let (config, json) = args.into_config();

    match run_harness(&config).await {
        Ok(report) => match print_report(&report, json) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("error: {}", e);
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_report(report: &HarnessReport, json: bool) -> serde_json::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let summary = &report.summary;
    println!("Run {} completed: {} ok, {} failed", report.run_id, summary.all.ok, summary.all.failed);
    for (label, stats) in [("baseline", &summary.baseline), ("new", &summary.new)] {
        println!(
            "  {:<8} ok={} failed={} attempts={} avg={}ms p95={}ms p99={}ms",
            label, stats.ok, stats.failed, stats.attempts, stats.avg_ms, stats.p95_ms, stats.p99_ms
        );
    }
    for failure in report.failures() {
        let class = failure.failure_class.map(|c| c.to_string()).unwrap_or_default();
        println!(
            "  FAILED {} [{}] {} after {} attempt(s)",
            failure.case_id, failure.variant, class, failure.attempts
        );
    }
    println!("\nBaseline: {}", report.baseline_dir.display());
    println!("New:      {}", report.new_dir.display());
    Ok(())
}
