//! CLI entrypoint for the embpthread stress harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use embpthread_core::SpinPolicy;
use embpthread_harness::structured_log::{LogEmitter, validate_log_file};
use embpthread_harness::{RunConfig, Scenario, ScenarioParams, ScenarioRunner, write_run_artifacts};
use tracing_subscriber::EnvFilter;

/// Stress tooling for embpthread.
#[derive(Debug, Parser)]
#[command(name = "embpthread-harness")]
#[command(about = "Stress and conformance harness for embpthread")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SpinArg {
    Auto,
    Spin,
    Block,
}

impl From<SpinArg> for SpinPolicy {
    fn from(arg: SpinArg) -> Self {
        match arg {
            SpinArg::Auto => Self::Auto,
            SpinArg::Spin => Self::AlwaysSpin,
            SpinArg::Block => Self::AlwaysBlock,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run stress scenarios and write a JSONL trace plus a JSON report.
    Run {
        /// Scenario to run; repeat for several. Defaults to all of them.
        #[arg(long = "scenario", value_enum)]
        scenarios: Vec<Scenario>,
        /// Worker threads per scenario.
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Iterations per thread, or rounds for round-based scenarios.
        #[arg(long, default_value_t = 1_000)]
        iterations: usize,
        /// Seed for timing jitter.
        #[arg(long, default_value_t = 0x5eed)]
        seed: u64,
        /// Spinlock strategy.
        #[arg(long, value_enum, default_value = "auto")]
        spin: SpinArg,
        /// Processor count to report instead of the machine's.
        #[arg(long)]
        processors: Option<usize>,
        /// Directory for trace.jsonl, report.json and artifact_index.json.
        #[arg(long, default_value = "target/embpthread-harness")]
        out_dir: PathBuf,
        /// Run id stamped on every trace id (defaults to the process id).
        #[arg(long)]
        run_id: Option<String>,
    },
    /// List the available scenarios.
    List,
    /// Validate a structured JSONL log.
    ValidateLog {
        /// JSONL log path.
        #[arg(long)]
        log: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("EMBPTHREAD_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            scenarios,
            threads,
            iterations,
            seed,
            spin,
            processors,
            out_dir,
            run_id,
        } => {
            let scenarios = if scenarios.is_empty() {
                Scenario::ALL.to_vec()
            } else {
                scenarios
            };
            let run_id = run_id.unwrap_or_else(|| format!("run-{}", std::process::id()));
            std::fs::create_dir_all(&out_dir)?;
            let trace_path = out_dir.join("trace.jsonl");
            let mut emitter =
                LogEmitter::to_file(&trace_path, embpthread_harness::runner::SUITE, &run_id)?;

            let runner = ScenarioRunner::new(
                run_id,
                RunConfig {
                    scenarios,
                    params: ScenarioParams {
                        threads,
                        iterations,
                        seed,
                    },
                    spin_policy: spin.into(),
                    processors,
                },
            );
            let report = runner.run(&mut emitter)?;
            drop(emitter);
            let artifacts = write_run_artifacts(&out_dir, &report, Some(&trace_path))?;

            for result in &report.results {
                let note = result.message.as_deref().unwrap_or("");
                eprintln!(
                    "{:<20} {:?} ({} ms) {note}",
                    result.scenario, result.outcome, result.duration_ms
                );
            }
            eprintln!(
                "{} passed, {} failed; report at {}",
                report.passed,
                report.failed,
                artifacts.report.display()
            );
            if !report.all_passed() {
                return Err(format!("{} scenario(s) failed", report.failed).into());
            }
        }
        Command::List => {
            for scenario in Scenario::ALL {
                println!("{:<20} {}", scenario.name(), scenario.description());
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            eprintln!("{lines} line(s), {} error(s)", errors.len());
            if !errors.is_empty() {
                return Err(format!("{} validation error(s)", errors.len()).into());
            }
        }
    }

    Ok(())
}
