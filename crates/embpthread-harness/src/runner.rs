//! Runs scenarios against fresh runtimes and records the results.

use std::sync::Arc;
use std::time::Instant;

use embpthread_core::{Runtime, RuntimeConfig, SpinPolicy};
use embpthread_osal::{HostOsal, Osal};

use crate::report::{RunReport, ScenarioResult};
use crate::scenarios::{Scenario, ScenarioError, ScenarioParams};
use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};

/// Suite name stamped on every trace id and report.
pub const SUITE: &str = "stress";

/// What to run and how.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub scenarios: Vec<Scenario>,
    pub params: ScenarioParams,
    pub spin_policy: SpinPolicy,
    /// Processor count the host layer reports; `None` asks the machine.
    pub processors: Option<usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            scenarios: Scenario::ALL.to_vec(),
            params: ScenarioParams::default(),
            spin_policy: SpinPolicy::Auto,
            processors: None,
        }
    }
}

#[must_use]
pub const fn spin_policy_name(policy: SpinPolicy) -> &'static str {
    match policy {
        SpinPolicy::Auto => "auto",
        SpinPolicy::AlwaysSpin => "spin",
        SpinPolicy::AlwaysBlock => "block",
    }
}

/// Runs each scenario on its own [`Runtime`] so one failure cannot leak
/// threads or objects into the next.
pub struct ScenarioRunner {
    run_id: String,
    config: RunConfig,
}

impl ScenarioRunner {
    #[must_use]
    pub fn new(run_id: impl Into<String>, config: RunConfig) -> Self {
        Self {
            run_id: run_id.into(),
            config,
        }
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn osal(&self) -> HostOsal {
        match self.config.processors {
            Some(n) => HostOsal::with_processors(n),
            None => HostOsal::new(),
        }
    }

    fn runtime(&self) -> embpthread_core::Result<Runtime> {
        Runtime::init(
            Arc::new(self.osal()),
            RuntimeConfig::from_env().with_spin_policy(self.config.spin_policy),
        )
    }

    /// Run every configured scenario, logging each to `emitter`.
    pub fn run(&self, emitter: &mut LogEmitter) -> std::io::Result<RunReport> {
        let policy = spin_policy_name(self.config.spin_policy);
        let params = self.config.params;
        let mut report = RunReport::new(
            &self.run_id,
            SUITE,
            policy,
            self.osal().processor_count(),
            params,
        );

        emitter.emit_entry(
            LogEntry::new("", LogLevel::Info, "run_start")
                .with_spin_policy(policy)
                .with_load(params.threads, params.iterations)
                .with_details(serde_json::json!({
                    "scenarios": self.config.scenarios.iter().map(|s| s.name()).collect::<Vec<_>>(),
                    "seed": params.seed,
                })),
        )?;
        tracing::info!(
            run_id = %self.run_id,
            scenarios = self.config.scenarios.len(),
            spin_policy = policy,
            "harness run starting"
        );

        for &scenario in &self.config.scenarios {
            emitter.emit_entry(
                LogEntry::new("", LogLevel::Debug, "scenario_start")
                    .with_scenario(scenario.name())
                    .with_load(params.threads, params.iterations),
            )?;
            let result = self.run_one(scenario);
            let level = match result.outcome {
                Outcome::Pass | Outcome::Skip => LogLevel::Info,
                _ => LogLevel::Error,
            };
            let mut entry = LogEntry::new("", level, "scenario_end")
                .with_scenario(scenario.name())
                .with_spin_policy(policy)
                .with_outcome(result.outcome)
                .with_load(params.threads, params.iterations)
                .with_operations(result.operations)
                .with_duration_ms(result.duration_ms)
                .with_details(result.details.clone());
            if let Some(errno) = result.errno {
                entry = entry.with_errno(errno);
            }
            emitter.emit_entry(entry)?;
            report.push(result);
        }

        let mut end = LogEntry::new("", LogLevel::Info, "run_end").with_details(
            serde_json::json!({ "passed": report.passed, "failed": report.failed }),
        );
        end = end.with_outcome(if report.all_passed() {
            Outcome::Pass
        } else {
            Outcome::Fail
        });
        emitter.emit_entry(end)?;
        emitter.flush()?;
        tracing::info!(
            passed = report.passed,
            failed = report.failed,
            "harness run finished"
        );
        Ok(report)
    }

    /// Run a single scenario on a fresh runtime.
    #[must_use]
    pub fn run_one(&self, scenario: Scenario) -> ScenarioResult {
        let started = Instant::now();
        let rt = match self.runtime() {
            Ok(rt) => rt,
            Err(err) => {
                tracing::error!(scenario = scenario.name(), %err, "runtime init failed");
                return ScenarioResult {
                    scenario: scenario.name().to_string(),
                    outcome: Outcome::Error,
                    duration_ms: 0,
                    operations: 0,
                    errno: Some(err.errno()),
                    message: Some(format!("runtime init failed: {err}")),
                    details: serde_json::Value::Null,
                };
            }
        };

        tracing::debug!(scenario = scenario.name(), "scenario starting");
        let outcome = scenario.run(&rt, &self.config.params);
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if let Err(err) = rt.terminate() {
            tracing::warn!(scenario = scenario.name(), %err, "runtime terminate failed");
        }

        match outcome {
            Ok(stats) => {
                tracing::info!(
                    scenario = scenario.name(),
                    operations = stats.operations,
                    duration_ms,
                    "scenario passed"
                );
                ScenarioResult {
                    scenario: scenario.name().to_string(),
                    outcome: Outcome::Pass,
                    duration_ms,
                    operations: stats.operations,
                    errno: None,
                    message: None,
                    details: stats.details,
                }
            }
            Err(ScenarioError::Violation { message, details }) => {
                tracing::error!(scenario = scenario.name(), %message, "scenario failed");
                ScenarioResult {
                    scenario: scenario.name().to_string(),
                    outcome: Outcome::Fail,
                    duration_ms,
                    operations: 0,
                    errno: None,
                    message: Some(message),
                    details,
                }
            }
            Err(ScenarioError::Runtime(err)) => {
                tracing::error!(scenario = scenario.name(), %err, "scenario hit runtime error");
                ScenarioResult {
                    scenario: scenario.name().to_string(),
                    outcome: Outcome::Error,
                    duration_ms,
                    operations: 0,
                    errno: Some(err.errno()),
                    message: Some(err.to_string()),
                    details: serde_json::Value::Null,
                }
            }
        }
    }
}
