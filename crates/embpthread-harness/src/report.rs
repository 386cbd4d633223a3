//! Machine-readable run reports and on-disk artifacts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::Digest;

use crate::scenarios::ScenarioParams;
use crate::structured_log::{ArtifactIndex, Outcome, now_utc};

/// Result of one scenario in a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub scenario: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub operations: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub details: serde_json::Value,
}

/// Aggregate report for a harness run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub report_version: u32,
    pub run_id: String,
    pub suite: String,
    pub generated_utc: String,
    pub spin_policy: String,
    pub processors: usize,
    pub params: ScenarioParams,
    pub results: Vec<ScenarioResult>,
    pub passed: usize,
    pub failed: usize,
}

impl RunReport {
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        suite: impl Into<String>,
        spin_policy: impl Into<String>,
        processors: usize,
        params: ScenarioParams,
    ) -> Self {
        Self {
            report_version: 1,
            run_id: run_id.into(),
            suite: suite.into(),
            generated_utc: now_utc(),
            spin_policy: spin_policy.into(),
            processors,
            params,
            results: Vec::new(),
            passed: 0,
            failed: 0,
        }
    }

    pub fn push(&mut self, result: ScenarioResult) {
        if result.outcome == Outcome::Pass {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.results.push(result);
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

/// Lowercase hex SHA-256 of `data`.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex_lower(&sha2::Sha256::digest(data))
}

/// Paths written by [`write_run_artifacts`].
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    pub report: PathBuf,
    pub index: PathBuf,
}

/// Write `report.json` and `artifact_index.json` into `dir`.
///
/// The index covers the report and, when given, the JSONL trace already on
/// disk, each with its SHA-256 and size.
pub fn write_run_artifacts(
    dir: &Path,
    report: &RunReport,
    trace: Option<&Path>,
) -> std::io::Result<RunArtifacts> {
    std::fs::create_dir_all(dir)?;
    let mut index = ArtifactIndex::new(&report.run_id, &report.suite);

    if let Some(trace) = trace {
        let data = std::fs::read(trace)?;
        index.add(
            file_name(trace),
            "log",
            sha256_hex(&data),
            Some(data.len() as u64),
        );
    }

    let report_path = dir.join("report.json");
    let json = report.to_json().map_err(std::io::Error::other)?;
    std::fs::write(&report_path, &json)?;
    index.add(
        "report.json",
        "report",
        sha256_hex(json.as_bytes()),
        Some(json.len() as u64),
    );

    let index_path = dir.join("artifact_index.json");
    std::fs::write(&index_path, index.to_json().map_err(std::io::Error::other)?)?;
    Ok(RunArtifacts {
        report: report_path,
        index: index_path,
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}
