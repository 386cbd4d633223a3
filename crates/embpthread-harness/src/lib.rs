//! Stress and conformance harness for embpthread.
//!
//! This crate provides:
//! - Scenarios: multi-threaded property checks against a live runtime
//! - A runner that gives each scenario a fresh runtime on the host layer
//! - Structured JSONL logs and a log validator
//! - JSON run reports with SHA-256 artifact digests

#![forbid(unsafe_code)]

pub mod report;
pub mod runner;
pub mod scenarios;
pub mod structured_log;

pub use report::{RunReport, ScenarioResult, write_run_artifacts};
pub use runner::{RunConfig, ScenarioRunner};
pub use scenarios::{Scenario, ScenarioError, ScenarioParams, ScenarioStats};
