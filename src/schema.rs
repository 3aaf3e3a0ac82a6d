use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::catalog::TestCase;

#[derive(Debug, Clone, Serialize)]
pub struct RunMeta {
    pub schema_version: u32,
    pub runner_version: String,
    pub profile: String,
    pub target: String,
    pub seed: u64,
    pub timestamp_utc: String,
    pub git_sha: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub kind: String,
    pub message: String,
}

/// Outcome of one measured invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationResult {
    pub test_case_id: String,
    pub iteration: u64,
    /// Wall-clock span from just before launch to observed completion.
    pub execution_time_ms: f64,
    pub peak_memory_mb: Option<f64>,
    pub avg_memory_mb: Option<f64>,
    pub peak_cpu_percent: Option<f64>,
    pub avg_cpu_percent: Option<f64>,
    pub system_cpu_percent: Option<f64>,
    pub samples: usize,
    /// `None` when there was nothing to compare against.
    pub validation_passed: Option<bool>,
    pub output: Option<String>,
    pub output_sha256: Option<String>,
    pub failure: Option<FailureRecord>,
}

impl IterationResult {
    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WarmupRecord {
    pub invocations: u32,
    pub failures: u32,
    /// Set only for warm test cases.
    pub finished_unix_ms: Option<u64>,
}

/// Wall-clock window covering the measured iterations, for filtering
/// remote logs down to measured invocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MeasurementWindow {
    pub start_unix_ms: u64,
    pub end_unix_ms: u64,
    pub padding_ms: u64,
}

/// Everything the execution loop produced for one test case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseRun {
    pub test_case_id: String,
    pub stream_name: String,
    pub warmup: WarmupRecord,
    pub window: MeasurementWindow,
    pub results: Vec<IterationResult>,
}

impl CaseRun {
    pub fn failed_iterations(&self) -> usize {
        self.results.iter().filter(|r| r.failed()).count()
    }

    pub fn validation_mismatches(&self) -> usize {
        self.results
            .iter()
            .filter(|r| !r.failed() && r.validation_passed == Some(false))
            .count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseReport {
    pub case: TestCase,
    pub run: CaseRun,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbortedCase {
    pub test_case_id: String,
    pub stream_name: String,
    pub reason: String,
}

/// A measured test case that a result sink failed to store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SinkFailure {
    pub test_case_id: String,
    pub stream_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub completed_cases: usize,
    pub aborted_cases: Vec<AbortedCase>,
    pub sink_failures: Vec<SinkFailure>,
    pub iterations: usize,
    pub failed_iterations: usize,
    pub validation_mismatches: usize,
}

impl RunSummary {
    pub fn absorb(&mut self, run: &CaseRun) {
        self.completed_cases += 1;
        self.iterations += run.results.len();
        self.failed_iterations += run.failed_iterations();
        self.validation_mismatches += run.validation_mismatches();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: RunMeta,
    pub cases: Vec<CaseReport>,
    pub summary: RunSummary,
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
