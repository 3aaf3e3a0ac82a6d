//! The execution loop.
//!
//! For one [`TestCase`]: optional warm-up, then exactly `iterations`
//! strictly sequential measured invocations, each bracketed by the resource
//! sampler. Failures inside an iteration are recorded on that iteration and
//! the loop moves on; only an unreachable workload aborts a test case, and
//! only configuration errors (raised before this point) abort a run.

use std::process::ExitStatus;
use std::thread;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::catalog::{StartType, TestCase};
use crate::config::HarnessConfig;
use crate::error::{CaseAbort, InvocationError, IterationFailure, SamplingError, SinkError};
use crate::invoker::{Deadline, Launched, Locality, RunningProcess, Workload, WorkloadFactory};
use crate::sampler::{ResourceSummary, Sampler, SamplerSession, SystemCpuBracket};
use crate::schema::{
    now_unix_ms, AbortedCase, CaseRun, FailureRecord, IterationResult, MeasurementWindow,
    RunSummary, SinkFailure, WarmupRecord,
};
use crate::sink::ResultSink;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// What waiting on one invocation produced.
struct Observed {
    end: Instant,
    output: Result<Vec<u8>, IterationFailure>,
    resources: ResourceSummary,
}

impl Observed {
    fn failed(error: impl Into<IterationFailure>, resources: ResourceSummary) -> Self {
        Self {
            end: Instant::now(),
            output: Err(error.into()),
            resources,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Harness {
    cfg: HarnessConfig,
    sampler: Sampler,
}

impl Harness {
    /// A harness that samples local processes at the configured cadence.
    pub fn new(cfg: HarnessConfig) -> Self {
        let sampler = Sampler::process(cfg.sample_interval());
        Self { cfg, sampler }
    }

    pub fn with_sampler(cfg: HarnessConfig, sampler: Sampler) -> Self {
        Self { cfg, sampler }
    }

    /// Run every test case in order and hand each finished one to `sink`.
    ///
    /// A sink rejecting a measured case is listed in
    /// [`RunSummary::sink_failures`]; the case still counts as completed.
    /// Returns `Err` only if the sink cannot be finalized.
    pub fn run<I>(
        &self,
        cases: I,
        factory: &mut dyn WorkloadFactory,
        sink: &mut dyn ResultSink,
    ) -> Result<RunSummary, SinkError>
    where
        I: IntoIterator<Item = TestCase>,
    {
        let mut summary = RunSummary::default();
        for (n, case) in cases.into_iter().enumerate() {
            if n > 0 {
                thread::sleep(self.cfg.settle());
            }

            let mut workload = match factory.workload(&case) {
                Ok(w) => w,
                Err(abort) => {
                    self.abort(&mut summary, &case, &abort);
                    continue;
                }
            };

            let run = self.run_case(&case, workload.as_mut());
            summary.absorb(&run);

            if let Err(e) = sink.record(&case, run) {
                error!(
                    id = %case.id,
                    stream = %case.stream_name(),
                    error = %e,
                    "failed to record test case"
                );
                summary.sink_failures.push(SinkFailure {
                    test_case_id: case.id.clone(),
                    stream_name: case.stream_name(),
                    error: e.to_string(),
                });
            }
        }

        info!(
            completed = summary.completed_cases,
            aborted = summary.aborted_cases.len(),
            sink_failures = summary.sink_failures.len(),
            iterations = summary.iterations,
            failed = summary.failed_iterations,
            mismatches = summary.validation_mismatches,
            "benchmark run finished"
        );
        sink.finish(&summary)?;
        Ok(summary)
    }

    fn abort(&self, summary: &mut RunSummary, case: &TestCase, reason: &CaseAbort) {
        error!(
            id = %case.id,
            stream = %case.stream_name(),
            error = %reason,
            "test case aborted"
        );
        summary.aborted_cases.push(AbortedCase {
            test_case_id: case.id.clone(),
            stream_name: case.stream_name(),
            reason: reason.to_string(),
        });
    }

    /// Warm up if requested, then measure exactly `case.iterations` times.
    pub fn run_case(&self, case: &TestCase, workload: &mut dyn Workload) -> CaseRun {
        info!(
            id = %case.id,
            stream = %case.stream_name(),
            iterations = case.iterations,
            "executing test case"
        );
        let payload = case.input.to_json();

        let warmup = match case.start_type {
            StartType::Warm => self.warm_up(case, workload, &payload),
            StartType::Cold => WarmupRecord::default(),
        };

        let start_unix_ms = now_unix_ms();
        let mut results = Vec::with_capacity(case.iterations as usize);
        for iteration in 0..case.iterations {
            results.push(self.measure(case, workload, &payload, iteration));
        }
        let end_unix_ms = now_unix_ms();

        CaseRun {
            test_case_id: case.id.clone(),
            stream_name: case.stream_name(),
            warmup,
            window: MeasurementWindow {
                start_unix_ms,
                end_unix_ms,
                padding_ms: self.cfg.window_padding_ms,
            },
            results,
        }
    }

    fn warm_up(&self, case: &TestCase, workload: &mut dyn Workload, payload: &str) -> WarmupRecord {
        let mut record = WarmupRecord::default();
        for _ in 0..self.cfg.warmup_count {
            record.invocations += 1;
            if let Err(e) = self.invoke_untimed(workload, payload) {
                record.failures += 1;
                warn!(stream = %case.stream_name(), error = %e, "warm-up invocation failed");
            }
        }
        record.finished_unix_ms = Some(now_unix_ms());
        debug!(stream = %case.stream_name(), invocations = record.invocations, "warm-up finished");

        let settle = self.cfg.warmup_settle();
        if !settle.is_zero() {
            thread::sleep(settle);
        }
        record
    }

    fn deadline(&self, start: Instant) -> Option<Deadline> {
        self.cfg
            .invocation_timeout()
            .map(|limit| Deadline::new(start, limit))
    }

    fn invoke_untimed(&self, workload: &mut dyn Workload, payload: &str) -> Result<(), InvocationError> {
        let deadline = self.deadline(Instant::now());
        match workload.launch(payload)? {
            Launched::Completed(_) => Ok(()),
            Launched::Process(mut process) => {
                let status = self.wait(&mut process, deadline)?;
                process.finish(status, deadline).map(drop)
            }
        }
    }

    /// Wait for a process without sampling it.
    fn wait(
        &self,
        process: &mut RunningProcess,
        deadline: Option<Deadline>,
    ) -> Result<ExitStatus, InvocationError> {
        loop {
            if let Some(status) = process.try_wait()? {
                return Ok(status);
            }
            if let Some(d) = deadline.filter(Deadline::expired) {
                process.kill();
                return Err(InvocationError::Timeout(d.limit));
            }
            thread::sleep(self.cfg.completion_poll());
        }
    }

    fn measure(
        &self,
        case: &TestCase,
        workload: &mut dyn Workload,
        payload: &str,
        iteration: u64,
    ) -> IterationResult {
        let bracket = (workload.locality() == Locality::Local).then(SystemCpuBracket::open);

        let start = Instant::now();
        let observed = match workload.launch(payload) {
            Err(e) => Observed::failed(e, ResourceSummary::unavailable()),
            Ok(Launched::Completed(out)) => Observed {
                end: Instant::now(),
                output: Ok(out),
                resources: ResourceSummary::unavailable(),
            },
            Ok(Launched::Process(process)) => self.observe(process, start),
        };
        let elapsed = observed.end.saturating_duration_since(start);

        let mut resources = observed.resources;
        if let Some(bracket) = bracket {
            resources.system_cpu_percent = bracket.close();
        }

        let result = build_result(case, iteration, elapsed, resources, observed.output, self.cfg.validate);
        match &result.failure {
            Some(f) => warn!(
                id = %case.id,
                stream = %case.stream_name(),
                iteration,
                kind = %f.kind,
                error = %f.message,
                "iteration failed"
            ),
            None if result.validation_passed == Some(false) => warn!(
                id = %case.id,
                stream = %case.stream_name(),
                iteration,
                "output does not match expected answer"
            ),
            None => debug!(
                stream = %case.stream_name(),
                iteration,
                ms = result.execution_time_ms,
                "iteration complete"
            ),
        }
        result
    }

    /// Wait for a local invocation while the sampler polls it.
    ///
    /// The sampler stopping on its own while the process still runs means
    /// the handle was lost: the process is killed and the iteration fails.
    fn observe(&self, mut process: RunningProcess, start: Instant) -> Observed {
        let deadline = self.deadline(start);
        let pid = process.pid();
        let session = match self.sampler.start(pid) {
            Ok(s) => s,
            Err(e) => {
                process.kill();
                return Observed::failed(e, ResourceSummary::unavailable());
            }
        };

        let status = loop {
            match process.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    process.kill();
                    let resources = session.stop().unwrap_or_default();
                    return Observed::failed(InvocationError::Io(e), resources);
                }
            }

            if session.is_finished() {
                let resources = match session.stop() {
                    Ok(r) => r,
                    Err(e) => {
                        process.kill();
                        return Observed::failed(e, ResourceSummary::unavailable());
                    }
                };
                // An exited process is reaped here; only a live one was lost.
                match process.try_wait() {
                    Ok(Some(status)) => {
                        return collect(process, status, Instant::now(), deadline, resources)
                    }
                    Ok(None) => {
                        process.kill();
                        let lost = SamplingError::HandleLost {
                            pid,
                            reason: "process is running but no longer observable".to_string(),
                        };
                        return Observed::failed(lost, resources);
                    }
                    Err(e) => {
                        process.kill();
                        return Observed::failed(InvocationError::Io(e), resources);
                    }
                }
            }

            if let Some(d) = deadline.filter(Deadline::expired) {
                process.kill();
                let resources = session.stop().unwrap_or_default();
                return Observed::failed(InvocationError::Timeout(d.limit), resources);
            }

            thread::sleep(self.cfg.completion_poll());
        };
        let end = Instant::now();

        match session.stop() {
            Ok(resources) => collect(process, status, end, deadline, resources),
            Err(e) => Observed::failed(e, ResourceSummary::unavailable()),
        }
    }
}

/// Output of a process whose exit was observed at `end`.
fn collect(
    process: RunningProcess,
    status: ExitStatus,
    end: Instant,
    deadline: Option<Deadline>,
    resources: ResourceSummary,
) -> Observed {
    Observed {
        end,
        output: process
            .finish(status, deadline)
            .map_err(IterationFailure::from),
        resources,
    }
}

fn build_result(
    case: &TestCase,
    iteration: u64,
    elapsed: Duration,
    resources: ResourceSummary,
    output: Result<Vec<u8>, IterationFailure>,
    validate: bool,
) -> IterationResult {
    let mut result = IterationResult {
        test_case_id: case.id.clone(),
        iteration,
        execution_time_ms: elapsed.as_secs_f64() * 1000.0,
        peak_memory_mb: resources.peak_memory_bytes.map(|b| b as f64 / BYTES_PER_MB),
        avg_memory_mb: resources.avg_memory_bytes.map(|b| b / BYTES_PER_MB),
        peak_cpu_percent: resources.peak_cpu_percent,
        avg_cpu_percent: resources.avg_cpu_percent,
        system_cpu_percent: resources.system_cpu_percent,
        samples: resources.samples,
        validation_passed: None,
        output: None,
        output_sha256: None,
        failure: None,
    };

    let bytes = match output {
        Ok(bytes) => bytes,
        Err(failure) => {
            result.validation_passed = Some(false);
            result.failure = Some(failure_record(&failure));
            return result;
        }
    };

    result.output = Some(String::from_utf8_lossy(&bytes).trim().to_string());
    result.output_sha256 = Some(format!("{:x}", Sha256::digest(&bytes)));

    match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(value) => {
            if validate {
                result.validation_passed = case.expected.as_ref().map(|expected| *expected == value);
            }
        }
        Err(e) => {
            result.validation_passed = Some(false);
            result.failure = Some(failure_record(&IterationFailure::Decode(e)));
        }
    }
    result
}

fn failure_record(failure: &IterationFailure) -> FailureRecord {
    FailureRecord {
        kind: failure.kind().to_string(),
        message: failure.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Architecture, EnvDimension, InvocationDescriptor};
    use crate::invoker::FnWorkload;
    use crate::payload::{Language, Operation, OperationPayload};
    #[cfg(unix)]
    use crate::sampler::{ProcessProbe, ProcessSampler, ResourceSample};
    use crate::sink::MemorySink;
    use serde_json::json;
    use std::io;

    fn case(start_type: StartType, iterations: u64, expected: Option<serde_json::Value>) -> TestCase {
        TestCase {
            id: "case-1".to_string(),
            language: Language::Python,
            operation: Operation::Sha256,
            architecture: Architecture::X86,
            start_type,
            iterations,
            environment: EnvDimension::None,
            invocation: InvocationDescriptor::Http {
                url: "http://localhost/never".to_string(),
            },
            input: OperationPayload::parse(Operation::Sha256, r#"{"message":"m"}"#).unwrap(),
            expected,
        }
    }

    fn quiet_config() -> HarnessConfig {
        HarnessConfig {
            warmup_count: 4,
            settle_ms: 0,
            ..HarnessConfig::default()
        }
    }

    #[test]
    fn cold_start_skips_warmup() {
        let harness = Harness::new(quiet_config());
        let mut calls = 0;
        let mut w = FnWorkload(|_: &str| {
            calls += 1;
            Ok(b"{}".to_vec())
        });
        let run = harness.run_case(&case(StartType::Cold, 3, None), &mut w);
        drop(w);
        assert_eq!(calls, 3);
        assert_eq!(run.results.len(), 3);
        assert_eq!(run.warmup, WarmupRecord::default());
    }

    #[test]
    fn warm_start_runs_warmup_first_and_records_nothing_for_it() {
        let harness = Harness::new(quiet_config());
        let mut calls = 0u32;
        let mut w = FnWorkload(|_: &str| {
            calls += 1;
            Ok(format!("{{\"call\":{calls}}}").into_bytes())
        });
        let run = harness.run_case(&case(StartType::Warm, 2, None), &mut w);
        drop(w);
        assert_eq!(calls, 6);
        assert_eq!(run.warmup.invocations, 4);
        assert!(run.warmup.finished_unix_ms.is_some());
        // Measured iterations saw calls 5 and 6.
        assert_eq!(run.results[0].output.as_deref(), Some("{\"call\":5}"));
        assert_eq!(run.results[1].output.as_deref(), Some("{\"call\":6}"));
    }

    #[test]
    fn warmup_failures_are_counted_not_fatal() {
        let harness = Harness::new(quiet_config());
        let mut calls = 0u32;
        let mut w = FnWorkload(|_: &str| {
            calls += 1;
            if calls <= 4 {
                Err(InvocationError::Timeout(Duration::from_millis(1)))
            } else {
                Ok(b"{}".to_vec())
            }
        });
        let run = harness.run_case(&case(StartType::Warm, 1, None), &mut w);
        assert_eq!(run.warmup.failures, 4);
        assert_eq!(run.results.len(), 1);
        assert!(!run.results[0].failed());
    }

    #[test]
    fn undecodable_output_is_recorded_as_decode_failure() {
        let harness = Harness::new(quiet_config());
        let mut w = FnWorkload(|_: &str| Ok(b"Traceback (most recent call last)".to_vec()));
        let run = harness.run_case(&case(StartType::Cold, 2, Some(json!({}))), &mut w);
        assert_eq!(run.results.len(), 2);
        for r in &run.results {
            assert_eq!(r.failure.as_ref().map(|f| f.kind.as_str()), Some("decode"));
            assert_eq!(r.validation_passed, Some(false));
            assert!(r.output.is_some());
        }
    }

    #[test]
    fn validation_can_be_disabled() {
        let cfg = HarnessConfig {
            validate: false,
            ..quiet_config()
        };
        let harness = Harness::new(cfg);
        let mut w = FnWorkload(|_: &str| Ok(br#"{"signature":"other"}"#.to_vec()));
        let run = harness.run_case(
            &case(StartType::Cold, 1, Some(json!({"signature": "abc"}))),
            &mut w,
        );
        assert_eq!(run.results[0].validation_passed, None);
    }

    #[test]
    fn remote_results_have_no_resource_fields() {
        let harness = Harness::new(quiet_config());
        let mut w = FnWorkload(|_: &str| Ok(b"{}".to_vec()));
        let run = harness.run_case(&case(StartType::Cold, 1, None), &mut w);
        let r = &run.results[0];
        assert_eq!(r.samples, 0);
        assert!(r.peak_memory_mb.is_none());
        assert!(r.avg_cpu_percent.is_none());
        assert!(r.system_cpu_percent.is_none());
        assert_eq!(r.output_sha256.as_ref().map(String::len), Some(64));
    }

    struct Unreachable;

    impl WorkloadFactory for Unreachable {
        fn workload(&mut self, _case: &TestCase) -> Result<Box<dyn Workload>, CaseAbort> {
            Err(CaseAbort::MalformedDescriptor("no route".to_string()))
        }
    }

    #[test]
    fn unreachable_workloads_are_aborted_and_counted() {
        let harness = Harness::new(quiet_config());
        let mut sink = MemorySink::default();
        let cases = vec![case(StartType::Cold, 2, None), case(StartType::Cold, 2, None)];
        let summary = harness.run(cases, &mut Unreachable, &mut sink).unwrap();
        assert_eq!(summary.completed_cases, 0);
        assert_eq!(summary.aborted_cases.len(), 2);
        assert!(sink.cases.is_empty());
    }

    /// Serves every case from a closure that always succeeds.
    struct Echo;

    impl WorkloadFactory for Echo {
        fn workload(&mut self, _case: &TestCase) -> Result<Box<dyn Workload>, CaseAbort> {
            Ok(Box::new(FnWorkload(|_: &str| Ok(b"{}".to_vec()))))
        }
    }

    /// Rejects the first case it is given and keeps the rest.
    #[derive(Default)]
    struct Flaky {
        seen: usize,
        kept: Vec<String>,
        summary: Option<RunSummary>,
    }

    impl ResultSink for Flaky {
        fn record(&mut self, case: &TestCase, _run: CaseRun) -> Result<(), SinkError> {
            self.seen += 1;
            if self.seen == 1 {
                return Err(SinkError::Io(io::Error::other("disk full")));
            }
            self.kept.push(case.id.clone());
            Ok(())
        }

        fn finish(&mut self, summary: &RunSummary) -> Result<(), SinkError> {
            self.summary = Some(summary.clone());
            Ok(())
        }
    }

    #[test]
    fn rejected_case_still_counts_as_measured() {
        let harness = Harness::new(quiet_config());
        let mut first = case(StartType::Cold, 2, None);
        first.id = "case-a".to_string();
        let mut second = case(StartType::Cold, 2, None);
        second.id = "case-b".to_string();

        let mut sink = Flaky::default();
        let summary = harness.run(vec![first, second], &mut Echo, &mut sink).unwrap();

        assert_eq!(summary.completed_cases, 2);
        assert!(summary.aborted_cases.is_empty());
        assert_eq!(summary.iterations, 4);
        assert_eq!(summary.sink_failures.len(), 1);
        assert_eq!(summary.sink_failures[0].test_case_id, "case-a");
        assert!(summary.sink_failures[0].error.contains("disk full"));
        assert_eq!(sink.kept, vec!["case-b".to_string()]);
        assert_eq!(sink.summary.as_ref(), Some(&summary));
    }

    /// Sees the process once, then either loses it or errors.
    #[cfg(unix)]
    struct Fading {
        fail: bool,
        calls: usize,
    }

    #[cfg(unix)]
    impl ProcessProbe for Fading {
        fn sample(&mut self, pid: u32) -> Result<Option<ResourceSample>, SamplingError> {
            self.calls += 1;
            match (self.calls, self.fail) {
                (1, _) => Ok(Some(ResourceSample {
                    rss_bytes: 1024 * 1024,
                    cpu_percent: None,
                })),
                (_, false) => Ok(None),
                (_, true) => Err(SamplingError::HandleLost {
                    pid,
                    reason: "access denied".to_string(),
                }),
            }
        }
    }

    #[cfg(unix)]
    fn fading_harness(fail: bool) -> Harness {
        let sampler = ProcessSampler::with_probe(Duration::from_millis(1), move || {
            Box::new(Fading { fail, calls: 0 })
        });
        Harness::with_sampler(quiet_config(), Sampler::Process(sampler))
    }

    #[cfg(unix)]
    fn sleeper() -> crate::invoker::ProcessWorkload {
        crate::invoker::ProcessWorkload::new(
            "sh",
            vec!["-c".to_string(), "exec sleep 5".to_string()],
            crate::catalog::PayloadChannel::Argument,
        )
    }

    #[cfg(unix)]
    #[test]
    fn sampling_failure_kills_and_records_iteration() {
        for fail in [false, true] {
            let harness = fading_harness(fail);
            let mut w = sleeper();
            let started = Instant::now();
            let run = harness.run_case(&case(StartType::Cold, 2, None), &mut w);

            assert!(started.elapsed() < Duration::from_secs(3), "process was not killed");
            assert_eq!(run.results.len(), 2);
            for (i, r) in run.results.iter().enumerate() {
                assert_eq!(r.iteration, i as u64);
                let failure = r.failure.as_ref().expect("sampling failure recorded");
                assert_eq!(failure.kind, "sampling");
                assert!(failure.message.contains("lost handle"), "{}", failure.message);
                assert_eq!(r.validation_passed, Some(false));
                assert!(r.output.is_none());
            }
        }
    }
}
