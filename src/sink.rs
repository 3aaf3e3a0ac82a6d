//! Result sinks: where finished test cases go.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use serde::Serialize;
use tracing::info;

use crate::catalog::TestCase;
use crate::error::SinkError;
use crate::schema::{CaseReport, CaseRun, RunMeta, RunReport, RunSummary};

/// Receives each finished test case as a unit, in execution order.
pub trait ResultSink {
    /// Take ownership of one test case's results.
    fn record(&mut self, case: &TestCase, run: CaseRun) -> Result<(), SinkError>;

    /// Called once after the last test case.
    fn finish(&mut self, _summary: &RunSummary) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub cases: Vec<(TestCase, CaseRun)>,
    pub summary: Option<RunSummary>,
}

impl ResultSink for MemorySink {
    fn record(&mut self, case: &TestCase, run: CaseRun) -> Result<(), SinkError> {
        self.cases.push((case.clone(), run));
        Ok(())
    }

    fn finish(&mut self, summary: &RunSummary) -> Result<(), SinkError> {
        self.summary = Some(summary.clone());
        Ok(())
    }
}

/// Collects a [`RunReport`] and writes it as pretty JSON on finish, to a
/// file or to stdout.
pub struct JsonReportSink {
    meta: RunMeta,
    cases: Vec<CaseReport>,
    out: Option<PathBuf>,
}

impl JsonReportSink {
    pub fn new(meta: RunMeta, out: Option<PathBuf>) -> Self {
        Self {
            meta,
            cases: Vec::new(),
            out,
        }
    }
}

impl ResultSink for JsonReportSink {
    fn record(&mut self, case: &TestCase, run: CaseRun) -> Result<(), SinkError> {
        self.cases.push(CaseReport {
            case: case.clone(),
            run,
        });
        Ok(())
    }

    fn finish(&mut self, summary: &RunSummary) -> Result<(), SinkError> {
        let report = RunReport {
            run: self.meta.clone(),
            cases: std::mem::take(&mut self.cases),
            summary: summary.clone(),
        };
        let json = serde_json::to_string_pretty(&report)?;
        match &self.out {
            Some(path) => {
                fs::write(path, json)?;
                info!(path = %path.display(), "wrote json report");
            }
            None => println!("{json}"),
        }
        Ok(())
    }
}

/// One CSV row per iteration. Absent measurements are empty cells.
#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    test_case_id: &'a str,
    language: &'a str,
    operation: &'a str,
    architecture: &'a str,
    start_type: &'a str,
    environment: Option<String>,
    iteration: u64,
    execution_time_ms: f64,
    peak_memory_mb: Option<f64>,
    avg_memory_mb: Option<f64>,
    peak_cpu_percent: Option<f64>,
    avg_cpu_percent: Option<f64>,
    system_cpu_percent: Option<f64>,
    samples: usize,
    validation_passed: Option<bool>,
    failure_kind: Option<&'a str>,
    failure: Option<&'a str>,
}

/// Streams iteration rows to any writer as they arrive.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CsvSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(writer),
        }
    }

    pub fn into_inner(self) -> Result<W, SinkError> {
        self.writer
            .into_inner()
            .map_err(|e| SinkError::Io(io::Error::other(e.to_string())))
    }
}

impl CsvSink<fs::File> {
    pub fn create(path: &std::path::Path) -> Result<Self, SinkError> {
        Ok(Self::new(fs::File::create(path)?))
    }
}

impl<W: Write> ResultSink for CsvSink<W> {
    fn record(&mut self, case: &TestCase, run: CaseRun) -> Result<(), SinkError> {
        let environment = case.environment.label();
        for r in &run.results {
            self.writer.serialize(CsvRow {
                test_case_id: &r.test_case_id,
                language: case.language.as_str(),
                operation: case.operation.as_str(),
                architecture: case.architecture.as_str(),
                start_type: case.start_type.as_str(),
                environment: environment.clone(),
                iteration: r.iteration,
                execution_time_ms: r.execution_time_ms,
                peak_memory_mb: r.peak_memory_mb,
                avg_memory_mb: r.avg_memory_mb,
                peak_cpu_percent: r.peak_cpu_percent,
                avg_cpu_percent: r.avg_cpu_percent,
                system_cpu_percent: r.system_cpu_percent,
                samples: r.samples,
                validation_passed: r.validation_passed,
                failure_kind: r.failure.as_ref().map(|f| f.kind.as_str()),
                failure: r.failure.as_ref().map(|f| f.message.as_str()),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }

    fn finish(&mut self, _summary: &RunSummary) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Forwards every test case to several sinks.
///
/// One sink failing does not keep the case from the others; the errors are
/// reported together once every sink has been tried.
#[derive(Default)]
pub struct FanOut {
    sinks: Vec<Box<dyn ResultSink>>,
}

impl FanOut {
    pub fn push(&mut self, sink: Box<dyn ResultSink>) {
        self.sinks.push(sink);
    }
}

impl ResultSink for FanOut {
    fn record(&mut self, case: &TestCase, run: CaseRun) -> Result<(), SinkError> {
        let Some((last, rest)) = self.sinks.split_last_mut() else {
            return Ok(());
        };
        let mut errors: Vec<SinkError> = rest
            .iter_mut()
            .filter_map(|sink| sink.record(case, run.clone()).err())
            .collect();
        errors.extend(last.record(case, run).err());
        SinkError::combine(errors).map_or(Ok(()), Err)
    }

    fn finish(&mut self, summary: &RunSummary) -> Result<(), SinkError> {
        let errors = self
            .sinks
            .iter_mut()
            .filter_map(|sink| sink.finish(summary).err())
            .collect();
        SinkError::combine(errors).map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Architecture, EnvDimension, InvocationDescriptor, StartType};
    use crate::payload::{Language, Operation, OperationPayload};
    use crate::schema::{FailureRecord, IterationResult, MeasurementWindow, WarmupRecord};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn case() -> TestCase {
        TestCase {
            id: "c1".to_string(),
            language: Language::Go,
            operation: Operation::Ecc256Sign,
            architecture: Architecture::Arm,
            start_type: StartType::Warm,
            iterations: 2,
            environment: EnvDimension::MemoryMb(256),
            invocation: InvocationDescriptor::Http {
                url: "https://x.example".to_string(),
            },
            input: OperationPayload::parse(Operation::Ecc256Sign, r#"{"message":"m"}"#).unwrap(),
            expected: None,
        }
    }

    fn result(iteration: u64, failure: Option<FailureRecord>) -> IterationResult {
        IterationResult {
            test_case_id: "c1".to_string(),
            iteration,
            execution_time_ms: 12.5,
            peak_memory_mb: None,
            avg_memory_mb: None,
            peak_cpu_percent: None,
            avg_cpu_percent: None,
            system_cpu_percent: None,
            samples: 0,
            validation_passed: Some(failure.is_none()),
            output: None,
            output_sha256: None,
            failure,
        }
    }

    fn run() -> CaseRun {
        CaseRun {
            test_case_id: "c1".to_string(),
            stream_name: "256/arm/go/ecc256_sign/warm".to_string(),
            warmup: WarmupRecord::default(),
            window: MeasurementWindow::default(),
            results: vec![
                result(0, None),
                result(
                    1,
                    Some(FailureRecord {
                        kind: "invocation".to_string(),
                        message: "http 502".to_string(),
                    }),
                ),
            ],
        }
    }

    #[test]
    fn csv_rows_leave_absent_fields_empty() {
        let mut sink = CsvSink::new(Vec::new());
        sink.record(&case(), run()).unwrap();
        let bytes = sink.into_inner().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("test_case_id,language,operation,architecture,start_type,environment,iteration"));
        assert_eq!(
            lines[1],
            "c1,go,ecc256_sign,arm,warm,256,0,12.5,,,,,,0,true,,"
        );
        assert_eq!(
            lines[2],
            "c1,go,ecc256_sign,arm,warm,256,1,12.5,,,,,,0,false,invocation,http 502"
        );
    }

    #[test]
    fn fan_out_reaches_every_sink() {
        let mut fan = FanOut::default();
        fan.push(Box::new(MemorySink::default()));
        fan.push(Box::new(CsvSink::new(Vec::new())));
        fan.record(&case(), run()).unwrap();
        fan.finish(&RunSummary::default()).unwrap();
    }

    /// Rejects everything and counts how often it was asked.
    struct Broken(Rc<Cell<usize>>);

    impl ResultSink for Broken {
        fn record(&mut self, _case: &TestCase, _run: CaseRun) -> Result<(), SinkError> {
            self.0.set(self.0.get() + 1);
            Err(SinkError::Io(io::Error::other("disk full")))
        }

        fn finish(&mut self, _summary: &RunSummary) -> Result<(), SinkError> {
            Err(SinkError::Io(io::Error::other("disk full")))
        }
    }

    /// Stores into a shared vector so the test can look after the fan-out owns it.
    struct Shared(Rc<RefCell<Vec<String>>>);

    impl ResultSink for Shared {
        fn record(&mut self, _case: &TestCase, run: CaseRun) -> Result<(), SinkError> {
            self.0.borrow_mut().push(run.test_case_id);
            Ok(())
        }
    }

    #[test]
    fn failing_sink_does_not_starve_the_others() {
        let attempts = Rc::new(Cell::new(0));
        let stored = Rc::new(RefCell::new(Vec::new()));
        let mut fan = FanOut::default();
        fan.push(Box::new(Broken(attempts.clone())));
        fan.push(Box::new(Shared(stored.clone())));
        fan.push(Box::new(Broken(attempts.clone())));

        let err = fan.record(&case(), run()).unwrap_err();
        assert!(matches!(err, SinkError::Several(ref e) if e.len() == 2));
        assert!(err.to_string().contains("disk full"));
        assert_eq!(attempts.get(), 2);
        assert_eq!(*stored.borrow(), vec!["c1".to_string()]);

        let err = fan.finish(&RunSummary::default()).unwrap_err();
        assert!(matches!(err, SinkError::Several(ref e) if e.len() == 2));
    }

    #[test]
    fn single_sink_failure_is_passed_through() {
        let mut fan = FanOut::default();
        fan.push(Box::new(MemorySink::default()));
        fan.push(Box::new(Broken(Rc::default())));
        let err = fan.record(&case(), run()).unwrap_err();
        assert!(matches!(err, SinkError::Io(_)));
    }

    #[test]
    fn json_report_written_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let meta = RunMeta {
            schema_version: 1,
            runner_version: "test".to_string(),
            profile: "quick".to_string(),
            target: "lambda".to_string(),
            seed: 0,
            timestamp_utc: "unix:0".to_string(),
            git_sha: None,
        };
        let mut sink = JsonReportSink::new(meta, Some(path.clone()));
        sink.record(&case(), run()).unwrap();
        sink.finish(&RunSummary::default()).unwrap();

        let v: serde_json::Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(v["cases"][0]["case"]["environment"]["memory_mb"], 256);
        assert_eq!(v["cases"][0]["run"]["results"][1]["failure"]["kind"], "invocation");
        assert!(v["cases"][0]["run"]["results"][0]["peak_memory_mb"].is_null());
    }
}
