//! Workload invokers: one execution of the operation under test, either as
//! a local process or as one HTTP request.

use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::catalog::{InvocationDescriptor, PayloadChannel, TestCase};
use crate::config::HarnessConfig;
use crate::error::{CaseAbort, InvocationError};

/// Whether a running invocation can be inspected by the resource sampler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Locality {
    /// A child process on this host.
    Local,
    /// Executes elsewhere; there is nothing to sample.
    Remote,
}

/// A started invocation.
pub enum Launched {
    /// Still running; the caller waits for it and samples it meanwhile.
    Process(RunningProcess),
    /// Already complete, with its raw output.
    Completed(Vec<u8>),
}

/// Triggers one execution of a workload.
pub trait Workload {
    fn locality(&self) -> Locality;

    /// Start one invocation with `payload` as input.
    ///
    /// Remote workloads block until the response arrives and return
    /// [`Launched::Completed`].
    fn launch(&mut self, payload: &str) -> Result<Launched, InvocationError>;
}

impl<W: Workload + ?Sized> Workload for Box<W> {
    fn locality(&self) -> Locality {
        (**self).locality()
    }

    fn launch(&mut self, payload: &str) -> Result<Launched, InvocationError> {
        (**self).launch(payload)
    }
}

/// When an invocation started and how long it may take, output collection
/// included.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    pub start: Instant,
    pub limit: Duration,
}

impl Deadline {
    pub fn new(start: Instant, limit: Duration) -> Self {
        Self { start, limit }
    }

    pub fn expired(&self) -> bool {
        self.start.elapsed() >= self.limit
    }

    fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.start.elapsed())
    }
}

type Drain = Receiver<io::Result<Vec<u8>>>;

// The reader thread is abandoned if its pipe outlives the deadline.
fn drain<R: Read + Send + 'static>(reader: Option<R>) -> Option<Drain> {
    reader.map(|mut r| {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = Vec::new();
            let read = r.read_to_end(&mut buf).map(|_| buf);
            let _ = tx.send(read);
        });
        rx
    })
}

fn collect(drain: Option<Drain>, deadline: Option<Deadline>) -> Result<Vec<u8>, InvocationError> {
    let Some(rx) = drain else {
        return Ok(Vec::new());
    };
    let lost = || InvocationError::Io(io::Error::other("output reader vanished"));
    let read = match deadline {
        None => rx.recv().map_err(|_| lost())?,
        Some(deadline) => match rx.try_recv() {
            Ok(read) => read,
            Err(TryRecvError::Disconnected) => return Err(lost()),
            Err(TryRecvError::Empty) => match rx.recv_timeout(deadline.remaining()) {
                Ok(read) => read,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(InvocationError::Timeout(deadline.limit))
                }
                Err(RecvTimeoutError::Disconnected) => return Err(lost()),
            },
        },
    };
    Ok(read?)
}

/// A spawned child whose stdout and stderr are drained in the background so
/// a chatty workload cannot block on a full pipe.
pub struct RunningProcess {
    child: Child,
    stdout: Option<Drain>,
    stderr: Option<Drain>,
}

impl RunningProcess {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait()
    }

    /// Best-effort kill followed by a reap.
    pub fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            warn!(pid = self.pid(), error = %e, "failed to kill workload");
        }
        let _ = self.child.wait();
    }

    /// Collect the output of an exited process.
    ///
    /// A non-zero exit becomes [`InvocationError::ExitStatus`] carrying the
    /// workload's stderr. Output pipes still open at `deadline` (a leftover
    /// child of the workload holding them) give [`InvocationError::Timeout`].
    pub fn finish(
        self,
        status: ExitStatus,
        deadline: Option<Deadline>,
    ) -> Result<Vec<u8>, InvocationError> {
        let stdout = collect(self.stdout, deadline)?;
        let stderr = collect(self.stderr, deadline)?;
        if !status.success() {
            return Err(InvocationError::ExitStatus {
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }
        Ok(stdout)
    }
}

/// Spawns `program args... [payload]` once per invocation.
#[derive(Clone, Debug)]
pub struct ProcessWorkload {
    program: String,
    args: Vec<String>,
    channel: PayloadChannel,
}

impl ProcessWorkload {
    pub fn new(program: impl Into<String>, args: Vec<String>, channel: PayloadChannel) -> Self {
        Self {
            program: program.into(),
            args,
            channel,
        }
    }
}

impl Workload for ProcessWorkload {
    fn locality(&self) -> Locality {
        Locality::Local
    }

    fn launch(&mut self, payload: &str) -> Result<Launched, InvocationError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        match self.channel {
            PayloadChannel::Argument => {
                cmd.arg(payload).stdin(Stdio::null());
            }
            PayloadChannel::Stdin => {
                cmd.stdin(Stdio::piped());
            }
        }

        let mut child = cmd.spawn().map_err(|source| InvocationError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // The workload may exit without reading; a broken pipe is not ours to report.
            if let Err(e) = stdin.write_all(payload.as_bytes()) {
                if e.kind() != io::ErrorKind::BrokenPipe {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(InvocationError::Io(e));
                }
            }
        }

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        Ok(Launched::Process(RunningProcess {
            child,
            stdout,
            stderr,
        }))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

/// Bounded retry for HTTP invocations. Retries happen inside the timed
/// window, so the default is a single attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 1_000,
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.delay_ms);
        match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16)),
        }
    }
}

/// POSTs the payload as JSON to a deployed function.
#[derive(Clone, Debug)]
pub struct HttpWorkload {
    client: Client,
    url: Url,
    retry: RetryPolicy,
}

impl HttpWorkload {
    pub fn new(client: Client, url: Url, retry: RetryPolicy) -> Self {
        Self { client, url, retry }
    }

    fn post_once(&self, payload: &str) -> Result<Vec<u8>, reqwest::Error> {
        let response = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(payload.to_owned())
            .send()?
            .error_for_status()?;
        Ok(response.bytes()?.to_vec())
    }
}

impl Workload for HttpWorkload {
    fn locality(&self) -> Locality {
        Locality::Remote
    }

    fn launch(&mut self, payload: &str) -> Result<Launched, InvocationError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.post_once(payload) {
                Ok(body) => return Ok(Launched::Completed(body)),
                Err(source) if attempt >= max_attempts => {
                    return Err(InvocationError::Http {
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(url = %self.url, attempt, error = %e, ?delay, "http invocation failed, retrying");
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

/// A workload backed by a closure. Always remote: there is no process to
/// sample.
pub struct FnWorkload<F>(pub F);

impl<F> Workload for FnWorkload<F>
where
    F: FnMut(&str) -> Result<Vec<u8>, InvocationError>,
{
    fn locality(&self) -> Locality {
        Locality::Remote
    }

    fn launch(&mut self, payload: &str) -> Result<Launched, InvocationError> {
        (self.0)(payload).map(Launched::Completed)
    }
}

/// Builds the workload for a test case.
pub trait WorkloadFactory {
    /// An `Err` means the test case cannot be reached at all and is
    /// aborted without running any iteration.
    fn workload(&mut self, case: &TestCase) -> Result<Box<dyn Workload>, CaseAbort>;
}

/// Builds workloads straight from each case's [`InvocationDescriptor`].
pub struct DescriptorFactory {
    client: Option<Client>,
    http_timeout: Option<Duration>,
    retry: RetryPolicy,
}

impl DescriptorFactory {
    pub fn new(cfg: &HarnessConfig) -> Self {
        Self {
            client: None,
            http_timeout: cfg.http_timeout(),
            retry: cfg.retry.clone(),
        }
    }

    fn client(&mut self) -> Result<Client, CaseAbort> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let mut builder = Client::builder();
        if let Some(timeout) = self.http_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(CaseAbort::HttpClient)?;
        self.client = Some(client.clone());
        Ok(client)
    }
}

impl WorkloadFactory for DescriptorFactory {
    fn workload(&mut self, case: &TestCase) -> Result<Box<dyn Workload>, CaseAbort> {
        match &case.invocation {
            InvocationDescriptor::Process {
                program,
                args,
                channel,
            } => {
                if program.trim().is_empty() {
                    return Err(CaseAbort::MalformedDescriptor("empty program".to_string()));
                }
                Ok(Box::new(ProcessWorkload::new(
                    program.clone(),
                    args.clone(),
                    *channel,
                )))
            }
            InvocationDescriptor::Http { url } => {
                let url = Url::parse(url)
                    .map_err(|e| CaseAbort::MalformedDescriptor(format!("bad url `{url}`: {e}")))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(CaseAbort::MalformedDescriptor(format!(
                        "unsupported scheme `{}`",
                        url.scheme()
                    )));
                }
                Ok(Box::new(HttpWorkload::new(
                    self.client()?,
                    url,
                    self.retry.clone(),
                )))
            }
        }
    }
}
