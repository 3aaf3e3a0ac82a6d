//! Resource sampling of a running invocation.
//!
//! A [`Sampler::Process`] session polls one local process on its own thread
//! at a fixed cadence and folds every reading into a running aggregate; raw
//! samples are never kept. Remote invocations use [`Sampler::Unavailable`],
//! whose summary leaves every resource field absent.
//!
//! CPU figures are deltas. Per-process CPU is accumulated CPU time over
//! wall-clock time across a window of at least [`CPU_WINDOW`], so an
//! invocation shorter than that has no per-process CPU reading. System-wide
//! CPU comes from two snapshots bracketing the invocation
//! ([`SystemCpuBracket`]) and is likewise absent for short invocations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use sysinfo::{
    CpuRefreshKind, Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, RefreshKind,
    System, MINIMUM_CPU_UPDATE_INTERVAL,
};
use tracing::debug;

use crate::error::SamplingError;

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

/// Shortest span a CPU percentage is computed over. CPU time is accounted in
/// scheduler ticks and sysinfo refreshes host CPU times no faster than this.
pub const CPU_WINDOW: Duration = MINIMUM_CPU_UPDATE_INTERVAL;

/// One point-in-time reading of a process.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResourceSample {
    pub rss_bytes: u64,
    /// Set only when a full [`CPU_WINDOW`] has passed since the previous
    /// CPU reading.
    pub cpu_percent: Option<f32>,
}

/// Aggregate of all samples taken during one invocation.
///
/// Absent fields mean "not measured", never zero usage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ResourceSummary {
    pub samples: usize,
    pub peak_memory_bytes: Option<u64>,
    pub avg_memory_bytes: Option<f64>,
    pub peak_cpu_percent: Option<f64>,
    pub avg_cpu_percent: Option<f64>,
    /// Host-wide CPU busy percentage across the invocation.
    pub system_cpu_percent: Option<f64>,
}

impl ResourceSummary {
    /// Summary for an invocation that could not be sampled.
    pub fn unavailable() -> Self {
        Self::default()
    }
}

#[derive(Default)]
struct Accumulator {
    samples: usize,
    peak_mem: u64,
    sum_mem: f64,
    cpu_samples: usize,
    peak_cpu: f64,
    sum_cpu: f64,
}

impl Accumulator {
    fn push(&mut self, s: ResourceSample) {
        self.samples += 1;
        self.peak_mem = self.peak_mem.max(s.rss_bytes);
        self.sum_mem += s.rss_bytes as f64;
        if let Some(cpu) = s.cpu_percent {
            let cpu = f64::from(cpu);
            self.cpu_samples += 1;
            self.peak_cpu = self.peak_cpu.max(cpu);
            self.sum_cpu += cpu;
        }
    }

    fn summary(&self) -> ResourceSummary {
        let mem = self.samples > 0;
        let cpu = self.cpu_samples > 0;
        ResourceSummary {
            samples: self.samples,
            peak_memory_bytes: mem.then_some(self.peak_mem),
            avg_memory_bytes: mem.then(|| self.sum_mem / self.samples as f64),
            peak_cpu_percent: cpu.then_some(self.peak_cpu),
            avg_cpu_percent: cpu.then(|| self.sum_cpu / self.cpu_samples as f64),
            system_cpu_percent: None,
        }
    }
}

/// Reads resource usage of one process.
pub trait ProcessProbe: Send {
    /// `Ok(None)` once the process has exited or vanished; that ends
    /// sampling normally. `Err` means the handle can no longer be trusted.
    fn sample(&mut self, pid: u32) -> Result<Option<ResourceSample>, SamplingError>;
}

/// [`ProcessProbe`] over `sysinfo`.
///
/// Memory is read on every call. CPU is the growth of the process's
/// accumulated CPU time divided by the wall-clock time since the previous CPU
/// reading, emitted once that span reaches the CPU window. 100% is one core.
pub struct SysinfoProbe {
    system: System,
    cpu_window: Duration,
    // Accumulated CPU ms and when it was read.
    cpu_mark: Option<(u64, Instant)>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self::with_cpu_window(CPU_WINDOW)
    }

    pub fn with_cpu_window(cpu_window: Duration) -> Self {
        Self {
            system: System::new(),
            cpu_window,
            cpu_mark: None,
        }
    }

    fn cpu_percent(&mut self, cpu_ms: u64, now: Instant) -> Option<f32> {
        let Some((prev_ms, at)) = self.cpu_mark else {
            self.cpu_mark = Some((cpu_ms, now));
            return None;
        };
        let wall = now.saturating_duration_since(at);
        if wall < self.cpu_window || wall.is_zero() {
            return None;
        }
        self.cpu_mark = Some((cpu_ms, now));
        let busy_ms = cpu_ms.saturating_sub(prev_ms) as f64;
        Some((busy_ms / (wall.as_secs_f64() * 1000.0) * 100.0) as f32)
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SysinfoProbe {
    fn sample(&mut self, pid: u32) -> Result<Option<ResourceSample>, SamplingError> {
        let pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory().with_cpu(),
        );
        let Some(process) = self.system.process(pid) else {
            return Ok(None);
        };
        // An exited child stays visible as a zombie until it is reaped.
        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            return Ok(None);
        }
        let rss_bytes = process.memory();
        let cpu_ms = process.accumulated_cpu_time();
        let cpu_percent = self.cpu_percent(cpu_ms, Instant::now());
        Ok(Some(ResourceSample {
            rss_bytes,
            cpu_percent,
        }))
    }
}

type ProbeFactory = Arc<dyn Fn() -> Box<dyn ProcessProbe> + Send + Sync>;

/// Polls local processes at a fixed cadence.
#[derive(Clone)]
pub struct ProcessSampler {
    interval: Duration,
    probe: ProbeFactory,
}

impl ProcessSampler {
    pub fn new(interval: Duration) -> Self {
        Self::with_probe(interval, || Box::new(SysinfoProbe::new()))
    }

    pub fn with_probe<F>(interval: Duration, probe: F) -> Self
    where
        F: Fn() -> Box<dyn ProcessProbe> + Send + Sync + 'static,
    {
        Self {
            interval,
            probe: Arc::new(probe),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl std::fmt::Debug for ProcessSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSampler")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub enum Sampler {
    /// Poll a local process.
    Process(ProcessSampler),
    /// Sampling is structurally impossible (remote invocation).
    Unavailable,
}

impl Sampler {
    pub fn process(interval: Duration) -> Self {
        Sampler::Process(ProcessSampler::new(interval))
    }

    /// Begin observing `pid`. The first reading is taken before this returns.
    ///
    /// [`Sampler::Unavailable`] ignores `pid` and returns an idle session.
    pub fn start(&self, pid: u32) -> Result<SamplerSession, SamplingError> {
        match self {
            Sampler::Unavailable => Ok(SamplerSession::Idle),
            Sampler::Process(sampler) => {
                let mut probe = (sampler.probe)();
                let mut acc = Accumulator::default();
                let alive = match probe.sample(pid)? {
                    Some(s) => {
                        acc.push(s);
                        true
                    }
                    None => false,
                };
                if !alive {
                    return Ok(SamplerSession::Done(Ok(acc.summary())));
                }

                let stop = Arc::new(AtomicBool::new(false));
                let flag = Arc::clone(&stop);
                let interval = sampler.interval;
                let handle = thread::Builder::new()
                    .name(format!("sampler-{pid}"))
                    .spawn(move || poll(probe, pid, interval, &flag, acc))
                    .map_err(|e| SamplingError::Thread(e.to_string()))?;

                Ok(SamplerSession::Polling { stop, handle })
            }
        }
    }
}

fn poll(
    mut probe: Box<dyn ProcessProbe>,
    pid: u32,
    interval: Duration,
    stop: &AtomicBool,
    mut acc: Accumulator,
) -> Result<ResourceSummary, SamplingError> {
    while !stop.load(Ordering::Acquire) {
        thread::sleep(interval);
        match probe.sample(pid)? {
            Some(s) => acc.push(s),
            None => break,
        }
    }
    debug!(pid, samples = acc.samples, "sampling complete");
    Ok(acc.summary())
}

/// An in-progress sampling of one invocation.
pub enum SamplerSession {
    Polling {
        stop: Arc<AtomicBool>,
        handle: JoinHandle<Result<ResourceSummary, SamplingError>>,
    },
    /// The process was gone before polling started.
    Done(Result<ResourceSummary, SamplingError>),
    /// Produced by [`Sampler::Unavailable`].
    Idle,
}

impl SamplerSession {
    /// True once sampling has stopped on its own, either because the process
    /// could no longer be seen or because the handle was lost. An idle
    /// session never observes anything and so never finishes on its own.
    pub fn is_finished(&self) -> bool {
        match self {
            SamplerSession::Polling { handle, .. } => handle.is_finished(),
            SamplerSession::Done(_) => true,
            SamplerSession::Idle => false,
        }
    }

    /// Stop polling and reduce the samples to a summary.
    pub fn stop(self) -> Result<ResourceSummary, SamplingError> {
        match self {
            SamplerSession::Polling { stop, handle } => {
                stop.store(true, Ordering::Release);
                handle
                    .join()
                    .map_err(|_| SamplingError::Thread("sampler thread panicked".to_string()))?
            }
            SamplerSession::Done(result) => result,
            SamplerSession::Idle => Ok(ResourceSummary::unavailable()),
        }
    }
}

/// Host-wide CPU busy time between two snapshots.
pub struct SystemCpuBracket {
    system: System,
    opened: Instant,
}

impl SystemCpuBracket {
    /// Take the opening snapshot.
    pub fn open() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_cpu(CpuRefreshKind::nothing().with_cpu_usage()),
        );
        Self {
            system,
            opened: Instant::now(),
        }
    }

    /// Take the closing snapshot and return the busy percentage in between.
    ///
    /// `None` when closed within [`CPU_WINDOW`] of opening: sysinfo does not
    /// take a second snapshot that soon.
    pub fn close(mut self) -> Option<f64> {
        if self.opened.elapsed() < CPU_WINDOW {
            return None;
        }
        self.system.refresh_cpu_usage();
        Some(f64::from(self.system.global_cpu_usage()))
    }
}
