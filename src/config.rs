use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::PayloadChannel;
use crate::error::ConfigError;
use crate::invoker::RetryPolicy;
use crate::Target;

#[derive(Clone, Copy, Debug)]
pub enum Profile {
    Quick,
    Full,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Quick => "quick",
            Profile::Full => "full",
        }
    }

    /// Measured iterations per test case.
    pub fn iters(&self, target: Target) -> u64 {
        match self {
            Profile::Quick => 5,
            Profile::Full => target.default_iterations(),
        }
    }

    pub fn warmup_iters(&self) -> u32 {
        match self {
            Profile::Quick => 2,
            Profile::Full => 10,
        }
    }
}

/// Harness tunables. Every field has a default, so a config file only needs
/// the values it changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Untimed invocations before measuring a warm test case.
    pub warmup_count: u32,
    /// Resource sampler polling cadence.
    pub sample_interval_ms: u64,
    /// How often the loop checks a local process for completion.
    pub completion_poll_ms: u64,
    /// Pause between test cases so the previous footprint can quiesce.
    pub settle_ms: u64,
    /// Pause between warm-up and the first measured iteration.
    pub warmup_settle_ms: u64,
    /// Kill a local invocation after this long. `None` waits indefinitely.
    pub invocation_timeout_ms: Option<u64>,
    /// Whole-request timeout for HTTP invocations.
    pub http_timeout_ms: Option<u64>,
    /// Compare decoded output against the expected answer.
    pub validate: bool,
    /// Padding added on both sides of the recorded measurement window.
    pub window_padding_ms: u64,
    pub payload_channel: PayloadChannel,
    pub retry: RetryPolicy,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            warmup_count: 10,
            sample_interval_ms: 10,
            completion_poll_ms: 1,
            settle_ms: 50,
            warmup_settle_ms: 0,
            invocation_timeout_ms: None,
            http_timeout_ms: None,
            validate: true,
            window_padding_ms: 0,
            payload_channel: PayloadChannel::Argument,
            retry: RetryPolicy::default(),
        }
    }
}

impl HarnessConfig {
    /// Defaults tuned per deployment target.
    pub fn for_target(target: Target) -> Self {
        match target {
            Target::Ec2 => Self::default(),
            Target::Lambda => Self::default(),
            Target::Azure => Self {
                settle_ms: 100,
                warmup_settle_ms: 3_000,
                window_padding_ms: 2_000,
                ..Self::default()
            },
        }
    }

    /// Overlay the fields present in a JSON file onto `self`.
    pub fn merge_file(&self, path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_err = |source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        };
        let overlay: serde_json::Value = serde_json::from_str(&raw).map_err(parse_err)?;
        let mut base = serde_json::to_value(self).map_err(parse_err)?;
        if let (Some(base), Some(overlay)) = (base.as_object_mut(), overlay.as_object()) {
            for (k, v) in overlay {
                base.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(base).map_err(parse_err)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn completion_poll(&self) -> Duration {
        Duration::from_millis(self.completion_poll_ms.max(1))
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn warmup_settle(&self) -> Duration {
        Duration::from_millis(self.warmup_settle_ms)
    }

    pub fn invocation_timeout(&self) -> Option<Duration> {
        self.invocation_timeout_ms.map(Duration::from_millis)
    }

    pub fn http_timeout(&self) -> Option<Duration> {
        self.http_timeout_ms.map(Duration::from_millis)
    }
}
