//! Error taxonomy for the harness.
//!
//! Only [`ConfigError`] is fatal to a whole run. Everything else is caught at
//! the iteration (or TestCase) boundary and recorded in the results.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::catalog::Architecture;
use crate::payload::{Language, Operation};

/// A misconfigured benchmark matrix. Aborts the entire run.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown operation `{0}`")]
    UnknownOperation(String),

    #[error("unknown language `{0}`")]
    UnknownLanguage(String),

    #[error("unknown architecture `{0}` (expected x86|arm)")]
    UnknownArchitecture(String),

    #[error("unknown start type `{0}` (expected cold|warm)")]
    UnknownStartType(String),

    #[error("no input payload for operation `{0}`")]
    MissingInput(Operation),

    #[error("no correct answer for operation `{0}`")]
    MissingAnswer(Operation),

    #[error("malformed payload for `{operation}` in {}: {source}", path.display())]
    MalformedPayload {
        operation: Operation,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no invocation mapping for language `{0}`")]
    UnresolvedLanguage(Language),

    #[error("no endpoint for {language}/{operation} on {architecture} ({detail})")]
    UnresolvedEndpoint {
        language: Language,
        operation: Operation,
        architecture: Architecture,
        detail: String,
    },

    #[error("catalog dimension `{0}` is empty")]
    EmptyDimension(&'static str),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One invocation of the workload did not produce usable output.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("workload exited with {status}: {stderr}")]
    ExitStatus { status: String, stderr: String },

    #[error("workload did not finish within {0:?}")]
    Timeout(Duration),

    #[error("http request failed after {attempts} attempt(s): {source}")]
    Http {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("i/o error while collecting output: {0}")]
    Io(#[from] io::Error),
}

/// The sampler lost track of the invocation it was observing.
#[derive(Debug, Error)]
pub enum SamplingError {
    #[error("lost handle to process {pid}: {reason}")]
    HandleLost { pid: u32, reason: String },

    #[error("sampler thread failed: {0}")]
    Thread(String),
}

/// Why a single iteration was recorded as failed.
#[derive(Debug, Error)]
pub enum IterationFailure {
    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error("output is not valid JSON: {0}")]
    Decode(#[source] serde_json::Error),

    #[error(transparent)]
    Sampling(#[from] SamplingError),
}

impl IterationFailure {
    /// Stable short label used in result rows.
    pub fn kind(&self) -> &'static str {
        match self {
            IterationFailure::Invocation(_) => "invocation",
            IterationFailure::Decode(_) => "decode",
            IterationFailure::Sampling(_) => "sampling",
        }
    }
}

/// A TestCase-level fatal condition. Aborts that TestCase only.
#[derive(Debug, Error)]
pub enum CaseAbort {
    #[error("malformed invocation descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("failed to build http client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// Persisting results failed.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{} sinks failed: {}", .0.len(), joined(.0))]
    Several(Vec<SinkError>),
}

impl SinkError {
    /// Fold per-sink errors into one, or `None` if every sink succeeded.
    pub fn combine(mut errors: Vec<SinkError>) -> Option<SinkError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(SinkError::Several(errors)),
        }
    }
}

fn joined(errors: &[SinkError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
