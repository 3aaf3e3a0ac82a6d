//! Loading benchmark artifacts from disk.
//!
//! # Layout
//!
//! ```text
//! TestArtifacts/
//!   inputs/<operation>.json    canonical input payload per operation
//!   correct/<operation>.json   expected workload output (optional set)
//! lambda_benchmark_urls.json   [{architecture, language, operation, memory_size, api_url}]
//! function_urls.json           {"<function name>": "<url>"}
//! ```
//!
//! Every loader is strict about the operations it is asked for: a missing
//! or malformed file for a requested operation is a [`ConfigError`].

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;
use walkdir::WalkDir;

use crate::catalog::{Answers, Architecture, Inputs};
use crate::error::ConfigError;
use crate::payload::{Language, Operation, OperationPayload};

/// Map each known operation name to its `<operation>.json` file in `dir`.
///
/// Files whose stem is not an operation are skipped.
fn scan_operation_files(dir: &Path) -> Result<BTreeMap<Operation, PathBuf>, ConfigError> {
    let mut found = BTreeMap::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| ConfigError::Read {
            path: dir.to_path_buf(),
            source: e.into(),
        })?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("json")
        {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match stem.parse::<Operation>() {
            Ok(op) => {
                found.insert(op, path.to_path_buf());
            }
            Err(_) => debug!(path = %path.display(), "skipping non-operation artifact"),
        }
    }
    Ok(found)
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Load and type-check the input payload for every operation in `operations`.
pub fn load_inputs(dir: &Path, operations: &[Operation]) -> Result<Inputs, ConfigError> {
    let files = scan_operation_files(dir)?;
    let mut inputs = Inputs::new();
    for &op in operations {
        let path = files.get(&op).ok_or(ConfigError::MissingInput(op))?;
        let raw = read(path)?;
        let payload =
            OperationPayload::parse(op, &raw).map_err(|source| ConfigError::MalformedPayload {
                operation: op,
                path: path.clone(),
                source,
            })?;
        inputs.insert(op, payload);
    }
    Ok(inputs)
}

/// Load the expected output for every operation in `operations`.
pub fn load_answers(dir: &Path, operations: &[Operation]) -> Result<Answers, ConfigError> {
    let files = scan_operation_files(dir)?;
    let mut answers = Answers::new();
    for &op in operations {
        let path = files.get(&op).ok_or(ConfigError::MissingAnswer(op))?;
        let raw = read(path)?;
        let value = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        answers.insert(op, value);
    }
    Ok(answers)
}

/// One row of `lambda_benchmark_urls.json`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct LambdaEndpoint {
    pub architecture: Architecture,
    pub language: Language,
    pub operation: Operation,
    pub memory_size: u32,
    pub api_url: String,
}

pub fn load_lambda_endpoints(path: &Path) -> Result<Vec<LambdaEndpoint>, ConfigError> {
    let raw = read(path)?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Function name -> URL, as written by the Azure deployment.
pub fn load_azure_urls(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let raw = read(path)?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
