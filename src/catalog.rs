//! Test case catalog: the cross-product of benchmark dimensions.
//!
//! [`Catalog::build`] validates the whole matrix up front (inputs, answers
//! and invocation descriptors) and fails before anything is invoked.
//! [`Catalog::iter`] then yields fully resolved [`TestCase`]s lazily, in
//! nested order: language, operation, start type, environment, architecture.
//! Iterating twice yields identical cases, ids included.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::payload::{Language, Operation, OperationPayload};
use crate::resolve::Resolver;

/// Operation -> canonical input payload.
pub type Inputs = BTreeMap<Operation, OperationPayload>;

/// Operation -> expected workload output.
pub type Answers = BTreeMap<Operation, serde_json::Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    X86,
    Arm,
}

impl Architecture {
    /// Architecture of the machine running the harness.
    pub fn host() -> Self {
        if std::env::consts::ARCH == "x86_64" {
            Architecture::X86
        } else {
            Architecture::Arm
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X86 => "x86",
            Architecture::Arm => "arm",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x86" | "x86_64" | "amd64" => Ok(Architecture::X86),
            "arm" | "arm64" | "aarch64" => Ok(Architecture::Arm),
            _ => Err(ConfigError::UnknownArchitecture(s.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartType {
    /// No warm-up before measuring.
    Cold,
    /// Measure after the configured number of untimed warm-up invocations.
    Warm,
}

impl StartType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartType::Cold => "cold",
            StartType::Warm => "warm",
        }
    }
}

impl fmt::Display for StartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StartType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cold" => Ok(StartType::Cold),
            "warm" => Ok(StartType::Warm),
            _ => Err(ConfigError::UnknownStartType(s.to_string())),
        }
    }
}

/// Deployment-specific dimension varied per run.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvDimension {
    /// EC2 instance type, e.g. `c7g.large`.
    InstanceType(String),
    /// Lambda memory size in MB.
    MemoryMb(u32),
    /// Targets without a varied dimension (Azure Functions).
    None,
}

impl EnvDimension {
    /// Value for report columns; `None` when not applicable.
    pub fn label(&self) -> Option<String> {
        match self {
            EnvDimension::InstanceType(t) => Some(t.clone()),
            EnvDimension::MemoryMb(mb) => Some(mb.to_string()),
            EnvDimension::None => None,
        }
    }
}

impl fmt::Display for EnvDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvDimension::InstanceType(t) => f.write_str(t),
            EnvDimension::MemoryMb(mb) => write!(f, "{mb}"),
            EnvDimension::None => f.write_str("default"),
        }
    }
}

/// How a local workload receives its input payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadChannel {
    /// Appended as the final command-line argument.
    #[default]
    Argument,
    /// Written to the process's stdin, which is then closed.
    Stdin,
}

/// How to reach one workload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InvocationDescriptor {
    /// Spawn a local executable once per invocation.
    Process {
        program: String,
        args: Vec<String>,
        channel: PayloadChannel,
    },
    /// POST the payload to a deployed function.
    Http { url: String },
}

/// One fully resolved benchmark configuration. Never mutated after the
/// catalog yields it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TestCase {
    pub id: String,
    pub language: Language,
    pub operation: Operation,
    pub architecture: Architecture,
    pub start_type: StartType,
    pub iterations: u64,
    pub environment: EnvDimension,
    pub invocation: InvocationDescriptor,
    pub input: OperationPayload,
    pub expected: Option<serde_json::Value>,
}

impl TestCase {
    /// `<environment>/<arch>/<language>/<operation>/<start>`, the grouping
    /// key used when results are shipped to a log stream.
    pub fn stream_name(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.environment, self.architecture, self.language, self.operation, self.start_type
        )
    }
}

/// The finite sets of each dimension.
#[derive(Clone, Debug)]
pub struct Dimensions {
    pub languages: Vec<Language>,
    pub operations: Vec<Operation>,
    pub start_types: Vec<StartType>,
    pub environments: Vec<EnvDimension>,
    pub architectures: Vec<Architecture>,
}

impl Dimensions {
    fn check(&self) -> Result<(), ConfigError> {
        if self.languages.is_empty() {
            return Err(ConfigError::EmptyDimension("languages"));
        }
        if self.operations.is_empty() {
            return Err(ConfigError::EmptyDimension("operations"));
        }
        if self.start_types.is_empty() {
            return Err(ConfigError::EmptyDimension("start types"));
        }
        if self.environments.is_empty() {
            return Err(ConfigError::EmptyDimension("environments"));
        }
        if self.architectures.is_empty() {
            return Err(ConfigError::EmptyDimension("architectures"));
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.languages.len()
            * self.operations.len()
            * self.start_types.len()
            * self.environments.len()
            * self.architectures.len()
    }
}

/// A validated benchmark matrix.
#[derive(Clone, Debug)]
pub struct Catalog {
    dims: Dimensions,
    iterations: u64,
    seed: u64,
    inputs: Inputs,
    answers: Option<Answers>,
    // Keyed by (language, operation, environment index, architecture).
    descriptors: BTreeMap<(Language, Operation, usize, Architecture), InvocationDescriptor>,
}

impl Catalog {
    /// Validate every dimension combination and resolve its descriptor.
    ///
    /// Fails on the first operation without an input (or without an answer,
    /// when answers are supplied) and on the first combination the resolver
    /// cannot map. Nothing is invoked.
    pub fn build(
        dims: Dimensions,
        iterations: u64,
        seed: u64,
        inputs: &Inputs,
        answers: Option<&Answers>,
        resolver: &dyn Resolver,
    ) -> Result<Self, ConfigError> {
        dims.check()?;

        let mut own_inputs = Inputs::new();
        let mut own_answers = answers.map(|_| Answers::new());
        for &op in &dims.operations {
            let input = inputs.get(&op).ok_or(ConfigError::MissingInput(op))?;
            own_inputs.insert(op, input.clone());

            if let (Some(answers), Some(own)) = (answers, own_answers.as_mut()) {
                let answer = answers.get(&op).ok_or(ConfigError::MissingAnswer(op))?;
                own.insert(op, answer.clone());
            }
        }

        let mut descriptors = BTreeMap::new();
        for &language in &dims.languages {
            for &operation in &dims.operations {
                for (env_idx, env) in dims.environments.iter().enumerate() {
                    for &arch in &dims.architectures {
                        let descriptor = resolver.resolve(language, operation, arch, env)?;
                        descriptors.insert((language, operation, env_idx, arch), descriptor);
                    }
                }
            }
        }

        Ok(Self {
            dims,
            iterations,
            seed,
            inputs: own_inputs,
            answers: own_answers,
            descriptors,
        })
    }

    pub fn len(&self) -> usize {
        self.dims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lazily yield every test case in nested enumeration order.
    pub fn iter(&self) -> CatalogIter<'_> {
        CatalogIter {
            catalog: self,
            next: 0,
            len: self.len(),
        }
    }

    fn case_at(&self, index: usize) -> Option<TestCase> {
        let d = &self.dims;
        let mut rest = index;
        let arch = d.architectures[rest % d.architectures.len()];
        rest /= d.architectures.len();
        let env_idx = rest % d.environments.len();
        rest /= d.environments.len();
        let start_type = d.start_types[rest % d.start_types.len()];
        rest /= d.start_types.len();
        let operation = d.operations[rest % d.operations.len()];
        rest /= d.operations.len();
        let language = *d.languages.get(rest)?;

        let invocation = self
            .descriptors
            .get(&(language, operation, env_idx, arch))?
            .clone();

        Some(TestCase {
            id: case_id(self.seed, index),
            language,
            operation,
            architecture: arch,
            start_type,
            iterations: self.iterations,
            environment: d.environments[env_idx].clone(),
            invocation,
            input: self.inputs.get(&operation)?.clone(),
            expected: self
                .answers
                .as_ref()
                .and_then(|answers| answers.get(&operation).cloned()),
        })
    }
}

impl<'a> IntoIterator for &'a Catalog {
    type Item = TestCase;
    type IntoIter = CatalogIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct CatalogIter<'a> {
    catalog: &'a Catalog,
    next: usize,
    len: usize,
}

impl Iterator for CatalogIter<'_> {
    type Item = TestCase;

    fn next(&mut self) -> Option<TestCase> {
        if self.next >= self.len {
            return None;
        }
        let case = self.catalog.case_at(self.next);
        self.next += 1;
        case
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.len.saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for CatalogIter<'_> {}

fn per_case_seed(master_seed: u64, index: usize) -> u64 {
    master_seed
        .wrapping_add(index as u64)
        .wrapping_mul(0x517cc1b727220a95)
}

/// UUIDv4-shaped id, derived from the seed so catalogs are reproducible.
fn case_id(seed: u64, index: usize) -> String {
    let mut rng = ChaCha8Rng::seed_from_u64(per_case_seed(seed, index));
    let mut bits: u128 = rng.gen();
    bits = (bits & !(0xf << 76)) | (0x4 << 76);
    bits = (bits & !(0x3 << 62)) | (0x2 << 62);
    let hex = format!("{bits:032x}");
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
