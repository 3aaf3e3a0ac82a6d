use clap::ValueEnum;

pub mod artifacts;
pub mod catalog;
pub mod config;
pub mod error;
pub mod harness;
pub mod invoker;
pub mod payload;
pub mod resolve;
pub mod sampler;
pub mod schema;
pub mod sink;

/// Deployment target being benchmarked.
#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
pub enum Target {
    /// Local executables on an EC2 instance.
    Ec2,
    /// AWS Lambda functions behind API Gateway.
    Lambda,
    /// Azure Functions.
    Azure,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Ec2 => "ec2",
            Target::Lambda => "lambda",
            Target::Azure => "azure",
        }
    }

    /// Measured iterations per test case in a full run.
    pub fn default_iterations(&self) -> u64 {
        match self {
            Target::Ec2 => 100,
            Target::Lambda => 50,
            Target::Azure => 30,
        }
    }

    pub fn default_languages(&self) -> Vec<payload::Language> {
        use payload::Language;
        match self {
            Target::Ec2 | Target::Lambda => Language::ALL.to_vec(),
            Target::Azure => vec![
                Language::CSharp,
                Language::Java,
                Language::Python,
                Language::TypeScript,
            ],
        }
    }

    /// Azure deploys only the ECC and RSA workloads.
    pub fn default_operations(&self) -> Vec<payload::Operation> {
        use payload::{Family, Operation};
        match self {
            Target::Ec2 | Target::Lambda => Operation::ALL.to_vec(),
            Target::Azure => Operation::ALL
                .into_iter()
                .filter(|op| matches!(op.family(), Family::Ecc | Family::Rsa))
                .collect(),
        }
    }
}
