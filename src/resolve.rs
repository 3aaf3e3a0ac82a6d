//! Invocation resolution: where each (language, operation) workload lives.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::artifacts::LambdaEndpoint;
use crate::catalog::{Architecture, EnvDimension, InvocationDescriptor, PayloadChannel};
use crate::error::ConfigError;
use crate::payload::{Language, Operation};

/// Maps a dimension combination to a concrete command or URL.
///
/// Performs no I/O against the workload. An `Err` is a misconfigured
/// benchmark matrix and aborts the run.
pub trait Resolver {
    fn resolve(
        &self,
        language: Language,
        operation: Operation,
        architecture: Architecture,
        environment: &EnvDimension,
    ) -> Result<InvocationDescriptor, ConfigError>;
}

/// Command prefix and file extension for one EC2 workload language.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchRule {
    /// Interpreter to run the file with; `None` for native executables.
    pub command: Option<String>,
    pub extension: Option<&'static str>,
}

/// Local executables laid out as `<root>/<language>/<arch>/<operation>[.ext]`.
#[derive(Clone, Debug)]
pub struct Ec2Resolver {
    root: PathBuf,
    channel: PayloadChannel,
    rules: HashMap<Language, LaunchRule>,
}

impl Ec2Resolver {
    pub fn new(root: impl Into<PathBuf>, channel: PayloadChannel) -> Self {
        let native = LaunchRule {
            command: None,
            extension: None,
        };
        let rules = HashMap::from([
            (Language::CSharp, native.clone()),
            (Language::Go, native.clone()),
            (Language::Java, native.clone()),
            (Language::Rust, native),
            (
                Language::Python,
                LaunchRule {
                    command: Some("python3".to_string()),
                    extension: Some("py"),
                },
            ),
            (
                Language::TypeScript,
                LaunchRule {
                    command: Some("node".to_string()),
                    extension: Some("js"),
                },
            ),
        ]);
        Self {
            root: root.into(),
            channel,
            rules,
        }
    }

    /// Replace the launch rule table, e.g. to drop languages a host lacks.
    pub fn with_rules(mut self, rules: HashMap<Language, LaunchRule>) -> Self {
        self.rules = rules;
        self
    }
}

impl Resolver for Ec2Resolver {
    fn resolve(
        &self,
        language: Language,
        operation: Operation,
        architecture: Architecture,
        _environment: &EnvDimension,
    ) -> Result<InvocationDescriptor, ConfigError> {
        let rule = self
            .rules
            .get(&language)
            .ok_or(ConfigError::UnresolvedLanguage(language))?;

        let mut file = self
            .root
            .join(language.as_str())
            .join(architecture.as_str())
            .join(operation.as_str());
        if let Some(ext) = rule.extension {
            file.set_extension(ext);
        }
        let file = file.to_string_lossy().into_owned();

        let (program, args) = match &rule.command {
            Some(command) => (command.clone(), vec![file]),
            None => (file, Vec::new()),
        };

        Ok(InvocationDescriptor::Process {
            program,
            args,
            channel: self.channel,
        })
    }
}

/// Lambda API Gateway URLs keyed by (arch, language, operation, memory).
#[derive(Clone, Debug, Default)]
pub struct LambdaResolver {
    urls: HashMap<(Architecture, Language, Operation, u32), String>,
}

impl LambdaResolver {
    pub fn new(endpoints: impl IntoIterator<Item = LambdaEndpoint>) -> Self {
        let urls = endpoints
            .into_iter()
            .map(|e| {
                (
                    (e.architecture, e.language, e.operation, e.memory_size),
                    e.api_url,
                )
            })
            .collect();
        Self { urls }
    }
}

impl Resolver for LambdaResolver {
    fn resolve(
        &self,
        language: Language,
        operation: Operation,
        architecture: Architecture,
        environment: &EnvDimension,
    ) -> Result<InvocationDescriptor, ConfigError> {
        let EnvDimension::MemoryMb(memory) = environment else {
            return Err(ConfigError::UnresolvedEndpoint {
                language,
                operation,
                architecture,
                detail: format!("lambda needs a memory size, got `{environment}`"),
            });
        };
        let url = self
            .urls
            .get(&(architecture, language, operation, *memory))
            .ok_or_else(|| ConfigError::UnresolvedEndpoint {
                language,
                operation,
                architecture,
                detail: format!("no url for {memory} MB"),
            })?;
        Ok(InvocationDescriptor::Http { url: url.clone() })
    }
}

/// Azure Function URLs keyed by function name.
#[derive(Clone, Debug, Default)]
pub struct AzureResolver {
    urls: HashMap<String, String>,
}

impl AzureResolver {
    pub fn new(urls: HashMap<String, String>) -> Self {
        Self { urls }
    }

    /// `dotnet_<op>_program` for C#, `<language>_<op>` otherwise.
    pub fn function_name(language: Language, operation: Operation) -> String {
        match language {
            Language::CSharp => format!("dotnet_{operation}_program"),
            other => format!("{other}_{operation}"),
        }
    }
}

impl Resolver for AzureResolver {
    fn resolve(
        &self,
        language: Language,
        operation: Operation,
        architecture: Architecture,
        _environment: &EnvDimension,
    ) -> Result<InvocationDescriptor, ConfigError> {
        let name = Self::function_name(language, operation);
        let url = self
            .urls
            .get(&name)
            .ok_or_else(|| ConfigError::UnresolvedEndpoint {
                language,
                operation,
                architecture,
                detail: format!("no function named `{name}`"),
            })?;
        Ok(InvocationDescriptor::Http { url: url.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ec2_interpreted_languages_get_a_command_prefix() {
        let r = Ec2Resolver::new("/opt/ec2", PayloadChannel::Argument);
        let d = r
            .resolve(
                Language::Python,
                Operation::Sha256,
                Architecture::Arm,
                &EnvDimension::None,
            )
            .unwrap();
        assert_eq!(
            d,
            InvocationDescriptor::Process {
                program: "python3".to_string(),
                args: vec!["/opt/ec2/python/arm/sha256.py".to_string()],
                channel: PayloadChannel::Argument,
            }
        );

        let d = r
            .resolve(
                Language::TypeScript,
                Operation::Rsa2048Encrypt,
                Architecture::X86,
                &EnvDimension::None,
            )
            .unwrap();
        let InvocationDescriptor::Process { program, args, .. } = d else {
            panic!("expected a process descriptor");
        };
        assert_eq!(program, "node");
        assert_eq!(args, vec!["/opt/ec2/typescript/x86/rsa2048_encrypt.js".to_string()]);
    }

    #[test]
    fn ec2_native_languages_run_the_file() {
        let r = Ec2Resolver::new("/opt/ec2", PayloadChannel::Stdin);
        let d = r
            .resolve(
                Language::CSharp,
                Operation::Ecc256Verify,
                Architecture::X86,
                &EnvDimension::InstanceType("c6i.large".into()),
            )
            .unwrap();
        assert_eq!(
            d,
            InvocationDescriptor::Process {
                program: "/opt/ec2/c#/x86/ecc256_verify".to_string(),
                args: vec![],
                channel: PayloadChannel::Stdin,
            }
        );
    }

    #[test]
    fn ec2_unmapped_language_fails_fast() {
        let r = Ec2Resolver::new("/opt/ec2", PayloadChannel::Argument).with_rules(HashMap::new());
        let err = r
            .resolve(
                Language::Go,
                Operation::Sha256,
                Architecture::X86,
                &EnvDimension::None,
            )
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvedLanguage(Language::Go)));
    }

    #[test]
    fn lambda_lookup_uses_memory_size() {
        let r = LambdaResolver::new([LambdaEndpoint {
            architecture: Architecture::Arm,
            language: Language::Rust,
            operation: Operation::Sha384,
            memory_size: 1024,
            api_url: "https://api.example/prod/sha384".to_string(),
        }]);
        let ok = r.resolve(
            Language::Rust,
            Operation::Sha384,
            Architecture::Arm,
            &EnvDimension::MemoryMb(1024),
        );
        assert_eq!(
            ok.unwrap(),
            InvocationDescriptor::Http {
                url: "https://api.example/prod/sha384".to_string()
            }
        );

        let missing = r.resolve(
            Language::Rust,
            Operation::Sha384,
            Architecture::Arm,
            &EnvDimension::MemoryMb(128),
        );
        assert!(matches!(missing, Err(ConfigError::UnresolvedEndpoint { .. })));
    }

    #[test]
    fn azure_function_names() {
        assert_eq!(
            AzureResolver::function_name(Language::CSharp, Operation::Rsa2048Decrypt),
            "dotnet_rsa2048_decrypt_program"
        );
        assert_eq!(
            AzureResolver::function_name(Language::Java, Operation::Ecc384Verify),
            "java_ecc384_verify"
        );
    }
}
