use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cryptobench_runner::artifacts;
use cryptobench_runner::catalog::{
    Architecture, Catalog, Dimensions, EnvDimension, PayloadChannel, StartType,
};
use cryptobench_runner::config::{HarnessConfig, Profile};
use cryptobench_runner::harness::Harness;
use cryptobench_runner::invoker::DescriptorFactory;
use cryptobench_runner::payload::{Language, Operation};
use cryptobench_runner::resolve::{AzureResolver, Ec2Resolver, LambdaResolver, Resolver};
use cryptobench_runner::sampler::Sampler;
use cryptobench_runner::schema::RunMeta;
use cryptobench_runner::sink::{CsvSink, FanOut, JsonReportSink};
use cryptobench_runner::Target;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProfileArg {
    Quick,
    Full,
}

impl From<ProfileArg> for Profile {
    fn from(v: ProfileArg) -> Self {
        match v {
            ProfileArg::Quick => Profile::Quick,
            ProfileArg::Full => Profile::Full,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Spawn local workload executables and sample their CPU/memory.
    Ec2 {
        /// Root of the per-language workload tree (`<root>/<lang>/<arch>/<op>`).
        #[arg(long, value_name = "DIR", default_value = "../iac-microbenchmark/ec2")]
        root: PathBuf,

        /// Instance type recorded as the environment dimension.
        #[arg(long, default_value = "local")]
        instance_type: String,

        /// Workload architecture; defaults to the host's.
        #[arg(long)]
        arch: Option<Architecture>,

        /// Feed the payload on stdin instead of as the last argument.
        #[arg(long, default_value_t = false)]
        stdin: bool,
    },

    /// POST to Lambda functions, one URL per (arch, language, operation, memory).
    Lambda {
        #[arg(long, value_name = "FILE", default_value = "../iac-microbenchmark/lambda_benchmark_urls.json")]
        urls: PathBuf,

        /// Memory sizes in MB.
        #[arg(long, value_delimiter = ',', default_values_t = [128u32, 256, 512, 1024, 1536, 2048])]
        memory_sizes: Vec<u32>,

        #[arg(long, value_delimiter = ',', default_values = ["x86", "arm"])]
        architectures: Vec<Architecture>,
    },

    /// POST to Azure Functions, one URL per function name.
    Azure {
        #[arg(long, value_name = "FILE", default_value = "./function_urls.json")]
        urls: PathBuf,
    },
}

impl Command {
    fn target(&self) -> Target {
        match self {
            Command::Ec2 { .. } => Target::Ec2,
            Command::Lambda { .. } => Target::Lambda,
            Command::Azure { .. } => Target::Azure,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "cryptobench-runner")]
#[command(about = "Cryptographic microbenchmark runner (JSON/CSV output)")]
struct Args {
    #[arg(long, value_enum, default_value_t = ProfileArg::Full, global = true)]
    profile: ProfileArg,

    /// Seed for reproducible test case ids.
    #[arg(long, default_value_t = 0, global = true)]
    seed: u64,

    /// Where to write the JSON report. If omitted, prints to stdout.
    #[arg(long, global = true)]
    out: Option<PathBuf>,

    /// Also write one CSV row per iteration here.
    #[arg(long, value_name = "FILE", global = true)]
    csv: Option<PathBuf>,

    /// JSON file overriding harness tunables.
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[arg(long, value_name = "DIR", default_value = "../../TestArtifacts/inputs", global = true)]
    inputs: PathBuf,

    /// Expected outputs; omit to run without validation.
    #[arg(long, value_name = "DIR", global = true)]
    answers: Option<PathBuf>,

    /// Comma-separated subset of languages (default: all the target deploys).
    #[arg(long, value_delimiter = ',', global = true)]
    languages: Vec<Language>,

    /// Comma-separated subset of operations (default: all the target deploys).
    #[arg(long, value_delimiter = ',', global = true)]
    operations: Vec<Operation>,

    #[arg(long, value_delimiter = ',', default_values = ["cold", "warm"], global = true)]
    start_types: Vec<StartType>,

    /// Override the profile's iteration count.
    #[arg(long, global = true)]
    iterations: Option<u64>,

    /// Override the warm-up count.
    #[arg(long, global = true)]
    warmup: Option<u32>,

    /// Kill an invocation that runs longer than this.
    #[arg(long, value_name = "MS", global = true)]
    timeout_ms: Option<u64>,

    /// Print the expanded catalog and exit without invoking anything.
    #[arg(long, default_value_t = false, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    cmd: Command,
}

/// Run timestamp as `unix:<seconds>`.
fn now_unix_label() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("unix:{secs}")
}

fn git_sha_short() -> Option<String> {
    // Best-effort: read from environment set by CI/build scripts.
    std::env::var("GIT_SHA")
        .ok()
        .or_else(|| std::env::var("GITHUB_SHA").ok())
        .map(|s| s.chars().take(12).collect())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn harness_config(args: &Args, target: Target, profile: Profile) -> Result<HarnessConfig> {
    let mut cfg = HarnessConfig::for_target(target);
    cfg.warmup_count = profile.warmup_iters();
    if let Some(path) = &args.config {
        cfg = cfg
            .merge_file(path)
            .with_context(|| format!("loading harness config {}", path.display()))?;
    }
    if let Some(warmup) = args.warmup {
        cfg.warmup_count = warmup;
    }
    if let Some(ms) = args.timeout_ms {
        cfg.invocation_timeout_ms = Some(ms);
    }
    if let Command::Ec2 { stdin: true, .. } = args.cmd {
        cfg.payload_channel = PayloadChannel::Stdin;
    }
    Ok(cfg)
}

/// Resolver plus the environment and architecture dimensions for a target.
fn resolution(
    cmd: &Command,
    cfg: &HarnessConfig,
) -> Result<(Box<dyn Resolver>, Vec<EnvDimension>, Vec<Architecture>)> {
    Ok(match cmd {
        Command::Ec2 {
            root,
            instance_type,
            arch,
            ..
        } => (
            Box::new(Ec2Resolver::new(root.clone(), cfg.payload_channel)) as Box<dyn Resolver>,
            vec![EnvDimension::InstanceType(instance_type.clone())],
            vec![arch.unwrap_or_else(Architecture::host)],
        ),
        Command::Lambda {
            urls,
            memory_sizes,
            architectures,
        } => {
            let endpoints =
                artifacts::load_lambda_endpoints(urls).context("loading lambda urls")?;
            (
                Box::new(LambdaResolver::new(endpoints)) as Box<dyn Resolver>,
                memory_sizes.iter().copied().map(EnvDimension::MemoryMb).collect(),
                architectures.clone(),
            )
        }
        Command::Azure { urls } => {
            let urls = artifacts::load_azure_urls(urls).context("loading azure function urls")?;
            (
                Box::new(AzureResolver::new(urls)) as Box<dyn Resolver>,
                vec![EnvDimension::None],
                vec![Architecture::X86],
            )
        }
    })
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let target = args.cmd.target();
    let profile: Profile = args.profile.into();
    let cfg = harness_config(&args, target, profile)?;

    let languages = if args.languages.is_empty() {
        target.default_languages()
    } else {
        args.languages.clone()
    };
    let operations = if args.operations.is_empty() {
        target.default_operations()
    } else {
        args.operations.clone()
    };

    let inputs = artifacts::load_inputs(&args.inputs, &operations)
        .context("loading operation inputs")?;
    info!(count = inputs.len(), "loaded operation inputs");
    let answers = match &args.answers {
        Some(dir) => {
            let answers =
                artifacts::load_answers(dir, &operations).context("loading correct answers")?;
            info!(count = answers.len(), "loaded correct answers");
            Some(answers)
        }
        None => None,
    };

    let (resolver, environments, architectures) = resolution(&args.cmd, &cfg)?;

    let dims = Dimensions {
        languages,
        operations,
        start_types: args.start_types.clone(),
        environments,
        architectures,
    };
    let iterations = args.iterations.unwrap_or_else(|| profile.iters(target));
    let catalog = Catalog::build(
        dims,
        iterations,
        args.seed,
        &inputs,
        answers.as_ref(),
        resolver.as_ref(),
    )
    .context("building test case catalog")?;
    info!(cases = catalog.len(), iterations, target = target.as_str(), "catalog ready");

    if args.dry_run {
        let cases: Vec<_> = catalog.iter().collect();
        println!("{}", serde_json::to_string_pretty(&cases)?);
        return Ok(());
    }

    let meta = RunMeta {
        schema_version: 1,
        runner_version: env!("CARGO_PKG_VERSION").to_string(),
        profile: profile.as_str().to_string(),
        target: target.as_str().to_string(),
        seed: args.seed,
        timestamp_utc: now_unix_label(),
        git_sha: git_sha_short(),
    };

    let mut sink = FanOut::default();
    sink.push(Box::new(JsonReportSink::new(meta, args.out.clone())));
    if let Some(path) = &args.csv {
        let csv = CsvSink::create(path).with_context(|| format!("creating {}", path.display()))?;
        sink.push(Box::new(csv));
    }

    let mut factory = DescriptorFactory::new(&cfg);
    let harness = match target {
        Target::Ec2 => Harness::new(cfg),
        Target::Lambda | Target::Azure => Harness::with_sampler(cfg, Sampler::Unavailable),
    };
    harness
        .run(&catalog, &mut factory, &mut sink)
        .context("writing results")?;

    Ok(())
}
