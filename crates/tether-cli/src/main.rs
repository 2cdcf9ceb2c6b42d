use std::fmt::Display;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use tether_core::app::{ConcurrentRollup, ResultReporter, TransparentRunner, Wrapper};
use tether_core::config::{
    ENDPOINT_ENV, ExitCodePolicy, JOB_ID_ENV, LOG_ENV, RETRYABLE_EXIT_CODE_ENV, RemoteConfig,
    WrapperConfig,
};
use tether_core::domain::{
    DEFAULT_RETRYABLE_EXIT_CODE, DeclaredOutput, INTERNAL_ERROR_EXIT_CODE, InputDescriptor, JobId,
    PatternPreset, RollupRequest, WrapperError,
};
use tether_core::impls::{CommandSource, HttpBlobStore, HttpJobTracker, RemoteClient};
use tether_core::ports::JobTracker;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "tether")]
#[command(version = VERSION)]
#[command(about = "Run a command and report its outcome in a form schedulers can act on")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envelope mode: stage inputs, run, upload outputs, print a JSON result envelope
    Exec(ExecArgs),
    /// Transparent mode: run with untouched stdio and rewrite the exit code
    Run(RunArgs),
    /// Roll sub-resource details up into one external object
    Rollup(RollupArgs),
}

#[derive(Args)]
struct RetryArgs {
    /// Built-in retryable stderr markers (terraform-apply, pulumi-up)
    #[arg(long = "preset", value_name = "NAME")]
    presets: Vec<PatternPreset>,

    /// Stderr substring that marks a failure as retryable
    #[arg(long = "retryable-pattern", value_name = "TEXT")]
    patterns: Vec<String>,

    /// Exit code used for retryable failures
    #[arg(long, env = RETRYABLE_EXIT_CODE_ENV, default_value_t = DEFAULT_RETRYABLE_EXIT_CODE)]
    retryable_exit_code: i32,
}

impl RetryArgs {
    fn policy(self) -> ExitCodePolicy {
        let policy = ExitCodePolicy {
            retryable_exit_code: self.retryable_exit_code,
            retryable_patterns: self.patterns,
            ..ExitCodePolicy::default()
        };
        self.presets
            .into_iter()
            .fold(policy, ExitCodePolicy::with_preset)
    }
}

#[derive(Args)]
struct ExecArgs {
    /// Blob to download before running
    #[arg(long = "input", value_name = "PATH=CONTENT_ID")]
    inputs: Vec<InputDescriptor>,

    /// File to upload after running
    #[arg(long = "output", value_name = "NAME=PATH")]
    outputs: Vec<DeclaredOutput>,

    /// Exit codes under which a missing output is not an error (default: 0)
    #[arg(long = "success-exit-code", value_name = "CODE")]
    success_exit_codes: Vec<i32>,

    #[command(flatten)]
    retry: RetryArgs,

    /// Base URL of the blob and job service
    #[arg(long, env = ENDPOINT_ENV)]
    endpoint: Option<String>,

    /// Connect timeout for the remote service, in seconds
    #[arg(long, default_value_t = 30)]
    connect_timeout: u64,

    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    retry: RetryArgs,

    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[derive(Args)]
struct RollupArgs {
    #[arg(long)]
    name: String,

    #[arg(long, default_value = "service")]
    object_type: String,

    /// Sub-resources owned by anyone else report an unknown version
    #[arg(long)]
    owner_id: Option<String>,

    /// Program printing one sub-resource detail as JSON; called as `PROGRAM [ARGS...] <id>`
    #[arg(long, value_name = "PROGRAM")]
    describe_cmd: String,

    #[arg(long = "describe-arg", value_name = "ARG", allow_hyphen_values = true)]
    describe_args: Vec<String>,

    #[arg(required = true, value_name = "ID")]
    ids: Vec<String>,
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter));
    // stdout belongs to the envelope or the wrapped tool
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn split_command(mut command: Vec<String>) -> (String, Vec<String>) {
    let program = command.remove(0);
    (program, command)
}

async fn exec(args: ExecArgs, cancel: CancellationToken) -> Result<i32, WrapperError> {
    let endpoint = args
        .endpoint
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| {
            WrapperError::Config(format!("no remote endpoint (set --endpoint or {ENDPOINT_ENV})"))
        })?;

    let client = Arc::new(RemoteClient::new(RemoteConfig {
        endpoint,
        connect_timeout_secs: args.connect_timeout,
    }));
    let store = Arc::new(HttpBlobStore::new(client.clone()));
    let tracker: Arc<dyn JobTracker> = Arc::new(HttpJobTracker::new(client));
    let reporter = ResultReporter::new(Some(tracker), JobId::from_env(JOB_ID_ENV));

    let mut policy = args.retry.policy();
    if !args.success_exit_codes.is_empty() {
        policy.success_exit_codes = args.success_exit_codes;
    }

    let (program, rest) = split_command(args.command);
    let mut config = WrapperConfig::new(program, rest);
    config.inputs = args.inputs;
    config.outputs = args.outputs;
    config.policy = policy;

    let wrapper = Wrapper::new(config, store, reporter, cancel);
    wrapper
        .run(&mut std::io::stdout(), &mut std::io::stderr())
        .await
}

async fn run(args: RunArgs, cancel: CancellationToken) -> Result<i32, WrapperError> {
    let classifier = args.retry.policy().classifier();
    let (program, rest) = split_command(args.command);
    let runner = TransparentRunner::new(program, rest, classifier, cancel);
    let (_, code) = runner.run(&mut std::io::stderr()).await?;
    Ok(code)
}

async fn rollup(args: RollupArgs, cancel: CancellationToken) -> Result<i32, String> {
    let source = Arc::new(CommandSource::new(args.describe_cmd, args.describe_args));
    let request = RollupRequest {
        name: args.name,
        object_type: args.object_type,
        sub_resources: args.ids,
        owner_id: args.owner_id,
    };
    let object = ConcurrentRollup::new(source, cancel)
        .run(&request)
        .await
        .map_err(|e| e.to_string())?;
    let json = serde_json::to_string(&object).map_err(|e| e.to_string())?;
    println!("{json}");
    Ok(0)
}

fn exit_code<E: Display>(result: Result<i32, E>) -> i32 {
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("tether: {e}");
            INTERNAL_ERROR_EXIT_CODE
        }
    }
}

#[tokio::main]
async fn main() {
    // usage errors must not look like the retryable sentinel (clap exits with 2)
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { INTERNAL_ERROR_EXIT_CODE } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    // transparent mode adds nothing to stderr unless something is wrong
    init_tracing(match cli.command {
        Commands::Run(_) => "warn",
        _ => "info",
    });

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("[tether] interrupted, shutting down");
                cancel.cancel();
            }
        });
    }

    let code = match cli.command {
        Commands::Exec(args) => exit_code(exec(args, cancel).await),
        Commands::Run(args) => exit_code(run(args, cancel).await),
        Commands::Rollup(args) => exit_code(rollup(args, cancel).await),
    };
    std::process::exit(code);
}
