//! `pipen run`: the CLI front end for the pipeline engine. A flat options
//! struct built with `clap`'s derive API, env/profile merging via
//! `pipen_util::config`, and `anyhow`-chain error reporting at the process
//! boundary.

mod pipeline_file;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use pipen_core::pipeline::Pipeline;
use pipen_core::plugin::PluginRegistry;
use pipen_core::shutdown::ShutdownSignal;
use pipen_scheduler::dry::DryBackend;
use pipen_scheduler::local::LocalBackend;
use pipen_scheduler::sge::SgeBackend;
use pipen_scheduler::slurm::SlurmBackend;
use pipen_scheduler::ssh::SshBackend;
use pipen_util::config::{self, CachePolicy, CliOverrides, EnvOverrides};
use pipen_util::log::root_logger;
use pipen_util::process::ExitCode;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "pipen", version, about = "Run a pipen pipeline.")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a pipeline defined in a TOML pipeline file.
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Named profile to load from `$XDG_CONFIG_HOME/pipen/<name>.toml`.
    #[arg(long)]
    profile: Option<String>,

    /// Minimum log level to emit.
    #[arg(long, value_name = "LEVEL")]
    loglevel: Option<String>,

    /// Working directory for per-job scratch files.
    #[arg(long, value_name = "PATH")]
    workdir: Option<PathBuf>,

    /// Directory where `ends` processes' declared outputs are symlinked.
    #[arg(long, value_name = "PATH")]
    outdir: Option<PathBuf>,

    /// Max concurrent jobs per process, applied as a floor when a process
    /// doesn't declare its own.
    #[arg(long, value_name = "N")]
    forks: Option<usize>,

    /// Cache policy: `true`, `false`, or `force`.
    #[arg(long, value_name = "true|false|force")]
    cache: Option<String>,

    /// Default scheduler back-end for processes that don't name one.
    #[arg(long, value_name = "NAME")]
    scheduler: Option<String>,

    /// Comma-separated plugin selectors (`"name"`, `+name`, `-name`).
    #[arg(long, value_delimiter = ',')]
    plugins: Option<Vec<String>>,

    /// Remote host for the `ssh` scheduler back-end, if any process uses it.
    #[arg(long, default_value = "localhost")]
    ssh_host: String,

    /// Path to the TOML pipeline file.
    pipeline_file: PathBuf,
}

fn main() -> std::process::ExitCode {
    let args = Cli::parse();
    let Command::Run(run_args) = args.command;

    match run(run_args) {
        Ok(code) => code.into(),
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::CONFIG_ERROR.into()
        }
    }
}

fn run(args: RunArgs) -> Result<ExitCode> {
    let profile_path = config::profile_path(args.profile.as_deref())?;
    let profile = config::load_profile_file(&profile_path)?;
    let env = EnvOverrides::from_env();
    let cli = CliOverrides {
        workdir: args.workdir,
        outdir: args.outdir,
        forks: args.forks,
        cache: args.cache.as_deref().map(CachePolicy::from_str).transpose().map_err(anyhow::Error::msg)?,
        scheduler: args.scheduler,
        loglevel: args.loglevel,
        plugins: args.plugins,
    };
    let engine_config = config::merge(profile, env, cli)?;

    let log = root_logger(engine_config.loglevel);

    let (pipeline_name, processes) =
        pipeline_file::load(&args.pipeline_file).with_context(|| format!("loading pipeline file {}", args.pipeline_file.display()))?;
    let ssh_host = args.ssh_host;

    let registry = PluginRegistry::new();
    let snapshot = registry.snapshot(&engine_config.plugins);

    let mut backends: HashMap<String, Arc<dyn pipen_core::scheduler::SchedulerBackend>> = HashMap::new();
    backends.insert("local".to_owned(), Arc::new(LocalBackend::new()));
    backends.insert("dry".to_owned(), Arc::new(DryBackend));
    backends.insert("ssh".to_owned(), Arc::new(SshBackend::new(ssh_host)));
    backends.insert("sge".to_owned(), Arc::new(SgeBackend));
    backends.insert("slurm".to_owned(), Arc::new(SlurmBackend));

    let pipeline = Pipeline::new(
        pipeline_name,
        processes,
        engine_config.workdir.clone(),
        engine_config.outdir.clone(),
        snapshot,
        backends,
        log,
    );

    // Current-thread runtime: the engine is cooperatively single-threaded
    // for control flow (spec §5), with concurrency coming from bounded
    // per-process job pools, not OS threads.
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().context("building async runtime")?;
    runtime.block_on(async {
        let shutdown = ShutdownSignal::new();
        let shutdown_for_signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown_for_signal.trigger();
            }
        });

        let succeeded = pipeline.run(shutdown).await?;
        Ok(ExitCode::from_succeeded(succeeded))
    })
}
