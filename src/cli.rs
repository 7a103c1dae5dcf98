use crate::config::settings::SandboxConfig;
use crate::config::types::{DirectoryBinding, ExecutionRequest, ResourceAmounts};
use crate::core::container::{Container, ContainerSpec};
use crate::kernel::cgroup::backend;
use crate::kernel::namespace::NamespaceIsolation;
use crate::kernel::signal::SignalHandler;
use crate::safety::ContainerId;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to $SANDCELL_CONFIG, then ./sandcell.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command in a fresh container, possibly several times
    Run {
        /// Memory limit in kB
        #[arg(long)]
        mem: Option<u64>,
        /// CPU time limit in milliseconds
        #[arg(long)]
        cpu: Option<u64>,
        /// Wall clock time limit in milliseconds
        #[arg(long)]
        wall: Option<u64>,
        /// Maximum number of concurrent processes
        #[arg(long)]
        processes: Option<u64>,
        /// Block I/O budget in kB
        #[arg(long)]
        disk_io: Option<u64>,
        /// Execute the command this many times, resetting in between
        #[arg(long, default_value_t = 1)]
        repeat: u32,
        /// Extra directory bindings (format: source=target:options)
        #[arg(long = "dir", value_name = "BINDING")]
        directory_bindings: Vec<String>,
        /// Working directory inside the container
        #[arg(long, default_value = "/")]
        workdir: PathBuf,
        #[arg(long)]
        stdin: Option<PathBuf>,
        #[arg(long)]
        stdout: Option<PathBuf>,
        #[arg(long)]
        stderr: Option<PathBuf>,
        /// Command and arguments to execute
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Show what isolation this host supports
    Probe,
}

pub fn run() -> Result<()> {
    env_logger::init();
    let signals = SignalHandler::init()?;
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SandboxConfig::load_from_file(path)?,
        None => SandboxConfig::load_default()?,
    };

    match cli.command {
        Commands::Probe => probe(&config),
        Commands::Run {
            mem,
            cpu,
            wall,
            processes,
            disk_io,
            repeat,
            directory_bindings,
            workdir,
            stdin,
            stdout,
            stderr,
            command,
        } => {
            let mut spec = ContainerSpec::from_config(&config)?;
            for binding in &directory_bindings {
                spec.bindings.push(DirectoryBinding::parse(binding)?);
            }

            let limits = ResourceAmounts {
                cpu_time_ms: cpu,
                wall_time_ms: wall,
                memory_kb: mem,
                processes,
                disk_io_kb: disk_io,
            };
            let id = ContainerId::allocate(
                &config.container.lock_dir,
                config.container.max_containers,
            )?;
            let mut container = Container::new(id, spec)?;

            for round in 0..repeat {
                if signals.shutdown_requested() {
                    log::info!("Stopping after signal {}", signals.get_signal());
                    break;
                }
                if round > 0 {
                    container.reset()?;
                }

                let mut request = ExecutionRequest::new(command.iter().cloned())
                    .with_limits(limits.clone());
                request.workdir = workdir.clone();
                request.stdin = stdin.clone();
                request.stdout = stdout.clone();
                request.stderr = stderr.clone();

                let termination = container
                    .execute(&request)
                    .with_context(|| format!("execution {} of {:?} failed", round + 1, command))?;
                println!("{}", serde_json::to_string(&termination)?);
            }
            Ok(())
        }
    }
}

fn probe(config: &SandboxConfig) -> Result<()> {
    let backend = backend::detected_backend(&config.cgroup.root)
        .map(backend::backend_type_name)
        .unwrap_or("unavailable");
    let report = serde_json::json!({
        "cgroup_root": config.cgroup.root,
        "cgroup_backend": backend,
        "namespaces_supported": NamespaceIsolation::is_supported(),
        "namespaces": NamespaceIsolation::available_namespaces(),
        "running_as_root": nix::unistd::geteuid().is_root(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
