//! vsbmcd - the virtual BMC supervisor daemon
//!
//! Without a subcommand this runs the supervisor: the control socket, the
//! periodic sync loop, and the listener children. The hidden `listen`
//! subcommand is the entry point for those children, one process per
//! enabled VM.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vsbmc::config::ProcessConfig;
use vsbmc::manager::Manager;

#[derive(Parser)]
#[command(
    name = "vsbmcd",
    version,
    about = "Supervisor daemon for virtual BMCs backed by vSphere virtual machines"
)]
struct Cli {
    /// Append logs to <config_dir>/vsbmcd.log instead of stderr
    #[arg(long)]
    log_file: bool,

    #[command(subcommand)]
    command: Option<ChildCommand>,
}

#[derive(Subcommand)]
enum ChildCommand {
    /// Run a single listener (spawned by the supervisor, one per VM)
    #[command(hide = true)]
    Listen {
        #[arg(long)]
        vm_name: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let process = ProcessConfig::from_env();
    let _guard = init_tracing(&process, cli.log_file);

    let result = match cli.command {
        Some(ChildCommand::Listen { vm_name }) => vsbmc::bmc::run_listener(&process, &vm_name),
        None => run_supervisor(process),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("vsbmcd: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_supervisor(process: ProcessConfig) -> vsbmc::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let mut manager = Manager::new(process)?;
    runtime.block_on(manager.serve())
}

fn init_tracing(
    process: &ProcessConfig,
    log_file: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_file {
        let appender = tracing_appender::rolling::never(&process.config_dir, "vsbmcd.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}
