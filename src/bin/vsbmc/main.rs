//! vsbmc - command-line client for the virtual BMC supervisor
//!
//! Builds JSON requests out of its options, exchanges them with `vsbmcd`
//! over the control socket, and renders table replies. Unless
//! `--no-daemon` is given, a missing daemon is started automatically.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{ExitCode, Stdio};
use std::time::Duration;

use clap::{Parser, Subcommand};

use vsbmc::config::ProcessConfig;
use vsbmc::control::{self, Reply, Request};
use vsbmc::{Error, Result};

/// Retry cadence while waiting for an auto-started daemon to come up.
const STARTUP_RETRIES: u32 = 25;
const STARTUP_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(
    name = "vsbmc",
    version,
    about = "Virtual Baseboard Management Controller (BMC) backed by vSphere virtual machines"
)]
struct Cli {
    /// Do not start vsbmcd automatically
    #[arg(long, global = true)]
    no_daemon: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new BMC for a virtual machine
    Add {
        /// The name of the virtual machine
        vm_name: String,
        /// The UUID of the virtual machine; when given, the UUID is used
        /// instead of the name to identify it on the VI server
        #[arg(long)]
        vm_uuid: Option<String>,
        /// The BMC username
        #[arg(long, default_value = "admin")]
        username: String,
        /// The BMC password
        #[arg(long, default_value = "password")]
        password: String,
        /// Port to listen on
        #[arg(long, default_value_t = 6230)]
        port: u16,
        /// The address to bind to (IPv4 and IPv6 are supported)
        #[arg(long, default_value = "::")]
        address: String,
        /// The fake MAC address reported to vCenter Server; derived from
        /// the VM name when omitted
        #[arg(long)]
        fakemac: Option<String>,
        /// The VI server
        #[arg(long)]
        viserver: Option<String>,
        /// The VI server username
        #[arg(long)]
        viserver_username: Option<String>,
        /// The VI server password
        #[arg(long)]
        viserver_password: Option<String>,
    },
    /// Delete a virtual BMC for a virtual machine
    Delete {
        #[arg(required = true)]
        vm_names: Vec<String>,
    },
    /// Start a virtual BMC for a virtual machine
    Start {
        #[arg(required = true)]
        vm_names: Vec<String>,
    },
    /// Stop a virtual BMC for a virtual machine
    Stop {
        #[arg(required = true)]
        vm_names: Vec<String>,
    },
    /// List all virtual BMC instances
    List {
        /// Display the Fake MAC column
        #[arg(long)]
        fakemac: bool,
    },
    /// Show virtual BMC properties
    Show { vm_name: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let process = ProcessConfig::from_env();

    let request = match build_request(cli.command) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("vsbmc: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match communicate(&process, &request, cli.no_daemon).await {
        Ok(reply) if reply.rc == 0 => {
            if let (Some(header), Some(mut rows)) = (reply.header, reply.rows) {
                rows.sort();
                print_table(&header, &rows);
            }
            ExitCode::SUCCESS
        }
        Ok(reply) => {
            eprintln!("vsbmc: ({})", reply.rc);
            for line in reply.msg {
                eprintln!("{}", line);
            }
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("vsbmc: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn build_request(command: Command) -> Result<Request> {
    Ok(match command {
        Command::Add {
            vm_name,
            vm_uuid,
            username,
            password,
            port,
            address,
            fakemac,
            viserver,
            viserver_username,
            viserver_password,
        } => {
            if viserver_username.is_some() != viserver_password.is_some() {
                return Err(Error::Config(
                    "A password and username are required to use VI Server authentication".into(),
                ));
            }
            Request::Add {
                vm_name,
                vm_uuid,
                username: Some(username),
                password: Some(password),
                port: Some(port),
                address: Some(address),
                fakemac,
                viserver,
                viserver_username,
                viserver_password,
            }
        }
        Command::Delete { vm_names } => Request::Delete { vm_names },
        Command::Start { vm_names } => Request::Start { vm_names },
        Command::Stop { vm_names } => Request::Stop { vm_names },
        Command::List { fakemac } => Request::List { fakemac },
        Command::Show { vm_name } => Request::Show { vm_name },
    })
}

/// Exchange one request with the daemon, auto-starting it on connection
/// refusal unless suppressed.
async fn communicate(process: &ProcessConfig, request: &Request, no_daemon: bool) -> Result<Reply> {
    let addr = SocketAddr::from(([127, 0, 0, 1], process.server_port));
    let timeout = process.server_response_timeout;

    match control::call(addr, request, timeout).await {
        Ok(reply) => Ok(reply),
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused && !no_daemon => {
            spawn_daemon()?;
            for _ in 0..STARTUP_RETRIES {
                tokio::time::sleep(STARTUP_RETRY_DELAY).await;
                match control::call(addr, request, timeout).await {
                    Ok(reply) => return Ok(reply),
                    Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {}
                    Err(e) => return Err(e),
                }
            }
            Err(Error::Control(format!(
                "failed to connect to the vsbmcd server on port {}",
                process.server_port
            )))
        }
        Err(e) => Err(e),
    }
}

/// Start `vsbmcd` detached: the sibling binary when present, PATH lookup
/// otherwise.
fn spawn_daemon() -> Result<()> {
    let sibling = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("vsbmcd")));
    let program = match sibling {
        Some(path) if path.exists() => path,
        _ => PathBuf::from("vsbmcd"),
    };
    std::process::Command::new(program)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| Error::Process(format!("failed to start vsbmcd: {}", e)))?;
    Ok(())
}

fn print_table(header: &[String], rows: &[Vec<String>]) {
    let mut widths: Vec<usize> = header.iter().map(String::len).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let rule: String = widths
        .iter()
        .map(|w| format!("+{}", "-".repeat(w + 2)))
        .collect::<String>()
        + "+";

    let render = |cells: &[String]| {
        let line: String = cells
            .iter()
            .zip(&widths)
            .map(|(cell, w)| format!("| {:<width$} ", cell, width = w))
            .collect();
        format!("{}|", line)
    };

    println!("{}", rule);
    println!("{}", render(header));
    println!("{}", rule);
    for row in rows {
        println!("{}", render(row));
    }
    println!("{}", rule);
}
