//! The supervisor daemon: owns the configuration directory, serves the
//! CLI over the control socket, and reconciles per-VM listener child
//! processes against the desired state.
//!
//! RPC handling and sync passes are mutually serialized: requests are
//! processed inline on the accept loop, so a sync pass never interleaves
//! with a configuration mutation.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

use crate::config::{canonical_fakemac, generate_fakemac, BmcConfig, ProcessConfig};
use crate::config::{DEFAULT_ADDRESS, DEFAULT_PASSWORD, DEFAULT_PORT, DEFAULT_USERNAME};
use crate::control::{read_frame, write_frame, Reply, Request};
use crate::{Error, Result};

/// BMC status strings reported by `list` and `show`.
pub const RUNNING: &str = "running";
pub const DOWN: &str = "down";
pub const ERROR: &str = "error";

/// Cadence of the periodic reconciliation pass.
const SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Grace period between SIGTERM and SIGKILL when stopping a listener.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Children
// ---------------------------------------------------------------------------

/// How listener children are started. The default spawner re-invokes the
/// daemon binary; tests substitute a stub command.
pub trait Spawner: Send + Sync {
    fn spawn(&self, config: &BmcConfig) -> Result<Child>;
}

/// Spawns `<current_exe> listen --vm-name <name>` so each listener is a
/// real child process, fully isolated from its siblings.
pub struct ListenerSpawner;

impl Spawner for ListenerSpawner {
    fn spawn(&self, config: &BmcConfig) -> Result<Child> {
        let exe = std::env::current_exe()
            .map_err(|e| Error::Process(format!("cannot locate daemon binary: {}", e)))?;
        Command::new(exe)
            .arg("listen")
            .arg("--vm-name")
            .arg(&config.vm_name)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Process(format!("failed to spawn listener: {}", e)))
    }
}

/// One running listener child.
struct Instance {
    child: Child,
    started_at: Instant,
}

impl Instance {
    /// `None` while the child is alive, its exit status once reaped.
    fn poll(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// SIGTERM, grace period, then SIGKILL.
    async fn terminate(&mut self) {
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if tokio::time::timeout(TERMINATE_GRACE, self.child.wait())
                .await
                .is_err()
            {
                warn!("listener did not exit on SIGTERM, killing");
                let _ = self.child.kill().await;
            }
        } else {
            let _ = self.child.kill().await;
        }
        debug!("listener ran for {:?}", self.started_at.elapsed());
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// The supervisor state: configuration root plus the live child table.
pub struct Manager {
    config: ProcessConfig,
    running: HashMap<String, Instance>,
    spawner: Box<dyn Spawner>,
}

impl Manager {
    pub fn new(config: ProcessConfig) -> Result<Self> {
        Self::with_spawner(config, Box::new(ListenerSpawner))
    }

    pub fn with_spawner(config: ProcessConfig, spawner: Box<dyn Spawner>) -> Result<Self> {
        fs::create_dir_all(&config.config_dir).map_err(|e| {
            Error::Config(format!(
                "cannot create config dir {}: {}",
                config.config_dir.display(),
                e
            ))
        })?;
        Ok(Manager {
            config,
            running: HashMap::new(),
            spawner,
        })
    }

    /// Serve the control socket until SIGTERM (or Ctrl-C), then run one
    /// shutdown pass that terminates every child.
    pub async fn serve(&mut self) -> Result<()> {
        let addr = SocketAddr::from(([127, 0, 0, 1], self.config.server_port));
        let listener = TcpListener::bind(addr).await?;
        info!("vsbmcd listening on {}", addr);

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| Error::Process(format!("cannot install SIGTERM handler: {}", e)))?;
        let mut interval = tokio::time::interval(SYNC_INTERVAL);

        self.sync(false).await;
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = self.handle_connection(stream).await {
                            warn!("control connection from {} failed: {}", peer, e);
                        }
                    }
                    Err(e) => warn!("accept failed: {}", e),
                },
                _ = interval.tick() => self.sync(false).await,
                _ = sigterm.recv() => break,
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        info!("shutting down, stopping all listeners");
        self.sync(true).await;
        Ok(())
    }

    async fn handle_connection(&mut self, mut stream: TcpStream) -> Result<()> {
        let deadline = self.config.server_response_timeout;
        let request: Request = tokio::time::timeout(deadline, read_frame(&mut stream))
            .await
            .map_err(|_| Error::Control("request read timed out".into()))??;
        let reply = self.handle_request(request).await;
        tokio::time::timeout(deadline, write_frame(&mut stream, &reply))
            .await
            .map_err(|_| Error::Control("reply write timed out".into()))?
    }

    /// Dispatch one RPC command. Multi-VM commands aggregate per-VM
    /// outcomes into a single reply.
    pub async fn handle_request(&mut self, request: Request) -> Reply {
        match request {
            Request::Add {
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
                self.add(AddArgs {
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
                })
                .await
            }
            Request::Delete { vm_names } => {
                let mut reply = Reply::ok();
                for vm_name in vm_names {
                    reply.merge(self.delete(&vm_name).await);
                }
                reply
            }
            Request::Start { vm_names } => {
                let mut reply = Reply::ok();
                for vm_name in vm_names {
                    reply.merge(self.start(&vm_name).await);
                }
                reply
            }
            Request::Stop { vm_names } => {
                let mut reply = Reply::ok();
                for vm_name in vm_names {
                    reply.merge(self.stop(&vm_name).await);
                }
                reply
            }
            Request::List { fakemac } => self.list(fakemac),
            Request::Show { vm_name } => self.show(&vm_name),
        }
    }

    async fn add(&mut self, args: AddArgs) -> Reply {
        // VI credentials come as a pair or not at all.
        if args.viserver_username.is_some() != args.viserver_password.is_some() {
            return Reply::error(
                "A password and username are required to use VI Server authentication",
            );
        }

        let vm_path = self.config.config_dir.join(&args.vm_name);
        if let Err(e) = fs::create_dir(&vm_path) {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                return Reply::error(Error::AlreadyExists(args.vm_name).to_string());
            }
            let msg = format!("Failed to create vm {}. Error: {}", args.vm_name, e);
            error!("{}", msg);
            return Reply::error(msg);
        }

        let fakemac = match args.fakemac {
            Some(raw) => match canonical_fakemac(&raw) {
                Ok(mac) => mac,
                Err(e) => {
                    let _ = fs::remove_dir_all(&vm_path);
                    return Reply::error(e.to_string());
                }
            },
            None => generate_fakemac(&args.vm_name),
        };

        let config = BmcConfig {
            vm_name: args.vm_name.clone(),
            vm_uuid: args.vm_uuid,
            username: Some(args.username.unwrap_or_else(|| DEFAULT_USERNAME.to_string())),
            password: Some(args.password.unwrap_or_else(|| DEFAULT_PASSWORD.to_string())),
            address: args.address.unwrap_or_else(|| DEFAULT_ADDRESS.to_string()),
            port: args.port.unwrap_or(DEFAULT_PORT),
            fakemac,
            viserver: args.viserver,
            viserver_username: args.viserver_username,
            viserver_password: args.viserver_password,
            active: false,
        };
        if let Err(e) = config.store(&self.config.config_dir) {
            let _ = fs::remove_dir_all(&vm_path);
            return Reply::error(e.to_string());
        }
        Reply::ok()
    }

    async fn delete(&mut self, vm_name: &str) -> Reply {
        let vm_path = self.config.config_dir.join(vm_name);
        if !vm_path.exists() {
            return Reply::error(Error::VmNotFound(vm_name.to_string()).to_string());
        }

        // Best-effort stop; a broken config must not block deletion.
        if let Some(mut instance) = self.running.remove(vm_name) {
            instance.terminate().await;
        }

        if let Err(e) = fs::remove_dir_all(&vm_path) {
            return Reply::error(format!("Failed to delete vm {}. Error: {}", vm_name, e));
        }
        Reply::ok()
    }

    async fn start(&mut self, vm_name: &str) -> Reply {
        let mut config = match BmcConfig::load(&self.config.config_dir, vm_name) {
            Ok(config) => config,
            Err(e) => return Reply::error(e.to_string()),
        };

        if self.running.contains_key(vm_name) {
            self.sync(false).await;
            if self.running.contains_key(vm_name) {
                warn!(
                    "BMC instance {} already running, ignoring \"start\" command",
                    vm_name
                );
                return Reply::ok();
            }
        }

        config.active = true;
        if let Err(e) = config.store(&self.config.config_dir) {
            error!("failed to start vm {}: {}", vm_name, e);
            return Reply::error(format!("Failed to start vm {}. Error: {}", vm_name, e));
        }
        self.sync(false).await;
        Reply::ok()
    }

    async fn stop(&mut self, vm_name: &str) -> Reply {
        let mut config = match BmcConfig::load(&self.config.config_dir, vm_name) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to stop vm {}: {}", vm_name, e);
                return Reply::error(e.to_string());
            }
        };
        config.active = false;
        if let Err(e) = config.store(&self.config.config_dir) {
            return Reply::error(e.to_string());
        }
        self.sync(false).await;
        Reply::ok()
    }

    fn list(&mut self, with_fakemac: bool) -> Reply {
        let names = match self.vm_directories() {
            Ok(names) => names,
            Err(e) => return Reply::error(e.to_string()),
        };

        let mut header = vec![
            "VM name".to_string(),
            "Status".to_string(),
            "Address".to_string(),
            "Port".to_string(),
        ];
        if with_fakemac {
            header.push("Fake MAC".to_string());
        }

        let mut rows = Vec::new();
        for vm_name in names {
            // Unparseable directories are not VMs.
            let Ok(config) = BmcConfig::load(&self.config.config_dir, &vm_name) else {
                continue;
            };
            let mut row = vec![
                vm_name.clone(),
                self.status_of(&vm_name).to_string(),
                config.address,
                config.port.to_string(),
            ];
            if with_fakemac {
                row.push(config.fakemac);
            }
            rows.push(row);
        }
        Reply::table(header, rows)
    }

    fn show(&mut self, vm_name: &str) -> Reply {
        let config = match BmcConfig::load(&self.config.config_dir, vm_name) {
            Ok(config) => config,
            Err(e) => return Reply::error(e.to_string()),
        };
        let mut rows: Vec<Vec<String>> = config
            .show_rows(self.config.show_passwords)
            .into_iter()
            .map(|(key, value)| vec![key, value])
            .collect();
        rows.push(vec!["status".to_string(), self.status_of(vm_name).to_string()]);
        rows.sort();
        Reply::table(vec!["Property".to_string(), "Value".to_string()], rows)
    }

    fn status_of(&mut self, vm_name: &str) -> &'static str {
        match self.running.get_mut(vm_name) {
            Some(instance) => {
                if instance.poll().is_none() {
                    RUNNING
                } else {
                    ERROR
                }
            }
            None => DOWN,
        }
    }

    /// VM directory names under the config dir, sorted lexicographically.
    fn vm_directories(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.config.config_dir)? {
            let entry = entry?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                if let Ok(name) = entry.file_name().into_string() {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// One reconciliation pass between desired and actual state.
    ///
    /// Starts enabled-but-dead instances, terminates disabled-but-alive
    /// ones. A child that exited on its own is reaped and logged this
    /// pass and respawned on the next one if still desired.
    pub async fn sync(&mut self, shutdown: bool) {
        let names = match self.vm_directories() {
            Ok(names) => names,
            Err(e) => {
                warn!("cannot read config dir: {}", e);
                return;
            }
        };

        for vm_name in &names {
            let config = match BmcConfig::load(&self.config.config_dir, vm_name) {
                Ok(config) => config,
                Err(_) => continue, // not a VM
            };
            let desired = !shutdown && config.active;
            let state = self.running.get_mut(vm_name).map(|i| i.poll());

            if desired {
                match state {
                    Some(None) => {} // alive and wanted
                    Some(Some(status)) => {
                        debug!(
                            "found dead vBMC instance for vm {} ({})",
                            vm_name, status
                        );
                        self.running.remove(vm_name);
                    }
                    None => match self.spawner.spawn(&config) {
                        Ok(child) => {
                            self.running.insert(
                                vm_name.clone(),
                                Instance {
                                    child,
                                    started_at: Instant::now(),
                                },
                            );
                            info!("started vBMC instance for vm {}", vm_name);
                        }
                        Err(e) => error!("error starting vBMC for vm {}: {}", vm_name, e),
                    },
                }
            } else if state.is_some() {
                if let Some(mut instance) = self.running.remove(vm_name) {
                    if matches!(state, Some(None)) {
                        instance.terminate().await;
                        info!("terminated vBMC instance for vm {}", vm_name);
                    }
                }
            }
        }

        // A directory removed behind our back means its child is orphaned.
        let stale: Vec<String> = self
            .running
            .keys()
            .filter(|name| !names.contains(name))
            .cloned()
            .collect();
        for vm_name in stale {
            if let Some(mut instance) = self.running.remove(&vm_name) {
                instance.terminate().await;
                info!("terminated vBMC instance for removed vm {}", vm_name);
            }
        }
    }
}

/// Arguments of the `add` command after RPC decoding.
struct AddArgs {
    vm_name: String,
    vm_uuid: Option<String>,
    username: Option<String>,
    password: Option<String>,
    port: Option<u16>,
    address: Option<String>,
    fakemac: Option<String>,
    viserver: Option<String>,
    viserver_username: Option<String>,
    viserver_password: Option<String>,
}
