use crate::config::{ControllerConfig, ProxyBindings, ProxyExecutables};
use crate::error::{ControllerError, Result};
use crate::logs::LogDirectory;
use crate::process::{KillReport, ProcessTable};
use crate::profile::{ProfileStore, ServiceProfile, CONFDIR_OPTION};
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Which of the two proxy executables was launched
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyVariant {
    /// mitmweb, serves the web UI
    Web,
    /// mitmdump, no UI
    Headless,
}

/// The supervisor's view of the process it launched
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: u32,
    pub log_path: PathBuf,
    pub variant: ProxyVariant,
    /// Asks the exit watcher to kill the process
    kill_tx: Option<oneshot::Sender<()>>,
}

/// Sent by an exit watcher once its process is gone
#[derive(Debug)]
pub struct ExitNotice {
    pub pid: u32,
    pub status: Option<ExitStatus>,
}

/// How a stop request was satisfied
#[derive(Debug)]
pub enum StopOutcome {
    /// The process this supervisor launched was killed
    Stopped { pid: u32 },
    /// No owned handle; processes found by image name were killed instead
    TerminatedExternal(KillReport),
}

impl fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopOutcome::Stopped { pid } => write!(f, "mitmproxy stopped (PID: {})", pid),
            StopOutcome::TerminatedExternal(report) => write!(
                f,
                "mitmproxy stopped ({} external process(es))",
                report.killed.len()
            ),
        }
    }
}

/// Owns the lifecycle of the external mitmproxy process
pub struct ProcessSupervisor {
    bindings: ProxyBindings,
    executables: ProxyExecutables,
    confdir: PathBuf,
    search_path: Option<OsString>,
    logs: LogDirectory,
    table: Arc<dyn ProcessTable>,
    handle: Option<ProcessHandle>,
    current_log: Option<PathBuf>,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
    exit_rx: mpsc::UnboundedReceiver<ExitNotice>,
}

impl ProcessSupervisor {
    pub fn new(config: &ControllerConfig, table: Arc<dyn ProcessTable>) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        ProcessSupervisor {
            bindings: config.bindings.clone(),
            executables: config.executables.clone(),
            confdir: config.mitm_home.clone(),
            search_path: None,
            logs: LogDirectory::new(config.logs_dir(), config.max_log_files),
            table,
            handle: None,
            current_log: None,
            exit_tx,
            exit_rx,
        }
    }

    /// Look up executables in `search_path` instead of `PATH`
    pub fn with_search_path(mut self, search_path: impl Into<OsString>) -> Self {
        self.search_path = Some(search_path.into());
        self
    }

    pub fn handle(&self) -> Option<&ProcessHandle> {
        self.handle.as_ref()
    }

    pub fn current_log_path(&self) -> Option<&Path> {
        self.current_log.as_deref()
    }

    pub fn logs_dir(&self) -> &Path {
        self.logs.path()
    }

    /// Apply exit reports from watcher tasks
    ///
    /// A report only clears the handle it belongs to; a late report for an
    /// earlier run is ignored.
    pub fn drain_exits(&mut self) -> Vec<ExitNotice> {
        let mut notices = Vec::new();
        while let Ok(notice) = self.exit_rx.try_recv() {
            let owned = matches!(&self.handle, Some(handle) if handle.pid == notice.pid);
            if owned {
                match notice.status {
                    Some(status) => info!("mitmproxy (PID {}) exited: {}", notice.pid, status),
                    None => info!("mitmproxy (PID {}) exited", notice.pid),
                }
                self.handle = None;
            } else {
                debug!("Ignoring exit of earlier process {}", notice.pid);
            }
            notices.push(notice);
        }
        notices
    }

    /// Re-probe the owned handle, dropping it if the process is gone
    fn owned_process_alive(&mut self) -> bool {
        self.drain_exits();

        let pid = match &self.handle {
            Some(handle) => handle.pid,
            None => return false,
        };

        if self.table.is_alive(pid) {
            true
        } else {
            debug!("Clearing stale handle for PID {}", pid);
            self.handle = None;
            false
        }
    }

    /// True if our own process is alive or any mitmproxy runs on the system
    pub fn is_running(&mut self) -> bool {
        if self.owned_process_alive() {
            return true;
        }
        !self.table.find_by_image(&self.executables.images).is_empty()
    }

    /// The web UI is reachable only when we launched mitmweb and it still runs
    pub fn is_web_ui_available(&mut self) -> bool {
        let is_web = matches!(&self.handle, Some(h) if h.variant == ProxyVariant::Web);
        is_web && self.owned_process_alive()
    }

    fn variant_name(&self, variant: ProxyVariant) -> &str {
        match variant {
            ProxyVariant::Web => &self.executables.web,
            ProxyVariant::Headless => &self.executables.headless,
        }
    }

    fn lookup(&self, name: &str) -> Option<PathBuf> {
        let found = match &self.search_path {
            Some(paths) => {
                let cwd = std::env::current_dir().unwrap_or_default();
                which::which_in(name, Some(paths), cwd)
            }
            None => which::which(name),
        };
        found.ok()
    }

    /// Prefer the web-capable executable when it is installed
    fn resolve_program(&self) -> (ProxyVariant, PathBuf) {
        if let Some(path) = self.lookup(&self.executables.web) {
            return (ProxyVariant::Web, path);
        }
        match self.lookup(&self.executables.headless) {
            Some(path) => (ProxyVariant::Headless, path),
            // Let the spawn report the missing executable
            None => (
                ProxyVariant::Headless,
                PathBuf::from(&self.executables.headless),
            ),
        }
    }

    /// Launch mitmproxy with the selected profile
    ///
    /// Returns once the OS has accepted the spawn; readiness is not awaited.
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, profiles: &ProfileStore) -> Result<String> {
        if self.owned_process_alive() {
            return Err(ControllerError::AlreadyRunning);
        }

        self.logs
            .ensure()
            .map_err(|source| ControllerError::LogDirectory {
                path: self.logs.path().to_path_buf(),
                source,
            })?;

        match self.logs.prune() {
            Ok(removed) if !removed.is_empty() => {
                info!("Removed {} old flow log(s)", removed.len())
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to prune flow logs: {}", e),
        }

        let log_path = self.logs.next_log_path();

        let profile = profiles.selected().ok_or(ControllerError::NoActiveProfile)?;

        let (variant, program) = self.resolve_program();
        let args = build_proxy_args(variant, &log_path, profile, &self.bindings, &self.confdir)?;
        let program_name = self.variant_name(variant).to_string();

        debug!("Launching {} {:?}", program.display(), args);

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        detach_from_controller(&mut command);

        let child = command.spawn().map_err(|source| ControllerError::Spawn {
            program: program_name.clone(),
            source,
        })?;

        let pid = child.id().ok_or_else(|| ControllerError::Spawn {
            program: program_name.clone(),
            source: io::Error::new(io::ErrorKind::Other, "process exited before it was tracked"),
        })?;

        let (kill_tx, kill_rx) = oneshot::channel();
        spawn_exit_watcher(child, pid, kill_rx, self.exit_tx.clone());

        info!(
            "Started {} (PID {}) with profile {}, writing flows to {}",
            program_name,
            pid,
            profile.id,
            log_path.display()
        );

        self.current_log = Some(log_path.clone());
        self.handle = Some(ProcessHandle {
            pid,
            log_path,
            variant,
            kill_tx: Some(kill_tx),
        });

        Ok(format!(
            "{} started (PID: {}) | profile: {}",
            program_name, pid, profile.name
        ))
    }

    /// Stop mitmproxy
    ///
    /// Without an owned handle (e.g. the controller restarted while the
    /// proxy kept running) every process matching a proxy image is killed.
    pub fn stop(&mut self) -> Result<StopOutcome> {
        self.drain_exits();

        if let Some(mut handle) = self.handle.take() {
            // A closed channel means the watcher already reaped the process
            if let Some(kill_tx) = handle.kill_tx.take().filter(|tx| !tx.is_closed()) {
                // Signal now: the runtime may shut down before the watcher runs
                let signalled = self.table.kill(handle.pid);
                let requested = kill_tx.send(()).is_ok();
                if signalled || requested {
                    if !signalled {
                        debug!("PID {} could not be signalled directly", handle.pid);
                    }
                    info!("Stopping mitmproxy (PID {})", handle.pid);
                    return Ok(StopOutcome::Stopped { pid: handle.pid });
                }
            }
            debug!("Watcher for PID {} already finished", handle.pid);
        }

        let report = self.table.terminate_by_image(&self.executables.images);
        for failed in &report.failed {
            warn!("Failed to kill {} (PID {})", failed.name, failed.pid);
        }

        if report.any_killed() {
            info!("Killed {} external mitmproxy process(es)", report.killed.len());
            Ok(StopOutcome::TerminatedExternal(report))
        } else if !report.failed.is_empty() {
            let pids: Vec<String> = report.failed.iter().map(|p| p.pid.to_string()).collect();
            Err(ControllerError::Terminate(format!(
                "could not kill PID(s) {}",
                pids.join(", ")
            )))
        } else {
            Err(ControllerError::NoProcess)
        }
    }

    /// Block until every process a stop signalled is gone, at most `timeout`
    ///
    /// Lets a restart reuse the listener ports. Returns false on timeout.
    pub fn wait_for_stopped(&self, outcome: &StopOutcome, timeout: Duration) -> bool {
        let pids: Vec<u32> = match outcome {
            StopOutcome::Stopped { pid } => vec![*pid],
            StopOutcome::TerminatedExternal(report) => {
                report.killed.iter().map(|p| p.pid).collect()
            }
        };

        let deadline = Instant::now() + timeout;
        loop {
            if pids.iter().all(|pid| !self.table.is_alive(*pid)) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

/// Build mitmproxy's argument vector
///
/// The order is fixed: listener bindings and confdir, web UI bindings for
/// mitmweb, mode, scripts in declared order, remaining options sorted by
/// key, and the flow log last.
pub fn build_proxy_args(
    variant: ProxyVariant,
    log_path: &Path,
    profile: &ServiceProfile,
    bindings: &ProxyBindings,
    confdir: &Path,
) -> Result<Vec<String>> {
    let mut args: Vec<String> = vec![
        "--set".to_string(),
        format!("listen_host={}", bindings.host),
        "--set".to_string(),
        format!("listen_port={}", bindings.proxy_port),
        "--set".to_string(),
        format!("{}={}", CONFDIR_OPTION, confdir.display()),
    ];

    if variant == ProxyVariant::Web {
        args.extend([
            "--set".to_string(),
            format!("web_host={}", bindings.host),
            "--set".to_string(),
            format!("web_port={}", bindings.web_port),
            "--set".to_string(),
            format!("web_password={}", bindings.web_password),
            "--no-web-open-browser".to_string(),
        ]);
    }

    if let Some(mode) = &profile.mode {
        args.push("--mode".to_string());
        args.push(mode.clone());
    }

    // Scripts may have vanished since the profile was loaded
    for script_path in &profile.script_paths {
        if !script_path.exists() {
            return Err(ControllerError::MissingScript {
                profile: profile.name.clone(),
                path: script_path.clone(),
            });
        }
        args.push("-s".to_string());
        args.push(script_path.display().to_string());
    }

    let mut keys: Vec<&String> = profile.set_options.keys().collect();
    keys.sort();
    for key in keys {
        if key.trim().eq_ignore_ascii_case(CONFDIR_OPTION) {
            continue;
        }
        args.push("--set".to_string());
        args.push(format!("{}={}", key, profile.set_options[key]));
    }

    args.push("-w".to_string());
    args.push(log_path.display().to_string());

    Ok(args)
}

/// Keep Ctrl-C in the controller's terminal from reaching mitmproxy
#[cfg(unix)]
fn detach_from_controller(command: &mut Command) {
    command.process_group(0);
}

#[cfg(windows)]
fn detach_from_controller(command: &mut Command) {
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn detach_from_controller(_command: &mut Command) {}

/// Wait for `child` to exit, killing it first if asked to, then report back
///
/// A dropped kill sender is not a kill request: the proxy outlives the
/// controller.
fn spawn_exit_watcher(
    mut child: Child,
    pid: u32,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
) {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            requested = &mut kill_rx => {
                if requested.is_ok() {
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill mitmproxy (PID {}): {}", pid, e);
                    }
                }
                child.wait().await
            }
        };

        let status = match status {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("Failed to wait for mitmproxy (PID {}): {}", pid, e);
                None
            }
        };

        // The supervisor may already be gone
        let _ = exit_tx.send(ExitNotice { pid, status });
    });
}

// Serializes writing fake executables and spawning them, across test modules
#[cfg(test)]
pub(crate) static SPAWN_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
