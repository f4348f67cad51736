use crate::config::{ControllerConfig, STOP_TIMEOUT};
use crate::console::HELP;
use crate::error::{ControllerError, Result};
use crate::ipc::{ControlCommand, Reply};
use crate::platform::{CertificateStore, SystemProxy};
use crate::profile::{sanitize_profile_id, ProfileStore};
use crate::status::{CertificateAction, StatusReport};
use crate::supervisor::{ProcessSupervisor, ProxyVariant};
use std::fmt::Write as _;
use tracing::{info, warn};

/// Controller state: every command and every poll tick goes through here
pub struct Controller {
    config: ControllerConfig,
    profiles: ProfileStore,
    supervisor: ProcessSupervisor,
    proxy: Box<dyn SystemProxy>,
    certs: Box<dyn CertificateStore>,
    last_status: Option<StatusReport>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        supervisor: ProcessSupervisor,
        proxy: Box<dyn SystemProxy>,
        certs: Box<dyn CertificateStore>,
    ) -> Self {
        let profiles = ProfileStore::new(
            config.profiles_dir(),
            config.state_path(),
            config.bindings.clone(),
        );

        Controller {
            config,
            profiles,
            supervisor,
            proxy,
            certs,
            last_status: None,
        }
    }

    /// Load profiles and restore the persisted selection
    pub fn init(&mut self) -> Result<()> {
        self.profiles.init()
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    /// Apply one user command
    ///
    /// Must be called from within a tokio runtime.
    pub fn handle(&mut self, command: ControlCommand) -> Reply {
        info!("Handling command {:?}", command);

        let message = match command {
            ControlCommand::Start => self.start(),
            ControlCommand::Stop => self.stop(),
            ControlCommand::Select(id) => self.select(&id),
            ControlCommand::Reload => self.reload(),
            ControlCommand::Status => self.status_summary(),
            ControlCommand::EnableProxy => self.set_proxy(true),
            ControlCommand::DisableProxy => self.set_proxy(false),
            ControlCommand::InstallCert => self.install_certificate(),
            ControlCommand::RemoveCert => self.remove_certificate(),
            ControlCommand::Profiles => self.profile_listing(),
            ControlCommand::Paths => self.paths(),
            ControlCommand::Help => HELP.to_string(),
            ControlCommand::Quit => {
                let message = if self.supervisor.is_running() {
                    "Exiting; mitmproxy keeps running"
                } else {
                    "Exiting"
                };
                return Reply::quit(message);
            }
        };

        // Actions change state; keep the poll from re-announcing it
        self.status();
        Reply::new(message)
    }

    /// Start mitmproxy with a freshly loaded copy of the selected profile
    pub fn start(&mut self) -> String {
        if let Err(e) = self.profiles.reload() {
            return format!("Failed to load profiles: {}", e);
        }

        match self.supervisor.start(&self.profiles) {
            Ok(message) => message,
            Err(e) => {
                warn!("{}", e);
                e.to_string()
            }
        }
    }

    pub fn stop(&mut self) -> String {
        match self.supervisor.stop() {
            Ok(outcome) => outcome.to_string(),
            Err(e) => e.to_string(),
        }
    }

    /// Switch profiles, restarting mitmproxy when it is running
    pub fn select(&mut self, profile_id: &str) -> String {
        if sanitize_profile_id(profile_id) == self.profiles.selected_id() {
            return format!(
                "Service profile already selected: {}",
                self.profiles.selected_name()
            );
        }

        let mut note = String::new();
        match self.profiles.select(profile_id) {
            Ok(()) => {}
            // The selection still changed in memory
            Err(e @ ControllerError::Persist { .. }) => {
                warn!("{}", e);
                note = format!(" [{}]", e);
            }
            Err(e) => return format!("Failed to select profile: {}", e),
        }

        let name = self.profiles.selected_name();
        info!("Selected profile {}", self.profiles.selected_id());

        if self.supervisor.is_running() {
            let stopped = match self.supervisor.stop() {
                Ok(outcome) => {
                    if !self.supervisor.wait_for_stopped(&outcome, STOP_TIMEOUT) {
                        warn!("Old mitmproxy still running after {:?}", STOP_TIMEOUT);
                    }
                    outcome.to_string()
                }
                Err(e) => e.to_string(),
            };
            let started = self.start();
            return format!("Profile {} applied ({}, {}){}", name, stopped, started, note);
        }

        format!("Selected profile: {}{}", name, note)
    }

    pub fn reload(&mut self) -> String {
        match self.profiles.reload() {
            Ok(snapshot) => {
                let mut message = format!("Loaded {} profile(s)", snapshot.profiles.len());
                if !snapshot.load_warnings.is_empty() {
                    let _ = write!(message, " ({} load warning(s))", snapshot.load_warnings.len());
                }
                message
            }
            Err(e) => format!("Failed to refresh profiles: {}", e),
        }
    }

    /// Re-derive the overall state from all sources
    pub fn status(&mut self) -> StatusReport {
        let (proxy_compatible, web_ui_compatible) = self.profiles.selected_compatibility();

        let report = StatusReport {
            running: self.supervisor.is_running(),
            proxy_enabled: self.proxy.is_enabled(),
            profile_id: self.profiles.selected_id().to_string(),
            profile_name: self.profiles.selected_name(),
            proxy_compatible,
            web_ui_compatible,
            web_ui_available: self.supervisor.is_web_ui_available(),
            warning_count: self.profiles.selected_warnings().len(),
            load_warning_count: self.profiles.load_warnings().len(),
            cert_installed: self.certs.is_installed(),
            cert_trusted: self.certs.is_trusted(),
        };

        self.last_status = Some(report.clone());
        report
    }

    /// Periodic reconciliation; returns the new report only when it changed
    pub fn poll(&mut self) -> Option<StatusReport> {
        let previous = self.last_status.take();
        let report = self.status();
        if previous.as_ref() == Some(&report) {
            None
        } else {
            Some(report)
        }
    }

    fn status_summary(&mut self) -> String {
        let report = self.status();
        let actions = report.actions();

        let mut available = Vec::new();
        if actions.start {
            available.push("start");
        }
        if actions.stop {
            available.push("stop");
        }
        if actions.enable_proxy {
            available.push("proxy on");
        }
        if actions.disable_proxy {
            available.push("proxy off");
        }
        if actions.install_certificate {
            available.push("cert install");
        }
        if actions.remove_certificate {
            available.push("cert remove");
        }

        let mut summary = format!("{} {}", report.indicator(), report);
        if let Some(handle) = self.supervisor.handle() {
            let variant = match handle.variant {
                ProxyVariant::Web => "mitmweb",
                ProxyVariant::Headless => "mitmdump",
            };
            let _ = write!(
                summary,
                "\nProcess: {} (PID: {}) writing {}",
                variant,
                handle.pid,
                handle.log_path.display()
            );
        }
        let _ = write!(summary, "\nCertificate: {}", actions.certificate.label());
        if actions.view_flows {
            let _ = write!(summary, "\nFlows: {}", self.config.bindings.web_ui_url());
        }
        for warning in self.profiles.selected_warnings() {
            let _ = write!(summary, "\nWarning: {}", warning);
        }
        for warning in self.profiles.load_warnings() {
            let _ = write!(summary, "\nLoad warning: {}", warning);
        }
        let _ = write!(summary, "\nAvailable: {}", available.join(", "));
        summary
    }

    /// Toggle the system proxy, refused when the profile moves the listener
    pub fn set_proxy(&mut self, enable: bool) -> String {
        let (proxy_compatible, _) = self.profiles.selected_compatibility();
        if !proxy_compatible {
            return format!(
                "Proxy actions disabled: profile {} overrides listen_host/listen_port",
                self.profiles.selected_name()
            );
        }

        if enable {
            match self.proxy.enable() {
                Ok(()) => "Proxy enabled".to_string(),
                Err(e) => format!("Failed to enable proxy: {:#}", e),
            }
        } else {
            match self.proxy.disable() {
                Ok(()) => "Proxy disabled".to_string(),
                Err(e) => format!("Failed to disable proxy: {:#}", e),
            }
        }
    }

    /// Install the CA certificate, or trust it if it is installed already
    pub fn install_certificate(&mut self) -> String {
        let action = StatusReport {
            cert_installed: self.certs.is_installed(),
            cert_trusted: self.certs.is_trusted(),
            ..Default::default()
        }
        .certificate_action();

        let result = match action {
            CertificateAction::Trusted => return "CA certificate is already trusted".to_string(),
            CertificateAction::Trust => self.certs.trust(),
            CertificateAction::Install => self.certs.install(),
        };

        result.unwrap_or_else(|e| format!("{:#}", e))
    }

    pub fn remove_certificate(&mut self) -> String {
        self.certs.remove().unwrap_or_else(|e| format!("{:#}", e))
    }

    pub fn profile_listing(&self) -> String {
        let snapshot = self.profiles.snapshot();
        let mut listing = format!("Service profiles ({}):", snapshot.profiles.len());

        for profile in &snapshot.profiles {
            let marker = if profile.id == self.profiles.selected_id() {
                '*'
            } else {
                ' '
            };
            let _ = write!(listing, "\n{} {} ({})", marker, profile.id, profile.name);
            if !profile.proxy_compatible {
                listing.push_str(" [proxy incompatible]");
            }
            if !profile.web_ui_compatible {
                listing.push_str(" [web UI incompatible]");
            }
            if !profile.warnings.is_empty() {
                let _ = write!(listing, " [{} warning(s)]", profile.warnings.len());
            }
        }

        if !snapshot.load_warnings.is_empty() {
            listing.push_str("\nLoad warnings:");
            for warning in &snapshot.load_warnings {
                let _ = write!(listing, "\n  - {}", warning);
            }
        }

        listing
    }

    /// Locations the user may want to open, created where that makes sense
    pub fn paths(&mut self) -> String {
        let mut lines = vec![format!(
            "Profiles directory: {}",
            self.profiles.profiles_dir().display()
        )];

        match self.profiles.selected() {
            Some(profile) => lines.push(format!("Active profile: {}", profile.source_path.display())),
            None => lines.push("Active profile: No active profile file found".to_string()),
        }

        match self.profiles.ensure_scripts_folder() {
            Ok(folder) => lines.push(format!("Scripts folder: {}", folder.display())),
            Err(e) => lines.push(format!("Failed to prepare scripts folder: {}", e)),
        }

        lines.push(format!("Logs directory: {}", self.supervisor.logs_dir().display()));
        match self.supervisor.current_log_path() {
            Some(path) => lines.push(format!("Current log: {}", path.display())),
            None => lines.push("Current log: none".to_string()),
        }

        match self.config.ensure_mitm_config() {
            Ok(path) => {
                if let Some(home) = path.parent() {
                    lines.push(format!("mitmproxy home: {}", home.display()));
                }
                lines.push(format!("mitmproxy config: {}", path.display()));
            }
            Err(e) => lines.push(format!("Failed to prepare config: {}", e)),
        }

        let (_, web_ui_compatible) = self.profiles.selected_compatibility();
        if web_ui_compatible && self.supervisor.is_web_ui_available() {
            lines.push(format!("Web UI: {}", self.config.bindings.web_ui_url()));
        } else {
            lines.push("Web UI: unavailable".to_string());
        }

        lines.join("\n")
    }
}
