use std::fmt;

/// Overall state re-derived from the supervisor, the profile store and the
/// OS collaborators on every poll and after every action
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub running: bool,
    pub proxy_enabled: bool,
    pub profile_id: String,
    pub profile_name: String,
    pub proxy_compatible: bool,
    pub web_ui_compatible: bool,
    pub web_ui_available: bool,
    pub warning_count: usize,
    pub load_warning_count: usize,
    pub cert_installed: bool,
    pub cert_trusted: bool,
}

/// What the certificate action currently does
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertificateAction {
    Install,
    Trust,
    /// Nothing left to do
    Trusted,
}

impl CertificateAction {
    pub fn label(&self) -> &'static str {
        match self {
            CertificateAction::Install => "Install CA Certificate",
            CertificateAction::Trust => "Trust CA Certificate",
            CertificateAction::Trusted => "CA Certificate ✓ Trusted",
        }
    }
}

/// Which user actions make sense in the current state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActionAvailability {
    pub start: bool,
    pub stop: bool,
    pub enable_proxy: bool,
    pub disable_proxy: bool,
    pub view_flows: bool,
    pub certificate: CertificateAction,
    pub install_certificate: bool,
    pub remove_certificate: bool,
}

impl StatusReport {
    /// One-glyph summary of process and proxy state
    pub fn indicator(&self) -> &'static str {
        match (self.running, self.proxy_enabled) {
            (true, true) => "🟢",
            (true, false) => "🟡",
            (false, true) => "🟠",
            (false, false) => "⚫",
        }
    }

    pub fn certificate_action(&self) -> CertificateAction {
        if self.cert_trusted {
            CertificateAction::Trusted
        } else if self.cert_installed {
            CertificateAction::Trust
        } else {
            CertificateAction::Install
        }
    }

    pub fn actions(&self) -> ActionAvailability {
        let certificate = self.certificate_action();
        ActionAvailability {
            start: !self.running,
            stop: self.running,
            enable_proxy: self.proxy_compatible && !self.proxy_enabled,
            disable_proxy: self.proxy_compatible && self.proxy_enabled,
            view_flows: self.web_ui_available && self.web_ui_compatible,
            certificate,
            install_certificate: certificate != CertificateAction::Trusted,
            remove_certificate: self.cert_installed || self.cert_trusted,
        }
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mitmproxy: {} | Proxy: {} | Profile: {}",
            if self.running { "Running" } else { "Stopped" },
            if self.proxy_enabled { "Enabled" } else { "Disabled" },
            self.profile_name
        )?;
        if self.warning_count > 0 {
            write!(f, " | Warnings: {}", self.warning_count)?;
        }
        if self.load_warning_count > 0 {
            write!(f, " | Profile load warnings: {}", self.load_warning_count)?;
        }
        Ok(())
    }
}
