use super::{parse, run_command, CertificateStore, SystemProxy};
use crate::config::ProxyBindings;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

const FALLBACK_SERVICE: &str = "Wi-Fi";
const SYSTEM_KEYCHAIN: &str = "/Library/Keychains/System.keychain";
const CERT_COMMON_NAME: &str = "mitmproxy";

/// Proxy settings of the active network service via `networksetup`
pub struct NetworkSetupProxy {
    host: String,
    port: String,
}

impl NetworkSetupProxy {
    pub fn new(bindings: &ProxyBindings) -> Self {
        NetworkSetupProxy {
            host: bindings.host.clone(),
            port: bindings.proxy_port.to_string(),
        }
    }

    /// Network service behind the default route, "Wi-Fi" when unknown
    fn active_service(&self) -> String {
        let device = match run_command("route", &["-n", "get", "default"]) {
            Ok(output) => parse::default_route_interface(&output),
            Err(e) => {
                debug!("No default route: {}", e);
                None
            }
        };

        let service = device.and_then(|device| {
            run_command("networksetup", &["-listallhardwareports"])
                .ok()
                .and_then(|ports| parse::hardware_port_for_device(&ports, &device))
        });

        service.unwrap_or_else(|| FALLBACK_SERVICE.to_string())
    }

    fn set_state(&self, service: &str, state: &str) {
        for flag in ["-setwebproxystate", "-setsecurewebproxystate"] {
            if let Err(e) = run_command("networksetup", &[flag, service, state]) {
                warn!("networksetup {} {} failed: {}", flag, state, e);
            }
        }
    }
}

impl SystemProxy for NetworkSetupProxy {
    fn enable(&self) -> Result<()> {
        let service = self.active_service();

        run_command("networksetup", &["-setwebproxy", &service, &self.host, &self.port])
            .context("Failed to set HTTP proxy")?;
        run_command(
            "networksetup",
            &["-setsecurewebproxy", &service, &self.host, &self.port],
        )
        .context("Failed to set HTTPS proxy")?;

        self.set_state(&service, "on");
        Ok(())
    }

    fn disable(&self) -> Result<()> {
        let service = self.active_service();
        self.set_state(&service, "off");
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        let service = self.active_service();
        run_command("networksetup", &["-getwebproxy", &service])
            .map(|output| parse::web_proxy_enabled(&output))
            .unwrap_or(false)
    }
}

/// mitmproxy CA in the System keychain
pub struct KeychainStore {
    cert_path: PathBuf,
}

impl KeychainStore {
    pub fn new(mitm_home: &Path) -> Self {
        KeychainStore {
            cert_path: mitm_home.join("mitmproxy-ca-cert.pem"),
        }
    }

    fn run_privileged(&self, shell_script: &str) -> Result<()> {
        let script = format!(
            "do shell script \"{}\" with administrator privileges",
            shell_script
        );
        run_command("osascript", &["-e", &script])?;
        Ok(())
    }
}

impl CertificateStore for KeychainStore {
    fn is_installed(&self) -> bool {
        let found = |args: &[&str]| {
            run_command("security", args)
                .map(|out| !out.trim().is_empty())
                .unwrap_or(false)
        };

        found(&["find-certificate", "-c", CERT_COMMON_NAME, SYSTEM_KEYCHAIN])
            || found(&["find-certificate", "-c", CERT_COMMON_NAME])
    }

    fn is_trusted(&self) -> bool {
        let pem = match run_command(
            "security",
            &["find-certificate", "-c", CERT_COMMON_NAME, "-p", SYSTEM_KEYCHAIN],
        ) {
            Ok(pem) if !pem.trim().is_empty() => pem,
            _ => return false,
        };

        let tmp = std::env::temp_dir().join(format!("mitmproxy-cert-{}.pem", std::process::id()));
        if let Err(e) = fs::write(&tmp, pem) {
            warn!("Failed to write {}: {}", tmp.display(), e);
            return false;
        }

        let trusted = Command::new("security")
            .arg("verify-cert")
            .arg("-c")
            .arg(&tmp)
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false);

        let _ = fs::remove_file(&tmp);
        trusted
    }

    fn install(&self) -> Result<String> {
        if !self.cert_path.exists() {
            bail!("CA cert not found. Start mitmproxy first to generate it.");
        }

        let cert = self.cert_path.display();
        let script = format!(
            "while security delete-certificate -c {name} {keychain} 2>/dev/null; do :; done; \
             security import '{cert}' -k {keychain} -t cert; \
             security add-trusted-cert -d -r trustRoot -k {keychain} '{cert}'; \
             killall -HUP trustd 2>/dev/null || true",
            name = CERT_COMMON_NAME,
            keychain = SYSTEM_KEYCHAIN,
            cert = cert,
        );

        self.run_privileged(&script)
            .context("Failed to install certificate")?;
        Ok("CA certificate installed & trusted. Restart your browser.".to_string())
    }

    fn trust(&self) -> Result<String> {
        // Reimporting sets the trust settings as well
        self.install()
    }

    fn remove(&self) -> Result<String> {
        if !self.is_installed() {
            bail!("CA certificate is not installed");
        }

        let script = format!(
            "while security delete-certificate -c {name} {keychain} 2>/dev/null; do :; done; \
             killall -HUP trustd 2>/dev/null || true",
            name = CERT_COMMON_NAME,
            keychain = SYSTEM_KEYCHAIN,
        );

        self.run_privileged(&script)
            .context("Failed to remove certificate")?;
        Ok("CA certificate removed. Restart your browser.".to_string())
    }
}
