use super::{parse, run_command, CertificateStore, SystemProxy};
use crate::config::ProxyBindings;
use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;
use ::windows::Win32::Networking::WinInet::{
    InternetSetOptionW, INTERNET_OPTION_REFRESH, INTERNET_OPTION_SETTINGS_CHANGED,
};

const INTERNET_SETTINGS_KEY: &str =
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

/// Per-user WinInet proxy in the registry
pub struct RegistryProxy {
    server: String,
}

impl RegistryProxy {
    pub fn new(bindings: &ProxyBindings) -> Self {
        RegistryProxy {
            server: format!("{}:{}", bindings.host, bindings.proxy_port),
        }
    }

    fn set_value(name: &str, kind: &str, data: &str) -> Result<()> {
        run_command(
            "reg",
            &["add", INTERNET_SETTINGS_KEY, "/v", name, "/t", kind, "/d", data, "/f"],
        )?;
        Ok(())
    }
}

/// Tell running applications to re-read the proxy settings
fn notify_proxy_change() {
    // SAFETY: both options take no buffer and a null handle means "global"
    unsafe {
        let _ = InternetSetOptionW(None, INTERNET_OPTION_SETTINGS_CHANGED, None, 0);
        let _ = InternetSetOptionW(None, INTERNET_OPTION_REFRESH, None, 0);
    }
}

impl SystemProxy for RegistryProxy {
    fn enable(&self) -> Result<()> {
        Self::set_value("ProxyEnable", "REG_DWORD", "1").context("Failed to enable proxy")?;
        Self::set_value("ProxyServer", "REG_SZ", &self.server)
            .context("Failed to set proxy server")?;
        notify_proxy_change();
        Ok(())
    }

    fn disable(&self) -> Result<()> {
        Self::set_value("ProxyEnable", "REG_DWORD", "0").context("Failed to disable proxy")?;
        notify_proxy_change();
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        run_command("reg", &["query", INTERNET_SETTINGS_KEY, "/v", "ProxyEnable"])
            .map(|output| parse::registry_proxy_enabled(&output))
            .unwrap_or(false)
    }
}

/// mitmproxy CA in the current user's Root store
pub struct CertutilStore {
    cert_path: PathBuf,
}

impl CertutilStore {
    pub fn new(mitm_home: &Path) -> Self {
        CertutilStore {
            cert_path: mitm_home.join("mitmproxy-ca-cert.cer"),
        }
    }

    fn cert_path_str(&self) -> Result<&str> {
        self.cert_path
            .to_str()
            .ok_or_else(|| anyhow!("Invalid certificate path {}", self.cert_path.display()))
    }

    fn thumbprint(&self) -> Option<String> {
        if !self.cert_path.exists() {
            return None;
        }
        let path = self.cert_path_str().ok()?;
        match run_command("certutil", &["-hashfile", path, "SHA1"]) {
            Ok(output) => parse::certutil_hashfile_thumbprint(&output),
            Err(e) => {
                debug!("certutil -hashfile failed: {}", e);
                None
            }
        }
    }
}

impl CertificateStore for CertutilStore {
    fn is_installed(&self) -> bool {
        let thumbprint = match self.thumbprint() {
            Some(thumbprint) => thumbprint,
            None => return false,
        };

        run_command("certutil", &["-store", "-user", "Root"])
            .map(|output| parse::store_thumbprints(&output).contains(&thumbprint))
            .unwrap_or(false)
    }

    fn is_trusted(&self) -> bool {
        // The Root store is the trust anchor list
        self.is_installed()
    }

    fn install(&self) -> Result<String> {
        if !self.cert_path.exists() {
            bail!("CA cert not found. Start mitmproxy first to generate it.");
        }
        if self.is_installed() {
            return Ok("CA certificate is already installed".to_string());
        }

        run_command("certutil", &["-addstore", "-user", "Root", self.cert_path_str()?])
            .context("Failed to install certificate")?;
        Ok("CA certificate installed successfully. Restart your browser.".to_string())
    }

    fn trust(&self) -> Result<String> {
        self.install()
    }

    fn remove(&self) -> Result<String> {
        let thumbprint = self
            .thumbprint()
            .ok_or_else(|| anyhow!("CA cert file not found"))?;
        if !self.is_installed() {
            bail!("CA certificate is not installed");
        }

        run_command("certutil", &["-delstore", "-user", "Root", &thumbprint])
            .context("Failed to remove certificate")?;
        Ok("CA certificate removed. Restart your browser.".to_string())
    }
}
