//! OS integrations the controller calls but does not own
//!
//! Each capability is a small trait; the implementation is picked at build
//! time. Platforms without an implementation get [`Unsupported`], which
//! reports every query as "off" and refuses every change.

use crate::config::ProxyBindings;
use anyhow::{anyhow, Result};
use std::path::Path;

#[cfg(target_os = "macos")]
mod macos;
mod parse;
#[cfg(windows)]
mod windows;

/// System-wide HTTP(S) proxy setting
pub trait SystemProxy: Send {
    fn enable(&self) -> Result<()>;
    fn disable(&self) -> Result<()>;
    fn is_enabled(&self) -> bool;
}

/// OS trust store holding mitmproxy's CA certificate
///
/// Mutating calls return a message for the user on success.
pub trait CertificateStore: Send {
    fn is_installed(&self) -> bool;
    fn is_trusted(&self) -> bool;
    fn install(&self) -> Result<String>;
    fn trust(&self) -> Result<String>;
    fn remove(&self) -> Result<String>;
}

/// Fallback for platforms without a native integration
#[derive(Debug, Default)]
pub struct Unsupported;

impl SystemProxy for Unsupported {
    fn enable(&self) -> Result<()> {
        Err(anyhow!("System proxy control is not supported on this platform"))
    }

    fn disable(&self) -> Result<()> {
        Err(anyhow!("System proxy control is not supported on this platform"))
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

impl CertificateStore for Unsupported {
    fn is_installed(&self) -> bool {
        false
    }

    fn is_trusted(&self) -> bool {
        false
    }

    fn install(&self) -> Result<String> {
        Err(anyhow!("Certificate management is not supported on this platform"))
    }

    fn trust(&self) -> Result<String> {
        self.install()
    }

    fn remove(&self) -> Result<String> {
        Err(anyhow!("Certificate management is not supported on this platform"))
    }
}

/// System proxy integration for the current platform
#[cfg(target_os = "macos")]
pub fn system_proxy(bindings: &ProxyBindings) -> Box<dyn SystemProxy> {
    Box::new(macos::NetworkSetupProxy::new(bindings))
}

#[cfg(windows)]
pub fn system_proxy(bindings: &ProxyBindings) -> Box<dyn SystemProxy> {
    Box::new(windows::RegistryProxy::new(bindings))
}

#[cfg(not(any(target_os = "macos", windows)))]
pub fn system_proxy(_bindings: &ProxyBindings) -> Box<dyn SystemProxy> {
    Box::new(Unsupported)
}

/// Certificate store integration for the current platform
#[cfg(target_os = "macos")]
pub fn certificate_store(mitm_home: &Path) -> Box<dyn CertificateStore> {
    Box::new(macos::KeychainStore::new(mitm_home))
}

#[cfg(windows)]
pub fn certificate_store(mitm_home: &Path) -> Box<dyn CertificateStore> {
    Box::new(windows::CertutilStore::new(mitm_home))
}

#[cfg(not(any(target_os = "macos", windows)))]
pub fn certificate_store(_mitm_home: &Path) -> Box<dyn CertificateStore> {
    Box::new(Unsupported)
}

/// Run a command to completion and return its stdout
#[cfg(any(target_os = "macos", windows))]
fn run_command(program: &str, args: &[&str]) -> Result<String> {
    use anyhow::{bail, Context};

    let output = std::process::Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("failed to run {}", program))?;

    if !output.status.success() {
        bail!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
