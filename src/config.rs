use anyhow::{anyhow, Result};
use directories::{BaseDirs, ProjectDirs};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that relocates the controller data directory
pub const HOME_ENV_VAR: &str = "MITM_CONTROLLER_HOME";

/// Number of flow log files kept in the logs directory
pub const MAX_LOG_FILES: usize = 10;

/// Interval between status reconciliation ticks
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How long a restart waits for the old process to release its ports
pub const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Fixed addresses the controller relies on for proxy settings and the web UI.
///
/// Profiles may not move these; a profile that overrides them is flagged as
/// incompatible.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyBindings {
    pub host: String,
    pub proxy_port: u16,
    pub web_port: u16,
    pub web_password: String,
}

impl Default for ProxyBindings {
    fn default() -> Self {
        ProxyBindings {
            host: "127.0.0.1".to_string(),
            proxy_port: 8899,
            web_port: 8898,
            web_password: "mitmcontroller".to_string(),
        }
    }
}

impl ProxyBindings {
    /// URL of the mitmweb interface, token included
    pub fn web_ui_url(&self) -> String {
        format!(
            "http://{}:{}/?token={}",
            self.host, self.web_port, self.web_password
        )
    }
}

/// Executable names for the two supported proxy variants
#[derive(Clone, Debug)]
pub struct ProxyExecutables {
    /// Variant with a web UI, preferred when available
    pub web: String,
    /// Headless variant
    pub headless: String,
    /// Image names treated as "our" proxy when scanning the process table
    pub images: Vec<String>,
}

impl Default for ProxyExecutables {
    fn default() -> Self {
        ProxyExecutables {
            web: "mitmweb".to_string(),
            headless: "mitmdump".to_string(),
            images: vec![
                "mitmdump".to_string(),
                "mitmweb".to_string(),
                "mitmproxy".to_string(),
            ],
        }
    }
}

/// Everything the controller needs to know about where it lives
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub data_dir: PathBuf,
    pub mitm_home: PathBuf,
    pub bindings: ProxyBindings,
    pub executables: ProxyExecutables,
    pub max_log_files: usize,
    pub poll_interval: Duration,
}

impl ControllerConfig {
    /// Resolve the configuration from the user's environment
    pub fn from_environment() -> Result<Self> {
        let data_dir = match std::env::var_os(HOME_ENV_VAR) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => get_data_directory()?,
        };

        Ok(Self::with_data_dir(data_dir, get_mitm_home_directory()))
    }

    /// Build a configuration rooted at explicit directories
    pub fn with_data_dir(data_dir: PathBuf, mitm_home: PathBuf) -> Self {
        ControllerConfig {
            data_dir,
            mitm_home,
            bindings: ProxyBindings::default(),
            executables: ProxyExecutables::default(),
            max_log_files: MAX_LOG_FILES,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.data_dir.join("profiles")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// mitmproxy's own config file inside its home directory
    pub fn mitm_config_path(&self) -> PathBuf {
        self.mitm_home.join("config.yaml")
    }

    /// Create mitmproxy's home directory if needed and return its absolute path
    pub fn ensure_mitm_home(&self) -> io::Result<PathBuf> {
        let home = absolutize(&self.mitm_home);
        fs::create_dir_all(&home)?;
        Ok(home)
    }

    /// Create an empty `config.yaml` unless one exists; never truncates
    pub fn ensure_mitm_config(&self) -> io::Result<PathBuf> {
        self.ensure_mitm_home()?;
        let path = absolutize(&self.mitm_config_path());
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(path),
            Err(e) => Err(e),
        }
    }
}

/// Get the controller's data directory
/// Returns the per-user config directory, e.g. ~/.config/mitmproxy-controller on Linux
pub fn get_data_directory() -> Result<PathBuf> {
    let project_dirs = ProjectDirs::from("", "", "mitmproxy-controller")
        .ok_or_else(|| anyhow!("Failed to determine user config directory"))?;

    Ok(project_dirs.config_dir().to_path_buf())
}

/// Get mitmproxy's home directory (~/.mitmproxy)
/// Falls back to the temp directory when no home directory is known
pub fn get_mitm_home_directory() -> PathBuf {
    let home = BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .filter(|home| !home.as_os_str().is_empty())
        .unwrap_or_else(std::env::temp_dir);

    home.join(".mitmproxy")
}

/// Make `path` absolute against the current directory, leaving it untouched on failure
pub fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bindings() {
        let bindings = ProxyBindings::default();
        assert_eq!(bindings.host, "127.0.0.1");
        assert_eq!(bindings.proxy_port, 8899);
        assert_eq!(bindings.web_port, 8898);
        assert_eq!(bindings.web_password, "mitmcontroller");
    }

    #[test]
    fn test_web_ui_url() {
        let bindings = ProxyBindings::default();
        assert_eq!(
            bindings.web_ui_url(),
            "http://127.0.0.1:8898/?token=mitmcontroller"
        );
    }

    #[test]
    fn test_paths_are_rooted_in_data_dir() {
        let config = ControllerConfig::with_data_dir(
            PathBuf::from("/data/ctl"),
            PathBuf::from("/home/u/.mitmproxy"),
        );
        assert_eq!(config.profiles_dir(), PathBuf::from("/data/ctl/profiles"));
        assert_eq!(config.state_path(), PathBuf::from("/data/ctl/state.json"));
        assert_eq!(config.logs_dir(), PathBuf::from("/data/ctl/logs"));
        assert_eq!(
            config.mitm_config_path(),
            PathBuf::from("/home/u/.mitmproxy/config.yaml")
        );
        assert_eq!(config.max_log_files, 10);
    }

    #[test]
    fn test_ensure_mitm_config_keeps_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControllerConfig::with_data_dir(
            dir.path().join("data"),
            dir.path().join(".mitmproxy"),
        );

        let path = config.ensure_mitm_config().unwrap();
        assert_eq!(path, dir.path().join(".mitmproxy").join("config.yaml"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "");

        fs::write(&path, "ssl_insecure: true\n").unwrap();
        config.ensure_mitm_config().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "ssl_insecure: true\n");
    }

    #[test]
    fn test_get_data_directory() {
        if let Ok(path) = get_data_directory() {
            assert!(path.to_string_lossy().contains("mitmproxy-controller"));
        }
    }

    #[test]
    fn test_mitm_home_ends_with_dot_mitmproxy() {
        assert!(get_mitm_home_directory().ends_with(".mitmproxy"));
    }
}
