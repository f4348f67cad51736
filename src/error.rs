use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures surfaced by the profile store and the process supervisor.
///
/// None of these terminate the controller; callers turn them into a
/// status message and keep running.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// A profile file could not be turned into a usable profile
    #[error("{0}")]
    Validation(String),

    #[error("profile \"{0}\" not found")]
    ProfileNotFound(String),

    /// Neither the owned handle nor an OS-wide scan located a proxy process
    #[error("No mitmproxy process found")]
    NoProcess,

    /// Matching processes were found but none could be killed
    #[error("Failed to kill mitmproxy: {0}")]
    Terminate(String),

    #[error("mitmproxy is already running")]
    AlreadyRunning,

    #[error("No active profile found")]
    NoActiveProfile,

    #[error("profile \"{profile}\" has missing script {}", path.display())]
    MissingScript { profile: String, path: PathBuf },

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to save selection state to {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read profiles directory {}: {source}", path.display())]
    ProfileDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to create logs directory {}: {source}", path.display())]
    LogDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ControllerError>;
