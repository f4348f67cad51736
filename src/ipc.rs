/// Messages from the front end to the controller loop
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// User actions, applied in arrival order by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Start,
    Stop,
    /// Switch to the given profile id, restarting a running proxy
    Select(String),
    Reload,
    Status,
    EnableProxy,
    DisableProxy,
    /// Install the CA certificate, or trust it when already installed
    InstallCert,
    RemoveCert,
    Profiles,
    Paths,
    Help,
    Quit,
}

/// Result of one command, shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub message: String,
    /// The controller loop should exit after showing the message
    pub quit: bool,
}

impl Reply {
    pub fn new(message: impl Into<String>) -> Self {
        Reply {
            message: message.into(),
            quit: false,
        }
    }

    pub fn quit(message: impl Into<String>) -> Self {
        Reply {
            message: message.into(),
            quit: true,
        }
    }
}

/// Create the command channel between the front end and the controller
pub fn command_channel() -> (UnboundedSender<ControlCommand>, UnboundedReceiver<ControlCommand>) {
    mpsc::unbounded_channel()
}
