use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use tracing::debug;

/// Persisted record of which service profile is active
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectionState {
    #[serde(default)]
    pub selected_profile_id: String,
}

impl SelectionState {
    pub fn new(profile_id: impl Into<String>) -> Self {
        SelectionState {
            selected_profile_id: profile_id.into(),
        }
    }
}

/// Load the selection state from `path`
/// A missing or malformed file means "no prior selection"
pub fn load_selection(path: &Path) -> Option<SelectionState> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            debug!("No selection state at {}: {}", path.display(), e);
            return None;
        }
    };

    match serde_json::from_str(&contents) {
        Ok(state) => Some(state),
        Err(e) => {
            debug!("Ignoring malformed selection state {}: {}", path.display(), e);
            None
        }
    }
}

/// Save the selection state to `path`, replacing any previous contents
/// Creates the parent directory if it doesn't exist
pub fn save_selection(path: &Path, state: &SelectionState) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Serialize to pretty-printed JSON
    let json = serde_json::to_string_pretty(state)?;

    fs::write(path, json)
}
