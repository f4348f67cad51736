use crate::config::{absolutize, ProxyBindings};
use crate::error::{ControllerError, Result};
use crate::selection::{load_selection, save_selection, SelectionState};
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reserved id of the profile that always exists
pub const DEFAULT_PROFILE_ID: &str = "default";

/// Option key owned by the controller; profiles cannot move mitmproxy's confdir
pub const CONFDIR_OPTION: &str = "confdir";

const DEFAULT_PROFILE_TEMPLATE: &str = "id: default
name: Default
scripts: []
set_options: {}
";

/// Service profile describing how mitmproxy is launched
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceProfile {
    pub id: String,
    pub name: String,
    pub scripts: Vec<String>,
    pub set_options: BTreeMap<String, String>,
    pub mode: Option<String>,
    pub source_path: PathBuf,

    // Derived at load time
    pub script_paths: Vec<PathBuf>,
    pub warnings: Vec<String>,
    pub proxy_compatible: bool,
    pub web_ui_compatible: bool,
}

/// On-disk shape of a profile file; unknown fields are ignored
#[derive(Deserialize, Default, Debug)]
#[serde(default)]
struct ProfileFile {
    id: Option<String>,
    name: Option<String>,
    scripts: Option<Vec<String>>,
    set_options: Option<BTreeMap<String, serde_yml::Value>>,
    mode: Option<String>,
}

impl ServiceProfile {
    /// Profile used when the profiles directory yields nothing usable
    pub fn fallback_default(profiles_dir: &Path, bindings: &ProxyBindings) -> Self {
        let mut profile = ServiceProfile {
            id: DEFAULT_PROFILE_ID.to_string(),
            name: "Default".to_string(),
            scripts: Vec::new(),
            set_options: BTreeMap::new(),
            mode: None,
            source_path: profiles_dir.join(format!("{}.yaml", DEFAULT_PROFILE_ID)),
            script_paths: Vec::new(),
            warnings: Vec::new(),
            proxy_compatible: true,
            web_ui_compatible: true,
        };
        profile.populate_derived_fields(bindings);
        profile
    }

    /// Resolve script paths and compute warnings and compatibility flags
    ///
    /// Scripts are resolved against the directory holding the profile file.
    /// A missing script is only a warning here; launching re-checks it.
    pub fn populate_derived_fields(&mut self, bindings: &ProxyBindings) {
        let base_dir = self
            .source_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        self.script_paths = Vec::with_capacity(self.scripts.len());
        self.warnings = Vec::new();

        for script in &self.scripts {
            let script_path = Path::new(script);
            let resolved = if script_path.is_absolute() {
                script_path.to_path_buf()
            } else {
                absolutize(&base_dir.join(script_path))
            };

            if !resolved.exists() {
                self.warnings
                    .push(format!("missing script: {}", resolved.display()));
            }
            self.script_paths.push(resolved);
        }

        let host = bindings.host.as_str();
        self.proxy_compatible = is_option_compatible(&self.set_options, "listen_host", host)
            && is_option_compatible(
                &self.set_options,
                "listen_port",
                &bindings.proxy_port.to_string(),
            );
        self.web_ui_compatible = is_option_compatible(&self.set_options, "web_host", host)
            && is_option_compatible(&self.set_options, "web_port", &bindings.web_port.to_string())
            && is_option_compatible(&self.set_options, "web_password", &bindings.web_password);

        if !self.proxy_compatible {
            self.warnings
                .push("proxy actions disabled (listen_host/listen_port override)".to_string());
        }
        if !self.web_ui_compatible {
            self.warnings
                .push("web UI action disabled (web host/port/password override)".to_string());
        }
        if self.set_options.contains_key(CONFDIR_OPTION) {
            self.warnings
                .push("confdir override ignored in profile set_options".to_string());
        }
    }
}

/// An option is compatible when it is absent or equals the controller's value
fn is_option_compatible(options: &BTreeMap<String, String>, key: &str, expected: &str) -> bool {
    match options.get(key) {
        Some(value) => value.trim() == expected,
        None => true,
    }
}

/// Normalize a raw profile id into `[a-z0-9-]*`
pub fn sanitize_profile_id(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '_' { '-' } else { c })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect()
}

/// Render a YAML option value in its canonical string form
fn option_value_to_string(value: &serde_yml::Value) -> std::result::Result<String, String> {
    match value {
        serde_yml::Value::String(s) => Ok(s.clone()),
        serde_yml::Value::Bool(b) => Ok(b.to_string()),
        // f64 Display drops a trailing ".0" and never uses exponent notation
        serde_yml::Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) => Ok(f.to_string()),
            None => Ok(n.to_string()),
        },
        serde_yml::Value::Number(n) => Ok(n.to_string()),
        serde_yml::Value::Null => Err("value is null".to_string()),
        serde_yml::Value::Sequence(_) => Err("value is a list".to_string()),
        serde_yml::Value::Mapping(_) => Err("value is a mapping".to_string()),
        _ => Err("unsupported value type".to_string()),
    }
}

/// Load and validate a single profile file
pub fn load_profile_file(path: &Path, bindings: &ProxyBindings) -> Result<ServiceProfile> {
    let contents = fs::read_to_string(path)
        .map_err(|e| ControllerError::Validation(format!("failed to read file: {}", e)))?;

    let parsed: ProfileFile = if contents.trim().is_empty() {
        ProfileFile::default()
    } else {
        serde_yml::from_str(&contents)
            .map_err(|e| ControllerError::Validation(format!("invalid YAML: {}", e)))?
    };

    // Fall back to the file name when the id is blank or sanitizes to nothing
    let mut id = sanitize_profile_id(parsed.id.as_deref().unwrap_or(""));
    if id.is_empty() {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        id = sanitize_profile_id(&stem);
    }
    if id.is_empty() {
        return Err(ControllerError::Validation(
            "profile id is empty".to_string(),
        ));
    }

    let name = match parsed.name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => id.clone(),
    };

    let scripts = parsed
        .scripts
        .unwrap_or_default()
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    let mut set_options = BTreeMap::new();
    for (key, value) in parsed.set_options.unwrap_or_default() {
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = option_value_to_string(&value).map_err(|reason| {
            ControllerError::Validation(format!("set_options.{}: {}", key, reason))
        })?;
        set_options.insert(key.to_string(), value);
    }

    let mode = parsed
        .mode
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty());

    let mut profile = ServiceProfile {
        id,
        name,
        scripts,
        set_options,
        mode,
        source_path: path.to_path_buf(),
        script_paths: Vec::new(),
        warnings: Vec::new(),
        proxy_compatible: true,
        web_ui_compatible: true,
    };
    profile.populate_derived_fields(bindings);

    Ok(profile)
}

/// Create the profiles directory and seed default.yaml if it is absent
fn ensure_profiles_directory(profiles_dir: &Path) -> io::Result<()> {
    fs::create_dir_all(profiles_dir)?;

    let default_path = profiles_dir.join(format!("{}.yaml", DEFAULT_PROFILE_ID));
    match fs::metadata(&default_path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("Seeding default profile at {}", default_path.display());
            fs::write(&default_path, DEFAULT_PROFILE_TEMPLATE)
        }
        Err(e) => Err(e),
    }
}

fn is_profile_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_lowercase();
            ext == "yaml" || ext == "yml"
        })
        .unwrap_or(false)
}

/// Default profile first, everything else by case-insensitive name
fn sort_profiles(profiles: &mut [ServiceProfile]) {
    profiles.sort_by(|a, b| {
        match (a.id == DEFAULT_PROFILE_ID, b.id == DEFAULT_PROFILE_ID) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        }
    });
}

/// Immutable result of one profile discovery pass
#[derive(Clone, Debug)]
pub struct ProfileSnapshot {
    pub profiles: Vec<ServiceProfile>,
    /// Per-file problems found while loading, as "<filename>: <reason>"
    pub load_warnings: Vec<String>,
}

impl ProfileSnapshot {
    fn fallback(profiles_dir: &Path, bindings: &ProxyBindings) -> Self {
        ProfileSnapshot {
            profiles: vec![ServiceProfile::fallback_default(profiles_dir, bindings)],
            load_warnings: Vec::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ServiceProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }
}

/// Discover every profile in `profiles_dir`
///
/// Invalid files become load warnings instead of failing the scan. Only an
/// unreadable directory is an error.
pub fn discover_profiles(profiles_dir: &Path, bindings: &ProxyBindings) -> Result<ProfileSnapshot> {
    let dir_error = |source: io::Error| ControllerError::ProfileDirectory {
        path: profiles_dir.to_path_buf(),
        source,
    };

    ensure_profiles_directory(profiles_dir).map_err(dir_error)?;

    let mut files: Vec<(String, PathBuf)> = Vec::new();
    for entry in fs::read_dir(profiles_dir).map_err(dir_error)? {
        let entry = entry.map_err(dir_error)?;
        let path = entry.path();
        if path.is_dir() || !is_profile_file(&path) {
            continue;
        }
        files.push((entry.file_name().to_string_lossy().into_owned(), path));
    }
    // read_dir order is platform-defined; duplicates resolve by file name
    files.sort();

    let mut profiles: Vec<ServiceProfile> = Vec::with_capacity(files.len());
    let mut load_warnings = Vec::new();
    let mut defined_by: HashMap<String, String> = HashMap::new();

    for (file_name, path) in files {
        match load_profile_file(&path, bindings) {
            Ok(profile) => {
                if let Some(first) = defined_by.get(&profile.id) {
                    load_warnings.push(format!(
                        "{}: duplicate profile id \"{}\" (already defined by {})",
                        file_name, profile.id, first
                    ));
                    continue;
                }
                debug!("Loaded profile {} from {}", profile.id, file_name);
                defined_by.insert(profile.id.clone(), file_name);
                profiles.push(profile);
            }
            Err(e) => {
                load_warnings.push(format!("{}: {}", file_name, e));
            }
        }
    }

    if profiles.is_empty() {
        profiles.push(ServiceProfile::fallback_default(profiles_dir, bindings));
    }

    sort_profiles(&mut profiles);

    Ok(ProfileSnapshot {
        profiles,
        load_warnings,
    })
}

/// Owns the current profile snapshot and the active selection
pub struct ProfileStore {
    profiles_dir: PathBuf,
    state_path: PathBuf,
    bindings: ProxyBindings,
    snapshot: Arc<ProfileSnapshot>,
    selected_id: String,
}

impl ProfileStore {
    pub fn new(profiles_dir: PathBuf, state_path: PathBuf, bindings: ProxyBindings) -> Self {
        let snapshot = Arc::new(ProfileSnapshot::fallback(&profiles_dir, &bindings));
        ProfileStore {
            profiles_dir,
            state_path,
            bindings,
            snapshot,
            selected_id: DEFAULT_PROFILE_ID.to_string(),
        }
    }

    /// Load profiles and restore the persisted selection
    ///
    /// A stored id that no longer resolves is replaced with the default id
    /// and written back.
    pub fn init(&mut self) -> Result<()> {
        self.reload()?;

        let stored = load_selection(&self.state_path)
            .map(|state| sanitize_profile_id(&state.selected_profile_id))
            .filter(|id| !id.is_empty());

        match stored {
            Some(id) if self.snapshot.contains(&id) => {
                info!("Restored selected profile: {}", id);
                self.selected_id = id;
            }
            _ => {
                self.selected_id = DEFAULT_PROFILE_ID.to_string();
                if let Err(e) = self.persist_selection() {
                    warn!("{}", e);
                }
            }
        }

        Ok(())
    }

    /// Rediscover profiles and swap in the new snapshot
    pub fn reload(&mut self) -> Result<Arc<ProfileSnapshot>> {
        let snapshot = discover_profiles(&self.profiles_dir, &self.bindings)?;

        for warning in &snapshot.load_warnings {
            warn!("Profile load warning: {}", warning);
        }
        info!("Loaded {} profiles", snapshot.profiles.len());

        self.snapshot = Arc::new(snapshot);

        if !self.snapshot.contains(&self.selected_id) {
            info!(
                "Selected profile {} disappeared, falling back to {}",
                self.selected_id, DEFAULT_PROFILE_ID
            );
            self.selected_id = DEFAULT_PROFILE_ID.to_string();
        }

        Ok(Arc::clone(&self.snapshot))
    }

    /// Make `profile_id` the active profile and persist the choice
    ///
    /// Unknown ids leave everything untouched. A failed save is reported but
    /// the in-memory selection keeps the new value.
    pub fn select(&mut self, profile_id: &str) -> Result<()> {
        let id = sanitize_profile_id(profile_id);
        if id.is_empty() || !self.snapshot.contains(&id) {
            return Err(ControllerError::ProfileNotFound(profile_id.trim().to_string()));
        }

        self.selected_id = id;
        self.persist_selection()
    }

    fn persist_selection(&self) -> Result<()> {
        save_selection(&self.state_path, &SelectionState::new(self.selected_id.clone())).map_err(
            |source| ControllerError::Persist {
                path: self.state_path.clone(),
                source,
            },
        )
    }

    pub fn snapshot(&self) -> Arc<ProfileSnapshot> {
        Arc::clone(&self.snapshot)
    }

    pub fn load_warnings(&self) -> &[String] {
        &self.snapshot.load_warnings
    }

    pub fn profiles_dir(&self) -> &Path {
        &self.profiles_dir
    }

    pub fn selected_id(&self) -> &str {
        &self.selected_id
    }

    pub fn selected(&self) -> Option<&ServiceProfile> {
        self.snapshot.get(&self.selected_id)
    }

    pub fn selected_name(&self) -> String {
        self.selected()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "Unknown".to_string())
    }

    pub fn selected_warnings(&self) -> &[String] {
        self.selected().map(|p| p.warnings.as_slice()).unwrap_or(&[])
    }

    /// Compatibility of the active profile; an unresolved selection blocks nothing
    pub fn selected_compatibility(&self) -> (bool, bool) {
        self.selected()
            .map(|p| (p.proxy_compatible, p.web_ui_compatible))
            .unwrap_or((true, true))
    }

    /// Folder holding the active profile's scripts
    pub fn scripts_folder(&self) -> PathBuf {
        match self.selected() {
            Some(profile) => match profile.script_paths.first().and_then(|p| p.parent()) {
                Some(dir) => dir.to_path_buf(),
                None => profile
                    .source_path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.profiles_dir.clone()),
            },
            None => self.profiles_dir.clone(),
        }
    }

    /// Like [`scripts_folder`](Self::scripts_folder), creating it on demand
    pub fn ensure_scripts_folder(&self) -> io::Result<PathBuf> {
        let folder = absolutize(&self.scripts_folder());
        fs::create_dir_all(&folder)?;
        Ok(folder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn store_in(dir: &TempDir) -> ProfileStore {
        ProfileStore::new(
            dir.path().join("profiles"),
            dir.path().join("state.json"),
            ProxyBindings::default(),
        )
    }

    fn write_profile(dir: &TempDir, file_name: &str, contents: &str) -> PathBuf {
        let profiles_dir = dir.path().join("profiles");
        fs::create_dir_all(&profiles_dir).unwrap();
        let path = profiles_dir.join(file_name);
        fs::write(&path, contents).unwrap();
        path
    }

    fn discover(dir: &TempDir) -> ProfileSnapshot {
        discover_profiles(&dir.path().join("profiles"), &ProxyBindings::default()).unwrap()
    }

    #[test]
    fn test_sanitize_profile_id() {
        assert_eq!(sanitize_profile_id("Default"), "default");
        assert_eq!(sanitize_profile_id("  My Profile  "), "my-profile");
        assert_eq!(sanitize_profile_id("api_capture_v2"), "api-capture-v2");
        assert_eq!(sanitize_profile_id("Ünïcode!@#"), "ncode");
        assert_eq!(sanitize_profile_id("!!!"), "");
    }

    #[test]
    fn test_empty_directory_yields_default() {
        let dir = tempdir().unwrap();
        let snapshot = discover(&dir);

        assert_eq!(snapshot.profiles.len(), 1);
        assert_eq!(snapshot.profiles[0].id, "default");
        assert_eq!(snapshot.profiles[0].name, "Default");
        assert!(dir.path().join("profiles").join("default.yaml").exists());
    }

    #[test]
    fn test_missing_directory_is_created() {
        let dir = tempdir().unwrap();
        let profiles_dir = dir.path().join("a").join("b");
        let snapshot = discover_profiles(&profiles_dir, &ProxyBindings::default()).unwrap();
        assert!(profiles_dir.is_dir());
        assert_eq!(snapshot.profiles[0].id, "default");
    }

    #[test]
    fn test_invalid_default_falls_back_to_synthesized_profile() {
        let dir = tempdir().unwrap();
        write_profile(&dir, "default.yaml", "id: [unterminated");

        let snapshot = discover(&dir);
        assert_eq!(snapshot.profiles.len(), 1);
        assert_eq!(snapshot.profiles[0].id, "default");
        assert!(snapshot.profiles[0].scripts.is_empty());
        assert_eq!(snapshot.load_warnings.len(), 1);
        assert!(snapshot.load_warnings[0].starts_with("default.yaml: "));
    }

    #[test]
    fn test_discovered_ids_are_sanitized() {
        let dir = tempdir().unwrap();
        write_profile(&dir, "a.yaml", "id: \"API Capture\"\n");
        write_profile(&dir, "My_Flows.YML", "name: Flows\n");
        write_profile(&dir, "c.yaml", "id: \"%%%\"\nname: Fallback To Stem\n");
        write_profile(&dir, "notes.txt", "id: ignored\n");

        let snapshot = discover(&dir);
        let ids: Vec<&str> = snapshot.profiles.iter().map(|p| p.id.as_str()).collect();

        assert!(ids.contains(&"api-capture"));
        assert!(ids.contains(&"my-flows"));
        assert!(ids.contains(&"c"));
        assert!(!ids.contains(&"ignored"));
        for id in ids {
            assert!(!id.is_empty());
            assert!(id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        }
    }

    #[test]
    fn test_invalid_files_become_warnings() {
        let dir = tempdir().unwrap();
        write_profile(&dir, "broken.yaml", "scripts: {not: [a list\n");
        write_profile(&dir, "!!!.yaml", "id: \"***\"\n");
        write_profile(&dir, "nested.yaml", "id: nested\nset_options:\n  block_global:\n    - a\n");
        write_profile(&dir, "good.yaml", "id: good\nname: Good\n");

        let snapshot = discover(&dir);
        let ids: Vec<&str> = snapshot.profiles.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["default", "good"]);

        assert_eq!(snapshot.load_warnings.len(), 3);
        assert!(snapshot
            .load_warnings
            .iter()
            .any(|w| w == "!!!.yaml: profile id is empty"));
        assert!(snapshot
            .load_warnings
            .iter()
            .any(|w| w.starts_with("nested.yaml: set_options.block_global")));
        assert!(snapshot
            .load_warnings
            .iter()
            .any(|w| w.starts_with("broken.yaml: ")));
    }

    #[test]
    fn test_profiles_sorted_default_first_then_name() {
        let dir = tempdir().unwrap();
        write_profile(&dir, "z.yaml", "id: z\nname: alpha\n");
        write_profile(&dir, "a.yaml", "id: a\nname: Charlie\n");
        write_profile(&dir, "m.yaml", "id: m\nname: Bravo\n");

        let snapshot = discover(&dir);
        let names: Vec<&str> = snapshot.profiles.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Default", "alpha", "Bravo", "Charlie"]);
    }

    #[test]
    fn test_duplicate_ids_keep_first_and_warn() {
        let dir = tempdir().unwrap();
        write_profile(&dir, "a-first.yaml", "id: dup\nname: First\n");
        write_profile(&dir, "b-second.yaml", "id: DUP\nname: Second\n");

        let snapshot = discover(&dir);
        let dup = snapshot.get("dup").unwrap();
        assert_eq!(dup.name, "First");
        assert_eq!(snapshot.profiles.iter().filter(|p| p.id == "dup").count(), 1);
        assert_eq!(
            snapshot.load_warnings,
            vec!["b-second.yaml: duplicate profile id \"dup\" (already defined by a-first.yaml)"]
        );
    }

    #[test]
    fn test_option_values_are_coerced() {
        let dir = tempdir().unwrap();
        write_profile(
            &dir,
            "opts.yaml",
            "id: opts\nset_options:\n  ssl_insecure: true\n  stream_large_bodies: 3\n  ratio: 1.5\n  int: 3.0\n  view_filter: \"~d example.com\"\n  \"  \": ignored\n",
        );

        let snapshot = discover(&dir);
        let profile = snapshot.get("opts").unwrap();
        assert_eq!(profile.set_options["ssl_insecure"], "true");
        assert_eq!(profile.set_options["stream_large_bodies"], "3");
        assert_eq!(profile.set_options["ratio"], "1.5");
        assert_eq!(profile.set_options["int"], "3");
        assert_eq!(profile.set_options["view_filter"], "~d example.com");
        assert_eq!(profile.set_options.len(), 5);
    }

    #[test]
    fn test_listen_port_override_is_incompatible() {
        let dir = tempdir().unwrap();
        write_profile(&dir, "p.yaml", "id: p\nset_options:\n  listen_port: \"9999\"\n");

        let snapshot = discover(&dir);
        let profile = snapshot.get("p").unwrap();
        assert!(!profile.proxy_compatible);
        assert!(profile.web_ui_compatible);
        assert!(!profile.warnings.is_empty());
        assert!(profile
            .warnings
            .contains(&"proxy actions disabled (listen_host/listen_port override)".to_string()));
    }

    #[test]
    fn test_matching_override_stays_compatible() {
        let dir = tempdir().unwrap();
        write_profile(&dir, "p.yaml", "id: p\nset_options:\n  listen_port: \"8899\"\n");
        write_profile(&dir, "q.yaml", "id: q\nset_options:\n  listen_port: 8899\n  listen_host: 127.0.0.1\n");

        let snapshot = discover(&dir);
        for id in ["p", "q"] {
            let profile = snapshot.get(id).unwrap();
            assert!(profile.proxy_compatible);
            assert!(profile.warnings.is_empty());
        }
    }

    #[test]
    fn test_web_overrides_and_confdir_warn() {
        let dir = tempdir().unwrap();
        write_profile(
            &dir,
            "w.yaml",
            "id: w\nset_options:\n  web_password: hunter2\n  confdir: /tmp/elsewhere\n",
        );

        let snapshot = discover(&dir);
        let profile = snapshot.get("w").unwrap();
        assert!(profile.proxy_compatible);
        assert!(!profile.web_ui_compatible);
        assert_eq!(
            profile.warnings,
            vec![
                "web UI action disabled (web host/port/password override)".to_string(),
                "confdir override ignored in profile set_options".to_string(),
            ]
        );
    }

    #[test]
    fn test_scripts_resolve_relative_to_profile_and_missing_warns() {
        let dir = tempdir().unwrap();
        let profiles_dir = dir.path().join("profiles");
        fs::create_dir_all(profiles_dir.join("scripts")).unwrap();
        fs::write(profiles_dir.join("scripts").join("present.py"), "").unwrap();
        write_profile(
            &dir,
            "s.yaml",
            "id: s\nscripts:\n  - scripts/present.py\n  - \"  \"\n  - scripts/absent.py\nmode: \" upstream:http://proxy:3128 \"\n",
        );

        let snapshot = discover(&dir);
        let profile = snapshot.get("s").unwrap();
        assert_eq!(profile.scripts, vec!["scripts/present.py", "scripts/absent.py"]);
        assert_eq!(
            profile.script_paths,
            vec![
                profiles_dir.join("scripts").join("present.py"),
                profiles_dir.join("scripts").join("absent.py"),
            ]
        );
        assert_eq!(profile.mode.as_deref(), Some("upstream:http://proxy:3128"));
        assert_eq!(profile.warnings.len(), 1);
        assert!(profile.warnings[0].starts_with("missing script: "));
        assert!(profile.proxy_compatible);
    }

    #[test]
    fn test_empty_file_uses_file_stem() {
        let dir = tempdir().unwrap();
        write_profile(&dir, "Quick Look.yaml", "");

        let snapshot = discover(&dir);
        let profile = snapshot.get("quick-look").unwrap();
        assert_eq!(profile.name, "quick-look");
        assert!(profile.scripts.is_empty());
    }

    #[test]
    fn test_init_without_state_selects_default_and_persists() {
        let dir = tempdir().unwrap();
        let mut store = store_in(&dir);
        store.init().unwrap();

        assert_eq!(store.selected_id(), "default");
        assert_eq!(store.selected_name(), "Default");
        let state = load_selection(&dir.path().join("state.json")).unwrap();
        assert_eq!(state.selected_profile_id, "default");
    }

    #[test]
    fn test_init_replaces_unknown_stored_selection() {
        let dir = tempdir().unwrap();
        save_selection(&dir.path().join("state.json"), &SelectionState::new("gone")).unwrap();

        let mut store = store_in(&dir);
        store.init().unwrap();

        assert_eq!(store.selected_id(), "default");
        let state = load_selection(&dir.path().join("state.json")).unwrap();
        assert_eq!(state.selected_profile_id, "default");
    }

    #[test]
    fn test_select_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        write_profile(&dir, "x.yaml", "id: x\nname: X Ray\n");

        let mut store = store_in(&dir);
        store.init().unwrap();
        store.select("x").unwrap();
        assert_eq!(store.selected_name(), "X Ray");

        let mut restarted = store_in(&dir);
        restarted.init().unwrap();
        assert_eq!(restarted.selected_id(), "x");
    }

    #[test]
    fn test_select_sanitizes_input() {
        let dir = tempdir().unwrap();
        write_profile(&dir, "x.yaml", "id: api-capture\n");

        let mut store = store_in(&dir);
        store.init().unwrap();
        store.select("  API_Capture ").unwrap();
        assert_eq!(store.selected_id(), "api-capture");
    }

    #[test]
    fn test_select_unknown_leaves_state_unchanged() {
        let dir = tempdir().unwrap();
        write_profile(&dir, "x.yaml", "id: x\n");

        let mut store = store_in(&dir);
        store.init().unwrap();
        store.select("x").unwrap();

        let err = store.select("nope").unwrap_err();
        assert!(matches!(err, ControllerError::ProfileNotFound(ref id) if id == "nope"));
        assert_eq!(store.selected_id(), "x");
        let state = load_selection(&dir.path().join("state.json")).unwrap();
        assert_eq!(state.selected_profile_id, "x");

        assert!(matches!(
            store.select("!!!"),
            Err(ControllerError::ProfileNotFound(_))
        ));
    }

    #[test]
    fn test_failed_persist_keeps_in_memory_selection() {
        let dir = tempdir().unwrap();
        write_profile(&dir, "x.yaml", "id: x\n");
        // A regular file where the state directory should be
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "").unwrap();

        let mut store = ProfileStore::new(
            dir.path().join("profiles"),
            blocker.join("state.json"),
            ProxyBindings::default(),
        );
        store.init().unwrap();

        let err = store.select("x").unwrap_err();
        assert!(matches!(err, ControllerError::Persist { .. }));
        assert_eq!(store.selected_id(), "x");
    }

    #[test]
    fn test_reload_falls_back_when_selection_disappears() {
        let dir = tempdir().unwrap();
        let path = write_profile(&dir, "x.yaml", "id: x\n");

        let mut store = store_in(&dir);
        store.init().unwrap();
        store.select("x").unwrap();
        let before = store.snapshot();

        fs::remove_file(path).unwrap();
        let after = store.reload().unwrap();

        assert_eq!(store.selected_id(), "default");
        assert!(before.contains("x"));
        assert!(!after.contains("x"));
    }

    #[test]
    fn test_scripts_folder_prefers_first_script() {
        let dir = tempdir().unwrap();
        write_profile(&dir, "x.yaml", "id: x\nscripts:\n  - addons/one.py\n");

        let mut store = store_in(&dir);
        store.init().unwrap();
        assert_eq!(store.scripts_folder(), dir.path().join("profiles"));

        store.select("x").unwrap();
        let folder = store.ensure_scripts_folder().unwrap();
        assert_eq!(folder, dir.path().join("profiles").join("addons"));
        assert!(folder.is_dir());
    }

    #[test]
    fn test_unresolved_selection_is_compatible_and_unknown() {
        let dir = tempdir().unwrap();
        write_profile(&dir, "default.yaml", "id: [broken");
        write_profile(&dir, "other.yaml", "id: other\n");

        let mut store = store_in(&dir);
        store.init().unwrap();

        assert!(store.selected().is_none());
        assert_eq!(store.selected_name(), "Unknown");
        assert_eq!(store.selected_compatibility(), (true, true));
        assert!(store.selected_warnings().is_empty());
        assert_eq!(store.load_warnings().len(), 1);
    }
}
