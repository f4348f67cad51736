use sysinfo::{Pid, ProcessStatus, System};

/// Information about a running process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

/// Report of process killing operation
#[derive(Debug, Clone, Default)]
pub struct KillReport {
    pub killed: Vec<ProcessInfo>,
    pub failed: Vec<ProcessInfo>,
}

impl KillReport {
    pub fn any_killed(&self) -> bool {
        !self.killed.is_empty()
    }
}

/// OS process table as seen by the supervisor
///
/// Lets the supervisor find a proxy it did not start (for example after the
/// controller itself restarted) and probe the liveness of its own child.
pub trait ProcessTable: Send + Sync {
    /// True if `pid` exists and has not exited
    fn is_alive(&self, pid: u32) -> bool;

    /// Kill `pid` now; false if it is gone or could not be signalled
    fn kill(&self, pid: u32) -> bool;

    /// Every running process whose image matches one of `images`
    fn find_by_image(&self, images: &[String]) -> Vec<ProcessInfo>;

    /// Kill every running process whose image matches one of `images`
    fn terminate_by_image(&self, images: &[String]) -> KillReport;
}

/// Normalize process name for matching (case-insensitive, strips .exe if present)
pub fn normalize_process_name(name: &str) -> String {
    let lower = name.to_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stripped) => stripped.to_string(),
        None => lower,
    }
}

/// Last path component, splitting on both separators so Windows command
/// lines are understood everywhere
fn file_stem_normalized(path: &str) -> String {
    let name = path.rsplit(&['/', '\\'][..]).next().unwrap_or(path);
    normalize_process_name(name)
}

fn is_interpreter(name: &str) -> bool {
    name == "py" || name.starts_with("python")
}

/// Check whether a process looks like one of the proxy executables
///
/// mitmproxy tools often run under a Python interpreter. The script word
/// after the interpreter is checked only when the process is one; otherwise
/// `less mitmdump` would count as a proxy.
pub fn matches_image(name: &str, cmd: &[String], images: &[String]) -> bool {
    let targets: Vec<String> = images.iter().map(|i| normalize_process_name(i)).collect();
    let is_target = |candidate: &str| targets.iter().any(|target| target == candidate);

    let name = normalize_process_name(name);
    if is_target(&name) {
        return true;
    }

    let launcher = cmd.first().map(|arg| file_stem_normalized(arg));
    if let Some(launcher) = &launcher {
        if is_target(launcher) {
            return true;
        }
    }

    let interpreted = is_interpreter(&name) || launcher.as_deref().map_or(false, is_interpreter);
    interpreted
        && cmd
            .get(1)
            .map(|script| is_target(&file_stem_normalized(script)))
            .unwrap_or(false)
}

/// Process table backed by sysinfo
#[derive(Debug, Default)]
pub struct SystemProcessTable;

impl SystemProcessTable {
    pub fn new() -> Self {
        SystemProcessTable
    }

    fn snapshot() -> System {
        let mut sys = System::new();
        sys.refresh_processes();
        sys
    }
}

impl ProcessTable for SystemProcessTable {
    fn is_alive(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let mut sys = System::new();
        if !sys.refresh_process(pid) {
            return false;
        }

        // An exited child that has not been reaped yet is not running
        sys.process(pid)
            .map(|process| !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .unwrap_or(false)
    }

    fn kill(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let mut sys = System::new();
        if !sys.refresh_process(pid) {
            return false;
        }
        sys.process(pid).map(|process| process.kill()).unwrap_or(false)
    }

    fn find_by_image(&self, images: &[String]) -> Vec<ProcessInfo> {
        let sys = Self::snapshot();
        let own_pid = std::process::id();

        let mut found: Vec<ProcessInfo> = sys
            .processes()
            .iter()
            .filter(|(pid, process)| {
                pid.as_u32() != own_pid
                    && !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
                    && matches_image(process.name(), process.cmd(), images)
            })
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                name: process.name().to_string(),
            })
            .collect();

        // Sort by pid for stable reporting
        found.sort_by_key(|p| p.pid);
        found
    }

    fn terminate_by_image(&self, images: &[String]) -> KillReport {
        let sys = Self::snapshot();
        let own_pid = std::process::id();
        let mut report = KillReport::default();

        for (pid, process) in sys.processes() {
            if pid.as_u32() == own_pid || !matches_image(process.name(), process.cmd(), images) {
                continue;
            }

            let info = ProcessInfo {
                pid: pid.as_u32(),
                name: process.name().to_string(),
            };

            // Attempt to kill the process
            if process.kill() {
                report.killed.push(info);
            } else {
                report.failed.push(info);
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn images() -> Vec<String> {
        vec![
            "mitmdump".to_string(),
            "mitmweb".to_string(),
            "mitmproxy".to_string(),
        ]
    }

    #[test]
    fn test_normalize_process_name() {
        assert_eq!(normalize_process_name("mitmdump.exe"), "mitmdump");
        assert_eq!(normalize_process_name("MitmDump.EXE"), "mitmdump");
        assert_eq!(normalize_process_name("mitmweb"), "mitmweb");
    }

    #[test]
    fn test_matches_image_by_name() {
        assert!(matches_image("mitmdump", &[], &images()));
        assert!(matches_image("MITMWEB.exe", &[], &images()));
        assert!(!matches_image("mitm-controller", &[], &images()));
        assert!(!matches_image("bash", &[], &images()));
    }

    #[test]
    fn test_matches_image_under_interpreter() {
        let cmd = vec![
            "/usr/bin/python3".to_string(),
            "/opt/homebrew/bin/mitmweb".to_string(),
            "--set".to_string(),
        ];
        assert!(matches_image("python3", &cmd, &images()));

        // Only the launcher words count, not arbitrary arguments
        let cmd = vec![
            "vim".to_string(),
            "notes.txt".to_string(),
            "mitmdump".to_string(),
        ];
        assert!(!matches_image("vim", &cmd, &images()));
    }

    #[test]
    fn test_matches_image_ignores_file_arguments() {
        let less = vec!["less".to_string(), "mitmdump".to_string()];
        assert!(!matches_image("less", &less, &images()));

        let vim = vec!["/usr/bin/vim".to_string(), "/tmp/mitmweb".to_string()];
        assert!(!matches_image("vim", &vim, &images()));

        // Windows launcher and a versioned interpreter still count
        let py = vec!["py.exe".to_string(), "C:\\tools\\mitmdump.exe".to_string()];
        assert!(matches_image("py.exe", &py, &images()));
        let versioned = vec!["python3.12".to_string(), "/usr/local/bin/mitmproxy".to_string()];
        assert!(matches_image("python3.12", &versioned, &images()));
    }

    #[test]
    fn test_own_process_is_alive() {
        let table = SystemProcessTable::new();
        assert!(table.is_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_by_pid() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let table = SystemProcessTable::new();
        assert!(table.is_alive(pid));

        assert!(table.kill(pid));
        child.wait().unwrap();
        assert!(!table.is_alive(pid));
        assert!(!table.kill(pid));
    }

    #[test]
    fn test_kill_report_default() {
        let report = KillReport::default();
        assert!(report.killed.is_empty());
        assert!(report.failed.is_empty());
        assert!(!report.any_killed());
    }
}
