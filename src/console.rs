use crate::ipc::ControlCommand;
use anyhow::{bail, Result};
use std::io::{self, BufRead};
use std::thread;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

pub const HELP: &str = "\
Commands:
  start              start mitmproxy with the selected profile
  stop               stop mitmproxy
  select <id>        switch profile (restarts a running proxy)
  profiles           list profiles
  reload             rescan the profiles directory
  status             show current status
  proxy on|off       toggle the system proxy
  cert install       install (or trust) the mitmproxy CA certificate
  cert remove        remove the mitmproxy CA certificate
  paths              show profile, scripts, log and config locations
  help               show this help
  quit               exit the controller (mitmproxy keeps running)";

/// Parse one console line; blank lines yield `None`
pub fn parse_command(line: &str) -> Result<Option<ControlCommand>> {
    let mut words = line.split_whitespace();
    let verb = match words.next() {
        Some(verb) => verb.to_lowercase(),
        None => return Ok(None),
    };
    let arg = words.next().map(str::to_lowercase);
    if words.next().is_some() {
        bail!("Too many arguments for '{}'", verb);
    }

    let command = match (verb.as_str(), arg.as_deref()) {
        ("start", None) => ControlCommand::Start,
        ("stop", None) => ControlCommand::Stop,
        ("select" | "use", Some(id)) => ControlCommand::Select(id.to_string()),
        ("select" | "use", None) => bail!("Usage: select <profile id>"),
        ("reload", None) => ControlCommand::Reload,
        ("status", None) => ControlCommand::Status,
        ("proxy", Some("on")) => ControlCommand::EnableProxy,
        ("proxy", Some("off")) => ControlCommand::DisableProxy,
        ("proxy", _) => bail!("Usage: proxy on|off"),
        ("cert", Some("install" | "trust")) => ControlCommand::InstallCert,
        ("cert", Some("remove")) => ControlCommand::RemoveCert,
        ("cert", _) => bail!("Usage: cert install|remove"),
        ("profiles", None) => ControlCommand::Profiles,
        ("paths", None) => ControlCommand::Paths,
        ("help" | "?", None) => ControlCommand::Help,
        ("quit" | "exit", None) => ControlCommand::Quit,
        (_, Some(_)) if is_known(&verb) => bail!("'{}' takes no argument", verb),
        _ => bail!("Unknown command '{}' (type 'help')", verb),
    };

    Ok(Some(command))
}

fn is_known(verb: &str) -> bool {
    matches!(
        verb,
        "start" | "stop" | "reload" | "status" | "profiles" | "paths" | "help" | "?" | "quit" | "exit"
    )
}

/// Forward commands typed on stdin until EOF or until the controller goes away
///
/// Runs on its own thread: a blocking read must not hold up runtime
/// shutdown. EOF is treated as a quit request.
pub fn spawn_reader(commands: UnboundedSender<ControlCommand>) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        break;
                    }
                };

                match parse_command(&line) {
                    Ok(Some(command)) => {
                        if commands.send(command).is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("{}", e),
                }
            }

            debug!("stdin closed");
            let _ = commands.send(ControlCommand::Quit);
        })
}
