mod config;
mod console;
mod controller;
mod error;
mod ipc;
mod logs;
mod platform;
mod process;
mod profile;
mod selection;
mod status;
mod supervisor;

use anyhow::{Context, Result};
use config::ControllerConfig;
use controller::Controller;
use process::SystemProcessTable;
use std::sync::Arc;
use supervisor::ProcessSupervisor;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = ControllerConfig::from_environment().context("Failed to resolve data directory")?;
    info!("Data directory: {}", config.data_dir.display());

    let supervisor = ProcessSupervisor::new(&config, Arc::new(SystemProcessTable::new()));
    let proxy = platform::system_proxy(&config.bindings);
    let certs = platform::certificate_store(&config.mitm_home);
    let poll_interval = config.poll_interval;

    let mut controller = Controller::new(config, supervisor, proxy, certs);

    // Keep running with the fallback profile; `reload` can retry later
    if let Err(e) = controller.init() {
        error!("Failed to load profiles: {}", e);
    }
    info!("Selected profile: {}", controller.profiles().selected_id());

    let status = controller.status();
    println!("{} {}", status.indicator(), status);
    println!("Type 'help' for commands.");

    let (command_tx, mut command_rx) = ipc::command_channel();
    console::spawn_reader(command_tx).context("Failed to start console reader")?;

    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately and the status was just printed
    ticker.tick().await;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            command = command_rx.recv() => {
                let Some(command) = command else { break };
                let reply = controller.handle(command);
                println!("{}", reply.message);
                if reply.quit {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Some(status) = controller.poll() {
                    println!("{} {}", status.indicator(), status);
                }
            }
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
        }
    }

    // mitmproxy outlives the controller; only `stop` ends it
    info!("Controller exiting");
    Ok(())
}
