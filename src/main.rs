mod config;

use crate::config::{Cli, Command};
use clap::Parser;
use color_eyre::eyre::{eyre, Result};
use socksfleet::Fleet;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tokio::signal;

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("socksfleet=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let store = args.store();
    let path = store.path().to_path_buf();

    // A rules file that fails to parse is left untouched rather than overwritten
    let fleet = Fleet::open(store, args.fleet_options())
        .map_err(|e| eyre!("Cannot load rules from {}: {}", path.display(), e))?;
    info!("Loaded {} rules from {}", fleet.list_rules().len(), path.display());

    match args.command {
        Command::List => print_rules(&fleet),
        Command::Add { id, rule } => {
            let id = fleet.add_rule(rule.into_rule(id.unwrap_or_default())).await?;
            println!("{}", id);
        }
        Command::Update { id, rule } => {
            fleet.update_rule(rule.into_rule(id)).await?;
        }
        Command::Delete { id } => fleet.delete_rule(&id).await?,
        Command::Stats { id } => {
            let (upload, download) = fleet.traffic_stats(&id)?;
            println!("upload={} download={}", upload, download);
        }
        Command::Reset { id } => fleet.reset_traffic_stats(&id).await?,
        Command::Run { all, start } => run(&fleet, all, start).await?,
    }

    Ok(())
}

fn print_rules(fleet: &Fleet) {
    for rule in fleet.list_rules() {
        println!(
            "{}\t{}\tport={}\tauth={}\tudp={}\tup={}\tdown={}",
            rule.id,
            rule.name,
            rule.port,
            if rule.no_auth { "none" } else { "password" },
            rule.enable_udp,
            rule.upload_bytes,
            rule.download_bytes
        );
    }
}

async fn run(fleet: &Fleet, all: bool, start: Vec<String>) -> Result<()> {
    let ids = if all {
        fleet.list_rules().into_iter().map(|r| r.id).collect()
    } else {
        start
    };
    if ids.is_empty() {
        return Err(eyre!("Nothing to run, pass --all or --start <ID>"));
    }

    let mut started = 0;
    for id in &ids {
        match fleet.start_server(id).await {
            Ok(()) => {
                started += 1;
                if fleet.get_rule(id).is_some_and(|r| r.enable_udp) {
                    info!("{}: {}", id, fleet.test_udp(id));
                }
            }
            Err(e) if e.is_not_found() => warn!("Skipping {}: {}", id, e),
            Err(e) => warn!("Failed to start {}: {} (continuing)", id, e),
        }
    }
    if started == 0 {
        return Err(eyre!("No rule could be started"));
    }
    info!("{} of {} rules running, Ctrl-C to stop", started, ids.len());

    signal::ctrl_c().await?;
    info!("Shutdown signal received");
    fleet.shutdown().await;
    Ok(())
}
