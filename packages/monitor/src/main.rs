#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Terminal monitor for the GreenSentinel incident feed.
//!
//! `tail` runs a sync store against the configured backend and prints
//! incidents and connection transitions as they happen; `list` is a
//! one-shot bootstrap fetch; `set-state` requests a lifecycle
//! transition for a single incident.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use green_sentinel_api::IncidentApi;
use green_sentinel_config::{ClientConfig, clean_host};
use green_sentinel_incident_models::{Incident, IncidentState};
use green_sentinel_sync::IncidentSyncStore;

#[derive(Parser)]
#[command(name = "green_sentinel_monitor", about = "GreenSentinel incident monitor")]
struct Cli {
    /// API host as `host[:port]`; overrides the config file and the
    /// `GREEN_SENTINEL_API_HOST` environment variable
    #[arg(long)]
    api_host: Option<String>,
    /// Use TLS transports (`https`/`wss`)
    #[arg(long)]
    secure: bool,
    /// Path to a TOML configuration override file
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Live-tail the incident feed (default)
    Tail {
        /// Bootstrap state filter (e.g. `validated_fire`); pass `any`
        /// to disable filtering
        #[arg(long)]
        state: Option<String>,
        /// Maximum number of incidents retained
        #[arg(long)]
        limit: Option<usize>,
    },
    /// One-shot fetch of the most recent incidents
    List {
        /// State filter (e.g. `validated_fire`); pass `any` to disable
        #[arg(long)]
        state: Option<String>,
        /// Maximum number of incidents to fetch
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Request a state transition for an incident
    SetState {
        /// Incident id
        id: i64,
        /// Target state: `travelling`, `onsite`, or `finished`
        state: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init_custom_env("RUST_LOG");

    let cli = Cli::parse();
    let mut config = ClientConfig::load(cli.config.as_deref())?;
    if let Some(host) = cli.api_host {
        config.api_host = clean_host(&host);
    }
    if cli.secure {
        config.secure = true;
    }
    log::debug!("Resolved config: {config:?}");

    match cli.command.unwrap_or(Commands::Tail {
        state: None,
        limit: None,
    }) {
        Commands::Tail { state, limit } => {
            apply_overrides(&mut config, state.as_deref(), limit)?;
            tail(config).await?;
        }
        Commands::List { state, limit } => {
            apply_overrides(&mut config, state.as_deref(), limit)?;
            list(&config).await?;
        }
        Commands::SetState { id, state } => {
            let state = parse_state(&state)?;
            let api = IncidentApi::from_config(&config);
            api.update_state(id, state).await?;
            println!("Incident #{id} -> {state}");
        }
    }

    Ok(())
}

/// Applies the `--state`/`--limit` flags on top of the resolved config.
fn apply_overrides(
    config: &mut ClientConfig,
    state: Option<&str>,
    limit: Option<usize>,
) -> Result<(), String> {
    if let Some(state) = state {
        config.state_filter = if state == "any" {
            None
        } else {
            Some(parse_state(state)?)
        };
    }
    if let Some(limit) = limit {
        config.max_incidents = limit;
    }
    Ok(())
}

fn parse_state(raw: &str) -> Result<IncidentState, String> {
    raw.parse()
        .map_err(|_| format!("unknown incident state: {raw}"))
}

async fn tail(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!(
        "Tailing incidents from {} (filter: {}, bound: {}) — Ctrl-C to stop",
        config.ws_url(),
        config
            .state_filter
            .map_or_else(|| "any".to_owned(), |state| state.to_string()),
        config.max_incidents
    );

    let api = IncidentApi::from_config(&config);
    let store = IncidentSyncStore::start(config, api);
    let mut status = store.watch_status();
    let mut poll = tokio::time::interval(Duration::from_millis(500));
    let mut printed: HashSet<i64> = HashSet::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("[connection: {}]", *status.borrow());
            }
            _ = poll.tick() => {
                for incident in store.incidents().iter().rev() {
                    if printed.insert(incident.id) {
                        println!("{}", format_incident(incident));
                    }
                }
            }
        }
    }

    println!("Shutting down...");
    store.shutdown().await;
    Ok(())
}

async fn list(config: &ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let api = IncidentApi::from_config(config);
    let page = api
        .list_incidents(config.state_filter, config.max_incidents)
        .await?;

    println!("{} incidents ({} total server-side)", page.incidents.len(), page.total);
    for incident in &page.incidents {
        println!("{}", format_incident(incident));
    }
    Ok(())
}

fn format_incident(incident: &Incident) -> String {
    let position = incident.position().map_or_else(
        || "unresolved".to_owned(),
        |(lat, lon)| format!("{lat:.5}, {lon:.5}"),
    );
    let created = incident
        .created_at
        .map_or_else(|| "-".to_owned(), |ts| ts.to_rfc3339());
    format!(
        "#{:<6} {:<14} {:>5.1}%  [{position}]  {created}",
        incident.id,
        incident.state.to_string(),
        incident.confidence_fraction() * 100.0
    )
}
