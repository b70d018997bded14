//! Simulated City command line entry point
//!
//! Smoke-test tooling for the broker profiles in `simcity.toml`: print the
//! resolved configuration, run a checked publish against every profile, or
//! follow a topic until Ctrl-C.

use clap::{Parser, Subcommand};
use serde::Serialize;
use simulated_city::config::{AppConfig, BrokerConfig, ConfigError, DEFAULT_CONFIG_FILE};
use simulated_city::error::{SimCityError, SimCityResult};
use simulated_city::observability::init_default_logging;
use simulated_city::protocol::build_topic;
use simulated_city::transport::mqtt::{
    ConnectorSet, MqttConnector, MqttPublisher, PublishOutcome, RandomClientId,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn, Instrument, Level};

/// Simulated City MQTT tooling
#[derive(Parser)]
#[command(name = "simulated-city")]
#[command(about = "Check and inspect Simulated City MQTT broker profiles")]
#[command(version)]
struct Cli {
    /// Configuration file path (searched for in parent directories when bare)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the configuration
    Config {
        /// Print the resolved profiles
        #[arg(long)]
        show: bool,
    },
    /// Connect to each profile and confirm a publish round-trip
    Check {
        /// Only check this profile
        #[arg(long)]
        profile: Option<String>,

        /// Connection and confirmation timeout in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// Subscribe to `<base_topic>/<segments>` and print messages until Ctrl-C
    Listen {
        /// Profile to listen on (defaults to the primary profile)
        #[arg(long)]
        profile: Option<String>,

        /// Topic segments below the base topic; `+` and `#` are allowed
        #[arg(required = true)]
        segments: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level_override = match cli.verbose {
        0 => None,
        1 => Some(Level::DEBUG),
        _ => Some(Level::TRACE),
    };
    init_default_logging(level_override);

    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = match AppConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Check {
            profile,
            timeout_ms,
        } => {
            let span = simulated_city::lifecycle_span!(command = "check");
            run_check(&config, profile, Duration::from_millis(timeout_ms))
                .instrument(span)
                .await
        }
        Commands::Listen { profile, segments } => {
            let span = simulated_city::lifecycle_span!(command = "listen");
            run_listen(&config, profile, segments).instrument(span).await
        }
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

#[derive(Serialize)]
struct ConfigView<'a> {
    active_profiles: &'a [String],
    profiles: BTreeMap<&'a str, &'a BrokerConfig>,
}

fn handle_config_command(config: &AppConfig, show: bool) -> SimCityResult<()> {
    if show {
        let view = ConfigView {
            active_profiles: config.active_profiles(),
            profiles: config.iter().collect(),
        };
        let rendered = toml::to_string_pretty(&view).map_err(|e| ConfigError::InvalidValue {
            key: "mqtt".to_string(),
            message: e.to_string(),
        })?;
        println!("{rendered}");
    }

    info!(
        primary = config.primary_name(),
        profiles = config.active_profiles().len(),
        "Configuration validation complete"
    );
    Ok(())
}

fn select_connector<'a>(
    set: &'a ConnectorSet,
    profile: Option<&str>,
) -> SimCityResult<&'a Arc<MqttConnector>> {
    match profile {
        Some(name) => Ok(set.require(name)?),
        None => set
            .primary()
            .ok_or(SimCityError::Config(ConfigError::NoActiveProfiles)),
    }
}

async fn run_check(
    config: &AppConfig,
    profile: Option<String>,
    timeout: Duration,
) -> SimCityResult<()> {
    let set = ConnectorSet::from_config(config, &RandomClientId);
    let names: Vec<String> = match profile {
        Some(name) => {
            set.require(&name)?;
            vec![name]
        }
        None => set.names().map(str::to_string).collect(),
    };

    let mut failures = 0usize;
    for name in &names {
        let connector = set.require(name)?;
        connector.connect().await;

        let outcome = if connector.wait_for_connection(timeout).await {
            let client_id = connector.client_id().to_string();
            let topic = build_topic(&connector.config().base_topic, &["test", client_id.as_str()])?;
            let publisher = MqttPublisher::new(Arc::clone(connector));
            let result = publisher
                .publish_json_checked(
                    &topic,
                    &serde_json::json!({ "check": client_id }),
                    connector.default_qos(),
                    timeout,
                )
                .await?;
            println!(
                "{name}: {} on {} after {} ms",
                result.outcome.label(),
                result.topic,
                result.elapsed.as_millis()
            );
            result.outcome
        } else {
            println!(
                "{name}: not connected to {} within {} ms (state: {})",
                connector.config().address(),
                timeout.as_millis(),
                connector.state().label()
            );
            PublishOutcome::NotConnected
        };

        connector.disconnect().await;
        if outcome != PublishOutcome::Confirmed {
            failures += 1;
        }
    }

    if failures > 0 {
        return Err(SimCityError::check_failed(format!(
            "{failures} of {} profiles failed",
            names.len()
        )));
    }
    Ok(())
}

async fn run_listen(
    config: &AppConfig,
    profile: Option<String>,
    segments: Vec<String>,
) -> SimCityResult<()> {
    let set = ConnectorSet::from_config(config, &RandomClientId);
    let connector = select_connector(&set, profile.as_deref())?;
    let filter = build_topic(&connector.config().base_topic, &segments)?;

    let mut messages = connector.messages();
    connector.connect().await;
    if !connector.wait_for_connection(Duration::from_secs(10)).await {
        connector.disconnect().await;
        return Err(SimCityError::check_failed(format!(
            "could not connect to {}",
            connector.config().address()
        )));
    }
    connector.subscribe(&filter, connector.default_qos()).await?;
    info!(filter = %filter, "Listening, press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            received = messages.recv() => match received {
                Ok(message) => {
                    println!("{} {}", message.topic, String::from_utf8_lossy(&message.payload));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Listener fell behind, messages dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    connector.disconnect().await;
    Ok(())
}
