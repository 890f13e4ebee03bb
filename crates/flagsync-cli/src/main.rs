//! flagsync-watch: stream a feature service and print changes.
//!
//! Connects, waits for the first data, prints every known feature and then
//! reports changes to the `--watch` keys until interrupted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use flagsync::{
    ClientConfig, EvaluationContext, FeatureClient, FeatureRecord, LoggingCollector, Transport,
};
use miette::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Parse the transport name.
fn parse_transport(s: &str) -> Result<Transport, String> {
    match s.to_lowercase().as_str() {
        "sse" | "eventsource" => Ok(Transport::Sse),
        "ws" | "websocket" => Ok(Transport::WebSocket),
        _ => Err(format!("invalid transport '{}', expected sse or websocket", s)),
    }
}

#[derive(Parser)]
#[command(name = "flagsync-watch")]
#[command(about = "Watch feature flags from a flagsync feature service", long_about = None)]
struct Cli {
    /// Feature service base URL
    #[arg(long, env = "FLAGSYNC_SERVER")]
    server: String,

    /// Client API key
    #[arg(long, env = "FLAGSYNC_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Streaming transport (sse or websocket)
    #[arg(long, env = "FLAGSYNC_TRANSPORT", value_parser = parse_transport, default_value = "sse")]
    transport: Transport,

    /// Seconds to wait for the first data
    #[arg(long, default_value = "10")]
    wait_timeout: u64,

    /// Feature keys to report changes for
    #[arg(long, value_delimiter = ',')]
    watch: Vec<String>,

    /// Identity key used to evaluate rollout strategies
    #[arg(long, env = "FLAGSYNC_USER_KEY")]
    user_key: Option<String>,

    /// Country attribute used to evaluate rollout strategies
    #[arg(long)]
    country: Option<String>,

    /// Log an analytics action for every feature after the initial listing
    #[arg(long)]
    log_action: Option<String>,

    /// Log filter when RUST_LOG is unset
    #[arg(long, default_value = "flagsync=info")]
    log_level: String,
}

impl Cli {
    fn context(&self) -> Option<EvaluationContext> {
        if self.user_key.is_none() && self.country.is_none() {
            return None;
        }
        let mut context = EvaluationContext::new();
        if let Some(ref key) = self.user_key {
            context = context.with_identity_key(key.clone());
        }
        if let Some(ref country) = self.country {
            context = context.with_country(country.clone());
        }
        Some(context)
    }

    fn config(&self) -> Result<ClientConfig> {
        let mut builder = ClientConfig::builder(&self.server, &self.api_key)
            .transport(self.transport)
            .wait_for_data(Duration::from_secs(self.wait_timeout));
        if let Some(context) = self.context() {
            builder = builder.default_context(context);
        }
        builder.build().map_err(|e| miette::miette!("{}", e))
    }
}

fn describe(record: &FeatureRecord) -> String {
    format!(
        "{} ({}, v{}) = {}{}",
        record.key,
        record.feature_type,
        record.version,
        record.value,
        if record.has_strategies() {
            format!(" [{} strategies]", record.strategies.len())
        } else {
            String::new()
        }
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let client = FeatureClient::connect(cli.config()?)
        .await
        .map_err(|e| miette::miette!("failed to connect: {}", e))?;

    for record in client.features() {
        println!("{}", describe(&record));
    }

    if let Some(ref action) = cli.log_action {
        client.add_analytics_collector(Arc::new(LoggingCollector));
        let report = client.log_analytics_event(action, BTreeMap::new()).await;
        if !report.is_success() {
            return Err(miette::miette!(
                "analytics collectors failed: {}",
                report.failed().join(", ")
            ));
        }
    }

    for key in &cli.watch {
        client.add_notifier_feature(key.clone(), {
            let key = key.clone();
            move |record: Option<&FeatureRecord>| match record {
                Some(record) => println!("changed: {}", describe(record)),
                None => println!("deleted: {}", key),
            }
        });
    }

    client.on_connection_error(|e| {
        eprintln!("connection closed by server: {}", e);
    });

    if cli.watch.is_empty() {
        client.close().await;
        return Ok(());
    }

    info!(keys = ?cli.watch, "watching for changes, press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("failed to listen for ctrl-c: {}", e))?;
    info!("received shutdown signal");

    client.close().await;

    if let Some(e) = client.connection_error() {
        return Err(miette::miette!("{}", e));
    }
    Ok(())
}
