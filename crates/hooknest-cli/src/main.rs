//! hooknest CLI - run and manage the webhook receiver

use anyhow::Result;
use clap::{Parser, Subcommand};
use hooknest_core::{ConfigSource, Hooknest, normalize, resolve_config};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "hooknest")]
#[command(about = "A programmable webhook receiver, recorder, and replayer")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve,

    /// Mint new webhook endpoints and print their ids
    Generate {
        /// How many endpoints to create
        #[arg(long, default_value_t = 1)]
        count: usize,

        /// Retention in hours
        #[arg(long, default_value_t = 24.0)]
        hours: f64,
    },

    /// Load the config, normalize it, and report the effective settings
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = resolve_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => {
            // A file-backed config is watched for hot reload; otherwise the
            // key-value collaborator is polled.
            let source = match &cli.config {
                Some(path) => ConfigSource::File(path.clone()),
                None => ConfigSource::KeyValue,
            };
            let hooknest = Arc::new(Hooknest::from_config(config).await?);
            for (id, record) in hooknest.registry().list() {
                tracing::info!(webhook = %id, expires_at = %record.expires_at, "Endpoint ready");
            }
            hooknest_api::serve(hooknest, source).await?;
        }

        Commands::Generate { count, hours } => {
            let hooknest = Hooknest::from_config(config).await?;
            let ids = hooknest.generate_webhooks(count, hours).await?;
            for id in ids {
                println!("{}", id);
            }
        }

        Commands::Validate => {
            let snapshot = normalize(&config.receiver);
            println!("Config OK");
            println!("  url_count:             {}", snapshot.url_count);
            println!("  retention_hours:       {}", snapshot.retention_hours);
            println!("  max_payload_bytes:     {}", snapshot.max_payload_bytes);
            println!("  rate_limit_per_minute: {}", snapshot.rate_limit_per_minute);
            println!(
                "  auth:                  {}",
                if snapshot.auth_key.is_empty() {
                    "disabled"
                } else {
                    "bearer token required"
                }
            );
            println!(
                "  forward_url:           {}",
                snapshot.forward_url.as_deref().unwrap_or("(none)")
            );
            println!(
                "  signature_provider:    {}",
                snapshot
                    .signature
                    .as_ref()
                    .map(|s| s.provider.as_str())
                    .unwrap_or("(none)")
            );
            println!(
                "  alert_on:              {}",
                serde_json::to_string(&snapshot.alert_on)?
            );
        }
    }

    Ok(())
}
