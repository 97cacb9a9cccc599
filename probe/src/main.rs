//! Wavecall Probe - diagnostics for the call-signaling client
//!
//! This tool handles:
//! - TURN relay self-test against the configured ICE servers
//! - Listing the ICE servers a call would use
//! - Writing a starter client config
//! - Backend health check

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wavecall_core::config::SchemaConfig;
use wavecall_core::ice::DEFAULT_PROBE_TIMEOUT;
use wavecall_core::{probe_turn, ApiClient, ClientConfig, IceConfig};

/// Wavecall Probe CLI
#[derive(Parser)]
#[command(name = "wavecall-probe")]
#[command(about = "Diagnostics for Wavecall calls")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "wavecall.json")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that a TURN relay candidate can be gathered
    TurnTest {
        /// Seconds to wait for a relay candidate
        #[arg(long, default_value_t = DEFAULT_PROBE_TIMEOUT.as_secs())]
        timeout: u64,

        /// Use only the STUN servers (expects no relay)
        #[arg(long)]
        stun_only: bool,
    },

    /// Print the configured ICE servers
    IceServers,

    /// Write a config file with default ICE servers and table names
    InitConfig {
        /// Backend project URL
        #[arg(long)]
        url: String,

        /// Public anon key
        #[arg(long)]
        anon_key: String,

        /// Use the calls / webrtc_signals tables
        #[arg(long)]
        legacy_schema: bool,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Check that the backend auth endpoint answers
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "wavecall_probe=info,wavecall_core=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::TurnTest { timeout, stun_only } => {
            let config = ClientConfig::load(&cli.config)?;
            turn_test(&config, Duration::from_secs(timeout), stun_only).await?;
        }
        Commands::IceServers => {
            let config = ClientConfig::load(&cli.config)?;
            ice_servers(&config.ice);
        }
        Commands::InitConfig {
            url,
            anon_key,
            legacy_schema,
            force,
        } => {
            init_config(&cli.config, &url, &anon_key, legacy_schema, force)?;
        }
        Commands::Health => {
            let config = ClientConfig::load(&cli.config)?;
            health(&config).await?;
        }
    }

    Ok(())
}

async fn turn_test(config: &ClientConfig, timeout: Duration, stun_only: bool) -> anyhow::Result<()> {
    let ice = if stun_only {
        IceConfig::stun_only()
    } else {
        config.ice.clone()
    };

    tracing::info!(
        "Probing {} TURN server(s), timeout {}s",
        ice.turn_servers().count(),
        timeout.as_secs()
    );
    let probe = probe_turn(&ice, timeout).await?;

    if probe.reachable {
        println!(
            "TURN reachable: relay {} after {} ms",
            probe.relay_address.as_deref().unwrap_or("?"),
            probe.elapsed.as_millis()
        );
        Ok(())
    } else if stun_only {
        println!("No relay candidate (expected with --stun-only)");
        Ok(())
    } else {
        anyhow::bail!("No relay candidate within {}s", timeout.as_secs())
    }
}

fn ice_servers(ice: &IceConfig) {
    println!("=== ICE servers (pool size {}) ===", ice.ice_candidate_pool_size);
    for server in &ice.servers {
        let kind = if server.is_turn() { "TURN" } else { "STUN" };
        match server.username {
            Some(ref username) => println!("{} {} (user {})", kind, server.urls.join(", "), username),
            None => println!("{} {}", kind, server.urls.join(", ")),
        }
    }
}

fn init_config(path: &Path, url: &str, anon_key: &str, legacy_schema: bool, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    let mut config = ClientConfig::new(url, anon_key);
    if legacy_schema {
        config.schema = SchemaConfig::legacy();
    }
    config.validate()?;
    config.save(path)?;

    println!("Wrote {}", path.display());
    println!("{}", serde_json::to_string_pretty(&config.schema)?);
    Ok(())
}

async fn health(config: &ClientConfig) -> anyhow::Result<()> {
    config.validate()?;
    let api = ApiClient::new(config)?;

    if api.check_health().await? {
        println!("Backend at {} is healthy", config.http_url());
        Ok(())
    } else {
        anyhow::bail!("Backend at {} did not answer", config.http_url())
    }
}
