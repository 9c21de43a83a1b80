//! Operator tool for the usage ledger.
//!
//! ```text
//! foodsense-admin usage <subject-id>
//! foodsense-admin set-tier <subject-id> <guest|free|paid>
//! ```

use clap::{Parser, Subcommand};
use foodsense::quota::{QuotaLedger, RedisLedger, Tier, TierPolicy};
use foodsense::ServiceConfig;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Inspect and adjust per-subject scan quotas.
#[derive(Parser, Debug)]
#[command(name = "foodsense-admin")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Redis URL (overrides the config file).
    #[arg(long, env = "FOODSENSE_REDIS_URL")]
    redis_url: Option<String>,

    /// Path to configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show a subject's tier and usage for the current month.
    Usage {
        /// Subject identifier.
        subject_id: String,
    },
    /// Set a subject's tier.
    SetTier {
        /// Subject identifier.
        subject_id: String,
        /// New tier (guest, free or paid).
        tier: Tier,
    },
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let mut config = match cli.config {
        Some(ref path) => ServiceConfig::from_file(path)?,
        None => ServiceConfig::default(),
    };
    if let Some(redis_url) = cli.redis_url {
        config.quota.redis_url = redis_url;
    }

    let policy = TierPolicy {
        guest_limit: config.quota.guest_limit,
        free_limit: config.quota.free_limit,
    };
    let ledger =
        RedisLedger::connect(&config.quota.redis_url, &config.quota.key_prefix, policy).await?;

    match cli.command {
        Command::Usage { subject_id } => match ledger.usage(&subject_id).await? {
            Some(record) => {
                let limit = policy
                    .limit(record.tier)
                    .map_or_else(|| "unlimited".to_string(), |limit| limit.to_string());
                println!(
                    "{subject_id}: tier={} period={} count={} limit={limit}",
                    record.tier.as_str(),
                    record.period,
                    record.count
                );
            }
            None => println!("{subject_id}: no usage recorded"),
        },
        Command::SetTier { subject_id, tier } => {
            ledger.set_tier(&subject_id, tier).await?;
            println!("{subject_id}: tier set to {}", tier.as_str());
        }
    }

    Ok(())
}
