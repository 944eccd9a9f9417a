//! Synheart Privacy Engine CLI
//!
//! Local-first encrypted storage for wellness data.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use synheart_privacy_engine::{
    config::Config,
    engine::{Collaborators, PrivacyEngine},
    lifecycle::ExportFormat,
    privacy::{AggregationServer, MemoryAggregationServer},
    records::{CheckIn, JournalEntry},
    retry::RemoteEffect,
    storage::{FileLocalStore, MemoryRemoteStore, RemoteStore},
    transparency::create_shared_log_with_persistence,
    ConsentRecord, PRIVACY_DECLARATION, VERSION,
};

#[cfg(feature = "cloud")]
use synheart_privacy_engine::cloud::{CloudClient, CloudConfig};

#[derive(Parser)]
#[command(name = "synheart-privacy")]
#[command(author = "Synheart")]
#[command(version = VERSION)]
#[command(about = "Local-first privacy engine for personal wellness data", long_about = None)]
struct Cli {
    /// Account the data belongs to
    #[arg(long, global = true, env = "SYNHEART_ACCOUNT", default_value = "local")]
    account: String,

    /// Secret that unlocks the vault
    #[arg(long, global = true, env = "SYNHEART_SECRET", hide_env_values = true)]
    secret: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display privacy declaration
    Privacy,

    /// Show configuration
    Config,

    /// Show privacy activity and consent
    Status,

    /// Write an encrypted journal entry
    Journal {
        /// Entry text
        text: String,
    },

    /// Record an encrypted daily check-in
    CheckIn {
        /// Mood from 1 to 5
        #[arg(long)]
        mood: u8,

        /// Energy from 1 to 5
        #[arg(long)]
        energy: u8,

        /// Hours slept last night
        #[arg(long)]
        sleep: Option<f32>,

        /// Tags for this check-in (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Show or change consent
    Consent {
        /// Sync encrypted copies to the cloud
        #[arg(long)]
        cloud_sync: Option<bool>,

        /// Contribute noised insights to population statistics
        #[arg(long)]
        aggregation: Option<bool>,

        /// Collect data from connected devices
        #[arg(long)]
        device_data: Option<bool>,

        /// Share insights with a coach
        #[arg(long)]
        coach: Option<bool>,
    },

    /// Export all local data in readable form
    Export {
        /// Export format (json, jsonl, csv or document)
        #[arg(long, default_value = "json")]
        format: ExportFormat,

        /// Output directory for the export
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Permanently delete all local and cloud data
    Delete {
        /// Must be exactly "DELETE ALL MY DATA"
        #[arg(long)]
        confirm: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "synheart_privacy_engine=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("Failed to load configuration")?;

    match cli.command {
        Commands::Privacy => {
            println!("{PRIVACY_DECLARATION}");
            Ok(())
        }
        Commands::Config => cmd_config(&config),
        Commands::Status => cmd_status(&config, &cli.account, cli.secret.as_deref()),
        Commands::Journal { text } => {
            let engine = open_engine(&config, &cli.account, cli.secret.as_deref())?;
            let stored = engine.store_record(&JournalEntry::new(text)).await?;
            println!("Journal entry saved ({})", stored.id);
            print_remote("Cloud copy", &stored.remote);
            finish(&engine);
            Ok(())
        }
        Commands::CheckIn {
            mood,
            energy,
            sleep,
            tags,
        } => {
            let engine = open_engine(&config, &cli.account, cli.secret.as_deref())?;
            let mut check_in = CheckIn::new(mood, energy);
            check_in.sleep_hours = sleep;
            check_in.tags = tags;
            let stored = engine.store_record(&check_in).await?;
            println!("Check-in saved ({})", stored.id);
            print_remote("Cloud copy", &stored.remote);
            finish(&engine);
            Ok(())
        }
        Commands::Consent {
            cloud_sync,
            aggregation,
            device_data,
            coach,
        } => {
            let engine = open_engine(&config, &cli.account, cli.secret.as_deref())?;
            cmd_consent(&engine, cloud_sync, aggregation, device_data, coach).await?;
            finish(&engine);
            Ok(())
        }
        Commands::Export { format, output } => {
            let engine = open_engine(&config, &cli.account, cli.secret.as_deref())?;
            cmd_export(&engine, &config, format, output)?;
            finish(&engine);
            Ok(())
        }
        Commands::Delete { confirm } => {
            let engine = open_engine(&config, &cli.account, cli.secret.as_deref())?;
            cmd_delete(&engine, &confirm).await
        }
    }
}

fn remote_store(config: &Config) -> anyhow::Result<Arc<dyn RemoteStore>> {
    #[cfg(feature = "cloud")]
    {
        if let Ok(cloud) = CloudConfig::from_env() {
            let client = CloudClient::new(cloud, config.retry.attempt_timeout)?;
            return Ok(Arc::new(client));
        }
        eprintln!("Warning: SYNHEART_CLOUD_URL not set; using an in-process cloud store");
    }

    #[cfg(not(feature = "cloud"))]
    let _ = config;

    Ok(Arc::new(MemoryRemoteStore::new()))
}

fn aggregation_server(config: &Config) -> anyhow::Result<Arc<dyn AggregationServer>> {
    #[cfg(feature = "cloud")]
    {
        if let Ok(cloud) = CloudConfig::from_env() {
            let client = CloudClient::new(cloud, config.retry.attempt_timeout)?;
            return Ok(Arc::new(client));
        }
    }

    #[cfg(not(feature = "cloud"))]
    let _ = config;

    Ok(Arc::new(MemoryAggregationServer::new()))
}

fn open_engine(config: &Config, account: &str, secret: Option<&str>) -> anyhow::Result<PrivacyEngine> {
    let Some(secret) = secret else {
        bail!("A secret is required: pass --secret or set SYNHEART_SECRET");
    };

    config
        .ensure_directories()
        .context("Could not create data directories")?;

    let local = FileLocalStore::open(config.vault_path())?;
    let engine = PrivacyEngine::new(
        config,
        account,
        Collaborators {
            local: Arc::new(local),
            remote: remote_store(config)?,
            server: aggregation_server(config)?,
        },
        create_shared_log_with_persistence(config.transparency_path()),
    );

    engine
        .unlock(secret)
        .context("Could not unlock the vault (wrong secret or account?)")?;
    Ok(engine)
}

fn finish(engine: &PrivacyEngine) {
    if let Err(e) = engine.transparency().save() {
        eprintln!("Warning: Could not save transparency log: {e}");
    }
    engine.lock();
}

fn print_remote(label: &str, effect: &RemoteEffect) {
    match effect {
        RemoteEffect::NotRequired => {}
        RemoteEffect::Applied(count) => println!("{label}: done ({count})"),
        RemoteEffect::Pending(e) => println!("{label}: pending ({e})"),
    }
}

fn cmd_config(config: &Config) -> anyhow::Result<()> {
    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn cmd_status(config: &Config, account: &str, secret: Option<&str>) -> anyhow::Result<()> {
    println!("Synheart Privacy Engine Status");
    println!("==============================");
    println!();
    println!("Account: {account}");
    println!("Vault:   {:?}", config.vault_path());
    println!();

    if let Some(secret) = secret {
        let engine = open_engine(config, account, Some(secret))?;
        print_consent(&engine.consent().current());
        if engine.consent().has_pending_remote_purge() {
            println!("  A cloud deletion is still pending");
        }
        println!();
        println!("{}", engine.transparency().summary());
        engine.lock();
    } else {
        let log = create_shared_log_with_persistence(config.transparency_path());
        println!("Consent: locked (pass --secret to show)");
        println!();
        println!("{}", log.summary());
    }
    Ok(())
}

fn print_consent(consent: &ConsentRecord) {
    let on_off = |b: bool| if b { "on" } else { "off" };
    println!("Consent:");
    println!("  Cloud sync:            {}", on_off(consent.cloud_sync));
    println!("  Anonymous aggregation: {}", on_off(consent.anonymous_aggregation));
    println!("  Device data:           {}", on_off(consent.collect_device_data));
    println!("  Share with coach:      {}", on_off(consent.share_with_coach));
}

async fn cmd_consent(
    engine: &PrivacyEngine,
    cloud_sync: Option<bool>,
    aggregation: Option<bool>,
    device_data: Option<bool>,
    coach: Option<bool>,
) -> anyhow::Result<()> {
    if engine.consent().has_pending_remote_purge() && cloud_sync != Some(true) {
        let effect = engine.consent().retry_pending().await;
        print_remote("Queued cloud deletion", &effect);
    }

    let current = engine.consent().current();
    let requested = ConsentRecord {
        cloud_sync: cloud_sync.unwrap_or(current.cloud_sync),
        anonymous_aggregation: aggregation.unwrap_or(current.anonymous_aggregation),
        collect_device_data: device_data.unwrap_or(current.collect_device_data),
        share_with_coach: coach.unwrap_or(current.share_with_coach),
    };

    let update = engine.consent().update(requested).await?;
    if update.changed {
        println!("Consent updated.");
    }
    print_remote("Cloud deletion", &update.remote);

    println!();
    print_consent(&engine.consent().current());
    Ok(())
}

fn cmd_export(
    engine: &PrivacyEngine,
    config: &Config,
    format: ExportFormat,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let export_dir = output.unwrap_or_else(|| config.export_path.clone());
    std::fs::create_dir_all(&export_dir)
        .with_context(|| format!("Could not create {export_dir:?}"))?;

    let bundle = engine.lifecycle().export_all(format)?;
    let output_path = export_dir.join(format!(
        "export_{}.{}",
        chrono::Utc::now().format("%Y%m%d_%H%M%S"),
        format.extension()
    ));
    std::fs::write(&output_path, bundle)
        .with_context(|| format!("Could not write {output_path:?}"))?;

    println!("Exported to {output_path:?}");
    println!("This file is NOT encrypted. Store it somewhere safe.");
    Ok(())
}

async fn cmd_delete(engine: &PrivacyEngine, confirm: &str) -> anyhow::Result<()> {
    let report = engine.lifecycle().delete_everything(confirm).await?;

    match &report.local_error {
        Some(e) => {
            println!("Some local records could not be erased: {e}");
            println!("Run this command again to finish.");
        }
        None => println!("Deleted {} local record(s).", report.local_records_erased),
    }
    match &report.remote {
        RemoteEffect::Pending(e) => {
            println!("Cloud deletion could not be confirmed: {e}");
            println!("It stays queued and is retried by the next `consent` command.");
        }
        effect => print_remote("Cloud deletion", effect),
    }
    if report.is_complete() {
        println!("All data has been deleted.");
    }
    Ok(())
}
