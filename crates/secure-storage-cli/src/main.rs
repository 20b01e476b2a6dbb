//! CLI entry point for secure-storage.
//!
//! This binary provides the `securestore` command: one subcommand per
//! storage operation, plus backup export and passcode setup.

mod cli;
mod config;
mod terminal;

use std::io::{self, Read};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use secure_storage::crypto;
use secure_storage::keychain;
use secure_storage::{EntryStore, SecureStorage};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::config::CliConfig;
use crate::terminal::{PasscodeSource, TerminalAuthenticator};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // A missing `.env` is not an error.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(if cli.verbose { "debug" } else { "warn" });

    let config = CliConfig::load(&cli.config)?;

    // Passcode setup needs no store.
    if let Commands::SetPasscode = cli.command {
        return cmd_set_passcode().await;
    }

    let storage = open_storage(&cli, config)?;
    execute(&storage, &cli).await
}

async fn execute(storage: &SecureStorage, cli: &Cli) -> Result<()> {
    let opts = cli.options.to_store_options();

    match &cli.command {
        Commands::Set { key, value } => {
            let value = match value {
                Some(v) => v.clone(),
                None => read_stdin_value().await?,
            };
            storage
                .set_item(key, &value, &opts)
                .await
                .with_context(|| format!("failed to store {key}"))?;
            info!(%key, "stored");
        }
        Commands::Get { key } => {
            let value = storage
                .get_item(key, &opts)
                .await
                .with_context(|| format!("failed to read {key}"))?;
            println!("{value}");
        }
        Commands::Remove { key } => {
            storage
                .remove_item(key, &opts)
                .await
                .with_context(|| format!("failed to remove {key}"))?;
            info!(%key, "removed");
        }
        Commands::Keys => {
            for key in storage.get_all_keys(&opts).await? {
                println!("{key}");
            }
        }
        Commands::CanAuth => {
            println!("{}", storage.can_check_authentication(&opts));
        }
        Commands::Biometry => match storage.get_supported_biometry_type() {
            Some(biometry) => println!("{biometry}"),
            None => println!("none"),
        },
        Commands::Export { out } => {
            let records = storage.export_backup().await?;
            let json = serde_json::to_string_pretty(&records)?;
            match out {
                Some(path) => {
                    std::fs::write(path, json)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    info!(path = %path.display(), count = records.len(), "backup exported");
                }
                None => println!("{json}"),
            }
        }
        Commands::SetPasscode => cmd_set_passcode().await?,
    }

    Ok(())
}

fn open_storage(cli: &Cli, config: CliConfig) -> Result<SecureStorage> {
    let db_path = config.db_path(cli.db.as_deref());
    let data_dir = db_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| config.data_dir());

    let store = EntryStore::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    let custody = keychain::platform_keychain(&data_dir);

    let authenticator = TerminalAuthenticator::new(
        config.device.capabilities(),
        config.device.passcode()?,
        PasscodeSource::from_env(),
    );

    let storage = SecureStorage::new(config.store, store, custody.as_ref(), Arc::new(authenticator))
        .context("failed to initialise secure storage")?;
    info!(path = %db_path.display(), "store opened");
    Ok(storage)
}

// ---------------------------------------------------------------------------
// Subcommand: set-passcode
// ---------------------------------------------------------------------------

async fn cmd_set_passcode() -> Result<()> {
    let source = PasscodeSource::from_env();
    let passcode = source
        .read("New passcode")
        .await?
        .context("passcode must not be empty")?;

    if let PasscodeSource::Stdin = source {
        let confirm = source.read("Confirm passcode").await?.unwrap_or_default();
        anyhow::ensure!(confirm == passcode, "passcodes do not match");
    }

    let hash = tokio::task::spawn_blocking(move || crypto::hash_passcode(passcode.as_bytes()))
        .await??;

    println!("# add to the [device] section of securestore.toml");
    println!("passcode_hash = \"{}\"", hash.encode());
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn read_stdin_value() -> Result<String> {
    let value = tokio::task::spawn_blocking(|| {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf).map(|_| buf)
    })
    .await?
    .context("failed to read value from stdin")?;

    Ok(value.strip_suffix('\n').unwrap_or(&value).to_string())
}

/// Initialize the tracing subscriber for structured logging on stderr.
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();
}
