//! `bunkerd` — the bunker's command-line front end.
//!
//! Three commands: `setup` registers an admin pubkey, `add` stores an
//! encrypted key entry, `start` runs the daemon. Exit status 0 on success,
//! 1 on any fatal error (bad nsec on add, config read failure, liveness
//! timeout).

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use bunker_core::config::{ConfigStore, DEFAULT_CONFIG_PATH};
use bunker_core::identity::{Identity, PublicKey};
use bunker_core::keys::StoredKey;
use bunker_daemon::daemon::{self, StartOptions};

/// Comma-separated admin pubkeys merged with `--admin`.
const ADMIN_ENV: &str = "ADMIN_NPUBS";

#[derive(Parser)]
#[command(
    name = "bunkerd",
    version,
    about = "Remote signing bunker — custodies keys, signs on approval"
)]
struct Cli {
    /// Path of the configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive first-run setup: capture an admin pubkey.
    Setup,
    /// Store an encrypted key entry under a logical name.
    Add {
        /// Logical name for the key.
        #[arg(long)]
        name: String,
    },
    /// Run the bunker.
    Start {
        /// Log at debug level.
        #[arg(long)]
        verbose: bool,
        /// Whitelist a stored key for unlocking this run (repeatable).
        #[arg(long = "key")]
        key: Vec<String>,
        /// Additional admin pubkey (repeatable; merged with ADMIN_NPUBS).
        #[arg(long = "admin")]
        admin: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Setup => cmd_setup(&cli.config).await,
        Command::Add { name } => cmd_add(&cli.config, &name).await,
        Command::Start {
            verbose,
            key,
            admin,
        } => cmd_start(cli.config, verbose, key, admin).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn cmd_setup(config_path: &Path) -> Result<()> {
    let store = ConfigStore::new(config_path);
    // Ensures the default document (with a fresh bunker identity) exists.
    store.load().await.context("config read failed")?;

    let raw = prompt("Admin pubkey (hex): ")?;
    let pubkey: PublicKey = raw.parse().context("not a valid pubkey")?;

    let config = store
        .update(|c| {
            if !c.admins.contains(&pubkey) {
                c.admins.push(pubkey);
            }
        })
        .await
        .context("config write failed")?;

    let admin = config
        .admin_identity()
        .context("stored bunker secret is invalid")?;
    println!("Admin registered.");
    println!(
        "Connection string: {}",
        config.connection_string(&admin.public_key())
    );
    Ok(())
}

async fn cmd_add(config_path: &Path, name: &str) -> Result<()> {
    let store = ConfigStore::new(config_path);
    let config = store.load().await.context("config read failed")?;
    if config.keys.contains_key(name) {
        bail!("key already exists: {name}");
    }

    let material = prompt("Secret key (hex): ")?;
    let identity = Identity::from_secret_hex(&material).context("bad nsec")?;
    let passphrase = prompt("Passphrase: ")?;
    if passphrase.is_empty() {
        bail!("passphrase must not be empty");
    }

    let entry = StoredKey::encrypted(&identity, &passphrase)
        .context("envelope encryption failed")?;
    let pubkey = entry.pubkey;
    store
        .update(|c| {
            c.keys.insert(name.to_owned(), entry);
        })
        .await
        .context("config write failed")?;

    println!("Stored key '{name}' ({pubkey}).");
    Ok(())
}

async fn cmd_start(
    config_path: PathBuf,
    verbose: bool,
    keys: Vec<String>,
    admin_flags: Vec<String>,
) -> Result<()> {
    let default_filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let mut admins = Vec::new();
    for raw in admin_flags.iter().chain(env_admins().iter()) {
        let pubkey: PublicKey = raw
            .parse()
            .with_context(|| format!("bad admin pubkey: {raw}"))?;
        if !admins.contains(&pubkey) {
            admins.push(pubkey);
        }
    }

    daemon::run(StartOptions {
        config_path,
        keys,
        admins,
    })
    .await
}

fn env_admins() -> Vec<String> {
    std::env::var(ADMIN_ENV)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_owned())
}
