//! Command line interface for the POAP launch service. Supports initialization,
//! launching event collections, minting, inspection, offline metadata
//! generation, registry audits, and serving the HTTP API.

mod allocator;
mod chain;
mod config;
mod error;
#[cfg(test)]
mod fakes;
mod launch;
mod metadata;
mod pinning;
mod record;
mod registry;
mod resolver;
mod server;
mod storage;

use std::{
    fs,
    net::SocketAddr,
    num::NonZeroU32,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use config::Settings;
use storage::Store;

use crate::{
    allocator::{Allocator, MintRequest},
    chain::{Contract, WalletClient},
    launch::{ImageSource, LaunchRequest},
    metadata::{MetadataRequest, Payload},
    pinning::PinataClient,
    server::AppState,
};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "spacemint",
    author,
    version,
    about = "Commemorative NFT collections for scheduled Spaces",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the document store at `STORE_ROOT`.
    Init,
    /// Serve the HTTP API on `BIND_HTTP`.
    Serve,
    /// Build, pin and register an event's collection.
    Launch {
        /// Event id; a random one is generated when omitted.
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        name: String,
        /// Space label shown in the collection descriptor.
        #[arg(long, default_value = "")]
        space: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Image URL embedded in the metadata.
        #[arg(long, conflicts_with = "image_file")]
        image: Option<String>,
        /// Local image to pin first.
        #[arg(long)]
        image_file: Option<PathBuf>,
        #[arg(long, allow_negative_numbers = true)]
        max_supply: i64,
    },
    /// Mint the next free (or a specific) index of an event.
    Mint {
        event_id: String,
        #[arg(long)]
        index: Option<u32>,
        /// Receiving account; defaults to `SENDER_ADDRESS`.
        #[arg(long)]
        recipient: Option<String>,
    },
    /// Print an event record.
    Show { event_id: String },
    /// Write the metadata files for an event to a directory without pinning.
    BuildMetadata {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        space: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "")]
        image: String,
        #[arg(long, allow_negative_numbers = true)]
        count: i64,
        /// Output directory, created if missing.
        #[arg(long)]
        out: PathBuf,
    },
    /// Check stored events for registry invariant violations.
    Audit {
        /// Check only this many events, picked at random.
        #[arg(long)]
        sample: Option<usize>,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    let store = Store::new(cfg.store_root.clone());
    match cli.command {
        Commands::Init => {
            store.init()?;
        }
        Commands::Serve => {
            store.init()?;
            let http_addr: SocketAddr = cfg.bind_http.as_str().parse()?;
            let state = app_state(&cfg, store)?;
            let shutdown = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            server::serve_http(http_addr, state, shutdown).await?;
        }
        Commands::Launch {
            id,
            name,
            space,
            description,
            image,
            image_file,
            max_supply,
        } => {
            let max_supply = supply(max_supply)?.get();
            let image = match (image, image_file) {
                (Some(url), _) => Some(ImageSource::Url(url)),
                (None, Some(path)) => Some(ImageSource::Upload(read_upload(&path)?)),
                (None, None) => None,
            };
            let state = app_state(&cfg, store)?;
            let record = state
                .launcher()
                .launch(LaunchRequest {
                    id,
                    name,
                    space_label: space,
                    description,
                    image,
                    max_supply,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&record.into_view())?);
        }
        Commands::Mint {
            event_id,
            index,
            recipient,
        } => {
            let state = app_state(&cfg, store)?;
            let alloc = Allocator::new(&state.store, &state.chain, &state.contract, state.submit_timeout);
            let receipt = alloc
                .mint(&MintRequest {
                    event_id,
                    index,
                    recipient,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        Commands::Show { event_id } => {
            let record = registry::load(&store, &event_id)?;
            println!("{}", serde_json::to_string_pretty(&record.into_view())?);
        }
        Commands::BuildMetadata {
            name,
            space,
            description,
            image,
            count,
            out,
        } => {
            let payloads = metadata::build(&MetadataRequest {
                name,
                space_label: space,
                description,
                image,
                count: supply(count)?,
            });
            fs::create_dir_all(&out).with_context(|| format!("creating {}", out.display()))?;
            for p in &payloads {
                fs::write(out.join(&p.filename), &p.bytes)?;
            }
            println!("wrote {} files to {}", payloads.len(), out.display());
        }
        Commands::Audit { sample } => {
            let report = registry::audit(&store, sample)?;
            for (id, violation) in &report.violations {
                println!("{id}: {violation:?}");
            }
            println!(
                "checked {} events, {} violations",
                report.checked,
                report.violations.len()
            );
            if !report.is_clean() {
                bail!("registry audit found {} violations", report.violations.len());
            }
        }
    }
    Ok(())
}

fn app_state(cfg: &Settings, store: Store) -> anyhow::Result<AppState<PinataClient, WalletClient>> {
    Ok(AppState {
        store,
        pinning: PinataClient::from_settings(cfg)?,
        chain: WalletClient::from_settings(cfg)?,
        contract: Contract::from_settings(cfg),
        submit_timeout: cfg.request_timeout,
        mint_window: cfg.mint_window,
    })
}

/// Supply counts outside `1..=MAX_SUPPLY` are a user error.
fn supply(n: i64) -> anyhow::Result<NonZeroU32> {
    Ok(metadata::supply(n)?)
}

fn read_upload(path: &Path) -> anyhow::Result<Payload> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload")
        .to_string();
    Ok(Payload { filename, bytes })
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let store_root = base_dir.join("spacemint-data");
    let mut content = String::new();
    content.push_str(&format!("STORE_ROOT={}\n", store_root.to_string_lossy()));
    content.push_str("BIND_HTTP=127.0.0.1:7777\n");
    content.push_str("PINATA_JWT=\n");
    content.push_str("PINATA_API_URL=https://api.pinata.cloud\n");
    content.push_str("GATEWAY_URL=https://gateway.pinata.cloud/ipfs\n");
    content.push_str("WALLET_URL=\n");
    content.push_str("APTOS_NODE_URL=https://fullnode.testnet.aptoslabs.com\n");
    content.push_str("SENDER_ADDRESS=\n");
    content.push_str(&format!("MODULE_ADDRESS={}\n", config::DEFAULT_MODULE_ADDRESS));
    content.push_str("MODULE_NAME=poap_launchpad\n");
    content.push_str("CONTRACT_ABI=launchpad\n");
    content.push_str("REQUEST_TIMEOUT_SECS=30\n");
    content.push_str("MINT_WINDOW_SECS=86400\n");
    fs::write(env_path, content)?;
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    run(cli).await
}
