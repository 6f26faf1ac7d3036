//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, time::Duration};

use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::chain::ContractAbi;

/// Module address of the deployed launchpad contract.
pub const DEFAULT_MODULE_ADDRESS: &str =
    "0x170518deafae63b378f1deb898d69e2e22b1d5e40b50a45f85ceaf1175de2e2d";

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory of the document store.
    pub store_root: PathBuf,
    /// HTTP bind address, e.g. `127.0.0.1:7777`.
    pub bind_http: String,
    /// Pinata API bearer token; pinning fails without it.
    pub pinata_jwt: Option<String>,
    pub pinata_api_url: Url,
    /// Public gateway prefix used to build retrieval URLs.
    pub gateway_url: Url,
    /// Signing relay standing in for the user's wallet.
    pub wallet_url: Option<Url>,
    pub aptos_node_url: Url,
    /// Account the relay signs for.
    pub sender_address: Option<String>,
    pub module_address: String,
    pub module_name: String,
    pub contract_abi: ContractAbi,
    /// Upper bound on every outbound network call.
    pub request_timeout: Duration,
    /// Length of the mint window opened when a collection is created.
    pub mint_window: Duration,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let store_root = PathBuf::from(env::var("STORE_ROOT").context("STORE_ROOT")?);
        let bind_http = env::var("BIND_HTTP").context("BIND_HTTP")?;
        let pinata_jwt = non_empty("PINATA_JWT");
        let pinata_api_url = url_or("PINATA_API_URL", "https://api.pinata.cloud")?;
        let gateway_url = url_or("GATEWAY_URL", "https://gateway.pinata.cloud/ipfs")?;
        let wallet_url = non_empty("WALLET_URL")
            .map(|s| Url::parse(&s).with_context(|| format!("WALLET_URL={s}")))
            .transpose()?;
        let aptos_node_url = url_or("APTOS_NODE_URL", "https://fullnode.testnet.aptoslabs.com")?;
        let sender_address = non_empty("SENDER_ADDRESS");
        let module_address =
            non_empty("MODULE_ADDRESS").unwrap_or_else(|| DEFAULT_MODULE_ADDRESS.into());
        let module_name = non_empty("MODULE_NAME").unwrap_or_else(|| "poap_launchpad".into());
        let contract_abi = match non_empty("CONTRACT_ABI") {
            Some(s) => s.parse().map_err(|e: String| anyhow!(e))?,
            None => ContractAbi::Launchpad,
        };
        let request_timeout = Duration::from_secs(secs_or("REQUEST_TIMEOUT_SECS", 30)?);
        let mint_window = Duration::from_secs(secs_or("MINT_WINDOW_SECS", 24 * 60 * 60)?);
        Ok(Self {
            store_root,
            bind_http,
            pinata_jwt,
            pinata_api_url,
            gateway_url,
            wallet_url,
            aptos_node_url,
            sender_address,
            module_address,
            module_name,
            contract_abi,
            request_timeout,
            mint_window,
        })
    }
}

/// Read a variable, treating an empty value as absent.
fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn url_or(key: &str, default: &str) -> Result<Url> {
    let raw = non_empty(key).unwrap_or_else(|| default.to_string());
    Url::parse(&raw).with_context(|| format!("{key}={raw}"))
}

fn secs_or(key: &str, default: u64) -> Result<u64> {
    match non_empty(key) {
        Some(s) => {
            let secs: u64 = s.parse().with_context(|| format!("{key}={s}"))?;
            if secs == 0 {
                return Err(anyhow!("{key} must be positive"));
            }
            Ok(secs)
        }
        None => Ok(default),
    }
}
