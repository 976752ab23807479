//! Network configuration, keypair management and the pools file

use anyhow::{Context, Result};
use interaction_model::{BridgeSpec, Config, Env, PoolSpec, TokenSpec};
use serde::{Deserialize, Serialize};
use solana_sdk::{
    pubkey::Pubkey,
    signature::{Keypair, Signer},
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_POOLS_FILE: &str = "~/.config/tidepool/pools.toml";
pub const DEFAULT_STORE_DIR: &str = "~/.config/tidepool/store";

pub struct NetworkConfig {
    pub env: Env,
    pub rpc_url: String,
    pub ws_url: String,
    pub keypair: Keypair,
}

impl NetworkConfig {
    pub fn new(network: &str, rpc_url: Option<String>, keypair_path: Option<PathBuf>) -> Result<Self> {
        let env: Env = network
            .parse()
            .with_context(|| format!("Unknown network: {}. Use localnet, devnet, or mainnet-beta", network))?;
        let (rpc_url, ws_url) = match rpc_url {
            Some(url) => {
                let ws_url = url.replacen("http", "ws", 1);
                (url, ws_url)
            }
            None => default_urls(env)?,
        };

        let keypair_path = match keypair_path {
            Some(path) => path,
            None => default_keypair_path()?,
        };
        let keypair = load_keypair(&keypair_path)?;

        Ok(Self {
            env,
            rpc_url,
            ws_url,
            keypair,
        })
    }

    pub fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }
}

fn default_urls(env: Env) -> Result<(String, String)> {
    Ok(match env {
        Env::Local => (
            "http://127.0.0.1:8899".to_string(),
            "ws://127.0.0.1:8900".to_string(),
        ),
        Env::Devnet => (
            "https://api.devnet.solana.com".to_string(),
            "wss://api.devnet.solana.com".to_string(),
        ),
        Env::Mainnet => (
            "https://api.mainnet-beta.solana.com".to_string(),
            "wss://api.mainnet-beta.solana.com".to_string(),
        ),
        Env::Custom => anyhow::bail!("The custom network needs an explicit --url"),
    })
}

/// Keypair from the Solana CLI config, falling back to its default location
fn default_keypair_path() -> Result<PathBuf> {
    if let Some(config_file) = solana_cli_config::CONFIG_FILE.as_ref() {
        if let Ok(cli_config) = solana_cli_config::Config::load(config_file) {
            return Ok(PathBuf::from(cli_config.keypair_path));
        }
    }
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config/solana/id.json"))
}

/// Load a keypair from a JSON file
fn load_keypair(path: &Path) -> Result<Keypair> {
    if !path.exists() {
        anyhow::bail!(
            "Keypair file not found: {}\n\
             Create one with: solana-keygen new --outfile {}",
            path.display(),
            path.display()
        );
    }

    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read keypair file: {}", path.display()))?;

    let bytes: Vec<u8> = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse keypair JSON: {}", path.display()))?;

    Keypair::from_bytes(&bytes)
        .with_context(|| format!("Invalid keypair data in: {}", path.display()))
}

/// Expand `~` and environment variables in a path argument
pub fn expand_path(path: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(path).with_context(|| format!("Cannot expand path: {}", path))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

// ============================================================================
// Pools file
// ============================================================================

/// Tokens, pools and bridges of one deployment, as written in `pools.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub token_account_program: String,
    #[serde(default, rename = "token")]
    pub tokens: Vec<TokenSpec>,
    #[serde(default, rename = "pool")]
    pub pools: Vec<PoolSpec>,
    #[serde(default, rename = "bridge")]
    pub bridges: Vec<BridgeSpec>,
}

impl AppConfig {
    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse pools file")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read pools file: {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("Invalid pools file: {}", path.display()))
    }

    /// Validated model configuration for `env`
    pub fn into_config(self, env: Env) -> Result<Config> {
        let config = Config {
            env,
            tokens: self.tokens.into_iter().map(Arc::new).collect(),
            pools: self.pools,
            bridges: self.bridges,
            token_account_program: self.token_account_program,
        };
        config.validate().context("Inconsistent pools file")?;
        Ok(config)
    }
}
