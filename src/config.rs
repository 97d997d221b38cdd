//! Wallet configuration - constructed by the caller (CLI, UI host) and passed in.

use bitcoin::bip32::{ChildNumber, DerivationPath};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::core::paths::{derivation, env};
use crate::error::{Result, WalletError};
use crate::price::PriceSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network { #[default] Bitcoin, Testnet, Signet, Regtest }

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self { Network::Bitcoin => "bitcoin", Network::Testnet => "testnet", Network::Signet => "signet", Network::Regtest => "regtest" }
    }

    pub fn to_bitcoin(&self) -> bitcoin::Network {
        match self { Network::Bitcoin => bitcoin::Network::Bitcoin, Network::Testnet => bitcoin::Network::Testnet, Network::Signet => bitcoin::Network::Signet, Network::Regtest => bitcoin::Network::Regtest }
    }

    /// BIP44 coin type: 0 on mainnet, 1 on every test network.
    pub fn coin_type(&self) -> u32 {
        match self { Network::Bitcoin => 0, _ => 1 }
    }

    pub fn default_explorer_url(&self) -> &'static str {
        match self {
            Network::Bitcoin => "https://blockstream.info/api",
            Network::Testnet => "https://blockstream.info/testnet/api",
            Network::Signet => "https://mempool.space/signet/api",
            Network::Regtest => "http://127.0.0.1:3002",
        }
    }
}

impl FromStr for Network {
    type Err = WalletError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bitcoin" | "mainnet" | "main" => Ok(Network::Bitcoin),
            "testnet" | "test" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            other => Err(WalletError::Config(format!("unknown network: {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WalletConfig {
    pub network: Network,
    /// BIP84 account index (hardened)
    pub account: u32,
    /// Esplora base URL; network default when unset
    pub explorer_url: Option<String>,
    pub price_sources: Vec<PriceSource>,
    pub price_poll_interval: Duration,
    /// sat/vB used when the explorer has no fee estimate
    pub default_fee_rate: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            account: 0,
            explorer_url: None,
            price_sources: PriceSource::defaults(),
            price_poll_interval: Duration::from_secs(60),
            default_fee_rate: 10,
        }
    }
}

impl WalletConfig {
    pub fn new(network: Network) -> Self { Self { network, ..Default::default() } }
    pub fn mainnet() -> Self { Self::new(Network::Bitcoin) }
    pub fn testnet() -> Self { Self::new(Network::Testnet) }
    pub fn with_account(mut self, account: u32) -> Self { self.account = account; self }
    pub fn with_explorer(mut self, url: impl Into<String>) -> Self { self.explorer_url = Some(url.into()); self }
    pub fn with_price_sources(mut self, sources: Vec<PriceSource>) -> Self { self.price_sources = sources; self }
    pub fn with_price_poll_interval(mut self, interval: Duration) -> Self { self.price_poll_interval = interval; self }
    pub fn with_default_fee_rate(mut self, sat_per_vb: u64) -> Self { self.default_fee_rate = sat_per_vb; self }

    /// Explorer base URL without a trailing slash.
    pub fn explorer_url(&self) -> String {
        self.explorer_url
            .as_deref()
            .unwrap_or(self.network.default_explorer_url())
            .trim_end_matches('/')
            .to_string()
    }

    /// `m/84'/coin'/account'`
    pub fn account_path(&self) -> Result<DerivationPath> {
        let hardened = |idx: u32| {
            ChildNumber::from_hardened_idx(idx).map_err(|e| WalletError::Config(format!("derivation index {}: {}", idx, e)))
        };
        Ok(DerivationPath::from(vec![
            hardened(derivation::PURPOSE)?,
            hardened(self.network.coin_type())?,
            hardened(self.account)?,
        ]))
    }

    /// Build from `BEESIGNER_*` environment variables; unset values keep their defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(env::NETWORK) {
            Ok(net) => Self::new(net.parse()?),
            Err(_) => Self::default(),
        };
        if let Ok(account) = std::env::var(env::ACCOUNT) {
            config.account = account
                .trim()
                .parse()
                .map_err(|_| WalletError::Config(format!("{}: not a number: {}", env::ACCOUNT, account)))?;
        }
        if let Ok(url) = std::env::var(env::EXPLORER_URL) {
            if !url.trim().is_empty() {
                config.explorer_url = Some(url.trim().to_string());
            }
        }
        if let Ok(rate) = std::env::var(env::FEE_RATE) {
            config.default_fee_rate = rate
                .trim()
                .parse()
                .map_err(|_| WalletError::Config(format!("{}: not a number: {}", env::FEE_RATE, rate)))?;
        }
        Ok(config)
    }
}

/// Load `KEY=VALUE` lines into the process environment. Existing variables win.
/// Returns the number of variables set; a missing file sets none.
pub fn load_dotenv(path: &Path) -> usize {
    let Ok(contents) = std::fs::read_to_string(path) else { return 0 };
    let mut loaded = 0;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"');
            if !value.is_empty() && std::env::var(key.trim()).is_err() {
                std::env::set_var(key.trim(), value);
                loaded += 1;
            }
        }
    }
    loaded
}
