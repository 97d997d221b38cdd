//! Esplora REST client.

use async_trait::async_trait;
use bitcoin::{Address, Txid};
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use super::{AddressStats, BlockExplorer, ExplorerError, ExplorerTx, ExplorerUtxo};
use crate::config::WalletConfig;
use crate::core::paths::explorer as paths;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct EsploraClient {
    base_url: String,
    client: reqwest::Client,
}

impl EsploraClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ExplorerError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { base_url: base_url.into().trim_end_matches('/').to_string(), client })
    }

    pub fn from_config(config: &WalletConfig) -> Result<Self, ExplorerError> {
        Self::new(config.explorer_url())
    }

    pub fn base_url(&self) -> &str { &self.base_url }

    async fn get_text(&self, path: &str) -> Result<String, ExplorerError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "GET");
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ExplorerError::Status { status: status.as_u16(), body });
        }
        Ok(body)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ExplorerError> {
        let body = self.get_text(path).await?;
        serde_json::from_str(&body).map_err(|e| ExplorerError::Decode(format!("{}: {}", path, e)))
    }
}

#[async_trait]
impl BlockExplorer for EsploraClient {
    async fn address_stats(&self, address: &Address) -> Result<AddressStats, ExplorerError> {
        self.get_json(&format!("{}/{}", paths::ADDRESS, address)).await
    }

    async fn address_transactions(&self, address: &Address) -> Result<Vec<ExplorerTx>, ExplorerError> {
        self.get_json(&format!("{}/{}{}", paths::ADDRESS, address, paths::TXS_SUFFIX)).await
    }

    async fn utxos(&self, address: &Address) -> Result<Vec<ExplorerUtxo>, ExplorerError> {
        self.get_json(&format!("{}/{}{}", paths::ADDRESS, address, paths::UTXO_SUFFIX)).await
    }

    async fn raw_transaction(&self, txid: &Txid) -> Result<Vec<u8>, ExplorerError> {
        let body = self.get_text(&format!("{}/{}{}", paths::TX, txid, paths::HEX_SUFFIX)).await?;
        hex::decode(body.trim()).map_err(|e| ExplorerError::Decode(format!("tx {} hex: {}", txid, e)))
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> Result<Txid, ExplorerError> {
        let url = format!("{}{}", self.base_url, paths::TX);
        let resp = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "text/plain")
            .body(hex::encode(raw_tx))
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            warn!(status = status.as_u16(), %body, "Broadcast rejected");
            return Err(ExplorerError::Rejected(body.trim().to_string()));
        }
        Txid::from_str(body.trim()).map_err(|e| ExplorerError::Decode(format!("broadcast txid {:?}: {}", body, e)))
    }

    async fn fee_estimates(&self) -> Result<BTreeMap<u16, f64>, ExplorerError> {
        let raw: HashMap<String, f64> = self.get_json(paths::FEE_ESTIMATES).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(target, rate)| target.parse::<u16>().ok().map(|t| (t, rate)))
            .collect())
    }
}
