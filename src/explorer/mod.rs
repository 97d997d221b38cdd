//! Explorer - block explorer collaborator (balances, history, UTXOs, broadcast)
//!
//! All calls are idempotent reads except [`BlockExplorer::broadcast`].
//! [`EsploraClient`] speaks the Esplora REST API (blockstream.info,
//! mempool.space, self-hosted electrs).

mod esplora;

pub use esplora::EsploraClient;

use async_trait::async_trait;
use bitcoin::{Address, Txid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExplorerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("decode error: {0}")]
    Decode(String),

    /// The explorer refused a broadcast; carries its message verbatim.
    #[error("transaction rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait BlockExplorer: Send + Sync {
    async fn address_stats(&self, address: &Address) -> Result<AddressStats, ExplorerError>;
    async fn address_transactions(&self, address: &Address) -> Result<Vec<ExplorerTx>, ExplorerError>;
    async fn utxos(&self, address: &Address) -> Result<Vec<ExplorerUtxo>, ExplorerError>;
    /// Consensus-serialized transaction bytes.
    async fn raw_transaction(&self, txid: &Txid) -> Result<Vec<u8>, ExplorerError>;
    async fn broadcast(&self, raw_tx: &[u8]) -> Result<Txid, ExplorerError>;
    /// Confirmation target (blocks) -> fee rate (sat/vB).
    async fn fee_estimates(&self) -> Result<BTreeMap<u16, f64>, ExplorerError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxoStats {
    #[serde(default)]
    pub funded_txo_count: u64,
    #[serde(default)]
    pub funded_txo_sum: u64,
    #[serde(default)]
    pub spent_txo_count: u64,
    #[serde(default)]
    pub spent_txo_sum: u64,
    #[serde(default)]
    pub tx_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressStats {
    pub address: String,
    #[serde(default)]
    pub chain_stats: TxoStats,
    #[serde(default)]
    pub mempool_stats: TxoStats,
}

impl AddressStats {
    pub fn confirmed_balance(&self) -> u64 {
        self.chain_stats.funded_txo_sum.saturating_sub(self.chain_stats.spent_txo_sum)
    }

    /// Unconfirmed delta; negative while a spend sits in the mempool.
    pub fn pending_balance(&self) -> i64 {
        self.mempool_stats.funded_txo_sum as i64 - self.mempool_stats.spent_txo_sum as i64
    }

    /// An address is used once any transaction, confirmed or not, touches it.
    pub fn has_history(&self) -> bool {
        self.chain_stats.tx_count + self.mempool_stats.tx_count > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxStatus {
    pub confirmed: bool,
    #[serde(default)]
    pub block_height: Option<u32>,
    #[serde(default)]
    pub block_hash: Option<String>,
    #[serde(default)]
    pub block_time: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorerUtxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    #[serde(default)]
    pub status: TxStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorerTxOut {
    #[serde(default)]
    pub scriptpubkey_address: Option<String>,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorerTxIn {
    pub txid: String,
    pub vout: u32,
    /// Absent for coinbase inputs
    #[serde(default)]
    pub prevout: Option<ExplorerTxOut>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorerTx {
    pub txid: String,
    #[serde(default)]
    pub vin: Vec<ExplorerTxIn>,
    #[serde(default)]
    pub vout: Vec<ExplorerTxOut>,
    #[serde(default)]
    pub fee: Option<u64>,
    #[serde(default)]
    pub status: TxStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_stats_balances() {
        let stats: AddressStats = serde_json::from_value(serde_json::json!({
            "address": "tb1qexample",
            "chain_stats": {"funded_txo_count": 2, "funded_txo_sum": 150000, "spent_txo_count": 1, "spent_txo_sum": 50000, "tx_count": 3},
            "mempool_stats": {"funded_txo_count": 0, "funded_txo_sum": 0, "spent_txo_count": 1, "spent_txo_sum": 100000, "tx_count": 1}
        }))
        .expect("stats");
        assert_eq!(stats.confirmed_balance(), 100_000);
        assert_eq!(stats.pending_balance(), -100_000);
        assert!(stats.has_history());
    }

    #[test]
    fn fresh_address_has_no_history() {
        let stats: AddressStats = serde_json::from_value(serde_json::json!({"address": "bc1qfresh"})).expect("stats");
        assert!(!stats.has_history());
        assert_eq!(stats.confirmed_balance(), 0);
    }

    #[test]
    fn coinbase_input_has_no_prevout() {
        let tx: ExplorerTx = serde_json::from_value(serde_json::json!({
            "txid": "aa",
            "vin": [{"txid": "0000000000000000000000000000000000000000000000000000000000000000", "vout": 4294967295u32, "prevout": null}],
            "vout": [{"scriptpubkey_address": "bc1qminer", "value": 625000000}],
            "status": {"confirmed": true, "block_height": 840000}
        }))
        .expect("tx");
        assert!(tx.vin[0].prevout.is_none());
        assert_eq!(tx.status.block_height, Some(840000));
    }
}
