//! WalletSession - one connected device, one account, owned by the caller
//!
//! Holds the descriptor read at connect time and the address ledger. Every
//! operation takes the session explicitly; there is no ambient wallet state.

use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Address, Txid};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use super::builder::{SendReceipt, SendRequest, TransactionBuilder, TransactionDraft};
use super::ledger::{AddressLedger, AddressRecord};
use super::message::{encode_signature, SignedMessage};
use crate::config::WalletConfig;
use crate::device::{DeviceError, DeviceHandle, WalletDescriptor};
use crate::error::{Result, WalletError};
use crate::explorer::{BlockExplorer, ExplorerTx};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalletBalance {
    pub confirmed: u64,
    /// Mempool delta, negative while an outgoing spend is unconfirmed
    pub pending: i64,
}

impl WalletBalance {
    pub fn total(&self) -> u64 {
        (self.confirmed as i64).saturating_add(self.pending).max(0) as u64
    }
}

/// A transaction as seen from this wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletTransaction {
    pub txid: Txid,
    pub received: u64,
    pub sent: u64,
    pub fee: Option<u64>,
    pub confirmed: bool,
    pub timestamp: Option<u64>,
    pub block_height: Option<u32>,
}

impl WalletTransaction {
    pub fn net(&self) -> i64 {
        self.received as i64 - self.sent as i64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalletSnapshot {
    pub balance: WalletBalance,
    /// Deduplicated, unconfirmed first, then by height descending
    pub transactions: Vec<WalletTransaction>,
}

pub struct WalletSession {
    config: WalletConfig,
    device: DeviceHandle,
    explorer: Arc<dyn BlockExplorer>,
    descriptor: WalletDescriptor,
    ledger: AddressLedger,
}

impl WalletSession {
    /// Read the descriptor from the device and derive the first address batch.
    pub async fn connect(config: WalletConfig, device: DeviceHandle, explorer: Arc<dyn BlockExplorer>) -> Result<Self> {
        let account_path = config.account_path()?;
        let descriptor = {
            let mut dev = device.lock().await;
            let fingerprint = dev.fingerprint().await?;
            let account_xpub = dev.account_xpub(&account_path).await?;
            WalletDescriptor { fingerprint, account_path: account_path.clone(), account_xpub }
        };

        let mut ledger = AddressLedger::new(config.network, account_path);
        ledger.derive_initial(&device).await?;

        // The device's addresses must match what the xpub implies, or signing would fail later.
        let secp = Secp256k1::verification_only();
        let expected = descriptor.receive_address(&secp, 0, config.network)?;
        if ledger.first_address().map(|r| &r.address) != Some(&expected) {
            return Err(WalletError::Device(DeviceError::Communication("device address does not match account xpub".into())));
        }

        info!(network = config.network.as_str(), descriptor = %descriptor, "Wallet connected");
        Ok(Self { config, device, explorer, descriptor, ledger })
    }

    pub fn config(&self) -> &WalletConfig { &self.config }
    pub fn descriptor(&self) -> &WalletDescriptor { &self.descriptor }
    pub fn ledger(&self) -> &AddressLedger { &self.ledger }
    pub fn addresses(&self) -> &[AddressRecord] { self.ledger.records() }

    pub fn builder(&self) -> TransactionBuilder<'_> {
        TransactionBuilder::new(self.explorer.as_ref(), &self.device, &self.descriptor)
    }

    /// Balance and history across every ledger address. Also refreshes `used`.
    pub async fn refresh(&mut self) -> Result<WalletSnapshot> {
        let mut balance = WalletBalance::default();
        let mut presence = HashMap::new();
        let mut seen = HashSet::new();
        let mut history: Vec<ExplorerTx> = Vec::new();

        for record in self.ledger.records() {
            let stats = self.explorer.address_stats(&record.address).await?;
            let txs = self.explorer.address_transactions(&record.address).await?;

            balance.confirmed += stats.confirmed_balance();
            balance.pending += stats.pending_balance();
            presence.insert(record.address.clone(), stats.has_history() || !txs.is_empty());

            for tx in txs {
                if seen.insert(tx.txid.clone()) {
                    history.push(tx);
                }
            }
        }
        self.ledger.mark_usage(&presence);

        let owned: HashSet<String> = self.ledger.addresses().map(|a| a.to_string()).collect();
        let mut transactions = history
            .iter()
            .map(|tx| summarize(tx, &owned))
            .collect::<Result<Vec<_>>>()?;
        transactions.sort_by_key(|t| std::cmp::Reverse(t.block_height.unwrap_or(u32::MAX)));

        info!(confirmed = balance.confirmed, pending = balance.pending, txs = transactions.len(), "Wallet refreshed");
        Ok(WalletSnapshot { balance, transactions })
    }

    pub async fn receive_address(&mut self) -> Result<(Address, u32)> {
        self.ledger.next_receive_address(&self.device).await
    }

    /// Show address `index` on the device and compare with the ledger copy.
    pub async fn verify_address(&self, index: u32) -> Result<bool> {
        let record = self
            .ledger
            .get(index)
            .ok_or_else(|| WalletError::InvalidAddress(format!("index {} has not been derived", index)))?;
        let path = self.descriptor.receive_path(index)?;
        let shown = self.device.lock().await.derive_address(&path, self.config.network, true).await?;
        if shown != record.address {
            warn!(index, ledger = %record.address, device = %shown, "Address mismatch");
        }
        Ok(shown == record.address)
    }

    pub async fn preview(&self, request: &SendRequest) -> Result<TransactionDraft> {
        self.builder().draft(&self.ledger, request).await
    }

    pub async fn send(&self, request: &SendRequest) -> Result<SendReceipt> {
        self.builder().send(&self.ledger, request).await
    }

    pub async fn sign_message(&self, index: u32, message: &str) -> Result<SignedMessage> {
        let record = self
            .ledger
            .get(index)
            .ok_or_else(|| WalletError::InvalidAddress(format!("index {} has not been derived", index)))?;
        let path = self.descriptor.receive_path(index)?;
        let signature = {
            let mut dev = self.device.lock().await;
            dev.sign_message(&path, message).await.map_err(WalletError::from_signing)?
        };
        Ok(SignedMessage { address: record.address.clone(), message: message.to_string(), signature: encode_signature(&signature) })
    }

    /// sat/vB for confirmation within `target_blocks`, rounded up.
    /// Falls back to the configured default when the explorer has no estimate.
    pub async fn recommended_fee_rate(&self, target_blocks: u16) -> u64 {
        match self.explorer.fee_estimates().await {
            Ok(estimates) => {
                let rate = estimates
                    .range(..=target_blocks)
                    .next_back()
                    .or_else(|| estimates.iter().next())
                    .map(|(_, rate)| *rate);
                match rate {
                    Some(rate) if rate.is_finite() && rate > 0.0 => (rate.ceil() as u64).max(1),
                    _ => self.config.default_fee_rate,
                }
            }
            Err(e) => {
                warn!(error = %e, fallback = self.config.default_fee_rate, "Fee estimates unavailable");
                self.config.default_fee_rate
            }
        }
    }
}

fn summarize(tx: &ExplorerTx, owned: &HashSet<String>) -> Result<WalletTransaction> {
    let ours = |addr: &Option<String>| addr.as_ref().is_some_and(|a| owned.contains(a));
    let received = tx.vout.iter().filter(|o| ours(&o.scriptpubkey_address)).map(|o| o.value).sum();
    let sent = tx
        .vin
        .iter()
        .filter_map(|i| i.prevout.as_ref())
        .filter(|p| ours(&p.scriptpubkey_address))
        .map(|p| p.value)
        .sum();
    let txid = Txid::from_str(&tx.txid).map_err(|e| WalletError::Explorer(crate::explorer::ExplorerError::Decode(format!("txid {}: {}", tx.txid, e))))?;
    Ok(WalletTransaction {
        txid,
        received,
        sent,
        fee: tx.fee,
        confirmed: tx.status.confirmed,
        timestamp: tx.status.block_time,
        block_height: tx.status.block_height,
    })
}
