//! Transaction builder - one recipient, optional change, P2WPKH inputs
//!
//! # Flow
//!
//! ```text
//! fetch_utxos ──► select_coins ──► TransactionDraft
//!                                        │
//!                     assemble_psbt ◄────┘  (parent txs fetched concurrently)
//!                           │
//!                         sign     (device lock held until approve/reject)
//!                           │
//!                     finalize_psbt ──► Transaction ──► broadcast ──► Txid
//! ```
//!
//! Every call starts from a fresh UTXO fetch. Nothing survives a failure.

use bitcoin::address::NetworkUnchecked;
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{Secp256k1, VerifyOnly};
use bitcoin::transaction::Version;
use bitcoin::{absolute, Address, Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use futures::future::try_join_all;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info, warn};

use super::ledger::AddressLedger;
use super::selection::{select_coins, UnspentOutput, DUST_THRESHOLD};
use crate::config::Network;
use crate::device::{DeviceHandle, WalletDescriptor};
use crate::error::{Result, WalletError};
use crate::explorer::{BlockExplorer, ExplorerError};

/// Validated send parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub recipient: Address,
    /// sat
    pub amount: u64,
    /// sat/vB
    pub fee_rate: u64,
}

impl SendRequest {
    pub fn new(recipient: &str, amount: u64, fee_rate: u64, network: Network) -> Result<Self> {
        let recipient = Address::<NetworkUnchecked>::from_str(recipient.trim())
            .map_err(|e| WalletError::InvalidAddress(format!("{}: {}", recipient, e)))?
            .require_network(network.to_bitcoin())
            .map_err(|e| WalletError::InvalidAddress(format!("{}: {}", recipient, e)))?;
        let request = Self { recipient, amount, fee_rate };
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<()> {
        if self.amount < DUST_THRESHOLD {
            return Err(WalletError::InvalidAmount(format!("{} sat is below the {} sat dust threshold", self.amount, DUST_THRESHOLD)));
        }
        if self.fee_rate == 0 {
            return Err(WalletError::InvalidFeeRate("fee rate must be at least 1 sat/vB".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeOutput {
    pub address: Address,
    pub index: u32,
    pub value: u64,
}

/// Unsigned transaction plan. Inputs balance outputs plus fee exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDraft {
    pub inputs: Vec<UnspentOutput>,
    pub recipient: Address,
    pub recipient_value: u64,
    pub change: Option<ChangeOutput>,
    pub fee: u64,
    /// Heuristic size the fee was priced at
    pub vsize: u64,
}

impl TransactionDraft {
    pub fn total_input(&self) -> u64 {
        self.inputs.iter().map(|u| u.value).sum()
    }

    pub fn change_value(&self) -> u64 {
        self.change.as_ref().map_or(0, |c| c.value)
    }

    pub fn is_balanced(&self) -> bool {
        self.total_input() == self.recipient_value + self.fee + self.change_value()
    }

    /// Recipient first, change (if any) second.
    pub fn to_unsigned_tx(&self) -> Transaction {
        let input = self
            .inputs
            .iter()
            .map(|utxo| TxIn {
                previous_output: utxo.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_LOCKTIME_NO_RBF,
                witness: Witness::new(),
            })
            .collect();

        let mut output = vec![TxOut { value: Amount::from_sat(self.recipient_value), script_pubkey: self.recipient.script_pubkey() }];
        if let Some(change) = &self.change {
            output.push(TxOut { value: Amount::from_sat(change.value), script_pubkey: change.address.script_pubkey() });
        }

        Transaction { version: Version::TWO, lock_time: absolute::LockTime::ZERO, input, output }
    }
}

/// Outcome of a broadcast send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub txid: Txid,
    pub amount: u64,
    pub fee: u64,
    pub change: Option<u64>,
    pub inputs: usize,
}

/// Borrowed view of the session's collaborators for one build.
pub struct TransactionBuilder<'a> {
    explorer: &'a dyn BlockExplorer,
    device: &'a DeviceHandle,
    descriptor: &'a WalletDescriptor,
    secp: Secp256k1<VerifyOnly>,
}

impl<'a> TransactionBuilder<'a> {
    pub fn new(explorer: &'a dyn BlockExplorer, device: &'a DeviceHandle, descriptor: &'a WalletDescriptor) -> Self {
        Self { explorer, device, descriptor, secp: Secp256k1::verification_only() }
    }

    /// Every UTXO of every ledger address, in derivation-index then explorer order.
    pub async fn fetch_utxos(&self, ledger: &AddressLedger) -> Result<Vec<UnspentOutput>> {
        let mut utxos = Vec::new();
        for record in ledger.records() {
            for utxo in self.explorer.utxos(&record.address).await? {
                let txid = Txid::from_str(&utxo.txid)
                    .map_err(|e| ExplorerError::Decode(format!("utxo txid {}: {}", utxo.txid, e)))?;
                utxos.push(UnspentOutput {
                    outpoint: bitcoin::OutPoint::new(txid, utxo.vout),
                    value: utxo.value,
                    address: record.address.clone(),
                    address_index: record.index,
                });
            }
        }
        debug!(count = utxos.len(), addresses = ledger.len(), "UTXOs fetched");
        Ok(utxos)
    }

    /// Select inputs and decide change. No device interaction.
    pub async fn draft(&self, ledger: &AddressLedger, request: &SendRequest) -> Result<TransactionDraft> {
        request.validate()?;
        let utxos = self.fetch_utxos(ledger).await?;
        let selection = select_coins(utxos, request.amount, request.fee_rate)?;

        let change = match selection.change {
            Some(value) => {
                let first = ledger
                    .first_address()
                    .ok_or_else(|| WalletError::Psbt("ledger has no change address".into()))?;
                Some(ChangeOutput { address: first.address.clone(), index: first.index, value })
            }
            None => None,
        };

        let draft = TransactionDraft {
            inputs: selection.inputs,
            recipient: request.recipient.clone(),
            recipient_value: request.amount,
            change,
            fee: selection.fee,
            vsize: selection.vsize,
        };
        info!(
            inputs = draft.inputs.len(),
            amount = draft.recipient_value,
            fee = draft.fee,
            change = draft.change_value(),
            "Draft built"
        );
        Ok(draft)
    }

    /// Attach each input's previous output (from the parent transaction) and
    /// the key origins the device needs to sign.
    pub async fn assemble_psbt(&self, draft: &TransactionDraft) -> Result<Psbt> {
        let mut txids: Vec<Txid> = draft.inputs.iter().map(|u| u.outpoint.txid).collect();
        txids.sort();
        txids.dedup();

        let parents: HashMap<Txid, Transaction> = try_join_all(txids.iter().map(|txid| async move {
            let raw = self.explorer.raw_transaction(txid).await?;
            let tx: Transaction = deserialize(&raw).map_err(|e| WalletError::Psbt(format!("parent {}: {}", txid, e)))?;
            if tx.compute_txid() != *txid {
                return Err(WalletError::Psbt(format!("explorer returned a different transaction for {}", txid)));
            }
            Ok::<_, WalletError>((*txid, tx))
        }))
        .await?
        .into_iter()
        .collect();

        let mut psbt = Psbt::from_unsigned_tx(draft.to_unsigned_tx()).map_err(|e| WalletError::Psbt(e.to_string()))?;

        for (input, utxo) in psbt.inputs.iter_mut().zip(&draft.inputs) {
            let outpoint = utxo.outpoint;
            let prevout = parents
                .get(&outpoint.txid)
                .and_then(|tx| tx.output.get(outpoint.vout as usize))
                .ok_or_else(|| WalletError::Psbt(format!("parent output {} missing", outpoint)))?;
            if prevout.value.to_sat() != utxo.value || prevout.script_pubkey != utxo.address.script_pubkey() {
                return Err(WalletError::Psbt(format!("parent output {} does not match the explorer UTXO", outpoint)));
            }
            input.witness_utxo = Some(prevout.clone());

            let pubkey = self.descriptor.receive_pubkey(&self.secp, utxo.address_index)?;
            let path = self.descriptor.receive_path(utxo.address_index)?;
            input.bip32_derivation.insert(pubkey.0, (self.descriptor.fingerprint, path));
        }

        if let Some(change) = &draft.change {
            let pubkey = self.descriptor.receive_pubkey(&self.secp, change.index)?;
            let path = self.descriptor.receive_path(change.index)?;
            psbt.outputs[1].bip32_derivation.insert(pubkey.0, (self.descriptor.fingerprint, path));
        }

        debug!(inputs = psbt.inputs.len(), parents = parents.len(), "PSBT assembled");
        Ok(psbt)
    }

    /// Hand the PSBT to the device. Waits for the user without timeout.
    pub async fn sign(&self, psbt: Psbt) -> Result<Psbt> {
        let unsigned = psbt.unsigned_tx.clone();
        let signed = {
            let mut device = self.device.lock().await;
            info!(device = device.label(), "Waiting for on-device approval");
            device.sign_psbt(psbt, self.descriptor).await.map_err(WalletError::from_signing)?
        };
        if signed.unsigned_tx != unsigned {
            return Err(WalletError::Psbt("device returned a different transaction".into()));
        }
        Ok(signed)
    }

    pub async fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        let raw = serialize(tx);
        let txid = self.explorer.broadcast(&raw).await.map_err(|e| match e {
            ExplorerError::Rejected(message) => WalletError::Broadcast(message),
            other => WalletError::Broadcast(other.to_string()),
        })?;
        if txid != tx.compute_txid() {
            warn!(reported = %txid, computed = %tx.compute_txid(), "Explorer reported unexpected txid");
        }
        info!(%txid, bytes = raw.len(), "Transaction broadcast");
        Ok(txid)
    }

    /// Draft, sign, finalize and broadcast.
    pub async fn send(&self, ledger: &AddressLedger, request: &SendRequest) -> Result<SendReceipt> {
        let draft = self.draft(ledger, request).await?;
        let psbt = self.assemble_psbt(&draft).await?;
        let signed = self.sign(psbt).await?;
        let tx = finalize_psbt(signed)?;
        let txid = self.broadcast(&tx).await?;
        Ok(SendReceipt {
            txid,
            amount: draft.recipient_value,
            fee: draft.fee,
            change: draft.change.map(|c| c.value),
            inputs: draft.inputs.len(),
        })
    }
}

/// Turn each input's single P2WPKH signature into its final witness and
/// extract the network transaction.
pub fn finalize_psbt(mut psbt: Psbt) -> Result<Transaction> {
    for (i, input) in psbt.inputs.iter_mut().enumerate() {
        let (pubkey, sig) = input
            .partial_sigs
            .iter()
            .next()
            .map(|(pk, sig)| (*pk, *sig))
            .ok_or_else(|| WalletError::Psbt(format!("input {} is not signed", i)))?;

        input.final_script_witness = Some(Witness::from_slice(&[sig.to_vec(), pubkey.to_bytes()]));
        input.partial_sigs.clear();
        input.sighash_type = None;
        input.redeem_script = None;
        input.witness_script = None;
        input.bip32_derivation.clear();
    }
    psbt.extract_tx().map_err(|e| WalletError::Psbt(format!("extract: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::OutPoint;

    const MAINNET_ADDR: &str = "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu";

    fn address() -> Address {
        Address::from_str(MAINNET_ADDR).unwrap().assume_checked()
    }

    fn draft(change: Option<u64>) -> TransactionDraft {
        TransactionDraft {
            inputs: vec![UnspentOutput {
                outpoint: OutPoint::new(Txid::from_byte_array([7; 32]), 1),
                value: 50_000,
                address: address(),
                address_index: 0,
            }],
            recipient: address(),
            recipient_value: 40_000,
            change: change.map(|value| ChangeOutput { address: address(), index: 0, value }),
            fee: 10_000 - change.unwrap_or(0),
            vsize: 140,
        }
    }

    #[test]
    fn request_validation() {
        assert!(SendRequest::new(MAINNET_ADDR, 10_000, 5, Network::Bitcoin).is_ok());
        assert!(matches!(SendRequest::new(MAINNET_ADDR, 545, 5, Network::Bitcoin), Err(WalletError::InvalidAmount(_))));
        assert!(matches!(SendRequest::new(MAINNET_ADDR, 10_000, 0, Network::Bitcoin), Err(WalletError::InvalidFeeRate(_))));
        assert!(matches!(SendRequest::new(MAINNET_ADDR, 10_000, 5, Network::Testnet), Err(WalletError::InvalidAddress(_))));
        assert!(matches!(SendRequest::new("not-an-address", 10_000, 5, Network::Bitcoin), Err(WalletError::InvalidAddress(_))));
    }

    #[test]
    fn unsigned_tx_orders_recipient_then_change() {
        let d = draft(Some(8_000));
        assert!(d.is_balanced());
        let tx = d.to_unsigned_tx();
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.input[0].previous_output.vout, 1);
        assert_eq!(tx.output.len(), 2);
        assert_eq!(tx.output[0].value.to_sat(), 40_000);
        assert_eq!(tx.output[1].value.to_sat(), 8_000);

        let no_change = draft(None).to_unsigned_tx();
        assert_eq!(no_change.output.len(), 1);
    }

    #[test]
    fn finalize_requires_every_signature() {
        let psbt = Psbt::from_unsigned_tx(draft(None).to_unsigned_tx()).unwrap();
        let err = finalize_psbt(psbt).unwrap_err();
        assert!(matches!(err, WalletError::Psbt(msg) if msg.contains("input 0")));
    }
}
