//! Address ledger - derived receive addresses and their usage
//!
//! Records are kept in derivation-index order, appended in batches of
//! [`BATCH_SIZE`](crate::core::paths::derivation::BATCH_SIZE) and never removed.
//! `used` is recomputed on every refresh from explorer history.

use bitcoin::bip32::DerivationPath;
use bitcoin::Address;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::config::Network;
use crate::core::paths::derivation;
use crate::device::{self, DeviceHandle};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub address: Address,
    pub index: u32,
    pub used: bool,
}

#[derive(Debug, Clone)]
pub struct AddressLedger {
    network: Network,
    account_path: DerivationPath,
    records: Vec<AddressRecord>,
}

impl AddressLedger {
    pub fn new(network: Network, account_path: DerivationPath) -> Self {
        Self { network, account_path, records: Vec::new() }
    }

    pub fn records(&self) -> &[AddressRecord] { &self.records }

    pub fn len(&self) -> usize { self.records.len() }

    pub fn is_empty(&self) -> bool { self.records.is_empty() }

    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.records.iter().map(|r| &r.address)
    }

    pub fn get(&self, index: u32) -> Option<&AddressRecord> {
        self.records.get(index as usize)
    }

    /// Index 0. Change always returns here.
    pub fn first_address(&self) -> Option<&AddressRecord> {
        self.records.first()
    }

    /// Derive indices 0..5. A ledger that already holds addresses is returned as is.
    pub async fn derive_initial(&mut self, device: &DeviceHandle) -> Result<&[AddressRecord]> {
        if self.records.is_empty() {
            self.derive_more(device).await?;
        }
        Ok(&self.records)
    }

    /// Append the next batch starting at the current count.
    ///
    /// The batch is all-or-nothing: a device failure part way leaves the
    /// ledger exactly as it was.
    pub async fn derive_more(&mut self, device: &DeviceHandle) -> Result<&[AddressRecord]> {
        let start = self.records.len() as u32;
        let mut batch = Vec::with_capacity(derivation::BATCH_SIZE as usize);
        {
            let mut dev = device.lock().await;
            for index in start..start + derivation::BATCH_SIZE {
                let path = device::receive_path(&self.account_path, index)?;
                let address = dev.derive_address(&path, self.network, false).await?;
                debug!(index, %address, "Derived address");
                batch.push(AddressRecord { address, index, used: false });
            }
        }
        info!(from = start, count = batch.len(), "Address batch derived");
        self.records.extend(batch);
        Ok(&self.records[start as usize..])
    }

    /// Update `used` for every tracked address present in `presence`.
    /// Addresses the map does not mention keep their flag.
    pub fn mark_usage(&mut self, presence: &HashMap<Address, bool>) {
        for record in &mut self.records {
            if let Some(&used) = presence.get(&record.address) {
                record.used = used;
            }
        }
    }

    /// Lowest-index unused address, without touching the device.
    pub fn peek_receive_address(&self) -> Option<&AddressRecord> {
        self.records.iter().find(|r| !r.used)
    }

    /// Lowest-index unused address. When every address is used a new batch
    /// is derived and its first address returned.
    pub async fn next_receive_address(&mut self, device: &DeviceHandle) -> Result<(Address, u32)> {
        if let Some(record) = self.peek_receive_address() {
            return Ok((record.address.clone(), record.index));
        }
        let batch = self.derive_more(device).await?;
        let first = &batch[0];
        Ok((first.address.clone(), first.index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalletConfig;
    use crate::device::{DeviceError, DeviceSigner, SeedDevice, WalletDescriptor};
    use async_trait::async_trait;
    use bitcoin::bip32::{Fingerprint, Xpub};
    use bitcoin::psbt::Psbt;
    use bitcoin::sign_message::MessageSignature;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    /// Wraps a seed device and fails address derivation after `budget` calls.
    struct FlakyDevice {
        inner: SeedDevice,
        calls: Arc<AtomicUsize>,
        budget: usize,
    }

    #[async_trait]
    impl DeviceSigner for FlakyDevice {
        fn label(&self) -> &str { "flaky" }
        async fn fingerprint(&mut self) -> std::result::Result<Fingerprint, DeviceError> { self.inner.fingerprint().await }
        async fn account_xpub(&mut self, path: &DerivationPath) -> std::result::Result<Xpub, DeviceError> { self.inner.account_xpub(path).await }
        async fn derive_address(&mut self, path: &DerivationPath, network: Network, show: bool) -> std::result::Result<Address, DeviceError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.budget {
                return Err(DeviceError::Disconnected("cable pulled".into()));
            }
            self.inner.derive_address(path, network, show).await
        }
        async fn sign_psbt(&mut self, psbt: Psbt, descriptor: &WalletDescriptor) -> std::result::Result<Psbt, DeviceError> { self.inner.sign_psbt(psbt, descriptor).await }
        async fn sign_message(&mut self, path: &DerivationPath, message: &str) -> std::result::Result<MessageSignature, DeviceError> { self.inner.sign_message(path, message).await }
    }

    fn ledger() -> AddressLedger {
        let config = WalletConfig::mainnet();
        AddressLedger::new(config.network, config.account_path().unwrap())
    }

    fn seed_handle() -> DeviceHandle {
        DeviceHandle::new(SeedDevice::from_mnemonic(TEST_MNEMONIC, "", Network::Bitcoin).unwrap())
    }

    fn all_used(ledger: &AddressLedger) -> HashMap<Address, bool> {
        ledger.addresses().map(|a| (a.clone(), true)).collect()
    }

    #[tokio::test]
    async fn initial_batch_is_five_in_order() {
        let device = seed_handle();
        let mut ledger = ledger();
        let records = ledger.derive_initial(&device).await.unwrap();
        assert_eq!(records.len(), 5);
        assert!(records.iter().enumerate().all(|(i, r)| r.index == i as u32 && !r.used));
        assert_eq!(records[0].address.to_string(), "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu");

        ledger.derive_initial(&device).await.unwrap();
        assert_eq!(ledger.len(), 5);
    }

    #[tokio::test]
    async fn next_receive_is_lowest_unused() {
        let device = seed_handle();
        let mut ledger = ledger();
        ledger.derive_initial(&device).await.unwrap();

        let used: HashMap<Address, bool> = [0u32, 1, 3]
            .iter()
            .map(|&i| (ledger.get(i).unwrap().address.clone(), true))
            .collect();
        ledger.mark_usage(&used);

        let (address, index) = ledger.next_receive_address(&device).await.unwrap();
        assert_eq!(index, 2);
        assert_eq!(address, ledger.get(2).unwrap().address);
        assert_eq!(ledger.len(), 5);
    }

    #[tokio::test]
    async fn exhausted_ledger_appends_one_batch() {
        let device = seed_handle();
        let mut ledger = ledger();
        ledger.derive_initial(&device).await.unwrap();
        let before: Vec<_> = ledger.records().to_vec();
        ledger.mark_usage(&all_used(&ledger));

        let (_, index) = ledger.next_receive_address(&device).await.unwrap();
        assert_eq!(index, 5);
        assert_eq!(ledger.len(), 10);
        // Existing records keep position and identity
        for (old, new) in before.iter().zip(ledger.records()) {
            assert_eq!(old.address, new.address);
            assert_eq!(old.index, new.index);
        }
    }

    #[tokio::test]
    async fn usage_can_be_cleared_on_refresh() {
        let device = seed_handle();
        let mut ledger = ledger();
        ledger.derive_initial(&device).await.unwrap();
        ledger.mark_usage(&all_used(&ledger));
        assert!(ledger.peek_receive_address().is_none());

        let first = ledger.get(0).unwrap().address.clone();
        ledger.mark_usage(&HashMap::from([(first, false)]));
        assert_eq!(ledger.peek_receive_address().unwrap().index, 0);
    }

    #[tokio::test]
    async fn failed_batch_leaves_ledger_unchanged() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = SeedDevice::from_mnemonic(TEST_MNEMONIC, "", Network::Bitcoin).unwrap();
        let device = DeviceHandle::new(FlakyDevice { inner, calls: calls.clone(), budget: 7 });

        let mut ledger = ledger();
        ledger.derive_initial(&device).await.unwrap();
        ledger.mark_usage(&all_used(&ledger));

        let err = ledger.next_receive_address(&device).await.unwrap_err();
        assert!(matches!(err, crate::error::WalletError::Device(DeviceError::Disconnected(_))));
        assert_eq!(ledger.len(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }
}
