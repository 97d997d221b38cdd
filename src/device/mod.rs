//! Device - the signing hardware, behind one exclusive handle
//!
//! The wallet never touches keys. Everything key-related is a request to a
//! [`DeviceSigner`]: address derivation, the account xpub, PSBT signing and
//! message signing. Signing blocks until the user approves or rejects on the
//! device; there is no internal timeout.
//!
//! # Architecture
//!
//! ```text
//! WalletSession
//!     │
//!     └── DeviceHandle (Arc<Mutex<..>>, one request in flight)
//!             │
//!             └── dyn DeviceSigner
//!                     ├── SeedDevice (BIP39 emulator)
//!                     └── HID transports (provided by the host)
//! ```

mod seed;

pub use seed::{ApprovalFn, SeedDevice, SigningRequest};

use async_trait::async_trait;
use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpub};
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{Secp256k1, Verification};
use bitcoin::sign_message::MessageSignature;
use bitcoin::{Address, CompressedPublicKey};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use crate::config::Network;
use crate::core::paths::derivation;

/// Device failures, by kind. Rejection is kept apart from transport trouble
/// so callers can tell "user said no" from "device is gone".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device disconnected: {0}")]
    Disconnected(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("unsupported request: {0}")]
    Unsupported(String),

    #[error("communication failure: {0}")]
    Communication(String),
}

/// A hardware signer. Methods take `&mut self`: the device serves one request at a time.
#[async_trait]
pub trait DeviceSigner: Send {
    /// Human-readable device label for logs.
    fn label(&self) -> &str;

    /// Master key fingerprint.
    async fn fingerprint(&mut self) -> Result<Fingerprint, DeviceError>;

    /// Extended public key at `path` (the account level, `m/84'/coin'/account'`).
    async fn account_xpub(&mut self, path: &DerivationPath) -> Result<Xpub, DeviceError>;

    /// Native segwit address at the full `path`. With `show_on_device` the
    /// device displays it for the user to compare.
    async fn derive_address(&mut self, path: &DerivationPath, network: Network, show_on_device: bool) -> Result<Address, DeviceError>;

    /// Sign every input the descriptor owns. Blocks on physical approval.
    async fn sign_psbt(&mut self, psbt: Psbt, descriptor: &WalletDescriptor) -> Result<Psbt, DeviceError>;

    /// Sign a text message with the key at `path`.
    async fn sign_message(&mut self, path: &DerivationPath, message: &str) -> Result<MessageSignature, DeviceError>;
}

/// Exclusive access to the connected device. Clones share the same lock, so
/// at most one device request is ever in flight.
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<Mutex<Box<dyn DeviceSigner>>>,
}

impl DeviceHandle {
    pub fn new(device: impl DeviceSigner + 'static) -> Self {
        Self { inner: Arc::new(Mutex::new(Box::new(device))) }
    }

    /// Wait for the device, then hold it until the guard drops.
    pub async fn lock(&self) -> MutexGuard<'_, Box<dyn DeviceSigner>> {
        self.inner.lock().await
    }

    /// True while another request holds the device.
    pub fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

/// Public description of the wallet handed to the device with every PSBT:
/// master fingerprint, account path and account xpub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletDescriptor {
    pub fingerprint: Fingerprint,
    pub account_path: DerivationPath,
    pub account_xpub: Xpub,
}

impl WalletDescriptor {
    /// Full path from the master key: `account/0/index`.
    pub fn receive_path(&self, index: u32) -> Result<DerivationPath, DeviceError> {
        receive_path(&self.account_path, index)
    }

    /// Public key of receive address `index`, derived from the account xpub.
    pub fn receive_pubkey<C: Verification>(&self, secp: &Secp256k1<C>, index: u32) -> Result<CompressedPublicKey, DeviceError> {
        let child = self
            .account_xpub
            .derive_pub(secp, &receive_suffix(index)?)
            .map_err(|e| DeviceError::Unsupported(format!("derive {}: {}", index, e)))?;
        Ok(child.to_pub())
    }

    pub fn receive_address<C: Verification>(&self, secp: &Secp256k1<C>, index: u32, network: Network) -> Result<Address, DeviceError> {
        Ok(Address::p2wpkh(&self.receive_pubkey(secp, index)?, network.to_bitcoin()))
    }
}

impl fmt::Display for WalletDescriptor {
    /// `wpkh([fingerprint/84h/0h/0h]xpub/0/*)`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wpkh([{}", self.fingerprint)?;
        for child in self.account_path.as_ref() {
            match *child {
                ChildNumber::Hardened { index } => write!(f, "/{}h", index)?,
                ChildNumber::Normal { index } => write!(f, "/{}", index)?,
            }
        }
        write!(f, "]{}/{}/*)", self.account_xpub, derivation::RECEIVE_CHAIN)
    }
}

/// `account/0/index` for a receive address.
pub fn receive_path(account_path: &DerivationPath, index: u32) -> Result<DerivationPath, DeviceError> {
    Ok(account_path.extend(receive_suffix(index)?))
}

fn receive_suffix(index: u32) -> Result<Vec<ChildNumber>, DeviceError> {
    let normal = |idx: u32| ChildNumber::from_normal_idx(idx).map_err(|e| DeviceError::Unsupported(format!("index {}: {}", idx, e)));
    Ok(vec![normal(derivation::RECEIVE_CHAIN)?, normal(index)?])
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    async fn descriptor(device: &DeviceHandle, network: Network) -> WalletDescriptor {
        let account_path = crate::config::WalletConfig::new(network).account_path().unwrap();
        let mut dev = device.lock().await;
        WalletDescriptor {
            fingerprint: dev.fingerprint().await.unwrap(),
            account_xpub: dev.account_xpub(&account_path).await.unwrap(),
            account_path,
        }
    }

    #[tokio::test]
    async fn descriptor_derivation_matches_device() {
        let device = DeviceHandle::new(SeedDevice::from_mnemonic(TEST_MNEMONIC, "", Network::Bitcoin).unwrap());
        let desc = descriptor(&device, Network::Bitcoin).await;
        let secp = Secp256k1::verification_only();

        let from_xpub = desc.receive_address(&secp, 0, Network::Bitcoin).unwrap();
        let path = desc.receive_path(0).unwrap();
        let from_device = device.lock().await.derive_address(&path, Network::Bitcoin, false).await.unwrap();
        assert_eq!(from_xpub, from_device);
        // BIP84 test vector
        assert_eq!(from_device.to_string(), "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu");
    }

    #[tokio::test]
    async fn descriptor_renders_key_origin() {
        let device = DeviceHandle::new(SeedDevice::from_mnemonic(TEST_MNEMONIC, "", Network::Bitcoin).unwrap());
        let desc = descriptor(&device, Network::Bitcoin).await;
        let rendered = desc.to_string();
        assert!(rendered.starts_with("wpkh([73c5da0a/84h/0h/0h]xpub"));
        assert!(rendered.ends_with("/0/*)"));
    }

    #[tokio::test]
    async fn handle_reports_busy_while_locked() {
        let device = DeviceHandle::new(SeedDevice::from_mnemonic(TEST_MNEMONIC, "", Network::Testnet).unwrap());
        let other = device.clone();
        let guard = device.lock().await;
        assert!(other.is_busy());
        drop(guard);
        assert!(!other.is_busy());
    }
}
