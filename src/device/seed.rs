//! SeedDevice - software emulator of a BIP84 hardware signer
//!
//! Holds a master key derived from a BIP39 mnemonic. The seed bytes are
//! zeroized right after derivation. The approval callback stands in for the
//! physical confirm button.

use async_trait::async_trait;
use bip39::Mnemonic;
use bitcoin::bip32::{DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sign_message::{signed_msg_hash, MessageSignature};
use bitcoin::{Address, CompressedPublicKey};
use std::str::FromStr;
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::{DeviceError, DeviceSigner, WalletDescriptor};
use crate::config::Network;

/// What the device shows the user before they confirm.
#[derive(Debug, Clone)]
pub struct SigningRequest {
    pub inputs: usize,
    /// (address or raw script hex, value in sat)
    pub outputs: Vec<(String, u64)>,
    pub fee: Option<u64>,
}

pub type ApprovalFn = Box<dyn Fn(&SigningRequest) -> bool + Send + Sync>;

pub struct SeedDevice {
    label: String,
    master: Xpriv,
    network: Network,
    secp: Secp256k1<All>,
    approve: ApprovalFn,
    connected: bool,
}

impl SeedDevice {
    pub fn from_mnemonic(words: &str, passphrase: &str, network: Network) -> Result<Self, DeviceError> {
        let mnemonic = Mnemonic::from_str(words.trim())
            .map_err(|e| DeviceError::Unsupported(format!("mnemonic: {}", e)))?;
        let seed = Zeroizing::new(mnemonic.to_seed(passphrase));
        Self::from_seed(&seed[..], network)
    }

    pub fn from_seed(seed: &[u8], network: Network) -> Result<Self, DeviceError> {
        let master = Xpriv::new_master(network.to_bitcoin(), seed)
            .map_err(|e| DeviceError::Unsupported(format!("master key: {}", e)))?;
        Ok(Self {
            label: "seed-emulator".into(),
            master,
            network,
            secp: Secp256k1::new(),
            approve: Box::new(|_| true),
            connected: true,
        })
    }

    /// Replace the confirm button. Returning `false` rejects the request.
    pub fn with_approval(mut self, approve: ApprovalFn) -> Self { self.approve = approve; self }

    /// Simulate unplugging or replugging the device.
    pub fn set_connected(&mut self, connected: bool) { self.connected = connected; }

    fn ensure_connected(&self) -> Result<(), DeviceError> {
        if self.connected { Ok(()) } else { Err(DeviceError::Disconnected(format!("{} not connected", self.label))) }
    }

    fn derive(&self, path: &DerivationPath) -> Result<Xpriv, DeviceError> {
        self.master
            .derive_priv(&self.secp, path)
            .map_err(|e| DeviceError::Communication(format!("derive {}: {}", path, e)))
    }

    fn summarize(&self, psbt: &Psbt) -> SigningRequest {
        let outputs = psbt
            .unsigned_tx
            .output
            .iter()
            .map(|out| {
                let shown = Address::from_script(&out.script_pubkey, self.network.to_bitcoin())
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| hex::encode(out.script_pubkey.as_bytes()));
                (shown, out.value.to_sat())
            })
            .collect();
        let fee = psbt.fee().ok().map(|f| f.to_sat());
        SigningRequest { inputs: psbt.inputs.len(), outputs, fee }
    }
}

#[async_trait]
impl DeviceSigner for SeedDevice {
    fn label(&self) -> &str { &self.label }

    async fn fingerprint(&mut self) -> Result<Fingerprint, DeviceError> {
        self.ensure_connected()?;
        Ok(self.master.fingerprint(&self.secp))
    }

    async fn account_xpub(&mut self, path: &DerivationPath) -> Result<Xpub, DeviceError> {
        self.ensure_connected()?;
        Ok(Xpub::from_priv(&self.secp, &self.derive(path)?))
    }

    async fn derive_address(&mut self, path: &DerivationPath, network: Network, show_on_device: bool) -> Result<Address, DeviceError> {
        self.ensure_connected()?;
        let key = self.derive(path)?;
        let pubkey = CompressedPublicKey(key.private_key.public_key(&self.secp));
        let address = Address::p2wpkh(&pubkey, network.to_bitcoin());
        if show_on_device {
            info!(device = %self.label, %path, %address, "Displaying address");
        }
        Ok(address)
    }

    async fn sign_psbt(&mut self, mut psbt: Psbt, descriptor: &WalletDescriptor) -> Result<Psbt, DeviceError> {
        self.ensure_connected()?;
        let own = self.master.fingerprint(&self.secp);
        if descriptor.fingerprint != own {
            return Err(DeviceError::Unsupported(format!(
                "descriptor fingerprint {} does not match device {}",
                descriptor.fingerprint, own
            )));
        }

        let request = self.summarize(&psbt);
        debug!(device = %self.label, inputs = request.inputs, fee = ?request.fee, "Awaiting approval");
        if !(self.approve)(&request) {
            return Err(DeviceError::Rejected("Action cancelled by user".into()));
        }

        if let Err((_, errors)) = psbt.sign(&self.master, &self.secp) {
            let detail = errors.iter().map(|(i, e)| format!("input {}: {}", i, e)).collect::<Vec<_>>().join(", ");
            return Err(DeviceError::Communication(format!("signing failed: {}", detail)));
        }
        let signed = psbt.inputs.iter().filter(|input| !input.partial_sigs.is_empty()).count();
        if signed != psbt.inputs.len() {
            return Err(DeviceError::Unsupported(format!(
                "signed {} of {} inputs; remaining inputs are not ours",
                signed,
                psbt.inputs.len()
            )));
        }
        info!(device = %self.label, inputs = signed, "PSBT signed");
        Ok(psbt)
    }

    async fn sign_message(&mut self, path: &DerivationPath, message: &str) -> Result<MessageSignature, DeviceError> {
        self.ensure_connected()?;
        let key = self.derive(path)?;
        let digest = Message::from_digest(signed_msg_hash(message).to_byte_array());
        let signature = self.secp.sign_ecdsa_recoverable(&digest, &key.private_key);
        Ok(MessageSignature::new(signature, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[tokio::test]
    async fn fingerprint_matches_bip32_vector() {
        let mut device = SeedDevice::from_mnemonic(TEST_MNEMONIC, "", Network::Bitcoin).expect("device");
        assert_eq!(device.fingerprint().await.unwrap().to_string(), "73c5da0a");
    }

    #[tokio::test]
    async fn invalid_mnemonic_rejected() {
        let err = SeedDevice::from_mnemonic("abandon abandon", "", Network::Bitcoin).err().expect("error");
        assert!(matches!(err, DeviceError::Unsupported(_)));
    }

    #[tokio::test]
    async fn disconnected_device_refuses_requests() {
        let mut device = SeedDevice::from_mnemonic(TEST_MNEMONIC, "", Network::Signet).expect("device");
        device.set_connected(false);
        let err = device.fingerprint().await.unwrap_err();
        assert!(matches!(err, DeviceError::Disconnected(_)));
    }

    #[tokio::test]
    async fn signet_address_uses_testnet_hrp() {
        let mut device = SeedDevice::from_mnemonic(TEST_MNEMONIC, "", Network::Signet).expect("device");
        let path = DerivationPath::from_str("m/84'/1'/0'/0/0").unwrap();
        let addr = device.derive_address(&path, Network::Signet, true).await.unwrap();
        assert!(addr.to_string().starts_with("tb1q"));
    }
}
