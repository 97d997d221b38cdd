//! Message signing - BIP137-style compact signatures, base64 encoded

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::sign_message::{signed_msg_hash, MessageSignature};
use bitcoin::Address;

use crate::error::{Result, WalletError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMessage {
    pub address: Address,
    pub message: String,
    /// base64 of the 65-byte recoverable signature
    pub signature: String,
}

pub fn encode_signature(signature: &MessageSignature) -> String {
    STANDARD.encode(signature.serialize())
}

/// Check `signature` over `message` against `address` (P2PKH or P2WPKH).
///
/// Malformed signatures are an error. A well-formed signature from some
/// other key is `Ok(false)`.
pub fn verify_message(address: &Address, message: &str, signature: &str) -> Result<bool> {
    let bytes = STANDARD
        .decode(signature.trim())
        .map_err(|e| WalletError::InvalidSignature(format!("base64: {}", e)))?;
    let signature = MessageSignature::from_slice(&bytes).map_err(|e| WalletError::InvalidSignature(e.to_string()))?;

    let secp = Secp256k1::verification_only();
    match signature.recover_pubkey(&secp, signed_msg_hash(message)) {
        Ok(pubkey) => Ok(address.is_related_to_pubkey(&pubkey)),
        Err(_) => Ok(false),
    }
}
