//! Error taxonomy for wallet operations.
//!
//! Every variant is terminal for the current attempt: nothing is retried
//! internally and no partial draft survives a failure.

use thiserror::Error;

use crate::device::DeviceError;
use crate::explorer::ExplorerError;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("no spendable outputs found for any wallet address")]
    NoFunds,

    #[error("insufficient funds: need {required} sat, have {available} sat (max sendable {max_sendable} sat)")]
    InsufficientFunds {
        required: u64,
        available: u64,
        max_sendable: u64,
    },

    #[error("device error: {0}")]
    Device(DeviceError),

    #[error("rejected on device: {0}")]
    UserRejected(String),

    #[error("broadcast failed: {0}")]
    Broadcast(String),

    #[error("explorer error: {0}")]
    Explorer(#[from] ExplorerError),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid fee rate: {0}")]
    InvalidFeeRate(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("PSBT error: {0}")]
    Psbt(String),

    #[error("price unavailable: {0}")]
    Price(String),

    #[error("config error: {0}")]
    Config(String),
}

impl WalletError {
    /// Map a device failure raised while the device holds a signing request.
    /// A disconnect mid-approval counts as a rejection.
    pub fn from_signing(err: DeviceError) -> Self {
        match err {
            DeviceError::Rejected(msg) | DeviceError::Disconnected(msg) => WalletError::UserRejected(msg),
            other => WalletError::Device(other),
        }
    }

    pub fn is_user_rejection(&self) -> bool {
        matches!(self, WalletError::UserRejected(_))
    }
}

impl From<DeviceError> for WalletError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Rejected(msg) => WalletError::UserRejected(msg),
            other => WalletError::Device(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, WalletError>;
