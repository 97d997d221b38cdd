//! Beesigner: Bitcoin wallet core for hardware signers.
//!
//! The device holds the keys. This crate tracks receive addresses, builds
//! single-recipient transactions from explorer UTXOs, has the device sign
//! them, and broadcasts the result.
//!
//! # Architecture
//!
//! ```text
//! WalletSession (explicit, caller-owned)
//!   │
//!   ├── DeviceHandle ──► dyn DeviceSigner   (one request in flight)
//!   │
//!   ├── Arc<dyn BlockExplorer>              (Esplora over HTTP)
//!   │
//!   ├── AddressLedger                       (BIP84 receive chain, batches of 5)
//!   │
//!   └── TransactionBuilder
//!         fetch UTXOs → select_coins → PSBT → device sign → finalize → broadcast
//!
//! PriceFeed (independent poller, cached fallback)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use beesigner::{DeviceHandle, EsploraClient, SeedDevice, SendRequest, WalletConfig, WalletSession};
//!
//! let config = WalletConfig::testnet();
//! let device = DeviceHandle::new(SeedDevice::from_mnemonic(words, "", config.network)?);
//! let explorer = Arc::new(EsploraClient::from_config(&config)?);
//! let mut session = WalletSession::connect(config, device, explorer).await?;
//!
//! let snapshot = session.refresh().await?;
//! let request = SendRequest::new("tb1q...", 25_000, 5, session.config().network)?;
//! let receipt = session.send(&request).await?;
//! ```

pub mod config;
pub mod core;
pub mod device;
pub mod error;
pub mod explorer;
pub mod logging;
pub mod price;
pub mod runtime;
pub mod wallet;

pub use config::{load_dotenv, Network, WalletConfig};
pub use device::{DeviceError, DeviceHandle, DeviceSigner, SeedDevice, SigningRequest, WalletDescriptor};
pub use error::{Result, WalletError};
pub use explorer::{BlockExplorer, EsploraClient, ExplorerError};
pub use price::{PriceFeed, PriceQuote, PriceSource};
pub use runtime::{install_signal_handlers, Shutdown};
pub use wallet::{
    finalize_psbt, select_coins, verify_message, AddressLedger, AddressRecord, SendReceipt, SendRequest, SignedMessage,
    TransactionBuilder, TransactionDraft, UnspentOutput, WalletBalance, WalletSession, WalletSnapshot, WalletTransaction,
    DUST_THRESHOLD,
};
