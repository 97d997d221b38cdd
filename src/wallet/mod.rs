//! Wallet module - address ledger, coin selection and the send pipeline
//!
//! # Architecture
//!
//! ```text
//! WalletSession (owned by the caller)
//!     │
//!     ├── AddressLedger      receive addresses, used flags, batches of 5
//!     │
//!     ├── TransactionBuilder fetch UTXOs → select → PSBT → sign → finalize → broadcast
//!     │       │
//!     │       └── selection  greedy largest-first, dust-aware change
//!     │
//!     └── message            sign / verify text messages
//! ```
//!
//! # Operations
//!
//! | Operation | Device | Explorer |
//! |-----------|--------|----------|
//! | `connect` | fingerprint, xpub, 5 addresses | - |
//! | `refresh` | - | stats + history per address |
//! | `receive_address` | 5 more addresses when all used | - |
//! | `verify_address` | show address | - |
//! | `preview` | - | UTXOs |
//! | `send` | sign PSBT | UTXOs, parent txs, broadcast |
//! | `sign_message` | sign message | - |

mod builder;
mod ledger;
pub mod message;
pub mod selection;
mod session;

pub use builder::{finalize_psbt, ChangeOutput, SendReceipt, SendRequest, TransactionBuilder, TransactionDraft};
pub use ledger::{AddressLedger, AddressRecord};
pub use message::{verify_message, SignedMessage};
pub use selection::{select_coins, Selection, UnspentOutput, DUST_THRESHOLD};
pub use session::{WalletBalance, WalletSession, WalletSnapshot, WalletTransaction};
