//! Path constants for derivation and the block explorer API
//!
//! Centralized registry for BIP84 derivation components and Esplora routes.

/// BIP84 derivation (native segwit, receive chain only)
pub mod derivation {
    pub const PURPOSE: u32 = 84;
    pub const RECEIVE_CHAIN: u32 = 0;
    /// Addresses derived per batch, at connect time and whenever all are used
    pub const BATCH_SIZE: u32 = 5;
}

/// Esplora REST routes (relative to the base URL)
pub mod explorer {
    pub const ADDRESS: &str = "/address";
    pub const UTXO_SUFFIX: &str = "/utxo";
    pub const TXS_SUFFIX: &str = "/txs";
    pub const TX: &str = "/tx";
    pub const HEX_SUFFIX: &str = "/hex";
    pub const FEE_ESTIMATES: &str = "/fee-estimates";
}

/// Environment variables read by the config layer and CLI
pub mod env {
    pub const NETWORK: &str = "BEESIGNER_NETWORK";
    pub const ACCOUNT: &str = "BEESIGNER_ACCOUNT";
    pub const EXPLORER_URL: &str = "BEESIGNER_EXPLORER_URL";
    pub const FEE_RATE: &str = "BEESIGNER_FEE_RATE";
    pub const MNEMONIC: &str = "BEESIGNER_MNEMONIC";
    pub const LOG_JSON: &str = "BEESIGNER_LOG_JSON";
}
