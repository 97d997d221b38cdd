//! Coin selection: greedy largest-first with a two-pass fee.
//!
//! Accumulate UTXOs by descending value, pricing every step as if a change
//! output will exist. Once the inputs stop changing, price the final shape:
//! keep the change output only when it clears the dust threshold, otherwise
//! the remainder goes to the miner.
//!
//! Sizes are fixed per-element vbyte estimates for P2WPKH, not a weight
//! calculation.

use bitcoin::{Address, OutPoint};

use crate::error::{Result, WalletError};

/// Outputs at or below this value are uneconomical to spend.
pub const DUST_THRESHOLD: u64 = 546;
pub const TX_OVERHEAD_VBYTES: u64 = 10;
pub const INPUT_VBYTES: u64 = 68;
pub const OUTPUT_VBYTES: u64 = 31;

/// Spendable value at a previous transaction output owned by a wallet address.
/// Fetched fresh for every build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutput {
    pub outpoint: OutPoint,
    pub value: u64,
    pub address: Address,
    pub address_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub inputs: Vec<UnspentOutput>,
    pub total_input: u64,
    pub fee: u64,
    /// Present only when above [`DUST_THRESHOLD`]
    pub change: Option<u64>,
    pub vsize: u64,
}

pub fn estimate_vsize(inputs: usize, outputs: usize) -> u64 {
    TX_OVERHEAD_VBYTES + inputs as u64 * INPUT_VBYTES + outputs as u64 * OUTPUT_VBYTES
}

pub fn estimate_fee(inputs: usize, outputs: usize, fee_rate: u64) -> u64 {
    estimate_vsize(inputs, outputs).saturating_mul(fee_rate)
}

/// Select inputs paying `target` sat at `fee_rate` sat/vB.
///
/// Equal values keep their fetch order. Fails with `NoFunds` on an empty set
/// and `InsufficientFunds` once every UTXO is in and still short.
pub fn select_coins(mut utxos: Vec<UnspentOutput>, target: u64, fee_rate: u64) -> Result<Selection> {
    if utxos.is_empty() {
        return Err(WalletError::NoFunds);
    }
    utxos.sort_by(|a, b| b.value.cmp(&a.value));

    let mut inputs = Vec::new();
    let mut total_input = 0u64;
    for utxo in utxos {
        total_input = total_input.saturating_add(utxo.value);
        inputs.push(utxo);
        if total_input >= target.saturating_add(estimate_fee(inputs.len(), 2, fee_rate)) {
            break;
        }
    }

    settle(inputs, total_input, target, fee_rate)
}

/// Price the final input set: with change if it clears dust, else without.
fn settle(inputs: Vec<UnspentOutput>, total_input: u64, target: u64, fee_rate: u64) -> Result<Selection> {
    let n = inputs.len();

    let fee_with_change = estimate_fee(n, 2, fee_rate);
    if let Some(change) = total_input.checked_sub(target.saturating_add(fee_with_change)) {
        if change > DUST_THRESHOLD {
            return Ok(Selection { inputs, total_input, fee: fee_with_change, change: Some(change), vsize: estimate_vsize(n, 2) });
        }
    }

    let fee_single = estimate_fee(n, 1, fee_rate);
    let required = target.saturating_add(fee_single);
    if total_input < required {
        return Err(WalletError::InsufficientFunds {
            required,
            available: total_input,
            max_sendable: total_input.saturating_sub(fee_single),
        });
    }

    // Sub-dust remainder is absorbed into the fee.
    Ok(Selection { inputs, total_input, fee: total_input - target, change: None, vsize: estimate_vsize(n, 1) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;
    use std::str::FromStr;

    fn utxo(tag: u8, value: u64) -> UnspentOutput {
        let address = Address::from_str("bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu").unwrap().assume_checked();
        UnspentOutput {
            outpoint: OutPoint::new(Txid::from_byte_array([tag; 32]), 0),
            value,
            address,
            address_index: 0,
        }
    }

    fn balanced(sel: &Selection, target: u64) -> bool {
        let sum: u64 = sel.inputs.iter().map(|u| u.value).sum();
        sum == sel.total_input && sum == target + sel.fee + sel.change.unwrap_or(0)
    }

    #[test]
    fn size_heuristic() {
        assert_eq!(estimate_vsize(1, 2), 140);
        assert_eq!(estimate_vsize(2, 1), 177);
        assert_eq!(estimate_fee(2, 2, 10), 2080);
    }

    #[test]
    fn two_inputs_needed_once_fee_included() {
        let sel = select_coins(vec![utxo(1, 100_000), utxo(2, 50_000)], 120_000, 10).unwrap();
        assert_eq!(sel.inputs.len(), 2);
        assert_eq!(sel.fee, 2_080);
        assert_eq!(sel.change, Some(150_000 - 120_000 - 2_080));
        assert!(balanced(&sel, 120_000));
    }

    #[test]
    fn largest_first_stops_early() {
        let utxos = vec![utxo(1, 20_000), utxo(2, 500_000), utxo(3, 80_000)];
        let sel = select_coins(utxos, 100_000, 5).unwrap();
        assert_eq!(sel.inputs.len(), 1);
        assert_eq!(sel.inputs[0].value, 500_000);
        assert_eq!(sel.fee, estimate_fee(1, 2, 5));
        assert!(balanced(&sel, 100_000));
    }

    #[test]
    fn equal_values_keep_fetch_order() {
        let utxos = vec![utxo(1, 5_000), utxo(2, 5_000), utxo(3, 7_000)];
        let sel = select_coins(utxos, 10_000, 1).unwrap();
        let tags: Vec<u8> = sel.inputs.iter().map(|u| u.outpoint.txid.to_byte_array()[0]).collect();
        assert_eq!(tags, vec![3, 1]);
    }

    #[test]
    fn dust_change_folds_into_fee() {
        // 1 input, 2 outputs at 10 sat/vB = 1400; remainder 500 is dust
        let sel = select_coins(vec![utxo(1, 121_900)], 120_000, 10).unwrap();
        assert_eq!(sel.change, None);
        assert_eq!(sel.fee, 1_900);
        assert!(sel.fee > estimate_fee(1, 2, 10));
        assert_eq!(sel.vsize, estimate_vsize(1, 1));
        assert!(balanced(&sel, 120_000));
    }

    #[test]
    fn change_exactly_at_dust_is_dropped() {
        let sel = select_coins(vec![utxo(1, 120_000 + 1_400 + DUST_THRESHOLD)], 120_000, 10).unwrap();
        assert_eq!(sel.change, None);

        let sel = select_coins(vec![utxo(1, 120_000 + 1_400 + DUST_THRESHOLD + 1)], 120_000, 10).unwrap();
        assert_eq!(sel.change, Some(DUST_THRESHOLD + 1));
    }

    #[test]
    fn exhausted_set_falls_back_to_single_output() {
        // Short of target + two-output fee (10200) but covers the one-output fee (1090)
        let sel = select_coins(vec![utxo(1, 10_000)], 8_800, 10).unwrap();
        assert_eq!(sel.change, None);
        assert_eq!(sel.fee, 1_200);
        assert!(balanced(&sel, 8_800));
    }

    #[test]
    fn insufficient_reports_max_sendable() {
        let err = select_coins(vec![utxo(1, 1_000)], 2_000, 1).unwrap_err();
        match err {
            WalletError::InsufficientFunds { required, available, max_sendable } => {
                assert_eq!(available, 1_000);
                assert_eq!(required, 2_000 + estimate_fee(1, 1, 1));
                assert_eq!(max_sendable, 1_000 - estimate_fee(1, 1, 1));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn max_sendable_counts_every_input() {
        let err = select_coins(vec![utxo(1, 3_000), utxo(2, 2_000), utxo(3, 1_000)], 10_000, 2).unwrap_err();
        match err {
            WalletError::InsufficientFunds { max_sendable, .. } => {
                assert_eq!(max_sendable, 6_000 - estimate_fee(3, 1, 2));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn fee_larger_than_funds_saturates_to_zero() {
        let err = select_coins(vec![utxo(1, 1_000)], 2_000, 10).unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { max_sendable: 0, .. }));
    }

    #[test]
    fn empty_set_is_no_funds() {
        assert!(matches!(select_coins(vec![], 1_000, 1), Err(WalletError::NoFunds)));
    }

    #[test]
    fn greedy_prefix_is_minimal() {
        let values = [40_000, 25_000, 25_000, 10_000, 3_000, 900];
        let utxos: Vec<_> = values.iter().enumerate().map(|(i, v)| utxo(i as u8, *v)).collect();
        for target in [1_000, 30_000, 39_000, 60_000, 75_000, 95_000, 100_000] {
            let sel = select_coins(utxos.clone(), target, 3).unwrap();
            assert!(balanced(&sel, target), "target {target}");
            if let Some(change) = sel.change {
                assert!(change > DUST_THRESHOLD);
            }
            // One fewer input (greedy order) would not have covered target + fee
            let n = sel.inputs.len();
            if n > 1 {
                let prefix: u64 = values[..n - 1].iter().sum();
                assert!(prefix < target + estimate_fee(n - 1, 2, 3), "target {target}");
            }
        }
    }
}
