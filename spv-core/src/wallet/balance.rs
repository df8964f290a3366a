//! Balance and confirmation depth (§4.8).

use super::state::WalletData;
use super::utxo::derive_utxos;
use bitcoin::{Amount, Txid};

/// `max(0, tip - height + 1)` for a confirmed tx, else `0`.
pub fn depth(data: &WalletData, txid: Txid) -> u32 {
    match data.heights.get(&txid) {
        Some(height) if *height > 0 => {
            let height = *height as u32;
            let tip = data.chain().tip_height();
            tip.saturating_sub(height) + 1
        }
        _ => 0,
    }
}

/// `(confirmed, unconfirmed)` totals, summed over every tracked UTXO. The
/// scripthash-wise sum is taken over the full (non-deduplicated) UTXO list,
/// since distinct outpoints of equal value must each be counted.
pub fn balance(data: &WalletData) -> (Amount, Amount) {
    let mut confirmed = Amount::ZERO;
    let mut unconfirmed = Amount::ZERO;
    for utxo in derive_utxos(data) {
        if utxo.is_confirmed() {
            confirmed += utxo.value;
        } else {
            unconfirmed += utxo.value;
        }
    }
    (confirmed, unconfirmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalletConfig;
    use crate::constants::checkpoints;
    use crate::headers::HeaderChain;
    use crate::keys::{KeyHierarchy, WalletType};
    use bitcoin::hashes::Hash;
    use bitcoin::Network;

    fn fresh_wallet() -> WalletData {
        let keys = KeyHierarchy::from_seed(&[3u8; 32], Network::Regtest, WalletType::NativeSegwit).unwrap();
        let chain = HeaderChain::new(Network::Regtest, checkpoints(Network::Regtest)[0]);
        let config = WalletConfig::new(WalletType::NativeSegwit, Network::Regtest);
        WalletData::new(config, keys, chain).unwrap()
    }

    #[test]
    fn fresh_wallet_has_zero_balance() {
        let data = fresh_wallet();
        assert_eq!(balance(&data), (Amount::ZERO, Amount::ZERO));
    }

    #[test]
    fn unknown_tx_has_zero_depth() {
        let data = fresh_wallet();
        assert_eq!(depth(&data, Txid::from_byte_array([0u8; 32])), 0);
    }
}
