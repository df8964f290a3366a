//! UTXO derivation (C7): a pure function of (history, transactions, locks).
//! Because nothing here is cached, reorgs just re-derive the set.

use super::state::WalletData;
use crate::keys::ScriptHash;
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, Txid};
use std::collections::HashSet;

/// A spendable output belonging to one of our keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utxo {
    pub scripthash: ScriptHash,
    pub outpoint: OutPoint,
    pub value: Amount,
    /// `> 0` confirmed at that height, `0` unconfirmed, `-1` unconfirmed
    /// with an unconfirmed parent.
    pub height: i32,
}

impl Utxo {
    pub fn is_confirmed(&self) -> bool {
        self.height > 0
    }
}

/// Derives every UTXO across all tracked scripthashes.
pub fn derive_utxos(data: &WalletData) -> Vec<Utxo> {
    data.all_scripthashes()
        .flat_map(|sh| derive_utxos_for_scripthash(data, sh))
        .collect()
}

/// Derives the UTXO set belonging to a single scripthash.
pub fn derive_utxos_for_scripthash(data: &WalletData, sh: ScriptHash) -> Vec<Utxo> {
    let history = match data.history.get(&sh) {
        Some(history) => history,
        None => return Vec::new(),
    };

    let txids: Vec<Txid> = history.iter().map(|(txid, _)| *txid).collect();
    let mut spent: HashSet<OutPoint> = HashSet::new();
    for txid in &txids {
        if let Some(tx) = data.transactions.get(txid) {
            spent.extend(tx.input.iter().map(|input| input.previous_output));
        }
    }

    let mut utxos = Vec::new();
    for (txid, height) in history {
        let tx = match data.transactions.get(txid) {
            Some(tx) => tx,
            None => continue,
        };
        for (vout, output) in tx.output.iter().enumerate() {
            if output.script_pubkey != script_for(data, sh) {
                continue;
            }
            let outpoint = OutPoint {
                txid: *txid,
                vout: vout as u32,
            };
            if spent.contains(&outpoint) {
                continue;
            }
            utxos.push(Utxo {
                scripthash: sh,
                outpoint,
                value: output.value,
                height: *height,
            });
        }
    }
    utxos
}

fn script_for(data: &WalletData, sh: ScriptHash) -> bitcoin::ScriptBuf {
    data.pubkey_for(sh)
        .and_then(|pk| data.scheme().output_script(&pk).ok())
        .unwrap_or_default()
}

/// Reverse lookup: which of our scripthashes (if any) owns `script`.
pub fn scripthash_owning(data: &WalletData, script: &ScriptBuf) -> Option<ScriptHash> {
    data.all_scripthashes()
        .find(|sh| script_for(data, *sh) == *script)
}

/// `(received, sent, fee)` for `tx` from this wallet's perspective.
/// `received` sums outputs paying one of our scripthashes; `sent` sums the
/// value of our own inputs being spent; `fee` is only `Some` when every
/// input's prevout is known (the caller only calls this once
/// `hasAllParents` holds).
pub fn compute_transaction_delta(data: &WalletData, tx: &Transaction) -> (Amount, Amount, Option<Amount>) {
    let received: Amount = tx
        .output
        .iter()
        .filter(|output| scripthash_owning(data, &output.script_pubkey).is_some())
        .map(|output| output.value)
        .sum();

    let mut sent = Amount::ZERO;
    let mut total_in = Amount::ZERO;
    let mut all_inputs_known = true;
    for input in &tx.input {
        match data
            .transactions
            .get(&input.previous_output.txid)
            .and_then(|prev| prev.output.get(input.previous_output.vout as usize))
        {
            Some(prevout) => {
                total_in += prevout.value;
                if scripthash_owning(data, &prevout.script_pubkey).is_some() {
                    sent += prevout.value;
                }
            }
            None => all_inputs_known = false,
        }
    }

    let total_out: Amount = tx.output.iter().map(|output| output.value).sum();
    let fee = if all_inputs_known {
        total_in.checked_sub(total_out)
    } else {
        None
    };
    (received, sent, fee)
}

/// UTXOs excluding anything whose outpoint is an input of a currently
/// locked (built-but-uncommitted) transaction.
pub fn spendable_utxos(data: &WalletData) -> Vec<Utxo> {
    let locked_inputs: HashSet<OutPoint> = data
        .locks
        .values()
        .flat_map(|tx| tx.input.iter().map(|input| input.previous_output))
        .collect();
    derive_utxos(data)
        .into_iter()
        .filter(|utxo| !locked_inputs.contains(&utxo.outpoint))
        .collect()
}
