//! Coin selector and transaction builder (C8): `completeTransaction`,
//! `commitTransaction`, `cancelTransaction`, `spendAll`, `IsDoubleSpent`.
//!
//! The growth/stop decision below is a hand-rolled fee-accurate selection
//! loop: plain `Weight` arithmetic and satoshi-per-kilo-weight-unit rates,
//! no coin-selection crate in the loop (see the grounding ledger for why).

use crate::error::{Error, Result};
use crate::wallet::{depth, scripthash_owning, spendable_utxos, Branch, WalletData};
use bitcoin::secp256k1::SecretKey;
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxIn, TxOut, Txid, Weight};
use std::collections::HashSet;

/// Builds, selects inputs for, and signs a transaction that already carries
/// its outputs. `tx.input` must be empty; every output must clear the dust
/// limit.
pub fn complete_transaction(
    data: &mut WalletData,
    mut tx: Transaction,
    fee_rate_per_kw: u64,
) -> Result<(Transaction, Amount)> {
    if !tx.input.is_empty() {
        return Err(Error::InputsNotEmpty);
    }
    let dust_limit = Amount::from_sat(data.config().dust_limit);
    for output in &tx.output {
        if output.value < dust_limit {
            return Err(Error::AmountBelowDustLimit(output.value));
        }
    }
    let amount: Amount = tx.output.iter().map(|o| o.value).sum();
    if amount <= dust_limit {
        return Err(Error::AmountBelowDustLimit(amount));
    }

    let change_script = data.current_change_address()?.script_pubkey();

    let mut candidates = spendable_utxos(data);
    if !data.config().allow_spend_unconfirmed {
        candidates.retain(|utxo| utxo.height > 0);
    }
    candidates.sort_by_key(|utxo| utxo.value);

    let total_available: Amount = candidates.iter().map(|u| u.value).sum();
    let input_weight = data.scheme().input_weight();

    for n in 1..=candidates.len() {
        let selected = &candidates[..n];
        let total: Amount = selected.iter().map(|u| u.value).sum();
        if total < amount {
            continue;
        }

        let fee_no_change = estimate_fee(n, input_weight, &tx.output, fee_rate_per_kw);
        let with_change_outputs = append(&tx.output, &change_script, Amount::ZERO);
        let fee_with_change = estimate_fee(n, input_weight, &with_change_outputs, fee_rate_per_kw);

        let no_change_excess = total.checked_sub(amount + fee_no_change);
        let with_change_excess = total.checked_sub(amount + fee_with_change);

        // Prefer a genuine change output whenever there's enough room for
        // one above the dust limit; otherwise, if the no-change fee is
        // already covered, let the excess become part of the fee.
        let change = match with_change_excess {
            Some(excess) if excess >= dust_limit => Some(Some(excess)),
            _ => no_change_excess.map(|_| None),
        };

        let Some(change) = change else { continue };

        for utxo in selected {
            tx.input.push(TxIn {
                previous_output: utxo.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: data.scheme().sequence(),
                witness: bitcoin::Witness::new(),
            });
        }
        if let Some(change_amount) = change {
            tx.output.push(TxOut {
                value: change_amount,
                script_pubkey: change_script,
            });
        }

        sign_inputs(data, &mut tx, selected)?;

        let total_out: Amount = tx.output.iter().map(|o| o.value).sum();
        let actual_fee = total - total_out;

        let txid = tx.compute_txid();
        data.locks.insert(txid, tx.clone());
        return Ok((tx, actual_fee));
    }

    Err(Error::InsufficientFunds {
        needed: amount,
        available: total_available,
    })
}

/// Consumes every tracked UTXO (including locked and unconfirmed) into a
/// single output, paying the remainder as fee.
pub fn spend_all(
    data: &mut WalletData,
    script: ScriptBuf,
    fee_rate_per_kw: u64,
) -> Result<(Transaction, Amount)> {
    let utxos = crate::wallet::derive_utxos(data);
    let dust_limit = Amount::from_sat(data.config().dust_limit);
    if utxos.is_empty() {
        return Err(Error::InsufficientFunds {
            needed: dust_limit,
            available: Amount::ZERO,
        });
    }
    let total: Amount = utxos.iter().map(|u| u.value).sum();
    let placeholder = TxOut {
        value: Amount::ZERO,
        script_pubkey: script.clone(),
    };
    let fee = estimate_fee(
        utxos.len(),
        data.scheme().input_weight(),
        std::slice::from_ref(&placeholder),
        fee_rate_per_kw,
    );
    if total <= fee + dust_limit {
        return Err(Error::InsufficientFunds {
            needed: fee + dust_limit,
            available: total,
        });
    }

    let mut tx = Transaction {
        version: bitcoin::transaction::Version::TWO,
        lock_time: bitcoin::absolute::LockTime::ZERO,
        input: utxos
            .iter()
            .map(|utxo| TxIn {
                previous_output: utxo.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: data.scheme().sequence(),
                witness: bitcoin::Witness::new(),
            })
            .collect(),
        output: vec![TxOut {
            value: total - fee,
            script_pubkey: script,
        }],
    };

    sign_inputs(data, &mut tx, &utxos)?;
    let txid = tx.compute_txid();
    data.locks.insert(txid, tx.clone());
    Ok((tx, fee))
}

/// Removes `tx` from `locks`, records it as unconfirmed, and optimistically
/// extends history for its inputs/outputs so chained builds can see it
/// before the server acknowledges it.
pub fn commit_transaction(data: &mut WalletData, tx: Transaction) -> Result<()> {
    let txid = tx.compute_txid();
    data.locks
        .remove(&txid)
        .ok_or(Error::UnknownLockedTransaction)?;

    for input in &tx.input {
        if let Some(sh) = scripthash_of_outpoint(data, input.previous_output) {
            prepend_history(data, sh, txid);
        }
    }
    let matched_outputs: Vec<_> = tx
        .output
        .iter()
        .filter_map(|output| scripthash_owning(data, &output.script_pubkey))
        .collect();
    for sh in matched_outputs {
        prepend_history(data, sh, txid);
    }

    data.transactions.insert(txid, tx);
    data.heights.insert(txid, 0);
    Ok(())
}

/// Unlocks `tx`'s inputs without affecting tracked history.
pub fn cancel_transaction(data: &mut WalletData, tx: &Transaction) -> Result<()> {
    let txid = tx.compute_txid();
    data.locks
        .remove(&txid)
        .ok_or(Error::UnknownLockedTransaction)?;
    Ok(())
}

/// True iff some tracked transaction with depth >= 2 consumes one of `tx`'s
/// input outpoints under a different txid.
pub fn is_double_spent(data: &WalletData, tx: &Transaction) -> bool {
    let txid = tx.compute_txid();
    let our_inputs: HashSet<OutPoint> =
        tx.input.iter().map(|input| input.previous_output).collect();

    data.transactions.iter().any(|(other_txid, other_tx)| {
        *other_txid != txid
            && depth(data, *other_txid) >= 2
            && other_tx
                .input
                .iter()
                .any(|input| our_inputs.contains(&input.previous_output))
    })
}

fn scripthash_of_outpoint(data: &WalletData, outpoint: OutPoint) -> Option<crate::keys::ScriptHash> {
    let tx = data.transactions.get(&outpoint.txid)?;
    let output = tx.output.get(outpoint.vout as usize)?;
    scripthash_owning(data, &output.script_pubkey)
}

fn prepend_history(data: &mut WalletData, sh: crate::keys::ScriptHash, txid: Txid) {
    let history = data.history.entry(sh).or_default();
    if !history.iter().any(|(existing, _)| *existing == txid) {
        history.insert(0, (txid, 0));
    }
}

fn sign_inputs(
    data: &WalletData,
    tx: &mut Transaction,
    selected: &[crate::wallet::Utxo],
) -> Result<()> {
    for (index, utxo) in selected.iter().enumerate() {
        let prevout = data
            .transactions
            .get(&utxo.outpoint.txid)
            .and_then(|prev_tx| prev_tx.output.get(utxo.outpoint.vout as usize))
            .cloned()
            .ok_or(Error::MissingPrevout(index))?;
        let secret_key = secret_key_for(data, utxo.scripthash)?;
        data.scheme()
            .sign_input(data.keys.secp(), tx, index, &prevout, &secret_key)?;
    }
    Ok(())
}

fn secret_key_for(data: &WalletData, sh: crate::keys::ScriptHash) -> Result<SecretKey> {
    let key_ref = data
        .key_ref(sh)
        .ok_or(Error::KeyDerivation("scripthash has no owning key"))?;
    let xpriv = match key_ref.branch {
        Branch::Account => data.keys.derive_account_key(key_ref.index)?,
        Branch::Change => data.keys.derive_change_key(key_ref.index)?,
    };
    Ok(xpriv.private_key)
}

fn append(outputs: &[TxOut], script: &ScriptBuf, value: Amount) -> Vec<TxOut> {
    let mut out = outputs.to_vec();
    out.push(TxOut {
        value,
        script_pubkey: script.clone(),
    });
    out
}

/// Weight-based fee estimate, rounded up: base transaction overhead, plus
/// `num_inputs` times the wallet scheme's per-input weight, plus each
/// output's own encoded weight. `rate` is satoshis per 1000 weight units.
fn estimate_fee(num_inputs: usize, input_weight: Weight, outputs: &[TxOut], rate: u64) -> Amount {
    let weight = base_weight(num_inputs, outputs.len())
        + input_weight * num_inputs as u64
        + outputs.iter().map(|o| output_weight(o)).sum();
    let fee_sat = (weight.to_wu() * rate).div_ceil(1000);
    Amount::from_sat(fee_sat)
}

fn base_weight(num_inputs: usize, num_outputs: usize) -> Weight {
    // version (4) + locktime (4), scaled 4x, plus the segwit marker/flag
    // (2 raw bytes, unscaled) and the input/output count varints.
    let non_witness_bytes = 8 + varint_len(num_inputs) + varint_len(num_outputs);
    Weight::from_wu(non_witness_bytes as u64 * 4 + 2)
}

fn output_weight(output: &TxOut) -> Weight {
    let script_len = output.script_pubkey.len();
    let bytes = 8 + varint_len(script_len) + script_len;
    Weight::from_wu(bytes as u64 * 4)
}

fn varint_len(n: usize) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}
