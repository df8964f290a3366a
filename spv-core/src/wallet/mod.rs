//! Wallet state aggregation (C5), UTXO derivation (C7), and balance/depth
//! accounting (§4.8).

mod balance;
mod state;
mod utxo;

pub use balance::{balance, depth};
pub use state::{Branch, KeyRef, ReadySnapshot, WalletData};
pub use utxo::{
    compute_transaction_delta, derive_utxos, derive_utxos_for_scripthash, scripthash_owning,
    spendable_utxos, Utxo,
};
