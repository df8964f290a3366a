//! Embedder-facing facade over `spv-core`: re-exports the engine's public
//! surface and ships one ready-to-use [`WalletDb`] implementation
//! (`filedb::FileWalletDb`) so a host binary can get a wallet running
//! without writing its own persistence layer first.

pub mod filedb;

pub use spv_core::bitcoin;
pub use spv_core::{
    coinselect, config, constants, error, events, fsm, headers, keys, persistence, server, wallet,
};
pub use spv_core::{Error, Event, EventSink, FsmState, KeyHierarchy, Request, Response, Result,
    ScriptHash, ServerClient, Snapshot, Wallet, WalletConfig, WalletDb, WalletType};
