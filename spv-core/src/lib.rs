//! SPV Bitcoin wallet engine: header-chain verification, BIP44-style
//! gap-limit key discovery, a four-state connection FSM driven by server
//! pushes, and a coin selector/transaction builder — all parametric over
//! the embedder's own server client, persistence, and event-sink
//! implementations (see [`server::ServerClient`], [`persistence::WalletDb`],
//! [`events::EventSink`]).

pub mod coinselect;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod fsm;
pub mod headers;
pub mod keys;
pub mod persistence;
pub mod server;
pub mod wallet;

pub use config::WalletConfig;
pub use error::{Error, Result};
pub use events::{Event, EventSink};
pub use fsm::{FsmState, Wallet};
pub use keys::{KeyHierarchy, ScriptHash, WalletType};
pub use persistence::{Snapshot, WalletDb};
pub use server::{Request, Response, ServerClient};

// Re-export the `bitcoin` version this crate was built against, so
// embedders construct `Transaction`/`Address`/etc. values that are
// guaranteed type-compatible without pinning a second copy themselves.
pub use bitcoin;
