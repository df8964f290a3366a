//! Header-chain verification and difficulty bookkeeping (C1/C2).

mod chain;
mod work;

pub use chain::HeaderChain;
