use crate::constants::{DEFAULT_DUST_LIMIT_SAT, DEFAULT_GAP_LIMIT, DEFAULT_MINIMUM_FEE_SAT};
use crate::keys::WalletType;
use bitcoin::Network;

/// Embedder-supplied wallet parameters. No env/file parsing lives in this
/// crate; a host binary is expected to construct this from its own
/// configuration layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalletConfig {
    pub wallet_type: WalletType,
    pub network: Network,
    pub minimum_fee: u64,
    pub dust_limit: u64,
    pub gap_limit: u32,
    pub allow_spend_unconfirmed: bool,
}

impl WalletConfig {
    pub fn new(wallet_type: WalletType, network: Network) -> Self {
        Self {
            wallet_type,
            network,
            minimum_fee: DEFAULT_MINIMUM_FEE_SAT,
            dust_limit: DEFAULT_DUST_LIMIT_SAT,
            gap_limit: DEFAULT_GAP_LIMIT,
            allow_spend_unconfirmed: true,
        }
    }

    /// The orphan-transaction replay queue's capacity, per design note (C11):
    /// four times the gap limit.
    pub fn max_orphan_transactions(&self) -> usize {
        self.gap_limit as usize * 4
    }
}
