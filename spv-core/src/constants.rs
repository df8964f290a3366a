//! Protocol-wide constants and per-network checkpoint anchors (C1).
//!
//! A checkpoint is a header hash the wallet trusts without re-verifying the
//! whole chain above it. Checkpoints fall on retarget boundaries so that the
//! header chain (`headers::chain`) can resume difficulty verification cleanly
//! from the checkpoint's height. The genesis block is always an implicit
//! checkpoint at height 0; additional anchors can be layered on top of it as
//! the chain advances (wired in by the embedder via [`Checkpoint::new`]).

use bitcoin::block::Header;
use bitcoin::Network;

/// Height of the Bitcoin difficulty-adjustment interval.
pub const RETARGETING_PERIOD: u32 = 2016;

/// Default relay/broadcast fee floor, in satoshis per kilo-weight-unit.
pub const DEFAULT_MINIMUM_FEE_SAT: u64 = 2000;

/// Default dust limit, in satoshis.
pub const DEFAULT_DUST_LIMIT_SAT: u64 = 546;

/// Default BIP44-style gap limit: number of trailing unused keys kept per branch.
pub const DEFAULT_GAP_LIMIT: u32 = 10;

/// A verified anchor point: the full header at `height`, which must be a
/// multiple of [`RETARGETING_PERIOD`] (height 0 is the one exception, since
/// genesis is never itself a retarget boundary but is always trusted). The
/// full header (not just its hash) is kept because the next retarget after
/// the checkpoint needs the timestamp of the window it closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub height: u32,
    pub header: Header,
}

impl Checkpoint {
    pub const fn new(height: u32, header: Header) -> Self {
        Self { height, header }
    }

    pub fn hash(&self) -> bitcoin::BlockHash {
        self.header.block_hash()
    }
}

/// Returns the checkpoint list for `network`, ordered by ascending height.
///
/// Every network is anchored at its genesis block. Regtest and signet carry
/// no further anchors, since those chains are expected to be short-lived and
/// locally generated; mainnet and testnet deployments are expected to layer
/// additional retarget-boundary checkpoints on top via their own build
/// configuration rather than this crate hardcoding values that go stale as
/// the chain grows.
pub fn checkpoints(network: Network) -> Vec<Checkpoint> {
    vec![Checkpoint::new(0, genesis_header(network))]
}

/// Genesis header for `network`.
pub fn genesis_header(network: Network) -> Header {
    bitcoin::blockdata::constants::genesis_block(network).header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_heights_are_retarget_boundaries_or_genesis() {
        for cp in checkpoints(Network::Bitcoin) {
            assert!(cp.height == 0 || cp.height % RETARGETING_PERIOD == 0);
        }
    }

    #[test]
    fn every_network_is_anchored_at_genesis() {
        for network in [
            Network::Bitcoin,
            Network::Testnet,
            Network::Signet,
            Network::Regtest,
        ] {
            let cps = checkpoints(network);
            assert_eq!(cps[0].height, 0);
            assert_eq!(cps[0].hash(), genesis_header(network).block_hash());
        }
    }
}
