//! Aggregated wallet state (C5): the one large record the FSM mutates in
//! place. Logically a pure function of (history, transactions) at any
//! instant — see §9's note on the same pragmatic compromise this crate
//! makes between a fully functional model and a mutable working set.

use crate::config::WalletConfig;
use crate::headers::HeaderChain;
use crate::keys::{KeyHierarchy, ScriptHash, WalletScheme};
use crate::server::{HistoryItem, MerkleProof};
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Address, Transaction, Txid};
use std::collections::{HashMap, HashSet, VecDeque};

/// Which derivation branch a scripthash belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Branch {
    Account,
    Change,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyRef {
    pub branch: Branch,
    pub index: u32,
}

/// The last `WalletReady` payload published, kept for cheap equality
/// comparison against the freshly computed one (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadySnapshot {
    pub confirmed: u64,
    pub unconfirmed: u64,
    pub tip_height: u32,
    pub tip_time: u32,
}

pub struct WalletData {
    pub(crate) config: WalletConfig,
    pub(crate) keys: KeyHierarchy,
    pub(crate) scheme: Box<dyn WalletScheme>,
    pub(crate) chain: HeaderChain,

    pub(crate) account_keys: Vec<PublicKey>,
    pub(crate) change_keys: Vec<PublicKey>,
    pub(crate) scripthash_index: HashMap<ScriptHash, KeyRef>,

    pub(crate) status: HashMap<ScriptHash, String>,
    pub(crate) history: HashMap<ScriptHash, Vec<(Txid, i32)>>,
    pub(crate) transactions: HashMap<Txid, Transaction>,
    pub(crate) heights: HashMap<Txid, i32>,
    pub(crate) proofs: HashMap<Txid, MerkleProof>,
    pub(crate) locks: HashMap<Txid, Transaction>,

    pub(crate) pending_history_requests: HashSet<ScriptHash>,
    pub(crate) pending_transaction_requests: HashSet<Txid>,
    pub(crate) pending_headers_requests: HashSet<u32>,

    /// Transactions whose parents are not yet all known, oldest-first.
    pub(crate) orphan_transactions: VecDeque<Transaction>,

    /// Merkle responses received while their enclosing header chunk was
    /// still missing; replayed once that chunk is backfilled (§4.4's
    /// self-tail-recursion pattern for `GetMerkleResponse`).
    pub(crate) pending_merkle_responses: Vec<MerkleProof>,

    /// `(scripthash, status)` pairs already observed, so gap-limit
    /// expansion only triggers on a scripthash's genuinely first
    /// non-empty status (§9 open question c).
    pub(crate) seen_statuses: HashSet<(ScriptHash, String)>,

    pub(crate) last_ready: Option<ReadySnapshot>,
}

impl WalletData {
    pub fn new(config: WalletConfig, keys: KeyHierarchy, chain: HeaderChain) -> crate::error::Result<Self> {
        let scheme = config.wallet_type.scheme();
        let mut data = Self {
            config,
            keys,
            scheme,
            chain,
            account_keys: Vec::new(),
            change_keys: Vec::new(),
            scripthash_index: HashMap::new(),
            status: HashMap::new(),
            history: HashMap::new(),
            transactions: HashMap::new(),
            heights: HashMap::new(),
            proofs: HashMap::new(),
            locks: HashMap::new(),
            pending_history_requests: HashSet::new(),
            pending_transaction_requests: HashSet::new(),
            pending_headers_requests: HashSet::new(),
            orphan_transactions: VecDeque::new(),
            pending_merkle_responses: Vec::new(),
            seen_statuses: HashSet::new(),
            last_ready: None,
        };
        data.push_initial_keys(Branch::Account, data.config.gap_limit)?;
        data.push_initial_keys(Branch::Change, data.config.gap_limit)?;
        Ok(data)
    }

    /// Derives the first `count` keys of `branch` and registers them.
    /// Derivation itself (CPU-bound secp256k1 scalar multiplication) runs
    /// across a rayon pool when the `parallel` feature is enabled and the
    /// target isn't WASM; registration into the state maps stays
    /// sequential since it's cheap and needs `&mut self` anyway.
    fn push_initial_keys(&mut self, branch: Branch, count: u32) -> crate::error::Result<()> {
        let indices: Vec<u32> = (0..count).collect();

        #[cfg(all(not(target_arch = "wasm32"), feature = "parallel"))]
        let derived: Vec<crate::error::Result<(PublicKey, ScriptHash)>> = {
            use rayon::prelude::*;
            indices
                .into_par_iter()
                .map(|index| self.derive_key(branch, index))
                .collect()
        };

        #[cfg(not(all(not(target_arch = "wasm32"), feature = "parallel")))]
        let derived: Vec<crate::error::Result<(PublicKey, ScriptHash)>> = indices
            .into_iter()
            .map(|index| self.derive_key(branch, index))
            .collect();

        for (index, result) in derived.into_iter().enumerate() {
            let (pubkey, scripthash) = result?;
            self.register_key(branch, index as u32, pubkey, scripthash);
        }
        Ok(())
    }

    fn derive_key(&self, branch: Branch, index: u32) -> crate::error::Result<(PublicKey, ScriptHash)> {
        let xpriv = match branch {
            Branch::Account => self.keys.derive_account_key(index)?,
            Branch::Change => self.keys.derive_change_key(index)?,
        };
        let pubkey = xpriv.private_key.public_key(self.keys.secp());
        let scripthash = self.scheme.scripthash(&pubkey)?;
        Ok((pubkey, scripthash))
    }

    fn register_key(&mut self, branch: Branch, index: u32, pubkey: PublicKey, scripthash: ScriptHash) {
        match branch {
            Branch::Account => {
                debug_assert_eq!(index as usize, self.account_keys.len());
                self.account_keys.push(pubkey);
            }
            Branch::Change => {
                debug_assert_eq!(index as usize, self.change_keys.len());
                self.change_keys.push(pubkey);
            }
        }
        self.scripthash_index
            .insert(scripthash, KeyRef { branch, index });
        self.status.insert(scripthash, String::new());
        self.history.entry(scripthash).or_default();
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn chain(&self) -> &HeaderChain {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut HeaderChain {
        &mut self.chain
    }

    pub fn scheme(&self) -> &dyn WalletScheme {
        self.scheme.as_ref()
    }

    /// Derives and registers the next key on `branch`, returning its
    /// scripthash so the caller (FSM) can subscribe to it.
    pub fn push_key(&mut self, branch: Branch) -> crate::error::Result<ScriptHash> {
        let index = match branch {
            Branch::Account => self.account_keys.len() as u32,
            Branch::Change => self.change_keys.len() as u32,
        };
        let (pubkey, scripthash) = self.derive_key(branch, index)?;
        self.register_key(branch, index, pubkey, scripthash);
        Ok(scripthash)
    }

    pub fn scripthash_for(&self, branch: Branch, index: u32) -> Option<ScriptHash> {
        self.scripthash_index
            .iter()
            .find(|(_, key_ref)| key_ref.branch == branch && key_ref.index == index)
            .map(|(sh, _)| *sh)
    }

    pub fn pubkey_for(&self, sh: ScriptHash) -> Option<PublicKey> {
        let key_ref = *self.scripthash_index.get(&sh)?;
        match key_ref.branch {
            Branch::Account => self.account_keys.get(key_ref.index as usize).copied(),
            Branch::Change => self.change_keys.get(key_ref.index as usize).copied(),
        }
    }

    pub fn key_ref(&self, sh: ScriptHash) -> Option<KeyRef> {
        self.scripthash_index.get(&sh).copied()
    }

    pub fn all_scripthashes(&self) -> impl Iterator<Item = ScriptHash> + '_ {
        self.scripthash_index.keys().copied()
    }

    /// Number of trailing consecutive unused keys on `branch`.
    fn trailing_unused(&self, branch: Branch) -> u32 {
        let keys = match branch {
            Branch::Account => &self.account_keys,
            Branch::Change => &self.change_keys,
        };
        let mut count = 0u32;
        for index in (0..keys.len() as u32).rev() {
            let sh = match self.scripthash_for(branch, index) {
                Some(sh) => sh,
                None => break,
            };
            if self.status.get(&sh).map(|s| s.is_empty()).unwrap_or(false) {
                count += 1;
            } else {
                break;
            }
        }
        count
    }

    /// Extends `branch` until it has at least `gap_limit` trailing unused
    /// keys. Returns the scripthashes of any newly created keys, which the
    /// caller must subscribe to.
    pub fn maintain_gap_limit(&mut self, branch: Branch) -> crate::error::Result<Vec<ScriptHash>> {
        let mut created = Vec::new();
        while self.trailing_unused(branch) < self.config.gap_limit {
            created.push(self.push_key(branch)?);
        }
        Ok(created)
    }

    /// The receive address: the first account key whose status is empty,
    /// falling back to the very first account key if every key is used.
    pub fn current_receive_address(&self) -> crate::error::Result<Address> {
        self.current_address(Branch::Account)
    }

    pub fn current_change_address(&self) -> crate::error::Result<Address> {
        self.current_address(Branch::Change)
    }

    fn current_address(&self, branch: Branch) -> crate::error::Result<Address> {
        let keys = match branch {
            Branch::Account => &self.account_keys,
            Branch::Change => &self.change_keys,
        };
        let chosen = (0..keys.len() as u32)
            .find(|index| {
                self.scripthash_for(branch, *index)
                    .and_then(|sh| self.status.get(&sh))
                    .map(|s| s.is_empty())
                    .unwrap_or(false)
            })
            .unwrap_or(0);
        self.scheme
            .address(&keys[chosen as usize], self.config.network)
    }

    /// Wallet readiness per §4.5: both branches together hold at least
    /// `2*gapLimit` never-used keys and no history/tx request is in flight.
    pub fn is_ready(&self) -> bool {
        let unused = self.status.values().filter(|s| s.is_empty()).count() as u32;
        unused >= 2 * self.config.gap_limit
            && self.pending_history_requests.is_empty()
            && self.pending_transaction_requests.is_empty()
    }

    pub fn push_orphan(&mut self, tx: Transaction) {
        self.orphan_transactions.push_back(tx);
        let cap = self.config.max_orphan_transactions();
        while self.orphan_transactions.len() > cap {
            self.orphan_transactions.pop_front();
        }
    }

    pub fn take_orphans(&mut self) -> VecDeque<Transaction> {
        std::mem::take(&mut self.orphan_transactions)
    }
}
