//! The wallet state machine (C6): server I/O driver, command surface, and
//! readiness/persistence publication (§4.3-§4.5).

mod states;
mod transitions;

pub use states::FsmState;

use crate::config::WalletConfig;
use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::headers::HeaderChain;
use crate::keys::KeyHierarchy;
use crate::persistence::WalletDb;
use crate::server::ServerClient;
use crate::wallet::WalletData;
use bitcoin::bip32::Xpub;
use bitcoin::{Address, Amount, ScriptBuf, Transaction};

/// The wallet engine: aggregated state plus its injected collaborators.
/// Generic over the server client, persistence, and event-sink traits
/// rather than boxing them, so the embedder pays no vtable cost for its own
/// concrete types.
pub struct Wallet<C: ServerClient, D: WalletDb, E: EventSink> {
    pub(crate) data: WalletData,
    pub(crate) state: FsmState,
    pub(crate) server: C,
    pub(crate) db: D,
    pub(crate) events: E,
}

impl<C: ServerClient, D: WalletDb, E: EventSink> Wallet<C, D, E> {
    pub fn new(
        config: WalletConfig,
        keys: KeyHierarchy,
        chain: HeaderChain,
        server: C,
        db: D,
        events: E,
    ) -> Result<Self> {
        let data = WalletData::new(config, keys, chain)?;
        Ok(Self {
            data,
            state: FsmState::Disconnected,
            server,
            db,
            events,
        })
    }

    /// Rebuilds wallet state from a persisted [`crate::persistence::Snapshot`],
    /// falling back to a fresh wallet with default gap-limit keys if the
    /// snapshot is absent or corrupt (§7 `PersistenceFailure`).
    pub async fn load(
        config: WalletConfig,
        keys: KeyHierarchy,
        chain: HeaderChain,
        server: C,
        db: D,
        events: E,
    ) -> Result<Self> {
        let mut wallet = Self::new(config, keys.clone(), chain.clone(), server, db, events)?;
        match wallet.db.read_snapshot().await {
            Ok(Some(snapshot)) => {
                if let Err(err) = wallet.restore(snapshot) {
                    let failure = Error::PersistenceFailure(err.to_string());
                    log::warn!("discarding corrupt wallet snapshot, starting fresh: {failure}");
                    wallet.data = WalletData::new(config, keys, chain)?;
                }
            }
            Ok(None) => {}
            Err(err) => {
                let failure = Error::PersistenceFailure(err.to_string());
                log::warn!("failed to read wallet snapshot, starting fresh: {failure}");
            }
        }
        Ok(wallet)
    }

    fn restore(&mut self, snapshot: crate::persistence::Snapshot) -> Result<()> {
        use crate::wallet::Branch;

        while (self.data.account_keys.len() as u32) < snapshot.account_key_count {
            self.data.push_key(Branch::Account)?;
        }
        while (self.data.change_keys.len() as u32) < snapshot.change_key_count {
            self.data.push_key(Branch::Change)?;
        }
        self.data.status = snapshot.status;
        self.data.transactions = snapshot.transactions;
        self.data.heights = snapshot.heights;
        self.data.history = snapshot.history;
        self.data.proofs = snapshot
            .proofs
            .into_iter()
            .map(|(txid, proof)| (txid, proof.into_merkle_proof(txid)))
            .collect();
        self.data.locks = snapshot
            .locks
            .into_iter()
            .map(|tx| (tx.compute_txid(), tx))
            .collect();
        for tx in snapshot.pending_transactions {
            self.data.push_orphan(tx);
        }
        Ok(())
    }

    pub fn state(&self) -> &FsmState {
        &self.state
    }

    pub fn balance(&self) -> (Amount, Amount) {
        crate::wallet::balance(&self.data)
    }

    pub fn current_receive_address(&self) -> Result<Address> {
        self.data.current_receive_address()
    }

    pub fn root_pub(&self) -> Xpub {
        self.data.keys.account_xpub()
    }

    pub fn is_double_spent(&self, tx: &Transaction) -> bool {
        crate::coinselect::is_double_spent(&self.data, tx)
    }

    pub fn complete_transaction(
        &mut self,
        tx: Transaction,
        fee_rate_per_kw: u64,
    ) -> Result<(Transaction, Amount)> {
        crate::coinselect::complete_transaction(&mut self.data, tx, fee_rate_per_kw)
    }

    pub fn spend_all(&mut self, script: ScriptBuf, fee_rate_per_kw: u64) -> Result<(Transaction, Amount)> {
        crate::coinselect::spend_all(&mut self.data, script, fee_rate_per_kw)
    }

    pub fn commit_transaction(&mut self, tx: Transaction) -> Result<()> {
        crate::coinselect::commit_transaction(&mut self.data, tx)
    }

    pub fn cancel_transaction(&mut self, tx: &Transaction) -> Result<()> {
        crate::coinselect::cancel_transaction(&mut self.data, tx)
    }

    pub async fn broadcast_transaction(&mut self, tx: Transaction) -> Result<()> {
        if !self.state.is_running() {
            return Err(Error::NotConnected);
        }
        self.server
            .send(crate::server::Request::BroadcastTransaction(tx))
            .await
            .map_err(Error::backend)
    }

    pub(crate) fn to_snapshot(&self) -> crate::persistence::Snapshot {
        crate::persistence::Snapshot {
            account_key_count: self.data.account_keys.len() as u32,
            change_key_count: self.data.change_keys.len() as u32,
            status: self.data.status.clone(),
            transactions: self.data.transactions.clone(),
            heights: self.data.heights.clone(),
            history: self.data.history.clone(),
            proofs: self
                .data
                .proofs
                .iter()
                .map(|(txid, proof)| (*txid, crate::persistence::SerializedMerkleProof::from(proof)))
                .collect(),
            pending_transactions: self.data.orphan_transactions.iter().cloned().collect(),
            locks: self.data.locks.values().cloned().collect(),
        }
    }

    pub(crate) async fn persist(&self) -> Result<()> {
        self.db
            .persist(&self.to_snapshot())
            .await
            .map_err(Error::backend)
    }
}
