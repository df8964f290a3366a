//! Persistence codec (C9) and the `WalletDb` boundary trait.

use crate::keys::ScriptHash;
use crate::server::{HistoryItem, MerkleProof};
use anyhow::Result;
use bitcoin::block::Header;
use bitcoin::{Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The durable subset of wallet state: everything recomputing from scratch
/// would otherwise require re-downloading from the server. Recoverable
/// fields (the in-memory header tree above the checkpoint, derived UTXOs,
/// pending-request sets) are intentionally excluded.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub account_key_count: u32,
    pub change_key_count: u32,
    pub status: HashMap<ScriptHash, String>,
    #[serde(with = "tx_map")]
    pub transactions: HashMap<Txid, Transaction>,
    pub heights: HashMap<Txid, i32>,
    pub history: HashMap<ScriptHash, Vec<(Txid, i32)>>,
    pub proofs: HashMap<Txid, SerializedMerkleProof>,
    #[serde(with = "tx_vec")]
    pub pending_transactions: Vec<Transaction>,
    #[serde(with = "tx_vec")]
    pub locks: Vec<Transaction>,
}

/// [`MerkleProof`] is not itself `Serialize`/`Deserialize` (its path hashes
/// come straight from the wire); this is the persisted mirror.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SerializedMerkleProof {
    pub merkle_path: Vec<bitcoin::hashes::sha256d::Hash>,
    pub included_at_height: u32,
    pub computed_root: bitcoin::TxMerkleNode,
}

impl From<&MerkleProof> for SerializedMerkleProof {
    fn from(proof: &MerkleProof) -> Self {
        Self {
            merkle_path: proof.merkle_path.clone(),
            included_at_height: proof.included_at_height,
            computed_root: proof.computed_root,
        }
    }
}

impl SerializedMerkleProof {
    pub fn into_merkle_proof(self, txid: Txid) -> MerkleProof {
        MerkleProof {
            txid,
            merkle_path: self.merkle_path,
            included_at_height: self.included_at_height,
            computed_root: self.computed_root,
        }
    }
}

/// `bitcoin::Transaction` round-trips through serde via consensus hex, not
/// the default field-by-field derive, to keep the snapshot format stable
/// across `bitcoin` crate versions.
mod tx_map {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        map: &HashMap<Txid, Transaction>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let encoded: HashMap<Txid, String> = map
            .iter()
            .map(|(txid, tx)| (*txid, bitcoin::consensus::encode::serialize_hex(tx)))
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<HashMap<Txid, Transaction>, D::Error> {
        let encoded: HashMap<Txid, String> = HashMap::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(txid, hex)| {
                bitcoin::consensus::encode::deserialize_hex(&hex)
                    .map(|tx| (txid, tx))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

mod tx_vec {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        txs: &[Transaction],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let encoded: Vec<String> = txs
            .iter()
            .map(bitcoin::consensus::encode::serialize_hex)
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Vec<Transaction>, D::Error> {
        let encoded: Vec<String> = Vec::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|hex| {
                bitcoin::consensus::encode::deserialize_hex(&hex).map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

/// The persistence boundary: a single snapshot slot plus an append-only
/// header store. No concrete storage engine ships in this crate.
#[async_trait::async_trait]
pub trait WalletDb: Send + Sync {
    async fn persist(&self, snapshot: &Snapshot) -> Result<()>;
    async fn read_snapshot(&self) -> Result<Option<Snapshot>>;

    async fn add_headers(&self, start: u32, headers: &[Header]) -> Result<()>;
    async fn get_header(&self, height: u32) -> Result<Option<Header>>;
    async fn get_headers(&self, start: u32, limit: u32) -> Result<Vec<Header>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn sample_tx() -> Transaction {
        Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![],
            output: vec![],
        }
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let mut snapshot = Snapshot::default();
        let tx = sample_tx();
        snapshot.transactions.insert(tx.compute_txid(), tx.clone());
        snapshot.account_key_count = 10;
        snapshot.change_key_count = 10;
        snapshot.heights.insert(tx.compute_txid(), 0);

        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, snapshot);
    }

    #[test]
    fn empty_snapshot_round_trips() {
        let snapshot = Snapshot::default();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, snapshot);
    }

    use bitcoin::hashes::sha256d::Hash as Sha256dHash;

    #[test]
    fn merkle_proof_converts_both_ways() {
        let proof = MerkleProof {
            txid: Txid::all_zeros(),
            merkle_path: vec![Sha256dHash::all_zeros()],
            included_at_height: 100,
            computed_root: bitcoin::TxMerkleNode::all_zeros(),
        };
        let serialized = SerializedMerkleProof::from(&proof);
        let restored = serialized.into_merkle_proof(proof.txid);
        assert_eq!(restored, proof);
    }
}
