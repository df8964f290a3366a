//! The remote server client boundary (C6 external interface).
//!
//! Request/response naming mirrors the shape of the `electrum-client` crate's
//! surface (`block_headers_subscribe`, `script_subscribe`,
//! `script_get_history`, `transaction_get`, `transaction_get_merkle`,
//! `transaction_broadcast`), though no such client is linked by this crate.
//! Errors cross this boundary as `anyhow::Result`; the FSM wraps them into
//! `Error::Backend`.

use crate::keys::ScriptHash;
use anyhow::Result;
use bitcoin::block::Header;
use bitcoin::{Transaction, Txid};

/// A request the FSM may issue to the server client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    HeaderSubscription,
    ScriptHashSubscription(ScriptHash),
    GetHeaders { start: u32, count: u32 },
    GetScriptHashHistory(ScriptHash),
    GetTransaction(Txid),
    GetMerkle { txid: Txid, height: u32 },
    BroadcastTransaction(Transaction),
}

/// `(txid, confirmation height)`; `0` = unconfirmed, `-1` = unconfirmed with
/// at least one unconfirmed input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryItem {
    pub txid: Txid,
    pub height: i32,
}

/// A merkle inclusion proof for a single transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub txid: Txid,
    pub merkle_path: Vec<bitcoin::hashes::sha256d::Hash>,
    pub included_at_height: u32,
    pub computed_root: bitcoin::TxMerkleNode,
}

/// A response arriving from the server client, either in answer to a
/// [`Request`] or as an unsolicited push (subscription updates, connection
/// lifecycle).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    HeaderSubscriptionResponse { height: u32, header: Header },
    ScriptHashSubscriptionResponse { scripthash: ScriptHash, status: String },
    GetHeadersResponse { start: u32, headers: Vec<Header> },
    GetScriptHashHistoryResponse {
        scripthash: ScriptHash,
        items: Vec<HistoryItem>,
    },
    GetTransactionResponse(Transaction),
    GetMerkleResponse(MerkleProof),
    BroadcastTransactionResponse(Txid),
    ServerReady,
    Disconnected,
    ServerError { request: Request, details: String },
}

/// The network boundary: a typed request/response interface the FSM drives
/// one call at a time (see concurrency model, §5). No production-network
/// implementation lives in this crate.
#[async_trait::async_trait]
pub trait ServerClient: Send + Sync {
    async fn send(&self, request: Request) -> Result<()>;
}
