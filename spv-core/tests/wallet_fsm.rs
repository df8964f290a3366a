//! Integration tests driving [`Wallet`] through a fake [`ServerClient`]/
//! [`WalletDb`] pair, covering the scenarios enumerated for the FSM and
//! coin selector: fresh sync, gap-limit extension, completing a
//! transaction, a reorg, an orphan replay, and a bad merkle proof.
//!
//! Only the crate's public surface is exercised here (no `pub(crate)`
//! field access is available from an integration test), so request/event
//! inspection goes through `Arc`-shared handles captured at harness
//! construction time rather than through the `Wallet` struct itself.

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use spv_core::config::WalletConfig;
use spv_core::constants::{checkpoints, genesis_header};
use spv_core::events::{Event, EventSink};
use spv_core::fsm::{FsmState, Wallet};
use spv_core::headers::HeaderChain;
use spv_core::keys::{KeyHierarchy, ScriptHash, WalletScheme, WalletType};
use spv_core::persistence::{Snapshot, WalletDb};
use spv_core::server::{HistoryItem, MerkleProof, Request, Response, ServerClient};
use spv_core::Error;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct FakeServer {
    sent: Arc<Mutex<Vec<Request>>>,
}

#[async_trait]
impl ServerClient for FakeServer {
    async fn send(&self, request: Request) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(request);
        Ok(())
    }
}

#[derive(Default)]
struct FakeDb {
    snapshot: Mutex<Option<Snapshot>>,
    headers: Mutex<HashMap<u32, bitcoin::block::Header>>,
}

#[async_trait]
impl WalletDb for FakeDb {
    async fn persist(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        *self.snapshot.lock().unwrap() = Some(snapshot.clone());
        Ok(())
    }

    async fn read_snapshot(&self) -> anyhow::Result<Option<Snapshot>> {
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn add_headers(&self, start: u32, headers: &[bitcoin::block::Header]) -> anyhow::Result<()> {
        let mut guard = self.headers.lock().unwrap();
        for (offset, header) in headers.iter().enumerate() {
            guard.insert(start + offset as u32, *header);
        }
        Ok(())
    }

    async fn get_header(&self, height: u32) -> anyhow::Result<Option<bitcoin::block::Header>> {
        Ok(self.headers.lock().unwrap().get(&height).copied())
    }

    async fn get_headers(&self, start: u32, limit: u32) -> anyhow::Result<Vec<bitcoin::block::Header>> {
        let guard = self.headers.lock().unwrap();
        let mut out = Vec::new();
        for height in start..start + limit {
            match guard.get(&height) {
                Some(header) => out.push(*header),
                None => break,
            }
        }
        Ok(out)
    }
}

struct CollectingSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventSink for CollectingSink {
    fn publish(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

type TestWallet = Wallet<FakeServer, FakeDb, CollectingSink>;

struct Harness {
    wallet: TestWallet,
    sent: Arc<Mutex<Vec<Request>>>,
    events: Arc<Mutex<Vec<Event>>>,
    seed: [u8; 32],
}

impl Harness {
    fn new(seed: [u8; 32]) -> Self {
        let keys = KeyHierarchy::from_seed(&seed, Network::Regtest, WalletType::NativeSegwit).unwrap();
        let chain = HeaderChain::new(Network::Regtest, checkpoints(Network::Regtest)[0]);
        let config = WalletConfig::new(WalletType::NativeSegwit, Network::Regtest);

        let sent = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let server = FakeServer { sent: sent.clone() };
        let sink = CollectingSink { events: events.clone() };

        let wallet = Wallet::new(config, keys, chain, server, FakeDb::default(), sink).unwrap();
        Self { wallet, sent, events, seed }
    }

    fn drain_sent(&self) -> Vec<Request> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    fn drain_events(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    /// The scripthash the wallet itself derived for account-branch `index`,
    /// recomputed independently from the same seed and scheme.
    fn account_scripthash(&self, index: u32) -> ScriptHash {
        let keys = KeyHierarchy::from_seed(&self.seed, Network::Regtest, WalletType::NativeSegwit).unwrap();
        let xpriv = keys.derive_account_key(index).unwrap();
        let pubkey = xpriv.private_key.public_key(keys.secp());
        WalletType::NativeSegwit.scheme().scripthash(&pubkey).unwrap()
    }

    /// Drives `ServerReady` through to `Running`, where the server's
    /// announced tip already matches the wallet's local (genesis) tip, so
    /// no header sync round-trip is needed.
    async fn bring_to_running(&mut self) {
        self.wallet.handle_response(Response::ServerReady).await.unwrap();
        assert_eq!(*self.wallet.state(), FsmState::WaitingForTip);

        let genesis = genesis_header(Network::Regtest);
        self.wallet
            .handle_response(Response::HeaderSubscriptionResponse { height: 0, header: genesis })
            .await
            .unwrap();
        assert_eq!(*self.wallet.state(), FsmState::Running);
    }

    /// Delivers a funding transaction paying `amounts` to the wallet's
    /// current receive address, as both a `GetTransactionResponse` and the
    /// matching history entry a server would push alongside it.
    async fn fund_receive_address(&mut self, amounts: &[u64]) -> Transaction {
        let address = self.wallet.current_receive_address().unwrap();
        let tx = Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![],
            output: amounts
                .iter()
                .map(|sat| TxOut { value: Amount::from_sat(*sat), script_pubkey: address.script_pubkey() })
                .collect(),
        };
        let txid = tx.compute_txid();

        self.wallet
            .handle_response(Response::GetTransactionResponse(tx.clone()))
            .await
            .unwrap();
        self.wallet
            .handle_response(Response::GetScriptHashHistoryResponse {
                scripthash: self.account_scripthash(0),
                items: vec![HistoryItem { txid, height: 0 }],
            })
            .await
            .unwrap();
        tx
    }
}

#[tokio::test]
async fn s1_fresh_sync_reaches_running_with_full_subscription_and_no_balance() {
    let mut h = Harness::new([1u8; 32]);
    h.bring_to_running().await;

    assert_eq!(h.wallet.balance(), (Amount::ZERO, Amount::ZERO));

    let events = h.drain_events();
    assert_eq!(events.iter().filter(|e| matches!(e, Event::WalletReady { .. })).count(), 1);
    assert_eq!(events.iter().filter(|e| matches!(e, Event::NewReceiveAddress(_))).count(), 1);

    let sent = h.drain_sent();
    let subscriptions: Vec<ScriptHash> = sent
        .iter()
        .filter_map(|r| match r {
            Request::ScriptHashSubscription(sh) => Some(*sh),
            _ => None,
        })
        .collect();
    assert_eq!(subscriptions.len(), 20); // gap_limit(10) * 2 branches

    // Feeding back empty status for every subscribed key must not disturb
    // readiness or trigger any further subscriptions.
    for sh in &subscriptions {
        h.wallet
            .handle_response(Response::ScriptHashSubscriptionResponse { scripthash: *sh, status: String::new() })
            .await
            .unwrap();
    }
    assert!(h.drain_sent().is_empty());

    let empty_tx = Transaction {
        version: bitcoin::transaction::Version::TWO,
        lock_time: bitcoin::absolute::LockTime::ZERO,
        input: vec![],
        output: vec![],
    };
    assert!(!h.wallet.is_double_spent(&empty_tx));
}

#[tokio::test]
async fn s2_gap_limit_extends_on_newly_active_last_key() {
    let mut h = Harness::new([2u8; 32]);
    h.bring_to_running().await;
    h.drain_sent();

    let sh9 = h.account_scripthash(9);
    h.wallet
        .handle_response(Response::ScriptHashSubscriptionResponse { scripthash: sh9, status: "first-use".into() })
        .await
        .unwrap();

    let sent = h.drain_sent();
    assert!(sent.contains(&Request::GetScriptHashHistory(sh9)));

    let sh10 = h.account_scripthash(10);
    assert!(
        sent.contains(&Request::ScriptHashSubscription(sh10)),
        "expected the branch to extend by one key past the newly-used index 9"
    );

    // Re-delivering the same status must not extend the branch again.
    h.wallet
        .handle_response(Response::ScriptHashSubscriptionResponse { scripthash: sh9, status: "first-use".into() })
        .await
        .unwrap();
    let sent_again = h.drain_sent();
    assert!(!sent_again.contains(&Request::ScriptHashSubscription(sh10)));
}

#[tokio::test]
async fn s3_complete_transaction_selects_and_signs_inputs() {
    let mut h = Harness::new([3u8; 32]);
    h.bring_to_running().await;
    h.drain_sent();
    h.drain_events();

    h.fund_receive_address(&[30_000, 50_000]).await;

    let (_, unconfirmed) = h.wallet.balance();
    assert_eq!(unconfirmed, Amount::from_sat(80_000));

    let dest = ScriptBuf::from_bytes(vec![0u8; 22]);
    let outgoing = Transaction {
        version: bitcoin::transaction::Version::TWO,
        lock_time: bitcoin::absolute::LockTime::ZERO,
        input: vec![],
        output: vec![TxOut { value: Amount::from_sat(25_000), script_pubkey: dest.clone() }],
    };

    let (signed, fee) = h.wallet.complete_transaction(outgoing, 5_000).unwrap();
    assert!(!signed.input.is_empty());
    assert!(signed.input.iter().all(|input| !input.witness.is_empty()));
    assert!(fee > Amount::ZERO);

    let paid: Amount = signed
        .output
        .iter()
        .filter(|o| o.script_pubkey == dest)
        .map(|o| o.value)
        .sum();
    assert_eq!(paid, Amount::from_sat(25_000));
}

#[tokio::test]
async fn s4_reorg_republishes_confidence_once_and_keeps_the_funds_counted() {
    let mut h = Harness::new([4u8; 32]);
    h.bring_to_running().await;
    h.drain_sent();

    let tx = h.fund_receive_address(&[10_000]).await;
    let txid = tx.compute_txid();
    h.drain_events();

    let sh0 = h.account_scripthash(0);

    h.wallet
        .handle_response(Response::GetScriptHashHistoryResponse {
            scripthash: sh0,
            items: vec![HistoryItem { txid, height: 5 }],
        })
        .await
        .unwrap();
    h.drain_sent();
    h.drain_events();

    h.wallet
        .handle_response(Response::GetScriptHashHistoryResponse {
            scripthash: sh0,
            items: vec![HistoryItem { txid, height: 6 }],
        })
        .await
        .unwrap();

    let events = h.drain_events();
    let confidence_changes = events
        .iter()
        .filter(|e| matches!(e, Event::TransactionConfidenceChanged { txid: t, .. } if *t == txid))
        .count();
    assert_eq!(confidence_changes, 1);

    let (confirmed, unconfirmed) = h.wallet.balance();
    assert_eq!(confirmed + unconfirmed, Amount::from_sat(10_000));
    assert_eq!(confirmed, Amount::from_sat(10_000)); // height 6 > 0 => confirmed bucket
}

#[tokio::test]
async fn s5_orphan_tx_replays_once_its_parent_arrives() {
    let mut h = Harness::new([5u8; 32]);
    h.bring_to_running().await;
    h.drain_sent();
    h.drain_events();

    let address = h.wallet.current_receive_address().unwrap();
    let parent = Transaction {
        version: bitcoin::transaction::Version::TWO,
        lock_time: bitcoin::absolute::LockTime::ZERO,
        input: vec![],
        output: vec![TxOut { value: Amount::from_sat(40_000), script_pubkey: address.script_pubkey() }],
    };
    let parent_txid = parent.compute_txid();

    let child = Transaction {
        version: bitcoin::transaction::Version::TWO,
        lock_time: bitcoin::absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint { txid: parent_txid, vout: 0 },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: vec![TxOut { value: Amount::from_sat(39_000), script_pubkey: address.script_pubkey() }],
    };
    let child_txid = child.compute_txid();

    // Child arrives first: its parent is unknown, so no `TransactionReceived`
    // fires yet.
    h.wallet.handle_response(Response::GetTransactionResponse(child.clone())).await.unwrap();
    let events_before = h.drain_events();
    assert!(events_before.iter().all(|e| !matches!(e, Event::TransactionReceived { .. })));

    // Parent arrives: both connect, in order (parent replays the child).
    h.wallet.handle_response(Response::GetTransactionResponse(parent.clone())).await.unwrap();
    let events_after = h.drain_events();
    let received_order: Vec<_> = events_after
        .iter()
        .filter_map(|e| match e {
            Event::TransactionReceived { txid, .. } => Some(*txid),
            _ => None,
        })
        .collect();
    assert_eq!(received_order, vec![parent_txid, child_txid]);
}

#[tokio::test]
async fn s6_bad_merkle_proof_disconnects_the_wallet() {
    let mut h = Harness::new([6u8; 32]);
    h.bring_to_running().await;
    h.drain_sent();

    let placeholder = Transaction {
        version: bitcoin::transaction::Version::TWO,
        lock_time: bitcoin::absolute::LockTime::ZERO,
        input: vec![],
        output: vec![],
    };
    let txid = placeholder.compute_txid();

    let genesis = genesis_header(Network::Regtest);
    let bogus_proof = MerkleProof {
        txid,
        merkle_path: vec![],
        included_at_height: 0, // the checkpoint/genesis height, always resolvable
        computed_root: bitcoin::TxMerkleNode::all_zeros(),
    };
    assert_ne!(bogus_proof.computed_root, genesis.merkle_root);

    let result = h.wallet.handle_response(Response::GetMerkleResponse(bogus_proof)).await;
    match result {
        Err(Error::BadMerkleProof(t)) => assert_eq!(t, txid),
        other => panic!("expected BadMerkleProof, got {other:?}"),
    }
    assert_eq!(*h.wallet.state(), FsmState::Disconnected);
}
