//! Per-state event dispatch (§4.3/§4.4) and readiness/persistence
//! publication (§4.5). Split out of `mod.rs` so the struct definition and
//! command surface stay readable next to the protocol-driven half.

use super::{FsmState, Wallet};
use crate::constants::RETARGETING_PERIOD;
use crate::error::{Error, Result};
use crate::events::{EventSink, Event};
use crate::persistence::WalletDb;
use crate::server::{HistoryItem, MerkleProof, Request, Response, ServerClient};
use crate::wallet::ReadySnapshot;
use bitcoin::block::Header;
use bitcoin::{Transaction, Txid};
use std::collections::HashSet;

impl<C: ServerClient, D: WalletDb, E: EventSink> Wallet<C, D, E> {
    /// The single entry point through which server pushes and request
    /// answers reach the wallet. `send()` only dispatches; this is where
    /// the actual state machine lives (§5's "server messages → FSM").
    pub async fn handle_response(&mut self, response: Response) -> Result<()> {
        match response {
            Response::ServerReady => self.on_server_ready().await?,
            Response::Disconnected => {
                self.on_disconnected();
                return Ok(());
            }
            Response::HeaderSubscriptionResponse { height, header } => {
                self.on_header_subscription(height, header).await?
            }
            Response::GetHeadersResponse { start, headers } => {
                self.on_headers_response(start, headers).await?
            }
            Response::ScriptHashSubscriptionResponse { scripthash, status } => {
                self.on_scripthash_status(scripthash, status).await?
            }
            Response::GetScriptHashHistoryResponse { scripthash, items } => {
                self.on_history(scripthash, items).await?
            }
            Response::GetTransactionResponse(tx) => self.ingest_transaction(tx).await?,
            Response::GetMerkleResponse(proof) => self.on_merkle(proof).await?,
            Response::BroadcastTransactionResponse(_) => {}
            Response::ServerError { request, details } => {
                self.on_server_error(request, details).await?
            }
        }

        if self.state.is_running() {
            self.publish_ready_and_persist().await?;
        }
        Ok(())
    }

    async fn request_headers(&mut self, start: u32) -> Result<()> {
        self.server
            .send(Request::GetHeaders {
                start,
                count: RETARGETING_PERIOD,
            })
            .await
            .map_err(Error::backend)
    }

    async fn subscribe_all_scripthashes(&mut self) -> Result<()> {
        let scripthashes: Vec<_> = self.data.all_scripthashes().collect();
        for sh in scripthashes {
            self.server
                .send(Request::ScriptHashSubscription(sh))
                .await
                .map_err(Error::backend)?;
        }
        Ok(())
    }

    /// Clears everything that's only meaningful mid-session, per §4.3's
    /// universal `Disconnected` handler.
    fn clear_on_disconnect(&mut self) {
        let stale: Vec<_> = self.data.pending_history_requests.drain().collect();
        for sh in stale {
            // Reset to a sentinel different from the true on-server status,
            // so the next ScriptHashSubscriptionResponse re-triggers a
            // GetScriptHashHistory request instead of being treated as a
            // no-op "unchanged status" push.
            self.data.status.insert(sh, String::new());
        }
        self.data.pending_transaction_requests.clear();
        self.data.pending_headers_requests.clear();
        self.data.last_ready = None;
    }

    fn on_disconnected(&mut self) {
        self.clear_on_disconnect();
        self.state = FsmState::Disconnected;
    }

    async fn on_server_ready(&mut self) -> Result<()> {
        if self.state != FsmState::Disconnected {
            return Ok(());
        }
        self.server
            .send(Request::HeaderSubscription)
            .await
            .map_err(Error::backend)?;
        self.state = FsmState::WaitingForTip;
        Ok(())
    }

    async fn on_header_subscription(&mut self, height: u32, header: Header) -> Result<()> {
        match self.state.clone() {
            FsmState::Disconnected => Ok(()),
            FsmState::WaitingForTip => self.on_header_subscription_waiting(height, header).await,
            FsmState::Syncing { .. } => Ok(()),
            FsmState::Running => self.on_header_subscription_running(height, header).await,
        }
    }

    async fn on_header_subscription_waiting(&mut self, height: u32, header: Header) -> Result<()> {
        let local_tip_height = self.data.chain().tip_height();
        if height < local_tip_height {
            self.on_disconnected();
            return Err(Error::ServerBehind);
        }

        if header.block_hash() == self.data.chain().tip_hash() {
            self.subscribe_all_scripthashes().await?;
            self.state = FsmState::Running;
            return Ok(());
        }

        let no_local_best_chain = local_tip_height == self.data.chain().checkpoint().height;
        let start = if no_local_best_chain {
            let checkpoint_count =
                crate::constants::checkpoints(self.data.config().network).len() as u32;
            checkpoint_count * RETARGETING_PERIOD
        } else {
            local_tip_height + 1
        };

        self.request_headers(start).await?;
        self.state = FsmState::Syncing {
            next_request_start: start,
        };
        Ok(())
    }

    async fn on_headers_response(&mut self, start: u32, headers: Vec<Header>) -> Result<()> {
        match self.state.clone() {
            FsmState::Syncing { .. } => self.on_headers_response_syncing(start, headers).await,
            FsmState::Running => self.on_headers_response_running(start, headers).await,
            _ => Ok(()),
        }
    }

    async fn on_headers_response_syncing(&mut self, start: u32, headers: Vec<Header>) -> Result<()> {
        if headers.is_empty() {
            self.subscribe_all_scripthashes().await?;
            self.state = FsmState::Running;
            return Ok(());
        }

        if let Err(err) = self.data.chain_mut().add_headers(start, &headers) {
            self.on_disconnected();
            return Err(err);
        }

        let pruned = self.data.chain_mut().optimize();
        if !pruned.is_empty() {
            self.persist_pruned_headers(&pruned).await?;
        }

        let next_start = start + headers.len() as u32;
        self.request_headers(next_start).await?;
        self.state = FsmState::Syncing {
            next_request_start: next_start,
        };
        Ok(())
    }

    async fn persist_pruned_headers(&mut self, pruned: &[(u32, Header)]) -> Result<()> {
        for chunk in pruned.chunks(RETARGETING_PERIOD as usize) {
            let chunk_start = chunk[0].0;
            let headers: Vec<Header> = chunk.iter().map(|(_, header)| *header).collect();
            self.db
                .add_headers(chunk_start, &headers)
                .await
                .map_err(Error::backend)?;
        }
        Ok(())
    }

    async fn on_header_subscription_running(&mut self, height: u32, header: Header) -> Result<()> {
        if header.block_hash() == self.data.chain().tip_hash() {
            return Ok(());
        }

        match self.data.chain_mut().add_header(height, header) {
            Ok(()) => {
                let pruned = self.data.chain_mut().optimize();
                if !pruned.is_empty() {
                    self.persist_pruned_headers(&pruned).await?;
                }
                self.republish_confidence_for_confirmed();
                Ok(())
            }
            Err(err) => {
                self.on_disconnected();
                Err(err)
            }
        }
    }

    fn republish_confidence_for_confirmed(&mut self) {
        let confirmed: Vec<Txid> = self
            .data
            .heights
            .iter()
            .filter(|(_, height)| **height > 0)
            .map(|(txid, _)| *txid)
            .collect();
        for txid in confirmed {
            let depth = crate::wallet::depth(&self.data, txid);
            self.events.publish(Event::TransactionConfidenceChanged {
                txid,
                depth,
                timestamp: None,
            });
        }
    }

    async fn on_scripthash_status(&mut self, sh: crate::keys::ScriptHash, status: String) -> Result<()> {
        if !self.data.scripthash_index.contains_key(&sh) {
            log::warn!("ignoring status push for unknown scripthash");
            return Ok(());
        }

        let stored = self.data.status.get(&sh).cloned().unwrap_or_default();
        if stored == status {
            self.rerequest_missing_transactions(sh).await?;
            return Ok(());
        }

        if status.is_empty() {
            self.data.status.insert(sh, status);
            return Ok(());
        }

        self.server
            .send(Request::GetScriptHashHistory(sh))
            .await
            .map_err(Error::backend)?;

        // Mark `sh` used before checking the gap limit: `trailing_unused`
        // reads `status`, so the branch must already reflect this key's new
        // status or the just-used key is miscounted as still-unused and no
        // replacement key gets pushed.
        self.data.status.insert(sh, status.clone());

        let newly_seen = self.data.seen_statuses.insert((sh, status));
        if newly_seen {
            if let Some(key_ref) = self.data.key_ref(sh) {
                let new_keys = self.data.maintain_gap_limit(key_ref.branch)?;
                for new_sh in new_keys {
                    self.server
                        .send(Request::ScriptHashSubscription(new_sh))
                        .await
                        .map_err(Error::backend)?;
                }
            }
        }

        self.data.pending_history_requests.insert(sh);
        Ok(())
    }

    async fn rerequest_missing_transactions(&mut self, sh: crate::keys::ScriptHash) -> Result<()> {
        let missing: Vec<Txid> = self
            .data
            .history
            .get(&sh)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|(txid, _)| txid)
            .filter(|txid| {
                !self.data.transactions.contains_key(txid)
                    && !self.data.pending_transaction_requests.contains(txid)
            })
            .collect();
        for txid in missing {
            self.data.pending_transaction_requests.insert(txid);
            self.server
                .send(Request::GetTransaction(txid))
                .await
                .map_err(Error::backend)?;
        }
        Ok(())
    }

    async fn on_history(&mut self, sh: crate::keys::ScriptHash, items: Vec<HistoryItem>) -> Result<()> {
        let existing = self.data.history.get(&sh).cloned().unwrap_or_default();
        let server_txids: HashSet<Txid> = items.iter().map(|item| item.txid).collect();
        let shadow: Vec<(Txid, i32)> = existing
            .iter()
            .filter(|(txid, _)| !server_txids.contains(txid))
            .cloned()
            .collect();

        for item in &items {
            let prior_height = existing
                .iter()
                .find(|(txid, _)| *txid == item.txid)
                .map(|(_, height)| *height);
            let height_changed = prior_height != Some(item.height);

            let tx_unknown = !self.data.transactions.contains_key(&item.txid);
            let tx_pending = self.data.pending_transaction_requests.contains(&item.txid);

            if tx_unknown && !tx_pending {
                self.data.pending_transaction_requests.insert(item.txid);
                self.server
                    .send(Request::GetTransaction(item.txid))
                    .await
                    .map_err(Error::backend)?;
                if item.height > 0 {
                    self.request_merkle_and_headers(item.txid, item.height as u32)
                        .await?;
                }
            } else if item.height > 0 && !self.data.proofs.contains_key(&item.txid) {
                self.request_merkle_and_headers(item.txid, item.height as u32)
                    .await?;
            }

            self.data.heights.insert(item.txid, item.height);

            if height_changed {
                let depth = crate::wallet::depth(&self.data, item.txid);
                self.events.publish(Event::TransactionConfidenceChanged {
                    txid: item.txid,
                    depth,
                    timestamp: None,
                });
            }
        }

        let mut merged: Vec<(Txid, i32)> = items.iter().map(|item| (item.txid, item.height)).collect();
        merged.extend(shadow);
        self.data.history.insert(sh, merged);
        self.data.pending_history_requests.remove(&sh);
        Ok(())
    }

    async fn request_merkle_and_headers(&mut self, txid: Txid, height: u32) -> Result<()> {
        self.server
            .send(Request::GetMerkle { txid, height })
            .await
            .map_err(Error::backend)?;

        let chunk_start = (height / RETARGETING_PERIOD) * RETARGETING_PERIOD;
        let have_in_memory = self.data.chain().get_header(height).is_some();
        let have_in_db = if have_in_memory {
            true
        } else {
            self.db
                .get_header(height)
                .await
                .map_err(Error::backend)?
                .is_some()
        };

        if !have_in_db && self.data.pending_headers_requests.insert(chunk_start) {
            self.request_headers(chunk_start).await?;
        }
        Ok(())
    }

    /// Handles `GetTransactionResponse`, including the orphan-chain replay
    /// (§4.4: "replay every queued orphan tx against the updated state").
    async fn ingest_transaction(&mut self, tx: Transaction) -> Result<()> {
        if !self.has_all_parents(&tx) {
            self.data.push_orphan(tx);
            return Ok(());
        }

        let txid = tx.compute_txid();
        let (received, sent, fee) = crate::wallet::compute_transaction_delta(&self.data, &tx);
        let timestamp = self.data.chain().get_header(self.tx_height(txid)).map(|h| h.time);

        self.data.transactions.insert(txid, tx);
        self.data.pending_transaction_requests.remove(&txid);

        self.events.publish(Event::TransactionReceived {
            txid,
            depth: crate::wallet::depth(&self.data, txid),
            received,
            sent,
            fee,
            timestamp,
        });

        let orphans = self.data.take_orphans();
        for orphan in orphans {
            Box::pin(self.ingest_transaction(orphan)).await?;
        }
        Ok(())
    }

    fn tx_height(&self, txid: Txid) -> u32 {
        self.data
            .heights
            .get(&txid)
            .filter(|h| **h > 0)
            .map(|h| *h as u32)
            .unwrap_or(0)
    }

    fn has_all_parents(&self, tx: &Transaction) -> bool {
        tx.input
            .iter()
            .all(|input| self.data.transactions.contains_key(&input.previous_output.txid))
    }

    async fn on_server_error(&mut self, request: Request, details: String) -> Result<()> {
        if let Request::GetTransaction(txid) = &request {
            let believed_in_history = self.data.heights.contains_key(txid)
                || self
                    .data
                    .history
                    .values()
                    .any(|items| items.iter().any(|(t, _)| t == txid));
            if believed_in_history {
                let txid = *txid;
                self.on_disconnected();
                return Err(Error::InconsistentServer(txid));
            }
        }
        log::warn!("server reported an error for {request:?}: {details}");
        Ok(())
    }

    /// Handles `GetMerkleResponse`, including the self-tail-recursion
    /// pattern for a header that hasn't arrived yet (§4.4).
    async fn on_merkle(&mut self, proof: MerkleProof) -> Result<()> {
        let header = match self.data.chain().get_header(proof.included_at_height) {
            Some(header) => Some(header),
            None => self
                .db
                .get_header(proof.included_at_height)
                .await
                .map_err(Error::backend)?,
        };

        match header {
            Some(header) if header.merkle_root == proof.computed_root => {
                self.data.proofs.insert(proof.txid, proof);
                Ok(())
            }
            Some(_) => {
                let txid = proof.txid;
                self.data.transactions.remove(&txid);
                self.data.heights.remove(&txid);
                self.on_disconnected();
                Err(Error::BadMerkleProof(txid))
            }
            None => {
                let chunk_start = (proof.included_at_height / RETARGETING_PERIOD) * RETARGETING_PERIOD;
                if self.data.pending_headers_requests.insert(chunk_start) {
                    self.request_headers(chunk_start).await?;
                }
                self.data.pending_merkle_responses.push(proof);
                Ok(())
            }
        }
    }

    async fn on_headers_response_running(&mut self, start: u32, headers: Vec<Header>) -> Result<()> {
        let checkpoints = crate::constants::checkpoints(self.data.config().network);
        if let Err(err) = self
            .data
            .chain()
            .verify_headers_chunk(&checkpoints, start, &headers)
        {
            self.on_disconnected();
            return Err(err);
        }
        self.db
            .add_headers(start, &headers)
            .await
            .map_err(Error::backend)?;
        self.data.pending_headers_requests.remove(&start);

        let pending = std::mem::take(&mut self.data.pending_merkle_responses);
        for proof in pending {
            Box::pin(self.on_merkle(proof)).await?;
        }
        Ok(())
    }

    /// §4.5: republish `WalletReady` (and the current receive address),
    /// and persist a snapshot, whenever readiness changes.
    async fn publish_ready_and_persist(&mut self) -> Result<()> {
        if !self.data.is_ready() {
            return Ok(());
        }

        let (confirmed, unconfirmed) = crate::wallet::balance(&self.data);
        let tip_height = self.data.chain().tip_height();
        let tip_time = self.data.chain().tip_header().map(|h| h.time).unwrap_or(0);

        let candidate = ReadySnapshot {
            confirmed: confirmed.to_sat(),
            unconfirmed: unconfirmed.to_sat(),
            tip_height,
            tip_time,
        };
        if self.data.last_ready == Some(candidate) {
            return Ok(());
        }
        self.data.last_ready = Some(candidate);

        self.events.publish(Event::WalletReady {
            confirmed,
            unconfirmed,
            tip_height,
            tip_time,
        });
        if let Ok(address) = self.data.current_receive_address() {
            self.events.publish(Event::NewReceiveAddress(address));
        }
        self.persist().await
    }
}
