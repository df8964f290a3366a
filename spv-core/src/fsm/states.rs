//! The four-state wallet lifecycle (C6).

/// A tagged enum of the wallet's lifecycle states. Transitions are pure
/// functions `(state, event) -> (state', effects)` in spirit; in practice
/// they mutate a held `WalletData` in place (see crate-level design notes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsmState {
    /// Initial and failure state. No server requests are in flight.
    Disconnected,
    /// Subscribed to the header stream, waiting for the first response.
    WaitingForTip,
    /// Requesting header chunks starting at `next_request_start` until an
    /// empty response arrives.
    Syncing { next_request_start: u32 },
    /// Full duplex operation: scripthashes subscribed, history/tx/merkle
    /// flow driven by server pushes.
    Running,
}

impl FsmState {
    pub fn is_running(&self) -> bool {
        matches!(self, FsmState::Running)
    }

    pub fn is_syncing(&self) -> bool {
        matches!(self, FsmState::Syncing { .. })
    }
}
