//! Event bus adapter (C10): publishes wallet lifecycle notifications.
//!
//! Publication is a synchronous callback rather than a message-bus
//! abstraction: a plain call made during the FSM transition that caused it
//! (see concurrency model, §5).

use bitcoin::{Address, Amount, Txid};

/// A single published notification. Variant fields carry enough context for
/// the embedder to update UI/accounting state without re-querying the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    WalletReady {
        confirmed: Amount,
        unconfirmed: Amount,
        tip_height: u32,
        tip_time: u32,
    },
    TransactionReceived {
        txid: Txid,
        depth: u32,
        received: Amount,
        sent: Amount,
        fee: Option<Amount>,
        timestamp: Option<u32>,
    },
    TransactionConfidenceChanged {
        txid: Txid,
        depth: u32,
        timestamp: Option<u32>,
    },
    NewReceiveAddress(Address),
}

/// Publication sink for wallet lifecycle events. Implementations must not
/// block the FSM for long; this is called synchronously from within a state
/// transition.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

/// Default [`EventSink`] backed by a `std::sync::mpsc` channel: publication
/// never awaits, it just enqueues.
pub struct ChannelEventSink {
    sender: std::sync::mpsc::Sender<Event>,
}

impl ChannelEventSink {
    /// Builds a sink/receiver pair. The receiver end is handed to whatever
    /// task the embedder uses to drain events (UI thread, async task, etc).
    pub fn new() -> (Self, std::sync::mpsc::Receiver<Event>) {
        let (sender, receiver) = std::sync::mpsc::channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn publish(&self, event: Event) {
        // A disconnected receiver just means nobody is listening anymore;
        // the FSM does not treat that as a failure.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    #[test]
    fn channel_sink_delivers_in_order() {
        let (sink, rx) = ChannelEventSink::new();
        sink.publish(Event::TransactionConfidenceChanged {
            txid: Txid::all_zeros(),
            depth: 1,
            timestamp: None,
        });
        sink.publish(Event::TransactionConfidenceChanged {
            txid: Txid::all_zeros(),
            depth: 2,
            timestamp: None,
        });
        let first = rx.recv().unwrap();
        let second = rx.recv().unwrap();
        match (first, second) {
            (
                Event::TransactionConfidenceChanged { depth: d1, .. },
                Event::TransactionConfidenceChanged { depth: d2, .. },
            ) => {
                assert_eq!(d1, 1);
                assert_eq!(d2, 2);
            }
            _ => panic!("unexpected event variants"),
        }
    }
}
