//! State-change observers
//!
//! Observers are invoked after the sequencer has released its lock, once per
//! transition, in transition order.

mod priority;

pub use priority::{MemoryPriorityStore, Priority, PriorityBumpObserver, PriorityStore};

use devseq_shared::{StateChange, StateModel, Target};
use tokio::sync::mpsc;

/// Receives every state transition of a sequencer
pub trait StateObserver<T, S>: Send + Sync {
    fn on_state_changed(&self, target: &T, previous: S, current: S);
}

/// Forwards transitions into a channel for async consumers
pub struct ChannelObserver<T, S> {
    tx: mpsc::UnboundedSender<StateChange<T, S>>,
}

impl<T, S> ChannelObserver<T, S> {
    pub fn new(tx: mpsc::UnboundedSender<StateChange<T, S>>) -> Self {
        Self { tx }
    }
}

impl<T: Target, S: StateModel> StateObserver<T, S> for ChannelObserver<T, S> {
    fn on_state_changed(&self, target: &T, previous: S, current: S) {
        // A dropped subscriber just stops listening
        let _ = self.tx.send(StateChange {
            target: target.clone(),
            previous,
            current,
        });
    }
}
