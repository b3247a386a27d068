//! Death notification for a collaborator's client link
//!
//! A [`DeathNotifier`] lives with the collaborator and fires once when its
//! link to the underlying resource dies. The paired [`DeathRecipient`] is
//! linked to exactly one sequencer for the collaborator's lifetime.

use std::sync::Arc;

use devseq_shared::{StateModel, Target};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::command::Sequencer;

/// Create a linked notifier/recipient pair
pub fn death_link() -> (DeathNotifier, DeathRecipient) {
    let (tx, rx) = oneshot::channel();
    (DeathNotifier { tx }, DeathRecipient { rx })
}

/// Held by the collaborator; consumed when the link dies
#[derive(Debug)]
pub struct DeathNotifier {
    tx: oneshot::Sender<String>,
}

impl DeathNotifier {
    /// Report that the resource link died
    pub fn notify(self, reason: impl Into<String>) {
        // The recipient may already be unlinked
        let _ = self.tx.send(reason.into());
    }
}

/// Registered once with the sequencer that owns the resource
#[derive(Debug)]
pub struct DeathRecipient {
    rx: oneshot::Receiver<String>,
}

impl DeathRecipient {
    /// Link to a sequencer: when the notifier fires, or is dropped without
    /// firing, the sequencer is told its resource was lost.
    pub fn link<T, S>(self, sequencer: Arc<Sequencer<T, S>>) -> LivenessHandle
    where
        T: Target,
        S: StateModel,
    {
        let rx = self.rx;
        let task = tokio::spawn(async move {
            let reason = match rx.await {
                Ok(reason) => reason,
                Err(_) => "death notifier dropped".to_string(),
            };
            warn!("[{}] Resource link died: {}", sequencer.name(), reason);
            sequencer.on_resource_lost(&reason).await;
        });

        LivenessHandle { task }
    }
}

/// Handle to a linked death recipient
#[derive(Debug)]
pub struct LivenessHandle {
    task: JoinHandle<()>,
}

impl LivenessHandle {
    /// Stop watching; a later death notification is ignored
    pub fn unlink(self) {
        info!("Unlinking death recipient");
        self.task.abort();
    }

    /// Whether the death notification has already been handled
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
