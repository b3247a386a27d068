//! Simulated native resources
//!
//! Stand-ins for the piezo HAL and the HID host stack: each accepts one
//! command at a time, answers after a latency on its own task, and can be
//! killed to exercise death notification.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use devseq_shared::{Command, CommandKind, CorrelationId, DispatchError, StateModel, Target};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::Sequencer;
use crate::connection::{death_link, DeathNotifier, DeathRecipient, ResourceClient};

/// Configuration for a simulated resource
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Resource name used in logs
    pub name: String,
    /// Time to complete a connect/disconnect
    pub latency: Duration,
    /// Fail every Nth dispatched command (None never fails)
    pub fail_every: Option<u64>,
    /// Whether in-flight work can be interrupted
    pub interruptible: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            name: "sim".into(),
            latency: Duration::from_millis(200),
            fail_every: None,
            interruptible: true,
        }
    }
}

/// Callbacks a simulated resource emits, as a native callback thread would
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    Completed { id: CorrelationId, success: bool },
}

/// A single-threaded resource answering on its own tasks
pub struct SimulatedResource {
    config: SimConfig,
    available: AtomicBool,
    dispatched: AtomicU64,
    events: mpsc::UnboundedSender<SimEvent>,
    work: Mutex<HashMap<CorrelationId, JoinHandle<()>>>,
    death: Mutex<Option<DeathNotifier>>,
}

impl SimulatedResource {
    /// Create a resource, its callback stream and its death recipient
    pub fn new(config: SimConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<SimEvent>, DeathRecipient) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (notifier, recipient) = death_link();

        let resource = Arc::new(Self {
            config,
            available: AtomicBool::new(true),
            dispatched: AtomicU64::new(0),
            events,
            work: Mutex::new(HashMap::new()),
            death: Mutex::new(Some(notifier)),
        });

        (resource, event_rx, recipient)
    }

    /// Number of commands accepted so far
    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::SeqCst)
    }

    /// Kill the resource: abandon in-flight work and fire the death notification
    pub fn kill(&self, reason: &str) {
        warn!("[{}] Killed: {}", self.config.name, reason);
        self.available.store(false, Ordering::SeqCst);

        if let Ok(mut work) = self.work.lock() {
            for (_, task) in work.drain() {
                task.abort();
            }
        }

        let notifier = self.death.lock().ok().and_then(|mut d| d.take());
        if let Some(notifier) = notifier {
            notifier.notify(reason);
        }
    }

    fn forget(&self, id: CorrelationId) -> Option<JoinHandle<()>> {
        self.work.lock().ok().and_then(|mut w| w.remove(&id))
    }
}

impl<T: Target> ResourceClient<T> for SimulatedResource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn dispatch(&self, command: &Command<T>) -> Result<(), DispatchError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(DispatchError::NotBound);
        }

        let n = self.dispatched.fetch_add(1, Ordering::SeqCst) + 1;
        let success = self.config.fail_every.map_or(true, |every| every == 0 || n % every != 0);
        let delay = match command.kind {
            CommandKind::Run => Duration::from_millis(u64::from(command.params.duration_ms)),
            _ => self.config.latency,
        };

        debug!(
            "[{}] Executing {} {} for {}ms",
            self.config.name,
            command.kind,
            command.target,
            delay.as_millis()
        );

        let id = command.id;
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SimEvent::Completed { id, success });
        });

        if let Ok(mut work) = self.work.lock() {
            work.retain(|_, t| !t.is_finished());
            work.insert(id, task);
        }
        Ok(())
    }

    fn cancel_in_flight(&self, id: CorrelationId) -> bool {
        if !self.config.interruptible {
            return false;
        }
        let Some(task) = self.forget(id) else {
            return false;
        };

        task.abort();
        info!("[{}] Interrupted command {}", self.config.name, id);
        let _ = self.events.send(SimEvent::Completed { id, success: false });
        true
    }
}

/// Feed a resource's callbacks into its sequencer until the resource is dropped
pub async fn forward_events<T, S>(
    mut events: mpsc::UnboundedReceiver<SimEvent>,
    sequencer: Arc<Sequencer<T, S>>,
) where
    T: Target,
    S: StateModel,
{
    while let Some(event) = events.recv().await {
        match event {
            SimEvent::Completed { id, success } => {
                sequencer.on_command_completed(id, success).await;
            }
        }
    }
    debug!("[{}] Resource callback stream closed", sequencer.name());
}
