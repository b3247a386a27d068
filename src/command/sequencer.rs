//! Resource command sequencer - serializes commands to a single-threaded resource
//!
//! Every target has its own state, but the resource behind them executes one
//! command at a time. Submissions queue FIFO; the head is dispatched as soon as
//! the previous command completes, fails, or is lost with the resource.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use devseq_shared::{
    now_ms, timing, Admission, Command, CommandKind, CommandParams, CorrelationId,
    CorrelationIdAllocator, ProfileState, SequencerError, SoundState, StateChange, StateModel,
    Target,
};
use tokio::sync::{mpsc, Mutex, MutexGuard, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::ResourceClient;
use crate::observer::{ChannelObserver, StateObserver};

/// Sequencer for profile connections keyed by device
pub type ProfileSequencer<T> = Sequencer<T, ProfileState>;

/// Sequencer for timed sound requests
pub type SoundSequencer<T> = Sequencer<T, SoundState>;

/// Configuration for a sequencer
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Label used in logs
    pub name: String,
    /// Fail an in-flight command after this long (None disables the watchdog)
    pub dispatch_timeout: Option<Duration>,
    /// How often the watchdog checks the in-flight command
    pub watchdog_interval: Duration,
    /// First correlation id issued, and the wrap target
    pub id_min: u32,
    /// Last correlation id issued before wrapping
    pub id_max: u32,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            name: "resource".into(),
            dispatch_timeout: None,
            watchdog_interval: Duration::from_millis(timing::WATCHDOG_INTERVAL_MS),
            id_min: timing::CORRELATION_ID_MIN,
            id_max: timing::CORRELATION_ID_MAX,
        }
    }
}

/// The command currently occupying the resource
#[derive(Debug, Clone)]
struct InFlight<T> {
    command: Command<T>,
    dispatched_at: Instant,
}

/// Work to perform once the ledger lock is released
enum Effect<T, S> {
    Notify(StateChange<T, S>),
    Dispatch(Command<T>),
}

/// State map, queue and in-flight slot, guarded together
struct Ledger<T, S> {
    name: String,
    states: HashMap<T, S>,
    queue: VecDeque<Command<T>>,
    in_flight: Option<InFlight<T>>,
    ids: CorrelationIdAllocator,
}

impl<T: Target, S: StateModel> Ledger<T, S> {
    fn state(&self, target: &T) -> S {
        self.states.get(target).copied().unwrap_or_else(S::baseline)
    }

    /// State the target reaches if its in-flight and queued commands succeed
    fn projected_state(&self, target: &T) -> S {
        let state = self.state(target);
        let start = match &self.in_flight {
            Some(f) if &f.command.target == target => state.expected(f.command.kind),
            _ => state,
        };

        self.queue
            .iter()
            .filter(|c| &c.target == target)
            .fold(start, |state, c| state.project(c.kind).unwrap_or(state))
    }

    fn next_id(&mut self, target: &T) -> Result<CorrelationId, SequencerError> {
        let Self {
            ids,
            queue,
            in_flight,
            ..
        } = self;
        ids.allocate(|id| {
            in_flight.as_ref().is_some_and(|f| f.command.id == id)
                || queue.iter().any(|c| c.id == id)
        })
        .ok_or_else(|| SequencerError::rejected(target, "correlation ids exhausted"))
    }

    fn transition(&mut self, target: &T, to: S, effects: &mut Vec<Effect<T, S>>) {
        let from = self.state(target);
        if from == to {
            return;
        }
        debug_assert!(
            from.is_valid_transition(to) && (from.is_in_flight() || to.is_in_flight()),
            "illegal transition {:?} -> {:?}",
            from,
            to
        );

        if to.is_retained() {
            self.states.insert(target.clone(), to);
        } else {
            self.states.remove(target);
        }

        info!("[{}] {}: {:?} -> {:?}", self.name, target, from, to);
        effects.push(Effect::Notify(StateChange {
            target: target.clone(),
            previous: from,
            current: to,
        }));
    }

    /// Dispatch the next admissible queued command if the resource is idle
    fn advance(&mut self, client: &dyn ResourceClient<T>, effects: &mut Vec<Effect<T, S>>) {
        while self.in_flight.is_none() {
            let Some(command) = self.queue.pop_front() else {
                break;
            };

            if !client.is_available() {
                warn!(
                    "[{}] Dropping command {} ({} {}): resource unavailable",
                    self.name, command.id, command.kind, command.target
                );
                continue;
            }

            match self.state(&command.target).admit(command.kind) {
                Admission::Dispatch { in_flight } => {
                    self.transition(&command.target, in_flight, effects);
                    debug!(
                        "[{}] Dispatching command {} ({} {}) after {}ms queued",
                        self.name,
                        command.id,
                        command.kind,
                        command.target,
                        now_ms().saturating_sub(command.submitted_at_ms)
                    );
                    self.in_flight = Some(InFlight {
                        command: command.clone(),
                        dispatched_at: Instant::now(),
                    });
                    effects.push(Effect::Dispatch(command));
                }
                _ => {
                    debug!(
                        "[{}] Dropping stale command {} ({} {})",
                        self.name, command.id, command.kind, command.target
                    );
                }
            }
        }
    }

    /// Settle the in-flight command; false if `id` is not in flight
    fn complete(
        &mut self,
        id: CorrelationId,
        success: bool,
        client: &dyn ResourceClient<T>,
        effects: &mut Vec<Effect<T, S>>,
    ) -> bool {
        if !self.in_flight.as_ref().is_some_and(|f| f.command.id == id) {
            return false;
        }
        let Some(done) = self.in_flight.take() else {
            return false;
        };

        let target = &done.command.target;
        let settled = self.state(target).settle(done.command.kind, success);
        debug!(
            "[{}] Command {} ({} {}) finished: success={}",
            self.name, id, done.command.kind, target, success
        );
        self.transition(target, settled, effects);
        self.advance(client, effects);
        true
    }

    fn lose(&mut self, client: &dyn ResourceClient<T>, effects: &mut Vec<Effect<T, S>>) {
        if let Some(lost) = self.in_flight.take() {
            let target = &lost.command.target;
            let to = self.state(target).lost();
            warn!(
                "[{}] Command {} ({} {}) lost with the resource",
                self.name, lost.command.id, lost.command.kind, target
            );
            self.transition(target, to, effects);
        }
        self.advance(client, effects);
    }

    /// Withdraw a target's queued work and interrupt it if it is in flight
    fn interrupt(
        &mut self,
        target: &T,
        client: &dyn ResourceClient<T>,
    ) -> Result<CorrelationId, SequencerError> {
        let before = self.queue.len();
        self.queue.retain(|c| &c.target != target);
        let withdrawn = before - self.queue.len();

        let in_flight = self
            .in_flight
            .as_ref()
            .filter(|f| &f.command.target == target)
            .map(|f| f.command.id);
        let interrupted = in_flight.is_some_and(|id| client.cancel_in_flight(id));

        if withdrawn == 0 && !interrupted {
            let reason = if in_flight.is_some() {
                "resource cannot interrupt in-flight work"
            } else {
                "nothing to cancel"
            };
            return Err(SequencerError::rejected(target, reason));
        }

        let id = self.next_id(target)?;
        info!(
            "[{}] Cancel {} for {}: withdrew {} queued, interrupted={}",
            self.name, id, target, withdrawn, interrupted
        );
        Ok(id)
    }
}

/// Serializes commands for many targets onto one resource
pub struct Sequencer<T: Target, S: StateModel> {
    config: SequencerConfig,
    client: Arc<dyn ResourceClient<T>>,
    ledger: Mutex<Ledger<T, S>>,
    /// Target states as of the last delivered notification
    published: RwLock<HashMap<T, S>>,
    /// Held while effects are delivered so observers see transitions in order
    delivery: Mutex<()>,
    observers: RwLock<Vec<Arc<dyn StateObserver<T, S>>>>,
}

impl<T: Target, S: StateModel> Sequencer<T, S> {
    /// Create a sequencer driving the given resource
    pub fn new(config: SequencerConfig, client: Arc<dyn ResourceClient<T>>) -> Self {
        let ledger = Ledger {
            name: config.name.clone(),
            states: HashMap::new(),
            queue: VecDeque::new(),
            in_flight: None,
            ids: CorrelationIdAllocator::with_range(config.id_min, config.id_max),
        };

        Self {
            config,
            client,
            ledger: Mutex::new(ledger),
            published: RwLock::new(HashMap::new()),
            delivery: Mutex::new(()),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Get the sequencer's log label
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Get the configuration
    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    /// Register an observer for every future transition
    pub async fn add_observer(&self, observer: Arc<dyn StateObserver<T, S>>) {
        self.observers.write().await.push(observer);
    }

    /// Receive every future transition on a channel
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<StateChange<T, S>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_observer(Arc::new(ChannelObserver::new(tx))).await;
        rx
    }

    /// Submit a command for a target.
    ///
    /// The command is checked against the state the target will be in once
    /// its already-queued commands succeed. If the resource is idle it is
    /// dispatched before this returns.
    pub async fn submit(
        &self,
        target: T,
        kind: CommandKind,
        params: CommandParams,
    ) -> Result<CorrelationId, SequencerError> {
        let mut ledger = self.ledger.lock().await;

        if !self.client.is_available() {
            warn!(
                "[{}] Rejecting {} {}: {} unavailable",
                self.config.name,
                kind,
                target,
                self.client.name()
            );
            return Err(SequencerError::ResourceUnavailable(self.client.name().to_string()));
        }

        match ledger.projected_state(&target).admit(kind) {
            Admission::Reject(reason) => {
                debug!("[{}] Rejecting {} {}: {}", self.config.name, kind, target, reason);
                Err(SequencerError::rejected(&target, reason))
            }
            Admission::Interrupt => ledger.interrupt(&target, self.client.as_ref()),
            Admission::Dispatch { .. } => {
                let id = ledger.next_id(&target)?;
                debug!("[{}] Queued command {} ({} {})", self.config.name, id, kind, target);
                ledger.queue.push_back(Command::new(id, target, kind, params));

                let mut effects = Vec::new();
                ledger.advance(self.client.as_ref(), &mut effects);
                self.commit(ledger, effects).await;
                Ok(id)
            }
        }
    }

    /// Completion callback from the resource. Returns false for ids that are
    /// not in flight (late, duplicate or already failed by the watchdog).
    pub async fn on_command_completed(&self, id: CorrelationId, success: bool) -> bool {
        let mut ledger = self.ledger.lock().await;
        let mut effects = Vec::new();

        if !ledger.complete(id, success, self.client.as_ref(), &mut effects) {
            warn!("[{}] Completion for unknown command {}", self.config.name, id);
            return false;
        }

        self.commit(ledger, effects).await;
        true
    }

    /// Withdraw a command that has not been dispatched yet
    pub async fn cancel(&self, id: CorrelationId) -> Result<(), SequencerError> {
        let mut ledger = self.ledger.lock().await;

        if ledger.in_flight.as_ref().is_some_and(|f| f.command.id == id) {
            return Err(SequencerError::AlreadyDispatched(id));
        }

        let pos = ledger
            .queue
            .iter()
            .position(|c| c.id == id)
            .ok_or(SequencerError::UnknownCommand(id))?;
        if let Some(command) = ledger.queue.remove(pos) {
            info!(
                "[{}] Canceled command {} ({} {})",
                self.config.name, id, command.kind, command.target
            );
        }
        Ok(())
    }

    /// Ask the resource to interrupt the in-flight command. Its completion
    /// still arrives through [`Self::on_command_completed`].
    pub async fn abort(&self, id: CorrelationId) -> Result<bool, SequencerError> {
        let ledger = self.ledger.lock().await;

        if !ledger.in_flight.as_ref().is_some_and(|f| f.command.id == id) {
            return Err(SequencerError::UnknownCommand(id));
        }

        let interrupted = self.client.cancel_in_flight(id);
        info!("[{}] Abort {}: interrupted={}", self.config.name, id, interrupted);
        Ok(interrupted)
    }

    /// State of a target as last announced to observers, baseline if never seen
    pub async fn get_state(&self, target: &T) -> S {
        self.published
            .read()
            .await
            .get(target)
            .copied()
            .unwrap_or_else(S::baseline)
    }

    /// The resource's client link died
    pub async fn on_resource_lost(&self, reason: &str) {
        let mut ledger = self.ledger.lock().await;
        let err = SequencerError::ResourceLost(self.client.name().to_string());
        warn!("[{}] {}: {}", self.config.name, err, reason);

        let mut effects = Vec::new();
        ledger.lose(self.client.as_ref(), &mut effects);
        self.commit(ledger, effects).await;
    }

    /// Fail the in-flight command if it has been out longer than `max_age`
    pub async fn expire_overdue(&self, max_age: Duration) -> Option<CorrelationId> {
        let mut ledger = self.ledger.lock().await;

        let id = ledger
            .in_flight
            .as_ref()
            .filter(|f| f.dispatched_at.elapsed() >= max_age)
            .map(|f| f.command.id)?;

        warn!(
            "[{}] Command {} exceeded {}ms without completion",
            self.config.name,
            id,
            max_age.as_millis()
        );
        let mut effects = Vec::new();
        ledger.complete(id, false, self.client.as_ref(), &mut effects);
        self.commit(ledger, effects).await;
        Some(id)
    }

    /// Get the in-flight correlation id
    pub async fn in_flight(&self) -> Option<CorrelationId> {
        self.ledger
            .lock()
            .await
            .in_flight
            .as_ref()
            .map(|f| f.command.id)
    }

    /// Get count of queued, undispatched commands
    pub async fn pending_count(&self) -> usize {
        self.ledger.lock().await.queue.len()
    }

    /// All tracked targets and their announced states
    pub async fn snapshot(&self) -> Vec<(T, S)> {
        self.published
            .read()
            .await
            .iter()
            .map(|(t, s)| (t.clone(), *s))
            .collect()
    }

    /// Release the ledger and perform its effects in order. A failed dispatch
    /// is settled as an unsuccessful completion, which may dispatch the next
    /// queued command.
    async fn commit(&self, ledger: MutexGuard<'_, Ledger<T, S>>, effects: Vec<Effect<T, S>>) {
        let mut ledger = Some(ledger);
        let mut effects = effects;

        loop {
            let delivery = self.delivery.lock().await;
            drop(ledger.take());
            let failed = self.deliver(effects).await;
            drop(delivery);

            let Some(id) = failed else {
                return;
            };

            let mut guard = self.ledger.lock().await;
            effects = Vec::new();
            guard.complete(id, false, self.client.as_ref(), &mut effects);
            ledger = Some(guard);
        }
    }

    /// Returns the id of a dispatch the resource refused
    async fn deliver(&self, effects: Vec<Effect<T, S>>) -> Option<CorrelationId> {
        let observers = self.observers.read().await;

        for effect in effects {
            match effect {
                Effect::Notify(change) => {
                    for observer in observers.iter() {
                        observer.on_state_changed(&change.target, change.previous, change.current);
                    }

                    let mut published = self.published.write().await;
                    if change.current.is_retained() {
                        published.insert(change.target, change.current);
                    } else {
                        published.remove(&change.target);
                    }
                }
                Effect::Dispatch(command) => {
                    if let Err(source) = self.client.dispatch(&command) {
                        let err = SequencerError::DispatchFailure {
                            id: command.id,
                            source,
                        };
                        warn!(
                            "[{}] {} ({} {})",
                            self.config.name, err, command.kind, command.target
                        );
                        return Some(command.id);
                    }
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devseq_shared::DispatchError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    type Dev = &'static str;

    #[derive(Default)]
    struct MockClient {
        unavailable: AtomicBool,
        fail_dispatch: AtomicBool,
        interruptible: AtomicBool,
        dispatched: StdMutex<Vec<Command<Dev>>>,
        interrupted: StdMutex<Vec<CorrelationId>>,
    }

    impl MockClient {
        fn dispatched_targets(&self) -> Vec<Dev> {
            self.dispatched.lock().unwrap().iter().map(|c| c.target).collect()
        }

        fn last_id(&self) -> CorrelationId {
            self.dispatched.lock().unwrap().last().expect("something dispatched").id
        }
    }

    impl ResourceClient<Dev> for MockClient {
        fn name(&self) -> &str {
            "mock"
        }

        fn is_available(&self) -> bool {
            !self.unavailable.load(Ordering::SeqCst)
        }

        fn dispatch(&self, command: &Command<Dev>) -> Result<(), DispatchError> {
            self.dispatched.lock().unwrap().push(command.clone());
            if self.fail_dispatch.load(Ordering::SeqCst) {
                return Err(DispatchError::Remote("transaction failed".into()));
            }
            Ok(())
        }

        fn cancel_in_flight(&self, id: CorrelationId) -> bool {
            self.interrupted.lock().unwrap().push(id);
            self.interruptible.load(Ordering::SeqCst)
        }
    }

    fn profile(client: &Arc<MockClient>) -> ProfileSequencer<Dev> {
        Sequencer::new(SequencerConfig::default(), client.clone())
    }

    fn drain<T, S>(rx: &mut mpsc::UnboundedReceiver<StateChange<T, S>>) -> Vec<(T, S, S)> {
        let mut out = Vec::new();
        while let Ok(c) = rx.try_recv() {
            out.push((c.target, c.previous, c.current));
        }
        out
    }

    async fn connect(seq: &ProfileSequencer<Dev>, target: Dev) -> Result<CorrelationId, SequencerError> {
        seq.submit(target, CommandKind::Connect, CommandParams::default()).await
    }

    #[tokio::test]
    async fn test_connect_success_notifies_in_order() {
        use ProfileState::*;

        let client = Arc::new(MockClient::default());
        let seq = profile(&client);
        let mut rx = seq.subscribe().await;

        let id = connect(&seq, "A").await.unwrap();
        assert_eq!(client.dispatched_targets(), vec!["A"]);
        assert_eq!(seq.get_state(&"A").await, Connecting);
        assert_eq!(seq.in_flight().await, Some(id));

        assert!(seq.on_command_completed(id, true).await);
        assert_eq!(seq.get_state(&"A").await, Connected);
        assert_eq!(
            drain(&mut rx),
            vec![("A", Disconnected, Connecting), ("A", Connecting, Connected)]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_rolls_back() {
        let client = Arc::new(MockClient::default());
        let seq = profile(&client);

        let id = connect(&seq, "A").await.unwrap();
        seq.on_command_completed(id, false).await;
        assert_eq!(seq.get_state(&"A").await, ProfileState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_cycle() {
        let client = Arc::new(MockClient::default());
        let seq = profile(&client);

        let id = connect(&seq, "A").await.unwrap();
        seq.on_command_completed(id, true).await;

        let id = seq
            .submit("A", CommandKind::Disconnect, CommandParams::default())
            .await
            .unwrap();
        assert_eq!(seq.get_state(&"A").await, ProfileState::Disconnecting);

        seq.on_command_completed(id, false).await;
        assert_eq!(seq.get_state(&"A").await, ProfileState::Connected);
    }

    #[tokio::test]
    async fn test_second_target_queues_until_first_completes() {
        let client = Arc::new(MockClient::default());
        let seq = profile(&client);

        let a = connect(&seq, "A").await.unwrap();
        let b = connect(&seq, "B").await.unwrap();
        assert_eq!(client.dispatched_targets(), vec!["A"]);
        assert_eq!(seq.pending_count().await, 1);
        assert_eq!(seq.get_state(&"B").await, ProfileState::Disconnected);

        seq.on_command_completed(a, true).await;
        assert_eq!(client.dispatched_targets(), vec!["A", "B"]);
        assert_eq!(seq.in_flight().await, Some(b));
        assert_eq!(seq.get_state(&"B").await, ProfileState::Connecting);
    }

    #[tokio::test]
    async fn test_at_most_one_in_flight() {
        let client = Arc::new(MockClient::default());
        let seq = profile(&client);
        let targets = ["A", "B", "C", "D", "E"];

        for t in targets {
            connect(&seq, t).await.unwrap();
            assert_eq!(client.dispatched.lock().unwrap().len(), 1);
        }

        let mut completed = 0;
        while let Some(id) = seq.in_flight().await {
            let dispatched = client.dispatched.lock().unwrap().len();
            assert!(dispatched - completed <= 1);
            seq.on_command_completed(id, true).await;
            completed += 1;
        }

        assert_eq!(completed, targets.len());
        assert_eq!(client.dispatched_targets(), targets.to_vec());
    }

    #[tokio::test]
    async fn test_connect_when_connected_rejected() {
        let client = Arc::new(MockClient::default());
        let seq = profile(&client);

        let id = connect(&seq, "A").await.unwrap();
        seq.on_command_completed(id, true).await;

        let result = connect(&seq, "A").await;
        assert!(matches!(result, Err(SequencerError::RejectedSubmission { .. })));
        assert_eq!(client.dispatched.lock().unwrap().len(), 1);

        // The rejection did not consume an id
        let next = connect(&seq, "B").await.unwrap();
        assert_eq!(next.0, id.0 + 1);
    }

    #[tokio::test]
    async fn test_duplicate_queued_connect_rejected() {
        let client = Arc::new(MockClient::default());
        let seq = profile(&client);

        connect(&seq, "A").await.unwrap();
        connect(&seq, "B").await.unwrap();
        assert!(connect(&seq, "B").await.is_err());
        assert!(connect(&seq, "A").await.is_err());
        assert_eq!(seq.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_cancel_dispatched_fails_without_change() {
        let client = Arc::new(MockClient::default());
        let seq = profile(&client);

        let id = connect(&seq, "A").await.unwrap();
        assert_eq!(seq.cancel(id).await, Err(SequencerError::AlreadyDispatched(id)));
        assert_eq!(seq.get_state(&"A").await, ProfileState::Connecting);
        assert_eq!(seq.in_flight().await, Some(id));
    }

    #[tokio::test]
    async fn test_cancel_queued_command() {
        let client = Arc::new(MockClient::default());
        let seq = profile(&client);

        let a = connect(&seq, "A").await.unwrap();
        let b = connect(&seq, "B").await.unwrap();
        seq.cancel(b).await.unwrap();
        assert_eq!(seq.pending_count().await, 0);

        seq.on_command_completed(a, true).await;
        assert_eq!(client.dispatched_targets(), vec!["A"]);
        assert_eq!(seq.in_flight().await, None);

        assert_eq!(seq.cancel(b).await, Err(SequencerError::UnknownCommand(b)));
    }

    #[tokio::test]
    async fn test_unavailable_resource_rejects_synchronously() {
        let client = Arc::new(MockClient::default());
        client.unavailable.store(true, Ordering::SeqCst);
        let seq = profile(&client);

        let result = connect(&seq, "A").await;
        assert!(matches!(result, Err(SequencerError::ResourceUnavailable(_))));
        assert_eq!(seq.pending_count().await, 0);
        assert!(client.dispatched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_failure_treated_as_completion_failure() {
        use ProfileState::*;

        let client = Arc::new(MockClient::default());
        let seq = profile(&client);
        let mut rx = seq.subscribe().await;

        let a = connect(&seq, "A").await.unwrap();
        connect(&seq, "B").await.unwrap();

        client.fail_dispatch.store(true, Ordering::SeqCst);
        seq.on_command_completed(a, true).await;

        // B was dispatched, refused, and rolled back
        assert_eq!(client.dispatched_targets(), vec!["A", "B"]);
        assert_eq!(seq.get_state(&"B").await, Disconnected);
        assert_eq!(seq.in_flight().await, None);
        assert_eq!(
            drain(&mut rx),
            vec![
                ("A", Disconnected, Connecting),
                ("A", Connecting, Connected),
                ("B", Disconnected, Connecting),
                ("B", Connecting, Disconnected),
            ]
        );
    }

    #[tokio::test]
    async fn test_resource_lost_moves_on_to_next() {
        let client = Arc::new(MockClient::default());
        let seq = profile(&client);

        connect(&seq, "A").await.unwrap();
        let b = connect(&seq, "B").await.unwrap();

        seq.on_resource_lost("binder died").await;
        assert_eq!(seq.get_state(&"A").await, ProfileState::Disconnected);
        assert_eq!(seq.in_flight().await, Some(b));
        assert_eq!(seq.get_state(&"B").await, ProfileState::Connecting);
    }

    #[tokio::test]
    async fn test_resource_lost_while_unbound_drops_queue() {
        let client = Arc::new(MockClient::default());
        let seq = profile(&client);

        connect(&seq, "A").await.unwrap();
        connect(&seq, "B").await.unwrap();

        client.unavailable.store(true, Ordering::SeqCst);
        seq.on_resource_lost("service unbound").await;

        assert_eq!(seq.in_flight().await, None);
        assert_eq!(seq.pending_count().await, 0);
        assert_eq!(seq.get_state(&"B").await, ProfileState::Disconnected);
    }

    #[tokio::test]
    async fn test_stale_command_dropped_on_dequeue() {
        let client = Arc::new(MockClient::default());
        let seq = profile(&client);

        let a = connect(&seq, "A").await.unwrap();
        seq.submit("A", CommandKind::Disconnect, CommandParams::default())
            .await
            .unwrap();
        assert_eq!(seq.pending_count().await, 1);

        // Connect failed, so the queued disconnect no longer applies
        seq.on_command_completed(a, false).await;
        assert_eq!(seq.pending_count().await, 0);
        assert_eq!(seq.in_flight().await, None);
        assert_eq!(client.dispatched_targets(), vec!["A"]);
    }

    #[tokio::test]
    async fn test_disconnect_accepted_behind_in_flight_connect() {
        let client = Arc::new(MockClient::default());
        let seq = profile(&client);

        let a = connect(&seq, "A").await.unwrap();
        let d = seq
            .submit("A", CommandKind::Disconnect, CommandParams::default())
            .await
            .unwrap();
        // Connecting is expected to end Connected, so a second connect is redundant
        assert!(connect(&seq, "A").await.is_err());

        seq.on_command_completed(a, true).await;
        assert_eq!(seq.in_flight().await, Some(d));
        assert_eq!(seq.get_state(&"A").await, ProfileState::Disconnecting);
    }

    #[tokio::test]
    async fn test_unknown_completion_ignored() {
        let client = Arc::new(MockClient::default());
        let seq = profile(&client);

        let id = connect(&seq, "A").await.unwrap();
        assert!(!seq.on_command_completed(CorrelationId(id.0 + 100), true).await);
        assert_eq!(seq.get_state(&"A").await, ProfileState::Connecting);
    }

    #[tokio::test]
    async fn test_ids_increase_and_wrap_past_outstanding() {
        let client = Arc::new(MockClient::default());
        let config = SequencerConfig {
            id_min: 1,
            id_max: 3,
            ..Default::default()
        };
        let seq: ProfileSequencer<Dev> = Sequencer::new(config, client.clone());

        let a = connect(&seq, "A").await.unwrap();
        let b = connect(&seq, "B").await.unwrap();
        let c = connect(&seq, "C").await.unwrap();
        assert_eq!((a.0, b.0, c.0), (1, 2, 3));

        // All three outstanding: wrap finds nothing free
        assert!(connect(&seq, "D").await.is_err());

        seq.on_command_completed(a, true).await;
        let d = connect(&seq, "D").await.unwrap();
        assert_eq!(d, CorrelationId(1));
    }

    #[tokio::test]
    async fn test_cancel_kind_withdraws_and_interrupts() {
        let client = Arc::new(MockClient::default());
        client.interruptible.store(true, Ordering::SeqCst);
        let seq = profile(&client);

        let a = connect(&seq, "A").await.unwrap();
        connect(&seq, "B").await.unwrap();

        let cancel_b = seq
            .submit("B", CommandKind::Cancel, CommandParams::default())
            .await
            .unwrap();
        assert!(cancel_b > a);
        assert_eq!(seq.pending_count().await, 0);

        seq.submit("A", CommandKind::Cancel, CommandParams::default())
            .await
            .unwrap();
        assert_eq!(*client.interrupted.lock().unwrap(), vec![a]);

        let nothing = seq
            .submit("C", CommandKind::Cancel, CommandParams::default())
            .await;
        assert!(matches!(nothing, Err(SequencerError::RejectedSubmission { .. })));
    }

    #[tokio::test]
    async fn test_abort_only_in_flight() {
        let client = Arc::new(MockClient::default());
        let seq = profile(&client);

        let a = connect(&seq, "A").await.unwrap();
        let b = connect(&seq, "B").await.unwrap();

        assert_eq!(seq.abort(a).await, Ok(false));
        assert_eq!(seq.abort(b).await, Err(SequencerError::UnknownCommand(b)));
        assert_eq!(*client.interrupted.lock().unwrap(), vec![a]);
    }

    #[tokio::test]
    async fn test_sound_requests_forgotten_when_idle() {
        let client = Arc::new(MockClient::default());
        let seq: SoundSequencer<Dev> = Sequencer::new(SequencerConfig::default(), client.clone());

        let id = seq
            .submit("beep", CommandKind::Run, CommandParams::tone(2000, 100))
            .await
            .unwrap();
        assert_eq!(seq.get_state(&"beep").await, SoundState::Running);
        assert_eq!(seq.snapshot().await, vec![("beep", SoundState::Running)]);
        assert!(seq
            .submit("beep", CommandKind::Run, CommandParams::tone(2000, 100))
            .await
            .is_err());

        seq.on_command_completed(id, true).await;
        assert_eq!(seq.get_state(&"beep").await, SoundState::Idle);
        assert!(seq.snapshot().await.is_empty());
        assert_eq!(client.last_id(), id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_overdue() {
        let client = Arc::new(MockClient::default());
        let seq = profile(&client);

        let id = connect(&seq, "A").await.unwrap();
        assert_eq!(seq.expire_overdue(Duration::from_secs(3)).await, None);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(seq.expire_overdue(Duration::from_secs(3)).await, Some(id));
        assert_eq!(seq.get_state(&"A").await, ProfileState::Disconnected);

        // A late completion is ignored
        assert!(!seq.on_command_completed(id, true).await);
    }

    struct Recorder(StdMutex<Vec<(Dev, ProfileState, ProfileState)>>);

    impl StateObserver<Dev, ProfileState> for Recorder {
        fn on_state_changed(&self, target: &Dev, previous: ProfileState, current: ProfileState) {
            self.0.lock().unwrap().push((*target, previous, current));
        }
    }

    #[tokio::test]
    async fn test_direct_observer() {
        let client = Arc::new(MockClient::default());
        let seq = profile(&client);
        let recorder = Arc::new(Recorder(StdMutex::new(Vec::new())));
        seq.add_observer(recorder.clone()).await;

        let id = connect(&seq, "A").await.unwrap();
        seq.on_command_completed(id, true).await;

        assert_eq!(recorder.0.lock().unwrap().len(), 2);
    }

    /// Blocks inside the first notification until released
    struct SlowObserver {
        entered: AtomicBool,
        fired: AtomicBool,
    }

    impl StateObserver<Dev, ProfileState> for SlowObserver {
        fn on_state_changed(&self, _target: &Dev, _previous: ProfileState, _current: ProfileState) {
            self.entered.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            self.fired.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_state_not_visible_before_notification() {
        let client = Arc::new(MockClient::default());
        let seq = Arc::new(profile(&client));
        let observer = Arc::new(SlowObserver {
            entered: AtomicBool::new(false),
            fired: AtomicBool::new(false),
        });
        seq.add_observer(observer.clone()).await;

        let submit = {
            let seq = seq.clone();
            tokio::spawn(async move { connect(&seq, "A").await })
        };

        while !observer.entered.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        // The ledger already says Connecting, but nobody has been told yet
        assert_eq!(seq.get_state(&"A").await, ProfileState::Disconnected);
        assert!(seq.snapshot().await.is_empty());

        submit.await.unwrap().unwrap();
        assert!(observer.fired.load(Ordering::SeqCst));
        assert_eq!(seq.get_state(&"A").await, ProfileState::Connecting);
    }

    /// Counts dispatches against completions and hands ids to a completer
    struct CountingClient {
        dispatched: AtomicUsize,
        completed: Arc<AtomicUsize>,
        overlapped: AtomicBool,
        ids: mpsc::UnboundedSender<CorrelationId>,
    }

    impl ResourceClient<u32> for CountingClient {
        fn name(&self) -> &str {
            "counting"
        }

        fn is_available(&self) -> bool {
            true
        }

        fn dispatch(&self, command: &Command<u32>) -> Result<(), DispatchError> {
            let dispatched = self.dispatched.fetch_add(1, Ordering::SeqCst) + 1;
            if dispatched.saturating_sub(self.completed.load(Ordering::SeqCst)) > 1 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            let _ = self.ids.send(command.id);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submitters_never_overlap() {
        let (ids, mut id_rx) = mpsc::unbounded_channel();
        let completed = Arc::new(AtomicUsize::new(0));
        let client = Arc::new(CountingClient {
            dispatched: AtomicUsize::new(0),
            completed: completed.clone(),
            overlapped: AtomicBool::new(false),
            ids,
        });
        let seq: Arc<ProfileSequencer<u32>> =
            Arc::new(Sequencer::new(SequencerConfig::default(), client.clone()));

        // Completions arrive on their own tasks, racing the submitters
        {
            let seq = seq.clone();
            let completed = completed.clone();
            tokio::spawn(async move {
                while let Some(id) = id_rx.recv().await {
                    let seq = seq.clone();
                    let completed = completed.clone();
                    tokio::spawn(async move {
                        tokio::task::yield_now().await;
                        completed.fetch_add(1, Ordering::SeqCst);
                        assert!(seq.on_command_completed(id, true).await);
                    });
                }
            });
        }

        let submitters: Vec<_> = (0..4u32)
            .map(|n| {
                let seq = seq.clone();
                tokio::spawn(async move {
                    for t in n * 5 + 1..=n * 5 + 5 {
                        seq.submit(t, CommandKind::Connect, CommandParams::default())
                            .await
                            .unwrap();
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for submitter in submitters {
            submitter.await.unwrap();
        }

        let settled = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = seq.snapshot().await;
                if snapshot.len() == 20 && snapshot.iter().all(|(_, s)| *s == ProfileState::Connected) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        assert!(settled.is_ok(), "targets did not all connect");
        assert!(!client.overlapped.load(Ordering::SeqCst));
        assert_eq!(client.dispatched.load(Ordering::SeqCst), 20);
        assert_eq!(completed.load(Ordering::SeqCst), 20);
        assert_eq!(seq.in_flight().await, None);
    }
}
