//! Per-target State Machines
//!
//! Defines the admission rules and settle transitions for the two target
//! flavors: profile connections and timed sound requests.

use std::fmt;

use crate::CommandKind;

/// How a target in a given state treats a newly submitted command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission<S> {
    /// Queue the command; on dispatch the target enters `in_flight`
    Dispatch { in_flight: S },
    /// Never queued: withdraw the target's queued work and interrupt it if in flight
    Interrupt,
    /// Incompatible with the current state
    Reject(&'static str),
}

/// Transition rules for one flavor of target
pub trait StateModel: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// State of a target that was never seen, or has settled back to rest
    fn baseline() -> Self;

    /// Decide what submitting `kind` against this state means
    fn admit(self, kind: CommandKind) -> Admission<Self>;

    /// Terminal state after an in-flight command of `kind` finished
    fn settle(self, kind: CommandKind, success: bool) -> Self;

    /// Whether the target is occupying the underlying resource
    fn is_in_flight(self) -> bool;

    /// Terminal state after the resource died while in this state
    fn lost(self) -> Self;

    /// Whether the state map keeps an entry for a target in this state
    fn is_retained(self) -> bool {
        true
    }

    /// Check if moving from `self` to `to` is ever legal
    fn is_valid_transition(self, to: Self) -> bool;

    /// State an in-flight `kind` is expected to leave the target in
    fn expected(self, kind: CommandKind) -> Self {
        self.settle(kind, true)
    }

    /// State the target would reach if `kind` were admitted and succeeded
    fn project(self, kind: CommandKind) -> Option<Self> {
        match self.admit(kind) {
            Admission::Dispatch { in_flight } => Some(in_flight.expected(kind)),
            _ => None,
        }
    }
}

/// Connection state of a remote device on a profile (HID over GATT, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl StateModel for ProfileState {
    fn baseline() -> Self {
        ProfileState::Disconnected
    }

    fn admit(self, kind: CommandKind) -> Admission<Self> {
        use CommandKind::*;
        use ProfileState::*;

        match (self, kind) {
            (_, Cancel) => Admission::Interrupt,

            (Disconnected, Connect) => Admission::Dispatch { in_flight: Connecting },
            (Connected, Disconnect) => Admission::Dispatch { in_flight: Disconnecting },

            (Connecting, Connect) => Admission::Reject("connection already in progress"),
            (Connected, Connect) => Admission::Reject("already connected"),
            (Disconnecting, Connect) => Admission::Reject("disconnection in progress"),
            (Disconnected, Disconnect) => Admission::Reject("not connected"),
            (Connecting | Disconnecting, Disconnect) => {
                Admission::Reject("another command is in flight for this device")
            }
            (_, Run) => Admission::Reject("profile targets do not run timed operations"),
        }
    }

    fn settle(self, kind: CommandKind, success: bool) -> Self {
        use ProfileState::*;

        match (self, kind, success) {
            (Connecting, CommandKind::Connect, true) => Connected,
            (Connecting, CommandKind::Connect, false) => Disconnected,
            (Disconnecting, CommandKind::Disconnect, true) => Disconnected,
            (Disconnecting, CommandKind::Disconnect, false) => Connected,
            (state, _, _) => state,
        }
    }

    fn is_in_flight(self) -> bool {
        matches!(self, ProfileState::Connecting | ProfileState::Disconnecting)
    }

    fn lost(self) -> Self {
        match self {
            ProfileState::Connecting | ProfileState::Disconnecting => ProfileState::Disconnected,
            state => state,
        }
    }

    fn is_valid_transition(self, to: Self) -> bool {
        use ProfileState::*;

        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
                | (Disconnecting, Connected)
        )
    }
}

/// State of a timed sound request on a single-threaded sounder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoundState {
    Idle,
    Running,
}

impl StateModel for SoundState {
    fn baseline() -> Self {
        SoundState::Idle
    }

    fn admit(self, kind: CommandKind) -> Admission<Self> {
        match (self, kind) {
            (_, CommandKind::Cancel) => Admission::Interrupt,
            (SoundState::Idle, CommandKind::Run) => Admission::Dispatch {
                in_flight: SoundState::Running,
            },
            (SoundState::Running, CommandKind::Run) => Admission::Reject("request already running"),
            (_, CommandKind::Connect | CommandKind::Disconnect) => {
                Admission::Reject("sound requests do not connect")
            }
        }
    }

    fn settle(self, _kind: CommandKind, _success: bool) -> Self {
        SoundState::Idle
    }

    fn is_in_flight(self) -> bool {
        self == SoundState::Running
    }

    fn lost(self) -> Self {
        SoundState::Idle
    }

    fn is_retained(self) -> bool {
        self == SoundState::Running
    }

    fn is_valid_transition(self, to: Self) -> bool {
        self != to
    }

    fn expected(self, _kind: CommandKind) -> Self {
        // A finished request is forgotten, so a run in progress or queued
        // projects to Running: the same request id cannot be queued twice.
        self
    }
}
