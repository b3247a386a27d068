//! devseq Shared Types
//!
//! This crate provides the command vocabulary, per-target state machines and
//! error taxonomy shared by every resource sequencer and its collaborators.

pub mod correlation;
pub mod error;
pub mod state_machine;

use std::fmt;
use std::hash::Hash;
use std::time::{SystemTime, UNIX_EPOCH};

pub use correlation::{CorrelationId, CorrelationIdAllocator};
pub use error::{DispatchError, SequencerError};
pub use state_machine::{Admission, ProfileState, SoundState, StateModel};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Timing parameters for the system
pub mod timing {
    /// Bounded synchronous request timeout (AT-command style exchanges)
    pub const BOUNDED_REQUEST_TIMEOUT_MS: u64 = 5000;

    /// Watchdog tick for in-flight dispatch checks
    pub const WATCHDOG_INTERVAL_MS: u64 = 1000;

    /// Smallest correlation id ever issued (0 is reserved as a sentinel)
    pub const CORRELATION_ID_MIN: u32 = 1;

    /// Largest correlation id before wrapping back to the minimum
    pub const CORRELATION_ID_MAX: u32 = 0x7FFF_FFFF;
}

/// Anything a sequencer can address: a remote device address, a sound request id...
pub trait Target: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

impl<T> Target for T where T: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

/// Bluetooth device address, used as the profile-handler target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(pub [u8; 6]);

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl std::str::FromStr for DeviceAddress {
    type Err = SequencerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| SequencerError::InvalidAddress(s.to_string()))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| SequencerError::InvalidAddress(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(SequencerError::InvalidAddress(s.to_string()));
        }
        Ok(Self(bytes))
    }
}

/// Numeric sound request id, used as the sounder target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SoundRequestId(pub u32);

impl fmt::Display for SoundRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sound#{}", self.0)
    }
}

/// What a command asks the resource to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Bring a profile connection up
    Connect,
    /// Tear a profile connection down
    Disconnect,
    /// Start a timed operation (a tone, a vibration pattern)
    Run,
    /// Withdraw queued work for a target and interrupt it if in flight
    Cancel,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Connect => write!(f, "connect"),
            CommandKind::Disconnect => write!(f, "disconnect"),
            CommandKind::Run => write!(f, "run"),
            CommandKind::Cancel => write!(f, "cancel"),
        }
    }
}

/// Parameters carried by a command; unused fields stay zero
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CommandParams {
    /// Connection priority (profile handlers)
    pub priority: i32,
    /// Tone frequency in Hz (sounders)
    pub frequency_hz: u32,
    /// Operation duration in milliseconds (sounders)
    pub duration_ms: u32,
}

impl CommandParams {
    /// Parameters for a tone of the given pitch and length
    pub fn tone(frequency_hz: u32, duration_ms: u32) -> Self {
        Self {
            frequency_hz,
            duration_ms,
            ..Default::default()
        }
    }

    /// Parameters for a connection request at the given priority
    pub fn with_priority(priority: i32) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }
}

/// A submitted request against a target
#[derive(Debug, Clone, PartialEq)]
pub struct Command<T> {
    pub id: CorrelationId,
    pub target: T,
    pub kind: CommandKind,
    pub params: CommandParams,
    pub submitted_at_ms: u64,
}

impl<T> Command<T> {
    /// Create a command stamped with the current time
    pub fn new(id: CorrelationId, target: T, kind: CommandKind, params: CommandParams) -> Self {
        Self {
            id,
            target,
            kind,
            params,
            submitted_at_ms: now_ms(),
        }
    }
}

/// One state transition of one target, as seen by observers
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange<T, S> {
    pub target: T,
    pub previous: S,
    pub current: S,
}
