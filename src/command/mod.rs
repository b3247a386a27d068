//! Command sequencing for single-threaded external resources
//!
//! This module handles:
//! - Admitting commands against per-target state
//! - Queuing them FIFO with at most one in flight
//! - Settling completions, dispatch failures and resource loss
//! - Failing commands the resource never answers

mod sequencer;
mod watchdog;

pub use sequencer::{ProfileSequencer, Sequencer, SequencerConfig, SoundSequencer};
pub use watchdog::DispatchWatchdog;
