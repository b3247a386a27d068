//! Collaborator plumbing for external resources
//!
//! This module handles:
//! - The fire-and-forget command interface a resource implements
//! - Death notification when the resource's client link dies

mod client;
mod liveness;

pub use client::ResourceClient;
pub use liveness::{death_link, DeathNotifier, DeathRecipient};
