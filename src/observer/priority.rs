//! Connection priority bookkeeping
//!
//! Reacts to profile transitions: once a device connects, a priority of
//! `On` or `Undefined` is raised to `AutoConnect` so the device is
//! reconnected automatically next time.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use devseq_shared::{DeviceAddress, ProfileState, StateChange};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info};

/// Persisted connection priority of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Undefined,
    Off,
    On,
    AutoConnect,
}

impl Priority {
    /// Settings-store encoding
    pub fn as_raw(self) -> i32 {
        match self {
            Priority::Undefined => -1,
            Priority::Off => 0,
            Priority::On => 100,
            Priority::AutoConnect => 1000,
        }
    }

    /// Decode a settings-store value; unknown values read as `Undefined`
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Priority::Off,
            100 => Priority::On,
            1000 => Priority::AutoConnect,
            _ => Priority::Undefined,
        }
    }
}

/// Key-value settings store holding per-device priorities
#[async_trait]
pub trait PriorityStore: Send + Sync {
    /// Read the stored priority, `Undefined` when absent
    async fn get(&self, device: &DeviceAddress) -> Result<Priority>;

    /// Persist a priority
    async fn set(&self, device: &DeviceAddress, priority: Priority) -> Result<()>;
}

/// In-memory priority store
#[derive(Debug, Default)]
pub struct MemoryPriorityStore {
    values: RwLock<HashMap<DeviceAddress, i32>>,
}

impl MemoryPriorityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PriorityStore for MemoryPriorityStore {
    async fn get(&self, device: &DeviceAddress) -> Result<Priority> {
        Ok(self
            .values
            .read()
            .await
            .get(device)
            .copied()
            .map(Priority::from_raw)
            .unwrap_or(Priority::Undefined))
    }

    async fn set(&self, device: &DeviceAddress, priority: Priority) -> Result<()> {
        self.values.write().await.insert(*device, priority.as_raw());
        Ok(())
    }
}

/// Raises device priority on successful connection
pub struct PriorityBumpObserver {
    store: Arc<dyn PriorityStore>,
}

impl PriorityBumpObserver {
    pub fn new(store: Arc<dyn PriorityStore>) -> Self {
        Self { store }
    }

    /// Apply one transition; returns the new priority if it was raised
    pub async fn handle(&self, change: &StateChange<DeviceAddress, ProfileState>) -> Result<Option<Priority>> {
        if change.current != ProfileState::Connected {
            return Ok(None);
        }

        let current = self.store.get(&change.target).await?;
        match current {
            Priority::On | Priority::Undefined => {
                self.store.set(&change.target, Priority::AutoConnect).await?;
                info!(
                    "[PRIORITY] {} raised {:?} -> {:?}",
                    change.target,
                    current,
                    Priority::AutoConnect
                );
                Ok(Some(Priority::AutoConnect))
            }
            Priority::Off | Priority::AutoConnect => {
                debug!("[PRIORITY] {} left at {:?}", change.target, current);
                Ok(None)
            }
        }
    }

    /// Consume transitions until the sequencer drops its subscription
    pub async fn run(self, mut changes: mpsc::UnboundedReceiver<StateChange<DeviceAddress, ProfileState>>) {
        while let Some(change) = changes.recv().await {
            if let Err(e) = self.handle(&change).await {
                error!("[PRIORITY] Failed to update {}: {}", change.target, e);
            }
        }
        debug!("[PRIORITY] Subscription closed");
    }
}
