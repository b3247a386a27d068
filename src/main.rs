mod command;
mod connection;
mod observer;
mod request;
mod sim;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use command::{DispatchWatchdog, ProfileSequencer, SequencerConfig, SoundSequencer};
use devseq_shared::{CommandKind, CommandParams, DeviceAddress, SoundRequestId, StateChange};
use observer::{MemoryPriorityStore, Priority, PriorityBumpObserver, PriorityStore};
use request::{bounded_request, RequestConfig};
use sim::{forward_events, SimConfig, SimulatedResource};
use tokio::sync::mpsc;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("devseq starting");

    // HID-over-GATT profile on a simulated host stack
    let (hid_host, hid_events, hid_death) = SimulatedResource::new(SimConfig {
        name: "hid-host".into(),
        latency: Duration::from_millis(250),
        fail_every: Some(4),
        ..Default::default()
    });
    let hogp: Arc<ProfileSequencer<DeviceAddress>> = Arc::new(ProfileSequencer::new(
        SequencerConfig {
            name: "hogp".into(),
            dispatch_timeout: Some(Duration::from_secs(3)),
            ..Default::default()
        },
        hid_host.clone(),
    ));
    tokio::spawn(forward_events(hid_events, hogp.clone()));
    let hogp_liveness = hid_death.link(hogp.clone());
    let _hogp_watchdog = DispatchWatchdog::from_config(hogp.clone()).map(DispatchWatchdog::spawn);

    // Priority bookkeeping reacts to profile transitions
    let priorities = Arc::new(MemoryPriorityStore::new());
    let keyboard: DeviceAddress = "00:1A:7D:DA:71:13".parse()?;
    let mouse: DeviceAddress = "00:1A:7D:DA:71:14".parse()?;
    priorities.set(&mouse, Priority::Off).await?;
    let bump = PriorityBumpObserver::new(priorities.clone());
    tokio::spawn(bump.run(hogp.subscribe().await));

    let hogp_changes = hogp.subscribe().await;
    tokio::spawn(log_changes("hogp", hogp_changes));

    // Piezo sounder on a simulated HAL
    let (piezo_hal, piezo_events, piezo_death) = SimulatedResource::new(SimConfig {
        name: "piezo-hal".into(),
        ..Default::default()
    });
    let piezo: Arc<SoundSequencer<SoundRequestId>> = Arc::new(SoundSequencer::new(
        SequencerConfig {
            name: "piezo".into(),
            ..Default::default()
        },
        piezo_hal.clone(),
    ));
    tokio::spawn(forward_events(piezo_events, piezo.clone()));
    let piezo_liveness = piezo_death.link(piezo.clone());

    let piezo_changes = piezo.subscribe().await;
    tokio::spawn(log_changes("piezo", piezo_changes));

    // Profile connections: the second queues behind the first
    for device in [keyboard, mouse] {
        match hogp
            .submit(device, CommandKind::Connect, CommandParams::with_priority(100))
            .await
        {
            Ok(id) => info!("Connect {} submitted as {}", device, id),
            Err(e) => warn!("Connect {} rejected: {}", device, e),
        }
    }
    if let Err(e) = hogp
        .submit(keyboard, CommandKind::Connect, CommandParams::default())
        .await
    {
        info!("Duplicate connect refused: {}", e);
    }

    // Tones: three requests share the single buzzer
    let mut tone_ids = Vec::new();
    for (n, freq) in [(1, 2000), (2, 3000), (3, 4000)] {
        let id = piezo
            .submit(SoundRequestId(n), CommandKind::Run, CommandParams::tone(freq, 150))
            .await
            .with_context(|| format!("tone {}", n))?;
        info!("Tone {}Hz submitted as {}", freq, id);
        tone_ids.push(id);
    }
    info!(
        "piezo busy with {:?}, {} queued",
        piezo.in_flight().await,
        piezo.pending_count().await
    );
    piezo.cancel(tone_ids[1]).await.context("cancel tone 2")?;
    piezo
        .submit(SoundRequestId(3), CommandKind::Cancel, CommandParams::default())
        .await
        .context("cancel tone 3")?;

    // AT command exchange waiting on a UI answer
    let (at_requester, mut at_responder) = bounded_request::<String, String>(RequestConfig::default());
    tokio::spawn(async move {
        while let Some(pending) = at_responder.recv().await {
            let answer = format!("{}: OK", pending.query());
            if pending.respond(answer).is_err() {
                warn!("AT response arrived after timeout");
            }
        }
    });
    match at_requester.request("+CSCS=\"UTF-8\"".into()).await {
        Ok(answer) => info!("AT exchange: {}", answer),
        Err(e) => error!("AT exchange failed: {}", e),
    }
    debug_assert!(!at_requester.is_in_flight());

    tokio::time::sleep(Duration::from_secs(1)).await;

    for (device, state) in hogp.snapshot().await {
        let priority = priorities.get(&device).await?;
        info!("{}: {:?} (priority {:?})", device, state, priority);
    }

    // Interrupt a long tone, then drop the HAL mid-tone to exercise death handling
    let long = piezo
        .submit(SoundRequestId(4), CommandKind::Run, CommandParams::tone(1000, 2000))
        .await
        .context("long tone")?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    info!("abort {}: interrupted={}", long, piezo.abort(long).await?);
    tokio::time::sleep(Duration::from_millis(50)).await;

    piezo
        .submit(SoundRequestId(5), CommandKind::Run, CommandParams::tone(1000, 2000))
        .await
        .context("second long tone")?;
    piezo_hal.kill("piezo HAL crashed");
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!(
        "piezo after crash: {:?}, liveness handled={}",
        piezo.get_state(&SoundRequestId(5)).await,
        piezo_liveness.is_finished()
    );
    if let Err(e) = piezo
        .submit(SoundRequestId(6), CommandKind::Run, CommandParams::tone(1000, 100))
        .await
    {
        info!("piezo refuses work after crash: {}", e);
    }

    hogp_liveness.unlink();
    info!("devseq done ({} HID commands dispatched)", hid_host.dispatched_count());
    Ok(())
}

/// Log every transition a sequencer publishes
async fn log_changes<T, S>(label: &'static str, mut changes: mpsc::UnboundedReceiver<StateChange<T, S>>)
where
    T: std::fmt::Display,
    S: std::fmt::Debug,
{
    while let Some(change) = changes.recv().await {
        info!(
            "[{}] {} {:?} -> {:?}",
            label, change.target, change.previous, change.current
        );
    }
}

