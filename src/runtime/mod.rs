//! Cooperative task scaffolding wiring [`SatLink`]/[`GsLink`] into an
//! `embassy-executor`-hosted scheduler, spec.md §4.6/§5.
//!
//! The teacher repo has no async runtime of its own; this module is
//! grounded on `rtxm-rust-nrf24l01`'s `embassy_rp`/`embassy-time`/
//! `embassy-sync` usage, the sibling pack repo that solves the same
//! "drive a radio from a cooperative scheduler" problem.
//!
//! `Pump`/`Producer`/`Housekeeping` are plain `async fn`s, not
//! `#[embassy_executor::task]`s — embassy tasks cannot be generic, and
//! `SatLink`/`GsLink` are generic over the SPI/GPIO concretes. A host
//! binary wraps these in its own `#[embassy_executor::task]` (SAT
//! firmware, with concrete MCU types) or spawns them on
//! `embassy-executor`'s `std`/thread executor (GS binary, tests).
//!
//! `Modem`/`SatLink`/`GsLink`'s plain, synchronous API (a caller-
//! supplied `delay_ms: FnMut(u32)`) stays intact for callers with their
//! own blocking scheduler. The Pump tasks here instead drive the
//! `_async` methods, whose wait points are real `Timer::after(...)`
//! `.await`s, so a multi-second ACK wait or RESET delay doesn't starve
//! Producer/Housekeeping/the HTTP `last_telemetry` reader the way a
//! busy-spun `delay_ms` would.

extern crate alloc;

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant, Timer};
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;
use serde_json::Value;

use crate::gs_link::GsLink;
use crate::sat_link::SatLink;

/// Depth of the outbound-telemetry / inbound-command channels, spec.md
/// §5 "communicate ... through bounded message channels".
pub const CHANNEL_DEPTH: usize = 4;

/// Producer -> Pump: telemetry objects awaiting transmission (SAT).
pub type TelemetryChannel = Channel<CriticalSectionRawMutex, Value, CHANNEL_DEPTH>;
/// Producer -> Pump: command text awaiting transmission (GS).
pub type CommandChannel = Channel<CriticalSectionRawMutex, alloc::string::String, CHANNEL_DEPTH>;

/// The single mutex-guarded "last telemetry" cell opaque HTTP readers
/// on the GS side copy out of under a short critical section, spec.md
/// §5.
pub type LastTelemetryCell = Mutex<CriticalSectionRawMutex, RefCell<Option<Value>>>;

pub const fn new_last_telemetry_cell() -> LastTelemetryCell {
    Mutex::new(RefCell::new(None))
}

/// Graceful-exit flag polled by each task at its next yield point,
/// spec.md §5 ("no cross-task cancellation primitive").
pub struct Shutdown(AtomicBool);

impl Shutdown {
    pub const fn new() -> Self {
        Shutdown(AtomicBool::new(false))
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> u32 {
    Instant::now().as_millis() as u32
}

/// Pump task for the satellite side: alternates a command-listening
/// window with telemetry emission, spec.md §4.4/§4.6. `telemetry_rx`
/// carries objects built by the Producer task (sensor fan-out is an
/// opaque external per spec.md §1, so this module only carries the
/// channel, not a sensor registry).
///
/// Every wait inside `SatLink`'s `_async` methods (ACK deadlines, the
/// inter-part delay, the RESET delay) is a real `Timer::after(...)`
/// `.await`, not a blocked/spun `delay_ms`, so Producer and
/// Housekeeping actually run while a send is in flight — spec.md §5
/// "Tasks must not busy-spin; every wait ... yields at least every few
/// ms".
pub async fn pump_sat<SPI, CS, RESET, E>(
    mut link: SatLink<SPI, CS, RESET>,
    telemetry_rx: &TelemetryChannel,
    shutdown: &Shutdown,
) where
    SPI: SpiBus<u8, Error = E>,
    CS: OutputPin,
    RESET: OutputPin,
{
    loop {
        if shutdown.requested() {
            return;
        }

        if let Err(e) = link.poll_commands_async(&now_ms).await {
            defmt::warn!("poll_commands error: {}", e);
        }

        if let Ok(obj) = telemetry_rx.try_receive() {
            if let Err(e) = link.send_telemetry_async(obj, &now_ms).await {
                defmt::warn!("send_telemetry error: {}", e);
            }
        }

        Timer::after(Duration::from_millis(5)).await;
    }
}

/// Pump task for the ground-station side: receives/reassembles/ACKs
/// telemetry, forwards command responses, and emits the optional
/// heartbeat. See [`pump_sat`] for why every wait point here is an
/// `.await`, not a blocking delay.
pub async fn pump_gs<SPI, CS, RESET, E>(
    mut link: GsLink<SPI, CS, RESET>,
    last_telemetry: &'static LastTelemetryCell,
    command_rx: &CommandChannel,
    shutdown: &Shutdown,
) where
    SPI: SpiBus<u8, Error = E>,
    CS: OutputPin,
    RESET: OutputPin,
{
    loop {
        if shutdown.requested() {
            return;
        }

        if let Err(e) = link.poll_receive_async(&now_ms).await {
            defmt::warn!("poll_receive error: {}", e);
        }
        if let Some(value) = link.last_telemetry() {
            let value = value.clone();
            last_telemetry.lock(|cell| *cell.borrow_mut() = Some(value));
        }

        link.maybe_send_heartbeat_async(&now_ms).await;

        if let Ok(text) = command_rx.try_receive() {
            let _ = link.send_command_async(&text, &now_ms).await;
        }

        Timer::after(Duration::from_millis(5)).await;
    }
}

/// Status/housekeeping task, spec.md §4.6. No watchdog kick is
/// implemented here — a host integrator owns the actual watchdog
/// peripheral; this only logs liveness and observes shutdown.
pub async fn housekeeping(period: Duration, shutdown: &Shutdown) {
    loop {
        if shutdown.requested() {
            return;
        }
        defmt::debug!("housekeeping tick at {}", now_ms());
        Timer::after(period).await;
    }
}
