//! Link-level configuration structs, spec.md §4.1/§4.4/§4.5/§6.
//!
//! These carry constructor parameters with the stated defaults; there
//! is no file-based configuration format to parse (the source reads no
//! config files beyond the `/RMT_RESET` marker, handled by
//! [`crate::persist::ResetMarker`]), matching the teacher's plain
//! `RadioConfig`-struct style rather than a TOML/env layer.

extern crate alloc;
use alloc::boxed::Box;

/// Deadline for a single telemetry part's `ACK:<p>`, spec.md §4.4.
pub const ACK_DEADLINE_MS: u32 = 5_000;
/// Minimum cooperative delay between multipart sends, spec.md §4.4.
pub const INTER_PART_DELAY_MS: u32 = 50;
/// Reserved wrapper overhead subtracted from `max_frame_payload` when
/// computing the fragmentation chunk size, spec.md §4.4.
pub const WRAPPER_OVERHEAD_BYTES: usize = 50;
/// Default `max_frame_payload`, spec.md §4.4/§8 (S2/S3 examples).
pub const DEFAULT_MAX_FRAME_PAYLOAD: usize = 200;
/// Default GS heartbeat cadence, spec.md §4.5.
pub const DEFAULT_TRANSMIT_INTERVAL_MS: u32 = 1_000;
/// Recommended reassembly eviction timeout, spec.md §3 ("implementer-
/// chosen but >= 30s recommended").
pub const DEFAULT_REASSEMBLY_TIMEOUT_MS: u32 = 30_000;

/// Construction parameters for a [`crate::sat_link::SatLink`].
pub struct SatLinkConfig {
    pub device_id: u8,
    pub max_frame_payload: usize,
    pub beacon_interval_ms: u32,
    /// Invoked after the 1s RESET delay; the crate cannot itself reset
    /// a host CPU (spec.md §9 supplement, §4.4).
    pub on_hardware_reset: Box<dyn FnMut() + Send>,
}

impl SatLinkConfig {
    pub fn new(device_id: u8, on_hardware_reset: Box<dyn FnMut() + Send>) -> Self {
        SatLinkConfig {
            device_id,
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
            beacon_interval_ms: DEFAULT_TRANSMIT_INTERVAL_MS,
            on_hardware_reset,
        }
    }
}

/// Construction parameters for a [`crate::gs_link::GsLink`].
#[derive(Clone, Copy, Debug)]
pub struct GsLinkConfig {
    pub device_id: u8,
    pub transmit_interval_ms: u32,
    pub heartbeat_enabled: bool,
}

impl GsLinkConfig {
    pub fn new(device_id: u8) -> Self {
        GsLinkConfig {
            device_id,
            transmit_interval_ms: DEFAULT_TRANSMIT_INTERVAL_MS,
            heartbeat_enabled: false,
        }
    }
}
