//! Half-duplex LoRa link protocol between a satellite node and a
//! ground-station node over an SX127x-family modem.
//!
//! The crate core is `no_std` (it only needs `alloc` for dynamic JSON
//! telemetry and formatted command text); a host program provides the
//! `embedded_hal` SPI/GPIO concretes, the cooperative scheduler (see
//! [`runtime`], `std`/`runtime`-gated), and any persistence.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

#[cfg(feature = "alloc-embedded")]
mod allocator {
    use embedded_alloc::LlffHeap as Heap;

    #[global_allocator]
    static HEAP: Heap = Heap::empty();

    /// Initialize the global allocator over `[start, start + size)`.
    /// Call once at boot before any telemetry is built, on targets
    /// without their own global allocator (see `runtime`'s embassy
    /// usage, mirroring `rtxm-rust-nrf24l01`'s `embassy_rp` setup).
    ///
    /// # Safety
    /// `start` must point to `size` bytes of memory not used by
    /// anything else for the remainder of the program.
    pub unsafe fn init(start: usize, size: usize) {
        HEAP.init(start, size)
    }
}

#[cfg(feature = "alloc-embedded")]
pub use allocator::init as init_heap;

pub mod config;
pub mod dispatch;
pub mod error;
pub mod gs_link;
pub mod host_cli;
pub mod modem;
pub mod packet;
pub mod persist;
pub mod reassembly;
mod registers;
pub mod sat_link;
pub mod telemetry;

#[cfg(feature = "runtime")]
pub mod runtime;

pub use config::{GsLinkConfig, SatLinkConfig};
pub use error::{LinkError, ModemError};
pub use gs_link::GsLink;
pub use modem::{Modem, ModemConfig};
pub use packet::{Packet, BROADCAST_ADDR};
pub use registers::ModemPreset;
pub use sat_link::{SatLink, SendResult};
