//! Wire frame encoding/decoding. Pure value type, no I/O.

extern crate alloc;
use alloc::vec::Vec;

use crate::modem::SignalReport;

/// Address 255 is reserved for broadcast, spec.md §3.
pub const BROADCAST_ADDR: u8 = 255;

/// One on-air LoRa frame: a 3-byte header (`addr_from`, `addr_to`,
/// `checksum`) followed by an opaque payload, total length <= 255
/// bytes. `rssi`/`snr` are metadata attached only on decode of a
/// received frame; they are never part of the wire format.
#[derive(Clone, PartialEq, Debug, defmt::Format)]
pub struct Packet {
    pub addr_from: u8,
    pub addr_to: u8,
    pub checksum: u8,
    pub payload: Vec<u8>,
    pub rssi_dbm: Option<f32>,
    pub snr_db: Option<f32>,
}

impl Packet {
    /// Build a new frame, computing the checksum from `payload`.
    pub fn new(addr_from: u8, addr_to: u8, payload: Vec<u8>) -> Self {
        let checksum = Self::checksum(&payload);
        Packet {
            addr_from,
            addr_to,
            checksum,
            payload,
            rssi_dbm: None,
            snr_db: None,
        }
    }

    /// `[addr_from, addr_to, checksum] ++ payload`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.payload.len());
        out.push(self.addr_from);
        out.push(self.addr_to);
        out.push(self.checksum);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a received byte slice. Requires `len >= 3`; does **not**
    /// validate the checksum (callers must call
    /// [`Packet::valid_checksum`] before trusting the payload).
    pub fn decode(bytes: &[u8], signal: Option<SignalReport>) -> Option<Self> {
        if bytes.len() < 3 {
            return None;
        }
        Some(Packet {
            addr_from: bytes[0],
            addr_to: bytes[1],
            checksum: bytes[2],
            payload: bytes[3..].to_vec(),
            rssi_dbm: signal.map(|s| s.rssi_dbm),
            snr_db: signal.map(|s| s.snr_db),
        })
    }

    /// Recompute the checksum over `self.payload` and compare against
    /// the stored header checksum.
    pub fn valid_checksum(&self) -> bool {
        self.checksum == Self::checksum(&self.payload)
    }

    /// Sum of payload bytes, modulo 256.
    pub fn checksum(payload: &[u8]) -> u8 {
        payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
    }
}
