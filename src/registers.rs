//! SX127x register map and IRQ/op-mode bit layout.
//!
//! Addresses and bit positions are grounded on the satellite-side RFM9x
//! driver (`rfm9x.py`) and cross-checked against the `sx127x_lora` /
//! `hdds-team-hdds` register tables retrieved alongside this crate.
//! Register addresses per Semtech SX1276/77/78/79 datasheet.

#![allow(dead_code)]

/// SPI write bit: set on the address byte to turn a transaction into a
/// register write rather than a read.
pub(crate) const WRITE_BIT: u8 = 0x80;

pub(crate) const REG_FIFO: u8 = 0x00;
pub(crate) const REG_OP_MODE: u8 = 0x01;
pub(crate) const REG_FRF_MSB: u8 = 0x06;
pub(crate) const REG_FRF_MID: u8 = 0x07;
pub(crate) const REG_FRF_LSB: u8 = 0x08;
pub(crate) const REG_PA_CONFIG: u8 = 0x09;
pub(crate) const REG_FIFO_ADDR_PTR: u8 = 0x0d;
pub(crate) const REG_FIFO_TX_BASE_ADDR: u8 = 0x0e;
pub(crate) const REG_FIFO_RX_BASE_ADDR: u8 = 0x0f;
pub(crate) const REG_FIFO_RX_CURRENT_ADDR: u8 = 0x10;
pub(crate) const REG_IRQ_FLAGS: u8 = 0x12;
pub(crate) const REG_RX_NB_BYTES: u8 = 0x13;
pub(crate) const REG_PKT_SNR_VALUE: u8 = 0x19;
pub(crate) const REG_PKT_RSSI_VALUE: u8 = 0x1a;
pub(crate) const REG_MODEM_CONFIG1: u8 = 0x1d;
pub(crate) const REG_MODEM_CONFIG2: u8 = 0x1e;
pub(crate) const REG_PREAMBLE_MSB: u8 = 0x20;
pub(crate) const REG_PREAMBLE_LSB: u8 = 0x21;
pub(crate) const REG_PAYLOAD_LENGTH: u8 = 0x22;
pub(crate) const REG_MODEM_CONFIG3: u8 = 0x26;
pub(crate) const REG_VERSION: u8 = 0x42;
pub(crate) const REG_PA_DAC: u8 = 0x4d;

/// `RegOpMode` mode bits (low 3 bits of the register).
pub(crate) const MODE_SLEEP: u8 = 0b000;
pub(crate) const MODE_STDBY: u8 = 0b001;
pub(crate) const MODE_TX: u8 = 0b011;
pub(crate) const MODE_RX_CONTINUOUS: u8 = 0b101;
pub(crate) const MODE_CAD: u8 = 0b111;
/// Bit 7 of `RegOpMode`: 1 selects LoRa mode over FSK/OOK.
pub(crate) const LONG_RANGE_MODE: u8 = 0x80;

pub(crate) const PA_SELECT: u8 = 0x80;
pub(crate) const PA_DAC_ENABLE: u8 = 0x87;
pub(crate) const PA_DAC_DISABLE: u8 = 0x84;

bitflags::bitflags! {
    /// `RegIrqFlags` (0x12). Bit positions per SX127x datasheet table
    /// 6.4. A write of `1` to a bit clears that flag.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
    pub struct IrqFlags: u8 {
        const CAD_DETECTED   = 0b0000_0001;
        const FHSS_CHANGE    = 0b0000_0010;
        const CAD_DONE       = 0b0000_0100;
        const TX_DONE        = 0b0000_1000;
        const VALID_HEADER   = 0b0001_0000;
        const PAYLOAD_CRC_ERR = 0b0010_0000;
        const RX_DONE        = 0b0100_0000;
        const RX_TIMEOUT     = 0b1000_0000;
    }
}

/// `RegModemConfig1`/2/3 triplets for the presets named in spec.md §6.
/// Values are bit-exact with `original_source`'s `ModemConfig` tuples
/// (in turn RadioHead-library-compatible).
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub struct ModemConfigBits(pub u8, pub u8, pub u8);

/// Named bandwidth/coding-rate/spreading-factor presets a caller can
/// select instead of hand-assembling [`ModemConfigBits`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum ModemPreset {
    /// 125 kHz, 4/5, 128 chips/symbol. Default: medium range.
    Bw125Cr45Sf128,
    /// 500 kHz, 4/5, 128 chips/symbol. Fast, short range.
    Bw500Cr45Sf128,
    /// 31.25 kHz, 4/8, 512 chips/symbol. Slow, long range.
    Bw31_25Cr48Sf512,
    /// 125 kHz, 4/8, 4096 chips/symbol. Slowest, longest range.
    Bw125Cr48Sf4096,
    /// 125 kHz, 4/5, 2048 chips/symbol.
    Bw125Cr45Sf2048,
}

impl Default for ModemPreset {
    fn default() -> Self {
        ModemPreset::Bw125Cr45Sf128
    }
}

impl ModemPreset {
    pub const fn bits(self) -> ModemConfigBits {
        match self {
            ModemPreset::Bw125Cr45Sf128 => ModemConfigBits(0x72, 0x74, 0x04),
            ModemPreset::Bw500Cr45Sf128 => ModemConfigBits(0x92, 0x74, 0x04),
            ModemPreset::Bw31_25Cr48Sf512 => ModemConfigBits(0x48, 0x94, 0x04),
            ModemPreset::Bw125Cr48Sf4096 => ModemConfigBits(0x78, 0xc4, 0x0c),
            ModemPreset::Bw125Cr45Sf2048 => ModemConfigBits(0x72, 0xb4, 0x04),
        }
    }
}

/// Frequency step in Hz: `F_XOSC / 2^19`, per SX127x datasheet section
/// 4.1.4 (`F_XOSC = 32 MHz`).
pub(crate) const FREQ_STEP_HZ: f64 = 32_000_000.0 / 524_288.0;
