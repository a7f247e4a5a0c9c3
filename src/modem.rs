//! Register-level SX127x driver.
//!
//! `Modem` is generic over `embedded_hal`'s `SpiBus`/`OutputPin`
//! traits (it toggles chip-select by hand around every register
//! access, the way `sx127x_lora`-style drivers in this ecosystem do,
//! rather than delegating CS to a managed `SpiDevice`) so it can be
//! instantiated over real hardware or a test double with the same
//! code path.

use embedded_hal::{digital::OutputPin, spi::SpiBus};

use crate::error::ModemError;
use crate::registers::*;

/// Power amplifier output range accepted by `set_tx_power`, per spec.md
/// §4.1 (clamped, not rejected).
pub const MIN_TX_POWER_DBM: i8 = 5;
pub const MAX_TX_POWER_DBM: i8 = 23;

/// Radio operating modes the Link layer schedules between. `Sleep` is
/// only used transiently during `init`; normal operation alternates
/// `Standby`, `Tx`, and `RxContinuous`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum Mode {
    Sleep,
    Standby,
    Tx,
    RxContinuous,
    Cad,
}

impl Mode {
    const fn bits(self) -> u8 {
        match self {
            Mode::Sleep => MODE_SLEEP,
            Mode::Standby => MODE_STDBY,
            Mode::Tx => MODE_TX,
            Mode::RxContinuous => MODE_RX_CONTINUOUS,
            Mode::Cad => MODE_CAD,
        }
    }
}

/// A received frame's signal-quality metadata, computed from
/// `PKT_SNR_VALUE`/`PKT_RSSI_VALUE` per spec.md §4.1.
#[derive(Clone, Copy, PartialEq, Debug, defmt::Format)]
pub struct SignalReport {
    pub rssi_dbm: f32,
    pub snr_db: f32,
}

/// Frequency/bandwidth/power configuration applied during `init`.
#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct ModemConfig {
    pub preset: ModemPreset,
    pub freq_mhz: f64,
    pub tx_power_dbm: i8,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            preset: ModemPreset::default(),
            // Default frequency, spec.md §6.
            freq_mhz: 868.0,
            // Default TX power, spec.md §6.
            tx_power_dbm: 14,
        }
    }
}

/// The SX127x driver: owns the SPI device, chip-select, and reset pin,
/// and exposes the synchronous, single-threaded API spec.md §4.1
/// describes. Only one caller (the Link's Pump task) should ever hold
/// `&mut Modem` at a time; that single-ownership discipline is enforced
/// by the caller, not by this type.
pub struct Modem<SPI, CS, RESET> {
    spi: SPI,
    cs: CS,
    reset: RESET,
    mode: Mode,
    freq_mhz: f64,
}

impl<SPI, CS, RESET, E> Modem<SPI, CS, RESET>
where
    SPI: SpiBus<u8, Error = E>,
    CS: OutputPin,
    RESET: OutputPin,
{
    /// Pulse reset, verify the chip is a real SX127x in LoRa mode, and
    /// program FIFO base addresses, modem config, preamble, frequency
    /// and TX power. Per spec.md §4.1: reset low >=100ms then high
    /// >=100ms (the `delay` callback is the caller's chosen sleep, so
    /// this works identically on-target and in a host test).
    pub fn init(
        mut spi: SPI,
        mut cs: CS,
        mut reset: RESET,
        config: ModemConfig,
        mut delay_ms: impl FnMut(u32),
    ) -> Result<Self, ModemError> {
        let _ = cs.set_high();

        let _ = reset.set_low();
        delay_ms(100);
        let _ = reset.set_high();
        delay_ms(100);

        let mut modem = Modem {
            spi,
            cs,
            reset,
            mode: Mode::Sleep,
            freq_mhz: config.freq_mhz,
        };

        let _version = modem.read_reg(REG_VERSION)?;

        modem.write_reg(REG_OP_MODE, MODE_SLEEP)?;
        delay_ms(10);
        modem.write_reg(REG_OP_MODE, MODE_SLEEP | LONG_RANGE_MODE)?;
        delay_ms(10);

        let latched = modem.read_reg(REG_OP_MODE)?;
        if latched != (MODE_SLEEP | LONG_RANGE_MODE) {
            defmt::error!(
                "modem failed LoRa mode latch: got {:#04x}, expected {:#04x}",
                latched,
                MODE_SLEEP | LONG_RANGE_MODE
            );
            return Err(ModemError::Init);
        }
        modem.mode = Mode::Sleep;

        modem.write_reg(REG_FIFO_TX_BASE_ADDR, 0)?;
        modem.write_reg(REG_FIFO_RX_BASE_ADDR, 0)?;

        modem.set_mode(Mode::Standby)?;

        let bits = config.preset.bits();
        modem.write_reg(REG_MODEM_CONFIG1, bits.0)?;
        modem.write_reg(REG_MODEM_CONFIG2, bits.1)?;
        modem.write_reg(REG_MODEM_CONFIG3, bits.2)?;

        // Preamble length 8, spec.md §4.1.
        modem.write_reg(REG_PREAMBLE_MSB, 0)?;
        modem.write_reg(REG_PREAMBLE_LSB, 8)?;

        modem.set_frequency(config.freq_mhz)?;
        modem.set_tx_power(config.tx_power_dbm)?;

        Ok(modem)
    }

    /// Program `RegFrfMsb/Mid/Lsb` from a frequency in MHz.
    /// `frf = round(freq_hz / FSTEP)`, spec.md §4.1.
    fn set_frequency(&mut self, freq_mhz: f64) -> Result<(), ModemError> {
        self.freq_mhz = freq_mhz;
        let frf = (freq_mhz * 1_000_000.0 / FREQ_STEP_HZ).round() as u32;
        self.write_reg(REG_FRF_MSB, ((frf >> 16) & 0xff) as u8)?;
        self.write_reg(REG_FRF_MID, ((frf >> 8) & 0xff) as u8)?;
        self.write_reg(REG_FRF_LSB, (frf & 0xff) as u8)
    }

    /// Set the mode register, but only if it differs from the cached
    /// current mode (spec.md §4.1: idempotent). The caller is
    /// responsible for any preceding state requirement (e.g. must be
    /// `Standby` before `Tx`).
    pub fn set_mode(&mut self, mode: Mode) -> Result<(), ModemError> {
        if self.mode == mode {
            return Ok(());
        }
        self.write_reg(REG_OP_MODE, LONG_RANGE_MODE | mode.bits())?;
        self.mode = mode;
        defmt::debug!("modem mode -> {}", mode);
        Ok(())
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Queue `frame` for transmission. Must be called from `Standby`
    /// (spec.md §4.1); resets the FIFO pointer, writes the bytes,
    /// programs the payload length, and switches to `Tx`. Returns once
    /// the frame is queued — it does not wait for `TX_DONE`.
    pub fn send(&mut self, frame: &[u8]) -> Result<(), ModemError> {
        if frame.len() > 255 {
            return Err(ModemError::FrameTooLong);
        }
        debug_assert_eq!(
            self.mode,
            Mode::Standby,
            "send() called while modem not in Standby"
        );

        self.write_reg(REG_FIFO_ADDR_PTR, 0)?;
        self.write_fifo(frame)?;
        self.write_reg(REG_PAYLOAD_LENGTH, frame.len() as u8)?;
        self.set_mode(Mode::Tx)
    }

    /// Non-blocking: if `RX_DONE` is set, read out the frame, clear IRQ
    /// flags, and compute signal quality. Otherwise returns `None`
    /// immediately (spec.md §4.1 — this never blocks; callers poll it
    /// from their own cooperative loop).
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SignalReport)>, ModemError> {
        let flags = self.irq_flags()?;
        if !flags.contains(IrqFlags::RX_DONE) {
            return Ok(None);
        }

        let len = self.read_reg(REG_RX_NB_BYTES)? as usize;
        let current_addr = self.read_reg(REG_FIFO_RX_CURRENT_ADDR)?;
        self.write_reg(REG_FIFO_ADDR_PTR, current_addr)?;

        let len = len.min(buf.len());
        self.read_fifo(&mut buf[..len])?;
        self.clear_irq()?;

        let report = self.compute_signal_report()?;
        Ok(Some((len, report)))
    }

    fn compute_signal_report(&mut self) -> Result<SignalReport, ModemError> {
        let snr_raw = self.read_reg(REG_PKT_SNR_VALUE)? as i8;
        let snr_db = snr_raw as f32 / 4.0;
        let rssi_raw = self.read_reg(REG_PKT_RSSI_VALUE)? as f32;

        let mut rssi = if snr_db < 0.0 {
            snr_db + rssi_raw
        } else {
            rssi_raw * 16.0 / 15.0
        };
        rssi -= if self.freq_mhz >= 779.0 { 157.0 } else { 164.0 };

        Ok(SignalReport {
            rssi_dbm: rssi,
            snr_db,
        })
    }

    /// One-shot channel-activity detection: switches to `Cad`, waits for
    /// `CAD_DONE` (blocking via `delay_ms`), and returns whether
    /// `CAD_DETECTED` was also set.
    pub fn cad(
        &mut self,
        timeout_ms: u32,
        now_ms: impl Fn() -> u32,
        mut delay_ms: impl FnMut(u32),
    ) -> Result<bool, ModemError> {
        self.set_mode(Mode::Cad)?;
        let detected = self.wait_flag(IrqFlags::CAD_DONE, timeout_ms, &now_ms, &mut delay_ms)?;
        if !detected {
            self.set_mode(Mode::Standby)?;
            return Err(ModemError::Timeout);
        }
        let flags = self.irq_flags()?;
        self.clear_irq()?;
        self.set_mode(Mode::Standby)?;
        Ok(flags.contains(IrqFlags::CAD_DETECTED))
    }

    /// Block (cooperatively, via `delay_ms`, never spinning without
    /// yielding) until `mask` is observed set in `RegIrqFlags` or
    /// `timeout_ms` elapses. Returns `false` on timeout; the caller is
    /// responsible for restoring `Standby` in that case.
    pub fn wait_flag(
        &mut self,
        mask: IrqFlags,
        timeout_ms: u32,
        now_ms: &impl Fn() -> u32,
        delay_ms: &mut impl FnMut(u32),
    ) -> Result<bool, ModemError> {
        let start = now_ms();
        loop {
            if self.irq_flags()?.intersects(mask) {
                return Ok(true);
            }
            if now_ms().wrapping_sub(start) > timeout_ms {
                return Ok(false);
            }
            delay_ms(2);
        }
    }

    /// Cooperative counterpart to [`Self::wait_flag`] for the `runtime`
    /// Pump task: polls on a real `embassy_time::Timer::after(2ms)`
    /// `.await` instead of a caller-supplied `delay_ms`, so the
    /// executor can run sibling tasks (Producer, Housekeeping, the GS's
    /// HTTP reader) between polls rather than spinning the one thread
    /// through the whole wait, per spec.md §5/§4.1.
    #[cfg(feature = "runtime")]
    pub async fn wait_flag_cooperative(
        &mut self,
        mask: IrqFlags,
        timeout_ms: u32,
        now_ms: &impl Fn() -> u32,
    ) -> Result<bool, ModemError> {
        let start = now_ms();
        loop {
            if self.irq_flags()?.intersects(mask) {
                return Ok(true);
            }
            if now_ms().wrapping_sub(start) > timeout_ms {
                return Ok(false);
            }
            embassy_time::Timer::after(embassy_time::Duration::from_millis(2)).await;
        }
    }

    pub fn is_flag_set(&mut self, mask: IrqFlags) -> Result<bool, ModemError> {
        Ok(self.irq_flags()?.intersects(mask))
    }

    pub fn irq_flags(&mut self) -> Result<IrqFlags, ModemError> {
        Ok(IrqFlags::from_bits_truncate(self.read_reg(REG_IRQ_FLAGS)?))
    }

    /// Clear every IRQ flag (writing `1` to each bit clears it).
    pub fn clear_irq(&mut self) -> Result<(), ModemError> {
        self.write_reg(REG_IRQ_FLAGS, 0xff)
    }

    /// Reprogram TX power, clamped to `[5, 23]` dBm. Values below 20 dBm
    /// enable `PA_DAC` boost and the datasheet-mandated `-3` offset,
    /// matching spec.md §4.1 and `original_source`'s `set_tx_power`.
    pub fn set_tx_power(&mut self, dbm: i8) -> Result<(), ModemError> {
        let clamped = dbm.clamp(MIN_TX_POWER_DBM, MAX_TX_POWER_DBM);

        let (dac, output) = if clamped < 20 {
            (PA_DAC_ENABLE, clamped - 3)
        } else {
            (PA_DAC_DISABLE, clamped)
        };
        self.write_reg(REG_PA_DAC, dac)?;
        self.write_reg(REG_PA_CONFIG, PA_SELECT | (output - MIN_TX_POWER_DBM) as u8)
    }

    fn write_reg(&mut self, reg: u8, value: u8) -> Result<(), ModemError> {
        self.cs.set_low().map_err(|_| ModemError::Spi)?;
        let result = self.spi.write(&[reg | WRITE_BIT, value]);
        self.cs.set_high().map_err(|_| ModemError::Spi)?;
        result.map_err(|_| ModemError::Spi)
    }

    fn read_reg(&mut self, reg: u8) -> Result<u8, ModemError> {
        let mut buf = [0u8; 2];
        self.cs.set_low().map_err(|_| ModemError::Spi)?;
        let result = self.spi.transfer(&mut buf, &[reg, 0]);
        self.cs.set_high().map_err(|_| ModemError::Spi)?;
        result.map_err(|_| ModemError::Spi)?;
        Ok(buf[1])
    }

    fn write_fifo(&mut self, data: &[u8]) -> Result<(), ModemError> {
        self.cs.set_low().map_err(|_| ModemError::Spi)?;
        let result = self
            .spi
            .write(&[REG_FIFO | WRITE_BIT])
            .and_then(|_| self.spi.write(data));
        self.cs.set_high().map_err(|_| ModemError::Spi)?;
        result.map_err(|_| ModemError::Spi)
    }

    fn read_fifo(&mut self, out: &mut [u8]) -> Result<(), ModemError> {
        self.cs.set_low().map_err(|_| ModemError::Spi)?;
        let result = self
            .spi
            .write(&[REG_FIFO])
            .and_then(|_| self.spi.read(out));
        self.cs.set_high().map_err(|_| ModemError::Spi)?;
        result.map_err(|_| ModemError::Spi)
    }
}
