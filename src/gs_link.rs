//! The ground-station-side protocol state machine, spec.md §4.5.

extern crate alloc;
use alloc::boxed::Box;

use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;
use serde_json::Value;

use crate::config::GsLinkConfig;
use crate::error::LinkError;
use crate::modem::{Mode, Modem};
use crate::packet::{Packet, BROADCAST_ADDR};
use crate::reassembly::Reassembler;
use crate::registers::IrqFlags;
use crate::telemetry;

pub struct GsLink<SPI, CS, RESET> {
    modem: Modem<SPI, CS, RESET>,
    config: GsLinkConfig,
    peer_address: Option<u8>,
    reassembler: Reassembler,
    last_telemetry: Option<Value>,
    last_heartbeat_tick: u32,
    on_telemetry: Option<Box<dyn FnMut(&Value) + Send>>,
    on_command_response: Option<Box<dyn FnMut(&str) + Send>>,
}

impl<SPI, CS, RESET, E> GsLink<SPI, CS, RESET>
where
    SPI: SpiBus<u8, Error = E>,
    CS: OutputPin,
    RESET: OutputPin,
{
    pub fn new(modem: Modem<SPI, CS, RESET>, config: GsLinkConfig) -> Self {
        GsLink {
            modem,
            config,
            peer_address: None,
            reassembler: Reassembler::new(),
            last_telemetry: None,
            last_heartbeat_tick: 0,
            on_telemetry: None,
            on_command_response: None,
        }
    }

    pub fn on_telemetry(&mut self, cb: Box<dyn FnMut(&Value) + Send>) {
        self.on_telemetry = Some(cb);
    }

    pub fn on_command_response(&mut self, cb: Box<dyn FnMut(&str) + Send>) {
        self.on_command_response = Some(cb);
    }

    pub fn last_telemetry(&self) -> Option<&Value> {
        self.last_telemetry.as_ref()
    }

    pub fn set_tx_power(&mut self, dbm: i8) -> Result<(), LinkError> {
        Ok(self.modem.set_tx_power(dbm)?)
    }

    pub fn set_heartbeat_enabled(&mut self, enabled: bool) {
        self.config.heartbeat_enabled = enabled;
    }

    pub fn peer_address(&self) -> Option<u8> {
        self.peer_address
    }

    /// Seed the peer address without waiting for an inbound frame —
    /// useful for fixed one-satellite deployments that know the SAT's
    /// `device_id` ahead of time.
    pub fn set_peer_address(&mut self, addr: u8) {
        self.peer_address = Some(addr);
    }

    /// Transmit `CMD:<text>\r\n` to the current peer (spec.md §4.5).
    /// Returns `true` once `TX_DONE` is observed; `false` on timeout or
    /// if no peer address has been learned yet. Never retries.
    pub fn send_command(
        &mut self,
        text: &str,
        now_ms: &impl Fn() -> u32,
        delay_ms: &mut impl FnMut(u32),
    ) -> bool {
        let Some(target) = self.peer_address else {
            defmt::warn!("send_command with no known peer address yet");
            return false;
        };
        self.send_command_to(target, text, now_ms, delay_ms)
    }

    fn send_command_to(
        &mut self,
        target: u8,
        text: &str,
        now_ms: &impl Fn() -> u32,
        delay_ms: &mut impl FnMut(u32),
    ) -> bool {
        let payload = alloc::format!("CMD:{text}\r\n");
        let result = (|| -> Result<(), LinkError> {
            self.modem.set_mode(Mode::Standby)?;
            let frame =
                Packet::new(self.config.device_id, target, payload.into_bytes()).encode();
            self.modem.send(&frame)?;
            let observed =
                self.modem
                    .wait_flag(IrqFlags::TX_DONE, 5_000, now_ms, delay_ms)?;
            self.modem.clear_irq()?;
            self.modem.set_mode(Mode::Standby)?;
            if observed {
                Ok(())
            } else {
                Err(LinkError::Modem(crate::error::ModemError::Timeout))
            }
        })();
        result.is_ok()
    }

    /// Emit `CMD:PING` if the heartbeat is enabled and
    /// `transmit_interval_ms` has elapsed since the last one, spec.md
    /// §4.5. Call periodically from the Pump/Housekeeping loop.
    pub fn maybe_send_heartbeat(
        &mut self,
        now_ms: &impl Fn() -> u32,
        delay_ms: &mut impl FnMut(u32),
    ) {
        if !self.config.heartbeat_enabled {
            return;
        }
        let Some(target) = self.peer_address else {
            return;
        };
        let now = now_ms();
        if now.wrapping_sub(self.last_heartbeat_tick) < self.config.transmit_interval_ms {
            return;
        }
        self.last_heartbeat_tick = now;
        let _ = self.send_command_to(target, "PING", now_ms, delay_ms);
    }

    /// One pass of the receive loop, spec.md §4.5: non-blocking poll
    /// for an inbound frame, classify it, ACK telemetry parts, and
    /// invoke the relevant callback.
    pub fn poll_receive(
        &mut self,
        now_ms: &impl Fn() -> u32,
        delay_ms: &mut impl FnMut(u32),
    ) -> Result<(), LinkError> {
        self.reassembler
            .evict_stale(now_ms(), crate::config::DEFAULT_REASSEMBLY_TIMEOUT_MS);

        self.modem.set_mode(Mode::RxContinuous)?;
        let mut buf = [0u8; 255];
        let Some((len, signal)) = self.modem.recv(&mut buf)? else {
            return Ok(());
        };
        let Some(pkt) = Packet::decode(&buf[..len], Some(signal)) else {
            return Ok(());
        };
        if !pkt.valid_checksum() {
            defmt::warn!("dropped frame with bad checksum");
            return Ok(());
        }
        if pkt.addr_to != self.config.device_id && pkt.addr_to != BROADCAST_ADDR {
            return Ok(());
        }
        self.peer_address = Some(pkt.addr_from);

        let Ok(text) = core::str::from_utf8(&pkt.payload) else {
            return Ok(());
        };
        let trimmed = text.trim_end_matches(['\r', '\n']);

        if let Some(response) = trimmed.strip_prefix("CMD:") {
            if let Some(cb) = self.on_command_response.as_mut() {
                cb(response);
            }
            return Ok(());
        }

        if trimmed.starts_with('{') {
            return self.handle_telemetry_frame(pkt.addr_from, trimmed, now_ms, delay_ms);
        }

        // Anything else: treated as an opaque command response,
        // spec.md §4.5 "Anything else -> treat as opaque command
        // response".
        if let Some(cb) = self.on_command_response.as_mut() {
            cb(trimmed);
        }
        Ok(())
    }

    fn handle_telemetry_frame(
        &mut self,
        sender: u8,
        json_text: &str,
        now_ms: &impl Fn() -> u32,
        delay_ms: &mut impl FnMut(u32),
    ) -> Result<(), LinkError> {
        let value: Value = match serde_json::from_str(json_text) {
            Ok(v) => v,
            Err(_) => {
                defmt::warn!("dropped frame: malformed JSON telemetry");
                return Ok(());
            }
        };

        if telemetry::is_multipart_wrapper(&value) {
            let wrapper: telemetry::MultipartWrapper = match serde_json::from_value(value) {
                Ok(w) => w,
                Err(_) => {
                    defmt::warn!("dropped frame: malformed multipart wrapper");
                    return Ok(());
                }
            };
            let part = wrapper.part;
            match self.reassembler.feed(sender, &wrapper, now_ms()) {
                Ok(None) => {
                    self.send_ack(sender, part, now_ms, delay_ms);
                }
                Ok(Some(joined)) => {
                    self.send_ack(sender, part, now_ms, delay_ms);
                    match serde_json::from_str::<Value>(&joined) {
                        Ok(obj) => self.deliver_telemetry(obj),
                        Err(_) => defmt::warn!("reassembled payload is not valid JSON"),
                    }
                }
                Err(_) => defmt::warn!("dropped malformed multipart wrapper"),
            }
        } else {
            self.send_ack(sender, 0, now_ms, delay_ms);
            self.deliver_telemetry(value);
        }
        Ok(())
    }

    fn deliver_telemetry(&mut self, value: Value) {
        self.last_telemetry = Some(value.clone());
        if let Some(cb) = self.on_telemetry.as_mut() {
            cb(&value);
        }
    }

    fn send_ack(
        &mut self,
        target: u8,
        part: u8,
        now_ms: &impl Fn() -> u32,
        delay_ms: &mut impl FnMut(u32),
    ) {
        let text = alloc::format!("ACK:{part}");
        let _ = self.send_command_to_raw(target, &text, now_ms, delay_ms);
    }

    /// Like [`Self::send_command_to`] but without the `CMD:` tag, used
    /// for `ACK:<n>` frames which are their own payload tag.
    fn send_command_to_raw(
        &mut self,
        target: u8,
        text: &str,
        now_ms: &impl Fn() -> u32,
        delay_ms: &mut impl FnMut(u32),
    ) -> bool {
        let payload = alloc::format!("{text}\r\n");
        let result = (|| -> Result<(), LinkError> {
            self.modem.set_mode(Mode::Standby)?;
            let frame =
                Packet::new(self.config.device_id, target, payload.into_bytes()).encode();
            self.modem.send(&frame)?;
            let observed =
                self.modem
                    .wait_flag(IrqFlags::TX_DONE, 5_000, now_ms, delay_ms)?;
            self.modem.clear_irq()?;
            self.modem.set_mode(Mode::Standby)?;
            if observed {
                Ok(())
            } else {
                Err(LinkError::Modem(crate::error::ModemError::Timeout))
            }
        })();
        result.is_ok()
    }

    /// Cooperative counterpart to [`Self::send_command`] for the
    /// `runtime` Pump task: the TX_DONE wait is a real `.await` on
    /// `embassy_time::Timer` instead of a spun/blocked `delay_ms`,
    /// addressing spec.md §5's "every wait ... yields at least every
    /// few ms".
    #[cfg(feature = "runtime")]
    pub async fn send_command_async(&mut self, text: &str, now_ms: &impl Fn() -> u32) -> bool {
        let Some(target) = self.peer_address else {
            defmt::warn!("send_command with no known peer address yet");
            return false;
        };
        self.send_command_to_async(target, text, now_ms).await
    }

    #[cfg(feature = "runtime")]
    async fn send_command_to_async(
        &mut self,
        target: u8,
        text: &str,
        now_ms: &impl Fn() -> u32,
    ) -> bool {
        let payload = alloc::format!("CMD:{text}\r\n");
        self.send_raw_and_wait_tx_done_async(target, payload, now_ms).await
    }

    #[cfg(feature = "runtime")]
    async fn send_raw_and_wait_tx_done_async(
        &mut self,
        target: u8,
        payload: alloc::string::String,
        now_ms: &impl Fn() -> u32,
    ) -> bool {
        self.send_raw_and_wait_tx_done_inner_async(target, payload, now_ms)
            .await
            .is_ok()
    }

    #[cfg(feature = "runtime")]
    async fn send_raw_and_wait_tx_done_inner_async(
        &mut self,
        target: u8,
        payload: alloc::string::String,
        now_ms: &impl Fn() -> u32,
    ) -> Result<(), LinkError> {
        self.modem.set_mode(Mode::Standby)?;
        let frame = Packet::new(self.config.device_id, target, payload.into_bytes()).encode();
        self.modem.send(&frame)?;
        let observed = self
            .modem
            .wait_flag_cooperative(IrqFlags::TX_DONE, 5_000, now_ms)
            .await?;
        self.modem.clear_irq()?;
        self.modem.set_mode(Mode::Standby)?;
        if observed {
            Ok(())
        } else {
            Err(LinkError::Modem(crate::error::ModemError::Timeout))
        }
    }

    /// Cooperative counterpart to [`Self::maybe_send_heartbeat`].
    #[cfg(feature = "runtime")]
    pub async fn maybe_send_heartbeat_async(&mut self, now_ms: &impl Fn() -> u32) {
        if !self.config.heartbeat_enabled {
            return;
        }
        let Some(target) = self.peer_address else {
            return;
        };
        let now = now_ms();
        if now.wrapping_sub(self.last_heartbeat_tick) < self.config.transmit_interval_ms {
            return;
        }
        self.last_heartbeat_tick = now;
        let _ = self.send_command_to_async(target, "PING", now_ms).await;
    }

    /// Cooperative counterpart to [`Self::poll_receive`].
    #[cfg(feature = "runtime")]
    pub async fn poll_receive_async(&mut self, now_ms: &impl Fn() -> u32) -> Result<(), LinkError> {
        self.reassembler
            .evict_stale(now_ms(), crate::config::DEFAULT_REASSEMBLY_TIMEOUT_MS);

        self.modem.set_mode(Mode::RxContinuous)?;
        let mut buf = [0u8; 255];
        let Some((len, signal)) = self.modem.recv(&mut buf)? else {
            return Ok(());
        };
        let Some(pkt) = Packet::decode(&buf[..len], Some(signal)) else {
            return Ok(());
        };
        if !pkt.valid_checksum() {
            defmt::warn!("dropped frame with bad checksum");
            return Ok(());
        }
        if pkt.addr_to != self.config.device_id && pkt.addr_to != BROADCAST_ADDR {
            return Ok(());
        }
        self.peer_address = Some(pkt.addr_from);

        let Ok(text) = core::str::from_utf8(&pkt.payload) else {
            return Ok(());
        };
        let trimmed = text.trim_end_matches(['\r', '\n']);

        if let Some(response) = trimmed.strip_prefix("CMD:") {
            if let Some(cb) = self.on_command_response.as_mut() {
                cb(response);
            }
            return Ok(());
        }

        if trimmed.starts_with('{') {
            return self
                .handle_telemetry_frame_async(pkt.addr_from, trimmed, now_ms)
                .await;
        }

        if let Some(cb) = self.on_command_response.as_mut() {
            cb(trimmed);
        }
        Ok(())
    }

    #[cfg(feature = "runtime")]
    async fn handle_telemetry_frame_async(
        &mut self,
        sender: u8,
        json_text: &str,
        now_ms: &impl Fn() -> u32,
    ) -> Result<(), LinkError> {
        let value: Value = match serde_json::from_str(json_text) {
            Ok(v) => v,
            Err(_) => {
                defmt::warn!("dropped frame: malformed JSON telemetry");
                return Ok(());
            }
        };

        if telemetry::is_multipart_wrapper(&value) {
            let wrapper: telemetry::MultipartWrapper = match serde_json::from_value(value) {
                Ok(w) => w,
                Err(_) => {
                    defmt::warn!("dropped frame: malformed multipart wrapper");
                    return Ok(());
                }
            };
            let part = wrapper.part;
            match self.reassembler.feed(sender, &wrapper, now_ms()) {
                Ok(None) => {
                    self.send_ack_async(sender, part, now_ms).await;
                }
                Ok(Some(joined)) => {
                    self.send_ack_async(sender, part, now_ms).await;
                    match serde_json::from_str::<Value>(&joined) {
                        Ok(obj) => self.deliver_telemetry(obj),
                        Err(_) => defmt::warn!("reassembled payload is not valid JSON"),
                    }
                }
                Err(_) => defmt::warn!("dropped malformed multipart wrapper"),
            }
        } else {
            self.send_ack_async(sender, 0, now_ms).await;
            self.deliver_telemetry(value);
        }
        Ok(())
    }

    #[cfg(feature = "runtime")]
    async fn send_ack_async(&mut self, target: u8, part: u8, now_ms: &impl Fn() -> u32) {
        let text = alloc::format!("ACK:{part}");
        let _ = self
            .send_raw_and_wait_tx_done_async(target, alloc::format!("{text}\r\n"), now_ms)
            .await;
    }
}

/// A register-file-only test double, same shape as `modem.rs`'s own
/// (and `tests/link_integration.rs`'s), reused here rather than shared
/// across files since each is small and the three have slightly
/// different needs (this one counts TX attempts instead of modelling
/// an `Ether`).
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GsLinkConfig;
    use crate::modem::ModemConfig;
    use embedded_hal::digital::ErrorType as PinErrorType;
    use embedded_hal::spi::ErrorType as SpiErrorType;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    const REG_OP_MODE: u8 = 0x01;
    const REG_IRQ_FLAGS: u8 = 0x12;
    const MODE_TX: u8 = 0b011;
    const IRQ_TX_DONE: u8 = 0b0000_1000;

    #[derive(Default)]
    struct RegisterFile {
        regs: [u8; 128],
        tx_count: u32,
    }

    struct MockBus {
        regs: Rc<RefCell<RegisterFile>>,
    }

    impl SpiErrorType for MockBus {
        type Error = core::convert::Infallible;
    }

    impl SpiBus<u8> for MockBus {
        fn read(&mut self, _words: &mut [u8]) -> Result<(), Self::Error> {
            Ok(())
        }

        fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
            if words.len() == 2 {
                let addr = words[0] & 0x7f;
                let mut rf = self.regs.borrow_mut();
                rf.regs[addr as usize] = words[1];
                if addr == REG_OP_MODE && words[1] & 0b111 == MODE_TX {
                    rf.tx_count += 1;
                    rf.regs[REG_IRQ_FLAGS as usize] |= IRQ_TX_DONE;
                }
            }
            Ok(())
        }

        fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
            if write.len() == 2 && read.len() >= 2 {
                let addr = write[0] & 0x7f;
                read[1] = self.regs.borrow().regs[addr as usize];
            }
            Ok(())
        }

        fn transfer_in_place(&mut self, _words: &mut [u8]) -> Result<(), Self::Error> {
            Ok(())
        }

        fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    struct NoopPin;

    impl PinErrorType for NoopPin {
        type Error = core::convert::Infallible;
    }

    impl OutputPin for NoopPin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
        fn set_high(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    fn new_gs(
        heartbeat_enabled: bool,
        transmit_interval_ms: u32,
    ) -> (GsLink<MockBus, NoopPin, NoopPin>, Rc<RefCell<RegisterFile>>) {
        let regs = Rc::new(RefCell::new(RegisterFile::default()));
        let modem = Modem::init(
            MockBus { regs: regs.clone() },
            NoopPin,
            NoopPin,
            ModemConfig::default(),
            |_| {},
        )
        .expect("mock modem init");
        let config = GsLinkConfig {
            device_id: 2,
            transmit_interval_ms,
            heartbeat_enabled,
        };
        (GsLink::new(modem, config), regs)
    }

    #[test]
    fn heartbeat_disabled_never_sends() {
        let (mut gs, regs) = new_gs(false, 1_000);
        gs.set_peer_address(7);
        let clock = Cell::new(10_000u32);
        gs.maybe_send_heartbeat(&|| clock.get(), &mut |ms| clock.set(clock.get() + ms));
        assert_eq!(regs.borrow().tx_count, 0);
    }

    #[test]
    fn heartbeat_with_no_known_peer_never_sends() {
        let (mut gs, regs) = new_gs(true, 1_000);
        let clock = Cell::new(10_000u32);
        gs.maybe_send_heartbeat(&|| clock.get(), &mut |ms| clock.set(clock.get() + ms));
        assert_eq!(regs.borrow().tx_count, 0);
    }

    #[test]
    fn heartbeat_fires_once_the_interval_has_elapsed() {
        let (mut gs, regs) = new_gs(true, 1_000);
        gs.set_peer_address(7);
        let clock = Cell::new(1_000u32);
        gs.maybe_send_heartbeat(&|| clock.get(), &mut |ms| clock.set(clock.get() + ms));
        assert_eq!(regs.borrow().tx_count, 1);
    }

    #[test]
    fn heartbeat_is_gated_until_the_interval_elapses_again() {
        let (mut gs, regs) = new_gs(true, 1_000);
        gs.set_peer_address(7);
        let clock = Cell::new(1_000u32);
        let now_ms = || clock.get();
        let mut delay_ms = |ms: u32| clock.set(clock.get() + ms);

        gs.maybe_send_heartbeat(&now_ms, &mut delay_ms);
        assert_eq!(regs.borrow().tx_count, 1);

        // Only 500ms later: still inside the 1000ms interval.
        clock.set(clock.get() + 500);
        gs.maybe_send_heartbeat(&now_ms, &mut delay_ms);
        assert_eq!(regs.borrow().tx_count, 1, "should not re-fire before the interval elapses");

        // Past the interval: fires again.
        clock.set(clock.get() + 1_000);
        gs.maybe_send_heartbeat(&now_ms, &mut delay_ms);
        assert_eq!(regs.borrow().tx_count, 2);
    }
}
