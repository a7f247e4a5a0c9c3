//! The satellite-side protocol state machine, spec.md §4.4.

extern crate alloc;
use alloc::boxed::Box;
use alloc::string::{String, ToString};

use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;
use serde_json::Value;

use crate::config::{
    SatLinkConfig, ACK_DEADLINE_MS, INTER_PART_DELAY_MS, WRAPPER_OVERHEAD_BYTES,
};
use crate::dispatch::CommandRegistry;
use crate::error::LinkError;
use crate::modem::{Mode, Modem};
use crate::packet::{Packet, BROADCAST_ADDR};
use crate::persist::ResetMarker;
use crate::registers::IrqFlags;
use crate::telemetry;

/// SAT-side low-power flag, spec.md §3 `SessionState.mode`. Gates
/// nothing in this crate directly; `SatLink::low_power` exposes it for
/// the opaque sensor/LED host code the spec treats as external.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum SessionMode {
    Normal,
    LowPower,
}

/// Outcome of [`SatLink::send_telemetry`].
#[derive(Clone, Copy, PartialEq, Debug, defmt::Format)]
pub enum SendResult {
    /// Every part (or the single frame) was ACKed.
    Ok,
    /// The ACK for part `n` never arrived; remaining parts were not sent.
    AckFailure(u8),
}

pub struct SatLink<SPI, CS, RESET> {
    modem: Modem<SPI, CS, RESET>,
    device_id: u8,
    ground_station_address: Option<u8>,
    mode: SessionMode,
    registry: CommandRegistry,
    config: SatLinkConfig,
    reset_marker: Box<dyn ResetMarker + Send>,
    on_command_received: Option<Box<dyn FnMut(&str, &str) + Send>>,
    next_telemetry_is_first_since_boot: bool,
}

impl<SPI, CS, RESET, E> SatLink<SPI, CS, RESET>
where
    SPI: SpiBus<u8, Error = E>,
    CS: OutputPin,
    RESET: OutputPin,
{
    pub fn new(
        modem: Modem<SPI, CS, RESET>,
        config: SatLinkConfig,
        reset_marker: Box<dyn ResetMarker + Send>,
    ) -> Self {
        SatLink {
            device_id: config.device_id,
            modem,
            ground_station_address: None,
            mode: SessionMode::Normal,
            registry: CommandRegistry::new(),
            config,
            reset_marker,
            on_command_received: None,
            next_telemetry_is_first_since_boot: true,
        }
    }

    pub fn low_power(&self) -> bool {
        self.mode == SessionMode::LowPower
    }

    pub fn set_beacon_interval(&mut self, ms: u32) {
        self.config.beacon_interval_ms = ms;
    }

    pub fn beacon_interval_ms(&self) -> u32 {
        self.config.beacon_interval_ms
    }

    pub fn set_tx_power(&mut self, dbm: i8) -> Result<(), LinkError> {
        Ok(self.modem.set_tx_power(dbm)?)
    }

    pub fn register_command(
        &mut self,
        name: &str,
        handler: crate::dispatch::CommandHandler,
    ) -> Result<(), String> {
        self.registry.register(name, handler)
    }

    pub fn unregister_command(&mut self, name: &str) {
        self.registry.unregister(name);
    }

    pub fn on_command_received(&mut self, cb: Box<dyn FnMut(&str, &str) + Send>) {
        self.on_command_received = Some(cb);
    }

    fn target_addr(&self) -> u8 {
        self.ground_station_address.unwrap_or(BROADCAST_ADDR)
    }

    /// Seed the ground station address without waiting for an inbound
    /// frame — useful for fixed deployments that know the GS's
    /// `device_id` ahead of time.
    pub fn set_ground_station_address(&mut self, addr: u8) {
        self.ground_station_address = Some(addr);
    }

    /// Queue `CMD:RESET_OK` ahead of the next telemetry send if the
    /// reset marker is present from a prior `CMD:RESET`, then clear it
    /// — spec.md §4.4/§6. Call once at boot before the first
    /// [`SatLink::send_telemetry`].
    pub fn boot_check(
        &mut self,
        now_ms: &impl Fn() -> u32,
        delay_ms: &mut impl FnMut(u32),
    ) -> Result<(), LinkError> {
        if self.reset_marker.exists() {
            self.send_command_frame("RESET_OK", now_ms, delay_ms)?;
            self.reset_marker.clear();
        }
        self.next_telemetry_is_first_since_boot = false;
        Ok(())
    }

    /// Serialize, augment with liveness fields, and transmit `obj`,
    /// fragmenting if necessary. Spec.md §4.4 algorithm.
    ///
    /// Fragmentation splits the serialized JSON text on *byte*
    /// offsets, matching the source's plain string slicing; a chunk
    /// can land mid-code-point for non-ASCII content. This is flagged,
    /// not silently changed (spec.md §9) — correctness is preserved
    /// because chunks are only ever re-concatenated and parsed as a
    /// whole, never decoded individually.
    pub fn send_telemetry(
        &mut self,
        obj: Value,
        now_ms: &impl Fn() -> u32,
        delay_ms: &mut impl FnMut(u32),
    ) -> Result<SendResult, LinkError> {
        if self.next_telemetry_is_first_since_boot {
            self.boot_check(now_ms, delay_ms)?;
        }

        let obj = telemetry::with_liveness_fields(obj, now_ms(), self.low_power())?;
        let json_text = obj.to_string();
        let max_payload = self.config.max_frame_payload;

        if json_text.len() <= max_payload {
            self.send_frame_and_wait_ack(json_text.as_bytes(), 0, now_ms, delay_ms)?;
            return Ok(SendResult::Ok);
        }

        let chunk_size = max_payload.saturating_sub(WRAPPER_OVERHEAD_BYTES).max(1);
        let chunks = telemetry::chunk_bytes(&json_text, chunk_size);
        if chunks.len() > crate::reassembly::MAX_PARTS {
            return Err(LinkError::TelemetryTooLarge);
        }
        let total = chunks.len() as u8;

        for (i, chunk) in chunks.iter().enumerate() {
            let part = (i + 1) as u8;
            let mut data: crate::reassembly::Chunk = heapless::String::new();
            data.push_str(chunk).map_err(|_| LinkError::Framing)?;
            let wrapper = telemetry::MultipartWrapper {
                part,
                total,
                data,
            };
            let wrapper_json = serde_json::to_string(&wrapper).map_err(|_| LinkError::Framing)?;

            match self.send_frame_and_wait_ack(wrapper_json.as_bytes(), part, now_ms, delay_ms) {
                Ok(()) => {}
                Err(LinkError::AckFailure(p)) => return Ok(SendResult::AckFailure(p)),
                Err(e) => return Err(e),
            }

            if i + 1 < chunks.len() {
                delay_ms(INTER_PART_DELAY_MS);
            }
        }

        Ok(SendResult::Ok)
    }

    /// Send one frame to the current peer (or broadcast) and block
    /// (cooperatively) for the matching `ACK:<part>` within
    /// [`ACK_DEADLINE_MS`].
    fn send_frame_and_wait_ack(
        &mut self,
        payload: &[u8],
        part: u8,
        now_ms: &impl Fn() -> u32,
        delay_ms: &mut impl FnMut(u32),
    ) -> Result<(), LinkError> {
        let target = self.target_addr();
        self.modem.set_mode(Mode::Standby)?;
        let frame = Packet::new(self.device_id, target, payload.to_vec()).encode();
        self.modem.send(&frame)?;
        self.await_tx_done(now_ms, delay_ms)?;

        self.modem.set_mode(Mode::RxContinuous)?;
        let start = now_ms();
        let expected = alloc::format!("ACK:{part}");
        let mut buf = [0u8; 255];
        loop {
            if let Some((len, signal)) = self.modem.recv(&mut buf)? {
                if let Some(pkt) = Packet::decode(&buf[..len], Some(signal)) {
                    if pkt.valid_checksum() {
                        if pkt.addr_to == self.device_id || pkt.addr_to == BROADCAST_ADDR {
                            if let Ok(text) = core::str::from_utf8(&pkt.payload) {
                                if text.trim_end_matches(['\r', '\n']) == expected {
                                    self.ground_station_address = Some(pkt.addr_from);
                                    self.modem.set_mode(Mode::Standby)?;
                                    return Ok(());
                                }
                            }
                        }
                    } else {
                        defmt::warn!("dropped frame with bad checksum");
                    }
                }
            }
            if now_ms().wrapping_sub(start) > ACK_DEADLINE_MS {
                self.modem.set_mode(Mode::Standby)?;
                return Err(LinkError::AckFailure(part));
            }
            delay_ms(2);
        }
    }

    fn send_command_frame(
        &mut self,
        text: &str,
        now_ms: &impl Fn() -> u32,
        delay_ms: &mut impl FnMut(u32),
    ) -> Result<(), LinkError> {
        let target = self.target_addr();
        let payload = alloc::format!("CMD:{text}\r\n");
        self.modem.set_mode(Mode::Standby)?;
        let frame = Packet::new(self.device_id, target, payload.into_bytes()).encode();
        self.modem.send(&frame)?;
        self.await_tx_done(now_ms, delay_ms)
    }

    /// Block for `TX_DONE` (deadline [`ACK_DEADLINE_MS`]) and restore
    /// `Standby`, converting a timeout into a fatal modem error per
    /// spec.md §4.1 ("wait_flag timeout ... caller ... restore STDBY").
    fn await_tx_done(
        &mut self,
        now_ms: &impl Fn() -> u32,
        delay_ms: &mut impl FnMut(u32),
    ) -> Result<(), LinkError> {
        let observed =
            self.modem
                .wait_flag(IrqFlags::TX_DONE, ACK_DEADLINE_MS, now_ms, delay_ms)?;
        self.modem.clear_irq()?;
        self.modem.set_mode(Mode::Standby)?;
        if !observed {
            return Err(LinkError::Modem(crate::error::ModemError::Timeout));
        }
        Ok(())
    }

    /// One pass of the command-listening window, spec.md §4.4: put the
    /// modem in RX_CONT (if not already there), and if a valid framed
    /// `CMD:` arrived, dispatch it and reply. Returns without blocking
    /// if nothing is pending. Intended to be called repeatedly from
    /// the Pump task between telemetry sends.
    pub fn poll_commands(
        &mut self,
        now_ms: &impl Fn() -> u32,
        delay_ms: &mut impl FnMut(u32),
    ) -> Result<(), LinkError> {
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
        if pkt.addr_to != self.device_id && pkt.addr_to != BROADCAST_ADDR {
            return Ok(());
        }
        let Ok(text) = core::str::from_utf8(&pkt.payload) else {
            return Ok(());
        };
        let trimmed = text.trim_end_matches(['\r', '\n']);
        let Some(cmd_text) = trimmed.strip_prefix("CMD:") else {
            return Ok(());
        };

        self.ground_station_address = Some(pkt.addr_from);
        let reply = self.handle_command(cmd_text, now_ms, delay_ms)?;
        if let Some(reply) = reply {
            self.send_command_frame(&reply, now_ms, delay_ms)?;
        }
        Ok(())
    }

    /// Dispatch one decoded `CMD:` body (builtins first, then the user
    /// registry, then `on_command_received`) and return the reply text
    /// to send, if any.
    fn handle_command(
        &mut self,
        cmd_text: &str,
        now_ms: &impl Fn() -> u32,
        delay_ms: &mut impl FnMut(u32),
    ) -> Result<Option<String>, LinkError> {
        if cmd_text == "PING" {
            return Ok(Some("PONG".to_string()));
        }

        if cmd_text == "RESET" {
            self.reset_marker.create();
            // RESET_ACK must reach the ground before we delay and
            // reboot; the caller's Pump loop resumes after this
            // returns, so the delay happens inline here rather than
            // being deferred to the next poll.
            self.send_command_frame("RESET_ACK", now_ms, delay_ms)?;
            delay_ms(1_000);
            (self.config.on_hardware_reset)();
            return Ok(None);
        }

        if let Some(n_text) = cmd_text.strip_prefix("TXPOW=") {
            return Ok(Some(self.handle_txpow(n_text)));
        }

        if let Some(flag) = cmd_text.strip_prefix("LPM=") {
            return Ok(Some(self.handle_lpm(flag)));
        }

        // Anything left over is `<name> <args>` (args may be empty):
        // first to a registered handler, otherwise to the catch-all.
        let (name, args) = cmd_text.split_once(' ').unwrap_or((cmd_text, ""));
        if let Some(response) = self.registry.dispatch(name, args) {
            return Ok(Some(response.as_str().to_string()));
        }

        if let Some(cb) = self.on_command_received.as_mut() {
            cb(name, args);
        }
        Ok(None)
    }

    fn handle_txpow(&mut self, n_text: &str) -> String {
        match n_text.trim().parse::<i8>() {
            Ok(n) if (crate::modem::MIN_TX_POWER_DBM..=crate::modem::MAX_TX_POWER_DBM)
                .contains(&n) =>
            {
                let _ = self.modem.set_tx_power(n);
                alloc::format!("TX power set to {n}dBm")
            }
            Ok(_) => alloc::format!(
                "TX power must be between {} and {}dBm",
                crate::modem::MIN_TX_POWER_DBM,
                crate::modem::MAX_TX_POWER_DBM
            ),
            Err(_) => "TXPOW requires an integer argument".to_string(),
        }
    }

    fn handle_lpm(&mut self, flag: &str) -> String {
        match flag.trim() {
            "1" => {
                self.mode = SessionMode::LowPower;
                "low-power mode enabled".to_string()
            }
            "0" => {
                self.mode = SessionMode::Normal;
                "low-power mode disabled".to_string()
            }
            _ => "LPM requires 0 or 1".to_string(),
        }
    }

    /// Cooperative counterpart to [`Self::boot_check`] for the Pump
    /// task: identical logic, but every wait is a real `.await` on
    /// `embassy_time::Timer` rather than a caller-supplied `delay_ms`,
    /// so sibling tasks run during it (spec.md §5).
    #[cfg(feature = "runtime")]
    pub async fn boot_check_async(&mut self, now_ms: &impl Fn() -> u32) -> Result<(), LinkError> {
        if self.reset_marker.exists() {
            self.send_command_frame_async("RESET_OK", now_ms).await?;
            self.reset_marker.clear();
        }
        self.next_telemetry_is_first_since_boot = false;
        Ok(())
    }

    /// Cooperative counterpart to [`Self::send_telemetry`]: the
    /// inter-part delay and every ACK wait are `.await`ed `Timer::after`
    /// calls instead of a spun/blocked `delay_ms`, addressing spec.md
    /// §5's "every wait ... yields at least every few ms".
    #[cfg(feature = "runtime")]
    pub async fn send_telemetry_async(
        &mut self,
        obj: Value,
        now_ms: &impl Fn() -> u32,
    ) -> Result<SendResult, LinkError> {
        if self.next_telemetry_is_first_since_boot {
            self.boot_check_async(now_ms).await?;
        }

        let obj = telemetry::with_liveness_fields(obj, now_ms(), self.low_power())?;
        let json_text = obj.to_string();
        let max_payload = self.config.max_frame_payload;

        if json_text.len() <= max_payload {
            self.send_frame_and_wait_ack_async(json_text.as_bytes(), 0, now_ms)
                .await?;
            return Ok(SendResult::Ok);
        }

        let chunk_size = max_payload.saturating_sub(WRAPPER_OVERHEAD_BYTES).max(1);
        let chunks = telemetry::chunk_bytes(&json_text, chunk_size);
        if chunks.len() > crate::reassembly::MAX_PARTS {
            return Err(LinkError::TelemetryTooLarge);
        }
        let total = chunks.len() as u8;

        for (i, chunk) in chunks.iter().enumerate() {
            let part = (i + 1) as u8;
            let mut data: crate::reassembly::Chunk = heapless::String::new();
            data.push_str(chunk).map_err(|_| LinkError::Framing)?;
            let wrapper = telemetry::MultipartWrapper {
                part,
                total,
                data,
            };
            let wrapper_json = serde_json::to_string(&wrapper).map_err(|_| LinkError::Framing)?;

            match self
                .send_frame_and_wait_ack_async(wrapper_json.as_bytes(), part, now_ms)
                .await
            {
                Ok(()) => {}
                Err(LinkError::AckFailure(p)) => return Ok(SendResult::AckFailure(p)),
                Err(e) => return Err(e),
            }

            if i + 1 < chunks.len() {
                embassy_time::Timer::after(embassy_time::Duration::from_millis(
                    INTER_PART_DELAY_MS as u64,
                ))
                .await;
            }
        }

        Ok(SendResult::Ok)
    }

    #[cfg(feature = "runtime")]
    async fn send_frame_and_wait_ack_async(
        &mut self,
        payload: &[u8],
        part: u8,
        now_ms: &impl Fn() -> u32,
    ) -> Result<(), LinkError> {
        let target = self.target_addr();
        self.modem.set_mode(Mode::Standby)?;
        let frame = Packet::new(self.device_id, target, payload.to_vec()).encode();
        self.modem.send(&frame)?;
        self.await_tx_done_async(now_ms).await?;

        self.modem.set_mode(Mode::RxContinuous)?;
        let start = now_ms();
        let expected = alloc::format!("ACK:{part}");
        let mut buf = [0u8; 255];
        loop {
            if let Some((len, signal)) = self.modem.recv(&mut buf)? {
                if let Some(pkt) = Packet::decode(&buf[..len], Some(signal)) {
                    if pkt.valid_checksum() {
                        if pkt.addr_to == self.device_id || pkt.addr_to == BROADCAST_ADDR {
                            if let Ok(text) = core::str::from_utf8(&pkt.payload) {
                                if text.trim_end_matches(['\r', '\n']) == expected {
                                    self.ground_station_address = Some(pkt.addr_from);
                                    self.modem.set_mode(Mode::Standby)?;
                                    return Ok(());
                                }
                            }
                        }
                    } else {
                        defmt::warn!("dropped frame with bad checksum");
                    }
                }
            }
            if now_ms().wrapping_sub(start) > ACK_DEADLINE_MS {
                self.modem.set_mode(Mode::Standby)?;
                return Err(LinkError::AckFailure(part));
            }
            embassy_time::Timer::after(embassy_time::Duration::from_millis(2)).await;
        }
    }

    #[cfg(feature = "runtime")]
    async fn send_command_frame_async(
        &mut self,
        text: &str,
        now_ms: &impl Fn() -> u32,
    ) -> Result<(), LinkError> {
        let target = self.target_addr();
        let payload = alloc::format!("CMD:{text}\r\n");
        self.modem.set_mode(Mode::Standby)?;
        let frame = Packet::new(self.device_id, target, payload.into_bytes()).encode();
        self.modem.send(&frame)?;
        self.await_tx_done_async(now_ms).await
    }

    #[cfg(feature = "runtime")]
    async fn await_tx_done_async(&mut self, now_ms: &impl Fn() -> u32) -> Result<(), LinkError> {
        let observed = self
            .modem
            .wait_flag_cooperative(IrqFlags::TX_DONE, ACK_DEADLINE_MS, now_ms)
            .await?;
        self.modem.clear_irq()?;
        self.modem.set_mode(Mode::Standby)?;
        if !observed {
            return Err(LinkError::Modem(crate::error::ModemError::Timeout));
        }
        Ok(())
    }

    /// Cooperative counterpart to [`Self::poll_commands`], used by the
    /// `runtime` Pump task.
    #[cfg(feature = "runtime")]
    pub async fn poll_commands_async(&mut self, now_ms: &impl Fn() -> u32) -> Result<(), LinkError> {
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
        if pkt.addr_to != self.device_id && pkt.addr_to != BROADCAST_ADDR {
            return Ok(());
        }
        let Ok(text) = core::str::from_utf8(&pkt.payload) else {
            return Ok(());
        };
        let trimmed = text.trim_end_matches(['\r', '\n']);
        let Some(cmd_text) = trimmed.strip_prefix("CMD:") else {
            return Ok(());
        };

        self.ground_station_address = Some(pkt.addr_from);
        let reply = self.handle_command_async(cmd_text, now_ms).await?;
        if let Some(reply) = reply {
            self.send_command_frame_async(&reply, now_ms).await?;
        }
        Ok(())
    }

    #[cfg(feature = "runtime")]
    async fn handle_command_async(
        &mut self,
        cmd_text: &str,
        now_ms: &impl Fn() -> u32,
    ) -> Result<Option<String>, LinkError> {
        if cmd_text == "PING" {
            return Ok(Some("PONG".to_string()));
        }

        if cmd_text == "RESET" {
            self.reset_marker.create();
            self.send_command_frame_async("RESET_ACK", now_ms).await?;
            embassy_time::Timer::after(embassy_time::Duration::from_millis(1_000)).await;
            (self.config.on_hardware_reset)();
            return Ok(None);
        }

        if let Some(n_text) = cmd_text.strip_prefix("TXPOW=") {
            return Ok(Some(self.handle_txpow(n_text)));
        }

        if let Some(flag) = cmd_text.strip_prefix("LPM=") {
            return Ok(Some(self.handle_lpm(flag)));
        }

        let (name, args) = cmd_text.split_once(' ').unwrap_or((cmd_text, ""));
        if let Some(response) = self.registry.dispatch(name, args) {
            return Ok(Some(response.as_str().to_string()));
        }

        if let Some(cb) = self.on_command_received.as_mut() {
            cb(name, args);
        }
        Ok(None)
    }
}
