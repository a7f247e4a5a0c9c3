//! Error taxonomy for the modem driver and the link state machines.

/// Failures that can occur while bringing up or driving the SX127x modem.
///
/// Every register read/write is treated as infallible at the bus level
/// (the caller's `embedded_hal` implementation does not itself fail); a
/// [`ModemError`] is reported only when the *chip* disagrees with what
/// was asked of it, or an SPI transaction itself returns an error.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum ModemError {
    /// The SPI bus reported an error transferring bytes.
    Spi,
    /// The mode-latch readback after writing `SLEEP | LONG_RANGE_MODE`
    /// during `init` did not match what was written. Fatal: the chip is
    /// either absent, not a real SX127x, or not responding.
    Init,
    /// A frame longer than 255 bytes (header + payload) was handed to
    /// `send`.
    FrameTooLong,
    /// A `wait_flag` deadline elapsed before the requested IRQ flag was
    /// observed set.
    Timeout,
}

/// Failures surfaced by [`crate::sat_link::SatLink`] and
/// [`crate::gs_link::GsLink`].
///
/// Per spec: only [`ModemError::Init`] (wrapped here as
/// [`LinkError::Modem`]) is fatal. Every other variant is recovered
/// locally (the Link returns to STDBY and keeps running); the caller
/// decides whether and when to retry.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum LinkError {
    /// The modem itself failed; see [`ModemError`]. Only
    /// [`ModemError::Init`] is unrecoverable.
    Modem(ModemError),
    /// The expected `ACK:<n>` for the given part number did not arrive
    /// before its deadline. The multipart send (if any) is abandoned;
    /// remaining parts are never sent.
    AckFailure(u8),
    /// A received frame's checksum did not match its payload. The frame
    /// is dropped silently at the wire level; this variant exists only
    /// so internal bookkeeping/tests can observe the drop.
    Checksum,
    /// A frame was too short to contain a header, or a multipart JSON
    /// wrapper was malformed (missing `_part`/`_total`/`data`, or
    /// `_part > _total`, or `_total` exceeding the implementation's
    /// `MAX_PARTS` ceiling).
    Framing,
    /// A complete multipart payload failed to parse as JSON after
    /// reassembly. The entry is evicted; nothing is sent back over the
    /// air (spec: reassembly errors are not surfaced on the wire).
    Reassembly,
    /// `send_telemetry` was called with a value that does not serialize
    /// to a JSON object.
    NotAnObject,
    /// The serialized telemetry object fragments into more parts than
    /// [`crate::reassembly::MAX_PARTS`]; the GS would silently drop
    /// every part without ACKing, so the SAT rejects it before sending
    /// rather than let the caller mistake it for a lost ACK.
    TelemetryTooLarge,
}

impl From<ModemError> for LinkError {
    fn from(e: ModemError) -> Self {
        LinkError::Modem(e)
    }
}

#[cfg(feature = "std")]
impl std::fmt::Display for ModemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModemError::Spi => "SPI transaction failed",
            ModemError::Init => "modem failed to latch LoRa mode during init",
            ModemError::FrameTooLong => "frame exceeds 255 bytes",
            ModemError::Timeout => "timed out waiting for an IRQ flag",
        };
        f.write_str(s)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ModemError {}

#[cfg(feature = "std")]
impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::Modem(e) => write!(f, "modem error: {e}"),
            LinkError::AckFailure(p) => write!(f, "no ACK for part {p}"),
            LinkError::Checksum => f.write_str("checksum mismatch"),
            LinkError::Framing => f.write_str("malformed frame"),
            LinkError::Reassembly => f.write_str("reassembled payload is not valid JSON"),
            LinkError::NotAnObject => f.write_str("telemetry value is not a JSON object"),
            LinkError::TelemetryTooLarge => {
                f.write_str("telemetry object fragments into more parts than MAX_PARTS")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for LinkError {}
