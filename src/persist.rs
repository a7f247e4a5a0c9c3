//! The SAT-side "was reset by command" marker, spec.md §4.4/§6.
//!
//! The source backs this with a zero-byte file at `/RMT_RESET`; per
//! spec.md §9 ("Global singletons ... replace with explicit
//! construction and injection") this is modeled as a trait so the
//! marker can be a real filesystem file on a host, flash-backed on a
//! microcontroller, or a no-op in tests.

/// Durable one-shot flag surviving a reboot: "the last reboot was
/// commanded via `CMD:RESET`".
pub trait ResetMarker {
    fn exists(&self) -> bool;
    fn create(&mut self);
    fn clear(&mut self);
}

/// Always absent. Used in `no_std` builds and unit tests where no
/// durable storage is available or the RESET lifecycle is out of
/// scope for the test.
#[derive(Default)]
pub struct NullResetMarker;

impl ResetMarker for NullResetMarker {
    fn exists(&self) -> bool {
        false
    }
    fn create(&mut self) {}
    fn clear(&mut self) {}
}

/// Backs the marker with a real zero-byte file at `path` (`/RMT_RESET`
/// per spec.md §6), for hosted builds (GS binary, integration tests).
#[cfg(feature = "std")]
pub struct FsResetMarker {
    path: std::path::PathBuf,
}

#[cfg(feature = "std")]
impl FsResetMarker {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        FsResetMarker { path: path.into() }
    }
}

#[cfg(feature = "std")]
impl ResetMarker for FsResetMarker {
    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn create(&mut self) {
        if let Err(e) = std::fs::write(&self.path, []) {
            defmt::warn!("failed to write reset marker: {}", defmt::Debug2Format(&e));
        }
    }

    fn clear(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                defmt::warn!("failed to remove reset marker: {}", defmt::Debug2Format(&e));
            }
        }
    }
}
