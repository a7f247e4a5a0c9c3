//! Reassembles multipart JSON telemetry wrappers into complete JSON
//! values, keyed by sender address.

extern crate alloc;
use alloc::string::String;

use heapless::{FnvIndexMap, Vec as HVec};

use crate::error::LinkError;
use crate::telemetry::MultipartWrapper;

/// Implementation ceiling on `_total`, per spec.md §5 "Memory policy"
/// recommendation (`max_parts <= 16`). Wrappers declaring a larger
/// `_total` are dropped as a framing error rather than accepted and
/// risking unbounded buffer growth.
pub const MAX_PARTS: usize = 16;

/// How many distinct senders can have an in-flight reassembly at once.
/// The spec's Non-goals limit each side to a single peer, but nothing
/// stops a stray frame from a foreign address arriving mid-stream, so a
/// small table (rather than a single slot) keeps "two interleaved
/// multipart streams from distinct senders do not mix" true in general.
const MAX_CONCURRENT_SENDERS: usize = 4;

/// Part payloads are ASCII substrings of the serialized JSON text, so
/// they live in a `heapless::String`, never on the heap.
pub type Chunk = heapless::String<220>;

struct ReassemblyEntry {
    total: u8,
    parts: HVec<Option<Chunk>, MAX_PARTS>,
    first_seen_tick: u32,
}

impl ReassemblyEntry {
    fn fresh(total: u8, now_ms: u32) -> Self {
        let mut parts = HVec::new();
        for _ in 0..total {
            let _ = parts.push(None);
        }
        ReassemblyEntry {
            total,
            parts,
            first_seen_tick: now_ms,
        }
    }

    fn is_complete(&self) -> bool {
        self.parts.iter().all(Option::is_some)
    }
}

/// Per-Link reassembly state. Touched only by the Pump task (the sole
/// inbound processor), per spec.md §5.
pub struct Reassembler {
    entries: FnvIndexMap<u8, ReassemblyEntry, MAX_CONCURRENT_SENDERS>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Reassembler {
            entries: FnvIndexMap::new(),
        }
    }

    /// Feed one multipart wrapper from `sender`. Returns:
    /// - `Ok(None)` — accepted, message still incomplete.
    /// - `Ok(Some(json_text))` — the final part arrived; all parts
    ///   concatenated in order. The caller parses this as JSON (kept
    ///   outside the reassembler so it stays free of a JSON-parsing
    ///   dependency on its hot path beyond string concatenation).
    /// - `Err(LinkError::Framing)` — `_part` out of range (`0`, or
    ///   `> _total`), or `_total` exceeds [`MAX_PARTS`].
    pub fn feed(
        &mut self,
        sender: u8,
        wrapper: &MultipartWrapper,
        now_ms: u32,
    ) -> Result<Option<String>, LinkError> {
        let total = wrapper.total;
        let part = wrapper.part;

        if part == 0 || part > total || total as usize > MAX_PARTS {
            return Err(LinkError::Framing);
        }

        let needs_fresh = match self.entries.get(&sender) {
            Some(entry) => entry.total != total,
            None => true,
        };

        if needs_fresh {
            if !self.entries.contains_key(&sender) && self.entries.len() == self.entries.capacity()
            {
                // Table full of unrelated senders; evict the oldest to
                // make room rather than silently refuse a new stream.
                if let Some(oldest) = self.oldest_sender() {
                    self.entries.remove(&oldest);
                }
            }
            let _ = self
                .entries
                .insert(sender, ReassemblyEntry::fresh(total, now_ms));
        }

        let entry = self.entries.get_mut(&sender).expect("just inserted");

        let mut chunk = Chunk::new();
        // Truncate rather than fail: a chunk that doesn't fit our fixed
        // buffer is still stored up to capacity so a test harness using
        // shorter strings behaves predictably; production chunk sizes
        // are bounded well under 220 bytes by `max_frame_payload`.
        let _ = chunk.push_str(wrapper.data.as_str());
        entry.parts[(part - 1) as usize] = Some(chunk);

        if !entry.is_complete() {
            return Ok(None);
        }

        let mut joined = String::new();
        for p in entry.parts.iter() {
            joined.push_str(p.as_ref().expect("checked complete").as_str());
        }
        self.entries.remove(&sender);

        Ok(Some(joined))
    }

    /// Remove any entry whose first part arrived more than
    /// `timeout_ms` ago, per spec.md §3 "Evicted ... on timeout".
    pub fn evict_stale(&mut self, now_ms: u32, timeout_ms: u32) {
        let stale: HVec<u8, MAX_CONCURRENT_SENDERS> = self
            .entries
            .iter()
            .filter(|(_, e)| now_ms.wrapping_sub(e.first_seen_tick) > timeout_ms)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in stale {
            self.entries.remove(&addr);
        }
    }

    fn oldest_sender(&self) -> Option<u8> {
        self.entries
            .iter()
            .min_by_key(|(_, e)| e.first_seen_tick)
            .map(|(addr, _)| *addr)
    }
}
