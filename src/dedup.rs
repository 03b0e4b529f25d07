/// Time-windowed duplicate suppression for attendance identifiers.
///
/// Every identifier is admitted at most once per window. The window is not
/// rolling per identifier: the whole set is cleared once `window_ms` has
/// passed since the last reset, and that check only happens when the caller
/// asks for it (at the top of each scan session). Session boundaries alone do
/// not clear the set.
///
/// Identifiers are stored as 64-bit FNV-1a fingerprints so a full room fits
/// in a few kilobytes. Nothing is evicted inside a window: once the set is
/// full, new identifiers are refused until the window expires.
use heapless::Vec;

use crate::defaults::MAX_TRACKED_IDS;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Outcome of offering an identifier to the deduplicator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting in this window, now recorded
    Fresh,
    /// Already seen in this window
    Duplicate,
    /// Not seen yet, but the set has no room left in this window
    Full,
}

#[derive(Debug)]
pub struct Deduplicator {
    seen: Vec<u64, MAX_TRACKED_IDS>,
    window_start_ms: u64,
    window_ms: u64,
}

impl Deduplicator {
    pub fn new(window_ms: u64, now_ms: u64) -> Self {
        Self {
            seen: Vec::new(),
            window_start_ms: now_ms,
            window_ms,
        }
    }

    /// Clear the set if the window has run out. Returns true on reset.
    pub fn expire(&mut self, now_ms: u64) -> bool {
        if now_ms.saturating_sub(self.window_start_ms) > self.window_ms {
            self.reset(now_ms);
            log::info!("Dedup window expired, identifiers cleared");
            true
        } else {
            false
        }
    }

    /// Record `id` unless it is already in the window or the set is full.
    pub fn admit(&mut self, id: &str) -> Admission {
        let key = fingerprint(id);
        if self.seen.contains(&key) {
            return Admission::Duplicate;
        }
        if self.seen.push(key).is_err() {
            log::warn!("Dedup set full ({} ids), refusing {}", MAX_TRACKED_IDS, id);
            return Admission::Full;
        }
        Admission::Fresh
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(&fingerprint(id))
    }

    /// Forget every identifier and restart the window at `now_ms`.
    pub fn reset(&mut self, now_ms: u64) {
        self.seen.clear();
        self.window_start_ms = now_ms;
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.seen.is_full()
    }

    pub fn window_start_ms(&self) -> u64 {
        self.window_start_ms
    }
}

/// 64-bit FNV-1a over the identifier bytes
fn fingerprint(id: &str) -> u64 {
    id.bytes()
        .fold(FNV_OFFSET, |hash, b| (hash ^ u64::from(b)).wrapping_mul(FNV_PRIME))
}
