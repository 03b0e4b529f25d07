/// Scan session engine.
///
/// Sans-IO core shared by every platform binary: owns the filter config, the
/// deduplicator, the sightings of the open session and the cumulative
/// counters. Callers feed it advertisements and timestamps; it never touches
/// the radio or a clock itself, so the same engine runs under Embassy tasks,
/// FreeRTOS threads and host tests.
use core::sync::atomic::{AtomicBool, Ordering};

use heapless::Vec;

use crate::advert::{Advertisement, MacAddress, NameString};
use crate::dedup::{Admission, Deduplicator};
use crate::defaults::{DEDUP_WINDOW_MS, MAX_SIGHTINGS};
use crate::filter::{filter_advertisement, FilterConfig, IdSource, Identifier, Matches, Rejection};

/// One accepted, de-duplicated attendance detection. Never mutated after
/// creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub id: Identifier,
    /// Raw broadcast name; may differ from `id`
    pub name: NameString,
    pub rssi: i8,
    pub addr: MacAddress,
    /// Milliseconds since boot when the engine was offered the
    /// advertisement. Drivers that poll a radio queue stamp at poll time, so
    /// this trails reception by up to one poll interval.
    pub timestamp_ms: u64,
    pub source: IdSource,
    /// Criteria that marked this as an attendance beacon
    pub matches: Matches,
}

/// Sightings of one session, in arrival order
pub type Sightings = Vec<Sighting, MAX_SIGHTINGS>;

/// Cumulative counters. Only reset on request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Sessions started
    pub sessions: u32,
    /// Sightings accepted across all finished sessions
    pub sightings: u32,
}

#[derive(Debug)]
pub struct ScanEngine {
    filter: FilterConfig,
    dedup: Deduplicator,
    sightings: Sightings,
    stats: ScanStats,
    open: bool,
}

impl ScanEngine {
    /// Engine with the default 5 minute dedup window, starting at `now_ms`.
    pub fn new(now_ms: u64) -> Self {
        Self::with_window(DEDUP_WINDOW_MS, now_ms)
    }

    pub fn with_window(window_ms: u64, now_ms: u64) -> Self {
        Self {
            filter: FilterConfig::new(),
            dedup: Deduplicator::new(window_ms, now_ms),
            sightings: Vec::new(),
            stats: ScanStats::default(),
            open: false,
        }
    }

    pub fn filter(&self) -> &FilterConfig {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut FilterConfig {
        &mut self.filter
    }

    pub fn set_filter(&mut self, filter: FilterConfig) {
        self.filter = filter;
    }

    /// Open a new session.
    ///
    /// Runs the dedup window check and clears the previous session's
    /// sightings. Opening while a session is already open discards it.
    pub fn begin_session(&mut self, now_ms: u64) {
        if self.open {
            log::warn!(
                "Session restarted with {} sightings uncollected",
                self.sightings.len()
            );
        }
        self.dedup.expire(now_ms);
        self.sightings.clear();
        self.stats.sessions = self.stats.sessions.wrapping_add(1);
        self.open = true;
    }

    /// Offer one advertisement to the open session.
    ///
    /// Returns the new sighting, or why the advertisement was dropped.
    pub fn offer(&mut self, adv: &Advertisement, now_ms: u64) -> Result<&Sighting, Rejection> {
        match self.admit(adv, now_ms) {
            Ok(()) => self.sightings.last().ok_or(Rejection::SessionFull),
            Err(rejection) => {
                log::trace!(
                    "{:02X?} ({} dBm) rejected: {}",
                    adv.addr,
                    adv.rssi,
                    rejection.as_str()
                );
                Err(rejection)
            }
        }
    }

    fn admit(&mut self, adv: &Advertisement, now_ms: u64) -> Result<(), Rejection> {
        if !self.open {
            return Err(Rejection::Idle);
        }

        let candidate = filter_advertisement(adv, &self.filter)?;

        if self.dedup.contains(&candidate.id) {
            return Err(Rejection::Duplicate);
        }
        // Checked before admitting so the id can still be sighted next session
        if self.sightings.is_full() {
            log::warn!("Session full, dropping {}", candidate.id);
            return Err(Rejection::SessionFull);
        }
        match self.dedup.admit(&candidate.id) {
            Admission::Fresh => {}
            Admission::Duplicate => return Err(Rejection::Duplicate),
            Admission::Full => return Err(Rejection::DedupFull),
        }

        let sighting = Sighting {
            id: candidate.id,
            name: adv.name.clone().unwrap_or_default(),
            rssi: adv.rssi,
            addr: adv.addr,
            timestamp_ms: now_ms,
            source: candidate.source,
            matches: candidate.matches,
        };
        log::info!(
            "Found attendance beacon {} '{}' ({} dBm, via {}, matched {:?})",
            sighting.id,
            sighting.name,
            sighting.rssi,
            sighting.source.as_str(),
            sighting.matches
        );
        self.sightings
            .push(sighting)
            .map_err(|_| Rejection::SessionFull)
    }

    /// Close the session and hand over its sightings.
    pub fn end_session(&mut self) -> Sightings {
        self.open = false;
        let found = core::mem::take(&mut self.sightings);
        self.stats.sightings = self.stats.sightings.wrapping_add(found.len() as u32);
        found
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Sightings collected so far in the open session
    pub fn sightings(&self) -> &[Sighting] {
        &self.sightings
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = ScanStats::default();
    }

    /// Counters to publish, after applying a reset requested through
    /// `reset_pending` while a session was running. Clears the flag.
    pub fn settle_stats(&mut self, reset_pending: &AtomicBool) -> ScanStats {
        if reset_pending.swap(false, Ordering::Relaxed) {
            self.reset_stats();
        }
        self.stats
    }

    pub fn dedup(&self) -> &Deduplicator {
        &self.dedup
    }

    /// Drop every remembered identifier and restart the dedup window.
    pub fn reset_dedup(&mut self, now_ms: u64) {
        self.dedup.reset(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::MAX_TRACKED_IDS;
    use crate::filter::MatchKind;
    use crate::test_utils::{badge, AdvBuilder};

    const WINDOW: u64 = 300_000;

    fn engine() -> ScanEngine {
        ScanEngine::with_window(WINDOW, 0)
    }

    #[test]
    fn offer_without_session_is_idle() {
        let mut e = engine();
        assert_eq!(e.offer(&badge("ATT-A", -50), 0).unwrap_err(), Rejection::Idle);
    }

    #[test]
    fn accepted_sighting_carries_advertisement_fields() {
        let mut e = engine();
        e.begin_session(10);
        let adv = AdvBuilder::new(-60)
            .addr([1, 2, 3, 4, 5, 6])
            .manufacturer(b"\xFF\xFFATT-USER-1")
            .name("OtherName")
            .build();
        let s = e.offer(&adv, 42).unwrap().clone();
        assert_eq!(s.id.as_str(), "ATT-USER-1");
        assert_eq!(s.name.as_str(), "OtherName");
        assert_eq!(s.rssi, -60);
        assert_eq!(s.addr, [1, 2, 3, 4, 5, 6]);
        assert_eq!(s.timestamp_ms, 42);
        assert_eq!(s.source, IdSource::Manufacturer);
        assert_eq!(s.matches.as_slice(), &[MatchKind::IdPrefix]);
    }

    #[test]
    fn sighting_keeps_every_match_reason() {
        let mut e = engine();
        e.begin_session(0);
        let adv = AdvBuilder::new(-55)
            .service_uuid16(0xFFF0)
            .name("ATT-Badge7")
            .build();
        let s = e.offer(&adv, 0).unwrap();
        assert_eq!(
            s.matches.as_slice(),
            &[MatchKind::ServiceUuid, MatchKind::NamePrefix, MatchKind::IdPrefix]
        );
    }

    #[test]
    fn display_name_empty_when_absent() {
        let mut e = engine();
        e.begin_session(0);
        let adv = AdvBuilder::new(-60).service_data(b"ATT-SVC").build();
        assert_eq!(e.offer(&adv, 0).unwrap().name.as_str(), "");
    }

    #[test]
    fn scenario_d_same_identifier_twice_in_session() {
        let mut e = engine();
        e.begin_session(0);
        let mfr = AdvBuilder::new(-70).manufacturer(b"\xFF\xFFATT-U1").build();
        let svc = AdvBuilder::new(-40)
            .addr([9; 6])
            .service_data(b"ATT-U1")
            .name("Stronger")
            .build();
        assert!(e.offer(&mfr, 1).is_ok());
        assert_eq!(e.offer(&svc, 2).unwrap_err(), Rejection::Duplicate);
        let found = e.end_session();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].rssi, -70);
    }

    #[test]
    fn rejected_advertisement_does_not_enter_dedup() {
        let mut e = engine();
        e.begin_session(0);
        assert_eq!(
            e.offer(&badge("ATT-Far", -90), 0).unwrap_err(),
            Rejection::WeakSignal
        );
        assert!(e.offer(&badge("ATT-Far", -70), 1).is_ok());
    }

    #[test]
    fn identifier_suppressed_in_later_session_within_window() {
        let mut e = engine();
        e.begin_session(0);
        assert!(e.offer(&badge("ATT-A", -50), 0).is_ok());
        e.end_session();

        e.begin_session(5_000);
        assert_eq!(
            e.offer(&badge("ATT-A", -50), 5_100).unwrap_err(),
            Rejection::Duplicate
        );
        assert!(e.end_session().is_empty());
    }

    #[test]
    fn identifier_readmitted_after_window_timeout() {
        let mut e = engine();
        e.begin_session(0);
        assert!(e.offer(&badge("ATT-A", -50), 0).is_ok());
        e.end_session();

        e.begin_session(WINDOW + 1);
        assert!(e.offer(&badge("ATT-A", -50), WINDOW + 2).is_ok());
    }

    #[test]
    fn window_only_checked_at_session_start() {
        let mut e = engine();
        e.begin_session(0);
        assert!(e.offer(&badge("ATT-A", -50), 0).is_ok());
        // Window runs out mid-session; still a duplicate until next session
        assert_eq!(
            e.offer(&badge("ATT-A", -50), WINDOW + 10).unwrap_err(),
            Rejection::Duplicate
        );
    }

    #[test]
    fn explicit_dedup_reset_readmits() {
        let mut e = engine();
        e.begin_session(0);
        assert!(e.offer(&badge("ATT-A", -50), 0).is_ok());
        e.reset_dedup(1);
        assert!(e.offer(&badge("ATT-A", -50), 2).is_ok());
        assert_eq!(e.sightings().len(), 2);
    }

    #[test]
    fn full_session_rejects_without_remembering() {
        let mut e = engine();
        e.begin_session(0);
        for i in 0..MAX_SIGHTINGS {
            let name = std::format!("ATT-{i}");
            assert!(e.offer(&badge(&name, -50), 0).is_ok());
        }
        assert_eq!(
            e.offer(&badge("ATT-LATE", -50), 0).unwrap_err(),
            Rejection::SessionFull
        );
        assert!(!e.dedup().contains("ATT-LATE"));
        assert_eq!(e.end_session().len(), MAX_SIGHTINGS);

        e.begin_session(1);
        assert!(e.offer(&badge("ATT-LATE", -50), 1).is_ok());
    }

    #[test]
    fn stats_accumulate_and_reset() {
        let mut e = engine();
        e.begin_session(0);
        e.offer(&badge("ATT-A", -50), 0).unwrap();
        e.offer(&badge("ATT-B", -50), 0).unwrap();
        e.end_session();
        e.begin_session(1);
        e.end_session();

        assert_eq!(
            e.stats(),
            ScanStats {
                sessions: 2,
                sightings: 2
            }
        );
        e.reset_stats();
        assert_eq!(e.stats(), ScanStats::default());
    }

    #[test]
    fn reset_requested_mid_session_wins_over_old_counters() {
        let mut e = engine();
        let reset = AtomicBool::new(false);
        e.begin_session(0);
        e.offer(&badge("ATT-A", -50), 0).unwrap();
        reset.store(true, Ordering::Relaxed);
        e.end_session();

        assert_eq!(e.settle_stats(&reset), ScanStats::default());
        assert!(!reset.load(Ordering::Relaxed));

        e.begin_session(1);
        e.end_session();
        assert_eq!(e.settle_stats(&reset).sessions, 1);
    }

    #[test]
    fn begin_session_clears_previous_sightings() {
        let mut e = engine();
        e.begin_session(0);
        e.offer(&badge("ATT-A", -50), 0).unwrap();
        e.begin_session(1);
        assert!(e.sightings().is_empty());
        assert!(e.is_open());
    }

    #[test]
    fn end_session_closes() {
        let mut e = engine();
        e.begin_session(0);
        e.end_session();
        assert!(!e.is_open());
        assert_eq!(e.offer(&badge("ATT-A", -50), 0).unwrap_err(), Rejection::Idle);
    }

    #[test]
    fn filter_changes_apply_to_next_offer() {
        let mut e = engine();
        e.filter_mut().set_prefix("ROOM-").unwrap();
        e.begin_session(0);
        assert_eq!(
            e.offer(&badge("Door", -50), 0).unwrap_err(),
            Rejection::NotAttendance
        );
        assert!(e.offer(&badge("ROOM-4", -50), 0).is_ok());
    }

    #[test]
    fn many_sessions_in_one_window_never_readmit() {
        let mut e = engine();
        let mut next = 0;
        for k in 0..3u64 {
            e.begin_session(k * 6_500);
            for _ in 0..MAX_SIGHTINGS {
                let name = std::format!("ATT-{next}");
                assert!(e.offer(&badge(&name, -50), k * 6_500).is_ok());
                next += 1;
            }
            assert_eq!(e.end_session().len(), MAX_SIGHTINGS);
        }

        e.begin_session(19_500);
        for i in 0..next {
            let name = std::format!("ATT-{i}");
            assert_eq!(
                e.offer(&badge(&name, -50), 19_500).unwrap_err(),
                Rejection::Duplicate
            );
        }
    }

    #[test]
    fn dedup_overflow_refuses_instead_of_forgetting() {
        let mut e = engine();
        let sessions = MAX_TRACKED_IDS / MAX_SIGHTINGS;
        for k in 0..sessions {
            e.begin_session(k as u64);
            for j in 0..MAX_SIGHTINGS {
                let name = std::format!("ATT-{}", k * MAX_SIGHTINGS + j);
                assert!(e.offer(&badge(&name, -50), k as u64).is_ok());
            }
            e.end_session();
        }
        assert!(e.dedup().is_full());

        e.begin_session(sessions as u64);
        assert_eq!(
            e.offer(&badge("ATT-LATE", -50), 0).unwrap_err(),
            Rejection::DedupFull
        );
        assert_eq!(
            e.offer(&badge("ATT-0", -50), 0).unwrap_err(),
            Rejection::Duplicate
        );
        assert!(e.end_session().is_empty());

        e.begin_session(WINDOW + sessions as u64 + 1);
        assert!(e.offer(&badge("ATT-LATE", -50), WINDOW).is_ok());
    }
}
