/// Blocking scan driver for threaded platforms.
///
/// [`BeaconScanner`] owns a [`Radio`], a [`Clock`] and the [`ScanEngine`].
/// A session starts the radio, polls its advertisement queue into the
/// engine until the configured duration runs out or the cancel flag is
/// raised, then stops the radio and returns the sightings.
///
/// The radio's callback context never touches the engine: advertisements are
/// queued by the radio implementation and only drained here, on the thread
/// that owns the scanner.
use core::sync::atomic::{AtomicBool, Ordering};

use crate::advert::Advertisement;
use crate::defaults::{MAX_SCAN_DURATION_MS, MIN_SCAN_DURATION_MS, SCAN_DURATION_MS, STOP_POLL_MS};
use crate::filter::ConfigError;
use crate::session::{ScanEngine, ScanStats, Sightings};

/// BLE radio as seen by the scanner.
pub trait Radio {
    type Error: core::fmt::Debug;

    /// Bring up the radio stack.
    fn begin(&mut self) -> Result<(), Self::Error>;
    /// Shut the radio stack down.
    fn end(&mut self);
    /// Start scanning until [`Radio::stop_scan`].
    fn start_scan(&mut self, mode: ScanMode) -> Result<(), Self::Error>;
    fn stop_scan(&mut self);
    /// Hand every advertisement received since the last poll to `sink`, in
    /// arrival order. Must not block.
    fn poll(&mut self, sink: &mut dyn FnMut(&Advertisement));
}

/// Monotonic millisecond clock with a blocking sleep.
pub trait Clock {
    fn now_ms(&self) -> u64;
    fn sleep_ms(&self, ms: u32);
}

/// Active scans request scan responses (more names, more airtime);
/// passive scans only listen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScanMode {
    #[default]
    Active,
    Passive,
}

impl ScanMode {
    pub fn from_active(active: bool) -> Self {
        if active {
            ScanMode::Active
        } else {
            ScanMode::Passive
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ScanMode::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMode::Active => "active",
            ScanMode::Passive => "passive",
        }
    }
}

/// Per-session radio settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSettings {
    pub duration_ms: u32,
    pub mode: ScanMode,
}

impl ScanSettings {
    pub const fn new() -> Self {
        Self {
            duration_ms: SCAN_DURATION_MS,
            mode: ScanMode::Active,
        }
    }

    pub fn set_duration(&mut self, duration_ms: u32) -> Result<(), ConfigError> {
        if !(MIN_SCAN_DURATION_MS..=MAX_SCAN_DURATION_MS).contains(&duration_ms) {
            return Err(ConfigError::DurationOutOfRange(duration_ms));
        }
        self.duration_ms = duration_ms;
        Ok(())
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self::new()
    }
}

/// Session- or initialization-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    #[error("scanner not initialized")]
    NotInitialized,
    #[error("radio unavailable")]
    RadioUnavailable,
}

/// Result of one finished session
#[derive(Debug)]
pub struct SessionReport {
    pub sightings: Sightings,
    /// Stopped early by the cancel flag
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

pub struct BeaconScanner<R, C> {
    radio: R,
    clock: C,
    engine: ScanEngine,
    settings: ScanSettings,
    initialized: bool,
}

impl<R: Radio, C: Clock> BeaconScanner<R, C> {
    pub fn new(radio: R, clock: C) -> Self {
        let engine = ScanEngine::new(clock.now_ms());
        Self {
            radio,
            clock,
            engine,
            settings: ScanSettings::new(),
            initialized: false,
        }
    }

    /// Bring up the radio. Calling again after success is a no-op.
    pub fn initialize(&mut self) -> Result<(), ScanError> {
        if self.initialized {
            return Ok(());
        }

        log::info!("Initializing BLE scanner");
        if let Err(e) = self.radio.begin() {
            log::error!("BLE radio failed to start: {:?}", e);
            return Err(ScanError::RadioUnavailable);
        }

        self.initialized = true;
        log::info!(
            "BLE scanner ready ({} ms, {}, prefix '{}')",
            self.settings.duration_ms,
            self.settings.mode.as_str(),
            self.engine.filter().prefix
        );
        Ok(())
    }

    pub fn shutdown(&mut self) {
        if self.initialized {
            self.radio.end();
            self.initialized = false;
            log::info!("BLE scanner shut down");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Run one scan session and return its sightings.
    ///
    /// Never fails: a scanner that is not initialized or a radio that will
    /// not start yields an empty result, logged.
    pub fn run_scan_session(&mut self, cancel: &AtomicBool) -> Sightings {
        match self.try_scan_session(cancel) {
            Ok(report) => report.sightings,
            Err(e) => {
                log::warn!("Scan skipped: {}", e);
                Sightings::new()
            }
        }
    }

    /// Run one scan session, surfacing session-level failures.
    ///
    /// `cancel` is checked every [`STOP_POLL_MS`]; raising it ends the
    /// session early with whatever was collected so far. The flag is left
    /// as is for the caller to clear.
    pub fn try_scan_session(&mut self, cancel: &AtomicBool) -> Result<SessionReport, ScanError> {
        if !self.initialized {
            return Err(ScanError::NotInitialized);
        }

        if let Err(e) = self.radio.start_scan(self.settings.mode) {
            log::error!("BLE scan failed to start: {:?}", e);
            return Err(ScanError::RadioUnavailable);
        }

        let started = self.clock.now_ms();
        self.engine.begin_session(started);
        log::info!("Starting BLE scan for {}ms...", self.settings.duration_ms);

        let deadline = started + self.settings.duration_ms as u64;
        let mut cancelled = false;
        loop {
            self.drain();

            if cancel.load(Ordering::Relaxed) {
                cancelled = true;
                log::info!("BLE scan cancelled");
                break;
            }

            let now = self.clock.now_ms();
            if now >= deadline {
                break;
            }
            let wait = (deadline - now).min(STOP_POLL_MS as u64) as u32;
            self.clock.sleep_ms(wait);
        }

        self.radio.stop_scan();
        // Pick up anything queued between the last poll and the stop
        self.drain();

        let sightings = self.engine.end_session();
        let elapsed_ms = self.clock.now_ms().saturating_sub(started);
        log::info!(
            "BLE scan completed in {}ms. Found {} devices",
            elapsed_ms,
            sightings.len()
        );

        Ok(SessionReport {
            sightings,
            cancelled,
            elapsed_ms,
        })
    }

    /// Offer everything the radio has queued. Sightings are stamped with
    /// the time of this poll, not of reception.
    fn drain(&mut self) {
        let engine = &mut self.engine;
        let clock = &self.clock;
        self.radio.poll(&mut |adv| {
            let _ = engine.offer(adv, clock.now_ms());
        });
    }

    pub fn set_scan_duration(&mut self, duration_ms: u32) -> Result<(), ConfigError> {
        self.settings.set_duration(duration_ms)
    }

    /// Takes effect when the next session starts.
    pub fn set_scan_mode(&mut self, mode: ScanMode) {
        self.settings.mode = mode;
    }

    pub fn set_filter_prefix(&mut self, prefix: &str) -> Result<(), ConfigError> {
        self.engine.filter_mut().set_prefix(prefix)
    }

    pub fn set_min_rssi(&mut self, min_rssi: i8) {
        self.engine.filter_mut().min_rssi = min_rssi;
    }

    pub fn settings(&self) -> ScanSettings {
        self.settings
    }

    pub fn engine(&self) -> &ScanEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ScanEngine {
        &mut self.engine
    }

    pub fn stats(&self) -> ScanStats {
        self.engine.stats()
    }

    pub fn reset_stats(&mut self) {
        self.engine.reset_stats();
    }

    /// See [`ScanEngine::settle_stats`].
    pub fn settle_stats(&mut self, reset_pending: &AtomicBool) -> ScanStats {
        self.engine.settle_stats(reset_pending)
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }
}
