/// Communication layer: NDJSON framing and host command handling.
///
/// The scanner streams sightings and session summaries as newline-delimited
/// JSON over serial (and BLE notifications on the Embassy firmware).
/// Commands arrive the same way, one JSON object per line.
use crate::board;
use crate::filter::{ConfigError, FilterConfig, Prefix};
use crate::protocol::{DeviceMessage, EventId, HostCommand, RawCommand, MAX_MSG_LEN, VERSION};
use crate::scanner::{ScanMode, ScanSettings};
use crate::session::ScanStats;

/// BLE GATT service UUIDs for the scanner's report/command service.
///
/// These duplicate the string literals in the firmware's `#[gatt_service]`
/// and `#[characteristic]` attributes; proc macros require literals.
#[allow(dead_code)]
pub mod ble_uuids {
    /// Primary service UUID
    pub const SERVICE: &str = "6b1a0001-3f5e-4c52-9d0a-8a7e2b41c0de";
    /// TX characteristic: reports, notify
    pub const TX_CHAR: &str = "6b1a0002-3f5e-4c52-9d0a-8a7e2b41c0de";
    /// RX characteristic: commands, write
    pub const RX_CHAR: &str = "6b1a0003-3f5e-4c52-9d0a-8a7e2b41c0de";
}

/// BLE advertising name
pub const BLE_ADV_NAME: &str = "AttScanner";

/// Maximum BLE notification payload (MTU-3)
pub const BLE_MAX_NOTIFY: usize = 20;

// ── Serialization helpers ──────────────────────────────────────────────

/// Serialize a DeviceMessage to JSON bytes and write to the output buffer.
/// Returns the number of bytes written, or None if serialization failed.
pub fn serialize_message(msg: &DeviceMessage, buf: &mut [u8]) -> Option<usize> {
    match serde_json_core::to_slice(msg, buf) {
        Ok(len) => {
            // NDJSON delimiter
            if len < buf.len() {
                buf[len] = b'\n';
                Some(len + 1)
            } else {
                Some(len)
            }
        }
        Err(_) => None,
    }
}

/// Deserialize a HostCommand from a JSON line.
///
/// Unknown commands, missing arguments and over-long strings all yield
/// `None`.
pub fn parse_command(data: &[u8]) -> Option<HostCommand> {
    let trimmed = trim_trailing_whitespace(data);
    if trimmed.is_empty() {
        return None;
    }
    let (raw, _) = serde_json_core::from_slice::<RawCommand>(trimmed).ok()?;
    let cmd = match raw.cmd.as_str() {
        "start" => HostCommand::Start,
        "stop" => HostCommand::Stop,
        "status" => HostCommand::GetStatus,
        "set_rssi" => HostCommand::SetRssi {
            min_rssi: raw.min_rssi?,
        },
        "set_prefix" => HostCommand::SetPrefix { prefix: raw.prefix? },
        "set_duration" => HostCommand::SetDuration {
            duration_ms: raw.duration_ms?,
        },
        "set_active" => HostCommand::SetActive { active: raw.active? },
        "set_event" => HostCommand::SetEvent {
            event_id: raw.event_id?,
        },
        "reset_stats" => HostCommand::ResetStats,
        other => {
            log::warn!("Unknown host command '{}'", other);
            return None;
        }
    };
    Some(cmd)
}

// ── Runtime controls ───────────────────────────────────────────────────

/// Settings the host can change at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanControls {
    /// Periodic sessions enabled
    pub scanning: bool,
    pub settings: ScanSettings,
    pub filter: FilterConfig,
    /// Event sightings are reported against; none until the host picks one
    pub event_id: Option<EventId>,
}

impl ScanControls {
    pub fn new() -> Self {
        Self {
            scanning: true,
            settings: ScanSettings::new(),
            filter: FilterConfig::new(),
            event_id: None,
        }
    }

    /// Build a status report from these controls and the live counters.
    pub fn status(&self, stats: ScanStats, uptime_secs: u32, heap_free: u32) -> DeviceMessage<'_> {
        DeviceMessage::Status {
            scanning: self.scanning,
            uptime: uptime_secs,
            heap_free,
            sessions: stats.sessions,
            sightings: stats.sightings,
            duration_ms: self.settings.duration_ms,
            active: self.settings.mode.is_active(),
            min_rssi: self.filter.min_rssi,
            prefix: &self.filter.prefix,
            event_id: self.event_id.as_ref().map(|e| e.as_str()),
            board: board::BOARD_NAME,
            version: VERSION,
        }
    }
}

impl Default for ScanControls {
    fn default() -> Self {
        Self::new()
    }
}

/// What the caller still has to do after [`handle_command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Controls updated; push them to the scanner before the next session
    Updated,
    /// Scanning disabled; raise the cancel flag of a running session
    Stopped,
    /// Send a status report
    ReportStatus,
    /// Zero the engine's counters
    ResetStats,
    /// Controls left unchanged
    Rejected(ConfigError),
}

/// Process a received host command and update the controls accordingly.
pub fn handle_command(cmd: &HostCommand, controls: &mut ScanControls) -> CommandOutcome {
    match cmd {
        HostCommand::Start => {
            controls.scanning = true;
            log::info!("Scanning started by host command");
            CommandOutcome::Updated
        }
        HostCommand::Stop => {
            controls.scanning = false;
            log::info!("Scanning stopped by host command");
            CommandOutcome::Stopped
        }
        HostCommand::GetStatus => CommandOutcome::ReportStatus,
        HostCommand::SetRssi { min_rssi } => {
            controls.filter.min_rssi = *min_rssi;
            log::info!("RSSI threshold set to {}", min_rssi);
            CommandOutcome::Updated
        }
        HostCommand::SetPrefix { prefix } => set_prefix(prefix, &mut controls.filter),
        HostCommand::SetDuration { duration_ms } => {
            match controls.settings.set_duration(*duration_ms) {
                Ok(()) => {
                    log::info!("Scan duration set to {} ms", duration_ms);
                    CommandOutcome::Updated
                }
                Err(e) => {
                    log::warn!("Rejected duration: {}", e);
                    CommandOutcome::Rejected(e)
                }
            }
        }
        HostCommand::SetActive { active } => {
            controls.settings.mode = ScanMode::from_active(*active);
            log::info!("Scan mode set to {}", controls.settings.mode.as_str());
            CommandOutcome::Updated
        }
        HostCommand::SetEvent { event_id } => {
            log::info!("Reporting against event '{}'", event_id);
            controls.event_id = Some(event_id.clone());
            CommandOutcome::Updated
        }
        HostCommand::ResetStats => CommandOutcome::ResetStats,
    }
}

fn set_prefix(prefix: &Prefix, filter: &mut FilterConfig) -> CommandOutcome {
    match filter.set_prefix(prefix) {
        Ok(()) => {
            if prefix.is_empty() {
                log::info!("Name prefix cleared, name matching disabled");
            } else {
                log::info!("Name prefix set to '{}'", prefix);
            }
            CommandOutcome::Updated
        }
        Err(e) => CommandOutcome::Rejected(e),
    }
}

// ── Serial NDJSON reader ───────────────────────────────────────────────

/// Serial NDJSON reader state machine.
/// Accumulates bytes until a newline is found, then yields the line.
pub struct LineReader {
    buf: [u8; MAX_MSG_LEN],
    pos: usize,
    overflowed: bool,
}

impl LineReader {
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_MSG_LEN],
            pos: 0,
            overflowed: false,
        }
    }

    /// Feed a byte into the reader. Returns a complete line (without newline)
    /// when one is detected. An over-long line is dropped whole.
    pub fn feed(&mut self, byte: u8) -> Option<&[u8]> {
        if byte == b'\n' || byte == b'\r' {
            let len = self.pos;
            let overflowed = self.overflowed;
            self.pos = 0;
            self.overflowed = false;
            if len > 0 && !overflowed {
                Some(&self.buf[..len])
            } else {
                None
            }
        } else if self.overflowed {
            None
        } else if self.pos < self.buf.len() {
            self.buf[self.pos] = byte;
            self.pos += 1;
            None
        } else {
            log::warn!("Command line over {} bytes dropped", MAX_MSG_LEN);
            self.overflowed = true;
            None
        }
    }
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_trailing_whitespace(data: &[u8]) -> &[u8] {
    let mut end = data.len();
    while end > 0 && data[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    &data[..end]
}
