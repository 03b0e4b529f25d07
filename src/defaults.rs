/// Compiled-in defaults for the attendance scanner.
///
/// Runtime-adjustable values (RSSI floor, filter prefix, scan duration and
/// mode) start from these and can be changed over the host command link.

/// Weakest accepted signal (dBm). Anything below is treated as out of range.
pub const MIN_RSSI: i8 = -80;

/// Prefix every attendance credential identifier carries.
pub const ATTENDANCE_PREFIX: &str = "ATT-";

/// Default name filter prefix. Matches [`ATTENDANCE_PREFIX`] until changed.
pub const DEFAULT_NAME_PREFIX: &str = ATTENDANCE_PREFIX;

/// Attendance service UUID `0000FFF0-0000-1000-8000-00805F9B34FB`.
pub const ATTENDANCE_SERVICE_UUID: u128 = 0x0000_FFF0_0000_1000_8000_0080_5F9B_34FB;

/// Bluetooth base UUID. 16- and 32-bit UUIDs are shorthand for this value
/// with the short form placed in bits 96..128.
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Length of one scan session in milliseconds.
///
/// Kept short so a stop request from the host feels immediate even without
/// the cancellation poll.
pub const SCAN_DURATION_MS: u32 = 1500;

/// Accepted range for runtime scan duration changes.
pub const MIN_SCAN_DURATION_MS: u32 = 100;
pub const MAX_SCAN_DURATION_MS: u32 = 60_000;

/// Delay between the start of consecutive scan sessions.
pub const SCAN_INTERVAL_MS: u32 = 5000;

/// Cancellation polling granularity while a session is running.
pub const STOP_POLL_MS: u32 = 100;

/// Dedup window: an identifier is reported at most once per 5 minutes.
pub const DEDUP_WINDOW_MS: u64 = 300_000;

/// Radio scan interval and window (ms). Window just under interval keeps the
/// receiver on almost continuously.
pub const RADIO_SCAN_INTERVAL_MS: u16 = 100;
pub const RADIO_SCAN_WINDOW_MS: u16 = 99;

/// Maximum sightings collected in one session.
pub const MAX_SIGHTINGS: usize = 32;

/// Maximum identifiers tracked by the deduplicator in one window. Stored as
/// 8-byte fingerprints, so the full set costs 8 KiB.
pub const MAX_TRACKED_IDS: usize = 1024;

/// Name this scanner reports itself as.
pub const SCANNER_ID: &str = "ESP32-Scanner";
