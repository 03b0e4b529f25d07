/// JSON message protocol between the scanner and its host/gateway.
///
/// All messages are newline-delimited JSON (NDJSON). Sighting reports carry
/// the attendance record fields the backend expects (`eventId`, `bleUuid`,
/// `deviceName`, `rssi`, `timestamp`, `scannerId`).
/// Uses `heapless` types for no_std/no-alloc operation.
use heapless::String;
use serde::{Deserialize, Serialize};

use crate::advert::format_mac;
use crate::filter::{Matches, Prefix};
use crate::session::{ScanStats, Sighting};

/// Maximum length for MAC address strings ("AA:BB:CC:DD:EE:FF")
pub type MacString = String<18>;

/// Backend event identifier
pub type EventId = String<40>;

/// Messages sent from the scanner to the host
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum DeviceMessage<'a> {
    /// One accepted attendance sighting
    #[serde(rename = "sighting")]
    Sighting {
        /// Selected event, omitted until the host picks one
        #[serde(rename = "eventId", skip_serializing_if = "Option::is_none")]
        event_id: Option<&'a str>,
        #[serde(rename = "bleUuid")]
        ble_uuid: &'a str,
        #[serde(rename = "deviceName")]
        device_name: &'a str,
        rssi: i8,
        /// Milliseconds since boot at capture
        timestamp: u64,
        #[serde(rename = "scannerId")]
        scanner_id: &'a str,
        mac: &'a MacString,
        /// Field the identifier was read from: "mfr", "svc_data", "name"
        via: &'static str,
        /// Why this sighting counts as attendance
        #[serde(rename = "match")]
        matches: &'a Matches,
    },
    /// End-of-session summary
    #[serde(rename = "session")]
    Session {
        found: u16,
        cancelled: bool,
        elapsed_ms: u32,
        /// Cumulative sessions
        sessions: u32,
        /// Cumulative sightings
        total: u32,
    },
    /// Scanner status report
    #[serde(rename = "status")]
    Status {
        scanning: bool,
        /// Uptime in seconds
        uptime: u32,
        /// Free heap in bytes
        heap_free: u32,
        sessions: u32,
        sightings: u32,
        duration_ms: u32,
        active: bool,
        min_rssi: i8,
        prefix: &'a str,
        #[serde(rename = "eventId", skip_serializing_if = "Option::is_none")]
        event_id: Option<&'a str>,
        /// Board identifier
        board: &'static str,
        /// Firmware version
        version: &'static str,
    },
}

impl<'a> DeviceMessage<'a> {
    /// Build a sighting report. `mac` is scratch space for the formatted
    /// address and must outlive the message.
    pub fn sighting(
        sighting: &'a Sighting,
        event_id: Option<&'a EventId>,
        scanner_id: &'a str,
        mac: &'a mut MacString,
    ) -> Self {
        mac.clear();
        format_mac(&sighting.addr, mac);
        DeviceMessage::Sighting {
            event_id: event_id.map(|e| e.as_str()),
            ble_uuid: &sighting.id,
            device_name: &sighting.name,
            rssi: sighting.rssi,
            timestamp: sighting.timestamp_ms,
            scanner_id,
            mac,
            via: sighting.source.as_str(),
            matches: &sighting.matches,
        }
    }

    /// Build an end-of-session summary.
    pub fn session(found: usize, cancelled: bool, elapsed_ms: u64, stats: ScanStats) -> Self {
        DeviceMessage::Session {
            found: found as u16,
            cancelled,
            elapsed_ms: elapsed_ms.min(u32::MAX as u64) as u32,
            sessions: stats.sessions,
            total: stats.sightings,
        }
    }
}

/// Commands sent from the host to the scanner.
///
/// Deserialized via [`RawCommand`] in `comm::parse_command()` because
/// `serde_json_core` does not support internally tagged enums.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    /// Resume periodic scan sessions
    Start,
    /// Stop scanning, cancelling a running session
    Stop,
    /// Request current status
    GetStatus,
    /// Update minimum RSSI threshold
    SetRssi { min_rssi: i8 },
    /// Replace the broadcast name prefix
    SetPrefix { prefix: Prefix },
    /// Change the session length
    SetDuration { duration_ms: u32 },
    /// Switch between active and passive scanning
    SetActive { active: bool },
    /// Select the event sightings are reported against
    SetEvent { event_id: EventId },
    /// Zero the session and sighting counters
    ResetStats,
}

/// Wire format for host commands: a flat struct that `serde_json_core` can
/// deserialize without `deserialize_any`.
#[derive(Deserialize)]
pub(crate) struct RawCommand {
    pub cmd: heapless::String<16>,
    #[serde(default)]
    pub min_rssi: Option<i8>,
    #[serde(default)]
    pub prefix: Option<Prefix>,
    #[serde(default)]
    pub duration_ms: Option<u32>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub event_id: Option<EventId>,
}

/// Firmware version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum size of a serialized JSON message
pub const MAX_MSG_LEN: usize = 512;

/// Buffer type for serialized JSON messages
pub type MsgBuffer = heapless::Vec<u8, MAX_MSG_LEN>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advert::NameString;
    use crate::filter::{IdSource, Identifier, MatchKind};

    fn to_json<'b>(msg: &DeviceMessage, buf: &'b mut [u8]) -> &'b str {
        let len = serde_json_core::to_slice(msg, buf).unwrap();
        core::str::from_utf8(&buf[..len]).unwrap()
    }

    fn sample_sighting() -> Sighting {
        Sighting {
            id: Identifier::try_from("ATT-USER-1A2B").unwrap(),
            name: NameString::try_from("Alice's phone").unwrap(),
            rssi: -63,
            addr: [0x24, 0x0A, 0xC4, 0x12, 0x34, 0x56],
            timestamp_ms: 123_456,
            source: IdSource::Manufacturer,
            matches: Matches::from_slice(&[MatchKind::NamePrefix, MatchKind::IdPrefix]).unwrap(),
        }
    }

    #[test]
    fn serialize_sighting_with_backend_field_names() {
        let s = sample_sighting();
        let event = EventId::try_from("evt_42").unwrap();
        let mut mac = MacString::new();
        let msg = DeviceMessage::sighting(&s, Some(&event), "ESP32-Scanner", &mut mac);
        let mut buf = [0u8; 384];
        let json = to_json(&msg, &mut buf);
        assert!(json.contains(r#""type":"sighting""#));
        assert!(json.contains(r#""eventId":"evt_42""#));
        assert!(json.contains(r#""bleUuid":"ATT-USER-1A2B""#));
        assert!(json.contains(r#""deviceName":"Alice's phone""#));
        assert!(json.contains(r#""rssi":-63"#));
        assert!(json.contains(r#""timestamp":123456"#));
        assert!(json.contains(r#""scannerId":"ESP32-Scanner""#));
        assert!(json.contains(r#""mac":"24:0A:C4:12:34:56""#));
        assert!(json.contains(r#""via":"mfr""#));
        assert!(json.contains(r#""match":["name_prefix","id_prefix"]"#));
    }

    #[test]
    fn longest_sighting_fits_message_buffer() {
        let mut s = sample_sighting();
        s.id = Identifier::try_from("ATT-".repeat(16).as_str()).unwrap();
        s.name = NameString::try_from("N".repeat(64).as_str()).unwrap();
        s.rssi = -100;
        s.timestamp_ms = u64::MAX;
        s.source = IdSource::ServiceData;
        s.matches =
            Matches::from_slice(&[MatchKind::ServiceUuid, MatchKind::NamePrefix, MatchKind::IdPrefix])
                .unwrap();
        let event = EventId::try_from("E".repeat(40).as_str()).unwrap();
        let mut mac = MacString::new();
        let msg = DeviceMessage::sighting(&s, Some(&event), "ESP32-Scanner", &mut mac);
        let mut buf = [0u8; MAX_MSG_LEN];
        assert!(to_json(&msg, &mut buf).ends_with(r#"["svc_uuid","name_prefix","id_prefix"]}"#));
    }

    #[test]
    fn sighting_without_event_omits_field() {
        let s = sample_sighting();
        let mut mac = MacString::new();
        let msg = DeviceMessage::sighting(&s, None, "ESP32-Scanner", &mut mac);
        let mut buf = [0u8; 384];
        assert!(!to_json(&msg, &mut buf).contains("eventId"));
    }

    #[test]
    fn serialize_session_summary() {
        let stats = ScanStats {
            sessions: 7,
            sightings: 19,
        };
        let msg = DeviceMessage::session(3, true, 420, stats);
        let mut buf = [0u8; 128];
        let json = to_json(&msg, &mut buf);
        assert!(json.contains(r#""type":"session""#));
        assert!(json.contains(r#""found":3"#));
        assert!(json.contains(r#""cancelled":true"#));
        assert!(json.contains(r#""elapsed_ms":420"#));
        assert!(json.contains(r#""sessions":7"#));
        assert!(json.contains(r#""total":19"#));
    }

    #[test]
    fn serialize_status_message() {
        let msg = DeviceMessage::Status {
            scanning: true,
            uptime: 120,
            heap_free: 48000,
            sessions: 4,
            sightings: 9,
            duration_ms: 1500,
            active: true,
            min_rssi: -80,
            prefix: "ATT-",
            event_id: None,
            board: "test_board",
            version: "0.1.0",
        };
        let mut buf = [0u8; 384];
        let json = to_json(&msg, &mut buf);
        assert!(json.contains(r#""type":"status""#));
        assert!(json.contains(r#""scanning":true"#));
        assert!(json.contains(r#""prefix":"ATT-""#));
        assert!(json.contains(r#""min_rssi":-80"#));
        assert!(json.contains(r#""board":"test_board""#));
        assert!(!json.contains("eventId"));
    }

    #[test]
    fn version_is_semver() {
        let parts: heapless::Vec<&str, 4> = VERSION.split('.').collect();
        assert_eq!(
            parts.len(),
            3,
            "VERSION should be semver (major.minor.patch)"
        );
        for part in &parts {
            assert!(part.parse::<u32>().is_ok(), "'{part}' is not a number");
        }
    }
}
