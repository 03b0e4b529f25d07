/// Radio advertisement model and AD-structure parsing.
///
/// The radio stack hands over `(address, rssi, raw advertising bytes)`.
/// [`AdvParser`] turns that into an [`Advertisement`] holding only the fields
/// the attendance filter looks at. Parsing never fails: truncated structures
/// end the walk, oversized fields are dropped.
use heapless::{String, Vec};

use crate::defaults::BLUETOOTH_BASE_UUID;

/// Longest AD payload we keep (legacy advertising PDU limit).
pub const MAX_PAYLOAD_LEN: usize = 31;

/// Capacity for text decoded from radio bytes. Each byte may become a
/// two-byte UTF-8 character, so this is twice the payload limit plus slack.
pub const MAX_TEXT_LEN: usize = 64;

/// Service UUIDs kept per advertisement
pub const MAX_SERVICE_UUIDS: usize = 8;

/// 6-byte radio address, most significant byte first
pub type MacAddress = [u8; 6];

/// Raw manufacturer or service payload bytes
pub type Payload = Vec<u8, MAX_PAYLOAD_LEN>;

/// Broadcast name decoded from radio bytes
pub type NameString = String<MAX_TEXT_LEN>;

/// One received advertisement, reduced to what the filter needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub addr: MacAddress,
    pub rssi: i8,
    /// Shortened or complete local name
    pub name: Option<NameString>,
    /// Manufacturer-specific data, vendor id (2 bytes, little-endian) included
    pub manufacturer_data: Option<Payload>,
    /// Service data following its service UUID
    pub service_data: Option<Payload>,
    /// Declared service UUIDs, normalized to 128 bits
    pub service_uuids: Vec<u128, MAX_SERVICE_UUIDS>,
}

impl Advertisement {
    /// An advertisement with no optional fields.
    pub fn new(addr: MacAddress, rssi: i8) -> Self {
        Self {
            addr,
            rssi,
            name: None,
            manufacturer_data: None,
            service_data: None,
            service_uuids: Vec::new(),
        }
    }

    /// Broadcast name, or "" when absent.
    pub fn name_str(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    /// Whether the advertisement declares `uuid` in one of its UUID lists.
    pub fn advertises_service(&self, uuid: u128) -> bool {
        self.service_uuids.contains(&uuid)
    }
}

/// Expand a 16-bit UUID to its 128-bit form.
pub const fn uuid_from_16(short: u16) -> u128 {
    BLUETOOTH_BASE_UUID | ((short as u128) << 96)
}

/// Expand a 32-bit UUID to its 128-bit form.
pub const fn uuid_from_32(short: u32) -> u128 {
    BLUETOOTH_BASE_UUID | ((short as u128) << 96)
}

/// Decode radio bytes as text, one character per byte.
///
/// No encoding validation: bytes above 0x7F map to the matching Latin-1
/// character so garbled payloads still produce comparable text. Output is
/// truncated at capacity.
pub fn decode_text<const N: usize>(bytes: &[u8]) -> String<N> {
    let mut out = String::new();
    for &b in bytes {
        if out.push(char::from(b)).is_err() {
            break;
        }
    }
    out
}

/// Format a 6-byte address into "AA:BB:CC:DD:EE:FF"
pub fn format_mac(mac: &MacAddress, buf: &mut crate::protocol::MacString) {
    use core::fmt::Write;
    let _ = write!(
        buf,
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    );
}

/// Parser for BLE advertising data (AD structures).
///
/// AD structure format: [length] [type] [data...]
/// Types we care about:
///   0x02/0x03 = Incomplete/Complete list of 16-bit service UUIDs
///   0x04/0x05 = Incomplete/Complete list of 32-bit service UUIDs
///   0x06/0x07 = Incomplete/Complete list of 128-bit service UUIDs
///   0x08/0x09 = Shortened/Complete local name
///   0x16      = Service data, 16-bit UUID
///   0x20      = Service data, 32-bit UUID
///   0x21      = Service data, 128-bit UUID
///   0xFF      = Manufacturer specific data
pub struct AdvParser;

impl AdvParser {
    pub fn parse(addr: &MacAddress, rssi: i8, ad_data: &[u8]) -> Advertisement {
        let mut adv = Advertisement::new(*addr, rssi);

        let mut pos = 0;
        while pos < ad_data.len() {
            let len = ad_data[pos] as usize;
            if len == 0 || pos + 1 + len > ad_data.len() {
                break;
            }

            let ad_type = ad_data[pos + 1];
            let data = &ad_data[pos + 2..pos + 1 + len];

            match ad_type {
                0x02 | 0x03 => {
                    for chunk in data.chunks_exact(2) {
                        let short = u16::from_le_bytes([chunk[0], chunk[1]]);
                        let _ = adv.service_uuids.push(uuid_from_16(short));
                    }
                }
                0x04 | 0x05 => {
                    for chunk in data.chunks_exact(4) {
                        let short = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                        let _ = adv.service_uuids.push(uuid_from_32(short));
                    }
                }
                0x06 | 0x07 => {
                    for chunk in data.chunks_exact(16) {
                        if let Ok(bytes) = <[u8; 16]>::try_from(chunk) {
                            let _ = adv.service_uuids.push(u128::from_le_bytes(bytes));
                        }
                    }
                }
                0x08 | 0x09 => {
                    adv.name = Some(decode_text(data));
                }
                // First service data block wins; later ones are ignored
                0x16 => Self::set_service_data(&mut adv, data, 2),
                0x20 => Self::set_service_data(&mut adv, data, 4),
                0x21 => Self::set_service_data(&mut adv, data, 16),
                0xFF => {
                    adv.manufacturer_data = Vec::from_slice(data).ok();
                }
                _ => {}
            }

            pos += 1 + len;
        }

        adv
    }

    fn set_service_data(adv: &mut Advertisement, data: &[u8], uuid_len: usize) {
        if adv.service_data.is_some() || data.len() < uuid_len {
            return;
        }
        adv.service_data = Vec::from_slice(&data[uuid_len..]).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::ATTENDANCE_SERVICE_UUID;

    const ADDR: MacAddress = [0x24, 0x0A, 0xC4, 0x01, 0x02, 0x03];

    #[test]
    fn empty_data_yields_bare_advertisement() {
        let adv = AdvParser::parse(&ADDR, -50, &[]);
        assert_eq!(adv, Advertisement::new(ADDR, -50));
    }

    #[test]
    fn parses_complete_local_name() {
        let data = [0x0B, 0x09, b'A', b'T', b'T', b'-', b'B', b'a', b'd', b'g', b'e', b'7'];
        let adv = AdvParser::parse(&ADDR, -70, &data);
        assert_eq!(adv.name_str(), "ATT-Badge7");
    }

    #[test]
    fn manufacturer_data_keeps_vendor_id() {
        let data = [0x07, 0xFF, 0xFF, 0xFF, b'A', b'T', b'T', b'-'];
        let adv = AdvParser::parse(&ADDR, -60, &data);
        assert_eq!(
            adv.manufacturer_data.as_deref(),
            Some(&[0xFF, 0xFF, b'A', b'T', b'T', b'-'][..])
        );
    }

    #[test]
    fn service_data_strips_16_bit_uuid() {
        let data = [0x08, 0x16, 0xF0, 0xFF, b'A', b'T', b'T', b'-', b'9'];
        let adv = AdvParser::parse(&ADDR, -60, &data);
        assert_eq!(adv.service_data.as_deref(), Some(&b"ATT-9"[..]));
    }

    #[test]
    fn first_service_data_block_wins() {
        let data = [
            0x04, 0x16, 0x01, 0x02, b'A', //
            0x04, 0x16, 0x03, 0x04, b'B',
        ];
        let adv = AdvParser::parse(&ADDR, -60, &data);
        assert_eq!(adv.service_data.as_deref(), Some(&b"A"[..]));
    }

    #[test]
    fn short_service_uuid_expands_to_attendance_service() {
        let data = [0x03, 0x03, 0xF0, 0xFF];
        let adv = AdvParser::parse(&ADDR, -60, &data);
        assert!(adv.advertises_service(ATTENDANCE_SERVICE_UUID));
    }

    #[test]
    fn full_128_bit_uuid_is_little_endian() {
        let mut data = [0u8; 18];
        data[0] = 17;
        data[1] = 0x07;
        data[2..].copy_from_slice(&ATTENDANCE_SERVICE_UUID.to_le_bytes());
        let adv = AdvParser::parse(&ADDR, -60, &data);
        assert_eq!(adv.service_uuids.as_slice(), &[ATTENDANCE_SERVICE_UUID]);
    }

    #[test]
    fn truncated_structure_stops_parsing() {
        // Name is fine, second structure claims 10 bytes but only has 2
        let data = [0x03, 0x09, b'O', b'K', 0x0A, 0xFF, 0x01];
        let adv = AdvParser::parse(&ADDR, -60, &data);
        assert_eq!(adv.name_str(), "OK");
        assert!(adv.manufacturer_data.is_none());
    }

    #[test]
    fn non_ascii_name_bytes_decode_without_validation() {
        let data = [0x04, 0x09, b'A', 0xE9, 0xFF];
        let adv = AdvParser::parse(&ADDR, -60, &data);
        assert_eq!(adv.name_str(), "A\u{e9}\u{ff}");
    }

    #[test]
    fn uuid_expansion_matches_base() {
        assert_eq!(uuid_from_16(0xFFF0), ATTENDANCE_SERVICE_UUID);
        assert_eq!(uuid_from_32(0x0000_FFF0), ATTENDANCE_SERVICE_UUID);
    }

    #[test]
    fn format_mac_uppercase_colon_separated() {
        let mut s = crate::protocol::MacString::new();
        format_mac(&ADDR, &mut s);
        assert_eq!(s.as_str(), "24:0A:C4:01:02:03");
    }
}
