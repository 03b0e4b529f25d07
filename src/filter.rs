/// Attendance filter for BLE advertisements.
///
/// Decides whether an advertisement is a plausible attendance credential and
/// extracts its identifier. Stateless: duplicate suppression happens in
/// [`crate::dedup`], after the filter has accepted a candidate.
use heapless::{String, Vec};
use serde::Serialize;

use crate::advert::{decode_text, Advertisement, MAX_TEXT_LEN};
use crate::defaults::{ATTENDANCE_PREFIX, ATTENDANCE_SERVICE_UUID, DEFAULT_NAME_PREFIX, MIN_RSSI};

/// Longest configurable name prefix
pub const MAX_PREFIX_LEN: usize = 16;

/// Canonical attendance identifier, e.g. `ATT-USER-1A2B3C4D`
pub type Identifier = String<MAX_TEXT_LEN>;

/// Name filter prefix
pub type Prefix = String<MAX_PREFIX_LEN>;

/// Rejected configuration change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("filter prefix longer than 16 bytes")]
    PrefixTooLong,
    #[error("scan duration {0} ms out of range")]
    DurationOutOfRange(u32),
}

/// Runtime filter configuration. Adjustable from the host without
/// reflashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterConfig {
    /// Minimum RSSI (dBm). Weaker signals are dropped before any parsing.
    pub min_rssi: i8,
    /// Broadcast name prefix that marks an attendance beacon
    pub prefix: Prefix,
}

impl FilterConfig {
    pub fn new() -> Self {
        let mut prefix = Prefix::new();
        let _ = prefix.push_str(DEFAULT_NAME_PREFIX);
        Self {
            min_rssi: MIN_RSSI,
            prefix,
        }
    }

    /// Replace the name prefix. An empty prefix disables name matching.
    pub fn set_prefix(&mut self, prefix: &str) -> Result<(), ConfigError> {
        let next = Prefix::try_from(prefix).map_err(|_| ConfigError::PrefixTooLong)?;
        self.prefix = next;
        Ok(())
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Which advertisement field produced the identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSource {
    Manufacturer,
    ServiceData,
    Name,
}

impl IdSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdSource::Manufacturer => "mfr",
            IdSource::ServiceData => "svc_data",
            IdSource::Name => "name",
        }
    }
}

/// Why an advertisement counts as an attendance beacon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchKind {
    /// Declares the attendance service UUID
    #[serde(rename = "svc_uuid")]
    ServiceUuid,
    /// Broadcast name starts with the configured prefix
    #[serde(rename = "name_prefix")]
    NamePrefix,
    /// Extracted identifier starts with `ATT-`
    #[serde(rename = "id_prefix")]
    IdPrefix,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::ServiceUuid => "svc_uuid",
            MatchKind::NamePrefix => "name_prefix",
            MatchKind::IdPrefix => "id_prefix",
        }
    }
}

/// Match reasons of one candidate, in check order
pub type Matches = Vec<MatchKind, 3>;

/// Why an advertisement did not produce a sighting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Below the RSSI floor
    WeakSignal,
    /// No encoding produced a non-empty identifier
    NoIdentifier,
    /// Identifier found, but nothing marks this as an attendance beacon
    NotAttendance,
    /// Identifier already seen in the current dedup window
    Duplicate,
    /// Session sighting buffer is full
    SessionFull,
    /// Dedup set has no room left in this window
    DedupFull,
    /// Delivered while no session was open
    Idle,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::WeakSignal => "weak_signal",
            Rejection::NoIdentifier => "no_identifier",
            Rejection::NotAttendance => "not_attendance",
            Rejection::Duplicate => "duplicate",
            Rejection::SessionFull => "session_full",
            Rejection::DedupFull => "dedup_full",
            Rejection::Idle => "idle",
        }
    }
}

/// An identifier together with the field it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub id: Identifier,
    pub source: IdSource,
}

/// An advertisement that passed the filter, pending dedup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: Identifier,
    pub source: IdSource,
    /// Every criterion that matched, in check order
    pub matches: Matches,
}

/// Extract the attendance identifier from an advertisement.
///
/// Encodings are tried in priority order, first hit wins:
/// 1. manufacturer data after the 2-byte vendor id, if it reads `ATT-...`
/// 2. service data, if it reads `ATT-...`
/// 3. the trimmed broadcast name, whatever it says
pub fn extract_identifier(adv: &Advertisement) -> Option<Extracted> {
    if let Some(data) = adv.manufacturer_data.as_deref() {
        if data.len() >= 2 {
            if let Some(id) = attendance_text(&data[2..]) {
                log::trace!("identifier {} from manufacturer data", id);
                return Some(Extracted {
                    id,
                    source: IdSource::Manufacturer,
                });
            }
        }
    }

    if let Some(data) = adv.service_data.as_deref() {
        if let Some(id) = attendance_text(data) {
            log::trace!("identifier {} from service data", id);
            return Some(Extracted {
                id,
                source: IdSource::ServiceData,
            });
        }
    }

    let name = adv.name_str().trim_matches(is_space_char);
    if name.is_empty() {
        return None;
    }
    Identifier::try_from(name).ok().map(|id| Extracted {
        id,
        source: IdSource::Name,
    })
}

/// Evaluate one advertisement against the filter.
///
/// Checks run cheapest first: RSSI, then identifier extraction, then the
/// attendance criteria. Dedup is the caller's job.
pub fn filter_advertisement(adv: &Advertisement, config: &FilterConfig) -> Result<Candidate, Rejection> {
    if adv.rssi < config.min_rssi {
        return Err(Rejection::WeakSignal);
    }

    let Extracted { id, source } = extract_identifier(adv).ok_or(Rejection::NoIdentifier)?;

    let mut matches = Vec::new();
    if adv.advertises_service(ATTENDANCE_SERVICE_UUID) {
        let _ = matches.push(MatchKind::ServiceUuid);
    }
    let name = adv.name_str();
    if !name.is_empty() && !config.prefix.is_empty() && name.starts_with(config.prefix.as_str()) {
        let _ = matches.push(MatchKind::NamePrefix);
    }
    if id.starts_with(ATTENDANCE_PREFIX) {
        let _ = matches.push(MatchKind::IdPrefix);
    }

    if matches.is_empty() {
        return Err(Rejection::NotAttendance);
    }

    Ok(Candidate { id, source, matches })
}

/// Decode a payload as text and keep it only if it is an attendance id.
fn attendance_text(bytes: &[u8]) -> Option<Identifier> {
    let trimmed = trim_space(bytes);
    if !trimmed.starts_with(ATTENDANCE_PREFIX.as_bytes()) {
        return None;
    }
    Some(decode_text(trimmed))
}

/// C `isspace` set: space, \t, \n, \v, \f, \r
fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | 0x0B | 0x0C | b'\r')
}

fn is_space_char(c: char) -> bool {
    u8::try_from(c).is_ok_and(is_space)
}

fn trim_space(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| !is_space(b)).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|&b| !is_space(b)).map_or(start, |i| i + 1);
    &bytes[start..end]
}
