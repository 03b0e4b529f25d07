//! Beacon attendance library: portable BLE attendance scanning engine.
//!
//! Decides which BLE advertisements are attendance beacons, extracts their
//! identifiers and suppresses repeats within a dedup window. All parsing,
//! filtering, session and protocol logic lives here with no platform
//! dependencies, testable on any host with `cargo test`. Platform binaries
//! (Embassy firmware in `src/main.rs`, ESP-IDF firmware in `firmware-std/`)
//! are thin consumers that provide radio access, a clock and output sinks.
//!
//! Modules:
//! - `advert`: raw AD structure parsing into [`advert::Advertisement`]
//! - `filter`: RSSI gate, identifier extraction, attendance criteria
//! - `dedup`, `session`: windowed deduplication and the sans-IO session engine
//! - `scanner`: blocking session driver over the [`scanner::Radio`] and
//!   [`scanner::Clock`] traits
//! - `protocol`, `comm`: NDJSON reports and host commands
//! - `defaults`, `board`: compile-time configuration

#![cfg_attr(not(test), no_std)]

pub mod advert;
pub mod board;
pub mod comm;
pub mod dedup;
pub mod defaults;
pub mod filter;
pub mod protocol;
pub mod scanner;
pub mod session;

#[cfg(test)]
pub(crate) mod test_utils;
