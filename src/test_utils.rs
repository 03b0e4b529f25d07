//! Shared fixtures for unit tests: advertisement builder, a scripted radio
//! and a virtual clock.

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::vec::Vec as StdVec;

use heapless::Vec;

use crate::advert::{uuid_from_16, Advertisement, MacAddress, NameString};
use crate::scanner::{Clock, Radio, ScanMode};

/// A stable radio address for unit tests.
pub const TEST_MAC: MacAddress = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];

/// Builds an [`Advertisement`] field by field.
pub struct AdvBuilder {
    adv: Advertisement,
}

impl AdvBuilder {
    pub fn new(rssi: i8) -> Self {
        Self {
            adv: Advertisement::new(TEST_MAC, rssi),
        }
    }

    pub fn addr(mut self, addr: MacAddress) -> Self {
        self.adv.addr = addr;
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.adv.name = Some(NameString::try_from(name).unwrap());
        self
    }

    pub fn manufacturer(mut self, data: &[u8]) -> Self {
        self.adv.manufacturer_data = Some(Vec::from_slice(data).unwrap());
        self
    }

    pub fn service_data(mut self, data: &[u8]) -> Self {
        self.adv.service_data = Some(Vec::from_slice(data).unwrap());
        self
    }

    pub fn service_uuid16(mut self, uuid: u16) -> Self {
        self.adv.service_uuids.push(uuid_from_16(uuid)).unwrap();
        self
    }

    pub fn build(self) -> Advertisement {
        self.adv
    }
}

/// Name-only attendance beacon at the given RSSI.
pub fn badge(name: &str, rssi: i8) -> Advertisement {
    AdvBuilder::new(rssi).name(name).build()
}

/// Clock that only moves when someone sleeps or the test advances it.
#[derive(Default)]
pub struct VirtualClock {
    now: Cell<u64>,
    sleeps: Cell<u32>,
}

impl VirtualClock {
    pub fn at(now_ms: u64) -> Self {
        Self {
            now: Cell::new(now_ms),
            sleeps: Cell::new(0),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }

    pub fn sleeps(&self) -> u32 {
        self.sleeps.get()
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn sleep_ms(&self, ms: u32) {
        self.sleeps.set(self.sleeps.get() + 1);
        self.advance(ms as u64);
    }
}

impl Clock for &VirtualClock {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }

    fn sleep_ms(&self, ms: u32) {
        (**self).sleep_ms(ms)
    }
}

/// Radio that replays a script of advertisements.
///
/// Each scripted advertisement becomes visible on the `n`-th poll of a scan
/// (0 = first poll after start). Polls while not scanning deliver nothing.
#[derive(Default)]
pub struct ScriptedRadio {
    pub fail_begin: bool,
    pub fail_start: bool,
    pub began: bool,
    pub scanning: bool,
    pub starts: u32,
    pub stops: u32,
    pub last_mode: Option<ScanMode>,
    /// Raise this flag on the given poll, as a host stop command would
    pub cancel_at: Option<(u32, Arc<AtomicBool>)>,
    script: StdVec<(u32, Advertisement)>,
    poll_count: u32,
}

impl ScriptedRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `adv` on poll `at_poll` of the next scan.
    pub fn deliver(&mut self, at_poll: u32, adv: Advertisement) {
        self.script.push((at_poll, adv));
    }

    pub fn pending(&self) -> usize {
        self.script.len()
    }
}

#[derive(Debug, PartialEq)]
pub struct FakeRadioError;

impl Radio for ScriptedRadio {
    type Error = FakeRadioError;

    fn begin(&mut self) -> Result<(), Self::Error> {
        if self.fail_begin {
            return Err(FakeRadioError);
        }
        self.began = true;
        Ok(())
    }

    fn end(&mut self) {
        self.began = false;
    }

    fn start_scan(&mut self, mode: ScanMode) -> Result<(), Self::Error> {
        if self.fail_start {
            return Err(FakeRadioError);
        }
        self.scanning = true;
        self.starts += 1;
        self.last_mode = Some(mode);
        self.poll_count = 0;
        Ok(())
    }

    fn stop_scan(&mut self) {
        self.scanning = false;
        self.stops += 1;
    }

    fn poll(&mut self, sink: &mut dyn FnMut(&Advertisement)) {
        if !self.scanning {
            return;
        }
        let poll = self.poll_count;
        self.poll_count += 1;
        if let Some((at, flag)) = &self.cancel_at {
            if *at == poll {
                flag.store(true, Ordering::Relaxed);
            }
        }
        let (due, later): (StdVec<_>, StdVec<_>) =
            self.script.drain(..).partition(|(at, _)| *at <= poll);
        self.script = later;
        for (_, adv) in &due {
            sink(adv);
        }
    }
}
