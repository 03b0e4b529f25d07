//! Beacon attendance scanner: ESP-IDF std firmware
//!
//! Thread-based implementation using FreeRTOS threads and std::sync::mpsc
//! channels. Sessions run through the library's blocking `BeaconScanner`
//! over a NimBLE radio (esp32-nimble). Reports go out as NDJSON on the
//! serial console and BLE GATT notifications; commands come in on either.

use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use beacon_attendance::advert::{AdvParser, Advertisement};
use beacon_attendance::comm::{self, CommandOutcome, LineReader, ScanControls};
use beacon_attendance::protocol::{DeviceMessage, HostCommand, MacString, MsgBuffer, MAX_MSG_LEN, VERSION};
use beacon_attendance::scanner::{BeaconScanner, Clock, Radio, ScanMode};
use beacon_attendance::session::ScanStats;
use beacon_attendance::{board, defaults};

use esp_idf_svc::hal::gpio::{AnyOutputPin, Output, OutputPin, PinDriver};
use esp_idf_svc::hal::peripherals::Peripherals;
use esp_idf_svc::hal::task::block_on;
use esp_idf_svc::sys::esp_get_free_heap_size;

use esp32_nimble::utilities::BleUuid;
use esp32_nimble::{BLEAdvertisementData, BLEDevice, BLEScan, NimbleProperties};

type Led = PinDriver<'static, AnyOutputPin, Output>;

// ── Shared state ─────────────────────────────────────────────────────

/// Cancels the running session; polled every STOP_POLL_MS
static STOP: AtomicBool = AtomicBool::new(false);
static RESET_STATS: AtomicBool = AtomicBool::new(false);
static BLE_CLIENTS: AtomicU8 = AtomicU8::new(0);
static CONTROLS: Mutex<Option<ScanControls>> = Mutex::new(None);
static STATS: Mutex<ScanStats> = Mutex::new(ScanStats {
    sessions: 0,
    sightings: 0,
});

/// Radio scan thread forwards advertisements only while this is set
static LISTENING: AtomicBool = AtomicBool::new(false);
static ACTIVE_SCAN: AtomicBool = AtomicBool::new(true);

/// Boot time, captured once in main, used for uptime calculation.
static BOOT_INSTANT: Mutex<Option<Instant>> = Mutex::new(None);

fn uptime_secs() -> u32 {
    BOOT_INSTANT
        .lock()
        .ok()
        .and_then(|i| i.map(|boot| boot.elapsed().as_secs() as u32))
        .unwrap_or(0)
}

fn controls() -> ScanControls {
    CONTROLS
        .lock()
        .ok()
        .and_then(|c| c.clone())
        .unwrap_or_default()
}

fn stats() -> ScanStats {
    STATS.lock().map(|s| *s).unwrap_or_default()
}

fn publish(msg: &DeviceMessage, output_tx: &SyncSender<MsgBuffer>) {
    let mut buf = MsgBuffer::new();
    buf.resize_default(MAX_MSG_LEN).ok();
    match comm::serialize_message(msg, &mut buf) {
        Some(len) => {
            buf.truncate(len);
            if output_tx.try_send(buf).is_err() {
                log::warn!("Output channel full, message dropped");
            }
        }
        None => log::warn!("Message too large to serialize"),
    }
}

fn publish_status(output_tx: &SyncSender<MsgBuffer>) {
    let controls = controls();
    let heap_free = unsafe { esp_get_free_heap_size() };
    publish(&controls.status(stats(), uptime_secs(), heap_free), output_tx);
}

// ── Radio and clock ──────────────────────────────────────────────────

/// NimBLE radio behind the scanner's `Radio` trait.
///
/// A background thread runs short NimBLE scan rounds while `LISTENING` is
/// set and queues parsed advertisements; `poll` drains the queue on the
/// session thread.
struct NimbleRadio {
    adv_rx: Option<Receiver<Advertisement>>,
}

impl NimbleRadio {
    fn new() -> Self {
        Self { adv_rx: None }
    }
}

impl Radio for NimbleRadio {
    type Error = anyhow::Error;

    fn begin(&mut self) -> Result<(), Self::Error> {
        if self.adv_rx.is_some() {
            return Ok(());
        }
        let (adv_tx, adv_rx) = mpsc::sync_channel::<Advertisement>(16);
        thread::Builder::new()
            .name("blescan".into())
            .stack_size(4096)
            .spawn(move || ble_scan_thread(adv_tx))?;
        self.adv_rx = Some(adv_rx);
        log::info!("BLE scan thread spawned");
        Ok(())
    }

    fn end(&mut self) {
        LISTENING.store(false, Ordering::Relaxed);
    }

    fn start_scan(&mut self, mode: ScanMode) -> Result<(), Self::Error> {
        if self.adv_rx.is_none() {
            anyhow::bail!("radio not started");
        }
        // Drop anything queued by the tail of the previous round
        self.poll(&mut |_| {});
        ACTIVE_SCAN.store(mode.is_active(), Ordering::Relaxed);
        LISTENING.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn stop_scan(&mut self) {
        LISTENING.store(false, Ordering::Relaxed);
    }

    fn poll(&mut self, sink: &mut dyn FnMut(&Advertisement)) {
        let Some(rx) = &self.adv_rx else {
            return;
        };
        loop {
            match rx.try_recv() {
                Ok(adv) => sink(&adv),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    log::error!("BLE scan thread exited");
                    return;
                }
            }
        }
    }
}

struct StdClock {
    boot: Instant,
}

impl Clock for StdClock {
    fn now_ms(&self) -> u64 {
        self.boot.elapsed().as_millis() as u64
    }

    fn sleep_ms(&self, ms: u32) {
        thread::sleep(Duration::from_millis(ms as u64));
    }
}

// ── Entry point ──────────────────────────────────────────────────────

/// Drive the standby LED to its "on" level for this board.
#[cfg(any(feature = "devkit", feature = "xiao"))]
fn standby_led(mut led: Led) -> anyhow::Result<Led> {
    if board::STANDBY_LED_ACTIVE_LOW {
        led.set_low()?;
    } else {
        led.set_high()?;
    }
    if let Some(pin) = board::STANDBY_LED_PIN {
        log::info!("Standby LED on GPIO{}", pin);
    }
    Ok(led)
}

fn main() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    // Bind the ESP-IDF logger to the `log` facade
    esp_idf_svc::log::EspLogger::initialize_default();

    let boot = Instant::now();
    if let Ok(mut b) = BOOT_INSTANT.lock() {
        *b = Some(boot);
    }
    if let Ok(mut c) = CONTROLS.lock() {
        *c = Some(ScanControls::new());
    }

    log::info!("Beacon attendance v{} starting on {} (std)", VERSION, board::BOARD_NAME);

    let peripherals = Peripherals::take()?;

    // Standby LED stays on while powered
    #[cfg(feature = "devkit")]
    let _standby_led = standby_led(PinDriver::output(peripherals.pins.gpio2.downgrade_output())?)?;
    #[cfg(feature = "xiao")]
    let _standby_led = standby_led(PinDriver::output(peripherals.pins.gpio21.downgrade_output())?)?;

    #[cfg(feature = "devkit")]
    let scanning_led: Option<Led> = {
        let mut led = PinDriver::output(peripherals.pins.gpio15.downgrade_output())?;
        led.set_low()?;
        Some(led)
    };
    #[cfg(not(feature = "devkit"))]
    let scanning_led: Option<Led> = None;
    if let Some(pin) = board::SCANNING_LED_PIN {
        log::info!("Scanning LED on GPIO{}", pin);
    }

    // ── Channels ─────────────────────────────────────────────────────

    let (output_tx, output_rx) = mpsc::sync_channel::<MsgBuffer>(8);
    let (ble_output_tx, ble_output_rx) = mpsc::sync_channel::<MsgBuffer>(4);
    let (cmd_tx, cmd_rx) = mpsc::sync_channel::<HostCommand>(4);

    // ── Threads ──────────────────────────────────────────────────────

    thread::Builder::new()
        .name("output".into())
        .stack_size(4096)
        .spawn(move || output_thread(output_rx, ble_output_tx))?;

    let cmd_output_tx = output_tx.clone();
    thread::Builder::new()
        .name("command".into())
        .stack_size(4096)
        .spawn(move || command_thread(cmd_rx, cmd_output_tx))?;

    let console_cmd_tx = cmd_tx.clone();
    thread::Builder::new()
        .name("console".into())
        .stack_size(4096)
        .spawn(move || console_thread(console_cmd_tx))?;

    let status_output_tx = output_tx.clone();
    thread::Builder::new()
        .name("status".into())
        .stack_size(4096)
        .spawn(move || status_thread(status_output_tx))?;

    let mut scanner = BeaconScanner::new(NimbleRadio::new(), StdClock { boot });
    scanner.initialize()?;

    let session_output_tx = output_tx.clone();
    thread::Builder::new()
        .name("session".into())
        .stack_size(8192)
        .spawn(move || session_thread(scanner, scanning_led, session_output_tx))?;
    log::info!("Session thread spawned");

    ble_main(cmd_tx, ble_output_rx)
}

// ── Session thread ───────────────────────────────────────────────────

fn session_thread(
    mut scanner: BeaconScanner<NimbleRadio, StdClock>,
    mut scanning_led: Option<Led>,
    output_tx: SyncSender<MsgBuffer>,
) {
    loop {
        let controls = controls();
        if !controls.scanning {
            thread::sleep(Duration::from_millis(defaults::STOP_POLL_MS as u64));
            continue;
        }
        if RESET_STATS.swap(false, Ordering::Relaxed) {
            scanner.reset_stats();
        }
        scanner.engine_mut().set_filter(controls.filter.clone());
        scanner.set_scan_mode(controls.settings.mode);
        if let Err(e) = scanner.set_scan_duration(controls.settings.duration_ms) {
            log::warn!("Keeping previous scan duration: {}", e);
        }
        STOP.store(false, Ordering::Relaxed);

        if let Some(led) = scanning_led.as_mut() {
            let _ = led.set_high();
        }
        let result = scanner.try_scan_session(&STOP);
        if let Some(led) = scanning_led.as_mut() {
            let _ = led.set_low();
        }

        match result {
            Ok(report) => {
                let mut mac = MacString::new();
                for sighting in &report.sightings {
                    let msg = DeviceMessage::sighting(
                        sighting,
                        controls.event_id.as_ref(),
                        defaults::SCANNER_ID,
                        &mut mac,
                    );
                    publish(&msg, &output_tx);
                }
                let summary = DeviceMessage::session(
                    report.sightings.len(),
                    report.cancelled,
                    report.elapsed_ms,
                    scanner.stats(),
                );
                publish(&summary, &output_tx);
            }
            Err(e) => {
                log::error!("Scan session failed: {}", e);
                thread::sleep(Duration::from_secs(1));
            }
        }
        store_stats(&mut scanner);

        wait_interval();
    }
}

/// Publish the scanner's counters, applying a reset that arrived while the
/// session ran. Holds the STATS lock so a concurrent reset cannot be lost.
fn store_stats(scanner: &mut BeaconScanner<NimbleRadio, StdClock>) {
    match STATS.lock() {
        Ok(mut s) => *s = scanner.settle_stats(&RESET_STATS),
        Err(_) => log::error!("Stats lock poisoned"),
    }
}

/// Idle between sessions, waking early on STOP.
fn wait_interval() {
    let until = Instant::now() + Duration::from_millis(defaults::SCAN_INTERVAL_MS as u64);
    while Instant::now() < until {
        if STOP.load(Ordering::Relaxed) {
            return;
        }
        thread::sleep(Duration::from_millis(defaults::STOP_POLL_MS as u64));
    }
}

// ── Output thread ────────────────────────────────────────────────────

fn output_thread(output_rx: Receiver<MsgBuffer>, ble_output_tx: SyncSender<MsgBuffer>) {
    log::info!("Output thread started");

    while let Ok(msg) = output_rx.recv() {
        if BLE_CLIENTS.load(Ordering::Relaxed) > 0 {
            let _ = ble_output_tx.try_send(msg.clone());
        }

        if let Ok(s) = std::str::from_utf8(&msg) {
            print!("{}", s);
        }
    }
}

// ── Status thread ────────────────────────────────────────────────────

fn status_thread(output_tx: SyncSender<MsgBuffer>) {
    loop {
        thread::sleep(Duration::from_secs(30));
        publish_status(&output_tx);
    }
}

// ── Command handling ─────────────────────────────────────────────────

fn command_thread(cmd_rx: Receiver<HostCommand>, output_tx: SyncSender<MsgBuffer>) {
    while let Ok(cmd) = cmd_rx.recv() {
        let outcome = match CONTROLS.lock() {
            Ok(mut slot) => comm::handle_command(&cmd, slot.get_or_insert_with(ScanControls::new)),
            Err(_) => {
                log::error!("Controls lock poisoned, command dropped");
                continue;
            }
        };

        match outcome {
            CommandOutcome::Updated => {}
            CommandOutcome::Stopped => STOP.store(true, Ordering::Relaxed),
            CommandOutcome::ReportStatus => publish_status(&output_tx),
            CommandOutcome::ResetStats => {
                if let Ok(mut s) = STATS.lock() {
                    RESET_STATS.store(true, Ordering::Relaxed);
                    *s = ScanStats::default();
                }
                log::info!("Counters reset by host command");
            }
            CommandOutcome::Rejected(e) => log::warn!("Host command rejected: {}", e),
        }
    }
}

/// Serial console reader: NDJSON commands typed or piped over USB serial.
fn console_thread(cmd_tx: SyncSender<HostCommand>) {
    let mut reader = LineReader::new();
    let mut stdin = std::io::stdin();
    let mut byte = [0u8; 1];
    loop {
        match stdin.read(&mut byte) {
            Ok(1) => {
                if let Some(line) = reader.feed(byte[0]) {
                    match comm::parse_command(line) {
                        Some(cmd) => {
                            let _ = cmd_tx.try_send(cmd);
                        }
                        None => log::warn!("Unparseable host command"),
                    }
                }
            }
            // Console is non-blocking; nothing pending
            _ => thread::sleep(Duration::from_millis(20)),
        }
    }
}

// ── BLE (NimBLE) GATT server ─────────────────────────────────────────

fn ble_main(cmd_tx: SyncSender<HostCommand>, ble_output_rx: Receiver<MsgBuffer>) -> anyhow::Result<()> {
    let ble_device = BLEDevice::take();
    let server = ble_device.get_server();

    // NimBLE restarts advertising on disconnect
    server.on_connect(|_server, desc| {
        log::info!("BLE client connected: {}", desc.address());
        BLE_CLIENTS.fetch_add(1, Ordering::Relaxed);
    });
    server.on_disconnect(|desc, _reason| {
        log::info!("BLE client disconnected: {}", desc.address());
        BLE_CLIENTS.fetch_sub(1, Ordering::Relaxed);
    });

    let service_uuid = BleUuid::from_uuid128_string(comm::ble_uuids::SERVICE)
        .map_err(|e| anyhow::anyhow!("invalid UUID {}: {:?}", comm::ble_uuids::SERVICE, e))?;
    let tx_uuid = BleUuid::from_uuid128_string(comm::ble_uuids::TX_CHAR)
        .map_err(|e| anyhow::anyhow!("invalid UUID {}: {:?}", comm::ble_uuids::TX_CHAR, e))?;
    let rx_uuid = BleUuid::from_uuid128_string(comm::ble_uuids::RX_CHAR)
        .map_err(|e| anyhow::anyhow!("invalid UUID {}: {:?}", comm::ble_uuids::RX_CHAR, e))?;

    let service = server.create_service(service_uuid);
    let tx_char = service.lock().create_characteristic(tx_uuid, NimbleProperties::NOTIFY);
    let rx_char = service.lock().create_characteristic(rx_uuid, NimbleProperties::WRITE);

    rx_char.lock().on_write(move |args| {
        thread_local! {
            static LINE_READER: std::cell::RefCell<LineReader> =
                const { std::cell::RefCell::new(LineReader::new()) };
        }
        LINE_READER.with(|lr| {
            let mut lr = lr.borrow_mut();
            for &byte in args.recv_data() {
                if let Some(line) = lr.feed(byte) {
                    if let Some(cmd) = comm::parse_command(line) {
                        let _ = cmd_tx.try_send(cmd);
                    }
                }
            }
        });
    });

    let mut adv_data = BLEAdvertisementData::new();
    adv_data.name(comm::BLE_ADV_NAME).add_service_uuid(service_uuid);
    ble_device
        .get_advertising()
        .lock()
        .set_data(&mut adv_data)
        .map_err(|e| anyhow::anyhow!("BLE advertising data failed: {:?}", e))?;
    ble_device
        .get_advertising()
        .lock()
        .start()
        .map_err(|e| anyhow::anyhow!("BLE advertising start failed: {:?}", e))?;
    log::info!("BLE advertising as '{}'", comm::BLE_ADV_NAME);

    // TX notify loop
    loop {
        match ble_output_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(msg) => {
                if BLE_CLIENTS.load(Ordering::Relaxed) == 0 {
                    continue;
                }
                for chunk in msg.chunks(comm::BLE_MAX_NOTIFY) {
                    let mut padded = [b'\n'; 20];
                    padded[..chunk.len()].copy_from_slice(chunk);
                    tx_char.lock().set_value(&padded).notify();
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                anyhow::bail!("BLE output channel disconnected")
            }
        }
    }
}

// ── BLE scan thread ──────────────────────────────────────────────────

/// Round length; bounds how long the radio keeps scanning after a stop
const SCAN_ROUND_MS: i32 = 500;

fn ble_scan_thread(adv_tx: SyncSender<Advertisement>) {
    log::info!("BLE scan thread started");

    let ble_device = BLEDevice::take();
    let mut scan = BLEScan::new();

    loop {
        if !LISTENING.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(10));
            continue;
        }
        scan.active_scan(ACTIVE_SCAN.load(Ordering::Relaxed))
            .interval(defaults::RADIO_SCAN_INTERVAL_MS)
            .window(defaults::RADIO_SCAN_WINDOW_MS);

        let result = block_on(scan.start(ble_device, SCAN_ROUND_MS, |device, data| {
            if !LISTENING.load(Ordering::Relaxed) {
                return Some(());
            }
            let addr = device.addr().as_be_bytes();
            let adv = AdvParser::parse(&addr, device.rssi(), data.payload());
            if adv_tx.try_send(adv).is_err() {
                log::debug!("Advertisement queue full, report dropped");
            }
            None::<()>
        }));
        if let Err(e) = result {
            log::error!("NimBLE scan error: {:?}", e);
            thread::sleep(Duration::from_millis(500));
        }
    }
}
