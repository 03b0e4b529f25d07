//! Beacon attendance scanner: bare-metal Embassy firmware
//!
//! Runs timed BLE scan sessions, keeps only attendance beacons, drops
//! identifiers already seen in the dedup window and emits each new sighting
//! as NDJSON over serial and BLE GATT notifications.
//!
//! A gateway or companion app forwards sightings to the attendance backend
//! and sends host commands back over the GATT RX characteristic.

#![no_std]
#![no_main]

use esp_backtrace as _;

esp_bootloader_esp_idf::esp_app_desc!();

use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use critical_section::Mutex;
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant, Timer};
use esp_hal::gpio::{Level, Output, OutputConfig};
use esp_hal::interrupt::software::SoftwareInterruptControl;
use esp_hal::timer::timg::TimerGroup;
use static_cell::StaticCell;

use trouble_host::prelude::*;

use beacon_attendance::advert::{self, AdvParser};
use beacon_attendance::comm::{self, CommandOutcome, LineReader, ScanControls};
use beacon_attendance::defaults;
use beacon_attendance::protocol::{DeviceMessage, HostCommand, MacString, MsgBuffer, MAX_MSG_LEN, VERSION};
use beacon_attendance::session::{ScanEngine, ScanStats, Sighting};
use beacon_attendance::board;

// ── BLE GATT server definition ──────────────────────────────────────
//
// UUID literals mirror comm::ble_uuids; proc macros require literals.

#[gatt_service(uuid = "6b1a0001-3f5e-4c52-9d0a-8a7e2b41c0de")]
struct ScannerGattService {
    /// TX: NDJSON reports, notify-only.
    /// Messages are chunked into BLE_MAX_NOTIFY-sized pieces; the
    /// gateway accumulates until it sees '\n'.
    #[characteristic(uuid = "6b1a0002-3f5e-4c52-9d0a-8a7e2b41c0de", notify)]
    tx: [u8; 20],

    /// RX: host commands, write-only, accumulated via LineReader.
    #[characteristic(uuid = "6b1a0003-3f5e-4c52-9d0a-8a7e2b41c0de", write)]
    rx: [u8; 20],
}

#[gatt_server]
struct ScannerServer {
    scanner_service: ScannerGattService,
}

// ── Channel type aliases ──────────────────────────────────────────────

type AdvChannel = Channel<CriticalSectionRawMutex, advert::Advertisement, 16>;
type OutputChannel = Channel<CriticalSectionRawMutex, MsgBuffer, 8>;
type BleOutputChannel = Channel<CriticalSectionRawMutex, MsgBuffer, 4>;
type CommandChannel = Channel<CriticalSectionRawMutex, HostCommand, 4>;

// ── Static channels and shared state ─────────────────────────────────

/// Parsed advertisements from the BLE runner to the scan loop
static ADV_CHANNEL: AdvChannel = Channel::new();

/// Serialized output messages
static OUTPUT_CHANNEL: OutputChannel = Channel::new();

/// Host commands from the GATT RX characteristic
static CMD_CHANNEL: CommandChannel = Channel::new();

/// Copies of output messages for GATT notifications
static BLE_OUTPUT_CHANNEL: BleOutputChannel = Channel::new();

/// Runtime controls, written by the command task and snapshotted by the
/// scan loop at the top of each session.
static CONTROLS: Mutex<RefCell<Option<ScanControls>>> = Mutex::new(RefCell::new(None));

/// Counters published by the scan loop for status reports
static STATS: Mutex<Cell<ScanStats>> = Mutex::new(Cell::new(ScanStats {
    sessions: 0,
    sightings: 0,
}));

/// Cancels the running session; polled every STOP_POLL_MS
static STOP: AtomicBool = AtomicBool::new(false);

/// Counter reset requested by the host, applied by the scan loop
static RESET_STATS: AtomicBool = AtomicBool::new(false);

/// Number of connected BLE clients
static BLE_CLIENTS: AtomicU8 = AtomicU8::new(0);

fn controls() -> ScanControls {
    critical_section::with(|cs| CONTROLS.borrow(cs).borrow().clone().unwrap_or_default())
}

fn stats() -> ScanStats {
    critical_section::with(|cs| STATS.borrow(cs).get())
}

fn now_ms() -> u64 {
    Instant::now().as_millis()
}

/// Serialize and queue a message for serial + BLE output. Drops it if the
/// output channel is full.
fn publish(msg: &DeviceMessage) {
    let mut buf = MsgBuffer::new();
    buf.resize_default(MAX_MSG_LEN).ok();
    match comm::serialize_message(msg, &mut buf) {
        Some(len) => {
            buf.truncate(len);
            if OUTPUT_CHANNEL.try_send(buf).is_err() {
                log::warn!("Output channel full, message dropped");
            }
        }
        None => log::warn!("Message too large to serialize"),
    }
}

fn publish_sighting(sighting: &Sighting, controls: &ScanControls) {
    let mut mac = MacString::new();
    let msg = DeviceMessage::sighting(
        sighting,
        controls.event_id.as_ref(),
        defaults::SCANNER_ID,
        &mut mac,
    );
    publish(&msg);
}

fn publish_status() {
    let controls = controls();
    let uptime_secs = (now_ms() / 1000) as u32;
    let msg = controls.status(stats(), uptime_secs, esp_alloc::HEAP.free() as u32);
    publish(&msg);
}

// ── BLE scan event handler ───────────────────────────────────────────

/// EventHandler for BLE advertisement reports from trouble-host.
///
/// Called synchronously from the runner, so it only parses and queues;
/// filtering and dedup happen on the scan loop.
struct ScanEventHandler;

impl EventHandler for ScanEventHandler {
    fn on_adv_reports(&self, mut it: LeAdvReportsIter<'_>) {
        while let Some(Ok(report)) = it.next() {
            let Ok(addr) = <[u8; 6]>::try_from(report.addr.raw()) else {
                continue;
            };
            let adv = AdvParser::parse(&addr, report.rssi, report.data);
            if ADV_CHANNEL.try_send(adv).is_err() {
                log::debug!("Advertisement queue full, report dropped");
            }
        }
    }
}

// ── Entry point ──────────────────────────────────────────────────────

#[esp_rtos::main]
async fn main(spawner: embassy_executor::Spawner) {
    esp_println::logger::init_logger_from_env();

    let peripherals = esp_hal::init(esp_hal::Config::default());

    // BLE controller + host need heap; ESP32 is tighter on DRAM
    #[cfg(feature = "esp32")]
    {
        esp_alloc::heap_allocator!(size: 64 * 1024);
    }
    #[cfg(not(feature = "esp32"))]
    {
        esp_alloc::heap_allocator!(size: 96 * 1024);
    }

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_int = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start(timg0.timer0, sw_int.software_interrupt0);

    log::info!("Beacon attendance v{} starting on {}", VERSION, board::BOARD_NAME);

    critical_section::with(|cs| *CONTROLS.borrow(cs).borrow_mut() = Some(ScanControls::new()));

    // Standby LED stays on while powered
    let standby_on = Level::from(!board::STANDBY_LED_ACTIVE_LOW);
    #[cfg(feature = "board-devkit")]
    let _standby_led = Output::new(peripherals.GPIO2, standby_on, OutputConfig::default());
    #[cfg(feature = "board-xiao")]
    let _standby_led = Output::new(peripherals.GPIO21, standby_on, OutputConfig::default());
    if let Some(pin) = board::STANDBY_LED_PIN {
        log::info!("Standby LED on GPIO{}", pin);
    }

    #[cfg(feature = "board-devkit")]
    let mut scanning_led = Some(Output::new(peripherals.GPIO15, Level::Low, OutputConfig::default()));
    #[cfg(not(feature = "board-devkit"))]
    let mut scanning_led: Option<Output<'static>> = None;
    if let Some(pin) = board::SCANNING_LED_PIN {
        log::info!("Scanning LED on GPIO{}", pin);
    }

    spawner.spawn(output_serial_task()).unwrap();
    spawner.spawn(status_task()).unwrap();
    spawner.spawn(command_task()).unwrap();

    log::info!(
        "Filter: min RSSI {} dBm, prefix '{}', service {:032x}",
        defaults::MIN_RSSI,
        defaults::DEFAULT_NAME_PREFIX,
        defaults::ATTENDANCE_SERVICE_UUID
    );

    // ── BLE radio initialization ───────────────────────────────────────

    let connector =
        esp_radio::ble::controller::BleConnector::new(peripherals.BT, Default::default())
            .expect("BLE connector init failed");

    let controller: ExternalController<_, 20> = ExternalController::new(connector);

    static HOST_RESOURCES: StaticCell<HostResources<DefaultPacketPool, 1, 2>> = StaticCell::new();
    let resources = HOST_RESOURCES.init(HostResources::new());

    let address = Address::random([0xff, 0x8f, 0x1a, 0x05, 0xe4, 0xac]);

    let stack = trouble_host::new(controller, resources).set_random_address(address);
    let Host {
        mut peripheral,
        central,
        mut runner,
        ..
    } = stack.build();

    log::info!("BLE radio initialized");

    let server = ScannerServer::new_with_config(GapConfig::Peripheral(PeripheralConfig {
        name: comm::BLE_ADV_NAME,
        appearance: &appearance::UNKNOWN,
    }))
    .expect("GATT server init failed");

    let scan_handler = ScanEventHandler;

    // ── BLE orchestration ──────────────────────────────────────────────
    //
    //   1. BLE stack runner (drives HCI, delivers scan reports to handler)
    //   2. Session loop (timed scans through the ScanEngine)
    //   3. GATT server (advertise, accept connections, send notifications)

    let _ = embassy_futures::join::join3(
        async {
            loop {
                if let Err(e) = runner.run_with_handler(&scan_handler).await {
                    log::error!("BLE runner error: {:?}", e);
                    Timer::after(Duration::from_secs(1)).await;
                }
            }
        },
        async {
            let mut scanner = trouble_host::scan::Scanner::new(central);
            let mut engine = ScanEngine::new(now_ms());
            loop {
                let controls = controls();
                if !controls.scanning {
                    Timer::after(Duration::from_millis(defaults::STOP_POLL_MS as u64)).await;
                    continue;
                }
                if RESET_STATS.swap(false, Ordering::Relaxed) {
                    engine.reset_stats();
                }
                engine.set_filter(controls.filter.clone());
                STOP.store(false, Ordering::Relaxed);

                // Reports left over from before the session belong to no one
                while ADV_CHANNEL.try_receive().is_ok() {}

                let session = match scanner.scan(&scan_config(&controls)).await {
                    Ok(session) => session,
                    Err(e) => {
                        log::error!("BLE scan failed to start: {:?}", e);
                        Timer::after(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                let started = Instant::now();
                let cancelled =
                    collect_sightings(&mut engine, &controls, started, scanning_led.as_mut()).await;
                drop(session);
                finish_session(&mut engine, &controls, started, cancelled, scanning_led.as_mut());
                critical_section::with(|cs| STATS.borrow(cs).set(engine.settle_stats(&RESET_STATS)));

                wait_interval().await;
            }
        },
        async {
            loop {
                let mut adv_data = [0u8; 31];
                let adv_len = match AdStructure::encode_slice(
                    &[
                        AdStructure::Flags(LE_GENERAL_DISCOVERABLE | BR_EDR_NOT_SUPPORTED),
                        AdStructure::CompleteLocalName(comm::BLE_ADV_NAME.as_bytes()),
                    ],
                    &mut adv_data[..],
                ) {
                    Ok(len) => len,
                    Err(e) => {
                        log::error!("Ad encode error: {:?}", e);
                        Timer::after(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let advertiser = match peripheral
                    .advertise(
                        &Default::default(),
                        Advertisement::ConnectableScannableUndirected {
                            adv_data: &adv_data[..adv_len],
                            scan_data: &[],
                        },
                    )
                    .await
                {
                    Ok(adv) => adv,
                    Err(e) => {
                        log::error!("BLE advertise error: {:?}", e);
                        Timer::after(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                log::info!("BLE advertising as '{}'", comm::BLE_ADV_NAME);

                let conn = match advertiser.accept().await {
                    Ok(c) => c,
                    Err(e) => {
                        log::error!("BLE accept error: {:?}", e);
                        continue;
                    }
                };

                let gatt_conn = match conn.with_attribute_server(&server) {
                    Ok(gc) => gc,
                    Err(e) => {
                        log::error!("GATT setup error: {:?}", e);
                        continue;
                    }
                };

                log::info!("BLE client connected");
                BLE_CLIENTS.fetch_add(1, Ordering::Relaxed);

                handle_gatt_connection(&gatt_conn, &server).await;

                BLE_CLIENTS.fetch_sub(1, Ordering::Relaxed);
                log::info!("BLE client disconnected, re-advertising");
            }
        },
    )
    .await;
}

fn scan_config(controls: &ScanControls) -> ScanConfig<'static> {
    ScanConfig {
        active: controls.settings.mode.is_active(),
        interval: Duration::from_millis(defaults::RADIO_SCAN_INTERVAL_MS as u64),
        window: Duration::from_millis(defaults::RADIO_SCAN_WINDOW_MS as u64),
        ..Default::default()
    }
}

/// Feed queued advertisements to the engine until the session duration
/// runs out or STOP is raised. The radio must already be scanning.
/// Returns true when cancelled.
async fn collect_sightings(
    engine: &mut ScanEngine,
    controls: &ScanControls,
    started: Instant,
    led: Option<&mut Output<'static>>,
) -> bool {
    let deadline = started + Duration::from_millis(controls.settings.duration_ms as u64);
    let poll = Duration::from_millis(defaults::STOP_POLL_MS as u64);
    engine.begin_session(now_ms());
    if let Some(led) = led {
        led.set_high();
    }
    log::info!(
        "Session {} started ({} ms, {})",
        engine.stats().sessions,
        controls.settings.duration_ms,
        controls.settings.mode.as_str()
    );

    let adv_rx = ADV_CHANNEL.receiver();
    loop {
        if STOP.load(Ordering::Relaxed) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let wait = (deadline - now).min(poll);
        if let Either::First(adv) = select(adv_rx.receive(), Timer::after(wait)).await {
            if let Ok(sighting) = engine.offer(&adv, now_ms()) {
                publish_sighting(sighting, controls);
            }
        }
    }
}

/// Drain what arrived before the radio stopped, close the session and
/// report it.
fn finish_session(
    engine: &mut ScanEngine,
    controls: &ScanControls,
    started: Instant,
    cancelled: bool,
    led: Option<&mut Output<'static>>,
) {
    while let Ok(adv) = ADV_CHANNEL.try_receive() {
        if let Ok(sighting) = engine.offer(&adv, now_ms()) {
            publish_sighting(sighting, controls);
        }
    }

    let found = engine.end_session();
    if let Some(led) = led {
        led.set_low();
    }
    let elapsed_ms = started.elapsed().as_millis();
    if cancelled {
        log::info!("Session cancelled after {} ms, {} found", elapsed_ms, found.len());
    } else {
        log::info!("Session complete, {} found", found.len());
    }
    publish(&DeviceMessage::session(found.len(), cancelled, elapsed_ms, engine.stats()));
}

/// Idle between sessions, waking early on STOP or a scanning toggle.
async fn wait_interval() {
    let poll = Duration::from_millis(defaults::STOP_POLL_MS as u64);
    let until = Instant::now() + Duration::from_millis(defaults::SCAN_INTERVAL_MS as u64);
    while Instant::now() < until {
        if STOP.load(Ordering::Relaxed) {
            return;
        }
        Timer::after(poll).await;
    }
}

/// Handle a GATT connection: forward output messages as notifications
/// and process incoming writes as host commands.
async fn handle_gatt_connection<'s, P: PacketPool>(
    conn: &GattConnection<'_, 's, P>,
    server: &'s ScannerServer<'_>,
) {
    let ble_rx = BLE_OUTPUT_CHANNEL.receiver();
    let mut line_reader = LineReader::new();

    loop {
        match select(ble_rx.receive(), conn.next()).await {
            Either::First(msg) => {
                // Pad with newlines so the gateway's NDJSON parser sees
                // empty lines instead of null bytes.
                for chunk in msg.chunks(comm::BLE_MAX_NOTIFY) {
                    let mut padded = [b'\n'; 20];
                    padded[..chunk.len()].copy_from_slice(chunk);
                    if server
                        .scanner_service
                        .tx
                        .notify(conn, &padded)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Either::Second(event) => match event {
                GattConnectionEvent::Disconnected { .. } => return,
                GattConnectionEvent::Gatt { event } => {
                    if let GattEvent::Write(ref write_event) = event {
                        if write_event.handle() == server.scanner_service.rx.handle {
                            for &byte in write_event.data() {
                                if let Some(line) = line_reader.feed(byte) {
                                    match comm::parse_command(line) {
                                        Some(cmd) => {
                                            let _ = CMD_CHANNEL.try_send(cmd);
                                        }
                                        None => log::warn!("Unparseable host command"),
                                    }
                                }
                            }
                        }
                    }
                    // Every GATT event needs a reply
                    if let Ok(reply) = event.accept() {
                        reply.send().await;
                    }
                }
                _ => {}
            },
        }
    }
}

/// Serial output task: logs each message and forwards a copy to the BLE
/// output channel.
#[embassy_executor::task]
async fn output_serial_task() {
    log::info!("Serial output task started");

    let output_rx = OUTPUT_CHANNEL.receiver();

    loop {
        let msg = output_rx.receive().await;

        if BLE_CLIENTS.load(Ordering::Relaxed) > 0 {
            let _ = BLE_OUTPUT_CHANNEL.try_send(msg.clone());
        }

        if let Ok(s) = core::str::from_utf8(&msg) {
            esp_println::print!("{}", s);
        }
    }
}

/// Periodic status reporting task
#[embassy_executor::task]
async fn status_task() {
    loop {
        Timer::after(Duration::from_secs(30)).await;
        publish_status();
    }
}

/// Host command processing task: applies commands to the shared controls
/// and carries out whatever the scan loop cannot do itself.
#[embassy_executor::task]
async fn command_task() {
    let cmd_rx = CMD_CHANNEL.receiver();

    loop {
        let cmd = cmd_rx.receive().await;

        let outcome = critical_section::with(|cs| {
            let mut slot = CONTROLS.borrow(cs).borrow_mut();
            let controls = slot.get_or_insert_with(ScanControls::new);
            comm::handle_command(&cmd, controls)
        });

        match outcome {
            CommandOutcome::Updated => {}
            CommandOutcome::Stopped => STOP.store(true, Ordering::Relaxed),
            CommandOutcome::ReportStatus => publish_status(),
            CommandOutcome::ResetStats => {
                critical_section::with(|cs| {
                    RESET_STATS.store(true, Ordering::Relaxed);
                    STATS.borrow(cs).set(ScanStats::default());
                });
                log::info!("Counters reset by host command");
            }
            CommandOutcome::Rejected(e) => log::warn!("Host command rejected: {}", e),
        }
    }
}
