#![no_std]
#![no_main]
#![feature(type_alias_impl_trait)]
#![feature(impl_trait_in_assoc_type)]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]

use embassy_executor::Spawner;
use embassy_futures::select::select;
use embassy_time::{Duration, Instant, Timer};
use embedded_io::ReadReady;
use esp_backtrace as _; // Register the panic handler.
use esp_hal::clock::CpuClock;
use esp_hal::delay::Delay;
use esp_hal::gpio::{Level, Output, OutputConfig, Pull};
use esp_hal::i2c::master::{Config as I2cConfig, I2c};
use esp_hal::interrupt::Priority;
use esp_hal::interrupt::software::SoftwareInterruptControl;
use esp_hal::rng::Rng;
use esp_hal::rtc_cntl::Rtc;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::uart::{Config as UartConfig, Uart};
use esp_println as _; // Register the defmt UART global logger.
use esp_rtos::embassy::InterruptExecutor;
use static_cell::make_static;

use stima as lib;

use lib::config::CONFIG;
use lib::esp::board::{OnBoardSensors, RtcClock, Stima};
use lib::esp::mqtt::MqttClient;
use lib::esp::sntp::SntpClient;
use lib::esp::watchdog::Heartbeat;
use lib::esp::wifi::WifiTransport;
use lib::interrupts::Interrupts;
use lib::sensors::s8::S8;
use lib::sensors::sgp41::Sgp41;
use lib::settings::MemoryConfigStore;
use lib::station::{Devices, Station};
use lib::store::{MemoryCursorStore, MemoryLogStore};

// This creates a default app-descriptor required by the esp-idf bootloader.
esp_bootloader_esp_idf::esp_app_desc!();

#[esp_rtos::main]
async fn main(_spawner: Spawner) -> ! {
    let info = lib::esp::device::DeviceInfo::get();
    defmt::info!(
        "stima: device {} starting, reset reason {}",
        info.device_id.as_str(),
        info.reset_reason
    );

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    // Reclaim internal memory reserved from startup.
    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 64 * 1024);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_int = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start(timg0.timer0, sw_int.software_interrupt0);

    // Network, tick and watchdog run above thread mode so they keep going
    // while the station waits on a broker round trip.
    let executor = make_static!(InterruptExecutor::new(sw_int.software_interrupt2));
    let net_spawner = executor.start(Priority::Priority2);

    let radio_init = make_static!(
        esp_radio::init().expect("Failed to initialize Wi-Fi/BLE controller")
    );
    let stack = lib::esp::wifi::start_wifi(radio_init, peripherals.WIFI, Rng::new(), net_spawner)
        .expect("Failed to initialize wifi controller");
    net_spawner.must_spawn(lib::esp::sntp::sntp_task(stack));
    net_spawner.must_spawn(lib::esp::mqtt::mqtt_task(stack));

    let interrupts: &'static Interrupts =
        make_static!(Interrupts::new(CONFIG.supervisor.period_secs));
    net_spawner.must_spawn(lib::esp::tick_task(interrupts));

    // External Watchdog (TPL5010) Kick on GPIO2.
    let heartbeat: &'static Heartbeat = make_static!(Heartbeat::new());
    let watchdog_pin = Output::new(
        peripherals.GPIO2,
        Level::Low,
        OutputConfig::default().with_pull(Pull::Down),
    );
    net_spawner.must_spawn(lib::esp::watchdog::watchdog_task(
        watchdog_pin,
        Delay::new(),
        heartbeat,
    ));

    let i2c0 = I2c::new(peripherals.I2C0, I2cConfig::default())
        .expect("Failed to initialize I2C0")
        .with_sda(peripherals.GPIO7)
        .with_scl(peripherals.GPIO6);
    let sgp41 = Sgp41::new(i2c0, f32::from(CONFIG.defaults.report_seconds));

    let uart1 = Uart::new(peripherals.UART1, UartConfig::default().with_baudrate(9600))
        .expect("Failed to initialize UART1")
        .with_rx(peripherals.GPIO0)
        .with_tx(peripherals.GPIO1);
    let s8 = S8::new(uart1);

    let console = Uart::new(peripherals.UART0, UartConfig::default().with_baudrate(115_200))
        .expect("Failed to initialize UART0")
        .with_rx(peripherals.GPIO20)
        .with_tx(peripherals.GPIO21);

    let devices = Devices::<Stima> {
        transport: WifiTransport::new(stack),
        time_source: SntpClient,
        pubsub: MqttClient,
        log_store: MemoryLogStore::new(),
        cursor_store: MemoryCursorStore::new(),
        config_store: MemoryConfigStore::new(),
        rtc: RtcClock::new(Rtc::new(peripherals.LPWR)),
        sensors: OnBoardSensors { s8, sgp41 },
        console,
    };
    let station = make_static!(Station::new(devices, interrupts));
    station.set_low_power(true);

    let mut last_status = Instant::now();
    loop {
        if let Err(fatal) = station.step(Instant::now()) {
            defmt::error!("stima: {:?}, resetting", fatal);
            Timer::after(Duration::from_millis(100)).await;
            esp_hal::system::software_reset();
        }
        heartbeat.beat();

        if matches!(station.context_mut().dev.console.read_ready(), Ok(true)) {
            interrupts.on_console_rx();
        }

        if CONFIG.print_status_loop && last_status.elapsed() >= Duration::from_secs(1) {
            last_status = Instant::now();
            let stats = esp_alloc::HEAP.stats();
            let status = &station.context().status;
            defmt::info!(
                "[{}s] Epoch: {:?} | Link: {} | Ready: {} | Heap: {}/{}",
                last_status.as_secs(),
                interrupts.epoch(),
                status.is_client_connected,
                station.dispatcher().ready_count(),
                stats.current_usage,
                stats.size
            );
        }

        if station.may_sleep() {
            // Woken by the tick; the console is polled every 100 ms.
            select(interrupts.wait(), Timer::after(Duration::from_millis(100))).await;
        } else {
            embassy_futures::yield_now().await;
        }
    }
}
