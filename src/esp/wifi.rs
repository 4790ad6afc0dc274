use core::sync::atomic::{AtomicBool, Ordering};

use embassy_executor::SendSpawner;
use embassy_net::{DhcpConfig, Runner, Stack, StackResources};
use embassy_time::{Duration, Timer};
use esp_hal::rng::Rng;
use esp_radio::wifi::{ClientConfig, ModeConfig, WifiController, WifiDevice, WifiEvent, WifiStaState};
use static_cell::make_static;

use crate::config::CONFIG;
use crate::network::{NetworkKind, Transport};

// DNS, the SNTP socket and the MQTT socket.
const STACK_RESOURCES_SIZE: usize = 4;

/// Cleared by [`Transport::disconnect`]; the connection task then stops
/// reconnecting until the station asks for the link again.
static LINK_WANTED: AtomicBool = AtomicBool::new(true);

#[embassy_executor::task]
async fn connection(mut controller: WifiController<'static>) {
    let ssid = CONFIG.wifi.ssid.unwrap_or("");
    let password = CONFIG.wifi.password.unwrap_or("");

    if ssid.is_empty() {
        defmt::warn!("wifi: STIMA_WIFI_SSID not set at build time");
    }

    loop {
        if esp_radio::wifi::sta_state() == WifiStaState::Connected {
            defmt::info!("wifi: waiting for disconnection");
            controller.wait_for_event(WifiEvent::StaDisconnected).await;
            defmt::info!("wifi: disconnected");
            Timer::after(Duration::from_millis(5000)).await;
        }
        if !LINK_WANTED.load(Ordering::Acquire) {
            Timer::after(Duration::from_secs(1)).await;
            continue;
        }
        if !matches!(controller.is_started(), Ok(true)) {
            let mut client_config = ClientConfig::default().with_ssid(ssid.into());
            if !password.is_empty() {
                client_config = client_config.with_password(password.into());
            }
            if let Err(e) = controller.set_config(&ModeConfig::Client(client_config)) {
                defmt::error!("wifi: bad configuration: {:?}", defmt::Debug2Format(&e));
                Timer::after(Duration::from_secs(30)).await;
                continue;
            }
            defmt::info!("wifi: starting");
            if let Err(e) = controller.start_async().await {
                defmt::error!("wifi: start failed: {:?}", defmt::Debug2Format(&e));
                Timer::after(Duration::from_millis(5000)).await;
                continue;
            }
        }
        defmt::info!("wifi: connecting");
        match controller.connect_async().await {
            Ok(_) => defmt::info!("wifi: connected"),
            Err(e) => {
                defmt::warn!("wifi: failed to connect: {:?}", defmt::Debug2Format(&e));
                Timer::after(Duration::from_millis(5000)).await
            }
        }
    }
}

#[embassy_executor::task]
async fn net_task(mut runner: Runner<'static, WifiDevice<'static>>) {
    runner.run().await
}

/// Brings up the radio and the IP stack. Returns at once; the link comes up
/// in the background and the station polls it through [`WifiTransport`].
pub fn start_wifi(
    radio_init: &'static esp_radio::Controller<'static>,
    wifi: esp_hal::peripherals::WIFI<'static>,
    rng: Rng,
    spawner: SendSpawner,
) -> Result<Stack<'static>, esp_radio::wifi::WifiError> {
    let (wifi_controller, interfaces) =
        esp_radio::wifi::new(radio_init, wifi, esp_radio::wifi::Config::default())?;

    let net_seed = rng.random() as u64 | ((rng.random() as u64) << 32);
    let net_config = embassy_net::Config::dhcpv4(DhcpConfig::default());

    let (stack, runner) = embassy_net::new(
        interfaces.sta,
        net_config,
        make_static!(StackResources::<STACK_RESOURCES_SIZE>::new()),
        net_seed,
    );

    spawner.spawn(connection(wifi_controller)).ok();
    spawner.spawn(net_task(runner)).ok();
    Ok(stack)
}

/// The wifi link as seen by the connection task.
pub struct WifiTransport {
    stack: Stack<'static>,
}

impl WifiTransport {
    pub fn new(stack: Stack<'static>) -> Self {
        Self { stack }
    }
}

impl Transport for WifiTransport {
    fn kind(&self) -> NetworkKind {
        NetworkKind::Wifi
    }

    fn connect(&mut self) -> bool {
        LINK_WANTED.store(true, Ordering::Release);
        self.is_connected()
    }

    fn is_connected(&self) -> bool {
        self.stack.is_link_up() && self.stack.is_config_up()
    }

    fn open_socket(&mut self) -> bool {
        // The SNTP task owns the datagram socket; it only needs an address.
        self.stack.config_v4().is_some()
    }

    fn disconnect(&mut self) {
        LINK_WANTED.store(false, Ordering::Release);
    }
}
