//! MQTT session over embassy-net TCP, bridged to the blocking [`PubSub`]
//! facade the publish task drives.
//!
//! [`mqtt_task`] runs on the interrupt executor while the station runs in
//! thread mode, so the facade can spin on an outcome while the network keeps
//! making progress. The wire protocol is rust-mqtt's; incoming messages are
//! only read while the facade yields.

use core::sync::atomic::{AtomicBool, Ordering};

use embassy_net::Stack;
use embassy_net::dns::DnsQueryType;
use embassy_net::tcp::TcpSocket;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, with_timeout};
use embedded_io_async_06 as io06;
use rust_mqtt::client::client::MqttClient as Client;
use rust_mqtt::client::client_config::{ClientConfig, MqttVersion};
use rust_mqtt::packet::v5::publish_packet::QualityOfService;
use rust_mqtt::packet::v5::reason_codes::ReasonCode;
use rust_mqtt::utils::rng_generator::CountingRng;

use crate::network::{Credentials, PubSub, Topic};
use crate::rpc::{RESPONSE_LEN, Request};
use crate::settings::{Host, Name};

const KEEP_ALIVE_SECS: u16 = 60;
/// Upper bound on a facade call, DNS and TCP handshake included.
const FACADE_TIMEOUT: Duration = Duration::from_secs(15);
const PACKET_LEN: usize = 1024;
const MAX_PROPERTIES: usize = 5;

type Payload = heapless::Vec<u8, RESPONSE_LEN>;

struct Session {
    server: Host,
    port: u16,
    client_id: Name,
    username: Name,
    password: Name,
}

enum Command {
    Connect(Session),
    Subscribe(Topic),
    Publish(Topic, Payload),
    /// Read incoming messages for at most this long.
    Poll(Duration),
    Disconnect,
}

static COMMANDS: Channel<CriticalSectionRawMutex, Command, 1> = Channel::new();
static OUTCOME: Signal<CriticalSectionRawMutex, bool> = Signal::new();
static INBOX: Channel<CriticalSectionRawMutex, Request, 2> = Channel::new();
static CONNECTED: AtomicBool = AtomicBool::new(false);

/// The embassy-net socket behind the embedded-io-async 0.6 traits rust-mqtt
/// is written against.
struct Socket<'s>(TcpSocket<'s>);

#[derive(Debug)]
struct SocketError(embassy_net::tcp::Error);

impl io06::Error for SocketError {
    #[allow(unreachable_patterns)]
    fn kind(&self) -> io06::ErrorKind {
        match self.0 {
            embassy_net::tcp::Error::ConnectionReset => io06::ErrorKind::ConnectionReset,
            _ => io06::ErrorKind::Other,
        }
    }
}

impl io06::ErrorType for Socket<'_> {
    type Error = SocketError;
}

impl io06::Read for Socket<'_> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.0.read(buf).await.map_err(SocketError)
    }
}

impl io06::Write for Socket<'_> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.0.write(buf).await.map_err(SocketError)
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.0.flush().await.map_err(SocketError)
    }
}

#[derive(Debug)]
enum MqttError {
    Dns,
    Connect,
    Broker(ReasonCode),
}

impl From<ReasonCode> for MqttError {
    fn from(code: ReasonCode) -> Self {
        MqttError::Broker(code)
    }
}

type Connection<'a> = Client<'a, Socket<'a>, MAX_PROPERTIES, CountingRng>;

async fn open_socket<'a>(
    stack: Stack<'static>,
    session: &Session,
    rx_buffer: &'a mut [u8],
    tx_buffer: &'a mut [u8],
) -> Result<Socket<'a>, MqttError> {
    let address = *stack
        .dns_query(&session.server, DnsQueryType::A)
        .await
        .map_err(|_| MqttError::Dns)?
        .first()
        .ok_or(MqttError::Dns)?;
    let mut socket = TcpSocket::new(stack, rx_buffer, tx_buffer);
    socket.set_timeout(Some(Duration::from_secs(u64::from(KEEP_ALIVE_SECS) * 2)));
    socket
        .connect((address, session.port))
        .await
        .map_err(|_| MqttError::Connect)?;
    Ok(Socket(socket))
}

/// Reads messages until `timeout` passes without one.
async fn poll(client: &mut Connection<'_>, timeout: Duration) -> Result<(), MqttError> {
    loop {
        match with_timeout(timeout, client.receive_message()).await {
            Err(_) => return Ok(()),
            Ok(Err(code)) => return Err(code.into()),
            Ok(Ok((_topic, payload))) => match Request::from_slice(payload) {
                Ok(request) => {
                    if INBOX.try_send(request).is_err() {
                        defmt::warn!("mqtt: inbox full, request dropped");
                    }
                }
                Err(_) => defmt::warn!("mqtt: request too long, dropped"),
            },
        }
    }
}

/// Runs the session until the station disconnects or the broker fails.
async fn serve(client: &mut Connection<'_>) -> Result<(), MqttError> {
    let ping_every = Duration::from_secs(u64::from(KEEP_ALIVE_SECS) / 2);
    loop {
        let Ok(command) = with_timeout(ping_every, COMMANDS.receive()).await else {
            client.send_ping().await?;
            continue;
        };
        let result = match command {
            Command::Publish(topic, payload) => client
                .send_message(&topic, &payload, QualityOfService::QoS1, false)
                .await
                .map_err(MqttError::from),
            Command::Subscribe(topic) => client
                .subscribe_to_topic(&topic)
                .await
                .map_err(MqttError::from),
            Command::Poll(timeout) => poll(client, timeout).await,
            Command::Connect(_) => Ok(()),
            Command::Disconnect => {
                let result = client.disconnect().await;
                OUTCOME.signal(true);
                return result.map_err(MqttError::from);
            }
        };
        OUTCOME.signal(result.is_ok());
        result?;
    }
}

#[embassy_executor::task]
pub async fn mqtt_task(stack: Stack<'static>) {
    let mut rx_buffer = [0u8; PACKET_LEN];
    let mut tx_buffer = [0u8; PACKET_LEN];
    let mut recv_buffer = [0u8; PACKET_LEN];
    let mut write_buffer = [0u8; PACKET_LEN];
    loop {
        let session = match COMMANDS.receive().await {
            Command::Connect(session) => session,
            Command::Disconnect | Command::Poll(_) => {
                OUTCOME.signal(true);
                continue;
            }
            Command::Subscribe(_) | Command::Publish(..) => {
                OUTCOME.signal(false);
                continue;
            }
        };

        let socket = match open_socket(stack, &session, &mut rx_buffer, &mut tx_buffer).await {
            Ok(socket) => socket,
            Err(e) => {
                defmt::warn!(
                    "mqtt: cannot reach {}: {:?}",
                    session.server.as_str(),
                    defmt::Debug2Format(&e)
                );
                OUTCOME.signal(false);
                continue;
            }
        };

        let mut config = ClientConfig::new(MqttVersion::MQTTv5, CountingRng(20_000));
        config.add_max_subscribe_qos(QualityOfService::QoS1);
        config.add_client_id(&session.client_id);
        if !session.username.is_empty() {
            config.add_username(&session.username);
            config.add_password(&session.password);
        }
        config.max_packet_size = PACKET_LEN as u32;
        config.keep_alive = KEEP_ALIVE_SECS;

        let mut client = Client::<_, MAX_PROPERTIES, _>::new(
            socket,
            &mut write_buffer,
            PACKET_LEN,
            &mut recv_buffer,
            PACKET_LEN,
            config,
        );
        match client.connect_to_broker().await {
            Ok(()) => {
                defmt::info!("mqtt: connected to {}", session.server.as_str());
                CONNECTED.store(true, Ordering::Release);
                OUTCOME.signal(true);
                if let Err(e) = serve(&mut client).await {
                    defmt::warn!("mqtt: session ended: {:?}", defmt::Debug2Format(&e));
                }
            }
            Err(code) => {
                defmt::warn!(
                    "mqtt: {} refused the session: {:?}",
                    session.server.as_str(),
                    defmt::Debug2Format(&code)
                );
                OUTCOME.signal(false);
            }
        }
        CONNECTED.store(false, Ordering::Release);
    }
}

/// Blocking front end of [`mqtt_task`].
pub struct MqttClient;

impl MqttClient {
    fn request(&mut self, command: Command, timeout: Duration) -> bool {
        OUTCOME.reset();
        if COMMANDS.try_send(command).is_err() {
            return false;
        }
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(ok) = OUTCOME.try_take() {
                return ok;
            }
        }
        defmt::warn!("mqtt: session task did not answer");
        false
    }
}

fn copy<const N: usize>(s: &str) -> Option<heapless::String<N>> {
    heapless::String::try_from(s).ok()
}

impl PubSub for MqttClient {
    fn connect(&mut self, credentials: &Credentials<'_>) -> bool {
        let session = (|| {
            Some(Session {
                server: copy(credentials.server)?,
                port: credentials.port,
                client_id: copy(credentials.client_id)?,
                username: copy(credentials.username)?,
                password: copy(credentials.password)?,
            })
        })();
        match session {
            Some(session) => self.request(Command::Connect(session), FACADE_TIMEOUT),
            None => false,
        }
    }

    fn is_connected(&self) -> bool {
        CONNECTED.load(Ordering::Acquire)
    }

    fn subscribe(&mut self, topic: &str) -> bool {
        match copy(topic) {
            Some(topic) => self.request(Command::Subscribe(topic), FACADE_TIMEOUT),
            None => false,
        }
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        match (copy(topic), Payload::from_slice(payload)) {
            (Some(topic), Ok(payload)) => {
                self.request(Command::Publish(topic, payload), FACADE_TIMEOUT)
            }
            _ => false,
        }
    }

    fn yield_now(&mut self, timeout: Duration, on_message: &mut dyn FnMut(&[u8])) {
        if self.is_connected() {
            self.request(Command::Poll(timeout), timeout + FACADE_TIMEOUT);
        }
        while let Ok(request) = INBOX.try_receive() {
            on_message(&request);
        }
    }

    fn disconnect(&mut self) {
        if self.is_connected() {
            self.request(Command::Disconnect, FACADE_TIMEOUT);
        }
    }
}
