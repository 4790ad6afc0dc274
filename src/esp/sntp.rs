//! SNTP over embassy-net, bridged to the synchronous [`TimeSource`] the
//! time-sync task polls. The exchange itself is sntpc's.

use core::net::{SocketAddr, SocketAddrV4};

use embassy_net::dns::DnsQueryType;
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{IpAddress, IpEndpoint, Stack};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, with_timeout};
use sntpc::{NtpContext, NtpTimestampGenerator, NtpUdpSocket};

use crate::network::TimeSource;
use crate::settings::Host;

const PORT: u16 = 123;
const LOCAL_PORT: u16 = 50_123;
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(4);

static REQUEST: Signal<CriticalSectionRawMutex, Host> = Signal::new();
static RESPONSE: Signal<CriticalSectionRawMutex, u32> = Signal::new();

#[derive(Debug)]
enum SntpError {
    Dns,
    Socket,
    Timeout,
    Exchange(sntpc::Error),
}

/// Transmit timestamps from the monotonic clock; only the server's transmit
/// time is used.
#[derive(Clone, Copy, Default)]
struct Uptime(Duration);

impl NtpTimestampGenerator for Uptime {
    fn init(&mut self) {
        self.0 = Instant::now().duration_since(Instant::from_ticks(0));
    }

    fn timestamp_sec(&self) -> u64 {
        self.0.as_secs()
    }

    fn timestamp_subsec_micros(&self) -> u32 {
        (self.0.as_micros() % 1_000_000) as u32
    }
}

struct Socket<'s>(UdpSocket<'s>);

fn endpoint(addr: SocketAddr) -> sntpc::Result<IpEndpoint> {
    match addr {
        SocketAddr::V4(addr) => Ok(IpEndpoint::new(IpAddress::Ipv4(*addr.ip()), addr.port())),
        SocketAddr::V6(_) => Err(sntpc::Error::Network),
    }
}

#[allow(unreachable_patterns)]
fn socket_addr(endpoint: IpEndpoint) -> sntpc::Result<SocketAddr> {
    match endpoint.addr {
        IpAddress::Ipv4(ip) => Ok(SocketAddr::V4(SocketAddrV4::new(ip, endpoint.port))),
        _ => Err(sntpc::Error::Network),
    }
}

impl NtpUdpSocket for Socket<'_> {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> sntpc::Result<usize> {
        self.0
            .send_to(buf, endpoint(addr)?)
            .await
            .map_err(|_| sntpc::Error::Network)?;
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> sntpc::Result<(usize, SocketAddr)> {
        let (len, meta) = self
            .0
            .recv_from(buf)
            .await
            .map_err(|_| sntpc::Error::Network)?;
        Ok((len, socket_addr(meta.endpoint)?))
    }
}

async fn query(stack: Stack<'static>, server: &str) -> Result<u32, SntpError> {
    let address = *stack
        .dns_query(server, DnsQueryType::A)
        .await
        .map_err(|_| SntpError::Dns)?
        .first()
        .ok_or(SntpError::Dns)?;
    let server = socket_addr(IpEndpoint::new(address, PORT)).map_err(|_| SntpError::Dns)?;

    let mut rx_meta = [PacketMetadata::EMPTY; 2];
    let mut rx_buffer = [0u8; 128];
    let mut tx_meta = [PacketMetadata::EMPTY; 2];
    let mut tx_buffer = [0u8; 128];
    let mut socket = UdpSocket::new(
        stack,
        &mut rx_meta,
        &mut rx_buffer,
        &mut tx_meta,
        &mut tx_buffer,
    );
    socket.bind(LOCAL_PORT).map_err(|_| SntpError::Socket)?;
    let socket = Socket(socket);

    let context = NtpContext::new(Uptime::default());
    let result = with_timeout(RESPONSE_TIMEOUT, sntpc::get_time(server, &socket, context))
        .await
        .map_err(|_| SntpError::Timeout)?
        .map_err(SntpError::Exchange)?;
    Ok(result.sec())
}

#[embassy_executor::task]
pub async fn sntp_task(stack: Stack<'static>) {
    loop {
        let server = REQUEST.wait().await;
        match query(stack, &server).await {
            Ok(epoch) => RESPONSE.signal(epoch),
            Err(e) => defmt::warn!(
                "sntp: {} failed: {:?}",
                server.as_str(),
                defmt::Debug2Format(&e)
            ),
        }
    }
}

/// Hands requests to [`sntp_task`] and picks up its answers.
pub struct SntpClient;

impl TimeSource for SntpClient {
    fn send_request(&mut self, server: &str) -> bool {
        let Ok(server) = Host::try_from(server) else {
            return false;
        };
        RESPONSE.reset();
        REQUEST.signal(server);
        true
    }

    fn poll_response(&mut self) -> Option<u32> {
        RESPONSE.try_take()
    }
}
