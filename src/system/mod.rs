//! [`NetworkCapability`] backed by the host's sockets and tools.

mod arp;
mod command;

use std::{
    collections::{BTreeSet, HashMap},
    future::Future,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use log::{debug, info, trace};
use parking_lot::Mutex;
use pnet::datalink;
use tokio::net::{TcpStream, UdpSocket};

use crate::{capability::NetworkCapability, error::Result};

use self::arp::ArpProber;

/// Port of the datagram sent by [`NetworkCapability::wake_device`].
pub const WAKE_PORT: u16 = 5353;
const WAKE_PAYLOAD: &[u8] = b"wake up";

/// The `ping` dialects understood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingTool {
    Unix,
    MacOs,
    Windows,
}

impl PingTool {
    pub fn for_current_platform() -> Self {
        if cfg!(target_os = "windows") {
            PingTool::Windows
        } else if cfg!(target_os = "macos") {
            PingTool::MacOs
        } else {
            PingTool::Unix
        }
    }

    /// Windows `ping` exits successfully on "destination unreachable" too.
    fn success_marker(self) -> Option<&'static str> {
        match self {
            PingTool::Windows => Some("TTL="),
            PingTool::Unix | PingTool::MacOs => None,
        }
    }
}

/// The arping implementations whose command lines are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpingTool {
    Iputils,
    ThomasHabets,
    EliFulkerson,
}

/// How ARP probes are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArpMethod {
    /// Every ARP probe reports "no answer".
    #[default]
    Unavailable,
    /// Raw packet socket per interface, needs `CAP_NET_RAW`.
    RawSocket,
    /// An external arping executable.
    Arping(ArpingTool),
}

impl ArpMethod {
    /// Uses an installed arping if one is recognised.
    pub async fn detect() -> Self {
        command::detect_arping()
            .await
            .map_or(ArpMethod::Unavailable, ArpMethod::Arping)
    }
}

#[derive(Debug, Clone)]
pub struct SystemNetworkConfig {
    pub arp_method: ArpMethod,
    pub ping_tool: PingTool,
    /// How long a raw socket ARP reply keeps answering probes for its sender.
    pub arp_reply_ttl: Duration,
}

impl Default for SystemNetworkConfig {
    fn default() -> Self {
        Self {
            arp_method: ArpMethod::default(),
            ping_tool: PingTool::for_current_platform(),
            arp_reply_ttl: Duration::from_secs(2),
        }
    }
}

/// Probes through real sockets and the platform's `ping`/`arping` tools.
///
/// TCP checks connect directly. ICMP goes through the `ping` executable so no
/// privileges are needed. ARP uses whatever [`ArpMethod`] is configured.
///
/// # Example
/// ```no_run
/// use async_presence::{
///     system::{ArpMethod, SystemNetworkConfig},
///     SystemNetwork,
/// };
///
/// let network = SystemNetwork::new(SystemNetworkConfig {
///     arp_method: ArpMethod::RawSocket,
///     ..Default::default()
/// });
/// ```
pub struct SystemNetwork {
    config: SystemNetworkConfig,
    probers: Mutex<HashMap<String, Arc<ArpProber>>>,
}

impl SystemNetwork {
    pub fn new(config: SystemNetworkConfig) -> Self {
        Self {
            config,
            probers: Mutex::new(HashMap::new()),
        }
    }

    /// Default configuration with the installed arping, if any.
    pub async fn detect() -> Self {
        let arp_method = ArpMethod::detect().await;
        info!("ARP probing via {:?}", arp_method);
        Self::new(SystemNetworkConfig {
            arp_method,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &SystemNetworkConfig {
        &self.config
    }

    fn prober(&self, interface: &str) -> Result<Arc<ArpProber>> {
        let mut probers = self.probers.lock();
        if let Some(prober) = probers.get(interface).filter(|prober| !prober.is_closed()) {
            return Ok(Arc::clone(prober));
        }
        let prober = Arc::new(ArpProber::bind(interface, self.config.arp_reply_ttl)?);
        probers.insert(interface.to_owned(), Arc::clone(&prober));
        Ok(prober)
    }
}

impl NetworkCapability for SystemNetwork {
    fn try_connect(
        &self,
        address: IpAddr,
        port: u16,
        timeout: Duration,
    ) -> impl Future<Output = Result<bool>> + Send {
        async move {
            match tokio::time::timeout(timeout, TcpStream::connect((address, port))).await {
                Ok(Ok(_stream)) => Ok(true),
                Ok(Err(err)) if err.kind() == io::ErrorKind::ConnectionRefused => {
                    trace!("{}:{} refused the connection", address, port);
                    Ok(false)
                }
                Ok(Err(err)) => Err(err.into()),
                Err(_elapsed) => Ok(false),
            }
        }
    }

    fn arp_probe(
        &self,
        interface: &str,
        address: IpAddr,
        timeout: Duration,
    ) -> impl Future<Output = Result<bool>> + Send {
        let interface = interface.to_owned();
        async move {
            let IpAddr::V4(target) = address else {
                return Ok(false);
            };
            match self.config.arp_method {
                ArpMethod::Unavailable => Ok(false),
                ArpMethod::RawSocket => self.prober(&interface)?.probe(target, timeout).await,
                ArpMethod::Arping(tool) => {
                    command::succeeds(command::arping(tool, &interface, target, timeout), None)
                        .await
                }
            }
        }
    }

    fn icmp_probe(
        &self,
        address: IpAddr,
        timeout: Duration,
    ) -> impl Future<Output = Result<bool>> + Send {
        let tool = self.config.ping_tool;
        command::succeeds(command::ping(tool, address, timeout), tool.success_marker())
    }

    fn list_interfaces(&self) -> BTreeSet<String> {
        datalink::interfaces()
            .into_iter()
            .filter(|iface| {
                iface.is_up() && !iface.is_loopback() && iface.ips.iter().any(|net| net.is_ipv4())
            })
            .map(|iface| iface.name)
            .collect()
    }

    fn wake_device(&self, address: IpAddr) -> impl Future<Output = Result<()>> + Send {
        async move {
            let local = match address {
                IpAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
                IpAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
            };
            let socket = UdpSocket::bind(local).await?;
            socket.send_to(WAKE_PAYLOAD, (address, WAKE_PORT)).await?;
            debug!("sent wake-up datagram to {}", address);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn network() -> SystemNetwork {
        SystemNetwork::new(SystemNetworkConfig::default())
    }

    #[tokio::test]
    async fn test_tcp_connect_to_listening_port() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let reachable = network()
            .try_connect(Ipv4Addr::LOCALHOST.into(), port, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(reachable);
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let port = {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let reachable = network()
            .try_connect(Ipv4Addr::LOCALHOST.into(), port, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!reachable);
    }

    #[tokio::test]
    async fn test_arp_unavailable_or_ipv6_finds_nothing() {
        let timeout = Duration::from_millis(10);
        let unavailable = network();
        assert!(!unavailable
            .arp_probe("eth0", Ipv4Addr::LOCALHOST.into(), timeout)
            .await
            .unwrap());

        let raw = SystemNetwork::new(SystemNetworkConfig {
            arp_method: ArpMethod::RawSocket,
            ..Default::default()
        });
        assert!(!raw
            .arp_probe("eth0", Ipv6Addr::LOCALHOST.into(), timeout)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_raw_socket_on_missing_interface_fails() {
        let raw = SystemNetwork::new(SystemNetworkConfig {
            arp_method: ArpMethod::RawSocket,
            ..Default::default()
        });
        let probe = raw
            .arp_probe(
                "invalid_dummy",
                Ipv4Addr::new(10, 1, 1, 1).into(),
                Duration::from_millis(10),
            )
            .await;
        assert!(probe.is_err());
    }

    #[tokio::test]
    async fn test_wake_device_sends_datagram() {
        network()
            .wake_device(Ipv4Addr::LOCALHOST.into())
            .await
            .unwrap();
    }

    #[test]
    fn test_listed_interfaces_exclude_loopback() {
        let loopbacks: BTreeSet<String> = datalink::interfaces()
            .into_iter()
            .filter(|iface| iface.is_loopback())
            .map(|iface| iface.name)
            .collect();
        assert!(network().list_interfaces().is_disjoint(&loopbacks));
    }
}
