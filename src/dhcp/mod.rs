//! Passive presence evidence from DHCP requests.
//!
//! Devices that join a network (or wake up) usually renew their lease first.
//! [`DhcpListenService`] listens for those requests once for the whole
//! process and routes them to whoever watches the requested address.

mod packet;

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket},
    sync::Arc,
};

use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use tokio::net::UdpSocket;

use crate::{
    capability::{DhcpObservationRegistry, DhcpObserver},
    error::{Error, Result},
    task::TaskHandle,
};

/// Ports tried in order: the DHCP server port, then an unprivileged one that
/// requests can be redirected to.
pub const DHCP_PORTS: [u16; 2] = [67, 6767];

const MAX_PACKET_LEN: usize = 1500;

#[derive(Default)]
struct Observers {
    by_address: Mutex<HashMap<IpAddr, DhcpObserver>>,
}

impl Observers {
    fn dispatch(&self, address: IpAddr) -> bool {
        let observer = self.by_address.lock().get(&address).cloned();
        match observer {
            Some(observer) => {
                observer(address);
                true
            }
            None => false,
        }
    }
}

/// A [`DhcpObservationRegistry`] multiplexing one DHCP listener.
pub struct DhcpListenService {
    observers: Arc<Observers>,
    sniff: bool,
    listener: Mutex<Option<TaskHandle>>,
}

impl DhcpListenService {
    /// Listens on [`DHCP_PORTS`] while at least one address is registered.
    ///
    /// Registering the first address binds the socket and therefore has to
    /// happen inside a tokio runtime.
    pub fn new() -> Self {
        Self::with_sniffing(true)
    }

    /// Never opens a socket; requests are fed in through [`DhcpListenService::observe`].
    pub fn passive() -> Self {
        Self::with_sniffing(false)
    }

    fn with_sniffing(sniff: bool) -> Self {
        Self {
            observers: Arc::new(Observers::default()),
            sniff,
            listener: Mutex::new(None),
        }
    }

    /// Reports a DHCP request for `address`, returns whether anyone watched it.
    pub fn observe(&self, address: IpAddr) -> bool {
        self.observers.dispatch(address)
    }

    pub fn is_registered(&self, address: IpAddr) -> bool {
        self.observers.by_address.lock().contains_key(&address)
    }

    pub fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(|listener| !listener.is_finished())
    }

    fn start_listening(&self) -> Result<()> {
        let mut listener = self.listener.lock();
        if !self.sniff || listener.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }
        let socket = bind()?;
        let observers = Arc::clone(&self.observers);
        *listener = Some(TaskHandle::spawn(listen(socket, observers)));
        Ok(())
    }
}

impl Default for DhcpListenService {
    fn default() -> Self {
        Self::new()
    }
}

impl DhcpObservationRegistry for DhcpListenService {
    fn register(&self, address: IpAddr, observer: DhcpObserver) -> Result<()> {
        self.observers.by_address.lock().insert(address, observer);
        debug!("watching DHCP requests of {}", address);
        self.start_listening()
    }

    fn unregister(&self, address: IpAddr) {
        let mut observers = self.observers.by_address.lock();
        observers.remove(&address);
        if observers.is_empty() {
            if let Some(listener) = self.listener.lock().take() {
                listener.cancel();
                info!("DHCP listener stopped");
            }
        }
    }
}

fn bind() -> Result<UdpSocket> {
    let mut last_error = None;
    for port in DHCP_PORTS {
        match StdUdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))) {
            Ok(socket) => {
                socket.set_broadcast(true)?;
                socket.set_nonblocking(true)?;
                info!("DHCP listener bound to port {}", port);
                return Ok(UdpSocket::from_std(socket)?);
            }
            Err(err) => {
                warn!("cannot listen for DHCP requests on port {}: {}", port, err);
                last_error = Some(err);
            }
        }
    }
    Err(last_error.map_or_else(
        || Error::Opaque("no DHCP port configured".into()),
        Error::Io,
    ))
}

async fn listen(socket: UdpSocket, observers: Arc<Observers>) {
    let mut buf = [0; MAX_PACKET_LEN];
    loop {
        let (read_bytes, source) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                warn!("DHCP listener failed: {}", err);
                return;
            }
        };
        let Some(requested) = packet::requested_address(&buf[..read_bytes]) else {
            continue;
        };
        if !observers.dispatch(IpAddr::V4(requested)) {
            trace!("unwatched DHCP request for {} from {}", requested, source);
        }
    }
}
