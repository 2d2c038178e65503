//! ARP presence probing over a raw packet socket.

mod frame;
mod replies;

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration,
};

use afpacket::tokio::RawPacketStream;
use log::{debug, trace, warn};
use pnet::{datalink, packet::arp::ArpOperations, util::MacAddr};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::Mutex,
};

use crate::{
    error::{Error, Result},
    task::TaskHandle,
};

use self::replies::ReplyTable;

/// Sends ARP requests out of one interface and matches the replies.
///
/// A background task reads every ARP reply seen on the interface, so probes
/// running concurrently (or one that follows shortly after) share answers.
pub(crate) struct ArpProber {
    interface: String,
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    stream: Mutex<RawPacketStream>,
    replies: Arc<ReplyTable>,
    listener: TaskHandle,
}

impl ArpProber {
    /// Opens a raw socket on `interface_name`. Needs `CAP_NET_RAW` and a
    /// running tokio runtime.
    ///
    /// Replies are remembered for `reply_ttl`.
    pub(crate) fn bind(interface_name: &str, reply_ttl: Duration) -> Result<Self> {
        let interface = datalink::interfaces()
            .into_iter()
            .find(|iface| iface.name == interface_name)
            .ok_or_else(|| Error::Opaque(format!("interface {} not found", interface_name).into()))?;
        let sender_mac = interface.mac.ok_or_else(|| {
            Error::Opaque(format!("interface {} has no MAC address", interface_name).into())
        })?;
        let sender_ip = interface
            .ips
            .iter()
            .find_map(|net| match net.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            })
            .unwrap_or(Ipv4Addr::UNSPECIFIED);

        let mut stream = RawPacketStream::new().map_err(|err| {
            Error::Opaque(format!("failed to create packet stream, reason: {}", err).into())
        })?;
        stream.bind(interface_name).map_err(|err| {
            Error::Opaque(format!("failed to bind interface to stream, reason {}", err).into())
        })?;

        let replies = Arc::new(ReplyTable::new(reply_ttl));
        let listener = TaskHandle::spawn(listen(
            interface_name.to_owned(),
            stream.clone(),
            Arc::clone(&replies),
        ));
        debug!("ARP prober bound to {} as {}", interface_name, sender_ip);

        Ok(Self {
            interface: interface_name.to_owned(),
            sender_mac,
            sender_ip,
            stream: Mutex::new(stream),
            replies,
            listener,
        })
    }

    /// The reply reader stopped, the prober has to be bound again.
    pub(crate) fn is_closed(&self) -> bool {
        self.listener.is_finished()
    }

    /// Asks who has `target` and reports whether anyone answered in time.
    pub(crate) async fn probe(&self, target: Ipv4Addr, timeout: Duration) -> Result<bool> {
        if self.replies.get(&target).is_some() {
            trace!("{} answered ARP recently", target);
            return Ok(true);
        }
        let request = frame::request(self.sender_mac, self.sender_ip, target)?;
        self.stream
            .lock()
            .await
            .write_all(&request)
            .await
            .map_err(|err| {
                Error::Opaque(format!("failed to send request, reason: {}", err).into())
            })?;

        let answered = tokio::time::timeout(timeout, self.replies.wait_for(target))
            .await
            .is_ok();
        trace!(
            "ARP probe of {} on {}: {}",
            target,
            self.interface,
            if answered { "answered" } else { "silent" }
        );
        Ok(answered)
    }
}

async fn listen(interface: String, mut stream: RawPacketStream, replies: Arc<ReplyTable>) {
    let mut buf = [0; frame::ETH_PACK_LEN];
    while let Ok(read_bytes) = stream.read(&mut buf).await {
        if let Ok(arp) = frame::parse(&buf[..read_bytes]) {
            if arp.operation == ArpOperations::Reply {
                replies.record(arp.sender_proto_addr, arp.sender_hw_addr);
            }
        }
    }
    warn!("error while reading the traffic of {}", interface);
}
