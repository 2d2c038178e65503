use std::{collections::HashMap, net::Ipv4Addr, sync::Arc, time::Duration};

use parking_lot::Mutex;
use pnet::util::MacAddr;
use timedmap::TimedMap;
use tokio::sync::Notify;

/// Recently seen ARP replies, keyed by the answering address.
pub(super) struct ReplyTable {
    ttl: Duration,
    replies: TimedMap<Ipv4Addr, MacAddr>,
    waiters: Mutex<HashMap<Ipv4Addr, Arc<Notify>>>,
}

impl ReplyTable {
    pub(super) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            replies: TimedMap::new(),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    pub(super) fn record(&self, ip: Ipv4Addr, mac: MacAddr) {
        self.replies.insert(ip, mac, self.ttl);
        if let Some(notify) = self.waiters.lock().remove(&ip) {
            notify.notify_waiters();
        }
    }

    pub(super) fn get(&self, ip: &Ipv4Addr) -> Option<MacAddr> {
        self.replies.get(ip)
    }

    /// Resolves once a reply from `ip` has been recorded.
    pub(super) async fn wait_for(&self, ip: Ipv4Addr) -> MacAddr {
        loop {
            let notify = Arc::clone(self.waiters.lock().entry(ip).or_default());
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(mac) = self.get(&ip) {
                return mac;
            }
            notified.await;
        }
    }
}
