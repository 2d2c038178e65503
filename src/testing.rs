use std::{
    collections::{BTreeSet, HashMap},
    future::Future,
    io,
    net::IpAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    capability::NetworkCapability,
    error::{Error, Result},
    listener::ResultListener,
    result::DetectionResult,
};

/// Scripted behaviour of one fake probe.
#[derive(Copy, Clone, Debug)]
pub(crate) enum Reply {
    Reachable(Duration),
    Unreachable(Duration),
    Fails,
    Hangs,
}

async fn answer(reply: Reply) -> Result<bool> {
    match reply {
        Reply::Reachable(delay) => {
            tokio::time::sleep(delay).await;
            Ok(true)
        }
        Reply::Unreachable(delay) => {
            tokio::time::sleep(delay).await;
            Ok(false)
        }
        Reply::Fails => Err(Error::Io(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "operation not permitted",
        ))),
        Reply::Hangs => futures::future::pending().await,
    }
}

pub(crate) struct FakeNetwork {
    tcp: HashMap<u16, Reply>,
    arp: HashMap<String, Reply>,
    icmp: Reply,
    wake: Reply,
    calls: AtomicUsize,
    wakes: AtomicUsize,
}

impl FakeNetwork {
    pub(crate) fn new() -> Self {
        Self {
            tcp: HashMap::new(),
            arp: HashMap::new(),
            icmp: Reply::Unreachable(Duration::ZERO),
            wake: Reply::Reachable(Duration::ZERO),
            calls: AtomicUsize::new(0),
            wakes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_tcp(mut self, port: u16, reply: Reply) -> Self {
        self.tcp.insert(port, reply);
        self
    }

    pub(crate) fn with_arp(mut self, interface: &str, reply: Reply) -> Self {
        self.arp.insert(interface.into(), reply);
        self
    }

    pub(crate) fn with_icmp(mut self, reply: Reply) -> Self {
        self.icmp = reply;
        self
    }

    pub(crate) fn with_wake(mut self, reply: Reply) -> Self {
        self.wake = reply;
        self
    }

    /// Number of probes started so far.
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn wakes(&self) -> usize {
        self.wakes.load(Ordering::SeqCst)
    }

    fn probe(&self, reply: Option<Reply>) -> impl Future<Output = Result<bool>> + Send {
        self.calls.fetch_add(1, Ordering::SeqCst);
        answer(reply.unwrap_or(Reply::Unreachable(Duration::ZERO)))
    }
}

impl NetworkCapability for FakeNetwork {
    fn try_connect(
        &self,
        _address: IpAddr,
        port: u16,
        _timeout: Duration,
    ) -> impl Future<Output = Result<bool>> + Send {
        self.probe(self.tcp.get(&port).copied())
    }

    fn arp_probe(
        &self,
        interface: &str,
        _address: IpAddr,
        _timeout: Duration,
    ) -> impl Future<Output = Result<bool>> + Send {
        self.probe(self.arp.get(interface).copied())
    }

    fn icmp_probe(
        &self,
        _address: IpAddr,
        _timeout: Duration,
    ) -> impl Future<Output = Result<bool>> + Send {
        self.probe(Some(self.icmp))
    }

    fn list_interfaces(&self) -> BTreeSet<String> {
        self.arp.keys().cloned().collect()
    }

    fn wake_device(&self, _address: IpAddr) -> impl Future<Output = Result<()>> + Send {
        self.wakes.fetch_add(1, Ordering::SeqCst);
        let wake = answer(self.wake);
        async move { wake.await.map(|_| ()) }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Event {
    Partial(DetectionResult),
    Final(DetectionResult),
}

#[derive(Default)]
pub(crate) struct RecordingListener {
    events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub(crate) fn partials(&self) -> Vec<DetectionResult> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Partial(result) => Some(result),
                Event::Final(_) => None,
            })
            .collect()
    }

    pub(crate) fn finals(&self) -> Vec<DetectionResult> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Final(result) => Some(result),
                Event::Partial(_) => None,
            })
            .collect()
    }

    /// Waits until `count` final results arrived, failing after a minute.
    pub(crate) async fn wait_for_finals(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(60), async {
            while self.finals().len() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("final results did not arrive");
    }
}

impl ResultListener for RecordingListener {
    fn partial_result(&self, result: &DetectionResult) {
        self.events.lock().push(Event::Partial(result.clone()));
    }

    fn final_result(&self, result: &DetectionResult) {
        self.events.lock().push(Event::Final(result.clone()));
    }
}
