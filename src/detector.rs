use std::{
    collections::BTreeSet,
    future::Future,
    net::IpAddr,
    sync::{Arc, Weak},
    time::Duration,
};

use futures::FutureExt;
use log::{debug, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::{Delivery, ExpiringAsyncCache},
    capability::{DhcpObservationRegistry, DhcpObserver, NetworkCapability},
    config::{non_zero, DetectorConfig},
    cycle::{CycleId, CycleMonitor, Finalized},
    error::{ConfigError, Error, Result},
    listener::{Notifier, ResultListener},
    result::{DetectionResult, Evidence},
    schedule::{RepeatingTask, Scheduler},
    task::TaskHandle,
    worker::WorkerGroup,
};

/// Pause between waking a mobile device and probing it.
const WAKE_SETTLE: Duration = Duration::from_millis(50);

enum Check {
    Tcp(u16),
    Arp(String),
    Icmp,
}

#[derive(Default)]
struct AutomaticRefresh {
    schedule: Option<TaskHandle>,
    dhcp_address: Option<IpAddr>,
}

/// Decides whether a host is present by racing several kinds of probes.
///
/// A detection cycle runs every enabled check concurrently, one task per TCP
/// port, per network interface (ARP) and one for ICMP. Each success is
/// published as a partial result right away; once all checks are done, or the
/// cycle timed out, the final result is published and cached for the
/// configured time-to-live. At most one cycle runs at a time.
///
/// Dropping the detector abandons a running cycle without publishing it.
///
/// # Example
/// ```no_run
/// use async_presence::{
///     DetectionResult, DetectorConfigBuilder, PresenceDetector, ResultListener, SystemNetwork,
/// };
/// use std::sync::Arc;
///
/// struct Print;
///
/// impl ResultListener for Print {
///     fn partial_result(&self, result: &DetectionResult) {
///         println!("so far: {}", result);
///     }
///
///     fn final_result(&self, result: &DetectionResult) {
///         println!("verdict: {}", result);
///     }
/// }
///
/// tokio_test::block_on(async {
///     let config = DetectorConfigBuilder::new("192.168.1.20")
///         .with_tcp_ports([80, 443])
///         .build()
///         .unwrap();
///     let network = SystemNetwork::detect().await;
///     let detector = PresenceDetector::new(config, network, Arc::new(Print));
///     let result = detector.value().await.unwrap();
///     println!("reachable: {}", result.is_reachable());
/// })
/// ```
pub struct PresenceDetector<N: NetworkCapability> {
    shared: Arc<Shared<N>>,
}

struct Shared<N> {
    network: N,
    config: RwLock<DetectorConfig>,
    cache: ExpiringAsyncCache<DetectionResult>,
    monitor: Mutex<CycleMonitor>,
    notifier: Notifier,
    dhcp: Option<Arc<dyn DhcpObservationRegistry>>,
    refresh: Mutex<AutomaticRefresh>,
}

impl<N: NetworkCapability> PresenceDetector<N> {
    /// Creates a detector; must be called from within a tokio runtime.
    pub fn new(config: DetectorConfig, network: N, listener: Arc<dyn ResultListener>) -> Self {
        Self::build(config, network, listener, None)
    }

    /// Like [`PresenceDetector::new`], additionally watching for DHCP requests
    /// of the target while automatic refresh is running.
    pub fn with_dhcp_registry(
        config: DetectorConfig,
        network: N,
        listener: Arc<dyn ResultListener>,
        registry: Arc<dyn DhcpObservationRegistry>,
    ) -> Self {
        Self::build(config, network, listener, Some(registry))
    }

    fn build(
        config: DetectorConfig,
        network: N,
        listener: Arc<dyn ResultListener>,
        dhcp: Option<Arc<dyn DhcpObservationRegistry>>,
    ) -> Self {
        let shared = Shared {
            network,
            cache: ExpiringAsyncCache::new(config.cache_ttl),
            config: RwLock::new(config),
            monitor: Mutex::new(CycleMonitor::new()),
            notifier: Notifier::spawn(listener),
            dhcp,
            refresh: Mutex::new(AutomaticRefresh::default()),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn network(&self) -> &N {
        &self.shared.network
    }

    pub fn config(&self) -> DetectorConfig {
        self.shared.config.read().clone()
    }

    /// Points the detector at another host, discarding the cached result.
    pub fn set_host(&self, host: &str) -> Result<()> {
        if host.trim().is_empty() {
            return Err(ConfigError::EmptyHost.into());
        }
        self.shared.config.write().host = host.into();
        self.shared.monitor.lock().set_address(None);
        self.shared.cache.invalidate();
        Ok(())
    }

    pub fn set_tcp_ports<I: IntoIterator<Item = u16>>(&self, ports: I) {
        self.shared.config.write().tcp_ports = ports.into_iter().collect();
    }

    pub fn set_arp_enabled(&self, enabled: bool) {
        self.shared.config.write().arp_enabled = enabled;
    }

    pub fn set_icmp_enabled(&self, enabled: bool) {
        self.shared.config.write().icmp_enabled = enabled;
    }

    /// Takes effect the next time automatic refresh is started.
    pub fn set_dhcp_enabled(&self, enabled: bool) {
        self.shared.config.write().dhcp_enabled = enabled;
    }

    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        self.shared.config.write().timeout = non_zero("timeout", timeout)?;
        Ok(())
    }

    /// Takes effect the next time automatic refresh is started.
    pub fn set_refresh_interval(&self, interval: Duration) -> Result<()> {
        self.shared.config.write().refresh_interval = non_zero("refresh interval", interval)?;
        Ok(())
    }

    pub fn set_cache_ttl(&self, ttl: Duration) {
        self.shared.config.write().cache_ttl = ttl;
        self.shared.cache.set_ttl(ttl);
    }

    pub fn set_mobile_device(&self, mobile: bool) {
        self.shared.config.write().mobile_device = mobile;
    }

    /// Whether a detection cycle is in progress.
    pub fn is_running(&self) -> bool {
        self.shared.monitor.lock().is_running()
    }

    /// Hands the current result to `callback`, running a cycle if the cached
    /// one expired. Concurrent callers share a single cycle.
    pub async fn get_value<C>(&self, callback: C)
    where
        C: FnOnce(DetectionResult) + Send + 'static,
    {
        let shared = &self.shared;
        shared.cache.get(|| shared.refresh_cache(), callback).await
    }

    /// Awaits the current result, running a cycle if the cached one expired.
    ///
    /// # Errors
    /// Returns [`Error::RefreshAborted`] when no cycle could be started (no
    /// check enabled, host not resolvable) and no earlier result exists, or when
    /// the detector was shut down meanwhile.
    pub async fn value(&self) -> Result<DetectionResult> {
        let shared = &self.shared;
        shared.cache.get_value(|| shared.refresh_cache()).await
    }

    /// Starts a detection cycle.
    ///
    /// Returns `false` without doing anything if a cycle is already running,
    /// the cached result is still valid, the host cannot be resolved or no
    /// check is enabled. With `wait_for_completion` this returns once the
    /// cycle has been finalized.
    pub async fn run_cycle(&self, wait_for_completion: bool) -> bool {
        self.shared.run_cycle(wait_for_completion).await
    }

    /// Runs a cycle every refresh interval, starting right away, and watches
    /// for DHCP requests of the target if enabled.
    pub async fn start_automatic_refresh(&self, scheduler: &dyn Scheduler) {
        self.shared.start_automatic_refresh(scheduler).await
    }

    pub fn stop_automatic_refresh(&self) {
        self.shared.stop_automatic_refresh()
    }

    /// Reports that `address` was seen sending a DHCP request.
    ///
    /// Publishes a partial result straight away; it neither finishes nor
    /// starts a cycle.
    pub fn on_dhcp_request_observed(&self, address: IpAddr) {
        self.shared.on_dhcp_request_observed(address)
    }

    /// Stops automatic refresh and abandons a running cycle.
    ///
    /// The abandoned cycle publishes nothing and leaves the cache untouched.
    /// Callers waiting for its value receive the previous one, if any.
    pub fn shutdown(&self) {
        self.shared.shutdown()
    }
}

impl<N: NetworkCapability> Drop for PresenceDetector<N> {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl<N: NetworkCapability> Shared<N> {
    async fn refresh_cache(self: &Arc<Self>) -> bool {
        self.run_cycle(false).await || self.monitor.lock().is_running()
    }

    async fn run_cycle(self: &Arc<Self>, wait_for_completion: bool) -> bool {
        if self.monitor.lock().is_running() {
            trace!("presence detection already running");
            return false;
        }
        if !self.cache.is_expired() {
            trace!("cached presence result is still valid");
            return false;
        }
        let config = self.config.read().clone();
        let address = match resolve(&config.host).await {
            Ok(address) => address,
            Err(err) => {
                debug!("skipping presence detection: {}", err);
                return false;
            }
        };
        let checks = self.plan(&config, address);
        if checks.is_empty() {
            debug!("no presence check enabled for {}", address);
            return false;
        }

        let cancel = CancellationToken::new();
        let deadline = Instant::now() + config.cycle_timeout();
        let id = {
            let mut monitor = self.monitor.lock();
            if !self.cache.is_expired() {
                return false;
            }
            match monitor.begin(address, checks.len(), deadline, cancel.clone()) {
                Some(id) => id,
                None => return false,
            }
        };
        self.follow_address(address);

        let tasks = checks
            .into_iter()
            .map(|check| {
                let shared = Arc::clone(self);
                let (timeout, mobile) = (config.timeout, config.mobile_device);
                async move { shared.run_check(id, address, check, timeout, mobile).await }.boxed()
            })
            .collect();
        let workers = WorkerGroup::launch(&cancel, tasks);
        debug!(
            "detecting presence of {} with {} checks",
            address,
            workers.len()
        );
        let supervisor = tokio::task::spawn(Arc::clone(self).supervise(id, workers, deadline));
        if wait_for_completion {
            if let Err(err) = supervisor.await {
                warn!("presence detection of {} ended abnormally: {}", address, err);
            }
        }
        true
    }

    fn plan(&self, config: &DetectorConfig, address: IpAddr) -> Vec<Check> {
        let mut checks: Vec<Check> = config.tcp_ports.iter().copied().map(Check::Tcp).collect();
        if config.arp_enabled {
            if address.is_ipv4() {
                checks.extend(self.network.list_interfaces().into_iter().map(Check::Arp));
            } else {
                trace!("ARP does not apply to {}", address);
            }
        }
        if config.icmp_enabled {
            checks.push(Check::Icmp);
        }
        checks
    }

    async fn run_check(
        &self,
        id: CycleId,
        address: IpAddr,
        check: Check,
        timeout: Duration,
        mobile: bool,
    ) {
        let network = &self.network;
        let evidence = match check {
            Check::Tcp(port) => {
                let probe = network.try_connect(address, port, timeout);
                attempt("TCP connect", address, timeout, probe)
                    .await
                    .map(|latency| Evidence::tcp(port, latency))
            }
            Check::Arp(interface) => {
                let deadline = Instant::now() + timeout;
                if mobile {
                    self.wake(address, deadline).await;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                let probe = network.arp_probe(&interface, address, remaining);
                attempt("ARP probe", address, remaining, probe)
                    .await
                    .map(Evidence::arp)
            }
            Check::Icmp => {
                let probe = network.icmp_probe(address, timeout);
                attempt("ICMP ping", address, timeout, probe)
                    .await
                    .map(Evidence::icmp)
            }
        };
        self.check_finished(id, evidence);
    }

    /// Wakes `address` and lets it settle, giving up at `deadline`.
    async fn wake(&self, address: IpAddr, deadline: Instant) {
        let wake = async {
            if let Err(err) = self.network.wake_device(address).await {
                debug!("failed to wake {}: {}", address, err);
            }
            time::sleep(WAKE_SETTLE).await;
        };
        if time::timeout_at(deadline, wake).await.is_err() {
            debug!("waking {} took the whole check timeout", address);
        }
    }

    fn check_finished(&self, id: CycleId, evidence: Option<Evidence>) {
        let delivery = {
            let mut monitor = self.monitor.lock();
            if let Some(evidence) = evidence {
                if let Some(partial) = monitor.record(id, &evidence, Instant::now()) {
                    self.notifier.partial(partial);
                }
            }
            monitor
                .complete_check(id)
                .map(|finalized| self.publish(finalized))
        };
        if let Some(delivery) = delivery {
            delivery.deliver();
        }
    }

    async fn supervise(self: Arc<Self>, id: CycleId, workers: WorkerGroup, deadline: Instant) {
        if time::timeout_at(deadline, workers.join()).await.is_err() {
            debug!("presence detection timed out");
        }
        let delivery = {
            let mut monitor = self.monitor.lock();
            monitor
                .finalize(id)
                .map(|finalized| self.publish(finalized))
        };
        if let Some(delivery) = delivery {
            delivery.deliver();
        }
    }

    /// Caches and announces a final result. Called with the monitor locked,
    /// the returned cache waiters are served after unlocking.
    fn publish(&self, finalized: Finalized) -> Delivery<DetectionResult> {
        finalized.cancel.cancel();
        debug!("presence detection finished: {}", finalized.result);
        let delivery = self.cache.store(finalized.result.clone());
        self.notifier.final_result(finalized.result);
        delivery
    }

    /// Between cycles the merged result replaces the cached one with a fresh
    /// time-to-live, so lookups agree with what the listener was told.
    fn on_dhcp_request_observed(&self, address: IpAddr) {
        let delivery = {
            let mut monitor = self.monitor.lock();
            let idle = !monitor.is_running();
            let recovered = self.cache.value_ignoring_ttl();
            let Some(partial) = monitor.observe_dhcp(address, recovered, Instant::now()) else {
                trace!("ignoring DHCP request of {}", address);
                return;
            };
            let delivery = idle.then(|| self.cache.store(partial.clone()));
            self.notifier.partial(partial);
            delivery
        };
        if let Some(delivery) = delivery {
            delivery.deliver();
        }
    }

    async fn start_automatic_refresh(self: &Arc<Self>, scheduler: &dyn Scheduler) {
        self.stop_automatic_refresh();
        let config = self.config.read().clone();

        let weak: Weak<Self> = Arc::downgrade(self);
        let task: RepeatingTask = Arc::new(move || {
            let weak = weak.clone();
            async move {
                if let Some(shared) = weak.upgrade() {
                    shared.run_cycle(true).await;
                }
            }
            .boxed()
        });
        let schedule = scheduler.schedule_repeating(task, Duration::ZERO, config.refresh_interval);
        let address = match resolve(&config.host).await {
            Ok(address) => Some(address),
            Err(err) => {
                warn!("automatic refresh started for unresolved host: {}", err);
                None
            }
        };

        let mut refresh = self.refresh.lock();
        refresh.schedule = Some(schedule);
        if let Some(address) = address {
            self.monitor.lock().set_address(Some(address));
            refresh.dhcp_address = self.register_dhcp(address);
        }
        info!(
            "automatic presence refresh of {} every {:?}",
            config.host, config.refresh_interval
        );
    }

    fn stop_automatic_refresh(&self) {
        let mut refresh = self.refresh.lock();
        if let Some(schedule) = refresh.schedule.take() {
            schedule.cancel();
            info!("automatic presence refresh stopped");
        }
        if let (Some(address), Some(registry)) = (refresh.dhcp_address.take(), &self.dhcp) {
            registry.unregister(address);
        }
    }

    /// Moves the DHCP registration along when the target's address changed.
    fn follow_address(self: &Arc<Self>, address: IpAddr) {
        let mut refresh = self.refresh.lock();
        if refresh.schedule.is_none() || refresh.dhcp_address == Some(address) {
            return;
        }
        if let (Some(previous), Some(registry)) = (refresh.dhcp_address.take(), &self.dhcp) {
            registry.unregister(previous);
        }
        refresh.dhcp_address = self.register_dhcp(address);
    }

    fn register_dhcp(self: &Arc<Self>, address: IpAddr) -> Option<IpAddr> {
        let registry = self.dhcp.as_ref()?;
        if !self.config.read().dhcp_enabled {
            return None;
        }
        let weak = Arc::downgrade(self);
        let observer: DhcpObserver = Arc::new(move |observed| {
            if let Some(shared) = weak.upgrade() {
                shared.on_dhcp_request_observed(observed);
            }
        });
        if let Err(err) = registry.register(address, observer) {
            warn!("DHCP requests of {} may go unnoticed: {}", address, err);
        }
        Some(address)
    }

    fn shutdown(&self) {
        self.stop_automatic_refresh();
        if let Some(cancel) = self.monitor.lock().abandon() {
            cancel.cancel();
            debug!("abandoned running presence detection");
        }
        self.cache.cancel_refresh();
    }
}

/// Runs one probe within `timeout`, returning its latency on success.
async fn attempt<F>(method: &str, address: IpAddr, timeout: Duration, probe: F) -> Option<Duration>
where
    F: Future<Output = Result<bool>>,
{
    let started = Instant::now();
    match time::timeout(timeout, probe).await {
        Ok(Ok(true)) => Some(started.elapsed()),
        Ok(Ok(false)) => {
            trace!("{} found no trace of {}", method, address);
            None
        }
        Ok(Err(err)) => {
            debug!("{} of {} failed: {}", method, address, err);
            None
        }
        Err(_) => {
            trace!("{} of {} timed out", method, address);
            None
        }
    }
}

pub(crate) async fn resolve(host: &str) -> Result<IpAddr> {
    if let Ok(address) = host.parse::<IpAddr>() {
        return Ok(address);
    }
    let addresses: BTreeSet<IpAddr> = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|_| Error::UnresolvableHost(host.into()))?
        .map(|socket| socket.ip())
        .collect();
    addresses
        .iter()
        .find(|address| address.is_ipv4())
        .or_else(|| addresses.iter().next())
        .copied()
        .ok_or_else(|| Error::UnresolvableHost(host.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DetectorConfigBuilder,
        dhcp::DhcpListenService,
        result::PresenceKind,
        schedule::TokioScheduler,
        testing::{Event, FakeNetwork, RecordingListener, Reply},
    };

    const HOST: &str = "192.168.1.20";

    fn host() -> IpAddr {
        HOST.parse().unwrap()
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn config() -> DetectorConfigBuilder {
        DetectorConfigBuilder::new(HOST)
            .with_arp(false)
            .with_icmp(false)
            .with_timeout(Duration::from_secs(1))
    }

    fn detector(
        config: DetectorConfigBuilder,
        network: FakeNetwork,
    ) -> (PresenceDetector<FakeNetwork>, Arc<RecordingListener>) {
        let listener = RecordingListener::new();
        let detector = PresenceDetector::new(config.build().unwrap(), network, listener.clone());
        (detector, listener)
    }

    #[tokio::test(start_paused = true)]
    async fn test_icmp_success_with_closed_ports() {
        let network = FakeNetwork::new()
            .with_tcp(80, Reply::Unreachable(ms(5)))
            .with_tcp(443, Reply::Unreachable(ms(5)))
            .with_icmp(Reply::Reachable(ms(12)));
        let (detector, listener) =
            detector(config().with_tcp_ports([80, 443]).with_icmp(true), network);

        assert!(detector.run_cycle(true).await);
        listener.wait_for_finals(1).await;

        assert_eq!(detector.network().calls(), 3);
        let events = listener.events();
        assert_eq!(events.len(), 2);
        let Event::Partial(partial) = &events[0] else {
            panic!("expected a partial result first, got {:?}", events[0]);
        };
        assert_eq!(
            partial.evidence().iter().copied().collect::<Vec<_>>(),
            [PresenceKind::IcmpPing]
        );
        assert_eq!(partial.latency(), Some(ms(12)));
        assert!(partial.reachable_ports().is_empty());
        assert_eq!(events[1], Event::Final(partial.clone()));
        assert!(!detector.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_enabled_is_a_no_op() {
        let (detector, listener) = detector(config(), FakeNetwork::new());

        assert!(!detector.run_cycle(true).await);
        assert!(matches!(detector.value().await, Err(Error::RefreshAborted)));
        time::sleep(Duration::from_secs(5)).await;

        assert!(listener.events().is_empty());
        assert_eq!(detector.network().calls(), 0);
        assert!(detector.shared.cache.value_ignoring_ttl().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_arp_skipped_for_ipv6_target() {
        let network = FakeNetwork::new().with_arp("eth0", Reply::Reachable(ms(1)));
        let (detector, _listener) =
            detector(DetectorConfigBuilder::new("fe80::1").with_icmp(false), network);

        assert!(!detector.run_cycle(true).await);
        assert_eq!(detector.network().calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dhcp_request_mid_cycle() {
        let network = FakeNetwork::new().with_icmp(Reply::Unreachable(ms(300)));
        let (detector, listener) = detector(config().with_icmp(true), network);

        assert!(detector.run_cycle(false).await);
        time::sleep(ms(10)).await;
        detector.on_dhcp_request_observed(host());
        time::sleep(ms(10)).await;

        let events = listener.events();
        assert_eq!(events.len(), 1);
        let Event::Partial(partial) = &events[0] else {
            panic!("expected a partial result, got {:?}", events[0]);
        };
        assert!(partial.has_evidence(PresenceKind::DhcpRequest));
        assert!(detector.is_running());

        listener.wait_for_finals(1).await;
        assert_eq!(listener.finals().len(), 1);
        assert!(listener.finals()[0].has_evidence(PresenceKind::DhcpRequest));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dhcp_request_for_other_host_is_ignored() {
        let network = FakeNetwork::new().with_icmp(Reply::Unreachable(ms(5)));
        let (detector, listener) = detector(config().with_icmp(true), network);
        assert!(detector.run_cycle(true).await);
        listener.wait_for_finals(1).await;

        detector.on_dhcp_request_observed("192.168.1.21".parse().unwrap());
        time::sleep(ms(10)).await;
        assert_eq!(listener.events().len(), 1);

        detector.on_dhcp_request_observed(host());
        time::sleep(ms(10)).await;
        assert_eq!(listener.partials().len(), 1);
        assert!(listener.partials()[0].has_evidence(PresenceKind::DhcpRequest));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_probes_time_out_unreachable() {
        let network = FakeNetwork::new()
            .with_tcp(22, Reply::Hangs)
            .with_icmp(Reply::Hangs);
        let (detector, listener) =
            detector(config().with_tcp_ports([22]).with_icmp(true), network);

        let started = Instant::now();
        assert!(detector.run_cycle(true).await);
        assert!(started.elapsed() <= detector.config().cycle_timeout());

        listener.wait_for_finals(1).await;
        assert!(listener.partials().is_empty());
        assert_eq!(
            listener.finals(),
            vec![DetectionResult::not_reachable(host())]
        );
        assert!(!detector.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_errors_count_as_no_evidence() {
        let network = FakeNetwork::new()
            .with_tcp(8080, Reply::Fails)
            .with_icmp(Reply::Reachable(ms(4)));
        let (detector, listener) =
            detector(config().with_tcp_ports([8080]).with_icmp(true), network);

        assert!(detector.run_cycle(true).await);
        listener.wait_for_finals(1).await;
        let verdict = &listener.finals()[0];
        assert!(verdict.is_reachable());
        assert!(verdict.reachable_ports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_results_never_regress() {
        let network = FakeNetwork::new()
            .with_tcp(80, Reply::Reachable(ms(30)))
            .with_tcp(443, Reply::Reachable(ms(10)))
            .with_icmp(Reply::Reachable(ms(20)));
        let (detector, listener) =
            detector(config().with_tcp_ports([80, 443]).with_icmp(true), network);

        assert!(detector.run_cycle(true).await);
        listener.wait_for_finals(1).await;

        let partials = listener.partials();
        assert_eq!(partials.len(), 3);
        for pair in partials.windows(2) {
            assert!(pair[1].latency() <= pair[0].latency());
            assert!(pair[1].evidence().is_superset(pair[0].evidence()));
        }
        let verdict = &listener.finals()[0];
        assert_eq!(verdict.latency(), Some(ms(10)));
        assert_eq!(
            verdict.reachable_ports().iter().copied().collect::<Vec<_>>(),
            [80, 443]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_mobile_device_is_woken_before_arp() {
        let network = FakeNetwork::new()
            .with_arp("eth0", Reply::Reachable(ms(3)))
            .with_arp("wlan0", Reply::Unreachable(ms(3)));
        let (detector, listener) =
            detector(config().with_arp(true).with_mobile_device(true), network);

        assert!(detector.run_cycle(true).await);
        listener.wait_for_finals(1).await;
        assert_eq!(detector.network().wakes(), 2);
        assert_eq!(detector.network().calls(), 2);
        assert!(listener.finals()[0].has_evidence(PresenceKind::ArpPing));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mobile_arp_check_fits_its_timeout() {
        let network = FakeNetwork::new()
            .with_arp("eth0", Reply::Hangs)
            .with_wake(Reply::Hangs);
        let (detector, listener) =
            detector(config().with_arp(true).with_mobile_device(true), network);

        let started = Instant::now();
        assert!(detector.run_cycle(true).await);
        assert!(started.elapsed() < detector.config().cycle_timeout());
        listener.wait_for_finals(1).await;
        assert!(!listener.finals()[0].is_reachable());
    }

    #[tokio::test]
    async fn test_early_evidence_outlives_hanging_wake() {
        let network = FakeNetwork::new()
            .with_tcp(80, Reply::Reachable(Duration::ZERO))
            .with_arp("eth0", Reply::Hangs)
            .with_wake(Reply::Hangs);
        let (detector, listener) = detector(
            config()
                .with_tcp_ports([80])
                .with_arp(true)
                .with_mobile_device(true)
                .with_timeout(ms(200)),
            network,
        );

        assert!(detector.run_cycle(true).await);
        listener.wait_for_finals(1).await;

        let partials = listener.partials();
        assert_eq!(partials.len(), 1);
        let verdict = &listener.finals()[0];
        assert!(verdict.is_reachable());
        assert!(verdict.has_evidence(PresenceKind::TcpConnection));
        assert_eq!(verdict, &partials[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dhcp_between_cycles_updates_cached_value() {
        let network = FakeNetwork::new().with_icmp(Reply::Unreachable(ms(5)));
        let (detector, listener) = detector(config().with_icmp(true), network);
        assert!(detector.run_cycle(true).await);
        listener.wait_for_finals(1).await;
        assert!(!detector.value().await.unwrap().is_reachable());

        detector.on_dhcp_request_observed(host());
        let cached = detector.value().await.unwrap();
        assert!(cached.is_reachable());
        assert!(cached.has_evidence(PresenceKind::DhcpRequest));
        assert_eq!(detector.network().calls(), 1);

        time::sleep(ms(10)).await;
        assert_eq!(listener.partials(), vec![cached]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_waiter_does_not_escape_cycle() {
        let network = FakeNetwork::new().with_icmp(Reply::Hangs);
        let (detector, listener) = detector(config().with_icmp(true), network);

        // the timeout path delivers to waiters from the supervisor task
        let (ran, _) = tokio::join!(detector.run_cycle(true), async {
            tokio::task::yield_now().await;
            detector
                .get_value(|_| panic!("waiter failed"))
                .await;
        });
        assert!(ran);
        assert!(!detector.is_running());
        listener.wait_for_finals(1).await;
        assert_eq!(listener.finals().len(), 1);
        assert_eq!(
            detector.value().await.unwrap(),
            DetectionResult::not_reachable(host())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_cycle_at_a_time() {
        let network = FakeNetwork::new().with_icmp(Reply::Reachable(ms(50)));
        let (detector, listener) = detector(config().with_icmp(true), network);

        let (first, second) = tokio::join!(detector.run_cycle(false), detector.run_cycle(false));
        assert!(first ^ second);
        assert!(detector.is_running());

        listener.wait_for_finals(1).await;
        assert_eq!(detector.network().calls(), 1);
        assert!(!detector.run_cycle(true).await, "cached result is still valid");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_lookups_share_one_cycle() {
        let network = FakeNetwork::new().with_icmp(Reply::Reachable(ms(20)));
        let (detector, listener) = detector(config().with_icmp(true), network);

        let (a, b, c) = tokio::join!(detector.value(), detector.value(), detector.value());
        let a = a.unwrap();
        assert_eq!(a, b.unwrap());
        assert_eq!(a, c.unwrap());
        assert!(a.has_evidence(PresenceKind::IcmpPing));
        assert_eq!(detector.network().calls(), 1);

        listener.wait_for_finals(1).await;
        assert_eq!(listener.finals().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_while_cycle_runs_gets_its_result() {
        let network = FakeNetwork::new().with_icmp(Reply::Reachable(ms(40)));
        let (detector, _listener) = detector(config().with_icmp(true), network);

        assert!(detector.run_cycle(false).await);
        let (tx, rx) = tokio::sync::oneshot::channel();
        detector
            .get_value(move |result| {
                let _ = tx.send(result);
            })
            .await;
        let result = rx.await.unwrap();
        assert_eq!(result.latency(), Some(ms(40)));
        assert_eq!(detector.network().calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_running_cycle() {
        let network = FakeNetwork::new().with_icmp(Reply::Hangs);
        let (detector, listener) = detector(config().with_icmp(true), network);

        let (value, _) = tokio::join!(detector.value(), async {
            time::sleep(ms(100)).await;
            detector.shutdown();
        });
        assert!(matches!(value, Err(Error::RefreshAborted)));
        assert!(!detector.is_running());

        time::sleep(Duration::from_secs(5)).await;
        assert!(listener.events().is_empty());
        assert!(detector.shared.cache.value_ignoring_ttl().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_automatic_refresh_and_dhcp_registration() {
        let network = FakeNetwork::new().with_icmp(Reply::Reachable(ms(5)));
        let registry = Arc::new(DhcpListenService::passive());
        let listener = RecordingListener::new();
        let config = config()
            .with_icmp(true)
            .with_refresh_interval(Duration::from_secs(10))
            .with_cache_ttl(Duration::from_secs(1))
            .build()
            .unwrap();
        let detector =
            PresenceDetector::with_dhcp_registry(config, network, listener.clone(), registry.clone());

        detector.start_automatic_refresh(&TokioScheduler).await;
        assert!(registry.is_registered(host()));
        time::sleep(Duration::from_secs(25)).await;
        assert_eq!(listener.finals().len(), 3);

        registry.observe(host());
        time::sleep(ms(10)).await;
        let last = listener.events().pop().unwrap();
        let Event::Partial(partial) = last else {
            panic!("expected a DHCP partial result, got {:?}", last);
        };
        assert!(partial.has_evidence(PresenceKind::DhcpRequest));
        assert!(partial.has_evidence(PresenceKind::IcmpPing));

        detector.stop_automatic_refresh();
        assert!(!registry.is_registered(host()));
        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(listener.finals().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_host_invalidates_cached_result() {
        let network = FakeNetwork::new().with_icmp(Reply::Reachable(ms(5)));
        let (detector, listener) = detector(config().with_icmp(true), network);
        assert!(detector.run_cycle(true).await);
        listener.wait_for_finals(1).await;

        assert!(detector.set_host("").is_err());
        detector.set_host("192.168.1.30").unwrap();
        assert!(detector.run_cycle(true).await);
        listener.wait_for_finals(2).await;
        assert_eq!(
            listener.finals()[1].address(),
            "192.168.1.30".parse::<IpAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_resolve_address_literals() {
        assert_eq!(resolve("10.1.1.4").await.unwrap(), "10.1.1.4".parse::<IpAddr>().unwrap());
        assert_eq!(resolve("::1").await.unwrap(), "::1".parse::<IpAddr>().unwrap());
    }
}
