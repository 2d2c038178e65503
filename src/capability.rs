//! Interfaces of the collaborators a [`PresenceDetector`](crate::PresenceDetector) drives.

use std::{collections::BTreeSet, future::Future, net::IpAddr, sync::Arc, time::Duration};

use crate::error::Result;

/// Performs the individual reachability checks.
///
/// Every probe answers whether the host responded through that method.
/// `Ok(false)` and `Err(_)` are treated alike by the detector: the method found
/// nothing. Implementations should honour `timeout`, though the detector also
/// enforces it from the outside.
pub trait NetworkCapability: Send + Sync + 'static {
    fn try_connect(
        &self,
        address: IpAddr,
        port: u16,
        timeout: Duration,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn arp_probe(
        &self,
        interface: &str,
        address: IpAddr,
        timeout: Duration,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn icmp_probe(
        &self,
        address: IpAddr,
        timeout: Duration,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Names of the interfaces an ARP probe is sent from.
    fn list_interfaces(&self) -> BTreeSet<String>;

    /// Nudges a sleeping mobile device into answering ARP.
    fn wake_device(&self, address: IpAddr) -> impl Future<Output = Result<()>> + Send;
}

/// Invoked with the address that was seen sending a DHCP request.
pub type DhcpObserver = Arc<dyn Fn(IpAddr) + Send + Sync>;

/// Shares one DHCP listener among any number of watched addresses.
pub trait DhcpObservationRegistry: Send + Sync {
    /// Starts reporting DHCP requests for `address` to `observer`.
    ///
    /// An error means observations may not arrive; the registration itself
    /// is kept and can be undone with [`DhcpObservationRegistry::unregister`].
    fn register(&self, address: IpAddr, observer: DhcpObserver) -> Result<()>;

    fn unregister(&self, address: IpAddr);
}
