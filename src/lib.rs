//! Asynchronous presence detection for hosts on the local network.
//!
//! A [`PresenceDetector`] decides whether a device is around by racing TCP
//! connects, ARP and ICMP pings against each other and listening for the
//! DHCP requests a device sends when it (re)joins the network. Results are
//! cached for a short time so that frequent callers share one detection.
//!
//! ## Example
//! Following example watches a single host and prints every result as it
//! arrives. Pass the host and, optionally, the TCP ports to try.
//! ```no_run
#![doc = include_str!("../demos/presence.rs")]
//! ```
//! Probing happens through the [`NetworkCapability`] given to the detector;
//! [`SystemNetwork`] is the implementation backed by real sockets.

pub mod cache;
pub mod capability;
pub mod config;
pub mod detector;
pub mod dhcp;
pub mod error;
pub mod listener;
pub mod result;
pub mod schedule;
pub mod system;
pub mod task;

pub(crate) mod cycle;
pub(crate) mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::ExpiringAsyncCache;
pub use capability::{DhcpObservationRegistry, DhcpObserver, NetworkCapability};
pub use config::{DetectorConfig, DetectorConfigBuilder};
pub use detector::PresenceDetector;
pub use dhcp::DhcpListenService;
pub use error::{ConfigError, Error, Result};
pub use listener::ResultListener;
pub use result::{DetectionResult, PresenceKind, NOT_REACHABLE};
pub use schedule::{RepeatingTask, Scheduler, TokioScheduler};
pub use system::SystemNetwork;
pub use task::TaskHandle;
