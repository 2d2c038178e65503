use std::{collections::BTreeSet, time::Duration};

use crate::error::ConfigError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(2);

/// Slack added to the probe timeout before a cycle is forcibly finalized.
pub const CYCLE_GRACE: Duration = Duration::from_millis(100);

/// What to probe and how long to wait for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorConfig {
    pub host: String,
    pub tcp_ports: BTreeSet<u16>,
    pub arp_enabled: bool,
    pub icmp_enabled: bool,
    pub dhcp_enabled: bool,
    /// Upper bound of every single check.
    pub timeout: Duration,
    pub refresh_interval: Duration,
    /// How long a final result answers lookups without a new cycle.
    pub cache_ttl: Duration,
    /// Wake the device before each ARP probe, for phones that doze off.
    pub mobile_device: bool,
}

impl DetectorConfig {
    /// Time after which a running cycle is finalized with what it has.
    pub fn cycle_timeout(&self) -> Duration {
        self.timeout + CYCLE_GRACE
    }
}

#[derive(Debug, Clone)]
pub struct DetectorConfigBuilder {
    config: DetectorConfig,
}

impl DetectorConfigBuilder {
    pub fn new(host: &str) -> Self {
        Self {
            config: DetectorConfig {
                host: host.into(),
                tcp_ports: BTreeSet::new(),
                arp_enabled: true,
                icmp_enabled: true,
                dhcp_enabled: true,
                timeout: DEFAULT_TIMEOUT,
                refresh_interval: DEFAULT_REFRESH_INTERVAL,
                cache_ttl: DEFAULT_CACHE_TTL,
                mobile_device: false,
            },
        }
    }

    pub fn with_tcp_ports<I: IntoIterator<Item = u16>>(mut self, ports: I) -> Self {
        self.config.tcp_ports = ports.into_iter().collect();
        self
    }

    pub fn with_arp(mut self, enabled: bool) -> Self {
        self.config.arp_enabled = enabled;
        self
    }

    pub fn with_icmp(mut self, enabled: bool) -> Self {
        self.config.icmp_enabled = enabled;
        self
    }

    pub fn with_dhcp(mut self, enabled: bool) -> Self {
        self.config.dhcp_enabled = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.refresh_interval = interval;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    pub fn with_mobile_device(mut self, mobile: bool) -> Self {
        self.config.mobile_device = mobile;
        self
    }

    pub fn build(self) -> Result<DetectorConfig, ConfigError> {
        let config = self.config;
        if config.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        non_zero("timeout", config.timeout)?;
        non_zero("refresh interval", config.refresh_interval)?;
        Ok(config)
    }
}

pub(crate) fn non_zero(name: &'static str, duration: Duration) -> Result<Duration, ConfigError> {
    if duration.is_zero() {
        Err(ConfigError::ZeroDuration(name))
    } else {
        Ok(duration)
    }
}
