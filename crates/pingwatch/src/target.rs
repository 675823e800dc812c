//! Monitored targets as delivered by the device inventory.
//!
//! Targets are read-only to the engine: the inventory feed creates and
//! replaces them, the scheduler and the liveness tracker only read them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TargetError;

/// Stable unique key of a monitored device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Kind of reachability check to run against a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProbeKind {
    /// ICMP echo through the system `ping` binary
    #[default]
    Icmp,
    /// TCP connect to the given port
    Tcp { port: u16 },
    /// HTTP GET; defaults to `http://<host>/` when no url is given
    Http {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeKind::Icmp => write!(f, "icmp"),
            ProbeKind::Tcp { port } => write!(f, "tcp/{port}"),
            ProbeKind::Http { .. } => write!(f, "http"),
        }
    }
}

fn default_monitored() -> bool {
    true
}

/// A device the engine should (or should no longer) probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredTarget {
    pub device_id: DeviceId,

    /// Human readable name carried into transition events
    #[serde(default)]
    pub device_name: String,

    pub ip_address: String,

    /// Preferred over `ip_address` when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    pub probe_interval_ms: u64,

    #[serde(default = "default_monitored")]
    pub monitored: bool,

    #[serde(default)]
    pub probe: ProbeKind,
}

impl MonitoredTarget {
    /// Create an enabled ICMP target
    pub fn new(device_id: impl Into<DeviceId>, ip_address: impl Into<String>, probe_interval_ms: u64) -> Self {
        let device_id = device_id.into();
        Self {
            device_name: device_id.to_string(),
            device_id,
            ip_address: ip_address.into(),
            hostname: None,
            probe_interval_ms,
            monitored: true,
            probe: ProbeKind::Icmp,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_probe(mut self, probe: ProbeKind) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_monitored(mut self, monitored: bool) -> Self {
        self.monitored = monitored;
        self
    }

    /// Address to probe: hostname if set and non-empty, otherwise the IP
    pub fn host(&self) -> &str {
        match self.hostname.as_deref() {
            Some(hostname) if !hostname.trim().is_empty() => hostname,
            _ => &self.ip_address,
        }
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.probe_interval_ms)
    }

    /// Check the inventory record before it reaches the scheduler
    pub fn validate(&self) -> Result<(), TargetError> {
        if self.device_id.as_str().trim().is_empty() {
            return Err(TargetError::EmptyDeviceId);
        }
        if self.probe_interval_ms == 0 {
            return Err(TargetError::ZeroInterval(self.device_id.clone()));
        }
        if self.host().trim().is_empty() {
            return Err(TargetError::MissingAddress(self.device_id.clone()));
        }
        if let ProbeKind::Http { url: Some(url) } = &self.probe {
            url::Url::parse(url).map_err(|e| TargetError::InvalidUrl {
                device_id: self.device_id.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}
