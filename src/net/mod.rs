//! Boundary with the systems this crate drives but does not implement.
//!
//! - [`Topology`]: path computation between two addresses
//! - [`HostProvisioner`]: transient host namespaces, services and neighbor entries
//! - [`PacketFilter`]: rule tables, counters and probe emission
//!
//! [`shell::ShellBackend`] drives real namespaces through `ip`, `iptables`
//! and `hping3`; [`sim::SimNetwork`] is an in-memory router fabric with the
//! same behavior at the counter level.

pub mod rules;
pub mod shell;
pub mod sim;

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ReachError, Result};
use crate::net::rules::{CountingRule, RuleCounter, RuleSelector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    /// Transports where a single probe may be lost without meaning anything.
    pub fn is_lossy(&self) -> bool {
        matches!(self, Protocol::Udp)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Icmp => write!(f, "icmp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ReachError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "icmp" => Ok(Protocol::Icmp),
            other => Err(ReachError::InvalidJob(format!("unknown protocol {other:?}"))),
        }
    }
}

/// A destination port and transport. ICMP services use port 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Service {
    pub port: u16,
    pub protocol: Protocol,
}

impl Service {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Udp,
        }
    }

    pub fn icmp() -> Self {
        Self {
            port: 0,
            protocol: Protocol::Icmp,
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.protocol {
            Protocol::Icmp => write!(f, "icmp"),
            _ => write!(f, "{}/{}", self.port, self.protocol),
        }
    }
}

/// Parses `80/tcp`, `53/udp`, `icmp`, or a bare port (TCP).
impl FromStr for Service {
    type Err = ReachError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("icmp") {
            return Ok(Service::icmp());
        }
        let (port, protocol) = match s.split_once('/') {
            Some((port, proto)) => (port, proto.parse()?),
            None => (s, Protocol::Tcp),
        };
        let port: u16 = port
            .parse()
            .map_err(|_| ReachError::InvalidJob(format!("invalid service {s:?}")))?;
        if protocol == Protocol::Icmp {
            return Ok(Service::icmp());
        }
        if port == 0 {
            return Err(ReachError::InvalidJob(format!("invalid service {s:?}")));
        }
        Ok(Service { port, protocol })
    }
}

/// A host namespace attached to a router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    pub name: String,
    pub address: IpAddr,
    pub router: String,
}

/// One probe emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    /// Namespace the packets leave from.
    pub origin: String,
    pub source: IpAddr,
    pub destination: IpAddr,
    pub service: Service,
    /// Isolation tag carried by the packets. `None` sends unmarked traffic.
    pub tag: Option<u8>,
    pub count: u32,
}

#[async_trait]
pub trait Topology: Send + Sync {
    /// Ordered list of routers a packet from `source` to `destination` crosses.
    async fn resolve_path(&self, source: IpAddr, destination: IpAddr) -> Result<Vec<String>>;
}

#[async_trait]
pub trait HostProvisioner: Send + Sync {
    /// Create a host namespace. Creating a host that already exists succeeds.
    async fn create_host(&self, host: &HostSpec) -> Result<()>;

    async fn remove_host(&self, name: &str) -> Result<()>;

    async fn create_ephemeral_service(&self, host: &str, service: &Service) -> Result<()>;

    async fn stop_service(&self, host: &str, service: &Service) -> Result<()>;

    /// Install a static neighbor entry for `address` on `router`.
    async fn add_neighbor(&self, router: &str, address: IpAddr) -> Result<()>;

    async fn remove_neighbor(&self, router: &str, address: IpAddr) -> Result<()>;
}

#[async_trait]
pub trait PacketFilter: Send + Sync {
    /// Append rules without touching any other rule in the table.
    async fn install_rules(&self, router: &str, rules: &[CountingRule]) -> Result<()>;

    /// Delete every rule this crate installed that matches `selector`.
    /// Returns the number of rules removed.
    async fn delete_rules(&self, router: &str, selector: &RuleSelector) -> Result<usize>;

    async fn read_counters(&self, router: &str, selector: &RuleSelector) -> Result<Vec<RuleCounter>>;

    async fn send_probe(&self, probe: &Probe) -> Result<()>;
}

/// The three external collaborators bundled for the workers.
#[derive(Clone)]
pub struct Backends {
    pub topology: Arc<dyn Topology>,
    pub hosts: Arc<dyn HostProvisioner>,
    pub filter: Arc<dyn PacketFilter>,
}

impl Backends {
    /// Use one value for all three roles.
    pub fn uniform<B>(backend: Arc<B>) -> Self
    where
        B: Topology + HostProvisioner + PacketFilter + 'static,
    {
        Self {
            topology: backend.clone(),
            hosts: backend.clone(),
            filter: backend,
        }
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}
