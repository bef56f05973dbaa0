//! Bootstrap mode selection
//!
//! Before any listener starts, the host asks the network for an address. If
//! an upstream DHCP server answers, it keeps leasing and we run as a PXE
//! proxy next to it. If nobody answers in time, we take the static address
//! and lease the rest of its prefix ourselves.

use crate::config::{
    AuthoritativeMode, BootMode, HostBootConfig, Ports, ProxyMode, DEFAULT_CONTROLPLANE,
    DEFAULT_FORWARDER,
};
use crate::error::{Result, ServerError};
use crate::range::plan_range;
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use netboot_dhcp::{parse_mac, DhcpClient, Lease, LeasePool};
use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How long to wait for an upstream DHCP server
pub const DEFAULT_DHCP_TIMEOUT: Duration = Duration::from_secs(10);

/// Lease duration when leasing ourselves
pub const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(3600);

/// Inputs to bootstrap
#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    pub root: PathBuf,
    pub interface: String,
    /// Address and prefix used when no upstream lease is obtained
    pub static_cidr: Ipv4Network,
    pub gateway: Option<Ipv4Addr>,
    /// Replaces any learned forwarders when non-empty
    pub dns: Vec<SocketAddr>,
    pub controlplane: String,
    pub dhcp_timeout: Duration,
    pub lease_time: Duration,
    pub ports: Ports,
}

impl BootstrapOptions {
    pub fn new(interface: impl Into<String>, static_cidr: Ipv4Network) -> Self {
        Self {
            root: PathBuf::from("."),
            interface: interface.into(),
            static_cidr,
            gateway: None,
            dns: Vec::new(),
            controlplane: DEFAULT_CONTROLPLANE.to_string(),
            dhcp_timeout: DEFAULT_DHCP_TIMEOUT,
            lease_time: DEFAULT_LEASE_TIME,
            ports: Ports::default(),
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_gateway(mut self, gateway: Option<Ipv4Addr>) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn with_dns(mut self, dns: Vec<SocketAddr>) -> Self {
        self.dns = dns;
        self
    }

    pub fn with_controlplane(mut self, name: impl Into<String>) -> Self {
        self.controlplane = name.into();
        self
    }

    pub fn with_dhcp_timeout(mut self, timeout: Duration) -> Self {
        self.dhcp_timeout = timeout;
        self
    }

    pub fn with_lease_time(mut self, lease_time: Duration) -> Self {
        self.lease_time = lease_time;
        self
    }

    pub fn with_ports(mut self, ports: Ports) -> Self {
        self.ports = ports;
        self
    }
}

/// Obtains an address from an upstream DHCP server
#[async_trait]
pub trait LeaseNegotiator: Send + Sync {
    /// Dropping the returned future must release any socket it holds
    async fn negotiate(&self) -> netboot_dhcp::Result<Lease>;
}

#[async_trait]
impl LeaseNegotiator for DhcpClient {
    async fn negotiate(&self) -> netboot_dhcp::Result<Lease> {
        DhcpClient::negotiate(self).await
    }
}

/// Result of a link change that tolerates existing state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkChange {
    Applied,
    AlreadyPresent,
}

/// OS network interface configuration
#[async_trait]
pub trait LinkConfigurator: Send + Sync {
    async fn link_up(&self, interface: &str) -> Result<()>;

    async fn add_address(&self, interface: &str, address: Ipv4Network) -> Result<LinkChange>;

    async fn add_default_route(&self, interface: &str, gateway: Ipv4Addr) -> Result<LinkChange>;
}

/// Configures links with the iproute2 `ip` tool
#[derive(Debug, Clone, Default)]
pub struct IpLink;

impl IpLink {
    async fn run(&self, interface: &str, action: &str, args: &[&str]) -> Result<LinkChange> {
        let failed = |message: String| ServerError::LinkSetup {
            interface: interface.to_string(),
            action: action.to_string(),
            message,
        };

        debug!(interface = %interface, args = ?args, "Running ip");
        let output = Command::new("ip")
            .args(args)
            .output()
            .await
            .map_err(|e| failed(e.to_string()))?;

        if output.status.success() {
            return Ok(LinkChange::Applied);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("File exists") {
            return Ok(LinkChange::AlreadyPresent);
        }
        Err(failed(stderr.trim().to_string()))
    }
}

#[async_trait]
impl LinkConfigurator for IpLink {
    async fn link_up(&self, interface: &str) -> Result<()> {
        self.run(interface, "bring link up", &["link", "set", "dev", interface, "up"])
            .await
            .map(|_| ())
    }

    async fn add_address(&self, interface: &str, address: Ipv4Network) -> Result<LinkChange> {
        let cidr = address.to_string();
        self.run(
            interface,
            &format!("add address {}", cidr),
            &["addr", "add", &cidr, "dev", interface],
        )
        .await
    }

    async fn add_default_route(&self, interface: &str, gateway: Ipv4Addr) -> Result<LinkChange> {
        let via = gateway.to_string();
        self.run(
            interface,
            &format!("add default route via {}", via),
            &["route", "add", "default", "via", &via, "dev", interface],
        )
        .await
    }
}

/// Bring the link up, negotiate, and decide between proxy and authoritative mode
pub async fn select_mode(
    opts: &BootstrapOptions,
    negotiator: &dyn LeaseNegotiator,
    link: &dyn LinkConfigurator,
) -> Result<HostBootConfig> {
    link.link_up(&opts.interface).await?;
    info!(interface = %opts.interface, "Brought interface up");

    let lease = match timeout(opts.dhcp_timeout, negotiator.negotiate()).await {
        Ok(Ok(lease)) => Some(lease),
        Ok(Err(e)) => {
            info!(error = %e, "DHCP negotiation refused");
            None
        }
        Err(_) => {
            info!(timeout = ?opts.dhcp_timeout, "No DHCP server answered");
            None
        }
    };

    let (server_ip, mode, learned_gateway, learned_dns) = match lease {
        Some(lease) => {
            let mode = apply_lease(opts, &lease, link).await?;
            let dns = lease
                .dns_servers
                .iter()
                .map(|ip| SocketAddr::new((*ip).into(), 53))
                .collect();
            (lease.address, mode, lease.routers.first().copied(), dns)
        }
        None => {
            let mode = apply_static(opts, link).await?;
            (opts.static_cidr.ip(), mode, None, Vec::new())
        }
    };

    let gateway = match opts.gateway {
        Some(gw) => {
            info!(gateway = %gw, "Overriding gateway address");
            gw
        }
        None => learned_gateway.unwrap_or(server_ip),
    };

    let forwarders = if !opts.dns.is_empty() {
        info!(dns = ?opts.dns, "Overriding DNS forwarders");
        opts.dns.clone()
    } else if !learned_dns.is_empty() {
        learned_dns
    } else {
        vec![DEFAULT_FORWARDER]
    };

    info!(
        mode = mode.as_str(),
        ip = %server_ip,
        gateway = %gateway,
        forwarders = ?forwarders,
        "Bootstrap complete"
    );

    Ok(HostBootConfig {
        root: opts.root.clone(),
        interface: opts.interface.clone(),
        server_ip,
        gateway,
        forwarders,
        controlplane: opts.controlplane.clone(),
        ports: opts.ports,
        mode,
    })
}

async fn apply_lease(
    opts: &BootstrapOptions,
    lease: &Lease,
    link: &dyn LinkConfigurator,
) -> Result<BootMode> {
    info!(address = %lease.address, server = %lease.server_id, "Obtained address");
    let network = Ipv4Network::with_netmask(lease.address, lease.netmask)
        .map_err(|e| ServerError::InvalidLease(e.to_string()))?;

    if link.add_address(&opts.interface, network).await? == LinkChange::AlreadyPresent {
        debug!(address = %network, "Address already assigned");
    }
    for router in &lease.routers {
        info!(gateway = %router, "Adding default route");
        if link.add_default_route(&opts.interface, *router).await? == LinkChange::AlreadyPresent {
            debug!(gateway = %router, "Default route already present");
        }
    }

    Ok(BootMode::Proxy(ProxyMode { network }))
}

async fn apply_static(opts: &BootstrapOptions, link: &dyn LinkConfigurator) -> Result<BootMode> {
    let host = opts.static_cidr.ip();
    let range = plan_range(opts.static_cidr, host)?;
    info!(
        address = %opts.static_cidr,
        first = %range.first,
        last = %range.last,
        "Setting static address and leasing the subnet"
    );

    let mut pool = LeasePool::new(range.first, range.last, opts.lease_time)?;
    if let Some(reserved) = range.reserved {
        pool = pool.with_reserved(reserved);
    }

    if link.add_address(&opts.interface, opts.static_cidr).await? == LinkChange::AlreadyPresent {
        debug!(address = %opts.static_cidr, "Address already assigned");
    }

    Ok(BootMode::Authoritative(AuthoritativeMode {
        network: opts.static_cidr,
        range,
        pool: Arc::new(pool),
    }))
}

/// Non-loopback interfaces
pub fn valid_interfaces() -> Result<Vec<NetworkInterface>> {
    let interfaces = NetworkInterface::show().map_err(|e| {
        warn!(error = %e, "Failed to list network interfaces");
        ServerError::NoInterfaces
    })?;

    let valid: Vec<_> = interfaces
        .into_iter()
        .filter(|iface| !iface.name.starts_with("lo"))
        .filter(|iface| {
            !iface.addr.iter().any(|addr| match addr {
                Addr::V4(v4) => v4.ip.is_loopback(),
                Addr::V6(v6) => v6.ip.is_loopback(),
            })
        })
        .collect();

    if valid.is_empty() {
        return Err(ServerError::NoInterfaces);
    }
    Ok(valid)
}

/// Hardware address of `name`
pub fn interface_hardware_addr(name: &str) -> Result<[u8; 6]> {
    let interfaces =
        NetworkInterface::show().map_err(|_| ServerError::InterfaceNotFound(name.to_string()))?;
    let iface = interfaces
        .into_iter()
        .find(|iface| iface.name == name)
        .ok_or_else(|| ServerError::InterfaceNotFound(name.to_string()))?;

    iface
        .mac_addr
        .as_deref()
        .and_then(|mac| parse_mac(mac).ok())
        .filter(|mac| mac.iter().any(|b| *b != 0))
        .ok_or_else(|| ServerError::NoHardwareAddress(name.to_string()))
}
