//! Host boot configuration
//!
//! Decided once by the bootstrap mode selector and read by every listener.
//! Only the record stores behind [`SharedState`] change after serving begins.

use crate::range::AddressRange;
use ipnetwork::Ipv4Network;
use netboot_dhcp::{AuthoritativeLeasing, DhcpConfig, DhcpMode, LeasePool};
use netboot_dns::DnsRecordStore;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

/// Default control-plane name
pub const DEFAULT_CONTROLPLANE: &str = "controlplane.talos.";

/// Forwarder used when neither an override nor a lease provides one
pub const DEFAULT_FORWARDER: SocketAddr =
    SocketAddr::V4(std::net::SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 53));

/// Listener ports
///
/// Boot firmware hardcodes these; only tests move them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ports {
    pub dns: u16,
    pub dhcp: u16,
    pub tftp: u16,
    pub http: u16,
    pub pxe: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            dns: 53,
            dhcp: 67,
            tftp: 69,
            http: 8080,
            pxe: 4011,
        }
    }
}

/// Another DHCP server leases addresses on the subnet
#[derive(Debug, Clone)]
pub struct ProxyMode {
    /// Network of the leased address
    pub network: Ipv4Network,
}

/// This host leases addresses itself
#[derive(Debug, Clone)]
pub struct AuthoritativeMode {
    pub network: Ipv4Network,
    pub range: AddressRange,
    pub pool: Arc<LeasePool>,
}

/// Outcome of bootstrap
#[derive(Debug, Clone)]
pub enum BootMode {
    Proxy(ProxyMode),
    Authoritative(AuthoritativeMode),
}

impl BootMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootMode::Proxy(_) => "proxy",
            BootMode::Authoritative(_) => "authoritative",
        }
    }

    pub fn network(&self) -> Ipv4Network {
        match self {
            BootMode::Proxy(mode) => mode.network,
            BootMode::Authoritative(mode) => mode.network,
        }
    }
}

/// Root configuration of one server instance
#[derive(Debug, Clone)]
pub struct HostBootConfig {
    /// Directory profiles, assets and TFTP files are served from
    pub root: PathBuf,
    pub interface: String,
    pub server_ip: Ipv4Addr,
    /// Gateway advertised to leased clients
    pub gateway: Ipv4Addr,
    /// Upstream resolvers for names not in the record store
    pub forwarders: Vec<SocketAddr>,
    /// Name elected control-plane nodes are registered under
    pub controlplane: String,
    pub ports: Ports,
    pub mode: BootMode,
}

impl HostBootConfig {
    /// Configuration for the DHCP and PXE services
    pub fn dhcp_config(&self) -> DhcpConfig {
        let mode = match &self.mode {
            BootMode::Proxy(_) => DhcpMode::Proxy,
            BootMode::Authoritative(auth) => DhcpMode::Authoritative(AuthoritativeLeasing {
                pool: auth.pool.clone(),
                subnet_mask: auth.network.mask(),
            }),
        };

        DhcpConfig::new(self.server_ip)
            .with_mode(mode)
            .with_interface(self.interface.clone())
            .with_gateway(self.gateway)
            .with_dns_server(self.server_ip)
            .with_http_port(self.ports.http)
    }

    pub fn tftp_root(&self) -> PathBuf {
        self.root.join("tftp")
    }

    pub fn assets_root(&self) -> PathBuf {
        self.root.join("assets")
    }
}

/// State shared by listeners
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    pub records: Arc<DnsRecordStore>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }
}
