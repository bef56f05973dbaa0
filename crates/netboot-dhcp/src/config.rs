//! DHCP server configuration
//!
//! This module provides configuration types for the DHCP service,
//! including the operating mode and the PXE boot options it hands out.

use crate::lease::LeasePool;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Path iPXE clients are pointed at on the boot HTTP service
pub const IPXE_CHAIN_PATH: &str = "boot.ipxe";

/// Leasing state of an authoritative DHCP server
#[derive(Debug, Clone)]
pub struct AuthoritativeLeasing {
    /// Pool addresses are allocated from
    pub pool: Arc<LeasePool>,
    /// Subnet mask handed to clients
    pub subnet_mask: Ipv4Addr,
}

/// DHCP server operating mode
#[derive(Debug, Clone)]
pub enum DhcpMode {
    /// Another DHCP server owns the subnet
    ///
    /// Only PXE clients are answered, with boot options and no address.
    Proxy,

    /// This host leases addresses itself
    Authoritative(AuthoritativeLeasing),
}

impl DhcpMode {
    /// Short name for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            DhcpMode::Proxy => "proxy",
            DhcpMode::Authoritative(_) => "authoritative",
        }
    }
}

/// DHCP server configuration
#[derive(Debug, Clone)]
pub struct DhcpConfig {
    /// Server operating mode
    pub mode: DhcpMode,

    /// Interface the service is bound to
    pub interface: Option<String>,

    /// Server IP address (identifier, next-server and boot URL host)
    pub server_ip: Ipv4Addr,

    /// Default gateway advertised to leased clients
    pub gateway: Option<Ipv4Addr>,

    /// DNS servers advertised to leased clients
    pub dns_servers: Vec<Ipv4Addr>,

    /// HTTP port of the boot service
    pub http_port: u16,

    /// Override for the TFTP boot filename
    pub boot_filename: Option<String>,
}

impl DhcpConfig {
    /// Create a proxy-mode config for `server_ip`
    pub fn new(server_ip: Ipv4Addr) -> Self {
        Self {
            mode: DhcpMode::Proxy,
            interface: None,
            server_ip,
            gateway: None,
            dns_servers: Vec::new(),
            http_port: 8080,
            boot_filename: None,
        }
    }

    /// Set the operating mode
    pub fn with_mode(mut self, mode: DhcpMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the interface to bind to
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Set the gateway
    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Add a DNS server
    pub fn with_dns_server(mut self, dns: Ipv4Addr) -> Self {
        self.dns_servers.push(dns);
        self
    }

    /// Set the HTTP port
    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    /// Set the boot filename
    pub fn with_boot_filename(mut self, filename: impl Into<String>) -> Self {
        self.boot_filename = Some(filename.into());
        self
    }

    /// URL iPXE clients chain to
    pub fn ipxe_chain_url(&self) -> String {
        format!(
            "http://{}:{}/{}",
            self.server_ip, self.http_port, IPXE_CHAIN_PATH
        )
    }

    /// Get the appropriate boot filename based on architecture
    pub fn boot_file_for_arch(&self, is_uefi: bool, arch: Option<&str>) -> &str {
        if let Some(ref filename) = self.boot_filename {
            return filename;
        }

        match (is_uefi, arch) {
            (true, Some("aarch64")) => "arm64-efi/snp.efi",
            (true, _) => "ipxe.efi",
            (false, _) => "undionly.kpxe",
        }
    }
}

/// PXE boot options attached to a reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PxeOptions {
    /// TFTP server IP (option 66 and siaddr)
    pub tftp_server: Option<Ipv4Addr>,

    /// Boot filename (option 67 and file)
    pub boot_filename: Option<String>,

    /// Vendor class identifier (option 60)
    pub vendor_class: Option<String>,
}

impl PxeOptions {
    /// Options for a client: iPXE gets the chain URL, firmware PXE gets a binary over TFTP
    pub fn for_client(config: &DhcpConfig, is_ipxe: bool, is_uefi: bool, arch: Option<&str>) -> Self {
        if is_ipxe {
            Self {
                tftp_server: None,
                boot_filename: Some(config.ipxe_chain_url()),
                vendor_class: Some("PXEClient".to_string()),
            }
        } else {
            Self {
                tftp_server: Some(config.server_ip),
                boot_filename: Some(config.boot_file_for_arch(is_uefi, arch).to_string()),
                vendor_class: Some("PXEClient".to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dhcp_config_new_is_proxy() {
        let config = DhcpConfig::new(Ipv4Addr::new(192, 168, 1, 1));
        assert!(matches!(config.mode, DhcpMode::Proxy));
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.mode.as_str(), "proxy");
    }

    #[test]
    fn test_dhcp_config_builder() {
        let config = DhcpConfig::new(Ipv4Addr::new(10, 0, 0, 1))
            .with_interface("eth0")
            .with_gateway(Ipv4Addr::new(10, 0, 0, 254))
            .with_dns_server(Ipv4Addr::new(10, 0, 0, 1))
            .with_http_port(9090);

        assert_eq!(config.interface.as_deref(), Some("eth0"));
        assert_eq!(config.gateway, Some(Ipv4Addr::new(10, 0, 0, 254)));
        assert_eq!(config.dns_servers, vec![Ipv4Addr::new(10, 0, 0, 1)]);
        assert_eq!(config.ipxe_chain_url(), "http://10.0.0.1:9090/boot.ipxe");
    }

    #[test]
    fn test_boot_file_for_arch() {
        let config = DhcpConfig::new(Ipv4Addr::new(10, 0, 0, 1));

        assert_eq!(config.boot_file_for_arch(true, Some("x86_64")), "ipxe.efi");
        assert_eq!(config.boot_file_for_arch(true, None), "ipxe.efi");
        assert_eq!(
            config.boot_file_for_arch(true, Some("aarch64")),
            "arm64-efi/snp.efi"
        );
        assert_eq!(config.boot_file_for_arch(false, None), "undionly.kpxe");

        let config = config.with_boot_filename("custom.pxe");
        assert_eq!(config.boot_file_for_arch(true, Some("x86_64")), "custom.pxe");
    }

    #[test]
    fn test_pxe_options_for_ipxe_client_use_http() {
        let config = DhcpConfig::new(Ipv4Addr::new(192, 168, 123, 1));

        let pxe = PxeOptions::for_client(&config, true, true, Some("x86_64"));
        assert_eq!(pxe.tftp_server, None);
        assert_eq!(
            pxe.boot_filename.as_deref(),
            Some("http://192.168.123.1:8080/boot.ipxe")
        );

        let pxe = PxeOptions::for_client(&config, false, false, None);
        assert_eq!(pxe.tftp_server, Some(Ipv4Addr::new(192, 168, 123, 1)));
        assert_eq!(pxe.boot_filename.as_deref(), Some("undionly.kpxe"));
    }
}
