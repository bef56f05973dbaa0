//! DHCP packet handling
//!
//! Decoding of client requests into the fields the responders care about,
//! and a builder for server replies carrying PXE options.

use crate::config::PxeOptions;
use crate::error::{DhcpError, Result};
use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode, OptionCode};
use dhcproto::{Decodable, Encodable};
use std::net::Ipv4Addr;

/// Client architecture types (RFC 4578, option 93)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientArch {
    IntelX86Bios,
    EfiX86,
    EfiX64,
    EfiArm32,
    EfiArm64,
    Unknown,
}

impl From<u16> for ClientArch {
    fn from(value: u16) -> Self {
        match value {
            0 => ClientArch::IntelX86Bios,
            6 => ClientArch::EfiX86,
            7 | 9 => ClientArch::EfiX64,
            10 => ClientArch::EfiArm32,
            11 => ClientArch::EfiArm64,
            _ => ClientArch::Unknown,
        }
    }
}

impl ClientArch {
    /// Check if this is a UEFI architecture
    pub fn is_uefi(&self) -> bool {
        !matches!(self, ClientArch::IntelX86Bios | ClientArch::Unknown)
    }

    /// Rust-style architecture name
    pub fn arch_string(&self) -> Option<&'static str> {
        match self {
            ClientArch::IntelX86Bios | ClientArch::EfiX86 => Some("x86"),
            ClientArch::EfiX64 => Some("x86_64"),
            ClientArch::EfiArm32 => Some("arm"),
            ClientArch::EfiArm64 => Some("aarch64"),
            ClientArch::Unknown => None,
        }
    }
}

/// Format a hardware address as lower-case colon-separated hex
pub fn format_mac(chaddr: &[u8]) -> Result<String> {
    let mac = chaddr
        .get(..6)
        .ok_or_else(|| DhcpError::InvalidMac(format!("{} byte chaddr", chaddr.len())))?;
    Ok(mac
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":"))
}

/// Parse a colon- or hyphen-separated MAC address
pub fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = mac.split(|c| c == ':' || c == '-').collect();
    if parts.len() != 6 {
        return Err(DhcpError::InvalidMac(mac.to_string()));
    }

    let mut out = [0u8; 6];
    for (slot, part) in out.iter_mut().zip(parts) {
        *slot = u8::from_str_radix(part, 16).map_err(|_| DhcpError::InvalidMac(mac.to_string()))?;
    }
    Ok(out)
}

/// Parsed DHCP request with extracted information
#[derive(Debug, Clone)]
pub struct DhcpRequest {
    /// Original message
    pub message: Message,

    /// Message type (DISCOVER, REQUEST, ...)
    pub message_type: MessageType,

    /// Client MAC address, used as the lease key
    pub mac_address: String,

    /// Client architecture (option 93)
    pub client_arch: Option<ClientArch>,

    /// Requested IP address (option 50)
    pub requested_ip: Option<Ipv4Addr>,

    /// Server the client selected (option 54)
    pub server_id: Option<Ipv4Addr>,

    /// Vendor class starts with "PXEClient" (option 60)
    pub is_pxe: bool,

    /// User class contains "iPXE" (option 77)
    pub is_ipxe: bool,

    /// Client IP (ciaddr)
    pub client_ip: Ipv4Addr,

    /// Relay agent IP (giaddr)
    pub relay_ip: Ipv4Addr,
}

impl DhcpRequest {
    /// Parse a client request from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        let message =
            Message::from_bytes(data).map_err(|e| DhcpError::ParseError(e.to_string()))?;

        if message.opcode() != Opcode::BootRequest {
            return Err(DhcpError::ParseError("not a BOOTREQUEST".to_string()));
        }

        let opts = message.opts();
        let message_type = match opts.get(OptionCode::MessageType) {
            Some(DhcpOption::MessageType(mt)) => *mt,
            _ => return Err(DhcpError::ParseError("missing message type".to_string())),
        };

        let client_arch = match opts.get(OptionCode::ClientSystemArchitecture) {
            Some(DhcpOption::ClientSystemArchitecture(arch)) => {
                Some(ClientArch::from(u16::from(*arch)))
            }
            _ => None,
        };

        let requested_ip = match opts.get(OptionCode::RequestedIpAddress) {
            Some(DhcpOption::RequestedIpAddress(ip)) => Some(*ip),
            _ => None,
        };

        let server_id = match opts.get(OptionCode::ServerIdentifier) {
            Some(DhcpOption::ServerIdentifier(ip)) => Some(*ip),
            _ => None,
        };

        let is_pxe = match opts.get(OptionCode::ClassIdentifier) {
            Some(DhcpOption::ClassIdentifier(class)) => class.starts_with(b"PXEClient"),
            _ => false,
        };

        let is_ipxe = match opts.get(OptionCode::UserClass) {
            Some(DhcpOption::UserClass(class)) => String::from_utf8_lossy(class).contains("iPXE"),
            _ => false,
        };

        Ok(Self {
            mac_address: format_mac(message.chaddr())?,
            client_ip: message.ciaddr(),
            relay_ip: message.giaddr(),
            message_type,
            client_arch,
            requested_ip,
            server_id,
            is_pxe,
            is_ipxe,
            message,
        })
    }

    /// Whether the client runs UEFI firmware
    pub fn is_uefi(&self) -> bool {
        self.client_arch.map(|a| a.is_uefi()).unwrap_or(false)
    }

    /// Architecture name, when known
    pub fn arch(&self) -> Option<&'static str> {
        self.client_arch.and_then(|a| a.arch_string())
    }

    /// Address the client asks to use: option 50, or ciaddr when renewing
    pub fn wanted_ip(&self) -> Option<Ipv4Addr> {
        self.requested_ip
            .or((!self.client_ip.is_unspecified()).then_some(self.client_ip))
    }
}

/// Builder for server replies
#[derive(Debug)]
pub struct DhcpResponseBuilder<'a> {
    request: &'a DhcpRequest,
    message_type: MessageType,
    server_ip: Ipv4Addr,
    offered_ip: Option<Ipv4Addr>,
    subnet_mask: Option<Ipv4Addr>,
    gateway: Option<Ipv4Addr>,
    dns_servers: Vec<Ipv4Addr>,
    lease_time: Option<u32>,
    pxe_options: Option<PxeOptions>,
}

impl<'a> DhcpResponseBuilder<'a> {
    /// Start a reply of `message_type` to `request`
    pub fn new(request: &'a DhcpRequest, message_type: MessageType, server_ip: Ipv4Addr) -> Self {
        Self {
            request,
            message_type,
            server_ip,
            offered_ip: None,
            subnet_mask: None,
            gateway: None,
            dns_servers: Vec::new(),
            lease_time: None,
            pxe_options: None,
        }
    }

    pub fn with_offered_ip(mut self, ip: Ipv4Addr) -> Self {
        self.offered_ip = Some(ip);
        self
    }

    pub fn with_subnet_mask(mut self, mask: Ipv4Addr) -> Self {
        self.subnet_mask = Some(mask);
        self
    }

    pub fn with_gateway(mut self, gateway: Option<Ipv4Addr>) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn with_dns_servers(mut self, servers: &[Ipv4Addr]) -> Self {
        self.dns_servers = servers.to_vec();
        self
    }

    pub fn with_lease_time(mut self, seconds: u32) -> Self {
        self.lease_time = Some(seconds);
        self
    }

    pub fn with_pxe_options(mut self, options: PxeOptions) -> Self {
        self.pxe_options = Some(options);
        self
    }

    /// Build the reply message
    pub fn build(self) -> Message {
        let request = &self.request.message;
        let mut response = Message::default();

        response.set_opcode(Opcode::BootReply);
        response.set_xid(request.xid());
        response.set_flags(request.flags());
        response.set_chaddr(request.chaddr());
        response.set_giaddr(request.giaddr());
        response.set_siaddr(self.server_ip);
        if let Some(ip) = self.offered_ip {
            response.set_yiaddr(ip);
        }

        let opts = response.opts_mut();
        opts.insert(DhcpOption::MessageType(self.message_type));
        opts.insert(DhcpOption::ServerIdentifier(self.server_ip));

        if let Some(mask) = self.subnet_mask {
            opts.insert(DhcpOption::SubnetMask(mask));
        }
        if let Some(gateway) = self.gateway {
            opts.insert(DhcpOption::Router(vec![gateway]));
        }
        if !self.dns_servers.is_empty() {
            opts.insert(DhcpOption::DomainNameServer(self.dns_servers));
        }
        if let Some(lease_time) = self.lease_time {
            opts.insert(DhcpOption::AddressLeaseTime(lease_time));
        }

        if let Some(pxe) = self.pxe_options {
            if let Some(vendor) = pxe.vendor_class {
                opts.insert(DhcpOption::ClassIdentifier(vendor.into_bytes()));
            }
            if let Some(tftp) = pxe.tftp_server {
                opts.insert(DhcpOption::TFTPServerName(tftp.to_string().into_bytes()));
            }
            if let Some(ref filename) = pxe.boot_filename {
                opts.insert(DhcpOption::BootfileName(filename.clone().into_bytes()));
            }
            // PXE discovery control (sub-option 6) = 8: boot the file named
            // here instead of running boot server discovery.
            opts.insert(DhcpOption::VendorExtensions(vec![0x06, 0x01, 0x08, 0xFF]));

            if let Some(tftp) = pxe.tftp_server {
                response.set_siaddr(tftp);
            }
            if let Some(filename) = pxe.boot_filename {
                response.set_fname_str(&filename);
            }
        }

        response
    }

    /// Build and encode the reply
    pub fn build_bytes(self) -> Result<Vec<u8>> {
        self.build()
            .to_vec()
            .map_err(|e| DhcpError::EncodeError(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn client_message(
        message_type: MessageType,
        mac: [u8; 6],
        extra: Vec<DhcpOption>,
    ) -> Vec<u8> {
        let mut msg = Message::default();
        msg.set_opcode(Opcode::BootRequest);
        msg.set_xid(0x1234_5678);
        msg.set_chaddr(&mac);
        msg.opts_mut().insert(DhcpOption::MessageType(message_type));
        for opt in extra {
            msg.opts_mut().insert(opt);
        }
        msg.to_vec().unwrap()
    }

    const MAC: [u8; 6] = [0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc];

    #[test]
    fn test_client_arch() {
        assert_eq!(ClientArch::from(0), ClientArch::IntelX86Bios);
        assert_eq!(ClientArch::from(7), ClientArch::EfiX64);
        assert_eq!(ClientArch::from(999), ClientArch::Unknown);
        assert!(ClientArch::EfiArm64.is_uefi());
        assert!(!ClientArch::IntelX86Bios.is_uefi());
        assert_eq!(ClientArch::EfiArm64.arch_string(), Some("aarch64"));
    }

    #[test]
    fn test_mac_helpers() {
        assert_eq!(format_mac(&MAC).unwrap(), "52:54:00:aa:bb:cc");
        assert_eq!(parse_mac("52-54-00-AA-BB-CC").unwrap(), MAC);
        assert!(parse_mac("52:54:00").is_err());
        assert!(format_mac(&[1, 2]).is_err());
    }

    #[test]
    fn test_parse_pxe_discover() {
        let bytes = client_message(
            MessageType::Discover,
            MAC,
            vec![
                DhcpOption::ClassIdentifier(b"PXEClient:Arch:00007:UNDI:003016".to_vec()),
                DhcpOption::UserClass(b"iPXE".to_vec()),
                DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 9)),
            ],
        );
        let request = DhcpRequest::parse(&bytes).unwrap();

        assert_eq!(request.message_type, MessageType::Discover);
        assert_eq!(request.mac_address, "52:54:00:aa:bb:cc");
        assert!(request.is_pxe);
        assert!(request.is_ipxe);
        assert_eq!(request.wanted_ip(), Some(Ipv4Addr::new(10, 0, 0, 9)));
    }

    #[test]
    fn test_build_offer_with_pxe() {
        let bytes = client_message(MessageType::Discover, MAC, vec![]);
        let request = DhcpRequest::parse(&bytes).unwrap();
        let server = Ipv4Addr::new(192, 168, 123, 1);

        let reply = DhcpResponseBuilder::new(&request, MessageType::Offer, server)
            .with_offered_ip(Ipv4Addr::new(192, 168, 123, 2))
            .with_subnet_mask(Ipv4Addr::new(255, 255, 255, 0))
            .with_gateway(Some(server))
            .with_dns_servers(&[server])
            .with_lease_time(3600)
            .with_pxe_options(PxeOptions {
                tftp_server: Some(server),
                boot_filename: Some("undionly.kpxe".to_string()),
                vendor_class: Some("PXEClient".to_string()),
            })
            .build();

        assert_eq!(reply.opcode(), Opcode::BootReply);
        assert_eq!(reply.xid(), 0x1234_5678);
        assert_eq!(reply.yiaddr(), Ipv4Addr::new(192, 168, 123, 2));
        assert_eq!(reply.siaddr(), server);
        assert!(matches!(
            reply.opts().get(OptionCode::BootfileName),
            Some(DhcpOption::BootfileName(name)) if name == b"undionly.kpxe"
        ));
        assert!(matches!(
            reply.opts().get(OptionCode::MessageType),
            Some(DhcpOption::MessageType(MessageType::Offer))
        ));
    }
}
