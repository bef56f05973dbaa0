//! Bootstrap DHCP client
//!
//! Runs the DISCOVER / OFFER / REQUEST / ACK exchange on one interface to
//! learn whether another DHCP server owns the network. The exchange has no
//! deadline of its own: callers bound it with a timeout, and dropping the
//! future releases the socket.

use crate::error::{DhcpError, Result};
use crate::packet::format_mac;
use crate::socket::bind_broadcast;
use dhcproto::v4::{DhcpOption, Flags, Message, MessageType, Opcode, OptionCode};
use dhcproto::{Decodable, Encodable};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// Interval between retransmissions of an unanswered message
const RETRANSMIT: Duration = Duration::from_secs(2);

/// Address configuration handed out by an upstream DHCP server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub routers: Vec<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub server_id: Ipv4Addr,
    pub lease_time: Option<Duration>,
}

impl Lease {
    /// Read a lease out of an ACK
    pub fn from_ack(ack: &Message) -> Result<Self> {
        let opts = ack.opts();

        let server_id = match opts.get(OptionCode::ServerIdentifier) {
            Some(DhcpOption::ServerIdentifier(ip)) => *ip,
            _ => ack.siaddr(),
        };
        let netmask = match opts.get(OptionCode::SubnetMask) {
            Some(DhcpOption::SubnetMask(mask)) => *mask,
            _ => return Err(DhcpError::NegotiationFailed("ACK without subnet mask".to_string())),
        };
        let routers = match opts.get(OptionCode::Router) {
            Some(DhcpOption::Router(routers)) => routers.clone(),
            _ => Vec::new(),
        };
        let dns_servers = match opts.get(OptionCode::DomainNameServer) {
            Some(DhcpOption::DomainNameServer(servers)) => servers.clone(),
            _ => Vec::new(),
        };
        let lease_time = match opts.get(OptionCode::AddressLeaseTime) {
            Some(DhcpOption::AddressLeaseTime(secs)) => Some(Duration::from_secs(u64::from(*secs))),
            _ => None,
        };

        if ack.yiaddr().is_unspecified() {
            return Err(DhcpError::NegotiationFailed("ACK without address".to_string()));
        }

        Ok(Self {
            address: ack.yiaddr(),
            netmask,
            routers,
            dns_servers,
            server_id,
            lease_time,
        })
    }
}

/// DHCP client bound to one interface
#[derive(Debug, Clone)]
pub struct DhcpClient {
    interface: String,
    hardware_addr: [u8; 6],
    hostname: Option<String>,
}

impl DhcpClient {
    pub fn new(interface: impl Into<String>, hardware_addr: [u8; 6]) -> Self {
        Self {
            interface: interface.into(),
            hardware_addr,
            hostname: None,
        }
    }

    /// Hostname sent in option 12
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Run the four-way exchange from port 68 on the client's interface
    pub async fn negotiate(&self) -> Result<Lease> {
        let socket = bind_broadcast(
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 68),
            Some(&self.interface),
        )?;
        let server = SocketAddr::new(Ipv4Addr::BROADCAST.into(), 67);
        self.negotiate_on(&socket, server).await
    }

    /// Run the exchange on an already bound socket, talking to `server`
    pub async fn negotiate_on(&self, socket: &UdpSocket, server: SocketAddr) -> Result<Lease> {
        let xid: u32 = rand::random();
        let mac = format_mac(&self.hardware_addr)?;
        info!(interface = %self.interface, mac = %mac, "Sending DHCP discover");

        let discover = self.build_discover(xid).to_vec().map_err(encode_err)?;
        let offer = exchange(socket, server, &discover, xid, &[MessageType::Offer]).await?;

        let offered = offer.yiaddr();
        let server_id = match offer.opts().get(OptionCode::ServerIdentifier) {
            Some(DhcpOption::ServerIdentifier(ip)) => *ip,
            _ => offer.siaddr(),
        };
        debug!(offered = %offered, server = %server_id, "Received DHCP offer");

        let request = self
            .build_request(xid, offered, server_id)
            .to_vec()
            .map_err(encode_err)?;
        let ack = exchange(
            socket,
            server,
            &request,
            xid,
            &[MessageType::Ack, MessageType::Nak],
        )
        .await?;

        if message_type(&ack) == Some(MessageType::Nak) {
            return Err(DhcpError::NegotiationFailed(format!(
                "server {} refused {}",
                server_id, offered
            )));
        }

        let lease = Lease::from_ack(&ack)?;
        info!(address = %lease.address, server = %lease.server_id, "Obtained DHCP lease");
        Ok(lease)
    }

    fn base_message(&self, xid: u32, message_type: MessageType) -> Message {
        let mut msg = Message::default();
        msg.set_opcode(Opcode::BootRequest);
        msg.set_xid(xid);
        msg.set_flags(Flags::default().set_broadcast());
        msg.set_chaddr(&self.hardware_addr);

        let opts = msg.opts_mut();
        opts.insert(DhcpOption::MessageType(message_type));
        opts.insert(DhcpOption::ParameterRequestList(vec![
            OptionCode::SubnetMask,
            OptionCode::Router,
            OptionCode::DomainNameServer,
            OptionCode::AddressLeaseTime,
        ]));
        if let Some(ref hostname) = self.hostname {
            opts.insert(DhcpOption::Hostname(hostname.clone()));
        }
        msg
    }

    fn build_discover(&self, xid: u32) -> Message {
        self.base_message(xid, MessageType::Discover)
    }

    fn build_request(&self, xid: u32, offered: Ipv4Addr, server_id: Ipv4Addr) -> Message {
        let mut msg = self.base_message(xid, MessageType::Request);
        msg.opts_mut().insert(DhcpOption::RequestedIpAddress(offered));
        msg.opts_mut().insert(DhcpOption::ServerIdentifier(server_id));
        msg
    }
}

fn encode_err(e: dhcproto::error::EncodeError) -> DhcpError {
    DhcpError::EncodeError(e.to_string())
}

fn message_type(msg: &Message) -> Option<MessageType> {
    match msg.opts().get(OptionCode::MessageType) {
        Some(DhcpOption::MessageType(mt)) => Some(*mt),
        _ => None,
    }
}

/// Send `packet` and retransmit until a BOOTREPLY for `xid` of an expected type arrives
async fn exchange(
    socket: &UdpSocket,
    server: SocketAddr,
    packet: &[u8],
    xid: u32,
    expected: &[MessageType],
) -> Result<Message> {
    let mut buf = [0u8; 1500];
    loop {
        socket.send_to(packet, server).await?;

        let deadline = tokio::time::Instant::now() + RETRANSMIT;
        loop {
            let (len, _) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Ok(received) => received?,
                Err(_) => break,
            };

            let Ok(reply) = Message::from_bytes(&buf[..len]) else {
                continue;
            };
            if reply.opcode() != Opcode::BootReply || reply.xid() != xid {
                continue;
            }
            if message_type(&reply).is_some_and(|mt| expected.contains(&mt)) {
                return Ok(reply);
            }
        }
        debug!(xid, "Retransmitting DHCP message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{DhcpRequest, DhcpResponseBuilder};

    const MAC: [u8; 6] = [0x52, 0x54, 0x00, 0xde, 0xad, 0x01];
    const UPSTREAM: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    fn client() -> DhcpClient {
        DhcpClient::new("lo", MAC).with_hostname("netboot")
    }

    #[test]
    fn test_request_carries_selection() {
        let msg = client().build_request(7, Ipv4Addr::new(10, 0, 0, 50), UPSTREAM);
        let parsed = DhcpRequest::parse(&msg.to_vec().unwrap()).unwrap();

        assert_eq!(parsed.message_type, MessageType::Request);
        assert_eq!(parsed.requested_ip, Some(Ipv4Addr::new(10, 0, 0, 50)));
        assert_eq!(parsed.server_id, Some(UPSTREAM));
        assert_eq!(parsed.mac_address, "52:54:00:de:ad:01");
    }

    #[test]
    fn test_lease_from_ack() {
        let request = DhcpRequest::parse(&client().build_discover(9).to_vec().unwrap()).unwrap();
        let ack = DhcpResponseBuilder::new(&request, MessageType::Ack, UPSTREAM)
            .with_offered_ip(Ipv4Addr::new(10, 0, 0, 50))
            .with_subnet_mask(Ipv4Addr::new(255, 255, 255, 0))
            .with_gateway(Some(UPSTREAM))
            .with_dns_servers(&[Ipv4Addr::new(10, 0, 0, 2)])
            .with_lease_time(600)
            .build();

        let lease = Lease::from_ack(&ack).unwrap();
        assert_eq!(
            lease,
            Lease {
                address: Ipv4Addr::new(10, 0, 0, 50),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                routers: vec![UPSTREAM],
                dns_servers: vec![Ipv4Addr::new(10, 0, 0, 2)],
                server_id: UPSTREAM,
                lease_time: Some(Duration::from_secs(600)),
            }
        );
    }

    /// Minimal upstream answering one DISCOVER and one REQUEST
    async fn fake_upstream(socket: UdpSocket, nak: bool) {
        let mut buf = [0u8; 1500];
        for _ in 0..2 {
            let (len, src) = socket.recv_from(&mut buf).await.unwrap();
            let request = DhcpRequest::parse(&buf[..len]).unwrap();
            let reply_type = match (request.message_type, nak) {
                (MessageType::Discover, _) => MessageType::Offer,
                (_, true) => MessageType::Nak,
                _ => MessageType::Ack,
            };
            let reply = DhcpResponseBuilder::new(&request, reply_type, UPSTREAM)
                .with_offered_ip(Ipv4Addr::new(10, 0, 0, 50))
                .with_subnet_mask(Ipv4Addr::new(255, 255, 0, 0))
                .with_gateway(Some(UPSTREAM))
                .build_bytes()
                .unwrap();
            socket.send_to(&reply, src).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_negotiate_against_upstream() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = upstream.local_addr().unwrap();
        tokio::spawn(fake_upstream(upstream, false));

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let lease = client().negotiate_on(&socket, server).await.unwrap();
        assert_eq!(lease.address, Ipv4Addr::new(10, 0, 0, 50));
        assert_eq!(lease.netmask, Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(lease.routers, vec![UPSTREAM]);
    }

    #[tokio::test]
    async fn test_nak_fails_negotiation() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = upstream.local_addr().unwrap();
        tokio::spawn(fake_upstream(upstream, true));

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let err = client().negotiate_on(&socket, server).await.unwrap_err();
        assert!(matches!(err, DhcpError::NegotiationFailed(_)));
    }
}
