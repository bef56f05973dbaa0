//! DHCP server implementation
//!
//! Answers DHCP clients on a pre-bound socket. In proxy mode only PXE
//! clients are answered, with boot options and no address; in authoritative
//! mode addresses come from the shared [`LeasePool`](crate::lease::LeasePool).

use crate::config::{AuthoritativeLeasing, DhcpConfig, DhcpMode, PxeOptions};
use crate::error::{LeaseError, Result};
use crate::packet::{DhcpRequest, DhcpResponseBuilder};
use dhcproto::v4::MessageType;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Event emitted by the DHCP server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpEvent {
    /// Serving loop started
    Started { local_addr: SocketAddr },
    /// Reply sent to a client
    Response {
        mac: String,
        message_type: MessageType,
        offered_ip: Option<Ipv4Addr>,
    },
    /// Serving loop stopped
    Stopped,
}

/// A reply ready to be sent
#[derive(Debug, Clone)]
pub struct DhcpReply {
    pub message_type: MessageType,
    pub offered_ip: Option<Ipv4Addr>,
    pub bytes: Vec<u8>,
}

/// DHCP server
pub struct DhcpServer {
    config: DhcpConfig,
    event_sender: broadcast::Sender<DhcpEvent>,
}

impl std::fmt::Debug for DhcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhcpServer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DhcpServer {
    /// Create a new DHCP server
    pub fn new(config: DhcpConfig) -> Self {
        let (event_sender, _) = broadcast::channel(256);
        Self {
            config,
            event_sender,
        }
    }

    /// Subscribe to server events
    pub fn subscribe(&self) -> broadcast::Receiver<DhcpEvent> {
        self.event_sender.subscribe()
    }

    pub fn config(&self) -> &DhcpConfig {
        &self.config
    }

    /// Serve requests on `socket` until `shutdown` flips to true or its sender is dropped
    pub async fn serve(&self, socket: UdpSocket, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let local_addr = socket.local_addr()?;
        info!(addr = %local_addr, mode = self.config.mode.as_str(), "DHCP server started");
        let _ = self.event_sender.send(DhcpEvent::Started { local_addr });

        let mut buf = [0u8; 1500];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    let (len, _src) = result?;
                    if let Err(e) = self.handle_packet(&socket, &buf[..len]).await {
                        error!(error = %e, "Error handling DHCP packet");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("DHCP server shutting down");
        let _ = self.event_sender.send(DhcpEvent::Stopped);
        Ok(())
    }

    async fn handle_packet(&self, socket: &UdpSocket, data: &[u8]) -> Result<()> {
        let request = match DhcpRequest::parse(data) {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, "Ignoring malformed DHCP packet");
                return Ok(());
            }
        };

        debug!(
            mac = %request.mac_address,
            msg_type = ?request.message_type,
            is_pxe = request.is_pxe,
            is_ipxe = request.is_ipxe,
            "Received DHCP request"
        );

        let Some(reply) = self.respond(&request).await? else {
            return Ok(());
        };

        let dest = reply_destination(&request);
        socket.send_to(&reply.bytes, dest).await?;

        info!(
            mac = %request.mac_address,
            msg_type = ?reply.message_type,
            offered_ip = ?reply.offered_ip,
            dest = %dest,
            "Sent DHCP response"
        );
        let _ = self.event_sender.send(DhcpEvent::Response {
            mac: request.mac_address,
            message_type: reply.message_type,
            offered_ip: reply.offered_ip,
        });

        Ok(())
    }

    /// Decide the reply to `request`, if any
    pub async fn respond(&self, request: &DhcpRequest) -> Result<Option<DhcpReply>> {
        match &self.config.mode {
            DhcpMode::Proxy => self.respond_proxy(request),
            DhcpMode::Authoritative(leasing) => self.respond_authoritative(request, leasing).await,
        }
    }

    fn respond_proxy(&self, request: &DhcpRequest) -> Result<Option<DhcpReply>> {
        if !request.is_pxe {
            return Ok(None);
        }

        let message_type = match request.message_type {
            MessageType::Discover => MessageType::Offer,
            MessageType::Request => MessageType::Ack,
            _ => return Ok(None),
        };

        let bytes = DhcpResponseBuilder::new(request, message_type, self.config.server_ip)
            .with_pxe_options(self.pxe_options(request))
            .build_bytes()?;

        Ok(Some(DhcpReply {
            message_type,
            offered_ip: None,
            bytes,
        }))
    }

    async fn respond_authoritative(
        &self,
        request: &DhcpRequest,
        leasing: &AuthoritativeLeasing,
    ) -> Result<Option<DhcpReply>> {
        let pool = &leasing.pool;
        let mac = request.mac_address.as_str();

        match request.message_type {
            MessageType::Discover => match pool.allocate(mac, request.wanted_ip()).await {
                Ok(ip) => self.lease_reply(request, leasing, MessageType::Offer, ip).map(Some),
                Err(LeaseError::PoolExhausted { size }) => {
                    warn!(mac = %mac, size, "Address pool exhausted, no offer made");
                    Ok(None)
                }
                Err(e) => {
                    warn!(mac = %mac, error = %e, "Could not allocate address");
                    Ok(None)
                }
            },

            MessageType::Request => {
                if request
                    .server_id
                    .is_some_and(|id| id != self.config.server_ip)
                {
                    debug!(mac = %mac, "Client selected another server");
                    return Ok(None);
                }

                let wanted = request.wanted_ip();
                let confirmed = match pool.renew(mac, wanted).await {
                    Ok(ip) => Some(ip),
                    Err(LeaseError::NoLease(_)) => match pool.allocate(mac, wanted).await {
                        Ok(ip) if wanted.map_or(true, |w| w == ip) => Some(ip),
                        Ok(ip) => {
                            pool.release(ip).await;
                            None
                        }
                        Err(_) => None,
                    },
                    Err(e) => {
                        debug!(mac = %mac, error = %e, "Renewal refused");
                        None
                    }
                };

                match confirmed {
                    Some(ip) => self.lease_reply(request, leasing, MessageType::Ack, ip).map(Some),
                    None => {
                        debug!(mac = %mac, requested = ?wanted, "Refusing address");
                        let bytes = DhcpResponseBuilder::new(request, MessageType::Nak, self.config.server_ip)
                            .build_bytes()?;
                        Ok(Some(DhcpReply {
                            message_type: MessageType::Nak,
                            offered_ip: None,
                            bytes,
                        }))
                    }
                }
            }

            MessageType::Release => {
                pool.release(request.client_ip).await;
                Ok(None)
            }

            MessageType::Decline => {
                if let Some(ip) = request.requested_ip {
                    pool.release(ip).await;
                }
                Ok(None)
            }

            _ => Ok(None),
        }
    }

    fn lease_reply(
        &self,
        request: &DhcpRequest,
        leasing: &AuthoritativeLeasing,
        message_type: MessageType,
        ip: Ipv4Addr,
    ) -> Result<DhcpReply> {
        let lease_secs = u32::try_from(leasing.pool.lease_time().as_secs()).unwrap_or(u32::MAX);
        let gateway = self.config.gateway.or(Some(self.config.server_ip));
        let dns = if self.config.dns_servers.is_empty() {
            vec![self.config.server_ip]
        } else {
            self.config.dns_servers.clone()
        };

        let mut builder = DhcpResponseBuilder::new(request, message_type, self.config.server_ip)
            .with_offered_ip(ip)
            .with_subnet_mask(leasing.subnet_mask)
            .with_gateway(gateway)
            .with_dns_servers(&dns)
            .with_lease_time(lease_secs);

        if request.is_pxe {
            builder = builder.with_pxe_options(self.pxe_options(request));
        }

        Ok(DhcpReply {
            message_type,
            offered_ip: Some(ip),
            bytes: builder.build_bytes()?,
        })
    }

    fn pxe_options(&self, request: &DhcpRequest) -> PxeOptions {
        PxeOptions::for_client(&self.config, request.is_ipxe, request.is_uefi(), request.arch())
    }
}

/// Relay agent, then unicast to a configured client, then broadcast
fn reply_destination(request: &DhcpRequest) -> SocketAddr {
    if !request.relay_ip.is_unspecified() {
        SocketAddr::new(request.relay_ip.into(), 67)
    } else if !request.client_ip.is_unspecified() {
        SocketAddr::new(request.client_ip.into(), 68)
    } else {
        SocketAddr::new(Ipv4Addr::BROADCAST.into(), 68)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::{LeasePolicy, LeasePool};
    use crate::packet::tests::client_message;
    use dhcproto::v4::{DhcpOption, Message, OptionCode};
    use dhcproto::Decodable;
    use std::sync::Arc;
    use std::time::Duration;

    const SERVER: Ipv4Addr = Ipv4Addr::new(192, 168, 123, 1);
    const MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

    fn authoritative(first: u8, last: u8) -> DhcpServer {
        let pool = LeasePool::new(
            Ipv4Addr::new(192, 168, 123, first),
            Ipv4Addr::new(192, 168, 123, last),
            Duration::from_secs(3600),
        )
        .unwrap();
        with_pool(pool)
    }

    fn with_pool(pool: LeasePool) -> DhcpServer {
        let leasing = AuthoritativeLeasing {
            pool: Arc::new(pool),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
        };
        DhcpServer::new(DhcpConfig::new(SERVER).with_mode(DhcpMode::Authoritative(leasing)))
    }

    fn request(message_type: MessageType, extra: Vec<DhcpOption>) -> DhcpRequest {
        DhcpRequest::parse(&client_message(message_type, MAC, extra)).unwrap()
    }

    #[tokio::test]
    async fn test_proxy_ignores_non_pxe_clients() {
        let server = DhcpServer::new(DhcpConfig::new(SERVER));
        let reply = server.respond(&request(MessageType::Discover, vec![])).await.unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_proxy_offer_has_boot_file_and_no_address() {
        let server = DhcpServer::new(DhcpConfig::new(SERVER));
        let req = request(
            MessageType::Discover,
            vec![DhcpOption::ClassIdentifier(b"PXEClient:Arch:00000".to_vec())],
        );

        let reply = server.respond(&req).await.unwrap().unwrap();
        assert_eq!(reply.message_type, MessageType::Offer);
        assert_eq!(reply.offered_ip, None);

        let msg = Message::from_bytes(&reply.bytes).unwrap();
        assert!(msg.yiaddr().is_unspecified());
        assert!(matches!(
            msg.opts().get(OptionCode::BootfileName),
            Some(DhcpOption::BootfileName(name)) if name == b"undionly.kpxe"
        ));
    }

    #[tokio::test]
    async fn test_authoritative_discover_then_request() {
        let server = authoritative(2, 254);

        let offer = server
            .respond(&request(MessageType::Discover, vec![]))
            .await
            .unwrap()
            .unwrap();
        let ip = offer.offered_ip.unwrap();
        assert_eq!(ip, Ipv4Addr::new(192, 168, 123, 2));

        let msg = Message::from_bytes(&offer.bytes).unwrap();
        assert!(matches!(
            msg.opts().get(OptionCode::DomainNameServer),
            Some(DhcpOption::DomainNameServer(servers)) if servers == &vec![SERVER]
        ));

        let ack = server
            .respond(&request(
                MessageType::Request,
                vec![
                    DhcpOption::RequestedIpAddress(ip),
                    DhcpOption::ServerIdentifier(SERVER),
                ],
            ))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.message_type, MessageType::Ack);
        assert_eq!(ack.offered_ip, Some(ip));
    }

    #[tokio::test]
    async fn test_request_for_other_address_is_nakked() {
        let server = authoritative(2, 254);
        server
            .respond(&request(MessageType::Discover, vec![]))
            .await
            .unwrap();

        let nak = server
            .respond(&request(
                MessageType::Request,
                vec![DhcpOption::RequestedIpAddress(Ipv4Addr::new(192, 168, 123, 99))],
            ))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(nak.message_type, MessageType::Nak);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_pool_request_renews_held_lease() {
        let addr = Ipv4Addr::new(192, 168, 123, 2);
        let pool = LeasePool::new(addr, addr, Duration::from_secs(60))
            .unwrap()
            .with_policy(LeasePolicy::Strict);
        let server = with_pool(pool);

        let offer = server
            .respond(&request(MessageType::Discover, vec![]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(offer.offered_ip, Some(addr));

        tokio::time::advance(Duration::from_secs(50)).await;
        let ack = server
            .respond(&request(
                MessageType::Request,
                vec![
                    DhcpOption::RequestedIpAddress(addr),
                    DhcpOption::ServerIdentifier(SERVER),
                ],
            ))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.message_type, MessageType::Ack);
        assert_eq!(ack.offered_ip, Some(addr));

        // The original expiry has passed, the renewed lease still holds the address
        tokio::time::advance(Duration::from_secs(20)).await;
        let other = DhcpRequest::parse(&client_message(
            MessageType::Discover,
            [0x52, 0x54, 0x00, 0, 0, 1],
            vec![],
        ))
        .unwrap();
        assert!(server.respond(&other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_request_for_foreign_server_is_ignored() {
        let server = authoritative(2, 254);
        let reply = server
            .respond(&request(
                MessageType::Request,
                vec![DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 9, 9, 9))],
            ))
            .await
            .unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_exhausted_pool_makes_no_offer() {
        let server = authoritative(2, 2);
        let other = DhcpRequest::parse(&client_message(
            MessageType::Discover,
            [0x52, 0x54, 0x00, 0, 0, 1],
            vec![],
        ))
        .unwrap();
        assert!(server.respond(&other).await.unwrap().is_some());
        assert!(server
            .respond(&request(MessageType::Discover, vec![]))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let server = DhcpServer::new(DhcpConfig::new(SERVER));
        let mut events = server.subscribe();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { server.serve(socket, rx).await });
        assert!(matches!(events.recv().await.unwrap(), DhcpEvent::Started { .. }));

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(events.recv().await.unwrap(), DhcpEvent::Stopped);
    }
}
