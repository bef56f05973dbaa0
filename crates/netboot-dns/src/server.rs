//! DNS service
//!
//! Names held in the [`DnsRecordStore`], and names the server owns even
//! before anything is registered under them, are answered locally. Every other
//! query is relayed unchanged to the forwarders, tried in order; when none
//! of them answers the client gets SERVFAIL.

use crate::error::{DnsError, Result};
use crate::records::{normalize_name, DnsRecordStore};
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, TXT};
use hickory_proto::rr::{RData, Record, RecordType};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// TTL of locally answered records
pub const LOCAL_TTL: u32 = 60;

/// How long to wait for each forwarder
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(2);

/// Forwarding DNS server over a record store
#[derive(Debug, Clone)]
pub struct DnsServer {
    store: Arc<DnsRecordStore>,
    forwarders: Arc<[SocketAddr]>,
    local_names: Vec<String>,
    forward_timeout: Duration,
}

impl DnsServer {
    pub fn new(store: Arc<DnsRecordStore>, forwarders: Vec<SocketAddr>) -> Self {
        Self {
            store,
            forwarders: forwarders.into(),
            local_names: Vec::new(),
            forward_timeout: DEFAULT_FORWARD_TIMEOUT,
        }
    }

    /// Answer `name` authoritatively, with an empty NOERROR while it has no records
    pub fn with_local_name(mut self, name: &str) -> Self {
        self.local_names.push(normalize_name(name));
        self
    }

    pub fn with_forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout = timeout;
        self
    }

    pub fn forwarders(&self) -> &[SocketAddr] {
        &self.forwarders
    }

    /// Answer queries on `socket` until shutdown
    pub async fn serve(&self, socket: UdpSocket, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let socket = Arc::new(socket);
        info!(
            addr = %socket.local_addr()?,
            forwarders = ?self.forwarders,
            "DNS server started"
        );

        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    let (len, client) = result?;
                    let query = buf[..len].to_vec();
                    let server = self.clone();
                    let socket = socket.clone();
                    tokio::spawn(async move {
                        match server.answer(&query).await {
                            Ok(reply) => {
                                if let Err(e) = socket.send_to(&reply, client).await {
                                    warn!(client = %client, error = %e, "Failed to send DNS reply");
                                }
                            }
                            Err(e) => debug!(client = %client, error = %e, "Dropping DNS packet"),
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("DNS server shutting down");
        Ok(())
    }

    /// Produce the wire reply to a raw query
    pub async fn answer(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let request = Message::from_vec(packet)?;
        if request.message_type() != MessageType::Query {
            return Err(DnsError::NotAQuery);
        }

        if let Some(query) = request.queries().first() {
            let name = query.name().to_ascii();
            if self.is_local(&name) || self.store.contains(&name).await {
                debug!(name = %name, rtype = %query.query_type(), "Answering from record store");
                return Ok(self.local_answer(&request).await.to_vec()?);
            }
        }

        match self.forward(packet, request.id()).await {
            Some(reply) => Ok(reply),
            None => {
                warn!(forwarders = self.forwarders.len(), "All DNS forwarders failed");
                Ok(response_to(&request, ResponseCode::ServFail).to_vec()?)
            }
        }
    }

    fn is_local(&self, name: &str) -> bool {
        let name = normalize_name(name);
        self.local_names.iter().any(|local| *local == name)
    }

    async fn local_answer(&self, request: &Message) -> Message {
        let mut response = response_to(request, ResponseCode::NoError);
        response.set_authoritative(true);

        for query in request.queries() {
            let owner = query.name().clone();
            let name = owner.to_ascii();
            let qtype = query.query_type();
            let wants = |t: RecordType| qtype == t || qtype == RecordType::ANY;

            if wants(RecordType::A) {
                for addr in self.store.resolve(&name).await {
                    response.add_answer(a_record(&owner, addr));
                }
            }
            if wants(RecordType::AAAA) {
                for addr in self.store.resolve_v6(&name).await {
                    response.add_answer(aaaa_record(&owner, addr));
                }
            }
            if wants(RecordType::TXT) {
                for value in self.store.resolve_raw(&name).await {
                    response.add_answer(Record::from_rdata(
                        owner.clone(),
                        LOCAL_TTL,
                        RData::TXT(TXT::new(vec![value])),
                    ));
                }
            }
        }

        response
    }

    /// Relay `packet` to each forwarder in turn; the first matching reply wins
    async fn forward(&self, packet: &[u8], id: u16) -> Option<Vec<u8>> {
        for upstream in self.forwarders.iter() {
            match timeout(self.forward_timeout, relay(packet, *upstream, id)).await {
                Ok(Ok(reply)) => return Some(reply),
                Ok(Err(e)) => debug!(upstream = %upstream, error = %e, "Forwarder failed"),
                Err(_) => debug!(upstream = %upstream, "Forwarder timed out"),
            }
        }
        None
    }
}

async fn relay(packet: &[u8], upstream: SocketAddr, id: u16) -> std::io::Result<Vec<u8>> {
    let bind: SocketAddr = match upstream {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(upstream).await?;
    socket.send(packet).await?;

    let mut buf = vec![0u8; 4096];
    loop {
        let len = socket.recv(&mut buf).await?;
        if len >= 2 && u16::from_be_bytes([buf[0], buf[1]]) == id {
            buf.truncate(len);
            return Ok(buf);
        }
    }
}

fn response_to(request: &Message, code: ResponseCode) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(code);
    response.add_queries(request.queries().to_vec());
    response
}

fn a_record(owner: &hickory_proto::rr::Name, addr: Ipv4Addr) -> Record {
    Record::from_rdata(owner.clone(), LOCAL_TTL, RData::A(A(addr)))
}

fn aaaa_record(owner: &hickory_proto::rr::Name, addr: Ipv6Addr) -> Record {
    Record::from_rdata(owner.clone(), LOCAL_TTL, RData::AAAA(AAAA(addr)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::Name;
    use std::str::FromStr;

    fn query(name: &str, rtype: RecordType) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(0x4242)
            .set_message_type(MessageType::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(Name::from_str(name).unwrap(), rtype));
        msg.to_vec().unwrap()
    }

    async fn store_with_controlplane() -> Arc<DnsRecordStore> {
        let store = Arc::new(DnsRecordStore::new());
        store
            .register("controlplane.talos.", Ipv4Addr::new(192, 168, 123, 10))
            .await;
        store
            .register("controlplane.talos.", Ipv4Addr::new(192, 168, 123, 11))
            .await;
        store
    }

    #[tokio::test]
    async fn test_registered_name_is_answered_locally() {
        let server = DnsServer::new(store_with_controlplane().await, vec![]);

        let reply = server
            .answer(&query("controlplane.talos.", RecordType::A))
            .await
            .unwrap();
        let reply = Message::from_vec(&reply).unwrap();

        assert_eq!(reply.id(), 0x4242);
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        let addrs: Vec<_> = reply
            .answers()
            .iter()
            .filter_map(|r| match r.data() {
                RData::A(a) => Some(a.0),
                _ => None,
            })
            .collect();
        assert_eq!(
            addrs,
            vec![Ipv4Addr::new(192, 168, 123, 10), Ipv4Addr::new(192, 168, 123, 11)]
        );
    }

    #[tokio::test]
    async fn test_registered_name_without_aaaa_is_empty_noerror() {
        let server = DnsServer::new(store_with_controlplane().await, vec![]);
        let reply = server
            .answer(&query("controlplane.talos.", RecordType::AAAA))
            .await
            .unwrap();
        let reply = Message::from_vec(&reply).unwrap();
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert!(reply.answers().is_empty());
    }

    #[tokio::test]
    async fn test_owned_name_is_answered_before_any_registration() {
        // Would answer NXDOMAIN if consulted
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, from) = upstream.recv_from(&mut buf).await.unwrap();
            buf[2] |= 0x80;
            buf[3] = (buf[3] & 0xf0) | 3;
            upstream.send_to(&buf[..len], from).await.unwrap();
        });

        let store = Arc::new(DnsRecordStore::new());
        let server = DnsServer::new(store.clone(), vec![upstream_addr])
            .with_local_name("ControlPlane.Talos")
            .with_forward_timeout(Duration::from_millis(100));

        let reply = server
            .answer(&query("controlplane.talos.", RecordType::A))
            .await
            .unwrap();
        let reply = Message::from_vec(&reply).unwrap();
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert!(reply.authoritative());
        assert!(reply.answers().is_empty());

        store
            .register("controlplane.talos.", Ipv4Addr::new(192, 168, 123, 10))
            .await;
        let reply = server
            .answer(&query("controlplane.talos.", RecordType::A))
            .await
            .unwrap();
        assert_eq!(Message::from_vec(&reply).unwrap().answers().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_name_is_relayed_verbatim() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, from) = upstream.recv_from(&mut buf).await.unwrap();
            // Echo the query back with the QR bit set
            buf[2] |= 0x80;
            upstream.send_to(&buf[..len], from).await.unwrap();
        });

        let server = DnsServer::new(Arc::new(DnsRecordStore::new()), vec![upstream_addr]);
        let packet = query("example.com.", RecordType::A);
        let reply = server.answer(&packet).await.unwrap();

        assert_eq!(reply.len(), packet.len());
        assert_eq!(&reply[..2], &packet[..2]);
        assert_eq!(reply[2] & 0x80, 0x80);
    }

    #[tokio::test]
    async fn test_servfail_when_forwarders_fail() {
        // Bound but silent
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = DnsServer::new(
            Arc::new(DnsRecordStore::new()),
            vec![silent.local_addr().unwrap()],
        )
        .with_forward_timeout(Duration::from_millis(100));

        let reply = server
            .answer(&query("example.com.", RecordType::A))
            .await
            .unwrap();
        let reply = Message::from_vec(&reply).unwrap();
        assert_eq!(reply.response_code(), ResponseCode::ServFail);
        assert_eq!(reply.queries().len(), 1);
    }

    #[tokio::test]
    async fn test_serve_answers_over_udp() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let server = DnsServer::new(store_with_controlplane().await, vec![]);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { server.serve(socket, rx).await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&query("controlplane.talos.", RecordType::A), addr)
            .await
            .unwrap();
        let mut buf = [0u8; 512];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        let reply = Message::from_vec(&buf[..len]).unwrap();
        assert_eq!(reply.answers().len(), 2);

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
