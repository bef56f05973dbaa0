//! Listener wiring
//!
//! Binds every socket up front, then hands each one to the service that
//! serves it. Nothing is spawned here: if any bind fails, the sockets bound
//! so far are dropped with the partial list and startup aborts.

use crate::config::{HostBootConfig, SharedState};
use crate::error::{BoxError, Result, ServerError};
use crate::http;
use crate::supervisor::Service;
use async_trait::async_trait;
use axum::Router;
use netboot_dhcp::{bind_broadcast, DhcpServer, PxeResponder};
use netboot_dns::DnsServer;
use netboot_tftp::{DirectoryFileProvider, TftpServer};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tracing::info;

/// Bind all five listeners for `config`
///
/// Order: PXE, TFTP, HTTP, DHCP, DNS.
pub async fn bind_listeners(config: &HostBootConfig, shared: &SharedState) -> Result<Vec<Box<dyn Service>>> {
    let ip = config.server_ip;
    let ports = config.ports;
    let dhcp_config = config.dhcp_config();
    let router = http::router(config, shared)?;

    let pxe = udp("pxe", SocketAddrV4::new(ip, ports.pxe)).await?;
    let tftp = udp("tftp", SocketAddrV4::new(ip, ports.tftp)).await?;

    let http_addr = SocketAddr::from((ip, ports.http));
    let http = TcpListener::bind(http_addr)
        .await
        .map_err(|e| bind_error("http", http_addr, e))?;

    // Broadcasts only reach a wildcard socket
    let dhcp_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, ports.dhcp);
    let dhcp = bind_broadcast(dhcp_addr, Some(config.interface.as_str()))
        .map_err(|e| bind_error("dhcp", dhcp_addr.into(), e))?;

    let dns = udp("dns", SocketAddrV4::new(ip, ports.dns)).await?;

    info!(
        ip = %ip,
        interface = %config.interface,
        mode = config.mode.as_str(),
        "Bound all listeners"
    );

    let provider = DirectoryFileProvider::new(config.tftp_root());
    Ok(vec![
        Box::new(PxeService {
            responder: PxeResponder::new(dhcp_config.clone()),
            socket: pxe,
        }),
        Box::new(TftpService {
            server: TftpServer::new(Arc::new(provider)),
            socket: tftp,
        }),
        Box::new(HttpService {
            router,
            listener: http,
        }),
        Box::new(DhcpService {
            server: DhcpServer::new(dhcp_config),
            socket: dhcp,
        }),
        Box::new(DnsService {
            server: DnsServer::new(shared.records.clone(), config.forwarders.clone())
                .with_local_name(&config.controlplane),
            socket: dns,
        }),
    ])
}

async fn udp(service: &'static str, addr: SocketAddrV4) -> Result<UdpSocket> {
    UdpSocket::bind(addr)
        .await
        .map_err(|e| bind_error(service, addr.into(), e))
}

fn bind_error(service: &'static str, addr: SocketAddr, source: impl Into<BoxError>) -> ServerError {
    ServerError::Bind {
        service,
        addr,
        source: source.into(),
    }
}

struct PxeService {
    responder: PxeResponder,
    socket: UdpSocket,
}

#[async_trait]
impl Service for PxeService {
    fn name(&self) -> &'static str {
        "pxe"
    }

    async fn serve(self: Box<Self>, shutdown: watch::Receiver<bool>) -> std::result::Result<(), BoxError> {
        let PxeService { responder, socket } = *self;
        Ok(responder.serve(socket, shutdown).await?)
    }
}

struct TftpService {
    server: TftpServer,
    socket: UdpSocket,
}

#[async_trait]
impl Service for TftpService {
    fn name(&self) -> &'static str {
        "tftp"
    }

    async fn serve(self: Box<Self>, shutdown: watch::Receiver<bool>) -> std::result::Result<(), BoxError> {
        let TftpService { server, socket } = *self;
        Ok(server.serve(socket, shutdown).await?)
    }
}

struct HttpService {
    router: Router,
    listener: TcpListener,
}

#[async_trait]
impl Service for HttpService {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn serve(self: Box<Self>, mut shutdown: watch::Receiver<bool>) -> std::result::Result<(), BoxError> {
        let HttpService { router, listener } = *self;
        info!(addr = %listener.local_addr()?, "HTTP boot server started");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await?;

        info!("HTTP boot server shutting down");
        Ok(())
    }
}

struct DhcpService {
    server: DhcpServer,
    socket: UdpSocket,
}

#[async_trait]
impl Service for DhcpService {
    fn name(&self) -> &'static str {
        "dhcp"
    }

    async fn serve(self: Box<Self>, shutdown: watch::Receiver<bool>) -> std::result::Result<(), BoxError> {
        let DhcpService { server, socket } = *self;
        Ok(server.serve(socket, shutdown).await?)
    }
}

struct DnsService {
    server: DnsServer,
    socket: UdpSocket,
}

#[async_trait]
impl Service for DnsService {
    fn name(&self) -> &'static str {
        "dns"
    }

    async fn serve(self: Box<Self>, shutdown: watch::Receiver<bool>) -> std::result::Result<(), BoxError> {
        let DnsService { server, socket } = *self;
        Ok(server.serve(socket, shutdown).await?)
    }
}
