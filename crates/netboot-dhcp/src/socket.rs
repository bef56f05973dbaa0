//! UDP socket setup shared by the DHCP-family listeners

use crate::error::{DhcpError, Result};
use std::net::SocketAddrV4;
use tokio::net::UdpSocket;

/// Bind a broadcast-capable UDP socket, optionally pinned to `interface`
///
/// Must be called from within a Tokio runtime.
pub fn bind_broadcast(addr: SocketAddrV4, interface: Option<&str>) -> Result<UdpSocket> {
    let bind_failed = |source: std::io::Error| DhcpError::BindFailed {
        addr: addr.into(),
        source,
    };

    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(bind_failed)?;

    socket.set_reuse_address(true).map_err(bind_failed)?;
    socket.set_broadcast(true).map_err(bind_failed)?;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    if let Some(interface) = interface {
        socket
            .bind_device(Some(interface.as_bytes()))
            .map_err(bind_failed)?;
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let _ = interface;

    socket.bind(&addr.into()).map_err(bind_failed)?;
    socket.set_nonblocking(true).map_err(bind_failed)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(bind_failed)
}
