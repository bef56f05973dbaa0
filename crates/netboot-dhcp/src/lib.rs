//! Netboot DHCP services
//!
//! DHCP-family protocol handling for a network boot server:
//!
//! - [`DhcpServer`] answers on UDP 67, either as a proxy that only adds PXE
//!   boot options alongside another DHCP server, or authoritatively with
//!   addresses from a [`LeasePool`].
//! - [`PxeResponder`] answers PXE boot-server requests on UDP 4011.
//! - [`DhcpClient`] runs the bootstrap exchange that decides between the two.
//!
//! # Example
//!
//! ```ignore
//! use netboot_dhcp::{bind_broadcast, DhcpConfig, DhcpServer};
//! use std::net::{Ipv4Addr, SocketAddrV4};
//!
//! let config = DhcpConfig::new(Ipv4Addr::new(192, 168, 123, 1)).with_interface("eth0");
//! let socket = bind_broadcast(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 67), Some("eth0"))?;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! DhcpServer::new(config).serve(socket, shutdown_rx).await?;
//! ```

pub mod allocator;
pub mod client;
pub mod config;
pub mod error;
pub mod lease;
pub mod packet;
pub mod pxe;
pub mod server;
pub mod socket;

pub use allocator::BitmapAllocator;
pub use client::{DhcpClient, Lease};
pub use config::*;
pub use error::*;
pub use lease::{DhcpRecord, LeasePolicy, LeasePool};
pub use packet::{format_mac, parse_mac, ClientArch, DhcpRequest, DhcpResponseBuilder};
pub use pxe::PxeResponder;
pub use server::{DhcpEvent, DhcpReply, DhcpServer};
pub use socket::bind_broadcast;
