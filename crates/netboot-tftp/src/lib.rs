//! Netboot TFTP server
//!
//! A read-only TFTP server for handing iPXE binaries to PXE firmware.
//! Supports the `blksize`, `tsize` and `timeout` options; write requests
//! are refused with an access violation.
//!
//! # Example
//!
//! ```ignore
//! use netboot_tftp::{DirectoryFileProvider, TftpServer};
//! use std::sync::Arc;
//!
//! let provider = Arc::new(DirectoryFileProvider::new("/srv/netboot/tftp"));
//! let socket = tokio::net::UdpSocket::bind("192.168.123.1:69").await?;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! TftpServer::new(provider).serve(socket, shutdown_rx).await?;
//! ```

pub mod error;
pub mod packet;
pub mod provider;
pub mod server;

pub use error::{Result, TftpError};
pub use provider::{DirectoryFileProvider, FileProvider};
pub use server::TftpServer;
