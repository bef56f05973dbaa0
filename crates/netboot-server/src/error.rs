//! Error types for boot orchestration

use crate::range::RangeError;
use std::net::SocketAddr;
use thiserror::Error;

/// Error a listener loop terminates with
///
/// Each protocol crate has its own error type, so loops report through a box.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type for setup and serving
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Range(#[from] RangeError),

    /// Interface enumeration found nothing usable
    #[error("no usable network interfaces found")]
    NoInterfaces,

    #[error("network interface {0} not found")]
    InterfaceNotFound(String),

    #[error("network interface {0} has no hardware address")]
    NoHardwareAddress(String),

    /// Upstream lease cannot be applied as given
    #[error("invalid DHCP lease: {0}")]
    InvalidLease(String),

    /// Applying configuration to the interface failed
    #[error("failed to {action} on {interface}: {message}")]
    LinkSetup {
        interface: String,
        action: String,
        message: String,
    },

    /// A listener socket could not be bound
    #[error("failed to bind {service} on {addr}: {source}")]
    Bind {
        service: &'static str,
        addr: SocketAddr,
        #[source]
        source: BoxError,
    },

    /// A listener loop failed after serving began
    #[error("{service} listener failed: {source}")]
    Listener {
        service: &'static str,
        #[source]
        source: BoxError,
    },

    #[error(transparent)]
    Ipxe(#[from] netboot_ipxe::IpxeError),

    /// Lease pool could not be built over the planned range
    #[error(transparent)]
    Lease(#[from] netboot_dhcp::LeaseError),
}

/// Result type for orchestration
pub type Result<T> = std::result::Result<T, ServerError>;
