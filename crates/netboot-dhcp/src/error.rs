//! Error types for the DHCP crate
//!
//! `DhcpError` covers socket and packet failures of the protocol loops,
//! `LeaseError` the typed outcomes of the lease pool.

use std::net::{Ipv4Addr, SocketAddr};
use thiserror::Error;

/// Error type for DHCP operations
#[derive(Debug, Error)]
pub enum DhcpError {
    /// Failed to bind to socket
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse DHCP packet
    #[error("failed to parse DHCP packet: {0}")]
    ParseError(String),

    /// Failed to encode DHCP packet
    #[error("failed to encode DHCP packet: {0}")]
    EncodeError(String),

    /// Invalid MAC address format
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    /// Socket I/O error
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// Negotiation with an upstream DHCP server did not complete
    #[error("DHCP negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Lease pool refused the allocation
    #[error(transparent)]
    Lease(#[from] LeaseError),
}

/// Typed failures of the lease pool
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseError {
    /// Every address in the range is held by a live record
    #[error("address pool exhausted ({size} addresses)")]
    PoolExhausted { size: u32 },

    /// Strict policy forbids a second record for a client
    #[error("client {0} already holds a live lease")]
    DuplicateClient(String),

    /// No live record exists for the client
    #[error("client {0} holds no live lease")]
    NoLease(String),

    /// The client asked to keep an address it does not hold
    #[error("client {client} holds {held}, not {requested}")]
    AddressMismatch {
        client: String,
        held: Ipv4Addr,
        requested: Ipv4Addr,
    },

    /// Range bounds are inverted
    #[error("invalid pool range {first} - {last}")]
    InvalidRange { first: Ipv4Addr, last: Ipv4Addr },
}

/// Result type for DHCP operations
pub type Result<T> = std::result::Result<T, DhcpError>;
