//! Error types for the DNS service

use thiserror::Error;

/// Error type for DNS operations
#[derive(Debug, Error)]
pub enum DnsError {
    /// Message could not be decoded or encoded
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// Socket I/O error
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// Packet was a response, not a query
    #[error("not a DNS query")]
    NotAQuery,
}

/// Result type for DNS operations
pub type Result<T> = std::result::Result<T, DnsError>;
