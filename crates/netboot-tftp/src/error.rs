//! Error types for the TFTP service

use thiserror::Error;

/// Error type for TFTP operations
#[derive(Debug, Error)]
pub enum TftpError {
    /// Malformed or unexpected packet
    #[error("invalid TFTP packet: {0}")]
    InvalidPacket(String),

    /// Socket I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Client stopped acknowledging
    #[error("transfer of {filename} timed out after {retries} retries")]
    Timeout { filename: String, retries: u32 },

    /// Client sent an ERROR packet mid-transfer
    #[error("client aborted transfer of {filename}: {message} (code {code})")]
    Aborted {
        filename: String,
        code: u16,
        message: String,
    },
}

/// Result type for TFTP operations
pub type Result<T> = std::result::Result<T, TftpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TftpError::Timeout {
            filename: "undionly.kpxe".to_string(),
            retries: 5,
        };
        assert_eq!(
            err.to_string(),
            "transfer of undionly.kpxe timed out after 5 retries"
        );

        let err = TftpError::InvalidPacket("short".to_string());
        assert!(err.to_string().contains("short"));
    }
}
