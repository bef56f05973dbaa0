//! TFTP server implementation
//!
//! The listening socket only accepts requests. Each read request gets its own
//! task and an ephemeral socket (the transfer ID), and is served lock-step:
//! one DATA block in flight, retransmitted on timeout.

use crate::error::{Result, TftpError};
use crate::packet::{
    encode_data, encode_error, encode_oack, AgreedOptions, ClientPacket, ErrorCode,
    RequestedOptions, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE,
};
use crate::provider::FileProvider;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Retransmissions of one packet before the transfer is abandoned
pub const MAX_RETRIES: u32 = 5;

/// Per-packet timeout when the client did not negotiate one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Read-only TFTP server
pub struct TftpServer {
    provider: Arc<dyn FileProvider>,
    default_timeout: Duration,
}

impl std::fmt::Debug for TftpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TftpServer")
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl TftpServer {
    pub fn new(provider: Arc<dyn FileProvider>) -> Self {
        Self {
            provider,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the per-packet timeout used when the client sends none
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Accept requests on `socket` until shutdown
    ///
    /// Transfers already in progress are left to finish on their own sockets.
    pub async fn serve(&self, socket: UdpSocket, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let local = socket.local_addr()?;
        info!(addr = %local, "TFTP server started");

        let mut buf = vec![0u8; 1500];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    let (len, client) = result?;
                    let packet = match ClientPacket::decode(&buf[..len]) {
                        Ok(packet) => packet,
                        Err(e) => {
                            debug!(client = %client, error = %e, "Ignoring malformed TFTP packet");
                            continue;
                        }
                    };

                    let provider = self.provider.clone();
                    let default_timeout = self.default_timeout;
                    tokio::spawn(async move {
                        if let Err(e) = handle_request(packet, client, local, provider, default_timeout).await {
                            warn!(client = %client, error = %e, "TFTP transfer failed");
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

        info!("TFTP server shutting down");
        Ok(())
    }
}

async fn handle_request(
    packet: ClientPacket,
    client: SocketAddr,
    local: SocketAddr,
    provider: Arc<dyn FileProvider>,
    default_timeout: Duration,
) -> Result<()> {
    let socket = UdpSocket::bind(SocketAddr::new(local.ip(), 0)).await?;

    let (filename, options) = match packet {
        ClientPacket::Read {
            filename, options, ..
        } => (filename, options),
        ClientPacket::Write { filename } => {
            debug!(client = %client, filename = %filename, "Refusing write request");
            send_error(&socket, client, ErrorCode::AccessViolation, "read-only server").await;
            return Ok(());
        }
        ClientPacket::Ack { .. } | ClientPacket::Error { .. } => {
            send_error(&socket, client, ErrorCode::UnknownTransferId, "no such transfer").await;
            return Ok(());
        }
    };

    let Some(contents) = provider.read(&filename).await else {
        info!(client = %client, filename = %filename, "TFTP file not found");
        send_error(&socket, client, ErrorCode::FileNotFound, "file not found").await;
        return Ok(());
    };

    let mut transfer = Transfer::negotiate(socket, client, filename, contents, options, default_timeout);
    let sent = transfer.run().await?;
    info!(client = %client, filename = %transfer.filename, bytes = sent, "TFTP transfer completed");
    Ok(())
}

async fn send_error(socket: &UdpSocket, client: SocketAddr, code: ErrorCode, message: &str) {
    if let Err(e) = socket.send_to(&encode_error(code, message), client).await {
        error!(client = %client, error = %e, "Failed to send TFTP error");
    }
}

/// How the client answered a packet
enum Reply {
    Ack,
    Rejected { code: u16, message: String },
}

/// One read transfer in progress
struct Transfer {
    socket: UdpSocket,
    client: SocketAddr,
    filename: String,
    contents: Bytes,
    oack: Option<AgreedOptions>,
    block_size: usize,
    timeout: Duration,
}

impl Transfer {
    fn negotiate(
        socket: UdpSocket,
        client: SocketAddr,
        filename: String,
        contents: Bytes,
        requested: RequestedOptions,
        default_timeout: Duration,
    ) -> Self {
        let blksize = requested.blksize.map(|b| b.clamp(8, MAX_BLOCK_SIZE));
        let oack = (!requested.is_empty()).then(|| AgreedOptions {
            blksize,
            tsize: requested.tsize.then_some(contents.len() as u64),
            timeout: requested.timeout,
        });

        Self {
            socket,
            client,
            filename,
            contents,
            oack,
            block_size: usize::from(blksize.unwrap_or(DEFAULT_BLOCK_SIZE)),
            timeout: requested
                .timeout
                .map(|t| Duration::from_secs(u64::from(t)))
                .unwrap_or(default_timeout),
        }
    }

    /// Send the whole file; returns the number of payload bytes sent
    async fn run(&mut self) -> Result<u64> {
        if let Some(options) = self.oack {
            debug!(client = %self.client, options = ?options, "Sending OACK");
            match self.send_until_acked(encode_oack(&options), 0).await? {
                Reply::Ack => {}
                Reply::Rejected { code, message } => {
                    // Some firmware refuses the OACK and expects a plain transfer.
                    warn!(client = %self.client, code, message = %message, "OACK rejected, using defaults");
                    self.block_size = usize::from(DEFAULT_BLOCK_SIZE);
                }
            }
        }

        let mut block: u16 = 1;
        let mut offset = 0usize;
        loop {
            let end = (offset + self.block_size).min(self.contents.len());
            let payload = self.contents.slice(offset..end);
            let last = payload.len() < self.block_size;

            match self.send_until_acked(encode_data(block, &payload), block).await? {
                Reply::Ack => {}
                Reply::Rejected { code, message } => {
                    return Err(TftpError::Aborted {
                        filename: self.filename.clone(),
                        code,
                        message,
                    })
                }
            }

            offset = end;
            if last {
                return Ok(offset as u64);
            }
            block = block.wrapping_add(1);
        }
    }

    /// Send `packet` and retransmit until `block` is acknowledged
    async fn send_until_acked(&self, packet: Bytes, block: u16) -> Result<Reply> {
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                debug!(client = %self.client, block, attempt, "Retransmitting");
            }
            self.socket.send_to(&packet, self.client).await?;

            if let Some(reply) = self.await_ack(block).await? {
                return Ok(reply);
            }
        }

        Err(TftpError::Timeout {
            filename: self.filename.clone(),
            retries: MAX_RETRIES,
        })
    }

    /// `None` when the timeout passes without an answer
    async fn await_ack(&self, block: u16) -> Result<Option<Reply>> {
        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 516];

        loop {
            let (len, from) = match timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                Ok(received) => received?,
                Err(_) => return Ok(None),
            };

            if from != self.client {
                send_error(&self.socket, from, ErrorCode::UnknownTransferId, "unknown transfer").await;
                continue;
            }

            match ClientPacket::decode(&buf[..len]) {
                Ok(ClientPacket::Ack { block: acked }) if acked == block => return Ok(Some(Reply::Ack)),
                // Duplicate ACK of an earlier block
                Ok(ClientPacket::Ack { .. }) => continue,
                Ok(ClientPacket::Error { code, message }) => {
                    return Ok(Some(Reply::Rejected { code, message }))
                }
                Ok(_) | Err(_) => {
                    send_error(&self.socket, from, ErrorCode::IllegalOperation, "expected ACK").await;
                    return Err(TftpError::InvalidPacket("expected ACK".to_string()));
                }
            }
        }
    }
}
