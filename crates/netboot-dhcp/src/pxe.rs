//! PXE boot server responder (UDP 4011)
//!
//! After a proxy offer, PXE firmware unicasts a REQUEST to the boot server
//! port. The answer is an ACK naming the boot file, sent back to the sender.

use crate::config::{DhcpConfig, PxeOptions};
use crate::error::Result;
use crate::packet::{DhcpRequest, DhcpResponseBuilder};
use dhcproto::v4::MessageType;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Answers PXE boot-server requests
#[derive(Debug, Clone)]
pub struct PxeResponder {
    config: DhcpConfig,
}

impl PxeResponder {
    pub fn new(config: DhcpConfig) -> Self {
        Self { config }
    }

    /// Encoded ACK for `request`, or `None` if it is not a PXE boot-server request
    pub fn reply(&self, request: &DhcpRequest) -> Result<Option<Vec<u8>>> {
        if !request.is_pxe || !matches!(request.message_type, MessageType::Request | MessageType::Inform) {
            return Ok(None);
        }

        let pxe = PxeOptions::for_client(&self.config, request.is_ipxe, request.is_uefi(), request.arch());
        DhcpResponseBuilder::new(request, MessageType::Ack, self.config.server_ip)
            .with_pxe_options(pxe)
            .build_bytes()
            .map(Some)
    }

    /// Serve on `socket` until shutdown
    pub async fn serve(&self, socket: UdpSocket, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(addr = %socket.local_addr()?, "PXE responder started");

        let mut buf = [0u8; 1500];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    let (len, src) = result?;
                    let request = match DhcpRequest::parse(&buf[..len]) {
                        Ok(request) => request,
                        Err(e) => {
                            debug!(src = %src, error = %e, "Ignoring malformed PXE packet");
                            continue;
                        }
                    };

                    match self.reply(&request) {
                        Ok(Some(bytes)) => {
                            socket.send_to(&bytes, src).await?;
                            info!(mac = %request.mac_address, dest = %src, "Sent PXE boot ACK");
                        }
                        Ok(None) => {}
                        Err(e) => error!(mac = %request.mac_address, error = %e, "Error building PXE reply"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("PXE responder shutting down");
        Ok(())
    }
}
