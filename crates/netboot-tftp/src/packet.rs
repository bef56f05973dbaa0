//! TFTP wire format (RFC 1350, options per RFC 2347/2348/2349)
//!
//! The server only ever decodes client packets (RRQ, WRQ, ACK, ERROR) and
//! only ever encodes server packets (DATA, OACK, ERROR), so the two
//! directions are kept apart.

use crate::error::{Result, TftpError};
use bytes::{BufMut, Bytes, BytesMut};

const OP_RRQ: u16 = 1;
const OP_WRQ: u16 = 2;
const OP_DATA: u16 = 3;
const OP_ACK: u16 = 4;
const OP_ERROR: u16 = 5;
const OP_OACK: u16 = 6;

/// Block size without negotiation
pub const DEFAULT_BLOCK_SIZE: u16 = 512;

/// Largest block size a client may negotiate
pub const MAX_BLOCK_SIZE: u16 = 65464;

/// Error codes the server sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    IllegalOperation = 4,
    UnknownTransferId = 5,
}

/// Options a client attached to its read request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestedOptions {
    pub blksize: Option<u16>,
    /// Client asked for the transfer size (it always sends 0)
    pub tsize: bool,
    pub timeout: Option<u8>,
}

impl RequestedOptions {
    pub fn is_empty(&self) -> bool {
        self.blksize.is_none() && !self.tsize && self.timeout.is_none()
    }
}

/// Options the server agreed to, echoed in the OACK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgreedOptions {
    pub blksize: Option<u16>,
    pub tsize: Option<u64>,
    pub timeout: Option<u8>,
}

/// A packet received from a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    Read {
        filename: String,
        mode: String,
        options: RequestedOptions,
    },
    Write {
        filename: String,
    },
    Ack {
        block: u16,
    },
    Error {
        code: u16,
        message: String,
    },
}

impl ClientPacket {
    /// Decode a client packet
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (opcode, body) = match data {
            [hi, lo, body @ ..] => (u16::from_be_bytes([*hi, *lo]), body),
            _ => return Err(TftpError::InvalidPacket("packet too short".to_string())),
        };

        match opcode {
            OP_RRQ => decode_read(body),
            OP_WRQ => {
                let mut fields = body.split(|&b| b == 0);
                let filename = next_string(&mut fields, "filename")?;
                Ok(ClientPacket::Write { filename })
            }
            OP_ACK => match body {
                [hi, lo, ..] => Ok(ClientPacket::Ack {
                    block: u16::from_be_bytes([*hi, *lo]),
                }),
                _ => Err(TftpError::InvalidPacket("ACK without block number".to_string())),
            },
            OP_ERROR => match body {
                [hi, lo, rest @ ..] => Ok(ClientPacket::Error {
                    code: u16::from_be_bytes([*hi, *lo]),
                    message: String::from_utf8_lossy(rest.split(|&b| b == 0).next().unwrap_or(&[]))
                        .into_owned(),
                }),
                _ => Err(TftpError::InvalidPacket("ERROR without code".to_string())),
            },
            OP_DATA | OP_OACK => Err(TftpError::InvalidPacket(format!(
                "server-side opcode {} from client",
                opcode
            ))),
            other => Err(TftpError::InvalidPacket(format!("unknown opcode {}", other))),
        }
    }
}

fn next_string<'a>(fields: &mut impl Iterator<Item = &'a [u8]>, what: &str) -> Result<String> {
    match fields.next() {
        Some(field) if !field.is_empty() => Ok(String::from_utf8_lossy(field).into_owned()),
        _ => Err(TftpError::InvalidPacket(format!("missing {}", what))),
    }
}

fn decode_read(body: &[u8]) -> Result<ClientPacket> {
    let mut fields = body.split(|&b| b == 0);
    let filename = next_string(&mut fields, "filename")?;
    let mode = next_string(&mut fields, "mode")?.to_ascii_lowercase();
    if mode != "octet" && mode != "netascii" {
        return Err(TftpError::InvalidPacket(format!("unsupported mode {}", mode)));
    }

    let mut options = RequestedOptions::default();
    while let (Some(key), Some(value)) = (fields.next(), fields.next()) {
        if key.is_empty() {
            break;
        }
        let value = String::from_utf8_lossy(value);
        match String::from_utf8_lossy(key).to_ascii_lowercase().as_str() {
            "blksize" => options.blksize = value.parse().ok(),
            "tsize" => options.tsize = true,
            "timeout" => options.timeout = value.parse().ok().filter(|t| *t > 0),
            _ => {}
        }
    }

    Ok(ClientPacket::Read {
        filename,
        mode,
        options,
    })
}

/// Encode a DATA packet
pub fn encode_data(block: u16, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u16(OP_DATA);
    buf.put_u16(block);
    buf.put_slice(payload);
    buf.freeze()
}

/// Encode an OACK listing only the agreed options
pub fn encode_oack(options: &AgreedOptions) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u16(OP_OACK);

    let mut put = |key: &str, value: String| {
        buf.put_slice(key.as_bytes());
        buf.put_u8(0);
        buf.put_slice(value.as_bytes());
        buf.put_u8(0);
    };
    if let Some(blksize) = options.blksize {
        put("blksize", blksize.to_string());
    }
    if let Some(tsize) = options.tsize {
        put("tsize", tsize.to_string());
    }
    if let Some(timeout) = options.timeout {
        put("timeout", timeout.to_string());
    }

    buf.freeze()
}

/// Encode an ERROR packet
pub fn encode_error(code: ErrorCode, message: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + message.len());
    buf.put_u16(OP_ERROR);
    buf.put_u16(code as u16);
    buf.put_slice(message.as_bytes());
    buf.put_u8(0);
    buf.freeze()
}
