//! Netboot DNS
//!
//! A small UDP DNS server for the boot network. Names registered in the
//! [`DnsRecordStore`] at runtime, such as the control-plane endpoint elected
//! during boot dispatch, are answered locally; everything else is forwarded
//! upstream.

pub mod error;
pub mod records;
pub mod server;

pub use error::{DnsError, Result};
pub use records::{normalize_name, DnsRecordStore};
pub use server::DnsServer;
