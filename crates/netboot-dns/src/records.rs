//! In-memory DNS record store
//!
//! Records are registered at runtime (for example when a machine announces
//! itself as a control-plane node) and read by the DNS service on every
//! query. Registration appends: a name may map to several addresses, kept in
//! insertion order, and registering the same address twice keeps both copies.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Default)]
struct Records {
    v4: HashMap<String, Vec<Ipv4Addr>>,
    v6: HashMap<String, Vec<Ipv6Addr>>,
    raw: HashMap<String, Vec<String>>,
}

/// Name → records mapping shared between the HTTP and DNS services
#[derive(Debug, Default)]
pub struct DnsRecordStore {
    records: RwLock<Records>,
}

/// Lower-case `name` and make it fully qualified
pub fn normalize_name(name: &str) -> String {
    let mut name = name.trim().to_ascii_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}

impl DnsRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an IPv4 address under `name`
    pub async fn register(&self, name: &str, addr: Ipv4Addr) {
        let name = normalize_name(name);
        let mut records = self.records.write().await;
        let entry = records.v4.entry(name.clone()).or_default();
        entry.push(addr);
        info!(name = %name, addr = %addr, count = entry.len(), "Registered DNS record");
    }

    /// Append an IPv6 address under `name`
    pub async fn register_v6(&self, name: &str, addr: Ipv6Addr) {
        let name = normalize_name(name);
        let mut records = self.records.write().await;
        records.v6.entry(name.clone()).or_default().push(addr);
        info!(name = %name, addr = %addr, "Registered DNS record");
    }

    /// Append a raw text value under `name`
    pub async fn register_raw(&self, name: &str, value: impl Into<String>) {
        let name = normalize_name(name);
        let mut records = self.records.write().await;
        records.raw.entry(name).or_default().push(value.into());
    }

    /// IPv4 addresses under `name`, in registration order
    pub async fn resolve(&self, name: &str) -> Vec<Ipv4Addr> {
        let records = self.records.read().await;
        records
            .v4
            .get(&normalize_name(name))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn resolve_v6(&self, name: &str) -> Vec<Ipv6Addr> {
        let records = self.records.read().await;
        records
            .v6
            .get(&normalize_name(name))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn resolve_raw(&self, name: &str) -> Vec<String> {
        let records = self.records.read().await;
        records
            .raw
            .get(&normalize_name(name))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether any record of any kind exists under `name`
    pub async fn contains(&self, name: &str) -> bool {
        let name = normalize_name(name);
        let records = self.records.read().await;
        records.v4.contains_key(&name)
            || records.v6.contains_key(&name)
            || records.raw.contains_key(&name)
    }
}
