//! DHCP record store
//!
//! Per-client lease records over a [`BitmapAllocator`], guarded by a single
//! mutex. Expired records are reclaimed lazily at the start of every
//! allocation, so an offer made after a record expires sees the freed slot.

use crate::allocator::BitmapAllocator;
use crate::error::LeaseError;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// How a second allocation for a live client is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeasePolicy {
    /// Renew the existing record and hand back the same address
    #[default]
    Renew,
    /// Refuse with [`LeaseError::DuplicateClient`]
    Strict,
}

/// A single client's lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpRecord {
    pub ip: Ipv4Addr,
    pub expires: Instant,
}

impl DhcpRecord {
    fn is_live(&self, now: Instant) -> bool {
        self.expires > now
    }
}

#[derive(Debug)]
struct LeaseTable {
    allocator: BitmapAllocator,
    records: HashMap<String, DhcpRecord>,
    owners: HashMap<Ipv4Addr, String>,
}

impl LeaseTable {
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|(_, record)| !record.is_live(now))
            .map(|(client, _)| client.clone())
            .collect();

        for client in expired {
            if let Some(record) = self.records.remove(&client) {
                self.owners.remove(&record.ip);
                self.allocator.free(record.ip);
                debug!(client = %client, ip = %record.ip, "Reclaimed expired lease");
            }
        }
    }
}

/// Lease pool shared by the DHCP service
#[derive(Debug)]
pub struct LeasePool {
    table: Mutex<LeaseTable>,
    lease_time: Duration,
    policy: LeasePolicy,
}

impl LeasePool {
    /// Create a pool over the inclusive range `first..=last`
    pub fn new(first: Ipv4Addr, last: Ipv4Addr, lease_time: Duration) -> Result<Self, LeaseError> {
        Ok(Self {
            table: Mutex::new(LeaseTable {
                allocator: BitmapAllocator::new(first, last)?,
                records: HashMap::new(),
                owners: HashMap::new(),
            }),
            lease_time,
            policy: LeasePolicy::default(),
        })
    }

    /// Set the duplicate-client policy
    pub fn with_policy(mut self, policy: LeasePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Permanently withhold `ip` from clients (e.g. the server's own address)
    pub fn with_reserved(mut self, ip: Ipv4Addr) -> Self {
        self.table.get_mut().allocator.allocate_specific(ip);
        self
    }

    /// Lease duration handed to clients
    pub fn lease_time(&self) -> Duration {
        self.lease_time
    }

    /// Allocate or renew an address for `client_id`
    ///
    /// `requested` is honoured when that address is free.
    pub async fn allocate(
        &self,
        client_id: &str,
        requested: Option<Ipv4Addr>,
    ) -> Result<Ipv4Addr, LeaseError> {
        let now = Instant::now();
        let mut table = self.table.lock().await;
        table.reclaim_expired(now);

        if let Some(record) = table.records.get_mut(client_id) {
            if self.policy == LeasePolicy::Strict {
                return Err(LeaseError::DuplicateClient(client_id.to_string()));
            }
            record.expires = now + self.lease_time;
            debug!(client = %client_id, ip = %record.ip, "Renewed lease");
            return Ok(record.ip);
        }

        let ip = table
            .allocator
            .allocate(requested)
            .ok_or(LeaseError::PoolExhausted {
                size: table.allocator.size(),
            })?;

        table.owners.insert(ip, client_id.to_string());
        table.records.insert(
            client_id.to_string(),
            DhcpRecord {
                ip,
                expires: now + self.lease_time,
            },
        );
        debug!(client = %client_id, ip = %ip, "Allocated lease");
        Ok(ip)
    }

    /// Extend the live record of `client_id`
    ///
    /// Succeeds under either policy. `ip`, when given, must be the address
    /// the record holds.
    pub async fn renew(&self, client_id: &str, ip: Option<Ipv4Addr>) -> Result<Ipv4Addr, LeaseError> {
        let now = Instant::now();
        let mut table = self.table.lock().await;
        table.reclaim_expired(now);

        let record = table
            .records
            .get_mut(client_id)
            .ok_or_else(|| LeaseError::NoLease(client_id.to_string()))?;
        if let Some(requested) = ip.filter(|requested| *requested != record.ip) {
            return Err(LeaseError::AddressMismatch {
                client: client_id.to_string(),
                held: record.ip,
                requested,
            });
        }

        record.expires = now + self.lease_time;
        debug!(client = %client_id, ip = %record.ip, "Renewed lease");
        Ok(record.ip)
    }

    /// Return `ip` to the pool. Returns false if no record held it.
    pub async fn release(&self, ip: Ipv4Addr) -> bool {
        let mut table = self.table.lock().await;
        match table.owners.remove(&ip) {
            Some(client) => {
                table.records.remove(&client);
                table.allocator.free(ip);
                debug!(client = %client, ip = %ip, "Released lease");
                true
            }
            None => false,
        }
    }

    /// Live record for `client_id`, if any
    pub async fn lookup(&self, client_id: &str) -> Option<DhcpRecord> {
        let now = Instant::now();
        let table = self.table.lock().await;
        table
            .records
            .get(client_id)
            .filter(|record| record.is_live(now))
            .cloned()
    }

    /// Number of addresses still assignable, counting expired records as free
    pub async fn available(&self) -> u32 {
        let mut table = self.table.lock().await;
        table.reclaim_expired(Instant::now());
        table.allocator.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 123, last)
    }

    #[tokio::test]
    async fn test_same_client_gets_same_address() {
        let pool = LeasePool::new(ip(2), ip(254), HOUR).unwrap();

        let first = pool.allocate("52:54:00:00:00:01", None).await.unwrap();
        let again = pool.allocate("52:54:00:00:00:01", None).await.unwrap();
        assert_eq!(first, again);

        let other = pool.allocate("52:54:00:00:00:02", None).await.unwrap();
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn test_strict_policy_refuses_duplicate() {
        let pool = LeasePool::new(ip(2), ip(254), HOUR)
            .unwrap()
            .with_policy(LeasePolicy::Strict);

        pool.allocate("client-a", None).await.unwrap();
        let err = pool.allocate("client-a", None).await.unwrap_err();
        assert_eq!(err, LeaseError::DuplicateClient("client-a".to_string()));
    }

    #[tokio::test]
    async fn test_exhaustion_then_release_reuses_address() {
        let pool = LeasePool::new(ip(2), ip(4), HOUR).unwrap();

        let a = pool.allocate("a", None).await.unwrap();
        pool.allocate("b", None).await.unwrap();
        pool.allocate("c", None).await.unwrap();

        let err = pool.allocate("d", None).await.unwrap_err();
        assert_eq!(err, LeaseError::PoolExhausted { size: 3 });

        assert!(pool.release(a).await);
        assert_eq!(pool.allocate("d", None).await.unwrap(), a);
        assert!(pool.lookup("a").await.is_none());
    }

    #[tokio::test]
    async fn test_reserved_address_is_never_offered() {
        let pool = LeasePool::new(ip(1), ip(3), HOUR).unwrap().with_reserved(ip(2));

        let mut got = vec![
            pool.allocate("a", None).await.unwrap(),
            pool.allocate("b", None).await.unwrap(),
        ];
        got.sort();
        assert_eq!(got, vec![ip(1), ip(3)]);
        assert!(pool.allocate("c", Some(ip(2))).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_reclaimed_on_next_offer() {
        let pool = LeasePool::new(ip(2), ip(2), Duration::from_secs(60)).unwrap();

        let a = pool.allocate("a", None).await.unwrap();
        assert!(pool.allocate("b", None).await.is_err());

        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(pool.lookup("a").await.is_none());
        assert_eq!(pool.allocate("b", None).await.unwrap(), a);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_renewal_extends_expiry() {
        let pool = LeasePool::new(ip(2), ip(2), Duration::from_secs(60))
            .unwrap()
            .with_policy(LeasePolicy::Strict);

        let a = pool.allocate("a", None).await.unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(pool.renew("a", Some(a)).await.unwrap(), a);

        // Past the original expiry, inside the renewed one
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(pool.lookup("a").await.is_some());
        assert_eq!(
            pool.allocate("b", None).await.unwrap_err(),
            LeaseError::PoolExhausted { size: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_refuses_expired_or_foreign_address() {
        let pool = LeasePool::new(ip(2), ip(254), Duration::from_secs(60)).unwrap();
        let a = pool.allocate("a", None).await.unwrap();

        assert_eq!(
            pool.renew("a", Some(ip(99))).await.unwrap_err(),
            LeaseError::AddressMismatch {
                client: "a".to_string(),
                held: a,
                requested: ip(99),
            }
        );
        assert_eq!(
            pool.renew("b", None).await.unwrap_err(),
            LeaseError::NoLease("b".to_string())
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(
            pool.renew("a", Some(a)).await.unwrap_err(),
            LeaseError::NoLease("a".to_string())
        );
    }

    #[tokio::test]
    async fn test_requested_address_is_honoured() {
        let pool = LeasePool::new(ip(2), ip(254), HOUR).unwrap();
        assert_eq!(pool.allocate("a", Some(ip(77))).await.unwrap(), ip(77));
        assert_eq!(pool.available().await, 252);
    }
}
