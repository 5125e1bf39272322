//! Lease allocation policy.
//!
//! The [`Leaser`] owns the decisions (idempotent acquire, sticky renew,
//! mismatch detection, expiry) while a [`LeaseStore`] owns persistence and
//! uniqueness. Allocation is optimistic: pick a random free subnet from the
//! [`CidrPool`], try to insert it, and start over if the store reports a
//! conflict.

mod memory;

pub use memory::MemoryLeaseStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::cidr_pool::CidrPool;
use crate::error::{LeaseError, StoreError};
use crate::lease::{HardwareAddr, Lease};

/// Message carried by the non-retriable renew error.
pub const LEASE_MISMATCH: &str = "lease mismatch";

/// A persisted lease and the instant it stops being valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub lease: Lease,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Persistence for leases.
///
/// Implementations must reject an insert whose underlay IP or overlay subnet
/// already exists with [`StoreError::Conflict`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Every stored record, expired or not.
    async fn all(&self) -> Result<Vec<LeaseRecord>, StoreError>;

    async fn get(&self, underlay_ip: &str) -> Result<Option<LeaseRecord>, StoreError>;

    async fn insert(&self, record: LeaseRecord) -> Result<(), StoreError>;

    /// Move the expiry of an existing record. Missing records are ignored.
    async fn touch(&self, underlay_ip: &str, expires_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Remove a record. Missing records are ignored.
    async fn delete(&self, underlay_ip: &str) -> Result<(), StoreError>;

    /// Remove and return every record expired at `now`.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<LeaseRecord>, StoreError>;
}

/// Source of the current time. Swappable so expiry can be tested.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Controller-side allocation policy over a [`LeaseStore`].
pub struct Leaser {
    store: Arc<dyn LeaseStore>,
    pool: RwLock<Arc<CidrPool>>,
    ttl: Duration,
    clock: Clock,
}

impl Leaser {
    pub fn new(store: Arc<dyn LeaseStore>, pool: CidrPool, ttl: Duration) -> Self {
        Self {
            store,
            pool: RwLock::new(Arc::new(pool)),
            ttl,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Snapshot of the pool currently used for new allocations.
    pub fn pool(&self) -> Arc<CidrPool> {
        match self.pool.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// Rebuild the pool if the configured networks or block size changed.
    ///
    /// Returns whether a rebuild happened. Existing leases are left alone;
    /// they move to the new network on their next acquire.
    pub fn reconfigure(&self, networks: &[String], block_mask: u8) -> Result<bool, LeaseError> {
        let current = self.pool();
        let current_networks: Vec<String> = current
            .network()
            .networks()
            .iter()
            .map(|n| n.to_string())
            .collect();
        let requested = crate::multi_cidr::MultiCidrNetwork::new(networks)?;
        let requested_networks: Vec<String> =
            requested.networks().iter().map(|n| n.to_string()).collect();

        if current_networks == requested_networks && current.block_mask() == block_mask {
            return Ok(false);
        }

        let pool = CidrPool::new(networks, block_mask)?;
        info!(
            "Overlay network changed from {:?} to {:?}, rebuilt pool with {} blocks",
            current_networks,
            requested_networks,
            pool.block_pool_size()
        );
        match self.pool.write() {
            Ok(mut guard) => *guard = Arc::new(pool),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(pool),
        }
        Ok(true)
    }

    /// Return the caller's lease, allocating one if needed.
    ///
    /// An unexpired lease that still belongs to the current pool is returned
    /// unchanged. A lease left over from a previous network is dropped and
    /// replaced.
    pub async fn acquire(&self, underlay_ip: &str, single_ip: bool) -> Result<Lease, LeaseError> {
        parse_underlay(underlay_ip)?;
        self.sweep_expired().await?;

        loop {
            let pool = self.pool();

            if let Some(existing) = self.store.get(underlay_ip).await? {
                if pool.is_member(&existing.lease.overlay_subnet) {
                    debug!(
                        "Returning existing lease {} for {}",
                        existing.lease.overlay_subnet, underlay_ip
                    );
                    return Ok(existing.lease);
                }
                info!(
                    "Lease {} for {} is outside the current network, reallocating",
                    existing.lease.overlay_subnet, underlay_ip
                );
                self.store.delete(underlay_ip).await?;
            }

            let taken: Vec<String> = self
                .store
                .all()
                .await?
                .into_iter()
                .map(|record| record.lease.overlay_subnet)
                .collect();

            let subnet = if single_ip {
                pool.get_available_single_ip(&taken)
            } else {
                pool.get_available_block(&taken)
            }
            .ok_or(LeaseError::NoLeaseAvailable)?;

            let lease = new_lease(underlay_ip, &subnet)?;
            let record = LeaseRecord {
                lease: lease.clone(),
                expires_at: self.expiry(),
            };

            match self.store.insert(record).await {
                Ok(()) => {
                    info!("Acquired lease {} for {}", lease.overlay_subnet, underlay_ip);
                    return Ok(lease);
                }
                Err(StoreError::Conflict(reason)) => {
                    debug!("Lease insert for {} collided ({}), retrying", underlay_ip, reason);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Extend an existing lease, or recreate a lost one.
    ///
    /// A matching lease is renewed even when it lies outside the current
    /// network. A different subnet on record for the same underlay IP is a
    /// non-retriable mismatch.
    pub async fn renew(&self, lease: &Lease) -> Result<(), LeaseError> {
        parse_underlay(&lease.underlay_ip)?;

        match self.store.get(&lease.underlay_ip).await? {
            Some(existing) if existing.lease.overlay_subnet == lease.overlay_subnet => {
                self.store
                    .touch(&lease.underlay_ip, self.expiry())
                    .await?;
                debug!("Renewed lease {} for {}", lease.overlay_subnet, lease.underlay_ip);
                Ok(())
            }
            Some(existing) => {
                warn!(
                    "Renew for {} asked for {} but {} is on record",
                    lease.underlay_ip, lease.overlay_subnet, existing.lease.overlay_subnet
                );
                Err(LeaseError::NonRetriable(LEASE_MISMATCH.to_string()))
            }
            None => self.recreate(lease).await,
        }
    }

    async fn recreate(&self, lease: &Lease) -> Result<(), LeaseError> {
        let pool = self.pool();
        if !pool.is_member(&lease.overlay_subnet) {
            let reason = if pool.in_network(&lease.overlay_subnet) {
                "is not a block of the pool"
            } else {
                "is outside the overlay network"
            };
            warn!(
                "Renew for {} asked for {} which {}",
                lease.underlay_ip, lease.overlay_subnet, reason
            );
            return Err(LeaseError::NonRetriable(LEASE_MISMATCH.to_string()));
        }

        let record = LeaseRecord {
            lease: lease.clone(),
            expires_at: self.expiry(),
        };
        match self.store.insert(record).await {
            Ok(()) => {
                info!(
                    "Recreated lease {} for {} on renew",
                    lease.overlay_subnet, lease.underlay_ip
                );
                Ok(())
            }
            Err(StoreError::Conflict(_)) => Err(LeaseError::NonRetriable(LEASE_MISMATCH.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    /// Drop the lease for `underlay_ip`. Releasing nothing is fine.
    pub async fn release(&self, underlay_ip: &str) -> Result<(), LeaseError> {
        self.store.delete(underlay_ip).await?;
        info!("Released lease for {}", underlay_ip);
        Ok(())
    }

    /// All unexpired leases.
    pub async fn list_active(&self) -> Result<Vec<Lease>, LeaseError> {
        let now = (self.clock)();
        Ok(self
            .store
            .all()
            .await?
            .into_iter()
            .filter(|record| !record.is_expired(now))
            .map(|record| record.lease)
            .collect())
    }

    /// Remove expired leases so their subnets can be handed out again.
    pub async fn sweep_expired(&self) -> Result<usize, LeaseError> {
        let reclaimed = self.store.delete_expired((self.clock)()).await?;
        if !reclaimed.is_empty() {
            info!("Reclaimed {} expired leases", reclaimed.len());
            for record in &reclaimed {
                debug!(
                    "Expired lease {} for {}",
                    record.lease.overlay_subnet, record.lease.underlay_ip
                );
            }
        }
        Ok(reclaimed.len())
    }

    fn expiry(&self) -> DateTime<Utc> {
        (self.clock)() + self.ttl
    }
}

fn parse_underlay(underlay_ip: &str) -> Result<Ipv4Addr, LeaseError> {
    underlay_ip
        .parse()
        .map_err(|_| LeaseError::Invalid(format!("invalid underlay ip: {}", underlay_ip)))
}

fn new_lease(underlay_ip: &str, subnet: &str) -> Result<Lease, LeaseError> {
    let net: ipnet::Ipv4Net = subnet
        .parse()
        .map_err(|_| LeaseError::Invalid(format!("invalid subnet: {}", subnet)))?;
    Ok(Lease {
        underlay_ip: underlay_ip.to_string(),
        overlay_subnet: subnet.to_string(),
        overlay_hardware_addr: HardwareAddr::from_overlay_ip(net.addr()).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn leaser_with(networks: &[&str], mask: u8) -> Leaser {
        let pool = CidrPool::new(networks, mask).unwrap();
        Leaser::new(Arc::new(MemoryLeaseStore::new()), pool, Duration::seconds(60))
    }

    fn manual_clock() -> (Clock, Arc<Mutex<DateTime<Utc>>>) {
        let now = Arc::new(Mutex::new(Utc::now()));
        let handle = Arc::clone(&now);
        let clock: Clock = Arc::new(move || *handle.lock().unwrap());
        (clock, now)
    }

    #[tokio::test]
    async fn test_acquire_returns_lease_in_pool() {
        let leaser = leaser_with(&["10.255.0.0/16", "10.250.0.0/16"], 24);
        let lease = leaser.acquire("10.244.4.5", false).await.unwrap();

        assert_eq!(lease.underlay_ip, "10.244.4.5");
        assert!(leaser.pool().is_member(&lease.overlay_subnet));
        assert_ne!(lease.overlay_subnet, "10.255.0.0/24");
        assert_ne!(lease.overlay_subnet, "10.250.0.0/24");
    }

    #[tokio::test]
    async fn test_acquire_sets_hardware_addr_from_subnet() {
        let leaser = leaser_with(&["10.255.0.0/23"], 24);
        let lease = leaser.acquire("10.244.4.5", false).await.unwrap();
        assert_eq!(lease.overlay_subnet, "10.255.1.0/24");
        assert_eq!(lease.overlay_hardware_addr, "ee:ee:0a:ff:01:00");
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent() {
        let leaser = leaser_with(&["10.255.0.0/16"], 24);
        let first = leaser.acquire("10.244.4.5", false).await.unwrap();
        let second = leaser.acquire("10.244.4.5", false).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_acquire_single_ip() {
        let leaser = leaser_with(&["10.255.0.0/16"], 24);
        let lease = leaser.acquire("10.244.4.5", true).await.unwrap();
        assert!(lease.overlay_subnet.ends_with("/32"));
        assert!(lease.overlay_subnet.starts_with("10.255.0."));
    }

    #[tokio::test]
    async fn test_acquire_exhaustion() {
        let leaser = leaser_with(&["10.255.0.0/23"], 24);
        leaser.acquire("10.0.0.1", false).await.unwrap();
        let err = leaser.acquire("10.0.0.2", false).await.unwrap_err();
        assert_eq!(err, LeaseError::NoLeaseAvailable);
    }

    #[tokio::test]
    async fn test_acquire_rejects_bad_underlay_ip() {
        let leaser = leaser_with(&["10.255.0.0/16"], 24);
        let err = leaser.acquire("banana", false).await.unwrap_err();
        assert!(matches!(err, LeaseError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_acquire_reclaims_expired_leases() {
        let (clock, now) = manual_clock();
        let pool = CidrPool::new(&["10.255.0.0/23"], 24).unwrap();
        let leaser = Leaser::new(Arc::new(MemoryLeaseStore::new()), pool, Duration::seconds(60))
            .with_clock(clock);

        let first = leaser.acquire("10.0.0.1", false).await.unwrap();
        *now.lock().unwrap() += Duration::seconds(61);

        let second = leaser.acquire("10.0.0.2", false).await.unwrap();
        assert_eq!(first.overlay_subnet, second.overlay_subnet);
        assert!(leaser.list_active().await.unwrap().iter().all(|l| l.underlay_ip == "10.0.0.2"));
    }

    #[tokio::test]
    async fn test_acquire_after_network_change_moves_lease() {
        let leaser = leaser_with(&["10.255.0.0/16"], 24);
        let old = leaser.acquire("10.0.0.1", false).await.unwrap();

        assert!(leaser
            .reconfigure(&["10.240.0.0/16".to_string()], 24)
            .unwrap());
        let new = leaser.acquire("10.0.0.1", false).await.unwrap();

        assert_ne!(old.overlay_subnet, new.overlay_subnet);
        assert!(new.overlay_subnet.starts_with("10.240."));
    }

    #[tokio::test]
    async fn test_reconfigure_same_network_is_noop() {
        let leaser = leaser_with(&["10.255.0.0/16"], 24);
        assert!(!leaser.reconfigure(&["10.255.0.0/16".to_string()], 24).unwrap());
        assert!(leaser.reconfigure(&["10.255.0.0/16".to_string()], 25).unwrap());
    }

    #[tokio::test]
    async fn test_renew_matching_lease_is_idempotent() {
        let leaser = leaser_with(&["10.255.0.0/16"], 24);
        let lease = leaser.acquire("10.0.0.1", false).await.unwrap();
        for _ in 0..3 {
            leaser.renew(&lease).await.unwrap();
        }
        assert_eq!(leaser.list_active().await.unwrap(), vec![lease]);
    }

    #[tokio::test]
    async fn test_renew_keeps_lease_outside_current_network() {
        let leaser = leaser_with(&["10.255.0.0/16"], 24);
        let lease = leaser.acquire("10.0.0.1", false).await.unwrap();
        leaser
            .reconfigure(&["10.240.0.0/16".to_string()], 24)
            .unwrap();

        leaser.renew(&lease).await.unwrap();
        assert_eq!(leaser.list_active().await.unwrap(), vec![lease]);
    }

    #[tokio::test]
    async fn test_renew_mismatch_is_non_retriable() {
        let leaser = leaser_with(&["10.255.0.0/16"], 24);
        let mut lease = leaser.acquire("10.0.0.1", false).await.unwrap();
        lease.overlay_subnet = if lease.overlay_subnet == "10.255.1.0/24" {
            "10.255.2.0/24".to_string()
        } else {
            "10.255.1.0/24".to_string()
        };

        let err = leaser.renew(&lease).await.unwrap_err();
        assert_eq!(err, LeaseError::NonRetriable(LEASE_MISMATCH.to_string()));
    }

    #[tokio::test]
    async fn test_renew_unknown_lease_creates_it() {
        let leaser = leaser_with(&["10.255.0.0/16"], 24);
        let lease = Lease {
            underlay_ip: "10.0.0.9".to_string(),
            overlay_subnet: "10.255.9.0/24".to_string(),
            overlay_hardware_addr: "ee:ee:0a:ff:09:00".to_string(),
        };
        leaser.renew(&lease).await.unwrap();
        assert_eq!(leaser.list_active().await.unwrap(), vec![lease.clone()]);
        assert_eq!(leaser.acquire("10.0.0.9", false).await.unwrap(), lease);
    }

    #[tokio::test]
    async fn test_renew_unknown_lease_held_by_other_host_fails() {
        let leaser = leaser_with(&["10.255.0.0/16"], 24);
        let held = leaser.acquire("10.0.0.1", false).await.unwrap();
        let stolen = Lease {
            underlay_ip: "10.0.0.2".to_string(),
            ..held
        };
        let err = leaser.renew(&stolen).await.unwrap_err();
        assert!(err.is_non_retriable());
    }

    #[tokio::test]
    async fn test_renew_unknown_lease_off_pool_fails() {
        let leaser = leaser_with(&["10.255.0.0/16"], 24);
        for subnet in ["10.255.9.128/25", "10.99.9.0/24"] {
            let lease = Lease {
                underlay_ip: "10.0.0.9".to_string(),
                overlay_subnet: subnet.to_string(),
                overlay_hardware_addr: "ee:ee:0a:ff:09:80".to_string(),
            };
            let err = leaser.renew(&lease).await.unwrap_err();
            assert_eq!(err, LeaseError::NonRetriable(LEASE_MISMATCH.to_string()));
        }
        assert!(leaser.pool().in_network("10.255.9.128/25"));
        assert!(!leaser.pool().in_network("10.99.9.0/24"));
        assert!(leaser.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_missing_lease_is_ok() {
        let leaser = leaser_with(&["10.255.0.0/16"], 24);
        leaser.release("10.0.0.1").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_active_excludes_expired() {
        let (clock, now) = manual_clock();
        let pool = CidrPool::new(&["10.255.0.0/16"], 24).unwrap();
        let leaser = Leaser::new(Arc::new(MemoryLeaseStore::new()), pool, Duration::seconds(60))
            .with_clock(clock);

        leaser.acquire("10.0.0.1", false).await.unwrap();
        *now.lock().unwrap() += Duration::seconds(30);
        let fresh = leaser.acquire("10.0.0.2", false).await.unwrap();
        *now.lock().unwrap() += Duration::seconds(31);

        assert_eq!(leaser.list_active().await.unwrap(), vec![fresh]);
    }

    #[tokio::test]
    async fn test_acquire_retries_on_store_conflict() {
        let pool = CidrPool::new(&["10.255.0.0/16"], 24).unwrap();
        let mut store = MockLeaseStore::new();
        store.expect_delete_expired().returning(|_| Ok(Vec::new()));
        store.expect_get().returning(|_| Ok(None));
        store.expect_all().returning(|| Ok(Vec::new()));
        let mut calls = 0;
        store.expect_insert().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(StoreError::Conflict("subnet taken".to_string()))
            } else {
                Ok(())
            }
        });

        let leaser = Leaser::new(Arc::new(store), pool, Duration::seconds(60));
        leaser.acquire("10.0.0.1", false).await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_surfaces_store_backend_errors() {
        let pool = CidrPool::new(&["10.255.0.0/16"], 24).unwrap();
        let mut store = MockLeaseStore::new();
        store.expect_delete_expired().returning(|_| Ok(Vec::new()));
        store
            .expect_get()
            .returning(|_| Err(StoreError::Backend("disk on fire".to_string())));

        let leaser = Leaser::new(Arc::new(store), pool, Duration::seconds(60));
        let err = leaser.acquire("10.0.0.1", false).await.unwrap_err();
        assert_eq!(err, LeaseError::Store("disk on fire".to_string()));
    }
}
