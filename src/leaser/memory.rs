//! In-process lease store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{LeaseRecord, LeaseStore};
use crate::error::StoreError;

#[derive(Default)]
struct Tables {
    by_underlay: HashMap<String, LeaseRecord>,
    /// overlay subnet -> underlay IP
    by_subnet: HashMap<String, String>,
}

/// Lease store kept in memory, with the same uniqueness rules as a
/// database table keyed on underlay IP and overlay subnet.
#[derive(Default)]
pub struct MemoryLeaseStore {
    tables: Mutex<Tables>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Backend("lease table lock poisoned".to_string()))
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn all(&self) -> Result<Vec<LeaseRecord>, StoreError> {
        let tables = self.tables()?;
        let mut records: Vec<LeaseRecord> = tables.by_underlay.values().cloned().collect();
        records.sort_by(|a, b| a.lease.underlay_ip.cmp(&b.lease.underlay_ip));
        Ok(records)
    }

    async fn get(&self, underlay_ip: &str) -> Result<Option<LeaseRecord>, StoreError> {
        Ok(self.tables()?.by_underlay.get(underlay_ip).cloned())
    }

    async fn insert(&self, record: LeaseRecord) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        let underlay_ip = record.lease.underlay_ip.clone();
        let subnet = record.lease.overlay_subnet.clone();

        if tables.by_underlay.contains_key(&underlay_ip) {
            return Err(StoreError::Conflict(format!(
                "underlay ip {} already has a lease",
                underlay_ip
            )));
        }
        if let Some(owner) = tables.by_subnet.get(&subnet) {
            return Err(StoreError::Conflict(format!(
                "subnet {} is leased to {}",
                subnet, owner
            )));
        }

        tables.by_subnet.insert(subnet, underlay_ip.clone());
        tables.by_underlay.insert(underlay_ip, record);
        Ok(())
    }

    async fn touch(&self, underlay_ip: &str, expires_at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(record) = self.tables()?.by_underlay.get_mut(underlay_ip) {
            record.expires_at = expires_at;
        }
        Ok(())
    }

    async fn delete(&self, underlay_ip: &str) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        if let Some(record) = tables.by_underlay.remove(underlay_ip) {
            tables.by_subnet.remove(&record.lease.overlay_subnet);
        }
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<LeaseRecord>, StoreError> {
        let mut tables = self.tables()?;
        let expired: Vec<String> = tables
            .by_underlay
            .iter()
            .filter(|(_, record)| record.is_expired(now))
            .map(|(underlay_ip, _)| underlay_ip.clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for underlay_ip in expired {
            if let Some(record) = tables.by_underlay.remove(&underlay_ip) {
                tables.by_subnet.remove(&record.lease.overlay_subnet);
                removed.push(record);
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::Lease;
    use chrono::Duration;

    fn record(underlay: &str, subnet: &str, expires_at: DateTime<Utc>) -> LeaseRecord {
        LeaseRecord {
            lease: Lease {
                underlay_ip: underlay.to_string(),
                overlay_subnet: subnet.to_string(),
                overlay_hardware_addr: "ee:ee:00:00:00:00".to_string(),
            },
            expires_at,
        }
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_underlay() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();
        store.insert(record("10.0.0.1", "10.255.1.0/24", now)).await.unwrap();
        let err = store
            .insert(record("10.0.0.1", "10.255.2.0/24", now))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_subnet() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();
        store.insert(record("10.0.0.1", "10.255.1.0/24", now)).await.unwrap();
        let err = store
            .insert(record("10.0.0.2", "10.255.1.0/24", now))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_delete_frees_subnet() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();
        store.insert(record("10.0.0.1", "10.255.1.0/24", now)).await.unwrap();
        store.delete("10.0.0.1").await.unwrap();
        store.delete("10.0.0.1").await.unwrap();
        store.insert(record("10.0.0.2", "10.255.1.0/24", now)).await.unwrap();
        assert_eq!(store.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_touch_moves_expiry() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();
        store.insert(record("10.0.0.1", "10.255.1.0/24", now)).await.unwrap();
        let later = now + Duration::seconds(30);
        store.touch("10.0.0.1", later).await.unwrap();
        store.touch("10.0.0.9", later).await.unwrap();
        assert_eq!(store.get("10.0.0.1").await.unwrap().unwrap().expires_at, later);
    }

    #[tokio::test]
    async fn test_delete_expired() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();
        store
            .insert(record("10.0.0.1", "10.255.1.0/24", now - Duration::seconds(1)))
            .await
            .unwrap();
        store
            .insert(record("10.0.0.2", "10.255.2.0/24", now + Duration::seconds(60)))
            .await
            .unwrap();

        let removed = store.delete_expired(now).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].lease.underlay_ip, "10.0.0.1");
        assert!(store.get("10.0.0.1").await.unwrap().is_none());
        store
            .insert(record("10.0.0.3", "10.255.1.0/24", now))
            .await
            .unwrap();
    }
}
