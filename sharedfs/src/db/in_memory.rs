//! In-memory implementation of [`ServiceStore`].

use super::{DbError, Result, ServiceRecord, ServiceStore};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};

/// Concurrent in-memory store. Records are lost when the process exits.
#[derive(Debug, Default)]
pub struct InMemoryServiceStore {
    /// service_id -> (insertion sequence, record)
    records: DashMap<String, (u64, ServiceRecord)>,
    next_seq: AtomicU64,
}

impl InMemoryServiceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceStore for InMemoryServiceStore {
    async fn create(&self, record: &ServiceRecord) -> Result<ServiceRecord> {
        match self.records.entry(record.service_id.clone()) {
            Entry::Occupied(_) => Err(DbError::UniqueViolation {
                table: Some("services".to_string()),
                message: format!("service_id {} already exists", record.service_id),
                conflicting_value: Some(record.service_id.clone()),
            }),
            Entry::Vacant(slot) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                slot.insert((seq, record.clone()));
                Ok(record.clone())
            }
        }
    }

    async fn find_by_service_id(&self, service_id: &str) -> Result<Option<ServiceRecord>> {
        Ok(self.records.get(service_id).map(|entry| entry.value().1.clone()))
    }

    async fn exists_by_service_id(&self, service_id: &str) -> Result<bool> {
        Ok(self.records.contains_key(service_id))
    }

    async fn delete_by_service_id(&self, service_id: &str) -> Result<bool> {
        Ok(self.records.remove(service_id).is_some())
    }

    async fn all(&self) -> Result<Vec<ServiceRecord>> {
        let mut rows: Vec<(u64, ServiceRecord)> = self.records.iter().map(|entry| entry.value().clone()).collect();
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, record)| record).collect())
    }
}
