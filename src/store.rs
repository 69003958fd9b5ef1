//! Immutable, time-ordered collection of service requests.
//!
//! `RequestStore` is never mutated in place. `SharedStore` publishes new
//! snapshots for appends and closures so readers keep a consistent view.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::ServiceRequest;

#[derive(Debug, Clone, Default)]
pub struct RequestStore {
    requests: Vec<ServiceRequest>,
    by_id: HashMap<String, usize>,
    by_group: HashMap<(String, i32), Vec<usize>>,
}

impl RequestStore {
    pub fn from_records(mut records: Vec<ServiceRequest>) -> Result<Self, StoreError> {
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.sr_number.cmp(&b.sr_number))
        });

        let mut by_id = HashMap::with_capacity(records.len());
        let mut by_group: HashMap<(String, i32), Vec<usize>> = HashMap::new();

        for (idx, record) in records.iter().enumerate() {
            if matches!(record.closed_at, Some(closed) if closed < record.created_at) {
                return Err(StoreError::ClosedBeforeCreated(record.sr_number.clone()));
            }
            if by_id.insert(record.sr_number.clone(), idx).is_some() {
                return Err(StoreError::DuplicateId(record.sr_number.clone()));
            }
            by_group
                .entry((record.category.clone(), record.ward))
                .or_default()
                .push(idx);
        }

        debug!(
            requests = records.len(),
            groups = by_group.len(),
            "built request store"
        );

        Ok(Self {
            requests: records,
            by_id,
            by_group,
        })
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn get(&self, sr_number: &str) -> Option<&ServiceRequest> {
        self.by_id.get(sr_number).map(|&idx| &self.requests[idx])
    }

    /// Requests created at or before `as_of`, in creation order.
    pub fn created_up_to(&self, as_of: NaiveDateTime) -> &[ServiceRequest] {
        let end = self.requests.partition_point(|r| r.created_at <= as_of);
        &self.requests[..end]
    }

    /// Same category and ward requests created at or before `as_of`.
    pub fn peers(
        &self,
        category: &str,
        ward: i32,
        as_of: NaiveDateTime,
    ) -> impl Iterator<Item = &ServiceRequest> {
        let indices: &[usize] = self
            .by_group
            .get(&(category.to_string(), ward))
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let end = indices.partition_point(|&idx| self.requests[idx].created_at <= as_of);
        indices[..end].iter().map(move |&idx| &self.requests[idx])
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.by_group.keys().any(|(c, _)| c == category)
    }

    /// Latest creation or closure timestamp recorded in the store.
    pub fn latest_event(&self) -> Option<NaiveDateTime> {
        self.requests
            .iter()
            .map(|r| r.closed_at.map_or(r.created_at, |closed| closed.max(r.created_at)))
            .max()
    }

    /// Applies an ingest batch: unknown requests are appended and open
    /// requests that arrive closed record their closure. Closed requests are
    /// left untouched. Returns the new store and the records that changed.
    pub fn with_updates(
        &self,
        batch: Vec<ServiceRequest>,
    ) -> Result<(Self, Vec<ServiceRequest>), StoreError> {
        let mut records = self.requests.clone();
        let mut index = self.by_id.clone();
        let mut changed: Vec<String> = Vec::new();

        for incoming in batch {
            match index.get(&incoming.sr_number) {
                Some(&idx) => {
                    let current = &mut records[idx];
                    if let (None, Some(closed_at)) = (current.closed_at, incoming.closed_at) {
                        if closed_at < current.created_at {
                            return Err(StoreError::ClosedBeforeCreated(incoming.sr_number));
                        }
                        current.closed_at = Some(closed_at);
                        current.status = incoming.status;
                        if !changed.contains(&current.sr_number) {
                            changed.push(current.sr_number.clone());
                        }
                    }
                }
                None => {
                    index.insert(incoming.sr_number.clone(), records.len());
                    changed.push(incoming.sr_number.clone());
                    records.push(incoming);
                }
            }
        }

        let next = Self::from_records(records)?;
        let changed = changed
            .iter()
            .filter_map(|id| next.get(id).cloned())
            .collect();
        Ok((next, changed))
    }
}

/// Single-writer holder that publishes store snapshots.
#[derive(Debug, Default)]
pub struct SharedStore {
    current: RwLock<Arc<RequestStore>>,
    writer: Mutex<()>,
}

impl SharedStore {
    pub fn new(store: RequestStore) -> Self {
        Self {
            current: RwLock::new(Arc::new(store)),
            writer: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<RequestStore> {
        Arc::clone(&self.current.read())
    }

    /// Publishes the result of `RequestStore::with_updates` as the new
    /// snapshot.
    pub fn apply(&self, batch: Vec<ServiceRequest>) -> Result<Vec<ServiceRequest>, StoreError> {
        let _guard = self.writer.lock();
        let (next, changed) = self.snapshot().with_updates(batch)?;
        *self.current.write() = Arc::new(next);
        info!(changed = changed.len(), "published request store snapshot");
        Ok(changed)
    }
}
