//! # Device Store
//!
//! Holds one [`DeviceRecord`] per [`Scope`]: the shared core record plus one record per
//! lightpost tag. Core and device records are the same abstraction; only the scope key
//! differs.
//!
//! ## Locking
//!
//! ```text
//! RwLock<HashMap<Scope, Arc<Mutex<DeviceRecord>>>>
//!          │                  │
//!          │                  └─ per-scope lock, held across merge + persist
//!          └─ scope table, write-locked only while a new scope is inserted
//! ```
//!
//! A newly discovered record is inserted locked and loaded afterwards, so the table
//! lock is never held across backend I/O.
//!
//! A merge holds the record lock from read through persist, and snapshots clone under
//! the same lock, so readers see either the old or the new record and never a mix.
//!
//! ## Persistence Failures
//!
//! A failed load starts the scope empty, a failed save keeps the in-memory update. Both
//! are reported as [`StoreError::ScopeUnavailable`] and are never retried here.

pub mod persistence;

pub use persistence::{JsonFilePersistence, MemoryPersistence, RecordPersistence};

use crate::topic::Scope;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Flat variable-name to scalar-value map, the payload of every record.
pub type Values = serde_json::Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Scope {scope} unavailable: {reason}")]
    ScopeUnavailable { scope: String, reason: String },
}

impl StoreError {
    pub fn unavailable(scope: &Scope, reason: impl Into<String>) -> Self {
        StoreError::ScopeUnavailable {
            scope: scope.to_string(),
            reason: reason.into(),
        }
    }
}

/// How a merge treats keys the record does not have yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Unknown keys are added to the record.
    #[default]
    Open,
    /// Unknown keys are rejected and the record schema stays closed.
    Strict,
}

impl MergePolicy {
    pub fn from_strict_schema(strict_schema: bool) -> Self {
        if strict_schema {
            MergePolicy::Strict
        } else {
            MergePolicy::Open
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub scope: Scope,
    pub values: Values,
}

impl DeviceRecord {
    pub fn new(scope: Scope, values: Values) -> Self {
        Self { scope, values }
    }

    /// Applies `update` under `policy` and reports which keys changed.
    fn merge(&mut self, update: &Values, policy: MergePolicy) -> MergeReport {
        let mut report = MergeReport::default();

        for (key, value) in update {
            match self.values.get_mut(key) {
                Some(current) => {
                    *current = value.clone();
                    report.updated.push(key.clone());
                }
                None if policy == MergePolicy::Open => {
                    self.values.insert(key.clone(), value.clone());
                    report.inserted.push(key.clone());
                }
                None => report.rejected.push(key.clone()),
            }
        }

        report
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub updated: Vec<String>,
    pub inserted: Vec<String>,
    pub rejected: Vec<String>,
}

/// Result of [`DeviceStore::merge`]. The merge itself always applies in memory;
/// `persisted` tells whether it also reached the backend.
#[derive(Debug)]
pub struct MergeOutcome {
    pub snapshot: Values,
    pub report: MergeReport,
    pub persisted: Result<(), StoreError>,
}

pub struct DeviceStore {
    records: RwLock<HashMap<Scope, Arc<Mutex<DeviceRecord>>>>,
    persistence: Arc<dyn RecordPersistence>,
    policy: MergePolicy,
}

impl DeviceStore {
    pub fn new(persistence: Arc<dyn RecordPersistence>, policy: MergePolicy) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            persistence,
            policy,
        }
    }

    /// In-memory store with the open merge policy.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryPersistence::new()), MergePolicy::Open)
    }

    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    /// Loads the records for `scopes` so they exist from process start.
    pub async fn preload(&self, scopes: impl IntoIterator<Item = Scope>) -> usize {
        let mut loaded = 0;
        for scope in scopes {
            self.record(&scope).await;
            loaded += 1;
        }
        info!("Preloaded {} device records", loaded);
        loaded
    }

    /// Known scopes in sorted order: core first, then tags lexicographically.
    pub async fn scopes(&self) -> Vec<Scope> {
        let mut scopes: Vec<Scope> = self.records.read().await.keys().cloned().collect();
        scopes.sort();
        scopes
    }

    pub async fn contains(&self, scope: &Scope) -> bool {
        self.records.read().await.contains_key(scope)
    }

    /// Returns the record handle for `scope`, loading or creating it on first use.
    ///
    /// A new record is inserted already locked and loaded after the table lock is
    /// released, so a slow load only holds up callers of that one scope.
    async fn record(&self, scope: &Scope) -> Arc<Mutex<DeviceRecord>> {
        if let Some(record) = self.records.read().await.get(scope) {
            return record.clone();
        }

        let (record, mut guard) = {
            let mut records = self.records.write().await;
            // another task may have created it between the two locks
            if let Some(record) = records.get(scope) {
                return record.clone();
            }

            let record = Arc::new(Mutex::new(DeviceRecord::new(scope.clone(), Values::new())));
            let guard = record.clone().lock_owned().await;
            records.insert(scope.clone(), record.clone());
            (record, guard)
        };

        guard.values = match self.persistence.load(scope).await {
            Ok(values) => values,
            Err(e) => {
                warn!("Loading {} failed, starting empty: {}", scope, e);
                Values::new()
            }
        };
        debug!("Discovered scope {} with {} values", scope, guard.values.len());
        drop(guard);

        record
    }

    pub async fn snapshot(&self, scope: &Scope) -> Values {
        let record = self.record(scope).await;
        let guard = record.lock().await;
        guard.values.clone()
    }

    /// Merges `update` into the scope's record and persists the result while the
    /// record lock is still held.
    pub async fn merge(&self, scope: &Scope, update: &Values) -> MergeOutcome {
        let record = self.record(scope).await;
        let mut guard = record.lock().await;

        let report = guard.merge(update, self.policy);
        for key in &report.rejected {
            warn!("Rejected unknown key {:?} for {} (strict schema)", key, scope);
        }

        let persisted = self.persistence.save(scope, &guard.values).await;
        if let Err(e) = &persisted {
            warn!("Update for {} kept in memory only: {}", scope, e);
        }

        MergeOutcome {
            snapshot: guard.values.clone(),
            report,
            persisted,
        }
    }

    /// Replaces the scope's record wholesale.
    pub async fn set(&self, scope: &Scope, values: Values) -> Result<(), StoreError> {
        let record = self.record(scope).await;
        let mut guard = record.lock().await;
        guard.values = values;
        self.persistence.save(scope, &guard.values).await
    }
}
