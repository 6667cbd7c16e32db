//! Durable backends for device records.
//!
//! The store only sees [`RecordPersistence`]: one blob per scope, loaded once when the
//! scope is first touched and replaced wholesale after every merge.

use super::{StoreError, Values};
use crate::topic::Scope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

#[async_trait]
pub trait RecordPersistence: Send + Sync {
    /// Returns the stored values for `scope`, or an empty map if nothing was stored yet.
    async fn load(&self, scope: &Scope) -> Result<Values, StoreError>;

    async fn save(&self, scope: &Scope, values: &Values) -> Result<(), StoreError>;
}

/// Process-local backend, used for ephemeral runs and tests.
///
/// `set_unavailable(true)` makes every call fail with
/// [`StoreError::ScopeUnavailable`], which is how outages are simulated.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    blobs: Mutex<HashMap<Scope, Values>>,
    unavailable: AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = (Scope, Values)>) -> Self {
        Self {
            blobs: Mutex::new(records.into_iter().collect()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Last successfully saved blob for `scope`.
    pub fn stored(&self, scope: &Scope) -> Option<Values> {
        self.blobs
            .lock()
            .ok()
            .and_then(|blobs| blobs.get(scope).cloned())
    }

    fn check_available(&self, scope: &Scope) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(scope, "memory backend marked unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordPersistence for MemoryPersistence {
    async fn load(&self, scope: &Scope) -> Result<Values, StoreError> {
        self.check_available(scope)?;
        let blobs = self
            .blobs
            .lock()
            .map_err(|e| StoreError::unavailable(scope, e.to_string()))?;
        Ok(blobs.get(scope).cloned().unwrap_or_default())
    }

    async fn save(&self, scope: &Scope, values: &Values) -> Result<(), StoreError> {
        self.check_available(scope)?;
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|e| StoreError::unavailable(scope, e.to_string()))?;
        blobs.insert(scope.clone(), values.clone());
        Ok(())
    }
}

/// On-disk layout of one record file.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
struct RecordFile {
    #[serde(default)]
    act_value: Values,
}

/// Stores each scope as a pretty-printed JSON file below `dir`:
/// `core.json` and `lightpost-<tag>.json`, both shaped `{"act_value": {...}}`.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    dir: PathBuf,
}

impl JsonFilePersistence {
    /// Creates `dir` if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| StoreError::ScopeUnavailable {
            scope: dir.display().to_string(),
            reason: format!("Failed to create data directory: {}", e),
        })?;
        info!("Using record directory {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, scope: &Scope) -> PathBuf {
        match scope {
            Scope::Core => self.dir.join("core.json"),
            Scope::Device(tag) => self.dir.join(format!("lightpost-{}.json", tag)),
        }
    }
}

#[async_trait]
impl RecordPersistence for JsonFilePersistence {
    async fn load(&self, scope: &Scope) -> Result<Values, StoreError> {
        let path = self.path_for(scope);
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::unavailable(scope, format!("Failed to check {}: {}", path.display(), e)))?;
        if !exists {
            debug!("No record file for {}, starting empty", scope);
            return Ok(Values::new());
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| StoreError::unavailable(scope, format!("Failed to read {}: {}", path.display(), e)))?;
        let file: RecordFile = serde_json::from_str(&content)
            .map_err(|e| StoreError::unavailable(scope, format!("Failed to parse {}: {}", path.display(), e)))?;
        Ok(file.act_value)
    }

    async fn save(&self, scope: &Scope, values: &Values) -> Result<(), StoreError> {
        let path = self.path_for(scope);
        let file = RecordFile {
            act_value: values.clone(),
        };
        let content = serde_json::to_string_pretty(&file)
            .map_err(|e| StoreError::unavailable(scope, format!("Failed to serialize record: {}", e)))?;

        // write next to the target and rename so readers never see a half-written file
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| StoreError::unavailable(scope, format!("Failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::unavailable(scope, format!("Failed to replace {}: {}", path.display(), e)))?;

        debug!("Saved record {} to {}", scope, path.display());
        Ok(())
    }
}
