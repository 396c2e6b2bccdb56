/// Version history: immutable document snapshots with structural diffs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    Change, CollaborationError, FieldKey, FieldVersion, ParticipantId, ReportDocument, ReportId,
    Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(pub uuid::Uuid);

impl VersionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for VersionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable copy of a report at one point of its history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    pub id: VersionId,
    pub report_id: ReportId,

    /// Strictly increasing per report, starting at 1
    pub version: u64,

    /// `None` for automatic snapshots
    pub author: Option<ParticipantId>,
    pub created_at: DateTime<Utc>,
    pub description: String,

    /// Changes relative to the previous snapshot
    pub changes: Vec<Change>,

    pub document: ReportDocument,
    pub field_versions: BTreeMap<FieldKey, FieldVersion>,

    /// Set when this snapshot documents a restore
    #[serde(default)]
    pub restored_from: Option<VersionId>,
}

/// Storage key for a persisted snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotKey {
    pub report_id: ReportId,
    pub version: u64,
}

impl std::fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.report_id, self.version)
    }
}

/// Opaque key-value persistence for snapshot blobs
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn put(&self, key: SnapshotKey, value: Vec<u8>) -> Result<()>;

    async fn get(&self, key: SnapshotKey) -> Result<Option<Vec<u8>>>;
}

/// In-process snapshot storage
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    blobs: parking_lot::RwLock<HashMap<SnapshotKey, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn put(&self, key: SnapshotKey, value: Vec<u8>) -> Result<()> {
        let mut blobs = self.blobs.write();
        if blobs.contains_key(&key) {
            return Err(CollaborationError::StorageError(format!(
                "snapshot {key} already exists"
            )));
        }
        blobs.insert(key, value);
        Ok(())
    }

    async fn get(&self, key: SnapshotKey) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(&key).cloned())
    }
}

/// What a new snapshot captures
#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub author: Option<ParticipantId>,
    pub description: String,
    pub document: ReportDocument,
    pub field_versions: BTreeMap<FieldKey, FieldVersion>,
    pub restored_from: Option<VersionId>,
}

#[derive(Debug, Default)]
struct ReportHistory {
    /// (id, version) in creation order
    entries: Vec<(VersionId, u64)>,
    latest: Option<ReportDocument>,
}

/// Append-only version history over a [`SnapshotStore`]
pub struct VersionStore {
    store: Arc<dyn SnapshotStore>,
    reports: Mutex<HashMap<ReportId, ReportHistory>>,
}

impl VersionStore {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            reports: Mutex::new(HashMap::new()),
        }
    }

    /// Create the next snapshot of a report
    pub async fn create(&self, request: SnapshotRequest) -> Result<VersionSnapshot> {
        let report_id = request.document.report_id;
        // Held across the write so version numbers stay strictly increasing
        let mut reports = self.reports.lock().await;
        let history = reports.entry(report_id).or_default();

        let empty = ReportDocument::new(report_id);
        let previous = history.latest.as_ref().unwrap_or(&empty);
        let changes = report::diff(previous, &request.document);
        let version = history.entries.last().map_or(1, |(_, v)| v + 1);

        let snapshot = VersionSnapshot {
            id: VersionId::new(),
            report_id,
            version,
            author: request.author,
            created_at: Utc::now(),
            description: request.description,
            changes,
            document: request.document,
            field_versions: request.field_versions,
            restored_from: request.restored_from,
        };

        let blob = serde_json::to_vec(&snapshot)?;
        self.store
            .put(SnapshotKey { report_id, version }, blob)
            .await?;

        history.entries.push((snapshot.id, version));
        history.latest = Some(snapshot.document.clone());

        info!(
            report = %report_id,
            version,
            changes = snapshot.changes.len(),
            "created snapshot"
        );
        Ok(snapshot)
    }

    pub async fn get(&self, report_id: &ReportId, id: &VersionId) -> Result<VersionSnapshot> {
        let version = {
            let reports = self.reports.lock().await;
            reports
                .get(report_id)
                .and_then(|h| h.entries.iter().find(|(vid, _)| vid == id))
                .map(|(_, v)| *v)
        };
        let version =
            version.ok_or_else(|| CollaborationError::NotFound(format!("version {id}")))?;
        self.load(SnapshotKey {
            report_id: *report_id,
            version,
        })
        .await
    }

    /// All snapshots of a report in creation order
    pub async fn history(&self, report_id: &ReportId) -> Result<Vec<VersionSnapshot>> {
        let versions: Vec<u64> = {
            let reports = self.reports.lock().await;
            reports
                .get(report_id)
                .map(|h| h.entries.iter().map(|(_, v)| *v).collect())
                .unwrap_or_default()
        };
        let mut out = Vec::with_capacity(versions.len());
        for version in versions {
            out.push(
                self.load(SnapshotKey {
                    report_id: *report_id,
                    version,
                })
                .await?,
            );
        }
        Ok(out)
    }

    /// Document of the newest snapshot, if any
    pub async fn latest_document(&self, report_id: &ReportId) -> Option<ReportDocument> {
        self.reports
            .lock()
            .await
            .get(report_id)
            .and_then(|h| h.latest.clone())
    }

    async fn load(&self, key: SnapshotKey) -> Result<VersionSnapshot> {
        debug!(%key, "loading snapshot");
        let blob = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| CollaborationError::StorageError(format!("snapshot {key} missing")))?;
        Ok(serde_json::from_slice(&blob)?)
    }
}

impl std::fmt::Debug for VersionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(doc: ReportDocument, description: &str) -> SnapshotRequest {
        SnapshotRequest {
            author: None,
            description: description.into(),
            document: doc,
            field_versions: BTreeMap::new(),
            restored_from: None,
        }
    }

    #[tokio::test]
    async fn versions_increase_and_diff_against_previous() {
        let store = VersionStore::new(Arc::new(MemorySnapshotStore::new()));
        let report = ReportId::new();
        let key = FieldKey::new("findings", "text");

        let first = store
            .create(request(
                ReportDocument::from_fields(report, [(key.clone(), "normal")]),
                "draft",
            ))
            .await
            .unwrap();
        assert_eq!(first.version, 1);
        assert!(!first.changes.is_empty());

        let second = store
            .create(request(
                ReportDocument::from_fields(report, [(key.clone(), "abnormal")]),
                "edit",
            ))
            .await
            .unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.changes.len(), 1);
        assert_eq!(second.changes[0].kind_name(), "field_modified");

        let history = store.history(&report).await.unwrap();
        assert_eq!(
            history.iter().map(|s| s.version).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(store.get(&report, &first.id).await.unwrap(), first);
    }

    #[tokio::test]
    async fn unknown_version_is_not_found() {
        let store = VersionStore::new(Arc::new(MemorySnapshotStore::new()));
        let err = store.get(&ReportId::new(), &VersionId::new()).await.unwrap_err();
        assert!(matches!(err, CollaborationError::NotFound(_)));
    }

    #[tokio::test]
    async fn memory_store_refuses_overwrite() {
        let store = MemorySnapshotStore::new();
        let key = SnapshotKey {
            report_id: ReportId::new(),
            version: 1,
        };
        store.put(key, b"a".to_vec()).await.unwrap();
        assert!(store.put(key, b"b".to_vec()).await.is_err());
        assert_eq!(store.get(key).await.unwrap(), Some(b"a".to_vec()));
    }
}
