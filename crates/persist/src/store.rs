//! File-backed partition store.
//!
//! Layout inside the store directory:
//! ```text
//! store.meta.json          - schema version
//! partitions/
//!   <partition>.cbor.zst   - CBOR+zstd compressed partition snapshot
//! integrity/
//!   manifest.json          - sha256 of every partition file
//! ```

use crate::codec::{decode, encode, sha256_hex};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use zonehost_common::{EntityCreate, EntityId, EntityUpdate, PartitionId, apply_deltas};
use zonehost_kernel::{AccessError, DataAccess, PartitionMeta, PartitionSnapshot};

/// Current on-disk schema version.
pub const STORE_SCHEMA_VERSION: u32 = 1;

const PARTITION_SUFFIX: &str = ".cbor.zst";

/// Errors from file-backed persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum FileStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("integrity check failed for {file}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        file: String,
        expected: String,
        actual: String,
    },
    #[error("schema version mismatch: file has v{file_version}, expected v{expected_version}")]
    SchemaMismatch {
        file_version: u32,
        expected_version: u32,
    },
    #[error("invalid partition id: {0:?}")]
    InvalidPartitionId(String),
    #[error("unknown partition: {0}")]
    UnknownPartition(PartitionId),
    #[error("blocking task failed: {0}")]
    Join(String),
}

impl From<FileStoreError> for AccessError {
    fn from(e: FileStoreError) -> Self {
        match e {
            FileStoreError::UnknownPartition(id) => AccessError::UnknownPartition(id),
            other => AccessError::Backend(Box::new(other)),
        }
    }
}

/// Metadata stored in store.meta.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub schema_version: u32,
}

/// A single entry in the integrity manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub sha256: String,
    pub bytes: u64,
}

/// Hashes of every partition file, keyed by file name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityManifest {
    pub entries: BTreeMap<String, ManifestEntry>,
}

/// Disk-backed [`DataAccess`] implementation.
///
/// Blocking file IO runs on tokio's blocking pool. Writes are serialized
/// through the manifest lock, so concurrent applies to different partitions
/// never lose a manifest update.
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    root: PathBuf,
    meta: StoreMeta,
    manifest: Mutex<IntegrityManifest>,
}

impl FileStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FileStoreError> {
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("partitions"))?;
        std::fs::create_dir_all(root.join("integrity"))?;

        let meta_path = root.join("store.meta.json");
        let manifest_path = root.join("integrity").join("manifest.json");

        let (meta, manifest) = if meta_path.exists() {
            let meta: StoreMeta = serde_json::from_reader(std::fs::File::open(&meta_path)?)?;
            if meta.schema_version != STORE_SCHEMA_VERSION {
                return Err(FileStoreError::SchemaMismatch {
                    file_version: meta.schema_version,
                    expected_version: STORE_SCHEMA_VERSION,
                });
            }
            let manifest: IntegrityManifest = if manifest_path.exists() {
                serde_json::from_reader(std::fs::File::open(&manifest_path)?)?
            } else {
                IntegrityManifest::default()
            };
            (meta, manifest)
        } else {
            let meta = StoreMeta {
                schema_version: STORE_SCHEMA_VERSION,
            };
            let manifest = IntegrityManifest::default();
            write_json(&meta_path, &meta)?;
            write_json(&manifest_path, &manifest)?;
            (meta, manifest)
        };

        tracing::info!(root = %root.display(), partitions = manifest.entries.len(), "file store opened");
        Ok(Self {
            inner: Arc::new(StoreInner {
                root,
                meta,
                manifest: Mutex::new(manifest),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn meta(&self) -> &StoreMeta {
        &self.inner.meta
    }

    /// Re-hash every file listed in the manifest.
    pub fn verify_integrity(&self) -> Result<(), FileStoreError> {
        let manifest = self.inner.manifest();
        for (filename, entry) in &manifest.entries {
            let data = std::fs::read(self.inner.root.join("partitions").join(filename))?;
            check_hash(filename, entry, &data)?;
        }
        Ok(())
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T, FileStoreError>
    where
        F: FnOnce(&StoreInner) -> Result<T, FileStoreError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || work(&inner))
            .await
            .map_err(|e| FileStoreError::Join(e.to_string()))?
    }
}

impl StoreInner {
    fn manifest(&self) -> MutexGuard<'_, IntegrityManifest> {
        self.manifest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn partition_path(&self, partition: &PartitionId) -> Result<(String, PathBuf), FileStoreError> {
        validate_id(partition.as_str())?;
        let filename = format!("{}{PARTITION_SUFFIX}", partition.as_str());
        let path = self.root.join("partitions").join(&filename);
        Ok((filename, path))
    }

    fn list(&self) -> Result<Vec<PartitionId>, FileStoreError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(self.root.join("partitions"))? {
            let name = entry?.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_suffix(PARTITION_SUFFIX)) else {
                continue;
            };
            if validate_id(id).is_ok() {
                ids.push(PartitionId::new(id));
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn read(&self, partition: &PartitionId) -> Result<PartitionSnapshot, FileStoreError> {
        let manifest = self.manifest();
        self.read_with(&manifest, partition)
    }

    fn read_with(
        &self,
        manifest: &IntegrityManifest,
        partition: &PartitionId,
    ) -> Result<PartitionSnapshot, FileStoreError> {
        let (filename, path) = self.partition_path(partition)?;
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FileStoreError::UnknownPartition(partition.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(entry) = manifest.entries.get(&filename) {
            check_hash(&filename, entry, &data)?;
        }
        decode(&data)
    }

    /// Write a snapshot and record its hash. The caller holds the manifest lock.
    fn write(
        &self,
        manifest: &mut IntegrityManifest,
        snapshot: &PartitionSnapshot,
    ) -> Result<(), FileStoreError> {
        let (filename, path) = self.partition_path(&snapshot.meta.id)?;
        let data = encode(snapshot)?;

        let staging = path.with_extension("zst.tmp");
        std::fs::write(&staging, &data)?;
        std::fs::rename(&staging, &path)?;

        manifest.entries.insert(
            filename,
            ManifestEntry {
                sha256: sha256_hex(&data),
                bytes: data.len() as u64,
            },
        );
        write_json(&self.root.join("integrity").join("manifest.json"), &*manifest)
    }
}

/// Write JSON beside `path`, then rename over it, so readers never see a
/// half-written file.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), FileStoreError> {
    let staging = path.with_extension("json.tmp");
    std::fs::write(&staging, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(&staging, path)?;
    Ok(())
}

fn check_hash(filename: &str, entry: &ManifestEntry, data: &[u8]) -> Result<(), FileStoreError> {
    let actual = sha256_hex(data);
    if actual != entry.sha256 {
        return Err(FileStoreError::IntegrityMismatch {
            file: filename.to_string(),
            expected: entry.sha256.clone(),
            actual,
        });
    }
    Ok(())
}

fn validate_id(id: &str) -> Result<(), FileStoreError> {
    let unsafe_id = id.is_empty()
        || id.starts_with('.')
        || id.contains("..")
        || id.chars().any(|c| matches!(c, '/' | '\\' | '\0') || c.is_control());
    if unsafe_id {
        return Err(FileStoreError::InvalidPartitionId(id.to_string()));
    }
    Ok(())
}

impl DataAccess for FileStore {
    fn list_partitions(&self) -> BoxFuture<'_, Result<Vec<PartitionId>, AccessError>> {
        Box::pin(async move { Ok(self.blocking(|inner| inner.list()).await?) })
    }

    fn load_snapshot<'a>(
        &'a self,
        partition: &'a PartitionId,
    ) -> BoxFuture<'a, Result<PartitionSnapshot, AccessError>> {
        let partition = partition.clone();
        Box::pin(async move { Ok(self.blocking(move |inner| inner.read(&partition)).await?) })
    }

    fn apply<'a>(
        &'a self,
        partition: &'a PartitionId,
        creates: &'a [EntityCreate],
        updates: &'a [EntityUpdate],
        deletes: &'a [EntityId],
    ) -> BoxFuture<'a, Result<(), AccessError>> {
        let partition = partition.clone();
        let (creates, updates, deletes) = (creates.to_vec(), updates.to_vec(), deletes.to_vec());
        Box::pin(async move {
            self.blocking(move |inner| {
                let mut manifest = inner.manifest();
                let mut snapshot = inner.read_with(&manifest, &partition)?;
                apply_deltas(&mut snapshot.entities, &creates, &updates, &deletes);
                inner.write(&mut manifest, &snapshot)
            })
            .await?;
            Ok(())
        })
    }

    fn ensure_partition(&self, meta: PartitionMeta) -> BoxFuture<'_, Result<(), AccessError>> {
        Box::pin(async move {
            self.blocking(move |inner| {
                let mut manifest = inner.manifest();
                let (_, path) = inner.partition_path(&meta.id)?;
                if path.exists() {
                    return Ok(());
                }
                tracing::info!(partition = %meta.id, "creating partition");
                let snapshot = PartitionSnapshot {
                    meta,
                    entities: Vec::new(),
                };
                inner.write(&mut manifest, &snapshot)
            })
            .await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use zonehost_common::Entity;

    fn p(id: &str) -> PartitionId {
        PartitionId::new(id)
    }

    #[test]
    fn open_creates_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::open(tmp.path().join("zones")).unwrap();
        assert_eq!(store.meta().schema_version, STORE_SCHEMA_VERSION);
        assert!(store.root().join("partitions").is_dir());
        assert!(store.root().join("integrity").join("manifest.json").is_file());
        assert!(store.root().join("store.meta.json").is_file());
    }

    #[tokio::test]
    async fn ensure_apply_and_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("zones");
        let rock = Entity::new("rock", json!({"hp": 3, "pos": [1, 2]}));
        {
            let store = FileStore::open(&path).unwrap();
            store.ensure_partition(PartitionMeta::new("p1")).await.unwrap();
            store
                .apply(&p("p1"), &[EntityCreate { entity: rock.clone() }], &[], &[])
                .await
                .unwrap();
            store
                .apply(
                    &p("p1"),
                    &[],
                    &[EntityUpdate {
                        id: rock.id,
                        data: json!({"hp": 2}),
                    }],
                    &[],
                )
                .await
                .unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.list_partitions().await.unwrap(), vec![p("p1")]);
        let snapshot = store.load_snapshot(&p("p1")).await.unwrap();
        assert_eq!(snapshot.entities.len(), 1);
        assert_eq!(snapshot.entities[0].data, json!({"hp": 2, "pos": [1, 2]}));
        store.verify_integrity().unwrap();
    }

    #[tokio::test]
    async fn ensure_keeps_existing_state() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::open(tmp.path()).unwrap();
        store.ensure_partition(PartitionMeta::new("p1")).await.unwrap();
        let tree = Entity::new("tree", json!({}));
        store
            .apply(&p("p1"), &[EntityCreate { entity: tree }], &[], &[])
            .await
            .unwrap();

        store.ensure_partition(PartitionMeta::new("p1")).await.unwrap();
        assert_eq!(store.load_snapshot(&p("p1")).await.unwrap().entities.len(), 1);
    }

    #[tokio::test]
    async fn unknown_partition_maps_to_access_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::open(tmp.path()).unwrap();
        let err = store.load_snapshot(&p("nowhere")).await.unwrap_err();
        assert!(matches!(err, AccessError::UnknownPartition(id) if id == p("nowhere")));
        assert!(!store.partition_exists(&p("nowhere")).await.unwrap());
        assert!(store.apply(&p("nowhere"), &[], &[], &[]).await.is_err());
    }

    #[tokio::test]
    async fn path_escaping_ids_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::open(tmp.path().join("zones")).unwrap();
        for id in ["../outside", "a/b", "a\\b", "", ".hidden"] {
            let err = store.ensure_partition(PartitionMeta::new(id)).await.unwrap_err();
            assert!(matches!(err, AccessError::Backend(_)), "{id:?} was accepted");
        }
        assert!(!tmp.path().join("outside.cbor.zst").exists());
        assert!(store.list_partitions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corruption_fails_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("zones");
        let store = FileStore::open(&path).unwrap();
        store.ensure_partition(PartitionMeta::new("p1")).await.unwrap();

        let file = path.join("partitions").join("p1.cbor.zst");
        let mut data = std::fs::read(&file).unwrap();
        if let Some(byte) = data.last_mut() {
            *byte ^= 0xff;
        }
        std::fs::write(&file, &data).unwrap();

        let reopened = FileStore::open(&path).unwrap();
        assert!(matches!(
            reopened.verify_integrity(),
            Err(FileStoreError::IntegrityMismatch { .. })
        ));
        assert!(reopened.load_snapshot(&p("p1")).await.is_err());
    }

    #[tokio::test]
    async fn interrupted_manifest_write_keeps_store_readable() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("zones");
        let store = FileStore::open(&path).unwrap();
        store.ensure_partition(PartitionMeta::new("p1")).await.unwrap();
        let integrity = path.join("integrity");
        assert!(!integrity.join("manifest.json.tmp").exists());

        // A crash mid-write leaves only a truncated staging file behind.
        std::fs::write(integrity.join("manifest.json.tmp"), b"{\"entries\": {\"p1.cb").unwrap();

        let reopened = FileStore::open(&path).unwrap();
        reopened.verify_integrity().unwrap();
        let rock = Entity::new("rock", json!({}));
        reopened
            .apply(&p("p1"), &[EntityCreate { entity: rock }], &[], &[])
            .await
            .unwrap();
        assert!(!integrity.join("manifest.json.tmp").exists());

        let manifest: IntegrityManifest =
            serde_json::from_slice(&std::fs::read(integrity.join("manifest.json")).unwrap()).unwrap();
        assert!(manifest.entries.contains_key("p1.cbor.zst"));
        FileStore::open(&path).unwrap().verify_integrity().unwrap();
    }

    #[test]
    fn schema_mismatch_fails_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("zones");
        let _store = FileStore::open(&path).unwrap();

        let meta_path = path.join("store.meta.json");
        let meta = StoreMeta { schema_version: 999 };
        serde_json::to_writer_pretty(std::fs::File::create(&meta_path).unwrap(), &meta).unwrap();

        match FileStore::open(&path) {
            Err(FileStoreError::SchemaMismatch {
                file_version,
                expected_version,
            }) => {
                assert_eq!(file_version, 999);
                assert_eq!(expected_version, STORE_SCHEMA_VERSION);
            }
            Err(e) => panic!("expected SchemaMismatch, got: {e}"),
            Ok(_) => panic!("expected error, got Ok"),
        }
    }

    #[tokio::test]
    async fn concurrent_applies_keep_manifest_complete() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("zones");
        let store = FileStore::open(&path).unwrap();
        let ids: Vec<String> = (0..8).map(|i| format!("zone-{i}")).collect();
        for id in &ids {
            store.ensure_partition(PartitionMeta::new(id.as_str())).await.unwrap();
        }

        let writes = ids.iter().map(|id| {
            let store = store.clone();
            let partition = p(id);
            tokio::spawn(async move {
                let entity = Entity::new("marker", json!({}));
                store
                    .apply(&partition, &[EntityCreate { entity }], &[], &[])
                    .await
            })
        });
        for handle in writes.collect::<Vec<_>>() {
            handle.await.unwrap().unwrap();
        }

        let reopened = FileStore::open(&path).unwrap();
        reopened.verify_integrity().unwrap();
        for id in &ids {
            let snapshot = reopened.load_snapshot(&p(id)).await.unwrap();
            assert_eq!(snapshot.entities.len(), 1);
        }
    }
}
