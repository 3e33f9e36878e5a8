//! External offset stores.
//!
//! A repository remembers the *last processed* offset of each partition,
//! keyed by `{topic}/{partition}`. When one is configured (and manual commits
//! are not allowed) it replaces broker commits, and consumption resumes from
//! `stored + 1` when a partition is assigned.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use crate::error::OffsetRepositoryError;
use crate::kafka::types::Partition;

#[cfg_attr(test, automock)]
pub trait OffsetRepository: Send + Sync {
    /// The last processed offset stored for this partition, if any
    fn offset(&self, partition: &Partition) -> Result<Option<i64>, OffsetRepositoryError>;

    fn store_offset(&self, partition: &Partition, offset: i64) -> Result<(), OffsetRepositoryError>;
}

#[derive(Default)]
pub struct MemoryOffsetRepository {
    offsets: DashMap<Partition, i64>,
}

impl MemoryOffsetRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

impl OffsetRepository for MemoryOffsetRepository {
    fn offset(&self, partition: &Partition) -> Result<Option<i64>, OffsetRepositoryError> {
        Ok(self.offsets.get(partition).map(|entry| *entry.value()))
    }

    fn store_offset(&self, partition: &Partition, offset: i64) -> Result<(), OffsetRepositoryError> {
        self.offsets.insert(partition.clone(), offset);
        Ok(())
    }
}

/// Offsets persisted as a JSON object of `"{topic}/{partition}": offset`.
///
/// Every store rewrites the whole file through a temporary sibling and a
/// rename, so readers never observe a half written file.
pub struct FileOffsetRepository {
    path: PathBuf,
    offsets: Mutex<BTreeMap<String, i64>>,
}

impl FileOffsetRepository {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, OffsetRepositoryError> {
        let path = path.into();
        let offsets = match fs::read(&path) {
            Ok(contents) if contents.is_empty() => BTreeMap::new(),
            Ok(contents) => serde_json::from_slice::<BTreeMap<String, i64>>(&contents)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        for key in offsets.keys() {
            if Partition::from_offset_key(key).is_none() {
                return Err(OffsetRepositoryError::InvalidKey(key.clone()));
            }
        }

        info!(
            path = %path.display(),
            partitions = offsets.len(),
            "Opened file offset repository"
        );

        Ok(Self {
            path,
            offsets: Mutex::new(offsets),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, offsets: &BTreeMap<String, i64>) -> Result<(), OffsetRepositoryError> {
        let contents = serde_json::to_vec_pretty(offsets)?;
        let tmp_path = self.path.with_extension("tmp");

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&contents)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl OffsetRepository for FileOffsetRepository {
    fn offset(&self, partition: &Partition) -> Result<Option<i64>, OffsetRepositoryError> {
        let offsets = self
            .offsets
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "poisoned offset repository lock"))?;
        Ok(offsets.get(&partition.offset_key()).copied())
    }

    fn store_offset(&self, partition: &Partition, offset: i64) -> Result<(), OffsetRepositoryError> {
        let mut offsets = self
            .offsets
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "poisoned offset repository lock"))?;
        offsets.insert(partition.offset_key(), offset);
        self.persist(&offsets)?;
        debug!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            offset = offset,
            "Stored offset in file repository"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_repository_stores_latest_offset() {
        let repo = MemoryOffsetRepository::new();
        let partition = Partition::new("orders", 0);

        assert_eq!(repo.offset(&partition).unwrap(), None);

        repo.store_offset(&partition, 10).unwrap();
        repo.store_offset(&partition, 12).unwrap();

        assert_eq!(repo.offset(&partition).unwrap(), Some(12));
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_file_repository_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");

        {
            let repo = FileOffsetRepository::open(&path).unwrap();
            repo.store_offset(&Partition::new("orders", 0), 41).unwrap();
            repo.store_offset(&Partition::new("orders", 1), 7).unwrap();
        }

        let reopened = FileOffsetRepository::open(&path).unwrap();
        assert_eq!(
            reopened.offset(&Partition::new("orders", 0)).unwrap(),
            Some(41)
        );
        assert_eq!(
            reopened.offset(&Partition::new("orders", 1)).unwrap(),
            Some(7)
        );
        assert_eq!(reopened.offset(&Partition::new("orders", 2)).unwrap(), None);

        let raw: BTreeMap<String, i64> =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw.get("orders/0"), Some(&41));
    }

    #[test]
    fn test_file_repository_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileOffsetRepository::open(dir.path().join("absent.json")).unwrap();
        assert_eq!(repo.offset(&Partition::new("orders", 0)).unwrap(), None);
    }

    #[test]
    fn test_file_repository_rejects_invalid_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");
        fs::write(&path, br#"{"no-partition": 3}"#).unwrap();

        let result = FileOffsetRepository::open(&path);
        assert!(matches!(result, Err(OffsetRepositoryError::InvalidKey(key)) if key == "no-partition"));
    }

    #[test]
    fn test_file_repository_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");
        fs::write(&path, b"not json").unwrap();

        assert!(matches!(
            FileOffsetRepository::open(&path),
            Err(OffsetRepositoryError::Serde(_))
        ));
    }
}
