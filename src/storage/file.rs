//! File-backed local store: one JSON file per encrypted record.

use super::{LocalStore, RecordId, StoreError};
use crate::crypto::LocalCiphertext;
use std::io::Write;
use std::path::{Path, PathBuf};

const EXTENSION: &str = "json";
const TMP_EXTENSION: &str = "tmp";

/// Local store that keeps each ciphertext in `<dir>/<id>.json`.
#[derive(Debug, Clone)]
pub struct FileLocalStore {
    dir: PathBuf,
}

impl FileLocalStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &RecordId) -> Result<PathBuf, StoreError> {
        if !id.is_safe() {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.{EXTENSION}")))
    }

    fn paths_with_extension(&self, extension: &str) -> Result<Vec<PathBuf>, StoreError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == extension).unwrap_or(false))
            .collect())
    }

    fn record_paths(&self) -> Result<Vec<(RecordId, PathBuf)>, StoreError> {
        let mut paths: Vec<(RecordId, PathBuf)> = self
            .paths_with_extension(EXTENSION)?
            .into_iter()
            .filter_map(|p| {
                let stem = p.file_stem()?.to_str()?.to_string();
                Some((RecordId::from(stem.as_str()), p))
            })
            .collect();
        paths.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(paths)
    }

    fn read(path: &Path) -> Result<LocalCiphertext, StoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| StoreError::Io(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    /// Overwrite a file with zeros before unlinking it.
    fn shred(path: &Path) -> Result<(), StoreError> {
        let len = std::fs::metadata(path)
            .map_err(|e| StoreError::Io(e.to_string()))?
            .len();
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| StoreError::Io(e.to_string()))?;
        file.write_all(&vec![0u8; len as usize])
            .and_then(|_| file.sync_all())
            .map_err(|e| StoreError::Io(e.to_string()))?;
        drop(file);
        std::fs::remove_file(path).map_err(|e| StoreError::Io(e.to_string()))
    }
}

impl LocalStore for FileLocalStore {
    fn put(&self, id: &RecordId, ciphertext: &LocalCiphertext) -> Result<(), StoreError> {
        let path = self.path_for(id)?;
        let json =
            serde_json::to_vec(ciphertext).map_err(|e| StoreError::Corrupt(e.to_string()))?;

        // Write then rename so a crash never leaves a half-written record
        let tmp = path.with_extension(TMP_EXTENSION);
        std::fs::write(&tmp, json).map_err(|e| StoreError::Io(e.to_string()))?;
        std::fs::rename(&tmp, &path).map_err(|e| StoreError::Io(e.to_string()))
    }

    fn get(&self, id: &RecordId) -> Result<Option<LocalCiphertext>, StoreError> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    fn list(&self) -> Result<Vec<(RecordId, LocalCiphertext)>, StoreError> {
        self.record_paths()?
            .into_iter()
            .map(|(id, path)| Ok((id, Self::read(&path)?)))
            .collect()
    }

    fn remove(&self, id: &RecordId) -> Result<bool, StoreError> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(false);
        }
        Self::shred(&path)?;
        Ok(true)
    }

    /// Shred every record and any temp file left by an interrupted `put`.
    ///
    /// Keeps going past individual failures and reports the first one.
    fn erase_all(&self) -> Result<usize, StoreError> {
        let records = self.record_paths()?;
        let leftovers = self.paths_with_extension(TMP_EXTENSION)?;

        let mut first_error = None;
        let mut erased = 0;
        for (_, path) in &records {
            match Self::shred(path) {
                Ok(()) => erased += 1,
                Err(e) => {
                    tracing::warn!(path = ?path, error = %e, "Could not shred record");
                    first_error.get_or_insert(e);
                }
            }
        }
        for path in &leftovers {
            if let Err(e) = Self::shred(path) {
                tracing::warn!(path = ?path, error = %e, "Could not shred temp file");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!(count = erased, "Erased local vault");
                Ok(erased)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::DataClass;

    fn ciphertext(byte: u8) -> LocalCiphertext {
        LocalCiphertext {
            data_class: DataClass::CheckIn,
            blob: vec![byte; 40],
        }
    }

    #[test]
    fn test_put_get_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLocalStore::open(dir.path().join("vault")).unwrap();

        let a = RecordId::from("a");
        let b = RecordId::from("b");
        store.put(&b, &ciphertext(2)).unwrap();
        store.put(&a, &ciphertext(1)).unwrap();

        assert_eq!(store.get(&a).unwrap(), Some(ciphertext(1)));
        let listed: Vec<_> = store.list().unwrap().into_iter().map(|(id, _)| id).collect();
        assert_eq!(listed, vec![a, b]);
    }

    #[test]
    fn test_overwrite_replaces_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLocalStore::open(dir.path()).unwrap();
        let id = RecordId::from("consent");

        store.put(&id, &ciphertext(1)).unwrap();
        store.put(&id, &ciphertext(9)).unwrap();

        assert_eq!(store.get(&id).unwrap(), Some(ciphertext(9)));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_erase_all_leaves_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLocalStore::open(dir.path()).unwrap();
        for i in 0..3 {
            store.put(&RecordId::generate(), &ciphertext(i)).unwrap();
        }

        assert_eq!(store.erase_all().unwrap(), 3);
        assert!(store.list().unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_erase_all_shreds_interrupted_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLocalStore::open(dir.path()).unwrap();
        store.put(&RecordId::from("a"), &ciphertext(1)).unwrap();
        std::fs::write(dir.path().join("b.tmp"), b"half-written").unwrap();

        assert_eq!(store.erase_all().unwrap(), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_unsafe_id_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLocalStore::open(dir.path()).unwrap();

        let err = store
            .put(&RecordId::from("../escape"), &ciphertext(0))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidId(_)));
    }

    #[test]
    fn test_remove_missing_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLocalStore::open(dir.path()).unwrap();
        assert!(!store.remove(&RecordId::from("nope")).unwrap());
    }
}
