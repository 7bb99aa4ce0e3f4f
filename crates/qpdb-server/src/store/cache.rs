//! On-disk PDB cache.
//!
//! Files live at `{root}/{pdb_name}/{GUID}{age}/{pdb_name}`. A file only ever
//! appears at that path through an atomic rename of a fully written temp file,
//! so readers never observe a partial download. Concurrent requests for the
//! same identity share one download; different identities proceed in parallel.

use super::Fetch;
use parking_lot::Mutex;
use qpdb::archive;
use qpdb::{DebugIdentity, QpdbError, QpdbResult};
use std::collections::HashMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct SymbolStore {
    root: PathBuf,
    fetcher: Arc<dyn Fetch>,
    /// One lock per relative path currently being resolved.
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SymbolStore {
    pub fn new(root: impl Into<PathBuf>, fetcher: Arc<dyn Fetch>) -> Self {
        SymbolStore {
            root: root.into(),
            fetcher,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cache location for an identity, whether or not it exists yet.
    pub fn local_path(&self, identity: &DebugIdentity) -> PathBuf {
        self.root.join(archive::relative_path(identity))
    }

    /// Return the local path of the PDB for `identity`, downloading it first
    /// if it is not cached.
    pub fn ensure_local(&self, identity: &DebugIdentity) -> QpdbResult<PathBuf> {
        archive::check_components(identity)?;
        let relative = archive::relative_path(identity);
        let local = self.local_path(identity);

        if local.is_file() {
            debug!("Cache hit: {}", relative);
            return Ok(local);
        }

        self.with_key_lock(&relative, || {
            // Another request may have finished the download while we waited.
            if local.is_file() {
                debug!("Cache filled while waiting: {}", relative);
                return Ok(local.clone());
            }
            self.download(identity, &local)?;
            Ok(local.clone())
        })
    }

    fn with_key_lock<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        let lock = self
            .in_flight
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone();

        let result = {
            let _held = lock.lock();
            f()
        };

        // Clones are only taken under the map lock, so a count of two
        // (map + ours) means nobody else is waiting on this key.
        let mut in_flight = self.in_flight.lock();
        let last = Arc::strong_count(&lock) == 2;
        drop(lock);
        if last {
            in_flight.remove(key);
        }
        result
    }

    fn download(&self, identity: &DebugIdentity, local: &Path) -> QpdbResult<()> {
        let dir = local
            .parent()
            .ok_or_else(|| QpdbError::UnsafePath(local.display().to_string()))?;
        fs::create_dir_all(dir)?;

        // Same directory as the target so the final rename stays on one filesystem.
        let mut tmp = tempfile::Builder::new()
            .prefix(".download-")
            .suffix(".tmp")
            .tempfile_in(dir)?;

        let bytes = {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            let bytes = self.fetcher.fetch(identity, &mut writer).inspect_err(|e| {
                warn!("Download of {} failed: {}", identity.file_name, e);
            })?;
            writer.flush()?;
            bytes
        };
        tmp.as_file().sync_all()?;
        tmp.persist(local).map_err(|e| QpdbError::Io(e.error))?;

        info!("Cached {} ({} bytes)", local.display(), bytes);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeArchive;
    use super::*;
    use std::time::Duration;

    fn identity() -> DebugIdentity {
        DebugIdentity::new("ntkrnlmp.pdb", "8E3373D6124E747F0E72EF8E02E676B3", 1)
    }

    fn dir_entries(dir: &Path) -> Vec<PathBuf> {
        match fs::read_dir(dir) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    #[test]
    fn test_ensure_local_downloads_once() {
        let root = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeArchive::serving(b"pdb bytes".to_vec()));
        let store = SymbolStore::new(root.path(), fake.clone());

        let first = store.ensure_local(&identity()).unwrap();
        let second = store.ensure_local(&identity()).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            first,
            root.path()
                .join("ntkrnlmp.pdb/8E3373D6124E747F0E72EF8E02E676B31/ntkrnlmp.pdb")
        );
        assert_eq!(fs::read(&first).unwrap(), b"pdb bytes");
        assert_eq!(fake.calls(), 1);
    }

    #[test]
    fn test_existing_file_is_not_fetched() {
        let root = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeArchive::serving(b"remote".to_vec()));
        let store = SymbolStore::new(root.path(), fake.clone());

        let local = store.local_path(&identity());
        fs::create_dir_all(local.parent().unwrap()).unwrap();
        fs::write(&local, b"seeded").unwrap();

        assert_eq!(store.ensure_local(&identity()).unwrap(), local);
        assert_eq!(fs::read(&local).unwrap(), b"seeded");
        assert_eq!(fake.calls(), 0);
    }

    #[test]
    fn test_concurrent_requests_share_one_download() {
        let root = tempfile::tempdir().unwrap();
        let fake = Arc::new(
            FakeArchive::serving(vec![0xAB; 4096]).with_delay(Duration::from_millis(50)),
        );
        let store = Arc::new(SymbolStore::new(root.path(), fake.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.ensure_local(&identity()).unwrap())
            })
            .collect();
        let paths: Vec<PathBuf> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(paths.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(fake.calls(), 1);
        assert_eq!(fs::read(&paths[0]).unwrap().len(), 4096);
        assert!(store.in_flight.lock().is_empty());
    }

    #[test]
    fn test_distinct_identities_fetch_separately() {
        let root = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeArchive::serving(b"x".to_vec()));
        let store = SymbolStore::new(root.path(), fake.clone());

        let a = store.ensure_local(&identity()).unwrap();
        let b = store
            .ensure_local(&DebugIdentity::new("ntkrnlmp.pdb", "8E3373D6124E747F0E72EF8E02E676B3", 2))
            .unwrap();

        assert_ne!(a, b);
        assert_eq!(fake.calls(), 2);
    }

    #[test]
    fn test_failed_download_leaves_nothing_behind() {
        let root = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeArchive::failing());
        let store = SymbolStore::new(root.path(), fake.clone());

        let err = store.ensure_local(&identity()).unwrap_err();
        assert!(matches!(err, QpdbError::Download { .. }));

        let local = store.local_path(&identity());
        assert!(!local.exists());
        assert!(dir_entries(local.parent().unwrap()).is_empty());

        // A later request retries instead of caching the failure.
        assert!(store.ensure_local(&identity()).is_err());
        assert_eq!(fake.calls(), 2);
    }

    #[test]
    fn test_invalid_identity_skips_fetch() {
        let root = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeArchive::serving(b"x".to_vec()));
        let store = SymbolStore::new(root.path(), fake.clone());

        let err = store
            .ensure_local(&DebugIdentity::new("", "8E3373D6124E747F0E72EF8E02E676B3", 1))
            .unwrap_err();
        assert!(matches!(err, QpdbError::InvalidIdentity));

        let err = store
            .ensure_local(&DebugIdentity::new("..", "8E3373D6124E747F0E72EF8E02E676B3", 1))
            .unwrap_err();
        assert!(matches!(err, QpdbError::UnsafePath(_)));
        assert_eq!(fake.calls(), 0);
        assert!(dir_entries(root.path()).is_empty());
    }
}
