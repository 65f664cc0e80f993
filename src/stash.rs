use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::engine::EngineError;
use crate::limits::*;
use crate::reconciler::{PendingBookingStore, PendingGuestBooking};

/// Encode a record as `[len][bincode][crc32]`.
fn encode_record(writer: &mut impl Write, pending: &PendingGuestBooking) -> io::Result<()> {
    let payload =
        bincode::serialize(pending).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_PENDING_RECORD_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "pending booking too large",
        ));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Decode a record. Anything truncated, oversized or failing its checksum is `None`.
fn decode_record(bytes: &[u8]) -> Option<PendingGuestBooking> {
    let len = u32::from_le_bytes(bytes.get(..4)?.try_into().ok()?) as usize;
    if len > MAX_PENDING_RECORD_BYTES {
        return None;
    }
    let payload = bytes.get(4..4 + len)?;
    let crc = u32::from_le_bytes(bytes.get(4 + len..8 + len)?.try_into().ok()?);
    if crc != crc32fast::hash(payload) {
        return None;
    }
    bincode::deserialize(payload).ok()
}

fn stash_error(e: io::Error) -> EngineError {
    EngineError::Stash(e.to_string())
}

/// One device's pending booking, kept in a single file.
///
/// Writes go to a temp file that is fsynced and renamed over the record, so a
/// crash leaves either the old stash or the new one. A damaged file reads as
/// "nothing stashed".
pub struct FilePendingStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FilePendingStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> io::Result<Option<PendingGuestBooking>> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let record = decode_record(&bytes);
        if record.is_none() {
            warn!("ignoring corrupt stash at {}", self.path.display());
        }
        Ok(record)
    }

    fn write(&self, pending: &PendingGuestBooking) -> io::Result<()> {
        let tmp_path = self.path.with_extension("stash.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        encode_record(&mut writer, pending)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&tmp_path, &self.path)
    }

    fn remove(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Delete the stash if it is older than `ttl`. Returns whether it was removed.
    pub async fn remove_if_expired(&self, now: DateTime<Utc>, ttl: Duration) -> Result<bool, EngineError> {
        let _guard = self.lock.lock().await;
        match self.read().map_err(stash_error)? {
            Some(pending) if pending.is_expired(now, ttl) => {
                self.remove().map_err(stash_error)?;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                // corrupt leftovers go too
                self.remove().map_err(stash_error)?;
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl PendingBookingStore for FilePendingStore {
    async fn put(&self, pending: PendingGuestBooking) -> Result<Option<PendingGuestBooking>, EngineError> {
        let _guard = self.lock.lock().await;
        let previous = self.read().map_err(stash_error)?;
        self.write(&pending).map_err(stash_error)?;
        Ok(previous)
    }

    async fn take(&self) -> Result<Option<PendingGuestBooking>, EngineError> {
        let _guard = self.lock.lock().await;
        let pending = self.read().map_err(stash_error)?;
        self.remove().map_err(stash_error)?;
        Ok(pending)
    }

    async fn peek(&self) -> Result<Option<PendingGuestBooking>, EngineError> {
        let _guard = self.lock.lock().await;
        self.read().map_err(stash_error)
    }
}

/// Per-device stash files under one directory. Stores are created lazily and
/// shared, so concurrent calls for the same device serialize on one lock.
pub struct StashDirectory {
    dir: PathBuf,
    stores: DashMap<String, Arc<FilePendingStore>>,
}

impl StashDirectory {
    pub fn new(dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            stores: DashMap::new(),
        })
    }

    /// Get or lazily create the store for a device.
    pub fn store_for(&self, device_id: &str) -> Result<Arc<FilePendingStore>, EngineError> {
        if device_id.len() > MAX_DEVICE_ID_LEN {
            return Err(EngineError::LimitExceeded("device id too long"));
        }
        // Used verbatim as the file name, so distinct ids never share a file
        if device_id.is_empty() {
            return Err(EngineError::Format("empty device id".into()));
        }
        if !device_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(EngineError::Format(format!(
                "device id may only contain letters, digits, '_' and '-': {device_id:?}"
            )));
        }

        let store = self
            .stores
            .entry(device_id.to_string())
            .or_insert_with(|| {
                Arc::new(FilePendingStore::new(
                    self.dir.join(format!("{device_id}.stash")),
                ))
            })
            .value()
            .clone();
        Ok(store)
    }

    /// Delete every stash older than `ttl`, including ones written by an
    /// earlier process.
    pub async fn reap_expired(&self, now: DateTime<Utc>, ttl: Duration) -> Result<usize, EngineError> {
        let mut device_ids = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(stash_error)? {
            let path = entry.map_err(stash_error)?.path();
            if path.extension().is_some_and(|ext| ext == "stash")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                device_ids.push(stem.to_string());
            }
        }

        let mut reaped = 0;
        for device_id in device_ids {
            let store = match self.store_for(&device_id) {
                Ok(store) => store,
                Err(e) => {
                    debug!("reaper skip {device_id}: {e}");
                    continue;
                }
            };
            match store.remove_if_expired(now, ttl).await {
                Ok(true) => {
                    info!("reaped expired stash for device {device_id}");
                    reaped += 1;
                }
                Ok(false) => {}
                Err(e) => debug!("reaper skip {device_id}: {e}"),
            }
            // drop the cached handle unless a caller still holds it
            drop(store);
            self.stores
                .remove_if(&device_id, |_, s| Arc::strong_count(s) == 1);
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::workflow::Step;
    use ulid::Ulid;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("salon_test_stash").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn pending(stashed_at: DateTime<Utc>) -> PendingGuestBooking {
        let service = ServiceSelection::Single(Service {
            id: Ulid::new(),
            name: "Colour".into(),
            duration: 90,
            professionals: vec![Ulid::new()],
        });
        let mut draft = BookingDraft::new(service, Origin::Guest);
        draft.date = chrono::NaiveDate::from_ymd_opt(2030, 3, 11);
        draft.start = Some(600);
        draft.notes = Some("fringe only".into());
        PendingGuestBooking {
            draft,
            step: Step::CustomerDetails,
            stashed_at,
        }
    }

    #[tokio::test]
    async fn put_take_survives_reopen() {
        let dir = test_dir("reopen");
        let record = pending(Utc::now());
        {
            let store = FilePendingStore::new(dir.join("d1.stash"));
            assert_eq!(store.put(record.clone()).await.unwrap(), None);
        }

        let store = FilePendingStore::new(dir.join("d1.stash"));
        assert_eq!(store.peek().await.unwrap(), Some(record.clone()));
        assert_eq!(store.take().await.unwrap(), Some(record));
        assert_eq!(store.take().await.unwrap(), None);
        assert!(!dir.join("d1.stash").exists());
    }

    #[tokio::test]
    async fn put_returns_replaced_record() {
        let dir = test_dir("replace");
        let store = FilePendingStore::new(dir.join("d1.stash"));
        let first = pending(Utc::now());
        let second = pending(Utc::now());
        store.put(first.clone()).await.unwrap();
        assert_eq!(store.put(second.clone()).await.unwrap(), Some(first));
        assert_eq!(store.peek().await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn corrupt_file_reads_as_empty() {
        let dir = test_dir("corrupt");
        let path = dir.join("d1.stash");
        let store = FilePendingStore::new(path.clone());
        store.put(pending(Utc::now())).await.unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).unwrap();
        assert_eq!(store.peek().await.unwrap(), None);

        fs::write(&path, [1u8, 2]).unwrap();
        assert_eq!(store.take().await.unwrap(), None);
    }

    #[tokio::test]
    async fn device_ids_outside_the_file_alphabet_are_rejected() {
        let dir = test_dir("device_ids");
        let stashes = StashDirectory::new(dir.clone()).unwrap();

        let store = stashes.store_for("tab-1_a").unwrap();
        assert_eq!(store.path(), dir.join("tab-1_a.stash"));
        for bad in ["../evil", "tablet.1", "a b", ""] {
            assert!(
                matches!(stashes.store_for(bad), Err(EngineError::Format(_))),
                "{bad:?} accepted"
            );
        }

        let long = "x".repeat(MAX_DEVICE_ID_LEN + 1);
        assert!(matches!(
            stashes.store_for(&long),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[tokio::test]
    async fn same_device_shares_store() {
        let stashes = StashDirectory::new(test_dir("shared")).unwrap();
        let a = stashes.store_for("phone").unwrap();
        let b = stashes.store_for("phone").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn distinct_device_ids_never_share_a_store() {
        let dir = test_dir("distinct");
        let stashes = StashDirectory::new(dir.clone()).unwrap();
        let ids = ["tablet1", "tablet-1", "tablet_1", "tablet11"];
        let stores: Vec<_> = ids.iter().map(|id| stashes.store_for(id).unwrap()).collect();
        for (i, a) in stores.iter().enumerate() {
            for b in &stores[i + 1..] {
                assert!(!Arc::ptr_eq(a, b));
                assert_ne!(a.path(), b.path());
            }
        }

        stores[0].put(pending(Utc::now())).await.unwrap();
        assert!(stores[1].peek().await.unwrap().is_none());
        assert!(stashes.store_for("tablet.1").is_err());
    }

    #[tokio::test]
    async fn reap_removes_only_expired() {
        let dir = test_dir("reap");
        let stashes = StashDirectory::new(dir.clone()).unwrap();
        let ttl = Duration::from_secs(3600);
        let now = Utc::now();

        stashes
            .store_for("old")
            .unwrap()
            .put(pending(now - chrono::Duration::hours(2)))
            .await
            .unwrap();
        stashes
            .store_for("fresh")
            .unwrap()
            .put(pending(now))
            .await
            .unwrap();
        // left behind by an earlier process
        FilePendingStore::new(dir.join("orphan.stash"))
            .put(pending(now - chrono::Duration::days(3)))
            .await
            .unwrap();

        assert_eq!(stashes.reap_expired(now, ttl).await.unwrap(), 2);
        assert!(!dir.join("old.stash").exists());
        assert!(!dir.join("orphan.stash").exists());
        assert!(dir.join("fresh.stash").exists());
    }
}
