//! Append-only file store implementation.
//!
//! Layout: one `vb_NNNN.data` record log per partition plus a
//! `vb_NNNN.state.json` sidecar for the persisted state blob, all under a
//! directory guarded by an exclusive `emberdb.lock`.
//!
//! Record log format (all integers big-endian):
//!
//! ```text
//! +-----------------------------+
//! | magic (8) | version (4) | reserved (4) |   file header, 16 bytes
//! +-----------------------------+
//! | len (4) | crc32c (4) | payload (len)   |   repeated records
//! +-----------------------------+
//! ```
//!
//! The payload is a bincode-encoded document. A torn tail (short read or
//! checksum mismatch on the final record) is tolerated at replay and the
//! log is truncated there. Point lookups and scans are served from a
//! resident [`MemoryKVStore`] index rebuilt at open.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::errinval;
use crate::error::Result;
use crate::flock::FileLock;
use crate::item::{DocKey, Vbid};
use crate::vbstate::VBucketState;

use super::{KVStore, MemoryKVStore, PersistedDoc};

const MAGIC: &[u8; 8] = b"EMBERKV\x00";
const VERSION: u32 = 1;
const HEADER_SIZE: usize = 16;
const LOCK_FILE: &str = "emberdb.lock";

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub struct FileKVStore {
    dir: PathBuf,
    _lock: FileLock,
    index: MemoryKVStore,
    writers: Mutex<HashMap<Vbid, BufWriter<File>>>,
    bytes_written: AtomicU64,
}

impl FileKVStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let lock = FileLock::lock(dir.join(LOCK_FILE))?;

        let store = Self {
            dir,
            _lock: lock,
            index: MemoryKVStore::new(),
            writers: Mutex::new(HashMap::new()),
            bytes_written: AtomicU64::new(0),
        };
        store.replay_all()?;
        Ok(store)
    }

    fn data_path(&self, vbid: Vbid) -> PathBuf {
        self.dir.join(format!("vb_{:04}.data", vbid.0))
    }

    fn state_path(&self, vbid: Vbid) -> PathBuf {
        self.dir.join(format!("vb_{:04}.state.json", vbid.0))
    }

    fn replay_all(&self) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(id) = name
                .strip_prefix("vb_")
                .and_then(|rest| rest.strip_suffix(".data"))
                .and_then(|id| id.parse::<u16>().ok())
            {
                self.replay_data_file(Vbid(id), &path)?;
            } else if let Some(id) = name
                .strip_prefix("vb_")
                .and_then(|rest| rest.strip_suffix(".state.json"))
                .and_then(|id| id.parse::<u16>().ok())
            {
                let bytes = fs::read(&path)?;
                let state: VBucketState = serde_json::from_slice(&bytes)?;
                self.index.snapshot_vb_state(Vbid(id), &state)?;
            }
        }
        Ok(())
    }

    fn replay_data_file(&self, vbid: Vbid, path: &Path) -> Result<()> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header).map_err(|_| {
            errinval!("truncated header in {}", path.display())
        })?;
        if &header[..8] != MAGIC {
            return Err(errinval!("bad magic in {}", path.display()));
        }
        let version = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        if version != VERSION {
            return Err(errinval!(
                "unsupported data file version {version} in {}",
                path.display()
            ));
        }

        let mut records = 0usize;
        loop {
            let len = match reader.read_u32::<BigEndian>() {
                Ok(len) => len,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            let Ok(crc) = reader.read_u32::<BigEndian>() else {
                tracing::warn!(vbid = %vbid, "torn record header at replay, truncating");
                break;
            };
            let mut payload = vec![0u8; len as usize];
            if reader.read_exact(&mut payload).is_err() {
                tracing::warn!(vbid = %vbid, "torn record payload at replay, truncating");
                break;
            }
            if CASTAGNOLI.checksum(&payload) != crc {
                tracing::warn!(vbid = %vbid, "checksum mismatch at replay, truncating");
                break;
            }
            let doc: PersistedDoc = bincode::deserialize(&payload)?;
            if doc.deleted {
                self.index.del(vbid, doc)?;
            } else {
                self.index.set(vbid, doc)?;
            }
            records += 1;
        }
        tracing::debug!(vbid = %vbid, records, "replayed data file");
        Ok(())
    }

    fn append(&self, vbid: Vbid, doc: &PersistedDoc) -> Result<()> {
        let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        let writer = match writers.entry(vbid) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(self.open_writer(vbid)?)
            }
        };
        let payload = bincode::serialize(doc)?;
        writer.write_u32::<BigEndian>(payload.len() as u32)?;
        writer.write_u32::<BigEndian>(CASTAGNOLI.checksum(&payload))?;
        writer.write_all(&payload)?;
        self.bytes_written
            .fetch_add(8 + payload.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn open_writer(&self, vbid: Vbid) -> Result<BufWriter<File>> {
        let path = self.data_path(vbid);
        let fresh = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        if fresh {
            writer.write_all(MAGIC)?;
            writer.write_u32::<BigEndian>(VERSION)?;
            writer.write_u32::<BigEndian>(0)?; // reserved
        }
        Ok(writer)
    }

    /// Rewrites a partition's log from the resident index. Used after
    /// rewind and compaction, which both shrink history.
    fn rewrite_data_file(&self, vbid: Vbid) -> Result<()> {
        let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        writers.remove(&vbid);

        let tmp_path = self.dir.join(format!("vb_{:04}.data.tmp", vbid.0));
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(MAGIC)?;
            writer.write_u32::<BigEndian>(VERSION)?;
            writer.write_u32::<BigEndian>(0)?;
            for doc in self.index.scan_seqnos(vbid, 0, u64::MAX)? {
                let payload = bincode::serialize(&doc)?;
                writer.write_u32::<BigEndian>(payload.len() as u32)?;
                writer.write_u32::<BigEndian>(CASTAGNOLI.checksum(&payload))?;
                writer.write_all(&payload)?;
            }
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        fs::rename(&tmp_path, self.data_path(vbid))?;
        Ok(())
    }
}

impl KVStore for FileKVStore {
    fn set(&self, vbid: Vbid, doc: PersistedDoc) -> Result<()> {
        self.append(vbid, &doc)?;
        self.index.set(vbid, doc)
    }

    fn del(&self, vbid: Vbid, doc: PersistedDoc) -> Result<()> {
        self.append(vbid, &doc)?;
        self.index.del(vbid, doc)
    }

    fn get(&self, vbid: Vbid, key: &DocKey) -> Result<Option<PersistedDoc>> {
        self.index.get(vbid, key)
    }

    fn get_multi(
        &self,
        vbid: Vbid,
        keys: &[DocKey],
    ) -> Result<Vec<(DocKey, Option<PersistedDoc>)>> {
        self.index.get_multi(vbid, keys)
    }

    fn scan_seqnos(&self, vbid: Vbid, start: u64, end: u64) -> Result<Vec<PersistedDoc>> {
        self.index.scan_seqnos(vbid, start, end)
    }

    fn high_seqno(&self, vbid: Vbid) -> u64 {
        self.index.high_seqno(vbid)
    }

    fn item_count(&self, vbid: Vbid) -> usize {
        self.index.item_count(vbid)
    }

    fn snapshot_vb_state(&self, vbid: Vbid, state: &VBucketState) -> Result<()> {
        let path = self.state_path(vbid);
        let tmp = self.dir.join(format!("vb_{:04}.state.json.tmp", vbid.0));
        fs::write(&tmp, serde_json::to_vec(state)?)?;
        fs::rename(&tmp, &path)?;
        self.index.snapshot_vb_state(vbid, state)
    }

    fn load_vb_state(&self, vbid: Vbid) -> Result<Option<VBucketState>> {
        self.index.load_vb_state(vbid)
    }

    fn list_persisted_vbuckets(&self) -> Result<Vec<Vbid>> {
        self.index.list_persisted_vbuckets()
    }

    fn rewind(&self, vbid: Vbid, target: u64) -> Result<u64> {
        let reached = self.index.rewind(vbid, target)?;
        self.rewrite_data_file(vbid)?;
        Ok(reached)
    }

    fn delete_vbucket(&self, vbid: Vbid) -> Result<()> {
        self.writers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&vbid);
        for path in [self.data_path(vbid), self.state_path(vbid)] {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        self.index.delete_vbucket(vbid)
    }

    fn compact(&self, vbid: Vbid, purge_before: u64) -> Result<(usize, u64)> {
        let (purged, highest) = self.index.compact(vbid, purge_before)?;
        if purged > 0 {
            self.rewrite_data_file(vbid)?;
        }
        Ok((purged, highest))
    }

    fn get_stat(&self, name: &str) -> Option<u64> {
        match name {
            "bytes_written" => Some(self.bytes_written.load(Ordering::Relaxed)),
            other => self.index.get_stat(other),
        }
    }

    fn sync(&self) -> Result<()> {
        let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        for writer in writers.values_mut() {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}

impl Drop for FileKVStore {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            tracing::warn!(error = %e, "final sync failed on close");
        }
    }
}
