//! Directory-backed shard store
//!
//! Layout of a shard directory:
//!
//! ```text
//! <shard>/
//!   _0.cfs, _1.cfs, ...          data files (write-once)
//!   segments_<generation>        latest commit point
//!   recovery.<uuid>.<name>       staged incoming data (replica side)
//! ```
//!
//! The commit point is `[bincode(SegmentsCopyInfo)][crc32:4]`, written to a
//! temporary name and renamed into place. Data files are deleted only when
//! they are neither part of the latest commit nor pinned by an outstanding
//! [`SnapshotRef`].

use super::snapshot::{
    SegmentsCopyInfo, SnapshotDeleter, SnapshotListener, SnapshotRef, StoreFileMetadata,
};
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Prefix of commit point files
pub const COMMIT_PREFIX: &str = "segments_";

/// Prefix of staged (not yet published) files
pub const TEMP_PREFIX: &str = "recovery.";

const CHECKSUM_BUF_SIZE: usize = 64 * 1024;

#[derive(Default)]
struct StoreInner {
    latest: Option<Arc<SegmentsCopyInfo>>,
    refs: HashMap<String, usize>,
    pending_deletes: HashSet<String>,
    metadata_cache: HashMap<String, StoreFileMetadata>,
}

/// On-disk store of one shard
pub struct ShardStore {
    dir: PathBuf,
    inner: Mutex<StoreInner>,
    listener: RwLock<Option<Arc<dyn SnapshotListener>>>,
    weak_self: Weak<ShardStore>,
}

impl ShardStore {
    /// Open (or create) the store at `dir`
    ///
    /// Leftover staged files from an interrupted transfer are discarded and
    /// the highest-generation commit point is loaded.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut commits = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(TEMP_PREFIX) {
                tracing::debug!("Removing stale staged file {:?}", entry.path());
                std::fs::remove_file(entry.path())?;
            } else if let Some(generation) = parse_generation(&name) {
                commits.push(generation);
            }
        }
        commits.sort_unstable();

        let mut inner = StoreInner::default();
        if let Some(&generation) = commits.last() {
            let info = read_commit_point(&dir.join(commit_file_name(generation)))?;
            for file in &info.files {
                inner
                    .metadata_cache
                    .insert(file.name.clone(), file.clone());
            }
            tracing::info!(
                "Opened shard store {:?} at version {} (generation {}, {} files)",
                dir,
                info.version,
                info.generation,
                info.files.len()
            );
            inner.latest = Some(Arc::new(info));
            for &old in &commits[..commits.len() - 1] {
                let _ = std::fs::remove_file(dir.join(commit_file_name(old)));
            }
        }

        Ok(Arc::new_cyclic(|weak_self| Self {
            dir,
            inner: Mutex::new(inner),
            listener: RwLock::new(None),
            weak_self: weak_self.clone(),
        }))
    }

    /// Shard directory
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Register the listener notified after every new commit
    pub fn set_listener(&self, listener: Arc<dyn SnapshotListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Remove the snapshot listener
    pub fn clear_listener(&self) {
        *self.listener.write() = None;
    }

    /// Latest commit, if any
    pub fn latest_commit(&self) -> Option<Arc<SegmentsCopyInfo>> {
        self.inner.lock().latest.clone()
    }

    /// Version of the latest commit (0 before the first commit)
    pub fn version(&self) -> u64 {
        self.inner
            .lock()
            .latest
            .as_ref()
            .map(|c| c.version)
            .unwrap_or(0)
    }

    /// Names of the files of the latest commit
    pub fn committed_file_names(&self) -> HashSet<String> {
        self.inner
            .lock()
            .latest
            .as_ref()
            .map(|c| c.files.iter().map(|f| f.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Pin the latest commit
    pub fn acquire_latest(&self) -> Option<SnapshotRef> {
        let this: Arc<ShardStore> = self.weak_self.upgrade()?;
        let mut inner = self.inner.lock();
        let latest = inner.latest.clone()?;
        for file in &latest.files {
            *inner.refs.entry(file.name.clone()).or_insert(0) += 1;
        }
        drop(inner);
        Some(SnapshotRef::new(latest, this))
    }

    /// Outstanding snapshot references on a file
    pub fn ref_count(&self, name: &str) -> usize {
        self.inner.lock().refs.get(name).copied().unwrap_or(0)
    }

    /// Whether a data file exists on disk
    pub fn file_exists(&self, name: &str) -> bool {
        self.dir.join(name).is_file()
    }

    /// Write a new data file
    pub fn write_file(&self, name: &str, data: &[u8]) -> Result<()> {
        validate_file_name(name)?;
        let path = self.dir.join(name);
        if path.exists() {
            return Err(Error::store(format!("File {} already exists", name)));
        }
        let mut file = std::fs::File::create(&path)?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(())
    }

    /// Mark a data file for deletion
    ///
    /// The file stays on disk while the latest commit or any snapshot still
    /// references it.
    pub fn delete_file(&self, name: &str) -> Result<()> {
        validate_file_name(name)?;
        if !self.dir.join(name).is_file() {
            return Err(Error::store(format!("File {} does not exist", name)));
        }
        let mut inner = self.inner.lock();
        inner.pending_deletes.insert(name.to_string());
        self.prune_locked(&mut inner);
        Ok(())
    }

    /// Commit the current set of live data files
    ///
    /// Returns `None` when the file set is unchanged since the last commit.
    /// The registered listener receives a pinned snapshot of the new commit.
    pub fn commit(
        &self,
        primary_term: u64,
        infos_bytes: Vec<u8>,
    ) -> Result<Option<Arc<SegmentsCopyInfo>>> {
        let mut inner = self.inner.lock();

        let mut files = Vec::new();
        for name in self.list_data_files()? {
            if inner.pending_deletes.contains(&name) {
                continue;
            }
            let meta = match inner.metadata_cache.get(&name) {
                Some(meta) => meta.clone(),
                None => {
                    let meta = compute_metadata(&self.dir, &name)?;
                    inner.metadata_cache.insert(name.clone(), meta.clone());
                    meta
                }
            };
            files.push(meta);
        }

        if let Some(latest) = &inner.latest {
            if latest.files == files {
                return Ok(None);
            }
        }

        let (version, generation) = inner
            .latest
            .as_ref()
            .map(|c| (c.version + 1, c.generation + 1))
            .unwrap_or((1, 1));

        let info = Arc::new(SegmentsCopyInfo {
            version,
            generation,
            primary_term,
            infos_bytes,
            files,
        });
        self.write_commit_point(&info)?;
        if let Some(previous) = inner.latest.replace(info.clone()) {
            let _ = std::fs::remove_file(self.dir.join(commit_file_name(previous.generation)));
        }
        self.prune_locked(&mut inner);
        drop(inner);

        tracing::debug!(
            "Committed shard store {:?} version {} ({} files)",
            self.dir,
            version,
            info.files.len()
        );

        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            if let Some(snapshot) = self.acquire_latest() {
                listener.on_new_snapshot(snapshot);
            }
        }

        Ok(Some(info))
    }

    /// Read up to `len` bytes of a data file starting at `position`
    pub async fn read_chunk(&self, name: &str, position: u64, len: usize) -> Result<Bytes> {
        validate_file_name(name)?;
        let mut file = tokio::fs::File::open(self.dir.join(name)).await?;
        let file_len = file.metadata().await?.len();
        if position > file_len {
            return Err(Error::store(format!(
                "Read position {} beyond end of {} ({} bytes)",
                position, name, file_len
            )));
        }
        let n = len.min((file_len - position) as usize);
        let mut buf = vec![0u8; n];
        file.seek(std::io::SeekFrom::Start(position)).await?;
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Create an empty staging file for incoming data of `name`
    pub async fn create_temp(&self, name: &str) -> Result<String> {
        validate_file_name(name)?;
        let temp = format!("{}{}.{}", TEMP_PREFIX, uuid::Uuid::new_v4().simple(), name);
        tokio::fs::File::create(self.dir.join(&temp)).await?;
        Ok(temp)
    }

    /// Write one chunk into a staging file
    pub async fn write_temp_chunk(&self, temp: &str, position: u64, data: &[u8]) -> Result<()> {
        if !temp.starts_with(TEMP_PREFIX) || temp.contains(['/', '\\']) {
            return Err(Error::store(format!("Not a staging file: {}", temp)));
        }
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(self.dir.join(temp))
            .await?;
        file.seek(std::io::SeekFrom::Start(position)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    /// Check a completed staging file against its expected metadata
    pub async fn verify_temp(&self, temp: &str, expected: &StoreFileMetadata) -> Result<()> {
        let mut file = tokio::fs::File::open(self.dir.join(temp)).await?;
        let length = file.metadata().await?.len();
        if length != expected.length {
            return Err(Error::store(format!(
                "Length mismatch for {}: expected {}, got {}",
                expected.name, expected.length, length
            )));
        }

        let mut hasher = crc32fast::Hasher::new();
        let mut buf = vec![0u8; CHECKSUM_BUF_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let checksum = hasher.finalize();
        if checksum != expected.checksum {
            return Err(Error::store(format!(
                "Checksum mismatch for {}: expected {:x}, got {:x}",
                expected.name, expected.checksum, checksum
            )));
        }
        Ok(())
    }

    /// Make staged files visible and switch to the new commit
    ///
    /// `renames` maps final file names to staging names. Staged files are
    /// synced and renamed onto their final names, then the commit point is
    /// written, and only then are files outside the new commit pruned.
    pub fn publish(&self, renames: &HashMap<String, String>, info: SegmentsCopyInfo) -> Result<()> {
        let mut inner = self.inner.lock();

        if let Some(latest) = &inner.latest {
            if info.version <= latest.version {
                return Err(Error::store(format!(
                    "Refusing to publish version {} over version {}",
                    info.version, latest.version
                )));
            }
        }

        for (name, temp) in renames {
            validate_file_name(name)?;
            let temp_path = self.dir.join(temp);
            std::fs::File::open(&temp_path)?.sync_all()?;
            std::fs::rename(&temp_path, self.dir.join(name))?;
        }
        sync_dir(&self.dir);

        for file in &info.files {
            if !self.dir.join(&file.name).is_file() {
                return Err(Error::store(format!(
                    "Commit file {} missing after staging",
                    file.name
                )));
            }
        }

        self.write_commit_point(&info)?;
        for file in &info.files {
            inner
                .metadata_cache
                .insert(file.name.clone(), file.clone());
        }
        let info = Arc::new(info);
        if let Some(previous) = inner.latest.replace(info.clone()) {
            let _ = std::fs::remove_file(self.dir.join(commit_file_name(previous.generation)));
        }

        let keep: HashSet<&str> = info.file_names().collect();
        for name in self.list_data_files()? {
            if !keep.contains(name.as_str()) {
                inner.pending_deletes.insert(name);
            }
        }
        self.prune_locked(&mut inner);

        tracing::debug!(
            "Published version {} to {:?} ({} staged files)",
            info.version,
            self.dir,
            renames.len()
        );
        Ok(())
    }

    /// Remove staging files
    pub fn discard_temps<'a>(&self, temps: impl IntoIterator<Item = &'a String>) {
        for temp in temps {
            if let Err(e) = std::fs::remove_file(self.dir.join(temp)) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove staging file {}: {}", temp, e);
                }
            }
        }
    }

    fn list_data_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(TEMP_PREFIX) || name.starts_with(COMMIT_PREFIX) {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    fn write_commit_point(&self, info: &SegmentsCopyInfo) -> Result<()> {
        let mut buf = bincode::serialize(info)
            .map_err(|e| Error::store(format!("Commit serialization failed: {}", e)))?;
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        let temp = self
            .dir
            .join(format!("{}commit.{}", TEMP_PREFIX, uuid::Uuid::new_v4().simple()));
        {
            let mut file = std::fs::File::create(&temp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        std::fs::rename(&temp, self.dir.join(commit_file_name(info.generation)))?;
        sync_dir(&self.dir);
        Ok(())
    }

    fn prune_locked(&self, inner: &mut StoreInner) {
        let latest: HashSet<String> = inner
            .latest
            .as_ref()
            .map(|c| c.files.iter().map(|f| f.name.clone()).collect())
            .unwrap_or_default();

        let deletable: Vec<String> = inner
            .pending_deletes
            .iter()
            .filter(|name| !latest.contains(*name))
            .filter(|name| inner.refs.get(*name).copied().unwrap_or(0) == 0)
            .cloned()
            .collect();

        for name in deletable {
            match std::fs::remove_file(self.dir.join(&name)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!("Failed to delete {}: {}", name, e);
                    continue;
                }
            }
            tracing::trace!("Deleted unreferenced file {}", name);
            inner.pending_deletes.remove(&name);
            inner.metadata_cache.remove(&name);
        }
    }
}

impl SnapshotDeleter for ShardStore {
    fn dec_ref(&self, info: &SegmentsCopyInfo) {
        let mut inner = self.inner.lock();
        for file in &info.files {
            if let Some(count) = inner.refs.get_mut(&file.name) {
                *count -= 1;
                if *count == 0 {
                    inner.refs.remove(&file.name);
                }
            }
        }
        self.prune_locked(&mut inner);
    }
}

/// Reject names that could escape the shard directory or shadow store files
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.starts_with(COMMIT_PREFIX)
        || name.starts_with(TEMP_PREFIX)
    {
        return Err(Error::store(format!("Invalid file name: {:?}", name)));
    }
    Ok(())
}

fn commit_file_name(generation: u64) -> String {
    format!("{}{}", COMMIT_PREFIX, generation)
}

fn parse_generation(name: &str) -> Option<u64> {
    name.strip_prefix(COMMIT_PREFIX)?.parse().ok()
}

fn read_commit_point(path: &Path) -> Result<SegmentsCopyInfo> {
    let mut buf = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut buf)?;
    if buf.len() < 4 {
        return Err(Error::store(format!("Commit point {:?} truncated", path)));
    }
    let crc_offset = buf.len() - 4;
    let mut stored = [0u8; 4];
    stored.copy_from_slice(&buf[crc_offset..]);
    let stored = u32::from_le_bytes(stored);
    let computed = crc32fast::hash(&buf[..crc_offset]);
    if stored != computed {
        return Err(Error::store(format!(
            "Commit point {:?} CRC mismatch: expected {:x}, got {:x}",
            path, stored, computed
        )));
    }
    bincode::deserialize(&buf[..crc_offset])
        .map_err(|e| Error::store(format!("Commit point {:?} unreadable: {}", path, e)))
}

fn compute_metadata(dir: &Path, name: &str) -> Result<StoreFileMetadata> {
    let mut file = std::fs::File::open(dir.join(name))?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; CHECKSUM_BUF_SIZE];
    let mut length = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        length += n as u64;
    }
    Ok(StoreFileMetadata::new(name, length, hasher.finalize()))
}

fn sync_dir(dir: &Path) {
    // Directory fsync is unsupported on some platforms
    if let Ok(d) = std::fs::File::open(dir) {
        let _ = d.sync_all();
    }
}
