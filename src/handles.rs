//! Bounded cache of open container handles
//!
//! Handles are keyed by writer index (serial file-sets) or iteration id
//! (shared parallel files). When the cache is full the least recently used
//! handle is flushed and closed.

use crate::attribute::Attribute;
use crate::container::Container;
use crate::dims::Dimensions;
use crate::error::{DcError, Result};
use crate::fileset::{
    FileSet, ATTR_COMPRESSION, ATTR_FORMAT_VERSION, ATTR_MPI_POSITION, ATTR_MPI_SIZE,
    ATTR_SOFTWARE_VERSION,
};
use crate::io::IOManager;
use crate::metadata::FormatVersion;
use futures::future::join_all;
use lru::LruCache;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

/// Handle bound used when the configuration asks for 0
pub const DEFAULT_MAX_FILE_HANDLES: usize = 64;

/// How cache keys map to file names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileNaming {
    /// Key is a writer index in the topology
    Writer,
    /// Key is an iteration id
    Iteration,
}

/// Whether handles are opened for reading or created for writing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleMode {
    Read,
    /// Truncate on first open, reopen read-write afterwards
    Create,
    /// Open read-write, creating missing files
    Write,
}

/// Root attributes stamped on every file this cache creates
#[derive(Debug, Clone, Copy)]
pub struct RootStamp {
    pub topology: Dimensions,
    /// Fixed position, or `None` to derive it from the writer key
    pub position: Option<Dimensions>,
    pub compression: bool,
}

impl RootStamp {
    pub fn apply(&self, container: &mut Container, position: Dimensions) -> Result<()> {
        container.set_attribute("/", ATTR_MPI_SIZE, Attribute::dims_u32(self.topology))?;
        container.set_attribute("/", ATTR_MPI_POSITION, Attribute::dims_u32(position))?;
        container.set_attribute(
            "/",
            ATTR_SOFTWARE_VERSION,
            Attribute::string(crate::DCOLLECT_VERSION),
        )?;
        container.set_attribute(
            "/",
            ATTR_FORMAT_VERSION,
            Attribute::string(&FormatVersion::CURRENT.to_string()),
        )?;
        container.set_attribute("/", ATTR_COMPRESSION, Attribute::scalar(self.compression as u8))
    }
}

pub struct HandleMgr {
    io: Arc<dyn IOManager>,
    fileset: FileSet,
    naming: FileNaming,
    mode: HandleMode,
    stamp: RootStamp,
    cache: LruCache<i64, Container>,
    created: HashSet<i64>,
}

impl HandleMgr {
    pub fn new(
        io: Arc<dyn IOManager>,
        fileset: FileSet,
        naming: FileNaming,
        mode: HandleMode,
        stamp: RootStamp,
        max_handles: usize,
    ) -> Self {
        let bound = NonZeroUsize::new(max_handles)
            .or_else(|| NonZeroUsize::new(DEFAULT_MAX_FILE_HANDLES))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            io,
            fileset,
            naming,
            mode,
            stamp,
            cache: LruCache::new(bound),
            created: HashSet::new(),
        }
    }

    pub fn io(&self) -> &Arc<dyn IOManager> {
        &self.io
    }

    pub fn fileset(&self) -> &FileSet {
        &self.fileset
    }

    pub fn mode(&self) -> HandleMode {
        self.mode
    }

    pub fn topology(&self) -> Dimensions {
        self.stamp.topology
    }

    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// File name for a cache key
    pub fn file_name(&self, key: i64) -> String {
        match self.naming {
            FileNaming::Writer => self
                .fileset
                .writer_file(self.stamp.topology.index_to_position(key as u64)),
            FileNaming::Iteration => self.fileset.iteration_file(key as i32),
        }
    }

    fn position_of(&self, key: i64) -> Dimensions {
        match (self.stamp.position, self.naming) {
            (Some(position), _) => position,
            (None, FileNaming::Writer) => self.stamp.topology.index_to_position(key as u64),
            (None, FileNaming::Iteration) => Dimensions::ZERO,
        }
    }

    /// Cached handle for `key` without opening it or refreshing its recency
    pub fn peek(&mut self, key: i64) -> Option<&mut Container> {
        self.cache.peek_mut(&key)
    }

    pub fn contains(&self, key: i64) -> bool {
        self.cache.contains(&key)
    }

    /// Pop the least recently used handle if inserting `key` would overflow
    pub fn evict_for(&mut self, key: i64) -> Option<(i64, Container)> {
        if self.cache.contains(&key) || self.cache.len() < self.cache.cap().get() {
            return None;
        }
        self.cache.pop_lru()
    }

    /// Insert an opened handle and return it
    pub fn insert(&mut self, key: i64, container: Container) -> Result<&mut Container> {
        self.cache.put(key, container);
        self.cache
            .get_mut(&key)
            .ok_or_else(|| DcError::NotFound(format!("Handle {}", key)))
    }

    /// Open the file for `key` with this cache's mode, stamping new files
    pub async fn open_file(&mut self, key: i64) -> Result<Container> {
        let name = self.file_name(key);
        let io = self.io.as_ref();
        let create = match self.mode {
            HandleMode::Read => false,
            HandleMode::Create => !self.created.contains(&key),
            HandleMode::Write => !self.created.contains(&key) && !io.exists(&name).await?,
        };
        if create {
            let mut container = Container::create(io, &name).await?;
            self.stamp.apply(&mut container, self.position_of(key))?;
            self.created.insert(key);
            Ok(container)
        } else {
            Container::open(io, &name, self.mode != HandleMode::Read).await
        }
    }

    /// Handle for `key`, opening it (and evicting the LRU handle) if needed
    pub async fn get(&mut self, key: i64) -> Result<&mut Container> {
        if !self.cache.contains(&key) {
            if let Some((evicted, container)) = self.evict_for(key) {
                debug!(key = evicted, "evicting file handle");
                container.close().await?;
            }
            let container = self.open_file(key).await?;
            self.cache.put(key, container);
        }
        self.cache
            .get_mut(&key)
            .ok_or_else(|| DcError::NotFound(format!("Handle {}", key)))
    }

    /// Remove a handle from the cache without closing it
    pub fn take(&mut self, key: i64) -> Option<Container> {
        self.cache.pop(&key)
    }

    /// Drop a handle whose file is gone; a later open creates it afresh
    pub fn forget(&mut self, key: i64) -> Option<Container> {
        self.created.remove(&key);
        self.cache.pop(&key)
    }

    /// Keys of all cached handles, ascending
    pub fn keys(&self) -> Vec<i64> {
        let mut keys: Vec<i64> = self.cache.iter().map(|(k, _)| *k).collect();
        keys.sort_unstable();
        keys
    }

    /// Close every cached handle
    pub async fn close_all(&mut self) -> Result<()> {
        let mut containers = Vec::with_capacity(self.cache.len());
        while let Some((_, container)) = self.cache.pop_lru() {
            containers.push(container.close());
        }
        join_all(containers)
            .await
            .into_iter()
            .find(Result::is_err)
            .unwrap_or(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FileSystemIOManager;
    use tempfile::TempDir;

    fn manager(dir: &std::path::Path, mode: HandleMode, max: usize) -> HandleMgr {
        let io: Arc<dyn IOManager> = Arc::new(FileSystemIOManager::new(dir));
        let fileset = FileSet::parse(dir.join("run")).unwrap();
        let stamp = RootStamp {
            topology: Dimensions::new(3, 1, 1),
            position: None,
            compression: false,
        };
        HandleMgr::new(io, fileset, FileNaming::Writer, mode, stamp, max)
    }

    #[tokio::test]
    async fn test_lru_eviction_flushes() {
        let temp_dir = TempDir::new().unwrap();
        let mut handles = manager(temp_dir.path(), HandleMode::Create, 2);
        for key in 0..3 {
            handles.get(key).await.unwrap().create_group("/1").unwrap();
        }
        assert_eq!(handles.len(), 2);
        assert!(!handles.contains(0));

        // key 0 was closed on eviction and reopens read-write, not truncated
        assert!(handles.get(0).await.unwrap().exists("/1"));
        handles.close_all().await.unwrap();

        let mut reader = manager(temp_dir.path(), HandleMode::Read, 0);
        assert_eq!(reader.capacity(), DEFAULT_MAX_FILE_HANDLES);
        let container = reader.get(2).await.unwrap();
        assert_eq!(
            container.attribute("/", ATTR_MPI_POSITION).unwrap().as_dims().unwrap(),
            Dimensions::new(2, 0, 0)
        );
        assert!(!container.is_writable());
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut handles = manager(temp_dir.path(), HandleMode::Read, 4);
        assert!(handles.get(0).await.is_err());
    }
}
