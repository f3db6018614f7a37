//! Parallel collector: the ranks of a process group share one container per iteration
//!
//! Iteration `id` lives in `<base>_<id>.dcol`. Rank 0 creates each file and
//! owns its index. Every rank applies the same metadata changes to its own
//! copy of the index and writes its slab straight into preallocated chunk
//! slots, so the slabs of one collective write never pass through rank 0.
//!
//! In the writing modes every call that may open a file is collective.
//! [`ParallelDataCollector::append`] is the only independent write.

use crate::attribute::Attribute;
use crate::catalog::{check_tiling, dataset_group_path, dataset_path, iteration_path, validate_name, Catalog, DcEntry};
use crate::collector::{place_into, DataCollector};
use crate::comm::Communicator;
use crate::config::{FileAccessType, FileCreationAttr};
use crate::container::{Container, DatasetInfo, DatasetSpec};
use crate::dims::{Dimensions, Selection};
use crate::error::{DcError, Result};
use crate::fileset::{FileSet, RESERVED_ROOT_ATTRIBUTES};
use crate::handles::{FileNaming, HandleMgr, HandleMode, RootStamp};
use crate::io::{create_io_manager, IOManager};
use crate::serial::check_rank;
use crate::types::DataType;
use crate::utils::calculate_checksum;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use FileAccessType::{Create, Read, ReadMerged, Write};

const ANY: &[FileAccessType] = &[Create, Read, ReadMerged, Write];
const WRITING: &[FileAccessType] = &[Create, Write];
const READING: &[FileAccessType] = &[Read, ReadMerged, Write];

/// One rank's contribution to a size exchange
#[derive(Debug, Serialize, Deserialize)]
struct Header {
    digest: u32,
    size: Dimensions,
    valid: bool,
}

/// CRC-32 over the arguments all ranks must agree on
pub(crate) fn digest<T: Serialize + ?Sized>(args: &T) -> u32 {
    bincode::serialize(args)
        .map(|bytes| calculate_checksum(&bytes))
        .unwrap_or_default()
}

/// All-gather every rank's local size, checking that all ranks made the same call
///
/// `valid` is false on a rank that rejected its own arguments; that rank
/// reports its own error, the others a collective inconsistency.
pub(crate) async fn exchange(
    comm: &dyn Communicator,
    op: &str,
    digest: u32,
    size: Dimensions,
    valid: bool,
) -> Result<Vec<Dimensions>> {
    let header = bincode::serialize(&Header { digest, size, valid })?;
    let headers = comm
        .all_gather(header)
        .await?
        .iter()
        .map(|bytes| bincode::deserialize::<Header>(bytes).map_err(DcError::from))
        .collect::<Result<Vec<_>>>()?;
    if let Some(rank) = headers.iter().position(|h| !h.valid) {
        return Err(DcError::CollectiveInconsistency(format!(
            "{} was rejected by rank {}",
            op, rank
        )));
    }
    if let Some(rank) = headers.iter().position(|h| h.digest != digest) {
        return Err(DcError::CollectiveInconsistency(format!(
            "Rank {} called {} with other arguments than rank {}",
            rank,
            op,
            comm.rank()
        )));
    }
    Ok(headers.into_iter().map(|h| h.size).collect())
}

/// Global shape and per-rank offsets of slabs laid out by the topology
///
/// Rank-1 slabs are concatenated in rank order. Higher ranks are placed
/// along each axis after the slabs of the ranks before them on that axis.
pub(crate) fn auto_layout(
    rank: u32,
    topology: Dimensions,
    sizes: &[Dimensions],
) -> Result<(Dimensions, Vec<Dimensions>)> {
    if rank == 1 {
        let mut offsets = Vec::with_capacity(sizes.len());
        let mut cursor = 0;
        for size in sizes {
            offsets.push(Dimensions::new(cursor, 0, 0));
            cursor += size.x();
        }
        return Ok((Dimensions::new(cursor, 1, 1), offsets));
    }

    check_tiling(rank, topology)?;
    let positions: Vec<Dimensions> = (0..sizes.len() as u64)
        .map(|r| topology.index_to_position(r))
        .collect();
    let on_line = |axis: usize, p: &Dimensions, anchor: &Dimensions| {
        (0..3).filter(|&j| j != axis).all(|j| p.get(j) == anchor.get(j))
    };
    let mut global = Dimensions::ONE;
    for axis in 0..rank as usize {
        let extent = sizes
            .iter()
            .zip(&positions)
            .filter(|(_, p)| on_line(axis, p, &Dimensions::ZERO))
            .map(|(s, _)| s.get(axis))
            .sum();
        global.set(axis, extent);
    }
    let mut offsets = Vec::with_capacity(sizes.len());
    for (size, me) in sizes.iter().zip(&positions) {
        let mut offset = Dimensions::ZERO;
        for axis in 0..rank as usize {
            let before = sizes
                .iter()
                .zip(&positions)
                .filter(|(_, p)| on_line(axis, p, me) && p.get(axis) < me.get(axis))
                .map(|(s, _)| s.get(axis))
                .sum();
            offset.set(axis, before);
        }
        if !(offset + *size).all_le(&global) {
            return Err(DcError::CollectiveInconsistency(format!(
                "Slab {} at {} does not fit the assembled shape {}",
                size, offset, global
            )));
        }
        offsets.push(offset);
    }
    Ok((global, offsets))
}

pub(crate) struct ParallelSession {
    access: FileAccessType,
    handles: HandleMgr,
    catalogs: HashMap<i64, Catalog>,
    position: Dimensions,
}

impl ParallelSession {
    fn invalidate(&mut self, id: i32) {
        if let Some(catalog) = self.catalogs.get_mut(&(id as i64)) {
            catalog.invalidate_id(id);
        }
    }
}

/// Handle for the file of iteration `id`, opening it collectively if needed
async fn handle<'a>(comm: &dyn Communicator, handles: &'a mut HandleMgr, id: i32) -> Result<&'a mut Container> {
    let key = id as i64;
    if handles.contains(key) {
        return handles.get(key).await;
    }
    let mut failure = None;
    if let Some((evicted, container)) = handles.evict_for(key) {
        debug!(id = evicted, "evicting iteration file");
        if let Err(err) = container.close().await {
            failure = Some(err);
        }
    }
    if handles.mode() == HandleMode::Read {
        if let Some(err) = failure {
            return Err(err);
        }
        let container = handles.open_file(key).await?;
        return handles.insert(key, container);
    }

    // evicted indexes are persisted before anyone reopens a file
    comm.barrier().await?;
    let mut own = None;
    let status: std::result::Result<u64, String> = if comm.rank() == 0 {
        let opened = match handles.open_file(key).await {
            Ok(mut container) => container.flush().await.map(|_| container),
            Err(err) => Err(err),
        };
        let status = opened
            .as_ref()
            .map(Container::next_offset)
            .map_err(ToString::to_string);
        own = Some(opened);
        status
    } else {
        Ok(0)
    };
    let status = comm.broadcast(0, bincode::serialize(&status)?).await?;
    let status: std::result::Result<u64, String> = bincode::deserialize(&status)?;

    let opened = match own {
        Some(opened) => opened,
        None => match status {
            Ok(next_offset) => open_shared(handles, key, next_offset).await,
            Err(msg) => Err(DcError::CollectiveInconsistency(format!(
                "Rank 0 could not open {}: {}",
                handles.file_name(key),
                msg
            ))),
        },
    };
    // the owner may resize the file only after every rank has read its index
    comm.barrier().await?;
    if let Some(err) = failure {
        return Err(err);
    }
    handles.insert(key, opened?)
}

/// Open a file created by rank 0 without taking over its index
async fn open_shared(handles: &HandleMgr, key: i64, next_offset: u64) -> Result<Container> {
    let mut container = Container::open(handles.io().as_ref(), &handles.file_name(key), true).await?;
    container.set_owns_index(false);
    container.set_next_offset(next_offset);
    Ok(container)
}

/// Like [`handle`], but fails with not-found instead of creating the file
async fn existing_handle<'a>(
    comm: &dyn Communicator,
    handles: &'a mut HandleMgr,
    id: i32,
) -> Result<&'a mut Container> {
    let key = id as i64;
    if !handles.contains(key) && !handles.io().exists(&handles.file_name(key)).await? {
        return Err(DcError::NotFound(format!("Iteration {}", id)));
    }
    handle(comm, handles, id).await
}

/// Flush and release every file of the session collectively
async fn close_files(comm: &dyn Communicator, handles: &mut HandleMgr) -> Result<()> {
    let mut first_error = None;
    let mut containers: Vec<Container> = handles
        .keys()
        .into_iter()
        .filter_map(|key| handles.take(key))
        .collect();
    for container in containers.iter_mut() {
        if let Err(err) = container.sync().await {
            first_error.get_or_insert(err);
        }
    }
    comm.barrier().await?;
    for container in containers {
        if let Err(err) = container.close().await {
            first_error.get_or_insert(err);
        }
    }
    comm.barrier().await?;
    first_error.map_or(Ok(()), Err)
}

/// Collector whose ranks write one shared file per iteration
pub struct ParallelDataCollector {
    comm: Arc<dyn Communicator>,
    session: Option<ParallelSession>,
    finalized: bool,
}

impl ParallelDataCollector {
    pub fn new(comm: Arc<dyn Communicator>) -> Self {
        Self {
            comm,
            session: None,
            finalized: false,
        }
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn access_type(&self) -> Option<FileAccessType> {
        self.session.as_ref().map(|s| s.access)
    }

    /// This rank's slot in the writer topology
    pub fn position(&self) -> Option<Dimensions> {
        self.session.as_ref().map(|s| s.position)
    }

    pub fn mpi_size(&self) -> Option<Dimensions> {
        self.session.as_ref().map(|s| s.handles.topology())
    }

    pub(crate) fn comm(&self) -> Arc<dyn Communicator> {
        Arc::clone(&self.comm)
    }

    fn check_live(&self, op: &str) -> Result<()> {
        if self.finalized {
            Err(DcError::Unsupported(format!("{} after finalize", op)))
        } else {
            Ok(())
        }
    }

    pub(crate) fn session(&mut self, op: &str, allowed: &[FileAccessType]) -> Result<&mut ParallelSession> {
        self.check_live(op)?;
        match self.session.as_mut() {
            Some(session) if allowed.contains(&session.access) => Ok(session),
            Some(session) => Err(DcError::NotPermitted(format!(
                "{} is not permitted in {:?} mode",
                op, session.access
            ))),
            None => Err(DcError::NotPermitted(format!("{} needs an open collector", op))),
        }
    }

    /// Collectively open the file of `id` for a metadata change
    pub(crate) async fn writable_container(&mut self, op: &str, id: i32) -> Result<&mut Container> {
        let comm = self.comm();
        let session = self.session(op, WRITING)?;
        handle(comm.as_ref(), &mut session.handles, id).await
    }

    pub(crate) async fn readable_container(&mut self, op: &str, id: i32) -> Result<&mut Container> {
        let comm = self.comm();
        let session = self.session(op, READING)?;
        existing_handle(comm.as_ref(), &mut session.handles, id).await
    }

    pub(crate) fn invalidate(&mut self, id: i32) {
        if let Some(session) = self.session.as_mut() {
            session.invalidate(id);
        }
    }

    /// Collectively create a preallocated dataset in the file of `id`
    async fn create_shared(
        &mut self,
        op: &str,
        id: i32,
        data_type: DataType,
        rank: u32,
        global_size: Dimensions,
        name: &str,
    ) -> Result<()> {
        let comm = self.comm();
        let container = self.writable_container(op, id).await?;
        let spec = DatasetSpec::new(data_type, rank, global_size).preallocated();
        container.create_dataset(&dataset_path(id, name), &spec).await?;
        // the owner may resize the file; nobody writes slots before that
        comm.barrier().await?;
        self.invalidate(id);
        Ok(())
    }

    async fn write_slab(
        &mut self,
        id: i32,
        name: &str,
        offset: Dimensions,
        size: Dimensions,
        data: &[u8],
    ) -> Result<()> {
        // every rank touches the handle so all caches keep one recency order
        let container = self.writable_container("write", id).await?;
        if size.scalar_size() == 0 {
            return Ok(());
        }
        container
            .write_region(&dataset_path(id, name), offset, size, data)
            .await
    }

    /// Collectively write a dataset of `global_size`; each rank places its
    /// selection at its own `global_offset`
    #[allow(clippy::too_many_arguments)]
    pub async fn write_global(
        &mut self,
        id: i32,
        data_type: DataType,
        rank: u32,
        global_size: Dimensions,
        global_offset: Dimensions,
        sel: &Selection,
        name: &str,
        buf: &[u8],
    ) -> Result<()> {
        let comm = self.comm();
        self.session("write", WRITING)?;
        let prepared = validate_name(name)
            .and_then(|_| check_rank(rank))
            .and_then(|_| sel.size.check_rank(rank, "Selection size"))
            .and_then(|_| global_size.check_rank(rank, "Global size"))
            .and_then(|_| fits(global_offset, sel.size, global_size))
            .and_then(|_| sel.gather(buf, data_type.size_in_bytes()));
        let digest = digest(&("write", id, name, data_type, rank, global_size));
        let exchanged = exchange(comm.as_ref(), "write", digest, sel.size, prepared.is_ok()).await;
        let packed = prepared?;
        exchanged?;

        self.create_shared("write", id, data_type, rank, global_size, name)
            .await?;
        self.write_slab(id, name, global_offset, sel.size, &packed).await
    }

    /// Collectively write a dataset assembled from every rank's selection
    ///
    /// Returns the global shape and this rank's offset in it.
    pub async fn write_auto(
        &mut self,
        id: i32,
        data_type: DataType,
        rank: u32,
        sel: &Selection,
        name: &str,
        buf: &[u8],
    ) -> Result<(Dimensions, Dimensions)> {
        let comm = self.comm();
        let topology = self.session("write", WRITING)?.handles.topology();
        let prepared = validate_name(name)
            .and_then(|_| check_rank(rank))
            .and_then(|_| sel.size.check_rank(rank, "Selection size"))
            .and_then(|_| sel.gather(buf, data_type.size_in_bytes()));
        let digest = digest(&("write", id, name, data_type, rank));
        let exchanged = exchange(comm.as_ref(), "write", digest, sel.size, prepared.is_ok()).await;
        let packed = prepared?;
        let sizes = exchanged?;
        let (global_size, offsets) = auto_layout(rank, topology, &sizes)?;
        let offset = offsets[comm.rank()];

        self.create_shared("write", id, data_type, rank, global_size, name)
            .await?;
        self.write_slab(id, name, offset, sel.size, &packed).await?;
        Ok((global_size, offset))
    }

    /// Collectively declare a dataset to be filled by [`Self::append`]
    pub async fn reserve(
        &mut self,
        id: i32,
        global_size: Dimensions,
        rank: u32,
        data_type: DataType,
        name: &str,
    ) -> Result<()> {
        let comm = self.comm();
        self.session("reserve", WRITING)?;
        let checked = validate_name(name)
            .and_then(|_| check_rank(rank))
            .and_then(|_| global_size.check_rank(rank, "Global size"));
        let digest = digest(&("reserve", id, name, data_type, rank, global_size));
        let exchanged = exchange(comm.as_ref(), "reserve", digest, global_size, checked.is_ok()).await;
        checked?;
        exchanged?;
        self.create_shared("reserve", id, data_type, rank, global_size, name)
            .await
    }

    /// Collectively declare a dataset sized by every rank's `local_size`
    ///
    /// Returns the global shape and this rank's offset in it.
    pub async fn reserve_auto(
        &mut self,
        id: i32,
        local_size: Dimensions,
        rank: u32,
        data_type: DataType,
        name: &str,
    ) -> Result<(Dimensions, Dimensions)> {
        let comm = self.comm();
        let topology = self.session("reserve", WRITING)?.handles.topology();
        let checked = validate_name(name)
            .and_then(|_| check_rank(rank))
            .and_then(|_| local_size.check_rank(rank, "Local size"));
        let digest = digest(&("reserve", id, name, data_type, rank));
        let exchanged = exchange(comm.as_ref(), "reserve", digest, local_size, checked.is_ok()).await;
        checked?;
        let sizes = exchanged?;
        let (global_size, offsets) = auto_layout(rank, topology, &sizes)?;
        self.create_shared("reserve", id, data_type, rank, global_size, name)
            .await?;
        Ok((global_size, offsets[comm.rank()]))
    }

    /// Write a slab into a dataset reserved earlier in this session
    ///
    /// Independent of the other ranks; the iteration's file must still be open.
    pub async fn append(
        &mut self,
        id: i32,
        size: Dimensions,
        rank: u32,
        global_offset: Dimensions,
        name: &str,
        buf: &[u8],
    ) -> Result<()> {
        check_rank(rank)?;
        size.check_rank(rank, "Append size")?;
        let session = self.session("append", WRITING)?;
        let container = session.handles.peek(id as i64).ok_or_else(|| {
            DcError::NotFound(format!("Iteration {} has no open reserved datasets", id))
        })?;
        let path = dataset_path(id, name);
        let info = container.dataset_info(&path)?;
        if info.rank != rank {
            return Err(DcError::InvalidArgument(format!(
                "{} has rank {}, append used rank {}",
                name, info.rank, rank
            )));
        }
        let len = size.scalar_size() as usize * info.data_type.size_in_bytes();
        if buf.len() < len {
            return Err(DcError::ShapeMismatch(format!(
                "Append of {} needs {} bytes, got {}",
                size,
                len,
                buf.len()
            )));
        }
        if len == 0 {
            return Ok(());
        }
        container.write_region(&path, global_offset, size, &buf[..len]).await
    }

    /// Region references need per-process file access and are not available here
    #[allow(clippy::too_many_arguments)]
    pub async fn create_region_reference(
        &mut self,
        _src_id: i32,
        _src_name: &str,
        _dst_id: i32,
        _dst_name: &str,
        _count: Dimensions,
        _offset: Dimensions,
        _stride: Dimensions,
    ) -> Result<()> {
        self.check_live("create_region_reference")?;
        Err(DcError::Unsupported(
            "Region references are not available in parallel files".to_string(),
        ))
    }

    /// Collectively set an attribute on the root group of the file of `id`
    pub async fn write_file_attribute(&mut self, id: i32, name: &str, value: Attribute) -> Result<()> {
        let comm = self.comm();
        self.session("write_file_attribute", WRITING)?;
        let valid = !name.is_empty() && !RESERVED_ROOT_ATTRIBUTES.contains(&name);
        let digest = digest(&("write_file_attribute", id, name, &value));
        let exchanged = exchange(comm.as_ref(), "write_file_attribute", digest, Dimensions::ONE, valid).await;
        if !valid {
            return Err(DcError::InvalidArgument(format!(
                "'{}' cannot be used as a file attribute name",
                name
            )));
        }
        exchanged?;
        self.writable_container("write_file_attribute", id)
            .await?
            .set_attribute("/", name, value)
    }

    pub async fn read_file_attribute(&mut self, id: i32, name: &str) -> Result<Attribute> {
        let container = self.readable_container("read_file_attribute", id).await?;
        Ok(container.attribute("/", name)?.clone())
    }

    /// Close all files and release the process group; every later call fails
    pub async fn finalize(&mut self) -> Result<()> {
        self.check_live("finalize")?;
        let closed = self.close().await;
        self.finalized = true;
        debug!(rank = self.comm.rank(), "finalized parallel collector");
        closed
    }

    /// Collective metadata change guarded by a consistency exchange
    async fn collective<T: Serialize + ?Sized>(&mut self, op: &str, args: &T, valid: Result<()>) -> Result<()> {
        let comm = self.comm();
        self.session(op, WRITING)?;
        let exchanged = exchange(comm.as_ref(), op, digest(args), Dimensions::ONE, valid.is_ok()).await;
        valid?;
        exchanged.map(|_| ())
    }
}

fn fits(offset: Dimensions, size: Dimensions, global: Dimensions) -> Result<()> {
    if (offset + size).all_le(&global) {
        Ok(())
    } else {
        Err(DcError::InvalidArgument(format!(
            "Slab {} at {} exceeds global size {}",
            size, offset, global
        )))
    }
}

#[async_trait]
impl DataCollector for ParallelDataCollector {
    async fn open(&mut self, path: &Path, attr: FileCreationAttr) -> Result<()> {
        self.check_live("open")?;
        if self.session.is_some() {
            return Err(DcError::NotPermitted("The collector is already open".to_string()));
        }
        attr.validate()?;
        if attr.num_writers() != self.comm.size() as u64 {
            return Err(DcError::InvalidArgument(format!(
                "Topology {} does not match a group of {} ranks",
                attr.mpi_size,
                self.comm.size()
            )));
        }
        let fileset = FileSet::parse(path)?;
        if fileset.is_single() {
            return Err(DcError::InvalidArgument(format!(
                "{} names a single file; parallel collectors need a base name",
                path.display()
            )));
        }
        let io: Arc<dyn IOManager> = Arc::from(create_io_manager(&fileset.dir().to_string_lossy())?);
        if attr.enable_compression {
            warn!("compression is ignored by the parallel collector");
        }

        let access = attr.file_acc_type;
        let mode = match access {
            Create => HandleMode::Create,
            Write => HandleMode::Write,
            Read | ReadMerged => HandleMode::Read,
        };
        let topology = attr.mpi_size;
        let stamp = RootStamp {
            topology,
            position: None,
            compression: false,
        };
        let handles = HandleMgr::new(io, fileset, FileNaming::Iteration, mode, stamp, attr.max_file_handles);
        let position = topology.index_to_position(self.comm.rank() as u64);
        info!(path = %path.display(), ?access, %topology, rank = self.comm.rank(), "opened parallel collector");

        self.session = Some(ParallelSession {
            access,
            handles,
            catalogs: HashMap::new(),
            position,
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.check_live("close")?;
        let comm = self.comm();
        if let Some(mut session) = self.session.take() {
            close_files(comm.as_ref(), &mut session.handles).await?;
            debug!(rank = comm.rank(), access = ?session.access, "closed parallel collector");
        }
        Ok(())
    }

    async fn max_id(&mut self) -> Result<i32> {
        Ok(self.entry_ids().await?.last().copied().unwrap_or(0))
    }

    async fn entry_ids(&mut self) -> Result<Vec<i32>> {
        let handles = &self.session("entry_ids", ANY)?.handles;
        handles.fileset().iteration_ids(handles.io().as_ref()).await
    }

    async fn entries_for_id(&mut self, id: i32) -> Result<Vec<DcEntry>> {
        let comm = self.comm();
        let session = self.session("entries_for_id", READING)?;
        let container = existing_handle(comm.as_ref(), &mut session.handles, id).await?;
        Ok(session
            .catalogs
            .entry(id as i64)
            .or_default()
            .entries(container, id)?
            .to_vec())
    }

    async fn read_info(&mut self, id: i32, name: &str) -> Result<DatasetInfo> {
        let container = self.readable_container("read", id).await?;
        let path = dataset_path(id, name);
        if !container.exists(&path) {
            return Err(DcError::NotFound(format!("Dataset {} at iteration {}", name, id)));
        }
        container.dataset_info(&path)
    }

    async fn read(&mut self, id: i32, name: &str) -> Result<(DatasetInfo, Vec<u8>)> {
        let container = self.readable_container("read", id).await?;
        let path = dataset_path(id, name);
        if !container.exists(&path) {
            return Err(DcError::NotFound(format!("Dataset {} at iteration {}", name, id)));
        }
        container.read_all(&path).await
    }

    async fn read_into(
        &mut self,
        id: i32,
        name: &str,
        dst_size: Dimensions,
        dst_offset: Dimensions,
        buf: &mut [u8],
    ) -> Result<DatasetInfo> {
        let (info, bytes) = self.read(id, name).await?;
        place_into(&info, &bytes, dst_size, dst_offset, buf)?;
        Ok(info)
    }

    async fn write(
        &mut self,
        id: i32,
        data_type: DataType,
        rank: u32,
        sel: &Selection,
        name: &str,
        buf: &[u8],
    ) -> Result<()> {
        self.write_auto(id, data_type, rank, sel, name, buf).await.map(|_| ())
    }

    async fn remove(&mut self, id: i32) -> Result<()> {
        let comm = self.comm();
        let session = self.session("remove", &[Write])?;
        let key = id as i64;
        let name = session.handles.file_name(key);
        if !session.handles.contains(key) && !session.handles.io().exists(&name).await? {
            return Err(DcError::NotFound(format!("Iteration {}", id)));
        }
        session.handles.forget(key);
        session.catalogs.remove(&key);
        comm.barrier().await?;
        let status: std::result::Result<(), String> = if comm.rank() == 0 {
            session.handles.io().delete(&name).await.map_err(|e| e.to_string())
        } else {
            Ok(())
        };
        let status = comm.broadcast(0, bincode::serialize(&status)?).await?;
        let status: std::result::Result<(), String> = bincode::deserialize(&status)?;
        status.map_err(|msg| DcError::Io(std::io::Error::other(msg)))?;
        debug!(id, "removed iteration file");
        Ok(())
    }

    async fn remove_dataset(&mut self, id: i32, name: &str) -> Result<()> {
        let comm = self.comm();
        let session = self.session("remove", &[Write])?;
        let container = existing_handle(comm.as_ref(), &mut session.handles, id).await?;
        let path = dataset_path(id, name);
        if !container.exists(&path) {
            return Err(DcError::NotFound(format!("Dataset {} at iteration {}", name, id)));
        }
        container.remove(&path)?;
        let group = dataset_group_path(id, name);
        if container.children(&group)?.is_empty() {
            container.remove(&group)?;
        }
        session.invalidate(id);
        Ok(())
    }

    async fn create_reference(
        &mut self,
        src_id: i32,
        src_name: &str,
        dst_id: i32,
        dst_name: &str,
    ) -> Result<()> {
        let valid = validate_name(dst_name).and_then(|_| {
            if src_id != dst_id {
                Err(DcError::Unsupported(format!(
                    "Iterations {} and {} live in different files",
                    src_id, dst_id
                )))
            } else if src_name == dst_name {
                Err(DcError::InvalidArgument(format!("{} cannot reference itself", src_name)))
            } else {
                Ok(())
            }
        });
        self.collective("create_reference", &(src_id, src_name, dst_id, dst_name), valid)
            .await?;
        self.writable_container("create_reference", dst_id)
            .await?
            .create_reference(&dataset_path(dst_id, dst_name), &dataset_path(src_id, src_name), None)?;
        self.invalidate(dst_id);
        Ok(())
    }

    async fn write_attribute(
        &mut self,
        id: i32,
        name: &str,
        attr_name: &str,
        value: Attribute,
    ) -> Result<()> {
        let valid = if attr_name.is_empty() {
            Err(DcError::InvalidArgument("Attribute name is empty".to_string()))
        } else {
            Ok(())
        };
        self.collective("write_attribute", &(id, name, attr_name, &value), valid)
            .await?;
        let container = self.writable_container("write_attribute", id).await?;
        let path = dataset_path(id, name);
        if !container.exists(&path) {
            return Err(DcError::NotFound(format!("Dataset {} at iteration {}", name, id)));
        }
        container.set_attribute(&path, attr_name, value)
    }

    async fn read_attribute(&mut self, id: i32, name: &str, attr_name: &str) -> Result<Attribute> {
        let container = self.readable_container("read_attribute", id).await?;
        Ok(container.attribute(&dataset_path(id, name), attr_name)?.clone())
    }

    /// Iteration attributes only; use [`ParallelDataCollector::write_file_attribute`]
    /// for a file root
    async fn write_global_attribute(
        &mut self,
        scope: Option<i32>,
        name: &str,
        value: Attribute,
    ) -> Result<()> {
        self.check_live("write_global_attribute")?;
        let Some(id) = scope else {
            return Err(DcError::Unsupported(
                "Parallel file-sets have no shared root; name an iteration".to_string(),
            ));
        };
        let valid = if name.is_empty() {
            Err(DcError::InvalidArgument("Attribute name is empty".to_string()))
        } else {
            Ok(())
        };
        self.collective("write_global_attribute", &(id, name, &value), valid)
            .await?;
        let container = self.writable_container("write_global_attribute", id).await?;
        let path = iteration_path(id);
        container.create_group(&path)?;
        container.set_attribute(&path, name, value)?;
        self.invalidate(id);
        Ok(())
    }

    async fn read_global_attribute(&mut self, scope: Option<i32>, name: &str) -> Result<Attribute> {
        self.check_live("read_global_attribute")?;
        let Some(id) = scope else {
            return Err(DcError::Unsupported(
                "Parallel file-sets have no shared root; name an iteration".to_string(),
            ));
        };
        let container = self.readable_container("read_global_attribute", id).await?;
        Ok(container.attribute(&iteration_path(id), name)?.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_auto_layout_rank1() {
        let sizes = [
            Dimensions::new(3, 1, 1),
            Dimensions::new(0, 1, 1),
            Dimensions::new(5, 1, 1),
        ];
        let (global, offsets) = auto_layout(1, Dimensions::new(3, 1, 1), &sizes).unwrap();
        assert_eq!(global, Dimensions::new(8, 1, 1));
        assert_eq!(offsets[1], Dimensions::new(3, 0, 0));
        assert_eq!(offsets[2], Dimensions::new(3, 0, 0));
    }

    #[test]
    fn test_auto_layout_grid() {
        let topology = Dimensions::new(2, 2, 1);
        let sizes = [
            Dimensions::new(4, 3, 1),
            Dimensions::new(2, 3, 1),
            Dimensions::new(4, 5, 1),
            Dimensions::new(2, 5, 1),
        ];
        let (global, offsets) = auto_layout(2, topology, &sizes).unwrap();
        assert_eq!(global, Dimensions::new(6, 8, 1));
        assert_eq!(
            offsets,
            vec![
                Dimensions::new(0, 0, 0),
                Dimensions::new(4, 0, 0),
                Dimensions::new(0, 3, 0),
                Dimensions::new(4, 3, 0),
            ]
        );
    }

    #[test]
    fn test_auto_layout_rejects_3d_topology_for_2d_data() {
        let sizes = vec![Dimensions::new(2, 2, 1); 8];
        let err = auto_layout(2, Dimensions::new(2, 2, 2), &sizes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TopologyMismatch);
    }

    #[test]
    fn test_auto_layout_rejects_ragged_tiles() {
        let sizes = [Dimensions::new(4, 3, 1), Dimensions::new(2, 4, 1)];
        let err = auto_layout(2, Dimensions::new(2, 1, 1), &sizes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CollectiveInconsistency);
    }

    #[test]
    fn test_digest_separates_names() {
        assert_ne!(digest(&("write", 1, "a")), digest(&("write", 1, "b")));
        assert_eq!(digest(&("write", 1, "a")), digest(&("write", 1, "a")));
    }
}
