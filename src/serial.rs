//! Serial collector: every writer owns one container of the file-set
//!
//! A writer at position `p` of topology `T` writes `<base>_<px>_<py>_<pz>.dcol`.
//! Readers either open one of these files or, in merged mode, all of them;
//! merged reads stitch the per-writer pieces into one logical dataset.

use crate::attribute::Attribute;
use crate::catalog::{
    dataset_group_path, dataset_path, iteration_path, merge_entries, merged_shape, validate_name,
    Catalog, DcEntry,
};
use crate::collector::{place_into, DataCollector};
use crate::compression::FilterPipeline;
use crate::config::{FileAccessType, FileCreationAttr};
use crate::container::{Container, DatasetInfo, DatasetSpec};
use crate::dims::{copy_hyperslab, Dimensions, Hyperslab, Selection};
use crate::error::{DcError, Result};
use crate::fileset::{FileSet, RESERVED_ROOT_ATTRIBUTES};
use crate::handles::{FileNaming, HandleMgr, HandleMode, RootStamp};
use crate::io::{create_io_manager, IOManager};
use crate::types::DataType;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use FileAccessType::{Create, Read, ReadMerged, Write};

const ANY: &[FileAccessType] = &[Create, Read, ReadMerged, Write];
const WRITING: &[FileAccessType] = &[Create, Write];
const READING: &[FileAccessType] = &[Read, ReadMerged, Write];

struct Session {
    access: FileAccessType,
    handles: HandleMgr,
    catalogs: HashMap<i64, Catalog>,
    /// Handle key of this writer's own file
    own_key: i64,
    filters: FilterPipeline,
}

impl Session {
    fn is_merged(&self) -> bool {
        self.access == ReadMerged
    }

    /// Keys of every file this session reads
    fn keys(&self) -> Vec<i64> {
        if self.is_merged() {
            (0..self.handles.topology().scalar_size() as i64).collect()
        } else {
            vec![self.own_key]
        }
    }

    /// Key of the file at a writer position; only merged sessions may pick one
    fn key_at(&self, position: Option<Dimensions>) -> Result<i64> {
        if !self.is_merged() {
            return Ok(self.own_key);
        }
        let topology = self.handles.topology();
        let position = position.unwrap_or(Dimensions::ZERO);
        if (0..3).any(|i| position.get(i) >= topology.get(i)) {
            return Err(DcError::InvalidArgument(format!(
                "Position {} lies outside topology {}",
                position, topology
            )));
        }
        Ok(topology.position_to_index(&position) as i64)
    }

    async fn own(&mut self) -> Result<&mut Container> {
        self.handles.get(self.own_key).await
    }

    async fn ids(&mut self, key: i64) -> Result<Vec<i32>> {
        let container = self.handles.get(key).await?;
        Ok(self.catalogs.entry(key).or_default().ids(container)?.to_vec())
    }

    /// Entries of iteration `id` in one file, `None` if the file lacks it
    async fn entries(&mut self, key: i64, id: i32) -> Result<Option<Vec<DcEntry>>> {
        let container = self.handles.get(key).await?;
        let catalog = self.catalogs.entry(key).or_default();
        if !catalog.ids(container)?.contains(&id) {
            return Ok(None);
        }
        Ok(Some(catalog.entries(container, id)?.to_vec()))
    }

    /// Files holding dataset `name` at `id`, in topology order
    async fn dataset_infos(&mut self, id: i32, name: &str) -> Result<Vec<(i64, DatasetInfo)>> {
        let path = dataset_path(id, name);
        let mut found = Vec::new();
        for key in self.keys() {
            let container = self.handles.get(key).await?;
            if container.exists(&path) {
                found.push((key, container.dataset_info(&path)?));
            }
        }
        Ok(found)
    }

    fn invalidate(&mut self, key: i64, id: i32) {
        if let Some(catalog) = self.catalogs.get_mut(&key) {
            catalog.invalidate_id(id);
        }
    }
}

/// Combined type and shape of a dataset spread over several writers
fn merged_info(topology: Dimensions, pieces: &[(i64, DatasetInfo)], id: i32, name: &str) -> Result<DatasetInfo> {
    let (_, first) = pieces
        .first()
        .ok_or_else(|| DcError::NotFound(format!("Dataset {} at iteration {}", name, id)))?;
    if let Some((_, other)) = pieces
        .iter()
        .find(|(_, p)| p.data_type != first.data_type || p.rank != first.rank)
    {
        return Err(DcError::InconsistentFileset(format!(
            "{} is {} rank {} in one file and {} rank {} in another",
            name, first.data_type, first.rank, other.data_type, other.rank
        )));
    }
    let sizes: Vec<Dimensions> = pieces.iter().map(|(_, p)| p.size).collect();
    Ok(DatasetInfo {
        data_type: first.data_type,
        rank: first.rank,
        size: merged_shape(first.rank, topology, &sizes)?,
    })
}

/// Append `count` packed records to an extensible 1-D dataset, creating it first
async fn append_records(
    container: &mut Container,
    path: &str,
    data_type: DataType,
    count: u64,
    data: &[u8],
    filters: FilterPipeline,
) -> Result<()> {
    let size = Dimensions::new(count, 1, 1);
    if !container.exists(path) {
        let spec = DatasetSpec::new(data_type, 1, size)
            .extensible()
            .with_filters(filters);
        container.create_dataset(path, &spec).await?;
        return container.write_region(path, Dimensions::ZERO, size, data).await;
    }
    let existing = container.dataset_info(path)?.data_type;
    if existing != data_type {
        return Err(DcError::TypeMismatch(format!(
            "{} holds {}, cannot append {}",
            path, existing, data_type
        )));
    }
    let old = container.extend(path, count)?;
    container
        .write_region(path, Dimensions::new(old, 0, 0), size, data)
        .await
}

pub(crate) fn check_rank(rank: u32) -> Result<()> {
    if (1..=3).contains(&rank) {
        Ok(())
    } else {
        Err(DcError::InvalidArgument(format!(
            "Rank must be 1, 2 or 3, got {}",
            rank
        )))
    }
}

pub(crate) fn scope_path(scope: Option<i32>) -> String {
    scope.map_or_else(|| "/".to_string(), iteration_path)
}

/// Collector for file-sets with one container per writer
#[derive(Default)]
pub struct SerialDataCollector {
    session: Option<Session>,
}

impl SerialDataCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn access_type(&self) -> Option<FileAccessType> {
        self.session.as_ref().map(|s| s.access)
    }

    /// Writer topology of the open file-set
    pub fn mpi_size(&self) -> Option<Dimensions> {
        self.session.as_ref().map(|s| s.handles.topology())
    }

    fn session(&mut self, op: &str, allowed: &[FileAccessType]) -> Result<&mut Session> {
        match self.session.as_mut() {
            Some(session) if allowed.contains(&session.access) => Ok(session),
            Some(session) => Err(DcError::NotPermitted(format!(
                "{} is not permitted in {:?} mode",
                op, session.access
            ))),
            None => Err(DcError::NotPermitted(format!("{} needs an open collector", op))),
        }
    }

    /// This writer's file, for callers layering annotations on top of writes
    pub(crate) async fn own_container(&mut self, op: &str) -> Result<&mut Container> {
        self.session(op, WRITING)?.own().await
    }

    /// Handle keys of every file a read visits, in topology order
    pub(crate) fn read_keys(&mut self, op: &str) -> Result<Vec<i64>> {
        Ok(self.session(op, READING)?.keys())
    }

    pub(crate) fn read_key_at(&mut self, op: &str, position: Option<Dimensions>) -> Result<i64> {
        self.session(op, READING)?.key_at(position)
    }

    pub(crate) async fn container(&mut self, key: i64) -> Result<&mut Container> {
        self.session("read", ANY)?.handles.get(key).await
    }

    pub(crate) fn invalidate(&mut self, id: i32) {
        if let Some(session) = self.session.as_mut() {
            let key = session.own_key;
            session.invalidate(key, id);
        }
    }

    /// Append `count` records to a 1-D dataset, creating it on first use
    pub async fn append(
        &mut self,
        id: i32,
        data_type: DataType,
        count: u64,
        name: &str,
        buf: &[u8],
    ) -> Result<()> {
        self.append_strided(id, data_type, count, 0, 1, name, buf)
            .await
    }

    /// Append every `stride`-th record of `buf`, starting at `offset`
    #[allow(clippy::too_many_arguments)]
    pub async fn append_strided(
        &mut self,
        id: i32,
        data_type: DataType,
        count: u64,
        offset: u64,
        stride: u64,
        name: &str,
        buf: &[u8],
    ) -> Result<()> {
        validate_name(name)?;
        let session = self.session("append", WRITING)?;
        if stride == 0 {
            return Err(DcError::InvalidArgument("Append stride must be at least 1".to_string()));
        }
        if count == 0 {
            return Ok(());
        }
        let sel = Selection::new(Dimensions::new(offset + (count - 1) * stride + 1, 1, 1))
            .with_size(Dimensions::new(count, 1, 1))
            .with_offset(Dimensions::new(offset, 0, 0))
            .with_stride(Dimensions::new(stride, 1, 1));
        let packed = sel.gather(buf, data_type.size_in_bytes())?;
        let (key, filters) = (session.own_key, session.filters);
        let container = session.own().await?;
        append_records(container, &dataset_path(id, name), data_type, count, &packed, filters).await?;
        session.invalidate(key, id);
        Ok(())
    }

    /// Alias a hyperslab of `src_name`; `count`, `offset` and `stride` select
    /// the region of the source
    #[allow(clippy::too_many_arguments)]
    pub async fn create_region_reference(
        &mut self,
        src_id: i32,
        src_name: &str,
        dst_id: i32,
        dst_name: &str,
        count: Dimensions,
        offset: Dimensions,
        stride: Dimensions,
    ) -> Result<()> {
        self.reference(src_id, src_name, dst_id, dst_name, Some((offset, count, stride)))
            .await
    }

    async fn reference(
        &mut self,
        src_id: i32,
        src_name: &str,
        dst_id: i32,
        dst_name: &str,
        region: Option<(Dimensions, Dimensions, Dimensions)>,
    ) -> Result<()> {
        validate_name(dst_name)?;
        if src_id == dst_id && src_name == dst_name {
            return Err(DcError::InvalidArgument(format!(
                "{} cannot reference itself",
                src_name
            )));
        }
        let session = self.session("create_reference", WRITING)?;
        let key = session.own_key;
        session.own().await?.create_reference(
            &dataset_path(dst_id, dst_name),
            &dataset_path(src_id, src_name),
            region,
        )?;
        session.invalidate(key, dst_id);
        Ok(())
    }

    /// Read a dataset attribute from the writer at `position` (merged mode)
    pub async fn read_attribute_at(
        &mut self,
        id: i32,
        name: &str,
        attr_name: &str,
        position: Option<Dimensions>,
    ) -> Result<Attribute> {
        let session = self.session("read_attribute", READING)?;
        let key = session.key_at(position)?;
        let container = session.handles.get(key).await?;
        Ok(container.attribute(&dataset_path(id, name), attr_name)?.clone())
    }

    /// Read a root or iteration attribute from the writer at `position` (merged mode)
    pub async fn read_global_attribute_at(
        &mut self,
        scope: Option<i32>,
        name: &str,
        position: Option<Dimensions>,
    ) -> Result<Attribute> {
        let session = self.session("read_global_attribute", READING)?;
        let key = session.key_at(position)?;
        let container = session.handles.get(key).await?;
        Ok(container.attribute(&scope_path(scope), name)?.clone())
    }
}

#[async_trait]
impl DataCollector for SerialDataCollector {
    async fn open(&mut self, path: &Path, attr: FileCreationAttr) -> Result<()> {
        if self.session.is_some() {
            return Err(DcError::NotPermitted("The collector is already open".to_string()));
        }
        attr.validate()?;
        let fileset = FileSet::parse(path)?;
        let io: Arc<dyn IOManager> = Arc::from(create_io_manager(&fileset.dir().to_string_lossy())?);

        let access = attr.file_acc_type;
        if !access.is_read() && fileset.is_single() && attr.num_writers() > 1 {
            return Err(DcError::InvalidArgument(format!(
                "{} names a single file but topology {} has several writers",
                path.display(),
                attr.mpi_size
            )));
        }
        let (topology, mode) = match access {
            Create => (attr.mpi_size, HandleMode::Create),
            Write => (attr.mpi_size, HandleMode::Write),
            Read => (attr.mpi_size, HandleMode::Read),
            ReadMerged => (fileset.discover_topology(io.as_ref()).await?, HandleMode::Read),
        };
        if topology.any_zero() {
            return Err(DcError::InvalidFormat(format!(
                "{} records an empty topology {}",
                path.display(),
                topology
            )));
        }
        let own_key = match access {
            ReadMerged => 0,
            _ => topology.position_to_index(&attr.mpi_position) as i64,
        };
        let stamp = RootStamp {
            topology,
            position: (access != ReadMerged).then_some(attr.mpi_position),
            compression: attr.enable_compression,
        };
        let filters = if attr.enable_compression {
            FilterPipeline::with_method(attr.compression)
        } else {
            FilterPipeline::none()
        };

        let mut handles = HandleMgr::new(io, fileset, FileNaming::Writer, mode, stamp, attr.max_file_handles);
        handles.get(own_key).await?;
        info!(path = %path.display(), ?access, %topology, "opened serial collector");

        self.session = Some(Session {
            access,
            handles,
            catalogs: HashMap::new(),
            own_key,
            filters,
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut session) = self.session.take() {
            session.handles.close_all().await?;
            debug!(access = ?session.access, "closed serial collector");
        }
        Ok(())
    }

    async fn max_id(&mut self) -> Result<i32> {
        Ok(self.entry_ids().await?.last().copied().unwrap_or(0))
    }

    async fn entry_ids(&mut self) -> Result<Vec<i32>> {
        let session = self.session("entry_ids", ANY)?;
        let mut ids = BTreeSet::new();
        for key in session.keys() {
            ids.extend(session.ids(key).await?);
        }
        Ok(ids.into_iter().collect())
    }

    async fn entries_for_id(&mut self, id: i32) -> Result<Vec<DcEntry>> {
        let session = self.session("entries_for_id", ANY)?;
        let mut per_file = Vec::new();
        for key in session.keys() {
            if let Some(entries) = session.entries(key, id).await? {
                per_file.push(entries);
            }
        }
        if per_file.is_empty() {
            return Err(DcError::NotFound(format!("Iteration {}", id)));
        }
        if !session.is_merged() {
            return Ok(per_file.swap_remove(0));
        }
        merge_entries(session.handles.topology(), &per_file)
    }

    async fn read_info(&mut self, id: i32, name: &str) -> Result<DatasetInfo> {
        let session = self.session("read", READING)?;
        let pieces = session.dataset_infos(id, name).await?;
        if session.is_merged() {
            return merged_info(session.handles.topology(), &pieces, id, name);
        }
        pieces
            .first()
            .map(|(_, info)| *info)
            .ok_or_else(|| DcError::NotFound(format!("Dataset {} at iteration {}", name, id)))
    }

    async fn read(&mut self, id: i32, name: &str) -> Result<(DatasetInfo, Vec<u8>)> {
        let session = self.session("read", READING)?;
        let path = dataset_path(id, name);
        if !session.is_merged() {
            return session.own().await?.read_all(&path).await;
        }

        let topology = session.handles.topology();
        let pieces = session.dataset_infos(id, name).await?;
        let info = merged_info(topology, &pieces, id, name)?;
        let elem = info.data_type.size_in_bytes();
        let shape = info.size.to_physical(info.rank);
        let mut out = vec![0u8; info.byte_len()];
        let mut cursor = 0u64;
        for (key, piece) in pieces {
            let origin = if info.rank == 1 {
                let origin = Dimensions::new(cursor, 0, 0);
                cursor += piece.size.x();
                origin
            } else {
                topology.index_to_position(key as u64) * piece.size
            };
            let (_, bytes) = session.handles.get(key).await?.read_all(&path).await?;
            let count = piece.size.to_physical(info.rank);
            copy_hyperslab(
                &bytes,
                &count,
                &Hyperslab::dense(vec![0; count.len()], count.clone()),
                &mut out,
                &shape,
                &Hyperslab::dense(origin.to_physical(info.rank), count.clone()),
                elem,
            )?;
        }
        Ok((info, out))
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
        validate_name(name)?;
        check_rank(rank)?;
        sel.size.check_rank(rank, "Selection size")?;
        let session = self.session("write", WRITING)?;
        let packed = sel.gather(buf, data_type.size_in_bytes())?;
        let (key, filters) = (session.own_key, session.filters);
        let path = dataset_path(id, name);

        let container = session.own().await?;
        let spec = DatasetSpec::new(data_type, rank, sel.size).with_filters(filters);
        container.create_dataset(&path, &spec).await?;
        if sel.size.scalar_size() > 0 {
            container
                .write_region(&path, Dimensions::ZERO, sel.size, &packed)
                .await?;
        }
        session.invalidate(key, id);
        Ok(())
    }

    async fn remove(&mut self, id: i32) -> Result<()> {
        let session = self.session("remove", &[Write])?;
        let key = session.own_key;
        session.own().await?.remove(&iteration_path(id))?;
        session.invalidate(key, id);
        Ok(())
    }

    async fn remove_dataset(&mut self, id: i32, name: &str) -> Result<()> {
        let session = self.session("remove", &[Write])?;
        let key = session.own_key;
        let path = dataset_path(id, name);
        let group = dataset_group_path(id, name);
        let container = session.own().await?;
        if !container.exists(&path) {
            return Err(DcError::NotFound(format!("Dataset {} at iteration {}", name, id)));
        }
        container.remove(&path)?;
        if container.children(&group)?.is_empty() {
            container.remove(&group)?;
        }
        session.invalidate(key, id);
        Ok(())
    }

    async fn create_reference(
        &mut self,
        src_id: i32,
        src_name: &str,
        dst_id: i32,
        dst_name: &str,
    ) -> Result<()> {
        self.reference(src_id, src_name, dst_id, dst_name, None).await
    }

    async fn write_attribute(
        &mut self,
        id: i32,
        name: &str,
        attr_name: &str,
        value: Attribute,
    ) -> Result<()> {
        if attr_name.is_empty() {
            return Err(DcError::InvalidArgument("Attribute name is empty".to_string()));
        }
        let container = self.own_container("write_attribute").await?;
        let path = dataset_path(id, name);
        if !container.exists(&path) {
            return Err(DcError::NotFound(format!("Dataset {} at iteration {}", name, id)));
        }
        container.set_attribute(&path, attr_name, value)
    }

    async fn read_attribute(&mut self, id: i32, name: &str, attr_name: &str) -> Result<Attribute> {
        self.read_attribute_at(id, name, attr_name, None).await
    }

    async fn write_global_attribute(
        &mut self,
        scope: Option<i32>,
        name: &str,
        value: Attribute,
    ) -> Result<()> {
        if name.is_empty() || (scope.is_none() && RESERVED_ROOT_ATTRIBUTES.contains(&name)) {
            return Err(DcError::InvalidArgument(format!(
                "'{}' cannot be used as a global attribute name",
                name
            )));
        }
        let session = self.session("write_global_attribute", WRITING)?;
        let key = session.own_key;
        let path = scope_path(scope);
        let container = session.own().await?;
        container.create_group(&path)?;
        container.set_attribute(&path, name, value)?;
        if let Some(id) = scope {
            session.invalidate(key, id);
        }
        Ok(())
    }

    async fn read_global_attribute(&mut self, scope: Option<i32>, name: &str) -> Result<Attribute> {
        self.read_global_attribute_at(scope, name, None).await
    }
}
