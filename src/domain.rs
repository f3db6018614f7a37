//! Domains, domain annotations and the containers returned by domain reads

use crate::attribute::Attribute;
use crate::catalog::{dataset_group_path, dataset_path};
use crate::container::Container;
use crate::dims::Dimensions;
use crate::error::{DcError, Result};
use crate::types::{DataType, Element};
use crate::utils::bytes_to_typed_data;
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;
use uuid::Uuid;

pub const ATTR_LOCAL_OFFSET: &str = "_local_domain_offset";
pub const ATTR_LOCAL_SIZE: &str = "_local_domain_size";
pub const ATTR_GLOBAL_OFFSET: &str = "_global_domain_offset";
pub const ATTR_GLOBAL_SIZE: &str = "_global_domain_size";
pub const ATTR_DATACLASS: &str = "_dataclass";

/// How a dataset relates to its domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum DataClass {
    Undefined = 0,
    /// Structured data; the dataset shape equals the domain size
    Grid = 1,
    /// Unordered 1-D record list located somewhere inside the domain
    Poly = 2,
}

impl DataClass {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(DataClass::Undefined),
            1 => Some(DataClass::Grid),
            2 => Some(DataClass::Poly),
            _ => None,
        }
    }
}

/// Half-open axis-aligned box `[offset, offset + size)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Domain {
    offset: Dimensions,
    size: Dimensions,
}

impl Domain {
    pub fn new(offset: Dimensions, size: Dimensions) -> Self {
        Self { offset, size }
    }

    pub fn offset(&self) -> Dimensions {
        self.offset
    }

    pub fn size(&self) -> Dimensions {
        self.size
    }

    /// Exclusive upper corner
    pub fn end(&self) -> Dimensions {
        self.offset + self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size.any_zero()
    }

    /// True if `other` lies completely inside this domain
    pub fn contains(&self, other: &Domain) -> bool {
        self.offset.all_le(&other.offset) && other.end().all_le(&self.end())
    }

    /// Overlap of two domains, `None` if empty
    pub fn intersect(&self, other: &Domain) -> Option<Domain> {
        let start = self.offset.max(&other.offset);
        let end = self.end().min(&other.end());
        let size = end - start;
        (!size.any_zero()).then_some(Domain::new(start, size))
    }

    pub fn intersects(&self, other: &Domain) -> bool {
        self.intersect(other).is_some()
    }

    /// Smallest domain covering both
    pub fn union_bounds(&self, other: &Domain) -> Domain {
        let start = self.offset.min(&other.offset);
        let end = self.end().max(&other.end());
        Domain::new(start, end - start)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} + {}]", self.offset, self.size)
    }
}

/// Domain attributes stored on a dataset group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainAnnotation {
    pub local: Domain,
    pub global: Domain,
    pub class: DataClass,
}

impl DomainAnnotation {
    /// Read the annotation of a dataset group, `None` if it has none
    pub fn read(container: &Container, group: &str) -> Result<Option<Self>> {
        let attributes = container.attributes(group)?;
        let Some(class) = attributes.get(ATTR_DATACLASS) else {
            return Ok(None);
        };
        let class_value = class.as_scalar::<u32>()?;
        let class = DataClass::from_u32(class_value).ok_or_else(|| {
            DcError::InvalidFormat(format!("{} has unknown data class {}", group, class_value))
        })?;
        let dims = |name: &str| -> Result<Dimensions> {
            attributes
                .get(name)
                .ok_or_else(|| DcError::InvalidFormat(format!("{} lacks {}", group, name)))?
                .as_dims()
        };
        Ok(Some(Self {
            local: Domain::new(dims(ATTR_LOCAL_OFFSET)?, dims(ATTR_LOCAL_SIZE)?),
            global: Domain::new(dims(ATTR_GLOBAL_OFFSET)?, dims(ATTR_GLOBAL_SIZE)?),
            class,
        }))
    }

    pub fn write(&self, container: &mut Container, group: &str) -> Result<()> {
        container.set_attribute(group, ATTR_LOCAL_OFFSET, Attribute::dims(self.local.offset()))?;
        container.set_attribute(group, ATTR_LOCAL_SIZE, Attribute::dims(self.local.size()))?;
        container.set_attribute(group, ATTR_GLOBAL_OFFSET, Attribute::dims(self.global.offset()))?;
        container.set_attribute(group, ATTR_GLOBAL_SIZE, Attribute::dims(self.global.size()))?;
        container.set_attribute(group, ATTR_DATACLASS, Attribute::scalar(self.class as u32))
    }
}

/// Annotation of dataset `name` at iteration `id`; not-found if it has none
pub(crate) fn stored_annotation(container: &Container, id: i32, name: &str) -> Result<DomainAnnotation> {
    DomainAnnotation::read(container, &dataset_group_path(id, name))?
        .ok_or_else(|| DcError::NotFound(format!("Domain annotation of {} at iteration {}", name, id)))
}

/// Where to find the bytes of a lazily read subdomain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LazyLoad {
    /// Handle key of the file (writer index or iteration id)
    pub file_key: i64,
    /// Identity of the file when the descriptor was made
    pub file_id: Uuid,
    pub id: i32,
    pub name: String,
    pub src_offset: Dimensions,
    pub src_size: Dimensions,
}

/// One sub-slab of a domain read
#[derive(Debug, Clone, PartialEq)]
pub struct DomainData {
    domain: Domain,
    data_type: DataType,
    elements: Dimensions,
    data: Option<Vec<u8>>,
    lazy: Option<LazyLoad>,
}

impl DomainData {
    pub fn new(domain: Domain, data_type: DataType, elements: Dimensions, data: Vec<u8>) -> Self {
        Self {
            domain,
            data_type,
            elements,
            data: Some(data),
            lazy: None,
        }
    }

    pub fn deferred(domain: Domain, data_type: DataType, elements: Dimensions, lazy: LazyLoad) -> Self {
        Self {
            domain,
            data_type,
            elements,
            data: None,
            lazy: Some(lazy),
        }
    }

    /// Box covered by this sub-slab
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Shape of the element buffer
    pub fn size(&self) -> Dimensions {
        self.elements
    }

    pub fn num_elements(&self) -> u64 {
        self.elements.scalar_size()
    }

    pub fn is_loaded(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn lazy(&self) -> Option<&LazyLoad> {
        self.lazy.as_ref()
    }

    pub(crate) fn set_data(&mut self, data: Vec<u8>) {
        self.data = Some(data);
    }

    /// Bytes of element `index`
    pub fn element(&self, index: u64) -> Option<&[u8]> {
        let elem = self.data_type.size_in_bytes();
        let start = index as usize * elem;
        self.data.as_ref()?.get(start..start + elem)
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if self.data_type != T::DATA_TYPE {
            return Err(DcError::TypeMismatch(format!(
                "Subdomain holds {}, requested {}",
                self.data_type,
                T::DATA_TYPE
            )));
        }
        let data = self
            .data
            .as_ref()
            .ok_or_else(|| DcError::InvalidArgument("Subdomain has not been loaded".to_string()))?;
        bytes_to_typed_data(data)
    }

    /// Elements as an array indexed `[z, y, x]`
    pub fn to_array<T: Element>(&self) -> Result<Array3<T>> {
        let values = self.to_vec::<T>()?;
        let shape = (
            self.elements.z() as usize,
            self.elements.y() as usize,
            self.elements.x() as usize,
        );
        Array3::from_shape_vec(shape, values).map_err(|e| DcError::ShapeMismatch(e.to_string()))
    }
}

/// Ordered collection of sub-slabs returned by a domain read
#[derive(Debug, Clone, PartialEq)]
pub struct DataContainer {
    subdomains: Vec<DomainData>,
    class: DataClass,
}

impl DataContainer {
    pub fn new(class: DataClass) -> Self {
        Self {
            subdomains: Vec::new(),
            class,
        }
    }

    pub fn class(&self) -> DataClass {
        self.class
    }

    pub fn add(&mut self, data: DomainData) {
        self.subdomains.push(data);
    }

    pub fn num_subdomains(&self) -> usize {
        self.subdomains.len()
    }

    pub fn index(&self, i: usize) -> Option<&DomainData> {
        self.subdomains.get(i)
    }

    pub fn index_mut(&mut self, i: usize) -> Option<&mut DomainData> {
        self.subdomains.get_mut(i)
    }

    /// Total elements across all subdomains
    pub fn num_elements(&self) -> u64 {
        self.subdomains.iter().map(DomainData::num_elements).sum()
    }

    /// Element `i` counted across subdomains in order
    pub fn element(&self, mut i: u64) -> Option<&[u8]> {
        for subdomain in &self.subdomains {
            let n = subdomain.num_elements();
            if i < n {
                return subdomain.element(i);
            }
            i -= n;
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = &DomainData> {
        self.subdomains.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DomainData> {
        self.subdomains.iter_mut()
    }

    /// Concatenate all loaded subdomains into one typed vector
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        let mut out = Vec::with_capacity(self.num_elements() as usize);
        for subdomain in &self.subdomains {
            out.extend(subdomain.to_vec::<T>()?);
        }
        Ok(out)
    }
}

impl IntoIterator for DataContainer {
    type Item = DomainData;
    type IntoIter = std::vec::IntoIter<DomainData>;

    fn into_iter(self) -> Self::IntoIter {
        self.subdomains.into_iter()
    }
}

/// Check the invariants of a domain write
pub(crate) fn check_domain_write(
    rank: u32,
    size: Dimensions,
    local: &Domain,
    global: &Domain,
    class: DataClass,
) -> Result<()> {
    if !global.contains(local) {
        return Err(DcError::InvalidArgument(format!(
            "Local domain {} is not inside global domain {}",
            local, global
        )));
    }
    match class {
        DataClass::Grid | DataClass::Undefined if local.size() != size => {
            Err(DcError::ShapeMismatch(format!(
                "{:?} data of size {} does not match local domain size {}",
                class,
                size,
                local.size()
            )))
        }
        DataClass::Poly if rank != 1 => Err(DcError::InvalidArgument(format!(
            "Poly data must have rank 1, got {}",
            rank
        ))),
        _ => Ok(()),
    }
}

/// Read the part of one file's dataset that falls inside `request`
///
/// Returns `None` if the file lacks the dataset, otherwise the effective
/// class of the file's data and its subdomain if it contributes.
pub(crate) async fn read_subdomain(
    container: &mut Container,
    file_key: i64,
    id: i32,
    name: &str,
    request: &Domain,
    lazy: bool,
) -> Result<Option<(DataClass, Option<DomainData>)>> {
    let path = dataset_path(id, name);
    if container.node(&path).is_none() {
        return Ok(None);
    }
    let annotation = stored_annotation(container, id, name)?;
    let info = container.dataset_info(&path)?;
    let local = annotation.local;

    let class = match annotation.class {
        DataClass::Undefined => {
            warn!(id, name, "undefined data class read as grid");
            DataClass::Grid
        }
        class => class,
    };
    let selected = match class {
        DataClass::Poly => (info.num_elements() > 0 && local.intersects(request))
            .then_some((local, Dimensions::ZERO, info.size)),
        _ => {
            if info.size != local.size() {
                return Err(DcError::InconsistentFileset(format!(
                    "{} in {} has shape {} but local domain size {}",
                    name,
                    container.name(),
                    info.size,
                    local.size()
                )));
            }
            local
                .intersect(request)
                .map(|overlap| (overlap, overlap.offset() - local.offset(), overlap.size()))
        }
    };
    let Some((domain, src_offset, src_size)) = selected else {
        return Ok(Some((class, None)));
    };

    let data = if lazy {
        DomainData::deferred(
            domain,
            info.data_type,
            src_size,
            LazyLoad {
                file_key,
                file_id: container.file_id(),
                id,
                name: name.to_string(),
                src_offset,
                src_size,
            },
        )
    } else {
        let bytes = container.read_region(&path, src_offset, src_size).await?;
        DomainData::new(domain, info.data_type, src_size, bytes)
    };
    Ok(Some((class, Some(data))))
}

/// Load the bytes of a deferred subdomain from its file
pub(crate) async fn realize(container: &mut Container, data: &mut DomainData) -> Result<()> {
    let lazy = data
        .lazy()
        .cloned()
        .ok_or_else(|| DcError::InvalidArgument("Subdomain has no lazy descriptor".to_string()))?;
    if container.file_id() != lazy.file_id {
        return Err(DcError::InconsistentFileset(format!(
            "{} changed since the subdomain was described",
            container.name()
        )));
    }
    let bytes = container
        .read_region(&dataset_path(lazy.id, &lazy.name), lazy.src_offset, lazy.src_size)
        .await?;
    data.set_data(bytes);
    Ok(())
}

/// Accumulates per-file results of a domain read
#[derive(Debug, Default)]
pub(crate) struct DomainGather {
    class: Option<DataClass>,
    found: bool,
    parts: Vec<DomainData>,
}

impl DomainGather {
    pub(crate) fn add(&mut self, result: Option<(DataClass, Option<DomainData>)>, name: &str) -> Result<()> {
        let Some((class, data)) = result else {
            return Ok(());
        };
        self.class = Some(merge_class(self.class, class, name)?);
        self.found = true;
        self.parts.extend(data);
        Ok(())
    }

    pub(crate) fn finish(self, id: i32, name: &str) -> Result<DataContainer> {
        if !self.found {
            return Err(DcError::NotFound(format!("Dataset {} at iteration {}", name, id)));
        }
        let mut container = DataContainer::new(self.class.unwrap_or(DataClass::Grid));
        for part in self.parts {
            container.add(part);
        }
        Ok(container)
    }
}

/// Fold the class of one file into the class seen so far
pub(crate) fn merge_class(seen: Option<DataClass>, class: DataClass, name: &str) -> Result<DataClass> {
    match seen {
        Some(previous) if previous != class => Err(DcError::InconsistentFileset(format!(
            "{} is stored as {:?} in one file and {:?} in another",
            name, previous, class
        ))),
        _ => Ok(class),
    }
}
