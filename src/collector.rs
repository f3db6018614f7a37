//! Collector traits shared by the serial and parallel front-ends

use crate::attribute::Attribute;
use crate::catalog::DcEntry;
use crate::config::FileCreationAttr;
use crate::container::DatasetInfo;
use crate::dims::{copy_hyperslab, Dimensions, Hyperslab, Selection};
use crate::domain::{DataClass, DataContainer, Domain, DomainData};
use crate::error::{DcError, Result};
use crate::types::{DataType, Element};
use crate::utils::bytes_to_typed_data;
use async_trait::async_trait;
use std::path::Path;

/// Iteration-oriented access to a file or file-set
///
/// For the parallel collector every mutating call is collective.
#[async_trait]
pub trait DataCollector: Send {
    /// Open `path` according to `attr`
    async fn open(&mut self, path: &Path, attr: FileCreationAttr) -> Result<()>;

    /// Flush and release all files
    async fn close(&mut self) -> Result<()>;

    /// Largest iteration id, 0 if there is none
    async fn max_id(&mut self) -> Result<i32>;

    /// All iteration ids, ascending
    async fn entry_ids(&mut self) -> Result<Vec<i32>>;

    /// All datasets of one iteration
    async fn entries_for_id(&mut self, id: i32) -> Result<Vec<DcEntry>>;

    /// Type, rank and logical size of a dataset
    async fn read_info(&mut self, id: i32, name: &str) -> Result<DatasetInfo>;

    /// Read a whole dataset
    async fn read(&mut self, id: i32, name: &str) -> Result<(DatasetInfo, Vec<u8>)>;

    /// Read a dataset into `buf`, a buffer of shape `dst_size`, at `dst_offset`
    async fn read_into(
        &mut self,
        id: i32,
        name: &str,
        dst_size: Dimensions,
        dst_offset: Dimensions,
        buf: &mut [u8],
    ) -> Result<DatasetInfo>;

    /// Write the selected part of `buf` as a new dataset
    async fn write(
        &mut self,
        id: i32,
        data_type: DataType,
        rank: u32,
        sel: &Selection,
        name: &str,
        buf: &[u8],
    ) -> Result<()>;

    /// Remove a whole iteration
    async fn remove(&mut self, id: i32) -> Result<()>;

    /// Remove one dataset of an iteration
    async fn remove_dataset(&mut self, id: i32, name: &str) -> Result<()>;

    /// Make `dst_name` at `dst_id` an alias of `src_name` at `src_id`
    async fn create_reference(
        &mut self,
        src_id: i32,
        src_name: &str,
        dst_id: i32,
        dst_name: &str,
    ) -> Result<()>;

    async fn write_attribute(
        &mut self,
        id: i32,
        name: &str,
        attr_name: &str,
        value: Attribute,
    ) -> Result<()>;

    async fn read_attribute(&mut self, id: i32, name: &str, attr_name: &str) -> Result<Attribute>;

    /// Write an attribute on the file root (`None`) or an iteration group
    async fn write_global_attribute(
        &mut self,
        scope: Option<i32>,
        name: &str,
        value: Attribute,
    ) -> Result<()>;

    async fn read_global_attribute(&mut self, scope: Option<i32>, name: &str) -> Result<Attribute>;

    /// Read a whole dataset as typed values
    async fn read_vec<T: Element>(&mut self, id: i32, name: &str) -> Result<Vec<T>>
    where
        Self: Sized,
    {
        let (info, bytes) = self.read(id, name).await?;
        if info.data_type != T::DATA_TYPE {
            return Err(DcError::TypeMismatch(format!(
                "{} holds {}, requested {}",
                name,
                info.data_type,
                T::DATA_TYPE
            )));
        }
        bytes_to_typed_data(&bytes)
    }
}

/// Domain queries over a file or file-set
#[async_trait]
pub trait DomainAccess: Send {
    /// Union box of all writers of a dataset
    async fn global_domain(&mut self, id: i32, name: &str) -> Result<Domain>;

    /// Box written by this writer
    async fn local_domain(&mut self, id: i32, name: &str) -> Result<Domain>;

    /// Collect every part of dataset `name` that falls inside `request`
    ///
    /// With `lazy`, subdomains carry a descriptor instead of bytes; load
    /// them with [`DomainAccess::read_domain_lazy`].
    async fn read_domain(
        &mut self,
        id: i32,
        name: &str,
        request: Domain,
        lazy: bool,
    ) -> Result<DataContainer>;

    /// Load the bytes of a deferred subdomain
    async fn read_domain_lazy(&mut self, data: &mut DomainData) -> Result<()>;

    /// Class of the dataset as seen by a full read of its global domain
    async fn data_class(&mut self, id: i32, name: &str) -> Result<DataClass> {
        let global = self.global_domain(id, name).await?;
        Ok(self.read_domain(id, name, global, true).await?.class())
    }
}

/// Copy a whole dataset into a buffer of shape `dst_size` at `dst_offset`
pub(crate) fn place_into(
    info: &DatasetInfo,
    bytes: &[u8],
    dst_size: Dimensions,
    dst_offset: Dimensions,
    buf: &mut [u8],
) -> Result<()> {
    if !(dst_offset + info.size).all_le(&dst_size) {
        return Err(DcError::ShapeMismatch(format!(
            "Dataset of size {} does not fit at {} into a buffer of {}",
            info.size, dst_offset, dst_size
        )));
    }
    let count = info.size.to_physical(3);
    copy_hyperslab(
        bytes,
        &count,
        &Hyperslab::dense(vec![0; 3], count.clone()),
        buf,
        &dst_size.to_physical(3),
        &Hyperslab::dense(dst_offset.to_physical(3), count.clone()),
        info.data_type.size_in_bytes(),
    )
}
