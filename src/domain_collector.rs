//! Domain-aware serial collector
//!
//! Every dataset group carries the writer's local domain, the global domain
//! and a data class. Domain reads visit the files of the set in topology
//! order and return the parts that fall inside the requested box.

use crate::catalog::{dataset_group_path, dataset_path};
use crate::collector::{DataCollector, DomainAccess};
use crate::dims::{Dimensions, Selection};
use crate::domain::{
    check_domain_write, read_subdomain, realize, stored_annotation, DataClass, DataContainer, Domain, DomainAnnotation,
    DomainData, DomainGather,
};
use crate::error::{DcError, Result};
use crate::serial::SerialDataCollector;
use crate::types::DataType;
use async_trait::async_trait;
use std::ops::{Deref, DerefMut};

/// [`SerialDataCollector`] with domain annotations
#[derive(Default)]
pub struct DomainCollector {
    inner: SerialDataCollector,
}

impl Deref for DomainCollector {
    type Target = SerialDataCollector;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for DomainCollector {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl DomainCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a dataset together with its domain annotation
    #[allow(clippy::too_many_arguments)]
    pub async fn write_domain(
        &mut self,
        id: i32,
        data_type: DataType,
        rank: u32,
        sel: &Selection,
        name: &str,
        local: Domain,
        global: Domain,
        class: DataClass,
        buf: &[u8],
    ) -> Result<()> {
        check_domain_write(rank, sel.size, &local, &global, class)?;
        self.inner.write(id, data_type, rank, sel, name, buf).await?;
        let container = self.inner.own_container("write_domain").await?;
        DomainAnnotation { local, global, class }.write(container, &dataset_group_path(id, name))?;
        self.inner.invalidate(id);
        Ok(())
    }

    /// Append Poly records; the annotation is set by the first append
    #[allow(clippy::too_many_arguments)]
    pub async fn append_domain(
        &mut self,
        id: i32,
        data_type: DataType,
        count: u64,
        name: &str,
        local: Domain,
        global: Domain,
        buf: &[u8],
    ) -> Result<()> {
        self.append_domain_strided(id, data_type, count, 0, 1, name, local, global, buf)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn append_domain_strided(
        &mut self,
        id: i32,
        data_type: DataType,
        count: u64,
        offset: u64,
        stride: u64,
        name: &str,
        local: Domain,
        global: Domain,
        buf: &[u8],
    ) -> Result<()> {
        let wanted = DomainAnnotation {
            local,
            global,
            class: DataClass::Poly,
        };
        check_domain_write(1, Dimensions::new(count, 1, 1), &local, &global, DataClass::Poly)?;
        let group = dataset_group_path(id, name);
        {
            let container = self.inner.own_container("append_domain").await?;
            if container.exists(&group) {
                if let Some(existing) = DomainAnnotation::read(container, &group)? {
                    if existing != wanted {
                        return Err(DcError::InvalidArgument(format!(
                            "{} was appended with local {} and global {}",
                            name, existing.local, existing.global
                        )));
                    }
                }
            }
        }

        self.inner
            .append_strided(id, data_type, count, offset, stride, name, buf)
            .await?;

        let container = self.inner.own_container("append_domain").await?;
        if container.exists(&dataset_path(id, name)) && DomainAnnotation::read(container, &group)?.is_none() {
            wanted.write(container, &group)?;
            self.inner.invalidate(id);
        }
        Ok(())
    }

    /// Local domain written by the writer at `position` (merged mode)
    pub async fn local_domain_at(
        &mut self,
        id: i32,
        name: &str,
        position: Option<Dimensions>,
    ) -> Result<Domain> {
        let key = self.inner.read_key_at("local_domain", position)?;
        let container = self.inner.container(key).await?;
        Ok(stored_annotation(container, id, name)?.local)
    }

    /// Number of elements of a dataset summed over all visited files
    pub async fn total_elements(&mut self, id: i32, name: &str) -> Result<u64> {
        let path = dataset_path(id, name);
        let mut total = None;
        for key in self.inner.read_keys("total_elements")? {
            let container = self.inner.container(key).await?;
            if container.exists(&path) {
                *total.get_or_insert(0) += container.dataset_info(&path)?.num_elements();
            }
        }
        total.ok_or_else(|| DcError::NotFound(format!("Dataset {} at iteration {}", name, id)))
    }

    /// Bounding box of the local domains of all visited files
    pub async fn total_domain(&mut self, id: i32, name: &str) -> Result<Domain> {
        let path = dataset_path(id, name);
        let mut total: Option<Domain> = None;
        for key in self.inner.read_keys("total_domain")? {
            let container = self.inner.container(key).await?;
            if !container.exists(&path) {
                continue;
            }
            let local = stored_annotation(container, id, name)?.local;
            total = Some(match total {
                Some(bounds) => bounds.union_bounds(&local),
                None => local,
            });
        }
        total.ok_or_else(|| DcError::NotFound(format!("Dataset {} at iteration {}", name, id)))
    }
}

#[async_trait]
impl DomainAccess for DomainCollector {
    async fn global_domain(&mut self, id: i32, name: &str) -> Result<Domain> {
        let key = self.inner.read_key_at("global_domain", None)?;
        let container = self.inner.container(key).await?;
        Ok(stored_annotation(container, id, name)?.global)
    }

    async fn local_domain(&mut self, id: i32, name: &str) -> Result<Domain> {
        self.local_domain_at(id, name, None).await
    }

    async fn read_domain(
        &mut self,
        id: i32,
        name: &str,
        request: Domain,
        lazy: bool,
    ) -> Result<DataContainer> {
        let mut gather = DomainGather::default();
        for key in self.inner.read_keys("read_domain")? {
            let container = self.inner.container(key).await?;
            gather.add(read_subdomain(container, key, id, name, &request, lazy).await?, name)?;
        }
        gather.finish(id, name)
    }

    async fn read_domain_lazy(&mut self, data: &mut DomainData) -> Result<()> {
        let key = data
            .lazy()
            .map(|lazy| lazy.file_key)
            .ok_or_else(|| DcError::InvalidArgument("Subdomain has no lazy descriptor".to_string()))?;
        self.inner.read_keys("read_domain_lazy")?;
        let container = self.inner.container(key).await?;
        realize(container, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileAccessType, FileCreationAttr};
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    fn domain(o: [u64; 3], s: [u64; 3]) -> Domain {
        Domain::new(Dimensions(o), Dimensions(s))
    }

    #[tokio::test]
    async fn test_grid_size_must_match_local_domain() {
        let temp_dir = TempDir::new().unwrap();
        let mut dc = DomainCollector::new();
        dc.open(&temp_dir.path().join("g"), FileCreationAttr::default())
            .await
            .unwrap();
        let sel = Selection::new(Dimensions::new(4, 1, 1));
        let err = dc
            .write_domain(
                1,
                DataType::U8,
                1,
                &sel,
                "g",
                domain([0, 0, 0], [5, 1, 1]),
                domain([0, 0, 0], [10, 1, 1]),
                DataClass::Grid,
                &[0; 4],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
        assert!(dc.entry_ids().await.unwrap().is_empty());
        dc.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_poly_append_keeps_annotation() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("poly");
        let local = domain([0, 0, 0], [8, 8, 1]);
        let global = domain([0, 0, 0], [16, 8, 1]);

        let mut dc = DomainCollector::new();
        dc.open(&path, FileCreationAttr::default()).await.unwrap();
        dc.append_domain(1, DataType::U8, 2, "ions", local, global, &[1, 2])
            .await
            .unwrap();
        dc.append_domain(1, DataType::U8, 1, "ions", local, global, &[3])
            .await
            .unwrap();
        let err = dc
            .append_domain(1, DataType::U8, 1, "ions", global, global, &[4])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        dc.close().await.unwrap();

        dc.open(&path, FileCreationAttr::new(FileAccessType::Read)).await.unwrap();
        assert_eq!(dc.local_domain(1, "ions").await.unwrap(), local);
        assert_eq!(dc.global_domain(1, "ions").await.unwrap(), global);
        assert_eq!(dc.total_elements(1, "ions").await.unwrap(), 3);

        let request = domain([4, 4, 0], [1, 1, 1]);
        let data = dc.read_domain(1, "ions", request, false).await.unwrap();
        assert_eq!(data.class(), DataClass::Poly);
        assert_eq!(data.to_vec::<u8>().unwrap(), vec![1, 2, 3]);

        let outside = domain([8, 0, 0], [4, 4, 1]);
        let data = dc.read_domain(1, "ions", outside, false).await.unwrap();
        assert_eq!(data.num_subdomains(), 0);
        dc.close().await.unwrap();
    }
}
