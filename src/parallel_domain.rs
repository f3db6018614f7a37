//! Domain-aware parallel collector
//!
//! All ranks write into one shared dataset per iteration, so its local and
//! global domain coincide. The annotation is written once per dataset by
//! the same collective call that creates it.

use crate::catalog::dataset_group_path;
use crate::collector::DomainAccess;
use crate::comm::Communicator;
use crate::dims::{Dimensions, Selection};
use crate::domain::{
    check_domain_write, read_subdomain, realize, stored_annotation, DataClass, DataContainer, Domain,
    DomainAnnotation, DomainData, DomainGather,
};
use crate::error::{DcError, Result};
use crate::parallel::ParallelDataCollector;
use crate::types::DataType;
use async_trait::async_trait;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Pick the domain of an automatically assembled dataset
///
/// Poly records carry no spatial extent, so their domain size must be given.
fn auto_domain(
    class: DataClass,
    domain_offset: Dimensions,
    domain_size: Option<Dimensions>,
    global_size: Dimensions,
) -> Result<Domain> {
    match (class, domain_size) {
        (DataClass::Poly, None) => Err(DcError::InvalidArgument(
            "Poly data needs an explicit domain size".to_string(),
        )),
        (_, Some(size)) => Ok(Domain::new(domain_offset, size)),
        (_, None) => Ok(Domain::new(domain_offset, global_size)),
    }
}

fn check_auto_request(rank: u32, class: DataClass, domain_size: Option<Dimensions>) -> Result<()> {
    if class == DataClass::Poly && rank != 1 {
        return Err(DcError::InvalidArgument(format!(
            "Poly data must have rank 1, got {}",
            rank
        )));
    }
    // fails before any collective exchange
    auto_domain(class, Dimensions::ZERO, domain_size, Dimensions::ONE).map(|_| ())
}

/// [`ParallelDataCollector`] with domain annotations
pub struct ParallelDomainCollector {
    inner: ParallelDataCollector,
}

impl Deref for ParallelDomainCollector {
    type Target = ParallelDataCollector;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for ParallelDomainCollector {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl ParallelDomainCollector {
    pub fn new(comm: Arc<dyn Communicator>) -> Self {
        Self {
            inner: ParallelDataCollector::new(comm),
        }
    }

    async fn annotate(&mut self, id: i32, name: &str, domain: Domain, class: DataClass) -> Result<()> {
        let annotation = DomainAnnotation {
            local: domain,
            global: domain,
            class,
        };
        let container = self.inner.writable_container("write_domain", id).await?;
        annotation.write(container, &dataset_group_path(id, name))?;
        self.inner.invalidate(id);
        Ok(())
    }

    /// Collectively write a dataset of `global_size` covering `domain`
    #[allow(clippy::too_many_arguments)]
    pub async fn write_domain(
        &mut self,
        id: i32,
        data_type: DataType,
        rank: u32,
        global_size: Dimensions,
        global_offset: Dimensions,
        sel: &Selection,
        name: &str,
        domain: Domain,
        class: DataClass,
        buf: &[u8],
    ) -> Result<()> {
        check_domain_write(rank, global_size, &domain, &domain, class)?;
        self.inner
            .write_global(id, data_type, rank, global_size, global_offset, sel, name, buf)
            .await?;
        self.annotate(id, name, domain, class).await
    }

    /// Collectively write a dataset assembled from every rank's selection
    ///
    /// The domain starts at `domain_offset`. Grid data spans the assembled
    /// shape unless `domain_size` says otherwise, in which case the two must
    /// agree. Poly data requires `domain_size`.
    #[allow(clippy::too_many_arguments)]
    pub async fn write_domain_auto(
        &mut self,
        id: i32,
        data_type: DataType,
        rank: u32,
        sel: &Selection,
        name: &str,
        domain_offset: Dimensions,
        domain_size: Option<Dimensions>,
        class: DataClass,
        buf: &[u8],
    ) -> Result<Domain> {
        check_auto_request(rank, class, domain_size)?;
        let (global_size, _) = self
            .inner
            .write_auto(id, data_type, rank, sel, name, buf)
            .await?;
        let domain = auto_domain(class, domain_offset, domain_size, global_size)?;
        check_domain_write(rank, global_size, &domain, &domain, class)?;
        self.annotate(id, name, domain, class).await?;
        Ok(domain)
    }

    /// Collectively reserve an annotated dataset for later appends
    #[allow(clippy::too_many_arguments)]
    pub async fn reserve_domain(
        &mut self,
        id: i32,
        global_size: Dimensions,
        rank: u32,
        data_type: DataType,
        name: &str,
        domain: Domain,
        class: DataClass,
    ) -> Result<()> {
        check_domain_write(rank, global_size, &domain, &domain, class)?;
        self.inner
            .reserve(id, global_size, rank, data_type, name)
            .await?;
        self.annotate(id, name, domain, class).await
    }

    /// Collectively reserve an annotated dataset sized by every rank's
    /// `local_size`; returns the domain and this rank's offset
    ///
    /// The domain follows the same rules as [`Self::write_domain_auto`].
    #[allow(clippy::too_many_arguments)]
    pub async fn reserve_domain_auto(
        &mut self,
        id: i32,
        local_size: Dimensions,
        rank: u32,
        data_type: DataType,
        name: &str,
        domain_offset: Dimensions,
        domain_size: Option<Dimensions>,
        class: DataClass,
    ) -> Result<(Domain, Dimensions)> {
        check_auto_request(rank, class, domain_size)?;
        let (global_size, offset) = self
            .inner
            .reserve_auto(id, local_size, rank, data_type, name)
            .await?;
        let domain = auto_domain(class, domain_offset, domain_size, global_size)?;
        check_domain_write(rank, global_size, &domain, &domain, class)?;
        self.annotate(id, name, domain, class).await?;
        Ok((domain, offset))
    }
}

#[async_trait]
impl DomainAccess for ParallelDomainCollector {
    async fn global_domain(&mut self, id: i32, name: &str) -> Result<Domain> {
        let container = self.inner.readable_container("global_domain", id).await?;
        Ok(stored_annotation(container, id, name)?.global)
    }

    async fn local_domain(&mut self, id: i32, name: &str) -> Result<Domain> {
        let container = self.inner.readable_container("local_domain", id).await?;
        Ok(stored_annotation(container, id, name)?.local)
    }

    async fn read_domain(
        &mut self,
        id: i32,
        name: &str,
        request: Domain,
        lazy: bool,
    ) -> Result<DataContainer> {
        let container = self.inner.readable_container("read_domain", id).await?;
        let mut gather = DomainGather::default();
        gather.add(read_subdomain(container, id as i64, id, name, &request, lazy).await?, name)?;
        gather.finish(id, name)
    }

    async fn read_domain_lazy(&mut self, data: &mut DomainData) -> Result<()> {
        let id = data
            .lazy()
            .map(|lazy| lazy.id)
            .ok_or_else(|| DcError::InvalidArgument("Subdomain has no lazy descriptor".to_string()))?;
        let container = self.inner.readable_container("read_domain_lazy", id).await?;
        realize(container, data).await
    }
}
