//! dcollect - parallel I/O for domain-annotated arrays
//!
//! Simulations write one or more named multi-dimensional datasets per
//! iteration. dcollect stores them in self-describing container files and
//! reads them back, alone or stitched across all writers of a run.
//!
//! # Features
//!
//! - Serial collectors writing one container per writer (a file-set)
//! - Merged reads that reassemble a file-set into one logical dataset
//! - Parallel collectors sharing one container per iteration across a
//!   process group, with collective and auto-offset writes
//! - Domain annotations (Grid and Poly data) and box queries with lazy loads
//! - Chunked storage with optional Deflate or Zstd compression
//! - Async I/O throughout (implement `IOManager` for other storage)
//!
//! # Example
//!
//! ```rust,ignore
//! use dcollect::{DataCollector, DataType, Dimensions, FileCreationAttr, Selection, SerialDataCollector};
//!
//! # async fn example() -> dcollect::Result<()> {
//! let mut dc = SerialDataCollector::new();
//! dc.open("run/fields".as_ref(), FileCreationAttr::default()).await?;
//! let sel = Selection::new(Dimensions::new(4, 1, 1));
//! dc.write(1, DataType::F32, 1, &sel, "energy", &[0u8; 16]).await?;
//! dc.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod attribute;
pub mod catalog;
pub mod collector;
pub mod comm;
pub mod compression;
pub mod config;
pub mod container;
pub mod dims;
pub mod domain;
pub mod domain_collector;
pub mod error;
pub mod fileset;
pub mod handles;
pub mod io;
pub mod layout;
pub mod metadata;
pub mod parallel;
pub mod parallel_domain;
pub mod serial;
pub mod types;
pub mod utils;

// Re-exports
pub use attribute::Attribute;
pub use catalog::DcEntry;
pub use collector::{DataCollector, DomainAccess};
pub use comm::{Communicator, LocalComm, LocalGroup, SelfComm};
pub use compression::CompressionMethod;
pub use config::{FileAccessType, FileCreationAttr};
pub use container::DatasetInfo;
pub use dims::{Dimensions, Selection};
pub use domain::{DataClass, DataContainer, Domain, DomainData};
pub use domain_collector::DomainCollector;
pub use error::{DcError, ErrorKind, Result};
pub use io::IOManager;
pub use parallel::ParallelDataCollector;
pub use parallel_domain::ParallelDomainCollector;
pub use serial::SerialDataCollector;
pub use types::{DataType, Element};

/// Version of the dcollect implementation, stamped on every file
pub const DCOLLECT_VERSION: &str = env!("CARGO_PKG_VERSION");
