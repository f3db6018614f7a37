//! Example: write a 2x2 file-set of annotated field tiles, then read a box
//! that crosses all four of them
//!
//! Run with: cargo run --example domain_roundtrip

use anyhow::Result;
use dcollect::utils::typed_data_to_bytes;
use dcollect::{
    DataClass, DataCollector, DataType, Dimensions, Domain, DomainAccess, DomainCollector,
    FileAccessType, FileCreationAttr, Selection,
};
use tracing::info;

const TILE: Dimensions = Dimensions::new(64, 32, 1);
const TOPOLOGY: Dimensions = Dimensions::new(2, 2, 1);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let temp_dir = tempfile::tempdir()?;
    let base = temp_dir.path().join("wakefield");
    let global = Domain::new(Dimensions::ZERO, TILE * TOPOLOGY);

    for position in TOPOLOGY.positions() {
        let local = Domain::new(position * TILE, TILE);
        let values: Vec<f32> = TILE
            .positions()
            .map(|p| {
                let at = local.offset() + p;
                ((at.x() as f32) * 0.1).sin() * ((at.y() as f32) * 0.05).cos()
            })
            .collect();

        let mut dc = DomainCollector::new();
        dc.open(&base, FileCreationAttr::default().with_topology(TOPOLOGY, position))
            .await?;
        dc.write_domain(
            100,
            DataType::F32,
            2,
            &Selection::new(TILE),
            "fields/Ex",
            local,
            global,
            DataClass::Grid,
            &typed_data_to_bytes(&values),
        )
        .await?;
        dc.close().await?;
        info!(%position, domain = %local, "wrote tile");
    }

    let mut dc = DomainCollector::new();
    dc.open(&base, FileCreationAttr::new(FileAccessType::ReadMerged))
        .await?;
    println!("Iterations: {:?}", dc.entry_ids().await?);
    for entry in dc.entries_for_id(100).await? {
        println!("  {} {} {}", entry.name, entry.data_type, entry.size);
    }

    let request = Domain::new(Dimensions::new(48, 24, 0), Dimensions::new(32, 16, 1));
    let data = dc.read_domain(100, "fields/Ex", request, false).await?;
    println!(
        "Box {} touches {} tiles, {} elements",
        request,
        data.num_subdomains(),
        data.num_elements()
    );
    for part in data.iter() {
        let array = part.to_array::<f32>()?;
        println!("  {} -> shape {:?}, first {:.3}", part.domain(), array.shape(), array[[0, 0, 0]]);
    }
    dc.close().await?;
    Ok(())
}
