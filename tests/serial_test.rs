//! End-to-end tests of the serial collector: single files, file-sets and merged reads

use dcollect::fileset::ATTR_COMPRESSION;
use dcollect::utils::typed_data_to_bytes;
use dcollect::{
    Attribute, CompressionMethod, DataCollector, DataType, Dimensions, ErrorKind, FileAccessType,
    FileCreationAttr, Selection, SerialDataCollector,
};
use rand::Rng;
use std::path::Path;
use tempfile::TempDir;

fn read_attr() -> FileCreationAttr {
    FileCreationAttr::new(FileAccessType::Read)
}

async fn write_u32(dc: &mut SerialDataCollector, id: i32, name: &str, values: &[u32]) {
    let sel = Selection::new(Dimensions::new(values.len() as u64, 1, 1));
    dc.write(id, DataType::U32, 1, &sel, name, &typed_data_to_bytes(values))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_single_process_write_read() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("single.dcol");

    let mut dc = SerialDataCollector::new();
    dc.open(&path, FileCreationAttr::default()).await.unwrap();
    write_u32(&mut dc, 1, "data", &[1]).await;
    write_u32(&mut dc, 2, "data", &[2]).await;
    dc.close().await.unwrap();

    dc.open(&path, read_attr()).await.unwrap();
    assert_eq!(dc.max_id().await.unwrap(), 2);
    assert_eq!(dc.entry_ids().await.unwrap(), vec![1, 2]);
    assert_eq!(dc.read_vec::<u32>(1, "data").await.unwrap(), vec![1]);
    assert_eq!(dc.read_vec::<u32>(2, "data").await.unwrap(), vec![2]);

    let entries = dc.entries_for_id(2).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "data");
    assert_eq!(entries[0].data_type, DataType::U32);
    assert!(!entries[0].has_domain);
    dc.close().await.unwrap();
}

#[tokio::test]
async fn test_append_random_chunks() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("append.dcol");
    let mut rng = rand::rng();

    let mut expected = Vec::new();
    let mut dc = SerialDataCollector::new();
    dc.open(&path, FileCreationAttr::default()).await.unwrap();
    for (id, n) in (256..=2048).step_by(256).enumerate() {
        let values: Vec<f32> = (0..n).map(|_| rng.random::<f32>()).collect();
        let mut written = 0;
        while written < n {
            let count = rng.random_range(1..=n - written);
            let bytes = typed_data_to_bytes(&values[written..written + count]);
            dc.append(id as i32, DataType::F32, count as u64, "samples", &bytes)
                .await
                .unwrap();
            written += count;
        }
        expected.push(values);
    }
    dc.close().await.unwrap();

    dc.open(&path, read_attr()).await.unwrap();
    for (id, values) in expected.iter().enumerate() {
        let info = dc.read_info(id as i32, "samples").await.unwrap();
        assert_eq!(info.rank, 1);
        assert_eq!(info.size, Dimensions::new(values.len() as u64, 1, 1));
        assert_eq!(&dc.read_vec::<f32>(id as i32, "samples").await.unwrap(), values);
    }
    dc.close().await.unwrap();
}

#[tokio::test]
async fn test_strided_3d_write() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("strided.dcol");

    let mut cases = Vec::new();
    for gx in 5..=7u64 {
        for gy in 5..=7u64 {
            for gz in 5..=7u64 {
                for sx in 1..=2u64 {
                    for sy in 1..=2u64 {
                        for sz in 1..=2u64 {
                            cases.push((Dimensions::new(gx, gy, gz), Dimensions::new(sx, sy, sz)));
                        }
                    }
                }
            }
        }
    }

    let mut dc = SerialDataCollector::new();
    dc.open(&path, FileCreationAttr::default()).await.unwrap();
    for (id, (grid, stride)) in cases.iter().enumerate() {
        let values: Vec<u32> = (0..grid.scalar_size() as u32).collect();
        let bytes = typed_data_to_bytes(&values);
        dc.write(id as i32, DataType::U32, 3, &Selection::new(*grid), "grid", &bytes)
            .await
            .unwrap();
        let sel = Selection::new(*grid)
            .with_size(grid.div_ceil(stride))
            .with_stride(*stride);
        dc.write(id as i32, DataType::U32, 3, &sel, "grid_strided", &bytes)
            .await
            .unwrap();
    }
    dc.close().await.unwrap();

    dc.open(&path, read_attr()).await.unwrap();
    for (id, (grid, stride)) in cases.iter().enumerate() {
        let dense = dc.read_vec::<u32>(id as i32, "grid").await.unwrap();
        assert_eq!(dense.len() as u64, grid.scalar_size());

        let shape = grid.div_ceil(stride);
        let info = dc.read_info(id as i32, "grid_strided").await.unwrap();
        assert_eq!(info.size, shape);
        let strided = dc.read_vec::<u32>(id as i32, "grid_strided").await.unwrap();
        for c in 0..shape.z() {
            for b in 0..shape.y() {
                for a in 0..shape.x() {
                    let index = a + b * shape.x() + c * shape.x() * shape.y();
                    let expected = a * stride.x()
                        + b * stride.y() * grid.x()
                        + c * stride.z() * grid.x() * grid.y();
                    assert_eq!(strided[index as usize] as u64, expected);
                }
            }
        }
    }
    dc.close().await.unwrap();
}

#[tokio::test]
async fn test_remove_in_write_mode() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("remove.dcol");

    let mut dc = SerialDataCollector::new();
    dc.open(&path, FileCreationAttr::default()).await.unwrap();
    write_u32(&mut dc, 1, "a", &[1, 2]).await;
    write_u32(&mut dc, 1, "b", &[3]).await;
    write_u32(&mut dc, 1, "fields/e", &[4]).await;
    write_u32(&mut dc, 2, "a", &[5]).await;
    dc.close().await.unwrap();

    dc.open(&path, FileCreationAttr::new(FileAccessType::Write))
        .await
        .unwrap();
    dc.remove_dataset(1, "a").await.unwrap();
    assert_eq!(dc.read(1, "a").await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(
        dc.remove_dataset(1, "a").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(dc.read_vec::<u32>(1, "b").await.unwrap(), vec![3]);
    dc.remove(2).await.unwrap();
    assert_eq!(dc.remove(2).await.unwrap_err().kind(), ErrorKind::NotFound);
    write_u32(&mut dc, 3, "c", &[6]).await;
    dc.close().await.unwrap();

    dc.open(&path, read_attr()).await.unwrap();
    assert_eq!(dc.entry_ids().await.unwrap(), vec![1, 3]);
    let names: Vec<String> = dc
        .entries_for_id(1)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["b", "fields/e"]);
    assert_eq!(dc.read_vec::<u32>(1, "fields/e").await.unwrap(), vec![4]);
    dc.close().await.unwrap();
}

#[tokio::test]
async fn test_nested_dataset_names() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("names.dcol");

    let mut dc = SerialDataCollector::new();
    dc.open(&path, FileCreationAttr::default()).await.unwrap();
    write_u32(&mut dc, 1, "a", &[1]).await;
    write_u32(&mut dc, 1, "a/b", &[2]).await;
    write_u32(&mut dc, 1, "a/b/a", &[3]).await;
    let sel = Selection::new(Dimensions::ONE);
    let err = dc
        .write(1, DataType::U32, 1, &sel, "a/a", &typed_data_to_bytes(&[4u32]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = dc
        .append(1, DataType::U32, 1, "a/b/b", &typed_data_to_bytes(&[5u32]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    dc.close().await.unwrap();

    dc.open(&path, read_attr()).await.unwrap();
    let names: Vec<String> = dc
        .entries_for_id(1)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["a", "a/b", "a/b/a"]);
    assert_eq!(dc.read_vec::<u32>(1, "a/b/a").await.unwrap(), vec![3]);
    dc.close().await.unwrap();
}

#[tokio::test]
async fn test_object_and_region_references() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("refs.dcol");

    let mut dc = SerialDataCollector::new();
    dc.open(&path, FileCreationAttr::default()).await.unwrap();
    let values: Vec<u32> = (0..10).collect();
    write_u32(&mut dc, 1, "src", &values).await;
    dc.create_reference(1, "src", 2, "alias").await.unwrap();
    dc.create_region_reference(
        1,
        "src",
        2,
        "evens",
        Dimensions::new(5, 1, 1),
        Dimensions::new(0, 0, 0),
        Dimensions::new(2, 1, 1),
    )
    .await
    .unwrap();
    assert_eq!(
        dc.create_reference(1, "src", 1, "src").await.unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    dc.close().await.unwrap();

    dc.open(&path, read_attr()).await.unwrap();
    assert_eq!(dc.read_vec::<u32>(2, "alias").await.unwrap(), values);
    assert_eq!(dc.read_vec::<u32>(2, "evens").await.unwrap(), vec![0, 2, 4, 6, 8]);
    let names: Vec<String> = dc
        .entries_for_id(2)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["alias", "evens"]);
    dc.close().await.unwrap();
}

#[tokio::test]
async fn test_compressed_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("packed.dcol");
    let values: Vec<f64> = (0..5000).map(|i| (i as f64 * 0.01).sin()).collect();

    for method in [CompressionMethod::Deflate, CompressionMethod::Zstd] {
        let attr = FileCreationAttr::default()
            .with_compression(true)
            .with_compression_method(method);
        let mut dc = SerialDataCollector::new();
        dc.open(&path, attr).await.unwrap();
        let sel = Selection::new(Dimensions::new(100, 50, 1));
        dc.write(1, DataType::F64, 2, &sel, "wave", &typed_data_to_bytes(&values))
            .await
            .unwrap();
        dc.append(1, DataType::F64, 3, "tail", &typed_data_to_bytes(&values[..3]))
            .await
            .unwrap();
        dc.close().await.unwrap();

        dc.open(&path, read_attr()).await.unwrap();
        assert_eq!(dc.read_vec::<f64>(1, "wave").await.unwrap(), values);
        assert_eq!(dc.read_vec::<f64>(1, "tail").await.unwrap(), values[..3].to_vec());
        let flag = dc.read_global_attribute(None, ATTR_COMPRESSION).await.unwrap();
        assert_eq!(flag.as_scalar::<u8>().unwrap(), 1);
        dc.close().await.unwrap();
    }
}

async fn write_writer(dir: &Path, position: Dimensions, rank1: &[u32], grid: &[u16]) {
    let attr = FileCreationAttr::default().with_topology(Dimensions::new(2, 1, 1), position);
    let mut dc = SerialDataCollector::new();
    dc.open(&dir.join("run"), attr).await.unwrap();
    write_u32(&mut dc, 5, "particles", rank1).await;
    let sel = Selection::new(Dimensions::new(3, 2, 1));
    dc.write(5, DataType::U16, 2, &sel, "field", &typed_data_to_bytes(grid))
        .await
        .unwrap();
    dc.write_attribute(5, "field", "unit", Attribute::string("V/m"))
        .await
        .unwrap();
    dc.close().await.unwrap();
}

#[tokio::test]
async fn test_merged_read_of_fileset() {
    let temp_dir = TempDir::new().unwrap();
    write_writer(temp_dir.path(), Dimensions::new(0, 0, 0), &[1, 2, 3], &[0, 1, 2, 3, 4, 5]).await;
    write_writer(
        temp_dir.path(),
        Dimensions::new(1, 0, 0),
        &[4, 5],
        &[100, 101, 102, 103, 104, 105],
    )
    .await;

    let mut dc = SerialDataCollector::new();
    dc.open(
        &temp_dir.path().join("run"),
        FileCreationAttr::new(FileAccessType::ReadMerged),
    )
    .await
    .unwrap();
    assert_eq!(dc.mpi_size(), Some(Dimensions::new(2, 1, 1)));

    let entries = dc.entries_for_id(5).await.unwrap();
    assert_eq!(entries[0].name, "field");
    assert_eq!(entries[0].size, Dimensions::new(6, 2, 1));
    assert_eq!(entries[1].size, Dimensions::new(5, 1, 1));

    assert_eq!(dc.read_vec::<u32>(5, "particles").await.unwrap(), vec![1, 2, 3, 4, 5]);
    assert_eq!(
        dc.read_vec::<u16>(5, "field").await.unwrap(),
        vec![0, 1, 2, 100, 101, 102, 3, 4, 5, 103, 104, 105]
    );

    let mut buf = vec![0u8; 8 * 4];
    let info = dc
        .read_into(5, "particles", Dimensions::new(8, 1, 1), Dimensions::new(2, 0, 0), &mut buf)
        .await
        .unwrap();
    assert_eq!(info.size, Dimensions::new(5, 1, 1));
    assert_eq!(buf, typed_data_to_bytes(&[0u32, 0, 1, 2, 3, 4, 5, 0]));
    let err = dc
        .read_into(5, "particles", Dimensions::new(4, 1, 1), Dimensions::ZERO, &mut buf)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShapeMismatch);

    let unit = dc
        .read_attribute_at(5, "field", "unit", Some(Dimensions::new(1, 0, 0)))
        .await
        .unwrap();
    assert_eq!(unit.as_string().unwrap(), "V/m");
    dc.close().await.unwrap();

    // one open handle at a time still visits every writer
    let attr = FileCreationAttr::new(FileAccessType::ReadMerged).with_max_file_handles(1);
    dc.open(&temp_dir.path().join("run"), attr).await.unwrap();
    assert_eq!(dc.access_type(), Some(FileAccessType::ReadMerged));
    assert_eq!(dc.read_vec::<u32>(5, "particles").await.unwrap(), vec![1, 2, 3, 4, 5]);
    assert_eq!(dc.read_vec::<u16>(5, "field").await.unwrap().len(), 12);
    dc.close().await.unwrap();

    // a single writer's file alone
    let mut dc = SerialDataCollector::new();
    let attr = read_attr().with_topology(Dimensions::new(2, 1, 1), Dimensions::new(1, 0, 0));
    dc.open(&temp_dir.path().join("run"), attr).await.unwrap();
    assert_eq!(dc.read_vec::<u32>(5, "particles").await.unwrap(), vec![4, 5]);
    dc.close().await.unwrap();
}

#[tokio::test]
async fn test_attributes() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("attrs.dcol");

    let mut dc = SerialDataCollector::new();
    dc.open(&path, FileCreationAttr::default()).await.unwrap();
    write_u32(&mut dc, 7, "data", &[1, 2, 3]).await;
    dc.write_attribute(7, "data", "scale", Attribute::scalar(2.5f64))
        .await
        .unwrap();
    assert_eq!(
        dc.write_attribute(7, "missing", "scale", Attribute::scalar(1u8))
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::NotFound
    );
    dc.write_global_attribute(None, "title", Attribute::string("laser wakefield"))
        .await
        .unwrap();
    dc.write_global_attribute(Some(7), "time", Attribute::scalar(1.5e-15f64))
        .await
        .unwrap();
    assert_eq!(
        dc.write_global_attribute(None, "mpi_size", Attribute::scalar(1u8))
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::InvalidArgument
    );
    dc.close().await.unwrap();

    dc.open(&path, read_attr()).await.unwrap();
    let scale = dc.read_attribute(7, "data", "scale").await.unwrap();
    assert_eq!(scale.as_scalar::<f64>().unwrap(), 2.5);
    let title = dc.read_global_attribute(None, "title").await.unwrap();
    assert_eq!(title.as_string().unwrap(), "laser wakefield");
    let time = dc.read_global_attribute(Some(7), "time").await.unwrap();
    assert_eq!(time.as_scalar::<f64>().unwrap(), 1.5e-15);
    assert_eq!(
        dc.read_global_attribute(None, "mpi_size").await.unwrap().as_dims().unwrap(),
        Dimensions::ONE
    );
    // iteration attributes do not create datasets
    assert_eq!(dc.entries_for_id(7).await.unwrap().len(), 1);
    dc.close().await.unwrap();
}

#[tokio::test]
async fn test_empty_file_and_missing_entries() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("empty.dcol");

    let mut dc = SerialDataCollector::new();
    dc.open(&path, FileCreationAttr::default()).await.unwrap();
    dc.close().await.unwrap();

    dc.open(&path, read_attr()).await.unwrap();
    assert_eq!(dc.max_id().await.unwrap(), 0);
    assert!(dc.entry_ids().await.unwrap().is_empty());
    assert_eq!(dc.entries_for_id(1).await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(dc.read(1, "data").await.unwrap_err().kind(), ErrorKind::NotFound);
    dc.close().await.unwrap();

    let err = dc
        .open(&temp_dir.path().join("absent.dcol"), read_attr())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_creation_attributes_from_json() {
    let temp_dir = TempDir::new().unwrap();
    let config = temp_dir.path().join("attr.json");
    std::fs::write(
        &config,
        r#"{"file_acc_type": "create", "enable_compression": true, "compression": "zstd"}"#,
    )
    .unwrap();
    let attr = FileCreationAttr::from_json_file(&config).unwrap();
    assert!(attr.enable_compression);
    assert_eq!(attr.compression, CompressionMethod::Zstd);

    let mut dc = SerialDataCollector::new();
    dc.open(&temp_dir.path().join("cfg.dcol"), attr).await.unwrap();
    write_u32(&mut dc, 1, "x", &[9; 64]).await;
    dc.close().await.unwrap();
}
