//! Storage managers backing container files

use crate::error::{DcError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// How a storage file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing file, read only
    Read,
    /// Existing file, read and write
    ReadWrite,
    /// Create or truncate
    Create,
}

/// Positional access to one storage file
#[async_trait]
pub trait StorageFile: Send + Sync {
    /// Read exactly `len` bytes at `offset`
    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Bytes>;

    /// Write `data` at `offset`, extending the file if needed
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Current length in bytes
    async fn len(&mut self) -> Result<u64>;

    /// Truncate or extend to `len` bytes
    async fn set_len(&mut self, len: u64) -> Result<()>;

    /// Make all written data durable
    async fn sync(&mut self) -> Result<()>;
}

/// Trait for opening and managing storage files
#[async_trait]
pub trait IOManager: Send + Sync {
    /// Open a file
    async fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn StorageFile>>;

    /// Check if a path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Delete the file at a path
    async fn delete(&self, path: &str) -> Result<()>;

    /// List entry names in a directory
    async fn list(&self, dir: &str) -> Result<Vec<String>>;

    /// Get the size of the file at a path
    async fn size(&self, path: &str) -> Result<u64>;
}

fn map_open_error(err: std::io::Error, path: &Path) -> DcError {
    if err.kind() == std::io::ErrorKind::NotFound {
        DcError::NotFound(format!("File {}", path.display()))
    } else {
        DcError::Io(err)
    }
}

/// File system I/O manager
pub struct FileSystemIOManager {
    base_path: PathBuf,
}

impl FileSystemIOManager {
    /// Create a new file system I/O manager rooted at `base_path`
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Get the full path for a relative path
    fn full_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }
}

/// A file on the local file system
struct FsFile {
    file: fs::File,
}

#[async_trait]
impl StorageFile for FsFile {
    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Bytes> {
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        self.file.flush().await?;
        Ok(())
    }

    async fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata().await?.len())
    }

    async fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len).await?;
        Ok(())
    }

    async fn sync(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl IOManager for FileSystemIOManager {
    async fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn StorageFile>> {
        let full_path = self.full_path(path);
        let mut options = fs::OpenOptions::new();
        match mode {
            OpenMode::Read => options.read(true),
            OpenMode::ReadWrite => options.read(true).write(true),
            OpenMode::Create => {
                if let Some(parent) = full_path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                options.read(true).write(true).create(true).truncate(true)
            }
        };
        let file = options
            .open(&full_path)
            .await
            .map_err(|e| map_open_error(e, &full_path))?;
        Ok(Box::new(FsFile { file }))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(path)).await?)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        fs::remove_file(&full_path)
            .await
            .map_err(|e| map_open_error(e, &full_path))
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let full_path = self.full_path(dir);
        let mut entries = Vec::new();

        if fs::metadata(&full_path).await.map(|m| m.is_dir()).unwrap_or(false) {
            let mut read_dir = fs::read_dir(&full_path).await?;

            while let Some(entry) = read_dir.next_entry().await? {
                if let Some(name) = entry.file_name().to_str() {
                    entries.push(name.to_string());
                }
            }
        }

        entries.sort();
        Ok(entries)
    }

    async fn size(&self, path: &str) -> Result<u64> {
        let full_path = self.full_path(path);
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| map_open_error(e, &full_path))?;
        Ok(metadata.len())
    }
}

/// Create an I/O manager for a directory given as a path or `file://` URL
pub fn create_io_manager(url: &str) -> Result<Box<dyn IOManager>> {
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(Box::new(FileSystemIOManager::new(path)));
    }
    if let Some(scheme_end) = url.find("://") {
        return Err(DcError::Configuration(format!(
            "Unsupported storage scheme: {}",
            &url[..scheme_end]
        )));
    }
    Ok(Box::new(FileSystemIOManager::new(url)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_system_io() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIOManager::new(temp_dir.path());

        let mut file = io.open("test.dat", OpenMode::Create).await.unwrap();
        file.write_at(0, b"Hello, ").await.unwrap();
        file.write_at(7, b"world!").await.unwrap();
        file.sync().await.unwrap();
        assert_eq!(file.len().await.unwrap(), 13);
        drop(file);

        let mut file = io.open("test.dat", OpenMode::Read).await.unwrap();
        assert_eq!(&file.read_at(7, 5).await.unwrap()[..], b"world");
        assert!(file.read_at(10, 10).await.is_err());

        assert!(io.exists("test.dat").await.unwrap());
        assert!(!io.exists("nonexistent.dat").await.unwrap());
        assert_eq!(io.size("test.dat").await.unwrap(), 13);
        assert_eq!(io.list("").await.unwrap(), vec!["test.dat".to_string()]);

        io.delete("test.dat").await.unwrap();
        assert!(!io.exists("test.dat").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIOManager::new(temp_dir.path());
        let err = io.open("missing.dcol", OpenMode::Read).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_set_len_extends_with_zeros() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIOManager::new(temp_dir.path());
        let mut file = io.open("sparse.dat", OpenMode::Create).await.unwrap();
        file.set_len(16).await.unwrap();
        assert_eq!(&file.read_at(8, 8).await.unwrap()[..], &[0u8; 8]);
    }

    #[test]
    fn test_create_io_manager() {
        assert!(create_io_manager("file:///data/run").is_ok());
        assert!(create_io_manager("/data/run").is_ok());
        let err = create_io_manager("s3://bucket/run").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
