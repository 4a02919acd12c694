//! Asynchronous origin-private storage
//!
//! A directory tree rooted at one host directory, exposed through handles:
//!
//! - [`DirectoryHandle`]: look up or create children, remove entries
//! - [`FileHandle`]: acquire a [`SyncAccessHandle`]
//! - [`SyncAccessHandle`]: synchronous positioned read/write/truncate/flush
//!
//! Handle lookup and acquisition are async. At most one sync access handle may
//! be open per file in the whole process; a second acquisition, or removing a
//! file whose handle is open, fails with
//! [`StorageError::NoModificationAllowed`].

use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry has the wrong kind: {0}")]
    TypeMismatch(String),

    #[error("Access handle already open: {0}")]
    NoModificationAllowed(String),

    #[error("Directory not empty: {0}")]
    InvalidModification(String),

    #[error("Invalid entry name: {0:?}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Platform-style name of the failure, used in diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            StorageError::NotFound(_) => "NotFoundError",
            StorageError::TypeMismatch(_) => "TypeMismatchError",
            StorageError::NoModificationAllowed(_) => "NoModificationAllowedError",
            StorageError::InvalidModification(_) => "InvalidModificationError",
            StorageError::InvalidName(_) => "TypeError",
            StorageError::Io(_) => "IoError",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Files with an open sync access handle, process-wide
fn open_handles() -> &'static Mutex<HashSet<PathBuf>> {
    static OPEN: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    OPEN.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Whether some context currently holds the sync access handle for `path`
pub fn sync_handle_held(path: &Path) -> bool {
    open_handles().lock().contains(path)
}

fn check_name(name: &str) -> StorageResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn map_not_found(err: std::io::Error, path: &Path) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound(path.display().to_string())
    } else {
        StorageError::Io(err)
    }
}

/// Root of the storage tree
#[derive(Debug, Clone)]
pub struct StorageRoot {
    path: PathBuf,
}

impl StorageRoot {
    /// Resolve (creating if needed) the root directory
    pub async fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        tokio::fs::create_dir_all(path.as_ref()).await?;
        let path = tokio::fs::canonicalize(path.as_ref()).await?;
        Ok(StorageRoot { path })
    }

    /// Check the root is usable, returning the reasons it is not
    pub async fn probe(path: impl AsRef<Path>) -> Vec<String> {
        let mut reasons = Vec::new();
        let root = match Self::open(path.as_ref()).await {
            Ok(root) => root,
            Err(e) => {
                reasons.push(format!(
                    "cannot create storage root {}: {}",
                    path.as_ref().display(),
                    e
                ));
                return reasons;
            }
        };

        let probe = root.path.join(".opfs-probe");
        match tokio::fs::write(&probe, b"probe").await {
            Ok(()) => {
                if let Err(e) = tokio::fs::remove_file(&probe).await {
                    reasons.push(format!("storage root is not cleanable: {}", e));
                }
            }
            Err(e) => reasons.push(format!("storage root is not writable: {}", e)),
        }
        reasons
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn directory(&self) -> DirectoryHandle {
        DirectoryHandle {
            path: self.path.clone(),
        }
    }
}

/// Handle to a directory in the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryHandle {
    path: PathBuf,
}

impl DirectoryHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get_directory_handle(
        &self,
        name: &str,
        create: bool,
    ) -> StorageResult<DirectoryHandle> {
        check_name(name)?;
        let path = self.path.join(name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(DirectoryHandle { path }),
            Ok(_) => Err(StorageError::TypeMismatch(path.display().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound && create => {
                tokio::fs::create_dir(&path).await.or_else(|e| {
                    if e.kind() == ErrorKind::AlreadyExists {
                        Ok(())
                    } else {
                        Err(e)
                    }
                })?;
                Ok(DirectoryHandle { path })
            }
            Err(e) => Err(map_not_found(e, &path)),
        }
    }

    pub async fn get_file_handle(&self, name: &str, create: bool) -> StorageResult<FileHandle> {
        check_name(name)?;
        let path = self.path.join(name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(FileHandle { path }),
            Ok(_) => Err(StorageError::TypeMismatch(path.display().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound && create => {
                tokio::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .await?;
                Ok(FileHandle { path })
            }
            Err(e) => Err(map_not_found(e, &path)),
        }
    }

    /// Remove a child entry; directories must be empty unless `recursive`
    pub async fn remove_entry(&self, name: &str, recursive: bool) -> StorageResult<()> {
        check_name(name)?;
        let path = self.path.join(name);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| map_not_found(e, &path))?;

        if meta.is_dir() {
            if recursive {
                let held = open_handles().lock().iter().any(|p| p.starts_with(&path));
                if held {
                    return Err(StorageError::NoModificationAllowed(path.display().to_string()));
                }
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                let mut entries = tokio::fs::read_dir(&path).await?;
                if entries.next_entry().await?.is_some() {
                    return Err(StorageError::InvalidModification(path.display().to_string()));
                }
                tokio::fs::remove_dir(&path).await?;
            }
        } else {
            if open_handles().lock().contains(&path) {
                return Err(StorageError::NoModificationAllowed(path.display().to_string()));
            }
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| map_not_found(e, &path))?;
        }
        Ok(())
    }

    /// Names of immediate children with whether each is a directory
    pub async fn entries(&self) -> StorageResult<Vec<(String, bool)>> {
        let mut out = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let is_dir = entry.file_type().await?.is_dir();
            out.push((entry.file_name().to_string_lossy().into_owned(), is_dir));
        }
        out.sort();
        Ok(out)
    }
}

/// Handle to a file in the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    path: PathBuf,
}

impl FileHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the exclusive synchronous access handle
    pub async fn create_sync_access_handle(&self) -> StorageResult<SyncAccessHandle> {
        if !open_handles().lock().insert(self.path.clone()) {
            return Err(StorageError::NoModificationAllowed(self.path.display().to_string()));
        }

        let path = self.path.clone();
        let opened = tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new().read(true).write(true).open(&path)
        })
        .await;

        let file = match opened {
            Ok(Ok(file)) => file,
            Ok(Err(e)) => {
                open_handles().lock().remove(&self.path);
                return Err(map_not_found(e, &self.path));
            }
            Err(join) => {
                open_handles().lock().remove(&self.path);
                return Err(StorageError::Io(std::io::Error::new(ErrorKind::Other, join)));
            }
        };

        debug!("Acquired sync access handle for {}", self.path.display());
        Ok(SyncAccessHandle {
            file: Some(file),
            path: self.path.clone(),
        })
    }
}

/// Exclusive synchronous access to one file
///
/// Released on [`SyncAccessHandle::close`] or drop.
#[derive(Debug)]
pub struct SyncAccessHandle {
    file: Option<File>,
    path: PathBuf,
}

impl SyncAccessHandle {
    fn file(&mut self) -> StorageResult<&mut File> {
        self.file.as_mut().ok_or_else(|| {
            StorageError::Io(std::io::Error::new(
                ErrorKind::Other,
                "access handle already closed",
            ))
        })
    }

    /// Read into `buf` at `at`; returns fewer bytes only at end of file
    pub fn read(&mut self, buf: &mut [u8], at: u64) -> StorageResult<usize> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(at))?;
        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    /// Write all of `buf` at `at`, extending the file as needed
    pub fn write(&mut self, buf: &[u8], at: u64) -> StorageResult<usize> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(at))?;
        file.write_all(buf)?;
        Ok(buf.len())
    }

    pub fn truncate(&mut self, size: u64) -> StorageResult<()> {
        self.file()?.set_len(size)?;
        Ok(())
    }

    pub fn flush(&mut self) -> StorageResult<()> {
        let file = self.file()?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    pub fn get_size(&mut self) -> StorageResult<u64> {
        Ok(self.file()?.metadata()?.len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the handle so another context can acquire it
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.file.take().is_some() {
            open_handles().lock().remove(&self.path);
            debug!("Released sync access handle for {}", self.path.display());
        }
    }
}

impl Drop for SyncAccessHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_file_handle_lookup_and_create() {
        let temp = TempDir::new().unwrap();
        rt().block_on(async {
            let root = StorageRoot::open(temp.path()).await.unwrap().directory();
            assert!(root.get_file_handle("a.db", false).await.unwrap_err().is_not_found());
            root.get_file_handle("a.db", true).await.unwrap();
            root.get_file_handle("a.db", false).await.unwrap();

            let sub = root.get_directory_handle("sub", true).await.unwrap();
            assert!(matches!(
                root.get_file_handle("sub", false).await,
                Err(StorageError::TypeMismatch(_))
            ));
            sub.get_file_handle("b.db", true).await.unwrap();
            assert_eq!(
                root.entries().await.unwrap(),
                vec![("a.db".to_string(), false), ("sub".to_string(), true)]
            );
        });
    }

    #[test]
    fn test_sync_access_handle_is_exclusive() {
        let temp = TempDir::new().unwrap();
        rt().block_on(async {
            let root = StorageRoot::open(temp.path()).await.unwrap().directory();
            let fh = root.get_file_handle("x.db", true).await.unwrap();
            let sah = fh.create_sync_access_handle().await.unwrap();
            assert!(matches!(
                fh.create_sync_access_handle().await,
                Err(StorageError::NoModificationAllowed(_))
            ));
            assert!(matches!(
                root.remove_entry("x.db", false).await,
                Err(StorageError::NoModificationAllowed(_))
            ));
            sah.close();
            fh.create_sync_access_handle().await.unwrap();
        });
    }

    #[test]
    fn test_read_write_truncate() {
        let temp = TempDir::new().unwrap();
        rt().block_on(async {
            let root = StorageRoot::open(temp.path()).await.unwrap().directory();
            let fh = root.get_file_handle("rw.db", true).await.unwrap();
            let mut sah = fh.create_sync_access_handle().await.unwrap();

            assert_eq!(sah.write(b"hello world", 4).unwrap(), 11);
            sah.flush().unwrap();
            assert_eq!(sah.get_size().unwrap(), 15);

            let mut buf = [0xFFu8; 20];
            let n = sah.read(&mut buf, 0).unwrap();
            assert_eq!(n, 15);
            assert_eq!(&buf[..4], &[0, 0, 0, 0]);
            assert_eq!(&buf[4..15], b"hello world");

            sah.truncate(5).unwrap();
            assert_eq!(sah.get_size().unwrap(), 5);
        });
    }

    #[test]
    fn test_remove_non_empty_directory() {
        let temp = TempDir::new().unwrap();
        rt().block_on(async {
            let root = StorageRoot::open(temp.path()).await.unwrap().directory();
            let sub = root.get_directory_handle("d", true).await.unwrap();
            sub.get_file_handle("f", true).await.unwrap();
            assert!(matches!(
                root.remove_entry("d", false).await,
                Err(StorageError::InvalidModification(_))
            ));
            root.remove_entry("d", true).await.unwrap();
            assert!(root.remove_entry("d", false).await.unwrap_err().is_not_found());
        });
    }

    #[test]
    fn test_probe_reports_unusable_root() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let reasons = rt().block_on(StorageRoot::probe(blocker.join("nested")));
        assert_eq!(reasons.len(), 1);
        assert!(rt().block_on(StorageRoot::probe(temp.path())).is_empty());
    }

    #[test]
    fn test_invalid_names_rejected() {
        let temp = TempDir::new().unwrap();
        rt().block_on(async {
            let root = StorageRoot::open(temp.path()).await.unwrap().directory();
            for bad in ["", ".", "..", "a/b"] {
                assert!(matches!(
                    root.get_file_handle(bad, true).await,
                    Err(StorageError::InvalidName(_))
                ));
            }
        });
    }
}
