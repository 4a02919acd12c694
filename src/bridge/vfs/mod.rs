//! SQLite VFS backed by the async worker
//!
//! [`BridgeVfs`] is the client half of the bridge. Every adapter is a safe
//! method taking Rust values; the `extern "C"` callbacks registered with
//! SQLite only decode raw pointers and forward to those methods.
//!
//! Adapters return `Ok(rc)` for anything SQLite should see as a status code.
//! `Err` means the protocol itself broke (version mismatch, stopped worker,
//! codec failure); the callbacks turn that into `SQLITE_MISUSE`.

pub mod file;
pub mod vfs;

pub use file::BridgeFile;
pub use vfs::{random_filename, register_vfs, unregister_vfs, OpenOutcome, DEFAULT_VFS_NAME};

use super::config::ResultCodes;
use super::runner::OperationRunner;
use crate::error::{BridgeError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::CString;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Client-side record of one open file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFile {
    pub fid: i32,
    pub filename: String,
    pub flags: i32,
    pub read_only: bool,
    /// Shadow of the lock level SQLite believes it holds
    pub lock_type: i32,
}

/// Client VFS state shared by all connections using it
pub struct BridgeVfs {
    name: CString,
    runner: Arc<OperationRunner>,
    files: Mutex<HashMap<i32, ClientFile>>,
    next_fid: AtomicI32,
}

impl BridgeVfs {
    pub fn new(name: &str, runner: Arc<OperationRunner>) -> Result<Self> {
        let name = CString::new(name)
            .map_err(|e| BridgeError::Config(format!("Invalid VFS name: {}", e)))?;
        Ok(BridgeVfs {
            name,
            runner,
            files: Mutex::new(HashMap::new()),
            next_fid: AtomicI32::new(1),
        })
    }

    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or_default()
    }

    pub(crate) fn c_name(&self) -> &CString {
        &self.name
    }

    pub fn runner(&self) -> &Arc<OperationRunner> {
        &self.runner
    }

    pub(crate) fn codes(&self) -> ResultCodes {
        self.runner.config().codes
    }

    /// Snapshot of the client record for `fid`
    pub fn file(&self, fid: i32) -> Option<ClientFile> {
        self.files.lock().get(&fid).cloned()
    }

    pub fn open_file_count(&self) -> usize {
        self.files.lock().len()
    }

    fn allocate_fid(&self) -> i32 {
        self.next_fid.fetch_add(1, Ordering::Relaxed)
    }

    fn insert_file(&self, file: ClientFile) {
        self.files.lock().insert(file.fid, file);
    }

    fn remove_file(&self, fid: i32) -> Option<ClientFile> {
        self.files.lock().remove(&fid)
    }

    fn lock_type(&self, fid: i32) -> Option<i32> {
        self.files.lock().get(&fid).map(|f| f.lock_type)
    }

    fn set_lock_type(&self, fid: i32, lock_type: i32) {
        if let Some(f) = self.files.lock().get_mut(&fid) {
            f.lock_type = lock_type;
        }
    }
}

impl std::fmt::Debug for BridgeVfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeVfs")
            .field("name", &self.name)
            .field("open_files", &self.open_file_count())
            .finish_non_exhaustive()
    }
}
