//! Worker-side open-file table

use crate::bridge::storage::{DirectoryHandle, FileHandle, SyncAccessHandle};
use std::collections::{BTreeSet, HashMap};

/// Authoritative record of one open file
#[derive(Debug)]
pub struct WorkerFile {
    pub fid: i32,
    /// Resolved absolute name, e.g. `/dir/main.db`
    pub filename_abs: String,
    /// Leaf name inside `dir`
    pub filename_part: String,
    pub dir: DirectoryHandle,
    pub file: FileHandle,
    /// Acquired lazily on first I/O
    pub sync_handle: Option<SyncAccessHandle>,
    /// Lock level explicitly requested by SQLite, if any
    pub lock: Option<i32>,
    pub release_implicit_locks: bool,
    pub delete_on_close: bool,
    pub read_only: bool,
}

impl WorkerFile {
    /// Drop the sync handle, making the file available to other contexts
    pub fn release_handle(&mut self) -> bool {
        match self.sync_handle.take() {
            Some(handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }
}

/// Open files keyed by descriptor id, plus the implicit-lock set
#[derive(Debug, Default)]
pub struct FileRegistry {
    files: HashMap<i32, WorkerFile>,
    implicit_locks: BTreeSet<i32>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, file: WorkerFile) {
        self.implicit_locks.remove(&file.fid);
        self.files.insert(file.fid, file);
    }

    pub fn remove(&mut self, fid: i32) -> Option<WorkerFile> {
        self.implicit_locks.remove(&fid);
        self.files.remove(&fid)
    }

    pub fn get(&self, fid: i32) -> Option<&WorkerFile> {
        self.files.get(&fid)
    }

    pub fn get_mut(&mut self, fid: i32) -> Option<&mut WorkerFile> {
        self.files.get_mut(&fid)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn mark_implicit(&mut self, fid: i32) {
        self.implicit_locks.insert(fid);
    }

    pub fn clear_implicit(&mut self, fid: i32) -> bool {
        self.implicit_locks.remove(&fid)
    }

    pub fn has_implicit(&self, fid: i32) -> bool {
        self.implicit_locks.contains(&fid)
    }

    pub fn implicit_count(&self) -> usize {
        self.implicit_locks.len()
    }

    /// Release every implicitly held sync handle; returns the affected fids
    pub fn release_implicit_locks(&mut self) -> Vec<i32> {
        let fids: Vec<i32> = std::mem::take(&mut self.implicit_locks).into_iter().collect();
        for fid in &fids {
            if let Some(file) = self.files.get_mut(fid) {
                file.release_handle();
            }
        }
        fids
    }

    /// Release the implicit lock on `fid` if the file asked for eager release
    pub fn release_implicit_lock(&mut self, fid: i32) -> bool {
        let eager = self
            .files
            .get(&fid)
            .map(|f| f.release_implicit_locks)
            .unwrap_or(false);
        if eager && self.implicit_locks.remove(&fid) {
            if let Some(file) = self.files.get_mut(&fid) {
                return file.release_handle();
            }
        }
        false
    }

    /// Release implicit locks other descriptors hold on `filename_abs`
    pub fn release_implicit_for(&mut self, filename_abs: &str, except: i32) -> Vec<i32> {
        let holders: Vec<i32> = self
            .implicit_locks
            .iter()
            .copied()
            .filter(|fid| *fid != except)
            .filter(|fid| {
                self.files
                    .get(fid)
                    .map(|f| f.filename_abs == filename_abs)
                    .unwrap_or(false)
            })
            .collect();
        for fid in &holders {
            self.implicit_locks.remove(fid);
            if let Some(file) = self.files.get_mut(fid) {
                file.release_handle();
            }
        }
        holders
    }

    /// Close every handle, used when the worker shuts down
    pub fn release_all(&mut self) {
        self.implicit_locks.clear();
        for file in self.files.values_mut() {
            file.release_handle();
        }
    }
}
