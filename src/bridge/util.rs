//! Convenience helpers over an installed bridge

use super::codec::Value;
use super::config::OpCode;
use super::vfs::{self, BridgeVfs};
use crate::error::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One node of [`BridgeUtil::tree_list`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeEntry {
    pub name: String,
    pub is_dir: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeEntry>,
}

/// Storage helpers that go through the worker like the VFS does
#[derive(Debug, Clone)]
pub struct BridgeUtil {
    vfs: Arc<BridgeVfs>,
    root: PathBuf,
}

impl BridgeUtil {
    pub fn new(vfs: Arc<BridgeVfs>, root: PathBuf) -> Self {
        BridgeUtil { vfs, root }
    }

    /// Create `dir` and any missing parents
    pub fn mkdir(&self, dir: &str) -> Result<bool> {
        let rc = self.vfs.runner().run(OpCode::Mkdir, &[Value::from(dir)])?;
        Ok(rc == self.vfs.runner().config().codes.ok)
    }

    /// Whether a file exists at `name`
    pub fn entry_exists(&self, name: &str) -> Result<bool> {
        self.vfs.x_access(name)
    }

    /// Remove `name`; directories need `recursive` unless empty
    pub fn unlink(&self, name: &str, recursive: bool) -> Result<bool> {
        let rc = self.vfs.runner().run(
            OpCode::Delete,
            &[Value::from(name), Value::from(0), Value::from(recursive)],
        )?;
        Ok(rc == self.vfs.runner().config().codes.ok)
    }

    pub fn random_filename(&self) -> String {
        vfs::random_filename()
    }

    /// Host directory backing the storage tree
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Listing of the storage tree, read straight from the host directory
    pub fn tree_list(&self) -> Result<TreeEntry> {
        Ok(TreeEntry {
            name: "/".to_string(),
            is_dir: true,
            children: list_dir(&self.root)?,
        })
    }
}

fn list_dir(path: &Path) -> Result<Vec<TreeEntry>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let is_dir = entry.file_type()?.is_dir();
        let children = if is_dir {
            list_dir(&entry.path())?
        } else {
            Vec::new()
        };
        out.push(TreeEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir,
            children,
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}
