//! End-to-end check of the adapters against a live worker
//!
//! Runs a fixed open/write/read/delete scenario through [`BridgeVfs`] before
//! SQLite ever touches the VFS, so a broken protocol or storage root fails
//! installation instead of corrupting a database later.

use super::codec::Value;
use super::config::OpCode;
use super::vfs::BridgeVfs;
use crate::error::{BridgeError, Result};
use std::time::Instant;
use tracing::{debug, info, warn};

/// File the scenario creates and removes
pub const SANITY_FILE: &str = "sanity-check.db";

/// Content written and read back
pub const SANITY_TEXT: &str = "This is a string.";

fn fail(stage: &'static str, detail: impl Into<String>) -> BridgeError {
    BridgeError::SanityCheck {
        stage,
        detail: detail.into(),
    }
}

fn expect_ok(stage: &'static str, rc: i32, ok: i32) -> Result<()> {
    if rc != ok {
        return Err(fail(stage, format!("rc = {}", rc)));
    }
    debug!("sanity: {} ok", stage);
    Ok(())
}

/// Run the scenario; the first mismatch aborts with the failing stage
///
/// A [`SANITY_FILE`] already in the root fails the `xAccess before open`
/// stage unless `clear_leftover` allows removing it first.
pub fn run_sanity_check(vfs: &BridgeVfs, clear_leftover: bool) -> Result<()> {
    let started = Instant::now();
    let codes = vfs.runner().config().codes;

    if clear_leftover && vfs.x_access(SANITY_FILE)? {
        warn!("Removing {} left over from an earlier run", SANITY_FILE);
        vfs.x_delete(SANITY_FILE, 0)?;
    }
    if vfs.x_access(SANITY_FILE)? {
        return Err(fail("xAccess before open", "file already exists"));
    }

    let flags = codes.open_create | libsqlite3_sys::SQLITE_OPEN_READWRITE | codes.open_main_db;
    let opened = vfs.x_open(Some(SANITY_FILE), flags, 0)?;
    expect_ok("xOpen", opened.rc, codes.ok)?;
    let fid = opened.fid;

    let scenario = file_stages(vfs, fid);
    let closed = vfs.x_close(fid);
    scenario?;
    expect_ok("xClose", closed?, codes.ok)?;

    expect_ok("xDelete", vfs.x_delete(SANITY_FILE, 0)?, codes.ok)?;
    if vfs.x_access(SANITY_FILE)? {
        return Err(fail("xAccess after delete", "file still exists"));
    }

    let rc = vfs.runner().run(OpCode::Sleep, &[Value::from(10)])?;
    expect_ok("xSleep", rc, codes.ok)?;

    info!("Sanity check passed in {:?}", started.elapsed());
    Ok(())
}

/// Stages that need the file open; the caller closes it either way
fn file_stages(vfs: &BridgeVfs, fid: i32) -> Result<()> {
    let codes = vfs.runner().config().codes;
    let text = SANITY_TEXT.as_bytes();

    if !vfs.x_access(SANITY_FILE)? {
        return Err(fail("xAccess after open", "file does not exist"));
    }
    expect_ok("xWrite", vfs.x_write(fid, text, 0)?, codes.ok)?;
    expect_ok("xSync", vfs.x_sync(fid, 0)?, codes.ok)?;

    let (rc, size) = vfs.x_file_size(fid)?;
    expect_ok("xFileSize", rc, codes.ok)?;
    if size != text.len() as i64 {
        return Err(fail(
            "xFileSize",
            format!("expected {} bytes, got {}", text.len(), size),
        ));
    }

    let mut back = vec![0u8; text.len()];
    expect_ok("xRead", vfs.x_read(fid, &mut back, 0)?, codes.ok)?;
    if back != text {
        return Err(fail(
            "xRead",
            format!("read back {:?}", String::from_utf8_lossy(&back)),
        ));
    }
    Ok(())
}
