//! Per-file methods
//!
//! Reads and writes move through the shared staging buffer: the client copies
//! write data in before signalling, and copies read data out once the worker
//! answers. Lock requests are filtered through a local shadow so only the
//! transitions into and out of "no lock" cost a round trip.

use super::vfs::status;
use super::BridgeVfs;
use crate::bridge::codec::Value;
use crate::bridge::config::OpCode;
use crate::error::Result;
use libsqlite3_sys as ffi;
use std::os::raw::{c_int, c_void};
use tracing::warn;

/// Sector size reported to SQLite
pub const SECTOR_SIZE: i32 = 4096;

/// SQLite's per-connection file object
#[repr(C)]
pub struct BridgeFile {
    /// Base sqlite3_file structure (MUST be first field)
    pub base: ffi::sqlite3_file,
    /// Descriptor id shared with the worker
    pub fid: i32,
    pub vfs: *const BridgeVfs,
}

pub(super) static IO_METHODS: ffi::sqlite3_io_methods = ffi::sqlite3_io_methods {
    iVersion: 1,
    xClose: Some(file_close),
    xRead: Some(file_read),
    xWrite: Some(file_write),
    xTruncate: Some(file_truncate),
    xSync: Some(file_sync),
    xFileSize: Some(file_file_size),
    xLock: Some(file_lock),
    xUnlock: Some(file_unlock),
    xCheckReservedLock: Some(file_check_reserved_lock),
    xFileControl: Some(file_file_control),
    xSectorSize: Some(file_sector_size),
    xDeviceCharacteristics: Some(file_device_characteristics),
    xShmMap: None,
    xShmLock: None,
    xShmBarrier: None,
    xShmUnmap: None,
    xFetch: None,
    xUnfetch: None,
};

impl BridgeVfs {
    /// Forget `fid` locally, then ask the worker to close it
    pub fn x_close(&self, fid: i32) -> Result<i32> {
        if self.remove_file(fid).is_none() {
            return Ok(self.codes().ok);
        }
        self.runner.run(OpCode::Close, &[Value::from(fid)])
    }

    /// Fill `dest` from `offset`; a short read zero-fills the tail
    pub fn x_read(&self, fid: i32, dest: &mut [u8], offset: i64) -> Result<i32> {
        let codes = self.codes();
        let n = dest.len();
        if self.file(fid).is_none() || !self.fits_buffer(OpCode::Read, n) {
            return Ok(codes.ioerr_read);
        }
        self.runner.call(
            OpCode::Read,
            &[Value::from(fid), Value::I64(n as i64), Value::I64(offset)],
            |_| {},
            |rc, reply| {
                if rc == codes.ok || rc == codes.ioerr_short_read {
                    dest.copy_from_slice(&reply.file_buffer()[..n]);
                }
                rc
            },
        )
    }

    pub fn x_write(&self, fid: i32, src: &[u8], offset: i64) -> Result<i32> {
        let codes = self.codes();
        let n = src.len();
        if self.file(fid).is_none() || !self.fits_buffer(OpCode::Write, n) {
            return Ok(codes.ioerr_write);
        }
        self.runner.call(
            OpCode::Write,
            &[Value::from(fid), Value::I64(n as i64), Value::I64(offset)],
            |view| view.file_buffer_mut()[..n].copy_from_slice(src),
            |rc, _| rc,
        )
    }

    pub fn x_sync(&self, fid: i32, _flags: i32) -> Result<i32> {
        self.runner.run(OpCode::Sync, &[Value::from(fid)])
    }

    pub fn x_truncate(&self, fid: i32, size: i64) -> Result<i32> {
        self.runner
            .run(OpCode::Truncate, &[Value::from(fid), Value::I64(size)])
    }

    /// Status and size; the size is 0 unless the status is OK
    pub fn x_file_size(&self, fid: i32) -> Result<(i32, i64)> {
        let codes = self.codes();
        self.runner
            .call(OpCode::FileSize, &[Value::from(fid)], |_| {}, |rc, reply| {
                if rc != codes.ok {
                    return (rc, 0);
                }
                match reply.results() {
                    Ok(Some(values)) => match values.first().and_then(Value::as_i64) {
                        Some(size) => (codes.ok, size),
                        None => (codes.ioerr, 0),
                    },
                    _ => (codes.ioerr, 0),
                }
            })
    }

    /// Acquire `lock_type`; only the first lock above NONE reaches the worker
    pub fn x_lock(&self, fid: i32, lock_type: i32) -> Result<i32> {
        let codes = self.codes();
        let Some(held) = self.lock_type(fid) else {
            return Ok(codes.ioerr_lock);
        };
        if held != codes.lock_none {
            self.set_lock_type(fid, lock_type);
            return Ok(codes.ok);
        }
        let rc = self
            .runner
            .run(OpCode::Lock, &[Value::from(fid), Value::from(lock_type)])?;
        if rc == codes.ok {
            self.set_lock_type(fid, lock_type);
        }
        Ok(rc)
    }

    /// Downgrade to `lock_type`; only dropping to NONE reaches the worker
    pub fn x_unlock(&self, fid: i32, lock_type: i32) -> Result<i32> {
        let codes = self.codes();
        let Some(held) = self.lock_type(fid) else {
            return Ok(codes.ioerr_unlock);
        };
        let mut rc = codes.ok;
        if lock_type == codes.lock_none && held != codes.lock_none {
            rc = self
                .runner
                .run(OpCode::Unlock, &[Value::from(fid), Value::from(lock_type)])?;
        }
        if rc == codes.ok {
            self.set_lock_type(fid, lock_type);
        }
        Ok(rc)
    }

    pub fn x_check_reserved_lock(&self, fid: i32) -> bool {
        self.lock_type(fid)
            .map(|held| held >= self.codes().lock_reserved)
            .unwrap_or(false)
    }

    /// No custom file controls are offered
    pub fn x_file_control(&self, _fid: i32, _op: i32) -> i32 {
        self.codes().notfound
    }

    pub fn x_device_characteristics(&self, _fid: i32) -> i32 {
        ffi::SQLITE_IOCAP_UNDELETABLE_WHEN_OPEN
    }

    pub fn x_sector_size(&self, _fid: i32) -> i32 {
        SECTOR_SIZE
    }

    fn fits_buffer(&self, op: OpCode, n: usize) -> bool {
        let max = self.runner.config().layout.file_buffer_size;
        if n > max {
            warn!("{}() of {} bytes exceeds the {} byte staging buffer", op, n, max);
            return false;
        }
        true
    }
}

unsafe fn file_parts<'a>(file: *mut ffi::sqlite3_file) -> Option<(&'a BridgeVfs, i32)> {
    let f = &*(file as *const BridgeFile);
    f.vfs.as_ref().map(|vfs| (vfs, f.fid))
}

// File I/O method implementations

unsafe extern "C" fn file_close(file: *mut ffi::sqlite3_file) -> c_int {
    match file_parts(file) {
        Some((vfs, fid)) => status(vfs.x_close(fid), "xClose"),
        None => ffi::SQLITE_IOERR_CLOSE,
    }
}

unsafe extern "C" fn file_read(
    file: *mut ffi::sqlite3_file,
    buf: *mut c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    let Some((vfs, fid)) = file_parts(file) else {
        return ffi::SQLITE_IOERR_READ;
    };
    if amt < 0 || offset < 0 {
        return ffi::SQLITE_IOERR_READ;
    }
    let dest = std::slice::from_raw_parts_mut(buf as *mut u8, amt as usize);
    match vfs.x_read(fid, dest, offset) {
        Ok(rc) => rc,
        Err(e) => {
            warn!("xRead failed: {}", e);
            ffi::SQLITE_IOERR_READ
        }
    }
}

unsafe extern "C" fn file_write(
    file: *mut ffi::sqlite3_file,
    buf: *const c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    let Some((vfs, fid)) = file_parts(file) else {
        return ffi::SQLITE_IOERR_WRITE;
    };
    if amt < 0 || offset < 0 {
        return ffi::SQLITE_IOERR_WRITE;
    }
    let src = std::slice::from_raw_parts(buf as *const u8, amt as usize);
    match vfs.x_write(fid, src, offset) {
        Ok(rc) => rc,
        Err(e) => {
            warn!("xWrite failed: {}", e);
            ffi::SQLITE_IOERR_WRITE
        }
    }
}

unsafe extern "C" fn file_truncate(
    file: *mut ffi::sqlite3_file,
    size: ffi::sqlite3_int64,
) -> c_int {
    match file_parts(file) {
        Some((vfs, fid)) => status(vfs.x_truncate(fid, size), "xTruncate"),
        None => ffi::SQLITE_IOERR_TRUNCATE,
    }
}

unsafe extern "C" fn file_sync(file: *mut ffi::sqlite3_file, flags: c_int) -> c_int {
    match file_parts(file) {
        Some((vfs, fid)) => status(vfs.x_sync(fid, flags), "xSync"),
        None => ffi::SQLITE_IOERR_FSYNC,
    }
}

unsafe extern "C" fn file_file_size(
    file: *mut ffi::sqlite3_file,
    p_size: *mut ffi::sqlite3_int64,
) -> c_int {
    let Some((vfs, fid)) = file_parts(file) else {
        return ffi::SQLITE_IOERR;
    };
    match vfs.x_file_size(fid) {
        Ok((rc, size)) => {
            *p_size = size;
            rc
        }
        Err(e) => {
            warn!("xFileSize failed: {}", e);
            ffi::SQLITE_IOERR
        }
    }
}

unsafe extern "C" fn file_lock(file: *mut ffi::sqlite3_file, lock_type: c_int) -> c_int {
    match file_parts(file) {
        Some((vfs, fid)) => status(vfs.x_lock(fid, lock_type), "xLock"),
        None => ffi::SQLITE_IOERR_LOCK,
    }
}

unsafe extern "C" fn file_unlock(file: *mut ffi::sqlite3_file, lock_type: c_int) -> c_int {
    match file_parts(file) {
        Some((vfs, fid)) => status(vfs.x_unlock(fid, lock_type), "xUnlock"),
        None => ffi::SQLITE_IOERR_UNLOCK,
    }
}

unsafe extern "C" fn file_check_reserved_lock(
    file: *mut ffi::sqlite3_file,
    p_res_out: *mut c_int,
) -> c_int {
    let Some((vfs, fid)) = file_parts(file) else {
        return ffi::SQLITE_IOERR;
    };
    *p_res_out = vfs.x_check_reserved_lock(fid) as c_int;
    ffi::SQLITE_OK
}

unsafe extern "C" fn file_file_control(
    file: *mut ffi::sqlite3_file,
    op: c_int,
    _p_arg: *mut c_void,
) -> c_int {
    match file_parts(file) {
        Some((vfs, fid)) => vfs.x_file_control(fid, op),
        None => ffi::SQLITE_NOTFOUND,
    }
}

unsafe extern "C" fn file_sector_size(file: *mut ffi::sqlite3_file) -> c_int {
    match file_parts(file) {
        Some((vfs, fid)) => vfs.x_sector_size(fid),
        None => SECTOR_SIZE,
    }
}

unsafe extern "C" fn file_device_characteristics(file: *mut ffi::sqlite3_file) -> c_int {
    match file_parts(file) {
        Some((vfs, fid)) => vfs.x_device_characteristics(fid),
        None => ffi::SQLITE_IOCAP_UNDELETABLE_WHEN_OPEN,
    }
}
