//! VFS-level methods and registration with SQLite

use super::file::{BridgeFile, IO_METHODS};
use super::{BridgeVfs, ClientFile};
use crate::bridge::codec::Value;
use crate::bridge::config::{open_hints, OpCode, URI_DELETE_BEFORE_OPEN, URI_UNLOCK_ASAP};
use crate::error::{BridgeError, Result};
use chrono::Utc;
use libsqlite3_sys as ffi;
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Name the bridge registers under unless told otherwise
pub const DEFAULT_VFS_NAME: &str = "opfs";

/// Julian day number of the Unix epoch
const UNIX_EPOCH_JULIAN_DAY: f64 = 2440587.5;

/// Unix epoch as a Julian day in milliseconds
const UNIX_EPOCH_JULIAN_MS: i64 = 210_866_760_000_000;

const GENERATED_NAME_LEN: usize = 16;

/// Result of [`BridgeVfs::x_open`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOutcome {
    pub rc: i32,
    /// Descriptor id; only registered when `rc` is OK
    pub fid: i32,
    /// Name sent to the worker, generated when none was given
    pub filename: String,
    pub out_flags: i32,
}

/// Random alphanumeric name for files SQLite opens without one
pub fn random_filename() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_NAME_LEN)
        .map(char::from)
        .collect()
}

/// Current time as a fractional Julian day
pub fn x_current_time() -> f64 {
    UNIX_EPOCH_JULIAN_DAY + Utc::now().timestamp_millis() as f64 / 86_400_000.0
}

/// Current time as a Julian day in milliseconds
pub fn x_current_time_int64() -> i64 {
    UNIX_EPOCH_JULIAN_MS + Utc::now().timestamp_millis()
}

impl BridgeVfs {
    /// Open `name` (or a generated name) on the worker
    ///
    /// `hints` carries [`open_hints`] bits parsed from the URI.
    pub fn x_open(&self, name: Option<&str>, flags: i32, hints: i32) -> Result<OpenOutcome> {
        let codes = self.codes();
        let filename = match name {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => random_filename(),
        };
        let fid = self.allocate_fid();
        let read_only = flags & codes.open_create == 0 && flags & codes.open_readonly != 0;

        let rc = self.runner.run(
            OpCode::Open,
            &[
                Value::from(fid),
                Value::from(filename.as_str()),
                Value::from(flags),
                Value::from(hints),
            ],
        )?;
        if rc == codes.ok {
            self.insert_file(ClientFile {
                fid,
                filename: filename.clone(),
                flags,
                read_only,
                lock_type: codes.lock_none,
            });
        }
        Ok(OpenOutcome {
            rc,
            fid,
            filename,
            out_flags: if read_only {
                flags | codes.open_readonly
            } else {
                flags
            },
        })
    }

    /// Unlink `name`; parents are left alone
    pub fn x_delete(&self, name: &str, sync_dir: i32) -> Result<i32> {
        self.runner.run(
            OpCode::Delete,
            &[Value::from(name), Value::from(sync_dir), Value::from(false)],
        )
    }

    /// Whether `name` exists
    pub fn x_access(&self, name: &str) -> Result<bool> {
        let rc = self.runner.run(OpCode::Access, &[Value::from(name)])?;
        Ok(rc == self.codes().ok)
    }

    /// Copy `name` into `out` with a terminating NUL
    pub fn x_full_pathname(&self, name: &str, out: &mut [u8]) -> i32 {
        let bytes = name.as_bytes();
        if bytes.len() >= out.len() {
            return self.codes().cantopen;
        }
        out[..bytes.len()].copy_from_slice(bytes);
        out[bytes.len()] = 0;
        self.codes().ok
    }

    /// Last diagnostic reported by the worker
    pub fn x_get_last_error(&self) -> Option<String> {
        self.runner.last_error()
    }

    pub fn x_randomness(&self, out: &mut [u8]) -> usize {
        rand::thread_rng().fill_bytes(out);
        out.len()
    }

    pub fn x_sleep(&self, micros: i32) -> i32 {
        std::thread::sleep(Duration::from_micros(micros.max(0) as u64));
        micros
    }
}

/// Register `vfs` with SQLite, optionally as the default VFS
///
/// SQLite keeps a strong reference to `vfs` until [`unregister_vfs`].
pub fn register_vfs(vfs: Arc<BridgeVfs>, make_default: bool) -> Result<()> {
    // SAFETY: the name is a valid NUL-terminated string.
    let existing = unsafe { ffi::sqlite3_vfs_find(vfs.c_name().as_ptr()) };
    if !existing.is_null() {
        return Err(BridgeError::Config(format!(
            "VFS {} is already registered",
            vfs.name()
        )));
    }

    let mx_pathname = vfs.runner().config().max_pathname as c_int;
    let z_name = vfs.c_name().as_ptr();
    let app_data = Arc::into_raw(Arc::clone(&vfs)) as *mut c_void;

    let sqlite_vfs = Box::new(ffi::sqlite3_vfs {
        iVersion: 2,
        szOsFile: std::mem::size_of::<BridgeFile>() as c_int,
        mxPathname: mx_pathname,
        pNext: ptr::null_mut(),
        zName: z_name,
        pAppData: app_data,
        xOpen: Some(vfs_open),
        xDelete: Some(vfs_delete),
        xAccess: Some(vfs_access),
        xFullPathname: Some(vfs_full_pathname),
        xDlOpen: None,
        xDlError: None,
        xDlSym: None,
        xDlClose: None,
        xRandomness: Some(vfs_randomness),
        xSleep: Some(vfs_sleep),
        xCurrentTime: Some(vfs_current_time),
        xGetLastError: Some(vfs_get_last_error),
        xCurrentTimeInt64: Some(vfs_current_time_int64),
        xSetSystemCall: None,
        xGetSystemCall: None,
        xNextSystemCall: None,
    });
    let vfs_box_ptr = Box::into_raw(sqlite_vfs);

    // SAFETY: the struct and everything it points at stay alive until
    // unregister_vfs reclaims them.
    unsafe {
        let rc = ffi::sqlite3_vfs_register(vfs_box_ptr, make_default as c_int);
        if rc != ffi::SQLITE_OK {
            drop(Box::from_raw(vfs_box_ptr));
            drop(Arc::from_raw(app_data as *const BridgeVfs));
            return Err(BridgeError::VFSRegistrationFailed(rc));
        }
    }
    debug!("Registered VFS {}", vfs.name());
    Ok(())
}

/// Unregister the VFS called `name`; returns false if it was not ours or absent
pub fn unregister_vfs(name: &str) -> Result<bool> {
    let name = CString::new(name)
        .map_err(|e| BridgeError::Config(format!("Invalid VFS name: {}", e)))?;

    // SAFETY: only a VFS whose xOpen is ours is freed, and only after SQLite
    // has dropped it from its list.
    unsafe {
        let vfs_ptr = ffi::sqlite3_vfs_find(name.as_ptr());
        if vfs_ptr.is_null() {
            return Ok(false);
        }
        let ours = (*vfs_ptr).xOpen.map(|f| f as usize) == Some(vfs_open as usize);
        if !ours {
            return Ok(false);
        }

        let rc = ffi::sqlite3_vfs_unregister(vfs_ptr);
        if rc != ffi::SQLITE_OK {
            return Err(BridgeError::VFSRegistrationFailed(rc));
        }

        let app_data = (*vfs_ptr).pAppData;
        drop(Box::from_raw(vfs_ptr));
        if !app_data.is_null() {
            drop(Arc::from_raw(app_data as *const BridgeVfs));
        }
    }
    debug!("Unregistered VFS {}", name.to_string_lossy());
    Ok(true)
}

/// Map an adapter result onto a SQLite status
pub(super) fn status(result: Result<i32>, what: &str) -> c_int {
    match result {
        Ok(rc) => rc,
        Err(e) => {
            error!("{} failed: {}", what, e);
            ffi::SQLITE_MISUSE
        }
    }
}

unsafe fn bridge_vfs<'a>(vfs: *mut ffi::sqlite3_vfs) -> Option<&'a BridgeVfs> {
    if vfs.is_null() {
        return None;
    }
    ((*vfs).pAppData as *const BridgeVfs).as_ref()
}

unsafe fn uri_hints(z_name: *const c_char) -> i32 {
    let mut hints = 0;
    for (param, bit) in [
        (URI_UNLOCK_ASAP, open_hints::UNLOCK_ASAP),
        (URI_DELETE_BEFORE_OPEN, open_hints::UNLINK_BEFORE_OPEN),
    ] {
        let Ok(param) = CString::new(param) else {
            continue;
        };
        if ffi::sqlite3_uri_boolean(z_name, param.as_ptr(), 0) != 0 {
            hints |= bit;
        }
    }
    hints
}

// VFS callback functions

unsafe extern "C" fn vfs_open(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    file: *mut ffi::sqlite3_file,
    flags: c_int,
    p_out_flags: *mut c_int,
) -> c_int {
    let Some(bridge) = bridge_vfs(vfs) else {
        return ffi::SQLITE_ERROR;
    };
    // SQLite skips xClose when pMethods is null after a failed open.
    (*file).pMethods = ptr::null();

    let (name, hints) = if z_name.is_null() {
        (None, 0)
    } else {
        match CStr::from_ptr(z_name).to_str() {
            Ok(n) => (Some(n), uri_hints(z_name)),
            Err(_) => return ffi::SQLITE_CANTOPEN,
        }
    };

    match bridge.x_open(name, flags, hints) {
        Ok(outcome) if outcome.rc == ffi::SQLITE_OK => {
            let f = file as *mut BridgeFile;
            ptr::addr_of_mut!((*f).fid).write(outcome.fid);
            ptr::addr_of_mut!((*f).vfs).write(bridge as *const BridgeVfs);
            (*file).pMethods = &IO_METHODS;
            if !p_out_flags.is_null() {
                *p_out_flags = outcome.out_flags;
            }
            ffi::SQLITE_OK
        }
        Ok(outcome) => outcome.rc,
        Err(e) => {
            error!("xOpen failed: {}", e);
            ffi::SQLITE_MISUSE
        }
    }
}

unsafe extern "C" fn vfs_delete(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    sync_dir: c_int,
) -> c_int {
    let Some(bridge) = bridge_vfs(vfs) else {
        return ffi::SQLITE_ERROR;
    };
    if z_name.is_null() {
        return ffi::SQLITE_IOERR_DELETE;
    }
    match CStr::from_ptr(z_name).to_str() {
        Ok(name) => status(bridge.x_delete(name, sync_dir), "xDelete"),
        Err(_) => ffi::SQLITE_IOERR_DELETE,
    }
}

unsafe extern "C" fn vfs_access(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    _flags: c_int,
    p_res_out: *mut c_int,
) -> c_int {
    let Some(bridge) = bridge_vfs(vfs) else {
        return ffi::SQLITE_ERROR;
    };
    let name = match CStr::from_ptr(z_name).to_str() {
        Ok(n) => n,
        Err(_) => return ffi::SQLITE_ERROR,
    };
    match bridge.x_access(name) {
        Ok(exists) => {
            *p_res_out = exists as c_int;
            ffi::SQLITE_OK
        }
        Err(e) => {
            error!("xAccess failed: {}", e);
            ffi::SQLITE_MISUSE
        }
    }
}

unsafe extern "C" fn vfs_full_pathname(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    n_out: c_int,
    z_out: *mut c_char,
) -> c_int {
    let Some(bridge) = bridge_vfs(vfs) else {
        return ffi::SQLITE_ERROR;
    };
    let Ok(name) = CStr::from_ptr(z_name).to_str() else {
        return ffi::SQLITE_CANTOPEN;
    };
    let out = std::slice::from_raw_parts_mut(z_out as *mut u8, n_out.max(0) as usize);
    bridge.x_full_pathname(name, out)
}

unsafe extern "C" fn vfs_randomness(
    vfs: *mut ffi::sqlite3_vfs,
    n_byte: c_int,
    z_out: *mut c_char,
) -> c_int {
    let out = std::slice::from_raw_parts_mut(z_out as *mut u8, n_byte.max(0) as usize);
    match bridge_vfs(vfs) {
        Some(bridge) => bridge.x_randomness(out) as c_int,
        None => {
            rand::thread_rng().fill_bytes(out);
            n_byte
        }
    }
}

unsafe extern "C" fn vfs_sleep(vfs: *mut ffi::sqlite3_vfs, microseconds: c_int) -> c_int {
    match bridge_vfs(vfs) {
        Some(bridge) => bridge.x_sleep(microseconds),
        None => microseconds,
    }
}

unsafe extern "C" fn vfs_current_time(_vfs: *mut ffi::sqlite3_vfs, p_time_out: *mut f64) -> c_int {
    *p_time_out = x_current_time();
    ffi::SQLITE_OK
}

unsafe extern "C" fn vfs_current_time_int64(
    _vfs: *mut ffi::sqlite3_vfs,
    p_time_out: *mut ffi::sqlite3_int64,
) -> c_int {
    *p_time_out = x_current_time_int64();
    ffi::SQLITE_OK
}

unsafe extern "C" fn vfs_get_last_error(
    vfs: *mut ffi::sqlite3_vfs,
    n_byte: c_int,
    z_err_msg: *mut c_char,
) -> c_int {
    let Some(msg) = bridge_vfs(vfs).and_then(|b| b.x_get_last_error()) else {
        return 0;
    };
    if n_byte > 0 && !z_err_msg.is_null() {
        let out = std::slice::from_raw_parts_mut(z_err_msg as *mut u8, n_byte as usize);
        let len = msg.len().min(out.len() - 1);
        out[..len].copy_from_slice(&msg.as_bytes()[..len]);
        out[len] = 0;
    }
    0
}
