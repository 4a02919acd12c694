//! Shared layout, operation table and constant mirrors
//!
//! Both sides of the bridge agree on three things before the first operation
//! is issued:
//!
//! - **Buffer layout**: the payload segment is a file-content staging buffer
//!   followed by the serialization region.
//! - **Operation table**: which control slot carries which operation.
//! - **Result codes**: the subset of SQLite constants the worker reports.
//!
//! All of it travels to the worker inside [`BridgeConfig`] during the
//! handshake and is never mutated afterwards.

use crate::error::{BridgeError, Result};
use libsqlite3_sys as ffi;
use std::time::Duration;

/// Size of the file-content staging buffer (largest single I/O chunk)
pub const FILE_BUFFER_SIZE: usize = 64 * 1024;

/// Longest pathname the VFS advertises to SQLite
pub const MAX_PATHNAME: usize = 1024;

/// Time the worker waits for a new operation before running housekeeping
pub const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(150);

/// Attempts made to acquire a busy sync access handle before giving up
pub const HANDLE_RETRY_ATTEMPTS: u32 = 6;

/// How long the installer waits for the worker to report it has loaded
pub const LOADED_TIMEOUT: Duration = Duration::from_secs(4);

/// Value of the `rc` slot while an operation is in flight
pub const RC_SENTINEL: i32 = -1;

/// Slot holding the pending opcode
pub const SLOT_WHICH_OP: usize = 0;
/// Slot holding the result code of the last operation
pub const SLOT_RC: usize = 1;
/// Slot the worker parks on between handle-acquisition attempts
pub const SLOT_RETRY: usize = 2;

const RESERVED_SLOTS: usize = 3;

/// Every operation the worker knows how to execute
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpCode {
    Access = 0,
    Close = 1,
    Delete = 2,
    DeleteNoWait = 3,
    FileSize = 4,
    Lock = 5,
    Open = 6,
    Read = 7,
    Sleep = 8,
    Sync = 9,
    Truncate = 10,
    Unlock = 11,
    Write = 12,
    Mkdir = 13,
    Shutdown = 14,
}

impl OpCode {
    pub const COUNT: usize = 15;

    /// All operations in slot-assignment order
    pub const ALL: [OpCode; OpCode::COUNT] = [
        OpCode::Access,
        OpCode::Close,
        OpCode::Delete,
        OpCode::DeleteNoWait,
        OpCode::FileSize,
        OpCode::Lock,
        OpCode::Open,
        OpCode::Read,
        OpCode::Sleep,
        OpCode::Sync,
        OpCode::Truncate,
        OpCode::Unlock,
        OpCode::Write,
        OpCode::Mkdir,
        OpCode::Shutdown,
    ];

    /// Name used in logs and metrics dumps
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Access => "xAccess",
            OpCode::Close => "xClose",
            OpCode::Delete => "xDelete",
            OpCode::DeleteNoWait => "xDeleteNoWait",
            OpCode::FileSize => "xFileSize",
            OpCode::Lock => "xLock",
            OpCode::Open => "xOpen",
            OpCode::Read => "xRead",
            OpCode::Sleep => "xSleep",
            OpCode::Sync => "xSync",
            OpCode::Truncate => "xTruncate",
            OpCode::Unlock => "xUnlock",
            OpCode::Write => "xWrite",
            OpCode::Mkdir => "mkdir",
            OpCode::Shutdown => "opfs-async-shutdown",
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Mapping of operations to control-slot indices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpTable {
    slots: [i32; OpCode::COUNT],
    control_len: usize,
}

impl OpTable {
    /// Assign slots in declaration order after the reserved slots
    pub fn new() -> Self {
        let mut slots = [0i32; OpCode::COUNT];
        for (i, op) in OpCode::ALL.iter().enumerate() {
            slots[*op as usize] = (RESERVED_SLOTS + i) as i32;
        }
        OpTable {
            slots,
            control_len: RESERVED_SLOTS + OpCode::COUNT,
        }
    }

    /// Number of 32-bit slots the control segment must have
    pub fn control_len(&self) -> usize {
        self.control_len
    }

    /// Slot index for an operation
    pub fn slot(&self, op: OpCode) -> usize {
        self.slots[op as usize] as usize
    }

    /// Value stored in `whichOp` to request `op`
    pub fn opcode(&self, op: OpCode) -> i32 {
        self.slots[op as usize]
    }

    /// Reverse lookup of a `whichOp` value
    pub fn op_for_slot(&self, value: i32) -> Option<OpCode> {
        OpCode::ALL
            .iter()
            .copied()
            .find(|op| self.slots[*op as usize] == value)
    }

    /// Check the table is complete and every slot is usable
    ///
    /// Slots must be unique, must not collide with the reserved slots and must
    /// lie inside the control segment.
    pub fn validate(&self) -> Result<()> {
        let mut seen = vec![false; self.control_len];
        for op in OpCode::ALL {
            let slot = self.slots[op as usize];
            if slot < RESERVED_SLOTS as i32 || slot as usize >= self.control_len {
                return Err(BridgeError::Protocol(format!(
                    "opcode {} has out-of-range slot {}",
                    op, slot
                )));
            }
            if std::mem::replace(&mut seen[slot as usize], true) {
                return Err(BridgeError::Protocol(format!(
                    "opcode {} shares slot {} with another operation",
                    op, slot
                )));
            }
        }
        Ok(())
    }
}

impl Default for OpTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte order used for fixed-width values in the serialization region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn native() -> Self {
        if cfg!(target_endian = "little") {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        }
    }

    pub fn put_i32(self, v: i32) -> [u8; 4] {
        match self {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        }
    }

    pub fn put_i64(self, v: i64) -> [u8; 8] {
        match self {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        }
    }

    pub fn put_f64(self, v: f64) -> [u8; 8] {
        match self {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        }
    }

    pub fn get_i32(self, b: [u8; 4]) -> i32 {
        match self {
            ByteOrder::Little => i32::from_le_bytes(b),
            ByteOrder::Big => i32::from_be_bytes(b),
        }
    }

    pub fn get_i64(self, b: [u8; 8]) -> i64 {
        match self {
            ByteOrder::Little => i64::from_le_bytes(b),
            ByteOrder::Big => i64::from_be_bytes(b),
        }
    }

    pub fn get_f64(self, b: [u8; 8]) -> f64 {
        match self {
            ByteOrder::Little => f64::from_le_bytes(b),
            ByteOrder::Big => f64::from_be_bytes(b),
        }
    }
}

/// Payload segment layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    /// Bytes reserved for file content at offset 0
    pub file_buffer_size: usize,
    /// Offset of the serialization region
    pub s11n_offset: usize,
    /// Size of the serialization region
    pub s11n_size: usize,
}

impl BufferLayout {
    /// Serialization region is twice the advertised max pathname
    pub fn new(file_buffer_size: usize, max_pathname: usize) -> Self {
        BufferLayout {
            file_buffer_size,
            s11n_offset: file_buffer_size,
            s11n_size: max_pathname * 2,
        }
    }

    pub fn total(&self) -> usize {
        self.s11n_offset + self.s11n_size
    }
}

impl Default for BufferLayout {
    fn default() -> Self {
        Self::new(FILE_BUFFER_SIZE, MAX_PATHNAME)
    }
}

/// SQLite constants the worker needs to report results
///
/// The worker never reaches into `libsqlite3_sys` itself; it only uses the
/// values shipped to it here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCodes {
    pub ok: i32,
    pub error: i32,
    pub busy: i32,
    pub notfound: i32,
    pub cantopen: i32,
    pub misuse: i32,
    pub ioerr: i32,
    pub ioerr_read: i32,
    pub ioerr_short_read: i32,
    pub ioerr_write: i32,
    pub ioerr_fsync: i32,
    pub ioerr_truncate: i32,
    pub ioerr_delete: i32,
    pub ioerr_delete_noent: i32,
    pub ioerr_lock: i32,
    pub ioerr_unlock: i32,
    pub ioerr_close: i32,
    pub lock_none: i32,
    pub lock_shared: i32,
    pub lock_reserved: i32,
    pub open_create: i32,
    pub open_readonly: i32,
    pub open_deleteonclose: i32,
    pub open_main_db: i32,
}

impl ResultCodes {
    pub fn from_sqlite() -> Self {
        ResultCodes {
            ok: ffi::SQLITE_OK,
            error: ffi::SQLITE_ERROR,
            busy: ffi::SQLITE_BUSY,
            notfound: ffi::SQLITE_NOTFOUND,
            cantopen: ffi::SQLITE_CANTOPEN,
            misuse: ffi::SQLITE_MISUSE,
            ioerr: ffi::SQLITE_IOERR,
            ioerr_read: ffi::SQLITE_IOERR_READ,
            ioerr_short_read: ffi::SQLITE_IOERR_SHORT_READ,
            ioerr_write: ffi::SQLITE_IOERR_WRITE,
            ioerr_fsync: ffi::SQLITE_IOERR_FSYNC,
            ioerr_truncate: ffi::SQLITE_IOERR_TRUNCATE,
            ioerr_delete: ffi::SQLITE_IOERR_DELETE,
            ioerr_delete_noent: ffi::SQLITE_IOERR_DELETE_NOENT,
            ioerr_lock: ffi::SQLITE_IOERR_LOCK,
            ioerr_unlock: ffi::SQLITE_IOERR_UNLOCK,
            ioerr_close: ffi::SQLITE_IOERR_CLOSE,
            lock_none: ffi::SQLITE_LOCK_NONE,
            lock_shared: ffi::SQLITE_LOCK_SHARED,
            lock_reserved: ffi::SQLITE_LOCK_RESERVED,
            open_create: ffi::SQLITE_OPEN_CREATE,
            open_readonly: ffi::SQLITE_OPEN_READONLY,
            open_deleteonclose: ffi::SQLITE_OPEN_DELETEONCLOSE,
            open_main_db: ffi::SQLITE_OPEN_MAIN_DB,
        }
    }
}

/// Bits forwarded to the worker alongside the open flags
pub mod open_hints {
    /// Release implicit locks as soon as each operation completes
    pub const UNLOCK_ASAP: i32 = 0x01;
    /// Best-effort unlink of the target before opening it
    pub const UNLINK_BEFORE_OPEN: i32 = 0x02;
}

/// URI parameter enabling eager implicit-lock release
pub const URI_UNLOCK_ASAP: &str = "opfs-unlock-asap";
/// URI parameter requesting an unlink before open
pub const URI_DELETE_BEFORE_OPEN: &str = "delete-before-open";

/// Everything both sides share once the handshake completes
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub layout: BufferLayout,
    pub ops: OpTable,
    pub codes: ResultCodes,
    pub byte_order: ByteOrder,
    pub max_pathname: usize,
    pub idle_wait: Duration,
    /// Highest diagnostic priority the worker serializes on failure (0 = none)
    pub exception_verbosity: u8,
    /// Log verbosity (0 = errors, 1 = warnings, 2 = info, 3 = debug)
    pub verbosity: u8,
    /// Treat every open as if `opfs-unlock-asap` was given
    pub default_unlock_asap: bool,
}

impl BridgeConfig {
    pub fn new() -> Self {
        BridgeConfig {
            layout: BufferLayout::default(),
            ops: OpTable::new(),
            codes: ResultCodes::from_sqlite(),
            byte_order: ByteOrder::native(),
            max_pathname: MAX_PATHNAME,
            idle_wait: DEFAULT_IDLE_WAIT,
            exception_verbosity: 1,
            verbosity: 1,
            default_unlock_asap: false,
        }
    }

    /// Backoff base between handle-acquisition attempts
    pub fn retry_base(&self) -> Duration {
        self.idle_wait * 2
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_table_is_deterministic_and_valid() {
        let a = OpTable::new();
        let b = OpTable::new();
        assert_eq!(a, b);
        a.validate().unwrap();
        assert_eq!(a.control_len(), RESERVED_SLOTS + OpCode::COUNT);
    }

    #[test]
    fn test_op_table_round_trips_every_opcode() {
        let table = OpTable::new();
        for op in OpCode::ALL {
            assert_eq!(table.op_for_slot(table.opcode(op)), Some(op));
            assert!(table.slot(op) >= RESERVED_SLOTS);
        }
        assert_eq!(table.op_for_slot(SLOT_RC as i32), None);
        assert_eq!(table.op_for_slot(0), None);
    }

    #[test]
    fn test_op_table_rejects_shared_slot() {
        let mut table = OpTable::new();
        table.slots[OpCode::Read as usize] = table.slots[OpCode::Write as usize];
        assert!(matches!(table.validate(), Err(BridgeError::Protocol(_))));
    }

    #[test]
    fn test_op_table_rejects_reserved_slot() {
        let mut table = OpTable::new();
        table.slots[OpCode::Open as usize] = SLOT_RC as i32;
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_layout_sizes() {
        let layout = BufferLayout::default();
        assert_eq!(layout.s11n_size, 2 * MAX_PATHNAME);
        assert_eq!(layout.total(), FILE_BUFFER_SIZE + 2 * MAX_PATHNAME);
    }

    #[test]
    fn test_byte_order_round_trip() {
        for order in [ByteOrder::Little, ByteOrder::Big] {
            assert_eq!(order.get_i64(order.put_i64(-42)), -42);
            assert_eq!(order.get_f64(order.put_f64(1.5)), 1.5);
            assert_eq!(order.get_i32(order.put_i32(7)), 7);
        }
    }
}
