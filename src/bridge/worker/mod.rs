//! Worker-side execution engine
//!
//! Owns every real storage handle. Each operation posted through the control
//! segment is decoded, executed against the async storage API and answered by
//! writing the result code into the `rc` slot. [`AsyncEngine::dispatch`] is the
//! only place that signals the client, and it signals exactly once per
//! operation whatever the handler did.
//!
//! Per-file state machine:
//!
//! ```text
//! Closed --open--> Open(no handle) --first I/O or lock--> Open(handle)
//!                        ^                                     |
//!                        +---- unlock to NONE / idle sweep ----+
//! Open(*) --close--> Closed
//! ```

mod registry;
mod retry;

pub use registry::{FileRegistry, WorkerFile};
pub use retry::{acquire_with_retry, Backoff, RetryExhausted, RetryPolicy, SlotBackoff};

use super::codec::{Codec, Value};
use super::config::{
    open_hints, OpCode, ResultCodes, HANDLE_RETRY_ATTEMPTS, SLOT_RC, SLOT_WHICH_OP,
};
use super::handshake::{ClientMessage, WorkerMessage};
use super::metrics::{Metrics, MetricsSnapshot};
use super::shared::{SharedState, WaitOutcome};
use super::storage::{DirectoryHandle, StorageError, StorageResult};
use crate::error::{BridgeError, Result};
use crossbeam::channel::{Receiver, Sender, TryRecvError};
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// `sync_dir` value asking `delete_no_wait` to also remove emptied parents
pub const CASCADE_DELETE: i32 = 0x1234;

/// Leaf name used to create a directory chain
const MKDIR_SENTINEL: &str = "--opfs-mkdir-sentinel";

/// Split a name into resolved path segments, honoring `.` and `..`
pub fn resolve_path(name: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for seg in name.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            s => out.push(s.to_string()),
        }
    }
    out
}

/// Why a sync handle could not be obtained
#[derive(Debug)]
enum HandleError {
    NoSuchFile(i32),
    Exhausted(RetryExhausted<StorageError>),
}

impl Display for HandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandleError::NoSuchFile(fid) => write!(f, "no open file with id {}", fid),
            HandleError::Exhausted(e) => write!(
                f,
                "{} attempts to get a sync handle failed: {}",
                e.attempts, e.last
            ),
        }
    }
}

/// Decoded operation arguments
struct Args {
    op: OpCode,
    values: Vec<Value>,
}

impl Args {
    fn get(&self, i: usize) -> Result<&Value> {
        self.values.get(i).ok_or_else(|| {
            BridgeError::Protocol(format!("{} expects argument #{}", self.op, i))
        })
    }

    fn i64(&self, i: usize) -> Result<i64> {
        let v = self.get(i)?;
        v.as_i64().ok_or_else(|| {
            BridgeError::Protocol(format!("{} argument #{} is not an integer: {:?}", self.op, i, v))
        })
    }

    fn i32(&self, i: usize) -> Result<i32> {
        let v = self.i64(i)?;
        i32::try_from(v).map_err(|_| {
            BridgeError::Protocol(format!("{} argument #{} out of range: {}", self.op, i, v))
        })
    }

    fn str(&self, i: usize) -> Result<&str> {
        let v = self.get(i)?;
        v.as_str().ok_or_else(|| {
            BridgeError::Protocol(format!("{} argument #{} is not a string: {:?}", self.op, i, v))
        })
    }

    fn i32_or(&self, i: usize, default: i32) -> Result<i32> {
        if i < self.values.len() {
            self.i32(i)
        } else {
            Ok(default)
        }
    }

    fn bool_or(&self, i: usize, default: bool) -> Result<bool> {
        match self.values.get(i) {
            None => Ok(default),
            Some(v) => v.as_bool().ok_or_else(|| {
                BridgeError::Protocol(format!(
                    "{} argument #{} is not a boolean: {:?}",
                    self.op, i, v
                ))
            }),
        }
    }
}

/// Async execution engine
pub struct AsyncEngine {
    shared: Arc<SharedState>,
    root: DirectoryHandle,
    registry: FileRegistry,
    codec: Codec,
    metrics: Metrics,
    backoff: Box<dyn Backoff>,
    shutdown: bool,
}

impl AsyncEngine {
    /// Build an engine over `root`; the op table must validate
    pub fn new(shared: Arc<SharedState>, root: DirectoryHandle) -> Result<Self> {
        let backoff = Box::new(SlotBackoff::new(Arc::clone(&shared)));
        Self::with_backoff(shared, root, backoff)
    }

    pub fn with_backoff(
        shared: Arc<SharedState>,
        root: DirectoryHandle,
        backoff: Box<dyn Backoff>,
    ) -> Result<Self> {
        shared.config.ops.validate()?;
        if shared.control.len() < shared.config.ops.control_len() {
            return Err(BridgeError::Protocol(format!(
                "control segment has {} slots, op table needs {}",
                shared.control.len(),
                shared.config.ops.control_len()
            )));
        }
        let codec = Codec::new(shared.config.byte_order);
        Ok(AsyncEngine {
            shared,
            root,
            registry: FileRegistry::new(),
            codec,
            metrics: Metrics::new(),
            backoff,
            shutdown: false,
        })
    }

    fn codes(&self) -> ResultCodes {
        self.shared.config.codes
    }

    pub fn registry(&self) -> &FileRegistry {
        &self.registry
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown = true;
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&mut self) {
        self.metrics.reset();
    }

    /// Wait for operations until shutdown is requested
    ///
    /// Messages from the client are polled between operations. Each idle
    /// timeout releases every implicitly held sync handle.
    pub fn wait_loop(
        &mut self,
        rt: &tokio::runtime::Runtime,
        inbox: &Receiver<ClientMessage>,
        outbox: &Sender<WorkerMessage>,
    ) {
        self.shutdown = false;
        let shared = Arc::clone(&self.shared);
        let idle = shared.config.idle_wait;
        let mut idle_since = Instant::now();
        info!("Worker wait loop started");

        while !self.shutdown {
            self.poll_messages(inbox, outbox);
            if self.shutdown {
                break;
            }

            let outcome = shared.control.wait(SLOT_WHICH_OP, 0, Some(idle));
            let opcode = shared.control.load(SLOT_WHICH_OP);
            if opcode == 0 {
                if outcome == WaitOutcome::TimedOut {
                    self.release_implicit_locks();
                }
                continue;
            }
            shared.control.store(SLOT_WHICH_OP, 0);
            rt.block_on(self.dispatch(opcode, idle_since.elapsed()));
            idle_since = Instant::now();
        }

        info!("Worker wait loop stopped");
    }

    /// Drain client messages until the inbox is empty or a shutdown arrives
    ///
    /// Anything queued behind a shutdown (typically a restart) stays in the
    /// inbox for the worker's outer loop.
    fn poll_messages(&mut self, inbox: &Receiver<ClientMessage>, outbox: &Sender<WorkerMessage>) {
        loop {
            match inbox.try_recv() {
                Ok(ClientMessage::Shutdown) => {
                    info!("Shutdown requested");
                    self.shutdown = true;
                    break;
                }
                Ok(ClientMessage::Restart) => {
                    debug!("Ignoring restart: wait loop is already running");
                }
                Ok(ClientMessage::MetricsRequest { reset }) => {
                    let _ = outbox.send(WorkerMessage::Metrics(self.metrics.snapshot()));
                    if reset {
                        self.metrics.reset();
                    }
                }
                Ok(ClientMessage::Init(_)) => {
                    warn!("Ignoring init: worker is already initialized");
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    info!("Client channel closed, stopping");
                    self.shutdown = true;
                    break;
                }
            }
        }
    }

    /// Release sync handles held only because I/O needed them
    pub fn release_implicit_locks(&mut self) -> usize {
        let released = self.registry.release_implicit_locks();
        if self.shared.config.verbosity >= 3 {
            for fid in &released {
                debug!("Auto-unlocked fid {}", fid);
            }
        }
        released.len()
    }

    /// Close every handle; the worker is going away
    pub fn release_all(&mut self) {
        self.registry.release_all();
    }

    /// Execute the operation requested by `opcode` and signal the result
    pub async fn dispatch(&mut self, opcode: i32, waited: Duration) {
        let Some(op) = self.shared.config.ops.op_for_slot(opcode) else {
            error!("No handler for opcode {}", opcode);
            self.store_and_notify(self.codes().misuse);
            return;
        };

        let started = Instant::now();
        let decoded = {
            let mut view = self.shared.payload.lock();
            self.codec
                .deserialize_timed(&mut self.metrics, view.s11n_mut(), true)
        };

        let rc = match decoded {
            Ok(values) => {
                let args = Args {
                    op,
                    values: values.unwrap_or_default(),
                };
                if self.shared.config.verbosity >= 3 {
                    debug!("{}({:?})", op, args.values);
                }
                match self.execute(&args).await {
                    Ok(rc) => rc,
                    Err(e) => {
                        error!("{} failed: {}", op, e);
                        self.store_exception(1, "ProtocolError", &e);
                        self.codes().misuse
                    }
                }
            }
            Err(e) => {
                error!("Cannot decode arguments for {}: {}", op, e);
                self.codes().misuse
            }
        };

        self.metrics.record_call(op);
        self.metrics.record_wait(op, waited);
        self.metrics.record_time(op, started.elapsed());
        self.store_and_notify(rc);
    }

    fn store_and_notify(&self, rc: i32) {
        self.shared.control.store(SLOT_RC, rc);
        self.shared.control.notify(SLOT_RC);
    }

    /// Serialize a diagnostic if `priority` is within the configured verbosity
    fn store_exception(&mut self, priority: u8, name: &str, detail: &dyn Display) {
        let threshold = self.shared.config.exception_verbosity;
        if threshold == 0 || priority > threshold {
            return;
        }
        let msg = Value::Str(format!("{}: {}", name, detail));
        let mut view = self.shared.payload.lock();
        if let Err(e) = self
            .codec
            .serialize_timed(&mut self.metrics, view.s11n_mut(), &[msg])
        {
            warn!("Could not serialize diagnostic: {}", e);
        }
    }

    fn store_storage_exception(&mut self, priority: u8, err: &StorageError) {
        self.store_exception(priority, err.name(), err);
    }

    async fn execute(&mut self, args: &Args) -> Result<i32> {
        Ok(match args.op {
            OpCode::Access => self.access(args.str(0)?).await,
            OpCode::Close => self.close(args.i32(0)?).await,
            OpCode::Delete => {
                self.delete(args.str(0)?, args.i32_or(1, 0)?, args.bool_or(2, false)?)
                    .await
            }
            OpCode::DeleteNoWait => {
                self.delete_no_wait(args.str(0)?, args.i32_or(1, 0)?, args.bool_or(2, false)?)
                    .await
            }
            OpCode::FileSize => self.file_size(args.i32(0)?).await,
            OpCode::Lock => self.lock(args.i32(0)?, args.i32(1)?).await,
            OpCode::Open => {
                self.open(args.i32(0)?, args.str(1)?, args.i32(2)?, args.i32_or(3, 0)?)
                    .await
            }
            OpCode::Read => self.read(args.i32(0)?, args.i64(1)?, args.i64(2)?).await,
            OpCode::Sleep => self.sleep(args.i64(0)?).await,
            OpCode::Sync => self.sync(args.i32(0)?).await,
            OpCode::Truncate => self.truncate(args.i32(0)?, args.i64(1)?).await,
            OpCode::Unlock => self.unlock(args.i32(0)?, args.i32(1)?).await,
            OpCode::Write => self.write(args.i32(0)?, args.i64(1)?, args.i64(2)?).await,
            OpCode::Mkdir => self.mkdir(args.str(0)?).await,
            OpCode::Shutdown => {
                self.shutdown = true;
                self.codes().ok
            }
        })
    }

    /// Walk to the parent directory of `filename`, optionally creating it
    pub async fn directory_for_filename(
        &self,
        filename: &str,
        create_dirs: bool,
    ) -> StorageResult<(DirectoryHandle, String)> {
        let mut segments = resolve_path(filename);
        let leaf = segments.pop().unwrap_or_default();
        let mut dir = self.root.clone();
        for seg in &segments {
            dir = dir.get_directory_handle(seg, create_dirs).await?;
        }
        Ok((dir, leaf))
    }

    /// Acquire the sync handle for `fid` if it is not already held
    async fn get_sync_handle(&mut self, fid: i32, op: OpCode) -> std::result::Result<(), HandleError> {
        let (file, name) = match self.registry.get(fid) {
            Some(f) if f.sync_handle.is_some() => return Ok(()),
            Some(f) => (f.file.clone(), f.filename_abs.clone()),
            None => return Err(HandleError::NoSuchFile(fid)),
        };

        // Another descriptor of ours may be sitting on the same file.
        for other in self.registry.release_implicit_for(&name, fid) {
            debug!("Released implicit lock of fid {} for fid {}", other, fid);
        }

        let started = Instant::now();
        let policy = RetryPolicy {
            attempts: HANDLE_RETRY_ATTEMPTS,
            base: self.shared.config.retry_base(),
        };
        let what = format!("{}() sync handle for {}", op, name);
        let handle = acquire_with_retry(policy, self.backoff.as_mut(), &what, || {
            let file = file.clone();
            async move { file.create_sync_access_handle().await }
        })
        .await
        .map_err(HandleError::Exhausted)?;

        let f = self
            .registry
            .get_mut(fid)
            .ok_or(HandleError::NoSuchFile(fid))?;
        f.sync_handle = Some(handle);
        let implicit = f.lock.is_none();
        if implicit {
            self.registry.mark_implicit(fid);
        }
        if self.shared.config.verbosity >= 3 {
            debug!(
                "Got {}() sync handle for {} in {:?}{}",
                op,
                name,
                started.elapsed(),
                if implicit { " (implicit lock)" } else { "" }
            );
        }
        Ok(())
    }

    /// Map a handle failure to a result code, recording the diagnostic
    fn handle_failure(&mut self, err: HandleError, default_rc: i32) -> i32 {
        let busy = matches!(
            &err,
            HandleError::Exhausted(RetryExhausted {
                last: StorageError::NoModificationAllowed(_),
                ..
            })
        );
        self.store_exception(1, "GetSyncHandleError", &err);
        if busy {
            self.codes().busy
        } else {
            default_rc
        }
    }

    fn release_implicit_lock(&mut self, fid: i32) {
        if self.registry.release_implicit_lock(fid) && self.shared.config.verbosity >= 3 {
            debug!("Released implicit lock of fid {} after operation", fid);
        }
    }

    async fn open(&mut self, fid: i32, filename: &str, flags: i32, hints: i32) -> i32 {
        let codes = self.codes();
        let create = flags & codes.open_create != 0;

        if hints & open_hints::UNLINK_BEFORE_OPEN != 0 {
            let rc = self.delete_no_wait(filename, 0, false).await;
            debug!("delete-before-open of {} returned {}", filename, rc);
        }

        let (dir, part) = match self.directory_for_filename(filename, create).await {
            Ok(found) => found,
            Err(e) => {
                self.store_storage_exception(1, &e);
                return codes.cantopen;
            }
        };

        let file = match dir.get_file_handle(&part, create).await {
            Ok(file) => file,
            Err(e) => {
                self.store_storage_exception(1, &e);
                return match e {
                    StorageError::NotFound(_)
                    | StorageError::TypeMismatch(_)
                    | StorageError::InvalidName(_) => codes.cantopen,
                    _ => codes.ioerr,
                };
            }
        };

        let filename_abs = format!("/{}", resolve_path(filename).join("/"));
        let record = WorkerFile {
            fid,
            filename_abs,
            filename_part: part,
            dir,
            file,
            sync_handle: None,
            lock: None,
            release_implicit_locks: hints & open_hints::UNLOCK_ASAP != 0
                || self.shared.config.default_unlock_asap,
            delete_on_close: flags & codes.open_deleteonclose != 0,
            read_only: !create && flags & codes.open_readonly != 0,
        };
        if let Some(mut stale) = self.registry.remove(fid) {
            warn!("fid {} reopened without close ({})", fid, stale.filename_abs);
            stale.release_handle();
        }
        self.registry.insert(record);
        codes.ok
    }

    async fn close(&mut self, fid: i32) -> i32 {
        let codes = self.codes();
        let Some(mut file) = self.registry.remove(fid) else {
            let mut view = self.shared.payload.lock();
            let _ = self.codec.serialize(view.s11n_mut(), &[]);
            return codes.notfound;
        };

        file.release_handle();
        if file.delete_on_close {
            let rc = self
                .delete_no_wait(&file.filename_abs, CASCADE_DELETE, false)
                .await;
            if rc != codes.ok {
                warn!(
                    "Ignoring delete-on-close failure of {} (rc {})",
                    file.filename_abs, rc
                );
            }
        }
        codes.ok
    }

    /// `delete_no_wait` followed by the protocol signal in `dispatch`
    async fn delete(&mut self, filename: &str, sync_dir: i32, recursive: bool) -> i32 {
        self.delete_no_wait(filename, sync_dir, recursive).await
    }

    /// Remove `filename`; with [`CASCADE_DELETE`], also remove parents left empty
    pub async fn delete_no_wait(&mut self, filename: &str, sync_dir: i32, recursive: bool) -> i32 {
        let codes = self.codes();
        let mut segments = resolve_path(filename);
        let mut recursive = recursive;
        let mut first = true;

        while !segments.is_empty() {
            let path = segments.join("/");
            let (dir, part) = match self.directory_for_filename(&path, false).await {
                Ok(found) => found,
                Err(e) if first => {
                    self.store_storage_exception(2, &e);
                    return if e.is_not_found() {
                        codes.ioerr_delete_noent
                    } else {
                        codes.ioerr_delete
                    };
                }
                Err(_) => break,
            };

            if first {
                let abs = format!("/{}", path);
                self.registry.release_implicit_for(&abs, i32::MIN);
            }

            if let Err(e) = dir.remove_entry(&part, recursive).await {
                if !first {
                    // Parent still has entries or is gone; the walk ends here.
                    break;
                }
                self.store_storage_exception(2, &e);
                return if e.is_not_found() {
                    codes.ioerr_delete_noent
                } else {
                    codes.ioerr_delete
                };
            }

            if sync_dir != CASCADE_DELETE {
                break;
            }
            first = false;
            recursive = false;
            segments.pop();
        }
        codes.ok
    }

    async fn access(&mut self, filename: &str) -> i32 {
        let found = match self.directory_for_filename(filename, false).await {
            Ok((dir, part)) => dir.get_file_handle(&part, false).await.map(|_| ()),
            Err(e) => Err(e),
        };
        match found {
            Ok(()) => self.codes().ok,
            Err(e) => {
                self.store_storage_exception(2, &e);
                self.codes().ioerr
            }
        }
    }

    async fn file_size(&mut self, fid: i32) -> i32 {
        let codes = self.codes();
        let rc = match self.get_sync_handle(fid, OpCode::FileSize).await {
            Err(e) => self.handle_failure(e, codes.ioerr),
            Ok(()) => {
                let size = self
                    .registry
                    .get_mut(fid)
                    .and_then(|f| f.sync_handle.as_mut())
                    .map(|h| h.get_size());
                match size {
                    Some(Ok(size)) => {
                        let mut view = self.shared.payload.lock();
                        match self.codec.serialize_timed(
                            &mut self.metrics,
                            view.s11n_mut(),
                            &[Value::I64(size as i64)],
                        ) {
                            Ok(()) => codes.ok,
                            Err(e) => {
                                error!("Cannot serialize file size: {}", e);
                                codes.ioerr
                            }
                        }
                    }
                    Some(Err(e)) => {
                        self.store_storage_exception(1, &e);
                        codes.ioerr
                    }
                    None => codes.ioerr,
                }
            }
        };
        self.release_implicit_lock(fid);
        rc
    }

    async fn lock(&mut self, fid: i32, lock_type: i32) -> i32 {
        let codes = self.codes();
        let Some(file) = self.registry.get_mut(fid) else {
            self.store_exception(1, "NotFoundError", &format!("no open file with id {}", fid));
            return codes.ioerr_lock;
        };
        let previous = file.lock.replace(lock_type);
        if file.sync_handle.is_some() {
            self.registry.clear_implicit(fid);
            return codes.ok;
        }

        match self.get_sync_handle(fid, OpCode::Lock).await {
            Ok(()) => {
                self.registry.clear_implicit(fid);
                codes.ok
            }
            Err(e) => {
                if let Some(file) = self.registry.get_mut(fid) {
                    file.lock = previous;
                }
                self.handle_failure(e, codes.ioerr_lock)
            }
        }
    }

    async fn unlock(&mut self, fid: i32, lock_type: i32) -> i32 {
        let codes = self.codes();
        let Some(file) = self.registry.get_mut(fid) else {
            self.store_exception(1, "NotFoundError", &format!("no open file with id {}", fid));
            return codes.ioerr_unlock;
        };
        if lock_type == codes.lock_none {
            file.lock = None;
            file.release_handle();
            self.registry.clear_implicit(fid);
        } else {
            file.lock = Some(lock_type);
        }
        codes.ok
    }

    async fn read(&mut self, fid: i32, n: i64, offset: i64) -> i32 {
        let codes = self.codes();
        let n = match self.chunk_len(n, offset, codes.ioerr_read) {
            Ok(n) => n,
            Err(rc) => return rc,
        };
        let rc = match self.get_sync_handle(fid, OpCode::Read).await {
            Err(e) => self.handle_failure(e, codes.ioerr_read),
            Ok(()) => {
                let mut view = self.shared.payload.lock();
                let dest = &mut view.file_buffer_mut()[..n];
                let handle = self
                    .registry
                    .get_mut(fid)
                    .and_then(|f| f.sync_handle.as_mut());
                match handle.map(|h| h.read(dest, offset as u64)) {
                    Some(Ok(read)) if read < n => {
                        view.file_buffer_mut()[read..n].fill(0);
                        codes.ioerr_short_read
                    }
                    Some(Ok(_)) => codes.ok,
                    Some(Err(e)) => {
                        drop(view);
                        error!("xRead() failed for fid {}: {}", fid, e);
                        self.store_storage_exception(1, &e);
                        codes.ioerr_read
                    }
                    None => codes.ioerr_read,
                }
            }
        };
        self.release_implicit_lock(fid);
        rc
    }

    async fn write(&mut self, fid: i32, n: i64, offset: i64) -> i32 {
        let codes = self.codes();
        let n = match self.chunk_len(n, offset, codes.ioerr_write) {
            Ok(n) => n,
            Err(rc) => return rc,
        };
        if let Some(rc) = self.reject_read_only(fid, codes.ioerr_write) {
            return rc;
        }
        let rc = match self.get_sync_handle(fid, OpCode::Write).await {
            Err(e) => self.handle_failure(e, codes.ioerr_write),
            Ok(()) => {
                let view = self.shared.payload.lock();
                let src = &view.file_buffer()[..n];
                let handle = self
                    .registry
                    .get_mut(fid)
                    .and_then(|f| f.sync_handle.as_mut());
                match handle.map(|h| h.write(src, offset as u64)) {
                    Some(Ok(written)) if written == n => codes.ok,
                    Some(Ok(_)) | None => codes.ioerr_write,
                    Some(Err(e)) => {
                        drop(view);
                        error!("xWrite() failed for fid {}: {}", fid, e);
                        self.store_storage_exception(1, &e);
                        codes.ioerr_write
                    }
                }
            }
        };
        self.release_implicit_lock(fid);
        rc
    }

    async fn sync(&mut self, fid: i32) -> i32 {
        let codes = self.codes();
        let flushed = self.registry.get_mut(fid).map(|f| {
            if f.read_only {
                None
            } else {
                f.sync_handle.as_mut().map(|h| h.flush())
            }
        });
        match flushed {
            None => {
                self.store_exception(1, "NotFoundError", &format!("no open file with id {}", fid));
                codes.ioerr_fsync
            }
            Some(Some(Err(e))) => {
                self.store_storage_exception(2, &e);
                codes.ioerr_fsync
            }
            _ => codes.ok,
        }
    }

    async fn truncate(&mut self, fid: i32, size: i64) -> i32 {
        let codes = self.codes();
        if size < 0 {
            self.store_exception(1, "RangeError", &format!("negative size {}", size));
            return codes.ioerr_truncate;
        }
        if let Some(rc) = self.reject_read_only(fid, codes.ioerr_truncate) {
            return rc;
        }
        let rc = match self.get_sync_handle(fid, OpCode::Truncate).await {
            Err(e) => self.handle_failure(e, codes.ioerr_truncate),
            Ok(()) => {
                let result = self
                    .registry
                    .get_mut(fid)
                    .and_then(|f| f.sync_handle.as_mut())
                    .map(|h| h.truncate(size as u64));
                match result {
                    Some(Ok(())) => codes.ok,
                    Some(Err(e)) => {
                        error!("xTruncate() failed for fid {}: {}", fid, e);
                        self.store_storage_exception(2, &e);
                        codes.ioerr_truncate
                    }
                    None => codes.ioerr_truncate,
                }
            }
        };
        self.release_implicit_lock(fid);
        rc
    }

    async fn sleep(&mut self, ms: i64) -> i32 {
        tokio::time::sleep(Duration::from_millis(ms.max(0) as u64)).await;
        self.codes().ok
    }

    async fn mkdir(&mut self, dirname: &str) -> i32 {
        let sentinel = format!("{}/{}", dirname, MKDIR_SENTINEL);
        match self.directory_for_filename(&sentinel, true).await {
            Ok(_) => self.codes().ok,
            Err(e) => {
                self.store_storage_exception(2, &e);
                self.codes().ioerr
            }
        }
    }

    /// Validate a read/write chunk against the staging buffer
    fn chunk_len(&mut self, n: i64, offset: i64, rc: i32) -> std::result::Result<usize, i32> {
        let max = self.shared.config.layout.file_buffer_size;
        if n < 0 || offset < 0 || n as usize > max {
            self.store_exception(
                1,
                "RangeError",
                &format!("chunk of {} bytes at {} (buffer holds {})", n, offset, max),
            );
            return Err(rc);
        }
        Ok(n as usize)
    }

    fn reject_read_only(&mut self, fid: i32, rc: i32) -> Option<i32> {
        let read_only = self.registry.get(fid).map(|f| f.read_only)?;
        if read_only {
            self.store_exception(1, "ReadOnlyError", &format!("fid {} is read-only", fid));
            return Some(rc);
        }
        None
    }
}
