//! # opfs-bridge - Synchronous SQLite VFS over an asynchronous storage worker
//!
//! SQLite calls its VFS synchronously and expects an answer before the call
//! returns. This crate serves those calls from a storage API that is only
//! usable asynchronously, from a dedicated worker thread:
//!
//! - **Shared control protocol**: one operation in flight, posted through an
//!   atomic `whichOp` slot and answered through an `rc` slot
//! - **Compact codec** for arguments and results in a shared payload region
//! - **Worker engine** with per-file sync access handles, implicit locks
//!   released when idle, and bounded retry on contended handles
//! - **Lifecycle handshake** with a loaded watchdog and an optional sanity check
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use opfs_bridge::{BridgeBuilder, Result};
//!
//! # fn main() -> Result<()> {
//! let bridge = BridgeBuilder::new()
//!     .root("/var/lib/my-app/opfs")
//!     .vfs_name("opfs")
//!     .with_sanity_check()
//!     .install()?;
//!
//! let conn = rusqlite::Connection::open_with_flags_and_vfs(
//!     "app.db",
//!     rusqlite::OpenFlags::default(),
//!     bridge.name(),
//! )
//! .expect("open");
//! conn.execute_batch("CREATE TABLE IF NOT EXISTS t(x)").expect("sql");
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod error;

pub use bridge::codec::{Codec, Value};
pub use bridge::config::{BridgeConfig, OpCode, OpTable, ResultCodes};
pub use bridge::metrics::{MetricsSnapshot, OpMetrics};
pub use bridge::runner::OperationRunner;
pub use bridge::util::{BridgeUtil, TreeEntry};
pub use bridge::vfs::{BridgeVfs, DEFAULT_VFS_NAME};
pub use error::{BridgeError, Result};

use bridge::config::{DEFAULT_IDLE_WAIT, LOADED_TIMEOUT};
use bridge::handshake::WorkerHandle;
use bridge::shared::SharedState;
use bridge::{sanity, vfs};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use validator::Validate;

/// Install-time options
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// root = "/var/lib/my-app/opfs"
/// verbosity = 2
/// sanity_check = true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BridgeOptions {
    /// Host directory backing the storage tree
    pub root: PathBuf,

    #[validate(length(min = 1, max = 64))]
    pub vfs_name: String,

    /// 0 = errors, 1 = warnings, 2 = info, 3 = debug
    #[validate(range(max = 3))]
    pub verbosity: u8,

    /// Highest diagnostic priority the worker reports on failure (0 = none)
    #[validate(range(max = 2))]
    pub exception_verbosity: u8,

    /// Run the sanity scenario before completing installation
    pub sanity_check: bool,

    /// Let the sanity scenario delete a scratch file left by an earlier run
    pub sanity_clear_leftover: bool,

    /// Register as SQLite's default VFS
    pub make_default: bool,

    /// Worker idle wait before releasing implicit locks
    #[validate(range(min = 1, max = 60000))]
    pub idle_wait_ms: u64,

    /// Treat every open as if `opfs-unlock-asap` was given
    pub unlock_asap: bool,

    /// How long to wait for the worker to report it has loaded
    #[validate(range(min = 10, max = 600000))]
    pub loaded_timeout_ms: u64,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        BridgeOptions {
            root: PathBuf::from("opfs"),
            vfs_name: DEFAULT_VFS_NAME.to_string(),
            verbosity: 1,
            exception_verbosity: 1,
            sanity_check: false,
            sanity_clear_leftover: false,
            make_default: false,
            idle_wait_ms: DEFAULT_IDLE_WAIT.as_millis() as u64,
            unlock_asap: false,
            loaded_timeout_ms: LOADED_TIMEOUT.as_millis() as u64,
        }
    }
}

impl BridgeOptions {
    /// Parse and validate options from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: BridgeOptions = toml::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Shared configuration for the handshake
    pub fn to_config(&self) -> BridgeConfig {
        BridgeConfig {
            idle_wait: Duration::from_millis(self.idle_wait_ms),
            exception_verbosity: self.exception_verbosity,
            verbosity: self.verbosity,
            default_unlock_asap: self.unlock_asap,
            ..BridgeConfig::new()
        }
    }
}

/// Builder for installing the bridge
///
/// # Examples
///
/// ```rust,no_run
/// use opfs_bridge::BridgeBuilder;
///
/// # fn main() -> opfs_bridge::Result<()> {
/// let bridge = BridgeBuilder::new()
///     .root("/tmp/opfs")
///     .verbosity(2)
///     .install()?;
/// # Ok(())
/// # }
/// ```
pub struct BridgeBuilder {
    options: BridgeOptions,
}

impl BridgeBuilder {
    pub fn new() -> Self {
        BridgeBuilder {
            options: BridgeOptions::default(),
        }
    }

    /// Start from previously loaded options
    pub fn from_options(options: BridgeOptions) -> Self {
        BridgeBuilder { options }
    }

    pub fn root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.options.root = root.into();
        self
    }

    pub fn vfs_name<S: Into<String>>(mut self, name: S) -> Self {
        self.options.vfs_name = name.into();
        self
    }

    pub fn verbosity(mut self, level: u8) -> Self {
        self.options.verbosity = level;
        self
    }

    pub fn exception_verbosity(mut self, level: u8) -> Self {
        self.options.exception_verbosity = level;
        self
    }

    pub fn with_sanity_check(mut self) -> Self {
        self.options.sanity_check = true;
        self
    }

    /// Remove a leftover sanity file instead of failing on it
    pub fn clear_sanity_leftover(mut self) -> Self {
        self.options.sanity_clear_leftover = true;
        self
    }

    pub fn make_default(mut self) -> Self {
        self.options.make_default = true;
        self
    }

    pub fn idle_wait(mut self, wait: Duration) -> Self {
        self.options.idle_wait_ms = wait.as_millis() as u64;
        self
    }

    pub fn unlock_asap(mut self) -> Self {
        self.options.unlock_asap = true;
        self
    }

    pub fn loaded_timeout(mut self, timeout: Duration) -> Self {
        self.options.loaded_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Start the worker, complete the handshake and register the VFS
    ///
    /// Any failure leaves SQLite without this VFS and stops the worker.
    pub fn install(self) -> Result<Bridge> {
        let options = self.options;
        options.validate()?;
        info!(
            "Installing VFS '{}' over {}",
            options.vfs_name,
            options.root.display()
        );

        let worker = WorkerHandle::spawn(options.root.clone())?;
        worker.await_loaded(Duration::from_millis(options.loaded_timeout_ms))?;

        let shared = SharedState::new(options.to_config());
        worker.init(Arc::clone(&shared))?;
        debug!("Worker initialized");

        let root = std::fs::canonicalize(&options.root)?;
        let runner = Arc::new(OperationRunner::new(shared));
        let vfs = Arc::new(BridgeVfs::new(&options.vfs_name, runner)?);
        vfs::register_vfs(Arc::clone(&vfs), options.make_default)?;

        if options.sanity_check {
            if let Err(e) = sanity::run_sanity_check(&vfs, options.sanity_clear_leftover) {
                warn!("Sanity check failed, uninstalling: {}", e);
                vfs::unregister_vfs(&options.vfs_name)?;
                return Err(e);
            }
        }

        let util = BridgeUtil::new(Arc::clone(&vfs), root.clone());
        info!("VFS '{}' installed", options.vfs_name);

        Ok(Bridge {
            vfs,
            worker: Mutex::new(worker),
            util,
            root,
            options,
        })
    }
}

impl Default for BridgeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An installed bridge
///
/// Dropping it unregisters the VFS and stops the worker. Close every SQLite
/// connection using the VFS first; while files are still open the
/// registration is left in place.
pub struct Bridge {
    vfs: Arc<BridgeVfs>,
    worker: Mutex<WorkerHandle>,
    util: BridgeUtil,
    root: PathBuf,
    options: BridgeOptions,
}

impl Bridge {
    /// Name the VFS is registered under
    pub fn name(&self) -> &str {
        &self.options.vfs_name
    }

    pub fn vfs(&self) -> &Arc<BridgeVfs> {
        &self.vfs
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    /// Resolved storage root
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn util(&self) -> &BridgeUtil {
        &self.util
    }

    /// Client-side call counts and wait times
    pub fn client_metrics(&self) -> MetricsSnapshot {
        self.vfs.runner().metrics()
    }

    /// Worker-side metrics, optionally resetting them afterwards
    pub fn worker_metrics(&self, reset: bool) -> Result<MetricsSnapshot> {
        let timeout = Duration::from_millis(self.options.idle_wait_ms) * 4 + Duration::from_secs(1);
        self.worker.lock().metrics(reset, timeout)
    }

    /// Reset client and worker metrics
    pub fn reset_metrics(&self) -> Result<()> {
        self.vfs.runner().reset_metrics();
        self.worker_metrics(true).map(|_| ())
    }

    /// Stop serving operations; calls made afterwards fail until [`Bridge::restart`]
    pub fn shutdown(&self) -> Result<()> {
        self.vfs.runner().set_stopped(true);
        self.worker.lock().shutdown()
    }

    /// Resume after [`Bridge::shutdown`]; a no-op while running
    pub fn restart(&self) -> Result<()> {
        self.worker.lock().restart()?;
        self.vfs.runner().set_stopped(false);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.vfs.runner().is_stopped()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.vfs.runner().set_stopped(true);
        let open = self.vfs.open_file_count();
        if open > 0 {
            warn!(
                "Leaving VFS '{}' registered: {} files still open",
                self.options.vfs_name, open
            );
        } else if let Err(e) = vfs::unregister_vfs(&self.options.vfs_name) {
            warn!("Failed to unregister VFS '{}': {}", self.options.vfs_name, e);
        }
        self.worker.lock().terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_toml_fill_defaults() {
        let options = BridgeOptions::from_toml_str(
            r#"
            root = "/data/opfs"
            verbosity = 3
            unlock_asap = true
            "#,
        )
        .unwrap();
        assert_eq!(options.root, PathBuf::from("/data/opfs"));
        assert_eq!(options.verbosity, 3);
        assert!(options.unlock_asap);
        assert_eq!(options.vfs_name, DEFAULT_VFS_NAME);
        assert_eq!(options.idle_wait_ms, 150);
    }

    #[test]
    fn test_options_reject_out_of_range() {
        assert!(matches!(
            BridgeOptions::from_toml_str("verbosity = 9"),
            Err(BridgeError::Validation(_))
        ));
        assert!(matches!(
            BridgeOptions::from_toml_str("vfs_name = \"\""),
            Err(BridgeError::Validation(_))
        ));
        assert!(matches!(
            BridgeOptions::from_toml_str("verbosity = \"loud\""),
            Err(BridgeError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_options_map_onto_config() {
        let options = BridgeOptions {
            idle_wait_ms: 40,
            exception_verbosity: 2,
            unlock_asap: true,
            ..BridgeOptions::default()
        };
        let config = options.to_config();
        assert_eq!(config.idle_wait, Duration::from_millis(40));
        assert_eq!(config.retry_base(), Duration::from_millis(80));
        assert_eq!(config.exception_verbosity, 2);
        assert!(config.default_unlock_asap);
    }

    #[test]
    fn test_builder_rejects_invalid_options() {
        let result = BridgeBuilder::new().vfs_name("").install();
        assert!(matches!(result, Err(BridgeError::Validation(_))));
    }
}
