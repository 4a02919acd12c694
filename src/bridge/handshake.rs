//! Startup and teardown messages between the installer and the worker
//!
//! ```text
//! worker                         client
//!   |-- Loaded ------------------->|   (watchdog: LOADED_TIMEOUT)
//!   |<------------------ Init(shm)-|
//!   |-- Inited ------------------->|   worker is now in its wait loop
//!   |<-------- Shutdown / Restart -|
//!   |<------ MetricsRequest -------|
//!   |-- Metrics ------------------>|
//! ```
//!
//! Any step may be answered with `Unavailable` instead. The high-frequency
//! path never uses this channel.

use super::metrics::MetricsSnapshot;
use super::shared::SharedState;
use super::storage::StorageRoot;
use super::worker::AsyncEngine;
use crate::error::{BridgeError, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Messages sent to the worker
#[derive(Debug)]
pub enum ClientMessage {
    /// Shared buffers, op table and constants
    Init(Arc<SharedState>),
    /// Stop the wait loop after the current operation
    Shutdown,
    /// Re-enter the wait loop; only honored after a shutdown
    Restart,
    MetricsRequest { reset: bool },
}

/// Messages sent by the worker
#[derive(Debug)]
pub enum WorkerMessage {
    Loaded,
    Inited,
    Unavailable(Vec<String>),
    Metrics(MetricsSnapshot),
}

impl WorkerMessage {
    fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Loaded => "loaded",
            WorkerMessage::Inited => "inited",
            WorkerMessage::Unavailable(_) => "unavailable",
            WorkerMessage::Metrics(_) => "metrics",
        }
    }
}

/// Client end of the worker thread
pub struct WorkerHandle {
    tx: Sender<ClientMessage>,
    rx: Receiver<WorkerMessage>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Start a worker serving the storage tree at `root`
    pub fn spawn(root: PathBuf) -> Result<Self> {
        let (tx, inbox) = channel::unbounded();
        let (outbox, rx) = channel::unbounded();
        let thread = thread::Builder::new()
            .name("opfs-async-worker".into())
            .spawn(move || worker_main(root, inbox, outbox))?;
        Ok(WorkerHandle {
            tx,
            rx,
            thread: Some(thread),
        })
    }

    /// Handle over raw channels with no thread behind it
    #[cfg(test)]
    fn from_channels(tx: Sender<ClientMessage>, rx: Receiver<WorkerMessage>) -> Self {
        WorkerHandle {
            tx,
            rx,
            thread: None,
        }
    }

    /// Wait for `Loaded`, failing if the worker stays silent past `timeout`
    pub fn await_loaded(&self, timeout: Duration) -> Result<()> {
        match self.rx.recv_timeout(timeout) {
            Ok(WorkerMessage::Loaded) => Ok(()),
            Ok(WorkerMessage::Unavailable(reasons)) => Err(BridgeError::Unavailable(reasons)),
            Ok(other) => Err(BridgeError::UnexpectedMessage(other.kind().to_string())),
            Err(RecvTimeoutError::Timeout) => Err(BridgeError::WorkerTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(BridgeError::ChannelClosed("loaded")),
        }
    }

    /// Ship the shared state and wait until the worker is serving
    pub fn init(&self, shared: Arc<SharedState>) -> Result<()> {
        self.tx
            .send(ClientMessage::Init(shared))
            .map_err(|_| BridgeError::ChannelClosed("init"))?;
        match self.rx.recv() {
            Ok(WorkerMessage::Inited) => Ok(()),
            Ok(WorkerMessage::Unavailable(reasons)) => Err(BridgeError::Unavailable(reasons)),
            Ok(other) => Err(BridgeError::UnexpectedMessage(other.kind().to_string())),
            Err(_) => Err(BridgeError::ChannelClosed("inited")),
        }
    }

    pub fn shutdown(&self) -> Result<()> {
        self.tx
            .send(ClientMessage::Shutdown)
            .map_err(|_| BridgeError::ChannelClosed("shutdown"))
    }

    pub fn restart(&self) -> Result<()> {
        self.tx
            .send(ClientMessage::Restart)
            .map_err(|_| BridgeError::ChannelClosed("restart"))
    }

    /// Fetch the worker's metrics, optionally resetting them
    pub fn metrics(&self, reset: bool, timeout: Duration) -> Result<MetricsSnapshot> {
        self.tx
            .send(ClientMessage::MetricsRequest { reset })
            .map_err(|_| BridgeError::ChannelClosed("metrics"))?;
        match self.rx.recv_timeout(timeout) {
            Ok(WorkerMessage::Metrics(snapshot)) => Ok(snapshot),
            Ok(other) => Err(BridgeError::UnexpectedMessage(other.kind().to_string())),
            Err(RecvTimeoutError::Timeout) => Err(BridgeError::WorkerTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(BridgeError::ChannelClosed("metrics")),
        }
    }

    /// Stop the worker for good and wait for its thread
    pub fn terminate(&mut self) {
        let _ = self.tx.send(ClientMessage::Shutdown);
        // Replacing the sender disconnects the worker's inbox.
        let (tx, _) = channel::unbounded();
        drop(std::mem::replace(&mut self.tx, tx));
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn worker_main(root: PathBuf, inbox: Receiver<ClientMessage>, outbox: Sender<WorkerMessage>) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = outbox.send(WorkerMessage::Unavailable(vec![format!(
                "cannot start async runtime: {}",
                e
            )]));
            return;
        }
    };

    let reasons = rt.block_on(StorageRoot::probe(&root));
    if !reasons.is_empty() {
        warn!("Async storage unavailable: {:?}", reasons);
        let _ = outbox.send(WorkerMessage::Unavailable(reasons));
        return;
    }
    let storage = match rt.block_on(StorageRoot::open(&root)) {
        Ok(storage) => storage,
        Err(e) => {
            let _ = outbox.send(WorkerMessage::Unavailable(vec![e.to_string()]));
            return;
        }
    };

    debug!("Worker loaded, storage root {}", storage.path().display());
    if outbox.send(WorkerMessage::Loaded).is_err() {
        return;
    }

    let mut engine: Option<AsyncEngine> = None;
    while let Ok(msg) = inbox.recv() {
        match msg {
            ClientMessage::Init(shared) => {
                if engine.is_some() {
                    warn!("Ignoring repeated init");
                    continue;
                }
                match AsyncEngine::new(shared, storage.directory()) {
                    Ok(mut e) => {
                        info!("Worker initialized");
                        if outbox.send(WorkerMessage::Inited).is_err() {
                            return;
                        }
                        e.wait_loop(&rt, &inbox, &outbox);
                        engine = Some(e);
                    }
                    Err(err) => {
                        error!("Worker initialization failed: {}", err);
                        let _ = outbox.send(WorkerMessage::Unavailable(vec![err.to_string()]));
                        return;
                    }
                }
            }
            ClientMessage::Restart => match engine.as_mut() {
                Some(e) if e.is_shut_down() => {
                    info!("Restarting wait loop");
                    e.wait_loop(&rt, &inbox, &outbox);
                }
                _ => warn!("Restart ignored: worker was never initialized"),
            },
            ClientMessage::Shutdown => {
                if let Some(e) = engine.as_mut() {
                    e.request_shutdown();
                }
            }
            ClientMessage::MetricsRequest { reset } => {
                let snapshot = engine.as_ref().map(|e| e.metrics()).unwrap_or_default();
                let _ = outbox.send(WorkerMessage::Metrics(snapshot));
                if reset {
                    if let Some(e) = engine.as_mut() {
                        e.reset_metrics();
                    }
                }
            }
        }
    }

    if let Some(e) = engine.as_mut() {
        e.release_all();
    }
    debug!("Worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::config::BridgeConfig;
    use std::time::Instant;
    use tempfile::TempDir;

    #[test]
    fn test_silent_worker_trips_loaded_watchdog() {
        let (tx, _inbox) = channel::unbounded();
        let (_outbox, rx) = channel::unbounded::<WorkerMessage>();
        let handle = WorkerHandle::from_channels(tx, rx);

        let started = Instant::now();
        let timeout = Duration::from_millis(50);
        match handle.await_loaded(timeout) {
            Err(BridgeError::WorkerTimeout(waited)) => assert_eq!(waited, timeout),
            other => panic!("expected WorkerTimeout, got {:?}", other),
        }
        assert!(started.elapsed() >= timeout);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_out_of_order_message_is_rejected() {
        let (tx, _inbox) = channel::unbounded();
        let (outbox, rx) = channel::unbounded();
        let handle = WorkerHandle::from_channels(tx, rx);

        outbox.send(WorkerMessage::Inited).unwrap();
        match handle.await_loaded(Duration::from_secs(1)) {
            Err(BridgeError::UnexpectedMessage(kind)) => assert_eq!(kind, "inited"),
            other => panic!("expected UnexpectedMessage, got {:?}", other),
        }
    }

    #[test]
    fn test_unavailable_during_init() {
        let (tx, inbox) = channel::unbounded();
        let (outbox, rx) = channel::unbounded();
        let handle = WorkerHandle::from_channels(tx, rx);

        outbox
            .send(WorkerMessage::Unavailable(vec!["no storage".to_string()]))
            .unwrap();
        match handle.init(SharedState::new(BridgeConfig::new())) {
            Err(BridgeError::Unavailable(reasons)) => assert_eq!(reasons, vec!["no storage"]),
            other => panic!("expected Unavailable, got {:?}", other),
        }
        assert!(matches!(inbox.try_recv(), Ok(ClientMessage::Init(_))));
    }

    #[test]
    fn test_spawned_worker_completes_handshake() {
        let dir = TempDir::new().unwrap();
        let mut handle = WorkerHandle::spawn(dir.path().join("root")).unwrap();
        handle.await_loaded(Duration::from_secs(4)).unwrap();
        handle.init(SharedState::new(BridgeConfig::new())).unwrap();

        let metrics = handle.metrics(false, Duration::from_secs(2)).unwrap();
        assert_eq!(metrics.total_calls(), 0);
        handle.terminate();
    }
}
