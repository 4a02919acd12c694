//! Client-side synchronous call primitive
//!
//! [`OperationRunner::call`] is the only place the calling thread blocks. It
//! stages arguments in the payload, arms the control segment, wakes the worker
//! and parks on the `rc` slot until the worker replaces the sentinel. There is
//! no timeout: the worker answers every operation, failures included.

use super::codec::{Codec, Value};
use super::config::{BridgeConfig, OpCode, RC_SENTINEL, SLOT_RC, SLOT_WHICH_OP};
use super::metrics::{Metrics, MetricsSnapshot};
use super::shared::{PayloadView, SharedState, WaitOutcome};
use crate::error::{BridgeError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Payload access after the worker answered
pub struct Reply<'a> {
    view: PayloadView<'a>,
    codec: Codec,
    metrics: &'a Mutex<Metrics>,
}

impl Reply<'_> {
    /// Values the worker serialized as its result, if any
    pub fn results(&mut self) -> Result<Option<Vec<Value>>> {
        self.codec
            .deserialize_timed(&mut self.metrics.lock(), self.view.s11n_mut(), true)
    }

    /// File bytes the worker left in the staging buffer
    pub fn file_buffer(&self) -> &[u8] {
        self.view.file_buffer()
    }
}

pub struct OperationRunner {
    shared: Arc<SharedState>,
    codec: Codec,
    /// Serializes callers so only one operation is ever in flight
    gate: Mutex<()>,
    metrics: Mutex<Metrics>,
    stopped: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl OperationRunner {
    pub fn new(shared: Arc<SharedState>) -> Self {
        let codec = Codec::new(shared.config.byte_order);
        OperationRunner {
            shared,
            codec,
            gate: Mutex::new(()),
            metrics: Mutex::new(Metrics::new()),
            stopped: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Run `op` and return the worker's result code
    pub fn run(&self, op: OpCode, args: &[Value]) -> Result<i32> {
        self.call(op, args, |_| {}, |rc, _| rc)
    }

    /// Run `op` with access to the payload before and after the round trip
    ///
    /// `stage` runs before the worker is signalled (e.g. to copy write data
    /// into the staging buffer); `finish` runs once the result code is known,
    /// while no other caller can touch the payload.
    pub fn call<T>(
        &self,
        op: OpCode,
        args: &[Value],
        stage: impl FnOnce(&mut PayloadView<'_>),
        finish: impl FnOnce(i32, &mut Reply<'_>) -> T,
    ) -> Result<T> {
        let _gate = self.gate.lock();
        if self.stopped.load(Ordering::SeqCst) {
            return Err(BridgeError::Protocol(format!(
                "{} issued while the worker is stopped",
                op
            )));
        }
        let control = &self.shared.control;
        let opcode = self.shared.config.ops.opcode(op);
        if opcode as usize >= control.len() {
            return Err(BridgeError::Protocol(format!("no such op: {}", op)));
        }

        {
            let mut view = self.shared.payload.lock();
            stage(&mut view);
            self.codec
                .serialize_timed(&mut self.metrics.lock(), view.s11n_mut(), args)?;
        }

        control.store(SLOT_RC, RC_SENTINEL);
        control.store(SLOT_WHICH_OP, opcode);
        control.notify(SLOT_WHICH_OP);

        let started = Instant::now();
        while control.wait(SLOT_RC, RC_SENTINEL, None) != WaitOutcome::NotEqual {}
        let rc = control.load(SLOT_RC);

        {
            let mut metrics = self.metrics.lock();
            metrics.record_call(op);
            metrics.record_wait(op, started.elapsed());
        }

        let mut reply = Reply {
            view: self.shared.payload.lock(),
            codec: self.codec,
            metrics: &self.metrics,
        };
        if rc != 0 {
            let diag = if self.shared.config.exception_verbosity > 0 {
                reply.results().ok().flatten()
            } else {
                None
            };
            let msg = diag.map(|values| {
                values
                    .iter()
                    .map(|v| match v {
                        Value::Str(s) => s.clone(),
                        other => format!("{:?}", other),
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
            });
            if let Some(msg) = &msg {
                warn!("{}() async error: {}", op, msg);
            }
            *self.last_error.lock() = msg;
        } else if op == OpCode::Shutdown {
            // The worker has left its wait loop; nothing would answer.
            self.stopped.store(true, Ordering::SeqCst);
        }
        Ok(finish(rc, &mut reply))
    }

    /// Last diagnostic the worker reported
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.lock().snapshot()
    }

    /// Calls made for one operation
    pub fn call_count(&self, op: OpCode) -> u64 {
        self.metrics.lock().op(op).count
    }

    pub fn reset_metrics(&self) {
        self.metrics.lock().reset();
    }

    /// Refuse or accept further calls
    ///
    /// Waits for any call in flight, so once this returns with `true` the
    /// worker can leave its wait loop without stranding a caller.
    pub fn set_stopped(&self, stopped: bool) {
        let _gate = self.gate.lock();
        self.stopped.store(stopped, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Answers one operation the way the worker would
    fn fake_worker(shared: Arc<SharedState>, rc: i32, result: Option<Value>) -> thread::JoinHandle<i32> {
        thread::spawn(move || {
            let control = &shared.control;
            while control.wait(SLOT_WHICH_OP, 0, None) != WaitOutcome::NotEqual {}
            let opcode = control.load(SLOT_WHICH_OP);
            control.store(SLOT_WHICH_OP, 0);
            {
                let codec = Codec::new(shared.config.byte_order);
                let mut view = shared.payload.lock();
                let args = codec.deserialize(view.s11n_mut(), true).unwrap();
                assert_eq!(args, Some(vec![Value::from("/a.db")]));
                if let Some(v) = result {
                    codec.serialize(view.s11n_mut(), &[v]).unwrap();
                }
            }
            control.store(SLOT_RC, rc);
            control.notify(SLOT_RC);
            opcode
        })
    }

    #[test]
    fn test_run_round_trip() {
        let shared = SharedState::new(BridgeConfig::new());
        let runner = OperationRunner::new(Arc::clone(&shared));
        let worker = fake_worker(Arc::clone(&shared), 0, Some(Value::I64(42)));

        let (rc, results) = runner
            .call(OpCode::Access, &[Value::from("/a.db")], |_| {}, |rc, reply| {
                (rc, reply.results().unwrap())
            })
            .unwrap();
        assert_eq!(rc, 0);
        assert_eq!(results, Some(vec![Value::I64(42)]));
        assert_eq!(worker.join().unwrap(), shared.config.ops.opcode(OpCode::Access));
        assert_eq!(runner.call_count(OpCode::Access), 1);
    }

    #[test]
    fn test_failure_diagnostic_is_recorded() {
        let shared = SharedState::new(BridgeConfig::new());
        let runner = OperationRunner::new(Arc::clone(&shared));
        let worker = fake_worker(
            Arc::clone(&shared),
            shared.config.codes.ioerr,
            Some(Value::from("NotFoundError: /a.db")),
        );

        let rc = runner.run(OpCode::Access, &[Value::from("/a.db")]).unwrap();
        worker.join().unwrap();
        assert_eq!(rc, shared.config.codes.ioerr);
        assert_eq!(runner.last_error().as_deref(), Some("NotFoundError: /a.db"));
    }

    #[test]
    fn test_failure_without_diagnostic_clears_last_error() {
        let shared = SharedState::new(BridgeConfig::new());
        let runner = OperationRunner::new(Arc::clone(&shared));
        let ioerr = shared.config.codes.ioerr;

        let worker = fake_worker(Arc::clone(&shared), ioerr, Some(Value::from("NotFoundError: /a.db")));
        runner.run(OpCode::Access, &[Value::from("/a.db")]).unwrap();
        worker.join().unwrap();
        assert!(runner.last_error().is_some());

        let worker = fake_worker(Arc::clone(&shared), ioerr, None);
        runner.run(OpCode::Access, &[Value::from("/a.db")]).unwrap();
        worker.join().unwrap();
        assert_eq!(runner.last_error(), None);
    }

    #[test]
    fn test_shutdown_op_stops_runner() {
        let shared = SharedState::new(BridgeConfig::new());
        let runner = OperationRunner::new(Arc::clone(&shared));
        let worker = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let control = &shared.control;
                while control.wait(SLOT_WHICH_OP, 0, None) != WaitOutcome::NotEqual {}
                control.store(SLOT_WHICH_OP, 0);
                control.store(SLOT_RC, 0);
                control.notify(SLOT_RC);
            })
        };

        assert_eq!(runner.run(OpCode::Shutdown, &[]).unwrap(), 0);
        worker.join().unwrap();
        assert!(runner.is_stopped());
        assert!(matches!(
            runner.run(OpCode::Sleep, &[Value::from(1)]),
            Err(BridgeError::Protocol(_))
        ));
    }

    #[test]
    fn test_stopped_runner_refuses_calls() {
        let runner = OperationRunner::new(SharedState::new(BridgeConfig::new()));
        runner.set_stopped(true);
        assert!(matches!(
            runner.run(OpCode::Sleep, &[Value::from(1)]),
            Err(BridgeError::Protocol(_))
        ));
    }

    #[test]
    fn test_oversized_arguments_fail_before_signalling() {
        let shared = SharedState::new(BridgeConfig::new());
        let runner = OperationRunner::new(Arc::clone(&shared));
        let huge = "x".repeat(shared.config.layout.s11n_size);
        assert!(matches!(
            runner.run(OpCode::Access, &[Value::from(huge)]),
            Err(BridgeError::Codec(_))
        ));
        assert_eq!(shared.control.load(SLOT_WHICH_OP), 0);
    }
}
