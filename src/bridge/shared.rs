//! Memory shared between the calling thread and the worker
//!
//! The control segment is an array of 32-bit atomic slots with futex-style
//! wait/notify, parked on the slot address through `parking_lot_core`. The
//! payload segment holds the file staging buffer and the serialization region.
//! Only one side touches the payload at a time: the client before it signals,
//! the worker before it signals back.

use super::config::{BridgeConfig, BufferLayout};
use parking_lot::{Mutex, MutexGuard};
use parking_lot_core::{ParkResult, DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of [`ControlSegment::wait`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The slot did not hold the expected value when checked
    NotEqual,
    /// Woken by a notify
    Woken,
    /// Timeout elapsed without a notify
    TimedOut,
}

/// Fixed array of atomically accessed 32-bit slots
#[derive(Debug)]
pub struct ControlSegment {
    slots: Box<[AtomicI32]>,
}

impl ControlSegment {
    pub fn new(len: usize) -> Self {
        let slots = (0..len).map(|_| AtomicI32::new(0)).collect();
        ControlSegment { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn load(&self, slot: usize) -> i32 {
        self.slots[slot].load(Ordering::SeqCst)
    }

    pub fn store(&self, slot: usize, value: i32) {
        self.slots[slot].store(value, Ordering::SeqCst);
    }

    /// Wake every thread parked on `slot`
    pub fn notify(&self, slot: usize) -> usize {
        // SAFETY: the key is the address of a slot owned by this segment and
        // no parking_lot callback re-enters the parking lot.
        unsafe { parking_lot_core::unpark_all(self.key(slot), DEFAULT_UNPARK_TOKEN) }
    }

    /// Block while `slot` holds `expected`
    ///
    /// Returns immediately with [`WaitOutcome::NotEqual`] if the slot already
    /// differs. A `None` timeout waits until notified.
    pub fn wait(&self, slot: usize, expected: i32, timeout: Option<Duration>) -> WaitOutcome {
        let atom = &self.slots[slot];
        let deadline = timeout.map(|t| Instant::now() + t);
        // SAFETY: same key discipline as `notify`; the validate closure only
        // performs an atomic load.
        let result = unsafe {
            parking_lot_core::park(
                self.key(slot),
                || atom.load(Ordering::SeqCst) == expected,
                || {},
                |_, _| {},
                DEFAULT_PARK_TOKEN,
                deadline,
            )
        };
        match result {
            ParkResult::Invalid => WaitOutcome::NotEqual,
            ParkResult::Unparked(_) => WaitOutcome::Woken,
            ParkResult::TimedOut => WaitOutcome::TimedOut,
        }
    }

    fn key(&self, slot: usize) -> usize {
        &self.slots[slot] as *const AtomicI32 as usize
    }
}

/// File staging buffer followed by the serialization region
pub struct PayloadSegment {
    layout: BufferLayout,
    bytes: Mutex<Box<[u8]>>,
}

impl PayloadSegment {
    pub fn new(layout: BufferLayout) -> Self {
        PayloadSegment {
            layout,
            bytes: Mutex::new(vec![0u8; layout.total()].into_boxed_slice()),
        }
    }

    pub fn layout(&self) -> BufferLayout {
        self.layout
    }

    /// Borrow the whole payload; see [`PayloadView`]
    pub fn lock(&self) -> PayloadView<'_> {
        PayloadView {
            layout: self.layout,
            guard: self.bytes.lock(),
        }
    }
}

impl std::fmt::Debug for PayloadSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadSegment")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

/// Exclusive view over the payload segment
pub struct PayloadView<'a> {
    layout: BufferLayout,
    guard: MutexGuard<'a, Box<[u8]>>,
}

impl PayloadView<'_> {
    pub fn file_buffer(&self) -> &[u8] {
        &self.guard[..self.layout.file_buffer_size]
    }

    pub fn file_buffer_mut(&mut self) -> &mut [u8] {
        &mut self.guard[..self.layout.file_buffer_size]
    }

    pub fn s11n(&self) -> &[u8] {
        let start = self.layout.s11n_offset;
        &self.guard[start..start + self.layout.s11n_size]
    }

    pub fn s11n_mut(&mut self) -> &mut [u8] {
        let start = self.layout.s11n_offset;
        &mut self.guard[start..start + self.layout.s11n_size]
    }
}

/// Control and payload segments plus the configuration they were built from
#[derive(Debug)]
pub struct SharedState {
    pub config: BridgeConfig,
    pub control: ControlSegment,
    pub payload: PayloadSegment,
}

impl SharedState {
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        let control = ControlSegment::new(config.ops.control_len());
        let payload = PayloadSegment::new(config.layout);
        Arc::new(SharedState {
            config,
            control,
            payload,
        })
    }
}
