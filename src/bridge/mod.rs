//! The synchronous-to-asynchronous storage bridge
//!
//! Client side: [`vfs`] adapters call [`runner::OperationRunner`], which blocks
//! on the shared control segment. Worker side: [`worker::AsyncEngine`] serves
//! each operation against [`storage`]. [`handshake`] wires the two together.

pub mod codec;
pub mod config;
pub mod handshake;
pub mod metrics;
pub mod runner;
pub mod sanity;
pub mod shared;
pub mod storage;
pub mod util;
pub mod vfs;
pub mod worker;
