//! The storage engine boundary.
//!
//! Everything below this module is an external collaborator: it owns the
//! on-disk format, the round-robin arithmetic and the optional caching
//! daemon. This crate only needs the primitives of [`Engine`].
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryEngine`]: an in-process engine, in memory or file-backed,
//!   used by the tests and by the CLI when no system library is linked.
//! - `LibRrd`: bindings to the system `librrd`, behind the `librrd`
//!   feature.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::EngineError;
use crate::info::InfoRecord;

pub mod memory;

#[cfg(feature = "librrd")]
pub mod librrd;

#[cfg(feature = "librrd")]
pub use librrd::LibRrd;
pub use memory::MemoryEngine;

/// Rejection for a template that would go through a caching daemon.
pub(crate) fn daemon_template_error(daemon: &str) -> EngineError {
    EngineError::new(format!(
        "rrdcached at {daemon} does not accept a template; update without the daemon"
    ))
}

/// A fetch request as understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest<'a> {
    /// Database to read.
    pub target: &'a str,
    /// Consolidation function name, e.g. `AVERAGE`.
    pub cf: &'a str,
    /// Requested start, epoch seconds.
    pub start: i64,
    /// Requested end, epoch seconds.
    pub end: i64,
    /// Requested resolution in seconds; `0` lets the engine choose.
    pub step: u64,
}

/// Raw fetch output before it is wrapped in a [`crate::FetchGrid`].
///
/// `start`, `end` and `step` are the values the engine actually honoured,
/// which may differ from the request.
#[derive(Debug)]
pub struct RawFetch {
    /// Adjusted start, epoch seconds.
    pub start: i64,
    /// Adjusted end, epoch seconds.
    pub end: i64,
    /// Adjusted step in seconds.
    pub step: u64,
    /// Series names, in column order.
    pub ds_names: Vec<String>,
    /// Row-major values, owned by the engine.
    pub buffer: Box<dyn EngineBuffer>,
}

/// Handle to a value buffer allocated by the engine.
///
/// The buffer must be handed back with [`EngineBuffer::release`] exactly
/// once; consuming `self` makes a second release impossible to express.
pub trait EngineBuffer: Send + fmt::Debug {
    /// Read-only view of the values.
    fn values(&self) -> &[f64];

    /// Returns the memory to the engine's allocator.
    fn release(self: Box<Self>);
}

/// The primitives a round-robin storage engine exposes.
///
/// Implementations take `&self` and synchronize internally; an engine
/// wrapping non-reentrant global state must hold one process-wide lock for
/// the duration of each call.
pub trait Engine {
    /// Creates a database from declaration strings.
    ///
    /// # Errors
    ///
    /// Returns the engine's rejection message.
    fn create(
        &self,
        target: &str,
        step: u64,
        start: i64,
        declarations: &[String],
    ) -> Result<(), EngineError>;

    /// Submits samples, through `daemon` when one is given and reachable.
    ///
    /// The caching daemon maps values in declaration order only, so a
    /// `template` routed through a reachable daemon is rejected.
    ///
    /// # Errors
    ///
    /// Returns the engine's rejection message.
    fn update(
        &self,
        target: &str,
        template: Option<&str>,
        daemon: Option<&str>,
        samples: &[String],
    ) -> Result<(), EngineError>;

    /// Submits samples directly to the database file, bypassing any daemon.
    ///
    /// # Errors
    ///
    /// Returns the engine's rejection message.
    fn update_no_daemon(
        &self,
        target: &str,
        template: Option<&str>,
        samples: &[String],
    ) -> Result<(), EngineError>;

    /// Reports database metadata as flat records in engine order.
    ///
    /// # Errors
    ///
    /// Returns the engine's rejection message.
    fn info(&self, target: &str, daemon: Option<&str>) -> Result<Vec<InfoRecord>, EngineError>;

    /// Reads consolidated values for a time range.
    ///
    /// # Errors
    ///
    /// Returns the engine's rejection message.
    fn fetch(
        &self,
        request: &FetchRequest<'_>,
        daemon: Option<&str>,
    ) -> Result<RawFetch, EngineError>;

    /// Asks `daemon` to write everything it holds for `target`.
    ///
    /// # Errors
    ///
    /// Returns the engine's rejection message.
    fn flush(&self, daemon: &str, target: &str) -> Result<(), EngineError>;
}

/// An [`EngineBuffer`] backed by a Rust allocation.
///
/// Every live buffer is counted in a shared counter so an engine can report
/// how many fetch results have not been released yet. The count drops when
/// the buffer is released or dropped, whichever comes first.
#[derive(Debug)]
pub struct VecBuffer {
    values: Vec<f64>,
    live: Arc<AtomicUsize>,
}

impl VecBuffer {
    /// Wraps `values`, incrementing `live`.
    pub fn new(values: Vec<f64>, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self { values, live }
    }
}

impl EngineBuffer for VecBuffer {
    fn values(&self) -> &[f64] {
        &self.values
    }

    fn release(self: Box<Self>) {
        drop(self);
    }
}

impl Drop for VecBuffer {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}
