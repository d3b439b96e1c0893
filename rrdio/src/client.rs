//! The caller-facing entry point.
//!
//! A [`Client`] owns an [`Engine`] and hands out the typed front-ends built
//! on it: [`Creator`] for new databases, [`Updater`] for samples, an
//! [`InfoTree`] for metadata and a [`FetchGrid`] for stored values.
//!
//! ```rust
//! use std::time::{Duration, UNIX_EPOCH};
//! use rrdio::{Client, MemoryEngine, params};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(MemoryEngine::new());
//! let t0 = UNIX_EPOCH + Duration::from_secs(1_700_000_100);
//! let step = Duration::from_secs(300);
//!
//! client
//!     .creator("x.rrd", t0, 300)
//!     .ds("v", "GAUGE", &params![600, "U", "U"])
//!     .rra("AVERAGE", &params![0.5, 1, 100])
//!     .create(true)?;
//! client.updater("x.rrd").update(&params![t0 + step, 42.0])?;
//!
//! let info = client.info("x.rrd")?;
//! assert_eq!(info.unsigned("step"), Some(300));
//!
//! let mut grid = client.fetch("x.rrd", "AVERAGE", t0, t0 + 2 * step, step)?;
//! assert_eq!((grid.rows(), grid.columns()), (3, 1));
//! assert_eq!(grid.at(1, 0)?, 42.0);
//! grid.release()?;
//! # Ok(())
//! # }
//! ```

use std::time::{Duration, SystemTime};

use crate::args::epoch_secs;
use crate::create::Creator;
use crate::engine::{Engine, FetchRequest};
use crate::error::Result;
use crate::fetch::FetchGrid;
use crate::info::{InfoTree, parse_info};
use crate::update::Updater;

/// Typed access to the databases of one engine.
#[derive(Debug, Default)]
pub struct Client<E> {
    engine: E,
}

impl<E: Engine> Client<E> {
    /// Wraps `engine`.
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    /// Returns the underlying engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Consumes the client, returning the engine.
    pub fn into_engine(self) -> E {
        self.engine
    }

    /// Starts the definition of a new database.
    ///
    /// `step` is the base interval in seconds.
    pub fn creator(&self, target: impl Into<String>, start: SystemTime, step: u64) -> Creator<'_, E> {
        Creator::new(&self.engine, target, start, step)
    }

    /// Returns an updater writing directly to `target`.
    pub fn updater(&self, target: impl Into<String>) -> Updater<'_, E> {
        Updater::new(&self.engine, target)
    }

    /// Returns an updater routing submissions through `daemon`.
    pub fn daemon_updater(
        &self,
        target: impl Into<String>,
        daemon: impl Into<String>,
    ) -> Updater<'_, E> {
        Updater::with_daemon(&self.engine, target, daemon)
    }

    /// Reads database metadata as a nested tree.
    ///
    /// # Errors
    ///
    /// Returns [`crate::EngineError`] if the engine rejects the request and
    /// [`crate::error::IntegrityError`] if the records do not form a
    /// consistent tree.
    pub fn info(&self, target: &str) -> Result<InfoTree> {
        self.info_via(target, None)
    }

    /// Like [`Client::info`], asking `daemon` to flush `target` first.
    ///
    /// # Errors
    ///
    /// See [`Client::info`].
    pub fn daemon_info(&self, target: &str, daemon: &str) -> Result<InfoTree> {
        self.info_via(target, Some(daemon))
    }

    fn info_via(&self, target: &str, daemon: Option<&str>) -> Result<InfoTree> {
        tracing::debug!(database = target, daemon = daemon.unwrap_or("-"), "info");
        let records = self.engine.info(target, daemon)?;
        parse_info(records)
    }

    /// Reads consolidated values between `start` and `end`.
    ///
    /// The engine may widen the range and coarsen `step`; the returned grid
    /// reports what was actually fetched. A zero `step` lets the engine pick.
    ///
    /// # Errors
    ///
    /// Returns [`crate::EngineError`] if the engine rejects the request and
    /// [`crate::error::IntegrityError`] if its output is inconsistent.
    pub fn fetch(
        &self,
        target: &str,
        cf: &str,
        start: SystemTime,
        end: SystemTime,
        step: Duration,
    ) -> Result<FetchGrid> {
        self.fetch_via(target, cf, start, end, step, None)
    }

    /// Like [`Client::fetch`], asking `daemon` to flush `target` first.
    ///
    /// # Errors
    ///
    /// See [`Client::fetch`].
    pub fn daemon_fetch(
        &self,
        target: &str,
        cf: &str,
        start: SystemTime,
        end: SystemTime,
        step: Duration,
        daemon: &str,
    ) -> Result<FetchGrid> {
        self.fetch_via(target, cf, start, end, step, Some(daemon))
    }

    fn fetch_via(
        &self,
        target: &str,
        cf: &str,
        start: SystemTime,
        end: SystemTime,
        step: Duration,
        daemon: Option<&str>,
    ) -> Result<FetchGrid> {
        let request = FetchRequest {
            target,
            cf,
            start: epoch_secs(start),
            end: epoch_secs(end),
            step: step.as_secs(),
        };
        tracing::debug!(
            database = target,
            cf,
            start = request.start,
            end = request.end,
            step = request.step,
            daemon = daemon.unwrap_or("-"),
            "fetch"
        );
        let raw = self.engine.fetch(&request, daemon)?;
        FetchGrid::new(target, cf, raw)
    }

    /// Asks `daemon` to write everything it holds for `target`.
    ///
    /// An empty `daemon` address is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`crate::EngineError`] if the daemon cannot be reached or the
    /// flush fails.
    pub fn flush(&self, daemon: &str, target: &str) -> Result<()> {
        tracing::debug!(database = target, daemon, "flush");
        self.engine.flush(daemon, target)?;
        Ok(())
    }
}
