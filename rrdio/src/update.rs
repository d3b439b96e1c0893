//! Sample submission with optional client-side batching.
//!
//! An [`Updater`] writes samples to one database in two ways:
//!
//! - **Immediate**: [`Updater::update`] with values serializes one sample and
//!   submits it on its own. Any cached samples are left alone.
//! - **Deferred**: [`Updater::cache`] appends serialized samples to a pending
//!   batch. [`Updater::update`] with no values then submits the whole batch as
//!   one multi-sample request.
//!
//! The pending batch is cleared only after the engine accepts it. On failure
//! it is left exactly as it was so the caller can inspect it and retry.
//!
//! # Daemon routing
//!
//! An updater created with [`crate::Client::daemon_updater`] routes
//! submissions through a caching daemon, which may hold data in memory until
//! it is flushed (see [`crate::Client::flush`]). [`Updater::update_no_daemon`]
//! always writes the database directly.
//!
//! ```rust
//! use std::time::{Duration, UNIX_EPOCH};
//! use rrdio::{Client, MemoryEngine, params};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(MemoryEngine::new());
//! let t0 = UNIX_EPOCH + Duration::from_secs(1_700_000_100);
//! client
//!     .creator("net.rrd", t0, 300)
//!     .ds("rx", "GAUGE", &params![600, "U", "U"])
//!     .rra("AVERAGE", &params![0.5, 1, 100])
//!     .create(true)?;
//!
//! let mut updater = client.updater("net.rrd");
//! updater.cache(&params![t0 + Duration::from_secs(300), 1.0]);
//! updater.cache(&params![t0 + Duration::from_secs(600), 2.0]);
//! assert_eq!(updater.pending().len(), 2);
//!
//! updater.update(&[])?;
//! assert!(updater.pending().is_empty());
//! # Ok(())
//! # }
//! ```

use crate::args::{Param, join};
use crate::engine::Engine;
use crate::error::Result;

/// How a submission reaches the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// Through the bound daemon, if any.
    Default,
    /// Straight to the database file.
    Direct,
}

/// Writes samples to one database.
///
/// Mutation of the pending batch requires `&mut self`, so one updater cannot
/// be submitted from two call sites at once.
#[derive(Debug)]
pub struct Updater<'e, E: ?Sized> {
    engine: &'e E,
    target: String,
    template: Option<String>,
    daemon: Option<String>,
    pending: Vec<String>,
}

impl<'e, E: Engine + ?Sized> Updater<'e, E> {
    /// Creates an updater writing directly to `target`.
    pub fn new(engine: &'e E, target: impl Into<String>) -> Self {
        Self {
            engine,
            target: target.into(),
            template: None,
            daemon: None,
            pending: Vec::new(),
        }
    }

    /// Creates an updater routing submissions through `daemon`.
    pub fn with_daemon(engine: &'e E, target: impl Into<String>, daemon: impl Into<String>) -> Self {
        Self {
            daemon: Some(daemon.into()),
            ..Self::new(engine, target)
        }
    }

    /// Returns the database this updater writes to.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Returns the bound daemon address, if any.
    pub fn daemon(&self) -> Option<&str> {
        self.daemon.as_deref()
    }

    /// Returns the current template, if any.
    pub fn template(&self) -> Option<&str> {
        self.template.as_deref()
    }

    /// Restricts and orders the data sources each sample addresses.
    ///
    /// An empty list removes the template. The caching daemon does not
    /// accept templates: with a reachable daemon, [`Updater::update`] fails
    /// and [`Updater::update_no_daemon`] must be used instead.
    pub fn set_template(&mut self, ds_names: &[&str]) {
        self.template = if ds_names.is_empty() {
            None
        } else {
            Some(ds_names.join(":"))
        };
    }

    /// Appends one sample to the pending batch without submitting it.
    ///
    /// `values` is the timestamp followed by one value per data source.
    pub fn cache(&mut self, values: &[Param]) {
        self.pending.push(join(values));
    }

    /// Returns the samples waiting for the next batch submission.
    pub fn pending(&self) -> &[String] {
        &self.pending
    }

    /// Discards the pending batch.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Submits a sample, or the pending batch when `values` is empty.
    ///
    /// Routes through the bound daemon, if any. Submitting with no values and
    /// an empty batch does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`crate::EngineError`] if the engine rejects the submission; a
    /// pending batch is then kept intact.
    pub fn update(&mut self, values: &[Param]) -> Result<()> {
        self.submit(values, Route::Default)
    }

    /// Like [`Updater::update`] but always writes the database directly.
    ///
    /// # Errors
    ///
    /// Returns [`crate::EngineError`] if the engine rejects the submission; a
    /// pending batch is then kept intact.
    pub fn update_no_daemon(&mut self, values: &[Param]) -> Result<()> {
        self.submit(values, Route::Direct)
    }

    fn submit(&mut self, values: &[Param], route: Route) -> Result<()> {
        if !values.is_empty() {
            return self.send(&[join(values)], route);
        }
        if self.pending.is_empty() {
            return Ok(());
        }

        self.send(&self.pending, route)?;
        self.pending.clear();
        Ok(())
    }

    fn send(&self, samples: &[String], route: Route) -> Result<()> {
        let template = self.template.as_deref();
        match route {
            Route::Default => {
                tracing::debug!(
                    database = %self.target,
                    samples = samples.len(),
                    daemon = self.daemon.as_deref().unwrap_or("-"),
                    "submitting samples"
                );
                self.engine
                    .update(&self.target, template, self.daemon.as_deref(), samples)?;
            }
            Route::Direct => {
                tracing::debug!(
                    database = %self.target,
                    samples = samples.len(),
                    "submitting samples directly"
                );
                self.engine.update_no_daemon(&self.target, template, samples)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use super::*;
    use crate::create::Creator;
    use crate::engine::MemoryEngine;
    use crate::error::RrdError;
    use crate::params;

    const T0: u64 = 1_700_000_100;

    fn at(offset: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(T0 + offset)
    }

    fn engine_with_db() -> MemoryEngine {
        let engine = MemoryEngine::new();
        Creator::new(&engine, "u.rrd", at(0), 300)
            .ds("a", "GAUGE", &params![600, "U", "U"])
            .ds("b", "GAUGE", &params![600, "U", "U"])
            .rra("LAST", &params![0.5, 1, 100])
            .create(true)
            .unwrap();
        engine
    }

    #[test]
    fn test_cached_batch_cleared_on_success() {
        let engine = engine_with_db();
        let mut updater = Updater::new(&engine, "u.rrd");
        for i in 1..=3 {
            updater.cache(&params![at(300 * i), i, i * 10]);
        }
        assert_eq!(updater.pending().len(), 3);

        updater.update(&[]).unwrap();
        assert!(updater.pending().is_empty());
        assert_eq!(engine.last_update("u.rrd"), Some(i64::try_from(T0 + 900).unwrap()));
    }

    #[test]
    fn test_failed_batch_left_intact() {
        let engine = engine_with_db();
        let mut updater = Updater::new(&engine, "u.rrd");
        updater.cache(&params![at(600), 1, 2]);
        // Backwards in time relative to the previous sample.
        updater.cache(&params![at(300), 3, 4]);
        let before = updater.pending().to_vec();

        let err = updater.update(&[]).unwrap_err();
        assert!(matches!(err, RrdError::Engine(_)));
        assert_eq!(updater.pending(), before.as_slice());
        assert_eq!(before[0], format!("{}:1:2", T0 + 600));
    }

    #[test]
    fn test_immediate_update_ignores_batch() {
        let engine = engine_with_db();
        let mut updater = Updater::new(&engine, "u.rrd");
        updater.cache(&params![at(600), 1, 1]);

        updater.update(&params![at(300), 5, 6]).unwrap();
        assert_eq!(updater.pending().len(), 1);
        assert_eq!(engine.last_update("u.rrd"), Some(i64::try_from(T0 + 300).unwrap()));
    }

    #[test]
    fn test_empty_submit_is_noop() {
        let engine = MemoryEngine::new();
        let mut updater = Updater::new(&engine, "missing.rrd");
        updater.update(&[]).unwrap();
        updater.update_no_daemon(&[]).unwrap();
    }

    #[test]
    fn test_missing_database_error_is_verbatim() {
        let engine = MemoryEngine::new();
        let mut updater = Updater::new(&engine, "missing.rrd");
        match updater.update(&params![Param::Now, 1]) {
            Err(RrdError::Engine(e)) => {
                assert_eq!(e.message, "opening 'missing.rrd': No such file or directory");
            }
            other => panic!("expected engine error, got {other:?}"),
        }
    }

    #[test]
    fn test_template_selects_sources() {
        let engine = engine_with_db();
        let mut updater = Updater::new(&engine, "u.rrd");
        updater.set_template(&["b"]);
        assert_eq!(updater.template(), Some("b"));
        updater.update(&params![at(300), 7]).unwrap();

        updater.set_template(&[]);
        assert_eq!(updater.template(), None);
        assert!(updater.update(&params![at(600), 7]).is_err());
    }

    #[test]
    fn test_daemon_route_and_direct_route() {
        let engine = engine_with_db();
        engine.start_daemon("unix:/tmp/cached.sock");

        let mut updater = Updater::with_daemon(&engine, "u.rrd", "unix:/tmp/cached.sock");
        assert_eq!(updater.daemon(), Some("unix:/tmp/cached.sock"));
        updater.update(&params![at(300), 1, 1]).unwrap();
        assert_eq!(engine.cached_samples("unix:/tmp/cached.sock", "u.rrd"), 1);
        assert_eq!(engine.last_update("u.rrd"), Some(i64::try_from(T0).unwrap()));

        let mut direct = Updater::new(&engine, "u.rrd");
        direct.update_no_daemon(&params![at(300), 2, 2]).unwrap();
        assert_eq!(engine.last_update("u.rrd"), Some(i64::try_from(T0 + 300).unwrap()));
    }

    #[test]
    fn test_template_through_daemon_keeps_batch() {
        let engine = engine_with_db();
        engine.start_daemon("unix:/tmp/cached.sock");

        let mut updater = Updater::with_daemon(&engine, "u.rrd", "unix:/tmp/cached.sock");
        updater.set_template(&["b"]);
        updater.cache(&params![at(300), 7]);
        let err = updater.update(&[]).unwrap_err();
        assert!(err.to_string().contains("does not accept a template"), "{err}");
        assert_eq!(updater.pending().len(), 1);

        updater.update_no_daemon(&[]).unwrap();
        assert!(updater.pending().is_empty());
        assert_eq!(engine.last_update("u.rrd"), Some(i64::try_from(T0 + 300).unwrap()));
    }
}
