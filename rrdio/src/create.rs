//! Database creation.
//!
//! A [`Creator`] collects the declarations of a new database, encoded with
//! [`crate::args`], and submits them to the engine in one call:
//!
//! ```rust
//! use std::time::{Duration, UNIX_EPOCH};
//! use rrdio::{Client, MemoryEngine, params};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(MemoryEngine::new());
//! let start = UNIX_EPOCH + Duration::from_secs(1_700_000_100);
//!
//! let mut creator = client.creator("load.rrd", start, 300);
//! creator
//!     .ds("load", "GAUGE", &params![600, 0, "U"])
//!     .rra("AVERAGE", &params![0.5, 1, 288]);
//! assert_eq!(creator.declarations(), ["DS:load:GAUGE:600:0:U", "RRA:AVERAGE:0.5:1:288"]);
//!
//! creator.create(true)?;
//! # Ok(())
//! # }
//! ```

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::time::SystemTime;

use crate::args::{DeclKind, Param, encode, epoch_secs};
use crate::engine::Engine;
use crate::error::{CreateError, Result};

/// Builder for one database's creation parameters.
#[derive(Debug)]
pub struct Creator<'e, E: ?Sized> {
    engine: &'e E,
    target: String,
    start: SystemTime,
    step: u64,
    args: Vec<String>,
}

impl<'e, E: Engine + ?Sized> Creator<'e, E> {
    /// Starts a definition.
    ///
    /// * `target` - database to create
    /// * `start` - samples at or before this time are rejected
    /// * `step` - base interval in seconds at which data is fed in
    pub fn new(engine: &'e E, target: impl Into<String>, start: SystemTime, step: u64) -> Self {
        Self {
            engine,
            target: target.into(),
            start,
            step,
            args: Vec::new(),
        }
    }

    /// Appends a data source declaration `DS:name:kind:params...`.
    pub fn ds(&mut self, name: &str, kind: &str, params: &[Param]) -> &mut Self {
        let mut all = Vec::with_capacity(params.len() + 1);
        all.push(Param::from(kind));
        all.extend_from_slice(params);
        self.args.push(encode(DeclKind::Ds, name, &all));
        self
    }

    /// Appends an archive declaration `RRA:cf:params...`.
    pub fn rra(&mut self, cf: &str, params: &[Param]) -> &mut Self {
        self.args.push(encode(DeclKind::Rra, cf, params));
        self
    }

    /// Appends an already encoded declaration verbatim.
    pub fn declare(&mut self, declaration: impl Into<String>) -> &mut Self {
        self.args.push(declaration.into());
        self
    }

    /// Returns the database this creator targets.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Returns the start time.
    pub fn start(&self) -> SystemTime {
        self.start
    }

    /// Returns the base step in seconds.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Returns the encoded declarations in submission order.
    pub fn declarations(&self) -> &[String] {
        &self.args
    }

    /// Creates the database.
    ///
    /// With `overwrite == false` the target is first created exclusively on
    /// the filesystem, so an existing file makes the call fail before the
    /// engine is involved. With `overwrite == true` an existing database is
    /// replaced.
    ///
    /// # Errors
    ///
    /// - [`CreateError::AlreadyExists`] if the target exists and `overwrite`
    ///   is false
    /// - [`CreateError::Access`] if the existence check could not run
    /// - [`crate::EngineError`] if the engine rejects the declarations
    pub fn create(&self, overwrite: bool) -> Result<()> {
        if !overwrite {
            self.claim_target()?;
        }

        tracing::debug!(
            database = %self.target,
            step = self.step,
            declarations = self.args.len(),
            "creating database"
        );
        self.engine
            .create(&self.target, self.step, epoch_secs(self.start), &self.args)?;
        Ok(())
    }

    fn claim_target(&self) -> std::result::Result<(), CreateError> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.target)
            .map(drop)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => CreateError::AlreadyExists {
                    path: self.target.clone(),
                },
                _ => CreateError::Access {
                    path: self.target.clone(),
                    source: e,
                },
            })
    }
}
