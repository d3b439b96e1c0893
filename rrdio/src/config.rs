//! Database definition files.
//!
//! A definition describes one database as JSON, so it can be kept under
//! version control and created repeatably:
//!
//! ```json
//! {
//!   "target": "/var/lib/rrd/load.rrd",
//!   "step": 300,
//!   "data_sources": [
//!     { "name": "load", "kind": "GAUGE", "heartbeat": 600, "min": 0 }
//!   ],
//!   "archives": [
//!     { "cf": "AVERAGE", "steps": 1, "rows": 288 },
//!     { "cf": "MAX", "xff": 0.5, "steps": 12, "rows": 168 }
//!   ]
//! }
//! ```
//!
//! `step` defaults to 300 seconds, `xff` to 0.5, and unset bounds to
//! unknown. `start` is an optional epoch timestamp; without it the database
//! starts ten seconds ago.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::args::{Param, from_epoch_secs};
use crate::client::Client;
use crate::create::Creator;
use crate::engine::Engine;
use crate::error::{ConfigError, Result};
use crate::schema::{ConsolidationFn, DsKind, is_valid_ds_name};

/// Default base step in seconds.
pub const DEFAULT_STEP: u64 = 300;

/// Default unknown fraction allowed per archive row.
pub const DEFAULT_XFF: f64 = 0.5;

/// How far back a definition without `start` begins.
const DEFAULT_START_OFFSET: Duration = Duration::from_secs(10);

fn default_step() -> u64 {
    DEFAULT_STEP
}

fn default_xff() -> f64 {
    DEFAULT_XFF
}

/// One database definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the database to create.
    pub target: String,
    /// Start time in epoch seconds.
    #[serde(default)]
    pub start: Option<i64>,
    /// Base step in seconds.
    #[serde(default = "default_step")]
    pub step: u64,
    /// Data sources, in column order.
    pub data_sources: Vec<DataSourceConfig>,
    /// Archives, in declaration order.
    pub archives: Vec<ArchiveConfig>,
}

/// One data source of a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceConfig {
    /// Data source name.
    pub name: String,
    /// How readings become rates.
    pub kind: DsKind,
    /// Longest gap in seconds before the value becomes unknown.
    pub heartbeat: u64,
    /// Lowest accepted rate.
    #[serde(default)]
    pub min: Option<f64>,
    /// Highest accepted rate.
    #[serde(default)]
    pub max: Option<f64>,
}

/// One archive of a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Consolidation function.
    pub cf: ConsolidationFn,
    /// Fraction of a row that may be unknown.
    #[serde(default = "default_xff")]
    pub xff: f64,
    /// Primary points per row.
    pub steps: u64,
    /// Number of rows kept.
    pub rows: u64,
}

impl DatabaseConfig {
    /// Loads and validates a definition file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`] if the file
    /// cannot be read or decoded, and [`ConfigError::Invalid`] if it fails
    /// validation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&content, &path.display().to_string())
    }

    /// Parses and validates a definition held in memory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_json(content: &str) -> Result<Self> {
        Self::parse(content, "<inline>")
    }

    fn parse(content: &str, origin: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the definition for mistakes the engine would reject.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.target.is_empty() {
            return Err(invalid("target cannot be empty"));
        }
        if self.step == 0 {
            return Err(invalid("step cannot be zero"));
        }
        if self.data_sources.is_empty() {
            return Err(invalid("at least one data source is required"));
        }
        if self.archives.is_empty() {
            return Err(invalid("at least one archive is required"));
        }

        let mut seen = HashSet::new();
        for ds in &self.data_sources {
            if !is_valid_ds_name(&ds.name) {
                return Err(invalid(format!(
                    "data source name '{}' must be 1-19 characters of [A-Za-z0-9_]",
                    ds.name
                )));
            }
            if !seen.insert(ds.name.as_str()) {
                return Err(invalid(format!("duplicate data source '{}'", ds.name)));
            }
            if ds.heartbeat == 0 {
                return Err(invalid(format!("data source '{}' has a zero heartbeat", ds.name)));
            }
            if let (Some(min), Some(max)) = (ds.min, ds.max)
                && min >= max
            {
                return Err(invalid(format!(
                    "data source '{}' has min ({min}) >= max ({max})",
                    ds.name
                )));
            }
        }

        for (i, rra) in self.archives.iter().enumerate() {
            if !(0.0..1.0).contains(&rra.xff) {
                return Err(invalid(format!("archive {i}: xff must be in [0, 1)")));
            }
            if rra.steps == 0 || rra.rows == 0 {
                return Err(invalid(format!("archive {i}: steps and rows must be positive")));
            }
        }

        Ok(())
    }

    /// Returns the configured start, or ten seconds ago.
    pub fn start_time(&self) -> SystemTime {
        match self.start {
            Some(secs) => from_epoch_secs(secs),
            None => {
                let now = SystemTime::now();
                now.checked_sub(DEFAULT_START_OFFSET).unwrap_or(now)
            }
        }
    }

    /// Translates the definition into a ready-to-run [`Creator`].
    pub fn creator<'c, E: Engine>(&self, client: &'c Client<E>) -> Creator<'c, E> {
        let mut creator = client.creator(self.target.clone(), self.start_time(), self.step);
        for ds in &self.data_sources {
            creator.ds(
                &ds.name,
                ds.kind.as_str(),
                &[Param::from(ds.heartbeat), bound(ds.min), bound(ds.max)],
            );
        }
        for rra in &self.archives {
            creator.rra(
                rra.cf.as_str(),
                &[Param::from(rra.xff), Param::from(rra.steps), Param::from(rra.rows)],
            );
        }
        creator
    }
}

fn bound(value: Option<f64>) -> Param {
    value.map_or_else(|| Param::from("U"), Param::from)
}

fn invalid(reason: impl Into<String>) -> crate::error::RrdError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
    .into()
}
