//! Data source and archive vocabulary shared by definitions and engines.
//!
//! These types name the fixed set of data source kinds and consolidation
//! functions a round-robin database understands. Definition files
//! ([`crate::config`]) use them for validation, and the in-process engine
//! ([`crate::engine::MemoryEngine`]) uses them when interpreting
//! declarations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How raw update values are turned into rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DsKind {
    /// Values are stored as given.
    Gauge,
    /// Monotonic counter; the rate of change is stored.
    Counter,
    /// Like a counter but may decrease.
    Derive,
    /// Counter reset on every read; value divided by elapsed time.
    Absolute,
}

impl DsKind {
    /// Returns the declaration keyword.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gauge => "GAUGE",
            Self::Counter => "COUNTER",
            Self::Derive => "DERIVE",
            Self::Absolute => "ABSOLUTE",
        }
    }
}

impl fmt::Display for DsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DsKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GAUGE" => Ok(Self::Gauge),
            "COUNTER" => Ok(Self::Counter),
            "DERIVE" => Ok(Self::Derive),
            "ABSOLUTE" => Ok(Self::Absolute),
            other => Err(format!("unknown data source type '{other}'")),
        }
    }
}

/// Aggregation function applied when rolling primary points into an archive.
///
/// NaN values are filtered out before aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConsolidationFn {
    /// Arithmetic mean of all non-NaN values.
    Average,

    /// Minimum of all non-NaN values.
    Min,

    /// Maximum of all non-NaN values.
    Max,

    /// Most recent (last) non-NaN value.
    Last,
}

impl ConsolidationFn {
    /// Returns the declaration keyword.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Average => "AVERAGE",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Last => "LAST",
        }
    }

    /// Applies this consolidation function to a slice of values.
    ///
    /// NaN values are filtered out before aggregation. If all values are NaN
    /// or the slice is empty, returns NaN.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use rrdio::schema::ConsolidationFn;
    ///
    /// let values = [1.0, 2.0, f64::NAN, 4.0];
    ///
    /// let avg = ConsolidationFn::Average.apply(&values);
    /// assert!((avg - (7.0 / 3.0)).abs() < 1e-10);
    /// assert_eq!(ConsolidationFn::Min.apply(&values), 1.0);
    /// assert_eq!(ConsolidationFn::Max.apply(&values), 4.0);
    /// assert_eq!(ConsolidationFn::Last.apply(&values), 4.0);
    /// ```
    #[allow(clippy::cast_precision_loss)] // Window sizes are far below 2^52
    pub fn apply(self, values: &[f64]) -> f64 {
        let mut valid = values.iter().copied().filter(|v| !v.is_nan()).peekable();
        if valid.peek().is_none() {
            return f64::NAN;
        }

        match self {
            Self::Average => {
                let (sum, count) = valid.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
                sum / count as f64
            }
            Self::Min => valid.fold(f64::INFINITY, f64::min),
            Self::Max => valid.fold(f64::NEG_INFINITY, f64::max),
            Self::Last => valid.last().unwrap_or(f64::NAN),
        }
    }
}

impl fmt::Display for ConsolidationFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsolidationFn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVERAGE" => Ok(Self::Average),
            "MIN" => Ok(Self::Min),
            "MAX" => Ok(Self::Max),
            "LAST" => Ok(Self::Last),
            other => Err(format!("unknown consolidation function '{other}'")),
        }
    }
}

/// Checks a data source name: 1 to 19 characters of `[A-Za-z0-9_]`.
pub fn is_valid_ds_name(name: &str) -> bool {
    (1..=19).contains(&name.len())
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}
