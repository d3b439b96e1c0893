//! Argument encoding for the engine's colon-delimited string protocol.
//!
//! Creation declarations and update samples are both handed to the engine
//! as positional strings whose fields are joined with `:`:
//!
//! ```text
//! DS:temp:GAUGE:600:-100:100      <- data source declaration
//! RRA:AVERAGE:0.5:1:100           <- archive declaration
//! 1700000300:42.5:U               <- update sample
//! ```
//!
//! Parameters are heterogeneous, so they are carried as [`Param`] values and
//! usually built with the [`params!`](crate::params) macro. No escaping is
//! performed: a `:` inside a parameter produces extra fields and is left for
//! the engine to reject.
//!
//! # Example
//!
//! ```rust
//! use rrdio::args::{DeclKind, encode};
//! use rrdio::params;
//!
//! let decl = encode(DeclKind::Ds, "temp", &params!["GAUGE", 600, -100, 100]);
//! assert_eq!(decl, "DS:temp:GAUGE:600:-100:100");
//! ```

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Field separator used by the engine's argument protocol.
pub const SEPARATOR: char = ':';

/// Kind of a creation declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeclKind {
    /// A data source (`DS:`).
    Ds,
    /// A round-robin archive (`RRA:`).
    Rra,
}

impl DeclKind {
    /// Returns the protocol prefix for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ds => "DS",
            Self::Rra => "RRA",
        }
    }
}

impl fmt::Display for DeclKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single positional parameter.
///
/// Every variant renders with its natural `Display` form except
/// [`Param::Time`], which renders as integer seconds since the Unix epoch,
/// and [`Param::Now`], which renders as the engine's `N` marker.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    UInt(u64),
    /// Floating point value.
    Float(f64),
    /// Free text, such as a DS type, a CF name or `U` for unknown.
    Text(String),
    /// A point in time.
    Time(SystemTime),
    /// The engine's "current time" marker.
    Now,
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
            Self::Time(t) => write!(f, "{}", epoch_secs(*t)),
            Self::Now => f.write_str("N"),
        }
    }
}

macro_rules! impl_from_signed {
    ($($t:ty),*) => {
        $(impl From<$t> for Param {
            fn from(v: $t) -> Self {
                Self::Int(i64::from(v))
            }
        })*
    };
}

macro_rules! impl_from_unsigned {
    ($($t:ty),*) => {
        $(impl From<$t> for Param {
            fn from(v: $t) -> Self {
                Self::UInt(u64::from(v))
            }
        })*
    };
}

impl_from_signed!(i8, i16, i32, i64);
impl_from_unsigned!(u8, u16, u32, u64);

impl From<isize> for Param {
    fn from(v: isize) -> Self {
        Self::Int(v as i64)
    }
}

impl From<usize> for Param {
    fn from(v: usize) -> Self {
        Self::UInt(v as u64)
    }
}

impl From<f32> for Param {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<f64> for Param {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Param {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<SystemTime> for Param {
    fn from(v: SystemTime) -> Self {
        Self::Time(v)
    }
}

/// Builds an array of [`Param`] from heterogeneous expressions.
///
/// ```rust
/// use rrdio::params;
/// use rrdio::args::join;
///
/// assert_eq!(join(&params![600, "U", 0.5]), "600:U:0.5");
/// assert!(params![].is_empty());
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ([] as [$crate::args::Param; 0])
    };
    ($($p:expr),+ $(,)?) => {
        [$($crate::args::Param::from($p)),+]
    };
}

/// Joins parameters with `:`.
pub fn join(params: &[Param]) -> String {
    let mut out = String::new();
    for (i, param) in params.iter().enumerate() {
        if i > 0 {
            out.push(SEPARATOR);
        }
        out.push_str(&param.to_string());
    }
    out
}

/// Encodes a declaration as `KIND:name:p1:...:pn`.
///
/// The result always has exactly `params.len() + 2` colon-separated fields
/// provided no parameter itself contains a `:`.
pub fn encode(kind: DeclKind, name: &str, params: &[Param]) -> String {
    let mut out = format!("{kind}{SEPARATOR}{name}");
    if !params.is_empty() {
        out.push(SEPARATOR);
        out.push_str(&join(params));
    }
    out
}

/// Converts a point in time to whole seconds since the Unix epoch.
///
/// Times before the epoch floor towards negative infinity.
#[allow(clippy::cast_possible_wrap)] // Seconds beyond i64::MAX are clamped first
pub fn epoch_secs(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_secs().min(i64::MAX as u64) as i64,
        Err(before) => {
            let d = before.duration();
            let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
            -(secs.min(i64::MAX as u64) as i64)
        }
    }
}

/// Converts whole seconds since the Unix epoch back to a point in time.
pub fn from_epoch_secs(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs.unsigned_abs())
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_ds_declaration() {
        let decl = encode(DeclKind::Ds, "temp", &params!["GAUGE", 600, -100, 100]);
        assert_eq!(decl, "DS:temp:GAUGE:600:-100:100");
    }

    #[test]
    fn test_encode_field_count() {
        let cases: Vec<Vec<Param>> = vec![
            vec![],
            params![1].to_vec(),
            params!["AVERAGE", 0.5, 1u32, 100usize].to_vec(),
            params![-1i8, 2u16, 3.25f32, "x", String::from("y")].to_vec(),
        ];
        for params in cases {
            for kind in [DeclKind::Ds, DeclKind::Rra] {
                let encoded = encode(kind, "name", &params);
                assert_eq!(
                    encoded.split(SEPARATOR).count(),
                    params.len() + 2,
                    "{encoded}"
                );
            }
        }
    }

    #[test]
    fn test_encode_without_params_has_no_trailing_separator() {
        assert_eq!(encode(DeclKind::Rra, "MAX", &[]), "RRA:MAX");
    }

    #[test]
    fn test_timestamp_renders_as_epoch() {
        let t = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let decl = encode(DeclKind::Rra, "LAST", &params![t, 0.5]);
        assert_eq!(decl, "RRA:LAST:1700000000:0.5");
        assert_eq!(join(&params![t, 1.5, "U"]), "1700000000:1.5:U");
    }

    #[test]
    fn test_sub_second_time_truncates() {
        let t = UNIX_EPOCH + Duration::from_millis(1_700_000_000_999);
        assert_eq!(Param::from(t).to_string(), "1700000000");
    }

    #[test]
    fn test_now_marker() {
        assert_eq!(join(&[Param::Now, Param::from(7)]), "N:7");
    }

    #[test]
    fn test_float_formatting() {
        assert_eq!(Param::from(42.0).to_string(), "42");
        assert_eq!(Param::from(0.5).to_string(), "0.5");
        assert_eq!(Param::from(-12.75).to_string(), "-12.75");
    }

    #[test]
    fn test_epoch_conversions() {
        assert_eq!(epoch_secs(UNIX_EPOCH), 0);
        assert_eq!(epoch_secs(from_epoch_secs(1_234)), 1_234);
        assert_eq!(epoch_secs(from_epoch_secs(-86_400)), -86_400);
        assert_eq!(epoch_secs(UNIX_EPOCH - Duration::from_millis(500)), -1);
    }
}
