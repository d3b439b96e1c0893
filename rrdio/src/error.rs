//! Error types for rrdio.

use thiserror::Error;

/// The main error type for all rrdio operations.
///
/// Every variant is returned to the immediate caller. Nothing in this crate
/// logs, reclassifies or retries an error on the caller's behalf.
#[derive(Error, Debug)]
pub enum RrdError {
    /// The storage engine rejected an operation.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Data handed back by the engine violated an invariant of this layer.
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    /// A fetch grid was indexed outside its dimensions.
    #[error("bounds error: {0}")]
    Bounds(#[from] BoundsError),

    /// A fetch grid was used after its buffer was released.
    #[error("{0}")]
    UseAfterRelease(#[from] UseAfterReleaseError),

    /// The pre-creation existence check failed.
    #[error("create error: {0}")]
    Create(#[from] CreateError),

    /// A database definition file could not be loaded or is invalid.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// An operation rejected by the storage engine.
///
/// The message is the engine's own text, passed through verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct EngineError {
    /// The engine's error message.
    pub message: String,
}

impl EngineError {
    /// Wraps an engine message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Internal consistency checks that failed on engine output.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IntegrityError {
    /// The fetched buffer does not hold `rows * columns` values.
    #[error("fetch buffer holds {actual} values, expected {rows} rows x {columns} columns")]
    BufferLengthMismatch {
        /// Row count derived from the adjusted range and step.
        rows: usize,
        /// Number of series names returned.
        columns: usize,
        /// Actual buffer length.
        actual: usize,
    },

    /// The engine reported a zero step.
    #[error("engine returned a zero step for range {start}..{end}")]
    ZeroStep {
        /// Adjusted start (epoch seconds).
        start: i64,
        /// Adjusted end (epoch seconds).
        end: i64,
    },

    /// The engine reported an end before the start.
    #[error("engine returned an inverted range: start {start} > end {end}")]
    InvertedRange {
        /// Adjusted start (epoch seconds).
        start: i64,
        /// Adjusted end (epoch seconds).
        end: i64,
    },

    /// An info key carried an implausibly large sequence index.
    #[error("info key '{key}' has index {index}, above the limit of {max}")]
    InfoIndexOutOfRange {
        /// The raw key.
        key: String,
        /// The parsed index.
        index: usize,
        /// The largest accepted index.
        max: usize,
    },

    /// An info key addressed a field with a different shape than before.
    #[error("info key '{key}' addresses '{field}' as a {expected} but it already holds a {found}")]
    InfoShapeConflict {
        /// The raw key that triggered the conflict.
        key: String,
        /// The field name inside the tree.
        field: String,
        /// The shape the key implies.
        expected: &'static str,
        /// The shape already stored.
        found: &'static str,
    },
}

/// Grid access outside `[0, rows) x [0, columns)`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("cell ({row}, {column}) is outside a {rows}x{columns} grid")]
pub struct BoundsError {
    /// Requested row.
    pub row: usize,
    /// Requested column.
    pub column: usize,
    /// Grid row count.
    pub rows: usize,
    /// Grid column count.
    pub columns: usize,
}

/// Access to a fetch grid whose buffer was already released.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("fetch grid buffer was already released")]
pub struct UseAfterReleaseError;

/// Errors from the overwrite-protection check run before creation.
#[derive(Error, Debug)]
pub enum CreateError {
    /// The target already exists and overwriting was not requested.
    #[error("database '{path}' already exists")]
    AlreadyExists {
        /// The target path.
        path: String,
    },

    /// The target could not be opened for the existence check.
    #[error("failed to access database '{path}': {source}")]
    Access {
        /// The target path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur when loading a database definition.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The definition file could not be read.
    #[error("failed to read definition '{path}': {source}")]
    Read {
        /// The definition file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The definition file is not valid JSON for a definition.
    #[error("failed to parse definition '{path}': {source}")]
    Parse {
        /// The definition file path.
        path: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The definition is syntactically valid but semantically wrong.
    #[error("invalid definition: {reason}")]
    Invalid {
        /// Description of what is invalid.
        reason: String,
    },
}

/// Type alias for `Result<T, RrdError>`.
pub type Result<T> = std::result::Result<T, RrdError>;
