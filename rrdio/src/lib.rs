//! # rrdio
//!
//! Typed access to round-robin time-series databases.
//!
//! rrdio sits between application code and a round-robin storage engine
//! such as rrdtool's `librrd`. It turns typed values into the engine's
//! colon-separated argument strings, batches samples client-side, rebuilds
//! the engine's flat metadata records into a nested tree, and exposes fetched
//! values as a bounds-checked grid over the engine's own buffer.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Engine-agnostic core behind the [`Engine`] trait
//! - Samples cached client-side are kept until the engine accepts them
//! - Fetch results are never copied unless asked to, and are released once
//! - Engine error messages are passed through verbatim
//!
//! ## Quick Start
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
//! // One GAUGE data source, one AVERAGE archive of 100 rows
//! client
//!     .creator("x.rrd", t0, 300)
//!     .ds("temp", "GAUGE", &params![600, -100, 100])
//!     .rra("AVERAGE", &params![0.5, 1, 100])
//!     .create(true)?;
//!
//! // Submit one sample
//! client.updater("x.rrd").update(&params![t0 + step, 42.0])?;
//!
//! // Read it back
//! let mut grid = client.fetch("x.rrd", "AVERAGE", t0, t0 + 2 * step, step)?;
//! assert_eq!(grid.at(1, 0)?, 42.0);
//! grid.release()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Client`]: owns an engine; entry point for everything below
//! - [`Creator`]: collects DS/RRA declarations and creates a database
//! - [`Updater`]: immediate or batched sample submission
//! - [`InfoTree`]: database metadata as scalars, sequences and mappings
//! - [`FetchGrid`]: time x series view over an engine-owned buffer
//!
//! ## Modules
//!
//! - [`args`]: typed parameters and the colon-joined argument encoding
//! - [`update`]: the sample buffer
//! - [`info`]: the info record parser
//! - [`fetch`]: the fetch grid
//! - [`engine`]: the engine boundary and its implementations
//! - [`config`]: JSON database definitions
//! - [`schema`]: data source kinds and consolidation functions
//! - [`error`]: error types
//!
//! ## Features
//!
//! - `librrd`: link the system rrdtool library and expose `LibRrd`

pub mod args;
pub mod client;
pub mod config;
pub mod create;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod info;
pub mod schema;
pub mod update;

// Re-export primary API types at crate root for convenience.
pub use args::Param;
pub use client::Client;
pub use config::DatabaseConfig;
pub use create::Creator;
#[cfg(feature = "librrd")]
pub use engine::LibRrd;
pub use engine::{Engine, EngineBuffer, MemoryEngine};
pub use error::{EngineError, Result, RrdError};
pub use fetch::FetchGrid;
pub use info::{InfoTree, InfoValue, Scalar};
pub use schema::{ConsolidationFn, DsKind};
pub use update::Updater;
