//! Time × series grids over engine-owned fetch buffers.
//!
//! The engine returns fetched values as one flat, row-major buffer that it
//! allocated itself. [`FetchGrid`] wraps that buffer without copying it:
//!
//! ```text
//!            col 0   col 1   ...   col C-1
//! row 0    [ 0       1             C-1     ]   <- start
//! row 1    [ C       C+1           2C-1    ]   <- start + step
//! ...
//! row R-1  [ ...                   RC-1    ]   <- end
//! ```
//!
//! Cell `(r, c)` lives at flat offset `C * r + c`.
//!
//! # Ownership
//!
//! The buffer goes back to the engine through [`FetchGrid::release`], which
//! may succeed only once. After release the grid keeps its metadata but every
//! value access fails with [`UseAfterReleaseError`]. Callers who need the
//! values longer take an owned duplicate with [`FetchGrid::copy`] first.
//! A grid dropped without an explicit release hands its buffer back from
//! `Drop`.

use std::fmt;
use std::time::{Duration, SystemTime};

use crate::args::from_epoch_secs;
use crate::engine::{EngineBuffer, RawFetch};
use crate::error::{BoundsError, IntegrityError, Result, UseAfterReleaseError};

/// A two-dimensional view of fetched values.
pub struct FetchGrid {
    target: String,
    cf: String,
    start: i64,
    end: i64,
    step: u64,
    ds_names: Vec<String>,
    rows: usize,
    buffer: Option<Box<dyn EngineBuffer>>,
}

impl FetchGrid {
    /// Wraps raw engine output, validating its shape.
    ///
    /// The row count is `(end - start) / step + 1` using the engine's adjusted
    /// range. On any validation failure the buffer is released before the
    /// error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`IntegrityError`] if the step is zero, the range is inverted,
    /// or the buffer length is not `rows * ds_names.len()`.
    pub fn new(target: impl Into<String>, cf: impl Into<String>, raw: RawFetch) -> Result<Self> {
        let RawFetch {
            start,
            end,
            step,
            ds_names,
            buffer,
        } = raw;

        if step == 0 {
            buffer.release();
            return Err(IntegrityError::ZeroStep { start, end }.into());
        }
        if end < start {
            buffer.release();
            return Err(IntegrityError::InvertedRange { start, end }.into());
        }

        let columns = ds_names.len();
        let actual = buffer.values().len();
        let rows = usize::try_from(end.abs_diff(start) / step + 1).ok();
        let expected = rows.and_then(|r| r.checked_mul(columns));

        let Some(rows) = rows.filter(|_| expected == Some(actual)) else {
            buffer.release();
            return Err(IntegrityError::BufferLengthMismatch {
                rows: rows.unwrap_or(usize::MAX),
                columns,
                actual,
            }
            .into());
        };

        Ok(Self {
            target: target.into(),
            cf: cf.into(),
            start,
            end,
            step,
            ds_names,
            rows,
            buffer: Some(buffer),
        })
    }

    /// Returns the database this grid was fetched from.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Returns the consolidation function that was requested.
    pub fn cf(&self) -> &str {
        &self.cf
    }

    /// Returns the adjusted start time (the timestamp of row 0).
    pub fn start(&self) -> SystemTime {
        from_epoch_secs(self.start)
    }

    /// Returns the adjusted end time (the timestamp of the last row).
    pub fn end(&self) -> SystemTime {
        from_epoch_secs(self.end)
    }

    /// Returns the adjusted start as epoch seconds.
    pub fn start_epoch(&self) -> i64 {
        self.start
    }

    /// Returns the adjusted end as epoch seconds.
    pub fn end_epoch(&self) -> i64 {
        self.end
    }

    /// Returns the adjusted step between rows.
    pub fn step(&self) -> Duration {
        Duration::from_secs(self.step)
    }

    /// Returns the number of time rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Returns the number of series columns.
    pub fn columns(&self) -> usize {
        self.ds_names.len()
    }

    /// Returns series names in column order.
    pub fn series_names(&self) -> &[String] {
        &self.ds_names
    }

    /// Returns the column of the series called `name`.
    pub fn ds_index(&self, name: &str) -> Option<usize> {
        self.ds_names.iter().position(|n| n == name)
    }

    /// Returns whether the buffer has been released.
    pub fn is_released(&self) -> bool {
        self.buffer.is_none()
    }

    /// Returns the timestamp of `row`.
    ///
    /// Metadata outlives the buffer, so this works after release.
    ///
    /// # Errors
    ///
    /// Returns [`BoundsError`] if `row >= rows()`.
    pub fn timestamp(&self, row: usize) -> Result<SystemTime> {
        if row >= self.rows {
            return Err(self.out_of_bounds(row, 0).into());
        }
        let offset = u64::try_from(row).unwrap_or(u64::MAX).saturating_mul(self.step);
        Ok(self.start() + Duration::from_secs(offset))
    }

    /// Returns the value at `(row, column)`.
    ///
    /// # Errors
    ///
    /// Returns [`UseAfterReleaseError`] after [`FetchGrid::release`], and
    /// [`BoundsError`] for a cell outside the grid.
    pub fn at(&self, row: usize, column: usize) -> Result<f64> {
        let values = self.values()?;
        if row >= self.rows || column >= self.columns() {
            return Err(self.out_of_bounds(row, column).into());
        }
        Ok(values[self.columns() * row + column])
    }

    /// Returns an owned copy of all values in row-major order.
    ///
    /// # Errors
    ///
    /// Returns [`UseAfterReleaseError`] after [`FetchGrid::release`].
    pub fn copy(&self) -> Result<Vec<f64>> {
        Ok(self.values()?.to_vec())
    }

    /// Hands the buffer back to the engine.
    ///
    /// # Errors
    ///
    /// Returns [`UseAfterReleaseError`] if the buffer was already released.
    pub fn release(&mut self) -> Result<()> {
        let buffer = self.buffer.take().ok_or(UseAfterReleaseError)?;
        buffer.release();
        Ok(())
    }

    fn values(&self) -> Result<&[f64]> {
        self.buffer
            .as_deref()
            .map(|buffer| buffer.values())
            .ok_or_else(|| UseAfterReleaseError.into())
    }

    fn out_of_bounds(&self, row: usize, column: usize) -> BoundsError {
        BoundsError {
            row,
            column,
            rows: self.rows,
            columns: self.columns(),
        }
    }
}

impl fmt::Debug for FetchGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchGrid")
            .field("target", &self.target)
            .field("cf", &self.cf)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("step", &self.step)
            .field("ds_names", &self.ds_names)
            .field("rows", &self.rows)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for FetchGrid {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            tracing::debug!(database = %self.target, "fetch grid dropped unreleased, returning buffer");
            buffer.release();
        }
    }
}
