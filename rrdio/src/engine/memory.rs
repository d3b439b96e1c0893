//! In-process round-robin engine.
//!
//! [`MemoryEngine`] implements [`Engine`] without any system library. It
//! keeps each database either in memory or as a JSON document at the target
//! path, and understands the same declaration and sample strings as
//! `librrd`:
//!
//! ```text
//! DS:<name>:<GAUGE|COUNTER|DERIVE|ABSOLUTE>:<heartbeat>:<min|U>:<max|U>
//! RRA:<AVERAGE|MIN|MAX|LAST>:<xff>:<steps>:<rows>
//! <timestamp|N>:<value|U>[:<value|U>...]
//! ```
//!
//! # Storage model
//!
//! Every update converts each reading into a rate and spreads it over the
//! seconds since the previous update. At each multiple of the base step the
//! accumulated rate is closed into a primary point, which is known when more
//! than half of the step was covered by known rates. Archives are not stored
//! separately: a fetch consolidates primary points on the fly with the
//! archive's function and unknown-fraction limit (`xff`). Points older than
//! the longest archive are discarded.
//!
//! # Daemons
//!
//! Caching daemons are simulated per engine. [`MemoryEngine::start_daemon`]
//! registers an address; updates routed to it are validated and held until
//! the target is flushed, read, or fetched through the same address. Updates
//! routed to an address that was never started fall back to a direct write.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::{Engine, FetchRequest, RawFetch, VecBuffer, daemon_template_error};
use crate::args::{SEPARATOR, epoch_secs};
use crate::error::EngineError;
use crate::info::{InfoRecord, Scalar};
use crate::schema::{ConsolidationFn, DsKind, is_valid_ds_name};

/// Version string reported as `rrd_version`.
const RRD_VERSION: &str = "0003";

/// Placeholder for an unknown reading or an unset bound.
const UNKNOWN: &str = "U";

/// Timestamp placeholder for "now".
const NOW: &str = "N";

/// Most values one fetch may produce.
const MAX_FETCH_VALUES: usize = 1 << 26;

/// Where databases live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Storage {
    Memory,
    Files,
}

#[derive(Debug, Default)]
struct State {
    databases: HashMap<String, Database>,
    /// daemon address -> target -> samples not yet written.
    daemons: HashMap<String, HashMap<String, Vec<String>>>,
}

/// An in-process [`Engine`].
///
/// All state sits behind one mutex; every primitive holds it for its whole
/// duration.
#[derive(Debug)]
pub struct MemoryEngine {
    storage: Storage,
    state: Mutex<State>,
    live: Arc<AtomicUsize>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Creates an engine that keeps databases in memory, keyed by target.
    pub fn new() -> Self {
        Self::with_storage(Storage::Memory)
    }

    /// Creates an engine that stores each database as JSON at its target
    /// path.
    pub fn file_backed() -> Self {
        Self::with_storage(Storage::Files)
    }

    fn with_storage(storage: Storage) -> Self {
        Self {
            storage,
            state: Mutex::new(State::default()),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Registers a simulated caching daemon at `address`.
    pub fn start_daemon(&self, address: impl Into<String>) {
        self.lock().daemons.entry(address.into()).or_default();
    }

    /// Number of samples `daemon` holds for `target`.
    pub fn cached_samples(&self, daemon: &str, target: &str) -> usize {
        self.lock()
            .daemons
            .get(daemon)
            .and_then(|targets| targets.get(target))
            .map_or(0, Vec::len)
    }

    /// Last update time of `target` in epoch seconds, if it exists.
    pub fn last_update(&self, target: &str) -> Option<i64> {
        let state = self.lock();
        self.load(&state, target).ok().map(|db| db.last_update)
    }

    /// Number of fetch buffers handed out and not yet released or dropped.
    pub fn outstanding_buffers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self, state: &State, target: &str) -> Result<Database, EngineError> {
        match self.storage {
            Storage::Memory => state
                .databases
                .get(target)
                .cloned()
                .ok_or_else(|| not_found(target)),
            Storage::Files => {
                let content = fs::read_to_string(target).map_err(|e| match e.kind() {
                    ErrorKind::NotFound => not_found(target),
                    _ => EngineError::new(format!("opening '{target}': {e}")),
                })?;
                serde_json::from_str(&content)
                    .map_err(|_| EngineError::new(format!("'{target}' is not an RRD file")))
            }
        }
    }

    fn store(&self, state: &mut State, target: &str, database: Database) -> Result<(), EngineError> {
        match self.storage {
            Storage::Memory => {
                state.databases.insert(target.to_owned(), database);
                Ok(())
            }
            Storage::Files => {
                let content = serde_json::to_string_pretty(&database)
                    .map_err(|e| EngineError::new(format!("writing '{target}': {e}")))?;
                fs::write(target, content)
                    .map_err(|e| EngineError::new(format!("writing '{target}': {e}")))
            }
        }
    }

    /// Applies samples directly. Samples before a rejected one stay applied.
    fn write(
        &self,
        state: &mut State,
        target: &str,
        template: Option<&str>,
        samples: &[String],
    ) -> Result<(), EngineError> {
        let mut database = self.load(state, target)?;
        let result = database.apply_all(template, samples, now());
        self.store(state, target, database)?;
        result
    }

    /// Validates samples against the database plus what `daemon` already
    /// holds, then queues them.
    fn enqueue(
        &self,
        state: &mut State,
        daemon: &str,
        target: &str,
        samples: &[String],
    ) -> Result<(), EngineError> {
        let now = now();
        let mut scratch = self.load(state, target)?;
        let queued = state
            .daemons
            .get(daemon)
            .and_then(|targets| targets.get(target))
            .map(Vec::as_slice)
            .unwrap_or_default();
        scratch.apply_all(None, queued, now)?;
        scratch.apply_all(None, samples, now)?;

        let queue = state
            .daemons
            .entry(daemon.to_owned())
            .or_default()
            .entry(target.to_owned())
            .or_default();
        queue.extend(samples.iter().map(|sample| resolve_now(sample, now)));
        Ok(())
    }

    /// Writes out whatever a registered `daemon` holds for `target`.
    fn drain(&self, state: &mut State, daemon: &str, target: &str) -> Result<(), EngineError> {
        let cached = state
            .daemons
            .get_mut(daemon)
            .and_then(|targets| targets.remove(target))
            .unwrap_or_default();
        if cached.is_empty() {
            return Ok(());
        }

        tracing::debug!(database = target, daemon, samples = cached.len(), "draining daemon cache");
        self.write(state, target, None, &cached)
    }

    fn registered<'a>(state: &State, daemon: Option<&'a str>) -> Option<&'a str> {
        daemon.filter(|address| state.daemons.contains_key(*address))
    }
}

impl Engine for MemoryEngine {
    fn create(
        &self,
        target: &str,
        step: u64,
        start: i64,
        declarations: &[String],
    ) -> Result<(), EngineError> {
        let database = Database::define(step, start, declarations)?;
        tracing::debug!(
            database = target,
            sources = database.sources.len(),
            archives = database.archives.len(),
            "memory engine create"
        );
        let mut state = self.lock();
        self.store(&mut state, target, database)
    }

    fn update(
        &self,
        target: &str,
        template: Option<&str>,
        daemon: Option<&str>,
        samples: &[String],
    ) -> Result<(), EngineError> {
        let mut state = self.lock();
        if let Some(address) = Self::registered(&state, daemon) {
            if template.is_some() {
                return Err(daemon_template_error(address));
            }
            return self.enqueue(&mut state, address, target, samples);
        }
        self.write(&mut state, target, template, samples)
    }

    fn update_no_daemon(
        &self,
        target: &str,
        template: Option<&str>,
        samples: &[String],
    ) -> Result<(), EngineError> {
        let mut state = self.lock();
        self.write(&mut state, target, template, samples)
    }

    fn info(&self, target: &str, daemon: Option<&str>) -> Result<Vec<InfoRecord>, EngineError> {
        let mut state = self.lock();
        if let Some(address) = Self::registered(&state, daemon) {
            self.drain(&mut state, address, target)?;
        }
        Ok(self.load(&state, target)?.info(target))
    }

    fn fetch(
        &self,
        request: &FetchRequest<'_>,
        daemon: Option<&str>,
    ) -> Result<RawFetch, EngineError> {
        let mut state = self.lock();
        if let Some(address) = Self::registered(&state, daemon) {
            self.drain(&mut state, address, request.target)?;
        }
        let database = self.load(&state, request.target)?;
        let cf: ConsolidationFn = request.cf.parse().map_err(EngineError::new)?;
        let window = database.fetch(cf, request.start, request.end, request.step)?;
        tracing::debug!(
            database = request.target,
            cf = %cf,
            start = window.start,
            end = window.end,
            step = window.step,
            "memory engine fetch"
        );

        Ok(RawFetch {
            start: window.start,
            end: window.end,
            step: window.step.unsigned_abs(),
            ds_names: database.sources.iter().map(|s| s.name.clone()).collect(),
            buffer: Box::new(VecBuffer::new(window.values, Arc::clone(&self.live))),
        })
    }

    fn flush(&self, daemon: &str, target: &str) -> Result<(), EngineError> {
        if daemon.is_empty() {
            return Ok(());
        }
        let mut state = self.lock();
        if !state.daemons.contains_key(daemon) {
            return Err(EngineError::new(format!("Unable to connect to rrdcached: {daemon}")));
        }
        self.drain(&mut state, daemon, target)
    }
}

fn now() -> i64 {
    epoch_secs(SystemTime::now())
}

fn not_found(target: &str) -> EngineError {
    EngineError::new(format!("opening '{target}': No such file or directory"))
}

/// Pins an `N` timestamp to `now` so a queued sample keeps its arrival time.
fn resolve_now(sample: &str, now: i64) -> String {
    match sample.split_once(SEPARATOR) {
        Some((NOW, rest)) => format!("{now}{SEPARATOR}{rest}"),
        _ => sample.to_owned(),
    }
}

/// Primary point boundaries touched by an update interval.
#[derive(Debug, Clone, Copy)]
struct Boundaries {
    /// End of the step the interval starts in.
    first: i64,
    /// Last step boundary at or before the interval end.
    last: i64,
    step: i64,
}

/// Boundaries of `(from, to]`, or `None` when stepping past them would
/// leave the `i64` range.
fn boundaries(from: i64, to: i64, step: i64) -> Option<Boundaries> {
    let first = from.div_euclid(step).checked_add(1)?.checked_mul(step)?;
    let last = to.div_euclid(step).checked_mul(step)?;
    first.max(last).checked_add(step)?;
    Some(Boundaries { first, last, step })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Database {
    step: i64,
    last_update: i64,
    sources: Vec<Source>,
    archives: Vec<Archive>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Source {
    name: String,
    kind: DsKind,
    heartbeat: u64,
    min: Option<f64>,
    max: Option<f64>,
    last_ds: String,
    /// Previous reading, kept for counter-like kinds.
    last_raw: Option<f64>,
    /// Rate-seconds accumulated in the open step.
    pdp_sum: f64,
    /// Seconds of the open step covered by known rates.
    known_secs: i64,
    /// Closed primary points keyed by the end of their step.
    points: BTreeMap<i64, Option<f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Archive {
    cf: ConsolidationFn,
    xff: f64,
    steps: u64,
    rows: u64,
}

/// Consolidated fetch output.
struct Window {
    start: i64,
    end: i64,
    step: i64,
    values: Vec<f64>,
}

impl Database {
    fn define(step: u64, start: i64, declarations: &[String]) -> Result<Self, EngineError> {
        let step = match i64::try_from(step) {
            Ok(step) if step > 0 => step,
            _ => return Err(EngineError::new("step size should be no less than one second")),
        };

        let mut sources: Vec<Source> = Vec::new();
        let mut archives = Vec::new();
        for declaration in declarations {
            let fields: Vec<&str> = declaration.split(SEPARATOR).collect();
            match fields.as_slice() {
                ["DS", name, kind, heartbeat, min, max] => {
                    if sources.iter().any(|s| s.name == *name) {
                        return Err(EngineError::new(format!("Duplicate DS name: {name}")));
                    }
                    sources.push(Source::declare(name, kind, heartbeat, min, max)?);
                }
                ["RRA", cf, xff, steps, rows] => {
                    archives.push(Archive::declare(cf, xff, steps, rows)?);
                }
                _ => {
                    return Err(EngineError::new(format!(
                        "can't parse argument '{declaration}'"
                    )));
                }
            }
        }

        if sources.is_empty() {
            return Err(EngineError::new("you must define at least one Data Source"));
        }
        if archives.is_empty() {
            return Err(EngineError::new("you must define at least one Round Robin Archive"));
        }

        Ok(Self {
            step,
            last_update: start,
            sources,
            archives,
        })
    }

    /// Primary points the longest archive reaches back.
    fn retention(&self) -> i64 {
        self.archives
            .iter()
            .map(|a| a.steps.saturating_mul(a.rows))
            .max()
            .map_or(1, |points| i64::try_from(points).unwrap_or(i64::MAX))
    }

    fn archive_step(&self, archive: &Archive) -> i64 {
        i64::try_from(archive.steps)
            .unwrap_or(i64::MAX)
            .saturating_mul(self.step)
    }

    /// End of the newest closed primary point.
    fn newest_point(&self) -> i64 {
        self.last_update.div_euclid(self.step).saturating_mul(self.step)
    }

    fn apply_all(
        &mut self,
        template: Option<&str>,
        samples: &[String],
        now: i64,
    ) -> Result<(), EngineError> {
        let columns = self.columns(template)?;
        for sample in samples {
            self.apply(&columns, sample, now)?;
        }
        Ok(())
    }

    /// Maps each reading position to a source index.
    fn columns(&self, template: Option<&str>) -> Result<Vec<usize>, EngineError> {
        let Some(template) = template else {
            return Ok((0..self.sources.len()).collect());
        };
        template
            .split(SEPARATOR)
            .map(|name| {
                self.sources
                    .iter()
                    .position(|s| s.name == name)
                    .ok_or_else(|| EngineError::new(format!("unknown DS name '{name}'")))
            })
            .collect()
    }

    fn apply(&mut self, columns: &[usize], sample: &str, now: i64) -> Result<(), EngineError> {
        let mut fields = sample.split(SEPARATOR);
        let time = match fields.next() {
            Some(NOW) => now,
            Some(stamp) => stamp.parse::<i64>().map_err(|_| {
                EngineError::new(format!("expected timestamp not found in data source from {sample}"))
            })?,
            None => return Err(EngineError::new("no data source readings")),
        };
        let fields: Vec<&str> = fields.collect();
        if fields.len() != columns.len() {
            return Err(EngineError::new(format!(
                "expected {} data source readings (got {}) from {sample}",
                columns.len(),
                fields.len()
            )));
        }
        if time <= self.last_update {
            return Err(EngineError::new(format!(
                "illegal attempt to update using time {time} when last update time is {} (minimum one second step)",
                self.last_update
            )));
        }

        let mut readings: Vec<(Option<f64>, &str)> = vec![(None, UNKNOWN); self.sources.len()];
        for (&column, &field) in columns.iter().zip(&fields) {
            readings[column] = (parse_reading(field)?, field);
        }

        let previous = self.last_update;
        let step = self.step;
        let (Some(elapsed), Some(bounds)) = (time.checked_sub(previous), boundaries(previous, time, step))
        else {
            return Err(EngineError::new(format!("timestamp out of range in {sample}")));
        };
        let keep_from = time
            .div_euclid(step)
            .saturating_mul(step)
            .saturating_sub((self.retention() - 1).saturating_mul(step));
        for (source, (reading, text)) in self.sources.iter_mut().zip(readings) {
            let rate = source.rate(reading, text, elapsed);
            source.accumulate(rate, previous, time, bounds, keep_from);
            source.points = source.points.split_off(&keep_from);
        }
        self.last_update = time;
        Ok(())
    }

    fn fetch(&self, cf: ConsolidationFn, start: i64, end: i64, step: u64) -> Result<Window, EngineError> {
        if start > end {
            return Err(EngineError::new(format!(
                "start ({start}) should be less than end ({end})"
            )));
        }
        let archive = self.choose_archive(cf, start, step)?;
        let arch_step = self.archive_step(archive);

        let out_of_range = || EngineError::new(format!("timestamp out of range: {start} to {end}"));
        let first = start.checked_sub(start.rem_euclid(arch_step)).ok_or_else(out_of_range)?;
        let last = match end.rem_euclid(arch_step) {
            0 => end,
            offset => end.checked_add(arch_step - offset).ok_or_else(out_of_range)?,
        };
        let rows = last
            .checked_sub(first)
            .and_then(|span| usize::try_from(span / arch_step + 1).ok())
            .filter(|rows| rows.saturating_mul(self.sources.len()) <= MAX_FETCH_VALUES)
            .ok_or_else(|| EngineError::new("fetch range too large"))?;

        let mut values = Vec::with_capacity(rows * self.sources.len());
        let mut boundary = first;
        for _ in 0..rows {
            values.extend(self.sources.iter().map(|s| self.consolidate(s, archive, boundary)));
            boundary = boundary.saturating_add(arch_step);
        }

        Ok(Window {
            start: first,
            end: last,
            step: arch_step,
            values,
        })
    }

    /// Picks the archive covering `start` whose step is closest to the
    /// request, else the longest one with the right function.
    fn choose_archive(&self, cf: ConsolidationFn, start: i64, step: u64) -> Result<&Archive, EngineError> {
        let wanted = if step == 0 { self.step.unsigned_abs() } else { step };
        let span = |a: &Archive| {
            self.archive_step(a)
                .saturating_mul(i64::try_from(a.rows).unwrap_or(i64::MAX))
        };

        let candidates: Vec<&Archive> = self.archives.iter().filter(|a| a.cf == cf).collect();
        let covering = candidates
            .iter()
            .copied()
            .filter(|a| self.last_update.saturating_sub(span(*a)) <= start)
            .min_by_key(|a| self.archive_step(a).unsigned_abs().abs_diff(wanted));
        covering
            .or_else(|| candidates.iter().copied().max_by_key(|a| span(*a)))
            .ok_or_else(|| EngineError::new("the RRD does not contain an RRA matching the chosen CF"))
    }

    /// Consolidated value of the archive row ending at `boundary`.
    #[allow(clippy::cast_precision_loss)] // Step counts are far below 2^52
    fn consolidate(&self, source: &Source, archive: &Archive, boundary: i64) -> f64 {
        let arch_step = self.archive_step(archive);
        let newest = self.newest_point();
        let reach = arch_step.saturating_mul(i64::try_from(archive.rows).unwrap_or(i64::MAX));
        if boundary > newest || boundary <= newest.saturating_sub(reach) {
            return f64::NAN;
        }

        let pdps: Vec<f64> = (0..archive.steps)
            .map(|k| boundary.saturating_sub(i64::try_from(k).unwrap_or(i64::MAX).saturating_mul(self.step)))
            .map(|end| source.points.get(&end).copied().flatten().unwrap_or(f64::NAN))
            .collect();
        let unknown = pdps.iter().filter(|v| v.is_nan()).count();
        if unknown as f64 > archive.xff * pdps.len() as f64 {
            return f64::NAN;
        }
        archive.cf.apply(&pdps)
    }

    /// Flat records in the order `rrd_info` reports them.
    fn info(&self, target: &str) -> Vec<InfoRecord> {
        let mut records = vec![
            InfoRecord::new("filename", Scalar::Str(target.to_owned())),
            InfoRecord::new("rrd_version", Scalar::Str(RRD_VERSION.to_owned())),
            InfoRecord::new("step", Scalar::Unsigned(self.step.unsigned_abs())),
            InfoRecord::new(
                "last_update",
                Scalar::Unsigned(u64::try_from(self.last_update).unwrap_or_default()),
            ),
        ];

        let open_secs = self.last_update.saturating_sub(self.newest_point());
        for (index, source) in self.sources.iter().enumerate() {
            let key = |field: &str| format!("ds[{}].{field}", source.name);
            records.extend([
                InfoRecord::new(key("index"), Scalar::Unsigned(index as u64)),
                InfoRecord::new(key("type"), Scalar::Str(source.kind.as_str().to_owned())),
                InfoRecord::new(key("minimal_heartbeat"), Scalar::Unsigned(source.heartbeat)),
                InfoRecord::new(key("min"), Scalar::Float(source.min.unwrap_or(f64::NAN))),
                InfoRecord::new(key("max"), Scalar::Float(source.max.unwrap_or(f64::NAN))),
                InfoRecord::new(key("last_ds"), Scalar::Str(source.last_ds.clone())),
                InfoRecord::new(key("value"), Scalar::Float(source.pdp_sum)),
                InfoRecord::new(
                    key("unknown_sec"),
                    Scalar::Unsigned(open_secs.saturating_sub(source.known_secs).unsigned_abs()),
                ),
            ]);
        }

        let newest = self.newest_point();
        for (index, archive) in self.archives.iter().enumerate() {
            let arch_step = self.archive_step(archive);
            let row_end = newest.div_euclid(arch_step).saturating_mul(arch_step);
            let cur_row = row_end.div_euclid(arch_step).unsigned_abs() % archive.rows;
            let key = |field: &str| format!("rra[{index}].{field}");
            records.extend([
                InfoRecord::new(key("cf"), Scalar::Str(archive.cf.as_str().to_owned())),
                InfoRecord::new(key("rows"), Scalar::Unsigned(archive.rows)),
                InfoRecord::new(key("cur_row"), Scalar::Unsigned(cur_row)),
                InfoRecord::new(key("pdp_per_row"), Scalar::Unsigned(archive.steps)),
                InfoRecord::new(key("xff"), Scalar::Float(archive.xff)),
            ]);

            // Points already closed that the next archive row will include.
            for (column, source) in self.sources.iter().enumerate() {
                let open: Vec<f64> = if row_end < newest {
                    source
                        .points
                        .range(row_end.saturating_add(1)..=newest)
                        .map(|(_, v)| v.unwrap_or(f64::NAN))
                        .collect()
                } else {
                    Vec::new()
                };
                let unknown = open.iter().filter(|v| v.is_nan()).count();
                records.extend([
                    InfoRecord::new(
                        key(&format!("cdp_prep[{column}].value")),
                        Scalar::Float(archive.cf.apply(&open)),
                    ),
                    InfoRecord::new(
                        key(&format!("cdp_prep[{column}].unknown_datapoints")),
                        Scalar::Unsigned(unknown as u64),
                    ),
                ]);
            }
        }
        records
    }
}

impl Source {
    fn declare(name: &str, kind: &str, heartbeat: &str, min: &str, max: &str) -> Result<Self, EngineError> {
        if !is_valid_ds_name(name) {
            return Err(EngineError::new(format!("Invalid DS name: {name}")));
        }
        let kind: DsKind = kind.parse().map_err(EngineError::new)?;
        let heartbeat = parse_count(heartbeat, "heartbeat")?;
        let min = parse_bound(min, "minimum")?;
        let max = parse_bound(max, "maximum")?;
        if let (Some(lo), Some(hi)) = (min, max)
            && lo >= hi
        {
            return Err(EngineError::new(format!(
                "min must be less than max in DS definition for {name}"
            )));
        }

        Ok(Self {
            name: name.to_owned(),
            kind,
            heartbeat,
            min,
            max,
            last_ds: UNKNOWN.to_owned(),
            last_raw: None,
            pdp_sum: 0.0,
            known_secs: 0,
            points: BTreeMap::new(),
        })
    }

    /// Converts a reading into a per-second rate, or `None` when unknown.
    #[allow(clippy::cast_precision_loss)] // Elapsed seconds are far below 2^52
    fn rate(&mut self, reading: Option<f64>, text: &str, elapsed: i64) -> Option<f64> {
        text.clone_into(&mut self.last_ds);
        let previous = match self.kind {
            DsKind::Counter | DsKind::Derive => std::mem::replace(&mut self.last_raw, reading),
            DsKind::Gauge | DsKind::Absolute => None,
        };
        let value = reading?;
        if elapsed.unsigned_abs() > self.heartbeat {
            return None;
        }

        let seconds = elapsed as f64;
        let rate = match self.kind {
            DsKind::Gauge => value,
            DsKind::Absolute => value / seconds,
            DsKind::Derive => (value - previous?) / seconds,
            DsKind::Counter => {
                let mut delta = value - previous?;
                // Wrapped 32-bit counter, then 64-bit.
                if delta < 0.0 {
                    delta += 4_294_967_296.0;
                }
                if delta < 0.0 {
                    delta += 18_446_744_069_414_584_320.0;
                }
                delta / seconds
            }
        };

        let in_range = self.min.is_none_or(|lo| rate >= lo) && self.max.is_none_or(|hi| rate <= hi);
        in_range.then_some(rate)
    }

    /// Spreads `rate` over `(from, to]`, closing a primary point at every
    /// step boundary. Points ending before `keep_from` are not materialized.
    fn accumulate(&mut self, rate: Option<f64>, from: i64, to: i64, bounds: Boundaries, keep_from: i64) {
        let Boundaries { first, last, step } = bounds;
        if to < first {
            self.add(rate, to - from);
            return;
        }

        self.add(rate, first - from);
        self.close(first, step);

        // Whole steps in between are covered by the same rate.
        let mut boundary = (first + step).max(keep_from);
        while boundary <= last {
            self.points.insert(boundary, rate);
            boundary += step;
        }
        self.add(rate, to - last);
    }

    #[allow(clippy::cast_precision_loss)] // Seconds are far below 2^52
    fn add(&mut self, rate: Option<f64>, seconds: i64) {
        if let Some(rate) = rate {
            self.pdp_sum += rate * seconds as f64;
            self.known_secs += seconds;
        }
    }

    #[allow(clippy::cast_precision_loss)] // Seconds are far below 2^52
    fn close(&mut self, boundary: i64, step: i64) {
        let value = (self.known_secs * 2 > step).then(|| self.pdp_sum / self.known_secs as f64);
        self.points.insert(boundary, value);
        self.pdp_sum = 0.0;
        self.known_secs = 0;
    }
}

impl Archive {
    fn declare(cf: &str, xff: &str, steps: &str, rows: &str) -> Result<Self, EngineError> {
        let cf: ConsolidationFn = cf.parse().map_err(EngineError::new)?;
        let xff: f64 = xff
            .parse()
            .map_err(|_| EngineError::new(format!("Invalid xff: {xff}")))?;
        if !(0.0..1.0).contains(&xff) {
            return Err(EngineError::new("Invalid xff: must be between 0 and 1"));
        }

        Ok(Self {
            cf,
            xff,
            steps: parse_count(steps, "steps")?,
            rows: parse_count(rows, "row count")?,
        })
    }
}

fn parse_count(field: &str, what: &str) -> Result<u64, EngineError> {
    match field.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(EngineError::new(format!("Invalid {what}: {field}"))),
    }
}

fn parse_bound(field: &str, what: &str) -> Result<Option<f64>, EngineError> {
    if field == UNKNOWN {
        return Ok(None);
    }
    field
        .parse()
        .map(Some)
        .map_err(|_| EngineError::new(format!("Invalid {what}: {field}")))
}

fn parse_reading(field: &str) -> Result<Option<f64>, EngineError> {
    if field == UNKNOWN {
        return Ok(None);
    }
    field
        .parse()
        .map(Some)
        .map_err(|_| EngineError::new(format!("conversion of '{field}' to float not complete")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_100;

    fn decls(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    fn samples(items: &[String]) -> Vec<String> {
        items.to_vec()
    }

    fn gauge_engine() -> MemoryEngine {
        let engine = MemoryEngine::new();
        engine
            .create(
                "g.rrd",
                300,
                T0,
                &decls(&["DS:v:GAUGE:600:U:U", "RRA:AVERAGE:0.5:1:100", "RRA:MAX:0.5:2:50"]),
            )
            .unwrap();
        engine
    }

    fn fetch_values(engine: &MemoryEngine, cf: &str, start: i64, end: i64, step: u64) -> (RawFetch, Vec<f64>) {
        let request = FetchRequest {
            target: "g.rrd",
            cf,
            start,
            end,
            step,
        };
        let raw = engine.fetch(&request, None).unwrap();
        let values = raw.buffer.values().to_vec();
        (raw, values)
    }

    #[test]
    fn test_declaration_errors() {
        let engine = MemoryEngine::new();
        let cases = [
            (0, vec!["DS:v:GAUGE:600:U:U", "RRA:AVERAGE:0.5:1:10"], "step size"),
            (300, vec!["RRA:AVERAGE:0.5:1:10"], "at least one Data Source"),
            (300, vec!["DS:v:GAUGE:600:U:U"], "at least one Round Robin Archive"),
            (300, vec!["DS:v:SPEED:600:U:U"], "unknown data source type"),
            (300, vec!["DS:v:GAUGE:600:U:U", "RRA:SUM:0.5:1:10"], "unknown consolidation function"),
            (300, vec!["DS:v:GAUGE:600:U:U", "RRA:AVERAGE:1.5:1:10"], "Invalid xff"),
            (300, vec!["DS:v:GAUGE:0:U:U", "RRA:AVERAGE:0.5:1:10"], "Invalid heartbeat"),
            (300, vec!["DS:bad-name:GAUGE:600:U:U", "RRA:AVERAGE:0.5:1:10"], "Invalid DS name"),
            (300, vec!["DS:v:GAUGE:600:U:U", "DS:v:GAUGE:600:U:U"], "Duplicate DS name"),
            (300, vec!["DS:v:GAUGE:600:10:0", "RRA:AVERAGE:0.5:1:10"], "min must be less than max"),
            (300, vec!["DS:v:GAUGE:600:U:U", "RRA:AVERAGE"], "can't parse argument"),
        ];
        for (step, declarations, expected) in cases {
            let err = engine.create("x.rrd", step, T0, &decls(&declarations)).unwrap_err();
            assert!(err.message.contains(expected), "{declarations:?}: {err}");
        }
        assert_eq!(engine.last_update("x.rrd"), None);
    }

    #[test]
    fn test_update_rejects_past_and_malformed_samples() {
        let engine = gauge_engine();
        let err = engine
            .update_no_daemon("g.rrd", None, &samples(&[format!("{T0}:1")]))
            .unwrap_err();
        assert_eq!(
            err.message,
            format!(
                "illegal attempt to update using time {T0} when last update time is {T0} (minimum one second step)"
            )
        );

        let err = engine
            .update_no_daemon("g.rrd", None, &samples(&[format!("{}:1:2", T0 + 300)]))
            .unwrap_err();
        assert!(err.message.starts_with("expected 1 data source readings (got 2)"));

        let err = engine
            .update_no_daemon("g.rrd", None, &samples(&[format!("{}:abc", T0 + 300)]))
            .unwrap_err();
        assert_eq!(err.message, "conversion of 'abc' to float not complete");

        let err = engine
            .update_no_daemon("g.rrd", Some("nope"), &samples(&[format!("{}:1", T0 + 300)]))
            .unwrap_err();
        assert_eq!(err.message, "unknown DS name 'nope'");

        assert_eq!(engine.last_update("g.rrd"), Some(T0));
    }

    #[test]
    fn test_batch_applies_until_first_rejection() {
        let engine = gauge_engine();
        let batch = samples(&[
            format!("{}:1", T0 + 300),
            format!("{}:2", T0 + 200),
            format!("{}:3", T0 + 900),
        ]);
        assert!(engine.update("g.rrd", None, None, &batch).is_err());
        assert_eq!(engine.last_update("g.rrd"), Some(T0 + 300));
    }

    #[test]
    fn test_gauge_fetch_alignment_and_rows() {
        let engine = gauge_engine();
        engine
            .update("g.rrd", None, None, &samples(&[format!("{}:42", T0 + 300)]))
            .unwrap();

        let (raw, values) = fetch_values(&engine, "AVERAGE", T0 + 10, T0 + 590, 300);
        assert_eq!((raw.start, raw.end, raw.step), (T0, T0 + 600, 300));
        assert_eq!(raw.ds_names, vec!["v".to_owned()]);
        assert_eq!(values.len(), 3);
        assert!(values[0].is_nan());
        assert!((values[1] - 42.0).abs() < f64::EPSILON);
        assert!(values[2].is_nan());

        assert_eq!(engine.outstanding_buffers(), 1);
        raw.buffer.release();
        assert_eq!(engine.outstanding_buffers(), 0);
    }

    #[test]
    fn test_consolidation_across_steps() {
        let engine = gauge_engine();
        let batch: Vec<String> = (1..=4).map(|i| format!("{}:{}", T0 + 300 * i, i * 10)).collect();
        engine.update("g.rrd", None, None, &batch).unwrap();

        // MAX archive spans two primary points per row. T0 sits half way
        // into a 600 s row, so rows end at T0+300, T0+900 and T0+1500.
        let (raw, values) = fetch_values(&engine, "MAX", T0 + 600, T0 + 1200, 600);
        assert_eq!((raw.start, raw.end, raw.step), (T0 + 300, T0 + 1500, 600));
        assert_eq!(values.len(), 3);
        // One of two points unknown is within xff 0.5.
        assert!((values[0] - 10.0).abs() < 1e-9, "{values:?}");
        assert!((values[1] - 30.0).abs() < 1e-9, "{values:?}");
        assert!(values[2].is_nan());
        raw.buffer.release();
    }

    #[test]
    fn test_heartbeat_gap_is_unknown() {
        let engine = gauge_engine();
        engine
            .update("g.rrd", None, None, &samples(&[format!("{}:5", T0 + 3000)]))
            .unwrap();
        let (raw, values) = fetch_values(&engine, "AVERAGE", T0 + 300, T0 + 3000, 300);
        assert!(values.iter().all(|v| v.is_nan()));
        raw.buffer.release();
    }

    #[test]
    fn test_counter_rate() {
        let engine = MemoryEngine::new();
        engine
            .create("c.rrd", 60, 0, &decls(&["DS:hits:COUNTER:120:0:U", "RRA:LAST:0.5:1:10"]))
            .unwrap();
        engine
            .update("c.rrd", None, None, &samples(&["60:1000".into(), "120:1600".into()]))
            .unwrap();

        let request = FetchRequest {
            target: "c.rrd",
            cf: "LAST",
            start: 60,
            end: 120,
            step: 60,
        };
        let raw = engine.fetch(&request, None).unwrap();
        let values = raw.buffer.values().to_vec();
        raw.buffer.release();
        assert!(values[0].is_nan());
        assert!((values[1] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_extreme_timestamps_are_rejected() {
        let engine = gauge_engine();
        let err = engine
            .update_no_daemon("g.rrd", None, &samples(&[format!("{}:1", i64::MAX)]))
            .unwrap_err();
        assert_eq!(err.message, format!("timestamp out of range in {}:1", i64::MAX));
        assert_eq!(engine.last_update("g.rrd"), Some(T0));

        let request = FetchRequest {
            target: "g.rrd",
            cf: "AVERAGE",
            start: i64::MIN,
            end: T0,
            step: 300,
        };
        let err = engine.fetch(&request, None).unwrap_err();
        assert!(err.message.starts_with("timestamp out of range"), "{err}");

        let wide = FetchRequest {
            start: i64::MIN / 2,
            ..request
        };
        let err = engine.fetch(&wide, None).unwrap_err();
        assert_eq!(err.message, "fetch range too large");
        assert_eq!(engine.outstanding_buffers(), 0);

        // The database is still usable afterwards.
        engine
            .update_no_daemon("g.rrd", None, &samples(&[format!("{}:1", T0 + 300)]))
            .unwrap();
        assert_eq!(engine.last_update("g.rrd"), Some(T0 + 300));
    }

    #[test]
    fn test_fetch_errors() {
        let engine = gauge_engine();
        let request = FetchRequest {
            target: "g.rrd",
            cf: "LAST",
            start: T0,
            end: T0 + 300,
            step: 300,
        };
        let err = engine.fetch(&request, None).unwrap_err();
        assert_eq!(err.message, "the RRD does not contain an RRA matching the chosen CF");

        let inverted = FetchRequest {
            cf: "AVERAGE",
            start: T0 + 600,
            end: T0,
            ..request
        };
        let err = engine.fetch(&inverted, None).unwrap_err();
        assert_eq!(err.message, format!("start ({}) should be less than end ({T0})", T0 + 600));

        let missing = FetchRequest {
            target: "none.rrd",
            cf: "AVERAGE",
            ..request
        };
        let err = engine.fetch(&missing, None).unwrap_err();
        assert_eq!(err.message, "opening 'none.rrd': No such file or directory");
        assert_eq!(engine.outstanding_buffers(), 0);
    }

    #[test]
    fn test_info_records_in_engine_order() {
        let engine = gauge_engine();
        engine
            .update("g.rrd", None, None, &samples(&[format!("{}:7", T0 + 300)]))
            .unwrap();
        let records = engine.info("g.rrd", None).unwrap();

        let keys: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(&keys[..4], ["filename", "rrd_version", "step", "last_update"]);
        assert!(keys.contains(&"ds[v].type"));
        assert!(keys.contains(&"rra[1].pdp_per_row"));
        assert!(keys.contains(&"rra[0].cdp_prep[0].value"));

        let find = |key: &str| records.iter().find(|r| r.key == key).map(|r| r.value.clone());
        assert_eq!(find("step"), Some(Scalar::Unsigned(300)));
        assert_eq!(find("ds[v].last_ds"), Some(Scalar::Str("7".into())));
        assert_eq!(find("rra[1].cf"), Some(Scalar::Str("MAX".into())));
    }

    #[test]
    fn test_daemon_queue_flush_and_fallback() {
        let engine = gauge_engine();
        engine.start_daemon("cached");

        let first = samples(&[format!("{}:1", T0 + 300)]);
        engine.update("g.rrd", None, Some("cached"), &first).unwrap();
        assert_eq!(engine.cached_samples("cached", "g.rrd"), 1);
        assert_eq!(engine.last_update("g.rrd"), Some(T0));

        // Validated against the queue, not only the file.
        let stale = samples(&[format!("{}:1", T0 + 200)]);
        assert!(engine.update("g.rrd", None, Some("cached"), &stale).is_err());
        assert_eq!(engine.cached_samples("cached", "g.rrd"), 1);

        engine.flush("cached", "g.rrd").unwrap();
        assert_eq!(engine.cached_samples("cached", "g.rrd"), 0);
        assert_eq!(engine.last_update("g.rrd"), Some(T0 + 300));

        let err = engine.flush("elsewhere", "g.rrd").unwrap_err();
        assert_eq!(err.message, "Unable to connect to rrdcached: elsewhere");
        engine.flush("", "g.rrd").unwrap();

        // Unknown daemon on update falls back to a direct write.
        let next = samples(&[format!("{}:2", T0 + 600)]);
        engine.update("g.rrd", None, Some("elsewhere"), &next).unwrap();
        assert_eq!(engine.last_update("g.rrd"), Some(T0 + 600));
    }

    #[test]
    fn test_daemon_rejects_template() {
        let engine = gauge_engine();
        engine.start_daemon("cached");
        let batch = samples(&[format!("{}:1", T0 + 300)]);

        let err = engine.update("g.rrd", Some("v"), Some("cached"), &batch).unwrap_err();
        assert_eq!(
            err.message,
            "rrdcached at cached does not accept a template; update without the daemon"
        );
        assert_eq!(engine.cached_samples("cached", "g.rrd"), 0);

        // Templates still work when the daemon is bypassed or unreachable.
        engine.update_no_daemon("g.rrd", Some("v"), &batch).unwrap();
        let next = samples(&[format!("{}:2", T0 + 600)]);
        engine.update("g.rrd", Some("v"), Some("elsewhere"), &next).unwrap();
        assert_eq!(engine.last_update("g.rrd"), Some(T0 + 600));
    }

    #[test]
    fn test_daemon_read_drains_queue() {
        let engine = gauge_engine();
        engine.start_daemon("cached");
        let batch = samples(&[format!("{}:1", T0 + 300)]);
        engine.update("g.rrd", None, Some("cached"), &batch).unwrap();

        engine.info("g.rrd", Some("cached")).unwrap();
        assert_eq!(engine.cached_samples("cached", "g.rrd"), 0);
        assert_eq!(engine.last_update("g.rrd"), Some(T0 + 300));
    }

    #[test]
    fn test_now_is_pinned_when_queued() {
        assert_eq!(resolve_now("N:1:2", 55), "55:1:2");
        assert_eq!(resolve_now("10:1", 55), "10:1");
    }

    #[test]
    fn test_file_backed_persists_between_engines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.rrd");
        let target = path.to_str().unwrap();

        let engine = MemoryEngine::file_backed();
        engine
            .create(target, 300, T0, &decls(&["DS:v:GAUGE:600:U:U", "RRA:AVERAGE:0.5:1:10"]))
            .unwrap();
        engine
            .update(target, None, None, &samples(&[format!("{}:3", T0 + 300)]))
            .unwrap();

        let reopened = MemoryEngine::file_backed();
        assert_eq!(reopened.last_update(target), Some(T0 + 300));

        std::fs::write(&path, b"garbage").unwrap();
        let err = reopened.info(target, None).unwrap_err();
        assert!(err.message.ends_with("is not an RRD file"));
    }
}
