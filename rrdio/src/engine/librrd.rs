//! Bindings to the system `librrd` (rrdtool) library.
//!
//! `librrd` keeps its error state in globals and is not safe to enter from
//! two threads at once, so every call below runs under one process-wide lock
//! held from the `rrd_clear_error` that starts it to the moment the error
//! text has been copied out.
//!
//! Fetch buffers and data source name arrays are allocated by `librrd` with
//! `malloc` and returned to it with `free`.

use std::ffi::{CStr, CString, c_char, c_int, c_long, c_uchar, c_ulong, c_void};
use std::fmt;
use std::ptr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Engine, EngineBuffer, FetchRequest, RawFetch, daemon_template_error};
use crate::error::EngineError;
use crate::info::{InfoRecord, Scalar};

type TimeT = c_long;

const RD_I_VAL: c_int = 0;
const RD_I_CNT: c_int = 1;
const RD_I_STR: c_int = 2;
const RD_I_INT: c_int = 3;
const RD_I_BLO: c_int = 4;

/// No extra flags for `rrd_updatex_r`: samples in the past are rejected
/// rather than skipped.
const UPDATE_FLAGS: c_int = 0;

#[repr(C)]
#[derive(Clone, Copy)]
struct RrdBlob {
    size: c_ulong,
    ptr: *mut c_uchar,
}

#[repr(C)]
#[derive(Clone, Copy)]
union RrdInfoVal {
    u_cnt: c_ulong,
    u_val: f64,
    u_str: *mut c_char,
    u_int: c_int,
    u_blo: RrdBlob,
}

#[repr(C)]
struct RrdInfo {
    key: *mut c_char,
    kind: c_int,
    value: RrdInfoVal,
    next: *mut RrdInfo,
}

#[link(name = "rrd")]
unsafe extern "C" {
    fn rrd_clear_error();
    fn rrd_test_error() -> c_int;
    fn rrd_get_error() -> *mut c_char;

    fn rrd_create_r(
        filename: *const c_char,
        pdp_step: c_ulong,
        last_up: TimeT,
        argc: c_int,
        argv: *const *const c_char,
    ) -> c_int;
    fn rrd_update_r(
        filename: *const c_char,
        template: *const c_char,
        argc: c_int,
        argv: *const *const c_char,
    ) -> c_int;
    fn rrd_updatex_r(
        filename: *const c_char,
        template: *const c_char,
        extra_flags: c_int,
        argc: c_int,
        argv: *const *const c_char,
    ) -> c_int;
    fn rrd_info_r(filename: *const c_char) -> *mut RrdInfo;
    fn rrd_info_free(info: *mut RrdInfo);
    fn rrd_fetch_r(
        filename: *const c_char,
        cf: *const c_char,
        start: *mut TimeT,
        end: *mut TimeT,
        step: *mut c_ulong,
        ds_cnt: *mut c_ulong,
        ds_namv: *mut *mut *mut c_char,
        data: *mut *mut f64,
    ) -> c_int;

    fn rrdc_connect(addr: *const c_char) -> c_int;
    fn rrdc_is_connected(addr: *const c_char) -> c_int;
    fn rrdc_update(filename: *const c_char, values_num: c_int, values: *const *const c_char) -> c_int;
    fn rrdc_info(filename: *const c_char) -> *mut RrdInfo;
    fn rrdc_fetch(
        filename: *const c_char,
        cf: *const c_char,
        start: *mut TimeT,
        end: *mut TimeT,
        step: *mut c_ulong,
        ds_cnt: *mut c_ulong,
        ds_namv: *mut *mut *mut c_char,
        data: *mut *mut f64,
    ) -> c_int;
    fn rrdc_flush_if_daemon(daemon: *const c_char, filename: *const c_char) -> c_int;
}

unsafe extern "C" {
    fn free(ptr: *mut c_void);
}

static ENGINE_LOCK: Mutex<()> = Mutex::new(());

fn engine_lock() -> MutexGuard<'static, ()> {
    ENGINE_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The system `librrd`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibRrd;

impl LibRrd {
    /// Creates a handle. All handles share the process-wide lock.
    pub fn new() -> Self {
        Self
    }
}

/// Owned C strings plus a pointer array suitable for `argv`.
struct CArgs {
    _owned: Vec<CString>,
    ptrs: Vec<*const c_char>,
}

impl CArgs {
    fn new(args: &[String]) -> Result<Self, EngineError> {
        let owned = args
            .iter()
            .map(|a| c_string(a))
            .collect::<Result<Vec<_>, _>>()?;
        let ptrs = owned.iter().map(|c| c.as_ptr()).collect();
        Ok(Self { _owned: owned, ptrs })
    }

    fn argc(&self) -> Result<c_int, EngineError> {
        c_int::try_from(self.ptrs.len()).map_err(|_| EngineError::new("too many arguments"))
    }

    fn argv(&self) -> *const *const c_char {
        self.ptrs.as_ptr()
    }
}

fn c_string(value: &str) -> Result<CString, EngineError> {
    CString::new(value).map_err(|_| EngineError::new(format!("argument contains a NUL byte: {value:?}")))
}

fn opt_ptr(value: Option<&CString>) -> *const c_char {
    value.map_or(ptr::null(), |c| c.as_ptr())
}

/// Copies out the pending `librrd` error, if any.
///
/// Must be called with the engine lock held.
fn take_error(status: c_int) -> Result<(), EngineError> {
    // SAFETY: the engine lock is held, so no other thread touches the error
    // state; rrd_get_error returns a NUL-terminated buffer owned by librrd
    // that stays valid until the next librrd call.
    let message = unsafe {
        if rrd_test_error() == 0 {
            None
        } else {
            Some(CStr::from_ptr(rrd_get_error()).to_string_lossy().into_owned())
        }
    };
    match message {
        Some(message) => Err(EngineError::new(message)),
        None if status != 0 => Err(EngineError::new(format!("librrd call failed with status {status}"))),
        None => Ok(()),
    }
}

/// Connects to `daemon` and reports whether it is reachable.
///
/// Must be called with the engine lock held.
fn daemon_connected(daemon: &CString) -> bool {
    // SAFETY: daemon is a valid NUL-terminated string for the whole call and
    // the engine lock serializes access to the client's connection state.
    unsafe {
        rrdc_connect(daemon.as_ptr());
        rrdc_is_connected(daemon.as_ptr()) != 0
    }
}

impl Engine for LibRrd {
    fn create(
        &self,
        target: &str,
        step: u64,
        start: i64,
        declarations: &[String],
    ) -> Result<(), EngineError> {
        let filename = c_string(target)?;
        let args = CArgs::new(declarations)?;
        let argc = args.argc()?;
        let step = c_ulong::try_from(step).map_err(|_| EngineError::new("step out of range"))?;
        let start = TimeT::try_from(start).map_err(|_| EngineError::new("start out of range"))?;
        tracing::debug!(database = target, declarations = declarations.len(), "rrd_create_r");

        let _guard = engine_lock();
        // SAFETY: all pointers come from CStrings and a pointer array that
        // outlive the call; argc matches the array length.
        let status = unsafe {
            rrd_clear_error();
            rrd_create_r(filename.as_ptr(), step, start, argc, args.argv())
        };
        take_error(status)
    }

    fn update(
        &self,
        target: &str,
        template: Option<&str>,
        daemon: Option<&str>,
        samples: &[String],
    ) -> Result<(), EngineError> {
        let Some(daemon) = daemon else {
            return self.update_no_daemon(target, template, samples);
        };

        let filename = c_string(target)?;
        let template = template.map(c_string).transpose()?;
        let daemon = c_string(daemon)?;
        let args = CArgs::new(samples)?;
        let argc = args.argc()?;

        let _guard = engine_lock();
        // SAFETY: see create; the daemon address outlives the call.
        let status = unsafe {
            rrd_clear_error();
            if daemon_connected(&daemon) {
                if template.is_some() {
                    return Err(daemon_template_error(&daemon.to_string_lossy()));
                }
                tracing::debug!(database = target, samples = samples.len(), "rrdc_update");
                rrdc_update(filename.as_ptr(), argc, args.argv())
            } else {
                tracing::debug!(database = target, samples = samples.len(), "daemon unreachable, rrd_update_r");
                rrd_update_r(filename.as_ptr(), opt_ptr(template.as_ref()), argc, args.argv())
            }
        };
        take_error(status)
    }

    fn update_no_daemon(
        &self,
        target: &str,
        template: Option<&str>,
        samples: &[String],
    ) -> Result<(), EngineError> {
        let filename = c_string(target)?;
        let template = template.map(c_string).transpose()?;
        let args = CArgs::new(samples)?;
        let argc = args.argc()?;
        tracing::debug!(database = target, samples = samples.len(), "rrd_updatex_r");

        let _guard = engine_lock();
        // SAFETY: see create; a null template means "all data sources".
        let status = unsafe {
            rrd_clear_error();
            rrd_updatex_r(
                filename.as_ptr(),
                opt_ptr(template.as_ref()),
                UPDATE_FLAGS,
                argc,
                args.argv(),
            )
        };
        take_error(status)
    }

    fn info(&self, target: &str, daemon: Option<&str>) -> Result<Vec<InfoRecord>, EngineError> {
        let filename = c_string(target)?;
        let daemon = daemon.map(c_string).transpose()?;
        tracing::debug!(database = target, "rrd_info_r");

        let _guard = engine_lock();
        // SAFETY: filename outlives the call; the returned list is owned by
        // us until rrd_info_free.
        let head = unsafe {
            rrd_clear_error();
            match &daemon {
                Some(daemon) if daemon_connected(daemon) => rrdc_info(filename.as_ptr()),
                _ => rrd_info_r(filename.as_ptr()),
            }
        };
        if let Err(e) = take_error(0) {
            // SAFETY: head is either null or a list returned by librrd that
            // has not been freed; rrd_info_free accepts both.
            unsafe { rrd_info_free(head) };
            return Err(e);
        }

        // SAFETY: head is a valid list from librrd, freed exactly once below.
        let records = unsafe { collect_info(head) };
        // SAFETY: as above; no pointer into the list survives collect_info.
        unsafe { rrd_info_free(head) };
        Ok(records)
    }

    fn fetch(
        &self,
        request: &FetchRequest<'_>,
        daemon: Option<&str>,
    ) -> Result<RawFetch, EngineError> {
        let filename = c_string(request.target)?;
        let cf = c_string(request.cf)?;
        let daemon = daemon.map(c_string).transpose()?;
        let mut start = TimeT::try_from(request.start).map_err(|_| EngineError::new("start out of range"))?;
        let mut end = TimeT::try_from(request.end).map_err(|_| EngineError::new("end out of range"))?;
        let mut step = c_ulong::try_from(request.step).map_err(|_| EngineError::new("step out of range"))?;
        let mut ds_cnt: c_ulong = 0;
        let mut ds_namv: *mut *mut c_char = ptr::null_mut();
        let mut data: *mut f64 = ptr::null_mut();
        tracing::debug!(database = request.target, cf = request.cf, "rrd_fetch_r");

        let _guard = engine_lock();
        // SAFETY: every out-pointer references a live local; the inputs are
        // NUL-terminated strings that outlive the call.
        let status = unsafe {
            rrd_clear_error();
            match &daemon {
                Some(daemon) if daemon_connected(daemon) => rrdc_fetch(
                    filename.as_ptr(),
                    cf.as_ptr(),
                    &mut start,
                    &mut end,
                    &mut step,
                    &mut ds_cnt,
                    &mut ds_namv,
                    &mut data,
                ),
                _ => rrd_fetch_r(
                    filename.as_ptr(),
                    cf.as_ptr(),
                    &mut start,
                    &mut end,
                    &mut step,
                    &mut ds_cnt,
                    &mut ds_namv,
                    &mut data,
                ),
            }
        };
        take_error(status)?;

        let columns = usize::try_from(ds_cnt).unwrap_or_default();
        // SAFETY: on success librrd returned ds_cnt malloc'd names in a
        // malloc'd array; each is read once and freed once.
        let ds_names = unsafe { take_names(ds_namv, columns) };

        let (start, end, step) = (i64::from(start), i64::from(end), u64::from(step));
        let rows = match i64::try_from(step) {
            Ok(s) if s > 0 && end >= start => usize::try_from((end - start) / s + 1).unwrap_or_default(),
            _ => 0,
        };

        Ok(RawFetch {
            start,
            end,
            step,
            ds_names,
            buffer: Box::new(MallocBuffer {
                ptr: data,
                len: rows.saturating_mul(columns),
            }),
        })
    }

    fn flush(&self, daemon: &str, target: &str) -> Result<(), EngineError> {
        let daemon = c_string(daemon)?;
        let filename = c_string(target)?;
        tracing::debug!(database = target, "rrdc_flush_if_daemon");

        let _guard = engine_lock();
        // SAFETY: both strings outlive the call.
        let status = unsafe {
            rrd_clear_error();
            rrdc_flush_if_daemon(daemon.as_ptr(), filename.as_ptr())
        };
        take_error(status)
    }
}

/// Copies an info list into owned records.
///
/// # Safety
///
/// `head` must be null or a valid list returned by `librrd`.
unsafe fn collect_info(head: *const RrdInfo) -> Vec<InfoRecord> {
    let mut records = Vec::new();
    let mut node = head;
    while !node.is_null() {
        // SAFETY: node is non-null and points into the list per the
        // function contract.
        let entry = unsafe { &*node };
        // SAFETY: librrd keys are NUL-terminated.
        let key = unsafe { CStr::from_ptr(entry.key) }.to_string_lossy().into_owned();
        // SAFETY: the union member read matches the type tag.
        let value = unsafe {
            match entry.kind {
                RD_I_VAL => Some(Scalar::Float(entry.value.u_val)),
                RD_I_CNT => Some(Scalar::Unsigned(u64::from(entry.value.u_cnt))),
                RD_I_STR => Some(Scalar::Str(
                    CStr::from_ptr(entry.value.u_str).to_string_lossy().into_owned(),
                )),
                RD_I_INT => Some(Scalar::Int(i64::from(entry.value.u_int))),
                RD_I_BLO => {
                    let blob = entry.value.u_blo;
                    let len = usize::try_from(blob.size).unwrap_or_default();
                    let bytes = if blob.ptr.is_null() || len == 0 {
                        Vec::new()
                    } else {
                        std::slice::from_raw_parts(blob.ptr, len).to_vec()
                    };
                    Some(Scalar::Blob(bytes))
                }
                _ => None,
            }
        };
        match value {
            Some(value) => records.push(InfoRecord::new(key, value)),
            None => tracing::trace!(key = %key, kind = entry.kind, "skipping info record of unknown type"),
        }
        node = entry.next;
    }
    records
}

/// Copies and frees a `librrd` name array.
///
/// # Safety
///
/// `names` must be null or a malloc'd array of `count` malloc'd strings that
/// nothing else frees.
unsafe fn take_names(names: *mut *mut c_char, count: usize) -> Vec<String> {
    if names.is_null() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        // SAFETY: i < count and the array holds count entries.
        let name = unsafe { *names.add(i) };
        // SAFETY: each entry is a NUL-terminated malloc'd string.
        out.push(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned());
        // SAFETY: freed once, never read again.
        unsafe { free(name.cast()) };
    }
    // SAFETY: the array itself was malloc'd by librrd.
    unsafe { free(names.cast()) };
    out
}

/// A fetch buffer allocated by `librrd`.
struct MallocBuffer {
    ptr: *mut f64,
    len: usize,
}

// SAFETY: the buffer is uniquely owned by this handle and only read through
// `&self`; librrd keeps no reference to it after fetch returns.
unsafe impl Send for MallocBuffer {}

impl fmt::Debug for MallocBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MallocBuffer")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl EngineBuffer for MallocBuffer {
    fn values(&self) -> &[f64] {
        if self.ptr.is_null() || self.len == 0 {
            return &[];
        }
        // SAFETY: librrd allocated at least rows * ds_cnt doubles at ptr and
        // the allocation lives until release.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn release(self: Box<Self>) {
        // SAFETY: ptr was malloc'd by librrd (or is null) and is freed once,
        // since release consumes the handle.
        unsafe { free(self.ptr.cast()) };
    }
}
