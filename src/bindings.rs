//! C Bindings for Lockstep IPC
//!
//! Exposes an endpoint with runtime element layouts and explicit
//! begin/end calls, for peers that cannot use the typed Rust API.
//! Functions returning `c_int` use 0 for success and -1 for failure;
//! `lockstep_recv_begin` returns 1 when the peer finished.

use crate::channel::{Delivery, RawSlot};
use crate::config::{CreatePolicy, EndpointConfig, ObjectNames, Role, Side};
use crate::endpoint::{attach, Attachment};
use crate::envelope::{ObjectKind, ObjectTag};
use crate::error::{LockstepError, Result};
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::time::Duration;

/// Opaque endpoint handle
pub struct LockstepEndpoint {
    tx: RawSlot,
    rx: RawSlot,
    kind: ObjectKind,
    tx_open: bool,
    rx_open: bool,
}

#[repr(C)]
pub struct LockstepConfig {
    /// Segment and object names; null or empty keeps the default
    pub segment: *const c_char,
    pub sim_to_agent: *const c_char,
    pub agent_to_sim: *const c_char,
    pub sync: *const c_char,
    /// Region size, creator only; 0 selects the default
    pub size: usize,
    pub is_creator: bool,
    pub is_simulation: bool,
    pub use_batch: bool,
    pub handle_finish: bool,
    /// Fail on an existing segment instead of replacing it
    pub exclusive: bool,
    pub tx_elem_size: usize,
    pub tx_elem_align: usize,
    pub rx_elem_size: usize,
    pub rx_elem_align: usize,
    /// Liveness bound for blocking calls; 0 waits forever
    pub timeout_ms: u64,
}

unsafe fn opt_str<'a>(s: *const c_char) -> Result<&'a str> {
    if s.is_null() {
        return Ok("");
    }
    CStr::from_ptr(s)
        .to_str()
        .map_err(|_| LockstepError::InvalidName(CStr::from_ptr(s).to_string_lossy().into_owned()))
}

unsafe fn to_config(config: &LockstepConfig) -> Result<EndpointConfig> {
    let mut names = ObjectNames::default();
    names.set_names(
        opt_str(config.segment)?,
        opt_str(config.sim_to_agent)?,
        opt_str(config.agent_to_sim)?,
        opt_str(config.sync)?,
    );

    let role = if config.is_creator { Role::Creator } else { Role::Attacher };
    let side = if config.is_simulation { Side::Simulation } else { Side::Agent };
    let mut rust_config = EndpointConfig::new(role, side)
        .with_names(names)
        .with_handle_finish(config.handle_finish);
    if config.size != 0 {
        rust_config = rust_config.with_size(config.size);
    }
    if config.exclusive {
        rust_config = rust_config.with_create_policy(CreatePolicy::Exclusive);
    }
    if config.timeout_ms != 0 {
        rust_config = rust_config.with_timeout(Duration::from_millis(config.timeout_ms));
    }
    Ok(rust_config)
}

fn log_failure(op: &str, err: &LockstepError) {
    tracing::warn!(op, error = %err, "C API call failed");
}

impl LockstepEndpoint {
    fn batch_ready(&self, open: bool) -> bool {
        self.kind == ObjectKind::Batch && open
    }
}

impl Drop for LockstepEndpoint {
    fn drop(&mut self) {
        if self.tx_open {
            self.tx.release_send();
        }
        if self.rx_open {
            self.rx.release_recv();
        }
        self.tx.finish_on_drop();
    }
}

/// Create or attach an endpoint
///
/// Returns null on failure.
///
/// # Safety
/// `config` must point to a valid `LockstepConfig` whose non-null names are
/// null-terminated strings
#[no_mangle]
pub unsafe extern "C" fn lockstep_endpoint_open(config: *const LockstepConfig) -> *mut LockstepEndpoint {
    if config.is_null() {
        return ptr::null_mut();
    }
    let config = &*config;

    let kind = if config.use_batch { ObjectKind::Batch } else { ObjectKind::Record };
    let tx_tag = ObjectTag::new(kind, config.tx_elem_size, config.tx_elem_align.max(1));
    let rx_tag = ObjectTag::new(kind, config.rx_elem_size, config.rx_elem_align.max(1));

    let opened = to_config(config).and_then(|rust_config| attach(&rust_config, tx_tag, rx_tag));
    match opened {
        Ok(Attachment { tx, rx, .. }) => Box::into_raw(Box::new(LockstepEndpoint {
            tx,
            rx,
            kind,
            tx_open: false,
            rx_open: false,
        })),
        Err(e) => {
            log_failure("open", &e);
            ptr::null_mut()
        }
    }
}

/// Close an endpoint, ending any open bracket
///
/// # Safety
/// `handle` must come from `lockstep_endpoint_open` and not be used again
#[no_mangle]
pub unsafe extern "C" fn lockstep_endpoint_close(handle: *mut LockstepEndpoint) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Block until the outbound slot is writable
///
/// # Safety
/// `handle` must be a live endpoint handle
#[no_mangle]
pub unsafe extern "C" fn lockstep_send_begin(handle: *mut LockstepEndpoint) -> c_int {
    let Some(ep) = handle.as_mut() else { return -1 };
    if ep.tx_open {
        return -1;
    }
    match ep.tx.acquire_send(true) {
        Ok(_) => {
            ep.tx_open = true;
            0
        }
        Err(e) => {
            log_failure("send_begin", &e);
            -1
        }
    }
}

/// Publish the outbound slot
///
/// # Safety
/// `handle` must be a live endpoint handle
#[no_mangle]
pub unsafe extern "C" fn lockstep_send_end(handle: *mut LockstepEndpoint) -> c_int {
    let Some(ep) = handle.as_mut() else { return -1 };
    if !ep.tx_open {
        return -1;
    }
    ep.tx.release_send();
    ep.tx_open = false;
    0
}

/// Block until an inbound message is pending
///
/// Returns 0 with read permission held, 1 if the peer finished (no
/// permission held), -1 on failure.
///
/// # Safety
/// `handle` must be a live endpoint handle
#[no_mangle]
pub unsafe extern "C" fn lockstep_recv_begin(handle: *mut LockstepEndpoint) -> c_int {
    let Some(ep) = handle.as_mut() else { return -1 };
    if ep.rx_open {
        return -1;
    }
    match ep.rx.acquire_recv(true) {
        Ok(Some(Delivery::Message)) => {
            ep.rx_open = true;
            0
        }
        Ok(Some(Delivery::Finished)) => 1,
        Ok(None) => -1,
        Err(e) => {
            log_failure("recv_begin", &e);
            -1
        }
    }
}

/// Return the inbound slot to the peer
///
/// # Safety
/// `handle` must be a live endpoint handle
#[no_mangle]
pub unsafe extern "C" fn lockstep_recv_end(handle: *mut LockstepEndpoint) -> c_int {
    let Some(ep) = handle.as_mut() else { return -1 };
    if !ep.rx_open {
        return -1;
    }
    ep.rx.release_recv();
    ep.rx_open = false;
    0
}

/// Outbound record, null unless in single mode with send permission held
///
/// # Safety
/// `handle` must be a live endpoint handle; the pointer is valid until
/// `lockstep_send_end`
#[no_mangle]
pub unsafe extern "C" fn lockstep_tx_record(handle: *mut LockstepEndpoint) -> *mut c_void {
    match handle.as_ref() {
        Some(ep) if ep.kind == ObjectKind::Record && ep.tx_open => ep.tx.object().as_ptr().cast(),
        _ => ptr::null_mut(),
    }
}

/// Inbound record, null unless in single mode with read permission held
///
/// # Safety
/// `handle` must be a live endpoint handle; the pointer is valid until
/// `lockstep_recv_end`
#[no_mangle]
pub unsafe extern "C" fn lockstep_rx_record(handle: *const LockstepEndpoint) -> *const c_void {
    match handle.as_ref() {
        Some(ep) if ep.kind == ObjectKind::Record && ep.rx_open => ep.rx.object().as_ptr().cast(),
        _ => ptr::null(),
    }
}

/// Resize the outbound batch; new elements are zeroed
///
/// # Safety
/// `handle` must be a live endpoint handle
#[no_mangle]
pub unsafe extern "C" fn lockstep_tx_resize(handle: *mut LockstepEndpoint, len: usize) -> c_int {
    let Some(ep) = handle.as_ref() else { return -1 };
    if !ep.batch_ready(ep.tx_open) {
        return -1;
    }
    match ep.tx.seq().resize(len) {
        Ok(()) => 0,
        Err(e) => {
            log_failure("tx_resize", &e);
            -1
        }
    }
}

/// Length of the outbound batch
///
/// # Safety
/// `handle` must be a live endpoint handle
#[no_mangle]
pub unsafe extern "C" fn lockstep_tx_len(handle: *const LockstepEndpoint) -> usize {
    match handle.as_ref() {
        Some(ep) if ep.batch_ready(ep.tx_open) => ep.tx.seq().len(),
        _ => 0,
    }
}

/// Outbound batch elements, null while empty or without send permission
///
/// # Safety
/// `handle` must be a live endpoint handle; the pointer is valid until the
/// next resize or `lockstep_send_end`
#[no_mangle]
pub unsafe extern "C" fn lockstep_tx_batch(handle: *mut LockstepEndpoint) -> *mut c_void {
    match handle.as_ref() {
        Some(ep) if ep.batch_ready(ep.tx_open) => {
            let seq = ep.tx.seq();
            match seq.data() {
                Some(data) if seq.len() > 0 => data.as_ptr().cast(),
                _ => ptr::null_mut(),
            }
        }
        _ => ptr::null_mut(),
    }
}

/// Length of the inbound batch
///
/// # Safety
/// `handle` must be a live endpoint handle
#[no_mangle]
pub unsafe extern "C" fn lockstep_rx_len(handle: *const LockstepEndpoint) -> usize {
    match handle.as_ref() {
        Some(ep) if ep.batch_ready(ep.rx_open) => ep.rx.seq().len(),
        _ => 0,
    }
}

/// Inbound batch elements, null while empty or without read permission
///
/// # Safety
/// `handle` must be a live endpoint handle; the pointer is valid until
/// `lockstep_recv_end`
#[no_mangle]
pub unsafe extern "C" fn lockstep_rx_batch(handle: *const LockstepEndpoint) -> *const c_void {
    match handle.as_ref() {
        Some(ep) if ep.batch_ready(ep.rx_open) => {
            let seq = ep.rx.seq();
            match seq.data() {
                Some(data) if seq.len() > 0 => data.as_ptr().cast_const().cast(),
                _ => ptr::null(),
            }
        }
        _ => ptr::null(),
    }
}

/// Signal end-of-stream (simulation side with finish handling only)
///
/// # Safety
/// `handle` must be a live endpoint handle
#[no_mangle]
pub unsafe extern "C" fn lockstep_set_finished(handle: *mut LockstepEndpoint) -> c_int {
    let Some(ep) = handle.as_mut() else { return -1 };
    if ep.tx_open {
        return -1;
    }
    let timeout = ep.tx.timeout();
    match ep.tx.send_finish(timeout) {
        Ok(()) => 0,
        Err(e) => {
            log_failure("set_finished", &e);
            -1
        }
    }
}

/// Whether end-of-stream was sent or observed by this endpoint
///
/// # Safety
/// `handle` must be a live endpoint handle
#[no_mangle]
pub unsafe extern "C" fn lockstep_is_finished(handle: *const LockstepEndpoint) -> bool {
    handle.as_ref().map_or(false, |ep| ep.tx.is_finished())
}
