//! Stable C ABI for handing exported batches to a native engine.
//!
//! This module is enabled by the `ffi` feature and exports a minimal API:
//! - create a bridge from JSON config or key/value config
//! - pull the next batch of an export cursor into caller-owned Arrow C
//!   Data Interface descriptors
//! - close and free handles
//!
//! Error handling contract:
//! - all fallible functions return [`NbxStatusCode`]
//! - optional `err_buf`/`err_buf_len` receives a UTF-8 message on failure
//! - success clears `err_buf` (empty string) when buffer is provided

use std::ffi::{CStr, c_char};
use std::panic::{AssertUnwindSafe, catch_unwind};

use arrow::ffi::{FFI_ArrowArray, FFI_ArrowSchema};
use arrow::row::OwnedRow;
use nbx_common::{BridgeConfig, NbxError};
use nbx_execution::{DescriptorHandles, ExportCursor};

use crate::Bridge;

/// Row source behind an exported cursor.
pub type BoxedRows = Box<dyn Iterator<Item = nbx_common::Result<OwnedRow>> + Send>;

struct BridgeHandle {
    bridge: Bridge,
}

struct ExportHandle {
    cursor: ExportCursor<BoxedRows>,
}

/// Opaque C handle for a bridge instance.
#[repr(C)]
pub struct NbxBridgeHandle {
    _private: [u8; 0],
}

/// Opaque C handle for an export cursor.
#[repr(C)]
pub struct NbxExportHandle {
    _private: [u8; 0],
}

/// Stable status code set for C ABI calls.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NbxStatusCode {
    Ok = 0,
    InvalidConfig = 1,
    /// Out-of-contract use of a cursor, channel or frame stream.
    ProtocolViolation = 2,
    ProducerFault = 3,
    FramingCorruption = 4,
    ResourcesExhausted = 5,
    Execution = 6,
    Io = 7,
    /// Panic or unknown internal failure.
    Internal = 8,
}

fn map_error(err: &NbxError) -> NbxStatusCode {
    match err {
        NbxError::InvalidConfig(_) => NbxStatusCode::InvalidConfig,
        NbxError::ProtocolViolation(_) => NbxStatusCode::ProtocolViolation,
        NbxError::ProducerFault(_) => NbxStatusCode::ProducerFault,
        NbxError::FramingCorruption(_) => NbxStatusCode::FramingCorruption,
        NbxError::ResourcesExhausted(_) => NbxStatusCode::ResourcesExhausted,
        NbxError::Execution(_) => NbxStatusCode::Execution,
        NbxError::Io(_) => NbxStatusCode::Io,
    }
}

fn write_error(buf: *mut c_char, buf_len: usize, msg: &str) {
    if buf.is_null() || buf_len == 0 {
        return;
    }
    let bytes = msg.as_bytes();
    let to_copy = bytes.len().min(buf_len.saturating_sub(1));
    // SAFETY: caller provides a writable C buffer of size `buf_len`.
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf.cast::<u8>(), to_copy);
        *buf.add(to_copy) = 0;
    }
}

fn clear_error(buf: *mut c_char, buf_len: usize) {
    if buf.is_null() || buf_len == 0 {
        return;
    }
    // SAFETY: caller provides a writable C buffer of size `buf_len`.
    unsafe {
        *buf = 0;
    }
}

fn parse_cstr_owned(ptr: *const c_char, field: &str) -> std::result::Result<String, NbxError> {
    if ptr.is_null() {
        return Err(NbxError::InvalidConfig(format!("{field} pointer is null")));
    }
    // SAFETY: ptr checked for null; caller promises NUL-terminated string.
    let raw = unsafe { CStr::from_ptr(ptr) };
    let val = raw
        .to_str()
        .map_err(|e| NbxError::InvalidConfig(format!("{field} is not valid UTF-8: {e}")))?;
    Ok(val.to_string())
}

fn with_unwind_guard<F>(err_buf: *mut c_char, err_buf_len: usize, f: F) -> NbxStatusCode
where
    F: FnOnce() -> std::result::Result<(), NbxError>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {
            clear_error(err_buf, err_buf_len);
            NbxStatusCode::Ok
        }
        Ok(Err(err)) => {
            write_error(err_buf, err_buf_len, &err.to_string());
            map_error(&err)
        }
        Err(_) => {
            write_error(err_buf, err_buf_len, "panic crossed FFI boundary");
            NbxStatusCode::Internal
        }
    }
}

fn publish_bridge(
    out_bridge: *mut *mut NbxBridgeHandle,
    config: BridgeConfig,
) -> std::result::Result<(), NbxError> {
    let bridge = Bridge::new(config)?;
    let handle = Box::new(BridgeHandle { bridge });
    // SAFETY: callers validate out_bridge non-null before building the config.
    unsafe {
        *out_bridge = Box::into_raw(handle).cast::<NbxBridgeHandle>();
    }
    Ok(())
}

/// Creates a bridge from JSON-encoded [`BridgeConfig`]. Missing keys take defaults.
#[unsafe(no_mangle)]
pub extern "C" fn nbx_bridge_new_from_config_json(
    config_json: *const c_char,
    out_bridge: *mut *mut NbxBridgeHandle,
    err_buf: *mut c_char,
    err_buf_len: usize,
) -> NbxStatusCode {
    with_unwind_guard(err_buf, err_buf_len, || {
        if out_bridge.is_null() {
            return Err(NbxError::InvalidConfig("out_bridge is null".to_string()));
        }
        let raw = parse_cstr_owned(config_json, "config_json")?;
        let config: BridgeConfig = serde_json::from_str(&raw)
            .map_err(|e| NbxError::InvalidConfig(format!("invalid config JSON: {e}")))?;
        publish_bridge(out_bridge, config)
    })
}

/// Creates a bridge from key/value config pairs (`key=value,key=value`).
#[unsafe(no_mangle)]
pub extern "C" fn nbx_bridge_new_from_config_kv(
    config_kv: *const c_char,
    out_bridge: *mut *mut NbxBridgeHandle,
    err_buf: *mut c_char,
    err_buf_len: usize,
) -> NbxStatusCode {
    with_unwind_guard(err_buf, err_buf_len, || {
        if out_bridge.is_null() {
            return Err(NbxError::InvalidConfig("out_bridge is null".to_string()));
        }
        let raw = parse_cstr_owned(config_kv, "config_kv")?;
        let mut config = BridgeConfig::default();
        config.apply_kv(&raw)?;
        publish_bridge(out_bridge, config)
    })
}

/// Bytes currently reserved by cursors of this bridge.
#[unsafe(no_mangle)]
pub extern "C" fn nbx_bridge_memory_in_use(bridge: *const NbxBridgeHandle) -> usize {
    if bridge.is_null() {
        return 0;
    }
    // SAFETY: pointer checked for null; caller promises valid handle.
    let h = unsafe { &*bridge.cast::<BridgeHandle>() };
    h.bridge.memory().in_use_bytes()
}

/// Frees a bridge handle created by `nbx_bridge_new_*`.
#[unsafe(no_mangle)]
pub extern "C" fn nbx_bridge_free(bridge: *mut NbxBridgeHandle) {
    if bridge.is_null() {
        return;
    }
    // SAFETY: ownership is transferred back to Rust exactly once by caller.
    let _ = unsafe { Box::from_raw(bridge.cast::<BridgeHandle>()) };
}

/// Bridge behind a C handle, for hosts that create cursors in Rust.
///
/// # Safety
/// `bridge` must be a live handle returned by `nbx_bridge_new_*`.
pub unsafe fn bridge_from_handle<'a>(bridge: *const NbxBridgeHandle) -> Option<&'a Bridge> {
    if bridge.is_null() {
        return None;
    }
    // SAFETY: caller promises a live handle.
    Some(unsafe { &(*bridge.cast::<BridgeHandle>()).bridge })
}

/// Hands an export cursor to native code. Free it with [`nbx_export_free`].
pub fn export_into_raw(cursor: ExportCursor<BoxedRows>) -> *mut NbxExportHandle {
    Box::into_raw(Box::new(ExportHandle { cursor })).cast::<NbxExportHandle>()
}

/// Publishes the next batch of an export cursor into caller-owned descriptors.
///
/// On success `out_has_batch` is set to `true` and both descriptors are
/// populated (the caller releases them), or to `false` at end of stream with
/// the descriptors untouched. Descriptors still holding an unreleased array
/// are rejected with a protocol violation.
#[unsafe(no_mangle)]
pub extern "C" fn nbx_export_next(
    export: *mut NbxExportHandle,
    schema_out: *mut FFI_ArrowSchema,
    array_out: *mut FFI_ArrowArray,
    out_has_batch: *mut bool,
    err_buf: *mut c_char,
    err_buf_len: usize,
) -> NbxStatusCode {
    with_unwind_guard(err_buf, err_buf_len, || {
        if export.is_null() {
            return Err(NbxError::InvalidConfig("export is null".to_string()));
        }
        if out_has_batch.is_null() {
            return Err(NbxError::InvalidConfig("out_has_batch is null".to_string()));
        }
        // SAFETY: export pointer validated non-null above and points to valid ExportHandle.
        let h = unsafe { &mut *export.cast::<ExportHandle>() };
        let has_batch = h.cursor.has_next();
        if has_batch {
            // SAFETY: caller owns both descriptors for the duration of this call.
            let handles = unsafe { DescriptorHandles::from_raw(schema_out, array_out) };
            h.cursor.next_export()?.export(handles)?;
        }
        // SAFETY: out_has_batch validated non-null above.
        unsafe {
            *out_has_batch = has_batch;
        }
        Ok(())
    })
}

/// Closes an export cursor early. Idempotent.
///
/// Later `nbx_export_next` calls succeed and report no batch.
#[unsafe(no_mangle)]
pub extern "C" fn nbx_export_close(export: *mut NbxExportHandle) {
    if export.is_null() {
        return;
    }
    // SAFETY: pointer checked for null; caller promises valid handle.
    let h = unsafe { &mut *export.cast::<ExportHandle>() };
    h.cursor.close();
}

/// Frees an export handle, closing the cursor if still open.
#[unsafe(no_mangle)]
pub extern "C" fn nbx_export_free(export: *mut NbxExportHandle) {
    if export.is_null() {
        return;
    }
    // SAFETY: ownership is transferred back to Rust exactly once by caller.
    let _ = unsafe { Box::from_raw(export.cast::<ExportHandle>()) };
}

/// Returns the status code symbolic name.
#[unsafe(no_mangle)]
pub extern "C" fn nbx_status_name(code: NbxStatusCode) -> *const c_char {
    static OK: &[u8] = b"OK\0";
    static INVALID_CONFIG: &[u8] = b"INVALID_CONFIG\0";
    static PROTOCOL_VIOLATION: &[u8] = b"PROTOCOL_VIOLATION\0";
    static PRODUCER_FAULT: &[u8] = b"PRODUCER_FAULT\0";
    static FRAMING_CORRUPTION: &[u8] = b"FRAMING_CORRUPTION\0";
    static RESOURCES_EXHAUSTED: &[u8] = b"RESOURCES_EXHAUSTED\0";
    static EXECUTION: &[u8] = b"EXECUTION\0";
    static IO: &[u8] = b"IO\0";
    static INTERNAL: &[u8] = b"INTERNAL\0";
    match code {
        NbxStatusCode::Ok => OK.as_ptr().cast::<c_char>(),
        NbxStatusCode::InvalidConfig => INVALID_CONFIG.as_ptr().cast::<c_char>(),
        NbxStatusCode::ProtocolViolation => PROTOCOL_VIOLATION.as_ptr().cast::<c_char>(),
        NbxStatusCode::ProducerFault => PRODUCER_FAULT.as_ptr().cast::<c_char>(),
        NbxStatusCode::FramingCorruption => FRAMING_CORRUPTION.as_ptr().cast::<c_char>(),
        NbxStatusCode::ResourcesExhausted => RESOURCES_EXHAUSTED.as_ptr().cast::<c_char>(),
        NbxStatusCode::Execution => EXECUTION.as_ptr().cast::<c_char>(),
        NbxStatusCode::Io => IO.as_ptr().cast::<c_char>(),
        NbxStatusCode::Internal => INTERNAL.as_ptr().cast::<c_char>(),
    }
}
