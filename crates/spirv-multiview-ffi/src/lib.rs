//! C ABI for the multiview patcher.
//!
//! Every export takes the input module as `size` words at `data` and reports the output length in
//! words through `size_out`. The output is copied to `data_out` only when it is non-null, so
//! callers can query the required length first and then call again with a buffer of that size.
//!
//! All exports return `0` on success and `-1` on failure. Nothing is written on failure.

use std::ffi::{c_char, CString};
use std::sync::{Arc, RwLock};

use spirv_multiview::{
    Diagnostic, MultiviewError, MultiviewPatcher, PatchConfig, RelocateOptions, SpirvTools,
    ToolchainConfig,
};
use tracing::warn;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = -1;

/// Receives one NUL-terminated diagnostic line per toolchain message.
pub type MessageCallback = extern "C" fn(message: *const c_char);

static MESSAGE_CALLBACK: RwLock<Option<MessageCallback>> = RwLock::new(None);

fn forward_diagnostic(diagnostic: &Diagnostic) {
    let callback = match MESSAGE_CALLBACK.read() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    };
    let Some(callback) = callback else {
        return;
    };
    let text = diagnostic.to_string().replace('\0', " ");
    if let Ok(text) = CString::new(text) {
        callback(text.as_ptr());
    }
}

fn patcher() -> MultiviewPatcher {
    let toolchain = ToolchainConfig::from_env().unwrap_or_else(|err| {
        warn!(%err, "ignoring toolchain configuration");
        ToolchainConfig::default()
    });
    let config = PatchConfig::from_env().unwrap_or_else(|err| {
        warn!(%err, "ignoring patch configuration");
        PatchConfig::default()
    });
    let tools = SpirvTools::new(toolchain).with_sink(Arc::new(forward_diagnostic));
    MultiviewPatcher::with_toolchain(tools, config)
}

/// Shared body of every export: borrow the input, run `op`, publish the output.
///
/// # Safety
/// `data` must point to `size` readable words. `size_out` must be writable. `data_out`, when
/// non-null, must have room for the produced module.
unsafe fn run(
    name: &'static str,
    data: *const u32,
    size: u32,
    data_out: *mut u32,
    size_out: *mut u32,
    op: impl FnOnce(&MultiviewPatcher, &[u32]) -> Result<Vec<u32>, MultiviewError>,
) -> i32 {
    if data.is_null() || size_out.is_null() {
        warn!(export = name, "null pointer argument");
        return FAILURE;
    }
    // SAFETY: the caller guarantees `data` holds `size` words.
    let words = unsafe { std::slice::from_raw_parts(data, size as usize) };

    let out = match op(&patcher(), words) {
        Ok(out) => out,
        Err(err) => {
            warn!(export = name, %err, "SPIR-V patching failed");
            return FAILURE;
        }
    };
    let Ok(len) = u32::try_from(out.len()) else {
        warn!(export = name, len = out.len(), "output does not fit a u32 length");
        return FAILURE;
    };

    if !data_out.is_null() {
        // SAFETY: the caller sized `data_out` from a previous length query.
        unsafe { std::ptr::copy_nonoverlapping(out.as_ptr(), data_out, out.len()) };
    }
    // SAFETY: checked non-null above.
    unsafe { *size_out = len };
    SUCCESS
}

/// Runs the performance passes over the module.
///
/// # Safety
/// See the module documentation for the pointer contract.
#[no_mangle]
pub unsafe extern "C" fn OptimizeSPIRV(
    data: *const u32,
    size: u32,
    data_out: *mut u32,
    size_out: *mut u32,
) -> i32 {
    unsafe {
        run("OptimizeSPIRV", data, size, data_out, size_out, |patcher, words| {
            patcher.optimize(words)
        })
    }
}

/// Declares the `MultiView` capability on a translated vertex shader.
///
/// # Safety
/// See the module documentation for the pointer contract.
#[no_mangle]
pub unsafe extern "C" fn AddSPIRVMultiViewCapability(
    data: *const u32,
    size: u32,
    data_out: *mut u32,
    size_out: *mut u32,
) -> i32 {
    unsafe {
        run(
            "AddSPIRVMultiViewCapability",
            data,
            size,
            data_out,
            size_out,
            |patcher, words| patcher.add_multiview_capability(words),
        )
    }
}

/// Points the vertex shader's matrix reads at the current view's copy.
///
/// `f_idx` is the matrix's first row in the constant array and `offset` the slot where the
/// per-view data begins. A non-zero `optimize` runs the performance passes instead of validating.
///
/// # Safety
/// See the module documentation for the pointer contract.
#[no_mangle]
pub unsafe extern "C" fn ChangeSPIRVMultiViewDataAccessLocation(
    data: *const u32,
    size: u32,
    data_out: *mut u32,
    size_out: *mut u32,
    f_idx: u32,
    offset: u32,
    optimize: i8,
) -> i32 {
    let options = RelocateOptions {
        field_index: f_idx,
        base_offset: offset,
        optimize: optimize != 0,
    };
    unsafe {
        run(
            "ChangeSPIRVMultiViewDataAccessLocation",
            data,
            size,
            data_out,
            size_out,
            |patcher, words| patcher.relocate_multiview_data_access(words, options),
        )
    }
}

/// Registers the receiver for toolchain diagnostics, replacing any previous one. Pass null to
/// stop forwarding.
#[no_mangle]
pub extern "C" fn SetSPIRVMessageCallback(callback: Option<MessageCallback>) {
    match MESSAGE_CALLBACK.write() {
        Ok(mut guard) => *guard = callback,
        Err(poisoned) => *poisoned.into_inner() = callback,
    }
}
