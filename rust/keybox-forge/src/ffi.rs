//! C ABI for the native keystore interceptor.
//!
//! The interceptor owns the binder hooks and hands key box documents,
//! build vars and attestation chains across this boundary. Every entry point
//! catches panics; invalid pointers produce an empty buffer or a negative
//! sentinel.
//!
//! # Safety
//!
//! `unsafe` is confined to turning C pointers into slices in
//! [`validate_slice_args`]. The rest is safe Rust.

use std::panic;
use std::ptr;

use tracing::warn;

use crate::cbor::{self, Value};
use crate::config::{self, BuildVars, IdTagTable};
use crate::cose;
use crate::device_info::{self, PropertyBootState};
use crate::forge::CertificateChainForger;
use crate::keybox;

/// Source id of documents loaded through [`rust_keybox_reload`].
const BRIDGE_SOURCE: &str = "keybox.xml";

/// Validate pointer and length for slice creation.
///
/// Rejects a null pointer with a non-zero length, a pointer misaligned for
/// `T` and a total size above `isize::MAX`. A zero length always yields an
/// empty slice.
unsafe fn validate_slice_args<'a, T>(ptr: *const T, len: usize) -> Option<&'a [T]> {
    if len == 0 {
        return Some(&[]);
    }
    if ptr.is_null() {
        return None;
    }
    #[allow(clippy::manual_is_multiple_of)]
    if (ptr as usize) % std::mem::align_of::<T>() != 0 {
        return None;
    }
    let size_of_t = std::mem::size_of::<T>();
    if size_of_t > 0 {
        let size = len.checked_mul(size_of_t)?;
        if size > isize::MAX as usize {
            return None;
        }
    }
    Some(std::slice::from_raw_parts(ptr, len))
}

/// Split `data` into `count` items at `offsets` (`count + 1` entries, the
/// last one being the end of the final item).
unsafe fn read_segments(
    data_ptr: *const u8,
    data_len: usize,
    offsets_ptr: *const usize,
    count: usize,
) -> Option<Vec<Vec<u8>>> {
    if count == 0 {
        return Some(Vec::new());
    }
    let data = validate_slice_args(data_ptr, data_len)?;
    let offsets = validate_slice_args(offsets_ptr, count.checked_add(1)?)?;
    offsets
        .windows(2)
        .map(|bounds| data.get(bounds[0]..bounds[1]).map(<[u8]>::to_vec))
        .collect()
}

unsafe fn read_str<'a>(ptr: *const u8, len: usize) -> Option<&'a str> {
    std::str::from_utf8(validate_slice_args(ptr, len)?).ok()
}

/// Result buffer returned to C/C++ callers.
/// The caller must free the buffer with `rust_free_buffer`.
#[repr(C)]
pub struct RustBuffer {
    pub data: *mut u8,
    pub len: usize,
}

impl RustBuffer {
    fn from_vec(v: Vec<u8>) -> Self {
        let mut boxed = v.into_boxed_slice();
        let data = boxed.as_mut_ptr();
        let len = boxed.len();
        std::mem::forget(boxed);
        RustBuffer { data, len }
    }

    fn empty() -> Self {
        RustBuffer {
            data: ptr::null_mut(),
            len: 0,
        }
    }
}

/// Free a buffer previously returned by a Rust FFI function.
///
/// # Safety
/// `buf.data` must have been allocated by Rust (returned from a `rust_*` function)
/// and must not have been freed already.
#[no_mangle]
pub unsafe extern "C" fn rust_free_buffer(buf: RustBuffer) {
    if !buf.data.is_null() && buf.len > 0 {
        let _ = panic::catch_unwind(panic::AssertUnwindSafe(|| unsafe {
            let _ = Box::from_raw(std::ptr::slice_from_raw_parts_mut(buf.data, buf.len));
        }));
    }
}

/// Encode a CBOR integer.
#[no_mangle]
pub extern "C" fn rust_cbor_encode_int(value: i64) -> RustBuffer {
    panic::catch_unwind(panic::AssertUnwindSafe(|| {
        RustBuffer::from_vec(cbor::encode(&Value::Integer(value)))
    }))
    .unwrap_or_else(|_| RustBuffer::empty())
}

/// Encode a CBOR byte string.
///
/// # Safety
/// `data` must point to `len` valid bytes, or be null if `len` is 0.
#[no_mangle]
pub unsafe extern "C" fn rust_cbor_encode_bytes(data: *const u8, len: usize) -> RustBuffer {
    panic::catch_unwind(panic::AssertUnwindSafe(|| {
        match unsafe { validate_slice_args(data, len) } {
            Some(bytes) => RustBuffer::from_vec(cbor::encode(&Value::bytes(bytes))),
            None => RustBuffer::empty(),
        }
    }))
    .unwrap_or_else(|_| RustBuffer::empty())
}

/// Encode a CBOR text string. Invalid UTF-8 is replaced.
///
/// # Safety
/// `data` must point to `len` valid bytes, or be null if `len` is 0.
#[no_mangle]
pub unsafe extern "C" fn rust_cbor_encode_text(data: *const u8, len: usize) -> RustBuffer {
    panic::catch_unwind(panic::AssertUnwindSafe(|| {
        match unsafe { validate_slice_args(data, len) } {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                RustBuffer::from_vec(cbor::encode(&Value::text(text)))
            }
            None => RustBuffer::empty(),
        }
    }))
    .unwrap_or_else(|_| RustBuffer::empty())
}

// ---- Key boxes ----

/// Replace the process-wide key boxes with those of a UTF-8 document.
///
/// Returns the number of key boxes loaded, or -1 if the document could not
/// be read; the previous key boxes stay in place on failure.
///
/// # Safety
/// `data` must point to `len` valid bytes.
#[no_mangle]
pub unsafe extern "C" fn rust_keybox_reload(data: *const u8, len: usize) -> i32 {
    panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let Some(document) = (unsafe { read_str(data, len) }) else {
            warn!("key box document is not valid UTF-8");
            return -1;
        };
        match keybox::global().load(BRIDGE_SOURCE, document) {
            Ok(count) => i32::try_from(count).unwrap_or(i32::MAX),
            Err(_) => -1,
        }
    }))
    .unwrap_or(-1)
}

#[no_mangle]
pub extern "C" fn rust_keybox_can_hack() -> bool {
    panic::catch_unwind(panic::AssertUnwindSafe(|| keybox::global().can_hack()))
        .unwrap_or(false)
}

#[no_mangle]
pub extern "C" fn rust_keybox_count() -> usize {
    panic::catch_unwind(panic::AssertUnwindSafe(|| keybox::global().count_key_boxes()))
        .unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn rust_keybox_clear() {
    let _ = panic::catch_unwind(panic::AssertUnwindSafe(|| keybox::global().clear()));
}

/// Forge an attestation chain with the loaded key boxes and current build
/// vars.
///
/// The chain is passed as concatenated DER certificates (leaf first) with
/// `count + 1` offsets. The result is a CBOR array of byte strings; it is
/// the original chain when no key box applies or forging fails. Malformed
/// arguments yield an empty buffer.
///
/// # Safety
/// All pointers must be valid for their stated lengths.
#[no_mangle]
pub unsafe extern "C" fn rust_forge_certificate_chain(
    data_ptr: *const u8,
    data_len: usize,
    offsets_ptr: *const usize,
    count: usize,
) -> RustBuffer {
    panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let Some(chain) = (unsafe { read_segments(data_ptr, data_len, offsets_ptr, count) }) else {
            return RustBuffer::empty();
        };
        let config = config::current().forge_config(&IdTagTable::default());
        let forged = CertificateChainForger::new(keybox::global(), config).hack_chain(&chain);
        RustBuffer::from_vec(cbor::encode(&Value::Array(
            forged.into_iter().map(Value::Bytes).collect(),
        )))
    }))
    .unwrap_or_else(|_| RustBuffer::empty())
}

// ---- Build vars ----

/// Replace the build vars with a `KEY=VALUE` UTF-8 document.
///
/// Returns the number of variables, or -1 for an invalid buffer.
///
/// # Safety
/// `data` must point to `len` valid bytes, or be null if `len` is 0.
#[no_mangle]
pub unsafe extern "C" fn rust_update_build_vars(data: *const u8, len: usize) -> i32 {
    panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let Some(text) = (unsafe { read_str(data, len) }) else {
            return -1;
        };
        let vars = BuildVars::parse(text);
        let count = i32::try_from(vars.len()).unwrap_or(i32::MAX);
        config::update(vars);
        count
    }))
    .unwrap_or(-1)
}

// ---- Remote key provisioning ----

/// Create the DeviceInfo map from the current build vars.
///
/// `digest_ptr`/`digest_len` carry the `ro.boot.vbmeta.digest` property
/// value as hex text; pass null/0 when the property is unset.
///
/// # Safety
/// `digest_ptr` must be valid for `digest_len` bytes, or null if 0.
#[no_mangle]
pub unsafe extern "C" fn rust_create_device_info(
    digest_ptr: *const u8,
    digest_len: usize,
) -> RustBuffer {
    panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let property = unsafe { read_str(digest_ptr, digest_len) }.filter(|s| !s.is_empty());
        let boot_state = PropertyBootState::new(property);
        let properties = config::current().device_properties();
        RustBuffer::from_vec(device_info::build_device_info(&properties, &boot_state))
    }))
    .unwrap_or_else(|_| RustBuffer::empty())
}

/// Generate a COSE_Mac0 MACed public key for RKP.
///
/// # Safety
/// All pointers must be valid for their stated lengths, or null if length is 0.
#[no_mangle]
pub unsafe extern "C" fn rust_generate_maced_public_key(
    x_ptr: *const u8,
    x_len: usize,
    y_ptr: *const u8,
    y_len: usize,
    hmac_key_ptr: *const u8,
    hmac_key_len: usize,
) -> RustBuffer {
    panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let args = unsafe {
            (
                validate_slice_args(x_ptr, x_len),
                validate_slice_args(y_ptr, y_len),
                validate_slice_args(hmac_key_ptr, hmac_key_len),
            )
        };
        let (Some(x), Some(y), Some(hmac_key)) = args else {
            return RustBuffer::empty();
        };
        match cose::generate_maced_public_key(x, y, hmac_key) {
            Ok(buf) => RustBuffer::from_vec(buf),
            Err(e) => {
                warn!(error = %e, "cannot generate MACed public key");
                RustBuffer::empty()
            }
        }
    }))
    .unwrap_or_else(|_| RustBuffer::empty())
}

/// Create a certificate request response for RKP.
///
/// MACed keys are passed concatenated with `keys_count + 1` offsets.
///
/// # Safety
/// All pointers must be valid for their stated lengths.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn rust_create_certificate_request(
    keys_data_ptr: *const u8,
    keys_data_len: usize,
    keys_offsets_ptr: *const usize,
    keys_count: usize,
    challenge_ptr: *const u8,
    challenge_len: usize,
    device_info_ptr: *const u8,
    device_info_len: usize,
) -> RustBuffer {
    panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let args = unsafe {
            (
                read_segments(keys_data_ptr, keys_data_len, keys_offsets_ptr, keys_count),
                validate_slice_args(challenge_ptr, challenge_len),
                validate_slice_args(device_info_ptr, device_info_len),
            )
        };
        let (Some(maced_keys), Some(challenge), Some(device_info)) = args else {
            return RustBuffer::empty();
        };
        RustBuffer::from_vec(cose::create_certificate_request_response(
            &maced_keys,
            challenge,
            device_info,
        ))
    }))
    .unwrap_or_else(|_| RustBuffer::empty())
}
