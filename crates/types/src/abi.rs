//! Native module ABI definitions
//!
//! A provider built as a shared library exports three C symbols:
//!
//! - [`NAME_SYMBOL`]: `extern "C" fn() -> *const c_char`, a NUL-terminated
//!   module name that stays valid while the library is loaded
//! - [`INIT_SYMBOL`]: `extern "C" fn(*mut RawRegistrar) -> c_int`, called once
//!   after loading; returns 0 on success
//! - [`TEARDOWN_SYMBOL`]: `extern "C" fn()`, called right before unloading
//!
//! During init the module calls `RawRegistrar::register` for every variable
//! it offers. The `method` it passes is the name of another exported symbol
//! which the daemon binds the first time the variable is evaluated. The
//! signature of that symbol follows from the variable's type tag:
//!
//! | Kind | Argument | Signature |
//! |---|---|---|
//! | text | none | [`TextFn`] |
//! | text | string | [`TextStrFn`] |
//! | text | int | [`TextIntFn`] |
//! | text | double | [`TextDblFn`] |
//! | bar/graph | none | [`LevelFn`] |
//! | bar/graph | string | [`LevelStrFn`] |
//! | bar/graph | int | [`LevelIntFn`] |
//! | bar/graph | double | [`LevelDblFn`] |
//!
//! Text functions write into a buffer owned by the daemon and return the
//! number of bytes written, so no allocation ever crosses the boundary.
//!
//! The daemon itself only crosses this boundary in its shared-library
//! loader. [`write_text`] is the one function here meant for the other
//! side: module authors writing their text functions in Rust.

use std::ffi::{c_char, c_int, c_void};

pub const NAME_SYMBOL: &[u8] = b"sensd_module_name\0";
pub const INIT_SYMBOL: &[u8] = b"sensd_module_init\0";
pub const TEARDOWN_SYMBOL: &[u8] = b"sensd_module_teardown\0";

/// Size of the buffer handed to text functions
pub const TEXT_BUFFER_LEN: usize = 512;

pub type NameFn = unsafe extern "C" fn() -> *const c_char;
pub type InitFn = unsafe extern "C" fn(registrar: *mut RawRegistrar) -> c_int;
pub type TeardownFn = unsafe extern "C" fn();

pub type RegisterFn = unsafe extern "C" fn(
    ctx: *mut c_void,
    name: *const c_char,
    method: *const c_char,
    default_timeout: u32,
    var_type: u32,
) -> bool;

/// Registration handle passed to a module's init entry point
#[repr(C)]
pub struct RawRegistrar {
    /// Opaque daemon state, hand back unchanged
    pub ctx: *mut c_void,
    /// Returns true when the variable was registered (some consumer uses it)
    pub register: RegisterFn,
}

pub type TextFn = unsafe extern "C" fn(out: *mut c_char, cap: usize) -> usize;
pub type TextStrFn =
    unsafe extern "C" fn(arg: *const c_char, out: *mut c_char, cap: usize) -> usize;
pub type TextIntFn = unsafe extern "C" fn(arg: i64, out: *mut c_char, cap: usize) -> usize;
pub type TextDblFn = unsafe extern "C" fn(arg: f64, out: *mut c_char, cap: usize) -> usize;

pub type LevelFn = unsafe extern "C" fn() -> u8;
pub type LevelStrFn = unsafe extern "C" fn(arg: *const c_char) -> u8;
pub type LevelIntFn = unsafe extern "C" fn(arg: i64) -> u8;
pub type LevelDblFn = unsafe extern "C" fn(arg: f64) -> u8;

/// Copy `text` into a daemon-provided buffer, truncating to `cap` bytes
///
/// For use inside a module's text functions; the daemon never calls it.
/// Returns the number of bytes written.
///
/// # Safety
/// `out` must be valid for writes of `cap` bytes.
pub unsafe fn write_text(out: *mut c_char, cap: usize, text: &str) -> usize {
    if out.is_null() {
        return 0;
    }
    let len = text.len().min(cap);
    std::ptr::copy_nonoverlapping(text.as_ptr(), out.cast::<u8>(), len);
    len
}
