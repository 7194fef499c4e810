//! Provider module for the shared-library loader tests
//!
//! Compiled on the fly with `rustc --crate-type cdylib`. Passing
//! `--cfg without_teardown` leaves out the teardown entry point.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::sync::atomic::{AtomicU8, Ordering};

#[repr(C)]
pub struct RawRegistrar {
    ctx: *mut c_void,
    register: unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char, u32, u32) -> bool,
}

static ACCEPTED: AtomicU8 = AtomicU8::new(0);
static TEARDOWNS: AtomicU8 = AtomicU8::new(0);

const OFFERS: [(&[u8], &[u8], u32, u32); 4] = [
    (b"fx_text\0", b"fx_text_impl\0", 1, 0),
    (b"fx_echo\0", b"fx_echo_impl\0", 2, 2),
    (b"fx_double\0", b"fx_double_impl\0", 3, 1 | 4),
    (b"fx_teardowns\0", b"fx_teardowns_impl\0", 4, 1),
];

unsafe fn copy_out(text: &[u8], out: *mut c_char, cap: usize) -> usize {
    let len = text.len().min(cap);
    std::ptr::copy_nonoverlapping(text.as_ptr(), out.cast::<u8>(), len);
    len
}

#[no_mangle]
pub extern "C" fn sensd_module_name() -> *const c_char {
    b"fixture\0".as_ptr().cast()
}

#[no_mangle]
pub unsafe extern "C" fn sensd_module_init(registrar: *mut RawRegistrar) -> c_int {
    let registrar = &*registrar;
    for (name, method, timeout, var_type) in OFFERS {
        let name = name.as_ptr().cast();
        let method = method.as_ptr().cast();
        if (registrar.register)(registrar.ctx, name, method, timeout, var_type) {
            ACCEPTED.fetch_add(1, Ordering::SeqCst);
        }
    }
    0
}

#[cfg(not(without_teardown))]
#[no_mangle]
pub extern "C" fn sensd_module_teardown() {
    TEARDOWNS.fetch_add(1, Ordering::SeqCst);
}

#[no_mangle]
pub unsafe extern "C" fn fx_text_impl(out: *mut c_char, cap: usize) -> usize {
    copy_out(b"42%", out, cap)
}

#[no_mangle]
pub unsafe extern "C" fn fx_echo_impl(arg: *const c_char, out: *mut c_char, cap: usize) -> usize {
    copy_out(CStr::from_ptr(arg).to_bytes(), out, cap)
}

#[no_mangle]
pub extern "C" fn fx_double_impl(arg: i64) -> u8 {
    (arg * 2).clamp(0, 100) as u8
}

#[no_mangle]
pub extern "C" fn fx_teardowns_impl() -> u8 {
    TEARDOWNS.load(Ordering::SeqCst)
}

#[no_mangle]
pub extern "C" fn fx_accepted_impl() -> u8 {
    ACCEPTED.load(Ordering::SeqCst)
}
