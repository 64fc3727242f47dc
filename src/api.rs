//! C-compatible entry points (feature `c-api`).
//!
//! These export the classic allocation symbols from the cdylib so it can be
//! dropped into an existing C program without recompilation:
//!
//! ```bash,ignore
//! cargo build --release --features c-api
//! LD_PRELOAD=target/release/libtagalloc.so ./your_program
//! ```
//!
//! The functions are thin: each one forwards to the corresponding
//! [`Tagalloc`] operation, which takes the allocator mutex, counts the call
//! and runs the engine. The feature gate exists so that ordinary Rust
//! builds, and in particular test binaries, never interpose their own heap.

use std::ffi::c_void;

use libc::size_t;

use crate::Tagalloc;

/// See `malloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    Tagalloc::new().malloc(size).cast()
}

/// See `free(3)`. Null is a no-op.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    Tagalloc::new().free(ptr.cast());
}

/// See `realloc(3)`. Preserves `min(old, new)` bytes; a null `ptr` behaves
/// like `malloc`.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    Tagalloc::new().realloc(ptr.cast(), size).cast()
}

/// See `calloc(3)`. Returns zero-filled memory for `num_elems * elem_size`
/// bytes, or null when that multiplication overflows.
#[no_mangle]
pub unsafe extern "C" fn calloc(num_elems: size_t, elem_size: size_t) -> *mut c_void {
    Tagalloc::new().calloc(num_elems, elem_size).cast()
}

/// Usable capacity of the allocation at `ptr`, zero for null.
#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> size_t {
    Tagalloc::new().payload_size(ptr.cast())
}
