//! The public surface: one process-wide engine behind a mutex, and the
//! [`Tagalloc`] handle that exposes the malloc family on top of it.
//!
//! Every entry point does the same dance: make sure one-time initialisation
//! has run, take the mutex, bump the operation's counter, call into the
//! engine, drop the mutex. The whole search/split/coalesce and even the OS
//! slab call happen under the lock; the only work that deliberately runs
//! outside it is the realloc copy and the calloc zero-fill, both on memory
//! no other thread can legally touch yet.
//!
//! Nothing on these paths allocates through the allocator itself: the
//! engine is const-initialised in a `static`, the environment is read with
//! `getenv` instead of `std::env` (which returns a `String`), and the
//! at-exit report goes through the unbuffered sink in [`crate::diag`]. That
//! is what makes it safe to install [`Tagalloc`] as the process allocator.

use std::{
    alloc::{GlobalAlloc, Layout},
    ffi::CStr,
    fmt, ptr,
    ptr::NonNull,
    sync::{Mutex, Once},
};

#[cfg(feature = "log")]
use log::debug;

use crate::{
    diag,
    engine::{Engine, Stats},
    header::{BlockHeader, ALIGNMENT},
};

/// The process-wide allocator state. `Mutex::new` and `Engine::new` are both
/// const, so this initialises without allocating and without a runtime hook.
static ENGINE: Mutex<Engine> = Mutex::new(Engine::new());

static INIT: Once = Once::new();

/// One-time setup: resolve the verbose flag from the environment and
/// register the at-exit statistics report. Runs on the first call to any
/// entry point.
fn ensure_initialized() {
    INIT.call_once(|| unsafe {
        let verbose = verbose_from_env();

        if let Ok(mut engine) = ENGINE.lock() {
            engine.verbose = verbose;
        }

        libc::atexit(report_stats_at_exit);

        debug!("allocator initialised, verbose = {verbose}");
    });
}

/// `MALLOCVERBOSE` unset means verbose; set to the literal `NO` means
/// quiet; anything else means verbose. Read through `getenv` because
/// `std::env::var` allocates and this can run inside the global allocator.
unsafe fn verbose_from_env() -> bool {
    let value = libc::getenv(b"MALLOCVERBOSE\0".as_ptr().cast());

    if value.is_null() {
        return true;
    }

    CStr::from_ptr(value).to_bytes() != b"NO"
}

/// Prints the statistics block to stdout when verbose mode is on. Uses
/// `try_lock`: if some thread is still inside the allocator while the
/// process exits, skipping the report beats deadlocking in `exit(3)`.
extern "C" fn report_stats_at_exit() {
    if let Ok(engine) = ENGINE.try_lock() {
        if engine.verbose {
            let _ = diag::write_stats(&engine.stats(), &mut diag::RawStdout);
        }
    }
}

/// Zero-sized handle to the process-wide allocator. Every instance refers
/// to the same state, so it can be freely created, copied around and
/// installed as the Rust global allocator:
///
/// ```no_run
/// use tagalloc::Tagalloc;
///
/// #[global_allocator]
/// static ALLOCATOR: Tagalloc = Tagalloc::new();
///
/// fn main() {
///     let stats = Tagalloc::new().stats();
///     assert_eq!(stats.heap_size % 8, 0);
/// }
/// ```
pub struct Tagalloc;

impl Tagalloc {
    pub const fn new() -> Self {
        Self
    }

    /// Allocates a payload of at least `size` bytes, 8-byte aligned, or
    /// null when the OS refuses memory (or the request can never fit in a
    /// slab).
    ///
    /// # Safety
    ///
    /// The returned region is uninitialised. Freeing it through anything
    /// other than this allocator is undefined behaviour.
    pub unsafe fn malloc(&self, size: usize) -> *mut u8 {
        ensure_initialized();

        let Ok(mut engine) = ENGINE.lock() else {
            return ptr::null_mut();
        };
        engine.stats.malloc_calls += 1;

        match engine.allocate(size) {
            Ok(payload) => payload.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    /// Returns `ptr`'s block to the free list. Null is a no-op, though the
    /// call is still counted.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live payload obtained from this allocator.
    /// Double frees and foreign pointers are undefined behaviour.
    pub unsafe fn free(&self, ptr: *mut u8) {
        ensure_initialized();

        let Ok(mut engine) = ENGINE.lock() else {
            return;
        };
        engine.stats.free_calls += 1;

        if let Some(payload) = NonNull::new(ptr) {
            engine.free(payload);
        }
    }

    /// Resizes the allocation at `ptr` to `new_size` bytes, preserving
    /// `min(old, new)` bytes of content. Null `ptr` behaves as a plain
    /// allocation. On failure the old block is left untouched and null is
    /// returned.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::free`] for `ptr`. The copy runs with the
    /// mutex dropped: that is sound because the caller is already forbidden
    /// from freeing or resizing the same pointer concurrently.
    pub unsafe fn realloc(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        ensure_initialized();

        let new_payload = {
            let Ok(mut engine) = ENGINE.lock() else {
                return ptr::null_mut();
            };
            engine.stats.realloc_calls += 1;

            match engine.allocate(new_size) {
                Ok(payload) => payload,
                Err(_) => return ptr::null_mut(),
            }
        };

        if let Some(old_payload) = NonNull::new(ptr) {
            let old_size =
                BlockHeader::from_payload_address(old_payload).as_ref().payload_size();

            ptr::copy_nonoverlapping(
                old_payload.as_ptr(),
                new_payload.as_ptr(),
                old_size.min(new_size),
            );

            if let Ok(mut engine) = ENGINE.lock() {
                engine.free(old_payload);
            }
        }

        new_payload.as_ptr()
    }

    /// Allocates a zero-filled region for `num_elems` elements of
    /// `elem_size` bytes each. Returns null when the multiplication
    /// overflows or memory is exhausted.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::malloc`].
    pub unsafe fn calloc(&self, num_elems: usize, elem_size: usize) -> *mut u8 {
        ensure_initialized();

        let (payload, total) = {
            let Ok(mut engine) = ENGINE.lock() else {
                return ptr::null_mut();
            };
            engine.stats.calloc_calls += 1;

            let Some(total) = num_elems.checked_mul(elem_size) else {
                return ptr::null_mut();
            };

            match engine.allocate(total) {
                Ok(payload) => (payload, total),
                Err(_) => return ptr::null_mut(),
            }
        };

        // The zero-fill happens outside the lock; no other thread can hold
        // this block yet.
        ptr::write_bytes(payload.as_ptr(), 0, total);

        payload.as_ptr()
    }

    /// Usable capacity of the allocation at `ptr`, metadata excluded. Can
    /// exceed what was requested because of rounding and unsplit residues.
    /// Zero for null.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live payload from this allocator. No lock is
    /// taken: the block belongs to the caller and a concurrent free of the
    /// same pointer would already be undefined.
    pub unsafe fn payload_size(&self, ptr: *mut u8) -> usize {
        match NonNull::new(ptr) {
            Some(payload) => BlockHeader::from_payload_address(payload).as_ref().payload_size(),
            None => 0,
        }
    }

    /// Snapshot of the allocator's statistics.
    pub fn stats(&self) -> Stats {
        ensure_initialized();

        match ENGINE.lock() {
            Ok(engine) => engine.stats(),
            Err(_) => Stats::default(),
        }
    }

    /// Writes the single-line free list rendering to `out`. Takes the mutex
    /// for a consistent snapshot.
    pub fn dump_free_list(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        ensure_initialized();

        match ENGINE.lock() {
            Ok(mut engine) => unsafe { engine.dump_free_list(out) },
            Err(_) => Err(fmt::Error),
        }
    }
}

impl Default for Tagalloc {
    fn default() -> Self {
        Self::new()
    }
}

/// Alignment beyond the natural 8-byte grain is out of scope for this
/// allocator, so layouts that need more are refused with a null pointer,
/// which `GlobalAlloc` permits for any failure.
unsafe impl GlobalAlloc for Tagalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.malloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free(ptr);
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.calloc(1, layout.size())
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.realloc(ptr, new_size)
    }
}
