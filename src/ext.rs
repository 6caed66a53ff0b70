//! Per-thread scratch-block runtime collaborator.
//!
//! The epoch service needs exactly one zero-initialized block per thread,
//! released automatically when the thread exits. This is the Rust analogue
//! of the original's `tss_t` + `tss_create(dtor)` pair. With the `std`
//! feature, `crate::epoch`'s client record rides `std::thread_local!`'s own
//! `Drop`-on-exit machinery directly (it needs more than a zero-initialized
//! default: the teardown also unlinks the record from the global client
//! list, which a generic block wrapper can't express). Without `std` (bare
//! `no_std` + `alloc`), there's no language-level thread-local to ride, so
//! this module provides a raw `pthread_key_create`-based TSS slot on unix
//! that `crate::epoch`'s client record uses instead.

// ── no_std fallback: raw pthread TSS ────────────────────────────────────────
//
// Only used when the crate is built without `std`. Provides the same
// "per-thread block, freed at thread exit" contract via POSIX thread-specific
// storage, the way the original runtime collaborator is described to work
// when hosted outside libc's own thread-local machinery.
#[cfg(not(feature = "std"))]
mod nostd_impl {
    use core::ffi::c_void;

    pub type Key = usize;

    unsafe extern "C" {
        fn pthread_key_create(key: *mut Key, dtor: Option<unsafe extern "C" fn(*mut c_void)>) -> i32;
        fn pthread_getspecific(key: Key) -> *mut c_void;
        fn pthread_setspecific(key: Key, value: *const c_void) -> i32;
    }

    /// Create a new TSS key with the given destructor, called at thread exit
    /// with whatever non-null pointer was last installed via `set`.
    ///
    /// # Safety
    /// Must be called at most once per static key slot (matches `call_once`
    /// semantics at the caller).
    pub unsafe fn create_key(dtor: Option<unsafe extern "C" fn(*mut c_void)>) -> Key {
        let mut key: Key = 0;
        let rc = unsafe { pthread_key_create(&mut key, dtor) };
        if rc != 0 {
            panic!("pthread_key_create failed: {rc}");
        }
        key
    }

    /// # Safety
    /// `key` must have been produced by `create_key` and still be live.
    pub unsafe fn get(key: Key) -> *mut c_void {
        unsafe { pthread_getspecific(key) }
    }

    /// # Safety
    /// `key` must have been produced by `create_key` and still be live.
    pub unsafe fn set(key: Key, value: *mut c_void) {
        let rc = unsafe { pthread_setspecific(key, value as *const c_void) };
        if rc != 0 {
            panic!("pthread_setspecific failed: {rc}");
        }
    }
}

#[cfg(not(feature = "std"))]
pub use nostd_impl::{Key, create_key, get, set};
