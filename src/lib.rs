#![no_std]
#![cfg_attr(feature = "nightly", feature(thread_local))]

//! lfsmr: lock-free concurrent data structures built on epoch-based safe
//! memory reclamation.
//!
//! - [`epoch`] — the reclamation service: brackets, deferred frees, a
//!   background tick that advances the global epoch once every thread has
//!   quiesced past it.
//! - [`lfht`] — a lock-free open-addressed hash table with incremental
//!   background migration across growth/rehash events.
//! - [`nbsl`] — the non-blocking singly-linked stack both of the above are
//!   built on (client list, generation stack).
//! - [`pc`] — the per-CPU sharding primitive used to cut contention on
//!   counters and cursors.
//!
//! # Usage
//!
//! ```ignore
//! let table = lfsmr::lfht::Lfht::new(|value| value);
//! table.add(42, 42);
//! assert_eq!(table.get_first(42, |v| v == 42), Some(42));
//! ```

extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod config;
pub mod epoch;
pub mod ext;
pub mod lfht;
pub mod nbsl;
pub mod pc;
pub mod sync;

// Panic handler for no_std, no-alloc-runtime builds (no_std has no default
// panic handler). Only active when panic="abort" (i.e., the `fast`
// profile), not during normal checks.
#[cfg(all(not(test), not(feature = "std"), panic = "abort"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    unsafe extern "C" {
        fn abort() -> !;
    }
    unsafe { abort() }
}
