//! Epoch-based safe memory reclamation (EPOCH).
//!
//! A process-wide singleton, the way the source design's `global_epoch` /
//! `epoch_pc` / `client_list` statics are: one global logical clock, one
//! NBSL of active client records, and four per-epoch per-CPU deferred-call
//! lists. Clients bracket their critical sections with [`bracket_enter`] /
//! [`bracket_leave`]; [`deposit`] queues a callback that fires only after
//! every thread that held a bracket at or before the depositing epoch has
//! released it.
//!
//! Lazily initialized behind a double-checked atomic flag, same shape as
//! [`crate::cpu_cache`]'s `ensure_init`/`init_slow` split: a fast-path
//! null check on an `AtomicPtr`, a `SpinMutex` guarding the one-time build.

use alloc::boxed::Box;
use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crate::nbsl::{Nbsl, Node};
use crate::pc::PerCpu;
use crate::sync::SpinMutex;

#[cfg(feature = "logging")]
use log::debug;

/// Every Nth bracket close does a "deep" scan of all CPUs' deferred counts
/// instead of just the local one (`0x1f` mask in the source).
const TICK_PACE_MASK: u64 = crate::config::EPOCH_TICK_PACE_MASK;

// ── Client record ───────────────────────────────────────────────────────────

/// Per-thread state kept alive in the client NBSL for as long as the
/// thread has ever brokered a bracket.
pub(crate) struct ClientData {
    epoch: AtomicU64,
    active: AtomicI32,
    /// Thread-private; only ever touched by the owning thread, even though
    /// the node it lives in is technically shared for quiescence scans.
    count_since_tick: Cell<u64>,
}

impl ClientData {
    fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            active: AtomicI32::new(0),
            count_since_tick: Cell::new(0),
        }
    }
}

type ClientNode = Node<ClientData>;

// ── Deferred callback lists ─────────────────────────────────────────────────

struct DeferredCall {
    next: AtomicPtr<DeferredCall>,
    call: core::cell::UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
}

// Safety: `call` is written once at construction by the depositing thread
// and read/taken exactly once by whichever thread performs the tick that
// drains this call's slot, after it has been unlinked (exclusive access).
unsafe impl Send for DeferredCall {}
unsafe impl Sync for DeferredCall {}

struct DeferredSlot {
    list: AtomicPtr<DeferredCall>,
    count: AtomicU32,
}

impl DeferredSlot {
    const fn new() -> Self {
        Self { list: AtomicPtr::new(ptr::null_mut()), count: AtomicU32::new(0) }
    }
}

/// `[E+1 mod 4]` unused, `[E mod 4]` fresh inserts, `[E-1 mod 4]` quiet
/// (late inserts still possible), `[E-2 mod 4]` in-progress-then-empty.
struct EpochBucket {
    slots: [DeferredSlot; 4],
}

fn bucket_ctor() -> EpochBucket {
    EpochBucket {
        slots: [
            DeferredSlot::new(),
            DeferredSlot::new(),
            DeferredSlot::new(),
            DeferredSlot::new(),
        ],
    }
}

// ── Global singleton state ──────────────────────────────────────────────────

static GLOBAL_EPOCH: AtomicU64 = AtomicU64::new(2);
static CLIENTS: Nbsl<ClientData> = Nbsl::new();

static EPOCH_PC: AtomicPtr<PerCpu<EpochBucket>> = AtomicPtr::new(ptr::null_mut());
static INIT_LOCK: SpinMutex<()> = SpinMutex::new(());

#[inline]
fn pc() -> &'static PerCpu<EpochBucket> {
    let p = EPOCH_PC.load(Ordering::Acquire);
    if !p.is_null() {
        return unsafe { &*p };
    }
    init_pc_slow()
}

#[cold]
fn init_pc_slow() -> &'static PerCpu<EpochBucket> {
    let _guard = INIT_LOCK.lock();
    let existing = EPOCH_PC.load(Ordering::Relaxed);
    if !existing.is_null() {
        return unsafe { &*existing };
    }
    let built = Box::into_raw(Box::new(PerCpu::new(bucket_ctor)));
    EPOCH_PC.store(built, Ordering::Release);
    unsafe { &*built }
}

#[inline]
fn next_epoch(e: u64) -> u64 {
    if e == u64::MAX { 2 } else { e + 1 }
}

// ── Thread-local client handle ──────────────────────────────────────────────
//
// A per-thread client record, allocated lazily on first bracket use and
// unlinked from `CLIENTS` when the owning thread's local storage is torn
// down. Under `std` we ride `std::thread_local!`'s own drop-on-exit;
// without it, `crate::ext`'s raw TSS slot plays the same role.
#[cfg(feature = "std")]
mod client_tls {
    use super::*;

    struct ClientGuard(Cell<*mut ClientNode>);

    impl Drop for ClientGuard {
        fn drop(&mut self) {
            let ptr = self.0.get();
            if ptr.is_null() {
                return;
            }
            debug_assert_eq!(unsafe { (*ptr).data.active.load(Ordering::Relaxed) }, 0);
            if !CLIENTS.del(ptr) {
                // Already removed by someone else — shouldn't happen (a
                // client's node is only ever removed by its own thread).
                debug_assert!(false, "client record removed by another thread");
            }
            unsafe { drop(Box::from_raw(ptr)) };
        }
    }

    std::thread_local! {
        static CLIENT: ClientGuard = ClientGuard(Cell::new(ptr::null_mut()));
    }

    pub(super) fn get() -> *mut ClientNode {
        CLIENT.with(|guard| {
            let cached = guard.0.get();
            if !cached.is_null() {
                return cached;
            }
            let node = ClientNode::new_boxed(ClientData::new());
            let raw = Box::into_raw(node);
            let mut owned = unsafe { Box::from_raw(raw) };
            loop {
                let top = CLIENTS.top();
                match CLIENTS.push(top, owned) {
                    Ok(()) => break,
                    Err(returned) => owned = returned,
                }
            }
            guard.0.set(raw);
            raw
        })
    }
}

#[cfg(not(feature = "std"))]
mod client_tls {
    use super::*;

    static KEY: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());
    static KEY_INIT: SpinMutex<()> = SpinMutex::new(());

    unsafe extern "C" fn dtor(ptr: *mut core::ffi::c_void) {
        let node = ptr as *mut ClientNode;
        if node.is_null() {
            return;
        }
        let _ = CLIENTS.del(node);
        unsafe { drop(Box::from_raw(node)) };
    }

    fn key() -> crate::ext::Key {
        let cached = KEY.load(Ordering::Acquire) as usize;
        if cached != 0 {
            return cached;
        }
        let _guard = KEY_INIT.lock();
        let cached = KEY.load(Ordering::Relaxed) as usize;
        if cached != 0 {
            return cached;
        }
        let k = unsafe { crate::ext::create_key(Some(dtor)) };
        KEY.store(k as *mut (), Ordering::Release);
        k
    }

    pub(super) fn get() -> *mut ClientNode {
        let k = key();
        let existing = unsafe { crate::ext::get(k) } as *mut ClientNode;
        if !existing.is_null() {
            return existing;
        }
        let node = ClientNode::new_boxed(ClientData::new());
        let raw = Box::into_raw(node);
        let mut owned = unsafe { Box::from_raw(raw) };
        loop {
            let top = CLIENTS.top();
            match CLIENTS.push(top, owned) {
                Ok(()) => break,
                Err(returned) => owned = returned,
            }
        }
        unsafe { crate::ext::set(k, raw as *mut core::ffi::c_void) };
        raw
    }
}

#[inline]
fn client() -> *mut ClientNode {
    client_tls::get()
}

// ── Cookie / Busy ────────────────────────────────────────────────────────────

/// Opaque bracket token. Packs (epoch, nested) as the source design does,
/// leaving the top bits free so it fits a native signed int's worth of
/// range if ever surfaced across an FFI boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cookie(u64);

/// Returned by [`revalidate`] when the epoch has advanced past the
/// cookie's epoch: cached pointers must be treated as invalid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Busy;

fn make_cookie(epoch: u64, nested: bool) -> Cookie {
    Cookie(((epoch & 0x3fff_ffff) << 1) | (nested as u64))
}

impl Cookie {
    fn epoch_bits(self) -> u64 {
        self.0 >> 1
    }

    fn nested(self) -> bool {
        self.0 & 1 != 0
    }
}

// ── Public API ───────────────────────────────────────────────────────────────

/// Open (or re-enter, if already inside) a bracket on the current thread.
/// Pointers obtained from reclamation-managed structures are valid for the
/// lifetime of the bracket.
pub fn bracket_enter() -> Cookie {
    let c = client();
    let data = unsafe { &(*c).data };
    let nested = data.active.fetch_add(1, Ordering::Acquire) > 0;
    if !nested {
        // Re-read-and-store loop: guarantees the announced epoch is
        // either `E` or the very next value, self-consistently.
        data.epoch.store(GLOBAL_EPOCH.load(Ordering::Acquire), Ordering::Release);
    }
    make_cookie(data.epoch.load(Ordering::Relaxed), nested)
}

/// Close a bracket. When the outermost level closes, paces a quiescence
/// check and possibly advances the epoch.
pub fn bracket_leave(cookie: Cookie) {
    let c = client();
    let data = unsafe { &(*c).data };
    let old_active = data.active.load(Ordering::Relaxed);
    debug_assert!(old_active > 0, "bracket_leave without matching bracket_enter");

    if old_active == 1 {
        let prev = data.count_since_tick.get().wrapping_add(1);
        data.count_since_tick.set(prev);
        let deep = prev & TICK_PACE_MASK == 0;

        let epoch = GLOBAL_EPOCH.load(Ordering::Acquire);
        debug_assert!(epoch == data.epoch.load(Ordering::Relaxed) || epoch == next_epoch(data.epoch.load(Ordering::Relaxed)));

        let slot_idx = (epoch & 3) as usize;
        let local_count = pc().my().slots[slot_idx].count.load(Ordering::Relaxed);
        let should_check = local_count > 0 || (deep && sum_counts(slot_idx) > 0);
        if should_check {
            maybe_tick(epoch, c);
        }
    }

    let old_active = data.active.fetch_sub(1, Ordering::Release);
    debug_assert!(old_active > 0 && (old_active > 1 || !cookie.nested()));
}

/// `true` iff the current thread holds an open bracket.
pub fn inside() -> bool {
    let c = client();
    unsafe { (*c).data.active.load(Ordering::Relaxed) > 0 }
}

fn sum_counts(slot_idx: usize) -> u32 {
    pc().xor_walk().map(|b| b.slots[slot_idx].count.load(Ordering::Relaxed)).sum()
}

fn maybe_tick(epoch: u64, self_client: *mut ClientNode) {
    debug_assert!(inside());
    let mut cur = CLIENTS.first();
    while let Some(n) = cur {
        if n != self_client {
            let data = unsafe { &(*n).data };
            if data.active.load(Ordering::Acquire) > 0 && data.epoch.load(Ordering::Acquire) < epoch {
                return; // not quiet yet; slew tolerated.
            }
        }
        cur = CLIENTS.next_after(n);
    }
    tick(epoch);
    unsafe { (*self_client).data.count_since_tick.set(0) };
}

fn tick(old_epoch: u64) {
    let new_epoch = next_epoch(old_epoch);
    let _ = GLOBAL_EPOCH.compare_exchange(
        old_epoch,
        new_epoch,
        Ordering::Release,
        Ordering::Relaxed,
    );
    #[cfg(feature = "logging")]
    debug!("epoch tick {old_epoch} -> {new_epoch}");

    let gone = ((old_epoch.wrapping_sub(2)) & 3) as usize;
    for bucket in pc().xor_walk() {
        let slot = &bucket.slots[gone];
        let dead = slot.list.swap(ptr::null_mut(), Ordering::Acquire);

        // Reverse so invocation order matches deposit order.
        let mut head: *mut DeferredCall = ptr::null_mut();
        let mut cur = dead;
        while !cur.is_null() {
            let next = unsafe { (*cur).next.load(Ordering::Relaxed) };
            unsafe { (*cur).next.store(head, Ordering::Relaxed) };
            head = cur;
            cur = next;
        }

        let mut down: u32 = 0;
        let mut cur = head;
        while !cur.is_null() {
            let next = unsafe { (*cur).next.load(Ordering::Relaxed) };
            let call = unsafe { (*(*cur).call.get()).take() };
            if let Some(f) = call {
                f();
            }
            unsafe { drop(Box::from_raw(cur)) };
            cur = next;
            down += 1;
        }
        slot.count.fetch_sub(down, Ordering::Release);
    }
}

/// Queue `f` to run once every thread that held a bracket at or before the
/// current epoch has released it. Allocation failure here is fatal —
/// deferred reclamation is a correctness primitive, not best-effort.
pub fn deposit(f: impl FnOnce() + Send + 'static) {
    let epoch = GLOBAL_EPOCH.load(Ordering::Relaxed);
    let slot_idx = (epoch & 3) as usize;
    let bucket = pc().my();
    let slot = &bucket.slots[slot_idx];

    let call = Box::into_raw(Box::new(DeferredCall {
        next: AtomicPtr::new(ptr::null_mut()),
        call: core::cell::UnsafeCell::new(Some(Box::new(f))),
    }));
    slot.count.fetch_add(1, Ordering::Relaxed);

    let mut head = slot.list.load(Ordering::Acquire);
    loop {
        unsafe { (*call).next.store(head, Ordering::Relaxed) };
        match slot.list.compare_exchange_weak(head, call, Ordering::Release, Ordering::Acquire) {
            Ok(_) => break,
            Err(actual) => head = actual,
        }
    }
}

/// Sugar for `deposit(move || drop(Box::from_raw(ptr)))`.
///
/// # Safety
/// `ptr` must have come from `Box::into_raw` and must not be accessed by
/// anyone after this call outside of a bracket that predates the
/// deposit's epoch.
pub unsafe fn free_deferred<T: Send + 'static>(ptr: *mut T) {
    struct SendPtr<T>(*mut T);
    unsafe impl<T> Send for SendPtr<T> {}
    let p = SendPtr(ptr);
    deposit(move || unsafe { drop(Box::from_raw(p.0)) });
}

/// Re-open a bracket at the epoch recorded in `cookie`, iff the epoch
/// hasn't moved on. On success, returns a fresh cookie; on failure,
/// returns [`Busy`] — the caller must treat cached pointers as invalid
/// and call [`bracket_enter`] again.
pub fn revalidate(cookie: Cookie) -> Result<Cookie, Busy> {
    let epoch = GLOBAL_EPOCH.load(Ordering::Relaxed);
    if cookie.epoch_bits() != (epoch & 0x3fff_ffff) {
        return Err(Busy);
    }
    let c = client();
    let data = unsafe { &(*c).data };
    let nested = data.active.fetch_add(1, Ordering::Release) > 0;
    data.epoch.store(epoch, Ordering::Release);
    if GLOBAL_EPOCH.load(Ordering::Relaxed) == epoch || nested {
        Ok(make_cookie(epoch, nested))
    } else {
        // A tick happened in between; ours didn't take.
        data.active.fetch_sub(1, Ordering::Relaxed);
        Err(Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::AtomicUsize;

    #[test]
    fn basic_bracket() {
        assert!(!inside());
        let ck = bracket_enter();
        assert!(inside());
        bracket_leave(ck);
    }

    #[test]
    fn nested_bracket_closes_on_outermost() {
        let ck1 = bracket_enter();
        let ck2 = bracket_enter();
        assert!(inside());
        bracket_leave(ck2);
        assert!(inside());
        bracket_leave(ck1);
    }

    #[test]
    fn deferred_fires_after_release() {
        let flag = Arc::new(AtomicUsize::new(0));
        let ck_a = bracket_enter();
        {
            let flag = Arc::clone(&flag);
            deposit(move || {
                flag.store(1, Ordering::SeqCst);
            });
        }
        assert_eq!(flag.load(Ordering::SeqCst), 0);
        bracket_leave(ck_a);

        // Force enough ticks for the deferred call's epoch to quiesce.
        for _ in 0..4 {
            let ck = bracket_enter();
            bracket_leave(ck);
        }
        assert_eq!(flag.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn next_epoch_wraps_to_two() {
        assert_eq!(next_epoch(u64::MAX), 2);
        assert_eq!(next_epoch(41), 42);
    }
}
