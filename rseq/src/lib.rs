//! `rseq` — Linux restartable sequences for Rust.
//!
//! Zero-dependency, `no_std` wrapper around the Linux rseq(2) syscall.
//! Exposes the current thread's CPU placement without a `getcpu()` syscall
//! on the fast path — the kernel keeps `cpu_id` up to date across context
//! switches, and userspace just reads it.
//!
//! This crate is the "process-wide detection of the number of CPU
//! siblings" collaborator that a per-CPU sharding scheme consumes but does
//! not itself define: it answers "which CPU is this thread on right now",
//! nothing about hash tables or reclamation.
//!
//! # Features
//!
//! - `nightly` — enables `#[thread_local]` for the self-managed rseq area
//!   and weak-symbol glibc detection. Without this feature, only the raw
//!   ABI types and syscall wrappers are available, and [`current_cpu`]
//!   always returns `None`.
//!
//! # Architecture support
//!
//! Currently x86_64 only.

#![no_std]
#![cfg_attr(feature = "nightly", feature(thread_local, linkage))]

pub mod abi;
pub mod syscall;
pub mod thread;

// Re-export key types at crate root.
pub use abi::{RSEQ_SIG, Rseq, RseqCs};
pub use thread::{RseqLocal, current_cpu, current_rseq, rseq_available};
