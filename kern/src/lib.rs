//! The privileged scheduler core.
//!
//! This crate is never linked by application tasks directly; they go
//! through `postman`. Its pieces, leaves first: [`queue`]'s intrusive
//! cycle-tag queue, [`pool`]'s message slab, [`endpoint`]'s registry,
//! [`worker`]'s state machine, [`dispatcher`]'s per-core scheduler loop,
//! and [`supervisor`]'s process-wide lifecycle glue.
//!
//! `#[cfg(test)]` builds pull in `std` so that `arch::fake` and the
//! ordinary host test harness are available; real target builds stay
//! `no_std`.
#![cfg_attr(not(test), no_std)]

/// Kernel-internal invariant assertion, in the spirit of the reference
/// workspace's own per-arch `uassert!`: a condition that would indicate a
/// scheduler bug, never a caller error, so it does not go through the
/// fallible `abi::Result` surface (SPEC_FULL.md §7).
#[macro_export]
macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("kernel invariant violated: {}", stringify!($cond));
        }
    };
}

#[macro_export]
macro_rules! uassert_eq {
    ($a:expr, $b:expr) => {
        if $a != $b {
            panic!("kernel invariant violated: {} != {}", stringify!($a), stringify!($b));
        }
    };
}

pub mod arch;
pub mod dispatcher;
pub mod endpoint;
pub mod klog;
pub mod pool;
pub mod queue;
pub mod supervisor;
pub mod worker;

pub use abi::Result;

/// Serializes host unit tests that touch process-wide statics (the
/// `MessagePool`/`Kernel` singletons, the fake clock's core id/`NOW`).
/// `cargo test` runs tests concurrently on separate threads by default;
/// without this, two tests resetting or advancing the same global would
/// race each other. Not needed by tests that only exercise a local
/// instance (`queue`/`endpoint`'s own tests construct their own arena).
#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
