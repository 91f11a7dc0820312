//! Host-testable stand-in for the Cortex-M0+ backend.
//!
//! No real stack switching happens here: `switch_context` returns
//! immediately, as if the resumed worker yielded right back. That is
//! enough for unit tests that exercise scheduler bookkeeping (state
//! transitions, queue placement, timeouts) without needing a second
//! real execution context. Time is a manually-advanced counter instead
//! of a wall clock, so timeout-driven tests stay deterministic.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use abi::Timestamp;

use super::Arch;

static NOW: AtomicU64 = AtomicU64::new(0);
static CORE: AtomicUsize = AtomicUsize::new(0);

/// Test-only: advances the fake clock by `micros`.
pub fn advance(micros: u64) {
    NOW.fetch_add(micros, Ordering::SeqCst);
}

/// Test-only: pins which core id [`Fake::core_id`] reports.
pub fn set_core_id(id: usize) {
    CORE.store(id, Ordering::SeqCst);
}

pub struct Fake;

impl Arch for Fake {
    fn now() -> Timestamp {
        Timestamp(NOW.load(Ordering::SeqCst))
    }

    fn sleep_us(micros: u32) {
        advance(micros as u64);
    }

    fn core_id() -> usize {
        CORE.load(Ordering::SeqCst)
    }

    fn arm_systick(_slice_us: u32) {}

    fn disarm_systick() {}

    fn init_stack_frame(
        stack: &mut [u32],
        _entry: extern "C" fn(u32),
        _arg: u32,
        _on_return: extern "C" fn(),
    ) -> usize {
        stack.as_ptr() as usize
    }

    fn switch_context(sp: usize) -> usize {
        sp
    }

    fn yield_now() {}

    fn enter_handler_mode() {}

    fn launch_core1(_entry: fn() -> !) {}

    fn with_irqs_disabled<R>(f: impl FnOnce() -> R) -> R {
        f()
    }
}
