//! Architecture abstraction layer.
//!
//! Mirrors the reference workspace's own `arch.rs`: a `cfg_if!` switch
//! between the real Cortex-M0+ backend and a host-testable fake, so that
//! `kern`'s scheduling logic can be exercised by `#[cfg(test)]` unit
//! tests without real hardware or the ability to run the embedded
//! target.

use abi::Timestamp;

/// Everything the scheduler core needs from the platform: time, sleep,
/// core identity, SysTick control, the initial worker stack frame, the
/// context-switch stub itself, and IRQ masking.
pub trait Arch {
    /// Absolute time in microseconds since boot.
    fn now() -> Timestamp;

    /// Idle-sleep for `micros` microseconds. Only called with IRQs
    /// enabled, at the bottom of a dispatcher cycle.
    fn sleep_us(micros: u32);

    /// Which physical core (0 or 1) is executing this call.
    fn core_id() -> usize;

    /// Arms SysTick for one time slice: reload = `slice_us`, current =
    /// 0, timer and interrupt enabled. `slice_us == 0` disables
    /// preemption instead (cooperative-only).
    fn arm_systick(slice_us: u32);

    /// Disables SysTick and clears any pending exception bit.
    fn disarm_systick();

    /// Initializes a fresh worker's stack per the 17-word exception
    /// frame layout (SPEC_FULL.md §4.6) so that first resume enters
    /// `entry` and a return from `entry` lands in `on_return`. Returns
    /// the saved stack pointer.
    fn init_stack_frame(
        stack: &mut [u32],
        entry: extern "C" fn(u32),
        arg: u32,
        on_return: extern "C" fn(),
    ) -> usize;

    /// The context switch itself: suspends the calling (dispatcher)
    /// context, resumes the worker whose saved SP is `sp`, and returns
    /// only once that worker yields or is preempted, handing back its
    /// new saved SP.
    fn switch_context(sp: usize) -> usize;

    /// The worker-side half of a context switch: traps back into the
    /// Dispatcher (`SVC 0` on real hardware) and returns only once this
    /// worker is resumed on a later cycle. Every blocking call in
    /// `supervisor` ends with this after staging its `BlockReason`.
    fn yield_now();

    /// One-time bootstrap that gets the calling core into handler mode
    /// via the dummy-stack SVC trick (SPEC_FULL.md §4.5), so that every
    /// subsequent dispatcher iteration already runs in handler mode.
    fn enter_handler_mode();

    /// Starts core 1 executing `entry` (which never returns). Called
    /// once from core 0 during `Supervisor::start` when
    /// `DISPATCHER_MULTICORE` is set.
    fn launch_core1(entry: fn() -> !);

    /// Runs `f` with interrupts disabled on the calling core,
    /// restoring the previous mask on return. The portable analog of
    /// `save_and_disable_interrupts`/`restore_interrupts`.
    fn with_irqs_disabled<R>(f: impl FnOnce() -> R) -> R;
}

cfg_if::cfg_if! {
    if #[cfg(test)] {
        pub mod fake;
        pub use fake::Fake as Target;
    } else {
        pub mod arm_m;
        pub use arm_m::ArmM as Target;
    }
}
