//! The worker state machine: a fiber with a fixed stack, driven by the
//! self-calls in SPEC_FULL.md §4.4. Every transition between schedulable
//! and non-schedulable states is made under the registry's critical
//! section, matching the locking discipline in §5.
//!
//! The blocking predicate is the closed `BlockReason` sum type the design
//! notes call for, rather than a C function pointer plus an opaque `data`
//! pointer: `Worker` stores the reason, but evaluating it needs the
//! endpoint registry and message pool, which `Worker` does not have a
//! handle to. So `is_blocking` takes the evaluator as a closure, and it is
//! `supervisor`/`dispatcher` that actually interpret a `BlockReason`.

use abi::config::WORKER_STACK_SIZE;
use abi::{CoreId, EndpointHandle, Result, Timestamp, WorkerHandle, WorkerState};

use crate::arch::{Arch, Target};
use crate::pool::MessageRef;
use crate::queue::{Links, QueueNode};

/// What a `BLOCKED` worker is waiting on. Stored directly on the worker
/// rather than behind a function pointer + `void*`, per SPEC_FULL.md §9.
pub enum BlockReason {
    /// `wait()`'s predicate: is a signal outstanding on this worker's
    /// own endpoint.
    HasSignal { endpoint: EndpointHandle },
    /// `notify()`'s predicate: try to take a signal from `target` on
    /// every poll.
    Signal { target: EndpointHandle },
    /// `fetch()`'s predicate: is a message with `id > since` published
    /// at `target`.
    Peek { target: EndpointHandle, since: u32 },
    /// `post()`'s predicate: try to install `message` into `target`'s
    /// inbox slot. Holds the message between polls (`None` only
    /// momentarily, while a single poll attempt is in flight).
    Post { target: EndpointHandle, message: Option<MessageRef> },
    /// `read()`'s predicate: is this worker's own endpoint's inbox
    /// non-empty. The taken message is handed back via the evaluator's
    /// second return value and stashed in [`Worker::delivered`].
    Read { endpoint: EndpointHandle },
}

/// A kernel-scheduled fiber: fixed stack, saved SP, state bitmask,
/// blocking predicate, timeout, and binding permit.
///
/// `stack` is boxed into the struct itself (not behind a pointer) so the
/// whole pool lives in one static array, 8-byte aligned per the exception
/// frame layout in SPEC_FULL.md §4.6.
#[repr(align(8))]
pub struct Worker {
    stack: [u32; WORKER_STACK_SIZE],
    sp: usize,
    /// The endpoint this worker is the handler for (`self.endpoint` in
    /// the spec's own terms), or `EMPTY` for an unassigned pool slot.
    pub endpoint: EndpointHandle,
    pub state: WorkerState,
    /// Absolute microsecond timestamp; `Timestamp::NONE` means "no
    /// timeout".
    pub timeout: Timestamp,
    block_reason: Option<BlockReason>,
    last_result: Result,
    /// Message delivered by a successful `read()`, stashed here because
    /// `is_blocking`'s evaluator only returns a `Result`, not a payload.
    delivered: Option<MessageRef>,
    /// The binding permit: which core may currently touch this worker,
    /// or `Unbound`. Mutated only under the registry's critical section,
    /// since this kernel's queues (and this field) are genuinely shared
    /// across two handler-mode cores — unlike `armv6m-atomic-hack`'s
    /// single-core-ISR assumption, which does not hold here.
    bound: CoreId,
    generation: u16,
    links: Links,
}

impl Worker {
    pub const fn empty() -> Self {
        Worker {
            stack: [0; WORKER_STACK_SIZE],
            sp: 0,
            endpoint: EndpointHandle::EMPTY,
            state: WorkerState::READY,
            timeout: Timestamp::NONE,
            block_reason: None,
            last_result: Result::Failed,
            delivered: None,
            bound: CoreId::Unbound,
            generation: 0,
            links: Links::new(),
        }
    }

    pub fn handle(&self, index: u16) -> WorkerHandle {
        WorkerHandle { index, generation: self.generation }
    }

    pub fn matches(&self, handle: WorkerHandle) -> bool {
        self.generation == handle.generation
    }

    /// Initializes the worker to run `handler(arg)` under `endpoint`,
    /// bumping the generation so stale handles from a prior incarnation
    /// are rejected. Sets state = READY.
    pub fn assign(
        &mut self,
        endpoint: EndpointHandle,
        handler: extern "C" fn(u32),
        arg: u32,
    ) {
        self.generation = self.generation.wrapping_add(1);
        self.endpoint = endpoint;
        self.state = WorkerState::READY;
        self.timeout = Timestamp::NONE;
        self.block_reason = None;
        self.delivered = None;
        self.bound = CoreId::Unbound;
        self.sp = Target::init_stack_frame(&mut self.stack, handler, arg, oncomplete);
    }

    /// Non-blocking attempt to acquire the binding permit for `core`.
    /// Returns `false` if another core already holds it. Self-contained:
    /// the check-and-set is its own critical section rather than relying
    /// on a caller-held one, since this is the one piece of state two
    /// Dispatchers genuinely race on.
    pub fn bind(&mut self, core: CoreId) -> bool {
        critical_section::with(|_| {
            if self.bound == CoreId::Unbound {
                self.bound = core;
                true
            } else {
                self.bound == core
            }
        })
    }

    /// Releases the binding permit, but only if `core` is the one
    /// holding it; otherwise a no-op, per §7's "misuse guarded silently".
    pub fn release(&mut self, core: CoreId) {
        critical_section::with(|_| {
            if self.bound == core {
                self.bound = CoreId::Unbound;
            }
        });
    }

    pub fn is_bound_to(&self, core: CoreId) -> bool {
        self.bound == core
    }

    pub fn is_zombie(&self) -> bool {
        self.state.contains(WorkerState::ZOMBIE)
    }

    pub fn is_suspended(&self) -> bool {
        self.state.contains(WorkerState::SUSPENDED)
    }

    /// Runs this worker until it yields or is preempted. Caller (the
    /// Dispatcher) must already hold this worker's binding permit.
    pub fn run(&mut self) {
        crate::uassert!(self.bound != CoreId::Unbound);
        self.state.insert(WorkerState::RUNNING);
        self.sp = Target::switch_context(self.sp);
        self.state.remove(WorkerState::RUNNING);
    }

    /// Sets an absolute timeout `ms` milliseconds from now and marks the
    /// worker SLEEPING (and BLOCKED_TIMEOUT, when called underneath
    /// `block`). `ms == 0` clears any existing timeout instead of
    /// sleeping, matching `sleep(0)` returning immediately.
    pub fn sleep(&mut self, ms: u32, blocking: bool) {
        if ms == 0 {
            self.timeout = Timestamp::NONE;
            return;
        }
        critical_section::with(|_| {
            self.timeout = Timestamp(Target::now().0 + ms as u64 * 1000);
            self.state.insert(WorkerState::SLEEPING);
            if blocking {
                self.state.insert(WorkerState::BLOCKED_TIMEOUT);
            }
        });
    }

    /// Evaluates `reason` once; if it already resolved (anything but
    /// `CONTINUE`), stores the result and returns immediately without
    /// blocking. Otherwise stashes `reason`, marks BLOCKED (+ SLEEPING
    /// via `sleep` if `timeout_ms > 0`), and yields.
    ///
    /// `yield_now` is the caller's responsibility here in the Rust
    /// realization: on real hardware this function is called, then the
    /// worker fiber issues `SVC 0` and is later resumed by the
    /// Dispatcher once `is_blocking` reports it unblocked, at which
    /// point `take_result` reads back what got stashed.
    pub fn begin_block(
        &mut self,
        reason: BlockReason,
        timeout_ms: u32,
        first: Result,
    ) -> Option<Result> {
        if first != Result::Continue {
            self.last_result = first;
            return Some(first);
        }
        critical_section::with(|_| {
            self.block_reason = Some(reason);
            self.state.insert(WorkerState::BLOCKED);
        });
        if timeout_ms > 0 {
            self.sleep(timeout_ms, true);
        }
        None
    }

    pub fn take_result(&mut self) -> Result {
        self.last_result
    }

    pub fn take_delivered(&mut self) -> Option<MessageRef> {
        self.delivered.take()
    }

    pub fn block_reason_mut(&mut self) -> Option<&mut BlockReason> {
        self.block_reason.as_mut()
    }

    pub fn suspend(&mut self) {
        self.state.insert(WorkerState::SUSPENDED);
    }

    pub fn clear_suspend(&mut self) {
        self.state.remove(WorkerState::SUSPENDED);
    }

    pub fn halt(&mut self) {
        self.state.insert(WorkerState::ZOMBIE);
    }

    /// `true` iff still sleeping. Clears SLEEPING and the timeout once
    /// the deadline has passed.
    pub fn is_sleeping(&mut self) -> bool {
        if !self.state.contains(WorkerState::SLEEPING) {
            return false;
        }
        if Target::now() < self.timeout {
            true
        } else {
            self.state.remove(WorkerState::SLEEPING);
            self.timeout = Timestamp::NONE;
            false
        }
    }

    /// Re-evaluates the stored `BlockReason` via `eval`, folding the
    /// BLOCKED_TIMEOUT escalation described in §4.4. Returns `true` iff
    /// still blocked.
    ///
    /// `eval`'s second return value is a message the predicate consumed
    /// and wants handed to this worker (`read()`'s only use); `is_blocking`
    /// stashes it via [`Worker::stash_delivered`] rather than threading it
    /// back through the caller, since `Dispatcher::run_cycle` doesn't
    /// otherwise care about delivered payloads.
    pub fn is_blocking(
        &mut self,
        mut eval: impl FnMut(&mut BlockReason) -> (Result, Option<MessageRef>),
    ) -> bool {
        if !self.state.contains(WorkerState::BLOCKED) {
            return false;
        }
        let (result, delivered) = {
            use unwrap_lite::UnwrapLite;
            eval(self.block_reason.as_mut().unwrap_lite())
        };
        if let Some(message) = delivered {
            self.delivered = Some(message);
        }
        if result != Result::Continue {
            self.state.remove(WorkerState::BLOCKED);
            self.block_reason = None;
            self.last_result = result;
        } else if self.state.contains(WorkerState::BLOCKED_TIMEOUT) && !self.is_sleeping() {
            self.last_result = Result::Timeout;
            self.state.remove(WorkerState::BLOCKED | WorkerState::BLOCKED_TIMEOUT);
            self.block_reason = None;
        }
        self.state.contains(WorkerState::BLOCKED)
    }

    pub fn stash_delivered(&mut self, message: MessageRef) {
        self.delivered = Some(message);
    }
}

impl QueueNode for Worker {
    fn links(&self) -> Links {
        self.links
    }
    fn set_links(&mut self, links: Links) {
        self.links = links;
    }
}

/// Trampoline a worker's saved stack frame returns into when its handler
/// function returns normally, rather than calling `close()` itself. Falls
/// into `halt()`'s "set ZOMBIE, yield forever" per §4.4 — the Dispatcher's
/// post-run check is what actually reaps it via `Supervisor::halt`.
extern "C" fn oncomplete() {
    crate::supervisor::close_current();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::fake;

    extern "C" fn noop_handler(_arg: u32) {}

    #[test]
    fn sleep_then_is_sleeping_tracks_fake_clock() {
        // The fake clock is a process-wide static shared with other test
        // modules; serialize so a concurrently-running test can't bump it
        // mid-assertion.
        let _g = crate::test_lock();
        fake::advance(0);
        let mut w = Worker::empty();
        w.assign(EndpointHandle::EMPTY, noop_handler, 0);
        w.sleep(5, false);
        assert!(w.is_sleeping());
        fake::advance(4_999);
        assert!(w.is_sleeping());
        fake::advance(2);
        assert!(!w.is_sleeping());
        assert!(!w.state.contains(WorkerState::SLEEPING));
    }

    #[test]
    fn begin_block_returns_immediately_when_predicate_already_resolved() {
        let mut w = Worker::empty();
        w.assign(EndpointHandle::EMPTY, noop_handler, 0);
        let out = w.begin_block(BlockReason::Signal { target: EndpointHandle::EMPTY }, 0, Result::Success);
        assert_eq!(out, Some(Result::Success));
        assert!(!w.state.contains(WorkerState::BLOCKED));
    }

    #[test]
    fn begin_block_stores_reason_and_sets_blocked_on_continue() {
        let mut w = Worker::empty();
        w.assign(EndpointHandle::EMPTY, noop_handler, 0);
        let out = w.begin_block(BlockReason::Signal { target: EndpointHandle::EMPTY }, 0, Result::Continue);
        assert_eq!(out, None);
        assert!(w.state.contains(WorkerState::BLOCKED));
        assert!(!w.state.contains(WorkerState::SLEEPING));
    }

    #[test]
    fn is_blocking_clears_on_success() {
        let mut w = Worker::empty();
        w.assign(EndpointHandle::EMPTY, noop_handler, 0);
        w.begin_block(BlockReason::Signal { target: EndpointHandle::EMPTY }, 0, Result::Continue);
        let still = w.is_blocking(|_| (Result::Success, None));
        assert!(!still);
        assert_eq!(w.take_result(), Result::Success);
    }

    #[test]
    fn is_blocking_forces_timeout_after_deadline() {
        let _g = crate::test_lock();
        fake::advance(0);
        let mut w = Worker::empty();
        w.assign(EndpointHandle::EMPTY, noop_handler, 0);
        w.begin_block(BlockReason::Signal { target: EndpointHandle::EMPTY }, 10, Result::Continue);
        assert!(w.is_blocking(|_| (Result::Continue, None)));
        fake::advance(10_001);
        let still = w.is_blocking(|_| (Result::Continue, None));
        assert!(!still);
        assert_eq!(w.take_result(), Result::Timeout);
    }

    #[test]
    fn bind_is_exclusive_across_cores() {
        let mut w = Worker::empty();
        assert!(w.bind(CoreId::Core0));
        assert!(!w.bind(CoreId::Core1));
        assert!(w.bind(CoreId::Core0)); // re-binding same core is fine
        w.release(CoreId::Core1); // wrong core: no-op
        assert!(w.is_bound_to(CoreId::Core0));
        w.release(CoreId::Core0);
        assert!(w.bind(CoreId::Core1));
    }
}
