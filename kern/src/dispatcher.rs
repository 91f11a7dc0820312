//! The per-core scheduler loop (SPEC_FULL.md §4.5).
//!
//! One `Dispatcher` runs forever in handler mode on its owning core,
//! walking the ready queue with the cycle-tag iterator and context
//! switching into whichever worker it lands on. Tracing follows the
//! reference workspace's own idiom: a `ringbuf!` of cycle events plus a
//! `counters!` tally of dispatch outcomes, in place of the source's ad
//! hoc `printf` trace lines.

use abi::config::{DISPATCHER_MAX_IDLE_TIME, DISPATCHER_NO_IDLE_FOR_SIGNALS, WORKER_TIME_SLICE};
use abi::{CoreId, WorkerHandle};
use counters::Count;

use crate::arch::{Arch, Target};
use crate::queue::IntrusiveQueue;
use crate::worker::{BlockReason, Worker};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Count)]
pub enum Event {
    #[count(skip)]
    None,
    CycleStart,
    Dispatched,
    SkippedBound,
    SkippedSleeping,
    SkippedBlocking,
    SkippedSuspended,
    Reaped,
    IdleSlept,
}

ringbuf::ringbuf!(Event, 64, Event::None);
counters::counters!(Event);

/// Per-core scheduler state: which worker (if any) is currently running
/// on this core, and which core this is.
pub struct Dispatcher {
    core: CoreId,
    current: Option<WorkerHandle>,
}

impl Dispatcher {
    pub const fn new(core: CoreId) -> Self {
        Dispatcher { core, current: None }
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    pub fn current(&self) -> Option<WorkerHandle> {
        self.current
    }

    /// Test-only: pins which worker `current()` reports, standing in
    /// for a real dispatch when exercising `supervisor`'s API functions
    /// without a live scheduling cycle.
    #[cfg(test)]
    pub(crate) fn test_set_current(&mut self, handle: WorkerHandle) {
        self.current = if handle.is_none() { None } else { Some(handle) };
    }

    /// Runs one full cycle of the ready queue (§4.1's cycle-tag pass),
    /// dispatching every worker this core can bind that is neither
    /// sleeping, blocking, suspended, nor already claimed by the other
    /// core this cycle. `on_zombie` is invoked for every worker found
    /// ZOMBIE right after it ran, so the caller can hand it to
    /// `Supervisor`'s reaper.
    ///
    /// Returns the idle time (µs) the caller should sleep for afterward;
    /// unlike the rest of a cycle's bookkeeping this is deliberately left
    /// to the caller rather than done here, so the sleep happens with no
    /// lock held across both cores.
    ///
    /// Split out from `begin`'s infinite loop so host tests can drive
    /// individual cycles deterministically against `arch::fake`.
    pub fn run_cycle(
        &mut self,
        ready: &mut IntrusiveQueue,
        workers: &mut [Worker],
        mut eval_reason: impl FnMut(&mut BlockReason) -> (abi::Result, Option<crate::pool::MessageRef>),
        mut on_zombie: impl FnMut(u16),
    ) -> u32 {
        Target::disarm_systick();
        ringbuf::ringbuf_entry!(Event::CycleStart);

        let mut idle_time = DISPATCHER_MAX_IDLE_TIME;
        let mut force_no_idle = false;

        while let Some(index) = ready.next(workers) {
            let worker = &mut workers[index as usize];

            if !worker.bind(self.core) {
                ringbuf::ringbuf_entry!(Event::SkippedBound);
                counters::count!(Event::SkippedBound);
                continue;
            }

            if worker.is_suspended() {
                ringbuf::ringbuf_entry!(Event::SkippedSuspended);
                counters::count!(Event::SkippedSuspended);
                worker.release(self.core);
                continue;
            }

            let sleeping = worker.is_sleeping();
            let blocking = !sleeping && worker.is_blocking(&mut eval_reason);
            if DISPATCHER_NO_IDLE_FOR_SIGNALS && blocking {
                force_no_idle = true;
            }

            if !sleeping && !blocking {
                self.current = Some(worker.handle(index));
                ringbuf::ringbuf_entry!(Event::Dispatched);
                counters::count!(Event::Dispatched);
                self.dispatch(worker);
                self.current = None;
                if worker.is_zombie() {
                    ringbuf::ringbuf_entry!(Event::Reaped);
                    counters::count!(Event::Reaped);
                    on_zombie(index);
                }
            } else if sleeping {
                ringbuf::ringbuf_entry!(Event::SkippedSleeping);
                counters::count!(Event::SkippedSleeping);
            } else {
                ringbuf::ringbuf_entry!(Event::SkippedBlocking);
                counters::count!(Event::SkippedBlocking);
            }

            if !worker.timeout.is_none() {
                let now: u64 = Target::now().into();
                let deadline: u64 = worker.timeout.into();
                let remaining = deadline.saturating_sub(now);
                idle_time = idle_time.min(remaining.min(u32::MAX as u64) as u32);
            }

            worker.release(self.core);
        }

        if force_no_idle {
            idle_time = 0;
        }

        if idle_time > 0 {
            ringbuf::ringbuf_entry!(Event::IdleSlept);
            counters::count!(Event::IdleSlept);
        }

        idle_time
    }

    /// Arms SysTick for one time slice, context-switches into `worker`,
    /// and disarms on return. A zero time slice leaves SysTick disarmed,
    /// i.e. cooperative-only scheduling.
    fn dispatch(&mut self, worker: &mut Worker) {
        if WORKER_TIME_SLICE > 0 {
            Target::arm_systick(WORKER_TIME_SLICE);
        }
        worker.run();
        Target::disarm_systick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::fake;
    use crate::queue::QueueNode;
    use abi::{EndpointHandle, Result, WorkerState};

    extern "C" fn noop_handler(_arg: u32) {}

    fn ready_worker() -> Worker {
        let mut w = Worker::empty();
        w.assign(EndpointHandle::EMPTY, noop_handler, 0);
        w
    }

    #[test]
    fn a_ready_worker_is_dispatched_and_unbound_afterward() {
        let _g = crate::test_lock();
        fake::set_core_id(0);
        let mut workers = vec![ready_worker(), ready_worker(), ready_worker()];
        let mut ready = IntrusiveQueue::new();
        ready.push(&mut workers, 0);
        ready.push(&mut workers, 1);
        ready.push(&mut workers, 2);
        ready.next(&mut workers); // throwaway first pass (queue.rs)

        let mut d = Dispatcher::new(CoreId::Core0);
        d.run_cycle(&mut ready, &mut workers, |_| (Result::Continue, None), |_| {});

        for w in &workers {
            assert!(w.is_bound_to(CoreId::Unbound));
            assert!(!w.state.contains(WorkerState::RUNNING));
        }
    }

    #[test]
    fn sleeping_worker_is_skipped_and_shrinks_idle_time() {
        let _g = crate::test_lock();
        fake::advance(0);
        let mut workers = vec![ready_worker()];
        workers[0].sleep(1, false); // 1ms = 1000us, below the idle cap
        let mut ready = IntrusiveQueue::new();
        ready.push(&mut workers, 0);
        ready.next(&mut workers);

        let mut d = Dispatcher::new(CoreId::Core0);
        let idle = d.run_cycle(&mut ready, &mut workers, |_| (Result::Continue, None), |_| {});
        assert!(idle <= 1000);
    }

    #[test]
    fn blocking_worker_forces_no_idle_when_configured() {
        let mut workers = vec![ready_worker()];
        workers[0].begin_block(
            crate::worker::BlockReason::Signal { target: EndpointHandle::EMPTY },
            0,
            Result::Continue,
        );
        let mut ready = IntrusiveQueue::new();
        ready.push(&mut workers, 0);
        ready.next(&mut workers);

        let mut d = Dispatcher::new(CoreId::Core0);
        let idle = d.run_cycle(&mut ready, &mut workers, |_| (Result::Continue, None), |_| {});
        assert_eq!(idle, 0);
    }

    #[test]
    fn a_worker_bound_by_the_other_core_is_skipped() {
        let mut workers = vec![ready_worker()];
        workers[0].bind(CoreId::Core1);
        let mut ready = IntrusiveQueue::new();
        ready.push(&mut workers, 0);
        ready.next(&mut workers);

        let mut d = Dispatcher::new(CoreId::Core0);
        d.run_cycle(&mut ready, &mut workers, |_| (Result::Continue, None), |_| {});
        assert!(workers[0].is_bound_to(CoreId::Core1));
    }

    #[test]
    fn zombie_worker_triggers_the_reap_callback() {
        let mut workers = vec![ready_worker()];
        workers[0].halt();
        let mut ready = IntrusiveQueue::new();
        ready.push(&mut workers, 0);
        ready.next(&mut workers);

        let mut reaped = vec![];
        let mut d = Dispatcher::new(CoreId::Core0);
        d.run_cycle(&mut ready, &mut workers, |_| (Result::Continue, None), |i| reaped.push(i));
        assert_eq!(reaped, vec![0]);
    }
}
