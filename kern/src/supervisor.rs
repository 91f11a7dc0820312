//! The Supervisor: owns the worker pool, the free/ready/zombies queues,
//! the endpoint registry, and both cores' Dispatchers (SPEC_FULL.md
//! §4.7). This is also where the public postman-facing API (§4.8) is
//! actually implemented — `postman` is a thin re-export over the
//! functions below, each of which resolves `self()` (the calling
//! worker) before doing anything else, exactly as the design calls for.
//!
//! Every entry point below funnels through [`with`], the single global
//! critical section shared by every other kernel structure. Nesting
//! `with` inside another locked call (e.g. a blocking predicate calling
//! back into the registry) is intentional and relies on the registered
//! `critical-section::Impl` being reentrant on the same core — see
//! DESIGN.md.

use core::cell::UnsafeCell;

use abi::config::WORKER_POOL_SIZE;
use abi::{EndpointHandle, Result, WorkerHandle};

use crate::arch::{Arch, Target};
use crate::dispatcher::Dispatcher;
use crate::endpoint::EndpointRegistry;
use crate::pool::{MessagePool, MessageRef};
use crate::queue::IntrusiveQueue;
use crate::worker::{BlockReason, Worker};
use unwrap_lite::UnwrapLite;

/// Endpoint the garbage-collector worker is opened on. Signalled every
/// time a worker is reaped into `zombies`.
const GC_URI: &str = "/postman/gc";

struct Kernel {
    workers: [Worker; WORKER_POOL_SIZE],
    free: IntrusiveQueue,
    ready: IntrusiveQueue,
    zombies: IntrusiveQueue,
    registry: EndpointRegistry,
    dispatchers: [Dispatcher; 2],
}

impl Kernel {
    const fn new() -> Self {
        Kernel {
            workers: [const { Worker::empty() }; WORKER_POOL_SIZE],
            free: IntrusiveQueue::new(),
            ready: IntrusiveQueue::new(),
            zombies: IntrusiveQueue::new(),
            registry: EndpointRegistry::new(),
            dispatchers: [Dispatcher::new(abi::CoreId::Core0), Dispatcher::new(abi::CoreId::Core1)],
        }
    }
}

struct KernelCell(UnsafeCell<Kernel>);
// SAFETY: all access goes through `with`, which holds the global
// critical section for the duration of the borrow.
unsafe impl Sync for KernelCell {}

impl KernelCell {
    fn get(&self) -> *mut Kernel {
        self.0.get()
    }
}

static KERNEL: KernelCell = KernelCell(UnsafeCell::new(Kernel::new()));

fn with<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    critical_section::with(|_| {
        // SAFETY: see `KernelCell`.
        let kernel = unsafe { &mut *KERNEL.get() };
        f(kernel)
    })
}

/// Index of the worker currently bound to this core's Dispatcher, or
/// `None` if this core isn't inside a worker's context (e.g. idling
/// between cycles). The only safe way for worker-side code to identify
/// itself, per §4.7 — reading it any other way risks a stale answer if
/// the core migrates which worker it's running between read and use.
fn self_index(k: &Kernel) -> Option<u16> {
    match Target::core_id() {
        0 => k.dispatchers[0].current().map(|h| h.index),
        1 => k.dispatchers[1].current().map(|h| h.index),
        _ => None,
    }
}

/// This worker's own handle, or [`WorkerHandle::NONE`] if called outside
/// a worker's context.
pub fn current() -> WorkerHandle {
    with(|k| match self_index(k) {
        Some(i) => k.workers[i as usize].handle(i),
        None => WorkerHandle::NONE,
    })
}

/// Pops a worker from `free` and assigns it to run `handler(arg)` under
/// `endpoint`, pushing it onto `ready`. Fails (no state changed) if
/// `endpoint` doesn't resolve or the pool is exhausted.
fn exec(k: &mut Kernel, endpoint: EndpointHandle, handler: extern "C" fn(u32), arg: u32) -> Option<WorkerHandle> {
    k.registry.resolve(endpoint)?;
    let index = k.free.pop(&mut k.workers)?;
    k.workers[index as usize].assign(endpoint, handler, arg);
    let handle = k.workers[index as usize].handle(index);
    k.ready.push(&mut k.workers, index);
    Some(handle)
}

/// Initializes every kernel structure, opens the GC and application
/// endpoints, launches the other core if configured, then enters this
/// core's Dispatcher loop forever. Must be called once, from core 0.
pub fn start(app_uri: &str, app_handler: extern "C" fn(u32)) -> ! {
    crate::klog!("supervisor: starting, app_uri={}", app_uri);
    with(|k| {
        for i in 0..WORKER_POOL_SIZE as u16 {
            k.free.push(&mut k.workers, i);
        }
        MessagePool::with(|pool| pool.init());

        let gc = k.registry.create(GC_URI, EndpointHandle::EMPTY);
        exec(k, gc, gc_handler, 0).unwrap_lite();

        let app = k.registry.create(app_uri, EndpointHandle::EMPTY);
        exec(k, app, app_handler, 0).unwrap_lite();
    });

    if abi::config::DISPATCHER_MULTICORE {
        crate::klog!("supervisor: launching core 1");
        Target::launch_core1(begin);
    }
    begin()
}

/// The per-core scheduler loop. Runs forever; never returns.
pub fn begin() -> ! {
    Target::enter_handler_mode();
    crate::klog!("dispatcher: core {} entering handler mode", Target::core_id());
    loop {
        let idle = with(|k| {
            let core = Target::core_id();
            let dispatcher = &mut k.dispatchers[core];
            dispatcher.run_cycle(&mut k.ready, &mut k.workers, eval_block_reason, reap)
        });
        if idle > 0 {
            Target::sleep_us(idle);
        }
    }
}

/// `Worker::is_blocking`'s evaluator, re-entering the global lock fresh
/// for each poll rather than capturing it — this is what lets
/// `Dispatcher::run_cycle` stay generic over `BlockReason` without
/// knowing about the registry.
fn eval_block_reason(reason: &mut BlockReason) -> (Result, Option<MessageRef>) {
    with(|k| match reason {
        BlockReason::HasSignal { endpoint } => match k.registry.resolve(*endpoint) {
            Some(ep) if ep.has_signals() => (Result::Success, None),
            Some(_) => (Result::Continue, None),
            None => (Result::EndpointNotAvailable, None),
        },
        BlockReason::Signal { target } => match k.registry.resolve_mut(*target) {
            Some(ep) if ep.signal() => (Result::Success, None),
            Some(_) => (Result::Continue, None),
            None => (Result::EndpointNotAvailable, None),
        },
        BlockReason::Peek { target, since } => match k.registry.resolve(*target) {
            Some(ep) if ep.peek(*since) => (Result::Success, None),
            Some(_) => (Result::Continue, None),
            None => (Result::EndpointNotAvailable, None),
        },
        BlockReason::Post { target, message } => match k.registry.resolve_mut(*target) {
            Some(ep) => {
                let msg = message.take().unwrap_lite();
                match ep.try_post(msg) {
                    Ok(()) => (Result::Success, None),
                    Err(msg) => {
                        *message = Some(msg);
                        (Result::Continue, None)
                    }
                }
            }
            None => (Result::EndpointNotAvailable, None),
        },
        BlockReason::Read { endpoint } => match k.registry.resolve_mut(*endpoint) {
            Some(ep) => match ep.take_inbox() {
                Some(msg) => (Result::Success, Some(msg)),
                None => (Result::Continue, None),
            },
            None => (Result::EndpointNotAvailable, None),
        },
    })
}

/// Unlinks a just-discovered zombie from `ready`, pushes it onto
/// `zombies`, and wakes the GC worker. Called by `Dispatcher::run_cycle`
/// right after a worker runs and is found ZOMBIE.
fn reap(index: u16) {
    with(|k| {
        k.ready.remove(&mut k.workers, index);
        k.zombies.push(&mut k.workers, index);
        if let Some(gc) = k.registry.get(GC_URI) {
            if let Some(ep) = k.registry.resolve_mut(gc) {
                ep.signal();
            }
        }
    });
}

extern "C" fn gc_handler(_arg: u32) {
    loop {
        wait(0);
        drain_zombies();
    }
}

/// Releases each zombie's endpoint and returns its worker slot to
/// `free`. Endpoint release happens before the slot is freed, not
/// after, so a racing `create` can never observe a URI as available
/// while the worker that used to own it could still be re-dispatched
/// under a stale handle (see DESIGN.md's Open Question resolution).
fn drain_zombies() {
    loop {
        let reaped = with(|k| {
            let index = k.zombies.pop(&mut k.workers)?;
            let endpoint = k.workers[index as usize].endpoint;
            k.registry.release(endpoint);
            k.free.push(&mut k.workers, index);
            Some(())
        });
        if reaped.is_none() {
            break;
        }
    }
}

/// Runs one blocking call end to end: computes the first-attempt result
/// and `BlockReason` under the lock, yields (`SVC 0`) if it didn't
/// resolve immediately, then returns the final `Result` plus whatever
/// the predicate stashed as delivered (only `read` uses the latter).
fn blocking(timeout_ms: u32, attempt: impl FnOnce(&mut Kernel, u16) -> (Result, BlockReason)) -> (Result, Option<MessageRef>) {
    let resolved = with(|k| {
        let i = self_index(k)?;
        let (first, reason) = attempt(k, i);
        let outcome = k.workers[i as usize].begin_block(reason, timeout_ms, first);
        Some((outcome, k.workers[i as usize].take_delivered()))
    });

    let Some((outcome, immediate)) = resolved else {
        return (Result::WorkerNotBound, None);
    };

    match outcome {
        Some(result) => (result, immediate),
        None => {
            Target::yield_now();
            with(|k| match self_index(k) {
                Some(i) => (k.workers[i as usize].take_result(), k.workers[i as usize].take_delivered()),
                None => (Result::Failed, None),
            })
        }
    }
}

/// Registers a new endpoint owned by the calling worker and execs
/// `handler` on it.
pub fn open(uri: &str, handler: extern "C" fn(u32), arg: u32) -> bool {
    with(|k| {
        let owner = self_index(k).map(|i| k.workers[i as usize].endpoint).unwrap_or(EndpointHandle::EMPTY);
        let endpoint = k.registry.create(uri, owner);
        if endpoint.is_empty() {
            return false;
        }
        if exec(k, endpoint, handler, arg).is_some() {
            true
        } else {
            k.registry.release(endpoint);
            false
        }
    })
}

/// Marks the calling worker ZOMBIE and yields forever. `Dispatcher`'s
/// post-run check notices the ZOMBIE state and hands the worker to
/// [`reap`]; nothing here ever actually resumes.
pub fn close_current() -> ! {
    with(|k| {
        if let Some(i) = self_index(k) {
            k.workers[i as usize].halt();
        }
    });
    loop {
        Target::yield_now();
    }
}

pub fn yield_now() {
    Target::yield_now();
}

/// Marks the calling worker SUSPENDED and yields; the Dispatcher skips a
/// SUSPENDED worker on every subsequent cycle until some other worker
/// calls [`resume`] on it. `false` if called outside a worker's context.
pub fn suspend_current() -> bool {
    let ok = with(|k| match self_index(k) {
        Some(i) => {
            k.workers[i as usize].suspend();
            true
        }
        None => false,
    });
    if ok {
        Target::yield_now();
    }
    ok
}

/// Clears SUSPENDED on `target`, blocking until its binding permit can be
/// acquired first (per §4.4: "bind the target (blocking), clear
/// SUSPENDED, release"). `false` if `target` is a stale handle.
pub fn resume(target: WorkerHandle) -> bool {
    let core = abi::CoreId::from_index(Target::core_id());
    loop {
        let bound = with(|k| {
            let w = k.workers.get_mut(target.index as usize)?;
            if !w.matches(target) {
                return None;
            }
            Some(w.bind(core))
        });
        match bound {
            None => return false,
            Some(true) => break,
            Some(false) => Target::yield_now(),
        }
    }
    with(|k| {
        if let Some(w) = k.workers.get_mut(target.index as usize) {
            w.clear_suspend();
            w.release(core);
        }
    });
    true
}

/// `ms == 0` returns immediately without yielding.
pub fn sleep(ms: u32) {
    with(|k| {
        if let Some(i) = self_index(k) {
            k.workers[i as usize].sleep(ms, false);
        }
    });
    if ms > 0 {
        Target::yield_now();
    }
}

/// Blocks until a signal is outstanding on the calling worker's own
/// endpoint, then returns and resets the count. `0` on timeout.
pub fn wait(timeout_ms: u32) -> u8 {
    let (result, _) = blocking(timeout_ms, |k, i| {
        let endpoint = k.workers[i as usize].endpoint;
        let first = match k.registry.resolve(endpoint) {
            Some(ep) if ep.has_signals() => Result::Success,
            Some(_) => Result::Continue,
            None => Result::EndpointNotAvailable,
        };
        (first, BlockReason::HasSignal { endpoint })
    });
    if result != Result::Success {
        return 0;
    }
    with(|k| match self_index(k) {
        Some(i) => {
            let endpoint = k.workers[i as usize].endpoint;
            k.registry.resolve_mut(endpoint).map(|ep| ep.get_signals()).unwrap_or(0)
        }
        None => 0,
    })
}

/// Blocks until a signal can be delivered to `target_uri`. Refuses to
/// notify the caller's own endpoint.
pub fn notify(target_uri: &str, timeout_ms: u32) -> bool {
    let Some(target) = with(|k| k.registry.get(target_uri)) else {
        return false;
    };
    let is_self = with(|k| self_index(k).map(|i| k.workers[i as usize].endpoint) == Some(target));
    if is_self {
        return false;
    }
    let (result, _) = blocking(timeout_ms, |k, _i| {
        let first = match k.registry.resolve_mut(target) {
            Some(ep) if ep.signal() => Result::Success,
            Some(_) => Result::Continue,
            None => Result::EndpointNotAvailable,
        };
        (first, BlockReason::Signal { target })
    });
    result == Result::Success
}

/// Publishes `message` to the calling worker's own endpoint. Never
/// blocks; replaces whatever was previously published.
pub fn publish(message: MessageRef) {
    with(|k| {
        if let Some(i) = self_index(k) {
            let endpoint = k.workers[i as usize].endpoint;
            if let Some(ep) = k.registry.resolve_mut(endpoint) {
                ep.publish(message);
            }
        }
    });
}

/// Non-blocking: `true` iff `target_uri` has published a message with
/// `id > since`.
pub fn peek(target_uri: &str, since: u32) -> bool {
    with(|k| {
        k.registry
            .get(target_uri)
            .and_then(|h| k.registry.resolve(h))
            .map(|ep| ep.peek(since))
            .unwrap_or(false)
    })
}

/// Blocks until `target_uri` has published a message with `id > since`,
/// then returns it. Refuses to fetch from the caller's own endpoint.
pub fn fetch(target_uri: &str, since: u32, timeout_ms: u32) -> Option<MessageRef> {
    let target = with(|k| k.registry.get(target_uri))?;
    let is_self = with(|k| self_index(k).map(|i| k.workers[i as usize].endpoint) == Some(target));
    if is_self {
        return None;
    }
    let (result, _) = blocking(timeout_ms, |k, _i| {
        let first = match k.registry.resolve(target) {
            Some(ep) if ep.peek(since) => Result::Success,
            Some(_) => Result::Continue,
            None => Result::EndpointNotAvailable,
        };
        (first, BlockReason::Peek { target, since })
    });
    if result != Result::Success {
        return None;
    }
    with(|k| k.registry.resolve(target).and_then(|ep| ep.pull()).cloned())
}

/// Allocates a fresh message from the pool, stamped with the calling
/// worker's endpoint as origin.
pub fn compose() -> Option<MessageRef> {
    let endpoint = with(|k| self_index(k).map(|i| k.workers[i as usize].endpoint))?;
    MessagePool::with(|pool| pool.create(endpoint))
}

/// Blocks until `message` can be delivered into `target_uri`'s inbox
/// slot. Refuses to post to the caller's own endpoint.
pub fn post(target_uri: &str, message: MessageRef, timeout_ms: u32) -> bool {
    let Some(target) = with(|k| k.registry.get(target_uri)) else {
        return false;
    };
    let is_self = with(|k| self_index(k).map(|i| k.workers[i as usize].endpoint) == Some(target));
    if is_self {
        return false;
    }
    let mut message = Some(message);
    let (result, _) = blocking(timeout_ms, move |k, _i| match k.registry.resolve_mut(target) {
        Some(ep) => {
            let msg = message.take().unwrap_lite();
            match ep.try_post(msg) {
                Ok(()) => (Result::Success, BlockReason::Post { target, message: None }),
                Err(msg) => (Result::Continue, BlockReason::Post { target, message: Some(msg) }),
            }
        }
        None => (Result::EndpointNotAvailable, BlockReason::Post { target, message: message.take() }),
    });
    result == Result::Success
}

/// Blocks until the calling worker's own inbox slot is non-empty, then
/// takes and returns the message.
pub fn read(timeout_ms: u32) -> Option<MessageRef> {
    let (result, delivered) = blocking(timeout_ms, |k, i| {
        let endpoint = k.workers[i as usize].endpoint;
        let first = match k.registry.resolve_mut(endpoint) {
            Some(ep) => match ep.take_inbox() {
                Some(msg) => {
                    k.workers[i as usize].stash_delivered(msg);
                    Result::Success
                }
                None => Result::Continue,
            },
            None => Result::EndpointNotAvailable,
        };
        (first, BlockReason::Read { endpoint })
    });
    if result == Result::Success {
        delivered
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::fake;

    extern "C" fn noop_handler(_arg: u32) {}

    /// Resets the global `Kernel`/`MessagePool`/fake-clock singletons to a
    /// known-empty state and holds [`crate::test_lock`] for the rest of
    /// the test, since every test here shares those process-wide statics.
    fn reset() -> std::sync::MutexGuard<'static, ()> {
        let guard = crate::test_lock();
        with(|k| {
            *k = Kernel::new();
            for i in 0..WORKER_POOL_SIZE as u16 {
                k.free.push(&mut k.workers, i);
            }
        });
        MessagePool::with(|pool| {
            *pool = crate::pool::MessagePool::new();
            pool.init();
        });
        fake::set_core_id(0);
        guard
    }

    fn spawn(uri: &str) -> WorkerHandle {
        with(|k| {
            let endpoint = k.registry.create(uri, EndpointHandle::EMPTY);
            exec(k, endpoint, noop_handler, 0).unwrap()
        })
    }

    fn enter(handle: WorkerHandle) {
        with(|k| {
            k.dispatchers[0].test_set_current(handle);
        });
    }

    fn leave() {
        with(|k| k.dispatchers[0].test_set_current(WorkerHandle::NONE));
    }

    #[test]
    fn open_creates_endpoint_and_execs_worker() {
        let _g = reset();
        let a = spawn("/owner");
        enter(a);
        assert!(open("/child", noop_handler, 0));
        assert!(!open("/child", noop_handler, 0)); // duplicate
        leave();
    }

    #[test]
    fn notify_wakes_a_waiting_worker_without_blocking_forever() {
        let _g = reset();
        let b = spawn("/b");
        enter(b);
        let first = with(|k| {
            let endpoint = k.workers[self_index(k).unwrap() as usize].endpoint;
            match k.registry.resolve(endpoint) {
                Some(ep) if ep.has_signals() => Result::Success,
                _ => Result::Continue,
            }
        });
        assert_eq!(first, Result::Continue);
        leave();

        let d = spawn("/d");
        enter(d);
        assert!(notify("/b", 0));
        leave();

        enter(b);
        assert_eq!(wait(0), 1);
        leave();
    }

    #[test]
    fn publish_then_peek_is_immediately_visible() {
        let _g = reset();
        let f = spawn("/f");
        enter(f);
        let msg = compose().unwrap();
        publish(msg);
        leave();
        assert!(peek("/f", 0));
        assert!(!peek("/f", u32::MAX));
    }

    #[test]
    fn post_then_read_delivers_the_same_message() {
        let _g = reset();
        let r = spawn("/r");
        let sender = spawn("/sender");
        enter(sender);
        let msg = compose().unwrap();
        let origin = msg.origin();
        assert!(post("/r", msg, 0));
        leave();

        enter(r);
        let delivered = read(0).unwrap();
        assert_eq!(delivered.origin(), origin);
        leave();
    }

    #[test]
    fn notify_refuses_self_and_unknown_targets() {
        let _g = reset();
        let a = spawn("/a");
        enter(a);
        assert!(!notify("/a", 0));
        assert!(!notify("/does-not-exist", 0));
        leave();
    }

    #[test]
    fn close_current_marks_the_worker_zombie() {
        let _g = reset();
        let a = spawn("/a");
        enter(a);
        let index = a.index;
        with(|k| {
            k.workers[index as usize].halt();
        });
        assert!(with(|k| k.workers[index as usize].is_zombie()));
        leave();
    }

    #[test]
    fn suspend_current_sets_suspended_and_resume_clears_it() {
        let _g = reset();
        let a = spawn("/a");
        enter(a);
        assert!(suspend_current());
        assert!(with(|k| k.workers[a.index as usize].is_suspended()));
        leave();

        assert!(resume(a));
        assert!(!with(|k| k.workers[a.index as usize].is_suspended()));
        assert!(with(|k| k.workers[a.index as usize].is_bound_to(abi::CoreId::Unbound)));
    }

    #[test]
    fn resume_rejects_a_stale_handle() {
        let _g = reset();
        let a = spawn("/a");
        let stale = WorkerHandle { index: a.index, generation: a.generation.wrapping_sub(1) };
        assert!(!resume(stale));
    }

    /// S4 zombie reap: `reap` moves a worker off `ready` onto `zombies`
    /// and signals the GC endpoint; `drain_zombies` (the GC worker's own
    /// loop body) then releases its endpoint and returns its slot to
    /// `free` within one pass, with no dependency on a live Dispatcher
    /// cycle.
    #[test]
    fn reap_then_drain_zombies_frees_the_worker_and_its_endpoint() {
        let _g = reset();
        with(|k| {
            k.registry.create(GC_URI, EndpointHandle::EMPTY);
        });
        let a = spawn("/a");
        with(|k| k.workers[a.index as usize].halt());
        reap(a.index);

        assert!(with(|k| k.zombies.length()) == 1);
        assert!(with(|k| k.registry.get("/a")).is_some());

        let gc = with(|k| k.registry.get(GC_URI)).unwrap();
        assert!(with(|k| k.registry.resolve(gc)).unwrap().has_signals());

        drain_zombies();

        assert!(with(|k| k.zombies.length()) == 0);
        assert!(with(|k| k.free.length()) > 0);
        assert!(with(|k| k.registry.get("/a")).is_none());
    }
}
