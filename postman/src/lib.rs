//! The public API application workers link against. Every function here
//! resolves the calling worker's own identity first and then delegates
//! straight to `kern::supervisor` — there is no logic of its own, by
//! design (SPEC_FULL.md §4.8): this crate exists only so application
//! code never has to depend on `kern`'s internal worker/queue/registry
//! types directly.
#![no_std]

pub use abi::{PropertyValue, Result};
pub use kern::pool::MessageRef;

/// Registers a new endpoint owned by the calling worker and starts
/// `handler(arg)` running on it. `false` if `uri` is already taken or
/// the worker pool is exhausted.
pub fn open(uri: &str, handler: extern "C" fn(u32), arg: u32) -> bool {
    kern::supervisor::open(uri, handler, arg)
}

/// Marks the calling worker done. Never returns; the scheduler reaps it
/// on its next pass.
pub fn close() -> ! {
    kern::supervisor::close_current()
}

/// Voluntarily gives up the rest of this time slice.
pub fn yield_now() {
    kern::supervisor::yield_now()
}

/// Sleeps for `ms` milliseconds. `ms == 0` returns immediately.
pub fn sleep(ms: u32) {
    kern::supervisor::sleep(ms)
}

/// Blocks until the calling worker's own endpoint has an outstanding
/// signal, then returns and resets the count (0 on timeout). `0` timeout
/// means wait forever.
pub fn wait(timeout_ms: u32) -> u8 {
    kern::supervisor::wait(timeout_ms)
}

/// Blocks until a signal can be delivered to `target_uri`. Refuses to
/// notify the caller's own endpoint.
pub fn notify(target_uri: &str, timeout_ms: u32) -> bool {
    kern::supervisor::notify(target_uri, timeout_ms)
}

/// Publishes `message` to the calling worker's own endpoint. Never
/// blocks; replaces whatever was previously published.
pub fn publish(message: MessageRef) {
    kern::supervisor::publish(message)
}

/// Non-blocking: `true` iff `target_uri` has published a message with
/// `id > since`.
pub fn peek(target_uri: &str, since: u32) -> bool {
    kern::supervisor::peek(target_uri, since)
}

/// Blocks until `target_uri` has published a message with `id > since`,
/// then returns it. Refuses to fetch from the caller's own endpoint.
pub fn fetch(target_uri: &str, since: u32, timeout_ms: u32) -> Option<MessageRef> {
    kern::supervisor::fetch(target_uri, since, timeout_ms)
}

/// Allocates a fresh message from the pool, stamped with the calling
/// worker's own endpoint as origin. `None` if the pool is exhausted.
pub fn compose() -> Option<MessageRef> {
    kern::supervisor::compose()
}

/// Blocks until `message` can be delivered into `target_uri`'s inbox
/// slot. Refuses to post to the caller's own endpoint.
pub fn post(target_uri: &str, message: MessageRef, timeout_ms: u32) -> bool {
    kern::supervisor::post(target_uri, message, timeout_ms)
}

/// Blocks until the calling worker's own inbox slot is non-empty, then
/// takes and returns the message.
pub fn read(timeout_ms: u32) -> Option<MessageRef> {
    kern::supervisor::read(timeout_ms)
}

/// Starts the kernel: opens the GC worker and `app_uri`'s handler,
/// launches the second core if configured, then runs this core's
/// scheduler loop forever. Call once, from `main` on core 0.
pub fn start(app_uri: &str, app_handler: extern "C" fn(u32)) -> ! {
    kern::supervisor::start(app_uri, app_handler)
}
