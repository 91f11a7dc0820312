//! Demo application, grounded on the source's `main.cpp` scenario and on
//! the reference workspace's minimal `demo-pi-pico` task (SPEC_FULL.md
//! §2.1): a handful of endpoint handlers exercising the scheduler and the
//! inter-endpoint communication primitives, matching §8's literal
//! end-to-end scenarios.
//!
//! Out of scope per spec.md §1 ("the demo application in `main`"): this
//! file is an external collaborator, not part of the specified core.
#![no_std]
#![no_main]

use cortex_m_rt::entry;
use panic_halt as _;
use postman::PropertyValue;

// Ensure rp2040-pac's vector table gets linked in even though we never
// name it directly; `SVCall`/`SysTick`/`DefaultHandler`/`HardFault` are
// supplied as `#[no_mangle]` symbols by `kern::arch::arm_m` and override
// the weak defaults cortex-m-rt installs.
use rp2040_pac as _;
// Pulls in the `critical-section-impl` feature's registered `Impl` (real
// PRIMASK-based masking), which every critical section in `kern` needs
// on the real target (SPEC_FULL.md §5).
use rp2040_hal as _;

#[link_section = ".boot2"]
#[used]
pub static BOOT2_FIRMWARE: [u8; 256] = rp2040_boot2::CONFIG;

/// `/demo/a` -- S1 sleep accuracy: sleeps a second at a time, forever.
extern "C" fn sleeper(_arg: u32) {
    loop {
        postman::sleep(1000);
    }
}

/// `/demo/b` -- S2 notify/wait: waits for an outstanding signal and folds
/// the returned count into a running total.
extern "C" fn waiter(_arg: u32) {
    let mut total: u32 = 0;
    loop {
        total = total.wrapping_add(postman::wait(0) as u32);
    }
}

/// `/demo/d` -- S2 notify/wait: notifies `/demo/b` roughly every quarter
/// second. The source's "every 4096 primes" cadence is a CPU-bound proxy
/// for "occasionally"; a sleep loop is the same idea without requiring a
/// prime sieve in a kernel demo.
extern "C" fn notifier(_arg: u32) {
    loop {
        postman::notify("/demo/b", 0);
        postman::sleep(250);
    }
}

/// `/demo/f` -- S3 publish/fetch: publishes a message carrying a `data`
/// and a `time` property every few seconds, strictly advancing ids.
extern "C" fn publisher(_arg: u32) {
    let mut tick: u32 = 0;
    loop {
        if let Some(msg) = postman::compose() {
            msg.set_property("data", PropertyValue::U32(tick));
            msg.set_property("time", PropertyValue::U32(tick));
            postman::publish(msg);
        }
        tick = tick.wrapping_add(1);
        postman::sleep(3000);
    }
}

/// `/demo/e` -- S3 publish/fetch: fetches from `/demo/f`, advancing
/// `last_id` across calls so no two fetched messages ever repeat an id.
extern "C" fn fetcher(_arg: u32) {
    let mut last_id: u32 = 0;
    loop {
        if let Some(msg) = postman::fetch("/demo/f", last_id, 0) {
            last_id = msg.id();
        }
    }
}

/// The application's own top-level endpoint (opened by `postman::start`
/// before the scheduler ever runs a cycle): spawns the rest of the demo's
/// endpoints as children, then idles.
extern "C" fn app_main(_arg: u32) {
    postman::open("/demo/a", sleeper, 0);
    postman::open("/demo/b", waiter, 0);
    postman::open("/demo/d", notifier, 0);
    postman::open("/demo/f", publisher, 0);
    postman::open("/demo/e", fetcher, 0);
    loop {
        postman::sleep(1000);
    }
}

#[entry]
fn main() -> ! {
    postman::start("/demo/app", app_main)
}
