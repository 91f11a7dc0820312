//! Architecture support for ARMv6-M (Cortex-M0+), targeting the RP2040.
//!
//! Unlike the reference workspace's `arm_m.rs`, there is no per-task
//! `Task`/`ArchState` struct here, no MPU, and no privilege drop: every
//! worker shares the kernel's own privilege level, and the only things a
//! context switch must preserve are the 17 words described in
//! SPEC_FULL.md §4.6. The shape of the trick is the same one documented
//! there, though: one shared `SVCall` handler disambiguated by inspecting
//! `LR`'s `EXC_RETURN` bits, exactly as the reference workspace's own ARMv6-M
//! branch does, generalized here to a genuine two-way switch (see below)
//! because this design's Dispatcher is itself a resumable context, not a
//! stateless re-entrant ISR.
//!
//! **Why this diverges from the reference workspace's PendSV scheme.** There,
//! the "kernel" has no persistent register state across a context switch —
//! `PendSV` always re-derives which task runs next and never "returns" to a
//! calling frame. Here, `Dispatcher::run_cycle` is an ordinary Rust loop
//! running forever in handler mode, and `switch_context` is an ordinary
//! function it calls; its own r4-r11 must survive the round trip into a
//! worker and back. `svc 0` issued *from handler mode* is what tells the
//! shared `SVCall` handler "this is the dispatcher asking to resume a
//! worker" (checked via `LR == 0xFFFFFFF9`), as opposed to "a worker yielded
//! or was preempted" (`LR == 0xFFFFFFFD`, shared with `SysTick`). Letting
//! `asm!`'s clobber list do the dispatcher-side save (the Rust compiler
//! spills whatever it needs around the `svc 0`) means the handler itself
//! only ever has to manage the *worker's* r4-r11, never the dispatcher's.
//!
//! **Per-core state.** RP2040's SysTick is banked per core but the NVIC
//! vector table is shared, so `CORE_SP` is a two-element array indexed by
//! the SIO `CPUID` register rather than the reference workspace's single
//! `CURRENT_TASK_PTR` — see SPEC_FULL.md §4.6's documented extension.

use core::arch::{asm, global_asm};

use abi::config::{RETURN_THREAD_PSP, WORKER_STACK_SIZE};
use abi::Timestamp;

use super::Arch;

/// `EXC_RETURN` meaning "return to Handler mode, use MSP" — the value `LR`
/// holds on entry to `SVCall` when the dispatcher itself issued the `svc 0`
/// (as opposed to a worker doing so, or `SysTick` firing on one).
const RETURN_HANDLER_MSP: u32 = 0xFFFF_FFF9;

/// Per-core "where is the currently-suspended worker's saved stack
/// pointer" slot, filled in by the shared `SVCall`/`SysTick` body and read
/// back by `switch_context` after its `svc 0` returns. Indexed by SIO
/// `CPUID` directly from assembly, so this must stay unmangled and plain.
#[no_mangle]
static mut CORE_SP: [usize; 2] = [0, 0];

/// Words reserved for `enter_handler_mode`'s synthetic dummy stack (§4.5:
/// "construct a 48-word dummy stack aligned to 8 bytes").
const DUMMY_STACK_WORDS: usize = 48;

#[repr(align(8))]
struct DummyStack([u32; DUMMY_STACK_WORDS]);
static mut BOOTSTRAP_STACK: DummyStack = DummyStack([0; DUMMY_STACK_WORDS]);

/// Stack core 1 runs its bring-up sequence on, before it ever touches a
/// worker stack. Sized the same as an ordinary worker stack; core 1 never
/// returns from `entry` (an `fn() -> !`), so this is never reused.
#[repr(align(8))]
struct Core1Stack([u32; WORKER_STACK_SIZE]);
static mut CORE1_STACK: Core1Stack = Core1Stack([0; WORKER_STACK_SIZE]);

pub struct ArmM;

impl ArmM {
    fn sio_cpuid() -> u32 {
        // SAFETY: CPUID is a read-only identity register with no side
        // effects; reading it racily from both cores is the whole point.
        unsafe { (*rp2040_pac::SIO::ptr()).cpuid.read().bits() }
    }

    /// Free-running microsecond counter, independent of SysTick (which is
    /// only armed for the duration of a worker's time slice — see
    /// `Dispatcher::dispatch`). RP2040's `TIMER` peripheral runs off a
    /// fixed 1 MHz reference regardless of core clock, so it alone can
    /// serve as `now()`.
    fn timer_raw() -> u64 {
        // SAFETY: TIMERAWH/TIMERAWL are read-only free-running counters;
        // reading the high word twice around the low word is the
        // standard RP2040 idiom for a tear-free 64-bit read.
        unsafe {
            let timer = &*rp2040_pac::TIMER::ptr();
            loop {
                let hi = timer.timerawh.read().bits();
                let lo = timer.timerawl.read().bits();
                let hi2 = timer.timerawh.read().bits();
                if hi == hi2 {
                    return ((hi as u64) << 32) | lo as u64;
                }
            }
        }
    }
}

impl Arch for ArmM {
    fn now() -> Timestamp {
        Timestamp(Self::timer_raw())
    }

    fn sleep_us(micros: u32) {
        let deadline = Self::timer_raw() + micros as u64;
        while Self::timer_raw() < deadline {
            cortex_m::asm::nop();
        }
    }

    fn core_id() -> usize {
        Self::sio_cpuid() as usize
    }

    fn arm_systick(slice_us: u32) {
        // SAFETY: SYST is banked per core; each core only ever touches its
        // own copy, matching the per-core `CORE_SP` slot above.
        unsafe {
            let syst = &*cortex_m::peripheral::SYST::ptr();
            syst.rvr.write(slice_us.saturating_sub(1));
            syst.cvr.write(0);
            cortex_m::asm::dsb();
            cortex_m::asm::isb();
            syst.csr.modify(|v| v | 0b111);
        }
    }

    fn disarm_systick() {
        unsafe {
            let syst = &*cortex_m::peripheral::SYST::ptr();
            syst.csr.modify(|v| v & !0b1);
            // Clear any SysTick exception left pending by the last slice.
            let scb = &*cortex_m::peripheral::SCB::ptr();
            scb.icsr.write(1 << 25); // PENDSTCLR
        }
    }

    fn init_stack_frame(
        stack: &mut [u32],
        entry: extern "C" fn(u32),
        arg: u32,
        on_return: extern "C" fn(),
    ) -> usize {
        crate::uassert!(stack.len() >= 17);
        let base = stack.len() - 17;
        let frame = &mut stack[base..];
        frame[0] = 0; // r8
        frame[1] = 0; // r9
        frame[2] = 0; // r10
        frame[3] = 0; // r11
        frame[4] = 0; // r4
        frame[5] = 0; // r5
        frame[6] = 0; // r6
        frame[7] = 0; // r7
        frame[8] = RETURN_THREAD_PSP; // software-saved LR: resume in thread mode via PSP
        frame[9] = arg; // r0: the handler's argument
        frame[10] = 0; // r1
        frame[11] = 0; // r2
        frame[12] = 0; // r3
        frame[13] = 0; // r12
        frame[14] = on_return as usize as u32 | 1; // hardware LR: oncomplete trampoline (thumb bit)
        frame[15] = entry as usize as u32 | 1; // PC: handler entry point (thumb bit)
        frame[16] = 0x0100_0000; // xPSR: Thumb bit set, nothing else
        frame.as_ptr() as usize
    }

    /// Suspends the calling (dispatcher) context and resumes the worker at
    /// `sp`, returning only once that worker traps back in (by yielding or
    /// by SysTick preemption). The dispatcher's own r4-r11 survive the
    /// round trip because they're listed as clobbered below: the compiler
    /// spills anything it still needs around the `svc 0`, so `SVCall`'s
    /// shared body never has to know about the dispatcher's own registers.
    fn switch_context(sp: usize) -> usize {
        let new_sp: usize;
        unsafe {
            asm!(
                "svc 0",
                inout("r0") sp => new_sp,
                out("r1") _, out("r2") _, out("r3") _, out("r12") _,
                out("r4") _, out("r5") _, out("r6") _, out("r7") _,
                out("r8") _, out("r9") _, out("r10") _, out("r11") _,
                out("lr") _,
            );
        }
        new_sp
    }

    /// The worker-side half: `svc 0` issued from thread mode, trapping
    /// into the same shared `SVCall` body as a preemption would, just
    /// voluntarily.
    fn yield_now() {
        unsafe { asm!("svc 0", out("r0") _, options(nostack)) };
    }

    /// Gets the calling core into handler mode once, via the same
    /// dummy-stack `svc` trick the reference workspace uses to start its
    /// first task, except here it's the *Dispatcher itself*, not a task,
    /// that ends up resident in handler mode permanently afterward.
    fn enter_handler_mode() {
        unsafe {
            // SVCall, PendSV and SysTick all get the lowest configurable
            // priority so none of them can preempt anything else running
            // in handler mode; SVCall numerically outranks SysTick so it
            // wins when both are pending simultaneously (SPEC_FULL.md
            // §4.5). ARMv6-M only implements the top two bits of each
            // 8-bit priority field, so `0b11 << 30`/`0b11 << 22` is the
            // lowest encodable priority, matching the reference
            // workspace's own ARMv6-M fault-priority setup.
            let scb = &*cortex_m::peripheral::SCB::PTR;
            scb.shpr[0].modify(|x| x | 0b11 << 30); // SHPR2: SVCall
            scb.shpr[1].modify(|x| x | 0b11 << 22 | 0b11 << 30); // SHPR3: PendSV, SysTick

            let top = core::ptr::addr_of_mut!(BOOTSTRAP_STACK.0)
                .cast::<u32>()
                .add(DUMMY_STACK_WORDS);
            asm!(
                "msr PSP, {stack}",
                "svc 0xff",
                stack = in(reg) top,
                options(nostack, noreturn),
            );
        }
    }

    /// Boots core 1 via the documented SIO FIFO handshake (the same
    /// sequence `rp2040-hal`'s `multicore` module performs): push the
    /// magic resync/vector-table/stack/entry sequence, retrying from the
    /// top if core 1 doesn't echo each value back.
    fn launch_core1(entry: fn() -> !) {
        unsafe extern "C" fn core1_trampoline(entry: usize) -> ! {
            let entry: fn() -> ! = core::mem::transmute(entry);
            entry()
        }

        let stack_top = unsafe { core::ptr::addr_of_mut!(CORE1_STACK.0).cast::<u32>().add(WORKER_STACK_SIZE) } as u32;
        let vector_table = unsafe { (*cortex_m::peripheral::SCB::ptr()).vtor.read() };
        let wrapper = core1_trampoline as unsafe extern "C" fn(usize) -> ! as usize as u32;
        let entry_arg = entry as usize as u32;

        let sio = unsafe { &*rp2040_pac::SIO::ptr() };
        let fifo_write = |value: u32| {
            while sio.fifo_st.read().rdy().bit_is_clear() {}
            sio.fifo_wr.write(|w| unsafe { w.bits(value) });
            cortex_m::asm::sev();
        };
        let fifo_read = || -> u32 {
            while sio.fifo_st.read().vld().bit_is_clear() {
                cortex_m::asm::wfe();
            }
            sio.fifo_rd.read().bits()
        };

        let sequence = [0, 0, vector_table, stack_top, wrapper, entry_arg];
        let mut i = 0;
        while i < sequence.len() {
            let cmd = sequence[i];
            if cmd == 0 {
                // Drain any stale response before the resync marker.
                while sio.fifo_st.read().vld().bit_is_set() {
                    let _ = sio.fifo_rd.read().bits();
                }
                cortex_m::asm::sev();
            }
            fifo_write(cmd);
            let response = fifo_read();
            if response != cmd {
                i = 0;
                continue;
            }
            i += 1;
        }
    }

    fn with_irqs_disabled<R>(f: impl FnOnce() -> R) -> R {
        let primask = cortex_m::register::primask::read();
        cortex_m::interrupt::disable();
        let result = f();
        if primask.is_active() {
            unsafe { cortex_m::interrupt::enable() };
        }
        result
    }
}

global_asm! {"
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
    SVCall:
        mov r0, lr
        ldr r1, ={return_handler_msp}
        cmp r0, r1
        beq 2f
        b 1f

    .section .text.SysTick
    .globl SysTick
    .type SysTick,function
    SysTick:
    1:
        @ A worker was interrupted (thread mode, PSP) -- either it asked
        @ to yield (svc 0) or SysTick fired mid-slice. Push the software
        @ half of the frame onto the worker's own stack, in the same
        @ order `init_stack_frame` lays it out: R8-R11, then R4-R7, then
        @ a marker LR meaning \"resume via PSP\".
        mrs r0, PSP
        subs r0, r0, #36
        mov r1, r0
        mov r2, r8
        mov r3, r9
        stm r1!, {{r2-r3}}
        mov r2, r10
        mov r3, r11
        stm r1!, {{r2-r3}}
        stm r1!, {{r4-r7}}
        ldr r2, ={return_thread_psp}
        str r2, [r1]
        @ r0 now points at the base of the saved frame (offset 0); stash
        @ it in this core's CORE_SP slot, selected by SIO CPUID (fixed
        @ address 0xd0000000, RP2040 datasheet SS2.3.1.7).
        ldr r1, =CORE_SP
        ldr r2, =0xd0000000
        ldr r2, [r2]
        lsls r2, r2, #2
        adds r1, r1, r2
        str r0, [r1]
        @ Resume the dispatcher in handler mode on the main stack.
        ldr r0, ={return_handler_msp}
        mov lr, r0
        bx lr

    2:  @ The dispatcher itself asked (from handler mode) to resume the
        @ worker whose saved frame starts at the address in r0.
        adds r1, r0, #0
        ldm r1!, {{r2-r5}}
        mov r8, r2
        mov r9, r3
        mov r10, r4
        mov r11, r5
        ldm r1!, {{r4-r7}}
        adds r1, r1, #4
        msr PSP, r1
        ldr r0, ={return_thread_psp}
        mov lr, r0
        bx lr
    ",
    return_handler_msp = const RETURN_HANDLER_MSP,
    return_thread_psp = const RETURN_THREAD_PSP,
}

#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn DefaultHandler() {
    panic!("unhandled exception");
}

#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn HardFault() -> ! {
    panic!("hard fault");
}
