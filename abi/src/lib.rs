//! Shared types between the kernel and application-facing code.
//!
//! Nothing in this crate depends on `kern`; it exists so that application
//! tasks can name worker/endpoint handles, results, and configuration
//! constants without linking the scheduler itself.

#![no_std]

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Outcome of a kernel operation. Surfaced directly by blocking calls;
/// higher layers (the `postman` façade) collapse most of these down to
/// `bool`/`Option` at the API boundary per the error handling design.
///
/// `Continue` never escapes a blocking predicate; it is internal plumbing
/// between `Worker::block` and the stored `BlockReason`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Result {
    Success,
    Failed,
    Continue,
    EndpointDuplicate,
    EndpointNotAvailable,
    EndpointBlocked,
    WorkerNotAvailable,
    WorkerBound,
    WorkerNotBound,
    Timeout,
}

impl Result {
    pub fn is_success(self) -> bool {
        matches!(self, Result::Success)
    }
}

bitflags! {
    /// Worker lifecycle bitmask. Bits combine: a worker can be
    /// BLOCKED | BLOCKED_TIMEOUT | SLEEPING at once. ZOMBIE is terminal.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct WorkerState: u16 {
        const READY           = 0x00;
        const RUNNING         = 0x01;
        const SLEEPING        = 0x02;
        const ZOMBIE          = 0x04;
        const BLOCKED         = 0x08;
        const BLOCKED_TIMEOUT = 0x10;
        const SUSPENDED       = 0x20;
    }
}

/// Core id naming which dispatcher currently owns a worker's binding
/// permit, or that nobody does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CoreId {
    Core0 = 0,
    Core1 = 1,
    Unbound = 2,
}

impl CoreId {
    pub fn from_index(index: usize) -> Self {
        match index {
            0 => CoreId::Core0,
            1 => CoreId::Core1,
            _ => CoreId::Unbound,
        }
    }
}

/// Stable handle into the worker pool. Indices are reused once a worker
/// is reaped and returned to `free`; `generation` distinguishes a stale
/// handle from a live one the way the design notes recommend for the weak
/// endpoint handles below.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct WorkerHandle {
    pub index: u16,
    pub generation: u16,
}

impl WorkerHandle {
    pub const NONE: WorkerHandle = WorkerHandle { index: u16::MAX, generation: 0 };

    pub fn is_none(&self) -> bool {
        self.index == u16::MAX
    }
}

/// Weak handle into the endpoint registry: an index plus generation, the
/// `(index, generation)` realization of a weak ref the design notes call
/// for in place of the source's `std::weak_ptr<Endpoint>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct EndpointHandle {
    pub index: u16,
    pub generation: u16,
}

impl EndpointHandle {
    /// The sentinel "empty" weak ref returned by `create` on a duplicate
    /// URI, and by `Endpoint::Empty` in the source.
    pub const EMPTY: EndpointHandle = EndpointHandle { index: u16::MAX, generation: 0 };

    pub fn is_empty(&self) -> bool {
        self.index == u16::MAX
    }
}

/// Absolute timestamp in microseconds since boot. A `0` value means "no
/// timeout" wherever it appears as a worker's `timeout` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const NONE: Timestamp = Timestamp(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for Timestamp {
    fn from(t: u64) -> Self {
        Timestamp(t)
    }
}

impl From<Timestamp> for u64 {
    fn from(t: Timestamp) -> Self {
        t.0
    }
}

/// Typed property-bag value. Closed union in place of the source's
/// runtime type-id tagged `PropertyDescriptor<T>`; see SPEC_FULL.md's
/// design notes on the property bag.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    U32(u32),
    I32(i32),
    Bool(bool),
    Str(heapless::String<{ config::PROPERTY_VALUE_STR_SIZE }>),
}

pub mod config {
    //! Compile-time configuration. A plain `const` module rather than a
    //! build.rs-generated `kconfig.rs`: there is no per-application task
    //! descriptor to generate from, only fixed pool sizes (see
    //! SPEC_FULL.md §2.1).

    /// Number of workers in the fixed pool.
    pub const WORKER_POOL_SIZE: usize = 20;

    /// Number of concurrently pooled messages.
    pub const MESSAGE_BANK_SIZE: usize = 50;

    /// Size of a worker stack, in 32-bit words. Must be even (exception
    /// frame alignment).
    pub const WORKER_STACK_SIZE: usize = 1024;

    /// SysTick reload value in microseconds. Zero disables preemption.
    pub const WORKER_TIME_SLICE: u32 = 1000;

    /// Cap on a dispatcher's idle sleep, in microseconds. Zero disables
    /// idling entirely.
    pub const DISPATCHER_MAX_IDLE_TIME: u32 = 700;

    /// If true, a worker blocked on a signal wait forces the dispatcher
    /// to skip idling this cycle rather than sleep up to the max.
    pub const DISPATCHER_NO_IDLE_FOR_SIGNALS: bool = true;

    /// Whether the second core is launched and scheduled.
    pub const DISPATCHER_MULTICORE: bool = true;

    /// Fixed capacity of the URI -> Endpoint registry slab. Supplemental:
    /// the source's `std::map` has no static bound; a no-alloc slab needs one.
    pub const ENDPOINT_TABLE_SIZE: usize = 32;

    /// Max length of a stored endpoint URI.
    pub const ENDPOINT_URI_SIZE: usize = 64;

    /// Max number of properties on a single message.
    pub const PROPERTY_BAG_SIZE: usize = 8;

    /// Max length of a property name.
    pub const PROPERTY_NAME_SIZE: usize = 24;

    /// Max length of a `PropertyValue::Str`.
    pub const PROPERTY_VALUE_STR_SIZE: usize = 32;

    /// `RETURN_THREAD_PSP`: EXC_RETURN value meaning "return to thread
    /// mode, restore from PSP, use the extended (non-FPU) frame".
    pub const RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

    /// Maximum signal count an endpoint's signal counter saturates at.
    pub const MAX_SIGNALS: u8 = 255;
}
