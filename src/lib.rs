//! Kestrel — the scheduling and synchronization core of a real-time kernel.
//!
//! This crate decides, on every event of interest (tick, interrupt, blocking
//! call, priority change, processor hotplug), which ready thread runs on
//! which processor. It owns the thread-queue blocking/wakeup protocol, the
//! per-processor watchdog service, two scheduling algorithms behind a common
//! operation table, and the cross-processor job rendezvous used to run code
//! synchronously on a set of processors.
//!
//! The core is a library: it has no wire protocol, file format or CLI of its
//! own. An API layer translates its status codes into whatever error model
//! it exposes, and an architecture layer performs the actual context switch
//! when the core reports that one is due. All state lives in fixed-size
//! arenas inside [`Kernel`], which is built by a `const fn` so the embedder
//! can place the whole core in a `static`. No memory is allocated after
//! construction.
#![cfg_attr(not(test), no_std)]

pub mod fatal;
pub mod kernel;
pub mod percpu;
pub mod priority;
pub mod sched;
pub mod smp;
pub mod status;
pub mod thread;
pub mod time;
pub mod wait;
pub mod watchdog;

pub use kernel::Kernel;
pub use status::Status;
