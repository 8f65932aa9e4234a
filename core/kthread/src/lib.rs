// SPDX-License-Identifier: Apache-2.0

//! Kernel thread scheduling for a uniprocessor teaching kernel.
//!
//! This crate owns the set of kernel threads, moves them between run
//! states, and picks the next thread to execute. Two policies are
//! provided, selected once at boot:
//!
//! - **Strict priority** (default): 64 priority levels, the ready queue is
//!   kept sorted by effective priority, and blocking on a [`Lock`] donates
//!   the waiter's priority along the chain of lock holders.
//! - **MLFQ** (`-o mlfqs`): priorities are derived continuously from
//!   `recent_cpu`, `nice` and the system `load_avg`, approximating the
//!   4.4BSD scheduler; manual priorities are ignored.
//!
//! All scheduler state lives behind a single spinlock that is only taken
//! with interrupts disabled; on one CPU that is the entire concurrency
//! story. A thread gives up the CPU only inside `schedule()`, reached from
//! [`block`], [`yield_now`], [`exit`], or the timer tick's yield-on-return
//! path.
//!
//! # Boot protocol
//!
//! ```no_run
//! use kthread::SchedConfig;
//!
//! // With interrupts still disabled:
//! kthread::init(SchedConfig::default());
//! // Creates the idle thread and enables interrupts:
//! kthread::start();
//! let tid = kthread::spawn("worker", kthread::PRI_DEFAULT, || {
//!     // runs under the scheduler's control
//! }).unwrap();
//! ```

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
extern crate log;

extern crate alloc;

mod api;
mod config;
mod list;
mod mlfqs;
mod priority;
mod run_queue;
mod sync;
mod thread;
mod timers;

#[cfg(test)]
mod tests;

pub use api::{
    block, current, exit, foreach, init, load_avg_x100, log_stats, nice, priority,
    recent_cpu_x100, set_nice, set_priority, spawn, start, stats, unblock, yield_now,
};
pub use config::{
    SchedConfig, NICE_MAX, NICE_MIN, PRI_DEFAULT, PRI_MAX, PRI_MIN, TIME_SLICE,
};
pub use run_queue::Stats;
pub use sync::{Lock, LockGuard, Semaphore};
pub use thread::{Thread, ThreadStatus, Tid};
pub use timers::sleep_ticks;

#[cfg(feature = "userprog")]
pub use run_queue::ProcessIf;
