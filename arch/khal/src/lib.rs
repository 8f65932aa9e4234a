// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction for a uniprocessor thread subsystem.
//!
//! The scheduler above this crate needs exactly four things from the
//! machine: interrupt control ([`irq`]), a periodic timer ([`time`]), a
//! context-switch primitive ([`context`]) and page-granular memory for
//! kernel stacks ([`mem`]).
//!
//! On `target_os = "none"` each module delegates to integrator-provided
//! backends registered through [`crate_interface`]. On hosted targets the
//! crate instead provides a deterministic single-CPU simulator: interrupts
//! are a flag, timer interrupts are injected with
//! [`time::advance_ticks`], and the context switch hands a run token
//! between parked host threads so that at most one of them executes at any
//! time. The simulator is what the test suites drive.

#![cfg_attr(target_os = "none", no_std)]

pub mod context;
pub mod irq;
pub mod mem;
pub mod time;

/// Resets the simulated machine to its power-on state: interrupts masked,
/// tick counter zero, latches clear, page counters zero.
///
/// Hosted builds only. Carriers parked by a previous scheduler instance are
/// abandoned, not reclaimed; they hold no simulator state.
#[cfg(not(target_os = "none"))]
pub fn reset() {
    irq::reset_sim();
    time::reset_sim();
    mem::reset_sim();
}
