// SPDX-License-Identifier: Apache-2.0

//! Time-related operations.
//!
//! The thread subsystem sees time as a monotonically increasing tick
//! counter at a compile-time frequency. Kernel targets feed the counter
//! from the platform timer; hosted builds inject ticks deterministically
//! with [`advance_ticks`], which runs the full interrupt protocol (mask,
//! handler, unmask, need-resched check) for each tick.

/// Timer interrupt frequency, in ticks per second.
pub const TIMER_FREQ: u64 = 100;

#[cfg(target_os = "none")]
mod backend {
    /// Timer backend for kernel targets.
    #[crate_interface::def_interface]
    pub trait TimeIf {
        /// Ticks elapsed since boot.
        fn now_ticks() -> u64;
    }

    pub fn now_ticks() -> u64 {
        crate_interface::call_interface!(TimeIf::now_ticks)
    }
}

#[cfg(not(target_os = "none"))]
mod backend {
    use core::sync::atomic::{AtomicU64, Ordering};

    use crate::irq;

    static TICKS: AtomicU64 = AtomicU64::new(0);

    pub fn now_ticks() -> u64 {
        TICKS.load(Ordering::SeqCst)
    }

    /// One simulated timer interrupt: bump the counter, run the handler in
    /// interrupt context, then honor the need-resched latch on the return
    /// path.
    pub fn one_tick() {
        assert!(
            irq::is_enabled(),
            "timer interrupt arrived with interrupts masked"
        );
        TICKS.fetch_add(1, Ordering::SeqCst);
        irq::enter_handler();
        irq::dispatch_tick();
        irq::leave_handler();
        if irq::take_need_resched() {
            irq::dispatch_resched();
        }
    }

    pub(crate) fn reset() {
        TICKS.store(0, Ordering::SeqCst);
    }
}

/// Ticks elapsed since boot.
#[inline]
pub fn now_ticks() -> u64 {
    backend::now_ticks()
}

/// Injects `n` timer interrupts into the simulated machine.
///
/// Each tick follows the hardware protocol: interrupts must be enabled
/// when it arrives, they are masked while the registered tick hook runs,
/// and the need-resched latch is consulted on the return path, which may
/// reschedule before this function moves on to the next tick.
#[cfg(not(target_os = "none"))]
pub fn advance_ticks(n: u64) {
    for _ in 0..n {
        backend::one_tick();
    }
}

#[cfg(not(target_os = "none"))]
pub(crate) fn reset_sim() {
    backend::reset();
}
