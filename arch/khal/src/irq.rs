// SPDX-License-Identifier: Apache-2.0

//! Interrupt management.
//!
//! A three-level abstraction over the local interrupt line: query the
//! level, save-and-disable, restore. On top of it sit the two latches the
//! scheduler needs: the interrupt-context flag and the need-resched flag
//! consulted by the interrupt return path.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Low-level interrupt backend for kernel targets.
#[cfg(target_os = "none")]
#[crate_interface::def_interface]
pub trait IrqIf {
    /// Save the local interrupt state and disable interrupts. Returns
    /// whether they were enabled.
    fn local_irq_save_and_disable() -> bool;

    /// Restore the local interrupt state saved by
    /// [`local_irq_save_and_disable`](IrqIf::local_irq_save_and_disable).
    fn local_irq_restore(was_enabled: bool);

    /// Whether local interrupts are currently enabled.
    fn local_irq_enabled() -> bool;

    /// Whether the CPU is running an interrupt handler.
    fn in_interrupt() -> bool;

    /// Idle the CPU until the next interrupt, with interrupts enabled
    /// atomically with respect to the wait.
    fn wait_for_irqs();
}

#[cfg(target_os = "none")]
mod backend {
    pub fn is_enabled() -> bool {
        crate_interface::call_interface!(super::IrqIf::local_irq_enabled)
    }

    pub fn save_disable() -> bool {
        crate_interface::call_interface!(super::IrqIf::local_irq_save_and_disable)
    }

    pub fn restore(was_enabled: bool) {
        crate_interface::call_interface!(super::IrqIf::local_irq_restore, was_enabled)
    }

    pub fn in_irq() -> bool {
        crate_interface::call_interface!(super::IrqIf::in_interrupt)
    }

    pub fn wait() {
        crate_interface::call_interface!(super::IrqIf::wait_for_irqs)
    }
}

#[cfg(not(target_os = "none"))]
mod backend {
    use core::sync::atomic::{AtomicBool, Ordering};

    /// Simulated interrupt-enable flag. The machine powers on with
    /// interrupts masked, like real hardware before the scheduler is up.
    static ENABLED: AtomicBool = AtomicBool::new(false);

    /// Set while a simulated interrupt handler runs.
    static IN_IRQ: AtomicBool = AtomicBool::new(false);

    pub fn is_enabled() -> bool {
        ENABLED.load(Ordering::SeqCst)
    }

    pub fn save_disable() -> bool {
        ENABLED.swap(false, Ordering::SeqCst)
    }

    pub fn restore(was_enabled: bool) {
        ENABLED.store(was_enabled, Ordering::SeqCst);
    }

    pub fn in_irq() -> bool {
        IN_IRQ.load(Ordering::SeqCst)
    }

    pub fn wait() {
        // Halting the simulated CPU means the next thing that happens is a
        // timer interrupt.
        crate::time::advance_ticks(1);
    }

    pub(crate) fn enter_handler() {
        ENABLED.store(false, Ordering::SeqCst);
        IN_IRQ.store(true, Ordering::SeqCst);
    }

    pub(crate) fn leave_handler() {
        IN_IRQ.store(false, Ordering::SeqCst);
        ENABLED.store(true, Ordering::SeqCst);
    }

    pub(crate) fn reset() {
        ENABLED.store(false, Ordering::SeqCst);
        IN_IRQ.store(false, Ordering::SeqCst);
    }
}

#[cfg(not(target_os = "none"))]
pub(crate) use backend::{enter_handler, leave_handler};

/// Whether local interrupts are enabled.
#[inline]
pub fn is_enabled() -> bool {
    backend::is_enabled()
}

/// Enables local interrupts.
#[inline]
pub fn enable() {
    backend::restore(true);
}

/// Saves the interrupt state and disables interrupts. Returns the saved
/// state for [`restore`].
#[inline]
pub fn save_disable() -> bool {
    backend::save_disable()
}

/// Restores the interrupt state saved by [`save_disable`].
#[inline]
pub fn restore(was_enabled: bool) {
    backend::restore(was_enabled)
}

/// Whether the CPU is currently inside an interrupt handler.
#[inline]
pub fn in_irq() -> bool {
    backend::in_irq()
}

/// Enables interrupts and idles the CPU until the next one arrives.
///
/// The enable-and-wait sequence is atomic with respect to interrupt
/// delivery, so an interrupt cannot slip in between and be missed.
#[inline]
pub fn wait_for_interrupt() {
    backend::restore(true);
    backend::wait();
}

/// RAII guard that disables interrupts for its lifetime and restores the
/// previous level on drop.
#[derive(Debug)]
pub struct IrqSave(bool);

impl IrqSave {
    /// Enters the critical section.
    #[inline]
    pub fn new() -> Self {
        Self(save_disable())
    }
}

impl Default for IrqSave {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqSave {
    #[inline]
    fn drop(&mut self) {
        restore(self.0);
    }
}

/// Latch set inside interrupt context to request a reschedule on the
/// interrupt return path. Multiple sets during one handler coalesce.
static NEED_RESCHED: AtomicBool = AtomicBool::new(false);

/// Requests a reschedule when the current interrupt returns.
#[inline]
pub fn set_need_resched() {
    NEED_RESCHED.store(true, Ordering::SeqCst);
}

/// Consumes the need-resched latch. Used by the interrupt return path.
#[inline]
pub fn take_need_resched() -> bool {
    NEED_RESCHED.swap(false, Ordering::SeqCst)
}

static TICK_HOOK: AtomicUsize = AtomicUsize::new(0);
static RESCHED_HOOK: AtomicUsize = AtomicUsize::new(0);

/// Registers the function called, in interrupt context, on every timer
/// tick. Can be registered only once; later calls return false.
pub fn register_tick_hook(hook: fn()) -> bool {
    TICK_HOOK
        .compare_exchange(0, hook as usize, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

/// Registers the function called on the interrupt return path when the
/// need-resched latch was set. Can be registered only once.
pub fn register_resched_hook(hook: fn()) -> bool {
    RESCHED_HOOK
        .compare_exchange(0, hook as usize, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

pub(crate) fn dispatch_tick() {
    let hook = TICK_HOOK.load(Ordering::SeqCst);
    if hook != 0 {
        let hook = unsafe { core::mem::transmute::<usize, fn()>(hook) };
        hook();
    }
}

pub(crate) fn dispatch_resched() {
    let hook = RESCHED_HOOK.load(Ordering::SeqCst);
    if hook != 0 {
        let hook = unsafe { core::mem::transmute::<usize, fn()>(hook) };
        hook();
    }
}

#[cfg(not(target_os = "none"))]
pub(crate) fn reset_sim() {
    backend::reset();
    NEED_RESCHED.store(false, Ordering::SeqCst);
    TICK_HOOK.store(0, Ordering::SeqCst);
    RESCHED_HOOK.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The flag and latch statics are process-global; hold a lock so the
    // observations of concurrently running tests stay disjoint.
    static SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn guard_nests_and_restores() {
        let _s = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        restore(true);
        {
            let _a = IrqSave::new();
            assert!(!is_enabled());
            {
                let _b = IrqSave::new();
                assert!(!is_enabled());
            }
            // The inner guard restores "disabled", not "enabled".
            assert!(!is_enabled());
        }
        assert!(is_enabled());
        restore(false);
    }

    #[test]
    fn need_resched_coalesces() {
        let _s = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        let _ = take_need_resched();
        set_need_resched();
        set_need_resched();
        assert!(take_need_resched());
        assert!(!take_need_resched());
    }
}
