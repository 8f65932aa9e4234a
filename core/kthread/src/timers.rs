//! Per-tick accounting and the alarm queue.
//!
//! The timer interrupt lands here on every tick: classify it for the
//! statistics, advance the MLFQ recurrences, fire due alarms, and request
//! preemption once the quantum is spent. The reschedule itself never
//! happens in interrupt context; the need-resched latch is honored on the
//! interrupt return path.

use khal::irq::{self, IrqSave};
use khal::time;

use crate::config::TIME_SLICE;
use crate::list::Slot;
use crate::mlfqs;
use crate::run_queue::{sched_state, schedule, unblock_slot, Scheduler};
use crate::sync;
use crate::thread::ThreadStatus;

/// A pending wakeup.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Alarm {
    pub(crate) deadline: u64,
    pub(crate) slot: Slot,
}

/// The timer tick handler. Interrupt context.
pub(crate) fn tick_handler() {
    debug_assert!(irq::in_irq());
    let mut guard = sched_state();
    let sched = &mut *guard;
    let cur = sched.cur();

    // Classify the tick.
    if Some(cur) == sched.idle {
        sched.stats.idle_ticks += 1;
    } else {
        #[cfg(feature = "userprog")]
        let user_tick = sched.thread(cur).aspace.is_some();
        #[cfg(not(feature = "userprog"))]
        let user_tick = false;
        if user_tick {
            sched.stats.user_ticks += 1;
        } else {
            sched.stats.kernel_ticks += 1;
        }
    }

    if sched.mlfqs {
        mlfqs::on_tick(sched);
    }

    fire_alarms(sched);

    // Enforce preemption once the quantum is spent.
    sched.slice_ticks += 1;
    if sched.slice_ticks >= TIME_SLICE {
        irq::set_need_resched();
    }
}

/// Registers a wakeup for `slot` at `deadline`, keeping the queue sorted
/// by deadline. A thread has at most one pending alarm.
pub(crate) fn register_alarm(sched: &mut Scheduler, deadline: u64, slot: Slot) {
    if sched.alarms.iter().any(|a| a.slot == slot) {
        return;
    }
    let at = sched.alarms.partition_point(|a| a.deadline <= deadline);
    sched.alarms.insert(at, Alarm { deadline, slot });
}

/// Cancels any pending alarm for `slot`.
pub(crate) fn cancel_alarm(sched: &mut Scheduler, slot: Slot) {
    sched.alarms.retain(|a| a.slot != slot);
}

/// Fires due alarms. A plain sleeper is unblocked; a timed lock waiter is
/// first withdrawn from the lock, its donation undone, before waking up to
/// report failure.
fn fire_alarms(sched: &mut Scheduler) {
    let now = time::now_ticks();
    while sched.alarms.first().is_some_and(|a| a.deadline <= now) {
        let alarm = sched.alarms.remove(0);
        let s = alarm.slot;

        if let Some(lock) = sched.thread(s).required_lock {
            sync::withdraw_waiter(sched, lock, s);
            sched.thread_mut(s).wait_cancelled = true;
        }
        if sched.thread(s).status == ThreadStatus::Blocked {
            unblock_slot(sched, s);
        }

        // Preempt on interrupt return if the woken thread outranks the
        // running one.
        if sched.thread(s).priority > sched.thread(sched.cur()).priority {
            irq::set_need_resched();
        }
    }
}

/// Blocks the current thread for at least `ticks` timer ticks.
pub fn sleep_ticks(ticks: u64) {
    assert!(!irq::in_irq(), "sleep from interrupt context");
    if ticks == 0 {
        crate::api::yield_now();
        return;
    }
    let _irq = IrqSave::new();
    let mut guard = sched_state();
    let sched = &mut *guard;
    let cur = sched.cur();
    register_alarm(sched, time::now_ticks() + ticks, cur);
    sched.thread_mut(cur).status = ThreadStatus::Blocked;
    schedule(guard);
}
