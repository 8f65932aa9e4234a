//! The multi-level feedback queue policy.
//!
//! Under `-o mlfqs` nobody sets priorities by hand. Instead a thread's
//! priority follows from how much CPU it has been eating (`recent_cpu`,
//! decayed exponentially), how generous it declares itself (`nice`), and
//! how loaded the machine is (`load_avg`):
//!
//! ```text
//! priority   = PRI_MAX - recent_cpu/4 - 2*nice
//! recent_cpu = (2*load_avg)/(2*load_avg + 1) * recent_cpu + nice
//! load_avg   = (59/60)*load_avg + (1/60)*ready_threads
//! ```
//!
//! `recent_cpu` grows by one on every tick the thread runs; the decay and
//! the load average advance once per second. Priorities themselves are
//! refreshed in `schedule()`, and the quantum forces a reschedule at least
//! every [`TIME_SLICE`](crate::TIME_SLICE) ticks, which bounds their
//! staleness.

use alloc::vec::Vec;

use kfixed::Fixed;
use khal::irq::IrqSave;
use khal::time::{self, TIMER_FREQ};

use crate::config::{NICE_MAX, NICE_MIN, PRI_MAX, PRI_MIN};
use crate::list::Slot;
use crate::priority;
use crate::run_queue::{sched_state, Scheduler};
use crate::thread::ThreadStatus;

/// `priority = PRI_MAX - recent_cpu/4 - 2*nice`, truncated toward zero,
/// then clamped into the priority band.
pub(crate) fn recompute_priority(sched: &mut Scheduler, s: Slot) {
    let t = sched.thread(s);
    let raw = Fixed::from_int(PRI_MAX as i32) - t.recent_cpu / 4 - Fixed::from_int(2 * t.nice as i32);
    let clamped = raw.trunc().clamp(PRI_MIN as i32, PRI_MAX as i32);
    sched.thread_mut(s).priority = clamped as u8;
}

/// Recomputes every thread's priority and restores the ready queue's
/// order. Runs inside `schedule()`; O(threads) per reschedule, which this
/// kernel accepts for the simplicity.
pub(crate) fn refresh_priorities(sched: &mut Scheduler) {
    let slots: Vec<Slot> = sched.all.iter(&sched.arena).collect();
    for s in slots {
        recompute_priority(sched, s);
    }
    sched.ready.sort(&mut sched.arena, |a, b| a.priority > b.priority);
}

/// Ready threads plus the running one, unless the CPU is idle.
fn ready_thread_count(sched: &Scheduler) -> i32 {
    let mut count = sched.ready.len() as i32;
    if Some(sched.cur()) != sched.idle {
        count += 1;
    }
    count
}

/// Per-tick bookkeeping plus the once-per-second recurrences. Interrupt
/// context.
pub(crate) fn on_tick(sched: &mut Scheduler) {
    let cur = sched.cur();
    if Some(cur) != sched.idle {
        assert_eq!(sched.thread(cur).status, ThreadStatus::Running);
        let bumped = sched.thread(cur).recent_cpu + 1;
        sched.thread_mut(cur).recent_cpu = bumped;
    }

    // The second boundary comes before any priority refresh, so the new
    // load average is what the refresh sees.
    if time::now_ticks() % TIMER_FREQ == 0 {
        refresh_load_avg(sched);
        let slots: Vec<Slot> = sched.all.iter(&sched.arena).collect();
        for s in slots {
            refresh_recent_cpu(sched, s);
        }
        trace!("load_avg {}", sched.load_avg);
    }
}

/// `load_avg = (59/60)*load_avg + (1/60)*ready_threads`.
fn refresh_load_avg(sched: &mut Scheduler) {
    let decay = Fixed::from_int(59) / 60;
    let gain = Fixed::from_int(1) / 60;
    sched.load_avg = decay * sched.load_avg + gain * ready_thread_count(sched);
}

/// `recent_cpu = (2*load_avg)/(2*load_avg + 1) * recent_cpu + nice`.
fn refresh_recent_cpu(sched: &mut Scheduler, s: Slot) {
    let twice_load = sched.load_avg * 2;
    let coefficient = twice_load / (twice_load + 1);
    let t = sched.thread(s);
    let refreshed = coefficient * t.recent_cpu + t.nice as i32;
    sched.thread_mut(s).recent_cpu = refreshed;
}

/// Sets the current thread's nice value, refreshes its priority, and
/// yields if it no longer outranks the ready queue.
pub(crate) fn set_nice(nice: i8) {
    assert!((NICE_MIN..=NICE_MAX).contains(&nice), "nice {nice} out of range");
    {
        let _irq = IrqSave::new();
        let mut guard = sched_state();
        let sched = &mut *guard;
        assert!(sched.mlfqs, "nice values exist only under mlfqs");
        let cur = sched.cur();
        sched.thread_mut(cur).nice = nice;
        recompute_priority(sched, cur);
        sched.reinsert_ready(cur);
    }
    priority::max_yield();
}

/// The current thread's nice value.
pub(crate) fn nice() -> i8 {
    let _irq = IrqSave::new();
    let guard = sched_state();
    assert!(guard.mlfqs, "nice values exist only under mlfqs");
    guard.thread(guard.cur()).nice
}

/// 100 times the system load average, rounded to nearest.
pub(crate) fn load_avg_x100() -> i32 {
    let _irq = IrqSave::new();
    let guard = sched_state();
    assert!(guard.mlfqs, "load_avg exists only under mlfqs");
    (guard.load_avg * 100).round()
}

/// 100 times the current thread's `recent_cpu`, rounded to nearest.
pub(crate) fn recent_cpu_x100() -> i32 {
    let _irq = IrqSave::new();
    let guard = sched_state();
    assert!(guard.mlfqs, "recent_cpu exists only under mlfqs");
    (guard.thread(guard.cur()).recent_cpu * 100).round()
}
