//! Effective priority, donation, and the preemption check.
//!
//! A thread's effective priority is the maximum of its base priority and
//! the best priority among its donors. Donations arise only through
//! [`crate::Lock`]: a waiter pushes its priority onto the holder, and if
//! the holder is itself blocked on another lock the push continues down
//! the chain. The chain is acyclic, so the walk terminates.

use khal::irq::{self, IrqSave};

use crate::config::PRI_MAX;
use crate::list::Slot;
use crate::run_queue::{sched_state, Scheduler};

/// Best donated priority, if the thread has donors. The donor list is
/// kept sorted, so this is its head.
fn donated_priority(sched: &Scheduler, s: Slot) -> Option<u8> {
    sched
        .thread(s)
        .donations
        .front()
        .map(|d| sched.thread(d).priority)
}

/// Recomputes a thread's effective priority from its base and its donors,
/// repositioning it in the ready queue if it is READY.
pub(crate) fn reset_priority(sched: &mut Scheduler, s: Slot) {
    let base = sched.thread(s).base_priority;
    let effective = match donated_priority(sched, s) {
        Some(donated) if donated > base => donated,
        _ => base,
    };
    sched.thread_mut(s).priority = effective;
    sched.reinsert_ready(s);
}

/// Walks the chain of lock holders starting at `s`, refreshing the
/// donation at every step, and finishes with a recomputation of the
/// terminal thread (the one not waiting on anything).
pub(crate) fn donate_priority(sched: &mut Scheduler, mut s: Slot) {
    assert!(!irq::is_enabled());
    let cur = sched.cur();
    while let Some(lock) = sched.thread(s).required_lock {
        reset_priority(sched, s);

        let holder = sched.lock_state(lock).holder;
        assert_ne!(holder, Some(s), "thread waiting on a lock it holds");

        // A thread further down the chain donated before; that donation
        // is stale now that its own priority may have changed.
        if s != cur {
            detach_donation(sched, s);
        }

        let Some(holder) = holder else { break };
        let mut donations = sched.thread(holder).donations;
        donations.insert_ordered(&mut sched.arena, s, |a, b| a.priority > b.priority);
        sched.thread_mut(holder).donations = donations;
        sched.thread_mut(s).donated_to = Some(holder);
        s = holder;
    }
    reset_priority(sched, s);
}

/// Detaches `s`'s donation from its donee without any recomputation.
fn detach_donation(sched: &mut Scheduler, s: Slot) {
    if !sched.thread(s).dona_link.is_linked() {
        return;
    }
    let donee = sched
        .thread(s)
        .donated_to
        .expect("donation link without a donee");
    let mut donations = sched.thread(donee).donations;
    donations.remove(&mut sched.arena, s);
    sched.thread_mut(donee).donations = donations;
    sched.thread_mut(s).donated_to = None;
}

/// Removes `s`'s donation, if it has one, and lets the former donee's
/// priority settle. Called when `s` acquires the lock it waited for or is
/// withdrawn from a lock's waiters.
pub(crate) fn remove_donation(sched: &mut Scheduler, s: Slot) {
    if !sched.thread(s).dona_link.is_linked() {
        return;
    }
    let donee = sched
        .thread(s)
        .donated_to
        .expect("donation link without a donee");
    detach_donation(sched, s);
    reset_priority(sched, donee);
}

/// Sets the current thread's base priority, then yields if some ready
/// thread now outranks it. Manual priorities are ignored under MLFQ.
pub(crate) fn set_priority(new_priority: u8) {
    assert!(new_priority <= PRI_MAX, "priority {new_priority} out of range");
    {
        let _irq = IrqSave::new();
        let mut guard = sched_state();
        let sched = &mut *guard;
        if sched.mlfqs {
            return;
        }
        let cur = sched.cur();
        sched.thread_mut(cur).base_priority = new_priority;
        reset_priority(sched, cur);
    }
    max_yield();
}

/// Yields to the ready queue's head if it outranks the running thread.
/// From interrupt context the reschedule is only latched, and happens on
/// the interrupt return path.
pub(crate) fn max_yield() {
    let outranked = {
        let _irq = IrqSave::new();
        let guard = sched_state();
        match guard.ready_max_priority() {
            Some(top) => top > guard.thread(guard.cur()).priority,
            None => false,
        }
    };
    if !outranked {
        return;
    }
    if irq::in_irq() {
        irq::set_need_resched();
    } else {
        crate::api::yield_now();
    }
}
