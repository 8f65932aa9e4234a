//! Blocking synchronization primitives.
//!
//! The scheduler's side of the hand-off contract: a counting
//! [`Semaphore`] and a [`Lock`] whose waiters donate their priority along
//! the chain of holders. Both park threads with the scheduler's block
//! operation and wake them with unblock; waking never preempts by itself,
//! the waker runs the ordinary preemption check afterwards.
//!
//! The states live in tables inside the scheduler singleton, and the
//! public types are small handles, so everything is manipulated under the
//! same interrupts-off discipline as the rest of the scheduler.

use khal::irq::{self, IrqSave};
use khal::time;

use crate::list::{ListHead, ReadyLink, Slot};
use crate::priority;
use crate::run_queue::{sched_state, schedule, unblock_slot, Scheduler};
use crate::thread::ThreadStatus;
use crate::timers;

/// Identifies a registered lock.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct LockId(u32);

/// Identifies a registered semaphore.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct SemaId(u32);

pub(crate) struct LockState {
    pub(crate) holder: Option<Slot>,
    pub(crate) waiters: ListHead<ReadyLink>,
}

pub(crate) struct SemaState {
    pub(crate) value: u32,
    pub(crate) waiters: ListHead<ReadyLink>,
}

impl Scheduler {
    pub(crate) fn lock_state(&self, id: LockId) -> &LockState {
        self.locks[id.0 as usize].as_ref().expect("stale lock id")
    }

    fn lock_state_mut(&mut self, id: LockId) -> &mut LockState {
        self.locks[id.0 as usize].as_mut().expect("stale lock id")
    }

    fn sema_state(&self, id: SemaId) -> &SemaState {
        self.semas[id.0 as usize].as_ref().expect("stale semaphore id")
    }

    fn sema_state_mut(&mut self, id: SemaId) -> &mut SemaState {
        self.semas[id.0 as usize].as_mut().expect("stale semaphore id")
    }

    fn alloc_lock(&mut self) -> LockId {
        let state = LockState { holder: None, waiters: ListHead::new() };
        for (i, entry) in self.locks.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(state);
                return LockId(i as u32);
            }
        }
        self.locks.push(Some(state));
        LockId((self.locks.len() - 1) as u32)
    }

    fn free_lock(&mut self, id: LockId) {
        let state = self.locks[id.0 as usize].take().expect("stale lock id");
        assert!(state.holder.is_none(), "dropping a held lock");
        assert!(state.waiters.is_empty(), "dropping a lock with waiters");
    }

    fn alloc_sema(&mut self, value: u32) -> SemaId {
        let state = SemaState { value, waiters: ListHead::new() };
        for (i, entry) in self.semas.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(state);
                return SemaId(i as u32);
            }
        }
        self.semas.push(Some(state));
        SemaId((self.semas.len() - 1) as u32)
    }

    fn free_sema(&mut self, id: SemaId) {
        let state = self.semas[id.0 as usize].take().expect("stale semaphore id");
        assert!(state.waiters.is_empty(), "dropping a semaphore with waiters");
    }
}

/// The waiter with the best effective priority; first wins among equals.
fn best_waiter(sched: &Scheduler, waiters: ListHead<ReadyLink>) -> Option<Slot> {
    let mut best: Option<Slot> = None;
    for s in waiters.iter(&sched.arena) {
        match best {
            Some(b) if sched.thread(s).priority > sched.thread(b).priority => best = Some(s),
            None => best = Some(s),
            _ => {}
        }
    }
    best
}

/// A counting semaphore.
pub struct Semaphore {
    id: SemaId,
}

impl Semaphore {
    /// Creates a semaphore holding `permits` permits.
    pub fn new(permits: u32) -> Self {
        let _irq = IrqSave::new();
        let mut guard = sched_state();
        Self { id: guard.alloc_sema(permits) }
    }

    /// Acquires a permit, blocking until one is available.
    pub fn acquire(&self) {
        assert!(!irq::in_irq(), "blocking acquire from interrupt context");
        let _irq = IrqSave::new();
        loop {
            let mut guard = sched_state();
            let sched = &mut *guard;
            if sched.sema_state(self.id).value > 0 {
                sched.sema_state_mut(self.id).value -= 1;
                return;
            }
            let cur = sched.cur();
            let mut waiters = sched.sema_state(self.id).waiters;
            waiters.insert_ordered(&mut sched.arena, cur, |a, b| a.priority > b.priority);
            sched.sema_state_mut(self.id).waiters = waiters;
            sched.thread_mut(cur).status = ThreadStatus::Blocked;
            schedule(guard);
        }
    }

    /// Acquires a permit without blocking; returns whether one was taken.
    pub fn try_acquire(&self) -> bool {
        let _irq = IrqSave::new();
        let mut guard = sched_state();
        let sched = &mut *guard;
        if sched.sema_state(self.id).value > 0 {
            sched.sema_state_mut(self.id).value -= 1;
            true
        } else {
            false
        }
    }

    /// Releases a permit and wakes the best waiter. Safe in interrupt
    /// context.
    pub fn release(&self) {
        {
            let _irq = IrqSave::new();
            let mut guard = sched_state();
            let sched = &mut *guard;
            sched.sema_state_mut(self.id).value += 1;
            let waiters = sched.sema_state(self.id).waiters;
            if let Some(w) = best_waiter(sched, waiters) {
                let mut waiters = waiters;
                waiters.remove(&mut sched.arena, w);
                sched.sema_state_mut(self.id).waiters = waiters;
                unblock_slot(sched, w);
            }
        }
        priority::max_yield();
    }

    /// Available permits right now.
    pub fn permits(&self) -> u32 {
        let _irq = IrqSave::new();
        sched_state().sema_state(self.id).value
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        let _irq = IrqSave::new();
        sched_state().free_sema(self.id);
    }
}

/// A lock with priority donation.
///
/// While a high-priority thread waits, its effective priority flows to the
/// holder — transitively, if the holder is itself blocked on another lock —
/// so the lock gets released as fast as the best waiter could have managed
/// it itself.
pub struct Lock {
    id: LockId,
}

impl Lock {
    /// Creates an unheld lock.
    pub fn new() -> Self {
        let _irq = IrqSave::new();
        let mut guard = sched_state();
        Self { id: guard.alloc_lock() }
    }

    /// Acquires the lock, sleeping until it is available.
    pub fn acquire(&self) {
        let acquired = self.acquire_inner(None);
        debug_assert!(acquired);
    }

    /// Acquires with a deadline, in timer ticks from now. On timeout the
    /// thread is withdrawn from the waiters, its donation is undone, and
    /// `false` is returned.
    pub fn acquire_timeout(&self, ticks: u64) -> bool {
        self.acquire_inner(Some(ticks))
    }

    /// Acquires the lock without blocking; returns whether it was taken.
    pub fn try_acquire(&self) -> bool {
        let _irq = IrqSave::new();
        let mut guard = sched_state();
        let sched = &mut *guard;
        let cur = sched.cur();
        if sched.lock_state(self.id).holder.is_none() {
            sched.lock_state_mut(self.id).holder = Some(cur);
            true
        } else {
            false
        }
    }

    fn acquire_inner(&self, timeout: Option<u64>) -> bool {
        assert!(!irq::in_irq(), "blocking acquire from interrupt context");
        let _irq = IrqSave::new();
        let deadline = timeout.map(|t| time::now_ticks() + t);
        loop {
            let mut guard = sched_state();
            let sched = &mut *guard;
            let cur = sched.cur();

            if sched.thread(cur).wait_cancelled {
                // A fired deadline already withdrew us from the waiters
                // and undid the donation.
                sched.thread_mut(cur).wait_cancelled = false;
                return false;
            }

            match sched.lock_state(self.id).holder {
                None => {
                    sched.lock_state_mut(self.id).holder = Some(cur);
                    sched.thread_mut(cur).required_lock = None;
                    // Our donation to the previous holder is settled.
                    if !sched.mlfqs {
                        priority::remove_donation(sched, cur);
                    }
                    timers::cancel_alarm(sched, cur);
                    return true;
                }
                Some(holder) => {
                    assert_ne!(holder, cur, "recursive lock acquire");
                    sched.thread_mut(cur).required_lock = Some(self.id);
                    // Donation exists only under strict priority; MLFQ
                    // priorities come from the recurrences alone.
                    if !sched.mlfqs {
                        priority::donate_priority(sched, cur);
                    }
                    if let Some(deadline) = deadline {
                        timers::register_alarm(sched, deadline, cur);
                    }
                    let mut waiters = sched.lock_state(self.id).waiters;
                    waiters.insert_ordered(&mut sched.arena, cur, |a, b| a.priority > b.priority);
                    sched.lock_state_mut(self.id).waiters = waiters;
                    sched.thread_mut(cur).status = ThreadStatus::Blocked;
                    schedule(guard);
                }
            }
        }
    }

    /// Releases the lock and wakes the best waiter. The winner's donation
    /// to us is settled here; the other waiters keep theirs until their
    /// own turn comes.
    pub fn release(&self) {
        {
            let _irq = IrqSave::new();
            let mut guard = sched_state();
            let sched = &mut *guard;
            let cur = sched.cur();
            assert_eq!(
                sched.lock_state(self.id).holder,
                Some(cur),
                "releasing a lock that is not held"
            );
            sched.lock_state_mut(self.id).holder = None;
            let waiters = sched.lock_state(self.id).waiters;
            if let Some(w) = best_waiter(sched, waiters) {
                let mut waiters = waiters;
                waiters.remove(&mut sched.arena, w);
                sched.lock_state_mut(self.id).waiters = waiters;
                if !sched.mlfqs {
                    priority::remove_donation(sched, w);
                }
                unblock_slot(sched, w);
            } else if !sched.mlfqs {
                priority::reset_priority(sched, cur);
            }
        }
        priority::max_yield();
    }

    /// Whether the calling thread holds this lock.
    pub fn held_by_current(&self) -> bool {
        let _irq = IrqSave::new();
        let guard = sched_state();
        guard.lock_state(self.id).holder == Some(guard.cur())
    }

    /// Acquires and returns a guard that releases on drop.
    pub fn guard(&self) -> LockGuard<'_> {
        self.acquire();
        LockGuard { lock: self }
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        let _irq = IrqSave::new();
        sched_state().free_lock(self.id);
    }
}

/// RAII guard holding a [`Lock`].
pub struct LockGuard<'a> {
    lock: &'a Lock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Withdraws `s` from `lock`'s waiters after a timeout. The thread keeps
/// no donation, and the chain it donated through is recomputed without
/// its contribution.
pub(crate) fn withdraw_waiter(sched: &mut Scheduler, lock: LockId, s: Slot) {
    let mut waiters = sched.lock_state(lock).waiters;
    if sched.thread(s).ready_link.is_linked() {
        waiters.remove(&mut sched.arena, s);
    }
    sched.lock_state_mut(lock).waiters = waiters;
    sched.thread_mut(s).required_lock = None;
    if sched.mlfqs {
        return;
    }
    priority::remove_donation(sched, s);

    // The former holder may be donating down its own chain with a
    // priority that no longer includes `s`; walk it again.
    if let Some(holder) = sched.lock_state(lock).holder {
        priority::donate_priority(sched, holder);
    }
}
