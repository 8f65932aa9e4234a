//! The run queue and the scheduler core.
//!
//! All scheduler state is one process-wide singleton behind a raw
//! spinlock. The lock is only ever taken with interrupts disabled; on a
//! single CPU that discipline is the whole mutual-exclusion story, and the
//! `debug_assert` in [`sched_state`] enforces it.
//!
//! A thread leaves the CPU only through [`schedule`], which picks the
//! ready queue's head (or the idle thread), switches contexts, and lets
//! the resumed side finish the hand-off in [`schedule_tail`].

use alloc::boxed::Box;
use alloc::vec::Vec;

use kfixed::Fixed;
use khal::context;
use khal::irq;
use kspin::{SpinRaw, SpinRawGuard};

use crate::list::{AllLink, ListHead, ReadyLink, Slot, ThreadArena};
use crate::mlfqs;
use crate::sync::{LockState, SemaState, Semaphore};
use crate::thread::{Thread, ThreadStatus, Tid};
use crate::timers::Alarm;

/// Tick and switch statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    /// Timer ticks spent in the idle thread.
    pub idle_ticks: u64,
    /// Timer ticks spent in kernel threads.
    pub kernel_ticks: u64,
    /// Timer ticks spent in user programs.
    pub user_ticks: u64,
    /// Completed context switches.
    pub context_switches: u64,
}

/// User-process integration points, supplied by the process layer.
#[cfg(feature = "userprog")]
#[crate_interface::def_interface]
pub trait ProcessIf {
    /// Activate the address space identified by `aspace` on this CPU.
    fn activate(aspace: usize);

    /// Tear down the current thread's user process.
    fn exit();
}

pub(crate) struct Scheduler {
    pub(crate) arena: ThreadArena,
    /// Threads eligible to run, best effective priority first, FIFO within
    /// equal priorities.
    pub(crate) ready: ListHead<ReadyLink>,
    /// Every live thread, in creation order.
    pub(crate) all: ListHead<AllLink>,
    pub(crate) locks: Vec<Option<LockState>>,
    pub(crate) semas: Vec<Option<SemaState>>,
    /// Pending wakeups, ordered by deadline.
    pub(crate) alarms: Vec<Alarm>,
    pub(crate) current: Option<Slot>,
    pub(crate) idle: Option<Slot>,
    pub(crate) initial: Option<Slot>,
    pub(crate) mlfqs: bool,
    pub(crate) load_avg: Fixed,
    /// Ticks since the running thread was handed the CPU.
    pub(crate) slice_ticks: u32,
    pub(crate) stats: Stats,
}

impl Scheduler {
    const fn new() -> Self {
        Self {
            arena: ThreadArena::new(),
            ready: ListHead::new(),
            all: ListHead::new(),
            locks: Vec::new(),
            semas: Vec::new(),
            alarms: Vec::new(),
            current: None,
            idle: None,
            initial: None,
            mlfqs: false,
            load_avg: Fixed::ZERO,
            slice_ticks: 0,
            stats: Stats {
                idle_ticks: 0,
                kernel_ticks: 0,
                user_ticks: 0,
                context_switches: 0,
            },
        }
    }

    /// The running thread's slot.
    pub(crate) fn cur(&self) -> Slot {
        self.current.expect("thread subsystem not initialized")
    }

    pub(crate) fn thread(&self, s: Slot) -> &Thread {
        self.arena.get(s)
    }

    pub(crate) fn thread_mut(&mut self, s: Slot) -> &mut Thread {
        self.arena.get_mut(s)
    }

    pub(crate) fn find_by_tid(&self, tid: Tid) -> Option<Slot> {
        self.all.iter(&self.arena).find(|&s| self.arena.get(s).tid == tid)
    }

    /// Highest effective priority among ready threads.
    pub(crate) fn ready_max_priority(&self) -> Option<u8> {
        self.ready.front().map(|s| self.thread(s).priority)
    }

    /// Inserts a thread into the ready queue at its sorted position.
    pub(crate) fn insert_ready(&mut self, s: Slot) {
        assert!(!irq::is_enabled());
        self.ready
            .insert_ordered(&mut self.arena, s, |a, b| a.priority > b.priority);
    }

    /// Repositions a READY thread after its effective priority changed, so
    /// the queue stays sorted.
    pub(crate) fn reinsert_ready(&mut self, s: Slot) {
        if self.thread(s).status == ThreadStatus::Ready {
            assert!(!irq::is_enabled());
            self.ready.remove(&mut self.arena, s);
            self.insert_ready(s);
        }
    }

    /// The head of the ready queue, or the idle thread when it is empty.
    fn next_thread_to_run(&mut self) -> Slot {
        match self.ready.pop_front(&mut self.arena) {
            Some(s) => s,
            None => self.idle.expect("nothing to run and no idle thread"),
        }
    }
}

static SCHED: SpinRaw<Scheduler> = SpinRaw::new(Scheduler::new());

/// Locks the scheduler state. Interrupts must already be disabled; on one
/// CPU that is what keeps the lock uncontended.
pub(crate) fn sched_state() -> SpinRawGuard<'static, Scheduler> {
    debug_assert!(
        !irq::is_enabled(),
        "scheduler state touched with interrupts enabled"
    );
    SCHED.lock()
}

/// Swaps in a pristine scheduler, for tests that boot repeatedly inside
/// one process.
#[cfg(test)]
pub(crate) fn replace_state_for_fresh_boot() {
    *SCHED.lock() = Scheduler::new();
}

/// Transitions a blocked thread to ready. Does not preempt.
pub(crate) fn unblock_slot(sched: &mut Scheduler, s: Slot) {
    assert_eq!(
        sched.thread(s).status,
        ThreadStatus::Blocked,
        "unblocking a thread that is not blocked"
    );
    sched.insert_ready(s);
    sched.thread_mut(s).status = ThreadStatus::Ready;
}

/// Picks the next thread and switches to it.
///
/// At entry interrupts must be off and the running thread's status must
/// already have been changed away from `Running`. Consumes the state
/// guard: the switch itself happens with the state unlocked, and whoever
/// resumes on the other side re-locks it to finish via [`schedule_tail`].
pub(crate) fn schedule(mut guard: SpinRawGuard<'static, Scheduler>) {
    assert!(!irq::is_enabled());
    let sched = &mut *guard;
    let cur = sched.cur();
    assert_ne!(sched.thread(cur).status, ThreadStatus::Running);

    // Priorities decay with CPU use under MLFQ; bring every thread up to
    // date and restore the queue order before picking a winner.
    if sched.mlfqs {
        mlfqs::refresh_priorities(sched);
    }

    let next = sched.next_thread_to_run();
    if next == cur {
        schedule_tail(sched, cur);
        return;
    }

    sched.current = Some(next);
    sched.stats.context_switches += 1;
    let cur_ctx = sched.thread(cur).ctx.clone();
    let next_ctx = sched.thread(next).ctx.clone();
    let dying = sched.thread(cur).status == ThreadStatus::Dying;
    drop(guard);

    if dying {
        context::finish(cur.as_word(), &next_ctx);
    }
    let prev = context::switch(&cur_ctx, cur.as_word(), &next_ctx);

    let mut guard = sched_state();
    schedule_tail(&mut guard, Slot::from_word(prev));
}

/// Completes a switch: marks the new thread running, starts its quantum,
/// activates its address space, and reaps `prev` if it was dying — except
/// the initial thread, whose page predates the scheduler.
pub(crate) fn schedule_tail(sched: &mut Scheduler, prev: Slot) {
    assert!(!irq::is_enabled());
    let cur = sched.cur();
    sched.thread_mut(cur).status = ThreadStatus::Running;
    sched.slice_ticks = 0;

    #[cfg(feature = "userprog")]
    if let Some(aspace) = sched.thread(cur).aspace {
        crate_interface::call_interface!(ProcessIf::activate, aspace.get());
    }

    if prev != cur
        && sched.thread(prev).status == ThreadStatus::Dying
        && Some(prev) != sched.initial
    {
        let dead = sched.arena.remove(prev);
        debug!("reaped thread {} ({})", dead.tid(), dead.name());
        drop(dead);
    }
}

/// Type-erased thread body; boxed again at the call site so it travels as
/// a single word through the context-switch interface.
pub(crate) type ThreadBody = Box<dyn FnOnce() + Send + 'static>;

/// First code run by every new thread: finish the hand-off, then run the
/// thread's function with interrupts enabled, then exit.
pub(crate) fn thread_entry(prev: usize, arg: usize) -> ! {
    {
        let mut guard = sched_state();
        schedule_tail(&mut guard, Slot::from_word(prev));
    }
    // Rebuild the body from the word stashed at creation time.
    let body = unsafe { Box::from_raw(arg as *mut ThreadBody) };
    irq::enable();
    (*body)();
    crate::api::exit();
}

/// Body of the idle thread.
///
/// Records its own identity, releases the boot handshake, then settles
/// into its loop: block, and on each resume enable interrupts and halt
/// until the next one. After its first scheduling it never appears on the
/// ready queue; `next_thread_to_run` returns it directly when the queue is
/// empty.
pub(crate) fn idle_main(started: alloc::sync::Arc<Semaphore>) {
    {
        let _irq = irq::IrqSave::new();
        let mut guard = sched_state();
        let sched = &mut *guard;
        let cur = sched.cur();
        sched.idle = Some(cur);
    }
    started.release();

    loop {
        // Let someone else run.
        let _ = irq::save_disable();
        crate::api::block();

        // Re-enable interrupts and wait for the next one. The sequence is
        // atomic, so a wakeup cannot land between the enable and the wait
        // and be lost.
        irq::wait_for_interrupt();
    }
}
