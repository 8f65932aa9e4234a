//! Public thread API.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use kerror::KResult;
use kfixed::Fixed;
use khal::context::TaskContext;
use khal::irq::{self, IrqSave};
use khal::mem::KernelPage;

use crate::config::{SchedConfig, PRI_DEFAULT, PRI_MAX, PRI_MIN};
use crate::run_queue::{
    self, sched_state, schedule, unblock_slot, Stats, ThreadBody,
};
use crate::sync::Semaphore;
use crate::thread::{self, Thread, ThreadStatus, Tid};
use crate::timers;
use crate::{mlfqs, priority as priority_mod};

/// Monotonic tid source. An atomic keeps allocation cheap and callable at
/// any interrupt level.
static NEXT_TID: AtomicU32 = AtomicU32::new(1);

fn allocate_tid() -> Tid {
    Tid::new(NEXT_TID.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
pub(crate) fn reset_tid_counter() {
    NEXT_TID.store(1, Ordering::Relaxed);
}

/// Initializes the thread subsystem by adopting the currently executing
/// code as the initial thread, named "main". Must be called exactly once,
/// with interrupts disabled, before anything else in this crate.
pub fn init(config: SchedConfig) {
    assert!(!irq::is_enabled(), "init with interrupts enabled");
    {
        let mut guard = sched_state();
        let sched = &mut *guard;
        assert!(sched.current.is_none(), "thread subsystem initialized twice");

        sched.mlfqs = config.mlfqs;
        sched.load_avg = Fixed::ZERO;

        let mut main = Thread::new("main", PRI_DEFAULT, None, TaskContext::adopt());
        main.tid = allocate_tid();
        main.status = ThreadStatus::Running;
        let slot = sched.arena.insert(main);
        sched.all.push_back(&mut sched.arena, slot);
        sched.current = Some(slot);
        sched.initial = Some(slot);
    }

    assert!(irq::register_tick_hook(timers::tick_handler));
    assert!(irq::register_resched_hook(yield_now));

    info!(
        "thread subsystem up (policy: {})",
        if config.mlfqs { "mlfqs" } else { "priority" }
    );
}

/// Creates the idle thread and starts preemptive scheduling by enabling
/// interrupts. Returns once the idle thread has recorded its identity.
pub fn start() {
    let started = Arc::new(Semaphore::new(0));
    let handshake = started.clone();
    spawn("idle", PRI_MIN, move || run_queue::idle_main(handshake))
        .expect("no page for the idle thread");

    irq::enable();
    started.acquire();
}

/// Creates a kernel thread named `name` at `priority` running `f`, and
/// puts it on the ready queue. Returns its tid, or `NoMemory` when no page
/// can be had for its stack.
///
/// If the new thread outranks the caller it runs before `spawn` returns;
/// it could even have exited by then. The caller may also run arbitrarily
/// long before the new thread is first scheduled. Use a semaphore or
/// similar if ordering matters.
pub fn spawn<F>(name: &str, priority: u8, f: F) -> KResult<Tid>
where
    F: FnOnce() + Send + 'static,
{
    assert!(
        (PRI_MIN..=PRI_MAX).contains(&priority),
        "priority {priority} out of range"
    );

    let page = KernelPage::alloc_zero()?;

    // Pack the body into one word for the switch interface.
    let body: ThreadBody = Box::new(f);
    let body = Box::into_raw(Box::new(body));

    let tid;
    {
        // Lay out the startup frames and publish the thread atomically, so
        // a half-built TCB can never be observed.
        let _irq = IrqSave::new();

        let stack_top = thread::prepare_startup_frames();
        let ctx = match TaskContext::prepare(
            name,
            stack_top,
            run_queue::thread_entry,
            body as usize,
        ) {
            Ok(ctx) => ctx,
            Err(e) => {
                // Take the body back out of the raw pointer.
                drop(unsafe { Box::from_raw(body) });
                return Err(e);
            }
        };

        let mut t = Thread::new(name, priority, Some(page), ctx);
        t.stack = stack_top;
        t.tid = allocate_tid();
        tid = t.tid;

        let mut guard = sched_state();
        let sched = &mut *guard;
        let slot = sched.arena.insert(t);
        sched.all.push_back(&mut sched.arena, slot);
        unblock_slot(sched, slot);
    }
    trace!("spawned thread {tid} ({name}) at priority {priority}");

    // Hand over the CPU right away if the new thread outranks us.
    priority_mod::max_yield();
    Ok(tid)
}

/// Puts the current thread to sleep; it runs again only after [`unblock`].
/// Interrupts must be off. Usually a [`Semaphore`](crate::Semaphore) or
/// [`Lock`](crate::Lock) is the better tool.
pub fn block() {
    assert!(!irq::in_irq(), "block from interrupt context");
    assert!(!irq::is_enabled(), "block with interrupts enabled");
    let mut guard = sched_state();
    let sched = &mut *guard;
    let cur = sched.cur();
    sched.thread_mut(cur).status = ThreadStatus::Blocked;
    schedule(guard);
}

/// Moves a blocked thread to the ready queue. Callable at any interrupt
/// level. Does **not** preempt: a caller that disabled interrupts itself
/// can atomically unblock several threads and reschedule afterwards.
pub fn unblock(tid: Tid) {
    let _irq = IrqSave::new();
    let mut guard = sched_state();
    let sched = &mut *guard;
    let slot = sched.find_by_tid(tid).expect("unblock: unknown tid");
    unblock_slot(sched, slot);
}

/// Yields the CPU. The thread stays ready and may be picked again
/// immediately.
pub fn yield_now() {
    assert!(!irq::in_irq(), "yield from interrupt context");
    let _irq = IrqSave::new();
    let mut guard = sched_state();
    let sched = &mut *guard;
    let cur = sched.cur();
    if Some(cur) != sched.idle {
        sched.insert_ready(cur);
    }
    sched.thread_mut(cur).status = ThreadStatus::Ready;
    schedule(guard);
}

/// Deschedules the current thread and destroys it. The successor reclaims
/// its page in the tail of the switch. Never returns.
pub fn exit() -> ! {
    assert!(!irq::in_irq(), "exit from interrupt context");

    #[cfg(feature = "userprog")]
    crate_interface::call_interface!(crate::run_queue::ProcessIf::exit);

    let _ = irq::save_disable();
    let mut guard = sched_state();
    let sched = &mut *guard;
    let cur = sched.cur();
    debug!(
        "thread {} ({}) exiting",
        sched.thread(cur).tid(),
        sched.thread(cur).name()
    );
    sched.all.remove(&mut sched.arena, cur);
    // A pending alarm must not outlive the slot it names.
    timers::cancel_alarm(sched, cur);
    sched.thread_mut(cur).status = ThreadStatus::Dying;
    schedule(guard);
    unreachable!("a dying thread was rescheduled");
}

/// The running thread's tid.
pub fn current() -> Tid {
    with_current(|t| t.tid())
}

/// The running thread's effective priority.
pub fn priority() -> u8 {
    with_current(|t| t.priority())
}

/// Sets the running thread's base priority, yielding if it no longer
/// outranks the ready queue. A no-op under the MLFQ policy.
pub fn set_priority(new_priority: u8) {
    priority_mod::set_priority(new_priority);
}

/// The running thread's nice value. MLFQ policy only.
pub fn nice() -> i8 {
    mlfqs::nice()
}

/// Sets the running thread's nice value, recomputing its priority and
/// yielding if outranked. MLFQ policy only.
pub fn set_nice(nice: i8) {
    mlfqs::set_nice(nice);
}

/// 100 times the system load average, rounded to nearest. MLFQ policy
/// only.
pub fn load_avg_x100() -> i32 {
    mlfqs::load_avg_x100()
}

/// 100 times the running thread's `recent_cpu`, rounded to nearest. MLFQ
/// policy only.
pub fn recent_cpu_x100() -> i32 {
    mlfqs::recent_cpu_x100()
}

/// Runs `f` over every live thread, idle included. Interrupts must be off
/// so the set cannot change underfoot.
pub fn foreach<F>(mut f: F)
where
    F: FnMut(&Thread),
{
    assert!(!irq::is_enabled(), "foreach with interrupts enabled");
    let guard = sched_state();
    let sched = &*guard;
    for s in sched.all.iter(&sched.arena) {
        f(sched.thread(s));
    }
}

/// A snapshot of the scheduler's statistics.
pub fn stats() -> Stats {
    let _irq = IrqSave::new();
    sched_state().stats
}

/// Logs the tick statistics.
pub fn log_stats() {
    let s = stats();
    info!(
        "threads: {} idle ticks, {} kernel ticks, {} user ticks, {} context switches",
        s.idle_ticks, s.kernel_ticks, s.user_ticks, s.context_switches
    );
}

fn with_current<R>(f: impl FnOnce(&Thread) -> R) -> R {
    let _irq = IrqSave::new();
    let guard = sched_state();
    let s = guard.cur();
    let t = guard.thread(s);
    assert_eq!(t.status(), ThreadStatus::Running);
    f(t)
}
