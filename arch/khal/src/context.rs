// SPDX-License-Identifier: Apache-2.0

//! The context-switch primitive.
//!
//! [`switch`] is a function that returns twice: once in the thread that is
//! being resumed (immediately), and much later in the thread that called
//! it, when somebody switches back. Its return value is an opaque word
//! identifying the thread that was switched away from, which the scheduler
//! needs to finish the hand-off (mark the new thread running, reap a dead
//! predecessor).
//!
//! Kernel targets implement the primitive with a real stack swap through
//! the `ContextIf` backend. Hosted builds emulate it cooperatively: every
//! thread is
//! carried by a parked host thread holding a run token, and `switch` moves
//! the token. At most one carrier owns the token at any time, which is
//! exactly the uniprocessor execution model the scheduler assumes.

use kerror::KResult;

/// Entry function for a freshly created thread. Receives the hand-off word
/// of the thread switched away from, and an opaque argument supplied at
/// [`TaskContext::prepare`] time. Never returns; a thread leaves the CPU
/// for the last time through the scheduler, not by returning.
pub type EntryFn = fn(prev: usize, arg: usize) -> !;

#[cfg(target_os = "none")]
mod backend {
    use super::EntryFn;
    use kerror::KResult;

    /// Context-switch backend for kernel targets.
    #[crate_interface::def_interface]
    pub trait ContextIf {
        /// Lay out the initial frames on a fresh kernel stack so the first
        /// dispatch enters `entry(prev, arg)`. Returns the prepared stack
        /// pointer.
        fn init_stack(stack_top: usize, entry: EntryFn, arg: usize) -> usize;

        /// Swap stacks: save into `from_sp`, resume `to_sp`. Returns the
        /// hand-off word once this context is resumed.
        fn context_switch(from_sp: *mut usize, to_sp: usize, handoff: usize) -> usize;

        /// Resume `to_sp` without saving the current context.
        fn context_finish(to_sp: usize, handoff: usize) -> !;
    }

    extern crate alloc;

    use alloc::sync::Arc;
    use core::cell::Cell;

    #[derive(Clone)]
    pub struct TaskContext {
        sp: Arc<Cell<usize>>,
    }

    // The scheduler only touches contexts with interrupts disabled.
    unsafe impl Send for TaskContext {}
    unsafe impl Sync for TaskContext {}

    impl TaskContext {
        pub fn adopt() -> Self {
            // The initial thread's context is filled in by its first
            // switch-out.
            Self { sp: Arc::new(Cell::new(0)) }
        }

        pub fn prepare(_name: &str, stack_top: usize, entry: EntryFn, arg: usize) -> KResult<Self> {
            let sp = crate_interface::call_interface!(ContextIf::init_stack, stack_top, entry, arg);
            Ok(Self { sp: Arc::new(Cell::new(sp)) })
        }
    }

    pub fn switch(cur: &TaskContext, handoff: usize, next: &TaskContext) -> usize {
        let from = cur.sp.as_ptr();
        crate_interface::call_interface!(ContextIf::context_switch, from, next.sp.get(), handoff)
    }

    pub fn finish(handoff: usize, next: &TaskContext) -> ! {
        crate_interface::call_interface!(ContextIf::context_finish, next.sp.get(), handoff)
    }
}

#[cfg(not(target_os = "none"))]
mod backend {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, OnceLock};
    use std::thread;

    use kerror::{KError, KResult};

    use super::EntryFn;

    /// The hand-off word of the most recent switch. A single cell suffices:
    /// on one CPU, the thread resumed by a switch reads the word before any
    /// other switch can happen.
    static HANDOFF: AtomicUsize = AtomicUsize::new(0);

    struct Carrier {
        /// The run token. Set by the thread switching away, consumed by the
        /// owner when it resumes.
        token: AtomicBool,
        /// Park handle of the host thread carrying this context.
        host: OnceLock<thread::Thread>,
    }

    impl Carrier {
        fn grant(&self) {
            self.token.store(true, Ordering::SeqCst);
            if let Some(host) = self.host.get() {
                host.unpark();
            }
        }

        fn wait(&self) {
            // `park` may wake spuriously, and the token may be granted
            // before the carrier first parks; both are covered by the loop.
            while !self.token.swap(false, Ordering::SeqCst) {
                thread::park();
            }
        }
    }

    #[derive(Clone)]
    pub struct TaskContext {
        carrier: Arc<Carrier>,
    }

    impl TaskContext {
        pub fn adopt() -> Self {
            let carrier = Arc::new(Carrier {
                token: AtomicBool::new(false),
                host: OnceLock::new(),
            });
            let _ = carrier.host.set(thread::current());
            Self { carrier }
        }

        pub fn prepare(name: &str, _stack_top: usize, entry: EntryFn, arg: usize) -> KResult<Self> {
            let carrier = Arc::new(Carrier {
                token: AtomicBool::new(false),
                host: OnceLock::new(),
            });
            let theirs = carrier.clone();
            thread::Builder::new()
                .name(name.into())
                .spawn(move || {
                    let _ = theirs.host.set(thread::current());
                    theirs.wait();
                    let prev = HANDOFF.load(Ordering::SeqCst);
                    entry(prev, arg);
                })
                .map_err(|_| KError::NoMemory)?;
            Ok(Self { carrier })
        }
    }

    pub fn switch(cur: &TaskContext, handoff: usize, next: &TaskContext) -> usize {
        HANDOFF.store(handoff, Ordering::SeqCst);
        next.carrier.grant();
        cur.carrier.wait();
        HANDOFF.load(Ordering::SeqCst)
    }

    pub fn finish(handoff: usize, next: &TaskContext) -> ! {
        HANDOFF.store(handoff, Ordering::SeqCst);
        next.carrier.grant();
        // This carrier's thread is dead to the scheduler; its page is about
        // to be reaped by the successor. Parking forever keeps the host
        // thread from touching anything further.
        loop {
            thread::park();
        }
    }
}

/// A thread's saved execution context.
///
/// Opaque to the scheduler: it is created, switched to, and switched from.
/// Cloning yields another handle to the same context, so the scheduler can
/// take handles out of its locked state before performing the switch.
#[derive(Clone)]
pub struct TaskContext {
    inner: backend::TaskContext,
}

impl TaskContext {
    /// Captures the currently executing code as a context. Used exactly
    /// once, for the initial thread.
    pub fn adopt() -> Self {
        Self { inner: backend::TaskContext::adopt() }
    }

    /// Prepares a context that will enter `entry(prev, arg)` on its first
    /// dispatch. `stack_top` is the prepared top of the thread's kernel
    /// stack.
    pub fn prepare(name: &str, stack_top: usize, entry: EntryFn, arg: usize) -> KResult<Self> {
        Ok(Self {
            inner: backend::TaskContext::prepare(name, stack_top, entry, arg)?,
        })
    }
}

impl core::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.write_str("TaskContext")
    }
}

/// Suspends the current context and resumes `next`, publishing `handoff`
/// as the word identifying the suspended thread. Returns, when this
/// context is eventually resumed, the hand-off word of the thread that
/// switched to it.
///
/// Must be called with interrupts disabled and the current thread already
/// in a non-running state.
pub fn switch(cur: &TaskContext, handoff: usize, next: &TaskContext) -> usize {
    backend::switch(&cur.inner, handoff, &next.inner)
}

/// Resumes `next` without saving the current context. The calling thread
/// never runs again.
pub fn finish(handoff: usize, next: &TaskContext) -> ! {
    backend::finish(handoff, &next.inner)
}
