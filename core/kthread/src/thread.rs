//! Thread control blocks.
//!
//! Each thread owns one kernel page. The page is the thread's kernel
//! stack: it grows downward from the page's top, and at creation time
//! three startup frames are laid out there so that the first context
//! switch into the thread runs the switch-entry stub, then the
//! kernel-thread trampoline, then the thread's own function. The TCB
//! itself lives in the scheduler arena and carries a magic word; if the
//! stack grows far enough to trash scheduler-owned state, the magic check
//! on every arena access catches it.

use core::mem;

use kfixed::Fixed;
use khal::context::TaskContext;
use khal::mem::{KernelPage, PAGE_SIZE};

use crate::config::{PRI_MAX, PRI_MIN};
use crate::list::{DonaLink, Link, ListHead, Slot};
use crate::sync::LockId;

/// Sentinel stored in every live TCB, checked on every access.
const THREAD_MAGIC: u32 = 0xcd6a_bf4b;

/// Maximum thread name length, including the implicit terminator.
const NAME_LEN: usize = 16;

/// A thread identifier. Unique for the lifetime of the system; never
/// reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Tid(u32);

impl Tid {
    pub(crate) const fn new(raw: u32) -> Self {
        Tid(raw)
    }

    /// The identifier as a plain integer.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for Tid {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A thread's run state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadStatus {
    /// Executing on the CPU.
    Running,
    /// On the ready queue, eligible to run.
    Ready,
    /// Waiting: on a wait queue of some primitive, or on no queue at all.
    Blocked,
    /// About to be destroyed; the successor reaps it in the switch tail.
    Dying,
}

/// Startup frame consumed by the kernel-thread trampoline: a fake return
/// address, the thread function and its argument word.
#[repr(C)]
#[allow(dead_code)]
struct KernelThreadFrame {
    ret: usize,
    function: usize,
    arg: usize,
}

/// Startup frame consumed by the switch-entry stub on first dispatch.
#[repr(C)]
#[allow(dead_code)]
struct SwitchEntryFrame {
    ret: usize,
}

/// Callee-saved register area restored by the context-switch primitive.
#[repr(C)]
#[allow(dead_code)]
struct SwitchFrame {
    saved: [usize; 4],
    ret: usize,
}

/// Lays out the three startup frames top-down on a fresh kernel stack and
/// returns the prepared stack pointer, as a byte offset into the page.
pub(crate) fn prepare_startup_frames() -> usize {
    let mut sp = PAGE_SIZE;
    sp -= mem::size_of::<KernelThreadFrame>();
    sp -= mem::size_of::<SwitchEntryFrame>();
    sp -= mem::size_of::<SwitchFrame>();
    debug_assert_eq!(sp % mem::size_of::<usize>(), 0);
    sp
}

/// A thread control block.
pub struct Thread {
    pub(crate) tid: Tid,
    name: [u8; NAME_LEN],
    pub(crate) status: ThreadStatus,
    /// The thread's kernel page; `None` only for the initial thread, whose
    /// stack predates the scheduler and is never reclaimed.
    pub(crate) page: Option<KernelPage>,
    /// Prepared stack pointer, as a byte offset into the page.
    pub(crate) stack: usize,
    pub(crate) ctx: TaskContext,

    /// Priority last set explicitly (or at creation).
    pub(crate) base_priority: u8,
    /// Effective priority: base or the best donation, whichever is higher.
    pub(crate) priority: u8,
    /// The lock this thread is blocked trying to acquire.
    pub(crate) required_lock: Option<LockId>,
    /// Threads donating to this one, best donor first.
    pub(crate) donations: ListHead<DonaLink>,
    /// The thread currently holding this thread's donation.
    pub(crate) donated_to: Option<Slot>,
    /// Set when a timed wait was withdrawn before it could complete.
    pub(crate) wait_cancelled: bool,

    /// Ready-queue or wait-queue membership.
    pub(crate) ready_link: Link,
    /// All-threads list membership.
    pub(crate) all_link: Link,
    /// Membership in another thread's donor list.
    pub(crate) dona_link: Link,

    pub(crate) nice: i8,
    pub(crate) recent_cpu: Fixed,

    #[cfg(feature = "userprog")]
    pub(crate) aspace: Option<core::num::NonZeroUsize>,

    magic: u32,
}

impl Thread {
    /// Basic initialization as a blocked thread named `name`.
    pub(crate) fn new(name: &str, priority: u8, page: Option<KernelPage>, ctx: TaskContext) -> Self {
        assert!(
            (PRI_MIN..=PRI_MAX).contains(&priority),
            "priority {priority} out of range"
        );
        Self {
            tid: Tid::new(0),
            name: copy_name(name),
            status: ThreadStatus::Blocked,
            page,
            stack: PAGE_SIZE,
            ctx,
            base_priority: priority,
            priority,
            required_lock: None,
            donations: ListHead::new(),
            donated_to: None,
            wait_cancelled: false,
            ready_link: Link::new(),
            all_link: Link::new(),
            dona_link: Link::new(),
            nice: 0,
            recent_cpu: Fixed::ZERO,
            #[cfg(feature = "userprog")]
            aspace: None,
            magic: THREAD_MAGIC,
        }
    }

    /// The thread's identifier.
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// The thread's name.
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("<bad name>")
    }

    /// The thread's run state.
    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    /// Effective priority, the one scheduling decisions use.
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Priority last set explicitly, ignoring donations.
    pub fn base_priority(&self) -> u8 {
        self.base_priority
    }

    /// The thread's nice value.
    pub fn nice(&self) -> i8 {
        self.nice
    }

    /// The thread's decayed CPU-usage figure, times 100.
    pub fn recent_cpu_x100(&self) -> i32 {
        (self.recent_cpu * 100).round()
    }

    pub(crate) fn is_thread(&self) -> bool {
        self.magic == THREAD_MAGIC
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("name", &self.name())
            .field("status", &self.status)
            .field("priority", &self.priority)
            .field("base_priority", &self.base_priority)
            .finish()
    }
}

/// Copies `name` into a fixed NUL-padded buffer, truncating on a char
/// boundary if it is too long.
fn copy_name(name: &str) -> [u8; NAME_LEN] {
    let mut buf = [0u8; NAME_LEN];
    let mut end = name.len().min(NAME_LEN - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    buf[..end].copy_from_slice(&name.as_bytes()[..end]);
    buf
}
