// SPDX-License-Identifier: Apache-2.0

//! Page-granular memory for kernel stacks.
//!
//! The scheduler allocates exactly one zeroed page per thread and frees it
//! when the thread dies. [`KernelPage`] is the RAII wrapper for that page;
//! dropping it returns the page to the allocator.

use kerror::{KError, KResult};

/// Size of one kernel page, in bytes.
pub const PAGE_SIZE: usize = 4096;

#[cfg(target_os = "none")]
mod backend {
    /// Page allocator backend for kernel targets.
    #[crate_interface::def_interface]
    pub trait PageAllocIf {
        /// Allocate one zeroed page; returns its base address, or 0 when
        /// memory is exhausted.
        fn alloc_zeroed_page() -> usize;

        /// Free a page previously returned by
        /// [`alloc_zeroed_page`](PageAllocIf::alloc_zeroed_page).
        fn free_page(base: usize);
    }

    pub struct RawPage(pub usize);

    pub fn alloc() -> Option<RawPage> {
        let base = crate_interface::call_interface!(PageAllocIf::alloc_zeroed_page);
        if base == 0 { None } else { Some(RawPage(base)) }
    }

    pub fn free(page: &mut RawPage) {
        crate_interface::call_interface!(PageAllocIf::free_page, page.0);
    }

    pub fn slice(page: &RawPage) -> &[u8] {
        unsafe { core::slice::from_raw_parts(page.0 as *const u8, super::PAGE_SIZE) }
    }

    pub fn slice_mut(page: &mut RawPage) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(page.0 as *mut u8, super::PAGE_SIZE) }
    }
}

#[cfg(not(target_os = "none"))]
mod backend {
    use core::sync::atomic::{AtomicUsize, Ordering};

    /// Pages currently allocated.
    static LIVE: AtomicUsize = AtomicUsize::new(0);
    /// Pages freed since boot.
    static FREED: AtomicUsize = AtomicUsize::new(0);
    /// Countdown of injected allocation failures.
    static FAIL_NEXT: AtomicUsize = AtomicUsize::new(0);

    pub struct RawPage(Box<[u8]>);

    pub fn alloc() -> Option<RawPage> {
        if FAIL_NEXT
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return None;
        }
        LIVE.fetch_add(1, Ordering::SeqCst);
        Some(RawPage(vec![0u8; super::PAGE_SIZE].into_boxed_slice()))
    }

    pub fn free(_page: &mut RawPage) {
        LIVE.fetch_sub(1, Ordering::SeqCst);
        FREED.fetch_add(1, Ordering::SeqCst);
    }

    pub fn slice(page: &RawPage) -> &[u8] {
        &page.0
    }

    pub fn slice_mut(page: &mut RawPage) -> &mut [u8] {
        &mut page.0
    }

    pub fn live() -> usize {
        LIVE.load(Ordering::SeqCst)
    }

    pub fn freed() -> usize {
        FREED.load(Ordering::SeqCst)
    }

    pub fn fail_next(n: usize) {
        FAIL_NEXT.store(n, Ordering::SeqCst);
    }

    pub(crate) fn reset() {
        LIVE.store(0, Ordering::SeqCst);
        FREED.store(0, Ordering::SeqCst);
        FAIL_NEXT.store(0, Ordering::SeqCst);
    }
}

/// A RAII wrapper for one zeroed kernel page.
///
/// Automatically returns the page to the allocator when dropped.
pub struct KernelPage {
    raw: backend::RawPage,
}

impl KernelPage {
    /// Allocates one zeroed page.
    pub fn alloc_zero() -> KResult<Self> {
        match backend::alloc() {
            Some(raw) => Ok(Self { raw }),
            None => Err(KError::NoMemory),
        }
    }

    /// Total size of the page, in bytes.
    pub fn size(&self) -> usize {
        PAGE_SIZE
    }

    /// Returns a slice for reading the page.
    pub fn as_slice(&self) -> &[u8] {
        backend::slice(&self.raw)
    }

    /// Returns a mutable slice for writing the page.
    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        backend::slice_mut(&mut self.raw)
    }
}

impl Drop for KernelPage {
    fn drop(&mut self) {
        backend::free(&mut self.raw);
    }
}

impl core::fmt::Debug for KernelPage {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("KernelPage").field("size", &PAGE_SIZE).finish()
    }
}

/// Number of pages currently allocated (hosted builds).
#[cfg(not(target_os = "none"))]
pub fn live_pages() -> usize {
    backend::live()
}

/// Number of pages freed since boot (hosted builds).
#[cfg(not(target_os = "none"))]
pub fn freed_pages() -> usize {
    backend::freed()
}

/// Makes the next `n` page allocations fail with [`KError::NoMemory`]
/// (hosted builds).
#[cfg(not(target_os = "none"))]
pub fn fail_next_allocs(n: usize) {
    backend::fail_next(n);
}

#[cfg(not(target_os = "none"))]
pub(crate) fn reset_sim() {
    backend::reset();
}

#[cfg(test)]
mod tests {
    use super::*;

    // Counters and the failure countdown are process-global.
    static SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn pages_are_zeroed_and_counted() {
        let _s = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        let before = live_pages();
        let page = KernelPage::alloc_zero().unwrap();
        assert_eq!(page.size(), PAGE_SIZE);
        assert!(page.as_slice().iter().all(|&b| b == 0));
        assert_eq!(live_pages(), before + 1);
        drop(page);
        assert_eq!(live_pages(), before);
    }

    #[test]
    fn failure_injection_counts_down() {
        let _s = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        fail_next_allocs(2);
        assert_eq!(KernelPage::alloc_zero().unwrap_err(), KError::NoMemory);
        assert_eq!(KernelPage::alloc_zero().unwrap_err(), KError::NoMemory);
        let page = KernelPage::alloc_zero();
        assert!(page.is_ok());
    }
}
