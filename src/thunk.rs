//! Return thunks for function-exit interception.
//!
//! A thunk is a small executable record: `call <dispatcher>` followed by a
//! slot holding the real return address. Entry hooks swap a function's
//! return address for a thunk; when the function returns into the thunk the
//! dispatcher reads the cycle counter, finds the owning factory through the
//! page header, notifies the delegate, and resumes at the real caller.
//!
//! Thunks live on pages of executable memory. Each page starts with a header
//! linking it to its neighbours and to the factory, followed by an array of
//! thunks. Thunks are handed out and recycled in LIFO order, matching the
//! nesting of calls on one thread.

use std::ptr;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::memory::{ExecutableMemory, ALLOCATION_GRANULARITY};

/// Length of the `call rel32` opening every thunk.
pub const CALL_SIZE: usize = 5;

/// `ud2`, written at the end of every page. Thunks call it when the
/// factory has no dispatcher.
const TRAP: [u8; 2] = [0x0F, 0x0B];

/// Pages are aligned to this, so a thunk's page header is found by masking.
pub const THUNK_PAGE_ALIGNMENT: usize = ALLOCATION_GRANULARITY;

/// One thunk record, as laid out in executable memory.
#[repr(C, packed)]
pub struct Thunk {
    call: u8,
    displacement: i32,
    caller: usize,
}

impl Thunk {
    /// The real return address recorded for this thunk.
    ///
    /// # Safety
    /// `thunk` must point at a live thunk.
    pub unsafe fn caller(thunk: *const Thunk) -> usize {
        ptr::addr_of!((*thunk).caller).read_unaligned()
    }

    /// Where the thunk's `call` lands, or `None` if the record is not a call.
    ///
    /// # Safety
    /// `thunk` must point at a live thunk.
    pub unsafe fn call_target(thunk: *const Thunk) -> Option<usize> {
        if ptr::addr_of!((*thunk).call).read() != 0xE8 {
            return None;
        }
        let displacement = ptr::addr_of!((*thunk).displacement).read_unaligned();
        Some((thunk as usize + CALL_SIZE).wrapping_add(displacement as isize as usize))
    }
}

const THUNK_STRIDE: usize = std::mem::size_of::<Thunk>();

#[repr(C)]
struct PageHeader {
    factory: *mut ThunkFactory,
    prev: *mut PageHeader,
    next: *mut PageHeader,
}

const FIRST_THUNK_OFFSET: usize = std::mem::size_of::<PageHeader>();

/// Receives factory events.
pub trait ThunkDelegate {
    fn on_page_added(&self, _page: *const u8) {}
    fn on_page_removed(&self, _page: *const u8) {}
    /// Called when a function returns through `thunk`.
    fn on_function_exit(&self, thunk: *const Thunk, cycles: u64);
}

#[derive(Clone, Copy, Debug)]
pub struct ThunkFactoryConfig {
    /// Size of each page, a power of two of at least 4 KiB and no more than
    /// [`THUNK_PAGE_ALIGNMENT`].
    pub page_size: usize,
    /// Address the thunks call into. Defaults to the built-in dispatcher
    /// where one exists; `None` points each thunk at its page's trap.
    pub dispatcher: Option<usize>,
}

impl Default for ThunkFactoryConfig {
    fn default() -> Self {
        Self {
            page_size: crate::memory::PAGE_SIZE,
            dispatcher: default_dispatcher(),
        }
    }
}

#[cfg(all(windows, target_arch = "x86"))]
fn default_dispatcher() -> Option<usize> {
    extern "C" {
        fn hotpatch_thunk_dispatcher();
    }
    Some(hotpatch_thunk_dispatcher as usize)
}

#[cfg(not(all(windows, target_arch = "x86")))]
fn default_dispatcher() -> Option<usize> {
    None
}

/// Hands out return thunks from a chain of executable pages.
///
/// A factory belongs to one thread. It is boxed so that the back-pointer in
/// each page header stays valid.
pub struct ThunkFactory {
    config: ThunkFactoryConfig,
    delegate: Box<dyn ThunkDelegate>,
    pages: Vec<ExecutableMemory>,
    first_page: *mut PageHeader,
    current_page: *mut PageHeader,
    next_thunk: *mut Thunk,
}

impl ThunkFactory {
    pub fn new(config: ThunkFactoryConfig, delegate: Box<dyn ThunkDelegate>) -> Box<Self> {
        assert!(
            config.page_size.is_power_of_two()
                && config.page_size >= crate::memory::PAGE_SIZE
                && config.page_size <= THUNK_PAGE_ALIGNMENT,
            "invalid thunk page size {}",
            config.page_size
        );
        Box::new(Self {
            config,
            delegate,
            pages: Vec::new(),
            first_page: ptr::null_mut(),
            current_page: ptr::null_mut(),
            next_thunk: ptr::null_mut(),
        })
    }

    /// Number of thunks that fit on one page.
    pub fn thunks_per_page(&self) -> usize {
        (self.config.page_size - FIRST_THUNK_OFFSET - TRAP.len()) / THUNK_STRIDE
    }

    /// The trap at the end of `page`.
    fn trap(&self, page: *mut PageHeader) -> usize {
        page as usize + self.config.page_size - TRAP.len()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn first_thunk(page: *mut PageHeader) -> *mut Thunk {
        (page as usize + FIRST_THUNK_OFFSET) as *mut Thunk
    }

    fn page_end(&self, page: *mut PageHeader) -> *mut Thunk {
        (Self::first_thunk(page) as usize + self.thunks_per_page() * THUNK_STRIDE) as *mut Thunk
    }

    /// The rel32 from the end of a call at `thunk` to `target`, if it fits.
    fn call_displacement(thunk: usize, target: usize) -> Result<i32> {
        let call_end = (thunk + CALL_SIZE) as i128;
        i32::try_from(target as i128 - call_end).map_err(|_| Error::DispatcherOutOfRange {
            dispatcher: target,
            thunk,
        })
    }

    /// Allocate a page, fill it with thunks, and append it to the chain.
    fn add_page(&mut self) -> Result<*mut PageHeader> {
        let memory = ExecutableMemory::allocate_aligned(self.config.page_size, THUNK_PAGE_ALIGNMENT)
            .ok_or(Error::ThunkPageAllocation)?;
        let page = memory.base() as *mut PageHeader;
        let target = self.config.dispatcher.unwrap_or_else(|| self.trap(page));
        let first = Self::first_thunk(page) as usize;
        let last_thunk = first + (self.thunks_per_page() - 1) * THUNK_STRIDE;
        let first_displacement = Self::call_displacement(first, target)?;
        Self::call_displacement(last_thunk, target)?;

        let last = self.pages.last().map_or(ptr::null_mut(), |m| m.base() as *mut PageHeader);

        // SAFETY: the page is freshly allocated, writable and large enough
        // for the header and `thunks_per_page` records.
        unsafe {
            page.write(PageHeader {
                factory: self as *mut ThunkFactory,
                prev: last,
                next: ptr::null_mut(),
            });
            if !last.is_null() {
                (*last).next = page;
            }

            ptr::copy_nonoverlapping(TRAP.as_ptr(), self.trap(page) as *mut u8, TRAP.len());

            let mut thunk = Self::first_thunk(page);
            for i in 0..self.thunks_per_page() {
                let displacement = first_displacement - (i * THUNK_STRIDE) as i32;
                ptr::addr_of_mut!((*thunk).call).write(0xE8);
                ptr::addr_of_mut!((*thunk).displacement).write_unaligned(displacement);
                ptr::addr_of_mut!((*thunk).caller).write_unaligned(0);
                thunk = (thunk as usize + THUNK_STRIDE) as *mut Thunk;
            }
        }
        memory.flush(0, memory.size());

        if self.first_page.is_null() {
            self.first_page = page;
        }
        self.pages.push(memory);
        self.delegate.on_page_added(page as *const u8);
        debug!(page = format_args!("{:p}", page), pages = self.pages.len(), "added thunk page");
        Ok(page)
    }

    /// Take the next free thunk and record `real_ret` in it. Fails if a new
    /// page was needed and could not be allocated, or if the dispatcher is
    /// out of `call rel32` range of it.
    pub fn make_thunk(&mut self, real_ret: usize) -> Result<*mut Thunk> {
        if self.current_page.is_null() {
            let page = self.add_page()?;
            self.current_page = page;
            self.next_thunk = Self::first_thunk(page);
        } else if self.next_thunk == self.page_end(self.current_page) {
            // SAFETY: `current_page` is a live page header.
            let next = unsafe { (*self.current_page).next };
            let page = if next.is_null() { self.add_page()? } else { next };
            self.current_page = page;
            self.next_thunk = Self::first_thunk(page);
        }

        let thunk = self.next_thunk;
        // SAFETY: `thunk` lies within the current page's thunk array.
        unsafe { ptr::addr_of_mut!((*thunk).caller).write_unaligned(real_ret) };
        self.next_thunk = (thunk as usize + THUNK_STRIDE) as *mut Thunk;
        trace!(thunk = format_args!("{:p}", thunk), real_ret = format_args!("{real_ret:#x}"), "made thunk");
        Ok(thunk)
    }

    /// Replace the return address in `*return_slot` with a fresh thunk.
    ///
    /// # Safety
    /// `return_slot` must point at a writable return address.
    pub unsafe fn on_function_entry(&mut self, return_slot: *mut usize) -> Result<*mut Thunk> {
        let thunk = self.make_thunk(*return_slot)?;
        *return_slot = thunk as usize;
        Ok(thunk)
    }

    /// The thunk starting at `addr`, if `addr` is one of ours.
    pub fn cast_to_thunk(&self, addr: usize) -> Option<*mut Thunk> {
        let mut page = self.first_page;
        while !page.is_null() {
            let first = Self::first_thunk(page) as usize;
            let end = self.page_end(page) as usize;
            if addr >= first && addr < end {
                return ((addr - first) % THUNK_STRIDE == 0).then_some(addr as *mut Thunk);
            }
            // SAFETY: `page` is a live page header.
            page = unsafe { (*page).next };
        }
        None
    }

    /// A function returned through `thunk`: recycle it and everything handed
    /// out after it, notify the delegate, and yield the real return address.
    pub fn on_thunk_return(&mut self, thunk: *mut Thunk, cycles: u64) -> usize {
        debug_assert!(self.cast_to_thunk(thunk as usize).is_some(), "foreign thunk");
        // SAFETY: `thunk` is one of this factory's live thunks.
        let caller = unsafe { Thunk::caller(thunk) };
        self.current_page = Self::page_of(thunk);
        self.next_thunk = thunk;
        self.delegate.on_function_exit(thunk, cycles);
        caller
    }

    fn page_of(thunk: *const Thunk) -> *mut PageHeader {
        (thunk as usize & !(THUNK_PAGE_ALIGNMENT - 1)) as *mut PageHeader
    }

    /// Route a return through a thunk to its factory.
    ///
    /// `frame` is the stack slot holding the return address pushed by the
    /// thunk's `call`. Returns the real return address.
    ///
    /// # Safety
    /// `*frame` must be `thunk + CALL_SIZE` for a live thunk whose factory
    /// is not otherwise borrowed.
    pub unsafe fn dispatch_return(frame: *const usize, cycles: u64) -> usize {
        let thunk = (*frame - CALL_SIZE) as *mut Thunk;
        let factory = (*Self::page_of(thunk)).factory;
        (*factory).on_thunk_return(thunk, cycles)
    }
}

impl Drop for ThunkFactory {
    fn drop(&mut self) {
        for memory in self.pages.drain(..).rev() {
            self.delegate.on_page_removed(memory.base() as *const u8);
        }
    }
}

/// Current value of the processor's cycle counter, or a monotonic
/// nanosecond count where there is none.
pub fn read_cycle_counter() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: rdtsc has no preconditions.
        unsafe { std::arch::x86_64::_rdtsc() }
    }

    #[cfg(target_arch = "x86")]
    {
        // SAFETY: rdtsc has no preconditions.
        unsafe { std::arch::x86::_rdtsc() }
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    {
        use std::sync::OnceLock;
        use std::time::Instant;
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }
}

// On entry `[esp]` holds `thunk + 5`. Volatile registers and flags are
// saved, the handler returns the real return address in eax, and that
// address replaces the thunk's slot before returning through it.
#[cfg(all(windows, target_arch = "x86"))]
std::arch::global_asm!(
    ".globl _hotpatch_thunk_dispatcher",
    "_hotpatch_thunk_dispatcher:",
    "push eax",
    "push ecx",
    "push edx",
    "pushfd",
    "rdtsc",
    "push edx",
    "push eax",
    "lea eax, [esp + 24]",
    "push eax",
    "call {handler}",
    "mov [esp + 16], eax",
    "popfd",
    "pop edx",
    "pop ecx",
    "pop eax",
    "ret",
    handler = sym thunk_dispatcher_return,
);

#[cfg(all(windows, target_arch = "x86"))]
extern "stdcall" fn thunk_dispatcher_return(frame: *const usize, cycles: u64) -> usize {
    // SAFETY: only reached through a thunk's call into the dispatcher.
    unsafe { ThunkFactory::dispatch_return(frame, cycles) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Recorder {
        exits: RefCell<Vec<(usize, u64)>>,
        pages_added: RefCell<usize>,
        pages_removed: RefCell<usize>,
    }

    struct SharedRecorder(Rc<Recorder>);

    impl ThunkDelegate for SharedRecorder {
        fn on_page_added(&self, _page: *const u8) {
            *self.0.pages_added.borrow_mut() += 1;
        }

        fn on_page_removed(&self, _page: *const u8) {
            *self.0.pages_removed.borrow_mut() += 1;
        }

        fn on_function_exit(&self, thunk: *const Thunk, cycles: u64) {
            self.0.exits.borrow_mut().push((thunk as usize, cycles));
        }
    }

    fn factory() -> (Box<ThunkFactory>, Rc<Recorder>) {
        let recorder = Rc::new(Recorder::default());
        let factory = ThunkFactory::new(
            ThunkFactoryConfig::default(),
            Box::new(SharedRecorder(recorder.clone())),
        );
        (factory, recorder)
    }

    #[test]
    fn test_thunk_layout() {
        let (mut factory, recorder) = factory();
        let thunk = factory.make_thunk(0x1234).unwrap();
        assert_eq!(*recorder.pages_added.borrow(), 1);
        assert_eq!(thunk as usize % THUNK_PAGE_ALIGNMENT, FIRST_THUNK_OFFSET);

        let page = ThunkFactory::page_of(thunk);
        let expected = default_dispatcher().unwrap_or_else(|| factory.trap(page));
        unsafe {
            assert_eq!(Thunk::call_target(thunk), Some(expected));
            assert_eq!(Thunk::caller(thunk), 0x1234);
            if default_dispatcher().is_none() {
                let trap = std::slice::from_raw_parts(expected as *const u8, TRAP.len());
                assert_eq!(trap, &TRAP);
            }
        }

        let last = factory.page_end(page) as usize - THUNK_STRIDE;
        assert!(last + THUNK_STRIDE <= factory.trap(page));
        assert_eq!(unsafe { Thunk::call_target(last as *const Thunk) }, Some(expected));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_far_dispatcher_rejected() {
        let recorder = Rc::new(Recorder::default());
        let mut factory = ThunkFactory::new(
            ThunkFactoryConfig {
                dispatcher: Some(usize::MAX / 2),
                ..ThunkFactoryConfig::default()
            },
            Box::new(SharedRecorder(recorder.clone())),
        );
        assert!(matches!(
            factory.make_thunk(0x1234),
            Err(Error::DispatcherOutOfRange { .. })
        ));
        assert_eq!(factory.page_count(), 0);
        assert_eq!(*recorder.pages_added.borrow(), 0);
    }

    #[test]
    fn test_recycle_is_lifo() {
        let (mut factory, recorder) = factory();
        let t1 = factory.make_thunk(0xAABB).unwrap();

        let slot = t1 as usize + CALL_SIZE;
        let first = read_cycle_counter();
        let ret = unsafe { ThunkFactory::dispatch_return(&slot, first) };
        assert_eq!(ret, 0xAABB);
        assert_eq!(recorder.exits.borrow().as_slice(), &[(t1 as usize, first)]);

        let t2 = factory.make_thunk(0xCCDD).unwrap();
        assert_eq!(t1, t2);

        let second = read_cycle_counter();
        assert!(second >= first);
        assert_eq!(factory.on_thunk_return(t2, second), 0xCCDD);
    }

    #[test]
    fn test_nested_thunks_unwind_in_order() {
        let (mut factory, _) = factory();
        let outer = factory.make_thunk(1).unwrap();
        let inner = factory.make_thunk(2).unwrap();
        assert_eq!(inner as usize, outer as usize + THUNK_STRIDE);

        assert_eq!(factory.on_thunk_return(inner, 0), 2);
        assert_eq!(factory.on_thunk_return(outer, 0), 1);
        assert_eq!(factory.make_thunk(3).unwrap(), outer);
    }

    #[test]
    fn test_pages_chain_and_reuse() {
        let (mut factory, recorder) = factory();
        let per_page = factory.thunks_per_page();
        let thunks: Vec<_> = (0..=per_page).map(|i| factory.make_thunk(i).unwrap()).collect();
        assert_eq!(factory.page_count(), 2);

        // Unwind back onto the first page, then fill it again: the second
        // page is reused rather than reallocated.
        factory.on_thunk_return(thunks[0], 0);
        for i in 0..=per_page {
            factory.make_thunk(i).unwrap();
        }
        assert_eq!(factory.page_count(), 2);

        drop(factory);
        assert_eq!(*recorder.pages_removed.borrow(), 2);
    }

    #[test]
    fn test_cast_to_thunk() {
        let (mut factory, _) = factory();
        let thunk = factory.make_thunk(7).unwrap();
        assert_eq!(factory.cast_to_thunk(thunk as usize), Some(thunk));
        assert_eq!(factory.cast_to_thunk(thunk as usize + 1), None);

        let local = 0u32;
        assert_eq!(factory.cast_to_thunk(&local as *const u32 as usize), None);
    }

    #[test]
    fn test_function_entry_swaps_return_address() {
        let (mut factory, _) = factory();
        let mut slot = 0x4242usize;
        let thunk = unsafe { factory.on_function_entry(&mut slot) }.unwrap();
        assert_eq!(slot, thunk as usize);
        assert_eq!(factory.on_thunk_return(thunk, 0), 0x4242);
    }
}
