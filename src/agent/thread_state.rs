//! Per-thread agent state: slots to find it from a hook, and a manager that
//! owns it.

use std::ffi::c_void;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

/// A process-wide TLS index.
#[derive(Debug)]
pub struct TlsSlot {
    index: u32,
    owned: bool,
}

#[cfg(target_os = "windows")]
impl TlsSlot {
    pub fn allocate() -> Result<Self> {
        use windows::Win32::System::Threading::{TlsAlloc, TLS_OUT_OF_INDEXES};

        let index = unsafe { TlsAlloc() };
        if index == TLS_OUT_OF_INDEXES {
            return Err(windows::core::Error::from_win32().into());
        }
        Ok(Self { index, owned: true })
    }

    pub fn get(&self) -> *mut c_void {
        unsafe { windows::Win32::System::Threading::TlsGetValue(self.index) }
    }

    pub fn set(&self, value: *mut c_void) {
        let value = (!value.is_null()).then_some(value as *const c_void);
        unsafe {
            let _ = windows::Win32::System::Threading::TlsSetValue(self.index, value);
        }
    }

    fn free(&self) {
        unsafe {
            let _ = windows::Win32::System::Threading::TlsFree(self.index);
        }
    }
}

#[cfg(not(target_os = "windows"))]
mod emulated {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    static NEXT_INDEX: AtomicU32 = AtomicU32::new(0);

    thread_local! {
        static VALUES: RefCell<HashMap<u32, usize>> = RefCell::new(HashMap::new());
    }

    pub fn allocate() -> u32 {
        NEXT_INDEX.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(index: u32) -> usize {
        VALUES
            .try_with(|values| values.borrow().get(&index).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn set(index: u32, value: usize) {
        let _ = VALUES.try_with(|values| {
            let mut values = values.borrow_mut();
            if value == 0 {
                values.remove(&index);
            } else {
                values.insert(index, value);
            }
        });
    }
}

#[cfg(not(target_os = "windows"))]
impl TlsSlot {
    pub fn allocate() -> Result<Self> {
        Ok(Self {
            index: emulated::allocate(),
            owned: true,
        })
    }

    pub fn get(&self) -> *mut c_void {
        emulated::get(self.index) as *mut c_void
    }

    pub fn set(&self, value: *mut c_void) {
        emulated::set(self.index, value as usize);
    }

    // Indices are never reused, so stale values stay unreachable.
    fn free(&self) {}
}

impl TlsSlot {
    /// Borrow an index allocated elsewhere, e.g. one stored in module data.
    pub fn from_index(index: u32) -> Self {
        Self { index, owned: false }
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for TlsSlot {
    fn drop(&mut self) {
        if self.owned {
            self.free();
        }
    }
}

/// One of the four user-application slots in the x86 TEB, at
/// `fs:[0x700 + 4 * (slot - 1)]`.
#[derive(Debug)]
pub struct FsSlot {
    slot: u32,
}

impl FsSlot {
    pub const FIRST_OFFSET: u32 = 0x700;
    pub const COUNT: u32 = 4;

    /// Claim `slot` (1-based) for this agent. The calling thread's slot must
    /// currently be empty.
    pub fn claim(slot: u32) -> Result<Self> {
        if !(1..=Self::COUNT).contains(&slot) {
            return Err(Error::ModuleDataMismatch(format!("FS slot {slot} is out of range")));
        }
        let claimed = Self { slot };
        if claimed.get() != 0 {
            return Err(Error::SlotInUse(slot));
        }
        Ok(claimed)
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn offset(&self) -> u32 {
        Self::FIRST_OFFSET + 4 * (self.slot - 1)
    }
}

#[cfg(all(target_os = "windows", target_arch = "x86", feature = "fs-slot"))]
impl FsSlot {
    pub fn get(&self) -> usize {
        let value: usize;
        unsafe {
            std::arch::asm!(
                "mov {value}, fs:[{offset}]",
                value = out(reg) value,
                offset = in(reg) self.offset(),
                options(nostack, readonly, preserves_flags),
            );
        }
        value
    }

    pub fn set(&self, value: usize) {
        unsafe {
            std::arch::asm!(
                "mov fs:[{offset}], {value}",
                value = in(reg) value,
                offset = in(reg) self.offset(),
                options(nostack, preserves_flags),
            );
        }
    }
}

// Without the TEB the slot is modelled per thread, which keeps the claim
// rules testable.
#[cfg(not(all(target_os = "windows", target_arch = "x86", feature = "fs-slot")))]
thread_local! {
    static FS_SLOTS: std::cell::Cell<[usize; 4]> = const { std::cell::Cell::new([0; 4]) };
}

#[cfg(not(all(target_os = "windows", target_arch = "x86", feature = "fs-slot")))]
impl FsSlot {
    pub fn get(&self) -> usize {
        FS_SLOTS.with(|slots| slots.get()[self.slot as usize - 1])
    }

    pub fn set(&self, value: usize) {
        FS_SLOTS.with(|slots| {
            let mut values = slots.get();
            values[self.slot as usize - 1] = value;
            slots.set(values);
        });
    }
}

struct Registry<T> {
    active: Vec<Box<T>>,
    dead: Vec<Box<T>>,
}

/// Owns per-thread states. Threads hold raw pointers to their own state; a
/// state marked for death is freed at the next registration, scavenge or
/// drop, after its thread has stopped calling in.
pub struct ThreadStateManager<T> {
    registry: Mutex<Registry<T>>,
}

impl<T> Default for ThreadStateManager<T> {
    fn default() -> Self {
        Self {
            registry: Mutex::new(Registry {
                active: Vec::new(),
                dead: Vec::new(),
            }),
        }
    }
}

impl<T> ThreadStateManager<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `state` and return a stable pointer to it.
    pub fn register(&self, state: Box<T>) -> *mut T {
        let mut registry = self.registry.lock();
        registry.dead.clear();
        let mut state = state;
        let ptr: *mut T = &mut *state;
        registry.active.push(state);
        ptr
    }

    /// Move a state to the dead list. Returns false if it is not active.
    pub fn mark_for_death(&self, state: *const T) -> bool {
        let mut registry = self.registry.lock();
        match registry.active.iter().position(|s| std::ptr::eq(&**s, state)) {
            Some(index) => {
                let state = registry.active.swap_remove(index);
                registry.dead.push(state);
                true
            }
            None => false,
        }
    }

    /// Free dead states. Returns how many were freed.
    pub fn scavenge(&self) -> usize {
        let mut registry = self.registry.lock();
        let freed = registry.dead.len();
        registry.dead.clear();
        if freed > 0 {
            debug!(freed, "scavenged thread states");
        }
        freed
    }

    pub fn active_count(&self) -> usize {
        self.registry.lock().active.len()
    }

    pub fn dead_count(&self) -> usize {
        self.registry.lock().dead.len()
    }

    /// Run `f` on every active state, e.g. to flush at process detach.
    pub fn for_each_active(&self, mut f: impl FnMut(&mut T)) {
        let mut registry = self.registry.lock();
        for state in registry.active.iter_mut() {
            f(state);
        }
    }
}
