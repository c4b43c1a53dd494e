//! Memory operations: executable regions and tolerant memory reads.
//!
//! Executable regions back the arena writer and the thunk pages. On Windows
//! they come from `VirtualAlloc` with `PAGE_EXECUTE_READWRITE`; on other hosts
//! a page-aligned heap allocation stands in so that layout logic can be
//! exercised anywhere (the bytes are never executed there).

#[cfg(target_os = "windows")]
use crate::error::Result;

#[cfg(target_os = "windows")]
use windows::Win32::{
    System::Diagnostics::Debug::{FlushInstructionCache, ReadProcessMemory},
    System::Memory::{
        VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
    },
    System::Threading::GetCurrentProcess,
    Foundation::{ERROR_PARTIAL_COPY, HANDLE},
};

/// Default page size used for executable allocations.
pub const PAGE_SIZE: usize = 4096;

/// Alignment of every `VirtualAlloc` reservation.
pub const ALLOCATION_GRANULARITY: usize = 0x10000;

/// An owned region of read/write/execute memory.
pub struct ExecutableMemory {
    base: *mut u8,
    size: usize,
    align: usize,
}

// SAFETY: the region is plain memory owned by this value.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

impl ExecutableMemory {
    /// Allocate `size` bytes (rounded up to whole pages). Returns `None` when
    /// the system refuses the allocation.
    pub fn allocate(size: usize) -> Option<Self> {
        Self::allocate_aligned(size, PAGE_SIZE)
    }

    /// Allocate `size` bytes whose base is a multiple of `align`, a power of
    /// two no larger than [`ALLOCATION_GRANULARITY`].
    pub fn allocate_aligned(size: usize, align: usize) -> Option<Self> {
        assert!(align.is_power_of_two() && align <= ALLOCATION_GRANULARITY);
        let align = align.max(PAGE_SIZE);
        let size = size.max(1).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let base = Self::allocate_raw(size, align)?;
        Some(Self { base, size, align })
    }

    #[cfg(target_os = "windows")]
    fn allocate_raw(size: usize, _align: usize) -> Option<*mut u8> {
        // Reservations are always aligned to the allocation granularity.
        let base = unsafe {
            VirtualAlloc(None, size, MEM_COMMIT | MEM_RESERVE, PAGE_EXECUTE_READWRITE)
        } as *mut u8;
        (!base.is_null()).then_some(base)
    }

    #[cfg(not(target_os = "windows"))]
    fn allocate_raw(size: usize, align: usize) -> Option<*mut u8> {
        let layout = std::alloc::Layout::from_size_align(size, align).ok()?;
        // SAFETY: layout has a non-zero size.
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        (!base.is_null()).then_some(base)
    }

    /// Start of the region.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Size of the region in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether `addr` lies inside the region.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base as usize;
        addr >= base && addr < base + self.size
    }

    /// The region as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the region is owned and `size` bytes long.
        unsafe { std::slice::from_raw_parts(self.base, self.size) }
    }

    /// The region as a mutable byte slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the region is owned and `size` bytes long.
        unsafe { std::slice::from_raw_parts_mut(self.base, self.size) }
    }

    /// Make freshly written code in `[offset, offset + len)` visible to the
    /// instruction stream.
    pub fn flush(&self, offset: usize, len: usize) {
        #[cfg(target_os = "windows")]
        unsafe {
            let _ = FlushInstructionCache(
                GetCurrentProcess(),
                Some(self.base.add(offset) as *const _),
                len,
            );
        }

        #[cfg(not(target_os = "windows"))]
        {
            let _ = (offset, len);
        }
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        #[cfg(target_os = "windows")]
        unsafe {
            let _ = VirtualFree(self.base as *mut _, 0, MEM_RELEASE);
        }

        #[cfg(not(target_os = "windows"))]
        unsafe {
            let layout = std::alloc::Layout::from_size_align_unchecked(self.size, self.align);
            std::alloc::dealloc(self.base, layout);
        }
    }
}

impl std::fmt::Debug for ExecutableMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableMemory")
            .field("base", &self.base)
            .field("size", &self.size)
            .finish()
    }
}

/// Read access to the address space of some process.
///
/// Reads are allowed to come back short: the return value is the number of
/// bytes actually copied, and a partial copy is not an error.
pub trait ProcessMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> usize;

    /// Read a little-endian `u32`, if all four bytes are readable.
    fn read_u32(&self, addr: u64) -> Option<u32> {
        let mut buf = [0u8; 4];
        (self.read(addr, &mut buf) == 4).then(|| u32::from_le_bytes(buf))
    }
}

/// Memory of a process opened by handle.
#[cfg(target_os = "windows")]
pub struct RemoteProcessMemory {
    process: HANDLE,
}

#[cfg(target_os = "windows")]
impl RemoteProcessMemory {
    /// Borrow a process handle opened with `PROCESS_VM_READ`.
    pub fn new(process: HANDLE) -> Self {
        Self { process }
    }
}

#[cfg(target_os = "windows")]
impl ProcessMemory for RemoteProcessMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> usize {
        read_process_memory(self.process, addr, buf).unwrap_or(0)
    }
}

/// `ReadProcessMemory` that treats `ERROR_PARTIAL_COPY` as success with the
/// truncated byte count.
#[cfg(target_os = "windows")]
pub fn read_process_memory(process: HANDLE, addr: u64, buf: &mut [u8]) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }

    let mut bytes_read: usize = 0;
    let result = unsafe {
        ReadProcessMemory(
            process,
            addr as usize as *const _,
            buf.as_mut_ptr() as *mut _,
            buf.len(),
            Some(&mut bytes_read),
        )
    };

    match result {
        Ok(()) => Ok(bytes_read),
        Err(err) if err.code() == ERROR_PARTIAL_COPY.to_hresult() => Ok(bytes_read),
        Err(err) => Err(err.into()),
    }
}

/// Memory of the current process. Reads go through [`safe_read_memory`], so
/// an unmapped address yields a short read instead of a fault.
#[derive(Clone, Copy, Debug, Default)]
pub struct CurrentProcessMemory;

impl ProcessMemory for CurrentProcessMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> usize {
        let Ok(addr) = usize::try_from(addr) else {
            return 0;
        };
        if safe_read_memory(addr as *const u8, buf) {
            return buf.len();
        }
        // Copy the readable prefix.
        let mut copied = 0;
        while copied < buf.len()
            && safe_read_memory(addr.wrapping_add(copied) as *const u8, &mut buf[copied..copied + 1])
        {
            copied += 1;
        }
        copied
    }
}

/// Safely read memory from the current process.
#[cfg(target_os = "windows")]
pub fn safe_read_memory(src: *const u8, dst: &mut [u8]) -> bool {
    if dst.is_empty() {
        return true;
    }
    matches!(
        read_process_memory(unsafe { GetCurrentProcess() }, src as u64, dst),
        Ok(n) if n == dst.len()
    )
}

/// Safely read memory from the current process. `/proc/self/mem` reports
/// unmapped pages as `EIO` instead of faulting.
#[cfg(target_os = "linux")]
pub fn safe_read_memory(src: *const u8, dst: &mut [u8]) -> bool {
    use std::os::unix::fs::FileExt;

    if dst.is_empty() {
        return true;
    }
    let Ok(mem) = std::fs::File::open("/proc/self/mem") else {
        return false;
    };
    matches!(mem.read_at(dst, src as u64), Ok(n) if n == dst.len())
}

#[cfg(not(any(target_os = "windows", target_os = "linux")))]
pub fn safe_read_memory(_src: *const u8, dst: &mut [u8]) -> bool {
    dst.is_empty()
}

/// A snapshot of memory regions, used by tests and by the portable stack
/// walker to read from a captured address space.
#[derive(Clone, Debug, Default)]
pub struct MemorySnapshot {
    regions: Vec<(u64, Vec<u8>)>,
}

impl MemorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a region starting at `base`.
    pub fn add_region(&mut self, base: u64, bytes: Vec<u8>) -> &mut Self {
        self.regions.push((base, bytes));
        self.regions.sort_by_key(|(base, _)| *base);
        self
    }
}

impl ProcessMemory for MemorySnapshot {
    fn read(&self, addr: u64, buf: &mut [u8]) -> usize {
        let idx = self.regions.partition_point(|(base, _)| *base <= addr);
        if idx == 0 {
            return 0;
        }
        let (base, bytes) = &self.regions[idx - 1];
        let offset = (addr - base) as usize;
        if offset >= bytes.len() {
            return 0;
        }
        let n = buf.len().min(bytes.len() - offset);
        buf[..n].copy_from_slice(&bytes[offset..offset + n]);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_rounds_to_pages() {
        let mem = ExecutableMemory::allocate(10).unwrap();
        assert_eq!(mem.size(), PAGE_SIZE);
        assert_eq!(mem.base() as usize % PAGE_SIZE, 0);
        assert!(mem.contains(mem.base() as usize));
        assert!(!mem.contains(mem.base() as usize + PAGE_SIZE));
        assert!(mem.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_aligned_allocation() {
        let mem = ExecutableMemory::allocate_aligned(PAGE_SIZE, ALLOCATION_GRANULARITY).unwrap();
        assert_eq!(mem.base() as usize % ALLOCATION_GRANULARITY, 0);
        assert_eq!(mem.size(), PAGE_SIZE);
    }

    #[test]
    fn test_snapshot_partial_read() {
        let mut snapshot = MemorySnapshot::new();
        snapshot.add_region(0x1000, vec![1, 2, 3, 4, 5, 6]);

        let mut buf = [0u8; 4];
        assert_eq!(snapshot.read(0x1004, &mut buf), 2);
        assert_eq!(&buf[..2], &[5, 6]);
        assert_eq!(snapshot.read(0x0FFF, &mut buf), 0);
        assert_eq!(snapshot.read_u32(0x1000), Some(0x0403_0201));
        assert_eq!(snapshot.read_u32(0x1003), None);
    }

    #[test]
    fn test_safe_read_empty() {
        assert!(safe_read_memory(std::ptr::null(), &mut []));
    }

    #[test]
    #[cfg(any(target_os = "windows", target_os = "linux"))]
    fn test_current_process_reads() {
        let words: Box<[u32; 2]> = Box::new([0x1122_3344, 0x5566_7788]);
        let addr = words.as_ptr() as u64;

        let mut buf = [0u8; 8];
        assert!(safe_read_memory(words.as_ptr() as *const u8, &mut buf));
        assert_eq!(&buf[..4], &0x1122_3344u32.to_le_bytes());
        assert_eq!(CurrentProcessMemory.read_u32(addr + 4), Some(0x5566_7788));

        assert!(!safe_read_memory(std::ptr::null(), &mut buf));
        assert_eq!(CurrentProcessMemory.read(0, &mut buf), 0);
        assert_eq!(CurrentProcessMemory.read_u32(0), None);
    }
}
