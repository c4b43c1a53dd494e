//! Per-module data the instrumenter embeds in an instrumented image.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};

pub const MODULE_DATA_MAGIC: [u8; 4] = *b"HPMD";
pub const MODULE_DATA_VERSION: u32 = 1;

/// Agent identifiers, also written to segment headers.
pub const BASIC_BLOCK_ENTRY_AGENT_ID: u32 = 0x4842_4245;
pub const BRANCH_ENTRY_AGENT_ID: u32 = 0x4842_5245;

/// Module data record, laid out as the instrumenter emits it.
///
/// `frequency_data` initially points at counters inside the image and is
/// redirected at the live segment on process attach.
#[repr(C)]
#[derive(Debug)]
pub struct IndexedFrequencyData {
    pub magic: [u8; 4],
    pub version: u32,
    pub agent_id: u32,
    pub data_type: u32,
    pub frequency_size: u32,
    pub num_columns: u32,
    pub num_entries: u32,
    pub tls_index: u32,
    pub initialization_attempted: u32,
    pub frequency_data: *mut u32,
}

impl IndexedFrequencyData {
    /// A record with 4-byte counters and no counter storage.
    pub fn new(agent_id: u32, data_type: u32, num_columns: u32, num_entries: u32) -> Self {
        Self {
            magic: MODULE_DATA_MAGIC,
            version: MODULE_DATA_VERSION,
            agent_id,
            data_type,
            frequency_size: 4,
            num_columns,
            num_entries,
            tls_index: u32::MAX,
            initialization_attempted: 0,
            frequency_data: std::ptr::null_mut(),
        }
    }

    pub fn counter_count(&self) -> usize {
        self.num_entries as usize * self.num_columns as usize
    }

    /// Check the record against what an agent expects.
    pub fn validate(&self, expected: &AgentIdentity) -> Result<()> {
        let mismatch = |what: &str, found: u32, want: u32| {
            Err(Error::ModuleDataMismatch(format!("{what} is {found:#x}, expected {want:#x}")))
        };
        if self.magic != MODULE_DATA_MAGIC {
            return Err(Error::ModuleDataMismatch(format!("bad magic {:?}", self.magic)));
        }
        if self.version != MODULE_DATA_VERSION {
            return mismatch("version", self.version, MODULE_DATA_VERSION);
        }
        if self.agent_id != expected.agent_id {
            return mismatch("agent id", self.agent_id, expected.agent_id);
        }
        if self.data_type != expected.data_type {
            return mismatch("data type", self.data_type, expected.data_type);
        }
        if self.frequency_size != expected.frequency_size {
            return mismatch("frequency size", self.frequency_size, expected.frequency_size);
        }
        if self.num_columns != expected.num_columns {
            return mismatch("column count", self.num_columns, expected.num_columns);
        }
        Ok(())
    }
}

/// What an agent accepts in module data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AgentIdentity {
    pub agent_id: u32,
    pub data_type: u32,
    pub frequency_size: u32,
    pub num_columns: u32,
}

/// A view of `len` 32-bit counters.
#[derive(Clone, Copy, Debug)]
pub struct CounterArray {
    ptr: *const AtomicU32,
    len: usize,
}

// SAFETY: counters are atomics and the storage outlives every view.
unsafe impl Send for CounterArray {}
unsafe impl Sync for CounterArray {}

impl CounterArray {
    /// # Safety
    /// `ptr` must be 4-byte aligned and valid for `len` counters for as long
    /// as the view is used.
    pub unsafe fn from_raw(ptr: *mut u32, len: usize) -> Self {
        Self {
            ptr: ptr as *const AtomicU32,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u32 {
        self.ptr as *mut u32
    }

    fn slot(&self, index: usize) -> Option<&AtomicU32> {
        // SAFETY: bounds checked; validity is the constructor's contract.
        (index < self.len).then(|| unsafe { &*self.ptr.add(index) })
    }

    pub fn get(&self, index: usize) -> u32 {
        self.slot(index).map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Saturating increment. Concurrent increments may be lost below the
    /// ceiling; once at the ceiling every writer stores the ceiling.
    #[inline]
    pub fn increment(&self, index: usize) {
        if let Some(counter) = self.slot(index) {
            let value = counter.load(Ordering::Relaxed);
            if value != u32::MAX {
                counter.store(value + 1, Ordering::Relaxed);
            }
        }
    }
}

/// Number of counters in the shared fallback region.
pub const FALLBACK_COUNTERS: usize = 16 * 1024;

static FALLBACK: [AtomicU32; FALLBACK_COUNTERS] = [const { AtomicU32::new(0) }; FALLBACK_COUNTERS];

/// Counters used when no trace session is available. Every module that
/// falls back shares the region, so its contents are never reported.
pub struct StaticFallbackCounters;

impl StaticFallbackCounters {
    /// A view of at most [`FALLBACK_COUNTERS`] counters. Indices past the
    /// region are dropped.
    pub fn region(len: usize) -> CounterArray {
        CounterArray {
            ptr: FALLBACK.as_ptr(),
            len: len.min(FALLBACK_COUNTERS),
        }
    }

    pub fn contains(ptr: *const u32) -> bool {
        let start = FALLBACK.as_ptr() as usize;
        let end = start + FALLBACK_COUNTERS * 4;
        (start..end).contains(&(ptr as usize))
    }
}
