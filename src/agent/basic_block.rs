//! Basic-block entry counting: one saturating counter per basic block.

use tracing::error;

use super::module_data::{
    AgentIdentity, CounterArray, IndexedFrequencyData, StaticFallbackCounters, BASIC_BLOCK_ENTRY_AGENT_ID,
    FALLBACK_COUNTERS,
};
use super::segment::SegmentTable;
use crate::error::Result;
use crate::pe::ModuleIdentity;
use crate::trace::format::data_type;
use crate::trace::TraceSink;

pub struct BasicBlockEntry {
    segments: SegmentTable,
}

impl BasicBlockEntry {
    pub const IDENTITY: AgentIdentity = AgentIdentity {
        agent_id: BASIC_BLOCK_ENTRY_AGENT_ID,
        data_type: data_type::BASIC_BLOCK_ENTRY,
        frequency_size: 4,
        num_columns: 1,
    };

    pub fn new(sink: Option<Box<dyn TraceSink>>) -> Self {
        Self {
            segments: SegmentTable::new(sink),
        }
    }

    /// # Safety
    /// `module_data` must point to the module's data record, and no other
    /// thread may be attaching the same module.
    pub unsafe fn on_process_attach(&self, module_data: *mut IndexedFrequencyData, module: ModuleIdentity) -> Result<()> {
        self.segments
            .attach(&mut *module_data, &Self::IDENTITY, module)
            .map(|_| ())
            .inspect_err(|err| error!(error = %err, "basic-block agent failed to attach module"))
    }

    /// Count one entry into `bb_id`. A module that never attached is
    /// ignored.
    ///
    /// # Safety
    /// `module_data` must point to a module data record.
    #[inline]
    pub unsafe fn on_basic_block_entry(module_data: *const IndexedFrequencyData, bb_id: u32) {
        let data = &*module_data;
        let ptr = data.frequency_data;
        if ptr.is_null() {
            return;
        }
        let mut len = data.num_entries as usize;
        if StaticFallbackCounters::contains(ptr) {
            len = len.min(FALLBACK_COUNTERS);
        }
        CounterArray::from_raw(ptr, len).increment(bb_id as usize);
    }

    pub fn on_process_detach(&self) -> Result<()> {
        self.segments.detach()
    }

    pub fn module_count(&self) -> usize {
        self.segments.module_count()
    }
}
