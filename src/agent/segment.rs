//! Counter segments shared by the agents.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::module_data::{AgentIdentity, CounterArray, IndexedFrequencyData, StaticFallbackCounters};
use crate::error::Result;
use crate::pe::ModuleIdentity;
use crate::trace::format::{
    IndexedFrequencyHeader, RecordPrefix, RecordType, SegmentHeader, TraceBuffer, RECORD_ALIGNMENT,
};
use crate::trace::TraceSink;

/// Counters of one attached module.
pub struct ModuleSegment {
    module_data: usize,
    module: ModuleIdentity,
    counters: CounterArray,
    /// Held while counters are updated in bulk and while the segment is
    /// committed.
    buffer: Mutex<Option<TraceBuffer>>,
}

impl ModuleSegment {
    pub fn counters(&self) -> &CounterArray {
        &self.counters
    }

    pub fn module(&self) -> ModuleIdentity {
        self.module
    }

    /// Whether counts go to the shared fallback region.
    pub fn is_fallback(&self) -> bool {
        self.buffer.lock().is_none()
    }

    /// Run `f` under the segment lock.
    pub fn with_lock<R>(&self, f: impl FnOnce(&CounterArray) -> R) -> R {
        let _guard = self.buffer.lock();
        f(&self.counters)
    }
}

/// Bytes to request for a segment holding `header`'s counters.
pub fn segment_size(header: &IndexedFrequencyHeader) -> usize {
    SegmentHeader::SIZE + RECORD_ALIGNMENT + RecordPrefix::SIZE + IndexedFrequencyHeader::SIZE + header.counters_size()
}

/// The trace sink and every module attached through it.
pub struct SegmentTable {
    sink: Mutex<Option<Box<dyn TraceSink>>>,
    modules: Mutex<Vec<Arc<ModuleSegment>>>,
}

impl SegmentTable {
    pub fn new(sink: Option<Box<dyn TraceSink>>) -> Self {
        Self {
            sink: Mutex::new(sink),
            modules: Mutex::new(Vec::new()),
        }
    }

    /// Attach a module: validate its data, allocate its segment and point
    /// its counters at it. Returns `None` if the module was already seen.
    pub fn attach(
        &self,
        module_data: &mut IndexedFrequencyData,
        expected: &AgentIdentity,
        module: ModuleIdentity,
    ) -> Result<Option<Arc<ModuleSegment>>> {
        if module_data.initialization_attempted != 0 {
            return Ok(None);
        }
        module_data.initialization_attempted = 1;
        module_data.validate(expected)?;

        let header = IndexedFrequencyHeader {
            data_type: module_data.data_type,
            agent_id: module_data.agent_id,
            version: module_data.version,
            frequency_size: module_data.frequency_size,
            num_columns: module_data.num_columns,
            num_entries: module_data.num_entries,
            module,
        };
        let count = module_data.counter_count();

        let (counters, buffer) = match self.allocate(&header) {
            Some((counters, buffer)) => (counters, Some(buffer)),
            None => {
                warn!(base = format_args!("{:#x}", module.base), "no trace segment, using fallback counters");
                (StaticFallbackCounters::region(count), None)
            }
        };
        module_data.frequency_data = counters.as_ptr();

        let segment = Arc::new(ModuleSegment {
            module_data: module_data as *mut IndexedFrequencyData as usize,
            module,
            counters,
            buffer: Mutex::new(buffer),
        });
        self.modules.lock().push(segment.clone());
        info!(
            base = format_args!("{:#x}", module.base),
            entries = module_data.num_entries,
            columns = module_data.num_columns,
            "attached module"
        );
        Ok(Some(segment))
    }

    fn allocate(&self, header: &IndexedFrequencyHeader) -> Option<(CounterArray, TraceBuffer)> {
        let size = segment_size(header);
        let mut sink = self.sink.lock();
        let sink = sink.as_mut()?;
        if !sink.can_allocate(size) {
            return None;
        }
        let mut buffer = sink
            .allocate_buffer(size)
            .map_err(|err| warn!(size, error = %err, "segment allocation failed"))
            .ok()?;

        let payload = IndexedFrequencyHeader::SIZE + header.counters_size();
        let at = buffer.allocate_record(RecordType::IndexedFrequency, payload)?;
        header.write_to(&mut buffer.bytes_mut()[at..at + IndexedFrequencyHeader::SIZE]);
        // SAFETY: the record reserves room for every counter, the offset is
        // 4-byte aligned in 8-byte aligned storage, and the buffer's storage
        // never moves while the segment owns it.
        let counters = unsafe {
            let ptr = buffer.as_mut_ptr().add(at + IndexedFrequencyHeader::SIZE) as *mut u32;
            CounterArray::from_raw(ptr, header.num_entries as usize * header.num_columns as usize)
        };
        Some((counters, buffer))
    }

    pub fn find(&self, module_data: *const IndexedFrequencyData) -> Option<Arc<ModuleSegment>> {
        self.modules
            .lock()
            .iter()
            .find(|segment| segment.module_data == module_data as usize)
            .cloned()
    }

    pub fn module_count(&self) -> usize {
        self.modules.lock().len()
    }

    /// Commit every segment and close the session. Counters stay valid so
    /// late hits land in memory that is no longer reported.
    pub fn detach(&self) -> Result<()> {
        let Some(mut sink) = self.sink.lock().take() else {
            return Ok(());
        };
        let modules = self.modules.lock().clone();

        for segment in &modules {
            if let Some(buffer) = segment.buffer.lock().as_mut() {
                sink.commit(buffer)?;
                debug!(base = format_args!("{:#x}", segment.module.base), "committed segment");
            }
        }
        sink.close()
    }
}
