//! Branch profiling: per basic block, how often it ran, how often control
//! left it by a taken branch, and how often a 2-bit predictor got that
//! wrong.
//!
//! Counters are interleaved, three per basic block, in column order
//! frequency, branch-taken, mispredicted.

use std::ffi::c_void;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::module_data::{AgentIdentity, CounterArray, IndexedFrequencyData, BRANCH_ENTRY_AGENT_ID};
use super::segment::{ModuleSegment, SegmentTable};
use super::thread_state::{FsSlot, ThreadStateManager, TlsSlot};
use super::AgentConfig;
use crate::error::Result;
use crate::pe::ModuleIdentity;
use crate::trace::format::data_type;
use crate::trace::TraceSink;

/// "No previous basic block".
pub const SENTINEL_BB_ID: u32 = u32::MAX;

pub const FREQUENCY_COLUMN: usize = 0;
pub const BRANCH_TAKEN_COLUMN: usize = 1;
pub const MISPREDICTED_COLUMN: usize = 2;
pub const NUM_COLUMNS: usize = 3;

/// Initial predictor state: weakly not-taken.
const PREDICTOR_INITIAL_STATE: u8 = 1;

/// Apply one transition `prev -> bb_id` to the counters.
fn record_transition(counters: &CounterArray, predictor: &mut [u8], bb_id: u32, prev: u32) {
    let entries = counters.len() / NUM_COLUMNS;
    let bb = bb_id as usize;
    if bb < entries {
        counters.increment(bb * NUM_COLUMNS + FREQUENCY_COLUMN);
    }

    let prev_index = prev as usize;
    if prev == SENTINEL_BB_ID || prev_index >= entries {
        return;
    }
    let taken = prev.wrapping_add(1) != bb_id;
    if taken {
        counters.increment(prev_index * NUM_COLUMNS + BRANCH_TAKEN_COLUMN);
    }

    let state = &mut predictor[prev_index % predictor.len()];
    if (*state >= 2) != taken {
        counters.increment(prev_index * NUM_COLUMNS + MISPREDICTED_COLUMN);
    }
    *state = if taken { (*state + 1).min(3) } else { state.saturating_sub(1) };
}

/// State of one thread in one module.
pub struct BranchThreadState {
    segment: Arc<ModuleSegment>,
    module_data: usize,
    ring: Vec<(u32, u32)>,
    ring_capacity: usize,
    predictor: Vec<u8>,
    last_bb_id: u32,
}

impl BranchThreadState {
    fn new(segment: Arc<ModuleSegment>, module_data: usize, config: &AgentConfig) -> Self {
        let ring_capacity = if config.buffering {
            config.buffer_entries.max(1)
        } else {
            0
        };
        Self {
            segment,
            module_data,
            ring: Vec::with_capacity(ring_capacity),
            ring_capacity,
            predictor: vec![PREDICTOR_INITIAL_STATE; config.predictor_entries.max(1)],
            last_bb_id: SENTINEL_BB_ID,
        }
    }

    fn enter(&mut self, bb_id: u32) {
        if self.ring_capacity > 0 {
            self.ring.push((bb_id, self.last_bb_id));
            if self.ring.len() == self.ring_capacity {
                self.flush();
            }
        } else {
            let (predictor, last) = (&mut self.predictor, self.last_bb_id);
            self.segment
                .with_lock(|counters| record_transition(counters, predictor, bb_id, last));
        }
        self.last_bb_id = bb_id;
    }

    /// Replay the ring under the segment lock.
    fn flush(&mut self) {
        if self.ring.is_empty() {
            return;
        }
        let (ring, predictor) = (&mut self.ring, &mut self.predictor);
        self.segment.with_lock(|counters| {
            for (bb_id, prev) in ring.drain(..) {
                record_transition(counters, predictor, bb_id, prev);
            }
        });
    }

    pub fn last_bb_id(&self) -> u32 {
        self.last_bb_id
    }
}

pub struct BranchEntry {
    config: AgentConfig,
    segments: SegmentTable,
    threads: ThreadStateManager<BranchThreadState>,
    tls_slots: Mutex<Vec<TlsSlot>>,
    fs_slot: OnceLock<FsSlot>,
}

impl BranchEntry {
    pub const IDENTITY: AgentIdentity = AgentIdentity {
        agent_id: BRANCH_ENTRY_AGENT_ID,
        data_type: data_type::BRANCH,
        frequency_size: 4,
        num_columns: NUM_COLUMNS as u32,
    };

    pub fn new(config: AgentConfig, sink: Option<Box<dyn TraceSink>>) -> Self {
        Self {
            config,
            segments: SegmentTable::new(sink),
            threads: ThreadStateManager::new(),
            tls_slots: Mutex::new(Vec::new()),
            fs_slot: OnceLock::new(),
        }
    }

    /// # Safety
    /// `module_data` must point to the module's data record, and no other
    /// thread may be attaching the same module.
    pub unsafe fn on_process_attach(&self, module_data: *mut IndexedFrequencyData, module: ModuleIdentity) -> Result<()> {
        self.attach(&mut *module_data, module)
            .inspect_err(|err| error!(error = %err, "branch agent failed to attach module"))
    }

    fn attach(&self, data: &mut IndexedFrequencyData, module: ModuleIdentity) -> Result<()> {
        if self.segments.attach(data, &Self::IDENTITY, module)?.is_none() {
            return Ok(());
        }
        let slot = TlsSlot::allocate()?;
        data.tls_index = slot.index();
        self.tls_slots.lock().push(slot);

        if let Some(fs_slot) = self.config.fs_slot {
            if self.fs_slot.get().is_none() {
                self.install_fs_slot(FsSlot::claim(fs_slot)?);
            }
        }
        Ok(())
    }

    /// Keep `claimed` as the agent's FS slot unless another attach got there
    /// first. Returns whether it was kept.
    fn install_fs_slot(&self, claimed: FsSlot) -> bool {
        match self.fs_slot.set(claimed) {
            Ok(()) => true,
            Err(duplicate) => {
                warn!(
                    slot = duplicate.slot(),
                    kept = ?self.fs_slot.get().map(FsSlot::slot),
                    "FS slot already claimed by a concurrent attach"
                );
                false
            }
        }
    }

    /// Find or create the calling thread's state for a module.
    unsafe fn thread_state(&self, module_data: *const IndexedFrequencyData) -> Option<*mut BranchThreadState> {
        if let Some(fs) = self.fs_slot.get() {
            let state = fs.get() as *mut BranchThreadState;
            if !state.is_null() && (*state).module_data == module_data as usize {
                return Some(state);
            }
        }

        let data = &*module_data;
        if data.initialization_attempted == 0 || data.tls_index == u32::MAX {
            return None;
        }
        let tls = TlsSlot::from_index(data.tls_index);
        let state = tls.get() as *mut BranchThreadState;
        if !state.is_null() {
            return Some(state);
        }

        let segment = self.segments.find(module_data)?;
        let state = self.threads.register(Box::new(BranchThreadState::new(
            segment,
            module_data as usize,
            &self.config,
        )));
        tls.set(state as *mut c_void);
        if let Some(fs) = self.fs_slot.get() {
            if fs.get() == 0 {
                fs.set(state as usize);
            }
        }
        debug!(module_data = format_args!("{:#x}", module_data as usize), "created branch thread state");
        Some(state)
    }

    /// # Safety
    /// `module_data` must point to a module data record.
    pub unsafe fn on_basic_block_entry(&self, module_data: *const IndexedFrequencyData, bb_id: u32) {
        if let Some(state) = self.thread_state(module_data) {
            (*state).enter(bb_id);
        }
    }

    /// A call makes the previous block meaningless to the callee.
    ///
    /// # Safety
    /// `module_data` must point to a module data record.
    pub unsafe fn on_function_entry(&self, module_data: *const IndexedFrequencyData) {
        if let Some(state) = self.thread_state(module_data) {
            (*state).last_bb_id = SENTINEL_BB_ID;
        }
    }

    /// Flush and release the calling thread's states.
    pub fn on_thread_detach(&self) {
        for slot in self.tls_slots.lock().iter() {
            let state = slot.get() as *mut BranchThreadState;
            if state.is_null() {
                continue;
            }
            // SAFETY: the slot only ever holds states registered with the
            // manager, and only this thread uses them.
            unsafe { (*state).flush() };
            slot.set(std::ptr::null_mut());
            self.threads.mark_for_death(state);
        }
        if let Some(fs) = self.fs_slot.get() {
            fs.set(0);
        }
    }

    /// Flush every thread and commit the segments.
    pub fn on_process_detach(&self) -> Result<()> {
        self.threads.for_each_active(BranchThreadState::flush);
        self.segments.detach()
    }

    pub fn active_threads(&self) -> usize {
        self.threads.active_count()
    }
}
