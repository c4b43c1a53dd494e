//! In-process agent runtime for instrumented modules.
//!
//! Instrumented code calls into an agent on module load, on every basic
//! block it enters and on thread and process teardown. Counters live in a
//! trace segment allocated from the trace service and are committed back to
//! it at process detach.

pub mod basic_block;
pub mod branch;
pub mod module_data;
pub mod segment;
pub mod thread_state;

#[cfg(all(target_os = "windows", target_arch = "x86"))]
pub mod entry;

pub use basic_block::BasicBlockEntry;
pub use branch::{BranchEntry, SENTINEL_BB_ID};
pub use module_data::{AgentIdentity, IndexedFrequencyData, StaticFallbackCounters};
pub use thread_state::{FsSlot, ThreadStateManager, TlsSlot};

/// Ring entries buffered per thread before a flush.
pub const DEFAULT_BUFFER_ENTRIES: usize = 4096;

/// Entries of the per-thread branch predictor cache.
pub const DEFAULT_PREDICTOR_ENTRIES: usize = 4096;

/// Environment variable selecting buffered branch commits.
pub const BUFFERING_ENV_VAR: &str = "HOTPATCH_BRANCH_BUFFERING";

/// Environment variable naming the FS slot (1 to 4) to use.
pub const FS_SLOT_ENV_VAR: &str = "HOTPATCH_FS_SLOT";

/// Agent runtime configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentConfig {
    /// User-application FS slot to publish thread state in, if any.
    pub fs_slot: Option<u32>,
    /// Buffer branch transitions per thread instead of committing each.
    pub buffering: bool,
    pub buffer_entries: usize,
    pub predictor_entries: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            fs_slot: None,
            buffering: false,
            buffer_entries: DEFAULT_BUFFER_ENTRIES,
            predictor_entries: DEFAULT_PREDICTOR_ENTRIES,
        }
    }
}

impl AgentConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(BUFFERING_ENV_VAR) {
            config.buffering = matches!(value.as_str(), "1" | "true" | "yes");
        }
        if cfg!(feature = "fs-slot") {
            config.fs_slot = std::env::var(FS_SLOT_ENV_VAR).ok().and_then(|v| v.parse().ok());
        }
        config
    }
}
