//! Error types for hotpatch.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while preparing, decomposing or tracing images.
#[derive(Error, Debug)]
pub enum Error {
    #[error("module not found: {0}")]
    ModuleNotFound(String),

    #[error("invalid DOS signature at offset 0x{0:X}")]
    InvalidDosSignature(usize),

    #[error("invalid PE signature at offset 0x{0:X}")]
    InvalidPeSignature(usize),

    #[error("unsupported machine type: 0x{0:X}")]
    UnsupportedMachine(u16),

    #[error("PE headers too small: expected {expected}, got {actual}")]
    HeadersTooSmall { expected: usize, actual: usize },

    #[error("section '{name}' not found")]
    SectionNotFound { name: String },

    #[error("unsupported hot-patch metadata version {found} (expected {expected})")]
    MetadataVersion { found: u32, expected: u32 },

    #[error("hot-patch metadata truncated: need {needed} bytes, have {available}")]
    MetadataTruncated { needed: usize, available: usize },

    #[error("invalid hot-patch metadata entry at RVA 0x{rva:X}: {reason}")]
    InvalidMetadataEntry { rva: u32, reason: &'static str },

    #[error("block '{name}' is too large for hot-patch metadata ({size} bytes)")]
    BlockTooLarge { name: String, size: usize },

    #[error("unexpected 32-bit pc-relative operand at 0x{addr:X}")]
    UnexpectedPcRelative { addr: u64 },

    #[error("instruction at 0x{addr:X} has a displacement into its own block")]
    DisplacementIntoBlock { addr: u64 },

    #[error("conflicting table label at offset {offset} of block '{block}'")]
    ConflictingLabel { block: String, offset: usize },

    #[error("failed to decode instruction at offset {offset} of block '{block}'")]
    InvalidInstruction { block: String, offset: usize },

    #[error("block '{block}' cannot be basic-block decomposed: {reason}")]
    NotDecomposable { block: String, reason: String },

    #[error("block '{0}' already requests padding before its data")]
    PaddingAlreadyRequested(String),

    #[error("could not allocate a thunk page")]
    ThunkPageAllocation,

    #[error("dispatcher 0x{dispatcher:X} is out of rel32 range of thunk 0x{thunk:X}")]
    DispatcherOutOfRange { dispatcher: usize, thunk: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("module data mismatch: {0}")]
    ModuleDataMismatch(String),

    #[error("thread slot {0} is already in use")]
    SlotInUse(u32),

    #[error("no trace session available")]
    NoSession,

    #[error("trace buffer of {requested} bytes exceeds the session limit")]
    BufferTooLarge { requested: usize },

    #[error("invalid trace file: {0}")]
    InvalidTraceFile(String),

    #[error("endpoint '{0}' is unavailable")]
    EndpointUnavailable(String),

    #[error("malformed RPC frame: {0}")]
    Protocol(String),

    #[error("remote call failed: {0}")]
    Remote(String),

    #[error("service cannot {action} from state {state}")]
    InvalidServiceState { action: &'static str, state: &'static str },

    #[error("service transition to {0} was vetoed")]
    TransitionVetoed(&'static str),

    #[error("crash keys could not be parsed: {0}")]
    CrashKeys(#[from] serde_json::Error),

    #[error("RPC encoding failed: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("operation not supported on this platform: {0}")]
    Unsupported(&'static str),

    #[cfg(target_os = "windows")]
    #[error("windows API error: {0}")]
    WindowsApi(#[from] windows::core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
