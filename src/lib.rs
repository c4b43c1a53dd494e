//! # hotpatch
//!
//! Hot-patching instrumentation toolkit for 32-bit x86 PE images.
//!
//! ## Overview
//!
//! An instrumented module carries a hot-patch metadata section listing every
//! block that was prepared for in-place patching. This crate:
//!
//! 1. Prepares blocks at instrumentation time: every block gets a 2-byte
//!    atomically replaceable first instruction and 5 bytes of padding in
//!    front, and the metadata section records where they ended up
//! 2. Decomposes a loaded module back into a block graph from that metadata,
//!    recovering jump tables, case tables and pc-relative references
//! 3. Writes new code into executable memory and swaps return addresses
//!    through recyclable thunks
//! 4. Runs per-module counting agents inside the instrumented process and
//!    ships their counters to an out-of-process trace/logging service
//! 5. Queues crash reports on disk and drains them through a retry ladder
//!
//! ## Usage as DLL
//!
//! Built as a DLL for 32-bit Windows, the crate exports the naked entry
//! points instrumented modules call (`_hotpatch_dllmain_entry`,
//! `_hotpatch_basic_block_enter`, `_hotpatch_function_enter`). The agents
//! report to the service instance named by `HOTPATCH_INSTANCE_ID`.

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![allow(clippy::too_many_arguments)]

pub mod error;
pub mod pe;
pub mod memory;
pub mod block_graph;
pub mod bytestream;
pub mod basic_block;
pub mod metadata;
pub mod transform;
pub mod metadata_writer;
pub mod layout;
pub mod decomposer;
pub mod arena;
pub mod thunk;
pub mod agent;
pub mod trace;
pub mod service;
pub mod repository;

pub use error::{Error, Result};
pub use pe::{MappedImage, ModuleIdentity, PeHeaders};
pub use block_graph::{Block, BlockGraph, BlockId};
pub use metadata::{HotPatchingMetadata, MetadataEntry, HOTPATCH_METADATA_SECTION_NAME};
pub use transform::{HotPatchingBasicBlockTransform, HotPatchingTransform};
pub use metadata_writer::HotPatchingMetadataWriter;
pub use layout::ImageLayout;
pub use decomposer::{DecomposedImage, HotPatchingDecomposer};
pub use arena::{ArenaConfig, ExecutableArenaWriter};
pub use thunk::{Thunk, ThunkDelegate, ThunkFactory, ThunkFactoryConfig};
pub use agent::{AgentConfig, BasicBlockEntry, BranchEntry};
pub use trace::{EndpointConfig, RpcClient, TraceSession, TraceSink};
pub use service::{LoggerService, Service, ServiceConfig, ServiceRegistration, ServiceState};
pub use repository::{ReportRepository, RepositoryConfig};
