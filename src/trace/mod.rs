//! Trace transport: file format, RPC protocol, endpoints and the client.

pub mod client;
pub mod endpoint;
pub mod file;
pub mod format;
pub mod protocol;

pub use client::{RpcClient, TraceSession, TraceSink};
pub use endpoint::{EndpointConfig, LocalListener, LocalStream, ReadinessEvent};
pub use file::{TraceFileReader, TraceFileWriter};
pub use format::{RecordPrefix, RecordType, SegmentHeader, TraceBuffer, TraceFileHeader};
pub use protocol::{MemoryRange, Request, Response, X86Context};
