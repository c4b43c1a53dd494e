//! Client side of the trace service.

use std::time::Duration;

use tracing::{debug, warn};

use super::endpoint::{EndpointConfig, LocalStream, ReadinessEvent};
use super::format::{pad_to_block, TraceBuffer};
use super::protocol::{read_frame, write_frame, MemoryRange, Request, Response, X86Context};
use crate::error::{Error, Result};

/// Timeout applied to every call once connected.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// A connection to a running trace service.
pub struct RpcClient {
    stream: LocalStream,
}

impl RpcClient {
    /// Wait for the service's readiness event, then connect and introduce
    /// this process.
    pub fn connect(config: &EndpointConfig, startup_timeout: Duration) -> Result<Self> {
        ReadinessEvent::wait(&config.event_name(), startup_timeout)?;
        let stream = LocalStream::connect(&config.endpoint_name())?;
        stream.set_timeout(Some(CALL_TIMEOUT))?;

        let mut client = Self { stream };
        client.call_ok(Request::Hello {
            process_id: std::process::id(),
        })?;
        debug!(endpoint = %config.endpoint_name(), "connected to trace service");
        Ok(client)
    }

    fn call(&mut self, request: &Request) -> Result<Response> {
        write_frame(&mut self.stream, request)?;
        match read_frame(&mut self.stream)? {
            Some(Response::Error { message }) => Err(Error::Remote(message)),
            Some(response) => Ok(response),
            None => Err(Error::Protocol("service closed the connection".into())),
        }
    }

    fn call_ok(&mut self, request: Request) -> Result<()> {
        match self.call(&request)? {
            Response::Ok => Ok(()),
            other => Err(Error::Protocol(format!("unexpected reply {other:?}"))),
        }
    }

    pub fn write(&mut self, text: &str) -> Result<()> {
        self.call_ok(Request::Write { text: text.into() })
    }

    /// Log `text` with a stack the service captures from `context`.
    pub fn write_with_context(&mut self, text: &str, context: X86Context) -> Result<()> {
        self.call_ok(Request::WriteWithContext {
            text: text.into(),
            context,
        })
    }

    /// Log `text` with a stack already captured by the caller.
    pub fn write_with_trace(&mut self, text: &str, trace: &[u64]) -> Result<()> {
        self.call_ok(Request::WriteWithTrace {
            text: text.into(),
            trace: trace.to_vec(),
        })
    }

    pub fn save_minidump(
        &mut self,
        thread_id: u32,
        exception_info: u64,
        protobuf: &[u8],
        memory_ranges: &[MemoryRange],
    ) -> Result<()> {
        self.call_ok(Request::SaveMinidump {
            thread_id,
            exception_info,
            protobuf: protobuf.to_vec(),
            memory_ranges: memory_ranges.to_vec(),
        })
    }

    /// Ask the service to shut down.
    pub fn stop(&mut self) -> Result<()> {
        self.call_ok(Request::Stop)
    }

    /// Open a trace session on this connection.
    pub fn create_session(mut self) -> Result<TraceSession> {
        let command_line = std::env::args().collect::<Vec<_>>().join(" ");
        match self.call(&Request::CreateSession { command_line })? {
            Response::Session { block_size: 0, .. } => {
                Err(Error::Protocol("service reported a zero block size".into()))
            }
            Response::Session {
                session_id,
                block_size,
                max_buffer_size,
            } => Ok(TraceSession {
                client: self,
                session_id,
                block_size,
                max_buffer_size: max_buffer_size as usize,
                closed: false,
            }),
            other => Err(Error::Protocol(format!("unexpected reply {other:?}"))),
        }
    }
}

/// Where agents send trace segments.
pub trait TraceSink: Send {
    /// Whether a segment of `size` bytes can be allocated.
    fn can_allocate(&self, size: usize) -> bool;

    fn allocate_buffer(&mut self, size: usize) -> Result<TraceBuffer>;

    /// Hand a finished segment to the service for writing.
    fn commit(&mut self, buffer: &mut TraceBuffer) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// A trace session: segments committed here land in this process's trace
/// file.
pub struct TraceSession {
    client: RpcClient,
    session_id: u64,
    block_size: u32,
    max_buffer_size: usize,
    closed: bool,
}

impl TraceSession {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// `size` rounded up to whole blocks.
    fn block_aligned(&self, size: usize) -> usize {
        pad_to_block(size, self.block_size as usize)
    }

    /// The connection the session runs on.
    pub fn client(&mut self) -> &mut RpcClient {
        &mut self.client
    }
}

impl TraceSink for TraceSession {
    fn can_allocate(&self, size: usize) -> bool {
        !self.closed && self.block_aligned(size) <= self.max_buffer_size
    }

    fn allocate_buffer(&mut self, size: usize) -> Result<TraceBuffer> {
        if self.closed {
            return Err(Error::NoSession);
        }
        if !self.can_allocate(size) {
            return Err(Error::BufferTooLarge { requested: size });
        }
        Ok(TraceBuffer::new(self.block_aligned(size), current_thread_id()))
    }

    fn commit(&mut self, buffer: &mut TraceBuffer) -> Result<()> {
        if self.closed {
            return Err(Error::NoSession);
        }
        let bytes = buffer.segment().to_vec();
        self.client.call_ok(Request::CommitBuffer { bytes })
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.client.call_ok(Request::CloseSession)
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(session = self.session_id, error = %err, "failed to close trace session");
        }
    }
}

/// Id of the calling OS thread.
pub fn current_thread_id() -> u32 {
    #[cfg(target_os = "windows")]
    {
        unsafe { windows::Win32::System::Threading::GetCurrentThreadId() }
    }

    #[cfg(not(target_os = "windows"))]
    {
        use std::sync::atomic::{AtomicU32, Ordering};
        static NEXT: AtomicU32 = AtomicU32::new(1);
        thread_local! {
            static ID: u32 = NEXT.fetch_add(1, Ordering::Relaxed);
        }
        ID.with(|id| *id)
    }
}
