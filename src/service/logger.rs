//! The trace/logging service backend.
//!
//! One accept thread hands each connection to its own worker. Text records
//! go to a single output behind the write lock; trace sessions each own a
//! trace file named after the client process.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::lifecycle::{ServiceBackend, StopHandle};
use super::minidump::{write_minidump, MinidumpRequest};
use super::stack::{StackWalker, MAX_FRAMES};
use super::symbols::{default_symbolizer, format_stack_trace, Symbolizer};
use crate::error::{Error, Result};
use crate::trace::format::DEFAULT_BLOCK_SIZE;
use crate::trace::protocol::{read_frame, write_frame, Request, Response, X86Context};
use crate::trace::{EndpointConfig, LocalListener, LocalStream, ReadinessEvent, TraceFileHeader, TraceFileWriter};

/// Largest segment a client may allocate.
pub const DEFAULT_MAX_BUFFER_SIZE: u32 = 16 << 20;

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub endpoint: EndpointConfig,
    pub trace_dir: PathBuf,
    pub minidump_dir: PathBuf,
    pub block_size: u32,
    pub max_buffer_size: u32,
    /// Text output; standard error when unset.
    pub log_file: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            trace_dir: std::env::temp_dir(),
            minidump_dir: std::env::temp_dir(),
            block_size: DEFAULT_BLOCK_SIZE,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            log_file: None,
        }
    }
}

impl ServiceConfig {
    /// Reject settings the trace file format cannot represent.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::InvalidConfig("block size must be nonzero".into()));
        }
        if self.max_buffer_size < self.block_size {
            return Err(Error::InvalidConfig(format!(
                "max buffer size {} is smaller than the block size {}",
                self.max_buffer_size, self.block_size
            )));
        }
        Ok(())
    }
}

struct Shared {
    config: ServiceConfig,
    output: Mutex<Box<dyn Write + Send>>,
    symbolizer: Box<dyn Symbolizer>,
    stack_walker: Mutex<Option<Box<dyn StackWalker + Send + Sync>>>,
    stopping: AtomicBool,
    stop: Mutex<Option<StopHandle>>,
    connections: Mutex<HashMap<u64, LocalStream>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_connection: AtomicU64,
    next_session: AtomicU64,
}

/// Serves log and trace requests on the configured endpoint.
pub struct LoggerService {
    shared: Arc<Shared>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    readiness: Mutex<Option<ReadinessEvent>>,
}

impl LoggerService {
    /// A service writing text to the configured log file, symbolizing with
    /// the platform symbolizer.
    pub fn new(config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        let output: Box<dyn Write + Send> = match &config.log_file {
            Some(path) => Box::new(OpenOptions::new().create(true).append(true).open(path)?),
            None => Box::new(std::io::stderr()),
        };
        Ok(Self::with_output(config, output, default_symbolizer()))
    }

    pub fn with_output(config: ServiceConfig, output: Box<dyn Write + Send>, symbolizer: Box<dyn Symbolizer>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                output: Mutex::new(output),
                symbolizer,
                stack_walker: Mutex::new(None),
                stopping: AtomicBool::new(false),
                stop: Mutex::new(None),
                connections: Mutex::new(HashMap::new()),
                workers: Mutex::new(Vec::new()),
                next_connection: AtomicU64::new(1),
                next_session: AtomicU64::new(1),
            }),
            acceptor: Mutex::new(None),
            readiness: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.shared.config
    }

    /// Walk client stacks with `walker` instead of opening the client process.
    pub fn set_stack_walker(&self, walker: impl StackWalker + Send + Sync + 'static) {
        *self.shared.stack_walker.lock() = Some(Box::new(walker));
    }

    /// Connections currently being served.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }
}

impl ServiceBackend for LoggerService {
    fn start(&self, stop: StopHandle) -> Result<()> {
        let config = &self.shared.config;
        config.validate()?;
        std::fs::create_dir_all(&config.trace_dir)?;
        *self.shared.stop.lock() = Some(stop);

        let listener = LocalListener::bind(&config.endpoint.endpoint_name())?;
        let readiness = ReadinessEvent::create(&config.endpoint.event_name())?;

        let shared = self.shared.clone();
        let acceptor = std::thread::Builder::new()
            .name("hotpatch-accept".into())
            .spawn(move || accept_loop(shared, listener))?;
        *self.acceptor.lock() = Some(acceptor);

        readiness.signal()?;
        *self.readiness.lock() = Some(readiness);
        info!(
            endpoint = %config.endpoint.endpoint_name(),
            instance_id = %config.endpoint.instance_id,
            "logger service listening"
        );
        Ok(())
    }

    fn interrupt(&self) {
        if self.shared.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the acceptor; it sees the flag and exits.
        let _ = LocalStream::connect(&self.shared.config.endpoint.endpoint_name());
        for stream in self.shared.connections.lock().values() {
            stream.shutdown();
        }
    }

    fn join(&self) -> Result<()> {
        let acceptor = self.acceptor.lock().take();
        if let Some(acceptor) = acceptor {
            if acceptor.join().is_err() {
                error!("accept thread panicked");
            }
        }
        let workers = std::mem::take(&mut *self.shared.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                error!("connection worker panicked");
            }
        }
        self.readiness.lock().take();
        self.shared.output.lock().flush()?;
        Ok(())
    }
}

fn accept_loop(shared: Arc<Shared>, listener: LocalListener) {
    loop {
        let stream = listener.accept();
        if shared.stopping.load(Ordering::SeqCst) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "accept failed");
                std::thread::sleep(std::time::Duration::from_millis(50));
                continue;
            }
        };

        let id = shared.next_connection.fetch_add(1, Ordering::Relaxed);
        let worker_shared = shared.clone();
        match std::thread::Builder::new()
            .name(format!("hotpatch-conn-{id}"))
            .spawn(move || serve_connection(worker_shared, id, stream))
        {
            Ok(worker) => {
                let mut workers = shared.workers.lock();
                reap_workers(&mut workers);
                workers.push(worker);
            }
            Err(err) => error!(error = %err, "cannot spawn connection worker"),
        }
    }
    debug!(endpoint = listener.name(), "accept loop finished");
}

/// Join the workers whose connections have already closed.
fn reap_workers(workers: &mut Vec<JoinHandle<()>>) {
    let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(workers).into_iter().partition(|worker| worker.is_finished());
    *workers = running;
    for worker in finished {
        if worker.join().is_err() {
            error!("connection worker panicked");
        }
    }
}

/// Per-connection state.
struct Connection {
    id: u64,
    process_id: Option<u32>,
    session: Option<(u64, TraceFileWriter)>,
}

fn serve_connection(shared: Arc<Shared>, id: u64, mut stream: LocalStream) {
    match stream.try_clone() {
        Ok(clone) => {
            shared.connections.lock().insert(id, clone);
        }
        Err(err) => {
            warn!(connection = id, error = %err, "cannot track connection");
            return;
        }
    }

    let mut connection = Connection {
        id,
        process_id: stream.peer_process_id(),
        session: None,
    };

    while !shared.stopping.load(Ordering::SeqCst) {
        let request = match read_frame::<_, Request>(&mut stream) {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(err) => {
                if !shared.stopping.load(Ordering::SeqCst) {
                    debug!(connection = id, error = %err, "connection dropped");
                }
                break;
            }
        };

        let stop_requested = matches!(request, Request::Stop);
        let response = match handle_request(&shared, &mut connection, request) {
            Ok(response) => response,
            Err(err) => {
                warn!(connection = id, error = %err, "request failed");
                Response::Error {
                    message: err.to_string(),
                }
            }
        };
        if let Err(err) = write_frame(&mut stream, &response) {
            debug!(connection = id, error = %err, "cannot reply");
            break;
        }
        if stop_requested {
            info!(connection = id, process_id = ?connection.process_id, "stop requested by client");
            let stop = shared.stop.lock().clone();
            if let Some(stop) = stop {
                stop.request_stop();
            }
        }
    }

    close_session(&mut connection);
    shared.connections.lock().remove(&id);
}

fn close_session(connection: &mut Connection) {
    if let Some((session_id, mut writer)) = connection.session.take() {
        if let Err(err) = writer.flush() {
            error!(session = session_id, error = %err, "failed to flush trace file");
        }
        info!(
            session = session_id,
            path = %writer.path().display(),
            size = %bytesize::ByteSize(writer.len()),
            "closed trace session"
        );
    }
}

fn handle_request(shared: &Shared, connection: &mut Connection, request: Request) -> Result<Response> {
    let process_id = connection.process_id.unwrap_or(0);
    match request {
        Request::Hello { process_id: claimed } => {
            match connection.process_id {
                Some(peer) if peer != claimed => {
                    warn!(connection = connection.id, claimed, peer, "client misreported its process id");
                }
                Some(_) => {}
                None => connection.process_id = Some(claimed),
            }
            debug!(connection = connection.id, process_id = ?connection.process_id, "client connected");
        }
        Request::Write { text } => {
            write_entry(shared, process_id, &text, &[])?;
        }
        Request::WriteWithContext { text, context } => {
            let trace = match &*shared.stack_walker.lock() {
                Some(walker) => walker.walk(&context, MAX_FRAMES),
                None => capture_stack(process_id, &context),
            };
            write_entry(shared, process_id, &text, &trace)?;
        }
        Request::WriteWithTrace { text, trace } => {
            write_entry(shared, process_id, &text, &trace)?;
        }
        Request::SaveMinidump {
            thread_id,
            exception_info,
            protobuf,
            memory_ranges,
        } => {
            let request = MinidumpRequest {
                process_id,
                thread_id,
                exception_info,
                protobuf,
                memory_ranges,
            };
            write_minidump(&shared.config.minidump_dir, &request)?;
        }
        Request::CreateSession { command_line } => {
            if connection.session.is_some() {
                return Err(Error::Protocol("a trace session is already open".into()));
            }
            let session_id = shared.next_session.fetch_add(1, Ordering::Relaxed);
            let path = shared.config.trace_dir.join(format!("trace-{process_id}-{session_id}.bin"));
            let header = TraceFileHeader::new(process_id, shared.config.block_size, command_line);
            let writer = TraceFileWriter::create(&path, &header)?;
            info!(session = session_id, process_id, path = %path.display(), "opened trace session");
            connection.session = Some((session_id, writer));
            return Ok(Response::Session {
                session_id,
                block_size: shared.config.block_size,
                max_buffer_size: shared.config.max_buffer_size,
            });
        }
        Request::CommitBuffer { bytes } => {
            let (_, writer) = connection.session.as_mut().ok_or(Error::NoSession)?;
            writer.write_segment(&bytes)?;
        }
        Request::CloseSession => {
            if connection.session.is_none() {
                return Err(Error::NoSession);
            }
            close_session(connection);
        }
        Request::Stop => {}
    }
    Ok(Response::Ok)
}

fn write_entry(shared: &Shared, process_id: u32, text: &str, trace: &[u64]) -> Result<()> {
    let mut entry = format!("[{process_id}] {}\n", text.trim_end());
    if !trace.is_empty() {
        let frames = shared.symbolizer.symbolize(process_id, trace);
        entry.push_str(&format_stack_trace(&frames));
    }
    let mut output = shared.output.lock();
    output.write_all(entry.as_bytes())?;
    output.flush()?;
    Ok(())
}

/// Walk the client's stack from `context`.
fn capture_stack(process_id: u32, context: &X86Context) -> Vec<u64> {
    #[cfg(target_os = "windows")]
    {
        use windows::Win32::Foundation::CloseHandle;
        use windows::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ};

        let process = match unsafe { OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, process_id) } {
            Ok(process) => process,
            Err(err) => {
                warn!(process_id, error = %err, "cannot open client for stack capture");
                return vec![context.eip as u64];
            }
        };

        #[cfg(target_arch = "x86")]
        let trace = {
            use super::stack::{DbgHelpStackWalker, StackWalker};
            DbgHelpStackWalker::new(process, windows::Win32::Foundation::HANDLE::default()).walk(context, MAX_FRAMES)
        };
        #[cfg(not(target_arch = "x86"))]
        let trace = {
            use super::stack::{FramePointerWalker, StackWalker};
            FramePointerWalker::new(crate::memory::RemoteProcessMemory::new(process)).walk(context, MAX_FRAMES)
        };

        unsafe {
            let _ = CloseHandle(process);
        }
        trace
    }

    #[cfg(not(target_os = "windows"))]
    {
        use super::stack::{FramePointerWalker, StackWalker};
        let _ = process_id;
        FramePointerWalker::new(crate::memory::CurrentProcessMemory).walk(context, MAX_FRAMES)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::service::symbols::SymbolInfo;
    use crate::service::Service;
    use crate::trace::RpcClient;
    use std::time::Duration;

    /// Output sink the test can read back.
    #[derive(Clone, Default)]
    pub struct SharedOutput(pub Arc<Mutex<Vec<u8>>>);

    impl Write for SharedOutput {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedOutput {
        pub fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    struct TableSymbolizer;

    impl Symbolizer for TableSymbolizer {
        fn symbolize(&self, _process_id: u32, addresses: &[u64]) -> Vec<SymbolInfo> {
            addresses
                .iter()
                .map(|&address| SymbolInfo {
                    address,
                    symbol: Some(format!("Function{}", (b'A' + (address >> 12) as u8 - 1) as char)),
                    displacement: address & 0xFFF,
                    ..SymbolInfo::default()
                })
                .collect()
        }
    }

    fn config(tag: &str, dir: &std::path::Path) -> ServiceConfig {
        ServiceConfig {
            endpoint: EndpointConfig::with_instance_id(format!("logger-{tag}-{}", std::process::id())),
            trace_dir: dir.to_path_buf(),
            minidump_dir: dir.to_path_buf(),
            ..ServiceConfig::default()
        }
    }

    #[test]
    fn test_write_with_trace_symbolizes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let output = SharedOutput::default();
        let config = config("trace", dir.path());
        let endpoint = config.endpoint.clone();
        let service = Service::new(
            "logger",
            LoggerService::with_output(config, Box::new(output.clone()), Box::new(TableSymbolizer)),
        );
        service.start().unwrap();

        let mut client = RpcClient::connect(&endpoint, Duration::from_secs(5)).unwrap();
        client.write("hello").unwrap();
        client.write_with_trace("crash", &[0x1010, 0x2020, 0x3030]).unwrap();
        client.stop().unwrap();
        service.join().unwrap();

        let text = output.text();
        let pid = std::process::id();
        assert!(text.contains(&format!("[{pid}] hello\n")));
        let a = text.find("in FunctionA+0x10").unwrap();
        let b = text.find("in FunctionB+0x20").unwrap();
        let c = text.find("in FunctionC+0x30").unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_context_stack_listed_innermost_first() {
        use crate::memory::MemorySnapshot;
        use crate::service::stack::FramePointerWalker;

        let frame = |saved_ebp: u32, return_address: u32| {
            let mut bytes = saved_ebp.to_le_bytes().to_vec();
            bytes.extend_from_slice(&return_address.to_le_bytes());
            bytes
        };
        let mut memory = MemorySnapshot::new();
        memory
            .add_region(0x8000, frame(0x8100, 0x2020))
            .add_region(0x8100, frame(0x8200, 0x3030))
            .add_region(0x8200, frame(0, 0x4040));

        let dir = tempfile::tempdir().unwrap();
        let output = SharedOutput::default();
        let config = config("context", dir.path());
        let endpoint = config.endpoint.clone();
        let logger = LoggerService::with_output(config, Box::new(output.clone()), Box::new(TableSymbolizer));
        logger.set_stack_walker(FramePointerWalker::new(memory));
        let service = Service::new("logger", logger);
        service.start().unwrap();

        let mut client = RpcClient::connect(&endpoint, Duration::from_secs(5)).unwrap();
        let context = X86Context {
            eip: 0x1010,
            ebp: 0x8000,
            ..Default::default()
        };
        client.write_with_context("fault", context).unwrap();
        client.stop().unwrap();
        service.join().unwrap();

        let text = output.text();
        assert!(text.contains(&format!("[{}] fault\n", std::process::id())));
        let positions: Vec<usize> = ["FunctionA+0x10", "FunctionB+0x20", "FunctionC+0x30", "FunctionD+0x40"]
            .iter()
            .map(|name| text.find(name).unwrap())
            .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn test_finished_workers_are_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let config = config("reap", dir.path());
        let endpoint = config.endpoint.clone();
        let service = Service::new(
            "logger",
            LoggerService::with_output(config, Box::new(SharedOutput::default()), Box::new(TableSymbolizer)),
        );
        service.start().unwrap();

        let only_worker_is = |id: u64, finished: bool| {
            let workers = service.backend().shared.workers.lock();
            let name = format!("hotpatch-conn-{id}");
            workers.len() == 1
                && workers[0].thread().name() == Some(name.as_str())
                && (!finished || workers[0].is_finished())
        };

        for id in 1..=8 {
            let mut client = RpcClient::connect(&endpoint, Duration::from_secs(5)).unwrap();
            client.write("ping").unwrap();
            drop(client);
            assert!(wait_until(|| only_worker_is(id, true)));
        }

        let mut client = RpcClient::connect(&endpoint, Duration::from_secs(5)).unwrap();
        client.write("last").unwrap();
        assert!(wait_until(|| only_worker_is(9, false)));
        client.stop().unwrap();
        service.join().unwrap();
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bad = ServiceConfig {
            block_size: 0,
            ..config("zero", dir.path())
        };
        assert!(matches!(LoggerService::new(bad.clone()), Err(Error::InvalidConfig(_))));

        let service = Service::new(
            "logger",
            LoggerService::with_output(bad, Box::new(SharedOutput::default()), Box::new(TableSymbolizer)),
        );
        assert!(service.start().is_err());
        assert_eq!(service.state(), crate::service::ServiceState::Errored);

        let small = ServiceConfig {
            max_buffer_size: 512,
            ..config("small", dir.path())
        };
        assert!(matches!(small.validate(), Err(Error::InvalidConfig(_))));
        assert!(config("ok", dir.path()).validate().is_ok());
    }

    #[test]
    fn test_session_requests_need_a_session() {
        let dir = tempfile::tempdir().unwrap();
        let service = LoggerService::with_output(
            config("direct", dir.path()),
            Box::new(SharedOutput::default()),
            Box::new(TableSymbolizer),
        );
        let mut connection = Connection {
            id: 1,
            process_id: Some(9),
            session: None,
        };
        let shared = &service.shared;
        assert!(matches!(
            handle_request(shared, &mut connection, Request::CommitBuffer { bytes: vec![0; 8] }),
            Err(Error::NoSession)
        ));
        assert!(matches!(
            handle_request(shared, &mut connection, Request::CloseSession),
            Err(Error::NoSession)
        ));

        let response = handle_request(
            shared,
            &mut connection,
            Request::CreateSession {
                command_line: "app.exe".into(),
            },
        )
        .unwrap();
        assert!(matches!(response, Response::Session { session_id: 1, block_size: 4096, .. }));
        assert!(dir.path().join("trace-9-1.bin").exists());
        assert!(handle_request(shared, &mut connection, Request::CreateSession { command_line: String::new() }).is_err());
        assert_eq!(handle_request(shared, &mut connection, Request::CloseSession).unwrap(), Response::Ok);
    }

    #[test]
    fn test_stop_with_idle_connection() {
        let dir = tempfile::tempdir().unwrap();
        let config = config("idle", dir.path());
        let endpoint = config.endpoint.clone();
        let service = Service::new(
            "logger",
            LoggerService::with_output(config, Box::new(SharedOutput::default()), Box::new(TableSymbolizer)),
        );
        service.start().unwrap();

        let _idle = RpcClient::connect(&endpoint, Duration::from_secs(5)).unwrap();
        service.stop().unwrap();
        service.join().unwrap();
        assert_eq!(service.backend().connection_count(), 0);
    }
}
