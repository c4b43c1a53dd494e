//! Local RPC endpoints and the readiness event.
//!
//! Windows uses a byte-mode named pipe `\\.\pipe\{name}` and a named
//! manual-reset event. Other hosts use a Unix domain socket and a marker
//! file, both in the temporary directory.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, Result};

pub const DEFAULT_PROTOCOL: &str = "hotpatch-rpc";
pub const DEFAULT_ROOT: &str = "trace";
pub const DEFAULT_EVENT_ROOT: &str = "hotpatch-ready";
pub const DEFAULT_INSTANCE_ID: &str = "default";

/// Environment variable naming the service instance an agent reports to.
pub const INSTANCE_ID_ENV_VAR: &str = "HOTPATCH_INSTANCE_ID";

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Names of a service instance's endpoint and readiness event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointConfig {
    pub protocol: String,
    pub root: String,
    pub event_root: String,
    pub instance_id: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            protocol: DEFAULT_PROTOCOL.to_string(),
            root: DEFAULT_ROOT.to_string(),
            event_root: DEFAULT_EVENT_ROOT.to_string(),
            instance_id: DEFAULT_INSTANCE_ID.to_string(),
        }
    }
}

impl EndpointConfig {
    pub fn with_instance_id(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Self::default()
        }
    }

    /// Instance named by [`INSTANCE_ID_ENV_VAR`], or the default one.
    pub fn from_env() -> Self {
        match std::env::var(INSTANCE_ID_ENV_VAR) {
            Ok(id) if !id.is_empty() => Self::with_instance_id(id),
            _ => Self::default(),
        }
    }

    pub fn endpoint_name(&self) -> String {
        format!("{}-{}-{}", self.protocol, self.root, self.instance_id)
    }

    pub fn event_name(&self) -> String {
        format!("{}-{}", self.event_root, self.instance_id)
    }
}

/// Server side of an endpoint.
pub struct LocalListener {
    name: String,
    #[cfg(unix)]
    inner: std::os::unix::net::UnixListener,
    #[cfg(unix)]
    path: PathBuf,
    #[cfg(target_os = "windows")]
    next: parking_lot::Mutex<Option<isize>>,
}

/// One connection.
pub struct LocalStream {
    #[cfg(unix)]
    inner: std::os::unix::net::UnixStream,
    #[cfg(target_os = "windows")]
    inner: std::fs::File,
}

#[cfg(unix)]
fn socket_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{name}.sock"))
}

#[cfg(unix)]
impl LocalListener {
    pub fn bind(name: &str) -> Result<Self> {
        let path = socket_path(name);
        // A stale socket from a crashed service blocks the bind.
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let inner = std::os::unix::net::UnixListener::bind(&path)
            .map_err(|err| Error::EndpointUnavailable(format!("{name}: {err}")))?;
        debug!(endpoint = name, path = %path.display(), "bound endpoint");
        Ok(Self {
            name: name.to_string(),
            inner,
            path,
        })
    }

    pub fn accept(&self) -> Result<LocalStream> {
        let (inner, _) = self.inner.accept()?;
        Ok(LocalStream { inner })
    }
}

#[cfg(unix)]
impl Drop for LocalListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
impl LocalStream {
    pub fn connect(name: &str) -> Result<Self> {
        let inner = std::os::unix::net::UnixStream::connect(socket_path(name))
            .map_err(|err| Error::EndpointUnavailable(format!("{name}: {err}")))?;
        Ok(Self { inner })
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            inner: self.inner.try_clone()?,
        })
    }

    /// Process id of the peer, when the transport reports it.
    pub fn peer_process_id(&self) -> Option<u32> {
        None
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_read_timeout(timeout)?;
        self.inner.set_write_timeout(timeout)?;
        Ok(())
    }

    /// Unblock pending reads on every clone of this stream.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown(std::net::Shutdown::Both);
    }
}

#[cfg(target_os = "windows")]
mod pipe {
    use windows::core::HSTRING;
    use windows::Win32::Foundation::{CloseHandle, ERROR_PIPE_CONNECTED, HANDLE};
    use windows::Win32::Storage::FileSystem::PIPE_ACCESS_DUPLEX;
    use windows::Win32::System::Pipes::{
        ConnectNamedPipe, CreateNamedPipeW, GetNamedPipeClientProcessId, PIPE_READMODE_BYTE, PIPE_TYPE_BYTE,
        PIPE_UNLIMITED_INSTANCES, PIPE_WAIT,
    };

    use crate::error::{Error, Result};

    const PIPE_BUFFER_SIZE: u32 = 64 * 1024;

    pub fn path(name: &str) -> String {
        format!(r"\\.\pipe\{name}")
    }

    pub fn create_instance(name: &str) -> Result<HANDLE> {
        let handle = unsafe {
            CreateNamedPipeW(
                &HSTRING::from(path(name)),
                PIPE_ACCESS_DUPLEX,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
                PIPE_UNLIMITED_INSTANCES,
                PIPE_BUFFER_SIZE,
                PIPE_BUFFER_SIZE,
                0,
                None,
            )
        };
        if handle.is_invalid() {
            return Err(Error::EndpointUnavailable(name.to_string()));
        }
        Ok(handle)
    }

    pub fn connect(handle: HANDLE) -> Result<()> {
        match unsafe { ConnectNamedPipe(handle, None) } {
            Ok(()) => Ok(()),
            Err(err) if err.code() == ERROR_PIPE_CONNECTED.to_hresult() => Ok(()),
            Err(err) => {
                unsafe {
                    let _ = CloseHandle(handle);
                }
                Err(err.into())
            }
        }
    }

    pub fn client_process_id(handle: HANDLE) -> Option<u32> {
        let mut pid = 0u32;
        unsafe { GetNamedPipeClientProcessId(handle, &mut pid) }.ok()?;
        Some(pid)
    }

    pub fn close(handle: HANDLE) {
        unsafe {
            let _ = CloseHandle(handle);
        }
    }
}

#[cfg(target_os = "windows")]
impl LocalListener {
    pub fn bind(name: &str) -> Result<Self> {
        let first = pipe::create_instance(name)?;
        debug!(endpoint = name, "bound endpoint");
        Ok(Self {
            name: name.to_string(),
            next: parking_lot::Mutex::new(Some(first.0 as isize)),
        })
    }

    pub fn accept(&self) -> Result<LocalStream> {
        use std::os::windows::io::FromRawHandle;
        use windows::Win32::Foundation::HANDLE;

        let handle = match self.next.lock().take() {
            Some(raw) => HANDLE(raw as *mut _),
            None => pipe::create_instance(&self.name)?,
        };
        pipe::connect(handle)?;
        // Keep an instance listening so clients never see a missing pipe.
        *self.next.lock() = Some(pipe::create_instance(&self.name)?.0 as isize);

        let inner = unsafe { std::fs::File::from_raw_handle(handle.0) };
        Ok(LocalStream { inner })
    }
}

#[cfg(target_os = "windows")]
impl Drop for LocalListener {
    fn drop(&mut self) {
        if let Some(raw) = self.next.lock().take() {
            pipe::close(windows::Win32::Foundation::HANDLE(raw as *mut _));
        }
    }
}

#[cfg(target_os = "windows")]
impl LocalStream {
    pub fn connect(name: &str) -> Result<Self> {
        const ERROR_PIPE_BUSY: i32 = 231;
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match std::fs::OpenOptions::new().read(true).write(true).open(pipe::path(name)) {
                Ok(inner) => return Ok(Self { inner }),
                Err(err) if err.raw_os_error() == Some(ERROR_PIPE_BUSY) && Instant::now() < deadline => {
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(err) => return Err(Error::EndpointUnavailable(format!("{name}: {err}"))),
            }
        }
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            inner: self.inner.try_clone()?,
        })
    }

    pub fn peer_process_id(&self) -> Option<u32> {
        use std::os::windows::io::AsRawHandle;
        pipe::client_process_id(windows::Win32::Foundation::HANDLE(self.inner.as_raw_handle()))
    }

    /// Pipes opened for synchronous I/O have no per-call timeout.
    pub fn set_timeout(&self, _timeout: Option<Duration>) -> Result<()> {
        Ok(())
    }

    /// Disconnect the server end; blocked reads fail on both sides.
    pub fn shutdown(&self) {
        use std::os::windows::io::AsRawHandle;
        use windows::Win32::System::Pipes::DisconnectNamedPipe;
        unsafe {
            let _ = DisconnectNamedPipe(windows::Win32::Foundation::HANDLE(self.inner.as_raw_handle()));
        }
    }
}

impl LocalListener {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Read for LocalStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for LocalStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Signaled by the service once its endpoint accepts connections.
pub struct ReadinessEvent {
    name: String,
    #[cfg(target_os = "windows")]
    handle: isize,
    #[cfg(not(target_os = "windows"))]
    path: PathBuf,
}

#[cfg(not(target_os = "windows"))]
fn marker_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{name}.ready"))
}

impl ReadinessEvent {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(not(target_os = "windows"))]
impl ReadinessEvent {
    /// Create the event in the unsignaled state.
    pub fn create(name: &str) -> Result<Self> {
        let path = marker_path(name);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(Self {
            name: name.to_string(),
            path,
        })
    }

    pub fn signal(&self) -> Result<()> {
        std::fs::write(&self.path, std::process::id().to_string())?;
        debug!(event = %self.name, "signaled readiness");
        Ok(())
    }

    /// Block until the event named `name` is signaled.
    pub fn wait(name: &str, timeout: Duration) -> Result<()> {
        let path = marker_path(name);
        let deadline = Instant::now() + timeout;
        while !path.exists() {
            if Instant::now() >= deadline {
                return Err(Error::EndpointUnavailable(name.to_string()));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }
}

#[cfg(not(target_os = "windows"))]
impl Drop for ReadinessEvent {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(target_os = "windows")]
impl ReadinessEvent {
    pub fn create(name: &str) -> Result<Self> {
        use windows::core::HSTRING;
        use windows::Win32::System::Threading::CreateEventW;

        let handle = unsafe { CreateEventW(None, true, false, &HSTRING::from(name))? };
        Ok(Self {
            name: name.to_string(),
            handle: handle.0 as isize,
        })
    }

    pub fn signal(&self) -> Result<()> {
        use windows::Win32::Foundation::HANDLE;
        use windows::Win32::System::Threading::SetEvent;

        unsafe { SetEvent(HANDLE(self.handle as *mut _))? };
        debug!(event = %self.name, "signaled readiness");
        Ok(())
    }

    pub fn wait(name: &str, timeout: Duration) -> Result<()> {
        use windows::core::HSTRING;
        use windows::Win32::Foundation::{CloseHandle, WAIT_OBJECT_0};
        use windows::Win32::System::Threading::{OpenEventW, WaitForSingleObject, SYNCHRONIZATION_SYNCHRONIZE};

        let deadline = Instant::now() + timeout;
        let wide = HSTRING::from(name);
        let handle = loop {
            match unsafe { OpenEventW(SYNCHRONIZATION_SYNCHRONIZE, false, &wide) } {
                Ok(handle) => break handle,
                Err(_) if Instant::now() < deadline => std::thread::sleep(POLL_INTERVAL),
                Err(_) => return Err(Error::EndpointUnavailable(name.to_string())),
            }
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        let status = unsafe { WaitForSingleObject(handle, remaining.as_millis() as u32) };
        unsafe {
            let _ = CloseHandle(handle);
        }
        if status == WAIT_OBJECT_0 {
            Ok(())
        } else {
            Err(Error::EndpointUnavailable(name.to_string()))
        }
    }
}

#[cfg(target_os = "windows")]
impl Drop for ReadinessEvent {
    fn drop(&mut self) {
        use windows::Win32::Foundation::{CloseHandle, HANDLE};
        unsafe {
            let _ = CloseHandle(HANDLE(self.handle as *mut _));
        }
    }
}
