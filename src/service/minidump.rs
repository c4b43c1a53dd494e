//! Minidumps of client processes.
//!
//! A dump is written under a temporary name and renamed into place once
//! complete, so readers never see a partial `.dmp`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::trace::protocol::MemoryRange;

/// User stream carrying the caller's opaque payload.
pub const CUSTOM_STREAM_TYPE: u32 = 0x4B6B_0002;

/// Extension of a finished dump.
pub const DUMP_EXTENSION: &str = "dmp";

/// Everything a client sends with a minidump request.
#[derive(Clone, Debug, Default)]
pub struct MinidumpRequest {
    pub process_id: u32,
    pub thread_id: u32,
    /// `EXCEPTION_POINTERS*` in the client's address space, or 0.
    pub exception_info: u64,
    pub protobuf: Vec<u8>,
    pub memory_ranges: Vec<MemoryRange>,
}

/// A dump path in `dir` that no other request in this process will pick.
pub fn unique_dump_path(dir: &Path, process_id: u32) -> PathBuf {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    dir.join(format!(
        "{process_id}-{stamp}-{}-{sequence}.{DUMP_EXTENSION}",
        std::process::id()
    ))
}

/// Write a dump of the requesting process into `dir` and return its path.
#[cfg(target_os = "windows")]
pub fn write_minidump(dir: &Path, request: &MinidumpRequest) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = unique_dump_path(dir, request.process_id);
    let temp = path.with_extension("tmp");

    let written = windows_dump::write(&temp, request);
    if let Err(err) = written {
        let _ = std::fs::remove_file(&temp);
        return Err(err);
    }
    std::fs::rename(&temp, &path)?;
    tracing::info!(
        process_id = request.process_id,
        thread_id = request.thread_id,
        path = %path.display(),
        "wrote minidump"
    );
    Ok(path)
}

/// Minidumps need the Windows debug help library.
#[cfg(not(target_os = "windows"))]
pub fn write_minidump(_dir: &Path, request: &MinidumpRequest) -> Result<PathBuf> {
    tracing::warn!(process_id = request.process_id, "minidumps are not supported on this platform");
    Err(crate::error::Error::Unsupported("minidump"))
}

#[cfg(target_os = "windows")]
mod windows_dump {
    use std::ffi::c_void;
    use std::os::windows::io::AsRawHandle;
    use std::path::Path;

    use windows::core::BOOL;
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::System::Diagnostics::Debug::{
        MiniDumpWithIndirectlyReferencedMemory, MiniDumpWithProcessThreadData, MiniDumpWithUnloadedModules,
        MiniDumpWriteDump, MemoryCallback, EXCEPTION_POINTERS, MINIDUMP_CALLBACK_INFORMATION,
        MINIDUMP_CALLBACK_INPUT, MINIDUMP_CALLBACK_OUTPUT, MINIDUMP_EXCEPTION_INFORMATION,
        MINIDUMP_USER_STREAM, MINIDUMP_USER_STREAM_INFORMATION,
    };
    use windows::Win32::System::Threading::{
        OpenProcess, PROCESS_DUP_HANDLE, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
    };

    use super::{MinidumpRequest, CUSTOM_STREAM_TYPE};
    use crate::error::Result;
    use crate::trace::protocol::MemoryRange;

    struct RangeCursor<'a> {
        ranges: &'a [MemoryRange],
        next: usize,
    }

    unsafe extern "system" fn add_ranges(
        param: *const c_void,
        input: *const MINIDUMP_CALLBACK_INPUT,
        output: *mut MINIDUMP_CALLBACK_OUTPUT,
    ) -> BOOL {
        if (*input).CallbackType != MemoryCallback.0 as u32 {
            return true.into();
        }
        let cursor = &mut *(param as *mut RangeCursor);
        let Some(range) = cursor.ranges.get(cursor.next) else {
            return false.into();
        };
        cursor.next += 1;
        (*output).Anonymous.Anonymous1.MemoryBase = range.base;
        (*output).Anonymous.Anonymous1.MemorySize = range.length;
        true.into()
    }

    pub fn write(path: &Path, request: &MinidumpRequest) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let process = unsafe {
            OpenProcess(
                PROCESS_QUERY_INFORMATION | PROCESS_VM_READ | PROCESS_DUP_HANDLE,
                false,
                request.process_id,
            )?
        };

        let exception = MINIDUMP_EXCEPTION_INFORMATION {
            ThreadId: request.thread_id,
            ExceptionPointers: request.exception_info as usize as *mut EXCEPTION_POINTERS,
            ClientPointers: true.into(),
        };
        let mut stream = MINIDUMP_USER_STREAM {
            Type: CUSTOM_STREAM_TYPE,
            BufferSize: request.protobuf.len() as u32,
            Buffer: request.protobuf.as_ptr() as *mut c_void,
        };
        let streams = MINIDUMP_USER_STREAM_INFORMATION {
            UserStreamCount: u32::from(!request.protobuf.is_empty()),
            UserStreamArray: &mut stream,
        };
        let mut cursor = RangeCursor {
            ranges: &request.memory_ranges,
            next: 0,
        };
        let callback = MINIDUMP_CALLBACK_INFORMATION {
            CallbackRoutine: Some(add_ranges),
            CallbackParam: &mut cursor as *mut RangeCursor as *mut c_void,
        };

        let result = unsafe {
            MiniDumpWriteDump(
                process,
                request.process_id,
                HANDLE(file.as_raw_handle()),
                MiniDumpWithIndirectlyReferencedMemory | MiniDumpWithProcessThreadData | MiniDumpWithUnloadedModules,
                (request.exception_info != 0).then_some(&exception as *const _),
                Some(&streams as *const _),
                Some(&callback as *const _),
            )
        };
        unsafe {
            let _ = CloseHandle(process);
        }
        result?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_dump_paths() {
        let dir = tempfile::tempdir().unwrap();
        let first = unique_dump_path(dir.path(), 12);
        let second = unique_dump_path(dir.path(), 12);
        assert_ne!(first, second);
        assert_eq!(first.extension().unwrap(), DUMP_EXTENSION);
        assert!(first.file_name().unwrap().to_string_lossy().starts_with("12-"));
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn test_minidump_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let request = MinidumpRequest {
            process_id: std::process::id(),
            ..MinidumpRequest::default()
        };
        assert!(matches!(
            write_minidump(dir.path(), &request),
            Err(crate::error::Error::Unsupported("minidump"))
        ));
    }
}
