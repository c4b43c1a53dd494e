//! Symbolization of captured stacks.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::memory::ProcessMemory;
use crate::pe::PeHeaders;

/// DbgHelp is not re-entrant; every symbol operation in the process holds
/// this lock.
pub static SYMBOL_LOCK: Mutex<()> = Mutex::new(());

/// What is known about one address.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SymbolInfo {
    pub address: u64,
    pub symbol: Option<String>,
    pub displacement: u64,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl SymbolInfo {
    pub fn unresolved(address: u64) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }
}

pub trait Symbolizer: Send + Sync {
    /// Resolve `addresses` in the process `process_id`. Returns one entry
    /// per address, in order.
    fn symbolize(&self, process_id: u32, addresses: &[u64]) -> Vec<SymbolInfo>;
}

/// Leaves every address unresolved.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughSymbolizer;

impl Symbolizer for PassthroughSymbolizer {
    fn symbolize(&self, _process_id: u32, addresses: &[u64]) -> Vec<SymbolInfo> {
        addresses.iter().copied().map(SymbolInfo::unresolved).collect()
    }
}

/// One line per frame: `#i 0x… in symbol+offset file:line`.
pub fn format_stack_trace(frames: &[SymbolInfo]) -> String {
    let mut out = String::new();
    for (i, frame) in frames.iter().enumerate() {
        let _ = write!(out, "#{i} 0x{:08x}", frame.address);
        if let Some(symbol) = &frame.symbol {
            let _ = write!(out, " in {symbol}");
            if frame.displacement != 0 {
                let _ = write!(out, "+0x{:x}", frame.displacement);
            }
        }
        if let (Some(file), Some(line)) = (&frame.file, frame.line) {
            let _ = write!(out, " {file}:{line}");
        }
        out.push('\n');
    }
    out
}

/// `IMAGE_DEBUG_TYPE_CODEVIEW`.
const DEBUG_TYPE_CODEVIEW: u32 = 2;

/// Size of one `IMAGE_DEBUG_DIRECTORY` entry.
const DEBUG_DIRECTORY_ENTRY_SIZE: u64 = 28;

/// Signature, GUID and age precede the path in a PDB 7.0 record.
const RSDS_HEADER_SIZE: usize = 24;

const MAX_CODEVIEW_RECORD: usize = 4096;

/// The PDB path named by the CodeView record of the image mapped at `base`.
pub fn codeview_pdb_path<M: ProcessMemory>(memory: &M, base: u64) -> Option<PathBuf> {
    let mut headers = vec![0u8; 0x1000];
    let len = memory.read(base, &mut headers);
    headers.truncate(len);
    let debug = PeHeaders::parse(&headers).ok()?.debug_directory?;

    let entries = debug.size as u64 / DEBUG_DIRECTORY_ENTRY_SIZE;
    for index in 0..entries {
        let mut entry = [0u8; DEBUG_DIRECTORY_ENTRY_SIZE as usize];
        let at = base + debug.virtual_address as u64 + index * DEBUG_DIRECTORY_ENTRY_SIZE;
        if memory.read(at, &mut entry) != entry.len() {
            return None;
        }
        let field = |offset: usize| u32::from_le_bytes([entry[offset], entry[offset + 1], entry[offset + 2], entry[offset + 3]]);
        let (kind, size, rva) = (field(12), field(16) as usize, field(20));
        if kind != DEBUG_TYPE_CODEVIEW || rva == 0 || size <= RSDS_HEADER_SIZE {
            continue;
        }

        let mut record = vec![0u8; size.min(MAX_CODEVIEW_RECORD)];
        let len = memory.read(base + rva as u64, &mut record);
        record.truncate(len);
        if len <= RSDS_HEADER_SIZE || &record[..4] != b"RSDS" {
            continue;
        }
        let path = &record[RSDS_HEADER_SIZE..];
        let path = &path[..path.iter().position(|&b| b == 0).unwrap_or(path.len())];
        if !path.is_empty() {
            return Some(PathBuf::from(String::from_utf8_lossy(path).into_owned()));
        }
    }
    None
}

/// Append `dirs` to a `;`-separated search path, skipping entries already
/// on it.
pub fn append_search_path(current: &str, dirs: &[&Path]) -> String {
    let mut entries: Vec<String> = current.split(';').filter(|e| !e.is_empty()).map(str::to_owned).collect();
    for dir in dirs {
        let dir = dir.to_string_lossy();
        if !dir.is_empty() && !entries.iter().any(|e| e.eq_ignore_ascii_case(&dir)) {
            entries.push(dir.into_owned());
        }
    }
    entries.join(";")
}

/// The symbolizer for this platform.
pub fn default_symbolizer() -> Box<dyn Symbolizer> {
    #[cfg(target_os = "windows")]
    {
        Box::new(DbgHelpSymbolizer)
    }

    #[cfg(not(target_os = "windows"))]
    {
        Box::new(PassthroughSymbolizer)
    }
}

#[cfg(target_os = "windows")]
pub use dbghelp::DbgHelpSymbolizer;

#[cfg(target_os = "windows")]
mod dbghelp {
    use std::ffi::CStr;
    use std::path::Path;
    use std::ptr::{addr_of, addr_of_mut};

    use tracing::{debug, warn};
    use windows::core::{PCSTR, PSTR};
    use windows::Win32::Foundation::{CloseHandle, HANDLE, HMODULE};
    use windows::Win32::System::Diagnostics::Debug::{
        SymCleanup, SymFromAddr, SymGetLineFromAddr64, SymGetSearchPath, SymInitialize, SymRefreshModuleList,
        SymSetOptions, SymSetSearchPath, IMAGEHLP_LINE64, SYMBOL_INFO, SYMOPT_DEFERRED_LOADS, SYMOPT_LOAD_LINES,
        SYMOPT_UNDNAME,
    };
    use windows::Win32::System::ProcessStatus::{EnumProcessModules, GetModuleFileNameExA};
    use windows::Win32::System::Threading::{
        GetCurrentProcess, GetCurrentProcessId, OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
    };

    use super::{append_search_path, codeview_pdb_path, SymbolInfo, Symbolizer, SYMBOL_LOCK};
    use crate::memory::RemoteProcessMemory;

    const MAX_SYM_LEN: usize = 1024;

    #[repr(C)]
    struct SymbolInfoWithName {
        info: SYMBOL_INFO,
        name: [u8; MAX_SYM_LEN],
    }

    /// Symbolizes through DbgHelp with deferred loads, undecorated names
    /// and line numbers.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct DbgHelpSymbolizer;

    /// Owns a symbol session; cleanup runs however lookups end.
    struct Session {
        process: HANDLE,
        owned: bool,
    }

    impl Drop for Session {
        fn drop(&mut self) {
            unsafe {
                let _ = SymCleanup(self.process);
                if self.owned {
                    let _ = CloseHandle(self.process);
                }
            }
        }
    }

    fn open(process_id: u32) -> Option<Session> {
        unsafe {
            let (process, owned) = if process_id == GetCurrentProcessId() {
                (GetCurrentProcess(), false)
            } else {
                match OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, process_id) {
                    Ok(process) => (process, true),
                    Err(err) => {
                        warn!(process_id, error = %err, "cannot open process for symbolization");
                        return None;
                    }
                }
            };

            SymSetOptions(SYMOPT_DEFERRED_LOADS | SYMOPT_UNDNAME | SYMOPT_LOAD_LINES);
            if let Err(err) = SymInitialize(process, PCSTR::null(), false) {
                warn!(process_id, error = %err, "SymInitialize failed");
                if owned {
                    let _ = CloseHandle(process);
                }
                return None;
            }
            let session = Session { process, owned };
            extend_search_path(process);
            let _ = SymRefreshModuleList(process);
            Some(session)
        }
    }

    /// Append the directory of the process image, and that of the PDB its
    /// CodeView record names, to the symbol search path.
    unsafe fn extend_search_path(process: HANDLE) {
        let mut image = [0u8; 1024];
        let len = GetModuleFileNameExA(Some(process), None, &mut image) as usize;
        let Some(image_dir) = std::str::from_utf8(&image[..len]).ok().and_then(|p| Path::new(p).parent()) else {
            return;
        };

        let mut main_module = HMODULE::default();
        let mut needed = 0u32;
        let pdb = EnumProcessModules(
            process,
            &mut main_module,
            std::mem::size_of::<HMODULE>() as u32,
            &mut needed,
        )
        .ok()
        .and_then(|()| codeview_pdb_path(&RemoteProcessMemory::new(process), main_module.0 as u64));
        let pdb_dir = pdb.as_deref().and_then(Path::parent);

        let mut buf = [0u8; 4096];
        let current = match SymGetSearchPath(process, &mut buf) {
            Ok(()) => CStr::from_ptr(buf.as_ptr().cast()).to_string_lossy().into_owned(),
            Err(_) => String::new(),
        };
        let mut dirs = vec![image_dir];
        dirs.extend(pdb_dir);
        let mut path = append_search_path(&current, &dirs);
        path.push('\0');
        if SymSetSearchPath(process, PCSTR(path.as_ptr())).is_ok() {
            debug!(search_path = %path.trim_end_matches('\0'), "extended symbol search path");
        }
    }

    unsafe fn lookup(process: HANDLE, address: u64) -> SymbolInfo {
        let mut result = SymbolInfo::unresolved(address);

        let mut symbol: SymbolInfoWithName = std::mem::zeroed();
        symbol.info.SizeOfStruct = std::mem::size_of::<SYMBOL_INFO>() as u32;
        symbol.info.MaxNameLen = MAX_SYM_LEN as u32;
        let mut displacement = 0u64;
        if SymFromAddr(process, address, Some(&mut displacement), addr_of_mut!(symbol.info)).is_ok() {
            let name = CStr::from_ptr(addr_of!(symbol.info.Name).cast());
            result.symbol = Some(name.to_string_lossy().into_owned());
            result.displacement = displacement;
        }

        let mut line = IMAGEHLP_LINE64 {
            SizeOfStruct: std::mem::size_of::<IMAGEHLP_LINE64>() as u32,
            ..Default::default()
        };
        let mut line_displacement = 0u32;
        if SymGetLineFromAddr64(process, address, &mut line_displacement, &mut line).is_ok() && !line.FileName.is_null()
        {
            result.file = Some(PSTR(line.FileName.0).to_string().unwrap_or_default());
            result.line = Some(line.LineNumber);
        }
        result
    }

    impl Symbolizer for DbgHelpSymbolizer {
        fn symbolize(&self, process_id: u32, addresses: &[u64]) -> Vec<SymbolInfo> {
            let _guard = SYMBOL_LOCK.lock();
            let Some(session) = open(process_id) else {
                return addresses.iter().copied().map(SymbolInfo::unresolved).collect();
            };
            addresses
                .iter()
                .map(|&address| unsafe { lookup(session.process, address) })
                .collect()
        }
    }
}
