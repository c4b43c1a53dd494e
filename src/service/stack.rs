//! Remote stack capture from an x86 register context.

use crate::memory::ProcessMemory;
use crate::trace::protocol::X86Context;

/// Frames captured when the caller does not say otherwise.
pub const MAX_FRAMES: usize = 62;

/// Turns a register context into return addresses, innermost first. The
/// first entry is the context's instruction pointer.
pub trait StackWalker {
    fn walk(&self, context: &X86Context, max_frames: usize) -> Vec<u64>;
}

/// Follows the `ebp` chain. Stops at the first unreadable frame, a null
/// return address, or a frame pointer that does not move up the stack.
pub struct FramePointerWalker<M> {
    memory: M,
}

impl<M: ProcessMemory> FramePointerWalker<M> {
    pub fn new(memory: M) -> Self {
        Self { memory }
    }
}

impl<M: ProcessMemory> StackWalker for FramePointerWalker<M> {
    fn walk(&self, context: &X86Context, max_frames: usize) -> Vec<u64> {
        let mut frames = Vec::new();
        if max_frames == 0 {
            return frames;
        }
        frames.push(context.eip as u64);

        let mut ebp = context.ebp as u64;
        while frames.len() < max_frames && ebp != 0 {
            let Some(return_address) = self.memory.read_u32(ebp + 4) else {
                break;
            };
            let Some(next) = self.memory.read_u32(ebp) else {
                break;
            };
            if return_address == 0 {
                break;
            }
            frames.push(return_address as u64);
            if next as u64 <= ebp {
                break;
            }
            ebp = next as u64;
        }
        frames
    }
}

#[cfg(all(target_os = "windows", target_arch = "x86"))]
pub use dbghelp::DbgHelpStackWalker;

#[cfg(all(target_os = "windows", target_arch = "x86"))]
mod dbghelp {
    use std::ffi::c_void;

    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::Diagnostics::Debug::{
        AddrModeFlat, StackWalk64, SymCleanup, SymFunctionTableAccess64, SymGetModuleBase64, SymInitialize,
        CONTEXT, STACKFRAME64,
    };
    use windows::Win32::System::SystemInformation::IMAGE_FILE_MACHINE_I386;

    use super::StackWalker;
    use crate::memory::read_process_memory;
    use crate::service::symbols::SYMBOL_LOCK;
    use crate::trace::protocol::X86Context;

    /// `StackWalk64` over another process, tolerating partial reads.
    pub struct DbgHelpStackWalker {
        process: HANDLE,
        thread: HANDLE,
    }

    impl DbgHelpStackWalker {
        /// Borrow handles opened with `PROCESS_VM_READ |
        /// PROCESS_QUERY_INFORMATION`.
        pub fn new(process: HANDLE, thread: HANDLE) -> Self {
            Self { process, thread }
        }
    }

    unsafe extern "system" fn read_memory(
        process: HANDLE,
        base: u64,
        buffer: *mut c_void,
        size: u32,
        bytes_read: *mut u32,
    ) -> windows::core::BOOL {
        let buf = std::slice::from_raw_parts_mut(buffer as *mut u8, size as usize);
        match read_process_memory(process, base, buf) {
            Ok(n) if n > 0 => {
                if !bytes_read.is_null() {
                    *bytes_read = n as u32;
                }
                true.into()
            }
            _ => false.into(),
        }
    }

    impl StackWalker for DbgHelpStackWalker {
        fn walk(&self, context: &X86Context, max_frames: usize) -> Vec<u64> {
            let _guard = SYMBOL_LOCK.lock();
            let mut frames = Vec::new();

            let mut record = CONTEXT {
                Eip: context.eip,
                Esp: context.esp,
                Ebp: context.ebp,
                Eax: context.eax,
                Ebx: context.ebx,
                Ecx: context.ecx,
                Edx: context.edx,
                Esi: context.esi,
                Edi: context.edi,
                EFlags: context.eflags,
                ..Default::default()
            };
            let mut frame = STACKFRAME64::default();
            frame.AddrPC.Offset = context.eip as u64;
            frame.AddrPC.Mode = AddrModeFlat;
            frame.AddrFrame.Offset = context.ebp as u64;
            frame.AddrFrame.Mode = AddrModeFlat;
            frame.AddrStack.Offset = context.esp as u64;
            frame.AddrStack.Mode = AddrModeFlat;

            unsafe {
                if SymInitialize(self.process, windows::core::PCSTR::null(), true).is_err() {
                    return frames;
                }
                while frames.len() < max_frames
                    && StackWalk64(
                        IMAGE_FILE_MACHINE_I386.0 as u32,
                        self.process,
                        self.thread,
                        &mut frame,
                        &mut record as *mut CONTEXT as *mut c_void,
                        Some(read_memory),
                        Some(SymFunctionTableAccess64),
                        Some(SymGetModuleBase64),
                        None,
                    )
                    .as_bool()
                {
                    if frame.AddrPC.Offset == 0 {
                        break;
                    }
                    frames.push(frame.AddrPC.Offset);
                }
                let _ = SymCleanup(self.process);
            }
            frames
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySnapshot;

    fn frame(saved_ebp: u32, return_address: u32) -> Vec<u8> {
        let mut bytes = saved_ebp.to_le_bytes().to_vec();
        bytes.extend_from_slice(&return_address.to_le_bytes());
        bytes
    }

    #[test]
    fn test_frame_pointer_chain() {
        let mut memory = MemorySnapshot::new();
        memory
            .add_region(0x1000, frame(0x1100, 0x0040_1010))
            .add_region(0x1100, frame(0x1200, 0x0040_2020))
            .add_region(0x1200, frame(0, 0x0040_3030));

        let context = X86Context {
            eip: 0x0040_0005,
            ebp: 0x1000,
            ..Default::default()
        };
        let walker = FramePointerWalker::new(memory);
        assert_eq!(
            walker.walk(&context, MAX_FRAMES),
            vec![0x0040_0005, 0x0040_1010, 0x0040_2020, 0x0040_3030]
        );
        assert_eq!(walker.walk(&context, 2), vec![0x0040_0005, 0x0040_1010]);
    }

    #[test]
    fn test_walk_stops_on_loops_and_holes() {
        let mut memory = MemorySnapshot::new();
        memory.add_region(0x2000, frame(0x2000, 0x0040_1010));
        let walker = FramePointerWalker::new(memory);
        let context = X86Context {
            eip: 1,
            ebp: 0x2000,
            ..Default::default()
        };
        assert_eq!(walker.walk(&context, MAX_FRAMES), vec![1, 0x0040_1010]);

        let context = X86Context {
            eip: 1,
            ebp: 0x9000,
            ..Default::default()
        };
        assert_eq!(walker.walk(&context, MAX_FRAMES), vec![1]);
    }
}
