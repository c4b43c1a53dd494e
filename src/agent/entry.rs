//! Entry points called from instrumented 32-bit code.
//!
//! The instrumenter rewrites the module's entry point to
//! `push module_data; push DllMain; jmp _hotpatch_dllmain_entry`, and every
//! basic block to `push bb_id; push module_data; call
//! _hotpatch_basic_block_enter`. Function heads additionally call
//! `_hotpatch_function_enter` after `push module_data`. All three preserve
//! every register and the flags.

use std::sync::OnceLock;
use std::time::Duration;

use tracing::{error, warn};

use super::module_data::IndexedFrequencyData;
use super::{AgentConfig, BasicBlockEntry, BranchEntry};
use crate::pe::MappedImage;
use crate::trace::format::data_type;
use crate::trace::{EndpointConfig, RpcClient, TraceSink};

const DLL_PROCESS_DETACH: u32 = 0;
const DLL_PROCESS_ATTACH: u32 = 1;
const DLL_THREAD_DETACH: u32 = 3;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// The stack as the loader left it for `DllMain`.
#[repr(C)]
pub struct DllMainEntryFrame {
    pub return_address: usize,
    pub module: usize,
    pub reason: u32,
    pub reserved: usize,
}

enum Agent {
    BasicBlock(BasicBlockEntry),
    Branch(BranchEntry),
}

static AGENT: OnceLock<Agent> = OnceLock::new();

fn connect_sink() -> Option<Box<dyn TraceSink>> {
    match RpcClient::connect(&EndpointConfig::from_env(), STARTUP_TIMEOUT).and_then(RpcClient::create_session) {
        Ok(session) => Some(Box::new(session)),
        Err(err) => {
            warn!(error = %err, "trace service unavailable");
            None
        }
    }
}

fn agent_for(data: &IndexedFrequencyData) -> &'static Agent {
    AGENT.get_or_init(|| {
        let sink = connect_sink();
        if data.data_type == data_type::BRANCH {
            Agent::Branch(BranchEntry::new(AgentConfig::from_env(), sink))
        } else {
            Agent::BasicBlock(BasicBlockEntry::new(sink))
        }
    })
}

extern "stdcall" fn dll_main_entry_hook(frame: *const DllMainEntryFrame, module_data: *mut IndexedFrequencyData) {
    // SAFETY: both come straight from the rewritten entry point.
    let (frame, data) = unsafe { (&*frame, &mut *module_data) };
    let agent = agent_for(data);

    match frame.reason {
        DLL_PROCESS_ATTACH => {
            let module = match MappedImage::from_hmodule(windows::Win32::Foundation::HMODULE(frame.module as *mut _))
                .and_then(|image| image.identity())
            {
                Ok(module) => module,
                Err(err) => {
                    error!(error = %err, "cannot identify instrumented module");
                    return;
                }
            };
            let _ = unsafe {
                match agent {
                    Agent::BasicBlock(agent) => agent.on_process_attach(module_data, module),
                    Agent::Branch(agent) => agent.on_process_attach(module_data, module),
                }
            };
        }
        DLL_THREAD_DETACH => {
            if let Agent::Branch(agent) = agent {
                agent.on_thread_detach();
            }
        }
        DLL_PROCESS_DETACH => {
            let result = match agent {
                Agent::BasicBlock(agent) => agent.on_process_detach(),
                Agent::Branch(agent) => agent.on_process_detach(),
            };
            if let Err(err) = result {
                error!(error = %err, "failed to commit trace segments");
            }
        }
        _ => {}
    }
}

extern "stdcall" fn basic_block_entry_hook(module_data: *mut IndexedFrequencyData, bb_id: u32) {
    match AGENT.get() {
        Some(Agent::Branch(agent)) => unsafe { agent.on_basic_block_entry(module_data, bb_id) },
        _ => unsafe { BasicBlockEntry::on_basic_block_entry(module_data, bb_id) },
    }
}

extern "stdcall" fn function_entry_hook(module_data: *mut IndexedFrequencyData) {
    if let Some(Agent::Branch(agent)) = AGENT.get() {
        unsafe { agent.on_function_entry(module_data) };
    }
}

// On entry: [esp] = DllMain, [esp+4] = module data, [esp+8] = loader's
// return address. `ret 4` lands in DllMain with the loader's frame intact.
std::arch::global_asm!(
    ".globl _hotpatch_dllmain_entry",
    "_hotpatch_dllmain_entry:",
    "push eax",
    "push ecx",
    "push edx",
    "pushfd",
    "lea eax, [esp + 24]",
    "push dword ptr [esp + 20]",
    "push eax",
    "call {hook}",
    "popfd",
    "pop edx",
    "pop ecx",
    "pop eax",
    "ret 4",
    hook = sym dll_main_entry_hook,
);

// On entry: [esp] = return address, [esp+4] = module data, [esp+8] = bb id.
std::arch::global_asm!(
    ".globl _hotpatch_basic_block_enter",
    "_hotpatch_basic_block_enter:",
    "push eax",
    "push ecx",
    "push edx",
    "pushfd",
    "push dword ptr [esp + 24]",
    "push dword ptr [esp + 24]",
    "call {hook}",
    "popfd",
    "pop edx",
    "pop ecx",
    "pop eax",
    "ret 8",
    hook = sym basic_block_entry_hook,
);

// On entry: [esp] = return address, [esp+4] = module data.
std::arch::global_asm!(
    ".globl _hotpatch_function_enter",
    "_hotpatch_function_enter:",
    "push eax",
    "push ecx",
    "push edx",
    "pushfd",
    "push dword ptr [esp + 20]",
    "call {hook}",
    "popfd",
    "pop edx",
    "pop ecx",
    "pop eax",
    "ret 4",
    hook = sym function_entry_hook,
);
