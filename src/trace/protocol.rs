//! RPC messages exchanged between clients and the trace service.
//!
//! Each frame is a little-endian `u32` length followed by a bincode body.

use std::io::{ErrorKind, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest frame either side accepts.
pub const MAX_FRAME_SIZE: u32 = 64 << 20;

/// x86 register context captured by a client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct X86Context {
    pub eip: u32,
    pub esp: u32,
    pub ebp: u32,
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub eflags: u32,
}

/// A range of client memory to include in a minidump.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRange {
    pub base: u64,
    pub length: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// First message on every connection.
    Hello { process_id: u32 },
    Write { text: String },
    WriteWithContext { text: String, context: X86Context },
    WriteWithTrace { text: String, trace: Vec<u64> },
    SaveMinidump {
        thread_id: u32,
        exception_info: u64,
        protobuf: Vec<u8>,
        memory_ranges: Vec<MemoryRange>,
    },
    CreateSession { command_line: String },
    CommitBuffer { bytes: Vec<u8> },
    CloseSession,
    Stop,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Session {
        session_id: u64,
        block_size: u32,
        max_buffer_size: u32,
    },
    Error { message: String },
}

/// Write one frame.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let body = bincode::serialize(message)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|&len| len <= MAX_FRAME_SIZE)
        .ok_or_else(|| Error::Protocol(format!("frame of {} bytes is too large", body.len())))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. Returns `None` if the peer closed the connection before
/// sending anything.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut len = [0u8; 4];
    let mut filled = 0;
    while filled < len.len() {
        match reader.read(&mut len[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(Error::Protocol("connection closed inside frame header".into())),
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }

    let len = u32::from_le_bytes(len);
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!("frame of {len} bytes exceeds limit")));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    Ok(Some(bincode::deserialize(&body)?))
}
