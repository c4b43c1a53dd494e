//! On-disk trace format.
//!
//! A trace file starts with a [`TraceFileHeader`] padded to the file's block
//! size. Segments follow, each padded to the block size as well. A segment is
//! a [`SegmentHeader`] followed by records; every record starts with a
//! [`RecordPrefix`] and records are 8-byte aligned within the segment.
//!
//! All fields are packed little-endian.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::pe::ModuleIdentity;

/// Magic at the start of every trace file.
pub const TRACE_FILE_MAGIC: [u8; 8] = *b"HPTRACE\0";

/// Current trace file version.
pub const TRACE_FILE_VERSION: u32 = 1;

/// Block size used when the service is not configured otherwise.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Alignment of records inside a segment.
pub const RECORD_ALIGNMENT: usize = 8;

/// Record types understood by the service and the reader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RecordType {
    ProcessAttach = 1,
    ProcessDetach = 2,
    ThreadAttach = 3,
    ThreadDetach = 4,
    ModuleAttach = 5,
    IndexedFrequency = 6,
    FunctionEntry = 7,
    FunctionExit = 8,
}

impl TryFrom<u16> for RecordType {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        Ok(match value {
            1 => Self::ProcessAttach,
            2 => Self::ProcessDetach,
            3 => Self::ThreadAttach,
            4 => Self::ThreadDetach,
            5 => Self::ModuleAttach,
            6 => Self::IndexedFrequency,
            7 => Self::FunctionEntry,
            8 => Self::FunctionExit,
            other => return Err(Error::InvalidTraceFile(format!("unknown record type {other}"))),
        })
    }
}

/// Current time in microseconds since the Unix epoch.
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// Prefix of every record in a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordPrefix {
    pub timestamp: u64,
    /// Size of the payload that follows the prefix.
    pub size: u32,
    pub record_type: u16,
    pub version: u16,
}

impl RecordPrefix {
    pub const SIZE: usize = 16;

    pub fn write_to(&self, dst: &mut [u8]) {
        dst[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        dst[8..12].copy_from_slice(&self.size.to_le_bytes());
        dst[12..14].copy_from_slice(&self.record_type.to_le_bytes());
        dst[14..16].copy_from_slice(&self.version.to_le_bytes());
    }

    pub fn read_from(src: &[u8]) -> Option<Self> {
        if src.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            timestamp: read_u64(src, 0),
            size: read_u32(src, 8),
            record_type: read_u16(src, 12),
            version: read_u16(src, 14),
        })
    }
}

/// Header at the start of every segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Bytes of records following the header.
    pub segment_length: u32,
    pub thread_id: u32,
}

impl SegmentHeader {
    pub const SIZE: usize = 8;

    pub fn write_to(&self, dst: &mut [u8]) {
        dst[0..4].copy_from_slice(&self.segment_length.to_le_bytes());
        dst[4..8].copy_from_slice(&self.thread_id.to_le_bytes());
    }

    pub fn read_from(src: &[u8]) -> Option<Self> {
        if src.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            segment_length: read_u32(src, 0),
            thread_id: read_u32(src, 4),
        })
    }
}

/// Data type tags of an indexed frequency record.
pub mod data_type {
    pub const BASIC_BLOCK_ENTRY: u32 = 1;
    pub const BRANCH: u32 = 2;
    pub const COVERAGE: u32 = 3;
}

/// Header of an [`RecordType::IndexedFrequency`] record. The counters follow
/// immediately.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexedFrequencyHeader {
    pub data_type: u32,
    pub agent_id: u32,
    pub version: u32,
    pub frequency_size: u32,
    pub num_columns: u32,
    pub num_entries: u32,
    pub module: ModuleIdentity,
}

impl IndexedFrequencyHeader {
    pub const SIZE: usize = 44;

    /// Bytes taken by the counters described by this header.
    pub fn counters_size(&self) -> usize {
        self.num_entries as usize * self.num_columns as usize * self.frequency_size as usize
    }

    pub fn write_to(&self, dst: &mut [u8]) {
        dst[0..4].copy_from_slice(&self.data_type.to_le_bytes());
        dst[4..8].copy_from_slice(&self.agent_id.to_le_bytes());
        dst[8..12].copy_from_slice(&self.version.to_le_bytes());
        dst[12..16].copy_from_slice(&self.frequency_size.to_le_bytes());
        dst[16..20].copy_from_slice(&self.num_columns.to_le_bytes());
        dst[20..24].copy_from_slice(&self.num_entries.to_le_bytes());
        dst[24..32].copy_from_slice(&self.module.base.to_le_bytes());
        dst[32..36].copy_from_slice(&self.module.size.to_le_bytes());
        dst[36..40].copy_from_slice(&self.module.checksum.to_le_bytes());
        dst[40..44].copy_from_slice(&self.module.time_date_stamp.to_le_bytes());
    }

    pub fn read_from(src: &[u8]) -> Option<Self> {
        if src.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            data_type: read_u32(src, 0),
            agent_id: read_u32(src, 4),
            version: read_u32(src, 8),
            frequency_size: read_u32(src, 12),
            num_columns: read_u32(src, 16),
            num_entries: read_u32(src, 20),
            module: ModuleIdentity {
                base: read_u64(src, 24),
                size: read_u32(src, 32),
                checksum: read_u32(src, 36),
                time_date_stamp: read_u32(src, 40),
            },
        })
    }

    /// Read counter `index` from the record payload holding this header.
    pub fn counter(&self, payload: &[u8], index: usize) -> Option<u32> {
        let width = self.frequency_size as usize;
        let at = Self::SIZE + index * width;
        let raw = payload.get(at..at + width)?;
        Some(match width {
            1 => raw[0] as u32,
            2 => u16::from_le_bytes([raw[0], raw[1]]) as u32,
            4 => u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            _ => return None,
        })
    }
}

/// Header of a trace file, padded to `block_size` on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceFileHeader {
    pub version: u32,
    pub block_size: u32,
    pub process_id: u32,
    pub timestamp: u64,
    pub command_line: String,
}

impl TraceFileHeader {
    const FIXED_SIZE: usize = 32;

    pub fn new(process_id: u32, block_size: u32, command_line: impl Into<String>) -> Self {
        Self {
            version: TRACE_FILE_VERSION,
            block_size,
            process_id,
            timestamp: timestamp_now(),
            command_line: command_line.into(),
        }
    }

    /// Encode the header, padded to the block size.
    pub fn to_bytes(&self) -> Vec<u8> {
        let command_line = self.command_line.as_bytes();
        let mut bytes = Vec::with_capacity(Self::FIXED_SIZE + command_line.len());
        bytes.extend_from_slice(&TRACE_FILE_MAGIC);
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.block_size.to_le_bytes());
        bytes.extend_from_slice(&self.process_id.to_le_bytes());
        bytes.extend_from_slice(&(command_line.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(command_line);
        bytes.resize(pad_to_block(bytes.len(), self.block_size as usize), 0);
        bytes
    }

    /// Parse a header and return it with its padded size.
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < Self::FIXED_SIZE || bytes[..8] != TRACE_FILE_MAGIC {
            return Err(Error::InvalidTraceFile("bad magic".into()));
        }
        let version = read_u32(bytes, 8);
        if version != TRACE_FILE_VERSION {
            return Err(Error::InvalidTraceFile(format!("unsupported version {version}")));
        }
        let block_size = read_u32(bytes, 12);
        if block_size == 0 {
            return Err(Error::InvalidTraceFile("zero block size".into()));
        }
        let process_id = read_u32(bytes, 16);
        let command_line_len = read_u32(bytes, 20) as usize;
        let timestamp = read_u64(bytes, 24);
        let command_line = bytes
            .get(Self::FIXED_SIZE..Self::FIXED_SIZE + command_line_len)
            .ok_or_else(|| Error::InvalidTraceFile("truncated command line".into()))?;

        let header = Self {
            version,
            block_size,
            process_id,
            timestamp,
            command_line: String::from_utf8_lossy(command_line).into_owned(),
        };
        let padded = pad_to_block(Self::FIXED_SIZE + command_line_len, block_size as usize);
        Ok((header, padded))
    }
}

/// Round `len` up to a multiple of `block_size`.
pub fn pad_to_block(len: usize, block_size: usize) -> usize {
    len.div_ceil(block_size) * block_size
}

/// A segment under construction.
///
/// Storage is 8-byte aligned and never reallocates, so pointers into a
/// record payload stay valid for the life of the buffer. Agents rely on this
/// to update counters in place.
#[derive(Debug)]
pub struct TraceBuffer {
    storage: Vec<u64>,
    capacity: usize,
    used: usize,
    thread_id: u32,
}

impl TraceBuffer {
    /// Create a buffer of `capacity` bytes, segment header included.
    pub fn new(capacity: usize, thread_id: u32) -> Self {
        let capacity = capacity.max(SegmentHeader::SIZE);
        Self {
            storage: vec![0; capacity.div_ceil(8)],
            capacity,
            used: SegmentHeader::SIZE,
            thread_id,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes used, segment header included.
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Whether a record with `payload_size` bytes would fit.
    pub fn can_allocate(&self, payload_size: usize) -> bool {
        self.record_end(payload_size) <= self.capacity
    }

    fn record_end(&self, payload_size: usize) -> usize {
        let start = self.used.next_multiple_of(RECORD_ALIGNMENT);
        start + RecordPrefix::SIZE + payload_size
    }

    /// Append a record prefix and reserve its payload. Returns the payload's
    /// byte offset within the buffer.
    pub fn allocate_record(&mut self, record_type: RecordType, payload_size: usize) -> Option<usize> {
        if !self.can_allocate(payload_size) {
            return None;
        }
        let start = self.used.next_multiple_of(RECORD_ALIGNMENT);
        let prefix = RecordPrefix {
            timestamp: timestamp_now(),
            size: payload_size as u32,
            record_type: record_type as u16,
            version: 1,
        };
        prefix.write_to(&mut self.bytes_mut()[start..start + RecordPrefix::SIZE]);
        self.used = start + RecordPrefix::SIZE + payload_size;
        Some(start + RecordPrefix::SIZE)
    }

    /// Append a record with the given payload.
    pub fn append_record(&mut self, record_type: RecordType, payload: &[u8]) -> bool {
        match self.allocate_record(record_type, payload.len()) {
            Some(at) => {
                self.bytes_mut()[at..at + payload.len()].copy_from_slice(payload);
                true
            }
            None => false,
        }
    }

    /// Start of the buffer. Offsets returned by
    /// [`allocate_record`](Self::allocate_record) are relative to it.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.storage.as_mut_ptr() as *mut u8
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let capacity = self.capacity;
        // SAFETY: the storage holds at least `capacity` bytes and any byte
        // pattern is a valid u64.
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), capacity) }
    }

    /// Finish the segment header and return the used bytes.
    pub fn segment(&mut self) -> &[u8] {
        let header = SegmentHeader {
            segment_length: (self.used - SegmentHeader::SIZE) as u32,
            thread_id: self.thread_id,
        };
        let used = self.used;
        let bytes = self.bytes_mut();
        header.write_to(&mut bytes[..SegmentHeader::SIZE]);
        &bytes[..used]
    }

    /// Drop all records, keeping the allocation.
    pub fn reset(&mut self) {
        self.used = SegmentHeader::SIZE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_header_is_block_padded() {
        let header = TraceFileHeader::new(42, 512, "app.exe --flag");
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 512);
        assert_eq!(&bytes[..8], b"HPTRACE\0");

        let (parsed, padded) = TraceFileHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(padded, 512);
    }

    #[test]
    fn test_file_header_rejects_bad_magic() {
        let mut bytes = TraceFileHeader::new(1, 64, "").to_bytes();
        bytes[0] = b'X';
        assert!(matches!(TraceFileHeader::parse(&bytes), Err(Error::InvalidTraceFile(_))));
    }

    #[test]
    fn test_indexed_frequency_header_layout() {
        let header = IndexedFrequencyHeader {
            data_type: data_type::BRANCH,
            agent_id: 7,
            version: 1,
            frequency_size: 4,
            num_columns: 3,
            num_entries: 10,
            module: ModuleIdentity {
                base: 0x1000_0000,
                size: 0x5000,
                checksum: 0xAB,
                time_date_stamp: 0xCD,
            },
        };
        let mut bytes = [0u8; IndexedFrequencyHeader::SIZE];
        header.write_to(&mut bytes);
        assert_eq!(&bytes[24..32], &0x1000_0000u64.to_le_bytes());
        assert_eq!(IndexedFrequencyHeader::read_from(&bytes), Some(header));
        assert_eq!(header.counters_size(), 120);
    }

    #[test]
    fn test_buffer_records_are_aligned() {
        let mut buffer = TraceBuffer::new(128, 9);
        let first = buffer.allocate_record(RecordType::ThreadAttach, 3).unwrap();
        assert_eq!(first, 8 + RecordPrefix::SIZE);
        let second = buffer.allocate_record(RecordType::ThreadDetach, 0).unwrap();
        assert_eq!((second - RecordPrefix::SIZE) % RECORD_ALIGNMENT, 0);
        assert_eq!(buffer.used(), 48);

        let segment = buffer.segment();
        let header = SegmentHeader::read_from(segment).unwrap();
        assert_eq!(header.segment_length, 40);
        assert_eq!(header.thread_id, 9);
    }

    #[test]
    fn test_buffer_exhaustion() {
        let mut buffer = TraceBuffer::new(64, 1);
        assert!(buffer.can_allocate(40));
        assert!(!buffer.can_allocate(41));
        assert!(buffer.allocate_record(RecordType::ModuleAttach, 41).is_none());
        assert!(buffer.append_record(RecordType::ModuleAttach, &[1; 40]));
        assert!(!buffer.can_allocate(0));
    }
}
