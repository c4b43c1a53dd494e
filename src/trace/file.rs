//! Trace file writer and reader.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::format::{pad_to_block, RecordPrefix, RecordType, SegmentHeader, TraceFileHeader, RECORD_ALIGNMENT};
use crate::error::{Error, Result};

/// Appends block-padded segments to a trace file.
#[derive(Debug)]
pub struct TraceFileWriter {
    file: File,
    path: PathBuf,
    block_size: usize,
    len: u64,
}

impl TraceFileWriter {
    /// Create `path` and write its header.
    pub fn create(path: impl AsRef<Path>, header: &TraceFileHeader) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::create(&path)?;
        let bytes = header.to_bytes();
        file.write_all(&bytes)?;
        debug!(path = %path.display(), process_id = header.process_id, "created trace file");
        Ok(Self {
            file,
            path,
            block_size: header.block_size as usize,
            len: bytes.len() as u64,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Write one segment as produced by a client, padded to the block size.
    ///
    /// The segment header must describe no more bytes than were sent.
    pub fn write_segment(&mut self, segment: &[u8]) -> Result<()> {
        let header = SegmentHeader::read_from(segment)
            .ok_or_else(|| Error::InvalidTraceFile("segment shorter than its header".into()))?;
        let end = SegmentHeader::SIZE + header.segment_length as usize;
        if end > segment.len() {
            return Err(Error::InvalidTraceFile(format!(
                "segment claims {} bytes but carries {}",
                header.segment_length,
                segment.len() - SegmentHeader::SIZE
            )));
        }

        let padded = pad_to_block(end, self.block_size);
        self.file.write_all(&segment[..end])?;
        self.file.write_all(&vec![0u8; padded - end])?;
        self.len += padded as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

/// A record inside a segment.
#[derive(Clone, Copy, Debug)]
pub struct Record<'a> {
    pub prefix: RecordPrefix,
    pub payload: &'a [u8],
}

impl Record<'_> {
    pub fn record_type(&self) -> Option<RecordType> {
        RecordType::try_from(self.prefix.record_type).ok()
    }
}

/// A parsed segment.
#[derive(Clone, Debug)]
pub struct Segment<'a> {
    pub header: SegmentHeader,
    pub records: Vec<Record<'a>>,
}

/// Reads a whole trace file into memory.
#[derive(Debug)]
pub struct TraceFileReader {
    header: TraceFileHeader,
    bytes: Vec<u8>,
    data_start: usize,
}

impl TraceFileReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(fs::read(path)?)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let (header, data_start) = TraceFileHeader::parse(&bytes)?;
        Ok(Self {
            header,
            bytes,
            data_start,
        })
    }

    pub fn header(&self) -> &TraceFileHeader {
        &self.header
    }

    /// Parse every segment in file order.
    pub fn segments(&self) -> Result<Vec<Segment<'_>>> {
        let block_size = self.header.block_size as usize;
        let mut segments = Vec::new();
        let mut pos = self.data_start;

        while pos + SegmentHeader::SIZE <= self.bytes.len() {
            let header = SegmentHeader::read_from(&self.bytes[pos..])
                .ok_or_else(|| Error::InvalidTraceFile("truncated segment header".into()))?;
            let body_start = pos + SegmentHeader::SIZE;
            let body_end = body_start + header.segment_length as usize;
            if body_end > self.bytes.len() {
                return Err(Error::InvalidTraceFile(format!("segment at {pos:#x} runs past end of file")));
            }

            segments.push(Segment {
                header,
                records: parse_records(&self.bytes[pos..body_end])?,
            });
            pos += pad_to_block(body_end - pos, block_size).max(block_size);
        }
        Ok(segments)
    }
}

/// Parse the records of a segment; offsets are relative to the segment
/// start so record alignment matches what the writer produced.
fn parse_records(segment: &[u8]) -> Result<Vec<Record<'_>>> {
    let mut records = Vec::new();
    let mut pos = SegmentHeader::SIZE;
    while pos < segment.len() {
        pos = pos.next_multiple_of(RECORD_ALIGNMENT);
        if pos >= segment.len() {
            break;
        }
        let prefix = RecordPrefix::read_from(&segment[pos..])
            .ok_or_else(|| Error::InvalidTraceFile("truncated record prefix".into()))?;
        let start = pos + RecordPrefix::SIZE;
        let payload = segment
            .get(start..start + prefix.size as usize)
            .ok_or_else(|| Error::InvalidTraceFile("truncated record payload".into()))?;
        records.push(Record { prefix, payload });
        pos = start + prefix.size as usize;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::format::TraceBuffer;

    #[test]
    fn test_write_and_read_segments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace-1.bin");
        let header = TraceFileHeader::new(1234, 256, "demo.exe");
        let mut writer = TraceFileWriter::create(&path, &header).unwrap();

        let mut first = TraceBuffer::new(256, 10);
        assert!(first.append_record(RecordType::ProcessAttach, b"abc"));
        assert!(first.append_record(RecordType::ThreadAttach, &[]));
        writer.write_segment(first.segment()).unwrap();

        let mut second = TraceBuffer::new(1024, 11);
        assert!(second.append_record(RecordType::ModuleAttach, &[7; 300]));
        writer.write_segment(second.segment()).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.len(), 256 + 256 + 512);

        let reader = TraceFileReader::open(&path).unwrap();
        assert_eq!(reader.header().process_id, 1234);
        let segments = reader.segments().unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].header.thread_id, 10);
        assert_eq!(segments[0].records.len(), 2);
        assert_eq!(segments[0].records[0].payload, b"abc");
        assert_eq!(segments[0].records[1].record_type(), Some(RecordType::ThreadAttach));
        assert_eq!(segments[1].records[0].payload.len(), 300);
    }

    #[test]
    fn test_short_segment_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let header = TraceFileHeader::new(1, 64, "");
        let mut writer = TraceFileWriter::create(dir.path().join("t.bin"), &header).unwrap();

        let mut segment = vec![0u8; 12];
        SegmentHeader {
            segment_length: 100,
            thread_id: 1,
        }
        .write_to(&mut segment);
        assert!(matches!(writer.write_segment(&segment), Err(Error::InvalidTraceFile(_))));
    }
}
