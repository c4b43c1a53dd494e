//! Byte-stream writer used when assembling blocks.
//!
//! Appends runs of bytes to a bounded, growable buffer and records optional
//! reference annotations that are resolved once final positions are known.

use crate::block_graph::ReferenceKind;

/// A reference recorded while writing, resolved after layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceAnnotation<T> {
    /// Offset in the stream of the reference window.
    pub offset: usize,
    /// Width of the window in bytes.
    pub width: usize,
    pub kind: ReferenceKind,
    pub target: T,
}

/// Bounded append-only byte writer.
#[derive(Clone, Debug)]
pub struct ByteStreamWriter<T> {
    bytes: Vec<u8>,
    limit: usize,
    references: Vec<ReferenceAnnotation<T>>,
}

impl<T> ByteStreamWriter<T> {
    /// Create a writer that may hold at most `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            references: Vec::new(),
        }
    }

    /// Current write position.
    #[inline]
    pub fn position(&self) -> usize {
        self.bytes.len()
    }

    /// Bytes still available before the limit.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.limit - self.bytes.len()
    }

    /// Append `data`, optionally annotating a reference window that starts
    /// `reference.0` bytes into it.
    ///
    /// Panics if the write would exceed the limit or the window leaves `data`.
    pub fn append(&mut self, data: &[u8], reference: Option<(usize, usize, ReferenceKind, T)>) {
        assert!(
            data.len() <= self.remaining(),
            "byte stream overflow: {} + {} > {}",
            self.bytes.len(),
            data.len(),
            self.limit
        );
        let start = self.bytes.len();
        if let Some((within, width, kind, target)) = reference {
            assert!(within + width <= data.len(), "reference window outside appended bytes");
            self.references.push(ReferenceAnnotation {
                offset: start + within,
                width,
                kind,
                target,
            });
        }
        self.bytes.extend_from_slice(data);
    }

    /// Append `count` copies of `byte`.
    pub fn fill(&mut self, byte: u8, count: usize) {
        assert!(count <= self.remaining(), "byte stream overflow");
        self.bytes.resize(self.bytes.len() + count, byte);
    }

    /// Overwrite already-written bytes at `offset`.
    pub fn patch(&mut self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.bytes.len(), "patch outside written bytes");
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn references(&self) -> &[ReferenceAnnotation<T>] {
        &self.references
    }

    /// Finish writing, yielding the bytes and the recorded references.
    pub fn into_parts(self) -> (Vec<u8>, Vec<ReferenceAnnotation<T>>) {
        (self.bytes, self.references)
    }
}
