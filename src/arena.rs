//! Writes decomposed blocks into executable memory.
//!
//! The arena is a single executable region filled front to back. A block is
//! placed after its padding at its alignment, references are resolved
//! against the live addresses of their targets, and the block is switched to
//! alias its new copy. Blocks already written never move.

use std::ptr::NonNull;

use tracing::{debug, warn};

use crate::block_graph::{write_reference_value, BlockGraph, BlockId, ReferenceKind};
use crate::memory::ExecutableMemory;
use crate::pe::PeHeaders;

/// Default arena size.
pub const DEFAULT_ARENA_SIZE: usize = 1 << 20;

#[derive(Clone, Copy, Debug)]
pub struct ArenaConfig {
    pub size: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_ARENA_SIZE,
        }
    }
}

/// Bump allocator over an executable region.
#[derive(Debug)]
pub struct ExecutableArenaWriter {
    memory: ExecutableMemory,
    cursor: usize,
}

impl ExecutableArenaWriter {
    pub fn new(config: ArenaConfig) -> Option<Self> {
        Some(Self {
            memory: ExecutableMemory::allocate(config.size)?,
            cursor: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.memory.size()
    }

    pub fn used(&self) -> usize {
        self.cursor
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.memory.contains(addr)
    }

    /// Copy `id` into the arena and return where it landed, or `None` when
    /// the arena cannot hold it.
    ///
    /// Every reference target other than the block itself must already have
    /// data in this process. Panics if a resolved value does not fit its
    /// window, or on relative references, which have no meaning here.
    pub fn write_block(&mut self, graph: &mut BlockGraph, id: BlockId) -> Option<NonNull<u8>> {
        let base = self.memory.base() as usize;
        let block = graph.block(id);
        let size = block.size();

        let start = base + self.cursor + block.padding_before() as usize;
        let placed = PeHeaders::align_up(start, block.alignment() as usize) - base;
        if placed + size > self.memory.size() {
            warn!(block = block.name(), size, remaining = self.memory.size() - self.cursor, "arena exhausted");
            return None;
        }
        let addr = base + placed;

        let mut values = Vec::with_capacity(block.references().len());
        for (&offset, reference) in block.references() {
            assert!(reference.is_direct(), "indirect reference in block '{}'", block.name());
            let target_base = if reference.target() == id {
                addr as i64
            } else {
                let target = graph.block(reference.target());
                let ptr = target
                    .data_ptr()
                    .unwrap_or_else(|| panic!("reference target '{}' has no data", target.name()));
                ptr as i64
            };
            let target_addr = target_base + reference.offset();

            let value = match reference.kind() {
                ReferenceKind::Absolute => target_addr,
                ReferenceKind::PcRelative => target_addr - (addr + offset + reference.size()) as i64,
                ReferenceKind::Relative => panic!("relative reference in block '{}'", block.name()),
            };
            values.push((offset, reference.kind(), reference.size(), value));
        }

        let dst = &mut self.memory.as_mut_slice()[placed..placed + size];
        let data = block.data();
        dst[..data.len()].copy_from_slice(data);
        dst[data.len()..].fill(0);
        for (offset, kind, width, value) in values {
            write_reference_value(&mut dst[offset..], kind, width, value);
        }
        self.memory.flush(placed, size);

        debug!(block = block.name(), addr = format_args!("{addr:#x}"), size, "wrote block to arena");
        self.cursor = placed + size;

        // SAFETY: the arena outlives the graph's use of the copy, and the
        // copy is exactly `size` bytes.
        unsafe { graph.block_mut(id).set_external_data(addr as *const u8, size) };
        NonNull::new(addr as *mut u8)
    }
}
