//! Emits the hot-patch metadata section into a block graph.
//!
//! The metadata block is created before layout, so entry RVAs are not yet
//! known. Each entry's `rva` field carries a relative reference to its block
//! and receives its value when references are finalized.

use tracing::info;

use crate::block_graph::{BlockGraph, BlockId, BlockType, Reference, ReferenceKind};
use crate::error::{Error, Result};
use crate::metadata::{
    HotPatchingMetadata, MetadataEntry, ENTRY_RVA_OFFSET, ENTRY_SIZE, HEADER_SIZE,
    HOTPATCH_METADATA_SECTION_NAME,
};
use crate::pe::METADATA_SECTION_CHARACTERISTICS;

/// Name of the block holding the metadata.
pub const METADATA_BLOCK_NAME: &str = "hot-patching-metadata";

/// Collects hot-patched blocks and writes their metadata.
#[derive(Debug, Default)]
pub struct HotPatchingMetadataWriter {
    blocks: Vec<BlockId>,
}

impl HotPatchingMetadataWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blocks(blocks: &[BlockId]) -> Self {
        Self {
            blocks: blocks.to_vec(),
        }
    }

    pub fn add_block(&mut self, block: BlockId) {
        self.blocks.push(block);
    }

    /// Create the metadata section and block. Entries follow the blocks'
    /// current address order, which layout preserves.
    pub fn write(&self, graph: &mut BlockGraph) -> Result<BlockId> {
        let mut blocks = self.blocks.clone();
        blocks.sort_by_key(|&id| (graph.block(id).addr(), id));
        blocks.dedup();

        let mut entries = Vec::with_capacity(blocks.len());
        for &id in &blocks {
            let block = graph.block(id);
            let too_large = || Error::BlockTooLarge {
                name: block.name().to_string(),
                size: block.size(),
            };
            entries.push(MetadataEntry {
                rva: 0,
                block_size: u16::try_from(block.size()).map_err(|_| too_large())?,
                code_size: u16::try_from(block.code_size()).map_err(|_| too_large())?,
            });
        }

        // Placeholder RVAs of zero keep the entries from looking sorted, so
        // encode without validation.
        let bytes = encode_unvalidated(&entries);

        let section = match graph.find_section(HOTPATCH_METADATA_SECTION_NAME) {
            Some(section) => section,
            None => graph.add_section(HOTPATCH_METADATA_SECTION_NAME, METADATA_SECTION_CHARACTERISTICS),
        };
        let id = graph.add_block(BlockType::Data, 0, bytes.len(), METADATA_BLOCK_NAME);
        let metadata = graph.block_mut(id);
        metadata.set_section(Some(section));
        metadata.set_alignment(4);
        metadata.set_data(bytes);
        for (i, &target) in blocks.iter().enumerate() {
            metadata.set_reference(
                HEADER_SIZE + i * ENTRY_SIZE + ENTRY_RVA_OFFSET,
                Reference::new(ReferenceKind::Relative, 4, target, 0),
            );
        }

        info!(entries = blocks.len(), "wrote hot-patching metadata");
        Ok(id)
    }
}

fn encode_unvalidated(entries: &[MetadataEntry]) -> Vec<u8> {
    let mut bytes = HotPatchingMetadata::default().to_bytes();
    bytes[4..8].copy_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        bytes.extend_from_slice(&entry.rva.to_le_bytes());
        bytes.extend_from_slice(&entry.block_size.to_le_bytes());
        bytes.extend_from_slice(&entry.code_size.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_graph::{Label, LabelAttributes};
    use crate::layout::ImageLayout;
    use crate::pe::CODE_SECTION_CHARACTERISTICS;

    #[test]
    fn test_metadata_block_shape() {
        let mut graph = BlockGraph::new();
        let text = graph.add_section(".text", CODE_SECTION_CHARACTERISTICS);
        let a = graph.add_block_at(BlockType::Code, 0, 8, "a").unwrap();
        let b = graph.add_block_at(BlockType::Code, 8, 6, "b").unwrap();
        graph.block_mut(b).set_label(4, Label::new("<data>", LabelAttributes::DATA));
        for id in [a, b] {
            graph.block_mut(id).set_section(Some(text));
        }

        let metadata = HotPatchingMetadataWriter::with_blocks(&[b, a]).write(&mut graph).unwrap();
        let block = graph.block(metadata);
        assert_eq!(block.size(), 24);
        assert_eq!(block.references().len(), 2);
        assert_eq!(block.reference(8).unwrap().target(), a);
        assert_eq!(block.reference(16).unwrap().target(), b);
        assert_eq!(block.reference(16).unwrap().kind(), ReferenceKind::Relative);
        assert_eq!(&block.data()[20..24], &[6, 0, 4, 0]);

        let layout = ImageLayout::build(&mut graph, 0x0040_0000, 0x1000, 0x1000);
        layout.finalize_references(&mut graph);
        let parsed = HotPatchingMetadata::parse(graph.block(metadata).data()).unwrap();
        assert_eq!(
            parsed.entries(),
            &[
                MetadataEntry {
                    rva: 0x1000,
                    block_size: 8,
                    code_size: 8,
                },
                MetadataEntry {
                    rva: 0x1008,
                    block_size: 6,
                    code_size: 4,
                },
            ]
        );
    }

    #[test]
    fn test_block_too_large() {
        let mut graph = BlockGraph::new();
        let big = graph.add_block_at(BlockType::Code, 0, 0x1_0000, "big").unwrap();
        assert!(matches!(
            HotPatchingMetadataWriter::with_blocks(&[big]).write(&mut graph),
            Err(Error::BlockTooLarge { size: 0x1_0000, .. })
        ));
    }
}
