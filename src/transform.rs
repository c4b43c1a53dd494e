//! Hot-patching preparation of code blocks.
//!
//! A block is hot-patchable when a 5-byte jump can be written in front of it
//! and its first instruction can then be replaced by a 2-byte jump back onto
//! that padding, both with a single atomic store. The basic-block transform
//! makes that possible; the block transform drives it over a whole graph and
//! collects the blocks for the metadata writer.

use tracing::{debug, info};

use crate::basic_block::{
    BasicBlock, BasicBlockDecomposer, BasicBlockInstruction, BasicBlockSubGraph, BlockBuilder,
};
use crate::block_graph::{BlockAttributes, BlockGraph, BlockId, BlockType};
use crate::error::{Error, Result};

/// Bytes of padding reserved in front of each block for a long jump.
pub const HOT_PATCH_PADDING: u32 = 5;

/// Alignment that keeps the first two bytes of a block in one atomic store.
pub const HOT_PATCH_MIN_ALIGNMENT: u32 = 2;

/// Prepares one basic-block subgraph for hot-patching.
#[derive(Clone, Copy, Debug, Default)]
pub struct HotPatchingBasicBlockTransform;

impl HotPatchingBasicBlockTransform {
    pub const NAME: &'static str = "HotPatchingBasicBlockTransform";

    pub fn new() -> Self {
        Self
    }

    /// Reserve padding, raise alignment, and make the first instruction at
    /// least two bytes long.
    pub fn transform(&self, subgraph: &mut BasicBlockSubGraph) -> Result<()> {
        let description = subgraph.description();
        if description.padding_before != 0 {
            return Err(Error::PaddingAlreadyRequested(description.name.clone()));
        }
        let first = *description
            .basic_block_order
            .first()
            .ok_or_else(|| Error::NotDecomposable {
                block: description.name.clone(),
                reason: "no basic blocks".to_string(),
            })?;

        let name = description.name.clone();
        let BasicBlock::Code(code) = subgraph.basic_block_mut(first) else {
            return Err(Error::NotDecomposable {
                block: name,
                reason: "block does not start with code".to_string(),
            });
        };

        // An empty basic block starts with its successor branch, which is
        // already at least two bytes.
        if code.instructions.first().is_some_and(|instr| instr.size() == 1) {
            code.instructions.insert(0, BasicBlockInstruction::nop(2));
        }

        let description = subgraph.description_mut();
        description.padding_before = HOT_PATCH_PADDING;
        description.alignment = description.alignment.max(HOT_PATCH_MIN_ALIGNMENT);
        description.attributes |= BlockAttributes::HOT_PATCHED;
        Ok(())
    }
}

/// Applies [`HotPatchingBasicBlockTransform`] to every decomposable code
/// block of a graph.
#[derive(Debug, Default)]
pub struct HotPatchingTransform {
    prepared: Vec<BlockId>,
}

impl HotPatchingTransform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks prepared so far, in the order they were transformed.
    pub fn prepared_blocks(&self) -> &[BlockId] {
        &self.prepared
    }

    /// Transform a single block. Blocks that cannot be basic-block
    /// decomposed are left alone and reported as `Ok(false)`.
    pub fn transform_block(&mut self, graph: &mut BlockGraph, id: BlockId) -> Result<bool> {
        let mut subgraph = match BasicBlockDecomposer::new(graph, id).decompose() {
            Ok(subgraph) => subgraph,
            Err(Error::NotDecomposable { block, reason }) => {
                debug!(%block, %reason, "skipping block");
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        HotPatchingBasicBlockTransform::new().transform(&mut subgraph)?;
        BlockBuilder::merge(graph, &subgraph)?;
        self.prepared.push(id);
        Ok(true)
    }

    /// Transform every code block, in address order.
    pub fn apply(&mut self, graph: &mut BlockGraph) -> Result<()> {
        let mut ids: Vec<(u64, BlockId)> = graph
            .blocks()
            .filter(|b| b.block_type() == BlockType::Code)
            .map(|b| (b.addr(), b.id()))
            .collect();
        ids.sort();

        let mut skipped = 0;
        for (_, id) in ids {
            if !self.transform_block(graph, id)? {
                skipped += 1;
            }
        }

        info!(prepared = self.prepared.len(), skipped, "hot-patching transform complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic_block::BasicBlockId;
    use crate::block_graph::{Label, LabelAttributes};

    fn decompose(bytes: &[u8]) -> (BlockGraph, BasicBlockSubGraph) {
        let mut graph = BlockGraph::new();
        let id = graph.add_block_at(BlockType::Code, 0x1000, bytes.len(), "f").unwrap();
        graph.block_mut(id).set_data(bytes.to_vec());
        let subgraph = BasicBlockDecomposer::new(&graph, id).decompose().unwrap();
        (graph, subgraph)
    }

    #[test]
    fn test_one_byte_block() {
        let (mut graph, mut subgraph) = decompose(&[0x40]);
        HotPatchingBasicBlockTransform::new().transform(&mut subgraph).unwrap();
        BlockBuilder::merge(&mut graph, &subgraph).unwrap();

        let block = graph.block(subgraph.original_block());
        assert_eq!(block.alignment(), 2);
        assert_eq!(block.padding_before(), 5);
        assert_eq!(block.data(), &[0x66, 0x90, 0x40]);
        assert!(block.labels().is_empty());
        assert!(block.references().is_empty());
    }

    #[test]
    fn test_two_byte_first_instruction_untouched() {
        // mov eax, ecx; ret
        let (mut graph, mut subgraph) = decompose(&[0x89, 0xC8, 0xC3]);
        HotPatchingBasicBlockTransform::new().transform(&mut subgraph).unwrap();
        BlockBuilder::merge(&mut graph, &subgraph).unwrap();
        assert_eq!(graph.block(subgraph.original_block()).data(), &[0x89, 0xC8, 0xC3]);
    }

    #[test]
    fn test_endless_loop_retargets_to_new_start() {
        // inc eax; jmp -3
        let (mut graph, mut subgraph) = decompose(&[0x40, 0xEB, 0xFD]);
        HotPatchingBasicBlockTransform::new().transform(&mut subgraph).unwrap();
        BlockBuilder::merge(&mut graph, &subgraph).unwrap();
        assert_eq!(
            graph.block(subgraph.original_block()).data(),
            &[0x66, 0x90, 0x40, 0xEB, 0xFB]
        );
    }

    #[test]
    fn test_alignment_only_raised() {
        let (_, mut subgraph) = decompose(&[0xC3]);
        subgraph.description_mut().alignment = 16;
        HotPatchingBasicBlockTransform::new().transform(&mut subgraph).unwrap();
        assert_eq!(subgraph.description().alignment, 16);
    }

    #[test]
    fn test_existing_padding_rejected() {
        let (_, mut subgraph) = decompose(&[0xC3]);
        subgraph.description_mut().padding_before = 3;
        assert!(matches!(
            HotPatchingBasicBlockTransform::new().transform(&mut subgraph),
            Err(Error::PaddingAlreadyRequested(_))
        ));
    }

    #[test]
    fn test_labels_survive() {
        let mut graph = BlockGraph::new();
        let id = graph.add_block_at(BlockType::Code, 0x1000, 1, "f").unwrap();
        graph.block_mut(id).set_data(vec![0xC3]);
        graph
            .block_mut(id)
            .set_label(0, Label::new("<code>", LabelAttributes::CODE));

        let mut transform = HotPatchingTransform::new();
        assert!(transform.transform_block(&mut graph, id).unwrap());
        let block = graph.block(id);
        assert_eq!(block.data(), &[0x66, 0x90, 0xC3]);
        assert_eq!(block.label(0).unwrap().name(), "<code>");
        assert!(block.attributes().contains(BlockAttributes::HOT_PATCHED));
        assert_eq!(transform.prepared_blocks(), &[id]);
    }

    #[test]
    fn test_apply_skips_unsupported_blocks() {
        let mut graph = BlockGraph::new();
        let good = graph.add_block_at(BlockType::Code, 0x1000, 1, "good").unwrap();
        graph.block_mut(good).set_data(vec![0xC3]);
        let bad = graph.add_block_at(BlockType::Code, 0x1010, 1, "bad").unwrap();
        graph.block_mut(bad).set_data(vec![0xC3]);
        graph
            .block_mut(bad)
            .set_attributes(BlockAttributes::BUILT_BY_UNSUPPORTED_COMPILER);
        graph.add_block_at(BlockType::Data, 0x2000, 4, "data").unwrap();

        let mut transform = HotPatchingTransform::new();
        transform.apply(&mut graph).unwrap();
        assert_eq!(transform.prepared_blocks(), &[good]);
        assert_eq!(graph.block(bad).padding_before(), 0);
    }

    #[test]
    fn test_first_basic_block_must_be_code() {
        let (_, mut subgraph) = decompose(&[0xC3]);
        let data = subgraph.add_basic_block(BasicBlock::Data(Default::default()));
        subgraph.description_mut().basic_block_order.insert(0, data);
        assert!(HotPatchingBasicBlockTransform::new().transform(&mut subgraph).is_err());
        assert_ne!(data, BasicBlockId(0));
    }
}
