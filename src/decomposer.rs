//! In-memory decomposer for hot-patchable images.
//!
//! Builds a block graph for the blocks a loaded image lists in its hot-patch
//! metadata, recovering the references and tables the hot-patcher needs
//! from the machine code itself. The image is 32-bit x86 and may be mapped
//! at any address; blocks alias the mapped bytes instead of copying them.

use std::marker::PhantomData;

use iced_x86::{Decoder, DecoderOptions, Instruction, MemorySize, Mnemonic, OpKind, Register};
use tracing::{debug, info, trace};

use crate::block_graph::{
    Block, BlockAttributes, BlockGraph, BlockId, BlockType, Label, LabelAttributes, Reference, ReferenceKind,
    SectionId,
};
use crate::error::{Error, Result};
use crate::metadata::HotPatchingMetadata;
use crate::pe::{MappedImage, PeHeaders};

pub const CODE_LABEL_NAME: &str = "<code>";
pub const DATA_LABEL_NAME: &str = "<data>";
pub const JUMP_TABLE_LABEL_NAME: &str = "<jump-table>";
pub const CASE_TABLE_LABEL_NAME: &str = "<case-table>";

/// The result of decomposing a hot-patchable image.
///
/// Blocks alias the image's bytes, so the image must outlive this value.
#[derive(Debug)]
pub struct DecomposedImage<'a> {
    pub headers: PeHeaders,
    pub metadata: HotPatchingMetadata,
    pub graph: BlockGraph,
    /// Blocks listed in the metadata, in metadata order.
    pub blocks: Vec<BlockId>,
    _image: PhantomData<&'a [u8]>,
}

pub struct HotPatchingDecomposer<'a> {
    image: MappedImage<'a>,
}

impl<'a> HotPatchingDecomposer<'a> {
    pub fn new(image: MappedImage<'a>) -> Self {
        Self { image }
    }

    pub fn decompose(&self) -> Result<DecomposedImage<'a>> {
        let headers = self.image.headers()?;
        let metadata = HotPatchingMetadata::from_image_with_headers(&self.image, &headers)?;

        let mut graph = BlockGraph::new();
        for section in &headers.sections {
            graph.add_section(&section.name, section.characteristics);
        }

        let mut blocks = Vec::with_capacity(metadata.len());
        for entry in metadata.entries() {
            let id = self.create_block(&mut graph, &headers, entry.rva, entry.block_size as usize)?;
            let block = graph.block_mut(id);
            block.set_label(0, Label::new(CODE_LABEL_NAME, LabelAttributes::CODE));
            if (entry.code_size as usize) < block.size() {
                block.set_label(
                    entry.code_size as usize,
                    Label::new(DATA_LABEL_NAME, LabelAttributes::DATA),
                );
            }
            blocks.push(id);
        }

        for &id in &blocks {
            let code_size = graph.block(id).code_size();
            self.infer_references(&mut graph, &headers, id, code_size)?;
        }
        for &id in &blocks {
            infer_jump_table_references(&mut graph, id);
        }

        info!(
            blocks = blocks.len(),
            total_blocks = graph.len(),
            "decomposed hot-patchable image"
        );

        Ok(DecomposedImage {
            headers,
            metadata,
            graph,
            blocks,
            _image: PhantomData,
        })
    }

    fn section_of(headers: &PeHeaders, rva: u32) -> Option<SectionId> {
        headers.sections.iter().position(|s| s.contains_rva(rva)).map(SectionId)
    }

    fn create_block(&self, graph: &mut BlockGraph, headers: &PeHeaders, rva: u32, size: usize) -> Result<BlockId> {
        let bytes = self.image.slice(rva, size).ok_or(Error::InvalidMetadataEntry {
            rva,
            reason: "block lies outside the mapped image",
        })?;
        let addr = self.image.load_address + rva as u64;
        let id = graph
            .add_block_at(BlockType::Code, addr, size, &format!("block_{rva:08X}"))
            .ok_or(Error::InvalidMetadataEntry {
                rva,
                reason: "entry overlaps another block",
            })?;

        let block = graph.block_mut(id);
        block.set_section(Self::section_of(headers, rva));
        // SAFETY: `DecomposedImage` borrows the image for as long as the graph lives.
        unsafe { block.set_external_data(bytes.as_ptr(), bytes.len()) };
        Ok(id)
    }

    /// Stand in for a branch target no metadata entry covers. The caller has
    /// checked that no block contains `addr`.
    fn create_placeholder(&self, graph: &mut BlockGraph, headers: &PeHeaders, addr: u64) -> BlockId {
        let name = format!("placeholder_{addr:08X}");
        let id = graph
            .add_block_at(BlockType::Code, addr, 1, &name)
            .unwrap_or_else(|| graph.add_block(BlockType::Code, addr, 1, &name));

        let block = graph.block_mut(id);
        block.set_attributes(BlockAttributes::BUILT_BY_UNSUPPORTED_COMPILER | BlockAttributes::PLACEHOLDER);
        if let Ok(rva) = u32::try_from(addr.wrapping_sub(self.image.load_address)) {
            block.set_section(Self::section_of(headers, rva));
            if let Some(bytes) = self.image.slice(rva, 1) {
                // SAFETY: as in `create_block`.
                unsafe { block.set_external_data(bytes.as_ptr(), 1) };
            }
        }
        trace!(addr = format_args!("{addr:#x}"), "created placeholder block");
        id
    }

    /// First pass: recover pc-relative branch references and jump and case
    /// tables, and check that nothing else points into the block.
    fn infer_references(&self, graph: &mut BlockGraph, headers: &PeHeaders, id: BlockId, code_size: usize) -> Result<()> {
        let (addr, size, code) = {
            let block = graph.block(id);
            (block.addr(), block.size(), block.data()[..code_size].to_vec())
        };
        let in_block = |value: u64| value >= addr && value < addr + size as u64;
        let in_data = |value: u64| value >= addr + code_size as u64 && value < addr + size as u64;

        let mut decoder = Decoder::with_ip(32, &code, addr, DecoderOptions::NONE);
        let mut instr = Instruction::default();
        let mut references = 0;

        while decoder.can_decode() {
            let offset = decoder.position();
            decoder.decode_out(&mut instr);
            if instr.is_invalid() {
                return Err(Error::InvalidInstruction {
                    block: graph.block(id).name().to_string(),
                    offset,
                });
            }
            let len = instr.len();
            let bytes = &code[offset..offset + len];

            if let Some(target) = rel32_target(&instr, bytes) {
                let target_id = match graph.find_containing(target) {
                    Some(target_id) => target_id,
                    None => self.create_placeholder(graph, headers, target),
                };
                let target_offset = target as i64 - graph.block(target_id).addr() as i64;
                graph.block_mut(id).set_reference(
                    offset + len - 4,
                    Reference::new(ReferenceKind::PcRelative, 4, target_id, target_offset),
                );
                references += 1;
                continue;
            }

            let offsets = decoder.get_constant_offsets(&instr);
            if let Some(label) = table_label(&instr) {
                let displacement = instr.memory_displacement32() as u64;
                if in_data(displacement) {
                    let table = (displacement - addr) as usize;
                    let block = graph.block_mut(id);
                    insert_table_label(block, table, label)?;
                    block.set_reference(
                        offset + offsets.displacement_offset(),
                        Reference::new(ReferenceKind::Absolute, 4, id, table as i64),
                    );
                    references += 1;
                    continue;
                }
            }

            if len >= 5 && instr.op_count() > 0 && instr.op0_kind() == OpKind::NearBranch32 {
                return Err(Error::UnexpectedPcRelative { addr: instr.ip() });
            }
            let has_memory = (0..instr.op_count()).any(|i| instr.op_kind(i) == OpKind::Memory);
            if has_memory && instr.memory_displ_size() == 4 && in_block(instr.memory_displacement32() as u64) {
                return Err(Error::DisplacementIntoBlock { addr: instr.ip() });
            }
        }

        debug!(block = %id, references, "inferred references");
        Ok(())
    }
}

/// The target of a branch or call whose last four bytes are its rel32.
fn rel32_target(instr: &Instruction, bytes: &[u8]) -> Option<u64> {
    if bytes.len() < 5 || instr.op_count() == 0 || instr.op0_kind() != OpKind::NearBranch32 {
        return None;
    }
    let tail = &bytes[bytes.len() - 4..];
    let disp = i32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let target = (instr.next_ip() as u32).wrapping_add(disp as u32);
    (target == instr.near_branch32()).then_some(target as u64)
}

/// Label for the table read by `jmp [reg*4 + disp32]` or
/// `movzx r32, byte [reg + disp32]`.
fn table_label(instr: &Instruction) -> Option<Label> {
    if instr.memory_displ_size() != 4 {
        return None;
    }
    match instr.mnemonic() {
        Mnemonic::Jmp
            if instr.op0_kind() == OpKind::Memory
                && instr.memory_base() == Register::None
                && instr.memory_index() != Register::None
                && instr.memory_index_scale() == 4 =>
        {
            Some(Label::new(
                JUMP_TABLE_LABEL_NAME,
                LabelAttributes::DATA | LabelAttributes::JUMP_TABLE,
            ))
        }
        Mnemonic::Movzx
            if instr.op_count() == 2
                && instr.op1_kind() == OpKind::Memory
                && instr.memory_size() == MemorySize::UInt8
                && instr.memory_base() != Register::None
                && instr.memory_index() == Register::None =>
        {
            Some(Label::new(
                CASE_TABLE_LABEL_NAME,
                LabelAttributes::DATA | LabelAttributes::CASE_TABLE,
            ))
        }
        _ => None,
    }
}

/// Place a table label. A plain data label gives way; an identical table
/// label is kept; anything else conflicts.
fn insert_table_label(block: &mut Block, offset: usize, label: Label) -> Result<()> {
    match block.label(offset) {
        None => {}
        Some(existing) if existing.attributes() == LabelAttributes::DATA => {
            block.remove_label(offset);
        }
        Some(existing) if *existing == label => return Ok(()),
        Some(_) => {
            return Err(Error::ConflictingLabel {
                block: block.name().to_string(),
                offset,
            })
        }
    }
    block.set_label(offset, label);
    Ok(())
}

/// Second pass: words of each jump table that point back into the block
/// become absolute self-references.
fn infer_jump_table_references(graph: &mut BlockGraph, id: BlockId) {
    let block = graph.block(id);
    let (addr, size, code_size) = (block.addr(), block.size(), block.code_size());
    let label_offsets: Vec<usize> = block.labels().keys().copied().collect();
    let tables: Vec<(usize, usize)> = block
        .labels()
        .iter()
        .filter(|(&start, label)| start >= code_size && label.has_attributes(LabelAttributes::JUMP_TABLE))
        .map(|(&start, _)| {
            let end = label_offsets
                .iter()
                .copied()
                .find(|&o| o > start)
                .unwrap_or(size)
                .min(size);
            (start, end)
        })
        .collect();

    let mut found = Vec::new();
    for (start, end) in tables {
        let data = block.data();
        let mut pos = start;
        while pos + 4 <= end {
            let value = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as u64;
            if value >= addr && value < addr + size as u64 {
                found.push((pos, (value - addr) as i64));
            }
            pos += 4;
        }
    }

    let block = graph.block_mut(id);
    for (pos, target) in found {
        block.set_reference(pos, Reference::new(ReferenceKind::Absolute, 4, id, target));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MetadataEntry, HOTPATCH_METADATA_SECTION_NAME};
    use crate::pe::{MappedImageBuilder, CODE_SECTION_CHARACTERISTICS, METADATA_SECTION_CHARACTERISTICS};

    const IMAGE_BASE: u32 = 0x003F_F000;

    fn image(text: Vec<u8>, entries: Vec<MetadataEntry>) -> Vec<u8> {
        let metadata = HotPatchingMetadata::new(entries).unwrap();
        MappedImageBuilder::new(IMAGE_BASE)
            .section(".text", 0x1000, text, CODE_SECTION_CHARACTERISTICS)
            .section(HOTPATCH_METADATA_SECTION_NAME, 0x2000, metadata.to_bytes(), METADATA_SECTION_CHARACTERISTICS)
            .build()
    }

    fn entry(rva: u32, block_size: u16, code_size: u16) -> MetadataEntry {
        MetadataEntry {
            rva,
            block_size,
            code_size,
        }
    }

    #[test]
    fn test_call_between_blocks() {
        // caller: call callee; ret   callee: ret
        let text = vec![0xE8, 0x01, 0, 0, 0, 0xC3, 0xC3];
        let bytes = image(text, vec![entry(0x1000, 6, 6), entry(0x1006, 1, 1)]);
        let decomposed = HotPatchingDecomposer::new(MappedImage::new(IMAGE_BASE as u64, &bytes))
            .decompose()
            .unwrap();

        let [caller, callee] = decomposed.blocks[..] else { panic!("expected two blocks") };
        let graph = &decomposed.graph;
        assert_eq!(graph.block(caller).addr(), 0x0040_0000);
        assert_eq!(
            graph.block(caller).reference(1),
            Some(&Reference::new(ReferenceKind::PcRelative, 4, callee, 0))
        );
        assert_eq!(graph.block(callee).label(0).unwrap().name(), CODE_LABEL_NAME);
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_uncovered_target_gets_placeholder() {
        // jmp to 0x1010, which no entry covers.
        let mut text = vec![0xE9, 0x0B, 0, 0, 0];
        text.resize(0x20, 0xCC);
        let bytes = image(text, vec![entry(0x1000, 5, 5)]);
        let decomposed = HotPatchingDecomposer::new(MappedImage::new(IMAGE_BASE as u64, &bytes))
            .decompose()
            .unwrap();

        let graph = &decomposed.graph;
        let reference = *graph.block(decomposed.blocks[0]).reference(1).unwrap();
        let placeholder = graph.block(reference.target());
        assert_eq!(placeholder.addr(), 0x0040_0010);
        assert_eq!(placeholder.size(), 1);
        assert!(placeholder
            .attributes()
            .contains(BlockAttributes::BUILT_BY_UNSUPPORTED_COMPILER));
        assert_eq!(placeholder.data(), &[0xCC]);
    }

    #[test]
    fn test_jump_table() {
        let mut text = vec![0x90; 9];
        // jmp [eax*4 + 0x400010]
        text.extend_from_slice(&[0xFF, 0x24, 0x85, 0x10, 0x00, 0x40, 0x00]);
        for target in [0x0040_0000u32, 0x0040_0004, 0x0040_0008, 0x0040_000C] {
            text.extend_from_slice(&target.to_le_bytes());
        }
        let bytes = image(text, vec![entry(0x1000, 32, 16)]);
        let decomposed = HotPatchingDecomposer::new(MappedImage::new(IMAGE_BASE as u64, &bytes))
            .decompose()
            .unwrap();

        let id = decomposed.blocks[0];
        let block = decomposed.graph.block(id);
        let label = block.label(16).unwrap();
        assert!(label.has_attributes(LabelAttributes::JUMP_TABLE | LabelAttributes::DATA));
        for (offset, target) in [(16, 0), (20, 4), (24, 8), (28, 12)] {
            assert_eq!(
                block.reference(offset),
                Some(&Reference::new(ReferenceKind::Absolute, 4, id, target))
            );
        }
        assert_eq!(
            block.reference(12),
            Some(&Reference::new(ReferenceKind::Absolute, 4, id, 16))
        );
    }

    #[test]
    fn test_table_in_code_rejected() {
        // jmp [eax*4 + 0x400004], which lands inside the nops.
        let mut text = vec![0x90; 9];
        text.extend_from_slice(&[0xFF, 0x24, 0x85, 0x04, 0x00, 0x40, 0x00]);
        text.extend_from_slice(&[0; 16]);
        let bytes = image(text, vec![entry(0x1000, 32, 16)]);
        let result = HotPatchingDecomposer::new(MappedImage::new(IMAGE_BASE as u64, &bytes)).decompose();
        assert!(matches!(
            result,
            Err(Error::DisplacementIntoBlock { addr: 0x0040_0009 })
        ));

        // movzx eax, byte [eax + 0x400001]; ret
        let mut text = vec![0x0F, 0xB6, 0x80, 0x01, 0x00, 0x40, 0x00, 0xC3];
        text.extend_from_slice(&[0, 1, 1, 0]);
        let bytes = image(text, vec![entry(0x1000, 12, 8)]);
        let result = HotPatchingDecomposer::new(MappedImage::new(IMAGE_BASE as u64, &bytes)).decompose();
        assert!(matches!(
            result,
            Err(Error::DisplacementIntoBlock { addr: 0x0040_0000 })
        ));
    }

    #[test]
    fn test_case_table() {
        // movzx eax, byte [eax + 0x400008]; ret; nop; table
        let mut text = vec![0x0F, 0xB6, 0x80, 0x08, 0x00, 0x40, 0x00, 0xC3];
        text.extend_from_slice(&[0, 1, 1, 0]);
        let bytes = image(text, vec![entry(0x1000, 12, 8)]);
        let decomposed = HotPatchingDecomposer::new(MappedImage::new(IMAGE_BASE as u64, &bytes))
            .decompose()
            .unwrap();

        let id = decomposed.blocks[0];
        let block = decomposed.graph.block(id);
        assert_eq!(block.label(8).unwrap().name(), CASE_TABLE_LABEL_NAME);
        assert_eq!(
            block.reference(3),
            Some(&Reference::new(ReferenceKind::Absolute, 4, id, 8))
        );
    }

    #[test]
    fn test_displacement_into_block_rejected() {
        // mov eax, [0x400008]; ret
        let mut text = vec![0xA1, 0x08, 0x00, 0x40, 0x00, 0xC3];
        text.extend_from_slice(&[0; 4]);
        let bytes = image(text, vec![entry(0x1000, 10, 6)]);
        let result = HotPatchingDecomposer::new(MappedImage::new(IMAGE_BASE as u64, &bytes)).decompose();
        assert!(matches!(
            result,
            Err(Error::DisplacementIntoBlock { addr: 0x0040_0000 })
        ));
    }

    #[test]
    fn test_conflicting_table_label() {
        let mut graph = BlockGraph::new();
        let id = graph.add_block(BlockType::Code, 0, 8, "f");
        let block = graph.block_mut(id);
        block.set_label(4, Label::new(CODE_LABEL_NAME, LabelAttributes::CODE));
        let jump = Label::new(JUMP_TABLE_LABEL_NAME, LabelAttributes::DATA | LabelAttributes::JUMP_TABLE);
        assert!(matches!(
            insert_table_label(block, 4, jump.clone()),
            Err(Error::ConflictingLabel { offset: 4, .. })
        ));

        block.set_label(0, Label::new(DATA_LABEL_NAME, LabelAttributes::DATA));
        insert_table_label(block, 0, jump.clone()).unwrap();
        insert_table_label(block, 0, jump.clone()).unwrap();
        assert_eq!(block.label(0), Some(&jump));
    }
}
