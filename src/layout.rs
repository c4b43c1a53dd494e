//! Offline image layout.
//!
//! Assigns every sectioned block an RVA, honoring its padding and alignment,
//! then writes final values into every reference window. The laid-out graph
//! can be rendered into a mapped PE image.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::block_graph::{write_reference_value, BlockGraph, BlockId, ReferenceKind, SectionId};
use crate::pe::{MappedImageBuilder, PeHeaders, IMAGE_SCN_MEM_EXECUTE};

/// Byte used to fill the gaps between code blocks (`int3`).
const CODE_PADDING_BYTE: u8 = 0xCC;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionLayout {
    pub id: SectionId,
    pub name: String,
    pub rva: u32,
    pub size: u32,
    pub characteristics: u32,
}

/// Placement of all sectioned blocks of a graph.
#[derive(Clone, Debug)]
pub struct ImageLayout {
    image_base: u32,
    sections: Vec<SectionLayout>,
}

impl ImageLayout {
    /// Lay out the graph's sections in order, starting at `first_rva`.
    /// Within a section blocks keep their current address order.
    pub fn build(graph: &mut BlockGraph, image_base: u32, first_rva: u32, section_alignment: u32) -> Self {
        let mut by_section: BTreeMap<SectionId, Vec<(u64, BlockId)>> = BTreeMap::new();
        for block in graph.blocks() {
            if let Some(section) = block.section() {
                by_section.entry(section).or_default().push((block.addr(), block.id()));
            }
        }

        let mut sections = Vec::new();
        let mut rva = first_rva as usize;
        let section_info: Vec<(SectionId, String, u32)> = graph
            .sections()
            .map(|(id, s)| (id, s.name.clone(), s.characteristics))
            .collect();

        for (id, name, characteristics) in section_info {
            rva = PeHeaders::align_up(rva, section_alignment as usize);
            let start = rva;
            let mut blocks = by_section.remove(&id).unwrap_or_default();
            blocks.sort();

            for (_, block_id) in blocks {
                let block = graph.block(block_id);
                let placed = PeHeaders::align_up(rva + block.padding_before() as usize, block.alignment() as usize);
                let size = block.size();
                graph.set_block_addr(block_id, placed as u64);
                rva = placed + size;
            }

            debug!(section = %name, rva = format_args!("{start:#x}"), size = rva - start, "laid out section");
            sections.push(SectionLayout {
                id,
                name,
                rva: start as u32,
                size: (rva - start) as u32,
                characteristics,
            });
        }

        info!(sections = sections.len(), "image layout complete");
        Self { image_base, sections }
    }

    pub fn image_base(&self) -> u32 {
        self.image_base
    }

    pub fn sections(&self) -> &[SectionLayout] {
        &self.sections
    }

    /// Write the final value of every reference of every sectioned block.
    ///
    /// Panics if a value does not fit its reference window.
    pub fn finalize_references(&self, graph: &mut BlockGraph) {
        let ids: Vec<BlockId> = graph
            .blocks()
            .filter(|b| b.section().is_some())
            .map(|b| b.id())
            .collect();

        for id in ids {
            let source = graph.block(id).addr() as i64;
            let values: Vec<(usize, ReferenceKind, usize, i64)> = graph
                .block(id)
                .references()
                .iter()
                .map(|(&offset, reference)| {
                    let target = graph.block(reference.target()).addr() as i64 + reference.offset();
                    let value = match reference.kind() {
                        ReferenceKind::Absolute => self.image_base as i64 + target,
                        ReferenceKind::Relative => target,
                        ReferenceKind::PcRelative => target - (source + (offset + reference.size()) as i64),
                    };
                    (offset, reference.kind(), reference.size(), value)
                })
                .collect();

            if values.is_empty() {
                continue;
            }
            let data = graph.block_mut(id).data_mut();
            for (offset, kind, size, value) in values {
                write_reference_value(&mut data[offset..], kind, size, value);
            }
        }
    }

    /// Render the laid-out graph as a mapped image.
    pub fn to_image(&self, graph: &BlockGraph) -> Vec<u8> {
        let mut builder = MappedImageBuilder::new(self.image_base);
        for section in &self.sections {
            let fill = if section.characteristics & IMAGE_SCN_MEM_EXECUTE != 0 {
                CODE_PADDING_BYTE
            } else {
                0
            };
            let mut bytes = vec![fill; section.size as usize];
            for block in graph.blocks().filter(|b| b.section() == Some(section.id)) {
                let start = (block.addr() - section.rva as u64) as usize;
                let data = block.data();
                bytes[start..start + block.size()].fill(0);
                bytes[start..start + data.len()].copy_from_slice(data);
            }
            builder = builder.section(&section.name, section.rva, bytes, section.characteristics);
        }
        builder.build()
    }
}
