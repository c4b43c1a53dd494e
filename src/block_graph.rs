//! Block graph: blocks of code and data, their labels, and the references
//! between them.
//!
//! Blocks live in a central table keyed by [`BlockId`]. References carry the
//! id of their target rather than a pointer, so self-references and back-edges
//! never create ownership cycles. An address space maps start addresses to
//! blocks for the lookups the decomposers perform.

use bitflags::bitflags;
use std::collections::BTreeMap;

/// Stable identifier of a block within a [`BlockGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of a section within a [`BlockGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId(pub usize);

/// Kind of block contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockType {
    Code,
    Data,
}

bitflags! {
    /// Attributes of a label.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct LabelAttributes: u32 {
        /// Start of code.
        const CODE = 0x0001;
        /// Start of data.
        const DATA = 0x0002;
        /// Start of a table of code addresses. Implies `DATA`.
        const JUMP_TABLE = 0x0004;
        /// Start of a table of byte indices into a jump table. Implies `DATA`.
        const CASE_TABLE = 0x0008;
        /// End of the code covered by debug information.
        const DEBUG_END = 0x0010;
        /// Start of a function.
        const CALL_SITE = 0x0020;
    }
}

bitflags! {
    /// Attributes of a block.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BlockAttributes: u32 {
        /// The block was produced by a compiler whose output cannot be
        /// basic-block decomposed; it must be treated as opaque.
        const BUILT_BY_UNSUPPORTED_COMPILER = 0x0001;
        /// The block was created to stand for a target no metadata covers.
        const PLACEHOLDER = 0x0002;
        /// The block was prepared for hot-patching.
        const HOT_PATCHED = 0x0004;
        /// The block is padding inserted by layout.
        const PADDING = 0x0008;
    }
}

/// A named, attributed position within a block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Label {
    name: String,
    attributes: LabelAttributes,
}

impl Label {
    pub fn new(name: impl Into<String>, attributes: LabelAttributes) -> Self {
        if attributes.intersects(LabelAttributes::JUMP_TABLE | LabelAttributes::CASE_TABLE) {
            assert!(
                attributes.contains(LabelAttributes::DATA),
                "table labels must also be data labels"
            );
        }
        Self {
            name: name.into(),
            attributes,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> LabelAttributes {
        self.attributes
    }

    pub fn has_attributes(&self, attributes: LabelAttributes) -> bool {
        self.attributes.contains(attributes)
    }

    pub fn has_any_attributes(&self, attributes: LabelAttributes) -> bool {
        self.attributes.intersects(attributes)
    }
}

/// How a reference encodes its target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceKind {
    /// The absolute address of the target.
    Absolute,
    /// The distance from the end of the reference to the target.
    PcRelative,
    /// The target's address relative to the image base (an RVA).
    Relative,
}

/// A direct reference from a byte window of one block to a location in
/// another (or the same) block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reference {
    kind: ReferenceKind,
    size: usize,
    target: BlockId,
    offset: i64,
    base: i64,
}

impl Reference {
    /// Create a direct reference: `offset` and `base` are the same.
    pub fn new(kind: ReferenceKind, size: usize, target: BlockId, offset: i64) -> Self {
        Self::with_base(kind, size, target, offset, offset)
    }

    /// Create a reference whose encoded location (`offset`) differs from the
    /// object it logically refers to (`base`).
    pub fn with_base(kind: ReferenceKind, size: usize, target: BlockId, offset: i64, base: i64) -> Self {
        assert!(matches!(size, 1 | 2 | 4), "invalid reference size {size}");
        Self {
            kind,
            size,
            target,
            offset,
            base,
        }
    }

    pub fn kind(&self) -> ReferenceKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn target(&self) -> BlockId {
        self.target
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn base(&self) -> i64 {
        self.base
    }

    /// Direct references encode exactly the object they refer to.
    pub fn is_direct(&self) -> bool {
        self.offset == self.base
    }
}

/// Encode a resolved reference value into its window.
///
/// Absolute and relative values are unsigned, pc-relative ones signed.
/// Panics if `value` does not fit in `size` bytes.
pub fn write_reference_value(dst: &mut [u8], kind: ReferenceKind, size: usize, value: i64) {
    let fits = match (kind, size) {
        (ReferenceKind::PcRelative, 1) => i8::try_from(value).is_ok(),
        (ReferenceKind::PcRelative, 2) => i16::try_from(value).is_ok(),
        (ReferenceKind::PcRelative, 4) => i32::try_from(value).is_ok(),
        (_, 1) => u8::try_from(value).is_ok(),
        (_, 2) => u16::try_from(value).is_ok(),
        (_, 4) => u32::try_from(value).is_ok(),
        _ => false,
    };
    assert!(fits, "{kind:?} reference value {value:#x} does not fit in {size} bytes");
    dst[..size].copy_from_slice(&value.to_le_bytes()[..size]);
}

/// Where a block's bytes live.
#[derive(Clone, Debug, Default)]
pub enum BlockData {
    /// The block has no initialized data.
    #[default]
    None,
    /// The graph owns the bytes.
    Owned(Vec<u8>),
    /// The bytes live elsewhere: in a mapped image or an executable arena.
    External { ptr: *const u8, len: usize },
}

/// A contiguous run of bytes with labels and outgoing references.
#[derive(Clone, Debug)]
pub struct Block {
    id: BlockId,
    name: String,
    block_type: BlockType,
    addr: u64,
    size: usize,
    alignment: u32,
    padding_before: u32,
    data: BlockData,
    labels: BTreeMap<usize, Label>,
    references: BTreeMap<usize, Reference>,
    attributes: BlockAttributes,
    section: Option<SectionId>,
}

impl Block {
    fn new(id: BlockId, block_type: BlockType, addr: u64, size: usize, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            block_type,
            addr,
            size,
            alignment: 1,
            padding_before: 0,
            data: BlockData::None,
            labels: BTreeMap::new(),
            references: BTreeMap::new(),
            attributes: BlockAttributes::empty(),
            section: None,
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    /// Address of the block: an RVA in offline images, an absolute address
    /// for blocks decomposed from a loaded module.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn set_addr(&mut self, addr: u64) {
        self.addr = addr;
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    pub fn set_alignment(&mut self, alignment: u32) {
        assert!(alignment.is_power_of_two(), "alignment must be a power of two");
        self.alignment = alignment;
    }

    pub fn padding_before(&self) -> u32 {
        self.padding_before
    }

    pub fn set_padding_before(&mut self, padding: u32) {
        self.padding_before = padding;
    }

    pub fn attributes(&self) -> BlockAttributes {
        self.attributes
    }

    pub fn set_attributes(&mut self, attributes: BlockAttributes) {
        self.attributes |= attributes;
    }

    pub fn section(&self) -> Option<SectionId> {
        self.section
    }

    pub fn set_section(&mut self, section: Option<SectionId>) {
        self.section = section;
    }

    /// The block's initialized bytes.
    pub fn data(&self) -> &[u8] {
        match &self.data {
            BlockData::None => &[],
            BlockData::Owned(bytes) => bytes,
            // SAFETY: `set_external_data` requires the memory to outlive the block.
            BlockData::External { ptr, len } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
        }
    }

    /// Address of the block's bytes in this process, if it has any.
    pub fn data_ptr(&self) -> Option<*const u8> {
        match &self.data {
            BlockData::None => None,
            BlockData::Owned(bytes) => Some(bytes.as_ptr()),
            BlockData::External { ptr, .. } => Some(*ptr),
        }
    }

    /// Whether the bytes are aliased from memory the graph does not own.
    pub fn has_external_data(&self) -> bool {
        matches!(self.data, BlockData::External { .. })
    }

    pub fn set_data(&mut self, bytes: Vec<u8>) {
        assert!(bytes.len() <= self.size, "data larger than block");
        self.data = BlockData::Owned(bytes);
    }

    /// Alias the block's bytes from memory the graph does not own.
    ///
    /// # Safety
    /// `[ptr, ptr + len)` must stay readable for as long as the block exists.
    pub unsafe fn set_external_data(&mut self, ptr: *const u8, len: usize) {
        assert!(len <= self.size, "data larger than block");
        self.data = BlockData::External { ptr, len };
    }

    /// Mutable bytes, copying external data into the graph first and
    /// zero-extending to the full block size.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let mut bytes = match std::mem::take(&mut self.data) {
            BlockData::Owned(bytes) => bytes,
            other => {
                self.data = other;
                self.data().to_vec()
            }
        };
        bytes.resize(self.size, 0);
        self.data = BlockData::Owned(bytes);
        match &mut self.data {
            BlockData::Owned(bytes) => bytes,
            _ => unreachable!(),
        }
    }

    pub fn labels(&self) -> &BTreeMap<usize, Label> {
        &self.labels
    }

    pub fn label(&self, offset: usize) -> Option<&Label> {
        self.labels.get(&offset)
    }

    /// Set a label, returning false if one already exists at `offset`.
    pub fn set_label(&mut self, offset: usize, label: Label) -> bool {
        let in_bounds = offset < self.size
            || (offset == self.size && label.has_attributes(LabelAttributes::DEBUG_END));
        assert!(in_bounds, "label at {offset} outside block '{}' of size {}", self.name, self.size);
        if self.labels.contains_key(&offset) {
            return false;
        }
        self.labels.insert(offset, label);
        true
    }

    pub fn remove_label(&mut self, offset: usize) -> Option<Label> {
        self.labels.remove(&offset)
    }

    pub fn references(&self) -> &BTreeMap<usize, Reference> {
        &self.references
    }

    pub fn reference(&self, offset: usize) -> Option<&Reference> {
        self.references.get(&offset)
    }

    /// Set a reference at `offset`, replacing any reference already there.
    /// Returns true if the reference is new.
    ///
    /// Panics if the reference window leaves the block or overlaps another.
    pub fn set_reference(&mut self, offset: usize, reference: Reference) -> bool {
        let end = offset + reference.size();
        assert!(
            end <= self.size,
            "reference at {offset} leaves block '{}' of size {}",
            self.name,
            self.size
        );
        if let Some((&prev, prev_ref)) = self.references.range(..offset).next_back() {
            assert!(prev + prev_ref.size() <= offset, "overlapping references at {prev} and {offset}");
        }
        if let Some((&next, _)) = self.references.range(offset + 1..).next() {
            assert!(end <= next, "overlapping references at {offset} and {next}");
        }
        self.references.insert(offset, reference).is_none()
    }

    pub fn remove_reference(&mut self, offset: usize) -> Option<Reference> {
        self.references.remove(&offset)
    }

    pub fn clear_references(&mut self) {
        self.references.clear();
    }

    pub fn clear_labels(&mut self) {
        self.labels.clear();
    }

    /// Offset of the first data label, which ends the code of a block.
    /// `DEBUG_END` labels at or past the end of the block are ignored.
    pub fn code_size(&self) -> usize {
        self.labels
            .iter()
            .filter(|(&offset, label)| {
                !(offset >= self.size && label.has_attributes(LabelAttributes::DEBUG_END))
            })
            .find(|(_, label)| label.has_attributes(LabelAttributes::DATA))
            .map(|(&offset, _)| offset)
            .unwrap_or(self.size)
    }

    /// Whether `[addr, addr + len)` lies inside the block.
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        addr >= self.addr && addr + len as u64 <= self.addr + self.size as u64
    }
}

/// A named section of an image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub characteristics: u32,
}

/// The central owning table of blocks.
#[derive(Clone, Debug, Default)]
pub struct BlockGraph {
    blocks: BTreeMap<BlockId, Block>,
    next_id: usize,
    address_space: BTreeMap<u64, BlockId>,
    sections: Vec<Section>,
}

impl BlockGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a block that is not (yet) part of the address space.
    pub fn add_block(&mut self, block_type: BlockType, addr: u64, size: usize, name: &str) -> BlockId {
        let id = BlockId(self.next_id);
        self.next_id += 1;
        self.blocks.insert(id, Block::new(id, block_type, addr, size, name));
        id
    }

    /// Add a block and insert it into the address space. Returns `None` if it
    /// would overlap a block already there.
    pub fn add_block_at(&mut self, block_type: BlockType, addr: u64, size: usize, name: &str) -> Option<BlockId> {
        if self.overlaps(addr, size.max(1)) {
            return None;
        }
        let id = self.add_block(block_type, addr, size, name);
        self.address_space.insert(addr, id);
        Some(id)
    }

    fn overlaps(&self, addr: u64, size: usize) -> bool {
        let end = addr + size as u64;
        if let Some((&start, id)) = self.address_space.range(..end).next_back() {
            let block = &self.blocks[id];
            return start + (block.size().max(1) as u64) > addr;
        }
        false
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[&id]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        self.blocks.get_mut(&id).expect("unknown block id")
    }

    pub fn get(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(&id)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Remove a block. Panics if other blocks still refer to it.
    pub fn remove_block(&mut self, id: BlockId) -> Block {
        let referred = self
            .blocks
            .values()
            .any(|b| b.id != id && b.references.values().any(|r| r.target == id));
        assert!(!referred, "block {id} still has referrers");
        let block = self.blocks.remove(&id).expect("unknown block id");
        if self.address_space.get(&block.addr) == Some(&id) {
            self.address_space.remove(&block.addr);
        }
        block
    }

    /// Move a block to `addr`, keeping the address space in step. Callers
    /// moving several blocks may pass through overlapping states.
    pub fn set_block_addr(&mut self, id: BlockId, addr: u64) {
        let block = self.blocks.get_mut(&id).expect("unknown block id");
        let in_space = self.address_space.get(&block.addr) == Some(&id);
        if in_space {
            self.address_space.remove(&block.addr);
        }
        block.addr = addr;
        if in_space {
            self.address_space.insert(addr, id);
        }
    }

    /// The block in the address space containing `addr`.
    pub fn find_containing(&self, addr: u64) -> Option<BlockId> {
        let (&start, &id) = self.address_space.range(..=addr).next_back()?;
        let size = self.blocks[&id].size().max(1) as u64;
        (addr < start + size).then_some(id)
    }

    /// The block in the address space starting exactly at `addr`.
    pub fn find_block_at(&self, addr: u64) -> Option<BlockId> {
        self.address_space.get(&addr).copied()
    }

    /// Blocks in the address space, in address order.
    pub fn address_space(&self) -> impl Iterator<Item = (u64, BlockId)> + '_ {
        self.address_space.iter().map(|(&addr, &id)| (addr, id))
    }

    pub fn add_section(&mut self, name: &str, characteristics: u32) -> SectionId {
        self.sections.push(Section {
            name: name.to_string(),
            characteristics,
        });
        SectionId(self.sections.len() - 1)
    }

    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.0]
    }

    pub fn find_section(&self, name: &str) -> Option<SectionId> {
        self.sections.iter().position(|s| s.name == name).map(SectionId)
    }

    pub fn sections(&self) -> impl Iterator<Item = (SectionId, &Section)> {
        self.sections.iter().enumerate().map(|(i, s)| (SectionId(i), s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_space_lookup() {
        let mut graph = BlockGraph::new();
        let a = graph.add_block_at(BlockType::Code, 0x1000, 0x10, "a").unwrap();
        let b = graph.add_block_at(BlockType::Code, 0x1010, 0x08, "b").unwrap();

        assert_eq!(graph.find_containing(0x1000), Some(a));
        assert_eq!(graph.find_containing(0x100F), Some(a));
        assert_eq!(graph.find_containing(0x1010), Some(b));
        assert_eq!(graph.find_containing(0x1018), None);
        assert_eq!(graph.find_containing(0x0FFF), None);
        assert_eq!(graph.find_block_at(0x1010), Some(b));
        assert!(graph.add_block_at(BlockType::Code, 0x1008, 4, "overlap").is_none());
        assert!(graph.add_block_at(BlockType::Code, 0x0FF8, 0x10, "overlap").is_none());
    }

    #[test]
    fn test_code_size_from_labels() {
        let mut graph = BlockGraph::new();
        let id = graph.add_block(BlockType::Code, 0, 32, "f");
        let block = graph.block_mut(id);
        assert_eq!(block.code_size(), 32);

        block.set_label(32, Label::new("<debug-end>", LabelAttributes::DEBUG_END));
        assert_eq!(block.code_size(), 32);

        block.set_label(0, Label::new("<code>", LabelAttributes::CODE));
        block.set_label(20, Label::new("<data>", LabelAttributes::DATA));
        assert_eq!(block.code_size(), 20);
    }

    #[test]
    #[should_panic(expected = "overlapping references")]
    fn test_overlapping_references_panic() {
        let mut graph = BlockGraph::new();
        let id = graph.add_block(BlockType::Code, 0, 16, "f");
        let block = graph.block_mut(id);
        block.set_reference(0, Reference::new(ReferenceKind::Absolute, 4, id, 0));
        block.set_reference(2, Reference::new(ReferenceKind::Absolute, 4, id, 0));
    }

    #[test]
    #[should_panic(expected = "leaves block")]
    fn test_reference_outside_block_panics() {
        let mut graph = BlockGraph::new();
        let id = graph.add_block(BlockType::Code, 0, 6, "f");
        graph
            .block_mut(id)
            .set_reference(4, Reference::new(ReferenceKind::PcRelative, 4, id, 0));
    }

    #[test]
    #[should_panic(expected = "table labels")]
    fn test_jump_table_label_requires_data() {
        let _ = Label::new("bad", LabelAttributes::JUMP_TABLE);
    }

    #[test]
    fn test_data_mut_copies_external() {
        let backing = [1u8, 2, 3];
        let mut graph = BlockGraph::new();
        let id = graph.add_block(BlockType::Data, 0, 4, "d");
        let block = graph.block_mut(id);
        unsafe { block.set_external_data(backing.as_ptr(), backing.len()) };
        assert!(block.has_external_data());
        block.data_mut()[0] = 9;
        assert_eq!(block.data(), &[9, 2, 3, 0]);
        assert_eq!(backing, [1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "referrers")]
    fn test_remove_referred_block_panics() {
        let mut graph = BlockGraph::new();
        let a = graph.add_block(BlockType::Code, 0, 8, "a");
        let b = graph.add_block(BlockType::Code, 8, 8, "b");
        graph
            .block_mut(a)
            .set_reference(0, Reference::new(ReferenceKind::PcRelative, 4, b, 0));
        graph.remove_block(b);
    }

    #[test]
    fn test_reference_value_encoding() {
        let mut buf = [0u8; 4];
        write_reference_value(&mut buf, ReferenceKind::PcRelative, 4, -5);
        assert_eq!(buf, [0xFB, 0xFF, 0xFF, 0xFF]);
        write_reference_value(&mut buf, ReferenceKind::Absolute, 2, 0x1234);
        assert_eq!(&buf[..2], &[0x34, 0x12]);
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn test_reference_value_out_of_range() {
        let mut buf = [0u8; 1];
        write_reference_value(&mut buf, ReferenceKind::PcRelative, 1, 200);
    }

    #[test]
    fn test_set_block_addr_moves_address_space() {
        let mut graph = BlockGraph::new();
        let id = graph.add_block_at(BlockType::Code, 0x1000, 4, "f").unwrap();
        graph.set_block_addr(id, 0x2000);
        assert_eq!(graph.find_block_at(0x1000), None);
        assert_eq!(graph.find_block_at(0x2000), Some(id));
        assert_eq!(graph.block(id).addr(), 0x2000);
    }
}
