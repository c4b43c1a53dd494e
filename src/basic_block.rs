//! Basic-block decomposition and assembly.
//!
//! A code block is split into basic blocks: straight runs of instructions
//! that end in at most two successors. Branch instructions are not kept as
//! instructions; they become [`Successor`]s and are re-encoded when the
//! subgraph is assembled, so inserting or removing bytes never leaves a
//! branch pointing at a stale offset.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction, Mnemonic, OpKind};
use tracing::{debug, trace, warn};

use crate::block_graph::{
    BlockAttributes, BlockGraph, BlockId, BlockType, Label, Reference, ReferenceKind, SectionId,
};
use crate::bytestream::ByteStreamWriter;
use crate::error::{Error, Result};

/// Index of a basic block within its [`BasicBlockSubGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BasicBlockId(pub usize);

/// Where a reference or successor inside a subgraph points.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BasicBlockTarget {
    /// The start of a basic block of the same subgraph.
    BasicBlock(BasicBlockId),
    /// A location in another block of the graph.
    Block { block: BlockId, offset: i64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BasicBlockReference {
    pub kind: ReferenceKind,
    pub size: usize,
    pub target: BasicBlockTarget,
}

/// A single non-branch instruction with its references, keyed by their
/// offset within the instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicBlockInstruction {
    bytes: Vec<u8>,
    references: BTreeMap<usize, BasicBlockReference>,
}

impl BasicBlockInstruction {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            references: BTreeMap::new(),
        }
    }

    /// The recommended multi-byte NOP of `size` bytes (1 to 3).
    pub fn nop(size: usize) -> Self {
        let bytes = match size {
            1 => vec![0x90],
            2 => vec![0x66, 0x90],
            3 => vec![0x0F, 0x1F, 0x00],
            _ => panic!("no {size}-byte NOP encoding"),
        };
        Self::new(bytes)
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn references(&self) -> &BTreeMap<usize, BasicBlockReference> {
        &self.references
    }

    pub fn set_reference(&mut self, offset: usize, reference: BasicBlockReference) {
        assert!(offset + reference.size <= self.bytes.len(), "reference leaves instruction");
        self.references.insert(offset, reference);
    }
}

/// Branch condition of a successor, in x86 `cc` encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Condition {
    Always,
    Jcc(u8),
}

impl Condition {
    /// The opposite condition. Panics for [`Condition::Always`].
    pub fn inverse(self) -> Self {
        match self {
            Condition::Jcc(cc) => Condition::Jcc(cc ^ 1),
            Condition::Always => panic!("unconditional successor has no inverse"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Successor {
    pub condition: Condition,
    pub target: BasicBlockTarget,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BasicCodeBlock {
    pub name: String,
    pub label: Option<Label>,
    pub instructions: Vec<BasicBlockInstruction>,
    /// Empty, one unconditional successor, or a conditional pair.
    pub successors: Vec<Successor>,
    /// Offset in the block this basic block was decomposed from.
    pub original_offset: Option<usize>,
}

impl BasicCodeBlock {
    /// Size of the instructions, not counting successors.
    pub fn instruction_size(&self) -> usize {
        self.instructions.iter().map(BasicBlockInstruction::size).sum()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BasicDataBlock {
    pub name: String,
    pub label: Option<Label>,
    pub data: Vec<u8>,
    pub references: BTreeMap<usize, BasicBlockReference>,
    pub original_offset: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BasicBlock {
    Code(BasicCodeBlock),
    Data(BasicDataBlock),
}

impl BasicBlock {
    pub fn label(&self) -> Option<&Label> {
        match self {
            BasicBlock::Code(bb) => bb.label.as_ref(),
            BasicBlock::Data(bb) => bb.label.as_ref(),
        }
    }

    pub fn original_offset(&self) -> Option<usize> {
        match self {
            BasicBlock::Code(bb) => bb.original_offset,
            BasicBlock::Data(bb) => bb.original_offset,
        }
    }

    pub fn as_code(&self) -> Option<&BasicCodeBlock> {
        match self {
            BasicBlock::Code(bb) => Some(bb),
            BasicBlock::Data(_) => None,
        }
    }

    pub fn as_code_mut(&mut self) -> Option<&mut BasicCodeBlock> {
        match self {
            BasicBlock::Code(bb) => Some(bb),
            BasicBlock::Data(_) => None,
        }
    }

    pub fn as_data(&self) -> Option<&BasicDataBlock> {
        match self {
            BasicBlock::Data(bb) => Some(bb),
            BasicBlock::Code(_) => None,
        }
    }
}

/// Block-level properties carried through decomposition, applied again when
/// the subgraph is assembled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockDescription {
    pub name: String,
    pub block_type: BlockType,
    pub alignment: u32,
    pub padding_before: u32,
    pub attributes: BlockAttributes,
    pub section: Option<SectionId>,
    /// Label sitting one past the last byte (a debug-end label).
    pub end_label: Option<Label>,
    /// Layout order of the basic blocks.
    pub basic_block_order: Vec<BasicBlockId>,
}

/// The basic blocks of one block, in an editable form.
#[derive(Clone, Debug)]
pub struct BasicBlockSubGraph {
    original_block: BlockId,
    basic_blocks: Vec<BasicBlock>,
    description: BlockDescription,
}

impl BasicBlockSubGraph {
    pub fn original_block(&self) -> BlockId {
        self.original_block
    }

    pub fn description(&self) -> &BlockDescription {
        &self.description
    }

    pub fn description_mut(&mut self) -> &mut BlockDescription {
        &mut self.description
    }

    pub fn basic_block(&self, id: BasicBlockId) -> &BasicBlock {
        &self.basic_blocks[id.0]
    }

    pub fn basic_block_mut(&mut self, id: BasicBlockId) -> &mut BasicBlock {
        &mut self.basic_blocks[id.0]
    }

    pub fn len(&self) -> usize {
        self.basic_blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.basic_blocks.is_empty()
    }

    /// Add a basic block. It is not laid out until placed in the order.
    pub fn add_basic_block(&mut self, bb: BasicBlock) -> BasicBlockId {
        self.basic_blocks.push(bb);
        BasicBlockId(self.basic_blocks.len() - 1)
    }

    /// Basic blocks in layout order.
    pub fn ordered(&self) -> impl Iterator<Item = (BasicBlockId, &BasicBlock)> {
        self.description
            .basic_block_order
            .iter()
            .map(|&id| (id, &self.basic_blocks[id.0]))
    }
}

/// How an instruction affects control flow, with intra-block targets
/// expressed as offsets.
#[derive(Clone, Copy, Debug)]
enum Flow {
    Next,
    Jump(Target),
    Branch(u8, Target),
    Stop,
}

#[derive(Clone, Copy, Debug)]
enum Target {
    Offset(usize),
    External { block: BlockId, offset: i64 },
}

struct Decoded {
    offset: usize,
    len: usize,
    flow: Flow,
}

fn not_decomposable(name: &str, reason: impl Into<String>) -> Error {
    Error::NotDecomposable {
        block: name.to_string(),
        reason: reason.into(),
    }
}

/// Condition code of a `Jcc`, read from its opcode.
fn jcc_condition(bytes: &[u8]) -> u8 {
    let mut i = 0;
    while matches!(bytes.get(i), Some(0x2E | 0x3E | 0x66)) {
        i += 1;
    }
    match bytes[i] {
        0x0F => bytes[i + 1] & 0x0F,
        op => op & 0x0F,
    }
}

fn is_jcc(mnemonic: Mnemonic) -> bool {
    matches!(
        mnemonic,
        Mnemonic::Jo
            | Mnemonic::Jno
            | Mnemonic::Jb
            | Mnemonic::Jae
            | Mnemonic::Je
            | Mnemonic::Jne
            | Mnemonic::Jbe
            | Mnemonic::Ja
            | Mnemonic::Js
            | Mnemonic::Jns
            | Mnemonic::Jp
            | Mnemonic::Jnp
            | Mnemonic::Jl
            | Mnemonic::Jge
            | Mnemonic::Jle
            | Mnemonic::Jg
    )
}

/// Splits code blocks into basic blocks.
pub struct BasicBlockDecomposer<'a> {
    graph: &'a BlockGraph,
    block: BlockId,
}

impl<'a> BasicBlockDecomposer<'a> {
    pub fn new(graph: &'a BlockGraph, block: BlockId) -> Self {
        Self { graph, block }
    }

    pub fn decompose(&self) -> Result<BasicBlockSubGraph> {
        let block = self.graph.block(self.block);
        let name = block.name();

        if block.block_type() != BlockType::Code {
            return Err(not_decomposable(name, "not a code block"));
        }
        if block
            .attributes()
            .intersects(BlockAttributes::BUILT_BY_UNSUPPORTED_COMPILER | BlockAttributes::PLACEHOLDER)
        {
            return Err(not_decomposable(name, "built by an unsupported compiler"));
        }

        let mut bytes = block.data().to_vec();
        bytes.resize(block.size(), 0);
        let size = block.size();
        let code_size = block.code_size();

        let decoded = self.decode(&bytes[..code_size])?;
        let boundaries: BTreeSet<usize> = decoded.iter().map(|d| d.offset).collect();

        // Every position something can transfer control or refer to starts a
        // basic block.
        let mut starts = BTreeSet::new();
        if code_size > 0 {
            starts.insert(0);
        }
        for d in &decoded {
            let end = d.offset + d.len;
            match d.flow {
                Flow::Jump(target) | Flow::Branch(_, target) => {
                    if let Target::Offset(t) = target {
                        starts.insert(t);
                    }
                    starts.insert(end);
                }
                Flow::Stop => {
                    starts.insert(end);
                }
                Flow::Next => {}
            }
        }
        if code_size < size {
            starts.insert(code_size);
        }
        starts.extend(block.labels().keys().copied().filter(|&o| o < size));
        for reference in block.references().values() {
            if reference.target() == self.block {
                let offset = usize::try_from(reference.offset())
                    .ok()
                    .filter(|&o| o < size)
                    .ok_or_else(|| not_decomposable(name, "self reference outside the block"))?;
                starts.insert(offset);
            }
        }
        for other in self.graph.blocks().filter(|b| b.id() != self.block) {
            for reference in other.references().values() {
                if reference.target() == self.block {
                    if let Ok(offset) = usize::try_from(reference.offset()) {
                        if offset < size {
                            starts.insert(offset);
                        }
                    }
                }
            }
        }
        starts.retain(|&o| o < size);

        for &start in starts.range(..code_size) {
            if !boundaries.contains(&start) {
                return Err(not_decomposable(
                    name,
                    format!("offset {start} is not an instruction boundary"),
                ));
            }
        }

        let ids: BTreeMap<usize, BasicBlockId> = starts
            .iter()
            .enumerate()
            .map(|(i, &o)| (o, BasicBlockId(i)))
            .collect();

        let convert = |reference: &Reference| -> Result<BasicBlockReference> {
            if !reference.is_direct() {
                return Err(not_decomposable(name, "indirect reference"));
            }
            let target = if reference.target() == self.block {
                let offset = reference.offset() as usize;
                BasicBlockTarget::BasicBlock(ids[&offset])
            } else {
                BasicBlockTarget::Block {
                    block: reference.target(),
                    offset: reference.offset(),
                }
            };
            Ok(BasicBlockReference {
                kind: reference.kind(),
                size: reference.size(),
                target,
            })
        };
        let successor_target = |target: Target| match target {
            Target::Offset(offset) => BasicBlockTarget::BasicBlock(ids[&offset]),
            Target::External { block, offset } => BasicBlockTarget::Block { block, offset },
        };

        let bounds: Vec<usize> = starts.iter().copied().chain(std::iter::once(size)).collect();
        let mut basic_blocks = Vec::with_capacity(starts.len());
        let mut next_instr = 0;

        for window in bounds.windows(2) {
            let (start, end) = (window[0], window[1]);
            let label = block.label(start).cloned();

            if start >= code_size {
                let mut data = BasicDataBlock {
                    name: format!("{name}+{start}"),
                    label,
                    data: bytes[start..end].to_vec(),
                    references: BTreeMap::new(),
                    original_offset: Some(start),
                };
                for (&offset, reference) in block.references().range(start..end) {
                    if offset + reference.size() > end {
                        return Err(not_decomposable(name, "reference straddles data boundary"));
                    }
                    data.references.insert(offset - start, convert(reference)?);
                }
                basic_blocks.push(BasicBlock::Data(data));
                continue;
            }

            let end = end.min(code_size);
            let mut code = BasicCodeBlock {
                name: format!("{name}+{start}"),
                label,
                original_offset: Some(start),
                ..Default::default()
            };
            let mut falls_through = true;

            while next_instr < decoded.len() && decoded[next_instr].offset < end {
                let d = &decoded[next_instr];
                next_instr += 1;
                let instr_end = d.offset + d.len;
                match d.flow {
                    Flow::Jump(target) => {
                        code.successors.push(Successor {
                            condition: Condition::Always,
                            target: successor_target(target),
                        });
                        falls_through = false;
                    }
                    Flow::Branch(cc, target) => {
                        let fallthrough = ids.get(&instr_end).filter(|_| instr_end < code_size).ok_or_else(
                            || not_decomposable(name, "conditional branch falls off the end of the code"),
                        )?;
                        code.successors.push(Successor {
                            condition: Condition::Jcc(cc),
                            target: successor_target(target),
                        });
                        code.successors.push(Successor {
                            condition: Condition::Jcc(cc ^ 1),
                            target: BasicBlockTarget::BasicBlock(*fallthrough),
                        });
                        falls_through = false;
                    }
                    Flow::Next | Flow::Stop => {
                        let mut instr = BasicBlockInstruction::new(bytes[d.offset..instr_end].to_vec());
                        for (&offset, reference) in block.references().range(d.offset..instr_end) {
                            if offset + reference.size() > instr_end {
                                return Err(not_decomposable(name, "reference straddles instructions"));
                            }
                            instr.set_reference(offset - d.offset, convert(reference)?);
                        }
                        code.instructions.push(instr);
                        falls_through = matches!(d.flow, Flow::Next);
                    }
                }
            }

            if falls_through && end < code_size {
                code.successors.push(Successor {
                    condition: Condition::Always,
                    target: BasicBlockTarget::BasicBlock(ids[&end]),
                });
            }
            basic_blocks.push(BasicBlock::Code(code));
        }

        trace!(block = name, basic_blocks = basic_blocks.len(), "decomposed into basic blocks");

        Ok(BasicBlockSubGraph {
            original_block: self.block,
            description: BlockDescription {
                name: name.to_string(),
                block_type: block.block_type(),
                alignment: block.alignment(),
                padding_before: block.padding_before(),
                attributes: block.attributes(),
                section: block.section(),
                end_label: block.label(size).cloned(),
                basic_block_order: (0..basic_blocks.len()).map(BasicBlockId).collect(),
            },
            basic_blocks,
        })
    }

    fn decode(&self, code: &[u8]) -> Result<Vec<Decoded>> {
        let block = self.graph.block(self.block);
        let name = block.name();
        let mut decoder = Decoder::with_ip(32, code, 0, DecoderOptions::NONE);
        let mut instr = Instruction::default();
        let mut decoded = Vec::new();

        while decoder.can_decode() {
            let offset = decoder.position();
            decoder.decode_out(&mut instr);
            if instr.is_invalid() {
                return Err(Error::InvalidInstruction {
                    block: name.to_string(),
                    offset,
                });
            }
            let len = instr.len();
            let flow = match instr.flow_control() {
                FlowControl::UnconditionalBranch => Flow::Jump(self.branch_target(&instr, offset, code.len())?),
                FlowControl::ConditionalBranch if is_jcc(instr.mnemonic()) => Flow::Branch(
                    jcc_condition(&code[offset..offset + len]),
                    self.branch_target(&instr, offset, code.len())?,
                ),
                FlowControl::ConditionalBranch => {
                    return Err(not_decomposable(name, format!("unsupported branch {:?}", instr.mnemonic())));
                }
                FlowControl::IndirectBranch | FlowControl::Return => Flow::Stop,
                _ => Flow::Next,
            };
            decoded.push(Decoded { offset, len, flow });
        }
        Ok(decoded)
    }

    /// Resolve the target of a direct branch at `offset`. A reference over
    /// the trailing rel32 wins; otherwise the decoded target must stay
    /// inside the code.
    fn branch_target(&self, instr: &Instruction, offset: usize, code_size: usize) -> Result<Target> {
        let block = self.graph.block(self.block);
        if instr.op0_kind() != OpKind::NearBranch32 {
            return Err(not_decomposable(block.name(), "far or 16-bit branch"));
        }

        let len = instr.len();
        if len >= 5 {
            if let Some(reference) = block.reference(offset + len - 4) {
                if reference.kind() != ReferenceKind::PcRelative || reference.size() != 4 {
                    return Err(not_decomposable(block.name(), "branch reference is not pc-relative"));
                }
                return Ok(if reference.target() == self.block {
                    Target::Offset(reference.offset() as usize)
                } else {
                    Target::External {
                        block: reference.target(),
                        offset: reference.offset(),
                    }
                });
            }
        }

        let target = instr.near_branch_target() as usize;
        if target >= code_size {
            return Err(not_decomposable(
                block.name(),
                format!("branch at {offset} leaves the code without a reference"),
            ));
        }
        Ok(Target::Offset(target))
    }
}

/// Encoding chosen for a branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BranchForm {
    Short,
    Near,
}

#[derive(Clone, Copy, Debug)]
struct PlannedBranch {
    condition: Condition,
    target: BasicBlockTarget,
    form: BranchForm,
}

impl PlannedBranch {
    fn size(&self) -> usize {
        match (self.form, self.condition) {
            (BranchForm::Short, _) => 2,
            (BranchForm::Near, Condition::Always) => 5,
            (BranchForm::Near, Condition::Jcc(_)) => 6,
        }
    }

    fn opcode(&self) -> Vec<u8> {
        match (self.form, self.condition) {
            (BranchForm::Short, Condition::Always) => vec![0xEB],
            (BranchForm::Short, Condition::Jcc(cc)) => vec![0x70 | cc],
            (BranchForm::Near, Condition::Always) => vec![0xE9],
            (BranchForm::Near, Condition::Jcc(cc)) => vec![0x0F, 0x80 | cc],
        }
    }
}

/// Branches needed to leave a code basic block, given the block laid out
/// after it.
fn plan_successors(bb: &BasicCodeBlock, next: Option<BasicBlockId>) -> Vec<PlannedBranch> {
    let is_next = |target: BasicBlockTarget| matches!(target, BasicBlockTarget::BasicBlock(id) if Some(id) == next);
    let initial_form = |target: BasicBlockTarget| match target {
        BasicBlockTarget::BasicBlock(_) => BranchForm::Short,
        BasicBlockTarget::Block { .. } => BranchForm::Near,
    };
    let branch = |condition, target| PlannedBranch {
        condition,
        target,
        form: initial_form(target),
    };

    match bb.successors.as_slice() {
        [] => Vec::new(),
        [only] => {
            if only.condition == Condition::Always && is_next(only.target) {
                Vec::new()
            } else {
                vec![branch(only.condition, only.target)]
            }
        }
        [taken, not_taken] => {
            if is_next(not_taken.target) {
                vec![branch(taken.condition, taken.target)]
            } else if is_next(taken.target) {
                vec![branch(not_taken.condition, not_taken.target)]
            } else {
                vec![
                    branch(taken.condition, taken.target),
                    branch(Condition::Always, not_taken.target),
                ]
            }
        }
        _ => panic!("basic block '{}' has more than two successors", bb.name),
    }
}

/// Append `bytes`, annotating each reference window.
fn append_with_references(
    writer: &mut ByteStreamWriter<BasicBlockTarget>,
    bytes: &[u8],
    references: &BTreeMap<usize, BasicBlockReference>,
) {
    let mut cursor = 0;
    for (&offset, reference) in references {
        writer.append(&bytes[cursor..offset], None);
        writer.append(
            &bytes[offset..offset + reference.size],
            Some((0, reference.size, reference.kind, reference.target)),
        );
        cursor = offset + reference.size;
    }
    writer.append(&bytes[cursor..], None);
}

/// Assembles a [`BasicBlockSubGraph`] back into its block.
pub struct BlockBuilder;

impl BlockBuilder {
    /// Replace the contents of the subgraph's original block with the
    /// assembled basic blocks, updating references held by other blocks.
    pub fn merge(graph: &mut BlockGraph, subgraph: &BasicBlockSubGraph) -> Result<()> {
        let id = subgraph.original_block();
        let order = &subgraph.description().basic_block_order;

        let mut plans: HashMap<BasicBlockId, Vec<PlannedBranch>> = HashMap::new();
        for (i, &bb_id) in order.iter().enumerate() {
            if let BasicBlock::Code(code) = subgraph.basic_block(bb_id) {
                plans.insert(bb_id, plan_successors(code, order.get(i + 1).copied()));
            }
        }

        // Grow short branches until every displacement fits. Sizes only
        // increase, so this terminates.
        let positions = loop {
            let positions = Self::positions(subgraph, &plans);
            let mut changed = false;
            for &bb_id in order {
                let Some(plan) = plans.get_mut(&bb_id) else { continue };
                let mut pos = positions[&bb_id] + subgraph.basic_block(bb_id).as_code().map_or(0, |c| c.instruction_size());
                for branch in plan.iter_mut() {
                    pos += branch.size();
                    if branch.form != BranchForm::Short {
                        continue;
                    }
                    let BasicBlockTarget::BasicBlock(target) = branch.target else { continue };
                    let disp = positions[&target] as i64 - pos as i64;
                    if i8::try_from(disp).is_err() {
                        branch.form = BranchForm::Near;
                        changed = true;
                    }
                }
            }
            if !changed {
                break positions;
            }
        };

        let total = Self::total_size(subgraph, &plans);
        let mut writer = ByteStreamWriter::with_limit(total);
        let mut labels = BTreeMap::new();

        for (bb_id, bb) in subgraph.ordered() {
            debug_assert_eq!(writer.position(), positions[&bb_id]);
            if let Some(label) = bb.label() {
                labels.insert(writer.position(), label.clone());
            }
            match bb {
                BasicBlock::Data(data) => append_with_references(&mut writer, &data.data, &data.references),
                BasicBlock::Code(code) => {
                    for instr in &code.instructions {
                        append_with_references(&mut writer, instr.bytes(), instr.references());
                    }
                    for branch in &plans[&bb_id] {
                        let opcode = branch.opcode();
                        let end = writer.position() + branch.size();
                        match (branch.form, branch.target) {
                            (BranchForm::Short, BasicBlockTarget::BasicBlock(target)) => {
                                let disp = positions[&target] as i64 - end as i64;
                                writer.append(&opcode, None);
                                writer.append(&[disp as i8 as u8], None);
                            }
                            (BranchForm::Near, BasicBlockTarget::BasicBlock(target)) => {
                                let disp = positions[&target] as i64 - end as i64;
                                let mut bytes = opcode.clone();
                                bytes.extend_from_slice(&(disp as i32).to_le_bytes());
                                writer.append(&bytes, Some((opcode.len(), 4, ReferenceKind::PcRelative, branch.target)));
                            }
                            (_, target @ BasicBlockTarget::Block { .. }) => {
                                let mut bytes = opcode.clone();
                                bytes.extend_from_slice(&[0; 4]);
                                writer.append(&bytes, Some((opcode.len(), 4, ReferenceKind::PcRelative, target)));
                            }
                        }
                    }
                }
            }
        }

        let (bytes, annotations) = writer.into_parts();
        let resolve = |target: BasicBlockTarget| match target {
            BasicBlockTarget::BasicBlock(bb) => (id, positions[&bb] as i64),
            BasicBlockTarget::Block { block, offset } => (block, offset),
        };

        let description = subgraph.description();
        let block = graph.block_mut(id);
        block.clear_labels();
        block.clear_references();
        block.set_size(bytes.len());
        block.set_alignment(description.alignment);
        block.set_padding_before(description.padding_before);
        block.set_attributes(description.attributes);
        for annotation in &annotations {
            let (target, offset) = resolve(annotation.target);
            block.set_reference(
                annotation.offset,
                Reference::new(annotation.kind, annotation.width, target, offset),
            );
        }
        for (offset, label) in labels {
            block.set_label(offset, label);
        }
        if let Some(label) = &description.end_label {
            block.set_label(bytes.len(), label.clone());
        }
        block.set_data(bytes);

        // Old offset to new offset, for referrers outside the block.
        let moved: HashMap<i64, i64> = subgraph
            .ordered()
            .filter_map(|(bb_id, bb)| Some((bb.original_offset()? as i64, positions[&bb_id] as i64)))
            .collect();
        Self::update_referrers(graph, id, &moved);

        debug!(block = %description.name, size = graph.block(id).size(), "assembled basic blocks");
        Ok(())
    }

    fn update_referrers(graph: &mut BlockGraph, id: BlockId, moved: &HashMap<i64, i64>) {
        for other in graph.block_ids() {
            if other == id {
                continue;
            }
            let updates: Vec<(usize, Reference)> = graph
                .block(other)
                .references()
                .iter()
                .filter(|(_, r)| r.target() == id)
                .filter_map(|(&offset, r)| match moved.get(&r.offset()) {
                    Some(&new) => Some((offset, Reference::new(r.kind(), r.size(), id, new))),
                    None => {
                        warn!(referrer = %other, offset = r.offset(), "reference into a removed basic block");
                        None
                    }
                })
                .collect();
            let block = graph.block_mut(other);
            for (offset, reference) in updates {
                block.set_reference(offset, reference);
            }
        }
    }

    fn positions(
        subgraph: &BasicBlockSubGraph,
        plans: &HashMap<BasicBlockId, Vec<PlannedBranch>>,
    ) -> HashMap<BasicBlockId, usize> {
        let mut positions = HashMap::new();
        let mut pos = 0;
        for (bb_id, bb) in subgraph.ordered() {
            positions.insert(bb_id, pos);
            pos += Self::basic_block_size(bb_id, bb, plans);
        }
        positions
    }

    fn total_size(subgraph: &BasicBlockSubGraph, plans: &HashMap<BasicBlockId, Vec<PlannedBranch>>) -> usize {
        subgraph
            .ordered()
            .map(|(bb_id, bb)| Self::basic_block_size(bb_id, bb, plans))
            .sum()
    }

    fn basic_block_size(
        bb_id: BasicBlockId,
        bb: &BasicBlock,
        plans: &HashMap<BasicBlockId, Vec<PlannedBranch>>,
    ) -> usize {
        match bb {
            BasicBlock::Data(data) => data.data.len(),
            BasicBlock::Code(code) => {
                code.instruction_size() + plans[&bb_id].iter().map(PlannedBranch::size).sum::<usize>()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_graph::LabelAttributes;

    fn code_block(graph: &mut BlockGraph, bytes: &[u8]) -> BlockId {
        let id = graph.add_block_at(BlockType::Code, 0x1000, bytes.len(), "f").unwrap();
        graph.block_mut(id).set_data(bytes.to_vec());
        id
    }

    #[test]
    fn test_single_instruction() {
        let mut graph = BlockGraph::new();
        let id = code_block(&mut graph, &[0x40]);
        let subgraph = BasicBlockDecomposer::new(&graph, id).decompose().unwrap();
        assert_eq!(subgraph.len(), 1);
        let code = subgraph.basic_block(BasicBlockId(0)).as_code().unwrap();
        assert_eq!(code.instructions.len(), 1);
        assert!(code.successors.is_empty());
    }

    #[test]
    fn test_conditional_split() {
        // test eax, eax; jz +1; inc eax; ret
        let bytes = [0x85, 0xC0, 0x74, 0x01, 0x40, 0xC3];
        let mut graph = BlockGraph::new();
        let id = code_block(&mut graph, &bytes);
        let subgraph = BasicBlockDecomposer::new(&graph, id).decompose().unwrap();

        assert_eq!(subgraph.len(), 3);
        let head = subgraph.basic_block(BasicBlockId(0)).as_code().unwrap();
        assert_eq!(head.instructions.len(), 1);
        assert_eq!(
            head.successors,
            vec![
                Successor {
                    condition: Condition::Jcc(4),
                    target: BasicBlockTarget::BasicBlock(BasicBlockId(2)),
                },
                Successor {
                    condition: Condition::Jcc(5),
                    target: BasicBlockTarget::BasicBlock(BasicBlockId(1)),
                },
            ]
        );
        let middle = subgraph.basic_block(BasicBlockId(1)).as_code().unwrap();
        assert_eq!(middle.successors.len(), 1);

        BlockBuilder::merge(&mut graph, &subgraph).unwrap();
        assert_eq!(graph.block(id).data(), &bytes);
    }

    #[test]
    fn test_loop_rejected() {
        // loop -2
        let mut graph = BlockGraph::new();
        let id = code_block(&mut graph, &[0xE2, 0xFE]);
        assert!(matches!(
            BasicBlockDecomposer::new(&graph, id).decompose(),
            Err(Error::NotDecomposable { .. })
        ));
    }

    #[test]
    fn test_unsupported_compiler_rejected() {
        let mut graph = BlockGraph::new();
        let id = code_block(&mut graph, &[0xC3]);
        graph
            .block_mut(id)
            .set_attributes(BlockAttributes::BUILT_BY_UNSUPPORTED_COMPILER);
        assert!(BasicBlockDecomposer::new(&graph, id).decompose().is_err());
    }

    #[test]
    fn test_external_call_keeps_reference() {
        let mut graph = BlockGraph::new();
        let callee = graph.add_block_at(BlockType::Code, 0x2000, 1, "callee").unwrap();
        let id = code_block(&mut graph, &[0xE8, 0, 0, 0, 0, 0xC3]);
        graph
            .block_mut(id)
            .set_reference(1, Reference::new(ReferenceKind::PcRelative, 4, callee, 0));

        let subgraph = BasicBlockDecomposer::new(&graph, id).decompose().unwrap();
        BlockBuilder::merge(&mut graph, &subgraph).unwrap();
        assert_eq!(
            graph.block(id).reference(1),
            Some(&Reference::new(ReferenceKind::PcRelative, 4, callee, 0))
        );
    }

    #[test]
    fn test_short_branch_grows_to_near() {
        // jmp +2 over two bytes, then ret.
        let mut graph = BlockGraph::new();
        let id = code_block(&mut graph, &[0xEB, 0x02, 0x90, 0x90, 0xC3]);
        let mut subgraph = BasicBlockDecomposer::new(&graph, id).decompose().unwrap();

        // Inflate the skipped block past the reach of a short branch.
        let skipped = subgraph.basic_block_mut(BasicBlockId(1)).as_code_mut().unwrap();
        skipped.instructions = (0..200).map(|_| BasicBlockInstruction::nop(1)).collect();

        BlockBuilder::merge(&mut graph, &subgraph).unwrap();
        let block = graph.block(id);
        assert_eq!(&block.data()[..5], &[0xE9, 200, 0, 0, 0]);
        assert_eq!(block.size(), 5 + 200 + 1);
        assert_eq!(
            block.reference(1),
            Some(&Reference::new(ReferenceKind::PcRelative, 4, id, 205))
        );
    }

    #[test]
    fn test_jump_table_round_trip() {
        // jmp [eax*4 + table]; ret; ret; table: dd case0, case1
        let mut bytes = vec![0xFF, 0x24, 0x85, 0, 0, 0, 0, 0xC3, 0xC3, 0x90, 0x90, 0x90];
        bytes.extend_from_slice(&[0; 8]);
        let mut graph = BlockGraph::new();
        let id = code_block(&mut graph, &bytes);
        {
            let block = graph.block_mut(id);
            block.set_label(0, Label::new("<code>", LabelAttributes::CODE));
            block.set_label(12, Label::new("<jump-table>", LabelAttributes::DATA | LabelAttributes::JUMP_TABLE));
            block.set_reference(3, Reference::new(ReferenceKind::Absolute, 4, id, 12));
            block.set_reference(12, Reference::new(ReferenceKind::Absolute, 4, id, 7));
            block.set_reference(16, Reference::new(ReferenceKind::Absolute, 4, id, 8));
        }

        let subgraph = BasicBlockDecomposer::new(&graph, id).decompose().unwrap();
        let table = subgraph
            .ordered()
            .find_map(|(_, bb)| bb.as_data())
            .unwrap();
        assert_eq!(table.references.len(), 2);

        BlockBuilder::merge(&mut graph, &subgraph).unwrap();
        let block = graph.block(id);
        assert_eq!(block.size(), 20);
        assert_eq!(block.code_size(), 12);
        assert_eq!(block.reference(3).unwrap().offset(), 12);
        assert_eq!(block.reference(12).unwrap().offset(), 7);
        assert_eq!(block.reference(16).unwrap().offset(), 8);
    }
}
