// Code attribute handling
//
// Decodes method bytecode into instructions, inserts position-independent
// snippets before chosen instructions and re-lays out everything that carries
// a bytecode offset: branches, switches, exception ranges, line numbers,
// local-variable scopes and stack-map frames.

use crate::classfile::{attr, encode_attributes, parse_attributes, Attribute};
use crate::constpool::ConstantPool;
use crate::error::{InstrumentError, InstrumentResult};
use crate::frames::{FrameInference, MethodShape};
use crate::opcodes::*;
use crate::reader::{read_bytes, read_i32, read_u16, read_u32, read_u8};
use crate::stackmap::{self, StackMapFrame};
use bytes::BufMut;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

/// Largest code array the JVM accepts
pub const MAX_CODE_LENGTH: usize = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    /// 0 catches everything
    pub catch_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionEntry>,
    pub attributes: Vec<Attribute>,
}

impl CodeAttribute {
    pub fn parse(info: &[u8]) -> InstrumentResult<Self> {
        let mut buf = info;
        let max_stack = read_u16(&mut buf)?;
        let max_locals = read_u16(&mut buf)?;
        let code_length = read_u32(&mut buf)? as usize;
        if code_length == 0 || code_length > MAX_CODE_LENGTH {
            return Err(InstrumentError::Malformed(format!(
                "invalid code length {}",
                code_length
            )));
        }
        let code = read_bytes(&mut buf, code_length)?;

        let entry_count = read_u16(&mut buf)?;
        let mut exception_table = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            exception_table.push(ExceptionEntry {
                start_pc: read_u16(&mut buf)?,
                end_pc: read_u16(&mut buf)?,
                handler_pc: read_u16(&mut buf)?,
                catch_type: read_u16(&mut buf)?,
            });
        }

        let attributes = parse_attributes(&mut buf)?;
        if !buf.is_empty() {
            return Err(InstrumentError::Malformed(
                "trailing bytes in Code attribute".to_string(),
            ));
        }

        Ok(Self {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }

    pub fn encode(&self) -> InstrumentResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.code.len() + 64);
        out.put_u16(self.max_stack);
        out.put_u16(self.max_locals);
        out.put_u32(self.code.len() as u32);
        out.put_slice(&self.code);

        out.put_u16(crate::classfile::checked_count(
            self.exception_table.len(),
            "exception table entries",
        )?);
        for entry in &self.exception_table {
            out.put_u16(entry.start_pc);
            out.put_u16(entry.end_pc);
            out.put_u16(entry.handler_pc);
            out.put_u16(entry.catch_type);
        }

        encode_attributes(&self.attributes, &mut out)?;
        Ok(out)
    }

    /// All LineNumberTable entries, in table order
    pub fn line_numbers(&self, pool: &ConstantPool) -> InstrumentResult<Vec<LineNumberEntry>> {
        let mut entries = Vec::new();
        for attribute in &self.attributes {
            if pool.utf8_eq(attribute.name_index, attr::LINE_NUMBER_TABLE) {
                entries.extend(LineNumberEntry::parse_table(&attribute.info)?);
            }
        }
        Ok(entries)
    }

    /// Insert each snippet before the instruction at its original offset.
    ///
    /// Anything that jumps to such an instruction (branches, handlers,
    /// exception range starts, stack-map frames) lands on the snippet instead;
    /// LineNumberTable entries keep pointing at the original instruction.
    /// Snippets must be stack-neutral and contain no branches.
    ///
    /// Branches pushed out of 16-bit range are widened; a widened conditional
    /// gets a stack-map frame at its fall-through point when the method has
    /// a StackMapTable.
    pub fn insert_before(
        &mut self,
        pool: &mut ConstantPool,
        method: &MethodShape,
        snippets: BTreeMap<u32, Vec<u8>>,
        extra_stack: u16,
    ) -> InstrumentResult<()> {
        if snippets.is_empty() {
            return Ok(());
        }

        let insns = decode(&self.code)?;
        let layout = Layout::settle(&insns, self.code.len(), &snippets)?;
        if !layout.widened.is_empty() {
            debug!(
                "Widened {} branches in {}{}",
                layout.widened.len(),
                method.name,
                method.descriptor
            );
        }

        let mut code = Vec::with_capacity(layout.new_length);
        for insn in &insns {
            if let Some(snippet) = snippets.get(&insn.offset) {
                code.extend_from_slice(snippet);
            }
            insn.encode(&mut code, &layout)?;
        }
        debug_assert_eq!(code.len(), layout.new_length);

        for entry in &mut self.exception_table {
            entry.start_pc = layout.label_u16(entry.start_pc as u32, "exception start")?;
            entry.end_pc = layout.label_u16(entry.end_pc as u32, "exception end")?;
            entry.handler_pc = layout.label_u16(entry.handler_pc as u32, "exception handler")?;
        }

        let mut attributes = Vec::with_capacity(self.attributes.len());
        for mut attribute in std::mem::take(&mut self.attributes) {
            let index = attribute.name_index;
            if pool.utf8_eq(index, attr::LINE_NUMBER_TABLE) {
                let mut entries = LineNumberEntry::parse_table(&attribute.info)?;
                for entry in &mut entries {
                    entry.start_pc = layout.insn_u16(entry.start_pc as u32, "line number")?;
                }
                attribute.info = LineNumberEntry::encode_table(&entries)?;
            } else if pool.utf8_eq(index, attr::LOCAL_VARIABLE_TABLE)
                || pool.utf8_eq(index, attr::LOCAL_VARIABLE_TYPE_TABLE)
            {
                attribute.info = relocate_local_variables(&attribute.info, &layout)?;
            } else if pool.utf8_eq(index, attr::STACK_MAP_TABLE) {
                let frames = stackmap::decode(&attribute.info)?;
                let mut frames =
                    add_fall_through_frames(pool, method, &insns, &layout, self.code.len(), frames)?;
                stackmap::relocate(
                    &mut frames,
                    |o| layout.label(o, "stack map frame"),
                    |o| layout.insn(o, "uninitialized value"),
                )?;
                attribute.info = stackmap::encode(&frames)?;
            } else if pool.utf8_eq(index, attr::RUNTIME_VISIBLE_TYPE_ANNOTATIONS)
                || pool.utf8_eq(index, attr::RUNTIME_INVISIBLE_TYPE_ANNOTATIONS)
            {
                // offsets inside would be stale
                warn!("Dropping code type annotations while relocating bytecode");
                continue;
            }
            attributes.push(attribute);
        }

        self.code = code;
        self.attributes = attributes;
        self.max_stack = self.max_stack.saturating_add(extra_stack);
        Ok(())
    }
}

/// Line table entry - maps a bytecode index to a source line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumberEntry {
    pub start_pc: u16,
    pub line_number: u16,
}

impl LineNumberEntry {
    pub fn parse_table(info: &[u8]) -> InstrumentResult<Vec<Self>> {
        let mut buf = info;
        let count = read_u16(&mut buf)?;
        (0..count)
            .map(|_| {
                Ok(Self {
                    start_pc: read_u16(&mut buf)?,
                    line_number: read_u16(&mut buf)?,
                })
            })
            .collect()
    }

    pub fn encode_table(entries: &[Self]) -> InstrumentResult<Vec<u8>> {
        let mut out = Vec::with_capacity(2 + entries.len() * 4);
        out.put_u16(crate::classfile::checked_count(entries.len(), "line numbers")?);
        for entry in entries {
            out.put_u16(entry.start_pc);
            out.put_u16(entry.line_number);
        }
        Ok(out)
    }
}

/// Frames for the fall-through points of widened conditionals.
///
/// Same/chop/append frames are relative to their predecessor, so once a frame
/// is added every frame is rewritten in full form.
fn add_fall_through_frames(
    pool: &mut ConstantPool,
    method: &MethodShape,
    insns: &[Instruction],
    layout: &Layout,
    code_len: usize,
    frames: Vec<StackMapFrame>,
) -> InstrumentResult<Vec<StackMapFrame>> {
    let branches: Vec<u32> = insns
        .iter()
        .filter(|insn| layout.widened.contains(&insn.offset))
        .filter(|insn| matches!(insn.op, Operation::Branch { opcode, .. } if is_conditional_branch(opcode)))
        .map(|insn| insn.offset)
        .filter(|offset| (*offset as usize + 3) < code_len)
        .collect();
    if branches.is_empty() {
        return Ok(frames);
    }

    let inference = FrameInference::new(pool, method, insns, &frames)?;
    let mut added = Vec::new();
    for branch in branches {
        if !inference.has_frame(branch + 3) {
            added.push((branch + 3, inference.fall_through(pool, branch)?));
        }
    }
    if added.is_empty() {
        return Ok(frames);
    }

    let mut rebuilt: Vec<StackMapFrame> = inference
        .known()
        .iter()
        .chain(added.iter())
        .map(|(offset, state)| StackMapFrame {
            offset: *offset,
            body: state.to_body(),
        })
        .collect();
    rebuilt.sort_by_key(|frame| frame.offset);
    Ok(rebuilt)
}

fn relocate_local_variables(info: &[u8], layout: &Layout) -> InstrumentResult<Vec<u8>> {
    let mut buf = info;
    let count = read_u16(&mut buf)?;
    let mut out = Vec::with_capacity(info.len());
    out.put_u16(count);

    for _ in 0..count {
        let start = read_u16(&mut buf)? as u32;
        let length = read_u16(&mut buf)? as u32;
        let rest = read_bytes(&mut buf, 6)?;

        let new_start = layout.label(start, "local variable start")?;
        let new_end = layout.label(start + length, "local variable end")?;
        out.put_u16(new_start as u16);
        out.put_u16((new_end - new_start) as u16);
        out.put_slice(&rest);
    }

    Ok(out)
}

/// One decoded instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub offset: u32,
    pub op: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Copied verbatim (opcode included); no offsets inside
    Plain(Vec<u8>),
    /// Branch with a 16-bit offset, `target` absolute
    Branch { opcode: u8, target: u32 },
    /// goto_w / jsr_w
    WideBranch { opcode: u8, target: u32 },
    TableSwitch {
        default: u32,
        low: i32,
        high: i32,
        targets: Vec<u32>,
    },
    LookupSwitch {
        default: u32,
        pairs: Vec<(i32, u32)>,
    },
}

fn switch_padding(offset: usize) -> usize {
    (4 - (offset + 1) % 4) % 4
}

fn absolute(offset: u32, relative: i32, code_len: usize) -> InstrumentResult<u32> {
    let target = offset as i64 + relative as i64;
    if target < 0 || target >= code_len as i64 {
        return Err(InstrumentError::BadOffset {
            offset: target.max(0) as u32,
            context: "branch target outside code",
        });
    }
    Ok(target as u32)
}

/// Decode a code array into instructions, checking that every branch lands
/// on an instruction boundary
pub fn decode(code: &[u8]) -> InstrumentResult<Vec<Instruction>> {
    let mut insns = Vec::new();
    let mut pc = 0usize;

    while pc < code.len() {
        let opcode = code[pc];
        let offset = pc as u32;
        let mut buf = &code[pc + 1..];
        let truncated = |_| InstrumentError::Truncated(format!("instruction at offset {}", pc));

        let (op, len) = if is_short_branch(opcode) {
            let rel = crate::reader::read_i16(&mut buf).map_err(truncated)?;
            let target = absolute(offset, rel as i32, code.len())?;
            (Operation::Branch { opcode, target }, 3)
        } else if opcode == GOTO_W || opcode == JSR_W {
            let rel = read_i32(&mut buf).map_err(truncated)?;
            let target = absolute(offset, rel, code.len())?;
            (Operation::WideBranch { opcode, target }, 5)
        } else if opcode == TABLESWITCH || opcode == LOOKUPSWITCH {
            let pad = switch_padding(pc);
            read_bytes(&mut buf, pad).map_err(truncated)?;
            let default = absolute(offset, read_i32(&mut buf).map_err(truncated)?, code.len())?;

            if opcode == TABLESWITCH {
                let low = read_i32(&mut buf).map_err(truncated)?;
                let high = read_i32(&mut buf).map_err(truncated)?;
                if high < low {
                    return Err(InstrumentError::Malformed(format!(
                        "tableswitch at {} has high < low",
                        pc
                    )));
                }
                let count = (high as i64 - low as i64 + 1) as usize;
                if count > code.len() {
                    return Err(InstrumentError::Truncated(format!("tableswitch at {}", pc)));
                }
                let mut targets = Vec::with_capacity(count);
                for _ in 0..count {
                    let rel = read_i32(&mut buf).map_err(truncated)?;
                    targets.push(absolute(offset, rel, code.len())?);
                }
                let len = 1 + pad + 12 + 4 * count;
                (Operation::TableSwitch { default, low, high, targets }, len)
            } else {
                let npairs = read_i32(&mut buf).map_err(truncated)?;
                if npairs < 0 || npairs as usize > code.len() {
                    return Err(InstrumentError::Malformed(format!(
                        "lookupswitch at {} has {} pairs",
                        pc, npairs
                    )));
                }
                let mut pairs = Vec::with_capacity(npairs as usize);
                for _ in 0..npairs {
                    let key = read_i32(&mut buf).map_err(truncated)?;
                    let rel = read_i32(&mut buf).map_err(truncated)?;
                    pairs.push((key, absolute(offset, rel, code.len())?));
                }
                let len = 1 + pad + 8 + 8 * npairs as usize;
                (Operation::LookupSwitch { default, pairs }, len)
            }
        } else if opcode == WIDE {
            let modified = read_u8(&mut buf).map_err(truncated)?;
            let len = match modified {
                IINC => 6,
                ILOAD..=ALOAD | ISTORE..=ASTORE | RET => 4,
                _ => return Err(InstrumentError::BadOpcode { opcode: modified, offset: offset + 1 }),
            };
            (Operation::Plain(plain_bytes(code, pc, len)?), len)
        } else {
            let len = fixed_length(opcode).ok_or(InstrumentError::BadOpcode { opcode, offset })?;
            (Operation::Plain(plain_bytes(code, pc, len)?), len)
        };

        insns.push(Instruction { offset, op });
        pc += len;
    }

    let boundaries: std::collections::HashSet<u32> = insns.iter().map(|i| i.offset).collect();
    for insn in &insns {
        for target in insn.targets() {
            if !boundaries.contains(&target) {
                return Err(InstrumentError::BadOffset {
                    offset: target,
                    context: "branch target",
                });
            }
        }
    }

    Ok(insns)
}

fn plain_bytes(code: &[u8], pc: usize, len: usize) -> InstrumentResult<Vec<u8>> {
    code.get(pc..pc + len)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| InstrumentError::Truncated(format!("instruction at offset {}", pc)))
}

impl Instruction {
    /// Absolute branch targets of this instruction
    pub fn targets(&self) -> Vec<u32> {
        match &self.op {
            Operation::Plain(_) => Vec::new(),
            Operation::Branch { target, .. } | Operation::WideBranch { target, .. } => vec![*target],
            Operation::TableSwitch { default, targets, .. } => {
                std::iter::once(*default).chain(targets.iter().copied()).collect()
            }
            Operation::LookupSwitch { default, pairs } => std::iter::once(*default)
                .chain(pairs.iter().map(|(_, t)| *t))
                .collect(),
        }
    }

    /// Encoded size when placed at `at`
    fn size_at(&self, at: usize, widened: bool) -> usize {
        match &self.op {
            Operation::Plain(bytes) => bytes.len(),
            // goto_w / jsr_w, or the inverted condition hopping over a goto_w
            Operation::Branch { opcode, .. } if widened => {
                if is_conditional_branch(*opcode) {
                    8
                } else {
                    5
                }
            }
            Operation::Branch { .. } => 3,
            Operation::WideBranch { .. } => 5,
            Operation::TableSwitch { targets, .. } => 1 + switch_padding(at) + 12 + 4 * targets.len(),
            Operation::LookupSwitch { pairs, .. } => 1 + switch_padding(at) + 8 + 8 * pairs.len(),
        }
    }

    fn encode(&self, out: &mut Vec<u8>, layout: &Layout) -> InstrumentResult<()> {
        let at = layout.insn(self.offset, "instruction")?;
        debug_assert_eq!(at as usize, out.len());
        let relative = |target: u32| -> InstrumentResult<i32> {
            Ok(layout.label(target, "branch target")? as i32 - at as i32)
        };

        match &self.op {
            Operation::Plain(bytes) => out.put_slice(bytes),
            Operation::Branch { opcode, target } if layout.widened.contains(&self.offset) => {
                let rel = relative(*target)?;
                match *opcode {
                    GOTO => out.put_u8(GOTO_W),
                    JSR => out.put_u8(JSR_W),
                    _ => {
                        let inverted = inverted_branch(*opcode).ok_or(InstrumentError::BadOpcode {
                            opcode: *opcode,
                            offset: self.offset,
                        })?;
                        out.put_u8(inverted);
                        out.put_i16(8);
                        out.put_u8(GOTO_W);
                        out.put_i32(rel - 3);
                        return Ok(());
                    }
                }
                out.put_i32(rel);
            }
            Operation::Branch { opcode, target } => {
                let rel = relative(*target)?;
                let rel = i16::try_from(rel).map_err(|_| InstrumentError::BranchOverflow {
                    at,
                    target: *target,
                })?;
                out.put_u8(*opcode);
                out.put_i16(rel);
            }
            Operation::WideBranch { opcode, target } => {
                out.put_u8(*opcode);
                out.put_i32(relative(*target)?);
            }
            Operation::TableSwitch { default, low, high, targets } => {
                out.put_u8(TABLESWITCH);
                out.put_bytes(0, switch_padding(at as usize));
                out.put_i32(relative(*default)?);
                out.put_i32(*low);
                out.put_i32(*high);
                for target in targets {
                    out.put_i32(relative(*target)?);
                }
            }
            Operation::LookupSwitch { default, pairs } => {
                out.put_u8(LOOKUPSWITCH);
                out.put_bytes(0, switch_padding(at as usize));
                out.put_i32(relative(*default)?);
                out.put_i32(pairs.len() as i32);
                for (key, target) in pairs {
                    out.put_i32(*key);
                    out.put_i32(relative(*target)?);
                }
            }
        }
        Ok(())
    }
}

const UNMAPPED: u32 = u32::MAX;

/// Old-offset to new-offset maps produced by one insertion pass
struct Layout {
    /// Where control arriving at an old offset now lands (snippet start)
    label: Vec<u32>,
    /// Where the original instruction itself now starts
    insn: Vec<u32>,
    new_length: usize,
    /// Old offsets of short branches encoded in their wide form
    widened: HashSet<u32>,
}

impl Layout {
    /// Lay out repeatedly, widening every short branch that no longer
    /// reaches its target, until nothing else overflows
    fn settle(
        insns: &[Instruction],
        code_len: usize,
        snippets: &BTreeMap<u32, Vec<u8>>,
    ) -> InstrumentResult<Self> {
        let mut widened = HashSet::new();
        loop {
            let layout = Self::compute(insns, code_len, snippets, widened)?;
            let mut overflowing = Vec::new();
            for insn in insns {
                if let Operation::Branch { target, .. } = insn.op {
                    if layout.widened.contains(&insn.offset) {
                        continue;
                    }
                    let rel = layout.label(target, "branch target")? as i64
                        - layout.insn(insn.offset, "instruction")? as i64;
                    if i16::try_from(rel).is_err() {
                        overflowing.push(insn.offset);
                    }
                }
            }
            if overflowing.is_empty() {
                return Ok(layout);
            }
            widened = layout.widened;
            widened.extend(overflowing);
        }
    }

    fn compute(
        insns: &[Instruction],
        code_len: usize,
        snippets: &BTreeMap<u32, Vec<u8>>,
        widened: HashSet<u32>,
    ) -> InstrumentResult<Self> {
        let mut label = vec![UNMAPPED; code_len + 1];
        let mut insn = vec![UNMAPPED; code_len + 1];
        let mut pos = 0usize;

        for instruction in insns {
            let old = instruction.offset as usize;
            label[old] = pos as u32;
            if let Some(snippet) = snippets.get(&instruction.offset) {
                pos += snippet.len();
            }
            insn[old] = pos as u32;
            pos += instruction.size_at(pos, widened.contains(&instruction.offset));

            if pos > MAX_CODE_LENGTH {
                return Err(InstrumentError::CodeTooLarge(pos));
            }
        }
        label[code_len] = pos as u32;
        insn[code_len] = pos as u32;

        for offset in snippets.keys() {
            if *offset as usize >= code_len || insn[*offset as usize] == UNMAPPED {
                return Err(InstrumentError::BadOffset {
                    offset: *offset,
                    context: "insertion point",
                });
            }
        }

        Ok(Self {
            label,
            insn,
            new_length: pos,
            widened,
        })
    }

    fn lookup(map: &[u32], old: u32, context: &'static str) -> InstrumentResult<u32> {
        match map.get(old as usize) {
            Some(&new) if new != UNMAPPED => Ok(new),
            _ => Err(InstrumentError::BadOffset { offset: old, context }),
        }
    }

    fn label(&self, old: u32, context: &'static str) -> InstrumentResult<u32> {
        Self::lookup(&self.label, old, context)
    }

    fn insn(&self, old: u32, context: &'static str) -> InstrumentResult<u32> {
        Self::lookup(&self.insn, old, context)
    }

    fn label_u16(&self, old: u32, context: &'static str) -> InstrumentResult<u16> {
        self.label(old, context).map(|new| new as u16)
    }

    fn insn_u16(&self, old: u32, context: &'static str) -> InstrumentResult<u16> {
        self.insn(old, context).map(|new| new as u16)
    }
}

/// Position in a [`CodeBuilder`] that branches and exception ranges refer to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Straight-line bytecode assembler with forward/backward labels
#[derive(Debug, Default)]
pub struct CodeBuilder {
    code: Vec<u8>,
    labels: Vec<Option<u32>>,
    // (instruction offset, operand offset, label, wide)
    fixups: Vec<(u32, usize, Label, bool)>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn place(&mut self, label: Label) {
        self.labels[label.0] = Some(self.position());
    }

    /// New label bound to the current position
    pub fn mark(&mut self) -> Label {
        let label = self.new_label();
        self.place(label);
        label
    }

    pub fn op(&mut self, opcode: u8) -> &mut Self {
        self.code.push(opcode);
        self
    }

    pub fn op_u8(&mut self, opcode: u8, operand: u8) -> &mut Self {
        self.code.push(opcode);
        self.code.push(operand);
        self
    }

    pub fn op_u16(&mut self, opcode: u8, operand: u16) -> &mut Self {
        self.code.push(opcode);
        self.code.put_u16(operand);
        self
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.code.extend_from_slice(bytes);
        self
    }

    pub fn invokeinterface(&mut self, method_ref: u16, arg_slots: u8) -> &mut Self {
        self.code.push(INVOKEINTERFACE);
        self.code.put_u16(method_ref);
        self.code.push(arg_slots);
        self.code.push(0);
        self
    }

    /// `ldc` or `ldc_w`, whichever fits the index
    pub fn ldc(&mut self, index: u16) -> &mut Self {
        match u8::try_from(index) {
            Ok(small) => self.op_u8(LDC, small),
            Err(_) => self.op_u16(LDC_W, index),
        }
    }

    /// Shortest int push; large values go through the constant pool
    pub fn push_int(&mut self, pool: &mut ConstantPool, value: i32) -> InstrumentResult<&mut Self> {
        match value {
            -1..=5 => {
                self.op((ICONST_0 as i32 + value) as u8);
            }
            -128..=127 => {
                self.op_u8(BIPUSH, value as i8 as u8);
            }
            -32768..=32767 => {
                self.op_u16(SIPUSH, value as i16 as u16);
            }
            _ => {
                let index = pool.add_integer(value)?;
                self.ldc(index);
            }
        }
        Ok(self)
    }

    /// 16-bit branch to a label
    pub fn branch(&mut self, opcode: u8, label: Label) -> &mut Self {
        let at = self.position();
        self.code.push(opcode);
        self.fixups.push((at, self.code.len(), label, false));
        self.code.put_i16(0);
        self
    }

    pub fn tableswitch(&mut self, default: Label, low: i32, targets: &[Label]) -> &mut Self {
        let at = self.position();
        self.code.push(TABLESWITCH);
        self.code.put_bytes(0, switch_padding(at as usize));
        self.fixups.push((at, self.code.len(), default, true));
        self.code.put_i32(0);
        self.code.put_i32(low);
        self.code.put_i32(low + targets.len() as i32 - 1);
        for target in targets {
            self.fixups.push((at, self.code.len(), *target, true));
            self.code.put_i32(0);
        }
        self
    }

    /// Offset a placed label resolved to
    pub fn offset_of(&self, label: Label) -> Option<u32> {
        self.labels.get(label.0).copied().flatten()
    }

    /// Resolve every branch and return the code array
    pub fn finish(mut self) -> InstrumentResult<Vec<u8>> {
        for (at, operand, label, wide) in std::mem::take(&mut self.fixups) {
            let target = self.offset_of(label).ok_or_else(|| {
                InstrumentError::Malformed(format!("unplaced label used at offset {}", at))
            })?;
            let rel = target as i64 - at as i64;
            if wide {
                self.code[operand..operand + 4].copy_from_slice(&(rel as i32).to_be_bytes());
            } else {
                let rel = i16::try_from(rel)
                    .map_err(|_| InstrumentError::BranchOverflow { at, target })?;
                self.code[operand..operand + 2].copy_from_slice(&rel.to_be_bytes());
            }
        }

        if self.code.len() > MAX_CODE_LENGTH {
            return Err(InstrumentError::CodeTooLarge(self.code.len()));
        }
        Ok(self.code)
    }
}
