// Stack map frame inference
//
// When a conditional branch has to be widened, its fall-through point becomes
// a jump target and needs a frame. The state there is found by replaying the
// straight-line code after the closest preceding frame (or the method entry).

use crate::code::{Instruction, Operation};
use crate::constpool::{Constant, ConstantPool};
use crate::descriptor::{FieldType, MethodSig, ReturnType};
use crate::error::{InstrumentError, InstrumentResult};
use crate::opcodes::*;
use crate::stackmap::{FrameBody, StackMapFrame, VerificationType as VType};

/// The method whose code is being re-laid out
#[derive(Debug, Clone, Copy)]
pub struct MethodShape<'a> {
    pub class_name: &'a str,
    pub name: &'a str,
    pub descriptor: &'a str,
    pub is_static: bool,
}

/// Verifier state at one offset, one entry per local slot / stack word
/// (a long or double is followed by `Top`)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameState {
    pub locals: Vec<VType>,
    pub stack: Vec<VType>,
}

fn is_wide(vtype: &VType) -> bool {
    matches!(vtype, VType::Long | VType::Double)
}

fn words(vtype: &VType) -> usize {
    if is_wide(vtype) {
        2
    } else {
        1
    }
}

fn expand(types: &[VType]) -> Vec<VType> {
    let mut out = Vec::with_capacity(types.len());
    for vtype in types {
        out.push(vtype.clone());
        if is_wide(vtype) {
            out.push(VType::Top);
        }
    }
    out
}

fn compact(slots: &[VType]) -> Vec<VType> {
    let mut out = Vec::with_capacity(slots.len());
    let mut i = 0;
    while i < slots.len() {
        out.push(slots[i].clone());
        i += words(&slots[i]);
    }
    out
}

type Step<T> = Result<T, &'static str>;

impl FrameState {
    /// Full frame body describing this state
    pub fn to_body(&self) -> FrameBody {
        let mut locals = compact(&self.locals);
        while locals.last() == Some(&VType::Top) {
            locals.pop();
        }
        FrameBody::Full {
            locals,
            stack: compact(&self.stack),
        }
    }

    fn push(&mut self, vtype: VType) {
        let wide = is_wide(&vtype);
        self.stack.push(vtype);
        if wide {
            self.stack.push(VType::Top);
        }
    }

    fn pop(&mut self, count: usize) -> Step<Vec<VType>> {
        if self.stack.len() < count {
            return Err("operand stack underflow");
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    fn load(&self, slot: usize) -> Step<VType> {
        self.locals.get(slot).cloned().ok_or("local variable out of range")
    }

    fn store(&mut self, slot: usize, vtype: VType) {
        let end = slot + words(&vtype);
        if self.locals.len() < end {
            self.locals.resize(end, VType::Top);
        }
        // overwriting the second half of a long or double kills the first
        if slot > 0 && is_wide(&self.locals[slot - 1]) {
            self.locals[slot - 1] = VType::Top;
        }
        if is_wide(&vtype) {
            self.locals[slot + 1] = VType::Top;
        }
        self.locals[slot] = vtype;
    }

    /// Copy the top `count` words and insert them `depth` words down
    fn dup(&mut self, count: usize, depth: usize) -> Step<()> {
        let len = self.stack.len();
        if len < depth {
            return Err("operand stack underflow");
        }
        let copied = self.stack[len - count..].to_vec();
        let at = len - depth;
        self.stack.splice(at..at, copied);
        Ok(())
    }

    fn swap(&mut self) -> Step<()> {
        let len = self.stack.len();
        if len < 2 {
            return Err("operand stack underflow");
        }
        self.stack.swap(len - 1, len - 2);
        Ok(())
    }

    fn replace(&mut self, from: &VType, to: &VType) {
        for vtype in self.locals.iter_mut().chain(self.stack.iter_mut()) {
            if vtype == from {
                *vtype = to.clone();
            }
        }
    }
}

fn field_vtype(pool: &mut ConstantPool, ty: &FieldType) -> InstrumentResult<VType> {
    Ok(match ty {
        FieldType::Byte | FieldType::Char | FieldType::Short | FieldType::Boolean | FieldType::Int => {
            VType::Integer
        }
        FieldType::Float => VType::Float,
        FieldType::Long => VType::Long,
        FieldType::Double => VType::Double,
        FieldType::Object(name) | FieldType::Array(name) => VType::Object(pool.add_class(name)?),
    })
}

fn descriptor_vtype(pool: &mut ConstantPool, descriptor: &str) -> InstrumentResult<VType> {
    let ty = FieldType::parse(descriptor)?;
    field_vtype(pool, &ty)
}

fn class_vtype(pool: &mut ConstantPool, name: &str) -> InstrumentResult<VType> {
    Ok(VType::Object(pool.add_class(name)?))
}

/// Primitive kinds in the order the typed opcode families use
fn kind(index: u8) -> VType {
    match index {
        0 => VType::Integer,
        1 => VType::Long,
        2 => VType::Float,
        _ => VType::Double,
    }
}

/// Locals and parameters on method entry
fn entry_state(pool: &mut ConstantPool, method: &MethodShape) -> InstrumentResult<FrameState> {
    let sig = MethodSig::parse(method.descriptor)?;
    let mut state = FrameState::default();
    if !method.is_static {
        let receiver = if method.name == "<init>" {
            VType::UninitializedThis
        } else {
            class_vtype(pool, method.class_name)?
        };
        state.locals.push(receiver);
    }
    for param in &sig.params {
        let vtype = field_vtype(pool, param)?;
        let slot = state.locals.len();
        state.store(slot, vtype);
    }
    Ok(state)
}

pub struct FrameInference<'a> {
    insns: &'a [Instruction],
    entry: FrameState,
    known: Vec<(u32, FrameState)>,
    this_class: u16,
}

impl<'a> FrameInference<'a> {
    /// Resolve the existing (delta-encoded) frames into full states
    pub fn new(
        pool: &mut ConstantPool,
        method: &MethodShape,
        insns: &'a [Instruction],
        frames: &[StackMapFrame],
    ) -> InstrumentResult<Self> {
        let entry = entry_state(pool, method)?;
        let this_class = pool.add_class(method.class_name)?;

        let mut locals = compact(&entry.locals);
        let mut known = Vec::with_capacity(frames.len());
        for frame in frames {
            let stack = match &frame.body {
                FrameBody::Same => Vec::new(),
                FrameBody::SameLocals1StackItem(item) => vec![item.clone()],
                FrameBody::Chop(count) => {
                    let keep = locals.len().saturating_sub(*count as usize);
                    locals.truncate(keep);
                    Vec::new()
                }
                FrameBody::Append(extra) => {
                    locals.extend(extra.iter().cloned());
                    Vec::new()
                }
                FrameBody::Full { locals: full, stack } => {
                    locals = full.clone();
                    stack.clone()
                }
            };
            known.push((
                frame.offset,
                FrameState {
                    locals: expand(&locals),
                    stack: expand(&stack),
                },
            ));
        }

        Ok(Self {
            insns,
            entry,
            known,
            this_class,
        })
    }

    pub fn has_frame(&self, offset: u32) -> bool {
        self.known.iter().any(|(at, _)| *at == offset)
    }

    /// States of the frames the method already had, by offset
    pub fn known(&self) -> &[(u32, FrameState)] {
        &self.known
    }

    /// State on the fall-through path of the conditional branch at `offset`
    pub fn fall_through(&self, pool: &mut ConstantPool, offset: u32) -> InstrumentResult<FrameState> {
        let (start, mut state) = self
            .known
            .iter()
            .rev()
            .find(|(at, _)| *at <= offset)
            .map(|(at, state)| (*at, state.clone()))
            .unwrap_or((0, self.entry.clone()));

        for insn in self
            .insns
            .iter()
            .filter(|insn| insn.offset >= start && insn.offset <= offset)
        {
            self.step(pool, insn, &mut state)?;
        }
        Ok(state)
    }

    fn step(&self, pool: &mut ConstantPool, insn: &Instruction, state: &mut FrameState) -> InstrumentResult<()> {
        let fail = |reason: &str| InstrumentError::FrameInference {
            offset: insn.offset,
            reason: reason.to_string(),
        };

        let bytes = match &insn.op {
            Operation::Plain(bytes) => bytes,
            Operation::Branch { opcode, .. } if is_conditional_branch(*opcode) => {
                let operands = if (IF_ICMPEQ..=IF_ACMPNE).contains(opcode) { 2 } else { 1 };
                state.pop(operands).map_err(fail)?;
                return Ok(());
            }
            _ => return Err(fail("control does not fall through to the branch")),
        };

        let opcode = bytes[0];
        let u8_operand = || bytes[1] as usize;
        let u16_operand = || u16::from_be_bytes([bytes[1], bytes[2]]);

        match opcode {
            NOP | IINC => {}
            ACONST_NULL => state.push(VType::Null),
            ICONST_M1..=ICONST_5 | BIPUSH | SIPUSH => state.push(VType::Integer),
            0x09 | 0x0a => state.push(VType::Long),
            0x0b..=0x0d => state.push(VType::Float),
            0x0e | 0x0f => state.push(VType::Double),
            LDC | LDC_W | LDC2_W => {
                let index = if opcode == LDC { bytes[1] as u16 } else { u16_operand() };
                let vtype = self.constant_vtype(pool, index)?;
                state.push(vtype);
            }
            ILOAD..=DLOAD => state.push(kind(opcode - ILOAD)),
            ALOAD => {
                let vtype = state.load(u8_operand()).map_err(fail)?;
                state.push(vtype);
            }
            ILOAD_0..=0x2d => {
                let n = opcode - ILOAD_0;
                if n / 4 == 4 {
                    let vtype = state.load((n % 4) as usize).map_err(fail)?;
                    state.push(vtype);
                } else {
                    state.push(kind(n / 4));
                }
            }
            // iaload .. saload
            0x2e..=0x35 => {
                let popped = state.pop(2).map_err(fail)?;
                let vtype = match opcode {
                    0x32 => self.component_vtype(pool, &popped[0]).map_err(fail)?,
                    0x2e..=0x31 => kind(opcode - 0x2e),
                    _ => VType::Integer,
                };
                state.push(vtype);
            }
            ISTORE..=ASTORE => {
                let slot = u8_operand();
                let value = self.pop_value(state, opcode - ISTORE).map_err(fail)?;
                state.store(slot, value);
            }
            ISTORE_0..=0x4e => {
                let n = opcode - ISTORE_0;
                let value = self.pop_value(state, n / 4).map_err(fail)?;
                state.store((n % 4) as usize, value);
            }
            // iastore .. sastore
            0x4f..=0x56 => {
                let value_words = if opcode == 0x50 || opcode == 0x52 { 2 } else { 1 };
                state.pop(value_words + 2).map_err(fail)?;
            }
            POP => {
                state.pop(1).map_err(fail)?;
            }
            0x58 => {
                state.pop(2).map_err(fail)?;
            }
            DUP => state.dup(1, 1).map_err(fail)?,
            0x5a => state.dup(1, 2).map_err(fail)?,
            0x5b => state.dup(1, 3).map_err(fail)?,
            0x5c => state.dup(2, 2).map_err(fail)?,
            0x5d => state.dup(2, 3).map_err(fail)?,
            0x5e => state.dup(2, 4).map_err(fail)?,
            0x5f => state.swap().map_err(fail)?,
            // add, sub, mul, div, rem
            0x60..=0x73 => {
                let vtype = kind((opcode - 0x60) % 4);
                state.pop(2 * words(&vtype)).map_err(fail)?;
                state.push(vtype);
            }
            // neg
            0x74..=0x77 => {
                let vtype = kind(opcode - 0x74);
                state.pop(words(&vtype)).map_err(fail)?;
                state.push(vtype);
            }
            // shifts take an int count; and, or, xor take two operands
            0x78..=0x83 => {
                let vtype = if (opcode - 0x78) % 2 == 0 { VType::Integer } else { VType::Long };
                let operand = if opcode <= 0x7d { 1 } else { words(&vtype) };
                state.pop(words(&vtype) + operand).map_err(fail)?;
                state.push(vtype);
            }
            // i2l .. d2f
            0x85..=0x90 => {
                let n = opcode - 0x85;
                let from = n / 3;
                let mut to = n % 3;
                if to >= from {
                    to += 1;
                }
                state.pop(words(&kind(from))).map_err(fail)?;
                state.push(kind(to));
            }
            // i2b, i2c, i2s
            0x91..=0x93 => {}
            0x94 | 0x97 | 0x98 => {
                state.pop(4).map_err(fail)?;
                state.push(VType::Integer);
            }
            0x95 | 0x96 => {
                state.pop(2).map_err(fail)?;
                state.push(VType::Integer);
            }
            GETSTATIC | GETFIELD => {
                let field = pool.member_ref(u16_operand())?;
                if opcode == GETFIELD {
                    state.pop(1).map_err(fail)?;
                }
                let vtype = descriptor_vtype(pool, &field.descriptor)?;
                state.push(vtype);
            }
            PUTSTATIC | PUTFIELD => {
                let field = pool.member_ref(u16_operand())?;
                let vtype = descriptor_vtype(pool, &field.descriptor)?;
                let receiver = usize::from(opcode == PUTFIELD);
                state.pop(words(&vtype) + receiver).map_err(fail)?;
            }
            INVOKEVIRTUAL..=INVOKEINTERFACE => {
                let target = pool.member_ref(u16_operand())?;
                let sig = MethodSig::parse(&target.descriptor)?;
                state.pop(sig.param_slots() as usize).map_err(fail)?;
                if opcode != INVOKESTATIC {
                    let receiver = state.pop(1).map_err(fail)?;
                    if opcode == INVOKESPECIAL && target.name == "<init>" {
                        self.initialize(pool, state, &receiver[0]).map_err(fail)?;
                    }
                }
                self.push_return(pool, state, &sig.ret)?;
            }
            INVOKEDYNAMIC => {
                let name_and_type = match pool.get(u16_operand())? {
                    Constant::InvokeDynamic { name_and_type, .. } => *name_and_type,
                    _ => return Err(fail("invokedynamic without a call site")),
                };
                let (_, descriptor) = pool.name_and_type(name_and_type)?;
                let sig = MethodSig::parse(&descriptor)?;
                state.pop(sig.param_slots() as usize).map_err(fail)?;
                self.push_return(pool, state, &sig.ret)?;
            }
            NEW => state.push(VType::Uninitialized(insn.offset)),
            NEWARRAY => {
                let descriptor = match bytes[1] {
                    4 => "[Z",
                    5 => "[C",
                    6 => "[F",
                    7 => "[D",
                    8 => "[B",
                    9 => "[S",
                    10 => "[I",
                    11 => "[J",
                    _ => return Err(fail("unknown newarray type")),
                };
                state.pop(1).map_err(fail)?;
                state.push(class_vtype(pool, descriptor)?);
            }
            ANEWARRAY => {
                let component = pool.class_name(u16_operand())?;
                let descriptor = if component.starts_with('[') {
                    format!("[{}", component)
                } else {
                    format!("[L{};", component)
                };
                state.pop(1).map_err(fail)?;
                state.push(class_vtype(pool, &descriptor)?);
            }
            // arraylength, instanceof
            0xbe | INSTANCEOF => {
                state.pop(1).map_err(fail)?;
                state.push(VType::Integer);
            }
            CHECKCAST => {
                state.pop(1).map_err(fail)?;
                state.push(VType::Object(u16_operand()));
            }
            // monitorenter, monitorexit
            0xc2 | 0xc3 => {
                state.pop(1).map_err(fail)?;
            }
            WIDE => {
                let modified = bytes[1];
                let slot = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
                match modified {
                    IINC => {}
                    ILOAD..=DLOAD => state.push(kind(modified - ILOAD)),
                    ALOAD => {
                        let vtype = state.load(slot).map_err(fail)?;
                        state.push(vtype);
                    }
                    ISTORE..=ASTORE => {
                        let value = self.pop_value(state, modified - ISTORE).map_err(fail)?;
                        state.store(slot, value);
                    }
                    _ => return Err(fail("subroutine return")),
                }
            }
            MULTIANEWARRAY => {
                state.pop(bytes[3] as usize).map_err(fail)?;
                state.push(VType::Object(u16_operand()));
            }
            IRETURN..=RETURN | ATHROW | RET => {
                return Err(fail("control does not fall through to the branch"))
            }
            _ => return Err(fail("unsupported instruction")),
        }
        Ok(())
    }

    /// Pop the value a typed store moves; `family` 4 is a reference
    fn pop_value(&self, state: &mut FrameState, family: u8) -> Step<VType> {
        if family == 4 {
            let popped = state.pop(1)?;
            return Ok(popped[0].clone());
        }
        let vtype = kind(family);
        state.pop(words(&vtype))?;
        Ok(vtype)
    }

    fn push_return(&self, pool: &mut ConstantPool, state: &mut FrameState, ret: &ReturnType) -> InstrumentResult<()> {
        if let ReturnType::Value(ty) = ret {
            let vtype = field_vtype(pool, ty)?;
            state.push(vtype);
        }
        Ok(())
    }

    fn constant_vtype(&self, pool: &mut ConstantPool, index: u16) -> InstrumentResult<VType> {
        match pool.get(index)?.clone() {
            Constant::Integer(_) => Ok(VType::Integer),
            Constant::Float(_) => Ok(VType::Float),
            Constant::Long(_) => Ok(VType::Long),
            Constant::Double(_) => Ok(VType::Double),
            Constant::String(_) => class_vtype(pool, "java/lang/String"),
            Constant::Class(_) => class_vtype(pool, "java/lang/Class"),
            Constant::MethodType(_) => class_vtype(pool, "java/lang/invoke/MethodType"),
            Constant::MethodHandle { .. } => class_vtype(pool, "java/lang/invoke/MethodHandle"),
            Constant::Dynamic { name_and_type, .. } => {
                let (_, descriptor) = pool.name_and_type(name_and_type)?;
                descriptor_vtype(pool, &descriptor)
            }
            other => Err(InstrumentError::BadConstant {
                index,
                reason: format!("{:?} cannot be loaded with ldc", other),
            }),
        }
    }

    /// Element type loaded by `aaload` from an array of type `array`
    fn component_vtype(&self, pool: &mut ConstantPool, array: &VType) -> Result<VType, &'static str> {
        let index = match array {
            VType::Null => return Ok(VType::Null),
            VType::Object(index) => *index,
            _ => return Err("aaload from a non-reference"),
        };
        let name = pool.class_name(index).map_err(|_| "array class is not in the pool")?;
        let component = name.strip_prefix('[').ok_or("aaload from a non-array")?;
        let class = match component.strip_prefix('L').and_then(|c| c.strip_suffix(';')) {
            Some(class) => class.to_string(),
            None if component.starts_with('[') => component.to_string(),
            None => return Err("aaload from a primitive array"),
        };
        pool.add_class(&class)
            .map(VType::Object)
            .map_err(|_| "constant pool is full")
    }

    /// A constructor call turns every copy of the uninitialized value into
    /// an instance of its class
    fn initialize(&self, pool: &ConstantPool, state: &mut FrameState, receiver: &VType) -> Step<()> {
        let class = match receiver {
            VType::UninitializedThis => self.this_class,
            VType::Uninitialized(at) => {
                let created = self
                    .insns
                    .iter()
                    .find(|insn| insn.offset == *at)
                    .ok_or("constructor receiver without a new")?;
                match &created.op {
                    Operation::Plain(bytes) if bytes[0] == NEW => u16::from_be_bytes([bytes[1], bytes[2]]),
                    _ => return Err("constructor receiver without a new"),
                }
            }
            _ => return Ok(()),
        };
        pool.get(class).map_err(|_| "constructed class is not in the pool")?;
        state.replace(receiver, &VType::Object(class));
        Ok(())
    }
}
