// Shared test support: a builder for small page classes and an interpreter
// that runs (instrumented) methods against a FrameTracker
#![allow(dead_code)]

use cfdebug_instrumenter::classfile::{access, attr, Attribute, ClassFile, MemberInfo};
use cfdebug_instrumenter::code::{
    decode, CodeAttribute, CodeBuilder, ExceptionEntry, Label, LineNumberEntry, Operation,
};
use cfdebug_instrumenter::constpool::{Constant, ConstantPool};
use cfdebug_instrumenter::descriptor::{FieldType, MethodSig};
use cfdebug_instrumenter::opcodes::*;
use cfdebug_instrumenter::stackmap::{self, FrameBody, StackMapFrame};
use cfdebug_instrumenter::types::FrameContext;
use cfdebug_instrumenter::{FrameTracker, TrackerAbi};
use std::cell::Cell;
use std::collections::HashMap;

pub const PAGE_CLASS: &str = "app/index_cfm$cf";
pub const PAGE_CONTEXT: &str = "lucee/runtime/PageContext";
pub const CALL_DESC: &str = "(Llucee/runtime/PageContext;)Ljava/lang/Object;";
pub const SOURCE: &str = "/var/www/index.cfm";

const IFLT: u8 = 0x9b;
const IFGE: u8 = 0x9c;
const IFGT: u8 = 0x9d;
const IFLE: u8 = 0x9e;
const IF_ICMPEQ: u8 = 0x9f;
const IF_ICMPNE: u8 = 0xa0;
const IF_ICMPGT: u8 = 0xa3;
const IF_ICMPLE: u8 = 0xa4;
const LADD: u8 = 0x61;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("cfdebug_instrumenter=debug")
        .with_test_writer()
        .try_init();
}

pub struct ClassBuilder {
    pool: ConstantPool,
    this_class: u16,
    super_class: u16,
    access_flags: u16,
    major_version: u16,
    methods: Vec<MemberInfo>,
    attributes: Vec<Attribute>,
}

impl ClassBuilder {
    pub fn new(name: &str) -> Self {
        let mut pool = ConstantPool::new();
        let this_class = pool.add_class(name).unwrap();
        let super_class = pool.add_class("lucee/runtime/PageImpl").unwrap();
        Self {
            pool,
            this_class,
            super_class,
            access_flags: access::PUBLIC,
            major_version: 52,
            methods: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn page() -> Self {
        Self::new(PAGE_CLASS).source_file(SOURCE)
    }

    pub fn extends(mut self, super_name: &str) -> Self {
        self.super_class = self.pool.add_class(super_name).unwrap();
        self
    }

    pub fn version(mut self, major: u16) -> Self {
        self.major_version = major;
        self
    }

    pub fn source_file(mut self, path: &str) -> Self {
        let name_index = self.pool.add_utf8(attr::SOURCE_FILE).unwrap();
        let value = self.pool.add_utf8(path).unwrap();
        self.attributes.push(Attribute {
            name_index,
            info: value.to_be_bytes().to_vec(),
        });
        self
    }

    /// Adds a method whose body is produced by `build`
    pub fn method(
        mut self,
        flags: u16,
        name: &str,
        descriptor: &str,
        build: impl FnOnce(&mut MethodBody),
    ) -> Self {
        let sig = MethodSig::parse(descriptor).unwrap();
        let receiver = if flags & access::STATIC != 0 { 0 } else { 1 };
        let mut body = MethodBody {
            code: CodeBuilder::new(),
            pool: &mut self.pool,
            this_class: self.this_class,
            max_stack: 4,
            max_locals: receiver + sig.param_slots(),
            lines: Vec::new(),
            catches: Vec::new(),
            frames: Vec::new(),
            extra: Vec::new(),
        };
        build(&mut body);
        let member = body.finish(flags, name, descriptor);
        self.methods.push(member);
        self
    }

    /// Method without a Code attribute
    pub fn abstract_method(mut self, flags: u16, name: &str, descriptor: &str) -> Self {
        self.access_flags |= access::ABSTRACT;
        self.methods.push(MemberInfo {
            access_flags: flags | access::ABSTRACT,
            name_index: self.pool.add_utf8(name).unwrap(),
            descriptor_index: self.pool.add_utf8(descriptor).unwrap(),
            attributes: Vec::new(),
        });
        self
    }

    pub fn interface(mut self) -> Self {
        self.access_flags = access::PUBLIC | access::INTERFACE | access::ABSTRACT;
        self
    }

    pub fn build(self) -> Vec<u8> {
        ClassFile {
            minor_version: 0,
            major_version: self.major_version,
            constant_pool: self.pool,
            access_flags: self.access_flags,
            this_class: self.this_class,
            super_class: self.super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: self.methods,
            attributes: self.attributes,
        }
        .encode()
        .unwrap()
    }
}

pub struct MethodBody<'p> {
    pub code: CodeBuilder,
    pub pool: &'p mut ConstantPool,
    this_class: u16,
    pub max_stack: u16,
    pub max_locals: u16,
    lines: Vec<(Label, u16)>,
    catches: Vec<(Label, Label, Label, Option<String>)>,
    frames: Vec<(Label, FrameBody)>,
    extra: Vec<(String, Vec<u8>)>,
}

impl<'p> MethodBody<'p> {
    /// Starts source line `line` at the current position
    pub fn line(&mut self, line: u16) -> &mut CodeBuilder {
        let label = self.code.mark();
        self.lines.push((label, line));
        &mut self.code
    }

    pub fn catch(&mut self, start: Label, end: Label, handler: Label, class: Option<&str>) {
        self.catches
            .push((start, end, handler, class.map(str::to_string)));
    }

    pub fn frame(&mut self, at: Label, body: FrameBody) {
        self.frames.push((at, body));
    }

    /// Raw extra Code attribute, e.g. a LocalVariableTable
    pub fn attribute(&mut self, name: &str, info: Vec<u8>) {
        self.extra.push((name.to_string(), info));
    }

    pub fn class_index(&mut self, name: &str) -> u16 {
        self.pool.add_class(name).unwrap()
    }

    pub fn push_int(&mut self, value: i32) {
        self.code.push_int(self.pool, value).unwrap();
    }

    pub fn push_string(&mut self, value: &str) {
        let index = self.pool.add_string(value).unwrap();
        self.code.ldc(index);
    }

    /// `throw new RuntimeException(message)`
    pub fn throw_new(&mut self, message: &str) {
        let class = self.pool.add_class("java/lang/RuntimeException").unwrap();
        let init = self
            .pool
            .add_methodref("java/lang/RuntimeException", "<init>", "(Ljava/lang/String;)V")
            .unwrap();
        self.code.op_u16(NEW, class).op(DUP);
        self.push_string(message);
        self.code.op_u16(INVOKESPECIAL, init).op(ATHROW);
    }

    /// Call another method of the class under construction
    pub fn invoke_self(&mut self, opcode: u8, name: &str, descriptor: &str) {
        let class = self.pool.class_name(self.this_class).unwrap();
        let method = self.pool.add_methodref(&class, name, descriptor).unwrap();
        self.code.op_u16(opcode, method);
    }

    fn finish(mut self, flags: u16, name: &str, descriptor: &str) -> MemberInfo {
        let offset = |label: Label| self.code.offset_of(label).expect("label placed");

        let mut attributes = Vec::new();
        if !self.lines.is_empty() {
            let entries: Vec<_> = self
                .lines
                .iter()
                .map(|(label, line)| LineNumberEntry {
                    start_pc: offset(*label) as u16,
                    line_number: *line,
                })
                .collect();
            attributes.push(Attribute {
                name_index: self.pool.add_utf8(attr::LINE_NUMBER_TABLE).unwrap(),
                info: LineNumberEntry::encode_table(&entries).unwrap(),
            });
        }
        if !self.frames.is_empty() {
            let mut frames: Vec<_> = self
                .frames
                .iter()
                .map(|(label, body)| StackMapFrame {
                    offset: offset(*label),
                    body: body.clone(),
                })
                .collect();
            frames.sort_by_key(|f| f.offset);
            attributes.push(Attribute {
                name_index: self.pool.add_utf8(attr::STACK_MAP_TABLE).unwrap(),
                info: stackmap::encode(&frames).unwrap(),
            });
        }
        for (attr_name, info) in &self.extra {
            attributes.push(Attribute {
                name_index: self.pool.add_utf8(attr_name).unwrap(),
                info: info.clone(),
            });
        }

        let mut exception_table = Vec::new();
        for (start, end, handler, class) in &self.catches {
            exception_table.push(ExceptionEntry {
                start_pc: offset(*start) as u16,
                end_pc: offset(*end) as u16,
                handler_pc: offset(*handler) as u16,
                catch_type: match class {
                    Some(class) => self.pool.add_class(class).unwrap(),
                    None => 0,
                },
            });
        }

        let code = CodeAttribute {
            max_stack: self.max_stack,
            max_locals: self.max_locals,
            code: self.code.finish().unwrap(),
            exception_table,
            attributes,
        };

        MemberInfo {
            access_flags: flags,
            name_index: self.pool.add_utf8(name).unwrap(),
            descriptor_index: self.pool.add_utf8(descriptor).unwrap(),
            attributes: vec![Attribute {
                name_index: self.pool.add_utf8(attr::CODE).unwrap(),
                info: code.encode().unwrap(),
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Long(i64),
    Null,
    Str(String),
    /// The request context handed to entry points
    Context,
    This,
    Tracker,
    Uninit(String),
    Throwable { class: String, message: String },
    Void,
    Top,
}

impl Value {
    fn slots(&self) -> u16 {
        match self {
            Value::Long(_) => 2,
            _ => 1,
        }
    }

    fn int(&self) -> i32 {
        match self {
            Value::Int(v) => *v,
            other => panic!("expected int, got {:?}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Return(Value),
    Throw(Value),
}

enum Step {
    Next,
    Jump(u32),
    Return(Value),
    Throw(Value),
}

/// Interprets the subset of bytecode the builder and the rewriter emit,
/// checking operand stack depth against max_stack on every instruction
pub struct Vm<'t> {
    class: ClassFile,
    tracker: &'t dyn FrameTracker,
    abi: TrackerAbi,
    budget: Cell<usize>,
}

impl<'t> Vm<'t> {
    pub fn new(bytes: &[u8], tracker: &'t dyn FrameTracker) -> Self {
        Self {
            class: ClassFile::parse(bytes).unwrap(),
            tracker,
            abi: TrackerAbi::default(),
            budget: Cell::new(1_000_000),
        }
    }

    pub fn class(&self) -> &ClassFile {
        &self.class
    }

    /// Invoke the method called `name` (unique in the class)
    pub fn invoke(&self, name: &str, args: Vec<Value>) -> Completion {
        let matches: Vec<_> = self
            .class
            .methods
            .iter()
            .filter(|m| self.class.member_name(m).unwrap() == name)
            .collect();
        assert_eq!(matches.len(), 1, "expected exactly one method {}", name);
        let method = matches[0];
        let receiver = (!method.is_static()).then_some(Value::This);
        self.run(method, receiver, args)
    }

    fn find(&self, name: &str, descriptor: &str) -> &MemberInfo {
        self.class
            .methods
            .iter()
            .find(|m| {
                self.class.member_name(m).unwrap() == name
                    && self.class.member_descriptor(m).unwrap() == descriptor
            })
            .unwrap_or_else(|| panic!("no method {}{}", name, descriptor))
    }

    fn run(&self, method: &MemberInfo, receiver: Option<Value>, args: Vec<Value>) -> Completion {
        let pool = &self.class.constant_pool;
        let code = CodeAttribute::parse(&method.attribute(pool, attr::CODE).expect("method has code").info)
            .unwrap();
        let insns = decode(&code.code).unwrap();
        let index: HashMap<u32, usize> = insns.iter().enumerate().map(|(i, insn)| (insn.offset, i)).collect();

        let mut locals = vec![Value::Top; code.max_locals as usize];
        let mut slot = 0usize;
        for value in receiver.into_iter().chain(args) {
            let width = value.slots() as usize;
            locals[slot] = value;
            slot += width;
        }

        let mut stack: Vec<Value> = Vec::new();
        let mut pc = 0usize;
        loop {
            let left = self.budget.get();
            assert!(left > 0, "instruction budget exhausted");
            self.budget.set(left - 1);

            let depth: u16 = stack.iter().map(Value::slots).sum();
            assert!(depth <= code.max_stack, "stack depth {} exceeds max_stack {}", depth, code.max_stack);

            let insn = &insns[pc];
            let step = match &insn.op {
                Operation::Plain(bytes) => self.exec(bytes, &mut stack, &mut locals),
                Operation::Branch { opcode, target } => {
                    if branch_taken(*opcode, &mut stack) {
                        Step::Jump(*target)
                    } else {
                        Step::Next
                    }
                }
                Operation::WideBranch { target, .. } => Step::Jump(*target),
                Operation::TableSwitch { default, low, high, targets } => {
                    let key = pop(&mut stack).int();
                    if key < *low || key > *high {
                        Step::Jump(*default)
                    } else {
                        Step::Jump(targets[(key - low) as usize])
                    }
                }
                Operation::LookupSwitch { default, pairs } => {
                    let key = pop(&mut stack).int();
                    let target = pairs.iter().find(|(k, _)| *k == key).map(|(_, t)| *t);
                    Step::Jump(target.unwrap_or(*default))
                }
            };

            match step {
                Step::Next => pc += 1,
                Step::Jump(target) => pc = index[&target],
                Step::Return(value) => return Completion::Return(value),
                Step::Throw(exception) => match self.handler_for(&code.exception_table, insn.offset, &exception) {
                    Some(handler) => {
                        stack.clear();
                        stack.push(exception);
                        pc = index[&(handler as u32)];
                    }
                    None => return Completion::Throw(exception),
                },
            }
        }
    }

    fn handler_for(&self, table: &[ExceptionEntry], pc: u32, exception: &Value) -> Option<u16> {
        let Value::Throwable { class, .. } = exception else {
            panic!("throwing a non-throwable {:?}", exception);
        };
        table
            .iter()
            .find(|e| {
                (e.start_pc as u32) <= pc
                    && pc < e.end_pc as u32
                    && (e.catch_type == 0 || {
                        let catch = self.class.constant_pool.class_name(e.catch_type).unwrap();
                        catch == *class || catch == "java/lang/Throwable"
                    })
            })
            .map(|e| e.handler_pc)
    }

    fn exec(&self, bytes: &[u8], stack: &mut Vec<Value>, locals: &mut [Value]) -> Step {
        let pool = &self.class.constant_pool;
        let u16_at = |i: usize| u16::from_be_bytes([bytes[i], bytes[i + 1]]);
        let op = bytes[0];
        match op {
            NOP | CHECKCAST => {}
            ACONST_NULL => stack.push(Value::Null),
            ICONST_M1..=ICONST_5 => stack.push(Value::Int(op as i32 - ICONST_0 as i32)),
            BIPUSH => stack.push(Value::Int(bytes[1] as i8 as i32)),
            SIPUSH => stack.push(Value::Int(u16_at(1) as i16 as i32)),
            LDC | LDC_W | LDC2_W => {
                let index = if op == LDC { bytes[1] as u16 } else { u16_at(1) };
                stack.push(match pool.get(index).unwrap() {
                    Constant::Integer(v) => Value::Int(*v),
                    Constant::Long(v) => Value::Long(*v),
                    Constant::String(utf8) => Value::Str(pool.utf8(*utf8).unwrap()),
                    other => panic!("unsupported ldc {:?}", other),
                });
            }
            ILOAD | LLOAD | ALOAD => stack.push(locals[bytes[1] as usize].clone()),
            0x1a..=0x2d => stack.push(locals[((op - ILOAD_0) % 4) as usize].clone()),
            ISTORE | ASTORE => locals[bytes[1] as usize] = pop(stack),
            0x3b..=0x4e => locals[((op - ISTORE_0) % 4) as usize] = pop(stack),
            WIDE => match bytes[1] {
                IINC => {
                    let slot = u16_at(2) as usize;
                    let delta = u16_at(4) as i16 as i32;
                    locals[slot] = Value::Int(locals[slot].int() + delta);
                }
                ILOAD | LLOAD | ALOAD => stack.push(locals[u16_at(2) as usize].clone()),
                ISTORE | ASTORE => locals[u16_at(2) as usize] = pop(stack),
                other => panic!("unsupported wide {:#x}", other),
            },
            POP => {
                pop(stack);
            }
            DUP => {
                let top = stack.last().cloned().expect("dup on empty stack");
                stack.push(top);
            }
            IADD | ISUB | IMUL => {
                let b = pop(stack).int();
                let a = pop(stack).int();
                stack.push(Value::Int(match op {
                    IADD => a.wrapping_add(b),
                    ISUB => a.wrapping_sub(b),
                    _ => a.wrapping_mul(b),
                }));
            }
            LADD => match (pop(stack), pop(stack)) {
                (Value::Long(b), Value::Long(a)) => stack.push(Value::Long(a.wrapping_add(b))),
                other => panic!("ladd on {:?}", other),
            },
            IINC => {
                let slot = bytes[1] as usize;
                locals[slot] = Value::Int(locals[slot].int() + bytes[2] as i8 as i32);
            }
            IRETURN | LRETURN | ARETURN => return Step::Return(pop(stack)),
            RETURN => return Step::Return(Value::Void),
            ATHROW => return Step::Throw(pop(stack)),
            GETSTATIC => {
                let field = pool.member_ref(u16_at(1)).unwrap();
                assert_eq!(field.class, self.abi.holder_class);
                assert_eq!(field.name, self.abi.holder_field);
                assert_eq!(field.descriptor, self.abi.tracker_descriptor());
                stack.push(Value::Tracker);
            }
            NEW => stack.push(Value::Uninit(pool.class_name(u16_at(1)).unwrap())),
            INVOKEINTERFACE => return self.call_tracker(u16_at(1), stack),
            INVOKESPECIAL | INVOKEVIRTUAL | INVOKESTATIC => {
                let target = pool.member_ref(u16_at(1)).unwrap();
                let sig = MethodSig::parse(&target.descriptor).unwrap();
                let args = pop_args(stack, &sig);

                if target.name == "<init>" {
                    let Value::Uninit(class) = pop(stack) else {
                        panic!("<init> on initialized value");
                    };
                    let message = match args.first() {
                        Some(Value::Str(s)) => s.clone(),
                        _ => String::new(),
                    };
                    for value in stack.iter_mut() {
                        if *value == Value::Uninit(class.clone()) {
                            *value = Value::Throwable { class: class.clone(), message: message.clone() };
                        }
                    }
                    return Step::Next;
                }

                assert_eq!(target.class, self.class.this_class_name().unwrap());
                let method = self.find(&target.name, &target.descriptor);
                assert_eq!(method.is_static(), op == INVOKESTATIC);
                if op == INVOKESPECIAL {
                    assert!(method.is_private(), "invokespecial on non-private method");
                }
                let receiver = if op == INVOKESTATIC {
                    None
                } else {
                    let receiver = pop(stack);
                    assert_eq!(receiver, Value::This);
                    Some(receiver)
                };

                match self.run(method, receiver, args) {
                    Completion::Return(Value::Void) => {}
                    Completion::Return(value) => stack.push(value),
                    Completion::Throw(exception) => return Step::Throw(exception),
                }
            }
            other => panic!("unsupported opcode {:#x}", other),
        }
        Step::Next
    }

    fn call_tracker(&self, index: u16, stack: &mut Vec<Value>) -> Step {
        let target = self.class.constant_pool.member_ref(index).unwrap();
        assert_eq!(target.class, self.abi.tracker_interface);
        let sig = MethodSig::parse(&target.descriptor).unwrap();
        let args = pop_args(stack, &sig);
        assert_eq!(pop(stack), Value::Tracker);

        let abi = &self.abi;
        let name = target.name.as_str();
        if name == abi.push_frame || name == abi.push_default_value_init_frame {
            assert_eq!(target.descriptor, abi.push_descriptor());
            assert_eq!(args[0], Value::Context);
            let Value::Str(source_path) = &args[1] else {
                panic!("push without a source path");
            };
            let context = FrameContext { source_path: source_path.clone() };
            if name == abi.push_frame {
                self.tracker.push_frame(&context);
            } else {
                self.tracker.push_default_value_init_frame(&context);
            }
        } else if name == abi.pop_frame {
            self.tracker.pop_frame();
        } else if name == abi.on_line {
            self.tracker.on_line(args[0].int() as u32);
        } else if name == abi.on_step_after_call {
            self.tracker.on_step_after_call();
        } else {
            panic!("unknown tracker method {}", name);
        }
        Step::Next
    }
}

fn pop(stack: &mut Vec<Value>) -> Value {
    stack.pop().expect("operand stack underflow")
}

fn pop_args(stack: &mut Vec<Value>, sig: &MethodSig) -> Vec<Value> {
    let mut args: Vec<Value> = (0..sig.params.len()).map(|_| pop(stack)).collect();
    args.reverse();
    for (param, arg) in sig.params.iter().zip(&args) {
        match (param, arg) {
            (FieldType::Long, Value::Long(_)) | (FieldType::Int, Value::Int(_)) => {}
            (FieldType::Object(_) | FieldType::Array(_), _) => {}
            (param, arg) => panic!("argument {:?} for parameter {:?}", arg, param),
        }
    }
    args
}

fn branch_taken(opcode: u8, stack: &mut Vec<Value>) -> bool {
    match opcode {
        GOTO => true,
        IFEQ | IFNE | IFLT | IFGE | IFGT | IFLE => {
            let v = pop(stack).int();
            match opcode {
                IFEQ => v == 0,
                IFNE => v != 0,
                IFLT => v < 0,
                IFGE => v >= 0,
                IFGT => v > 0,
                _ => v <= 0,
            }
        }
        IF_ICMPEQ..=IF_ICMPLE => {
            let b = pop(stack).int();
            let a = pop(stack).int();
            match opcode {
                IF_ICMPEQ => a == b,
                IF_ICMPNE => a != b,
                IF_ICMPLT => a < b,
                IF_ICMPGE => a >= b,
                IF_ICMPGT => a > b,
                _ => a <= b,
            }
        }
        IFNULL => pop(stack) == Value::Null,
        IFNONNULL => pop(stack) != Value::Null,
        other => panic!("unsupported branch {:#x}", other),
    }
}
