// Method rewriting
//
// A matched method `N` becomes two methods:
//
//   __luceedebug__N  the original body, with a tracker step call inserted
//                    before the first instruction of every source line
//   N                a wrapper with the original signature:
//
//     tracker.push(ctx, sourcePath)
//     try {
//         result = this.__luceedebug__N(args...)
//     } catch (Throwable t) {
//         tracker.pop()
//         throw t
//     }
//     tracker.pop()
//     tracker.stepAfterCall()      // not for default-value frames
//     return result

use crate::classfile::{attr, Attribute, ClassFile, MemberInfo, STACK_MAP_MAJOR_VERSION};
use crate::code::{CodeAttribute, CodeBuilder, ExceptionEntry};
use crate::config::InstrumentConfig;
use crate::constpool::ConstantPool;
use crate::descriptor::{FieldType, MethodSig};
use crate::error::{InstrumentError, InstrumentResult};
use crate::frames::MethodShape;
use crate::opcodes::*;
use crate::stackmap::{self, FrameBody, StackMapFrame, VerificationType};
use crate::types::{FrameKind, MethodDescriptor};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Stack slots a line step call needs on top of whatever is already there
const STEP_CALL_STACK: u16 = 2;

/// Per-unit facts captured before any method is rewritten
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitMetadata {
    pub this_class: String,
    pub super_class: Option<String>,
    pub source_path: String,
    /// Utf8 entry backing `source_path`, when the unit has a SourceFile
    pub source_index: Option<u16>,
    pub major_version: u16,
    pub is_interface: bool,
}

impl UnitMetadata {
    pub fn capture(class: &ClassFile, unknown_source: &str) -> InstrumentResult<Self> {
        let source_index = class.source_file_index()?;
        let source_path = match source_index {
            Some(index) => class.constant_pool.utf8(index)?,
            None => unknown_source.to_string(),
        };

        Ok(Self {
            this_class: class.this_class_name()?,
            super_class: class.super_class_name()?,
            source_path,
            source_index,
            major_version: class.major_version,
            is_interface: class.is_interface(),
        })
    }
}

/// Constant-pool entries shared by every rewritten method of one unit
#[derive(Debug, Clone, Copy)]
struct TrackerRefs {
    holder: u16,
    push_frame: u16,
    push_default_value_init_frame: u16,
    pop_frame: u16,
    on_line: u16,
    on_step_after_call: u16,
    source_path: u16,
    throwable: u16,
    code_attr: u16,
    stack_map_attr: u16,
}

impl TrackerRefs {
    fn resolve(
        pool: &mut ConstantPool,
        config: &InstrumentConfig,
        unit: &UnitMetadata,
    ) -> InstrumentResult<Self> {
        let abi = &config.tracker;
        let iface = abi.tracker_interface.as_str();
        let push_descriptor = abi.push_descriptor();

        let source_path = match unit.source_index {
            Some(utf8) => pool.add_string_for_utf8(utf8)?,
            None => pool.add_string(&unit.source_path)?,
        };

        Ok(Self {
            holder: pool.add_fieldref(&abi.holder_class, &abi.holder_field, &abi.tracker_descriptor())?,
            push_frame: pool.add_interface_methodref(iface, &abi.push_frame, &push_descriptor)?,
            push_default_value_init_frame: pool.add_interface_methodref(
                iface,
                &abi.push_default_value_init_frame,
                &push_descriptor,
            )?,
            pop_frame: pool.add_interface_methodref(iface, &abi.pop_frame, "()V")?,
            on_line: pool.add_interface_methodref(iface, &abi.on_line, "(I)V")?,
            on_step_after_call: pool.add_interface_methodref(iface, &abi.on_step_after_call, "()V")?,
            source_path,
            throwable: pool.add_class("java/lang/Throwable")?,
            code_attr: pool.add_utf8(attr::CODE)?,
            stack_map_attr: pool.add_utf8(attr::STACK_MAP_TABLE)?,
        })
    }

    fn push(&self, kind: FrameKind) -> u16 {
        match kind {
            FrameKind::StandardCall => self.push_frame,
            FrameKind::DefaultValueInit => self.push_default_value_init_frame,
        }
    }
}

/// Result of rewriting one method
#[derive(Debug, Clone)]
pub struct RewrittenMethod {
    /// Original body under the hidden name, instrumented per line
    pub renamed: MemberInfo,
    /// New method under the original name
    pub wrapper: MemberInfo,
    pub method: MethodDescriptor,
    /// Step calls inserted into the renamed body
    pub step_sites: usize,
}

pub struct MethodRewriter<'a> {
    config: &'a InstrumentConfig,
    unit: &'a UnitMetadata,
    refs: TrackerRefs,
}

impl<'a> MethodRewriter<'a> {
    /// Resolves the tracker references into `pool`; call once per unit
    pub fn new(
        config: &'a InstrumentConfig,
        unit: &'a UnitMetadata,
        pool: &mut ConstantPool,
    ) -> InstrumentResult<Self> {
        let refs = TrackerRefs::resolve(pool, config, unit)?;
        Ok(Self { config, unit, refs })
    }

    pub fn rewrite(
        &self,
        pool: &mut ConstantPool,
        method: MemberInfo,
        kind: FrameKind,
    ) -> InstrumentResult<RewrittenMethod> {
        let name = pool.utf8(method.name_index)?;
        let descriptor = pool.utf8(method.descriptor_index)?;
        let sig = MethodSig::parse(&descriptor)?;
        self.check_context_param(&name, &sig)?;

        let code_pos = method
            .attributes
            .iter()
            .position(|a| pool.utf8_eq(a.name_index, attr::CODE))
            .ok_or_else(|| InstrumentError::shape(&name, "no Code attribute"))?;

        // Renaming: same flags, descriptor and attributes, instrumented body
        let hidden_name = format!("{}{}", self.config.hidden_prefix, name);
        let mut body = CodeAttribute::parse(&method.attributes[code_pos].info)?;
        let shape = MethodShape {
            class_name: &self.unit.this_class,
            name: &name,
            descriptor: &descriptor,
            is_static: method.is_static(),
        };
        let step_sites = self.instrument_lines(pool, &shape, &mut body)?;

        let mut renamed = method.clone();
        renamed.name_index = pool.add_utf8(&hidden_name)?;
        renamed.attributes[code_pos].info = body.encode()?;

        // Wrapper synthesis
        let delegate = pool.add_methodref(&self.unit.this_class, &hidden_name, &descriptor)?;
        let wrapper_code = self.wrapper_code(&method, &sig, kind, delegate)?;

        let mut attributes = vec![Attribute {
            name_index: self.refs.code_attr,
            info: wrapper_code.encode()?,
        }];
        attributes.extend(
            method
                .attributes
                .iter()
                .filter(|a| {
                    pool.utf8_eq(a.name_index, attr::EXCEPTIONS)
                        || pool.utf8_eq(a.name_index, attr::SIGNATURE)
                })
                .cloned(),
        );

        let wrapper = MemberInfo {
            access_flags: method.access_flags,
            name_index: method.name_index,
            descriptor_index: method.descriptor_index,
            attributes,
        };

        debug!(
            "Wrapped {}.{}{} as {:?} with {} step sites",
            self.unit.this_class, name, descriptor, kind, step_sites
        );

        Ok(RewrittenMethod {
            renamed,
            wrapper,
            method: MethodDescriptor {
                name,
                descriptor,
                access_flags: method.access_flags,
                declaring_unit: self.unit.this_class.clone(),
            },
            step_sites,
        })
    }

    /// The first parameter is handed to the tracker on push, so it must be the
    /// request context
    fn check_context_param(&self, name: &str, sig: &MethodSig) -> InstrumentResult<()> {
        let first = sig
            .params
            .first()
            .ok_or_else(|| InstrumentError::shape(name, "entry point without parameters"))?;

        match &self.config.tracker.context_class {
            Some(context) if *first != FieldType::Object(context.clone()) => Err(
                InstrumentError::shape(
                    name,
                    format!("first parameter is {}, expected L{};", first.descriptor(), context),
                ),
            ),
            None if !first.is_reference() => Err(InstrumentError::shape(
                name,
                format!("first parameter {} is not a reference", first.descriptor()),
            )),
            _ => Ok(()),
        }
    }

    /// Insert a step call before the first instruction of every line table
    /// entry; returns how many were inserted
    fn instrument_lines(
        &self,
        pool: &mut ConstantPool,
        shape: &MethodShape,
        body: &mut CodeAttribute,
    ) -> InstrumentResult<usize> {
        let entries = body.line_numbers(pool)?;

        let mut seen = HashSet::new();
        let mut snippets: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        for entry in entries {
            if !seen.insert((entry.start_pc, entry.line_number)) {
                continue;
            }
            let snippet = self.step_call(pool, entry.line_number)?;
            snippets
                .entry(entry.start_pc as u32)
                .or_default()
                .extend_from_slice(&snippet);
        }

        body.insert_before(pool, shape, snippets, STEP_CALL_STACK)?;
        Ok(seen.len())
    }

    /// `getstatic holder; push line; invokeinterface onLine(I)V`
    fn step_call(&self, pool: &mut ConstantPool, line: u16) -> InstrumentResult<Vec<u8>> {
        let mut b = CodeBuilder::new();
        b.op_u16(GETSTATIC, self.refs.holder);
        b.push_int(pool, line as i32)?;
        b.invokeinterface(self.refs.on_line, 2);
        b.finish()
    }

    fn wrapper_code(
        &self,
        method: &MemberInfo,
        sig: &MethodSig,
        kind: FrameKind,
        delegate: u16,
    ) -> InstrumentResult<CodeAttribute> {
        let receiver: u16 = if method.is_static() { 0 } else { 1 };
        let context = &sig.params[0];
        let mut b = CodeBuilder::new();

        // push(ctx, sourcePath)
        b.op_u16(GETSTATIC, self.refs.holder);
        b.raw(&context.load(receiver));
        b.ldc(self.refs.source_path);
        b.invokeinterface(self.refs.push(kind), 3);

        // delegate with the receiver and arguments untouched
        let try_start = b.mark();
        if !method.is_static() {
            b.op(ALOAD_0);
        }
        let mut slot = receiver;
        for param in &sig.params {
            b.raw(&param.load(slot));
            slot += param.slots();
        }
        let invoke = if method.is_static() {
            INVOKESTATIC
        } else if method.is_private() {
            INVOKESPECIAL
        } else {
            INVOKEVIRTUAL
        };
        b.op_u16(invoke, delegate);
        let try_end = b.mark();

        // normal return
        b.op_u16(GETSTATIC, self.refs.holder);
        b.invokeinterface(self.refs.pop_frame, 1);
        if kind.steps_after_call() {
            b.op_u16(GETSTATIC, self.refs.holder);
            b.invokeinterface(self.refs.on_step_after_call, 1);
        }
        b.op(sig.ret.return_opcode());

        // exceptional return: pop only, rethrow the same throwable
        let handler = b.mark();
        b.op_u16(GETSTATIC, self.refs.holder);
        b.invokeinterface(self.refs.pop_frame, 1);
        b.op(ATHROW);

        let offset = |label| {
            b.offset_of(label)
                .map(|o| o as u16)
                .ok_or_else(|| InstrumentError::Malformed("unplaced wrapper label".to_string()))
        };
        let exception_table = vec![ExceptionEntry {
            start_pc: offset(try_start)?,
            end_pc: offset(try_end)?,
            handler_pc: offset(handler)?,
            catch_type: 0,
        }];
        let handler_pc = offset(handler)? as u32;

        let mut attributes = Vec::new();
        if self.unit.major_version >= STACK_MAP_MAJOR_VERSION {
            let frames = [StackMapFrame {
                offset: handler_pc,
                body: FrameBody::SameLocals1StackItem(VerificationType::Object(self.refs.throwable)),
            }];
            attributes.push(Attribute {
                name_index: self.refs.stack_map_attr,
                info: stackmap::encode(&frames)?,
            });
        }

        let locals = receiver + sig.param_slots();
        let max_stack = [3, locals, sig.ret.slots() + 1, 2]
            .into_iter()
            .max()
            .unwrap_or(3);

        Ok(CodeAttribute {
            max_stack,
            max_locals: locals,
            code: b.finish()?,
            exception_table,
            attributes,
        })
    }
}
