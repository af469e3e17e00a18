// Class and jar fixtures for agent tests

use cfdebug_instrumenter::classfile::{access, attr, Attribute, ClassFile, MemberInfo};
use cfdebug_instrumenter::code::CodeAttribute;
use cfdebug_instrumenter::constpool::ConstantPool;
use cfdebug_instrumenter::opcodes::{ACONST_NULL, ARETURN};
use std::io::Write;
use std::path::Path;
use zip::write::FileOptions;
use zip::ZipWriter;

const CALL_DESC: &str = "(Llucee/runtime/PageContext;)Ljava/lang/Object;";

/// A class with one `(PageContext)Object` method per name, each returning null
pub fn class_bytes(name: &str, super_name: &str, interfaces: &[&str], methods: &[&str]) -> Vec<u8> {
    let mut pool = ConstantPool::new();
    let this_class = pool.add_class(name).unwrap();
    let super_class = pool.add_class(super_name).unwrap();
    let interfaces = interfaces.iter().map(|i| pool.add_class(i).unwrap()).collect();

    let body = CodeAttribute {
        max_stack: 1,
        max_locals: 2,
        code: vec![ACONST_NULL, ARETURN],
        exception_table: Vec::new(),
        attributes: Vec::new(),
    }
    .encode()
    .unwrap();
    let code_name = pool.add_utf8(attr::CODE).unwrap();

    let methods = methods
        .iter()
        .map(|m| MemberInfo {
            access_flags: access::PUBLIC,
            name_index: pool.add_utf8(m).unwrap(),
            descriptor_index: pool.add_utf8(CALL_DESC).unwrap(),
            attributes: vec![Attribute {
                name_index: code_name,
                info: body.clone(),
            }],
        })
        .collect();

    ClassFile {
        minor_version: 0,
        major_version: 52,
        constant_pool: pool,
        access_flags: access::PUBLIC,
        this_class,
        super_class,
        interfaces,
        fields: Vec::new(),
        methods,
        attributes: Vec::new(),
    }
    .encode()
    .unwrap()
}

pub fn jar(path: &Path, entries: &[(&str, Vec<u8>)]) {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = ZipWriter::new(file);
    for (name, bytes) in entries {
        writer.start_file(*name, FileOptions::default()).unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap();
}
