// Unit inspection
//
// Shows how the matcher classifies each method of a class file and whether
// the unit has already been instrumented.

use anyhow::{Context, Result};
use cfdebug_instrumenter::classfile::ClassFile;
use cfdebug_instrumenter::{classify, FrameKind, InstrumentConfig};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
pub struct MethodSummary {
    pub name: String,
    pub descriptor: String,
    pub access_flags: u16,
    pub has_code: bool,
    pub kind: Option<FrameKind>,
}

#[derive(Debug, Serialize)]
pub struct UnitSummary {
    pub class_name: String,
    pub super_class: Option<String>,
    pub source_file: Option<String>,
    pub major_version: u16,
    pub instrumented: bool,
    pub methods: Vec<MethodSummary>,
}

pub fn inspect_bytes(bytes: &[u8], config: &InstrumentConfig) -> Result<UnitSummary> {
    let class = ClassFile::parse(bytes)?;
    let mut methods = Vec::with_capacity(class.methods.len());
    for method in &class.methods {
        let name = class.member_name(method)?;
        methods.push(MethodSummary {
            kind: classify(&name),
            descriptor: class.member_descriptor(method)?,
            access_flags: method.access_flags,
            has_code: method.has_code(&class.constant_pool),
            name,
        });
    }

    Ok(UnitSummary {
        class_name: class.this_class_name()?,
        super_class: class.super_class_name()?,
        source_file: class.source_file()?,
        major_version: class.major_version,
        instrumented: methods.iter().any(|m| m.name.starts_with(&config.hidden_prefix)),
        methods,
    })
}

pub fn inspect(path: &Path, config: &InstrumentConfig) -> Result<UnitSummary> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    inspect_bytes(&bytes, config).with_context(|| format!("Failed to inspect {}", path.display()))
}
