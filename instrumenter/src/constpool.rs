// Constant pool model
//
// Entries are kept in their on-disk order so existing indices stay valid.
// New entries are only ever appended, which keeps every reference held by
// untouched attributes (BootstrapMethods, annotations, ...) correct.
//
// Reference: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.4

use crate::error::{InstrumentError, InstrumentResult};
use crate::reader::{read_bytes, read_i32, read_u16, read_u32, read_u64, read_u8};
use bytes::BufMut;

// Constant pool tags
pub mod tags {
    pub const UTF8: u8 = 1;
    pub const INTEGER: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const LONG: u8 = 5;
    pub const DOUBLE: u8 = 6;
    pub const CLASS: u8 = 7;
    pub const STRING: u8 = 8;
    pub const FIELDREF: u8 = 9;
    pub const METHODREF: u8 = 10;
    pub const INTERFACE_METHODREF: u8 = 11;
    pub const NAME_AND_TYPE: u8 = 12;
    pub const METHOD_HANDLE: u8 = 15;
    pub const METHOD_TYPE: u8 = 16;
    pub const DYNAMIC: u8 = 17;
    pub const INVOKE_DYNAMIC: u8 = 18;
    pub const MODULE: u8 = 19;
    pub const PACKAGE: u8 = 20;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    /// Modified UTF-8, exactly as stored
    Utf8(Vec<u8>),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class(u16),
    String(u16),
    Fieldref { class: u16, name_and_type: u16 },
    Methodref { class: u16, name_and_type: u16 },
    InterfaceMethodref { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    MethodHandle { kind: u8, reference: u16 },
    MethodType(u16),
    Dynamic { bootstrap: u16, name_and_type: u16 },
    InvokeDynamic { bootstrap: u16, name_and_type: u16 },
    Module(u16),
    Package(u16),
    /// Slot 0, and the shadow slot after every Long/Double
    Unusable,
}

impl Constant {
    fn is_wide(&self) -> bool {
        matches!(self, Constant::Long(_) | Constant::Double(_))
    }
}

/// A member reference resolved to names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef {
    pub class: String,
    pub name: String,
    pub descriptor: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstantPool {
    entries: Vec<Constant>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    pub fn new() -> Self {
        Self {
            entries: vec![Constant::Unusable],
        }
    }

    /// Parse `constant_pool_count` followed by the entries
    pub fn parse(buf: &mut &[u8]) -> InstrumentResult<Self> {
        let count = read_u16(buf)?;
        if count == 0 {
            return Err(InstrumentError::Malformed(
                "constant_pool_count must be at least 1".to_string(),
            ));
        }

        let mut entries = Vec::with_capacity(count as usize);
        entries.push(Constant::Unusable);

        while entries.len() < count as usize {
            let tag = read_u8(buf)?;
            let constant = match tag {
                tags::UTF8 => {
                    let len = read_u16(buf)? as usize;
                    Constant::Utf8(read_bytes(buf, len)?)
                }
                tags::INTEGER => Constant::Integer(read_i32(buf)?),
                tags::FLOAT => Constant::Float(read_u32(buf)?),
                tags::LONG => Constant::Long(read_u64(buf)? as i64),
                tags::DOUBLE => Constant::Double(read_u64(buf)?),
                tags::CLASS => Constant::Class(read_u16(buf)?),
                tags::STRING => Constant::String(read_u16(buf)?),
                tags::FIELDREF => Constant::Fieldref {
                    class: read_u16(buf)?,
                    name_and_type: read_u16(buf)?,
                },
                tags::METHODREF => Constant::Methodref {
                    class: read_u16(buf)?,
                    name_and_type: read_u16(buf)?,
                },
                tags::INTERFACE_METHODREF => Constant::InterfaceMethodref {
                    class: read_u16(buf)?,
                    name_and_type: read_u16(buf)?,
                },
                tags::NAME_AND_TYPE => Constant::NameAndType {
                    name: read_u16(buf)?,
                    descriptor: read_u16(buf)?,
                },
                tags::METHOD_HANDLE => Constant::MethodHandle {
                    kind: read_u8(buf)?,
                    reference: read_u16(buf)?,
                },
                tags::METHOD_TYPE => Constant::MethodType(read_u16(buf)?),
                tags::DYNAMIC => Constant::Dynamic {
                    bootstrap: read_u16(buf)?,
                    name_and_type: read_u16(buf)?,
                },
                tags::INVOKE_DYNAMIC => Constant::InvokeDynamic {
                    bootstrap: read_u16(buf)?,
                    name_and_type: read_u16(buf)?,
                },
                tags::MODULE => Constant::Module(read_u16(buf)?),
                tags::PACKAGE => Constant::Package(read_u16(buf)?),
                _ => {
                    return Err(InstrumentError::BadConstant {
                        index: entries.len() as u16,
                        reason: format!("unknown tag {}", tag),
                    })
                }
            };

            let wide = constant.is_wide();
            entries.push(constant);
            if wide {
                if entries.len() >= count as usize {
                    return Err(InstrumentError::Malformed(
                        "8-byte constant occupies the last pool slot".to_string(),
                    ));
                }
                entries.push(Constant::Unusable);
            }
        }

        Ok(Self { entries })
    }

    /// Write `constant_pool_count` followed by the entries
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.put_u16(self.entries.len() as u16);

        for constant in &self.entries {
            match constant {
                Constant::Unusable => {}
                Constant::Utf8(bytes) => {
                    out.put_u8(tags::UTF8);
                    out.put_u16(bytes.len() as u16);
                    out.put_slice(bytes);
                }
                Constant::Integer(v) => {
                    out.put_u8(tags::INTEGER);
                    out.put_i32(*v);
                }
                Constant::Float(bits) => {
                    out.put_u8(tags::FLOAT);
                    out.put_u32(*bits);
                }
                Constant::Long(v) => {
                    out.put_u8(tags::LONG);
                    out.put_i64(*v);
                }
                Constant::Double(bits) => {
                    out.put_u8(tags::DOUBLE);
                    out.put_u64(*bits);
                }
                Constant::Class(name) => {
                    out.put_u8(tags::CLASS);
                    out.put_u16(*name);
                }
                Constant::String(utf8) => {
                    out.put_u8(tags::STRING);
                    out.put_u16(*utf8);
                }
                Constant::Fieldref { class, name_and_type } => {
                    out.put_u8(tags::FIELDREF);
                    out.put_u16(*class);
                    out.put_u16(*name_and_type);
                }
                Constant::Methodref { class, name_and_type } => {
                    out.put_u8(tags::METHODREF);
                    out.put_u16(*class);
                    out.put_u16(*name_and_type);
                }
                Constant::InterfaceMethodref { class, name_and_type } => {
                    out.put_u8(tags::INTERFACE_METHODREF);
                    out.put_u16(*class);
                    out.put_u16(*name_and_type);
                }
                Constant::NameAndType { name, descriptor } => {
                    out.put_u8(tags::NAME_AND_TYPE);
                    out.put_u16(*name);
                    out.put_u16(*descriptor);
                }
                Constant::MethodHandle { kind, reference } => {
                    out.put_u8(tags::METHOD_HANDLE);
                    out.put_u8(*kind);
                    out.put_u16(*reference);
                }
                Constant::MethodType(descriptor) => {
                    out.put_u8(tags::METHOD_TYPE);
                    out.put_u16(*descriptor);
                }
                Constant::Dynamic { bootstrap, name_and_type } => {
                    out.put_u8(tags::DYNAMIC);
                    out.put_u16(*bootstrap);
                    out.put_u16(*name_and_type);
                }
                Constant::InvokeDynamic { bootstrap, name_and_type } => {
                    out.put_u8(tags::INVOKE_DYNAMIC);
                    out.put_u16(*bootstrap);
                    out.put_u16(*name_and_type);
                }
                Constant::Module(name) => {
                    out.put_u8(tags::MODULE);
                    out.put_u16(*name);
                }
                Constant::Package(name) => {
                    out.put_u8(tags::PACKAGE);
                    out.put_u16(*name);
                }
            }
        }
    }

    /// Value of `constant_pool_count` (slot 0 included)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn get(&self, index: u16) -> InstrumentResult<&Constant> {
        match self.entries.get(index as usize) {
            Some(Constant::Unusable) | None => Err(InstrumentError::BadConstant {
                index,
                reason: "no usable entry at this index".to_string(),
            }),
            Some(constant) => Ok(constant),
        }
    }

    pub fn utf8_bytes(&self, index: u16) -> InstrumentResult<&[u8]> {
        match self.get(index)? {
            Constant::Utf8(bytes) => Ok(bytes),
            other => Err(unexpected(index, "Utf8", other)),
        }
    }

    /// Decode a Utf8 entry
    pub fn utf8(&self, index: u16) -> InstrumentResult<String> {
        decode_modified_utf8(self.utf8_bytes(index)?).map_err(|reason| {
            InstrumentError::BadConstant { index, reason }
        })
    }

    /// Compare a Utf8 entry against a plain string without decoding it
    pub fn utf8_eq(&self, index: u16, expected: &str) -> bool {
        match self.utf8_bytes(index) {
            Ok(bytes) => bytes == encode_modified_utf8(expected).as_slice(),
            Err(_) => false,
        }
    }

    /// Internal name of a Class entry
    pub fn class_name(&self, index: u16) -> InstrumentResult<String> {
        match self.get(index)? {
            Constant::Class(name) => self.utf8(*name),
            other => Err(unexpected(index, "Class", other)),
        }
    }

    /// (name, descriptor) of a NameAndType entry
    pub fn name_and_type(&self, index: u16) -> InstrumentResult<(String, String)> {
        match self.get(index)? {
            Constant::NameAndType { name, descriptor } => {
                Ok((self.utf8(*name)?, self.utf8(*descriptor)?))
            }
            other => Err(unexpected(index, "NameAndType", other)),
        }
    }

    /// Resolve a Fieldref, Methodref or InterfaceMethodref
    pub fn member_ref(&self, index: u16) -> InstrumentResult<MemberRef> {
        let (class, nat) = match self.get(index)? {
            Constant::Fieldref { class, name_and_type }
            | Constant::Methodref { class, name_and_type }
            | Constant::InterfaceMethodref { class, name_and_type } => (*class, *name_and_type),
            other => return Err(unexpected(index, "member reference", other)),
        };
        let (name, descriptor) = self.name_and_type(nat)?;
        Ok(MemberRef {
            class: self.class_name(class)?,
            name,
            descriptor,
        })
    }

    /// Append an entry, or reuse an identical one already in the pool
    pub fn intern(&mut self, constant: Constant) -> InstrumentResult<u16> {
        if let Some(existing) = self.entries.iter().position(|c| *c == constant) {
            return Ok(existing as u16);
        }

        let slots = if constant.is_wide() { 2 } else { 1 };
        if self.entries.len() + slots > u16::MAX as usize {
            return Err(InstrumentError::ConstantPoolOverflow);
        }

        let index = self.entries.len() as u16;
        let wide = constant.is_wide();
        self.entries.push(constant);
        if wide {
            self.entries.push(Constant::Unusable);
        }
        Ok(index)
    }

    pub fn add_utf8(&mut self, value: &str) -> InstrumentResult<u16> {
        let bytes = encode_modified_utf8(value);
        if bytes.len() > u16::MAX as usize {
            return Err(InstrumentError::Malformed(format!(
                "string constant too long ({} bytes)",
                bytes.len()
            )));
        }
        self.intern(Constant::Utf8(bytes))
    }

    pub fn add_class(&mut self, internal_name: &str) -> InstrumentResult<u16> {
        let name = self.add_utf8(internal_name)?;
        self.intern(Constant::Class(name))
    }

    pub fn add_string(&mut self, value: &str) -> InstrumentResult<u16> {
        let utf8 = self.add_utf8(value)?;
        self.intern(Constant::String(utf8))
    }

    /// String constant backed by an existing Utf8 entry
    pub fn add_string_for_utf8(&mut self, utf8: u16) -> InstrumentResult<u16> {
        self.utf8_bytes(utf8)?;
        self.intern(Constant::String(utf8))
    }

    pub fn add_integer(&mut self, value: i32) -> InstrumentResult<u16> {
        self.intern(Constant::Integer(value))
    }

    pub fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> InstrumentResult<u16> {
        let name = self.add_utf8(name)?;
        let descriptor = self.add_utf8(descriptor)?;
        self.intern(Constant::NameAndType { name, descriptor })
    }

    pub fn add_fieldref(&mut self, class: &str, name: &str, descriptor: &str) -> InstrumentResult<u16> {
        let class = self.add_class(class)?;
        let name_and_type = self.add_name_and_type(name, descriptor)?;
        self.intern(Constant::Fieldref { class, name_and_type })
    }

    pub fn add_methodref(&mut self, class: &str, name: &str, descriptor: &str) -> InstrumentResult<u16> {
        let class = self.add_class(class)?;
        let name_and_type = self.add_name_and_type(name, descriptor)?;
        self.intern(Constant::Methodref { class, name_and_type })
    }

    pub fn add_interface_methodref(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> InstrumentResult<u16> {
        let class = self.add_class(class)?;
        let name_and_type = self.add_name_and_type(name, descriptor)?;
        self.intern(Constant::InterfaceMethodref { class, name_and_type })
    }
}

fn unexpected(index: u16, wanted: &str, found: &Constant) -> InstrumentError {
    InstrumentError::BadConstant {
        index,
        reason: format!("expected {}, found {:?}", wanted, found),
    }
}

/// Decode the JVM's modified UTF-8 (NUL as C0 80, supplementary characters as
/// surrogate pairs)
pub fn decode_modified_utf8(bytes: &[u8]) -> Result<String, String> {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let b0 = bytes[i];
        match b0 {
            0x01..=0x7f => {
                units.push(b0 as u16);
                i += 1;
            }
            0xc0..=0xdf => {
                let b1 = continuation(bytes, i + 1)?;
                units.push((((b0 & 0x1f) as u16) << 6) | b1);
                i += 2;
            }
            0xe0..=0xef => {
                let b1 = continuation(bytes, i + 1)?;
                let b2 = continuation(bytes, i + 2)?;
                units.push((((b0 & 0x0f) as u16) << 12) | (b1 << 6) | b2);
                i += 3;
            }
            _ => return Err(format!("invalid modified UTF-8 byte {:#04x} at {}", b0, i)),
        }
    }

    String::from_utf16(&units).map_err(|e| format!("invalid UTF-16 in constant: {}", e))
}

fn continuation(bytes: &[u8], at: usize) -> Result<u16, String> {
    match bytes.get(at) {
        Some(b) if b & 0xc0 == 0x80 => Ok((b & 0x3f) as u16),
        Some(b) => Err(format!("invalid continuation byte {:#04x} at {}", b, at)),
        None => Err("truncated modified UTF-8 sequence".to_string()),
    }
}

/// Encode a string as modified UTF-8
pub fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007f => out.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                out.push(0xc0 | ((unit >> 6) & 0x1f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                out.push(0xe0 | ((unit >> 12) & 0x0f) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
    out
}
