// Class file structure
//
// Parses a class file into members and raw attributes, and writes it back.
// Attributes the engine does not rewrite are carried as opaque bytes, so an
// unmodified class encodes to exactly the bytes it was parsed from.

use crate::constpool::ConstantPool;
use crate::error::{InstrumentError, InstrumentResult};
use crate::reader::{read_blob, read_u16, read_u32};
use bytes::BufMut;

pub const MAGIC: u32 = 0xCAFE_BABE;

/// First class-file major version whose verifier requires StackMapTable
pub const STACK_MAP_MAJOR_VERSION: u16 = 50;

// Access flags shared by classes and methods
pub mod access {
    pub const PUBLIC: u16 = 0x0001;
    pub const PRIVATE: u16 = 0x0002;
    pub const PROTECTED: u16 = 0x0004;
    pub const STATIC: u16 = 0x0008;
    pub const FINAL: u16 = 0x0010;
    pub const SYNCHRONIZED: u16 = 0x0020;
    pub const NATIVE: u16 = 0x0100;
    pub const INTERFACE: u16 = 0x0200;
    pub const ABSTRACT: u16 = 0x0400;
    pub const SYNTHETIC: u16 = 0x1000;
}

// Attribute names the engine understands
pub mod attr {
    pub const CODE: &str = "Code";
    pub const SOURCE_FILE: &str = "SourceFile";
    pub const EXCEPTIONS: &str = "Exceptions";
    pub const SIGNATURE: &str = "Signature";
    pub const LINE_NUMBER_TABLE: &str = "LineNumberTable";
    pub const LOCAL_VARIABLE_TABLE: &str = "LocalVariableTable";
    pub const LOCAL_VARIABLE_TYPE_TABLE: &str = "LocalVariableTypeTable";
    pub const STACK_MAP_TABLE: &str = "StackMapTable";
    pub const RUNTIME_VISIBLE_TYPE_ANNOTATIONS: &str = "RuntimeVisibleTypeAnnotations";
    pub const RUNTIME_INVISIBLE_TYPE_ANNOTATIONS: &str = "RuntimeInvisibleTypeAnnotations";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name_index: u16,
    pub info: Vec<u8>,
}

impl Attribute {
    pub fn parse(buf: &mut &[u8]) -> InstrumentResult<Self> {
        let name_index = read_u16(buf)?;
        let info = read_blob(buf)?;
        Ok(Self { name_index, info })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.put_u16(self.name_index);
        out.put_u32(self.info.len() as u32);
        out.put_slice(&self.info);
    }
}

pub(crate) fn parse_attributes(buf: &mut &[u8]) -> InstrumentResult<Vec<Attribute>> {
    let count = read_u16(buf)?;
    (0..count).map(|_| Attribute::parse(buf)).collect()
}

pub(crate) fn encode_attributes(attributes: &[Attribute], out: &mut Vec<u8>) -> InstrumentResult<()> {
    out.put_u16(checked_count(attributes.len(), "attributes")?);
    for attribute in attributes {
        attribute.encode(out);
    }
    Ok(())
}

pub(crate) fn checked_count(len: usize, what: &str) -> InstrumentResult<u16> {
    u16::try_from(len)
        .map_err(|_| InstrumentError::Malformed(format!("too many {} ({})", what, len)))
}

/// A field_info or method_info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

impl MemberInfo {
    fn parse(buf: &mut &[u8]) -> InstrumentResult<Self> {
        Ok(Self {
            access_flags: read_u16(buf)?,
            name_index: read_u16(buf)?,
            descriptor_index: read_u16(buf)?,
            attributes: parse_attributes(buf)?,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) -> InstrumentResult<()> {
        out.put_u16(self.access_flags);
        out.put_u16(self.name_index);
        out.put_u16(self.descriptor_index);
        encode_attributes(&self.attributes, out)
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & access::STATIC != 0
    }

    pub fn is_private(&self) -> bool {
        self.access_flags & access::PRIVATE != 0
    }

    /// First attribute with the given name
    pub fn attribute<'a>(&'a self, pool: &ConstantPool, name: &str) -> Option<&'a Attribute> {
        self.attributes
            .iter()
            .find(|a| pool.utf8_eq(a.name_index, name))
    }

    pub fn has_code(&self, pool: &ConstantPool) -> bool {
        self.attribute(pool, attr::CODE).is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<MemberInfo>,
    pub methods: Vec<MemberInfo>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> InstrumentResult<Self> {
        let mut buf = bytes;

        let magic = read_u32(&mut buf)?;
        if magic != MAGIC {
            return Err(InstrumentError::BadMagic(magic));
        }

        let minor_version = read_u16(&mut buf)?;
        let major_version = read_u16(&mut buf)?;
        let constant_pool = ConstantPool::parse(&mut buf)?;
        let access_flags = read_u16(&mut buf)?;
        let this_class = read_u16(&mut buf)?;
        let super_class = read_u16(&mut buf)?;

        let interface_count = read_u16(&mut buf)?;
        let interfaces = (0..interface_count)
            .map(|_| read_u16(&mut buf))
            .collect::<InstrumentResult<Vec<_>>>()?;

        let field_count = read_u16(&mut buf)?;
        let fields = (0..field_count)
            .map(|_| MemberInfo::parse(&mut buf))
            .collect::<InstrumentResult<Vec<_>>>()?;

        let method_count = read_u16(&mut buf)?;
        let methods = (0..method_count)
            .map(|_| MemberInfo::parse(&mut buf))
            .collect::<InstrumentResult<Vec<_>>>()?;

        let attributes = parse_attributes(&mut buf)?;

        if !buf.is_empty() {
            return Err(InstrumentError::Malformed(format!(
                "{} trailing bytes after class file",
                buf.len()
            )));
        }

        let class = Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        };

        // Fail early on a broken self reference; everything downstream needs it
        class.this_class_name()?;
        Ok(class)
    }

    pub fn encode(&self) -> InstrumentResult<Vec<u8>> {
        let mut out = Vec::with_capacity(4096);

        out.put_u32(MAGIC);
        out.put_u16(self.minor_version);
        out.put_u16(self.major_version);
        self.constant_pool.encode(&mut out);
        out.put_u16(self.access_flags);
        out.put_u16(self.this_class);
        out.put_u16(self.super_class);

        out.put_u16(checked_count(self.interfaces.len(), "interfaces")?);
        for interface in &self.interfaces {
            out.put_u16(*interface);
        }

        out.put_u16(checked_count(self.fields.len(), "fields")?);
        for field in &self.fields {
            field.encode(&mut out)?;
        }

        out.put_u16(checked_count(self.methods.len(), "methods")?);
        for method in &self.methods {
            method.encode(&mut out)?;
        }

        encode_attributes(&self.attributes, &mut out)?;
        Ok(out)
    }

    pub fn this_class_name(&self) -> InstrumentResult<String> {
        self.constant_pool.class_name(self.this_class)
    }

    /// None only for java/lang/Object
    pub fn super_class_name(&self) -> InstrumentResult<Option<String>> {
        if self.super_class == 0 {
            return Ok(None);
        }
        self.constant_pool.class_name(self.super_class).map(Some)
    }

    pub fn interface_names(&self) -> InstrumentResult<Vec<String>> {
        self.interfaces
            .iter()
            .map(|i| self.constant_pool.class_name(*i))
            .collect()
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & access::INTERFACE != 0
    }

    /// Utf8 index named by the SourceFile attribute, if present
    pub fn source_file_index(&self) -> InstrumentResult<Option<u16>> {
        let Some(attribute) = self
            .attributes
            .iter()
            .find(|a| self.constant_pool.utf8_eq(a.name_index, attr::SOURCE_FILE))
        else {
            return Ok(None);
        };

        let mut info = attribute.info.as_slice();
        let index = read_u16(&mut info)?;
        self.constant_pool.utf8_bytes(index)?;
        Ok(Some(index))
    }

    pub fn source_file(&self) -> InstrumentResult<Option<String>> {
        match self.source_file_index()? {
            Some(index) => self.constant_pool.utf8(index).map(Some),
            None => Ok(None),
        }
    }

    pub fn member_name(&self, member: &MemberInfo) -> InstrumentResult<String> {
        self.constant_pool.utf8(member.name_index)
    }

    pub fn member_descriptor(&self, member: &MemberInfo) -> InstrumentResult<String> {
        self.constant_pool.utf8(member.descriptor_index)
    }
}
