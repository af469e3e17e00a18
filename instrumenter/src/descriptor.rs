// Method descriptor parsing
//
// Enough of the descriptor grammar to know how many local slots each
// parameter takes and which load/return opcode moves it.

use crate::error::{InstrumentError, InstrumentResult};
use crate::opcodes::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
    /// Internal class name, e.g. `lucee/runtime/PageContext`
    Object(String),
    /// Full array descriptor, e.g. `[Ljava/lang/Object;`
    Array(String),
}

impl FieldType {
    /// Local-variable and operand-stack slots taken by a value of this type
    pub fn slots(&self) -> u16 {
        match self {
            FieldType::Long | FieldType::Double => 2,
            _ => 1,
        }
    }

    /// Parse a complete field descriptor such as `I` or `[Ljava/lang/String;`
    pub fn parse(descriptor: &str) -> InstrumentResult<Self> {
        match parse_field_type(descriptor) {
            Some((ty, "")) => Ok(ty),
            _ => Err(InstrumentError::BadDescriptor(descriptor.to_string())),
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, FieldType::Object(_) | FieldType::Array(_))
    }

    /// Base opcode of the `xload` family; the `_0` short form is at a fixed
    /// distance from it
    fn load_opcodes(&self) -> (u8, u8) {
        match self {
            FieldType::Long => (LLOAD, LLOAD_0),
            FieldType::Float => (FLOAD, FLOAD_0),
            FieldType::Double => (DLOAD, DLOAD_0),
            FieldType::Object(_) | FieldType::Array(_) => (ALOAD, ALOAD_0),
            _ => (ILOAD, ILOAD_0),
        }
    }

    /// Bytes of the shortest instruction loading local `slot`
    pub fn load(&self, slot: u16) -> Vec<u8> {
        let (op, op_0) = self.load_opcodes();
        match slot {
            0..=3 => vec![op_0 + slot as u8],
            4..=255 => vec![op, slot as u8],
            _ => {
                let [hi, lo] = slot.to_be_bytes();
                vec![WIDE, op, hi, lo]
            }
        }
    }

    pub fn descriptor(&self) -> String {
        match self {
            FieldType::Byte => "B".to_string(),
            FieldType::Char => "C".to_string(),
            FieldType::Double => "D".to_string(),
            FieldType::Float => "F".to_string(),
            FieldType::Int => "I".to_string(),
            FieldType::Long => "J".to_string(),
            FieldType::Short => "S".to_string(),
            FieldType::Boolean => "Z".to_string(),
            FieldType::Object(name) => format!("L{};", name),
            FieldType::Array(descriptor) => descriptor.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnType {
    Void,
    Value(FieldType),
}

impl ReturnType {
    pub fn slots(&self) -> u16 {
        match self {
            ReturnType::Void => 0,
            ReturnType::Value(ty) => ty.slots(),
        }
    }

    pub fn return_opcode(&self) -> u8 {
        match self {
            ReturnType::Void => RETURN,
            ReturnType::Value(FieldType::Long) => LRETURN,
            ReturnType::Value(FieldType::Float) => FRETURN,
            ReturnType::Value(FieldType::Double) => DRETURN,
            ReturnType::Value(FieldType::Object(_) | FieldType::Array(_)) => ARETURN,
            ReturnType::Value(_) => IRETURN,
        }
    }
}

/// Parsed `(params)ret` descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSig {
    pub params: Vec<FieldType>,
    pub ret: ReturnType,
}

impl MethodSig {
    pub fn parse(descriptor: &str) -> InstrumentResult<Self> {
        let bad = || InstrumentError::BadDescriptor(descriptor.to_string());

        let rest = descriptor.strip_prefix('(').ok_or_else(bad)?;
        let close = rest.find(')').ok_or_else(bad)?;
        let (mut params_src, ret_src) = (&rest[..close], &rest[close + 1..]);

        let mut params = Vec::new();
        while !params_src.is_empty() {
            let (ty, tail) = parse_field_type(params_src).ok_or_else(bad)?;
            params.push(ty);
            params_src = tail;
        }

        let ret = if ret_src == "V" {
            ReturnType::Void
        } else {
            match parse_field_type(ret_src) {
                Some((ty, "")) => ReturnType::Value(ty),
                _ => return Err(bad()),
            }
        };

        Ok(Self { params, ret })
    }

    /// Slots taken by the parameters, receiver excluded
    pub fn param_slots(&self) -> u16 {
        self.params.iter().map(FieldType::slots).sum()
    }
}

fn parse_field_type(src: &str) -> Option<(FieldType, &str)> {
    let first = src.chars().next()?;
    let rest = &src[first.len_utf8()..];
    let ty = match first {
        'B' => FieldType::Byte,
        'C' => FieldType::Char,
        'D' => FieldType::Double,
        'F' => FieldType::Float,
        'I' => FieldType::Int,
        'J' => FieldType::Long,
        'S' => FieldType::Short,
        'Z' => FieldType::Boolean,
        'L' => {
            let end = rest.find(';')?;
            if end == 0 {
                return None;
            }
            return Some((FieldType::Object(rest[..end].to_string()), &rest[end + 1..]));
        }
        '[' => {
            let (_, tail) = parse_field_type(rest)?;
            let consumed = src.len() - tail.len();
            return Some((FieldType::Array(src[..consumed].to_string()), tail));
        }
        _ => return None,
    };
    Some((ty, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_page_call() {
        let sig = MethodSig::parse("(Llucee/runtime/PageContext;)Ljava/lang/Object;").unwrap();
        assert_eq!(
            sig.params,
            vec![FieldType::Object("lucee/runtime/PageContext".to_string())]
        );
        assert_eq!(sig.ret.return_opcode(), ARETURN);
        assert_eq!(sig.param_slots(), 1);
    }

    #[test]
    fn test_parse_wide_and_array_params() {
        let sig = MethodSig::parse("(JI[[Ljava/lang/String;D)V").unwrap();
        assert_eq!(sig.params.len(), 4);
        assert_eq!(sig.params[2], FieldType::Array("[[Ljava/lang/String;".to_string()));
        assert_eq!(sig.param_slots(), 2 + 1 + 1 + 2);
        assert_eq!(sig.ret, ReturnType::Void);
    }

    #[test]
    fn test_parse_field_descriptors() {
        assert_eq!(FieldType::parse("J").unwrap(), FieldType::Long);
        assert_eq!(
            FieldType::parse("[I").unwrap(),
            FieldType::Array("[I".to_string())
        );
        assert!(FieldType::parse("II").is_err());
        assert!(FieldType::parse("").is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        for bad in ["", "()", "(L;)V", "(Q)V", "()VV", "I)V"] {
            assert!(MethodSig::parse(bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_load_forms() {
        assert_eq!(FieldType::Int.load(2), vec![ILOAD_0 + 2]);
        assert_eq!(FieldType::Double.load(7), vec![DLOAD, 7]);
        assert_eq!(
            FieldType::Object("x/Y".to_string()).load(300),
            vec![WIDE, ALOAD, 0x01, 0x2c]
        );
    }
}
