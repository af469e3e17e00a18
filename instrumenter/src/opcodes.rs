// JVM opcodes used by the rewriter and the instruction decoder
//
// Reference: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-6.html

pub const NOP: u8 = 0x00;
pub const ACONST_NULL: u8 = 0x01;
pub const ICONST_M1: u8 = 0x02;
pub const ICONST_0: u8 = 0x03;
pub const ICONST_5: u8 = 0x08;
pub const BIPUSH: u8 = 0x10;
pub const SIPUSH: u8 = 0x11;
pub const LDC: u8 = 0x12;
pub const LDC_W: u8 = 0x13;
pub const LDC2_W: u8 = 0x14;

pub const ILOAD: u8 = 0x15;
pub const LLOAD: u8 = 0x16;
pub const FLOAD: u8 = 0x17;
pub const DLOAD: u8 = 0x18;
pub const ALOAD: u8 = 0x19;
pub const ILOAD_0: u8 = 0x1a;
pub const LLOAD_0: u8 = 0x1e;
pub const FLOAD_0: u8 = 0x22;
pub const DLOAD_0: u8 = 0x26;
pub const ALOAD_0: u8 = 0x2a;

pub const ISTORE: u8 = 0x36;
pub const ASTORE: u8 = 0x3a;
pub const ISTORE_0: u8 = 0x3b;
pub const ASTORE_0: u8 = 0x4b;

pub const POP: u8 = 0x57;
pub const DUP: u8 = 0x59;
pub const IADD: u8 = 0x60;
pub const ISUB: u8 = 0x64;
pub const IMUL: u8 = 0x68;
pub const IINC: u8 = 0x84;

pub const IFEQ: u8 = 0x99;
pub const IFNE: u8 = 0x9a;
pub const IF_ICMPEQ: u8 = 0x9f;
pub const IF_ICMPLT: u8 = 0xa1;
pub const IF_ICMPGE: u8 = 0xa2;
pub const IF_ACMPEQ: u8 = 0xa5;
pub const IF_ACMPNE: u8 = 0xa6;
pub const GOTO: u8 = 0xa7;
pub const JSR: u8 = 0xa8;
pub const RET: u8 = 0xa9;
pub const TABLESWITCH: u8 = 0xaa;
pub const LOOKUPSWITCH: u8 = 0xab;

pub const IRETURN: u8 = 0xac;
pub const LRETURN: u8 = 0xad;
pub const FRETURN: u8 = 0xae;
pub const DRETURN: u8 = 0xaf;
pub const ARETURN: u8 = 0xb0;
pub const RETURN: u8 = 0xb1;

pub const GETSTATIC: u8 = 0xb2;
pub const PUTSTATIC: u8 = 0xb3;
pub const GETFIELD: u8 = 0xb4;
pub const PUTFIELD: u8 = 0xb5;
pub const INVOKEVIRTUAL: u8 = 0xb6;
pub const INVOKESPECIAL: u8 = 0xb7;
pub const INVOKESTATIC: u8 = 0xb8;
pub const INVOKEINTERFACE: u8 = 0xb9;
pub const INVOKEDYNAMIC: u8 = 0xba;
pub const NEW: u8 = 0xbb;
pub const NEWARRAY: u8 = 0xbc;
pub const ANEWARRAY: u8 = 0xbd;
pub const ATHROW: u8 = 0xbf;
pub const CHECKCAST: u8 = 0xc0;
pub const INSTANCEOF: u8 = 0xc1;
pub const WIDE: u8 = 0xc4;
pub const MULTIANEWARRAY: u8 = 0xc5;
pub const IFNULL: u8 = 0xc6;
pub const IFNONNULL: u8 = 0xc7;
pub const GOTO_W: u8 = 0xc8;
pub const JSR_W: u8 = 0xc9;

/// Opcodes with a signed 16-bit branch offset
pub fn is_short_branch(opcode: u8) -> bool {
    matches!(opcode, IFEQ..=JSR | IFNULL | IFNONNULL)
}

/// Two-way branches; everything else with a 16-bit offset is goto or jsr
pub fn is_conditional_branch(opcode: u8) -> bool {
    matches!(opcode, IFEQ..=IF_ACMPNE | IFNULL | IFNONNULL)
}

/// The conditional branch taken exactly when `opcode` is not
pub fn inverted_branch(opcode: u8) -> Option<u8> {
    match opcode {
        IFNULL => Some(IFNONNULL),
        IFNONNULL => Some(IFNULL),
        // ifeq/ifne, iflt/ifge, ... come in adjacent pairs starting at ifeq
        IFEQ..=IF_ACMPNE if (opcode - IFEQ) % 2 == 0 => Some(opcode + 1),
        IFEQ..=IF_ACMPNE => Some(opcode - 1),
        _ => None,
    }
}

/// Total length of a fixed-size instruction, or None for the variable-length
/// ones (tableswitch, lookupswitch, wide) and undefined opcodes
pub fn fixed_length(opcode: u8) -> Option<usize> {
    let len = match opcode {
        NOP..=ICONST_5 | 0x09..=0x0f => 1,
        BIPUSH | LDC => 2,
        SIPUSH | LDC_W | LDC2_W => 3,
        ILOAD..=ALOAD => 2,
        ILOAD_0..=0x35 => 1,
        ISTORE..=ASTORE => 2,
        ISTORE_0..=0x83 => 1,
        IINC => 3,
        0x85..=0x98 => 1,
        IFEQ..=JSR => 3,
        RET => 2,
        IRETURN..=RETURN => 1,
        GETSTATIC..=INVOKESTATIC => 3,
        INVOKEINTERFACE | INVOKEDYNAMIC => 5,
        NEW => 3,
        NEWARRAY => 2,
        ANEWARRAY => 3,
        0xbe | ATHROW => 1,
        CHECKCAST | INSTANCEOF => 3,
        0xc2 | 0xc3 => 1,
        MULTIANEWARRAY => 4,
        IFNULL | IFNONNULL => 3,
        GOTO_W | JSR_W => 5,
        _ => return None,
    };
    Some(len)
}
