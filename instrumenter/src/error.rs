// Instrumentation errors
//
// Any failure while reading or rewriting a class file is fatal to that unit's
// load attempt. Nothing here is retried or patched over.

use thiserror::Error;

pub type InstrumentResult<T> = Result<T, InstrumentError>;

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("Truncated class file: {0}")]
    Truncated(String),

    #[error("Bad magic number: {0:#010x}")]
    BadMagic(u32),

    #[error("Malformed class file: {0}")]
    Malformed(String),

    #[error("Invalid constant pool index {index}: {reason}")]
    BadConstant { index: u16, reason: String },

    #[error("Constant pool overflow (more than 65535 slots)")]
    ConstantPoolOverflow,

    #[error("Invalid opcode {opcode:#04x} at offset {offset}")]
    BadOpcode { opcode: u8, offset: u32 },

    #[error("Offset {offset} is not an instruction boundary ({context})")]
    BadOffset { offset: u32, context: &'static str },

    #[error("Branch at offset {at} cannot reach {target} after instrumentation")]
    BranchOverflow { at: u32, target: u32 },

    #[error("Cannot infer stack map frame at offset {offset}: {reason}")]
    FrameInference { offset: u32, reason: String },

    #[error("Method code too large after instrumentation: {0} bytes")]
    CodeTooLarge(usize),

    #[error("Invalid descriptor '{0}'")]
    BadDescriptor(String),

    #[error("Unexpected shape of method {method}: {reason}")]
    UnexpectedShape { method: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl InstrumentError {
    pub(crate) fn shape(method: &str, reason: impl Into<String>) -> Self {
        InstrumentError::UnexpectedShape {
            method: method.to_string(),
            reason: reason.into(),
        }
    }
}
