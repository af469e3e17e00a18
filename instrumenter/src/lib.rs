// Class-file instrumentation for CFML step debugging
//
// Rewrites compiled CFML units so a frame tracker sees every function entry,
// exit and source line:
// - Class file and constant pool codec
// - Bytecode relocation (branches, switches, exception ranges, stack maps)
// - Entry-point matching by method name
// - Wrapper synthesis and per-line step calls
// - Load hook with re-entrancy protection

pub mod classfile;
pub mod code;
pub mod config;
pub mod constpool;
pub mod descriptor;
pub mod error;
pub mod frames;
pub mod hook;
pub mod matcher;
pub mod opcodes;
pub mod reader;
pub mod rewriter;
pub mod stackmap;
pub mod tracker;
pub mod transformer;
pub mod types;

pub use config::{InstrumentConfig, UnitFilter};
pub use error::{InstrumentError, InstrumentResult};
pub use hook::LoadHook;
pub use matcher::classify;
pub use tracker::{FrameTracker, RecordingTracker, ThreadFrameTracker, TrackerAbi};
pub use transformer::{Outcome, Transformed, Unchanged, UnitReport, UnitTransformer};
pub use types::{CompiledUnit, FrameContext, FrameKind, MethodDescriptor, StepEvent, TrackerEvent};
