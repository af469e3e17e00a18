// Instrumentation type definitions
//
// Common types shared by the matcher, rewriter, transformer and tracker

use serde::{Deserialize, Serialize};

/// Placeholder source path for units compiled without a SourceFile attribute
pub const UNKNOWN_SOURCE: &str = "??????";

/// One class file as handed over by the host loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledUnit {
    /// Internal (slash-separated) class name
    pub name: String,
    pub bytes: Vec<u8>,
    /// Filled in from the SourceFile attribute during transformation
    pub source_path: Option<String>,
}

impl CompiledUnit {
    /// Accepts either `a.b.C` or `a/b/C`
    pub fn new(qualified_name: &str, bytes: Vec<u8>) -> Self {
        Self {
            name: qualified_name.replace('.', "/"),
            bytes,
            source_path: None,
        }
    }
}

/// A method as seen by the matcher and rewriter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    /// JVM descriptor, e.g. `(Llucee/runtime/PageContext;)Ljava/lang/Object;`
    pub descriptor: String,
    pub access_flags: u16,
    /// Internal name of the declaring class
    pub declaring_unit: String,
}

/// Which push operation a wrapper emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    StandardCall,
    /// Default-argument initialisers; merged with their owning function
    /// frame, so no step notification after they return
    DefaultValueInit,
}

impl FrameKind {
    pub fn steps_after_call(self) -> bool {
        self == FrameKind::StandardCall
    }
}

/// Passed to the tracker when a frame is pushed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameContext {
    pub source_path: String,
}

/// Line reached inside the current top frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEvent {
    pub line: u32,
}

/// Events observed by a tracker, in emission order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TrackerEvent {
    Push { kind: FrameKind, source_path: String },
    Line { line: u32 },
    Pop,
    StepAfterCall,
}

impl TrackerEvent {
    /// Short form for logs and test assertions
    pub fn format(&self) -> String {
        match self {
            TrackerEvent::Push { kind: FrameKind::StandardCall, .. } => "push".to_string(),
            TrackerEvent::Push { kind: FrameKind::DefaultValueInit, .. } => {
                "push(DefaultValueInit)".to_string()
            }
            TrackerEvent::Line { line } => format!("onLine({})", line),
            TrackerEvent::Pop => "pop".to_string(),
            TrackerEvent::StepAfterCall => "onStepAfterCall".to_string(),
        }
    }
}
