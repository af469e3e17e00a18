// Frame tracker interface
//
// Rewritten code talks to the tracker through one static field of a helper
// class injected ahead of time (`TrackerAbi` names it). On the Rust side the
// same five operations are the `FrameTracker` trait, with a thread-local
// implementation that enforces the LIFO discipline and a recorder used to
// check emitted event sequences.

use crate::error::{InstrumentError, InstrumentResult};
use crate::types::{FrameContext, FrameKind, StepEvent, TrackerEvent};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::warn;

/// JVM-visible coordinates of the tracker and its operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerAbi {
    /// Helper class holding the tracker in a static field
    pub holder_class: String,
    pub holder_field: String,
    /// Interface type of the holder field
    pub tracker_interface: String,
    /// Type of the first parameter of every entry point, forwarded on push.
    /// `None` accepts any reference and declares the push parameter as Object.
    pub context_class: Option<String>,
    pub push_frame: String,
    pub push_default_value_init_frame: String,
    pub pop_frame: String,
    pub on_line: String,
    pub on_step_after_call: String,
}

impl Default for TrackerAbi {
    fn default() -> Self {
        Self {
            holder_class: "luceedebug/GlobalIDebugManagerHolder".to_string(),
            holder_field: "debugManager".to_string(),
            tracker_interface: "luceedebug/IDebugManager".to_string(),
            context_class: Some("lucee/runtime/PageContext".to_string()),
            push_frame: "pushCfFrame".to_string(),
            push_default_value_init_frame: "pushCfFunctionDefaultValueInitializationFrame"
                .to_string(),
            pop_frame: "popCfFrame".to_string(),
            on_line: "luceedebug_stepNotificationEntry_step".to_string(),
            on_step_after_call: "luceedebug_stepNotificationEntry_stepAfterCompletedUdfCall"
                .to_string(),
        }
    }
}

impl TrackerAbi {
    /// Field descriptor of the holder field
    pub fn tracker_descriptor(&self) -> String {
        format!("L{};", self.tracker_interface)
    }

    pub fn context_descriptor(&self) -> String {
        format!(
            "L{};",
            self.context_class.as_deref().unwrap_or("java/lang/Object")
        )
    }

    /// `(Context;String)V`, shared by both push operations
    pub fn push_descriptor(&self) -> String {
        format!("({}Ljava/lang/String;)V", self.context_descriptor())
    }

    pub fn push_method(&self, kind: FrameKind) -> &str {
        match kind {
            FrameKind::StandardCall => &self.push_frame,
            FrameKind::DefaultValueInit => &self.push_default_value_init_frame,
        }
    }

    pub fn validate(&self) -> InstrumentResult<()> {
        let classes = [
            ("holder_class", &self.holder_class),
            ("tracker_interface", &self.tracker_interface),
        ];
        let members = [
            ("holder_field", &self.holder_field),
            ("push_frame", &self.push_frame),
            ("push_default_value_init_frame", &self.push_default_value_init_frame),
            ("pop_frame", &self.pop_frame),
            ("on_line", &self.on_line),
            ("on_step_after_call", &self.on_step_after_call),
        ];

        let class_ok = |name: &str| !name.is_empty() && !name.contains(['.', ';', '[']);
        let member_ok = |name: &str| class_ok(name) && !name.contains(['/', '<', '>']);

        for (key, value) in classes {
            if !class_ok(value) {
                return Err(invalid_name(key, value));
            }
        }
        for (key, value) in members {
            if !member_ok(value) {
                return Err(invalid_name(key, value));
            }
        }
        if let Some(context) = &self.context_class {
            if !class_ok(context) {
                return Err(invalid_name("context_class", context));
            }
        }
        Ok(())
    }
}

fn invalid_name(key: &str, value: &str) -> InstrumentError {
    InstrumentError::Config(format!(
        "tracker.{} is not a valid internal JVM name: '{}'",
        key, value
    ))
}

/// The five operations instrumented code performs
pub trait FrameTracker: Send + Sync {
    fn push_frame(&self, context: &FrameContext);
    fn push_default_value_init_frame(&self, context: &FrameContext);
    fn pop_frame(&self);
    fn on_line(&self, line: u32);
    fn on_step_after_call(&self);
}

/// A frame on one thread's stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveFrame {
    pub kind: FrameKind,
    pub source_path: String,
    /// Last line reported inside this frame
    pub line: Option<u32>,
}

/// Invariant violations noticed by [`ThreadFrameTracker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerViolation {
    /// pop with no frame on the current thread
    Underflow,
    /// line step with no frame on the current thread
    StepOutsideFrame,
}

static NEXT_TRACKER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Stacks for every tracker instance, owned by the current thread only
    static STACKS: RefCell<HashMap<u64, Vec<ActiveFrame>>> = RefCell::new(HashMap::new());
}

/// Per-thread frame stacks kept in thread-local storage; no locking on the
/// push/pop/step path.
#[derive(Debug)]
pub struct ThreadFrameTracker {
    id: u64,
    violations: AtomicUsize,
}

impl Default for ThreadFrameTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadFrameTracker {
    pub fn new() -> Self {
        Self {
            id: NEXT_TRACKER_ID.fetch_add(1, Ordering::Relaxed),
            violations: AtomicUsize::new(0),
        }
    }

    fn with_stack<R>(&self, f: impl FnOnce(&mut Vec<ActiveFrame>) -> R) -> R {
        STACKS.with(|stacks| f(stacks.borrow_mut().entry(self.id).or_default()))
    }

    fn push(&self, kind: FrameKind, context: &FrameContext) {
        self.with_stack(|stack| {
            stack.push(ActiveFrame {
                kind,
                source_path: context.source_path.clone(),
                line: None,
            })
        });
    }

    fn violation(&self, violation: TrackerViolation) {
        self.violations.fetch_add(1, Ordering::Relaxed);
        warn!("Frame tracker invariant violated: {:?}", violation);
    }

    /// Stack depth on the calling thread
    pub fn depth(&self) -> usize {
        self.with_stack(|stack| stack.len())
    }

    /// Top frame on the calling thread
    pub fn current_frame(&self) -> Option<ActiveFrame> {
        self.with_stack(|stack| stack.last().cloned())
    }

    /// Snapshot of the calling thread's stack, outermost first
    pub fn frames(&self) -> Vec<ActiveFrame> {
        self.with_stack(|stack| stack.clone())
    }

    /// Violations seen across all threads
    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::Relaxed)
    }
}

impl Drop for ThreadFrameTracker {
    fn drop(&mut self) {
        // Only the dropping thread's entry can be reached from here
        let _ = STACKS.try_with(|stacks| stacks.borrow_mut().remove(&self.id));
    }
}

impl FrameTracker for ThreadFrameTracker {
    fn push_frame(&self, context: &FrameContext) {
        self.push(FrameKind::StandardCall, context);
    }

    fn push_default_value_init_frame(&self, context: &FrameContext) {
        self.push(FrameKind::DefaultValueInit, context);
    }

    fn pop_frame(&self) {
        if self.with_stack(|stack| stack.pop()).is_none() {
            self.violation(TrackerViolation::Underflow);
        }
    }

    fn on_line(&self, line: u32) {
        let stepped = self.with_stack(|stack| match stack.last_mut() {
            Some(top) => {
                top.line = Some(line);
                true
            }
            None => false,
        });
        if !stepped {
            self.violation(TrackerViolation::StepOutsideFrame);
        }
    }

    fn on_step_after_call(&self) {
        // Refers to the caller's frame, which may legitimately be absent when
        // the returning frame was the outermost one
    }
}

/// Tracker that keeps a per-thread stack and also records every event with
/// the thread that produced it
#[derive(Debug, Default)]
pub struct RecordingTracker {
    frames: ThreadFrameTracker,
    events: Mutex<Vec<(std::thread::ThreadId, TrackerEvent)>>,
}

impl RecordingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, event: TrackerEvent) {
        let thread = std::thread::current().id();
        if let Ok(mut events) = self.events.lock() {
            events.push((thread, event));
        }
    }

    /// Events emitted by the calling thread, in order
    pub fn events(&self) -> Vec<TrackerEvent> {
        let thread = std::thread::current().id();
        self.events_for(thread)
    }

    pub fn events_for(&self, thread: std::thread::ThreadId) -> Vec<TrackerEvent> {
        match self.events.lock() {
            Ok(events) => events
                .iter()
                .filter(|(t, _)| *t == thread)
                .map(|(_, e)| e.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Line steps of the calling thread, in order
    pub fn steps(&self) -> Vec<StepEvent> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TrackerEvent::Line { line } => Some(StepEvent { line }),
                _ => None,
            })
            .collect()
    }

    /// Compact rendering of the calling thread's events
    pub fn trace(&self) -> Vec<String> {
        self.events().iter().map(TrackerEvent::format).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    pub fn stack(&self) -> &ThreadFrameTracker {
        &self.frames
    }
}

impl FrameTracker for RecordingTracker {
    fn push_frame(&self, context: &FrameContext) {
        self.frames.push_frame(context);
        self.record(TrackerEvent::Push {
            kind: FrameKind::StandardCall,
            source_path: context.source_path.clone(),
        });
    }

    fn push_default_value_init_frame(&self, context: &FrameContext) {
        self.frames.push_default_value_init_frame(context);
        self.record(TrackerEvent::Push {
            kind: FrameKind::DefaultValueInit,
            source_path: context.source_path.clone(),
        });
    }

    fn pop_frame(&self) {
        self.frames.pop_frame();
        self.record(TrackerEvent::Pop);
    }

    fn on_line(&self, line: u32) {
        self.frames.on_line(line);
        self.record(TrackerEvent::Line { line });
    }

    fn on_step_after_call(&self) {
        self.frames.on_step_after_call();
        self.record(TrackerEvent::StepAfterCall);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ctx(path: &str) -> FrameContext {
        FrameContext {
            source_path: path.to_string(),
        }
    }

    #[test]
    fn test_default_abi_descriptors() {
        let abi = TrackerAbi::default();
        assert_eq!(abi.tracker_descriptor(), "Lluceedebug/IDebugManager;");
        assert_eq!(
            abi.push_descriptor(),
            "(Llucee/runtime/PageContext;Ljava/lang/String;)V"
        );
        assert_eq!(abi.push_method(FrameKind::DefaultValueInit), abi.push_default_value_init_frame);
        abi.validate().unwrap();
    }

    #[test]
    fn test_abi_rejects_dotted_names() {
        let abi = TrackerAbi {
            holder_class: "luceedebug.Holder".to_string(),
            ..TrackerAbi::default()
        };
        assert!(abi.validate().is_err());
    }

    #[test]
    fn test_lifo_and_lines() {
        let tracker = ThreadFrameTracker::new();
        tracker.push_frame(&ctx("/a.cfm"));
        tracker.on_line(3);
        tracker.push_default_value_init_frame(&ctx("/b.cfc"));
        tracker.on_line(9);

        assert_eq!(tracker.depth(), 2);
        assert_eq!(tracker.current_frame().unwrap().line, Some(9));

        tracker.pop_frame();
        let top = tracker.current_frame().unwrap();
        assert_eq!(top.source_path, "/a.cfm");
        assert_eq!(top.line, Some(3));

        tracker.pop_frame();
        assert_eq!(tracker.depth(), 0);
        assert_eq!(tracker.violations(), 0);
    }

    #[test]
    fn test_recorded_steps() {
        let tracker = RecordingTracker::new();
        tracker.push_frame(&ctx("/a.cfm"));
        tracker.on_line(4);
        tracker.on_step_after_call();
        tracker.on_line(5);
        tracker.pop_frame();

        assert_eq!(tracker.steps(), vec![StepEvent { line: 4 }, StepEvent { line: 5 }]);
        assert_eq!(tracker.trace(), vec!["push", "onLine(4)", "onStepAfterCall", "onLine(5)", "pop"]);
    }

    #[test]
    fn test_violations_are_counted_not_fatal() {
        let tracker = ThreadFrameTracker::new();
        tracker.pop_frame();
        tracker.on_line(1);
        tracker.on_step_after_call();
        assert_eq!(tracker.violations(), 2);
    }

    #[test]
    fn test_threads_have_independent_stacks() {
        let tracker = Arc::new(RecordingTracker::new());
        tracker.push_frame(&ctx("/main.cfm"));

        let worker = {
            let tracker = Arc::clone(&tracker);
            std::thread::spawn(move || {
                assert_eq!(tracker.stack().depth(), 0);
                tracker.push_frame(&ctx("/worker.cfm"));
                tracker.on_line(1);
                tracker.pop_frame();
                std::thread::current().id()
            })
        };
        let worker_id = worker.join().unwrap();

        assert_eq!(tracker.stack().depth(), 1);
        assert_eq!(tracker.trace(), vec!["push"]);
        assert_eq!(tracker.events_for(worker_id).len(), 3);
        assert!(tracker.steps().is_empty());
        assert_eq!(tracker.stack().violations(), 0);
    }
}
