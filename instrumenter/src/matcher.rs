// Entry-point matching
//
// CFML compilers emit fixed method names for the places a debugger cares
// about: the page body, function bodies, component setup and so on. Matching
// is purely by name.

use crate::types::FrameKind;

/// How a marker is compared against a method name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Exact(&'static str),
    Prefix(&'static str),
}

impl Marker {
    fn matches(self, name: &str) -> bool {
        match self {
            Marker::Exact(marker) => name == marker,
            Marker::Prefix(marker) => name.starts_with(marker),
        }
    }
}

const DEFAULT_VALUE_PREFIX: &str = "udfDefaultValue";

const STANDARD_MARKERS: &[Marker] = &[
    // page body
    Marker::Exact("call"),
    // numbered page body chunks: call_001, call_002, ...
    Marker::Prefix("call_"),
    // function bodies; `udfCall` itself may be trivial while udfCall1.. are not
    Marker::Prefix("udfCall"),
    Marker::Exact("initComponent"),
    Marker::Exact("newInstance"),
    Marker::Exact("threadCall"),
    Marker::Exact("staticConstructor"),
];

/// Classify a method by name. Total and stateless.
pub fn classify(method_name: &str) -> Option<FrameKind> {
    if method_name.starts_with(DEFAULT_VALUE_PREFIX) {
        return Some(FrameKind::DefaultValueInit);
    }

    STANDARD_MARKERS
        .iter()
        .any(|marker| marker.matches(method_name))
        .then_some(FrameKind::StandardCall)
}
