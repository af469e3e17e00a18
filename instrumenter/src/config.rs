// Instrumentation configuration
//
// Everything the engine needs to know about the host that is not part of the
// class files themselves. Defaults match the CFML runtime and the helper
// classes shipped with the agent jar.

use crate::error::{InstrumentError, InstrumentResult};
use crate::tracker::TrackerAbi;
use crate::types::UNKNOWN_SOURCE;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Name prefix of the renamed original method
pub const DEFAULT_HIDDEN_PREFIX: &str = "__luceedebug__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Prefix given to the original body of every wrapped method
    pub hidden_prefix: String,
    /// Source path pushed for units without a SourceFile attribute
    pub unknown_source: String,
    pub tracker: TrackerAbi,
    pub filter: UnitFilter,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            hidden_prefix: DEFAULT_HIDDEN_PREFIX.to_string(),
            unknown_source: UNKNOWN_SOURCE.to_string(),
            tracker: TrackerAbi::default(),
            filter: UnitFilter::default(),
        }
    }
}

impl InstrumentConfig {
    pub fn from_json_str(json: &str) -> InstrumentResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> InstrumentResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> InstrumentResult<()> {
        if self.hidden_prefix.is_empty() {
            return Err(InstrumentError::Config(
                "hidden_prefix must not be empty".to_string(),
            ));
        }
        if crate::matcher::classify(&self.hidden_prefix).is_some() {
            return Err(InstrumentError::Config(format!(
                "hidden_prefix '{}' would itself match an entry point",
                self.hidden_prefix
            )));
        }
        self.tracker.validate()
    }
}

/// Decides which units the load hook hands to the transformer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitFilter {
    /// Internal-name prefixes never instrumented (runtime, JDK, the agent's
    /// own helper classes)
    pub exempt_prefixes: Vec<String>,
    /// When non-empty, only units whose direct super class is listed are
    /// instrumented
    pub required_supers: Vec<String>,
}

impl Default for UnitFilter {
    fn default() -> Self {
        Self {
            exempt_prefixes: [
                "java/", "javax/", "jdk/", "sun/", "com/sun/", "lucee/", "luceedebug/",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            required_supers: [
                "lucee/runtime/PageImpl",
                "lucee/runtime/ComponentPageImpl",
                "lucee/runtime/InterfacePageImpl",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
        }
    }
}

impl UnitFilter {
    /// Filter that admits every unit
    pub fn permissive() -> Self {
        Self {
            exempt_prefixes: Vec::new(),
            required_supers: Vec::new(),
        }
    }

    pub fn is_exempt(&self, internal_name: &str) -> bool {
        self.exempt_prefixes
            .iter()
            .any(|prefix| internal_name.starts_with(prefix.as_str()))
    }

    pub fn admits_super(&self, super_name: Option<&str>) -> bool {
        if self.required_supers.is_empty() {
            return true;
        }
        match super_name {
            Some(name) => self.required_supers.iter().any(|s| s == name),
            None => false,
        }
    }
}
