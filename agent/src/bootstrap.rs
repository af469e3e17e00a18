// Agent bootstrap
//
// Validates the bootstrap arguments against the file system, plans helper
// injection and builds the load hook the host will call.

use crate::args::AgentArgs;
use crate::injection::{injection_order, read_helpers, HelperUnit};
use cfdebug_instrumenter::{InstrumentConfig, InstrumentError, LoadHook};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Couldn't find agent jar '{0}' (maybe it was a relative path, rather than absolute?)")]
    JarNotFound(PathBuf),

    #[error("Failed to open {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read agent jar {path}: {source}")]
    Jar {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("Failed to read jar entry {entry}: {source}")]
    Entry {
        entry: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Helper {name} is not a valid class file: {source}")]
    BadHelper {
        name: String,
        #[source]
        source: InstrumentError,
    },

    #[error("Helper classes depend on each other in a cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error(transparent)]
    Instrument(#[from] InstrumentError),
}

pub struct Bootstrap {
    pub args: AgentArgs,
    /// In injection order
    pub helpers: Vec<HelperUnit>,
    pub hook: LoadHook,
}

/// What `check` prints
#[derive(Debug, Serialize)]
pub struct BootstrapSummary<'a> {
    pub args: &'a AgentArgs,
    pub helpers: &'a [HelperUnit],
    pub config: &'a InstrumentConfig,
}

impl Bootstrap {
    pub fn prepare(
        args: AgentArgs,
        config: InstrumentConfig,
        helper_prefix: &str,
    ) -> Result<Self, SetupError> {
        if !args.jar_path.is_file() {
            return Err(SetupError::JarNotFound(args.jar_path.clone()));
        }

        let helpers = injection_order(read_helpers(&args.jar_path, helper_prefix)?)?;
        let hook = LoadHook::new(config)?;

        info!(
            "Agent ready: jdwp {}:{}, debug adapter {}:{}, {} helper classes",
            args.jdwp_host,
            args.jdwp_port,
            args.debug_host,
            args.debug_port,
            helpers.len()
        );

        Ok(Self { args, helpers, hook })
    }

    pub fn summary(&self) -> BootstrapSummary<'_> {
        BootstrapSummary {
            args: &self.args,
            helpers: &self.helpers,
            config: self.hook.transformer().config(),
        }
    }
}
