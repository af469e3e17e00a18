// Class-load hook
//
// Entry point the host calls for every class it is about to define.
// `Ok(None)` means "define the original bytes".

use crate::config::InstrumentConfig;
use crate::error::InstrumentResult;
use crate::transformer::{Outcome, Transformed, UnitTransformer};
use crate::types::CompiledUnit;
use std::cell::Cell;
use tracing::{debug, error};

thread_local! {
    // Set while this thread is inside on_load; loads triggered by the
    // transformation itself are passed through
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

struct HookGuard;

impl HookGuard {
    fn enter() -> Option<Self> {
        IN_HOOK.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(HookGuard)
            }
        })
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        IN_HOOK.with(|flag| flag.set(false));
    }
}

#[derive(Debug, Clone)]
pub struct LoadHook {
    transformer: UnitTransformer,
}

impl LoadHook {
    pub fn new(config: InstrumentConfig) -> InstrumentResult<Self> {
        config.validate()?;
        Ok(Self {
            transformer: UnitTransformer::new(config),
        })
    }

    pub fn transformer(&self) -> &UnitTransformer {
        &self.transformer
    }

    /// Transformed bytes for `qualified_name`, or `None` to keep the
    /// original. Errors are logged here and returned so the host can decide
    /// whether a failed unit aborts its load.
    pub fn on_load(&self, qualified_name: &str, raw: &[u8]) -> InstrumentResult<Option<Vec<u8>>> {
        Ok(self
            .transform(qualified_name, raw)?
            .filter(Transformed::is_rewritten)
            .map(|transformed| transformed.unit.bytes))
    }

    /// Like `on_load`, keeping the outcome. `None` when the unit is exempt or
    /// the call is nested inside another hook call on this thread.
    pub fn transform(&self, qualified_name: &str, raw: &[u8]) -> InstrumentResult<Option<Transformed>> {
        let Some(_guard) = HookGuard::enter() else {
            return Ok(None);
        };

        let internal_name = qualified_name.replace('.', "/");
        if self.transformer.config().filter.is_exempt(&internal_name) {
            return Ok(None);
        }

        match self.transformer.transform(CompiledUnit::new(&internal_name, raw.to_vec())) {
            Ok(transformed) => {
                if let Outcome::Unchanged(reason) = &transformed.outcome {
                    debug!("Loaded {} unchanged ({:?})", internal_name, reason);
                }
                Ok(Some(transformed))
            }
            Err(e) => {
                error!("Failed to instrument {}: {}", internal_name, e);
                Err(e)
            }
        }
    }

    /// Runs `f` as if called from inside the hook on this thread
    #[cfg(test)]
    fn nested<T>(f: impl FnOnce() -> T) -> T {
        let _guard = HookGuard::enter();
        f()
    }
}
