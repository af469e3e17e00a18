// Unit transformation
//
// parse -> capture metadata -> classify methods -> rewrite -> encode.
// Every call owns its mutable state, so one transformer serves concurrent
// loads of different units.

use crate::classfile::{ClassFile, MemberInfo};
use crate::config::InstrumentConfig;
use crate::constpool::ConstantPool;
use crate::error::InstrumentResult;
use crate::matcher::classify;
use crate::rewriter::{MethodRewriter, UnitMetadata};
use crate::types::{CompiledUnit, FrameKind, MethodDescriptor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One wrapped entry point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentedMethod {
    pub method: MethodDescriptor,
    pub kind: FrameKind,
    pub step_sites: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitReport {
    pub class_name: String,
    pub source_path: String,
    pub instrumented: Vec<InstrumentedMethod>,
}

/// Why a unit came back untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unchanged {
    NoEntryPoints,
    AlreadyInstrumented,
    Interface,
    /// Super class not in the configured page base classes
    NotAPage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Rewritten(UnitReport),
    Unchanged(Unchanged),
}

#[derive(Debug, Clone)]
pub struct Transformed {
    pub unit: CompiledUnit,
    pub outcome: Outcome,
}

impl Transformed {
    pub fn is_rewritten(&self) -> bool {
        matches!(self.outcome, Outcome::Rewritten(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct UnitTransformer {
    config: InstrumentConfig,
}

impl UnitTransformer {
    pub fn new(config: InstrumentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    /// Rewrite every entry point of `unit`. Units with nothing to do are
    /// returned with their original bytes.
    pub fn transform(&self, mut unit: CompiledUnit) -> InstrumentResult<Transformed> {
        let mut class = ClassFile::parse(&unit.bytes)?;
        let metadata = UnitMetadata::capture(&class, &self.config.unknown_source)?;
        unit.source_path = Some(metadata.source_path.clone());

        let unchanged = if metadata.is_interface {
            Some(Unchanged::Interface)
        } else if !self.config.filter.admits_super(metadata.super_class.as_deref()) {
            Some(Unchanged::NotAPage)
        } else if self.already_instrumented(&class)? {
            Some(Unchanged::AlreadyInstrumented)
        } else {
            None
        };
        if let Some(reason) = unchanged {
            debug!("Leaving {} unchanged: {:?}", metadata.this_class, reason);
            return Ok(Transformed {
                unit,
                outcome: Outcome::Unchanged(reason),
            });
        }

        let plan = self.plan(&class)?;
        if plan.iter().all(Option::is_none) {
            debug!("No entry points in {}", metadata.this_class);
            return Ok(Transformed {
                unit,
                outcome: Outcome::Unchanged(Unchanged::NoEntryPoints),
            });
        }

        let methods = std::mem::take(&mut class.methods);
        let pool = &mut class.constant_pool;
        let rewriter = MethodRewriter::new(&self.config, &metadata, pool)?;
        let mut pass = RewritePass::new(&rewriter, methods.len() + plan.len());
        for (method, kind) in methods.into_iter().zip(plan) {
            pass.admit(pool, method, kind)?;
        }

        let (methods, instrumented) = pass.finish();
        class.methods = methods;
        unit.bytes = class.encode()?;

        info!(
            "Instrumented {} ({} entry points, source {})",
            metadata.this_class,
            instrumented.len(),
            metadata.source_path
        );

        Ok(Transformed {
            unit,
            outcome: Outcome::Rewritten(UnitReport {
                class_name: metadata.this_class,
                source_path: metadata.source_path,
                instrumented,
            }),
        })
    }

    fn already_instrumented(&self, class: &ClassFile) -> InstrumentResult<bool> {
        for method in &class.methods {
            if class
                .member_name(method)?
                .starts_with(self.config.hidden_prefix.as_str())
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Frame kind per method, in declaration order. Matched methods without
    /// a body (abstract, native) have nothing to wrap.
    fn plan(&self, class: &ClassFile) -> InstrumentResult<Vec<Option<FrameKind>>> {
        let mut plan = Vec::with_capacity(class.methods.len());
        for method in &class.methods {
            let name = class.member_name(method)?;
            let kind = classify(&name);
            if kind.is_some() && !method.has_code(&class.constant_pool) {
                debug!("Skipping {} without code", name);
                plan.push(None);
            } else {
                plan.push(kind);
            }
        }
        Ok(plan)
    }
}

/// Emits the rewritten method list for one unit.
///
/// A synthesized wrapper carries an entry-point name, so it goes back through
/// `admit` like any other emitted method; `wrapping` keeps it from being
/// classified and wrapped again.
struct RewritePass<'r, 'a> {
    rewriter: &'r MethodRewriter<'a>,
    wrapping: bool,
    methods: Vec<MemberInfo>,
    instrumented: Vec<InstrumentedMethod>,
}

impl<'r, 'a> RewritePass<'r, 'a> {
    fn new(rewriter: &'r MethodRewriter<'a>, capacity: usize) -> Self {
        Self {
            rewriter,
            wrapping: false,
            methods: Vec::with_capacity(capacity),
            instrumented: Vec::new(),
        }
    }

    fn admit(
        &mut self,
        pool: &mut ConstantPool,
        method: MemberInfo,
        kind: Option<FrameKind>,
    ) -> InstrumentResult<()> {
        match kind {
            Some(kind) if !self.wrapping => {
                self.wrapping = true;
                let result = self.wrap(pool, method, kind);
                self.wrapping = false;
                result
            }
            _ => {
                self.methods.push(method);
                Ok(())
            }
        }
    }

    fn wrap(&mut self, pool: &mut ConstantPool, method: MemberInfo, kind: FrameKind) -> InstrumentResult<()> {
        let rewritten = self.rewriter.rewrite(pool, method, kind)?;

        let wrapper_kind = classify(&pool.utf8(rewritten.wrapper.name_index)?);
        self.admit(pool, rewritten.wrapper, wrapper_kind)?;
        self.methods.push(rewritten.renamed);

        self.instrumented.push(InstrumentedMethod {
            method: rewritten.method,
            kind,
            step_sites: rewritten.step_sites,
        });
        Ok(())
    }

    fn finish(self) -> (Vec<MemberInfo>, Vec<InstrumentedMethod>) {
        (self.methods, self.instrumented)
    }
}
