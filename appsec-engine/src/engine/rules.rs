use super::{EvalContext, Phase, RuleSet, RuleSetBuilder};
use crate::request::{Disposition, ParsedRequest};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Narrow interface to the external rule compiler: one compiled primitive
/// decides whether it matches a forwarded request. Primitives may hold
/// per-runner scratch behind interior mutability; the compiled rule data
/// itself is shared and never mutated after startup.
pub trait RuleMatcher: Send + Sync {
    fn evaluate(&self, req: &ParsedRequest, ctx: &EvalContext) -> anyhow::Result<bool>;
}

impl<F> RuleMatcher for F
where
    F: Fn(&ParsedRequest, &EvalContext) -> anyhow::Result<bool> + Send + Sync,
{
    fn evaluate(&self, req: &ParsedRequest, ctx: &EvalContext) -> anyhow::Result<bool> {
        self(req, ctx)
    }
}

#[derive(Clone)]
pub struct CompiledRule {
    pub name: String,
    pub phase: Phase,
    /// Disposition a match escalates the phase to.
    pub action: Disposition,
    pub matcher: Arc<dyn RuleMatcher>,
}

impl CompiledRule {
    pub fn new(
        name: impl Into<String>,
        phase: Phase,
        action: Disposition,
        matcher: Arc<dyn RuleMatcher>,
    ) -> Self {
        Self {
            name: name.into(),
            phase,
            action,
            matcher,
        }
    }

    /// Convenience constructor for matchers expressed as plain functions.
    pub fn from_fn<F>(
        name: impl Into<String>,
        phase: Phase,
        action: Disposition,
        matcher: F,
    ) -> Self
    where
        F: Fn(&ParsedRequest, &EvalContext) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self::new(name, phase, action, Arc::new(matcher))
    }
}

/// Reference to the rule configuration the engine was asked to load.
#[derive(Debug, Clone)]
pub enum PolicySource {
    Named(String),
    File(PathBuf),
}

impl std::fmt::Display for PolicySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicySource::Named(name) => write!(f, "{name}"),
            PolicySource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Seam to the external rule compiler. The engine never interprets rule
/// configuration itself; a compiler turns the referenced policy into a
/// rule set the supervisor freezes at startup.
pub trait RuleCompiler: Send + Sync {
    fn compile(&self, policy: &PolicySource, data_dir: &Path) -> anyhow::Result<RuleSet>;
}

/// Compiler wired by the default binary when no rule pack is linked in:
/// validates the policy reference and yields an empty rule set, so the
/// engine authenticates and dispatches but every verdict is allow.
pub struct PassthroughCompiler;

impl RuleCompiler for PassthroughCompiler {
    fn compile(&self, policy: &PolicySource, data_dir: &Path) -> anyhow::Result<RuleSet> {
        if let PolicySource::File(path) = policy {
            anyhow::ensure!(
                path.exists(),
                "appsec config {} does not exist",
                path.display()
            );
        }
        Ok(RuleSetBuilder::new().data_dir(data_dir).build())
    }
}
