pub mod hooks;
pub mod rules;

use crate::request::{ParsedRequest, PhaseState};
use hooks::Hook;
use rules::CompiledRule;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Header the front-end uses to carry the caller's API key.
pub const API_KEY_HEADER: &str = "x-appsec-api-key";
/// Header carrying the declared client address of the original transaction.
pub const CLIENT_IP_HEADER: &str = "x-appsec-ip";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    InBand,
    OutOfBand,
}

impl Phase {
    pub fn label(&self) -> &'static str {
        match self {
            Phase::InBand => "inband",
            Phase::OutOfBand => "outofband",
        }
    }
}

/// Context threaded through rule primitives: the data directory for rules
/// referencing external resources, and a cancellation token primitives may
/// honor if they support it.
pub struct EvalContext {
    pub data_dir: PathBuf,
    pub cancel: CancellationToken,
}

pub struct RuleSetBuilder {
    inband_rules: Vec<CompiledRule>,
    outofband_rules: Vec<CompiledRule>,
    on_load: Vec<Hook>,
    pre_eval: Vec<Hook>,
    post_eval: Vec<Hook>,
    on_match: Vec<Hook>,
    data_dir: PathBuf,
}

impl RuleSetBuilder {
    pub fn new() -> Self {
        Self {
            inband_rules: Vec::new(),
            outofband_rules: Vec::new(),
            on_load: Vec::new(),
            pre_eval: Vec::new(),
            post_eval: Vec::new(),
            on_match: Vec::new(),
            data_dir: PathBuf::from("."),
        }
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Appends a rule to its phase's list; declared order is evaluation order.
    pub fn rule(mut self, rule: CompiledRule) -> Self {
        match rule.phase {
            Phase::InBand => self.inband_rules.push(rule),
            Phase::OutOfBand => self.outofband_rules.push(rule),
        }
        self
    }

    pub fn on_load_hook(mut self, hook: Hook) -> Self {
        self.on_load.push(hook);
        self
    }

    pub fn pre_eval_hook(mut self, hook: Hook) -> Self {
        self.pre_eval.push(hook);
        self
    }

    pub fn post_eval_hook(mut self, hook: Hook) -> Self {
        self.post_eval.push(hook);
        self
    }

    pub fn on_match_hook(mut self, hook: Hook) -> Self {
        self.on_match.push(hook);
        self
    }

    pub fn build(self) -> RuleSet {
        RuleSet {
            inband_rules: self.inband_rules,
            outofband_rules: self.outofband_rules,
            on_load: self.on_load,
            pre_eval: self.pre_eval,
            post_eval: self.post_eval,
            on_match: self.on_match,
            data_dir: self.data_dir,
            baseline: PhaseState::default(),
        }
    }
}

impl Default for RuleSetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Compiled rule set, frozen after the on-load hooks run. Shared read-only
/// by every runner; no synchronization is needed to evaluate against it.
pub struct RuleSet {
    inband_rules: Vec<CompiledRule>,
    outofband_rules: Vec<CompiledRule>,
    on_load: Vec<Hook>,
    pre_eval: Vec<Hook>,
    post_eval: Vec<Hook>,
    on_match: Vec<Hook>,
    data_dir: PathBuf,
    baseline: PhaseState,
}

impl RuleSet {
    /// Runs the on-load hooks exactly once. Overrides they set become the
    /// baseline state every phase evaluation starts from.
    pub fn finalize(mut self) -> Self {
        let mut baseline = PhaseState::default();
        for hook in &self.on_load {
            hook.apply(&mut baseline, None);
        }
        self.baseline = baseline;
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn rule_count(&self, phase: Phase) -> usize {
        self.rules(phase).len()
    }

    fn rules(&self, phase: Phase) -> &[CompiledRule] {
        match phase {
            Phase::InBand => &self.inband_rules,
            Phase::OutOfBand => &self.outofband_rules,
        }
    }
}

/// Per-runner view over the shared rule set. Each runner owns one handle
/// with its own evaluation context, so driving a phase needs no locking.
pub struct RuleEngineHandle {
    rules: Arc<RuleSet>,
    ctx: EvalContext,
}

impl RuleEngineHandle {
    pub fn new(rules: Arc<RuleSet>, cancel: CancellationToken) -> Self {
        let ctx = EvalContext {
            data_dir: rules.data_dir.clone(),
            cancel,
        };
        Self { rules, ctx }
    }

    /// Drives one phase for one request: PreEval hooks, rules in declared
    /// order (each match firing the OnMatch hooks), then PostEval hooks.
    /// A PreEval interrupt short-circuits the rule walk; PostEval still runs
    /// so response overrides always apply.
    pub fn run_phase(&self, req: &mut ParsedRequest, phase: Phase) {
        let mut state = self.rules.baseline.clone();

        for hook in &self.rules.pre_eval {
            if hook.applies_to(None) {
                hook.apply(&mut state, None);
            }
        }

        if !state.interrupt {
            for rule in self.rules.rules(phase) {
                if self.ctx.cancel.is_cancelled() {
                    break;
                }
                match rule.matcher.evaluate(req, &self.ctx) {
                    Ok(true) => {
                        state.record_match(&rule.name, &rule.action);
                        for hook in &self.rules.on_match {
                            if hook.applies_to(Some(&rule.name)) {
                                hook.apply(&mut state, Some(&rule.name));
                            }
                        }
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(rule = %rule.name, %err, "rule evaluation failed, skipping rule");
                    }
                }
            }
        }

        for hook in &self.rules.post_eval {
            if hook.applies_to(None) {
                hook.apply(&mut state, None);
            }
        }

        *phase_state_mut(req, phase) = state;
    }
}

fn phase_state_mut(req: &mut ParsedRequest, phase: Phase) -> &mut PhaseState {
    match phase {
        Phase::InBand => &mut req.state.inband,
        Phase::OutOfBand => &mut req.state.outofband,
    }
}
