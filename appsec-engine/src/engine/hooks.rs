use crate::request::{Disposition, PhaseState};

/// A single mutation a hook performs on the phase state. Direct sets are
/// exempt from the monotonic escalation rule that governs rule matches.
#[derive(Debug, Clone)]
pub enum HookAction {
    SetDisposition(Disposition),
    SetStatus(u16),
    SetBody(String),
    /// Drops the triggering rule's id from the matched list.
    CancelMatch,
}

/// A configurable piece of logic run at a well-known point of the evaluation
/// lifecycle: OnLoad, PreEval, PostEval or OnMatch, depending on which list
/// it was registered in.
#[derive(Debug, Clone, Default)]
pub struct Hook {
    on_rule: Option<String>,
    actions: Vec<HookAction>,
}

impl Hook {
    pub fn new(actions: Vec<HookAction>) -> Self {
        Self {
            on_rule: None,
            actions,
        }
    }

    /// Restricts the hook to fire only for the named rule (OnMatch lists).
    pub fn on_rule(mut self, rule: impl Into<String>) -> Self {
        self.on_rule = Some(rule.into());
        self
    }

    pub fn applies_to(&self, matched: Option<&str>) -> bool {
        match (&self.on_rule, matched) {
            (None, _) => true,
            (Some(want), Some(got)) => want == got,
            (Some(_), None) => false,
        }
    }

    pub fn apply(&self, state: &mut PhaseState, matched: Option<&str>) {
        for action in &self.actions {
            match action {
                HookAction::SetDisposition(disposition) => {
                    state.interrupt = disposition.is_interrupt();
                    state.disposition = disposition.clone();
                }
                HookAction::SetStatus(code) => state.status_override = Some(*code),
                HookAction::SetBody(body) => state.body_override = Some(body.clone()),
                HookAction::CancelMatch => {
                    if let Some(name) = matched {
                        if let Some(pos) = state.rule_ids.iter().rposition(|id| id == name) {
                            state.rule_ids.remove(pos);
                        }
                    }
                }
            }
        }
    }
}
