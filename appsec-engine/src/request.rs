use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method, Uri};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Phase-level outcome of evaluation, ordered by severity. A later match
/// never weakens an earlier one; escalation keeps the maximum.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Disposition {
    #[default]
    Allow,
    Captcha,
    Custom {
        status: u16,
        body: String,
    },
    Deny,
}

impl Disposition {
    pub fn severity(&self) -> u8 {
        match self {
            Disposition::Allow => 0,
            Disposition::Captcha => 1,
            Disposition::Custom { .. } => 2,
            Disposition::Deny => 3,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Disposition::Allow => "allow",
            Disposition::Captcha => "captcha",
            Disposition::Custom { .. } => "custom",
            Disposition::Deny => "deny",
        }
    }

    pub fn is_interrupt(&self) -> bool {
        !matches!(self, Disposition::Allow)
    }

    /// Monotonic escalation: adopts `other` only when it is at least as
    /// severe. Equal severity adopts the newer value, so a later `Custom`
    /// replaces an earlier one.
    pub fn escalate(&mut self, other: Disposition) {
        if other.severity() >= self.severity() {
            *self = other;
        }
    }
}

/// Mutable evaluation state for one phase of one request. Owned by the
/// runner driving the request; never shared.
#[derive(Debug, Clone, Default)]
pub struct PhaseState {
    /// Matched rule identifiers, ordered by match time.
    pub rule_ids: Vec<String>,
    pub disposition: Disposition,
    pub interrupt: bool,
    pub status_override: Option<u16>,
    pub body_override: Option<String>,
}

impl PhaseState {
    pub fn record_match(&mut self, rule_name: &str, action: &Disposition) {
        self.rule_ids.push(rule_name.to_string());
        self.disposition.escalate(action.clone());
        if self.disposition.is_interrupt() {
            self.interrupt = true;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EvaluationState {
    pub inband: PhaseState,
    pub outofband: PhaseState,
}

/// Payload delivered on the per-request reply channel.
#[derive(Debug, Clone)]
pub struct InBandVerdict {
    pub status_code: u16,
    pub body: Value,
    pub in_band_interrupt: bool,
}

fn body_with_action(raw: &str, action: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(mut map)) => {
            map.entry("action")
                .or_insert_with(|| Value::String(action.to_string()));
            Value::Object(map)
        }
        _ => json!({ "action": action, "response": raw }),
    }
}

impl InBandVerdict {
    pub fn from_phase(phase: &PhaseState) -> Self {
        let (mut status_code, mut body) = match &phase.disposition {
            Disposition::Allow => (200, json!({ "action": "allow" })),
            Disposition::Captcha => (403, json!({ "action": "captcha" })),
            Disposition::Deny => (403, json!({ "action": "deny" })),
            Disposition::Custom { status, body } => {
                (*status, body_with_action(body, "custom"))
            }
        };
        if let Some(code) = phase.status_override {
            status_code = code;
        }
        if let Some(raw) = &phase.body_override {
            body = body_with_action(raw, phase.disposition.action());
        }
        Self {
            status_code,
            body,
            in_band_interrupt: phase.interrupt,
        }
    }

    /// Synthesized when in-band evaluation failed unexpectedly: the request
    /// is allowed through with a 500 so the handler is never left waiting.
    pub fn internal_error() -> Self {
        Self {
            status_code: 500,
            body: json!({ "action": "allow" }),
            in_band_interrupt: false,
        }
    }
}

/// Immutable snapshot of one forwarded HTTP request, plus the single-shot
/// reply channel its handler is waiting on. Exactly one verdict must be
/// delivered per request.
pub struct ParsedRequest {
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Declared client address from the trusted forwarding header, falling
    /// back to the peer address.
    pub client_ip: String,
    pub remote_addr: String,
    pub engine: String,
    pub state: EvaluationState,
    reply: Option<oneshot::Sender<InBandVerdict>>,
}

impl ParsedRequest {
    pub fn new(
        engine: String,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        client_ip: String,
        remote_addr: String,
    ) -> (Self, oneshot::Receiver<InBandVerdict>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            id: Uuid::new_v4(),
            received_at: Utc::now(),
            method,
            uri,
            headers,
            body,
            client_ip,
            remote_addr,
            engine,
            state: EvaluationState::default(),
            reply: Some(tx),
        };
        (request, rx)
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Case-insensitive header lookup; emission order is preserved in
    /// `headers` itself.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Delivers the in-band verdict. Returns false when the verdict was
    /// already sent or the handler has gone away.
    pub fn reply(&mut self, verdict: InBandVerdict) -> bool {
        match self.reply.take() {
            Some(tx) => tx.send(verdict).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_order_is_total() {
        let custom = Disposition::Custom {
            status: 418,
            body: String::new(),
        };
        assert!(Disposition::Allow.severity() < Disposition::Captcha.severity());
        assert!(Disposition::Captcha.severity() < custom.severity());
        assert!(custom.severity() < Disposition::Deny.severity());
    }

    #[test]
    fn escalation_never_weakens() {
        let mut disposition = Disposition::Deny;
        disposition.escalate(Disposition::Captcha);
        assert_eq!(disposition, Disposition::Deny);

        disposition.escalate(Disposition::Allow);
        assert_eq!(disposition, Disposition::Deny);
    }

    #[test]
    fn later_custom_replaces_earlier_custom() {
        let mut disposition = Disposition::Custom {
            status: 418,
            body: "first".into(),
        };
        disposition.escalate(Disposition::Custom {
            status: 429,
            body: "second".into(),
        });
        assert_eq!(
            disposition,
            Disposition::Custom {
                status: 429,
                body: "second".into()
            }
        );
    }

    #[test]
    fn match_sequence_keeps_maximum() {
        let mut phase = PhaseState::default();
        phase.record_match("r1", &Disposition::Captcha);
        phase.record_match("r2", &Disposition::Deny);
        phase.record_match("r3", &Disposition::Captcha);
        assert_eq!(phase.disposition, Disposition::Deny);
        assert!(phase.interrupt);
        assert_eq!(phase.rule_ids, vec!["r1", "r2", "r3"]);
    }

    #[test]
    fn allow_verdict_shape() {
        let verdict = InBandVerdict::from_phase(&PhaseState::default());
        assert_eq!(verdict.status_code, 200);
        assert_eq!(verdict.body["action"], "allow");
        assert!(!verdict.in_band_interrupt);
    }

    #[test]
    fn deny_verdict_shape() {
        let mut phase = PhaseState::default();
        phase.record_match("r1", &Disposition::Deny);
        let verdict = InBandVerdict::from_phase(&phase);
        assert_eq!(verdict.status_code, 403);
        assert_eq!(verdict.body["action"], "deny");
        assert!(verdict.in_band_interrupt);
    }

    #[test]
    fn overrides_rewrite_status_and_body() {
        let mut phase = PhaseState::default();
        phase.record_match("r1", &Disposition::Deny);
        phase.status_override = Some(429);
        phase.body_override = Some(r#"{"reason":"slow down"}"#.into());
        let verdict = InBandVerdict::from_phase(&phase);
        assert_eq!(verdict.status_code, 429);
        assert_eq!(verdict.body["action"], "deny");
        assert_eq!(verdict.body["reason"], "slow down");
    }

    #[test]
    fn custom_disposition_carries_its_own_status_and_body() {
        let mut phase = PhaseState::default();
        phase.record_match(
            "r1",
            &Disposition::Custom {
                status: 418,
                body: r#"{"action":"deny","hint":"teapot"}"#.into(),
            },
        );
        let verdict = InBandVerdict::from_phase(&phase);
        assert_eq!(verdict.status_code, 418);
        assert_eq!(verdict.body["action"], "deny");
        assert_eq!(verdict.body["hint"], "teapot");
    }

    #[test]
    fn non_json_body_override_is_wrapped() {
        let mut phase = PhaseState::default();
        phase.record_match("r1", &Disposition::Deny);
        phase.body_override = Some("blocked".into());
        let verdict = InBandVerdict::from_phase(&phase);
        assert_eq!(verdict.body["action"], "deny");
        assert_eq!(verdict.body["response"], "blocked");
    }

    #[test]
    fn reply_is_single_shot() {
        let (mut request, mut rx) = ParsedRequest::new(
            "test-engine".into(),
            Method::GET,
            Uri::from_static("/"),
            HeaderMap::new(),
            Bytes::new(),
            "10.0.0.1".into(),
            "127.0.0.1:9999".into(),
        );
        assert!(request.reply(InBandVerdict::internal_error()));
        assert!(!request.reply(InBandVerdict::internal_error()));
        assert_eq!(rx.try_recv().unwrap().status_code, 500);
    }
}
