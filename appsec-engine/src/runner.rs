use crate::engine::{Phase, RuleEngineHandle};
use crate::metrics::{normalize_source, EngineMetrics};
use crate::request::{Disposition, InBandVerdict, ParsedRequest};
use chrono::Utc;
use common_events::{EventDisposition, EventSink, SecurityEvent};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Long-lived worker: consumes parsed requests from the shared queue,
/// drives both evaluation phases, answers the in-band verdict and emits
/// security events. One runner processes one request at a time.
pub struct Runner {
    id: usize,
    jobs: async_channel::Receiver<ParsedRequest>,
    handle: RuleEngineHandle,
    metrics: Arc<EngineMetrics>,
    events: EventSink,
    labels: BTreeMap<String, String>,
}

impl Runner {
    pub fn new(
        id: usize,
        jobs: async_channel::Receiver<ParsedRequest>,
        handle: RuleEngineHandle,
        metrics: Arc<EngineMetrics>,
        events: EventSink,
        labels: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id,
            jobs,
            handle,
            metrics,
            events,
            labels,
        }
    }

    pub async fn run(self) {
        info!(runner = self.id, "appsec runner started");
        // A closed queue still yields whatever was enqueued before the
        // close, so shutdown drains instead of dropping requests.
        while let Ok(request) = self.jobs.recv().await {
            self.process(request);
        }
        info!(runner = self.id, "appsec runner stopped");
    }

    fn process(&self, mut req: ParsedRequest) {
        let source = normalize_source(&req.remote_addr);
        let started = Instant::now();

        let inband = catch_unwind(AssertUnwindSafe(|| {
            self.handle.run_phase(&mut req, Phase::InBand)
        }));

        // The verdict must go out exactly once per request, even when a
        // rule primitive blew up mid-phase.
        let verdict = match &inband {
            Ok(()) => InBandVerdict::from_phase(&req.state.inband),
            Err(_) => {
                error!(
                    runner = self.id,
                    request = %req.id,
                    "in-band evaluation panicked, synthesizing allow verdict"
                );
                InBandVerdict::internal_error()
            }
        };
        if !req.reply(verdict) {
            warn!(runner = self.id, request = %req.id, "in-band verdict receiver went away");
        }
        self.metrics.observe_inband(started.elapsed().as_secs_f64());

        if inband.is_err() {
            // Evaluation state can no longer be trusted; skip out-of-band.
            self.metrics.observe_global(started.elapsed().as_secs_f64());
            return;
        }

        let outofband_started = Instant::now();
        if catch_unwind(AssertUnwindSafe(|| {
            self.handle.run_phase(&mut req, Phase::OutOfBand)
        }))
        .is_err()
        {
            error!(runner = self.id, request = %req.id, "out-of-band evaluation panicked");
        }
        self.metrics
            .observe_outofband(outofband_started.elapsed().as_secs_f64());
        self.metrics.observe_global(started.elapsed().as_secs_f64());

        for rule in &req.state.inband.rule_ids {
            self.metrics
                .record_rule_hit(rule, Phase::InBand.label(), &req.engine, &source);
        }
        for rule in &req.state.outofband.rule_ids {
            self.metrics
                .record_rule_hit(rule, Phase::OutOfBand.label(), &req.engine, &source);
        }

        if req.state.inband.disposition.is_interrupt()
            || req.state.outofband.disposition.is_interrupt()
        {
            self.events.emit(self.build_event(&req));
        }
    }

    fn build_event(&self, req: &ParsedRequest) -> SecurityEvent {
        let mut rule_ids = req.state.inband.rule_ids.clone();
        rule_ids.extend(req.state.outofband.rule_ids.iter().cloned());
        SecurityEvent {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            engine: req.engine.clone(),
            rule_ids,
            inband_disposition: event_disposition(&req.state.inband.disposition),
            outofband_disposition: event_disposition(&req.state.outofband.disposition),
            method: req.method.to_string(),
            path: req.path().to_string(),
            client_ip: req.client_ip.clone(),
            labels: self.labels.clone(),
        }
    }
}

fn event_disposition(disposition: &Disposition) -> EventDisposition {
    match disposition {
        Disposition::Allow => EventDisposition::Allow,
        Disposition::Captcha => EventDisposition::Captcha,
        Disposition::Custom { .. } => EventDisposition::Custom,
        Disposition::Deny => EventDisposition::Deny,
    }
}
