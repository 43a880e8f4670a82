use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Normalizes a remote address into the `source` metric label: the bare IP
/// for socket addresses, the value unchanged otherwise (unix peers).
pub fn normalize_source(remote: &str) -> String {
    remote
        .parse::<std::net::SocketAddr>()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| remote.to_string())
}

fn parsing_buckets() -> Vec<f64> {
    vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
}

#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    requests: IntCounterVec,
    blocks: IntCounterVec,
    rule_hits: IntCounterVec,
    inband_parsing: Histogram,
    outofband_parsing: Histogram,
    global_parsing: Histogram,
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new("appsec_reqs_total", "Total forwarded requests received"),
            &["source", "appsec_engine"],
        )?;
        let blocks = IntCounterVec::new(
            Opts::new(
                "appsec_block_total",
                "Requests whose in-band verdict was non-allow",
            ),
            &["source", "appsec_engine"],
        )?;
        let rule_hits = IntCounterVec::new(
            Opts::new("appsec_rule_hits_total", "Rule matches per rule and phase"),
            &["rule_name", "rule_type", "appsec_engine", "source"],
        )?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(blocks.clone()))?;
        registry.register(Box::new(rule_hits.clone()))?;
        let inband_parsing = Histogram::with_opts(
            HistogramOpts::new(
                "appsec_inband_parsing_seconds",
                "Time spent in the in-band evaluation phase (seconds)",
            )
            .buckets(parsing_buckets()),
        )?;
        let outofband_parsing = Histogram::with_opts(
            HistogramOpts::new(
                "appsec_outofband_parsing_seconds",
                "Time spent in the out-of-band evaluation phase (seconds)",
            )
            .buckets(parsing_buckets()),
        )?;
        let global_parsing = Histogram::with_opts(
            HistogramOpts::new(
                "appsec_global_parsing_seconds",
                "Total per-request evaluation time across both phases (seconds)",
            )
            .buckets(parsing_buckets()),
        )?;
        registry.register(Box::new(inband_parsing.clone()))?;
        registry.register(Box::new(outofband_parsing.clone()))?;
        registry.register(Box::new(global_parsing.clone()))?;
        Ok(Self {
            registry,
            requests,
            blocks,
            rule_hits,
            inband_parsing,
            outofband_parsing,
            global_parsing,
        })
    }

    pub fn record_request(&self, source: &str, engine: &str) {
        self.requests.with_label_values(&[source, engine]).inc();
    }

    pub fn record_block(&self, source: &str, engine: &str) {
        self.blocks.with_label_values(&[source, engine]).inc();
    }

    pub fn record_rule_hit(&self, rule_name: &str, rule_type: &str, engine: &str, source: &str) {
        self.rule_hits
            .with_label_values(&[rule_name, rule_type, engine, source])
            .inc();
    }

    pub fn observe_inband(&self, secs: f64) {
        self.inband_parsing.observe(secs);
    }

    pub fn observe_outofband(&self, secs: f64) {
        self.outofband_parsing.observe(secs);
    }

    pub fn observe_global(&self, secs: f64) {
        self.global_parsing.observe(secs);
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )
            .body(Body::from(buffer))?;
        Ok(response)
    }
}
