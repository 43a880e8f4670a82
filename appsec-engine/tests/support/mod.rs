use appsec_engine::config::EngineConfig;
use appsec_engine::engine::RuleSet;
use appsec_engine::supervisor::Supervisor;
use common_events::{EventSink, SecurityEvent};
use httpmock::MockServer;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const VALID_KEY: &str = "k1";

#[allow(dead_code)]
pub struct TestEngine {
    pub addr: SocketAddr,
    pub events: mpsc::Receiver<SecurityEvent>,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<anyhow::Result<()>>,
}

#[allow(dead_code)]
impl TestEngine {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(15), self.handle)
            .await
            .expect("supervisor stopped in time")
            .expect("supervisor task")
            .expect("clean shutdown");
    }
}

/// Boots the engine on an ephemeral TCP port against the given rule set and
/// waits for the listener to report its address.
#[allow(dead_code)]
pub async fn spawn_engine(config_yaml: &str, rule_set: RuleSet) -> TestEngine {
    let config = EngineConfig::from_yaml(config_yaml).expect("valid test config");
    let (sink, events) = EventSink::channel(16);
    let mut supervisor = Supervisor::new(config, rule_set, sink);
    let ready = supervisor.ready_signal();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(supervisor.run(shutdown.clone()));
    let addr = tokio::time::timeout(Duration::from_secs(5), ready)
        .await
        .expect("listener ready in time")
        .expect("listener address reported");
    TestEngine {
        addr,
        events,
        shutdown,
        handle,
    }
}

#[allow(dead_code)]
pub fn engine_config(lapi_url: &str, extra: &str) -> String {
    format!(
        "name: test-engine\n\
         listen_addr: 127.0.0.1:0\n\
         appsec_config: test-policy\n\
         lapi_url: {lapi_url}\n\
         {extra}"
    )
}

/// Registers the probe endpoint accepting `VALID_KEY` on a mock upstream.
/// Returns the mock so tests can assert on probe hit counts.
#[allow(dead_code)]
pub async fn mock_probe(lapi: &MockServer) -> httpmock::Mock<'_> {
    lapi.mock_async(|when, then| {
        when.method(httpmock::Method::HEAD)
            .path("/v1/decisions/stream")
            .header("x-api-key", VALID_KEY);
        then.status(200);
    })
    .await
}
