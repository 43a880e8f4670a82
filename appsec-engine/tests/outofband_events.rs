//! S3: a rule that only exists out-of-band never delays the caller; its
//! verdict is delivered to the downstream bus after the HTTP response.

mod support;

use appsec_engine::engine::rules::CompiledRule;
use appsec_engine::engine::{Phase, RuleSetBuilder, API_KEY_HEADER, CLIENT_IP_HEADER};
use appsec_engine::request::Disposition;
use common_events::EventDisposition;
use httpmock::MockServer;
use std::time::Duration;
use support::{engine_config, mock_probe, spawn_engine, VALID_KEY};

#[tokio::test]
async fn out_of_band_match_allows_caller_and_emits_event() {
    let lapi = MockServer::start_async().await;
    let _probe = mock_probe(&lapi).await;
    let rule_set = RuleSetBuilder::new()
        .rule(CompiledRule::from_fn(
            "oob-catchall",
            Phase::OutOfBand,
            Disposition::Deny,
            |_, _| Ok(true),
        ))
        .build();
    let mut engine = spawn_engine(
        &engine_config(&lapi.base_url(), "labels:\n  kind: appsec\n"),
        rule_set,
    )
    .await;

    let resp = reqwest::Client::new()
        .get(engine.url("/x"))
        .header(API_KEY_HEADER, VALID_KEY)
        .header(CLIENT_IP_HEADER, "203.0.113.9")
        .send()
        .await
        .expect("request");
    // The caller is never held up by out-of-band evaluation.
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.expect("json body");
    assert_eq!(body["action"], "allow");

    let event = tokio::time::timeout(Duration::from_secs(1), engine.events.recv())
        .await
        .expect("event within one second")
        .expect("event emitted");
    assert_eq!(event.engine, "test-engine");
    assert_eq!(event.rule_ids, vec!["oob-catchall"]);
    assert_eq!(event.inband_disposition, EventDisposition::Allow);
    assert_eq!(event.outofband_disposition, EventDisposition::Deny);
    assert_eq!(event.method, "GET");
    assert_eq!(event.path, "/x");
    assert_eq!(event.client_ip, "203.0.113.9");
    assert_eq!(event.labels.get("kind").map(String::as_str), Some("appsec"));

    engine.stop().await;
}
