//! Graceful shutdown: no new requests are accepted, and every accepted
//! request reaches a terminal state before the supervisor returns.

mod support;

use appsec_engine::engine::rules::CompiledRule;
use appsec_engine::engine::{Phase, RuleSetBuilder, API_KEY_HEADER};
use appsec_engine::request::Disposition;
use httpmock::MockServer;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use support::{engine_config, mock_probe, spawn_engine, VALID_KEY};

#[tokio::test]
async fn shutdown_stops_accepting_new_connections() {
    let lapi = MockServer::start_async().await;
    let _probe = mock_probe(&lapi).await;
    let engine = spawn_engine(
        &engine_config(&lapi.base_url(), ""),
        RuleSetBuilder::new().build(),
    )
    .await;

    let client = reqwest::Client::new();
    let resp = client
        .get(engine.url("/"))
        .header(API_KEY_HEADER, VALID_KEY)
        .header("connection", "close")
        .send()
        .await
        .expect("request before shutdown");
    assert_eq!(resp.status(), 200);

    let addr = engine.addr;
    engine.stop().await;

    let err = client
        .get(format!("http://{addr}/"))
        .header(API_KEY_HEADER, VALID_KEY)
        .send()
        .await;
    assert!(err.is_err(), "listener must be closed after shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_request_finishes_before_supervisor_returns() {
    let lapi = MockServer::start_async().await;
    let _probe = mock_probe(&lapi).await;

    let entered = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new((Mutex::new(false), Condvar::new()));
    let rule_set = {
        let entered = entered.clone();
        let gate = gate.clone();
        RuleSetBuilder::new()
            .rule(CompiledRule::from_fn(
                "gated-rule",
                Phase::InBand,
                Disposition::Allow,
                move |_, _| {
                    entered.fetch_add(1, Ordering::SeqCst);
                    let (lock, cvar) = &*gate;
                    let mut released = lock.lock().unwrap();
                    while !*released {
                        released = cvar.wait(released).unwrap();
                    }
                    Ok(false)
                },
            ))
            .build()
    };
    let engine = spawn_engine(&engine_config(&lapi.base_url(), ""), rule_set).await;

    let client = reqwest::Client::new();
    let in_flight = {
        let client = client.clone();
        let url = engine.url("/");
        tokio::spawn(async move {
            client
                .get(url)
                .header(API_KEY_HEADER, VALID_KEY)
                .header("connection", "close")
                .send()
                .await
        })
    };

    // Wait until the request is being evaluated, then start the drain.
    while entered.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    engine.shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        !engine.handle.is_finished(),
        "supervisor must wait for the in-flight request"
    );

    {
        let (lock, cvar) = &*gate;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    let resp = in_flight
        .await
        .expect("task")
        .expect("in-flight request completes during drain");
    assert_eq!(resp.status(), 200);

    tokio::time::timeout(Duration::from_secs(15), engine.handle)
        .await
        .expect("supervisor returned after drain")
        .expect("supervisor task")
        .expect("clean shutdown");
}
