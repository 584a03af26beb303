mod common;

use std::time::{Duration, Instant};

use common::{MockOutbound, attach_mock, connect_client, start_harness, tool_names, wait_for};

/// The inbound surface answers immediately while outbound servers are
/// still connecting; slow servers appear later via listChanged.
#[tokio::test]
async fn slow_outbounds_do_not_block_the_inbound_surface() {
    let harness = start_harness().await;
    attach_mock(&harness, &[], MockOutbound::new("fast").with_tools(&["quick"])).await;
    let runtime = harness.runtime.clone();
    assert!(
        wait_for(Duration::from_secs(5), || {
            let runtime = runtime.clone();
            async move { runtime.aggregator.current().tools.len() == 1 }
        })
        .await
    );

    // "slow" takes 800ms to become ready
    let slow = MockOutbound::new("slow").with_tools(&["heavy"]);
    let started = Instant::now();
    let (client, recorder) = connect_client(&harness, "").await;

    // the first list answers well under a second
    assert_eq!(tool_names(&client).await, vec!["quick"]);
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "inbound surface must answer before slow outbounds connect"
    );

    // now let the slow server arrive
    tokio::time::sleep(Duration::from_millis(800)).await;
    attach_mock(&harness, &[], slow).await;

    // a listChanged notification reaches the client and the tool appears
    let recorder_ref = recorder.clone();
    assert!(
        wait_for(Duration::from_secs(5), || {
            let recorder = recorder_ref.clone();
            async move { recorder.count("notifications/tools/list_changed") >= 1 }
        })
        .await,
        "client never heard tools/listChanged"
    );
    assert_eq!(tool_names(&client).await, vec!["heavy", "quick"]);

    client.cancellation_token().cancel();
}

/// Failed dials surface in health state instead of blocking startup.
#[tokio::test]
async fn failed_outbounds_are_reported_not_fatal() {
    let harness = start_harness().await;
    attach_mock(&harness, &[], MockOutbound::new("ok").with_tools(&["t"])).await;

    // a server that was never attached stays un-Ready; emulate a failure
    let descriptor: onemcp::config::ServerDescriptor =
        serde_json::from_value(serde_json::json!({
            "name": "broken",
            "command": "in-process",
        }))
        .unwrap();
    let conn = onemcp::outbound::OutboundConnection::new(
        descriptor,
        harness.runtime.events.clone(),
    )
    .unwrap();
    harness.runtime.registry.insert(conn.clone());
    conn.mark_connecting();
    conn.mark_failed(&onemcp::error::ProxyError::TransportDial("refused".into()));

    let summary = harness.runtime.loader.summary();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.ready, 1);
    assert_eq!(summary.failed, 1);
    assert!(summary.is_complete);
    assert!((summary.success_rate - 0.5).abs() < f64::EPSILON);

    // the inbound view still works with the healthy server
    let (client, _recorder) = connect_client(&harness, "").await;
    assert_eq!(tool_names(&client).await, vec!["t"]);
    client.cancellation_token().cancel();
}

/// Health endpoints project per-server and aggregate loading state.
#[tokio::test]
async fn health_endpoints_reflect_connection_states() {
    let harness = start_harness().await;
    attach_mock(&harness, &["web"], MockOutbound::new("alive").with_tools(&["t"])).await;

    let aggregate: serde_json::Value =
        reqwest::get(format!("http://{}/health/mcp", harness.addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    assert_eq!(aggregate["total"], 1);
    assert_eq!(aggregate["ready"], 1);

    let record: serde_json::Value =
        reqwest::get(format!("http://{}/health/mcp/alive", harness.addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    assert_eq!(record["name"], "alive");
    assert_eq!(record["state"], "ready");
    assert_eq!(record["retry_count"], 0);
}
