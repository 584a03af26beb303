mod common;

use std::time::Duration;

use rmcp::model as mcp;

use common::{MockOutbound, attach_mock, connect_client, start_harness, tool_names, wait_for};

#[tokio::test]
async fn duplicate_tool_names_deduplicate_to_lexicographic_winner() {
    let harness = start_harness().await;
    let x = MockOutbound::new("x").with_tools(&["search"]);
    let y = MockOutbound::new("y").with_tools(&["search", "fetch"]);
    let x_calls = x.calls.clone();
    let y_calls = y.calls.clone();

    // attach in reverse lexical order to prove order independence
    attach_mock(&harness, &["web"], y).await;
    attach_mock(&harness, &["web"], x).await;

    let runtime = harness.runtime.clone();
    assert!(
        wait_for(Duration::from_secs(5), || {
            let runtime = runtime.clone();
            async move { runtime.aggregator.current().ready_server_names.len() == 2 }
        })
        .await
    );

    let (client, _recorder) = connect_client(&harness, "").await;
    // `search` appears exactly once; `fetch` still comes from y
    assert_eq!(tool_names(&client).await, vec!["fetch", "search"]);

    // the de-duplicated tool routes to x, the lexicographic minimum
    let result = client
        .call_tool(mcp::CallToolRequestParam {
            name: "search".into(),
            arguments: None,
        })
        .await
        .expect("call search");
    let text: String = result
        .content
        .iter()
        .filter_map(|c| c.as_text().map(|t| t.text.clone()))
        .collect();
    assert_eq!(text, "x::search");
    assert_eq!(x_calls.lock().unwrap().len(), 1);
    assert!(y_calls.lock().unwrap().is_empty());

    client.cancellation_token().cancel();
}

#[tokio::test]
async fn resources_and_prompts_key_on_uri_and_name() {
    let harness = start_harness().await;
    attach_mock(
        &harness,
        &[],
        MockOutbound::new("alpha")
            .with_resources(&["file:///shared.txt", "file:///alpha.txt"])
            .with_prompts(&["review"]),
    )
    .await;
    attach_mock(
        &harness,
        &[],
        MockOutbound::new("beta")
            .with_resources(&["file:///shared.txt", "file:///beta.txt"])
            .with_prompts(&["review", "summarize"]),
    )
    .await;

    let runtime = harness.runtime.clone();
    assert!(
        wait_for(Duration::from_secs(5), || {
            let runtime = runtime.clone();
            async move { runtime.aggregator.current().ready_server_names.len() == 2 }
        })
        .await
    );

    let snapshot = harness.runtime.aggregator.current();
    assert_eq!(snapshot.resources.len(), 3);
    assert_eq!(
        snapshot.resource_owner("file:///shared.txt").unwrap().server,
        "alpha"
    );
    assert_eq!(snapshot.prompts.len(), 2);
    assert_eq!(snapshot.prompt_owner("review").unwrap().server, "alpha");
    assert_eq!(snapshot.prompt_owner("summarize").unwrap().server, "beta");

    // reading the shared resource goes to the winner
    let (client, _recorder) = connect_client(&harness, "").await;
    let read = client
        .read_resource(mcp::ReadResourceRequestParam {
            uri: "file:///shared.txt".into(),
        })
        .await
        .expect("read resource");
    let text = serde_json::to_string(&read).unwrap();
    assert!(text.contains("alpha"), "expected alpha to serve: {text}");

    client.cancellation_token().cancel();
}

#[tokio::test]
async fn disconnect_removes_a_servers_items() {
    let harness = start_harness().await;
    let conn = attach_mock(&harness, &[], MockOutbound::new("gone").with_tools(&["t"])).await;
    let runtime = harness.runtime.clone();
    assert!(
        wait_for(Duration::from_secs(5), || {
            let runtime = runtime.clone();
            async move { runtime.aggregator.current().tools.len() == 1 }
        })
        .await
    );

    conn.close();
    harness.notify.refresh_capabilities();
    let runtime = harness.runtime.clone();
    assert!(
        wait_for(Duration::from_secs(5), || {
            let runtime = runtime.clone();
            async move { runtime.aggregator.current().tools.is_empty() }
        })
        .await,
        "closed server's tools must leave the snapshot"
    );
}
