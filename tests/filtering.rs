mod common;

use std::time::Duration;

use rmcp::model as mcp;

use common::{MockOutbound, attach_mock, connect_client, start_harness, tool_names, wait_for};

async fn seed_three_servers(harness: &common::TestHarness) {
    attach_mock(
        harness,
        &["web", "frontend"],
        MockOutbound::new("a").with_tools(&["render"]).with_prompts(&["page-review"]),
    )
    .await;
    attach_mock(
        harness,
        &["database", "backend"],
        MockOutbound::new("b").with_tools(&["query"]),
    )
    .await;
    attach_mock(
        harness,
        &["api", "backend"],
        MockOutbound::new("c").with_tools(&["fetch"]),
    )
    .await;

    // wait until the aggregator has absorbed all three
    let runtime = harness.runtime.clone();
    assert!(
        wait_for(Duration::from_secs(5), || {
            let runtime = runtime.clone();
            async move { runtime.aggregator.current().tools.len() == 3 }
        })
        .await,
        "aggregator never saw all mock tools"
    );
}

#[tokio::test]
async fn simple_or_filter_admits_only_matching_servers() {
    let harness = start_harness().await;
    seed_three_servers(&harness).await;

    let (client, _recorder) = connect_client(&harness, "?tags=web,frontend").await;
    assert_eq!(tool_names(&client).await, vec!["render"]);

    let prompts = client.list_all_prompts().await.expect("list prompts");
    let prompt_names: Vec<&str> = prompts.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(prompt_names, vec!["page-review"]);

    // calling a tool owned by a filtered-out server is a protocol error
    let err = client
        .call_tool(mcp::CallToolRequestParam {
            name: "query".into(),
            arguments: None,
        })
        .await
        .expect_err("tool from 'b' must not be callable");
    assert!(
        err.to_string().contains("not allowed"),
        "unexpected error: {err}"
    );

    client.cancellation_token().cancel();
}

#[tokio::test]
async fn and_not_expression_narrows_to_one_server() {
    let harness = start_harness().await;
    seed_three_servers(&harness).await;

    let (client, _recorder) =
        connect_client(&harness, "?tag-filter=backend%20AND%20NOT%20api").await;
    assert_eq!(tool_names(&client).await, vec!["query"]);

    // the admitted server's tool round-trips
    let result = client
        .call_tool(mcp::CallToolRequestParam {
            name: "query".into(),
            arguments: None,
        })
        .await
        .expect("call query");
    let text: String = result
        .content
        .iter()
        .filter_map(|c| c.as_text().map(|t| t.text.clone()))
        .collect();
    assert_eq!(text, "b::query");

    client.cancellation_token().cancel();
}

#[tokio::test]
async fn unknown_tool_is_not_found() {
    let harness = start_harness().await;
    seed_three_servers(&harness).await;

    let (client, _recorder) = connect_client(&harness, "").await;
    let err = client
        .call_tool(mcp::CallToolRequestParam {
            name: "no-such-tool".into(),
            arguments: None,
        })
        .await
        .expect_err("unknown tool");
    assert!(err.to_string().contains("unknown tool"), "got: {err}");

    client.cancellation_token().cancel();
}

#[tokio::test]
async fn unfiltered_session_sees_the_union() {
    let harness = start_harness().await;
    seed_three_servers(&harness).await;

    let (client, _recorder) = connect_client(&harness, "").await;
    assert_eq!(tool_names(&client).await, vec!["fetch", "query", "render"]);

    client.cancellation_token().cancel();
}
