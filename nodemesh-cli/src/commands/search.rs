use super::{print_json, send, ApiClient};
use anyhow::Result;
use nodemesh::api::{FederatedActionRequest, FederatedActionResponse};
use nodemesh::{AggregatedResult, FederatedQuery};

pub async fn run_search(
    client: &ApiClient,
    query: &str,
    node_ids: Option<Vec<String>>,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let mut request = FederatedQuery::new(query);
    request.node_ids = node_ids;
    request.limit = limit;

    let resp = client.post("/federated/search").json(&request).send().await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("Search failed ({}): {}", status, body);
    }
    let cache = resp
        .headers()
        .get(nodemesh::api::CACHE_STATUS_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("miss")
        .to_string();
    let result: AggregatedResult = resp.json().await?;

    if json {
        return print_json(&result);
    }

    println!(
        "{} result(s) from {}/{} node(s), cache {}",
        result.count, result.nodes_searched, result.nodes_attempted, cache
    );
    if result.is_partial {
        println!("Partial result");
    }
    for skipped in &result.nodes_skipped {
        println!("  skipped {} (circuit open)", skipped);
    }
    for failure in &result.failures {
        println!("  failed  {}: {}", failure.node_id, failure.reason);
    }
    println!();
    for item in &result.results {
        println!(
            "{:>6.3}  {:<24} {}",
            item.score,
            item.source_node.as_deref().unwrap_or("-"),
            item.content
        );
    }
    Ok(())
}

pub async fn run_action(
    client: &ApiClient,
    action: &str,
    params: serde_json::Value,
    node_id: Option<String>,
    sequential: bool,
) -> Result<()> {
    let request = FederatedActionRequest {
        action: action.to_string(),
        params,
        node_id,
        parallel: !sequential,
    };
    let response: FederatedActionResponse =
        send(client.post("/federated/actions").json(&request)).await?;

    for result in &response.results {
        let state = if result.skipped {
            "skipped"
        } else if result.success {
            "ok"
        } else {
            "failed"
        };
        println!(
            "{:<38} {:<8} {:>6}ms {}",
            result.node_id,
            state,
            result.duration_ms,
            result.error.as_deref().unwrap_or("")
        );
    }
    println!();
    println!(
        "{} succeeded, {} failed, {} skipped",
        response.succeeded, response.failed, response.skipped
    );
    Ok(())
}
