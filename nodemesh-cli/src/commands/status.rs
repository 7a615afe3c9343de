use super::{print_json, send, ApiClient};
use anyhow::Result;
use nodemesh::api::RequestsList;
use nodemesh::mesh::StatusReport;
use nodemesh::types::HealthResponse;

pub async fn run_health(client: &ApiClient) -> Result<()> {
    let health: HealthResponse = send(client.get("/health")).await?;
    println!(
        "{} {} {} ({})",
        health.status,
        health.node_id.as_deref().unwrap_or("-"),
        health.role.as_deref().unwrap_or("-"),
        health.version
    );
    Ok(())
}

pub async fn run_status(client: &ApiClient, json: bool) -> Result<()> {
    let report: StatusReport = send(client.get("/status")).await?;
    if json {
        return print_json(&report);
    }

    println!("Node Status");
    println!("===========");
    println!("Node:    {} ({})", report.node_id, report.role);
    println!("Version: {}", report.version);
    println!("Uptime:  {}s", report.uptime_secs);
    println!(
        "Nodes:   {} total, {} active, {} error, {} inactive",
        report.nodes.total, report.nodes.active, report.nodes.error, report.nodes.inactive
    );
    println!("Open connections: {}", report.open_connections);
    println!(
        "Cache:   {} entries, {} hits, {} misses",
        report.cache.entries, report.cache.hits, report.cache.misses
    );
    if !report.breakers.is_empty() {
        println!();
        println!("{:<38} {:<10} {:<10}", "NODE", "BREAKER", "FAILURES");
        println!("{}", "-".repeat(60));
        for stats in &report.breakers {
            println!(
                "{:<38} {:<10} {:<10}",
                stats.node_id,
                format!("{:?}", stats.state),
                stats.failure_count
            );
        }
    }
    Ok(())
}

pub async fn run_requests(
    client: &ApiClient,
    limit: usize,
    node_id: Option<&str>,
    correlation_id: Option<&str>,
) -> Result<()> {
    let mut path = format!("/requests?limit={}", limit);
    if let Some(node_id) = node_id {
        path.push_str(&format!("&node_id={}", node_id));
    }
    if let Some(correlation_id) = correlation_id {
        path.push_str(&format!("&correlation_id={}", correlation_id));
    }
    let list: RequestsList = send(client.get(&path)).await?;
    print_json(&list.records)
}
