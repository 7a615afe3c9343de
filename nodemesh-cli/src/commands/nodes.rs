use super::{print_json, send, ApiClient};
use anyhow::Result;
use nodemesh::api::NodesList;
use nodemesh::circuit_breaker::BreakerStatistics;
use nodemesh::types::{Capability, Node, NodeDescriptor, NodeStatus, NodeUpdate, RegistrationResponse};

pub async fn run_list(client: &ApiClient, include_retired: bool, json: bool) -> Result<()> {
    let path = format!("/nodes?include_retired={}", include_retired);
    let list: NodesList = send(client.get(&path)).await?;

    if json {
        return print_json(&list);
    }

    println!(
        "{:<38} {:<20} {:<10} {:<7} {:<10} {}",
        "ID", "NAME", "STATUS", "WEIGHT", "FAILURES", "URL"
    );
    println!("{}", "-".repeat(110));
    for node in &list.nodes {
        println!(
            "{:<38} {:<20} {:<10} {:<7} {:<10} {}",
            node.id,
            node.name,
            node.status.as_str(),
            node.weight,
            node.metrics.consecutive_failures,
            node.url
        );
    }
    println!();
    println!("{} node(s)", list.count);
    Ok(())
}

pub async fn run_get(client: &ApiClient, node_id: &str) -> Result<()> {
    let node: Node = send(client.get(&format!("/nodes/{}", node_id))).await?;
    print_json(&node)
}

pub async fn run_register(
    client: &ApiClient,
    name: &str,
    url: &str,
    capabilities: Vec<Capability>,
    registration_token: Option<&str>,
) -> Result<()> {
    let descriptor = NodeDescriptor {
        name: name.to_string(),
        url: url.to_string(),
        capabilities,
        metadata: Default::default(),
        weight: None,
        id: None,
    };
    let mut request = client.post("/register").json(&descriptor);
    if let Some(token) = registration_token {
        request = request.header(nodemesh::api::REGISTRATION_TOKEN_HEADER, token);
    }
    let registration: RegistrationResponse = send(request).await?;

    println!("Registered node {} ({})", registration.node.name, registration.node.id);
    println!("API key:       {}", registration.api_key);
    println!("Access token:  {}", registration.access_token);
    println!("Refresh token: {}", registration.refresh_token);
    println!("Expires:       {}", registration.access_expires_at);
    Ok(())
}

pub async fn run_set_status(client: &ApiClient, node_id: &str, status: NodeStatus) -> Result<()> {
    let update = NodeUpdate {
        status: Some(status),
        ..Default::default()
    };
    let node: Node = send(client.patch(&format!("/nodes/{}", node_id)).json(&update)).await?;
    println!("Node {} is now {}", node.id, node.status.as_str());
    Ok(())
}

pub async fn run_deactivate(client: &ApiClient, node_id: &str) -> Result<()> {
    let node: Node = send(client.delete(&format!("/nodes/{}", node_id))).await?;
    println!("Node {} deactivated, credentials revoked", node.id);
    Ok(())
}

pub async fn run_reset_breaker(client: &ApiClient, node_id: &str) -> Result<()> {
    let stats: BreakerStatistics =
        send(client.post(&format!("/nodes/{}/breaker/reset", node_id))).await?;
    println!("Breaker for {} reset ({:?})", node_id, stats.state);
    Ok(())
}
