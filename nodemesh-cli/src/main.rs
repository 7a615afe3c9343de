mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commands::ApiClient;
use nodemesh::types::{Capability, NodeStatus};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "nodemesh")]
#[command(about = "nodemesh CLI - node administration and federated queries")]
#[command(version)]
struct Cli {
    /// Node API URL
    #[arg(long, env = "NODEMESH_URL", default_value = "http://127.0.0.1:8640", global = true)]
    url: String,

    /// Bearer credential. Node and federation commands need an operator API key
    #[arg(long, env = "NODEMESH_TOKEN", global = true)]
    token: Option<String>,

    /// Print raw JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check node liveness
    Health,

    /// Show node status: registry, breakers, cache
    Status,

    /// Manage registered nodes
    Nodes {
        #[command(subcommand)]
        action: NodesAction,
    },

    /// Register a node with a master
    Register {
        /// Display name
        #[arg(long)]
        name: String,

        /// Base URL the master uses to reach the node
        #[arg(long)]
        node_url: String,

        /// Capabilities (comma-separated)
        #[arg(long, value_delimiter = ',', default_value = "search,actions")]
        capabilities: Vec<String>,

        /// Shared registration token
        #[arg(long, env = "NODEMESH_REGISTRATION_TOKEN")]
        registration_token: Option<String>,
    },

    /// Run a federated search
    Search {
        query: String,

        /// Restrict to these node ids (comma-separated)
        #[arg(long, value_delimiter = ',')]
        nodes: Option<Vec<String>>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Run an action on one node or every capable node
    Action {
        action: String,

        /// JSON parameters
        #[arg(long, default_value = "{}")]
        params: String,

        /// Run on this node only
        #[arg(long)]
        node: Option<String>,

        /// Call nodes one at a time
        #[arg(long)]
        sequential: bool,
    },

    /// Show recorded node-to-node requests
    Requests {
        #[arg(short, long, default_value = "50")]
        limit: usize,

        #[arg(long)]
        node: Option<String>,

        #[arg(long)]
        correlation_id: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum NodesAction {
    /// List nodes
    List {
        /// Include deactivated nodes
        #[arg(long)]
        all: bool,
    },
    /// Show one node
    Get { id: String },
    /// Put a node into maintenance
    Maintenance { id: String },
    /// Return a node to service
    Activate { id: String },
    /// Deactivate a node and revoke its credentials
    Deactivate { id: String },
    /// Close a node's circuit breaker
    ResetBreaker { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let client = ApiClient::new(&cli.url, cli.token);
    tracing::debug!("Using node API at {}", cli.url);

    match cli.command {
        Commands::Health => commands::status::run_health(&client).await?,
        Commands::Status => commands::status::run_status(&client, cli.json).await?,
        Commands::Nodes { action } => match action {
            NodesAction::List { all } => {
                commands::nodes::run_list(&client, all, cli.json).await?
            }
            NodesAction::Get { id } => commands::nodes::run_get(&client, &id).await?,
            NodesAction::Maintenance { id } => {
                commands::nodes::run_set_status(&client, &id, NodeStatus::Maintenance).await?
            }
            NodesAction::Activate { id } => {
                commands::nodes::run_set_status(&client, &id, NodeStatus::Active).await?
            }
            NodesAction::Deactivate { id } => {
                commands::nodes::run_deactivate(&client, &id).await?
            }
            NodesAction::ResetBreaker { id } => {
                commands::nodes::run_reset_breaker(&client, &id).await?
            }
        },
        Commands::Register {
            name,
            node_url,
            capabilities,
            registration_token,
        } => {
            let capabilities = capabilities.into_iter().map(Capability::from).collect();
            commands::nodes::run_register(
                &client,
                &name,
                &node_url,
                capabilities,
                registration_token.as_deref(),
            )
            .await?
        }
        Commands::Search {
            query,
            nodes,
            limit,
        } => commands::search::run_search(&client, &query, nodes, limit, cli.json).await?,
        Commands::Action {
            action,
            params,
            node,
            sequential,
        } => {
            let params: serde_json::Value =
                serde_json::from_str(&params).context("--params must be valid JSON")?;
            commands::search::run_action(&client, &action, params, node, sequential).await?
        }
        Commands::Requests {
            limit,
            node,
            correlation_id,
        } => {
            commands::status::run_requests(
                &client,
                limit,
                node.as_deref(),
                correlation_id.as_deref(),
            )
            .await?
        }
    }

    Ok(())
}
