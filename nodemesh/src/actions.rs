//! Remote action dispatch and compensating transactions
//!
//! A transaction runs its steps in order. When a step fails, every committed
//! step before it is compensated in reverse order. Steps whose compensation
//! is missing or fails are reported as needing manual intervention.

use crate::circuit_breaker::CircuitBreaker;
use crate::client::{CallContext, NodeTransport};
use crate::config::FederationConfig;
use crate::error::{Error, Result};
use crate::local::ActionRegistry;
use crate::metrics::{self, RpcTimer};
use crate::registry::NodeRegistry;
use crate::trace::{NodeRequestRecord, RequestLog, RequestOutcome};
use crate::types::{ActionRequest, Capability};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Outcome of an action on one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub node_id: String,
    pub action: String,
    pub success: bool,
    /// Not attempted because the node was unavailable
    pub skipped: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Action that undoes a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compensation {
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionStep {
    pub node_id: String,
    pub action: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub compensation: Option<Compensation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Committed,
    Failed,
    RolledBack,
    RollbackFailed,
    /// Committed, but nothing can undo it
    NoCompensator,
    NotAttempted,
}

impl StepState {
    pub fn needs_manual_intervention(&self) -> bool {
        matches!(self, StepState::RollbackFailed | StepState::NoCompensator)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub index: usize,
    pub node_id: String,
    pub action: String,
    pub state: StepState,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionResult {
    pub transaction_id: String,
    pub success: bool,
    /// Index of the step that failed, if any
    pub failed_step: Option<usize>,
    pub steps: Vec<StepReport>,
    pub duration_ms: u64,
}

impl TransactionResult {
    /// Steps left in a state an operator has to resolve
    pub fn manual_intervention(&self) -> Vec<&StepReport> {
        self.steps
            .iter()
            .filter(|s| s.state.needs_manual_intervention())
            .collect()
    }
}

/// Executes actions on remote nodes
pub struct RemoteActionDispatcher {
    local_node_id: String,
    config: FederationConfig,
    registry: Arc<NodeRegistry>,
    breaker: Arc<CircuitBreaker>,
    transport: Arc<dyn NodeTransport>,
    local_actions: Arc<ActionRegistry>,
    requests: Arc<RequestLog>,
}

impl RemoteActionDispatcher {
    pub fn new(
        local_node_id: impl Into<String>,
        config: FederationConfig,
        registry: Arc<NodeRegistry>,
        breaker: Arc<CircuitBreaker>,
        transport: Arc<dyn NodeTransport>,
        local_actions: Arc<ActionRegistry>,
        requests: Arc<RequestLog>,
    ) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            config,
            registry,
            breaker,
            transport,
            local_actions,
            requests,
        }
    }

    fn context(&self, correlation_id: Option<&str>) -> CallContext {
        CallContext::new(
            correlation_id
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            self.config.request_timeout(),
        )
    }

    /// Run an action on one node. The local node id runs the action in-process.
    pub async fn execute_on(
        &self,
        node_id: &str,
        action: &str,
        params: Value,
        correlation_id: Option<&str>,
    ) -> Result<ActionResult> {
        let ctx = self.context(correlation_id);
        self.execute_with_context(node_id, action, params, &ctx).await
    }

    async fn execute_with_context(
        &self,
        node_id: &str,
        action: &str,
        params: Value,
        ctx: &CallContext,
    ) -> Result<ActionResult> {
        let start = Instant::now();
        let execution_error = |reason: String| Error::ActionExecution {
            node_id: node_id.to_string(),
            action: action.to_string(),
            reason,
        };

        if node_id == self.local_node_id {
            let result = self
                .local_actions
                .execute(action, params)
                .await
                .map_err(|e| execution_error(e.to_string()))?;
            return Ok(ActionResult {
                node_id: node_id.to_string(),
                action: action.to_string(),
                success: true,
                skipped: false,
                result,
                error: None,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        let node = self
            .registry
            .get(node_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
        if !node.is_active() {
            return Err(Error::NodeUnavailable(format!(
                "{} is {}",
                node_id,
                node.status.as_str()
            )));
        }
        if !node.has_capability(&Capability::Actions) {
            return Err(Error::NodeUnavailable(format!(
                "{} does not accept actions",
                node_id
            )));
        }
        if !self.breaker.allow(node_id) {
            metrics::record_rpc_skipped("action", node_id);
            return Err(Error::NodeUnavailable(format!(
                "{} circuit is open",
                node_id
            )));
        }

        let request = ActionRequest {
            action: action.to_string(),
            params,
        };
        let call_ctx = ctx.child();
        let record =
            NodeRequestRecord::outbound(&call_ctx.request_id, &call_ctx.correlation_id, node_id, action);
        let timer = RpcTimer::new("action", node_id);
        let _connection = self.registry.begin_request(node_id);

        let outcome = match tokio::time::timeout(
            call_ctx.timeout,
            self.transport.execute(&node, &request, &call_ctx),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(Error::Timeout(format!(
                "node {} did not answer within {}ms",
                node_id,
                call_ctx.timeout.as_millis()
            ))),
        };

        match outcome {
            Ok(response) => {
                let elapsed = timer.success();
                self.breaker.record_success(node_id);
                self.registry
                    .record_latency(node_id, elapsed.as_secs_f64() * 1000.0);
                if response.success {
                    self.requests.record(record.finish(RequestOutcome::Success));
                    debug!("Action '{}' succeeded on node {}", action, node_id);
                    Ok(ActionResult {
                        node_id: node_id.to_string(),
                        action: action.to_string(),
                        success: true,
                        skipped: false,
                        result: response.result,
                        error: None,
                        duration_ms: elapsed.as_millis() as u64,
                    })
                } else {
                    let reason = match &response.result {
                        Value::String(s) => s.clone(),
                        Value::Null => "node reported failure".to_string(),
                        other => other.to_string(),
                    };
                    self.requests.record(record.finish(RequestOutcome::Failure {
                        reason: reason.clone(),
                    }));
                    Err(execution_error(reason))
                }
            }
            Err(e) => {
                timer.error(e.error_type());
                if e.is_node_fault() {
                    self.breaker.record_failure(node_id);
                    self.registry.record_call_failure(node_id);
                } else {
                    self.breaker.record_success(node_id);
                }
                let record_outcome = match &e {
                    Error::Timeout(_) => RequestOutcome::Timeout,
                    other => RequestOutcome::Failure {
                        reason: other.to_string(),
                    },
                };
                self.requests.record(record.finish(record_outcome));
                warn!("Action '{}' failed on node {}: {}", action, node_id, e);
                Err(execution_error(e.to_string()))
            }
        }
    }

    async fn report(&self, node_id: String, action: &str, params: Value, ctx: &CallContext) -> ActionResult {
        let start = Instant::now();
        match self.execute_with_context(&node_id, action, params, ctx).await {
            Ok(result) => result,
            Err(e) => ActionResult {
                skipped: matches!(e, Error::NodeUnavailable(_)),
                node_id,
                action: action.to_string(),
                success: false,
                result: Value::Null,
                error: Some(e.to_string()),
                duration_ms: start.elapsed().as_millis() as u64,
            },
        }
    }

    /// Run an action on every active remote node accepting actions
    pub async fn execute_on_all(
        &self,
        action: &str,
        params: Value,
        parallel: bool,
        correlation_id: Option<&str>,
    ) -> Vec<ActionResult> {
        let ctx = self.context(correlation_id);
        let targets: Vec<String> = self
            .registry
            .active(Some(&Capability::Actions))
            .iter()
            .filter(|n| n.id != self.local_node_id)
            .map(|n| n.id.clone())
            .collect();

        info!(
            correlation_id = %ctx.correlation_id,
            "Executing '{}' on {} node(s) ({})",
            action,
            targets.len(),
            if parallel { "parallel" } else { "sequential" }
        );

        let mut results = if parallel {
            let ctx = &ctx;
            stream::iter(targets)
                .map(|id| self.report(id, action, params.clone(), ctx))
                .buffer_unordered(self.config.max_parallel_requests.max(1))
                .collect::<Vec<_>>()
                .await
        } else {
            let mut results = Vec::with_capacity(targets.len());
            for id in targets {
                results.push(self.report(id, action, params.clone(), &ctx).await);
            }
            results
        };

        results.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        results
    }

    /// Run steps in order, compensating committed steps if one fails
    pub async fn execute_transaction(
        &self,
        steps: Vec<TransactionStep>,
        correlation_id: Option<&str>,
    ) -> Result<TransactionResult> {
        if steps.is_empty() {
            return Err(Error::InvalidRequest(
                "transaction must have at least one step".into(),
            ));
        }

        let start = Instant::now();
        let ctx = self.context(correlation_id);
        let transaction_id = uuid::Uuid::new_v4().to_string();
        info!(
            transaction_id = %transaction_id,
            correlation_id = %ctx.correlation_id,
            "Starting transaction with {} step(s)",
            steps.len()
        );

        let mut reports: Vec<StepReport> = steps
            .iter()
            .enumerate()
            .map(|(index, step)| StepReport {
                index,
                node_id: step.node_id.clone(),
                action: step.action.clone(),
                state: StepState::NotAttempted,
                result: Value::Null,
                error: None,
                compensation_error: None,
            })
            .collect();

        let mut failed_step = None;
        for (index, step) in steps.iter().enumerate() {
            match self
                .execute_with_context(&step.node_id, &step.action, step.params.clone(), &ctx)
                .await
            {
                Ok(result) => {
                    reports[index].state = StepState::Committed;
                    reports[index].result = result.result;
                }
                Err(e) => {
                    warn!(
                        transaction_id = %transaction_id,
                        "Step {} ('{}' on {}) failed: {}",
                        index,
                        step.action,
                        step.node_id,
                        e
                    );
                    reports[index].state = StepState::Failed;
                    reports[index].error = Some(e.to_string());
                    failed_step = Some(index);
                    break;
                }
            }
        }

        if let Some(failed) = failed_step {
            for index in (0..failed).rev() {
                let step = &steps[index];
                match &step.compensation {
                    None => {
                        reports[index].state = StepState::NoCompensator;
                    }
                    Some(comp) => {
                        match self
                            .execute_with_context(&step.node_id, &comp.action, comp.params.clone(), &ctx)
                            .await
                        {
                            Ok(_) => reports[index].state = StepState::RolledBack,
                            Err(e) => {
                                reports[index].state = StepState::RollbackFailed;
                                reports[index].compensation_error = Some(e.to_string());
                            }
                        }
                    }
                }
            }
        }

        let result = TransactionResult {
            transaction_id,
            success: failed_step.is_none(),
            failed_step,
            steps: reports,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        let stuck = result.manual_intervention();
        if !stuck.is_empty() {
            let summary: Vec<String> = stuck
                .iter()
                .map(|s| format!("#{} {} on {} ({:?})", s.index, s.action, s.node_id, s.state))
                .collect();
            error!(
                transaction_id = %result.transaction_id,
                "Transaction needs manual intervention: {}",
                summary.join(", ")
            );
            metrics::record_transaction("manual_intervention");
            return Err(Error::PartialTransactionFailure(Box::new(result)));
        }

        if result.success {
            info!(transaction_id = %result.transaction_id, "Transaction committed");
            metrics::record_transaction("committed");
        } else {
            info!(transaction_id = %result.transaction_id, "Transaction rolled back");
            metrics::record_transaction("rolled_back");
        }
        Ok(result)
    }
}
