//! Node request records
//!
//! Every node-to-node call, outbound or inbound, leaves a [`NodeRequestRecord`]
//! in a bounded in-memory log and an event on the `nodemesh::audit` tracing
//! target.

use crate::auth::AuthMethod;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RequestOutcome {
    Success,
    Failure { reason: String },
    Timeout,
    Cancelled,
}

impl RequestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestOutcome::Success => "success",
            RequestOutcome::Failure { .. } => "failure",
            RequestOutcome::Timeout => "timeout",
            RequestOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRequestRecord {
    pub request_id: String,
    pub correlation_id: String,
    /// Remote node for outbound calls, caller for inbound ones
    pub node_id: String,
    pub action_type: String,
    pub direction: Direction,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: RequestOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<AuthMethod>,
}

impl NodeRequestRecord {
    /// Start a record for an outbound call; finish it with [`finish`](Self::finish)
    pub fn outbound(
        request_id: &str,
        correlation_id: &str,
        node_id: &str,
        action_type: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id: request_id.to_string(),
            correlation_id: correlation_id.to_string(),
            node_id: node_id.to_string(),
            action_type: action_type.to_string(),
            direction: Direction::Outbound,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            outcome: RequestOutcome::Success,
            auth_method: None,
        }
    }

    /// Start a record for a call received from another node
    pub fn inbound(
        request_id: &str,
        correlation_id: &str,
        caller: &str,
        action_type: &str,
        auth_method: AuthMethod,
    ) -> Self {
        Self {
            direction: Direction::Inbound,
            auth_method: Some(auth_method),
            ..Self::outbound(request_id, correlation_id, caller, action_type)
        }
    }

    pub fn finish(mut self, outcome: RequestOutcome) -> Self {
        self.finished_at = Utc::now();
        self.duration_ms = (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
        self.outcome = outcome;
        self
    }
}

/// Bounded, append-only log of recent request records
pub struct RequestLog {
    capacity: usize,
    records: Mutex<VecDeque<NodeRequestRecord>>,
}

impl RequestLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn record(&self, record: NodeRequestRecord) {
        tracing::info!(
            target: "nodemesh::audit",
            request_id = %record.request_id,
            correlation_id = %record.correlation_id,
            node_id = %record.node_id,
            action_type = %record.action_type,
            direction = ?record.direction,
            outcome = record.outcome.as_str(),
            duration_ms = record.duration_ms,
            auth_method = record.auth_method.map(|m| m.as_str()).unwrap_or("-"),
            "node request"
        );

        let mut records = self.records.lock();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Most recent records first, optionally filtered by node
    pub fn recent(&self, limit: usize, node_id: Option<&str>) -> Vec<NodeRequestRecord> {
        self.records
            .lock()
            .iter()
            .rev()
            .filter(|r| node_id.map(|id| r.node_id == id).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }

    /// All records sharing a correlation id, oldest first
    pub fn by_correlation(&self, correlation_id: &str) -> Vec<NodeRequestRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.correlation_id == correlation_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(node: &str, correlation: &str) -> NodeRequestRecord {
        NodeRequestRecord::outbound("r", correlation, node, "search").finish(RequestOutcome::Success)
    }

    #[test]
    fn test_bounded() {
        let log = RequestLog::new(2);
        log.record(record("a", "c1"));
        log.record(record("b", "c1"));
        log.record(record("c", "c2"));
        assert_eq!(log.len(), 2);
        let recent: Vec<String> = log.recent(10, None).into_iter().map(|r| r.node_id).collect();
        assert_eq!(recent, vec!["c", "b"]);
    }

    #[test]
    fn test_filters() {
        let log = RequestLog::new(10);
        log.record(record("a", "c1"));
        log.record(record("b", "c1"));
        log.record(record("a", "c2"));
        assert_eq!(log.recent(10, Some("a")).len(), 2);
        assert_eq!(log.by_correlation("c1").len(), 2);
    }

    #[test]
    fn test_outcome_serde() {
        let json = serde_json::to_value(RequestOutcome::Failure {
            reason: "boom".into(),
        })
        .unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["reason"], "boom");
    }
}
