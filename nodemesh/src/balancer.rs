//! Load balancing across candidate nodes
//!
//! Selection is a pure function of the candidate list and strategy, except
//! for the round-robin cursor. Nodes whose circuit breaker would reject a
//! call are never selected.

use crate::circuit_breaker::CircuitBreaker;
use crate::types::Node;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Strategy for ordering and picking nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Rotate through nodes in registration order
    #[default]
    RoundRobin,
    /// Fewest open connections first
    LeastConnections,
    /// Lowest average response time first
    ResponseTime,
    /// Random, proportional to node weight
    Weighted,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastConnections => "least_connections",
            Strategy::ResponseTime => "response_time",
            Strategy::Weighted => "weighted",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct LoadBalancer {
    breaker: Arc<CircuitBreaker>,
    /// Round-robin cursor per candidate group
    cursors: Mutex<HashMap<String, usize>>,
}

impl LoadBalancer {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            breaker,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Pick up to `count` nodes (0 means all eligible nodes)
    pub fn select(&self, nodes: &[Node], count: usize, strategy: Strategy) -> Vec<Node> {
        self.select_with_rng(nodes, count, strategy, &mut rand::thread_rng())
    }

    pub fn select_with_rng<R: Rng + ?Sized>(
        &self,
        nodes: &[Node],
        count: usize,
        strategy: Strategy,
        rng: &mut R,
    ) -> Vec<Node> {
        let eligible: Vec<&Node> = nodes
            .iter()
            .filter(|n| self.breaker.is_available(&n.id))
            .collect();
        if eligible.is_empty() {
            return Vec::new();
        }
        let take = if count == 0 || count >= eligible.len() {
            eligible.len()
        } else {
            count
        };

        let ordered: Vec<&Node> = match strategy {
            Strategy::RoundRobin => self.round_robin(eligible, take),
            Strategy::LeastConnections => {
                let mut sorted = eligible;
                sorted.sort_by(|a, b| {
                    a.metrics
                        .open_connections
                        .cmp(&b.metrics.open_connections)
                        .then_with(|| a.id.cmp(&b.id))
                });
                sorted
            }
            Strategy::ResponseTime => order_by_response_time(eligible),
            Strategy::Weighted => weighted_order(eligible, rng),
        };

        ordered.into_iter().take(take).cloned().collect()
    }

    fn round_robin<'a>(&self, eligible: Vec<&'a Node>, take: usize) -> Vec<&'a Node> {
        let group = eligible
            .iter()
            .map(|n| n.id.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let len = eligible.len();

        let start = {
            let mut cursors = self.cursors.lock();
            let cursor = cursors.entry(group).or_insert(0);
            let start = *cursor % len;
            *cursor = (start + take) % len;
            start
        };

        (0..len).map(|i| eligible[(start + i) % len]).collect()
    }
}

fn order_by_response_time(eligible: Vec<&Node>) -> Vec<&Node> {
    let mut known: Vec<f64> = eligible
        .iter()
        .filter_map(|n| n.metrics.avg_response_ms)
        .collect();
    known.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let median = if known.is_empty() {
        0.0
    } else if known.len() % 2 == 1 {
        known[known.len() / 2]
    } else {
        (known[known.len() / 2 - 1] + known[known.len() / 2]) / 2.0
    };

    let mut sorted = eligible;
    sorted.sort_by(|a, b| {
        let la = a.metrics.avg_response_ms.unwrap_or(median);
        let lb = b.metrics.avg_response_ms.unwrap_or(median);
        la.partial_cmp(&lb)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    sorted
}

/// Weighted sampling without replacement (Efraimidis-Spirakis):
/// each node gets key ln(u) / weight and nodes are ordered by key descending.
fn weighted_order<'a, R: Rng + ?Sized>(eligible: Vec<&'a Node>, rng: &mut R) -> Vec<&'a Node> {
    let mut keyed: Vec<(f64, &Node)> = eligible
        .into_iter()
        .filter(|n| n.weight > 0)
        .map(|n| {
            let u: f64 = 1.0 - rng.gen::<f64>();
            (u.ln() / n.weight as f64, n)
        })
        .collect();
    keyed.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.1.id.cmp(&b.1.id))
    });
    keyed.into_iter().map(|(_, n)| n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::types::{NodeMetadata, NodeMetrics, NodeStatus};
    use chrono::Utc;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn node(id: &str) -> Node {
        let now = Utc::now();
        Node {
            id: id.into(),
            slug: id.into(),
            name: id.into(),
            url: format!("http://{}", id),
            api_key_hash: String::new(),
            capabilities: vec![],
            metadata: NodeMetadata::default(),
            status: NodeStatus::Active,
            weight: 1,
            metrics: NodeMetrics::default(),
            created_at: now,
            updated_at: now,
            retired_at: None,
        }
    }

    fn balancer() -> (LoadBalancer, Arc<CircuitBreaker>) {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        }));
        (LoadBalancer::new(Arc::clone(&breaker)), breaker)
    }

    fn ids(nodes: &[Node]) -> Vec<&str> {
        nodes.iter().map(|n| n.id.as_str()).collect()
    }

    #[test]
    fn test_round_robin_rotates() {
        let (lb, _) = balancer();
        let nodes = vec![node("a"), node("b"), node("c")];
        assert_eq!(ids(&lb.select(&nodes, 1, Strategy::RoundRobin)), vec!["a"]);
        assert_eq!(ids(&lb.select(&nodes, 1, Strategy::RoundRobin)), vec!["b"]);
        assert_eq!(ids(&lb.select(&nodes, 1, Strategy::RoundRobin)), vec!["c"]);
        assert_eq!(ids(&lb.select(&nodes, 1, Strategy::RoundRobin)), vec!["a"]);
    }

    #[test]
    fn test_zero_count_returns_all() {
        let (lb, _) = balancer();
        let nodes = vec![node("a"), node("b")];
        assert_eq!(lb.select(&nodes, 0, Strategy::LeastConnections).len(), 2);
        assert_eq!(lb.select(&nodes, 10, Strategy::ResponseTime).len(), 2);
    }

    #[test]
    fn test_skips_open_breakers() {
        let (lb, breaker) = balancer();
        breaker.record_failure("b");
        let nodes = vec![node("a"), node("b"), node("c")];
        assert_eq!(ids(&lb.select(&nodes, 0, Strategy::RoundRobin)), vec!["a", "c"]);
    }

    #[test]
    fn test_least_connections_tie_by_id() {
        let (lb, _) = balancer();
        let mut a = node("a");
        a.metrics.open_connections = 3;
        let mut b = node("b");
        b.metrics.open_connections = 1;
        let mut c = node("c");
        c.metrics.open_connections = 1;
        let picked = lb.select(&[a, c, b], 0, Strategy::LeastConnections);
        assert_eq!(ids(&picked), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_response_time_uses_median_for_unknown() {
        let (lb, _) = balancer();
        let mut a = node("a");
        a.metrics.avg_response_ms = Some(10.0);
        let mut b = node("b");
        b.metrics.avg_response_ms = Some(50.0);
        let mut c = node("c");
        c.metrics.avg_response_ms = Some(100.0);
        let d = node("d");
        let picked = lb.select(&[d, c, b, a], 0, Strategy::ResponseTime);
        // d has no history and ranks at the median (50), after b by id
        assert_eq!(ids(&picked), vec!["a", "b", "d", "c"]);
    }

    #[test]
    fn test_weighted_never_picks_zero_weight() {
        let (lb, _) = balancer();
        let mut zero = node("zero");
        zero.weight = 0;
        let nodes = vec![node("a"), zero];
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let picked = lb.select_with_rng(&nodes, 0, Strategy::Weighted, &mut rng);
            assert_eq!(ids(&picked), vec!["a"]);
        }
    }

    #[test]
    fn test_weighted_proportional() {
        let (lb, _) = balancer();
        let mut heavy = node("heavy");
        heavy.weight = 2;
        let nodes = vec![heavy, node("light")];
        let mut rng = StdRng::seed_from_u64(42);

        let heavy_picks = (0..1000)
            .filter(|_| lb.select_with_rng(&nodes, 1, Strategy::Weighted, &mut rng)[0].id == "heavy")
            .count();
        assert!((600..=730).contains(&heavy_picks), "heavy picked {} times", heavy_picks);
    }

    #[test]
    fn test_strategy_serde() {
        let s: Strategy = serde_json::from_str(r#""response_time""#).unwrap();
        assert_eq!(s, Strategy::ResponseTime);
        assert_eq!(Strategy::default().to_string(), "round_robin");
    }
}
