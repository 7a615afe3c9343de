//! Relevance-based node pre-selection
//!
//! The coordinator narrows candidates with a [`NodeSelector`] when a query
//! sets [`FederatedQuery::relevant`], and keeps a [`ConversationContext`] per
//! [`FederatedQuery::conversation_id`] so follow-up turns reuse the nodes
//! that answered before.

use crate::cache::normalize_text;
use crate::federation::{AggregatedResult, FederatedQuery};
use crate::types::Node;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet, VecDeque};

/// Scores how relevant a node is for a query, higher is better
pub trait RelevanceScorer: Send + Sync {
    fn score(&self, query: &str, node: &Node) -> f64;
}

/// Scores by overlap between query terms and node metadata. Domain and
/// keyword tags count twice as much as words of the description.
#[derive(Debug, Default, Clone, Copy)]
pub struct TagOverlapScorer;

impl RelevanceScorer for TagOverlapScorer {
    fn score(&self, query: &str, node: &Node) -> f64 {
        let normalized = normalize_text(query);
        let terms: HashSet<&str> = normalized.split(' ').filter(|t| !t.is_empty()).collect();
        if terms.is_empty() {
            return 0.0;
        }

        let tags: HashSet<String> = node
            .metadata
            .domains
            .iter()
            .chain(node.metadata.keywords.iter())
            .chain(node.metadata.data_types.iter())
            .flat_map(|t| {
                normalize_text(t)
                    .split(' ')
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect();
        let description = normalize_text(&node.metadata.description);
        let words: HashSet<&str> = description.split(' ').collect();

        let total: f64 = terms
            .iter()
            .map(|t| {
                if tags.contains(*t) {
                    2.0
                } else if words.contains(t) {
                    1.0
                } else {
                    0.0
                }
            })
            .sum();
        total / (2.0 * terms.len() as f64)
    }
}

pub struct NodeSelector {
    scorer: Box<dyn RelevanceScorer>,
    min_score: f64,
    max_nodes: usize,
}

impl Default for NodeSelector {
    fn default() -> Self {
        Self::new(Box::new(TagOverlapScorer), 0.0, 0)
    }
}

impl NodeSelector {
    /// `max_nodes == 0` keeps every node scoring above `min_score`
    pub fn new(scorer: Box<dyn RelevanceScorer>, min_score: f64, max_nodes: usize) -> Self {
        Self {
            scorer,
            min_score,
            max_nodes,
        }
    }

    /// Most relevant nodes first. When no node scores above the threshold the
    /// input is returned unchanged so the query still reaches someone.
    pub fn narrow(&self, query: &str, nodes: &[Node]) -> Vec<Node> {
        let mut scored: Vec<(f64, &Node)> = nodes
            .iter()
            .map(|n| (self.scorer.score(query, n), n))
            .filter(|(s, _)| *s > self.min_score)
            .collect();
        if scored.is_empty() {
            return nodes.to_vec();
        }

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        if self.max_nodes > 0 {
            scored.truncate(self.max_nodes);
        }
        scored.into_iter().map(|(_, n)| n.clone()).collect()
    }
}

#[derive(Debug, Clone)]
struct Turn {
    useful_nodes: Vec<String>,
}

/// Remembers which nodes contributed to recent turns of a conversation
#[derive(Debug, Clone)]
pub struct ConversationContext {
    max_turns: usize,
    turns: VecDeque<Turn>,
}

impl ConversationContext {
    pub fn new(max_turns: usize) -> Self {
        Self {
            max_turns: max_turns.max(1),
            turns: VecDeque::new(),
        }
    }

    /// Remember the nodes that produced results for this turn
    pub fn record_turn(&mut self, result: &AggregatedResult) {
        let useful: BTreeSet<String> = result
            .results
            .iter()
            .filter_map(|r| r.source_node.clone())
            .collect();
        if self.turns.len() >= self.max_turns {
            self.turns.pop_front();
        }
        self.turns.push_back(Turn {
            useful_nodes: useful.into_iter().collect(),
        });
    }

    /// Nodes useful in any remembered turn, sorted; `None` when nothing is known
    pub fn preferred_nodes(&self) -> Option<Vec<String>> {
        let nodes: BTreeSet<&String> = self.turns.iter().flat_map(|t| t.useful_nodes.iter()).collect();
        if nodes.is_empty() {
            None
        } else {
            Some(nodes.into_iter().cloned().collect())
        }
    }

    /// Restrict a query to preferred nodes unless it already names its nodes
    pub fn apply(&self, mut query: FederatedQuery) -> FederatedQuery {
        if query.node_ids.as_ref().map(|ids| ids.is_empty()).unwrap_or(true) {
            query.node_ids = self.preferred_nodes();
        }
        query
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeMetadata, NodeMetrics, NodeStatus, SearchItem};
    use chrono::Utc;
    use serde_json::Map;

    fn node(id: &str, domains: &[&str], description: &str) -> Node {
        let now = Utc::now();
        Node {
            id: id.into(),
            slug: id.into(),
            name: id.into(),
            url: format!("http://{}", id),
            api_key_hash: String::new(),
            capabilities: vec![],
            metadata: NodeMetadata {
                description: description.into(),
                domains: domains.iter().map(|d| d.to_string()).collect(),
                data_types: vec![],
                keywords: vec![],
            },
            status: NodeStatus::Active,
            weight: 1,
            metrics: NodeMetrics::default(),
            created_at: now,
            updated_at: now,
            retired_at: None,
        }
    }

    #[test]
    fn test_tag_overlap_scores() {
        let scorer = TagOverlapScorer;
        let n = node("a", &["Finance"], "quarterly reports");
        assert_eq!(scorer.score("finance", &n), 1.0);
        assert_eq!(scorer.score("reports", &n), 0.5);
        assert_eq!(scorer.score("weather", &n), 0.0);
    }

    #[test]
    fn test_narrow_orders_and_limits() {
        let selector = NodeSelector::new(Box::new(TagOverlapScorer), 0.0, 1);
        let nodes = vec![
            node("a", &["legal"], ""),
            node("b", &["finance"], ""),
            node("c", &[], "finance news"),
        ];
        let picked = selector.narrow("finance", &nodes);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, "b");
    }

    #[test]
    fn test_narrow_falls_back_to_all() {
        let selector = NodeSelector::default();
        let nodes = vec![node("a", &["legal"], ""), node("b", &["finance"], "")];
        assert_eq!(selector.narrow("astronomy", &nodes).len(), 2);
    }

    #[test]
    fn test_conversation_context() {
        let mut ctx = ConversationContext::new(2);
        assert!(ctx.preferred_nodes().is_none());

        let hit = |node: &str| SearchItem {
            id: "x".into(),
            content: "x".into(),
            score: 1.0,
            metadata: Map::new(),
            source_node: Some(node.into()),
        };
        ctx.record_turn(&AggregatedResult {
            results: vec![hit("n2"), hit("n1")],
            ..AggregatedResult::default()
        });
        assert_eq!(ctx.preferred_nodes(), Some(vec!["n1".into(), "n2".into()]));

        let q = ctx.apply(FederatedQuery::new("follow up"));
        assert_eq!(q.node_ids, Some(vec!["n1".to_string(), "n2".to_string()]));

        let explicit = ctx.apply(FederatedQuery::new("x").with_nodes(vec!["n9".into()]));
        assert_eq!(explicit.node_ids, Some(vec!["n9".to_string()]));

        ctx.record_turn(&AggregatedResult::default());
        ctx.record_turn(&AggregatedResult::default());
        assert!(ctx.preferred_nodes().is_none());
    }
}
