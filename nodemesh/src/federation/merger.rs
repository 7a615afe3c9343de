//! Merging of per-node search results
//!
//! Items are tagged with the node that produced them, deduplicated by a
//! fingerprint of their content (keeping the best-scored copy) and ordered by
//! score, then node id, then the item's rank on its node. The output does not
//! depend on the order in which node answers arrived.

use crate::cache::normalize_text;
use crate::types::SearchItem;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Results returned by one node
#[derive(Debug, Clone)]
pub struct NodeResults {
    pub node_id: String,
    pub items: Vec<SearchItem>,
}

/// Output of [`ResultMerger::merge`]
#[derive(Debug, Clone)]
pub struct MergedResults {
    pub results: Vec<SearchItem>,
    /// Items received before deduplication
    pub total: usize,
    pub duplicates_removed: usize,
}

/// Fingerprint of an item's content: sha256 of the lowercased,
/// whitespace-collapsed text
pub fn content_fingerprint(content: &str) -> String {
    hex::encode(Sha256::digest(normalize_text(content).as_bytes()))
}

#[derive(Debug, Clone)]
struct Ranked {
    item: SearchItem,
    node_id: String,
    rank: usize,
}

fn compare(a: &Ranked, b: &Ranked) -> Ordering {
    b.item
        .score
        .partial_cmp(&a.item.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.node_id.cmp(&b.node_id))
        .then_with(|| a.rank.cmp(&b.rank))
}

#[derive(Debug, Default)]
pub struct ResultMerger;

impl ResultMerger {
    pub fn new() -> Self {
        Self
    }

    pub fn merge(&self, branches: Vec<NodeResults>, limit: usize) -> MergedResults {
        let mut total = 0;
        let mut best: HashMap<String, Ranked> = HashMap::new();

        for branch in branches {
            for (rank, mut item) in branch.items.into_iter().enumerate() {
                total += 1;
                item.source_node = Some(branch.node_id.clone());
                let candidate = Ranked {
                    item,
                    node_id: branch.node_id.clone(),
                    rank,
                };
                let fingerprint = content_fingerprint(&candidate.item.content);
                match best.get_mut(&fingerprint) {
                    Some(existing) => {
                        if compare(&candidate, existing) == Ordering::Less {
                            *existing = candidate;
                        }
                    }
                    None => {
                        best.insert(fingerprint, candidate);
                    }
                }
            }
        }

        let duplicates_removed = total - best.len();
        let mut ranked: Vec<Ranked> = best.into_values().collect();
        ranked.sort_by(compare);
        ranked.truncate(limit);

        MergedResults {
            results: ranked.into_iter().map(|r| r.item).collect(),
            total,
            duplicates_removed,
        }
    }
}
