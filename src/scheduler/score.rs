//! Bin-packing score.
//!
//! A node scores higher the fuller it would be after taking the job, so small
//! jobs are packed onto busy nodes and large free blocks stay available
//! elsewhere.

use crate::model::{Node, Resource};

/// Maximum score per resource dimension.
const DIMENSION_MAX: f64 = 10.0;

fn dimension_score(allocated: i64, required: i64, total: i64) -> u32 {
    if total <= 0 {
        return 0;
    }
    let ratio = (allocated + required) as f64 / total as f64;
    (ratio * DIMENSION_MAX).max(0.0) as u32
}

/// Predicted CPU score plus predicted memory score, each 0–10 for a node
/// that fits the request.
pub fn score_node(req: &Resource, node: &Node) -> u32 {
    dimension_score(
        node.allocated.milli_cpu,
        req.milli_cpu,
        node.total_cap.milli_cpu,
    ) + dimension_score(node.allocated.memory, req.memory, node.total_cap.memory)
}

/// Highest scoring candidate; the first one seen wins a tie.
pub fn select_best<'a, N, I>(req: &Resource, candidates: I) -> Option<&'a N>
where
    N: AsRef<Node> + 'a,
    I: IntoIterator<Item = &'a N>,
{
    let mut best: Option<(&'a N, u32)> = None;
    for candidate in candidates {
        let score = score_node(req, candidate.as_ref());
        tracing::trace!(node_id = %candidate.as_ref().id, score, "Node scored");
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((candidate, score)),
        }
    }
    best.map(|(node, _)| node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, total: Resource, allocated: Resource) -> Node {
        let mut n = Node::new(id, "127.0.0.1", "v1", total);
        n.allocated = allocated;
        n
    }

    #[test]
    fn score_truncates_each_ratio() {
        // cpu: (800 + 100) / 1000 = 0.9 -> 9; mem: (0 + 150) / 1000 = 0.15 -> 1
        let n = node("a", Resource::new(1000, 1000), Resource::new(800, 0));
        assert_eq!(score_node(&Resource::new(100, 150), &n), 10);
    }

    #[test]
    fn full_node_scores_twenty() {
        let n = node("a", Resource::new(1000, 1000), Resource::new(500, 500));
        assert_eq!(score_node(&Resource::new(500, 500), &n), 20);
    }

    #[test]
    fn zero_capacity_dimension_scores_zero() {
        let n = node("a", Resource::new(0, 1000), Resource::zero());
        assert_eq!(score_node(&Resource::new(0, 500), &n), 5);
    }

    #[test]
    fn busier_node_wins() {
        let idle = node("idle", Resource::new(4000, 4096), Resource::zero());
        let busy = node("busy", Resource::new(4000, 4096), Resource::new(3000, 3000));
        let nodes = [idle, busy];
        let best = select_best(&Resource::new(100, 100), nodes.iter()).unwrap();
        assert_eq!(best.id, "busy");
    }

    #[test]
    fn ties_go_to_first_candidate() {
        let nodes = [
            node("a", Resource::new(1000, 1000), Resource::zero()),
            node("b", Resource::new(1000, 1000), Resource::zero()),
        ];
        for _ in 0..10 {
            let best = select_best(&Resource::new(10, 10), nodes.iter()).unwrap();
            assert_eq!(best.id, "a");
        }
    }

    #[test]
    fn empty_candidate_list_has_no_winner() {
        let nodes: Vec<Node> = Vec::new();
        assert!(select_best(&Resource::new(1, 1), nodes.iter()).is_none());
    }
}
