use crate::model::{Job, Node, NodeStatus, Resource};

/// Why a node cannot host a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    /// The request itself has a negative component
    InvalidRequest(Resource),
    NotReady(NodeStatus),
    InsufficientCpu { free: i64, need: i64 },
    InsufficientMemory { free: i64, need: i64 },
}

impl std::fmt::Display for FilterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterReason::InvalidRequest(req) => write!(f, "invalid request ({})", req),
            FilterReason::NotReady(status) => write!(f, "node is {}", status),
            FilterReason::InsufficientCpu { free, need } => {
                write!(f, "insufficient cpu (free: {}, need: {})", free, need)
            }
            FilterReason::InsufficientMemory { free, need } => {
                write!(f, "insufficient memory (free: {}, need: {})", free, need)
            }
        }
    }
}

/// Hard predicates: the node must be ready and have enough free CPU and
/// memory for `req`.
pub fn check_node(req: &Resource, node: &Node) -> Result<(), FilterReason> {
    if !req.is_non_negative() {
        return Err(FilterReason::InvalidRequest(*req));
    }
    if node.status != NodeStatus::Ready {
        return Err(FilterReason::NotReady(node.status));
    }

    let free = node.free();
    if free.milli_cpu < req.milli_cpu {
        return Err(FilterReason::InsufficientCpu {
            free: free.milli_cpu,
            need: req.milli_cpu,
        });
    }
    if free.memory < req.memory {
        return Err(FilterReason::InsufficientMemory {
            free: free.memory,
            need: req.memory,
        });
    }
    Ok(())
}

/// Nodes able to host `job`, in the order given.
pub fn filter_nodes<'a, N: AsRef<Node>>(job: &Job, nodes: &'a [N]) -> Vec<&'a N> {
    nodes
        .iter()
        .filter(|n| match check_node(&job.res_req, n.as_ref()) {
            Ok(()) => true,
            Err(reason) => {
                tracing::debug!(
                    job_id = %job.id,
                    node_id = %n.as_ref().id,
                    reason = %reason,
                    "Node filtered"
                );
                false
            }
        })
        .collect()
}
