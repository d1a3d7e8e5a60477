//! Node allocation bookkeeping.
//!
//! Every change to `Node.allocated` goes through here as a version-checked
//! read-modify-write, which keeps `allocated <= total_cap` no matter how
//! many scheduling attempts target the same node at once.

use crate::error::{Result, TitanError};
use crate::model::{Job, Node, Resource};
use crate::store::{node_key, ClusterStore, Versioned};

/// Reserve the job's requirement on the node as it was in the snapshot.
///
/// Returns `Ok(false)` if the job already holds a reservation there (left
/// behind by an earlier attempt). A lost race or a request that no longer
/// fits is reported as `Conflict`.
pub async fn reserve(store: &ClusterStore, snapshot: &Versioned<Node>, job: &Job) -> Result<bool> {
    let mut node = snapshot.value.clone();
    if node.assignments.contains_key(&job.id) {
        return Ok(false);
    }
    if !node.reserve(&job.id, job.res_req) {
        return Err(TitanError::Conflict(node_key(&node.id)));
    }
    store.put_node_if(&node, snapshot.version).await?;
    tracing::debug!(
        job_id = %job.id,
        node_id = %node.id,
        allocated = %node.allocated,
        "Capacity reserved"
    );
    Ok(true)
}

/// Return a job's reservation to its node, retrying lost races up to
/// `attempts` times. `Ok(None)` means there was nothing to release, which is
/// what a second release of the same job sees.
pub async fn release(
    store: &ClusterStore,
    node_id: &str,
    job_id: &str,
    attempts: usize,
) -> Result<Option<Resource>> {
    for _ in 0..attempts.max(1) {
        let Some(current) = store.get_node(node_id).await? else {
            return Ok(None);
        };
        let mut node = current.value;
        let Some(freed) = node.release(job_id) else {
            return Ok(None);
        };

        match store.put_node_if(&node, current.version).await {
            Ok(_) => {
                tracing::debug!(
                    job_id,
                    node_id,
                    freed = %freed,
                    allocated = %node.allocated,
                    "Capacity released"
                );
                return Ok(Some(freed));
            }
            Err(TitanError::Conflict(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(TitanError::Conflict(node_key(node_id)))
}
