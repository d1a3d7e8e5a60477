//! Entity schema shared by the scheduler and the worker agents.
//!
//! Every record here is stored as JSON in the coordination store, so field
//! names are part of the wire contract.

pub mod event;
pub mod job;
pub mod node;
pub mod resource;

pub use event::{JobEvent, JobEventKind};
pub use job::{Job, JobSpec, JobState, JobStatus, JobType};
pub use node::{Node, NodeStatus};
pub use resource::Resource;
