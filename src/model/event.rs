use crate::model::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEventKind {
    Create,
    Update,
    Delete,
}

/// A change to one job record, as seen on the job watch stream.
///
/// `version` is the store revision of the write that produced the event; it
/// is the expected version for a conditional update of that record. For
/// deletes it is the revision of the delete and `job` is the last value.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job: Job,
    pub version: u64,
}
