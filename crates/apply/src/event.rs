//! Events emitted by an apply/destroy engine.

use std::fmt;

use converge_core::{ActuationError, ObjectId};
use serde_json::Value as Json;

/// Direction of an actuation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operation {
    Apply,
    Prune,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { Operation::Apply => "apply", Operation::Prune => "prune", Operation::Delete => "delete" })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpStatus {
    Pending,
    Successful,
    Skipped,
    Failed,
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OpStatus::Pending => "pending",
            OpStatus::Successful => "successful",
            OpStatus::Skipped => "skipped",
            OpStatus::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WaitStatus {
    Pending,
    Successful,
    Skipped,
    Failed,
    Timeout,
}

impl fmt::Display for WaitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WaitStatus::Pending => "pending",
            WaitStatus::Successful => "successful",
            WaitStatus::Skipped => "skipped",
            WaitStatus::Failed => "failed",
            WaitStatus::Timeout => "timeout",
        })
    }
}

/// Apply, prune or delete progress for one object, or (without `id`) for the
/// run as a whole.
#[derive(Debug, Clone, PartialEq)]
pub struct ActuationEvent {
    pub id: Option<ObjectId>,
    pub status: OpStatus,
    pub error: Option<ActuationError>,
    /// Object body as known to the engine.
    pub object: Option<Json>,
}

impl ActuationEvent {
    pub fn progress(status: OpStatus) -> Self { Self { id: None, status, error: None, object: None } }

    pub fn object(id: ObjectId, status: OpStatus) -> Self { Self { id: Some(id), status, error: None, object: None } }

    pub fn with_error(mut self, error: ActuationError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_object(mut self, object: Json) -> Self {
        self.object = Some(object);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaitEvent {
    pub id: ObjectId,
    pub status: WaitStatus,
}

/// Engine-level failure not tied to one object.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub error: ActuationError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Apply(ActuationEvent),
    Prune(ActuationEvent),
    Delete(ActuationEvent),
    Wait(WaitEvent),
    Error(ErrorEvent),
}

impl Event {
    pub fn apply(id: ObjectId, status: OpStatus) -> Self { Event::Apply(ActuationEvent::object(id, status)) }
    pub fn prune(id: ObjectId, status: OpStatus) -> Self { Event::Prune(ActuationEvent::object(id, status)) }
    pub fn delete(id: ObjectId, status: OpStatus) -> Self { Event::Delete(ActuationEvent::object(id, status)) }
    pub fn wait(id: ObjectId, status: WaitStatus) -> Self { Event::Wait(WaitEvent { id, status }) }
    pub fn error(error: ActuationError) -> Self { Event::Error(ErrorEvent { error }) }

    /// Wrap an actuation event for `op`.
    pub fn actuation(op: Operation, ev: ActuationEvent) -> Self {
        match op {
            Operation::Apply => Event::Apply(ev),
            Operation::Prune => Event::Prune(ev),
            Operation::Delete => Event::Delete(ev),
        }
    }
}
