//! Multi-agent work queue stored as one `dyad_taskboard` object and mutated
//! only through the CAS loop.

use crate::error::ErrKind;
use crate::sun::SunError;

pub mod agent;
pub mod engine;
pub mod model;

pub use agent::AgentIdentity;
pub use engine::{ClaimRequest, ListFilter, NewTask, Taskboard};
pub use model::{Board, Priority, Task, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum TaskboardError {
    #[error("task {0:?} not found")]
    TaskNotFound(String),
    #[error("no claimable tasks available on board {0}")]
    NoClaimable(String),
    #[error("task {task} is locked by {owner}")]
    NotOwner { task: String, owner: String },
    #[error("task {0} is already done")]
    AlreadyDone(String),
    #[error("task {0} is not currently assigned")]
    NotAssigned(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("taskboard {board} payload is invalid: {reason}")]
    Decode { board: String, reason: String },
    #[error(transparent)]
    Sun(#[from] SunError),
}

impl TaskboardError {
    pub fn kind(&self) -> ErrKind {
        match self {
            TaskboardError::TaskNotFound(_) => ErrKind::TaskNotFound,
            TaskboardError::NoClaimable(_) => ErrKind::NoClaimable,
            TaskboardError::NotOwner { .. } => ErrKind::NotOwner,
            TaskboardError::AlreadyDone(_)
            | TaskboardError::NotAssigned(_)
            | TaskboardError::InvalidArgument(_) => ErrKind::InvalidArgument,
            TaskboardError::Decode { .. } => ErrKind::Decode,
            TaskboardError::Sun(err) => err.kind(),
        }
    }
}
