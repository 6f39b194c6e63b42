use std::fmt;

/// Entity named in a not-found error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityKind {
    Model,
    Deployment,
    Definition,
    Instance,
    Task,
    User,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Model => "model",
            EntityKind::Deployment => "deployment",
            EntityKind::Definition => "process definition",
            EntityKind::Instance => "process instance",
            EntityKind::Task => "task",
            EntityKind::User => "user",
        };
        f.write_str(s)
    }
}

/// Errors returned by an [`ExecutionEngine`](crate::engine::ExecutionEngine).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },

    #[error("task {task_id} is already claimed by {assignee}")]
    AlreadyClaimed { task_id: String, assignee: String },

    #[error("task {task_id} is not assigned to {user}")]
    NotAssignee { task_id: String, user: String },

    #[error("deployment {deployment_id} still has {count} active instance(s)")]
    ActiveInstances { deployment_id: String, count: usize },

    /// Transient; the request may be retried.
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    /// Permanent; retrying will not help.
    #[error("engine rejected request: {0}")]
    Rejected(String),
}

impl EngineError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// The public error taxonomy of every orchestration operation.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("model {model_id} has no saved editor source; design and save the process before publishing")]
    EmptyModelSource { model_id: String },

    #[error("invalid model source: {0}")]
    InvalidModelSource(String),

    #[error("unsupported deployment format: {file_name}")]
    UnsupportedFormat { file_name: String },

    #[error("task {task_id} is already claimed by {assignee}")]
    AlreadyClaimed { task_id: String, assignee: String },

    #[error("task {task_id} is not assigned to {user}")]
    NotAssignee { task_id: String, user: String },

    #[error("deployment {deployment_id} still has {count} active instance(s)")]
    ActiveInstancesExist { deployment_id: String, count: usize },

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("engine rejected request: {0}")]
    EngineRejected(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        OrchestratorError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Only transient engine outages are retried at the orchestration boundary.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrchestratorError::EngineUnavailable(_))
    }

    pub fn is_not_found(&self, kind: EntityKind) -> bool {
        matches!(self, OrchestratorError::NotFound { kind: k, .. } if *k == kind)
    }
}

impl From<EngineError> for OrchestratorError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound { kind, id } => OrchestratorError::NotFound { kind, id },
            EngineError::AlreadyClaimed { task_id, assignee } => {
                OrchestratorError::AlreadyClaimed { task_id, assignee }
            }
            EngineError::NotAssignee { task_id, user } => {
                OrchestratorError::NotAssignee { task_id, user }
            }
            EngineError::ActiveInstances {
                deployment_id,
                count,
            } => OrchestratorError::ActiveInstancesExist {
                deployment_id,
                count,
            },
            EngineError::Unavailable(msg) => OrchestratorError::EngineUnavailable(msg),
            EngineError::Rejected(msg) => OrchestratorError::EngineRejected(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_mapping() {
        let err: OrchestratorError = EngineError::not_found(EntityKind::Task, "t-1").into();
        assert!(err.is_not_found(EntityKind::Task));
        assert_eq!(err.to_string(), "task not found: t-1");

        let err: OrchestratorError = EngineError::Unavailable("connection reset".into()).into();
        assert!(err.is_retryable());

        let err: OrchestratorError = EngineError::Rejected("bad xml".into()).into();
        assert!(!err.is_retryable());
    }
}
