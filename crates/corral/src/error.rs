//! Error types surfaced by the coordinator handle.

/// Failure adding a pool to the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddPoolError {
    /// A pool with this name is already registered; nothing was changed.
    #[error("duplicate pool name: {0}")]
    DuplicatePoolName(String),

    /// The coordinator has been stopped.
    #[error("coordinator stopped")]
    Stopped,
}

/// Failure taking a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TakeError {
    /// Named pool does not exist, or no pools are registered at all.
    #[error("no such pool")]
    NoPool,

    /// Pool is at capacity or could not grow in time.
    #[error("no members available")]
    NoMembers,

    /// The coordinator has been stopped.
    #[error("coordinator stopped")]
    Stopped,
}

/// Failure of a query or control operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    /// The coordinator has been stopped.
    #[error("coordinator stopped")]
    Stopped,
}
