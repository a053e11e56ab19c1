//! Worker factory abstraction - spawns and terminates pooled workers.
//!
//! The coordinator never builds workers itself. Each pool carries an opaque
//! `FactorySpec`; the factory turns it into a live worker and hands back an
//! exit signal the coordinator watches so crashed workers are replaced.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::member::{ExitReason, WorkerId};

/// Opaque descriptor for spawning one pool's workers.
///
/// `kind` selects the recipe inside the factory; `args` carries whatever
/// parameters that recipe wants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorySpec {
    pub kind: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl FactorySpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            args: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }
}

/// A freshly spawned worker: its identity plus the exit signal the
/// coordinator subscribes to. The factory (or the worker body) must send on
/// `exit` exactly once when the worker dies on its own; a dropped sender
/// counts as a crash.
pub struct SpawnedWorker {
    pub id: WorkerId,
    pub exit: oneshot::Receiver<ExitReason>,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to start worker: {0}")]
    Io(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker backends.
///
/// `spawn` and `terminate` are awaited inline in the coordinator loop and
/// must be fast; slow backends should hand off to their own supervision
/// machinery and return immediately.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    /// Called once when a pool is registered, before any spawns for it.
    async fn register_pool(&self, _pool: &str, _spec: &FactorySpec) -> Result<(), SpawnError> {
        Ok(())
    }

    /// Spawn one worker for the given descriptor.
    async fn spawn(&self, spec: &FactorySpec) -> Result<SpawnedWorker, SpawnError>;

    /// Tear down a worker previously returned by `spawn`. The coordinator
    /// stops watching the exit signal before calling this, so anything the
    /// teardown emits on it goes unobserved.
    async fn terminate(&self, worker: WorkerId);
}

/// Simple in-process factory backing each worker with a parked tokio task.
///
/// Useful for tests, demos, and pools whose "workers" are really just
/// capacity tokens. Real deployments implement [`WorkerFactory`] over their
/// own supervision mechanism (subprocesses, connections, remote sessions).
#[derive(Default)]
pub struct TaskFactory {
    running: StdMutex<HashMap<WorkerId, oneshot::Sender<ExitReason>>>,
}

impl TaskFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of workers currently alive in this factory.
    pub fn live_count(&self) -> usize {
        self.running.lock().map(|running| running.len()).unwrap_or(0)
    }

    /// Kill a worker out from under the pool, as a crash. The coordinator
    /// observes the exit and replaces the worker.
    pub fn crash(&self, worker: WorkerId) {
        let halt = match self.running.lock() {
            Ok(mut running) => running.remove(&worker),
            Err(_) => None,
        };
        if let Some(halt) = halt {
            let _ = halt.send(ExitReason::Crashed("killed".to_string()));
        }
    }
}

#[async_trait]
impl WorkerFactory for TaskFactory {
    async fn spawn(&self, _spec: &FactorySpec) -> Result<SpawnedWorker, SpawnError> {
        let id = WorkerId::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (halt_tx, halt_rx) = oneshot::channel::<ExitReason>();

        match self.running.lock() {
            Ok(mut running) => {
                running.insert(id, halt_tx);
            }
            Err(_) => {
                return Err(SpawnError::Other("factory state poisoned".to_string()));
            }
        }

        tokio::spawn(async move {
            // Parked until halted; a dropped halt sender means the factory
            // itself went away.
            let reason = halt_rx
                .await
                .unwrap_or_else(|_| ExitReason::Crashed("factory dropped".to_string()));
            let _ = exit_tx.send(reason);
        });

        Ok(SpawnedWorker { id, exit: exit_rx })
    }

    async fn terminate(&self, worker: WorkerId) {
        // Dropping the halt sender ends the task.
        if let Ok(mut running) = self.running.lock() {
            running.remove(&worker);
        }
    }
}
