//! Scoped worker acquisition and consumer liveness adapters.
//!
//! Direct function-call consumers have no task of their own for the
//! coordinator to watch, so a crashed borrower would leak its worker. The
//! [`Lease`] guard closes that hole: it returns the worker on every exit
//! path, unwinding included. Task-based consumers instead register with
//! [`watch_consumer`], which turns task completion into a consumer-exit
//! event.

use tokio::task::JoinHandle;

use crate::coordinator::CoordinatorHandle;
use crate::member::{ConsumerId, ExitReason, ReturnStatus, WorkerId};

/// A checked-out worker that returns itself when dropped.
///
/// Dropping the lease sends a return with status ok. Call [`Lease::fail`]
/// when the worker broke in the borrower's hands, or [`Lease::release`] to
/// return it early and explicitly.
#[must_use = "dropping a lease immediately returns the worker"]
pub struct Lease {
    handle: CoordinatorHandle,
    consumer: ConsumerId,
    worker: WorkerId,
    armed: bool,
}

impl Lease {
    pub(crate) fn new(handle: CoordinatorHandle, consumer: ConsumerId, worker: WorkerId) -> Self {
        Self {
            handle,
            consumer,
            worker,
            armed: true,
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    /// Return the worker as broken; it will be destroyed and replaced.
    pub fn fail(mut self) {
        self.armed = false;
        self.handle
            .give_back(self.worker, ReturnStatus::Fail, self.consumer);
    }

    /// Return the worker healthy, now.
    pub fn release(mut self) {
        self.armed = false;
        self.handle
            .give_back(self.worker, ReturnStatus::Ok, self.consumer);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.armed {
            self.handle
                .give_back(self.worker, ReturnStatus::Ok, self.consumer);
        }
    }
}

/// Watch a consumer task and report its termination to the coordinator.
///
/// A panicked or aborted task counts as a crash, so every worker the
/// consumer still held is destroyed and respawned; clean completion returns
/// them to the free list.
pub fn watch_consumer<T: Send + 'static>(
    handle: &CoordinatorHandle,
    consumer: ConsumerId,
    task: JoinHandle<T>,
) -> JoinHandle<()> {
    let handle = handle.clone();
    tokio::spawn(async move {
        let reason = match task.await {
            Ok(_) => ExitReason::Normal,
            Err(err) if err.is_panic() => ExitReason::Crashed("panicked".to_string()),
            Err(_) => ExitReason::Crashed("aborted".to_string()),
        };
        handle.consumer_exited(consumer, reason);
    })
}
