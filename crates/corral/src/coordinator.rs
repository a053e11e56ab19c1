//! Coordinator - the single serialized authority over all pool state.
//!
//! Flow:
//! 1. `Coordinator::spawn` starts the coordinator task and returns a handle
//! 2. All operations and events travel one unbounded channel, processed
//!    strictly one at a time
//! 3. Worker exits are watched per worker and fed back as events
//! 4. Cull timers reschedule themselves through the same channel
//! 5. `stop` cancels the timers, answers, and ends the task
//!
//! Because every state transition happens inside the loop, the indexes stay
//! consistent without any locking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use rand::seq::IndexedRandom;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::PoolSettings;
use crate::error::{AddPoolError, CoordinatorError, TakeError};
use crate::factory::{SpawnedWorker, WorkerFactory};
use crate::lease::Lease;
use crate::member::{
    ConsumerEntry, ConsumerId, ExitReason, Holder, MemberEntry, MemberStat, ReturnStatus, WorkerId,
};
use crate::metrics::{
    self, Emitter, ERROR_NO_MEMBERS_COUNT, KILLED_FREE_COUNT, KILLED_IN_USE_COUNT, MetricsSink,
    NullSink,
};
use crate::pool::{max_avail_pool, max_free_pool, Pool};
use crate::status::{render_status_table, PoolStatus};

/// Everything the coordinator task can be asked to do. Synchronous
/// operations carry a oneshot reply; events and returns are fire-and-forget.
enum Request {
    AddPool {
        settings: PoolSettings,
        reply: oneshot::Sender<Result<(), AddPoolError>>,
    },
    AddPools {
        settings: Vec<PoolSettings>,
        reply: oneshot::Sender<()>,
    },
    TakeAny {
        consumer: ConsumerId,
        reply: oneshot::Sender<Result<WorkerId, TakeError>>,
    },
    TakeNamed {
        pool: String,
        consumer: ConsumerId,
        reply: oneshot::Sender<Result<WorkerId, TakeError>>,
    },
    GiveBack {
        worker: WorkerId,
        status: ReturnStatus,
        consumer: ConsumerId,
    },
    MemberStats {
        reply: oneshot::Sender<Vec<MemberStat>>,
    },
    PoolStatus {
        reply: oneshot::Sender<Vec<PoolStatus>>,
    },
    WorkerExited {
        worker: WorkerId,
        reason: ExitReason,
    },
    ConsumerExited {
        consumer: ConsumerId,
        reason: ExitReason,
    },
    CullTick {
        pool: String,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Builder for the coordinator task.
pub struct Coordinator {
    factory: Arc<dyn WorkerFactory>,
    metrics: Arc<dyn MetricsSink>,
}

impl Coordinator {
    pub fn new(factory: Arc<dyn WorkerFactory>) -> Self {
        Self {
            factory,
            metrics: Arc::new(NullSink),
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Start the coordinator task with an empty registry.
    pub fn spawn(self) -> CoordinatorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = CoordinatorState {
            factory: self.factory,
            emitter: Emitter::new(self.metrics),
            pools: HashMap::new(),
            selector: Vec::new(),
            members: HashMap::new(),
            consumers: HashMap::new(),
            tx: tx.clone(),
            shutdown: CancellationToken::new(),
        };
        tokio::spawn(run(rx, state));
        CoordinatorHandle { tx }
    }

    /// Start the coordinator and register the given pools before returning.
    pub async fn spawn_with_pools(
        self,
        pools: Vec<PoolSettings>,
    ) -> Result<CoordinatorHandle, CoordinatorError> {
        let handle = self.spawn();
        handle.add_pools(pools).await?;
        Ok(handle)
    }
}

/// Cloneable caller-side handle to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Request>,
}

impl CoordinatorHandle {
    /// Register one pool and spawn its initial population.
    pub async fn add_pool(&self, settings: PoolSettings) -> Result<(), AddPoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::AddPool { settings, reply })
            .map_err(|_| AddPoolError::Stopped)?;
        rx.await.map_err(|_| AddPoolError::Stopped)?
    }

    /// Register several pools. Every entry is attempted; an entry that fails
    /// (duplicate name) is logged and skipped, and the call still succeeds.
    pub async fn add_pools(&self, settings: Vec<PoolSettings>) -> Result<(), CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::AddPools { settings, reply })
            .map_err(|_| CoordinatorError::Stopped)?;
        rx.await.map_err(|_| CoordinatorError::Stopped)
    }

    /// Take a worker from whichever pool the selection strategies find.
    pub async fn take(&self, consumer: ConsumerId) -> Result<WorkerId, TakeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::TakeAny { consumer, reply })
            .map_err(|_| TakeError::Stopped)?;
        rx.await.map_err(|_| TakeError::Stopped)?
    }

    /// Take a worker from a specific pool.
    pub async fn take_from(&self, pool: &str, consumer: ConsumerId) -> Result<WorkerId, TakeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::TakeNamed {
                pool: pool.to_string(),
                consumer,
                reply,
            })
            .map_err(|_| TakeError::Stopped)?;
        rx.await.map_err(|_| TakeError::Stopped)?
    }

    /// Take a worker wrapped in a [`Lease`] that returns it on drop.
    pub async fn lease(&self, consumer: ConsumerId) -> Result<Lease, TakeError> {
        let worker = self.take(consumer).await?;
        Ok(Lease::new(self.clone(), consumer, worker))
    }

    /// [`CoordinatorHandle::lease`] against a specific pool.
    pub async fn lease_from(&self, pool: &str, consumer: ConsumerId) -> Result<Lease, TakeError> {
        let worker = self.take_from(pool, consumer).await?;
        Ok(Lease::new(self.clone(), consumer, worker))
    }

    /// Hand a worker back. Fire-and-forget; ordered after any operation this
    /// caller already submitted.
    pub fn give_back(&self, worker: WorkerId, status: ReturnStatus, consumer: ConsumerId) {
        let _ = self.tx.send(Request::GiveBack {
            worker,
            status,
            consumer,
        });
    }

    /// Report that a consumer terminated. Normal exits return its workers to
    /// the free lists; anything else destroys and replaces them.
    pub fn consumer_exited(&self, consumer: ConsumerId, reason: ExitReason) {
        let _ = self.tx.send(Request::ConsumerExited { consumer, reason });
    }

    /// Snapshot of every live worker.
    pub async fn member_stats(&self) -> Result<Vec<MemberStat>, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::MemberStats { reply })
            .map_err(|_| CoordinatorError::Stopped)?;
        rx.await.map_err(|_| CoordinatorError::Stopped)
    }

    /// Per-pool counters, in registration order.
    pub async fn pool_status(&self) -> Result<Vec<PoolStatus>, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::PoolStatus { reply })
            .map_err(|_| CoordinatorError::Stopped)?;
        rx.await.map_err(|_| CoordinatorError::Stopped)
    }

    /// The status counters rendered as an aligned text table.
    pub async fn render_status(&self) -> Result<String, CoordinatorError> {
        Ok(render_status_table(&self.pool_status().await?))
    }

    /// Stop the coordinator. Requests already queued are processed first;
    /// anything sent afterwards observes `Stopped`.
    pub async fn stop(&self) -> Result<(), CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Stop { reply })
            .map_err(|_| CoordinatorError::Stopped)?;
        rx.await.map_err(|_| CoordinatorError::Stopped)
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Request>, mut state: CoordinatorState) {
    while let Some(request) = rx.recv().await {
        let stop = state.handle(request).await;
        #[cfg(debug_assertions)]
        state.check_consistency();
        if stop {
            break;
        }
    }
    state.shutdown.cancel();
    tracing::info!("coordinator stopped");
}

enum GrowOutcome {
    Grown,
    BadPoolName,
    MaxCountReached,
}

struct CoordinatorState {
    factory: Arc<dyn WorkerFactory>,
    emitter: Emitter,
    pools: HashMap<String, Pool>,
    /// Registration-ordered pool names, indexed for uniform random picks.
    selector: Vec<String>,
    members: HashMap<WorkerId, MemberEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    /// Loop-back sender for cull timers and exit watchers.
    tx: mpsc::UnboundedSender<Request>,
    shutdown: CancellationToken,
}

impl CoordinatorState {
    async fn handle(&mut self, request: Request) -> bool {
        match request {
            Request::AddPool { settings, reply } => {
                let _ = reply.send(self.add_pool(settings).await);
            }
            Request::AddPools { settings, reply } => {
                for entry in settings {
                    if let Err(err) = self.add_pool(entry).await {
                        tracing::warn!(error = %err, "pool skipped during bulk registration");
                    }
                }
                let _ = reply.send(());
            }
            Request::TakeAny { consumer, reply } => {
                let _ = reply.send(self.take_any(consumer).await);
            }
            Request::TakeNamed {
                pool,
                consumer,
                reply,
            } => {
                let _ = reply.send(self.take_named(&pool, consumer).await);
            }
            Request::GiveBack {
                worker,
                status,
                consumer,
            } => match status {
                ReturnStatus::Ok => self.return_ok(worker, consumer),
                ReturnStatus::Fail => self.return_fail(worker).await,
            },
            Request::MemberStats { reply } => {
                let _ = reply.send(self.member_stats());
            }
            Request::PoolStatus { reply } => {
                let _ = reply.send(self.pool_status());
            }
            Request::WorkerExited { worker, reason } => {
                self.worker_exited(worker, reason).await;
            }
            Request::ConsumerExited { consumer, reason } => {
                self.consumer_exited(consumer, reason).await;
            }
            Request::CullTick { pool } => {
                self.cull(&pool).await;
            }
            Request::Stop { reply } => {
                self.shutdown.cancel();
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    async fn add_pool(&mut self, settings: PoolSettings) -> Result<(), AddPoolError> {
        let name = settings.name.clone();
        if self.pools.contains_key(&name) {
            return Err(AddPoolError::DuplicatePoolName(name));
        }

        if let Err(err) = self.factory.register_pool(&name, &settings.start_spec).await {
            tracing::warn!(pool = %name, error = %err, "factory pool registration failed");
        }

        let init = settings.init_count;
        self.pools.insert(name.clone(), Pool::from_settings(settings));
        self.selector.push(name.clone());
        self.schedule_cull(&name);
        let _ = self.grow(&name, init).await;
        tracing::info!(pool = %name, init_count = init, "pool registered");
        Ok(())
    }

    /// Spawn up to `n` workers for a pool. Individual factory failures are
    /// absorbed; the pool keeps whatever did spawn.
    async fn grow(&mut self, pool_name: &str, n: u32) -> GrowOutcome {
        let spec = match self.pools.get(pool_name) {
            None => return GrowOutcome::BadPoolName,
            Some(pool) if !pool.fits(n) => return GrowOutcome::MaxCountReached,
            Some(pool) => pool.start_spec.clone(),
        };

        let mut spawned = 0u32;
        for _ in 0..n {
            match self.factory.spawn(&spec).await {
                Ok(worker) => {
                    self.register_member(pool_name, worker);
                    spawned += 1;
                }
                Err(err) => {
                    tracing::warn!(pool = pool_name, error = %err, "worker spawn failed");
                }
            }
        }

        if spawned < n {
            tracing::warn!(pool = pool_name, requested = n, spawned, "pool growth fell short");
            self.emitter.history(serde_json::json!({
                "event": "add_pids_failed",
                "pool": pool_name,
                "requested": n,
                "spawned": spawned,
            }));
        }
        if spawned > 0
            && let Some(pool) = self.pools.get(pool_name)
        {
            self.emitter
                .pool_counts(pool_name, pool.in_use_count, pool.free_count());
        }
        GrowOutcome::Grown
    }

    fn register_member(&mut self, pool_name: &str, worker: SpawnedWorker) {
        let SpawnedWorker { id, exit } = worker;

        // Exit adapter: one tiny task per worker turns the factory's exit
        // signal into a coordinator event. Aborted when the member is
        // removed, so coordinator-initiated terminations do not echo back.
        let tx = self.tx.clone();
        let watch = tokio::spawn(async move {
            let reason = exit
                .await
                .unwrap_or_else(|_| ExitReason::Crashed("exit signal dropped".to_string()));
            let _ = tx.send(Request::WorkerExited { worker: id, reason });
        });

        self.members.insert(
            id,
            MemberEntry {
                pool_name: pool_name.to_string(),
                holder: Holder::Free,
                since: Instant::now(),
                watch,
            },
        );
        if let Some(pool) = self.pools.get_mut(pool_name) {
            pool.free.push_back(id);
        }
        tracing::debug!(pool = pool_name, worker = %id, "worker added");
    }

    /// Strategy chain for anonymous takes: a uniformly random pool, then the
    /// pool with the most free workers, then the pool with the most headroom.
    async fn take_any(&mut self, consumer: ConsumerId) -> Result<WorkerId, TakeError> {
        if self.selector.is_empty() {
            return Err(TakeError::NoPool);
        }

        let random_pool = self.selector.choose(&mut rand::rng()).cloned();
        if let Some(pool) = random_pool {
            match self.take_named(&pool, consumer).await {
                Err(TakeError::NoMembers) => {}
                other => return other,
            }
        }

        if let Some(pool) = max_free_pool(&self.selector, &self.pools).map(str::to_string) {
            match self.take_named(&pool, consumer).await {
                Err(TakeError::NoMembers) => {}
                other => return other,
            }
        }

        if let Some(pool) = max_avail_pool(&self.selector, &self.pools).map(str::to_string) {
            match self.take_named(&pool, consumer).await {
                Err(TakeError::NoMembers) => {}
                other => return other,
            }
        }

        Err(TakeError::NoMembers)
    }

    async fn take_named(
        &mut self,
        pool_name: &str,
        consumer: ConsumerId,
    ) -> Result<WorkerId, TakeError> {
        let Some(pool) = self.pools.get(pool_name) else {
            return Err(TakeError::NoPool);
        };
        self.emitter
            .meter(&metrics::pool_metric(pool_name, "take_rate"));

        let mut retries = pool.add_member_retry;
        loop {
            let Some(pool) = self.pools.get_mut(pool_name) else {
                return Err(TakeError::NoPool);
            };

            if let Some(worker) = pool.free.pop_front() {
                pool.in_use_count += 1;
                let (in_use, free) = (pool.in_use_count, pool.free_count());
                if let Some(entry) = self.members.get_mut(&worker) {
                    entry.holder = Holder::Consumer(consumer);
                    entry.since = Instant::now();
                }
                self.consumers.entry(consumer).or_default().held.push(worker);
                self.emitter.pool_counts(pool_name, in_use, free);
                tracing::debug!(pool = pool_name, worker = %worker, consumer = %consumer, "worker taken");
                return Ok(worker);
            }

            if pool.in_use_count == pool.max_count {
                return Err(self.fail_take(pool_name, true));
            }

            if retries == 0 {
                return Err(self.fail_take(pool_name, false));
            }

            match self.grow(pool_name, 1).await {
                GrowOutcome::Grown => retries -= 1,
                GrowOutcome::MaxCountReached => return Err(self.fail_take(pool_name, true)),
                GrowOutcome::BadPoolName => return Err(TakeError::NoPool),
            }
        }
    }

    fn fail_take(&self, pool_name: &str, with_history: bool) -> TakeError {
        self.emitter.counter(ERROR_NO_MEMBERS_COUNT);
        if with_history {
            self.emitter.history(serde_json::json!({
                "event": "error_no_members",
                "pool": pool_name,
            }));
        }
        TakeError::NoMembers
    }

    fn return_ok(&mut self, worker: WorkerId, consumer: ConsumerId) {
        let Some(entry) = self.members.get_mut(&worker) else {
            return;
        };
        if entry.holder.consumer() != Some(consumer) {
            tracing::warn!(worker = %worker, consumer = %consumer, "return from non-holder ignored");
            return;
        }

        entry.holder = Holder::Free;
        entry.since = Instant::now();
        let pool_name = entry.pool_name.clone();

        if let Some(pool) = self.pools.get_mut(&pool_name) {
            pool.free.push_back(worker);
            pool.in_use_count = pool.in_use_count.saturating_sub(1);
            let (in_use, free) = (pool.in_use_count, pool.free_count());
            self.emitter.pool_counts(&pool_name, in_use, free);
        }
        self.unlink(consumer, worker);
        tracing::debug!(pool = %pool_name, worker = %worker, consumer = %consumer, "worker returned");
    }

    /// A failed return destroys the worker and spawns one replacement; a
    /// full pool simply stays at capacity.
    async fn return_fail(&mut self, worker: WorkerId) {
        let Some(pool_name) = self.members.get(&worker).map(|e| e.pool_name.clone()) else {
            return;
        };
        self.remove_worker(worker).await;
        match self.grow(&pool_name, 1).await {
            GrowOutcome::Grown | GrowOutcome::MaxCountReached => {}
            GrowOutcome::BadPoolName => {
                tracing::error!(pool = %pool_name, "replacement spawn hit unknown pool");
                self.emitter.history(serde_json::json!({
                    "event": "bad_return_from_add_pid",
                    "pool": pool_name,
                }));
            }
        }
    }

    async fn remove_worker(&mut self, worker: WorkerId) {
        let Some(entry) = self.members.remove(&worker) else {
            tracing::warn!(worker = %worker, "removal of unknown worker");
            self.emitter.history(serde_json::json!({
                "event": "unknown_pid",
                "worker": worker.to_string(),
            }));
            return;
        };
        entry.watch.abort();

        let pool_name = entry.pool_name;
        match entry.holder {
            Holder::Free => {
                if let Some(pool) = self.pools.get_mut(&pool_name) {
                    pool.free.retain(|w| *w != worker);
                    let (in_use, free) = (pool.in_use_count, pool.free_count());
                    self.emitter.pool_counts(&pool_name, in_use, free);
                }
                self.factory.terminate(worker).await;
                self.emitter.counter(KILLED_FREE_COUNT);
                tracing::debug!(pool = %pool_name, worker = %worker, "free worker destroyed");
            }
            Holder::Consumer(consumer) => {
                if let Some(pool) = self.pools.get_mut(&pool_name) {
                    pool.in_use_count = pool.in_use_count.saturating_sub(1);
                    let (in_use, free) = (pool.in_use_count, pool.free_count());
                    self.emitter.pool_counts(&pool_name, in_use, free);
                }
                self.unlink(consumer, worker);
                self.factory.terminate(worker).await;
                self.emitter.counter(KILLED_IN_USE_COUNT);
                tracing::debug!(pool = %pool_name, worker = %worker, consumer = %consumer, "held worker destroyed");
            }
        }
    }

    fn unlink(&mut self, consumer: ConsumerId, worker: WorkerId) {
        if let Some(entry) = self.consumers.get_mut(&consumer) {
            entry.held.retain(|w| *w != worker);
            if entry.held.is_empty() {
                self.consumers.remove(&consumer);
            }
        }
    }

    /// A worker died on its own: same treatment as a failed return.
    async fn worker_exited(&mut self, worker: WorkerId, reason: ExitReason) {
        if !self.members.contains_key(&worker) {
            return;
        }
        tracing::warn!(worker = %worker, reason = %reason, "worker exited, replacing");
        self.return_fail(worker).await;
    }

    /// A borrower died: reclaim every worker it held, in acquisition order.
    async fn consumer_exited(&mut self, consumer: ConsumerId, reason: ExitReason) {
        let Some(entry) = self.consumers.get(&consumer) else {
            return;
        };
        let held = entry.held.clone();
        tracing::debug!(consumer = %consumer, count = held.len(), reason = %reason, "reclaiming workers from exited consumer");

        let status = if reason.is_normal() {
            ReturnStatus::Ok
        } else {
            ReturnStatus::Fail
        };
        for worker in held {
            match status {
                ReturnStatus::Ok => self.return_ok(worker, consumer),
                ReturnStatus::Fail => self.return_fail(worker).await,
            }
        }
    }

    /// One cull pass: destroy free workers idle past `max_age`, but never so
    /// many that the pool could not climb back to `init_count` with its
    /// current in-use population. Replacements come from on-demand growth,
    /// not from here.
    async fn cull(&mut self, pool_name: &str) {
        let Some(pool) = self.pools.get(pool_name) else {
            return;
        };
        if pool.cull_interval.is_zero() {
            return;
        }

        let budget = pool.cull_budget();
        if budget > 0 {
            let max_age = pool.max_age;
            let victims: Vec<WorkerId> = pool
                .free
                .iter()
                .filter(|worker| {
                    self.members
                        .get(worker)
                        .is_some_and(|entry| entry.since.elapsed() > max_age)
                })
                .take(budget as usize)
                .copied()
                .collect();
            if !victims.is_empty() {
                tracing::debug!(pool = pool_name, count = victims.len(), "culling idle workers");
            }
            for worker in victims {
                self.remove_worker(worker).await;
            }
        }

        self.schedule_cull(pool_name);
    }

    fn schedule_cull(&self, pool_name: &str) {
        let Some(pool) = self.pools.get(pool_name) else {
            return;
        };
        if pool.cull_interval.is_zero() {
            return;
        }

        let interval = pool.cull_interval;
        let tx = self.tx.clone();
        let shutdown = self.shutdown.clone();
        let pool = pool_name.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(interval) => {
                    let _ = tx.send(Request::CullTick { pool });
                }
            }
        });
    }

    fn member_stats(&self) -> Vec<MemberStat> {
        self.members
            .iter()
            .map(|(worker, entry)| MemberStat {
                worker: *worker,
                pool: entry.pool_name.clone(),
                holder: entry.holder,
                age: entry.since.elapsed(),
            })
            .collect()
    }

    fn pool_status(&self) -> Vec<PoolStatus> {
        self.selector
            .iter()
            .filter_map(|name| self.pools.get(name))
            .map(|pool| PoolStatus {
                id: pool.name.clone(),
                capacity: pool.max_count,
                created: pool.created(),
                checked_out: pool.in_use_count,
                free: pool.free_count(),
                available: pool.available(),
            })
            .collect()
    }

    /// Cross-checks every index against every other after each message.
    /// Debug builds only; a violation here is a coordinator bug.
    #[cfg(debug_assertions)]
    fn check_consistency(&self) {
        let total: usize = self.pools.values().map(|p| p.created() as usize).sum();
        assert_eq!(total, self.members.len(), "pool counters out of sync with member index");

        for pool in self.pools.values() {
            assert!(pool.created() <= pool.max_count, "pool {} over capacity", pool.name);
            for worker in &pool.free {
                let entry = self
                    .members
                    .get(worker)
                    .unwrap_or_else(|| panic!("free worker {worker} missing from member index"));
                assert!(entry.holder.is_free(), "free-listed worker {worker} has a holder");
                assert_eq!(entry.pool_name, pool.name, "worker {worker} free-listed in wrong pool");
            }
        }

        for (consumer, entry) in &self.consumers {
            assert!(!entry.held.is_empty(), "empty entry retained for consumer {consumer}");
            for worker in &entry.held {
                let member = self
                    .members
                    .get(worker)
                    .unwrap_or_else(|| panic!("held worker {worker} missing from member index"));
                assert_eq!(
                    member.holder.consumer(),
                    Some(*consumer),
                    "worker {worker} held by {consumer} but holder disagrees"
                );
            }
        }

        for (worker, entry) in &self.members {
            match entry.holder.consumer() {
                Some(consumer) => {
                    let held = self
                        .consumers
                        .get(&consumer)
                        .is_some_and(|e| e.held.contains(worker));
                    assert!(held, "worker {worker} holder {consumer} has no matching entry");
                }
                None => {
                    let listed = self
                        .pools
                        .get(&entry.pool_name)
                        .is_some_and(|p| p.free.contains(worker));
                    assert!(listed, "free worker {worker} absent from its pool's free list");
                }
            }
        }

        for pool in self.pools.values() {
            let held = self
                .consumers
                .values()
                .flat_map(|e| e.held.iter())
                .filter(|worker| {
                    self.members
                        .get(worker)
                        .is_some_and(|m| m.pool_name == pool.name)
                })
                .count() as u32;
            assert_eq!(held, pool.in_use_count, "pool {} in-use counter drifted", pool.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::config::{TimeSpec, TimeUnit};
    use crate::factory::{FactorySpec, SpawnError, TaskFactory};
    use crate::lease::watch_consumer;
    use crate::metrics::{pool_metric, MetricKind, MetricValue, EVENTS};

    #[derive(Default)]
    struct RecordingSink {
        seen: StdMutex<Vec<(String, MetricValue, MetricKind)>>,
    }

    impl RecordingSink {
        fn count(&self, name: &str) -> usize {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .filter(|(n, _, _)| n == name)
                .count()
        }

        fn history_events(&self) -> Vec<String> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(name, value, _)| {
                    if name != EVENTS {
                        return None;
                    }
                    match value {
                        MetricValue::Event(event) => event
                            .get("event")
                            .and_then(|e| e.as_str())
                            .map(str::to_string),
                        MetricValue::Number(_) => None,
                    }
                })
                .collect()
        }
    }

    impl MetricsSink for RecordingSink {
        fn notify(&self, name: &str, value: MetricValue, kind: MetricKind) {
            self.seen
                .lock()
                .unwrap()
                .push((name.to_string(), value, kind));
        }
    }

    /// Fails the first `failures` spawns, then delegates to a TaskFactory.
    struct FlakyFactory {
        inner: TaskFactory,
        failures: AtomicU32,
    }

    impl FlakyFactory {
        fn failing(failures: u32) -> Self {
            Self {
                inner: TaskFactory::new(),
                failures: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl WorkerFactory for FlakyFactory {
        async fn spawn(&self, spec: &FactorySpec) -> Result<SpawnedWorker, SpawnError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SpawnError::Other("injected".to_string()));
            }
            self.inner.spawn(spec).await
        }

        async fn terminate(&self, worker: WorkerId) {
            self.inner.terminate(worker).await;
        }
    }

    fn settings(name: &str, max: u32, init: u32) -> PoolSettings {
        PoolSettings::new(name, FactorySpec::new("task"))
            .with_max_count(max)
            .with_init_count(init)
    }

    async fn coordinator_with(
        pools: Vec<PoolSettings>,
    ) -> (CoordinatorHandle, Arc<TaskFactory>, Arc<RecordingSink>) {
        let factory = Arc::new(TaskFactory::new());
        let sink = Arc::new(RecordingSink::default());
        let handle = Coordinator::new(Arc::clone(&factory) as Arc<dyn WorkerFactory>)
            .with_metrics(Arc::clone(&sink) as Arc<dyn MetricsSink>)
            .spawn_with_pools(pools)
            .await
            .unwrap();
        (handle, factory, sink)
    }

    async fn status_of(handle: &CoordinatorHandle, pool: &str) -> PoolStatus {
        handle
            .pool_status()
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.id == pool)
            .unwrap()
    }

    #[tokio::test]
    async fn init_count_spawns_initial_population() {
        let (handle, factory, _) = coordinator_with(vec![settings("p", 3, 2)]).await;

        let status = status_of(&handle, "p").await;
        assert_eq!(status.capacity, 3);
        assert_eq!(status.created, 2);
        assert_eq!(status.free, 2);
        assert_eq!(status.checked_out, 0);
        assert_eq!(status.available, 3);
        assert_eq!(factory.live_count(), 2);
    }

    #[tokio::test]
    async fn take_and_return_round_trip() {
        let (handle, _, _) = coordinator_with(vec![settings("p", 3, 2)]).await;
        let c1 = ConsumerId::new();

        let worker = handle.take_from("p", c1).await.unwrap();
        let status = status_of(&handle, "p").await;
        assert_eq!(status.free, 1);
        assert_eq!(status.checked_out, 1);

        let stats = handle.member_stats().await.unwrap();
        let held = stats.iter().find(|s| s.worker == worker).unwrap();
        assert_eq!(held.holder.consumer(), Some(c1));

        handle.give_back(worker, ReturnStatus::Ok, c1);
        let status = status_of(&handle, "p").await;
        assert_eq!(status.free, 2);
        assert_eq!(status.checked_out, 0);

        let stats = handle.member_stats().await.unwrap();
        assert!(stats.iter().all(|s| s.holder.is_free()));
    }

    #[tokio::test]
    async fn take_grows_on_demand_up_to_max() {
        let (handle, factory, _) = coordinator_with(vec![settings("p", 3, 1)
            .with_add_member_retry(2)])
        .await;

        let mut workers = HashSet::new();
        for _ in 0..3 {
            let worker = handle.take_from("p", ConsumerId::new()).await.unwrap();
            workers.insert(worker);
        }
        assert_eq!(workers.len(), 3);

        let status = status_of(&handle, "p").await;
        assert_eq!(status.free, 0);
        assert_eq!(status.checked_out, 3);
        assert_eq!(factory.live_count(), 3);

        let err = handle.take_from("p", ConsumerId::new()).await.unwrap_err();
        assert_eq!(err, TakeError::NoMembers);
    }

    #[tokio::test]
    async fn consumer_crash_reclaims_workers() {
        let (handle, factory, _) = coordinator_with(vec![settings("p", 3, 2)]).await;
        let c1 = ConsumerId::new();

        let worker = handle.take_from("p", c1).await.unwrap();
        handle.consumer_exited(c1, ExitReason::Crashed("died".to_string()));

        let status = status_of(&handle, "p").await;
        assert_eq!(status.free, 2);
        assert_eq!(status.checked_out, 0);
        assert_eq!(factory.live_count(), 2);

        // The crashed borrower's worker was destroyed, not recycled.
        let stats = handle.member_stats().await.unwrap();
        assert!(stats.iter().all(|s| s.worker != worker));
    }

    #[tokio::test]
    async fn consumer_normal_exit_keeps_workers() {
        let (handle, _, _) = coordinator_with(vec![settings("p", 3, 2)]).await;
        let c1 = ConsumerId::new();

        let worker = handle.take_from("p", c1).await.unwrap();
        handle.consumer_exited(c1, ExitReason::Normal);

        let status = status_of(&handle, "p").await;
        assert_eq!(status.free, 2);
        assert_eq!(status.checked_out, 0);

        // Same worker, back in the free list.
        let stats = handle.member_stats().await.unwrap();
        let entry = stats.iter().find(|s| s.worker == worker).unwrap();
        assert!(entry.holder.is_free());
    }

    #[tokio::test]
    async fn worker_crash_triggers_replacement() {
        let (handle, factory, _) = coordinator_with(vec![settings("p", 2, 2)]).await;
        let c1 = ConsumerId::new();

        let worker = handle.take_from("p", c1).await.unwrap();
        factory.crash(worker);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = status_of(&handle, "p").await;
        assert_eq!(status.free, 2);
        assert_eq!(status.checked_out, 0);
        assert_eq!(factory.live_count(), 2);

        let stats = handle.member_stats().await.unwrap();
        assert!(stats.iter().all(|s| s.worker != worker));
        assert!(stats.iter().all(|s| s.holder.is_free()));
    }

    #[tokio::test]
    async fn take_any_falls_back_to_freest_pool() {
        let (handle, _, _) =
            coordinator_with(vec![settings("a", 1, 1), settings("b", 2, 2)]).await;

        // Pin down pool a's only worker.
        handle.take_from("a", ConsumerId::new()).await.unwrap();

        // Whichever pool the random strategy lands on, the take must come
        // out of b: a is at capacity and falls through to the free strategy.
        let consumer = ConsumerId::new();
        let worker = handle.take(consumer).await.unwrap();
        let stats = handle.member_stats().await.unwrap();
        let entry = stats.iter().find(|s| s.worker == worker).unwrap();
        assert_eq!(entry.pool, "b");

        let b = status_of(&handle, "b").await;
        assert_eq!(b.free, 1);
        assert_eq!(b.checked_out, 1);
    }

    #[tokio::test]
    async fn cull_respects_population_floor() {
        let pool = settings("p", 5, 2)
            .with_add_member_retry(2)
            .with_cull_interval(TimeSpec::new(100, TimeUnit::Ms))
            .with_max_age(TimeSpec::new(50, TimeUnit::Ms));
        let (handle, factory, _) = coordinator_with(vec![pool]).await;

        // Grow to four in-use workers, then free them all.
        let consumer = ConsumerId::new();
        let mut workers = Vec::new();
        for _ in 0..4 {
            workers.push(handle.take_from("p", consumer).await.unwrap());
        }
        for worker in workers {
            handle.give_back(worker, ReturnStatus::Ok, consumer);
        }
        let status = status_of(&handle, "p").await;
        assert_eq!(status.free, 4);

        // First tick: all four idle past max_age, budget is 4 - (2 - 0) = 2.
        tokio::time::sleep(Duration::from_millis(250)).await;
        let status = status_of(&handle, "p").await;
        assert_eq!(status.free, 2);
        assert_eq!(status.checked_out, 0);
        assert_eq!(factory.live_count(), 2);

        // Further ticks leave the floor alone.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = status_of(&handle, "p").await;
        assert_eq!(status.free, 2);
    }

    #[tokio::test]
    async fn cull_disabled_when_interval_zero() {
        let pool = settings("p", 5, 0)
            .with_add_member_retry(2)
            .with_max_age(TimeSpec::new(1, TimeUnit::Ms));
        let (handle, _, _) = coordinator_with(vec![pool]).await;

        let consumer = ConsumerId::new();
        let w1 = handle.take_from("p", consumer).await.unwrap();
        let w2 = handle.take_from("p", consumer).await.unwrap();
        handle.give_back(w1, ReturnStatus::Ok, consumer);
        handle.give_back(w2, ReturnStatus::Ok, consumer);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let status = status_of(&handle, "p").await;
        assert_eq!(status.free, 2);
    }

    #[tokio::test]
    async fn zero_retry_never_grows() {
        let (handle, factory, _) = coordinator_with(vec![settings("p", 3, 1)
            .with_add_member_retry(0)])
        .await;

        handle.take_from("p", ConsumerId::new()).await.unwrap();
        let err = handle.take_from("p", ConsumerId::new()).await.unwrap_err();
        assert_eq!(err, TakeError::NoMembers);
        assert_eq!(factory.live_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_pool_name_rejected() {
        let (handle, _, _) = coordinator_with(vec![settings("p", 3, 1)]).await;

        let err = handle.add_pool(settings("p", 5, 0)).await.unwrap_err();
        assert_eq!(err, AddPoolError::DuplicatePoolName("p".to_string()));

        // Registry unchanged.
        let rows = handle.pool_status().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].capacity, 3);
    }

    #[tokio::test]
    async fn add_pools_skips_duplicates_and_succeeds() {
        let (handle, _, _) = coordinator_with(vec![settings("p", 3, 1)]).await;

        // The clashing entry is skipped; the new one still registers.
        handle
            .add_pools(vec![settings("p", 5, 0), settings("q", 2, 1)])
            .await
            .unwrap();

        let rows = handle.pool_status().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(status_of(&handle, "p").await.capacity, 3);
        assert_eq!(status_of(&handle, "q").await.capacity, 2);
    }

    #[tokio::test]
    async fn unknown_pool_take_is_no_pool() {
        let (handle, _, _) = coordinator_with(vec![settings("p", 3, 1)]).await;
        let err = handle
            .take_from("nope", ConsumerId::new())
            .await
            .unwrap_err();
        assert_eq!(err, TakeError::NoPool);
    }

    #[tokio::test]
    async fn take_any_without_pools_is_no_pool() {
        let factory = Arc::new(TaskFactory::new());
        let handle = Coordinator::new(factory).spawn();
        let err = handle.take(ConsumerId::new()).await.unwrap_err();
        assert_eq!(err, TakeError::NoPool);
    }

    #[tokio::test]
    async fn spawn_failures_are_absorbed() {
        let factory = Arc::new(FlakyFactory::failing(2));
        let sink = Arc::new(RecordingSink::default());
        let handle = Coordinator::new(Arc::clone(&factory) as Arc<dyn WorkerFactory>)
            .with_metrics(Arc::clone(&sink) as Arc<dyn MetricsSink>)
            .spawn();

        // Both initial spawns fail; the pool still registers.
        handle.add_pool(settings("p", 3, 2)).await.unwrap();
        let status = status_of(&handle, "p").await;
        assert_eq!(status.created, 0);
        assert!(sink
            .history_events()
            .contains(&"add_pids_failed".to_string()));
    }

    #[tokio::test]
    async fn take_retries_through_spawn_failure() {
        let factory = Arc::new(FlakyFactory::failing(1));
        let handle = Coordinator::new(Arc::clone(&factory) as Arc<dyn WorkerFactory>)
            .spawn_with_pools(vec![settings("p", 3, 0).with_add_member_retry(2)])
            .await
            .unwrap();

        // First growth attempt fails, the retry succeeds.
        let worker = handle.take_from("p", ConsumerId::new()).await;
        assert!(worker.is_ok());
    }

    #[tokio::test]
    async fn return_from_non_holder_is_ignored() {
        let (handle, _, _) = coordinator_with(vec![settings("p", 3, 2)]).await;
        let c1 = ConsumerId::new();
        let c2 = ConsumerId::new();

        let worker = handle.take_from("p", c1).await.unwrap();
        handle.give_back(worker, ReturnStatus::Ok, c2);

        let status = status_of(&handle, "p").await;
        assert_eq!(status.checked_out, 1);

        handle.give_back(worker, ReturnStatus::Ok, c1);
        let status = status_of(&handle, "p").await;
        assert_eq!(status.checked_out, 0);
    }

    #[tokio::test]
    async fn unknown_worker_return_is_ignored() {
        let (handle, _, _) = coordinator_with(vec![settings("p", 3, 1)]).await;

        handle.give_back(WorkerId::new(), ReturnStatus::Ok, ConsumerId::new());
        handle.give_back(WorkerId::new(), ReturnStatus::Fail, ConsumerId::new());

        let status = status_of(&handle, "p").await;
        assert_eq!(status.created, 1);
    }

    #[tokio::test]
    async fn failed_return_destroys_and_replaces() {
        let (handle, factory, sink) = coordinator_with(vec![settings("p", 2, 2)]).await;
        let c1 = ConsumerId::new();

        let worker = handle.take_from("p", c1).await.unwrap();
        handle.give_back(worker, ReturnStatus::Fail, c1);

        let status = status_of(&handle, "p").await;
        assert_eq!(status.free, 2);
        assert_eq!(status.checked_out, 0);
        assert_eq!(factory.live_count(), 2);
        assert_eq!(sink.count(KILLED_IN_USE_COUNT), 1);

        let stats = handle.member_stats().await.unwrap();
        assert!(stats.iter().all(|s| s.worker != worker));
    }

    #[tokio::test]
    async fn metrics_emitted_on_take_and_miss() {
        let (handle, _, sink) = coordinator_with(vec![settings("p", 1, 1)]).await;

        handle.take_from("p", ConsumerId::new()).await.unwrap();
        let _ = handle.take_from("p", ConsumerId::new()).await;

        assert_eq!(sink.count(&pool_metric("p", "take_rate")), 2);
        assert_eq!(sink.count(ERROR_NO_MEMBERS_COUNT), 1);
        assert!(sink
            .history_events()
            .contains(&"error_no_members".to_string()));
        assert!(sink.count(&pool_metric("p", "in_use_count")) >= 1);
        assert!(sink.count(&pool_metric("p", "free_count")) >= 1);
    }

    #[tokio::test]
    async fn lease_returns_on_drop() {
        let (handle, _, _) = coordinator_with(vec![settings("p", 3, 2)]).await;

        {
            let lease = handle.lease_from("p", ConsumerId::new()).await.unwrap();
            let status = status_of(&handle, "p").await;
            assert_eq!(status.checked_out, 1);
            drop(lease);
        }

        let status = status_of(&handle, "p").await;
        assert_eq!(status.checked_out, 0);
        assert_eq!(status.free, 2);
    }

    #[tokio::test]
    async fn lease_fail_destroys_worker() {
        let (handle, _, _) = coordinator_with(vec![settings("p", 3, 2)]).await;

        let lease = handle.lease_from("p", ConsumerId::new()).await.unwrap();
        let worker = lease.worker();
        lease.fail();

        let status = status_of(&handle, "p").await;
        assert_eq!(status.checked_out, 0);
        assert_eq!(status.free, 2);

        let stats = handle.member_stats().await.unwrap();
        assert!(stats.iter().all(|s| s.worker != worker));
    }

    #[tokio::test]
    async fn watch_consumer_reports_panic() {
        let (handle, factory, _) = coordinator_with(vec![settings("p", 3, 2)]).await;
        let consumer = ConsumerId::new();

        let worker = handle.take_from("p", consumer).await.unwrap();
        let task = tokio::spawn(async move {
            panic!("consumer blew up");
        });
        watch_consumer(&handle, consumer, task);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = status_of(&handle, "p").await;
        assert_eq!(status.checked_out, 0);
        assert_eq!(status.free, 2);
        assert_eq!(factory.live_count(), 2);

        let stats = handle.member_stats().await.unwrap();
        assert!(stats.iter().all(|s| s.worker != worker));
    }

    #[tokio::test]
    async fn stop_rejects_further_requests() {
        let (handle, _, _) = coordinator_with(vec![settings("p", 3, 1)]).await;

        handle.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = handle.take_from("p", ConsumerId::new()).await.unwrap_err();
        assert_eq!(err, TakeError::Stopped);
        let err = handle.add_pool(settings("q", 1, 0)).await.unwrap_err();
        assert_eq!(err, AddPoolError::Stopped);
    }

    #[tokio::test]
    async fn render_status_includes_totals() {
        let (handle, _, _) =
            coordinator_with(vec![settings("a", 2, 1), settings("b", 4, 2)]).await;

        let table = handle.render_status().await.unwrap();
        assert!(table.contains("Id"));
        assert!(table.contains("a"));
        assert!(table.contains("b"));
        assert!(table.lines().last().unwrap().starts_with("Total"));
    }
}
