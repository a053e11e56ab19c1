//! corral: coordinator for named pools of reusable worker resources.
//!
//! A single coordinator task owns any number of named pools, hands workers
//! out under exclusive ownership, reclaims them when borrowers return them
//! or die, grows pools on demand up to a ceiling, and culls idle workers
//! down to a configured floor.

mod coordinator;
mod error;
mod lease;
mod member;
mod pool;
mod status;
mod telemetry;

pub mod config;
pub mod factory;
pub mod metrics;

pub use coordinator::{Coordinator, CoordinatorHandle};
pub use error::{AddPoolError, CoordinatorError, TakeError};
pub use lease::{watch_consumer, Lease};
pub use member::{ConsumerId, ExitReason, Holder, MemberStat, ReturnStatus, WorkerId};
pub use status::{render_status_table, PoolStatus};
pub use telemetry::init_tracing;

pub use config::{ConfigError, CorralConfig, PoolSettings, TimeSpec, TimeUnit};
pub use factory::{FactorySpec, SpawnError, SpawnedWorker, TaskFactory, WorkerFactory};
pub use metrics::{MetricKind, MetricValue, MetricsSink, NullSink};
