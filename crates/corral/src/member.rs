//! Identity and bookkeeping types for pool members and their borrowers.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Unique identifier for a pooled worker.
///
/// Uses UUID v4 for guaranteed uniqueness. Impossible to confuse with array
/// indices or accidentally reuse. Assigned by the factory at spawn time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(uuid::Uuid);

impl WorkerId {
    /// Generate a new unique worker ID.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a borrowing consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(uuid::Uuid);

impl ConsumerId {
    /// Generate a new unique consumer ID.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for ConsumerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who currently owns a worker: nobody, or one consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Holder {
    Free,
    Consumer(ConsumerId),
}

impl Holder {
    pub fn is_free(&self) -> bool {
        matches!(self, Holder::Free)
    }

    pub fn consumer(&self) -> Option<ConsumerId> {
        match self {
            Holder::Free => None,
            Holder::Consumer(c) => Some(*c),
        }
    }
}

/// Why a worker or consumer terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Clean completion.
    Normal,
    /// Anything else: panic, kill, broken channel.
    Crashed(String),
}

impl ExitReason {
    pub fn is_normal(&self) -> bool {
        matches!(self, ExitReason::Normal)
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Normal => write!(f, "normal"),
            ExitReason::Crashed(why) => write!(f, "crashed: {why}"),
        }
    }
}

/// Consumer's verdict when handing a worker back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnStatus {
    /// Worker is healthy, put it back in the free list.
    Ok,
    /// Worker is broken, destroy it and spawn a replacement.
    Fail,
}

/// Coordinator-side record of one live worker.
///
/// `since` marks the last holder transition and drives idle-age culling.
/// The watch handle belongs to the exit-adapter task; it is aborted when the
/// member is removed so a factory-initiated terminate does not loop back as
/// a spurious exit event.
pub(crate) struct MemberEntry {
    pub pool_name: String,
    pub holder: Holder,
    pub since: Instant,
    pub watch: tokio::task::JoinHandle<()>,
}

/// Coordinator-side record of one consumer holding at least one worker.
///
/// `held` keeps insertion order; consumer-exit reclamation walks it front to
/// back.
#[derive(Default)]
pub(crate) struct ConsumerEntry {
    pub held: Vec<WorkerId>,
}

/// Snapshot row of the member index, as returned by `member_stats`.
#[derive(Debug, Clone, Serialize)]
pub struct MemberStat {
    pub worker: WorkerId,
    pub pool: String,
    pub holder: Holder,
    /// Time since the last holder transition.
    #[serde(with = "duration_secs")]
    pub age: Duration,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_f64(d.as_secs_f64())
    }
}
