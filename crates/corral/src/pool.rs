//! Per-pool state and anonymous-take selection helpers.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::config::PoolSettings;
use crate::factory::FactorySpec;
use crate::member::WorkerId;

/// One named pool's record.
///
/// The free list is FIFO: takes pop the front, returns and growth push the
/// back. Culling selects by idle timestamp, never by list position alone.
pub(crate) struct Pool {
    pub name: String,
    pub max_count: u32,
    pub init_count: u32,
    pub start_spec: FactorySpec,
    pub add_member_retry: u32,
    /// Zero disables culling.
    pub cull_interval: Duration,
    pub max_age: Duration,
    pub free: VecDeque<WorkerId>,
    pub in_use_count: u32,
}

impl Pool {
    pub fn from_settings(settings: PoolSettings) -> Self {
        Self {
            name: settings.name,
            max_count: settings.max_count,
            init_count: settings.init_count,
            start_spec: settings.start_spec,
            add_member_retry: settings.add_member_retry,
            cull_interval: settings.cull_interval.as_duration(),
            max_age: settings.max_age.as_duration(),
            free: VecDeque::new(),
            in_use_count: 0,
        }
    }

    pub fn free_count(&self) -> u32 {
        self.free.len() as u32
    }

    /// Total live workers, free and held.
    pub fn created(&self) -> u32 {
        self.in_use_count + self.free_count()
    }

    /// Upper bound on further takes this pool could satisfy with growth.
    pub fn available(&self) -> u32 {
        self.max_count.saturating_sub(self.in_use_count)
    }

    /// Whether `n` more workers would still fit under `max_count`.
    pub fn fits(&self, n: u32) -> bool {
        self.created() + n <= self.max_count
    }

    /// How many free workers may be culled while the pool can still climb
    /// back to `init_count` with its current in-use population.
    pub fn cull_budget(&self) -> i64 {
        i64::from(self.free_count()) - (i64::from(self.init_count) - i64::from(self.in_use_count))
    }
}

/// Pool with the strictly greatest free count, first encountered wins ties.
/// All-zero means no match.
pub(crate) fn max_free_pool<'a>(
    selector: &'a [String],
    pools: &HashMap<String, Pool>,
) -> Option<&'a str> {
    fold_pools(selector, pools, |pool| pool.free_count())
}

/// Pool with the strictly greatest headroom under `max_count`.
pub(crate) fn max_avail_pool<'a>(
    selector: &'a [String],
    pools: &HashMap<String, Pool>,
) -> Option<&'a str> {
    fold_pools(selector, pools, |pool| pool.available())
}

fn fold_pools<'a>(
    selector: &'a [String],
    pools: &HashMap<String, Pool>,
    score: impl Fn(&Pool) -> u32,
) -> Option<&'a str> {
    let mut best: Option<(&str, u32)> = None;
    for name in selector {
        let Some(pool) = pools.get(name) else {
            continue;
        };
        let value = score(pool);
        if value > 0 && best.is_none_or(|(_, max)| value > max) {
            best = Some((name, value));
        }
    }
    best.map(|(name, _)| name)
}
