//! Per-message-code request cost tables and runtime cost statistics.

use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::debug;

/// Linear cost function of one message code: a request carrying `n` items
/// costs `base_cost + n * req_cost`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestCosts {
    pub base_cost: u64,
    pub req_cost: u64,
}

/// Cost list entry as announced to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCostEntry {
    pub msg_code: u64,
    pub base_cost: u64,
    pub req_cost: u64,
}

/// Cost functions for every served message code, in announcement order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCostList(pub Vec<RequestCostEntry>);

impl RequestCostList {
    /// Index the list by message code for lookup on the serving path.
    pub fn decode(&self) -> RequestCostTable {
        let mut costs = HashMap::new();
        for entry in &self.0 {
            costs.insert(
                entry.msg_code,
                RequestCosts {
                    base_cost: entry.base_cost,
                    req_cost: entry.req_cost,
                },
            );
        }
        RequestCostTable { costs }
    }
}

/// Cost table keyed by message code.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestCostTable {
    costs: HashMap<u64, RequestCosts>,
}

impl RequestCostTable {
    pub fn get(&self, msg_code: u64) -> Option<&RequestCosts> {
        self.costs.get(&msg_code)
    }

    /// Estimated cost of a request carrying `req_cnt` items.
    pub fn estimate(&self, msg_code: u64, req_cnt: u64) -> Option<u64> {
        self.costs
            .get(&msg_code)
            .map(|c| c.base_cost + req_cnt * c.req_cost)
    }
}

const BUCKET_COUNT: usize = 10;

/// Tracks how real serving costs relate to the announced estimates.
///
/// Each observation lands in a power-of-two bucket of the real/estimated
/// ratio, from 1/16 and below up to beyond 16. A heavily skewed histogram
/// means the cost table no longer reflects the serving backend.
pub struct CostStats {
    costs: RequestCostTable,
    stats: HashMap<u64, [AtomicU64; BUCKET_COUNT]>,
}

impl CostStats {
    pub fn new(costs: RequestCostTable) -> Self {
        let stats = costs
            .costs
            .keys()
            .map(|code| (*code, Default::default()))
            .collect();
        Self { costs, stats }
    }

    /// Record the real cost of one served request.
    pub fn update(&self, msg_code: u64, req_cnt: u64, real_cost: u64) {
        let Some(c) = self.costs.get(msg_code) else {
            return;
        };
        let estimate = c.base_cost + req_cnt * c.req_cost;
        let mut cost = real_cost << 4;
        let mut bucket = 0;
        while bucket < BUCKET_COUNT - 1 && cost > estimate {
            bucket += 1;
            cost >>= 1;
        }
        self.stats[&msg_code][bucket].fetch_add(1, Ordering::Relaxed);
    }

    /// Log the collected ratio histograms.
    pub fn dump(&self) {
        for (code, buckets) in &self.stats {
            let buckets: Vec<u64> = buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect();
            debug!(code, ?buckets, "request cost ratio histogram (1/16x .. >16x)");
        }
    }
}
