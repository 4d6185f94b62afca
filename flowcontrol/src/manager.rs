//! Process-wide coordination of serving capacity.
//!
//! The manager bounds the number of requests served in parallel, queues
//! deferred admissions by buffer fullness, and apportions a shared recharge
//! pool among the clients whose mirror buffers are currently below their
//! limit (the draining set). While the aggregate demand `sum_recharge` is
//! positive, every draining client recharges at
//! `min_recharge * total_recharge / sum_recharge`, where `total_recharge`
//! is the recharge curve evaluated at `sum_recharge`.

use crate::{
    curve::PieceWiseLinear,
    metrics::Metrics,
    prque::{EventQueue, TokenQueue},
    server::ClientNode,
    ServerParams, FIXED_POINT_MULTIPLIER,
};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use lumen_runtime::{AbsTime, Clock};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::debug;

/// Scale of serving-queue priorities: a full buffer queues at this value,
/// an empty one at zero.
const QUEUE_PRIORITY_SCALE: u64 = 1_000_000_000;

/// Client manager configuration.
pub struct Config {
    /// Maximum number of requests served in parallel.
    pub max_parallel_requests: usize,
    /// Long-term average parallelism the recharge pool is sized for. The
    /// default recharge curve is flat at
    /// `target_parallel_requests * FIXED_POINT_MULTIPLIER`.
    pub target_parallel_requests: f64,
    pub metrics: Metrics,
}

struct QueuedStart<C: Clock> {
    node_id: u64,
    reply: Sender<Option<Arc<ClientNode<C>>>>,
}

struct Inner<C: Clock> {
    nodes: HashMap<u64, Arc<ClientNode<C>>>,
    stopped: bool,
    /// `Some` while disabled; dropping the pair wakes all parked waiters.
    enabled_gate: Option<(Sender<()>, Receiver<()>)>,

    parallel_reqs: usize,
    max_parallel_reqs: usize,
    serving_queue: TokenQueue<QueuedStart<C>>,

    curve: PieceWiseLinear,
    total_recharge: u64,
    sum_recharge: u64,
    rc_last_update: AbsTime,
    /// Normalized integrator value: what a client with
    /// `min_recharge == FIXED_POINT_MULTIPLIER` would have recharged since
    /// startup under the shared slope.
    rc_last_int_value: i64,
    /// Draining clients keyed by node id, ordered by the integrator value
    /// at which each is predicted to reach its buffer limit.
    rc_queue: EventQueue<u64>,
}

impl<C: Clock> Inner<C> {
    fn refresh_total_recharge(&mut self) {
        self.total_recharge = self.curve.value_at(self.sum_recharge);
    }

    fn predicted_full(&self, cs: &crate::server::CmNodeState) -> i64 {
        let remaining = (cs.params.buf_limit as i128 - cs.corr_buf_value as i128)
            * FIXED_POINT_MULTIPLIER as i128
            / cs.params.min_recharge as i128;
        (cs.rc_last_int_value as i128 + remaining)
            .clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// Advance the shared recharge integrator to `now` in piecewise-linear
    /// segments, promoting clients whose mirrors reach their limit on the
    /// way. A popped prediction that no longer matches the client's state
    /// (its buffer moved since it was queued) is re-pushed corrected.
    fn update_recharge(&mut self, now: AbsTime) {
        let mut last_update = self.rc_last_update;
        self.rc_last_update = now;
        while self.sum_recharge > 0 {
            let slope = self.total_recharge as f64 / self.sum_recharge as f64;
            let dt = now.saturating_since(last_update).as_nanos() as u64;
            let Some((node_id, next_int_value)) = self.rc_queue.pop() else {
                self.rc_last_int_value += (slope * dt as f64) as i64;
                return;
            };
            let dt_next =
                (((next_int_value - self.rc_last_int_value).max(0)) as f64 / slope) as u64;
            if dt < dt_next {
                self.rc_queue.put(node_id, next_int_value);
                self.rc_last_int_value += (slope * dt as f64) as i64;
                return;
            }
            let Some(node) = self.nodes.get(&node_id).cloned() else {
                continue;
            };
            let mut cs = node.cm_state.lock();
            let predicted = self.predicted_full(&cs);
            if predicted != next_int_value {
                self.rc_queue.put(node_id, predicted);
                continue;
            }
            if cs.corr_buf_value < cs.params.buf_limit as i64 {
                cs.corr_buf_value = cs.params.buf_limit as i64;
                self.sum_recharge -= cs.params.min_recharge;
                self.refresh_total_recharge();
            }
            last_update = last_update + Duration::from_nanos(dt_next);
            self.rc_last_int_value = next_int_value;
        }
    }

    /// Integrate a client's mirror under the shared slope, apply `delta`
    /// (negative for reservations, positive for refunds), and track its
    /// transitions between the draining and full states.
    fn update_node_rc(&mut self, node: &ClientNode<C>, delta: i64, now: AbsTime) {
        self.update_recharge(now);

        let mut cs = node.cm_state.lock();
        let buf_limit = cs.params.buf_limit as i64;
        let mut was_full = true;
        if cs.corr_buf_value != buf_limit {
            was_full = false;
            let gained = (self.rc_last_int_value as i128 - cs.rc_last_int_value as i128)
                * cs.params.min_recharge as i128
                / FIXED_POINT_MULTIPLIER as i128;
            cs.corr_buf_value = (cs.corr_buf_value as i128 + gained)
                .clamp(0, buf_limit as i128) as i64;
            cs.rc_last_int_value = self.rc_last_int_value;
        }
        cs.corr_buf_value = cs.corr_buf_value.saturating_add(delta).max(0);
        let is_full = cs.corr_buf_value >= buf_limit;
        if is_full {
            cs.corr_buf_value = buf_limit;
        }
        if was_full && !is_full {
            self.sum_recharge += cs.params.min_recharge;
            cs.rc_last_int_value = self.rc_last_int_value;
            let predicted = self.predicted_full(&cs);
            self.rc_queue.put(node.id, predicted);
            self.refresh_total_recharge();
        }
        if !was_full && is_full {
            self.sum_recharge -= cs.params.min_recharge;
            self.rc_queue.remove(&node.id);
            self.refresh_total_recharge();
        }
    }
}

/// Coordinates serving slots and the shared recharge pool across all
/// connected clients.
///
/// A manager may have a child manager governing a different resource; the
/// child is enabled only while this manager is idle, and the cascade
/// follows enable/disable transitions.
pub struct ClientManager<C: Clock> {
    clock: C,
    child: Option<Arc<ClientManager<C>>>,
    next_node_id: AtomicU64,
    metrics: Metrics,
    state: Mutex<Inner<C>>,
}

impl<C: Clock> ClientManager<C> {
    pub fn new(config: Config, clock: C) -> Arc<Self> {
        Self::init(config, clock, None)
    }

    /// Create a manager with a child governed by the enable/disable
    /// cascade.
    pub fn with_child(config: Config, clock: C, child: Arc<ClientManager<C>>) -> Arc<Self> {
        Self::init(config, clock, Some(child))
    }

    fn init(config: Config, clock: C, child: Option<Arc<ClientManager<C>>>) -> Arc<Self> {
        let total_recharge =
            (config.target_parallel_requests * FIXED_POINT_MULTIPLIER as f64) as u64;
        Arc::new(Self {
            clock,
            child,
            next_node_id: AtomicU64::new(0),
            metrics: config.metrics,
            state: Mutex::new(Inner {
                nodes: HashMap::new(),
                stopped: false,
                enabled_gate: None,
                parallel_reqs: 0,
                max_parallel_reqs: config.max_parallel_requests,
                serving_queue: TokenQueue::new(),
                curve: PieceWiseLinear::flat(total_recharge),
                total_recharge,
                sum_recharge: 0,
                rc_last_update: AbsTime::ZERO,
                rc_last_int_value: 0,
                rc_queue: EventQueue::new(),
            }),
        })
    }

    pub(crate) fn clock(&self) -> &C {
        &self.clock
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub(crate) fn next_node_id(&self) -> u64 {
        self.next_node_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, node: Arc<ClientNode<C>>) {
        let mut inner = self.state.lock();
        if inner.stopped {
            return;
        }
        {
            let mut cs = node.cm_state.lock();
            cs.corr_buf_value = cs.params.buf_limit as i64;
            cs.rc_last_int_value = inner.rc_last_int_value;
        }
        inner.nodes.insert(node.id, node);
    }

    /// Remove a disconnected client. Any admission still queued for it will
    /// resolve as not-started.
    pub fn remove_node(&self, node: &ClientNode<C>) {
        let mut inner = self.state.lock();
        inner.update_recharge(self.clock.now());
        if inner.nodes.remove(&node.id).is_none() {
            return;
        }
        inner.rc_queue.remove(&node.id);
        let cs = node.cm_state.lock();
        if cs.corr_buf_value < cs.params.buf_limit as i64 {
            inner.sum_recharge -= cs.params.min_recharge;
            inner.refresh_total_recharge();
        }
    }

    /// Revoke membership of every client and fail all queued admissions.
    pub fn stop(&self) {
        let mut inner = self.state.lock();
        inner.stopped = true;
        inner.nodes.clear();
        inner.rc_queue.clear();
        inner.sum_recharge = 0;
        inner.refresh_total_recharge();
        while let Some(start) = inner.serving_queue.pop() {
            let _ = start.reply.send(None);
        }
        inner.enabled_gate = None;
    }

    /// Replace the recharge curve. Takes effect from the current instant;
    /// accumulated recharge is not revised.
    pub fn set_recharge_curve(&self, curve: PieceWiseLinear) {
        let mut inner = self.state.lock();
        inner.update_recharge(self.clock.now());
        inner.curve = curve;
        inner.refresh_total_recharge();
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled_gate.is_none()
    }

    /// Enable or disable admission. Newly arriving requests park on the
    /// gate while disabled; enabling wakes all of them.
    pub fn set_enabled(&self, enabled: bool) {
        let mut inner = self.state.lock();
        if inner.enabled_gate.is_none() == enabled {
            return;
        }
        if enabled {
            inner.enabled_gate = None;
        } else {
            inner.enabled_gate = Some(unbounded());
        }
        if inner.parallel_reqs == 0 {
            if let Some(child) = &self.child {
                child.set_enabled(enabled);
            }
        }
    }

    /// Block while the manager is disabled. Returns `true` if the node lost
    /// membership and the caller should abandon the request.
    pub fn wait_or_stop(&self, node: &ClientNode<C>) -> bool {
        let (mut stop, gate) = {
            let inner = self.state.lock();
            (
                !inner.nodes.contains_key(&node.id),
                inner.enabled_gate.as_ref().map(|(_, rx)| rx.clone()),
            )
        };
        if !stop {
            if let Some(gate) = gate {
                // Woken by disconnection of the gate when the manager is
                // re-enabled
                let _ = gate.recv();
                let inner = self.state.lock();
                stop = !inner.nodes.contains_key(&node.id);
            }
        }
        stop
    }

    fn set_parallel_reqs(&self, inner: &mut Inner<C>, parallel: usize) {
        if parallel == inner.parallel_reqs {
            return;
        }
        if let Some(child) = &self.child {
            if inner.enabled_gate.is_none() {
                if inner.parallel_reqs == 0 {
                    child.set_enabled(false);
                }
                if parallel == 0 {
                    child.set_enabled(true);
                }
            }
        }
        inner.parallel_reqs = parallel;
        self.metrics.parallel.set(parallel as i64);
    }

    /// Admit a request: either take a serving slot now (debiting the
    /// client's mirror) or enqueue a start token at a priority proportional
    /// to the client's buffer fullness. Returns the priority and, when
    /// queued, the token the caller must wait on.
    pub(crate) fn accept(
        self: &Arc<Self>,
        node: &ClientNode<C>,
        buf_value: u64,
        buf_limit: u64,
        max_cost: u64,
        now: AbsTime,
    ) -> (i64, Option<StartToken<C>>) {
        let mut inner = self.state.lock();
        let priority =
            (QUEUE_PRIORITY_SCALE as u128 * buf_value as u128 / buf_limit as u128) as i64;

        if inner.stopped {
            let (reply, signal) = bounded(1);
            let _ = reply.send(None);
            return (
                priority,
                Some(StartToken {
                    cm: self.clone(),
                    max_cost,
                    signal,
                }),
            );
        }

        if inner.parallel_reqs == inner.max_parallel_reqs {
            let (reply, signal) = bounded(1);
            inner.serving_queue.push(QueuedStart { node_id: node.id, reply }, priority);
            self.metrics.queued.inc();
            debug!(node = node.id, priority, "serving queue full, deferring request");
            return (
                priority,
                Some(StartToken {
                    cm: self.clone(),
                    max_cost,
                    signal,
                }),
            );
        }

        let parallel = inner.parallel_reqs + 1;
        self.set_parallel_reqs(&mut inner, parallel);
        {
            let mut cs = node.cm_state.lock();
            cs.serving_started = now;
            cs.serving_max_cost = max_cost;
        }
        inner.update_node_rc(node, -(max_cost.min(i64::MAX as u64) as i64), now);
        self.metrics.accepted.inc();
        (priority, None)
    }

    /// Record serving start for a request whose start token resolved.
    pub(crate) fn started(&self, node: &ClientNode<C>, max_cost: u64) {
        let mut inner = self.state.lock();
        let now = self.clock.now();
        {
            let mut cs = node.cm_state.lock();
            cs.serving_started = now;
            cs.serving_max_cost = max_cost;
        }
        inner.update_node_rc(node, -(max_cost.min(i64::MAX as u64) as i64), now);
        self.metrics.accepted.inc();
    }

    /// Account a finished request: refund the unused cost to the client's
    /// mirror and hand the serving slot to the highest-priority queued
    /// start, if any. Returns the mirror's buffer value so the caller can
    /// reconcile the authoritative buffer upward.
    pub(crate) fn processed(
        &self,
        node: &ClientNode<C>,
        max_cost: u64,
        real_cost: u64,
        now: AbsTime,
    ) -> u64 {
        let mut inner = self.state.lock();
        let real_cost = {
            let cs = node.cm_state.lock();
            real_cost.min(cs.serving_max_cost).min(max_cost)
        };
        inner.update_node_rc(node, (max_cost - real_cost) as i64, now);
        let corr = {
            let cs = node.cm_state.lock();
            cs.corr_buf_value.max(0) as u64
        };
        self.metrics.served.inc();

        loop {
            let Some(start) = inner.serving_queue.pop() else {
                break;
            };
            match inner.nodes.get(&start.node_id).cloned() {
                Some(next) => {
                    // The slot transfers to the woken waiter; if it already
                    // gave up, try the next token
                    if start.reply.send(Some(next)).is_ok() {
                        return corr;
                    }
                }
                None => {
                    let _ = start.reply.send(None);
                }
            }
        }
        let parallel = inner.parallel_reqs - 1;
        self.set_parallel_reqs(&mut inner, parallel);
        corr
    }

    /// Propagate a parameter change to the manager-side mirror: retire the
    /// draining share held under the old rate and re-enter the draining set
    /// under the new one.
    pub(crate) fn update_params(&self, node: &ClientNode<C>, params: ServerParams, now: AbsTime) {
        let mut inner = self.state.lock();
        inner.update_recharge(now);

        let mut cs = node.cm_state.lock();
        if cs.corr_buf_value < cs.params.buf_limit as i64 {
            let gained = (inner.rc_last_int_value as i128 - cs.rc_last_int_value as i128)
                * cs.params.min_recharge as i128
                / FIXED_POINT_MULTIPLIER as i128;
            cs.corr_buf_value = (cs.corr_buf_value as i128 + gained)
                .clamp(0, cs.params.buf_limit as i128) as i64;
            inner.sum_recharge -= cs.params.min_recharge;
            inner.rc_queue.remove(&node.id);
        }
        cs.rc_last_int_value = inner.rc_last_int_value;

        if params.buf_limit > cs.params.buf_limit {
            cs.corr_buf_value += (params.buf_limit - cs.params.buf_limit) as i64;
        } else if cs.corr_buf_value > params.buf_limit as i64 {
            cs.corr_buf_value = params.buf_limit as i64;
        }
        cs.params = params;

        if cs.corr_buf_value < params.buf_limit as i64 {
            inner.sum_recharge += params.min_recharge;
            let predicted = inner.predicted_full(&cs);
            inner.rc_queue.put(node.id, predicted);
        }
        inner.refresh_total_recharge();
    }

    #[cfg(test)]
    pub(crate) fn parallel_reqs(&self) -> usize {
        self.state.lock().parallel_reqs
    }

    #[cfg(test)]
    pub(crate) fn sum_recharge(&self) -> u64 {
        self.state.lock().sum_recharge
    }
}

/// A queued admission. Waiting blocks until the manager pops the token and
/// transfers a serving slot, or membership is revoked.
pub struct StartToken<C: Clock> {
    cm: Arc<ClientManager<C>>,
    max_cost: u64,
    pub(crate) signal: Receiver<Option<Arc<ClientNode<C>>>>,
}

impl<C: Clock> StartToken<C> {
    /// Block until a serving slot is granted. Returns `false` if the client
    /// lost membership before a slot became free; the caller should treat
    /// that as request abandonment, not rejection.
    pub fn wait(self) -> bool {
        match self.signal.recv() {
            Ok(Some(node)) => {
                self.cm.started(&node, self.max_cost);
                true
            }
            _ => false,
        }
    }
}
