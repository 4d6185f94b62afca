//! Server-side representation of a connected client.

use crate::{
    logger::EventLog,
    manager::{ClientManager, StartToken},
    recharge_amount, ServerParams, DEC_PARAM_DELAY,
};
use lumen_runtime::{AbsTime, Clock};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

struct ScheduledUpdate {
    time: AbsTime,
    params: ServerParams,
}

pub(crate) struct NodeState {
    params: ServerParams,
    buf_value: u64,
    last_time: AbsTime,
    update_schedule: VecDeque<ScheduledUpdate>,
    /// Cumulative declared cost of accepted requests.
    sum_cost: u64,
    /// `sum_cost` snapshot per accepted request index, so the reply can
    /// report a buffer value unaffected by later admissions.
    accepted: HashMap<u64, u64>,
    log: EventLog,
}

/// Manager-side mirror of a client's buffer, guarded by its own lock so the
/// manager can integrate it without touching the node's main state.
pub(crate) struct CmNodeState {
    pub params: ServerParams,
    /// Buffer value under the shared recharge slope, signed so reservation
    /// debits can be applied before clamping.
    pub corr_buf_value: i64,
    /// The manager's normalized integrator value when this mirror was last
    /// integrated.
    pub rc_last_int_value: i64,
    pub serving_started: AbsTime,
    pub serving_max_cost: u64,
}

/// Result of [`ClientNode::accept_request`].
pub enum AcceptOutcome<C: Clock> {
    /// The buffer cannot cover the declared cost; `deficit` is the missing
    /// amount. Rejection is an admission decision, not an error.
    Rejected { deficit: u64 },
    /// The request was admitted and a serving slot is already held.
    Started { priority: i64 },
    /// The request was admitted but all serving slots are busy. The caller
    /// must block on the token before serving.
    Queued {
        priority: i64,
        token: StartToken<C>,
    },
}

/// The flow control system's representation of one connected client (server
/// side).
///
/// A node is created on peer handshake and removed from its manager on
/// disconnect. All operations integrate the buffer to the current clock
/// reading first. For a single client, `accept_request`,
/// `request_processed` and reply emission must be totally ordered by
/// request id; the client-side estimator depends on replies arriving in
/// send order.
pub struct ClientNode<C: Clock> {
    cm: Arc<ClientManager<C>>,
    pub(crate) id: u64,
    inner: Mutex<NodeState>,
    pub(crate) cm_state: Mutex<CmNodeState>,
}

impl<C: Clock> ClientNode<C> {
    pub fn new(cm: Arc<ClientManager<C>>, params: ServerParams) -> Arc<Self> {
        let now = cm.clock().now();
        let node = Arc::new(Self {
            id: cm.next_node_id(),
            inner: Mutex::new(NodeState {
                params,
                buf_value: params.buf_limit,
                last_time: now,
                update_schedule: VecDeque::new(),
                sum_cost: 0,
                accepted: HashMap::new(),
                log: EventLog::new(Duration::from_secs(1)),
            }),
            cm_state: Mutex::new(CmNodeState {
                params,
                corr_buf_value: params.buf_limit as i64,
                rc_last_int_value: 0,
                serving_started: AbsTime::ZERO,
                serving_max_cost: 0,
            }),
            cm: cm.clone(),
        });
        cm.register(node.clone());
        node
    }

    /// Apply due scheduled updates, then integrate the buffer to `now`.
    fn update(&self, st: &mut NodeState, now: AbsTime) {
        while st
            .update_schedule
            .front()
            .is_some_and(|scheduled| scheduled.time <= now)
        {
            let Some(scheduled) = st.update_schedule.pop_front() else {
                break;
            };
            // Integrate under the old rate up to the scheduled instant
            Self::recalc_bv(st, scheduled.time);
            self.apply_params(st, scheduled.params, scheduled.time);
        }
        Self::recalc_bv(st, now);
    }

    fn recalc_bv(st: &mut NodeState, now: AbsTime) {
        let dt = now.saturating_since(st.last_time);
        st.buf_value = st
            .buf_value
            .saturating_add(recharge_amount(st.params.min_recharge, dt))
            .min(st.params.buf_limit);
        st.last_time = now;
        let (bv, params) = (st.buf_value, st.params);
        st.log.add(now, || {
            format!(
                "updated bv={bv} mrr={} limit={}",
                params.min_recharge, params.buf_limit
            )
        });
    }

    fn apply_params(&self, st: &mut NodeState, params: ServerParams, now: AbsTime) {
        if params.buf_limit > st.params.buf_limit {
            st.buf_value += params.buf_limit - st.params.buf_limit;
        } else if st.buf_value > params.buf_limit {
            st.buf_value = params.buf_limit;
        }
        st.params = params;
        self.cm.update_params(self, params, now);
    }

    /// Update the flow control parameters assigned to this client.
    ///
    /// Increases of the recharge rate take effect immediately and discard
    /// any pending schedule. Decreases are delayed by [`DEC_PARAM_DELAY`]
    /// so the client cannot underrun on requests sent before it saw the
    /// announcement; the pending schedule stays monotonically decreasing in
    /// rate, so a later relaxation is never silently dropped.
    pub fn update_params(&self, params: ServerParams) {
        let mut st = self.inner.lock();
        let now = self.cm.clock().now();
        self.update(&mut st, now);

        if params.min_recharge >= st.params.min_recharge {
            st.update_schedule.clear();
            self.apply_params(&mut st, params, now);
            return;
        }
        for i in 0..st.update_schedule.len() {
            if params.min_recharge >= st.update_schedule[i].params.min_recharge {
                st.update_schedule[i].params = params;
                st.update_schedule.truncate(i + 1);
                return;
            }
        }
        st.update_schedule.push_back(ScheduledUpdate {
            time: now + DEC_PARAM_DELAY,
            params,
        });
    }

    /// Decide whether a new request with the given declared maximum cost
    /// can be accepted. If accepted, `max_cost` is deducted from the buffer
    /// and the manager either grants a serving slot or hands back a token
    /// to block on.
    pub fn accept_request(&self, req_id: u64, index: u64, max_cost: u64) -> AcceptOutcome<C> {
        let mut st = self.inner.lock();
        let now = self.cm.clock().now();
        self.update(&mut st, now);

        if max_cost > st.buf_value {
            let bv = st.buf_value;
            st.log
                .add(now, || format!("rejected req_id={req_id} bv={bv} max_cost={max_cost}"));
            st.log.dump(now);
            self.cm.metrics().rejected.inc();
            return AcceptOutcome::Rejected {
                deficit: max_cost - st.buf_value,
            };
        }
        st.buf_value -= max_cost;
        st.sum_cost += max_cost;
        let sum_cost = st.sum_cost;
        st.accepted.insert(index, sum_cost);
        let (bv, sum_cost) = (st.buf_value, st.sum_cost);
        st.log.add(now, || {
            format!("accepted req_id={req_id} bv={bv} max_cost={max_cost} sum_cost={sum_cost}")
        });

        let (priority, wait) =
            self.cm
                .accept(self, st.buf_value, st.params.buf_limit, max_cost, now);
        match wait {
            None => AcceptOutcome::Started { priority },
            Some(token) => AcceptOutcome::Queued { priority, token },
        }
    }

    /// Reconcile the buffer after a request finished and return the buffer
    /// value to report in the reply.
    ///
    /// The manager refunds the unused `max_cost - real_cost` to this
    /// client's mirror, and the mirror (which integrates under the shared
    /// recharge slope) may lift the node-side buffer. The reported value
    /// excludes the cost of requests admitted after this one, which is
    /// exactly what the client-side estimator reconciles against.
    pub fn request_processed(
        &self,
        req_id: u64,
        index: u64,
        max_cost: u64,
        real_cost: u64,
    ) -> u64 {
        let mut st = self.inner.lock();
        let now = self.cm.clock().now();
        self.update(&mut st, now);

        let corr = self.cm.processed(self, max_cost, real_cost, now);
        if corr > st.buf_value {
            st.buf_value = corr;
        }
        let accepted_at = st.accepted.remove(&index).unwrap_or(st.sum_cost);
        let bv = st.buf_value + st.sum_cost - accepted_at;
        let (buf_value, sum_cost) = (st.buf_value, st.sum_cost);
        st.log.add(now, || {
            format!(
                "processed req_id={req_id} bv={buf_value} max_cost={max_cost} \
                 real_cost={real_cost} sum_cost={sum_cost} reported={bv}"
            )
        });
        bv
    }

    /// Dump the recent event log, if event tracing is enabled.
    pub fn dump_logs(&self) {
        let mut st = self.inner.lock();
        let now = self.cm.clock().now();
        st.log.dump(now);
    }

    #[cfg(test)]
    pub(crate) fn buf_value(&self) -> u64 {
        self.inner.lock().buf_value
    }

    #[cfg(test)]
    pub(crate) fn corr_buf_value(&self) -> i64 {
        self.cm_state.lock().corr_buf_value
    }
}
