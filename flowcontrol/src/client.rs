//! Client-side estimator of a server's flow-control buffer.

use crate::{logger::EventLog, recharge_amount, ServerParams, FC_TIME_CONST};
use lumen_runtime::{AbsTime, Clock};
use parking_lot::Mutex;
use std::{collections::HashMap, time::Duration};

/// Head room added to cost estimates, absorbing the send-to-receive jitter
/// between the client's clock and the server's admission instant.
const SAFETY_MARGIN: Duration = Duration::from_millis(1);

struct ServerNodeState {
    params: ServerParams,
    buf_estimate: u64,
    /// Whether the estimate is currently integrating upward. The client
    /// does not know when its requests arrive at the server, so recharge is
    /// only believed once a reply's buffer feedback confirms it.
    buf_recharge: bool,
    last_time: AbsTime,
    /// Cumulative declared cost of queued requests.
    sum_cost: u64,
    /// `sum_cost` snapshot per in-flight request id.
    pending: HashMap<u64, u64>,
    log: EventLog,
}

/// The flow control system's representation of one upstream server (client
/// side).
///
/// Predicts whether a request can be sent without underrunning the
/// server-side buffer and reconciles the prediction against the
/// authoritative buffer values carried in replies. Requests must be sent in
/// the same order as the [`ServerNode::queued_request`] calls, and replies
/// arrive in that order too.
pub struct ServerNode<C: Clock> {
    clock: C,
    inner: Mutex<ServerNodeState>,
}

impl<C: Clock> ServerNode<C> {
    pub fn new(params: ServerParams, clock: C) -> Self {
        let last_time = clock.now();
        Self {
            clock,
            inner: Mutex::new(ServerNodeState {
                params,
                buf_estimate: params.buf_limit,
                buf_recharge: false,
                last_time,
                sum_cost: 0,
                pending: HashMap::new(),
                log: EventLog::new(Duration::from_secs(1)),
            }),
        }
    }

    fn recalc_ble(st: &mut ServerNodeState, now: AbsTime) {
        if now < st.last_time {
            return;
        }
        if st.buf_recharge {
            let dt = now.saturating_since(st.last_time);
            st.buf_estimate = st
                .buf_estimate
                .saturating_add(recharge_amount(st.params.min_recharge, dt));
            if st.buf_estimate >= st.params.buf_limit {
                st.buf_estimate = st.params.buf_limit;
                st.buf_recharge = false;
            }
        }
        st.last_time = now;
        let (est, params) = (st.buf_estimate, st.params);
        st.log.add(now, || {
            format!(
                "updated est={est} mrr={} limit={}",
                params.min_recharge, params.buf_limit
            )
        });
    }

    /// Minimum waiting time before a request with the given maximum cost
    /// can be sent, and the relative buffer level (estimate over limit)
    /// remaining after sending it.
    pub fn can_send(&self, max_cost: u64) -> (Duration, f64) {
        let mut st = self.inner.lock();
        let now = self.clock.now();
        Self::recalc_ble(&mut st, now);

        let max_cost = max_cost
            .saturating_add(recharge_amount(st.params.min_recharge, SAFETY_MARGIN))
            .min(st.params.buf_limit);
        if st.buf_estimate >= max_cost {
            let rel_buf = (st.buf_estimate - max_cost) as f64 / st.params.buf_limit as f64;
            let est = st.buf_estimate;
            st.log.add(now, || {
                format!("can_send est={est} max_cost={max_cost} rel_buf={rel_buf}")
            });
            return (Duration::ZERO, rel_buf);
        }
        let wait_nanos = (max_cost - st.buf_estimate) as u128 * FC_TIME_CONST.as_nanos()
            / st.params.min_recharge as u128;
        let wait = Duration::from_nanos(wait_nanos.min(u64::MAX as u128) as u64);
        let est = st.buf_estimate;
        st.log.add(now, || {
            format!("can_send est={est} max_cost={max_cost} wait={wait:?}")
        });
        (wait, 0.0)
    }

    /// Debit the estimate for a request about to enter the send queue.
    /// Requests must be sent in the same order as these calls are made.
    pub fn queued_request(&self, req_id: u64, max_cost: u64) {
        let mut st = self.inner.lock();
        let now = self.clock.now();
        Self::recalc_ble(&mut st, now);

        st.buf_estimate = st.buf_estimate.saturating_sub(max_cost);
        st.sum_cost += max_cost;
        let sum_cost = st.sum_cost;
        st.pending.insert(req_id, sum_cost);
        let (est, sum_cost) = (st.buf_estimate, st.sum_cost);
        st.log.add(now, || {
            format!("queued req_id={req_id} est={est} max_cost={max_cost} sum_cost={sum_cost}")
        });
    }

    /// Reconcile the estimate against the authoritative buffer value
    /// reported in a reply. A reply for an unknown request id is dropped,
    /// so protocol-layer duplicates are harmless.
    pub fn received_reply(&self, req_id: u64, reported_bv: u64) {
        let mut st = self.inner.lock();
        let now = self.clock.now();
        Self::recalc_ble(&mut st, now);

        let reported_bv = reported_bv.min(st.params.buf_limit);
        let Some(sc) = st.pending.get(&req_id).copied() else {
            return;
        };
        // Cost of requests queued after this one: the report excludes them
        let cc = st.sum_cost - sc;
        st.buf_estimate = reported_bv.saturating_sub(cc);
        st.buf_recharge = st.buf_estimate < st.params.buf_limit;
        st.last_time = now;
        // Replies arrive in send order, so entries at or below the matched
        // snapshot can never be matched anymore
        st.pending.retain(|_, snapshot| *snapshot > sc);
        let (est, sum_cost) = (st.buf_estimate, st.sum_cost);
        st.log.add(now, || {
            format!(
                "received req_id={req_id} est={est} reported={reported_bv} \
                 sum_cost={sum_cost} queued_at={sc}"
            )
        });
    }

    /// Apply a parameter update announced by the server.
    pub fn update_params(&self, params: ServerParams) {
        let mut st = self.inner.lock();
        let now = self.clock.now();
        Self::recalc_ble(&mut st, now);

        if params.buf_limit > st.params.buf_limit {
            st.buf_estimate += params.buf_limit - st.params.buf_limit;
        } else if st.buf_estimate > params.buf_limit {
            st.buf_estimate = params.buf_limit;
        }
        st.params = params;
    }

    /// Dump the recent event log, if event tracing is enabled.
    pub fn dump_logs(&self) {
        let mut st = self.inner.lock();
        let now = self.clock.now();
        st.log.dump(now);
    }

    #[cfg(test)]
    pub(crate) fn buf_estimate(&self) -> u64 {
        self.inner.lock().buf_estimate
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }
}
