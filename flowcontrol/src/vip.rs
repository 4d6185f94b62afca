//! Priority bandwidth assignment for named clients.

use parking_lot::Mutex;
use std::{collections::HashMap, hash::Hash};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("bandwidth too small")]
    BandwidthTooSmall,
    #[error("total bandwidth exceeded")]
    TotalBandwidthExceeded,
}

/// Signals the peer set how the free (non-priority) connection budget
/// should be recomputed, with the current priority-client count and the
/// bandwidth of currently connected priority clients. Called inside the
/// pool lock; the peer set must not call back into the pool synchronously.
pub type ConnLimitFn = dyn Fn(usize, u64) + Send;

/// Per-client hook applied when the client's assigned bandwidth changes
/// while it is connected.
pub type UpdateBwFn = dyn Fn(u64) + Send;

#[derive(Default)]
struct VipClientInfo {
    /// Assigned bandwidth; zero for tracked non-priority clients.
    bw: u64,
    connected: bool,
    update_bw: Option<Box<UpdateBwFn>>,
}

struct PoolState<I> {
    clients: HashMap<I, VipClientInfo>,
    total_vip_bw: u64,
    total_connected_bw: u64,
    vip_count: usize,
    conn_limit: Box<ConnLimitFn>,
}

/// Stores the guaranteed bandwidth shares of priority clients.
///
/// A client holding a non-zero share is never refused connection. The sum
/// of assigned shares can never exceed the total available bandwidth, and
/// no partial change is ever applied: a violating assignment fails with the
/// pool untouched.
pub struct VipPool<I: Eq + Hash + Clone> {
    total_bw: u64,
    min_bandwidth: u64,
    state: Mutex<PoolState<I>>,
}

impl<I: Eq + Hash + Clone> VipPool<I> {
    pub fn new(total_bw: u64, min_bandwidth: u64, conn_limit: Box<ConnLimitFn>) -> Self {
        Self {
            total_bw,
            min_bandwidth,
            state: Mutex::new(PoolState {
                clients: HashMap::new(),
                total_vip_bw: 0,
                total_connected_bw: 0,
                vip_count: 0,
                conn_limit,
            }),
        }
    }

    /// Total bandwidth assignable to priority clients.
    pub fn total_bandwidth(&self) -> u64 {
        self.total_bw
    }

    /// Minimum non-zero bandwidth assignable to a single client.
    pub fn minimum_bandwidth(&self) -> u64 {
        self.min_bandwidth
    }

    /// Bandwidth currently assigned to a client; zero if none.
    pub fn client_bandwidth(&self, id: &I) -> u64 {
        let st = self.state.lock();
        st.clients.get(id).map_or(0, |c| c.bw)
    }

    /// Assign priority bandwidth to a client, with immediate effect if it
    /// is connected. A zero assignment revokes priority.
    pub fn set_client_bandwidth(&self, id: I, bw: u64) -> Result<(), Error> {
        if bw != 0 && bw < self.min_bandwidth {
            return Err(Error::BandwidthTooSmall);
        }
        let mut st = self.state.lock();

        let (old_bw, connected) = st
            .clients
            .get(&id)
            .map_or((0, false), |c| (c.bw, c.connected));
        if st.total_vip_bw - old_bw + bw > self.total_bw {
            return Err(Error::TotalBandwidthExceeded);
        }
        st.total_vip_bw = st.total_vip_bw - old_bw + bw;
        if old_bw != 0 {
            st.vip_count -= 1;
        }
        if bw != 0 {
            st.vip_count += 1;
        }

        if bw != 0 || connected {
            let entry = st.clients.entry(id).or_default();
            entry.bw = bw;
            if let Some(update_bw) = &entry.update_bw {
                update_bw(bw);
            }
        } else {
            st.clients.remove(&id);
        }
        if connected {
            st.total_connected_bw = st.total_connected_bw - old_bw + bw;
            (st.conn_limit)(st.vip_count, st.total_connected_bw);
        }
        Ok(())
    }

    /// Mark a client connected, registering its bandwidth-update hook.
    /// Returns the guaranteed bandwidth and whether the connection is new;
    /// a duplicate connect is refused.
    pub fn connect(&self, id: I, update_bw: Box<UpdateBwFn>) -> (u64, bool) {
        let mut st = self.state.lock();
        let entry = st.clients.entry(id).or_default();
        if entry.connected {
            return (0, false);
        }
        entry.connected = true;
        entry.update_bw = Some(update_bw);
        let bw = entry.bw;
        st.total_connected_bw += bw;
        (st.conn_limit)(st.vip_count, st.total_connected_bw);
        (bw, true)
    }

    /// Mark a client disconnected; tracked non-priority clients are
    /// dropped.
    pub fn disconnect(&self, id: &I) {
        let mut st = self.state.lock();
        let Some(entry) = st.clients.get_mut(id) else {
            return;
        };
        if !entry.connected {
            return;
        }
        entry.connected = false;
        entry.update_bw = None;
        let bw = entry.bw;
        if bw == 0 {
            st.clients.remove(id);
        }
        st.total_connected_bw -= bw;
        (st.conn_limit)(st.vip_count, st.total_connected_bw);
    }

    #[cfg(test)]
    fn assigned_sum(&self) -> u64 {
        let st = self.state.lock();
        let sum: u64 = st.clients.values().map(|c| c.bw).sum();
        assert_eq!(sum, st.total_vip_bw);
        sum
    }

    #[cfg(test)]
    fn vip_count(&self) -> usize {
        let st = self.state.lock();
        let count = st.clients.values().filter(|c| c.bw > 0).count();
        assert_eq!(count, st.vip_count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    };

    fn pool() -> VipPool<u64> {
        VipPool::new(100, 10, Box::new(|_, _| {}))
    }

    #[test]
    fn test_over_commit_rejected() {
        let pool = pool();

        assert_eq!(pool.set_client_bandwidth(1, 60), Ok(()));
        assert_eq!(
            pool.set_client_bandwidth(2, 50),
            Err(Error::TotalBandwidthExceeded)
        );
        assert_eq!(pool.set_client_bandwidth(2, 40), Ok(()));
        assert_eq!(
            pool.set_client_bandwidth(1, 70),
            Err(Error::TotalBandwidthExceeded)
        );
        assert_eq!(pool.set_client_bandwidth(1, 50), Ok(()));

        assert_eq!(pool.client_bandwidth(&1), 50);
        assert_eq!(pool.client_bandwidth(&2), 40);
        assert!(pool.assigned_sum() <= pool.total_bandwidth());
        assert_eq!(pool.vip_count(), 2);
    }

    #[test]
    fn test_minimum_bandwidth() {
        let pool = pool();
        assert_eq!(pool.set_client_bandwidth(1, 9), Err(Error::BandwidthTooSmall));
        // Zero is always allowed: it revokes priority
        assert_eq!(pool.set_client_bandwidth(1, 0), Ok(()));
        assert_eq!(pool.client_bandwidth(&1), 0);
    }

    #[test]
    fn test_failed_assignment_changes_nothing() {
        let pool = pool();
        pool.set_client_bandwidth(1, 80).unwrap();
        let before = pool.assigned_sum();
        assert!(pool.set_client_bandwidth(2, 30).is_err());
        assert_eq!(pool.assigned_sum(), before);
        assert_eq!(pool.client_bandwidth(&2), 0);
        assert_eq!(pool.vip_count(), 1);
    }

    #[test]
    fn test_duplicate_connect_refused() {
        let pool = pool();
        pool.set_client_bandwidth(1, 30).unwrap();

        let (bw, ok) = pool.connect(1, Box::new(|_| {}));
        assert_eq!((bw, ok), (30, true));
        let (bw, ok) = pool.connect(1, Box::new(|_| {}));
        assert_eq!((bw, ok), (0, false));
    }

    #[test]
    fn test_update_propagates_to_connected_client() {
        let pool = pool();
        pool.set_client_bandwidth(1, 30).unwrap();

        let seen = Arc::new(AtomicU64::new(0));
        let hook = seen.clone();
        pool.connect(
            1,
            Box::new(move |bw| hook.store(bw, Ordering::Relaxed)),
        );

        pool.set_client_bandwidth(1, 50).unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 50);

        // After disconnect the hook is dropped
        pool.disconnect(&1);
        pool.set_client_bandwidth(1, 20).unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn test_conn_limit_signal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let connected_bw = Arc::new(AtomicU64::new(0));
        let (calls2, connected_bw2) = (calls.clone(), connected_bw.clone());
        let pool: VipPool<u64> = VipPool::new(
            100,
            10,
            Box::new(move |_vips, bw| {
                calls2.fetch_add(1, Ordering::Relaxed);
                connected_bw2.store(bw, Ordering::Relaxed);
            }),
        );

        pool.set_client_bandwidth(1, 40).unwrap();
        // Disconnected assignment does not touch the peer set
        assert_eq!(calls.load(Ordering::Relaxed), 0);

        pool.connect(1, Box::new(|_| {}));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(connected_bw.load(Ordering::Relaxed), 40);

        pool.set_client_bandwidth(1, 60).unwrap();
        assert_eq!(connected_bw.load(Ordering::Relaxed), 60);

        pool.disconnect(&1);
        assert_eq!(connected_bw.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_non_vip_dropped_on_disconnect() {
        let pool = pool();
        pool.connect(7, Box::new(|_| {}));
        pool.disconnect(&7);
        assert_eq!(pool.state.lock().clients.len(), 0);

        // A VIP entry survives disconnection
        pool.set_client_bandwidth(8, 20).unwrap();
        pool.connect(8, Box::new(|_| {}));
        pool.disconnect(&8);
        assert_eq!(pool.client_bandwidth(&8), 20);
        assert_eq!(pool.vip_count(), 1);
    }
}
