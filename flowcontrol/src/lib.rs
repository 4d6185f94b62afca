//! Token-bucket flow control and request admission for a light-client
//! protocol server.
//!
//! Every connected client holds a fixed-point credit buffer with the
//! server. Admitting a request deducts its declared maximum cost from the
//! buffer; the buffer recharges linearly over time at a per-client
//! guaranteed rate. The server side tracks each client's buffer
//! authoritatively ([`server::ClientNode`]) while a process-wide
//! coordinator ([`manager::ClientManager`]) bounds serving parallelism,
//! queues deferred admissions by buffer fullness, and apportions a shared
//! recharge pool among currently draining clients. Replies carry the
//! authoritative buffer value back to the client, where a symmetrical
//! estimator ([`client::ServerNode`]) predicts whether the next request can
//! be sent without underrunning the server-side buffer.
//!
//! [`vip::VipPool`] assigns guaranteed bandwidth shares to named clients,
//! and [`calibrate`] derives per-message-code cost tables from a synthetic
//! benchmark so declared maximum costs are true upper bounds.
//!
//! All buffer arithmetic is integer fixed point. Time enters through the
//! [`lumen_runtime::Clock`] trait only, so tests drive the whole system on
//! a virtual clock.

pub mod calibrate;
pub mod client;
pub mod costs;
pub mod curve;
mod logger;
pub mod manager;
pub mod metrics;
mod prque;
pub mod server;
pub mod vip;

use std::time::Duration;

/// Time constant of linear buffer recharge: a client with recharge rate
/// `min_recharge` regains that many buffer units per `FC_TIME_CONST`.
pub const FC_TIME_CONST: Duration = Duration::from_millis(1);

/// Delay before a recharge-rate decrease takes effect on the server side,
/// covering requests the client sent before seeing the parameter update.
pub const DEC_PARAM_DELAY: Duration = Duration::from_secs(2);

/// Normalization constant of the manager's shared recharge integrator.
pub const FIXED_POINT_MULTIPLIER: u64 = 1_000_000;

/// Default buffer capacity assigned to a client.
pub const DEFAULT_BUF_LIMIT: u64 = 300_000_000;

/// Default guaranteed recharge rate assigned to a client.
pub const DEFAULT_MIN_RECHARGE: u64 = 50_000;

pub use client::ServerNode;
pub use curve::PieceWiseLinear;
pub use manager::ClientManager;
pub use server::ClientNode;
pub use vip::VipPool;

/// Flow control parameters a server assigns to one client.
///
/// Servers can hand out different parameters to different clients; both
/// values must be positive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServerParams {
    /// Maximum buffer capacity, in fixed-point units.
    pub buf_limit: u64,
    /// Guaranteed recharge rate, in buffer units per [`FC_TIME_CONST`].
    pub min_recharge: u64,
}

/// Buffer units recharged at rate `min_recharge` over `dt`.
///
/// The widened intermediate keeps multi-hour idle gaps from overflowing.
pub(crate) fn recharge_amount(min_recharge: u64, dt: Duration) -> u64 {
    let units = (min_recharge as u128) * dt.as_nanos() / FC_TIME_CONST.as_nanos();
    units.min(u64::MAX as u128) as u64
}
