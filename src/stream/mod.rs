//! Event stream modules.
//!
//! - `client`: public engine handle, request path, and error type.
//! - `proto`: request/response envelopes and pushed event batches.
//! - `transport`: one websocket session with deadlines and keepalive.
//! - `pumps`: per-connection read and write workers.
//! - `correlator`: in-flight request table matching replies by id.
//! - `ledger`: subscribed topics and their resume offsets.
//! - `supervisor`: connect/retry loop and ledger replay.

/// Engine handle and request path.
pub mod client;
pub(crate) mod correlator;
/// Subscription ledger.
pub mod ledger;
/// Wire protocol messages.
pub mod proto;
pub(crate) mod pumps;
/// Reconnection supervisor and connection state.
pub mod supervisor;
pub(crate) mod transport;
