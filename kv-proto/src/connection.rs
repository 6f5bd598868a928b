//! The interface the engine needs from a client connection, independent
//! of whatever network transport backs it.
//!
//! SPEC_FULL.md keeps the `Connection Layer` itself out of scope; what
//! remains in scope is the *shape* of the collaborator the engine talks
//! to — in particular, the pub/sub hub (§4.7) and the transaction
//! controller (§4.6) need to push a reply to a connection that isn't
//! necessarily the one currently making a request (a publish fans out to
//! every subscriber's socket). [`ConnectionSink`] is that narrow
//! interface; the real per-client state (§4.13 / C13) is a concrete type
//! in `kv-engine` that implements it.

use crate::reply::Reply;

/// Something a reply can be written to, identified stably across the
/// lifetime of one client connection.
pub trait ConnectionSink: Send + Sync {
    /// A process-unique identifier for this connection, stable for its
    /// lifetime. Used by the pub/sub hub to deduplicate subscriptions.
    fn conn_id(&self) -> u64;

    /// Push a reply to the client out-of-band (i.e. not in response to
    /// the command it is currently dispatching — a pub/sub message or a
    /// replication ACK prompt).
    fn push(&self, reply: &Reply);
}
