//! Receive-side reliability core for a connectionless RPC protocol: per-call fragment
//!  reassembly over an unordered datagram transport, plus the server-side table that binds a
//!  client's activity to persistent sequence/validation state across calls.
//!
//! ## Design goals
//!
//! * The transport is plain datagrams (UDP-style) - nothing is assumed about ordering,
//!   duplication or delivery. All reliability the call layer sees is built here.
//! * The abstraction is *calls*: a call's body arrives as numbered fragments, and the
//!   receive queue hands the consumer a gap-free in-order byte prefix regardless of
//!   arrival order.
//!   * duplicates (same fragment and serial number) are idempotent; a retransmission is
//!     indistinguishable from its original to the consumer
//! * Memory per call is bounded: the queue admits up to a configured number of fragments
//!   and reports 'queue full' beyond that instead of silently discarding in-order data -
//!   whether to apply backpressure or abort the call is the call layer's decision.
//! * Consumers are woken when there is *enough* data (a configurable threshold), not on
//!   every datagram - amortizing wake/schedule cost against the arrival rate. Completion
//!   of a call body always wakes.
//! * There is no connection handshake. The first packet of an unknown activity creates
//!   table state on the fly; trust in a client's claimed sequence numbers is established
//!   lazily by a WAY ("who are you") challenge/response exchange.
//!   * The server's boot epoch is part of the exchange, so sequence numbers replayed
//!     across a server restart are detected rather than honored.
//! * Per-activity state is shared, reference-counted and reclaimed by an aging sweep once
//!   no call uses it - an activity that goes quiet costs nothing forever.
//! * Cleanup is cancellation-safe: aborting a call wakes and cancels any blocked consumer
//!   before its queue is drained and its table reference released, so nothing hangs and
//!   nothing is reclaimed while still referenced.
//!
//! ## Header
//!
//! Packet header (inside a datagram) - all numbers in network byte order (BE):
//! ```ascii
//!  0: protocol version (u8)
//!  1: packet type (u8):
//!     * 0 REQUEST - carries a call body fragment
//!     * 1 PING    - client probes the state of a call
//!     * 2 RESPONSE, 3 FAULT - server results
//!     * 4 WORKING, 5 NOCALL - server answers to PING
//!     * 6 REJECT  - call refused, status code in the body
//!     * 7 ACK, 8 QUIT, 9 FACK, 10 QUACK - acknowledgement / cancel handshakes
//!  2: flags (u8):
//!     * bit 0: LAST_FRAG - this fragment completes the call body
//!     * bit 1: FRAG - the call body spans multiple fragments
//!     * bit 2: NO_REPLY - 'maybe' semantics, no response expected
//!     * bit 3: IDEMPOTENT - the call may be re-executed on retransmission
//!     * bits 4-7: unused, must be 0
//!  3: reserved (u8), must be 0
//!  4: activity id (16 bytes) - the client-chosen identifier of the logical activity
//! 20: server boot epoch (u64) - millis since epoch at the start of the server process,
//!      or 0 if the sender does not know the server instance yet. After a restart this
//!      value changes, which is what anchors replay detection across restarts.
//! 28: sequence number (u64) - per-activity call sequence
//! 36: fragment number (u32) - position of this fragment in the call body
//! 40: serial number (u32) - distinguishes retransmissions of the same fragment
//! 44: body - fragment payload, delimited by the datagram length
//! ```
//!
//! Header-only control PDUs carry no body; REJECT and FAULT carry a single u32 status code.
//!
//! ## Components
//!
//! * [receive_queue::ReceiveQueue] - owns the fragments of one in-flight call and exposes
//!   admission, the in-order prefix, and a cancellable consumer wait.
//! * [conn_table::ConnectionTable] - maps activity ids to [conn_table::TableEntry] state,
//!   sharded by an id hash; hands out scoped [conn_table::EntryRef] checkouts and runs the
//!   reclamation sweep. Drives call creation ([conn_table::ServerCall]) and WAY validation.
//! * [send_pipeline::SendPipeline] - assembles and transmits outgoing PDUs (segment lists,
//!   header-only controls, error bodies) over a mockable socket abstraction.
//!
//! This crate is a library consumed by a call-dispatch layer; it has no entry point of its
//!  own. The dispatch layer owns the sockets, parses inbound headers
//!  ([packet_header::PacketHeader::deser]), identifies or creates the activity's entry,
//!  routes the fragment into the right call's queue, and decides retry/backpressure policy
//!  from the explicit outcomes these components return.
//!
//! ## Related:
//! * TCP-based RPC runtimes
//!   * connection setup does the identity work once per connection, not per activity
//!   * kernel handles reordering and flow control - at the price of head-of-line blocking
//!     across unrelated calls
//! * QUIC
//!   * connection based - initial handshake, enforced encryption (TLS 1.3)
//!   * per-stream ordering without cross-stream head-of-line blocking - similar motivation,
//!     much larger scope
//! * Classic connectionless RPC runtimes (ONC, DCE)
//!   * this crate models the same receive-side machinery: fragment windows, activity
//!     tables, and who-are-you callbacks against sequence replay

pub mod buffer_pool;
pub mod config;
pub mod conn_table;
pub mod fragment;
pub mod ids;
pub mod packet_header;
pub mod packet_log;
pub mod receive_queue;
pub mod send_pipeline;
pub mod way;

pub use config::RpcConfig;
pub use conn_table::{CallDecision, ConnectionTable, EntryRef, ServerCall};
pub use fragment::Fragment;
pub use ids::{ActivityId, FragmentNumber, SequenceNumber, SerialNumber};
pub use packet_header::{packet_type_name, PacketFlags, PacketHeader, PacketType, StatusCode};
pub use receive_queue::{AdmitOutcome, ReceiveQueue, WaitOutcome};
pub use way::{validation_status, ValidationStatus, WayBinding, WayError, WayHandshake};

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
