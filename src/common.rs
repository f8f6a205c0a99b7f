//! Common definitions shared by every layer of the endpoint core.
//!
//! Extracted for the same reason `oskr::common` exists: so a future rename
//! or width change only touches one place.

use bitflags::bitflags;

/// A 64-bit tag carried on tagged sends, matched against a posted receive's
/// `tag`/`ignore` pair.
pub type Tag = u64;

/// Wildcard mask applied to a posted receive's tag: `(posted ^ arrived) &
/// !ignore == 0` is a match.
pub type Ignore = u64;

/// Stable identifier for an in-flight rendezvous operation, unique across
/// concurrently in-flight sends of one endpoint. See [`crate::entry::KeyIndex`].
pub type MsgId = u64;

/// Remote session key stamped into `ctrl_hdr.conn_id`, handed back by the
/// connection map for every destination.
pub type ConnId = u32;

bitflags! {
    /// User-facing send/receive flags (a small, endpoint-core-relevant subset
    /// of the full flag space named in the design).
    pub struct Flags: u64 {
        /// Submission is "fire and forget": the source buffer is consumed
        /// before the call returns and no completion is generated. Rejected
        /// with [`crate::Error::MsgTooLarge`] for rendezvous-sized payloads.
        const INJECT            = 1 << 0;
        /// Caller wants a completion queue entry for this operation even
        /// when the endpoint's default suppresses it.
        const COMPLETION        = 1 << 1;
        /// `data` carries remote CQ data valid for the receiver to read.
        const REMOTE_CQ_DATA    = 1 << 2;
        /// Completion should not be generated until the transport confirms
        /// the send left the wire (as opposed to merely being queued).
        const TRANSMIT_COMPLETE = 1 << 3;
        /// Completion should not be generated until the remote side has
        /// placed the data into the target buffer.
        const DELIVERY_COMPLETE = 1 << 4;
        /// Non-consuming inspection of the unexpected-message list.
        const PEEK              = 1 << 5;
        /// Atomically reserve a previously peeked message for a later
        /// `CLAIM` receive.
        const CLAIM             = 1 << 6;
        /// Drop a peeked or claimed message instead of receiving it.
        const DISCARD           = 1 << 7;
    }
}

bitflags! {
    /// Flags stamped on a completion, composed from the operation's class
    /// (`MSG`/`TAGGED`) and direction (`SEND`/`RECV`) plus any
    /// transport-reported extras.
    pub struct CompFlags: u64 {
        const SEND           = 1 << 0;
        const RECV           = 1 << 1;
        const MSG            = 1 << 2;
        const TAGGED         = 1 << 3;
        const REMOTE_CQ_DATA = 1 << 4;
    }
}

