//! Overlay messaging core: reliable, tagged point-to-point send/recv with
//! rendezvous RMA over a connection-oriented transport.
//!
//! This crate implements the matching and data-movement layer that sits
//! above a lower-level reliable-connection transport, in the spirit of
//! libfabric's `rxm` provider: small messages travel inline or in a single
//! eager-buffered hop, large messages are announced and then pulled by the
//! receiver via RMA, and posted receives are matched against arriving
//! traffic (or queued as unexpected when nothing is posted yet), with
//! support for non-destructive peek and deferred claim.
//!
//! # Stability
//!
//! Progress is made only when a caller invokes
//! [`endpoint::Endpoint::progress`]; nothing here spawns a thread or owns an
//! event loop. This keeps the crate usable from a single-threaded busy-poll
//! driver as well as from an async task.

/// Shared types: tags, flags, completions, iovecs.
///
/// Extracted the way the reference provider keeps its scalar/flag
/// definitions in one header, so future changes to e.g. the `Tag` width
/// only need to happen once.
pub mod common;

/// The crate's `Error<T>` taxonomy, generic over the transport's own error
/// type so transport failures and protocol-level failures share one type.
pub mod error;

/// Wire header and RMA-IOV descriptor encoding.
pub mod packet;

/// The external-collaborator traits this crate is driven through:
/// [`transport::Transport`] for data movement and memory registration, and
/// [`transport::ConnectionMap`] for address-to-connection resolution.
pub mod transport;

/// Fixed-size, optionally memory-registered buffer pools backing both the
/// TX and RX sides of an endpoint.
pub mod buffer;

/// Generation-tagged slot tables, used to allocate `msg_id`s that stay
/// unique across slot reuse.
pub mod entry;

/// Posted-receive and unexpected-message queues and their matching rules.
pub mod recv_queue;

/// Endpoint lifecycle, shared state, and the progress engine that drains
/// transport completions.
pub mod endpoint;

/// The send-path state machine: inline inject, eager buffered, rendezvous.
pub mod send;

/// The receive-path matching engine and the PEEK/CLAIM/DISCARD flow.
pub mod recv;

/// Simulated transport and connection map used by every module's unit
/// tests and by the end-to-end scenarios in `scenarios.rs`.
#[cfg(any(test, doc))]
pub mod testutil;

#[cfg(test)]
pub mod tests {
    use lazy_static::lazy_static;

    lazy_static! {
        pub static ref TRACING: () = {
            tracing_subscriber::fmt::init();
        };
    }
}

/// End-to-end scenario tests driving a whole [`endpoint::Endpoint`] pair
/// over the simulated transport, one file per the reference codebase's
/// convention of a standalone `tests.rs` per protocol module.
#[cfg(test)]
mod scenarios;
