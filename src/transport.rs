//! External collaborators.
//!
//! Everything in this module is a *contract*, not an implementation: the
//! transport's send/recv/RMA/memory-registration primitives, its completion
//! queue, and the per-destination connection map are all out of scope for
//! the endpoint core (see the design's §1 scope). A concrete binding (DPDK,
//! a kernel socket, an in-process simulation for tests) implements
//! [`Transport`] and [`ConnectionMap`]; [`crate::endpoint::Endpoint`] is
//! generic over both.
//!
//! The shapes below mirror the reference C provider closely: registration
//! and RMA calls take raw pointers into core-owned slab memory, because that
//! memory's address is stable for the lifetime of the registration (the
//! buffer pool never moves or frees a chunk while a registration against it
//! is open). This is the same contract real RDMA/DPDK bindings in the
//! ecosystem expose.

use std::fmt::Debug;
use std::hash::Hash;

use crate::common::ConnId;
use crate::packet::RmaIovEntry;

/// A transport-reported error. Transports distinguish "try again" (backpressure,
/// no state changed) from every other failure so the core can apply the
/// design's `EAGAIN` retry policy without downcasting.
pub trait TransportError: std::error::Error + Send + Sync + 'static {
    fn is_again(&self) -> bool;
}

/// Access flags passed to [`Transport::mr_reg`], mirroring `FI_SEND | FI_RECV
/// | FI_READ | FI_WRITE` from the reference provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrAccess {
    pub send: bool,
    pub recv: bool,
    pub read: bool,
    pub write: bool,
}

impl MrAccess {
    pub const SEND_RECV: Self = MrAccess {
        send: true,
        recv: true,
        read: true,
        write: true,
    };
    pub const REMOTE_READ: Self = MrAccess {
        send: false,
        recv: false,
        read: true,
        write: false,
    };
}

/// What a drained completion refers to.
#[derive(Debug)]
pub enum CompletionKind<A> {
    /// A `send` submitted with the given `op_id` left the wire (or failed).
    Send,
    /// An `rma_read` submitted with the given `op_id` finished.
    RmaRead,
    /// A packet arrived into the preposted buffer identified by `rx_index`
    /// (the index the core passed to [`Transport::post_recv`]), from `src`.
    /// Mirrors `fi_cq_readfrom` reporting the peer address alongside a
    /// receive completion.
    Recv { rx_index: u32, len: usize, src: A },
}

/// One entry drained from [`Transport::poll_completions`].
#[derive(Debug)]
pub struct TransportCompletion<A, E> {
    pub op_id: u64,
    pub kind: CompletionKind<A>,
    pub result: Result<(), E>,
}

/// The transport API the endpoint core requires. Out of scope to implement
/// here; see module docs.
pub trait Transport: 'static {
    type Address: Clone + Eq + Hash + Debug + Send + Sync;
    /// Opaque per-destination handle carrying whatever the transport needs
    /// to submit to that peer (e.g. a connected socket or queue pair).
    type Connection: Clone + Send + Sync;
    type MemoryRegion: Clone + Send + Sync;
    type Error: TransportError;

    /// Largest packet this transport can send via [`Transport::inject`]
    /// (header + payload).
    fn inject_size(&self) -> usize;
    /// Whether the transport requires the caller to register local send/recv
    /// buffers itself (`msg_mr_local`), as opposed to registering internally.
    fn requires_local_mr(&self) -> bool;
    /// Whether RMA addressing is by virtual address (`true`) or by offset
    /// into the registered region (`false`).
    fn uses_virtual_addressing(&self) -> bool;

    /// # Safety
    /// `addr` must be valid for `len` bytes for as long as the returned
    /// registration is open.
    unsafe fn mr_reg(
        &self,
        addr: *mut u8,
        len: usize,
        access: MrAccess,
    ) -> Result<Self::MemoryRegion, Self::Error>;
    fn mr_key(&self, mr: &Self::MemoryRegion) -> u64;
    fn mr_close(&self, mr: Self::MemoryRegion) -> Result<(), Self::Error>;

    /// Submit a send expecting a completion keyed by `op_id`.
    fn send(
        &self,
        conn: &Self::Connection,
        op_id: u64,
        packet: &[u8],
        desc: Option<&Self::MemoryRegion>,
    ) -> Result<(), Self::Error>;

    /// Submit a fire-and-forget send; never completes.
    fn inject(&self, conn: &Self::Connection, packet: &[u8]) -> Result<(), Self::Error>;

    /// Pull `remote`'s memory into `local`, completing with `op_id`.
    ///
    /// # Safety
    /// `local` must be valid for `len` bytes until the completion for
    /// `op_id` is drained.
    unsafe fn rma_read(
        &self,
        conn: &Self::Connection,
        op_id: u64,
        local: *mut u8,
        len: usize,
        remote: RmaIovEntry,
    ) -> Result<(), Self::Error>;

    /// Hand a receive buffer to the transport. `rx_index` is echoed back in
    /// [`CompletionKind::Recv`] when a packet lands in it.
    ///
    /// # Safety
    /// `addr` must be valid for `len` bytes until the matching completion is
    /// drained.
    unsafe fn post_recv(
        &self,
        addr: *mut u8,
        len: usize,
        rx_index: u32,
        desc: Option<&Self::MemoryRegion>,
    ) -> Result<(), Self::Error>;

    /// Drain up to `max` ready completions. Never blocks; an empty transport
    /// CQ returns an empty `Vec` immediately.
    fn poll_completions(&self, max: usize) -> Vec<TransportCompletion<Self::Address, Self::Error>>;
}

/// Non-fatal connection-establishment status the core surfaces to the
/// caller unchanged, per the design's §4.7.
#[derive(Debug)]
pub enum CmapStatus<E> {
    /// A connection attempt is underway; the map owns any queuing. The core
    /// reports this to the caller as [`crate::Error::Again`].
    InProgress,
    /// Connection establishment failed permanently.
    Fatal(E),
}

/// A resolved destination: the transport handle to submit on, plus the
/// remote key to stamp into `ctrl_hdr.conn_id`.
#[derive(Debug, Clone)]
pub struct ConnHandle<T: Transport> {
    pub connection: T::Connection,
    pub remote_key: ConnId,
}

/// Per-destination connection lookup. Shared between the data path and
/// whatever drives connection establishment; its internal locking is its own
/// concern (see the design's §5 shared-resource policy).
pub trait ConnectionMap<T: Transport>: Send + Sync {
    fn get(&self, addr: &T::Address) -> Result<ConnHandle<T>, CmapStatus<T::Error>>;
}
