//! The endpoint: owns every core resource and drives its lifecycle.
//!
//! `send.rs` and `recv.rs` add the data-path methods onto [`Endpoint`] as
//! separate `impl` blocks, the way the reference codebase splits a single
//! concrete type's behavior across `protocol/<name>/{client,replica}.rs`
//! rather than nesting everything in one file.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::buffer::{Buf, Pool};
use crate::common::{CompFlags, ConnId, Flags, MsgId, Tag};
use crate::entry::{KeyIndex, Table};
use crate::error::{Error, Result};
use crate::packet::{translate_flags, CtrlHeader, Op, OpHeader, OpType, PacketHeader, PKT_HDR_LEN};
use crate::recv_queue::{Match, PostedRecvQueue, UnexpMsg, UnexpQueue};
use crate::transport::{ConnectionMap, MrAccess, Transport};

/// Open-time configuration, mirroring the knobs named in the design's §6.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub tx_pool_size: usize,
    pub rx_pool_size: usize,
    pub tx_entries: usize,
    pub buf_size: usize,
    /// `rxm_inject_size`: the eager/rendezvous crossover. Payloads at or
    /// below this go eager (buffered or inline-inject); above it, rendezvous.
    pub inline_size: usize,
    /// Upper bound on iov count a single send/recv call may carry. Retained
    /// from the design's open-time knobs for a caller-side size check ahead
    /// of a future scatter-gather entry point; `send`/`recv` currently only
    /// expose the single-contiguous-buffer surface, so nothing enforces it
    /// yet.
    pub iov_limit: usize,
    /// How many transport completions one `progress` call drains at most.
    /// Clamped to half of `min(tx_pool_size, rx_pool_size)`, mirroring the
    /// clamp the reference provider applies to `comp_per_progress`.
    pub comp_per_progress: usize,
    pub directed_recv: bool,
    /// Whether the caller registers send/recv buffers itself rather than the
    /// core registering pool chunks on its behalf.
    pub mr_local: bool,
}

impl EndpointConfig {
    pub fn clamp(mut self) -> Self {
        let half_queue = self.tx_pool_size.min(self.rx_pool_size) / 2;
        if self.comp_per_progress > half_queue {
            self.comp_per_progress = half_queue.max(1);
        }
        self
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            tx_pool_size: 64,
            rx_pool_size: 64,
            tx_entries: 64,
            buf_size: 16 * 1024,
            inline_size: 4096,
            iov_limit: 4,
            comp_per_progress: 16,
            directed_recv: false,
            mr_local: false,
        }
        .clamp()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxState {
    Tx,
    LmtTx,
}

pub(crate) struct TxEntry<T: Transport> {
    pub state: TxState,
    pub tx_buf: Option<Buf<T>>,
    pub context: u64,
    pub flags: Flags,
    pub comp_flags: CompFlags,
    pub size: usize,
    pub tag: Tag,
    /// Memory regions registered for the source iov of a rendezvous send,
    /// closed once the peer's RMA reads complete (acked). Empty for eager
    /// sends and for rendezvous sends using caller-provided descriptors.
    pub local_mrs: Vec<T::MemoryRegion>,
}

/// One entry read off the endpoint's completion queue.
#[derive(Debug)]
pub struct Completion<E> {
    pub context: u64,
    pub flags: CompFlags,
    pub len: usize,
    pub tag: Tag,
    pub data: u64,
    pub error: Option<Error<E>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndpointState {
    Init,
    Bound,
    Enabled,
    Closed,
}

/// Everything the endpoint needs to recognize a packet it reposted a buffer
/// for. Indexed by the rx pool slot index handed to `post_recv`.
pub(crate) struct RxSlot<T: Transport> {
    pub buf: Buf<T>,
}

/// State held between issuing an RMA read for a rendezvous receive and that
/// read's completion, when the ack back to the sender and the user
/// completion both fire.
pub(crate) struct PendingRendezvous<T: Transport> {
    pub peer: T::Address,
    pub msg_id: MsgId,
    pub conn_id: ConnId,
    pub context: u64,
    pub tag: Tag,
    pub len: usize,
    pub rx_buf: Buf<T>,
    pub tagged: bool,
}

/// The RXM endpoint core. Generic over the transport it rides on and the
/// connection map used to resolve destinations.
pub struct Endpoint<T: Transport, M: ConnectionMap<T>> {
    pub(crate) transport: T,
    pub(crate) cmap: M,
    pub(crate) config: EndpointConfig,
    pub(crate) state: Mutex<EndpointState>,

    pub(crate) tx_pool: Pool<T>,
    pub(crate) rx_pool: Pool<T>,
    pub(crate) tx_table: Table<TxEntry<T>>,

    pub(crate) recv_msg: PostedRecvQueue<T>,
    pub(crate) recv_tagged: PostedRecvQueue<T>,
    pub(crate) unexp_msg: UnexpQueue<T>,
    pub(crate) unexp_tagged: UnexpQueue<T>,

    pub(crate) rx_slots: Mutex<Vec<Option<RxSlot<T>>>>,
    /// Claim-token -> stashed unexpected message, the safer alternative to
    /// smuggling a raw pointer through the user context slot.
    pub(crate) claims: Mutex<HashMap<u64, (UnexpMsg<T>, bool)>>,
    pub(crate) completions: Mutex<Vec<Completion<T::Error>>>,
    pub(crate) pending_rendezvous: Mutex<HashMap<u64, PendingRendezvous<T>>>,

    pub(crate) next_op_id: Mutex<u64>,
    pub(crate) next_claim_token: Mutex<u64>,
}

impl<T: Transport, M: ConnectionMap<T>> Endpoint<T, M> {
    /// `open`: allocates pools, tables, and queues. No transport resources
    /// are touched yet; that happens in [`Endpoint::enable`].
    pub fn open(transport: T, cmap: M, config: EndpointConfig) -> Result<Self, T::Error> {
        let config = config.clamp();
        let access = config.mr_local.then_some(MrAccess::SEND_RECV);
        let tx_pool = Pool::new(&transport, config.tx_pool_size, config.buf_size, access)
            .map_err(Error::Transport)?;
        let rx_pool = Pool::new(&transport, config.rx_pool_size, config.buf_size, access)
            .map_err(Error::Transport)?;
        let rx_pool_size = config.rx_pool_size;
        Ok(Self {
            transport,
            cmap,
            tx_table: Table::new(config.tx_entries),
            config,
            state: Mutex::new(EndpointState::Init),
            tx_pool,
            rx_pool,
            recv_msg: PostedRecvQueue::new(),
            recv_tagged: PostedRecvQueue::new(),
            unexp_msg: UnexpQueue::new(),
            unexp_tagged: UnexpQueue::new(),
            rx_slots: Mutex::new((0..rx_pool_size).map(|_| None).collect()),
            claims: Mutex::new(HashMap::new()),
            completions: Mutex::new(Vec::new()),
            pending_rendezvous: Mutex::new(HashMap::new()),
            next_op_id: Mutex::new(1),
            next_claim_token: Mutex::new(1),
        })
    }

    /// `bind`: attaches the completion queue. There is no separate address
    /// vector object in this design; destination resolution goes through
    /// `cmap` directly, so binding only needs to record that a CQ exists.
    pub fn bind_cq(&self) -> Result<(), T::Error> {
        let mut state = self.state.lock().unwrap();
        if *state != EndpointState::Init {
            return Err(Error::BadState);
        }
        *state = EndpointState::Bound;
        Ok(())
    }

    /// `enable`: requires a bound CQ, preposts the whole RX pool to the
    /// transport.
    pub fn enable(&self) -> Result<(), T::Error> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != EndpointState::Bound {
                return Err(if *state == EndpointState::Init {
                    Error::NoCq
                } else {
                    Error::BadState
                });
            }
            *state = EndpointState::Enabled;
        }
        while let Some(buf) = self.rx_pool.acquire() {
            self.prepost(buf)?;
        }
        Ok(())
    }

    pub(crate) fn prepost(&self, mut buf: Buf<T>) -> Result<(), T::Error> {
        let index = buf.index;
        let len = buf.len();
        let desc = buf.mr().cloned();
        let ptr = buf.as_mut_ptr();
        unsafe {
            self.transport
                .post_recv(ptr, len, index, desc.as_ref())
                .map_err(Error::Transport)?;
        }
        self.rx_slots.lock().unwrap()[index as usize] = Some(RxSlot { buf });
        Ok(())
    }

    /// `close`: drains outstanding resources. Errors from individual steps
    /// are accumulated; the last non-`Ok` result wins, matching the
    /// reference provider's close-path policy, but every step still runs.
    pub fn close(&self) -> Result<(), T::Error> {
        let mut state = self.state.lock().unwrap();
        if *state == EndpointState::Closed {
            return Err(Error::BadState);
        }
        *state = EndpointState::Closed;
        drop(state);

        let mut last_err = None;
        for slot in self.rx_slots.lock().unwrap().iter_mut() {
            *slot = None;
        }
        if let Err(e) = self.tx_pool.close(&self.transport) {
            last_err = Some(e);
        }
        if let Err(e) = self.rx_pool.close(&self.transport) {
            last_err = Some(e);
        }
        match last_err {
            Some(e) => Err(Error::Transport(e)),
            None => Ok(()),
        }
    }

    pub(crate) fn require_enabled(&self) -> Result<(), T::Error> {
        if *self.state.lock().unwrap() != EndpointState::Enabled {
            return Err(Error::BadState);
        }
        Ok(())
    }

    pub(crate) fn next_op_id(&self) -> u64 {
        let mut id = self.next_op_id.lock().unwrap();
        let v = *id;
        *id = id.wrapping_add(1);
        v
    }

    pub(crate) fn queues(&self, tagged: bool) -> (&PostedRecvQueue<T>, &UnexpQueue<T>) {
        if tagged {
            (&self.recv_tagged, &self.unexp_tagged)
        } else {
            (&self.recv_msg, &self.unexp_msg)
        }
    }

    pub(crate) fn push_completion(&self, c: Completion<T::Error>) {
        self.completions.lock().unwrap().push(c);
    }

    /// Reads up to `max` ready completions without driving the transport.
    pub fn read_completions(&self, max: usize) -> Vec<Completion<T::Error>> {
        let mut list = self.completions.lock().unwrap();
        let n = list.len().min(max);
        list.drain(..n).collect()
    }

    /// `cancel`: removes a posted receive by context from both queues.
    pub fn cancel(&self, context: u64) -> Result<(), T::Error> {
        for tagged in [false, true] {
            let (queue, _) = self.queues(tagged);
            if let Some(entry) = queue.cancel(context) {
                self.push_completion(Completion {
                    context: entry.context,
                    flags: entry.comp_flags,
                    len: 0,
                    tag: match entry.match_info {
                        Match::Tagged { tag, .. } => tag,
                        Match::Untagged => 0,
                    },
                    data: 0,
                    error: Some(Error::Canceled),
                });
                return Ok(());
            }
        }
        Ok(())
    }

    /// `progress`: drains up to `comp_per_progress` transport completions
    /// and dispatches each. Never blocks.
    pub fn progress(&self) -> Result<(), T::Error> {
        self.progress_multi(self.config.comp_per_progress)
    }

    /// Drives at most `max` completions through regardless of the
    /// configured default, for callers that want finer control.
    pub fn progress_multi(&self, max: usize) -> Result<(), T::Error> {
        let drained = self.transport.poll_completions(max);
        for completion in drained {
            self.handle_transport_completion(completion)?;
        }
        Ok(())
    }

    pub(crate) fn resolve(&self, addr: &T::Address) -> Result<ConnId, T::Error> {
        match self.cmap.get(addr) {
            Ok(handle) => Ok(handle.remote_key),
            Err(crate::transport::CmapStatus::InProgress) => Err(Error::Again),
            Err(crate::transport::CmapStatus::Fatal(e)) => Err(Error::Transport(e)),
        }
    }

    pub(crate) fn connection(&self, addr: &T::Address) -> Result<T::Connection, T::Error> {
        match self.cmap.get(addr) {
            Ok(handle) => Ok(handle.connection),
            Err(crate::transport::CmapStatus::InProgress) => Err(Error::Again),
            Err(crate::transport::CmapStatus::Fatal(e)) => Err(Error::Transport(e)),
        }
    }
}

pub(crate) fn comp_flags_for(op: Op, cq_data: bool) -> CompFlags {
    let mut f = match op {
        Op::Msg => CompFlags::MSG,
        Op::Tagged => CompFlags::TAGGED,
    };
    if cq_data {
        f |= CompFlags::REMOTE_CQ_DATA;
    }
    f
}

pub(crate) fn header_for(
    op_type: OpType,
    op: Op,
    conn_id: ConnId,
    msg_id: MsgId,
    size: u64,
    tag: Tag,
    data: u64,
    flags: Flags,
) -> PacketHeader {
    PacketHeader {
        ctrl: CtrlHeader {
            version: crate::packet::CTRL_VERSION,
            op_type,
            conn_id,
            msg_id,
        },
        op: OpHeader {
            version: crate::packet::OP_VERSION,
            op,
            flags: translate_flags(flags),
            size,
            tag,
            data,
        },
    }
}

pub(crate) fn mint_msg_id<T: Transport>(table: &Table<TxEntry<T>>, index: u32) -> MsgId {
    KeyIndex::mint(table, index)
}

pub(crate) const HEADER_LEN: usize = PKT_HDR_LEN;

/// Marks an `op_id` handed to [`crate::transport::Transport::send`] as one
/// the tx-table dispatch in `send.rs::complete_send` must ignore: rendezvous
/// acks are submitted via the same `send` call as user sends but never
/// occupy a `tx_table` slot, so their completions can't be routed through
/// `complete_send`'s op_id-as-slot-index scheme without risking a collision
/// with a live tx_table index.
pub(crate) const UNTRACKED_SEND: u64 = 1 << 63;

impl<T: Transport, M: ConnectionMap<T>> Endpoint<T, M> {
    pub(crate) fn log_exhaustion(&self, what: &str) {
        debug!(what, "resource exhausted, reporting EAGAIN");
    }

    pub(crate) fn log_protocol_error(&self, err: impl std::fmt::Display) {
        warn!(%err, "dropping packet: protocol error");
    }
}
