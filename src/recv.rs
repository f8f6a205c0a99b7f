//! Receive path, matching engine, and the PEEK/CLAIM/DISCARD arrival flow.
//!
//! Also owns [`Endpoint::handle_transport_completion`], the single dispatch
//! point the progress engine calls for everything the transport reports:
//! send completions (delegated to `send.rs`), inbound data/rendezvous
//! packets, rendezvous acks, and completed RMA reads.

use tracing::{debug, trace};

use crate::buffer::Buf;
use crate::common::{CompFlags, Flags, Ignore, Tag};
use crate::endpoint::{comp_flags_for, header_for, Completion, Endpoint, PendingRendezvous, RxSlot, UNTRACKED_SEND};
use crate::entry::KeyIndex;
use crate::error::{Error, Result};
use crate::packet::{Op, OpType, PacketHeader, RmaIovDescriptor, CTRL_HDR_LEN, OP_HDR_LEN, PKT_HDR_LEN};
use crate::recv_queue::{DestPtr, Match, RecvEntry, UnexpMsg};
use crate::transport::{CompletionKind, ConnectionMap, Transport, TransportCompletion};

const PAYLOAD_OFFSET: usize = CTRL_HDR_LEN + OP_HDR_LEN;

impl<T: Transport, M: ConnectionMap<T>> Endpoint<T, M> {
    pub fn recv(&self, src: Option<T::Address>, buf: &mut [u8], context: u64, flags: Flags) -> Result<(), T::Error> {
        self.recv_common(src, buf, Match::Untagged, context, flags)
    }

    pub fn trecv(
        &self,
        src: Option<T::Address>,
        buf: &mut [u8],
        tag: Tag,
        ignore: Ignore,
        context: u64,
        flags: Flags,
    ) -> Result<(), T::Error> {
        self.recv_common(src, buf, Match::Tagged { tag, ignore }, context, flags)
    }

    /// `PEEK`-only inspection: neither removes nor claims the unexpected
    /// message, just reports whether one matches.
    pub fn peek(&self, src: Option<T::Address>, tag: Tag, ignore: Ignore, context: u64) -> Result<(), T::Error> {
        self.recv_common(src, &mut [], Match::Tagged { tag, ignore }, context, Flags::PEEK)
    }

    /// Consumes the buffer reserved by a prior `PEEK|CLAIM` (identified by
    /// `claim_token`, handed back in that peek completion's `data` field)
    /// into `out`.
    pub fn claim_recv(&self, claim_token: u64, out: &mut [u8], context: u64, flags: Flags) -> Result<(), T::Error> {
        self.require_enabled()?;
        let (msg, tagged) = self
            .claims
            .lock()
            .unwrap()
            .remove(&claim_token)
            .ok_or(Error::Inval)?;
        if flags.contains(Flags::DISCARD) {
            let tag = msg.tag;
            self.repost(msg.buf)?;
            self.push_completion(Completion {
                context,
                flags: CompFlags::RECV,
                len: 0,
                tag,
                data: 0,
                error: None,
            });
            return Ok(());
        }
        self.deliver_unexpected(msg, out, context, flags, tagged)
    }

    fn recv_common(
        &self,
        src: Option<T::Address>,
        buf: &mut [u8],
        match_info: Match,
        context: u64,
        flags: Flags,
    ) -> Result<(), T::Error> {
        self.require_enabled()?;
        let src = if self.config.directed_recv { src } else { None };
        let tagged = matches!(match_info, Match::Tagged { .. });
        let (posted, unexp) = self.queues(tagged);

        if flags.contains(Flags::PEEK) {
            let _ = self.progress();
            return match unexp.peek_index(src.as_ref(), &match_info) {
                None => {
                    self.push_completion(Completion {
                        context,
                        flags: CompFlags::RECV,
                        len: 0,
                        tag: 0,
                        data: 0,
                        error: Some(Error::NoMsg),
                    });
                    Ok(())
                }
                Some(idx) => {
                    if flags.contains(Flags::DISCARD) {
                        let msg = unexp.remove_at(idx);
                        let tag = msg.tag;
                        self.repost(msg.buf)?;
                        self.push_completion(Completion {
                            context,
                            flags: CompFlags::RECV,
                            len: 0,
                            tag,
                            data: 0,
                            error: None,
                        });
                    } else if flags.contains(Flags::CLAIM) {
                        let msg = unexp.remove_at(idx);
                        let token = self.mint_claim_token();
                        let tag = msg.tag;
                        self.claims.lock().unwrap().insert(token, (msg, tagged));
                        self.push_completion(Completion {
                            context,
                            flags: CompFlags::RECV,
                            len: 0,
                            tag,
                            data: token,
                            error: None,
                        });
                    } else {
                        self.push_completion(Completion {
                            context,
                            flags: CompFlags::RECV,
                            len: 0,
                            tag: unexp.tag_at(idx),
                            data: 0,
                            error: None,
                        });
                    }
                    Ok(())
                }
            };
        }

        if flags.contains(Flags::CLAIM) {
            // CLAIM without a preceding PEEK|CLAIM round trip has no
            // stashed message to claim; per the design's resolved open
            // question this is a caller error, not a miss.
            return Err(Error::Inval);
        }

        if let Some(msg) = unexp.match_and_remove(src.as_ref(), &match_info) {
            return self.deliver_unexpected(msg, buf, context, flags, tagged);
        }

        posted.post(RecvEntry {
            addr: src,
            match_info,
            dest_ptr: DestPtr(buf.as_mut_ptr()),
            iov_total_len: buf.len(),
            context,
            flags,
            comp_flags: comp_flags_for(if tagged { Op::Tagged } else { Op::Msg }, false) | CompFlags::RECV,
        });
        Ok(())
    }

    fn deliver_unexpected(
        &self,
        msg: UnexpMsg<T>,
        out: &mut [u8],
        context: u64,
        flags: Flags,
        tagged: bool,
    ) -> Result<(), T::Error> {
        let tag = msg.tag;
        if msg.is_rendezvous {
            self.initiate_rendezvous_read(msg, out, context, tagged, tag)
        } else {
            let n = msg.size.min(out.len());
            out[..n].copy_from_slice(&msg.buf.as_slice()[PAYLOAD_OFFSET..PAYLOAD_OFFSET + n]);
            self.repost(msg.buf)?;
            let _ = flags;
            self.push_completion(Completion {
                context,
                flags: comp_flags_for(if tagged { Op::Tagged } else { Op::Msg }, false) | CompFlags::RECV,
                len: n,
                tag,
                data: 0,
                error: None,
            });
            Ok(())
        }
    }

    fn mint_claim_token(&self) -> u64 {
        let mut t = self.next_claim_token.lock().unwrap();
        let v = *t;
        *t = t.wrapping_add(1);
        v
    }

    pub(crate) fn repost(&self, buf: Buf<T>) -> Result<(), T::Error> {
        self.prepost(buf)
    }

    /// Starts pulling a rendezvous payload: parses the RMA-IOV descriptor
    /// carried in `msg`'s buffer and issues an `rma_read` into `out`. This
    /// simplified form assumes a single RMA-IOV entry (one contiguous source
    /// region), which is all [`crate::send`]'s send path ever produces.
    fn initiate_rendezvous_read(
        &self,
        msg: UnexpMsg<T>,
        out: &mut [u8],
        context: u64,
        tagged: bool,
        tag: Tag,
    ) -> Result<(), T::Error> {
        let header = PacketHeader::decode(msg.buf.as_slice()).map_err(|e| {
            self.log_protocol_error(e);
            Error::Inval
        })?;
        let descriptor = RmaIovDescriptor::decode(&msg.buf.as_slice()[PAYLOAD_OFFSET..])
            .map_err(|e| {
                self.log_protocol_error(e);
                Error::Inval
            })?;
        let entry = descriptor.entries.first().copied().ok_or(Error::Inval)?;
        let n = (entry.len as usize).min(out.len());
        let conn = self.connection(&msg.addr)?;
        let op_id = self.next_op_id();
        unsafe {
            self.transport
                .rma_read(&conn, op_id, out.as_mut_ptr(), n, entry)
                .map_err(Error::Transport)?;
        }
        // A real transport completes this asynchronously; the ack and user
        // completion only fire once `poll_completions` reports the read
        // done (`finish_rendezvous_read`), so stash what's needed for then.
        self.pending_rendezvous.lock().unwrap().insert(
            op_id,
            PendingRendezvous {
                peer: msg.addr,
                msg_id: header.ctrl.msg_id,
                conn_id: header.ctrl.conn_id,
                context,
                tag,
                len: n,
                rx_buf: msg.buf,
                tagged,
            },
        );
        Ok(())
    }

    fn finish_rendezvous_read(&self, op_id: u64) -> Result<(), T::Error> {
        let pending = self.pending_rendezvous.lock().unwrap().remove(&op_id);
        let Some(pending) = pending else { return Ok(()) };

        let conn = self.connection(&pending.peer)?;
        let ack = header_for(
            OpType::Ack,
            if pending.tagged { Op::Tagged } else { Op::Msg },
            pending.conn_id,
            pending.msg_id,
            0,
            0,
            0,
            Flags::empty(),
        );
        let mut ack_bytes = vec![0u8; PKT_HDR_LEN];
        ack.encode_into(&mut ack_bytes);
        let ack_op_id = self.next_op_id() | UNTRACKED_SEND;
        match self.transport.send(&conn, ack_op_id, &ack_bytes, None) {
            Ok(()) => {}
            Err(e) if e.is_again() => {
                trace!("backpressure sending rendezvous ack, dropping -- sender will not retire");
            }
            Err(e) => self.log_protocol_error(e),
        }

        self.repost(pending.rx_buf)?;
        self.push_completion(Completion {
            context: pending.context,
            flags: comp_flags_for(if pending.tagged { Op::Tagged } else { Op::Msg }, false)
                | CompFlags::RECV,
            len: pending.len,
            tag: pending.tag,
            data: 0,
            error: None,
        });
        Ok(())
    }

    /// Dispatch point for every transport completion, called from
    /// `Endpoint::progress_multi`.
    pub(crate) fn handle_transport_completion(
        &self,
        completion: TransportCompletion<T::Address, T::Error>,
    ) -> Result<(), T::Error> {
        match completion.kind {
            CompletionKind::Send => {
                self.complete_send(completion.op_id, completion.result);
                Ok(())
            }
            CompletionKind::RmaRead => {
                if let Err(e) = completion.result {
                    self.log_protocol_error(&e);
                    return Err(Error::Transport(e));
                }
                self.finish_rendezvous_read(completion.op_id)
            }
            CompletionKind::Recv { rx_index, len, src } => {
                if let Err(e) = completion.result {
                    self.log_protocol_error(&e);
                    return Err(Error::Transport(e));
                }
                self.handle_arrival(rx_index, len, src)
            }
        }
    }

    fn handle_arrival(&self, rx_index: u32, len: usize, src: T::Address) -> Result<(), T::Error> {
        let slot = self.rx_slots.lock().unwrap()[rx_index as usize].take();
        let Some(RxSlot { buf }) = slot else {
            debug!(rx_index, "arrival on an rx slot with no tracked buffer");
            return Ok(());
        };

        let header = match PacketHeader::decode(&buf.as_slice()[..len.min(buf.len())]) {
            Ok(h) => h,
            Err(e) => {
                self.log_protocol_error(e);
                self.repost(buf)?;
                return Ok(());
            }
        };

        match header.ctrl.op_type {
            OpType::Ack => {
                self.retire_rendezvous_send(header.ctrl.msg_id);
                self.repost(buf)
            }
            OpType::Data => self.on_data_arrival(buf, header, src),
            OpType::LargeData => self.on_large_data_arrival(buf, header, src),
        }
    }

    fn retire_rendezvous_send(&self, msg_id: u64) {
        if !KeyIndex::is_current(&self.tx_table, msg_id) {
            debug!(msg_id, "ack for a stale or unknown msg_id, ignoring");
            return;
        }
        let index = KeyIndex::index_of(msg_id);
        if let Some(entry) = self.tx_table.release(index) {
            for mr in entry.local_mrs {
                let _ = self.transport.mr_close(mr);
            }
            self.push_completion(Completion {
                context: entry.context,
                flags: entry.comp_flags,
                len: entry.size,
                tag: entry.tag,
                data: 0,
                error: None,
            });
        }
    }

    fn on_data_arrival(&self, buf: Buf<T>, header: PacketHeader, src: T::Address) -> Result<(), T::Error> {
        let tagged = matches!(header.op.op, Op::Tagged);
        let (posted, unexp) = self.queues(tagged);
        let tag = header.op.tag;
        let size = header.op.size as usize;

        match posted.match_and_remove(&src, tag) {
            Some(entry) => {
                let n = size.min(entry.iov_total_len);
                unsafe {
                    let dest = entry.dest_slice();
                    dest[..n].copy_from_slice(&buf.as_slice()[PAYLOAD_OFFSET..PAYLOAD_OFFSET + n]);
                }
                self.repost(buf)?;
                self.push_completion(Completion {
                    context: entry.context,
                    flags: entry.comp_flags,
                    len: n,
                    tag,
                    data: header.op.data,
                    error: None,
                });
                Ok(())
            }
            None => {
                trace!(tag, "no posted recv, enqueuing unexpected message");
                unexp.push(UnexpMsg {
                    addr: src,
                    tag,
                    size,
                    is_rendezvous: false,
                    buf,
                });
                Ok(())
            }
        }
    }

    fn on_large_data_arrival(&self, buf: Buf<T>, header: PacketHeader, src: T::Address) -> Result<(), T::Error> {
        let tagged = matches!(header.op.op, Op::Tagged);
        let (posted, unexp) = self.queues(tagged);
        let tag = header.op.tag;
        let size = header.op.size as usize;

        match posted.match_and_remove(&src, tag) {
            Some(entry) => {
                let msg = UnexpMsg {
                    addr: src,
                    tag,
                    size,
                    is_rendezvous: true,
                    buf,
                };
                let context = entry.context;
                unsafe {
                    let dest = entry.dest_slice();
                    self.initiate_rendezvous_read(msg, dest, context, tagged, tag)
                }
            }
            None => {
                unexp.push(UnexpMsg {
                    addr: src,
                    tag,
                    size,
                    is_rendezvous: true,
                    buf,
                });
                Ok(())
            }
        }
    }
}
