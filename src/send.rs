//! Send path: inline-inject, eager-buffered, and rendezvous regimes.
//!
//! Every public send call funnels through [`Endpoint::send_common`], which
//! picks a regime from `(payload_size, flags)` exactly as laid out in the
//! design. The untagged/tagged and plain/data-bearing variants are thin
//! wrappers, mirroring how the reference provider's `rxm_ep_send`,
//! `rxm_ep_tsend`, `rxm_ep_senddata`, etc. all bottom out in
//! `rxm_ep_send_common`.

use tracing::trace;

use crate::common::{CompFlags, Flags, Tag};
use crate::endpoint::{
    comp_flags_for, header_for, mint_msg_id, Completion, Endpoint, TxEntry, TxState, HEADER_LEN, UNTRACKED_SEND,
};
use crate::error::{Error, Result};
use crate::packet::{Op, OpType, RmaIovDescriptor, RmaIovEntry};
use crate::transport::{ConnectionMap, MrAccess, Transport};

impl<T: Transport, M: ConnectionMap<T>> Endpoint<T, M> {
    pub fn send(&self, dest: &T::Address, buf: &[u8], context: u64, flags: Flags) -> Result<(), T::Error> {
        self.send_common(dest, buf, Op::Msg, 0, 0, context, flags)
    }

    pub fn senddata(
        &self,
        dest: &T::Address,
        buf: &[u8],
        data: u64,
        context: u64,
        flags: Flags,
    ) -> Result<(), T::Error> {
        self.send_common(dest, buf, Op::Msg, 0, data, context, flags | Flags::REMOTE_CQ_DATA)
    }

    pub fn inject(&self, dest: &T::Address, buf: &[u8]) -> Result<(), T::Error> {
        self.send_common(dest, buf, Op::Msg, 0, 0, 0, Flags::INJECT)
    }

    pub fn injectdata(&self, dest: &T::Address, buf: &[u8], data: u64) -> Result<(), T::Error> {
        self.send_common(
            dest,
            buf,
            Op::Msg,
            0,
            data,
            0,
            Flags::INJECT | Flags::REMOTE_CQ_DATA,
        )
    }

    pub fn tsend(
        &self,
        dest: &T::Address,
        buf: &[u8],
        tag: Tag,
        context: u64,
        flags: Flags,
    ) -> Result<(), T::Error> {
        self.send_common(dest, buf, Op::Tagged, tag, 0, context, flags)
    }

    pub fn tsenddata(
        &self,
        dest: &T::Address,
        buf: &[u8],
        tag: Tag,
        data: u64,
        context: u64,
        flags: Flags,
    ) -> Result<(), T::Error> {
        self.send_common(dest, buf, Op::Tagged, tag, data, context, flags | Flags::REMOTE_CQ_DATA)
    }

    pub fn tinject(&self, dest: &T::Address, buf: &[u8], tag: Tag) -> Result<(), T::Error> {
        self.send_common(dest, buf, Op::Tagged, tag, 0, 0, Flags::INJECT)
    }

    pub fn tinjectdata(&self, dest: &T::Address, buf: &[u8], tag: Tag, data: u64) -> Result<(), T::Error> {
        self.send_common(
            dest,
            buf,
            Op::Tagged,
            tag,
            data,
            0,
            Flags::INJECT | Flags::REMOTE_CQ_DATA,
        )
    }

    fn send_common(
        &self,
        dest: &T::Address,
        payload: &[u8],
        op: Op,
        tag: Tag,
        data: u64,
        context: u64,
        flags: Flags,
    ) -> Result<(), T::Error> {
        self.require_enabled()?;

        let inline_size = self.config.inline_size;
        if flags.contains(Flags::INJECT) && payload.len() > inline_size {
            return Err(Error::MsgTooLarge {
                size: payload.len(),
                limit: inline_size,
            });
        }

        let conn_id = self.resolve(dest)?;
        let conn = self.connection(dest)?;
        let comp_flags = comp_flags_for(op, flags.contains(Flags::REMOTE_CQ_DATA)) | CompFlags::SEND;

        if HEADER_LEN + payload.len() <= self.transport.inject_size() {
            return self.send_inline_inject(&conn, conn_id, payload, op, tag, data, context, flags, comp_flags);
        }
        if payload.len() <= inline_size {
            return self.send_eager_buffered(&conn, conn_id, payload, op, tag, data, context, flags, comp_flags);
        }
        self.send_rendezvous(&conn, conn_id, payload, op, tag, data, context, flags, comp_flags)
    }

    fn send_inline_inject(
        &self,
        conn: &T::Connection,
        conn_id: u32,
        payload: &[u8],
        op: Op,
        tag: Tag,
        data: u64,
        context: u64,
        flags: Flags,
        comp_flags: CompFlags,
    ) -> Result<(), T::Error> {
        let mut buf = self.tx_pool.acquire().ok_or_else(|| {
            self.log_exhaustion("tx_pool (inline inject)");
            Error::Again
        })?;
        let header = header_for(OpType::Data, op, conn_id, 0, payload.len() as u64, tag, data, flags);
        let slice = buf.as_mut_slice();
        header.encode_into(slice);
        slice[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
        let packet = &slice[..HEADER_LEN + payload.len()];
        let result = self.transport.inject(conn, packet);
        self.tx_pool.release(buf);
        result.map_err(Error::Transport)?;
        if flags.contains(Flags::COMPLETION) {
            self.push_completion(Completion {
                context,
                flags: comp_flags,
                len: payload.len(),
                tag,
                data,
                error: None,
            });
        }
        Ok(())
    }

    fn send_eager_buffered(
        &self,
        conn: &T::Connection,
        conn_id: u32,
        payload: &[u8],
        op: Op,
        tag: Tag,
        data: u64,
        context: u64,
        flags: Flags,
        comp_flags: CompFlags,
    ) -> Result<(), T::Error> {
        let mut buf = self.tx_pool.acquire().ok_or_else(|| {
            self.log_exhaustion("tx_pool (eager)");
            Error::Again
        })?;
        let header = header_for(OpType::Data, op, conn_id, 0, payload.len() as u64, tag, data, flags);
        let slice = buf.as_mut_slice();
        header.encode_into(slice);
        slice[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
        let packet_len = HEADER_LEN + payload.len();
        let desc = buf.mr().cloned();

        let index = match self.tx_table.get(TxEntry {
            state: TxState::Tx,
            tx_buf: None,
            context,
            flags,
            comp_flags,
            size: payload.len(),
            tag,
            local_mrs: Vec::new(),
        }) {
            Some(i) => i,
            None => {
                self.tx_pool.release(buf);
                self.log_exhaustion("tx_table (eager)");
                return Err(Error::Again);
            }
        };

        let op_id = index as u64;
        match self
            .transport
            .send(conn, op_id, &buf.as_slice()[..packet_len], desc.as_ref())
        {
            Ok(()) => {
                self.tx_table.with_mut(index, |e| e.tx_buf = Some(buf));
                Ok(())
            }
            Err(e) => {
                self.tx_table.release(index);
                self.tx_pool.release(buf);
                if e.is_again() {
                    trace!("transport backpressure on eager send, progressing once");
                    let _ = self.progress();
                    Err(Error::Again)
                } else {
                    Err(Error::Transport(e))
                }
            }
        }
    }

    fn send_rendezvous(
        &self,
        conn: &T::Connection,
        conn_id: u32,
        payload: &[u8],
        op: Op,
        tag: Tag,
        data: u64,
        context: u64,
        flags: Flags,
        comp_flags: CompFlags,
    ) -> Result<(), T::Error> {
        let mut buf = self.tx_pool.acquire().ok_or_else(|| {
            self.log_exhaustion("tx_pool (rendezvous)");
            Error::Again
        })?;

        let index = match self.tx_table.get(TxEntry {
            state: TxState::LmtTx,
            tx_buf: None,
            context,
            flags,
            comp_flags,
            size: payload.len(),
            tag,
            local_mrs: Vec::new(),
        }) {
            Some(i) => i,
            None => {
                self.tx_pool.release(buf);
                self.log_exhaustion("tx_table (rendezvous)");
                return Err(Error::Again);
            }
        };
        let msg_id = mint_msg_id(&self.tx_table, index);

        if self.transport.requires_local_mr() {
            // This transport expects the caller to have registered its own
            // send buffers up front and to hand back a descriptor for them;
            // `send`/`tsend` take a plain `&[u8]` with no such descriptor, so
            // there is nothing here to reuse. Fail explicitly rather than
            // registering on the caller's behalf against a transport that
            // said it won't accept that.
            self.tx_table.release(index);
            self.tx_pool.release(buf);
            return Err(Error::Unsupported);
        }

        // Register the source buffer for a remote read. `payload` lives in
        // caller memory, not the tx pool; registering it here (rather than
        // the tx_buf, which only carries the announcement) is what lets the
        // receiver pull the real data.
        let source_ptr = payload.as_ptr() as *mut u8;
        let mr = unsafe {
            self.transport
                .mr_reg(source_ptr, payload.len(), MrAccess::REMOTE_READ)
        };
        let mr = match mr {
            Ok(mr) => mr,
            Err(e) => {
                self.tx_table.release(index);
                self.tx_pool.release(buf);
                return Err(Error::Transport(e));
            }
        };
        let rma_entry = RmaIovEntry {
            addr: if self.transport.uses_virtual_addressing() {
                source_ptr as u64
            } else {
                0
            },
            len: payload.len() as u64,
            key: self.transport.mr_key(&mr),
        };
        let descriptor = RmaIovDescriptor {
            entries: vec![rma_entry],
        };

        let header = header_for(
            OpType::LargeData,
            op,
            conn_id,
            msg_id,
            payload.len() as u64,
            tag,
            data,
            flags,
        );
        let slice = buf.as_mut_slice();
        header.encode_into(slice);
        let descriptor_len = descriptor.encoded_len();
        descriptor.encode_into(&mut slice[HEADER_LEN..HEADER_LEN + descriptor_len]);
        let packet_len = HEADER_LEN + descriptor_len;
        let desc = buf.mr().cloned();

        let op_id = index as u64;
        match self
            .transport
            .send(conn, op_id, &buf.as_slice()[..packet_len], desc.as_ref())
        {
            Ok(()) => {
                self.tx_table.with_mut(index, |e| {
                    e.tx_buf = Some(buf);
                    e.local_mrs.push(mr);
                });
                Ok(())
            }
            Err(e) => {
                self.tx_table.release(index);
                self.tx_pool.release(buf);
                let _ = self.transport.mr_close(mr);
                if e.is_again() {
                    let _ = self.progress();
                    Err(Error::Again)
                } else {
                    Err(Error::Transport(e))
                }
            }
        }
    }

    /// Invoked from the progress loop when the transport reports a `Send`
    /// completion. Eager sends complete to the user here; rendezvous
    /// announcements only free their `tx_buf` and wait for the ack.
    pub(crate) fn complete_send(&self, op_id: u64, result: std::result::Result<(), T::Error>) {
        if op_id & UNTRACKED_SEND != 0 {
            // A rendezvous ack (or other core-internal send) -- no tx_table
            // slot to reconcile and no user completion to post.
            return;
        }
        let index = op_id as u32;
        if let Err(e) = result {
            if let Some(entry) = self.tx_table.release(index) {
                if let Some(buf) = entry.tx_buf {
                    self.tx_pool.release(buf);
                }
                for mr in entry.local_mrs {
                    let _ = self.transport.mr_close(mr);
                }
                self.push_completion(Completion {
                    context: entry.context,
                    flags: entry.comp_flags,
                    len: 0,
                    tag: entry.tag,
                    data: 0,
                    error: Some(Error::Transport(e)),
                });
            }
            return;
        }

        let outcome = self.tx_table.with_mut(index, |entry| match entry.state {
            TxState::Tx => (true, None),
            TxState::LmtTx => (false, entry.tx_buf.take()),
        });
        match outcome {
            Some((true, _)) => {
                if let Some(entry) = self.tx_table.release(index) {
                    if let Some(buf) = entry.tx_buf {
                        self.tx_pool.release(buf);
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
            Some((false, buf)) => {
                // Rendezvous announcement transmitted; tx_buf is no longer
                // needed once the peer has the header, but the table entry
                // stays until the ack arrives.
                if let Some(buf) = buf {
                    self.tx_pool.release(buf);
                }
            }
            None => {}
        }
    }
}
