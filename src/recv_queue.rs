//! Posted-receive and unexpected-message queues.
//!
//! An endpoint owns two instances of each queue kind, one for untagged
//! (`FI_MSG`) traffic and one for tagged (`FI_TAGGED`) traffic; which
//! instance a call uses is decided by the endpoint, not by this module. Both
//! queues are plain `Vec`s under a single mutex — insertion order is
//! preserved, and matching is a linear scan for the first entry whose
//! predicate holds, giving the FIFO fairness the design calls for.

use std::sync::Mutex;

use tracing::trace;

use crate::buffer::Buf;
use crate::common::{CompFlags, Flags, Ignore, Tag};
use crate::transport::Transport;

/// The two match-predicate flavors a posted receive or unexpected message
/// carries. A single sum type in place of separate tagged/untagged list
/// implementations, since the structures are otherwise identical.
#[derive(Debug, Clone, Copy)]
pub enum Match {
    Untagged,
    Tagged { tag: Tag, ignore: Ignore },
}

impl Match {
    /// Evaluated with `self` as the *posted* side's match info and
    /// `other_tag` as the arrived message's tag (untagged arrivals pass 0,
    /// which is never consulted).
    fn accepts(&self, other_tag: Tag) -> bool {
        match self {
            Match::Untagged => true,
            Match::Tagged { tag, ignore } => (tag ^ other_tag) & !ignore == 0,
        }
    }
}

/// A raw pointer into the caller's destination buffer, held across the gap
/// between posting a receive and the arrival that matches it. Sound because
/// the caller of [`PostedRecvQueue::post`] keeps the pointee alive until the
/// corresponding completion (or a `cancel`) retires the entry -- the same
/// contract [`crate::transport::Transport::post_recv`] imposes on the
/// transport layer below this one.
pub(crate) struct DestPtr(pub *mut u8);
unsafe impl Send for DestPtr {}

/// A posted receive awaiting a matching arrival.
pub struct RecvEntry<T: Transport> {
    /// `None` is wildcard: matches any source. Forced to `None` at post time
    /// when the endpoint lacks directed-receive capability.
    pub addr: Option<T::Address>,
    pub match_info: Match,
    pub(crate) dest_ptr: DestPtr,
    pub iov_total_len: usize,
    pub context: u64,
    pub flags: Flags,
    pub comp_flags: CompFlags,
}

impl<T: Transport> RecvEntry<T> {
    /// # Safety
    /// Valid only until this entry is removed from its queue.
    pub(crate) unsafe fn dest_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.dest_ptr.0, self.iov_total_len)
    }
}

/// A fully received packet with no posted receive claim yet.
pub struct UnexpMsg<T: Transport> {
    pub addr: T::Address,
    pub tag: Tag,
    pub size: usize,
    pub is_rendezvous: bool,
    pub buf: Buf<T>,
}

fn recv_matches_arrival<T: Transport>(
    entry: &RecvEntry<T>,
    addr: &T::Address,
    tag: Tag,
) -> bool {
    match &entry.addr {
        Some(want) => want == addr && entry.match_info.accepts(tag),
        None => entry.match_info.accepts(tag),
    }
}

/// Matches a not-yet-posted receive's filter against an already-arrived
/// unexpected message, used by the posted-recv arrival flow (§4.6) when a new
/// receive is posted directly against the unexpected list.
pub fn unexp_matches_posted<T: Transport>(
    addr: Option<&T::Address>,
    match_info: &Match,
    unexp: &UnexpMsg<T>,
) -> bool {
    match addr {
        Some(want) => want == &unexp.addr && match_info.accepts(unexp.tag),
        None => match_info.accepts(unexp.tag),
    }
}

/// Queue of posted receives of one flavor (untagged or tagged).
pub struct PostedRecvQueue<T: Transport> {
    recv_list: Mutex<Vec<RecvEntry<T>>>,
}

impl<T: Transport> PostedRecvQueue<T> {
    pub fn new() -> Self {
        Self {
            recv_list: Mutex::new(Vec::new()),
        }
    }

    pub fn post(&self, entry: RecvEntry<T>) {
        self.recv_list.lock().unwrap().push(entry);
    }

    /// Removes and returns the first posted receive matching `(addr, tag)`,
    /// preserving FIFO among matching entries.
    pub fn match_and_remove(&self, addr: &T::Address, tag: Tag) -> Option<RecvEntry<T>> {
        let mut list = self.recv_list.lock().unwrap();
        let pos = list
            .iter()
            .position(|e| recv_matches_arrival(e, addr, tag))?;
        trace!(pos, "posted-recv match");
        Some(list.remove(pos))
    }

    /// Removes the first posted receive whose `context` equals `context`.
    pub fn cancel(&self, context: u64) -> Option<RecvEntry<T>> {
        let mut list = self.recv_list.lock().unwrap();
        let pos = list.iter().position(|e| e.context == context)?;
        Some(list.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.recv_list.lock().unwrap().len()
    }
}

/// Queue of arrived-but-unclaimed messages of one flavor.
pub struct UnexpQueue<T: Transport> {
    unexp_msg_list: Mutex<Vec<UnexpMsg<T>>>,
}

impl<T: Transport> UnexpQueue<T> {
    pub fn new() -> Self {
        Self {
            unexp_msg_list: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, msg: UnexpMsg<T>) {
        self.unexp_msg_list.lock().unwrap().push(msg);
    }

    /// Removes and returns the first unexpected message matching the given
    /// receive filter, in arrival order.
    pub fn match_and_remove(
        &self,
        addr: Option<&T::Address>,
        match_info: &Match,
    ) -> Option<UnexpMsg<T>> {
        let mut list = self.unexp_msg_list.lock().unwrap();
        let pos = list
            .iter()
            .position(|u| unexp_matches_posted(addr, match_info, u))?;
        Some(list.remove(pos))
    }

    /// Non-consuming lookup for `PEEK`, returning the index so a later
    /// `CLAIM` can remove exactly that entry.
    pub fn peek_index(&self, addr: Option<&T::Address>, match_info: &Match) -> Option<usize> {
        let list = self.unexp_msg_list.lock().unwrap();
        list.iter()
            .position(|u| unexp_matches_posted(addr, match_info, u))
    }

    pub fn remove_at(&self, index: usize) -> UnexpMsg<T> {
        self.unexp_msg_list.lock().unwrap().remove(index)
    }

    /// Reads the tag of the entry at `index` without removing it, for a
    /// plain (non-`CLAIM`, non-`DISCARD`) `PEEK` completion.
    pub fn tag_at(&self, index: usize) -> Tag {
        self.unexp_msg_list.lock().unwrap()[index].tag
    }

    pub fn len(&self) -> usize {
        self.unexp_msg_list.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sim::{SimAddress, SimConfig, SimTransport};

    fn entry(addr: Option<SimAddress>, match_info: Match, context: u64) -> RecvEntry<SimTransport> {
        let scratch: &'static mut [u8; 16] = Box::leak(Box::new([0u8; 16]));
        RecvEntry {
            addr,
            match_info,
            dest_ptr: DestPtr(scratch.as_mut_ptr()),
            iov_total_len: 16,
            context,
            flags: Flags::empty(),
            comp_flags: CompFlags::RECV,
        }
    }

    #[test]
    fn untagged_fifo_match() {
        let q: PostedRecvQueue<SimTransport> = PostedRecvQueue::new();
        q.post(entry(None, Match::Untagged, 1));
        q.post(entry(None, Match::Untagged, 2));
        let m = q.match_and_remove(&SimAddress(0), 0).unwrap();
        assert_eq!(m.context, 1);
    }

    #[test]
    fn tagged_ignore_mask() {
        let q: PostedRecvQueue<SimTransport> = PostedRecvQueue::new();
        q.post(entry(
            None,
            Match::Tagged {
                tag: 0x0100,
                ignore: 0x00FF,
            },
            1,
        ));
        let m = q.match_and_remove(&SimAddress(0), 0x0123);
        assert!(m.is_some());
    }

    #[test]
    fn directed_filter_rejects_other_source() {
        let q: PostedRecvQueue<SimTransport> = PostedRecvQueue::new();
        q.post(entry(Some(SimAddress(1)), Match::Untagged, 1));
        assert!(q.match_and_remove(&SimAddress(2), 0).is_none());
        assert!(q.match_and_remove(&SimAddress(1), 0).is_some());
    }

    #[test]
    fn cancel_removes_by_context() {
        let q: PostedRecvQueue<SimTransport> = PostedRecvQueue::new();
        q.post(entry(None, Match::Untagged, 7));
        assert!(q.cancel(8).is_none());
        assert!(q.cancel(7).is_some());
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn unexpected_queue_preserves_arrival_order() {
        let t = SimTransport::new(SimConfig::default());
        let pool = crate::buffer::Pool::new(&t, 2, 64, None).unwrap();
        let uq: UnexpQueue<SimTransport> = UnexpQueue::new();
        uq.push(UnexpMsg {
            addr: SimAddress(1),
            tag: 5,
            size: 1,
            is_rendezvous: false,
            buf: pool.acquire().unwrap(),
        });
        uq.push(UnexpMsg {
            addr: SimAddress(1),
            tag: 5,
            size: 1,
            is_rendezvous: false,
            buf: pool.acquire().unwrap(),
        });
        assert_eq!(uq.len(), 2);
        let idx = uq.peek_index(None, &Match::Tagged { tag: 5, ignore: 0 });
        assert_eq!(idx, Some(0));
    }
}
