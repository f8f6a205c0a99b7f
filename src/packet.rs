//! On-wire packet format and header flag translation.
//!
//! All multi-byte fields are little-endian. `ctrl_hdr.version` and
//! `op_hdr.version` are independent; a mismatch on either is a protocol
//! error (the caller drops the packet and logs at `warn!`, since it
//! indicates a peer running an incompatible build rather than ordinary
//! backpressure).
//!
//! ```text
//! ctrl_hdr : { version: u8, op_type: u8, conn_id: u32, msg_id: u64 }
//! op_hdr   : { version: u8, op: u8, flags: u16, size: u64, tag: u64, data: u64 }
//! payload  : bytes[size]   OR   rma_iov_descriptor
//! ```

use crate::common::{ConnId, Flags, MsgId, Tag};

pub const CTRL_VERSION: u8 = 1;
pub const OP_VERSION: u8 = 1;

pub const CTRL_HDR_LEN: usize = 1 + 1 + 4 + 8;
pub const OP_HDR_LEN: usize = 1 + 1 + 2 + 8 + 8 + 8;
pub const PKT_HDR_LEN: usize = CTRL_HDR_LEN + OP_HDR_LEN;

pub const RMA_IOV_ENTRY_LEN: usize = 8 + 8 + 8;

/// Distinguishes the three packet shapes that flow over the wire. `Ack` is
/// not part of the original header enumeration but is needed to close the
/// rendezvous loop (see the design's resolved open question on the
/// rendezvous acknowledgement format).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpType {
    Data = 0,
    LargeData = 1,
    Ack = 2,
}

impl OpType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(OpType::Data),
            1 => Some(OpType::LargeData),
            2 => Some(OpType::Ack),
            _ => None,
        }
    }
}

/// Message class, set once per send call and echoed in the completion's
/// [`crate::common::CompFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Msg = 0,
    Tagged = 1,
}

impl Op {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Op::Msg),
            1 => Some(Op::Tagged),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Wire-level flags, translated one-to-one from user [`Flags`] by
    /// [`translate_flags`].
    pub struct WireFlags: u16 {
        const REMOTE_CQ_DATA    = 1 << 0;
        const TRANSMIT_COMPLETE = 1 << 1;
        const DELIVERY_COMPLETE = 1 << 2;
    }
}

/// Translate user-facing send flags into the subset that travels on the
/// wire. `INJECT`/`COMPLETION`/`PEEK`/`CLAIM`/`DISCARD` are local-only and
/// never reach the peer.
pub fn translate_flags(flags: Flags) -> WireFlags {
    let mut wire = WireFlags::empty();
    if flags.contains(Flags::REMOTE_CQ_DATA) {
        wire |= WireFlags::REMOTE_CQ_DATA;
    }
    if flags.contains(Flags::TRANSMIT_COMPLETE) {
        wire |= WireFlags::TRANSMIT_COMPLETE;
    }
    if flags.contains(Flags::DELIVERY_COMPLETE) {
        wire |= WireFlags::DELIVERY_COMPLETE;
    }
    wire
}

#[derive(Debug, Clone, Copy)]
pub struct CtrlHeader {
    pub version: u8,
    pub op_type: OpType,
    pub conn_id: ConnId,
    pub msg_id: MsgId,
}

#[derive(Debug, Clone, Copy)]
pub struct OpHeader {
    pub version: u8,
    pub op: Op,
    pub flags: WireFlags,
    pub size: u64,
    pub tag: Tag,
    pub data: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    pub ctrl: CtrlHeader,
    pub op: OpHeader,
}

/// Error from decoding a malformed or version-mismatched header off the
/// wire. Kept separate from [`crate::Error`] because it never reaches a
/// caller synchronously -- it is always handled by dropping the packet in
/// the receive path and logging, per the design's protocol-error policy.
#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum DecodeError {
    #[error("packet truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("unsupported ctrl_hdr version {0}")]
    CtrlVersion(u8),
    #[error("unsupported op_hdr version {0}")]
    OpVersion(u8),
    #[error("unrecognized op_type {0}")]
    BadOpType(u8),
    #[error("unrecognized op {0}")]
    BadOp(u8),
}

impl PacketHeader {
    pub fn encode_into(&self, buf: &mut [u8]) -> usize {
        assert!(buf.len() >= PKT_HDR_LEN);
        let mut at = 0;
        buf[at] = self.ctrl.version;
        at += 1;
        buf[at] = self.ctrl.op_type as u8;
        at += 1;
        buf[at..at + 4].copy_from_slice(&self.ctrl.conn_id.to_le_bytes());
        at += 4;
        buf[at..at + 8].copy_from_slice(&self.ctrl.msg_id.to_le_bytes());
        at += 8;

        buf[at] = self.op.version;
        at += 1;
        buf[at] = self.op.op as u8;
        at += 1;
        buf[at..at + 2].copy_from_slice(&self.op.flags.bits().to_le_bytes());
        at += 2;
        buf[at..at + 8].copy_from_slice(&self.op.size.to_le_bytes());
        at += 8;
        buf[at..at + 8].copy_from_slice(&self.op.tag.to_le_bytes());
        at += 8;
        buf[at..at + 8].copy_from_slice(&self.op.data.to_le_bytes());
        at += 8;
        debug_assert_eq!(at, PKT_HDR_LEN);
        at
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < PKT_HDR_LEN {
            return Err(DecodeError::Truncated {
                need: PKT_HDR_LEN,
                have: buf.len(),
            });
        }
        let mut at = 0;
        let ctrl_version = buf[at];
        at += 1;
        if ctrl_version != CTRL_VERSION {
            return Err(DecodeError::CtrlVersion(ctrl_version));
        }
        let op_type =
            OpType::from_u8(buf[at]).ok_or(DecodeError::BadOpType(buf[at]))?;
        at += 1;
        let conn_id = u32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
        at += 4;
        let msg_id = u64::from_le_bytes(buf[at..at + 8].try_into().unwrap());
        at += 8;

        let op_version = buf[at];
        at += 1;
        if op_version != OP_VERSION {
            return Err(DecodeError::OpVersion(op_version));
        }
        let op = Op::from_u8(buf[at]).ok_or(DecodeError::BadOp(buf[at]))?;
        at += 1;
        let flags = WireFlags::from_bits_truncate(u16::from_le_bytes(
            buf[at..at + 2].try_into().unwrap(),
        ));
        at += 2;
        let size = u64::from_le_bytes(buf[at..at + 8].try_into().unwrap());
        at += 8;
        let tag = u64::from_le_bytes(buf[at..at + 8].try_into().unwrap());
        at += 8;
        let data = u64::from_le_bytes(buf[at..at + 8].try_into().unwrap());
        at += 8;
        debug_assert_eq!(at, PKT_HDR_LEN);

        Ok(Self {
            ctrl: CtrlHeader {
                version: ctrl_version,
                op_type,
                conn_id,
                msg_id,
            },
            op: OpHeader {
                version: op_version,
                op,
                flags,
                size,
                tag,
                data,
            },
        })
    }
}

/// One entry of an RMA-IOV descriptor: a remotely-readable region.
#[derive(Debug, Clone, Copy)]
pub struct RmaIovEntry {
    /// Virtual address, or zero when the transport uses offset semantics.
    pub addr: u64,
    pub len: u64,
    pub key: u64,
}

/// The rendezvous announcement payload for `op_type = large_data`.
#[derive(Debug, Clone)]
pub struct RmaIovDescriptor {
    pub entries: Vec<RmaIovEntry>,
}

impl RmaIovDescriptor {
    pub fn encoded_len(&self) -> usize {
        1 + self.entries.len() * RMA_IOV_ENTRY_LEN
    }

    pub fn encode_into(&self, buf: &mut [u8]) -> usize {
        assert!(buf.len() >= self.encoded_len());
        assert!(self.entries.len() <= u8::MAX as usize);
        buf[0] = self.entries.len() as u8;
        let mut at = 1;
        for entry in &self.entries {
            buf[at..at + 8].copy_from_slice(&entry.addr.to_le_bytes());
            at += 8;
            buf[at..at + 8].copy_from_slice(&entry.len.to_le_bytes());
            at += 8;
            buf[at..at + 8].copy_from_slice(&entry.key.to_le_bytes());
            at += 8;
        }
        at
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.is_empty() {
            return Err(DecodeError::Truncated { need: 1, have: 0 });
        }
        let count = buf[0] as usize;
        let need = 1 + count * RMA_IOV_ENTRY_LEN;
        if buf.len() < need {
            return Err(DecodeError::Truncated {
                need,
                have: buf.len(),
            });
        }
        let mut entries = Vec::with_capacity(count);
        let mut at = 1;
        for _ in 0..count {
            let addr = u64::from_le_bytes(buf[at..at + 8].try_into().unwrap());
            at += 8;
            let len = u64::from_le_bytes(buf[at..at + 8].try_into().unwrap());
            at += 8;
            let key = u64::from_le_bytes(buf[at..at + 8].try_into().unwrap());
            at += 8;
            entries.push(RmaIovEntry { addr, len, key });
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = PacketHeader {
            ctrl: CtrlHeader {
                version: CTRL_VERSION,
                op_type: OpType::LargeData,
                conn_id: 0xdead_beef,
                msg_id: 0x0102_0304_0506_0708,
            },
            op: OpHeader {
                version: OP_VERSION,
                op: Op::Tagged,
                flags: WireFlags::REMOTE_CQ_DATA | WireFlags::DELIVERY_COMPLETE,
                size: 12345,
                tag: 0x0123,
                data: 42,
            },
        };
        let mut buf = [0u8; PKT_HDR_LEN];
        header.encode_into(&mut buf);
        let decoded = PacketHeader::decode(&buf).unwrap();
        assert_eq!(decoded.ctrl.conn_id, header.ctrl.conn_id);
        assert_eq!(decoded.ctrl.msg_id, header.ctrl.msg_id);
        assert_eq!(decoded.ctrl.op_type, OpType::LargeData);
        assert_eq!(decoded.op.op, Op::Tagged);
        assert_eq!(decoded.op.size, 12345);
        assert_eq!(decoded.op.tag, 0x0123);
        assert!(decoded.op.flags.contains(WireFlags::REMOTE_CQ_DATA));
        assert!(decoded.op.flags.contains(WireFlags::DELIVERY_COMPLETE));
        assert!(!decoded.op.flags.contains(WireFlags::TRANSMIT_COMPLETE));
    }

    #[test]
    fn rejects_truncated_header() {
        let buf = [0u8; PKT_HDR_LEN - 1];
        assert!(matches!(
            PacketHeader::decode(&buf),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_version_mismatch() {
        let header = PacketHeader {
            ctrl: CtrlHeader {
                version: CTRL_VERSION,
                op_type: OpType::Data,
                conn_id: 0,
                msg_id: 0,
            },
            op: OpHeader {
                version: OP_VERSION,
                op: Op::Msg,
                flags: WireFlags::empty(),
                size: 0,
                tag: 0,
                data: 0,
            },
        };
        let mut buf = [0u8; PKT_HDR_LEN];
        header.encode_into(&mut buf);
        buf[0] = CTRL_VERSION + 1;
        assert!(matches!(
            PacketHeader::decode(&buf),
            Err(DecodeError::CtrlVersion(_))
        ));
    }

    #[test]
    fn rma_iov_round_trips() {
        let descriptor = RmaIovDescriptor {
            entries: vec![
                RmaIovEntry {
                    addr: 0x1000,
                    len: 4096,
                    key: 7,
                },
                RmaIovEntry {
                    addr: 0x2000,
                    len: 8192,
                    key: 9,
                },
            ],
        };
        let mut buf = vec![0u8; descriptor.encoded_len()];
        descriptor.encode_into(&mut buf);
        let decoded = RmaIovDescriptor::decode(&buf).unwrap();
        assert_eq!(decoded.entries.len(), 2);
        assert_eq!(decoded.entries[0].addr, 0x1000);
        assert_eq!(decoded.entries[1].key, 9);
    }
}
