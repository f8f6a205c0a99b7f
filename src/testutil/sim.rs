//! An in-process, single-threaded simulated [`Transport`], used by every
//! module's unit tests and by the scenario tests in `tests/`.
//!
//! Grounded on the reference codebase's `transport::simulated` module: no
//! background thread and no async runtime drive delivery. A `Network` holds
//! queued-but-undelivered packets and preposted receive buffers; tests call
//! [`SimTransport::step`] explicitly to advance the simulation one packet at
//! a time, making scenario tests deterministic and easy to reason about.
//!
//! RMA reads are simulated by copying directly out of the peer's registered
//! memory, which is safe here because both "sides" of a test live in the
//! same process and the transport reports virtual addressing: the `addr`
//! field of an `RmaIovEntry` is a real pointer into the sender's buffer.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::packet::RmaIovEntry;
use crate::transport::{
    CmapStatus, CompletionKind, ConnHandle, ConnectionMap, MrAccess, Transport, TransportCompletion,
    TransportError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimAddress(pub u32);

#[derive(Debug, Clone)]
pub struct SimConnection {
    pub peer: SimAddress,
}

#[derive(Debug, Error)]
pub enum SimError {
    #[error("simulated transport out of posted buffers or send slots")]
    Again,
    #[error("no such destination registered with the simulated network")]
    NoSuchPeer,
}

impl TransportError for SimError {
    fn is_again(&self) -> bool {
        matches!(self, SimError::Again)
    }
}

#[derive(Debug, Clone)]
pub struct SimMr {
    pub access: MrAccess,
}

#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    pub inject_size: usize,
    pub requires_local_mr: bool,
    pub virtual_addressing: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            inject_size: 256,
            requires_local_mr: false,
            virtual_addressing: true,
        }
    }
}

/// A raw pointer the simulated network needs to hold across the `step()`
/// call boundary. Sound because the caller of `post_recv` guarantees the
/// pointee outlives the posted buffer, same contract as the real trait
/// method.
struct SendPtr(*mut u8);
unsafe impl Send for SendPtr {}

struct PostedBuf {
    ptr: SendPtr,
    len: usize,
    rx_index: u32,
}

struct WireEntry {
    source: SimAddress,
    dest: SimAddress,
    packet: Vec<u8>,
    op_id: Option<u64>,
}

#[derive(Default)]
struct Network {
    wire: VecDeque<WireEntry>,
    posted: HashMap<SimAddress, VecDeque<PostedBuf>>,
    completions: HashMap<SimAddress, Vec<TransportCompletion<SimAddress, SimError>>>,
}

/// One endpoint's view of the simulated network.
pub struct SimTransport {
    pub local: SimAddress,
    config: SimConfig,
    network: Arc<Mutex<Network>>,
}

impl SimTransport {
    /// Builds a fresh, disconnected endpoint bound to `local`.
    pub fn new(config: SimConfig) -> Self {
        Self::with_address(SimAddress(0), config)
    }

    pub fn with_address(local: SimAddress, config: SimConfig) -> Self {
        Self {
            local,
            config,
            network: Arc::new(Mutex::new(Network::default())),
        }
    }

    /// Builds a peer endpoint sharing this one's network, for two-sided
    /// scenario tests.
    pub fn peer(&self, addr: SimAddress) -> Self {
        Self {
            local: addr,
            config: self.config,
            network: self.network.clone(),
        }
    }

    pub fn connect(&self, addr: SimAddress) -> SimConnection {
        SimConnection { peer: addr }
    }

    /// Attempts to deliver one queued packet to a destination that
    /// currently has a posted buffer. Returns `true` if something was
    /// delivered. Scans the whole queue rather than only the front so a
    /// test can prepost receives in any order relative to sends.
    pub fn step(&self) -> bool {
        let mut net = self.network.lock().unwrap();
        let pos = net.wire.iter().position(|entry| {
            net.posted
                .get(&entry.dest)
                .map(|q| !q.is_empty())
                .unwrap_or(false)
        });
        let Some(pos) = pos else { return false };
        let entry = net.wire.remove(pos).unwrap();
        let posted = net.posted.get_mut(&entry.dest).unwrap();
        let buf = posted.pop_front().unwrap();
        let n = entry.packet.len().min(buf.len);
        unsafe {
            std::ptr::copy_nonoverlapping(entry.packet.as_ptr(), buf.ptr.0, n);
        }
        net.completions
            .entry(entry.dest)
            .or_default()
            .push(TransportCompletion {
                op_id: 0,
                kind: CompletionKind::Recv {
                    rx_index: buf.rx_index,
                    len: n,
                    src: entry.source,
                },
                result: Ok(()),
            });
        if let Some(op_id) = entry.op_id {
            net.completions
                .entry(entry.source)
                .or_default()
                .push(TransportCompletion {
                    op_id,
                    kind: CompletionKind::Send,
                    result: Ok(()),
                });
        }
        true
    }

    /// Drains and delivers everything deliverable right now.
    pub fn drain(&self) {
        while self.step() {}
    }
}

impl Transport for SimTransport {
    type Address = SimAddress;
    type Connection = SimConnection;
    type MemoryRegion = SimMr;
    type Error = SimError;

    fn inject_size(&self) -> usize {
        self.config.inject_size
    }

    fn requires_local_mr(&self) -> bool {
        self.config.requires_local_mr
    }

    fn uses_virtual_addressing(&self) -> bool {
        self.config.virtual_addressing
    }

    unsafe fn mr_reg(
        &self,
        _addr: *mut u8,
        _len: usize,
        access: MrAccess,
    ) -> Result<Self::MemoryRegion, Self::Error> {
        Ok(SimMr { access })
    }

    fn mr_key(&self, _mr: &Self::MemoryRegion) -> u64 {
        0
    }

    fn mr_close(&self, _mr: Self::MemoryRegion) -> Result<(), Self::Error> {
        Ok(())
    }

    fn send(
        &self,
        conn: &Self::Connection,
        op_id: u64,
        packet: &[u8],
        _desc: Option<&Self::MemoryRegion>,
    ) -> Result<(), Self::Error> {
        self.network.lock().unwrap().wire.push_back(WireEntry {
            source: self.local,
            dest: conn.peer,
            packet: packet.to_vec(),
            op_id: Some(op_id),
        });
        Ok(())
    }

    fn inject(&self, conn: &Self::Connection, packet: &[u8]) -> Result<(), Self::Error> {
        self.network.lock().unwrap().wire.push_back(WireEntry {
            source: self.local,
            dest: conn.peer,
            packet: packet.to_vec(),
            op_id: None,
        });
        Ok(())
    }

    unsafe fn rma_read(
        &self,
        _conn: &Self::Connection,
        op_id: u64,
        local: *mut u8,
        len: usize,
        remote: RmaIovEntry,
    ) -> Result<(), Self::Error> {
        std::ptr::copy_nonoverlapping(remote.addr as *const u8, local, len);
        self.network
            .lock()
            .unwrap()
            .completions
            .entry(self.local)
            .or_default()
            .push(TransportCompletion {
                op_id,
                kind: CompletionKind::RmaRead,
                result: Ok(()),
            });
        Ok(())
    }

    unsafe fn post_recv(
        &self,
        addr: *mut u8,
        len: usize,
        rx_index: u32,
        _desc: Option<&Self::MemoryRegion>,
    ) -> Result<(), Self::Error> {
        self.network
            .lock()
            .unwrap()
            .posted
            .entry(self.local)
            .or_default()
            .push_back(PostedBuf {
                ptr: SendPtr(addr),
                len,
                rx_index,
            });
        Ok(())
    }

    fn poll_completions(&self, max: usize) -> Vec<TransportCompletion<Self::Address, Self::Error>> {
        let mut net = self.network.lock().unwrap();
        let list = net.completions.entry(self.local).or_default();
        let n = list.len().min(max);
        list.drain(..n).collect()
    }
}

/// A connection map that resolves any address instantly, for tests that
/// don't exercise connection establishment.
pub struct StaticCmap;

impl ConnectionMap<SimTransport> for StaticCmap {
    fn get(&self, addr: &SimAddress) -> Result<ConnHandle<SimTransport>, CmapStatus<SimError>> {
        Ok(ConnHandle {
            connection: SimConnection { peer: *addr },
            remote_key: addr.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_and_post_recv_round_trip_via_step() {
        let a = SimTransport::with_address(SimAddress(1), SimConfig::default());
        let b = a.peer(SimAddress(2));
        let mut rx_buf = [0u8; 16];
        unsafe {
            b.post_recv(rx_buf.as_mut_ptr(), rx_buf.len(), 0, None)
                .unwrap();
        }
        let conn = a.connect(SimAddress(2));
        a.send(&conn, 7, b"hello", None).unwrap();
        // Either endpoint can drive delivery; the network is shared.
        assert!(a.step());
        assert!(!a.step());
        let completions = a.poll_completions(8);
        assert_eq!(completions.len(), 1);
        assert_eq!(&rx_buf[..5], b"hello");
    }
}
