//! Fixed-size slab buffer pool, optionally backed by a transport memory
//! registration.
//!
//! Mirrors `rxm_buf_pool_create`/`rxm_buf_pool_destroy`: a pool is a flat
//! `Vec` of chunks allocated once at open time, plus a freelist of indices.
//! Acquire/release only ever touch the freelist, so both are O(1) under a
//! single mutex.

use std::sync::Mutex;

use tracing::debug;

use crate::transport::{MrAccess, Transport};

const ALIGNMENT: usize = 16;

struct Chunk<T: Transport> {
    data: Box<[u8]>,
    mr: Option<T::MemoryRegion>,
}

/// A checked-out buffer. Holds the pool's lock-free title to one chunk;
/// dropping it without calling [`Pool::release`] leaks the slot (the pool
/// has no `Drop` impl that reclaims automatically, matching the source's
/// explicit acquire/release pairing).
pub struct Buf<T: Transport> {
    pub index: u32,
    ptr: *mut u8,
    len: usize,
    mr: Option<T::MemoryRegion>,
}

impl<T: Transport> Buf<T> {
    /// # Safety
    /// Valid as long as the owning [`Pool`] outlives this handle and no
    /// other `Buf` aliases the same index concurrently (the pool only ever
    /// hands out one `Buf` per index between acquire and release).
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn mr(&self) -> Option<&T::MemoryRegion> {
        self.mr.as_ref()
    }
}

struct Inner<T: Transport> {
    chunks: Vec<Chunk<T>>,
    freelist: Vec<u32>,
}

/// A slab of `capacity` buffers of `chunk_len` bytes each.
///
/// When `access` is `Some`, every chunk is registered with the transport on
/// construction and unregistered on drop, mirroring the provider's
/// `mr_reg`/`mr_close` chunk lifecycle hooks. Registration failure for any
/// chunk tears down the chunks registered so far and aborts construction.
pub struct Pool<T: Transport> {
    chunk_len: usize,
    inner: Mutex<Inner<T>>,
}

impl<T: Transport> Pool<T> {
    pub fn new(
        transport: &T,
        capacity: usize,
        chunk_len: usize,
        access: Option<MrAccess>,
    ) -> Result<Self, T::Error> {
        let padded_len = (chunk_len + ALIGNMENT - 1) / ALIGNMENT * ALIGNMENT;
        let mut chunks = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            let mut data = vec![0u8; padded_len].into_boxed_slice();
            let mr = if let Some(access) = access {
                let addr = data.as_mut_ptr();
                match unsafe { transport.mr_reg(addr, padded_len, access) } {
                    Ok(mr) => Some(mr),
                    Err(e) => {
                        for chunk in chunks.drain(..) {
                            if let Some(mr) = chunk.mr {
                                let _ = transport.mr_close(mr);
                            }
                        }
                        return Err(e);
                    }
                }
            } else {
                None
            };
            chunks.push(Chunk { data, mr });
        }
        let freelist = (0..capacity as u32).collect();
        Ok(Self {
            chunk_len: padded_len,
            inner: Mutex::new(Inner { chunks, freelist }),
        })
    }

    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    /// Returns `None` on exhaustion; callers translate this to
    /// [`crate::Error::Again`].
    pub fn acquire(&self) -> Option<Buf<T>> {
        let mut inner = self.inner.lock().unwrap();
        let index = inner.freelist.pop()?;
        let chunk = &mut inner.chunks[index as usize];
        Some(Buf {
            index,
            ptr: chunk.data.as_mut_ptr(),
            len: chunk.data.len(),
            mr: chunk.mr.clone(),
        })
    }

    pub fn release(&self, buf: Buf<T>) {
        let mut inner = self.inner.lock().unwrap();
        debug!(index = buf.index, "releasing pool buffer");
        inner.freelist.push(buf.index);
    }

    /// Free-slot count, for resource-conservation assertions in tests.
    pub fn available(&self) -> usize {
        self.inner.lock().unwrap().freelist.len()
    }

    pub fn close(&self, transport: &T) -> Result<(), T::Error> {
        let mut inner = self.inner.lock().unwrap();
        let mut last_err = None;
        for chunk in inner.chunks.drain(..) {
            if let Some(mr) = chunk.mr {
                if let Err(e) = transport.mr_close(mr) {
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sim::SimTransport;

    #[test]
    fn acquire_release_conserves_capacity() {
        let t = SimTransport::new(Default::default());
        let pool = Pool::new(&t, 4, 128, None).unwrap();
        assert_eq!(pool.available(), 4);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.available(), 2);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn exhaustion_returns_none() {
        let t = SimTransport::new(Default::default());
        let pool = Pool::new(&t, 1, 64, None).unwrap();
        let _a = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn registered_pool_registers_each_chunk() {
        let t = SimTransport::new(Default::default());
        let pool = Pool::new(&t, 2, 64, Some(MrAccess::SEND_RECV)).unwrap();
        let buf = pool.acquire().unwrap();
        assert!(buf.mr().is_some());
        pool.release(buf);
    }
}
