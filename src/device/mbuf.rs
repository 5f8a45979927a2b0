//! Managed buffers and bounds-checked views over them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::DeviceError;

/// Capacity accounting shared by every mbuf of one device.
#[derive(Debug)]
pub struct MbufPool {
    capacity: usize,
    in_use: AtomicUsize,
    live: AtomicUsize,
}

impl MbufPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            in_use: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
        })
    }

    /// Allocate a zeroed mbuf of `len` bytes.
    pub fn alloc(self: &Arc<Self>, len: usize) -> Result<Mbuf, DeviceError> {
        self.reserve(len)?;
        Ok(Mbuf {
            data: vec![0u8; len],
            reserved: len,
            pool: Arc::clone(self),
        })
    }

    /// Allocate an mbuf holding a copy of `bytes`.
    pub fn alloc_from(self: &Arc<Self>, bytes: &[u8]) -> Result<Mbuf, DeviceError> {
        self.reserve(bytes.len())?;
        Ok(Mbuf {
            data: bytes.to_vec(),
            reserved: bytes.len(),
            pool: Arc::clone(self),
        })
    }

    fn reserve(&self, len: usize) -> Result<(), DeviceError> {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(len).filter(|&total| total <= self.capacity)
            })
            .map_err(|used| DeviceError::OutOfMemory {
                requested: len,
                in_use: used,
                capacity: self.capacity,
            })?;
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Mbufs allocated and not yet dropped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

/// A device-managed buffer. Moved between queues, never aliased; its
/// reservation returns to the pool exactly once, on drop.
pub struct Mbuf {
    data: Vec<u8>,
    reserved: usize,
    pool: Arc<MbufPool>,
}

impl Mbuf {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Shrink the visible length; the reservation is kept until drop.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Copy into a fresh mbuf from the same pool.
    pub fn try_clone(&self) -> Result<Mbuf, DeviceError> {
        self.pool.alloc_from(&self.data)
    }

    /// View with the first `header_len` bytes split off as a header.
    pub fn view(&self, header_len: usize) -> Result<BufferView<'_>, DeviceError> {
        BufferView::new(&self.data, header_len)
    }

    pub fn view_mut(&mut self, header_len: usize) -> Result<BufferViewMut<'_>, DeviceError> {
        BufferViewMut::new(&mut self.data, header_len)
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

impl Drop for Mbuf {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(self.reserved, Ordering::AcqRel);
        self.pool.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for Mbuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mbuf").field("len", &self.data.len()).finish()
    }
}

/// `{base, header_len}` over a buffer; header and data are disjoint.
#[derive(Debug, Clone, Copy)]
pub struct BufferView<'a> {
    base: &'a [u8],
    header_len: usize,
}

impl<'a> BufferView<'a> {
    pub fn new(base: &'a [u8], header_len: usize) -> Result<Self, DeviceError> {
        if header_len > base.len() {
            return Err(DeviceError::InvalidArgument(format!(
                "header of {} bytes in a {} byte buffer",
                header_len,
                base.len()
            )));
        }
        Ok(Self { base, header_len })
    }

    pub fn header(&self) -> &'a [u8] {
        &self.base[..self.header_len]
    }

    pub fn data(&self) -> &'a [u8] {
        &self.base[self.header_len..]
    }

    pub fn len(&self) -> usize {
        self.base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }

    /// `len` data bytes starting at `offset`, if in bounds.
    pub fn data_range(&self, offset: usize, len: usize) -> Option<&'a [u8]> {
        self.data().get(offset..offset.checked_add(len)?)
    }
}

#[derive(Debug)]
pub struct BufferViewMut<'a> {
    base: &'a mut [u8],
    header_len: usize,
}

impl<'a> BufferViewMut<'a> {
    pub fn new(base: &'a mut [u8], header_len: usize) -> Result<Self, DeviceError> {
        if header_len > base.len() {
            return Err(DeviceError::InvalidArgument(format!(
                "header of {} bytes in a {} byte buffer",
                header_len,
                base.len()
            )));
        }
        Ok(Self { base, header_len })
    }

    pub fn header_mut(&mut self) -> &mut [u8] {
        &mut self.base[..self.header_len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.base[self.header_len..]
    }

    /// Copy `bytes` into the data region at `offset`.
    pub fn write_data(&mut self, offset: usize, bytes: &[u8]) -> Result<(), DeviceError> {
        let data = self.data_mut();
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                DeviceError::InvalidArgument(format!(
                    "write of {} bytes at {} overruns {} byte data region",
                    bytes.len(),
                    offset,
                    data.len()
                ))
            })?;
        data[offset..end].copy_from_slice(bytes);
        Ok(())
    }
}
