//! Segment sinks and output buffers.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Default block size of a [`WriteBuffer`]
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Reserve room for `additional` more bytes in `buf`.
///
/// Lengths past `isize::MAX` can never be allocated and are reported as
/// [`Error::AllocFailed`] instead of panicking inside `reserve`.
pub(crate) fn reserve_bytes(buf: &mut BytesMut, additional: usize) -> Result<()> {
    match buf.len().checked_add(additional) {
        Some(total) if total <= isize::MAX as usize => {
            buf.reserve(additional);
            Ok(())
        }
        _ => Err(Error::alloc_failed(format!(
            "cannot grow a {} byte buffer by {additional} bytes",
            buf.len()
        ))),
    }
}

/// Append-only destination of one output segment.
///
/// `write_head` exists for writers that only learn a header after the body
/// has been produced (CENC auxiliary info); it prepends to everything
/// written so far.
pub trait SegmentWriter {
    fn write_tail(&mut self, data: &[u8]) -> Result<()>;

    fn write_head(&mut self, _data: &[u8]) -> Result<()> {
        Err(Error::unexpected("segment writer does not support head writes"))
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<T: SegmentWriter + ?Sized> SegmentWriter for &mut T {
    fn write_tail(&mut self, data: &[u8]) -> Result<()> {
        (**self).write_tail(data)
    }

    fn write_head(&mut self, data: &[u8]) -> Result<()> {
        (**self).write_head(data)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

impl<T: SegmentWriter + ?Sized> SegmentWriter for Box<T> {
    fn write_tail(&mut self, data: &[u8]) -> Result<()> {
        (**self).write_tail(data)
    }

    fn write_head(&mut self, data: &[u8]) -> Result<()> {
        (**self).write_head(data)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

impl SegmentWriter for Vec<u8> {
    fn write_tail(&mut self, data: &[u8]) -> Result<()> {
        self.try_reserve(data.len())
            .map_err(|_| Error::alloc_failed(format!("failed to grow segment by {} bytes", data.len())))?;
        self.extend_from_slice(data);
        Ok(())
    }

    fn write_head(&mut self, data: &[u8]) -> Result<()> {
        self.splice(0..0, data.iter().copied());
        Ok(())
    }
}

/// Sink that only counts bytes, for size-only requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SizeCounter {
    total: u64,
}

impl SizeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

impl SegmentWriter for SizeCounter {
    fn write_tail(&mut self, data: &[u8]) -> Result<()> {
        self.total += data.len() as u64;
        Ok(())
    }

    fn write_head(&mut self, data: &[u8]) -> Result<()> {
        self.total += data.len() as u64;
        Ok(())
    }
}

/// Tail-only adapter over any [`io::Write`].
#[derive(Debug)]
pub struct IoSegmentWriter<W> {
    inner: W,
    written: u64,
}

impl<W: io::Write> IoSegmentWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: io::Write> SegmentWriter for IoSegmentWriter<W> {
    fn write_tail(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

/// Aggregates small writes into blocks before handing them to the inner
/// writer.
///
/// [`WriteBuffer::get_bytes`] hands out space inside the current block so
/// encryptors can produce ciphertext in place.
#[derive(Debug)]
pub struct WriteBuffer<W> {
    inner: W,
    block: BytesMut,
    block_size: usize,
}

impl<W: SegmentWriter> WriteBuffer<W> {
    pub fn new(inner: W) -> Self {
        Self::with_block_size(inner, DEFAULT_WRITE_BUFFER_SIZE)
    }

    pub fn with_block_size(inner: W, block_size: usize) -> Self {
        Self {
            inner,
            block: BytesMut::new(),
            block_size: block_size.max(1),
        }
    }

    /// Copy `data` into the buffer, flushing full blocks.
    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            if self.block.len() >= self.block_size {
                self.flush_block()?;
            }
            let chunk = data.len().min(self.block_size - self.block.len());
            self.block.put_slice(&data[..chunk]);
            data = &data[chunk..];
        }
        Ok(())
    }

    /// Reserve `len` contiguous bytes at the end of the buffer and return
    /// them for the caller to fill.
    pub fn get_bytes(&mut self, len: usize) -> Result<&mut [u8]> {
        if !self.block.is_empty() && self.block.len() + len > self.block_size {
            self.flush_block()?;
        }
        reserve_bytes(&mut self.block, len)?;
        let start = self.block.len();
        self.block.resize(start + len, 0);
        Ok(&mut self.block[start..])
    }

    /// Hand any buffered bytes to the inner writer.
    pub fn flush_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let block = self.block.split();
        self.inner.write_tail(&block)
    }

    /// Buffered bytes not yet handed to the inner writer.
    pub fn pending(&self) -> usize {
        self.block.len()
    }

    pub fn inner(&self) -> &W {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Flush and return the inner writer.
    pub fn into_inner(mut self) -> Result<W> {
        self.flush_block()?;
        Ok(self.inner)
    }
}

impl<W: SegmentWriter> SegmentWriter for WriteBuffer<W> {
    fn write_tail(&mut self, data: &[u8]) -> Result<()> {
        self.write(data)
    }

    fn write_head(&mut self, data: &[u8]) -> Result<()> {
        self.flush_block()?;
        self.inner.write_head(data)
    }

    fn flush(&mut self) -> Result<()> {
        self.flush_block()?;
        self.inner.flush()
    }
}

/// Growable buffer for data whose final size is only known after the
/// frames were processed (CENC auxiliary info).
///
/// Grows by doubling; the final length feeds the `senc`/`saiz` sizes.
#[derive(Debug, Default, Clone)]
pub struct DynamicBuffer {
    buf: BytesMut,
}

impl DynamicBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Make room for `additional` bytes.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        if additional <= self.buf.capacity() - self.buf.len() {
            return Ok(());
        }
        let needed = self
            .buf
            .len()
            .checked_add(additional)
            .ok_or_else(|| Error::alloc_failed(format!("cannot grow dynamic buffer by {additional} bytes")))?;
        let target = needed.max(self.buf.capacity().saturating_mul(2));
        let len = self.buf.len();
        reserve_bytes(&mut self.buf, target - len)
    }

    pub fn put_slice(&mut self, data: &[u8]) -> Result<()> {
        self.reserve(data.len())?;
        self.buf.put_slice(data);
        Ok(())
    }

    pub fn put_u16(&mut self, value: u16) -> Result<()> {
        self.put_slice(&value.to_be_bytes())
    }

    pub fn put_u32(&mut self, value: u32) -> Result<()> {
        self.put_slice(&value.to_be_bytes())
    }

    /// Overwrite a big-endian u16 written earlier at `pos`.
    pub fn set_u16(&mut self, pos: usize, value: u16) {
        self.buf[pos..pos + 2].copy_from_slice(&value.to_be_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}
