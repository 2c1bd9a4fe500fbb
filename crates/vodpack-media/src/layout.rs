//! Two-pass binary construction: measure first, then write exactly that much.
//!
//! Every box or element tree implements [`Layout`]. A parent's size is the
//! sum of its children's sizes, so the whole output is allocated once from a
//! [`Measured`] value and then filled through an [`Emitter`]. An `Emitter`
//! can only be created here, which means writing always goes through
//! `Measured::emit*` and gets the written-length check.

use std::ops::{Deref, DerefMut};

use bytes::{BufMut, BytesMut};
use tracing::error;

use crate::error::{Error, Result};
use crate::write::reserve_bytes;

/// Write target handed to [`Layout::write`].
pub struct Emitter<'a> {
    buf: &'a mut BytesMut,
}

impl Emitter<'_> {
    /// Write a plain box header.
    pub fn put_atom_header(&mut self, size: usize, kind: &[u8; 4]) {
        self.buf.put_u32(size as u32);
        self.buf.put_slice(kind);
    }

    /// Write a full box header (size, type, version, 24-bit flags).
    pub fn put_full_atom_header(&mut self, size: usize, kind: &[u8; 4], version: u8, flags: u32) {
        self.put_atom_header(size, kind);
        self.buf.put_u32((u32::from(version) << 24) | (flags & 0x00ff_ffff));
    }

    /// Write a 24-bit big-endian value.
    pub fn put_u24(&mut self, value: u32) {
        self.buf.put_slice(&value.to_be_bytes()[1..]);
    }

    /// Write `count` zero bytes.
    pub fn put_zeros(&mut self, count: usize) {
        self.buf.put_bytes(0, count);
    }
}

impl Deref for Emitter<'_> {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf
    }
}

impl DerefMut for Emitter<'_> {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf
    }
}

/// A binary structure whose exact size is known before it is written.
pub trait Layout {
    /// Number of bytes [`Layout::write`] emits.
    fn size(&self) -> usize;

    /// Emit the structure.
    fn write(&self, out: &mut Emitter<'_>);
}

impl<L: Layout + ?Sized> Layout for &L {
    fn size(&self) -> usize {
        (**self).size()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        (**self).write(out)
    }
}

/// A layout together with its measured size.
#[derive(Debug, Clone)]
pub struct Measured<L> {
    layout: L,
    size: usize,
}

impl<L: Layout> Measured<L> {
    /// Measure `layout`.
    pub fn new(layout: L) -> Self {
        let size = layout.size();
        Self { layout, size }
    }

    /// Measured size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn layout(&self) -> &L {
        &self.layout
    }

    pub fn into_layout(self) -> L {
        self.layout
    }

    /// Write into a freshly allocated buffer of exactly the measured size.
    pub fn emit(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        self.emit_into(&mut buf)?;
        Ok(buf)
    }

    /// Append to `buf`, failing if the written length differs from the
    /// measured size.
    pub fn emit_into(&self, buf: &mut BytesMut) -> Result<()> {
        reserve_bytes(buf, self.size)?;

        let start = buf.len();
        self.layout.write(&mut Emitter { buf: &mut *buf });
        let written = buf.len() - start;

        if written != self.size {
            error!(written, measured = self.size, "layout size mismatch");
            return Err(Error::unexpected(format!(
                "result length {written} different than allocated length {}",
                self.size
            )));
        }
        Ok(())
    }
}

/// Layouts concatenated in order.
impl<L: Layout> Layout for [L] {
    fn size(&self) -> usize {
        self.iter().map(Layout::size).sum()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        for item in self {
            item.write(out);
        }
    }
}

impl<L: Layout> Layout for Vec<L> {
    fn size(&self) -> usize {
        self.as_slice().size()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        self.as_slice().write(out)
    }
}

impl<L: Layout> Layout for Option<L> {
    fn size(&self) -> usize {
        self.as_ref().map_or(0, Layout::size)
    }

    fn write(&self, out: &mut Emitter<'_>) {
        if let Some(inner) = self {
            inner.write(out);
        }
    }
}

macro_rules! tuple_layout {
    ($($name:ident),+) => {
        /// Layouts of different types concatenated in order.
        impl<$($name: Layout),+> Layout for ($($name,)+) {
            #[allow(non_snake_case)]
            fn size(&self) -> usize {
                let ($($name,)+) = self;
                0 $(+ $name.size())+
            }

            #[allow(non_snake_case)]
            fn write(&self, out: &mut Emitter<'_>) {
                let ($($name,)+) = self;
                $($name.write(out);)+
            }
        }
    };
}

tuple_layout!(A, B);
tuple_layout!(A, B, C);
tuple_layout!(A, B, C, D);
