//! Streams the frames of one sequence into a segment writer.

use bytes::BytesMut;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::media::{FrameCursor, Sequence};
use crate::read_cache::ReadCache;
use crate::source::{open_source, FrameSource, Progress, SegmentProcessor, SourceRead};
use crate::write::SegmentWriter;

/// Resumable copy of every frame of a sequence, in order, to a writer.
///
/// Each `process` call runs until the cache misses or the sequence ends.
/// With buffer reuse disabled the chunks of a part are collected and
/// written together, either when the part ends or before suspending.
pub struct FrameWriter<'s, W> {
    sequence: &'s Sequence,
    cursor: FrameCursor,
    source: Option<Box<dyn FrameSource>>,
    slot_id: usize,
    writer: W,
    reuse_buffers: bool,
    decrypt: bool,
    pending: BytesMut,
    frame_started: bool,
    first_time: bool,
    done: bool,
}

impl<'s, W: SegmentWriter> FrameWriter<'s, W> {
    pub fn new(sequence: &'s Sequence, writer: W, reuse_buffers: bool) -> Self {
        let slot_id = sequence.media_type().map_or(0, |t| t.index());
        debug!(
            sequence = sequence.index,
            frames = sequence.total_frame_count(),
            reuse_buffers,
            "frame writer initialized"
        );
        Self {
            sequence,
            cursor: FrameCursor::default(),
            source: None,
            slot_id,
            writer,
            reuse_buffers,
            decrypt: true,
            pending: BytesMut::new(),
            frame_started: false,
            first_time: true,
            done: false,
        }
    }

    /// Read protected parts as stored instead of decrypting them.
    pub fn keep_source_encryption(mut self) -> Self {
        self.decrypt = false;
        self
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_writer(self) -> W {
        self.writer
    }

    fn flush_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let chunk = self.pending.split();
        self.writer.write_tail(&chunk)
    }

    /// Move to the next frame and start it; false once the sequence ends.
    fn start_next_frame(&mut self) -> Result<bool> {
        let Some(found) = self.cursor.advance(self.sequence) else {
            return Ok(false);
        };

        if found.part_start || self.source.is_none() {
            self.flush_pending()?;
            self.source = Some(open_source(found.part, self.slot_id, self.decrypt)?);
            self.first_time = true;
        }

        self.source
            .as_mut()
            .ok_or_else(|| Error::unexpected("no frame source"))?
            .start_frame(found.frame, None)?;
        self.frame_started = true;
        Ok(true)
    }

    fn finish(&mut self) -> Result<Progress> {
        self.flush_pending()?;
        self.writer.flush()?;
        self.done = true;
        Ok(Progress::Done)
    }
}

impl<W: SegmentWriter> SegmentProcessor for FrameWriter<'_, W> {
    fn process(&mut self, cache: &mut ReadCache) -> Result<Progress> {
        if self.done {
            return Ok(Progress::Done);
        }

        if !self.frame_started && !self.start_next_frame()? {
            return self.finish();
        }

        let mut processed_data = false;
        loop {
            let source = self
                .source
                .as_mut()
                .ok_or_else(|| Error::unexpected("no frame source"))?;

            let frame_done = match source.read(cache)? {
                SourceRead::Pending => {
                    if !self.pending.is_empty() {
                        let chunk = self.pending.split();
                        self.writer.write_tail(&chunk)?;
                    } else if !processed_data && !self.first_time {
                        error!(sequence = self.sequence.index, "no data was handled, probably a truncated file");
                        return Err(Error::bad_data("no data was handled, probably a truncated file"));
                    }
                    self.first_time = false;
                    return Ok(Progress::Pending);
                }
                SourceRead::Data { data, frame_done } => {
                    if self.reuse_buffers {
                        self.writer.write_tail(data)?;
                    } else {
                        self.pending.extend_from_slice(data);
                    }
                    frame_done
                }
            };
            processed_data = true;

            if !frame_done {
                continue;
            }

            self.frame_started = false;
            if !self.start_next_frame()? {
                return self.finish();
            }
        }
    }
}
