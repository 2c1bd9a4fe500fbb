//! Frame sources: per-part suppliers of compressed frame bytes.

use bytes::Bytes;
use vodpack_common::SourceId;

use crate::crypto::CencDecryptSource;
use crate::error::{Error, Result};
use crate::media::{Frame, FramePart, SourceRef};
use crate::read_cache::{CacheRequest, Lookup, ReadCache, ReadHint, SourceReader};

/// Outcome of [`FrameSource::read`].
#[derive(Debug)]
pub enum SourceRead<'a> {
    /// The bytes are not resident yet; fill the cache and call again.
    Pending,
    /// The next chunk of the current frame.
    Data { data: &'a [u8], frame_done: bool },
}

/// Completion state of a resumable writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Progress {
    /// Waiting on a read; fill the cache and call `process` again.
    Pending,
    /// Everything was written and flushed.
    Done,
}

/// A resumable producer of segment bytes.
///
/// `process` writes as much as the cache allows; on [`Progress::Pending`]
/// the caller fills the cache and calls again.
pub trait SegmentProcessor {
    fn process(&mut self, cache: &mut ReadCache) -> Result<Progress>;
}

/// Drive `processor` to completion, serving reads from `reader`.
pub fn run_to_completion(
    processor: &mut dyn SegmentProcessor,
    cache: &mut ReadCache,
    reader: &mut dyn SourceReader,
) -> Result<()> {
    loop {
        match processor.process(cache)? {
            Progress::Done => return Ok(()),
            Progress::Pending => cache.fill(reader)?,
        }
    }
}

/// Supplies the bytes of one frame part, frame by frame.
pub trait FrameSource {
    /// Position the source on `frame`. `hint` is another stream's pending
    /// offset on the same source, if any.
    fn start_frame(&mut self, frame: &Frame, hint: Option<ReadHint>) -> Result<()>;

    /// Next chunk of the current frame.
    fn read<'a>(&'a mut self, cache: &'a mut ReadCache) -> Result<SourceRead<'a>>;

    /// Source the bytes are read from, for read-ahead hints.
    fn source_id(&self) -> Option<SourceId> {
        None
    }

    /// Offset of the next byte to be read.
    fn pending_offset(&self) -> Option<u64> {
        None
    }
}

/// Frames of a file, read through the cache.
#[derive(Debug)]
pub struct FileSource {
    source: SourceId,
    slot_id: usize,
    source_end: u64,
    cur: u64,
    frame_end: u64,
    hint: Option<ReadHint>,
}

impl FileSource {
    pub fn new(source: SourceId, slot_id: usize, source_end: u64) -> Self {
        Self {
            source,
            slot_id,
            source_end,
            cur: 0,
            frame_end: 0,
            hint: None,
        }
    }
}

impl FrameSource for FileSource {
    fn start_frame(&mut self, frame: &Frame, hint: Option<ReadHint>) -> Result<()> {
        self.cur = frame.offset;
        self.frame_end = frame.offset + u64::from(frame.size);
        if self.frame_end > self.source_end {
            return Err(Error::bad_data(format!(
                "frame end {} past the source end {}",
                self.frame_end, self.source_end
            )));
        }
        self.hint = hint;
        Ok(())
    }

    fn read<'a>(&'a mut self, cache: &'a mut ReadCache) -> Result<SourceRead<'a>> {
        if self.cur >= self.frame_end {
            return Ok(SourceRead::Data {
                data: &[],
                frame_done: true,
            });
        }

        let request = CacheRequest {
            slot_id: self.slot_id,
            source: self.source,
            offset: self.cur,
            frame_end: self.frame_end,
            source_end: self.source_end,
            hint: self.hint,
        };
        match cache.get_from_cache(&request)? {
            Lookup::Hit(data) => {
                let len = data.len().min((self.frame_end - self.cur) as usize);
                self.cur += len as u64;
                Ok(SourceRead::Data {
                    data: &data[..len],
                    frame_done: self.cur >= self.frame_end,
                })
            }
            Lookup::Miss => Ok(SourceRead::Pending),
        }
    }

    fn source_id(&self) -> Option<SourceId> {
        Some(self.source)
    }

    fn pending_offset(&self) -> Option<u64> {
        Some(self.cur)
    }
}

/// Frames of an in-memory buffer, e.g. generated audio.
#[derive(Debug)]
pub struct MemorySource {
    data: Bytes,
    range: Option<(usize, usize)>,
}

impl MemorySource {
    pub fn new(data: Bytes) -> Self {
        Self { data, range: None }
    }
}

impl FrameSource for MemorySource {
    fn start_frame(&mut self, frame: &Frame, _hint: Option<ReadHint>) -> Result<()> {
        let start = usize::try_from(frame.offset).map_err(|_| Error::bad_data("frame offset overflow"))?;
        let end = start + frame.size as usize;
        if end > self.data.len() {
            return Err(Error::bad_data(format!(
                "frame [{start}, {end}) outside buffer of {} bytes",
                self.data.len()
            )));
        }
        self.range = Some((start, end));
        Ok(())
    }

    fn read<'a>(&'a mut self, _cache: &'a mut ReadCache) -> Result<SourceRead<'a>> {
        let (start, end) = self
            .range
            .take()
            .ok_or_else(|| Error::unexpected("read without a started frame"))?;
        Ok(SourceRead::Data {
            data: &self.data[start..end],
            frame_done: true,
        })
    }
}

/// Open the source of `part`.
///
/// Protected parts are wrapped in a CENC decryptor unless `decrypt` is
/// false, which is how passthrough keeps the original ciphertext.
pub fn open_source(part: &FramePart, slot_id: usize, decrypt: bool) -> Result<Box<dyn FrameSource>> {
    let plain: Box<dyn FrameSource> = match &part.source {
        SourceRef::File(id) => Box::new(FileSource::new(*id, slot_id, part.end_offset())),
        SourceRef::Memory(data) => Box::new(MemorySource::new(data.clone())),
    };

    match &part.protection {
        Some(protection) if decrypt => Ok(Box::new(CencDecryptSource::new(plain, protection)?)),
        _ => Ok(plain),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::tests::frame;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    #[test]
    fn test_file_source_reads_across_slots() {
        let data: Vec<u8> = (0..200u8).collect();
        let mut reader = HashMap::from([(SourceId::new(0), data)]);
        let mut cache = ReadCache::new(64, 1).unwrap();
        let mut source = FileSource::new(SourceId::new(0), 0, 200);

        source.start_frame(&frame(50, 100, 1), None).unwrap();
        let mut collected = Vec::new();
        loop {
            match source.read(&mut cache).unwrap() {
                SourceRead::Pending => cache.fill(&mut reader).unwrap(),
                SourceRead::Data { data, frame_done } => {
                    collected.extend_from_slice(data);
                    if frame_done {
                        break;
                    }
                }
            }
        }
        assert_eq!(collected, (50..150u8).collect::<Vec<_>>());
        assert_eq!(cache.reads_issued(), 2);
    }

    #[test]
    fn test_empty_frame_is_done_immediately() {
        let mut cache = ReadCache::new(64, 1).unwrap();
        let mut source = FileSource::new(SourceId::new(0), 0, 10);
        source.start_frame(&frame(4, 0, 1), None).unwrap();
        assert_matches!(
            source.read(&mut cache).unwrap(),
            SourceRead::Data { data: [], frame_done: true }
        );
    }

    #[test]
    fn test_frame_past_source_end() {
        let mut source = FileSource::new(SourceId::new(0), 0, 10);
        assert!(source.start_frame(&frame(8, 4, 1), None).is_err());
    }

    #[test]
    fn test_memory_source() {
        let mut cache = ReadCache::new(64, 1).unwrap();
        let mut source = MemorySource::new(Bytes::from_static(b"abcdefgh"));
        source.start_frame(&frame(2, 3, 1), None).unwrap();
        assert_matches!(
            source.read(&mut cache).unwrap(),
            SourceRead::Data { data: b"cde", frame_done: true }
        );
        assert!(source.start_frame(&frame(6, 3, 1), None).is_err());
    }
}
