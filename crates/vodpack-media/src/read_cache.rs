//! Fixed pool of read buffers shared by every frame source of a request.
//!
//! A lookup either hits a slot already holding the requested offset or
//! plans a read into a target slot. The caller performs the planned read
//! (see [`ReadCache::fill`]) and then retries the lookup. Slices returned on
//! a hit borrow the cache, so they have to be consumed before the next
//! cache operation can recycle the slot.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};
use vodpack_common::SourceId;

use crate::error::{Error, Result};

/// Minimum number of buffer slots
pub const MIN_SLOT_COUNT: usize = 2;

/// Default size of one slot
pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;

/// Physical reads of source bytes.
pub trait SourceReader {
    /// Read up to `buf.len()` bytes at `offset`; fewer only at end of source.
    fn read_at(&mut self, source: SourceId, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

/// [`SourceReader`] over files on disk, opened on first use.
#[derive(Debug, Default)]
pub struct FileReader {
    paths: HashMap<SourceId, PathBuf>,
    open: HashMap<SourceId, File>,
}

impl FileReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the file backing `source`.
    pub fn add_source(&mut self, source: SourceId, path: impl AsRef<Path>) {
        self.paths.insert(source, path.as_ref().to_path_buf());
        self.open.remove(&source);
    }

    fn file(&mut self, source: SourceId) -> Result<&mut File> {
        if !self.open.contains_key(&source) {
            let path = self
                .paths
                .get(&source)
                .ok_or_else(|| Error::bad_request(format!("unknown {source}")))?;
            let file = File::open(path)?;
            debug!(%source, path = %path.display(), "opened source");
            self.open.insert(source, file);
        }
        self.open
            .get_mut(&source)
            .ok_or_else(|| Error::unexpected(format!("{source} not open")))
    }
}

impl SourceReader for FileReader {
    fn read_at(&mut self, source: SourceId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let file = self.file(source)?;
        file.seek(SeekFrom::Start(offset))?;

        let mut total = 0;
        while total < buf.len() {
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }
}

/// In-memory sources, for generated content and tests.
impl SourceReader for HashMap<SourceId, Vec<u8>> {
    fn read_at(&mut self, source: SourceId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self
            .get(&source)
            .ok_or_else(|| Error::bad_request(format!("unknown {source}")))?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }
}

/// Another stream's pending read on the same source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadHint {
    pub min_offset: u64,
    pub slot_id: usize,
}

/// A lookup issued by a frame source.
#[derive(Debug, Clone, Copy)]
pub struct CacheRequest {
    pub slot_id: usize,
    pub source: SourceId,
    /// Offset that has to be served.
    pub offset: u64,
    /// End of the frame being read.
    pub frame_end: u64,
    /// Last offset the source will ever need; reads never go past it.
    pub source_end: u64,
    pub hint: Option<ReadHint>,
}

/// Result of a cache lookup.
#[derive(Debug)]
pub enum Lookup<'a> {
    /// Bytes starting at the requested offset, up to the end of the slot.
    Hit(&'a [u8]),
    /// A read was planned; perform it and look up again.
    Miss,
}

/// A physical read the caller has to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub source: SourceId,
    pub offset: u64,
    pub len: usize,
}

#[derive(Debug, Default)]
struct Slot {
    source: Option<SourceId>,
    start: u64,
    end: u64,
    buf: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct PlannedRead {
    slot: usize,
    request: ReadRequest,
    /// Bytes needed to reach the requested offset.
    required: usize,
}

/// Shared read buffers of one request.
#[derive(Debug)]
pub struct ReadCache {
    slots: Vec<Slot>,
    buffer_size: usize,
    alignment: u64,
    reuse_buffers: bool,
    planned: Option<PlannedRead>,
    reads_issued: u64,
}

impl ReadCache {
    /// Create a cache of `MIN_SLOT_COUNT` slots of `buffer_size` bytes.
    ///
    /// `alignment` must be a power of two; reads start at aligned offsets.
    pub fn new(buffer_size: usize, alignment: usize) -> Result<Self> {
        if !alignment.is_power_of_two() {
            return Err(Error::bad_request(format!("alignment {alignment} is not a power of two")));
        }
        if buffer_size < alignment {
            return Err(Error::bad_request(format!(
                "buffer size {buffer_size} smaller than alignment {alignment}"
            )));
        }

        let mut cache = Self {
            slots: Vec::new(),
            buffer_size,
            alignment: alignment as u64,
            reuse_buffers: true,
            planned: None,
            reads_issued: 0,
        };
        cache.allocate_slots(MIN_SLOT_COUNT);
        Ok(cache)
    }

    /// Grow the pool to at least `count` slots. Never shrinks.
    pub fn allocate_slots(&mut self, count: usize) {
        let count = count.max(MIN_SLOT_COUNT);
        if self.slots.len() < count {
            self.slots.resize_with(count, Slot::default);
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Read every miss into a freshly allocated buffer instead of recycling
    /// the slot's allocation.
    pub fn disable_buffer_reuse(&mut self) {
        self.reuse_buffers = false;
    }

    /// Number of physical reads completed so far.
    pub fn reads_issued(&self) -> u64 {
        self.reads_issued
    }

    /// Whether a planned read is waiting to be performed.
    pub fn has_pending_read(&self) -> bool {
        self.planned.is_some()
    }

    fn align_down(&self, offset: u64) -> u64 {
        offset & !(self.alignment - 1)
    }

    /// Serve `request` from a resident slot, or plan a read for it.
    pub fn get_from_cache(&mut self, request: &CacheRequest) -> Result<Lookup<'_>> {
        let found = self.slots.iter().position(|slot| {
            slot.source == Some(request.source) && request.offset >= slot.start && request.offset < slot.end
        });

        if let Some(index) = found {
            let slot = &self.slots[index];
            let pos = (request.offset - slot.start) as usize;
            let len = (slot.end - slot.start) as usize;
            return Ok(Lookup::Hit(&slot.buf[pos..len]));
        }

        if request.offset >= request.source_end {
            return Err(Error::bad_data(format!(
                "offset {} past the end {} of {}",
                request.offset, request.source_end, request.source
            )));
        }

        self.plan_read(request);
        Ok(Lookup::Miss)
    }

    fn plan_read(&mut self, request: &CacheRequest) {
        let buffer_size = self.buffer_size as u64;

        // start early when that also serves another stream's pending frame
        let (slot_id, start) = match request.hint {
            Some(hint)
                if hint.min_offset < request.offset
                    && request.offset - hint.min_offset <= buffer_size / 4
                    && request.frame_end.saturating_sub(self.align_down(hint.min_offset)) <= buffer_size =>
            {
                (hint.slot_id, hint.min_offset)
            }
            _ => (request.slot_id, request.offset),
        };

        let slot = slot_id % self.slots.len();
        let start = self.align_down(start);
        let mut len = buffer_size.min(request.source_end - start);

        // don't re-read bytes resident in another slot. Only slots starting
        // past the requested offset clip the read; one starting between
        // `start` and the offset would leave the requested byte unread.
        for (index, other) in self.slots.iter().enumerate() {
            if index != slot && other.source == Some(request.source) && other.start > request.offset {
                len = len.min(other.start - start);
            }
        }

        let target = &mut self.slots[slot];
        target.source = None;
        target.start = start;
        target.end = start;

        let planned = PlannedRead {
            slot,
            request: ReadRequest {
                source: request.source,
                offset: start,
                len: len as usize,
            },
            required: (request.offset - start + 1) as usize,
        };
        trace!(slot, offset = start, len, "planned read");
        self.planned = Some(planned);
    }

    /// The planned read and the buffer it has to land in.
    pub fn get_read_buffer(&mut self) -> Result<(ReadRequest, &mut [u8])> {
        let planned = self
            .planned
            .ok_or_else(|| Error::unexpected("no read is pending"))?;
        let reuse = self.reuse_buffers;
        let buffer_size = self.buffer_size;
        let slot = &mut self.slots[planned.slot];

        if !reuse || slot.buf.len() < buffer_size {
            let mut buf = Vec::new();
            buf.try_reserve_exact(buffer_size)
                .map_err(|_| Error::alloc_failed(format!("failed to allocate {buffer_size} byte read buffer")))?;
            buf.resize(buffer_size, 0);
            slot.buf = buf;
        }

        Ok((planned.request, &mut slot.buf[..planned.request.len]))
    }

    /// Record that the planned read produced `bytes_read` bytes.
    pub fn read_completed(&mut self, bytes_read: usize) -> Result<()> {
        let planned = self
            .planned
            .take()
            .ok_or_else(|| Error::unexpected("read completed without a pending read"))?;
        self.reads_issued += 1;

        if bytes_read < planned.required {
            return Err(Error::bad_data(format!(
                "read of {} at {} returned {bytes_read} bytes, probably a truncated file",
                planned.request.source, planned.request.offset
            )));
        }

        let slot = &mut self.slots[planned.slot];
        slot.source = Some(planned.request.source);
        slot.end = slot.start + bytes_read as u64;
        Ok(())
    }

    /// Perform the pending read, if any, through `reader`.
    pub fn fill(&mut self, reader: &mut dyn SourceReader) -> Result<()> {
        if self.planned.is_none() {
            return Ok(());
        }
        let (request, buf) = self.get_read_buffer()?;
        let bytes_read = reader.read_at(request.source, request.offset, buf)?;
        debug!(source = %request.source, offset = request.offset, bytes_read, "read completed");
        self.read_completed(bytes_read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    fn source_data(len: usize) -> HashMap<SourceId, Vec<u8>> {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        HashMap::from([(SourceId::new(0), data)])
    }

    fn request(offset: u64, frame_end: u64) -> CacheRequest {
        CacheRequest {
            slot_id: 0,
            source: SourceId::new(0),
            offset,
            frame_end,
            source_end: 10_000,
            hint: None,
        }
    }

    fn hit_len(cache: &mut ReadCache, req: &CacheRequest) -> usize {
        match cache.get_from_cache(req).unwrap() {
            Lookup::Hit(data) => data.len(),
            Lookup::Miss => panic!("expected a hit"),
        }
    }

    #[test]
    fn test_overlapping_ranges_share_one_read() {
        let mut reader = source_data(10_000);
        let mut cache = ReadCache::new(4096, 1).unwrap();

        let first = CacheRequest {
            source_end: 250,
            ..request(100, 200)
        };
        assert_matches!(cache.get_from_cache(&first).unwrap(), Lookup::Miss);
        cache.fill(&mut reader).unwrap();
        assert_eq!(hit_len(&mut cache, &first), 150);

        let second = CacheRequest {
            source_end: 250,
            ..request(150, 250)
        };
        match cache.get_from_cache(&second).unwrap() {
            Lookup::Hit(data) => assert_eq!(data[0], 150),
            Lookup::Miss => panic!("overlap should be resident"),
        }
        assert_eq!(cache.reads_issued(), 1);
    }

    #[test]
    fn test_read_start_is_aligned() {
        let mut cache = ReadCache::new(4096, 512).unwrap();
        assert_matches!(cache.get_from_cache(&request(1000, 1100)).unwrap(), Lookup::Miss);
        let (read, buf) = cache.get_read_buffer().unwrap();
        assert_eq!(read.offset, 512);
        assert_eq!(buf.len(), 4096);
    }

    #[test]
    fn test_hint_pulls_read_back() {
        let mut reader = source_data(10_000);
        let mut cache = ReadCache::new(4096, 1).unwrap();

        let video = CacheRequest {
            slot_id: 0,
            hint: Some(ReadHint {
                min_offset: 900,
                slot_id: 1,
            }),
            ..request(1000, 1500)
        };
        assert_matches!(cache.get_from_cache(&video).unwrap(), Lookup::Miss);
        let (read, _) = cache.get_read_buffer().unwrap();
        assert_eq!(read.offset, 900);
        cache.fill(&mut reader).unwrap();

        // the audio frame at the hinted offset is now resident too
        let audio = CacheRequest {
            slot_id: 1,
            ..request(900, 950)
        };
        assert!(hit_len(&mut cache, &audio) > 0);
        assert_eq!(cache.reads_issued(), 1);
    }

    #[test]
    fn test_far_hint_is_ignored() {
        let mut cache = ReadCache::new(4096, 1).unwrap();
        let video = CacheRequest {
            hint: Some(ReadHint {
                min_offset: 100,
                slot_id: 1,
            }),
            ..request(3000, 3100)
        };
        assert_matches!(cache.get_from_cache(&video).unwrap(), Lookup::Miss);
        assert_eq!(cache.get_read_buffer().unwrap().0.offset, 3000);
    }

    #[test]
    fn test_read_shrinks_before_resident_slot() {
        let mut reader = source_data(10_000);
        let mut cache = ReadCache::new(4096, 1).unwrap();

        let later = CacheRequest {
            slot_id: 1,
            ..request(2000, 2100)
        };
        assert_matches!(cache.get_from_cache(&later).unwrap(), Lookup::Miss);
        cache.fill(&mut reader).unwrap();

        assert_matches!(cache.get_from_cache(&request(1000, 1100)).unwrap(), Lookup::Miss);
        assert_eq!(cache.get_read_buffer().unwrap().0.len, 1000);
    }

    #[test]
    fn test_slot_before_requested_offset_does_not_clip() {
        let mut reader = source_data(10_000);
        let mut cache = ReadCache::new(4096, 1).unwrap();

        let short = CacheRequest {
            slot_id: 1,
            source_end: 960,
            ..request(950, 960)
        };
        assert_matches!(cache.get_from_cache(&short).unwrap(), Lookup::Miss);
        cache.fill(&mut reader).unwrap();

        // pulled back to 900, past the slot resident at 950
        let video = CacheRequest {
            hint: Some(ReadHint {
                min_offset: 900,
                slot_id: 0,
            }),
            ..request(1000, 1100)
        };
        assert_matches!(cache.get_from_cache(&video).unwrap(), Lookup::Miss);
        let read = cache.get_read_buffer().unwrap().0;
        assert_eq!(read.offset, 900);
        assert_eq!(read.len, 4096);
        cache.fill(&mut reader).unwrap();
        assert_eq!(hit_len(&mut cache, &video), 3996);
    }

    #[test]
    fn test_read_stops_at_source_end() {
        let mut cache = ReadCache::new(4096, 1).unwrap();
        let req = CacheRequest {
            source_end: 300,
            ..request(100, 200)
        };
        assert_matches!(cache.get_from_cache(&req).unwrap(), Lookup::Miss);
        assert_eq!(cache.get_read_buffer().unwrap().0.len, 200);
    }

    #[test]
    fn test_truncated_read_fails() {
        let mut reader = source_data(50);
        let mut cache = ReadCache::new(4096, 1).unwrap();
        assert_matches!(cache.get_from_cache(&request(100, 200)).unwrap(), Lookup::Miss);
        assert_matches!(cache.fill(&mut reader), Err(Error::BadData(_)));
    }

    #[test]
    fn test_allocate_slots_only_grows() {
        let mut cache = ReadCache::new(1024, 1).unwrap();
        assert_eq!(cache.slot_count(), MIN_SLOT_COUNT);
        cache.allocate_slots(3);
        cache.allocate_slots(1);
        assert_eq!(cache.slot_count(), 3);
    }

    #[test]
    fn test_invalid_alignment() {
        assert!(ReadCache::new(1024, 3).is_err());
        assert!(ReadCache::new(256, 512).is_err());
    }

    #[test]
    fn test_file_reader() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();

        let mut reader = FileReader::new();
        reader.add_source(SourceId::new(7), file.path());

        let mut buf = [0u8; 4];
        assert_eq!(reader.read_at(SourceId::new(7), 3, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"3456");

        let mut tail = [0u8; 8];
        assert_eq!(reader.read_at(SourceId::new(7), 8, &mut tail).unwrap(), 2);
        assert!(reader.read_at(SourceId::new(8), 0, &mut buf).is_err());
    }
}
