//! Multi-track fragments: one `moof` with a `traf` per stream followed by
//! an `mdat` holding the frames of every stream, interleaved by
//! presentation time.
//!
//! Frame order is decided twice with the same selection rule: once to
//! assign output offsets (which split each stream into trun runs), then
//! again while the frame bytes are streamed out.

use bytes::BytesMut;
use tracing::{debug, error};
use vodpack_common::{MediaType, SourceId};

use super::boxes::{
    DecodeTime, MdatHeader, Mfhd, Moof, SampleFlags, Tfdt64, Tfhd, Traf, Trun, TrunEntry, ATOM_HEADER_SIZE,
};
use crate::error::{Error, Result};
use crate::layout::{Emitter, Layout, Measured};
use crate::media::{rescale_time, Frame, FramePart, Sequence, SourceRef, Track};
use crate::read_cache::{ReadCache, ReadHint};
use crate::source::{open_source, FrameSource, Progress, SegmentProcessor, SourceRead};
use crate::write::SegmentWriter;

/// A stream that was not selected last must be earlier by this much to
/// take over, which keeps runs long.
const SWITCH_PENALTY_MICROS: u64 = 250_000;

const MICROS: u32 = 1_000_000;

/// Output of a muxed fragment.
pub trait MuxSink {
    /// Write bytes of stream `stream`.
    fn write_stream(&mut self, stream: usize, data: &[u8]) -> Result<()>;

    /// Identifies the physical destination of `stream`; chunks are only
    /// merged across streams that share one.
    fn sink_id(&self, _stream: usize) -> usize {
        0
    }

    fn flush(&mut self) -> Result<()>;
}

/// Every stream writes to the same writer.
#[derive(Debug)]
pub struct SharedSink<W>(pub W);

impl<W: SegmentWriter> SharedSink<W> {
    pub fn into_inner(self) -> W {
        self.0
    }
}

impl<W: SegmentWriter> MuxSink for SharedSink<W> {
    fn write_stream(&mut self, _stream: usize, data: &[u8]) -> Result<()> {
        self.0.write_tail(data)
    }

    fn flush(&mut self) -> Result<()> {
        self.0.flush()
    }
}

/// One writer per stream.
#[derive(Debug)]
pub struct PerStreamSink<W>(pub Vec<W>);

impl<W: SegmentWriter> PerStreamSink<W> {
    pub fn into_inner(self) -> Vec<W> {
        self.0
    }
}

impl<W: SegmentWriter> MuxSink for PerStreamSink<W> {
    fn write_stream(&mut self, stream: usize, data: &[u8]) -> Result<()> {
        self.0
            .get_mut(stream)
            .ok_or_else(|| Error::unexpected(format!("no writer for stream {stream}")))?
            .write_tail(data)
    }

    fn sink_id(&self, stream: usize) -> usize {
        stream
    }

    fn flush(&mut self) -> Result<()> {
        self.0.iter_mut().try_for_each(|writer| writer.flush())
    }
}

/// Decode time of the first frame of a clip, in track timescale units.
fn clip_time_offset(track: &Track) -> u64 {
    track.clip_start_time * u64::from(track.media_info.timescale / 1000) + track.first_frame_time_offset
}

/// tfdt of a stream: the first clip holding frames, with video shifted so
/// every stream of the fragment starts from the same origin.
fn earliest_pres_time(sequence: &Sequence) -> u64 {
    let mut result = 0;
    for track in &sequence.clips {
        result = clip_time_offset(track);
        let Some(first) = track.first_frame() else {
            continue;
        };
        if track.media_info.media_type == MediaType::Video {
            result += u64::from(first.pts_delay);
            result = result.saturating_sub(u64::from(track.media_info.video.initial_pts_delay));
        }
        break;
    }
    result
}

#[derive(Debug, Clone, Copy)]
struct Located<'s> {
    part: &'s FramePart,
    frame: &'s Frame,
    part_start: bool,
}

struct MuxStream<'s> {
    sequence: &'s Sequence,
    media_type: MediaType,
    timescale: u32,
    part: usize,
    frame: usize,
    next_time: u64,
    output_offsets: Vec<u32>,
    source: Option<Box<dyn FrameSource>>,
}

impl<'s> MuxStream<'s> {
    fn new(sequence: &'s Sequence) -> Result<Self> {
        let track = sequence.first_track()?;
        let media_type = track.media_info.media_type;
        if media_type == MediaType::Subtitle {
            return Err(Error::bad_request("only audio and video streams can be muxed"));
        }
        let mut stream = Self {
            sequence,
            media_type,
            timescale: track.media_info.timescale,
            part: 0,
            frame: 0,
            next_time: 0,
            output_offsets: Vec::with_capacity(sequence.total_frame_count()),
            source: None,
        };
        stream.reset(0);
        Ok(stream)
    }

    fn reset(&mut self, clip: usize) {
        self.part = 0;
        self.frame = 0;
        if let Some(track) = self.sequence.clips.get(clip) {
            self.timescale = track.media_info.timescale;
            self.next_time = clip_time_offset(track);
        }
    }

    /// Part and frame index of the next frame in `clip`.
    fn locate(&self, clip: usize) -> Option<(usize, usize)> {
        let track = self.sequence.clips.get(clip)?;
        let (mut part, mut frame) = (self.part, self.frame);
        loop {
            if frame < track.parts.get(part)?.frames.len() {
                return Some((part, frame));
            }
            part += 1;
            frame = 0;
        }
    }

    fn peek(&self, clip: usize) -> Option<Located<'s>> {
        let (part, frame) = self.locate(clip)?;
        let part = &self.sequence.clips[clip].parts[part];
        Some(Located {
            part,
            frame: &part.frames[frame],
            part_start: frame == 0,
        })
    }

    /// Consume the next frame of `clip`.
    fn advance(&mut self, clip: usize) -> Option<Located<'s>> {
        let found = self.peek(clip)?;
        (self.part, self.frame) = self.locate(clip)?;
        self.frame += 1;
        self.next_time += u64::from(found.frame.duration);
        Some(found)
    }

    /// Whether the last consumed frame closed its part.
    fn part_finished(&self, clip: usize) -> bool {
        self.sequence
            .clips
            .get(clip)
            .and_then(|t| t.parts.get(self.part))
            .map_or(true, |p| self.frame >= p.frames.len())
    }

    fn slot_id(&self) -> usize {
        self.media_type.index()
    }

    /// The trun runs of this stream: frames whose output offsets follow each
    /// other share a run.
    fn truns(&self, flags: SampleFlags) -> Vec<Trun> {
        let mut truns: Vec<Trun> = Vec::new();
        let mut offsets = self.output_offsets.iter();
        let mut next_offset = None;

        for track in &self.sequence.clips {
            let initial_pts_delay = track.media_info.video.initial_pts_delay;
            for frame in track.frames() {
                let Some(&offset) = offsets.next() else {
                    return truns;
                };
                if next_offset != Some(offset) {
                    truns.push(Trun {
                        media_type: self.media_type,
                        flags,
                        data_offset: offset,
                        entries: Vec::new(),
                    });
                }
                if let Some(trun) = truns.last_mut() {
                    trun.entries.push(TrunEntry::from_frame(frame, initial_pts_delay));
                }
                next_offset = Some(offset.wrapping_add(frame.size));
            }
        }
        truns
    }
}

struct MuxedLayout {
    moof: Moof,
    mdat: MdatHeader,
}

impl Layout for MuxedLayout {
    fn size(&self) -> usize {
        self.moof.size() + self.mdat.size()
    }

    fn write(&self, out: &mut Emitter<'_>) {
        self.moof.write(out);
        self.mdat.write(out);
    }
}

/// `moof` + `mdat` header of a muxed fragment.
#[derive(Debug)]
pub struct MuxedHeader {
    bytes: Option<BytesMut>,
    header_size: usize,
    total_size: u64,
}

impl MuxedHeader {
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    /// Header bytes, absent in size-only mode.
    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }

    pub fn into_bytes(self) -> Option<BytesMut> {
        self.bytes
    }
}

/// Interleaves the frames of several sequences into one sink.
pub struct Muxer<'s, S> {
    streams: Vec<MuxStream<'s>>,
    clip: usize,
    clip_count: usize,
    frames_size: u64,
    selected: Option<usize>,
    current: Option<usize>,

    sink: S,
    reuse_buffers: bool,
    decrypt: bool,
    pending: BytesMut,
    pending_stream: usize,
    pending_next: Option<(SourceId, u64)>,
    first_time: bool,
    done: bool,
}

impl<'s, S: MuxSink> Muxer<'s, S> {
    /// Set up the streams and assign every frame its output offset.
    pub fn new(sequences: &'s [Sequence], sink: S, reuse_buffers: bool) -> Result<Self> {
        let Some(first) = sequences.first() else {
            return Err(Error::bad_request("no streams to mux"));
        };
        let clip_count = first.clips.len();
        if sequences.iter().any(|s| s.clips.len() != clip_count) {
            return Err(Error::bad_request("muxed streams differ in clip count"));
        }

        let streams = sequences.iter().map(MuxStream::new).collect::<Result<Vec<_>>>()?;
        let mut muxer = Self {
            streams,
            clip: 0,
            clip_count,
            frames_size: 0,
            selected: None,
            current: None,
            sink,
            reuse_buffers,
            decrypt: true,
            pending: BytesMut::new(),
            pending_stream: 0,
            pending_next: None,
            first_time: true,
            done: false,
        };
        muxer.calculate_output_offsets()?;
        debug!(
            streams = muxer.streams.len(),
            clips = clip_count,
            frames_size = muxer.frames_size,
            reuse_buffers,
            "muxer initialized"
        );
        Ok(muxer)
    }

    /// Read protected parts as stored instead of decrypting them.
    pub fn keep_source_encryption(mut self) -> Self {
        self.decrypt = false;
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Total frame bytes, the mdat payload.
    pub fn frames_size(&self) -> u64 {
        self.frames_size
    }

    /// Pick the stream whose next frame comes first; moves on to the next
    /// clip once every stream ran out of frames in this one.
    fn choose_stream(&mut self) -> Option<usize> {
        loop {
            let mut best: Option<(usize, u64)> = None;
            for (index, stream) in self.streams.iter().enumerate() {
                if stream.locate(self.clip).is_none() {
                    continue;
                }
                let time = rescale_time(stream.next_time, stream.timescale, MICROS);
                if best.map_or(true, |(_, min)| time < min) {
                    let penalty = if self.selected == Some(index) { 0 } else { SWITCH_PENALTY_MICROS };
                    best = Some((index, time + penalty));
                }
            }

            if let Some((index, _)) = best {
                self.selected = Some(index);
                return Some(index);
            }

            if self.clip + 1 >= self.clip_count {
                return None;
            }
            self.clip += 1;
            for stream in &mut self.streams {
                stream.reset(self.clip);
            }
            self.first_time = true;
        }
    }

    fn rewind(&mut self) {
        self.clip = 0;
        self.selected = None;
        for stream in &mut self.streams {
            stream.reset(0);
        }
    }

    fn calculate_output_offsets(&mut self) -> Result<()> {
        let mut offset = 0u64;
        while let Some(index) = self.choose_stream() {
            let stream = &mut self.streams[index];
            let found = stream
                .advance(self.clip)
                .ok_or_else(|| Error::unexpected("selected stream has no frame"))?;
            let output = u32::try_from(offset)
                .map_err(|_| Error::bad_request(format!("muxed fragment of {offset} bytes too large")))?;
            stream.output_offsets.push(output);
            offset += u64::from(found.frame.size);
        }
        self.frames_size = offset;
        self.rewind();
        Ok(())
    }

    /// Build the `moof` + `mdat` header.
    pub fn header(&self, segment_index: u32, size_only: bool) -> Result<MuxedHeader> {
        let mdat_size = ATOM_HEADER_SIZE as u64 + self.frames_size;
        if mdat_size > u64::from(u32::MAX) {
            return Err(Error::bad_request(format!("fragment payload of {} bytes too large", self.frames_size)));
        }

        let trafs = self
            .streams
            .iter()
            .map(|stream| {
                let info = &stream.sequence.clips[0].media_info;
                Traf {
                    tfhd: Tfhd {
                        track_id: info.track_id,
                        sample_description_index: 0,
                    },
                    tfdt: DecodeTime::Wide(Tfdt64 {
                        decode_time: earliest_pres_time(stream.sequence),
                    }),
                    truns: stream.truns(SampleFlags::Muxed),
                    aux: None,
                }
            })
            .collect();
        let mut moof = Moof {
            mfhd: Mfhd {
                sequence_number: segment_index,
            },
            trafs,
        };

        let base_offset = (moof.size() + ATOM_HEADER_SIZE) as u32;
        for trun in moof.trafs.iter_mut().flat_map(|t| t.truns.iter_mut()) {
            trun.data_offset += base_offset;
        }

        let layout = Measured::new(MuxedLayout {
            moof,
            mdat: MdatHeader {
                payload_size: self.frames_size,
            },
        });
        let header_size = layout.size();
        let total_size = header_size as u64 + self.frames_size;
        debug!(segment_index, header_size, total_size, "muxed fragment header built");

        let bytes = if size_only { None } else { Some(layout.emit()?) };
        Ok(MuxedHeader {
            bytes,
            header_size,
            total_size,
        })
    }

    /// Smallest next-frame offset of the other streams reading the same
    /// file as `selected`.
    fn read_hint(&self, selected: usize, part: &FramePart) -> Option<ReadHint> {
        let SourceRef::File(source) = &part.source else {
            return None;
        };

        self.streams
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != selected)
            .filter_map(|(_, stream)| {
                let found = stream.peek(self.clip)?;
                match &found.part.source {
                    SourceRef::File(other) if other == source => Some(ReadHint {
                        min_offset: found.frame.offset,
                        slot_id: stream.slot_id(),
                    }),
                    _ => None,
                }
            })
            .min_by_key(|hint| hint.min_offset)
    }

    fn start_frame(&mut self) -> Result<bool> {
        let Some(index) = self.choose_stream() else {
            return Ok(false);
        };
        let clip = self.clip;
        let found = self.streams[index]
            .peek(clip)
            .ok_or_else(|| Error::unexpected("selected stream has no frame"))?;
        let hint = self.read_hint(index, found.part);

        let stream = &mut self.streams[index];
        stream.advance(clip);
        if found.part_start || stream.source.is_none() {
            stream.source = Some(open_source(found.part, stream.slot_id(), self.decrypt)?);
            self.first_time = true;
        }
        stream
            .source
            .as_mut()
            .ok_or_else(|| Error::unexpected("no frame source"))?
            .start_frame(found.frame, hint)?;

        self.current = Some(index);
        Ok(true)
    }

    fn flush_pending(&mut self) -> Result<()> {
        write_pending(&mut self.sink, &mut self.pending, self.pending_stream)
    }

    fn finish(&mut self) -> Result<Progress> {
        self.flush_pending()?;
        self.sink.flush()?;
        self.done = true;
        debug!(frames_size = self.frames_size, "muxed fragment complete");
        Ok(Progress::Done)
    }
}

fn write_pending<S: MuxSink>(sink: &mut S, pending: &mut BytesMut, stream: usize) -> Result<()> {
    if pending.is_empty() {
        return Ok(());
    }
    let chunk = pending.split();
    sink.write_stream(stream, &chunk)
}

impl<S: MuxSink> SegmentProcessor for Muxer<'_, S> {
    fn process(&mut self, cache: &mut ReadCache) -> Result<Progress> {
        if self.done {
            return Ok(Progress::Done);
        }
        if self.current.is_none() && !self.start_frame()? {
            return self.finish();
        }

        let mut processed_data = false;
        loop {
            let index = self.current.ok_or_else(|| Error::unexpected("no current stream"))?;
            let source = self.streams[index]
                .source
                .as_mut()
                .ok_or_else(|| Error::unexpected("no frame source"))?;
            let position = source.source_id().zip(source.pending_offset());

            let frame_done = match source.read(cache)? {
                SourceRead::Pending => {
                    if !self.pending.is_empty() {
                        self.flush_pending()?;
                    } else if !processed_data && !self.first_time {
                        error!("no data was handled, probably a truncated file");
                        return Err(Error::bad_data("no data was handled, probably a truncated file"));
                    }
                    self.first_time = false;
                    return Ok(Progress::Pending);
                }
                SourceRead::Data { data, frame_done } => {
                    if self.reuse_buffers {
                        self.sink.write_stream(index, data)?;
                    } else {
                        let contiguous = !self.pending.is_empty()
                            && self.sink.sink_id(self.pending_stream) == self.sink.sink_id(index)
                            && position.is_some()
                            && position == self.pending_next;
                        if !contiguous {
                            write_pending(&mut self.sink, &mut self.pending, self.pending_stream)?;
                            self.pending_stream = index;
                        }
                        self.pending.extend_from_slice(data);
                        self.pending_next = position.map(|(id, offset)| (id, offset + data.len() as u64));
                    }
                    frame_done
                }
            };
            processed_data = true;

            if !frame_done {
                continue;
            }

            if self.streams[index].part_finished(self.clip) {
                self.flush_pending()?;
            }
            self.current = None;
            if !self.start_frame()? {
                return self.finish();
            }
        }
    }
}
