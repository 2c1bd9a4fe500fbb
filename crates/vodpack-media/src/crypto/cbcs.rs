//! `cbcs` pattern encryption: AES-CBC with a constant IV and a 1:9
//! encrypted:clear block pattern.
//!
//! Audio frames restart the chain per frame and leave the trailing partial
//! block clear. Video slices keep their length prefix, NAL header and slice
//! header clear; the chain restarts at every slice and the pattern is
//! anchored so the last encrypted block of a slice is whole. Slices too
//! short to hold one block after the header are left clear, as are all
//! non-slice NAL units.
//!
//! Frames pass straight through in order, so the output is the same size
//! as the input and no sample auxiliary information is produced. The same
//! walk run with a decrypting chain restores the clear stream.

use std::fmt;

use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut};
use tracing::debug;
use vodpack_codec::SliceParser;
use vodpack_common::{CodecId, MediaType};

use super::{cbc_decryptor, cbc_encryptor, Aes128CbcDec, Aes128CbcEnc, FrameTracker, AES_BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::media::{CursorFrame, Sequence, Track};
use crate::mp4::muxer::MuxSink;
use crate::write::{SegmentWriter, WriteBuffer};

/// Smallest slice (after the NAL type byte) that gets any encryption
const MIN_ENCRYPTED_PACKET_SIZE: u32 = 1 + AES_BLOCK_SIZE as u32;

/// One encrypted block followed by nine clear ones
const ENCRYPTED_BLOCK_PERIOD: u32 = 10;

/// Bytes buffered to parse a slice header
const MAX_SLICE_HEADER_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Encrypt,
    Decrypt,
}

enum Chain {
    Encrypt(Aes128CbcEnc),
    Decrypt(Aes128CbcDec),
}

/// CBC chain fed in arbitrary pieces; output is produced a whole block at
/// a time.
struct PatternChain {
    key: [u8; 16],
    iv: [u8; 16],
    direction: Direction,
    chain: Chain,
    block: [u8; AES_BLOCK_SIZE],
    block_len: usize,
}

impl PatternChain {
    fn new(key: [u8; 16], iv: [u8; 16], direction: Direction) -> Self {
        Self {
            key,
            iv,
            direction,
            chain: Self::start(&key, &iv, direction),
            block: [0; AES_BLOCK_SIZE],
            block_len: 0,
        }
    }

    fn start(key: &[u8; 16], iv: &[u8; 16], direction: Direction) -> Chain {
        match direction {
            Direction::Encrypt => Chain::Encrypt(cbc_encryptor(key, iv)),
            Direction::Decrypt => Chain::Decrypt(cbc_decryptor(key, iv)),
        }
    }

    /// Restart the chain from the constant IV.
    fn reset(&mut self) {
        self.chain = Self::start(&self.key, &self.iv, self.direction);
        self.block_len = 0;
    }

    fn apply(&mut self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match &mut self.chain {
            Chain::Encrypt(enc) => enc.encrypt_block_mut(block),
            Chain::Decrypt(dec) => dec.decrypt_block_mut(block),
        }
    }

    fn write<W: SegmentWriter>(&mut self, out: &mut WriteBuffer<W>, mut data: &[u8]) -> Result<()> {
        if self.block_len > 0 {
            let take = (AES_BLOCK_SIZE - self.block_len).min(data.len());
            self.block[self.block_len..self.block_len + take].copy_from_slice(&data[..take]);
            self.block_len += take;
            data = &data[take..];
            if self.block_len < AES_BLOCK_SIZE {
                return Ok(());
            }
            let mut block = self.block;
            self.apply(&mut block);
            out.write(&block)?;
            self.block_len = 0;
        }

        let whole = data.len() - data.len() % AES_BLOCK_SIZE;
        if whole > 0 {
            let dest = out.get_bytes(whole)?;
            dest.copy_from_slice(&data[..whole]);
            for chunk in dest.chunks_exact_mut(AES_BLOCK_SIZE) {
                self.apply(chunk);
            }
        }

        let rest = &data[whole..];
        self.block[..rest.len()].copy_from_slice(rest);
        self.block_len = rest.len();
        Ok(())
    }
}

/// State shared by all streams: one output, one chain.
struct Shared<W> {
    chain: PatternChain,
    out: WriteBuffer<W>,
    /// Streams that still have frames to write.
    flush_left: usize,
}

impl<W: SegmentWriter> Shared<W> {
    fn write_clear(&mut self, data: &[u8]) -> Result<()> {
        self.out.write(data)
    }

    fn write_pattern(&mut self, data: &[u8]) -> Result<()> {
        self.chain.write(&mut self.out, data)
    }

    fn stream_done(&mut self) -> Result<()> {
        self.flush_left = self.flush_left.saturating_sub(1);
        if self.flush_left == 0 {
            self.out.flush_block()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VideoState {
    PacketSize,
    NalType,
    SliceHeader,
    PacketEncrypt,
    PacketCopy,
}

struct VideoStream {
    parser: SliceParser,
    state: VideoState,
    length_bytes_left: usize,
    packet_left: u32,
    /// Bytes from the start of the next encrypted block to the end of the
    /// packet, 0 when no more blocks get encrypted.
    next_block_left: u32,
    slice_header: [u8; MAX_SLICE_HEADER_SIZE],
    header_pos: usize,
    header_end: usize,
}

impl VideoStream {
    fn new(track: &Track) -> Result<Self> {
        let parser = parser_for(track)?;
        Ok(Self {
            length_bytes_left: parser.nal_length_size(),
            parser,
            state: VideoState::PacketSize,
            packet_left: 0,
            next_block_left: 0,
            slice_header: [0; MAX_SLICE_HEADER_SIZE],
            header_pos: 0,
            header_end: 0,
        })
    }

    fn nal_length_size(&self) -> usize {
        self.parser.nal_length_size()
    }

    fn min_packet_size(&self) -> u32 {
        self.parser.min_packet_size() as u32
    }

    /// Step past the block that was just encrypted.
    fn advance_pattern(&mut self) {
        let period = ENCRYPTED_BLOCK_PERIOD * AES_BLOCK_SIZE as u32;
        self.next_block_left = if self.next_block_left >= period + AES_BLOCK_SIZE as u32 {
            self.next_block_left - period
        } else {
            0
        };
    }
}

fn parser_for(track: &Track) -> Result<SliceParser> {
    let info = &track.media_info;
    if !matches!(info.codec, CodecId::Avc | CodecId::Hevc) {
        return Err(Error::bad_request(format!(
            "cbcs encryption of {} video is not supported",
            info.codec
        )));
    }
    let parser = SliceParser::from_extra_data(info.codec, &info.extra_data)?;
    if !(1..=4).contains(&parser.nal_length_size()) {
        return Err(Error::bad_data(format!(
            "invalid nal length size {}",
            parser.nal_length_size()
        )));
    }
    Ok(parser)
}

enum StreamKind {
    Audio { clear_trailer: u32 },
    Video(Box<VideoStream>),
}

struct PatternStream<'s> {
    frames: FrameTracker<'s>,
    track: Option<&'s Track>,
    kind: StreamKind,
    frame_left: u32,
}

impl<'s> PatternStream<'s> {
    fn new(sequence: &'s Sequence) -> Result<Self> {
        let track = sequence.first_track()?;
        let kind = match sequence.media_type() {
            Some(MediaType::Video) => StreamKind::Video(Box::new(VideoStream::new(track)?)),
            Some(MediaType::Audio) => StreamKind::Audio { clear_trailer: 0 },
            other => {
                return Err(Error::bad_request(format!(
                    "cbcs encryption of {other:?} sequences is not supported"
                )))
            }
        };
        Ok(Self {
            frames: FrameTracker::new(sequence),
            track: Some(track),
            kind,
            frame_left: 0,
        })
    }

    /// Next frame with data; empty frames carry nothing to encrypt.
    fn peek_nonempty(&mut self) -> Option<CursorFrame<'s>> {
        while let Some(found) = self.frames.peek() {
            if found.frame.size > 0 {
                return Some(found);
            }
            self.frames.next_frame().ok()?;
        }
        None
    }

    fn has_frames(&mut self) -> bool {
        self.peek_nonempty().is_some()
    }

    fn in_frame(&self) -> bool {
        if self.frame_left > 0 {
            return true;
        }
        match &self.kind {
            StreamKind::Video(video) => video.state != VideoState::PacketSize || video.length_bytes_left != video.nal_length_size(),
            StreamKind::Audio { .. } => false,
        }
    }

    /// Move to the next frame with data, switching parameter sets when it
    /// starts a new clip.
    fn start_frame(&mut self) -> Result<()> {
        if self.peek_nonempty().is_none() {
            return Err(Error::bad_data("no more frames"));
        }
        let found = self.frames.next_frame()?;
        self.frame_left = found.frame.size;

        let new_track = !self.track.is_some_and(|t| std::ptr::eq(t, found.track));
        self.track = Some(found.track);

        match &mut self.kind {
            StreamKind::Video(video) => {
                if new_track {
                    debug!(track_id = found.track.media_info.track_id, "cbcs: new clip, reloading parameter sets");
                    video.parser = parser_for(found.track)?;
                    video.length_bytes_left = video.nal_length_size();
                }
                if self.frame_left < video.min_packet_size() {
                    return Err(Error::bad_data(format!(
                        "frame size {} too small, expected at least {}",
                        self.frame_left,
                        video.min_packet_size()
                    )));
                }
            }
            StreamKind::Audio { clear_trailer } => {
                *clear_trailer = self.frame_left % AES_BLOCK_SIZE as u32;
            }
        }
        Ok(())
    }

    /// Called after a frame ended; reports whether the stream is complete.
    fn frame_finished(&mut self) -> bool {
        !self.has_frames()
    }

    fn write<W: SegmentWriter>(&mut self, shared: &mut Shared<W>, data: &[u8]) -> Result<()> {
        match self.kind {
            StreamKind::Audio { .. } => self.write_audio(shared, data),
            StreamKind::Video(_) => self.write_video(shared, data),
        }
    }

    fn write_audio<W: SegmentWriter>(&mut self, shared: &mut Shared<W>, data: &[u8]) -> Result<()> {
        let mut pos = 0;
        while pos < data.len() {
            if self.frame_left == 0 {
                self.start_frame()?;
                shared.chain.reset();
            }
            let StreamKind::Audio { clear_trailer } = self.kind else {
                return Err(Error::unexpected("audio write on a video stream"));
            };

            if self.frame_left > clear_trailer {
                let size = ((self.frame_left - clear_trailer) as usize).min(data.len() - pos);
                shared.write_pattern(&data[pos..pos + size])?;
                pos += size;
                self.frame_left -= size as u32;
            }
            if self.frame_left <= clear_trailer {
                let size = (self.frame_left as usize).min(data.len() - pos);
                shared.write_clear(&data[pos..pos + size])?;
                pos += size;
                self.frame_left -= size as u32;
            }

            if self.frame_left == 0 && self.frame_finished() {
                shared.stream_done()?;
            }
        }
        Ok(())
    }

    fn write_video<W: SegmentWriter>(&mut self, shared: &mut Shared<W>, data: &[u8]) -> Result<()> {
        let mut pos = 0;
        loop {
            let StreamKind::Video(video) = &mut self.kind else {
                return Err(Error::unexpected("video write on an audio stream"));
            };

            match video.state {
                VideoState::PacketSize => {
                    if pos == data.len() {
                        break;
                    }
                    if self.frame_left == 0 && video.length_bytes_left == video.nal_length_size() {
                        self.start_frame()?;
                        continue;
                    }
                    while video.length_bytes_left > 0 && pos < data.len() {
                        video.packet_left = (video.packet_left << 8) | u32::from(data[pos]);
                        pos += 1;
                        video.length_bytes_left -= 1;
                    }
                    if video.length_bytes_left > 0 {
                        break;
                    }

                    match video.packet_left.checked_add(video.nal_length_size() as u32) {
                        Some(total) if video.packet_left > 0 && total <= self.frame_left => {
                            self.frame_left -= total;
                        }
                        _ => {
                            return Err(Error::bad_data(format!(
                                "invalid packet size {}, frame size left {}",
                                video.packet_left, self.frame_left
                            )))
                        }
                    }
                    if self.frame_left > 0 && self.frame_left < video.min_packet_size() {
                        return Err(Error::bad_data(format!(
                            "frame size left {} too small, expected at least {}",
                            self.frame_left,
                            video.min_packet_size()
                        )));
                    }
                    video.state = VideoState::NalType;
                }

                VideoState::NalType => {
                    if pos == data.len() {
                        break;
                    }
                    let nls = video.nal_length_size();
                    let prefix = video.packet_left.to_be_bytes();
                    shared.write_clear(&prefix[4 - nls..])?;
                    let nal_type = data[pos];
                    shared.write_clear(&[nal_type])?;
                    pos += 1;
                    video.packet_left -= 1;

                    if !video.parser.is_slice(nal_type)? || video.packet_left < MIN_ENCRYPTED_PACKET_SIZE {
                        video.state = VideoState::PacketCopy;
                        continue;
                    }
                    video.slice_header[0] = nal_type;
                    video.header_pos = 1;
                    video.header_end = MAX_SLICE_HEADER_SIZE.min(video.packet_left as usize + 1);
                    video.state = VideoState::SliceHeader;
                }

                VideoState::SliceHeader => {
                    let size = (video.header_end - video.header_pos).min(data.len() - pos);
                    video.slice_header[video.header_pos..video.header_pos + size].copy_from_slice(&data[pos..pos + size]);
                    video.header_pos += size;
                    pos += size;
                    if video.header_pos < video.header_end {
                        break;
                    }

                    let end = video.header_end;
                    let header_size = video.parser.slice_header_size(&video.slice_header[..end])? - 1;
                    let buffered = (end - 1) as u32;
                    if video.packet_left.saturating_sub(header_size as u32) < AES_BLOCK_SIZE as u32 {
                        shared.write_clear(&video.slice_header[1..end])?;
                        video.packet_left -= buffered;
                        video.state = VideoState::PacketCopy;
                        continue;
                    }

                    video.next_block_left = video.packet_left - header_size as u32;
                    shared.write_clear(&video.slice_header[1..1 + header_size])?;

                    shared.chain.reset();
                    let start = 1 + header_size;
                    let encrypted = AES_BLOCK_SIZE.min(end - start);
                    shared.write_pattern(&video.slice_header[start..start + encrypted])?;
                    if encrypted >= AES_BLOCK_SIZE {
                        shared.write_clear(&video.slice_header[start + encrypted..end])?;
                        video.advance_pattern();
                    }

                    video.packet_left -= buffered;
                    video.state = VideoState::PacketEncrypt;
                }

                VideoState::PacketEncrypt | VideoState::PacketCopy => {
                    if video.state == VideoState::PacketEncrypt
                        && video.packet_left > 0
                        && video.packet_left <= video.next_block_left
                    {
                        let block_end = video.next_block_left - AES_BLOCK_SIZE as u32;
                        let size = ((video.packet_left - block_end) as usize).min(data.len() - pos);
                        shared.write_pattern(&data[pos..pos + size])?;
                        pos += size;
                        video.packet_left -= size as u32;
                        if video.packet_left > block_end {
                            break;
                        }
                        video.advance_pattern();
                    }

                    let size = ((video.packet_left - video.next_block_left) as usize).min(data.len() - pos);
                    shared.write_clear(&data[pos..pos + size])?;
                    pos += size;
                    video.packet_left -= size as u32;
                    if video.packet_left > 0 {
                        if pos == data.len() {
                            break;
                        }
                        continue;
                    }

                    video.state = VideoState::PacketSize;
                    video.length_bytes_left = video.nal_length_size();
                    video.next_block_left = 0;
                    if self.frame_left == 0 && self.frame_finished() {
                        shared.stream_done()?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Pattern transform over one or more streams sharing an output.
struct PatternWriter<'s, W> {
    streams: Vec<PatternStream<'s>>,
    shared: Shared<W>,
}

impl<'s, W: SegmentWriter> PatternWriter<'s, W> {
    fn new(sequences: &'s [Sequence], key: [u8; 16], iv: [u8; 16], direction: Direction, out: W) -> Result<Self> {
        let mut streams = sequences.iter().map(PatternStream::new).collect::<Result<Vec<_>>>()?;
        let mut flush_left = 0;
        for stream in &mut streams {
            if stream.has_frames() {
                flush_left += 1;
            }
        }
        Ok(Self {
            streams,
            shared: Shared {
                chain: PatternChain::new(key, iv, direction),
                out: WriteBuffer::new(out),
                flush_left,
            },
        })
    }

    fn write_stream(&mut self, stream: usize, data: &[u8]) -> Result<()> {
        let state = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| Error::unexpected(format!("invalid stream index {stream}")))?;
        state.write(&mut self.shared, data)
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(index) = self.streams.iter().position(|s| s.in_frame()) {
            return Err(Error::bad_data(format!("stream {index} ended in the middle of a frame")));
        }
        self.shared.out.flush()
    }

    fn into_inner(self) -> Result<W> {
        self.shared.out.into_inner()
    }
}

macro_rules! pattern_writer {
    ($name:ident, $direction:expr, $doc:literal) => {
        #[doc = $doc]
        pub struct $name<'s, W> {
            inner: PatternWriter<'s, W>,
        }

        impl<'s, W: SegmentWriter> $name<'s, W> {
            /// One stream per sequence, all written to `out`. `iv` is the
            /// constant IV every chain starts from.
            pub fn new(sequences: &'s [Sequence], key: [u8; 16], iv: [u8; 16], out: W) -> Result<Self> {
                Ok(Self {
                    inner: PatternWriter::new(sequences, key, iv, $direction, out)?,
                })
            }

            /// Flush buffered output and return the inner writer.
            pub fn into_inner(self) -> Result<W> {
                self.inner.into_inner()
            }
        }

        impl<W> fmt::Debug for $name<'_, W> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("streams", &self.inner.streams.len())
                    .finish_non_exhaustive()
            }
        }

        impl<W: SegmentWriter> MuxSink for $name<'_, W> {
            fn write_stream(&mut self, stream: usize, data: &[u8]) -> Result<()> {
                self.inner.write_stream(stream, data)
            }

            fn flush(&mut self) -> Result<()> {
                self.inner.flush()
            }
        }

        /// Single-stream use: every write belongs to the first sequence.
        impl<W: SegmentWriter> SegmentWriter for $name<'_, W> {
            fn write_tail(&mut self, data: &[u8]) -> Result<()> {
                self.inner.write_stream(0, data)
            }

            fn flush(&mut self) -> Result<()> {
                self.inner.flush()
            }
        }
    };
}

pattern_writer!(
    CbcsEncryptor,
    Direction::Encrypt,
    "Encrypts the frames of one or more sequences with the `cbcs` pattern."
);

pattern_writer!(
    CbcsDecryptor,
    Direction::Decrypt,
    "Reverses [`CbcsEncryptor`]; slice headers are read from the clear part of each slice."
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::tests::{frame, media_info};
    use crate::media::{FramePart, SourceRef};
    use assert_matches::assert_matches;
    use vodpack_common::SourceId;

    const KEY: [u8; 16] = [0x42; 16];
    const IV: [u8; 16] = [0x17; 16];

    const SPS: [u8; 9] = [0x67, 0x42, 0x00, 0x1e, 0x96, 0x54, 0x0a, 0x0f, 0xc8];
    const PPS: [u8; 4] = [0x68, 0xce, 0x3c, 0x80];
    /// IDR I-slice: 36 header bits after the NAL type byte
    const IDR_HEADER: [u8; 5] = [0x88, 0x80, 0x40, 0x02, 0xf5];

    fn avcc() -> Vec<u8> {
        let mut config = vec![1, 0x42, 0x00, 0x1e, 0xff, 0xe1];
        config.extend((SPS.len() as u16).to_be_bytes());
        config.extend(SPS);
        config.push(1);
        config.extend((PPS.len() as u16).to_be_bytes());
        config.extend(PPS);
        config
    }

    fn payload(len: usize) -> impl Iterator<Item = u8> {
        (0..len).map(|i| (i * 13 % 251) as u8 + 1)
    }

    /// Length-prefixed IDR slice with `data_len` bytes after the header.
    fn idr_slice(data_len: usize) -> Vec<u8> {
        let mut unit = vec![0x65];
        unit.extend(IDR_HEADER);
        unit.extend(payload(data_len));
        let mut packet = (unit.len() as u32).to_be_bytes().to_vec();
        packet.extend(unit);
        packet
    }

    fn nal(header: u8, len: usize) -> Vec<u8> {
        let mut packet = ((len + 1) as u32).to_be_bytes().to_vec();
        packet.push(header);
        packet.extend(payload(len));
        packet
    }

    fn sequence(media_type: MediaType, codec: CodecId, frames: &[Vec<u8>]) -> Sequence {
        let mut info = media_info(media_type, codec, 90000);
        info.extra_data = avcc();
        let mut offset = 0;
        let list = frames
            .iter()
            .map(|f| {
                let fr = frame(offset, f.len() as u32, 3000);
                offset += f.len() as u64;
                fr
            })
            .collect();
        let track = Track::new(info, vec![FramePart::new(SourceRef::File(SourceId::new(0)), list)]);
        Sequence::new(0, vec![track])
    }

    fn encrypt(sequence: &Sequence, data: &[u8], chunk: usize) -> Vec<u8> {
        let mut enc = CbcsEncryptor::new(std::slice::from_ref(sequence), KEY, IV, Vec::new()).unwrap();
        for piece in data.chunks(chunk) {
            enc.write_tail(piece).unwrap();
        }
        SegmentWriter::flush(&mut enc).unwrap();
        enc.into_inner().unwrap()
    }

    fn decrypt(sequence: &Sequence, data: &[u8]) -> Vec<u8> {
        let mut dec = CbcsDecryptor::new(std::slice::from_ref(sequence), KEY, IV, Vec::new()).unwrap();
        dec.write_tail(data).unwrap();
        SegmentWriter::flush(&mut dec).unwrap();
        dec.into_inner().unwrap()
    }

    #[test]
    fn test_slice_header_size_of_fixture() {
        let parser = SliceParser::from_extra_data(CodecId::Avc, &avcc()).unwrap();
        let slice = idr_slice(200);
        assert_eq!(parser.slice_header_size(&slice[4..]).unwrap(), 6);
    }

    #[test]
    fn test_video_pattern_layout() {
        let frames = vec![idr_slice(200)];
        let sequence = sequence(MediaType::Video, CodecId::Avc, &frames);
        let clear = frames.concat();
        let encrypted = encrypt(&sequence, &clear, clear.len());

        assert_eq!(encrypted.len(), clear.len());
        // prefix, type and slice header
        assert_eq!(encrypted[..10], clear[..10]);
        // first encrypted block, then nine clear blocks
        assert_ne!(encrypted[10..26], clear[10..26]);
        assert_eq!(encrypted[26..170], clear[26..170]);
        assert_ne!(encrypted[170..186], clear[170..186]);
        assert_eq!(encrypted[186..], clear[186..]);
    }

    #[test]
    fn test_video_round_trip_any_chunking() {
        let mut first = nal(0x06, 12);
        first.extend(idr_slice(400));
        let frames = vec![first, idr_slice(37), idr_slice(8)];
        let sequence = sequence(MediaType::Video, CodecId::Avc, &frames);
        let clear = frames.concat();

        let whole = encrypt(&sequence, &clear, clear.len());
        for chunk in [1, 3, 16, 127, 500] {
            assert_eq!(encrypt(&sequence, &clear, chunk), whole, "chunk {chunk}");
        }
        assert_ne!(whole, clear);
        assert_eq!(decrypt(&sequence, &whole), clear);
    }

    #[test]
    fn test_short_slice_stays_clear() {
        // 6 header bytes + 8 data bytes: under one block after the header
        let frames = vec![idr_slice(8)];
        let sequence = sequence(MediaType::Video, CodecId::Avc, &frames);
        let clear = frames.concat();
        assert_eq!(encrypt(&sequence, &clear, 5), clear);
    }

    #[test]
    fn test_non_slice_units_stay_clear() {
        let frames = vec![nal(0x06, 300)];
        let sequence = sequence(MediaType::Video, CodecId::Avc, &frames);
        let clear = frames.concat();
        assert_eq!(encrypt(&sequence, &clear, 64), clear);
    }

    #[test]
    fn test_audio_trailer_clear() {
        let frames = vec![payload(37).collect::<Vec<_>>(), payload(10).collect(), Vec::new(), payload(32).collect()];
        let sequence = sequence(MediaType::Audio, CodecId::Aac, &frames);
        let clear = frames.concat();
        let encrypted = encrypt(&sequence, &clear, 7);

        assert_ne!(encrypted[..32], clear[..32]);
        assert_eq!(encrypted[32..47], clear[32..47]);
        assert_ne!(encrypted[47..], clear[47..]);
        // each frame restarts the chain
        assert_eq!(encrypted[47..63], encrypted[..16]);
        assert_eq!(decrypt(&sequence, &encrypted), clear);
    }

    #[test]
    fn test_audio_round_trip_random_frames() {
        use rand::{Rng, SeedableRng};

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let frames: Vec<Vec<u8>> = (0..40)
            .map(|_| {
                let len = rng.gen_range(0..300);
                (0..len).map(|_| rng.gen()).collect()
            })
            .collect();
        let sequence = sequence(MediaType::Audio, CodecId::Aac, &frames);
        let clear = frames.concat();

        let encrypted = encrypt(&sequence, &clear, rng.gen_range(1..64));
        assert_eq!(encrypted.len(), clear.len());
        assert_eq!(decrypt(&sequence, &encrypted), clear);
    }

    #[test]
    fn test_two_streams_share_output() {
        let audio = sequence(MediaType::Audio, CodecId::Aac, &[payload(20).collect()]);
        let video = sequence(MediaType::Video, CodecId::Avc, &[idr_slice(30)]);
        let sequences = [video, audio];
        let mut enc = CbcsEncryptor::new(&sequences, KEY, IV, Vec::new()).unwrap();
        let video_data = idr_slice(30);
        let audio_data: Vec<u8> = payload(20).collect();

        enc.write_stream(0, &video_data[..12]).unwrap();
        enc.write_stream(1, &audio_data).unwrap();
        enc.write_stream(0, &video_data[12..]).unwrap();
        MuxSink::flush(&mut enc).unwrap();
        let out = enc.into_inner().unwrap();
        assert_eq!(out.len(), video_data.len() + audio_data.len());
        // video prefix and type went out before the audio frame
        assert_eq!(out[..5], video_data[..5]);
        assert_ne!(out[5..21], audio_data[..16]);
        assert_eq!(out[21..25], audio_data[16..]);
        assert_eq!(out[25..30], video_data[5..10]);
    }

    #[test]
    fn test_bad_packet_size() {
        let mut bad = idr_slice(40);
        bad[3] = 200;
        let sequence = sequence(MediaType::Video, CodecId::Avc, &[bad.clone()]);
        let mut enc = CbcsEncryptor::new(std::slice::from_ref(&sequence), KEY, IV, Vec::new()).unwrap();
        assert_matches!(enc.write_tail(&bad), Err(Error::BadData(_)));
    }

    #[test]
    fn test_incomplete_frame_fails_flush() {
        let frames = vec![idr_slice(40)];
        let sequence = sequence(MediaType::Video, CodecId::Avc, &frames);
        let mut enc = CbcsEncryptor::new(std::slice::from_ref(&sequence), KEY, IV, Vec::new()).unwrap();
        enc.write_tail(&frames[0][..20]).unwrap();
        assert_matches!(SegmentWriter::flush(&mut enc), Err(Error::BadData(_)));
    }

    #[test]
    fn test_unsupported_video_codec() {
        let sequence = sequence(MediaType::Video, CodecId::Vp9, &[vec![1, 2, 3]]);
        let result = CbcsEncryptor::new(std::slice::from_ref(&sequence), KEY, IV, Vec::new());
        assert_matches!(result, Err(Error::BadRequest(_)));
    }
}
