//! Streaming F4V decoder.
//!
//! Two modes. In atom mode the decoder reads one atom per call; `moov` is
//! deep-copied as the canonical metadata and `mdat` flips the decoder into
//! frame mode. In frame mode it serves frames in playback order using the
//! index built from the sample tables, falling back to synthetic raw frames
//! wherever the index and the actual bytes disagree. When the cursor leaves
//! the `mdat` byte range the decoder drops back to atom mode.
//!
//! `decode` follows the `tokio_util::codec::Decoder` contract: `Ok(None)`
//! means feed more bytes and retry, the buffer is only consumed on progress.

use std::collections::BTreeMap;

use bytes::{Buf, BytesMut};
use tokio_util::codec;
use tracing::{debug, error, info, warn};

use crate::atom::{Atom, AtomBody, AtomHeader, ContainerAtom};
use crate::error::F4vError;
use crate::fourcc::FourCc;
use crate::frame::{Frame, FrameHeader};
use crate::index;

/// Upper bound on frames parked while the playback order runs ahead of the
/// byte order. An index that needs more than this is inconsistent.
pub const MAX_FRAME_CACHE_SIZE: usize = 64;

/// Chunk size for the raw-split mode that reads `mdat` without a `moov`.
const RAW_SPLIT_FRAME_SIZE: u64 = 10_000;

/// One decoded unit: a container atom, or a frame out of `mdat`.
#[derive(Debug, Clone, PartialEq)]
pub enum F4vData {
    Atom(Atom),
    Frame(Frame),
}

enum FrameRead {
    Frame(Frame),
    NeedData,
    /// The current mdat is exhausted; return to atom mode.
    Finished,
}

#[derive(Debug, Default)]
pub struct Decoder {
    /// Absolute stream offset of the first unconsumed buffer byte.
    stream_position: u64,
    moov: Option<ContainerAtom>,

    in_mdat: bool,
    mdat_begin: u64,
    mdat_end: u64,
    /// Cursor inside the mdat byte range; always equals `stream_position`
    /// while in frame mode.
    mdat_offset: u64,

    /// All frames of the current mdat, ordered by file offset.
    frames: Vec<FrameHeader>,
    /// Next frame for sequential byte-order reads.
    next_frame: usize,
    prev_frame: Option<FrameHeader>,
    /// Playback order: indices into `frames`.
    order: Vec<u32>,
    next_order: usize,
    /// Frames read ahead of the playback cursor, keyed by offset.
    cache: BTreeMap<u64, Frame>,

    order_by_timestamp: bool,
    split_raw_frames: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Decoder {
            order_by_timestamp: true,
            ..Decoder::default()
        }
    }

    /// `false` serves frames in byte order instead of presentation order.
    pub fn set_order_frames_by_timestamp(&mut self, by_timestamp: bool) {
        self.order_by_timestamp = by_timestamp;
    }

    /// Read fixed-size raw frames out of `mdat` without needing a `moov`;
    /// for streams that put the movie header at the end.
    pub fn set_split_raw_frames(&mut self, split: bool) {
        self.split_raw_frames = split;
    }

    /// The canonical movie metadata: the last `moov` decoded.
    pub fn moov(&self) -> Option<&ContainerAtom> {
        self.moov.as_ref()
    }

    /// Frame headers of the current mdat in byte order.
    pub fn frames(&self) -> &[FrameHeader] {
        &self.frames
    }

    pub fn in_frame_mode(&self) -> bool {
        self.in_mdat
    }

    /// Sample timescale of the audio or video track, per the current moov.
    pub fn timescale(&self, audio: bool) -> u64 {
        self.moov.as_ref().map_or(1, |moov| index::timescale(moov, audio))
    }

    /// Decode the next atom or frame. `Ok(None)` asks for more bytes with
    /// the buffered bytes kept intact.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<F4vData>, F4vError> {
        if self.in_mdat {
            match self.read_frame(buf)? {
                FrameRead::Frame(frame) => return Ok(Some(F4vData::Frame(frame))),
                FrameRead::NeedData => return Ok(None),
                FrameRead::Finished => {
                    info!("finished reading frames, back to atom mode");
                    self.clear_frames();
                }
            }
        }
        self.read_atom(buf)
    }

    /// Full reset to the pristine state.
    pub fn clear(&mut self) {
        let order_by_timestamp = self.order_by_timestamp;
        let split_raw_frames = self.split_raw_frames;
        *self = Decoder {
            order_by_timestamp,
            split_raw_frames,
            ..Decoder::default()
        };
    }

    fn read_atom(&mut self, buf: &mut BytesMut) -> Result<Option<F4vData>, F4vError> {
        let header =
            match AtomHeader::peek(buf, self.stream_position, buf.len() as u64)? {
                Some(header) => header,
                None => return Ok(None),
            };
        // Never wait for a full mdat: its body is read frame by frame.
        if header.fourcc != FourCc::MDAT && (buf.len() as u64) < header.size {
            debug!(
                atom = %header.fourcc,
                size = header.size,
                buffered = buf.len(),
                "atom not fully buffered yet"
            );
            return Ok(None);
        }

        if header.fourcc == FourCc::MDAT {
            if !self.split_raw_frames && self.moov.is_none() {
                return Err(F4vError::MdatBeforeMoov);
            }
            buf.advance(header.header_len as usize);
            self.stream_position += header.header_len as u64;
            self.in_mdat = true;
            self.mdat_begin = header.position + header.header_len as u64;
            self.mdat_end = header.position + header.size;
            self.mdat_offset = self.mdat_begin;
            self.build_frames();
            debug!(
                begin = self.mdat_begin,
                end = self.mdat_end,
                frames = self.frames.len(),
                "entering frame mode"
            );
            return Ok(Some(F4vData::Atom(Atom {
                extended: header.is_extended(),
                position: header.position,
                body: AtomBody::Mdat(crate::atom::MdatAtom {
                    data_size: header.body_size(),
                }),
            })));
        }

        buf.advance(header.header_len as usize);
        let mut body = buf.split_to(header.body_size() as usize).freeze();
        // On a body error the atom's bytes are already consumed, so the next
        // call resynchronizes at the following atom boundary.
        let atom = Atom::decode(&header, &mut body)?;
        self.stream_position += header.size;

        if let AtomBody::Moov(container) = &atom.body {
            self.moov = Some(container.clone());
            let info = crate::info::extract_movie_info(container);
            info!(?info, "moov decoded");
        }

        Ok(Some(F4vData::Atom(atom)))
    }

    fn build_frames(&mut self) {
        if self.split_raw_frames {
            return;
        }
        let moov = self.moov.as_ref().expect("mdat accepted without moov");
        self.frames = index::merged_frames(moov);

        let mut order: Vec<u32> = (0..self.frames.len() as u32).collect();
        if self.order_by_timestamp {
            order.sort_by_key(|&i| self.frames[i as usize].timestamp_ms());
        }
        self.order = order;
        self.next_frame = 0;
        self.next_order = 0;
        self.prev_frame = None;
        self.cache.clear();
    }

    fn clear_frames(&mut self) {
        self.frames.clear();
        self.order.clear();
        self.next_frame = 0;
        self.next_order = 0;
        self.prev_frame = None;
        self.cache.clear();
        self.in_mdat = false;
        self.mdat_begin = 0;
        self.mdat_end = 0;
        self.mdat_offset = 0;
    }

    fn read_frame(&mut self, buf: &mut BytesMut) -> Result<FrameRead, F4vError> {
        if self.split_raw_frames {
            let size = (self.mdat_end - self.mdat_offset).min(RAW_SPLIT_FRAME_SIZE);
            if size == 0 {
                return Ok(FrameRead::Finished);
            }
            if (buf.len() as u64) < size {
                return Ok(FrameRead::NeedData);
            }
            let header = FrameHeader::raw(self.mdat_offset, size, 0);
            let data = buf.split_to(size as usize).freeze();
            self.mdat_offset += size;
            self.stream_position += size;
            return Ok(FrameRead::Frame(Frame::new(header, data)));
        }

        if !self.order_by_timestamp {
            // Stream order: serve frames exactly as they sit in the file.
            return self.io_read_frame(buf);
        }

        if self.next_order >= self.order.len() {
            return Ok(FrameRead::Finished);
        }
        let target_offset = self.frames[self.order[self.next_order] as usize].offset;

        if let Some(frame) = self.cache.remove(&target_offset) {
            debug!(offset = target_offset, "frame served from cache");
            self.next_order += 1;
            return Ok(FrameRead::Frame(frame));
        }

        loop {
            let frame = match self.io_read_frame(buf)? {
                FrameRead::Frame(frame) => frame,
                FrameRead::NeedData => return Ok(FrameRead::NeedData),
                // Skipped index entries can leave playback targets that no
                // byte read will ever satisfy; the mdat is simply over.
                FrameRead::Finished => return Ok(FrameRead::Finished),
            };
            if frame.header.offset == target_offset {
                self.next_order += 1;
                return Ok(FrameRead::Frame(frame));
            }
            if frame.header.kind == crate::frame::FrameKind::Raw {
                // Gap bytes; forward immediately without advancing the
                // playback cursor.
                return Ok(FrameRead::Frame(frame));
            }
            if self.cache.len() > MAX_FRAME_CACHE_SIZE {
                return Err(F4vError::FrameCacheOverflow(MAX_FRAME_CACHE_SIZE));
            }
            if let Some(old) = self.cache.get(&frame.header.offset) {
                error!(
                    old = %old.header,
                    new = %frame.header,
                    "duplicate frame offset, ignoring the new frame"
                );
                continue;
            }
            debug!(
                offset = frame.header.offset,
                looking_for = target_offset,
                cached = self.cache.len(),
                "caching out-of-order frame"
            );
            self.cache.insert(frame.header.offset, frame);
        }
    }

    /// Read the next frame in byte order, synthesizing raw frames for every
    /// range the index does not correctly account for.
    fn io_read_frame(&mut self, buf: &mut BytesMut) -> Result<FrameRead, F4vError> {
        debug_assert!(self.in_mdat);
        debug_assert!(self.mdat_offset >= self.mdat_begin);
        debug_assert!(self.mdat_offset <= self.mdat_end);

        let header: FrameHeader;
        let advance_to_next: bool;
        loop {
            if self.next_frame >= self.frames.len() {
                if self.mdat_offset >= self.mdat_end {
                    return Ok(FrameRead::Finished);
                }
                // Trailing bytes between the last frame and the mdat end.
                let ts = self.prev_frame.as_ref().map_or(0, |f| f.timestamp_ms());
                header = FrameHeader::raw(self.mdat_offset, self.mdat_end - self.mdat_offset, ts);
                advance_to_next = false;
                warn!(frame = %header, "raw frame before mdat end");
                break;
            }

            let candidate = &self.frames[self.next_frame];
            if candidate.offset < self.mdat_begin {
                error!(frame = %candidate, begin = self.mdat_begin, "frame overlaps mdat begin, skipping");
                self.next_frame += 1;
                continue;
            }
            if candidate.offset >= self.mdat_end {
                error!(frame = %candidate, end = self.mdat_end, "frame beyond mdat end, skipping");
                self.next_frame += 1;
                continue;
            }
            if candidate.offset < self.mdat_offset {
                error!(
                    frame = %candidate,
                    cursor = self.mdat_offset,
                    "overlapping frames, skipping"
                );
                self.next_frame += 1;
                continue;
            }
            if self.mdat_offset < candidate.offset {
                // Unaccounted bytes before the next indexed frame.
                let end = candidate.offset.min(self.mdat_end);
                let ts = self.prev_frame.as_ref().map_or(0, |f| f.timestamp_ms());
                header = FrameHeader::raw(self.mdat_offset, end - self.mdat_offset, ts);
                advance_to_next = false;
                warn!(frame = %header, "raw frame covering index gap");
                break;
            }
            // Cursor exactly on the frame.
            if candidate.end_offset() > self.mdat_end {
                error!(frame = %candidate, end = self.mdat_end, "frame overlaps mdat end");
                header = FrameHeader {
                    size: self.mdat_end - self.mdat_offset,
                    kind: crate::frame::FrameKind::Raw,
                    is_keyframe: false,
                    ..candidate.clone()
                };
                advance_to_next = true;
                break;
            }
            header = candidate.clone();
            advance_to_next = true;
            break;
        }

        if (buf.len() as u64) < header.size {
            return Ok(FrameRead::NeedData);
        }
        let data = buf.split_to(header.size as usize).freeze();
        self.mdat_offset += header.size;
        self.stream_position += header.size;
        self.prev_frame = Some(header.clone());
        if advance_to_next {
            self.next_frame += 1;
        }
        Ok(FrameRead::Frame(Frame::new(header, data)))
    }

    /// Seek to the playback-order frame `frame` (or the nearest preceding
    /// keyframe). Returns the actual frame index and the absolute byte
    /// offset the caller must reposition its byte stream to; any bytes it
    /// still holds buffered are stale and must be dropped.
    pub fn seek_to_frame(
        &mut self,
        frame: u32,
        seek_to_keyframe: bool,
    ) -> Result<(u32, u64), F4vError> {
        if !self.in_mdat {
            return Err(F4vError::SeekNotInFrameMode);
        }
        if frame as usize >= self.order.len() {
            return Err(F4vError::SeekOutOfRange {
                frame,
                count: self.order.len(),
            });
        }
        let mut frame = frame;
        if seek_to_keyframe {
            while frame > 0 && !self.frames[self.order[frame as usize] as usize].is_keyframe {
                frame -= 1;
            }
        }

        self.next_order = frame as usize;
        self.next_frame = self.order[frame as usize] as usize;
        self.mdat_offset = self.frames[self.next_frame].offset;
        self.stream_position = self.mdat_offset;
        self.cache.clear();
        self.prev_frame = None;

        info!(
            frame,
            offset = self.mdat_offset,
            "seek: resume feeding bytes from the returned offset"
        );
        Ok((frame, self.mdat_offset))
    }

    /// Seek to the last frame whose presentation timestamp is <= `time_ms`.
    pub fn seek_to_time(
        &mut self,
        time_ms: i64,
        seek_to_keyframe: bool,
    ) -> Result<(u32, u64), F4vError> {
        if self.order.is_empty() {
            if time_ms == 0 {
                // Already at the beginning of the stream.
                return Ok((0, self.stream_position));
            }
            return Err(F4vError::SeekNotInFrameMode);
        }
        let mut frame_index = 0usize;
        while frame_index < self.order.len()
            && self.frames[self.order[frame_index] as usize].timestamp_ms() <= time_ms
        {
            frame_index += 1;
        }
        let frame_index = frame_index.saturating_sub(1);
        self.seek_to_frame(frame_index as u32, seek_to_keyframe)
    }

    /// Keyframe map of the current mdat: (timestamp_ms, file offset) pairs
    /// in playback order. `None` before any `moov` was seen.
    pub fn generate_cue_point_table(&self) -> Option<Vec<(i64, i64)>> {
        self.moov.as_ref()?;
        let points = self
            .order
            .iter()
            .map(|&i| &self.frames[i as usize])
            .filter(|frame| frame.is_keyframe)
            .map(|frame| (frame.timestamp_ms(), frame.offset as i64))
            .collect();
        Some(points)
    }
}

impl codec::Decoder for Decoder {
    type Item = F4vData;
    type Error = F4vError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<F4vData>, F4vError> {
        Decoder::decode(self, src)
    }
}

/// Async stream of [`F4vData`] over any `AsyncRead`.
pub type F4vDecoderStream<R> = tokio_util::codec::FramedRead<R, Decoder>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;
    use crate::test_support::build_movie_file;

    fn decode_all(bytes: &[u8], chunk: usize) -> Vec<F4vData> {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        let mut fed = 0;
        loop {
            match decoder.decode(&mut buf).expect("decode") {
                Some(data) => out.push(data),
                None => {
                    if fed >= bytes.len() {
                        break;
                    }
                    let end = (fed + chunk).min(bytes.len());
                    buf.extend_from_slice(&bytes[fed..end]);
                    fed = end;
                }
            }
        }
        out
    }

    #[test]
    fn decodes_atoms_then_frames() {
        let file = build_movie_file(&[10, 20, 30], 40, &[0, 2], true);
        let items = decode_all(&file, file.len());

        let atoms: Vec<_> = items
            .iter()
            .filter_map(|d| match d {
                F4vData::Atom(a) => Some(a.fourcc()),
                _ => None,
            })
            .collect();
        assert_eq!(atoms, vec![FourCc::FTYP, FourCc::MOOV, FourCc::MDAT]);

        let frames: Vec<_> = items
            .iter()
            .filter_map(|d| match d {
                F4vData::Frame(f) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].data.len(), 10);
        assert_eq!(frames[1].data.len(), 20);
        assert_eq!(frames[2].data.len(), 30);
        assert!(frames[0].header.is_keyframe);
        assert!(!frames[1].header.is_keyframe);
        assert_eq!(frames[1].header.timestamp_ms(), 40);
        // Payload of sample i is the byte value i.
        assert!(frames[2].data.iter().all(|&b| b == 2));
    }

    #[test]
    fn single_byte_feeding_reaches_the_same_result() {
        let file = build_movie_file(&[10, 20], 33, &[0], true);
        let whole = decode_all(&file, file.len());
        let trickled = decode_all(&file, 1);
        assert_eq!(whole, trickled);
    }

    #[test]
    fn mdat_without_moov_is_an_error() {
        let file = build_movie_file(&[10], 40, &[0], false);
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&file[..]);
        // ftyp decodes fine.
        assert!(matches!(
            decoder.decode(&mut buf),
            Ok(Some(F4vData::Atom(_)))
        ));
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(F4vError::MdatBeforeMoov)
        ));
    }

    #[test]
    fn split_raw_frames_reads_mdat_without_moov() {
        let file = build_movie_file(&[10, 20], 40, &[0], false);
        let mut decoder = Decoder::new();
        decoder.set_split_raw_frames(true);
        let mut buf = BytesMut::from(&file[..]);
        let mut raw_bytes = 0;
        let mut raw_frames = 0;
        while let Some(data) = decoder.decode(&mut buf).expect("decode") {
            if let F4vData::Frame(frame) = data {
                assert_eq!(frame.header.kind, FrameKind::Raw);
                raw_bytes += frame.data.len();
                raw_frames += 1;
            }
        }
        assert_eq!(raw_bytes, 30);
        assert_eq!(raw_frames, 1);
    }

    #[test]
    fn seek_to_time_lands_on_preceding_keyframe() {
        let file = build_movie_file(&[10, 10, 10, 10], 100, &[0, 2], true);
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&file[..]);
        // Run to frame mode.
        loop {
            match decoder.decode(&mut buf).expect("decode") {
                Some(F4vData::Atom(a)) if a.fourcc() == FourCc::MDAT => break,
                Some(_) => {}
                None => panic!("decoder stalled"),
            }
        }
        // ts 150 lies in frame 1; its preceding keyframe is frame 0.
        let (frame, offset) = decoder.seek_to_time(150, true).expect("seek");
        assert_eq!(frame, 0);
        assert_eq!(offset, decoder.frames()[0].offset);

        // ts 250 lies in frame 2, itself a keyframe.
        let (frame, offset) = decoder.seek_to_time(250, true).expect("seek");
        assert_eq!(frame, 2);
        assert_eq!(offset, decoder.frames()[2].offset);
    }

    #[test]
    fn seek_monotonicity() {
        let file = build_movie_file(&[10, 10, 10, 10, 10], 100, &[0], true);
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&file[..]);
        loop {
            match decoder.decode(&mut buf).expect("decode") {
                Some(F4vData::Atom(a)) if a.fourcc() == FourCc::MDAT => break,
                Some(_) => {}
                None => panic!("decoder stalled"),
            }
        }
        let mut last_offset = 0;
        for ts in [0, 100, 250, 400] {
            let (_, offset) = decoder.seek_to_time(ts, false).expect("seek");
            assert!(offset >= last_offset, "offset regressed at ts {ts}");
            last_offset = offset;
        }
    }

    #[test]
    fn cue_point_table_maps_keyframes() {
        let file = build_movie_file(&[10, 10, 10], 100, &[0, 2], true);
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&file[..]);
        loop {
            match decoder.decode(&mut buf).expect("decode") {
                Some(F4vData::Atom(a)) if a.fourcc() == FourCc::MDAT => break,
                Some(_) => {}
                None => panic!("decoder stalled"),
            }
        }
        let table = decoder.generate_cue_point_table().expect("moov present");
        let frames = decoder.frames();
        assert_eq!(
            table,
            vec![
                (0, frames[0].offset as i64),
                (200, frames[2].offset as i64)
            ]
        );
    }

    #[test]
    fn index_gap_degrades_to_raw_frame() {
        // Declare 2 samples but leave a hole: sample sizes 10 + 10 while the
        // chunk offset skips 5 bytes into mdat.
        let file = build_movie_file(&[10, 10], 100, &[0], true);
        // Corrupt: grow mdat by appending 5 trailing bytes not covered by
        // the index.
        let mut bytes = file.to_vec();
        let mdat_size_pos = bytes.len() - 20 - 8; // mdat header position
        let old = u32::from_be_bytes(bytes[mdat_size_pos..mdat_size_pos + 4].try_into().unwrap());
        bytes.splice(bytes.len().., [0xAAu8; 5]);
        bytes[mdat_size_pos..mdat_size_pos + 4].copy_from_slice(&(old + 5).to_be_bytes());

        let items = decode_all(&bytes, bytes.len());
        let frames: Vec<_> = items
            .iter()
            .filter_map(|d| match d {
                F4vData::Frame(f) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].header.kind, FrameKind::Raw);
        assert_eq!(frames[2].data.len(), 5);
        assert!(frames[2].data.iter().all(|&b| b == 0xAA));
    }
}
