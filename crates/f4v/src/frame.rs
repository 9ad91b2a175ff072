use std::fmt;

use bytes::Bytes;

/// What kind of samples a frame carries. Raw frames cover byte ranges the
/// sample tables do not account for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Audio,
    Video,
    Raw,
}

/// Everything the sample tables say about one frame, before its bytes are
/// read from `mdat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Absolute file offset of the first payload byte.
    pub offset: u64,
    pub size: u64,
    pub decoding_ts_ms: i64,
    pub composition_ts_ms: i64,
    pub duration_ms: i64,
    /// Index of the sample within its track.
    pub sample_index: u32,
    pub kind: FrameKind,
    pub is_keyframe: bool,
}

impl FrameHeader {
    pub fn raw(offset: u64, size: u64, timestamp_ms: i64) -> Self {
        FrameHeader {
            offset,
            size,
            decoding_ts_ms: timestamp_ms,
            composition_ts_ms: timestamp_ms,
            duration_ms: 0,
            sample_index: 0,
            kind: FrameKind::Raw,
            is_keyframe: false,
        }
    }

    /// Presentation timestamp; playback ordering uses this.
    pub fn timestamp_ms(&self) -> i64 {
        self.composition_ts_ms
    }

    pub fn end_offset(&self) -> u64 {
        self.offset + self.size
    }
}

impl fmt::Display for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} frame #{} @{}+{} ts: {}ms{}",
            self.kind,
            self.sample_index,
            self.offset,
            self.size,
            self.composition_ts_ms,
            if self.is_keyframe { " key" } else { "" }
        )
    }
}

/// A frame header together with its payload bytes from `mdat`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: FrameHeader,
    pub data: Bytes,
}

impl Frame {
    pub fn new(header: FrameHeader, data: Bytes) -> Self {
        Frame { header, data }
    }
}
