use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::flavour::FlavourMask;
use crate::media_info::MediaInfo;

/// Attribute bits carried by every tag.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct TagAttributes(u8);

impl TagAttributes {
    /// Safe splice point: a decoder can start cleanly from this tag.
    pub const CAN_RESYNC: TagAttributes = TagAttributes(0b001);
    /// The tag may be discarded under pressure without corrupting playback.
    pub const DROPPABLE: TagAttributes = TagAttributes(0b010);
    /// The tag carries metadata rather than media samples.
    pub const METADATA: TagAttributes = TagAttributes(0b100);

    pub const fn empty() -> Self {
        TagAttributes(0)
    }

    pub const fn with(self, other: TagAttributes) -> Self {
        TagAttributes(self.0 | other.0)
    }

    pub const fn has(self, other: TagAttributes) -> bool {
        self.0 & other.0 != 0
    }
}

impl fmt::Debug for TagAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.has(Self::CAN_RESYNC) {
            parts.push("resync");
        }
        if self.has(Self::DROPPABLE) {
            parts.push("droppable");
        }
        if self.has(Self::METADATA) {
            parts.push("metadata");
        }
        write!(f, "TagAttributes[{}]", parts.join("|"))
    }
}

/// The kind of a tag, derived from its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKind {
    SourceStarted,
    SourceEnded,
    EndOfStream,
    Composed,
    MediaInfo,
    CuePoint,
    AudioFrame,
    VideoFrame,
    RawFrame,
    ContainerAtom,
    BootstrapBegin,
    BootstrapEnd,
    Flush,
}

/// Payload of a source-started / source-ended control tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceChange {
    /// The media path the stream is served under.
    pub path: String,
    /// Name of the element that originates the stream.
    pub source_element_name: String,
}

/// Kind of a generic media frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFrameKind {
    Audio,
    Video,
    Raw,
}

/// A generic frame: FLV tags, raw byte runs and other non-F4V media travel
/// in this shape.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFrame {
    pub kind: MediaFrameKind,
    pub format: crate::request::MediaFormat,
    pub is_keyframe: bool,
    pub data: Bytes,
}

/// Cue point payloads: either a single numbered marker emitted in front of a
/// keyframe, or a full seek table mapping timestamps to file offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CuePointData {
    Marker { number: u32 },
    Table { points: Vec<(i64, i64)> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TagPayload {
    SourceStarted(Arc<SourceChange>),
    SourceEnded(Arc<SourceChange>),
    /// End of stream. `forced` marks an EOS generated by a closing element
    /// rather than by the source running out.
    EndOfStream { forced: bool },
    Flush,
    BootstrapBegin,
    BootstrapEnd,
    Composed(Arc<Vec<Tag>>),
    MediaInfo(Arc<MediaInfo>),
    CuePoint(Arc<CuePointData>),
    /// An F4V container atom or an indexed F4V frame.
    F4v(Arc<f4v::F4vData>),
    Frame(MediaFrame),
}

/// The atomic unit of streaming.
///
/// Tags are immutable values; every payload is behind `Arc` or `Bytes`, so
/// `Clone` is cheap and sharing a tag between fan-out lanes never copies
/// media bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub attributes: TagAttributes,
    pub flavour_mask: FlavourMask,
    pub timestamp_ms: i64,
    pub duration_ms: i64,
    pub payload: TagPayload,
}

impl Tag {
    pub fn new(flavour_mask: FlavourMask, payload: TagPayload) -> Self {
        Tag {
            attributes: TagAttributes::empty(),
            flavour_mask,
            timestamp_ms: 0,
            duration_ms: 0,
            payload,
        }
    }

    pub fn with_attributes(mut self, attributes: TagAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Clone with a narrowed flavour mask.
    pub fn with_flavour_mask(&self, flavour_mask: FlavourMask) -> Tag {
        let mut tag = self.clone();
        tag.flavour_mask = flavour_mask;
        tag
    }

    /// A forced or natural end-of-stream tag.
    pub fn eos(flavour_mask: FlavourMask, forced: bool) -> Tag {
        Tag::new(flavour_mask, TagPayload::EndOfStream { forced })
    }

    pub fn source_started(flavour_mask: FlavourMask, path: &str, element: &str) -> Tag {
        Tag::new(
            flavour_mask,
            TagPayload::SourceStarted(Arc::new(SourceChange {
                path: path.to_string(),
                source_element_name: element.to_string(),
            })),
        )
    }

    pub fn source_ended(flavour_mask: FlavourMask, path: &str, element: &str) -> Tag {
        Tag::new(
            flavour_mask,
            TagPayload::SourceEnded(Arc::new(SourceChange {
                path: path.to_string(),
                source_element_name: element.to_string(),
            })),
        )
    }

    pub fn kind(&self) -> TagKind {
        match &self.payload {
            TagPayload::SourceStarted(_) => TagKind::SourceStarted,
            TagPayload::SourceEnded(_) => TagKind::SourceEnded,
            TagPayload::EndOfStream { .. } => TagKind::EndOfStream,
            TagPayload::Flush => TagKind::Flush,
            TagPayload::BootstrapBegin => TagKind::BootstrapBegin,
            TagPayload::BootstrapEnd => TagKind::BootstrapEnd,
            TagPayload::Composed(_) => TagKind::Composed,
            TagPayload::MediaInfo(_) => TagKind::MediaInfo,
            TagPayload::CuePoint(_) => TagKind::CuePoint,
            TagPayload::F4v(data) => match data.as_ref() {
                f4v::F4vData::Atom(_) => TagKind::ContainerAtom,
                f4v::F4vData::Frame(frame) => match frame.header.kind {
                    f4v::FrameKind::Audio => TagKind::AudioFrame,
                    f4v::FrameKind::Video => TagKind::VideoFrame,
                    f4v::FrameKind::Raw => TagKind::RawFrame,
                },
            },
            TagPayload::Frame(frame) => match frame.kind {
                MediaFrameKind::Audio => TagKind::AudioFrame,
                MediaFrameKind::Video => TagKind::VideoFrame,
                MediaFrameKind::Raw => TagKind::RawFrame,
            },
        }
    }

    pub fn is_audio_tag(&self) -> bool {
        self.kind() == TagKind::AudioFrame
    }

    pub fn is_video_tag(&self) -> bool {
        self.kind() == TagKind::VideoFrame
    }

    pub fn is_eos(&self) -> bool {
        self.kind() == TagKind::EndOfStream
    }

    pub fn can_resync(&self) -> bool {
        self.attributes.has(TagAttributes::CAN_RESYNC)
    }

    pub fn is_metadata(&self) -> bool {
        self.attributes.has(TagAttributes::METADATA)
    }

    /// The source-change payload, for source-started / source-ended tags.
    pub fn source_change(&self) -> Option<&SourceChange> {
        match &self.payload {
            TagPayload::SourceStarted(change) | TagPayload::SourceEnded(change) => Some(change),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flavour::DEFAULT_FLAVOUR_MASK;

    #[test]
    fn narrowing_clones_and_preserves_payload() {
        let tag = Tag::source_started(FlavourMask::new(0b11), "a/b", "a").with_timestamp(42);
        let narrowed = tag.with_flavour_mask(FlavourMask::single(1));
        assert_eq!(narrowed.flavour_mask, FlavourMask::single(1));
        assert_eq!(narrowed.timestamp_ms, 42);
        assert_eq!(tag.flavour_mask, FlavourMask::new(0b11));
        assert_eq!(tag.source_change().unwrap().path, "a/b");
    }

    #[test]
    fn kind_follows_payload() {
        assert_eq!(
            Tag::eos(DEFAULT_FLAVOUR_MASK, true).kind(),
            TagKind::EndOfStream
        );
        let frame = Tag::new(
            DEFAULT_FLAVOUR_MASK,
            TagPayload::Frame(MediaFrame {
                kind: MediaFrameKind::Video,
                format: crate::request::MediaFormat::Flv,
                is_keyframe: true,
                data: Bytes::from_static(b"\x17\x01"),
            }),
        );
        assert_eq!(frame.kind(), TagKind::VideoFrame);
    }

    #[test]
    fn attribute_bits() {
        let attrs = TagAttributes::CAN_RESYNC.with(TagAttributes::METADATA);
        assert!(attrs.has(TagAttributes::CAN_RESYNC));
        assert!(attrs.has(TagAttributes::METADATA));
        assert!(!attrs.has(TagAttributes::DROPPABLE));
    }
}
