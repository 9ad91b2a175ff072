//! Splitting: turn raw byte runs into typed tags through a codec splitter.
//!
//! The input side is bounded; a stream that exceeds the configured buffer
//! limit without producing a tag is poisoned and dropped rather than
//! allowed to grow without bound.

use std::sync::Arc;

use bytes::BytesMut;
use f4v::{F4vData, FrameKind};
use media_tag::{
    FlavourMask, MediaFormat, Request, Tag, TagAttributes, TagPayload,
};
use tracing::{error, warn};

use crate::filtering::{FilterFactory, FilteringElement, TagFilter};
use crate::mapper::MapperRef;

pub const ELEMENT_CLASS_NAME: &str = "splitting";

pub const DEFAULT_MAX_TAG_SIZE: usize = 4 << 20;

/// Wrap a decoded F4V unit into a tag, deriving timestamps and attributes.
pub(crate) fn tag_from_f4v(data: F4vData, flavours: FlavourMask) -> Tag {
    let (attributes, timestamp_ms, duration_ms) = match &data {
        F4vData::Atom(atom) => {
            let attrs = if atom.fourcc() == f4v::FourCc::MOOV {
                TagAttributes::METADATA
            } else {
                TagAttributes::empty()
            };
            (attrs, 0, 0)
        }
        F4vData::Frame(frame) => {
            let attrs = match frame.header.kind {
                FrameKind::Video if frame.header.is_keyframe => TagAttributes::CAN_RESYNC,
                FrameKind::Video => TagAttributes::empty(),
                FrameKind::Audio => TagAttributes::CAN_RESYNC,
                FrameKind::Raw => TagAttributes::DROPPABLE,
            };
            (attrs, frame.header.timestamp_ms(), frame.header.duration_ms)
        }
    };
    let mut tag = Tag::new(flavours, TagPayload::F4v(Arc::new(data)))
        .with_attributes(attributes)
        .with_timestamp(timestamp_ms);
    tag.duration_ms = duration_ms;
    tag
}

/// A codec-specific splitter: consumes buffered bytes, emits typed tags.
pub trait TagSplitter: Send + 'static {
    fn split(&mut self, buf: &mut BytesMut, flavours: FlavourMask, out: &mut Vec<Tag>) -> bool;
}

/// F4V bytes → atom/frame tags.
pub struct F4vSplitter {
    decoder: f4v::Decoder,
}

impl F4vSplitter {
    pub fn new() -> Self {
        F4vSplitter {
            decoder: f4v::Decoder::new(),
        }
    }
}

impl Default for F4vSplitter {
    fn default() -> Self {
        F4vSplitter::new()
    }
}

impl TagSplitter for F4vSplitter {
    fn split(&mut self, buf: &mut BytesMut, flavours: FlavourMask, out: &mut Vec<Tag>) -> bool {
        loop {
            match self.decoder.decode(buf) {
                Ok(Some(data)) => out.push(tag_from_f4v(data, flavours)),
                Ok(None) => return true,
                Err(e) => {
                    error!(error = %e, "splitter decode error");
                    return false;
                }
            }
        }
    }
}

/// Passthrough splitter: every byte run becomes one raw frame tag.
pub struct RawSplitter;

impl TagSplitter for RawSplitter {
    fn split(&mut self, buf: &mut BytesMut, flavours: FlavourMask, out: &mut Vec<Tag>) -> bool {
        if buf.is_empty() {
            return true;
        }
        let data = buf.split().freeze();
        out.push(
            Tag::new(
                flavours,
                TagPayload::Frame(media_tag::MediaFrame {
                    kind: media_tag::MediaFrameKind::Raw,
                    format: MediaFormat::Raw,
                    is_keyframe: false,
                    data,
                }),
            )
            .with_attributes(TagAttributes::DROPPABLE),
        );
        true
    }
}

pub fn splitter_for(format: MediaFormat) -> Box<dyn TagSplitter> {
    match format {
        MediaFormat::F4v => Box::new(F4vSplitter::new()),
        _ => Box::new(RawSplitter),
    }
}

pub struct SplittingFilter {
    splitter: Box<dyn TagSplitter>,
    buf: BytesMut,
    max_tag_size: usize,
    poisoned: bool,
}

impl TagFilter for SplittingFilter {
    fn filter_tag(&mut self, tag: &Tag, out: &mut Vec<Tag>) {
        if self.poisoned {
            return;
        }
        let TagPayload::Frame(frame) = &tag.payload else {
            // Control tags flow through untouched.
            out.push(tag.clone());
            return;
        };
        self.buf.extend_from_slice(&frame.data);
        if !self.splitter.split(&mut self.buf, tag.flavour_mask, out) {
            self.poisoned = true;
            self.buf.clear();
            return;
        }
        if self.buf.len() > self.max_tag_size {
            warn!(
                buffered = self.buf.len(),
                limit = self.max_tag_size,
                "splitter input exceeded the tag size bound, dropping stream"
            );
            self.poisoned = true;
            self.buf.clear();
        }
    }
}

pub struct SplittingFactory {
    pub format: MediaFormat,
    pub max_tag_size: usize,
}

impl FilterFactory for SplittingFactory {
    type Filter = SplittingFilter;

    fn class_name(&self) -> &'static str {
        ELEMENT_CLASS_NAME
    }

    fn create_filter(&self, _media: &str, _req: &Request) -> Option<SplittingFilter> {
        Some(SplittingFilter {
            splitter: splitter_for(self.format),
            buf: BytesMut::new(),
            max_tag_size: self.max_tag_size,
            poisoned: false,
        })
    }
}

pub type SplittingElement = FilteringElement<SplittingFactory>;

pub fn new_splitting_element(
    name: impl Into<String>,
    mapper: MapperRef,
    format: MediaFormat,
    max_tag_size: usize,
) -> Arc<SplittingElement> {
    FilteringElement::new(
        name,
        mapper,
        SplittingFactory {
            format,
            max_tag_size,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use f4v::test_support::build_movie_file;
    use media_tag::{DEFAULT_FLAVOUR_MASK, MediaFrame, MediaFrameKind, TagKind};

    fn raw_tag(data: Bytes) -> Tag {
        Tag::new(
            DEFAULT_FLAVOUR_MASK,
            TagPayload::Frame(MediaFrame {
                kind: MediaFrameKind::Raw,
                format: MediaFormat::Raw,
                is_keyframe: false,
                data,
            }),
        )
    }

    #[test]
    fn f4v_bytes_become_typed_tags() {
        let file = build_movie_file(&[10, 20], 40, &[0], true);
        let mut filter = SplittingFactory {
            format: MediaFormat::F4v,
            max_tag_size: DEFAULT_MAX_TAG_SIZE,
        }
        .create_filter("", &Request::new())
        .unwrap();

        let mut out = Vec::new();
        // Feed in two arbitrary pieces; the splitter buffers across them.
        let half = file.len() / 2;
        filter.filter_tag(&raw_tag(file.slice(..half)), &mut out);
        filter.filter_tag(&raw_tag(file.slice(half..)), &mut out);

        let kinds: Vec<TagKind> = out.iter().map(Tag::kind).collect();
        assert_eq!(
            kinds,
            vec![
                TagKind::ContainerAtom, // ftyp
                TagKind::ContainerAtom, // moov
                TagKind::ContainerAtom, // mdat
                TagKind::VideoFrame,
                TagKind::VideoFrame,
            ]
        );
        assert!(out[3].can_resync());
        assert!(!out[4].can_resync());
        assert_eq!(out[4].timestamp_ms, 40);
    }

    #[test]
    fn oversized_input_poisons_the_stream() {
        let mut filter = SplittingFactory {
            format: MediaFormat::F4v,
            max_tag_size: 64,
        }
        .create_filter("", &Request::new())
        .unwrap();

        // An atom header promising far more data than the bound allows.
        let mut junk = vec![0x00, 0x01, 0x00, 0x00];
        junk.extend_from_slice(b"free");
        junk.resize(128, 0);

        let mut out = Vec::new();
        filter.filter_tag(&raw_tag(Bytes::from(junk)), &mut out);
        assert!(out.is_empty());

        // Everything after the poisoning is dropped.
        filter.filter_tag(&raw_tag(Bytes::from_static(&[0u8; 16])), &mut out);
        assert!(out.is_empty());
    }
}
