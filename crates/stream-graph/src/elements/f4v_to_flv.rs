//! F4V → FLV conversion.
//!
//! Recognizes F4V-typed tags and turns them into FLV tags: `moov` becomes a
//! media-info tag plus AVC/AAC sequence headers, frames become FLV
//! audio/video tags, and every video keyframe is preceded by a cue-point
//! metadata tag with a monotonically increasing number.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use f4v::atom::AtomBody;
use f4v::{ContainerAtom, F4vData, FrameKind};
use media_tag::{
    CuePointData, MediaFormat, MediaFrame, MediaFrameKind, MediaInfo, Request, Tag,
    TagAttributes, TagPayload,
};

use crate::filtering::{FilterFactory, FilteringElement, TagFilter};
use crate::mapper::MapperRef;

pub const ELEMENT_CLASS_NAME: &str = "f4v_to_flv_converter";

const FLV_AVC_KEYFRAME: u8 = 0x17;
const FLV_AVC_INTERFRAME: u8 = 0x27;
const FLV_AAC: u8 = 0xAF;

pub struct F4vToFlvFilter {
    cue_point_number: u32,
}

impl F4vToFlvFilter {
    fn flv_video_tag(frame: &f4v::Frame) -> Bytes {
        let mut data = BytesMut::with_capacity(frame.data.len() + 5);
        data.put_u8(if frame.header.is_keyframe {
            FLV_AVC_KEYFRAME
        } else {
            FLV_AVC_INTERFRAME
        });
        data.put_u8(1); // AVC NALU
        let cts = (frame.header.composition_ts_ms - frame.header.decoding_ts_ms).max(0) as u32;
        data.put_slice(&cts.to_be_bytes()[1..]);
        data.put_slice(&frame.data);
        data.freeze()
    }

    fn flv_audio_tag(frame: &f4v::Frame) -> Bytes {
        let mut data = BytesMut::with_capacity(frame.data.len() + 2);
        data.put_u8(FLV_AAC);
        data.put_u8(1); // AAC raw
        data.put_slice(&frame.data);
        data.freeze()
    }

    /// Sequence headers and the media description derived from a `moov`.
    fn convert_moov(&self, moov: &ContainerAtom, template: &Tag, out: &mut Vec<Tag>) {
        let movie = f4v::extract_movie_info(moov);
        let info = MediaInfo {
            has_audio: movie.has_audio,
            has_video: movie.has_video,
            audio_codec: movie.audio_codec.map(|c| c.to_string()),
            video_codec: movie.video_codec.map(|c| c.to_string()),
            width: movie.width,
            height: movie.height,
            sample_rate: movie.audio_sample_rate,
            duration_ms: movie.duration_ms,
            moov: None,
        };
        out.push(
            Tag::new(template.flavour_mask, TagPayload::MediaInfo(Arc::new(info)))
                .with_attributes(TagAttributes::METADATA)
                .with_timestamp(template.timestamp_ms),
        );

        if let Some(avcc) = find_avcc(moov) {
            let mut data = BytesMut::new();
            data.put_u8(FLV_AVC_KEYFRAME);
            data.put_u8(0); // AVC sequence header
            data.put_slice(&[0, 0, 0]);
            data.put_slice(&avcc.configuration_record());
            out.push(
                Tag::new(
                    template.flavour_mask,
                    TagPayload::Frame(MediaFrame {
                        kind: MediaFrameKind::Video,
                        format: MediaFormat::Flv,
                        is_keyframe: true,
                        data: data.freeze(),
                    }),
                )
                .with_attributes(TagAttributes::CAN_RESYNC.with(TagAttributes::METADATA))
                .with_timestamp(template.timestamp_ms),
            );
        }
    }
}

/// The avcC configuration of the movie's video track, if any.
fn find_avcc(moov: &ContainerAtom) -> Option<&f4v::atom::AvccAtom> {
    let trak = f4v::index::find_trak(moov, false)?;
    let stbl = f4v::index::trak_stbl(trak)?;
    let stsd = stbl.children.iter().find_map(|a| match &a.body {
        AtomBody::Stsd(stsd) => Some(stsd),
        _ => None,
    })?;
    let avc1 = stsd.entries.iter().find_map(|a| match &a.body {
        AtomBody::Avc1(avc1) => Some(avc1),
        _ => None,
    })?;
    avc1.children.iter().find_map(|a| match &a.body {
        AtomBody::Avcc(avcc) => Some(avcc),
        _ => None,
    })
}

impl TagFilter for F4vToFlvFilter {
    fn filter_tag(&mut self, tag: &Tag, out: &mut Vec<Tag>) {
        let TagPayload::F4v(data) = &tag.payload else {
            if matches!(tag.payload, TagPayload::Composed(_)) {
                return;
            }
            out.push(tag.clone());
            return;
        };
        match data.as_ref() {
            F4vData::Atom(atom) => {
                if let AtomBody::Moov(moov) = &atom.body {
                    self.convert_moov(moov, tag, out);
                }
                // Other atoms carry no playable payload.
            }
            F4vData::Frame(frame) => {
                if frame.header.kind == FrameKind::Video && frame.header.is_keyframe {
                    out.push(
                        Tag::new(
                            tag.flavour_mask,
                            TagPayload::CuePoint(Arc::new(CuePointData::Marker {
                                number: self.cue_point_number,
                            })),
                        )
                        .with_attributes(TagAttributes::METADATA)
                        .with_timestamp(tag.timestamp_ms),
                    );
                    self.cue_point_number += 1;
                }
                let (kind, payload) = match frame.header.kind {
                    FrameKind::Video => (MediaFrameKind::Video, Self::flv_video_tag(frame)),
                    FrameKind::Audio => (MediaFrameKind::Audio, Self::flv_audio_tag(frame)),
                    FrameKind::Raw => (MediaFrameKind::Raw, frame.data.clone()),
                };
                out.push(
                    Tag::new(
                        tag.flavour_mask,
                        TagPayload::Frame(MediaFrame {
                            kind,
                            format: MediaFormat::Flv,
                            is_keyframe: frame.header.is_keyframe,
                            data: payload,
                        }),
                    )
                    .with_attributes(tag.attributes)
                    .with_timestamp(tag.timestamp_ms),
                );
            }
        }
    }
}

pub struct F4vToFlvFactory;

impl FilterFactory for F4vToFlvFactory {
    type Filter = F4vToFlvFilter;

    fn class_name(&self) -> &'static str {
        ELEMENT_CLASS_NAME
    }

    fn create_filter(&self, _media: &str, _req: &Request) -> Option<F4vToFlvFilter> {
        Some(F4vToFlvFilter {
            cue_point_number: 0,
        })
    }
}

pub type F4vToFlvConverterElement = FilteringElement<F4vToFlvFactory>;

pub fn new_f4v_to_flv_element(
    name: impl Into<String>,
    mapper: MapperRef,
) -> Arc<F4vToFlvConverterElement> {
    FilteringElement::new(name, mapper, F4vToFlvFactory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use f4v::{Frame, FrameHeader};
    use media_tag::{DEFAULT_FLAVOUR_MASK, TagKind};

    fn f4v_video_tag(ts: i64, keyframe: bool) -> Tag {
        let header = FrameHeader {
            offset: 0,
            size: 4,
            decoding_ts_ms: ts,
            composition_ts_ms: ts,
            duration_ms: 40,
            sample_index: 0,
            kind: FrameKind::Video,
            is_keyframe: keyframe,
        };
        Tag::new(
            DEFAULT_FLAVOUR_MASK,
            TagPayload::F4v(Arc::new(F4vData::Frame(Frame::new(
                header,
                Bytes::from_static(&[1, 2, 3, 4]),
            )))),
        )
        .with_attributes(if keyframe {
            TagAttributes::CAN_RESYNC
        } else {
            TagAttributes::empty()
        })
        .with_timestamp(ts)
    }

    #[test]
    fn keyframe_emits_cue_point_then_flv_tag() {
        let mut filter = F4vToFlvFactory.create_filter("", &Request::new()).unwrap();
        let mut out = Vec::new();
        filter.filter_tag(&f4v_video_tag(0, true), &mut out);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind(), TagKind::CuePoint);
        assert_eq!(out[0].timestamp_ms, 0);
        assert_eq!(out[0].flavour_mask, DEFAULT_FLAVOUR_MASK);
        match &out[0].payload {
            TagPayload::CuePoint(cue) => {
                assert_eq!(**cue, CuePointData::Marker { number: 0 })
            }
            other => panic!("expected cue point, got {other:?}"),
        }

        assert_eq!(out[1].kind(), TagKind::VideoFrame);
        assert!(out[1].can_resync());
        match &out[1].payload {
            TagPayload::Frame(frame) => {
                assert_eq!(frame.format, MediaFormat::Flv);
                assert!(frame.is_keyframe);
                assert_eq!(frame.data[0], FLV_AVC_KEYFRAME);
            }
            other => panic!("expected FLV frame, got {other:?}"),
        }
    }

    #[test]
    fn cue_point_numbers_are_monotonic() {
        let mut filter = F4vToFlvFactory.create_filter("", &Request::new()).unwrap();
        let mut numbers = Vec::new();
        for ts in [0, 1000, 2000] {
            let mut out = Vec::new();
            filter.filter_tag(&f4v_video_tag(ts, true), &mut out);
            if let TagPayload::CuePoint(cue) = &out[0].payload {
                if let CuePointData::Marker { number } = **cue {
                    numbers.push(number);
                }
            }
        }
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    #[test]
    fn interframes_convert_without_cue_points() {
        let mut filter = F4vToFlvFactory.create_filter("", &Request::new()).unwrap();
        let mut out = Vec::new();
        filter.filter_tag(&f4v_video_tag(40, false), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind(), TagKind::VideoFrame);
        match &out[0].payload {
            TagPayload::Frame(frame) => assert_eq!(frame.data[0], FLV_AVC_INTERFRAME),
            other => panic!("expected FLV frame, got {other:?}"),
        }
    }

    #[test]
    fn non_f4v_tags_pass_through() {
        let mut filter = F4vToFlvFactory.create_filter("", &Request::new()).unwrap();
        let mut out = Vec::new();
        let source = Tag::source_started(DEFAULT_FLAVOUR_MASK, "a/b", "a");
        filter.filter_tag(&source, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], source);
    }
}
