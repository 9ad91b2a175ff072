//! Tag serializers: turn tag streams back into container bytes for sinks
//! that speak to the outside world (the HTTP poster, the saving element).

use bytes::{BufMut, BytesMut};
use media_tag::{MediaFormat, MediaFrameKind, Tag, TagPayload};

pub trait TagSerializer: Send + 'static {
    /// Emit any stream preamble.
    fn initialize(&mut self, out: &mut BytesMut);

    fn serialize(&mut self, tag: &Tag, out: &mut BytesMut);

    fn content_type(&self) -> &'static str;
}

/// Frame payload bytes, verbatim, nothing else.
pub struct RawTagSerializer;

impl TagSerializer for RawTagSerializer {
    fn initialize(&mut self, _out: &mut BytesMut) {}

    fn serialize(&mut self, tag: &Tag, out: &mut BytesMut) {
        match &tag.payload {
            TagPayload::Frame(frame) => out.put_slice(&frame.data),
            TagPayload::F4v(data) => {
                if let f4v::F4vData::Frame(frame) = data.as_ref() {
                    out.put_slice(&frame.data);
                }
            }
            _ => {}
        }
    }

    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }
}

/// FLV file framing around FLV-formatted frames: the 9-byte header, then
/// 11-byte tag headers and previous-tag-size trailers.
pub struct FlvTagSerializer {
    wrote_header: bool,
}

impl FlvTagSerializer {
    pub fn new() -> Self {
        FlvTagSerializer {
            wrote_header: false,
        }
    }
}

impl Default for FlvTagSerializer {
    fn default() -> Self {
        FlvTagSerializer::new()
    }
}

impl TagSerializer for FlvTagSerializer {
    fn initialize(&mut self, out: &mut BytesMut) {
        if self.wrote_header {
            return;
        }
        self.wrote_header = true;
        out.put_slice(b"FLV\x01");
        out.put_u8(0b0000_0101); // audio + video
        out.put_u32(9);
        out.put_u32(0); // previous tag size
    }

    fn serialize(&mut self, tag: &Tag, out: &mut BytesMut) {
        let TagPayload::Frame(frame) = &tag.payload else {
            return;
        };
        if frame.format != MediaFormat::Flv {
            return;
        }
        let tag_type: u8 = match frame.kind {
            MediaFrameKind::Audio => 8,
            MediaFrameKind::Video => 9,
            MediaFrameKind::Raw => return,
        };
        if !self.wrote_header {
            self.initialize(out);
        }
        let size = frame.data.len() as u32;
        let ts = tag.timestamp_ms.clamp(0, u32::MAX as i64) as u32;
        out.put_u8(tag_type);
        out.put_slice(&size.to_be_bytes()[1..]);
        out.put_slice(&ts.to_be_bytes()[1..]);
        out.put_u8((ts >> 24) as u8);
        out.put_slice(&[0, 0, 0]); // stream id
        out.put_slice(&frame.data);
        out.put_u32(11 + size);
    }

    fn content_type(&self) -> &'static str {
        "video/x-flv"
    }
}

pub fn serializer_for(format: MediaFormat) -> Box<dyn TagSerializer> {
    match format {
        MediaFormat::Flv => Box::new(FlvTagSerializer::new()),
        _ => Box::new(RawTagSerializer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::video_tag;

    #[test]
    fn flv_framing_is_well_formed() {
        let mut serializer = FlvTagSerializer::new();
        let mut out = BytesMut::new();
        serializer.initialize(&mut out);
        assert_eq!(&out[..4], b"FLV\x01");
        assert_eq!(out.len(), 13);

        let tag = video_tag(0x010203, true);
        serializer.serialize(&tag, &mut out);
        // Tag header: type 9, 2-byte payload, the 24+8 bit timestamp split.
        assert_eq!(out[13], 9);
        assert_eq!(&out[14..17], &[0, 0, 2]);
        assert_eq!(&out[17..20], &[0x01, 0x02, 0x03]);
        assert_eq!(out[20], 0x00);
        // Previous tag size closes the record.
        let prev = u32::from_be_bytes(out[out.len() - 4..].try_into().unwrap());
        assert_eq!(prev, 13);
    }
}
