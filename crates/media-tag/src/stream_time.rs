use crate::tag::{Tag, TagKind};

/// Tracks stream time and media time for one consumer across source changes.
///
/// Media time restarts at zero on every source-started tag; stream time keeps
/// accumulating across sources, so spacing decisions (keyframe extraction,
/// resume positions) survive upstream switches.
#[derive(Debug, Default)]
pub struct StreamTimeCalculator {
    base_ts: Option<i64>,
    accumulated_ms: i64,
    media_time_ms: i64,
}

impl StreamTimeCalculator {
    pub fn new() -> Self {
        StreamTimeCalculator::default()
    }

    pub fn process_tag(&mut self, tag: &Tag) {
        match tag.kind() {
            TagKind::SourceStarted => {
                self.accumulated_ms += self.media_time_ms;
                self.base_ts = None;
                self.media_time_ms = 0;
            }
            TagKind::AudioFrame | TagKind::VideoFrame | TagKind::RawFrame => {
                let base = *self.base_ts.get_or_insert(tag.timestamp_ms);
                if tag.timestamp_ms >= base {
                    self.media_time_ms = tag.timestamp_ms - base;
                }
            }
            _ => {}
        }
    }

    /// Time within the current source.
    pub fn media_time_ms(&self) -> i64 {
        self.media_time_ms
    }

    /// Time since the first tag, across source changes.
    pub fn stream_time_ms(&self) -> i64 {
        self.accumulated_ms + self.media_time_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flavour::DEFAULT_FLAVOUR_MASK;
    use crate::request::MediaFormat;
    use crate::tag::{MediaFrame, MediaFrameKind, TagPayload};
    use bytes::Bytes;

    fn video(ts: i64) -> Tag {
        Tag::new(
            DEFAULT_FLAVOUR_MASK,
            TagPayload::Frame(MediaFrame {
                kind: MediaFrameKind::Video,
                format: MediaFormat::Flv,
                is_keyframe: false,
                data: Bytes::new(),
            }),
        )
        .with_timestamp(ts)
    }

    #[test]
    fn media_time_restarts_on_source_change() {
        let mut calc = StreamTimeCalculator::new();
        calc.process_tag(&Tag::source_started(DEFAULT_FLAVOUR_MASK, "a", "a"));
        calc.process_tag(&video(1000));
        calc.process_tag(&video(1500));
        assert_eq!(calc.media_time_ms(), 500);
        assert_eq!(calc.stream_time_ms(), 500);

        calc.process_tag(&Tag::source_started(DEFAULT_FLAVOUR_MASK, "b", "b"));
        calc.process_tag(&video(0));
        calc.process_tag(&video(200));
        assert_eq!(calc.media_time_ms(), 200);
        assert_eq!(calc.stream_time_ms(), 700);
    }
}
