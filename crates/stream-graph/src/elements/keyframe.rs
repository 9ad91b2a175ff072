//! Keyframe extraction: only video keyframes pass, with a minimum spacing
//! in stream time; interframes always dropped, audio optionally.

use media_tag::{Request, StreamTimeCalculator, Tag};

use crate::filtering::{FilterFactory, FilteringElement, TagFilter};
use crate::mapper::MapperRef;

pub const ELEMENT_CLASS_NAME: &str = "keyframe";

pub struct KeyFrameFilter {
    ms_between_video_frames: i64,
    drop_audio: bool,
    stream_time: StreamTimeCalculator,
    last_keyframe_ts: i64,
}

impl TagFilter for KeyFrameFilter {
    fn filter_tag(&mut self, tag: &Tag, out: &mut Vec<Tag>) {
        self.stream_time.process_tag(tag);
        let tag_ts = self.stream_time.stream_time_ms();

        if tag.is_audio_tag() && self.drop_audio {
            return;
        }
        if tag.is_video_tag() && !tag.can_resync() {
            return;
        }
        // Keyframes that come too fast are thinned out.
        if tag.is_video_tag()
            && tag.can_resync()
            && tag_ts - self.last_keyframe_ts < self.ms_between_video_frames
        {
            return;
        }

        out.push(tag.clone());
        if tag.is_video_tag() {
            self.last_keyframe_ts = tag_ts;
        }
    }
}

pub struct KeyFrameFactory {
    pub ms_between_video_frames: i64,
    pub drop_audio: bool,
}

impl FilterFactory for KeyFrameFactory {
    type Filter = KeyFrameFilter;

    fn class_name(&self) -> &'static str {
        ELEMENT_CLASS_NAME
    }

    fn create_filter(&self, _media: &str, _req: &Request) -> Option<KeyFrameFilter> {
        Some(KeyFrameFilter {
            ms_between_video_frames: self.ms_between_video_frames,
            drop_audio: self.drop_audio,
            stream_time: StreamTimeCalculator::new(),
            last_keyframe_ts: 0,
        })
    }
}

pub type KeyFrameExtractorElement = FilteringElement<KeyFrameFactory>;

pub fn new_keyframe_element(
    name: impl Into<String>,
    mapper: MapperRef,
    ms_between_video_frames: i64,
    drop_audio: bool,
) -> std::sync::Arc<KeyFrameExtractorElement> {
    FilteringElement::new(
        name,
        mapper,
        KeyFrameFactory {
            ms_between_video_frames,
            drop_audio,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{audio_tag, video_tag};

    fn filter() -> KeyFrameFilter {
        KeyFrameFactory {
            ms_between_video_frames: 500,
            drop_audio: true,
        }
        .create_filter("", &Request::new())
        .unwrap()
    }

    #[test]
    fn thins_keyframes_and_drops_the_rest() {
        let mut f = filter();
        let mut out = Vec::new();

        // The very first keyframe at ts 0 is too close to the initial mark.
        for (ts, key) in [(0, true), (100, false), (600, true), (800, true), (1200, true)] {
            f.filter_tag(&video_tag(ts, key), &mut out);
        }
        let timestamps: Vec<i64> = out.iter().map(|t| t.timestamp_ms).collect();
        assert_eq!(timestamps, vec![600, 1200]);

        out.clear();
        f.filter_tag(&audio_tag(1300), &mut out);
        assert!(out.is_empty());
    }
}
