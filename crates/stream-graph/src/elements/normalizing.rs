//! Timestamp normalization.
//!
//! Upstream switches splice streams with unrelated timelines. The
//! normalizer rebases each new segment so the output timeline continues
//! where the previous segment ended, clamps regressions so timestamps are
//! monotonically non-decreasing per stream, and optionally bounds how far
//! ahead of wall clock the stream may run.

use media_tag::{Request, Tag, TagKind};
use tokio::time::Instant;
use tracing::debug;

use crate::filtering::{FilterFactory, FilteringElement, TagFilter};
use crate::mapper::MapperRef;

pub const ELEMENT_CLASS_NAME: &str = "normalizing";

/// The timestamp rewriting state for one stream.
#[derive(Debug)]
pub struct TagNormalizer {
    /// Offset applied to incoming timestamps.
    offset_ms: i64,
    last_out_ms: i64,
    saw_any_frame: bool,
    new_segment: bool,
    write_ahead_ms: i64,
    started_at: Option<Instant>,
}

impl TagNormalizer {
    pub fn new(write_ahead_ms: i64) -> Self {
        TagNormalizer {
            offset_ms: 0,
            last_out_ms: 0,
            saw_any_frame: false,
            new_segment: true,
            write_ahead_ms,
            started_at: None,
        }
    }

    /// Rewrite the tag's timestamp in place.
    pub fn process(&mut self, tag: &mut Tag) {
        match tag.kind() {
            TagKind::SourceStarted => {
                self.new_segment = true;
                tag.timestamp_ms = self.last_out_ms;
            }
            TagKind::SourceEnded | TagKind::EndOfStream | TagKind::Flush => {
                tag.timestamp_ms = self.last_out_ms;
            }
            TagKind::AudioFrame
            | TagKind::VideoFrame
            | TagKind::RawFrame
            | TagKind::CuePoint
            | TagKind::MediaInfo
            | TagKind::ContainerAtom => {
                if self.new_segment {
                    // The first timed tag of a segment defines its base; the
                    // output timeline continues from where we left off.
                    self.offset_ms = if self.saw_any_frame {
                        self.last_out_ms - tag.timestamp_ms
                    } else {
                        -tag.timestamp_ms
                    };
                    if self.saw_any_frame {
                        debug!(offset = self.offset_ms, "rebasing new segment");
                    }
                    self.new_segment = false;
                }
                self.saw_any_frame = true;
                let mut out = tag.timestamp_ms + self.offset_ms;
                if out < self.last_out_ms {
                    // Monotonicity beats fidelity for spliced timelines.
                    out = self.last_out_ms;
                }
                if self.write_ahead_ms > 0 {
                    let started = *self.started_at.get_or_insert_with(Instant::now);
                    let wall_ms = started.elapsed().as_millis() as i64;
                    if out > wall_ms + self.write_ahead_ms {
                        out = wall_ms + self.write_ahead_ms;
                        if out < self.last_out_ms {
                            out = self.last_out_ms;
                        }
                    }
                }
                tag.timestamp_ms = out;
                self.last_out_ms = out;
            }
            _ => {}
        }
    }

    pub fn last_timestamp_ms(&self) -> i64 {
        self.last_out_ms
    }
}

pub struct NormalizingFilter {
    normalizer: TagNormalizer,
}

impl TagFilter for NormalizingFilter {
    fn filter_tag(&mut self, tag: &Tag, out: &mut Vec<Tag>) {
        let mut tag = tag.clone();
        self.normalizer.process(&mut tag);
        out.push(tag);
    }
}

pub struct NormalizingFactory {
    pub write_ahead_ms: i64,
}

impl FilterFactory for NormalizingFactory {
    type Filter = NormalizingFilter;

    fn class_name(&self) -> &'static str {
        ELEMENT_CLASS_NAME
    }

    fn create_filter(&self, _media: &str, _req: &Request) -> Option<NormalizingFilter> {
        Some(NormalizingFilter {
            normalizer: TagNormalizer::new(self.write_ahead_ms),
        })
    }
}

pub type NormalizingElement = FilteringElement<NormalizingFactory>;

pub fn new_normalizing_element(
    name: impl Into<String>,
    mapper: MapperRef,
    write_ahead_ms: i64,
) -> std::sync::Arc<NormalizingElement> {
    FilteringElement::new(name, mapper, NormalizingFactory { write_ahead_ms })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::video_tag;
    use media_tag::DEFAULT_FLAVOUR_MASK;

    fn run(normalizer: &mut TagNormalizer, tag: Tag) -> i64 {
        let mut tag = tag;
        normalizer.process(&mut tag);
        tag.timestamp_ms
    }

    #[test]
    fn first_segment_starts_at_zero() {
        let mut normalizer = TagNormalizer::new(0);
        run(
            &mut normalizer,
            Tag::source_started(DEFAULT_FLAVOUR_MASK, "a", "a"),
        );
        assert_eq!(run(&mut normalizer, video_tag(5000, true)), 0);
        assert_eq!(run(&mut normalizer, video_tag(5040, false)), 40);
    }

    #[test]
    fn segments_are_stitched_continuously() {
        let mut normalizer = TagNormalizer::new(0);
        run(
            &mut normalizer,
            Tag::source_started(DEFAULT_FLAVOUR_MASK, "a", "a"),
        );
        run(&mut normalizer, video_tag(0, true));
        run(&mut normalizer, video_tag(1000, false));

        // New source starting over at ts 0.
        run(
            &mut normalizer,
            Tag::source_started(DEFAULT_FLAVOUR_MASK, "b", "b"),
        );
        assert_eq!(run(&mut normalizer, video_tag(0, true)), 1000);
        assert_eq!(run(&mut normalizer, video_tag(500, false)), 1500);
    }

    #[test]
    fn regressions_are_clamped_monotonic() {
        let mut normalizer = TagNormalizer::new(0);
        run(&mut normalizer, video_tag(100, true));
        run(&mut normalizer, video_tag(200, false));
        // A backwards jump inside one segment must not move time backwards.
        assert_eq!(run(&mut normalizer, video_tag(150, false)), 100);
        assert_eq!(run(&mut normalizer, video_tag(300, false)), 200);
    }
}
