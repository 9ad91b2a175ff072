//! Bandwidth dropping.
//!
//! Per flavour, audio and video run independent accept/drop period state
//! machines: an acceptance window opens on a resync-capable tag and lasts
//! the configured accept period, then the stream is dropped for at least
//! the drop period until the next resync tag. The first
//! `video_grace_keyframes` keyframes pass unconditionally so a joining
//! client renders immediately, and the last forwarded keyframe is kept as a
//! per-flavour bootstrap replayed to every new client.

use std::sync::Arc;

use media_tag::{NUM_FLAVOURS, Request, Tag, TagKind};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::element::TagSink;
use crate::filtering::{FilterFactory, FilteringElement, TagFilter, narrow_for};
use crate::mapper::MapperRef;

pub const ELEMENT_CLASS_NAME: &str = "dropping";

#[derive(Debug, Clone, Copy)]
pub struct DroppingConfig {
    pub audio_accept_period_ms: i64,
    pub audio_drop_period_ms: i64,
    pub video_accept_period_ms: i64,
    pub video_drop_period_ms: i64,
    pub video_grace_period_key_frames: i32,
}

/// The accept/drop state machine for one flavour of one client.
struct StreamDropper {
    config: DroppingConfig,

    grace_key_frames_sent: i32,
    first_audio_tag: bool,
    first_video_tag: bool,

    video_key_frame_sent: bool,
    dropping_video: bool,
    next_switch_video_ms: i64,

    audio_key_frame_sent: bool,
    dropping_audio: bool,
    next_switch_audio_ms: i64,
}

impl StreamDropper {
    fn new(config: DroppingConfig) -> Self {
        StreamDropper {
            config,
            grace_key_frames_sent: 0,
            first_audio_tag: true,
            first_video_tag: true,
            video_key_frame_sent: false,
            dropping_video: false,
            next_switch_video_ms: config.video_accept_period_ms,
            audio_key_frame_sent: false,
            dropping_audio: false,
            next_switch_audio_ms: config.audio_accept_period_ms,
        }
    }

    /// `true` forwards the tag, `false` drops it.
    fn filter(&mut self, tag: &Tag, ts: i64) -> bool {
        if tag.kind() == TagKind::SourceStarted {
            // Let the new source flip to accept on its first resync tag.
            if self.dropping_video {
                self.next_switch_video_ms = ts;
            }
            if self.dropping_audio {
                self.next_switch_audio_ms = ts;
            }
        }

        if tag.kind() == TagKind::Composed {
            return false;
        }

        if self.first_audio_tag {
            self.first_audio_tag = false;
            self.dropping_audio = self.config.audio_accept_period_ms <= 0;
            self.next_switch_audio_ms = if self.config.audio_drop_period_ms > 0 {
                ts + self.config.audio_accept_period_ms
            } else {
                i64::MAX
            };
        }
        if self.first_video_tag
            && self.config.video_grace_period_key_frames <= self.grace_key_frames_sent
        {
            self.first_video_tag = false;
            self.dropping_video = self.config.video_accept_period_ms <= 0;
            self.next_switch_video_ms = if self.config.video_drop_period_ms > 0 {
                ts + self.config.video_accept_period_ms
            } else {
                i64::MAX
            };
        }

        if tag.is_video_tag() {
            if self.first_video_tag {
                if tag.can_resync() {
                    self.grace_key_frames_sent += 1;
                }
                return true;
            }
            if ts >= self.next_switch_video_ms {
                if self.dropping_video && self.config.video_accept_period_ms > 0 {
                    if tag.can_resync() {
                        self.video_key_frame_sent = true;
                        self.dropping_video = false;
                        self.next_switch_video_ms = ts + self.config.video_accept_period_ms;
                    }
                } else if !self.dropping_video && self.video_key_frame_sent {
                    self.dropping_video = true;
                    self.video_key_frame_sent = false;
                    self.next_switch_video_ms = ts + self.config.video_drop_period_ms;
                }
            }
            self.video_key_frame_sent |= tag.can_resync() && !self.dropping_video;
            return !self.dropping_video;
        }

        if tag.is_audio_tag() {
            if ts >= self.next_switch_audio_ms {
                if self.dropping_audio && self.config.audio_accept_period_ms > 0 {
                    if tag.can_resync() {
                        self.audio_key_frame_sent = true;
                        self.dropping_audio = false;
                        self.next_switch_audio_ms = ts + self.config.audio_accept_period_ms;
                    }
                } else if !self.dropping_audio && self.audio_key_frame_sent {
                    self.dropping_audio = true;
                    self.audio_key_frame_sent = false;
                    self.next_switch_audio_ms = ts + self.config.audio_drop_period_ms;
                }
            }
            self.audio_key_frame_sent |= tag.can_resync() && !self.dropping_audio;
            return !self.dropping_audio;
        }

        true
    }
}

pub struct DroppingFilter {
    config: DroppingConfig,
    droppers: [Option<StreamDropper>; NUM_FLAVOURS],
}

impl TagFilter for DroppingFilter {
    fn filter_tag(&mut self, tag: &Tag, out: &mut Vec<Tag>) {
        let mut keep = media_tag::FlavourMask::EMPTY;
        let mut mask = tag.flavour_mask;
        while let Some(id) = mask.pop_rightmost() {
            let dropper = self.droppers[id as usize]
                .get_or_insert_with(|| StreamDropper::new(self.config));
            if dropper.filter(tag, tag.timestamp_ms) {
                keep = keep.union(media_tag::FlavourMask::single(id));
            }
        }
        if keep.is_empty() {
            return;
        }
        if keep == tag.flavour_mask {
            out.push(tag.clone());
        } else {
            out.push(tag.with_flavour_mask(keep));
        }
    }
}

struct DropShared {
    bootstrap: Mutex<[Option<Tag>; NUM_FLAVOURS]>,
}

pub struct DroppingFactory {
    config: DroppingConfig,
    /// Media this element watches for bootstrap keyframes; also the only
    /// media it will serve when non-empty.
    media_filtered: String,
    shared: Arc<DropShared>,
}

impl DroppingFactory {
    pub fn new(config: DroppingConfig, media_filtered: impl Into<String>) -> Self {
        DroppingFactory {
            config,
            media_filtered: media_filtered.into(),
            shared: Arc::new(DropShared {
                bootstrap: Mutex::new([const { None }; NUM_FLAVOURS]),
            }),
        }
    }
}

impl FilterFactory for DroppingFactory {
    type Filter = DroppingFilter;

    fn class_name(&self) -> &'static str {
        ELEMENT_CLASS_NAME
    }

    fn create_filter(&self, media: &str, _req: &Request) -> Option<DroppingFilter> {
        if !self.media_filtered.is_empty() && self.media_filtered != media {
            warn!(
                media,
                watched = %self.media_filtered,
                "dropping element only serves the media it bootstraps from"
            );
            return None;
        }
        Some(DroppingFilter {
            config: self.config,
            droppers: [const { None }; NUM_FLAVOURS],
        })
    }

    fn on_initialize(&self, mapper: &MapperRef, element_name: &str) -> bool {
        if self.media_filtered.is_empty() {
            return true;
        }
        let mapper = mapper.clone();
        let media = self.media_filtered.clone();
        let shared = Arc::downgrade(&self.shared);
        let element_name = element_name.to_string();
        tokio::spawn(async move {
            // Watch the filtered media and remember the last keyframe per
            // flavour; re-register whenever the source EOSes.
            loop {
                let req = Request::internal();
                let (tx, rx) = kanal::unbounded::<Tag>();
                if !mapper.add_request(&media, &req, tx) {
                    warn!(
                        element = %element_name,
                        media = %media,
                        "bootstrap watcher cannot register to filtered media"
                    );
                    return;
                }
                let rx = rx.to_async();
                let mut reregister = false;
                while let Ok(tag) = rx.recv().await {
                    let Some(shared) = shared.upgrade() else {
                        mapper.remove_request(&media, req.id());
                        return;
                    };
                    match tag.kind() {
                        TagKind::EndOfStream => {
                            mapper.remove_request(&media, req.id());
                            reregister = true;
                            break;
                        }
                        TagKind::SourceEnded => {
                            *shared.bootstrap.lock() = [const { None }; NUM_FLAVOURS];
                        }
                        TagKind::VideoFrame if tag.can_resync() => {
                            let mut bootstrap = shared.bootstrap.lock();
                            for id in tag.flavour_mask.ids() {
                                bootstrap[id as usize] = Some(tag.clone());
                            }
                        }
                        _ => {}
                    }
                }
                if !reregister {
                    return;
                }
                tokio::task::yield_now().await;
            }
        });
        true
    }

    fn on_request_added(&self, req: &Request, client: &TagSink) {
        let bootstrap = self.shared.bootstrap.lock();
        for id in req.caps.flavours.ids() {
            if let Some(tag) = &bootstrap[id as usize] {
                debug!(flavour = id, "replaying dropping bootstrap keyframe");
                let replay = tag.clone().with_timestamp(0);
                if let Some(narrowed) = narrow_for(&replay, req.caps.flavours) {
                    let _ = client.send(narrowed);
                }
            }
        }
    }
}

pub type DroppingElement = FilteringElement<DroppingFactory>;

pub fn new_dropping_element(
    name: impl Into<String>,
    mapper: MapperRef,
    config: DroppingConfig,
    media_filtered: impl Into<String>,
) -> Arc<DroppingElement> {
    FilteringElement::new(name, mapper, DroppingFactory::new(config, media_filtered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{audio_tag, video_tag};

    fn config(grace: i32) -> DroppingConfig {
        DroppingConfig {
            audio_accept_period_ms: 1000,
            audio_drop_period_ms: 1000,
            video_accept_period_ms: 1000,
            video_drop_period_ms: 1000,
            video_grace_period_key_frames: grace,
        }
    }

    fn forwards(dropper: &mut StreamDropper, tag: &Tag) -> bool {
        dropper.filter(tag, tag.timestamp_ms)
    }

    #[test]
    fn accept_drop_accept_cycle() {
        let mut dropper = StreamDropper::new(config(0));

        // Ten keyframes through the accept window: all forwarded.
        for i in 0..10 {
            assert!(
                forwards(&mut dropper, &video_tag(i * 100, true)),
                "keyframe at {} dropped",
                i * 100
            );
        }
        // Ten interframes past the window: all dropped.
        for i in 10..20 {
            assert!(
                !forwards(&mut dropper, &video_tag(i * 100, false)),
                "interframe at {} forwarded",
                i * 100
            );
        }
        // The keyframe after the drop period reopens the window.
        assert!(forwards(&mut dropper, &video_tag(2000, true)));
    }

    #[test]
    fn drop_to_accept_only_on_resync() {
        let mut dropper = StreamDropper::new(config(0));
        assert!(forwards(&mut dropper, &video_tag(0, true)));
        // Exhaust the accept window.
        assert!(!forwards(&mut dropper, &video_tag(1000, false)));
        // Still dropping: interframes cannot reopen the window.
        assert!(!forwards(&mut dropper, &video_tag(2100, false)));
        assert!(!forwards(&mut dropper, &video_tag(2200, false)));
        // A keyframe can.
        assert!(forwards(&mut dropper, &video_tag(2300, true)));
        assert!(forwards(&mut dropper, &video_tag(2400, false)));
    }

    #[test]
    fn grace_keyframes_always_forwarded() {
        let mut dropper = StreamDropper::new(DroppingConfig {
            video_grace_period_key_frames: 2,
            ..config(0)
        });
        // Grace window: everything video passes, keyframes counted.
        assert!(forwards(&mut dropper, &video_tag(0, true)));
        assert!(forwards(&mut dropper, &video_tag(100, false)));
        assert!(forwards(&mut dropper, &video_tag(200, true)));
        // Grace satisfied; normal accept window starts now.
        assert!(forwards(&mut dropper, &video_tag(300, false)));
        // A keyframe inside the window arms the accept→drop switch.
        assert!(forwards(&mut dropper, &video_tag(400, true)));
        assert!(!forwards(&mut dropper, &video_tag(1400, false)));
    }

    #[test]
    fn audio_and_video_run_independently() {
        let mut dropper = StreamDropper::new(config(0));
        assert!(forwards(&mut dropper, &video_tag(0, true)));
        assert!(forwards(&mut dropper, &audio_tag(0)));
        // Video enters its drop period; audio keeps flowing until its own
        // window closes.
        assert!(!forwards(&mut dropper, &video_tag(1000, false)));
        assert!(!forwards(&mut dropper, &audio_tag(1000)));
        assert!(forwards(&mut dropper, &audio_tag(2000)));
    }

    #[test]
    fn composed_tags_always_dropped() {
        let mut dropper = StreamDropper::new(config(0));
        let composed = Tag::new(
            media_tag::DEFAULT_FLAVOUR_MASK,
            media_tag::TagPayload::Composed(Arc::new(vec![])),
        );
        assert!(!forwards(&mut dropper, &composed));
    }
}
