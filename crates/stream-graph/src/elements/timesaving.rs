//! Time saving: remember, per (request id, media), how far a client got, so
//! a reconnecting client resumes near its last position. State is written
//! through the state keeper on an interval and purged once it goes stale.

use std::time::Duration;

use media_tag::{Request, StreamTimeCalculator, Tag};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::filtering::{FilterFactory, FilteringElement, TagFilter};
use crate::mapper::MapperRef;
use crate::state::StateKeepUser;

pub const ELEMENT_CLASS_NAME: &str = "timesaving";

/// Default interval between state writes for one client.
pub const DEFAULT_SAVE_INTERVAL_MS: i64 = 15_000;
/// Saved positions older than this are purged.
pub const PURGE_TIME_MS: i64 = 24 * 3600 * 1000;
const PURGE_SWEEP_INTERVAL_MS: u64 = 3600 * 1000;

#[derive(Debug, Default, Serialize, Deserialize)]
struct TimedMediaState {
    media_ms: i64,
    utc_ms: i64,
}

fn now_utc_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub struct TimeSavingFilter {
    state_key: String,
    keeper: StateKeepUser,
    save_interval_ms: i64,
    state: TimedMediaState,
    stream_time: StreamTimeCalculator,
}

impl TagFilter for TimeSavingFilter {
    fn filter_tag(&mut self, tag: &Tag, out: &mut Vec<Tag>) {
        // Always forward; the bookkeeping rides along.
        out.push(tag.clone());

        self.stream_time.process_tag(tag);
        let now = now_utc_ms();
        if now - self.state.utc_ms > self.save_interval_ms {
            self.state.media_ms = self.stream_time.media_time_ms();
            self.state.utc_ms = now;
            if let Ok(encoded) = serde_json::to_string(&self.state) {
                self.keeper.set_value(&self.state_key, &encoded);
                debug!(key = %self.state_key, media_ms = self.state.media_ms, "saved position");
            }
        }
    }
}

impl Drop for TimeSavingFilter {
    fn drop(&mut self) {
        // The client is gone; its resume position was consumed.
        self.keeper.delete_value(&self.state_key);
    }
}

pub struct TimeSavingFactory {
    keeper: StateKeepUser,
    save_interval_ms: i64,
}

impl TimeSavingFactory {
    pub fn new(keeper: StateKeepUser, save_interval_ms: i64) -> Self {
        TimeSavingFactory {
            keeper,
            save_interval_ms,
        }
    }

    fn state_key(media: &str, req: &Request) -> String {
        format!("{}/{media}", req.stats_id())
    }
}

impl FilterFactory for TimeSavingFactory {
    type Filter = TimeSavingFilter;

    fn class_name(&self) -> &'static str {
        ELEMENT_CLASS_NAME
    }

    fn rewrite_request(&self, media: &str, req: &Request) -> Option<Request> {
        let key = Self::state_key(media, req);
        let value = self.keeper.get_value(&key)?;
        let state: TimedMediaState = serde_json::from_str(&value).ok()?;
        info!(key = %key, media_ms = state.media_ms, "restoring saved position");
        let mut aliased = req.alias();
        aliased.info.seek_pos_ms = state.media_ms;
        Some(aliased)
    }

    fn create_filter(&self, media: &str, req: &Request) -> Option<TimeSavingFilter> {
        Some(TimeSavingFilter {
            state_key: Self::state_key(media, req),
            keeper: self.keeper.clone(),
            save_interval_ms: self.save_interval_ms,
            state: TimedMediaState::default(),
            stream_time: StreamTimeCalculator::new(),
        })
    }

    fn on_initialize(&self, _mapper: &MapperRef, element_name: &str) -> bool {
        let keeper = self.keeper.clone();
        let element_name = element_name.to_string();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(PURGE_SWEEP_INTERVAL_MS)).await;
                let cutoff = now_utc_ms() - PURGE_TIME_MS;
                for (key, value) in keeper.get_key_values() {
                    let stale = serde_json::from_str::<TimedMediaState>(&value)
                        .map(|s| s.utc_ms < cutoff)
                        .unwrap_or(true);
                    if stale {
                        warn!(element = %element_name, key = %key, "purging stale position");
                        keeper.delete_value(&key);
                    }
                }
            }
        });
        true
    }
}

pub type TimeSavingElement = FilteringElement<TimeSavingFactory>;

pub fn new_timesaving_element(
    name: impl Into<String>,
    mapper: MapperRef,
    keeper: StateKeepUser,
    save_interval_ms: i64,
) -> std::sync::Arc<TimeSavingElement> {
    FilteringElement::new(
        name,
        mapper,
        TimeSavingFactory::new(keeper, save_interval_ms),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateKeeper;
    use crate::test_utils::video_tag;
    use media_tag::DEFAULT_FLAVOUR_MASK;

    #[test]
    fn saves_and_restores_the_position() {
        let keeper = StateKeeper::new();
        let factory = TimeSavingFactory::new(
            StateKeepUser::new(keeper.clone(), "timesaving/t"),
            -1, // save on every tag
        );

        let req = Request::new();
        let mut filter = factory.create_filter("clip.f4v", &req).unwrap();
        let mut out = Vec::new();
        filter.filter_tag(
            &Tag::source_started(DEFAULT_FLAVOUR_MASK, "clip.f4v", "src"),
            &mut out,
        );
        filter.filter_tag(&video_tag(0, true), &mut out);
        filter.filter_tag(&video_tag(90_000, false), &mut out);
        // Everything was forwarded.
        assert_eq!(out.len(), 3);

        // A reconnecting client (same request identity) resumes there.
        let rewritten = factory.rewrite_request("clip.f4v", &req).expect("state");
        assert_eq!(rewritten.info.seek_pos_ms, 90_000);
        assert_eq!(rewritten.id(), req.id());

        // Dropping the filter consumes the position.
        drop(filter);
        assert!(factory.rewrite_request("clip.f4v", &req).is_none());
    }
}
