//! Failover: play a main media, fall back to a failover media when the main
//! stops producing tags, and return to main once it has proven itself again.
//!
//! The policy keeps its own watcher registration on the main media,
//! independent of what the element currently plays, so it can observe main
//! coming back while the failover is on air.

use std::sync::Arc;
use std::time::Duration;

use media_tag::{Request, Tag, TagKind};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::mapper::MapperRef;
use crate::policies::{Policy, SwitchHandle};

pub const POLICY_CLASS_NAME: &str = "failover_policy";

/// Watcher tag-timeout alarms are re-registered at most this often.
const TAG_TIMEOUT_REGISTRATION_GRACE_PERIOD_MS: u64 = 500;
/// Retry interval when the watcher cannot register to the main media.
const RETRY_OPEN_MEDIA_TIME_MS: u64 = 2500;
/// Delay before re-opening the watcher after the main media EOSes.
const REOPEN_AFTER_EOS_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct FailoverPolicyConfig {
    pub main_media: String,
    pub failover_media: String,
    /// Tags main must deliver before we trust it enough to switch back.
    pub main_media_tags_received_switch_limit: u32,
    /// No tag from main for this long switches to the failover.
    pub failover_timeout_ms: u64,
    /// Switch back to main only at source boundaries, never mid-stream.
    pub change_to_main_only_on_switch: bool,
}

struct FailoverState {
    current_media: String,
    main_tags_received: u32,
    last_timeout_registration: Option<Instant>,
    timeout_generation: u64,
    watcher_generation: u64,
}

struct FailoverShared {
    name: String,
    config: FailoverPolicyConfig,
    handle: SwitchHandle,
    mapper: MapperRef,
    state: Mutex<FailoverState>,
}

impl FailoverShared {
    fn on_failover(&self) -> bool {
        self.state.lock().current_media != self.config.main_media
    }

    fn switch_to(&self, media: &str) {
        self.state.lock().current_media = media.to_string();
        self.handle.switch(media.to_string(), false);
    }

    fn maybe_rearm_tag_timeout(self: &Arc<Self>, force: bool) {
        if self.config.failover_timeout_ms == 0 {
            return;
        }
        let generation = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let grace = Duration::from_millis(TAG_TIMEOUT_REGISTRATION_GRACE_PERIOD_MS);
            if !force
                && state
                    .last_timeout_registration
                    .is_some_and(|last| now.duration_since(last) < grace)
            {
                return;
            }
            state.last_timeout_registration = Some(now);
            state.timeout_generation += 1;
            state.timeout_generation
        };
        let shared = Arc::downgrade(self);
        let timeout = Duration::from_millis(self.config.failover_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if shared.state.lock().timeout_generation != generation {
                return;
            }
            info!(
                policy = %shared.name,
                media = %shared.config.failover_media,
                "no tags from main, switching to failover"
            );
            shared.state.lock().main_tags_received = 0;
            shared.switch_to(&shared.config.failover_media.clone());
        });
    }

    /// One watcher registration on main; lives until EOS or policy drop.
    fn open_watcher(self: &Arc<Self>) {
        let generation = {
            let mut state = self.state.lock();
            state.watcher_generation += 1;
            state.watcher_generation
        };
        let req = Request::internal();
        let req_id = req.id();
        let (tx, rx) = kanal::unbounded::<Tag>();
        if !self.mapper.add_request(&self.config.main_media, &req, tx) {
            warn!(
                policy = %self.name,
                media = %self.config.main_media,
                "watcher cannot register to main, retrying"
            );
            let shared = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(RETRY_OPEN_MEDIA_TIME_MS)).await;
                if let Some(shared) = shared.upgrade() {
                    if shared.state.lock().watcher_generation == generation {
                        shared.open_watcher();
                    }
                }
            });
            return;
        }
        self.maybe_rearm_tag_timeout(true);
        if !self.on_failover() {
            self.switch_to(&self.config.main_media.clone());
        }

        let shared = Arc::downgrade(self);
        let media = self.config.main_media.clone();
        tokio::spawn(async move {
            let rx = rx.to_async();
            while let Ok(tag) = rx.recv().await {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                if shared.state.lock().watcher_generation != generation {
                    return;
                }
                if tag.kind() == TagKind::EndOfStream {
                    shared.mapper.remove_request(&media, req_id);
                    shared.state.lock().main_tags_received = 0;
                    let reopen = Arc::downgrade(&shared);
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(REOPEN_AFTER_EOS_MS)).await;
                        if let Some(shared) = reopen.upgrade() {
                            if shared.state.lock().watcher_generation == generation {
                                shared.open_watcher();
                            }
                        }
                    });
                    return;
                }
                shared.process_main_tag();
            }
        });
    }

    fn process_main_tag(self: &Arc<Self>) {
        self.maybe_rearm_tag_timeout(false);
        let switch_back = {
            let mut state = self.state.lock();
            state.main_tags_received += 1;
            state.current_media != self.config.main_media
                && state.main_tags_received > self.config.main_media_tags_received_switch_limit
                && !self.config.change_to_main_only_on_switch
        };
        if switch_back {
            info!(policy = %self.name, "main is healthy again, switching back mid-stream");
            self.switch_to(&self.config.main_media.clone());
        }
    }
}

pub struct FailoverPolicy {
    shared: Arc<FailoverShared>,
}

impl FailoverPolicy {
    pub fn new(
        name: impl Into<String>,
        handle: SwitchHandle,
        mapper: MapperRef,
        config: FailoverPolicyConfig,
    ) -> Self {
        FailoverPolicy {
            shared: Arc::new(FailoverShared {
                name: name.into(),
                config,
                handle,
                mapper,
                state: Mutex::new(FailoverState {
                    current_media: String::new(),
                    main_tags_received: 0,
                    last_timeout_registration: None,
                    timeout_generation: 0,
                    watcher_generation: 0,
                }),
            }),
        }
    }
}

impl Policy for FailoverPolicy {
    fn class_name(&self) -> &'static str {
        POLICY_CLASS_NAME
    }

    fn initialize(&mut self) -> bool {
        self.shared.open_watcher();
        true
    }

    fn notify_tag(&mut self, tag: &Tag) {
        // While on failover, a fresh source start from a now-healthy main
        // is the boundary we may switch back on.
        if tag.kind() != TagKind::SourceStarted {
            return;
        }
        let shared = &self.shared;
        let switch_back = {
            let state = shared.state.lock();
            state.current_media != shared.config.main_media
                && state.main_tags_received > shared.config.main_media_tags_received_switch_limit
        };
        if switch_back {
            shared.switch_to(&shared.config.main_media.clone());
        }
    }

    fn notify_eos(&mut self) -> bool {
        let shared = &self.shared;
        let (on_failover, healthy) = {
            let state = shared.state.lock();
            (
                state.current_media != shared.config.main_media,
                state.main_tags_received > shared.config.main_media_tags_received_switch_limit,
            )
        };
        if on_failover && healthy {
            info!(policy = %shared.name, "switching back to main at source boundary");
            shared.switch_to(&shared.config.main_media.clone());
        } else {
            let current = shared.state.lock().current_media.clone();
            let media = if current.is_empty() {
                shared.config.main_media.clone()
            } else {
                current
            };
            shared.switch_to(&media);
        }
        true
    }

    fn reset(&mut self) {}
}

impl Drop for FailoverPolicy {
    fn drop(&mut self) {
        // Kill the watcher and any pending alarms.
        let mut state = self.shared.state.lock();
        state.watcher_generation += 1;
        state.timeout_generation += 1;
        debug!(policy = %self.shared.name, "failover policy dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Element;
    use crate::elements::switching::{SwitchingConfig, SwitchingElement};
    use crate::mapper::ElementMapper;
    use crate::test_utils::{NullElement, settle, video_tag};

    fn build(
        change_to_main_only_on_switch: bool,
    ) -> (
        Arc<ElementMapper>,
        Arc<NullElement>,
        Arc<NullElement>,
        Arc<SwitchingElement>,
        Arc<FailoverShared>,
    ) {
        let mapper = ElementMapper::new();
        let main = Arc::new(NullElement::new("a"));
        let fallback = Arc::new(NullElement::new("b"));
        mapper.register(main.clone());
        mapper.register(fallback.clone());

        let element = SwitchingElement::new("sw", mapper.borrow(), SwitchingConfig::default());
        let policy = FailoverPolicy::new(
            "failover",
            element.handle(),
            mapper.borrow(),
            FailoverPolicyConfig {
                main_media: "a/live".into(),
                failover_media: "b/live".into(),
                main_media_tags_received_switch_limit: 5,
                failover_timeout_ms: 2_000,
                change_to_main_only_on_switch,
            },
        );
        let shared = policy.shared.clone();
        element.set_policy(Box::new(policy));
        mapper.register(element.clone());
        assert!(element.clone().initialize());
        (mapper, main, fallback, element, shared)
    }

    #[tokio::test(start_paused = true)]
    async fn silence_on_main_switches_to_failover() {
        let (_mapper, main, _fallback, element, _shared) = build(true);
        settle().await;
        // Watcher plus the element's own registration sit on main.
        assert_eq!(main.request_count(), 2);
        assert_eq!(element.current_media(), "a/live");

        // No tags from main for the failover timeout.
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        settle().await;
        // The register-min-interval delay applies before the failover
        // registration lands.
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        settle().await;
        assert_eq!(element.current_media(), "b/live");
    }

    #[tokio::test(start_paused = true)]
    async fn switches_back_only_at_boundary_when_configured() {
        let (_mapper, main, fallback, element, shared) = build(true);
        settle().await;

        // Go to failover.
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        settle().await;
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        settle().await;
        assert_eq!(element.current_media(), "b/live");

        // Main produces again: six tags to the watcher, above the limit.
        for i in 0..6 {
            main.push("a/live", video_tag(i * 10, true));
        }
        settle().await;
        assert!(shared.state.lock().main_tags_received > 5);
        // Mid-stream we stay on failover.
        assert_eq!(element.current_media(), "b/live");

        // Source boundary on the failover: now we go back to main.
        fallback.push("b/live", Tag::eos(media_tag::DEFAULT_FLAVOUR_MASK, false));
        settle().await;
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        settle().await;
        assert_eq!(element.current_media(), "a/live");
    }

    #[tokio::test(start_paused = true)]
    async fn mid_stream_switch_back_when_allowed() {
        let (_mapper, main, _fallback, element, _shared) = build(false);
        settle().await;
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        settle().await;
        assert_eq!(element.current_media(), "b/live");

        for i in 0..6 {
            main.push("a/live", video_tag(i * 10, true));
            settle().await;
        }
        assert_eq!(element.current_media(), "a/live");
    }
}
