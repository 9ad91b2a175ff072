//! Remote resolver: translate a media path into a play sequence through a
//! typed RPC. Results are cached for a configurable time, expiring from the
//! front of an ordered list; playback emits one source-started under this
//! element's name and chains a mapper registration per resolved entry,
//! looping when the spec says so.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use media_tag::{Request, RequestId, Tag, TagKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::element::{CloseDone, Element, MediaInfoSink, TagSink, strip_element_prefix};
use crate::mapper::MapperRef;

pub const ELEMENT_CLASS_NAME: &str = "remote_resolver";

const PERIODIC_EXPIRATION_FREQUENCY_MS: u64 = 5000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaAlias {
    pub alias_name: String,
    pub media_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResolveSpec {
    pub media: Vec<MediaAlias>,
    pub loop_playlist: bool,
}

/// The resolve RPC; implementations wrap whatever transport reaches the
/// resolver service.
#[async_trait]
pub trait ResolverClient: Send + Sync + 'static {
    async fn resolve_media(&self, media: &str) -> Result<ResolveSpec, String>;
}

struct CachedResult {
    spec: ResolveSpec,
    expires_at: Instant,
}

struct ResolverSlot {
    cancelled: Arc<Mutex<bool>>,
    /// Path of the entry currently registered downstream, if any.
    current_path: Arc<Mutex<Option<String>>>,
}

pub struct RemoteResolverElement {
    name: String,
    mapper: MapperRef,
    client: Arc<dyn ResolverClient>,
    cache_expiration_time_ms: u64,
    cache: Mutex<HashMap<String, CachedResult>>,
    /// Insertion-ordered keys; expiration always pops from the front.
    cache_order: Mutex<VecDeque<String>>,
    slots: Mutex<HashMap<RequestId, ResolverSlot>>,
    closing: Mutex<bool>,
}

impl RemoteResolverElement {
    pub fn new(
        name: impl Into<String>,
        mapper: MapperRef,
        client: Arc<dyn ResolverClient>,
        cache_expiration_time_ms: u64,
    ) -> Arc<RemoteResolverElement> {
        Arc::new(RemoteResolverElement {
            name: name.into(),
            mapper,
            client,
            cache_expiration_time_ms,
            cache: Mutex::new(HashMap::new()),
            cache_order: Mutex::new(VecDeque::new()),
            slots: Mutex::new(HashMap::new()),
            closing: Mutex::new(false),
        })
    }

    fn cache_lookup(&self, media: &str) -> Option<ResolveSpec> {
        let cache = self.cache.lock();
        cache
            .get(media)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.spec.clone())
    }

    fn cache_insert(&self, media: String, spec: ResolveSpec) {
        let expires_at =
            Instant::now() + Duration::from_millis(self.cache_expiration_time_ms);
        if self
            .cache
            .lock()
            .insert(media.clone(), CachedResult { spec, expires_at })
            .is_none()
        {
            self.cache_order.lock().push_back(media);
        }
    }

    /// Drop expired entries from the front of the order list.
    fn expire_cache(&self) {
        let now = Instant::now();
        let mut order = self.cache_order.lock();
        let mut cache = self.cache.lock();
        while let Some(front) = order.front() {
            let expired = cache
                .get(front)
                .is_none_or(|entry| entry.expires_at <= now);
            if !expired {
                break;
            }
            debug!(element = %self.name, media = %front, "cache entry expired");
            cache.remove(front);
            order.pop_front();
        }
    }

    /// Play the resolved entries in order, looping when flagged.
    fn start_play_sequence(
        self: &Arc<Self>,
        media: String,
        spec: ResolveSpec,
        req: Request,
        sink: TagSink,
        slot_cancelled: Arc<Mutex<bool>>,
        current_path: Arc<Mutex<Option<String>>>,
    ) {
        let element = self.clone();
        tokio::spawn(async move {
            let own_path = crate::element::join_media(&element.name, &media);
            let _ = sink.send(Tag::source_started(
                req.caps.flavours,
                &own_path,
                &element.name,
            ));
            loop {
                for alias in &spec.media {
                    if *slot_cancelled.lock() || *element.closing.lock() {
                        return;
                    }
                    let (tx, rx) = kanal::unbounded::<Tag>();
                    if !element.mapper.add_request(&alias.media_name, &req, tx) {
                        warn!(
                            element = %element.name,
                            media = %alias.media_name,
                            "entry refused, skipping"
                        );
                        continue;
                    }
                    *current_path.lock() = Some(alias.media_name.clone());
                    debug!(element = %element.name, media = %alias.media_name, "playing entry");

                    let rx = rx.to_async();
                    let mut ended = false;
                    while let Ok(tag) = rx.recv().await {
                        match tag.kind() {
                            // The sequence presents itself as one stream.
                            TagKind::SourceStarted | TagKind::SourceEnded => continue,
                            TagKind::EndOfStream => {
                                ended = true;
                                break;
                            }
                            _ => {
                                if sink.send(tag).is_err() {
                                    ended = false;
                                    break;
                                }
                            }
                        }
                    }
                    element
                        .mapper
                        .remove_request(&alias.media_name, req.id());
                    *current_path.lock() = None;
                    if !ended && *slot_cancelled.lock() {
                        return;
                    }
                }
                if !spec.loop_playlist {
                    break;
                }
                if *slot_cancelled.lock() || *element.closing.lock() {
                    return;
                }
            }
            let _ = sink.send(Tag::source_ended(
                req.caps.flavours,
                &own_path,
                &element.name,
            ));
            let _ = sink.send(Tag::eos(req.caps.flavours, false));
            element.slots.lock().remove(&req.id());
        });
    }
}

impl Element for RemoteResolverElement {
    fn class_name(&self) -> &'static str {
        ELEMENT_CLASS_NAME
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(self: Arc<Self>) -> bool {
        let element = Arc::downgrade(&self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(PERIODIC_EXPIRATION_FREQUENCY_MS))
                    .await;
                match element.upgrade() {
                    Some(element) => element.expire_cache(),
                    None => return,
                }
            }
        });
        true
    }

    fn add_request(self: Arc<Self>, path: &str, req: &Request, sink: TagSink) -> bool {
        if *self.closing.lock() {
            debug!(element = %self.name, "closing element cannot add requests");
            return false;
        }
        let Some(rest) = strip_element_prefix(path, &self.name) else {
            return false;
        };
        if rest.is_empty() {
            return false;
        }
        if self.slots.lock().contains_key(&req.id()) {
            warn!(element = %self.name, "cannot serve the same request twice");
            return false;
        }

        let cancelled = Arc::new(Mutex::new(false));
        let current_path = Arc::new(Mutex::new(None));
        self.slots.lock().insert(
            req.id(),
            ResolverSlot {
                cancelled: cancelled.clone(),
                current_path: current_path.clone(),
            },
        );

        let media = rest.to_string();
        if let Some(spec) = self.cache_lookup(&media) {
            debug!(element = %self.name, media = %media, "resolved from cache");
            self.start_play_sequence(media, spec, req.alias(), sink, cancelled, current_path);
            return true;
        }

        info!(element = %self.name, media = %media, "starting remote resolve");
        let element = self.clone();
        let query_req = req.alias();
        tokio::spawn(async move {
            let result = element.client.resolve_media(&media).await;
            if *cancelled.lock() || *element.closing.lock() {
                element.slots.lock().remove(&query_req.id());
                return;
            }
            match result {
                Ok(spec) if !spec.media.is_empty() => {
                    element.cache_insert(media.clone(), spec.clone());
                    element.start_play_sequence(
                        media,
                        spec,
                        query_req,
                        sink,
                        cancelled,
                        current_path,
                    );
                }
                Ok(_) => {
                    warn!(element = %element.name, media = %media, "resolve returned nothing");
                    element.slots.lock().remove(&query_req.id());
                    let _ = sink.send(Tag::eos(query_req.caps.flavours, false));
                }
                Err(e) => {
                    warn!(element = %element.name, media = %media, error = %e, "resolve failed");
                    element.slots.lock().remove(&query_req.id());
                    let _ = sink.send(Tag::eos(query_req.caps.flavours, false));
                }
            }
        });
        true
    }

    fn remove_request(&self, path: &str, req_id: RequestId) {
        if strip_element_prefix(path, &self.name).is_none() {
            return;
        }
        let slot = self.slots.lock().remove(&req_id);
        if let Some(slot) = slot {
            *slot.cancelled.lock() = true;
            if let Some(current) = slot.current_path.lock().take() {
                self.mapper.remove_request(&current, req_id);
            }
        }
    }

    fn has_media(&self, path: &str) -> bool {
        strip_element_prefix(path, &self.name).is_some_and(|rest| !rest.is_empty())
    }

    fn list_media(&self, dir: &str, out: &mut Vec<String>) {
        let Some(rest) = strip_element_prefix(dir, &self.name) else {
            return;
        };
        self.mapper.list_media(rest, out);
    }

    fn describe_media(&self, path: &str, sink: MediaInfoSink) -> bool {
        let Some(rest) = strip_element_prefix(path, &self.name) else {
            return false;
        };
        self.mapper.describe_media(rest, sink)
    }

    fn close(&self, done: CloseDone) {
        *self.closing.lock() = true;
        let slots: Vec<(RequestId, ResolverSlot)> = self.slots.lock().drain().collect();
        for (req_id, slot) in slots {
            *slot.cancelled.lock() = true;
            if let Some(current) = slot.current_path.lock().take() {
                self.mapper.remove_request(&current, req_id);
            }
        }
        let _ = done.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::ElementMapper;
    use crate::test_utils::{NullElement, collect_ready, settle, video_tag};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClient {
        calls: AtomicUsize,
        spec: ResolveSpec,
    }

    #[async_trait]
    impl ResolverClient for CountingClient {
        async fn resolve_media(&self, _media: &str) -> Result<ResolveSpec, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.spec.clone())
        }
    }

    fn build(
        spec: ResolveSpec,
    ) -> (
        Arc<ElementMapper>,
        Arc<NullElement>,
        Arc<RemoteResolverElement>,
        Arc<CountingClient>,
    ) {
        let mapper = ElementMapper::new();
        let source = Arc::new(NullElement::new("src"));
        mapper.register(source.clone());
        let client = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
            spec,
        });
        let element =
            RemoteResolverElement::new("r", mapper.borrow(), client.clone(), 60_000);
        mapper.register(element.clone());
        (mapper, source, element, client)
    }

    fn spec_for(media: &str) -> ResolveSpec {
        ResolveSpec {
            media: vec![MediaAlias {
                alias_name: "main".into(),
                media_name: media.into(),
            }],
            loop_playlist: false,
        }
    }

    #[tokio::test]
    async fn resolves_and_chains_the_entry() {
        let (mapper, source, _element, client) = build(spec_for("src/live"));
        let req = Request::new();
        let (tx, rx) = kanal::unbounded();
        assert!(mapper.add_request("r/k", &req, tx));
        settle().await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.request_count(), 1);

        source.push("src/live", video_tag(0, true));
        settle().await;
        let got = collect_ready(&rx);
        // Our own source-started bracket, then the entry's frame.
        assert_eq!(got[0].kind(), TagKind::SourceStarted);
        assert_eq!(got[0].source_change().unwrap().path, "r/k");
        assert!(got.iter().any(|t| t.kind() == TagKind::VideoFrame));
    }

    #[tokio::test]
    async fn second_request_within_expiration_hits_the_cache() {
        let (mapper, _source, _element, client) = build(spec_for("src/live"));
        let first = Request::new();
        let (tx, _rx) = kanal::unbounded();
        assert!(mapper.add_request("r/k", &first, tx));
        settle().await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);

        let second = Request::new();
        let (tx2, _rx2) = kanal::unbounded();
        assert!(mapper.add_request("r/k", &second, tx2));
        settle().await;
        // No second RPC.
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_trigger_a_fresh_resolve() {
        let mapper = ElementMapper::new();
        let source = Arc::new(NullElement::new("src"));
        mapper.register(source.clone());
        let client = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
            spec: spec_for("src/live"),
        });
        let element = RemoteResolverElement::new("r", mapper.borrow(), client.clone(), 1_000);
        mapper.register(element.clone());
        assert!(element.clone().initialize());

        let first = Request::new();
        let (tx, _rx) = kanal::unbounded();
        assert!(mapper.add_request("r/k", &first, tx));
        settle().await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(6_000)).await;
        settle().await;

        let second = Request::new();
        let (tx2, _rx2) = kanal::unbounded();
        assert!(mapper.add_request("r/k", &second, tx2));
        settle().await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn eos_advances_to_done_without_loop() {
        let (mapper, source, _element, _client) = build(spec_for("src/live"));
        let req = Request::new();
        let (tx, rx) = kanal::unbounded();
        assert!(mapper.add_request("r/k", &req, tx));
        settle().await;

        source.push("src/live", Tag::eos(media_tag::DEFAULT_FLAVOUR_MASK, false));
        settle().await;

        let got = collect_ready(&rx);
        let kinds: Vec<TagKind> = got.iter().map(Tag::kind).collect();
        assert_eq!(
            kinds,
            vec![
                TagKind::SourceStarted,
                TagKind::SourceEnded,
                TagKind::EndOfStream
            ]
        );
    }
}
