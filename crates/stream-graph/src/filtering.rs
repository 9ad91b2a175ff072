//! Reusable base for filtering elements.
//!
//! A filtering element sits between a client and the rest of the graph. Per
//! request it creates one filter instance from its factory, registers the
//! request downstream through the mapper, and pumps every upstream tag
//! through `filter_tag`, dispatching the results to the client with the
//! flavour mask narrowed to what the request asked for (cloning the tag
//! whenever narrowing changes the mask).

use std::collections::HashMap;
use std::sync::Arc;

use media_tag::{FlavourMask, Request, RequestId, Tag, TagKind};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::element::{
    CloseDone, Element, MediaInfoSink, TagSink, join_media, strip_element_prefix,
};
use crate::mapper::MapperRef;

/// Per-request tag transform. Emits zero or more tags per input.
pub trait TagFilter: Send + 'static {
    fn filter_tag(&mut self, tag: &Tag, out: &mut Vec<Tag>);
}

/// What a concrete filtering element contributes: a class name, a filter
/// per request, and optional lifecycle hooks.
pub trait FilterFactory: Send + Sync + Sized + 'static {
    type Filter: TagFilter;

    fn class_name(&self) -> &'static str;

    /// Build the per-request filter state. `None` refuses the request.
    fn create_filter(&self, media: &str, req: &Request) -> Option<Self::Filter>;

    /// Called once from `Element::initialize`.
    fn on_initialize(&self, _mapper: &MapperRef, _element_name: &str) -> bool {
        true
    }

    /// Rewrite the request before it registers downstream (e.g. to inject a
    /// restored seek position). Identity must be preserved; use
    /// [`Request::alias`].
    fn rewrite_request(&self, _media: &str, _req: &Request) -> Option<Request> {
        None
    }

    /// Called after a request was registered downstream; bootstrap replay
    /// hooks in here.
    fn on_request_added(&self, _req: &Request, _client: &TagSink) {}
}

/// Narrow a tag to `mask`, cloning only when the mask actually changes.
/// `None` means the tag has nothing left for this consumer.
pub(crate) fn narrow_for(tag: &Tag, mask: FlavourMask) -> Option<Tag> {
    let narrowed = tag.flavour_mask.intersect(mask);
    if narrowed == tag.flavour_mask {
        return Some(tag.clone());
    }
    if !narrowed.is_empty() {
        return Some(tag.with_flavour_mask(narrowed));
    }
    // Control tags stay meaningful for consumers outside the tag's lanes.
    match tag.kind() {
        TagKind::AudioFrame | TagKind::VideoFrame | TagKind::RawFrame | TagKind::Composed => None,
        _ => Some(tag.with_flavour_mask(mask)),
    }
}

struct FilterSlot<T> {
    filter: T,
    client: TagSink,
    flavours: FlavourMask,
    downstream_path: String,
    eos_sent: bool,
}

struct FilterInner<T> {
    slots: HashMap<RequestId, FilterSlot<T>>,
    closing: bool,
    close_done: Option<CloseDone>,
}

pub struct FilteringElement<F: FilterFactory> {
    name: String,
    mapper: MapperRef,
    factory: F,
    inner: Mutex<FilterInner<F::Filter>>,
}

impl<F: FilterFactory> FilteringElement<F> {
    pub fn new(name: impl Into<String>, mapper: MapperRef, factory: F) -> Arc<Self> {
        Arc::new(FilteringElement {
            name: name.into(),
            mapper,
            factory,
            inner: Mutex::new(FilterInner {
                slots: HashMap::new(),
                closing: false,
                close_done: None,
            }),
        })
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    fn process_upstream(&self, req_id: RequestId, tag: Tag) {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.slots.get_mut(&req_id) else {
            return;
        };
        let mut out = Vec::with_capacity(1);
        if tag.kind() == TagKind::EndOfStream {
            // EOS always reaches the client, filters never eat it; but a
            // client gets at most one, even when close races upstream.
            if slot.eos_sent {
                return;
            }
            slot.eos_sent = true;
            out.push(tag);
        } else {
            slot.filter.filter_tag(&tag, &mut out);
        }
        for filtered in out {
            if let Some(narrowed) = narrow_for(&filtered, slot.flavours) {
                let _ = slot.client.send(narrowed);
            }
        }
    }

    fn complete_close_if_drained(&self) {
        let mut inner = self.inner.lock();
        if inner.closing && inner.slots.is_empty() {
            if let Some(done) = inner.close_done.take() {
                let _ = done.send(());
            }
        }
    }
}

impl<F: FilterFactory> Element for FilteringElement<F> {
    fn class_name(&self) -> &'static str {
        self.factory.class_name()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(self: Arc<Self>) -> bool {
        self.factory.on_initialize(&self.mapper, &self.name)
    }

    fn add_request(self: Arc<Self>, path: &str, req: &Request, sink: TagSink) -> bool {
        let Some(rest) = strip_element_prefix(path, &self.name) else {
            return false;
        };
        {
            let inner = self.inner.lock();
            if inner.closing {
                return false;
            }
            if inner.slots.contains_key(&req.id()) {
                warn!(element = %self.name, req = %req.id(), "request already present");
                return false;
            }
        }
        let rewritten = self.factory.rewrite_request(rest, req);
        let downstream_req = rewritten.as_ref().unwrap_or(req);
        let Some(filter) = self.factory.create_filter(rest, downstream_req) else {
            return false;
        };

        let (upstream_tx, upstream_rx) = kanal::unbounded::<Tag>();
        if !self.mapper.add_request(rest, downstream_req, upstream_tx) {
            debug!(element = %self.name, media = rest, "downstream refused request");
            return false;
        }

        let req_id = req.id();
        self.inner.lock().slots.insert(
            req_id,
            FilterSlot {
                filter,
                client: sink.clone(),
                flavours: req.caps.flavours,
                downstream_path: rest.to_string(),
                eos_sent: false,
            },
        );
        self.factory.on_request_added(req, &sink);

        let weak = Arc::downgrade(&self);
        tokio::spawn(async move {
            let upstream_rx = upstream_rx.to_async();
            while let Ok(tag) = upstream_rx.recv().await {
                match weak.upgrade() {
                    Some(element) => element.process_upstream(req_id, tag),
                    None => break,
                }
            }
        });
        true
    }

    fn remove_request(&self, path: &str, req_id: RequestId) {
        let Some(_) = strip_element_prefix(path, &self.name) else {
            return;
        };
        let slot = self.inner.lock().slots.remove(&req_id);
        if let Some(slot) = slot {
            self.mapper.remove_request(&slot.downstream_path, req_id);
        }
        self.complete_close_if_drained();
    }

    fn has_media(&self, path: &str) -> bool {
        strip_element_prefix(path, &self.name)
            .is_some_and(|rest| self.mapper.has_media(rest))
    }

    fn list_media(&self, dir: &str, out: &mut Vec<String>) {
        let Some(rest) = strip_element_prefix(dir, &self.name) else {
            return;
        };
        let mut media = Vec::new();
        self.mapper.list_media(rest, &mut media);
        out.extend(
            media
                .into_iter()
                .map(|m| join_media(&self.name, split_rest(&m))),
        );
    }

    fn describe_media(&self, path: &str, sink: MediaInfoSink) -> bool {
        strip_element_prefix(path, &self.name)
            .is_some_and(|rest| self.mapper.describe_media(rest, sink))
    }

    fn close(&self, done: CloseDone) {
        let mut inner = self.inner.lock();
        inner.closing = true;
        if inner.slots.is_empty() {
            let _ = done.send(());
            return;
        }
        inner.close_done = Some(done);
        for slot in inner.slots.values_mut() {
            if !slot.eos_sent {
                slot.eos_sent = true;
                let _ = slot.client.send(Tag::eos(slot.flavours, true));
            }
        }
        // Clients answer the EOS with remove_request; the last one fires
        // the close completion.
    }
}

fn split_rest(path: &str) -> &str {
    crate::mapper::split_first(path).1
}
