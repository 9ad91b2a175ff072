//! Load balancing: deterministic round-robin dispatch across a list of
//! sub-element names. A refused registration tries the next candidate, the
//! chosen assignment is remembered so teardown unwinds the same chain, and
//! source tags are rewritten to carry this element's name.

use std::collections::HashMap;
use std::sync::Arc;

use media_tag::{Request, RequestId, SourceChange, Tag, TagKind, TagPayload};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::element::{
    CloseDone, Element, MediaInfoSink, TagSink, join_media, strip_element_prefix,
};
use crate::mapper::{MapperRef, split_first};

pub const ELEMENT_CLASS_NAME: &str = "load_balancing";

struct BalancerSlot {
    downstream_path: String,
    chosen: String,
    eos_sent: bool,
    client: TagSink,
}

struct BalancerInner {
    next: usize,
    slots: HashMap<RequestId, BalancerSlot>,
    closing: bool,
    close_done: Option<CloseDone>,
}

pub struct LoadBalancingElement {
    name: String,
    mapper: MapperRef,
    sub_elements: Vec<String>,
    inner: Mutex<BalancerInner>,
}

impl LoadBalancingElement {
    pub fn new(
        name: impl Into<String>,
        mapper: MapperRef,
        sub_elements: Vec<String>,
    ) -> Arc<LoadBalancingElement> {
        Arc::new(LoadBalancingElement {
            name: name.into(),
            mapper,
            sub_elements,
            inner: Mutex::new(BalancerInner {
                next: 0,
                slots: HashMap::new(),
                closing: false,
                close_done: None,
            }),
        })
    }

    fn rewrite_tag(&self, chosen: &str, tag: Tag) -> Tag {
        let kind = tag.kind();
        if kind != TagKind::SourceStarted && kind != TagKind::SourceEnded {
            return tag;
        }
        let Some(change) = tag.source_change() else {
            return tag;
        };
        let (name_head, name_rest) = split_first(&change.source_element_name);
        if name_head != chosen {
            return tag;
        }
        let (_, path_rest) = split_first(&change.path);
        let new_change = Arc::new(SourceChange {
            path: join_media(&self.name, path_rest),
            source_element_name: join_media(&self.name, name_rest),
        });
        let mut rewritten = tag;
        rewritten.payload = match kind {
            TagKind::SourceStarted => TagPayload::SourceStarted(new_change),
            _ => TagPayload::SourceEnded(new_change),
        };
        rewritten
    }

    fn process_tag(&self, req_id: RequestId, tag: Tag) {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.slots.get_mut(&req_id) else {
            return;
        };
        if tag.kind() == TagKind::EndOfStream {
            if slot.eos_sent {
                return;
            }
            slot.eos_sent = true;
        }
        let chosen = slot.chosen.clone();
        let client = slot.client.clone();
        drop(inner);
        let _ = client.send(self.rewrite_tag(&chosen, tag));
    }
}

impl Element for LoadBalancingElement {
    fn class_name(&self) -> &'static str {
        ELEMENT_CLASS_NAME
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(self: Arc<Self>) -> bool {
        !self.sub_elements.is_empty()
    }

    fn add_request(self: Arc<Self>, path: &str, req: &Request, sink: TagSink) -> bool {
        let Some(rest) = strip_element_prefix(path, &self.name) else {
            return false;
        };
        let start = {
            let inner = self.inner.lock();
            if inner.closing {
                return false;
            }
            inner.next
        };

        for i in 0..self.sub_elements.len() {
            let index = (start + i) % self.sub_elements.len();
            let chosen = &self.sub_elements[index];
            let downstream_path = join_media(chosen, rest);
            let (tx, rx) = kanal::unbounded::<Tag>();
            if !self.mapper.add_request(&downstream_path, req, tx) {
                warn!(
                    element = %self.name,
                    media = %downstream_path,
                    "candidate refused, trying the next one"
                );
                continue;
            }
            info!(element = %self.name, media = %downstream_path, "dispatched");
            {
                let mut inner = self.inner.lock();
                inner.next = (index + 1) % self.sub_elements.len();
                inner.slots.insert(
                    req.id(),
                    BalancerSlot {
                        downstream_path,
                        chosen: chosen.clone(),
                        eos_sent: false,
                        client: sink,
                    },
                );
            }
            let req_id = req.id();
            let element = Arc::downgrade(&self);
            tokio::spawn(async move {
                let rx = rx.to_async();
                while let Ok(tag) = rx.recv().await {
                    match element.upgrade() {
                        Some(element) => element.process_tag(req_id, tag),
                        None => break,
                    }
                }
            });
            return true;
        }
        warn!(element = %self.name, media = rest, "every candidate refused");
        false
    }

    fn remove_request(&self, path: &str, req_id: RequestId) {
        if strip_element_prefix(path, &self.name).is_none() {
            return;
        }
        let slot = self.inner.lock().slots.remove(&req_id);
        if let Some(slot) = slot {
            self.mapper.remove_request(&slot.downstream_path, req_id);
        }
        let mut inner = self.inner.lock();
        if inner.closing && inner.slots.is_empty() {
            if let Some(done) = inner.close_done.take() {
                let _ = done.send(());
            }
        }
    }

    fn has_media(&self, path: &str) -> bool {
        let Some(rest) = strip_element_prefix(path, &self.name) else {
            return false;
        };
        self.sub_elements
            .iter()
            .any(|sub| self.mapper.has_media(&join_media(sub, rest)))
    }

    fn list_media(&self, dir: &str, out: &mut Vec<String>) {
        let Some(rest) = strip_element_prefix(dir, &self.name) else {
            return;
        };
        for sub in &self.sub_elements {
            let mut media = Vec::new();
            self.mapper.list_media(&join_media(sub, rest), &mut media);
            for m in media {
                let (_, m_rest) = split_first(&m);
                out.push(join_media(&self.name, m_rest));
            }
        }
    }

    fn describe_media(&self, path: &str, sink: MediaInfoSink) -> bool {
        let Some(rest) = strip_element_prefix(path, &self.name) else {
            return false;
        };
        // One candidate gets to answer; sinks are single-shot.
        for sub in self.sub_elements.iter().take(1) {
            return self.mapper.describe_media(&join_media(sub, rest), sink);
        }
        false
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
                let _ = slot.client.send(Tag::eos(media_tag::FlavourMask::ALL, true));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::ElementMapper;
    use crate::test_utils::{NullElement, collect_ready, settle};

    fn build() -> (Arc<ElementMapper>, Vec<Arc<NullElement>>) {
        let mapper = ElementMapper::new();
        let subs: Vec<Arc<NullElement>> = ["x", "y", "z"]
            .iter()
            .map(|n| Arc::new(NullElement::new(*n)))
            .collect();
        for sub in &subs {
            mapper.register(sub.clone());
        }
        let element = LoadBalancingElement::new(
            "lb",
            mapper.borrow(),
            vec!["x".into(), "y".into(), "z".into()],
        );
        assert!(element.clone().initialize());
        mapper.register(element);
        (mapper, subs)
    }

    #[tokio::test]
    async fn round_robin_assignment() {
        let (mapper, subs) = build();
        let mut requests = Vec::new();
        for _ in 0..6 {
            let req = Request::new();
            let (tx, _rx) = kanal::unbounded();
            assert!(mapper.add_request("lb/live", &req, tx));
            requests.push(req);
        }
        // Requests 1..6 land on x,y,z,x,y,z.
        assert_eq!(subs[0].request_count(), 2);
        assert_eq!(subs[1].request_count(), 2);
        assert_eq!(subs[2].request_count(), 2);
    }

    #[tokio::test]
    async fn source_tags_carry_the_balancer_name() {
        let (mapper, subs) = build();
        let req = Request::new();
        let (tx, rx) = kanal::unbounded();
        assert!(mapper.add_request("lb/live", &req, tx));

        subs[0].push(
            "x/live",
            Tag::source_started(media_tag::DEFAULT_FLAVOUR_MASK, "x/live", "x"),
        );
        settle().await;

        let got = collect_ready(&rx);
        assert_eq!(got.len(), 1);
        let change = got[0].source_change().unwrap();
        assert_eq!(change.path, "lb/live");
        assert_eq!(change.source_element_name, "lb");
    }

    #[tokio::test]
    async fn removal_unwinds_the_same_downstream() {
        let (mapper, subs) = build();
        let req = Request::new();
        let (tx, _rx) = kanal::unbounded();
        assert!(mapper.add_request("lb/live", &req, tx));
        assert_eq!(subs[0].request_count(), 1);

        mapper.remove_request("lb/live", req.id());
        assert_eq!(subs[0].request_count(), 0);
    }
}
