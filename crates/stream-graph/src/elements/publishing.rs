//! Publishing receiver: the graph-side counterpart of an inbound HTTP/RTMP
//! publish. The wire endpoint decodes the connection into tags and pushes
//! them through a [`PublishHandle`]; the element exposes the stream as a
//! named source with per-flavour bootstrap fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use media_tag::{FlavourMask, Request, RequestId, Tag, TagKind};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::distributor::TagDistributor;
use crate::element::{CloseDone, Element, MediaInfoSink, TagSink, strip_element_prefix};

pub const ELEMENT_CLASS_NAME: &str = "publishing";

struct PublishedStream {
    distributors: HashMap<u8, TagDistributor>,
    clients: HashMap<RequestId, FlavourMask>,
    live: bool,
}

impl PublishedStream {
    fn new() -> Self {
        PublishedStream {
            distributors: HashMap::new(),
            clients: HashMap::new(),
            live: false,
        }
    }

    fn dispatch(&mut self, tag: &Tag) {
        let mut mask = tag.flavour_mask;
        while let Some(id) = mask.pop_rightmost() {
            self.distributors
                .entry(id)
                .or_insert_with(|| TagDistributor::new(FlavourMask::single(id)))
                .dispatch(&tag.with_flavour_mask(FlavourMask::single(id)));
        }
    }
}

pub struct PublishingElement {
    name: String,
    streams: Mutex<HashMap<String, PublishedStream>>,
    closing: Mutex<bool>,
}

/// The producer side of one published stream. Dropping it ends the stream.
pub struct PublishHandle {
    tx: kanal::Sender<Tag>,
}

impl PublishHandle {
    pub fn push(&self, tag: Tag) -> bool {
        self.tx.send(tag).is_ok()
    }
}

impl PublishingElement {
    pub fn new(name: impl Into<String>) -> Arc<PublishingElement> {
        Arc::new(PublishingElement {
            name: name.into(),
            streams: Mutex::new(HashMap::new()),
            closing: Mutex::new(false),
        })
    }

    /// Start publishing under `stream`; refused while one is live there.
    pub fn publish(self: &Arc<Self>, stream: &str) -> Option<PublishHandle> {
        {
            let mut streams = self.streams.lock();
            if *self.closing.lock() {
                return None;
            }
            let entry = streams.entry(stream.to_string()).or_insert_with(PublishedStream::new);
            if entry.live {
                warn!(element = %self.name, stream, "stream is already being published");
                return None;
            }
            entry.live = true;
        }
        info!(element = %self.name, stream, "publish started");

        let (tx, rx) = kanal::unbounded::<Tag>();
        let element = Arc::downgrade(self);
        let stream_name = stream.to_string();
        let media_path = crate::element::join_media(&self.name, &stream_name);
        tokio::spawn(async move {
            let rx = rx.to_async();
            let started = |element: &Arc<PublishingElement>| {
                let mut streams = element.streams.lock();
                if let Some(s) = streams.get_mut(&stream_name) {
                    s.dispatch(&Tag::source_started(
                        FlavourMask::ALL,
                        &media_path,
                        &element.name,
                    ));
                }
            };
            let mut sent_started = false;
            while let Ok(tag) = rx.recv().await {
                let Some(element) = element.upgrade() else {
                    return;
                };
                if !sent_started {
                    sent_started = true;
                    started(&element);
                }
                let ended = tag.kind() == TagKind::EndOfStream;
                let mut streams = element.streams.lock();
                if let Some(s) = streams.get_mut(&stream_name) {
                    s.dispatch(&tag);
                    if ended {
                        s.live = false;
                        return;
                    }
                }
            }
            // Producer dropped without an explicit end: close out the
            // stream for the listeners.
            if let Some(element) = element.upgrade() {
                let mut streams = element.streams.lock();
                if let Some(s) = streams.get_mut(&stream_name) {
                    s.dispatch(&Tag::source_ended(
                        FlavourMask::ALL,
                        &media_path,
                        &element.name,
                    ));
                    s.dispatch(&Tag::eos(FlavourMask::ALL, false));
                    s.live = false;
                }
            }
        });
        Some(PublishHandle { tx })
    }
}

impl Element for PublishingElement {
    fn class_name(&self) -> &'static str {
        ELEMENT_CLASS_NAME
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn add_request(self: Arc<Self>, path: &str, req: &Request, sink: TagSink) -> bool {
        if *self.closing.lock() {
            return false;
        }
        let Some(rest) = strip_element_prefix(path, &self.name) else {
            return false;
        };
        if rest.is_empty() {
            return false;
        }
        let mut streams = self.streams.lock();
        let stream = streams.entry(rest.to_string()).or_insert_with(PublishedStream::new);
        for id in req.caps.flavours.ids() {
            stream
                .distributors
                .entry(id)
                .or_insert_with(|| TagDistributor::new(FlavourMask::single(id)))
                .add_client(req.id(), sink.clone());
        }
        stream.clients.insert(req.id(), req.caps.flavours);
        true
    }

    fn remove_request(&self, path: &str, req_id: RequestId) {
        let Some(rest) = strip_element_prefix(path, &self.name) else {
            return;
        };
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get_mut(rest) {
            stream.clients.remove(&req_id);
            for distributor in stream.distributors.values_mut() {
                distributor.remove_client(req_id);
            }
        }
    }

    fn has_media(&self, path: &str) -> bool {
        strip_element_prefix(path, &self.name)
            .is_some_and(|rest| !rest.is_empty())
    }

    fn list_media(&self, dir: &str, out: &mut Vec<String>) {
        if strip_element_prefix(dir, &self.name).is_none() {
            return;
        }
        for (name, stream) in self.streams.lock().iter() {
            if stream.live {
                out.push(crate::element::join_media(&self.name, name));
            }
        }
    }

    fn describe_media(&self, _path: &str, _sink: MediaInfoSink) -> bool {
        false
    }

    fn close(&self, done: CloseDone) {
        *self.closing.lock() = true;
        let mut streams = self.streams.lock();
        for stream in streams.values_mut() {
            for distributor in stream.distributors.values_mut() {
                distributor.send_eos(true);
                distributor.clear_clients();
            }
            stream.clients.clear();
        }
        let _ = done.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{collect_ready, settle, video_tag};

    #[tokio::test]
    async fn published_tags_reach_subscribers() {
        let element = PublishingElement::new("pub");
        let req = Request::new();
        let (tx, rx) = kanal::unbounded();
        assert!(element.clone().add_request("pub/cam1", &req, tx));

        let handle = element.publish("cam1").expect("publish");
        handle.push(video_tag(0, true));
        settle().await;

        let got = collect_ready(&rx);
        // source-started bracket, then the frame.
        assert_eq!(got[0].kind(), TagKind::SourceStarted);
        assert!(got.iter().any(|t| t.kind() == TagKind::VideoFrame));
    }

    #[tokio::test]
    async fn double_publish_is_refused() {
        let element = PublishingElement::new("pub");
        let _first = element.publish("cam1").expect("publish");
        assert!(element.publish("cam1").is_none());
    }
}
