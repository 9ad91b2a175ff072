//! Per-flavour fan-out with bootstrap replay.
//!
//! A distributor owns the clients of one flavour lane. It remembers the
//! stream's bootstrap set (media info, last metadata, last video keyframe)
//! and replays it at timestamp 0 to every newly joining client, bracketed by
//! bootstrap-begin/end markers, so a late joiner can start decoding before
//! the next live keyframe arrives.

use std::collections::HashMap;

use media_tag::{FlavourMask, RequestId, SourceChange, Tag, TagKind, TagPayload};
use tracing::debug;

use crate::element::TagSink;

#[derive(Default)]
struct Bootstrap {
    media_info: Option<Tag>,
    metadata: Option<Tag>,
    keyframe: Option<Tag>,
}

struct DistributorClient {
    sink: TagSink,
    eos_sent: bool,
}

pub struct TagDistributor {
    flavour: FlavourMask,
    clients: HashMap<RequestId, DistributorClient>,
    bootstrap: Bootstrap,
    /// Last source-started seen, replayed to late joiners so their stream
    /// is properly bracketed.
    current_source: Option<SourceChange>,
}

impl TagDistributor {
    pub fn new(flavour: FlavourMask) -> Self {
        TagDistributor {
            flavour,
            clients: HashMap::new(),
            bootstrap: Bootstrap::default(),
            current_source: None,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Register a client and replay the stream head to it.
    pub fn add_client(&mut self, req_id: RequestId, sink: TagSink) {
        if let Some(source) = &self.current_source {
            let _ = sink.send(
                Tag::source_started(self.flavour, &source.path, &source.source_element_name),
            );
        }
        let replay: Vec<&Tag> = [
            self.bootstrap.media_info.as_ref(),
            self.bootstrap.metadata.as_ref(),
            self.bootstrap.keyframe.as_ref(),
        ]
        .into_iter()
        .flatten()
        .collect();
        if !replay.is_empty() {
            debug!(clients = self.clients.len() + 1, "replaying bootstrap");
            let _ = sink.send(Tag::new(self.flavour, TagPayload::BootstrapBegin));
            for tag in replay {
                let _ = sink.send(tag.with_flavour_mask(self.flavour).with_timestamp(0));
            }
            let _ = sink.send(Tag::new(self.flavour, TagPayload::BootstrapEnd));
        }
        self.clients.insert(
            req_id,
            DistributorClient {
                sink,
                eos_sent: false,
            },
        );
    }

    pub fn remove_client(&mut self, req_id: RequestId) -> bool {
        self.clients.remove(&req_id).is_some()
    }

    /// Forward a tag (already narrowed to this flavour) to every client,
    /// updating the bootstrap set on the way.
    pub fn dispatch(&mut self, tag: &Tag) {
        match tag.kind() {
            TagKind::SourceStarted => {
                if let Some(change) = tag.source_change() {
                    self.current_source = Some(change.clone());
                }
            }
            TagKind::SourceEnded => {
                self.current_source = None;
            }
            TagKind::MediaInfo => {
                self.bootstrap.media_info = Some(tag.clone());
            }
            TagKind::VideoFrame if tag.can_resync() => {
                self.bootstrap.keyframe = Some(tag.clone());
            }
            _ if tag.is_metadata() => {
                self.bootstrap.metadata = Some(tag.clone());
            }
            _ => {}
        }
        let is_eos = tag.kind() == TagKind::EndOfStream;
        for client in self.clients.values_mut() {
            if is_eos {
                if client.eos_sent {
                    continue;
                }
                client.eos_sent = true;
            }
            let _ = client.sink.send(tag.clone());
        }
    }

    /// End-of-stream to every client that has not had one; the distributor
    /// stays usable.
    pub fn send_eos(&mut self, forced: bool) {
        for client in self.clients.values_mut() {
            if client.eos_sent {
                continue;
            }
            client.eos_sent = true;
            let _ = client.sink.send(Tag::eos(self.flavour, forced));
        }
    }

    pub fn clear_clients(&mut self) {
        self.clients.clear();
    }
}
