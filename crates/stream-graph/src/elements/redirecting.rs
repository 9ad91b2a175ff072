//! Path redirection: an ordered list of (regex, prefix) rules. The first
//! rule matching a request's sub-path prepends its prefix and forwards
//! through the mapper; source-started/source-ended tags flowing back are
//! rewritten so downstream observers see the externally stable name.

use std::collections::HashMap;
use std::sync::Arc;

use media_tag::{Request, RequestId, SourceChange, Tag, TagKind, TagPayload};
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::element::{
    CloseDone, Element, MediaInfoSink, TagSink, join_media, strip_element_prefix,
};
use crate::error::GraphError;
use crate::mapper::MapperRef;

pub const ELEMENT_CLASS_NAME: &str = "redirecting";

struct Redirection {
    pattern: Regex,
    prefix: String,
}

struct RedirectSlot {
    downstream_path: String,
}

pub struct RedirectingElement {
    name: String,
    mapper: MapperRef,
    redirections: Vec<Redirection>,
    slots: Mutex<HashMap<RequestId, RedirectSlot>>,
}

impl RedirectingElement {
    pub fn new(
        name: impl Into<String>,
        mapper: MapperRef,
        rules: &[(String, String)],
    ) -> Result<Arc<RedirectingElement>, GraphError> {
        let mut redirections = Vec::with_capacity(rules.len());
        for (pattern, prefix) in rules {
            match Regex::new(pattern) {
                Ok(re) => redirections.push(Redirection {
                    pattern: re,
                    prefix: prefix.clone(),
                }),
                Err(e) => {
                    warn!(pattern, error = %e, "skipping invalid redirection rule");
                }
            }
        }
        Ok(Arc::new(RedirectingElement {
            name: name.into(),
            mapper,
            redirections,
            slots: Mutex::new(HashMap::new()),
        }))
    }

    fn rewrite_prefix(&self, media: &str) -> String {
        self.redirections
            .iter()
            .find(|r| r.pattern.is_match(media))
            .map(|r| r.prefix.clone())
            .unwrap_or_default()
    }

    /// Rewrite the path of a source-change tag back under our name.
    fn rewrite_tag(&self, redirection_prefix: &str, tag: Tag) -> Tag {
        let kind = tag.kind();
        if kind != TagKind::SourceStarted && kind != TagKind::SourceEnded {
            return tag;
        }
        if redirection_prefix.is_empty() {
            return tag;
        }
        let Some(change) = tag.source_change() else {
            return tag;
        };
        let Some(original) = strip_element_prefix(&change.path, redirection_prefix) else {
            warn!(
                element = %self.name,
                path = %change.path,
                prefix = redirection_prefix,
                "source tag path does not start with the redirection prefix"
            );
            return tag;
        };
        let new_change = Arc::new(SourceChange {
            path: join_media(&self.name, original),
            source_element_name: self.name.clone(),
        });
        let mut rewritten = tag;
        rewritten.payload = match kind {
            TagKind::SourceStarted => TagPayload::SourceStarted(new_change),
            _ => TagPayload::SourceEnded(new_change),
        };
        rewritten
    }
}

impl Element for RedirectingElement {
    fn class_name(&self) -> &'static str {
        ELEMENT_CLASS_NAME
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn add_request(self: Arc<Self>, path: &str, req: &Request, sink: TagSink) -> bool {
        let Some(rest) = strip_element_prefix(path, &self.name) else {
            return false;
        };
        let prefix = self.rewrite_prefix(rest);
        let new_path = join_media(&prefix, rest);
        info!(element = %self.name, from = rest, to = %new_path, "redirecting request");

        let (tx, rx) = kanal::unbounded::<Tag>();
        if !self.mapper.add_request(&new_path, req, tx) {
            return false;
        }
        self.slots.lock().insert(
            req.id(),
            RedirectSlot {
                downstream_path: new_path,
            },
        );

        let element = Arc::downgrade(&self);
        tokio::spawn(async move {
            let rx = rx.to_async();
            while let Ok(tag) = rx.recv().await {
                let Some(element) = element.upgrade() else {
                    break;
                };
                let _ = sink.send(element.rewrite_tag(&prefix, tag));
            }
        });
        true
    }

    fn remove_request(&self, path: &str, req_id: RequestId) {
        if strip_element_prefix(path, &self.name).is_none() {
            return;
        }
        if let Some(slot) = self.slots.lock().remove(&req_id) {
            self.mapper.remove_request(&slot.downstream_path, req_id);
        } else {
            debug!(element = %self.name, req = %req_id, "remove for unknown request");
        }
    }

    fn has_media(&self, path: &str) -> bool {
        let Some(rest) = strip_element_prefix(path, &self.name) else {
            return false;
        };
        self.redirections
            .iter()
            .any(|r| self.mapper.has_media(&join_media(&r.prefix, rest)))
    }

    fn list_media(&self, dir: &str, out: &mut Vec<String>) {
        let Some(rest) = strip_element_prefix(dir, &self.name) else {
            return;
        };
        for redirection in &self.redirections {
            let mut media = Vec::new();
            self.mapper
                .list_media(&join_media(&redirection.prefix, rest), &mut media);
            for m in media {
                out.push(join_media(&self.name, &m));
            }
        }
    }

    fn describe_media(&self, path: &str, sink: MediaInfoSink) -> bool {
        let Some(rest) = strip_element_prefix(path, &self.name) else {
            return false;
        };
        let Some(first) = self.redirections.first() else {
            return false;
        };
        self.mapper
            .describe_media(&join_media(&first.prefix, rest), sink)
    }

    fn close(&self, done: CloseDone) {
        // Unwind every chain ourselves; nothing asynchronous remains after.
        let slots: Vec<(RequestId, RedirectSlot)> = self.slots.lock().drain().collect();
        for (req_id, slot) in slots {
            self.mapper.remove_request(&slot.downstream_path, req_id);
        }
        let _ = done.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::ElementMapper;
    use crate::test_utils::{NullElement, collect_ready, settle};

    #[tokio::test]
    async fn rewrites_path_and_flows_back_the_stable_name() {
        let mapper = ElementMapper::new();
        let source = Arc::new(NullElement::new("aio_flv"));
        mapper.register(source.clone());
        let element = RedirectingElement::new(
            "r",
            mapper.borrow(),
            &[("\\.flv$".to_string(), "aio_flv".to_string())],
        )
        .unwrap();
        mapper.register(element.clone());

        let req = Request::new();
        let (tx, rx) = kanal::unbounded();
        assert!(mapper.add_request("r/clip.flv", &req, tx));
        // The source saw the rewritten path.
        assert_eq!(source.request_count(), 1);

        source.push(
            "aio_flv/clip.flv",
            Tag::source_started(media_tag::DEFAULT_FLAVOUR_MASK, "aio_flv/clip.flv", "aio_flv"),
        );
        settle().await;

        let got = collect_ready(&rx);
        assert_eq!(got.len(), 1);
        let change = got[0].source_change().unwrap();
        assert_eq!(change.path, "r/clip.flv");
        assert_eq!(change.source_element_name, "r");
    }

    #[tokio::test]
    async fn unmatched_paths_forward_unprefixed() {
        let mapper = ElementMapper::new();
        let source = Arc::new(NullElement::new("direct"));
        mapper.register(source.clone());
        let element = RedirectingElement::new(
            "r",
            mapper.borrow(),
            &[("\\.flv$".to_string(), "aio_flv".to_string())],
        )
        .unwrap();
        mapper.register(element);

        let req = Request::new();
        let (tx, _rx) = kanal::unbounded();
        // "direct/live" does not match the rule; it resolves as-is.
        assert!(mapper.add_request("r/direct/live", &req, tx));
        assert_eq!(source.request_count(), 1);
    }
}
