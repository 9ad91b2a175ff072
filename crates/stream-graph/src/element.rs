//! The element contract.
//!
//! Elements are the nodes of the streaming graph. Entry points are
//! synchronous; tags travel through channel sinks, one per request, and
//! anything that must wait (alarms, retries, I/O) runs as a spawned task
//! holding a weak handle back to its element.

use std::sync::Arc;

use media_tag::{MediaInfo, Request, RequestId, Tag};

/// Where an element delivers tags for one request. Senders are cheap to
/// clone; a closed sink simply swallows sends until the request is removed.
pub type TagSink = kanal::Sender<Tag>;

/// Exactly-once completion for an asynchronous [`Element::close`].
pub type CloseDone = tokio::sync::oneshot::Sender<()>;

/// Delivery channel for [`Element::describe_media`].
pub type MediaInfoSink = tokio::sync::oneshot::Sender<Arc<MediaInfo>>;

/// A named node in the streaming graph.
///
/// Paths are routed on their first segment: an element receives the full
/// path it was addressed with and strips its own name. `close` must send a
/// forced end-of-stream on every live request's sink (with that request's
/// flavour mask) and fire `done` exactly once, after the request table has
/// drained; `add_request` during a close returns `false`.
pub trait Element: Send + Sync {
    fn class_name(&self) -> &'static str;

    fn name(&self) -> &str;

    /// One-time setup after registration. `false` leaves the element
    /// inactive.
    fn initialize(self: Arc<Self>) -> bool {
        true
    }

    fn add_request(self: Arc<Self>, path: &str, req: &Request, sink: TagSink) -> bool;

    /// Tear down one request. Safe to call with a path/request pair that is
    /// no longer present.
    fn remove_request(&self, path: &str, req_id: RequestId);

    fn has_media(&self, path: &str) -> bool;

    fn list_media(&self, dir: &str, out: &mut Vec<String>);

    /// Deliver a [`MediaInfo`] for the path once enough of the media has
    /// been seen. `false` means the description will never arrive.
    fn describe_media(&self, path: &str, sink: MediaInfoSink) -> bool;

    fn close(&self, done: CloseDone);
}

/// Strip `name` (and its separating slash) off the front of `path`.
///
/// `"drop/a/b"` with name `"drop"` yields `"a/b"`; the bare name yields
/// `""`; anything else is not addressed to this element.
pub fn strip_element_prefix<'a>(path: &'a str, name: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(name)?;
    if rest.is_empty() {
        Some("")
    } else {
        rest.strip_prefix('/')
    }
}

/// Join two path fragments, tolerating empty sides.
pub fn join_media(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b.to_string(),
        (_, true) => a.to_string(),
        _ => format!("{a}/{b}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_stripping() {
        assert_eq!(strip_element_prefix("drop/a/b", "drop"), Some("a/b"));
        assert_eq!(strip_element_prefix("drop", "drop"), Some(""));
        assert_eq!(strip_element_prefix("dropper/a", "drop"), None);
        assert_eq!(strip_element_prefix("other/a", "drop"), None);
    }

    #[test]
    fn media_joining() {
        assert_eq!(join_media("a", "b/c"), "a/b/c");
        assert_eq!(join_media("", "b"), "b");
        assert_eq!(join_media("a", ""), "a");
    }
}
