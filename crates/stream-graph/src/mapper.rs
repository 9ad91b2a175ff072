//! The graph's addressing layer: a registry of elements by name, resolving
//! media paths by their first segment.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use media_tag::{Request, RequestId};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::element::{Element, MediaInfoSink, TagSink};

/// Splits `"a/b/c"` into `("a", "b/c")`.
pub fn split_first(path: &str) -> (&str, &str) {
    match path.split_once('/') {
        Some((head, rest)) => (head, rest),
        None => (path, ""),
    }
}

pub struct ElementMapper {
    elements: RwLock<HashMap<String, Arc<dyn Element>>>,
}

impl ElementMapper {
    pub fn new() -> Arc<ElementMapper> {
        Arc::new(ElementMapper {
            elements: RwLock::new(HashMap::new()),
        })
    }

    /// Register an element under its name. `false` when the name is taken.
    pub fn register(&self, element: Arc<dyn Element>) -> bool {
        let mut elements = self.elements.write();
        let name = element.name().to_string();
        if elements.contains_key(&name) {
            warn!(name, "element name already registered");
            return false;
        }
        elements.insert(name, element);
        true
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Element>> {
        self.elements.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Element>> {
        self.elements.read().get(name).cloned()
    }

    pub fn element_names(&self) -> Vec<String> {
        self.elements.read().keys().cloned().collect()
    }

    fn resolve(&self, path: &str) -> Option<Arc<dyn Element>> {
        let (head, _) = split_first(path);
        let element = self.get(head);
        if element.is_none() {
            debug!(path, "no element for path");
        }
        element
    }

    /// Route the request to the element named by the path's first segment.
    /// The element receives the full path.
    pub fn add_request(&self, path: &str, req: &Request, sink: TagSink) -> bool {
        match self.resolve(path) {
            Some(element) => element.add_request(path, req, sink),
            None => false,
        }
    }

    /// Symmetric teardown; the same path used for `add_request` unwinds the
    /// same chain.
    pub fn remove_request(&self, path: &str, req_id: RequestId) {
        if let Some(element) = self.resolve(path) {
            element.remove_request(path, req_id);
        }
    }

    pub fn has_media(&self, path: &str) -> bool {
        self.resolve(path).is_some_and(|e| e.has_media(path))
    }

    pub fn list_media(&self, dir: &str, out: &mut Vec<String>) {
        if let Some(element) = self.resolve(dir) {
            element.list_media(dir, out);
        }
    }

    pub fn describe_media(&self, path: &str, sink: MediaInfoSink) -> bool {
        self.resolve(path).is_some_and(|e| e.describe_media(path, sink))
    }

    /// Close every element, resolving once all of them have completed.
    ///
    /// Elements stay addressable while closing, so clients can answer their
    /// EOS with `remove_request` through this mapper; the registry empties
    /// afterwards.
    pub async fn close_all(&self) {
        let elements: Vec<_> = self.elements.read().values().cloned().collect();
        let mut waits = Vec::with_capacity(elements.len());
        for element in &elements {
            let (done_tx, done_rx) = tokio::sync::oneshot::channel();
            element.close(done_tx);
            waits.push(done_rx);
        }
        for wait in waits {
            let _ = wait.await;
        }
        self.elements.write().clear();
    }

    /// A borrowed reference for elements that chain back into the mapper.
    pub fn borrow(self: &Arc<Self>) -> MapperRef {
        MapperRef(Arc::downgrade(self))
    }
}

/// Weak borrow of the mapper handed to elements; valid for the element's
/// lifetime, no ownership cycle. Every operation degrades to a refusal once
/// the mapper is gone.
#[derive(Clone)]
pub struct MapperRef(Weak<ElementMapper>);

impl MapperRef {
    /// A reference that never resolves; for elements built in isolation.
    pub fn disconnected() -> MapperRef {
        MapperRef(Weak::new())
    }

    pub fn upgrade(&self) -> Option<Arc<ElementMapper>> {
        self.0.upgrade()
    }

    pub fn add_request(&self, path: &str, req: &Request, sink: TagSink) -> bool {
        self.upgrade()
            .is_some_and(|mapper| mapper.add_request(path, req, sink))
    }

    pub fn remove_request(&self, path: &str, req_id: RequestId) {
        if let Some(mapper) = self.upgrade() {
            mapper.remove_request(path, req_id);
        }
    }

    pub fn has_media(&self, path: &str) -> bool {
        self.upgrade().is_some_and(|mapper| mapper.has_media(path))
    }

    pub fn list_media(&self, dir: &str, out: &mut Vec<String>) {
        if let Some(mapper) = self.upgrade() {
            mapper.list_media(dir, out);
        }
    }

    pub fn describe_media(&self, path: &str, sink: MediaInfoSink) -> bool {
        self.upgrade()
            .is_some_and(|mapper| mapper.describe_media(path, sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{NullElement, collect_ready};
    use media_tag::Request;

    #[test]
    fn split_first_segments() {
        assert_eq!(split_first("a/b/c"), ("a", "b/c"));
        assert_eq!(split_first("a"), ("a", ""));
    }

    #[test]
    fn duplicate_names_are_refused() {
        let mapper = ElementMapper::new();
        assert!(mapper.register(Arc::new(NullElement::new("x"))));
        assert!(!mapper.register(Arc::new(NullElement::new("x"))));
    }

    #[test]
    fn routes_by_first_segment() {
        let mapper = ElementMapper::new();
        mapper.register(Arc::new(NullElement::new("a")));

        let req = Request::new();
        let (tx, rx) = kanal::unbounded();
        assert!(mapper.add_request("a/clip.f4v", &req, tx.clone()));
        assert!(!mapper.add_request("b/clip.f4v", &req, tx));
        assert!(mapper.has_media("a/anything"));
        assert!(!mapper.has_media("b/anything"));
        assert!(collect_ready(&rx).is_empty());
    }
}
