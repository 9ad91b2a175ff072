//! HTTP client source: one outbound GET per configured media name, body
//! framed into tags by a codec splitter and fanned out to the element's
//! clients. Transport errors and non-2xx responses retry on a backoff;
//! `fetch_only_on_request` defers the GET until the first client arrives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use media_tag::{FlavourMask, MediaFormat, Request, RequestId, Tag};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::element::{CloseDone, Element, MediaInfoSink, TagSink, strip_element_prefix};
use crate::elements::splitting::{TagSplitter, splitter_for};

pub const ELEMENT_CLASS_NAME: &str = "http_client";

pub const DEFAULT_HTTP_RETRY_TIMEOUT_MS: u64 = 2500;

#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    pub url: String,
    pub format: MediaFormat,
    /// Re-issue the GET when the server closes the stream.
    pub reopen_on_close: bool,
    /// Start fetching only when the first client registers.
    pub fetch_only_on_request: bool,
    pub auth: Option<(String, String)>,
    /// Consecutive failed attempts tolerated beyond the first before the
    /// stream is ended; `None` retries forever.
    pub max_retries: Option<u32>,
}

struct EndpointState {
    endpoint: HttpEndpoint,
    clients: HashMap<RequestId, (TagSink, FlavourMask)>,
    running: bool,
    /// Bumps to cancel the running fetch task.
    generation: u64,
}

pub struct HttpClientElement {
    name: String,
    client: reqwest::Client,
    retry_timeout_ms: u64,
    endpoints: Mutex<HashMap<String, EndpointState>>,
    closing: Mutex<bool>,
}

impl HttpClientElement {
    pub fn new(
        name: impl Into<String>,
        endpoints: Vec<(String, HttpEndpoint)>,
        retry_timeout_ms: u64,
    ) -> Arc<HttpClientElement> {
        let endpoints = endpoints
            .into_iter()
            .map(|(media, endpoint)| {
                (
                    media,
                    EndpointState {
                        endpoint,
                        clients: HashMap::new(),
                        running: false,
                        generation: 0,
                    },
                )
            })
            .collect();
        Arc::new(HttpClientElement {
            name: name.into(),
            client: reqwest::Client::new(),
            retry_timeout_ms,
            endpoints: Mutex::new(endpoints),
            closing: Mutex::new(false),
        })
    }

    /// Add an endpoint at runtime (the lookup element resolves URLs into
    /// endpoints of its private client element).
    pub fn add_endpoint(&self, media: impl Into<String>, endpoint: HttpEndpoint) {
        self.endpoints.lock().entry(media.into()).or_insert(EndpointState {
            endpoint,
            clients: HashMap::new(),
            running: false,
            generation: 0,
        });
    }

    fn dispatch(&self, media: &str, tag: Tag) {
        let endpoints = self.endpoints.lock();
        let Some(state) = endpoints.get(media) else {
            return;
        };
        for (sink, flavours) in state.clients.values() {
            if let Some(narrowed) = crate::filtering::narrow_for(&tag, *flavours) {
                let _ = sink.send(narrowed);
            }
        }
    }

    fn start_fetch(self: &Arc<Self>, media: String) {
        let (endpoint, generation) = {
            let mut endpoints = self.endpoints.lock();
            let Some(state) = endpoints.get_mut(&media) else {
                return;
            };
            if state.running {
                return;
            }
            state.running = true;
            state.generation += 1;
            (state.endpoint.clone(), state.generation)
        };
        info!(element = %self.name, media, url = %endpoint.url, "starting fetch");

        let element = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut consecutive_errors = 0u32;
            loop {
                let Some(strong) = element.upgrade() else {
                    return;
                };
                if strong.fetch_generation(&media) != Some(generation) {
                    return;
                }
                let outcome = strong.clone().fetch_once(&media, &endpoint).await;
                drop(strong);
                match outcome {
                    FetchOutcome::Finished => {
                        consecutive_errors = 0;
                        if !endpoint.reopen_on_close {
                            break;
                        }
                    }
                    FetchOutcome::Cancelled => return,
                    FetchOutcome::Error => {
                        consecutive_errors += 1;
                        if endpoint
                            .max_retries
                            .is_some_and(|max| consecutive_errors > max)
                        {
                            warn!(media = %media, attempts = consecutive_errors, "retries exhausted");
                            break;
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(
                    element
                        .upgrade()
                        .map_or(DEFAULT_HTTP_RETRY_TIMEOUT_MS, |e| e.retry_timeout_ms),
                ))
                .await;
            }
            // Fetch over, naturally or for good: end the stream for every
            // client.
            if let Some(strong) = element.upgrade() {
                strong.dispatch(&media, Tag::eos(FlavourMask::ALL, false));
                if let Some(state) = strong.endpoints.lock().get_mut(&media) {
                    state.running = false;
                }
            }
        });
    }

    fn fetch_generation(&self, media: &str) -> Option<u64> {
        self.endpoints.lock().get(media).map(|s| s.generation)
    }

    async fn fetch_once(self: Arc<Self>, media: &str, endpoint: &HttpEndpoint) -> FetchOutcome {
        let mut request = self.client.get(&endpoint.url);
        if let Some((user, pass)) = &endpoint.auth {
            request = request.basic_auth(user, Some(pass));
        }
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(element = %self.name, url = %endpoint.url, error = %e, "request failed");
                return FetchOutcome::Error;
            }
        };
        if !response.status().is_success() {
            warn!(
                element = %self.name,
                url = %endpoint.url,
                status = %response.status(),
                "non-2xx response"
            );
            return FetchOutcome::Error;
        }

        let media_path = crate::element::join_media(&self.name, media);
        self.dispatch(
            media,
            Tag::source_started(FlavourMask::ALL, &media_path, &self.name),
        );
        let mut splitter: Box<dyn TagSplitter> = splitter_for(endpoint.format);
        let mut buf = BytesMut::new();
        let mut body = response.bytes_stream();
        let generation = self.fetch_generation(media);
        while let Some(chunk) = body.next().await {
            if self.fetch_generation(media) != generation {
                return FetchOutcome::Cancelled;
            }
            match chunk {
                Ok(bytes) => {
                    buf.extend_from_slice(&bytes);
                    let mut out = Vec::new();
                    if !splitter.split(&mut buf, FlavourMask::ALL, &mut out) {
                        warn!(element = %self.name, media, "splitter rejected the body");
                        break;
                    }
                    for tag in out {
                        self.dispatch(media, tag);
                    }
                }
                Err(e) => {
                    warn!(element = %self.name, media, error = %e, "body stream error");
                    self.dispatch(
                        media,
                        Tag::source_ended(FlavourMask::ALL, &media_path, &self.name),
                    );
                    return FetchOutcome::Error;
                }
            }
        }
        self.dispatch(
            media,
            Tag::source_ended(FlavourMask::ALL, &media_path, &self.name),
        );
        FetchOutcome::Finished
    }
}

enum FetchOutcome {
    Finished,
    Error,
    Cancelled,
}

impl Element for HttpClientElement {
    fn class_name(&self) -> &'static str {
        ELEMENT_CLASS_NAME
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(self: Arc<Self>) -> bool {
        let eager: Vec<String> = self
            .endpoints
            .lock()
            .iter()
            .filter(|(_, s)| !s.endpoint.fetch_only_on_request)
            .map(|(m, _)| m.clone())
            .collect();
        for media in eager {
            self.start_fetch(media);
        }
        true
    }

    fn add_request(self: Arc<Self>, path: &str, req: &Request, sink: TagSink) -> bool {
        if *self.closing.lock() {
            return false;
        }
        let Some(rest) = strip_element_prefix(path, &self.name) else {
            return false;
        };
        {
            let mut endpoints = self.endpoints.lock();
            let Some(state) = endpoints.get_mut(rest) else {
                debug!(element = %self.name, media = rest, "no such endpoint");
                return false;
            };
            state
                .clients
                .insert(req.id(), (sink, req.caps.flavours));
        }
        self.start_fetch(rest.to_string());
        true
    }

    fn remove_request(&self, path: &str, req_id: RequestId) {
        let Some(rest) = strip_element_prefix(path, &self.name) else {
            return;
        };
        let mut endpoints = self.endpoints.lock();
        if let Some(state) = endpoints.get_mut(rest) {
            state.clients.remove(&req_id);
            if state.clients.is_empty() && state.endpoint.fetch_only_on_request {
                // Cancel the running fetch; nobody is listening.
                state.generation += 1;
                state.running = false;
            }
        }
    }

    fn has_media(&self, path: &str) -> bool {
        strip_element_prefix(path, &self.name)
            .is_some_and(|rest| self.endpoints.lock().contains_key(rest))
    }

    fn list_media(&self, dir: &str, out: &mut Vec<String>) {
        if strip_element_prefix(dir, &self.name).is_none() {
            return;
        }
        for media in self.endpoints.lock().keys() {
            out.push(crate::element::join_media(&self.name, media));
        }
    }

    fn describe_media(&self, _path: &str, _sink: MediaInfoSink) -> bool {
        false
    }

    fn close(&self, done: CloseDone) {
        *self.closing.lock() = true;
        let mut endpoints = self.endpoints.lock();
        for state in endpoints.values_mut() {
            state.generation += 1;
            state.running = false;
            for (sink, flavours) in state.clients.values() {
                let _ = sink.send(Tag::eos(*flavours, true));
            }
            state.clients.clear();
        }
        let _ = done.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{recv_until_eos, spawn_http_server};
    use media_tag::{Request, TagKind, TagPayload};
    use std::sync::atomic::Ordering;

    fn endpoint(url: String, max_retries: Option<u32>) -> HttpEndpoint {
        HttpEndpoint {
            url,
            format: MediaFormat::Raw,
            reopen_on_close: false,
            fetch_only_on_request: true,
            auth: None,
            max_retries,
        }
    }

    #[tokio::test]
    async fn retries_until_the_server_recovers() {
        let (url, hits) = spawn_http_server(vec![(500, ""), (200, "hello")]).await;
        let element = HttpClientElement::new(
            "http",
            vec![("live".to_string(), endpoint(format!("{url}/live"), None))],
            10,
        );

        let req = Request::new();
        let (tx, rx) = kanal::unbounded();
        assert!(element.clone().add_request("http/live", &req, tx));

        let tags = recv_until_eos(rx).await;
        // One failed attempt, one good one.
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let kinds: Vec<TagKind> = tags.iter().map(Tag::kind).collect();
        assert_eq!(kinds.first(), Some(&TagKind::SourceStarted));
        assert!(kinds.contains(&TagKind::SourceEnded));
        let body: Vec<u8> = tags
            .iter()
            .filter_map(|t| match &t.payload {
                TagPayload::Frame(frame) => Some(frame.data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn exhausted_retries_end_the_stream() {
        let (url, hits) = spawn_http_server(vec![(500, "")]).await;
        let element = HttpClientElement::new(
            "http",
            vec![("live".to_string(), endpoint(format!("{url}/live"), Some(2)))],
            10,
        );

        let req = Request::new();
        let (tx, rx) = kanal::unbounded();
        assert!(element.clone().add_request("http/live", &req, tx));

        let tags = recv_until_eos(rx).await;
        // The first attempt plus two retries, then give up.
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        // Nothing but the terminal end-of-stream reached the client.
        assert_eq!(tags.len(), 1);
        assert!(tags[0].is_eos());
    }

    #[tokio::test]
    async fn unknown_endpoints_are_refused() {
        let element = HttpClientElement::new("http", Vec::new(), 10);
        let req = Request::new();
        let (tx, _rx) = kanal::unbounded();
        assert!(!element.clone().add_request("http/nope", &req, tx));
        assert!(!element.has_media("http/nope"));
    }
}
