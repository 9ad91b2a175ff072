//! Lookup: resolve a media path by asking a set of lookup servers over
//! HTTP. The query path is a template with `${RESOURCE}`, `${REQ_QUERY}`
//! and `${AUTH_QUERY}` placeholders; the response body is a newline
//! separated list of URLs or internal paths, tried in order. Servers are
//! walked round-robin with bounded retries; failure surfaces as an
//! end-of-stream on the consumer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use media_tag::{Request, RequestId, Tag};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::element::{CloseDone, Element, MediaInfoSink, TagSink, strip_element_prefix};
use crate::elements::http_client::{HttpClientElement, HttpEndpoint};
use crate::mapper::MapperRef;

pub const ELEMENT_CLASS_NAME: &str = "lookup";

#[derive(Debug, Clone)]
pub struct LookupConfig {
    /// Base URLs of the lookup servers, e.g. `http://resolver:8080`.
    pub servers: Vec<String>,
    /// Query path template with `${RESOURCE}`, `${REQ_QUERY}`,
    /// `${AUTH_QUERY}` placeholders.
    pub query_path_format: String,
    pub http_headers: Vec<(String, String)>,
    pub num_retries: usize,
    pub request_timeout_ms: u64,
    /// Try resolving through the mapper before going remote.
    pub local_lookup_first: bool,
    /// Format of the media behind resolved URLs.
    pub media_format: media_tag::MediaFormat,
}

enum LookupTarget {
    /// Resolution still in flight; flag flips when the request goes away.
    Pending(Arc<Mutex<bool>>),
    Internal(String),
    Http(String),
}

pub struct LookupElement {
    name: String,
    mapper: MapperRef,
    config: LookupConfig,
    client: reqwest::Client,
    /// Private HTTP source for resolved URLs; one connection pool per
    /// lookup instance.
    http_element: Arc<HttpClientElement>,
    next_server: AtomicUsize,
    next_endpoint: AtomicUsize,
    slots: Mutex<HashMap<RequestId, LookupTarget>>,
    closing: Mutex<bool>,
}

impl LookupElement {
    pub fn new(
        name: impl Into<String>,
        mapper: MapperRef,
        config: LookupConfig,
    ) -> Arc<LookupElement> {
        let name = name.into();
        let http_element = HttpClientElement::new(
            format!("{name}.http"),
            Vec::new(),
            crate::elements::http_client::DEFAULT_HTTP_RETRY_TIMEOUT_MS,
        );
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .unwrap_or_default();
        Arc::new(LookupElement {
            name,
            mapper,
            config,
            client,
            http_element,
            next_server: AtomicUsize::new(0),
            next_endpoint: AtomicUsize::new(0),
            slots: Mutex::new(HashMap::new()),
            closing: Mutex::new(false),
        })
    }

    fn query_url(&self, server: &str, media: &str, req: &Request) -> String {
        let resource: String = url::form_urlencoded::byte_serialize(media.as_bytes()).collect();
        let path = self
            .config
            .query_path_format
            .replace("${RESOURCE}", &resource)
            .replace("${REQ_QUERY}", &req.info.url_query_string())
            .replace("${AUTH_QUERY}", &req.info.auth_query_string());
        format!("{}{}", server.trim_end_matches('/'), path)
    }

    /// One lookup round: every server once, in round-robin order.
    async fn resolve_remote(self: &Arc<Self>, media: &str, req: &Request) -> Option<Vec<String>> {
        for _ in 0..=self.config.num_retries {
            let start = self.next_server.fetch_add(1, Ordering::Relaxed);
            for i in 0..self.config.servers.len() {
                let server = &self.config.servers[(start + i) % self.config.servers.len()];
                let url = self.query_url(server, media, req);
                debug!(element = %self.name, url = %url, "lookup query");
                let mut request = self.client.get(&url);
                for (key, value) in &self.config.http_headers {
                    request = request.header(key, value);
                }
                match request.send().await {
                    Ok(response) if response.status().is_success() => {
                        match response.text().await {
                            Ok(body) => {
                                let entries: Vec<String> = body
                                    .lines()
                                    .map(str::trim)
                                    .filter(|l| !l.is_empty())
                                    .map(str::to_string)
                                    .collect();
                                if !entries.is_empty() {
                                    return Some(entries);
                                }
                                warn!(element = %self.name, url = %url, "empty lookup response");
                            }
                            Err(e) => {
                                warn!(element = %self.name, url = %url, error = %e, "bad body")
                            }
                        }
                    }
                    Ok(response) => {
                        warn!(
                            element = %self.name,
                            url = %url,
                            status = %response.status(),
                            "lookup refused"
                        );
                    }
                    Err(e) => {
                        warn!(element = %self.name, url = %url, error = %e, "lookup failed")
                    }
                }
            }
        }
        None
    }

    /// Register the request on the first reachable resolved entry.
    fn play_entries(
        self: &Arc<Self>,
        entries: Vec<String>,
        req: &Request,
        sink: &TagSink,
    ) -> Option<LookupTarget> {
        for entry in entries {
            if entry.starts_with("http://") || entry.starts_with("https://") {
                let endpoint_name =
                    format!("lookup-{}", self.next_endpoint.fetch_add(1, Ordering::Relaxed));
                self.http_element.add_endpoint(
                    endpoint_name.clone(),
                    HttpEndpoint {
                        url: entry.clone(),
                        format: self.config.media_format,
                        reopen_on_close: false,
                        fetch_only_on_request: true,
                        auth: None,
                        max_retries: None,
                    },
                );
                let path = format!("{}/{}", self.http_element.name(), endpoint_name);
                if self
                    .http_element
                    .clone()
                    .add_request(&path, req, sink.clone())
                {
                    info!(element = %self.name, url = %entry, "serving via http");
                    return Some(LookupTarget::Http(path));
                }
            } else if self.mapper.add_request(&entry, req, sink.clone()) {
                info!(element = %self.name, media = %entry, "serving internally");
                return Some(LookupTarget::Internal(entry));
            }
        }
        None
    }
}

impl Element for LookupElement {
    fn class_name(&self) -> &'static str {
        ELEMENT_CLASS_NAME
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(self: Arc<Self>) -> bool {
        self.http_element.clone().initialize()
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
        if self.slots.lock().contains_key(&req.id()) {
            warn!(element = %self.name, "cannot serve the same request twice");
            return false;
        }

        if self.config.local_lookup_first && self.mapper.add_request(rest, req, sink.clone()) {
            debug!(element = %self.name, media = rest, "served locally");
            self.slots
                .lock()
                .insert(req.id(), LookupTarget::Internal(rest.to_string()));
            return true;
        }

        let cancelled = Arc::new(Mutex::new(false));
        self.slots
            .lock()
            .insert(req.id(), LookupTarget::Pending(cancelled.clone()));

        let element = self.clone();
        let media = rest.to_string();
        let flavours = req.caps.flavours;
        let req_id = req.id();
        // The request object stays with the caller; the async resolution
        // works on an identity-preserving alias.
        let query_req = req.alias();
        tokio::spawn(async move {
            let entries = element.resolve_remote(&media, &query_req).await;
            if *cancelled.lock() || *element.closing.lock() {
                element.slots.lock().remove(&req_id);
                return;
            }
            let target =
                entries.and_then(|entries| element.play_entries(entries, &query_req, &sink));
            match target {
                Some(target) => {
                    element.slots.lock().insert(req_id, target);
                }
                None => {
                    warn!(element = %element.name, media = %media, "lookup failed, ending stream");
                    element.slots.lock().remove(&req_id);
                    let _ = sink.send(Tag::eos(flavours, false));
                }
            }
        });
        true
    }

    fn remove_request(&self, path: &str, req_id: RequestId) {
        if strip_element_prefix(path, &self.name).is_none() {
            return;
        }
        let target = self.slots.lock().remove(&req_id);
        match target {
            Some(LookupTarget::Pending(cancelled)) => *cancelled.lock() = true,
            Some(LookupTarget::Internal(media)) => self.mapper.remove_request(&media, req_id),
            Some(LookupTarget::Http(path)) => self.http_element.remove_request(&path, req_id),
            None => {}
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
        let slots: Vec<(RequestId, LookupTarget)> = self.slots.lock().drain().collect();
        for (req_id, target) in slots {
            match target {
                LookupTarget::Pending(cancelled) => *cancelled.lock() = true,
                LookupTarget::Internal(media) => self.mapper.remove_request(&media, req_id),
                LookupTarget::Http(path) => self.http_element.remove_request(&path, req_id),
            }
        }
        let (http_done_tx, _http_done_rx) = tokio::sync::oneshot::channel();
        self.http_element.close(http_done_tx);
        let _ = done.send(());
    }
}
