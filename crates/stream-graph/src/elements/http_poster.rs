//! HTTP poster: reads tags from a local media, serializes them and POSTs
//! the result as a chunked body. The in-memory buffer is bounded; on
//! overflow audio and video are dropped independently until the next
//! resync tag of their kind.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use media_tag::{MediaFormat, Request, RequestId, Tag, TagKind};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::element::{CloseDone, Element, MediaInfoSink, TagSink};
use crate::mapper::MapperRef;
use crate::serializer::{TagSerializer, serializer_for};

pub const ELEMENT_CLASS_NAME: &str = "http_poster";

/// Floor for the configurable chunk size.
pub const MIN_CHUNK_SIZE: usize = 1024;
pub const REOPEN_HTTP_CONNECTION_INTERVAL_MS: u64 = 5000;

#[derive(Debug, Clone)]
pub struct HttpPosterConfig {
    pub url: String,
    /// The media this poster reads from, resolved through the mapper.
    pub local_media: String,
    pub format: MediaFormat,
    pub auth: Option<(String, String)>,
    pub desired_http_chunk_size: usize,
    /// Buffered chunks beyond this trip the overflow dropping.
    pub max_buffered_chunks: usize,
    pub reopen_interval_ms: u64,
}

/// Serialization buffer with the overflow dropping rules.
pub(crate) struct PosterBuffer {
    serializer: Box<dyn TagSerializer>,
    pending: BytesMut,
    chunk_size: usize,
    dropping_audio: bool,
    dropping_video: bool,
}

impl PosterBuffer {
    pub(crate) fn new(format: MediaFormat, chunk_size: usize) -> Self {
        let mut serializer = serializer_for(format);
        let mut pending = BytesMut::new();
        serializer.initialize(&mut pending);
        PosterBuffer {
            serializer,
            pending,
            chunk_size: chunk_size.max(MIN_CHUNK_SIZE),
            dropping_audio: false,
            dropping_video: false,
        }
    }

    /// Overflow dropping: `false` means this tag must not be serialized.
    pub(crate) fn accept(&mut self, tag: &Tag) -> bool {
        match tag.kind() {
            TagKind::AudioFrame => {
                if self.dropping_audio {
                    if tag.can_resync() {
                        self.dropping_audio = false;
                    } else {
                        return false;
                    }
                }
                true
            }
            TagKind::VideoFrame => {
                if self.dropping_video {
                    if tag.can_resync() {
                        self.dropping_video = false;
                    } else {
                        return false;
                    }
                }
                true
            }
            _ => true,
        }
    }

    pub(crate) fn push(&mut self, tag: &Tag, out: &mut Vec<Bytes>) {
        self.serializer.serialize(tag, &mut self.pending);
        while self.pending.len() >= self.chunk_size {
            out.push(self.pending.split_to(self.chunk_size).freeze());
        }
    }

    pub(crate) fn mark_overflow(&mut self) {
        if !self.dropping_audio || !self.dropping_video {
            warn!("poster buffer overflow, dropping until resync");
        }
        self.dropping_audio = true;
        self.dropping_video = true;
    }

    pub(crate) fn content_type(&self) -> &'static str {
        self.serializer.content_type()
    }
}

struct PosterShared {
    name: String,
    config: HttpPosterConfig,
    /// The body channel of the POST currently in flight.
    body_tx: Mutex<Option<kanal::Sender<Bytes>>>,
    stopped: Mutex<bool>,
}

pub struct HttpPosterElement {
    shared: Arc<PosterShared>,
    mapper: MapperRef,
    upstream_req: Mutex<Option<RequestId>>,
}

impl HttpPosterElement {
    pub fn new(
        name: impl Into<String>,
        mapper: MapperRef,
        config: HttpPosterConfig,
    ) -> Arc<HttpPosterElement> {
        Arc::new(HttpPosterElement {
            shared: Arc::new(PosterShared {
                name: name.into(),
                config,
                body_tx: Mutex::new(None),
                stopped: Mutex::new(false),
            }),
            mapper,
            upstream_req: Mutex::new(None),
        })
    }
}

impl Element for HttpPosterElement {
    fn class_name(&self) -> &'static str {
        ELEMENT_CLASS_NAME
    }

    fn name(&self) -> &str {
        &self.shared.name
    }

    fn initialize(self: Arc<Self>) -> bool {
        let req = Request::internal();
        let (tx, rx) = kanal::unbounded::<Tag>();
        if !self
            .mapper
            .add_request(&self.shared.config.local_media, &req, tx)
        {
            warn!(
                element = %self.shared.name,
                media = %self.shared.config.local_media,
                "cannot register to local media"
            );
            return false;
        }
        *self.upstream_req.lock() = Some(req.id());

        // Serialization pump: tags in, bounded chunks out.
        let shared = Arc::downgrade(&self.shared);
        let config = self.shared.config.clone();
        tokio::spawn(async move {
            let rx = rx.to_async();
            let mut buffer = PosterBuffer::new(config.format, config.desired_http_chunk_size);
            while let Ok(tag) = rx.recv().await {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                if !buffer.accept(&tag) {
                    continue;
                }
                let mut chunks = Vec::new();
                buffer.push(&tag, &mut chunks);
                let body_tx = shared.body_tx.lock().clone();
                let Some(body_tx) = body_tx else {
                    // No POST in flight; the buffer keeps only a partial
                    // chunk, completed chunks are dropped.
                    if !chunks.is_empty() {
                        buffer.mark_overflow();
                    }
                    continue;
                };
                for chunk in chunks {
                    match body_tx.try_send(chunk) {
                        Ok(true) => {}
                        _ => buffer.mark_overflow(),
                    }
                }
            }
        });

        // POST loop: one chunked request at a time, reopened on close.
        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            loop {
                let Some(strong) = shared.upgrade() else {
                    return;
                };
                if *strong.stopped.lock() {
                    return;
                }
                let (tx, rx) = kanal::bounded::<Bytes>(strong.config.max_buffered_chunks);
                *strong.body_tx.lock() = Some(tx);
                let rx = rx.to_async();
                let stream = futures::stream::unfold(rx, |rx| async move {
                    rx.recv()
                        .await
                        .ok()
                        .map(|bytes| (Ok::<_, std::convert::Infallible>(bytes), rx))
                });
                let content_type = serializer_for(strong.config.format).content_type();
                let mut request = client
                    .post(&strong.config.url)
                    .header("Content-Type", content_type)
                    .body(reqwest::Body::wrap_stream(stream));
                if let Some((user, pass)) = &strong.config.auth {
                    request = request.basic_auth(user, Some(pass));
                }
                info!(element = %strong.name, url = %strong.config.url, "posting");
                let reopen = strong.config.reopen_interval_ms;
                drop(strong);
                match request.send().await {
                    Ok(response) => {
                        info!(status = %response.status(), "post finished");
                    }
                    Err(e) => {
                        warn!(error = %e, "post failed");
                    }
                }
                if let Some(strong) = shared.upgrade() {
                    *strong.body_tx.lock() = None;
                }
                tokio::time::sleep(Duration::from_millis(reopen)).await;
            }
        });
        true
    }

    fn add_request(self: Arc<Self>, _path: &str, _req: &Request, _sink: TagSink) -> bool {
        // A poster is a sink; it serves no media.
        false
    }

    fn remove_request(&self, _path: &str, _req_id: RequestId) {}

    fn has_media(&self, _path: &str) -> bool {
        false
    }

    fn list_media(&self, _dir: &str, _out: &mut Vec<String>) {}

    fn describe_media(&self, _path: &str, _sink: MediaInfoSink) -> bool {
        false
    }

    fn close(&self, done: CloseDone) {
        *self.shared.stopped.lock() = true;
        *self.shared.body_tx.lock() = None;
        if let Some(req_id) = self.upstream_req.lock().take() {
            self.mapper
                .remove_request(&self.shared.config.local_media, req_id);
        }
        let _ = done.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{audio_tag, video_tag};

    #[test]
    fn overflow_drops_until_resync_per_kind() {
        let mut buffer = PosterBuffer::new(MediaFormat::Raw, MIN_CHUNK_SIZE);
        assert!(buffer.accept(&video_tag(0, true)));
        buffer.mark_overflow();

        // Interframes and non-resync tags stay dropped.
        assert!(!buffer.accept(&video_tag(100, false)));
        // Audio recovers on its own resync, independent of video.
        assert!(buffer.accept(&audio_tag(100)));
        assert!(!buffer.accept(&video_tag(200, false)));
        // Video recovers on a keyframe.
        assert!(buffer.accept(&video_tag(300, true)));
        assert!(buffer.accept(&video_tag(400, false)));
    }

    #[test]
    fn chunks_are_cut_at_the_configured_size() {
        let mut buffer = PosterBuffer::new(MediaFormat::Raw, MIN_CHUNK_SIZE);
        let mut chunks = Vec::new();
        let big = Tag::new(
            media_tag::DEFAULT_FLAVOUR_MASK,
            media_tag::TagPayload::Frame(media_tag::MediaFrame {
                kind: media_tag::MediaFrameKind::Raw,
                format: MediaFormat::Raw,
                is_keyframe: false,
                data: Bytes::from(vec![0u8; MIN_CHUNK_SIZE * 2 + 100]),
            }),
        );
        buffer.push(&big, &mut chunks);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == MIN_CHUNK_SIZE));
        assert_eq!(buffer.pending.len(), 100);
    }
}
