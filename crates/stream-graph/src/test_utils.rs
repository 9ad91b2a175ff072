//! Shared helpers for the crate's test suites.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use media_tag::{
    DEFAULT_FLAVOUR_MASK, MediaFormat, MediaFrame, MediaFrameKind, Request, RequestId, Tag,
    TagAttributes, TagPayload,
};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::element::{CloseDone, Element, MediaInfoSink, TagSink, strip_element_prefix};

/// A source stand-in: accepts any request addressed to it and lets the test
/// push tags to whatever registered on a given path.
pub struct NullElement {
    name: String,
    sinks: Mutex<HashMap<String, Vec<(RequestId, TagSink)>>>,
}

impl NullElement {
    pub fn new(name: impl Into<String>) -> Self {
        NullElement {
            name: name.into(),
            sinks: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver a tag to every request registered on `path`.
    pub fn push(&self, path: &str, tag: Tag) {
        if let Some(sinks) = self.sinks.lock().get(path) {
            for (_, sink) in sinks {
                let _ = sink.send(tag.clone());
            }
        }
    }

    pub fn request_count(&self) -> usize {
        self.sinks.lock().values().map(Vec::len).sum()
    }
}

impl Element for NullElement {
    fn class_name(&self) -> &'static str {
        "null"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn add_request(self: Arc<Self>, path: &str, req: &Request, sink: TagSink) -> bool {
        if strip_element_prefix(path, &self.name).is_none() {
            return false;
        }
        self.sinks
            .lock()
            .entry(path.to_string())
            .or_default()
            .push((req.id(), sink));
        true
    }

    fn remove_request(&self, path: &str, req_id: RequestId) {
        if let Some(sinks) = self.sinks.lock().get_mut(path) {
            sinks.retain(|(id, _)| *id != req_id);
        }
    }

    fn has_media(&self, path: &str) -> bool {
        strip_element_prefix(path, &self.name).is_some()
    }

    fn list_media(&self, _dir: &str, _out: &mut Vec<String>) {}

    fn describe_media(&self, _path: &str, _sink: MediaInfoSink) -> bool {
        false
    }

    fn close(&self, done: CloseDone) {
        self.sinks.lock().clear();
        let _ = done.send(());
    }
}

/// Drain everything currently queued on a sink's receiving half.
pub fn collect_ready(rx: &kanal::Receiver<Tag>) -> Vec<Tag> {
    let mut out = Vec::new();
    while let Ok(Some(tag)) = rx.try_recv() {
        out.push(tag);
    }
    out
}

/// Let spawned pumps run until they are all parked again.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

pub fn video_tag(ts: i64, keyframe: bool) -> Tag {
    let attributes = if keyframe {
        TagAttributes::CAN_RESYNC
    } else {
        TagAttributes::empty()
    };
    Tag::new(
        DEFAULT_FLAVOUR_MASK,
        TagPayload::Frame(MediaFrame {
            kind: MediaFrameKind::Video,
            format: MediaFormat::Flv,
            is_keyframe: keyframe,
            data: Bytes::from_static(&[0x17, 0x01]),
        }),
    )
    .with_attributes(attributes)
    .with_timestamp(ts)
}

/// A scripted HTTP server on a loopback port: connection `n` gets the
/// `n`-th (status, body) pair, and the last pair repeats forever. Returns
/// the base URL and the connection counter.
pub async fn spawn_http_server(
    responses: Vec<(u16, &'static str)>,
) -> (String, Arc<AtomicUsize>) {
    assert!(!responses.is_empty());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test server");
    let addr = listener.local_addr().expect("local addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            let (status, body) = responses
                .get(attempt)
                .copied()
                .unwrap_or(*responses.last().expect("non-empty script"));
            // Take the request head before answering.
            let mut head = [0u8; 1024];
            let _ = socket.read(&mut head).await;
            let reason = if status == 200 { "OK" } else { "Error" };
            let response = format!(
                "HTTP/1.1 {status} {reason}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    (format!("http://{addr}"), hits)
}

/// Receive tags until the end-of-stream marker, with a stall guard.
pub async fn recv_until_eos(rx: kanal::Receiver<Tag>) -> Vec<Tag> {
    let rx = rx.to_async();
    let mut out = Vec::new();
    loop {
        let tag = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("stream stalled")
            .expect("channel closed");
        let is_eos = tag.is_eos();
        out.push(tag);
        if is_eos {
            return out;
        }
    }
}

pub fn audio_tag(ts: i64) -> Tag {
    Tag::new(
        DEFAULT_FLAVOUR_MASK,
        TagPayload::Frame(MediaFrame {
            kind: MediaFrameKind::Audio,
            format: MediaFormat::Flv,
            is_keyframe: false,
            data: Bytes::from_static(&[0xAF, 0x01]),
        }),
    )
    .with_attributes(TagAttributes::CAN_RESYNC)
    .with_timestamp(ts)
}
