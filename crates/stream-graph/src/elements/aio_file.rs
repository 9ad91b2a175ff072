//! File source: serves local F4V (or raw) files under a root directory.
//!
//! Paths must match the configured regex; directory paths get the default
//! index file appended. A bounded `MediaInfo` cache keyed on file path lets
//! concurrent clients of the same file share one header parse. Reads are
//! asynchronous and chunked; a request's `seek_pos_ms` is honored through
//! the decoder's seek once the file enters frame mode.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::BytesMut;
use f4v::F4vData;
use media_tag::{FlavourMask, MediaFormat, MediaInfo, Request, RequestId, Tag};
use parking_lot::Mutex;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use crate::element::{
    CloseDone, Element, MediaInfoSink, TagSink, join_media, strip_element_prefix,
};
use crate::elements::splitting::tag_from_f4v;
use crate::error::GraphError;
use crate::mapper::MapperRef;

pub const ELEMENT_CLASS_NAME: &str = "aio_file";

const READ_CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone)]
pub struct AioFileConfig {
    pub root_dir: PathBuf,
    /// Requests whose sub-path does not match are refused.
    pub path_regex: Option<String>,
    /// Appended when a request addresses a directory.
    pub default_index_file: String,
    pub format: MediaFormat,
    pub disable_pause: bool,
    pub disable_seek: bool,
    pub disable_duration: bool,
    pub media_info_cache_size: u64,
}

impl Default for AioFileConfig {
    fn default() -> Self {
        AioFileConfig {
            root_dir: PathBuf::from("."),
            path_regex: None,
            default_index_file: "index.f4v".to_string(),
            format: MediaFormat::F4v,
            disable_pause: false,
            disable_seek: false,
            disable_duration: false,
            media_info_cache_size: 128,
        }
    }
}

struct Reader {
    task: tokio::task::JoinHandle<()>,
    sink: TagSink,
    flavours: FlavourMask,
}

pub struct AioFileElement {
    name: String,
    config: AioFileConfig,
    path_regex: Option<Regex>,
    info_cache: moka::sync::Cache<String, Arc<MediaInfo>>,
    readers: Mutex<HashMap<RequestId, Reader>>,
    closing: Mutex<bool>,
}

impl AioFileElement {
    pub fn new(
        name: impl Into<String>,
        config: AioFileConfig,
    ) -> Result<Arc<AioFileElement>, GraphError> {
        let path_regex = config
            .path_regex
            .as_deref()
            .map(Regex::new)
            .transpose()?;
        Ok(Arc::new(AioFileElement {
            name: name.into(),
            info_cache: moka::sync::Cache::new(config.media_info_cache_size),
            config,
            path_regex,
            readers: Mutex::new(HashMap::new()),
            closing: Mutex::new(false),
        }))
    }

    /// Map a request sub-path onto a file below the root; directories get
    /// the default index file.
    fn resolve_path(&self, rest: &str) -> Option<PathBuf> {
        if rest.is_empty() || rest.contains("..") {
            return None;
        }
        if let Some(regex) = &self.path_regex {
            if !regex.is_match(rest) {
                debug!(element = %self.name, path = rest, "path refused by regex");
                return None;
            }
        }
        let mut file_path = self.config.root_dir.join(rest);
        if file_path.is_dir() {
            file_path = file_path.join(&self.config.default_index_file);
        }
        Some(file_path)
    }

    fn media_info_from_moov(moov: &f4v::ContainerAtom) -> MediaInfo {
        let movie = f4v::extract_movie_info(moov);
        let moov_atom = f4v::Atom::from_body(f4v::AtomBody::Moov(moov.clone()));
        let mut blob = BytesMut::new();
        moov_atom.encode(&mut blob);
        MediaInfo {
            has_audio: movie.has_audio,
            has_video: movie.has_video,
            audio_codec: movie.audio_codec.map(|c| c.to_string()),
            video_codec: movie.video_codec.map(|c| c.to_string()),
            width: movie.width,
            height: movie.height,
            sample_rate: movie.audio_sample_rate,
            duration_ms: movie.duration_ms,
            moov: Some(blob.freeze()),
        }
    }

    /// Stream one file to one client.
    async fn read_file(
        job: ReadJob,
        sink: TagSink,
        cache: moka::sync::Cache<String, Arc<MediaInfo>>,
        info_sink: Option<MediaInfoSink>,
    ) {
        let ReadJob {
            element_name,
            media_path,
            file_path,
            flavours,
            seek_pos_ms,
            format,
            strip_duration,
            info_only,
        } = job;
        let sink = sink.to_async();
        let mut info_sink = info_sink;
        let mut file = match tokio::fs::File::open(&file_path).await {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %file_path.display(), error = %e, "cannot open file");
                let _ = sink.send(Tag::eos(flavours, false)).await;
                return;
            }
        };

        if !info_only {
            let _ = sink
                .send(Tag::source_started(flavours, &media_path, &element_name))
                .await;
        }

        if format != MediaFormat::F4v {
            // Unstructured media: hand the bytes downstream as raw frames,
            // a splitting element can type them.
            let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
            loop {
                buf.reserve(READ_CHUNK_SIZE);
                match file.read_buf(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let frame = media_tag::MediaFrame {
                            kind: media_tag::MediaFrameKind::Raw,
                            format,
                            is_keyframe: false,
                            data: buf.split().freeze(),
                        };
                        let tag = Tag::new(flavours, media_tag::TagPayload::Frame(frame));
                        if sink.send(tag).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(path = %file_path.display(), error = %e, "read error");
                        break;
                    }
                }
            }
            if !info_only {
                let _ = sink
                    .send(Tag::source_ended(flavours, &media_path, &element_name))
                    .await;
                let _ = sink.send(Tag::eos(flavours, false)).await;
            }
            return;
        }

        let mut decoder = f4v::Decoder::new();
        let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
        let mut seek_pending = seek_pos_ms > 0;
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(data)) => {
                    if let F4vData::Atom(atom) = &data {
                        if let f4v::AtomBody::Moov(moov) = &atom.body {
                            let mut info = Self::media_info_from_moov(moov);
                            if strip_duration {
                                info.duration_ms = 0;
                            }
                            let info = Arc::new(info);
                            cache.insert(
                                file_path.to_string_lossy().into_owned(),
                                info.clone(),
                            );
                            if let Some(tx) = info_sink.take() {
                                let _ = tx.send(info.clone());
                            }
                            if info_only {
                                return;
                            }
                            let _ = sink
                                .send(Tag::new(
                                    flavours,
                                    media_tag::TagPayload::MediaInfo(info),
                                ))
                                .await;
                            continue;
                        }
                        // After mdat the decoder is in frame mode: honor the
                        // requested start position.
                        if atom.fourcc() == f4v::FourCc::MDAT && seek_pending {
                            seek_pending = false;
                            match decoder.seek_to_time(seek_pos_ms, true) {
                                Ok((frame, offset)) => {
                                    debug!(frame, offset, "seeking file to request position");
                                    buf.clear();
                                    if file.seek(SeekFrom::Start(offset)).await.is_err() {
                                        let _ = sink.send(Tag::eos(flavours, false)).await;
                                        return;
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, "seek failed, playing from the start")
                                }
                            }
                            continue;
                        }
                        continue;
                    }
                    if sink.send(tag_from_f4v(data, flavours)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    buf.reserve(READ_CHUNK_SIZE);
                    match file.read_buf(&mut buf).await {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(path = %file_path.display(), error = %e, "read error");
                            break;
                        }
                    }
                }
                Err(e) => {
                    warn!(path = %file_path.display(), error = %e, "decode error");
                    break;
                }
            }
        }

        if !info_only {
            let _ = sink
                .send(Tag::source_ended(flavours, &media_path, &element_name))
                .await;
            let _ = sink.send(Tag::eos(flavours, false)).await;
        }
    }
}

/// Everything one reader task needs to know.
struct ReadJob {
    element_name: String,
    media_path: String,
    file_path: PathBuf,
    flavours: FlavourMask,
    seek_pos_ms: i64,
    format: MediaFormat,
    strip_duration: bool,
    info_only: bool,
}

impl Element for AioFileElement {
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
        let Some(file_path) = self.resolve_path(rest) else {
            return false;
        };
        if !file_path.is_file() {
            debug!(element = %self.name, path = %file_path.display(), "no such file");
            return false;
        }
        let seek_pos_ms = if self.config.disable_seek {
            0
        } else {
            req.info.seek_pos_ms
        };
        let task = tokio::spawn(Self::read_file(
            ReadJob {
                element_name: self.name.clone(),
                media_path: path.to_string(),
                file_path,
                flavours: req.caps.flavours,
                seek_pos_ms,
                format: self.config.format,
                strip_duration: self.config.disable_duration,
                info_only: false,
            },
            sink.clone(),
            self.info_cache.clone(),
            None,
        ));
        self.readers.lock().insert(
            req.id(),
            Reader {
                task,
                sink,
                flavours: req.caps.flavours,
            },
        );
        true
    }

    fn remove_request(&self, path: &str, req_id: RequestId) {
        if strip_element_prefix(path, &self.name).is_none() {
            return;
        }
        if let Some(reader) = self.readers.lock().remove(&req_id) {
            reader.task.abort();
        }
    }

    fn has_media(&self, path: &str) -> bool {
        strip_element_prefix(path, &self.name)
            .and_then(|rest| self.resolve_path(rest))
            .is_some_and(|p| p.is_file())
    }

    fn list_media(&self, dir: &str, out: &mut Vec<String>) {
        let Some(rest) = strip_element_prefix(dir, &self.name) else {
            return;
        };
        let dir_path = self.config.root_dir.join(rest);
        let Ok(entries) = std::fs::read_dir(&dir_path) else {
            return;
        };
        for entry in entries.flatten() {
            if !entry.path().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let sub = join_media(rest, &file_name);
            if self.path_regex.as_ref().is_none_or(|r| r.is_match(&sub)) {
                out.push(join_media(&self.name, &sub));
            }
        }
    }

    fn describe_media(&self, path: &str, sink: MediaInfoSink) -> bool {
        let Some(rest) = strip_element_prefix(path, &self.name) else {
            return false;
        };
        let Some(file_path) = self.resolve_path(rest) else {
            return false;
        };
        if let Some(info) = self.info_cache.get(&file_path.to_string_lossy().into_owned()) {
            let _ = sink.send(info);
            return true;
        }
        if !file_path.is_file() {
            return false;
        }
        let (unused_tx, _unused_rx) = kanal::unbounded();
        tokio::spawn(Self::read_file(
            ReadJob {
                element_name: self.name.clone(),
                media_path: path.to_string(),
                file_path,
                flavours: FlavourMask::ALL,
                seek_pos_ms: 0,
                format: self.config.format,
                strip_duration: self.config.disable_duration,
                info_only: true,
            },
            unused_tx,
            self.info_cache.clone(),
            Some(sink),
        ));
        true
    }

    fn close(&self, done: CloseDone) {
        *self.closing.lock() = true;
        let readers: Vec<(RequestId, Reader)> = self.readers.lock().drain().collect();
        for (_, reader) in readers {
            reader.task.abort();
            let _ = reader.sink.send(Tag::eos(reader.flavours, true));
        }
        let _ = done.send(());
    }
}

/// Convenience wrapper so library code reads like the other constructors.
pub fn new_aio_file_element(
    name: impl Into<String>,
    _mapper: MapperRef,
    config: AioFileConfig,
) -> Result<Arc<AioFileElement>, GraphError> {
    AioFileElement::new(name, config)
}

impl AioFileElement {
    /// Root directory paths use for resolution; exposed for tests.
    pub fn root_dir(&self) -> &Path {
        &self.config.root_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::collect_ready;
    use f4v::test_support::build_movie_file;
    use media_tag::TagKind;

    async fn wait_for_eos(rx: &kanal::Receiver<Tag>) -> Vec<Tag> {
        let rx_async = rx.clone().to_async();
        let mut out = Vec::new();
        loop {
            let tag = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                rx_async.recv(),
            )
            .await
            .expect("reader stalled")
            .expect("channel closed");
            let is_eos = tag.is_eos();
            out.push(tag);
            if is_eos {
                return out;
            }
        }
    }

    #[tokio::test]
    async fn serves_a_file_with_source_bracketing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("clip.f4v"),
            build_movie_file(&[10, 20], 40, &[0], true),
        )
        .unwrap();

        let element = AioFileElement::new(
            "files",
            AioFileConfig {
                root_dir: dir.path().to_path_buf(),
                ..AioFileConfig::default()
            },
        )
        .unwrap();

        let req = Request::new();
        let (tx, rx) = kanal::unbounded();
        assert!(element.clone().add_request("files/clip.f4v", &req, tx));

        let tags = wait_for_eos(&rx).await;
        let kinds: Vec<TagKind> = tags.iter().map(Tag::kind).collect();
        assert_eq!(kinds.first(), Some(&TagKind::SourceStarted));
        assert!(kinds.contains(&TagKind::MediaInfo));
        assert_eq!(kinds.iter().filter(|k| **k == TagKind::VideoFrame).count(), 2);
        assert_eq!(kinds[kinds.len() - 2], TagKind::SourceEnded);
        assert_eq!(kinds[kinds.len() - 1], TagKind::EndOfStream);
    }

    #[tokio::test]
    async fn refuses_paths_outside_the_regex() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.avi"), b"junk").unwrap();

        let element = AioFileElement::new(
            "files",
            AioFileConfig {
                root_dir: dir.path().to_path_buf(),
                path_regex: Some(r".*\.f4v$".to_string()),
                ..AioFileConfig::default()
            },
        )
        .unwrap();

        let req = Request::new();
        let (tx, rx) = kanal::unbounded();
        assert!(!element.clone().add_request("files/clip.avi", &req, tx));
        assert!(collect_ready(&rx).is_empty());
        assert!(!element.has_media("files/clip.avi"));
    }

    #[tokio::test]
    async fn describe_media_parses_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("clip.f4v"),
            build_movie_file(&[10], 40, &[0], true),
        )
        .unwrap();

        let element = AioFileElement::new(
            "files",
            AioFileConfig {
                root_dir: dir.path().to_path_buf(),
                ..AioFileConfig::default()
            },
        )
        .unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        assert!(element.describe_media("files/clip.f4v", tx));
        let info = rx.await.expect("media info");
        assert!(info.has_video);
        assert!(info.moov.is_some());

        // Second call answers from the cache.
        let (tx, rx) = tokio::sync::oneshot::channel();
        assert!(element.describe_media("files/clip.f4v", tx));
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn seek_starts_from_the_preceding_keyframe() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("clip.f4v"),
            build_movie_file(&[10, 10, 10, 10], 100, &[0, 2], true),
        )
        .unwrap();

        let element = AioFileElement::new(
            "files",
            AioFileConfig {
                root_dir: dir.path().to_path_buf(),
                ..AioFileConfig::default()
            },
        )
        .unwrap();

        let mut req = Request::new();
        req.info.seek_pos_ms = 250;
        let (tx, rx) = kanal::unbounded();
        assert!(element.clone().add_request("files/clip.f4v", &req, tx));

        let tags = wait_for_eos(&rx).await;
        let frames: Vec<&Tag> = tags
            .iter()
            .filter(|t| t.kind() == TagKind::VideoFrame)
            .collect();
        // ts 250 lies in frame 2 (a keyframe): frames 2 and 3 play.
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].timestamp_ms, 200);
        assert_eq!(frames[1].timestamp_ms, 300);
    }
}
