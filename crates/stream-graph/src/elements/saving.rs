//! Saving: spool the tag stream of a configured media to disk. Requests
//! pass through transparently; the spool is an internal registration whose
//! bytes go to one file per source run under the output directory.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::BytesMut;
use media_tag::{MediaFormat, Request, RequestId, Tag, TagKind};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::element::{CloseDone, Element, MediaInfoSink, TagSink, strip_element_prefix};
use crate::mapper::MapperRef;
use crate::serializer::{TagSerializer, serializer_for};

pub const ELEMENT_CLASS_NAME: &str = "saving";

#[derive(Debug, Clone)]
pub struct SavingConfig {
    /// The media to record, resolved through the mapper.
    pub media: String,
    pub output_dir: PathBuf,
    pub base_name: String,
    pub format: MediaFormat,
}

pub struct SavingElement {
    name: String,
    mapper: MapperRef,
    config: SavingConfig,
    spool_req: Mutex<Option<RequestId>>,
}

impl SavingElement {
    pub fn new(
        name: impl Into<String>,
        mapper: MapperRef,
        config: SavingConfig,
    ) -> Arc<SavingElement> {
        Arc::new(SavingElement {
            name: name.into(),
            mapper,
            config,
            spool_req: Mutex::new(None),
        })
    }

    async fn spool(config: SavingConfig, rx: kanal::AsyncReceiver<Tag>, element_name: String) {
        if let Err(e) = tokio::fs::create_dir_all(&config.output_dir).await {
            warn!(dir = %config.output_dir.display(), error = %e, "cannot create output dir");
            return;
        }
        let mut serializer: Box<dyn TagSerializer> = serializer_for(config.format);
        let mut file: Option<tokio::fs::File> = None;
        let mut file_counter = 0u32;
        let mut buf = BytesMut::new();

        while let Ok(tag) = rx.recv().await {
            match tag.kind() {
                TagKind::SourceStarted => {
                    // One file per source run.
                    let path = config
                        .output_dir
                        .join(format!("{}_{:04}.dat", config.base_name, file_counter));
                    file_counter += 1;
                    match tokio::fs::File::create(&path).await {
                        Ok(f) => {
                            info!(element = %element_name, path = %path.display(), "recording");
                            serializer = serializer_for(config.format);
                            serializer.initialize(&mut buf);
                            file = Some(f);
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "cannot create file");
                            file = None;
                        }
                    }
                }
                TagKind::SourceEnded | TagKind::EndOfStream => {
                    if let Some(mut f) = file.take() {
                        if !buf.is_empty() {
                            let _ = f.write_all(&buf.split()).await;
                        }
                        let _ = f.flush().await;
                    }
                    if tag.kind() == TagKind::EndOfStream {
                        return;
                    }
                }
                _ => {
                    serializer.serialize(&tag, &mut buf);
                    if buf.len() >= 64 * 1024 {
                        if let Some(f) = file.as_mut() {
                            if f.write_all(&buf.split()).await.is_err() {
                                warn!(element = %element_name, "write failed, stopping spool");
                                return;
                            }
                        } else {
                            buf.clear();
                        }
                    }
                }
            }
        }
        // Channel closed: flush what remains.
        if let Some(mut f) = file.take() {
            if !buf.is_empty() {
                let _ = f.write_all(&buf).await;
            }
            let _ = f.flush().await;
        }
    }
}

impl Element for SavingElement {
    fn class_name(&self) -> &'static str {
        ELEMENT_CLASS_NAME
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(self: Arc<Self>) -> bool {
        let req = Request::internal();
        let (tx, rx) = kanal::unbounded::<Tag>();
        if !self.mapper.add_request(&self.config.media, &req, tx) {
            warn!(
                element = %self.name,
                media = %self.config.media,
                "cannot register to the media to record"
            );
            return false;
        }
        *self.spool_req.lock() = Some(req.id());
        tokio::spawn(Self::spool(
            self.config.clone(),
            rx.to_async(),
            self.name.clone(),
        ));
        true
    }

    fn add_request(self: Arc<Self>, path: &str, req: &Request, sink: TagSink) -> bool {
        // Transparent: requests flow straight through to the saved media.
        let Some(rest) = strip_element_prefix(path, &self.name) else {
            return false;
        };
        let target = if rest.is_empty() {
            self.config.media.clone()
        } else {
            rest.to_string()
        };
        self.mapper.add_request(&target, req, sink)
    }

    fn remove_request(&self, path: &str, req_id: RequestId) {
        let Some(rest) = strip_element_prefix(path, &self.name) else {
            return;
        };
        let target = if rest.is_empty() {
            self.config.media.clone()
        } else {
            rest.to_string()
        };
        self.mapper.remove_request(&target, req_id);
    }

    fn has_media(&self, path: &str) -> bool {
        strip_element_prefix(path, &self.name).is_some()
    }

    fn list_media(&self, dir: &str, out: &mut Vec<String>) {
        if strip_element_prefix(dir, &self.name).is_some() {
            out.push(crate::element::join_media(&self.name, &self.config.media));
        }
    }

    fn describe_media(&self, path: &str, sink: MediaInfoSink) -> bool {
        let Some(rest) = strip_element_prefix(path, &self.name) else {
            return false;
        };
        let target = if rest.is_empty() {
            self.config.media.clone()
        } else {
            rest.to_string()
        };
        self.mapper.describe_media(&target, sink)
    }

    fn close(&self, done: CloseDone) {
        if let Some(req_id) = self.spool_req.lock().take() {
            self.mapper.remove_request(&self.config.media, req_id);
        }
        let _ = done.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::ElementMapper;
    use crate::test_utils::NullElement;
    use bytes::Bytes;
    use media_tag::{DEFAULT_FLAVOUR_MASK, MediaFrame, MediaFrameKind, TagPayload};
    use std::path::Path;
    use std::time::Duration;

    fn raw_tag(data: &'static [u8]) -> Tag {
        Tag::new(
            DEFAULT_FLAVOUR_MASK,
            TagPayload::Frame(MediaFrame {
                kind: MediaFrameKind::Raw,
                format: MediaFormat::Raw,
                is_keyframe: false,
                data: Bytes::from_static(data),
            }),
        )
    }

    async fn wait_for_file(path: &Path, expected: &[u8]) {
        for _ in 0..500 {
            if std::fs::read(path).is_ok_and(|content| content == expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "file {} never reached the expected content",
            path.display()
        );
    }

    #[tokio::test]
    async fn rotates_one_file_per_source_run_and_flushes_on_end() {
        let dir = tempfile::tempdir().unwrap();
        let mapper = ElementMapper::new();
        let source = Arc::new(NullElement::new("src"));
        mapper.register(source.clone());

        let element = SavingElement::new(
            "save",
            mapper.borrow(),
            SavingConfig {
                media: "src/live".to_string(),
                output_dir: dir.path().to_path_buf(),
                base_name: "rec".to_string(),
                format: MediaFormat::Raw,
            },
        );
        assert!(element.clone().initialize());
        assert_eq!(source.request_count(), 1);

        // First source run: its bytes land in the first file, flushed at
        // the source boundary.
        source.push("src/live", Tag::source_started(DEFAULT_FLAVOUR_MASK, "src/live", "src"));
        source.push("src/live", raw_tag(b"abc"));
        source.push("src/live", raw_tag(b"def"));
        source.push("src/live", Tag::source_ended(DEFAULT_FLAVOUR_MASK, "src/live", "src"));
        wait_for_file(&dir.path().join("rec_0000.dat"), b"abcdef").await;

        // Second run rotates to a fresh file.
        source.push("src/live", Tag::source_started(DEFAULT_FLAVOUR_MASK, "src/live", "src"));
        source.push("src/live", raw_tag(b"xyz"));
        source.push("src/live", Tag::source_ended(DEFAULT_FLAVOUR_MASK, "src/live", "src"));
        wait_for_file(&dir.path().join("rec_0001.dat"), b"xyz").await;

        // End of stream stops the spool; the files stay as flushed.
        source.push("src/live", Tag::eos(DEFAULT_FLAVOUR_MASK, false));
        crate::test_utils::settle().await;
        assert_eq!(
            std::fs::read(dir.path().join("rec_0000.dat")).unwrap(),
            b"abcdef"
        );
    }

    #[tokio::test]
    async fn requests_pass_through_to_the_saved_media() {
        let mapper = ElementMapper::new();
        let source = Arc::new(NullElement::new("src"));
        mapper.register(source.clone());
        let dir = tempfile::tempdir().unwrap();
        let element = SavingElement::new(
            "save",
            mapper.borrow(),
            SavingConfig {
                media: "src/live".to_string(),
                output_dir: dir.path().to_path_buf(),
                base_name: "rec".to_string(),
                format: MediaFormat::Raw,
            },
        );
        mapper.register(element);

        // The bare element name resolves to the recorded media.
        let req = Request::new();
        let (tx, _rx) = kanal::unbounded();
        assert!(mapper.add_request("save", &req, tx));
        assert_eq!(source.request_count(), 1);

        mapper.remove_request("save", req.id());
        assert_eq!(source.request_count(), 0);
    }
}
