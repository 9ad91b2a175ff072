use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Structural description of a media stream, delivered once at the head of a
/// stream and cached by source elements keyed on file path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub has_audio: bool,
    pub has_video: bool,
    pub audio_codec: Option<String>,
    pub video_codec: Option<String>,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub duration_ms: i64,
    /// Serialized `moov` bytes for containers that carry one.
    #[serde(skip)]
    pub moov: Option<Bytes>,
}

impl MediaInfo {
    pub fn seekable(&self) -> bool {
        self.moov.is_some()
    }
}
