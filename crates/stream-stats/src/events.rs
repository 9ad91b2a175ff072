//! Statistic event payloads. Three families (connection, stream, media),
//! each with a `Begin` snapshot taken once and an `End` record the
//! application keeps updating until the entity goes away.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionBegin {
    pub connection_id: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub local_port: u16,
    pub protocol: String,
    pub begin_utc_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEnd {
    pub connection_id: String,
    pub end_utc_ms: i64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub result: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamBegin {
    pub stream_id: String,
    pub connection_id: String,
    pub session_id: String,
    pub begin_utc_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamEnd {
    pub stream_id: String,
    pub end_utc_ms: i64,
    pub result: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaBegin {
    pub media_id: String,
    pub stream_id: String,
    pub media_name: String,
    pub begin_utc_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaEnd {
    pub media_id: String,
    pub end_utc_ms: i64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub audio_frames: u64,
    pub video_frames: u64,
    pub dropped_frames: u64,
    pub media_time_ms: i64,
    pub result: String,
}

/// One event as broadcast to the savers: the server identity plus exactly
/// one of the begin/end payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaStatEvent {
    pub server_id: String,
    pub server_instance: i64,
    #[serde(flatten)]
    pub payload: StatPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatPayload {
    ConnectionBegin(ConnectionBegin),
    ConnectionEnd(ConnectionEnd),
    StreamBegin(StreamBegin),
    StreamEnd(StreamEnd),
    MediaBegin(MediaBegin),
    MediaEnd(MediaEnd),
}
