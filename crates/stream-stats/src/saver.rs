use tracing::info;

use crate::events::MediaStatEvent;

/// Where broadcast statistics go. Savers run on the collector's worker
/// thread; slow sinks delay other savers, never the data plane.
pub trait StatsSaver: Send + 'static {
    fn save(&self, event: &MediaStatEvent);
}

/// Emits every event as a structured log line.
pub struct LogStatsSaver;

impl StatsSaver for LogStatsSaver {
    fn save(&self, event: &MediaStatEvent) {
        match serde_json::to_string(event) {
            Ok(encoded) => info!(target: "stats", event = %encoded),
            Err(_) => info!(target: "stats", ?event),
        }
    }
}
