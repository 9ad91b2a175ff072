//! # Stream Stats
//!
//! Live statistics for connections, streams and media sessions: a bounded
//! producer-consumer queue feeding a dedicated saver thread, plus
//! in-memory maps for on-demand queries. Producers never block: a full
//! queue drops the event and logs.

mod collector;
mod events;
mod saver;

pub use collector::{STATS_QUEUE_SIZE, StatsCollector, StatsRpc};
pub use events::{
    ConnectionBegin, ConnectionEnd, MediaBegin, MediaEnd, MediaStatEvent, StatPayload,
    StreamBegin, StreamEnd,
};
pub use saver::{LogStatsSaver, StatsSaver};
