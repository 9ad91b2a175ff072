//! The collector: live maps for on-demand queries, plus a bounded queue
//! feeding a dedicated worker thread that broadcasts every event to the
//! registered savers. Enqueueing never blocks the data plane: a full
//! queue logs and drops the event.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::events::{
    ConnectionBegin, ConnectionEnd, MediaBegin, MediaEnd, MediaStatEvent, StatPayload,
    StreamBegin, StreamEnd,
};
use crate::saver::StatsSaver;

/// Capacity of the saver queue.
pub const STATS_QUEUE_SIZE: usize = 2000;

struct Live<B, E> {
    begin: B,
    end: Option<E>,
}

pub struct StatsCollector {
    server_id: String,
    server_instance: i64,
    queue: Mutex<Option<SyncSender<MediaStatEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    // The connection map may be touched from secondary network threads;
    // stream and media maps stay on the loop but share the locking shape.
    connections: Mutex<HashMap<String, Live<ConnectionBegin, ConnectionEnd>>>,
    streams: Mutex<HashMap<String, Live<StreamBegin, StreamEnd>>>,
    medias: Mutex<HashMap<String, Live<MediaBegin, MediaEnd>>>,
}

impl StatsCollector {
    pub fn new(server_id: impl Into<String>, server_instance: i64) -> Arc<StatsCollector> {
        Arc::new(StatsCollector {
            server_id: server_id.into(),
            server_instance,
            queue: Mutex::new(None),
            worker: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            medias: Mutex::new(HashMap::new()),
        })
    }

    /// Start the saver worker. Idempotent start is an error; call once.
    pub fn start(&self, savers: Vec<Box<dyn StatsSaver>>) {
        let mut queue = self.queue.lock();
        assert!(queue.is_none(), "stats collector already started");
        let (tx, rx): (SyncSender<MediaStatEvent>, Receiver<MediaStatEvent>) =
            sync_channel(STATS_QUEUE_SIZE);
        *queue = Some(tx);
        let server_id = self.server_id.clone();
        *self.worker.lock() = Some(std::thread::spawn(move || {
            info!(server_id = %server_id, "stats collector thread running");
            while let Ok(event) = rx.recv() {
                for saver in &savers {
                    saver.save(&event);
                }
            }
            info!("stats collector thread stopped");
        }));
    }

    /// Stop the worker, draining what was already queued.
    pub fn stop(&self) {
        *self.queue.lock() = None;
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }

    fn enqueue(&self, payload: StatPayload) {
        let queue = self.queue.lock();
        let Some(tx) = queue.as_ref() else {
            return;
        };
        let event = MediaStatEvent {
            server_id: self.server_id.clone(),
            server_instance: self.server_instance,
            payload,
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                // Stats must never block the data plane.
                warn!(payload = ?event.payload, "stats queue full, dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn begin_connection(&self, stat: ConnectionBegin) {
        self.connections.lock().insert(
            stat.connection_id.clone(),
            Live {
                begin: stat.clone(),
                end: None,
            },
        );
        self.enqueue(StatPayload::ConnectionBegin(stat));
    }

    /// Update the continuously-changing end record; re-emitted so savers
    /// see progress on long-lived connections.
    pub fn update_connection(&self, stat: ConnectionEnd) {
        if let Some(live) = self.connections.lock().get_mut(&stat.connection_id) {
            live.end = Some(stat.clone());
        }
        self.enqueue(StatPayload::ConnectionEnd(stat));
    }

    pub fn end_connection(&self, stat: ConnectionEnd) {
        self.connections.lock().remove(&stat.connection_id);
        self.enqueue(StatPayload::ConnectionEnd(stat));
    }

    pub fn begin_stream(&self, stat: StreamBegin) {
        self.streams.lock().insert(
            stat.stream_id.clone(),
            Live {
                begin: stat.clone(),
                end: None,
            },
        );
        self.enqueue(StatPayload::StreamBegin(stat));
    }

    pub fn update_stream(&self, stat: StreamEnd) {
        if let Some(live) = self.streams.lock().get_mut(&stat.stream_id) {
            live.end = Some(stat.clone());
        }
        self.enqueue(StatPayload::StreamEnd(stat));
    }

    pub fn end_stream(&self, stat: StreamEnd) {
        self.streams.lock().remove(&stat.stream_id);
        self.enqueue(StatPayload::StreamEnd(stat));
    }

    pub fn begin_media(&self, stat: MediaBegin) {
        self.medias.lock().insert(
            stat.media_id.clone(),
            Live {
                begin: stat.clone(),
                end: None,
            },
        );
        self.enqueue(StatPayload::MediaBegin(stat));
    }

    pub fn update_media(&self, stat: MediaEnd) {
        if let Some(live) = self.medias.lock().get_mut(&stat.media_id) {
            live.end = Some(stat.clone());
        }
        self.enqueue(StatPayload::MediaEnd(stat));
    }

    pub fn end_media(&self, stat: MediaEnd) {
        self.medias.lock().remove(&stat.media_id);
        self.enqueue(StatPayload::MediaEnd(stat));
    }

    pub fn get_all_stream_ids(&self) -> Vec<String> {
        self.streams.lock().keys().cloned().collect()
    }

    /// Live stream stats for the given ids, or for every stream when the
    /// list is empty.
    pub fn get_streams_stats(&self, ids: &[String]) -> Vec<(StreamBegin, Option<StreamEnd>)> {
        let streams = self.streams.lock();
        let pick = |live: &Live<StreamBegin, StreamEnd>| (live.begin.clone(), live.end.clone());
        if ids.is_empty() {
            return streams.values().map(pick).collect();
        }
        ids.iter()
            .filter_map(|id| streams.get(id).map(pick))
            .collect()
    }

    /// A page of the live media map.
    pub fn get_detailed_media_stats(
        &self,
        start: usize,
        limit: usize,
    ) -> Vec<(MediaBegin, Option<MediaEnd>)> {
        let medias = self.medias.lock();
        let mut ids: Vec<&String> = medias.keys().collect();
        ids.sort();
        ids.into_iter()
            .skip(start)
            .take(limit)
            .filter_map(|id| medias.get(id))
            .map(|live| (live.begin.clone(), live.end.clone()))
            .collect()
    }
}

impl Drop for StatsCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The query face registered under the stats service name.
pub struct StatsRpc {
    collector: Arc<StatsCollector>,
}

impl StatsRpc {
    pub fn new(collector: Arc<StatsCollector>) -> Arc<StatsRpc> {
        Arc::new(StatsRpc { collector })
    }
}

impl stream_graph::RpcService for StatsRpc {
    fn invoke(&self, method: &str, params: Value) -> Result<Value, stream_graph::RpcError> {
        match method {
            "GetAllStreamIds" => Ok(json!(self.collector.get_all_stream_ids())),
            "GetStreamsStats" => {
                let ids: Vec<String> = serde_json::from_value(params).unwrap_or_default();
                Ok(json!(self.collector.get_streams_stats(&ids)))
            }
            "GetDetailedMediaStats" => {
                #[derive(serde::Deserialize, Default)]
                struct Page {
                    #[serde(default)]
                    start: usize,
                    #[serde(default = "page_limit")]
                    limit: usize,
                }
                fn page_limit() -> usize {
                    100
                }
                let page: Page = serde_json::from_value(params).unwrap_or_default();
                Ok(json!(
                    self.collector.get_detailed_media_stats(page.start, page.limit)
                ))
            }
            other => Err(stream_graph::RpcError::NoSuchMethod {
                service: "stats".to_string(),
                method: other.to_string(),
            }),
        }
    }
}
