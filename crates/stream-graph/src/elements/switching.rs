//! The switching element: a policy-driven multiplexer with at most one
//! upstream registration at a time and per-flavour fan-out downstream.
//!
//! Upstream tags arrive on a pump task and are funneled through a command
//! channel together with policy switches, delayed registrations and the
//! tag-receive timeout, so all state changes happen in one place. A
//! generation counter guards against stale pumps and stale alarms after a
//! switch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use media_tag::{Capabilities, FlavourMask, Request, RequestId, RequestInfo, Tag, TagKind};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::distributor::TagDistributor;
use crate::element::{CloseDone, Element, MediaInfoSink, TagSink, strip_element_prefix};
use crate::elements::normalizing::TagNormalizer;
use crate::mapper::MapperRef;
use crate::policies::Policy;

pub const ELEMENT_CLASS_NAME: &str = "switching";

/// Tag-timeout alarms are re-registered at most this often.
pub const TAG_TIMEOUT_REGISTRATION_GRACE_PERIOD_MS: u64 = 1000;
/// Minimum interval between consecutive upstream registrations, so a source
/// that EOSes instantly cannot tight-loop the element.
pub const REGISTER_MIN_INTERVAL_MS: u64 = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwitchState {
    Idle,
    Registered,
    Switching,
    Closing,
}

pub(crate) enum SwitchCmd {
    UpstreamTag { generation: u64, tag: Tag },
    UpstreamClosed { generation: u64 },
    Register { media: String },
    TagTimeout { timeout_generation: u64 },
    Switch { media: String, force: bool },
}

/// The lever a policy uses to command its element. Sends never block; a
/// handle outliving its element becomes a no-op.
#[derive(Clone)]
pub struct SwitchHandle {
    tx: kanal::Sender<SwitchCmd>,
}

impl SwitchHandle {
    pub fn switch(&self, media: impl Into<String>, force: bool) {
        let _ = self.tx.send(SwitchCmd::Switch {
            media: media.into(),
            force,
        });
    }
}

#[derive(Debug, Clone)]
pub struct SwitchingConfig {
    pub caps: Capabilities,
    /// Force a policy-driven switch when no tag arrives for this long.
    /// Zero disables the alarm.
    pub tag_timeout_ms: u64,
    /// Bound on how far ahead of wall clock normalized timestamps may run.
    pub write_ahead_ms: i64,
    /// Register upstream only while clients exist.
    pub media_only_when_used: bool,
}

impl Default for SwitchingConfig {
    fn default() -> Self {
        SwitchingConfig {
            caps: Capabilities::any(),
            tag_timeout_ms: 0,
            write_ahead_ms: 0,
            media_only_when_used: false,
        }
    }
}

struct SwitchInner {
    state: SwitchState,
    /// Media we are currently registered to; cleared on unregister.
    current_media: String,
    /// Media the policy last chose; what (re)registration targets.
    pending_media: String,
    upstream_generation: u64,
    upstream_req_id: Option<RequestId>,
    upstream_path: Option<String>,
    distributors: HashMap<u8, TagDistributor>,
    client_flavours: HashMap<RequestId, FlavourMask>,
    normalizer: TagNormalizer,
    last_register: Option<Instant>,
    last_timeout_registration: Option<Instant>,
    timeout_generation: u64,
    close_done: Option<CloseDone>,
    policy: Option<Box<dyn Policy>>,
}

pub struct SwitchingElement {
    name: String,
    mapper: MapperRef,
    config: SwitchingConfig,
    cmd_tx: kanal::Sender<SwitchCmd>,
    cmd_rx: Mutex<Option<kanal::Receiver<SwitchCmd>>>,
    inner: Mutex<SwitchInner>,
}

impl SwitchingElement {
    pub fn new(
        name: impl Into<String>,
        mapper: MapperRef,
        config: SwitchingConfig,
    ) -> Arc<SwitchingElement> {
        let (cmd_tx, cmd_rx) = kanal::unbounded();
        let write_ahead_ms = config.write_ahead_ms;
        Arc::new(SwitchingElement {
            name: name.into(),
            mapper,
            config,
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            inner: Mutex::new(SwitchInner {
                state: SwitchState::Idle,
                current_media: String::new(),
                pending_media: String::new(),
                upstream_generation: 0,
                upstream_req_id: None,
                upstream_path: None,
                distributors: HashMap::new(),
                client_flavours: HashMap::new(),
                normalizer: TagNormalizer::new(write_ahead_ms),
                last_register: None,
                last_timeout_registration: None,
                timeout_generation: 0,
                close_done: None,
                policy: None,
            }),
        })
    }

    /// The handle policies use to command this element.
    pub fn handle(&self) -> SwitchHandle {
        SwitchHandle {
            tx: self.cmd_tx.clone(),
        }
    }

    /// Install the policy; must happen before `initialize`.
    pub fn set_policy(&self, policy: Box<dyn Policy>) {
        self.inner.lock().policy = Some(policy);
    }

    pub fn current_media(&self) -> String {
        let inner = self.inner.lock();
        if inner.current_media.is_empty() {
            inner.pending_media.clone()
        } else {
            inner.current_media.clone()
        }
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().client_flavours.len()
    }

    pub fn switch_current_media(
        &self,
        media: &str,
        _info: Option<&RequestInfo>,
        force: bool,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == SwitchState::Closing {
            return false;
        }
        if !force && inner.current_media == media {
            return true;
        }
        info!(element = %self.name, media, force, "switching current media");
        inner.pending_media = media.to_string();
        self.unregister_locked(&mut inner, true);
        if self.config.media_only_when_used && inner.client_flavours.is_empty() {
            // Stay idle; the first client triggers the registration.
            inner.state = SwitchState::Idle;
            return true;
        }
        self.schedule_register(&mut inner, media.to_string());
        true
    }

    /// Drop the upstream link. `quiet` skips nothing here: the upstream's
    /// own source-ended has either arrived already (natural EOS) or is
    /// deliberately suppressed (close).
    fn unregister_locked(&self, inner: &mut SwitchInner, _quiet: bool) {
        if let (Some(path), Some(req_id)) = (inner.upstream_path.take(), inner.upstream_req_id.take())
        {
            // Invalidate the pump and any pending alarms first.
            inner.upstream_generation += 1;
            inner.timeout_generation += 1;
            self.mapper.remove_request(&path, req_id);
        }
        inner.current_media.clear();
        if inner.state == SwitchState::Registered {
            inner.state = SwitchState::Idle;
        }
    }

    fn schedule_register(&self, inner: &mut SwitchInner, media: String) {
        inner.state = SwitchState::Switching;
        inner.pending_media = media.clone();
        let wait = match inner.last_register {
            Some(last) => {
                let min = Duration::from_millis(REGISTER_MIN_INTERVAL_MS);
                min.checked_sub(last.elapsed()).unwrap_or(Duration::ZERO)
            }
            None => Duration::ZERO,
        };
        if wait.is_zero() {
            let _ = self.cmd_tx.send(SwitchCmd::Register { media });
            return;
        }
        debug!(element = %self.name, ?wait, "delaying upstream registration");
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let _ = tx.send(SwitchCmd::Register { media });
        });
    }

    fn register_now(self: &Arc<Self>, media: String) {
        let generation;
        {
            let mut inner = self.inner.lock();
            if inner.state == SwitchState::Closing {
                return;
            }
            if inner.pending_media != media {
                // A newer switch superseded this registration.
                return;
            }
            if inner.upstream_req_id.is_some() {
                self.unregister_locked(&mut inner, true);
            }
            inner.upstream_generation += 1;
            generation = inner.upstream_generation;
            inner.last_register = Some(Instant::now());
        }

        let mut req = Request::internal();
        req.caps = self.config.caps;
        let (tx, rx) = kanal::unbounded::<Tag>();
        if !self.mapper.add_request(&media, &req, tx) {
            warn!(element = %self.name, media = %media, "upstream refused registration, retrying");
            let mut inner = self.inner.lock();
            if inner.pending_media == media && inner.state != SwitchState::Closing {
                inner.last_register = Some(Instant::now());
                self.schedule_register(&mut inner, media);
            }
            return;
        }

        {
            let mut inner = self.inner.lock();
            if inner.pending_media != media || inner.state == SwitchState::Closing {
                // Superseded while the registration was in flight.
                drop(inner);
                self.mapper.remove_request(&media, req.id());
                return;
            }
            inner.upstream_req_id = Some(req.id());
            inner.upstream_path = Some(media.clone());
            inner.current_media = media.clone();
            inner.state = SwitchState::Registered;
            self.arm_tag_timeout(&mut inner, true);
        }
        info!(element = %self.name, media = %media, "registered upstream");

        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let rx = rx.to_async();
            while let Ok(tag) = rx.recv().await {
                if cmd_tx.send(SwitchCmd::UpstreamTag { generation, tag }).is_err() {
                    return;
                }
            }
            let _ = cmd_tx.send(SwitchCmd::UpstreamClosed { generation });
        });
    }

    fn arm_tag_timeout(&self, inner: &mut SwitchInner, force: bool) {
        if self.config.tag_timeout_ms == 0 {
            return;
        }
        let now = Instant::now();
        if !force {
            let grace = Duration::from_millis(TAG_TIMEOUT_REGISTRATION_GRACE_PERIOD_MS);
            if inner
                .last_timeout_registration
                .is_some_and(|last| now.duration_since(last) < grace)
            {
                return;
            }
        }
        inner.last_timeout_registration = Some(now);
        inner.timeout_generation += 1;
        let timeout_generation = inner.timeout_generation;
        let timeout = Duration::from_millis(self.config.tag_timeout_ms);
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(SwitchCmd::TagTimeout { timeout_generation });
        });
    }

    fn handle_cmd(self: &Arc<Self>, cmd: SwitchCmd) {
        match cmd {
            SwitchCmd::Switch { media, force } => {
                self.switch_current_media(&media, None, force);
            }
            SwitchCmd::Register { media } => self.register_now(media),
            SwitchCmd::UpstreamTag { generation, tag } => {
                self.process_upstream_tag(generation, tag)
            }
            SwitchCmd::UpstreamClosed { generation } => {
                let stale = self.inner.lock().upstream_generation != generation;
                if !stale {
                    debug!(element = %self.name, "upstream channel closed");
                    self.stream_ended();
                }
            }
            SwitchCmd::TagTimeout { timeout_generation } => {
                let fire = {
                    let inner = self.inner.lock();
                    inner.timeout_generation == timeout_generation
                        && inner.state == SwitchState::Registered
                };
                if fire {
                    warn!(element = %self.name, "tag receive timeout, forcing a switch");
                    self.stream_ended();
                }
            }
        }
    }

    fn process_upstream_tag(self: &Arc<Self>, generation: u64, tag: Tag) {
        let mut inner = self.inner.lock();
        if inner.upstream_generation != generation {
            return;
        }
        self.arm_tag_timeout(&mut inner, false);

        let mut tag = tag;
        inner.normalizer.process(&mut tag);
        if let Some(policy) = inner.policy.as_mut() {
            policy.notify_tag(&tag);
        }

        if tag.kind() == TagKind::EndOfStream {
            drop(inner);
            self.stream_ended();
            return;
        }

        let mut mask = tag.flavour_mask;
        while let Some(id) = mask.pop_rightmost() {
            let distributor = inner
                .distributors
                .entry(id)
                .or_insert_with(|| TagDistributor::new(FlavourMask::single(id)));
            let narrowed = tag.with_flavour_mask(FlavourMask::single(id));
            distributor.dispatch(&narrowed);
        }
    }

    /// The upstream stream is over (natural EOS, closed channel or tag
    /// timeout): consult the policy.
    fn stream_ended(self: &Arc<Self>) {
        let keep = {
            let mut inner = self.inner.lock();
            if inner.state == SwitchState::Closing {
                return;
            }
            self.unregister_locked(&mut inner, true);
            inner.state = SwitchState::Switching;
            match inner.policy.as_mut() {
                Some(policy) => policy.notify_eos(),
                // Without a policy there is nothing to switch to.
                None => false,
            }
        };
        if !keep {
            info!(element = %self.name, "policy is terminal, ending all clients");
            let mut inner = self.inner.lock();
            for distributor in inner.distributors.values_mut() {
                distributor.send_eos(false);
            }
            inner.state = SwitchState::Idle;
        }
        // keep == true: the policy pushed (or will push) the next switch
        // through its handle.
    }
}

impl Element for SwitchingElement {
    fn class_name(&self) -> &'static str {
        ELEMENT_CLASS_NAME
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(self: Arc<Self>) -> bool {
        let Some(rx) = self.cmd_rx.lock().take() else {
            return false;
        };
        let weak = Arc::downgrade(&self);
        tokio::spawn(async move {
            let rx = rx.to_async();
            while let Ok(cmd) = rx.recv().await {
                match weak.upgrade() {
                    Some(element) => element.handle_cmd(cmd),
                    None => break,
                }
            }
        });
        let mut inner = self.inner.lock();
        match inner.policy.as_mut() {
            Some(policy) => policy.initialize(),
            None => true,
        }
    }

    fn add_request(self: Arc<Self>, path: &str, req: &Request, sink: TagSink) -> bool {
        // A switching element serves media only under its own name.
        if strip_element_prefix(path, &self.name) != Some("") {
            return false;
        }
        let mut inner = self.inner.lock();
        if inner.state == SwitchState::Closing {
            return false;
        }
        if !self.config.caps.is_compatible(&req.caps) {
            warn!(element = %self.name, "request capabilities are incompatible");
            return false;
        }
        let mask = req.caps.flavours.intersect(self.config.caps.flavours);
        let mut ids = mask;
        while let Some(id) = ids.pop_rightmost() {
            inner
                .distributors
                .entry(id)
                .or_insert_with(|| TagDistributor::new(FlavourMask::single(id)))
                .add_client(req.id(), sink.clone());
        }
        inner.client_flavours.insert(req.id(), mask);

        if self.config.media_only_when_used
            && inner.client_flavours.len() == 1
            && inner.state == SwitchState::Idle
            && !inner.pending_media.is_empty()
        {
            let media = inner.pending_media.clone();
            self.schedule_register(&mut inner, media);
        }
        true
    }

    fn remove_request(&self, path: &str, req_id: RequestId) {
        if strip_element_prefix(path, &self.name) != Some("") {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.client_flavours.remove(&req_id).is_none() {
            return;
        }
        for distributor in inner.distributors.values_mut() {
            distributor.remove_client(req_id);
        }
        if self.config.media_only_when_used
            && inner.client_flavours.is_empty()
            && inner.state != SwitchState::Closing
        {
            debug!(element = %self.name, "last client left, unregistering upstream");
            self.unregister_locked(&mut inner, true);
            inner.state = SwitchState::Idle;
        }
        if inner.state == SwitchState::Closing && inner.client_flavours.is_empty() {
            if let Some(done) = inner.close_done.take() {
                let _ = done.send(());
            }
        }
    }

    fn has_media(&self, path: &str) -> bool {
        strip_element_prefix(path, &self.name) == Some("")
    }

    fn list_media(&self, dir: &str, out: &mut Vec<String>) {
        if dir.is_empty() || dir == self.name {
            out.push(self.name.clone());
        }
    }

    fn describe_media(&self, _path: &str, sink: MediaInfoSink) -> bool {
        let media = self.current_media();
        if media.is_empty() {
            return false;
        }
        self.mapper.describe_media(&media, sink)
    }

    fn close(&self, done: CloseDone) {
        let mut inner = self.inner.lock();
        if inner.state == SwitchState::Closing {
            let _ = done.send(());
            return;
        }
        // First drop the upstream without propagating source-ended, then
        // give every client its EOS.
        self.unregister_locked(&mut inner, true);
        inner.state = SwitchState::Closing;
        if inner.client_flavours.is_empty() {
            let _ = done.send(());
            return;
        }
        inner.close_done = Some(done);
        for distributor in inner.distributors.values_mut() {
            distributor.send_eos(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::ElementMapper;
    use crate::test_utils::{NullElement, collect_ready, settle, video_tag};
    use media_tag::DEFAULT_FLAVOUR_MASK;

    struct StaticPolicy {
        media: String,
        handle: SwitchHandle,
        keep_alive: bool,
    }

    impl Policy for StaticPolicy {
        fn class_name(&self) -> &'static str {
            "static"
        }
        fn initialize(&mut self) -> bool {
            self.handle.switch(self.media.clone(), true);
            true
        }
        fn notify_tag(&mut self, _tag: &Tag) {}
        fn notify_eos(&mut self) -> bool {
            if self.keep_alive {
                self.handle.switch(self.media.clone(), true);
            }
            self.keep_alive
        }
        fn reset(&mut self) {}
    }

    fn build(
        keep_alive: bool,
        media_only_when_used: bool,
    ) -> (Arc<ElementMapper>, Arc<NullElement>, Arc<SwitchingElement>) {
        let mapper = ElementMapper::new();
        let source = Arc::new(NullElement::new("src"));
        mapper.register(source.clone());
        let element = SwitchingElement::new(
            "switch",
            mapper.borrow(),
            SwitchingConfig {
                media_only_when_used,
                ..SwitchingConfig::default()
            },
        );
        element.set_policy(Box::new(StaticPolicy {
            media: "src/live".into(),
            handle: element.handle(),
            keep_alive,
        }));
        mapper.register(element.clone());
        assert!(element.clone().initialize());
        (mapper, source, element)
    }

    #[tokio::test]
    async fn registers_upstream_and_fans_out() {
        let (mapper, source, element) = build(true, false);
        settle().await;
        assert_eq!(source.request_count(), 1);
        assert_eq!(element.current_media(), "src/live");

        let req = Request::new();
        let (tx, rx) = kanal::unbounded();
        assert!(mapper.add_request("switch", &req, tx));

        source.push("src/live", video_tag(0, true));
        settle().await;

        let got = collect_ready(&rx);
        assert_eq!(got.len(), 1);
        assert!(got[0].flavour_mask.is_subset_of(DEFAULT_FLAVOUR_MASK));
    }

    #[tokio::test]
    async fn bootstrap_keyframe_replayed_to_late_joiner() {
        let (mapper, source, _element) = build(true, false);
        settle().await;

        source.push("src/live", video_tag(5000, true));
        settle().await;

        let req = Request::new();
        let (tx, rx) = kanal::unbounded();
        assert!(mapper.add_request("switch", &req, tx));
        let got = collect_ready(&rx);
        let keyframe = got
            .iter()
            .find(|t| t.kind() == TagKind::VideoFrame)
            .expect("bootstrap keyframe");
        assert_eq!(keyframe.timestamp_ms, 0);
        assert!(keyframe.can_resync());
    }

    #[tokio::test]
    async fn media_only_when_used_defers_registration() {
        let (mapper, source, element) = build(true, true);
        settle().await;
        assert_eq!(source.request_count(), 0);

        let req = Request::new();
        let (tx, _rx) = kanal::unbounded();
        assert!(mapper.add_request("switch", &req, tx));
        settle().await;
        assert_eq!(source.request_count(), 1);

        mapper.remove_request("switch", req.id());
        settle().await;
        assert_eq!(source.request_count(), 0);
        let _ = element;
    }

    #[tokio::test]
    async fn terminal_policy_sends_eos_downstream() {
        let (mapper, source, _element) = build(false, false);
        settle().await;

        let req = Request::new();
        let (tx, rx) = kanal::unbounded();
        assert!(mapper.add_request("switch", &req, tx));

        source.push("src/live", Tag::eos(DEFAULT_FLAVOUR_MASK, false));
        settle().await;

        let got = collect_ready(&rx);
        assert_eq!(got.len(), 1);
        assert!(got[0].is_eos());
    }

    #[tokio::test]
    async fn close_delivers_exactly_one_eos_then_completes() {
        let (mapper, _source, element) = build(true, false);
        settle().await;

        let req = Request::new();
        let (tx, rx) = kanal::unbounded();
        assert!(mapper.add_request("switch", &req, tx));

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        element.close(done_tx);

        let got = collect_ready(&rx);
        assert_eq!(got.iter().filter(|t| t.is_eos()).count(), 1);

        // New requests are refused during close.
        let late = Request::new();
        let (late_tx, _late_rx) = kanal::unbounded();
        assert!(!mapper.add_request("switch", &late, late_tx));

        mapper.remove_request("switch", req.id());
        done_rx.await.expect("close completes");
    }
}
