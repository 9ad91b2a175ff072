//! The standard element library: serde specs for every element and policy
//! kind, a factory that builds, registers and initializes them, and the
//! root RPC service (`AddElementSpec`, `ResolveMedia`,
//! `GetSwitchCurrentMedia`, `RecursiveGetSwitchCurrentMedia`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use media_tag::{Capabilities, MediaFormat};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::element::Element;
use crate::elements::aio_file::{AioFileConfig, AioFileElement};
use crate::elements::authorizer::SimpleAuthorizer;
use crate::elements::balancer::LoadBalancingElement;
use crate::elements::debugger::new_debugger_element;
use crate::elements::dropping::{DroppingConfig, new_dropping_element};
use crate::elements::f4v_to_flv::new_f4v_to_flv_element;
use crate::elements::http_client::{
    DEFAULT_HTTP_RETRY_TIMEOUT_MS, HttpClientElement, HttpEndpoint,
};
use crate::elements::http_poster::{HttpPosterConfig, HttpPosterElement};
use crate::elements::keyframe::new_keyframe_element;
use crate::elements::lookup::{LookupConfig, LookupElement};
use crate::elements::normalizing::new_normalizing_element;
use crate::elements::publishing::PublishingElement;
use crate::elements::redirecting::RedirectingElement;
use crate::elements::renamer::new_stream_renamer_element;
use crate::elements::resolver::{RemoteResolverElement, ResolveSpec, ResolverClient};
use crate::elements::saving::{SavingConfig, SavingElement};
use crate::elements::splitting::{DEFAULT_MAX_TAG_SIZE, new_splitting_element};
use crate::elements::switching::{SwitchingConfig, SwitchingElement};
use crate::elements::timesaving::{DEFAULT_SAVE_INTERVAL_MS, new_timesaving_element};
use crate::error::GraphError;
use crate::mapper::ElementMapper;
use crate::policies::{
    FailoverPolicy, FailoverPolicyConfig, OnCommandPolicy, PlaylistPolicy, RandomPolicy,
    TimedPlaylistPolicy,
};
use crate::rpc::{RpcError, RpcRegistry, RpcService};
use crate::state::{StateKeepUser, StateKeeper};

pub const RECURSIVE_SWITCH_MAX_DEPTH: usize = 16;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum PolicySpec {
    Random {
        media_dir: String,
        #[serde(default)]
        max_history_size: usize,
    },
    Playlist {
        playlist: Vec<String>,
        #[serde(default)]
        loop_playlist: bool,
    },
    TimedPlaylist {
        /// (duration_ms, media) entries.
        playlist: Vec<(u64, String)>,
        #[serde(default)]
        loop_playlist: bool,
        #[serde(default)]
        empty_policy: TimedEmptyPolicySpec,
    },
    Failover {
        main_media: String,
        failover_media: String,
        #[serde(default)]
        main_media_tags_received_switch_limit: u32,
        failover_timeout_ms: u64,
        #[serde(default)]
        change_to_main_only_on_switch: bool,
    },
    OnCommand {
        default_media: String,
    },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimedEmptyPolicySpec {
    Replay,
    Next,
    #[default]
    Wait,
}

impl From<TimedEmptyPolicySpec> for crate::policies::EmptyPolicy {
    fn from(spec: TimedEmptyPolicySpec) -> Self {
        match spec {
            TimedEmptyPolicySpec::Replay => crate::policies::EmptyPolicy::Replay,
            TimedEmptyPolicySpec::Next => crate::policies::EmptyPolicy::Next,
            TimedEmptyPolicySpec::Wait => crate::policies::EmptyPolicy::Wait,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpEndpointSpec {
    pub media: String,
    pub url: String,
    #[serde(default)]
    pub format: MediaFormat,
    #[serde(default = "default_true")]
    pub reopen_on_close: bool,
    #[serde(default)]
    pub fetch_only_on_request: bool,
    #[serde(default)]
    pub auth_user: Option<String>,
    #[serde(default)]
    pub auth_pass: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElementSpec {
    AioFile {
        name: String,
        root_dir: PathBuf,
        #[serde(default)]
        path_regex: Option<String>,
        #[serde(default)]
        default_index_file: Option<String>,
        #[serde(default)]
        format: MediaFormat,
        #[serde(default)]
        disable_pause: bool,
        #[serde(default)]
        disable_seek: bool,
        #[serde(default)]
        disable_duration: bool,
    },
    Dropping {
        name: String,
        #[serde(default)]
        media_filtered: String,
        audio_accept_period_ms: i64,
        audio_drop_period_ms: i64,
        video_accept_period_ms: i64,
        video_drop_period_ms: i64,
        #[serde(default)]
        video_grace_period_key_frames: i32,
    },
    Keyframe {
        name: String,
        ms_between_video_frames: i64,
        #[serde(default)]
        drop_audio: bool,
    },
    Normalizing {
        name: String,
        #[serde(default)]
        write_ahead_ms: i64,
    },
    StreamRenamer {
        name: String,
        pattern: String,
        replace: String,
    },
    F4vToFlvConverter {
        name: String,
    },
    Splitting {
        name: String,
        #[serde(default)]
        format: MediaFormat,
        #[serde(default)]
        max_tag_size: Option<usize>,
    },
    Debugger {
        name: String,
    },
    Switching {
        name: String,
        #[serde(default)]
        tag_timeout_ms: u64,
        #[serde(default)]
        write_ahead_ms: i64,
        #[serde(default)]
        media_only_when_used: bool,
        #[serde(default)]
        is_temp_policy: bool,
        policy: PolicySpec,
    },
    HttpClient {
        name: String,
        endpoints: Vec<HttpEndpointSpec>,
        #[serde(default)]
        retry_timeout_ms: Option<u64>,
    },
    HttpPoster {
        name: String,
        url: String,
        local_media: String,
        #[serde(default)]
        format: MediaFormat,
        #[serde(default)]
        auth_user: Option<String>,
        #[serde(default)]
        auth_pass: Option<String>,
        #[serde(default)]
        desired_http_chunk_size: Option<usize>,
        #[serde(default)]
        max_buffered_chunks: Option<usize>,
        #[serde(default)]
        reopen_interval_ms: Option<u64>,
    },
    Publishing {
        name: String,
    },
    Lookup {
        name: String,
        servers: Vec<String>,
        query_path_format: String,
        #[serde(default)]
        http_headers: Vec<(String, String)>,
        #[serde(default)]
        num_retries: Option<usize>,
        #[serde(default)]
        request_timeout_ms: Option<u64>,
        #[serde(default)]
        local_lookup_first: bool,
        #[serde(default)]
        media_format: MediaFormat,
    },
    LoadBalancing {
        name: String,
        sub_elements: Vec<String>,
    },
    Saving {
        name: String,
        media: String,
        output_dir: PathBuf,
        base_name: String,
        #[serde(default)]
        format: MediaFormat,
    },
    TimeSaving {
        name: String,
        #[serde(default)]
        save_interval_ms: Option<i64>,
    },
    Redirecting {
        name: String,
        rules: Vec<(String, String)>,
    },
}

impl ElementSpec {
    pub fn name(&self) -> &str {
        match self {
            ElementSpec::AioFile { name, .. }
            | ElementSpec::Dropping { name, .. }
            | ElementSpec::Keyframe { name, .. }
            | ElementSpec::Normalizing { name, .. }
            | ElementSpec::StreamRenamer { name, .. }
            | ElementSpec::F4vToFlvConverter { name }
            | ElementSpec::Splitting { name, .. }
            | ElementSpec::Debugger { name }
            | ElementSpec::Switching { name, .. }
            | ElementSpec::HttpClient { name, .. }
            | ElementSpec::HttpPoster { name, .. }
            | ElementSpec::Publishing { name }
            | ElementSpec::Lookup { name, .. }
            | ElementSpec::LoadBalancing { name, .. }
            | ElementSpec::Saving { name, .. }
            | ElementSpec::TimeSaving { name, .. }
            | ElementSpec::Redirecting { name, .. } => name,
        }
    }
}

/// The standard library: builds elements from specs, owns their RPC faces
/// and remembers the switching elements for the recursive media queries.
pub struct MediaLibrary {
    mapper: Arc<ElementMapper>,
    state_keeper: Arc<StateKeeper>,
    rpc: Arc<RpcRegistry>,
    switching: Mutex<HashMap<String, Weak<SwitchingElement>>>,
    authorizers: Mutex<HashMap<String, Arc<SimpleAuthorizer>>>,
}

impl MediaLibrary {
    pub fn new(
        mapper: Arc<ElementMapper>,
        state_keeper: Arc<StateKeeper>,
        rpc: Arc<RpcRegistry>,
    ) -> Arc<MediaLibrary> {
        let library = Arc::new(MediaLibrary {
            mapper,
            state_keeper,
            rpc: rpc.clone(),
            switching: Mutex::new(HashMap::new()),
            authorizers: Mutex::new(HashMap::new()),
        });
        rpc.register(
            "standard_library",
            Arc::new(RootService {
                library: Arc::downgrade(&library),
            }),
        );
        library
    }

    pub fn mapper(&self) -> &Arc<ElementMapper> {
        &self.mapper
    }

    fn keeper_for(&self, kind: &str, name: &str) -> StateKeepUser {
        StateKeepUser::new(self.state_keeper.clone(), format!("{kind}/{name}"))
    }

    fn register(&self, element: Arc<dyn Element>) -> Result<(), GraphError> {
        let name = element.name().to_string();
        if !self.mapper.register(element.clone()) {
            return Err(GraphError::DuplicateElement(name));
        }
        if !element.initialize() {
            warn!(name, "element failed to initialize and stays inactive");
        }
        Ok(())
    }

    /// Build, register and initialize one element from its spec.
    pub fn add_element(&self, spec: ElementSpec) -> Result<(), GraphError> {
        info!(name = spec.name(), "adding element");
        let mapper = self.mapper.borrow();
        match spec {
            ElementSpec::AioFile {
                name,
                root_dir,
                path_regex,
                default_index_file,
                format,
                disable_pause,
                disable_seek,
                disable_duration,
            } => {
                let defaults = AioFileConfig::default();
                let element = AioFileElement::new(
                    name,
                    AioFileConfig {
                        root_dir,
                        path_regex,
                        default_index_file: default_index_file
                            .unwrap_or(defaults.default_index_file),
                        format,
                        disable_pause,
                        disable_seek,
                        disable_duration,
                        media_info_cache_size: defaults.media_info_cache_size,
                    },
                )?;
                self.register(element)
            }
            ElementSpec::Dropping {
                name,
                media_filtered,
                audio_accept_period_ms,
                audio_drop_period_ms,
                video_accept_period_ms,
                video_drop_period_ms,
                video_grace_period_key_frames,
            } => self.register(new_dropping_element(
                name,
                mapper,
                DroppingConfig {
                    audio_accept_period_ms,
                    audio_drop_period_ms,
                    video_accept_period_ms,
                    video_drop_period_ms,
                    video_grace_period_key_frames,
                },
                media_filtered,
            )),
            ElementSpec::Keyframe {
                name,
                ms_between_video_frames,
                drop_audio,
            } => self.register(new_keyframe_element(
                name,
                mapper,
                ms_between_video_frames,
                drop_audio,
            )),
            ElementSpec::Normalizing {
                name,
                write_ahead_ms,
            } => self.register(new_normalizing_element(name, mapper, write_ahead_ms)),
            ElementSpec::StreamRenamer {
                name,
                pattern,
                replace,
            } => self.register(new_stream_renamer_element(name, mapper, &pattern, &replace)?),
            ElementSpec::F4vToFlvConverter { name } => {
                self.register(new_f4v_to_flv_element(name, mapper))
            }
            ElementSpec::Splitting {
                name,
                format,
                max_tag_size,
            } => self.register(new_splitting_element(
                name,
                mapper,
                format,
                max_tag_size.unwrap_or(DEFAULT_MAX_TAG_SIZE),
            )),
            ElementSpec::Debugger { name } => self.register(new_debugger_element(name, mapper)),
            ElementSpec::Switching {
                name,
                tag_timeout_ms,
                write_ahead_ms,
                media_only_when_used,
                is_temp_policy,
                policy,
            } => {
                let element = SwitchingElement::new(
                    name.clone(),
                    mapper,
                    SwitchingConfig {
                        caps: Capabilities::any(),
                        tag_timeout_ms,
                        write_ahead_ms,
                        media_only_when_used,
                    },
                );
                self.install_policy(&element, &name, policy, is_temp_policy);
                self.switching
                    .lock()
                    .insert(name.clone(), Arc::downgrade(&element));
                self.rpc.register(
                    name.clone(),
                    Arc::new(SwitchingRpc {
                        element: Arc::downgrade(&element),
                    }),
                );
                self.register(element)
            }
            ElementSpec::HttpClient {
                name,
                endpoints,
                retry_timeout_ms,
            } => {
                let endpoints = endpoints
                    .into_iter()
                    .map(|spec| {
                        (
                            spec.media,
                            HttpEndpoint {
                                url: spec.url,
                                format: spec.format,
                                reopen_on_close: spec.reopen_on_close,
                                fetch_only_on_request: spec.fetch_only_on_request,
                                auth: spec.auth_user.zip(spec.auth_pass),
                                max_retries: spec.max_retries,
                            },
                        )
                    })
                    .collect();
                self.register(HttpClientElement::new(
                    name,
                    endpoints,
                    retry_timeout_ms.unwrap_or(DEFAULT_HTTP_RETRY_TIMEOUT_MS),
                ))
            }
            ElementSpec::HttpPoster {
                name,
                url,
                local_media,
                format,
                auth_user,
                auth_pass,
                desired_http_chunk_size,
                max_buffered_chunks,
                reopen_interval_ms,
            } => self.register(HttpPosterElement::new(
                name,
                mapper,
                HttpPosterConfig {
                    url,
                    local_media,
                    format,
                    auth: auth_user.zip(auth_pass),
                    desired_http_chunk_size: desired_http_chunk_size
                        .unwrap_or(crate::elements::http_poster::MIN_CHUNK_SIZE),
                    max_buffered_chunks: max_buffered_chunks.unwrap_or(64),
                    reopen_interval_ms: reopen_interval_ms.unwrap_or(
                        crate::elements::http_poster::REOPEN_HTTP_CONNECTION_INTERVAL_MS,
                    ),
                },
            )),
            ElementSpec::Publishing { name } => self.register(PublishingElement::new(name)),
            ElementSpec::Lookup {
                name,
                servers,
                query_path_format,
                http_headers,
                num_retries,
                request_timeout_ms,
                local_lookup_first,
                media_format,
            } => self.register(LookupElement::new(
                name,
                mapper,
                LookupConfig {
                    servers,
                    query_path_format,
                    http_headers,
                    num_retries: num_retries.unwrap_or(2),
                    request_timeout_ms: request_timeout_ms.unwrap_or(5_000),
                    local_lookup_first,
                    media_format,
                },
            )),
            ElementSpec::LoadBalancing { name, sub_elements } => {
                self.register(LoadBalancingElement::new(name, mapper, sub_elements))
            }
            ElementSpec::Saving {
                name,
                media,
                output_dir,
                base_name,
                format,
            } => self.register(SavingElement::new(
                name,
                mapper,
                SavingConfig {
                    media,
                    output_dir,
                    base_name,
                    format,
                },
            )),
            ElementSpec::TimeSaving {
                name,
                save_interval_ms,
            } => {
                let keeper = self.keeper_for("timesaving", &name);
                self.register(new_timesaving_element(
                    name,
                    mapper,
                    keeper,
                    save_interval_ms.unwrap_or(DEFAULT_SAVE_INTERVAL_MS),
                ))
            }
            ElementSpec::Redirecting { name, rules } => {
                self.register(RedirectingElement::new(name, mapper, &rules)?)
            }
        }
    }

    fn install_policy(
        &self,
        element: &Arc<SwitchingElement>,
        element_name: &str,
        spec: PolicySpec,
        is_temp: bool,
    ) {
        let handle = element.handle();
        let keeper = Some(self.keeper_for("policy", element_name));
        match spec {
            PolicySpec::Random {
                media_dir,
                max_history_size,
            } => element.set_policy(Box::new(RandomPolicy::new(
                element_name,
                handle,
                self.mapper.borrow(),
                media_dir,
                is_temp,
                keeper,
                max_history_size.max(1),
            ))),
            PolicySpec::Playlist {
                playlist,
                loop_playlist,
            } => {
                let policy = PlaylistPolicy::new(
                    element_name,
                    handle,
                    is_temp,
                    keeper,
                    crate::policies::PlaylistSpec {
                        playlist,
                        loop_playlist,
                    },
                );
                self.rpc
                    .register(format!("{element_name}/policy"), policy.rpc());
                element.set_policy(Box::new(policy));
            }
            PolicySpec::TimedPlaylist {
                playlist,
                loop_playlist,
                empty_policy,
            } => element.set_policy(Box::new(TimedPlaylistPolicy::new(
                element_name,
                handle,
                is_temp,
                keeper,
                playlist,
                empty_policy.into(),
                loop_playlist,
            ))),
            PolicySpec::Failover {
                main_media,
                failover_media,
                main_media_tags_received_switch_limit,
                failover_timeout_ms,
                change_to_main_only_on_switch,
            } => element.set_policy(Box::new(FailoverPolicy::new(
                element_name,
                handle,
                self.mapper.borrow(),
                FailoverPolicyConfig {
                    main_media,
                    failover_media,
                    main_media_tags_received_switch_limit,
                    failover_timeout_ms,
                    change_to_main_only_on_switch,
                },
            ))),
            PolicySpec::OnCommand { default_media } => {
                let policy =
                    OnCommandPolicy::new(element_name, handle, is_temp, keeper, default_media);
                self.rpc
                    .register(format!("{element_name}/policy"), policy.rpc());
                element.set_policy(Box::new(policy));
            }
        }
    }

    /// Remote resolver elements need a live RPC client and are added
    /// programmatically rather than through a serde spec.
    pub fn add_resolver_element(
        &self,
        name: impl Into<String>,
        client: Arc<dyn ResolverClient>,
        cache_expiration_time_ms: u64,
    ) -> Result<(), GraphError> {
        let element = RemoteResolverElement::new(
            name,
            self.mapper.borrow(),
            client,
            cache_expiration_time_ms,
        );
        self.register(element)
    }

    pub fn add_authorizer(&self, name: impl Into<String>) -> Arc<SimpleAuthorizer> {
        let name = name.into();
        let authorizer =
            SimpleAuthorizer::new(name.clone(), self.keeper_for("authorizer", &name));
        self.rpc.register(name.clone(), authorizer.clone());
        self.authorizers.lock().insert(name, authorizer.clone());
        authorizer
    }

    pub fn authorizer(&self, name: &str) -> Option<Arc<SimpleAuthorizer>> {
        self.authorizers.lock().get(name).cloned()
    }

    /// What a switching element currently plays.
    pub fn switch_current_media(&self, media: &str) -> Option<String> {
        let element = self.switching.lock().get(media)?.upgrade()?;
        Some(element.current_media())
    }

    /// Follow chained switching elements down to the terminal media.
    pub fn recursive_switch_current_media(&self, media: &str, max_depth: usize) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = media.to_string();
        for _ in 0..max_depth.min(RECURSIVE_SWITCH_MAX_DEPTH) {
            let Some(next) = self.switch_current_media(&current) else {
                break;
            };
            if next.is_empty() {
                break;
            }
            chain.push(next.clone());
            current = crate::mapper::split_first(&next).0.to_string();
        }
        chain
    }

    /// The server side of the resolve RPC: local media resolve to a
    /// one-entry play spec.
    pub fn resolve_media(&self, media: &str) -> ResolveSpec {
        if !self.mapper.has_media(media) {
            return ResolveSpec::default();
        }
        ResolveSpec {
            media: vec![crate::elements::resolver::MediaAlias {
                alias_name: media.to_string(),
                media_name: media.to_string(),
            }],
            loop_playlist: false,
        }
    }
}

struct SwitchingRpc {
    element: Weak<SwitchingElement>,
}

impl RpcService for SwitchingRpc {
    fn invoke(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
        match method {
            "GetCurrentMedia" => {
                let element = self
                    .element
                    .upgrade()
                    .ok_or_else(|| RpcError::Failed("element is gone".to_string()))?;
                Ok(json!(element.current_media()))
            }
            other => Err(RpcError::NoSuchMethod {
                service: "switching".to_string(),
                method: other.to_string(),
            }),
        }
    }
}

struct RootService {
    library: Weak<MediaLibrary>,
}

#[derive(Deserialize)]
struct MediaParam {
    media: String,
}

#[derive(Deserialize)]
struct RecursiveParams {
    media: String,
    #[serde(default)]
    max_depth: Option<usize>,
}

impl RpcService for RootService {
    fn invoke(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let library = self
            .library
            .upgrade()
            .ok_or_else(|| RpcError::Failed("library is gone".to_string()))?;
        match method {
            "AddElementSpec" => {
                let spec: ElementSpec = serde_json::from_value(params)?;
                library
                    .add_element(spec)
                    .map_err(|e| RpcError::Failed(e.to_string()))?;
                Ok(json!({}))
            }
            "ResolveMedia" => {
                let params: MediaParam = serde_json::from_value(params)?;
                Ok(json!(library.resolve_media(&params.media)))
            }
            "GetSwitchCurrentMedia" => {
                let params: MediaParam = serde_json::from_value(params)?;
                Ok(json!(library.switch_current_media(&params.media)))
            }
            "RecursiveGetSwitchCurrentMedia" => {
                let params: RecursiveParams = serde_json::from_value(params)?;
                Ok(json!(library.recursive_switch_current_media(
                    &params.media,
                    params.max_depth.unwrap_or(RECURSIVE_SWITCH_MAX_DEPTH),
                )))
            }
            other => Err(RpcError::NoSuchMethod {
                service: "standard_library".to_string(),
                method: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library() -> (Arc<MediaLibrary>, Arc<RpcRegistry>) {
        let mapper = ElementMapper::new();
        let keeper = StateKeeper::new();
        let rpc = RpcRegistry::new();
        (MediaLibrary::new(mapper, keeper, rpc.clone()), rpc)
    }

    #[tokio::test]
    async fn builds_elements_from_json_specs() {
        let (library, rpc) = library();
        let spec: ElementSpec = serde_json::from_value(json!({
            "type": "keyframe",
            "name": "keys",
            "ms_between_video_frames": 1000,
            "drop_audio": true,
        }))
        .unwrap();
        library.add_element(spec).unwrap();
        assert!(library.mapper().get("keys").is_some());

        // The same via RPC.
        rpc.invoke(
            "standard_library",
            "AddElementSpec",
            json!({
                "type": "debugger",
                "name": "dbg",
            }),
        )
        .unwrap();
        assert!(library.mapper().get("dbg").is_some());
    }

    #[tokio::test]
    async fn duplicate_names_are_errors() {
        let (library, _rpc) = library();
        let make = || ElementSpec::Debugger {
            name: "dup".to_string(),
        };
        library.add_element(make()).unwrap();
        assert!(matches!(
            library.add_element(make()),
            Err(GraphError::DuplicateElement(_))
        ));
    }

    #[tokio::test]
    async fn switching_rpc_answers_current_media() {
        let (library, rpc) = library();
        library
            .add_element(ElementSpec::Switching {
                name: "sw".to_string(),
                tag_timeout_ms: 0,
                write_ahead_ms: 0,
                media_only_when_used: true,
                is_temp_policy: false,
                policy: PolicySpec::OnCommand {
                    default_media: "a/live".to_string(),
                },
            })
            .unwrap();
        crate::test_utils::settle().await;
        let current = rpc.invoke("sw", "GetCurrentMedia", json!({})).unwrap();
        assert_eq!(current, json!("a/live"));
    }
}
