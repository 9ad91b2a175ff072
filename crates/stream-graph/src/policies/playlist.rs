//! Playlist selection: an ordered media list, optionally looping, with an
//! RPC surface for replacing and inspecting the list at runtime.

use std::sync::Arc;

use media_tag::Tag;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::policies::{Policy, SwitchHandle};
use crate::rpc::{RpcError, RpcService};
use crate::state::StateKeepUser;

pub const POLICY_CLASS_NAME: &str = "playlist_policy";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistSpec {
    pub playlist: Vec<String>,
    pub loop_playlist: bool,
}

struct PlaylistState {
    playlist: Vec<String>,
    loop_playlist: bool,
    current: i64,
    next_to_play: i64,
    next_next_to_play: i64,
}

impl PlaylistState {
    /// Advance to the next entry; `None` when the playlist is over.
    fn advance(&mut self) -> Option<String> {
        if self.playlist.is_empty() {
            return None;
        }
        let len = self.playlist.len() as i64;
        if self.next_to_play >= 0 && self.next_to_play < len {
            self.current = self.next_to_play;
            if self.next_next_to_play >= 0 && self.next_next_to_play < len {
                self.next_to_play = self.next_next_to_play;
                self.next_next_to_play = -1;
            } else {
                self.next_to_play = -1;
            }
        } else {
            self.current += 1;
            if self.current >= len {
                if !self.loop_playlist {
                    return None;
                }
                self.current = 0;
            }
        }
        Some(self.playlist[self.current as usize].clone())
    }
}

struct PlaylistShared {
    name: String,
    handle: SwitchHandle,
    keeper: Option<StateKeepUser>,
    state: Mutex<PlaylistState>,
}

impl PlaylistShared {
    fn save_state(&self) {
        let Some(keeper) = &self.keeper else {
            return;
        };
        let state = self.state.lock();
        keeper.begin_transaction();
        keeper.set_value(
            "playlist",
            &serde_json::to_string(&state.playlist).unwrap_or_default(),
        );
        keeper.set_value("loop", if state.loop_playlist { "1" } else { "0" });
        keeper.set_value("current", &state.current.to_string());
        keeper.set_value("next_to_play", &state.next_to_play.to_string());
        keeper.set_value("next_next_to_play", &state.next_next_to_play.to_string());
        keeper.commit_transaction();
    }

    fn go_to_next(&self) -> bool {
        let media = {
            let mut state = self.state.lock();
            if state.playlist.is_empty() {
                warn!(policy = %self.name, "empty playlist");
                return false;
            }
            state.advance()
        };
        self.save_state();
        match media {
            Some(media) => {
                self.handle.switch(media, true);
                true
            }
            None => {
                info!(policy = %self.name, "end of playlist");
                false
            }
        }
    }
}

pub struct PlaylistPolicy {
    is_temp: bool,
    shared: Arc<PlaylistShared>,
}

impl PlaylistPolicy {
    pub fn new(
        name: impl Into<String>,
        handle: SwitchHandle,
        is_temp: bool,
        keeper: Option<StateKeepUser>,
        spec: PlaylistSpec,
    ) -> Self {
        PlaylistPolicy {
            is_temp,
            shared: Arc::new(PlaylistShared {
                name: name.into(),
                handle,
                keeper,
                state: Mutex::new(PlaylistState {
                    playlist: spec.playlist,
                    loop_playlist: spec.loop_playlist,
                    current: -1,
                    next_to_play: -1,
                    next_next_to_play: -1,
                }),
            }),
        }
    }

    /// The RPC face of this policy; register it under the policy's name.
    pub fn rpc(&self) -> Arc<PlaylistRpc> {
        Arc::new(PlaylistRpc {
            shared: self.shared.clone(),
        })
    }

    /// Queue a playlist entry as the next item.
    pub fn add_to_play(&self, media: &str) -> bool {
        let mut state = self.shared.state.lock();
        let Some(index) = state.playlist.iter().position(|m| m == media) else {
            return false;
        };
        state.next_to_play = index as i64;
        drop(state);
        self.shared.save_state();
        true
    }
}

impl Policy for PlaylistPolicy {
    fn class_name(&self) -> &'static str {
        POLICY_CLASS_NAME
    }

    fn initialize(&mut self) -> bool {
        self.load_state();
        self.shared.save_state();
        self.shared.go_to_next()
    }

    fn notify_tag(&mut self, _tag: &Tag) {}

    fn notify_eos(&mut self) -> bool {
        self.shared.go_to_next()
    }

    fn reset(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.current = -1;
            state.next_to_play = -1;
            state.next_next_to_play = -1;
        }
        self.shared.save_state();
    }

    fn load_state(&mut self) {
        let Some(keeper) = &self.shared.keeper else {
            return;
        };
        let mut state = self.shared.state.lock();
        if let Some(value) = keeper.get_value("playlist") {
            if let Ok(playlist) = serde_json::from_str::<Vec<String>>(&value) {
                if !playlist.is_empty() {
                    state.playlist = playlist;
                }
            }
        }
        let state = &mut *state;
        for (key, slot) in [
            ("current", &mut state.current),
            ("next_to_play", &mut state.next_to_play),
            ("next_next_to_play", &mut state.next_next_to_play),
        ] {
            if let Some(value) = keeper.get_value(key) {
                if let Ok(parsed) = value.parse() {
                    *slot = parsed;
                }
            }
        }
    }

    fn save_state(&self) {
        self.shared.save_state();
    }

    fn clear_state(&self) {
        if let Some(keeper) = &self.shared.keeper {
            keeper.clear();
        }
    }
}

impl Drop for PlaylistPolicy {
    fn drop(&mut self) {
        if self.is_temp {
            self.clear_state();
        }
    }
}

pub struct PlaylistRpc {
    shared: Arc<PlaylistShared>,
}

impl RpcService for PlaylistRpc {
    fn invoke(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "SetPlaylist" => {
                let spec: PlaylistSpec = serde_json::from_value(params)?;
                {
                    let mut state = self.shared.state.lock();
                    state.playlist = spec.playlist;
                    state.loop_playlist = spec.loop_playlist;
                    state.current = -1;
                    state.next_to_play = -1;
                    state.next_next_to_play = -1;
                }
                self.shared.save_state();
                Ok(json!({}))
            }
            "GetPlaylist" => {
                let state = self.shared.state.lock();
                Ok(json!(PlaylistSpec {
                    playlist: state.playlist.clone(),
                    loop_playlist: state.loop_playlist,
                }))
            }
            "GetPlayInfo" => {
                let state = self.shared.state.lock();
                let current = if state.current >= 0 {
                    state.playlist.get(state.current as usize).cloned()
                } else {
                    None
                };
                Ok(json!({
                    "current": current,
                    "current_index": state.current,
                    "next_to_play": state.next_to_play,
                    "playlist_len": state.playlist.len(),
                }))
            }
            other => Err(RpcError::NoSuchMethod {
                service: POLICY_CLASS_NAME.to_string(),
                method: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elements::switching::{SwitchingConfig, SwitchingElement};
    use crate::mapper::MapperRef;

    fn handle() -> (SwitchHandle, Arc<SwitchingElement>) {
        let element = SwitchingElement::new(
            "switch",
            MapperRef::disconnected(),
            SwitchingConfig::default(),
        );
        (element.handle(), element)
    }

    #[tokio::test]
    async fn plays_in_order_and_loops() {
        let (handle, _element) = handle();
        let mut policy = PlaylistPolicy::new(
            "p",
            handle,
            false,
            None,
            PlaylistSpec {
                playlist: vec!["a".into(), "b".into()],
                loop_playlist: true,
            },
        );
        assert!(policy.initialize());
        assert!(policy.notify_eos());
        assert!(policy.notify_eos());
        let state = policy.shared.state.lock();
        // a, b, then wrapped around to a.
        assert_eq!(state.current, 0);
    }

    #[tokio::test]
    async fn ends_without_loop() {
        let (handle, _element) = handle();
        let mut policy = PlaylistPolicy::new(
            "p",
            handle,
            false,
            None,
            PlaylistSpec {
                playlist: vec!["a".into()],
                loop_playlist: false,
            },
        );
        assert!(policy.initialize());
        assert!(!policy.notify_eos());
    }

    #[tokio::test]
    async fn push_ahead_takes_priority() {
        let (handle, _element) = handle();
        let mut policy = PlaylistPolicy::new(
            "p",
            handle,
            false,
            None,
            PlaylistSpec {
                playlist: vec!["a".into(), "b".into(), "c".into()],
                loop_playlist: true,
            },
        );
        assert!(policy.initialize()); // plays a
        assert!(policy.add_to_play("c"));
        assert!(policy.notify_eos()); // plays c, not b
        assert_eq!(policy.shared.state.lock().current, 2);
    }
}
