//! On-command selection: a default media plus an RPC-driven override. Both
//! the default and the queued next media persist through the state keeper.

use std::sync::Arc;

use media_tag::Tag;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::policies::{Policy, SwitchHandle};
use crate::rpc::{RpcError, RpcService};
use crate::state::StateKeepUser;

pub const POLICY_CLASS_NAME: &str = "on_command_policy";

struct OnCommandState {
    default_media: String,
    current_media: String,
    next_media: String,
}

struct OnCommandShared {
    name: String,
    handle: SwitchHandle,
    keeper: Option<StateKeepUser>,
    state: Mutex<OnCommandState>,
}

impl OnCommandShared {
    fn save_state(&self) {
        let Some(keeper) = &self.keeper else {
            return;
        };
        let state = self.state.lock();
        keeper.begin_transaction();
        keeper.set_value("default", &state.default_media);
        keeper.set_value("next", &state.next_media);
        keeper.commit_transaction();
    }

    fn play(&self, media: String) {
        self.state.lock().current_media = media.clone();
        self.handle.switch(media, true);
    }
}

pub struct OnCommandPolicy {
    is_temp: bool,
    shared: Arc<OnCommandShared>,
}

impl OnCommandPolicy {
    pub fn new(
        name: impl Into<String>,
        handle: SwitchHandle,
        is_temp: bool,
        keeper: Option<StateKeepUser>,
        default_media: impl Into<String>,
    ) -> Self {
        OnCommandPolicy {
            is_temp,
            shared: Arc::new(OnCommandShared {
                name: name.into(),
                handle,
                keeper,
                state: Mutex::new(OnCommandState {
                    default_media: default_media.into(),
                    current_media: String::new(),
                    next_media: String::new(),
                }),
            }),
        }
    }

    pub fn rpc(&self) -> Arc<OnCommandRpc> {
        Arc::new(OnCommandRpc {
            shared: self.shared.clone(),
        })
    }
}

impl Policy for OnCommandPolicy {
    fn class_name(&self) -> &'static str {
        POLICY_CLASS_NAME
    }

    fn initialize(&mut self) -> bool {
        self.load_state();
        self.save_state();
        let media = {
            let state = self.shared.state.lock();
            if !state.next_media.is_empty() {
                state.next_media.clone()
            } else {
                state.default_media.clone()
            }
        };
        if media.is_empty() {
            return false;
        }
        self.shared.play(media);
        true
    }

    fn notify_tag(&mut self, _tag: &Tag) {}

    fn notify_eos(&mut self) -> bool {
        let media = {
            let mut state = self.shared.state.lock();
            if !state.next_media.is_empty() {
                std::mem::take(&mut state.next_media)
            } else if !state.current_media.is_empty() {
                state.current_media.clone()
            } else {
                state.default_media.clone()
            }
        };
        self.save_state();
        self.shared.play(media);
        true
    }

    fn reset(&mut self) {
        let mut state = self.shared.state.lock();
        state.current_media.clear();
        state.next_media.clear();
        drop(state);
        self.save_state();
    }

    fn load_state(&mut self) {
        let Some(keeper) = &self.shared.keeper else {
            return;
        };
        let mut state = self.shared.state.lock();
        if let Some(default_media) = keeper.get_value("default") {
            if !default_media.is_empty() {
                state.default_media = default_media;
            }
        }
        if let Some(next) = keeper.get_value("next") {
            state.next_media = next;
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

impl Drop for OnCommandPolicy {
    fn drop(&mut self) {
        if self.is_temp {
            self.clear_state();
        }
    }
}

#[derive(Deserialize)]
struct SwitchPolicyParams {
    media_name: String,
    set_as_default: bool,
    also_switch: bool,
}

pub struct OnCommandRpc {
    shared: Arc<OnCommandShared>,
}

impl RpcService for OnCommandRpc {
    fn invoke(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "SwitchPolicy" => {
                let params: SwitchPolicyParams = serde_json::from_value(params)?;
                info!(
                    policy = %self.shared.name,
                    media = %params.media_name,
                    set_as_default = params.set_as_default,
                    also_switch = params.also_switch,
                    "switch command"
                );
                {
                    let mut state = self.shared.state.lock();
                    if params.set_as_default {
                        state.default_media = params.media_name.clone();
                    }
                    if !params.also_switch {
                        state.next_media = params.media_name.clone();
                    }
                }
                if params.also_switch {
                    self.shared.play(params.media_name);
                }
                self.shared.save_state();
                Ok(json!({}))
            }
            "GetDefaultMedia" => {
                Ok(json!(self.shared.state.lock().default_media.clone()))
            }
            "GetPlayInfo" => {
                let state = self.shared.state.lock();
                Ok(json!({
                    "default": state.default_media,
                    "current": state.current_media,
                    "next": state.next_media,
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
    use crate::state::StateKeeper;

    #[tokio::test]
    async fn persists_default_and_next() {
        let keeper = StateKeeper::new();
        let element = SwitchingElement::new(
            "sw",
            MapperRef::disconnected(),
            SwitchingConfig::default(),
        );
        let policy = OnCommandPolicy::new(
            "cmd",
            element.handle(),
            false,
            Some(StateKeepUser::new(keeper.clone(), "policy/cmd")),
            "a",
        );
        let rpc = policy.rpc();
        let mut policy = policy;
        assert!(policy.initialize());

        rpc.invoke(
            "SwitchPolicy",
            json!({"media_name": "b", "set_as_default": true, "also_switch": false}),
        )
        .unwrap();
        assert_eq!(keeper.get_value("policy/cmd/default").as_deref(), Some("b"));
        assert_eq!(keeper.get_value("policy/cmd/next").as_deref(), Some("b"));

        // The queued media plays at the next EOS boundary.
        assert!(policy.notify_eos());
        assert_eq!(policy.shared.state.lock().current_media, "b");
        assert!(policy.shared.state.lock().next_media.is_empty());
    }

    #[tokio::test]
    async fn replays_current_without_a_queued_next() {
        let element = SwitchingElement::new(
            "sw",
            MapperRef::disconnected(),
            SwitchingConfig::default(),
        );
        let mut policy =
            OnCommandPolicy::new("cmd", element.handle(), false, None, "a");
        assert!(policy.initialize());
        assert!(policy.notify_eos());
        assert_eq!(policy.shared.state.lock().current_media, "a");
    }
}
