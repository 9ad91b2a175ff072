//! Timed playlist: each entry plays for its configured duration, advanced
//! by an alarm; an early end-of-stream picks between replaying the current
//! entry, advancing, or waiting out the timer.

use std::sync::Arc;
use std::time::Duration;

use media_tag::Tag;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::policies::{Policy, SwitchHandle};
use crate::state::StateKeepUser;

pub const POLICY_CLASS_NAME: &str = "timed_playlist_policy";

/// What to do when the current entry ends before its time is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyPolicy {
    /// Replay the entry until its time completes.
    Replay,
    /// Advance to the next entry immediately.
    Next,
    /// Play nothing and wait for the timer.
    Wait,
}

struct TimedState {
    current: i64,
    next_to_play: i64,
    /// Bumps on every switch; stale alarms compare and bail.
    generation: u64,
}

struct TimedShared {
    name: String,
    handle: SwitchHandle,
    /// (duration, media) entries.
    playlist: Vec<(u64, String)>,
    loop_playlist: bool,
    state: Mutex<TimedState>,
}

impl TimedShared {
    fn go_to_next(self: &Arc<Self>) -> bool {
        let media = {
            let mut state = self.state.lock();
            if self.playlist.is_empty() {
                warn!(policy = %self.name, "empty timed playlist");
                return false;
            }
            let len = self.playlist.len() as i64;
            if state.next_to_play >= 0 && state.next_to_play < len {
                state.current = state.next_to_play;
                state.next_to_play = -1;
            } else {
                state.current += 1;
                if state.current >= len {
                    if !self.loop_playlist {
                        return false;
                    }
                    state.current = 0;
                }
            }
            state.current
        };
        self.play_entry(media as usize);
        true
    }

    fn play_entry(self: &Arc<Self>, index: usize) {
        let (duration_ms, media) = self.playlist[index].clone();
        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            debug!(policy = %self.name, media = %media, duration_ms, "timed entry");
            state.generation
        };
        self.handle.switch(media, true);

        let shared = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(duration_ms)).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if shared.state.lock().generation != generation {
                return;
            }
            shared.go_to_next();
        });
    }
}

pub struct TimedPlaylistPolicy {
    is_temp: bool,
    empty_policy: EmptyPolicy,
    keeper: Option<StateKeepUser>,
    shared: Arc<TimedShared>,
}

impl TimedPlaylistPolicy {
    pub fn new(
        name: impl Into<String>,
        handle: SwitchHandle,
        is_temp: bool,
        keeper: Option<StateKeepUser>,
        playlist: Vec<(u64, String)>,
        empty_policy: EmptyPolicy,
        loop_playlist: bool,
    ) -> Self {
        TimedPlaylistPolicy {
            is_temp,
            empty_policy,
            keeper,
            shared: Arc::new(TimedShared {
                name: name.into(),
                handle,
                playlist,
                loop_playlist,
                state: Mutex::new(TimedState {
                    current: -1,
                    next_to_play: -1,
                    generation: 0,
                }),
            }),
        }
    }
}

impl Policy for TimedPlaylistPolicy {
    fn class_name(&self) -> &'static str {
        POLICY_CLASS_NAME
    }

    fn initialize(&mut self) -> bool {
        self.load_state();
        self.save_state();
        self.shared.go_to_next()
    }

    fn notify_tag(&mut self, _tag: &Tag) {}

    fn notify_eos(&mut self) -> bool {
        match self.empty_policy {
            EmptyPolicy::Replay => {
                let current = self.shared.state.lock().current;
                if current < 0 {
                    return self.shared.go_to_next();
                }
                // Replay without re-arming the running timer.
                let media = self.shared.playlist[current as usize].1.clone();
                self.shared.handle.switch(media, true);
                true
            }
            EmptyPolicy::Next => self.shared.go_to_next(),
            EmptyPolicy::Wait => true,
        }
    }

    fn reset(&mut self) {
        let mut state = self.shared.state.lock();
        state.current = -1;
        state.next_to_play = -1;
        state.generation += 1;
        drop(state);
        self.save_state();
    }

    fn load_state(&mut self) {
        let Some(keeper) = &self.keeper else {
            return;
        };
        let mut state = self.shared.state.lock();
        let state = &mut *state;
        for (key, slot) in [
            ("current", &mut state.current),
            ("next_to_play", &mut state.next_to_play),
        ] {
            if let Some(value) = keeper.get_value(key) {
                if let Ok(parsed) = value.parse() {
                    *slot = parsed;
                }
            }
        }
    }

    fn save_state(&self) {
        let Some(keeper) = &self.keeper else {
            return;
        };
        let state = self.shared.state.lock();
        keeper.begin_transaction();
        keeper.set_value("current", &state.current.to_string());
        keeper.set_value("next_to_play", &state.next_to_play.to_string());
        keeper.commit_transaction();
    }

    fn clear_state(&self) {
        if let Some(keeper) = &self.keeper {
            keeper.clear();
        }
    }
}

impl Drop for TimedPlaylistPolicy {
    fn drop(&mut self) {
        if self.is_temp {
            self.clear_state();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Element;
    use crate::elements::switching::{SwitchingConfig, SwitchingElement};
    use crate::mapper::{ElementMapper, MapperRef};
    use crate::test_utils::{NullElement, settle};

    #[tokio::test(start_paused = true)]
    async fn alarm_advances_the_playlist() {
        let mapper = ElementMapper::new();
        let a = Arc::new(NullElement::new("a"));
        let b = Arc::new(NullElement::new("b"));
        mapper.register(a.clone());
        mapper.register(b.clone());

        let element = SwitchingElement::new("sw", mapper.borrow(), SwitchingConfig::default());
        let policy = TimedPlaylistPolicy::new(
            "timed",
            element.handle(),
            false,
            None,
            vec![(5_000, "a/live".into()), (5_000, "b/live".into())],
            EmptyPolicy::Wait,
            true,
        );
        element.set_policy(Box::new(policy));
        mapper.register(element.clone());
        assert!(element.clone().initialize());
        settle().await;
        assert_eq!(a.request_count(), 1);
        assert_eq!(b.request_count(), 0);

        // Past the first entry's duration the alarm switches to b. (The
        // minimum re-registration interval is shorter than the entry.)
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        settle().await;
        assert_eq!(a.request_count(), 0);
        assert_eq!(b.request_count(), 1);
    }

    #[tokio::test]
    async fn wait_mode_keeps_the_element_alive_on_eos() {
        let element = SwitchingElement::new(
            "sw",
            MapperRef::disconnected(),
            SwitchingConfig::default(),
        );
        let mut policy = TimedPlaylistPolicy::new(
            "timed",
            element.handle(),
            false,
            None,
            vec![(60_000, "a".into())],
            EmptyPolicy::Wait,
            false,
        );
        assert!(policy.initialize());
        assert!(policy.notify_eos());
    }
}
