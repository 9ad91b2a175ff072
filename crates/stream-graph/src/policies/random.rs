//! Random selection: draw the next media from the element's listable
//! children, with a bounded history and an operator push-ahead queue.

use std::collections::VecDeque;

use media_tag::Tag;
use rand::RngExt;
use tracing::{debug, warn};

use crate::mapper::MapperRef;
use crate::policies::{Policy, SwitchHandle};
use crate::state::StateKeepUser;

pub const POLICY_CLASS_NAME: &str = "random_policy";

pub struct RandomPolicy {
    name: String,
    handle: SwitchHandle,
    mapper: MapperRef,
    /// Directory whose children are the candidate media.
    media_dir: String,
    is_temp: bool,
    keeper: Option<StateKeepUser>,
    max_history_size: usize,

    available: Vec<String>,
    next_to_play: VecDeque<String>,
    history: VecDeque<String>,
    current: String,
}

impl RandomPolicy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        handle: SwitchHandle,
        mapper: MapperRef,
        media_dir: impl Into<String>,
        is_temp: bool,
        keeper: Option<StateKeepUser>,
        max_history_size: usize,
    ) -> Self {
        RandomPolicy {
            name: name.into(),
            handle,
            mapper,
            media_dir: media_dir.into(),
            is_temp,
            keeper,
            max_history_size,
            available: Vec::new(),
            next_to_play: VecDeque::new(),
            history: VecDeque::new(),
            current: String::new(),
        }
    }

    fn go_to_next(&mut self) -> bool {
        if self.available.is_empty() {
            self.mapper.list_media(&self.media_dir, &mut self.available);
            if self.available.is_empty() {
                warn!(policy = %self.name, dir = %self.media_dir, "nothing to play");
                return false;
            }
        }
        self.current = match self.next_to_play.pop_front() {
            Some(media) => media,
            None => {
                let index = rand::rng().random_range(0..self.available.len());
                self.available[index].clone()
            }
        };
        debug!(policy = %self.name, media = %self.current, "switching");
        self.handle.switch(self.current.clone(), true);
        self.history.push_back(self.current.clone());
        while self.history.len() > self.max_history_size {
            self.history.pop_front();
        }
        self.save_state();
        true
    }

    /// Replay the most recently played media.
    pub fn go_to_prev(&mut self) -> bool {
        let Some(media) = self.history.pop_back() else {
            return false;
        };
        self.current = media.clone();
        self.handle.switch(media, true);
        self.save_state();
        true
    }

    /// Queue a media to be played ahead of the random draw.
    pub fn add_to_play(&mut self, media: &str) -> bool {
        if !self.mapper.has_media(media) {
            return false;
        }
        self.next_to_play.push_back(media.to_string());
        self.save_state();
        true
    }
}

impl Policy for RandomPolicy {
    fn class_name(&self) -> &'static str {
        POLICY_CLASS_NAME
    }

    fn initialize(&mut self) -> bool {
        self.load_state();
        self.save_state();
        self.go_to_next()
    }

    fn notify_tag(&mut self, _tag: &Tag) {}

    fn notify_eos(&mut self) -> bool {
        self.go_to_next()
    }

    fn reset(&mut self) {
        self.next_to_play.clear();
        self.history.clear();
        self.save_state();
    }

    fn load_state(&mut self) {
        let Some(keeper) = &self.keeper else {
            return;
        };
        if let Some(value) = keeper.get_value("history") {
            if let Ok(history) = serde_json::from_str::<Vec<String>>(&value) {
                self.history = history.into();
            }
        }
        if let Some(value) = keeper.get_value("next_to_play") {
            if let Ok(queue) = serde_json::from_str::<Vec<String>>(&value) {
                self.next_to_play = queue.into();
            }
        }
    }

    fn save_state(&self) {
        let Some(keeper) = &self.keeper else {
            return;
        };
        keeper.begin_transaction();
        let history: Vec<&String> = self.history.iter().collect();
        keeper.set_value("history", &serde_json::to_string(&history).unwrap_or_default());
        let queue: Vec<&String> = self.next_to_play.iter().collect();
        keeper.set_value(
            "next_to_play",
            &serde_json::to_string(&queue).unwrap_or_default(),
        );
        keeper.set_value("current", &self.current);
        keeper.commit_transaction();
    }

    fn clear_state(&self) {
        if let Some(keeper) = &self.keeper {
            keeper.clear();
        }
    }
}

impl Drop for RandomPolicy {
    fn drop(&mut self) {
        if self.is_temp {
            self.clear_state();
        }
    }
}
