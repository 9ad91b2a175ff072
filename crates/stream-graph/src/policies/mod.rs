//! Source-selection policies for switching elements.
//!
//! A policy owns the selection state of exactly one switching element. The
//! element offers it every upstream tag (`notify_tag`) and every upstream
//! end-of-stream (`notify_eos`); the policy commands media changes through
//! its [`SwitchHandle`], from those notifications or from its own alarms
//! and RPC surface. `notify_eos` returning `false` is terminal: the element
//! closes its clients instead of re-registering.

mod failover;
mod on_command;
mod playlist;
mod random;
mod timed;

pub use failover::{FailoverPolicy, FailoverPolicyConfig};
pub use on_command::{OnCommandPolicy, OnCommandRpc};
pub use playlist::{PlaylistPolicy, PlaylistRpc, PlaylistSpec};
pub use random::RandomPolicy;
pub use timed::{EmptyPolicy, TimedPlaylistPolicy};

use media_tag::Tag;

pub use crate::elements::switching::SwitchHandle;

pub trait Policy: Send + 'static {
    fn class_name(&self) -> &'static str;

    /// First activation; the policy pushes its opening switch through its
    /// handle. `false` leaves the owning element inactive.
    fn initialize(&mut self) -> bool;

    /// Every tag the owning element receives from upstream.
    fn notify_tag(&mut self, tag: &Tag);

    /// Upstream ended. `true` keeps the element alive (the policy has
    /// pushed, or will push, the next switch); `false` is terminal.
    fn notify_eos(&mut self) -> bool;

    fn reset(&mut self);

    /// Restore persisted selection state, if any.
    fn load_state(&mut self) {}

    /// Persist current selection state, if any.
    fn save_state(&self) {}

    /// Drop persisted state; temp policies call this on drop.
    fn clear_state(&self) {}
}
