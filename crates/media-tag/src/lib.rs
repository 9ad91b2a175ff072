//! # Media Tag
//!
//! The typed event model shared by every element of the streaming graph.
//! A [`Tag`] is the atomic unit of streaming: container atoms, frames and
//! control events all travel as tags through element chains. Tags are
//! immutable once published; a consumer that needs to change one (e.g.
//! narrow its flavour mask) clones it first, which is cheap because all
//! payloads are reference counted.

mod flavour;
mod media_info;
mod request;
mod stream_time;
mod tag;

pub use flavour::{DEFAULT_FLAVOUR_MASK, FlavourIds, FlavourMask, NUM_FLAVOURS};
pub use media_info::MediaInfo;
pub use request::{Capabilities, MediaFormat, Request, RequestId, RequestInfo};
pub use stream_time::StreamTimeCalculator;
pub use tag::{
    CuePointData, MediaFrame, MediaFrameKind, SourceChange, Tag, TagAttributes, TagKind,
    TagPayload,
};
