//! # f4v
//!
//! A byte-exact codec for the ISO-base-media subset used by Flash Video v2:
//! atom decode/encode with raw-atom degradation for unknown types, frame
//! extraction from the sample tables, timestamp-ordered playback, seeking,
//! cue point generation and structure repair (moving a trailing `moov` in
//! front of `mdat`).

pub mod atom;
mod decoder;
mod encoder;
mod error;
mod fourcc;
mod frame;
pub mod index;
mod info;
pub mod repair;
pub mod test_support;

pub use atom::{Atom, AtomBody, AtomHeader, ContainerAtom, RawAtom};
pub use decoder::{Decoder, F4vData, F4vDecoderStream, MAX_FRAME_CACHE_SIZE};
pub use encoder::Encoder;
pub use error::F4vError;
pub use fourcc::FourCc;
pub use frame::{Frame, FrameHeader, FrameKind};
pub use info::{MovieInfo, extract_movie_info};
pub use repair::{FixResult, fix_bytes, fix_file_structure};
