//! # Stream Graph
//!
//! The streaming graph runtime: a directed dataflow of pluggable elements
//! through which typed media tags flow from producers (file readers, HTTP
//! ingest, publish receivers) to consumers, with filters, switches,
//! redirections and policies in between.
//!
//! The [`mapper::ElementMapper`] resolves media paths to element chains;
//! each consuming request gets its own tag channel, and everything that
//! must suspend (alarms, retries, file and HTTP I/O) runs as a spawned
//! task holding a weak handle back to its element, so teardown never races
//! a dangling callback.

pub mod element;
pub mod elements;
pub mod error;
pub mod filtering;
pub mod library;
pub mod mapper;
pub mod policies;
pub mod rpc;
pub mod serializer;
pub mod state;

mod distributor;

#[cfg(test)]
pub(crate) mod test_utils;

pub use distributor::TagDistributor;
pub use element::{CloseDone, Element, MediaInfoSink, TagSink, join_media, strip_element_prefix};
pub use error::GraphError;
pub use library::{ElementSpec, MediaLibrary, PolicySpec};
pub use mapper::{ElementMapper, MapperRef};
pub use policies::Policy;
pub use rpc::{RpcError, RpcRegistry, RpcService};
pub use serializer::{FlvTagSerializer, RawTagSerializer, TagSerializer, serializer_for};
pub use state::{StateKeepUser, StateKeeper};
