//! The element kinds of the standard library.

pub mod aio_file;
pub mod authorizer;
pub mod balancer;
pub mod debugger;
pub mod dropping;
pub mod f4v_to_flv;
pub mod http_client;
pub mod http_poster;
pub mod keyframe;
pub mod lookup;
pub mod normalizing;
pub mod publishing;
pub mod redirecting;
pub mod renamer;
pub mod resolver;
pub mod saving;
pub mod splitting;
pub mod switching;
pub mod timesaving;

pub use aio_file::{AioFileConfig, AioFileElement};
pub use balancer::LoadBalancingElement;
pub use debugger::{DebuggerElement, new_debugger_element};
pub use dropping::{DroppingConfig, DroppingElement, new_dropping_element};
pub use f4v_to_flv::{F4vToFlvConverterElement, new_f4v_to_flv_element};
pub use http_client::{HttpClientElement, HttpEndpoint};
pub use http_poster::{HttpPosterConfig, HttpPosterElement};
pub use keyframe::{KeyFrameExtractorElement, new_keyframe_element};
pub use lookup::{LookupConfig, LookupElement};
pub use normalizing::{NormalizingElement, TagNormalizer, new_normalizing_element};
pub use publishing::{PublishHandle, PublishingElement};
pub use redirecting::RedirectingElement;
pub use renamer::{StreamRenamerElement, new_stream_renamer_element};
pub use resolver::{MediaAlias, RemoteResolverElement, ResolveSpec, ResolverClient};
pub use saving::{SavingConfig, SavingElement};
pub use splitting::{SplittingElement, TagSplitter, new_splitting_element};
pub use switching::{SwitchHandle, SwitchingConfig, SwitchingElement};
pub use timesaving::{TimeSavingElement, new_timesaving_element};
