use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::flavour::{DEFAULT_FLAVOUR_MASK, FlavourMask};

/// Container-level media format a producer emits or a consumer accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaFormat {
    #[default]
    Any,
    F4v,
    Flv,
    Aac,
    Mp3,
    Raw,
    Internal,
}

/// What a producer offers or a consumer asks for: a tag format plus the set
/// of flavour lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub format: MediaFormat,
    pub flavours: FlavourMask,
}

impl Capabilities {
    pub fn new(format: MediaFormat, flavours: FlavourMask) -> Self {
        Capabilities { format, flavours }
    }

    pub fn any() -> Self {
        Capabilities {
            format: MediaFormat::Any,
            flavours: FlavourMask::ALL,
        }
    }

    /// Compatible when the formats overlap (equal, or either side is `Any`)
    /// and the flavour masks intersect.
    pub fn is_compatible(&self, other: &Capabilities) -> bool {
        let format_ok = self.format == MediaFormat::Any
            || other.format == MediaFormat::Any
            || self.format == other.format;
        format_ok && self.flavours.intersects(other.flavours)
    }

    /// Narrow to the intersection with `other`.
    pub fn intersect(&mut self, other: &Capabilities) {
        if self.format == MediaFormat::Any {
            self.format = other.format;
        }
        self.flavours = self.flavours.intersect(other.flavours);
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities {
            format: MediaFormat::Any,
            flavours: DEFAULT_FLAVOUR_MASK,
        }
    }
}

/// Process-unique request identity. Elements key their tables on it and the
/// stats / state-keeper layers use its string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Per-request context supplied by the consuming client.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    /// Requested start position within the media.
    pub seek_pos_ms: i64,
    pub auth_user: Option<String>,
    pub auth_pass: Option<String>,
    /// Query parameters of the originating URL, in order.
    pub url_query: Vec<(String, String)>,
    pub remote_address: Option<String>,
    /// Internal requests (element-to-element registrations) are exempt from
    /// per-client accounting.
    pub is_internal: bool,
}

impl RequestInfo {
    /// Query string form (no leading `?`), used by lookup templating.
    pub fn url_query_string(&self) -> String {
        self.url_query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn auth_query_string(&self) -> String {
        match (&self.auth_user, &self.auth_pass) {
            (Some(user), Some(pass)) => format!("user={user}&pass={pass}"),
            (Some(user), None) => format!("user={user}"),
            _ => String::new(),
        }
    }
}

/// A handle representing one client consuming a stream.
///
/// Mutable by its owner only; elements hold the id, never the struct.
#[derive(Debug)]
pub struct Request {
    id: RequestId,
    pub caps: Capabilities,
    pub info: RequestInfo,
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

impl Request {
    pub fn new() -> Self {
        Request::with_caps(Capabilities::default())
    }

    pub fn with_caps(caps: Capabilities) -> Self {
        Request {
            id: RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)),
            caps,
            info: RequestInfo::default(),
        }
    }

    /// An internal registration made by one element onto another.
    pub fn internal() -> Self {
        let mut req = Request::new();
        req.info.is_internal = true;
        req
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// A copy carrying the same identity, for elements that re-register a
    /// request downstream on the client's behalf. The id is the identity;
    /// downstream teardown by id keeps working through the alias.
    pub fn alias(&self) -> Request {
        Request {
            id: self.id,
            caps: self.caps,
            info: self.info.clone(),
        }
    }

    /// Stable string key for stats and state-keeper entries.
    pub fn stats_id(&self) -> String {
        self.id.to_string()
    }
}

impl Default for Request {
    fn default() -> Self {
        Request::new()
    }
}
