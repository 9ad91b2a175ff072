//! Identity filter that logs every tag; wire it into a chain to see what
//! actually flows.

use media_tag::{Request, Tag};
use tracing::info;

use crate::filtering::{FilterFactory, FilteringElement, TagFilter};
use crate::mapper::MapperRef;

pub const ELEMENT_CLASS_NAME: &str = "debugger";

pub struct DebuggerFilter {
    media: String,
}

impl TagFilter for DebuggerFilter {
    fn filter_tag(&mut self, tag: &Tag, out: &mut Vec<Tag>) {
        info!(
            media = %self.media,
            kind = ?tag.kind(),
            ts = tag.timestamp_ms,
            flavours = ?tag.flavour_mask,
            "tag"
        );
        out.push(tag.clone());
    }
}

pub struct DebuggerFactory;

impl FilterFactory for DebuggerFactory {
    type Filter = DebuggerFilter;

    fn class_name(&self) -> &'static str {
        ELEMENT_CLASS_NAME
    }

    fn create_filter(&self, media: &str, _req: &Request) -> Option<DebuggerFilter> {
        Some(DebuggerFilter {
            media: media.to_string(),
        })
    }
}

pub type DebuggerElement = FilteringElement<DebuggerFactory>;

pub fn new_debugger_element(
    name: impl Into<String>,
    mapper: MapperRef,
) -> std::sync::Arc<DebuggerElement> {
    FilteringElement::new(name, mapper, DebuggerFactory)
}
