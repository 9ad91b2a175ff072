//! Stream renaming: rewrite the stream name inside source-started and
//! source-ended tags with a regex/replacement rule, keeping the path field
//! consistent with the new name.

use std::sync::Arc;

use media_tag::{Request, SourceChange, Tag, TagKind, TagPayload};
use regex::Regex;
use tracing::warn;

use crate::error::GraphError;
use crate::filtering::{FilterFactory, FilteringElement, TagFilter};
use crate::mapper::MapperRef;

pub const ELEMENT_CLASS_NAME: &str = "stream_renamer";

pub struct RenamerFilter {
    pattern: Regex,
    replace: String,
}

impl TagFilter for RenamerFilter {
    fn filter_tag(&mut self, tag: &Tag, out: &mut Vec<Tag>) {
        let kind = tag.kind();
        if kind != TagKind::SourceStarted && kind != TagKind::SourceEnded {
            out.push(tag.clone());
            return;
        }
        let Some(change) = tag.source_change() else {
            out.push(tag.clone());
            return;
        };
        let old_name = change.source_element_name.as_str();
        if !self.pattern.is_match(old_name) {
            warn!(
                pattern = %self.pattern,
                stream = old_name,
                "no match for rename pattern"
            );
            out.push(tag.clone());
            return;
        }
        let new_name = self
            .pattern
            .replace(old_name, self.replace.as_str())
            .into_owned();
        let new_path = change.path.replace(old_name, &new_name);

        let new_change = Arc::new(SourceChange {
            path: new_path,
            source_element_name: new_name,
        });
        let mut renamed = tag.clone();
        renamed.payload = match kind {
            TagKind::SourceStarted => TagPayload::SourceStarted(new_change),
            _ => TagPayload::SourceEnded(new_change),
        };
        out.push(renamed);
    }
}

pub struct RenamerFactory {
    pattern: Regex,
    replace: String,
}

impl RenamerFactory {
    pub fn new(pattern: &str, replace: impl Into<String>) -> Result<Self, GraphError> {
        Ok(RenamerFactory {
            pattern: Regex::new(pattern)?,
            replace: replace.into(),
        })
    }
}

impl FilterFactory for RenamerFactory {
    type Filter = RenamerFilter;

    fn class_name(&self) -> &'static str {
        ELEMENT_CLASS_NAME
    }

    fn create_filter(&self, _media: &str, _req: &Request) -> Option<RenamerFilter> {
        Some(RenamerFilter {
            pattern: self.pattern.clone(),
            replace: self.replace.clone(),
        })
    }
}

pub type StreamRenamerElement = FilteringElement<RenamerFactory>;

pub fn new_stream_renamer_element(
    name: impl Into<String>,
    mapper: MapperRef,
    pattern: &str,
    replace: &str,
) -> Result<Arc<StreamRenamerElement>, GraphError> {
    Ok(FilteringElement::new(
        name,
        mapper,
        RenamerFactory::new(pattern, replace)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_tag::DEFAULT_FLAVOUR_MASK;

    #[test]
    fn renames_stream_and_path() {
        let factory = RenamerFactory::new("^cam(\\d+)$", "camera-$1").unwrap();
        let mut filter = factory.create_filter("", &Request::new()).unwrap();
        let mut out = Vec::new();
        filter.filter_tag(
            &Tag::source_started(DEFAULT_FLAVOUR_MASK, "cam1/live.f4v", "cam1"),
            &mut out,
        );
        assert_eq!(out.len(), 1);
        let change = out[0].source_change().unwrap();
        assert_eq!(change.source_element_name, "camera-1");
        assert_eq!(change.path, "camera-1/live.f4v");
    }

    #[test]
    fn non_matching_names_pass_through() {
        let factory = RenamerFactory::new("^cam(\\d+)$", "camera-$1").unwrap();
        let mut filter = factory.create_filter("", &Request::new()).unwrap();
        let mut out = Vec::new();
        filter.filter_tag(
            &Tag::source_started(DEFAULT_FLAVOUR_MASK, "mic/live", "mic"),
            &mut out,
        );
        assert_eq!(out[0].source_change().unwrap().source_element_name, "mic");
    }
}
