//! Derived cache and coalescing keys
//!
//! Keys are computed from requests, never stored in them. Two requests with
//! equal keys at a given stage share that stage's work:
//!
//! - `load key` — HTTP-relevant source fields; equal keys coalesce fetches.
//! - `decode key` — load key plus decoder-selection parameters.
//! - `process key` — decode key plus the prefix of processors applied.
//! - memory key — image id plus the full processor chain.
//! - disk key — image id alone (original variant) or image id plus the
//!   processor chain (processed variant).

use std::fmt;
use std::fmt::Write as _;

use crate::request::ImageRequest;

/// Key of a decoded container in the memory cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryCacheKey {
    image_id: String,
    processors: String,
}

impl MemoryCacheKey {
    #[must_use]
    pub fn new(image_id: impl Into<String>, processors: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
            processors: processors.into(),
        }
    }

    #[must_use]
    pub fn image_id(&self) -> &str {
        &self.image_id
    }
}

impl fmt::Display for MemoryCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.image_id, self.processors)
    }
}

/// Which disk-cache entry a key addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskCacheVariant {
    /// Raw bytes as fetched from the origin.
    Original,
    /// Encoded output after the request's processors were applied.
    Processed,
}

/// Concatenated identifiers of the first `count` processors of a request.
pub(crate) fn processor_chain_id(request: &ImageRequest, count: usize) -> String {
    let mut id = String::new();
    for processor in request.processors.iter().take(count) {
        let _ = write!(id, "{}", processor.identifier());
    }
    id
}

/// Memory-cache key for the container with the first `count` processors
/// applied. `count == request.processors.len()` is the final key.
pub(crate) fn memory_key_prefix(request: &ImageRequest, count: usize) -> MemoryCacheKey {
    MemoryCacheKey::new(request.image_id(), processor_chain_id(request, count))
}

/// Memory-cache key for the fully processed container.
pub(crate) fn memory_key(request: &ImageRequest) -> MemoryCacheKey {
    memory_key_prefix(request, request.processors.len())
}

/// Disk-cache key for the given variant.
pub(crate) fn disk_key(request: &ImageRequest, variant: DiskCacheVariant) -> String {
    match variant {
        DiskCacheVariant::Original => request.image_id().to_owned(),
        DiskCacheVariant::Processed => format!(
            "{}{}",
            request.image_id(),
            processor_chain_id(request, request.processors.len())
        ),
    }
}

/// Coalescing key for the fetch stage.
///
/// Covers the source identity, extra headers, and the option bits: options
/// change what a fetch is allowed to read and write, so requests that
/// differ in them must not share work.
pub(crate) fn load_key(request: &ImageRequest) -> String {
    let mut key = format!("{}\u{1f}{:02x}", request.source.identifier(), request.options.bits());
    if let crate::request::ImageSource::Url { headers, .. } = &request.source {
        for (name, value) in headers {
            let _ = write!(key, "\u{1f}{name}:{value}");
        }
    }
    key
}

/// Coalescing key for the decode stage.
pub(crate) fn decode_key(request: &ImageRequest) -> String {
    let mut key = load_key(request);
    if let Some(scale) = request.user_info.scale {
        let _ = write!(key, "\u{1f}s{scale}");
    }
    key
}

/// Coalescing key for the process stage with `count` processors applied.
pub(crate) fn process_key(request: &ImageRequest, count: usize) -> String {
    format!("{}\u{1f}{}", decode_key(request), processor_chain_id(request, count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ImageRequest, RequestOptions};
    use crate::test_support::NoopProcessor;
    use std::sync::Arc;

    fn request_with_processors(ids: &[&str]) -> ImageRequest {
        ImageRequest::url("https://example.com/img.jpg").with_processors(
            ids.iter().map(|id| Arc::new(NoopProcessor::new(id)) as _).collect(),
        )
    }

    #[test]
    fn equal_requests_have_equal_load_keys() {
        let a = ImageRequest::url("https://example.com/img.jpg");
        let b = ImageRequest::url("https://example.com/img.jpg");
        assert_eq!(load_key(&a), load_key(&b));
    }

    #[test]
    fn options_split_load_keys() {
        let a = ImageRequest::url("https://example.com/img.jpg");
        let b = ImageRequest::url("https://example.com/img.jpg")
            .with_options(RequestOptions::RELOAD_IGNORING_CACHED_DATA);
        assert_ne!(load_key(&a), load_key(&b));
    }

    #[test]
    fn filter_id_changes_cache_keys_but_not_load_key() {
        let plain = ImageRequest::url("https://example.com/img.jpg?sig=1");
        let filtered = ImageRequest::url("https://example.com/img.jpg?sig=1")
            .with_filter_id("https://example.com/img.jpg");
        assert_ne!(memory_key(&plain), memory_key(&filtered));
        assert_eq!(load_key(&plain), load_key(&filtered));
    }

    #[test]
    fn disk_key_variants() {
        let request = request_with_processors(&["P1"]);
        assert_eq!(
            disk_key(&request, DiskCacheVariant::Original),
            "https://example.com/img.jpg"
        );
        assert_eq!(
            disk_key(&request, DiskCacheVariant::Processed),
            "https://example.com/img.jpgP1"
        );
    }

    #[test]
    fn process_keys_distinguish_prefixes() {
        let request = request_with_processors(&["P1", "P2"]);
        let keys: Vec<_> = (0..=2).map(|n| process_key(&request, n)).collect();
        assert_ne!(keys[0], keys[1]);
        assert_ne!(keys[1], keys[2]);
        assert_eq!(process_key(&request, 0), decode_key(&request) + "\u{1f}");
    }
}
