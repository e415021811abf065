//! Resumable downloads
//!
//! When a fetch dies (cancelled or failed) after receiving part of a body
//! whose response carries a validator (`ETag`, else `Last-Modified`), the
//! partial bytes are stashed in a process-wide, short-lived store. The next
//! fetch for the same URL sends `Range: bytes=N-` and `If-Range:
//! <validator>`; a 206 response is prepended with the stashed bytes, a 200
//! response discards them.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use moka::sync::Cache;
use tracing::debug;

use crate::container::DataResponse;
use crate::traits::DataRequest;

const STORE_TTL: Duration = Duration::from_secs(150);
const STORE_CAPACITY: u64 = 32;

/// Partial body plus the validator required for `If-Range`.
#[derive(Debug, Clone)]
pub(crate) struct ResumableData {
    pub data: Bytes,
    pub validator: String,
}

/// Process-wide table of resumable downloads keyed by URL.
pub(crate) struct ResumableDataStore {
    cache: Cache<String, Arc<ResumableData>>,
}

impl ResumableDataStore {
    fn new() -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(STORE_CAPACITY)
                .time_to_live(STORE_TTL)
                .build(),
        }
    }

    /// The shared process-wide store.
    pub(crate) fn shared() -> &'static Self {
        static SHARED: OnceLock<ResumableDataStore> = OnceLock::new();
        SHARED.get_or_init(Self::new)
    }

    /// Stash a partial body if the response supports byte-range resumption.
    pub(crate) fn stash(&self, url: &str, response: Option<&DataResponse>, data: &Bytes) {
        if data.is_empty() {
            return;
        }
        let Some(validator) = response.and_then(validator) else {
            return;
        };
        debug!(url, len = data.len(), "stashing resumable data");
        self.cache.insert(
            url.to_owned(),
            Arc::new(ResumableData {
                data: data.clone(),
                validator,
            }),
        );
    }

    /// Remove and return the stash for `url`, if any.
    pub(crate) fn take(&self, url: &str) -> Option<Arc<ResumableData>> {
        let stashed = self.cache.get(url)?;
        self.cache.invalidate(url);
        Some(stashed)
    }
}

/// Validator for `If-Range`: `ETag` wins over `Last-Modified`.
fn validator(response: &DataResponse) -> Option<String> {
    response
        .header("ETag")
        .or_else(|| response.header("Last-Modified"))
        .map(str::to_owned)
}

/// Add `Range`/`If-Range` headers continuing `resumable`.
pub(crate) fn apply_range_headers(request: &mut DataRequest, resumable: &ResumableData) {
    request
        .headers
        .push(("Range".to_owned(), format!("bytes={}-", resumable.data.len())));
    request
        .headers
        .push(("If-Range".to_owned(), resumable.validator.clone()));
}

/// `true` when the server honored the range request and the stashed bytes
/// must be prepended; a 200 means full content and the stash is discarded.
pub(crate) fn is_resumed_response(response: &DataResponse) -> bool {
    response.status_code == Some(206)
}
