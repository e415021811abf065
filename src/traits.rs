//! Collaborator interfaces
//!
//! The pipeline core consumes its external collaborators through the narrow
//! traits below: a data loader, decoders, encoders, processors, and the two
//! cache layers. Implement these to plug in an HTTP client, codec bindings,
//! or custom cache backends.
//!
//! # Thread safety
//!
//! All collaborators must be `Send + Sync`; the pipeline invokes them from
//! its worker queues. Decoders and processors are synchronous (they run CPU
//! work on the decoding/processing queues); loaders and byte caches are
//! async.

use async_trait::async_trait;
use bytes::Bytes;

use crate::container::{CacheSource, DataResponse, ImageContainer};
use crate::keys::MemoryCacheKey;
use crate::request::ImageRequest;

/// Request handed to a [`DataLoading`] implementation.
///
/// When a resumable download is being continued, `Range` and `If-Range`
/// headers are already present in `headers`.
#[derive(Debug, Clone)]
pub struct DataRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

/// Loads raw bytes for a URL.
///
/// Implementations must deliver chunks in order and must pass the transport
/// response with every chunk (the pipeline reads it from the first one).
/// When the returned future is dropped, no further deliveries may occur.
#[async_trait]
pub trait DataLoading: Send + Sync {
    /// Load `request`, pushing each received chunk through `on_chunk`
    /// together with the transport response.
    ///
    /// # Errors
    ///
    /// Any transport-level failure. Non-success HTTP statuses may be
    /// reported either as an error or through the response's status code;
    /// the pipeline treats both as
    /// [`DataLoadingFailed`](crate::PipelineError::DataLoadingFailed).
    async fn load_data(
        &self,
        request: &DataRequest,
        on_chunk: &(dyn for<'a> Fn(Bytes, &'a DataResponse) + Send + Sync),
    ) -> anyhow::Result<()>;
}

/// Context passed to decoders.
#[derive(Debug, Clone)]
pub struct DecodeContext {
    pub request: ImageRequest,
    /// `false` while decoding a partial (progressive) byte accumulation.
    pub is_completed: bool,
    /// Where the bytes came from.
    pub cache_source: CacheSource,
    /// `true` when the decompression pass after decoding should be skipped,
    /// either per request or pipeline-wide.
    pub skip_decompression: bool,
}

/// Converts encoded bytes into an [`ImageContainer`].
pub trait ImageDecoding: Send + Sync {
    /// Stable name used in error reports.
    fn name(&self) -> &'static str;

    /// Decode a complete byte buffer.
    ///
    /// # Errors
    ///
    /// Any decoder-specific failure; surfaced as
    /// [`DecodingFailed`](crate::PipelineError::DecodingFailed).
    fn decode(&self, data: &Bytes, context: &DecodeContext) -> anyhow::Result<ImageContainer>;

    /// Attempt a partial decode of an incomplete byte accumulation.
    ///
    /// Only called when [`Self::is_progressive`] returns `true`. Returning
    /// `None` means no new scan could be decoded yet. Implementations
    /// record the scan number under
    /// [`SCAN_NUMBER_KEY`](crate::container::SCAN_NUMBER_KEY) so the
    /// pipeline can deduplicate previews.
    fn decode_partial(&self, data: &Bytes, context: &DecodeContext) -> Option<ImageContainer> {
        let _ = (data, context);
        None
    }

    /// `true` when the decoder can produce previews from partial data.
    fn is_progressive(&self) -> bool {
        false
    }
}

/// Context passed to encoders.
#[derive(Debug, Clone)]
pub struct EncodeContext {
    pub request: ImageRequest,
}

/// Converts a container back into encoded bytes for disk caching.
pub trait ImageEncoding: Send + Sync {
    /// Encode the container, or `None` when it cannot be represented.
    fn encode(&self, container: &ImageContainer, context: &EncodeContext) -> Option<Bytes>;
}

/// Context passed to processors.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    pub request: ImageRequest,
    /// `true` when processing a progressive preview rather than the final
    /// image.
    pub is_preview: bool,
}

/// A deterministic transform on a decoded container.
///
/// Two processors with equal identifiers must produce identical output for
/// identical input; the identifier participates in cache keys.
pub trait ImageProcessing: Send + Sync {
    /// Stable identity of this transform, including its parameters.
    fn identifier(&self) -> String;

    /// Optional pre-hashed identity for fast equality checks.
    fn hashable_identifier(&self) -> Option<u64> {
        None
    }

    /// Apply the transform.
    ///
    /// # Errors
    ///
    /// Any processor-specific failure; surfaced as
    /// [`ProcessingFailed`](crate::PipelineError::ProcessingFailed).
    fn process(
        &self,
        container: ImageContainer,
        context: &ProcessContext,
    ) -> anyhow::Result<ImageContainer>;
}

/// Byte cache on persistent storage.
///
/// `put`/`remove` may be satisfied by staging: a `get` issued after a `put`
/// must observe the staged value even before `flush` persists it.
#[async_trait]
pub trait DataCaching: Send + Sync {
    /// Key presence without materializing value bytes.
    async fn contains(&self, key: &str) -> bool;

    async fn get(&self, key: &str) -> Option<Bytes>;

    async fn put(&self, key: &str, data: Bytes);

    async fn remove(&self, key: &str);

    async fn remove_all(&self);

    /// Persist all staged changes.
    async fn flush(&self);

    /// Persist staged changes for one key.
    async fn flush_key(&self, key: &str);
}

/// Cache of decoded containers, keyed by [`MemoryCacheKey`].
///
/// Operations are synchronous; the pipeline calls them inline during
/// request orchestration.
pub trait ImageCaching: Send + Sync {
    fn get(&self, key: &MemoryCacheKey) -> Option<ImageContainer>;

    fn put(&self, key: MemoryCacheKey, container: ImageContainer);

    fn remove(&self, key: &MemoryCacheKey);

    fn remove_all(&self);
}
