//! Pipeline configuration
//!
//! [`PipelineConfiguration`] is a value type assembled with chained setters
//! and copied into each [`ImagePipeline`](crate::ImagePipeline) at
//! construction. Work queues are shared handles: adjusting a queue's
//! concurrency affects every pipeline built from the same configuration.

use std::sync::Arc;

use bytes::Bytes;

use crate::container::{ImageContainer, ImageType, PlatformImage};
use crate::memory_cache::MemoryCache;
use crate::queue::WorkQueue;
use crate::traits::{
    DataCaching, DataLoading, DecodeContext, EncodeContext, ImageCaching, ImageDecoding,
    ImageEncoding, ImageProcessing,
};

/// Which byte artifacts the pipeline writes to the disk cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DataCachePolicy {
    /// Store original bytes for requests without processors; store the
    /// encoded processed image for requests with processors.
    #[default]
    Automatic,
    /// Store only original bytes.
    StoreOriginalData,
    /// Encode and store the (possibly processed) output only.
    StoreEncodedImages,
    /// Store both original bytes and encoded processed output.
    StoreAll,
}

/// Picks a decoder for the given context and (partial or complete) bytes.
/// Returning `None` surfaces
/// [`DecoderNotRegistered`](crate::PipelineError::DecoderNotRegistered).
pub type DecoderRegistry =
    Arc<dyn Fn(&DecodeContext, &Bytes) -> Option<Arc<dyn ImageDecoding>> + Send + Sync>;

/// Picks an encoder for the given context. Returning `None` skips encoded
/// disk-cache writes.
pub type EncoderRegistry = Arc<dyn Fn(&EncodeContext) -> Option<Arc<dyn ImageEncoding>> + Send + Sync>;

/// Built-in decoder used by the default registry: tags the sniffed format
/// and wraps the bytes into an opaque container without touching pixels.
/// Platform codec bindings are expected to replace it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SniffingDecoder;

impl ImageDecoding for SniffingDecoder {
    fn name(&self) -> &'static str {
        "sniffing"
    }

    fn decode(&self, data: &Bytes, context: &DecodeContext) -> anyhow::Result<ImageContainer> {
        let image_type = ImageType::sniff(data);
        let mut container = ImageContainer::new(PlatformImage::new(0, 0, data.clone()));
        container.image.scale = context.request.user_info.scale.unwrap_or(1.0);
        container.data = Some(data.clone());
        container.image_type = image_type;
        Ok(container)
    }
}

fn default_decoder_registry() -> DecoderRegistry {
    Arc::new(|_context, data| {
        ImageType::sniff(data).map(|_| Arc::new(SniffingDecoder) as Arc<dyn ImageDecoding>)
    })
}

fn default_encoder_registry() -> EncoderRegistry {
    Arc::new(|_context| None)
}

/// All recognized pipeline options. See the field docs for defaults.
#[derive(Clone)]
pub struct PipelineConfiguration {
    /// Loads raw bytes for URL sources. Required.
    pub data_loader: Arc<dyn DataLoading>,
    /// Memory cache of decoded containers. Defaults to a [`MemoryCache`].
    pub image_cache: Arc<dyn ImageCaching>,
    /// Disk cache of raw/encoded bytes. `None` disables disk caching.
    pub data_cache: Option<Arc<dyn DataCaching>>,
    /// Decoder selection. Defaults to magic-byte sniffing.
    pub make_image_decoder: DecoderRegistry,
    /// Encoder selection. Defaults to none (encoded writes are skipped).
    pub make_image_encoder: EncoderRegistry,

    /// Network/file operations; default max concurrency 6.
    pub data_loading_queue: WorkQueue,
    /// Decodes; default max concurrency 1.
    pub image_decoding_queue: WorkQueue,
    /// Processor invocations; default max concurrency 2.
    pub image_processing_queue: WorkQueue,
    /// Disk cache I/O; default max concurrency 2.
    pub data_caching_queue: WorkQueue,
    /// Encodes; default max concurrency 1.
    pub image_encoding_queue: WorkQueue,

    /// Deliver previews from progressive decoders. Default `false`.
    pub is_progressive_decoding_enabled: bool,
    /// Write each preview to the memory cache (replaced by the final
    /// image). Default `false`.
    pub is_storing_previews_in_memory_cache: bool,
    /// Stash interrupted downloads for range resumption. Default `true`.
    pub is_resumable_data_enabled: bool,
    /// Collapse equivalent work across concurrent requests. Default `true`.
    pub is_task_coalescing_enabled: bool,
    /// Smooth fetch bursts with a leaky bucket. Default `true`.
    pub is_rate_limiter_enabled: bool,
    /// Run the decompression pass after decoding. Default `true`.
    pub is_decompression_enabled: bool,
    /// Disk-cache write matrix. Default [`DataCachePolicy::Automatic`].
    pub data_cache_policy: DataCachePolicy,
    /// Processors applied when a request carries none. Default empty.
    pub processors: Vec<Arc<dyn ImageProcessing>>,
}

impl PipelineConfiguration {
    /// Configuration with the documented defaults around `data_loader`.
    #[must_use]
    pub fn new(data_loader: Arc<dyn DataLoading>) -> Self {
        Self {
            data_loader,
            image_cache: Arc::new(MemoryCache::new()),
            data_cache: None,
            make_image_decoder: default_decoder_registry(),
            make_image_encoder: default_encoder_registry(),
            data_loading_queue: WorkQueue::new("data-loading", 6),
            image_decoding_queue: WorkQueue::new("image-decoding", 1),
            image_processing_queue: WorkQueue::new("image-processing", 2),
            data_caching_queue: WorkQueue::new("data-caching", 2),
            image_encoding_queue: WorkQueue::new("image-encoding", 1),
            is_progressive_decoding_enabled: false,
            is_storing_previews_in_memory_cache: false,
            is_resumable_data_enabled: true,
            is_task_coalescing_enabled: true,
            is_rate_limiter_enabled: true,
            is_decompression_enabled: true,
            data_cache_policy: DataCachePolicy::default(),
            processors: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_image_cache(mut self, image_cache: Arc<dyn ImageCaching>) -> Self {
        self.image_cache = image_cache;
        self
    }

    #[must_use]
    pub fn with_data_cache(mut self, data_cache: Arc<dyn DataCaching>) -> Self {
        self.data_cache = Some(data_cache);
        self
    }

    #[must_use]
    pub fn with_decoder_registry(mut self, make_image_decoder: DecoderRegistry) -> Self {
        self.make_image_decoder = make_image_decoder;
        self
    }

    #[must_use]
    pub fn with_encoder_registry(mut self, make_image_encoder: EncoderRegistry) -> Self {
        self.make_image_encoder = make_image_encoder;
        self
    }

    #[must_use]
    pub fn with_data_cache_policy(mut self, policy: DataCachePolicy) -> Self {
        self.data_cache_policy = policy;
        self
    }

    #[must_use]
    pub fn with_progressive_decoding(mut self, enabled: bool) -> Self {
        self.is_progressive_decoding_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_storing_previews_in_memory_cache(mut self, enabled: bool) -> Self {
        self.is_storing_previews_in_memory_cache = enabled;
        self
    }

    #[must_use]
    pub fn with_resumable_data(mut self, enabled: bool) -> Self {
        self.is_resumable_data_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_task_coalescing(mut self, enabled: bool) -> Self {
        self.is_task_coalescing_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, enabled: bool) -> Self {
        self.is_rate_limiter_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_decompression(mut self, enabled: bool) -> Self {
        self.is_decompression_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_default_processors(mut self, processors: Vec<Arc<dyn ImageProcessing>>) -> Self {
        self.processors = processors;
        self
    }
}
