//! Image request model
//!
//! An [`ImageRequest`] describes *what* to load: the source of the bytes,
//! the processors to apply, per-request options, a priority, and an opaque
//! user-info map. Requests are value types; they are cheap to clone and are
//! copied into the pipeline when a task starts.

use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::traits::ImageProcessing;

/// Priority of an image task.
///
/// Priorities order pending work on every pipeline queue; a coalesced job
/// runs at the maximum priority of its subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    VeryLow,
    Low,
    #[default]
    Normal,
    High,
    VeryHigh,
}

/// Bit-set of per-request loading options.
///
/// Options combine with `|`:
///
/// ```
/// use pixelpipe::RequestOptions;
///
/// let options = RequestOptions::DISABLE_MEMORY_CACHE_READS
///     | RequestOptions::DISABLE_DISK_CACHE_WRITES;
/// assert!(options.contains(RequestOptions::DISABLE_MEMORY_CACHE_READS));
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RequestOptions {
    bits: u8,
}

impl RequestOptions {
    /// Skip the memory cache lookup.
    pub const DISABLE_MEMORY_CACHE_READS: Self = Self { bits: 1 };
    /// Never store decoded containers in the memory cache.
    pub const DISABLE_MEMORY_CACHE_WRITES: Self = Self { bits: 1 << 1 };
    /// Skip the disk cache lookup.
    pub const DISABLE_DISK_CACHE_READS: Self = Self { bits: 1 << 2 };
    /// Never store bytes in the disk cache.
    pub const DISABLE_DISK_CACHE_WRITES: Self = Self { bits: 1 << 3 };
    /// Skip all cache reads but still write per policy.
    pub const RELOAD_IGNORING_CACHED_DATA: Self = Self { bits: 1 << 4 };
    /// Only serve from caches; fail with
    /// [`DataMissingInCache`](crate::PipelineError::DataMissingInCache)
    /// instead of loading.
    pub const RETURN_CACHE_DATA_DONT_LOAD: Self = Self { bits: 1 << 5 };
    /// Skip the decompression pass after decoding.
    pub const SKIP_DECOMPRESSION: Self = Self { bits: 1 << 6 };

    /// The empty option set.
    #[must_use]
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    /// `true` if every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.bits & other.bits == other.bits
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    pub(crate) const fn bits(self) -> u8 {
        self.bits
    }

    pub(crate) fn memory_reads_enabled(self) -> bool {
        !self.contains(Self::DISABLE_MEMORY_CACHE_READS)
            && !self.contains(Self::RELOAD_IGNORING_CACHED_DATA)
    }

    pub(crate) fn memory_writes_enabled(self) -> bool {
        !self.contains(Self::DISABLE_MEMORY_CACHE_WRITES)
    }

    pub(crate) fn disk_reads_enabled(self) -> bool {
        !self.contains(Self::DISABLE_DISK_CACHE_READS)
            && !self.contains(Self::RELOAD_IGNORING_CACHED_DATA)
    }

    pub(crate) fn disk_writes_enabled(self) -> bool {
        !self.contains(Self::DISABLE_DISK_CACHE_WRITES)
    }
}

impl BitOr for RequestOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestOptions({:#09b})", self.bits)
    }
}

/// Producer for [`ImageSource::Lazy`]: an async closure yielding the bytes.
pub type LazyDataProducer =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Bytes>> + Send + Sync>;

/// Where the raw image bytes come from.
#[derive(Clone)]
pub enum ImageSource {
    /// A remote URL fetched through the configured data loader.
    Url {
        url: String,
        /// Additional HTTP headers sent with the request.
        headers: Vec<(String, String)>,
    },
    /// A local file read directly, bypassing the disk cache.
    File(PathBuf),
    /// An inline blob, bypassing both loader and disk cache.
    Data { id: String, data: Bytes },
    /// A lazily invoked async byte producer.
    Lazy { id: String, make: LazyDataProducer },
}

impl ImageSource {
    /// Source for a plain URL with no extra headers.
    pub fn url(url: impl Into<String>) -> Self {
        Self::Url {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    /// Canonical identifier of this source, used to derive cache keys.
    #[must_use]
    pub fn identifier(&self) -> &str {
        match self {
            Self::Url { url, .. } => url,
            Self::File(path) => path.to_str().unwrap_or("file"),
            Self::Data { id, .. } | Self::Lazy { id, .. } => id,
        }
    }

    /// `true` for sources whose bytes never touch the disk cache.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::File(_) | Self::Data { .. })
    }
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url { url, headers } => f
                .debug_struct("Url")
                .field("url", url)
                .field("headers", &headers.len())
                .finish(),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Data { id, data } => f
                .debug_struct("Data")
                .field("id", id)
                .field("len", &data.len())
                .finish(),
            Self::Lazy { id, .. } => f.debug_struct("Lazy").field("id", id).finish(),
        }
    }
}

/// Opaque per-request metadata.
///
/// `filter_id` overrides the canonical identifier used for cache keys when
/// the URL carries volatile query parameters but denotes the same image.
/// `scale` overrides the display scale recorded on decoded images. `extra`
/// is passed through to decoders and processors untouched.
#[derive(Debug, Clone, Default)]
pub struct UserInfo {
    pub filter_id: Option<String>,
    pub scale: Option<f32>,
    pub extra: HashMap<String, serde_json::Value>,
}

/// Describes an image load: source, transformations, options, priority.
#[derive(Clone)]
pub struct ImageRequest {
    pub source: ImageSource,
    /// Ordered processor chain; order is semantic.
    pub processors: Vec<Arc<dyn ImageProcessing>>,
    pub options: RequestOptions,
    pub priority: Priority,
    pub user_info: UserInfo,
}

impl ImageRequest {
    pub fn new(source: ImageSource) -> Self {
        Self {
            source,
            processors: Vec::new(),
            options: RequestOptions::empty(),
            priority: Priority::default(),
            user_info: UserInfo::default(),
        }
    }

    /// Request for a plain URL.
    pub fn url(url: impl Into<String>) -> Self {
        Self::new(ImageSource::url(url))
    }

    #[must_use]
    pub fn with_processors(mut self, processors: Vec<Arc<dyn ImageProcessing>>) -> Self {
        self.processors = processors;
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_filter_id(mut self, filter_id: impl Into<String>) -> Self {
        self.user_info.filter_id = Some(filter_id.into());
        self
    }

    /// Identifier the cache keys are derived from: the user-info filter id
    /// when present, otherwise the canonical source identifier.
    #[must_use]
    pub fn image_id(&self) -> &str {
        self.user_info
            .filter_id
            .as_deref()
            .unwrap_or_else(|| self.source.identifier())
    }
}

impl fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRequest")
            .field("source", &self.source)
            .field("processors", &self.processors.len())
            .field("options", &self.options)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_compose() {
        let options =
            RequestOptions::DISABLE_MEMORY_CACHE_READS | RequestOptions::SKIP_DECOMPRESSION;
        assert!(options.contains(RequestOptions::DISABLE_MEMORY_CACHE_READS));
        assert!(options.contains(RequestOptions::SKIP_DECOMPRESSION));
        assert!(!options.contains(RequestOptions::DISABLE_DISK_CACHE_READS));
    }

    #[test]
    fn reload_disables_reads_but_not_writes() {
        let options = RequestOptions::RELOAD_IGNORING_CACHED_DATA;
        assert!(!options.memory_reads_enabled());
        assert!(!options.disk_reads_enabled());
        assert!(options.memory_writes_enabled());
        assert!(options.disk_writes_enabled());
    }

    #[test]
    fn filter_id_overrides_image_id() {
        let request = ImageRequest::url("https://example.com/img.jpg?token=abc")
            .with_filter_id("https://example.com/img.jpg");
        assert_eq!(request.image_id(), "https://example.com/img.jpg");
    }

    #[test]
    fn priorities_are_ordered() {
        assert!(Priority::VeryHigh > Priority::High);
        assert!(Priority::Normal > Priority::Low);
        assert!(Priority::Low > Priority::VeryLow);
    }
}
