//! Cache façade
//!
//! Uniform read/write/remove access to the memory and disk layers with
//! explicit layer targeting. The façade never performs network I/O and
//! never decodes, processes, or encodes: the memory layer trades in
//! materialized containers, the disk layer in raw bytes. Turning disk
//! bytes into a container requires the pipeline's decoder registry and is
//! out of the façade's scope.

use std::ops::BitOr;
use std::sync::Arc;

use bytes::Bytes;

use crate::container::ImageContainer;
use crate::keys::{self, DiskCacheVariant, MemoryCacheKey};
use crate::request::ImageRequest;
use crate::traits::{DataCaching, ImageCaching};

/// Which cache layers an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLayers {
    bits: u8,
}

impl CacheLayers {
    pub const MEMORY: Self = Self { bits: 1 };
    pub const DISK: Self = Self { bits: 1 << 1 };
    pub const ALL: Self = Self { bits: 0b11 };

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.bits & other.bits == other.bits
    }
}

impl BitOr for CacheLayers {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self {
            bits: self.bits | rhs.bits,
        }
    }
}

/// Direct access to the pipeline's cache layers. See the module docs.
#[derive(Clone)]
pub struct ImageCaches {
    image_cache: Arc<dyn ImageCaching>,
    data_cache: Option<Arc<dyn DataCaching>>,
}

impl ImageCaches {
    pub(crate) fn new(
        image_cache: Arc<dyn ImageCaching>,
        data_cache: Option<Arc<dyn DataCaching>>,
    ) -> Self {
        Self {
            image_cache,
            data_cache,
        }
    }

    /// Memory-cache key for the fully processed image of `request`.
    #[must_use]
    pub fn memory_cache_key(&self, request: &ImageRequest) -> MemoryCacheKey {
        keys::memory_key(request)
    }

    /// Disk-cache key of `request` for the given variant.
    #[must_use]
    pub fn data_cache_key(&self, request: &ImageRequest, variant: DiskCacheVariant) -> String {
        keys::disk_key(request, variant)
    }

    /// Look up the decoded container for `request`.
    ///
    /// Only the memory layer can answer with a container; disk holds raw
    /// bytes (see [`Self::cached_data`]).
    #[must_use]
    pub fn cached_image(&self, request: &ImageRequest, layers: CacheLayers) -> Option<ImageContainer> {
        if layers.contains(CacheLayers::MEMORY) {
            return self.image_cache.get(&keys::memory_key(request));
        }
        None
    }

    /// Store a container for `request`. The memory layer stores it as-is;
    /// the disk layer stores the container's raw bytes when it carries
    /// them (the façade never encodes).
    pub async fn store_cached_image(
        &self,
        container: ImageContainer,
        request: &ImageRequest,
        layers: CacheLayers,
    ) {
        if layers.contains(CacheLayers::DISK) {
            if let (Some(cache), Some(data)) = (&self.data_cache, container.data.clone()) {
                cache
                    .put(&keys::disk_key(request, DiskCacheVariant::Processed), data)
                    .await;
            }
        }
        if layers.contains(CacheLayers::MEMORY) {
            self.image_cache.put(keys::memory_key(request), container);
        }
    }

    /// Raw cached bytes for `request` (processed variant when the request
    /// has processors, original otherwise).
    pub async fn cached_data(&self, request: &ImageRequest) -> Option<Bytes> {
        let cache = self.data_cache.as_ref()?;
        cache
            .get(&keys::disk_key(request, DiskCacheVariant::Processed))
            .await
    }

    /// Store raw bytes for `request`.
    pub async fn store_cached_data(&self, data: Bytes, request: &ImageRequest) {
        if let Some(cache) = &self.data_cache {
            cache
                .put(&keys::disk_key(request, DiskCacheVariant::Processed), data)
                .await;
        }
    }

    /// `true` when the disk layer has bytes for `request`.
    pub async fn contains_data(&self, request: &ImageRequest) -> bool {
        match &self.data_cache {
            Some(cache) => {
                cache
                    .contains(&keys::disk_key(request, DiskCacheVariant::Processed))
                    .await
            }
            None => false,
        }
    }

    /// Remove the artifacts of `request` from the targeted layers.
    pub async fn remove(&self, request: &ImageRequest, layers: CacheLayers) {
        if layers.contains(CacheLayers::MEMORY) {
            self.image_cache.remove(&keys::memory_key(request));
        }
        if layers.contains(CacheLayers::DISK) {
            if let Some(cache) = &self.data_cache {
                cache
                    .remove(&keys::disk_key(request, DiskCacheVariant::Original))
                    .await;
                cache
                    .remove(&keys::disk_key(request, DiskCacheVariant::Processed))
                    .await;
            }
        }
    }

    /// Clear the targeted layers entirely.
    pub async fn remove_all(&self, layers: CacheLayers) {
        if layers.contains(CacheLayers::MEMORY) {
            self.image_cache.remove_all();
        }
        if layers.contains(CacheLayers::DISK) {
            if let Some(cache) = &self.data_cache {
                cache.remove_all().await;
            }
        }
    }
}
