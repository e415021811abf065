//! Pixelpipe
//!
//! An image-loading pipeline for client applications: given a request
//! describing where to fetch an image and how to transform it, the
//! pipeline returns a ready-to-display container while coordinating
//! network access, decoding, processing, memory and disk caches,
//! progressive delivery, task coalescing, priority scheduling, and
//! cancellation.
//!
//! - **Memory cache**: cost-bounded LRU of decoded containers
//! - **Disk cache**: staged, swept byte store surviving restarts
//! - **Task coalescing**: equivalent fetch/decode/process work is shared
//!   across concurrent requests
//! - **Priority scheduling**: every queue runs the highest-priority work
//!   first; priorities propagate through the dependency graph
//! - **Progressive decoding**: previews from partial data, with
//!   latest-buffer back-pressure
//! - **Resumable downloads**: interrupted fetches continue with HTTP
//!   range requests
//!
//! # Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pixelpipe::{ImagePipeline, ImageRequest, PipelineConfiguration};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfiguration::new(Arc::new(MyHttpLoader::new()))
//!         .with_data_cache(pixelpipe::DataCache::new("/tmp/pixelpipe")?);
//!     let pipeline = ImagePipeline::new(config);
//!
//!     let response = pipeline.image(ImageRequest::url("https://example.com/img.jpg")).await?;
//!     println!("loaded {:?}", response.container.image_type);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! request → memory cache → process chain → decode → fetch → data loader
//!           ↓ hit                                   ↓ may read/write
//!           done                                    disk cache + resumable store
//! ```
//!
//! Each arrow is a coalescing job keyed by what it computes; values flow
//! back up the chain and are cached per policy on the way. Collaborators
//! (HTTP client, codecs, processors, custom cache backends) plug in
//! through the traits in [`traits`].

pub mod config;
pub mod container;
pub mod data_cache;
pub mod error;
pub mod facade;
mod job;
pub mod keys;
pub mod memory_cache;
mod pipeline;
pub mod queue;
pub mod request;
mod resumable;
mod task;
pub mod traits;

pub use config::{DataCachePolicy, DecoderRegistry, EncoderRegistry, PipelineConfiguration, SniffingDecoder};
pub use container::{
    CacheSource, DataResponse, ImageContainer, ImageResponse, ImageType, PlatformImage,
    SCAN_NUMBER_KEY,
};
pub use data_cache::{DataCache, DataCacheConfig, DataCacheStats};
pub use error::{PipelineError, UnderlyingError};
pub use facade::{CacheLayers, ImageCaches};
pub use keys::{DiskCacheVariant, MemoryCacheKey};
pub use memory_cache::{MemoryCache, MemoryCacheStats};
pub use pipeline::{ImagePipeline, PipelineStatsSnapshot};
pub use queue::WorkQueue;
pub use request::{ImageRequest, ImageSource, Priority, RequestOptions, UserInfo};
pub use task::{DataTask, DataTaskResult, ImageTask, TaskEvent, TaskProgress, TaskState};

// Re-export async_trait: collaborator traits are declared with it.
pub use async_trait::async_trait;
