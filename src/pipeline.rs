//! The image pipeline orchestrator
//!
//! For every request the pipeline walks the same decision tree: memory
//! cache → (disk cache of processed bytes) → process chain → decode →
//! fetch, where fetch itself may be satisfied by the disk cache of original
//! bytes before touching the data loader. Each stage is a coalescing job
//! keyed so that equivalent work is shared across concurrent requests;
//! values flow back up the chain and are cached per policy on the way.
//!
//! All CPU and I/O work runs on the configured priority queues; state
//! mutation of the graph happens inline under short locks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{DataCachePolicy, PipelineConfiguration};
use crate::container::{CacheSource, DataResponse, ImageContainer, ImageResponse};
use crate::error::PipelineError;
use crate::facade::ImageCaches;
use crate::job::{Job, JobEvent, JobRegistry, JobSink, JobSubscription, Starter};
use crate::keys::{DiskCacheVariant, disk_key, memory_key, memory_key_prefix, process_key};
use crate::keys::{decode_key, load_key};
use crate::queue::RateLimiter;
use crate::request::{ImageRequest, ImageSource, Priority, RequestOptions};
use crate::resumable::{ResumableDataStore, apply_range_headers, is_resumed_response};
use crate::task::{DataTask, DataTaskResult, ImageTask, TaskEvent, TaskInner, TaskProgress};
use crate::traits::{DataRequest, DecodeContext, EncodeContext, ImageDecoding, ImageProcessing, ProcessContext};

/// Output of the fetch stage: the full (or accumulating) byte buffer.
#[derive(Clone)]
struct FetchOutput {
    data: Bytes,
    response: Option<DataResponse>,
    source: CacheSource,
}

/// Output of the decode and process stages.
#[derive(Clone)]
struct StageImage {
    container: ImageContainer,
    response: Option<DataResponse>,
    source: CacheSource,
}

#[derive(Default)]
struct PipelineStats {
    tasks_created: AtomicU64,
    memory_hits: AtomicU64,
    fetch_jobs_created: AtomicU64,
    coalesced_fetches: AtomicU64,
}

/// Counter snapshot from [`ImagePipeline::stats`].
#[derive(Debug, Clone, Default)]
pub struct PipelineStatsSnapshot {
    pub tasks_created: u64,
    pub memory_hits: u64,
    pub fetch_jobs_created: u64,
    pub coalesced_fetches: u64,
}

enum RegisteredTask {
    Image(std::sync::Weak<TaskInner<ImageResponse>>),
    Data(std::sync::Weak<TaskInner<DataTaskResult>>),
}

impl RegisteredTask {
    fn cancel(&self) {
        match self {
            Self::Image(task) => {
                if let Some(task) = task.upgrade() {
                    task.cancel();
                }
            }
            Self::Data(task) => {
                if let Some(task) = task.upgrade() {
                    task.cancel();
                }
            }
        }
    }
}

/// Per-decode-job progressive state: the single latest-buffer slot and the
/// decoder instance shared between partial and final decodes.
#[derive(Default)]
struct DecodeJobState {
    decoder: Mutex<Option<Arc<dyn ImageDecoding>>>,
    latest_partial: Mutex<Option<FetchOutput>>,
    partial_busy: AtomicBool,
    final_started: AtomicBool,
    progressive_broken: AtomicBool,
    last_scan: Mutex<Option<u64>>,
}

pub(crate) struct PipelineInner {
    pub(crate) config: PipelineConfiguration,
    rate_limiter: RateLimiter,
    fetch_jobs: JobRegistry<FetchOutput>,
    decode_jobs: JobRegistry<StageImage>,
    process_jobs: JobRegistry<StageImage>,
    load_jobs: JobRegistry<StageImage>,
    tasks: Arc<DashMap<Uuid, RegisteredTask>>,
    invalidated: AtomicBool,
    stats: PipelineStats,
}

/// The image loading pipeline. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ImagePipeline {
    inner: Arc<PipelineInner>,
}

impl ImagePipeline {
    #[must_use]
    pub fn new(config: PipelineConfiguration) -> Self {
        info!(
            coalescing = config.is_task_coalescing_enabled,
            progressive = config.is_progressive_decoding_enabled,
            policy = ?config.data_cache_policy,
            "image pipeline created"
        );
        Self {
            inner: Arc::new(PipelineInner {
                config,
                rate_limiter: RateLimiter::new(),
                fetch_jobs: JobRegistry::default(),
                decode_jobs: JobRegistry::default(),
                process_jobs: JobRegistry::default(),
                load_jobs: JobRegistry::default(),
                tasks: Arc::new(DashMap::new()),
                invalidated: AtomicBool::new(false),
                stats: PipelineStats::default(),
            }),
        }
    }

    #[must_use]
    pub fn configuration(&self) -> &PipelineConfiguration {
        &self.inner.config
    }

    /// Direct read/write access to the cache layers.
    #[must_use]
    pub fn cache(&self) -> ImageCaches {
        ImageCaches::new(
            Arc::clone(&self.inner.config.image_cache),
            self.inner.config.data_cache.clone(),
        )
    }

    #[must_use]
    pub fn stats(&self) -> PipelineStatsSnapshot {
        let stats = &self.inner.stats;
        PipelineStatsSnapshot {
            tasks_created: stats.tasks_created.load(Ordering::Relaxed),
            memory_hits: stats.memory_hits.load(Ordering::Relaxed),
            fetch_jobs_created: stats.fetch_jobs_created.load(Ordering::Relaxed),
            coalesced_fetches: stats.coalesced_fetches.load(Ordering::Relaxed),
        }
    }

    /// Load an image and await the final response.
    ///
    /// # Errors
    ///
    /// Any [`PipelineError`] the load ends in.
    pub async fn image(&self, request: ImageRequest) -> Result<ImageResponse, PipelineError> {
        self.image_task(request).response().await
    }

    /// Start an image load and return its task handle.
    pub fn image_task(&self, request: ImageRequest) -> ImageTask {
        let request = self.inner.normalize(request);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task_inner = TaskInner::new(request.clone(), Some(events_tx));
        let task = ImageTask::new(Arc::clone(&task_inner), events_rx);

        if self.inner.invalidated.load(Ordering::SeqCst) {
            task_inner.complete(Err(PipelineError::PipelineInvalidated));
            return task;
        }
        self.inner.stats.tasks_created.fetch_add(1, Ordering::Relaxed);
        self.inner
            .register_task(task_inner.id(), RegisteredTask::Image(Arc::downgrade(&task_inner)), &task_inner);
        task_inner.emit_event(TaskEvent::Created);

        // Synchronous memory-cache path.
        if request.options.memory_reads_enabled() {
            if let Some(container) = self.inner.config.image_cache.get(&memory_key(&request)) {
                if container.is_preview {
                    // A stored preview is delivered immediately while the
                    // load continues towards the final image.
                    task_inner.emit_event(TaskEvent::Preview(container));
                } else {
                    self.inner.stats.memory_hits.fetch_add(1, Ordering::Relaxed);
                    let response = ImageResponse {
                        container,
                        request: request.clone(),
                        response: None,
                        cache_source: CacheSource::Memory,
                    };
                    task_inner.emit_event(TaskEvent::Completed(Ok(response.clone())));
                    task_inner.complete(Ok(response));
                    return task;
                }
            }
        }

        let sink: JobSink<StageImage> = {
            let task_inner = Arc::clone(&task_inner);
            let request = request.clone();
            Arc::new(move |event| match event {
                JobEvent::Progress(progress) => task_inner.deliver_progress(*progress),
                JobEvent::Value { value, is_final } => {
                    if *is_final {
                        let response = ImageResponse {
                            container: value.container.clone(),
                            request: request.clone(),
                            response: value.response.clone(),
                            cache_source: value.source,
                        };
                        task_inner.emit_event(TaskEvent::Completed(Ok(response.clone())));
                        task_inner.complete(Ok(response));
                    } else {
                        task_inner.emit_event(TaskEvent::Preview(value.container.clone()));
                    }
                }
                JobEvent::Error(error) => {
                    task_inner.emit_event(TaskEvent::Completed(Err(error.clone())));
                    task_inner.complete(Err(error.clone()));
                }
            })
        };

        let subscription = self.inner.subscribe_load(&request, request.priority, sink);
        task_inner.attach_subscription(subscription);
        task
    }

    /// Load raw original bytes (no decoding, no processing) and await them.
    ///
    /// # Errors
    ///
    /// Any [`PipelineError`] the load ends in.
    pub async fn data(&self, request: ImageRequest) -> Result<DataTaskResult, PipelineError> {
        self.data_task(request).response().await
    }

    /// Start a raw-data load and return its task handle.
    pub fn data_task(&self, request: ImageRequest) -> DataTask {
        let task_inner = TaskInner::new(request.clone(), None);
        let task = DataTask {
            inner: Arc::clone(&task_inner),
        };
        if self.inner.invalidated.load(Ordering::SeqCst) {
            task_inner.complete(Err(PipelineError::PipelineInvalidated));
            return task;
        }
        self.inner.stats.tasks_created.fetch_add(1, Ordering::Relaxed);
        self.inner
            .register_task(task_inner.id(), RegisteredTask::Data(Arc::downgrade(&task_inner)), &task_inner);

        let sink: JobSink<FetchOutput> = {
            let task_inner = Arc::clone(&task_inner);
            Arc::new(move |event| match event {
                JobEvent::Progress(progress) => task_inner.deliver_progress(*progress),
                JobEvent::Value { value, is_final } => {
                    if *is_final {
                        task_inner.complete(Ok(DataTaskResult {
                            data: value.data.clone(),
                            response: value.response.clone(),
                        }));
                    }
                }
                JobEvent::Error(error) => task_inner.complete(Err(error.clone())),
            })
        };
        let subscription = self.inner.subscribe_fetch(&request, request.priority, sink);
        task_inner.attach_subscription(subscription);
        task
    }

    /// Stop accepting new tasks and cancel all in-flight ones.
    pub fn invalidate(&self) {
        if self.inner.invalidated.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("pipeline invalidated");
        let registered: Vec<RegisteredTask> = {
            let mut drained = Vec::new();
            self.inner.tasks.retain(|_, task| {
                drained.push(match task {
                    RegisteredTask::Image(weak) => RegisteredTask::Image(weak.clone()),
                    RegisteredTask::Data(weak) => RegisteredTask::Data(weak.clone()),
                });
                false
            });
            drained
        };
        for task in registered {
            task.cancel();
        }
    }
}

impl PipelineInner {
    /// Apply configuration-level request defaults.
    fn normalize(&self, mut request: ImageRequest) -> ImageRequest {
        if request.processors.is_empty() && !self.config.processors.is_empty() {
            request.processors = self.config.processors.clone();
        }
        request
    }

    fn register_task<T: Clone + Send + Sync + 'static>(
        &self,
        id: Uuid,
        registered: RegisteredTask,
        task: &Arc<TaskInner<T>>,
    ) {
        self.tasks.insert(id, registered);
        let tasks = Arc::clone(&self.tasks);
        task.set_cleanup(Box::new(move || {
            tasks.remove(&id);
        }));
    }

    fn skip_decompression(&self, request: &ImageRequest) -> bool {
        request.options.contains(RequestOptions::SKIP_DECOMPRESSION)
            || !self.config.is_decompression_enabled
    }

    // ===== Load stage (per full process key) =====

    fn subscribe_load(
        self: &Arc<Self>,
        request: &ImageRequest,
        priority: Priority,
        sink: JobSink<StageImage>,
    ) -> JobSubscription {
        let key = format!("load\u{1f}{}", process_key(request, request.processors.len()));
        let inner = Arc::clone(self);
        let request = request.clone();
        let starter: Starter<StageImage> =
            Box::new(move |job| inner.start_load_job(&request, &job));
        let (subscription, _) = self.load_jobs.subscribe_or_create(
            &key,
            self.config.is_task_coalescing_enabled,
            priority,
            sink,
            starter,
        );
        subscription
    }

    fn start_load_job(self: &Arc<Self>, request: &ImageRequest, job: &Job<StageImage>) {
        let reads_processed_from_disk = self.config.data_cache.is_some()
            && matches!(request.source, ImageSource::Url { .. })
            && request.options.disk_reads_enabled()
            && stores_encoded(self.config.data_cache_policy, request)
            && !request.processors.is_empty();
        if !reads_processed_from_disk {
            self.attach_chain(request, job);
            return;
        }

        let inner = Arc::clone(self);
        let request = request.clone();
        let job_handle = job.clone();
        let work = async move {
            let token = job_handle.cancellation();
            if token.is_cancelled() {
                return;
            }
            let Some(cache) = inner.config.data_cache.clone() else {
                return;
            };
            let key = disk_key(&request, DiskCacheVariant::Processed);
            if let Some(data) = cache.get(&key).await {
                debug!(key = %key, "serving processed image data from disk");
                inner.enqueue_stage_decode(&request, &job_handle, data, CacheSource::Disk);
            } else {
                inner.attach_chain(&request, &job_handle);
            }
        };
        job.add_work_item(
            self.config
                .data_caching_queue
                .enqueue(job.priority(), work.boxed()),
        );
    }

    /// Subscribe the load job to its processing chain, starting from the
    /// deepest intermediate container the memory cache still holds.
    fn attach_chain(self: &Arc<Self>, request: &ImageRequest, job: &Job<StageImage>) {
        let count = request.processors.len();
        let mut base = None;
        if request.options.memory_reads_enabled() {
            // Fewest remaining processors first, down to the bare decoded
            // container (zero processors applied).
            for applied in (0..count).rev() {
                if let Some(container) =
                    self.config.image_cache.get(&memory_key_prefix(request, applied))
                {
                    if !container.is_preview {
                        debug!(applied, "process chain resumes from cached intermediate");
                        base = Some((applied, container));
                        break;
                    }
                }
            }
        }

        let sink: JobSink<StageImage> = {
            let inner = Arc::clone(self);
            let request = request.clone();
            let job = job.clone();
            Arc::new(move |event| match event {
                JobEvent::Progress(progress) => job.publish_progress(*progress),
                JobEvent::Error(error) => job.publish_error(error.clone()),
                JobEvent::Value { value, is_final } => {
                    if *is_final {
                        inner.finish_load(&request, &job, value);
                    } else {
                        if inner.config.is_storing_previews_in_memory_cache
                            && request.options.memory_writes_enabled()
                        {
                            inner
                                .config
                                .image_cache
                                .put(memory_key(&request), value.container.clone());
                        }
                        job.publish_value(value.clone(), false);
                    }
                }
            })
        };
        let subscription = self.subscribe_process(request, count, base, job.priority(), sink);
        job.add_dependency(subscription);
    }

    /// Final-image bookkeeping: memory write, encoded disk write, publish.
    fn finish_load(self: &Arc<Self>, request: &ImageRequest, job: &Job<StageImage>, value: &StageImage) {
        if request.options.memory_writes_enabled() && !value.container.is_preview {
            self.config
                .image_cache
                .put(memory_key(request), value.container.clone());
        }

        let store_encoded = value.source != CacheSource::Disk
            && !request.source.is_local()
            && request.options.disk_writes_enabled()
            && stores_encoded(self.config.data_cache_policy, request);
        if store_encoded {
            if let Some(cache) = self.config.data_cache.clone() {
                let context = EncodeContext {
                    request: request.clone(),
                };
                if let Some(encoder) = (self.config.make_image_encoder)(&context) {
                    let container = value.container.clone();
                    let key = disk_key(request, DiskCacheVariant::Processed);
                    let work = async move {
                        if let Some(encoded) = encoder.encode(&container, &context) {
                            cache.put(&key, encoded).await;
                        }
                    };
                    // Deliberately not registered on the job: the write is a
                    // side effect that must survive the job's disposal.
                    let _ = self
                        .config
                        .image_encoding_queue
                        .enqueue(job.priority(), work.boxed());
                }
            }
        }
        job.publish_value(value.clone(), true);
    }

    /// Decode already-processed bytes read from disk, bypassing the chain.
    fn enqueue_stage_decode(
        self: &Arc<Self>,
        request: &ImageRequest,
        job: &Job<StageImage>,
        data: Bytes,
        source: CacheSource,
    ) {
        let inner = Arc::clone(self);
        let request = request.clone();
        let job_handle = job.clone();
        let work = async move {
            let token = job_handle.cancellation();
            if token.is_cancelled() {
                return;
            }
            let context = DecodeContext {
                request: request.clone(),
                is_completed: true,
                cache_source: source,
                skip_decompression: inner.skip_decompression(&request),
            };
            let Some(decoder) = (inner.config.make_image_decoder)(&context, &data) else {
                job_handle.publish_error(PipelineError::DecoderNotRegistered {
                    image_id: request.image_id().to_owned(),
                });
                return;
            };
            match decoder.decode(&data, &context) {
                Ok(mut container) => {
                    container.is_preview = false;
                    job_handle.publish_value(
                        StageImage {
                            container,
                            response: None,
                            source,
                        },
                        true,
                    );
                }
                Err(error) => {
                    job_handle.publish_error(PipelineError::decoding(decoder.name(), Some(error)));
                }
            }
        };
        job.add_work_item(
            self.config
                .image_decoding_queue
                .enqueue(job.priority(), work.boxed()),
        );
    }

    // ===== Process stage (one job per applied-processor prefix) =====

    fn subscribe_process(
        self: &Arc<Self>,
        request: &ImageRequest,
        count: usize,
        base: Option<(usize, ImageContainer)>,
        priority: Priority,
        sink: JobSink<StageImage>,
    ) -> JobSubscription {
        if let Some((base_count, container)) = &base {
            if *base_count == count {
                return Self::subscribe_cached_base(request, count, container.clone(), priority, sink);
            }
        }
        if count == 0 {
            return self.subscribe_decode(request, priority, sink);
        }
        let Some(processor) = request.processors.get(count - 1).cloned() else {
            return self.subscribe_decode(request, priority, sink);
        };

        let key = process_key(request, count);
        let inner = Arc::clone(self);
        let request_owned = request.clone();
        let starter: Starter<StageImage> = Box::new(move |job: Job<StageImage>| {
            let upstream_sink: JobSink<StageImage> = {
                let inner = Arc::clone(&inner);
                let request = request_owned.clone();
                let job = job.clone();
                Arc::new(move |event| match event {
                    JobEvent::Progress(progress) => job.publish_progress(*progress),
                    JobEvent::Error(error) => job.publish_error(error.clone()),
                    JobEvent::Value { value, is_final } => {
                        inner.enqueue_process(
                            &request,
                            &job,
                            Arc::clone(&processor),
                            count,
                            value.clone(),
                            *is_final,
                        );
                    }
                })
            };
            let subscription =
                inner.subscribe_process(&request_owned, count - 1, base, job.priority(), upstream_sink);
            job.add_dependency(subscription);
        });
        let (subscription, _) = self.process_jobs.subscribe_or_create(
            &key,
            self.config.is_task_coalescing_enabled,
            priority,
            sink,
            starter,
        );
        subscription
    }

    /// A private job that replays a memory-cached intermediate container as
    /// its terminal value, serving as the base of a shortened chain.
    fn subscribe_cached_base(
        request: &ImageRequest,
        count: usize,
        container: ImageContainer,
        priority: Priority,
        sink: JobSink<StageImage>,
    ) -> JobSubscription {
        let value = StageImage {
            container,
            response: None,
            source: CacheSource::Memory,
        };
        let starter: Starter<StageImage> = Box::new(move |job: Job<StageImage>| {
            job.publish_value(value, true);
        });
        let job = Job::new(
            format!("{}\u{1f}cached", process_key(request, count)),
            starter,
            None,
        );
        job.subscribe(priority, sink)
            .unwrap_or_else(|| unreachable!("fresh job cannot be disposed"))
    }

    fn enqueue_process(
        self: &Arc<Self>,
        request: &ImageRequest,
        job: &Job<StageImage>,
        processor: Arc<dyn ImageProcessing>,
        count: usize,
        value: StageImage,
        is_final: bool,
    ) {
        let inner = Arc::clone(self);
        let job_handle = job.clone();
        let request = request.clone();
        let work = async move {
            let token = job_handle.cancellation();
            if token.is_cancelled() {
                return;
            }
            let is_preview = value.container.is_preview;
            let context = ProcessContext {
                request: request.clone(),
                is_preview,
            };
            match processor.process(value.container, &context) {
                Ok(mut container) => {
                    container.is_preview = is_preview;
                    // Intermediate containers are cached so later requests
                    // can resume the chain partway; the fully processed
                    // image is written by the load stage.
                    if is_final
                        && !is_preview
                        && count < request.processors.len()
                        && request.options.memory_writes_enabled()
                    {
                        inner
                            .config
                            .image_cache
                            .put(memory_key_prefix(&request, count), container.clone());
                    }
                    job_handle.publish_value(
                        StageImage {
                            container,
                            response: value.response,
                            source: value.source,
                        },
                        is_final,
                    );
                }
                Err(error) => {
                    if is_final {
                        job_handle.publish_error(PipelineError::processing(
                            &processor.identifier(),
                            Some(error),
                        ));
                    }
                    // A failed preview is dropped; the final image decides.
                }
            }
        };
        job.add_work_item(
            self.config
                .image_processing_queue
                .enqueue(job.priority(), work.boxed()),
        );
    }

    // ===== Decode stage =====

    fn subscribe_decode(
        self: &Arc<Self>,
        request: &ImageRequest,
        priority: Priority,
        sink: JobSink<StageImage>,
    ) -> JobSubscription {
        let key = decode_key(request);
        let inner = Arc::clone(self);
        let request = request.clone();
        let starter: Starter<StageImage> =
            Box::new(move |job| inner.start_decode_job(&request, &job));
        let (subscription, _) = self.decode_jobs.subscribe_or_create(
            &key,
            self.config.is_task_coalescing_enabled,
            priority,
            sink,
            starter,
        );
        subscription
    }

    fn start_decode_job(self: &Arc<Self>, request: &ImageRequest, job: &Job<StageImage>) {
        let state = Arc::new(DecodeJobState::default());
        let progressive = self.config.is_progressive_decoding_enabled;

        let fetch_sink: JobSink<FetchOutput> = {
            let inner = Arc::clone(self);
            let request = request.clone();
            let job = job.clone();
            let state = Arc::clone(&state);
            Arc::new(move |event| match event {
                JobEvent::Progress(progress) => job.publish_progress(*progress),
                JobEvent::Error(error) => job.publish_error(error.clone()),
                JobEvent::Value { value, is_final: true } => {
                    // Outstanding partial decodes observe this flag and the
                    // cleared slot, and stand down.
                    state.final_started.store(true, Ordering::SeqCst);
                    state.latest_partial.lock().take();
                    inner.enqueue_final_decode(&request, &job, &state, value.clone());
                }
                JobEvent::Value { value, is_final: false } => {
                    if !progressive
                        || state.progressive_broken.load(Ordering::SeqCst)
                        || state.final_started.load(Ordering::SeqCst)
                    {
                        return;
                    }
                    // Latest-buffer slot: a newer accumulation overwrites an
                    // unconsumed one instead of queueing behind it.
                    *state.latest_partial.lock() = Some(value.clone());
                    if !state.partial_busy.swap(true, Ordering::SeqCst) {
                        inner.enqueue_partial_decode(&request, &job, Arc::clone(&state));
                    }
                }
            })
        };
        let subscription = self.subscribe_fetch(request, job.priority(), fetch_sink);
        job.add_dependency(subscription);
    }

    fn decoder_for(
        &self,
        state: &DecodeJobState,
        context: &DecodeContext,
        data: &Bytes,
    ) -> Option<Arc<dyn ImageDecoding>> {
        let mut slot = state.decoder.lock();
        if slot.is_none() {
            *slot = (self.config.make_image_decoder)(context, data);
        }
        slot.clone()
    }

    fn enqueue_final_decode(
        self: &Arc<Self>,
        request: &ImageRequest,
        job: &Job<StageImage>,
        state: &Arc<DecodeJobState>,
        value: FetchOutput,
    ) {
        let inner = Arc::clone(self);
        let request = request.clone();
        let job_handle = job.clone();
        let state = Arc::clone(state);
        let work = async move {
            let token = job_handle.cancellation();
            if token.is_cancelled() {
                return;
            }
            let context = DecodeContext {
                request: request.clone(),
                is_completed: true,
                cache_source: value.source,
                skip_decompression: inner.skip_decompression(&request),
            };
            let Some(decoder) = inner.decoder_for(&state, &context, &value.data) else {
                job_handle.publish_error(PipelineError::DecoderNotRegistered {
                    image_id: request.image_id().to_owned(),
                });
                return;
            };
            match decoder.decode(&value.data, &context) {
                Ok(mut container) => {
                    container.is_preview = false;
                    job_handle.publish_value(
                        StageImage {
                            container,
                            response: value.response,
                            source: value.source,
                        },
                        true,
                    );
                }
                Err(error) => {
                    job_handle.publish_error(PipelineError::decoding(decoder.name(), Some(error)));
                }
            }
        };
        job.add_work_item(
            self.config
                .image_decoding_queue
                .enqueue(job.priority(), work.boxed()),
        );
    }

    fn enqueue_partial_decode(
        self: &Arc<Self>,
        request: &ImageRequest,
        job: &Job<StageImage>,
        state: Arc<DecodeJobState>,
    ) {
        let inner = Arc::clone(self);
        let request = request.clone();
        let job_handle = job.clone();
        let work = async move {
            let token = job_handle.cancellation();
            loop {
                if token.is_cancelled() || state.final_started.load(Ordering::SeqCst) {
                    state.partial_busy.store(false, Ordering::SeqCst);
                    return;
                }
                let Some(buffered) = state.latest_partial.lock().take() else {
                    state.partial_busy.store(false, Ordering::SeqCst);
                    // Re-check for a buffer that arrived during hand-off.
                    if state.latest_partial.lock().is_some()
                        && !state.partial_busy.swap(true, Ordering::SeqCst)
                    {
                        continue;
                    }
                    return;
                };
                let context = DecodeContext {
                    request: request.clone(),
                    is_completed: false,
                    cache_source: CacheSource::Origin,
                    skip_decompression: inner.skip_decompression(&request),
                };
                let Some(decoder) = inner.decoder_for(&state, &context, &buffered.data) else {
                    continue;
                };
                if !decoder.is_progressive() {
                    state.progressive_broken.store(true, Ordering::SeqCst);
                    state.partial_busy.store(false, Ordering::SeqCst);
                    return;
                }
                if let Some(mut preview) = decoder.decode_partial(&buffered.data, &context) {
                    let scan = preview.scan_number();
                    let deliver = {
                        let mut last_scan = state.last_scan.lock();
                        match (scan, *last_scan) {
                            (Some(scan), Some(last)) if scan <= last => false,
                            (Some(scan), _) => {
                                *last_scan = Some(scan);
                                true
                            }
                            (None, _) => true,
                        }
                    };
                    if deliver {
                        preview.is_preview = true;
                        job_handle.publish_value(
                            StageImage {
                                container: preview,
                                response: buffered.response.clone(),
                                source: CacheSource::Origin,
                            },
                            false,
                        );
                    }
                }
            }
        };
        job.add_work_item(
            self.config
                .image_decoding_queue
                .enqueue(job.priority(), work.boxed()),
        );
    }

    // ===== Fetch stage =====

    fn subscribe_fetch(
        self: &Arc<Self>,
        request: &ImageRequest,
        priority: Priority,
        sink: JobSink<FetchOutput>,
    ) -> JobSubscription {
        let key = load_key(request);
        let inner = Arc::clone(self);
        let request_owned = request.clone();
        let starter: Starter<FetchOutput> =
            Box::new(move |job| inner.start_fetch_job(&request_owned, &job));
        let (subscription, created) = self.fetch_jobs.subscribe_or_create(
            &key,
            self.config.is_task_coalescing_enabled,
            priority,
            sink,
            starter,
        );
        if created {
            self.stats.fetch_jobs_created.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.coalesced_fetches.fetch_add(1, Ordering::Relaxed);
        }
        subscription
    }

    fn start_fetch_job(self: &Arc<Self>, request: &ImageRequest, job: &Job<FetchOutput>) {
        let is_url = matches!(request.source, ImageSource::Url { .. });
        let disk_readable = is_url
            && self.config.data_cache.is_some()
            && request.options.disk_reads_enabled();

        if disk_readable {
            let inner = Arc::clone(self);
            let request = request.clone();
            let job_handle = job.clone();
            let work = async move {
                let token = job_handle.cancellation();
                if token.is_cancelled() {
                    return;
                }
                let Some(cache) = inner.config.data_cache.clone() else {
                    return;
                };
                let key = disk_key(&request, DiskCacheVariant::Original);
                if let Some(data) = cache.get(&key).await {
                    if !data.is_empty() {
                        debug!(key = %key, "serving original image data from disk");
                        job_handle.publish_value(
                            FetchOutput {
                                data,
                                response: None,
                                source: CacheSource::Disk,
                            },
                            true,
                        );
                        return;
                    }
                }
                if request
                    .options
                    .contains(RequestOptions::RETURN_CACHE_DATA_DONT_LOAD)
                {
                    job_handle.publish_error(PipelineError::DataMissingInCache);
                    return;
                }
                let work = Self::origin_fetch_work(&inner, &request, &job_handle);
                job_handle.add_work_item(
                    inner
                        .config
                        .data_loading_queue
                        .enqueue(job_handle.priority(), work),
                );
            };
            job.add_work_item(
                self.config
                    .data_caching_queue
                    .enqueue(job.priority(), work.boxed()),
            );
            return;
        }

        if is_url
            && request
                .options
                .contains(RequestOptions::RETURN_CACHE_DATA_DONT_LOAD)
        {
            job.publish_error(PipelineError::DataMissingInCache);
            return;
        }

        let work = Self::origin_fetch_work(self, request, job);
        job.add_work_item(self.config.data_loading_queue.enqueue(job.priority(), work));
    }

    fn origin_fetch_work(
        inner: &Arc<Self>,
        request: &ImageRequest,
        job: &Job<FetchOutput>,
    ) -> futures_util::future::BoxFuture<'static, ()> {
        let inner = Arc::clone(inner);
        let request = request.clone();
        let job = job.clone();
        async move {
            let token = job.cancellation();
            if token.is_cancelled() {
                return;
            }
            match request.source.clone() {
                ImageSource::Data { data, .. } => {
                    if data.is_empty() {
                        job.publish_error(PipelineError::DataIsEmpty);
                    } else {
                        job.publish_value(
                            FetchOutput {
                                data,
                                response: None,
                                source: CacheSource::Origin,
                            },
                            true,
                        );
                    }
                }
                ImageSource::File(path) => {
                    tokio::select! {
                        () = token.cancelled() => {}
                        result = tokio::fs::read(&path) => match result {
                            Ok(bytes) if bytes.is_empty() => {
                                job.publish_error(PipelineError::DataIsEmpty);
                            }
                            Ok(bytes) => job.publish_value(
                                FetchOutput {
                                    data: Bytes::from(bytes),
                                    response: None,
                                    source: CacheSource::Origin,
                                },
                                true,
                            ),
                            Err(error) => {
                                job.publish_error(PipelineError::data_loading(error.into()));
                            }
                        }
                    }
                }
                ImageSource::Lazy { make, .. } => {
                    let producer = (make)();
                    tokio::select! {
                        () = token.cancelled() => {}
                        result = producer => match result {
                            Ok(bytes) if bytes.is_empty() => {
                                job.publish_error(PipelineError::DataIsEmpty);
                            }
                            Ok(bytes) => job.publish_value(
                                FetchOutput {
                                    data: bytes,
                                    response: None,
                                    source: CacheSource::Origin,
                                },
                                true,
                            ),
                            Err(error) => job.publish_error(PipelineError::data_loading(error)),
                        }
                    }
                }
                ImageSource::Url { url, headers } => {
                    inner.fetch_from_origin(&request, url, headers, &job).await;
                }
            }
        }
        .boxed()
    }

    async fn fetch_from_origin(
        self: Arc<Self>,
        request: &ImageRequest,
        url: String,
        headers: Vec<(String, String)>,
        job: &Job<FetchOutput>,
    ) {
        let token = job.cancellation();
        if self.config.is_rate_limiter_enabled {
            tokio::select! {
                () = token.cancelled() => return,
                () = self.rate_limiter.acquire() => {}
            }
        }

        let resumable = if self.config.is_resumable_data_enabled {
            ResumableDataStore::shared().take(&url)
        } else {
            None
        };
        let mut data_request = DataRequest {
            url: url.clone(),
            headers,
        };
        if let Some(resumable) = &resumable {
            debug!(url = %url, offset = resumable.data.len(), "attempting resumed download");
            apply_range_headers(&mut data_request, resumable);
        }

        struct Accumulation {
            buffer: Vec<u8>,
            response: Option<DataResponse>,
            resumed_offset: u64,
        }
        let accumulation = Arc::new(Mutex::new(Accumulation {
            buffer: Vec::new(),
            response: None,
            resumed_offset: 0,
        }));

        let progressive = self.config.is_progressive_decoding_enabled;
        let on_chunk = {
            let accumulation = Arc::clone(&accumulation);
            let job = job.clone();
            let resumable = resumable.clone();
            move |chunk: Bytes, response: &DataResponse| {
                let (progress, partial) = {
                    let mut accumulation = accumulation.lock();
                    if accumulation.response.is_none() {
                        accumulation.response = Some(response.clone());
                        if let Some(resumable) = &resumable {
                            if is_resumed_response(response) {
                                // 206: splice the stashed prefix back in.
                                accumulation.buffer.extend_from_slice(&resumable.data);
                                accumulation.resumed_offset = resumable.data.len() as u64;
                            }
                            // 200: full body follows, the stash is obsolete.
                        }
                    }
                    accumulation.buffer.extend_from_slice(&chunk);
                    let completed = accumulation.buffer.len() as u64;
                    let total = response
                        .expected_length
                        .map_or(0, |length| length + accumulation.resumed_offset);
                    let partial = if progressive {
                        Some(FetchOutput {
                            data: Bytes::copy_from_slice(&accumulation.buffer),
                            response: accumulation.response.clone(),
                            source: CacheSource::Origin,
                        })
                    } else {
                        None
                    };
                    (TaskProgress::new(completed, total), partial)
                };
                job.publish_progress(progress);
                if let Some(partial) = partial {
                    job.publish_value(partial, false);
                }
            }
        };

        let loader = Arc::clone(&self.config.data_loader);
        let result = tokio::select! {
            () = token.cancelled() => {
                // Interrupted mid-flight: keep what we have for resumption.
                let accumulation = accumulation.lock();
                if self.config.is_resumable_data_enabled {
                    ResumableDataStore::shared().stash(
                        &url,
                        accumulation.response.as_ref(),
                        &Bytes::copy_from_slice(&accumulation.buffer),
                    );
                }
                return;
            }
            result = loader.load_data(&data_request, &on_chunk) => result,
        };

        let (data, response) = {
            let mut accumulation = accumulation.lock();
            (
                Bytes::from(std::mem::take(&mut accumulation.buffer)),
                accumulation.response.clone(),
            )
        };

        match result {
            Err(error) => {
                if self.config.is_resumable_data_enabled {
                    ResumableDataStore::shared().stash(&url, response.as_ref(), &data);
                }
                job.publish_error(PipelineError::data_loading(error));
            }
            Ok(()) => {
                if let Some(response) = &response {
                    if !response.is_success() {
                        job.publish_error(PipelineError::data_loading(anyhow::anyhow!(
                            "unsuccessful HTTP status {}",
                            response.status_code.unwrap_or(0)
                        )));
                        return;
                    }
                }
                if data.is_empty() {
                    job.publish_error(PipelineError::DataIsEmpty);
                    return;
                }
                if stores_original(self.config.data_cache_policy, request)
                    && request.options.disk_writes_enabled()
                {
                    if let Some(cache) = &self.config.data_cache {
                        cache
                            .put(&disk_key(request, DiskCacheVariant::Original), data.clone())
                            .await;
                    }
                }
                job.publish_value(
                    FetchOutput {
                        data,
                        response,
                        source: CacheSource::Origin,
                    },
                    true,
                );
            }
        }
    }
}

fn stores_original(policy: DataCachePolicy, request: &ImageRequest) -> bool {
    match policy {
        DataCachePolicy::StoreOriginalData | DataCachePolicy::StoreAll => true,
        DataCachePolicy::Automatic => request.processors.is_empty(),
        DataCachePolicy::StoreEncodedImages => false,
    }
}

fn stores_encoded(policy: DataCachePolicy, request: &ImageRequest) -> bool {
    match policy {
        DataCachePolicy::StoreEncodedImages | DataCachePolicy::StoreAll => true,
        DataCachePolicy::Automatic => !request.processors.is_empty(),
        DataCachePolicy::StoreOriginalData => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::NoopProcessor;

    #[test]
    fn policy_matrix_for_requests_without_processors() {
        let request = ImageRequest::url("https://example.com/a.jpg");
        assert!(stores_original(DataCachePolicy::Automatic, &request));
        assert!(!stores_encoded(DataCachePolicy::Automatic, &request));
        assert!(stores_original(DataCachePolicy::StoreAll, &request));
        assert!(stores_encoded(DataCachePolicy::StoreAll, &request));
        assert!(!stores_original(DataCachePolicy::StoreEncodedImages, &request));
    }

    #[test]
    fn policy_matrix_for_requests_with_processors() {
        let request = ImageRequest::url("https://example.com/a.jpg")
            .with_processors(vec![Arc::new(NoopProcessor::new("P1")) as _]);
        assert!(!stores_original(DataCachePolicy::Automatic, &request));
        assert!(stores_encoded(DataCachePolicy::Automatic, &request));
        assert!(stores_original(DataCachePolicy::StoreOriginalData, &request));
        assert!(!stores_encoded(DataCachePolicy::StoreOriginalData, &request));
    }
}
