//! Shared infrastructure for integration tests: scriptable collaborator
//! mocks, pipeline constructors, and small wait helpers.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;

use pixelpipe::async_trait;
use pixelpipe::traits::{
    DataLoading, DataRequest, DecodeContext, EncodeContext, ImageDecoding, ImageEncoding,
    ImageProcessing, ProcessContext,
};
use pixelpipe::{
    DataResponse, ImageContainer, ImagePipeline, PipelineConfiguration, PlatformImage,
    SCAN_NUMBER_KEY,
};

/// Initialize test logging once; respects `RUST_LOG`.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Unique test URL to keep process-wide state (resumable store) isolated.
pub fn test_url(name: &str) -> String {
    format!("https://example.com/{}_{}.jpg", name, rand::random::<u32>())
}

/// Bytes with a JPEG magic so the default sniffing decoder accepts them.
pub fn jpeg_bytes(len: usize) -> Bytes {
    let mut data = vec![0u8; len.max(2)];
    data[0] = 0xFF;
    data[1] = 0xD8;
    Bytes::from(data)
}

/// One scripted `load_data` run: chunks, the response delivered with each
/// chunk, the final result, and an optional pacing delay between chunks.
#[derive(Clone)]
pub struct LoadScript {
    pub chunks: Vec<Bytes>,
    pub response: DataResponse,
    pub error: Option<String>,
    pub chunk_delay: Duration,
}

impl LoadScript {
    pub fn ok(chunks: Vec<Bytes>) -> Self {
        Self {
            chunks,
            response: DataResponse::default(),
            error: None,
            chunk_delay: Duration::ZERO,
        }
    }

    pub fn with_response(mut self, response: DataResponse) -> Self {
        self.response = response;
        self
    }

    pub fn with_error(mut self, message: &str) -> Self {
        self.error = Some(message.to_owned());
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }
}

/// Scriptable data loader: per-URL script queues, suspension, invocation
/// counting, and request recording for range-header inspection.
pub struct MockDataLoader {
    scripts: Mutex<HashMap<String, VecDeque<LoadScript>>>,
    default_script: Mutex<Option<LoadScript>>,
    created_task_count: AtomicUsize,
    request_order: Mutex<Vec<String>>,
    last_request: Mutex<Option<DataRequest>>,
    suspended_tx: watch::Sender<bool>,
}

impl MockDataLoader {
    pub fn new() -> Arc<Self> {
        let (suspended_tx, _) = watch::channel(false);
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            default_script: Mutex::new(None),
            created_task_count: AtomicUsize::new(0),
            request_order: Mutex::new(Vec::new()),
            last_request: Mutex::new(None),
            suspended_tx,
        })
    }

    /// Queue a script for one `load_data` call against `url`.
    pub fn script(&self, url: &str, script: LoadScript) {
        self.scripts
            .lock()
            .entry(url.to_owned())
            .or_default()
            .push_back(script);
    }

    /// Script used when no per-URL script is queued.
    pub fn script_default(&self, script: LoadScript) {
        *self.default_script.lock() = Some(script);
    }

    pub fn suspend(&self) {
        let _ = self.suspended_tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.suspended_tx.send(false);
    }

    pub fn created_task_count(&self) -> usize {
        self.created_task_count.load(Ordering::SeqCst)
    }

    /// URLs in the order `load_data` was invoked.
    pub fn request_order(&self) -> Vec<String> {
        self.request_order.lock().clone()
    }

    pub fn last_request(&self) -> Option<DataRequest> {
        self.last_request.lock().clone()
    }
}

#[async_trait]
impl DataLoading for MockDataLoader {
    async fn load_data(
        &self,
        request: &DataRequest,
        on_chunk: &(dyn for<'a> Fn(Bytes, &'a DataResponse) + Send + Sync),
    ) -> anyhow::Result<()> {
        self.created_task_count.fetch_add(1, Ordering::SeqCst);
        self.request_order.lock().push(request.url.clone());
        *self.last_request.lock() = Some(request.clone());

        let mut suspended = self.suspended_tx.subscribe();
        while *suspended.borrow() {
            suspended
                .changed()
                .await
                .map_err(|_| anyhow::anyhow!("loader gate closed"))?;
        }

        let script = {
            let mut scripts = self.scripts.lock();
            scripts
                .get_mut(&request.url)
                .and_then(VecDeque::pop_front)
                .or_else(|| self.default_script.lock().clone())
        };
        let Some(script) = script else {
            anyhow::bail!("no script for {}", request.url);
        };

        for chunk in &script.chunks {
            on_chunk(chunk.clone(), &script.response);
            if script.chunk_delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(script.chunk_delay).await;
            }
        }
        match script.error {
            Some(message) => anyhow::bail!(message),
            None => Ok(()),
        }
    }
}

/// Deterministic processor appending its identifier to the pixel payload.
pub struct MockProcessor {
    identifier: String,
    calls: AtomicUsize,
}

impl MockProcessor {
    pub fn new(identifier: &str) -> Arc<Self> {
        Arc::new(Self {
            identifier: identifier.to_owned(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ImageProcessing for MockProcessor {
    fn identifier(&self) -> String {
        self.identifier.clone()
    }

    fn process(
        &self,
        mut container: ImageContainer,
        _context: &ProcessContext,
    ) -> anyhow::Result<ImageContainer> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut pixels = container.image.pixels.to_vec();
        pixels.extend_from_slice(self.identifier.as_bytes());
        container.image.pixels = Bytes::from(pixels);
        container
            .user_info
            .insert(self.identifier.clone(), serde_json::Value::Bool(true));
        Ok(container)
    }
}

/// Encoder returning the pixel payload and counting invocations.
pub struct MockEncoder {
    calls: AtomicUsize,
}

impl MockEncoder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ImageEncoding for MockEncoder {
    fn encode(&self, container: &ImageContainer, _context: &EncodeContext) -> Option<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Some(container.image.pixels.clone())
    }
}

/// Progressive decoder emitting a preview for each byte-length threshold.
pub struct ProgressiveDecoder {
    /// (minimum buffer length, scan number), ascending.
    pub scans: Vec<(usize, u64)>,
}

impl ImageDecoding for ProgressiveDecoder {
    fn name(&self) -> &'static str {
        "progressive-mock"
    }

    fn is_progressive(&self) -> bool {
        true
    }

    fn decode(&self, data: &Bytes, _context: &DecodeContext) -> anyhow::Result<ImageContainer> {
        let mut container = ImageContainer::new(PlatformImage::new(0, 0, data.clone()));
        container.data = Some(data.clone());
        Ok(container)
    }

    fn decode_partial(&self, data: &Bytes, _context: &DecodeContext) -> Option<ImageContainer> {
        let scan = self
            .scans
            .iter()
            .filter(|(min_len, _)| data.len() >= *min_len)
            .map(|(_, scan)| *scan)
            .max()?;
        let mut container = ImageContainer::new(PlatformImage::new(0, 0, data.clone()));
        container.is_preview = true;
        container
            .user_info
            .insert(SCAN_NUMBER_KEY.to_owned(), serde_json::Value::from(scan));
        Some(container)
    }
}

/// Pipeline over a fresh mock loader with the rate limiter off for
/// determinism; tests flip the options they exercise.
pub fn test_pipeline() -> (ImagePipeline, Arc<MockDataLoader>) {
    init_tracing();
    let loader = MockDataLoader::new();
    let config = PipelineConfiguration::new(Arc::clone(&loader) as _).with_rate_limiter(false);
    (ImagePipeline::new(config), loader)
}

pub fn test_config() -> (PipelineConfiguration, Arc<MockDataLoader>) {
    init_tracing();
    let loader = MockDataLoader::new();
    let config = PipelineConfiguration::new(Arc::clone(&loader) as _).with_rate_limiter(false);
    (config, loader)
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Async variant of [`wait_until`].
pub async fn wait_until_async<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
