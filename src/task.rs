//! Task handles
//!
//! An [`ImageTask`] (or [`DataTask`]) is the caller's view of one in-flight
//! request: an async getter for the final value, a progress watch, an event
//! stream, a mutable priority, and cancellation. Handles are cheap values
//! over shared state; the pipeline keeps its own reference until the task
//! reaches a terminal state.
//!
//! Once a task is cancelled or completed, no further deliveries occur.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::container::{DataResponse, ImageContainer, ImageResponse};
use crate::error::PipelineError;
use crate::job::JobSubscription;
use crate::request::{ImageRequest, Priority};

/// Byte progress of a task. `total == 0` means the total is unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskProgress {
    pub completed: u64,
    pub total: u64,
}

impl TaskProgress {
    #[must_use]
    pub fn new(completed: u64, total: u64) -> Self {
        Self { completed, total }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Cancelled,
    Completed,
}

/// Events observable on an [`ImageTask`] event stream, emitted in publish
/// order.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// The task was created and subscribed to the pipeline.
    Created,
    Progress(TaskProgress),
    /// A progressive preview; the final image always follows (or an error).
    Preview(ImageContainer),
    Cancelled,
    Completed(Result<ImageResponse, PipelineError>),
}

pub(crate) struct TaskInner<T: Clone> {
    id: Uuid,
    request: ImageRequest,
    state: Mutex<TaskState>,
    priority: Mutex<Priority>,
    subscription: Mutex<Option<JobSubscription>>,
    progress_tx: watch::Sender<TaskProgress>,
    result_tx: watch::Sender<Option<Result<T, PipelineError>>>,
    result_rx: watch::Receiver<Option<Result<T, PipelineError>>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<TaskEvent>>>,
    /// Runs once when the task reaches a terminal state (unregisters the
    /// task from the pipeline).
    cleanup: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl<T: Clone + Send + Sync + 'static> TaskInner<T> {
    pub(crate) fn new(
        request: ImageRequest,
        events_tx: Option<mpsc::UnboundedSender<TaskEvent>>,
    ) -> Arc<Self> {
        let (progress_tx, _) = watch::channel(TaskProgress::default());
        let (result_tx, result_rx) = watch::channel(None);
        Arc::new(Self {
            id: Uuid::new_v4(),
            priority: Mutex::new(request.priority),
            request,
            state: Mutex::new(TaskState::Running),
            subscription: Mutex::new(None),
            progress_tx,
            result_tx,
            result_rx,
            events_tx: Mutex::new(events_tx),
            cleanup: Mutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn request(&self) -> &ImageRequest {
        &self.request
    }

    pub(crate) fn state(&self) -> TaskState {
        *self.state.lock()
    }

    pub(crate) fn attach_subscription(&self, subscription: JobSubscription) {
        if self.state() == TaskState::Running {
            *self.subscription.lock() = Some(subscription);
        }
        // Attaching after cancellation drops the subscription immediately,
        // releasing the job.
    }

    pub(crate) fn set_cleanup(&self, cleanup: Box<dyn FnOnce() + Send>) {
        *self.cleanup.lock() = Some(cleanup);
    }

    pub(crate) fn emit_event(&self, event: TaskEvent) {
        if self.state() != TaskState::Running {
            return;
        }
        if let Some(tx) = self.events_tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Record progress, enforcing monotonicity per task view.
    pub(crate) fn deliver_progress(&self, progress: TaskProgress) {
        if self.state() != TaskState::Running {
            return;
        }
        let mut next = progress;
        let changed = self.progress_tx.send_if_modified(|current| {
            if next.completed < current.completed {
                next.completed = current.completed;
            }
            if next == *current {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            self.emit_event(TaskEvent::Progress(next));
        }
    }

    pub(crate) fn complete(&self, result: Result<T, PipelineError>) {
        {
            let mut state = self.state.lock();
            if *state != TaskState::Running {
                return;
            }
            *state = TaskState::Completed;
        }
        self.result_tx.send_replace(Some(result));
        self.events_tx.lock().take();
        self.subscription.lock().take();
        self.run_cleanup();
    }

    pub(crate) fn cancel(&self) {
        let subscription = {
            let mut state = self.state.lock();
            if *state != TaskState::Running {
                return;
            }
            *state = TaskState::Cancelled;
            self.subscription.lock().take()
        };
        // Emit before closing the stream; the state is already Cancelled so
        // emit_event would drop it.
        if let Some(tx) = self.events_tx.lock().take() {
            let _ = tx.send(TaskEvent::Cancelled);
        }
        self.result_tx.send_replace(Some(Err(PipelineError::Cancelled)));
        drop(subscription);
        self.run_cleanup();
    }

    pub(crate) fn set_priority(&self, priority: Priority) {
        *self.priority.lock() = priority;
        if let Some(subscription) = self.subscription.lock().as_ref() {
            subscription.set_priority(priority);
        }
    }

    pub(crate) fn priority(&self) -> Priority {
        *self.priority.lock()
    }

    pub(crate) fn progress(&self) -> TaskProgress {
        *self.progress_tx.borrow()
    }

    pub(crate) fn progress_updates(&self) -> watch::Receiver<TaskProgress> {
        self.progress_tx.subscribe()
    }

    pub(crate) async fn response(&self) -> Result<T, PipelineError> {
        let mut rx = self.result_rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone().unwrap_or(Err(PipelineError::Cancelled)),
            Err(_) => Err(PipelineError::Cancelled),
        }
    }

    fn run_cleanup(&self) {
        if let Some(cleanup) = self.cleanup.lock().take() {
            cleanup();
        }
    }
}

/// Handle to an in-flight image load.
pub struct ImageTask {
    pub(crate) inner: Arc<TaskInner<ImageResponse>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<TaskEvent>>>,
}

impl ImageTask {
    pub(crate) fn new(
        inner: Arc<TaskInner<ImageResponse>>,
        events: mpsc::UnboundedReceiver<TaskEvent>,
    ) -> Self {
        Self {
            inner,
            events: Mutex::new(Some(events)),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id()
    }

    #[must_use]
    pub fn request(&self) -> &ImageRequest {
        self.inner.request()
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        self.inner.state()
    }

    /// Await the final response.
    ///
    /// # Errors
    ///
    /// The task's terminal error; [`PipelineError::Cancelled`] when the
    /// task was cancelled.
    pub async fn response(&self) -> Result<ImageResponse, PipelineError> {
        self.inner.response().await
    }

    /// Latest observed progress.
    #[must_use]
    pub fn progress(&self) -> TaskProgress {
        self.inner.progress()
    }

    /// Watch receiver for progress updates.
    #[must_use]
    pub fn progress_updates(&self) -> watch::Receiver<TaskProgress> {
        self.inner.progress_updates()
    }

    /// Take the event stream. Yields `None` after the first call.
    #[must_use]
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<TaskEvent>> {
        self.events.lock().take()
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        self.inner.priority()
    }

    /// Change the task's priority; the change propagates through the
    /// dependency chain.
    pub fn set_priority(&self, priority: Priority) {
        self.inner.set_priority(priority);
    }

    /// Cancel the task. Idempotent; no deliveries occur afterwards.
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

/// Final value of a [`DataTask`]: the raw bytes plus transport metadata.
#[derive(Debug, Clone)]
pub struct DataTaskResult {
    pub data: Bytes,
    pub response: Option<DataResponse>,
}

/// Handle to an in-flight raw-data load (no decoding, no processing).
pub struct DataTask {
    pub(crate) inner: Arc<TaskInner<DataTaskResult>>,
}

impl DataTask {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id()
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        self.inner.state()
    }

    /// Await the loaded bytes.
    ///
    /// # Errors
    ///
    /// The task's terminal error; [`PipelineError::Cancelled`] when the
    /// task was cancelled.
    pub async fn response(&self) -> Result<DataTaskResult, PipelineError> {
        self.inner.response().await
    }

    #[must_use]
    pub fn progress(&self) -> TaskProgress {
        self.inner.progress()
    }

    pub fn set_priority(&self, priority: Priority) {
        self.inner.set_priority(priority);
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ImageRequest {
        ImageRequest::url("https://example.com/a.jpg")
    }

    #[tokio::test]
    async fn progress_is_monotone() {
        let inner = TaskInner::<DataTaskResult>::new(request(), None);
        inner.deliver_progress(TaskProgress::new(10, 100));
        inner.deliver_progress(TaskProgress::new(5, 100));
        assert_eq!(inner.progress(), TaskProgress::new(10, 100));
        inner.deliver_progress(TaskProgress::new(60, 100));
        assert_eq!(inner.progress(), TaskProgress::new(60, 100));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_terminal() {
        let inner = TaskInner::<DataTaskResult>::new(request(), None);
        inner.cancel();
        inner.cancel();
        assert_eq!(inner.state(), TaskState::Cancelled);
        let result = inner.response().await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));

        // Deliveries after cancellation are dropped.
        inner.deliver_progress(TaskProgress::new(1, 2));
        assert_eq!(inner.progress(), TaskProgress::default());
    }

    #[tokio::test]
    async fn complete_wins_over_later_cancel() {
        let inner = TaskInner::<DataTaskResult>::new(request(), None);
        inner.complete(Ok(DataTaskResult {
            data: Bytes::from_static(b"abc"),
            response: None,
        }));
        inner.cancel();
        assert_eq!(inner.state(), TaskState::Completed);
        let result = inner.response().await;
        assert_eq!(result.unwrap().data, Bytes::from_static(b"abc"));
    }
}
