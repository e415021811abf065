//! Coalescing subscription jobs
//!
//! A [`Job`] is a lazily started computation producing a stream of values
//! that ends in exactly one terminal event (a final value or an error). Any
//! number of subscribers may attach before or while it runs; each receives
//! every event published from its subscription onward plus the terminal
//! event exactly once. Jobs with equal keys are shared through a
//! [`JobRegistry`], which is how equivalent fetch/decode/process work
//! collapses across concurrent requests.
//!
//! Lifecycle: `pending` → (first subscribe) `running` → (terminal event or
//! last unsubscribe) `disposed`. A disposed job cancels its work, drops its
//! upstream subscriptions, and unregisters itself; there is no way out of
//! `disposed`.
//!
//! # Locking
//!
//! Each job has a short-lived state lock and a delivery lock. The state
//! lock never wraps foreign code (sinks, starters, upstream handles). The
//! delivery lock serializes publishers so each subscriber observes events
//! in publish order; sinks run under it, and since sinks only ever call
//! *downstream* (the dependency chain is acyclic), delivery locks nest in
//! one direction only.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::PipelineError;
use crate::queue::WorkItemHandle;
use crate::request::Priority;
use crate::task::TaskProgress;

/// Event published by a job to its subscribers.
#[derive(Debug, Clone)]
pub(crate) enum JobEvent<V> {
    Value { value: V, is_final: bool },
    Progress(TaskProgress),
    Error(PipelineError),
}

/// Subscriber callback. Must not block; it runs on the publisher's call
/// stack under the delivery lock.
pub(crate) type JobSink<V> = Arc<dyn Fn(&JobEvent<V>) + Send + Sync>;

/// Closure that kicks off a job's work on first subscribe.
pub(crate) type Starter<V> = Box<dyn FnOnce(Job<V>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobPhase {
    Pending,
    Running,
    Disposed,
}

struct JobSubscriber<V> {
    priority: Priority,
    sink: JobSink<V>,
}

struct JobState<V> {
    phase: JobPhase,
    starter: Option<Starter<V>>,
    subscribers: BTreeMap<u64, JobSubscriber<V>>,
    next_subscriber_id: u64,
    priority: Priority,
    /// Upstream subscriptions; dropped on dispose, which unsubscribes.
    dependencies: Vec<JobSubscription>,
    /// Queued work; cancelled on dispose, re-ranked on priority change.
    work_items: Vec<WorkItemHandle>,
    last_progress: Option<TaskProgress>,
    last_preview: Option<V>,
    on_dispose: Option<Box<dyn FnOnce() + Send>>,
}

pub(crate) struct JobShared<V> {
    key: String,
    cancellation: CancellationToken,
    state: Mutex<JobState<V>>,
    delivery: Mutex<()>,
}

/// Handle to a coalescing job. Cloning shares the same node.
pub(crate) struct Job<V> {
    shared: Arc<JobShared<V>>,
}

impl<V> Clone for Job<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V: Clone + Send + 'static> Job<V> {
    pub(crate) fn new(
        key: impl Into<String>,
        starter: Starter<V>,
        on_dispose: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            shared: Arc::new(JobShared {
                key: key.into(),
                cancellation: CancellationToken::new(),
                state: Mutex::new(JobState {
                    phase: JobPhase::Pending,
                    starter: Some(starter),
                    subscribers: BTreeMap::new(),
                    next_subscriber_id: 0,
                    priority: Priority::VeryLow,
                    dependencies: Vec::new(),
                    work_items: Vec::new(),
                    last_progress: None,
                    last_preview: None,
                    on_dispose,
                }),
                delivery: Mutex::new(()),
            }),
        }
    }

    /// Token observed by the job's work for cooperative cancellation.
    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.shared.cancellation.clone()
    }

    /// Current effective priority: the maximum among subscribers.
    pub(crate) fn priority(&self) -> Priority {
        self.shared.state.lock().priority
    }

    /// Attach a subscriber. Returns `None` when the job is already
    /// disposed (the caller then creates a fresh job).
    ///
    /// The first subscriber transitions the job to running and invokes the
    /// starter. A late subscriber immediately receives the last published
    /// progress and preview, bringing its view up to date.
    pub(crate) fn subscribe(&self, priority: Priority, sink: JobSink<V>) -> Option<JobSubscription> {
        let (id, starter, replay) = {
            let mut state = self.shared.state.lock();
            if state.phase == JobPhase::Disposed {
                return None;
            }
            let id = state.next_subscriber_id;
            state.next_subscriber_id += 1;
            state.subscribers.insert(
                id,
                JobSubscriber {
                    priority,
                    sink: Arc::clone(&sink),
                },
            );
            if priority > state.priority || state.subscribers.len() == 1 {
                state.priority = Self::max_priority(&state.subscribers);
            }
            let starter = if state.phase == JobPhase::Pending {
                state.phase = JobPhase::Running;
                state.starter.take()
            } else {
                None
            };
            let mut replay = Vec::new();
            if let Some(progress) = state.last_progress {
                replay.push(JobEvent::Progress(progress));
            }
            if let Some(preview) = state.last_preview.clone() {
                replay.push(JobEvent::Value {
                    value: preview,
                    is_final: false,
                });
            }
            (id, starter, replay)
        };

        for event in &replay {
            sink(event);
        }
        if let Some(starter) = starter {
            trace!(key = %self.shared.key, "starting job");
            starter(self.clone());
        }
        self.propagate_priority();

        let job = self.clone();
        let priority_job = self.clone();
        Some(JobSubscription {
            unsubscribe: Some(Box::new(move || job.unsubscribe(id))),
            set_priority: Arc::new(move |priority| {
                priority_job.set_subscriber_priority(id, priority);
            }),
        })
    }

    /// Register an upstream subscription to drop on dispose.
    pub(crate) fn add_dependency(&self, dependency: JobSubscription) {
        let mut state = self.shared.state.lock();
        if state.phase == JobPhase::Disposed {
            // Late registration after dispose: drop immediately, which
            // unsubscribes upstream.
            drop(state);
            drop(dependency);
            return;
        }
        state.dependencies.push(dependency);
    }

    /// Register a queued work item to cancel on dispose and re-rank on
    /// priority changes.
    pub(crate) fn add_work_item(&self, item: WorkItemHandle) {
        let mut state = self.shared.state.lock();
        if state.phase == JobPhase::Disposed {
            drop(state);
            item.cancel();
            return;
        }
        item.set_priority(state.priority);
        state.work_items.push(item);
    }

    /// Publish an intermediate or final value.
    pub(crate) fn publish_value(&self, value: V, is_final: bool) {
        self.publish(&JobEvent::Value { value, is_final });
    }

    pub(crate) fn publish_progress(&self, progress: TaskProgress) {
        self.publish(&JobEvent::Progress(progress));
    }

    /// Publish the terminal error.
    pub(crate) fn publish_error(&self, error: PipelineError) {
        self.publish(&JobEvent::Error(error));
    }

    fn publish(&self, event: &JobEvent<V>) {
        let _delivery = self.shared.delivery.lock();
        let (sinks, terminal) = {
            let mut state = self.shared.state.lock();
            if state.phase == JobPhase::Disposed {
                return;
            }
            let terminal = match event {
                JobEvent::Value { value, is_final } => {
                    if !is_final {
                        state.last_preview = Some(value.clone());
                    }
                    *is_final
                }
                JobEvent::Progress(progress) => {
                    state.last_progress = Some(*progress);
                    false
                }
                JobEvent::Error(_) => true,
            };
            let sinks: Vec<JobSink<V>> = state
                .subscribers
                .values()
                .map(|subscriber| Arc::clone(&subscriber.sink))
                .collect();
            (sinks, terminal)
        };
        for sink in &sinks {
            sink(event);
        }
        if terminal {
            self.dispose();
        }
    }

    fn unsubscribe(&self, id: u64) {
        let became_empty = {
            let mut state = self.shared.state.lock();
            if state.phase == JobPhase::Disposed {
                return;
            }
            if state.subscribers.remove(&id).is_none() {
                return;
            }
            state.priority = Self::max_priority(&state.subscribers);
            state.subscribers.is_empty()
        };
        if became_empty {
            trace!(key = %self.shared.key, "last subscriber left, disposing job");
            self.dispose();
        } else {
            self.propagate_priority();
        }
    }

    fn set_subscriber_priority(&self, id: u64, priority: Priority) {
        let changed = {
            let mut state = self.shared.state.lock();
            let Some(subscriber) = state.subscribers.get_mut(&id) else {
                return;
            };
            subscriber.priority = priority;
            let recomputed = Self::max_priority(&state.subscribers);
            if recomputed == state.priority {
                false
            } else {
                state.priority = recomputed;
                for item in &state.work_items {
                    item.set_priority(recomputed);
                }
                true
            }
        };
        if changed {
            self.propagate_priority();
        }
    }

    /// Push the current effective priority to queued work and upstream
    /// dependencies. Runs outside the state lock; upstream handles lock
    /// their own jobs.
    fn propagate_priority(&self) {
        let (priority, setters) = {
            let state = self.shared.state.lock();
            if state.phase == JobPhase::Disposed {
                return;
            }
            for item in &state.work_items {
                item.set_priority(state.priority);
            }
            let setters: Vec<_> = state
                .dependencies
                .iter()
                .map(JobSubscription::priority_setter)
                .collect();
            (state.priority, setters)
        };
        for setter in setters {
            setter(priority);
        }
    }

    fn dispose(&self) {
        let cleanup = {
            let mut state = self.shared.state.lock();
            if state.phase == JobPhase::Disposed {
                return;
            }
            state.phase = JobPhase::Disposed;
            state.subscribers.clear();
            state.last_preview = None;
            Some((
                std::mem::take(&mut state.dependencies),
                std::mem::take(&mut state.work_items),
                state.on_dispose.take(),
            ))
        };
        if let Some((dependencies, work_items, on_dispose)) = cleanup {
            self.shared.cancellation.cancel();
            for item in &work_items {
                item.cancel();
            }
            drop(dependencies);
            if let Some(on_dispose) = on_dispose {
                on_dispose();
            }
        }
    }

    fn max_priority(subscribers: &BTreeMap<u64, JobSubscriber<V>>) -> Priority {
        subscribers
            .values()
            .map(|subscriber| subscriber.priority)
            .max()
            .unwrap_or(Priority::VeryLow)
    }
}

/// Subscription handle: dropping it unsubscribes; when the last subscriber
/// leaves, the job disposes and cancellation flows upstream.
pub(crate) struct JobSubscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
    set_priority: Arc<dyn Fn(Priority) + Send + Sync>,
}

impl JobSubscription {
    pub(crate) fn set_priority(&self, priority: Priority) {
        (self.set_priority)(priority);
    }

    fn priority_setter(&self) -> Arc<dyn Fn(Priority) + Send + Sync> {
        Arc::clone(&self.set_priority)
    }
}

impl Drop for JobSubscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

/// Keyed registry sharing live jobs between equal requests.
pub(crate) struct JobRegistry<V> {
    map: Arc<DashMap<String, Weak<JobShared<V>>>>,
}

impl<V> Default for JobRegistry<V> {
    fn default() -> Self {
        Self {
            map: Arc::new(DashMap::new()),
        }
    }
}

impl<V: Clone + Send + 'static> JobRegistry<V> {
    /// Subscribe to the live job under `key`, creating it (and running
    /// `starter`) when none exists. With coalescing disabled every call
    /// creates a private, unregistered job.
    ///
    /// The starter always runs outside the registry's internal locks:
    /// starters of downstream stages recursively subscribe upstream through
    /// this same registry type.
    ///
    /// Returns the subscription and whether a new job was created.
    pub(crate) fn subscribe_or_create(
        &self,
        key: &str,
        coalescing: bool,
        priority: Priority,
        sink: JobSink<V>,
        starter: Starter<V>,
    ) -> (JobSubscription, bool) {
        if !coalescing {
            let job = Job::new(key, starter, None);
            let subscription = job
                .subscribe(priority, sink)
                .unwrap_or_else(|| unreachable!("fresh job cannot be disposed"));
            return (subscription, true);
        }

        loop {
            let existing = self.map.get(key).map(|entry| entry.value().clone());
            if let Some(weak) = existing {
                if let Some(shared) = weak.upgrade() {
                    let job = Job { shared };
                    if let Some(subscription) = job.subscribe(priority, Arc::clone(&sink)) {
                        return (subscription, false);
                    }
                }
                // Dead or disposed entry: clear it (unless replaced) and
                // retry.
                self.map.remove_if(key, |_, stored| stored.ptr_eq(&weak));
                continue;
            }

            // Create and subscribe before registering. Holding the
            // subscription pins the job, so it cannot dispose between here
            // and registration, and the starter runs with no map lock held.
            let map = Arc::clone(&self.map);
            let key_owned = key.to_owned();
            let self_slot: Arc<Mutex<Weak<JobShared<V>>>> = Arc::new(Mutex::new(Weak::new()));
            let slot = Arc::clone(&self_slot);
            let job = Job::new(
                key,
                starter,
                Some(Box::new(move || {
                    // Only remove the entry if it still points at this job;
                    // a replacement may already be registered.
                    let own = slot.lock().clone();
                    map.remove_if(&key_owned, |_, stored| stored.ptr_eq(&own));
                })),
            );
            *self_slot.lock() = Arc::downgrade(&job.shared);
            let subscription = job
                .subscribe(priority, sink)
                .unwrap_or_else(|| unreachable!("fresh job cannot be disposed"));

            let weak = Arc::downgrade(&job.shared);
            match self.map.entry(key.to_owned()) {
                Entry::Occupied(mut occupied) => {
                    if occupied.get().upgrade().is_none() {
                        occupied.insert(weak);
                    }
                    // A concurrent creator won the slot: our job stays
                    // private. Correct, just uncoalesced for this racer.
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(weak);
                }
            }
            return (subscription, true);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collecting_sink(events: &Arc<Mutex<Vec<String>>>) -> JobSink<u32> {
        let events = Arc::clone(events);
        Arc::new(move |event| {
            let rendered = match event {
                JobEvent::Value { value, is_final } => format!("v{value}:{is_final}"),
                JobEvent::Progress(p) => format!("p{}/{}", p.completed, p.total),
                JobEvent::Error(e) => format!("e:{e}"),
            };
            events.lock().push(rendered);
        })
    }

    #[tokio::test]
    async fn starts_once_and_fans_out() {
        let registry = JobRegistry::<u32>::default();
        let starts = Arc::new(AtomicUsize::new(0));
        let job_slot: Arc<Mutex<Option<Job<u32>>>> = Arc::new(Mutex::new(None));

        let events_a = Arc::new(Mutex::new(Vec::new()));
        let events_b = Arc::new(Mutex::new(Vec::new()));

        let make_starter = |starts: Arc<AtomicUsize>, slot: Arc<Mutex<Option<Job<u32>>>>| {
            Box::new(move |job: Job<u32>| {
                starts.fetch_add(1, Ordering::SeqCst);
                *slot.lock() = Some(job);
            }) as Starter<u32>
        };

        let (sub_a, created_a) = registry.subscribe_or_create(
            "k",
            true,
            Priority::Normal,
            collecting_sink(&events_a),
            make_starter(Arc::clone(&starts), Arc::clone(&job_slot)),
        );
        let (sub_b, created_b) = registry.subscribe_or_create(
            "k",
            true,
            Priority::Normal,
            collecting_sink(&events_b),
            make_starter(Arc::clone(&starts), Arc::clone(&job_slot)),
        );
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        let job = job_slot.lock().clone().unwrap();
        job.publish_value(7, true);

        assert_eq!(events_a.lock().as_slice(), ["v7:true"]);
        assert_eq!(events_b.lock().as_slice(), ["v7:true"]);
        drop((sub_a, sub_b));
    }

    #[tokio::test]
    async fn publishes_at_most_one_terminal_event() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let job = Job::new("k", Box::new(|_| {}), None);
        let _sub = job.subscribe(Priority::Normal, collecting_sink(&events));
        job.publish_value(1, true);
        job.publish_value(2, true);
        job.publish_error(PipelineError::DataIsEmpty);
        assert_eq!(events.lock().as_slice(), ["v1:true"]);
    }

    #[tokio::test]
    async fn last_unsubscribe_disposes_and_cancels() {
        let registry = JobRegistry::<u32>::default();
        let job_slot: Arc<Mutex<Option<Job<u32>>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&job_slot);
        let (subscription, _) = registry.subscribe_or_create(
            "k",
            true,
            Priority::Normal,
            Arc::new(|_| {}),
            Box::new(move |job| {
                *slot.lock() = Some(job);
            }),
        );
        let job = job_slot.lock().clone().unwrap();
        let token = job.cancellation();
        assert!(!token.is_cancelled());
        assert_eq!(registry.len(), 1);

        drop(subscription);
        assert!(token.is_cancelled());
        assert_eq!(registry.len(), 0);

        // Publishing after dispose is a no-op.
        job.publish_value(1, true);
    }

    #[tokio::test]
    async fn priority_is_max_of_subscribers() {
        let job = Job::<u32>::new("k", Box::new(|_| {}), None);
        let sub_low = job.subscribe(Priority::Low, Arc::new(|_| {})).unwrap();
        assert_eq!(job.priority(), Priority::Low);

        let sub_high = job.subscribe(Priority::High, Arc::new(|_| {})).unwrap();
        assert_eq!(job.priority(), Priority::High);

        drop(sub_high);
        assert_eq!(job.priority(), Priority::Low);

        sub_low.set_priority(Priority::VeryHigh);
        assert_eq!(job.priority(), Priority::VeryHigh);
        drop(sub_low);
    }

    #[tokio::test]
    async fn priority_changes_reach_dependencies() {
        let upstream = Job::<u32>::new("up", Box::new(|_| {}), None);
        let upstream_sub = upstream
            .subscribe(Priority::Normal, Arc::new(|_| {}))
            .unwrap();

        let downstream = Job::<u32>::new("down", Box::new(|_| {}), None);
        downstream.add_dependency(upstream_sub);
        let handle = downstream
            .subscribe(Priority::Normal, Arc::new(|_| {}))
            .unwrap();

        handle.set_priority(Priority::VeryHigh);
        assert_eq!(upstream.priority(), Priority::VeryHigh);
        drop(handle);
        // Dropping the last downstream subscriber disposes it and releases
        // the upstream subscription, disposing the upstream job too.
        assert!(upstream.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn late_subscriber_receives_last_progress_and_preview() {
        let job = Job::new("k", Box::new(|_| {}), None);
        let _first = job.subscribe(Priority::Normal, Arc::new(|_| {})).unwrap();
        job.publish_progress(TaskProgress::new(5, 10));
        job.publish_value(41, false);

        let events = Arc::new(Mutex::new(Vec::new()));
        let _late = job.subscribe(Priority::Normal, collecting_sink(&events));
        assert_eq!(events.lock().as_slice(), ["p5/10", "v41:false"]);
    }
}
