//! Task coalescing: equivalent requests share one data-loader task, and
//! cancellation only reaches the loader when the last subscriber leaves.

mod common;

use std::time::Duration;

use common::*;
use pixelpipe::{ImageRequest, PipelineError, TaskState};

#[tokio::test]
async fn two_identical_requests_share_one_loader_task() {
    let (pipeline, loader) = test_pipeline();
    let url = test_url("coalesce");
    loader.script_default(LoadScript::ok(vec![jpeg_bytes(256)]));
    loader.suspend();

    let task_a = pipeline.image_task(ImageRequest::url(&url));
    let task_b = pipeline.image_task(ImageRequest::url(&url));

    // Both tasks are subscribed before the loader is released.
    assert!(
        wait_until(|| loader.created_task_count() == 1, Duration::from_secs(1)).await,
        "loader should have been invoked exactly once"
    );
    loader.resume();

    let response_a = task_a.response().await.unwrap();
    let response_b = task_b.response().await.unwrap();
    assert_eq!(loader.created_task_count(), 1);
    assert_eq!(
        response_a.container.image.pixels,
        response_b.container.image.pixels
    );
}

#[tokio::test]
async fn coalescing_disabled_creates_private_loader_tasks() {
    let (config, loader) = test_config();
    let pipeline = pixelpipe::ImagePipeline::new(config.with_task_coalescing(false));
    let url = test_url("no_coalesce");
    loader.script_default(LoadScript::ok(vec![jpeg_bytes(64)]));
    loader.suspend();

    let task_a = pipeline.image_task(ImageRequest::url(&url));
    let task_b = pipeline.image_task(ImageRequest::url(&url));
    assert!(
        wait_until(|| loader.created_task_count() == 2, Duration::from_secs(1)).await,
        "each request should drive its own loader task"
    );
    loader.resume();
    task_a.response().await.unwrap();
    task_b.response().await.unwrap();
}

#[tokio::test]
async fn cancelling_one_subscriber_keeps_the_shared_load_alive() {
    let (pipeline, loader) = test_pipeline();
    let url = test_url("cancel_one");
    loader.script_default(LoadScript::ok(vec![jpeg_bytes(64)]));
    loader.suspend();

    let task_a = pipeline.image_task(ImageRequest::url(&url));
    let task_b = pipeline.image_task(ImageRequest::url(&url));
    assert!(wait_until(|| loader.created_task_count() == 1, Duration::from_secs(1)).await);

    task_a.cancel();
    assert!(matches!(
        task_a.response().await,
        Err(PipelineError::Cancelled)
    ));

    loader.resume();
    let response = task_b.response().await.unwrap();
    assert!(!response.container.image.pixels.is_empty());
}

#[tokio::test]
async fn cancelling_the_last_subscriber_cancels_the_work() {
    let (pipeline, loader) = test_pipeline();
    let url = test_url("cancel_last");
    loader.script_default(LoadScript::ok(vec![jpeg_bytes(64)]));
    loader.suspend();

    let task = pipeline.image_task(ImageRequest::url(&url));
    assert!(wait_until(|| loader.created_task_count() == 1, Duration::from_secs(1)).await);

    let mut events = task.events().expect("first take");
    task.cancel();
    assert_eq!(task.state(), TaskState::Cancelled);
    assert!(matches!(
        task.response().await,
        Err(PipelineError::Cancelled)
    ));
    loader.resume();

    // The completion is never delivered and nothing lands in memory cache.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut saw_completed = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, pixelpipe::TaskEvent::Completed(_)) {
            saw_completed = true;
        }
    }
    assert!(!saw_completed, "cancelled task must not complete");
    assert!(
        pipeline
            .cache()
            .cached_image(&ImageRequest::url(&url), pixelpipe::CacheLayers::MEMORY)
            .is_none()
    );
}

#[tokio::test]
async fn cancelling_twice_is_a_noop() {
    let (pipeline, loader) = test_pipeline();
    let url = test_url("cancel_twice");
    loader.script_default(LoadScript::ok(vec![jpeg_bytes(64)]));
    loader.suspend();

    let task = pipeline.image_task(ImageRequest::url(&url));
    task.cancel();
    task.cancel();
    assert_eq!(task.state(), TaskState::Cancelled);
    loader.resume();
}
