//! Progressive delivery: previews per scan, back-pressure, and the
//! preview-in-memory-cache option.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use pixelpipe::traits::ImageDecoding;
use pixelpipe::{CacheLayers, ImagePipeline, ImageRequest, TaskEvent};

fn progressive_pipeline(
    store_previews: bool,
) -> (ImagePipeline, Arc<MockDataLoader>) {
    let (config, loader) = test_config();
    let decoder: Arc<dyn ImageDecoding> = Arc::new(ProgressiveDecoder {
        scans: vec![(100, 5), (200, 9)],
    });
    let pipeline = ImagePipeline::new(
        config
            .with_progressive_decoding(true)
            .with_storing_previews_in_memory_cache(store_previews)
            .with_decoder_registry(Arc::new(move |_, _| Some(Arc::clone(&decoder)))),
    );
    (pipeline, loader)
}

#[tokio::test]
async fn previews_are_delivered_once_per_scan_then_the_final_image() {
    let (pipeline, loader) = progressive_pipeline(false);
    let url = test_url("progressive");
    loader.script(
        &url,
        LoadScript::ok(vec![jpeg_bytes(100), jpeg_bytes(100), jpeg_bytes(100)])
            .with_chunk_delay(Duration::from_millis(50)),
    );

    let task = pipeline.image_task(ImageRequest::url(&url));
    let mut events = task.events().expect("event stream");

    let response = task.response().await.unwrap();
    assert!(!response.container.is_preview);
    assert_eq!(response.container.image.pixels.len(), 300);

    let mut previews = Vec::new();
    let mut finals = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            TaskEvent::Preview(container) => {
                assert!(container.is_preview);
                previews.push(container.scan_number());
            }
            TaskEvent::Completed(result) => {
                assert!(result.is_ok());
                finals += 1;
            }
            _ => {}
        }
    }
    assert_eq!(previews, vec![Some(5), Some(9)], "one preview per scan");
    assert_eq!(finals, 1);

    // The memory cache ends up holding the final image.
    let cached = pipeline
        .cache()
        .cached_image(&ImageRequest::url(&url), CacheLayers::MEMORY)
        .expect("final image cached");
    assert!(!cached.is_preview);
}

#[tokio::test]
async fn progressive_disabled_delivers_no_previews() {
    let (config, loader) = test_config();
    let decoder: Arc<dyn ImageDecoding> = Arc::new(ProgressiveDecoder {
        scans: vec![(50, 1)],
    });
    let pipeline = ImagePipeline::new(
        config.with_decoder_registry(Arc::new(move |_, _| Some(Arc::clone(&decoder)))),
    );
    let url = test_url("no_progressive");
    loader.script(
        &url,
        LoadScript::ok(vec![jpeg_bytes(100), jpeg_bytes(100)])
            .with_chunk_delay(Duration::from_millis(10)),
    );

    let task = pipeline.image_task(ImageRequest::url(&url));
    let mut events = task.events().expect("event stream");
    task.response().await.unwrap();

    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, TaskEvent::Preview(_)),
            "previews are off by default"
        );
    }
}

#[tokio::test]
async fn previews_can_overwrite_the_memory_cache_until_the_final_image() {
    let (pipeline, loader) = progressive_pipeline(true);
    let url = test_url("preview_cache");
    loader.script(
        &url,
        LoadScript::ok(vec![jpeg_bytes(150), jpeg_bytes(150)])
            .with_chunk_delay(Duration::from_millis(40)),
    );

    let task = pipeline.image_task(ImageRequest::url(&url));

    // While the load is in flight a preview occupies the cache slot.
    let saw_preview_in_cache = wait_until(
        || {
            pipeline
                .cache()
                .cached_image(&ImageRequest::url(&url), CacheLayers::MEMORY)
                .is_some_and(|container| container.is_preview)
        },
        Duration::from_secs(1),
    )
    .await;

    task.response().await.unwrap();
    assert!(saw_preview_in_cache, "preview stored while loading");
    let cached = pipeline
        .cache()
        .cached_image(&ImageRequest::url(&url), CacheLayers::MEMORY)
        .expect("cached");
    assert!(!cached.is_preview, "final image replaced the preview");
}

#[tokio::test]
async fn previews_flow_through_processors() {
    let (config, loader) = test_config();
    let decoder: Arc<dyn ImageDecoding> = Arc::new(ProgressiveDecoder {
        scans: vec![(100, 3)],
    });
    let p1 = MockProcessor::new("P1");
    let pipeline = ImagePipeline::new(
        config
            .with_progressive_decoding(true)
            .with_decoder_registry(Arc::new(move |_, _| Some(Arc::clone(&decoder)))),
    );
    let url = test_url("preview_processing");
    loader.script(
        &url,
        LoadScript::ok(vec![jpeg_bytes(120), jpeg_bytes(120)])
            .with_chunk_delay(Duration::from_millis(40)),
    );

    let task = pipeline.image_task(
        ImageRequest::url(&url).with_processors(vec![Arc::clone(&p1) as _]),
    );
    let mut events = task.events().expect("event stream");
    let response = task.response().await.unwrap();

    let mut saw_processed_preview = false;
    while let Ok(event) = events.try_recv() {
        if let TaskEvent::Preview(container) = event {
            assert!(container.image.pixels.ends_with(b"P1"));
            saw_processed_preview = true;
        }
    }
    assert!(saw_processed_preview, "preview passed through the processor");
    assert!(response.container.image.pixels.ends_with(b"P1"));
    assert!(p1.call_count() >= 2, "preview and final both processed");
}
