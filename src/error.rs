//! Pipeline error taxonomy
//!
//! Every failure surfaced to callers is one of the kinds below. Errors are
//! `Clone` because a coalesced job delivers its terminal error to every
//! subscriber; underlying causes are therefore carried behind `Arc`.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// A shared, cloneable wrapper around an underlying error.
///
/// The pipeline does not interpret underlying errors; they are retained for
/// diagnostics and surfaced through `Display`/`Debug`.
#[derive(Clone)]
pub struct UnderlyingError(Arc<anyhow::Error>);

impl UnderlyingError {
    pub fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    /// Borrow the wrapped error.
    #[must_use]
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for UnderlyingError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(error)
    }
}

impl fmt::Display for UnderlyingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for UnderlyingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Errors produced by [`ImagePipeline`](crate::ImagePipeline) operations.
///
/// Errors propagate through the subscription graph unchanged: each
/// intermediate job publishes them as its terminal event. Errors never
/// poison caches — a failed decode does not remove cached bytes, and a
/// failed processor does not remove cached decoded images.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// `return_cache_data_dont_load` was set and no cached data exists.
    #[error("no cached data available and the request allows cached data only")]
    DataMissingInCache,

    /// Transport error or non-success HTTP status from the data loader.
    #[error("data loading failed: {underlying}")]
    DataLoadingFailed { underlying: UnderlyingError },

    /// The loader completed without error but produced zero bytes.
    #[error("data loader returned an empty response")]
    DataIsEmpty,

    /// No registered decoder accepted the fetched bytes.
    #[error("no image decoder registered for data of request {image_id:?}")]
    DecoderNotRegistered { image_id: String },

    /// A decoder ran but failed to produce an image.
    #[error("decoder {decoder:?} failed{}", fmt_underlying(.underlying))]
    DecodingFailed {
        decoder: String,
        underlying: Option<UnderlyingError>,
    },

    /// A processor returned no image or failed.
    #[error("processor {processor:?} failed{}", fmt_underlying(.underlying))]
    ProcessingFailed {
        processor: String,
        underlying: Option<UnderlyingError>,
    },

    /// API misuse: an operation was invoked without an image request.
    #[error("image request is missing")]
    ImageRequestMissing,

    /// The pipeline was invalidated; it accepts no new tasks.
    #[error("the image pipeline is invalidated")]
    PipelineInvalidated,

    /// The task was cancelled before completion.
    ///
    /// Completion callbacks are never invoked for cancelled tasks; on the
    /// async surface, awaiting a cancelled task resolves to this error and
    /// the event stream terminates after emitting
    /// [`TaskEvent::Cancelled`](crate::TaskEvent::Cancelled).
    #[error("the image task was cancelled")]
    Cancelled,
}

impl PipelineError {
    pub(crate) fn data_loading(underlying: anyhow::Error) -> Self {
        Self::DataLoadingFailed {
            underlying: underlying.into(),
        }
    }

    pub(crate) fn decoding(decoder: &str, underlying: Option<anyhow::Error>) -> Self {
        Self::DecodingFailed {
            decoder: decoder.to_owned(),
            underlying: underlying.map(Into::into),
        }
    }

    pub(crate) fn processing(processor: &str, underlying: Option<anyhow::Error>) -> Self {
        Self::ProcessingFailed {
            processor: processor.to_owned(),
            underlying: underlying.map(Into::into),
        }
    }

    /// `true` for the cancellation signal, which is not a load failure.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

fn fmt_underlying(underlying: &Option<UnderlyingError>) -> String {
    match underlying {
        Some(e) => format!(": {e}"),
        None => String::new(),
    }
}
