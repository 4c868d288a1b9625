/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur while operating the decode pipeline.
///
/// `NotRunning` is recoverable (retry after `start()`); `Timeout` and the
/// engine-level failures are fatal to the pipeline instance.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("worker thread is not running")]
    NotRunning,

    #[error("decode engine initialization failed: {0}")]
    InitFailed(String),

    #[error("unsupported geometry: {width}x{height}")]
    UnsupportedGeometry { width: u32, height: u32 },

    #[error("decode engine allocation failure")]
    EngineAllocationFailure,

    #[error("worker thread did not exit within {0} ms")]
    Timeout(u64),

    #[error("output buffer too small: provided {provided} bytes, required {required}")]
    BufferTooSmall { provided: usize, required: usize },
}

/// Per-item failure codes reported through the completion sink.
///
/// A failed work item is delivered exactly once with one of these codes and
/// is never retried by the pipeline.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkError {
    #[error("work item ordinal collides with an in-flight item")]
    DuplicateOrdinal,

    #[error("decode step failed")]
    DecodeFailed,

    #[error("pipeline entered a fatal error state")]
    PipelineFailed,

    #[error("work item was flushed before completion")]
    Flushed,
}
