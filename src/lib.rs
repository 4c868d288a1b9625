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

//! An asynchronous, stateful video decode pipeline in Rust.
//!
//! Callers enqueue compressed work items and receive decoded pictures
//! through a completion sink, in decode order, exactly once per item. A
//! dedicated worker thread owns the decode engine and handles flush, drain
//! and mid-stream resolution changes without losing input.

pub mod buffer;
pub mod color;
pub mod engine;
pub mod error;
pub mod pending;
pub mod pipeline;
pub mod queue;
pub mod work;

pub use buffer::{FrameGeometry, PixelBuffer};
pub use color::{AspectsSnapshot, ColorAspects};
pub use engine::{DecodeEngine, DecodeRequest, DecodeResponse, EngineFactory, StructuralEvent};
pub use error::{PipelineError, Result, WorkError};
pub use pipeline::{DecodePipeline, PipelineConfig, PipelineStats};
pub use work::{CompletionSink, DecodedOutput, WorkFlags, WorkItem, WorkStatus};
