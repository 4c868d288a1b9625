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

//! Contains the fundamental data structures for decode work items.

use serde::{Deserialize, Serialize};

use crate::buffer::PixelBuffer;
use crate::color::ColorAspects;
use crate::error::WorkError;

/// Bit flags carried on a work item's input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkFlags(u32);

impl WorkFlags {
    /// Marks the item as the last of the current stream segment.
    pub const END_OF_STREAM: WorkFlags = WorkFlags(1 << 0);

    pub fn contains(self, other: WorkFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: WorkFlags) {
        self.0 |= other.0;
    }
}

/// How a work item ended its journey through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// Still owned by the pipeline; no terminal result yet.
    Pending,
    /// Completed with a decoded output attached.
    Ok,
    /// Completed with a failure code and no output.
    Failed(WorkError),
}

/// A decoded picture handed back inside a completed work item.
///
/// Ownership of the pixel buffer transfers irrevocably to the receiver; the
/// pipeline keeps no reference after handoff.
#[derive(Debug)]
pub struct DecodedOutput {
    /// The raw planar pixel data.
    pub buffer: PixelBuffer,
    /// Ordinal echoed from the input that produced this picture.
    pub ordinal: u64,
    /// Final color aspects in effect when the picture was produced.
    pub color_aspects: ColorAspects,
}

/// A unit of decode work: one compressed input buffer plus its bookkeeping.
///
/// Created by the caller, exclusively owned by the pipeline once dequeued,
/// and released to the completion sink exactly once.
#[derive(Debug)]
pub struct WorkItem {
    /// The compressed input bytes.
    pub input: Vec<u8>,
    /// Monotonic sequence number, doubles as the timestamp key.
    pub ordinal: u64,
    /// Input flags (e.g. end-of-stream).
    pub flags: WorkFlags,
    /// Destination for the produced picture, filled on success.
    pub output: Option<DecodedOutput>,
    /// Terminal result of the item.
    pub status: WorkStatus,
}

impl WorkItem {
    pub fn new(input: Vec<u8>, ordinal: u64) -> Self {
        Self {
            input,
            ordinal,
            flags: WorkFlags::default(),
            output: None,
            status: WorkStatus::Pending,
        }
    }

    pub fn with_flags(mut self, flags: WorkFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(WorkFlags::END_OF_STREAM)
    }

    /// Marks the item failed. Terminal states are never overwritten.
    pub fn fail(&mut self, error: WorkError) {
        if matches!(self.status, WorkStatus::Pending) {
            self.status = WorkStatus::Failed(error);
        }
    }
}

/// Receives finished work items, exactly once per item (success or failure).
///
/// Invoked from the pipeline's worker thread, so implementations should hand
/// items off quickly rather than block.
pub trait CompletionSink: Send + Sync {
    fn on_work_done(&self, item: WorkItem);
}

impl<F> CompletionSink for F
where
    F: Fn(WorkItem) + Send + Sync,
{
    fn on_work_done(&self, item: WorkItem) {
        self(item)
    }
}
