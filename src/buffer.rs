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

//! Output pixel buffer ownership and reallocation across geometry changes.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Default picture width before the bitstream reports one.
pub const DEFAULT_WIDTH: u32 = 320;
/// Default picture height before the bitstream reports one.
pub const DEFAULT_HEIGHT: u32 = 240;
/// Coded block granularity; configured sizes must round to this.
pub const BLOCK_SIZE: u32 = 16;
/// Pixel alignment granularity.
pub const ALIGNMENT: u32 = 2;

/// Current frame geometry. Mutated only by the worker, and only after the
/// engine confirms a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    /// Display stride handed to the engine; tracked separately because the
    /// engine must be re-configured whenever it falls out of step with width.
    pub stride: u32,
}

impl Default for FrameGeometry {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            stride: DEFAULT_WIDTH,
        }
    }
}

impl FrameGeometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            stride: width,
        }
    }

    /// Luma plane size in bytes.
    pub fn luma_size(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Size of each chroma plane in bytes (4:2:0 subsampling).
    pub fn chroma_size(&self) -> usize {
        self.luma_size() / 4
    }

    /// Total planar 4:2:0 byte size: full Y plane plus two quarter-size
    /// chroma planes.
    pub fn frame_size(&self) -> usize {
        self.luma_size() * 3 / 2
    }
}

/// An owned planar 4:2:0 pixel buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PixelBuffer {
    geometry: FrameGeometry,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Allocates a zeroed buffer for the given geometry. Allocation failure
    /// is reported instead of aborting the process.
    pub fn allocate(geometry: FrameGeometry) -> Result<Self> {
        let size = geometry.frame_size();
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| PipelineError::EngineAllocationFailure)?;
        data.resize(size, 0);
        Ok(Self { geometry, data })
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Splits the buffer into its Y, U and V planes.
    pub fn planes_mut(&mut self) -> (&mut [u8], &mut [u8], &mut [u8]) {
        let luma = self.geometry.luma_size();
        let chroma = self.geometry.chroma_size();
        let (y, uv) = self.data.split_at_mut(luma);
        let (u, v) = uv.split_at_mut(chroma);
        (y, u, &mut v[..chroma])
    }

    /// Fails when the buffer cannot hold a picture of `required` geometry.
    pub fn check_fits(&self, required: FrameGeometry) -> Result<()> {
        if self.data.len() < required.frame_size() {
            return Err(PipelineError::BufferTooSmall {
                provided: self.data.len(),
                required: required.frame_size(),
            });
        }
        Ok(())
    }
}

/// Owns the caller-visible output buffer and reallocates it when the frame
/// geometry changes.
///
/// Exactly one allocation happens per geometry change: a change releases the
/// held buffer, and the next acquire allocates at the new geometry.
#[derive(Debug, Default)]
pub struct OutputBufferManager {
    held: Option<PixelBuffer>,
    allocations: u64,
}

impl OutputBufferManager {
    /// Returns the held buffer, allocating one for `geometry` if none is held
    /// or the held one was allocated for a different geometry.
    pub fn acquire(&mut self, geometry: FrameGeometry) -> Result<&mut PixelBuffer> {
        let needs_alloc = match &self.held {
            Some(buffer) => buffer.geometry() != geometry,
            None => true,
        };
        if needs_alloc {
            debug!(
                "allocating output buffer {}x{} ({} bytes)",
                geometry.width,
                geometry.height,
                geometry.frame_size()
            );
            self.held = Some(PixelBuffer::allocate(geometry)?);
            self.allocations += 1;
        }
        Ok(self.held.as_mut().expect("buffer was just ensured"))
    }

    /// Transfers ownership of the held buffer to the caller.
    pub fn take(&mut self) -> Option<PixelBuffer> {
        self.held.take()
    }

    /// Drops the held buffer so the next acquire reallocates.
    pub fn release(&mut self) {
        self.held = None;
    }

    /// Number of allocations performed over the manager's lifetime.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }
}
