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

//! The common interface to the opaque decode engine.
//!
//! The pipeline drives an engine through decode steps and a small set of
//! control calls; it never looks inside the bitstream itself.

use crate::buffer::FrameGeometry;
use crate::color::ColorAspects;
use crate::error::Result;

/// Structural signals an engine can attach to a decode step result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralEvent {
    /// The stream geometry changed; buffered frames must be drained at the
    /// old geometry before the engine is reset.
    ResolutionChanged,
    /// The stream geometry exceeds what the engine supports. Instance-fatal.
    UnsupportedGeometry,
    /// The engine failed an internal allocation. Instance-fatal.
    AllocationFailed,
}

/// Writable destination planes for one decode step.
pub struct OutputPlanes<'a> {
    pub y: &'a mut [u8],
    pub u: &'a mut [u8],
    pub v: &'a mut [u8],
}

/// One decode step request.
///
/// `input` is `None` while the engine is in flush sub-mode (drain buffered
/// frames, feed nothing new).
pub struct DecodeRequest<'a> {
    pub input: Option<&'a [u8]>,
    /// Timestamp key echoed back on the output that this input produces.
    pub ordinal: u64,
    /// Minimum acceptable byte sizes for the Y, U and V planes.
    pub min_plane_sizes: [usize; 3],
    pub output: OutputPlanes<'a>,
}

/// One decode step result.
#[derive(Debug, Clone, Default)]
pub struct DecodeResponse {
    /// How far the input slice was consumed.
    pub bytes_consumed: usize,
    /// A picture was written to the output planes.
    pub output_present: bool,
    /// The input contained picture data (even if no output surfaced yet).
    pub frame_decoded: bool,
    /// Timestamp key of the surfaced picture, valid when `output_present`.
    pub ordinal: u64,
    /// Picture width reported by the bitstream, 0 if none.
    pub pic_width: u32,
    /// Picture height reported by the bitstream, 0 if none.
    pub pic_height: u32,
    /// Structural signal, if any.
    pub event: Option<StructuralEvent>,
    /// VUI-equivalent color metadata, when the bitstream carried it.
    pub color_aspects: Option<ColorAspects>,
}

/// An opaque, stateful decode engine.
///
/// All calls happen on the pipeline's worker thread, so implementations need
/// `Send` but no internal locking.
pub trait DecodeEngine: Send {
    /// Performs one decode step.
    fn decode(&mut self, request: DecodeRequest<'_>) -> DecodeResponse;

    /// Applies the run-time (dynamic) parameters, currently the display
    /// stride.
    fn set_params(&mut self, stride: u32) -> Result<()>;

    /// Puts the engine in flush sub-mode: subsequent decode steps drain
    /// buffered frames without consuming new input.
    fn enter_flush(&mut self) -> Result<()>;

    /// Tears internal state down and rebuilds it for the current geometry.
    fn reset(&mut self) -> Result<()>;
}

/// Creates engine instances. The pipeline constructs its engine lazily on
/// first use; creation failure is fatal for the pipeline instance.
pub trait EngineFactory: Send {
    fn create(&mut self) -> Result<Box<dyn DecodeEngine>>;
}

impl<F> EngineFactory for F
where
    F: FnMut() -> Result<Box<dyn DecodeEngine>> + Send,
{
    fn create(&mut self) -> Result<Box<dyn DecodeEngine>> {
        self()
    }
}

/// A trivial engine for simulations and tests: consumes each input whole and
/// surfaces one synthetic picture per work item at a fixed geometry.
#[derive(Debug)]
pub struct MockEngine {
    geometry: FrameGeometry,
    in_flush: bool,
}

impl MockEngine {
    pub fn new(geometry: FrameGeometry) -> Self {
        Self {
            geometry,
            in_flush: false,
        }
    }
}

impl DecodeEngine for MockEngine {
    fn decode(&mut self, request: DecodeRequest<'_>) -> DecodeResponse {
        match request.input {
            Some(input) if !self.in_flush => {
                // Stamp the luma plane so consumers can tell outputs apart.
                if let Some(first) = request.output.y.first_mut() {
                    *first = request.ordinal as u8;
                }
                DecodeResponse {
                    bytes_consumed: input.len(),
                    output_present: true,
                    frame_decoded: true,
                    ordinal: request.ordinal,
                    pic_width: self.geometry.width,
                    pic_height: self.geometry.height,
                    ..Default::default()
                }
            }
            // Flush sub-mode: nothing buffered, report no output so the
            // pipeline exits flush immediately.
            _ => {
                self.in_flush = false;
                DecodeResponse::default()
            }
        }
    }

    fn set_params(&mut self, stride: u32) -> Result<()> {
        self.geometry.stride = stride;
        Ok(())
    }

    fn enter_flush(&mut self) -> Result<()> {
        self.in_flush = true;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.in_flush = false;
        Ok(())
    }
}
