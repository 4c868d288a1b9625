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

//! Color aspect (VUI-equivalent) metadata: typed fields, the preference
//! merge rule, and versioned snapshots for cross-thread readers.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Video range reported by or preferred over the bitstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorRange {
    #[default]
    Unspecified,
    Full,
    Limited,
}

/// Color primaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorPrimaries {
    #[default]
    Unspecified,
    Bt709,
    Bt601_625,
    Bt601_525,
    Bt2020,
}

/// Transfer characteristics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferCharacteristics {
    #[default]
    Unspecified,
    Bt709,
    Smpte170,
    Linear,
    Srgb,
    St2084,
}

/// Matrix coefficients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatrixCoefficients {
    #[default]
    Unspecified,
    Bt709,
    Bt601,
    Bt2020,
}

/// A full color-aspect record. Field-wise equality; `Unspecified` is the
/// sentinel that yields to the other record during a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorAspects {
    pub range: ColorRange,
    pub primaries: ColorPrimaries,
    pub transfer: TransferCharacteristics,
    pub matrix: MatrixCoefficients,
}

impl ColorAspects {
    /// Merges two aspect records field by field: the preferred record's value
    /// wins unless it is `Unspecified`, in which case the other record's
    /// value is used.
    pub fn merge_preferred(preferred: &ColorAspects, other: &ColorAspects) -> ColorAspects {
        ColorAspects {
            range: if preferred.range != ColorRange::Unspecified {
                preferred.range
            } else {
                other.range
            },
            primaries: if preferred.primaries != ColorPrimaries::Unspecified {
                preferred.primaries
            } else {
                other.primaries
            },
            transfer: if preferred.transfer != TransferCharacteristics::Unspecified {
                preferred.transfer
            } else {
                other.transfer
            },
            matrix: if preferred.matrix != MatrixCoefficients::Unspecified {
                preferred.matrix
            } else {
                other.matrix
            },
        }
    }

    /// Converts ISO/IEC 23001-8 VUI integer codes into a typed record.
    /// Codes outside the mapped set collapse to `Unspecified`.
    pub fn from_iso(primaries: u8, transfer: u8, matrix: u8, full_range: bool) -> ColorAspects {
        ColorAspects {
            range: if full_range {
                ColorRange::Full
            } else {
                ColorRange::Limited
            },
            primaries: match primaries {
                1 => ColorPrimaries::Bt709,
                5 => ColorPrimaries::Bt601_625,
                6 => ColorPrimaries::Bt601_525,
                9 => ColorPrimaries::Bt2020,
                _ => ColorPrimaries::Unspecified,
            },
            transfer: match transfer {
                1 => TransferCharacteristics::Bt709,
                6 => TransferCharacteristics::Smpte170,
                8 => TransferCharacteristics::Linear,
                13 => TransferCharacteristics::Srgb,
                16 => TransferCharacteristics::St2084,
                _ => TransferCharacteristics::Unspecified,
            },
            matrix: match matrix {
                1 => MatrixCoefficients::Bt709,
                5 | 6 => MatrixCoefficients::Bt601,
                9 => MatrixCoefficients::Bt2020,
                _ => MatrixCoefficients::Unspecified,
            },
        }
    }
}

/// An immutable, versioned view of the final color aspects, shared with
/// readers outside the worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AspectsSnapshot {
    /// Bumped every time the final record changes.
    pub version: u64,
    pub aspects: ColorAspects,
}

/// Single-writer publisher of aspect snapshots.
///
/// The worker thread is the only writer; any thread may read. Readers get an
/// `Arc` to an immutable snapshot, so the lock is held only for the pointer
/// swap, never across decode work.
#[derive(Debug)]
pub struct AspectsPublisher {
    current: Mutex<Arc<AspectsSnapshot>>,
}

impl Default for AspectsPublisher {
    fn default() -> Self {
        Self {
            current: Mutex::new(Arc::new(AspectsSnapshot {
                version: 0,
                aspects: ColorAspects::default(),
            })),
        }
    }
}

impl AspectsPublisher {
    pub fn publish(&self, aspects: ColorAspects) {
        let mut guard = self.current.lock().unwrap();
        let version = guard.version + 1;
        *guard = Arc::new(AspectsSnapshot { version, aspects });
    }

    pub fn snapshot(&self) -> Arc<AspectsSnapshot> {
        self.current.lock().unwrap().clone()
    }
}

/// Worker-local tracker of bitstream-reported and finalized color aspects.
#[derive(Debug, Default)]
pub struct AspectsTracker {
    /// Aspects most recently reported by the bitstream.
    bitstream: ColorAspects,
    /// Caller-preferred aspects that win over the bitstream where specified.
    preferred: ColorAspects,
    /// The merged record currently in effect.
    finalized: ColorAspects,
    /// Set when `finalized` changed and the change has not been surfaced yet.
    pending_notify: bool,
}

impl AspectsTracker {
    pub fn new(preferred: ColorAspects) -> Self {
        Self {
            preferred,
            // Until the bitstream reports anything the preference stands
            // alone.
            finalized: preferred,
            ..Default::default()
        }
    }

    pub fn finalized(&self) -> ColorAspects {
        self.finalized
    }

    /// Feeds a new bitstream report. Returns true when the finalized record
    /// changed; the pending-notify flag is raised at most once until consumed.
    pub fn update_bitstream(&mut self, reported: ColorAspects) -> bool {
        if reported == self.bitstream {
            return false;
        }
        self.bitstream = reported;
        let merged = ColorAspects::merge_preferred(&self.preferred, &self.bitstream);
        if merged == self.finalized {
            return false;
        }
        self.finalized = merged;
        self.pending_notify = true;
        true
    }

    /// Consumes the pending-notify flag. Returns whether it was set.
    pub fn take_pending_notify(&mut self) -> bool {
        std::mem::take(&mut self.pending_notify)
    }
}
