// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors associated with preparing CFs.

use thiserror::Error;

use crate::cf::{AntennaType, CellKey, CfError};

#[derive(Error, Debug)]
pub enum PrepareError {
    #[error("No aperture is configured for antenna type {antenna_type}; can't make CFs for it")]
    UnsupportedAperture { antenna_type: AntennaType },

    #[error("Antenna type {antenna_type} has an aperture diameter of {diameter} m, but it must be finite and positive")]
    InvalidAperture {
        antenna_type: AntennaType,
        diameter: f64,
    },

    #[error("Spectral window {spw} has a frequency of {freq} Hz; frequencies must be finite and positive")]
    BadFrequency { spw: usize, freq: f64 },

    #[error("CF support must be at least 1 when oversampling, but sampling is {sampling}")]
    ZeroSupport { sampling: u32 },

    #[error("The CF for {key} sums to zero at integer pixel offsets and can't be normalised")]
    Degenerate { key: CellKey },

    #[error(transparent)]
    Cf(#[from] CfError),
}
