// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors from reading and checking configuration.

use std::path::PathBuf;

use thiserror::Error;

use crate::{cf::AntennaType, resample::FluxScaleError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file '{}' doesn't have a recognised file extension! Valid extensions are: {valid}", path.display())]
    UnrecognisedFileType { path: PathBuf, valid: String },

    #[error("Couldn't decode toml structure: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Couldn't decode json structure: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Couldn't decode yaml structure: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("The grid must have at least one pixel and channel, but is {nx}x{ny} with {n_chan} channels")]
    EmptyGrid { nx: usize, ny: usize, n_chan: usize },

    #[error("The grid has {0} polarisations; only 1, 2 or 4 are supported")]
    UnsupportedPols(usize),

    #[error("The cell size must be finite and positive, but is {0} arcsec")]
    BadCellSize(f64),

    #[error("The CF sampling must be at least 1")]
    ZeroSampling,

    #[error("There must be at least one w plane")]
    ZeroWPlanes,

    #[error("The maximum w must be finite and non-negative, but is {0}")]
    BadWMax(f64),

    #[error("The PA tolerance must be finite and positive, but is {0} degrees")]
    BadPaTolerance(f64),

    #[error("PA bins must be finite, but one is {0} degrees")]
    BadPaBin(f64),

    #[error("Antenna type {0} has more than one aperture")]
    DuplicateAperture(AntennaType),

    #[error("The number of resampling threads must be at least 1")]
    ZeroThreads,

    #[error("Bad flux-scale table: {0}")]
    FluxScale(#[from] FluxScaleError),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}
