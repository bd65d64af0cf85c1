// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The top-level error type.

use thiserror::Error;

use crate::{
    cf::{CfCacheError, CfError},
    config::ConfigError,
    coordination::CoordError,
    grid::GridError,
    prepare::PrepareError,
    resample::ResampleError,
};

#[derive(Error, Debug)]
pub enum ImagingError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cf(#[from] CfError),

    #[error(transparent)]
    CfCache(#[from] CfCacheError),

    #[error(transparent)]
    Prepare(#[from] PrepareError),

    #[error(transparent)]
    Coordination(#[from] CoordError),

    #[error(transparent)]
    Resample(#[from] ResampleError),

    #[error(transparent)]
    Grid(#[from] GridError),

    #[error("A visibility buffer belongs to spectral window {spw}, which wasn't given")]
    UnknownSpw { spw: usize },

    #[error("The CF preparation thread panicked")]
    WorkerPanicked,
}
