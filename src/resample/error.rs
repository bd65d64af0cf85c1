// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors associated with gridding and degridding.

use thiserror::Error;

use crate::grid::GridError;

#[derive(Error, Debug)]
pub enum ResampleError {
    /// Something that should have been guaranteed upstream wasn't. Continuing
    /// would give a wrong grid.
    #[error("Internal inconsistency (spw {spw}, chan {chan}, row {row}): {msg}")]
    InternalInconsistency {
        spw: usize,
        chan: usize,
        row: usize,
        msg: String,
    },

    #[error("Can't resample {0} polarisations; only 1, 2 or 4 are supported")]
    UnsupportedPols(usize),

    #[error("Couldn't build the resampling thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Grid(#[from] GridError),

    #[cfg(any(feature = "cuda", feature = "hip"))]
    #[error(transparent)]
    Gpu(#[from] crate::gpu::GpuError),
}
