// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Useful constants.

All constants *must* be double precision. Gridding arithmetic happens in
double precision; only CF pixels and visibilities are stored in single
precision.
 */

pub use marlu::constants::VEL_C;
pub use std::f64::consts::{PI, TAU};

/// The number of grid pixels on either side of a CF's origin.
pub const DEFAULT_SUPPORT: u32 = 3;

/// The number of CF pixels per grid pixel.
pub const DEFAULT_SAMPLING: u32 = 20;

pub const DEFAULT_NUM_W_PLANES: usize = 1;

/// \[degrees\]
pub const DEFAULT_PA_TOLERANCE_DEG: f64 = 5.0;

/// Relative frequency tolerance used when CFs are computed per channel.
pub const DEFAULT_FREQ_REL_TOLERANCE: f64 = 1e-6;

/// When the number of resampling threads isn't specified, use at most this
/// many.
pub const DEFAULT_MAX_NUM_THREADS: usize = 4;

/// Never use more resampling threads than this. Each thread owns a partial
/// grid.
pub const MAX_NUM_THREADS: usize = 256;

/// Grid polarisations are carried in fixed-size arrays of this length.
pub const MAX_NUM_POLS: usize = 4;

/// Converts the standard deviation of a Gaussian to its FWHM.
pub const FWHM_FACTOR: f64 = 2.35482004503;

/// The FWHM of a uniformly illuminated dish is this many λ/D.
pub const DISH_FWHM_COEFF: f64 = 1.02;

/// Versions of the on-disk CF cache format this crate can read.
pub(crate) const CF_CACHE_VERSION: u32 = 1;
