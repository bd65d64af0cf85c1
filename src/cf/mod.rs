// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Convolution functions (CFs) and the store that indexes them.
//!
//! A CF is a 2D oversampled kernel with an odd number of pixels along each
//! axis. Its origin is the central pixel; a tap `d` grid pixels from the
//! origin with a sub-pixel offset `off` lives at CF pixel
//! `origin + d * sampling + off`.

mod cache;
mod error;
mod indexer;
mod store;

pub use cache::CfCache;
pub use error::{CfAxis, CfCacheError, CfError};
pub use indexer::{CFIndex, CFIndexer};
pub use store::{CFStore, CellHandle, FreqResolution, StoreConfig};

use std::{
    fmt::Display,
    hash::{Hash, Hasher},
};

use marlu::c32;
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

/// An index into the table of configured antenna apertures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AntennaType(pub u16);

impl Display for AntennaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The antenna-type pair that forms a baseline. Baselines between antennas
/// of the same type share CFs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BaselineClass {
    Homogeneous(AntennaType),

    /// Always stored with the smaller type first.
    Heterogeneous(AntennaType, AntennaType),
}

impl BaselineClass {
    pub fn from_antenna_types(a: AntennaType, b: AntennaType) -> BaselineClass {
        match a.cmp(&b) {
            std::cmp::Ordering::Equal => BaselineClass::Homogeneous(a),
            std::cmp::Ordering::Less => BaselineClass::Heterogeneous(a, b),
            std::cmp::Ordering::Greater => BaselineClass::Heterogeneous(b, a),
        }
    }

    pub fn antenna_types(self) -> (AntennaType, AntennaType) {
        match self {
            BaselineClass::Homogeneous(a) => (a, a),
            BaselineClass::Heterogeneous(a, b) => (a, b),
        }
    }
}

impl Display for BaselineClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BaselineClass::Homogeneous(a) => write!(f, "h{a}"),
            BaselineClass::Heterogeneous(a, b) => write!(f, "x{a}-{b}"),
        }
    }
}

/// Everything that identifies a [`CFCell`]. Floats are compared by their bits;
/// two keys built from the same configuration are always equal.
#[derive(Debug, Clone, Copy)]
pub struct CellKey {
    pub class: BaselineClass,
    /// Parallactic angle \[radians\]
    pub pa: f64,
    /// \[wavelengths\], never negative
    pub w: f64,
    /// \[Hz\]
    pub freq: f64,
    pub pol: usize,
}

impl PartialEq for CellKey {
    fn eq(&self, other: &Self) -> bool {
        self.class == other.class
            && self.pa.to_bits() == other.pa.to_bits()
            && self.w.to_bits() == other.w.to_bits()
            && self.freq.to_bits() == other.freq.to_bits()
            && self.pol == other.pol
    }
}

impl Eq for CellKey {}

impl Hash for CellKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.class.hash(state);
        self.pa.to_bits().hash(state);
        self.w.to_bits().hash(state);
        self.freq.to_bits().hash(state);
        self.pol.hash(state);
    }
}

impl Display for CellKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "class {}, PA {:.4} rad, w {} λ, freq {} Hz, pol {}",
            self.class, self.pa, self.w, self.freq, self.pol
        )
    }
}

/// A single convolution function. Immutable once made; the store hands these
/// out behind an `Arc`.
#[derive(Debug, Clone)]
pub struct CFCell {
    pub(crate) key: CellKey,
    /// Indexed `[y][x]`.
    pub(crate) pixels: Array2<c32>,
    pub(crate) sampling: u32,
    pub(crate) support: u32,
}

impl CFCell {
    pub fn new(
        key: CellKey,
        pixels: Array2<c32>,
        sampling: u32,
        support: u32,
    ) -> Result<CFCell, CfError> {
        let (ny, nx) = pixels.dim();
        if nx % 2 == 0 || ny % 2 == 0 {
            return Err(CfError::InvalidCell(format!(
                "CF dimensions must be odd, but got {ny}x{nx}"
            )));
        }
        if sampling == 0 {
            return Err(CfError::InvalidCell("CF sampling must be at least 1".into()));
        }
        if key.w < 0.0 || !key.w.is_finite() {
            return Err(CfError::InvalidCell(format!(
                "CF w value must be finite and non-negative, but got {}",
                key.w
            )));
        }
        Ok(CFCell {
            key,
            pixels: pixels.as_standard_layout().into_owned(),
            sampling,
            support,
        })
    }

    /// A delta function. Gridding with this places each visibility on its
    /// nearest grid pixel.
    pub fn identity(key: CellKey) -> CFCell {
        CFCell {
            key,
            pixels: Array2::from_elem((1, 1), c32::new(1.0, 0.0)),
            sampling: 1,
            support: 0,
        }
    }

    pub fn key(&self) -> &CellKey {
        &self.key
    }

    pub fn pixels(&self) -> ArrayView2<c32> {
        self.pixels.view()
    }

    pub fn sampling(&self) -> u32 {
        self.sampling
    }

    pub fn support(&self) -> u32 {
        self.support
    }

    pub fn w_value(&self) -> f64 {
        self.key.w
    }

    pub fn ref_freq(&self) -> f64 {
        self.key.freq
    }

    pub fn pa(&self) -> f64 {
        self.key.pa
    }

    pub fn baseline_class(&self) -> BaselineClass {
        self.key.class
    }

    pub fn pol(&self) -> usize {
        self.key.pol
    }

    /// The `(x, y)` pixel of the CF origin.
    pub fn origin(&self) -> (usize, usize) {
        let (ny, nx) = self.pixels.dim();
        (nx / 2, ny / 2)
    }

    /// Get the tap `(dx, dy)` grid pixels from the origin with sub-pixel
    /// offset `off`. Taps outside the CF are `None`.
    #[inline]
    pub fn tap(&self, dx: i64, dy: i64, off: [i64; 2]) -> Option<c32> {
        let (ny, nx) = self.pixels.dim();
        let (ox, oy) = self.origin();
        let s = i64::from(self.sampling);
        let ix = ox as i64 + dx * s + off[0];
        let iy = oy as i64 + dy * s + off[1];
        if ix < 0 || iy < 0 || ix >= nx as i64 || iy >= ny as i64 {
            None
        } else {
            Some(self.pixels[(iy as usize, ix as usize)])
        }
    }
}
