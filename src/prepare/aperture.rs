// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Antenna apertures and their voltage patterns.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::PrepareError;
use crate::{
    cf::AntennaType,
    constants::{DISH_FWHM_COEFF, FWHM_FACTOR},
};

/// How the voltage pattern of an aperture is modelled.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ApertureKind {
    /// A circular dish whose voltage pattern is a Gaussian with a FWHM of
    /// 1.02 λ/D.
    #[default]
    Gaussian,

    /// A unit response everywhere.
    Isotropic,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aperture {
    pub antenna_type: AntennaType,
    /// \[metres\]
    pub diameter: f64,
    pub kind: ApertureKind,
    /// The beam centre relative to the phase centre, (l, m) \[radians\].
    pub pointing_offset: [f64; 2],
}

impl Aperture {
    pub fn new(antenna_type: AntennaType, diameter: f64) -> Aperture {
        Aperture {
            antenna_type,
            diameter,
            kind: ApertureKind::default(),
            pointing_offset: [0.0; 2],
        }
    }

    fn validate(&self) -> Result<(), PrepareError> {
        if self.diameter <= 0.0 || !self.diameter.is_finite() {
            return Err(PrepareError::InvalidAperture {
                antenna_type: self.antenna_type,
                diameter: self.diameter,
            });
        }
        Ok(())
    }

    /// The voltage response at (`l`, `m`) \[radians\]. The pointing offset
    /// turns with the sky, so it is rotated by the parallactic angle `pa`.
    pub fn voltage(&self, l: f64, m: f64, lambda: f64, pa: f64) -> f64 {
        match self.kind {
            ApertureKind::Isotropic => 1.0,
            ApertureKind::Gaussian => {
                let fwhm = DISH_FWHM_COEFF * lambda / self.diameter;
                let sigma = fwhm / FWHM_FACTOR;
                let (s_pa, c_pa) = pa.sin_cos();
                let [l0, m0] = self.pointing_offset;
                let dl = l - (c_pa * l0 - s_pa * m0);
                let dm = m - (s_pa * l0 + c_pa * m0);
                // The power pattern is exp(-r²/2σ²).
                (-(dl * dl + dm * dm) / (4.0 * sigma * sigma)).exp()
            }
        }
    }
}

/// The aperture of every antenna type.
#[derive(Debug, Clone, Default)]
pub struct ApertureTable(BTreeMap<AntennaType, Aperture>);

impl ApertureTable {
    /// Later apertures for the same antenna type replace earlier ones.
    pub fn new<I: IntoIterator<Item = Aperture>>(apertures: I) -> ApertureTable {
        ApertureTable(
            apertures
                .into_iter()
                .map(|a| (a.antenna_type, a))
                .collect(),
        )
    }

    pub fn get(&self, antenna_type: AntennaType) -> Option<&Aperture> {
        self.0.get(&antenna_type)
    }

    pub fn insert(&mut self, aperture: Aperture) {
        self.0.insert(aperture.antenna_type, aperture);
    }

    /// Get a usable aperture for `antenna_type`.
    pub fn checked(&self, antenna_type: AntennaType) -> Result<&Aperture, PrepareError> {
        let a = self
            .get(antenna_type)
            .ok_or(PrepareError::UnsupportedAperture { antenna_type })?;
        a.validate()?;
        Ok(a)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
