// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Frequency-dependent scaling of predicted visibilities.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vec1::Vec1;

/// How a [`FluxScaleTable`] is read between its entries.
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
pub enum FluxInterp {
    /// Use the entry with the closest frequency.
    #[default]
    Nearest,

    /// Interpolate linearly between neighbouring entries, holding the end
    /// values beyond the table.
    Linear,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FluxScaleError {
    #[error("A flux-scale table needs at least one entry")]
    Empty,

    #[error("Flux-scale entry {index} ({freq} Hz, {scale}) isn't finite")]
    NotFinite { index: usize, freq: f64, scale: f64 },
}

/// Scale factors by frequency, sorted by frequency.
#[derive(Debug, Clone, PartialEq)]
pub struct FluxScaleTable {
    /// `(freq [Hz], scale)`
    entries: Vec1<(f64, f64)>,
    interp: FluxInterp,
}

impl FluxScaleTable {
    pub fn new(
        mut entries: Vec<(f64, f64)>,
        interp: FluxInterp,
    ) -> Result<FluxScaleTable, FluxScaleError> {
        if let Some((index, &(freq, scale))) = entries
            .iter()
            .enumerate()
            .find(|(_, (f, s))| !f.is_finite() || !s.is_finite())
        {
            return Err(FluxScaleError::NotFinite { index, freq, scale });
        }
        entries.sort_by(|a, b| a.0.total_cmp(&b.0));
        let entries = Vec1::try_from_vec(entries).map_err(|_| FluxScaleError::Empty)?;
        Ok(FluxScaleTable { entries, interp })
    }

    pub fn interp(&self) -> FluxInterp {
        self.interp
    }

    pub fn entries(&self) -> &[(f64, f64)] {
        &self.entries
    }

    /// The scale at `freq` \[Hz\].
    pub fn scale_at(&self, freq: f64) -> f64 {
        let e = &self.entries;
        // The first entry at or above `freq`.
        let i = e.partition_point(|&(f, _)| f < freq);
        if i == 0 {
            return e.first().1;
        }
        if i == e.len() {
            return e.last().1;
        }

        let (f0, s0) = e[i - 1];
        let (f1, s1) = e[i];
        match self.interp {
            FluxInterp::Nearest => {
                if freq - f0 <= f1 - freq {
                    s0
                } else {
                    s1
                }
            }
            FluxInterp::Linear => {
                if f1 == f0 {
                    s1
                } else {
                    s0 + (s1 - s0) * (freq - f0) / (f1 - f0)
                }
            }
        }
    }
}
