// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Resolve the physical parameters of a visibility to a CF.

use std::sync::Arc;

use super::{store::GroupKey, BaselineClass, CFCell, CFStore, CfAxis, CfError};

/// The bins of a CF along each store axis, and where it lives in the arena.
/// The PA, w and frequency bins count within `class`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CFIndex {
    pub class: BaselineClass,
    pub pa_bin: usize,
    pub w_bin: usize,
    pub freq_bin: usize,
    pub pol_bin: usize,

    /// Equal to `pol_bin`.
    pub cube: usize,
    pub group: usize,
}

/// Looks up CFs in a borrowed [`CFStore`]. Holds no state of its own.
#[derive(Debug, Clone, Copy)]
pub struct CFIndexer<'a> {
    store: &'a CFStore,
}

impl<'a> CFIndexer<'a> {
    pub fn new(store: &'a CFStore) -> CFIndexer<'a> {
        CFIndexer { store }
    }

    pub fn store(&self) -> &'a CFStore {
        self.store
    }

    /// Get the [`CFIndex`] of the CF for a visibility.
    ///
    /// `pa`: Parallactic angle \[radians\]
    ///
    /// `w_lambda`: \[wavelengths\]; the sign is ignored.
    ///
    /// `freq`: \[Hz\]
    pub fn index(
        &self,
        class: BaselineClass,
        pa: f64,
        w_lambda: f64,
        freq: f64,
        pol: usize,
    ) -> Result<CFIndex, CfError> {
        let missing = |axis, requested| CfError::Missing {
            class,
            axis,
            requested,
        };

        if !self.store.has_class(class) {
            return Err(missing(CfAxis::BaselineClass, f64::NAN));
        }
        let pol_bin = self
            .store
            .pol_bin(pol)
            .ok_or_else(|| missing(CfAxis::Polarisation, pol as f64))?;
        let pa_bin = self
            .store
            .nearest_pa(class, pa)
            .ok_or_else(|| missing(CfAxis::ParallacticAngle, pa))?;
        let w_bin = self
            .store
            .nearest_w(class, w_lambda)
            .ok_or_else(|| missing(CfAxis::W, w_lambda))?;
        let freq_bin = self
            .store
            .nearest_freq(class, freq)
            .ok_or_else(|| missing(CfAxis::Frequency, freq))?;

        let group = self
            .store
            .group_of(&GroupKey {
                class,
                pa_bin,
                w_bin,
                freq_bin,
            })
            .ok_or_else(|| missing(CfAxis::Group, freq))?;
        // The group may exist without this polarisation.
        if self.store.cell_at(pol_bin, group).is_none() {
            return Err(missing(CfAxis::Polarisation, pol as f64));
        }

        Ok(CFIndex {
            class,
            pa_bin,
            w_bin,
            freq_bin,
            pol_bin,
            cube: pol_bin,
            group,
        })
    }
}

impl CFStore {
    /// Find the CF for a visibility. Repeated lookups with the same arguments
    /// return the same `Arc`.
    pub fn lookup(
        &self,
        class: BaselineClass,
        pa: f64,
        w_lambda: f64,
        freq: f64,
        pol: usize,
    ) -> Result<Arc<CFCell>, CfError> {
        let index = CFIndexer::new(self).index(class, pa, w_lambda, freq, pol)?;
        self.cell_at(index.cube, index.group)
            .cloned()
            .ok_or(CfError::Missing {
                class,
                axis: CfAxis::Group,
                requested: freq,
            })
    }
}
