// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! An arena of [`CFCell`]s, addressed by `(cube, group)`.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use log::trace;

use super::{BaselineClass, CFCell, CellKey, CfError};
use crate::constants::{DEFAULT_FREQ_REL_TOLERANCE, DEFAULT_PA_TOLERANCE_DEG, PI, TAU};

/// How a requested frequency is matched against the frequencies of the
/// stored CFs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FreqResolution {
    /// Narrowband: use whichever stored frequency is closest.
    Nearest,

    /// Wideband: CFs exist per channel, and a requested frequency must be
    /// within `rel_tolerance` (relative) of a stored one.
    PerChannel { rel_tolerance: f64 },
}

impl FreqResolution {
    pub fn per_channel() -> FreqResolution {
        FreqResolution::PerChannel {
            rel_tolerance: DEFAULT_FREQ_REL_TOLERANCE,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    /// \[radians\]
    pub pa_tolerance: f64,
    pub freq_resolution: FreqResolution,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            pa_tolerance: DEFAULT_PA_TOLERANCE_DEG.to_radians(),
            freq_resolution: FreqResolution::Nearest,
        }
    }
}

/// Where a cell lives in a [`CFStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellHandle {
    /// The polarisation bin.
    pub cube: usize,
    /// The index of the `(class, PA, w, freq)` combination.
    pub group: usize,
}

/// Bins are indices into the axes of `class`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct GroupKey {
    pub(crate) class: BaselineClass,
    pub(crate) pa_bin: usize,
    pub(crate) w_bin: usize,
    pub(crate) freq_bin: usize,
}

/// The unique values along one float axis, in insertion order.
#[derive(Debug, Clone, Default)]
struct AxisValues(Vec<f64>);

impl AxisValues {
    fn bin_of(&self, v: f64) -> Option<usize> {
        self.0.iter().position(|x| x.to_bits() == v.to_bits())
    }

    fn bin_or_insert(&mut self, v: f64) -> usize {
        match self.bin_of(v) {
            Some(b) => b,
            None => {
                self.0.push(v);
                self.0.len() - 1
            }
        }
    }

    /// The bin with the smallest `dist`, and that distance.
    fn nearest(&self, dist: impl Fn(f64) -> f64) -> Option<(usize, f64)> {
        self.0
            .iter()
            .enumerate()
            .map(|(i, &v)| (i, dist(v)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }
}

/// The PA, w and frequency values stored for one baseline class.
#[derive(Debug, Clone, Default)]
struct ClassAxes {
    pas: AxisValues,
    ws: AxisValues,
    freqs: AxisValues,
}

/// Holds every CF made so far. Cells are only ever added or wholesale
/// replaced, and are only written between gridding calls; readers borrow the
/// store immutably.
#[derive(Debug, Default)]
pub struct CFStore {
    config: StoreConfig,
    /// Each class is searched along its own axes, so a lookup never lands
    /// on a value that only another class has.
    classes: IndexMap<BaselineClass, ClassAxes>,
    pols: IndexSet<usize>,
    groups: IndexMap<GroupKey, Vec<Option<Arc<CFCell>>>>,
    num_cells: usize,
    generation: u64,
}

impl CFStore {
    pub fn new(config: StoreConfig) -> CFStore {
        CFStore {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Add a cell. If a cell with the same key is already present, an error
    /// is returned unless `overwrite` is set, in which case the old cell is
    /// replaced.
    pub fn insert(&mut self, cell: CFCell, overwrite: bool) -> Result<CellHandle, CfError> {
        let key = cell.key;
        if !overwrite && self.contains(&key) {
            return Err(CfError::Duplicate(key));
        }

        let axes = self.classes.entry(key.class).or_default();
        let group_key = GroupKey {
            class: key.class,
            pa_bin: axes.pas.bin_or_insert(key.pa),
            w_bin: axes.ws.bin_or_insert(key.w),
            freq_bin: axes.freqs.bin_or_insert(key.freq),
        };
        let (cube, _) = self.pols.insert_full(key.pol);

        let entry = self.groups.entry(group_key);
        let group = entry.index();
        let cells = entry.or_default();
        if cells.len() <= cube {
            cells.resize(cube + 1, None);
        }
        if cells[cube].is_none() {
            self.num_cells += 1;
        }
        cells[cube] = Some(Arc::new(cell));
        self.generation += 1;
        trace!("Stored CF ({key}) at cube {cube}, group {group}");

        Ok(CellHandle { cube, group })
    }

    pub fn contains(&self, key: &CellKey) -> bool {
        self.get(key).is_some()
    }

    /// Are all of these cells present?
    pub fn contains_all<'a>(&self, keys: impl IntoIterator<Item = &'a CellKey>) -> bool {
        keys.into_iter().all(|k| self.contains(k))
    }

    /// Get a cell by its exact key.
    pub fn get(&self, key: &CellKey) -> Option<&Arc<CFCell>> {
        let axes = self.classes.get(&key.class)?;
        let group_key = GroupKey {
            class: key.class,
            pa_bin: axes.pas.bin_of(key.pa)?,
            w_bin: axes.ws.bin_of(key.w)?,
            freq_bin: axes.freqs.bin_of(key.freq)?,
        };
        let cube = self.pols.get_index_of(&key.pol)?;
        self.groups.get(&group_key)?.get(cube)?.as_ref()
    }

    /// Resolve a `(cube, group)` pair.
    #[inline]
    pub fn cell_at(&self, cube: usize, group: usize) -> Option<&Arc<CFCell>> {
        self.groups.get_index(group)?.1.get(cube)?.as_ref()
    }

    pub(crate) fn group_of(&self, key: &GroupKey) -> Option<usize> {
        self.groups.get_index_of(key)
    }

    pub fn has_class(&self, class: BaselineClass) -> bool {
        self.classes.contains_key(&class)
    }

    pub fn pol_bin(&self, pol: usize) -> Option<usize> {
        self.pols.get_index_of(&pol)
    }

    /// If only one polarisation has ever been stored, every polarisation
    /// shares it.
    pub fn single_pol(&self) -> Option<usize> {
        match self.pols.len() {
            1 => self.pols.get_index(0).copied(),
            _ => None,
        }
    }

    /// The PA bin of `class` closest to `pa` \[radians\], if it's within
    /// the configured tolerance.
    pub fn nearest_pa(&self, class: BaselineClass, pa: f64) -> Option<usize> {
        let (bin, dist) = self.classes.get(&class)?.pas.nearest(|v| wrapped_angle_diff(pa, v).abs())?;
        if dist <= self.config.pa_tolerance {
            Some(bin)
        } else {
            None
        }
    }

    /// The w-plane of `class` closest to `w` \[wavelengths\]. Planes are matched in
    /// `sqrt(|w|)` space, where they are evenly spaced. A request more than
    /// half a plane spacing beyond the outermost planes doesn't match; with a
    /// single plane, everything matches.
    pub fn nearest_w(&self, class: BaselineClass, w: f64) -> Option<usize> {
        let ws = &self.classes.get(&class)?.ws;
        let sqrt_w = w.abs().sqrt();
        let (bin, dist) = ws.nearest(|v| (v.sqrt() - sqrt_w).abs())?;
        if ws.0.len() == 1 {
            return Some(bin);
        }

        let mut sqrt_planes: Vec<f64> = ws.0.iter().map(|v| v.sqrt()).collect();
        sqrt_planes.sort_unstable_by(f64::total_cmp);
        let chosen = ws.0[bin].sqrt();
        let i = sqrt_planes
            .iter()
            .position(|v| v.to_bits() == chosen.to_bits())
            .unwrap_or_default();
        let below = i.checked_sub(1).map(|j| chosen - sqrt_planes[j]);
        let above = sqrt_planes.get(i + 1).map(|v| v - chosen);
        let spacing = match (below, above) {
            (Some(b), Some(a)) => b.max(a),
            (Some(s), None) | (None, Some(s)) => s,
            (None, None) => return Some(bin),
        };
        if dist <= spacing / 2.0 + f64::EPSILON * chosen.max(1.0) {
            Some(bin)
        } else {
            None
        }
    }

    /// The frequency bin of `class` for `freq` \[Hz\], according to the
    /// configured [`FreqResolution`].
    pub fn nearest_freq(&self, class: BaselineClass, freq: f64) -> Option<usize> {
        let (bin, dist) = self.classes.get(&class)?.freqs.nearest(|v| (v - freq).abs())?;
        match self.config.freq_resolution {
            FreqResolution::Nearest => Some(bin),
            FreqResolution::PerChannel { rel_tolerance } => {
                if dist <= rel_tolerance * freq.abs() {
                    Some(bin)
                } else {
                    None
                }
            }
        }
    }

    /// The populated extents `[n_class, n_pa, n_w, n_freq, n_pol]`. Each
    /// float axis counts the distinct values over all classes.
    pub fn extents(&self) -> [usize; 5] {
        [
            self.classes.len(),
            self.num_distinct(|a| &a.pas),
            self.num_distinct(|a| &a.ws),
            self.num_distinct(|a| &a.freqs),
            self.pols.len(),
        ]
    }

    fn num_distinct<F>(&self, axis: F) -> usize
    where
        F: Fn(&ClassAxes) -> &AxisValues,
    {
        self.classes
            .values()
            .flat_map(|a| axis(a).0.iter().map(|v| v.to_bits()))
            .collect::<IndexSet<u64>>()
            .len()
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// The number of cells stored.
    pub fn len(&self) -> usize {
        self.num_cells
    }

    pub fn is_empty(&self) -> bool {
        self.num_cells == 0
    }

    /// Incremented on every insert. Device-side copies of the store use this
    /// to know when to refresh.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// All cells with their handles, in arena order.
    pub fn cells(&self) -> impl Iterator<Item = (CellHandle, &Arc<CFCell>)> {
        self.groups
            .values()
            .enumerate()
            .flat_map(|(group, cubes)| {
                cubes
                    .iter()
                    .enumerate()
                    .filter_map(move |(cube, c)| c.as_ref().map(|c| (CellHandle { cube, group }, c)))
            })
    }

    /// Remove everything. The configuration is kept.
    pub fn clear(&mut self) {
        let config = self.config;
        let generation = self.generation + 1;
        *self = CFStore::new(config);
        self.generation = generation;
    }
}

/// `a - b`, wrapped into `[-π, π)`.
fn wrapped_angle_diff(a: f64, b: f64) -> f64 {
    (a - b + PI).rem_euclid(TAU) - PI
}
