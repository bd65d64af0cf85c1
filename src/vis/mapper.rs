// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Turn the contents of a [`VisBuffer`] into [`VisRecord`]s.

use marlu::{c32, UVW};

use super::{ChanMap, ImagingMode, PolMap, VisBuffer, VisRecord};
use crate::{
    cf::{BaselineClass, CFIndexer, CfError},
    constants::{MAX_NUM_POLS, TAU, VEL_C},
    grid::{GridGeometry, GridShape},
};

/// Counts of what happened while mapping a buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MapStats {
    pub rows: usize,
    pub rows_flagged: usize,
    /// `(row, chan)` samples that were unflagged but produced nothing
    /// (zero weight, unmapped channel, or nothing left after pol mapping).
    pub samples_dropped: usize,
    pub records: usize,
}

impl std::ops::AddAssign for MapStats {
    fn add_assign(&mut self, rhs: Self) {
        self.rows += rhs.rows;
        self.rows_flagged += rhs.rows_flagged;
        self.samples_dropped += rhs.samples_dropped;
        self.records += rhs.records;
    }
}

#[derive(Debug, Clone)]
pub struct VisToDeviceMapper {
    mode: ImagingMode,
    n_chan: usize,
    n_pol: usize,
    uv_scale: [f64; 2],
}

impl VisToDeviceMapper {
    pub fn new(mode: ImagingMode, shape: GridShape, geometry: &GridGeometry) -> VisToDeviceMapper {
        VisToDeviceMapper {
            mode,
            n_chan: shape.n_chan,
            n_pol: shape.n_pol.min(MAX_NUM_POLS),
            uv_scale: geometry.uv_scale(),
        }
    }

    pub fn mode(&self) -> ImagingMode {
        self.mode
    }

    /// Lazily produce a record for every usable `(row, chan)` of `vb`. Each
    /// record has its CF resolved through `indexer`; a CF that can't be found
    /// is yielded as an error, and iteration can continue past it.
    pub fn map<'a, B: VisBuffer + ?Sized>(
        &'a self,
        vb: &'a B,
        chan_map: &'a ChanMap,
        pol_map: &'a PolMap,
        indexer: CFIndexer<'a>,
    ) -> MappedRecords<'a, B> {
        MappedRecords {
            mapper: self,
            vb,
            chan_map,
            pol_map,
            indexer,
            row: 0,
            chan: 0,
            stats: MapStats::default(),
        }
    }
}

/// The iterator returned by [`VisToDeviceMapper::map`].
pub struct MappedRecords<'a, B: ?Sized> {
    mapper: &'a VisToDeviceMapper,
    vb: &'a B,
    chan_map: &'a ChanMap,
    pol_map: &'a PolMap,
    indexer: CFIndexer<'a>,
    row: usize,
    chan: usize,
    stats: MapStats,
}

impl<B: VisBuffer + ?Sized> MappedRecords<'_, B> {
    pub fn stats(&self) -> MapStats {
        self.stats
    }

    fn record(&self, row: usize, chan: usize) -> Option<Result<VisRecord, CfError>> {
        let vb = self.vb;
        let mode = self.mapper.mode;

        let weight = vb.imaging_weight(row, chan);
        if weight <= 0.0 || !weight.is_finite() {
            return None;
        }
        let grid_cube = self
            .chan_map
            .target(chan)
            .filter(|&c| c < self.mapper.n_chan)?;

        let mut vis = [c32::default(); MAX_NUM_POLS];
        let mut weights = [0.0; MAX_NUM_POLS];
        let mut first_pol = None;
        for pol in 0..vb.num_pols() {
            let Some(slot) = self.pol_map.target(pol).filter(|&t| t < self.mapper.n_pol) else {
                continue;
            };
            // Flagged pols keep zeroes in their slot.
            if vb.flag(row, chan, pol) {
                continue;
            }
            vis[slot] = match mode {
                ImagingMode::Residual => vb.vis(row, chan, pol),
                ImagingMode::Psf | ImagingMode::Weight => c32::new(1.0, 0.0),
            };
            weights[slot] = weight;
            first_pol.get_or_insert(slot);
        }
        let first_pol = first_pol?;

        let freq = vb.chan_freqs()[chan];
        let uvw = match mode {
            ImagingMode::Weight => UVW {
                u: 0.0,
                v: 0.0,
                w: 0.0,
            },
            ImagingMode::Residual | ImagingMode::Psf => vb.uvw(row),
        };
        let class = BaselineClass::from_antenna_types(
            vb.antenna_type(vb.antenna1(row)),
            vb.antenna_type(vb.antenna2(row)),
        );
        let store = self.indexer.store();
        let cf_pol = store.single_pol().unwrap_or(first_pol);
        let cf_index = match self.indexer.index(
            class,
            vb.parallactic_angle(),
            uvw.w * freq / VEL_C,
            freq,
            cf_pol,
        ) {
            Ok(i) => i,
            Err(e) => return Some(Err(e)),
        };

        let dephase = match mode {
            ImagingMode::Residual => -TAU * vb.delay(row) * freq / VEL_C,
            ImagingMode::Psf | ImagingMode::Weight => 0.0,
        };
        let phase_gradient = vb
            .pointing_offset(row)
            .map(|[l, m]| {
                [
                    TAU * l / self.mapper.uv_scale[0],
                    TAU * m / self.mapper.uv_scale[1],
                ]
            })
            .unwrap_or_default();

        Some(Ok(VisRecord {
            vis,
            weights,
            freq,
            dephase,
            uvw,
            grid_cube,
            cf_index,
            phase_gradient,
            spw: vb.spw(),
            row,
            chan,
        }))
    }
}

impl<B: VisBuffer + ?Sized> Iterator for MappedRecords<'_, B> {
    type Item = Result<VisRecord, CfError>;

    fn next(&mut self) -> Option<Self::Item> {
        let num_rows = self.vb.num_rows();
        let num_chans = self.vb.num_chans();
        while self.row < num_rows {
            let row = self.row;
            if self.chan == 0 {
                self.stats.rows += 1;
                if self.vb.row_flag(row) {
                    self.stats.rows_flagged += 1;
                    self.row += 1;
                    continue;
                }
            }
            if self.chan >= num_chans {
                self.row += 1;
                self.chan = 0;
                continue;
            }

            let chan = self.chan;
            self.chan += 1;
            match self.record(row, chan) {
                Some(r) => {
                    if r.is_ok() {
                        self.stats.records += 1;
                    }
                    return Some(r);
                }
                None => self.stats.samples_dropped += 1,
            }
        }
        None
    }
}
