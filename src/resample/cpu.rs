// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Gridding and degridding on the CPU.
//!
//! Records are split into one contiguous range per thread. Each range is
//! gridded into its own partial grid, and the partials are summed in range
//! order, so results don't depend on scheduling. The sum goes into the
//! accumulator in one step.

use log::{debug, trace};
use marlu::{c32, c64};
use ndarray::prelude::*;
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};

use super::{
    footprint_fits, grid_position, gridding_tap, FluxScaleTable, GridStats, NumPols,
    ResampleDevice, ResampleError, Resampler,
};
use crate::{
    cf::{CFCell, CFStore},
    constants::{MAX_NUM_POLS, MAX_NUM_THREADS},
    grid::{GridAccumulator, GridGeometry, GridShape},
    vis::VisRecord,
};

pub struct ResamplerCpu {
    pool: ThreadPool,
    num_threads: usize,
}

impl ResamplerCpu {
    pub fn new(num_threads: usize) -> Result<ResamplerCpu, ResampleError> {
        let num_threads = num_threads.clamp(1, MAX_NUM_THREADS);
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("resample-{i}"))
            .build()?;
        Ok(ResamplerCpu { pool, num_threads })
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }
}

/// Get the CF of every record, checking that everything each record refers to
/// exists and that its weights are usable.
pub(super) fn resolve_cells<'a>(
    records: &[VisRecord],
    store: &'a CFStore,
    shape: GridShape,
) -> Result<Vec<&'a CFCell>, ResampleError> {
    records
        .iter()
        .map(|r| {
            let inconsistent = |msg: String| ResampleError::InternalInconsistency {
                spw: r.spw,
                chan: r.chan,
                row: r.row,
                msg,
            };
            if let Some(w) = r.weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
                return Err(inconsistent(format!("weight {w} isn't finite and non-negative")));
            }
            if r.grid_cube >= shape.n_chan {
                return Err(inconsistent(format!(
                    "grid channel {} is beyond the {} grid channels",
                    r.grid_cube, shape.n_chan
                )));
            }
            store
                .cell_at(r.cf_index.cube, r.cf_index.group)
                .map(|c| c.as_ref())
                .ok_or_else(|| {
                    inconsistent(format!(
                        "no CF at cube {}, group {} (store has {} groups)",
                        r.cf_index.cube,
                        r.cf_index.group,
                        store.num_groups()
                    ))
                })
        })
        .collect()
}

#[inline]
fn to_c64(v: c32) -> c64 {
    c64::new(f64::from(v.re), f64::from(v.im))
}

fn grid_range<const N: usize>(
    records: &[VisRecord],
    cells: &[&CFCell],
    geometry: &GridGeometry,
    shape: GridShape,
) -> (Array4<c64>, Array2<f64>, GridStats) {
    let mut grid = Array4::zeros(shape.dim());
    let mut sum_weights = Array2::zeros((shape.n_pol, shape.n_chan));
    let mut stats = GridStats::default();

    for (record, cell) in records.iter().zip(cells) {
        let (loc, off) = grid_position(record.uvw, record.freq, geometry, cell.sampling());
        if !footprint_fits(loc, cell, shape.nx, shape.ny) {
            trace!(
                "spw {} row {} chan {} is off the grid",
                record.spw,
                record.row,
                record.chan
            );
            stats.off_grid += 1;
            continue;
        }

        let phasor = c64::cis(record.dephase);
        let mut vals = [c64::default(); N];
        for (p, v) in vals.iter_mut().enumerate() {
            *v = to_c64(record.vis[p]) * f64::from(record.weights[p]) * phasor;
        }
        let negative_w = record.uvw.w < 0.0;
        let support = i64::from(cell.support());
        let chan = record.grid_cube;

        for dy in -support..=support {
            let gy = (loc[1] + dy) as usize;
            for dx in -support..=support {
                let Some((cf, grad)) =
                    gridding_tap(cell, dx, dy, off, negative_w, record.phase_gradient)
                else {
                    continue;
                };
                let t = cf * grad;
                let gx = (loc[0] + dx) as usize;
                for (p, v) in vals.iter().enumerate() {
                    grid[(p, chan, gy, gx)] += v * t;
                }
            }
        }
        for p in 0..N {
            sum_weights[(p, chan)] += f64::from(record.weights[p]);
        }
        stats.gridded += 1;
    }

    (grid, sum_weights, stats)
}

fn degrid_one<const N: usize>(
    record: &VisRecord,
    cell: &CFCell,
    geometry: &GridGeometry,
    grid: ArrayView4<c64>,
    scale: f64,
) -> [c32; MAX_NUM_POLS] {
    let mut out = [c32::default(); MAX_NUM_POLS];
    let (_, _, ny, nx) = grid.dim();
    let (loc, off) = grid_position(record.uvw, record.freq, geometry, cell.sampling());
    if !footprint_fits(loc, cell, nx, ny) {
        return out;
    }

    let negative_w = record.uvw.w < 0.0;
    let support = i64::from(cell.support());
    let chan = record.grid_cube;
    let mut sums = [c64::default(); N];
    let mut norm = c64::default();
    for dy in -support..=support {
        let gy = (loc[1] + dy) as usize;
        for dx in -support..=support {
            let Some((cf, grad)) =
                gridding_tap(cell, dx, dy, off, negative_w, record.phase_gradient)
            else {
                continue;
            };
            let cf = cf.conj();
            let t = cf * grad.conj();
            let gx = (loc[0] + dx) as usize;
            for (p, s) in sums.iter_mut().enumerate() {
                *s += grid[(p, chan, gy, gx)] * t;
            }
            norm += cf;
        }
    }
    if norm == c64::default() {
        return out;
    }

    let phasor = c64::cis(-record.dephase) * scale / norm;
    for (o, s) in out.iter_mut().zip(sums) {
        let v = s * phasor;
        *o = c32::new(v.re as f32, v.im as f32);
    }
    out
}

impl Resampler for ResamplerCpu {
    fn device(&self) -> ResampleDevice {
        ResampleDevice::Cpu
    }

    fn grid(
        &self,
        records: &[VisRecord],
        store: &CFStore,
        geometry: &GridGeometry,
        acc: &mut GridAccumulator,
    ) -> Result<GridStats, ResampleError> {
        let shape = acc.shape();
        let num_pols = NumPols::new(shape.n_pol)?;
        let cells = resolve_cells(records, store, shape)?;
        if records.is_empty() {
            return Ok(GridStats::default());
        }

        let chunk_size = records.len().div_ceil(self.num_threads);
        debug!(
            "Gridding {} records in chunks of {chunk_size} on {} threads",
            records.len(),
            self.num_threads
        );
        let partials: Vec<_> = self.pool.install(|| {
            records
                .par_chunks(chunk_size)
                .zip(cells.par_chunks(chunk_size))
                .map(|(records, cells)| match num_pols {
                    NumPols::One => grid_range::<1>(records, cells, geometry, shape),
                    NumPols::Two => grid_range::<2>(records, cells, geometry, shape),
                    NumPols::Four => grid_range::<4>(records, cells, geometry, shape),
                })
                .collect()
        });

        // Sum the partials first, so the accumulator sees a single update.
        let mut partials = partials.into_iter();
        let Some((mut grid, mut sum_weights, mut stats)) = partials.next() else {
            return Ok(GridStats::default());
        };
        for (partial_grid, partial_weights, partial_stats) in partials {
            grid += &partial_grid;
            sum_weights += &partial_weights;
            stats += partial_stats;
        }
        acc.accumulate(grid.view(), sum_weights.view())?;
        Ok(stats)
    }

    fn degrid(
        &self,
        records: &[VisRecord],
        store: &CFStore,
        geometry: &GridGeometry,
        acc: &GridAccumulator,
        flux: Option<&FluxScaleTable>,
    ) -> Result<Vec<[c32; MAX_NUM_POLS]>, ResampleError> {
        let shape = acc.shape();
        let num_pols = NumPols::new(shape.n_pol)?;
        let cells = resolve_cells(records, store, shape)?;
        let grid = acc.grid();

        let predictions = self.pool.install(|| {
            records
                .par_iter()
                .zip(cells.par_iter())
                .map(|(record, cell)| {
                    let scale = flux.map(|f| f.scale_at(record.freq)).unwrap_or(1.0);
                    match num_pols {
                        NumPols::One => degrid_one::<1>(record, cell, geometry, grid, scale),
                        NumPols::Two => degrid_one::<2>(record, cell, geometry, grid, scale),
                        NumPols::Four => degrid_one::<4>(record, cell, geometry, grid, scale),
                    }
                })
                .collect()
        });
        Ok(predictions)
    }
}
