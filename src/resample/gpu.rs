// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Gridding and degridding on a CUDA or HIP device.
//!
//! Grid positions and footprint checks are done on the host, so the kernels
//! only see records that land on the grid. The CF store is copied to the
//! device once and refreshed only when its generation changes.

use std::{collections::HashMap, ffi::c_int};

use log::debug;
use marlu::{c32, c64};
use ndarray::prelude::*;
use parking_lot::Mutex;

use super::{
    cpu::resolve_cells, footprint_fits, grid_position, FluxScaleTable, GridStats, NumPols,
    ResampleDevice, ResampleError, Resampler,
};
use crate::{
    cf::{CFCell, CFStore},
    constants::MAX_NUM_POLS,
    gpu::{
        self, gpu_kernel_call, DevicePointer, GpuCfCell, GpuError, GpuGridShape, GpuVisRecord,
    },
    grid::{GridAccumulator, GridGeometry, GridShape},
    vis::VisRecord,
};

/// The CF store as it was last copied to the device.
#[derive(Default)]
struct DeviceStore {
    /// The address and generation of the store that was copied.
    source: Option<(usize, u64)>,
    /// `(cube, group)` to index into `d_cells`.
    cell_indices: HashMap<(usize, usize), i32>,
    d_pixels: DevicePointer<f32>,
    d_cells: DevicePointer<GpuCfCell>,
}

#[derive(Default)]
struct DeviceState {
    store: DeviceStore,
    d_grid: DevicePointer<f64>,
    d_records: DevicePointer<GpuVisRecord>,
}

pub struct ResamplerGpu {
    state: Mutex<DeviceState>,
}

impl ResamplerGpu {
    /// Check that a device is usable and set up empty device buffers.
    pub fn new() -> Result<ResamplerGpu, ResampleError> {
        gpu::get_device_info()?;
        Ok(ResamplerGpu {
            state: Mutex::new(DeviceState::default()),
        })
    }
}

impl DeviceStore {
    fn refresh(&mut self, store: &CFStore) -> Result<(), GpuError> {
        let source = (store as *const CFStore as usize, store.generation());
        if self.source == Some(source) {
            return Ok(());
        }

        let mut pixels = vec![];
        let mut cells = vec![];
        self.cell_indices.clear();
        for (handle, cell) in store.cells() {
            let (ny, nx) = cell.pixels().dim();
            self.cell_indices
                .insert((handle.cube, handle.group), cells.len() as i32);
            cells.push(GpuCfCell {
                offset: (pixels.len() / 2) as u64,
                nx: nx as i32,
                ny: ny as i32,
                sampling: cell.sampling() as i32,
                support: cell.support() as i32,
            });
            pixels.extend(cell.pixels().iter().flat_map(|p| [p.re, p.im]));
        }
        debug!(
            "Copying {} CFs ({} MiB) to the device",
            cells.len(),
            pixels.len() * std::mem::size_of::<f32>() / 1048576
        );
        self.d_pixels.overwrite(&pixels)?;
        self.d_cells.overwrite(&cells)?;
        self.source = Some(source);
        Ok(())
    }
}

fn gpu_shape(shape: GridShape) -> GpuGridShape {
    GpuGridShape {
        n_pol: shape.n_pol as i32,
        n_chan: shape.n_chan as i32,
        ny: shape.ny as i32,
        nx: shape.nx as i32,
    }
}

#[track_caller]
fn num_records(n: usize) -> Result<c_int, GpuError> {
    c_int::try_from(n).map_err(|_| {
        let location = std::panic::Location::caller();
        GpuError::Generic {
            msg: format!("Too many records ({n}) for one kernel call").into(),
            file: location.file(),
            line: location.line(),
        }
    })
}

/// Convert records that fit on the grid. Returns the device records and the
/// index of each in `records`.
fn device_records(
    records: &[VisRecord],
    cells: &[&CFCell],
    geometry: &GridGeometry,
    shape: GridShape,
    store: &DeviceStore,
) -> Result<(Vec<GpuVisRecord>, Vec<usize>), ResampleError> {
    let mut out = Vec::with_capacity(records.len());
    let mut indices = Vec::with_capacity(records.len());
    for (i, (record, cell)) in records.iter().zip(cells).enumerate() {
        let (loc, off) = grid_position(record.uvw, record.freq, geometry, cell.sampling());
        if !footprint_fits(loc, cell, shape.nx, shape.ny) {
            continue;
        }
        let index = store
            .cell_indices
            .get(&(record.cf_index.cube, record.cf_index.group))
            .copied()
            .ok_or_else(|| ResampleError::InternalInconsistency {
                spw: record.spw,
                chan: record.chan,
                row: record.row,
                msg: "CF isn't on the device".into(),
            })?;
        let mut vis = [0.0; 8];
        for (p, v) in record.vis.iter().enumerate() {
            vis[2 * p] = v.re;
            vis[2 * p + 1] = v.im;
        }
        out.push(GpuVisRecord::new(
            vis,
            record.weights,
            record.dephase,
            record.phase_gradient,
            [loc[0] as i32, loc[1] as i32],
            [off[0] as i32, off[1] as i32],
            index,
            record.grid_cube as i32,
            record.uvw.w < 0.0,
        ));
        indices.push(i);
    }
    Ok((out, indices))
}

impl Resampler for ResamplerGpu {
    fn device(&self) -> ResampleDevice {
        ResampleDevice::Gpu
    }

    fn grid(
        &self,
        records: &[VisRecord],
        store: &CFStore,
        geometry: &GridGeometry,
        acc: &mut GridAccumulator,
    ) -> Result<GridStats, ResampleError> {
        let shape = acc.shape();
        let num_pols = NumPols::new(shape.n_pol)?.get();
        let cells = resolve_cells(records, store, shape)?;
        if records.is_empty() {
            return Ok(GridStats::default());
        }

        let mut state = self.state.lock();
        let state = &mut *state;
        state.store.refresh(store)?;
        let (d_records, indices) = device_records(records, &cells, geometry, shape, &state.store)?;
        let stats = GridStats {
            gridded: d_records.len(),
            off_grid: records.len() - d_records.len(),
        };
        if d_records.is_empty() {
            return Ok(stats);
        }

        let (n_pol, n_chan, ny, nx) = shape.dim();
        let grid_len = n_pol * n_chan * ny * nx * 2;
        state
            .d_grid
            .realloc(grid_len * std::mem::size_of::<f64>())?;
        state.d_grid.clear();
        state.d_records.overwrite(&d_records)?;
        gpu_kernel_call!(
            gpu::grid_records,
            state.d_records.get(),
            num_records(d_records.len())?,
            state.store.d_pixels.get(),
            state.store.d_cells.get(),
            gpu_shape(shape),
            state.d_grid.get_mut(),
        )?;

        let mut flat = vec![0.0; grid_len];
        state.d_grid.copy_from_device(&mut flat)?;
        let mut grid = Array4::zeros(shape.dim());
        for (g, c) in grid.iter_mut().zip(flat.chunks_exact(2)) {
            *g = c64::new(c[0], c[1]);
        }

        let mut sum_weights = Array2::zeros((n_pol, n_chan));
        for &i in &indices {
            let record = &records[i];
            for p in 0..num_pols {
                sum_weights[(p, record.grid_cube)] += f64::from(record.weights[p]);
            }
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
        NumPols::new(shape.n_pol)?;
        let cells = resolve_cells(records, store, shape)?;
        let mut predictions = vec![[c32::default(); MAX_NUM_POLS]; records.len()];

        let mut state = self.state.lock();
        let state = &mut *state;
        state.store.refresh(store)?;
        let (d_records, indices) = device_records(records, &cells, geometry, shape, &state.store)?;
        if d_records.is_empty() {
            return Ok(predictions);
        }

        let flat: Vec<f64> = acc.grid().iter().flat_map(|g| [g.re, g.im]).collect();
        state.d_grid.overwrite(&flat)?;
        state.d_records.overwrite(&d_records)?;
        let scales: Vec<f64> = indices
            .iter()
            .map(|&i| flux.map(|f| f.scale_at(records[i].freq)).unwrap_or(1.0))
            .collect();
        let d_scales = DevicePointer::copy_to_device(&scales)?;
        let mut d_out: DevicePointer<f32> =
            DevicePointer::malloc(d_records.len() * 2 * MAX_NUM_POLS * std::mem::size_of::<f32>())?;
        gpu_kernel_call!(
            gpu::degrid_records,
            state.d_records.get(),
            num_records(d_records.len())?,
            state.store.d_pixels.get(),
            state.store.d_cells.get(),
            gpu_shape(shape),
            state.d_grid.get(),
            d_scales.get(),
            d_out.get_mut(),
        )?;

        let mut out = vec![0.0; d_records.len() * 2 * MAX_NUM_POLS];
        d_out.copy_from_device(&mut out)?;
        for (&i, o) in indices.iter().zip(out.chunks_exact(2 * MAX_NUM_POLS)) {
            for (p, v) in predictions[i].iter_mut().enumerate() {
                *v = c32::new(o[2 * p], o[2 * p + 1]);
            }
        }
        Ok(predictions)
    }
}
