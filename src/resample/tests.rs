// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use approx::{assert_abs_diff_eq, assert_relative_eq};
use marlu::{c32, c64, UVW};
use ndarray::prelude::*;
use serial_test::serial;

use super::*;
use crate::{
    cf::{AntennaType, BaselineClass, CFCell, CFIndexer, CFStore, CellKey, StoreConfig},
    grid::{GridAccumulator, GridGeometry, GridShape},
    vis::{MemVisBuffer, VisBuffer},
};

// With this frequency, UVWs in metres are UVWs in wavelengths.
const FREQ: f64 = VEL_C;

const CLASS: BaselineClass = BaselineClass::Homogeneous(AntennaType(0));

/// One grid pixel per wavelength, with the uv origin at pixel (8, 8).
fn geometry() -> GridGeometry {
    GridGeometry {
        nx: 16,
        ny: 16,
        cell_size: 1.0 / 16.0,
    }
}

fn shape(n_pol: usize) -> GridShape {
    GridShape {
        n_pol,
        n_chan: 1,
        ny: 16,
        nx: 16,
    }
}

fn key(pol: usize) -> CellKey {
    CellKey {
        class: CLASS,
        pa: 0.0,
        w: 0.0,
        freq: FREQ,
        pol,
    }
}

fn identity_store() -> CFStore {
    let mut store = CFStore::new(StoreConfig::default());
    store.insert(CFCell::identity(key(0)), false).unwrap();
    store
}

/// A complex, asymmetric CF with support 1 and sampling 2.
fn ramp_store() -> CFStore {
    let pixels = Array2::from_shape_fn((5, 5), |(y, x)| {
        c32::new(1.0 + 0.1 * x as f32, 0.05 * y as f32 - 0.1)
    });
    let mut store = CFStore::new(StoreConfig::default());
    store
        .insert(CFCell::new(key(0), pixels, 2, 1).unwrap(), false)
        .unwrap();
    store
}

fn record(store: &CFStore, uvw: UVW, vis: c32, weight: f32) -> VisRecord {
    let cf_index = CFIndexer::new(store)
        .index(CLASS, 0.0, uvw.w, FREQ, 0)
        .unwrap();
    VisRecord {
        vis: [vis, c32::default(), c32::default(), c32::default()],
        weights: [weight, 0.0, 0.0, 0.0],
        freq: FREQ,
        dephase: 0.0,
        uvw,
        grid_cube: 0,
        cf_index,
        phase_gradient: [0.0, 0.0],
        spw: 0,
        row: 0,
        chan: 0,
    }
}

fn assert_c64_eq(a: c64, b: c64, epsilon: f64) {
    assert_abs_diff_eq!(a.re, b.re, epsilon = epsilon);
    assert_abs_diff_eq!(a.im, b.im, epsilon = epsilon);
}

fn uvw(u: f64, v: f64, w: f64) -> UVW {
    UVW { u, v, w }
}

#[test]
fn grid_positions() {
    let g = geometry();
    assert_eq!(grid_position(uvw(0.0, 0.0, 0.0), FREQ, &g, 1), ([8, 8], [0, 0]));
    assert_eq!(grid_position(uvw(2.0, -3.0, 0.0), FREQ, &g, 1), ([10, 5], [0, 0]));
    // Halfway between pixels rounds to even, and the offset along with it.
    assert_eq!(grid_position(uvw(0.5, 0.0, 0.0), FREQ, &g, 1), ([8, 8], [0, 0]));
    assert_eq!(grid_position(uvw(0.5, 0.0, 0.0), FREQ, &g, 4), ([8, 8], [-2, 0]));
    assert_eq!(grid_position(uvw(1.3, 0.2, 0.0), FREQ, &g, 10), ([9, 8], [-3, -2]));
    // Frequency scales UVWs.
    assert_eq!(grid_position(uvw(1.0, 1.0, 0.0), 2.0 * FREQ, &g, 1), ([10, 10], [0, 0]));
}

#[test]
fn identity_cfs_round_trip() {
    let store = identity_store();
    let g = geometry();
    let records = [
        record(&store, uvw(0.0, 0.0, 0.0), c32::new(1.0, 2.0), 1.0),
        record(&store, uvw(3.0, -2.0, 5.0), c32::new(-0.5, 0.25), 1.0),
        record(&store, uvw(-7.0, 6.0, -1.0), c32::new(4.0, 0.0), 1.0),
    ];
    let r = ResamplerCpu::new(2).unwrap();
    let mut acc = GridAccumulator::new(shape(1)).unwrap();
    let stats = r.grid(&records, &store, &g, &mut acc).unwrap();
    assert_eq!(
        stats,
        GridStats {
            gridded: 3,
            off_grid: 0
        }
    );

    let grid = acc.grid();
    assert_eq!(grid[(0, 0, 8, 8)], c64::new(1.0, 2.0));
    assert_eq!(grid[(0, 0, 6, 11)], c64::new(-0.5, 0.25));
    assert_eq!(grid[(0, 0, 14, 1)], c64::new(4.0, 0.0));
    assert_eq!(grid.iter().filter(|v| **v != c64::default()).count(), 3);
    assert_abs_diff_eq!(acc.sum_weight(0, 0).unwrap(), 3.0);

    let predictions = r.degrid(&records, &store, &g, &acc, None).unwrap();
    for (rec, p) in records.iter().zip(predictions) {
        assert_abs_diff_eq!(p[0].re, rec.vis[0].re);
        assert_abs_diff_eq!(p[0].im, rec.vis[0].im);
        assert_eq!(p[1], c32::default());
    }
}

#[test]
fn weights_are_conserved() {
    let store = ramp_store();
    let records: Vec<_> = (0..37)
        .map(|i| {
            let x = i as f64;
            record(
                &store,
                uvw((0.7 * x).sin() * 4.0, (0.3 * x).cos() * 4.0, 0.0),
                c32::new(1.0, 0.0),
                0.5,
            )
        })
        .collect();
    let r = ResamplerCpu::new(1).unwrap();
    let mut acc = GridAccumulator::new(shape(1)).unwrap();
    r.grid(&records, &store, &geometry(), &mut acc).unwrap();
    assert_eq!(acc.sum_weight(0, 0).unwrap(), 37.0 * 0.5);
}

#[test]
fn thread_count_does_not_change_the_grid() {
    let store = ramp_store();
    let records: Vec<_> = (0..500)
        .map(|i| {
            let x = i as f64;
            let mut r = record(
                &store,
                uvw((1.3 * x).sin() * 5.0, (0.9 * x).sin() * 5.0, (0.1 * x).cos()),
                c32::new((0.2 * x).cos() as f32, (0.4 * x).sin() as f32),
                1.0 + (i % 3) as f32,
            );
            r.dephase = 0.01 * x;
            r.phase_gradient = [0.02, -0.01];
            r
        })
        .collect();

    let g = geometry();
    let mut acc1 = GridAccumulator::new(shape(1)).unwrap();
    let mut acc4 = GridAccumulator::new(shape(1)).unwrap();
    ResamplerCpu::new(1)
        .unwrap()
        .grid(&records, &store, &g, &mut acc1)
        .unwrap();
    ResamplerCpu::new(4)
        .unwrap()
        .grid(&records, &store, &g, &mut acc4)
        .unwrap();

    for (a, b) in acc1.grid().iter().zip(acc4.grid().iter()) {
        assert_relative_eq!(a.re, b.re, max_relative = 1e-5, epsilon = 1e-9);
        assert_relative_eq!(a.im, b.im, max_relative = 1e-5, epsilon = 1e-9);
    }
    assert_relative_eq!(
        acc1.sum_weight(0, 0).unwrap(),
        acc4.sum_weight(0, 0).unwrap(),
        max_relative = 1e-12
    );
}

#[test]
fn off_grid_records_are_skipped() {
    let store = ramp_store();
    // The footprint of a record at the edge pixel hangs off the grid.
    let records = [
        record(&store, uvw(-8.0, 0.0, 0.0), c32::new(1.0, 0.0), 1.0),
        record(&store, uvw(100.0, 0.0, 0.0), c32::new(1.0, 0.0), 1.0),
        record(&store, uvw(6.0, 6.0, 0.0), c32::new(1.0, 0.0), 1.0),
    ];
    let r = ResamplerCpu::new(1).unwrap();
    let mut acc = GridAccumulator::new(shape(1)).unwrap();
    let stats = r.grid(&records, &store, &geometry(), &mut acc).unwrap();
    assert_eq!(
        stats,
        GridStats {
            gridded: 1,
            off_grid: 2
        }
    );
    assert_abs_diff_eq!(acc.sum_weight(0, 0).unwrap(), 1.0);

    let predictions = r.degrid(&records, &store, &geometry(), &acc, None).unwrap();
    assert_eq!(predictions[0][0], c32::default());
    assert_eq!(predictions[1][0], c32::default());
}

#[test]
fn negative_w_grids_the_conjugate() {
    let store = ramp_store();
    let g = geometry();
    let r = ResamplerCpu::new(1).unwrap();
    let pos = [record(&store, uvw(0.0, 0.0, 1.0), c32::new(1.0, 0.0), 1.0)];
    let neg = [record(&store, uvw(0.0, 0.0, -1.0), c32::new(1.0, 0.0), 1.0)];

    let mut acc_pos = GridAccumulator::new(shape(1)).unwrap();
    let mut acc_neg = GridAccumulator::new(shape(1)).unwrap();
    r.grid(&pos, &store, &g, &mut acc_pos).unwrap();
    r.grid(&neg, &store, &g, &mut acc_neg).unwrap();

    // The record sits on a pixel centre, so taps are the CF's integer pixels.
    let cell = store.cell_at(0, 0).unwrap();
    let cf = cell.tap(1, -1, [0, 0]).unwrap();
    assert_abs_diff_eq!(acc_pos.grid()[(0, 0, 7, 9)].im, -f64::from(cf.im));
    assert_abs_diff_eq!(acc_neg.grid()[(0, 0, 7, 9)].im, f64::from(cf.im));
    for (a, b) in acc_pos.grid().iter().zip(acc_neg.grid().iter()) {
        assert_c64_eq(*a, b.conj(), 0.0);
    }
}

#[test]
fn dephasing_and_phase_gradients() {
    let mut store = CFStore::new(StoreConfig::default());
    store
        .insert(
            CFCell::new(key(0), Array2::from_elem((3, 3), c32::new(1.0, 0.0)), 1, 1).unwrap(),
            false,
        )
        .unwrap();
    let g = geometry();
    let r = ResamplerCpu::new(1).unwrap();

    let mut rec = record(&store, uvw(0.0, 0.0, 0.0), c32::new(2.0, 0.0), 1.0);
    rec.dephase = 0.5;
    rec.phase_gradient = [0.3, 0.0];
    let mut acc = GridAccumulator::new(shape(1)).unwrap();
    r.grid(&[rec], &store, &g, &mut acc).unwrap();

    let grid = acc.grid();
    let expected = |phase: f64| c64::from_polar(2.0, phase);
    assert_c64_eq(grid[(0, 0, 8, 8)], expected(0.5), 1e-12);
    assert_c64_eq(grid[(0, 0, 8, 9)], expected(0.8), 1e-12);
    assert_c64_eq(grid[(0, 0, 8, 7)], expected(0.2), 1e-12);
    assert_c64_eq(grid[(0, 0, 9, 9)], expected(0.8), 1e-12);

    // Degridding undoes both.
    let p = r.degrid(&[rec], &store, &g, &acc, None).unwrap();
    assert_abs_diff_eq!(p[0][0].re, 2.0, epsilon = 1e-6);
    assert_abs_diff_eq!(p[0][0].im, 0.0, epsilon = 1e-6);
}

#[test]
fn unresolvable_records_are_inconsistent() {
    let store = identity_store();
    let mut rec = record(&store, uvw(0.0, 0.0, 0.0), c32::new(1.0, 0.0), 1.0);
    rec.cf_index.group = 99;
    rec.spw = 3;
    rec.row = 17;
    rec.chan = 2;
    let good = record(&store, uvw(1.0, 0.0, 0.0), c32::new(1.0, 0.0), 1.0);

    let r = ResamplerCpu::new(1).unwrap();
    let mut acc = GridAccumulator::new(shape(1)).unwrap();
    let result = r.grid(&[good, rec], &store, &geometry(), &mut acc);
    assert!(matches!(
        result,
        Err(ResampleError::InternalInconsistency {
            spw: 3,
            chan: 2,
            row: 17,
            ..
        })
    ));
    // Nothing was gridded.
    assert!(acc.sum_weight(0, 0).is_none());

    let mut rec = good;
    rec.grid_cube = 1;
    assert!(matches!(
        r.grid(&[rec], &store, &geometry(), &mut acc),
        Err(ResampleError::InternalInconsistency { .. })
    ));

    let mut acc = GridAccumulator::new(shape(3)).unwrap();
    assert!(matches!(
        r.grid(&[good], &store, &geometry(), &mut acc),
        Err(ResampleError::UnsupportedPols(3))
    ));
}

#[test]
fn failed_gridding_leaves_the_grid_alone() {
    let store = identity_store();
    let good = record(&store, uvw(1.0, 0.0, 0.0), c32::new(1.0, 0.0), 2.0);
    let bad = record(&store, uvw(-1.0, 0.0, 0.0), c32::new(1.0, 0.0), -3.0);
    let mut nan = bad;
    nan.weights[0] = f32::NAN;

    for num_threads in [1, 2] {
        let r = ResamplerCpu::new(num_threads).unwrap();
        for records in [[good, bad], [good, nan]] {
            let mut acc = GridAccumulator::new(shape(1)).unwrap();
            let result = r.grid(&records, &store, &geometry(), &mut acc);
            assert!(
                matches!(result, Err(ResampleError::InternalInconsistency { .. })),
                "{num_threads} threads: {result:?}"
            );
            assert_eq!(acc.sum_weights()[(0, 0)], 0.0);
            assert!(acc.grid().iter().all(|v| *v == c64::default()));
        }
    }
}

#[test]
fn flux_scales_are_interpolated() {
    let entries = vec![(200.0, 4.0), (100.0, 2.0), (150.0, 3.0)];
    let nearest = FluxScaleTable::new(entries.clone(), FluxInterp::Nearest).unwrap();
    assert_eq!(nearest.entries()[0], (100.0, 2.0));
    assert_abs_diff_eq!(nearest.scale_at(50.0), 2.0);
    assert_abs_diff_eq!(nearest.scale_at(110.0), 2.0);
    assert_abs_diff_eq!(nearest.scale_at(140.0), 3.0);
    assert_abs_diff_eq!(nearest.scale_at(125.0), 2.0);
    assert_abs_diff_eq!(nearest.scale_at(1000.0), 4.0);

    let linear = FluxScaleTable::new(entries, FluxInterp::Linear).unwrap();
    assert_abs_diff_eq!(linear.scale_at(50.0), 2.0);
    assert_abs_diff_eq!(linear.scale_at(125.0), 2.5);
    assert_abs_diff_eq!(linear.scale_at(175.0), 3.5);
    assert_abs_diff_eq!(linear.scale_at(150.0), 3.0);
    assert_abs_diff_eq!(linear.scale_at(250.0), 4.0);

    let single = FluxScaleTable::new(vec![(100.0, 0.5)], FluxInterp::Linear).unwrap();
    assert_abs_diff_eq!(single.scale_at(1.0), 0.5);
    assert_abs_diff_eq!(single.scale_at(1e9), 0.5);

    assert_eq!(
        FluxScaleTable::new(vec![], FluxInterp::Nearest),
        Err(FluxScaleError::Empty)
    );
    assert!(matches!(
        FluxScaleTable::new(vec![(1.0, 1.0), (f64::NAN, 1.0)], FluxInterp::Nearest),
        Err(FluxScaleError::NotFinite { index: 1, .. })
    ));
}

#[test]
fn degridding_applies_the_flux_scale() {
    let store = identity_store();
    let g = geometry();
    let records = [record(&store, uvw(1.0, 1.0, 0.0), c32::new(1.0, -1.0), 1.0)];
    let r = ResamplerCpu::new(1).unwrap();
    let mut acc = GridAccumulator::new(shape(1)).unwrap();
    r.grid(&records, &store, &g, &mut acc).unwrap();

    let flux = FluxScaleTable::new(vec![(FREQ, 3.0)], FluxInterp::Nearest).unwrap();
    let p = r.degrid(&records, &store, &g, &acc, Some(&flux)).unwrap();
    assert_abs_diff_eq!(p[0][0].re, 3.0);
    assert_abs_diff_eq!(p[0][0].im, -3.0);
}

#[test]
fn predictions_are_written_through_the_pol_map() {
    let store = identity_store();
    let vis = Array3::zeros((2, 1, 2));
    let mut vb =
        MemVisBuffer::new(0, vec![FREQ], vis, vec![uvw(0.0, 0.0, 0.0); 2]).unwrap();
    let mut records = [
        record(&store, uvw(0.0, 0.0, 0.0), c32::new(1.0, 0.0), 1.0),
        record(&store, uvw(0.0, 0.0, 0.0), c32::new(1.0, 0.0), 1.0),
    ];
    records[1].row = 1;
    records[1].weights[1] = 1.0;
    let predictions = [
        [c32::new(1.0, 0.0), c32::new(2.0, 0.0), c32::default(), c32::default()],
        [c32::new(3.0, 0.0), c32::new(4.0, 0.0), c32::default(), c32::default()],
    ];
    // Data pol 0 is grid pol 1 and vice versa.
    let pol_map = PolMap::from_vec(vec![1, 0]).unwrap();

    let n = degrid_into(&records, &predictions, &pol_map, &mut vb);
    // Record 0 has no weight in grid pol 1.
    assert_eq!(n, 3);
    let model = vb.model_vis();
    assert_eq!(model[(0, 0, 0)], c32::default());
    assert_eq!(model[(0, 0, 1)], c32::new(1.0, 0.0));
    assert_eq!(model[(1, 0, 0)], c32::new(4.0, 0.0));
    assert_eq!(model[(1, 0, 1)], c32::new(3.0, 0.0));
    assert_eq!(vb.num_pols(), 2);
}

#[test]
#[serial]
fn new_resampler_uses_the_selected_device() {
    let before = RESAMPLE_DEVICE.load();
    RESAMPLE_DEVICE.store(ResampleDevice::Cpu);
    let r = new_resampler(3).unwrap();
    assert_eq!(r.device(), ResampleDevice::Cpu);
    RESAMPLE_DEVICE.store(before);

    assert!(ResampleDevice::Cpu.get_device_info().unwrap().contains("CPU"));
}

#[cfg(any(feature = "cuda", feature = "hip"))]
#[test]
#[serial]
fn gpu_matches_cpu() {
    let store = ramp_store();
    let records: Vec<_> = (0..200)
        .map(|i| {
            let x = i as f64;
            let mut r = record(
                &store,
                uvw((0.7 * x).sin() * 8.0, (1.1 * x).cos() * 8.0, (0.3 * x).sin()),
                c32::new((0.5 * x).cos() as f32, (0.2 * x).sin() as f32),
                1.0,
            );
            r.dephase = -0.02 * x;
            r.phase_gradient = [0.01, 0.03];
            r
        })
        .collect();

    let g = geometry();
    let cpu = ResamplerCpu::new(2).unwrap();
    let gpu = ResamplerGpu::new().unwrap();
    let mut acc_cpu = GridAccumulator::new(shape(1)).unwrap();
    let mut acc_gpu = GridAccumulator::new(shape(1)).unwrap();
    let stats_cpu = cpu.grid(&records, &store, &g, &mut acc_cpu).unwrap();
    let stats_gpu = gpu.grid(&records, &store, &g, &mut acc_gpu).unwrap();
    assert_eq!(stats_cpu, stats_gpu);
    assert!(stats_cpu.off_grid > 0);
    for (a, b) in acc_cpu.grid().iter().zip(acc_gpu.grid().iter()) {
        assert_c64_eq(*a, *b, 1e-9);
    }
    assert_abs_diff_eq!(
        acc_cpu.sum_weight(0, 0).unwrap(),
        acc_gpu.sum_weight(0, 0).unwrap()
    );

    let p_cpu = cpu.degrid(&records, &store, &g, &acc_cpu, None).unwrap();
    let p_gpu = gpu.degrid(&records, &store, &g, &acc_gpu, None).unwrap();
    for (a, b) in p_cpu.iter().zip(p_gpu.iter()) {
        assert_abs_diff_eq!(a[0].re, b[0].re, epsilon = 1e-4);
        assert_abs_diff_eq!(a[0].im, b[0].im, epsilon = 1e-4);
    }
}
