// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use approx::assert_abs_diff_eq;
use marlu::{c32, UVW};
use ndarray::prelude::*;

use super::{mapper::*, *};
use crate::{
    cf::{
        AntennaType, BaselineClass, CFCell, CFIndexer, CFStore, CellKey, CfAxis, CfError,
        StoreConfig,
    },
    constants::{TAU, VEL_C},
    grid::{GridGeometry, GridShape},
};

const FREQS: [f64; 2] = [150e6, 151e6];

fn geometry() -> GridGeometry {
    GridGeometry {
        nx: 32,
        ny: 32,
        cell_size: 0.01,
    }
}

fn shape(n_pol: usize) -> GridShape {
    GridShape {
        n_pol,
        n_chan: 2,
        ny: 32,
        nx: 32,
    }
}

/// A store with identity CFs for type-0 baselines at both frequencies.
fn store(pols: &[usize]) -> CFStore {
    let mut store = CFStore::new(StoreConfig::default());
    for &freq in &FREQS {
        for &pol in pols {
            store
                .insert(
                    CFCell::identity(CellKey {
                        class: BaselineClass::Homogeneous(AntennaType(0)),
                        pa: 0.0,
                        w: 0.0,
                        freq,
                        pol,
                    }),
                    false,
                )
                .unwrap();
        }
    }
    store
}

fn buffer(num_pols: usize) -> MemVisBuffer {
    let vis = Array3::from_shape_fn((3, 2, num_pols), |(r, c, p)| {
        c32::new(r as f32, (10 * c + p) as f32)
    });
    let uvws = (0..3)
        .map(|r| UVW {
            u: r as f64,
            v: -(r as f64),
            w: 2.0,
        })
        .collect();
    MemVisBuffer::new(4, FREQS.to_vec(), vis, uvws).unwrap()
}

#[test]
fn slot_maps() {
    let m = SlotMap::from_vec(vec![1, -1, 0]).unwrap();
    assert_eq!(m.target(0), Some(1));
    assert_eq!(m.target(1), None);
    assert_eq!(m.target(2), Some(0));
    // Beyond the end of the map is dropped too.
    assert_eq!(m.target(3), None);
    assert_eq!(m.len(), 3);

    let err = SlotMap::from_vec(vec![0, -2]).unwrap_err();
    assert_eq!(err.index, 1);
    assert_eq!(err.target, -2);

    assert_eq!(SlotMap::identity(3), SlotMap::from_vec(vec![0, 1, 2]).unwrap());
    assert_eq!(SlotMap::constant(2, 0), SlotMap::from_vec(vec![0, 0]).unwrap());
}

#[test]
fn mem_buffers_check_shapes() {
    let vis = Array3::zeros((3, 2, 1));
    assert!(matches!(
        MemVisBuffer::new(0, vec![1.0], vis.clone(), vec![UVW::default(); 3]),
        Err(VisError::BadShape { .. })
    ));
    assert!(matches!(
        MemVisBuffer::new(0, vec![1.0; 2], Array3::zeros((3, 2, 5)), vec![UVW::default(); 3]),
        Err(VisError::TooManyPols(5))
    ));

    let vb = MemVisBuffer::new(0, vec![1.0; 2], vis, vec![UVW::default(); 3]).unwrap();
    assert!(vb.clone().with_weights(Array2::ones((3, 3))).is_err());
    assert!(matches!(
        vb.with_antennas(vec![0, 1, 2], vec![1, 1, 1], vec![AntennaType(0); 2]),
        Err(VisError::UnknownAntenna {
            row: 2,
            antenna: 2,
            ..
        })
    ));
}

#[test]
fn used_antenna_types_ignore_flagged_rows() {
    let vb = buffer(1)
        .with_antennas(
            vec![0, 0, 2],
            vec![1, 1, 1],
            vec![AntennaType(5), AntennaType(2), AntennaType(9)],
        )
        .unwrap()
        .with_row_flags(vec![false, false, true])
        .unwrap();
    assert_eq!(vb.used_antenna_types(), vec![AntennaType(2), AntennaType(5)]);
}

#[test]
fn every_unflagged_sample_becomes_a_record() {
    let store = store(&[0]);
    let mapper = VisToDeviceMapper::new(ImagingMode::Residual, shape(1), &geometry());
    let vb = buffer(1);
    let chan_map = ChanMap::identity(2);
    let pol_map = PolMap::identity(1);

    let mut records = mapper.map(&vb, &chan_map, &pol_map, CFIndexer::new(&store));
    let collected: Vec<VisRecord> = records.by_ref().map(|r| r.unwrap()).collect();
    assert_eq!(collected.len(), 6);
    assert_eq!(
        records.stats(),
        MapStats {
            rows: 3,
            rows_flagged: 0,
            samples_dropped: 0,
            records: 6,
        }
    );

    let r = &collected[3];
    assert_eq!((r.row, r.chan, r.spw), (1, 1, 4));
    assert_eq!(r.grid_cube, 1);
    assert_eq!(r.vis[0], c32::new(1.0, 10.0));
    assert_eq!(r.weights, [1.0, 0.0, 0.0, 0.0]);
    assert_abs_diff_eq!(r.freq, FREQS[1]);
    assert_eq!(r.cf_index.freq_bin, 1);
    assert_abs_diff_eq!(r.dephase, 0.0);
    assert_eq!(r.phase_gradient, [0.0, 0.0]);
}

#[test]
fn flags_weights_and_maps_drop_samples() {
    let store = store(&[0, 1]);
    let mapper = VisToDeviceMapper::new(ImagingMode::Residual, shape(2), &geometry());
    let mut weights = Array2::ones((3, 2));
    weights[(0, 1)] = 0.0;
    let mut flags = Array3::from_elem((3, 2, 2), false);
    // One pol of one sample, and both pols of another.
    flags[(2, 0, 1)] = true;
    flags[(2, 1, 0)] = true;
    flags[(2, 1, 1)] = true;
    let vb = buffer(2)
        .with_weights(weights)
        .unwrap()
        .with_flags(flags)
        .unwrap()
        .with_row_flags(vec![false, true, false])
        .unwrap();
    let chan_map = ChanMap::identity(2);
    let pol_map = PolMap::identity(2);

    let mut records = mapper.map(&vb, &chan_map, &pol_map, CFIndexer::new(&store));
    let collected: Vec<VisRecord> = records.by_ref().map(|r| r.unwrap()).collect();
    // (0, 0) and (2, 0) survive.
    assert_eq!(collected.len(), 2);
    assert_eq!(
        records.stats(),
        MapStats {
            rows: 3,
            rows_flagged: 1,
            samples_dropped: 2,
            records: 2,
        }
    );

    let r = &collected[1];
    assert_eq!((r.row, r.chan), (2, 0));
    assert_eq!(r.vis[0], c32::new(2.0, 0.0));
    assert_eq!(r.vis[1], c32::default());
    assert_eq!(r.weights[..2], [1.0, 0.0]);
}

#[test]
fn chan_and_pol_maps_redirect_samples() {
    let store = store(&[0, 1]);
    let mapper = VisToDeviceMapper::new(ImagingMode::Residual, shape(2), &geometry());
    let vb = buffer(2);
    // Everything into grid channel 1; swap pols.
    let chan_map = ChanMap::from_vec(vec![1, -1]).unwrap();
    let pol_map = PolMap::from_vec(vec![1, 0]).unwrap();

    let records: Vec<VisRecord> = mapper
        .map(&vb, &chan_map, &pol_map, CFIndexer::new(&store))
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(records.len(), 3);
    for r in &records {
        assert_eq!(r.chan, 0);
        assert_eq!(r.grid_cube, 1);
        assert_eq!(r.vis[1], c32::new(r.row as f32, 0.0));
        assert_eq!(r.vis[0], c32::new(r.row as f32, 1.0));
        // The CF polarisation is that of the first filled slot.
        assert_eq!(r.cf_index.pol_bin, 1);
    }

    // Channel targets beyond the grid are dropped.
    let chan_map = ChanMap::from_vec(vec![0, 2]).unwrap();
    let n = mapper
        .map(&vb, &chan_map, &pol_map, CFIndexer::new(&store))
        .count();
    assert_eq!(n, 3);
}

#[test]
fn modes_change_what_is_gridded() {
    let store = store(&[0]);
    let vb = buffer(1)
        .with_delays(vec![1.0, 2.0, 3.0])
        .unwrap()
        .with_pointing_offsets(vec![[0.01, -0.02]; 3])
        .unwrap();
    let chan_map = ChanMap::identity(2);
    let pol_map = PolMap::identity(1);
    let g = geometry();

    let residual = VisToDeviceMapper::new(ImagingMode::Residual, shape(1), &g);
    let r = residual
        .map(&vb, &chan_map, &pol_map, CFIndexer::new(&store))
        .nth(2)
        .unwrap()
        .unwrap();
    assert_eq!(r.row, 1);
    assert_abs_diff_eq!(r.dephase, -TAU * 2.0 * FREQS[0] / VEL_C);
    assert_abs_diff_eq!(r.phase_gradient[0], TAU * 0.01 / g.uv_scale()[0]);
    assert_abs_diff_eq!(r.phase_gradient[1], TAU * -0.02 / g.uv_scale()[1]);
    assert_abs_diff_eq!(r.uvw.u, 1.0);

    let psf = VisToDeviceMapper::new(ImagingMode::Psf, shape(1), &g);
    let r = psf
        .map(&vb, &chan_map, &pol_map, CFIndexer::new(&store))
        .nth(2)
        .unwrap()
        .unwrap();
    assert_eq!(r.vis[0], c32::new(1.0, 0.0));
    assert_abs_diff_eq!(r.dephase, 0.0);
    assert_abs_diff_eq!(r.uvw.u, 1.0);

    let weight = VisToDeviceMapper::new(ImagingMode::Weight, shape(1), &g);
    let r = weight
        .map(&vb, &chan_map, &pol_map, CFIndexer::new(&store))
        .nth(2)
        .unwrap()
        .unwrap();
    assert_eq!(r.vis[0], c32::new(1.0, 0.0));
    assert_abs_diff_eq!(r.uvw.u, 0.0);
    assert_abs_diff_eq!(r.uvw.v, 0.0);
    assert_abs_diff_eq!(r.uvw.w, 0.0);
}

#[test]
fn missing_cfs_are_yielded_as_errors() {
    let store = store(&[0]);
    let mapper = VisToDeviceMapper::new(ImagingMode::Residual, shape(1), &geometry());
    // Antenna type 3 has no CFs.
    let vb = buffer(1)
        .with_antennas(
            vec![0, 0, 1],
            vec![1, 1, 1],
            vec![AntennaType(0), AntennaType(3)],
        )
        .unwrap();
    let chan_map = ChanMap::identity(2);
    let pol_map = PolMap::identity(1);

    let results: Vec<_> = mapper
        .map(&vb, &chan_map, &pol_map, CFIndexer::new(&store))
        .collect();
    assert_eq!(results.len(), 6);
    for r in results {
        match r {
            Err(CfError::Missing { axis, .. }) => assert_eq!(axis, CfAxis::BaselineClass),
            r => panic!("unexpected result {r:?}"),
        }
    }
}

#[test]
fn imaging_modes_parse() {
    use std::str::FromStr;

    assert_eq!(ImagingMode::from_str("psf").unwrap(), ImagingMode::Psf);
    assert_eq!(ImagingMode::Weight.to_string(), "weight");
    assert_eq!(ImagingMode::default(), ImagingMode::Residual);
}
