// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use approx::assert_abs_diff_eq;
use hypergrid::{
    config::FluxScaleConfig, vis::ImagingMode, GridderConfig, ImagingSession, VisBuffer,
};
use ndarray::s;
use serial_test::serial;

use crate::*;

fn config() -> GridderConfig {
    let (_dir, path) = write_config(CONFIG, "config.toml");
    GridderConfig::from_file(path).unwrap()
}

#[test]
#[serial]
fn cfs_are_shared_between_windows() {
    let spws = [spw(0), spw(1), spw(2)];
    let buffers = [buffer(0, 20), buffer(1, 20), buffer(2, 20)];
    let mut session = ImagingSession::new(config()).unwrap();
    let report = session
        .run_major_cycle(&spws, &buffers, ImagingMode::Residual)
        .unwrap();

    assert_eq!(report.spws, vec![0, 1, 2]);
    assert!(report.skipped_spws.is_empty());
    // Every window has the same reference frequency, antennas and PA.
    assert_eq!(report.cfs_made, 1);
    assert_eq!(session.store().len(), 1);
    assert_eq!(report.map_stats.records, 3 * 20 * FREQS.len());
    assert_eq!(report.grid_stats.gridded, 3 * 20 * FREQS.len());
    assert_eq!(report.grid_stats.off_grid, 0);
    for chan in 0..FREQS.len() {
        assert_abs_diff_eq!(session.accumulator().sum_weight(0, chan).unwrap(), 60.0);
    }
}

#[test]
#[serial]
fn weight_grids_sum_to_the_weights() {
    let spws = [spw(0)];
    let mut session = ImagingSession::new(config()).unwrap();
    session
        .run_major_cycle(&spws, &[buffer(0, 15)], ImagingMode::Weight)
        .unwrap();

    // Everything lands on the uv origin with no sub-pixel offset, where the
    // CF taps sum to one.
    let grid = session.accumulator().grid();
    for chan in 0..FREQS.len() {
        let sum = grid.slice(s![0, chan, .., ..]).sum();
        assert_abs_diff_eq!(sum.re, 15.0, epsilon = 1e-4);
        assert_abs_diff_eq!(sum.im, 0.0, epsilon = 1e-4);
    }
}

#[test]
#[serial]
fn thread_counts_dont_change_the_grid() {
    let spws = [spw(0)];
    let buffers = [buffer(0, 50)];
    let mut grids = vec![];
    for num_threads in [1, 3] {
        let mut c = config();
        c.resample.num_threads = Some(num_threads);
        let mut session = ImagingSession::new(c).unwrap();
        session
            .run_major_cycle(&spws, &buffers, ImagingMode::Residual)
            .unwrap();
        grids.push(session.accumulator().grid().to_owned());
    }
    for (a, b) in grids[0].iter().zip(grids[1].iter()) {
        assert_abs_diff_eq!((a - b).norm(), 0.0, epsilon = 1e-9);
    }
}

#[test]
#[serial]
fn predictions_follow_the_flux_scale() {
    let spws = [spw(0)];
    let vb = buffer(0, 12);
    let mut models = vec![];
    for scale in [1.0, 2.0] {
        let mut c = config();
        c.flux_scale = Some(FluxScaleConfig {
            interp: Default::default(),
            entries: vec![(FREQS[0], scale)],
        });
        let mut session = ImagingSession::new(c).unwrap();
        session
            .run_major_cycle(&spws, &[vb.clone()], ImagingMode::Residual)
            .unwrap();
        let mut buffers = [vb.clone()];
        let report = session.predict_major_cycle(&spws, &mut buffers).unwrap();
        assert_eq!(report.predicted, 12 * FREQS.len());
        let [vb] = buffers;
        models.push(vb.model_vis().to_owned());
    }

    assert!(models[0].iter().any(|v| v.norm() > 0.0));
    for (one, two) in models[0].iter().zip(models[1].iter()) {
        assert!(one.re.is_finite() && one.im.is_finite());
        assert_abs_diff_eq!(two.re, 2.0 * one.re, epsilon = 1e-4);
        assert_abs_diff_eq!(two.im, 2.0 * one.im, epsilon = 1e-4);
    }
}

#[test]
#[serial]
fn flagged_rows_are_ignored() {
    let spws = [spw(0)];
    let mut flags = vec![false; 10];
    flags[3] = true;
    flags[7] = true;
    let vb = buffer(0, 10).with_row_flags(flags).unwrap();
    assert_eq!(vb.num_rows(), 10);

    let mut session = ImagingSession::new(config()).unwrap();
    let report = session
        .run_major_cycle(&spws, &[vb], ImagingMode::Residual)
        .unwrap();
    assert_eq!(report.map_stats.rows, 10);
    assert_eq!(report.map_stats.rows_flagged, 2);
    assert_eq!(report.grid_stats.gridded, 8 * FREQS.len());
}
