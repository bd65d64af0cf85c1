// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Integration tests.
//!
//! Some help for laying out these tests was taken from:
//! https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html

mod config_files;
mod major_cycles;

use std::path::PathBuf;

use hypergrid::{c32, AntennaType, MemVisBuffer, SpectralWindow, UVW};
use ndarray::prelude::*;
use tempfile::TempDir;

/// \[Hz\]
const FREQS: [f64; 3] = [150e6, 151e6, 152e6];

/// A config with real (oversampled) CFs for a 64x64 grid of 1 arcmin pixels.
const CONFIG: &str = r#"
[grid]
nx = 64
ny = 64
cell_size_arcsec = 60.0
n_chan = 3

[cf]
support = 3
sampling = 4

[[apertures]]
antenna_type = 0
diameter_m = 12.0

[resample]
cpu = true
num_threads = 2
"#;

fn write_config(contents: &str, name: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    (dir, path)
}

/// A buffer with short baselines spread around the uv plane, all with unit
/// weight.
fn buffer(spw: usize, num_rows: usize) -> MemVisBuffer {
    let uvws = (0..num_rows)
        .map(|i| {
            let angle = i as f64 * 0.7;
            let r = 2.0 + (i % 7) as f64 * 1.5;
            UVW {
                u: r * angle.cos(),
                v: r * angle.sin(),
                w: (i % 3) as f64 - 1.0,
            }
        })
        .collect();
    let vis = Array3::from_shape_fn((num_rows, FREQS.len(), 1), |(row, chan, _)| {
        c32::new(1.0 + row as f32 * 0.01, chan as f32 * 0.1)
    });
    MemVisBuffer::new(spw, FREQS.to_vec(), vis, uvws).unwrap()
}

fn spw(id: usize) -> SpectralWindow {
    SpectralWindow {
        id,
        chan_freqs: FREQS.to_vec(),
        ref_freq: FREQS[1],
        antenna_types: vec![AntennaType(0)],
    }
}
