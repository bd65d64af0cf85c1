// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Make the CFs that a spectral window needs.
//!
//! Each CF is the Fourier transform of an image-plane screen: the product of
//! the two antennas' voltage patterns and the w-term. The screen is zero
//! padded by the oversampling factor before the FFT, so the result samples
//! the uv plane `sampling` times more finely than the grid.

mod aperture;
mod error;

pub use aperture::{Aperture, ApertureKind, ApertureTable};
pub use error::PrepareError;

use std::{collections::HashSet, sync::Arc};

use itertools::Itertools;
use log::{debug, trace, warn};
use marlu::{c32, c64};
use ndarray::prelude::*;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};

use crate::{
    cf::{BaselineClass, CFCell, CellKey, CfCache},
    constants::{
        DEFAULT_NUM_W_PLANES, DEFAULT_SAMPLING, DEFAULT_SUPPORT, TAU, VEL_C,
    },
    grid::GridGeometry,
    vis::SpectralWindow,
};

/// Settings for making CFs.
#[derive(Debug, Clone, PartialEq)]
pub struct PrepareConfig {
    /// The CF half-width \[grid pixels\].
    pub support: u32,
    /// The oversampling factor.
    pub sampling: u32,
    pub n_w_planes: usize,
    /// The largest |w| to make CFs for \[wavelengths\].
    pub w_max: f64,
    /// The parallactic angles to make CFs for \[radians\].
    pub pa_bins: Vec<f64>,
    /// If true, make CFs at every channel frequency, otherwise only at the
    /// reference frequency.
    pub wideband: bool,
}

impl Default for PrepareConfig {
    fn default() -> Self {
        PrepareConfig {
            support: DEFAULT_SUPPORT,
            sampling: DEFAULT_SAMPLING,
            n_w_planes: DEFAULT_NUM_W_PLANES,
            w_max: 0.0,
            pa_bins: vec![0.0],
            wideband: false,
        }
    }
}

impl PrepareConfig {
    /// The w value of each plane. Planes are spaced quadratically so that they
    /// are uniform in √w.
    pub fn w_planes(&self) -> Vec<f64> {
        match self.n_w_planes {
            0 | 1 => vec![0.0],
            n => (0..n)
                .map(|k| {
                    let x = k as f64 / (n - 1) as f64;
                    self.w_max.abs() * x * x
                })
                .collect(),
        }
    }
}

/// Every CF that shares a screen; only the polarisation differs.
struct ScreenJob {
    class: BaselineClass,
    pa: f64,
    w: f64,
    freq: f64,
    pols: Vec<usize>,
}

pub struct CFPreparer {
    config: PrepareConfig,
    apertures: ApertureTable,
    geometry: GridGeometry,
    pols: Vec<usize>,
    cache: Option<CfCache>,
    fft: Arc<dyn Fft<f64>>,
    produced: HashSet<CellKey>,
}

impl CFPreparer {
    pub fn new(
        config: PrepareConfig,
        apertures: ApertureTable,
        geometry: GridGeometry,
        pols: Vec<usize>,
        cache: Option<CfCache>,
    ) -> Result<CFPreparer, PrepareError> {
        // Without support, every sub-pixel offset but zero would fall off the
        // CF.
        if config.support == 0 && config.sampling > 1 {
            return Err(PrepareError::ZeroSupport {
                sampling: config.sampling,
            });
        }
        let sampling = config.sampling.max(1);
        let padded_len = (2 * config.support as usize + 1) * sampling as usize;
        let fft = FftPlanner::new().plan_fft_forward(padded_len);
        debug!(
            "CF preparer: support {}, sampling {}, {} w-planes, {} PA bins, FFT length {padded_len}",
            config.support,
            sampling,
            config.n_w_planes,
            config.pa_bins.len()
        );

        Ok(CFPreparer {
            config: PrepareConfig { sampling, ..config },
            apertures,
            geometry,
            pols,
            cache,
            fft,
            produced: HashSet::new(),
        })
    }

    pub fn config(&self) -> &PrepareConfig {
        &self.config
    }

    pub fn apertures(&self) -> &ApertureTable {
        &self.apertures
    }

    /// Make CFs for `pa` too. Returns `false` if an identical PA bin already
    /// exists.
    pub fn add_pa_bin(&mut self, pa: f64) -> bool {
        if self.config.pa_bins.iter().any(|b| b.to_bits() == pa.to_bits()) {
            false
        } else {
            self.config.pa_bins.push(pa);
            true
        }
    }

    /// Forget what has been produced, e.g. after the CF store was cleared.
    pub fn forget_produced(&mut self) {
        self.produced.clear();
    }

    pub fn num_produced(&self) -> usize {
        self.produced.len()
    }

    /// Make all CFs needed by `spw` that haven't been made before. Nothing is
    /// inserted into a store; that's up to the caller. If a cache is
    /// configured, cells are read from it where possible, and new cells are
    /// written to it.
    ///
    /// All apertures are checked before any CF is made, so on error nothing
    /// is marked as produced.
    pub fn prepare_for_spw(&mut self, spw: &SpectralWindow) -> Result<Vec<CFCell>, PrepareError> {
        let antenna_types: Vec<_> = spw.antenna_types.iter().copied().sorted().dedup().collect();
        for &t in &antenna_types {
            self.apertures.checked(t)?;
        }
        let freqs: Vec<f64> = if self.config.wideband {
            spw.chan_freqs.clone()
        } else {
            vec![spw.ref_freq]
        };
        if let Some(&freq) = freqs.iter().find(|f| **f <= 0.0 || !f.is_finite()) {
            return Err(PrepareError::BadFrequency { spw: spw.id, freq });
        }

        let classes = antenna_types
            .iter()
            .combinations_with_replacement(2)
            .map(|pair| BaselineClass::from_antenna_types(*pair[0], *pair[1]));
        let w_planes = self.config.w_planes();
        let mut seen = HashSet::new();
        let mut jobs = vec![];
        for class in classes {
            for &pa in &self.config.pa_bins {
                for &w in &w_planes {
                    for &freq in &freqs {
                        let pols: Vec<usize> = self
                            .pols
                            .iter()
                            .copied()
                            .filter(|&pol| {
                                let key = CellKey {
                                    class,
                                    pa,
                                    w,
                                    freq,
                                    pol,
                                };
                                !self.produced.contains(&key) && seen.insert(key)
                            })
                            .collect();
                        if !pols.is_empty() {
                            jobs.push(ScreenJob {
                                class,
                                pa,
                                w,
                                freq,
                                pols,
                            });
                        }
                    }
                }
            }
        }
        debug!(
            "spw {}: {} baseline classes, {} screens to make",
            spw.id,
            antenna_types.len() * (antenna_types.len() + 1) / 2,
            jobs.len()
        );

        let cells = jobs
            .into_par_iter()
            .map(|job| self.cells_for_job(job))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();
        self.produced.extend(cells.iter().map(|c| *c.key()));
        debug!("spw {}: prepared {} CFs", spw.id, cells.len());
        Ok(cells)
    }

    fn cells_for_job(&self, job: ScreenJob) -> Result<Vec<CFCell>, PrepareError> {
        let mut cells = Vec::with_capacity(job.pols.len());
        let mut to_compute = vec![];
        for &pol in &job.pols {
            let key = CellKey {
                class: job.class,
                pa: job.pa,
                w: job.w,
                freq: job.freq,
                pol,
            };
            match self.load_cached(&key) {
                Some(cell) => cells.push(cell),
                None => to_compute.push(key),
            }
        }
        if to_compute.is_empty() {
            return Ok(cells);
        }

        let pixels = self.compute_pixels(&to_compute[0])?;
        for key in to_compute {
            trace!("Computed CF for {key}");
            let cell = CFCell::new(key, pixels.clone(), self.config.sampling, self.config.support)?;
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.save(&cell) {
                    warn!("Couldn't write CF for {key} to the cache: {e}");
                }
            }
            cells.push(cell);
        }
        Ok(cells)
    }

    fn load_cached(&self, key: &CellKey) -> Option<CFCell> {
        let cache = self.cache.as_ref()?;
        match cache.load(key) {
            Ok(Some(cell))
                if cell.sampling() == self.config.sampling
                    && cell.support() == self.config.support =>
            {
                trace!("Read CF for {key} from the cache");
                Some(cell)
            }
            Ok(Some(_)) => {
                debug!("Cached CF for {key} has different support or sampling; recomputing");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Couldn't read the cached CF for {key}, recomputing: {e}");
                None
            }
        }
    }

    /// The CF pixels for `key`, ignoring its polarisation.
    fn compute_pixels(&self, key: &CellKey) -> Result<Array2<c32>, PrepareError> {
        let (type1, type2) = key.class.antenna_types();
        let a1 = self.apertures.checked(type1)?;
        let a2 = self.apertures.checked(type2)?;

        let support = self.config.support as usize;
        let sampling = self.config.sampling as usize;
        let width = 2 * support + 1;
        let padded_len = width * sampling;
        let lambda = VEL_C / key.freq;
        let [fov_l, fov_m] = self.geometry.uv_scale();
        let (dl, dm) = (fov_l / width as f64, fov_m / width as f64);

        // The screen, with its centre at index 0 of the padded buffer.
        let mut buffer = vec![c64::default(); padded_len * padded_len];
        let wrap = |d: i64| d.rem_euclid(padded_len as i64) as usize;
        for iy in 0..width {
            let y = iy as i64 - support as i64;
            let m = y as f64 * dm;
            for ix in 0..width {
                let x = ix as i64 - support as i64;
                let l = x as f64 * dl;
                let r2 = l * l + m * m;
                if r2 >= 1.0 {
                    continue;
                }
                let n_minus_1 = (1.0 - r2).sqrt() - 1.0;
                let amp = a1.voltage(l, m, lambda, key.pa) * a2.voltage(l, m, lambda, key.pa);
                buffer[wrap(y) * padded_len + wrap(x)] =
                    c64::from_polar(amp, -TAU * key.w * n_minus_1);
            }
        }

        // 2D FFT; rows, then columns via a transpose.
        for row in buffer.chunks_mut(padded_len) {
            self.fft.process(row);
        }
        let mut transposed = vec![c64::default(); buffer.len()];
        for r in 0..padded_len {
            for c in 0..padded_len {
                transposed[c * padded_len + r] = buffer[r * padded_len + c];
            }
        }
        for row in transposed.chunks_mut(padded_len) {
            self.fft.process(row);
        }
        // transposed[kx * padded_len + ky] now holds uv pixel (kx, ky).
        let uv = |qx: i64, qy: i64| transposed[wrap(qx) * padded_len + wrap(qy)];

        let half = (support * sampling) as i64;
        let mut norm = c64::default();
        for dy in -(support as i64)..=support as i64 {
            for dx in -(support as i64)..=support as i64 {
                norm += uv(dx * sampling as i64, dy * sampling as i64);
            }
        }
        if norm.norm() <= f64::EPSILON || !norm.is_finite() {
            return Err(PrepareError::Degenerate { key: *key });
        }

        let dim = 2 * half as usize + 1;
        Ok(Array2::from_shape_fn((dim, dim), |(iy, ix)| {
            let v = uv(ix as i64 - half, iy as i64 - half) / norm;
            c32::new(v.re as f32, v.im as f32)
        }))
    }
}
